use std::sync::Arc;

use log::{debug, info, warn};
use rand::Rng;

use crate::context::Clock;
use crate::storage::storage_trait::SessionStorage;

use super::session::{should_refresh_session, Sampled, Session};

/// Storage key of the sticky session record.
pub const REPLAY_SESSION_KEY: &str = "replaySession";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionTimeouts {
    pub idle_expire_ms: u64,
    pub max_duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingOptions {
    pub session_sample_rate: f64,
    /// Unsampled sessions fall back to buffer mode instead of being off.
    pub allow_buffering: bool,
}

/// Draws once against `rate`. 0 never samples, 1 always does.
pub fn is_sampled(rate: f64) -> bool {
    if rate <= 0.0 {
        return false;
    }
    if rate >= 1.0 {
        return true;
    }
    rand::thread_rng().gen::<f64>() < rate
}

pub fn get_session_sample_type(sampling: &SamplingOptions) -> Sampled {
    if is_sampled(sampling.session_sample_rate) {
        Sampled::Session
    } else if sampling.allow_buffering {
        Sampled::Buffer
    } else {
        Sampled::Off
    }
}

/// Creates, loads, saves and clears the replay session.
///
/// Storage failures are logged and swallowed: an unavailable or corrupt
/// sticky record behaves exactly like an absent one.
#[derive(Clone)]
pub struct SessionStore {
    storage: Arc<dyn SessionStorage>,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn SessionStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Creates a new session, persisting it when `sticky` is set.
    pub fn create(
        &self,
        sampling: &SamplingOptions,
        previous_session_id: Option<String>,
        sticky: bool,
    ) -> Session {
        let sampled = get_session_sample_type(sampling);
        let session = Session::new(sampled, self.clock.now_ms(), previous_session_id);
        info!(
            "[{}] Created new session (sampled: {:?})",
            session.id, session.sampled
        );
        if sticky {
            self.save(&session);
        }
        session
    }

    /// Reads the sticky session, if one is stored and readable.
    pub fn fetch(&self) -> Option<Session> {
        if !self.storage.is_available() {
            return None;
        }
        let raw = match self.storage.get_item(REPLAY_SESSION_KEY) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("Unable to read sticky session: {}", e);
                return None;
            }
        };
        match serde_json::from_str::<Session>(&raw) {
            Ok(session) => {
                debug!("[{}] Loaded sticky session", session.id);
                Some(session)
            }
            Err(e) => {
                warn!("Discarding unreadable sticky session: {}", e);
                None
            }
        }
    }

    /// Reuses the sticky session unless it needs refreshing, in which case
    /// a new one is created carrying the old id.
    pub fn load_or_create(
        &self,
        sticky: bool,
        timeouts: SessionTimeouts,
        sampling: &SamplingOptions,
        previous_session_id: Option<String>,
    ) -> Session {
        let existing = if sticky { self.fetch() } else { None };
        let Some(existing) = existing else {
            return self.create(sampling, previous_session_id, sticky);
        };

        if !should_refresh_session(
            &existing,
            timeouts.max_duration_ms,
            timeouts.idle_expire_ms,
            self.clock.now_ms(),
        ) {
            return existing;
        }

        debug!("[{}] Session in sticky storage is expired", existing.id);
        self.create(sampling, Some(existing.id), sticky)
    }

    pub fn save(&self, session: &Session) {
        if !self.storage.is_available() {
            return;
        }
        let value = match serde_json::to_string(session) {
            Ok(value) => value,
            Err(e) => {
                warn!("[{}] Unable to serialize session: {}", session.id, e);
                return;
            }
        };
        if let Err(e) = self.storage.set_item(REPLAY_SESSION_KEY, &value) {
            warn!("[{}] Unable to persist session: {}", session.id, e);
        }
    }

    pub fn clear(&self) {
        if !self.storage.is_available() {
            return;
        }
        if let Err(e) = self.storage.remove_item(REPLAY_SESSION_KEY) {
            warn!("Unable to clear sticky session: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TokioClock;
    use crate::storage::memory_storage::MemorySessionStorage;

    const TIMEOUTS: SessionTimeouts = SessionTimeouts {
        idle_expire_ms: 15 * 60 * 1000,
        max_duration_ms: 60 * 60 * 1000,
    };

    const ALWAYS: SamplingOptions = SamplingOptions {
        session_sample_rate: 1.0,
        allow_buffering: false,
    };

    fn store_at(now: i64, storage: Arc<dyn SessionStorage>) -> SessionStore {
        SessionStore::new(storage, Arc::new(TokioClock::starting_at(now)))
    }

    #[test]
    fn sampling_falls_back_to_buffer() {
        let none = SamplingOptions {
            session_sample_rate: 0.0,
            allow_buffering: true,
        };
        assert_eq!(get_session_sample_type(&none), Sampled::Buffer);
        assert_eq!(get_session_sample_type(&ALWAYS), Sampled::Session);
        let off = SamplingOptions {
            session_sample_rate: 0.0,
            allow_buffering: false,
        };
        assert_eq!(get_session_sample_type(&off), Sampled::Off);
    }

    #[test]
    fn sticky_session_is_reused() {
        let storage: Arc<dyn SessionStorage> = Arc::new(MemorySessionStorage::new());
        let first = store_at(1_000, storage.clone()).load_or_create(true, TIMEOUTS, &ALWAYS, None);
        let again = store_at(2_000, storage).load_or_create(true, TIMEOUTS, &ALWAYS, None);
        assert_eq!(first, again);
    }

    #[test]
    fn non_sticky_load_always_creates() {
        let storage: Arc<dyn SessionStorage> = Arc::new(MemorySessionStorage::new());
        let store = store_at(1_000, storage.clone());
        let first = store.load_or_create(false, TIMEOUTS, &ALWAYS, None);
        let second = store.load_or_create(false, TIMEOUTS, &ALWAYS, None);
        assert_ne!(first.id, second.id);
        assert_eq!(storage.get_item(REPLAY_SESSION_KEY).unwrap(), None);
    }

    #[test]
    fn expired_sticky_session_is_replaced_with_link() {
        let storage: Arc<dyn SessionStorage> = Arc::new(MemorySessionStorage::new());
        let old = store_at(0, storage.clone()).create(&ALWAYS, None, true);

        let later = 16 * 60 * 1000;
        let fresh = store_at(later, storage.clone()).load_or_create(true, TIMEOUTS, &ALWAYS, None);
        assert_ne!(fresh.id, old.id);
        assert_eq!(fresh.previous_session_id.as_deref(), Some(old.id.as_str()));
        assert_eq!(fresh.started, later);
        assert_eq!(store_at(later, storage).fetch(), Some(fresh));
    }

    #[test]
    fn corrupt_record_is_treated_as_absent() {
        let storage: Arc<dyn SessionStorage> = Arc::new(MemorySessionStorage::new());
        storage.set_item(REPLAY_SESSION_KEY, "{not json").unwrap();
        let store = store_at(5, storage);
        assert_eq!(store.fetch(), None);
        let session = store.load_or_create(true, TIMEOUTS, &ALWAYS, None);
        assert_eq!(session.started, 5);
    }

    #[test]
    fn unavailable_storage_never_fails() {
        let store = store_at(5, Arc::new(MemorySessionStorage::disabled()));
        let session = store.load_or_create(true, TIMEOUTS, &ALWAYS, None);
        store.save(&session);
        store.clear();
        assert_eq!(store.fetch(), None);
    }
}
