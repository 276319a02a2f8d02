use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Sampling decision taken once when a session is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampled {
    /// Every segment is sent.
    Session,
    /// Recorded into a ring buffer, sent only if an error occurs.
    Buffer,
    /// Not recorded.
    Off,
}

impl Sampled {
    pub fn is_sampled(&self) -> bool {
        !matches!(self, Sampled::Off)
    }
}

// Persisted as "session" | "buffer" | false.
impl Serialize for Sampled {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Sampled::Session => serializer.serialize_str("session"),
            Sampled::Buffer => serializer.serialize_str("buffer"),
            Sampled::Off => serializer.serialize_bool(false),
        }
    }
}

impl<'de> Deserialize<'de> for Sampled {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Mode(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Flag(false) => Ok(Sampled::Off),
            Raw::Flag(true) => Ok(Sampled::Session),
            Raw::Mode(mode) => match mode.as_str() {
                "session" => Ok(Sampled::Session),
                "buffer" => Ok(Sampled::Buffer),
                other => Err(serde::de::Error::custom(format!(
                    "unknown sampling mode {}",
                    other
                ))),
            },
        }
    }
}

/// A replay session. Timestamps are milliseconds since the epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub started: i64,
    pub last_activity: i64,
    pub segment_id: u32,
    pub sampled: Sampled,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_session_id: Option<String>,
}

impl Session {
    pub fn new(sampled: Sampled, now: i64, previous_session_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            started: now,
            last_activity: now,
            segment_id: 0,
            sampled,
            previous_session_id,
        }
    }
}

/// True if `now` is more than `expiry_ms` past `initial`. A zero expiry never expires.
pub fn is_expired(initial: i64, expiry_ms: u64, now: i64) -> bool {
    if expiry_ms == 0 {
        return false;
    }
    now.saturating_sub(initial) > i64::try_from(expiry_ms).unwrap_or(i64::MAX)
}

/// A session expires when it is too old or has been idle too long.
pub fn is_session_expired(
    session: &Session,
    max_duration_ms: u64,
    idle_expire_ms: u64,
    now: i64,
) -> bool {
    is_expired(session.started, max_duration_ms, now)
        || is_expired(session.last_activity, idle_expire_ms, now)
}

/// Expired sessions are replaced, except a buffer session that has never
/// flushed: its buffered data would be lost.
pub fn should_refresh_session(
    session: &Session,
    max_duration_ms: u64,
    idle_expire_ms: u64,
    now: i64,
) -> bool {
    if !is_session_expired(session, max_duration_ms, idle_expire_ms, now) {
        return false;
    }
    !(session.sampled == Sampled::Buffer && session.segment_id == 0)
}
