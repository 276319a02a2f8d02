use std::fmt;
use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::types::*;
use crate::controller::host_events::HostEvent;
use crate::error_handling::types::{ConfigError, ReplayError};
use crate::event_buffer::worker::WorkerFactory;
use crate::network::types::{NetworkHint, NetworkRequestRecord};
use crate::recording::types::RecordingEvent;

/// Replays shorter than this are never sent, whatever the configuration says.
pub const MIN_REPLAY_DURATION_LIMIT_MS: u64 = 15_000;

pub type ErrorHook = Arc<dyn Fn(&ReplayError) + Send + Sync>;
pub type ErrorSamplingHook = Arc<dyn Fn(&HostEvent) -> bool + Send + Sync>;
pub type RecordingEventHook = Arc<dyn Fn(RecordingEvent) -> Option<RecordingEvent> + Send + Sync>;
pub type NetworkEnricherHook = Arc<dyn Fn(&mut NetworkRequestRecord, &NetworkHint) + Send + Sync>;
pub type DroppedSegmentHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Callbacks the host can plug into the controller.
#[derive(Clone, Default)]
pub struct ReplayHooks {
    /// Receives every internal failure after it has been logged.
    pub on_error: Option<ErrorHook>,
    /// Decides whether an error seen in buffer mode promotes the replay.
    pub before_error_sampling: Option<ErrorSamplingHook>,
    /// May rewrite or drop custom recording events before buffering.
    pub before_add_recording_event: Option<RecordingEventHook>,
    /// Enriches captured network request data before it is recorded.
    pub network_enricher: Option<NetworkEnricherHook>,
    /// Told why a finished segment was dropped instead of delivered.
    pub on_dropped_segment: Option<DroppedSegmentHook>,
    /// Overrides the compression worker implementation.
    pub worker_factory: Option<Arc<dyn WorkerFactory>>,
}

impl fmt::Debug for ReplayHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayHooks")
            .field("on_error", &self.on_error.is_some())
            .field("before_error_sampling", &self.before_error_sampling.is_some())
            .field(
                "before_add_recording_event",
                &self.before_add_recording_event.is_some(),
            )
            .field("network_enricher", &self.network_enricher.is_some())
            .field("on_dropped_segment", &self.on_dropped_segment.is_some())
            .field("worker_factory", &self.worker_factory.is_some())
            .finish()
    }
}

/// Complete option set of a replay controller.
///
/// Every field has a default, so a TOML file only needs to name what it
/// changes:
///
/// ```toml
/// session_sample_rate = 0.1
/// error_sample_rate = 1.0
///
/// [network]
/// allow_urls = ["api.example.com", "/\\/graphql$/"]
/// request_headers = ["x-request-id"]
///
/// [privacy]
/// mask = [".credit-card"]
/// ```
///
/// Callback hooks cannot come from a file and are set on [`ReplayOptions::hooks`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayOptions {
    pub session_sample_rate: f64,
    pub error_sample_rate: f64,

    pub flush_min_delay_ms: u64,
    pub flush_max_delay_ms: u64,
    pub min_replay_duration_ms: u64,
    pub max_replay_duration_ms: u64,

    pub session_idle_pause_ms: u64,
    pub session_idle_expire_ms: u64,
    pub buffer_checkout_ms: u64,
    pub sticky_session: bool,

    pub use_compression: bool,
    pub max_buffer_size_bytes: usize,

    pub mutation_breadcrumb_limit: usize,
    pub mutation_limit: usize,
    pub console_arg_max_size: usize,

    pub retry_base_interval_ms: u64,
    pub max_retries: u32,

    pub slow_click: SlowClickOptions,
    pub network: NetworkDetailOptions,
    pub privacy: PrivacyOptions,

    #[serde(skip)]
    pub hooks: ReplayHooks,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            session_sample_rate: 0.0,
            error_sample_rate: 0.0,
            flush_min_delay_ms: 5_000,
            flush_max_delay_ms: 5_500,
            min_replay_duration_ms: 4_999,
            max_replay_duration_ms: 60 * 60 * 1000,
            session_idle_pause_ms: 5 * 60 * 1000,
            session_idle_expire_ms: 15 * 60 * 1000,
            buffer_checkout_ms: 60_000,
            sticky_session: true,
            use_compression: true,
            max_buffer_size_bytes: 20_000_000,
            mutation_breadcrumb_limit: 750,
            mutation_limit: 10_000,
            console_arg_max_size: 5_000,
            retry_base_interval_ms: 5_000,
            max_retries: 3,
            slow_click: SlowClickOptions::default(),
            network: NetworkDetailOptions::default(),
            privacy: PrivacyOptions::default(),
            hooks: ReplayHooks::default(),
        }
    }
}

impl ReplayOptions {
    /// Loads and validates options from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        debug!("Loaded configuration file {}", path.display());
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let options: ReplayOptions =
            toml::from_str(content).map_err(|e| ConfigError::TomlError(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, rate) in [
            ("session_sample_rate", self.session_sample_rate),
            ("error_sample_rate", self.error_sample_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigError::NotInRange(format!(
                    "{} must be within [0, 1], got {}",
                    name, rate
                )));
            }
        }
        if self.flush_min_delay_ms > self.flush_max_delay_ms {
            return Err(ConfigError::NotInRange(format!(
                "flush_min_delay_ms ({}) is greater than flush_max_delay_ms ({})",
                self.flush_min_delay_ms, self.flush_max_delay_ms
            )));
        }
        if self.max_replay_duration_ms == 0 {
            return Err(ConfigError::NotInRange(
                "max_replay_duration_ms must be positive".to_string(),
            ));
        }
        for (name, duration) in [
            ("max_replay_duration_ms", self.max_replay_duration_ms),
            ("session_idle_pause_ms", self.session_idle_pause_ms),
            ("session_idle_expire_ms", self.session_idle_expire_ms),
        ] {
            if i64::try_from(duration).is_err() {
                return Err(ConfigError::NotInRange(format!(
                    "{} ({}) is too large",
                    name, duration
                )));
            }
        }
        if self.mutation_limit > 0 && self.mutation_breadcrumb_limit > self.mutation_limit {
            warn!(
                "mutation_breadcrumb_limit ({}) exceeds mutation_limit ({}), mutation breadcrumbs will only be emitted at the hard limit",
                self.mutation_breadcrumb_limit, self.mutation_limit
            );
        }
        Ok(())
    }

    /// Minimum replay duration, capped at [`MIN_REPLAY_DURATION_LIMIT_MS`].
    pub fn effective_min_replay_duration_ms(&self) -> u64 {
        self.min_replay_duration_ms.min(MIN_REPLAY_DURATION_LIMIT_MS)
    }

    /// True when neither sample rate can start a recording on its own.
    pub fn requires_manual_start(&self) -> bool {
        self.error_sample_rate <= 0.0 && self.session_sample_rate <= 0.0
    }
}
