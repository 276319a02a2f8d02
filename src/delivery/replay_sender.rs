use std::sync::Arc;

use chrono::{SecondsFormat, TimeZone, Utc};
use log::{debug, info, warn};

use crate::context::Clock;
use crate::error_handling::types::SendError;
use crate::event_buffer::ReplayPayload;
use crate::recording::types::ms_to_secs;

use super::envelope::{create_replay_envelope, prepare_recording_data, ReplayEvent, SdkInfo};
use super::rate_limits::{RateLimiter, REPLAY_CATEGORY};
use super::retry::RetryConfig;
use super::transport::{Transport, TransportResponse};

/// One finished segment and the metadata describing it.
#[derive(Debug, Clone, PartialEq)]
pub struct SendReplayData {
    pub recording_data: ReplayPayload,
    pub replay_id: String,
    pub segment_id: u32,
    /// Milliseconds since the epoch.
    pub initial_timestamp: i64,
    pub timestamp: i64,
    pub error_ids: Vec<String>,
    pub trace_ids: Vec<String>,
    pub urls: Vec<String>,
    pub replay_type: String,
}

/// Sends segments, applying rate limits and retrying transient failures.
pub struct ReplaySender {
    transport: Arc<dyn Transport>,
    rate_limits: RateLimiter,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
    sdk: SdkInfo,
}

impl ReplaySender {
    pub fn new(
        transport: Arc<dyn Transport>,
        rate_limits: RateLimiter,
        clock: Arc<dyn Clock>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            transport,
            rate_limits,
            clock,
            retry,
            sdk: SdkInfo::default(),
        }
    }

    fn replay_event(&self, data: &SendReplayData) -> ReplayEvent {
        ReplayEvent {
            kind: "replay_event".to_string(),
            event_id: data.replay_id.clone(),
            replay_id: data.replay_id.clone(),
            segment_id: data.segment_id,
            replay_start_timestamp: ms_to_secs(data.initial_timestamp),
            timestamp: ms_to_secs(data.timestamp),
            error_ids: data.error_ids.clone(),
            trace_ids: data.trace_ids.clone(),
            urls: data.urls.clone(),
            replay_type: data.replay_type.clone(),
            sdk: Some(self.sdk.clone()),
        }
    }

    fn rate_limited(&self, now: i64) -> Option<SendError> {
        if self.rate_limits.is_rate_limited(REPLAY_CATEGORY, now) {
            return Some(SendError::RateLimited {
                disabled_until: self.rate_limits.disabled_until(REPLAY_CATEGORY),
            });
        }
        None
    }

    /// A single send attempt.
    ///
    /// Rate limits are checked before sending and updated from the
    /// response before its status is judged.
    pub async fn send_replay_request(
        &self,
        data: &SendReplayData,
    ) -> Result<TransportResponse, SendError> {
        let now = self.clock.now_ms();
        if let Some(limited) = self.rate_limited(now) {
            return Err(limited);
        }

        let sent_at = Utc
            .timestamp_millis_opt(now)
            .single()
            .unwrap_or_else(Utc::now)
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let envelope = create_replay_envelope(
            &self.replay_event(data),
            prepare_recording_data(data.segment_id, &data.recording_data),
            sent_at,
        )?;

        let response = self.transport.send(&envelope).await?;
        let now = self.clock.now_ms();
        self.rate_limits.update_from_response(&response, now);

        if response.status_code == Some(429) {
            return Err(SendError::RateLimited {
                disabled_until: self.rate_limits.disabled_until(REPLAY_CATEGORY),
            });
        }
        if let Some(limited) = self.rate_limited(now) {
            return Err(limited);
        }
        if !response.is_success() {
            return Err(SendError::TransportStatus(response.status_code.unwrap_or(0)));
        }
        debug!(
            "[{}] Sent segment {} ({} bytes)",
            data.replay_id,
            data.segment_id,
            data.recording_data.len()
        );
        Ok(response)
    }

    /// Sends a segment, retrying transient failures with a growing delay.
    ///
    /// Status and rate-limit errors are returned immediately. After the last
    /// retry fails, [`SendError::MaxRetriesExceeded`] is returned.
    pub async fn send_replay(&self, data: &SendReplayData) -> Result<TransportResponse, SendError> {
        let mut retries = 0u32;
        loop {
            match self.send_replay_request(data).await {
                Ok(response) => return Ok(response),
                Err(SendError::Transport(source)) => {
                    if retries >= self.retry.max_retries {
                        warn!(
                            "[{}] Giving up on segment {} after {} attempt(s)",
                            data.replay_id,
                            data.segment_id,
                            retries + 1
                        );
                        return Err(SendError::MaxRetriesExceeded {
                            attempts: retries + 1,
                            source,
                        });
                    }
                    retries += 1;
                    let delay = self.retry.delay_for_retry(retries);
                    info!(
                        "[{}] Sending segment {} failed ({}), retry {} in {:?}",
                        data.replay_id, data.segment_id, source, retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TokioClock;
    use crate::delivery::envelope::Envelope;
    use crate::error_handling::types::TransportError;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Replays scripted outcomes and records when each send happened.
    struct ScriptedTransport {
        outcomes: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedTransport {
        fn new(outcomes: Vec<Result<TransportResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, _envelope: &Envelope) -> Result<TransportResponse, TransportError> {
            self.calls.lock().unwrap().push(Instant::now());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(TransportResponse::ok()))
        }
    }

    fn offline() -> Result<TransportResponse, TransportError> {
        Err(TransportError::Network("offline".into()))
    }

    fn status(code: u16, headers: &[(&str, &str)]) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse::new(
            Some(code),
            headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        ))
    }

    fn sender(transport: Arc<ScriptedTransport>, limits: RateLimiter) -> ReplaySender {
        ReplaySender::new(
            transport,
            limits,
            Arc::new(TokioClock::starting_at(1_700_000_000_000)),
            RetryConfig::default(),
        )
    }

    fn data() -> SendReplayData {
        SendReplayData {
            recording_data: ReplayPayload::Json("[]".into()),
            replay_id: "r1".into(),
            segment_id: 0,
            initial_timestamp: 1_700_000_000_000,
            timestamp: 1_700_000_005_000,
            error_ids: vec![],
            trace_ids: vec![],
            urls: vec![],
            replay_type: "session".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_with_growing_waits_then_give_up() {
        let transport = ScriptedTransport::new(vec![offline(), offline(), offline(), offline()]);
        let sender = sender(transport.clone(), RateLimiter::new());

        let err = sender.send_replay(&data()).await.unwrap_err();
        assert!(matches!(err, SendError::MaxRetriesExceeded { attempts: 4, .. }));

        let calls = transport.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 4);
        let waits: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            waits,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(30)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_a_transient_failure() {
        let transport = ScriptedTransport::new(vec![offline(), status(200, &[])]);
        let sender = sender(transport.clone(), RateLimiter::new());
        assert!(sender.send_replay(&data()).await.is_ok());
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn non_2xx_status_is_not_retried() {
        let transport = ScriptedTransport::new(vec![status(500, &[])]);
        let sender = sender(transport.clone(), RateLimiter::new());
        let err = sender.send_replay(&data()).await.unwrap_err();
        assert!(matches!(err, SendError::TransportStatus(500)));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_response_blocks_the_next_send() {
        let limits = RateLimiter::new();
        let transport = ScriptedTransport::new(vec![status(
            429,
            &[("x-sentry-rate-limits", "120:replay:organization")],
        )]);
        let sender = sender(transport.clone(), limits.clone());

        let err = sender.send_replay(&data()).await.unwrap_err();
        assert!(matches!(err, SendError::RateLimited { .. }));
        assert_eq!(err.drop_reason(), "ratelimit_backoff");

        let err = sender.send_replay(&data()).await.unwrap_err();
        assert!(matches!(err, SendError::RateLimited { .. }));
        assert_eq!(transport.call_count(), 1);
        assert!(limits.is_rate_limited("replay", 1_700_000_100_000));
    }

    #[tokio::test(start_paused = true)]
    async fn successful_response_can_still_carry_a_replay_limit() {
        let transport = ScriptedTransport::new(vec![status(
            200,
            &[("x-sentry-rate-limits", "30:replay:organization")],
        )]);
        let sender = sender(transport, RateLimiter::new());
        assert!(matches!(
            sender.send_replay_request(&data()).await,
            Err(SendError::RateLimited { .. })
        ));
    }
}
