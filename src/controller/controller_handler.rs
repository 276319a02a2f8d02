use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::click_detection::{ClickDetector, ClickTarget};
use crate::configuration::ReplayOptions;
use crate::context::ReplayContext;
use crate::delivery::retry::RetryConfig;
use crate::delivery::{ReplaySender, SendReplayData};
use crate::error_handling::types::{ConfigError, ReplayError, SendError};
use crate::event_buffer::{create_event_buffer, BufferKind, BufferOptions, EventBuffer};
use crate::network::{NetworkCapture, NetworkHint};
use crate::recording::recorder::{RecordOptions, RecorderHandle, RecordingSink};
use crate::recording::types::{
    ms_to_secs, Breadcrumb, EventType, RecordingEvent, ReplayPerformanceEntry, SOURCE_SCROLL,
};
use crate::session_management::session::{is_expired, is_session_expired, should_refresh_session};
use crate::session_management::session_store::is_sampled;
use crate::session_management::{Sampled, SamplingOptions, Session, SessionStore, SessionTimeouts};

use super::breadcrumbs::{create_breadcrumb, normalize_breadcrumb, Throttle, ThrottleOutcome};
use super::event_context::EventContext;
use super::flush_scheduler::{BoxFuture, Debouncer, FlushCallback, FlushLock};
use super::host_events::{HostEvent, REPLAY_ID_TAG, UNABLE_TO_SEND_REPLAY};

const CLICK_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Slack over the max duration before a flush is refused outright.
const FLUSH_DURATION_SLACK_MS: i64 = 5_000;

/// Slack over the max duration before a finished segment counts as stale.
const SEGMENT_DURATION_SLACK_MS: i64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingMode {
    /// Segments are flushed continuously.
    Session,
    /// Events stay local until an error promotes the replay.
    Buffer,
}

impl RecordingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingMode::Session => "session",
            RecordingMode::Buffer => "buffer",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StopOptions {
    /// Flush whatever is buffered before tearing down.
    pub force_flush: bool,
    pub reason: Option<String>,
}

impl StopOptions {
    pub fn with_reason(reason: &str) -> Self {
        Self {
            force_flush: false,
            reason: Some(reason.to_string()),
        }
    }
}

enum IntakeMessage {
    Event {
        event: RecordingEvent,
        is_checkout: bool,
    },
    Mutations {
        count: usize,
        over_limit: bool,
    },
}

/// Recorder-facing end of the intake channel.
struct ControllerSink {
    tx: mpsc::UnboundedSender<IntakeMessage>,
    mutation_breadcrumb_limit: usize,
    mutation_limit: usize,
}

impl RecordingSink for ControllerSink {
    fn on_event(&self, event: RecordingEvent, is_checkout: bool) {
        if self
            .tx
            .send(IntakeMessage::Event { event, is_checkout })
            .is_err()
        {
            trace!("Recording intake is closed, dropping event");
        }
    }

    fn on_mutation(&self, count: usize) -> bool {
        let over_limit = self.mutation_limit > 0 && count > self.mutation_limit;
        if count > self.mutation_breadcrumb_limit || over_limit {
            let _ = self.tx.send(IntakeMessage::Mutations { count, over_limit });
        }
        !over_limit
    }
}

/// Mutable controller state, guarded by a single async mutex.
///
/// # Fields Overview
///
/// - `enabled` / `paused`: lifecycle flags. A paused controller keeps its
///   session and buffer but has no running recorder.
/// - `buffer`: current segment's events, `None` before the first start
///   and after a stop.
/// - `recorder` / `intake`: the running recorder and the task draining its
///   channel. Both are torn down together.
/// - `context`: metadata of the segment being built.
/// - `last_activity`: last user interaction, drives the idle pause.
struct ControllerState {
    enabled: bool,
    paused: bool,
    requires_manual_start: bool,
    mode: RecordingMode,
    session: Option<Session>,
    buffer: Option<Box<dyn EventBuffer>>,
    recorder: Option<RecorderHandle>,
    intake: Option<JoinHandle<()>>,
    click_detector: Option<ClickDetector>,
    click_timer: Option<JoinHandle<()>>,
    context: EventContext,
    last_activity: i64,
    current_url: Option<String>,
    throttle: Throttle,
    performance_entries: Vec<ReplayPerformanceEntry>,
}

struct Inner {
    this: Weak<Inner>,
    options: ReplayOptions,
    context: ReplayContext,
    store: SessionStore,
    sender: ReplaySender,
    network: NetworkCapture,
    debouncer: Debouncer,
    flush_lock: FlushLock,
    state: Mutex<ControllerState>,
}

/// Owns one replay: its session, recording, buffering and delivery.
///
/// Cheap to clone; clones drive the same replay. Everything a recorder emits
/// goes through a single intake task, and every state change happens under
/// one lock, so events are buffered in the order they were emitted.
#[derive(Clone)]
pub struct ReplayController {
    inner: Arc<Inner>,
}

impl ReplayController {
    pub fn new(options: ReplayOptions, context: ReplayContext) -> Result<Self, ConfigError> {
        options.validate()?;

        let now = context.now_ms();
        let store = SessionStore::new(Arc::clone(&context.storage), Arc::clone(&context.clock));
        let retry = RetryConfig::default()
            .with_max_retries(options.max_retries)
            .with_base_interval(Duration::from_millis(options.retry_base_interval_ms));
        let sender = ReplaySender::new(
            Arc::clone(&context.transport),
            context.rate_limits.clone(),
            Arc::clone(&context.clock),
            retry,
        );
        let network = NetworkCapture::new(&options.network, options.hooks.network_enricher.clone());
        let wait = Duration::from_millis(options.flush_min_delay_ms);
        let max_wait = Duration::from_millis(options.flush_max_delay_ms);

        let inner = Arc::new_cyclic(|this: &Weak<Inner>| {
            let weak = this.clone();
            let callback: FlushCallback = Arc::new(move || -> BoxFuture<'static, ()> {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.flush(false).await;
                    }
                })
            });
            Inner {
                this: this.clone(),
                store,
                sender,
                network,
                debouncer: Debouncer::new(wait, max_wait, callback),
                flush_lock: FlushLock::new(),
                state: Mutex::new(ControllerState {
                    enabled: false,
                    paused: false,
                    requires_manual_start: false,
                    mode: RecordingMode::Session,
                    session: None,
                    buffer: None,
                    recorder: None,
                    intake: None,
                    click_detector: None,
                    click_timer: None,
                    context: EventContext::new(now),
                    last_activity: now,
                    current_url: None,
                    throttle: Throttle::new(),
                    performance_entries: Vec::new(),
                }),
                options,
                context,
            }
        });
        Ok(Self { inner })
    }

    pub fn options(&self) -> &ReplayOptions {
        &self.inner.options
    }

    /// Starts according to the sample rates. A session sampled out leaves
    /// the controller disabled.
    pub async fn initialize_sampling(&self) {
        self.inner.initialize_sampling(None).await;
    }

    /// Starts a session-mode recording regardless of sampling.
    pub async fn start(&self) {
        self.inner.start().await;
    }

    /// Starts a buffer-mode recording regardless of sampling.
    pub async fn start_buffering(&self) {
        self.inner.start_buffering().await;
    }

    pub async fn stop(&self, options: StopOptions) {
        self.inner.stop(options).await;
    }

    pub async fn pause(&self) {
        let mut state = self.inner.state.lock().await;
        self.inner.pause_locked(&mut state);
    }

    pub async fn resume(&self) {
        let mut state = self.inner.state.lock().await;
        self.inner.resume_locked(&mut state);
    }

    /// Flushes now. In buffer mode this sends the buffered replay and
    /// switches to session mode.
    pub async fn flush(&self) {
        self.inner.send_buffered_replay_or_flush(true).await;
    }

    /// Sends the buffered replay. Recording continues in session mode only
    /// when `continue_recording` is set.
    pub async fn send_buffered_replay_or_flush(&self, continue_recording: bool) {
        self.inner
            .send_buffered_replay_or_flush(continue_recording)
            .await;
    }

    /// Runs `update` and then schedules a flush unless it returned `true`.
    pub async fn add_update<F, Fut>(&self, update: F)
    where
        F: FnOnce(ReplayController) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let skip_flush = update(self.clone()).await;
        let state = self.inner.state.lock().await;
        self.inner.after_update_locked(&state, skip_flush);
    }

    /// Adds an event to the current segment. Returns whether it was buffered.
    pub async fn add_event(&self, event: RecordingEvent, is_checkout: bool) -> bool {
        let mut state = self.inner.state.lock().await;
        self.inner.add_event_locked(&mut state, event, is_checkout).await
    }

    pub async fn trigger_user_activity(&self) {
        self.inner.trigger_user_activity().await;
    }

    /// Returns `false` when the session has expired and been handled.
    pub async fn check_and_handle_expired_session(&self) -> bool {
        self.inner.check_and_handle_expired_session().await
    }

    /// Records a host breadcrumb.
    pub async fn handle_breadcrumb(&self, breadcrumb: Breadcrumb) {
        self.inner.handle_breadcrumb(breadcrumb).await;
    }

    /// Records a click on `target` and starts tracking it for slow clicks.
    pub async fn handle_dom_click(&self, target: ClickTarget, message: &str) {
        self.inner.handle_dom_click(target, message).await;
    }

    pub async fn handle_history_change(&self, from: &str, to: &str) {
        self.inner.handle_history_change(from, to).await;
    }

    pub async fn handle_visibility_change(&self, hidden: bool) {
        self.inner.handle_visibility_change(hidden).await;
    }

    pub async fn handle_network_breadcrumb(&self, breadcrumb: Breadcrumb, hint: NetworkHint) {
        self.inner.handle_network_breadcrumb(breadcrumb, hint).await;
    }

    /// Queues a span written into the next flushed segment.
    pub async fn add_performance_entry(&self, entry: ReplayPerformanceEntry) {
        let mut state = self.inner.state.lock().await;
        if !state.enabled {
            return;
        }
        state.performance_entries.push(entry);
    }

    /// Tags an outgoing host event with the replay id when it belongs to
    /// this replay.
    pub async fn handle_global_event(&self, event: &mut HostEvent) {
        self.inner.handle_global_event(event).await;
    }

    /// Links a delivered host event to the current segment. `status_code`
    /// is the host transport's response status.
    pub async fn handle_after_send_event(&self, event: &HostEvent, status_code: Option<u16>) {
        self.inner.handle_after_send_event(event, status_code).await;
    }

    pub async fn replay_id(&self) -> Option<String> {
        let state = self.inner.state.lock().await;
        state.session.as_ref().map(|session| session.id.clone())
    }

    pub async fn session(&self) -> Option<Session> {
        let state = self.inner.state.lock().await;
        state.session.clone()
    }

    pub async fn recording_mode(&self) -> RecordingMode {
        self.inner.state.lock().await.mode
    }

    pub async fn is_enabled(&self) -> bool {
        self.inner.is_enabled().await
    }

    pub async fn is_paused(&self) -> bool {
        self.inner.state.lock().await.paused
    }

    pub async fn is_recording(&self) -> bool {
        self.inner.state.lock().await.recorder.is_some()
    }
}

/// Configured duration as a timestamp offset, saturating at `i64::MAX`.
fn millis(duration_ms: u64) -> i64 {
    i64::try_from(duration_ms).unwrap_or(i64::MAX)
}

fn replay_type(sampled: Sampled) -> &'static str {
    match sampled {
        Sampled::Buffer => "buffer",
        _ => "session",
    }
}

fn session_label(state: &ControllerState) -> String {
    state
        .session
        .as_ref()
        .map(|session| session.id.clone())
        .unwrap_or_else(|| "-".to_string())
}

/// Drains the recorder channel in emission order.
fn run_intake(
    inner: Weak<Inner>,
    mut rx: mpsc::UnboundedReceiver<IntakeMessage>,
) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let mut had_first_event = false;
        while let Some(message) = rx.recv().await {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            match message {
                IntakeMessage::Event { event, is_checkout } => {
                    let is_checkout = is_checkout || !had_first_event;
                    had_first_event = true;
                    inner.handle_recording_emit(event, is_checkout).await;
                }
                IntakeMessage::Mutations { count, over_limit } => {
                    inner.handle_mutations(count, over_limit).await;
                }
            }
        }
    })
}

fn run_click_checks(inner: Weak<Inner>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        loop {
            tokio::time::sleep(CLICK_CHECK_INTERVAL).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let (resolved, done) = {
                let mut guard = inner.state.lock().await;
                let state = &mut *guard;
                let now = inner.now();
                let Some(detector) = state.click_detector.as_mut() else {
                    state.click_timer = None;
                    return;
                };
                let resolved = detector.check_clicks(now, state.current_url.as_deref());
                let done = !detector.has_pending_clicks();
                if done {
                    state.click_timer = None;
                }
                (resolved, done)
            };
            for breadcrumb in resolved {
                inner.add_breadcrumb_event(breadcrumb).await;
            }
            if done {
                return;
            }
        }
    })
}

/// Replaces an expired session, unless it was replaced or stopped meanwhile.
fn refresh_session(inner: Arc<Inner>, expired_id: String) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        {
            let state = inner.state.lock().await;
            let current = state.session.as_ref().map(|session| session.id.as_str());
            if !state.enabled || current != Some(expired_id.as_str()) {
                trace!("[{}] Session already replaced, skipping refresh", expired_id);
                return;
            }
        }
        inner
            .stop(StopOptions::with_reason("refresh session"))
            .await;
        inner.initialize_sampling(Some(expired_id)).await;
    })
}

impl Inner {
    fn now(&self) -> i64 {
        self.context.now_ms()
    }

    fn timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            idle_expire_ms: self.options.session_idle_expire_ms,
            max_duration_ms: self.options.max_replay_duration_ms,
        }
    }

    async fn is_enabled(&self) -> bool {
        self.state.lock().await.enabled
    }

    fn handle_exception(&self, error: &ReplayError) {
        error!("Replay error: {}", error);
        if let Some(ref hook) = self.options.hooks.on_error {
            hook(error);
        }
    }

    fn record_dropped_segment(&self, replay_id: &str, reason: &str) {
        warn!("[{}] Dropped replay segment: {}", replay_id, reason);
        if let Some(ref hook) = self.options.hooks.on_dropped_segment {
            hook(reason);
        }
    }

    fn spawn_stop(&self, options: StopOptions) {
        if let Some(inner) = self.this.upgrade() {
            tokio::spawn(async move {
                inner.stop(options).await;
            });
        }
    }

    fn spawn_refresh(&self, expired_id: String) {
        if let Some(inner) = self.this.upgrade() {
            tokio::spawn(refresh_session(inner, expired_id));
        }
    }

    fn spawn_flush_immediate(&self) {
        if let Some(inner) = self.this.upgrade() {
            tokio::spawn(async move {
                inner.flush_immediate().await;
            });
        }
    }

    fn spawn_buffer_promotion(&self) {
        if let Some(inner) = self.this.upgrade() {
            tokio::spawn(async move {
                inner.send_buffered_replay_or_flush(true).await;
            });
        }
    }

    async fn initialize_sampling(&self, previous_session_id: Option<String>) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.enabled {
            info!("[{}] Replay is already running", session_label(state));
            return;
        }

        state.requires_manual_start = self.options.requires_manual_start();
        if state.requires_manual_start {
            debug!("No sample rate set, waiting for a manual start");
            return;
        }

        let sampling = SamplingOptions {
            session_sample_rate: self.options.session_sample_rate,
            allow_buffering: self.options.error_sample_rate > 0.0,
        };
        let session = self.store.load_or_create(
            self.options.sticky_session,
            self.timeouts(),
            &sampling,
            previous_session_id,
        );
        if session.sampled == Sampled::Off {
            debug!("[{}] Session is not sampled, replay stays off", session.id);
            state.session = Some(session);
            return;
        }

        state.mode = if session.sampled == Sampled::Buffer && session.segment_id == 0 {
            RecordingMode::Buffer
        } else {
            RecordingMode::Session
        };
        info!("[{}] Starting replay in {} mode", session.id, state.mode.as_str());
        state.session = Some(session);
        self.initialize_recording_locked(state);
    }

    async fn start(&self) {
        self.start_with(RecordingMode::Session).await;
    }

    async fn start_buffering(&self) {
        self.start_with(RecordingMode::Buffer).await;
    }

    async fn start_with(&self, mode: RecordingMode) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.enabled {
            match state.mode {
                RecordingMode::Session => info!("Recording is already in progress"),
                RecordingMode::Buffer => {
                    info!("Buffering is in progress, call `flush()` to save the replay")
                }
            }
            return;
        }

        let now = self.now();
        state.last_activity = now;
        let sampling = SamplingOptions {
            session_sample_rate: if mode == RecordingMode::Session { 1.0 } else { 0.0 },
            allow_buffering: mode == RecordingMode::Buffer,
        };
        let session = self.store.load_or_create(
            self.options.sticky_session,
            self.timeouts(),
            &sampling,
            None,
        );
        info!("[{}] Starting replay in {} mode", session.id, mode.as_str());
        state.session = Some(session);
        state.mode = mode;
        self.initialize_recording_locked(state);
    }

    fn initialize_recording_locked(&self, state: &mut ControllerState) {
        let now = self.now();
        self.set_initial_state_locked(state, now);
        self.update_session_activity_locked(state, now);

        if let Some(mut previous) = state.buffer.take() {
            previous.destroy();
        }
        state.buffer = Some(create_event_buffer(BufferOptions {
            use_compression: self.options.use_compression,
            max_size: self.options.max_buffer_size_bytes,
            worker_factory: self.options.hooks.worker_factory.clone(),
        }));

        self.teardown_click_detection_locked(state);
        state.click_detector = Some(ClickDetector::new(&self.options.slow_click));

        state.enabled = true;
        state.paused = false;
        self.start_recording_locked(state);
    }

    fn start_recording_locked(&self, state: &mut ControllerState) {
        self.stop_recording_locked(state);

        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(ControllerSink {
            tx,
            mutation_breadcrumb_limit: self.options.mutation_breadcrumb_limit,
            mutation_limit: self.options.mutation_limit,
        });
        let checkout_every_ms =
            (state.mode == RecordingMode::Buffer).then_some(self.options.buffer_checkout_ms);
        let options = RecordOptions::from_privacy(&self.options.privacy, checkout_every_ms);

        state.intake = Some(tokio::spawn(run_intake(self.this.clone(), rx)));
        match self.context.recorder.record(options, sink) {
            Ok(handle) => state.recorder = Some(handle),
            Err(e) => {
                if let Some(intake) = state.intake.take() {
                    intake.abort();
                }
                self.handle_exception(&ReplayError::Recorder(e));
            }
        }
    }

    /// Returns whether a recorder was running.
    fn stop_recording_locked(&self, state: &mut ControllerState) -> bool {
        if let Some(intake) = state.intake.take() {
            intake.abort();
        }
        match state.recorder.take() {
            Some(handle) => {
                handle.stop();
                true
            }
            None => false,
        }
    }

    fn teardown_click_detection_locked(&self, state: &mut ControllerState) {
        if let Some(timer) = state.click_timer.take() {
            timer.abort();
        }
        state.click_detector = None;
    }

    fn pause_locked(&self, state: &mut ControllerState) {
        if state.paused {
            return;
        }
        info!("[{}] Pausing replay", session_label(state));
        state.paused = true;
        self.stop_recording_locked(state);
    }

    fn resume_locked(&self, state: &mut ControllerState) {
        if !state.paused || !self.check_session_locked(state) {
            return;
        }
        info!("[{}] Resuming replay", session_label(state));
        state.paused = false;
        self.start_recording_locked(state);
    }

    /// Resets the segment context. The current url, if known, becomes the
    /// segment's first url.
    fn set_initial_state_locked(&self, state: &mut ControllerState, now: i64) {
        state.performance_entries.clear();
        state.context.clear();
        state.context.initial_timestamp = now;
        state.context.initial_url = state.current_url.clone();
        if let Some(url) = state.current_url.as_deref() {
            state.context.add_url(url);
        }
    }

    fn update_session_activity_locked(&self, state: &mut ControllerState, now: i64) {
        if let Some(session) = state.session.as_mut() {
            session.last_activity = now;
        }
        self.maybe_save_session_locked(state);
    }

    fn maybe_save_session_locked(&self, state: &ControllerState) {
        if !self.options.sticky_session {
            return;
        }
        if let Some(session) = state.session.as_ref() {
            self.store.save(session);
        }
    }

    /// Schedules a flush after an update, except in buffer mode.
    fn after_update_locked(&self, state: &ControllerState, skip_flush: bool) {
        if skip_flush || !state.enabled || state.mode == RecordingMode::Buffer {
            return;
        }
        self.debouncer.schedule();
    }

    async fn check_and_handle_expired_session(&self) -> bool {
        let mut state = self.state.lock().await;
        self.check_and_handle_expired_session_locked(&mut state)
    }

    /// Pauses an idle session recording, or refreshes an expired session.
    /// Returns `false` in both cases.
    fn check_and_handle_expired_session_locked(&self, state: &mut ControllerState) -> bool {
        let now = self.now();
        let is_session_sampled = state
            .session
            .as_ref()
            .map(|session| session.sampled == Sampled::Session)
            .unwrap_or(false);
        if is_session_sampled
            && state.last_activity > 0
            && is_expired(state.last_activity, self.options.session_idle_pause_ms, now)
        {
            self.pause_locked(state);
            return false;
        }
        self.check_session_locked(state)
    }

    fn check_session_locked(&self, state: &ControllerState) -> bool {
        let Some(session) = state.session.as_ref() else {
            return false;
        };
        if should_refresh_session(
            session,
            self.options.max_replay_duration_ms,
            self.options.session_idle_expire_ms,
            self.now(),
        ) {
            debug!("[{}] Session has expired, refreshing", session.id);
            self.spawn_refresh(session.id.clone());
            return false;
        }
        true
    }

    async fn trigger_user_activity(&self) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let now = self.now();
        state.last_activity = now;

        if state.recorder.is_none() {
            if !self.check_and_handle_expired_session_locked(state) {
                return;
            }
            self.resume_locked(state);
            return;
        }

        self.check_and_handle_expired_session_locked(state);
        self.update_session_activity_locked(state, now);
    }

    async fn add_event_locked(
        &self,
        state: &mut ControllerState,
        event: RecordingEvent,
        is_checkout: bool,
    ) -> bool {
        if state.buffer.is_none() || state.paused || !state.enabled {
            return false;
        }

        let now = self.now();
        if event
            .timestamp
            .saturating_add(millis(self.options.session_idle_pause_ms))
            < now
        {
            trace!("Skipping event older than the idle timeout ({})", event.timestamp);
            return false;
        }
        if event.timestamp
            > state
                .context
                .initial_timestamp
                .saturating_add(millis(self.options.max_replay_duration_ms))
        {
            info!(
                "[{}] Skipping event with timestamp {} past the max replay duration",
                session_label(state),
                event.timestamp
            );
            return false;
        }

        let mode = state.mode;
        let Some(buffer) = state.buffer.as_mut() else {
            return false;
        };
        if buffer.wait_for_checkout() && !is_checkout {
            trace!("Waiting for a checkout, skipping event");
            return false;
        }
        if is_checkout {
            if mode == RecordingMode::Buffer {
                if let Err(e) = buffer.clear().await {
                    warn!("Unable to clear event buffer on checkout: {}", e);
                }
            }
            buffer.set_has_checkout(true);
            buffer.set_wait_for_checkout(false);
        }

        let event = match self.options.hooks.before_add_recording_event {
            Some(ref hook) if event.event_type == EventType::Custom => match hook(event) {
                Some(event) => event,
                None => {
                    trace!("Custom event dropped by hook");
                    return false;
                }
            },
            _ => event,
        };

        match buffer.add_event(event).await {
            Ok(()) => true,
            Err(e) => {
                let size_exceeded = e.is_size_exceeded();
                if size_exceeded && mode == RecordingMode::Buffer {
                    warn!("Event buffer is full, waiting for the next checkout");
                    if let Err(e) = buffer.clear().await {
                        warn!("Unable to clear event buffer: {}", e);
                    }
                    buffer.set_wait_for_checkout(true);
                    return false;
                }
                self.handle_exception(&ReplayError::Buffer(e));
                self.spawn_stop(StopOptions::with_reason(if size_exceeded {
                    "addEventSizeExceeded"
                } else {
                    "addEvent"
                }));
                false
            }
        }
    }

    /// Adds an event through the breadcrumb throttle. The first rejected
    /// event of a burst is replaced by a `replay.throttled` marker.
    async fn throttled_add_event_locked(
        &self,
        state: &mut ControllerState,
        event: RecordingEvent,
    ) -> bool {
        let now = self.now();
        match state.throttle.check(now) {
            ThrottleOutcome::Allowed => self.add_event_locked(state, event, false).await,
            ThrottleOutcome::Throttled => {
                debug!("[{}] Throttling recording events", session_label(state));
                let marker = create_breadcrumb("replay.throttled", now)
                    .with_data("metric", Value::Bool(true))
                    .to_event();
                let added = self.add_event_locked(state, marker, false).await;
                self.after_update_locked(state, !added);
                false
            }
            ThrottleOutcome::Skipped => false,
        }
    }

    async fn add_custom_breadcrumb_locked(&self, state: &mut ControllerState, breadcrumb: Breadcrumb) {
        self.throttled_add_event_locked(state, breadcrumb.to_event())
            .await;
        self.after_update_locked(state, false);
    }

    fn settings_payload(&self, state: &ControllerState) -> Value {
        let options = &self.options;
        json!({
            "sessionSampleRate": options.session_sample_rate,
            "errorSampleRate": options.error_sample_rate,
            "useCompressionOption": options.use_compression,
            "useCompression": state
                .buffer
                .as_ref()
                .map(|buffer| buffer.kind() == BufferKind::Worker)
                .unwrap_or(false),
            "blockAllMedia": options.privacy.block_all_media,
            "maskAllText": options.privacy.mask_all_text,
            "maskAllInputs": options.privacy.mask_all_inputs,
            "networkDetailHasUrls": !options.network.allow_urls.is_empty(),
            "networkCaptureBodies": options.network.capture_bodies,
            "networkRequestHasHeaders": !options.network.request_headers.is_empty(),
            "networkResponseHasHeaders": !options.network.response_headers.is_empty(),
        })
    }

    /// Writes the effective options into the first segment only.
    async fn add_settings_event_locked(&self, state: &mut ControllerState) {
        if state.session.as_ref().map(|session| session.segment_id) != Some(0) {
            return;
        }
        let event = RecordingEvent::custom("options", self.now(), self.settings_payload(state));
        self.add_event_locked(state, event, false).await;
    }

    async fn add_performance_entries_locked(&self, state: &mut ControllerState) {
        let entries = std::mem::take(&mut state.performance_entries);
        for entry in entries {
            self.throttled_add_event_locked(state, entry.to_event())
                .await;
        }
    }

    fn update_click_detector_locked(&self, state: &mut ControllerState, event: &RecordingEvent) {
        let Some(detector) = state.click_detector.as_mut() else {
            return;
        };
        if event.is_page_change() {
            detector.register_mutation(event.timestamp);
        }
        if event.incremental_source() == Some(SOURCE_SCROLL) {
            detector.register_scroll(event.timestamp);
        }
        if let Some(node_id) = event.clicked_node_id() {
            if self.context.recorder.lookup_node(node_id).is_some() {
                detector.register_click(node_id);
            }
        }
    }

    async fn handle_recording_emit(&self, event: RecordingEvent, is_checkout: bool) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if !self.check_and_handle_expired_session_locked(state) {
            debug!("[{}] Received replay event after session expired", session_label(state));
            return;
        }

        if let Some(href) = event.meta_href() {
            let href = href.to_string();
            if state.context.initial_url.is_none() {
                state.context.initial_url = Some(href.clone());
                state.context.add_url(&href);
            }
            state.current_url = Some(href);
        }
        self.update_click_detector_locked(state, &event);

        if state.mode == RecordingMode::Buffer && is_checkout {
            self.set_initial_state_locked(state, self.now());
        }

        let skip_flush = if !self.add_event_locked(state, event, is_checkout).await {
            true
        } else if !is_checkout {
            false
        } else {
            self.add_settings_event_locked(state).await;

            if state.mode == RecordingMode::Buffer {
                let earliest = state
                    .buffer
                    .as_ref()
                    .and_then(|buffer| buffer.earliest_timestamp());
                if let (Some(session), Some(earliest)) = (state.session.as_mut(), earliest) {
                    debug!("[{}] Anchoring buffered session at {}", session.id, earliest);
                    session.started = earliest;
                }
                self.maybe_save_session_locked(state);
            }

            let continues_previous = state
                .session
                .as_ref()
                .map(|session| session.previous_session_id.is_some())
                .unwrap_or(false);
            if !continues_previous && state.mode == RecordingMode::Session {
                self.spawn_flush_immediate();
            }
            true
        };
        self.after_update_locked(state, skip_flush);
    }

    async fn handle_mutations(&self, count: usize, over_limit: bool) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if !state.enabled {
            return;
        }
        let breadcrumb = create_breadcrumb("replay.mutations", self.now())
            .with_data("count", json!(count))
            .with_data("limit", json!(over_limit));
        self.add_custom_breadcrumb_locked(state, breadcrumb).await;

        if over_limit {
            warn!(
                "[{}] Mutation batch of {} exceeds the limit of {}, stopping",
                session_label(state),
                count,
                self.options.mutation_limit
            );
            self.spawn_stop(StopOptions {
                force_flush: state.mode == RecordingMode::Session,
                reason: Some("mutationLimit".to_string()),
            });
        }
    }

    fn update_initial_timestamp_from_event_buffer_locked(&self, state: &mut ControllerState) {
        if state.requires_manual_start {
            return;
        }
        if state.session.as_ref().map(|session| session.segment_id) != Some(0) {
            return;
        }
        let earliest = state
            .buffer
            .as_ref()
            .and_then(|buffer| buffer.earliest_timestamp());
        if let Some(earliest) = earliest {
            if earliest < state.context.initial_timestamp {
                state.context.initial_timestamp = earliest;
            }
        }
    }

    /// Flushes the current segment, coalescing with a flush in progress.
    ///
    /// A forced flush waits for the running one to settle and then runs;
    /// an unforced one leaves a follow-up request behind instead.
    async fn flush(&self, force: bool) {
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if !state.enabled && !force {
                return;
            }
            if !self.check_and_handle_expired_session_locked(state) {
                error!("Attempting to finish replay event after session expired");
                return;
            }
            let Some(session) = state.session.as_ref() else {
                return;
            };

            let duration = self.now().saturating_sub(session.started);
            self.debouncer.cancel();

            let too_short = duration < millis(self.options.effective_min_replay_duration_ms());
            let too_long = duration
                > millis(self.options.max_replay_duration_ms).saturating_add(FLUSH_DURATION_SLACK_MS);
            if too_short || too_long {
                info!(
                    "[{}] Session duration ({}s) is too {}, not sending replay",
                    session.id,
                    duration / 1000,
                    if too_short { "short" } else { "long" }
                );
                if too_short {
                    self.debouncer.schedule();
                }
                return;
            }

            let has_checkout = state
                .buffer
                .as_ref()
                .map(|buffer| buffer.has_checkout())
                .unwrap_or(true);
            if session.segment_id == 0 && !has_checkout {
                info!("[{}] Flushing initial segment without checkout", session.id);
            }
        }

        let guard = loop {
            match self.flush_lock.try_acquire() {
                Some(guard) => break guard,
                None if force => self.flush_lock.wait_idle().await,
                None => {
                    trace!("Flush in progress, a follow-up is queued");
                    return;
                }
            }
        };
        self.run_flush().await;
        if guard.release() {
            self.debouncer.schedule();
        }
    }

    async fn run_flush(&self) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(replay_id) = state.session.as_ref().map(|session| session.id.clone()) else {
            error!("No session found to flush");
            return;
        };
        if state.buffer.is_none() {
            error!("[{}] No event buffer found to flush", replay_id);
            return;
        }

        self.add_performance_entries_locked(state).await;
        if !state
            .buffer
            .as_ref()
            .map(|buffer| buffer.has_events())
            .unwrap_or(false)
        {
            return;
        }

        self.update_initial_timestamp_from_event_buffer_locked(state);
        let timestamp = self.now();
        let duration_ms = timestamp.saturating_sub(state.context.initial_timestamp);
        if duration_ms
            > millis(self.options.max_replay_duration_ms).saturating_add(SEGMENT_DURATION_SLACK_MS)
        {
            drop(guard);
            self.handle_exception(&ReplayError::SessionTooLong { duration_ms });
            self.stop(StopOptions::with_reason("sendReplay")).await;
            return;
        }

        let context = state.context.pop();
        let Some(session) = state.session.as_mut() else {
            return;
        };
        let segment_id = session.segment_id;
        session.segment_id += 1;
        let sampled = session.sampled;
        self.maybe_save_session_locked(state);

        let finished = match state.buffer.as_mut() {
            Some(buffer) => buffer.finish().await,
            None => return,
        };
        drop(guard);

        let recording_data = match finished {
            Ok(payload) => payload,
            Err(e) => {
                self.handle_exception(&ReplayError::Buffer(e));
                self.stop(StopOptions::with_reason("sendReplay")).await;
                return;
            }
        };
        if recording_data.is_empty() {
            debug!("[{}] Segment {} is empty, not sending", replay_id, segment_id);
            return;
        }

        let data = SendReplayData {
            recording_data,
            replay_id: replay_id.clone(),
            segment_id,
            initial_timestamp: context.initial_timestamp,
            timestamp,
            error_ids: context.error_ids,
            trace_ids: context.trace_ids,
            urls: context.urls,
            replay_type: replay_type(sampled).to_string(),
        };
        debug!(
            "[{}] Sending segment {} ({} bytes)",
            replay_id,
            segment_id,
            data.recording_data.len()
        );
        if let Err(e) = self.sender.send_replay(&data).await {
            let reason = e.drop_reason();
            let rate_limited = matches!(e, SendError::RateLimited { .. });
            self.handle_exception(&ReplayError::Send(e));
            self.record_dropped_segment(&replay_id, reason);
            if !rate_limited {
                self.stop(StopOptions::with_reason("sendReplay")).await;
            }
        }
    }

    /// Runs a flush now, bypassing the debounce delay.
    async fn flush_immediate(&self) {
        self.debouncer.schedule();
        if let Some(flush) = self.debouncer.flush_now() {
            flush.await;
        }
    }

    /// Tears the replay down. Boxed because a failed flush can stop the
    /// replay from inside a flush.
    fn stop(&self, options: StopOptions) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            {
                let mut guard = self.state.lock().await;
                let state = &mut *guard;
                if !state.enabled {
                    return;
                }
                state.enabled = false;
                match options.reason.as_deref() {
                    Some(reason) => info!(
                        "[{}] Stopping replay triggered by {}",
                        session_label(state),
                        reason
                    ),
                    None => info!("[{}] Stopping replay", session_label(state)),
                }
                self.teardown_click_detection_locked(state);
                self.stop_recording_locked(state);
                self.debouncer.cancel();
            }

            if options.force_flush {
                self.flush(true).await;
            }

            let mut state = self.state.lock().await;
            if let Some(mut buffer) = state.buffer.take() {
                buffer.destroy();
            }
            state.session = None;
            self.store.clear();
        })
    }

    async fn send_buffered_replay_or_flush(&self, continue_recording: bool) {
        let mode = self.state.lock().await.mode;
        if mode == RecordingMode::Session {
            self.flush_immediate().await;
            return;
        }

        let activity_time = self.now();
        info!("Converting buffer to session");
        self.flush_immediate().await;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let had_recording = self.stop_recording_locked(state);
        if !continue_recording || !had_recording || state.mode == RecordingMode::Session {
            return;
        }

        state.mode = RecordingMode::Session;
        if state.session.is_some() {
            state.last_activity = activity_time;
            self.update_session_activity_locked(state, activity_time);
        }
        self.start_recording_locked(state);
    }

    async fn add_breadcrumb_event(&self, breadcrumb: Breadcrumb) {
        let category = breadcrumb.category().unwrap_or_default().to_string();
        if category == "sentry.transaction" {
            return;
        }
        if category == "ui.click" || category == "ui.input" {
            self.trigger_user_activity().await;
        } else {
            self.check_and_handle_expired_session().await;
        }

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        self.throttled_add_event_locked(state, breadcrumb.to_event())
            .await;
        // Console output is frequent and never worth a flush on its own.
        self.after_update_locked(state, category == "console");
    }

    async fn handle_breadcrumb(&self, breadcrumb: Breadcrumb) {
        if !self.is_enabled().await {
            return;
        }
        let Some(breadcrumb) = normalize_breadcrumb(breadcrumb, self.options.console_arg_max_size)
        else {
            return;
        };
        self.add_breadcrumb_event(breadcrumb).await;
    }

    async fn handle_dom_click(&self, target: ClickTarget, message: &str) {
        let breadcrumb = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if !state.enabled {
                return;
            }
            let breadcrumb = create_breadcrumb("ui.click", self.now())
                .with_message(message)
                .with_data("nodeId", json!(target.node_id))
                .with_data(
                    "node",
                    json!({
                        "id": target.node_id,
                        "tagName": target.tag_name,
                        "attributes": target.attributes,
                    }),
                );
            let tracked = state
                .click_detector
                .as_mut()
                .map(|detector| detector.handle_click(breadcrumb.clone(), &target))
                .unwrap_or(false);
            if tracked && state.click_timer.is_none() {
                state.click_timer = Some(tokio::spawn(run_click_checks(self.this.clone())));
            }
            breadcrumb
        };
        self.add_breadcrumb_event(breadcrumb).await;
    }

    async fn handle_history_change(&self, from: &str, to: &str) {
        {
            let mut state = self.state.lock().await;
            if !state.enabled {
                return;
            }
            state.current_url = Some(to.to_string());
            state.context.add_url(to);
        }
        self.trigger_user_activity().await;

        let now = ms_to_secs(self.now());
        let entry =
            ReplayPerformanceEntry::new("navigation.push", to, now, now, json!({ "previous": from }));
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        self.throttled_add_event_locked(state, entry.to_event())
            .await;
        self.after_update_locked(state, false);
    }

    async fn handle_visibility_change(&self, hidden: bool) {
        let flush = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if !state.enabled {
                return;
            }
            let now = self.now();
            if hidden {
                let expired = match state.session.as_ref() {
                    Some(session) => is_session_expired(
                        session,
                        self.options.max_replay_duration_ms,
                        self.options.session_idle_expire_ms,
                        now,
                    ),
                    None => return,
                };
                if expired {
                    return;
                }
                self.add_custom_breadcrumb_locked(state, create_breadcrumb("ui.blur", now))
                    .await;
                state.mode == RecordingMode::Session
            } else {
                if !self.check_and_handle_expired_session_locked(state) {
                    info!("Document has become active, but session has expired");
                    return;
                }
                self.add_custom_breadcrumb_locked(state, create_breadcrumb("ui.focus", now))
                    .await;
                false
            }
        };
        if flush {
            self.flush_immediate().await;
        }
    }

    async fn handle_network_breadcrumb(&self, breadcrumb: Breadcrumb, hint: NetworkHint) {
        if !self.is_enabled().await {
            return;
        }
        let Some(entry) = self.network.capture(&breadcrumb, hint).await else {
            return;
        };
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if !state.enabled {
            return;
        }
        self.throttled_add_event_locked(state, entry.to_event())
            .await;
        self.after_update_locked(state, true);
    }

    fn should_sample_buffered_error(&self, event: &HostEvent) -> bool {
        event.exception.is_some()
            && event.is_error_event()
            && event.message.as_deref() != Some(UNABLE_TO_SEND_REPLAY)
            && is_sampled(self.options.error_sample_rate)
    }

    async fn handle_global_event(&self, event: &mut HostEvent) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if !state.enabled || state.paused {
            return;
        }
        if !event.is_error_event() && !event.is_transaction_event() {
            return;
        }
        if !self.check_and_handle_expired_session_locked(state) {
            return;
        }

        let tag = match state.mode {
            RecordingMode::Session => true,
            RecordingMode::Buffer => self.should_sample_buffered_error(event),
        };
        if !tag {
            return;
        }
        if let Some(session) = state.session.as_ref() {
            event
                .tags
                .insert(REPLAY_ID_TAG.to_string(), session.id.clone());
        }
    }

    async fn handle_after_send_event(&self, event: &HostEvent, status_code: Option<u16>) {
        if !matches!(status_code, Some(code) if (200..300).contains(&code)) {
            return;
        }

        let promote = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if !state.enabled {
                return;
            }
            if event.is_transaction_event() {
                if let Some(trace_id) = event.trace_id.as_deref() {
                    state.context.add_trace_id(trace_id);
                }
                return;
            }
            if !event.is_error_event() {
                return;
            }
            state.context.add_error_id(&event.event_id);

            state.mode == RecordingMode::Buffer
                && event.replay_id().is_some()
                && self
                    .options
                    .hooks
                    .before_error_sampling
                    .as_ref()
                    .map(|hook| hook(event))
                    .unwrap_or(true)
        };
        if promote {
            debug!("[{}] Error linked to buffered replay, promoting", event.event_id);
            self.spawn_buffer_promotion();
        }
    }
}
