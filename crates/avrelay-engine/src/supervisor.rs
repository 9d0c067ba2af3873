//! Reconnection state machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use avrelay_types::{ConnectionPhase, ConnectionState, PipelineEvent, RetryPolicy};
use crossbeam_channel::Sender;
use tracing::{debug, error, info, instrument, warn};

use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::{PipelineResult, RETRY_SLICE_MS, STABLE_SESSION_SECS};

/// Sleep for `delay` in short slices. Returns false if `cancel` was raised
/// before the delay ran out.
pub fn sleep_cancellable(delay: Duration, cancel: &AtomicBool) -> bool {
    let deadline = Instant::now() + delay;
    let slice = Duration::from_millis(RETRY_SLICE_MS);

    loop {
        if cancel.load(Ordering::SeqCst) {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        thread::sleep(remaining.min(slice));
    }
}

/// Drives a [`PipelineContext`] through connect, fault and retry.
///
/// Phases follow `Idle -> Connecting -> Streaming -> Faulted -> Connecting
/// -> ... -> Closed`; every change is published as
/// [`PipelineEvent::PhaseChanged`].
pub struct Supervisor {
    state: ConnectionState,
    retry: RetryPolicy,
    events: Sender<PipelineEvent>,
    cancel: Arc<AtomicBool>,
    connected_once: bool,
    streaming_since: Option<Instant>,
}

impl Supervisor {
    pub fn new(retry: RetryPolicy, events: Sender<PipelineEvent>, cancel: Arc<AtomicBool>) -> Self {
        Self {
            state: ConnectionState::default(),
            retry,
            events,
            cancel,
            connected_once: false,
            streaming_since: None,
        }
    }

    /// Current bookkeeping.
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Current phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.state.phase
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn transition_to(&mut self, next: ConnectionPhase) {
        let previous = self.state.phase;
        if !previous.can_transition_to(next) {
            warn!(previous = previous.name(), next = next.name(), "Unexpected phase change");
        }
        self.state.phase = next;

        debug!(
            previous = previous.name(),
            current = next.name(),
            "Phase transition"
        );
        self.send_event(PipelineEvent::PhaseChanged {
            previous,
            current: next,
        });
    }

    fn send_event(&self, event: PipelineEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!("Failed to send event: {}", e);
        }
    }

    /// Open the pipeline, retrying transient failures until it streams.
    ///
    /// Returns `Ok(true)` once streaming, `Ok(false)` if cancelled while
    /// connecting, and an error for configuration failures. Both of the
    /// latter leave the supervisor `Closed`.
    #[instrument(name = "supervisor_connect", skip_all)]
    pub fn connect(&mut self, ctx: &mut PipelineContext) -> PipelineResult<bool> {
        loop {
            if self.cancelled() {
                self.close(ctx);
                return Ok(false);
            }

            self.transition_to(ConnectionPhase::Connecting);
            let error = match ctx.open_all() {
                Ok(()) => {
                    self.state.record_success(!self.connected_once);
                    self.transition_to(ConnectionPhase::Streaming);
                    self.streaming_since = Some(Instant::now());
                    if self.connected_once {
                        info!(total = self.state.reconnects, "Reconnected");
                        self.send_event(PipelineEvent::Reconnected {
                            total: self.state.reconnects,
                        });
                    }
                    self.connected_once = true;
                    return Ok(true);
                }
                Err(e) => e,
            };

            if error.is_config() {
                error!("Pipeline cannot start: {}", error);
                self.state.record_failure(error.to_string());
                self.close(ctx);
                return Err(error);
            }

            self.state.record_failure(error.to_string());
            let attempt = self.state.consecutive_failures;
            let delay = self.retry.delay_for_attempt(attempt);
            warn!(attempt, delay_ms = delay.as_millis() as u64, "Connect failed: {}", error);
            self.send_event(PipelineEvent::RetryScheduled {
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: error.to_string(),
            });

            if !sleep_cancellable(delay, &self.cancel) {
                debug!("Cancelled while waiting to retry");
                self.close(ctx);
                return Ok(false);
            }
        }
    }

    /// Record a fault on a streaming pipeline, release its resources and
    /// wait out the retry delay before the next [`connect`](Self::connect).
    /// The configuration is kept; the next connect reopens with it.
    ///
    /// Returns false if cancelled during the wait.
    #[instrument(name = "supervisor_fault", skip_all)]
    pub fn fault(&mut self, ctx: &mut PipelineContext, error: &PipelineError) -> bool {
        warn!("Pipeline fault: {}", error);
        self.transition_to(ConnectionPhase::Faulted);
        let stable = self
            .streaming_since
            .take()
            .is_some_and(|since| since.elapsed() >= Duration::from_secs(STABLE_SESSION_SECS));
        self.state.record_fault(error.to_string(), stable);
        ctx.close_all();

        let faults = self.state.consecutive_faults;
        let delay = self.retry.delay_for_attempt(faults);
        info!(faults, delay_ms = delay.as_millis() as u64, "Reconnecting after delay");
        self.send_event(PipelineEvent::ReconnectScheduled {
            faults,
            delay_ms: delay.as_millis() as u64,
            error: error.to_string(),
        });

        sleep_cancellable(delay, &self.cancel)
    }

    /// Release everything and enter the terminal phase. Safe to call repeatedly.
    pub fn close(&mut self, ctx: &mut PipelineContext) {
        ctx.close_all();
        self.streaming_since = None;
        if self.state.phase.is_closed() {
            return;
        }
        self.transition_to(ConnectionPhase::Closed);
        self.send_event(PipelineEvent::Closed);
    }
}
