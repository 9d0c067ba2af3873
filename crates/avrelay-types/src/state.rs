//! Connection state owned by the reconnection supervisor.

use serde::{Deserialize, Serialize};

/// Phase of the reconnection state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionPhase {
    /// No resources held.
    #[default]
    Idle,

    /// Opening source, codec, converter and sink.
    Connecting,

    /// Media is flowing.
    Streaming,

    /// An adapter failed; resources are being released.
    Faulted,

    /// Terminal.
    Closed,
}

impl ConnectionPhase {
    /// Returns true if media is flowing.
    pub fn is_streaming(self) -> bool {
        matches!(self, Self::Streaming)
    }

    /// Returns true if the phase is terminal.
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Returns true if a transition from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionPhase::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Connecting)
                | (Connecting, Streaming)
                | (Streaming, Faulted)
                | (Faulted, Connecting)
                | (Idle | Connecting | Streaming | Faulted, Closed)
        )
    }

    /// Returns a simple string representation of the phase.
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Connecting => "Connecting",
            Self::Streaming => "Streaming",
            Self::Faulted => "Faulted",
            Self::Closed => "Closed",
        }
    }
}

/// Supervisor bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionState {
    /// Current phase.
    pub phase: ConnectionPhase,

    /// Failed attempts since the last successful connection.
    pub consecutive_failures: u32,

    /// Streaming faults without a stable session in between. Connection
    /// successes do not reset it, so reconnect backoff grows across cycles.
    pub consecutive_faults: u32,

    /// Successful connections after the first.
    pub reconnects: u64,

    /// Message of the most recent failure.
    pub last_error: Option<String>,
}

impl ConnectionState {
    /// Record a failed connection attempt.
    pub fn record_failure(&mut self, message: impl Into<String>) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(message.into());
    }

    /// Record a fault on a streaming pipeline. `stable` means the session
    /// ran long enough to forget earlier faults.
    pub fn record_fault(&mut self, message: impl Into<String>, stable: bool) {
        if stable {
            self.consecutive_faults = 0;
        }
        self.consecutive_faults = self.consecutive_faults.saturating_add(1);
        self.last_error = Some(message.into());
    }

    /// Record a successful connection.
    pub fn record_success(&mut self, first: bool) {
        self.consecutive_failures = 0;
        if !first {
            self.reconnects += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        use ConnectionPhase::*;
        assert!(Idle.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connecting));
        assert!(Streaming.can_transition_to(Faulted));
        assert!(Faulted.can_transition_to(Connecting));
        assert!(Streaming.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Connecting));
        assert!(!Idle.can_transition_to(Streaming));
        assert!(!Faulted.can_transition_to(Streaming));
    }

    #[test]
    fn test_state_counters() {
        let mut state = ConnectionState::default();
        state.record_failure("refused");
        state.record_failure("refused");
        assert_eq!(state.consecutive_failures, 2);

        state.record_success(true);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.reconnects, 0);

        state.record_failure("reset");
        state.record_success(false);
        assert_eq!(state.reconnects, 1);
        assert_eq!(state.last_error.as_deref(), Some("reset"));
    }

    #[test]
    fn test_faults_counted_apart_from_attempts() {
        let mut state = ConnectionState::default();
        state.record_success(true);

        state.record_fault("reset", false);
        assert_eq!(state.consecutive_failures, 0);
        state.record_success(false);
        state.record_fault("reset", false);
        assert_eq!(state.consecutive_faults, 2);

        state.record_success(false);
        state.record_fault("reset", true);
        assert_eq!(state.consecutive_faults, 1);
        assert_eq!(state.reconnects, 2);
    }
}
