//! Events published by a running pipeline.

use serde::{Deserialize, Serialize};

use crate::state::ConnectionPhase;

/// Counters of a running pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    /// Raw units taken from the source (batches when publishing, frames when playing).
    pub units_in: u64,

    /// Units dropped after a conversion or codec error.
    pub units_dropped: u64,

    /// Units delivered to the sink (packets when publishing, frames when playing).
    pub units_out: u64,

    /// Bytes delivered to the sink.
    pub bytes_out: u64,

    /// Writes that blocked on a full relay buffer.
    pub buffer_stalls: u64,

    /// Reconnections after the first connection.
    pub reconnects: u64,

    /// Average output rate over the last stats interval, units per second.
    pub rate: f32,

    /// Average output bitrate over the last stats interval, kbps.
    pub bitrate_kbps: u32,
}

/// Events that the pipeline can publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    /// The reconnection state machine changed phase.
    PhaseChanged {
        /// Previous phase.
        previous: ConnectionPhase,

        /// Current phase.
        current: ConnectionPhase,
    },

    /// A unit was dropped without interrupting the stream.
    UnitDropped {
        /// Capture sequence number of the dropped unit, when it has one.
        /// Compressed packets and codec output carry none.
        sequence: Option<u64>,

        /// Why it was dropped.
        reason: String,
    },

    /// The relay buffer was full and the producer had to wait.
    BufferStall {
        /// Total stalls so far.
        total: u64,
    },

    /// Periodic counters.
    Stats(PipelineStats),

    /// A connection attempt failed and will be retried.
    RetryScheduled {
        /// Consecutive failed attempts.
        attempt: u32,

        /// Delay before the next attempt, in milliseconds.
        delay_ms: u64,

        /// Failure message.
        error: String,
    },

    /// A streaming pipeline faulted and will reconnect after a delay.
    ReconnectScheduled {
        /// Consecutive faults.
        faults: u32,

        /// Delay before reconnecting, in milliseconds.
        delay_ms: u64,

        /// Fault message.
        error: String,
    },

    /// The pipeline reconnected after a fault.
    Reconnected {
        /// Total reconnections so far.
        total: u64,
    },

    /// The pipeline has shut down.
    Closed,
}
