//! Collaborator interfaces behind the pipeline's sources and sinks.
//!
//! The engine only sees these traits. Concrete devices live in
//! `avrelay-device`, the RTMP link in `avrelay-transport`, and tests plug in
//! in-memory mocks.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::media::{EncodedPacket, MediaFormat, MediaFrame, MediaKind, StreamInfo};
use crate::{DeviceResult, LinkResult};

/// Outcome of a bounded read.
#[derive(Debug)]
pub enum Incoming<T> {
    /// Data arrived.
    Data(T),

    /// Nothing arrived within the timeout.
    Timeout,

    /// The peer or device ended the stream.
    End,
}

impl<T> Incoming<T> {
    /// Returns true if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Returns true if the stream ended.
    pub fn is_end(&self) -> bool {
        matches!(self, Self::End)
    }
}

/// A local device producing raw media.
pub trait CaptureDevice: Send {
    /// Human-readable device name.
    fn name(&self) -> &str;

    /// Open the device, requesting `format`. Returns the format actually
    /// delivered, which callers must check against what they asked for.
    fn open(&mut self, format: &MediaFormat) -> DeviceResult<MediaFormat>;

    /// Read the next chunk of raw bytes in the negotiated format.
    ///
    /// Chunks need not be aligned to whole units.
    fn read(&mut self, timeout: Duration) -> DeviceResult<Incoming<Bytes>>;

    /// Release the device. Safe to call when not open.
    fn close(&mut self);
}

/// A local device consuming raw media.
pub trait PlaybackDevice: Send {
    /// Human-readable device name.
    fn name(&self) -> &str;

    /// Open the device for frames of `format`.
    fn open(&mut self, format: &MediaFormat) -> DeviceResult<()>;

    /// Hand one frame to the device, blocking until it is accepted.
    fn write(&mut self, frame: &MediaFrame) -> DeviceResult<()>;

    /// Release the device. Safe to call when not open.
    fn close(&mut self);
}

/// A remote stream delivering compressed packets.
pub trait PacketReader: Send {
    /// Connect and probe the stream.
    fn open(&mut self) -> LinkResult<StreamInfo>;

    /// Read the next packet, waiting at most `timeout`.
    fn read_packet(&mut self, timeout: Duration) -> LinkResult<Incoming<EncodedPacket>>;

    /// Disconnect. Safe to call when not open.
    fn close(&mut self);
}

/// A remote stream accepting compressed packets.
pub trait PacketWriter: Send {
    /// Connect and write the stream header for `info`.
    fn open(&mut self, info: &StreamInfo) -> LinkResult<()>;

    /// Send one packet. Timestamps are in the writer's time base.
    fn write_packet(&mut self, packet: &EncodedPacket) -> LinkResult<()>;

    /// Finalize the stream (trailer). Called before `close` on clean shutdown.
    fn finish(&mut self) -> LinkResult<()>;

    /// Disconnect. Safe to call when not open.
    fn close(&mut self);
}

/// Whether a device captures or plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceDirection {
    Input,
    Output,
}

/// Enumerated device description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Position in the enumeration, used for interactive selection.
    pub index: usize,

    /// Backend device name.
    pub name: String,

    /// Capture or playback.
    pub direction: DeviceDirection,

    /// Media kind handled.
    pub kind: MediaKind,

    /// Maximum channel count (audio); zero for video.
    pub max_channels: u16,

    /// Formats the device reports as supported.
    pub formats: Vec<MediaFormat>,

    /// Whether this is the system default device.
    pub is_default: bool,
}
