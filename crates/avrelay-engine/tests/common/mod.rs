#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use avrelay_engine::{Pipeline, PipelineResult};
use avrelay_types::{
    AudioFormat, CaptureDevice, CodecId, DeviceError, DeviceResult, EncodedPacket, Incoming,
    LinkError, LinkResult, MediaFormat, MediaFrame, PacketReader, PacketWriter, PipelineConfig,
    PipelineEvent, PlaybackDevice, RetryPolicy, SampleFormat, StreamInfo, TimeBase,
};
use bytes::Bytes;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;

/// 1024 stereo S16 samples.
pub const CHUNK_BYTES: usize = 4096;

pub fn stereo() -> AudioFormat {
    AudioFormat::new(SampleFormat::S16, 2, 48000)
}

pub fn publish_config() -> PipelineConfig {
    let mut config = PipelineConfig::audio_publish("rtmp://127.0.0.1/live/test", stereo(), CodecId::Pcm);
    config.retry = RetryPolicy::fixed(Duration::from_millis(10));
    config.read_timeout_ms = 20;
    config.idle_timeout_ms = 200;
    config
}

pub fn play_config() -> PipelineConfig {
    let mut config = PipelineConfig::audio_play("rtmp://127.0.0.1/live/test", stereo(), CodecId::Pcm);
    config.retry = RetryPolicy::fixed(Duration::from_millis(10));
    config.read_timeout_ms = 20;
    config.idle_timeout_ms = 200;
    config
}

/// How a capture session misbehaves.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    None,
    /// Report a disconnect after this many reads.
    FailAfter(usize),
    /// Stop delivering data after this many reads.
    SilentAfter(usize),
}

#[derive(Debug, Default)]
pub struct CaptureLog {
    pub opens: usize,
    pub open_times: Vec<Instant>,
    pub closes: usize,
    pub reads: usize,
}

pub struct MockCapture {
    pub log: Arc<Mutex<CaptureLog>>,
    open_errors: VecDeque<DeviceError>,
    scripted_errors: HashMap<usize, DeviceError>,
    open_attempts: usize,
    fault: Fault,
    faulty_sessions: usize,
    faulty: bool,
    session_reads: usize,
}

impl MockCapture {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(CaptureLog::default())),
            open_errors: VecDeque::new(),
            scripted_errors: HashMap::new(),
            open_attempts: 0,
            fault: Fault::None,
            faulty_sessions: 0,
            faulty: false,
            session_reads: 0,
        }
    }

    pub fn failing_open(mut self, error: DeviceError) -> Self {
        self.open_errors.push_back(error);
        self
    }

    /// Fail the `attempt`-th open (1-based) with `error`.
    pub fn failing_open_at(mut self, attempt: usize, error: DeviceError) -> Self {
        self.scripted_errors.insert(attempt, error);
        self
    }

    /// Apply `fault` to the first `sessions` sessions.
    pub fn with_fault(mut self, fault: Fault, sessions: usize) -> Self {
        self.fault = fault;
        self.faulty_sessions = sessions;
        self
    }
}

impl CaptureDevice for MockCapture {
    fn name(&self) -> &str {
        "mock-capture"
    }

    fn open(&mut self, format: &MediaFormat) -> DeviceResult<MediaFormat> {
        self.open_attempts += 1;
        if let Some(error) = self.scripted_errors.remove(&self.open_attempts) {
            return Err(error);
        }
        if let Some(error) = self.open_errors.pop_front() {
            return Err(error);
        }
        let mut log = self.log.lock();
        log.opens += 1;
        log.open_times.push(Instant::now());
        drop(log);
        self.faulty = self.faulty_sessions > 0;
        if self.faulty {
            self.faulty_sessions -= 1;
        }
        self.session_reads = 0;
        Ok(*format)
    }

    fn read(&mut self, timeout: Duration) -> DeviceResult<Incoming<Bytes>> {
        self.session_reads += 1;
        self.log.lock().reads += 1;

        if self.faulty {
            match self.fault {
                Fault::FailAfter(reads) if self.session_reads > reads => {
                    return Err(DeviceError::Disconnected("mock unplugged".into()));
                }
                Fault::SilentAfter(reads) if self.session_reads > reads => {
                    thread::sleep(timeout.min(Duration::from_millis(5)));
                    return Ok(Incoming::Timeout);
                }
                _ => {}
            }
        }

        thread::sleep(Duration::from_millis(1));
        Ok(Incoming::Data(Bytes::from(vec![0u8; CHUNK_BYTES])))
    }

    fn close(&mut self) {
        self.log.lock().closes += 1;
    }
}

#[derive(Debug, Default)]
pub struct WriterLog {
    pub opens: usize,
    pub finishes: usize,
    pub closes: usize,
    pub dts: Vec<i64>,
    pub time_bases: Vec<TimeBase>,
}

pub struct MockWriter {
    pub log: Arc<Mutex<WriterLog>>,
    refusals: usize,
    write_delay: Duration,
}

impl MockWriter {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(WriterLog::default())),
            refusals: 0,
            write_delay: Duration::ZERO,
        }
    }

    /// Refuse the next `count` connection attempts.
    pub fn refusing(mut self, count: usize) -> Self {
        self.refusals = count;
        self
    }

    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }
}

impl PacketWriter for MockWriter {
    fn open(&mut self, _info: &StreamInfo) -> LinkResult<()> {
        if self.refusals > 0 {
            self.refusals -= 1;
            return Err(LinkError::Connect("connection refused".into()));
        }
        self.log.lock().opens += 1;
        Ok(())
    }

    fn write_packet(&mut self, packet: &EncodedPacket) -> LinkResult<()> {
        if !self.write_delay.is_zero() {
            thread::sleep(self.write_delay);
        }
        let mut log = self.log.lock();
        log.dts.push(packet.dts);
        log.time_bases.push(packet.time_base);
        Ok(())
    }

    fn finish(&mut self) -> LinkResult<()> {
        self.log.lock().finishes += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.log.lock().closes += 1;
    }
}

/// Remote PCM stream delivering one packet per millisecond.
pub struct MockReader {
    pub opens: Arc<Mutex<usize>>,
    dts: i64,
}

impl MockReader {
    pub fn new() -> Self {
        Self {
            opens: Arc::new(Mutex::new(0)),
            dts: 0,
        }
    }
}

impl PacketReader for MockReader {
    fn open(&mut self) -> LinkResult<StreamInfo> {
        *self.opens.lock() += 1;
        self.dts = 0;
        Ok(StreamInfo::new(CodecId::Pcm, stereo().into(), TimeBase::MILLIS))
    }

    fn read_packet(&mut self, _timeout: Duration) -> LinkResult<Incoming<EncodedPacket>> {
        thread::sleep(Duration::from_millis(1));
        let packet = EncodedPacket::new(vec![0u8; CHUNK_BYTES], self.dts, TimeBase::MILLIS)
            .with_keyframe(true);
        self.dts += 21;
        Ok(Incoming::Data(packet))
    }

    fn close(&mut self) {}
}

#[derive(Debug, Default)]
pub struct PlaybackLog {
    pub opens: usize,
    pub closes: usize,
    pub frames: usize,
    pub bytes: usize,
    pub formats: Vec<MediaFormat>,
}

pub struct MockPlayback {
    pub log: Arc<Mutex<PlaybackLog>>,
}

impl MockPlayback {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(PlaybackLog::default())),
        }
    }
}

impl PlaybackDevice for MockPlayback {
    fn name(&self) -> &str {
        "mock-playback"
    }

    fn open(&mut self, _format: &MediaFormat) -> DeviceResult<()> {
        self.log.lock().opens += 1;
        Ok(())
    }

    fn write(&mut self, frame: &MediaFrame) -> DeviceResult<()> {
        let mut log = self.log.lock();
        log.frames += 1;
        log.bytes += frame.len();
        log.formats.push(*frame.format());
        Ok(())
    }

    fn close(&mut self) {
        self.log.lock().closes += 1;
    }
}

/// Run the pipeline on its own thread, handing it back when it stops.
pub fn spawn(mut pipeline: Pipeline) -> JoinHandle<(Pipeline, PipelineResult<()>)> {
    thread::spawn(move || {
        let result = pipeline.run();
        (pipeline, result)
    })
}

/// Wait for the first event matching `predicate`, collecting everything seen.
pub fn wait_for(
    events: &Receiver<PipelineEvent>,
    seen: &mut Vec<PipelineEvent>,
    timeout: Duration,
    predicate: impl Fn(&PipelineEvent) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(event) => {
                let matched = predicate(&event);
                seen.push(event);
                if matched {
                    return true;
                }
            }
            Err(_) => return false,
        }
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
