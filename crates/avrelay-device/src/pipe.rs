//! Raw media over pipes: standard streams, files and child processes.
//!
//! Pipes cannot negotiate a format, so the stream must already be in the
//! requested layout (e.g. `arecord -f S16_LE -c 2 -r 48000 -t raw`).

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use avrelay_types::{
    CaptureDevice, DeviceError, DeviceResult, Incoming, MediaFormat, MediaFrame, PlaybackDevice,
};
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace, warn};

use crate::PIPE_CHANNEL_CAPACITY;

/// Where a pipe reads from or writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeEndpoint {
    /// Standard input (capture) or standard output (playback).
    Stdio,

    /// A file or device node.
    File(PathBuf),

    /// A child process: program followed by its arguments.
    Command(Vec<String>),
}

impl PipeEndpoint {
    /// Short display name.
    pub fn describe(&self) -> String {
        match self {
            Self::Stdio => "stdio".to_string(),
            Self::File(path) => path.display().to_string(),
            Self::Command(args) => args.join(" "),
        }
    }
}

fn spawn(args: &[String], capture: bool) -> DeviceResult<Child> {
    let (program, rest) = args
        .split_first()
        .ok_or_else(|| DeviceError::NotFound("empty command".to_string()))?;

    let mut command = Command::new(program);
    command.args(rest).stderr(Stdio::null());
    if capture {
        command.stdout(Stdio::piped()).stdin(Stdio::null());
    } else {
        command.stdin(Stdio::piped()).stdout(Stdio::null());
    }

    command.spawn().map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => DeviceError::NotFound(program.clone()),
        _ => DeviceError::Io(e),
    })
}

fn stop_child(child: &mut Child) {
    if let Err(e) = child.kill() {
        trace!("Child already exited: {}", e);
    }
    let _ = child.wait();
}

/// Capture device reading raw bytes from a pipe.
pub struct PipeCapture {
    name: String,
    endpoint: PipeEndpoint,
    child: Mutex<Option<Child>>,
    reader_thread: Option<JoinHandle<()>>,
    receiver: Option<Receiver<io::Result<Bytes>>>,
    should_stop: Arc<AtomicBool>,
}

impl PipeCapture {
    /// Create a capture device for `endpoint`.
    pub fn new(endpoint: PipeEndpoint) -> Self {
        Self {
            name: format!("pipe:{}", endpoint.describe()),
            endpoint,
            child: Mutex::new(None),
            reader_thread: None,
            receiver: None,
            should_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Override the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl CaptureDevice for PipeCapture {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(name = "pipe_capture_open", skip(self), fields(device = %self.name))]
    fn open(&mut self, format: &MediaFormat) -> DeviceResult<MediaFormat> {
        self.close();

        let source: Box<dyn Read + Send> = match &self.endpoint {
            PipeEndpoint::Stdio => Box::new(io::stdin()),
            PipeEndpoint::File(path) => Box::new(File::open(path).map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => DeviceError::NotFound(path.display().to_string()),
                _ => DeviceError::Io(e),
            })?),
            PipeEndpoint::Command(args) => {
                let mut child = spawn(args, true)?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| DeviceError::Backend("child has no stdout".to_string()))?;
                *self.child.lock() = Some(child);
                Box::new(stdout)
            }
        };

        let (sender, receiver) = crossbeam_channel::bounded(PIPE_CHANNEL_CAPACITY);
        let should_stop = Arc::clone(&self.should_stop);
        should_stop.store(false, Ordering::SeqCst);

        // Whole pictures for video, about 10 ms for audio.
        let chunk_size = match format {
            MediaFormat::Video(v) => v.picture_size(),
            MediaFormat::Audio(a) => (a.bytes_per_frame() * (a.sample_rate as usize / 100)).max(64),
        };

        let handle = thread::Builder::new()
            .name("pipe-capture".into())
            .spawn(move || reader_thread(source, chunk_size, sender, should_stop))?;

        self.reader_thread = Some(handle);
        self.receiver = Some(receiver);

        info!(format = %format, "Pipe capture opened");
        Ok(*format)
    }

    fn read(&mut self, timeout: Duration) -> DeviceResult<Incoming<Bytes>> {
        let receiver = self.receiver.as_ref().ok_or(DeviceError::NotOpen)?;
        match receiver.recv_timeout(timeout) {
            Ok(Ok(bytes)) => Ok(Incoming::Data(bytes)),
            Ok(Err(e)) => Err(DeviceError::Io(e)),
            Err(RecvTimeoutError::Timeout) => Ok(Incoming::Timeout),
            Err(RecvTimeoutError::Disconnected) => Ok(Incoming::End),
        }
    }

    fn close(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);
        self.receiver = None;

        let had_child = match self.child.lock().take() {
            Some(mut child) => {
                stop_child(&mut child);
                true
            }
            None => false,
        };

        if let Some(handle) = self.reader_thread.take() {
            // A killed child closes its stdout, so the reader returns. Reads
            // from stdin or a FIFO may block indefinitely and are left behind.
            if had_child {
                let _ = handle.join();
            }
            debug!("Pipe capture closed");
        }
    }
}

impl Drop for PipeCapture {
    fn drop(&mut self) {
        self.close();
    }
}

fn reader_thread(
    mut source: Box<dyn Read + Send>,
    chunk_size: usize,
    sender: Sender<io::Result<Bytes>>,
    should_stop: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; chunk_size];

    while !should_stop.load(Ordering::SeqCst) {
        let message = match source.read(&mut buf) {
            Ok(0) => {
                debug!("Pipe reached end of stream");
                break;
            }
            Ok(n) => Ok(Bytes::copy_from_slice(&buf[..n])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => Err(e),
        };

        let failed = message.is_err();
        if sender.send(message).is_err() || failed {
            break;
        }
    }
}

/// Playback device writing raw bytes to a pipe.
pub struct PipePlayback {
    name: String,
    endpoint: PipeEndpoint,
    child: Option<Child>,
    writer: Option<Box<dyn Write + Send>>,
}

impl PipePlayback {
    /// Create a playback device for `endpoint`.
    pub fn new(endpoint: PipeEndpoint) -> Self {
        Self {
            name: format!("pipe:{}", endpoint.describe()),
            endpoint,
            child: None,
            writer: None,
        }
    }

    /// Override the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl PlaybackDevice for PipePlayback {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(name = "pipe_playback_open", skip(self), fields(device = %self.name))]
    fn open(&mut self, format: &MediaFormat) -> DeviceResult<()> {
        self.close();

        let writer: Box<dyn Write + Send> = match &self.endpoint {
            PipeEndpoint::Stdio => Box::new(io::stdout()),
            PipeEndpoint::File(path) => Box::new(
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)?,
            ),
            PipeEndpoint::Command(args) => {
                let mut child = spawn(args, false)?;
                let stdin: ChildStdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| DeviceError::Backend("child has no stdin".to_string()))?;
                self.child = Some(child);
                Box::new(stdin)
            }
        };

        self.writer = Some(writer);
        info!(format = %format, "Pipe playback opened");
        Ok(())
    }

    fn write(&mut self, frame: &MediaFrame) -> DeviceResult<()> {
        let writer = self.writer.as_mut().ok_or(DeviceError::NotOpen)?;
        writer.write_all(frame.payload()).map_err(|e| match e.kind() {
            io::ErrorKind::BrokenPipe => DeviceError::Disconnected(self.name.clone()),
            _ => DeviceError::Io(e),
        })
    }

    fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                warn!("Failed to flush pipe: {}", e);
            }
        }
        if let Some(mut child) = self.child.take() {
            stop_child(&mut child);
            debug!("Pipe playback closed");
        }
    }
}

impl Drop for PipePlayback {
    fn drop(&mut self) {
        self.close();
    }
}
