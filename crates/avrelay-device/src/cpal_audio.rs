//! Sound cards through cpal.
//!
//! cpal streams are not `Send`, so each open device owns a thread that builds
//! the stream, keeps it alive and drops it when told to stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use avrelay_convert::{decode_samples, encode_samples};
use avrelay_types::{
    AudioFormat, CaptureDevice, DeviceDirection, DeviceError, DeviceInfo, DeviceResult, Incoming,
    MediaFormat, MediaFrame, MediaKind, PlaybackDevice, SampleFormat,
};
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::CPAL_CHANNEL_CAPACITY;

fn find_device(direction: DeviceDirection, name: Option<&str>) -> DeviceResult<cpal::Device> {
    let host = cpal::default_host();

    let Some(name) = name else {
        let device = match direction {
            DeviceDirection::Input => host.default_input_device(),
            DeviceDirection::Output => host.default_output_device(),
        };
        return device.ok_or_else(|| DeviceError::NotFound("default device".to_string()));
    };

    let devices = match direction {
        DeviceDirection::Input => host.input_devices(),
        DeviceDirection::Output => host.output_devices(),
    }
    .map_err(|e| DeviceError::Backend(e.to_string()))?;

    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }
    Err(DeviceError::NotFound(name.to_string()))
}

/// Pick a supported stream configuration carrying `format`'s channels and rate.
fn find_config(
    device: &cpal::Device,
    direction: DeviceDirection,
    format: &AudioFormat,
) -> DeviceResult<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = match direction {
        DeviceDirection::Input => device
            .supported_input_configs()
            .map_err(|e| DeviceError::Backend(e.to_string()))?
            .collect(),
        DeviceDirection::Output => device
            .supported_output_configs()
            .map_err(|e| DeviceError::Backend(e.to_string()))?
            .collect(),
    };

    ranges
        .into_iter()
        .filter(|r| {
            r.channels() == format.channels
                && r.min_sample_rate().0 <= format.sample_rate
                && r.max_sample_rate().0 >= format.sample_rate
        })
        .max_by_key(|r| r.sample_format() == cpal::SampleFormat::F32)
        .map(|r| r.with_sample_rate(cpal::SampleRate(format.sample_rate)))
        .ok_or_else(|| {
            DeviceError::Unsupported(format!(
                "{} channels at {} Hz",
                format.channels, format.sample_rate
            ))
        })
}

fn map_sample_format(format: cpal::SampleFormat) -> Option<SampleFormat> {
    match format {
        cpal::SampleFormat::U8 => Some(SampleFormat::U8),
        cpal::SampleFormat::I16 => Some(SampleFormat::S16),
        cpal::SampleFormat::I32 => Some(SampleFormat::S32),
        cpal::SampleFormat::F32 => Some(SampleFormat::F32),
        _ => None,
    }
}

/// Stream thread handle shared by capture and playback.
struct StreamThread {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl StreamThread {
    /// Spawn a thread that builds a stream with `build` and holds it until stopped.
    fn spawn<F>(name: &str, build: F) -> DeviceResult<Self>
    where
        F: FnOnce() -> DeviceResult<cpal::Stream> + Send + 'static,
    {
        let (stop, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<DeviceResult<()>>(1);

        let handle = thread::Builder::new().name(name.into()).spawn(move || {
            let stream = match build().and_then(|stream| {
                stream
                    .play()
                    .map_err(|e| DeviceError::Backend(e.to_string()))?;
                Ok(stream)
            }) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            // Returns on stop or when the owner is dropped.
            let _ = stop_rx.recv();
            drop(stream);
        })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { stop, handle }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => Err(DeviceError::Backend("stream thread exited".to_string())),
        }
    }

    fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.handle.join();
    }
}

fn build_error(e: cpal::BuildStreamError) -> DeviceError {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => {
            DeviceError::Disconnected("device not available".to_string())
        }
        cpal::BuildStreamError::StreamConfigNotSupported => {
            DeviceError::Unsupported("stream config".to_string())
        }
        other => DeviceError::Backend(other.to_string()),
    }
}

/// Sound card input.
pub struct CpalCapture {
    selector: Option<String>,
    name: String,
    receiver: Option<Receiver<Bytes>>,
    failed: Arc<AtomicBool>,
    stream: Option<StreamThread>,
}

impl CpalCapture {
    /// Capture from the named device, or the default input when `None`.
    pub fn new(selector: Option<String>) -> Self {
        let name = selector.clone().unwrap_or_else(|| "default".to_string());
        Self {
            selector,
            name,
            receiver: None,
            failed: Arc::new(AtomicBool::new(false)),
            stream: None,
        }
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    target: SampleFormat,
    sender: Sender<Bytes>,
    failed: Arc<AtomicBool>,
) -> DeviceResult<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|&s| f32::from_sample(s)).collect();
                let bytes = Bytes::from(encode_samples(&samples, target, channels));
                if let Err(TrySendError::Full(_)) = sender.try_send(bytes) {
                    trace!("Capture channel full, dropping chunk");
                }
            },
            move |err| {
                error!("Audio input stream error: {}", err);
                failed.store(true, Ordering::SeqCst);
            },
            None,
        )
        .map_err(build_error)
}

impl CaptureDevice for CpalCapture {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(name = "cpal_capture_open", skip(self), fields(device = %self.name))]
    fn open(&mut self, format: &MediaFormat) -> DeviceResult<MediaFormat> {
        self.close();

        let audio = *format
            .as_audio()
            .ok_or_else(|| DeviceError::Unsupported(format!("{format} from a sound card")))?;

        let device = find_device(DeviceDirection::Input, self.selector.as_deref())?;
        let supported = find_config(&device, DeviceDirection::Input, &audio)?;
        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();

        info!(
            "Audio input: {:?} ({} Hz, {} ch, {:?})",
            device.name().unwrap_or_default(),
            config.sample_rate.0,
            config.channels,
            sample_format,
        );

        let (sender, receiver) = crossbeam_channel::bounded(CPAL_CHANNEL_CAPACITY);
        self.failed.store(false, Ordering::SeqCst);
        let failed = Arc::clone(&self.failed);
        let target = audio.sample_format;

        let stream = StreamThread::spawn("cpal-capture", move || match sample_format {
            cpal::SampleFormat::F32 => build_input::<f32>(&device, &config, target, sender, failed),
            cpal::SampleFormat::I16 => build_input::<i16>(&device, &config, target, sender, failed),
            cpal::SampleFormat::I32 => build_input::<i32>(&device, &config, target, sender, failed),
            cpal::SampleFormat::U8 => build_input::<u8>(&device, &config, target, sender, failed),
            other => Err(DeviceError::Unsupported(format!("sample format {other:?}"))),
        })?;

        self.stream = Some(stream);
        self.receiver = Some(receiver);
        Ok(*format)
    }

    fn read(&mut self, timeout: Duration) -> DeviceResult<Incoming<Bytes>> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(DeviceError::Disconnected(self.name.clone()));
        }
        let receiver = self.receiver.as_ref().ok_or(DeviceError::NotOpen)?;
        match receiver.recv_timeout(timeout) {
            Ok(bytes) => Ok(Incoming::Data(bytes)),
            Err(RecvTimeoutError::Timeout) => Ok(Incoming::Timeout),
            Err(RecvTimeoutError::Disconnected) => Ok(Incoming::End),
        }
    }

    fn close(&mut self) {
        self.receiver = None;
        if let Some(stream) = self.stream.take() {
            stream.stop();
            debug!("Audio input closed");
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sound card output.
pub struct CpalPlayback {
    selector: Option<String>,
    name: String,
    format: Option<AudioFormat>,
    sender: Option<Sender<Vec<f32>>>,
    failed: Arc<AtomicBool>,
    stream: Option<StreamThread>,
}

impl CpalPlayback {
    /// Play to the named device, or the default output when `None`.
    pub fn new(selector: Option<String>) -> Self {
        let name = selector.clone().unwrap_or_else(|| "default".to_string());
        Self {
            selector,
            name,
            format: None,
            sender: None,
            failed: Arc::new(AtomicBool::new(false)),
            stream: None,
        }
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    receiver: Receiver<Vec<f32>>,
    failed: Arc<AtomicBool>,
) -> DeviceResult<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let mut pending: Vec<f32> = Vec::new();
    let mut pos = 0usize;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                for slot in data.iter_mut() {
                    if pos >= pending.len() {
                        match receiver.try_recv() {
                            Ok(next) => {
                                pending = next;
                                pos = 0;
                            }
                            Err(_) => {
                                *slot = T::EQUILIBRIUM;
                                continue;
                            }
                        }
                    }
                    *slot = T::from_sample(pending[pos]);
                    pos += 1;
                }
            },
            move |err| {
                error!("Audio output stream error: {}", err);
                failed.store(true, Ordering::SeqCst);
            },
            None,
        )
        .map_err(build_error)
}

impl PlaybackDevice for CpalPlayback {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(name = "cpal_playback_open", skip(self), fields(device = %self.name))]
    fn open(&mut self, format: &MediaFormat) -> DeviceResult<()> {
        self.close();

        let audio = *format
            .as_audio()
            .ok_or_else(|| DeviceError::Unsupported(format!("{format} to a sound card")))?;

        let device = find_device(DeviceDirection::Output, self.selector.as_deref())?;
        let supported = find_config(&device, DeviceDirection::Output, &audio)?;
        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();

        info!(
            "Audio output: {:?} ({} Hz, {} ch, {:?})",
            device.name().unwrap_or_default(),
            config.sample_rate.0,
            config.channels,
            sample_format,
        );

        let (sender, receiver) = crossbeam_channel::bounded(CPAL_CHANNEL_CAPACITY);
        self.failed.store(false, Ordering::SeqCst);
        let failed = Arc::clone(&self.failed);

        let stream = StreamThread::spawn("cpal-playback", move || match sample_format {
            cpal::SampleFormat::F32 => build_output::<f32>(&device, &config, receiver, failed),
            cpal::SampleFormat::I16 => build_output::<i16>(&device, &config, receiver, failed),
            cpal::SampleFormat::I32 => build_output::<i32>(&device, &config, receiver, failed),
            cpal::SampleFormat::U8 => build_output::<u8>(&device, &config, receiver, failed),
            other => Err(DeviceError::Unsupported(format!("sample format {other:?}"))),
        })?;

        self.stream = Some(stream);
        self.sender = Some(sender);
        self.format = Some(audio);
        Ok(())
    }

    fn write(&mut self, frame: &MediaFrame) -> DeviceResult<()> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(DeviceError::Disconnected(self.name.clone()));
        }
        let (Some(sender), Some(format)) = (self.sender.as_ref(), self.format) else {
            return Err(DeviceError::NotOpen);
        };

        let samples = decode_samples(
            frame.payload(),
            format.sample_format,
            format.channels as usize,
        );
        // Blocks while the device is behind.
        sender
            .send(samples)
            .map_err(|_| DeviceError::Disconnected(self.name.clone()))
    }

    fn close(&mut self) {
        self.sender = None;
        self.format = None;
        if let Some(stream) = self.stream.take() {
            stream.stop();
            debug!("Audio output closed");
        }
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.close();
    }
}

/// Enumerate sound cards in one direction.
pub(crate) fn list(direction: DeviceDirection) -> Vec<DeviceInfo> {
    let host = cpal::default_host();
    let default_name = match direction {
        DeviceDirection::Input => host.default_input_device(),
        DeviceDirection::Output => host.default_output_device(),
    }
    .and_then(|d| d.name().ok());

    let devices = match direction {
        DeviceDirection::Input => host.input_devices(),
        DeviceDirection::Output => host.output_devices(),
    };
    let devices = match devices {
        Ok(devices) => devices,
        Err(e) => {
            warn!("Failed to enumerate audio devices: {}", e);
            return Vec::new();
        }
    };

    let mut infos = Vec::new();
    for device in devices {
        let Ok(name) = device.name() else {
            continue;
        };

        let ranges: Vec<cpal::SupportedStreamConfigRange> = match direction {
            DeviceDirection::Input => device
                .supported_input_configs()
                .map(|c| c.collect())
                .unwrap_or_default(),
            DeviceDirection::Output => device
                .supported_output_configs()
                .map(|c| c.collect())
                .unwrap_or_default(),
        };

        let formats: Vec<MediaFormat> = ranges
            .iter()
            .filter_map(|r| {
                let sample_format = map_sample_format(r.sample_format())?;
                let rate = 48000.clamp(r.min_sample_rate().0, r.max_sample_rate().0);
                Some(MediaFormat::Audio(AudioFormat::new(
                    sample_format,
                    r.channels(),
                    rate,
                )))
            })
            .collect();

        infos.push(DeviceInfo {
            index: 0,
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            direction,
            kind: MediaKind::Audio,
            max_channels: ranges.iter().map(|r| r.channels()).max().unwrap_or(0),
            formats,
        });
    }
    infos
}
