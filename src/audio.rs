//! Audio capture and sample processing
//!
//! This module handles:
//! - Microphone device detection (platform-specific)
//! - The frame source the capture session reads from
//! - Sample rate conversion (resampling to 16kHz for Whisper)
//! - The finalized [`AudioBuffer`] handed to transcription

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::Sample;
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;

use crate::vad::samples_to_duration;
use crate::{Error, Result};

pub const WHISPER_SAMPLE_RATE: u32 = 16000;

/// Frames buffered between the device callback and the capture worker
const FRAME_QUEUE_DEPTH: usize = 256;

/// Finalized mono recording. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples.len() as u64, self.sample_rate)
    }

    /// Largest absolute sample value
    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0_f32, |peak, s| peak.max(s.abs()))
    }

    /// Scale so the peak reaches full scale. Silent buffers are returned as is.
    pub fn normalized(self) -> Self {
        let peak = self.peak();
        if peak <= f32::EPSILON {
            return self;
        }
        let gain = 1.0 / peak;
        Self {
            samples: self.samples.into_iter().map(|s| (s * gain).clamp(-1.0, 1.0)).collect(),
            sample_rate: self.sample_rate,
        }
    }

    /// Samples at Whisper's rate
    pub fn to_whisper_rate(&self) -> Result<Vec<f32>> {
        resample_audio(&self.samples, self.sample_rate, WHISPER_SAMPLE_RATE)
    }
}

/// Outcome of waiting for the next frame
#[derive(Debug, Clone, PartialEq)]
pub enum FrameRead {
    Frame(Vec<f32>),
    /// Nothing arrived within the wait
    Timeout,
    /// The source is gone and will not deliver more frames
    Closed,
}

/// Live source of fixed-size mono frames
pub trait FrameSource {
    fn sample_rate(&self) -> u32;
    fn next_frame(&mut self, wait: Duration) -> FrameRead;

    /// Frames lost because the reader fell behind
    fn dropped_frames(&self) -> usize {
        0
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn sample_rate(&self) -> u32 {
        (**self).sample_rate()
    }

    fn next_frame(&mut self, wait: Duration) -> FrameRead {
        (**self).next_frame(wait)
    }

    fn dropped_frames(&self) -> usize {
        (**self).dropped_frames()
    }
}

/// Check if a device name looks like a microphone (Linux)
#[cfg(target_os = "linux")]
pub fn is_microphone(name: &str) -> bool {
    name.contains("Microphone") && name.contains("CARD")
}

/// Check if a device name looks like a microphone (Windows)
#[cfg(target_os = "windows")]
pub fn is_microphone(name: &str) -> bool {
    name.to_lowercase().contains("microphone")
}

/// Check if a device name looks like a microphone (macOS)
#[cfg(target_os = "macos")]
pub fn is_microphone(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.contains("microphone") || lower.contains("input") || lower.contains("mic")
}

/// Check if a device name looks like a microphone (other platforms)
#[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
pub fn is_microphone(_name: &str) -> bool {
    true
}

/// Pick the configured device (partial name match), else something that
/// looks like a microphone, else the default input.
pub fn select_device(host: &cpal::Host, wanted: &str) -> Result<cpal::Device> {
    let devices = host
        .input_devices()
        .map_err(|e| Error::Audio(e.to_string()))?
        .collect::<Vec<_>>();

    let by_name = |pred: &dyn Fn(&str) -> bool| {
        devices
            .iter()
            .find(|d| d.name().map(|n| pred(&n)).unwrap_or(false))
            .cloned()
    };

    let device = if !wanted.is_empty() {
        by_name(&|n: &str| n.contains(wanted)).or_else(|| {
            tracing::warn!(device = wanted, "configured device not found, using default");
            host.default_input_device()
        })
    } else {
        by_name(&is_microphone).or_else(|| host.default_input_device())
    };

    device.ok_or_else(|| Error::Audio("no input device available".to_string()))
}

/// Microphone stream delivering mono frames. Owns the device stream; dropping
/// it closes the device.
pub struct MicrophoneSource {
    _stream: cpal::Stream,
    frames: Receiver<Vec<f32>>,
    sample_rate: u32,
    dropped: Arc<AtomicUsize>,
}

impl MicrophoneSource {
    /// Open the device and start streaming frames of `frame_ms` milliseconds.
    pub fn open(device_name: &str, frame_ms: u64) -> Result<Self> {
        let host = cpal::default_host();
        let device = select_device(&host, device_name)?;
        let audio_config = device
            .default_input_config()
            .map_err(|e| Error::Audio(e.to_string()))?;

        let sample_rate = audio_config.sample_rate().0;
        let channels = usize::from(audio_config.channels());
        let frame_len = ((u64::from(sample_rate) * frame_ms) / 1000).max(1) as usize;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            channels,
            frame_len,
            "opening microphone"
        );

        let (tx, rx) = mpsc::sync_channel(FRAME_QUEUE_DEPTH);
        let dropped = Arc::new(AtomicUsize::new(0));
        let shape = FrameShape { channels, frame_len };
        let stream_config: cpal::StreamConfig = audio_config.clone().into();

        let stream = match audio_config.sample_format() {
            cpal::SampleFormat::I8 => build_stream::<i8>(&device, &stream_config, shape, tx, dropped.clone())?,
            cpal::SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, shape, tx, dropped.clone())?,
            cpal::SampleFormat::I32 => build_stream::<i32>(&device, &stream_config, shape, tx, dropped.clone())?,
            cpal::SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, shape, tx, dropped.clone())?,
            format => {
                return Err(Error::Audio(format!("unsupported sample format: {format:?}")));
            }
        };
        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            frames: rx,
            sample_rate,
            dropped,
        })
    }
}

impl FrameSource for MicrophoneSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn next_frame(&mut self, wait: Duration) -> FrameRead {
        match self.frames.recv_timeout(wait) {
            Ok(frame) => FrameRead::Frame(frame),
            Err(RecvTimeoutError::Timeout) => FrameRead::Timeout,
            Err(RecvTimeoutError::Disconnected) => FrameRead::Closed,
        }
    }

    fn dropped_frames(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Copy)]
struct FrameShape {
    channels: usize,
    frame_len: usize,
}

/// Build an input stream that down-mixes to mono and emits fixed-size frames
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shape: FrameShape,
    frames: SyncSender<Vec<f32>>,
    dropped: Arc<AtomicUsize>,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    let mut pending: Vec<f32> = Vec::with_capacity(shape.frame_len);

    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                for chunk in data.chunks(shape.channels) {
                    let sum: f32 = chunk.iter().map(|&s| <f32 as Sample>::from_sample(s)).sum();
                    pending.push(sum / shape.channels as f32);

                    if pending.len() == shape.frame_len {
                        let frame = std::mem::replace(&mut pending, Vec::with_capacity(shape.frame_len));
                        match frames.try_send(frame) {
                            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                            Err(TrySendError::Full(_)) => {
                                dropped.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                }
            },
            |err| tracing::error!(error = %err, "audio stream error"),
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;
    Ok(stream)
}

/// Resample audio from one sample rate to another
pub fn resample_audio(input: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || input.is_empty() {
        return Ok(input.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, input.len(), 1)
        .map_err(|e| Error::Audio(format!("resampler setup: {e}")))?;

    let waves_in = vec![input.to_vec()];
    let waves_out = resampler
        .process(&waves_in, None)
        .map_err(|e| Error::Audio(format!("resample: {e}")))?;

    Ok(waves_out.into_iter().next().unwrap_or_default())
}
