//! Voice capture state machine
//!
//! A session records until the speaker goes quiet, with a hard cap as a
//! safety net:
//! - Idle: nothing recording
//! - Recording: frames accumulate, the detector tracks silence
//! - Finalizing: recording ended, buffer is checked
//! - Rejected: too short or too quiet, nothing is transcribed
//! - Ready: buffer normalized and handed to transcription
//!
//! Rejected and Ready both fall back to Idle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::audio::{AudioBuffer, FrameRead, FrameSource};
use crate::config::CaptureConfig;
use crate::transcribe::{transcribe_with_timeout, Transcriber, TranscriptionOutcome};
use crate::vad::VoiceActivityDetector;
use crate::Result;

/// How long the runner waits for a frame before re-checking abort and the
/// wall clock
const FRAME_WAIT: Duration = Duration::from_millis(100);

/// Extra wall-clock time allowed past the hard cap before the runner gives
/// up on a device that stopped delivering frames
const WALL_CLOCK_GRACE: Duration = Duration::from_secs(1);

/// Peak amplitude treated as digital silence
const SILENT_PEAK: f32 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Recording,
    Finalizing,
    Rejected,
    Ready,
}

impl CaptureState {
    pub fn label(self) -> &'static str {
        match self {
            CaptureState::Idle => "idle",
            CaptureState::Recording => "recording",
            CaptureState::Finalizing => "finalizing",
            CaptureState::Rejected => "rejected",
            CaptureState::Ready => "ready",
        }
    }
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Thresholds that end a recording
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSettings {
    pub silence: Duration,
    pub min_duration: Duration,
    pub hard_cap: Duration,
    pub rms_threshold: f32,
    pub frame_ms: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self::from(&CaptureConfig::default())
    }
}

impl From<&CaptureConfig> for CaptureSettings {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            silence: Duration::from_millis(config.silence_ms),
            min_duration: Duration::from_millis(config.min_duration_ms),
            hard_cap: Duration::from_secs(config.hard_cap_secs),
            rms_threshold: config.rms_threshold,
            frame_ms: config.frame_ms,
        }
    }
}

/// Why recording stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Enough silence after enough recording
    Silence,
    /// Hit the hard cap
    HardCap,
    /// The frame source closed
    SourceClosed,
}

/// Why a finalized recording was not transcribed
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureRejected {
    TooShort { duration: Duration },
    TooQuiet { peak: f32 },
}

impl fmt::Display for CaptureRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureRejected::TooShort { duration } => {
                write!(f, "Gravação curta demais ({:.1}s).", duration.as_secs_f32())
            }
            CaptureRejected::TooQuiet { .. } => f.write_str("Não ouvi nada. Tente falar mais perto do microfone."),
        }
    }
}

/// One bounded recording
#[derive(Debug)]
pub struct CaptureSession {
    settings: CaptureSettings,
    vad: VoiceActivityDetector,
    samples: Vec<f32>,
    sample_rate: u32,
    state: CaptureState,
    stop_reason: Option<StopReason>,
}

impl CaptureSession {
    /// Start recording
    pub fn new(settings: CaptureSettings, sample_rate: u32) -> Self {
        let vad = VoiceActivityDetector::new(settings.rms_threshold, sample_rate);
        let capacity = u64::from(sample_rate)
            .saturating_mul(settings.hard_cap.as_secs().max(1))
            .min(48_000 * 60) as usize;
        Self {
            settings,
            vad,
            samples: Vec::with_capacity(capacity),
            sample_rate,
            state: CaptureState::Recording,
            stop_reason: None,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub fn detector(&self) -> &VoiceActivityDetector {
        &self.vad
    }

    pub fn frame_count(&self) -> usize {
        self.vad.frames()
    }

    /// Feed one frame. Returns the state after it; frames that arrive after
    /// recording ended are ignored.
    pub fn push_frame(&mut self, frame: &[f32]) -> CaptureState {
        if self.state != CaptureState::Recording {
            return self.state;
        }

        self.vad.classify(frame);
        self.samples.extend_from_slice(frame);

        let total = self.vad.elapsed_total();
        if total >= self.settings.hard_cap {
            self.stop(StopReason::HardCap);
        } else if self.vad.elapsed_silence() >= self.settings.silence && total >= self.settings.min_duration {
            self.stop(StopReason::Silence);
        }
        self.state
    }

    /// End recording now (wall-clock cap, closed source)
    pub fn force_stop(&mut self, reason: StopReason) {
        if self.state == CaptureState::Recording {
            self.stop(reason);
        }
    }

    fn stop(&mut self, reason: StopReason) {
        self.stop_reason = Some(reason);
        self.state = CaptureState::Finalizing;
    }

    /// Check the recording and hand back a normalized buffer, or say why not
    pub fn finalize(self) -> std::result::Result<AudioBuffer, CaptureRejected> {
        let buffer = AudioBuffer::new(self.samples, self.sample_rate);
        let duration = buffer.duration();

        if duration < self.settings.min_duration {
            return Err(CaptureRejected::TooShort { duration });
        }
        let peak = buffer.peak();
        if peak <= SILENT_PEAK || !self.vad.heard_sound() {
            return Err(CaptureRejected::TooQuiet { peak });
        }
        Ok(buffer.normalized())
    }
}

/// What the capture worker reports back to the UI thread
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    State(CaptureState),
    Rejected(CaptureRejected),
    Transcribed(String),
    TranscriptionFailed { timed_out: bool },
    /// The microphone could not be opened
    DeviceFailed(String),
}

/// Everything a capture worker needs besides its frame source
#[derive(Clone)]
pub struct CaptureJobConfig {
    pub settings: CaptureSettings,
    pub transcriber: Arc<dyn Transcriber>,
    pub language: String,
    pub timeout: Option<Duration>,
}

/// Record from `source` until the session ends or `abort` is raised.
/// Returns `None` when aborted; the source is released either way.
pub fn record<S: FrameSource>(
    source: &mut S,
    settings: &CaptureSettings,
    abort: &AtomicBool,
    report: &mut dyn FnMut(CaptureEvent),
) -> Option<CaptureSession> {
    let mut session = CaptureSession::new(settings.clone(), source.sample_rate());
    report(CaptureEvent::State(CaptureState::Recording));

    // `None` when the cap is too far out to represent
    let deadline = Instant::now().checked_add(settings.hard_cap.saturating_add(WALL_CLOCK_GRACE));

    while session.state() == CaptureState::Recording {
        if abort.load(Ordering::Acquire) {
            tracing::debug!(frames = session.frame_count(), "capture aborted");
            return None;
        }
        match source.next_frame(FRAME_WAIT) {
            FrameRead::Frame(frame) => {
                session.push_frame(&frame);
            }
            FrameRead::Timeout => {}
            FrameRead::Closed => session.force_stop(StopReason::SourceClosed),
        }
        if session.state() == CaptureState::Recording && deadline.is_some_and(|d| Instant::now() >= d) {
            tracing::warn!("no frames for too long, forcing capture to finish");
            session.force_stop(StopReason::HardCap);
        }
    }

    if abort.load(Ordering::Acquire) {
        return None;
    }

    let vad = session.detector();
    let dropped = source.dropped_frames();
    tracing::info!(
        reason = ?session.stop_reason(),
        secs = vad.elapsed_total().as_secs_f32(),
        frames = vad.frames(),
        loud_frames = vad.loud_frames(),
        peak = vad.peak(),
        threshold = vad.threshold(),
        last_loud = ?vad.last_loud(),
        dropped,
        "recording stopped"
    );
    if dropped > 0 {
        // the recording has gaps and silence timing ran short
        tracing::warn!(dropped, "capture fell behind the microphone");
    }
    report(CaptureEvent::State(CaptureState::Finalizing));
    Some(session)
}

/// Full capture: record, check, transcribe. Reports every state change and
/// exactly one terminal event unless aborted.
pub fn run_capture<S: FrameSource>(
    source: &mut S,
    job: &CaptureJobConfig,
    abort: &AtomicBool,
    report: &mut dyn FnMut(CaptureEvent),
) {
    let Some(session) = record(source, &job.settings, abort, report) else {
        return;
    };

    match session.finalize() {
        Err(rejected) => {
            tracing::info!(reason = ?rejected, "capture rejected");
            report(CaptureEvent::State(CaptureState::Rejected));
            report(CaptureEvent::Rejected(rejected));
        }
        Ok(buffer) => {
            report(CaptureEvent::State(CaptureState::Ready));
            let samples = buffer.len();
            let started = Instant::now();
            let outcome = transcribe_with_timeout(job.transcriber.clone(), buffer, &job.language, job.timeout);
            if abort.load(Ordering::Acquire) {
                return;
            }
            tracing::info!(samples, secs = started.elapsed().as_secs_f32(), "transcription finished");
            match outcome {
                TranscriptionOutcome::Text(text) => report(CaptureEvent::Transcribed(text)),
                TranscriptionOutcome::Empty => report(CaptureEvent::TranscriptionFailed { timed_out: false }),
                TranscriptionOutcome::TimedOut => report(CaptureEvent::TranscriptionFailed { timed_out: true }),
            }
        }
    }
    report(CaptureEvent::State(CaptureState::Idle));
}

/// Handle the UI thread keeps for the running capture worker
pub struct CaptureJob {
    id: u64,
    abort: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureJob {
    /// Spawn a worker that opens its frame source, records and transcribes.
    /// The source is opened on the worker because audio streams are not
    /// always `Send`.
    pub fn spawn<S, O, R>(id: u64, open: O, job: CaptureJobConfig, mut report: R) -> Self
    where
        S: FrameSource,
        O: FnOnce() -> Result<S> + Send + 'static,
        R: FnMut(CaptureEvent) + Send + 'static,
    {
        let abort = Arc::new(AtomicBool::new(false));
        let abort_for_worker = abort.clone();

        let handle = std::thread::Builder::new()
            .name(format!("capture-{id}"))
            .spawn(move || match open() {
                Ok(mut source) => run_capture(&mut source, &job, &abort_for_worker, &mut report),
                Err(e) => {
                    tracing::error!(error = %e, "could not open microphone");
                    report(CaptureEvent::DeviceFailed(e.to_string()));
                    report(CaptureEvent::State(CaptureState::Idle));
                }
            });

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!(error = %e, "could not spawn capture thread");
                None
            }
        };

        Self { id, abort, handle }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Ask the worker to stop and drop what it recorded
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }
}

impl Drop for CaptureJob {
    fn drop(&mut self) {
        // detach; the worker exits at its next frame boundary
        self.abort();
    }
}
