//! Speech-to-text behind a small trait
//!
//! The whisper model loads on a background thread at startup. Until it is
//! installed in the [`ModelHandle`] the capture trigger is refused with a
//! "not ready" notice; nothing re-triggers the load.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::audio::AudioBuffer;
use crate::config::Config;
use crate::model::{download_model, get_model_install_path, get_model_path};
use crate::{Error, Result};

/// Converts a finalized recording to text. Failure is an empty string.
pub trait Transcriber: Send + Sync {
    fn transcribe(&self, audio: &AudioBuffer, language: &str) -> String;
}

/// Whisper-backed transcriber
pub struct WhisperTranscriber {
    ctx: WhisperContext,
    threads: usize,
}

impl WhisperTranscriber {
    pub fn load(path: &Path, threads: usize) -> Result<Self> {
        let path_str = path
            .to_str()
            .ok_or_else(|| Error::Model(format!("model path is not UTF-8: {}", path.display())))?;
        let ctx = WhisperContext::new_with_params(path_str, WhisperContextParameters::default())
            .map_err(|e| Error::Model(e.to_string()))?;
        Ok(Self { ctx, threads: threads.max(1) })
    }

    fn try_transcribe(&self, audio: &AudioBuffer, language: &str) -> Result<String> {
        let samples = audio.to_whisper_rate()?;
        let mut state = self
            .ctx
            .create_state()
            .map_err(|e| Error::Transcription(e.to_string()))?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_n_threads(self.threads as i32);
        params.set_language(Some(language));
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);

        state
            .full(params, &samples)
            .map_err(|e| Error::Transcription(e.to_string()))?;

        let num_segments = state
            .full_n_segments()
            .map_err(|e| Error::Transcription(e.to_string()))?;
        let mut result = String::new();

        for i in 0..num_segments {
            if let Ok(segment) = state.full_get_segment_text(i) {
                result.push_str(&segment);
            }
        }

        Ok(result.trim().to_string())
    }
}

impl Transcriber for WhisperTranscriber {
    fn transcribe(&self, audio: &AudioBuffer, language: &str) -> String {
        match self.try_transcribe(audio, language) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "transcription failed");
                String::new()
            }
        }
    }
}

/// Loading state of the transcription model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    Loading,
    Ready,
    Failed,
}

/// Readiness slot for the transcription model, shared with the loader thread
#[derive(Clone, Default)]
pub struct ModelHandle {
    slot: Arc<OnceLock<Arc<dyn Transcriber>>>,
    failed: Arc<AtomicBool>,
}

impl ModelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle that is ready from the start (tests, alternate backends)
    pub fn ready_with(transcriber: Arc<dyn Transcriber>) -> Self {
        let handle = Self::new();
        handle.install(transcriber);
        handle
    }

    /// The model, if it has finished loading
    pub fn ready(&self) -> Option<Arc<dyn Transcriber>> {
        self.slot.get().cloned()
    }

    pub fn status(&self) -> ModelStatus {
        if self.slot.get().is_some() {
            ModelStatus::Ready
        } else if self.failed.load(Ordering::Acquire) {
            ModelStatus::Failed
        } else {
            ModelStatus::Loading
        }
    }

    pub fn install(&self, transcriber: Arc<dyn Transcriber>) {
        if self.slot.set(transcriber).is_err() {
            tracing::warn!("transcription model installed twice, keeping the first");
        }
    }

    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }
}

/// Locate (downloading if needed) and load the whisper model on a
/// background thread. `on_done` runs on that thread once loading ends.
pub fn spawn_model_load<F>(config: Config, handle: ModelHandle, on_done: F)
where
    F: FnOnce(std::result::Result<(), String>) + Send + 'static,
{
    std::thread::spawn(move || {
        let started = Instant::now();
        let result = load_whisper(&config).map(|transcriber| {
            handle.install(Arc::new(transcriber));
        });
        match &result {
            Ok(()) => tracing::info!(
                model = %config.model,
                secs = started.elapsed().as_secs_f32(),
                "transcription model loaded"
            ),
            Err(e) => {
                handle.mark_failed();
                tracing::error!(error = %e, "transcription model failed to load");
            }
        }
        on_done(result.map_err(|e| e.to_string()));
    });
}

fn load_whisper(config: &Config) -> Result<WhisperTranscriber> {
    let model_filename = config.model_filename();
    let mut model_path = get_model_path(&config.model_dir, &model_filename);

    if !model_path.exists() {
        let install_path = get_model_install_path(&config.model_dir, &model_filename);
        tracing::info!(model = %config.model, path = %install_path.display(), "model not found locally, downloading");
        download_model(&config.model_url(), &install_path)?;
        model_path = install_path;
    }

    tracing::info!(path = %model_path.display(), "loading whisper model");
    WhisperTranscriber::load(&model_path, config.threads)
}

/// Result of a bounded transcription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptionOutcome {
    Text(String),
    /// Model produced nothing usable
    Empty,
    TimedOut,
}

/// Run the transcriber, giving up after `timeout` (when set). The work runs
/// on its own thread so a hung model cannot hold the caller past the limit.
pub fn transcribe_with_timeout(
    transcriber: Arc<dyn Transcriber>,
    audio: AudioBuffer,
    language: &str,
    timeout: Option<Duration>,
) -> TranscriptionOutcome {
    let text = match timeout {
        None => transcriber.transcribe(&audio, language),
        Some(limit) => {
            let (tx, rx) = mpsc::channel();
            let language = language.to_string();
            std::thread::spawn(move || {
                let _ = tx.send(transcriber.transcribe(&audio, &language)); // receiver may be gone
            });
            match rx.recv_timeout(limit) {
                Ok(text) => text,
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(limit_secs = limit.as_secs_f32(), "transcription timed out");
                    return TranscriptionOutcome::TimedOut;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::error!("transcription thread crashed");
                    String::new()
                }
            }
        }
    };

    let text = text.trim();
    if text.is_empty() {
        TranscriptionOutcome::Empty
    } else {
        TranscriptionOutcome::Text(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    impl Transcriber for Fixed {
        fn transcribe(&self, _audio: &AudioBuffer, _language: &str) -> String {
            self.0.to_string()
        }
    }

    struct Slow;

    impl Transcriber for Slow {
        fn transcribe(&self, _audio: &AudioBuffer, _language: &str) -> String {
            std::thread::sleep(Duration::from_millis(500));
            "late".to_string()
        }
    }

    fn audio() -> AudioBuffer {
        AudioBuffer::new(vec![0.5; 160], 16000)
    }

    #[test]
    fn handle_reports_loading_until_installed() {
        let handle = ModelHandle::new();
        assert_eq!(handle.status(), ModelStatus::Loading);
        assert!(handle.ready().is_none());

        handle.install(Arc::new(Fixed("oi")));
        assert_eq!(handle.status(), ModelStatus::Ready);
        assert!(handle.ready().is_some());
    }

    #[test]
    fn failed_load_is_visible() {
        let handle = ModelHandle::new();
        handle.mark_failed();
        assert_eq!(handle.status(), ModelStatus::Failed);
    }

    #[test]
    fn text_is_trimmed_and_empty_detected() {
        let out = transcribe_with_timeout(Arc::new(Fixed("  abrir notas ")), audio(), "pt", None);
        assert_eq!(out, TranscriptionOutcome::Text("abrir notas".to_string()));

        let out = transcribe_with_timeout(Arc::new(Fixed("   ")), audio(), "pt", Some(Duration::from_secs(1)));
        assert_eq!(out, TranscriptionOutcome::Empty);
    }

    #[test]
    fn slow_model_times_out() {
        let out = transcribe_with_timeout(Arc::new(Slow), audio(), "pt", Some(Duration::from_millis(50)));
        assert_eq!(out, TranscriptionOutcome::TimedOut);
    }
}
