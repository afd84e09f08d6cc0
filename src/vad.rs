//! Energy-based voice activity detection
//!
//! Frames are classified by RMS level against a fixed threshold. Time is
//! measured on the sample clock (samples seen / sample rate), so the
//! detector is a pure function of the frames it is fed.

use std::time::Duration;

/// Classification of a single frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    Loud,
    Quiet,
}

/// Root mean square of a frame (0.0 for an empty frame)
pub fn rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f32 = frame.iter().map(|s| s * s).sum();
    (sum / frame.len() as f32).sqrt()
}

/// Exact duration of `samples` at `sample_rate`
pub fn samples_to_duration(samples: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let nanos = u128::from(samples) * 1_000_000_000 / u128::from(sample_rate);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Voice activity detector with silence/recording counters
#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    threshold: f32,
    sample_rate: u32,
    /// Samples classified since recording start
    samples_seen: u64,
    /// Sample position at the end of the last loud frame
    last_loud_at: Option<u64>,
    frames: usize,
    loud_frames: usize,
    peak: f32,
}

impl VoiceActivityDetector {
    /// Create a detector
    ///
    /// # Arguments
    /// * `threshold` - RMS level (0.0-1.0) at or above which a frame is loud
    /// * `sample_rate` - Rate of the frames that will be fed
    pub fn new(threshold: f32, sample_rate: u32) -> Self {
        Self {
            threshold,
            sample_rate: sample_rate.max(1),
            samples_seen: 0,
            last_loud_at: None,
            frames: 0,
            loud_frames: 0,
            peak: 0.0,
        }
    }

    /// Classify a frame and advance the counters
    pub fn classify(&mut self, frame: &[f32]) -> FrameClass {
        self.samples_seen += frame.len() as u64;
        self.frames += 1;
        self.peak = frame.iter().fold(self.peak, |peak, s| peak.max(s.abs()));

        if rms(frame) >= self.threshold {
            self.last_loud_at = Some(self.samples_seen);
            self.loud_frames += 1;
            FrameClass::Loud
        } else {
            FrameClass::Quiet
        }
    }

    /// Time since recording start
    pub fn elapsed_total(&self) -> Duration {
        self.samples_to_duration(self.samples_seen)
    }

    /// Time since the last loud frame ended (since start if none was loud)
    pub fn elapsed_silence(&self) -> Duration {
        let since = self.samples_seen - self.last_loud_at.unwrap_or(0);
        self.samples_to_duration(since)
    }

    /// Time at which the last loud frame ended, if any
    pub fn last_loud(&self) -> Option<Duration> {
        self.last_loud_at.map(|s| self.samples_to_duration(s))
    }

    pub fn heard_sound(&self) -> bool {
        self.loud_frames > 0
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn loud_frames(&self) -> usize {
        self.loud_frames
    }

    pub fn peak(&self) -> f32 {
        self.peak
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    fn samples_to_duration(&self, samples: u64) -> Duration {
        samples_to_duration(samples, self.sample_rate)
    }
}
