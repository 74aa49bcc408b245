//! Voice Activity Detection using energy-based analysis.
//!
//! Uses RMS energy thresholding to classify frames. After speech, silent
//! frames accumulate into a hangover; once it elapses the detector reports
//! end of speech on its own.

use crate::config::VadConfig;
use crate::error::{PipelineError, Result};
use crate::pipeline::messages::AudioChunk;
use crate::stage::{Stage, StageComponent, StageOptions, VadDecision, VoiceActivityDetector};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct VadState {
    /// Whether we are currently in a speech run.
    in_speech: bool,
    /// Silence accumulated since the last speech frame.
    silence: Duration,
    /// Sample rate negotiated at initialization.
    sample_rate: Option<u32>,
}

/// Voice activity detector using RMS energy thresholding.
pub struct EnergyVad {
    threshold: f32,
    hangover: Duration,
    state: Mutex<VadState>,
}

impl EnergyVad {
    /// Create a detector from config.
    pub fn new(config: &VadConfig) -> Self {
        Self {
            threshold: config.threshold,
            hangover: Duration::from_millis(u64::from(config.hangover_ms)),
            state: Mutex::new(VadState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VadState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl StageComponent for EnergyVad {
    fn name(&self) -> &str {
        "energy"
    }

    async fn initialize(&self, options: &StageOptions) -> Result<()> {
        if options.sample_rate == 0 {
            return Err(PipelineError::initialization(
                Stage::Vad,
                "sample rate must be non-zero",
            ));
        }
        if !(self.threshold > 0.0) {
            return Err(PipelineError::initialization(
                Stage::Vad,
                format!("threshold must be positive, got {}", self.threshold),
            ));
        }
        let mut state = self.lock();
        *state = VadState::default();
        state.sample_rate = Some(options.sample_rate);
        info!(
            "VAD initialized: threshold={}, hangover={}ms",
            self.threshold,
            self.hangover.as_millis()
        );
        Ok(())
    }

    fn cancel(&self) {}

    async fn release(&self) {
        *self.lock() = VadState::default();
    }
}

#[async_trait]
impl VoiceActivityDetector for EnergyVad {
    async fn detect(&self, chunk: &AudioChunk) -> Result<VadDecision> {
        let mut state = self.lock();
        match state.sample_rate {
            Some(rate) if rate == chunk.sample_rate => {}
            Some(rate) => {
                return Err(PipelineError::runtime(
                    Stage::Vad,
                    format!("frame at {} Hz, detector runs at {rate} Hz", chunk.sample_rate),
                ));
            }
            None => {
                return Err(PipelineError::runtime(Stage::Vad, "detector not initialized"));
            }
        }

        let energy = chunk.rms();
        if energy > self.threshold {
            state.in_speech = true;
            state.silence = Duration::ZERO;
            return Ok(VadDecision::Speech);
        }
        if !state.in_speech {
            return Ok(VadDecision::Silence);
        }

        state.silence += chunk.duration();
        if state.silence >= self.hangover {
            debug!("speech ended after {}ms hangover", state.silence.as_millis());
            state.in_speech = false;
            state.silence = Duration::ZERO;
            return Ok(VadDecision::SpeechEnded);
        }
        Ok(VadDecision::Silence)
    }

    fn reset(&self) {
        let mut state = self.lock();
        state.in_speech = false;
        state.silence = Duration::ZERO;
    }
}
