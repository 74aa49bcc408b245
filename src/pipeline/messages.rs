//! Value types passed between the audio source, the stages and subscribers.

use crate::config::AudioFormatConfig;
use crate::error::{PipelineError, Result};
use std::sync::Arc;
use std::time::Duration;

/// A fixed-size frame of mono PCM audio from the audio source.
///
/// Samples are shared, so cloning a chunk never copies audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// f32 samples in `[-1, 1]`.
    pub samples: Arc<[f32]>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count; the pipeline only accepts mono.
    pub channels: u16,
    /// Offset of the first sample from the start of the source.
    pub timestamp: Duration,
}

impl AudioChunk {
    /// Mono chunk starting at `timestamp`.
    pub fn new(samples: impl Into<Arc<[f32]>>, sample_rate: u32, timestamp: Duration) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            channels: 1,
            timestamp,
        }
    }

    /// Playback duration of this chunk.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let frames = self.samples.len() as u64 / u64::from(self.channels);
        Duration::from_micros(frames * 1_000_000 / u64::from(self.sample_rate))
    }

    /// Offset of the end of this chunk.
    pub fn end(&self) -> Duration {
        self.timestamp + self.duration()
    }

    /// RMS energy of the samples.
    pub fn rms(&self) -> f32 {
        compute_rms(&self.samples)
    }

    /// Check the chunk against the negotiated audio format.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidAudioFormat`] on a channel, sample-rate
    /// or frame-length mismatch.
    pub fn validate(&self, format: &AudioFormatConfig) -> Result<()> {
        if self.channels != format.channels {
            return Err(PipelineError::InvalidAudioFormat(format!(
                "expected {} channel(s), got {}",
                format.channels, self.channels
            )));
        }
        if self.sample_rate != format.sample_rate {
            return Err(PipelineError::InvalidAudioFormat(format!(
                "expected {} Hz, got {} Hz",
                format.sample_rate, self.sample_rate
            )));
        }
        if self.samples.is_empty() {
            return Err(PipelineError::InvalidAudioFormat("empty frame".into()));
        }
        let frame_ms = self.duration().as_millis();
        if frame_ms < u128::from(format.min_frame_ms) || frame_ms > u128::from(format.max_frame_ms)
        {
            return Err(PipelineError::InvalidAudioFormat(format!(
                "frame length {frame_ms}ms outside {}..={}ms",
                format.min_frame_ms, format.max_frame_ms
            )));
        }
        Ok(())
    }

    /// Check that this frame has the same length as the session's first
    /// accepted frame.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidAudioFormat`] on a length change.
    pub fn validate_frame_len(&self, expected: usize) -> Result<()> {
        if self.samples.len() != expected {
            return Err(PipelineError::InvalidAudioFormat(format!(
                "frame of {} samples, session frames are {expected} samples",
                self.samples.len()
            )));
        }
        Ok(())
    }
}

/// Compute RMS energy of audio samples.
pub(crate) fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// One coherent span of detected speech, ready for STT.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    /// Turn id this utterance opens.
    pub id: u64,
    /// Offset of the first buffered frame.
    pub start: Duration,
    /// Offset of the end of the last buffered frame.
    pub end: Duration,
    /// Buffered frames, in capture order.
    pub chunks: Vec<AudioChunk>,
}

impl Utterance {
    /// Open an utterance with its first frame.
    pub fn open(id: u64, first: AudioChunk) -> Self {
        Self {
            id,
            start: first.timestamp,
            end: first.end(),
            chunks: vec![first],
        }
    }

    /// Append a frame.
    pub fn push(&mut self, chunk: AudioChunk) {
        self.end = chunk.end();
        self.chunks.push(chunk);
    }

    /// Span covered by the buffered audio.
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }

    /// Concatenated samples of every buffered frame.
    pub fn samples(&self) -> Vec<f32> {
        let len = self.chunks.iter().map(|c| c.samples.len()).sum();
        let mut samples = Vec::with_capacity(len);
        for chunk in &self.chunks {
            samples.extend_from_slice(&chunk.samples);
        }
        samples
    }

    /// Sample rate of the buffered audio (0 when empty).
    pub fn sample_rate(&self) -> u32 {
        self.chunks.first().map_or(0, |c| c.sample_rate)
    }
}

/// Speaker attribution attached to a transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Speaker {
    /// Stable speaker id within the session.
    pub id: String,
    /// Human-readable name, if known.
    pub display_name: Option<String>,
}

/// Text produced by STT for one utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptSegment {
    /// Turn (utterance) id.
    pub turn_id: u64,
    /// Transcribed text.
    pub text: String,
    /// Final segments are immutable; partials may be superseded.
    pub is_final: bool,
    /// Speaker attribution, present only with diarization enabled.
    pub speaker: Option<Speaker>,
}

/// One increment of generated text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationChunk {
    /// Turn the generation answers.
    pub turn_id: u64,
    /// Token delta for partial chunks, full response for the final chunk.
    pub text: String,
    /// Whether this is the complete response.
    pub is_final: bool,
}

/// Synthesized audio, ready for playback.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioOutputChunk {
    /// f32 samples.
    pub samples: Arc<[f32]>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl AudioOutputChunk {
    /// Wrap synthesized samples.
    pub fn new(samples: impl Into<Arc<[f32]>>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// Whether the chunk carries no audio.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.samples.len() as u64 * 1_000_000 / u64::from(self.sample_rate))
    }
}

/// A completed exchange kept as history for later generations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    pub user_text: String,
    pub assistant_text: String,
}

/// Input to the generation stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    /// Final transcript of the current turn.
    pub prompt: String,
    /// Prior turns, oldest first.
    pub history: Vec<ConversationTurn>,
    /// Model override from the session config.
    pub model: Option<String>,
    /// BCP-47 language tag.
    pub language: String,
}
