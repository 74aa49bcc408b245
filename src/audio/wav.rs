//! WAV file audio source.

use super::AudioSource;
use crate::error::{PipelineError, Result};
use crate::pipeline::messages::AudioChunk;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Plays a mono WAV file as a sequence of fixed-size frames.
pub struct WavFileSource {
    samples: Arc<[f32]>,
    sample_rate: u32,
    frame_len: usize,
    position: usize,
    pacing: Option<Instant>,
}

impl WavFileSource {
    /// Decode `path` and slice it into `frame_ms` frames.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Io`] if the file cannot be read and
    /// [`PipelineError::InvalidAudioFormat`] if it is not mono or cannot be
    /// decoded.
    pub fn open(path: &Path, frame_ms: u32) -> Result<Self> {
        let mut reader = hound::WavReader::open(path).map_err(|e| match e {
            hound::Error::IoError(io) => PipelineError::Io(io),
            other => PipelineError::InvalidAudioFormat(format!(
                "cannot open WAV {}: {other}",
                path.display()
            )),
        })?;

        let spec = reader.spec();
        if spec.channels != 1 {
            return Err(PipelineError::InvalidAudioFormat(format!(
                "WAV must be mono, got {} channels: {}",
                spec.channels,
                path.display()
            )));
        }

        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Int => {
                let max = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / max).map_err(wav_read_error))
                    .collect::<Result<Vec<f32>>>()?
            }
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .map(|s| s.map_err(wav_read_error))
                .collect::<Result<Vec<f32>>>()?,
        };

        info!(
            "loaded {}: {} samples at {}Hz",
            path.display(),
            samples.len(),
            spec.sample_rate
        );
        Ok(Self::from_samples(samples, spec.sample_rate, frame_ms))
    }

    /// Frame already-decoded mono samples.
    pub fn from_samples(samples: impl Into<Arc<[f32]>>, sample_rate: u32, frame_ms: u32) -> Self {
        let frame_len = (sample_rate as usize * frame_ms as usize / 1000).max(1);
        Self {
            samples: samples.into(),
            sample_rate,
            frame_len,
            position: 0,
            pacing: None,
        }
    }

    /// Deliver frames no faster than real time.
    #[must_use]
    pub fn with_pacing(mut self) -> Self {
        self.pacing = Some(Instant::now());
        self
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Total audio duration of the file.
    pub fn duration(&self) -> Duration {
        offset(self.samples.len(), self.sample_rate)
    }
}

fn offset(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(samples as u64 * 1_000_000 / u64::from(sample_rate))
}

fn wav_read_error(e: hound::Error) -> PipelineError {
    PipelineError::InvalidAudioFormat(format!("WAV read error: {e}"))
}

#[async_trait]
impl AudioSource for WavFileSource {
    async fn next_chunk(&mut self) -> Option<AudioChunk> {
        if self.position >= self.samples.len() {
            return None;
        }
        let end = (self.position + self.frame_len).min(self.samples.len());
        let timestamp = offset(self.position, self.sample_rate);
        if let Some(started) = self.pacing {
            tokio::time::sleep_until(started + timestamp).await;
        }
        let mut frame = self.samples[self.position..end].to_vec();
        // The tail frame is padded with silence so every frame has the same length.
        frame.resize(self.frame_len, 0.0);
        let chunk = AudioChunk::new(frame, self.sample_rate, timestamp);
        self.position = end;
        Some(chunk)
    }

    async fn stop(&mut self) {
        self.position = self.samples.len();
    }
}
