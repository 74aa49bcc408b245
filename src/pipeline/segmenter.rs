//! Turns per-frame VAD decisions into utterances.
//!
//! Frames are buffered from the first speech frame until the trailing
//! silence reaches the silence timeout, the detector reports end of speech,
//! or the utterance hits its maximum length. Silence is measured in audio
//! time (frame durations), never wall-clock time, so paced and unpaced
//! sources segment identically.

use crate::config::SessionConfig;
use crate::pipeline::messages::{AudioChunk, Utterance};
use crate::stage::VadDecision;
use std::time::Duration;

/// Outcome of feeding one frame to the segmenter.
#[derive(Debug, Clone, PartialEq)]
pub enum Segmentation {
    /// No utterance open and the frame was not speech.
    Idle,
    /// The frame opened a new utterance.
    Started,
    /// The frame was appended to the open utterance.
    Continued,
    /// The open utterance closed and should be transcribed.
    Finalized(Utterance),
    /// The open utterance closed but was too short to transcribe.
    Discarded,
}

/// Utterance boundary tracker for one session.
#[derive(Debug)]
pub struct UtteranceSegmenter {
    open: Option<Utterance>,
    trailing_silence: Duration,
    silence_timeout: Duration,
    min_speech: Duration,
    max_utterance: Duration,
    next_id: u64,
}

impl UtteranceSegmenter {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            open: None,
            trailing_silence: Duration::ZERO,
            silence_timeout: config.silence_timeout(),
            min_speech: Duration::from_millis(u64::from(config.vad.min_speech_duration_ms)),
            max_utterance: Duration::from_millis(u64::from(config.vad.max_utterance_duration_ms)),
            next_id: 1,
        }
    }

    /// Whether an utterance is currently being buffered.
    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Feed one validated frame with its VAD decision.
    pub fn push(&mut self, chunk: AudioChunk, decision: VadDecision) -> Segmentation {
        let Some(utterance) = self.open.as_mut() else {
            if decision.is_speech() {
                let id = self.next_id;
                self.next_id += 1;
                self.trailing_silence = Duration::ZERO;
                self.open = Some(Utterance::open(id, chunk));
                return Segmentation::Started;
            }
            return Segmentation::Idle;
        };

        let frame = chunk.duration();
        utterance.push(chunk);
        if decision.is_speech() {
            self.trailing_silence = Duration::ZERO;
        } else {
            self.trailing_silence += frame;
        }

        let ended = decision == VadDecision::SpeechEnded
            || self.trailing_silence >= self.silence_timeout
            || utterance.duration() >= self.max_utterance;
        if ended {
            self.close()
        } else {
            Segmentation::Continued
        }
    }

    /// Close any open utterance, e.g. when the audio source is exhausted.
    /// Returns `None` when nothing was open.
    pub fn flush(&mut self) -> Option<Segmentation> {
        self.open.as_ref()?;
        Some(self.close())
    }

    /// Drop any open utterance without reporting it.
    pub fn reset(&mut self) {
        self.open = None;
        self.trailing_silence = Duration::ZERO;
    }

    fn close(&mut self) -> Segmentation {
        let silence = std::mem::take(&mut self.trailing_silence);
        match self.open.take() {
            Some(utterance) if utterance.duration().saturating_sub(silence) >= self.min_speech => {
                Segmentation::Finalized(utterance)
            }
            Some(_) => Segmentation::Discarded,
            None => Segmentation::Idle,
        }
    }
}
