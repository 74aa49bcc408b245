//! Stage component contract shared by every VAD, STT, LLM and TTS backend.
//!
//! Concrete inference runtimes (ONNX, llama.cpp, system voices, ...) live
//! outside this crate. Each one implements [`StageComponent`] plus the
//! per-stage trait for what it does, and is plugged in through a
//! [`registry::StageRegistry`]. The coordinator only ever talks to these
//! traits, never to a concrete runtime.
//!
//! Streaming stages return a [`StageStream`]. Cancellation is cooperative:
//! backends check [`StageContext::is_cancelled`] between outputs, and the
//! coordinator additionally calls [`StageComponent::cancel`] and stops
//! polling the stream.

pub mod registry;

use crate::error::Result;
use crate::pipeline::messages::{AudioChunk, AudioOutputChunk, GenerationRequest, Utterance};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Pipeline stage identifiers, used for component names and error origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// The caller-supplied audio source (format errors).
    Audio,
    /// Voice activity detection.
    Vad,
    /// Speech-to-text.
    Stt,
    /// Response generation.
    Llm,
    /// Text-to-speech.
    Tts,
    /// Session-wide concerns (duration budget).
    Session,
}

impl Stage {
    /// Lowercase component name (`"vad"`, `"stt"`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Vad => "vad",
            Self::Stt => "stt",
            Self::Llm => "llm",
            Self::Tts => "tts",
            Self::Session => "session",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One output of a streaming stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput<T> {
    /// May be superseded by later outputs.
    Partial(T),
    /// Immutable once emitted. Nothing after it is consumed.
    Final(T),
}

impl<T> StageOutput<T> {
    /// Whether this is the final output.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Final(_))
    }

    /// Borrow the payload.
    pub fn value(&self) -> &T {
        match self {
            Self::Partial(v) | Self::Final(v) => v,
        }
    }

    /// Take the payload.
    pub fn into_value(self) -> T {
        match self {
            Self::Partial(v) | Self::Final(v) => v,
        }
    }
}

/// Boxed stream of stage outputs.
pub type StageStream<T> = Pin<Box<dyn Stream<Item = Result<StageOutput<T>>> + Send>>;

/// Options handed to [`StageComponent::initialize`].
#[derive(Debug, Clone, PartialEq)]
pub struct StageOptions {
    /// Model identifier resolved for this stage (`None` for model-less stages).
    pub model_id: Option<String>,
    /// BCP-47 language tag of the session.
    pub language: String,
    /// Working sample rate in Hz.
    pub sample_rate: u32,
    /// System voice for TTS, if configured.
    pub voice: Option<String>,
    /// Keep speaker attribution on transcripts.
    pub diarization: bool,
    /// Stream partial outputs instead of waiting for completion.
    pub streaming: bool,
}

/// Per-invocation context for a streaming stage.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Session the invocation belongs to.
    pub session_id: Uuid,
    /// Turn the invocation belongs to.
    pub turn_id: u64,
    /// Instant by which the stage must have produced its final output.
    pub deadline: Instant,
    /// Session duration budget left when the invocation started.
    pub remaining_budget: Duration,
    cancel: CancellationToken,
}

impl StageContext {
    /// Build a context around a cancellation token.
    pub fn new(
        session_id: Uuid,
        turn_id: u64,
        deadline: Instant,
        remaining_budget: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            turn_id,
            deadline,
            remaining_budget,
            cancel,
        }
    }

    /// Whether the coordinator has asked this invocation to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the invocation is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Clone of the underlying token, for backends that spawn helpers.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Capability set shared by every stage backend.
#[async_trait]
pub trait StageComponent: Send + Sync {
    /// Backend name for logs (e.g. `"energy"`, `"whisper-onnx"`).
    fn name(&self) -> &str;

    /// Load models and allocate resources.
    async fn initialize(&self, options: &StageOptions) -> Result<()>;

    /// Ask any in-flight work to stop producing outputs. Never fails.
    fn cancel(&self);

    /// Free all held resources. Must be idempotent.
    async fn release(&self);
}

/// Per-frame VAD classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    /// Frame contains speech.
    Speech,
    /// Frame is silent.
    Silence,
    /// The detector's own end-of-speech decision (e.g. after a hangover).
    SpeechEnded,
}

impl VadDecision {
    /// Whether the frame contains speech.
    pub fn is_speech(self) -> bool {
        matches!(self, Self::Speech)
    }
}

/// Voice activity detection backend. Runs on every captured frame.
#[async_trait]
pub trait VoiceActivityDetector: StageComponent {
    /// Classify one frame.
    async fn detect(&self, chunk: &AudioChunk) -> Result<VadDecision>;

    /// Drop any internal speech state.
    fn reset(&self) {}
}

/// Text for one transcript hypothesis.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transcript {
    /// Recognized text.
    pub text: String,
    /// Speaker attribution when diarization is enabled.
    pub speaker: Option<crate::pipeline::messages::Speaker>,
}

impl Transcript {
    /// Transcript without speaker attribution.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            speaker: None,
        }
    }
}

/// Speech-to-text backend.
///
/// Partials are superseding hypotheses for the whole utterance. The first
/// final output ends the invocation.
pub trait SpeechRecognizer: StageComponent {
    /// Transcribe one finalized utterance.
    fn transcribe(&self, utterance: Utterance, ctx: StageContext) -> StageStream<Transcript>;
}

/// Response generation backend.
///
/// Partials are token deltas. The final output carries the complete
/// response; an empty final means "use the accumulated deltas".
pub trait ResponseGenerator: StageComponent {
    /// Generate a reply to the request.
    fn generate(&self, request: GenerationRequest, ctx: StageContext) -> StageStream<String>;
}

/// One increment of synthesized speech.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisProgress {
    /// Audio produced by this increment (may be empty on the final output).
    pub audio: AudioOutputChunk,
    /// Fraction of the input text synthesized so far, in `[0, 1]`.
    pub fraction_complete: f32,
}

/// Text-to-speech backend.
pub trait SpeechSynthesizer: StageComponent {
    /// Synthesize `text` incrementally.
    fn synthesize(&self, text: String, ctx: StageContext) -> StageStream<SynthesisProgress>;
}
