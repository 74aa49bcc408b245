//! Talkloop: real-time voice pipeline orchestration.
//!
//! This crate drives a cascaded pipeline for voice conversations:
//! Audio source → VAD → STT → LLM → TTS → Playback
//!
//! # Architecture
//!
//! Each session runs one control loop that owns its state machine and pulls
//! audio from a caller-supplied source. Stage backends plug in through the
//! traits in [`stage`] and are resolved per session by a
//! [`stage::registry::StageRegistry`]:
//! - **VAD**: classifies frames; the built-in [`vad::EnergyVad`] uses RMS energy
//! - **STT**: transcribes finalized utterances, streaming partial hypotheses
//! - **LLM**: generates a reply from the transcript and prior turns
//! - **TTS**: synthesizes the reply incrementally
//!
//! Everything observable is published as a [`PipelineEvent`] on the
//! session's ordered event stream.

pub mod audio;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod stage;
pub mod vad;

pub use audio::{AudioIo, AudioSource, ChannelAudioSource, PlaybackSink, WavFileSource};
pub use config::SessionConfig;
pub use error::{PipelineError, Result};
pub use pipeline::coordinator::PipelineOrchestrator;
pub use pipeline::events::{EventSubscription, PipelineEvent};
pub use pipeline::session::Session;
pub use pipeline::state::SessionState;
pub use stage::Stage;
pub use stage::registry::StageRegistry;
