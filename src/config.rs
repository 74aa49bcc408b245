//! Session configuration.
//!
//! A [`SessionConfig`] is captured when a session is opened and never
//! changes afterwards. It can be loaded from and saved to TOML.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Immutable configuration for one voice session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// STT model identifier.
    pub recognition_model: String,
    /// TTS model identifier.
    pub tts_model: String,
    /// System voice for TTS (None = model default).
    pub voice: Option<String>,
    /// Run VAD. When false every frame is treated as speech.
    pub enable_vad: bool,
    /// Emit partial LLM output instead of only the final response.
    pub enable_streaming: bool,
    /// Speak responses. When false turns end after generation.
    pub enable_tts: bool,
    /// Keep speaker attribution on transcripts.
    pub enable_diarization: bool,
    /// Upper bound on the session lifetime, counted from a successful connect.
    pub max_session_duration_ms: u64,
    /// Silence after speech that finalizes an utterance.
    pub silence_timeout_ms: u32,
    /// BCP-47 language tag.
    pub language: String,
    /// Generate a reply. When false the transcript is the turn's output.
    pub use_llm: bool,
    /// Override of the default generation model.
    pub llm_model: Option<String>,
    /// Number of prior turns passed to the generator.
    pub max_history_turns: usize,
    /// What happens when the user speaks over an in-flight turn.
    pub barge_in: BargeInPolicy,
    /// Audio format contract for the audio source.
    pub audio: AudioFormatConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Per-stage timeouts.
    pub timeouts: StageTimeoutConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            recognition_model: "whisper-base".to_owned(),
            tts_model: "system".to_owned(),
            voice: None,
            enable_vad: true,
            enable_streaming: true,
            enable_tts: true,
            enable_diarization: false,
            max_session_duration_ms: 30 * 60 * 1000,
            silence_timeout_ms: 800,
            language: "en-US".to_owned(),
            use_llm: true,
            llm_model: None,
            max_history_turns: 8,
            barge_in: BargeInPolicy::default(),
            audio: AudioFormatConfig::default(),
            vad: VadConfig::default(),
            timeouts: StageTimeoutConfig::default(),
        }
    }
}

/// Behaviour when new speech is detected while a turn is in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BargeInPolicy {
    /// Only an explicit `interrupt()` stops a turn. Overlapping speech is ignored.
    #[default]
    Manual,
    /// Speech during `processing`/`speaking` interrupts the turn and opens a
    /// new utterance.
    Automatic,
}

/// Audio format the audio source must deliver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioFormatConfig {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of channels (only mono is supported).
    pub channels: u16,
    /// Shortest accepted frame.
    pub min_frame_ms: u32,
    /// Longest accepted frame.
    pub max_frame_ms: u32,
}

impl Default for AudioFormatConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            min_frame_ms: 10,
            max_frame_ms: 60,
        }
    }
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS energy threshold for speech detection.
    ///
    /// Typical values for f32 samples in \[-1, 1\]:
    ///   - 0.005: very sensitive (picks up quiet speech and some noise)
    ///   - 0.01:  normal sensitivity (default)
    ///   - 0.05:  low sensitivity (only loud/close speech)
    pub threshold: f32,
    /// Silence after which the detector itself reports end of speech.
    pub hangover_ms: u32,
    /// Utterances shorter than this are discarded without STT.
    pub min_speech_duration_ms: u32,
    /// Utterances are force-finalized at this length.
    pub max_utterance_duration_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            hangover_ms: 1800,
            min_speech_duration_ms: 200,
            max_utterance_duration_ms: 30_000,
        }
    }
}

/// Timeouts applied to individual stage invocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTimeoutConfig {
    /// Component initialization during `connect`.
    pub initialize_ms: u64,
    /// One transcription.
    pub stt_ms: u64,
    /// One generation.
    pub llm_ms: u64,
    /// One synthesis.
    pub tts_ms: u64,
}

impl Default for StageTimeoutConfig {
    fn default() -> Self {
        Self {
            initialize_ms: 60_000,
            stt_ms: 10_000,
            llm_ms: 30_000,
            tts_ms: 30_000,
        }
    }
}

impl StageTimeoutConfig {
    pub fn initialize(&self) -> Duration {
        Duration::from_millis(self.initialize_ms)
    }

    pub fn stt(&self) -> Duration {
        Duration::from_millis(self.stt_ms)
    }

    pub fn llm(&self) -> Duration {
        Duration::from_millis(self.llm_ms)
    }

    pub fn tts(&self) -> Duration {
        Duration::from_millis(self.tts_ms)
    }
}

impl SessionConfig {
    /// Lifetime budget of the session.
    pub fn max_session_duration(&self) -> Duration {
        Duration::from_millis(self.max_session_duration_ms)
    }

    /// Silence that finalizes an utterance.
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.silence_timeout_ms))
    }

    /// Check the configuration before a session is opened.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.recognition_model.trim().is_empty() {
            return Err(invalid("recognition_model must not be empty"));
        }
        if self.enable_tts && self.tts_model.trim().is_empty() {
            return Err(invalid("tts_model must not be empty when enable_tts is set"));
        }
        if let Some(model) = &self.llm_model {
            if model.trim().is_empty() {
                return Err(invalid("llm_model must not be empty when set"));
            }
        }
        if !is_valid_language_tag(&self.language) {
            return Err(invalid(format!(
                "language '{}' is not a BCP-47 tag",
                self.language
            )));
        }
        if self.max_session_duration_ms == 0 {
            return Err(invalid("max_session_duration_ms must be positive"));
        }
        if self.silence_timeout_ms == 0 {
            return Err(invalid("silence_timeout_ms must be positive"));
        }

        if self.audio.sample_rate == 0 {
            return Err(invalid("audio.sample_rate must be positive"));
        }
        if self.audio.channels != 1 {
            return Err(invalid("audio.channels must be 1 (mono)"));
        }
        if self.audio.min_frame_ms == 0 || self.audio.min_frame_ms > self.audio.max_frame_ms {
            return Err(invalid(
                "audio frame bounds must satisfy 0 < min_frame_ms <= max_frame_ms",
            ));
        }

        if !(self.vad.threshold > 0.0 && self.vad.threshold <= 1.0) {
            return Err(invalid("vad.threshold must be in (0, 1]"));
        }
        if self.vad.hangover_ms == 0 || self.vad.max_utterance_duration_ms == 0 {
            return Err(invalid(
                "vad.hangover_ms and vad.max_utterance_duration_ms must be positive",
            ));
        }

        let t = &self.timeouts;
        if t.initialize_ms == 0 || t.stt_ms == 0 || t.llm_ms == 0 || t.tts_ms == 0 {
            return Err(invalid("stage timeouts must be positive"));
        }
        Ok(())
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| PipelineError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| PipelineError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/talkloop/session.toml`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("talkloop")
            .join("session.toml")
    }
}

fn invalid(message: impl Into<String>) -> PipelineError {
    PipelineError::Config(message.into())
}

/// Syntactic BCP-47 check: alphabetic primary subtag of 1–8 letters (`x` and
/// `i` introduce private-use and grandfathered tags), then 1–8 character
/// alphanumeric subtags separated by `-`.
fn is_valid_language_tag(tag: &str) -> bool {
    let mut subtags = tag.split('-');
    let Some(primary) = subtags.next() else {
        return false;
    };
    if !(1..=8).contains(&primary.len()) || !primary.chars().all(|c| c.is_ascii_alphabetic()) {
        return false;
    }
    subtags.all(|s| (1..=8).contains(&s.len()) && s.chars().all(|c| c.is_ascii_alphanumeric()))
}
