//! Backend registry: maps configured model ids to stage factories.
//!
//! Each session asks the registry for fresh component instances, so no
//! backend object is ever shared between two sessions.

use super::{ResponseGenerator, SpeechRecognizer, SpeechSynthesizer, Stage, VoiceActivityDetector};
use crate::config::SessionConfig;
use crate::error::{PipelineError, Result};
use crate::vad::EnergyVad;
use std::collections::HashMap;
use std::sync::Arc;

/// Factory producing a component for a model id.
pub type Factory<T> = Arc<dyn Fn(&str) -> Arc<T> + Send + Sync>;

/// Factories for one stage: exact model-id matches plus an optional fallback.
struct Backends<T: ?Sized> {
    by_model: HashMap<String, Factory<T>>,
    fallback: Option<Factory<T>>,
}

impl<T: ?Sized> Default for Backends<T> {
    fn default() -> Self {
        Self {
            by_model: HashMap::new(),
            fallback: None,
        }
    }
}

impl<T: ?Sized> Backends<T> {
    fn resolve(&self, stage: Stage, model_id: &str) -> Result<Arc<T>> {
        let factory = self
            .by_model
            .get(model_id)
            .or(self.fallback.as_ref())
            .ok_or_else(|| {
                PipelineError::initialization(
                    stage,
                    format!("no backend registered for model '{model_id}'"),
                )
            })?;
        Ok((**factory)(model_id))
    }
}

/// Registry of stage backends available to an orchestrator.
#[derive(Default)]
pub struct StageRegistry {
    vad: Backends<dyn VoiceActivityDetector>,
    stt: Backends<dyn SpeechRecognizer>,
    llm: Backends<dyn ResponseGenerator>,
    tts: Backends<dyn SpeechSynthesizer>,
}

/// Components instantiated for one session, in initialization order.
#[derive(Default, Clone)]
pub struct StageSet {
    pub vad: Option<Arc<dyn VoiceActivityDetector>>,
    pub stt: Option<Arc<dyn SpeechRecognizer>>,
    pub llm: Option<Arc<dyn ResponseGenerator>>,
    pub tts: Option<Arc<dyn SpeechSynthesizer>>,
}

impl StageSet {
    /// Stages currently held, in initialization order.
    pub fn stages(&self) -> Vec<Stage> {
        let mut stages = Vec::with_capacity(4);
        if self.vad.is_some() {
            stages.push(Stage::Vad);
        }
        if self.stt.is_some() {
            stages.push(Stage::Stt);
        }
        if self.llm.is_some() {
            stages.push(Stage::Llm);
        }
        if self.tts.is_some() {
            stages.push(Stage::Tts);
        }
        stages
    }

    /// Cancel whatever the stage is doing.
    pub fn cancel(&self, stage: Stage) {
        match stage {
            Stage::Vad => {
                if let Some(vad) = &self.vad {
                    vad.cancel();
                }
            }
            Stage::Stt => {
                if let Some(stt) = &self.stt {
                    stt.cancel();
                }
            }
            Stage::Llm => {
                if let Some(llm) = &self.llm {
                    llm.cancel();
                }
            }
            Stage::Tts => {
                if let Some(tts) = &self.tts {
                    tts.cancel();
                }
            }
            Stage::Audio | Stage::Session => {}
        }
    }

    /// Release every held component in reverse initialization order and
    /// forget them.
    pub async fn release_all(&mut self) {
        if let Some(tts) = self.tts.take() {
            tts.release().await;
        }
        if let Some(llm) = self.llm.take() {
            llm.release().await;
        }
        if let Some(stt) = self.stt.take() {
            stt.release().await;
        }
        if let Some(vad) = self.vad.take() {
            vad.release().await;
        }
    }
}

impl StageRegistry {
    /// Empty registry. VAD falls back to [`EnergyVad`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a VAD backend used for every session.
    pub fn with_vad<F>(mut self, factory: F) -> Self
    where
        F: Fn(&str) -> Arc<dyn VoiceActivityDetector> + Send + Sync + 'static,
    {
        self.vad.fallback = Some(Arc::new(factory));
        self
    }

    /// Register a recognizer for one model id.
    pub fn with_stt<F>(mut self, model_id: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&str) -> Arc<dyn SpeechRecognizer> + Send + Sync + 'static,
    {
        self.stt.by_model.insert(model_id.into(), Arc::new(factory));
        self
    }

    /// Register the recognizer used when no model id matches.
    pub fn with_default_stt<F>(mut self, factory: F) -> Self
    where
        F: Fn(&str) -> Arc<dyn SpeechRecognizer> + Send + Sync + 'static,
    {
        self.stt.fallback = Some(Arc::new(factory));
        self
    }

    /// Register a generator for one model id.
    pub fn with_llm<F>(mut self, model_id: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&str) -> Arc<dyn ResponseGenerator> + Send + Sync + 'static,
    {
        self.llm.by_model.insert(model_id.into(), Arc::new(factory));
        self
    }

    /// Register the generator used when no model id matches (or none is set).
    pub fn with_default_llm<F>(mut self, factory: F) -> Self
    where
        F: Fn(&str) -> Arc<dyn ResponseGenerator> + Send + Sync + 'static,
    {
        self.llm.fallback = Some(Arc::new(factory));
        self
    }

    /// Register a synthesizer for one model id.
    pub fn with_tts<F>(mut self, model_id: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&str) -> Arc<dyn SpeechSynthesizer> + Send + Sync + 'static,
    {
        self.tts.by_model.insert(model_id.into(), Arc::new(factory));
        self
    }

    /// Register the synthesizer used when no model id matches.
    pub fn with_default_tts<F>(mut self, factory: F) -> Self
    where
        F: Fn(&str) -> Arc<dyn SpeechSynthesizer> + Send + Sync + 'static,
    {
        self.tts.fallback = Some(Arc::new(factory));
        self
    }

    /// Fresh VAD instance for a session.
    pub fn create_vad(&self, config: &SessionConfig) -> Arc<dyn VoiceActivityDetector> {
        match &self.vad.fallback {
            Some(factory) => (**factory)(""),
            None => Arc::new(EnergyVad::new(&config.vad)),
        }
    }

    /// Fresh recognizer for `config.recognition_model`.
    pub fn create_stt(&self, config: &SessionConfig) -> Result<Arc<dyn SpeechRecognizer>> {
        self.stt.resolve(Stage::Stt, &config.recognition_model)
    }

    /// Fresh generator for `config.llm_model` (or the default generator).
    pub fn create_llm(&self, config: &SessionConfig) -> Result<Arc<dyn ResponseGenerator>> {
        self.llm
            .resolve(Stage::Llm, config.llm_model.as_deref().unwrap_or_default())
    }

    /// Fresh synthesizer for `config.tts_model`.
    pub fn create_tts(&self, config: &SessionConfig) -> Result<Arc<dyn SpeechSynthesizer>> {
        self.tts.resolve(Stage::Tts, &config.tts_model)
    }
}
