//! Shared helpers for integration tests.
//!
//! Scripted stage backends with configurable latency and failures, synthetic
//! audio, and event collection utilities.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use talkloop::error::{PipelineError, Result};
use talkloop::pipeline::messages::{
    AudioChunk, AudioOutputChunk, GenerationRequest, Speaker, Utterance,
};
use talkloop::stage::{
    ResponseGenerator, SpeechRecognizer, SpeechSynthesizer, Stage, StageComponent,
    StageContext, StageOptions, StageOutput, StageStream, SynthesisProgress, Transcript,
};
use talkloop::{
    AudioIo, ChannelAudioSource, EventSubscription, PipelineEvent, PipelineOrchestrator,
    PlaybackSink, SessionConfig, StageRegistry,
};
use tokio::sync::mpsc;

pub(crate) const FRAME_MS: u64 = 20;
pub(crate) const SAMPLE_RATE: u32 = 16_000;
pub(crate) const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle calls observed on one scripted backend.
#[derive(Default)]
pub(crate) struct Calls {
    pub initialized: AtomicUsize,
    pub invoked: AtomicUsize,
    pub cancelled: AtomicUsize,
    pub released: AtomicUsize,
}

impl Calls {
    pub(crate) fn initialized(&self) -> usize {
        self.initialized.load(Ordering::SeqCst)
    }

    pub(crate) fn invoked(&self) -> usize {
        self.invoked.load(Ordering::SeqCst)
    }

    pub(crate) fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

/// How a scripted backend behaves beyond its outputs.
#[derive(Clone, Default)]
pub(crate) struct Behavior {
    /// Pause before every output.
    pub delay: Duration,
    /// Fail `initialize`.
    pub fail_init: bool,
    /// Yield a runtime error after this many outputs.
    pub fail_after: Option<usize>,
    /// Keep producing outputs after cancellation.
    pub ignore_cancel: bool,
}

struct Lifecycle {
    stage: Stage,
    behavior: Behavior,
    calls: Arc<Calls>,
}

impl Lifecycle {
    async fn initialize(&self) -> Result<()> {
        if self.behavior.fail_init {
            return Err(PipelineError::initialization(self.stage, "model weights missing"));
        }
        self.calls.initialized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Turn a scripted list of outputs into a stage stream honouring `behavior`.
fn scripted<T: Send + 'static>(
    stage: Stage,
    behavior: Behavior,
    outputs: Vec<StageOutput<T>>,
    ctx: StageContext,
) -> StageStream<T> {
    Box::pin(async_stream::stream! {
        for (index, output) in outputs.into_iter().enumerate() {
            if behavior.fail_after == Some(index) {
                yield Err(PipelineError::runtime(stage, "inference runtime crashed"));
                return;
            }
            if !behavior.delay.is_zero() {
                tokio::time::sleep(behavior.delay).await;
            }
            if ctx.is_cancelled() && !behavior.ignore_cancel {
                return;
            }
            yield Ok(output);
        }
    })
}

macro_rules! lifecycle_component {
    ($ty:ty, $name:literal) => {
        #[async_trait]
        impl StageComponent for $ty {
            fn name(&self) -> &str {
                $name
            }

            async fn initialize(&self, _options: &StageOptions) -> Result<()> {
                self.lifecycle.initialize().await
            }

            fn cancel(&self) {
                self.lifecycle.calls.cancelled.fetch_add(1, Ordering::SeqCst);
            }

            async fn release(&self) {
                self.lifecycle.calls.released.fetch_add(1, Ordering::SeqCst);
            }
        }
    };
}

/// Script for the recognizer.
#[derive(Clone)]
pub(crate) struct SttScript {
    pub partials: Vec<String>,
    pub text: String,
    /// Attribution attached to every hypothesis.
    pub speaker: Option<Speaker>,
    pub behavior: Behavior,
}

impl Default for SttScript {
    fn default() -> Self {
        Self {
            partials: vec!["what is".into(), "what is the weather".into()],
            text: "what is the weather".into(),
            speaker: None,
            behavior: Behavior {
                delay: Duration::from_millis(5),
                ..Behavior::default()
            },
        }
    }
}

pub(crate) struct ScriptedStt {
    script: SttScript,
    lifecycle: Lifecycle,
}

lifecycle_component!(ScriptedStt, "scripted-stt");

impl SpeechRecognizer for ScriptedStt {
    fn transcribe(&self, _utterance: Utterance, ctx: StageContext) -> StageStream<Transcript> {
        self.lifecycle.calls.invoked.fetch_add(1, Ordering::SeqCst);
        let hypothesis = |text: &String| Transcript {
            text: text.clone(),
            speaker: self.script.speaker.clone(),
        };
        let mut outputs: Vec<_> = self
            .script
            .partials
            .iter()
            .map(|p| StageOutput::Partial(hypothesis(p)))
            .collect();
        outputs.push(StageOutput::Final(hypothesis(&self.script.text)));
        scripted(Stage::Stt, self.script.behavior.clone(), outputs, ctx)
    }
}

/// Script for the generator. Deltas are followed by an empty final.
#[derive(Clone)]
pub(crate) struct LlmScript {
    pub deltas: Vec<String>,
    pub behavior: Behavior,
}

impl Default for LlmScript {
    fn default() -> Self {
        Self {
            deltas: vec!["It is ".into(), "sunny ".into(), "today.".into()],
            behavior: Behavior {
                delay: Duration::from_millis(5),
                ..Behavior::default()
            },
        }
    }
}

pub(crate) struct ScriptedLlm {
    script: LlmScript,
    requests: Arc<Mutex<Vec<GenerationRequest>>>,
    lifecycle: Lifecycle,
}

lifecycle_component!(ScriptedLlm, "scripted-llm");

impl ResponseGenerator for ScriptedLlm {
    fn generate(&self, request: GenerationRequest, ctx: StageContext) -> StageStream<String> {
        self.lifecycle.calls.invoked.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
        let mut outputs: Vec<_> = self
            .script
            .deltas
            .iter()
            .cloned()
            .map(StageOutput::Partial)
            .collect();
        outputs.push(StageOutput::Final(String::new()));
        scripted(Stage::Llm, self.script.behavior.clone(), outputs, ctx)
    }
}

/// Script for the synthesizer.
#[derive(Clone)]
pub(crate) struct TtsScript {
    pub chunks: usize,
    pub samples_per_chunk: usize,
    pub behavior: Behavior,
}

impl Default for TtsScript {
    fn default() -> Self {
        Self {
            chunks: 3,
            samples_per_chunk: 480,
            behavior: Behavior {
                delay: Duration::from_millis(5),
                ..Behavior::default()
            },
        }
    }
}

pub(crate) struct ScriptedTts {
    script: TtsScript,
    texts: Arc<Mutex<Vec<String>>>,
    lifecycle: Lifecycle,
}

lifecycle_component!(ScriptedTts, "scripted-tts");

impl SpeechSynthesizer for ScriptedTts {
    fn synthesize(&self, text: String, ctx: StageContext) -> StageStream<SynthesisProgress> {
        self.lifecycle.calls.invoked.fetch_add(1, Ordering::SeqCst);
        self.texts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(text);
        let n = self.script.chunks.max(1);
        let mut outputs: Vec<_> = (0..n)
            .map(|i| {
                StageOutput::Partial(SynthesisProgress {
                    audio: AudioOutputChunk::new(
                        vec![0.1_f32; self.script.samples_per_chunk],
                        24_000,
                    ),
                    fraction_complete: (i + 1) as f32 / n as f32,
                })
            })
            .collect();
        outputs.push(StageOutput::Final(SynthesisProgress {
            audio: AudioOutputChunk::new(Vec::<f32>::new(), 24_000),
            fraction_complete: 1.0,
        }));
        scripted(Stage::Tts, self.script.behavior.clone(), outputs, ctx)
    }
}

/// Orchestrator wired to scripted backends, plus what they observed.
pub(crate) struct Harness {
    pub orchestrator: PipelineOrchestrator,
    pub stt: Arc<Calls>,
    pub llm: Arc<Calls>,
    pub tts: Arc<Calls>,
    pub llm_requests: Arc<Mutex<Vec<GenerationRequest>>>,
    pub tts_texts: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    pub(crate) fn new(stt: SttScript, llm: LlmScript, tts: TtsScript) -> Self {
        Self::with_registry(stt, llm, tts, |registry| registry)
    }

    /// Like [`Harness::new`], with extra registrations (e.g. a VAD) applied
    /// to the registry before the orchestrator is built.
    pub(crate) fn with_registry(
        stt: SttScript,
        llm: LlmScript,
        tts: TtsScript,
        extend: impl FnOnce(StageRegistry) -> StageRegistry,
    ) -> Self {
        let stt_calls = Arc::new(Calls::default());
        let llm_calls = Arc::new(Calls::default());
        let tts_calls = Arc::new(Calls::default());
        let llm_requests = Arc::new(Mutex::new(Vec::new()));
        let tts_texts = Arc::new(Mutex::new(Vec::new()));

        let registry = StageRegistry::new()
            .with_default_stt({
                let calls = Arc::clone(&stt_calls);
                move |_| {
                    Arc::new(ScriptedStt {
                        script: stt.clone(),
                        lifecycle: Lifecycle {
                            stage: Stage::Stt,
                            behavior: stt.behavior.clone(),
                            calls: Arc::clone(&calls),
                        },
                    })
                }
            })
            .with_default_llm({
                let calls = Arc::clone(&llm_calls);
                let requests = Arc::clone(&llm_requests);
                move |_| {
                    Arc::new(ScriptedLlm {
                        script: llm.clone(),
                        requests: Arc::clone(&requests),
                        lifecycle: Lifecycle {
                            stage: Stage::Llm,
                            behavior: llm.behavior.clone(),
                            calls: Arc::clone(&calls),
                        },
                    })
                }
            })
            .with_default_tts({
                let calls = Arc::clone(&tts_calls);
                let texts = Arc::clone(&tts_texts);
                move |_| {
                    Arc::new(ScriptedTts {
                        script: tts.clone(),
                        texts: Arc::clone(&texts),
                        lifecycle: Lifecycle {
                            stage: Stage::Tts,
                            behavior: tts.behavior.clone(),
                            calls: Arc::clone(&calls),
                        },
                    })
                }
            });

        Self {
            orchestrator: PipelineOrchestrator::new(extend(registry)),
            stt: stt_calls,
            llm: llm_calls,
            tts: tts_calls,
            llm_requests,
            tts_texts,
        }
    }

    pub(crate) fn scripted() -> Self {
        Self::new(
            SttScript::default(),
            LlmScript::default(),
            TtsScript::default(),
        )
    }
}

/// Playback sink that records what it was asked to do.
#[derive(Clone, Default)]
pub(crate) struct RecordingSink {
    pub played: Arc<AtomicUsize>,
    pub stopped: Arc<AtomicUsize>,
}

impl PlaybackSink for RecordingSink {
    fn play(&self, _chunk: &AudioOutputChunk) {
        self.played.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Audio endpoints backed by a channel the test feeds.
pub(crate) fn channel_io() -> (mpsc::Sender<AudioChunk>, AudioIo) {
    let (tx, source) = ChannelAudioSource::channel(1024);
    (tx, AudioIo::new(source))
}

/// Synthetic 20ms frames: `speech_ms` of a loud tone, then `silence_ms` of
/// zeros, starting at `start`.
pub(crate) fn frames(start: Duration, speech_ms: u64, silence_ms: u64) -> Vec<AudioChunk> {
    let per_frame = (u64::from(SAMPLE_RATE) * FRAME_MS / 1000) as usize;
    let mut at = start;
    let mut out = Vec::new();
    for n in 0..(speech_ms / FRAME_MS) {
        let samples: Vec<f32> = (0..per_frame)
            .map(|i| {
                let t = (n as usize * per_frame + i) as f32 / SAMPLE_RATE as f32;
                0.3 * (2.0 * std::f32::consts::PI * 220.0 * t).sin()
            })
            .collect();
        out.push(AudioChunk::new(samples, SAMPLE_RATE, at));
        at += Duration::from_millis(FRAME_MS);
    }
    for _ in 0..(silence_ms / FRAME_MS) {
        out.push(AudioChunk::new(vec![0.0_f32; per_frame], SAMPLE_RATE, at));
        at += Duration::from_millis(FRAME_MS);
    }
    out
}

pub(crate) async fn feed(tx: &mpsc::Sender<AudioChunk>, chunks: Vec<AudioChunk>) {
    for chunk in chunks {
        tx.send(chunk).await.expect("session stopped pulling audio");
    }
}

/// Config for scripted tests: short silence timeout, defaults elsewhere.
pub(crate) fn test_config() -> SessionConfig {
    SessionConfig {
        recognition_model: "scripted".into(),
        tts_model: "scripted".into(),
        silence_timeout_ms: 800,
        ..SessionConfig::default()
    }
}

/// Read events until one satisfies `stop` (inclusive). Panics on timeout or
/// stream end.
pub(crate) async fn collect_until(
    sub: &mut EventSubscription,
    stop: impl Fn(&PipelineEvent) -> bool,
) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(EVENT_TIMEOUT, sub.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out; saw {:?}", names(&events)))
            .unwrap_or_else(|| panic!("stream ended; saw {:?}", names(&events)));
        let done = stop(&event);
        events.push(event);
        if done {
            return events;
        }
    }
}

/// Read every remaining event until the stream closes.
pub(crate) async fn collect_to_end(sub: &mut EventSubscription) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(EVENT_TIMEOUT, sub.recv()).await {
        events.push(event);
    }
    events
}

pub(crate) fn names(events: &[PipelineEvent]) -> Vec<&'static str> {
    events.iter().map(PipelineEvent::name).collect()
}

/// Event names without state changes, with runs of the same name collapsed.
pub(crate) fn shape(events: &[PipelineEvent]) -> Vec<&'static str> {
    let mut out: Vec<&'static str> = events
        .iter()
        .filter(|e| !matches!(e, PipelineEvent::StateChanged { .. }))
        .map(PipelineEvent::name)
        .collect();
    out.dedup();
    out
}

pub(crate) fn is_turn_completed(event: &PipelineEvent) -> bool {
    matches!(event, PipelineEvent::TurnCompleted { .. })
}

/// Read whatever arrives within `window`.
pub(crate) async fn collect_for(sub: &mut EventSubscription, window: Duration) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, sub.recv()).await {
        events.push(event);
    }
    events
}

/// Every `(from, to)` state change in order.
pub(crate) fn state_changes(
    events: &[PipelineEvent],
) -> Vec<(talkloop::SessionState, talkloop::SessionState)> {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::StateChanged { from, to } => Some((*from, *to)),
            _ => None,
        })
        .collect()
}
