//! Session orchestrator and the per-session control loop.
//!
//! [`PipelineOrchestrator`] owns the stage registry and the table of live
//! sessions. Each session runs one control loop task that is the single
//! writer of the session state. The loop selects over, in priority order:
//! caller commands, the session duration budget, the active stage's
//! deadline, the active stage's next output, and the next audio frame.
//!
//! At most one of STT, LLM and TTS is active at a time. VAD runs inline on
//! every frame so it keeps gating audio while a turn is in flight.

use crate::audio::{AudioIo, AudioSource, PlaybackSink};
use crate::config::{BargeInPolicy, SessionConfig};
use crate::error::{PipelineError, Result};
use crate::pipeline::events::{EventStream, EventSubscription, PipelineEvent};
use crate::pipeline::messages::{
    AudioChunk, AudioOutputChunk, ConversationTurn, GenerationChunk, GenerationRequest,
    TranscriptSegment, Utterance,
};
use crate::pipeline::segmenter::{Segmentation, UtteranceSegmenter};
use crate::pipeline::session::{Command, Session};
use crate::pipeline::state::{SessionState, SessionStateMachine};
use crate::stage::registry::{StageRegistry, StageSet};
use crate::stage::{
    Stage, StageComponent, StageContext, StageOptions, StageOutput, StageStream,
    SynthesisProgress, Transcript, VadDecision,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Creates sessions and keeps track of the live ones.
pub struct PipelineOrchestrator {
    registry: Arc<StageRegistry>,
    sessions: Mutex<HashMap<Uuid, Session>>,
}

impl PipelineOrchestrator {
    pub fn new(registry: StageRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Live sessions; closed ones are pruned on every access.
    fn sessions(&self) -> MutexGuard<'_, HashMap<Uuid, Session>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.retain(|_, session| !session.is_closed());
        sessions
    }

    /// Allocate a session in `disconnected` and spawn its control loop.
    ///
    /// Subscribers can attach before [`Session::connect`] emits anything.
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] if the configuration is invalid.
    pub fn open_session(&self, config: SessionConfig) -> Result<Session> {
        config.validate()?;

        let id = Uuid::new_v4();
        let config = Arc::new(config);
        let events = EventStream::new();
        let (machine, state_rx) = SessionStateMachine::new();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let session = Session::new(
            id,
            Arc::clone(&config),
            events.clone(),
            state_rx,
            command_tx,
        );
        let runner = SessionRunner::new(
            id,
            config,
            Arc::clone(&self.registry),
            machine,
            events,
            command_rx,
        );
        tokio::spawn(runner.run());

        self.sessions().insert(id, session.clone());
        info!("opened session {id}");
        Ok(session)
    }

    /// Open a session and connect it to `io`.
    ///
    /// The caller never gets a handle to a session that failed to connect,
    /// so on failure it is disconnected and dropped from the session table.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] for an invalid configuration and
    /// [`PipelineError::ComponentInitialization`] if a stage fails to load.
    pub async fn connect(&self, config: SessionConfig, io: AudioIo) -> Result<Session> {
        let session = self.open_session(config)?;
        if let Err(e) = session.connect(io).await {
            if let Err(cleanup) = session.disconnect().await {
                warn!("failed to disconnect session {}: {cleanup}", session.id());
            }
            self.sessions().remove(&session.id());
            return Err(e);
        }
        Ok(session)
    }

    /// Look up a live session.
    pub fn session(&self, id: Uuid) -> Option<Session> {
        self.sessions().get(&id).cloned()
    }

    /// Subscribe to a live session's events.
    pub fn subscribe(&self, id: Uuid) -> Option<EventSubscription> {
        self.session(id).map(|session| session.subscribe())
    }

    /// Ids of every live session.
    pub fn session_ids(&self) -> Vec<Uuid> {
        self.sessions().keys().copied().collect()
    }

    /// Disconnect every live session.
    pub async fn disconnect_all(&self) {
        let sessions: Vec<Session> = self.sessions().drain().map(|(_, s)| s).collect();
        for session in sessions {
            if let Err(e) = session.disconnect().await {
                warn!("failed to disconnect session {}: {e}", session.id());
            }
        }
    }
}

// -- Control loop --

/// The streaming stage currently producing output.
enum ActiveStream {
    Stt(StageStream<Transcript>),
    Llm(StageStream<String>),
    Tts(StageStream<SynthesisProgress>),
}

/// Next item of the active stream; `None` payloads mean the stream ended.
enum StageEvent {
    Stt(Option<Result<StageOutput<Transcript>>>),
    Llm(Option<Result<StageOutput<String>>>),
    Tts(Option<Result<StageOutput<SynthesisProgress>>>),
}

struct ActiveStage {
    stage: Stage,
    stream: ActiveStream,
    deadline: Instant,
    timeout: Duration,
    cancel: CancellationToken,
}

/// Per-turn scratch state.
struct Turn {
    id: u64,
    /// Latest STT hypothesis.
    transcript: Transcript,
    user_text: String,
    /// LLM deltas accumulated so far.
    response: String,
    /// Synthesized audio accumulated so far.
    audio: Vec<f32>,
    sample_rate: u32,
}

impl Turn {
    fn new(id: u64, sample_rate: u32) -> Self {
        Self {
            id,
            transcript: Transcript::default(),
            user_text: String::new(),
            response: String::new(),
            audio: Vec::new(),
            sample_rate,
        }
    }
}

struct SessionRunner {
    id: Uuid,
    config: Arc<SessionConfig>,
    registry: Arc<StageRegistry>,
    machine: SessionStateMachine,
    events: EventStream,
    commands: mpsc::UnboundedReceiver<Command>,
    stages: StageSet,
    source: Option<Box<dyn AudioSource>>,
    playback: Option<Box<dyn PlaybackSink>>,
    segmenter: UtteranceSegmenter,
    history: VecDeque<ConversationTurn>,
    active: Option<ActiveStage>,
    turn: Option<Turn>,
    expires_at: Option<Instant>,
    /// Samples per frame, fixed by the first accepted frame.
    frame_len: Option<usize>,
    source_exhausted: bool,
    cancel: CancellationToken,
    closed: bool,
}

impl SessionRunner {
    fn new(
        id: Uuid,
        config: Arc<SessionConfig>,
        registry: Arc<StageRegistry>,
        machine: SessionStateMachine,
        events: EventStream,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let segmenter = UtteranceSegmenter::new(&config);
        Self {
            id,
            config,
            registry,
            machine,
            events,
            commands,
            stages: StageSet::default(),
            source: None,
            playback: None,
            segmenter,
            history: VecDeque::new(),
            active: None,
            turn: None,
            expires_at: None,
            frame_len: None,
            source_exhausted: false,
            cancel: CancellationToken::new(),
            closed: false,
        }
    }

    async fn run(mut self) {
        debug!("session {} control loop started", self.id);
        while !self.closed {
            let expires_at = self.expires_at;
            let stage_deadline = self.active.as_ref().map(|a| a.deadline);
            let pulling = self.machine.state().is_pulling_audio()
                && self.source.is_some()
                && !self.source_exhausted;

            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("session {}: every handle dropped", self.id);
                        self.disconnect().await;
                    }
                },
                () = sleep_until_some(expires_at) => self.expire().await,
                () = sleep_until_some(stage_deadline) => self.stage_timed_out(),
                event = next_stage_output(&mut self.active) => self.on_stage_output(event),
                chunk = next_audio_chunk(&mut self.source), if pulling => match chunk {
                    Some(chunk) => self.on_audio(chunk).await,
                    None => self.on_source_exhausted(),
                },
            }
        }
        debug!("session {} control loop stopped", self.id);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { io, reply } => {
                let result = self.connect(io).await;
                let _ = reply.send(result);
            }
            Command::StartListening { reply } => {
                let _ = reply.send(self.start_listening());
            }
            Command::StopListening { reply } => {
                let _ = reply.send(self.stop_listening());
            }
            Command::Interrupt { reply } => {
                self.interrupt();
                let _ = reply.send(Ok(()));
            }
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn transition(&mut self, to: SessionState) {
        if let Some(from) = self.machine.transition(to) {
            debug!("session {}: {from} -> {to}", self.id);
            self.events.emit(PipelineEvent::StateChanged { from, to });
        }
    }

    fn emit_error(&self, stage: Stage, error: PipelineError) {
        self.events.emit(PipelineEvent::PipelineError {
            stage,
            error: Arc::new(error),
        });
    }

    // -- Commands --

    async fn connect(&mut self, io: AudioIo) -> Result<()> {
        let state = self.machine.state();
        if state != SessionState::Disconnected {
            return Err(PipelineError::InvalidState {
                command: "connect",
                state,
            });
        }

        let AudioIo {
            mut source,
            playback,
        } = io;
        self.transition(SessionState::Connecting);
        info!("session {} connecting", self.id);

        if let Err(e) = self.initialize_stages().await {
            error!("session {} failed to connect: {e}", self.id);
            self.stages.release_all().await;
            source.stop().await;
            self.transition(SessionState::Error);
            return Err(e);
        }

        self.source = Some(source);
        self.playback = playback;
        self.events.emit(PipelineEvent::AllComponentsInitialized);
        self.transition(SessionState::Connected);
        self.expires_at = Some(Instant::now() + self.config.max_session_duration());
        info!(
            "session {} connected with stages {:?}",
            self.id,
            self.stages.stages()
        );
        Ok(())
    }

    fn start_listening(&mut self) -> Result<()> {
        let state = self.machine.state();
        if state != SessionState::Connected {
            return Err(PipelineError::InvalidState {
                command: "start listening",
                state,
            });
        }
        self.transition(SessionState::Listening);
        self.events.emit(PipelineEvent::PipelineStarted);
        info!("session {} listening", self.id);
        Ok(())
    }

    fn stop_listening(&mut self) -> Result<()> {
        match self.machine.state() {
            SessionState::Connected => Ok(()),
            state if state.is_pulling_audio() => {
                self.abort_turn();
                self.segmenter.reset();
                if let Some(vad) = &self.stages.vad {
                    vad.reset();
                }
                self.transition(SessionState::Connected);
                self.events.emit(PipelineEvent::PipelineCompleted);
                info!("session {} stopped listening", self.id);
                Ok(())
            }
            state => Err(PipelineError::InvalidState {
                command: "stop listening",
                state,
            }),
        }
    }

    fn interrupt(&mut self) {
        let state = self.machine.state();
        if !state.is_responding() {
            debug!("session {}: nothing to interrupt while {state}", self.id);
            return;
        }
        info!("session {}: interrupting turn", self.id);
        self.abort_turn();
        self.transition(SessionState::Listening);
    }

    async fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        let state = self.machine.state();
        self.abort_turn();
        self.segmenter.reset();
        self.cancel.cancel();
        self.playback = None;
        if let Some(mut source) = self.source.take() {
            source.stop().await;
        }
        self.stages.release_all().await;
        self.expires_at = None;

        if state.is_pulling_audio() {
            self.events.emit(PipelineEvent::PipelineCompleted);
        }
        self.transition(SessionState::Disconnected);
        self.events.close();
        self.closed = true;
        info!("session {} disconnected", self.id);
    }

    async fn expire(&mut self) {
        let limit = self.config.max_session_duration();
        warn!(
            "session {} exceeded its {}ms budget",
            self.id,
            limit.as_millis()
        );
        self.emit_error(Stage::Session, PipelineError::SessionExpired { limit });
        self.disconnect().await;
    }

    // -- Initialization --

    async fn initialize_stages(&mut self) -> Result<()> {
        let config = Arc::clone(&self.config);
        let registry = Arc::clone(&self.registry);

        if config.enable_vad {
            self.events
                .emit(PipelineEvent::ComponentInitializing(Stage::Vad));
            let vad = registry.create_vad(&config);
            self.stages.vad = Some(Arc::clone(&vad));
            self.initialize_component(Stage::Vad, vad.as_ref(), None)
                .await?;
        }

        self.events
            .emit(PipelineEvent::ComponentInitializing(Stage::Stt));
        let stt = registry
            .create_stt(&config)
            .map_err(|e| self.initialization_failed(Stage::Stt, e))?;
        self.stages.stt = Some(Arc::clone(&stt));
        self.initialize_component(
            Stage::Stt,
            stt.as_ref(),
            Some(config.recognition_model.clone()),
        )
        .await?;

        if config.use_llm {
            self.events
                .emit(PipelineEvent::ComponentInitializing(Stage::Llm));
            let llm = registry
                .create_llm(&config)
                .map_err(|e| self.initialization_failed(Stage::Llm, e))?;
            self.stages.llm = Some(Arc::clone(&llm));
            self.initialize_component(Stage::Llm, llm.as_ref(), config.llm_model.clone())
                .await?;
        }

        if config.enable_tts {
            self.events
                .emit(PipelineEvent::ComponentInitializing(Stage::Tts));
            let tts = registry
                .create_tts(&config)
                .map_err(|e| self.initialization_failed(Stage::Tts, e))?;
            self.stages.tts = Some(Arc::clone(&tts));
            self.initialize_component(Stage::Tts, tts.as_ref(), Some(config.tts_model.clone()))
                .await?;
        }

        Ok(())
    }

    async fn initialize_component<T>(
        &mut self,
        stage: Stage,
        component: &T,
        model_id: Option<String>,
    ) -> Result<()>
    where
        T: StageComponent + ?Sized,
    {
        let options = StageOptions {
            model_id,
            language: self.config.language.clone(),
            sample_rate: self.config.audio.sample_rate,
            voice: self.config.voice.clone(),
            diarization: self.config.enable_diarization,
            streaming: self.config.enable_streaming,
        };
        let limit = self.config.timeouts.initialize();
        let result = match tokio::time::timeout(limit, component.initialize(&options)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::initialization(
                stage,
                format!("timed out after {}ms", limit.as_millis()),
            )),
        };

        match result {
            Ok(()) => {
                info!("{stage} initialized ({})", component.name());
                self.events.emit(PipelineEvent::ComponentInitialized(stage));
                Ok(())
            }
            Err(e) => Err(self.initialization_failed(stage, e)),
        }
    }

    /// Report a failed initialization and normalize the error.
    fn initialization_failed(&self, stage: Stage, error: PipelineError) -> PipelineError {
        let message = match error {
            PipelineError::ComponentInitialization { message, .. } => message,
            other => other.to_string(),
        };
        error!("{stage} failed to initialize: {message}");
        self.events
            .emit(PipelineEvent::ComponentInitializationFailed {
                stage,
                error: Arc::new(PipelineError::initialization(stage, message.clone())),
            });
        PipelineError::initialization(stage, message)
    }

    // -- Audio --

    async fn on_audio(&mut self, chunk: AudioChunk) {
        let checked = chunk.validate(&self.config.audio).and_then(|()| match self.frame_len {
            Some(expected) => chunk.validate_frame_len(expected),
            None => Ok(()),
        });
        if let Err(e) = checked {
            warn!("dropping audio frame at {:?}: {e}", chunk.timestamp);
            self.emit_error(Stage::Audio, e);
            return;
        }
        if self.frame_len.is_none() {
            self.frame_len = Some(chunk.samples.len());
        }

        let decision = self.classify(&chunk).await;
        if self.turn.is_some() {
            let barge_in = decision.is_speech()
                && self.config.barge_in == BargeInPolicy::Automatic
                && self.machine.state().is_responding();
            if !barge_in {
                return;
            }
            info!("session {}: speech during response, barging in", self.id);
            self.interrupt();
        }

        let segmentation = self.segmenter.push(chunk, decision);
        self.on_segmentation(segmentation);
    }

    async fn classify(&mut self, chunk: &AudioChunk) -> VadDecision {
        let Some(vad) = self.stages.vad.clone() else {
            return VadDecision::Speech;
        };
        match vad.detect(chunk).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!("VAD failed on frame at {:?}: {e}", chunk.timestamp);
                self.emit_error(Stage::Vad, e);
                VadDecision::Silence
            }
        }
    }

    fn on_segmentation(&mut self, segmentation: Segmentation) {
        match segmentation {
            Segmentation::Idle | Segmentation::Continued => {}
            Segmentation::Started => {
                debug!("session {}: speech started", self.id);
                self.events.emit(PipelineEvent::VadSpeechStart);
            }
            Segmentation::Finalized(utterance) => {
                self.events.emit(PipelineEvent::VadSpeechEnd);
                self.begin_turn(utterance);
            }
            Segmentation::Discarded => {
                debug!("session {}: utterance too short, discarded", self.id);
                self.events.emit(PipelineEvent::VadSpeechEnd);
            }
        }
    }

    fn on_source_exhausted(&mut self) {
        info!("session {}: audio source exhausted", self.id);
        self.source_exhausted = true;
        if self.turn.is_some() {
            return;
        }
        if let Some(segmentation) = self.segmenter.flush() {
            self.on_segmentation(segmentation);
        }
    }

    // -- Turn --

    fn begin_turn(&mut self, utterance: Utterance) {
        if let Some(vad) = &self.stages.vad {
            vad.reset();
        }
        let Some(stt) = self.stages.stt.clone() else {
            warn!("session {}: no recognizer, dropping utterance", self.id);
            return;
        };
        let turn_id = utterance.id;
        info!(
            "turn {turn_id}: transcribing {}ms of speech",
            utterance.duration().as_millis()
        );
        self.turn = Some(Turn::new(turn_id, self.config.audio.sample_rate));
        self.activate(Stage::Stt, turn_id, |ctx| {
            ActiveStream::Stt(stt.transcribe(utterance, ctx))
        });
    }

    fn stage_timeout(&self, stage: Stage) -> Duration {
        let timeouts = &self.config.timeouts;
        match stage {
            Stage::Llm => timeouts.llm(),
            Stage::Tts => timeouts.tts(),
            _ => timeouts.stt(),
        }
    }

    /// Start a stage invocation bounded by its timeout and the session budget.
    fn activate(
        &mut self,
        stage: Stage,
        turn_id: u64,
        start: impl FnOnce(StageContext) -> ActiveStream,
    ) {
        let timeout = self.stage_timeout(stage);
        let now = Instant::now();
        let mut deadline = now + timeout;
        let mut remaining = self.config.max_session_duration();
        if let Some(expires_at) = self.expires_at {
            deadline = deadline.min(expires_at);
            remaining = expires_at.saturating_duration_since(now);
        }
        let cancel = self.cancel.child_token();
        let ctx = StageContext::new(self.id, turn_id, deadline, remaining, cancel.clone());
        let stream = start(ctx);
        self.active = Some(ActiveStage {
            stage,
            stream,
            deadline,
            timeout,
            cancel,
        });
    }

    /// Cancel the active stage without waiting for it to acknowledge.
    fn cancel_active(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            self.stages.cancel(active.stage);
            debug!("session {}: cancelled {}", self.id, active.stage);
        }
    }

    fn stop_playback(&self) {
        if let Some(sink) = &self.playback {
            sink.stop();
        }
    }

    /// Drop the in-flight turn and silence playback.
    fn abort_turn(&mut self) {
        self.cancel_active();
        if let Some(turn) = self.turn.take() {
            debug!("session {}: dropped turn {}", self.id, turn.id);
        }
        self.stop_playback();
    }

    fn stage_timed_out(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.cancel.cancel();
        self.stages.cancel(active.stage);
        warn!(
            "session {}: {} timed out after {}ms",
            self.id,
            active.stage,
            active.timeout.as_millis()
        );
        self.emit_error(
            active.stage,
            PipelineError::StageTimeout {
                stage: active.stage,
                timeout: active.timeout,
            },
        );
        self.turn = None;
        self.stop_playback();
        if self.machine.state().is_responding() {
            self.transition(SessionState::Listening);
        }
    }

    fn fail(&mut self, stage: Stage, e: PipelineError) {
        error!("session {}: {stage} failed: {e}", self.id);
        self.abort_turn();
        self.segmenter.reset();
        self.emit_error(stage, e);
        self.transition(SessionState::Error);
    }

    fn complete_turn(&mut self) {
        self.active = None;
        let Some(turn) = self.turn.take() else {
            return;
        };
        if self.machine.state().is_responding() {
            self.transition(SessionState::Listening);
        }
        info!("turn {} completed", turn.id);
        self.events
            .emit(PipelineEvent::TurnCompleted { turn_id: turn.id });
    }

    fn on_stage_output(&mut self, event: StageEvent) {
        match event {
            StageEvent::Stt(output) => self.on_transcript_output(output),
            StageEvent::Llm(output) => self.on_generation_output(output),
            StageEvent::Tts(output) => self.on_synthesis_output(output),
        }
    }

    fn attribute(&self, mut transcript: Transcript) -> Transcript {
        if !self.config.enable_diarization {
            transcript.speaker = None;
        }
        transcript
    }

    fn on_transcript_output(&mut self, output: Option<Result<StageOutput<Transcript>>>) {
        let transcript = match output {
            Some(Ok(StageOutput::Partial(partial))) => {
                let partial = self.attribute(partial);
                if let Some(turn) = self.turn.as_mut() {
                    let segment = TranscriptSegment {
                        turn_id: turn.id,
                        text: partial.text.clone(),
                        is_final: false,
                        speaker: partial.speaker.clone(),
                    };
                    turn.transcript = partial;
                    self.events
                        .emit(PipelineEvent::SttPartialTranscript(segment));
                }
                return;
            }
            Some(Ok(StageOutput::Final(transcript))) => self.attribute(transcript),
            None => self
                .turn
                .as_mut()
                .map(|turn| std::mem::take(&mut turn.transcript))
                .unwrap_or_default(),
            Some(Err(e)) => {
                self.fail(Stage::Stt, e);
                return;
            }
        };
        self.active = None;
        self.on_final_transcript(transcript);
    }

    fn on_final_transcript(&mut self, transcript: Transcript) {
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        let turn_id = turn.id;
        let text = transcript.text.trim().to_owned();
        turn.user_text = text.clone();
        self.events
            .emit(PipelineEvent::SttFinalTranscript(TranscriptSegment {
                turn_id,
                text: transcript.text,
                is_final: true,
                speaker: transcript.speaker,
            }));

        if text.is_empty() {
            debug!("turn {turn_id}: empty transcript");
            self.complete_turn();
            return;
        }
        self.transition(SessionState::Processing);

        match self.stages.llm.clone() {
            Some(llm) if self.config.use_llm => {
                self.events.emit(PipelineEvent::LlmThinking);
                let request = GenerationRequest {
                    prompt: text,
                    history: self.history.iter().cloned().collect(),
                    model: self.config.llm_model.clone(),
                    language: self.config.language.clone(),
                };
                self.activate(Stage::Llm, turn_id, |ctx| {
                    ActiveStream::Llm(llm.generate(request, ctx))
                });
            }
            _ => self.speak(text),
        }
    }

    fn on_generation_output(&mut self, output: Option<Result<StageOutput<String>>>) {
        let response = match output {
            Some(Ok(StageOutput::Partial(delta))) => {
                if let Some(turn) = self.turn.as_mut() {
                    turn.response.push_str(&delta);
                    if self.config.enable_streaming {
                        self.events
                            .emit(PipelineEvent::LlmPartialResponse(GenerationChunk {
                                turn_id: turn.id,
                                text: delta,
                                is_final: false,
                            }));
                    }
                }
                return;
            }
            Some(Ok(StageOutput::Final(text))) => match self.turn.as_mut() {
                Some(turn) if text.is_empty() => std::mem::take(&mut turn.response),
                _ => text,
            },
            None => self
                .turn
                .as_mut()
                .map(|turn| std::mem::take(&mut turn.response))
                .unwrap_or_default(),
            Some(Err(e)) => {
                self.fail(Stage::Llm, e);
                return;
            }
        };
        self.active = None;
        self.on_response(response);
    }

    fn on_response(&mut self, response: String) {
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        let turn_id = turn.id;
        turn.response = response.clone();
        let user_text = turn.user_text.clone();
        self.events
            .emit(PipelineEvent::LlmFinalResponse(GenerationChunk {
                turn_id,
                text: response.clone(),
                is_final: true,
            }));
        append_conversation_turn(
            &mut self.history,
            ConversationTurn {
                user_text,
                assistant_text: response.clone(),
            },
            self.config.max_history_turns,
        );
        self.speak(response);
    }

    fn speak(&mut self, text: String) {
        let Some(turn_id) = self.turn.as_ref().map(|turn| turn.id) else {
            return;
        };
        match self.stages.tts.clone() {
            Some(tts) if !text.trim().is_empty() => {
                self.transition(SessionState::Speaking);
                self.events.emit(PipelineEvent::TtsStarted);
                self.activate(Stage::Tts, turn_id, |ctx| {
                    ActiveStream::Tts(tts.synthesize(text, ctx))
                });
            }
            _ => self.complete_turn(),
        }
    }

    fn on_synthesis_output(&mut self, output: Option<Result<StageOutput<SynthesisProgress>>>) {
        match output {
            Some(Ok(StageOutput::Partial(progress))) => self.on_synthesis_progress(progress),
            Some(Ok(StageOutput::Final(progress))) => {
                self.on_synthesis_progress(progress);
                self.finish_synthesis();
            }
            None => self.finish_synthesis(),
            Some(Err(e)) => self.fail(Stage::Tts, e),
        }
    }

    fn on_synthesis_progress(&mut self, progress: SynthesisProgress) {
        if progress.audio.is_empty() {
            return;
        }
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        turn.audio.extend_from_slice(&progress.audio.samples);
        turn.sample_rate = progress.audio.sample_rate;
        if let Some(sink) = &self.playback {
            sink.play(&progress.audio);
        }
        self.events.emit(PipelineEvent::TtsProgress {
            chunk: progress.audio,
            fraction_complete: progress.fraction_complete.clamp(0.0, 1.0),
        });
    }

    fn finish_synthesis(&mut self) {
        self.active = None;
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        let audio = AudioOutputChunk::new(std::mem::take(&mut turn.audio), turn.sample_rate);
        self.events.emit(PipelineEvent::TtsCompleted { audio });
        self.complete_turn();
    }
}

/// Append a finished exchange, keeping at most `max_turns` of history.
fn append_conversation_turn(
    history: &mut VecDeque<ConversationTurn>,
    turn: ConversationTurn,
    max_turns: usize,
) {
    history.push_back(turn);
    while history.len() > max_turns {
        history.pop_front();
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_stage_output(active: &mut Option<ActiveStage>) -> StageEvent {
    let Some(active) = active else {
        return std::future::pending().await;
    };
    match &mut active.stream {
        ActiveStream::Stt(stream) => StageEvent::Stt(stream.next().await),
        ActiveStream::Llm(stream) => StageEvent::Llm(stream.next().await),
        ActiveStream::Tts(stream) => StageEvent::Tts(stream.next().await),
    }
}

async fn next_audio_chunk(source: &mut Option<Box<dyn AudioSource>>) -> Option<AudioChunk> {
    match source {
        Some(source) => source.next_chunk().await,
        None => std::future::pending().await,
    }
}
