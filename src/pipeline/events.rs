//! Pipeline events and the per-session event stream.
//!
//! Every observable transition of a session is published as a
//! [`PipelineEvent`] on its [`EventStream`]. Subscribers get their own
//! unbounded queue, so every event is delivered exactly once per subscriber
//! and in emission order. Late subscribers only see events emitted after
//! they attached.

use crate::error::PipelineError;
use crate::pipeline::messages::{AudioOutputChunk, GenerationChunk, TranscriptSegment};
use crate::pipeline::state::SessionState;
use crate::stage::Stage;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::Stream;

/// Everything a session reports to its observers.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// The session started pulling audio.
    PipelineStarted,
    /// A stage component is about to initialize.
    ComponentInitializing(Stage),
    /// A stage component is ready.
    ComponentInitialized(Stage),
    /// A stage component failed to initialize; the session is failing.
    ComponentInitializationFailed {
        stage: Stage,
        error: Arc<PipelineError>,
    },
    /// Every configured component is ready.
    AllComponentsInitialized,
    /// An utterance opened.
    VadSpeechStart,
    /// The open utterance closed.
    VadSpeechEnd,
    /// Superseding transcript hypothesis.
    SttPartialTranscript(TranscriptSegment),
    /// The one final transcript of an utterance.
    SttFinalTranscript(TranscriptSegment),
    /// Generation started for the current turn.
    LlmThinking,
    /// Generated token delta.
    LlmPartialResponse(GenerationChunk),
    /// Complete generated response.
    LlmFinalResponse(GenerationChunk),
    /// Synthesis started for the current turn.
    TtsStarted,
    /// Synthesized audio increment.
    TtsProgress {
        chunk: AudioOutputChunk,
        fraction_complete: f32,
    },
    /// Synthesis finished; `audio` is the whole response.
    TtsCompleted { audio: AudioOutputChunk },
    /// A turn ran to completion.
    TurnCompleted { turn_id: u64 },
    /// The session stopped pulling audio.
    PipelineCompleted,
    /// A stage reported an error.
    PipelineError {
        stage: Stage,
        error: Arc<PipelineError>,
    },
    /// The session state machine moved.
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
}

impl PipelineEvent {
    /// Stable camelCase name, matching the event catalogue.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PipelineStarted => "pipelineStarted",
            Self::ComponentInitializing(_) => "componentInitializing",
            Self::ComponentInitialized(_) => "componentInitialized",
            Self::ComponentInitializationFailed { .. } => "componentInitializationFailed",
            Self::AllComponentsInitialized => "allComponentsInitialized",
            Self::VadSpeechStart => "vadSpeechStart",
            Self::VadSpeechEnd => "vadSpeechEnd",
            Self::SttPartialTranscript(_) => "sttPartialTranscript",
            Self::SttFinalTranscript(_) => "sttFinalTranscript",
            Self::LlmThinking => "llmThinking",
            Self::LlmPartialResponse(_) => "llmPartialResponse",
            Self::LlmFinalResponse(_) => "llmFinalResponse",
            Self::TtsStarted => "ttsStarted",
            Self::TtsProgress { .. } => "ttsProgress",
            Self::TtsCompleted { .. } => "ttsCompleted",
            Self::TurnCompleted { .. } => "turnCompleted",
            Self::PipelineCompleted => "pipelineCompleted",
            Self::PipelineError { .. } => "pipelineError",
            Self::StateChanged { .. } => "stateChanged",
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<PipelineEvent>,
}

#[derive(Default)]
struct Inner {
    subscribers: Vec<Subscriber>,
    next_id: u64,
    emitted: u64,
    closed: bool,
}

/// Single-writer, multi-reader ordered event stream of one session.
#[derive(Clone, Default)]
pub struct EventStream {
    inner: Arc<Mutex<Inner>>,
}

impl EventStream {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach a subscriber. On a closed stream the subscription ends at once.
    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        if !inner.closed {
            inner.subscribers.push(Subscriber { id, tx });
        }
        EventSubscription {
            id,
            rx,
            stream: self.clone(),
        }
    }

    /// Detach a subscriber by id. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: u64) {
        self.lock().subscribers.retain(|s| s.id != id);
    }

    /// Publish an event to every current subscriber. Returns `false` once the
    /// stream is closed.
    pub fn emit(&self, event: PipelineEvent) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        inner.emitted += 1;
        inner
            .subscribers
            .retain(|s| s.tx.send(event.clone()).is_ok());
        true
    }

    /// Close the stream, ending every subscription after its queued events.
    /// Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        inner.closed = true;
        inner.subscribers.clear();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Number of events emitted so far.
    pub fn emitted(&self) -> u64 {
        self.lock().emitted
    }
}

/// An ordered view of a session's events from the moment of attachment.
///
/// Dropping the subscription detaches it.
pub struct EventSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<PipelineEvent>,
    stream: EventStream,
}

impl EventSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the stream is closed and drained.
    pub async fn recv(&mut self) -> Option<PipelineEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<PipelineEvent> {
        self.rx.try_recv().ok()
    }

    /// Detach explicitly.
    pub fn unsubscribe(self) {}
}

impl Stream for EventSubscription {
    type Item = PipelineEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.stream.unsubscribe(self.id);
    }
}
