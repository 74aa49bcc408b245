//! Caller-side handle of a voice session.
//!
//! A [`Session`] is a cheap, cloneable handle. Every command travels over one
//! ordered channel to the session's control loop and is answered through a
//! oneshot reply, so commands are applied in the order they were issued.

use crate::audio::AudioIo;
use crate::config::SessionConfig;
use crate::error::{PipelineError, Result};
use crate::pipeline::events::{EventStream, EventSubscription};
use crate::pipeline::state::SessionState;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

type Reply = oneshot::Sender<Result<()>>;

/// Commands accepted by the control loop.
pub(crate) enum Command {
    Connect { io: AudioIo, reply: Reply },
    StartListening { reply: Reply },
    StopListening { reply: Reply },
    Interrupt { reply: Reply },
    Disconnect { reply: Reply },
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::StartListening { .. } => "start listening",
            Self::StopListening { .. } => "stop listening",
            Self::Interrupt { .. } => "interrupt",
            Self::Disconnect { .. } => "disconnect",
        }
    }
}

struct Shared {
    id: Uuid,
    created_at: DateTime<Utc>,
    config: Arc<SessionConfig>,
    events: EventStream,
    state: watch::Receiver<SessionState>,
    commands: mpsc::UnboundedSender<Command>,
}

/// Handle to one voice session owned by a [`PipelineOrchestrator`].
///
/// [`PipelineOrchestrator`]: crate::pipeline::coordinator::PipelineOrchestrator
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        id: Uuid,
        config: Arc<SessionConfig>,
        events: EventStream,
        state: watch::Receiver<SessionState>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                created_at: Utc::now(),
                config,
                events,
                state,
                commands,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.shared.created_at
    }

    /// Configuration captured when the session was opened.
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Current state as last published by the control loop.
    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every published state.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.clone()
    }

    /// Attach an event subscriber. Only events emitted from now on are seen.
    pub fn subscribe(&self) -> EventSubscription {
        self.shared.events.subscribe()
    }

    /// Whether the session has been disconnected and its stream closed.
    pub fn is_closed(&self) -> bool {
        self.shared.events.is_closed() || self.shared.commands.is_closed()
    }

    /// Initialize every configured stage and take ownership of the audio
    /// endpoints. Leaves the session `connected`, or `error` on failure.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ComponentInitialization`] if a stage fails
    /// to initialize and [`PipelineError::InvalidState`] unless the session
    /// is `disconnected`.
    pub async fn connect(&self, io: AudioIo) -> Result<()> {
        self.request(|reply| Command::Connect { io, reply }, false)
            .await
    }

    /// Start pulling audio. Requires `connected`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidState`] from any other state.
    pub async fn start_listening(&self) -> Result<()> {
        self.request(|reply| Command::StartListening { reply }, false)
            .await
    }

    /// Stop pulling audio and cancel any in-flight stage. A no-op when
    /// already `connected`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidState`] while `connecting` or in `error`.
    pub async fn stop_listening(&self) -> Result<()> {
        self.request(|reply| Command::StopListening { reply }, true)
            .await
    }

    /// Cancel the in-flight generation or synthesis and return to
    /// `listening`. A no-op in every other state.
    ///
    /// # Errors
    ///
    /// Never fails today; the `Result` keeps the command surface uniform.
    pub async fn interrupt(&self) -> Result<()> {
        self.request(|reply| Command::Interrupt { reply }, true)
            .await
    }

    /// Cancel everything, release all stage components and the audio source,
    /// and close the event stream. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Never fails today; the `Result` keeps the command surface uniform.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Command::Disconnect { reply }, true)
            .await
    }

    async fn request(
        &self,
        make: impl FnOnce(Reply) -> Command,
        no_op_when_closed: bool,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        let command = make(reply);
        let name = command.name();
        if self.shared.commands.send(command).is_err() {
            return self.closed(name, no_op_when_closed);
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => self.closed(name, no_op_when_closed),
        }
    }

    fn closed(&self, command: &'static str, no_op: bool) -> Result<()> {
        if no_op {
            Ok(())
        } else {
            Err(PipelineError::InvalidState {
                command,
                state: self.state(),
            })
        }
    }
}
