//! Session state machine.
//!
//! The coordinator's control loop is the only writer. Everyone else reads
//! the current state through a `watch` channel or folds `StateChanged`
//! events.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::debug;

/// Lifecycle state of a voice session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Initial and terminal state.
    #[default]
    Disconnected,
    /// Stage components are being initialized.
    Connecting,
    /// All components ready; audio is not being pulled.
    Connected,
    /// Pulling audio and gating it through VAD (STT may be transcribing).
    Listening,
    /// A final transcript is being turned into a response.
    Processing,
    /// The response is being synthesized.
    Speaking,
    /// Unrecoverable failure; only `disconnect` leaves this state.
    Error,
}

impl SessionState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected | Error)
                | (Connected, Listening | Error | Disconnected)
                | (Listening, Processing | Connected | Error | Disconnected)
                | (Processing, Speaking | Listening | Connected | Error | Disconnected)
                | (Speaking, Listening | Connected | Error | Disconnected)
                | (Error, Disconnected)
        )
    }

    /// Whether audio is pulled from the source in this state.
    pub fn is_pulling_audio(self) -> bool {
        matches!(self, Self::Listening | Self::Processing | Self::Speaking)
    }

    /// Whether a generation or synthesis may be in flight.
    pub fn is_responding(self) -> bool {
        matches!(self, Self::Processing | Self::Speaking)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Holds the authoritative state and publishes every change.
#[derive(Debug)]
pub struct SessionStateMachine {
    state: SessionState,
    tx: watch::Sender<SessionState>,
}

impl SessionStateMachine {
    /// New machine in [`SessionState::Disconnected`], plus a reader.
    pub fn new() -> (Self, watch::Receiver<SessionState>) {
        let (tx, rx) = watch::channel(SessionState::Disconnected);
        (
            Self {
                state: SessionState::Disconnected,
                tx,
            },
            rx,
        )
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Apply a transition. Illegal transitions are ignored and return `None`;
    /// legal ones return the previous state.
    pub fn transition(&mut self, next: SessionState) -> Option<SessionState> {
        let from = self.state;
        if !from.can_transition_to(next) {
            debug!("ignoring illegal session transition {from} -> {next}");
            return None;
        }
        self.state = next;
        self.tx.send_replace(next);
        Some(from)
    }

    /// Another reader of the published state.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }
}
