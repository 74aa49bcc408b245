//! Audio input and output endpoints of a session.
//!
//! Capture devices and speakers are owned by the caller. A session pulls
//! frames from an [`AudioSource`] and hands synthesized speech to an
//! optional [`PlaybackSink`].

pub mod wav;

use crate::pipeline::messages::{AudioChunk, AudioOutputChunk};
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use wav::WavFileSource;

/// Pull-based supplier of fixed-size audio frames.
#[async_trait]
pub trait AudioSource: Send {
    /// Next frame, or `None` once the source is exhausted.
    async fn next_chunk(&mut self) -> Option<AudioChunk>;

    /// Stop producing audio. Called once when the session lets go of the source.
    async fn stop(&mut self) {}
}

/// Receiver of synthesized speech.
pub trait PlaybackSink: Send + Sync {
    /// Queue one chunk for playback.
    fn play(&self, chunk: &AudioOutputChunk);

    /// Drop anything queued or playing (interrupt, stop, disconnect).
    fn stop(&self) {}
}

/// The audio endpoints handed to a session on connect.
pub struct AudioIo {
    pub(crate) source: Box<dyn AudioSource>,
    pub(crate) playback: Option<Box<dyn PlaybackSink>>,
}

impl AudioIo {
    /// Input only; synthesized audio is reported through events.
    pub fn new(source: impl AudioSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            playback: None,
        }
    }

    /// Also route synthesized audio to `sink`.
    #[must_use]
    pub fn with_playback(mut self, sink: impl PlaybackSink + 'static) -> Self {
        self.playback = Some(Box::new(sink));
        self
    }
}

impl std::fmt::Debug for AudioIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioIo")
            .field("playback", &self.playback.is_some())
            .finish_non_exhaustive()
    }
}

/// Push-style capture: frames are sent into a bounded channel by a
/// capture callback or a test, and pulled by the session.
pub struct ChannelAudioSource {
    rx: mpsc::Receiver<AudioChunk>,
}

impl ChannelAudioSource {
    pub fn new(rx: mpsc::Receiver<AudioChunk>) -> Self {
        Self { rx }
    }

    /// Sender and source pair with room for `capacity` frames.
    pub fn channel(capacity: usize) -> (mpsc::Sender<AudioChunk>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl AudioSource for ChannelAudioSource {
    async fn next_chunk(&mut self) -> Option<AudioChunk> {
        self.rx.recv().await
    }

    async fn stop(&mut self) {
        self.rx.close();
    }
}
