//! Session orchestration: state machine, events, segmentation and the
//! per-session control loop.

pub mod coordinator;
pub mod events;
pub mod messages;
pub mod segmenter;
pub mod session;
pub mod state;
