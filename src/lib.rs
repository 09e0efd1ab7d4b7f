//! Voxlink - realtime voice client for a conversational AI bridge
//!
//! Streams microphone audio to the bridge over Socket.IO and plays the
//! synthesized replies back gaplessly, with the client falling silent while
//! the AI speaks.

#![forbid(unsafe_code)]

pub mod api;
pub mod audio;
pub mod config;
pub mod error;
pub mod recorder;
pub mod session;
pub mod transport;
pub mod turn;

pub use config::Config;
pub use error::{Result, VoiceError};
pub use session::runner::{Command, SessionHandle};
pub use session::state::{Phase, SessionStatus};
