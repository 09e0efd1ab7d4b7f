//! Voice session lifecycle

pub mod runner;
pub mod state;

pub use runner::{AudioBackend, PulseBackend, SessionOptions, VoiceSession};
pub use state::{Effect, Input, SessionMachine};
