//! Socket.IO transport to the voice bridge

pub mod client;
pub mod codec;

pub use client::{connect, TransportEvent, TransportHandle};
pub use codec::{ClientEvent, ServerEvent};
