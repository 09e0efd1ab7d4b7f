//! Audio capture and playback

pub mod capture;
pub mod pcm;
pub mod playback;
pub mod pulse;

pub use capture::{Capture, CaptureDevice, CaptureEvent, EnergyGate};
pub use pcm::AudioBuffer;
pub use playback::{PlaybackClock, PlaybackPipeline};
