//! Turn-taking flags shared between the session actor and the capture thread
//!
//! All three flags live in one atomic word so the capture callback reads a
//! consistent snapshot, and so that AI speech onset clears the recording
//! flag in the same update that sets the speaking flag.

use std::sync::atomic::{AtomicU8, Ordering};

const RECORDING: u8 = 0b001;
const AI_SPEAKING: u8 = 0b010;
const CONNECTED: u8 = 0b100;

/// Snapshot of the turn flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TurnSnapshot {
    pub recording: bool,
    pub ai_speaking: bool,
    pub connected: bool,
}

impl TurnSnapshot {
    fn from_bits(bits: u8) -> Self {
        Self {
            recording: bits & RECORDING != 0,
            ai_speaking: bits & AI_SPEAKING != 0,
            connected: bits & CONNECTED != 0,
        }
    }

    /// A captured block may be transmitted only in this state.
    pub fn may_transmit(&self) -> bool {
        self.recording && self.connected && !self.ai_speaking
    }
}

#[derive(Debug, Default)]
pub struct TurnState {
    bits: AtomicU8,
}

impl TurnState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> TurnSnapshot {
        TurnSnapshot::from_bits(self.bits.load(Ordering::Acquire))
    }

    pub fn is_recording(&self) -> bool {
        self.snapshot().recording
    }

    pub fn is_ai_speaking(&self) -> bool {
        self.snapshot().ai_speaking
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot().connected
    }

    pub fn set_connected(&self, connected: bool) {
        if connected {
            self.bits.fetch_or(CONNECTED, Ordering::AcqRel);
        } else {
            self.bits.fetch_and(!CONNECTED, Ordering::AcqRel);
        }
    }

    /// Set the recording flag unless the AI is speaking or recording is
    /// already on. Returns true if the flag changed.
    pub fn try_start_recording(&self) -> bool {
        self.bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                if bits & (AI_SPEAKING | RECORDING) != 0 {
                    None
                } else {
                    Some(bits | RECORDING)
                }
            })
            .is_ok()
    }

    /// Clear the recording flag. Returns true if recording was on.
    pub fn stop_recording(&self) -> bool {
        self.bits.fetch_and(!RECORDING, Ordering::AcqRel) & RECORDING != 0
    }

    /// Mark the AI as speaking and force recording off. Returns true if
    /// recording was on.
    pub fn begin_ai_speech(&self) -> bool {
        let prev = self
            .bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((bits | AI_SPEAKING) & !RECORDING)
            })
            .unwrap_or_else(|bits| bits);
        prev & RECORDING != 0
    }

    pub fn end_ai_speech(&self) {
        self.bits.fetch_and(!AI_SPEAKING, Ordering::AcqRel);
    }

    /// Clear recording and speaking, keep the connection flag. Returns true
    /// if recording was on.
    pub fn reset(&self) -> bool {
        self.bits.fetch_and(CONNECTED, Ordering::AcqRel) & RECORDING != 0
    }
}
