//! Session protocol state machine
//!
//! Pure and synchronous: inputs go in through [`SessionMachine::on_input`],
//! the side effects they call for are queued and collected with
//! [`SessionMachine::drain_effects`]. The runner performs them.

use crate::transport::codec::{ClientEvent, ServerEvent};
use crate::turn::TurnState;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Lifecycle phase of a voice session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Disconnected,
    /// Transport up, session start requested
    Connected,
    /// Bridge accepted the session, capture is being initialized
    VoiceReady,
    /// Bridge reached the AI backend
    VoiceConnected,
    /// Capture ready, recording may be toggled
    Ready,
    /// Terminal until restart
    Error,
}

impl Phase {
    /// Phases in which the bridge is talking to us
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Phase::Connected | Phase::VoiceReady | Phase::VoiceConnected | Phase::Ready
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Disconnected => "disconnected",
            Phase::Connected => "connected",
            Phase::VoiceReady => "voice-ready",
            Phase::VoiceConnected => "voice-connected",
            Phase::Ready => "ready",
            Phase::Error => "error",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the machine reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    TransportConnected,
    TransportDisconnected(String),
    TransportFailed(String),
    Server(ServerEvent),
    CaptureReady,
    CaptureFailed(String),
    PlaybackFailed(String),
    /// Encoded block from the capture thread
    CaptureBlock(String),
    StartRecording,
    StopRecording,
    ToggleRecording,
}

/// Side effects requested by the machine, in the order they must happen
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send(ClientEvent),
    /// Acquire the microphone and build the processing chain
    InitCapture,
    ConnectChain,
    DisconnectChain,
    /// Hand an `audio-response` payload to playback
    Play(String),
    /// Discard queued audio and release the playback clock
    StopPlayback,
    CloseTransport,
    /// Release the microphone and the capture clock
    ReleaseCapture,
}

/// Snapshot published to whoever renders the session
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionStatus {
    pub phase: Phase,
    pub recording: bool,
    pub ai_speaking: bool,
    pub total_tokens: u64,
    pub last_error: Option<String>,
}

impl SessionStatus {
    pub fn can_record(&self) -> bool {
        self.phase == Phase::Ready && !self.ai_speaking
    }
}

pub struct SessionMachine {
    session_id: String,
    phase: Phase,
    turn: Arc<TurnState>,
    total_tokens: u64,
    last_error: Option<String>,
    torn_down: bool,
    /// Effect queue (drained after each input)
    effects: Vec<Effect>,
}

impl SessionMachine {
    pub fn new(session_id: impl Into<String>, turn: Arc<TurnState>) -> Self {
        Self {
            session_id: session_id.into(),
            phase: Phase::Disconnected,
            turn,
            total_tokens: 0,
            last_error: None,
            torn_down: false,
            effects: Vec::new(),
        }
    }

    pub fn on_input(&mut self, input: Input) {
        if self.torn_down {
            debug!("Session torn down, ignoring {:?}", input);
            return;
        }

        match (self.phase, input) {
            // ===== CONNECTION =====
            (Phase::Disconnected, Input::TransportConnected) => {
                info!("Transport connected, starting voice session {}", self.session_id);
                self.turn.set_connected(true);
                self.phase = Phase::Connected;
                self.effects.push(Effect::Send(ClientEvent::StartVoiceSession {
                    session_id: self.session_id.clone(),
                }));
            }

            (Phase::Connected, Input::Server(ServerEvent::VoiceSessionStarted)) => {
                info!("Voice session started, initializing capture");
                self.phase = Phase::VoiceReady;
                self.effects.push(Effect::InitCapture);
            }

            (Phase::VoiceReady, Input::Server(ServerEvent::VoiceConnected)) => {
                info!("Bridge connected to the AI backend");
                self.phase = Phase::VoiceConnected;
            }

            (Phase::Ready, Input::Server(ServerEvent::VoiceConnected)) => {
                debug!("Bridge connected after capture was ready");
            }

            (Phase::VoiceReady | Phase::VoiceConnected, Input::CaptureReady) => {
                info!("Capture ready, recording enabled");
                self.phase = Phase::Ready;
            }

            // ===== FAILURES =====
            (_, Input::Server(ServerEvent::Error { message }))
            | (_, Input::Server(ServerEvent::VoiceError { message })) => {
                error!("Bridge error: {}", message);
                self.fail(message);
            }

            (_, Input::TransportFailed(reason)) => {
                error!("Transport failed: {}", reason);
                self.turn.set_connected(false);
                self.fail(reason);
            }

            (_, Input::CaptureFailed(reason)) | (_, Input::PlaybackFailed(reason)) => {
                error!("Audio device failed: {}", reason);
                self.fail(reason);
            }

            (_, Input::Server(ServerEvent::VoiceDisconnected)) => {
                info!("Bridge ended the voice session");
                // socket stays open until teardown says goodbye
                self.disconnect(false);
            }

            (_, Input::TransportDisconnected(reason)) => {
                warn!("Transport disconnected: {}", reason);
                if self.phase != Phase::Error {
                    self.last_error = Some(format!("Connection lost: {}", reason));
                }
                self.disconnect(true);
            }

            (_, Input::Server(ServerEvent::TokenUsage { total_tokens })) => {
                debug!("Token usage: {}", total_tokens);
                self.total_tokens = total_tokens;
            }

            // Error halts everything below
            (Phase::Error, input) => {
                debug!("Session in error, ignoring {:?}", input);
            }

            // ===== TURN TAKING =====
            (phase, Input::Server(ServerEvent::AiSpeakingStart)) if phase.is_active() => {
                if self.turn.begin_ai_speech() {
                    info!("AI speaking, recording stopped");
                    self.effects.push(Effect::DisconnectChain);
                } else {
                    debug!("AI speaking");
                }
            }

            (_, Input::Server(ServerEvent::AiSpeakingEnd)) => {
                debug!("AI finished speaking");
                self.turn.end_ai_speech();
            }

            (phase, Input::Server(ServerEvent::AudioResponse { audio_data }))
                if phase.is_active() =>
            {
                self.effects.push(Effect::Play(audio_data));
            }

            (_, Input::CaptureBlock(payload)) => {
                // Blocks already in flight when the gate closed are dropped here
                if self.turn.snapshot().may_transmit() {
                    self.effects.push(Effect::Send(ClientEvent::AudioData(payload)));
                }
            }

            (_, Input::StartRecording) => self.start_recording(),

            (_, Input::StopRecording) => self.stop_recording(),

            (_, Input::ToggleRecording) => {
                if self.turn.is_recording() {
                    self.stop_recording();
                } else {
                    self.start_recording();
                }
            }

            (phase, input) => {
                debug!("Ignoring {:?} in phase {}", input, phase);
            }
        }
    }

    /// Queue the teardown sequence. Only the first call has any effect.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        info!("Tearing down voice session {}", self.session_id);

        if self.turn.stop_recording() {
            self.effects.push(Effect::DisconnectChain);
        }
        self.effects.push(Effect::StopPlayback);
        if self.turn.is_connected() {
            self.effects.push(Effect::Send(ClientEvent::StopVoiceSession));
        }
        self.effects.push(Effect::CloseTransport);
        self.effects.push(Effect::ReleaseCapture);

        self.turn.reset();
        self.turn.set_connected(false);
        if self.phase != Phase::Error {
            self.phase = Phase::Disconnected;
        }
        self.torn_down = true;
    }

    fn start_recording(&mut self) {
        if self.phase != Phase::Ready {
            debug!("Cannot record in phase {}", self.phase);
            return;
        }
        if self.turn.try_start_recording() {
            info!("Recording started");
            self.effects.push(Effect::ConnectChain);
        } else {
            debug!("Recording not started (AI speaking or already recording)");
        }
    }

    fn stop_recording(&mut self) {
        if self.turn.stop_recording() {
            info!("Recording stopped");
            self.effects.push(Effect::DisconnectChain);
        }
    }

    fn fail(&mut self, message: String) {
        if self.turn.stop_recording() {
            self.effects.push(Effect::DisconnectChain);
        }
        self.turn.end_ai_speech();
        self.last_error = Some(message);
        self.phase = Phase::Error;
    }

    fn disconnect(&mut self, transport_gone: bool) {
        if self.turn.reset() {
            self.effects.push(Effect::DisconnectChain);
        }
        if transport_gone {
            self.turn.set_connected(false);
        }
        // error is sticky
        if self.phase != Phase::Error {
            self.phase = Phase::Disconnected;
        }
    }

    pub fn drain_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn status(&self) -> SessionStatus {
        let turn = self.turn.snapshot();
        SessionStatus {
            phase: self.phase,
            recording: turn.recording,
            ai_speaking: turn.ai_speaking,
            total_tokens: self.total_tokens,
            last_error: self.last_error.clone(),
        }
    }
}
