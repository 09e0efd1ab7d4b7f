//! Socket.IO v5 over Engine.IO v4 text framing
//!
//! ```text
//! 0{"sid":..,"pingInterval":25000,..}   engine open
//! 2 / 3                                 engine ping / pong
//! 40 / 40{"sid":..}                     socket connect / connect ack
//! 42["event-name",payload]              socket event
//! 44{"message":..}                      socket connect error
//! 41 / 1                                socket disconnect / engine close
//! ```

use crate::error::{Result, VoiceError};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// Events the client emits
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StartVoiceSession { session_id: String },
    /// Base64 16-bit PCM block at 16 kHz
    AudioData(String),
    StopVoiceSession,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartVoiceSession { .. } => "start-voice-session",
            Self::AudioData(_) => "audio-data",
            Self::StopVoiceSession => "stop-voice-session",
        }
    }

    /// `42[...]` frame for this event
    pub fn encode(&self) -> Result<String> {
        let args = match self {
            Self::StartVoiceSession { session_id } => {
                json!([self.name(), { "sessionId": session_id }])
            }
            Self::AudioData(data) => json!([self.name(), data]),
            Self::StopVoiceSession => json!([self.name()]),
        };
        Ok(format!("42{}", serde_json::to_string(&args)?))
    }
}

/// Events the bridge emits
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    VoiceSessionStarted,
    VoiceConnected,
    AiSpeakingStart,
    AiSpeakingEnd,
    /// Base64 16-bit PCM chunk at 24 kHz
    AudioResponse { audio_data: String },
    TokenUsage { total_tokens: u64 },
    Error { message: String },
    VoiceError { message: String },
    VoiceDisconnected,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AudioResponsePayload {
    audio_data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenUsagePayload {
    total_tokens: f64,
}

#[derive(Deserialize)]
struct MessagePayload {
    #[serde(default)]
    message: Option<String>,
}

fn message_of(payload: Value) -> String {
    match payload {
        Value::String(message) => message,
        Value::Null => "unknown error".to_string(),
        other => serde_json::from_value::<MessagePayload>(other.clone())
            .ok()
            .and_then(|p| p.message)
            .unwrap_or_else(|| other.to_string()),
    }
}

impl ServerEvent {
    /// Map an event name and its first argument. `Ok(None)` for names this
    /// client does not handle.
    pub fn from_parts(name: &str, payload: Value) -> Result<Option<Self>> {
        let event = match name {
            "voice-session-started" => Self::VoiceSessionStarted,
            "voice-connected" => Self::VoiceConnected,
            "ai-speaking-start" => Self::AiSpeakingStart,
            "ai-speaking-end" => Self::AiSpeakingEnd,
            "audio-response" => {
                let p: AudioResponsePayload = serde_json::from_value(payload)?;
                Self::AudioResponse {
                    audio_data: p.audio_data,
                }
            }
            "token-usage" => {
                let p: TokenUsagePayload = serde_json::from_value(payload)?;
                Self::TokenUsage {
                    total_tokens: p.total_tokens.max(0.0) as u64,
                }
            }
            "error" => Self::Error {
                message: message_of(payload),
            },
            "voice-error" => Self::VoiceError {
                message: message_of(payload),
            },
            "voice-disconnected" => Self::VoiceDisconnected,
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

/// Engine.IO open handshake
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

impl Handshake {
    /// Silence longer than this means the connection is gone
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_interval + self.ping_timeout)
    }
}

/// One decoded text frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Open(Handshake),
    Close,
    Ping,
    Pong,
    Noop,
    /// Socket.IO connect acknowledged
    Connect,
    ConnectError(String),
    Disconnect,
    Event(ServerEvent),
    /// Event this client ignores
    Unhandled(String),
}

impl Frame {
    pub fn decode(text: &str) -> Result<Self> {
        let mut chars = text.chars();
        let kind = chars
            .next()
            .ok_or_else(|| VoiceError::Protocol("empty frame".into()))?;
        let rest = chars.as_str();

        match kind {
            '0' => Ok(Self::Open(serde_json::from_str(rest)?)),
            '1' => Ok(Self::Close),
            '2' => Ok(Self::Ping),
            '3' => Ok(Self::Pong),
            '4' => decode_socket_packet(rest),
            '6' => Ok(Self::Noop),
            other => Err(VoiceError::Protocol(format!(
                "unknown engine packet type '{}'",
                other
            ))),
        }
    }
}

/// Drop an optional `/namespace,` prefix and an optional ack id.
fn strip_namespace_and_ack(body: &str) -> &str {
    let body = if body.starts_with('/') {
        body.split_once(',').map(|(_, rest)| rest).unwrap_or("")
    } else {
        body
    };
    body.trim_start_matches(|c: char| c.is_ascii_digit())
}

fn decode_socket_packet(packet: &str) -> Result<Frame> {
    let mut chars = packet.chars();
    let kind = chars
        .next()
        .ok_or_else(|| VoiceError::Protocol("empty socket packet".into()))?;
    let body = chars.as_str();

    match kind {
        '0' => Ok(Frame::Connect),
        '1' => Ok(Frame::Disconnect),
        '2' => {
            let args: Vec<Value> = serde_json::from_str(strip_namespace_and_ack(body))?;
            let mut args = args.into_iter();
            let name = match args.next() {
                Some(Value::String(name)) => name,
                _ => return Err(VoiceError::Protocol("event without a name".into())),
            };
            let payload = args.next().unwrap_or(Value::Null);
            match ServerEvent::from_parts(&name, payload)? {
                Some(event) => Ok(Frame::Event(event)),
                None => Ok(Frame::Unhandled(name)),
            }
        }
        '4' => {
            let payload =
                serde_json::from_str(strip_namespace_and_ack(body)).unwrap_or(Value::Null);
            Ok(Frame::ConnectError(message_of(payload)))
        }
        other => Err(VoiceError::Protocol(format!(
            "unsupported socket packet type '{}'",
            other
        ))),
    }
}

/// Client frames that are not events
pub const CONNECT_FRAME: &str = "40";
pub const DISCONNECT_FRAME: &str = "41";
pub const PONG_FRAME: &str = "3";

/// Websocket endpoint for a bridge base URL.
pub fn socket_url(base: &str) -> Result<String> {
    let base = base.trim().trim_end_matches('/');
    let (scheme, rest) = base
        .split_once("://")
        .ok_or_else(|| VoiceError::Config(format!("server URL without scheme: {}", base)))?;
    let scheme = match scheme {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(VoiceError::Config(format!(
                "unsupported server URL scheme: {}",
                other
            )))
        }
    };
    Ok(format!(
        "{}://{}/socket.io/?EIO=4&transport=websocket",
        scheme, rest
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_encoding() {
        let start = ClientEvent::StartVoiceSession {
            session_id: "abc".to_string(),
        };
        assert_eq!(
            start.encode().unwrap(),
            r#"42["start-voice-session",{"sessionId":"abc"}]"#
        );
        assert_eq!(
            ClientEvent::AudioData("AAEC".to_string()).encode().unwrap(),
            r#"42["audio-data","AAEC"]"#
        );
        assert_eq!(
            ClientEvent::StopVoiceSession.encode().unwrap(),
            r#"42["stop-voice-session"]"#
        );
    }

    #[test]
    fn test_engine_frames() {
        let open = Frame::decode(
            r#"0{"sid":"lv_VI97HAXpY6yYWAAAC","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#,
        )
        .unwrap();
        match open {
            Frame::Open(handshake) => {
                assert_eq!(handshake.sid, "lv_VI97HAXpY6yYWAAAC");
                assert_eq!(handshake.liveness_timeout(), Duration::from_secs(45));
            }
            other => panic!("Unexpected frame: {:?}", other),
        }
        assert_eq!(Frame::decode("2").unwrap(), Frame::Ping);
        assert_eq!(Frame::decode("3").unwrap(), Frame::Pong);
        assert_eq!(Frame::decode("1").unwrap(), Frame::Close);
        assert_eq!(Frame::decode("6").unwrap(), Frame::Noop);
        assert_eq!(Frame::decode(r#"40{"sid":"x"}"#).unwrap(), Frame::Connect);
        assert_eq!(Frame::decode("41").unwrap(), Frame::Disconnect);
        assert!(Frame::decode("").is_err());
        assert!(Frame::decode("9").is_err());
    }

    #[test]
    fn test_server_events() {
        assert_eq!(
            Frame::decode(r#"42["voice-session-started"]"#).unwrap(),
            Frame::Event(ServerEvent::VoiceSessionStarted)
        );
        assert_eq!(
            Frame::decode(r#"42["ai-speaking-start"]"#).unwrap(),
            Frame::Event(ServerEvent::AiSpeakingStart)
        );
        assert_eq!(
            Frame::decode(r#"42["audio-response",{"audioData":"AAAA"}]"#).unwrap(),
            Frame::Event(ServerEvent::AudioResponse {
                audio_data: "AAAA".to_string()
            })
        );
        assert_eq!(
            Frame::decode(r#"42["token-usage",{"totalTokens":1234}]"#).unwrap(),
            Frame::Event(ServerEvent::TokenUsage { total_tokens: 1234 })
        );
        assert_eq!(
            Frame::decode(r#"42["voice-error",{"message":"Gemini unavailable"}]"#).unwrap(),
            Frame::Event(ServerEvent::VoiceError {
                message: "Gemini unavailable".to_string()
            })
        );
        assert_eq!(
            Frame::decode(r#"42["error","boom"]"#).unwrap(),
            Frame::Event(ServerEvent::Error {
                message: "boom".to_string()
            })
        );
        assert_eq!(
            Frame::decode(r#"42["transcript",{"text":"hi"}]"#).unwrap(),
            Frame::Unhandled("transcript".to_string())
        );
    }

    #[test]
    fn test_namespace_and_ack_prefixes() {
        assert_eq!(
            Frame::decode(r#"42/voice,17["voice-connected"]"#).unwrap(),
            Frame::Event(ServerEvent::VoiceConnected)
        );
        assert_eq!(
            Frame::decode(r#"4212["ai-speaking-end"]"#).unwrap(),
            Frame::Event(ServerEvent::AiSpeakingEnd)
        );
    }

    #[test]
    fn test_malformed_events() {
        assert!(Frame::decode(r#"42[]"#).is_err());
        assert!(Frame::decode(r#"42[7]"#).is_err());
        assert!(Frame::decode(r#"42["audio-response",{}]"#).is_err());
        assert!(Frame::decode("42not json").is_err());
    }

    #[test]
    fn test_connect_error() {
        assert_eq!(
            Frame::decode(r#"44{"message":"Not authorized"}"#).unwrap(),
            Frame::ConnectError("Not authorized".to_string())
        );
    }

    #[test]
    fn test_socket_url() {
        assert_eq!(
            socket_url("https://bridge.example.com/").unwrap(),
            "wss://bridge.example.com/socket.io/?EIO=4&transport=websocket"
        );
        assert_eq!(
            socket_url("http://localhost:8080").unwrap(),
            "ws://localhost:8080/socket.io/?EIO=4&transport=websocket"
        );
        assert!(socket_url("localhost:8080").is_err());
        assert!(socket_url("ftp://x").is_err());
    }
}
