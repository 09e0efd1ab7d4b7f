//! Client configuration from the environment

use crate::audio::pcm::SILENCE_THRESHOLD;
use crate::error::{Result, VoiceError};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DEFAULT_SERVER_URL: &str = "http://localhost:8080";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Voice bridge base URL (http, https, ws or wss)
    pub server_url: String,
    /// Base URL of the agent/document HTTP API
    pub api_url: String,
    pub session_id: String,
    /// PulseAudio source; `None` selects automatically
    pub capture_device: Option<String>,
    /// Prefer an echo-cancel source when selecting automatically
    pub echo_cancel: bool,
    pub silence_threshold: f32,
    /// How early the playback completion check fires
    pub schedule_lead: Duration,
    pub connect_timeout: Duration,
    pub record: bool,
    pub agent_type: Option<String>,
    pub documents: Vec<PathBuf>,
}

impl Config {
    /// Load from `VOXLINK_*` variables, honouring a `.env` file.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let server_url = var("VOXLINK_SERVER_URL")
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let api_url = var("VOXLINK_API_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("{}/api", server_url));
        let session_id = var("VOXLINK_SESSION_ID").unwrap_or_else(default_session_id);

        let silence_threshold: f32 =
            parse(&var, "VOXLINK_SILENCE_THRESHOLD")?.unwrap_or(SILENCE_THRESHOLD);
        if !(0.0..=1.0).contains(&silence_threshold) {
            return Err(VoiceError::Config(format!(
                "VOXLINK_SILENCE_THRESHOLD must be within [0, 1], got {}",
                silence_threshold
            )));
        }

        let documents = var("VOXLINK_DOCUMENTS")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            server_url,
            api_url,
            session_id,
            capture_device: var("VOXLINK_CAPTURE_DEVICE"),
            echo_cancel: parse_bool(&var, "VOXLINK_ECHO_CANCEL")?.unwrap_or(true),
            silence_threshold,
            schedule_lead: Duration::from_millis(
                parse(&var, "VOXLINK_SCHEDULE_LEAD_MS")?.unwrap_or(50),
            ),
            connect_timeout: Duration::from_secs(
                parse(&var, "VOXLINK_CONNECT_TIMEOUT_SECS")?.unwrap_or(10),
            ),
            record: parse_bool(&var, "VOXLINK_RECORD")?.unwrap_or(false),
            agent_type: var("VOXLINK_AGENT_TYPE"),
            documents,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            api_url: format!("{}/api", DEFAULT_SERVER_URL),
            session_id: default_session_id(),
            capture_device: None,
            echo_cancel: true,
            silence_threshold: SILENCE_THRESHOLD,
            schedule_lead: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(10),
            record: false,
            agent_type: None,
            documents: Vec::new(),
        }
    }
}

/// Milliseconds since the Unix epoch
fn default_session_id() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
        .to_string()
}

fn parse<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    var(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| VoiceError::Config(format!("{}={:?}: {}", key, raw, e)))
        })
        .transpose()
}

fn parse_bool(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
    var(key)
        .map(|raw| match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(VoiceError::Config(format!("{}={:?}: expected a boolean", key, raw))),
        })
        .transpose()
}
