//! Voxlink - talk to a conversational AI bridge from the terminal
//!
//! Press enter (or `r`) to toggle recording, `q` to hang up.

#![forbid(unsafe_code)]

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use voxlink::api::{ApiClient, Document};
use voxlink::session::{runner, PulseBackend};
use voxlink::{Command, Config, Phase, SessionStatus};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env().context("Failed to load configuration")?;
    info!("Starting voxlink session {}", config.session_id);

    prepare_agent(&config).await;

    let backend = PulseBackend::from_config(&config);
    let mut session = runner::connect(&config, backend)
        .await
        .with_context(|| format!("Failed to connect to {}", config.server_url))?;
    let mut status = session.status();

    println!("Connected. <enter>/r toggles recording, q hangs up.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last = SessionStatus::default();
    let mut was_live = false;

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if current != last {
                    print_status(&current);
                }
                was_live |= current.phase.is_active();
                let ended = current.phase == Phase::Error
                    || (was_live && current.phase == Phase::Disconnected);
                last = current;
                if ended {
                    break;
                }
            }

            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => match line.trim() {
                        "" | "r" => {
                            if !last.recording && !last.can_record() {
                                println!("Recording is not available right now");
                            }
                            if session.send(Command::ToggleRecording).is_err() {
                                break;
                            }
                        }
                        "q" => break,
                        _ => println!("<enter>/r toggles recording, q hangs up"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        error!("Failed to read stdin: {}", e);
                        break;
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    session.shutdown().await;

    let fin = status.borrow().clone();
    if let Some(err) = &fin.last_error {
        eprintln!("Session ended with error: {}", err);
    }
    println!("Total tokens used: {}", fin.total_tokens);
    Ok(())
}

/// Register the agent type and upload documents. Failures are reported and
/// the session goes ahead without them.
async fn prepare_agent(config: &Config) {
    if config.agent_type.is_none() && config.documents.is_empty() {
        return;
    }

    let api = match ApiClient::new(&config.api_url) {
        Ok(api) => api,
        Err(e) => {
            warn!("Agent API unavailable: {}", e);
            return;
        }
    };

    if let Some(agent_type) = &config.agent_type {
        match api.agent_recommendations(Some(agent_type)).await {
            Ok(text) => println!("Recommended documents:\n{}\n", text),
            Err(e) => warn!("Failed to fetch recommendations: {}", e),
        }
        if let Err(e) = api.update_agent_type(&config.session_id, agent_type).await {
            warn!("Failed to set agent type: {}", e);
        }
    }

    if !config.documents.is_empty() {
        let mut documents = Vec::with_capacity(config.documents.len());
        for path in &config.documents {
            match Document::from_path(path).await {
                Ok(doc) => documents.push(doc),
                Err(e) => warn!("Skipping {:?}: {}", path, e),
            }
        }
        if !documents.is_empty() {
            if let Err(e) = api.upload_documents(&config.session_id, &documents).await {
                warn!("Failed to upload documents: {}", e);
            }
        }
    }
}

fn print_status(status: &SessionStatus) {
    let mut line = format!("[{}]", status.phase);
    if status.recording {
        line.push_str(" recording");
    }
    if status.ai_speaking {
        line.push_str(" AI speaking");
    }
    if status.total_tokens > 0 {
        line.push_str(&format!(" tokens={}", status.total_tokens));
    }
    if let Some(err) = &status.last_error {
        line.push_str(&format!(" error: {}", err));
    }
    println!("{}", line);
}
