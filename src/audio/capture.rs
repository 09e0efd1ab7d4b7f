//! Microphone capture pipeline
//!
//! A dedicated OS thread owns the capture device and reads fixed-size blocks
//! from it. Each block passes the energy gate and, if it qualifies, is
//! quantized, base64 encoded and handed to the session actor as a
//! [`CaptureEvent::Block`]. The thread only reads while the processing chain
//! is connected; disconnecting the chain is how recording stops.

use crate::audio::pcm::{encode_block, peak_amplitude, quantize_block};
use crate::error::{Result, VoiceError};
use crate::turn::TurnState;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// A source of mono float samples in [-1.0, 1.0].
pub trait CaptureDevice {
    /// Fill `block` completely, blocking until enough audio is available.
    fn read_block(&mut self, block: &mut [f32]) -> Result<()>;

    /// Discard audio buffered while nobody was reading.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Device name, if a specific one was selected
    fn name(&self) -> Option<&str> {
        None
    }
}

/// Opens the capture device. Runs on the capture thread, so the device
/// itself never has to cross threads.
pub type CaptureOpener = Box<dyn FnOnce() -> Result<Box<dyn CaptureDevice>> + Send>;

/// What the gate decided for one block
#[derive(Debug, Clone, PartialEq)]
pub enum BlockOutcome {
    /// Encoded block ready for an `audio-data` event
    Transmit(String),
    /// Not recording, not connected, or the AI is speaking
    Gated,
    /// Peak amplitude below the silence threshold
    Silent,
}

/// Decides per block whether it goes on the wire.
#[derive(Debug, Clone)]
pub struct EnergyGate {
    turn: Arc<TurnState>,
    threshold: f32,
}

impl EnergyGate {
    pub fn new(turn: Arc<TurnState>, threshold: f32) -> Self {
        Self { turn, threshold }
    }

    pub fn process_block(&self, block: &[f32]) -> BlockOutcome {
        if !self.turn.snapshot().may_transmit() {
            return BlockOutcome::Gated;
        }

        let peak = peak_amplitude(block);
        if peak < self.threshold {
            trace!("Dropping silent block (peak {:.4})", peak);
            return BlockOutcome::Silent;
        }

        BlockOutcome::Transmit(encode_block(&quantize_block(block)))
    }
}

/// Events emitted by the capture thread
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// Device acquired; the chain can be connected
    Ready { device: Option<String> },
    /// One encoded block to transmit
    Block(String),
    /// Device could not be opened or failed while reading
    Failed(String),
}

#[derive(Debug)]
enum ChainCommand {
    Connect,
    Disconnect,
    Shutdown,
}

/// Handle to the capture thread.
pub struct Capture {
    commands: std_mpsc::Sender<ChainCommand>,
    handle: Option<JoinHandle<()>>,
    connected: bool,
}

impl Capture {
    /// Spawn the capture thread. Device acquisition happens on that thread;
    /// its result arrives as [`CaptureEvent::Ready`] or [`CaptureEvent::Failed`].
    pub fn spawn(
        opener: CaptureOpener,
        gate: EnergyGate,
        events: mpsc::UnboundedSender<CaptureEvent>,
        block_size: usize,
    ) -> Result<Self> {
        let (commands, command_rx) = std_mpsc::channel();

        let handle = std::thread::Builder::new()
            .name("voxlink-capture".to_string())
            .spawn(move || {
                let device = match opener() {
                    Ok(device) => device,
                    Err(e) => {
                        error!("Failed to open capture device: {}", e);
                        let _ = events.send(CaptureEvent::Failed(e.to_string()));
                        return;
                    }
                };

                let name = device.name().map(str::to_string);
                info!("Capture device ready: {}", name.as_deref().unwrap_or("default"));
                if events.send(CaptureEvent::Ready { device: name }).is_err() {
                    return;
                }

                if let Err(e) = capture_loop(device, gate, &events, command_rx, block_size) {
                    error!("Capture error: {}", e);
                    let _ = events.send(CaptureEvent::Failed(e.to_string()));
                }
                info!("Capture thread stopped");
            })
            .map_err(|e| VoiceError::Device(format!("Failed to spawn capture thread: {}", e)))?;

        Ok(Self {
            commands,
            handle: Some(handle),
            connected: false,
        })
    }

    /// Connect the processing chain. Returns false if already connected or
    /// the thread is gone.
    pub fn connect(&mut self) -> bool {
        if self.connected || self.handle.is_none() {
            return false;
        }
        if self.commands.send(ChainCommand::Connect).is_err() {
            warn!("Capture thread is gone, cannot connect chain");
            return false;
        }
        debug!("Capture chain connected");
        self.connected = true;
        true
    }

    /// Disconnect the processing chain. No further blocks are read after the
    /// one currently in flight.
    pub fn disconnect(&mut self) -> bool {
        if !self.connected {
            return false;
        }
        self.connected = false;
        let _ = self.commands.send(ChainCommand::Disconnect);
        debug!("Capture chain disconnected");
        true
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Stop the thread and release the device. Safe to call repeatedly;
    /// returns once the device has been dropped.
    pub fn shutdown(&mut self) {
        self.connected = false;
        if let Some(handle) = self.handle.take() {
            let _ = self.commands.send(ChainCommand::Shutdown);
            if handle.join().is_err() {
                error!("Capture thread panicked");
            }
        }
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn capture_loop(
    mut device: Box<dyn CaptureDevice>,
    gate: EnergyGate,
    events: &mpsc::UnboundedSender<CaptureEvent>,
    commands: std_mpsc::Receiver<ChainCommand>,
    block_size: usize,
) -> Result<()> {
    let mut block = vec![0.0f32; block_size];
    let mut connected = false;

    loop {
        let command = if connected {
            match commands.try_recv() {
                Ok(command) => Some(command),
                Err(std_mpsc::TryRecvError::Empty) => None,
                Err(std_mpsc::TryRecvError::Disconnected) => Some(ChainCommand::Shutdown),
            }
        } else {
            // Parked until the chain is connected again
            Some(commands.recv().unwrap_or(ChainCommand::Shutdown))
        };

        match command {
            Some(ChainCommand::Connect) => {
                if !connected {
                    device.flush()?;
                    connected = true;
                }
                continue;
            }
            Some(ChainCommand::Disconnect) => {
                connected = false;
                continue;
            }
            Some(ChainCommand::Shutdown) => return Ok(()),
            None => {}
        }

        device.read_block(&mut block)?;

        match gate.process_block(&block) {
            BlockOutcome::Transmit(payload) => {
                if events.send(CaptureEvent::Block(payload)).is_err() {
                    return Ok(());
                }
            }
            BlockOutcome::Gated | BlockOutcome::Silent => {}
        }
    }
}
