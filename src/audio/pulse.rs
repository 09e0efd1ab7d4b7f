//! PulseAudio backends
//!
//! Capture reads 32-bit float mono at 16 kHz through the simple API.
//! Playback writes 32-bit float mono at 24 kHz from a writer thread that
//! turns absolute start times into silence padding, so buffers scheduled
//! back to back are written back to back.

use crate::audio::capture::CaptureDevice;
use crate::audio::pcm::{AudioBuffer, CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
use crate::audio::playback::PlaybackClock;
use crate::error::{Result, VoiceError};
use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use libpulse_binding::def::{BufferAttr, Retval};
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::proplist::{properties, Proplist};
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// A PulseAudio source
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// Source name as PulseAudio knows it
    pub name: String,
    pub description: String,
    pub sample_rate: u32,
    pub channels: u8,
    /// Monitor of an output rather than a microphone
    pub is_monitor: bool,
}

impl AudioDevice {
    /// Sources created by module-echo-cancel (echo cancellation, noise
    /// suppression and gain control in one filter)
    pub fn is_echo_cancel(&self) -> bool {
        let name = self.name.to_lowercase();
        name.contains("echo-cancel") || name.contains("echo_cancel")
    }

    pub fn is(&self, device_type: DeviceType) -> bool {
        match device_type {
            DeviceType::Microphone => !self.is_monitor,
            DeviceType::Monitor => self.is_monitor,
            DeviceType::Any => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Microphone,
    Monitor,
    Any,
}

fn device_err(context: &str, e: impl std::fmt::Display) -> VoiceError {
    VoiceError::Device(format!("{}: {}", context, e))
}

/// Echo-cancelled microphone among `sources`. Monitors never qualify, even
/// when they monitor the echo-cancel sink.
pub fn pick_echo_cancel(sources: &[AudioDevice]) -> Option<&AudioDevice> {
    sources
        .iter()
        .filter(|d| d.is(DeviceType::Microphone))
        .find(|d| d.is_echo_cancel())
}

/// Short-lived introspection connection to the PulseAudio server
struct Introspection {
    mainloop: Mainloop,
    context: Context,
}

impl Introspection {
    fn connect() -> Result<Self> {
        let mut proplist =
            Proplist::new().ok_or_else(|| VoiceError::Device("No proplist".into()))?;
        proplist
            .set_str(properties::APPLICATION_NAME, "voxlink-sources")
            .map_err(|_| VoiceError::Device("Bad application name".into()))?;
        let mainloop =
            Mainloop::new().ok_or_else(|| VoiceError::Device("No PulseAudio mainloop".into()))?;
        let mut context = Context::new_with_proplist(&mainloop, "voxlink-sources", &proplist)
            .ok_or_else(|| VoiceError::Device("No PulseAudio context".into()))?;
        context
            .connect(None, ContextFlagSet::NOFLAGS, None)
            .map_err(|e| device_err("Failed to connect to PulseAudio", e))?;

        let mut this = Self { mainloop, context };
        this.iterate_until(|ctx| match ctx.get_state() {
            ContextState::Ready => Ok(true),
            ContextState::Failed | ContextState::Terminated => {
                Err(VoiceError::Device("PulseAudio refused the connection".into()))
            }
            _ => Ok(false),
        })?;
        Ok(this)
    }

    /// Drive the mainloop until `done` says so.
    fn iterate_until(&mut self, mut done: impl FnMut(&Context) -> Result<bool>) -> Result<()> {
        while !done(&self.context)? {
            if let IterateResult::Quit(_) | IterateResult::Err(_) = self.mainloop.iterate(true) {
                return Err(VoiceError::Device("PulseAudio mainloop stopped".into()));
            }
        }
        Ok(())
    }

    fn sources(&mut self) -> Result<Vec<AudioDevice>> {
        // None until the list is complete
        let found: Rc<RefCell<Option<Vec<AudioDevice>>>> = Rc::new(RefCell::new(None));
        let mut partial = Vec::new();
        let sink = found.clone();

        let _op = self.context.introspect().get_source_info_list(move |item| match item {
            ListResult::Item(info) => {
                let Some(name) = info.name.as_deref() else {
                    return;
                };
                partial.push(AudioDevice {
                    name: name.to_string(),
                    description: info.description.as_deref().unwrap_or(name).to_string(),
                    sample_rate: info.sample_spec.rate,
                    channels: info.sample_spec.channels,
                    is_monitor: info.monitor_of_sink.is_some() || name.ends_with(".monitor"),
                });
            }
            ListResult::End => *sink.borrow_mut() = Some(std::mem::take(&mut partial)),
            ListResult::Error => {
                error!("Source listing failed part way");
                *sink.borrow_mut() = Some(std::mem::take(&mut partial));
            }
        });

        self.iterate_until(|_| Ok(found.borrow().is_some()))?;
        let sources = found.borrow_mut().take().unwrap_or_default();
        debug!("PulseAudio reports {} source(s)", sources.len());
        Ok(sources)
    }
}

impl Drop for Introspection {
    fn drop(&mut self) {
        self.context.disconnect();
        self.mainloop.quit(Retval(0));
    }
}

/// PulseAudio sources of the given type.
pub fn list_sources(device_type: DeviceType) -> Result<Vec<AudioDevice>> {
    let mut sources = Introspection::connect()?.sources()?;
    sources.retain(|d| d.is(device_type));
    Ok(sources)
}

/// Name of an echo-cancelled microphone, if the server has one.
pub fn find_echo_cancel_source() -> Option<String> {
    let sources = match Introspection::connect().and_then(|mut pulse| pulse.sources()) {
        Ok(sources) => sources,
        Err(e) => {
            warn!("Could not list sources: {}", e);
            return None;
        }
    };
    pick_echo_cancel(&sources).map(|d| d.name.clone())
}

/// Microphone input through the PulseAudio simple API.
pub struct PulseCaptureDevice {
    simple: Simple,
    device_name: Option<String>,
    bytes: Vec<u8>,
}

impl PulseCaptureDevice {
    /// Open `device`, or the default source. With `prefer_echo_cancel` and no
    /// explicit device, an echo-cancel source is used when available.
    pub fn open(
        app_name: &str,
        device: Option<&str>,
        prefer_echo_cancel: bool,
        block_size: usize,
    ) -> Result<Self> {
        let selected = match device {
            Some(name) => Some(name.to_string()),
            None if prefer_echo_cancel => find_echo_cancel_source(),
            None => None,
        };
        if prefer_echo_cancel && device.is_none() && selected.is_none() {
            warn!("No echo-cancel source found (load module-echo-cancel), using default source");
        }

        let spec = Spec {
            format: Format::F32le,
            channels: 1,
            rate: CAPTURE_SAMPLE_RATE,
        };
        // Fragments of one block keep capture latency at one block
        let attr = BufferAttr {
            maxlength: u32::MAX,
            tlength: u32::MAX,
            prebuf: u32::MAX,
            minreq: u32::MAX,
            fragsize: (block_size * 4) as u32,
        };

        info!(
            "Opening capture source: {}",
            selected.as_deref().unwrap_or("default")
        );
        let simple = Simple::new(
            None,
            app_name,
            Direction::Record,
            selected.as_deref(),
            "voice capture",
            &spec,
            None,
            Some(&attr),
        )
        .map_err(|e| device_err("Failed to open microphone", e))?;

        Ok(Self {
            simple,
            device_name: selected,
            bytes: Vec::new(),
        })
    }
}

impl CaptureDevice for PulseCaptureDevice {
    fn read_block(&mut self, block: &mut [f32]) -> Result<()> {
        self.bytes.resize(block.len() * 4, 0);
        self.simple
            .read(&mut self.bytes)
            .map_err(|e| device_err("Microphone read failed", e))?;

        for (sample, raw) in block.iter_mut().zip(self.bytes.chunks_exact(4)) {
            *sample = f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.simple
            .flush()
            .map_err(|e| device_err("Microphone flush failed", e))
    }

    fn name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }
}

enum PlaybackCommand {
    Play { buffer: AudioBuffer, start_at: f64 },
    Close,
}

/// Speaker output whose clock is seconds since the clock was opened.
pub struct PulsePlaybackClock {
    origin: Instant,
    commands: std_mpsc::Sender<PlaybackCommand>,
    abandon: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PulsePlaybackClock {
    pub fn open(app_name: &str) -> Result<Self> {
        let origin = Instant::now();
        let (commands, command_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let abandon = Arc::new(AtomicBool::new(false));
        let abandon_clone = abandon.clone();
        let app_name = app_name.to_string();

        let handle = std::thread::Builder::new()
            .name("voxlink-playback".to_string())
            .spawn(move || {
                let spec = Spec {
                    format: Format::F32le,
                    channels: 1,
                    rate: PLAYBACK_SAMPLE_RATE,
                };
                let simple = match Simple::new(
                    None,
                    &app_name,
                    Direction::Playback,
                    None,
                    "voice playback",
                    &spec,
                    None,
                    None,
                ) {
                    Ok(simple) => {
                        let _ = ready_tx.send(Ok(()));
                        simple
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(device_err("Failed to open speaker", e)));
                        return;
                    }
                };

                if let Err(e) = playback_loop(&simple, origin, command_rx, &abandon_clone) {
                    error!("Playback error: {}", e);
                }
                let _ = simple.flush();
                info!("Playback thread stopped");
            })
            .map_err(|e| VoiceError::Device(format!("Failed to spawn playback thread: {}", e)))?;

        ready_rx.recv().map_err(|_| VoiceError::ChannelClosed)??;
        info!("Playback clock opened at {} Hz", PLAYBACK_SAMPLE_RATE);

        Ok(Self {
            origin,
            commands,
            abandon,
            handle: Some(handle),
        })
    }
}

fn write_samples(simple: &Simple, samples: &[f32]) -> Result<()> {
    let mut bytes = Vec::with_capacity(samples.len() * 4);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    simple
        .write(&bytes)
        .map_err(|e| device_err("Speaker write failed", e))
}

fn playback_loop(
    simple: &Simple,
    origin: Instant,
    commands: std_mpsc::Receiver<PlaybackCommand>,
    abandon: &AtomicBool,
) -> Result<()> {
    let rate = PLAYBACK_SAMPLE_RATE as f64;
    // Clock time at which the next written sample sounds
    let mut cursor = 0.0f64;

    while let Ok(command) = commands.recv() {
        let (buffer, start_at) = match command {
            PlaybackCommand::Play { buffer, start_at } => (buffer, start_at),
            PlaybackCommand::Close => break,
        };
        if abandon.load(Ordering::Acquire) {
            break;
        }

        let now = origin.elapsed().as_secs_f64();
        if cursor < now {
            // device ran dry
            cursor = now;
        }
        if start_at > cursor {
            let gap = ((start_at - cursor) * rate).round() as usize;
            debug!("Padding {} samples of silence", gap);
            write_samples(simple, &vec![0.0; gap])?;
            cursor += gap as f64 / rate;
        }

        let duration = buffer.duration();
        write_samples(simple, &buffer.samples)?;
        cursor += duration;
    }
    Ok(())
}

impl PlaybackClock for PulsePlaybackClock {
    fn current_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn schedule(&mut self, buffer: AudioBuffer, start_at: f64) -> Result<()> {
        self.commands
            .send(PlaybackCommand::Play { buffer, start_at })
            .map_err(|_| VoiceError::Device("Playback thread stopped".into()))
    }

    fn close(&mut self) {
        self.abandon.store(true, Ordering::Release);
        let _ = self.commands.send(PlaybackCommand::Close);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Playback thread panicked");
            }
        }
    }
}

impl Drop for PulsePlaybackClock {
    fn drop(&mut self) {
        self.close();
    }
}
