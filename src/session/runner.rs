//! Voice session actor - connects transport, capture and playback to the
//! state machine

use crate::audio::capture::{Capture, CaptureDevice, CaptureEvent, CaptureOpener, EnergyGate};
use crate::audio::pcm::BLOCK_SIZE;
use crate::audio::playback::{PlaybackClock, PlaybackPipeline};
use crate::audio::pulse::{PulseCaptureDevice, PulsePlaybackClock};
use crate::config::Config;
use crate::error::{Result, VoiceError};
use crate::recorder::SessionRecorder;
use crate::session::state::{Effect, Input, SessionMachine, SessionStatus};
use crate::transport::client::{self, TransportEvent, TransportHandle};
use crate::transport::codec::{socket_url, ClientEvent};
use crate::turn::TurnState;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Where the session gets its audio devices from
pub trait AudioBackend: Send + 'static {
    type Clock: PlaybackClock + Send + 'static;

    /// Opener for the microphone, run on the capture thread
    fn capture_opener(&self) -> CaptureOpener;

    fn open_playback(&self) -> Result<Self::Clock>;
}

/// PulseAudio devices
#[derive(Debug, Clone)]
pub struct PulseBackend {
    pub app_name: String,
    pub device: Option<String>,
    pub prefer_echo_cancel: bool,
    pub block_size: usize,
}

impl PulseBackend {
    pub fn from_config(config: &Config) -> Self {
        Self {
            app_name: "voxlink".to_string(),
            device: config.capture_device.clone(),
            prefer_echo_cancel: config.echo_cancel,
            block_size: BLOCK_SIZE,
        }
    }
}

impl AudioBackend for PulseBackend {
    type Clock = PulsePlaybackClock;

    fn capture_opener(&self) -> CaptureOpener {
        let backend = self.clone();
        Box::new(move || {
            let device = PulseCaptureDevice::open(
                &backend.app_name,
                backend.device.as_deref(),
                backend.prefer_echo_cancel,
                backend.block_size,
            )?;
            Ok(Box::new(device) as Box<dyn CaptureDevice>)
        })
    }

    fn open_playback(&self) -> Result<Self::Clock> {
        PulsePlaybackClock::open(&self.app_name)
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub session_id: String,
    pub silence_threshold: f32,
    pub schedule_lead: Duration,
    pub block_size: usize,
    pub record: bool,
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            session_id: config.session_id.clone(),
            silence_threshold: config.silence_threshold,
            schedule_lead: config.schedule_lead,
            block_size: BLOCK_SIZE,
            record: config.record,
        }
    }
}

/// User commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StartRecording,
    StopRecording,
    ToggleRecording,
    /// Tear the session down and stop the actor
    Shutdown,
}

/// Handle to a running session
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| VoiceError::ChannelClosed)
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Tear down and wait for the actor to finish. Safe to call repeatedly.
    pub async fn shutdown(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Session task failed: {}", e);
            }
        }
    }
}

/// Connect to the bridge and start a session.
pub async fn connect<B: AudioBackend>(config: &Config, backend: B) -> Result<SessionHandle> {
    let url = socket_url(&config.server_url)?;
    let (transport, events) = client::connect(&url, config.connect_timeout).await?;
    Ok(spawn(backend, SessionOptions::from(config), transport, events))
}

/// Start the session actor over an already connected transport.
pub fn spawn<B: AudioBackend>(
    backend: B,
    options: SessionOptions,
    transport: TransportHandle,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
) -> SessionHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (session, status) = VoiceSession::new(backend, options, transport);
    let task = tokio::spawn(session.run(transport_events, command_rx));

    SessionHandle {
        commands: command_tx,
        status,
        task: Some(task),
    }
}

pub struct VoiceSession<B: AudioBackend> {
    machine: SessionMachine,
    turn: Arc<TurnState>,
    backend: B,
    options: SessionOptions,
    transport: TransportHandle,
    capture: Option<Capture>,
    capture_tx: mpsc::UnboundedSender<CaptureEvent>,
    capture_rx: Option<mpsc::UnboundedReceiver<CaptureEvent>>,
    playback: Option<PlaybackPipeline<B::Clock>>,
    /// When the current drain pass's completion check fires
    drain_deadline: Option<Instant>,
    recorder: SessionRecorder,
    status_tx: watch::Sender<SessionStatus>,
}

impl<B: AudioBackend> VoiceSession<B> {
    pub fn new(
        backend: B,
        options: SessionOptions,
        transport: TransportHandle,
    ) -> (Self, watch::Receiver<SessionStatus>) {
        let turn = Arc::new(TurnState::new());
        let machine = SessionMachine::new(options.session_id.clone(), turn.clone());
        let (status_tx, status_rx) = watch::channel(machine.status());
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();

        let session = Self {
            machine,
            turn,
            backend,
            recorder: SessionRecorder::new(options.record),
            options,
            transport,
            capture: None,
            capture_tx,
            capture_rx: Some(capture_rx),
            playback: None,
            drain_deadline: None,
            status_tx,
        };
        (session, status_rx)
    }

    pub async fn run(
        mut self,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let Some(mut capture_events) = self.capture_rx.take() else {
            return;
        };
        info!("Voice session {} started", self.options.session_id);

        loop {
            let deadline = self.drain_deadline;

            tokio::select! {
                Some(event) = transport_events.recv() => {
                    let input = match event {
                        TransportEvent::Connected => Input::TransportConnected,
                        TransportEvent::Server(event) => Input::Server(event),
                        TransportEvent::Disconnected(reason) => {
                            Input::TransportDisconnected(reason)
                        }
                        TransportEvent::Failed(reason) => Input::TransportFailed(reason),
                    };
                    self.apply(input);
                }

                Some(event) = capture_events.recv() => {
                    let input = match event {
                        CaptureEvent::Ready { .. } => Input::CaptureReady,
                        CaptureEvent::Block(payload) => Input::CaptureBlock(payload),
                        CaptureEvent::Failed(reason) => Input::CaptureFailed(reason),
                    };
                    self.apply(input);
                }

                command = commands.recv() => {
                    let input = match command {
                        Some(Command::StartRecording) => Input::StartRecording,
                        Some(Command::StopRecording) => Input::StopRecording,
                        Some(Command::ToggleRecording) => Input::ToggleRecording,
                        Some(Command::Shutdown) | None => break,
                    };
                    self.apply(input);
                }

                _ = async { sleep_until(deadline.unwrap_or_else(Instant::now)).await }, if deadline.is_some() => {
                    self.on_drain_timer();
                }
            }
        }

        self.teardown();
        info!("Voice session {} ended", self.options.session_id);
    }

    /// Feed one input through the machine and carry out what it asks for.
    fn apply(&mut self, input: Input) {
        let mut pending = VecDeque::from([input]);

        while let Some(input) = pending.pop_front() {
            self.machine.on_input(input);
            for effect in self.machine.drain_effects() {
                if let Some(follow_up) = self.perform(effect) {
                    pending.push_back(follow_up);
                }
            }
        }

        self.publish();
    }

    fn perform(&mut self, effect: Effect) -> Option<Input> {
        match effect {
            Effect::Send(event) => {
                if let ClientEvent::AudioData(payload) = &event {
                    self.recorder.on_outbound(payload);
                }
                if let Err(e) = self.transport.send(event) {
                    warn!("Dropping outbound event: {}", e);
                }
            }

            Effect::InitCapture => {
                if self.capture.is_some() {
                    return None;
                }
                let gate = EnergyGate::new(self.turn.clone(), self.options.silence_threshold);
                match Capture::spawn(
                    self.backend.capture_opener(),
                    gate,
                    self.capture_tx.clone(),
                    self.options.block_size,
                ) {
                    Ok(capture) => self.capture = Some(capture),
                    Err(e) => return Some(Input::CaptureFailed(e.to_string())),
                }
            }

            Effect::ConnectChain => {
                if let Some(capture) = self.capture.as_mut() {
                    capture.connect();
                }
            }

            Effect::DisconnectChain => {
                if let Some(capture) = self.capture.as_mut() {
                    capture.disconnect();
                }
            }

            Effect::Play(payload) => {
                self.recorder.on_inbound(&payload);
                return self.play(&payload);
            }

            Effect::StopPlayback => {
                if let Some(playback) = self.playback.as_mut() {
                    // joins the writer thread
                    off_runtime(|| playback.stop());
                }
                self.drain_deadline = None;
            }

            Effect::CloseTransport => self.transport.close(),

            Effect::ReleaseCapture => {
                if let Some(mut capture) = self.capture.take() {
                    off_runtime(|| capture.shutdown());
                }
            }
        }
        None
    }

    fn play(&mut self, payload: &str) -> Option<Input> {
        if self.playback.is_none() {
            let backend = &self.backend;
            match off_runtime(|| backend.open_playback()) {
                Ok(clock) => {
                    self.playback = Some(PlaybackPipeline::new(clock, self.options.schedule_lead));
                }
                Err(e) => return Some(Input::PlaybackFailed(e.to_string())),
            }
        }
        let playback = self.playback.as_mut()?;

        match playback.enqueue_payload(payload) {
            Ok(Some(check_at)) => {
                self.drain_deadline = Some(Instant::now() + playback.time_until(check_at));
                None
            }
            Ok(None) => None,
            Err(VoiceError::Decode(e)) => {
                warn!("Dropping undecodable audio chunk: {}", e);
                None
            }
            Err(e) => Some(Input::PlaybackFailed(e.to_string())),
        }
    }

    fn on_drain_timer(&mut self) {
        self.drain_deadline = None;
        let Some(playback) = self.playback.as_mut() else {
            return;
        };

        match playback.on_drain_complete() {
            Ok(Some(check_at)) => {
                self.drain_deadline = Some(Instant::now() + playback.time_until(check_at));
            }
            Ok(None) => debug!("Playback drained"),
            Err(e) => self.apply(Input::PlaybackFailed(e.to_string())),
        }
    }

    /// Run the teardown sequence. Idempotent.
    pub fn teardown(&mut self) {
        if self.machine.is_torn_down() {
            return;
        }
        self.machine.teardown();
        for effect in self.machine.drain_effects() {
            // no follow-ups once torn down
            let _ = self.perform(effect);
        }
        self.recorder.finish();
        self.publish();
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.machine.status());
    }
}

/// Run a call that parks the thread (device open, thread join). On a
/// multi-thread runtime the worker hands its other tasks off first.
fn off_runtime<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

impl<B: AudioBackend> Drop for VoiceSession<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::{decode_samples, encode_block, PLAYBACK_SAMPLE_RATE};
    use crate::audio::playback::tests::ManualClock;
    use crate::session::state::Phase;
    use crate::transport::client::Outgoing;
    use crate::transport::codec::ServerEvent;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Loud microphone that never runs dry
    struct ToneDevice {
        open: Arc<AtomicBool>,
    }

    impl CaptureDevice for ToneDevice {
        fn read_block(&mut self, block: &mut [f32]) -> Result<()> {
            std::thread::sleep(Duration::from_millis(2));
            block.fill(0.5);
            Ok(())
        }
    }

    impl Drop for ToneDevice {
        fn drop(&mut self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    struct FakeBackend {
        clock: ManualClock,
        mic_open: Arc<AtomicBool>,
        deny_mic: bool,
        /// Time the speaker takes to open
        open_delay: Duration,
        /// Ticks observed elsewhere on the runtime while the speaker opened
        ticks: Arc<AtomicUsize>,
        ticks_while_opening: Arc<AtomicUsize>,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self {
                clock: ManualClock::default(),
                mic_open: Arc::new(AtomicBool::new(false)),
                deny_mic: false,
                open_delay: Duration::ZERO,
                ticks: Arc::new(AtomicUsize::new(0)),
                ticks_while_opening: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl AudioBackend for FakeBackend {
        type Clock = ManualClock;

        fn capture_opener(&self) -> CaptureOpener {
            let open = self.mic_open.clone();
            let deny = self.deny_mic;
            Box::new(move || {
                if deny {
                    return Err(VoiceError::Device("permission denied".to_string()));
                }
                open.store(true, Ordering::SeqCst);
                Ok(Box::new(ToneDevice { open }) as Box<dyn CaptureDevice>)
            })
        }

        fn open_playback(&self) -> Result<ManualClock> {
            let before = self.ticks.load(Ordering::SeqCst);
            std::thread::sleep(self.open_delay);
            let during = self.ticks.load(Ordering::SeqCst) - before;
            self.ticks_while_opening.store(during, Ordering::SeqCst);
            Ok(self.clock.clone())
        }
    }

    fn options() -> SessionOptions {
        SessionOptions {
            session_id: "abc".to_string(),
            silence_threshold: 0.001,
            schedule_lead: Duration::from_millis(50),
            block_size: 64,
            record: false,
        }
    }

    async fn wait_for(
        status: &mut watch::Receiver<SessionStatus>,
        f: impl FnMut(&SessionStatus) -> bool,
    ) -> SessionStatus {
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(f))
            .await
            .expect("status timeout")
            .expect("session gone")
            .clone()
    }

    async fn next_outgoing(wire: &mut mpsc::UnboundedReceiver<Outgoing>) -> Outgoing {
        tokio::time::timeout(Duration::from_secs(5), wire.recv())
            .await
            .expect("wire timeout")
            .expect("wire closed")
    }

    #[tokio::test]
    async fn test_session_scenario() {
        let backend = FakeBackend::new();
        let mic_open = backend.mic_open.clone();
        let (transport, mut wire) = TransportHandle::detached();
        let (events, events_rx) = mpsc::unbounded_channel();

        let mut session = spawn(backend, options(), transport, events_rx);
        let mut status = session.status();

        events.send(TransportEvent::Connected).unwrap();
        assert_eq!(
            next_outgoing(&mut wire).await,
            Outgoing::Event(ClientEvent::StartVoiceSession {
                session_id: "abc".to_string()
            })
        );

        events
            .send(TransportEvent::Server(ServerEvent::VoiceSessionStarted))
            .unwrap();
        wait_for(&mut status, |s| s.phase == Phase::Ready).await;
        assert!(mic_open.load(Ordering::SeqCst));

        session.send(Command::ToggleRecording).unwrap();
        match next_outgoing(&mut wire).await {
            Outgoing::Event(ClientEvent::AudioData(payload)) => {
                assert_eq!(decode_samples(&payload).unwrap(), vec![16384; 64]);
            }
            other => panic!("Unexpected frame: {:?}", other),
        }

        events
            .send(TransportEvent::Server(ServerEvent::AiSpeakingStart))
            .unwrap();
        wait_for(&mut status, |s| s.ai_speaking && !s.recording).await;

        // nothing is sent once the AI turn is processed
        while wire.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(wire.try_recv().is_err());

        // start while speaking is a no-op
        session.send(Command::StartRecording).unwrap();
        events
            .send(TransportEvent::Server(ServerEvent::TokenUsage { total_tokens: 9 }))
            .unwrap();
        let snapshot = wait_for(&mut status, |s| s.total_tokens == 9).await;
        assert!(!snapshot.recording);

        session.shutdown().await;
        session.shutdown().await;

        assert_eq!(
            next_outgoing(&mut wire).await,
            Outgoing::Event(ClientEvent::StopVoiceSession)
        );
        assert_eq!(next_outgoing(&mut wire).await, Outgoing::Close);
        assert!(!mic_open.load(Ordering::SeqCst));
        assert_eq!(status.borrow().phase, Phase::Disconnected);
    }

    #[tokio::test]
    async fn test_rapid_audio_responses_play_back_to_back() {
        let backend = FakeBackend::new();
        let clock = backend.clock.clone();
        clock.set(5.0);
        let (transport, _wire) = TransportHandle::detached();
        let (events, events_rx) = mpsc::unbounded_channel();

        let mut session = spawn(backend, options(), transport, events_rx);

        events.send(TransportEvent::Connected).unwrap();
        let chunk = encode_block(&vec![1000i16; PLAYBACK_SAMPLE_RATE as usize / 10]);
        for _ in 0..3 {
            events
                .send(TransportEvent::Server(ServerEvent::AudioResponse {
                    audio_data: chunk.clone(),
                }))
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while clock.starts().len() < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let starts = clock.starts();
        for (start, expected) in starts.iter().zip([5.0, 5.1, 5.2]) {
            assert!((start - expected).abs() < 1e-9, "{:?}", starts);
        }

        session.shutdown().await;
        assert_eq!(clock.0.lock().unwrap().closed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_slow_speaker_open_does_not_stall_the_runtime() {
        let mut backend = FakeBackend::new();
        backend.open_delay = Duration::from_millis(300);
        let clock = backend.clock.clone();
        let ticks = backend.ticks.clone();
        let ticks_while_opening = backend.ticks_while_opening.clone();
        let (transport, _wire) = TransportHandle::detached();
        let (events, events_rx) = mpsc::unbounded_channel();

        // shares the only worker with the session actor
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                ticks.fetch_add(1, Ordering::SeqCst);
            }
        });

        let mut session = spawn(backend, options(), transport, events_rx);
        events.send(TransportEvent::Connected).unwrap();
        events
            .send(TransportEvent::Server(ServerEvent::AudioResponse {
                audio_data: encode_block(&[1000i16; 240]),
            }))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while clock.starts().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(ticks_while_opening.load(Ordering::SeqCst) > 0);

        session.shutdown().await;
        assert_eq!(clock.0.lock().unwrap().closed, 1);
        ticker.abort();
    }

    #[tokio::test]
    async fn test_microphone_denial_is_fatal() {
        let mut backend = FakeBackend::new();
        backend.deny_mic = true;
        let (transport, _wire) = TransportHandle::detached();
        let (events, events_rx) = mpsc::unbounded_channel();

        let mut session = spawn(backend, options(), transport, events_rx);
        let mut status = session.status();

        events.send(TransportEvent::Connected).unwrap();
        events
            .send(TransportEvent::Server(ServerEvent::VoiceSessionStarted))
            .unwrap();

        let snapshot = wait_for(&mut status, |s| s.phase == Phase::Error).await;
        assert!(snapshot
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("permission denied")));

        session.shutdown().await;
        assert_eq!(status.borrow().phase, Phase::Error);
    }

    #[tokio::test]
    async fn test_transport_drop_ends_in_disconnected() {
        let (transport, _wire) = TransportHandle::detached();
        let (events, events_rx) = mpsc::unbounded_channel();
        let mut session = spawn(FakeBackend::new(), options(), transport, events_rx);
        let mut status = session.status();

        events.send(TransportEvent::Connected).unwrap();
        wait_for(&mut status, |s| s.phase == Phase::Connected).await;
        events
            .send(TransportEvent::Disconnected("heartbeat timeout".to_string()))
            .unwrap();

        let snapshot = wait_for(&mut status, |s| s.phase == Phase::Disconnected).await;
        assert!(snapshot.last_error.is_some());
        session.shutdown().await;
    }
}
