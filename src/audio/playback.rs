//! Gapless playback of inbound speech
//!
//! Chunks are queued strictly FIFO. A drain pass pops every queued buffer and
//! schedules it on the playback clock at an absolute start time, advancing a
//! cursor by each buffer's duration, so back-to-back buffers sound as one
//! continuous stream no matter when they were enqueued. While a pass is
//! active (`playing`), new chunks only join the queue; the pass's completion
//! check picks them up.

use crate::audio::pcm::{decode_chunk, AudioBuffer};
use crate::error::Result;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};

/// An output device with its own clock, able to start a buffer at an
/// absolute time on that clock.
pub trait PlaybackClock {
    /// Current clock time in seconds
    fn current_time(&self) -> f64;

    /// Start `buffer` exactly at `start_at` (clock seconds). A start time in
    /// the past means "as soon as possible".
    fn schedule(&mut self, buffer: AudioBuffer, start_at: f64) -> Result<()>;

    /// Stop output, abandon scheduled buffers and release the device.
    fn close(&mut self);
}

pub struct PlaybackPipeline<C: PlaybackClock> {
    clock: C,
    queue: VecDeque<AudioBuffer>,
    /// Guards against a second concurrent drain pass
    playing: bool,
    next_start_time: f64,
    /// How far ahead of the last buffer's end the completion check fires
    lead: f64,
    closed: bool,
    scheduled: u64,
}

impl<C: PlaybackClock> PlaybackPipeline<C> {
    pub fn new(clock: C, lead: Duration) -> Self {
        Self {
            clock,
            queue: VecDeque::new(),
            playing: false,
            next_start_time: 0.0,
            lead: lead.as_secs_f64(),
            closed: false,
            scheduled: 0,
        }
    }

    /// Decode an `audio-response` payload and enqueue it.
    ///
    /// Returns the clock time of the completion check when this call started
    /// a drain pass.
    pub fn enqueue_payload(&mut self, payload: &str) -> Result<Option<f64>> {
        let buffer = decode_chunk(payload)?;
        self.enqueue(buffer)
    }

    pub fn enqueue(&mut self, buffer: AudioBuffer) -> Result<Option<f64>> {
        if self.closed {
            warn!("Playback closed, dropping {} samples", buffer.samples.len());
            return Ok(None);
        }

        self.queue.push_back(buffer);
        if self.playing {
            debug!("Drain pass active, {} chunk(s) waiting", self.queue.len());
            return Ok(None);
        }
        self.drain()
    }

    /// Called when the completion check of the current pass fires. Starts a
    /// new pass if chunks arrived meanwhile, otherwise goes idle.
    pub fn on_drain_complete(&mut self) -> Result<Option<f64>> {
        if self.closed {
            return Ok(None);
        }
        self.playing = false;

        if self.queue.is_empty() {
            debug!("Playback idle after {} scheduled chunk(s)", self.scheduled);
            return Ok(None);
        }
        self.drain()
    }

    fn drain(&mut self) -> Result<Option<f64>> {
        if self.playing || self.queue.is_empty() {
            return Ok(None);
        }
        self.playing = true;

        let now = self.clock.current_time();
        // Continue right after audio that is still sounding
        let mut cursor = now.max(self.next_start_time);
        debug!("Draining {} chunk(s) from t={:.3}", self.queue.len(), cursor);

        while let Some(buffer) = self.queue.pop_front() {
            let duration = buffer.duration();
            if let Err(e) = self.clock.schedule(buffer, cursor) {
                self.playing = false;
                return Err(e);
            }
            cursor += duration;
            self.scheduled += 1;
        }
        self.next_start_time = cursor;

        Ok(Some((cursor - self.lead).max(now)))
    }

    /// Discard the queue and release the clock. Idempotent.
    pub fn stop(&mut self) {
        self.queue.clear();
        self.playing = false;
        if !self.closed {
            self.closed = true;
            self.clock.close();
        }
    }

    /// Wall time until clock time `at`
    pub fn time_until(&self, at: f64) -> Duration {
        Duration::from_secs_f64((at - self.clock.current_time()).max(0.0))
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }
}
