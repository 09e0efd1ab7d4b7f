//! Session recorder for debugging - saves both directions of audio as WAV

use crate::audio::pcm::{decode_samples, CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
use chrono::Local;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

type Writer = WavWriter<BufWriter<File>>;

pub struct SessionRecorder {
    enabled: bool,
    base: PathBuf, // ./recordings/20250603_153055/
    outbound: Option<Writer>,
    inbound: Option<Writer>,
}

impl SessionRecorder {
    pub fn new(enabled: bool) -> Self {
        let ts = Local::now().format("%Y%m%d_%H%M%S").to_string();
        Self::with_base(PathBuf::from("recordings").join(ts), enabled)
    }

    pub fn with_base(base: PathBuf, enabled: bool) -> Self {
        if enabled {
            if let Err(e) = fs::create_dir_all(&base) {
                error!("Failed to create recordings directory: {}", e);
            } else {
                info!("Recording enabled, saving to: {:?}", base);
            }
        }

        Self {
            enabled,
            base,
            outbound: None,
            inbound: None,
        }
    }

    /// Record an `audio-data` block as sent
    pub fn on_outbound(&mut self, payload: &str) {
        if !self.enabled {
            return;
        }
        let path = self.base.join("outbound.wav");
        append(&mut self.outbound, &path, CAPTURE_SAMPLE_RATE, payload);
    }

    /// Record an `audio-response` chunk as received
    pub fn on_inbound(&mut self, payload: &str) {
        if !self.enabled {
            return;
        }
        let path = self.base.join("inbound.wav");
        append(&mut self.inbound, &path, PLAYBACK_SAMPLE_RATE, payload);
    }

    /// Finalize the WAV headers. Safe to call repeatedly.
    pub fn finish(&mut self) {
        for writer in [self.outbound.take(), self.inbound.take()].into_iter().flatten() {
            if let Err(e) = writer.finalize() {
                error!("Failed to finalize recording: {}", e);
            }
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }
}

impl Drop for SessionRecorder {
    fn drop(&mut self) {
        self.finish();
    }
}

fn append(slot: &mut Option<Writer>, path: &Path, sample_rate: u32, payload: &str) {
    let samples = match decode_samples(payload) {
        Ok(samples) => samples,
        Err(e) => {
            error!("Failed to decode audio for recording: {}", e);
            return;
        }
    };

    if slot.is_none() {
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        match WavWriter::create(path, spec) {
            Ok(writer) => {
                debug!("Opened recording {:?}", path);
                *slot = Some(writer);
            }
            Err(e) => {
                error!("Failed to create recording {:?}: {}", path, e);
                return;
            }
        }
    }

    if let Some(writer) = slot.as_mut() {
        for sample in samples {
            if let Err(e) = writer.write_sample(sample) {
                error!("Failed to write audio sample: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::encode_block;

    fn scratch_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("voxlink-{}-{}", name, std::process::id()))
    }

    #[test]
    fn test_records_both_directions() {
        let base = scratch_dir("record");
        let mut recorder = SessionRecorder::with_base(base.clone(), true);

        recorder.on_outbound(&encode_block(&[1, 2, 3]));
        recorder.on_outbound(&encode_block(&[4]));
        recorder.on_inbound(&encode_block(&[-5, 6]));
        recorder.on_inbound("%%%");
        recorder.finish();

        let out = hound::WavReader::open(base.join("outbound.wav")).unwrap();
        assert_eq!(out.spec().sample_rate, CAPTURE_SAMPLE_RATE);
        let samples: Vec<i16> = out.into_samples().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![1, 2, 3, 4]);

        let inbound = hound::WavReader::open(base.join("inbound.wav")).unwrap();
        assert_eq!(inbound.spec().sample_rate, PLAYBACK_SAMPLE_RATE);
        let samples: Vec<i16> = inbound.into_samples().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![-5, 6]);

        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn test_disabled_recorder_writes_nothing() {
        let base = scratch_dir("disabled");
        let mut recorder = SessionRecorder::with_base(base.clone(), false);
        recorder.on_outbound(&encode_block(&[1]));
        recorder.finish();
        assert!(!base.exists());
    }
}
