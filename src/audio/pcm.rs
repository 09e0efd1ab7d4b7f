//! PCM conversions and the base64 wire encoding
//!
//! Outbound audio is mono 16 kHz, inbound audio is mono 24 kHz. Both travel
//! as standard base64 of little-endian signed 16-bit samples.

use crate::error::Result;
use base64::engine::general_purpose;
use base64::Engine;

/// Microphone sample rate
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of synthesized speech from the bridge
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;
/// Samples per capture block (~256ms at 16 kHz)
pub const BLOCK_SIZE: usize = 4096;
/// Blocks whose peak amplitude is below this are not transmitted
pub const SILENCE_THRESHOLD: f32 = 0.001;

/// A decoded block of float samples tagged with its sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Playback length in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Peak absolute amplitude of a block, 0.0 for an empty block.
pub fn peak_amplitude(block: &[f32]) -> f32 {
    block.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
}

/// `round(clamp(s, -1, 1) * 32767)`
pub fn quantize(sample: f32) -> i16 {
    // NaN clamps to NaN and casts to 0
    (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

/// Inverse of [`quantize`] up to one quantization step.
pub fn dequantize(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

pub fn quantize_block(block: &[f32]) -> Vec<i16> {
    block.iter().copied().map(quantize).collect()
}

/// Little-endian bytes of a sample block.
pub fn i16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Reinterpret little-endian bytes as samples. A trailing odd byte is dropped.
pub fn le_bytes_to_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Encode a sample block for the `audio-data` event.
pub fn encode_block(samples: &[i16]) -> String {
    general_purpose::STANDARD.encode(i16_to_le_bytes(samples))
}

/// Decode an `audio-response` payload into raw samples.
pub fn decode_samples(payload: &str) -> Result<Vec<i16>> {
    let bytes = general_purpose::STANDARD.decode(payload.trim())?;
    Ok(le_bytes_to_i16(&bytes))
}

/// Decode an `audio-response` payload into a playable 24 kHz buffer.
pub fn decode_chunk(payload: &str) -> Result<AudioBuffer> {
    let samples = decode_samples(payload)?
        .into_iter()
        .map(dequantize)
        .collect();
    Ok(AudioBuffer::new(samples, PLAYBACK_SAMPLE_RATE))
}
