//! Fixed-format PCM helpers: energy, duration and WAV framing.
//!
//! The telephony leg delivers raw little-endian signed 16-bit mono PCM
//! (`audio/l16;rate=16000`). Nothing here resamples or transcodes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Format of the inbound call audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Bytes per sample (default: 2 for PCM16)
    pub bytes_per_sample: u16,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            bytes_per_sample: 2,
        }
    }
}

impl AudioConfig {
    fn bytes_per_second(&self) -> u128 {
        self.sample_rate as u128 * self.bytes_per_sample as u128
    }

    /// Playback duration of `len` bytes of audio in this format.
    pub fn duration_of(&self, len: usize) -> Duration {
        let per_second = self.bytes_per_second();
        if per_second == 0 {
            return Duration::ZERO;
        }
        let nanos = len as u128 * 1_000_000_000 / per_second;
        Duration::from_nanos(nanos as u64)
    }

    /// Number of bytes holding `duration` of audio, rounded down to a whole sample.
    pub fn bytes_for(&self, duration: Duration) -> usize {
        let raw = (duration.as_nanos() * self.bytes_per_second() / 1_000_000_000) as usize;
        let width = self.bytes_per_sample.max(1) as usize;
        raw - raw % width
    }
}

/// RMS energy of a chunk of little-endian signed 16-bit samples.
///
/// A trailing odd byte is ignored. An empty chunk has zero energy.
pub fn rms_energy(chunk: &[u8]) -> f64 {
    let mut sum = 0f64;
    let mut count = 0usize;
    for pair in chunk.chunks_exact(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]) as f64;
        sum += sample * sample;
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    (sum / count as f64).sqrt()
}

/// Prefix raw PCM16 mono audio with a 44-byte RIFF/WAVE header.
pub fn wav_from_pcm16(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    let channels: u16 = 1;
    let bits_per_sample: u16 = 16;
    let block_align = channels * bits_per_sample / 8;
    let byte_rate = sample_rate * block_align as u32;
    let data_len = pcm.len() as u32;

    let mut buf = Vec::with_capacity(44 + pcm.len());
    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    // fmt subchunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&channels.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    buf.extend_from_slice(&block_align.to_le_bytes());
    buf.extend_from_slice(&bits_per_sample.to_le_bytes());
    // data subchunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    buf.extend_from_slice(pcm);
    buf
}

/// Build `duration` of a constant-amplitude square wave whose RMS equals `amplitude`.
///
/// Used by tests and local tooling to fabricate speech-like or quiet audio.
pub fn tone(config: &AudioConfig, duration: Duration, amplitude: i16) -> Vec<u8> {
    let len = config.bytes_for(duration);
    let mut out = Vec::with_capacity(len);
    let mut positive = true;
    while out.len() + 2 <= len {
        let s = if positive { amplitude } else { amplitude.saturating_neg() };
        out.extend_from_slice(&s.to_le_bytes());
        positive = !positive;
    }
    out
}
