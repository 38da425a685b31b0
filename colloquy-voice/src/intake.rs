//! Audio intake - per-session utterance buffering and the minimum-length gate
//!
//! The transport delivers raw PCM (16kHz mono s16le by default); transcription
//! upstreams want a container, so the engine wraps the buffer in a minimal WAV
//! header right before submission. Sample rate, channel count, and bit depth
//! are fixed at this edge.

use serde::{Deserialize, Serialize};

pub const DEFAULT_SAMPLE_RATE_HZ: u32 = 16_000;
pub const DEFAULT_CHANNELS: u16 = 1;
pub const DEFAULT_BIT_DEPTH: u16 = 16;

/// Fixed audio format at the engine boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE_HZ,
            channels: DEFAULT_CHANNELS,
            bit_depth: DEFAULT_BIT_DEPTH,
        }
    }
}

impl AudioFormat {
    pub fn bytes_per_second(&self) -> u32 {
        self.sample_rate * self.channels as u32 * (self.bit_depth as u32 / 8)
    }

    pub fn block_align(&self) -> u16 {
        self.channels * (self.bit_depth / 8)
    }
}

/// Per-session queue of captured frames awaiting end-of-utterance.
///
/// Cleared on submission to transcription, on interrupt, and on teardown.
#[derive(Debug, Default)]
pub struct AudioBuffer {
    data: Vec<u8>,
}

impl AudioBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: &[u8]) {
        self.data.extend_from_slice(frame);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Take the accumulated utterance, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// Wrap raw PCM in a minimal 44-byte RIFF/WAVE header.
pub fn wav_wrap(pcm: &[u8], format: AudioFormat) -> Vec<u8> {
    let data_len = pcm.len() as u32;
    let mut wav = Vec::with_capacity(44 + pcm.len());

    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");

    // fmt chunk: PCM, fixed edge format
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&format.channels.to_le_bytes());
    wav.extend_from_slice(&format.sample_rate.to_le_bytes());
    wav.extend_from_slice(&format.bytes_per_second().to_le_bytes());
    wav.extend_from_slice(&format.block_align().to_le_bytes());
    wav.extend_from_slice(&format.bit_depth.to_le_bytes());

    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_accumulates_and_takes() {
        let mut buffer = AudioBuffer::new();
        buffer.push(&[1, 2, 3]);
        buffer.push(&[4, 5]);
        assert_eq!(buffer.len(), 5);

        let taken = buffer.take();
        assert_eq!(taken, vec![1, 2, 3, 4, 5]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn wav_header_has_expected_layout() {
        let pcm = vec![0u8; 320];
        let wav = wav_wrap(&pcm, AudioFormat::default());

        assert_eq!(wav.len(), 44 + 320);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        assert_eq!(&wav[36..40], b"data");

        // data chunk length
        let data_len = u32::from_le_bytes(wav[40..44].try_into().unwrap());
        assert_eq!(data_len, 320);

        // sample rate at offset 24
        let rate = u32::from_le_bytes(wav[24..28].try_into().unwrap());
        assert_eq!(rate, 16_000);
    }

    #[test]
    fn default_format_byte_rate() {
        let format = AudioFormat::default();
        assert_eq!(format.bytes_per_second(), 32_000);
        assert_eq!(format.block_align(), 2);
    }
}
