use base64::Engine;
use serde::Deserialize;

use crate::protocol::BridgeErrorCode;
use colloquy_voice::AudioFormat;

const MAX_AUDIO_B64_BYTES: usize = 6 * 1024 * 1024;

/// Base64-encoded audio frame as carried by `audio.chunk` messages.
#[derive(Debug, Deserialize)]
pub struct AudioPayload {
    pub audio_b64: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub sample_rate_hz: Option<u32>,
    #[serde(default)]
    pub channels: Option<u16>,
}

#[derive(Debug)]
pub struct AudioError {
    pub code: BridgeErrorCode,
    pub message: String,
}

impl AudioError {
    fn new(code: BridgeErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Decode a frame to raw PCM bytes, enforcing the engine's fixed edge
/// format. The engine takes s16le verbatim; resampling is the client's job.
pub fn decode_frame(payload: &AudioPayload, expected: AudioFormat) -> Result<Vec<u8>, AudioError> {
    let format = payload.format.as_deref().unwrap_or("pcm_s16le");
    if !format.eq_ignore_ascii_case("pcm_s16le") {
        return Err(AudioError::new(
            BridgeErrorCode::UnsupportedAudioFormat,
            format!("Unsupported audio format '{format}' (expected 'pcm_s16le')"),
        ));
    }

    let sample_rate = payload.sample_rate_hz.unwrap_or(expected.sample_rate);
    if sample_rate != expected.sample_rate {
        return Err(AudioError::new(
            BridgeErrorCode::UnsupportedAudioFormat,
            format!(
                "Unsupported sample_rate_hz {sample_rate} (expected {})",
                expected.sample_rate
            ),
        ));
    }

    let channels = payload.channels.unwrap_or(expected.channels);
    if channels != expected.channels {
        return Err(AudioError::new(
            BridgeErrorCode::UnsupportedAudioFormat,
            format!("Unsupported channels {channels} (expected {})", expected.channels),
        ));
    }

    if payload.audio_b64.len() > MAX_AUDIO_B64_BYTES {
        return Err(AudioError::new(
            BridgeErrorCode::PayloadTooLarge,
            format!(
                "audio_b64 exceeds max size ({} > {MAX_AUDIO_B64_BYTES})",
                payload.audio_b64.len()
            ),
        ));
    }

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.audio_b64.as_bytes())
        .map_err(|e| {
            AudioError::new(
                BridgeErrorCode::AudioDecodeFailed,
                format!("Invalid base64 audio payload: {e}"),
            )
        })?;

    if bytes.len() % 2 != 0 {
        return Err(AudioError::new(
            BridgeErrorCode::AudioDecodeFailed,
            format!("pcm_s16le payload must be divisible by 2 bytes, got {}", bytes.len()),
        ));
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(bytes: &[u8]) -> AudioPayload {
        AudioPayload {
            audio_b64: base64::engine::general_purpose::STANDARD.encode(bytes),
            format: None,
            sample_rate_hz: None,
            channels: None,
        }
    }

    #[test]
    fn decodes_pcm_with_defaults() {
        let pcm = decode_frame(&payload(&[0, 1, 2, 3]), AudioFormat::default()).unwrap();
        assert_eq!(pcm, vec![0, 1, 2, 3]);
    }

    #[test]
    fn rejects_odd_byte_count() {
        let err = decode_frame(&payload(&[0, 1, 2]), AudioFormat::default()).unwrap_err();
        assert_eq!(err.code, BridgeErrorCode::AudioDecodeFailed);
    }

    #[test]
    fn rejects_unexpected_sample_rate() {
        let mut p = payload(&[0, 1]);
        p.sample_rate_hz = Some(8_000);
        let err = decode_frame(&p, AudioFormat::default()).unwrap_err();
        assert_eq!(err.code, BridgeErrorCode::UnsupportedAudioFormat);
    }

    #[test]
    fn rejects_unknown_format() {
        let mut p = payload(&[0, 1]);
        p.format = Some("f32le".into());
        let err = decode_frame(&p, AudioFormat::default()).unwrap_err();
        assert_eq!(err.code, BridgeErrorCode::UnsupportedAudioFormat);
    }

    #[test]
    fn rejects_invalid_base64() {
        let p = AudioPayload {
            audio_b64: "not-base64!!!".into(),
            format: None,
            sample_rate_hz: None,
            channels: None,
        };
        let err = decode_frame(&p, AudioFormat::default()).unwrap_err();
        assert_eq!(err.code, BridgeErrorCode::AudioDecodeFailed);
    }
}
