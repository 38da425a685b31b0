//! Engine configuration - all tunable parameters
//!
//! Everything the pipeline engine recognizes lives here; transports load
//! and persist this however they like (the engine never touches disk).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::intake::AudioFormat;
use crate::upstream::RetryPolicy;
use crate::verify::VerifyMode;

/// Default wake phrases matched against live transcripts.
pub const DEFAULT_WAKE_PHRASES: &[&str] = &["hey assistant", "okay assistant"];

/// Default interrupt phrases. Interrupts always win over wakes.
pub const DEFAULT_INTERRUPT_PHRASES: &[&str] = &["stop", "cancel", "hold on", "never mind"];

/// Voice engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // Observability
    pub max_latency_ms: u64, // Warn threshold for turn latency

    // Session lifecycle
    pub session_timeout_ms: u64, // Inactivity window before a session is reaped

    // Audio intake gate
    pub min_utterance_bytes: usize, // Below this, an utterance is discarded silently
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,

    // Wake / interrupt detection
    pub wake_phrases: Vec<String>,
    pub interrupt_phrases: Vec<String>,
    pub wake_sensitivity: f32, // Fuzzy-match acceptance threshold (0.0-1.0)
    pub wake_debounce_ms: u64, // Suppress repeat triggers inside this window

    // Verification
    pub verify_enabled: bool,
    pub verify_threshold: f32, // Verified-claim ratio required for a clean verdict
    pub verify_mode: VerifyMode,

    // Upstream ceilings, applied per call rather than per turn
    pub transcribe_timeout_ms: u64,
    pub generate_timeout_ms: u64,
    pub synthesize_timeout_ms: u64,

    // Retry / breaker / rate limiting toward upstreams
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_ms: u64,
    pub rate_limit_per_sec: f64,

    // Per-session event queue depth (producers block when full)
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_latency_ms: 2_000,
            session_timeout_ms: 300_000,

            // 0.5s at 16kHz / 16-bit mono
            min_utterance_bytes: 16_000,
            sample_rate: 16_000,
            channels: 1,
            bit_depth: 16,

            wake_phrases: DEFAULT_WAKE_PHRASES.iter().map(|s| s.to_string()).collect(),
            interrupt_phrases: DEFAULT_INTERRUPT_PHRASES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            wake_sensitivity: 0.8,
            wake_debounce_ms: 1_000,

            verify_enabled: true,
            verify_threshold: 0.6,
            verify_mode: VerifyMode::Rule,

            transcribe_timeout_ms: 30_000,
            generate_timeout_ms: 60_000,
            synthesize_timeout_ms: 30_000,

            retry_attempts: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 5_000,
            breaker_failure_threshold: 5,
            breaker_cooldown_ms: 30_000,
            rate_limit_per_sec: 10.0,

            event_buffer: 64,
        }
    }
}

impl EngineConfig {
    pub fn audio_format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            bit_depth: self.bit_depth,
        }
    }

    pub fn wake_debounce(&self) -> Duration {
        Duration::from_millis(self.wake_debounce_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.min_utterance_bytes, 16_000);
        assert_eq!(config.sample_rate, 16_000);
        assert_eq!(config.verify_threshold, 0.6);
        assert_eq!(config.verify_mode, VerifyMode::Rule);
        assert!(config.verify_enabled);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).expect("serialize");
        let back: EngineConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.wake_phrases, config.wake_phrases);
        assert_eq!(back.session_timeout_ms, config.session_timeout_ms);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"verify_threshold": 0.8}"#).expect("partial config");
        assert_eq!(config.verify_threshold, 0.8);
        assert_eq!(config.sample_rate, 16_000);
    }

    #[test]
    fn retry_policy_never_zero_attempts() {
        let config = EngineConfig {
            retry_attempts: 0,
            ..Default::default()
        };
        assert_eq!(config.retry_policy().attempts, 1);
    }
}
