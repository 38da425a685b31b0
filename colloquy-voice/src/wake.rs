//! Wake / interrupt word detection on textual transcripts
//!
//! Purely text-level: the engine never inspects raw PCM for trigger words.
//! Interrupt phrases are scanned before wake phrases, exact hits beat fuzzy
//! ones, and positives are debounced so one utterance cannot re-trigger.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Filler sequences stripped from the front of a command tail.
const FILLER_WORDS: &[&[&str]] = &[&["please"], &["can", "you"], &["could", "you"], &["would", "you"]];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Wake,
    Interrupt,
}

/// A positive classification of an utterance.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub kind: TriggerKind,
    pub matched: String,
    pub confidence: f32,
}

/// Text-level wake/interrupt scanner.
pub struct WakeWordDetector {
    wake_phrases: Vec<String>,
    interrupt_phrases: Vec<String>,
    sensitivity: f32,
    debounce: Duration,
    last_trigger: Mutex<Option<Instant>>,
}

impl WakeWordDetector {
    pub fn new(
        wake_phrases: &[String],
        interrupt_phrases: &[String],
        sensitivity: f32,
        debounce: Duration,
    ) -> Self {
        let normalize = |phrases: &[String]| {
            phrases
                .iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect()
        };
        Self {
            wake_phrases: normalize(wake_phrases),
            interrupt_phrases: normalize(interrupt_phrases),
            sensitivity: sensitivity.clamp(0.0, 1.0),
            debounce,
            last_trigger: Mutex::new(None),
        }
    }

    /// Classify an utterance. Interrupt phrases win over wake phrases; the
    /// first hit in configuration order is returned. `None` means the text
    /// matched nothing or a positive fired inside the debounce window.
    pub fn classify(&self, text: &str) -> Option<Trigger> {
        let text = text.trim().to_lowercase();
        if text.is_empty() {
            return None;
        }

        let now = Instant::now();
        if let Some(last) = *self.last_trigger.lock() {
            if now.duration_since(last) < self.debounce {
                return None;
            }
        }

        let trigger = self.scan(&text)?;
        *self.last_trigger.lock() = Some(now);
        log::debug!(
            "[Wake] {:?} '{}' confidence {:.2}",
            trigger.kind,
            trigger.matched,
            trigger.confidence
        );
        Some(trigger)
    }

    fn scan(&self, text: &str) -> Option<Trigger> {
        for phrase in &self.interrupt_phrases {
            if text.contains(phrase.as_str()) {
                return Some(Trigger {
                    kind: TriggerKind::Interrupt,
                    matched: phrase.clone(),
                    confidence: 1.0,
                });
            }
            let similarity = prefix_similarity(text, phrase);
            if similarity >= self.sensitivity {
                return Some(Trigger {
                    kind: TriggerKind::Interrupt,
                    matched: phrase.clone(),
                    confidence: similarity,
                });
            }
        }

        for phrase in &self.wake_phrases {
            if text.starts_with(phrase.as_str()) {
                return Some(Trigger {
                    kind: TriggerKind::Wake,
                    matched: phrase.clone(),
                    confidence: 1.0,
                });
            }
            let similarity = prefix_similarity(text, phrase);
            if similarity >= self.sensitivity {
                return Some(Trigger {
                    kind: TriggerKind::Wake,
                    matched: phrase.clone(),
                    confidence: similarity,
                });
            }
        }

        None
    }
}

/// Similarity between a phrase and the leading |phrase|-word prefix of the
/// text, as normalized Levenshtein over characters.
fn prefix_similarity(text: &str, phrase: &str) -> f32 {
    let word_count = phrase.split_whitespace().count();
    if word_count == 0 {
        return 0.0;
    }
    let prefix = text
        .split_whitespace()
        .take(word_count)
        .collect::<Vec<_>>()
        .join(" ");
    if prefix.is_empty() {
        return 0.0;
    }
    similarity(&prefix, phrase)
}

fn similarity(a: &str, b: &str) -> f32 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein_distance(&a, &b) as f32 / max_len as f32
}

fn levenshtein_distance<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    let m = a.len();
    let n = b.len();

    if m == 0 {
        return n;
    }
    if n == 0 {
        return m;
    }

    let mut prev = (0..=n).collect::<Vec<_>>();
    let mut curr = vec![0; n + 1];

    for i in 1..=m {
        curr[0] = i;
        for j in 1..=n {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// Strip the matched wake phrase and any leading filler words, returning the
/// command the user actually issued ("hey assistant, please check the build"
/// becomes "check the build").
pub fn extract_command_after_wake(text: &str, phrase: &str) -> String {
    let words: Vec<&str> = text.trim().split_whitespace().collect();
    let phrase_len = phrase.split_whitespace().count();
    let mut index = phrase_len.min(words.len());

    'fillers: loop {
        for filler in FILLER_WORDS {
            if words.len() >= index + filler.len()
                && words[index..index + filler.len()]
                    .iter()
                    .zip(filler.iter())
                    .all(|(word, expected)| norm_word(word) == *expected)
            {
                index += filler.len();
                continue 'fillers;
            }
        }
        break;
    }

    words[index..].join(" ")
}

fn norm_word(word: &str) -> String {
    word.chars()
        .filter(|c| c.is_alphanumeric() || *c == '\'')
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(sensitivity: f32) -> WakeWordDetector {
        WakeWordDetector::new(
            &["hey assistant".to_string()],
            &["stop".to_string(), "cancel".to_string()],
            sensitivity,
            Duration::ZERO,
        )
    }

    #[test]
    fn interrupt_substring_is_exact_hit() {
        let trigger = detector(0.8).classify("please just stop talking").unwrap();
        assert_eq!(trigger.kind, TriggerKind::Interrupt);
        assert_eq!(trigger.matched, "stop");
        assert_eq!(trigger.confidence, 1.0);
    }

    #[test]
    fn interrupt_wins_over_wake() {
        let trigger = detector(0.8)
            .classify("hey assistant stop everything")
            .unwrap();
        assert_eq!(trigger.kind, TriggerKind::Interrupt);
    }

    #[test]
    fn leading_cancel_classifies_as_interrupt() {
        let trigger = detector(0.8)
            .classify("Cancel, give me the count instead.")
            .unwrap();
        assert_eq!(trigger.kind, TriggerKind::Interrupt);
        assert_eq!(trigger.matched, "cancel");
    }

    #[test]
    fn wake_exact_prefix() {
        let trigger = detector(0.8)
            .classify("hey assistant what time is it")
            .unwrap();
        assert_eq!(trigger.kind, TriggerKind::Wake);
        assert_eq!(trigger.confidence, 1.0);
    }

    #[test]
    fn wake_fuzzy_prefix_tolerates_stt_noise() {
        // "hay assistant" is one edit away from the 13-char phrase
        let trigger = detector(0.85).classify("hay assistant lights on").unwrap();
        assert_eq!(trigger.kind, TriggerKind::Wake);
        assert!(trigger.confidence > 0.9);
    }

    #[test]
    fn unrelated_text_matches_nothing() {
        assert!(detector(0.8).classify("the weather is nice today").is_none());
        assert!(detector(0.8).classify("").is_none());
    }

    #[test]
    fn debounce_suppresses_repeat_triggers() {
        let detector = WakeWordDetector::new(
            &[],
            &["stop".to_string()],
            0.8,
            Duration::from_secs(60),
        );
        assert!(detector.classify("stop").is_some());
        assert!(detector.classify("stop").is_none());
    }

    #[test]
    fn command_tail_strips_phrase_and_fillers() {
        assert_eq!(
            extract_command_after_wake("hey assistant, please check the build", "hey assistant"),
            "check the build"
        );
        assert_eq!(
            extract_command_after_wake("hey assistant could you open the door", "hey assistant"),
            "open the door"
        );
    }

    #[test]
    fn command_tail_empty_when_wake_alone() {
        assert_eq!(extract_command_after_wake("hey assistant", "hey assistant"), "");
        assert_eq!(
            extract_command_after_wake("hey assistant please", "hey assistant"),
            ""
        );
    }
}
