//! Reply verification - "no unsupported claims" gate on generated text
//!
//! Splits a reply into claims, scores each against a flattened context
//! snapshot with a weighted token-overlap similarity, and either passes the
//! reply through or appends a disclaimer. The rule-based pass is the default:
//! it is deterministic and sits on the critical latency path. A model-backed
//! mode can be enabled instead; it falls back to the rules on any failure.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use crate::memory::{Message, Role};
use crate::ports::ResponseGenerator;

/// Terms that weigh double in similarity scoring. Stable and documented;
/// ASCII lowercase only.
pub const KEY_TERMS: &[&str] = &[
    "error", "issue", "bug", "version", "update", "status", "count", "total", "name", "id",
];

/// Appended to a reply that failed verification.
pub const DISCLAIMER: &str =
    "Please note: I could not fully verify some of this information against my available sources.";

const MIN_CLAIM_CHARS: usize = 10;
const SIMILARITY_FLOOR: f32 = 0.5;
const GENERAL_KNOWLEDGE_CONFIDENCE: f32 = 0.7;
const UNVERIFIED_CONFIDENCE: f32 = 0.2;
const SNIPPET_CAP_CHARS: usize = 200;
const WARNING_CAP_CHARS: usize = 50;
const MODEL_VERDICT_TIMEOUT: Duration = Duration::from_secs(10);

/// Hedging cues; a sentence containing one is an opinion and never a claim.
const HEDGING_PATTERNS: &[&str] = &[
    "i think",
    "i believe",
    "i feel",
    "in my opinion",
    "probably",
    "perhaps",
    "maybe",
    "might",
    "seems like",
];

/// Greeting openers dropped at extraction time.
const GREETING_OPENERS: &[&str] = &["hello", "hi", "hey", "good morning", "good afternoon", "good evening"];

/// Pleasantries dropped at extraction time wherever they appear.
const GREETING_PHRASES: &[&str] = &[
    "how can i help",
    "you're welcome",
    "my pleasure",
    "nice to meet",
];

/// Honest-uncertainty and self-description statements that count as safe
/// general knowledge when no source matches.
const SAFE_GENERAL_PATTERNS: &[&str] = &[
    "i don't have",
    "i do not have",
    "i'm not sure",
    "i am not sure",
    "i cannot",
    "i can't",
    "no information available",
    "i'm an assistant",
    "i am an assistant",
    "i'm here to help",
    "i can help",
];

const REFERENCE_CUES: &[&str] = &[
    "according to",
    "based on",
    "as stated in",
    "as mentioned in",
    "per the",
];

const RELATIVE_TIME_TOKENS: &[&str] = &[
    "yesterday",
    "today",
    "tomorrow",
    "ago",
    "since",
    "last week",
    "last month",
    "last year",
    "next week",
    "next month",
    "next year",
];

static PERCENT_OR_CURRENCY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+(?:\.\d+)?\s*%|[$€£]\s*\d").expect("numeric pattern"));
static LARGE_NUMBER_KEYWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(hundred|thousand|million|billion|trillion)\b").expect("magnitude pattern")
});
static YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(?:19|20)\d{2}\b").expect("year pattern"));
// "may" is omitted: as a modal verb it would misfile ordinary sentences.
static MONTH_DAY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(january|february|march|april|june|july|august|september|october|november|december)\b")
        .expect("month pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimType {
    Factual,
    Numerical,
    Temporal,
    Reference,
    Opinion,
}

/// A single checkable sentence extracted from a reply.
#[derive(Debug, Clone, Serialize)]
pub struct Claim {
    pub text: String,
    pub claim_type: ClaimType,
    pub verified: bool,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub source: String,
    pub verified: bool,
    pub snippet: String,
    pub claim_type: ClaimType,
}

/// Immutable view of the data a reply may legitimately draw on.
#[derive(Debug, Clone, Default)]
pub struct ContextSnapshot {
    /// Cached external-API responses, label -> JSON-like value.
    pub api_data: BTreeMap<String, Value>,
    /// Recent conversation slice, if the caller wants replies checked
    /// against what was actually said.
    pub conversation: Vec<Message>,
    /// Free-form knowledge-base entries.
    pub knowledge_base: Vec<String>,
}

impl ContextSnapshot {
    pub fn is_empty(&self) -> bool {
        self.api_data.is_empty() && self.conversation.is_empty() && self.knowledge_base.is_empty()
    }

    pub fn with_api_entry(mut self, label: &str, value: Value) -> Self {
        self.api_data.insert(label.to_string(), value);
        self
    }
}

/// Outcome of verifying one reply.
#[derive(Debug, Clone)]
pub struct VerificationReport {
    pub verified: bool,
    pub confidence: f32,
    pub claims: Vec<Claim>,
    pub citations: Vec<Citation>,
    pub warnings: Vec<String>,
    /// Present when the reply failed verification: the original text with
    /// the disclaimer appended.
    pub rewritten: Option<String>,
    /// True when the model-backed mode was requested but unavailable and
    /// the rule-based pass answered instead.
    pub degraded: bool,
}

impl VerificationReport {
    /// A clean verdict used when verification is disabled.
    pub fn passthrough() -> Self {
        Self {
            verified: true,
            confidence: 1.0,
            claims: Vec::new(),
            citations: Vec::new(),
            warnings: Vec::new(),
            rewritten: None,
            degraded: false,
        }
    }

    pub fn summary(&self) -> VerificationSummary {
        VerificationSummary {
            verified: self.verified,
            confidence: self.confidence,
            citations: self.citations.clone(),
            warnings: self.warnings.clone(),
        }
    }
}

/// The slice of a report that rides on `generation.end` events.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationSummary {
    pub verified: bool,
    pub confidence: f32,
    pub citations: Vec<Citation>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    #[default]
    Rule,
    Llm,
}

/// Shape the model-backed mode asks the generator to emit.
#[derive(Debug, Deserialize)]
struct ModelVerdict {
    verified: bool,
    confidence: f32,
    #[serde(default)]
    warnings: Vec<String>,
}

pub struct ReplyVerifier {
    threshold: f32,
    mode: VerifyMode,
}

impl ReplyVerifier {
    pub fn new(threshold: f32, mode: VerifyMode) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
            mode,
        }
    }

    /// Verify a reply, honoring the configured mode. The generator is only
    /// consulted in `llm` mode; any failure there degrades to the rule-based
    /// pass.
    pub async fn verify(
        &self,
        reply: &str,
        snapshot: &ContextSnapshot,
        generator: Option<&dyn ResponseGenerator>,
    ) -> VerificationReport {
        if self.mode == VerifyMode::Llm {
            if let Some(generator) = generator {
                match self.verify_via_model(reply, snapshot, generator).await {
                    Ok(report) => return report,
                    Err(err) => {
                        log::warn!("[Verify] model verdict unavailable ({err}), using rules");
                        let mut report = self.verify_rule_based(reply, snapshot);
                        report.degraded = true;
                        return report;
                    }
                }
            }
        }
        self.verify_rule_based(reply, snapshot)
    }

    /// The deterministic rule-based pass.
    pub fn verify_rule_based(&self, reply: &str, snapshot: &ContextSnapshot) -> VerificationReport {
        let sentences = extract_claim_sentences(reply);
        if sentences.is_empty() {
            return VerificationReport::passthrough();
        }

        let corpus = flatten_snapshot(snapshot);
        let mut claims = Vec::with_capacity(sentences.len());
        let mut citations: Vec<Citation> = Vec::new();
        let mut warnings = Vec::new();

        for (text, claim_type) in sentences {
            let scored = score_claim(&text, &corpus);
            if scored.verified {
                if let (Some(source), Some(snippet)) = (&scored.source, &scored.snippet) {
                    if !citations.iter().any(|c| &c.source == source) {
                        citations.push(Citation {
                            source: source.clone(),
                            verified: true,
                            snippet: truncate(snippet, SNIPPET_CAP_CHARS),
                            claim_type,
                        });
                    }
                }
            } else {
                warnings.push(format!(
                    "Unverified claim: {}",
                    truncate(&text, WARNING_CAP_CHARS)
                ));
            }
            claims.push(Claim {
                text,
                claim_type,
                verified: scored.verified,
                confidence: scored.confidence,
                source: scored.source,
            });
        }

        let verified_count = claims.iter().filter(|c| c.verified).count();
        let overall = verified_count as f32 / claims.len() as f32;
        let verified = overall >= self.threshold;

        VerificationReport {
            verified,
            confidence: overall,
            rewritten: (!verified).then(|| format!("{} {}", reply.trim_end(), DISCLAIMER)),
            claims,
            citations,
            warnings,
            degraded: false,
        }
    }

    async fn verify_via_model(
        &self,
        reply: &str,
        snapshot: &ContextSnapshot,
        generator: &dyn ResponseGenerator,
    ) -> Result<VerificationReport, crate::ports::PortError> {
        use futures::StreamExt;
        use tokio_util::sync::CancellationToken;

        let corpus = flatten_snapshot(snapshot);
        let mut context_lines = String::new();
        for (label, snippet) in corpus.iter().take(50) {
            context_lines.push_str(&format!("[{label}] {snippet}\n"));
        }

        let instructions = "You check spoken assistant replies against the provided context. \
            Respond with ONLY a JSON object: \
            {\"verified\": bool, \"confidence\": number in [0,1], \"warnings\": [string]}.";
        let request = format!("Context:\n{context_lines}\nReply to check:\n{reply}");
        let messages = vec![
            Message::new(Role::System, instructions),
            Message::new(Role::User, request),
        ];

        let cancel = CancellationToken::new();
        let collected = tokio::time::timeout(MODEL_VERDICT_TIMEOUT, async {
            let mut stream = generator.generate_stream(&messages, snapshot, cancel).await?;
            let mut text = String::new();
            while let Some(token) = stream.next().await {
                text.push_str(&token?);
            }
            Ok::<String, crate::ports::PortError>(text)
        })
        .await
        .map_err(|_| {
            crate::ports::PortError::Timeout(MODEL_VERDICT_TIMEOUT.as_millis() as u64)
        })??;

        let verdict: ModelVerdict = serde_json::from_str(strip_code_fences(&collected))
            .map_err(|e| crate::ports::PortError::InvalidPayload(e.to_string()))?;

        let verified = verdict.verified && verdict.confidence >= self.threshold;
        Ok(VerificationReport {
            verified,
            confidence: verdict.confidence.clamp(0.0, 1.0),
            claims: Vec::new(),
            citations: Vec::new(),
            warnings: verdict.warnings,
            rewritten: (!verified).then(|| format!("{} {}", reply.trim_end(), DISCLAIMER)),
            degraded: false,
        })
    }
}

struct ScoredClaim {
    verified: bool,
    confidence: f32,
    source: Option<String>,
    snippet: Option<String>,
}

/// Split a reply on sentence terminators and keep only checkable claims:
/// fragments, questions, greetings, and hedged opinions are dropped.
fn extract_claim_sentences(reply: &str) -> Vec<(String, ClaimType)> {
    split_sentences(reply)
        .into_iter()
        .filter(|s| s.len() >= MIN_CLAIM_CHARS)
        .filter(|s| !s.trim_end().ends_with('?'))
        .filter_map(|s| {
            let lower = s.to_lowercase();
            if is_greeting(&lower) {
                return None;
            }
            if HEDGING_PATTERNS.iter().any(|p| contains_phrase(&lower, p)) {
                return None; // opinion
            }
            let claim_type = classify_sentence(&lower);
            Some((s, claim_type))
        })
        .collect()
}

fn is_greeting(lower: &str) -> bool {
    let opener = GREETING_OPENERS.iter().any(|p| {
        lower.strip_prefix(p).map_or(false, |rest| {
            rest.chars().next().map_or(true, |c| !c.is_alphanumeric())
        })
    });
    opener || GREETING_PHRASES.iter().any(|p| lower.contains(p))
}

/// Substring match that respects word boundaries for single-word patterns
/// ("ago" must not fire inside "agonize").
fn contains_phrase(lower: &str, pattern: &str) -> bool {
    if pattern.contains(' ') {
        lower.contains(pattern)
    } else {
        lower
            .split(|c: char| !c.is_alphanumeric() && c != '\'')
            .any(|word| word == pattern)
    }
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        current.push(c);
        if matches!(c, '.' | '!' | '?' | '\n') {
            let sentence = current.trim().to_string();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            current.clear();
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

fn classify_sentence(lower: &str) -> ClaimType {
    if PERCENT_OR_CURRENCY.is_match(lower) || LARGE_NUMBER_KEYWORD.is_match(lower) {
        return ClaimType::Numerical;
    }
    if YEAR.is_match(lower)
        || MONTH_DAY.is_match(lower)
        || RELATIVE_TIME_TOKENS.iter().any(|t| contains_phrase(lower, t))
    {
        return ClaimType::Temporal;
    }
    if REFERENCE_CUES.iter().any(|c| lower.contains(c)) {
        return ClaimType::Reference;
    }
    ClaimType::Factual
}

fn score_claim(text: &str, corpus: &[(String, String)]) -> ScoredClaim {
    let query = tokenize(text);
    if query.is_empty() {
        return ScoredClaim {
            verified: true,
            confidence: GENERAL_KNOWLEDGE_CONFIDENCE,
            source: Some("general_knowledge".to_string()),
            snippet: None,
        };
    }

    let mut best: Option<(f32, &str, &str)> = None;
    for (label, snippet) in corpus {
        let candidate = tokenize(snippet);
        let similarity = weighted_similarity(&query, &candidate);
        if best.map(|(s, _, _)| similarity > s).unwrap_or(true) {
            best = Some((similarity, label, snippet));
        }
    }

    if let Some((similarity, label, snippet)) = best {
        if similarity >= SIMILARITY_FLOOR {
            return ScoredClaim {
                verified: true,
                confidence: similarity,
                source: Some(label.to_string()),
                snippet: Some(snippet.to_string()),
            };
        }
    }

    let lower = text.to_lowercase();
    if SAFE_GENERAL_PATTERNS.iter().any(|p| contains_phrase(&lower, p)) {
        return ScoredClaim {
            verified: true,
            confidence: GENERAL_KNOWLEDGE_CONFIDENCE,
            source: Some("general_knowledge".to_string()),
            snippet: None,
        };
    }

    ScoredClaim {
        verified: false,
        confidence: UNVERIFIED_CONFIDENCE,
        source: None,
        snippet: None,
    }
}

/// Lowercase, strip non-word characters, split on whitespace, drop short
/// tokens.
fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
        })
        .filter(|w| w.len() > 2)
        .collect()
}

/// Jaccard-like overlap where key terms weigh double. Capped at 1.0.
fn weighted_similarity(query: &HashSet<String>, candidate: &HashSet<String>) -> f32 {
    if query.is_empty() || candidate.is_empty() {
        return 0.0;
    }
    let intersection: f32 = query
        .intersection(candidate)
        .map(|w| if KEY_TERMS.contains(&w.as_str()) { 2.0 } else { 1.0 })
        .sum();
    if intersection == 0.0 {
        return 0.0;
    }
    let denominator = query.len() as f32 + candidate.len() as f32 - intersection;
    if denominator <= 0.0 {
        return 1.0;
    }
    (intersection / denominator).min(1.0)
}

/// Flatten a snapshot into (source label, snippet) pairs: nested API objects
/// become one `"path: leaf"` line per scalar, conversation history one pair
/// per message, knowledge-base entries one pair each.
fn flatten_snapshot(snapshot: &ContextSnapshot) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (key, value) in &snapshot.api_data {
        flatten_value(&format!("api:{key}"), "", value, &mut out);
    }
    for message in &snapshot.conversation {
        out.push((
            format!("conversation:{}", message.role.as_str()),
            message.text.clone(),
        ));
    }
    for entry in &snapshot.knowledge_base {
        out.push(("knowledge_base".to_string(), entry.clone()));
    }
    out
}

fn flatten_value(label: &str, path: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                flatten_value(label, &child_path, child, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                flatten_value(label, path, item, out);
            }
        }
        Value::Null => {}
        Value::String(text) => out.push((
            label.to_string(),
            if path.is_empty() {
                text.clone()
            } else {
                format!("{path}: {text}")
            },
        )),
        scalar => out.push((
            label.to_string(),
            if path.is_empty() {
                scalar.to_string()
            } else {
                format!("{path}: {scalar}")
            },
        )),
    }
}

fn truncate(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        text.to_string()
    } else {
        let cut: String = text.chars().take(cap).collect();
        format!("{cut}…")
    }
}

fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|t| t.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn verifier() -> ReplyVerifier {
        ReplyVerifier::new(0.6, VerifyMode::Rule)
    }

    #[test]
    fn supported_reply_verifies_with_citation() {
        let snapshot = ContextSnapshot::default()
            .with_api_entry("status", json!("All systems are healthy"));
        let report = verifier().verify_rule_based("All systems are healthy.", &snapshot);

        assert!(report.verified);
        assert_eq!(report.claims.len(), 1);
        assert!(report.claims[0].verified);
        assert_eq!(report.citations.len(), 1);
        assert_eq!(report.citations[0].source, "api:status");
        assert!(report.rewritten.is_none());
    }

    #[test]
    fn unsupported_reply_gets_disclaimer() {
        let report =
            verifier().verify_rule_based("There are 999 critical errors.", &ContextSnapshot::default());

        assert!(!report.verified);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].starts_with("Unverified claim:"));
        let rewritten = report.rewritten.expect("disclaimer appended");
        assert!(rewritten.ends_with(DISCLAIMER));
        assert!(rewritten.starts_with("There are 999 critical errors."));
    }

    #[test]
    fn greeting_extracts_zero_claims() {
        let report = verifier().verify_rule_based("Hello! How can I help?", &ContextSnapshot::default());
        assert!(report.verified);
        assert_eq!(report.confidence, 1.0);
        assert!(report.claims.is_empty());
        assert!(report.rewritten.is_none());
    }

    #[test]
    fn hedged_sentences_are_dropped_as_opinion() {
        let claims = extract_claim_sentences("I think the deploy is fine. The build count is 40.");
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].0, "The build count is 40.");
    }

    #[test]
    fn short_fragments_are_dropped() {
        assert!(extract_claim_sentences("Ok. Yes.").is_empty());
    }

    #[test]
    fn sentence_type_classification() {
        assert_eq!(classify_sentence("usage rose by 40% overnight"), ClaimType::Numerical);
        assert_eq!(classify_sentence("three million requests came in"), ClaimType::Numerical);
        assert_eq!(classify_sentence("it shipped in 2023"), ClaimType::Temporal);
        assert_eq!(classify_sentence("the outage was two days ago"), ClaimType::Temporal);
        assert_eq!(
            classify_sentence("according to the changelog this is fixed"),
            ClaimType::Reference
        );
        assert_eq!(classify_sentence("the cache layer stores sessions"), ClaimType::Factual);
    }

    #[test]
    fn uncertainty_counts_as_safe_general_knowledge() {
        let report = verifier().verify_rule_based(
            "I don't have that information right now.",
            &ContextSnapshot::default(),
        );
        assert!(report.verified);
        assert_eq!(report.claims[0].source.as_deref(), Some("general_knowledge"));
        assert!((report.claims[0].confidence - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn nested_api_values_flatten_with_paths() {
        let snapshot = ContextSnapshot::default().with_api_entry(
            "build",
            json!({"status": {"state": "passing"}, "checks": [{"name": "unit"}]}),
        );
        let flat = flatten_snapshot(&snapshot);

        assert!(flat.contains(&("api:build".to_string(), "status.state: passing".to_string())));
        assert!(flat.contains(&("api:build".to_string(), "checks.name: unit".to_string())));
    }

    #[test]
    fn conversation_and_knowledge_base_labels() {
        let mut snapshot = ContextSnapshot::default();
        snapshot.conversation.push(Message::new(Role::User, "what broke"));
        snapshot.knowledge_base.push("restarts fix most things".to_string());
        let flat = flatten_snapshot(&snapshot);

        assert_eq!(flat[0].0, "conversation:user");
        assert_eq!(flat[1].0, "knowledge_base");
    }

    #[test]
    fn key_terms_weigh_double() {
        // "status" is a key term: intersection = 2.0 + 1.0, |Q|=3, |C|=2,
        // denominator = 5 - 3 = 2, ratio capped at 1.0
        let query = tokenize("deploy status green");
        let candidate = tokenize("status green");
        assert_eq!(weighted_similarity(&query, &candidate), 1.0);

        // Without the key term the same shape scores lower
        let query = tokenize("deploy metric green");
        let candidate = tokenize("metric green");
        let unweighted = weighted_similarity(&query, &candidate);
        assert!((unweighted - 2.0 / 3.0).abs() < 0.01);
    }

    #[test]
    fn word_boundaries_respected_in_cues() {
        // "agonize" must not read as the relative-time token "ago"
        assert_eq!(classify_sentence("the team agonized over naming"), ClaimType::Factual);
        // "they" must not read as the greeting opener "hey"
        let claims = extract_claim_sentences("They rebooted the primary node.");
        assert_eq!(claims.len(), 1);
    }

    #[test]
    fn mixed_reply_below_threshold_fails() {
        let snapshot = ContextSnapshot::default()
            .with_api_entry("status", json!("database status degraded"));
        let reply = "The database status is degraded. \
                     The moon base reports nominal telemetry readings. \
                     Replication lag doubled after the eclipse event.";
        let report = verifier().verify_rule_based(reply, &snapshot);

        assert!(!report.verified);
        assert!(report.confidence < 0.6);
        assert_eq!(report.warnings.len(), 2);
    }

    #[test]
    fn warning_text_is_truncated() {
        let long = format!("The system {} is broken.", "x".repeat(120));
        let report = verifier().verify_rule_based(&long, &ContextSnapshot::default());
        assert!(report.warnings[0].len() < 90);
    }

    #[tokio::test]
    async fn llm_mode_without_generator_falls_back_to_rules() {
        let verifier = ReplyVerifier::new(0.6, VerifyMode::Llm);
        let report = verifier
            .verify("There are 999 critical errors.", &ContextSnapshot::default(), None)
            .await;
        assert!(!report.verified);
        assert!(report.rewritten.is_some());
    }
}
