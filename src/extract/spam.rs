//! Fused spam classification for mail items.
//!
//! Three signal sources, fused with the rules as a hard override:
//! 1. Provider labels/categories (promotional, spam)
//! 2. Sender-domain and subject patterns
//! 3. An LLM verdict `{is_spam, reason, score}` gated by the configured
//!    threshold
//!
//! A rule hit flags spam regardless of the LLM. LLM failure degrades to
//! rules only, with the score set to the rules' own confidence.

use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::cancel::CancelSignal;
use crate::llm::{parse_json_response, ChatMessage, ChatRequest, Chatter, RetryingChatter};

/// Provider labels that are a hard spam signal.
const SPAM_LABELS: &[&str] = &["PROMOTIONS", "SPAM", "JUNK", "MARKETING"];

/// Classification outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct SpamVerdict {
    pub is_spam: bool,
    /// Human-readable cause, set whenever `is_spam`.
    pub reason: Option<String>,
    /// Confidence in `[0, 1]`.
    pub score: Option<f64>,
}

impl SpamVerdict {
    fn clean() -> Self {
        Self {
            is_spam: false,
            reason: None,
            score: Some(0.0),
        }
    }
}

/// LLM response schema for the spam prompt.
#[derive(Debug, Deserialize)]
struct LlmSpamVerdict {
    is_spam: bool,
    #[serde(default)]
    reason: Option<String>,
    score: f64,
}

/// Rule + LLM spam classifier.
pub struct SpamClassifier {
    sender_patterns: Vec<Regex>,
    subject_patterns: Vec<Regex>,
    threshold: f64,
}

impl std::fmt::Debug for SpamClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpamClassifier")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

impl SpamClassifier {
    /// Build the classifier with the configured LLM threshold.
    pub fn new(threshold: f64) -> Self {
        let sender_patterns = [
            r"(?i)^(no-?reply|newsletter|marketing|promo|offers|deals)@",
            r"(?i)@(mailer|campaign|marketing|newsletters?)\.",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect();
        let subject_patterns = [
            r"(?i)\b\d{1,3}%\s*off\b",
            r"(?i)\bfree (trial|shipping|gift)\b",
            r"(?i)\b(flash|clearance) sale\b",
            r"(?i)\blimited time\b",
            r"(?i)\bact now\b",
            r"(?i)\bunsubscribe\b",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect();
        Self {
            sender_patterns,
            subject_patterns,
            threshold,
        }
    }

    /// Rules-only verdict from labels, sender, and subject.
    pub fn classify_rules(&self, labels: &[String], sender: &str, subject: &str) -> SpamVerdict {
        for label in labels {
            let upper = label.to_uppercase();
            if SPAM_LABELS.contains(&upper.as_str()) {
                return SpamVerdict {
                    is_spam: true,
                    reason: Some(format!("provider label {upper}")),
                    score: Some(0.95),
                };
            }
        }
        if let Some(pattern) = self.sender_patterns.iter().find(|p| p.is_match(sender)) {
            return SpamVerdict {
                is_spam: true,
                reason: Some(format!("sender matches {}", pattern.as_str())),
                score: Some(0.9),
            };
        }
        if let Some(pattern) = self.subject_patterns.iter().find(|p| p.is_match(subject)) {
            return SpamVerdict {
                is_spam: true,
                reason: Some(format!("subject matches {}", pattern.as_str())),
                score: Some(0.85),
            };
        }
        SpamVerdict::clean()
    }

    /// Full fused classification.
    ///
    /// The rule verdict is a hard override: a rule hit is spam no matter
    /// what the LLM says. Otherwise the LLM verdict applies when its
    /// score clears the threshold. Any LLM failure falls back to the rule
    /// verdict.
    pub async fn classify<C: Chatter>(
        &self,
        labels: &[String],
        sender: &str,
        subject: &str,
        body: &str,
        chatter: Option<&RetryingChatter<C>>,
        cancel: &CancelSignal,
    ) -> SpamVerdict {
        let rules = self.classify_rules(labels, sender, subject);
        if rules.is_spam {
            return rules;
        }

        let Some(chatter) = chatter else {
            return rules;
        };

        let body_excerpt: String = body.chars().take(1500).collect();
        let request = ChatRequest {
            messages: vec![
                ChatMessage::system(
                    "You classify email as promotional/spam versus personally relevant. \
                     Judge only from the given fields.",
                ),
                ChatMessage::user(format!(
                    "Sender: {sender}\nSubject: {subject}\nBody:\n{body_excerpt}"
                )),
            ],
            max_tokens: 200,
            response_schema: Some(json!({
                "type": "object",
                "required": ["is_spam", "score"],
                "properties": {
                    "is_spam": {"type": "boolean"},
                    "reason": {"type": "string"},
                    "score": {"type": "number", "minimum": 0.0, "maximum": 1.0}
                }
            })),
        };

        match chatter.chat(&request, cancel).await {
            Ok(response) => match parse_json_response::<LlmSpamVerdict>(&response.text) {
                Ok(verdict) => {
                    let score = verdict.score.clamp(0.0, 1.0);
                    if verdict.is_spam && score >= self.threshold {
                        SpamVerdict {
                            is_spam: true,
                            reason: verdict
                                .reason
                                .or_else(|| Some("llm classification".to_owned())),
                            score: Some(score),
                        }
                    } else {
                        debug!(score, "llm verdict below spam threshold");
                        SpamVerdict {
                            is_spam: false,
                            reason: None,
                            score: Some(score),
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "spam llm returned unusable output, using rules only");
                    rules
                }
            },
            Err(e) => {
                warn!(error = %e, "spam llm call failed, using rules only");
                rules
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatError, ChatResponse};
    use async_trait::async_trait;

    struct FixedChatter(String);

    #[async_trait]
    impl Chatter for FixedChatter {
        async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, ChatError> {
            Ok(ChatResponse {
                text: self.0.clone(),
            })
        }
    }

    struct BrokenChatter;

    #[async_trait]
    impl Chatter for BrokenChatter {
        async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, ChatError> {
            Err(ChatError::Transient("down".to_owned()))
        }
    }

    #[test]
    fn test_provider_label_is_hard_spam() {
        let classifier = SpamClassifier::new(0.7);
        let verdict = classifier.classify_rules(
            &["PROMOTIONS".to_owned()],
            "friend@example.com",
            "Lunch tomorrow?",
        );
        assert!(verdict.is_spam);
        assert!(verdict.reason.as_deref().unwrap_or("").contains("PROMOTIONS"));
    }

    #[test]
    fn test_sender_pattern_flags() {
        let classifier = SpamClassifier::new(0.7);
        let verdict = classifier.classify_rules(&[], "noreply@shop.example", "Your order");
        assert!(verdict.is_spam);
    }

    #[test]
    fn test_promo_subject_flags() {
        let classifier = SpamClassifier::new(0.7);
        let verdict = classifier.classify_rules(&[], "person@example.com", "50% off membership!");
        assert!(verdict.is_spam);
    }

    #[test]
    fn test_clean_mail_passes_rules() {
        let classifier = SpamClassifier::new(0.7);
        let verdict = classifier.classify_rules(&[], "boss@company.com", "Q3 budget review");
        assert!(!verdict.is_spam);
    }

    #[tokio::test]
    async fn test_rules_override_llm_ham_verdict() {
        let classifier = SpamClassifier::new(0.7);
        let chatter = RetryingChatter::new(
            FixedChatter(r#"{"is_spam": false, "score": 0.0}"#.to_owned()),
            0,
        );
        let verdict = classifier
            .classify(
                &["PROMOTIONS".to_owned()],
                "friend@example.com",
                "hello",
                "",
                Some(&chatter),
                &CancelSignal::never(),
            )
            .await;
        assert!(verdict.is_spam, "rule hit is a hard override");
    }

    #[tokio::test]
    async fn test_llm_flags_beyond_rules_when_over_threshold() {
        let classifier = SpamClassifier::new(0.7);
        let chatter = RetryingChatter::new(
            FixedChatter(r#"{"is_spam": true, "reason": "bulk blast", "score": 0.9}"#.to_owned()),
            0,
        );
        let verdict = classifier
            .classify(
                &[],
                "person@example.com",
                "An opportunity",
                "Dear valued customer...",
                Some(&chatter),
                &CancelSignal::never(),
            )
            .await;
        assert!(verdict.is_spam);
        assert_eq!(verdict.score, Some(0.9));
    }

    #[tokio::test]
    async fn test_llm_below_threshold_stays_clean() {
        let classifier = SpamClassifier::new(0.7);
        let chatter = RetryingChatter::new(
            FixedChatter(r#"{"is_spam": true, "score": 0.5}"#.to_owned()),
            0,
        );
        let verdict = classifier
            .classify(
                &[],
                "person@example.com",
                "newsletter-ish",
                "",
                Some(&chatter),
                &CancelSignal::never(),
            )
            .await;
        assert!(!verdict.is_spam, "sub-threshold llm score must not flag");
    }

    #[tokio::test]
    async fn test_llm_failure_degrades_to_rules() {
        let classifier = SpamClassifier::new(0.7);
        let chatter = RetryingChatter::new(BrokenChatter, 0);
        let verdict = classifier
            .classify(
                &[],
                "boss@company.com",
                "Q3 budget",
                "please review",
                Some(&chatter),
                &CancelSignal::never(),
            )
            .await;
        assert!(!verdict.is_spam);
        assert_eq!(verdict.score, Some(0.0), "rules-only confidence");
    }
}
