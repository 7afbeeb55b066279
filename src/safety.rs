//! Safety gate for risky requests
//!
//! Utterances are screened against a configurable list of risky verb
//! patterns before any skill runs. A match demands an explicit confirmation
//! token from the same source channel; without it the dispatcher refuses and
//! records the refusal.

use once_cell::sync::Lazy;
use regex::Regex;

/// Token that unlocks a risky request
pub const CONFIRM_TOKEN: &str = "confirm";

/// Canonical refusal message
pub const REFUSAL_MESSAGE: &str = "I won't do that without an explicit confirmation";

static DEFAULT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\bdelete\b",
        r"\bremove\b",
        r"\bwipe\b",
        r"\bsend\b",
        r"\bpay\b",
        r"\btransfer\b",
        r"\berase\b",
        r"\bpurge\b",
        r"rm\s+-rf",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){}", p)).expect("invalid safety pattern"))
    .collect()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyVerdict {
    Safe,
    /// The matched pattern, for the refusal record
    NeedsConfirmation { matched: String },
}

#[derive(Clone)]
pub struct SafetyGate {
    patterns: Vec<Regex>,
}

impl SafetyGate {
    pub fn new() -> Self {
        Self {
            patterns: DEFAULT_PATTERNS.clone(),
        }
    }

    /// Replace the default pattern set. Invalid patterns are dropped.
    pub fn with_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .filter_map(|p| Regex::new(&format!("(?i){}", p.as_ref())).ok())
                .collect(),
        }
    }

    pub fn assess(&self, utterance: &str) -> SafetyVerdict {
        for pattern in &self.patterns {
            if let Some(hit) = pattern.find(utterance) {
                return SafetyVerdict::NeedsConfirmation {
                    matched: hit.as_str().to_string(),
                };
            }
        }
        SafetyVerdict::Safe
    }

    /// Whether a follow-up reply counts as explicit confirmation.
    pub fn is_confirmation(&self, reply: &str) -> bool {
        reply
            .split_whitespace()
            .any(|w| w.trim_matches(|c: char| !c.is_alphanumeric())
                .eq_ignore_ascii_case(CONFIRM_TOKEN))
    }
}

impl Default for SafetyGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_utterances_pass() {
        let gate = SafetyGate::new();
        assert_eq!(gate.assess("what's on my calendar today"), SafetyVerdict::Safe);
        assert_eq!(gate.assess("summarize my inbox"), SafetyVerdict::Safe);
    }

    #[test]
    fn risky_verbs_match_case_insensitively() {
        let gate = SafetyGate::new();
        assert!(matches!(
            gate.assess("DELETE all my drafts"),
            SafetyVerdict::NeedsConfirmation { .. }
        ));
        assert!(matches!(
            gate.assess("please send the report to finance"),
            SafetyVerdict::NeedsConfirmation { matched } if matched.eq_ignore_ascii_case("send")
        ));
        assert!(matches!(
            gate.assess("run rm -rf /tmp/cache"),
            SafetyVerdict::NeedsConfirmation { .. }
        ));
    }

    #[test]
    fn word_boundaries_avoid_false_hits() {
        let gate = SafetyGate::new();
        // "sender" and "repayment" contain risky substrings but not the verbs.
        assert_eq!(gate.assess("who was the sender of this"), SafetyVerdict::Safe);
        assert_eq!(gate.assess("check my repayment plan"), SafetyVerdict::Safe);
    }

    #[test]
    fn custom_patterns_replace_defaults() {
        let gate = SafetyGate::with_patterns([r"\bformat\b"]);
        assert!(matches!(
            gate.assess("format the disk"),
            SafetyVerdict::NeedsConfirmation { .. }
        ));
        assert_eq!(gate.assess("delete everything"), SafetyVerdict::Safe);
    }

    #[test]
    fn confirmation_token_detection() {
        let gate = SafetyGate::new();
        assert!(gate.is_confirmation("confirm"));
        assert!(gate.is_confirmation("yes, CONFIRM."));
        assert!(!gate.is_confirmation("confirmation pending"));
        assert!(!gate.is_confirmation("no"));
    }
}
