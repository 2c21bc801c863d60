//! Credential / quota failure signatures
//!
//! The bank is data, not code: the defaults below can be replaced wholesale
//! from `[detection] patterns` in config.toml. Entries are evaluated in order
//! and the first match wins, so more specific signatures must come first.
//!
//! All patterns are compiled case-insensitively.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// One configurable failure signature
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSpec {
    /// Stable identifier, used in logs
    pub name: String,
    /// Regular expression (case-insensitive)
    pub regex: String,
    /// Human-readable reason reported with the failure event
    pub reason: String,
}

impl PatternSpec {
    fn new(name: &str, regex: &str, reason: &str) -> Self {
        Self {
            name: name.to_string(),
            regex: regex.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Built-in signatures. Format: (name, regex, reason)
const DEFAULT_PATTERNS: &[(&str, &str, &str)] = &[
    (
        "insufficient_credits",
        r"insufficient[\s_-]+(credits?|balance|funds)",
        "Insufficient credits",
    ),
    (
        "credit_balance_low",
        r"credit balance is too low",
        "Credit balance is too low",
    ),
    (
        "quota_exceeded",
        r"exceeded your current quota|insufficient_quota|quota (has been )?exceeded",
        "Quota exceeded",
    ),
    (
        "usage_limit",
        r"usage limit (reached|exceeded)|you'?ve (hit|reached) your (usage )?limit",
        "Usage limit reached",
    ),
    (
        "invalid_api_key",
        r"invalid[\s_-]*(x-)?api[\s_-]*key|incorrect api key",
        "Invalid API key",
    ),
    (
        "token_expired",
        r"(oauth )?token (has )?expired|token[_ ]expired",
        "Token expired",
    ),
    (
        "authentication_error",
        r"authentication[_ ]error|\b401\b[^\n]{0,40}unauthori[sz]ed",
        "Authentication failed",
    ),
    (
        "permission_denied",
        r"permission[_ ]error|\b403\b[^\n]{0,40}forbidden",
        "Permission denied",
    ),
    (
        "account_disabled",
        r"(account|organization) (has been )?(disabled|suspended)",
        "Account disabled",
    ),
];

/// The built-in bank as serializable specs (config defaults)
pub fn default_pattern_specs() -> Vec<PatternSpec> {
    DEFAULT_PATTERNS
        .iter()
        .map(|(name, regex, reason)| PatternSpec::new(name, regex, reason))
        .collect()
}

#[derive(Debug, thiserror::Error)]
#[error("invalid failure pattern '{name}': {source}")]
pub struct PatternError {
    pub name: String,
    #[source]
    pub source: regex::Error,
}

#[derive(Clone, Debug)]
struct CompiledPattern {
    name: String,
    regex: Regex,
    reason: String,
}

/// A pattern that matched some text
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatternMatch {
    pub name: String,
    pub reason: String,
    pub matched: String,
}

/// Ordered, compiled set of failure signatures
#[derive(Clone, Debug)]
pub struct PatternBank {
    patterns: Vec<CompiledPattern>,
}

impl PatternBank {
    pub fn new(specs: &[PatternSpec]) -> Result<Self, PatternError> {
        let patterns = specs
            .iter()
            .map(|spec| {
                let regex = RegexBuilder::new(&spec.regex)
                    .case_insensitive(true)
                    .build()
                    .map_err(|source| PatternError {
                        name: spec.name.clone(),
                        source,
                    })?;
                Ok(CompiledPattern {
                    name: spec.name.clone(),
                    regex,
                    reason: spec.reason.clone(),
                })
            })
            .collect::<Result<Vec<_>, PatternError>>()?;
        Ok(Self { patterns })
    }

    /// Test `text` against every entry in bank order; first match wins
    pub fn find(&self, text: &str) -> Option<PatternMatch> {
        self.patterns.iter().find_map(|p| {
            p.regex.find(text).map(|m| PatternMatch {
                name: p.name.clone(),
                reason: p.reason.clone(),
                matched: m.as_str().to_string(),
            })
        })
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl Default for PatternBank {
    fn default() -> Self {
        // The built-in table is covered by `default_bank_compiles`
        Self::new(&default_pattern_specs()).unwrap_or_else(|_| Self {
            patterns: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bank_compiles() {
        let bank = PatternBank::new(&default_pattern_specs()).unwrap();
        assert_eq!(bank.len(), DEFAULT_PATTERNS.len());
    }

    #[test]
    fn test_matches_insufficient_credits_case_insensitively() {
        let bank = PatternBank::default();
        let m = bank
            .find("API Error: 400 Your account has INSUFFICIENT CREDITS to continue")
            .unwrap();
        assert_eq!(m.name, "insufficient_credits");
        assert_eq!(m.reason, "Insufficient credits");
        assert_eq!(m.matched, "INSUFFICIENT CREDITS");
    }

    #[test]
    fn test_recognizes_common_provider_errors() {
        let bank = PatternBank::default();
        let cases = [
            (
                "You exceeded your current quota, please check your plan",
                "quota_exceeded",
            ),
            ("Invalid API key · Please run /login", "invalid_api_key"),
            ("error: OAuth token has expired", "token_expired"),
            (
                r#"{"type":"error","error":{"type":"authentication_error"}}"#,
                "authentication_error",
            ),
            ("HTTP 403 Forbidden", "permission_denied"),
            ("Your credit balance is too low to access the API", "credit_balance_low"),
        ];
        for (text, expected) in cases {
            let m = bank.find(text).unwrap_or_else(|| panic!("no match for {text:?}"));
            assert_eq!(m.name, expected, "text: {text:?}");
        }
    }

    #[test]
    fn test_ordinary_output_does_not_match() {
        let bank = PatternBank::default();
        assert!(bank.find("Compiling session_manager v0.1.0").is_none());
        assert!(bank.find("$ ls -la\ntotal 42\n").is_none());
    }

    #[test]
    fn test_first_match_wins_in_bank_order() {
        let bank = PatternBank::new(&[
            PatternSpec::new("first", "limit", "first reason"),
            PatternSpec::new("second", "usage limit", "second reason"),
        ])
        .unwrap();
        assert_eq!(bank.find("usage limit reached").unwrap().name, "first");
    }

    #[test]
    fn test_invalid_regex_reports_pattern_name() {
        let err = PatternBank::new(&[PatternSpec::new("broken", "(unclosed", "x")]).unwrap_err();
        assert_eq!(err.name, "broken");
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_empty_bank_never_matches() {
        let bank = PatternBank::new(&[]).unwrap();
        assert!(bank.is_empty());
        assert!(bank.find("insufficient credits").is_none());
    }
}
