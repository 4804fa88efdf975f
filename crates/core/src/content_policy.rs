//! Prompt screening against two fixed vocabularies.
//!
//! Text is normalized first (NFKC, lowercase, zero-width characters removed,
//! whitespace collapsed) so that look-alike and padded spellings match.
//! Terms are anchored at the start of a word only, so inflected forms
//! ("kids", "nudes") match while "skid" does not.

use std::fmt;
use std::sync::LazyLock;

use regex::RegexSet;
use serde::Serialize;
use unicode_normalization::UnicodeNormalization;

use crate::error::PolicyError;

/// Refused for every caller.
pub const ALWAYS_BLOCKED_TERMS: &[&str] = &[
    "loli", "lolita", "child", "children", "underage", "minor", "kid", "preteen", "pedo", "cp",
];

/// Refused unless the caller is privileged.
pub const GATED_TERMS: &[&str] = &[
    "naked",
    "nude",
    "nudity",
    "nipples",
    "bare breasts",
    "pussy",
    "dick",
    "penis",
    "vagina",
    "anus",
    "tits",
    "intercourse",
    "blowjob",
    "genitals",
    "sex act",
    "explicit sexual",
    "porn",
    "explicit",
    "xxx",
    "hardcore",
];

/// Which vocabulary a match came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ContentCategory {
    #[serde(rename = "MINORS")]
    Minors,
    #[serde(rename = "ADULT_NSFW")]
    AdultNsfw,
}

impl fmt::Display for ContentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContentCategory::Minors => "MINORS",
            ContentCategory::AdultNsfw => "ADULT_NSFW",
        })
    }
}

fn is_zero_width(c: char) -> bool {
    matches!(c, '\u{200B}'..='\u{200D}' | '\u{FEFF}')
}

/// Canonical form used for matching.
pub fn normalize_text(text: &str) -> String {
    let folded: String = text
        .nfkc()
        .filter(|c| !is_zero_width(*c))
        .collect::<String>()
        .to_lowercase();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

static STANDARD: LazyLock<ContentPolicy> = LazyLock::new(|| {
    ContentPolicy::new(ALWAYS_BLOCKED_TERMS, GATED_TERMS)
        .expect("built-in vocabularies compile to a regex set")
});

/// Compiled vocabularies.
#[derive(Debug, Clone)]
pub struct ContentPolicy {
    blocked: RegexSet,
    gated: RegexSet,
}

impl ContentPolicy {
    pub fn new(blocked: &[&str], gated: &[&str]) -> Result<Self, regex::Error> {
        Ok(Self {
            blocked: compile(blocked)?,
            gated: compile(gated)?,
        })
    }

    /// The built-in vocabularies.
    pub fn standard() -> Self {
        STANDARD.clone()
    }

    /// Classify a single piece of text. Blocked terms win over gated ones.
    pub fn classify(&self, text: &str) -> Option<ContentCategory> {
        let normalized = normalize_text(text);
        if self.blocked.is_match(&normalized) {
            Some(ContentCategory::Minors)
        } else if self.gated.is_match(&normalized) {
            Some(ContentCategory::AdultNsfw)
        } else {
            None
        }
    }

    /// Screen every field of a request.
    ///
    /// The always-blocked vocabulary is checked across all fields before the
    /// gated one, for every caller.
    pub fn screen(&self, fields: &[&str], privileged: bool) -> Result<(), PolicyError> {
        let normalized: Vec<String> = fields.iter().map(|f| normalize_text(f)).collect();
        if normalized.iter().any(|t| self.blocked.is_match(t)) {
            return Err(PolicyError::ContentBlocked(ContentCategory::Minors));
        }
        if !privileged && normalized.iter().any(|t| self.gated.is_match(t)) {
            return Err(PolicyError::UpgradeRequired(ContentCategory::AdultNsfw));
        }
        Ok(())
    }
}

impl Default for ContentPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

fn compile(terms: &[&str]) -> Result<RegexSet, regex::Error> {
    RegexSet::new(
        terms
            .iter()
            .map(|t| format!(r"\b{}", regex::escape(&normalize_text(t)))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn normalization_folds_width_case_and_spacing() {
        assert_eq!(normalize_text("  ＮＵＤＥ\u{200B}  \t art "), "nude art");
        assert_eq!(normalize_text("bare\u{FEFF}   Breasts"), "bare breasts");
    }

    #[test]
    fn blocked_terms_refuse_privileged_callers_too() {
        let policy = ContentPolicy::standard();
        assert_matches!(
            policy.screen(&["portrait of a child"], true),
            Err(PolicyError::ContentBlocked(ContentCategory::Minors))
        );
    }

    #[test]
    fn gated_terms_require_privilege() {
        let policy = ContentPolicy::standard();
        assert_matches!(
            policy.screen(&["nude figure study"], false),
            Err(PolicyError::UpgradeRequired(ContentCategory::AdultNsfw))
        );
        assert!(policy.screen(&["nude figure study"], true).is_ok());
    }

    #[test]
    fn negative_field_is_screened() {
        let policy = ContentPolicy::standard();
        assert!(policy.screen(&["a lighthouse", "underage"], true).is_err());
    }

    #[test]
    fn blocked_beats_gated_across_fields() {
        let policy = ContentPolicy::standard();
        assert_matches!(
            policy.screen(&["nude", "loli"], false),
            Err(PolicyError::ContentBlocked(_))
        );
    }

    #[test]
    fn terms_are_anchored_at_word_start() {
        let policy = ContentPolicy::standard();
        assert_eq!(policy.classify("skid marks on wet asphalt"), None);
        assert_eq!(policy.classify("scripted scene"), None);
        assert_eq!(policy.classify("a kid, smiling"), Some(ContentCategory::Minors));
    }

    #[test]
    fn inflected_forms_are_caught() {
        let policy = ContentPolicy::standard();
        for prompt in ["two kids playing", "minors at school", "lolis"] {
            assert_matches!(
                policy.screen(&[prompt], true),
                Err(PolicyError::ContentBlocked(ContentCategory::Minors)),
                "{prompt}"
            );
        }
        assert_matches!(
            policy.screen(&["nudes of a model"], false),
            Err(PolicyError::UpgradeRequired(ContentCategory::AdultNsfw))
        );
    }

    #[test]
    fn obfuscated_spellings_are_caught() {
        let policy = ContentPolicy::standard();
        assert_eq!(policy.classify("Ｎｕｄｅ"), Some(ContentCategory::AdultNsfw));
        assert_eq!(policy.classify("bare   BREASTS"), Some(ContentCategory::AdultNsfw));
        assert_eq!(policy.classify("lo\u{200C}li"), Some(ContentCategory::Minors));
    }

    #[test]
    fn clean_prompts_pass() {
        let policy = ContentPolicy::standard();
        assert!(policy
            .screen(&["a red fox in the snow", "blurry"], false)
            .is_ok());
    }
}
