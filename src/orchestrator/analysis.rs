//! Request analysis: measurable goals, quality and complexity detection.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

const QUALITY_KEYWORDS: [&str; 6] = [
    "quality",
    "polish",
    "refine",
    "perfect",
    "professional",
    "production",
];

const COMPLEXITY_KEYWORDS: [&str; 5] = ["complex", "detailed", "comprehensive", "advanced", "multi-part"];

fn words_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(\d{1,3}(?:,\d{3})+|\d+)\s*words?\b").expect("valid regex")
    })
}

fn k_words_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*k\s*words?\b").expect("valid regex"))
}

fn chapters_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d+)\s*chapters?\b").expect("valid regex"))
}

/// What the orchestrator learned from reading the request text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestProfile {
    /// Keyword classification used to key learned sequences.
    pub request_type: String,
    pub word_target: Option<usize>,
    pub chapter_target: Option<usize>,
    pub quality_required: bool,
    pub complex: bool,
}

impl RequestProfile {
    pub fn analyze(request: &str) -> Self {
        let lower = request.to_lowercase();

        // `20k words` wins over the plain form when both would match.
        let word_target = k_words_regex()
            .captures(request)
            .and_then(|c| c[1].parse::<f64>().ok())
            .map(|n| (n * 1000.0) as usize)
            .or_else(|| {
                words_regex()
                    .captures(request)
                    .and_then(|c| c[1].replace(',', "").parse::<usize>().ok())
            });

        let chapter_target = chapters_regex()
            .captures(request)
            .and_then(|c| c[1].parse::<usize>().ok());

        Self {
            request_type: classify_request(&lower),
            word_target,
            chapter_target,
            quality_required: QUALITY_KEYWORDS.iter().any(|k| lower.contains(k)),
            complex: request.len() > 500 || COMPLEXITY_KEYWORDS.iter().any(|k| lower.contains(k)),
        }
    }
}

fn classify_request(lower: &str) -> String {
    const FICTION: [&str; 5] = ["story", "novel", "fiction", "chapter", "scene"];
    const CODE: [&str; 5] = ["code", "implement", "api", "function", "library"];
    const DOCUMENT: [&str; 4] = ["report", "document", "essay", "article"];

    if FICTION.iter().any(|k| lower.contains(k)) {
        "fiction".to_string()
    } else if CODE.iter().any(|k| lower.contains(k)) {
        "code".to_string()
    } else if DOCUMENT.iter().any(|k| lower.contains(k)) {
        "document".to_string()
    } else {
        "general".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_word_targets() {
        let profile = RequestProfile::analyze("Write a 5000 words short story");
        assert_eq!(profile.word_target, Some(5000));
        assert_eq!(profile.request_type, "fiction");
    }

    #[test]
    fn parses_comma_separated_word_targets() {
        let profile = RequestProfile::analyze("Write a 20,000 word story");
        assert_eq!(profile.word_target, Some(20_000));
    }

    #[test]
    fn parses_k_word_targets() {
        let profile = RequestProfile::analyze("a polished 20k words novel");
        assert_eq!(profile.word_target, Some(20_000));
        assert!(profile.quality_required);
    }

    #[test]
    fn parses_chapter_targets() {
        let profile = RequestProfile::analyze("a novel with 12 chapters");
        assert_eq!(profile.chapter_target, Some(12));
    }

    #[test]
    fn detects_quality_and_complexity_keywords() {
        let profile = RequestProfile::analyze("a production quality comprehensive report");
        assert!(profile.quality_required);
        assert!(profile.complex);
        assert_eq!(profile.request_type, "document");
    }

    #[test]
    fn long_requests_count_as_complex() {
        let request = format!("do something with {}", "lots of context ".repeat(40));
        let profile = RequestProfile::analyze(&request);
        assert!(profile.complex);
        assert_eq!(profile.request_type, "general");
    }

    #[test]
    fn plain_request_has_no_targets() {
        let profile = RequestProfile::analyze("summarize this");
        assert_eq!(profile.word_target, None);
        assert_eq!(profile.chapter_target, None);
        assert!(!profile.quality_required);
        assert!(!profile.complex);
    }
}
