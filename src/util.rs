//! Text measurement helpers for goal tracking.

use regex::Regex;
use std::sync::OnceLock;

/// Whitespace-delimited word count.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

fn chapter_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?mi)^(#{1,3}\s+.+|chapter\s+\d+)").expect("valid regex"))
}

/// Count section headers: markdown `#`/`##`/`###` headings and
/// `Chapter N` lines.
pub fn chapter_count(text: &str) -> usize {
    chapter_regex().find_iter(text).count()
}

/// Count standalone scene markers (`***` or `---` separator lines).
/// A body with content but no separators counts as a single scene.
pub fn scene_count(text: &str) -> usize {
    let separators = text
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            trimmed == "***" || trimmed == "---"
        })
        .count();
    if separators == 0 && !text.trim().is_empty() {
        1
    } else if separators > 0 {
        separators + 1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_count() {
        assert_eq!(word_count(""), 0);
        assert_eq!(word_count("one"), 1);
        assert_eq!(word_count("  two   words \n here "), 3);
    }

    #[test]
    fn test_chapter_count_markdown_headers() {
        let text = "# Title\n\nbody\n\n## Section\n\nmore\n\n### Sub\n";
        assert_eq!(chapter_count(text), 3);
    }

    #[test]
    fn test_chapter_count_chapter_lines() {
        let text = "Chapter 1\n\ntext\n\nchapter 2\n\ntext";
        assert_eq!(chapter_count(text), 2);
    }

    #[test]
    fn test_scene_count() {
        assert_eq!(scene_count(""), 0);
        assert_eq!(scene_count("one scene, no separators"), 1);
        assert_eq!(scene_count("scene a\n***\nscene b\n***\nscene c"), 3);
    }
}
