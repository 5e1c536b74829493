//! OCR text normalization and fuzzy comparison

use strsim::normalized_levenshtein;

/// Normalize raw OCR output.
///
/// Whitespace runs collapse to one space, blank lines are dropped and, for
/// `single_line` fields, lines are joined with a space. Results shorter than
/// `min_chars` characters are treated as noise and return an empty string.
pub fn cleanup_text(raw: &str, single_line: bool, min_chars: usize) -> String {
    let lines: Vec<String> = raw
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect();

    let text = if single_line {
        lines.join(" ")
    } else {
        lines.join("\n")
    };

    if text.chars().count() < min_chars {
        return String::new();
    }
    text
}

/// Similarity of two OCR strings in `[0, 1]`.
///
/// Case-insensitive normalized Levenshtein, also compared with punctuation
/// removed since OCR often drops or invents dots and commas; the better score
/// wins.
pub fn text_similarity(a: &str, b: &str) -> f32 {
    let a_normalized = a.trim().to_lowercase();
    let b_normalized = b.trim().to_lowercase();

    if a_normalized.is_empty() && b_normalized.is_empty() {
        return 1.0;
    }
    if a_normalized.is_empty() || b_normalized.is_empty() {
        return 0.0;
    }

    let base_similarity = normalized_levenshtein(&a_normalized, &b_normalized) as f32;

    let a_no_punct: String = a_normalized.chars().filter(|c| c.is_alphanumeric()).collect();
    let b_no_punct: String = b_normalized.chars().filter(|c| c.is_alphanumeric()).collect();

    let punct_similarity = if !a_no_punct.is_empty() && !b_no_punct.is_empty() {
        normalized_levenshtein(&a_no_punct, &b_no_punct) as f32
    } else {
        0.0
    };

    base_similarity.max(punct_similarity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_collapses_whitespace() {
        assert_eq!(cleanup_text("  Hello   world \n", true, 3), "Hello world");
        assert_eq!(
            cleanup_text("line one\n\n   line   two  ", false, 3),
            "line one\nline two"
        );
        assert_eq!(cleanup_text("line one\nline two", true, 3), "line one line two");
    }

    #[test]
    fn test_cleanup_drops_short_noise() {
        assert_eq!(cleanup_text(" a \n", true, 3), "");
        assert_eq!(cleanup_text("ab", true, 3), "");
        assert_eq!(cleanup_text("abc", true, 3), "abc");
        assert_eq!(cleanup_text("", false, 0), "");
    }

    #[test]
    fn test_cleanup_counts_characters_not_bytes() {
        // Two CJK characters are six bytes
        assert_eq!(cleanup_text("転生", true, 3), "");
        assert_eq!(cleanup_text("転生した", true, 3), "転生した");
    }

    #[test]
    fn test_similarity_identical_and_empty() {
        assert_eq!(text_similarity("Title", "title"), 1.0);
        assert_eq!(text_similarity("", ""), 1.0);
        assert_eq!(text_similarity("abc", ""), 0.0);
    }

    #[test]
    fn test_similarity_single_substitution() {
        let sim = text_similarity("転生したらスライムだった件", "転生したらスライムだつた件");
        assert!(sim > 0.9 && sim < 1.0, "similarity was {sim}");
    }

    #[test]
    fn test_similarity_ignores_punctuation() {
        assert_eq!(text_similarity("Vol. 4.5", "Vol 45"), 1.0);
    }

    #[test]
    fn test_similarity_unrelated() {
        assert!(text_similarity("The Hobbit", "Dune Messiah") < 0.5);
    }
}
