//! Text handling for item descriptions before they reach the text encoder.
//!
//! Catalog descriptions are long, noisy product titles. They are cleaned down to
//! a short phrase and expanded into a small set of prompt variants whose
//! embeddings get averaged into one feature per item.

/// Max characters of a description fed to the text encoder.
pub const MAX_TEXT_LENGTH: usize = 70;

/// Max words kept from a description when building prompts.
pub const MAX_PROMPT_WORDS: usize = 15;

/// Description of the "nothing of interest" class every crop is also compared against.
pub const BACKGROUND_PROMPT: &str = "empty shelf empty bin yellow tape wall floor";

/// Keeps ASCII letters, digits, spaces and dashes. Everything else is dropped.
pub fn clean_text(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ' || *c == '-')
        .collect()
}

/// First [`MAX_PROMPT_WORDS`] words joined by single spaces, capped at [`MAX_TEXT_LENGTH`] chars.
pub fn short_text(text: &str) -> String {
    let joined = text
        .split_whitespace()
        .take(MAX_PROMPT_WORDS)
        .collect::<Vec<_>>()
        .join(" ");
    joined.chars().take(MAX_TEXT_LENGTH).collect()
}

/// Trims and truncates a raw text to [`MAX_TEXT_LENGTH`] chars.
pub fn safe_text(text: &str) -> String {
    text.trim().chars().take(MAX_TEXT_LENGTH).collect()
}

/// The prompt variants embedded and averaged for a single description.
pub fn ensemble_prompts(description: &str) -> [String; 3] {
    let short = short_text(&clean_text(description));
    [
        format!("A photo of {short}"),
        format!("The product {short}"),
        short,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_text_drops_symbols() {
        assert_eq!(
            clean_text("Nike® Air-Max (Red), size 10!"),
            "Nike Air-Max Red size 10"
        );
        assert_eq!(clean_text("é&*"), "");
    }

    #[test]
    fn test_short_text_limits_words_and_chars() {
        let words = (1..=20).map(|i| format!("w{i}")).collect::<Vec<_>>();
        let short = short_text(&words.join("  "));
        assert_eq!(short.split(' ').count(), MAX_PROMPT_WORDS);
        assert!(short.starts_with("w1 w2 w3"));
        assert!(short.ends_with("w15"));

        let long = "abcdefghij ".repeat(10);
        let short = short_text(&long);
        assert_eq!(short.len(), MAX_TEXT_LENGTH);
    }

    #[test]
    fn test_ensemble_prompts() {
        let prompts = ensemble_prompts("  Blue  coffee mug, 12oz ");
        assert_eq!(prompts[0], "A photo of Blue coffee mug 12oz");
        assert_eq!(prompts[1], "The product Blue coffee mug 12oz");
        assert_eq!(prompts[2], "Blue coffee mug 12oz");
    }

    #[test]
    fn test_ensemble_prompts_empty_description() {
        let prompts = ensemble_prompts("!!!");
        assert_eq!(prompts[0], "A photo of ");
        assert_eq!(prompts[1], "The product ");
        assert_eq!(prompts[2], "");
    }

    #[test]
    fn test_safe_text() {
        assert_eq!(safe_text("  hello  "), "hello");
        assert_eq!(safe_text(&"x".repeat(100)).len(), MAX_TEXT_LENGTH);
    }
}
