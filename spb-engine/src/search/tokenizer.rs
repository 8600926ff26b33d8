//! Query and field tokenization

/// Lowercase and split on anything that is not alphanumeric
///
/// `"Public-Safety: 2024 Budget"` → `["public", "safety", "2024", "budget"]`
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_splits_and_lowercases() {
        assert_eq!(
            tokenize("Public-Safety: 2024 Budget"),
            vec!["public", "safety", "2024", "budget"]
        );
        assert_eq!(tokenize("public_safety"), vec!["public", "safety"]);
    }

    #[test]
    fn test_tokenize_empty_and_punctuation() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("  --  ?! ").is_empty());
    }
}
