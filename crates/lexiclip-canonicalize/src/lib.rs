//! Trims, lowercases and classifies a raw user query into the canonical form
//! every downstream component (fingerprinting, matching, caching) keys off of.

use thiserror::Error;

const MAX_LEN: usize = 200;
const SENTENCE_PUNCTUATION: [char; 6] = ['.', ',', '!', '?', ';', ':'];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CanonicalizeError {
    #[error("query must not be empty")]
    Empty,
    #[error("query must be at most {MAX_LEN} characters, got {0}")]
    TooLong(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Word,
    Sentence,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalQuery {
    pub canonical: String,
    pub kind: QueryKind,
}

/// Trim outer whitespace, lowercase, reject empty/over-length input, then
/// classify as `word` or `sentence`.
pub fn canonicalize(raw: &str) -> Result<CanonicalQuery, CanonicalizeError> {
    let canonical = raw.trim().to_lowercase();

    if canonical.is_empty() {
        return Err(CanonicalizeError::Empty);
    }
    if canonical.chars().count() > MAX_LEN {
        return Err(CanonicalizeError::TooLong(canonical.chars().count()));
    }

    let kind = if canonical.chars().any(|c| c.is_whitespace() || SENTENCE_PUNCTUATION.contains(&c))
    {
        QueryKind::Sentence
    } else {
        QueryKind::Word
    };

    Ok(CanonicalQuery { canonical, kind })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_and_lowercases() {
        let q = canonicalize("  HELLO  ").unwrap();
        assert_eq!(q.canonical, "hello");
        assert_eq!(q.kind, QueryKind::Word);
    }

    #[test]
    fn whitespace_makes_it_a_sentence() {
        let q = canonicalize("hello world").unwrap();
        assert_eq!(q.kind, QueryKind::Sentence);
    }

    #[test]
    fn terminal_punctuation_makes_it_a_sentence() {
        let q = canonicalize("wow!").unwrap();
        assert_eq!(q.kind, QueryKind::Sentence);
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(canonicalize("   "), Err(CanonicalizeError::Empty));
    }

    #[test]
    fn rejects_too_long() {
        let raw = "a".repeat(201);
        assert!(matches!(
            canonicalize(&raw),
            Err(CanonicalizeError::TooLong(201))
        ));
    }

    #[test]
    fn accepts_exactly_200() {
        let raw = "a".repeat(200);
        assert!(canonicalize(&raw).is_ok());
    }

    #[quickcheck_macros::quickcheck]
    fn idempotent(raw: String) -> bool {
        match canonicalize(&raw) {
            Err(_) => true,
            Ok(first) => match canonicalize(&first.canonical) {
                Ok(second) => second == first,
                Err(_) => false,
            },
        }
    }
}
