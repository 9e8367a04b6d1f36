//! Deterministic, collision-resistant fingerprints over ordered tuples of
//! canonical strings. Same tuple in, same fingerprint out; the primary key of
//! both the Result Store and the Analysis Cache.

use sha2::{Digest, Sha256};

/// Opaque fixed-width digest, hex-encoded for storage/transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single query's fingerprint: the hash of its canonical form alone.
pub fn fingerprint_query(canonical: &str) -> Fingerprint {
    fingerprint(&[canonical])
}

/// An analysis request's fingerprint: sentence, target word, target language,
/// native language, before-context, after-context — in that exact order, each
/// trimmed and lowercased by the caller; missing contexts pass `""`.
pub fn fingerprint_analysis(
    sentence: &str,
    target_word: &str,
    target_language: &str,
    native_language: &str,
    context_before: &str,
    context_after: &str,
) -> Fingerprint {
    fingerprint(&[
        sentence,
        target_word,
        target_language,
        native_language,
        context_before,
        context_after,
    ])
}

/// Hash an ordered tuple of fields, each field trimmed/lowercased by the
/// caller. Fields are delimited with a byte that cannot appear inside a field
/// once trimmed/lowercased is applied upstream, so distinct tuples cannot
/// collide by re-segmenting the concatenation.
fn fingerprint(fields: &[&str]) -> Fingerprint {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(field.as_bytes());
        hasher.update([0x1f]); // unit separator
    }
    let digest = hasher.finalize();
    Fingerprint(hex_encode(&digest))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_input_same_fingerprint() {
        assert_eq!(fingerprint_query("hello"), fingerprint_query("hello"));
    }

    #[test]
    fn different_input_different_fingerprint() {
        assert_ne!(fingerprint_query("hello"), fingerprint_query("hellp"));
    }

    #[test]
    fn field_order_matters() {
        let a = fingerprint_analysis("s", "w", "en", "fr", "", "");
        let b = fingerprint_analysis("w", "s", "en", "fr", "", "");
        assert_ne!(a, b);
    }

    #[test]
    fn delimiter_prevents_resegmentation_collisions() {
        let a = fingerprint(&["ab", "c"]);
        let b = fingerprint(&["a", "bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn missing_context_is_empty_string() {
        let with_empty = fingerprint_analysis("s", "w", "en", "fr", "", "after");
        let explicit = fingerprint_analysis("s", "w", "en", "fr", "", "after");
        assert_eq!(with_empty, explicit);
    }

    #[quickcheck_macros::quickcheck]
    fn determinism(a: String, b: String) -> bool {
        fingerprint_query(&a) == fingerprint_query(&a) && {
            if a == b {
                fingerprint_query(&a) == fingerprint_query(&b)
            } else {
                fingerprint_query(&a) != fingerprint_query(&b)
            }
        }
    }
}
