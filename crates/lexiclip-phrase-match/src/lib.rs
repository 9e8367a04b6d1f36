//! Variation-tolerant phrase matching over a caption list, plus expansion to
//! the nearest enclosing sentence boundary.

use lexiclip_caption_parser::Cue;
use regex::Regex;
use std::collections::BTreeSet;

/// Trailing-padding added to the detected end time to catch a sentence's
/// final consonant/breath before the next speaker turn.
pub const BOUNDARY_TRAILING_PADDING_SECS: f64 = 2.0;

#[derive(Debug, Clone, PartialEq)]
pub struct MatchedBoundary {
    pub start_time: f64,
    pub end_time: f64,
    pub caption: String,
}

/// Morphological variations of a single token: the bare token plus a handful
/// of common English suffix transforms. Variations are deduplicated.
pub fn token_variations(token: &str) -> BTreeSet<String> {
    let token = token.to_lowercase();
    let mut variations = BTreeSet::new();
    variations.insert(token.clone());

    if let Some(stem) = token.strip_suffix('e') {
        variations.insert(format!("{stem}ing"));
        variations.insert(format!("{token}d"));
    } else if token.ends_with('t') {
        variations.insert(format!("{token}ion"));
        variations.insert(format!("{token}ed"));
        variations.insert(format!("{token}ing"));
    } else if let Some(stem) = token.strip_suffix("ion") {
        variations.insert(stem.to_string());
        variations.insert(format!("{stem}ing"));
    } else {
        variations.insert(format!("{token}ed"));
        variations.insert(format!("{token}ing"));
        variations.insert(format!("{token}s"));
    }

    variations
}

/// Does `text` contain any variation of `token` at a word boundary?
fn contains_variation(text_lower: &str, token: &str) -> bool {
    token_variations(token).iter().any(|variant| {
        let escaped = regex::escape(variant);
        Regex::new(&format!(r"\b{escaped}\w*\b"))
            .map(|re| re.is_match(text_lower))
            .unwrap_or(false)
    })
}

/// Pass 1: exact word-boundary (word queries) or substring (sentence
/// queries) match, first index only.
fn match_exact(canonical: &str, is_word: bool, captions: &[Cue]) -> Option<usize> {
    let escaped = regex::escape(canonical);
    let pattern = if is_word {
        Regex::new(&format!(r"\b{escaped}\b")).ok()?
    } else {
        Regex::new(&escaped).ok()?
    };

    captions
        .iter()
        .position(|cue| pattern.is_match(&cue.text.to_lowercase()))
}

/// Pass 2 (sentence only): concatenate windows of 3 consecutive segments and
/// require every token of the canonical phrase (with variations) to appear
/// somewhere in the window.
fn match_fuzzy_window(canonical: &str, captions: &[Cue]) -> Option<usize> {
    let tokens: Vec<&str> = canonical.split_whitespace().collect();
    if tokens.is_empty() {
        return None;
    }

    for start in 0..captions.len() {
        let window_end = (start + 3).min(captions.len());
        let window_text: String = captions[start..window_end]
            .iter()
            .map(|c| c.text.to_lowercase())
            .collect::<Vec<_>>()
            .join(" ");

        if tokens.iter().all(|t| contains_variation(&window_text, t)) {
            return Some(start);
        }
    }
    None
}

/// Pass 3 (word only): first segment whose text loosely contains the
/// canonical word as a substring.
fn match_loose_substring(canonical: &str, captions: &[Cue]) -> Option<usize> {
    captions
        .iter()
        .position(|cue| cue.text.to_lowercase().contains(canonical))
}

/// Locate the canonical phrase in `captions`, trying exact match, then (for
/// sentences) the fuzzy windowed match, then (for words) the loose substring
/// match. Returns `None` if nothing matches any pass.
pub fn find_match(canonical: &str, is_word: bool, captions: &[Cue]) -> Option<usize> {
    if let Some(idx) = match_exact(canonical, is_word, captions) {
        return Some(idx);
    }
    if !is_word {
        if let Some(idx) = match_fuzzy_window(canonical, captions) {
            return Some(idx);
        }
    }
    if is_word {
        if let Some(idx) = match_loose_substring(canonical, captions) {
            return Some(idx);
        }
    }
    None
}

fn ends_sentence(text: &str) -> bool {
    text.trim()
        .chars()
        .last()
        .is_some_and(|c| matches!(c, '.' | '!' | '?'))
}

/// Expand a match at index `m` to the nearest enclosing sentence boundary.
/// Scans backward for the previous sentence-ending segment (start = the
/// segment after it, or 0) and forward for the next sentence-ending segment
/// (inclusive, or the last segment). The returned interval always contains
/// the matched segment's time range, and `caption` always contains the
/// matched segment's text as a substring.
pub fn detect_boundary(match_index: usize, captions: &[Cue]) -> Option<MatchedBoundary> {
    let matched = captions.get(match_index)?;

    let mut start = 0;
    for i in (0..match_index).rev() {
        if ends_sentence(&captions[i].text) {
            start = i + 1;
            break;
        }
    }

    let mut end = captions.len() - 1;
    for (i, cue) in captions.iter().enumerate().skip(match_index) {
        if ends_sentence(&cue.text) {
            end = i;
            break;
        }
    }

    let start_cue = &captions[start];
    let end_cue = &captions[end];

    let caption = captions[start..=end]
        .iter()
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string();

    debug_assert!(caption.contains(matched.text.trim()));

    Some(MatchedBoundary {
        start_time: start_cue.start,
        end_time: end_cue.start + end_cue.duration + BOUNDARY_TRAILING_PADDING_SECS,
        caption,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cue(text: &str, start: f64, duration: f64) -> Cue {
        Cue {
            text: text.to_string(),
            start,
            duration,
        }
    }

    #[test]
    fn variations_cover_ing_and_past_tense_for_e_stems() {
        let v = token_variations("code");
        assert!(v.contains("coding"));
        assert!(v.contains("coded"));
    }

    #[test]
    fn exact_word_match_respects_boundaries() {
        let captions = vec![cue("a cat sat", 0.0, 1.0), cue("catalog entry", 1.0, 1.0)];
        let idx = match_exact("cat", true, &captions);
        assert_eq!(idx, Some(0));
    }

    #[test]
    fn sentence_fuzzy_window_matches_across_segments() {
        let captions = vec![
            cue("python is a", 0.0, 1.0),
            cue("high level", 1.0, 1.0),
            cue("programming language.", 2.0, 1.0),
        ];
        let idx = find_match("python is a high level programming language", false, &captions);
        assert_eq!(idx, Some(0));
    }

    #[test]
    fn boundary_contains_match_and_pads_end() {
        let captions = vec![
            cue("Before sentence.", 0.0, 1.0),
            cue("Python is a high-level", 1.0, 1.0),
            cue("programming language.", 2.0, 1.0),
            cue("After sentence.", 3.0, 1.0),
        ];
        let boundary = detect_boundary(1, &captions).unwrap();
        assert_eq!(boundary.start_time, 1.0);
        assert_eq!(boundary.end_time, 2.0 + 1.0 + BOUNDARY_TRAILING_PADDING_SECS);
        assert!(boundary.caption.contains("Python is a high-level"));
        assert!(!boundary.caption.contains("Before sentence"));
        assert!(!boundary.caption.contains("After sentence"));
    }

    #[test]
    fn boundary_falls_back_to_start_of_transcript() {
        let captions = vec![cue("no punctuation here", 0.0, 1.0), cue("still going.", 1.0, 1.0)];
        let boundary = detect_boundary(1, &captions).unwrap();
        assert_eq!(boundary.start_time, 0.0);
    }

    #[test]
    fn boundary_falls_back_to_end_of_transcript() {
        let captions = vec![cue("starts.", 0.0, 1.0), cue("never ends", 1.0, 1.0)];
        let boundary = detect_boundary(1, &captions).unwrap();
        assert_eq!(boundary.end_time, 1.0 + 1.0 + BOUNDARY_TRAILING_PADDING_SECS);
    }
}
