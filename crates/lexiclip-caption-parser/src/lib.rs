//! Parses WEBVTT-like timed-caption text into an ordered list of cues, and
//! stitches together per-chunk transcriptions by shifting each chunk's cues
//! by its offset into the full audio.

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct Cue {
    pub text: String,
    pub start: f64,
    pub duration: f64,
}

#[derive(Debug, Error)]
pub enum CaptionParseError {
    #[error("malformed cue timing line: {0}")]
    BadTiming(String),
}

static TIMING_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(\d{1,2}:)?(\d{2}):(\d{2})[.,](\d{3})\s*-->\s*(\d{1,2}:)?(\d{2}):(\d{2})[.,](\d{3})",
    )
    .unwrap()
});

fn parse_timestamp(hours: Option<&str>, minutes: &str, seconds: &str, millis: &str) -> f64 {
    let hours: f64 = hours
        .map(|h| h.trim_end_matches(':').parse().unwrap_or(0.0))
        .unwrap_or(0.0);
    let minutes: f64 = minutes.parse().unwrap_or(0.0);
    let seconds: f64 = seconds.parse().unwrap_or(0.0);
    let millis: f64 = millis.parse().unwrap_or(0.0);
    hours * 3600.0 + minutes * 60.0 + seconds + millis / 1000.0
}

/// Parse a WEBVTT(-like) document into an ordered cue list. Lines before the
/// `WEBVTT` header, blank lines, and `NOTE` blocks are ignored. Cues whose
/// joined text is empty after trimming are dropped.
pub fn parse(input: &str) -> Result<Vec<Cue>, CaptionParseError> {
    let mut cues = Vec::new();
    let mut lines = input.lines().peekable();

    // Skip everything up to and including the WEBVTT header, if present.
    while let Some(&line) = lines.peek() {
        if line.trim().starts_with("WEBVTT") {
            lines.next();
            break;
        }
        if line.trim().is_empty() {
            lines.next();
            continue;
        }
        // No WEBVTT header at all: treat the whole input as cue blocks.
        break;
    }

    let mut pending: Vec<&str> = Vec::new();
    let flush = |pending: &mut Vec<&str>, cues: &mut Vec<Cue>| -> Result<(), CaptionParseError> {
        if pending.is_empty() {
            return Ok(());
        }
        let block = std::mem::take(pending);
        parse_block(&block, cues)?;
        Ok(())
    };

    for line in lines {
        if line.trim().is_empty() {
            flush(&mut pending, &mut cues)?;
            continue;
        }
        pending.push(line);
    }
    flush(&mut pending, &mut cues)?;

    Ok(cues)
}

fn parse_block(block: &[&str], cues: &mut Vec<Cue>) -> Result<(), CaptionParseError> {
    if block.first().is_some_and(|l| l.trim_start().starts_with("NOTE")) {
        return Ok(());
    }

    // An optional cue-identifier line precedes the timing line.
    let mut idx = 0;
    if idx < block.len() && !TIMING_LINE.is_match(block[idx]) {
        idx += 1;
    }
    let Some(timing_line) = block.get(idx) else {
        return Ok(());
    };
    let Some(caps) = TIMING_LINE.captures(timing_line) else {
        return Ok(());
    };

    let start = parse_timestamp(
        caps.get(1).map(|m| m.as_str()),
        &caps[2],
        &caps[3],
        &caps[4],
    );
    let end = parse_timestamp(
        caps.get(5).map(|m| m.as_str()),
        &caps[6],
        &caps[7],
        &caps[8],
    );

    if end < start {
        return Err(CaptionParseError::BadTiming(timing_line.to_string()));
    }

    let text = block[idx + 1..].join(" ");
    let text = text.trim().to_string();
    if text.is_empty() {
        return Ok(());
    }

    cues.push(Cue {
        text,
        start,
        duration: end - start,
    });
    Ok(())
}

/// Shift every cue in a chunk's caption list by `chunk_index * chunk_duration`
/// seconds, then concatenate chunks in order. Used to stitch the per-30s-chunk
/// transcriptions produced during the job pipeline's chunked transcription.
pub fn merge_chunks(chunks: Vec<Vec<Cue>>, chunk_duration_secs: f64) -> Vec<Cue> {
    let mut merged = Vec::new();
    for (index, chunk_cues) in chunks.into_iter().enumerate() {
        let offset = index as f64 * chunk_duration_secs;
        merged.extend(chunk_cues.into_iter().map(|cue| Cue {
            start: cue.start + offset,
            ..cue
        }));
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "WEBVTT\n\n1\n00:00:01.000 --> 00:00:03.500\nHello world.\n\n2\n00:00:03.500 --> 00:00:05.000\nThis is\na test.\n\nNOTE this is a comment\nnot a cue\n\n3\n00:00:05.000 --> 00:00:06.000\n   \n";

    #[test]
    fn parses_basic_cues() {
        let cues = parse(SAMPLE).unwrap();
        assert_eq!(cues.len(), 2);
        assert_eq!(cues[0].text, "Hello world.");
        assert_eq!(cues[0].start, 1.0);
        assert_eq!(cues[0].duration, 2.5);
    }

    #[test]
    fn joins_multiline_cue_text_with_spaces() {
        let cues = parse(SAMPLE).unwrap();
        assert_eq!(cues[1].text, "This is a test.");
    }

    #[test]
    fn drops_empty_cues() {
        let cues = parse(SAMPLE).unwrap();
        assert!(cues.iter().all(|c| !c.text.trim().is_empty()));
    }

    #[test]
    fn ignores_note_blocks() {
        let cues = parse(SAMPLE).unwrap();
        assert!(cues.iter().all(|c| c.text != "not a cue"));
    }

    #[test]
    fn accepts_mm_ss_timestamps_without_hours() {
        let cues = parse("WEBVTT\n\n00:01.000 --> 00:02.000\nhi\n").unwrap();
        assert_eq!(cues[0].start, 1.0);
        assert_eq!(cues[0].duration, 1.0);
    }

    #[test]
    fn accepts_hh_mm_ss_timestamps() {
        let cues = parse("WEBVTT\n\n01:00:01.000 --> 01:00:02.000\nhi\n").unwrap();
        assert_eq!(cues[0].start, 3601.0);
    }

    #[test]
    fn merges_chunk_offsets() {
        let chunk0 = vec![Cue {
            text: "a".into(),
            start: 1.0,
            duration: 1.0,
        }];
        let chunk1 = vec![Cue {
            text: "b".into(),
            start: 0.5,
            duration: 1.0,
        }];
        let merged = merge_chunks(vec![chunk0, chunk1], 30.0);
        assert_eq!(merged[0].start, 1.0);
        assert_eq!(merged[1].start, 30.5);
    }
}
