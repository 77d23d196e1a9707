use crate::models::{ReasoningSegment, ReasoningState};

/// Inline reasoning marker pairs, matched as (open, close).
const MARKERS: &[(&str, &str)] = &[
    ("<think>", "</think>"),
    ("<thinking>", "</thinking>"),
    ("<thought>", "</thought>"),
];

/// Visible text and reasoning segments split out of raw model output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReasoningExtraction {
    pub visible: String,
    pub segments: Vec<ReasoningSegment>,
}

impl ReasoningExtraction {
    /// All reasoning joined with blank lines.
    pub fn reasoning_text(&self) -> String {
        self.segments
            .iter()
            .map(|segment| segment.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// State of the most recent segment, if any.
    pub fn state(&self) -> Option<ReasoningState> {
        self.segments.last().map(|segment| segment.state)
    }
}

/// Split `<think>`-style reasoning out of `raw`, scanning left to right.
///
/// Text outside markers is visible. Text between an open marker and its close
/// marker is a finished segment. An open marker with no close marker yet turns
/// the rest of the buffer into a segment that is still streaming.
pub fn extract_reasoning(raw: &str) -> ReasoningExtraction {
    extract(raw, false)
}

/// Like [`extract_reasoning`] for a buffer that is still growing.
///
/// A trailing fragment that could be the start of an open marker (`"<thi"`)
/// is held back from the visible text until more input decides it.
pub fn extract_streaming_reasoning(raw: &str) -> ReasoningExtraction {
    extract(raw, true)
}

fn extract(raw: &str, hold_partial_marker: bool) -> ReasoningExtraction {
    let mut extraction = ReasoningExtraction::default();
    let mut remaining = raw;

    while !remaining.is_empty() {
        let earliest = MARKERS
            .iter()
            .filter_map(|(open, close)| remaining.find(open).map(|idx| (idx, *open, *close)))
            .min_by_key(|(idx, _, _)| *idx);

        let Some((start_idx, open, close)) = earliest else {
            let held = if hold_partial_marker {
                partial_open_marker_len(remaining)
            } else {
                0
            };
            extraction
                .visible
                .push_str(&remaining[..remaining.len() - held]);
            break;
        };

        extraction.visible.push_str(&remaining[..start_idx]);

        let after_open = &remaining[start_idx + open.len()..];
        match after_open.find(close) {
            Some(end_idx) => {
                push_segment(
                    &mut extraction,
                    &after_open[..end_idx],
                    ReasoningState::Done,
                );
                remaining = &after_open[end_idx + close.len()..];
            }
            None => {
                push_segment(&mut extraction, after_open, ReasoningState::Streaming);
                break;
            }
        }
    }

    if !extraction.segments.is_empty() {
        extraction.visible = extraction.visible.trim_start().to_string();
    }

    extraction
}

/// Length of the longest suffix of `text` that is a proper prefix of an open marker.
fn partial_open_marker_len(text: &str) -> usize {
    MARKERS
        .iter()
        .filter_map(|(open, _)| (1..open.len()).rev().find(|&n| text.ends_with(&open[..n])))
        .max()
        .unwrap_or(0)
}

fn push_segment(extraction: &mut ReasoningExtraction, text: &str, state: ReasoningState) {
    let text = text.trim();
    // A streaming segment is kept even when empty so callers can show that
    // reasoning has started.
    if text.is_empty() && state == ReasoningState::Done {
        return;
    }
    extraction.segments.push(ReasoningSegment {
        text: text.to_string(),
        state,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_block() {
        let result = extract_reasoning("<think>reason</think>answer");
        assert_eq!(result.reasoning_text(), "reason");
        assert_eq!(result.visible, "answer");
        assert_eq!(result.state(), Some(ReasoningState::Done));
    }

    #[test]
    fn test_unclosed_block_is_streaming() {
        let result = extract_reasoning("<think>partial");
        assert_eq!(result.reasoning_text(), "partial");
        assert_eq!(result.visible, "");
        assert_eq!(result.state(), Some(ReasoningState::Streaming));
    }

    #[test]
    fn test_just_opened_block() {
        let result = extract_reasoning("<think>");
        assert_eq!(result.visible, "");
        assert_eq!(result.segments, vec![ReasoningSegment::streaming("")]);
    }

    #[test]
    fn test_no_markers() {
        let result = extract_reasoning("plain answer");
        assert_eq!(result.visible, "plain answer");
        assert!(result.segments.is_empty());
        assert_eq!(result.state(), None);
    }

    #[test]
    fn test_multiple_pairs_and_text_before() {
        let result =
            extract_reasoning("Intro <think>first</think> middle <thought>second</thought> end");
        assert_eq!(result.visible, "Intro  middle  end");
        assert_eq!(
            result.segments,
            vec![
                ReasoningSegment::done("first"),
                ReasoningSegment::done("second")
            ]
        );
    }

    #[test]
    fn test_close_marker_must_match_open() {
        let result = extract_reasoning("<thinking>a</think>b</thinking>answer");
        assert_eq!(result.reasoning_text(), "a</think>b");
        assert_eq!(result.visible, "answer");
    }

    #[test]
    fn test_streaming_holds_back_partial_open_marker() {
        assert_eq!(extract_streaming_reasoning("Hi <thi").visible, "Hi ");
        assert_eq!(extract_streaming_reasoning("Hi <").visible, "Hi ");
        assert_eq!(extract_streaming_reasoning("a < b").visible, "a < b");

        let completed = extract_streaming_reasoning("Hi <think>r</think>ok");
        assert_eq!(completed.visible, "Hi ok");
        assert_eq!(completed.reasoning_text(), "r");

        // Finished text keeps a trailing fragment
        assert_eq!(extract_reasoning("Hi <thi").visible, "Hi <thi");
    }

    #[test]
    fn test_second_block_still_streaming() {
        let result = extract_reasoning("<think>one</think>\n\nHi <think>two");
        assert_eq!(result.visible, "Hi ");
        assert_eq!(result.segments.len(), 2);
        assert_eq!(result.state(), Some(ReasoningState::Streaming));
    }
}
