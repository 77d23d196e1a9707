use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Deserialize;
use tracing::{debug, warn};

use super::generation_gateway::ByteStream;
use crate::error::{SyncError, SyncResult};
use crate::models::FinishMetadata;
use crate::repositories::RepositoryResult;

/// Everything decoded from one transport chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedFrame {
    pub text_delta: Option<String>,
    pub reasoning_delta: Option<String>,
    pub reasoning_started: bool,
    pub reasoning_ended: bool,
    pub finish: Option<FinishMetadata>,
    pub error: Option<String>,
}

impl DecodedFrame {
    pub fn is_empty(&self) -> bool {
        *self == DecodedFrame::default()
    }
}

/// One newline-delimited event record from the generation endpoint.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
enum StreamRecord {
    TextDelta {
        #[serde(alias = "text", alias = "textDelta")]
        delta: String,
    },
    ReasoningStart {
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(alias = "reasoning")]
    ReasoningDelta {
        #[serde(alias = "text")]
        delta: String,
    },
    ReasoningEnd {
        #[serde(default)]
        id: Option<String>,
    },
    Finish(FinishMetadata),
    Error {
        #[serde(alias = "message", alias = "errorText")]
        error: String,
    },
    #[serde(other)]
    Unknown,
}

/// Incremental decoder for one streaming session.
///
/// Chunks may split a record anywhere, including inside a multi-byte character;
/// the incomplete tail is held back until the next chunk completes it.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: Vec<u8>,
    finish_seen: bool,
    dropped_records: usize,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one transport chunk.
    pub fn decode(&mut self, chunk: &[u8]) -> DecodedFrame {
        self.pending.extend_from_slice(chunk);

        let mut frame = DecodedFrame::default();
        while let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            self.consume_line(&line[..newline], &mut frame);
        }
        frame
    }

    /// Flush a final record that arrived without a trailing newline.
    pub fn finish(&mut self) -> DecodedFrame {
        let mut frame = DecodedFrame::default();
        let rest = std::mem::take(&mut self.pending);
        if !rest.is_empty() {
            self.consume_line(&rest, &mut frame);
        }
        frame
    }

    /// Number of records dropped because they failed to parse.
    pub fn dropped_records(&self) -> usize {
        self.dropped_records
    }

    fn consume_line(&mut self, line: &[u8], frame: &mut DecodedFrame) {
        match parse_line(line) {
            Ok(Some(record)) => self.fold(record, frame),
            Ok(None) => {}
            Err(e) => {
                self.dropped_records += 1;
                warn!(error = %e, "Dropping stream record");
            }
        }
    }

    fn fold(&mut self, record: StreamRecord, frame: &mut DecodedFrame) {
        match record {
            StreamRecord::TextDelta { delta } => {
                frame.text_delta.get_or_insert_with(String::new).push_str(&delta);
            }
            StreamRecord::ReasoningStart { .. } => frame.reasoning_started = true,
            StreamRecord::ReasoningDelta { delta } => {
                frame
                    .reasoning_delta
                    .get_or_insert_with(String::new)
                    .push_str(&delta);
            }
            StreamRecord::ReasoningEnd { .. } => frame.reasoning_ended = true,
            StreamRecord::Finish(finish) => {
                if self.finish_seen {
                    debug!("Ignoring repeated finish record");
                } else {
                    self.finish_seen = true;
                    frame.finish = Some(finish);
                }
            }
            StreamRecord::Error { error } => frame.error = Some(error),
            StreamRecord::Unknown => {}
        }
    }
}

/// Parse a single line. `Ok(None)` means the line carries no event
/// (blank line, SSE comment or field, `[DONE]` sentinel).
fn parse_line(line: &[u8]) -> SyncResult<Option<StreamRecord>> {
    let text = std::str::from_utf8(line).map_err(|e| SyncError::StreamParse {
        message: e.to_string(),
    })?;
    let mut text = text.trim();

    if let Some(data) = text.strip_prefix("data:") {
        text = data.trim();
    } else if text.starts_with(':')
        || text.starts_with("event:")
        || text.starts_with("id:")
        || text.starts_with("retry:")
    {
        return Ok(None);
    }

    if text.is_empty() || text == "[DONE]" {
        return Ok(None);
    }

    serde_json::from_str(text)
        .map(Some)
        .map_err(|e| SyncError::StreamParse {
            message: format!("{e}: {text}"),
        })
}

/// Decode a transport byte stream into frames, flushing the decoder at the end.
pub fn decode_stream(mut bytes: ByteStream) -> BoxStream<'static, RepositoryResult<DecodedFrame>> {
    Box::pin(async_stream::stream! {
        let mut decoder = StreamDecoder::new();
        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    let frame = decoder.decode(&chunk);
                    if !frame.is_empty() {
                        yield Ok(frame);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
        let frame = decoder.finish();
        if !frame.is_empty() {
            yield Ok(frame);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TokenUsage;

    const TEXT_RECORD: &str = "{\"type\":\"text-delta\",\"delta\":\"héllo wörld\"}\n";

    #[test]
    fn test_decodes_text_delta() {
        let mut decoder = StreamDecoder::new();
        let frame = decoder.decode(TEXT_RECORD.as_bytes());
        assert_eq!(frame.text_delta.as_deref(), Some("héllo wörld"));
    }

    #[test]
    fn test_split_at_every_offset_matches_unsplit() {
        let bytes = TEXT_RECORD.as_bytes();
        let expected = StreamDecoder::new().decode(bytes);

        for offset in 0..=bytes.len() {
            let mut decoder = StreamDecoder::new();
            let first = decoder.decode(&bytes[..offset]);
            let second = decoder.decode(&bytes[offset..]);

            let mut combined = first.text_delta.unwrap_or_default();
            combined.push_str(&second.text_delta.unwrap_or_default());
            assert_eq!(Some(combined), expected.text_delta, "split at {offset}");
            assert_eq!(decoder.dropped_records(), 0);
        }
    }

    #[test]
    fn test_record_split_across_three_chunks() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.decode(b"{\"type\":\"text-").is_empty());
        assert!(decoder.decode(b"delta\",\"delta\":").is_empty());
        let frame = decoder.decode(b"\"abc\"}\n");
        assert_eq!(frame.text_delta.as_deref(), Some("abc"));
    }

    #[test]
    fn test_malformed_record_is_dropped() {
        let mut decoder = StreamDecoder::new();
        let frame = decoder.decode(
            b"{\"type\":\"text-delta\",\"delta\":\"a\"}\n{not json}\n{\"type\":\"text-delta\",\"delta\":\"b\"}\n",
        );
        assert_eq!(frame.text_delta.as_deref(), Some("ab"));
        assert_eq!(decoder.dropped_records(), 1);
    }

    #[test]
    fn test_sse_framing_and_done_sentinel() {
        let mut decoder = StreamDecoder::new();
        let frame = decoder.decode(
            b": keepalive\nevent: message\ndata: {\"type\":\"text-delta\",\"delta\":\"x\"}\n\ndata: [DONE]\n",
        );
        assert_eq!(frame.text_delta.as_deref(), Some("x"));
        assert_eq!(decoder.dropped_records(), 0);
    }

    #[test]
    fn test_reasoning_records() {
        let mut decoder = StreamDecoder::new();
        let frame = decoder.decode(
            b"{\"type\":\"reasoning-start\",\"id\":\"r1\"}\n{\"type\":\"reasoning-delta\",\"delta\":\"why\"}\n{\"type\":\"reasoning\",\"text\":\" not\"}\n{\"type\":\"reasoning-end\"}\n",
        );
        assert!(frame.reasoning_started);
        assert!(frame.reasoning_ended);
        assert_eq!(frame.reasoning_delta.as_deref(), Some("why not"));
        assert!(frame.text_delta.is_none());
    }

    #[test]
    fn test_finish_only_once() {
        let mut decoder = StreamDecoder::new();
        let first = decoder.decode(
            b"{\"type\":\"finish\",\"usage\":{\"inputTokens\":5,\"outputTokens\":7},\"modelId\":\"m\",\"gatewayCost\":0.01}\n",
        );
        let finish = first.finish.unwrap();
        assert_eq!(finish.usage, Some(TokenUsage::new(5, 7)));
        assert_eq!(finish.model_id.as_deref(), Some("m"));
        assert_eq!(finish.gateway_cost, Some(0.01));

        let second = decoder.decode(b"{\"type\":\"finish\"}\n");
        assert!(second.finish.is_none());
    }

    #[test]
    fn test_unknown_record_types_ignored() {
        let mut decoder = StreamDecoder::new();
        let frame = decoder.decode(b"{\"type\":\"tool-call\",\"name\":\"x\"}\n");
        assert!(frame.is_empty());
        assert_eq!(decoder.dropped_records(), 0);
    }

    #[test]
    fn test_finish_flushes_unterminated_record() {
        let mut decoder = StreamDecoder::new();
        assert!(
            decoder
                .decode(b"{\"type\":\"text-delta\",\"delta\":\"tail\"}")
                .is_empty()
        );
        let frame = decoder.finish();
        assert_eq!(frame.text_delta.as_deref(), Some("tail"));
    }

    #[test]
    fn test_error_record() {
        let mut decoder = StreamDecoder::new();
        let frame = decoder.decode(b"{\"type\":\"error\",\"message\":\"rate limited\"}\n");
        assert_eq!(frame.error.as_deref(), Some("rate limited"));
    }

    #[tokio::test]
    async fn test_decode_stream() {
        let chunks: Vec<RepositoryResult<Vec<u8>>> = vec![
            Ok(b"{\"type\":\"text-delta\",\"del".to_vec()),
            Ok(b"ta\":\"a\"}\n{\"type\":\"text-delta\",\"delta\":\"b\"}".to_vec()),
        ];
        let frames: Vec<_> = decode_stream(Box::pin(futures::stream::iter(chunks)))
            .collect()
            .await;

        let text: String = frames
            .into_iter()
            .filter_map(|frame| frame.unwrap().text_delta)
            .collect();
        assert_eq!(text, "ab");
    }
}
