//! Newline-delimited event reading.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::agent::AgentEvent;

/// Reads [`AgentEvent`]s from a byte stream, one JSON document per line.
///
/// Lines that are blank or fail to decode are skipped. A final line without
/// a terminating newline is still decoded. Invalid UTF-8 is replaced rather
/// than rejected.
pub struct EventReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> EventReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::with_capacity(4096),
        }
    }

    /// Next decodable event, or `None` once the stream is closed.
    pub async fn next_event(&mut self) -> std::io::Result<Option<AgentEvent>> {
        loop {
            self.buf.clear();
            let n = self.reader.read_until(b'\n', &mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            let line = String::from_utf8_lossy(&self.buf);
            if let Some(event) = AgentEvent::parse(&line) {
                return Ok(Some(event));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{ContentDelta, StreamEventBody};

    async fn collect(input: &[u8]) -> Vec<AgentEvent> {
        let mut reader = EventReader::new(input);
        let mut events = Vec::new();
        while let Some(event) = reader.next_event().await.unwrap() {
            events.push(event);
        }
        events
    }

    fn text_of(event: &AgentEvent) -> Option<&str> {
        match event {
            AgentEvent::StreamEvent {
                event:
                    StreamEventBody::ContentBlockDelta {
                        delta: ContentDelta::TextDelta { text },
                        ..
                    },
            } => Some(text),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_reads_lines_in_order() {
        let input = concat!(
            r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"a"}}}"#,
            "\n",
            r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"b"}}}"#,
            "\n",
        );
        let events = collect(input.as_bytes()).await;
        let texts: Vec<_> = events.iter().filter_map(text_of).collect();
        assert_eq!(texts, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_skips_garbage_and_blank_lines() {
        let input = b"\nnot json\n\r\n{\"type\":\"result\",\"session_id\":\"s\"}\r\n{broken\n";
        let events = collect(input).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], AgentEvent::Result(_)));
    }

    #[tokio::test]
    async fn test_parses_unterminated_final_line() {
        let input = b"{\"type\":\"system\",\"subtype\":\"init\"}\n{\"type\":\"result\",\"session_id\":\"tail\"}";
        let events = collect(input).await;
        assert_eq!(events.len(), 2);
        match &events[1] {
            AgentEvent::Result(result) => assert_eq!(result.session_id.as_deref(), Some("tail")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_skipped_not_fatal() {
        let mut input = vec![0xff, 0xfe, b'\n'];
        input.extend_from_slice(b"{\"type\":\"result\"}\n");
        let events = collect(&input).await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_stream() {
        assert!(collect(b"").await.is_empty());
    }
}
