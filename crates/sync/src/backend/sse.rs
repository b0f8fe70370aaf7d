//! Server-sent event framing.
//!
//! `data:` lines are joined with `\n` and dispatched on a blank line. Comment
//! lines and other fields are ignored. Lines may end in LF or CRLF, and chunk
//! boundaries may fall anywhere, including inside a UTF-8 sequence.

use std::fmt;

use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};

use super::TransportItem;

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut consumed = 0;
        while let Some(offset) = self.buffer[consumed..].iter().position(|byte| *byte == b'\n') {
            let end = consumed + offset;
            let line = strip_carriage_return(&self.buffer[consumed..end]);
            let line = String::from_utf8_lossy(line).into_owned();
            consumed = end + 1;

            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        self.buffer.drain(..consumed);

        events
    }

    /// Flushes a trailing event the stream ended without a blank line for.
    pub fn finish(&mut self) -> Option<String> {
        if !self.buffer.is_empty() {
            let remainder = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(strip_carriage_return(&remainder)).into_owned();
            if let Some(event) = self.process_line(&line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data_lines.push(value.to_string());
        }
        None
    }

    fn dispatch(&mut self) -> Option<String> {
        if self.data_lines.is_empty() {
            return None;
        }
        let event = self.data_lines.join("\n");
        self.data_lines.clear();
        Some(event)
    }
}

fn strip_carriage_return(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Pumps a byte stream through [`SseDecoder`] into a transport channel until
/// the stream ends, fails, or the consumer cancels.
pub async fn forward_sse<S, E>(
    mut chunks: S,
    items: mpsc::UnboundedSender<TransportItem>,
    mut cancel_rx: oneshot::Receiver<()>,
) where
    S: Stream<Item = Result<Vec<u8>, E>> + Unpin,
    E: fmt::Display,
{
    let mut decoder = SseDecoder::new();
    loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!("sse transport cancelled");
                return;
            }
            next = chunks.next() => match next {
                Some(Ok(chunk)) => {
                    for event in decoder.push(&chunk) {
                        if items.send(TransportItem::Event(event)).is_err() {
                            return;
                        }
                    }
                }
                Some(Err(error)) => {
                    tracing::warn!(error = %error, "sse transport failed");
                    let _ = items.send(TransportItem::Failed(error.to_string()));
                    return;
                }
                None => {
                    if let Some(event) = decoder.finish() {
                        let _ = items.send(TransportItem::Event(event));
                    }
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;
    use crate::backend::make_transport_stream;
    use chatsync_storage::RequestId;

    #[test]
    fn splits_events_on_blank_lines() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: {\"response\":\"Hel\"}\n\ndata: {\"response\":\"lo\"}\n\n");
        assert_eq!(
            events,
            vec![
                r#"{"response":"Hel"}"#.to_string(),
                r#"{"response":"lo"}"#.to_string()
            ]
        );
    }

    #[test]
    fn joins_multiline_data_and_skips_comments() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b": keep-alive\r\nevent: message\r\ndata: first\r\ndata:second\r\nid: 7\r\n\r\n");
        assert_eq!(events, vec!["first\nsecond".to_string()]);
    }

    #[test]
    fn survives_chunk_boundaries_inside_utf8() {
        let payload = "data: {\"response\":\"héllo\"}\n\n".as_bytes();
        let split = payload
            .iter()
            .position(|byte| *byte == 0xC3)
            .map(|index| index + 1)
            .unwrap();

        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&payload[..split]).is_empty());
        let events = decoder.push(&payload[split..]);

        assert_eq!(events, vec![r#"{"response":"héllo"}"#.to_string()]);
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: [DONE]").is_empty());
        assert_eq!(decoder.finish(), Some("[DONE]".to_string()));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn blank_lines_without_data_dispatch_nothing() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"\n\nretry: 10\n\n").is_empty());
    }

    #[tokio::test]
    async fn forward_sse_delivers_events_then_closes() {
        let (item_tx, mut transport, cancel_rx) = make_transport_stream(RequestId::new_v7());
        let chunks = stream::iter(vec![
            Ok::<_, String>(b"data: {\"response\":\"a\"}\n".to_vec()),
            Ok(b"\ndata: [DONE]".to_vec()),
        ]);

        forward_sse(chunks, item_tx, cancel_rx).await;

        assert_eq!(
            transport.recv().await,
            Some(TransportItem::Event(r#"{"response":"a"}"#.to_string()))
        );
        assert_eq!(
            transport.recv().await,
            Some(TransportItem::Event("[DONE]".to_string()))
        );
        assert_eq!(transport.recv().await, None);
    }

    #[tokio::test]
    async fn forward_sse_reports_stream_errors() {
        let (item_tx, mut transport, cancel_rx) = make_transport_stream(RequestId::new_v7());
        let chunks = stream::iter(vec![Err::<Vec<u8>, _>("connection reset".to_string())]);

        forward_sse(chunks, item_tx, cancel_rx).await;

        assert_eq!(
            transport.recv().await,
            Some(TransportItem::Failed("connection reset".to_string()))
        );
    }
}
