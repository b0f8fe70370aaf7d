use std::convert::Infallible;
use std::sync::Arc;

use futures::stream;

use super::sse::forward_sse;
use super::{
    BoxFuture, ChatBackend, SalvageReceipt, SalvageRequest, SendRequest, TransportResult,
    TransportStream, make_transport_stream,
};

const DEFAULT_CHUNK_SIZE: usize = 64;

/// Replays a captured SSE body for every request, in fixed-size chunks.
///
/// Salvage requests are acknowledged locally without a conversation id.
#[derive(Clone)]
pub struct SseReplayBackend {
    body: Arc<[u8]>,
    chunk_size: usize,
}

impl SseReplayBackend {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: Arc::from(body.into()),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

impl ChatBackend for SseReplayBackend {
    fn send_message<'a>(
        &'a self,
        request: SendRequest,
    ) -> BoxFuture<'a, TransportResult<TransportStream>> {
        Box::pin(async move {
            let (item_tx, stream, cancel_rx) = make_transport_stream(request.request_id);
            let chunks = self
                .body
                .chunks(self.chunk_size)
                .map(|chunk| Ok::<_, Infallible>(chunk.to_vec()))
                .collect::<Vec<_>>();

            tracing::debug!(
                request_id = %request.request_id,
                bytes = self.body.len(),
                "replaying captured stream"
            );
            tokio::spawn(forward_sse(stream::iter(chunks), item_tx, cancel_rx));
            Ok(stream)
        })
    }

    fn save_incomplete_conversation<'a>(
        &'a self,
        request: SalvageRequest,
    ) -> BoxFuture<'a, TransportResult<SalvageReceipt>> {
        Box::pin(async move {
            tracing::info!(
                request_id = %request.request_id,
                chars = request.accumulated_text.chars().count(),
                "salvage acknowledged by replay backend"
            );
            Ok(SalvageReceipt::default())
        })
    }
}

#[cfg(test)]
mod tests {
    use chatsync_storage::{RequestId, SendContext};

    use super::*;
    use crate::backend::TransportItem;

    #[tokio::test]
    async fn replays_body_as_events() {
        let backend = SseReplayBackend::new(
            b"data: {\"response\":\"Hi\"}\r\n\r\ndata: [DONE]\r\n\r\n".to_vec(),
        )
        .with_chunk_size(5);

        let mut stream = backend
            .send_message(SendRequest {
                request_id: RequestId::new_v7(),
                text: "hello".to_string(),
                conversation_id: None,
                context: SendContext::default(),
            })
            .await
            .unwrap();

        assert_eq!(
            stream.recv().await,
            Some(TransportItem::Event(r#"{"response":"Hi"}"#.to_string()))
        );
        assert_eq!(
            stream.recv().await,
            Some(TransportItem::Event("[DONE]".to_string()))
        );
        assert_eq!(stream.recv().await, None);
    }
}
