//! Seam between the controller and whatever delivers the event stream.

use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use chatsync_storage::{ConversationId, RequestId, SendContext};

mod replay;
mod scripted;
pub mod sse;

pub use replay::SseReplayBackend;
pub use scripted::{Script, ScriptedBackend};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub request_id: RequestId,
    pub text: String,
    pub conversation_id: Option<ConversationId>,
    pub context: SendContext,
}

/// Partial exchange handed back to the server after a cancelled stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SalvageRequest {
    pub request_id: RequestId,
    pub prompt_text: String,
    pub conversation_id: Option<ConversationId>,
    pub accumulated_text: String,
    pub context: SendContext,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SalvageReceipt {
    /// Present when the server filed the exchange under a conversation.
    pub conversation_id: Option<ConversationId>,
}

/// One item delivered by the transport, in arrival order.
///
/// The channel closing without a terminal sentinel means the connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportItem {
    /// Raw event payload, one per server-sent event.
    Event(String),
    /// The connection failed; nothing follows.
    Failed(String),
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("chat backend is unavailable on `{stage}`: {message}"))]
    Unavailable {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("chat backend rejected the request with status {status}: {body}"))]
    Rejected {
        stage: &'static str,
        status: u16,
        body: String,
    },
}

pub struct TransportStream {
    request_id: RequestId,
    items: mpsc::UnboundedReceiver<TransportItem>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl TransportStream {
    pub(crate) fn new(
        request_id: RequestId,
        items: mpsc::UnboundedReceiver<TransportItem>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            request_id,
            items,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub async fn recv(&mut self) -> Option<TransportItem> {
        self.items.recv().await
    }

    /// Next item that has already arrived, without waiting.
    pub fn try_recv(&mut self) -> Option<TransportItem> {
        self.items.try_recv().ok()
    }

    /// Asks the producer to close the connection. Returns false if already asked.
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_tx.is_none()
    }
}

impl Drop for TransportStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub fn make_transport_stream(
    request_id: RequestId,
) -> (
    mpsc::UnboundedSender<TransportItem>,
    TransportStream,
    oneshot::Receiver<()>,
) {
    let (item_tx, item_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        item_tx,
        TransportStream::new(request_id, item_rx, cancel_tx),
        cancel_rx,
    )
}

pub trait ChatBackend: Send + Sync {
    fn send_message<'a>(&'a self, request: SendRequest)
    -> BoxFuture<'a, TransportResult<TransportStream>>;

    fn save_incomplete_conversation<'a>(
        &'a self,
        request: SalvageRequest,
    ) -> BoxFuture<'a, TransportResult<SalvageReceipt>>;
}
