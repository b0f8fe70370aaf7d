use std::future::Future;
use std::pin::Pin;

use tokio::sync::broadcast;

pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{ConversationId, MessageId, OPTIMISTIC_ID_PREFIX, OptimisticId, RequestId};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::{
    Attachment, AuxiliaryPayload, ConversationPatch, ConversationRecord,
    DEFAULT_CONVERSATION_TITLE, MessagePatch, MessageRecord, MessageRole, MessageStatus,
    SendContext, StoreChange, unix_timestamp_ms,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Capacity of the change feed; slow subscribers skip ahead instead of blocking writers.
pub const STORE_CHANGE_CAPACITY: usize = 256;

/// Durable home of conversation and message records.
///
/// Every successful mutation is announced on the channel returned by
/// [`ChatStore::subscribe`]. Writes to `Sent`/`Incomplete` messages are
/// rejected with [`StorageError::Conflict`]; `put_message` is an upsert and
/// obeys the same rule when the existing row is final.
pub trait ChatStore: Send + Sync {
    fn put_conversation<'a>(
        &'a self,
        record: ConversationRecord,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>>;

    fn update_conversation_fields<'a>(
        &'a self,
        conversation_id: ConversationId,
        patch: ConversationPatch,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>>;

    fn get_conversation<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StorageResult<Option<ConversationRecord>>>;

    /// Most recently updated first.
    fn list_conversations<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<ConversationRecord>>>;

    fn put_message<'a>(&'a self, record: MessageRecord)
    -> BoxFuture<'a, StorageResult<MessageRecord>>;

    fn update_message<'a>(
        &'a self,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>>;

    fn update_message_status<'a>(
        &'a self,
        message_id: MessageId,
        status: MessageStatus,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>>;

    /// Rewrites the record stored under `from` so it lives under `to`, keeping
    /// every other field. Returns `false` when `from` does not exist.
    fn replace_optimistic_message<'a>(
        &'a self,
        from: MessageId,
        to: MessageId,
        conversation_id: Option<ConversationId>,
    ) -> BoxFuture<'a, StorageResult<bool>>;

    fn delete_message<'a>(&'a self, message_id: MessageId) -> BoxFuture<'a, StorageResult<bool>>;

    fn get_message<'a>(
        &'a self,
        message_id: MessageId,
    ) -> BoxFuture<'a, StorageResult<Option<MessageRecord>>>;

    /// Messages of one conversation in creation order.
    fn list_messages<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>>;

    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}

pub(crate) fn ensure_status_transition(
    message_id: &MessageId,
    current: MessageStatus,
    next: MessageStatus,
    stage: &'static str,
) -> StorageResult<()> {
    snafu::ensure!(
        current.can_transition_to(next),
        error::ConflictSnafu {
            stage,
            entity: "message",
            details: format!(
                "message '{message_id}' cannot move from {} to {}",
                current.as_str(),
                next.as_str()
            ),
        }
    );
    Ok(())
}

pub(crate) fn ensure_mutable(
    message_id: &MessageId,
    current: MessageStatus,
    stage: &'static str,
) -> StorageResult<()> {
    snafu::ensure!(
        !current.is_final(),
        error::ConflictSnafu {
            stage,
            entity: "message",
            details: format!(
                "message '{message_id}' is {} and can no longer change",
                current.as_str()
            ),
        }
    );
    Ok(())
}
