use std::collections::HashMap;

use snafu::OptionExt;
use tokio::sync::{RwLock, broadcast};

use super::error::{ConflictSnafu, NotFoundSnafu, StorageResult};
use super::ids::{ConversationId, MessageId};
use super::types::{
    ConversationPatch, ConversationRecord, MessagePatch, MessageRecord, MessageStatus,
    StoreChange, unix_timestamp_ms,
};
use super::{BoxFuture, ChatStore, STORE_CHANGE_CAPACITY, ensure_mutable, ensure_status_transition};

#[derive(Debug, Default)]
struct MemoryState {
    conversations: HashMap<ConversationId, ConversationRecord>,
    messages: HashMap<MessageId, StoredMessage>,
    next_seq: u64,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    seq: u64,
    record: MessageRecord,
}

/// Process-local store with the same semantics as [`super::SqliteStore`].
#[derive(Debug)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    changes: broadcast::Sender<StoreChange>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(STORE_CHANGE_CAPACITY);
        Self {
            state: RwLock::new(MemoryState::default()),
            changes,
        }
    }

    fn publish(&self, change: StoreChange) {
        // No subscribers is fine; the record is stored either way.
        let _ = self.changes.send(change);
    }
}

impl ChatStore for MemoryStore {
    fn put_conversation<'a>(
        &'a self,
        record: ConversationRecord,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state
                .conversations
                .insert(record.id.clone(), record.clone());
            drop(state);

            self.publish(StoreChange::ConversationUpserted(record.id.clone()));
            Ok(record)
        })
    }

    fn update_conversation_fields<'a>(
        &'a self,
        conversation_id: ConversationId,
        patch: ConversationPatch,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let record = state
                .conversations
                .get_mut(&conversation_id)
                .context(NotFoundSnafu {
                    stage: "conversation-update-missing",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                })?;

            let title_changed = patch.title.is_some();
            if let Some(title) = patch.title {
                record.title = title;
            }
            if title_changed || patch.touch {
                record.updated_at_unix_ms = unix_timestamp_ms().max(record.updated_at_unix_ms);
            }
            let updated = record.clone();
            drop(state);

            self.publish(StoreChange::ConversationUpdated(conversation_id));
            Ok(updated)
        })
    }

    fn get_conversation<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StorageResult<Option<ConversationRecord>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state.conversations.get(&conversation_id).cloned())
        })
    }

    fn list_conversations<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut conversations = state.conversations.values().cloned().collect::<Vec<_>>();
            conversations.sort_by(|left, right| {
                right
                    .updated_at_unix_ms
                    .cmp(&left.updated_at_unix_ms)
                    .then_with(|| right.id.cmp(&left.id))
            });
            Ok(conversations)
        })
    }

    fn put_message<'a>(
        &'a self,
        record: MessageRecord,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let stored = match state.messages.get(&record.id) {
                Some(existing) => {
                    ensure_mutable(&record.id, existing.record.status, "message-put-final")?;
                    let mut record = record;
                    record.created_at_unix_ms = existing.record.created_at_unix_ms;
                    StoredMessage {
                        seq: existing.seq,
                        record,
                    }
                }
                None => {
                    state.next_seq += 1;
                    StoredMessage {
                        seq: state.next_seq,
                        record,
                    }
                }
            };
            let record = stored.record.clone();
            state.messages.insert(record.id.clone(), stored);
            drop(guard);

            self.publish(StoreChange::MessageUpserted(record.id.clone()));
            Ok(record)
        })
    }

    fn update_message<'a>(
        &'a self,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let stored = state.messages.get_mut(&message_id).context(NotFoundSnafu {
                stage: "message-update-missing",
                entity: "message",
                id: message_id.to_string(),
            })?;
            ensure_mutable(&message_id, stored.record.status, "message-update-final")?;

            if let Some(content) = patch.content {
                stored.record.content = content;
            }
            if let Some(auxiliary) = patch.auxiliary {
                stored.record.auxiliary = auxiliary;
            }
            if let Some(conversation_id) = patch.conversation_id {
                stored.record.conversation_id = Some(conversation_id);
            }
            stored.record.updated_at_unix_ms = unix_timestamp_ms();
            let updated = stored.record.clone();
            drop(state);

            self.publish(StoreChange::MessageUpdated(message_id));
            Ok(updated)
        })
    }

    fn update_message_status<'a>(
        &'a self,
        message_id: MessageId,
        status: MessageStatus,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let stored = state.messages.get_mut(&message_id).context(NotFoundSnafu {
                stage: "message-status-missing",
                entity: "message",
                id: message_id.to_string(),
            })?;
            ensure_status_transition(
                &message_id,
                stored.record.status,
                status,
                "message-status-transition",
            )?;

            stored.record.status = status;
            stored.record.updated_at_unix_ms = unix_timestamp_ms();
            let updated = stored.record.clone();
            drop(state);

            self.publish(StoreChange::MessageUpdated(message_id));
            Ok(updated)
        })
    }

    fn replace_optimistic_message<'a>(
        &'a self,
        from: MessageId,
        to: MessageId,
        conversation_id: Option<ConversationId>,
    ) -> BoxFuture<'a, StorageResult<bool>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            if !state.messages.contains_key(&from) {
                return Ok(false);
            }
            snafu::ensure!(
                !state.messages.contains_key(&to),
                ConflictSnafu {
                    stage: "message-replace-target-exists",
                    entity: "message",
                    details: format!("cannot replace '{from}': '{to}' already exists"),
                }
            );

            let Some(mut stored) = state.messages.remove(&from) else {
                return Ok(false);
            };
            stored.record.id = to.clone();
            if conversation_id.is_some() {
                stored.record.conversation_id = conversation_id;
            }
            stored.record.updated_at_unix_ms = unix_timestamp_ms();
            state.messages.insert(to.clone(), stored);
            drop(state);

            self.publish(StoreChange::MessageReplaced { from, to });
            Ok(true)
        })
    }

    fn delete_message<'a>(&'a self, message_id: MessageId) -> BoxFuture<'a, StorageResult<bool>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let removed = state.messages.remove(&message_id).is_some();
            drop(state);

            if removed {
                self.publish(StoreChange::MessageDeleted(message_id));
            }
            Ok(removed)
        })
    }

    fn get_message<'a>(
        &'a self,
        message_id: MessageId,
    ) -> BoxFuture<'a, StorageResult<Option<MessageRecord>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state
                .messages
                .get(&message_id)
                .map(|stored| stored.record.clone()))
        })
    }

    fn list_messages<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut messages = state
                .messages
                .values()
                .filter(|stored| stored.record.conversation_id.as_ref() == Some(&conversation_id))
                .cloned()
                .collect::<Vec<_>>();
            messages.sort_by_key(|stored| stored.seq);
            Ok(messages.into_iter().map(|stored| stored.record).collect())
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::ids::OptimisticId;
    use crate::types::MessageRole;

    fn conversation_id(raw: &str) -> ConversationId {
        ConversationId::parse(raw).unwrap()
    }

    fn message_id(raw: &str) -> MessageId {
        MessageId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn replace_moves_record_and_keeps_fields() {
        let store = MemoryStore::new();
        let mut changes = store.subscribe();
        let optimistic = OptimisticId::new_v7().message_id();

        store
            .put_message(
                MessageRecord::new(optimistic.clone(), MessageRole::User, "hi", MessageStatus::Pending),
            )
            .await
            .unwrap();
        let replaced = store
            .replace_optimistic_message(optimistic.clone(), message_id("u1"), Some(conversation_id("c1")))
            .await
            .unwrap();

        assert!(replaced);
        assert!(store.get_message(optimistic.clone()).await.unwrap().is_none());
        let confirmed = store.get_message(message_id("u1")).await.unwrap().unwrap();
        assert_eq!(confirmed.content, "hi");
        assert_eq!(confirmed.status, MessageStatus::Pending);
        assert_eq!(confirmed.conversation_id, Some(conversation_id("c1")));

        assert_eq!(changes.recv().await.unwrap(), StoreChange::MessageUpserted(optimistic.clone()));
        assert_eq!(
            changes.recv().await.unwrap(),
            StoreChange::MessageReplaced {
                from: optimistic,
                to: message_id("u1"),
            }
        );
    }

    #[tokio::test]
    async fn replace_of_missing_record_reports_false() {
        let store = MemoryStore::new();
        let replaced = store
            .replace_optimistic_message(OptimisticId::new_v7().message_id(), message_id("u1"), None)
            .await
            .unwrap();
        assert!(!replaced);
    }

    #[tokio::test]
    async fn sent_messages_reject_further_writes() {
        let store = MemoryStore::new();
        store
            .put_message(MessageRecord::new(
                message_id("b1"),
                MessageRole::Assistant,
                "done",
                MessageStatus::Sending,
            ))
            .await
            .unwrap();
        store
            .update_message_status(message_id("b1"), MessageStatus::Sent)
            .await
            .unwrap();

        let error = store
            .update_message(
                message_id("b1"),
                MessagePatch {
                    content: Some("changed".to_string()),
                    ..MessagePatch::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(error, StorageError::Conflict { .. }));

        let error = store
            .update_message_status(message_id("b1"), MessageStatus::Error)
            .await
            .unwrap_err();
        assert!(matches!(error, StorageError::Conflict { .. }));
    }

    #[tokio::test]
    async fn messages_list_in_creation_order_per_conversation() {
        let store = MemoryStore::new();
        for (id, conversation) in [("m1", "c1"), ("m2", "c2"), ("m3", "c1")] {
            store
                .put_message(
                    MessageRecord::new(message_id(id), MessageRole::User, id, MessageStatus::Sent)
                        .with_conversation(Some(conversation_id(conversation))),
                )
                .await
                .unwrap();
        }

        let listed = store.list_messages(conversation_id("c1")).await.unwrap();
        let ids = listed.iter().map(|record| record.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["m1", "m3"]);
    }

    #[tokio::test]
    async fn title_update_bumps_conversation_to_front() {
        let store = MemoryStore::new();
        let mut older = ConversationRecord::new(conversation_id("c1"), "first");
        older.updated_at_unix_ms = 10;
        let mut newer = ConversationRecord::new(conversation_id("c2"), "second");
        newer.updated_at_unix_ms = 20;
        store.put_conversation(older).await.unwrap();
        store.put_conversation(newer).await.unwrap();

        store
            .update_conversation_fields(conversation_id("c1"), ConversationPatch::title("renamed"))
            .await
            .unwrap();

        let listed = store.list_conversations().await.unwrap();
        assert_eq!(listed[0].id, conversation_id("c1"));
        assert_eq!(listed[0].title, "renamed");
    }
}
