use serde_json::Value;

use chatsync_storage::{
    AuxiliaryPayload, ChatStore, ConversationId, MessageId, MessagePatch, MessageRecord,
    MessageRole, MessageStatus, OptimisticId,
};

use crate::persistence::best_effort;

/// Merges a side-channel payload into the accumulated one.
///
/// Array values append to an existing array under the same key; everything
/// else is last-write-wins.
pub fn merge_auxiliary(target: &mut AuxiliaryPayload, incoming: AuxiliaryPayload) {
    for (key, value) in incoming {
        let value = match (target.get_mut(&key), value) {
            (Some(Value::Array(existing)), Value::Array(items)) => {
                existing.extend(items);
                continue;
            }
            (_, value) => value,
        };
        target.insert(key, value);
    }
}

/// The single assistant message being accumulated for one stream.
///
/// Memory is authoritative: every mutation updates the in-memory record first
/// and then mirrors a snapshot to the store under the current id.
#[derive(Debug)]
pub struct BotMessageBuilder {
    optimistic_id: OptimisticId,
    confirmed_id: Option<MessageId>,
    conversation_id: Option<ConversationId>,
    content: String,
    auxiliary: AuxiliaryPayload,
    delta_count: usize,
    persisted: bool,
    main_response_complete: bool,
    finalized: Option<MessageStatus>,
}

impl BotMessageBuilder {
    pub fn new(conversation_id: Option<ConversationId>) -> Self {
        Self {
            optimistic_id: OptimisticId::new_v7(),
            confirmed_id: None,
            conversation_id,
            content: String::new(),
            auxiliary: AuxiliaryPayload::new(),
            delta_count: 0,
            persisted: false,
            main_response_complete: false,
            finalized: None,
        }
    }

    pub fn current_id(&self) -> MessageId {
        self.confirmed_id
            .clone()
            .unwrap_or_else(|| self.optimistic_id.message_id())
    }

    pub fn is_bound(&self) -> bool {
        self.confirmed_id.is_some()
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn auxiliary(&self) -> &AuxiliaryPayload {
        &self.auxiliary
    }

    pub fn delta_count(&self) -> usize {
        self.delta_count
    }

    pub fn has_content(&self) -> bool {
        !self.content.is_empty()
    }

    pub fn main_response_complete(&self) -> bool {
        self.main_response_complete
    }

    pub fn mark_main_response_complete(&mut self) {
        self.main_response_complete = true;
    }

    pub fn snapshot(&self, status: MessageStatus) -> MessageRecord {
        MessageRecord::new(
            self.current_id(),
            MessageRole::Assistant,
            self.content.clone(),
            status,
        )
        .with_conversation(self.conversation_id.clone())
        .with_auxiliary(self.auxiliary.clone())
    }

    pub async fn append_delta(&mut self, store: &dyn ChatStore, delta: &str) {
        if self.finalized.is_some() {
            tracing::warn!(message_id = %self.current_id(), "delta after finalization ignored");
            return;
        }

        self.content.push_str(delta);
        self.delta_count += 1;
        self.mirror(store).await;
    }

    pub async fn merge_payload(&mut self, store: &dyn ChatStore, payload: AuxiliaryPayload) {
        if self.finalized.is_some() {
            tracing::warn!(message_id = %self.current_id(), "payload after finalization ignored");
            return;
        }

        merge_auxiliary(&mut self.auxiliary, payload);
        self.mirror(store).await;
    }

    /// Moves the message under its server id and conversation.
    ///
    /// A record already mirrored under the optimistic id is replaced in place;
    /// otherwise the record is created under the confirmed id.
    pub async fn bind(
        &mut self,
        store: &dyn ChatStore,
        confirmed: MessageId,
        conversation_id: Option<ConversationId>,
    ) {
        if let Some(existing) = &self.confirmed_id {
            tracing::warn!(%existing, %confirmed, "assistant message already bound");
            return;
        }

        let from = self.optimistic_id.message_id();
        if conversation_id.is_some() {
            self.conversation_id = conversation_id;
        }
        self.confirmed_id = Some(confirmed.clone());

        if self.persisted {
            let replaced = best_effort(
                "builder-replace-optimistic",
                store.replace_optimistic_message(
                    from.clone(),
                    confirmed.clone(),
                    self.conversation_id.clone(),
                ),
            )
            .await;
            if replaced == Some(true) {
                tracing::debug!(%from, %confirmed, "moved assistant message to confirmed id");
                return;
            }
            // Fall back to writing a fresh record and dropping the stale one.
            best_effort("builder-drop-optimistic", store.delete_message(from)).await;
        }

        self.persisted = false;
        self.mirror(store).await;
    }

    /// Writes the final status, creating the record first if it never landed.
    pub async fn finalize(&mut self, store: &dyn ChatStore, status: MessageStatus) {
        if let Some(previous) = self.finalized {
            tracing::debug!(previous = previous.as_str(), "assistant message already finalized");
            return;
        }
        self.finalized = Some(status);

        if !self.persisted {
            self.persisted = best_effort(
                "builder-finalize-create",
                store.put_message(self.snapshot(status)),
            )
            .await
            .is_some();
            return;
        }

        best_effort(
            "builder-finalize-status",
            store.update_message_status(self.current_id(), status),
        )
        .await;
    }

    /// Removes a record that was never bound to a server id.
    pub async fn discard(&mut self, store: &dyn ChatStore) {
        self.finalized = Some(MessageStatus::Error);
        if self.persisted && !self.is_bound() {
            best_effort(
                "builder-discard-optimistic",
                store.delete_message(self.optimistic_id.message_id()),
            )
            .await;
            self.persisted = false;
        }
    }

    /// Attaches the message to a conversation learned after the stream ended.
    pub async fn adopt_conversation(&mut self, store: &dyn ChatStore, conversation_id: ConversationId) {
        self.conversation_id = Some(conversation_id.clone());
        if self.persisted {
            best_effort(
                "builder-adopt-conversation",
                store.update_message(
                    self.current_id(),
                    MessagePatch {
                        conversation_id: Some(conversation_id),
                        ..MessagePatch::default()
                    },
                ),
            )
            .await;
        }
    }

    async fn mirror(&mut self, store: &dyn ChatStore) {
        if !self.persisted {
            self.persisted = best_effort(
                "builder-create-record",
                store.put_message(self.snapshot(MessageStatus::Sending)),
            )
            .await
            .is_some();
            return;
        }

        let patch = MessagePatch {
            content: Some(self.content.clone()),
            auxiliary: Some(self.auxiliary.clone()),
            conversation_id: None,
        };
        best_effort(
            "builder-update-record",
            store.update_message(self.current_id(), patch),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use chatsync_storage::MemoryStore;
    use serde_json::json;

    use super::*;

    fn payload(value: Value) -> AuxiliaryPayload {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn arrays_append_and_scalars_overwrite() {
        let mut target = payload(json!({"tools": [{"name": "a"}], "status": "searching"}));
        merge_auxiliary(
            &mut target,
            payload(json!({"tools": [{"name": "b"}], "status": "generating_image"})),
        );

        assert_eq!(
            Value::Object(target),
            json!({"tools": [{"name": "a"}, {"name": "b"}], "status": "generating_image"})
        );
    }

    #[test]
    fn array_replaces_non_array_value() {
        let mut target = payload(json!({"items": "none"}));
        merge_auxiliary(&mut target, payload(json!({"items": [1]})));
        assert_eq!(target["items"], json!([1]));
    }

    #[tokio::test]
    async fn deltas_accumulate_and_mirror_to_store() {
        let store = MemoryStore::new();
        let mut builder = BotMessageBuilder::new(None);

        for delta in ["Hel", "lo", ", world"] {
            builder.append_delta(&store, delta).await;
        }

        assert_eq!(builder.content(), "Hello, world");
        assert_eq!(builder.delta_count(), 3);
        let record = store.get_message(builder.current_id()).await.unwrap().unwrap();
        assert_eq!(record.content, "Hello, world");
        assert_eq!(record.status, MessageStatus::Sending);
    }

    #[tokio::test]
    async fn bind_moves_mirrored_record_to_confirmed_id() {
        let store = MemoryStore::new();
        let mut builder = BotMessageBuilder::new(None);
        builder.append_delta(&store, "early").await;
        let optimistic = builder.current_id();

        let confirmed = MessageId::parse("b1").unwrap();
        let conversation = ConversationId::parse("c1").unwrap();
        builder
            .bind(&store, confirmed.clone(), Some(conversation.clone()))
            .await;
        builder.append_delta(&store, " late").await;

        assert!(store.get_message(optimistic).await.unwrap().is_none());
        let record = store.get_message(confirmed).await.unwrap().unwrap();
        assert_eq!(record.content, "early late");
        assert_eq!(record.conversation_id, Some(conversation));
    }

    #[tokio::test]
    async fn status_becomes_final_only_on_finalize() {
        let store = MemoryStore::new();
        let mut builder = BotMessageBuilder::new(None);
        builder
            .bind(&store, MessageId::parse("b1").unwrap(), None)
            .await;
        builder.append_delta(&store, "Hi").await;
        builder.mark_main_response_complete();

        let id = builder.current_id();
        assert_eq!(
            store.get_message(id.clone()).await.unwrap().unwrap().status,
            MessageStatus::Sending
        );

        builder.finalize(&store, MessageStatus::Sent).await;
        builder.append_delta(&store, " again").await;

        let record = store.get_message(id).await.unwrap().unwrap();
        assert_eq!(record.status, MessageStatus::Sent);
        assert_eq!(record.content, "Hi");
    }

    #[tokio::test]
    async fn discard_removes_unbound_record() {
        let store = MemoryStore::new();
        let mut builder = BotMessageBuilder::new(None);
        builder.merge_payload(&store, payload(json!({"status": "thinking"}))).await;
        let id = builder.current_id();
        assert!(store.get_message(id.clone()).await.unwrap().is_some());

        builder.discard(&store).await;

        assert!(store.get_message(id).await.unwrap().is_none());
    }
}
