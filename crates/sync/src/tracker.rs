use std::collections::HashMap;
use std::time::Duration;

use chatsync_storage::{
    ChatStore, ConversationId, MessageId, MessageRecord, MessageRole, MessageStatus,
    OptimisticId, RequestId, SendContext,
};

use crate::cache::ExpiringCache;
use crate::persistence::best_effort;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved { confirmed: MessageId },
    /// The pair was already resolved; nothing was written.
    AlreadyResolved { confirmed: MessageId },
}

impl ResolveOutcome {
    pub fn confirmed(&self) -> &MessageId {
        match self {
            Self::Resolved { confirmed } | Self::AlreadyResolved { confirmed } => confirmed,
        }
    }
}

#[derive(Debug)]
struct PendingMessage {
    // Kept so the record can be rewritten if the optimistic write never landed.
    snapshot: MessageRecord,
}

/// Session-wide owner of optimistic user messages.
///
/// Resolutions are remembered per `(request, optimistic id)` in a bounded
/// expiring cache, so a replayed identity assignment is recognised without
/// keeping unbounded global state.
#[derive(Debug)]
pub struct OptimisticTracker {
    pending: HashMap<OptimisticId, PendingMessage>,
    resolved: ExpiringCache<(RequestId, OptimisticId), MessageId>,
}

impl OptimisticTracker {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            resolved: ExpiringCache::new(capacity, ttl),
        }
    }

    /// Mints an id and writes the user message under it with status `Pending`.
    ///
    /// The id is returned even when the write fails; the snapshot is retried at
    /// resolution time.
    pub async fn create_optimistic(
        &mut self,
        store: &dyn ChatStore,
        request_id: RequestId,
        content: &str,
        context: SendContext,
        conversation_id: Option<ConversationId>,
    ) -> OptimisticId {
        let optimistic_id = OptimisticId::new_v7();
        let snapshot = MessageRecord::new(
            optimistic_id.message_id(),
            MessageRole::User,
            content,
            MessageStatus::Pending,
        )
        .with_conversation(conversation_id)
        .with_context(context);

        best_effort(
            "tracker-create-optimistic",
            store.put_message(snapshot.clone()),
        )
        .await;
        tracing::debug!(%optimistic_id, %request_id, "created optimistic user message");

        self.pending
            .insert(optimistic_id, PendingMessage { snapshot });
        optimistic_id
    }

    pub async fn resolve(
        &mut self,
        store: &dyn ChatStore,
        request_id: RequestId,
        optimistic_id: OptimisticId,
        confirmed: MessageId,
        conversation_id: Option<ConversationId>,
    ) -> ResolveOutcome {
        if let Some(existing) = self.resolved.get(&(request_id, optimistic_id)) {
            tracing::debug!(
                %optimistic_id,
                confirmed = %existing,
                "optimistic message already resolved"
            );
            return ResolveOutcome::AlreadyResolved {
                confirmed: existing.clone(),
            };
        }

        let replaced = best_effort(
            "tracker-replace-optimistic",
            store.replace_optimistic_message(
                optimistic_id.message_id(),
                confirmed.clone(),
                conversation_id.clone(),
            ),
        )
        .await;

        if replaced == Some(false) {
            // The optimistic write was lost; recreate the record under its final id.
            if let Some(pending) = self.pending.get(&optimistic_id) {
                let mut record = pending.snapshot.clone();
                record.id = confirmed.clone();
                record.conversation_id = conversation_id.clone();
                best_effort("tracker-recreate-confirmed", store.put_message(record)).await;
            }
        }

        self.pending.remove(&optimistic_id);
        self.resolved
            .insert((request_id, optimistic_id), confirmed.clone());
        tracing::info!(%optimistic_id, %confirmed, "resolved optimistic user message");
        ResolveOutcome::Resolved { confirmed }
    }

    /// Deletes a still-unresolved optimistic record. Returns whether it was pending.
    pub async fn discard(&mut self, store: &dyn ChatStore, optimistic_id: OptimisticId) -> bool {
        if self.pending.remove(&optimistic_id).is_none() {
            return false;
        }

        best_effort(
            "tracker-discard-optimistic",
            store.delete_message(optimistic_id.message_id()),
        )
        .await;
        tracing::debug!(%optimistic_id, "discarded optimistic user message");
        true
    }

    /// Stops tracking an unresolved message but keeps its record.
    pub fn forget(&mut self, optimistic_id: OptimisticId) -> bool {
        self.pending.remove(&optimistic_id).is_some()
    }

    pub fn is_pending(&self, optimistic_id: OptimisticId) -> bool {
        self.pending.contains_key(&optimistic_id)
    }

    /// Confirmed id for a recently resolved message, for redirecting lookups keyed by the
    /// optimistic id. Entries expire with the resolution cache.
    pub fn confirmed_id(
        &mut self,
        request_id: RequestId,
        optimistic_id: OptimisticId,
    ) -> Option<MessageId> {
        self.resolved.get(&(request_id, optimistic_id)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use chatsync_storage::MemoryStore;

    use super::*;

    fn tracker() -> OptimisticTracker {
        OptimisticTracker::new(16, Duration::from_secs(60))
    }

    fn message_id(raw: &str) -> MessageId {
        MessageId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn optimistic_record_is_visible_before_resolution() {
        let store = MemoryStore::new();
        let mut tracker = tracker();
        let request_id = RequestId::new_v7();

        let optimistic_id = tracker
            .create_optimistic(&store, request_id, "hi", SendContext::default(), None)
            .await;

        let record = store
            .get_message(optimistic_id.message_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.content, "hi");
        assert_eq!(record.status, MessageStatus::Pending);
        assert!(tracker.is_pending(optimistic_id));
    }

    #[tokio::test]
    async fn second_resolution_is_a_no_op() {
        let store = MemoryStore::new();
        let mut tracker = tracker();
        let request_id = RequestId::new_v7();
        let optimistic_id = tracker
            .create_optimistic(&store, request_id, "hi", SendContext::default(), None)
            .await;
        let conversation_id = ConversationId::parse("c1").ok();

        let first = tracker
            .resolve(&store, request_id, optimistic_id, message_id("u1"), conversation_id.clone())
            .await;
        let second = tracker
            .resolve(&store, request_id, optimistic_id, message_id("u9"), conversation_id.clone())
            .await;

        assert_eq!(first, ResolveOutcome::Resolved { confirmed: message_id("u1") });
        assert_eq!(
            second,
            ResolveOutcome::AlreadyResolved { confirmed: message_id("u1") }
        );
        assert!(store.get_message(message_id("u9")).await.unwrap().is_none());
        assert!(store.get_message(optimistic_id.message_id()).await.unwrap().is_none());

        let record = store.get_message(message_id("u1")).await.unwrap().unwrap();
        assert_eq!(record.conversation_id, conversation_id);
        assert_eq!(
            tracker.confirmed_id(request_id, optimistic_id),
            Some(message_id("u1"))
        );
    }

    #[tokio::test]
    async fn resolution_recreates_a_lost_optimistic_write() {
        let store = MemoryStore::new();
        let mut tracker = tracker();
        let request_id = RequestId::new_v7();
        let optimistic_id = tracker
            .create_optimistic(&store, request_id, "hello", SendContext::default(), None)
            .await;
        store.delete_message(optimistic_id.message_id()).await.unwrap();

        tracker
            .resolve(&store, request_id, optimistic_id, message_id("u1"), None)
            .await;

        let record = store.get_message(message_id("u1")).await.unwrap().unwrap();
        assert_eq!(record.content, "hello");
        assert_eq!(record.role, MessageRole::User);
    }

    #[tokio::test]
    async fn discard_only_touches_unresolved_messages() {
        let store = MemoryStore::new();
        let mut tracker = tracker();
        let request_id = RequestId::new_v7();
        let first = tracker
            .create_optimistic(&store, request_id, "a", SendContext::default(), None)
            .await;
        let second = tracker
            .create_optimistic(&store, request_id, "b", SendContext::default(), None)
            .await;
        tracker
            .resolve(&store, request_id, second, message_id("u2"), None)
            .await;

        assert!(tracker.discard(&store, first).await);
        assert!(!tracker.discard(&store, second).await);
        assert!(store.get_message(first.message_id()).await.unwrap().is_none());
        assert!(store.get_message(message_id("u2")).await.unwrap().is_some());
    }
}
