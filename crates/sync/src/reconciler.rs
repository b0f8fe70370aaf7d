use chatsync_storage::{
    ChatStore, ConversationId, ConversationPatch, ConversationRecord, MessageId, OptimisticId,
    RequestId,
};

use crate::builder::BotMessageBuilder;
use crate::event::IdentityAssignment;
use crate::persistence::best_effort;
use crate::tracker::OptimisticTracker;

/// Identity state of one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReconcilerState {
    #[default]
    AwaitingIdentity,
    Bound {
        conversation_id: Option<ConversationId>,
    },
    Closed {
        conversation_id: Option<ConversationId>,
        was_bound: bool,
    },
}

impl ReconcilerState {
    /// Only `AwaitingIdentity` reacts to identity assignments.
    pub fn accepts_identity(&self) -> bool {
        matches!(self, Self::AwaitingIdentity)
    }

    /// Description updates need a conversation to update.
    pub fn accepts_description(&self) -> bool {
        matches!(
            self,
            Self::Bound {
                conversation_id: Some(_),
                ..
            }
        )
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::AwaitingIdentity => None,
            Self::Bound {
                conversation_id, ..
            }
            | Self::Closed {
                conversation_id, ..
            } => conversation_id.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Bound {
        conversation_id: Option<ConversationId>,
        /// Server id the optimistic user message now lives under.
        user_message: MessageId,
        created_conversation: bool,
        /// Set once, when the stream moved to a conversation other than the one it started in.
        navigate_to: Option<ConversationId>,
    },
    DuplicateIgnored,
    TitleUpdated(ConversationId),
    /// The event arrived in a state that does not accept it.
    Ignored { reason: &'static str },
}

/// Collaborators the reconciler drives while binding identities.
pub struct ReconcileContext<'a> {
    pub store: &'a dyn ChatStore,
    pub tracker: &'a mut OptimisticTracker,
    pub builder: &'a mut BotMessageBuilder,
    pub user_message: OptimisticId,
}

#[derive(Debug)]
pub struct ConversationReconciler {
    request_id: RequestId,
    known_conversation: Option<ConversationId>,
    placeholder_title: String,
    state: ReconcilerState,
}

impl ConversationReconciler {
    pub fn new(
        request_id: RequestId,
        known_conversation: Option<ConversationId>,
        placeholder_title: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            known_conversation,
            placeholder_title: placeholder_title.into(),
            state: ReconcilerState::default(),
        }
    }

    pub fn state(&self) -> &ReconcilerState {
        &self.state
    }

    /// True once an identity was bound, including after close.
    pub fn is_bound(&self) -> bool {
        matches!(
            self.state,
            ReconcilerState::Bound { .. } | ReconcilerState::Closed { was_bound: true, .. }
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ReconcilerState::Closed { .. })
    }

    /// Conversation the stream is bound to, or the one it was started in.
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.state
            .conversation_id()
            .or(self.known_conversation.as_ref())
    }

    pub fn bound_conversation(&self) -> Option<&ConversationId> {
        self.state.conversation_id()
    }

    pub async fn apply_identity(
        &mut self,
        context: ReconcileContext<'_>,
        assignment: IdentityAssignment,
    ) -> ReconcileOutcome {
        if self.is_closed() {
            tracing::debug!(shape = assignment.shape(), "identity after close ignored");
            return ReconcileOutcome::Ignored {
                reason: "stream-closed",
            };
        }
        if !self.state.accepts_identity() {
            tracing::warn!(
                shape = assignment.shape(),
                "duplicate identity assignment ignored"
            );
            return ReconcileOutcome::DuplicateIgnored;
        }

        let messages = assignment.messages().clone();
        let (conversation_id, created_conversation) = match assignment {
            IdentityAssignment::NewConversation {
                conversation_id,
                description,
                ..
            } => {
                let created = self
                    .ensure_conversation(context.store, &conversation_id, description)
                    .await;
                (Some(conversation_id), created)
            }
            IdentityAssignment::ExistingConversation { .. } => {
                if self.known_conversation.is_none() {
                    tracing::warn!("existing-conversation identity without a known conversation");
                }
                (self.known_conversation.clone(), false)
            }
        };

        let user_message = context
            .tracker
            .resolve(
                context.store,
                self.request_id,
                context.user_message,
                messages.user_message_id,
                conversation_id.clone(),
            )
            .await
            .confirmed()
            .clone();
        context
            .builder
            .bind(
                context.store,
                messages.bot_message_id,
                conversation_id.clone(),
            )
            .await;

        self.state = ReconcilerState::Bound {
            conversation_id: conversation_id.clone(),
        };

        let navigate_to = match &conversation_id {
            Some(id) if self.known_conversation.as_ref() != Some(id) => Some(id.clone()),
            _ => None,
        };
        ReconcileOutcome::Bound {
            conversation_id,
            user_message,
            created_conversation,
            navigate_to,
        }
    }

    pub async fn apply_description(
        &mut self,
        store: &dyn ChatStore,
        description: String,
    ) -> ReconcileOutcome {
        if !self.state.accepts_description() {
            tracing::warn!(state = ?self.state, "description update ignored");
            return ReconcileOutcome::Ignored {
                reason: "description-before-bind",
            };
        }
        let Some(conversation_id) = self.state.conversation_id().cloned() else {
            return ReconcileOutcome::Ignored {
                reason: "description-without-conversation",
            };
        };

        best_effort(
            "reconciler-update-title",
            store.update_conversation_fields(
                conversation_id.clone(),
                ConversationPatch::title(description),
            ),
        )
        .await;
        ReconcileOutcome::TitleUpdated(conversation_id)
    }

    /// No reconciliation side effects are applied after this.
    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        let was_bound = self.is_bound();
        let conversation_id = self.state.conversation_id().cloned();
        self.state = ReconcilerState::Closed {
            conversation_id,
            was_bound,
        };
    }

    async fn ensure_conversation(
        &self,
        store: &dyn ChatStore,
        conversation_id: &ConversationId,
        description: Option<String>,
    ) -> bool {
        let existing = best_effort(
            "reconciler-get-conversation",
            store.get_conversation(conversation_id.clone()),
        )
        .await;
        if let Some(Some(existing)) = existing {
            tracing::debug!(conversation_id = %existing.id, "conversation already present");
            return false;
        }

        let title = description.unwrap_or_else(|| self.placeholder_title.clone());
        best_effort(
            "reconciler-create-conversation",
            store.put_conversation(ConversationRecord::new(conversation_id.clone(), title)),
        )
        .await
        .is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chatsync_storage::{MemoryStore, MessageId, SendContext};

    use super::*;
    use crate::event::MessageIdentity;

    struct Rig {
        store: MemoryStore,
        tracker: OptimisticTracker,
        builder: BotMessageBuilder,
        user_message: OptimisticId,
        reconciler: ConversationReconciler,
    }

    impl Rig {
        async fn new(known_conversation: Option<&str>) -> Self {
            let store = MemoryStore::new();
            let mut tracker = OptimisticTracker::new(16, Duration::from_secs(60));
            let request_id = RequestId::new_v7();
            let known = known_conversation.map(|raw| ConversationId::parse(raw).unwrap());
            let user_message = tracker
                .create_optimistic(&store, request_id, "hi", SendContext::default(), known.clone())
                .await;
            Self {
                store,
                tracker,
                builder: BotMessageBuilder::new(known.clone()),
                user_message,
                reconciler: ConversationReconciler::new(request_id, known, "New Conversation"),
            }
        }

        async fn apply(&mut self, assignment: IdentityAssignment) -> ReconcileOutcome {
            let context = ReconcileContext {
                store: &self.store,
                tracker: &mut self.tracker,
                builder: &mut self.builder,
                user_message: self.user_message,
            };
            self.reconciler.apply_identity(context, assignment).await
        }
    }

    fn new_conversation(conversation: &str, user: &str, bot: &str) -> IdentityAssignment {
        IdentityAssignment::NewConversation {
            conversation_id: ConversationId::parse(conversation).unwrap(),
            description: None,
            messages: identity(user, bot),
        }
    }

    fn identity(user: &str, bot: &str) -> MessageIdentity {
        MessageIdentity {
            user_message_id: MessageId::parse(user).unwrap(),
            bot_message_id: MessageId::parse(bot).unwrap(),
        }
    }

    #[tokio::test]
    async fn new_conversation_shape_creates_and_navigates() {
        let mut rig = Rig::new(None).await;

        let outcome = rig.apply(new_conversation("c1", "u1", "b1")).await;

        let c1 = ConversationId::parse("c1").unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Bound {
                conversation_id: Some(c1.clone()),
                user_message: MessageId::parse("u1").unwrap(),
                created_conversation: true,
                navigate_to: Some(c1.clone()),
            }
        );
        let conversation = rig.store.get_conversation(c1.clone()).await.unwrap().unwrap();
        assert_eq!(conversation.title, "New Conversation");
        let user = rig.store.get_message(MessageId::parse("u1").unwrap()).await.unwrap().unwrap();
        assert_eq!(user.conversation_id, Some(c1.clone()));
        let bot = rig.store.get_message(MessageId::parse("b1").unwrap()).await.unwrap().unwrap();
        assert_eq!(bot.conversation_id, Some(c1));
    }

    #[tokio::test]
    async fn first_shape_wins_and_duplicates_are_ignored() {
        let mut rig = Rig::new(None).await;
        rig.apply(new_conversation("c1", "u1", "b1")).await;

        let duplicate = rig.apply(new_conversation("c2", "u2", "b2")).await;
        let other_shape = rig
            .apply(IdentityAssignment::ExistingConversation {
                messages: identity("u3", "b3"),
            })
            .await;

        assert_eq!(duplicate, ReconcileOutcome::DuplicateIgnored);
        assert_eq!(other_shape, ReconcileOutcome::DuplicateIgnored);
        assert_eq!(rig.store.list_conversations().await.unwrap().len(), 1);
        assert!(rig.store.get_message(MessageId::parse("u2").unwrap()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn existing_shape_binds_to_known_conversation_without_navigation() {
        let mut rig = Rig::new(Some("c0")).await;

        let outcome = rig
            .apply(IdentityAssignment::ExistingConversation {
                messages: identity("u2", "b2"),
            })
            .await;

        assert_eq!(
            outcome,
            ReconcileOutcome::Bound {
                conversation_id: ConversationId::parse("c0").ok(),
                user_message: MessageId::parse("u2").unwrap(),
                created_conversation: false,
                navigate_to: None,
            }
        );
        assert!(rig.store.list_conversations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn description_needs_a_bound_conversation() {
        let mut rig = Rig::new(None).await;

        let early = rig
            .reconciler
            .apply_description(&rig.store, "Too early".to_string())
            .await;
        assert!(matches!(early, ReconcileOutcome::Ignored { .. }));

        rig.apply(new_conversation("c1", "u1", "b1")).await;
        let outcome = rig
            .reconciler
            .apply_description(&rig.store, "Trip planning".to_string())
            .await;

        let c1 = ConversationId::parse("c1").unwrap();
        assert_eq!(outcome, ReconcileOutcome::TitleUpdated(c1.clone()));
        assert_eq!(
            rig.store.get_conversation(c1).await.unwrap().unwrap().title,
            "Trip planning"
        );
    }

    #[tokio::test]
    async fn closed_reconciler_has_no_side_effects() {
        let mut rig = Rig::new(None).await;
        rig.reconciler.close();

        let outcome = rig.apply(new_conversation("c1", "u1", "b1")).await;

        assert!(matches!(outcome, ReconcileOutcome::Ignored { .. }));
        assert!(!rig.reconciler.is_bound());
        assert!(rig.store.list_conversations().await.unwrap().is_empty());
    }
}
