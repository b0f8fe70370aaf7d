use tokio::sync::mpsc;

use chatsync_storage::{ConversationId, MessageId, RequestId, SendContext};

use crate::event::ProgressUpdate;

pub type NoticeReceiver = mpsc::UnboundedReceiver<SyncNotice>;
pub(crate) type NoticeSender = mpsc::UnboundedSender<SyncNotice>;

/// What the user typed and selected for one send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposerInput {
    pub text: String,
    pub context: SendContext,
}

impl ComposerInput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            context: SendContext::default(),
        }
    }

    pub fn with_context(mut self, context: SendContext) -> Self {
        self.context = context;
        self
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty() && self.context.attachments.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The server sent an `error` event.
    ServerSignaled,
    /// The connection failed or could not be opened.
    Transport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed {
        conversation_id: Option<ConversationId>,
        bot_message_id: MessageId,
        content: String,
    },
    Failed {
        reason: FailureReason,
        message: String,
    },
    Aborted {
        salvaged: bool,
        content: String,
    },
}

impl StreamOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Aborted { .. } => "aborted",
        }
    }
}

/// Events for the UI layer; durable record changes arrive via the store feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotice {
    Progress {
        request_id: RequestId,
        update: ProgressUpdate,
    },
    /// The stream created a conversation; the UI should switch to it.
    NavigateTo(ConversationId),
    MainResponseComplete { request_id: RequestId },
    /// User-visible failure.
    Failed {
        request_id: RequestId,
        reason: FailureReason,
        message: String,
    },
    /// Put this input back into the composer.
    RestoreInput(ComposerInput),
    SalvageSaved {
        request_id: RequestId,
        conversation_id: Option<ConversationId>,
    },
    Closed {
        request_id: RequestId,
        outcome: StreamOutcome,
    },
}

pub(crate) fn notify(notices: &NoticeSender, notice: SyncNotice) {
    if notices.send(notice).is_err() {
        tracing::trace!("notice receiver dropped");
    }
}
