use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ids::{ConversationId, MessageId};

/// Title shown until the server computes a real one.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";

/// Structured side-channel data merged into an assistant message mid-stream.
pub type AuxiliaryPayload = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// Delivery status of one message.
///
/// `Pending -> Sending -> Sent` is the happy path. `Error` may be reset to
/// `Pending` for a retry; `Sent` and `Incomplete` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    Pending,
    Sending,
    Sent,
    Error,
    /// Partial reply kept after the stream was cancelled.
    Incomplete,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Error => "error",
            Self::Incomplete => "incomplete",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "sending" => Some(Self::Sending),
            "sent" => Some(Self::Sent),
            "error" => Some(Self::Error),
            "incomplete" => Some(Self::Incomplete),
            _ => None,
        }
    }

    pub fn is_final(self) -> bool {
        matches!(self, Self::Sent | Self::Incomplete)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }

        match self {
            Self::Pending => true,
            Self::Sending => !matches!(next, Self::Pending),
            Self::Error => matches!(next, Self::Pending),
            Self::Sent | Self::Incomplete => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub uri: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

/// Snapshot of what the composer had selected when the message was sent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SendContext {
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub workflow: Option<String>,
    #[serde(default)]
    pub calendar_event: Option<String>,
}

impl SendContext {
    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty()
            && self.tool.is_none()
            && self.workflow.is_none()
            && self.calendar_event.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub title: String,
    pub created_at_unix_ms: u64,
    pub updated_at_unix_ms: u64,
}

impl ConversationRecord {
    pub fn new(id: ConversationId, title: impl Into<String>) -> Self {
        let now = unix_timestamp_ms();
        let mut title = title.into();
        if title.trim().is_empty() {
            title = DEFAULT_CONVERSATION_TITLE.to_string();
        }

        Self {
            id,
            title,
            created_at_unix_ms: now,
            updated_at_unix_ms: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConversationPatch {
    pub title: Option<String>,
    /// Bump `updated_at` even when no field changes.
    pub touch: bool,
}

impl ConversationPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            touch: true,
        }
    }

    pub fn touch() -> Self {
        Self {
            title: None,
            touch: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: Option<ConversationId>,
    pub role: MessageRole,
    pub content: String,
    pub status: MessageStatus,
    pub context: SendContext,
    pub auxiliary: AuxiliaryPayload,
    pub created_at_unix_ms: u64,
    pub updated_at_unix_ms: u64,
}

impl MessageRecord {
    pub fn new(
        id: MessageId,
        role: MessageRole,
        content: impl Into<String>,
        status: MessageStatus,
    ) -> Self {
        let now = unix_timestamp_ms();
        Self {
            id,
            conversation_id: None,
            role,
            content: content.into(),
            status,
            context: SendContext::default(),
            auxiliary: AuxiliaryPayload::new(),
            created_at_unix_ms: now,
            updated_at_unix_ms: now,
        }
    }

    pub fn with_conversation(mut self, conversation_id: Option<ConversationId>) -> Self {
        self.conversation_id = conversation_id;
        self
    }

    pub fn with_context(mut self, context: SendContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_auxiliary(mut self, auxiliary: AuxiliaryPayload) -> Self {
        self.auxiliary = auxiliary;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub auxiliary: Option<AuxiliaryPayload>,
    pub conversation_id: Option<ConversationId>,
}

/// Change notification published after every successful store mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    ConversationUpserted(ConversationId),
    ConversationUpdated(ConversationId),
    MessageUpserted(MessageId),
    MessageUpdated(MessageId),
    /// Subscribers keyed to `from` should follow `to` from now on.
    MessageReplaced { from: MessageId, to: MessageId },
    MessageDeleted(MessageId),
}

pub fn unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}
