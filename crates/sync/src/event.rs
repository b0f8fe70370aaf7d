//! Decoding of one stream payload into a typed event.

use serde_json::{Map, Value};
use snafu::Snafu;

use chatsync_storage::{AuxiliaryPayload, ConversationId, MessageId};

use crate::settings::DEFAULT_TERMINAL_SENTINEL;

/// Transient "what is happening now" indicator; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub message: String,
    pub tool_name: Option<String>,
    pub tool_category: Option<String>,
}

impl ProgressUpdate {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            tool_name: None,
            tool_category: None,
        }
    }
}

/// Server-issued ids for the exchange this stream belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageIdentity {
    pub user_message_id: MessageId,
    pub bot_message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityAssignment {
    NewConversation {
        conversation_id: ConversationId,
        description: Option<String>,
        messages: MessageIdentity,
    },
    ExistingConversation { messages: MessageIdentity },
}

impl IdentityAssignment {
    pub fn messages(&self) -> &MessageIdentity {
        match self {
            Self::NewConversation { messages, .. } | Self::ExistingConversation { messages } => {
                messages
            }
        }
    }

    pub fn shape(&self) -> &'static str {
        match self {
            Self::NewConversation { .. } => "new-conversation",
            Self::ExistingConversation { .. } => "existing-conversation",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Terminal,
    Error(String),
    MainResponseComplete,
    Progress(ProgressUpdate),
    Identity(IdentityAssignment),
    DescriptionUpdate(String),
    /// A text delta. Fields sent alongside it are kept in `payload`.
    ContentDelta {
        delta: String,
        payload: Option<AuxiliaryPayload>,
    },
    SidePayload(AuxiliaryPayload),
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Terminal => "terminal",
            Self::Error(_) => "error",
            Self::MainResponseComplete => "main-response-complete",
            Self::Progress(_) => "progress",
            Self::Identity(_) => "identity",
            Self::DescriptionUpdate(_) => "description-update",
            Self::ContentDelta { .. } => "content-delta",
            Self::SidePayload(_) => "side-payload",
        }
    }
}

/// A payload that could not be turned into an event. The event is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum ParseWarning {
    #[snafu(display("event payload is empty"))]
    EmptyPayload,
    #[snafu(display("event payload is not valid JSON: {details}"))]
    InvalidJson { details: String },
    #[snafu(display("event payload is a JSON {kind}, expected an object"))]
    NotAnObject { kind: &'static str },
    #[snafu(display("identity assignment is missing `{missing}`"))]
    IncompleteIdentity { missing: &'static str },
    #[snafu(display("field `{field}` is invalid: {details}"))]
    InvalidField {
        field: &'static str,
        details: String,
    },
    #[snafu(display("event object carries no recognized fields"))]
    Unrecognized,
}

#[derive(Debug, Clone)]
pub struct EventParser {
    terminal_sentinel: String,
}

impl Default for EventParser {
    fn default() -> Self {
        Self::new(DEFAULT_TERMINAL_SENTINEL)
    }
}

impl EventParser {
    pub fn new(terminal_sentinel: impl Into<String>) -> Self {
        Self {
            terminal_sentinel: terminal_sentinel.into(),
        }
    }

    pub fn terminal_sentinel(&self) -> &str {
        &self.terminal_sentinel
    }

    pub fn parse(&self, raw: &str) -> Result<StreamEvent, ParseWarning> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ParseWarning::EmptyPayload);
        }
        if trimmed == self.terminal_sentinel {
            return Ok(StreamEvent::Terminal);
        }

        let value: Value = serde_json::from_str(trimmed).map_err(|error| {
            ParseWarning::InvalidJson {
                details: error.to_string(),
            }
        })?;
        match value {
            Value::Object(object) => classify(object),
            other => Err(ParseWarning::NotAnObject {
                kind: json_kind(&other),
            }),
        }
    }
}

fn classify(mut object: Map<String, Value>) -> Result<StreamEvent, ParseWarning> {
    if let Some(error) = take_present(&mut object, "error") {
        let message = match error {
            Value::String(message) => message,
            other => other.to_string(),
        };
        return Ok(StreamEvent::Error(message));
    }

    match take_present(&mut object, "main_response_complete") {
        Some(Value::Bool(true)) => return Ok(StreamEvent::MainResponseComplete),
        Some(Value::Bool(false)) | None => {}
        Some(other) => {
            return Err(ParseWarning::InvalidField {
                field: "main_response_complete",
                details: format!("expected a boolean, got a JSON {}", json_kind(&other)),
            });
        }
    }

    if let Some(progress) = take_present(&mut object, "progress") {
        return parse_progress(progress).map(StreamEvent::Progress);
    }

    let has_user = object.contains_key("user_message_id");
    let has_bot = object.contains_key("bot_message_id");
    if has_user || has_bot {
        return parse_identity(&object).map(StreamEvent::Identity);
    }
    if object.contains_key("conversation_id") {
        return Err(ParseWarning::IncompleteIdentity {
            missing: "user_message_id",
        });
    }

    if let Some(description) = take_present(&mut object, "conversation_description") {
        return match description {
            Value::String(description) if !description.trim().is_empty() => {
                Ok(StreamEvent::DescriptionUpdate(description.trim().to_string()))
            }
            _ => Err(ParseWarning::InvalidField {
                field: "conversation_description",
                details: "expected a non-empty string".to_string(),
            }),
        };
    }

    if let Some(response) = object.remove("response") {
        return match response {
            Value::String(delta) => {
                object.retain(|_, value| !value.is_null());
                let payload = (!object.is_empty()).then_some(object);
                Ok(StreamEvent::ContentDelta { delta, payload })
            }
            other => Err(ParseWarning::InvalidField {
                field: "response",
                details: format!("expected a string, got a JSON {}", json_kind(&other)),
            }),
        };
    }

    if object.is_empty() {
        return Err(ParseWarning::Unrecognized);
    }
    Ok(StreamEvent::SidePayload(object))
}

fn parse_progress(progress: Value) -> Result<ProgressUpdate, ParseWarning> {
    match progress {
        Value::String(message) => Ok(ProgressUpdate::new(message)),
        Value::Object(fields) => {
            let message = fields
                .get("message")
                .and_then(Value::as_str)
                .ok_or_else(|| ParseWarning::InvalidField {
                    field: "progress",
                    details: "structured progress needs a string `message`".to_string(),
                })?;
            Ok(ProgressUpdate {
                message: message.to_string(),
                tool_name: optional_string(&fields, "tool_name"),
                tool_category: optional_string(&fields, "tool_category"),
            })
        }
        other => Err(ParseWarning::InvalidField {
            field: "progress",
            details: format!("expected a string or object, got a JSON {}", json_kind(&other)),
        }),
    }
}

fn parse_identity(object: &Map<String, Value>) -> Result<IdentityAssignment, ParseWarning> {
    let user_message_id = required_message_id(object, "user_message_id")?;
    let bot_message_id = required_message_id(object, "bot_message_id")?;
    let messages = MessageIdentity {
        user_message_id,
        bot_message_id,
    };

    let Some(raw_conversation) = object.get("conversation_id").filter(|value| !value.is_null())
    else {
        return Ok(IdentityAssignment::ExistingConversation { messages });
    };
    let conversation_id = raw_conversation
        .as_str()
        .and_then(|raw| ConversationId::parse(raw).ok())
        .ok_or_else(|| ParseWarning::InvalidField {
            field: "conversation_id",
            details: "expected a non-empty string".to_string(),
        })?;

    Ok(IdentityAssignment::NewConversation {
        conversation_id,
        description: optional_string(object, "conversation_description")
            .map(|description| description.trim().to_string())
            .filter(|description| !description.is_empty()),
        messages,
    })
}

fn required_message_id(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<MessageId, ParseWarning> {
    let raw = object
        .get(field)
        .filter(|value| !value.is_null())
        .ok_or(ParseWarning::IncompleteIdentity { missing: field })?;
    raw.as_str()
        .and_then(|raw| MessageId::parse(raw).ok())
        .ok_or_else(|| ParseWarning::InvalidField {
            field,
            details: "expected a non-empty string".to_string(),
        })
}

fn take_present(object: &mut Map<String, Value>, field: &str) -> Option<Value> {
    object.remove(field).filter(|value| !value.is_null())
}

fn optional_string(object: &Map<String, Value>, field: &str) -> Option<String> {
    object
        .get(field)
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn parse(raw: &str) -> Result<StreamEvent, ParseWarning> {
        EventParser::default().parse(raw)
    }

    fn message_id(raw: &str) -> MessageId {
        MessageId::parse(raw).unwrap()
    }

    fn delta(text: &str) -> StreamEvent {
        StreamEvent::ContentDelta {
            delta: text.to_string(),
            payload: None,
        }
    }

    #[test]
    fn sentinel_closes_stream() {
        assert_eq!(parse(" [DONE] \n").unwrap(), StreamEvent::Terminal);
        assert_eq!(
            EventParser::new("<end>").parse("<end>").unwrap(),
            StreamEvent::Terminal
        );
        assert!(matches!(
            EventParser::new("<end>").parse("[DONE]"),
            Err(ParseWarning::InvalidJson { .. })
        ));
    }

    #[test]
    fn error_outranks_other_fields() {
        let event = parse(r#"{"error": "rate_limited", "response": "ignored"}"#).unwrap();
        assert_eq!(event, StreamEvent::Error("rate_limited".to_string()));

        let event = parse(r#"{"error": {"code": 429}}"#).unwrap();
        assert_eq!(event, StreamEvent::Error(r#"{"code":429}"#.to_string()));
    }

    #[test]
    fn main_response_complete_requires_true() {
        assert_eq!(
            parse(r#"{"main_response_complete": true}"#).unwrap(),
            StreamEvent::MainResponseComplete
        );
        assert_eq!(
            parse(r#"{"main_response_complete": false, "response": "x"}"#).unwrap(),
            delta("x")
        );
        assert!(matches!(
            parse(r#"{"main_response_complete": "yes"}"#),
            Err(ParseWarning::InvalidField { field: "main_response_complete", .. })
        ));
    }

    #[test]
    fn progress_accepts_both_shapes() {
        assert_eq!(
            parse(r#"{"progress": "Searching"}"#).unwrap(),
            StreamEvent::Progress(ProgressUpdate::new("Searching"))
        );
        assert_eq!(
            parse(r#"{"progress": {"message": "Running", "tool_name": "web", "tool_category": "search"}}"#)
                .unwrap(),
            StreamEvent::Progress(ProgressUpdate {
                message: "Running".to_string(),
                tool_name: Some("web".to_string()),
                tool_category: Some("search".to_string()),
            })
        );
        assert!(parse(r#"{"progress": {"tool_name": "web"}}"#).is_err());
    }

    #[test]
    fn identity_shapes_are_told_apart_by_conversation_id() {
        let event = parse(
            r#"{"conversation_id": "c1", "conversation_description": "Trip", "bot_message_id": "b1", "user_message_id": "u1"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            StreamEvent::Identity(IdentityAssignment::NewConversation {
                conversation_id: ConversationId::parse("c1").unwrap(),
                description: Some("Trip".to_string()),
                messages: MessageIdentity {
                    user_message_id: message_id("u1"),
                    bot_message_id: message_id("b1"),
                },
            })
        );

        let event = parse(r#"{"user_message_id": "u2", "bot_message_id": "b2"}"#).unwrap();
        assert_eq!(
            event,
            StreamEvent::Identity(IdentityAssignment::ExistingConversation {
                messages: MessageIdentity {
                    user_message_id: message_id("u2"),
                    bot_message_id: message_id("b2"),
                },
            })
        );
    }

    #[test]
    fn partial_identity_is_malformed() {
        assert_eq!(
            parse(r#"{"user_message_id": "u1"}"#),
            Err(ParseWarning::IncompleteIdentity {
                missing: "bot_message_id"
            })
        );
        assert_eq!(
            parse(r#"{"conversation_id": "c1"}"#),
            Err(ParseWarning::IncompleteIdentity {
                missing: "user_message_id"
            })
        );
        assert!(matches!(
            parse(r#"{"user_message_id": "", "bot_message_id": "b1"}"#),
            Err(ParseWarning::InvalidField { field: "user_message_id", .. })
        ));
    }

    #[test]
    fn lone_description_is_an_update() {
        assert_eq!(
            parse(r#"{"conversation_description": " Weekend plans "}"#).unwrap(),
            StreamEvent::DescriptionUpdate("Weekend plans".to_string())
        );
    }

    #[test]
    fn response_is_a_delta_and_is_not_trimmed() {
        assert_eq!(
            parse(r#"{"response": " lo\n"}"#).unwrap(),
            delta(" lo\n")
        );
        assert!(matches!(
            parse(r#"{"response": 7}"#),
            Err(ParseWarning::InvalidField { field: "response", .. })
        ));
    }

    #[test]
    fn fields_beside_a_delta_are_kept() {
        let event = parse(r#"{"response": "Here", "images": ["a.png"], "trace": null}"#).unwrap();

        let StreamEvent::ContentDelta { delta, payload } = event else {
            panic!("expected a content delta");
        };
        assert_eq!(delta, "Here");
        let payload = payload.unwrap();
        assert_eq!(payload.len(), 1);
        assert_eq!(payload["images"], json!(["a.png"]));
    }

    #[test]
    fn other_objects_become_side_payloads() {
        let StreamEvent::SidePayload(payload) = parse(r#"{"status": "generating_image"}"#).unwrap()
        else {
            panic!("expected side payload");
        };
        assert_eq!(payload.get("status"), Some(&json!("generating_image")));

        let StreamEvent::SidePayload(payload) =
            parse(r#"{"image_data": {"url": "https://img/1"}}"#).unwrap()
        else {
            panic!("expected side payload");
        };
        assert_eq!(payload["image_data"]["url"], json!("https://img/1"));
    }

    #[test]
    fn garbage_is_reported_not_swallowed() {
        assert!(matches!(parse("{oops"), Err(ParseWarning::InvalidJson { .. })));
        assert_eq!(
            parse("[1, 2]"),
            Err(ParseWarning::NotAnObject { kind: "array" })
        );
        assert_eq!(parse("{}"), Err(ParseWarning::Unrecognized));
        assert_eq!(parse("   "), Err(ParseWarning::EmptyPayload));
    }
}
