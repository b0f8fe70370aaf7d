use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use snafu::{ResultExt, ensure};
use uuid::Uuid;

use super::error::{InvalidIdSnafu, InvalidUuidSnafu, StorageError, StorageResult};

/// Prefix that marks a message id as client-generated.
pub const OPTIMISTIC_ID_PREFIX: &str = "optimistic-";

// Server ids are opaque strings; the only guarantee we rely on is non-emptiness.
macro_rules! define_server_id {
    ($name:ident, $id_type:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: &str) -> StorageResult<Self> {
                let trimmed = raw.trim();
                ensure!(
                    !trimmed.is_empty(),
                    InvalidIdSnafu {
                        stage: "parse-server-id",
                        id_type: $id_type,
                        raw: raw.to_string(),
                        reason: "id must not be empty",
                    }
                );
                Ok(Self(trimmed.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = StorageError;

            fn from_str(raw: &str) -> StorageResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

// Local ids are UUIDv7 so they sort by creation time within a session.
macro_rules! define_local_id {
    ($name:ident, $id_type:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new_v7() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn parse(raw: &str) -> StorageResult<Self> {
                let parsed = Uuid::parse_str(raw).context(InvalidUuidSnafu {
                    stage: "parse-local-id",
                    id_type: $id_type,
                    raw: raw.to_string(),
                })?;
                Ok(Self(parsed))
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }
    };
}

define_server_id!(ConversationId, "conversation-id");
define_server_id!(MessageId, "message-id");
define_local_id!(OptimisticId, "optimistic-id");
define_local_id!(RequestId, "request-id");

impl MessageId {
    /// True when this id was minted locally and has not been confirmed by the server.
    pub fn is_optimistic(&self) -> bool {
        self.0.starts_with(OPTIMISTIC_ID_PREFIX)
    }

    /// Recovers the optimistic id embedded in a locally minted message id.
    pub fn optimistic_id(&self) -> Option<OptimisticId> {
        self.0
            .strip_prefix(OPTIMISTIC_ID_PREFIX)
            .and_then(|raw| OptimisticId::parse(raw).ok())
    }
}

impl OptimisticId {
    /// Store key under which the optimistic record lives until it is resolved.
    pub fn message_id(&self) -> MessageId {
        MessageId(format!("{OPTIMISTIC_ID_PREFIX}{}", self.0))
    }
}

impl From<OptimisticId> for MessageId {
    fn from(value: OptimisticId) -> Self {
        value.message_id()
    }
}
