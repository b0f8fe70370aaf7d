use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tokio::sync::broadcast;

use super::error::{
    ConflictSnafu, CreateSqliteDirectorySnafu, DecodeJsonSnafu, EncodeJsonSnafu,
    InvariantViolationSnafu, NotFoundSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu,
    SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu, StorageError, StorageResult,
};
use super::ids::{ConversationId, MessageId};
use super::types::{
    AuxiliaryPayload, ConversationPatch, ConversationRecord, MessagePatch, MessageRecord,
    MessageRole, MessageStatus, SendContext, StoreChange, unix_timestamp_ms,
};
use super::{BoxFuture, ChatStore, STORE_CHANGE_CAPACITY, ensure_mutable, ensure_status_transition};

const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, status, context_json, auxiliary_json, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    database_url: String,
    changes: broadcast::Sender<StoreChange>,
}

impl SqliteStore {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // A single long-lived connection serializes writes and keeps `:memory:` databases alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        let (changes, _) = broadcast::channel(STORE_CHANGE_CAPACITY);
        Ok(Self {
            pool,
            database_url,
            changes,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    fn publish(&self, change: StoreChange) {
        let _ = self.changes.send(change);
    }
}

impl ChatStore for SqliteStore {
    fn put_conversation<'a>(
        &'a self,
        record: ConversationRecord,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO conversations (id, title, created_at, updated_at) VALUES (?, ?, ?, ?) ON CONFLICT(id) DO UPDATE SET title = excluded.title, updated_at = excluded.updated_at",
            )
            .bind(record.id.as_str())
            .bind(record.title.as_str())
            .bind(u64_to_i64(record.created_at_unix_ms, "conversation-put-created-at")?)
            .bind(u64_to_i64(record.updated_at_unix_ms, "conversation-put-updated-at")?)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-put-upsert",
            })?;

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
            let bump = patch.title.is_some() || patch.touch;
            let now = u64_to_i64(unix_timestamp_ms(), "conversation-update-now")?;
            let update_result = sqlx::query(
                "UPDATE conversations SET title = COALESCE(?, title), updated_at = CASE WHEN ? THEN MAX(updated_at, ?) ELSE updated_at END WHERE id = ?",
            )
            .bind(patch.title)
            .bind(bump)
            .bind(now)
            .bind(conversation_id.as_str())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-update-apply",
            })?;

            if update_result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "conversation-update-missing",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            }

            let row = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, title, created_at, updated_at FROM conversations WHERE id = ?",
            )
            .bind(conversation_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-update-load",
            })?
            .context(NotFoundSnafu {
                stage: "conversation-update-load-missing",
                entity: "conversation",
                id: conversation_id.to_string(),
            })?;

            self.publish(StoreChange::ConversationUpdated(conversation_id));
            conversation_row_to_record(row)
        })
    }

    fn get_conversation<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StorageResult<Option<ConversationRecord>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, title, created_at, updated_at FROM conversations WHERE id = ?",
            )
            .bind(conversation_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-get-query",
            })?;

            row.map(conversation_row_to_record).transpose()
        })
    }

    fn list_conversations<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, title, created_at, updated_at FROM conversations ORDER BY updated_at DESC, id DESC",
            )
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-list-query",
            })?;

            rows.into_iter().map(conversation_row_to_record).collect()
        })
    }

    fn put_message<'a>(
        &'a self,
        record: MessageRecord,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "message-put-begin",
            })?;

            if let Some(existing) = load_message(&mut tx, &record.id, "message-put-load").await? {
                ensure_mutable(&record.id, existing.status, "message-put-final")?;
            }

            let context_json = serde_json::to_string(&record.context).context(EncodeJsonSnafu {
                stage: "message-put-encode-context",
                field: "context",
            })?;
            let auxiliary_json =
                serde_json::to_string(&record.auxiliary).context(EncodeJsonSnafu {
                    stage: "message-put-encode-auxiliary",
                    field: "auxiliary",
                })?;

            // Upsert keeps seq and created_at of an existing row so ordering survives rewrites.
            sqlx::query(
                "INSERT INTO messages (id, conversation_id, role, content, status, context_json, auxiliary_json, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET conversation_id = excluded.conversation_id, role = excluded.role, content = excluded.content, status = excluded.status, context_json = excluded.context_json, auxiliary_json = excluded.auxiliary_json, updated_at = excluded.updated_at",
            )
            .bind(record.id.as_str())
            .bind(record.conversation_id.as_ref().map(ConversationId::as_str))
            .bind(record.role.as_str())
            .bind(record.content.as_str())
            .bind(record.status.as_str())
            .bind(context_json)
            .bind(auxiliary_json)
            .bind(u64_to_i64(record.created_at_unix_ms, "message-put-created-at")?)
            .bind(u64_to_i64(record.updated_at_unix_ms, "message-put-updated-at")?)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-put-upsert",
            })?;

            let stored = load_message(&mut tx, &record.id, "message-put-reload")
                .await?
                .context(InvariantViolationSnafu {
                    stage: "message-put-reload-missing",
                    details: format!("message '{}' vanished inside its own transaction", record.id),
                })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-put-commit",
            })?;

            self.publish(StoreChange::MessageUpserted(stored.id.clone()));
            Ok(stored)
        })
    }

    fn update_message<'a>(
        &'a self,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "message-update-begin",
            })?;

            let existing = load_message(&mut tx, &message_id, "message-update-load")
                .await?
                .context(NotFoundSnafu {
                    stage: "message-update-missing",
                    entity: "message",
                    id: message_id.to_string(),
                })?;
            ensure_mutable(&message_id, existing.status, "message-update-final")?;

            let auxiliary_json = patch
                .auxiliary
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context(EncodeJsonSnafu {
                    stage: "message-update-encode-auxiliary",
                    field: "auxiliary",
                })?;
            let now = u64_to_i64(unix_timestamp_ms(), "message-update-now")?;

            sqlx::query(
                "UPDATE messages SET content = COALESCE(?, content), auxiliary_json = COALESCE(?, auxiliary_json), conversation_id = COALESCE(?, conversation_id), updated_at = ? WHERE id = ?",
            )
            .bind(patch.content)
            .bind(auxiliary_json)
            .bind(patch.conversation_id.as_ref().map(ConversationId::as_str))
            .bind(now)
            .bind(message_id.as_str())
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-update-apply",
            })?;

            let updated = load_message(&mut tx, &message_id, "message-update-reload")
                .await?
                .context(NotFoundSnafu {
                    stage: "message-update-reload-missing",
                    entity: "message",
                    id: message_id.to_string(),
                })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-update-commit",
            })?;

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
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "message-status-begin",
            })?;

            let existing = load_message(&mut tx, &message_id, "message-status-load")
                .await?
                .context(NotFoundSnafu {
                    stage: "message-status-missing",
                    entity: "message",
                    id: message_id.to_string(),
                })?;
            ensure_status_transition(
                &message_id,
                existing.status,
                status,
                "message-status-transition",
            )?;

            let now = u64_to_i64(unix_timestamp_ms(), "message-status-now")?;
            sqlx::query("UPDATE messages SET status = ?, updated_at = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(now)
                .bind(message_id.as_str())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-status-apply",
                })?;

            let updated = load_message(&mut tx, &message_id, "message-status-reload")
                .await?
                .context(NotFoundSnafu {
                    stage: "message-status-reload-missing",
                    entity: "message",
                    id: message_id.to_string(),
                })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-status-commit",
            })?;

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
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "message-replace-begin",
            })?;

            if load_message(&mut tx, &to, "message-replace-load-target")
                .await?
                .is_some()
            {
                return ConflictSnafu {
                    stage: "message-replace-target-exists",
                    entity: "message",
                    details: format!("cannot replace '{from}': '{to}' already exists"),
                }
                .fail();
            }

            let now = u64_to_i64(unix_timestamp_ms(), "message-replace-now")?;
            let update_result = sqlx::query(
                "UPDATE messages SET id = ?, conversation_id = COALESCE(?, conversation_id), updated_at = ? WHERE id = ?",
            )
            .bind(to.as_str())
            .bind(conversation_id.as_ref().map(ConversationId::as_str))
            .bind(now)
            .bind(from.as_str())
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-replace-apply",
            })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-replace-commit",
            })?;

            if update_result.rows_affected() == 0 {
                return Ok(false);
            }

            self.publish(StoreChange::MessageReplaced { from, to });
            Ok(true)
        })
    }

    fn delete_message<'a>(&'a self, message_id: MessageId) -> BoxFuture<'a, StorageResult<bool>> {
        Box::pin(async move {
            let delete_result = sqlx::query("DELETE FROM messages WHERE id = ?")
                .bind(message_id.as_str())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-delete-apply",
                })?;

            let removed = delete_result.rows_affected() > 0;
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
            let mut connection = self.pool.acquire().await.context(SqliteQuerySnafu {
                stage: "message-get-acquire",
            })?;
            load_message(&mut connection, &message_id, "message-get-query").await
        })
    }

    fn list_messages<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, MessageRow>(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ? ORDER BY seq ASC"
            ))
            .bind(conversation_id.as_str())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-list-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    title: String,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    conversation_id: Option<String>,
    role: String,
    content: String,
    status: String,
    context_json: String,
    auxiliary_json: String,
    created_at: i64,
    updated_at: i64,
}

async fn load_message(
    connection: &mut SqliteConnection,
    message_id: &MessageId,
    stage: &'static str,
) -> StorageResult<Option<MessageRecord>> {
    let row = sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
    ))
    .bind(message_id.as_str())
    .fetch_optional(&mut *connection)
    .await
    .context(SqliteQuerySnafu { stage })?;

    row.map(message_row_to_record).transpose()
}

fn conversation_row_to_record(row: ConversationRow) -> StorageResult<ConversationRecord> {
    Ok(ConversationRecord {
        id: ConversationId::parse(&row.id)?,
        title: row.title,
        created_at_unix_ms: i64_to_u64(row.created_at, "conversation-row-created-at")?,
        updated_at_unix_ms: i64_to_u64(row.updated_at, "conversation-row-updated-at")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    let context: SendContext =
        serde_json::from_str(&row.context_json).context(DecodeJsonSnafu {
            stage: "message-row-context",
            field: "context",
        })?;
    let auxiliary: AuxiliaryPayload =
        serde_json::from_str(&row.auxiliary_json).context(DecodeJsonSnafu {
            stage: "message-row-auxiliary",
            field: "auxiliary",
        })?;

    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        conversation_id: row
            .conversation_id
            .as_deref()
            .map(ConversationId::parse)
            .transpose()?,
        role: MessageRole::parse(&row.role).context(InvariantViolationSnafu {
            stage: "message-row-role",
            details: format!("unknown message role '{}'", row.role),
        })?,
        content: row.content,
        status: MessageStatus::parse(&row.status).context(InvariantViolationSnafu {
            stage: "message-row-status",
            details: format!("unknown message status '{}'", row.status),
        })?,
        context,
        auxiliary,
        created_at_unix_ms: i64_to_u64(row.created_at, "message-row-created-at")?,
        updated_at_unix_ms: i64_to_u64(row.updated_at, "message-row-updated-at")?,
    })
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::ids::OptimisticId;
    use crate::types::Attachment;

    async fn open_temp_store() -> (tempfile::TempDir, SqliteStore) {
        let directory = tempfile::tempdir().unwrap();
        let location = directory.path().join("chat.db");
        let store = SqliteStore::open(location.to_str().unwrap()).await.unwrap();
        (directory, store)
    }

    fn message_id(raw: &str) -> MessageId {
        MessageId::parse(raw).unwrap()
    }

    fn conversation_id(raw: &str) -> ConversationId {
        ConversationId::parse(raw).unwrap()
    }

    #[test]
    fn database_urls_are_normalized() {
        assert_eq!(normalize_database_url(":memory:"), "sqlite::memory:");
        assert_eq!(normalize_database_url("sqlite://x.db"), "sqlite://x.db");
        assert_eq!(normalize_database_url("data/x.db"), "sqlite://data/x.db");
    }

    #[tokio::test]
    async fn message_context_and_auxiliary_survive_roundtrip() {
        let (_directory, store) = open_temp_store().await;
        let context = SendContext {
            attachments: vec![Attachment {
                name: "notes.pdf".to_string(),
                uri: "file:///tmp/notes.pdf".to_string(),
                mime_type: Some("application/pdf".to_string()),
                size_bytes: Some(1_024),
            }],
            tool: Some("web_search".to_string()),
            workflow: None,
            calendar_event: Some("evt-9".to_string()),
        };
        let mut auxiliary = AuxiliaryPayload::new();
        auxiliary.insert("image_data".to_string(), json!({ "url": "https://img" }));

        store
            .put_message(
                MessageRecord::new(message_id("u1"), MessageRole::User, "hello", MessageStatus::Pending)
                    .with_conversation(Some(conversation_id("c1")))
                    .with_context(context.clone())
                    .with_auxiliary(auxiliary.clone()),
            )
            .await
            .unwrap();

        let loaded = store.get_message(message_id("u1")).await.unwrap().unwrap();
        assert_eq!(loaded.context, context);
        assert_eq!(loaded.auxiliary, auxiliary);
        assert_eq!(loaded.conversation_id, Some(conversation_id("c1")));
    }

    #[tokio::test]
    async fn replace_keeps_position_and_rejects_existing_target() {
        let (_directory, store) = open_temp_store().await;
        let optimistic = OptimisticId::new_v7().message_id();
        store
            .put_message(
                MessageRecord::new(optimistic.clone(), MessageRole::User, "first", MessageStatus::Pending)
                    .with_conversation(Some(conversation_id("c1"))),
            )
            .await
            .unwrap();
        store
            .put_message(
                MessageRecord::new(message_id("b1"), MessageRole::Assistant, "second", MessageStatus::Sending)
                    .with_conversation(Some(conversation_id("c1"))),
            )
            .await
            .unwrap();

        assert!(
            store
                .replace_optimistic_message(optimistic.clone(), message_id("u1"), None)
                .await
                .unwrap()
        );
        let listed = store.list_messages(conversation_id("c1")).await.unwrap();
        let ids = listed.iter().map(|record| record.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["u1", "b1"]);

        let other = OptimisticId::new_v7().message_id();
        store
            .put_message(MessageRecord::new(other.clone(), MessageRole::User, "x", MessageStatus::Pending))
            .await
            .unwrap();
        let error = store
            .replace_optimistic_message(other, message_id("b1"), None)
            .await
            .unwrap_err();
        assert!(matches!(error, StorageError::Conflict { .. }));
    }

    #[tokio::test]
    async fn status_changes_follow_lifecycle_rules() {
        let (_directory, store) = open_temp_store().await;
        store
            .put_message(MessageRecord::new(message_id("b1"), MessageRole::Assistant, "", MessageStatus::Pending))
            .await
            .unwrap();

        store
            .update_message_status(message_id("b1"), MessageStatus::Sending)
            .await
            .unwrap();
        let error = store
            .update_message_status(message_id("b1"), MessageStatus::Pending)
            .await
            .unwrap_err();
        assert!(matches!(error, StorageError::Conflict { .. }));

        let sent = store
            .update_message_status(message_id("b1"), MessageStatus::Sent)
            .await
            .unwrap();
        assert_eq!(sent.status, MessageStatus::Sent);

        let error = store
            .put_message(MessageRecord::new(message_id("b1"), MessageRole::Assistant, "again", MessageStatus::Sending))
            .await
            .unwrap_err();
        assert!(matches!(error, StorageError::Conflict { .. }));
    }

    #[tokio::test]
    async fn conversation_updates_require_existing_row() {
        let (_directory, store) = open_temp_store().await;
        let error = store
            .update_conversation_fields(conversation_id("missing"), ConversationPatch::touch())
            .await
            .unwrap_err();
        assert!(matches!(error, StorageError::NotFound { .. }));

        store
            .put_conversation(ConversationRecord::new(conversation_id("c1"), ""))
            .await
            .unwrap();
        let renamed = store
            .update_conversation_fields(conversation_id("c1"), ConversationPatch::title("Trip plan"))
            .await
            .unwrap();
        assert_eq!(renamed.title, "Trip plan");
        assert_eq!(store.list_conversations().await.unwrap().len(), 1);
    }
}
