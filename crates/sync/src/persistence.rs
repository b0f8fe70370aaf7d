use std::future::Future;

use snafu::ResultExt;

use chatsync_storage::StorageResult;

use crate::error::PersistenceSnafu;

/// Awaits a store write whose failure must not interrupt the stream.
///
/// The in-memory state stays authoritative for the rest of the stream, so a
/// failed write is logged and reported as `None`.
pub(crate) async fn best_effort<T>(
    stage: &'static str,
    write: impl Future<Output = StorageResult<T>>,
) -> Option<T> {
    match write.await.context(PersistenceSnafu { stage }) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::warn!(stage, error = %error, "store write failed, continuing in memory");
            None
        }
    }
}
