use snafu::Snafu;

use chatsync_storage::{RequestId, StorageError};

use crate::backend::TransportError;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SyncError {
    #[snafu(display("a chat stream is already in progress (request {request_id})"))]
    AlreadyInProgress {
        stage: &'static str,
        request_id: RequestId,
    },
    #[snafu(display("refusing to send an empty message"))]
    EmptyInput { stage: &'static str },
    #[snafu(display("failed to open chat stream on `{stage}`: {source}"))]
    TransportOpen {
        stage: &'static str,
        source: TransportError,
    },
    #[snafu(display("no chat stream is active on `{stage}`"))]
    NoActiveStream { stage: &'static str },
    #[snafu(display("persistence failed on `{stage}`: {source}"))]
    Persistence {
        stage: &'static str,
        source: StorageError,
    },
}

impl SyncError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::AlreadyInProgress { stage, .. }
            | Self::EmptyInput { stage }
            | Self::TransportOpen { stage, .. }
            | Self::NoActiveStream { stage }
            | Self::Persistence { stage, .. } => stage,
        }
    }
}
