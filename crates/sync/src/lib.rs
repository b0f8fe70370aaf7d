//! Streaming conversation synchronization.
//!
//! A [`StreamController`] consumes the event stream of one assistant reply,
//! binds optimistic local records to server identities, and mirrors the
//! growing reply into a [`chatsync_storage::ChatStore`].

pub mod backend;
pub mod builder;
pub mod cache;
pub mod controller;
pub mod error;
pub mod event;
pub mod notice;
mod persistence;
pub mod reconciler;
pub mod settings;
pub mod tracker;

pub use backend::{
    ChatBackend, SalvageReceipt, SalvageRequest, SendRequest, TransportError, TransportItem,
    TransportStream, make_transport_stream,
};
pub use builder::{BotMessageBuilder, merge_auxiliary};
pub use cache::ExpiringCache;
pub use controller::{StopHandle, StreamController, StreamTicket};
pub use error::{SyncError, SyncResult};
pub use event::{
    EventParser, IdentityAssignment, MessageIdentity, ParseWarning, ProgressUpdate, StreamEvent,
};
pub use notice::{ComposerInput, FailureReason, NoticeReceiver, StreamOutcome, SyncNotice};
pub use reconciler::{ConversationReconciler, ReconcileOutcome, ReconcilerState};
pub use settings::{SettingsError, SettingsStore, SharedSettings, SyncSettings, shared_settings};
pub use tracker::{OptimisticTracker, ResolveOutcome};
