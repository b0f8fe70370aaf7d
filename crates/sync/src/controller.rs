//! Stream lifecycle: start, event application, stop/salvage and teardown.

use std::sync::Arc;

use snafu::OptionExt;
use tokio::sync::{mpsc, watch};
use tracing::{Instrument, Span};

use chatsync_storage::{
    ChatStore, ConversationId, ConversationPatch, ConversationRecord, MessageId, MessagePatch,
    MessageStatus, OptimisticId, RequestId,
};

use crate::backend::{ChatBackend, SalvageRequest, SendRequest, TransportItem, TransportStream};
use crate::builder::BotMessageBuilder;
use crate::error::{
    AlreadyInProgressSnafu, EmptyInputSnafu, NoActiveStreamSnafu, SyncError, SyncResult,
};
use crate::event::{EventParser, StreamEvent};
use crate::notice::{
    ComposerInput, FailureReason, NoticeReceiver, NoticeSender, StreamOutcome, SyncNotice, notify,
};
use crate::persistence::best_effort;
use crate::reconciler::{ConversationReconciler, ReconcileContext, ReconcileOutcome};
use crate::settings::SharedSettings;
use crate::tracker::OptimisticTracker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTicket {
    pub request_id: RequestId,
    pub user_message: OptimisticId,
    pub conversation_id: Option<ConversationId>,
}

/// Requests a stop of whatever stream [`StreamController::run`] is driving.
///
/// Requests made while no stream is active are ignored.
#[derive(Clone)]
pub struct StopHandle {
    stop_tx: Arc<watch::Sender<u64>>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        self.stop_tx
            .send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

struct ActiveStream {
    request_id: RequestId,
    input: ComposerInput,
    user_message: OptimisticId,
    /// Server id of the user message once identity is bound.
    confirmed_user: Option<MessageId>,
    transport: TransportStream,
    parser: EventParser,
    reconciler: ConversationReconciler,
    builder: BotMessageBuilder,
    span: Span,
}

impl ActiveStream {
    /// Id the user message currently lives under in the store.
    fn user_message_id(&self) -> MessageId {
        self.confirmed_user
            .clone()
            .unwrap_or_else(|| self.user_message.message_id())
    }
}

enum RunStep {
    Stop,
    Item(Option<TransportItem>),
}

/// Owns at most one active stream and every side effect it has.
pub struct StreamController {
    store: Arc<dyn ChatStore>,
    backend: Arc<dyn ChatBackend>,
    settings: SharedSettings,
    tracker: OptimisticTracker,
    notices: NoticeSender,
    active: Option<ActiveStream>,
    active_conversation: Option<ConversationId>,
    stop_tx: Arc<watch::Sender<u64>>,
    stop_rx: watch::Receiver<u64>,
}

impl StreamController {
    pub fn new(
        store: Arc<dyn ChatStore>,
        backend: Arc<dyn ChatBackend>,
        settings: SharedSettings,
    ) -> (Self, NoticeReceiver) {
        let snapshot = settings.load_full();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(0);
        let controller = Self {
            store,
            backend,
            tracker: OptimisticTracker::new(
                snapshot.resolution_cache_capacity,
                snapshot.resolution_cache_ttl(),
            ),
            settings,
            notices: notice_tx,
            active: None,
            active_conversation: None,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        };
        (controller, notice_rx)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop_tx: Arc::clone(&self.stop_tx),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_request(&self) -> Option<RequestId> {
        self.active.as_ref().map(|stream| stream.request_id)
    }

    /// In-memory reply of the active stream; ahead of or equal to the store.
    pub fn partial_reply(&self) -> Option<&str> {
        self.active.as_ref().map(|stream| stream.builder.content())
    }

    pub fn active_conversation(&self) -> Option<&ConversationId> {
        self.active_conversation.as_ref()
    }

    /// Conversation the next `start` sends into. An active stream keeps its own.
    pub fn set_active_conversation(&mut self, conversation_id: Option<ConversationId>) {
        self.active_conversation = conversation_id;
    }

    /// Confirmed id of a user message, if its identity has been bound.
    pub fn confirmed_user_message(
        &mut self,
        request_id: RequestId,
        user_message: OptimisticId,
    ) -> Option<MessageId> {
        let active = self.active.as_ref().filter(|stream| {
            stream.request_id == request_id && stream.user_message == user_message
        });
        match active {
            Some(stream) => stream.confirmed_user.clone(),
            None => self.tracker.confirmed_id(request_id, user_message),
        }
    }

    pub async fn start(&mut self, input: ComposerInput) -> SyncResult<StreamTicket> {
        if let Some(active) = &self.active {
            return AlreadyInProgressSnafu {
                stage: "start-check-active",
                request_id: active.request_id,
            }
            .fail();
        }
        snafu::ensure!(
            !input.is_blank(),
            EmptyInputSnafu {
                stage: "start-validate-input"
            }
        );

        let settings = self.settings.load_full();
        let request_id = RequestId::new_v7();
        let conversation_id = self.active_conversation.clone();
        let span = tracing::info_span!(
            "chat_stream",
            request_id = %request_id,
            conversation_id = conversation_id.as_ref().map(ConversationId::as_str),
        );

        let user_message = self
            .tracker
            .create_optimistic(
                self.store.as_ref(),
                request_id,
                &input.text,
                input.context.clone(),
                conversation_id.clone(),
            )
            .instrument(span.clone())
            .await;

        let request = SendRequest {
            request_id,
            text: input.text.clone(),
            conversation_id: conversation_id.clone(),
            context: input.context.clone(),
        };
        let transport = match self
            .backend
            .send_message(request)
            .instrument(span.clone())
            .await
        {
            Ok(transport) => transport,
            Err(source) => {
                span.in_scope(|| tracing::warn!(error = %source, "failed to open chat stream"));
                self.tracker
                    .discard(self.store.as_ref(), user_message)
                    .instrument(span.clone())
                    .await;
                notify(
                    &self.notices,
                    SyncNotice::Failed {
                        request_id,
                        reason: FailureReason::Transport,
                        message: source.to_string(),
                    },
                );
                notify(&self.notices, SyncNotice::RestoreInput(input));
                return Err(SyncError::TransportOpen {
                    stage: "start-open-transport",
                    source,
                });
            }
        };

        best_effort(
            "start-mark-sending",
            self.store
                .update_message_status(user_message.message_id(), MessageStatus::Sending),
        )
        .instrument(span.clone())
        .await;

        // Stop requests made before this stream existed do not apply to it.
        let _ = self.stop_rx.borrow_and_update();

        span.in_scope(|| tracing::info!("chat stream opened"));
        self.active = Some(ActiveStream {
            request_id,
            input,
            user_message,
            confirmed_user: None,
            transport,
            parser: EventParser::new(settings.terminal_sentinel.clone()),
            reconciler: ConversationReconciler::new(
                request_id,
                conversation_id.clone(),
                settings.placeholder_title.clone(),
            ),
            builder: BotMessageBuilder::new(conversation_id.clone()),
            span,
        });

        Ok(StreamTicket {
            request_id,
            user_message,
            conversation_id,
        })
    }

    /// Waits for and applies the next transport item.
    ///
    /// Returns the outcome once the stream has closed, `None` while it is open.
    pub async fn next(&mut self) -> SyncResult<Option<StreamOutcome>> {
        let stream = self.active.as_mut().context(NoActiveStreamSnafu {
            stage: "next-without-stream",
        })?;
        let item = stream.transport.recv().await;
        Ok(self.apply_item(item).await)
    }

    /// Drives the active stream to completion, honouring [`StopHandle`] requests.
    pub async fn run(&mut self) -> SyncResult<StreamOutcome> {
        loop {
            let step = {
                let Self {
                    active, stop_rx, ..
                } = self;
                let stream = active.as_mut().context(NoActiveStreamSnafu {
                    stage: "run-without-stream",
                })?;
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => RunStep::Stop,
                    item = stream.transport.recv() => RunStep::Item(item),
                }
            };

            match step {
                RunStep::Stop => {
                    return self.abort_and_salvage("stop-request").await.context(
                        NoActiveStreamSnafu {
                            stage: "run-stop-request",
                        },
                    );
                }
                RunStep::Item(item) => {
                    if let Some(outcome) = self.apply_item(item).await {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    /// Cancels the active stream and salvages the partial reply.
    ///
    /// A no-op returning `None` when nothing is streaming.
    pub async fn stop(&mut self) -> Option<StreamOutcome> {
        if self.active.is_none() {
            tracing::debug!("stop requested without an active stream");
            return None;
        }
        self.abort_and_salvage("stop").await
    }

    /// Same as [`StreamController::stop`]; for the owner going away.
    pub async fn teardown(&mut self) -> Option<StreamOutcome> {
        if self.active.is_none() {
            return None;
        }
        self.abort_and_salvage("teardown").await
    }

    async fn apply_item(&mut self, item: Option<TransportItem>) -> Option<StreamOutcome> {
        let span = self
            .active
            .as_ref()
            .map_or_else(Span::none, |stream| stream.span.clone());
        self.apply_item_in_span(item).instrument(span).await
    }

    async fn apply_item_in_span(&mut self, item: Option<TransportItem>) -> Option<StreamOutcome> {
        match item {
            None => {
                let stream = self.active.take()?;
                Some(self.finish_clean(stream, "transport-closed").await)
            }
            Some(TransportItem::Failed(message)) => {
                let stream = self.active.take()?;
                Some(
                    self.finish_failed(stream, FailureReason::Transport, message)
                        .await,
                )
            }
            Some(TransportItem::Event(raw)) => {
                let event = self.parse(&raw)?;
                match event {
                    StreamEvent::Terminal => {
                        let stream = self.active.take()?;
                        Some(self.finish_clean(stream, "terminal-sentinel").await)
                    }
                    StreamEvent::Error(message) => {
                        let stream = self.active.take()?;
                        Some(
                            self.finish_failed(stream, FailureReason::ServerSignaled, message)
                                .await,
                        )
                    }
                    event => {
                        self.apply_event(event).await;
                        None
                    }
                }
            }
        }
    }

    fn parse(&self, raw: &str) -> Option<StreamEvent> {
        let stream = self.active.as_ref()?;
        match stream.parser.parse(raw) {
            Ok(event) => Some(event),
            Err(warning) => {
                tracing::warn!(warning = %warning, "skipping malformed stream event");
                None
            }
        }
    }

    /// Applies an event that leaves the stream open.
    async fn apply_event(&mut self, event: StreamEvent) {
        let Self {
            store,
            tracker,
            notices,
            active,
            active_conversation,
            ..
        } = self;
        let Some(stream) = active.as_mut() else {
            return;
        };
        let store: &dyn ChatStore = &**store;

        match event {
            StreamEvent::ContentDelta { delta, payload } => {
                stream.builder.append_delta(store, &delta).await;
                if let Some(payload) = payload {
                    stream.builder.merge_payload(store, payload).await;
                }
            }
            StreamEvent::SidePayload(payload) => {
                stream.builder.merge_payload(store, payload).await;
            }
            StreamEvent::MainResponseComplete => {
                stream.builder.mark_main_response_complete();
                notify(
                    notices,
                    SyncNotice::MainResponseComplete {
                        request_id: stream.request_id,
                    },
                );
            }
            StreamEvent::Progress(update) => notify(
                notices,
                SyncNotice::Progress {
                    request_id: stream.request_id,
                    update,
                },
            ),
            StreamEvent::Identity(assignment) => {
                let context = ReconcileContext {
                    store,
                    tracker,
                    builder: &mut stream.builder,
                    user_message: stream.user_message,
                };
                let outcome = stream.reconciler.apply_identity(context, assignment).await;
                if let ReconcileOutcome::Bound {
                    conversation_id,
                    user_message,
                    created_conversation,
                    navigate_to,
                } = outcome
                {
                    tracing::info!(
                        conversation_id = conversation_id.as_ref().map(ConversationId::as_str),
                        user_message = %user_message,
                        created_conversation,
                        "stream identity bound"
                    );
                    stream.confirmed_user = Some(user_message);
                    if let Some(conversation_id) = navigate_to {
                        *active_conversation = Some(conversation_id.clone());
                        notify(notices, SyncNotice::NavigateTo(conversation_id));
                    }
                }
            }
            StreamEvent::DescriptionUpdate(description) => {
                stream.reconciler.apply_description(store, description).await;
            }
            StreamEvent::Terminal | StreamEvent::Error(_) => {
                tracing::debug!(kind = event.kind(), "closing event routed to apply_event");
            }
        }
    }

    /// Cooperative abort: ask the transport to close, apply whatever already
    /// arrived, then salvage.
    async fn abort_and_salvage(&mut self, trigger: &'static str) -> Option<StreamOutcome> {
        let span = self.active.as_mut().map(|stream| {
            stream.transport.cancel();
            stream.span.clone()
        })?;

        async {
            tracing::info!(trigger, "stopping chat stream");
            while let Some(item) = self
                .active
                .as_mut()
                .and_then(|stream| stream.transport.try_recv())
            {
                let TransportItem::Event(raw) = item else {
                    break;
                };
                match self.parse(&raw) {
                    Some(StreamEvent::Terminal) => {
                        let Some(stream) = self.active.take() else {
                            return None;
                        };
                        return Some(self.finish_clean(stream, "terminal-while-stopping").await);
                    }
                    Some(StreamEvent::Error(message)) => {
                        tracing::debug!(error = %message, "error event while stopping ignored");
                        break;
                    }
                    Some(event) => self.apply_event(event).await,
                    None => {}
                }
            }

            let Some(stream) = self.active.take() else {
                return None;
            };
            Some(self.salvage(stream, trigger).await)
        }
        .instrument(span)
        .await
    }

    async fn finish_clean(&mut self, stream: ActiveStream, trigger: &'static str) -> StreamOutcome {
        if !stream.reconciler.is_bound() {
            tracing::warn!(trigger, "stream closed before identity assignment");
            return self.salvage(stream, trigger).await;
        }
        self.complete(stream, trigger).await
    }

    async fn complete(&mut self, mut stream: ActiveStream, trigger: &'static str) -> StreamOutcome {
        stream.reconciler.close();
        let store = self.store.as_ref();

        stream.builder.finalize(store, MessageStatus::Sent).await;
        let user_message = stream.user_message_id();
        best_effort(
            "complete-user-status",
            store.update_message_status(user_message, MessageStatus::Sent),
        )
        .await;

        let conversation_id = stream.reconciler.bound_conversation().cloned();
        if let Some(conversation_id) = &conversation_id {
            best_effort(
                "complete-touch-conversation",
                store.update_conversation_fields(conversation_id.clone(), ConversationPatch::touch()),
            )
            .await;
        }

        let outcome = StreamOutcome::Completed {
            conversation_id,
            bot_message_id: stream.builder.current_id(),
            content: stream.builder.content().to_string(),
        };
        tracing::info!(
            trigger,
            deltas = stream.builder.delta_count(),
            "chat stream completed"
        );
        self.close_with(stream.request_id, outcome)
    }

    async fn finish_failed(
        &mut self,
        mut stream: ActiveStream,
        reason: FailureReason,
        message: String,
    ) -> StreamOutcome {
        if reason == FailureReason::Transport
            && stream.builder.main_response_complete()
            && stream.reconciler.is_bound()
        {
            tracing::warn!(error = %message, "transport failed after main response, keeping reply");
            return self.complete(stream, "transport-failed-after-main-response").await;
        }

        stream.reconciler.close();
        stream.transport.cancel();
        let store = self.store.as_ref();

        if !self.tracker.discard(store, stream.user_message).await {
            let user_message = stream.user_message_id();
            best_effort(
                "fail-user-status",
                store.update_message_status(user_message, MessageStatus::Error),
            )
            .await;
        }
        if stream.builder.is_bound() {
            stream.builder.finalize(store, MessageStatus::Error).await;
        } else {
            stream.builder.discard(store).await;
        }

        match reason {
            FailureReason::ServerSignaled => {
                tracing::error!(error = %message, "server reported a stream error");
            }
            FailureReason::Transport => {
                tracing::error!(error = %message, "chat stream transport failed");
            }
        }
        notify(
            &self.notices,
            SyncNotice::Failed {
                request_id: stream.request_id,
                reason,
                message: message.clone(),
            },
        );
        notify(&self.notices, SyncNotice::RestoreInput(stream.input.clone()));

        self.close_with(stream.request_id, StreamOutcome::Failed { reason, message })
    }

    async fn salvage(&mut self, mut stream: ActiveStream, trigger: &'static str) -> StreamOutcome {
        stream.reconciler.close();
        stream.transport.cancel();
        let store = self.store.as_ref();
        let content = stream.builder.content().to_string();

        if !stream.builder.has_content() {
            if stream.reconciler.is_bound() {
                stream.builder.finalize(store, MessageStatus::Incomplete).await;
                let user_message = stream.user_message_id();
                best_effort(
                    "salvage-empty-user-status",
                    store.update_message_status(user_message, MessageStatus::Incomplete),
                )
                .await;
            } else {
                self.tracker.discard(store, stream.user_message).await;
                stream.builder.discard(store).await;
                notify(&self.notices, SyncNotice::RestoreInput(stream.input.clone()));
            }
            tracing::info!(trigger, "chat stream aborted with nothing to salvage");
            return self.close_with(
                stream.request_id,
                StreamOutcome::Aborted {
                    salvaged: false,
                    content,
                },
            );
        }

        let request = SalvageRequest {
            request_id: stream.request_id,
            prompt_text: stream.input.text.clone(),
            conversation_id: stream.reconciler.conversation_id().cloned(),
            accumulated_text: content.clone(),
            context: stream.input.context.clone(),
        };
        let salvaged = match self.backend.save_incomplete_conversation(request).await {
            Ok(receipt) => {
                if let Some(conversation_id) = receipt.conversation_id.clone() {
                    self.adopt_salvaged_conversation(&mut stream, conversation_id)
                        .await;
                }
                notify(
                    &self.notices,
                    SyncNotice::SalvageSaved {
                        request_id: stream.request_id,
                        conversation_id: receipt.conversation_id,
                    },
                );
                true
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to save incomplete conversation");
                false
            }
        };

        let store = self.store.as_ref();
        stream.builder.finalize(store, MessageStatus::Incomplete).await;
        let user_message = stream.user_message_id();
        self.tracker.forget(stream.user_message);
        best_effort(
            "salvage-user-status",
            store.update_message_status(user_message, MessageStatus::Incomplete),
        )
        .await;

        tracing::info!(
            trigger,
            salvaged,
            chars = content.chars().count(),
            "chat stream aborted"
        );
        self.close_with(stream.request_id, StreamOutcome::Aborted { salvaged, content })
    }

    /// Files an unbound exchange under the conversation the server salvaged it into.
    async fn adopt_salvaged_conversation(
        &mut self,
        stream: &mut ActiveStream,
        conversation_id: ConversationId,
    ) {
        if stream.reconciler.bound_conversation().is_some() {
            return;
        }
        let store = self.store.as_ref();

        let existing = best_effort(
            "salvage-get-conversation",
            store.get_conversation(conversation_id.clone()),
        )
        .await;
        if !matches!(existing, Some(Some(_))) {
            let title = self.settings.load().placeholder_title.clone();
            best_effort(
                "salvage-create-conversation",
                store.put_conversation(ConversationRecord::new(conversation_id.clone(), title)),
            )
            .await;
        }

        let user_message = stream.user_message_id();
        best_effort(
            "salvage-attach-user-message",
            store.update_message(
                user_message,
                MessagePatch {
                    conversation_id: Some(conversation_id.clone()),
                    ..MessagePatch::default()
                },
            ),
        )
        .await;
        stream
            .builder
            .adopt_conversation(store, conversation_id.clone())
            .await;

        if self.active_conversation.is_none() {
            self.active_conversation = Some(conversation_id);
        }
    }

    fn close_with(&mut self, request_id: RequestId, outcome: StreamOutcome) -> StreamOutcome {
        notify(
            &self.notices,
            SyncNotice::Closed {
                request_id,
                outcome: outcome.clone(),
            },
        );
        outcome
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        if let Some(stream) = self.active.as_mut() {
            stream.transport.cancel();
            stream.span.in_scope(|| {
                tracing::warn!("controller dropped mid-stream without teardown, partial reply not salvaged");
            });
        }
    }
}
