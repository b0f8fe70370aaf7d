use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};

use super::{
    BoxFuture, ChatBackend, SalvageReceipt, SalvageRequest, SendRequest, TransportError,
    TransportItem, TransportResult, TransportStream, make_transport_stream,
};

/// What the backend delivers for one `send_message` call.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub items: Vec<TransportItem>,
    /// Keep the channel open after the last item, as a live connection would.
    pub hold_open: bool,
}

impl Script {
    pub fn events<I, S>(events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            items: events
                .into_iter()
                .map(|event| TransportItem::Event(event.into()))
                .collect(),
            hold_open: false,
        }
    }

    pub fn then_fail(mut self, message: impl Into<String>) -> Self {
        self.items.push(TransportItem::Failed(message.into()));
        self
    }

    pub fn held_open(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

#[derive(Default)]
struct ScriptedState {
    scripts: VecDeque<Script>,
    sends: Vec<SendRequest>,
    salvages: Vec<SalvageRequest>,
    salvage_receipt: SalvageReceipt,
    fail_salvage: bool,
    open_senders: Vec<mpsc::UnboundedSender<TransportItem>>,
    cancel_signals: Vec<(oneshot::Receiver<()>, bool)>,
}

/// In-process backend that replays queued scripts and records every call.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_script(&self, script: Script) -> &Self {
        self.with_state(|state| state.scripts.push_back(script));
        self
    }

    pub fn set_salvage_receipt(&self, receipt: SalvageReceipt) {
        self.with_state(|state| state.salvage_receipt = receipt);
    }

    pub fn fail_salvage(&self) {
        self.with_state(|state| state.fail_salvage = true);
    }

    /// Sends one more item on the most recently opened held-open stream.
    pub fn deliver(&self, item: TransportItem) -> bool {
        self.with_state(|state| {
            state
                .open_senders
                .last()
                .is_some_and(|sender| sender.send(item).is_ok())
        })
    }

    /// Closes every held-open stream.
    pub fn close_open_streams(&self) {
        self.with_state(|state| state.open_senders.clear());
    }

    pub fn sends(&self) -> Vec<SendRequest> {
        self.with_state(|state| state.sends.clone())
    }

    pub fn salvages(&self) -> Vec<SalvageRequest> {
        self.with_state(|state| state.salvages.clone())
    }

    /// Number of streams whose consumer cancelled or dropped them.
    pub fn cancelled_streams(&self) -> usize {
        self.with_state(|state| {
            for (signal, cancelled) in &mut state.cancel_signals {
                if !*cancelled && signal.try_recv().is_ok() {
                    *cancelled = true;
                }
            }
            state
                .cancel_signals
                .iter()
                .filter(|(_, cancelled)| *cancelled)
                .count()
        })
    }

    fn with_state<T>(&self, apply: impl FnOnce(&mut ScriptedState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        apply(&mut state)
    }
}

impl ChatBackend for ScriptedBackend {
    fn send_message<'a>(
        &'a self,
        request: SendRequest,
    ) -> BoxFuture<'a, TransportResult<TransportStream>> {
        Box::pin(async move {
            self.with_state(|state| {
                let Some(script) = state.scripts.pop_front() else {
                    return Err(TransportError::Unavailable {
                        stage: "scripted-send-message",
                        message: "no script queued".to_string(),
                    });
                };

                let (item_tx, stream, cancel_rx) = make_transport_stream(request.request_id);
                for item in script.items {
                    // The receiver is alive in `stream`, so this cannot fail.
                    let _ = item_tx.send(item);
                }
                if script.hold_open {
                    state.open_senders.push(item_tx);
                }
                state.cancel_signals.push((cancel_rx, false));
                state.sends.push(request);
                Ok(stream)
            })
        })
    }

    fn save_incomplete_conversation<'a>(
        &'a self,
        request: SalvageRequest,
    ) -> BoxFuture<'a, TransportResult<SalvageReceipt>> {
        Box::pin(async move {
            self.with_state(|state| {
                state.salvages.push(request);
                if state.fail_salvage {
                    return Err(TransportError::Unavailable {
                        stage: "scripted-save-incomplete",
                        message: "salvage endpoint unavailable".to_string(),
                    });
                }
                Ok(state.salvage_receipt.clone())
            })
        })
    }
}
