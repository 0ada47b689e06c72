use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::errors::RunSessionError;
use crate::model::RunId;
use crate::registry::ConnectionRegistry;
use crate::stream::{SubscriptionCallbacks, SubscriptionEvent};

/// One-shot cancellation flag shared by a subscription and the task feeding it.
#[derive(Clone, Debug)]
pub(crate) struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelSignal {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Returns true only for the call that flipped the flag.
    pub(crate) fn cancel(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the flag is set (immediately if it already is).
    pub(crate) async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

#[derive(Clone)]
struct Registration {
    registry: ConnectionRegistry,
    generation: u64,
}

/// Cancels a subscription. Cheap to clone, safe to call any number of times.
#[derive(Clone)]
pub struct UnsubscribeHandle {
    run_id: RunId,
    cancel: CancelSignal,
    registration: Option<Registration>,
}

impl UnsubscribeHandle {
    pub(crate) fn registered(
        run_id: RunId,
        cancel: CancelSignal,
        registry: ConnectionRegistry,
        generation: u64,
    ) -> Self {
        Self {
            run_id,
            cancel,
            registration: Some(Registration {
                registry,
                generation,
            }),
        }
    }

    pub(crate) fn unregistered(run_id: RunId, cancel: CancelSignal) -> Self {
        Self {
            run_id,
            cancel,
            registration: None,
        }
    }

    /// Closes the connection if it is still open and removes it from the
    /// registry. Never delivers anything to the subscriber.
    pub fn unsubscribe(&self) {
        if !self.cancel.cancel() {
            return;
        }
        if let Some(registration) = &self.registration {
            registration
                .registry
                .deregister(&self.run_id, registration.generation);
        }
        debug!(run_id = %self.run_id, event = "stream.unsubscribed", "subscription cancelled");
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }
}

/// Live subscription to one run's output.
///
/// Yields [`SubscriptionEvent`]s in arrival order and ends after the first
/// terminal event or once unsubscribed. Dropping it unsubscribes.
pub struct RunSubscription {
    rx: mpsc::Receiver<SubscriptionEvent>,
    handle: UnsubscribeHandle,
    finished: bool,
}

impl RunSubscription {
    pub(crate) fn new(rx: mpsc::Receiver<SubscriptionEvent>, handle: UnsubscribeHandle) -> Self {
        Self {
            rx,
            handle,
            finished: false,
        }
    }

    /// A subscription that yields `error` and nothing else.
    pub(crate) fn failed(run_id: RunId, error: RunSessionError) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(SubscriptionEvent::Error(error));
        Self::new(rx, UnsubscribeHandle::unregistered(run_id, CancelSignal::new()))
    }

    pub fn run_id(&self) -> &RunId {
        self.handle.run_id()
    }

    pub fn unsubscribe_handle(&self) -> UnsubscribeHandle {
        self.handle.clone()
    }

    pub fn unsubscribe(&self) {
        self.handle.unsubscribe();
    }

    /// Waits for the next event; `None` once the subscription has ended.
    pub async fn next_event(&mut self) -> Option<SubscriptionEvent> {
        if self.finished || self.handle.is_unsubscribed() {
            return None;
        }
        let event = tokio::select! {
            biased;
            _ = self.handle.cancel.cancelled() => None,
            event = self.rx.recv() => event,
        };
        match &event {
            Some(event) if event.is_terminal() => self.finished = true,
            Some(_) => {}
            None => self.finished = true,
        }
        event
    }

    /// Drives the subscription to its end, dispatching every event to
    /// `callbacks`. Stops without further calls once unsubscribed.
    ///
    /// The unsubscribed check runs immediately before each dispatch. An
    /// `unsubscribe` from another thread that lands after that check lets the
    /// one callback already being dispatched run; no later callback starts.
    /// Unsubscribing from inside a callback, or from the task that owns the
    /// subscription, never sees a further call.
    pub async fn deliver<C: SubscriptionCallbacks>(mut self, mut callbacks: C) {
        while let Some(event) = self.next_event().await {
            if self.handle.is_unsubscribed() {
                break;
            }
            match event {
                SubscriptionEvent::Message(content) => callbacks.on_message(content),
                SubscriptionEvent::Error(error) => callbacks.on_error(error),
                SubscriptionEvent::Closed => callbacks.on_close(),
            }
        }
    }
}

impl Drop for RunSubscription {
    fn drop(&mut self) {
        self.handle.unsubscribe();
    }
}
