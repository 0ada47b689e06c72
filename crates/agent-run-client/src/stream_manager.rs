use std::sync::Arc;

use futures::StreamExt as _;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::classifier::classify_stream_open;
use crate::degraded::DegradedModeSimulator;
use crate::errors::RunSessionError;
use crate::model::RunId;
use crate::registry::{ConnectionRegistry, ConnectionState, StreamConnection};
use crate::session::SessionTokenProvider;
use crate::stream::{Frame, SubscriptionCallbacks, SubscriptionEvent, parse_frame};
use crate::subscription::{CancelSignal, RunSubscription, UnsubscribeHandle};
use crate::terminal_cache::TerminalRunCache;
use crate::transport::RunTransport;

/// Owns the push connections of all runs and enforces one live connection
/// per run.
#[derive(Clone)]
pub struct StreamManager {
    transport: Arc<dyn RunTransport>,
    tokens: Arc<dyn SessionTokenProvider>,
    cache: TerminalRunCache,
    registry: ConnectionRegistry,
    degraded: DegradedModeSimulator,
    buffer_capacity: usize,
}

impl StreamManager {
    pub fn new(
        transport: Arc<dyn RunTransport>,
        tokens: Arc<dyn SessionTokenProvider>,
        cache: TerminalRunCache,
        registry: ConnectionRegistry,
    ) -> Self {
        Self {
            transport,
            tokens,
            cache,
            registry,
            degraded: DegradedModeSimulator::default(),
            buffer_capacity: 128,
        }
    }

    pub fn with_degraded_simulator(mut self, simulator: DegradedModeSimulator) -> Self {
        self.degraded = simulator;
        self
    }

    /// Bounded event buffer between a connection task and its subscriber.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity.max(1);
        self
    }

    /// Subscribes to the output of `run_id`.
    ///
    /// Never fails directly: every problem, including a run that is already
    /// known to be finished, arrives as a `SubscriptionEvent::Error`. Must be
    /// called from within a tokio runtime.
    pub fn subscribe(&self, run_id: impl Into<RunId>) -> RunSubscription {
        let run_id = run_id.into();
        if self.cache.is_terminal(&run_id) {
            debug!(run_id = %run_id, event = "stream.skipped_terminal", "not streaming a run known to be finished");
            let error = RunSessionError::not_running(&run_id);
            return RunSubscription::failed(run_id, error);
        }
        if run_id.is_degraded() {
            return self.degraded.simulate(run_id);
        }

        let generation = self.registry.next_generation();
        let cancel = CancelSignal::new();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Opening);
        let previous = self.registry.replace(
            run_id.clone(),
            StreamConnection {
                generation,
                cancel: cancel.clone(),
                state: state_rx,
            },
        );
        if previous.is_some() {
            debug!(run_id = %run_id, event = "stream.waiting_previous", "previous stream must close before a new one opens");
        }

        let (events_tx, events_rx) = mpsc::channel(self.buffer_capacity);
        let pump = ConnectionPump {
            run_id: run_id.clone(),
            generation,
            transport: self.transport.clone(),
            tokens: self.tokens.clone(),
            cache: self.cache.clone(),
            registry: self.registry.clone(),
            cancel: cancel.clone(),
            state: state_tx,
            events: events_tx,
            previous,
        };
        tokio::spawn(pump.run());

        let handle =
            UnsubscribeHandle::registered(run_id, cancel, self.registry.clone(), generation);
        RunSubscription::new(events_rx, handle)
    }

    /// Callback form of [`StreamManager::subscribe`]. The callbacks run on a
    /// spawned task. After the returned handle unsubscribes no new callback
    /// starts; see [`RunSubscription::deliver`] for the one dispatch that may
    /// race a cross-thread unsubscribe.
    pub fn subscribe_with_callbacks<C: SubscriptionCallbacks>(
        &self,
        run_id: impl Into<RunId>,
        callbacks: C,
    ) -> UnsubscribeHandle {
        let subscription = self.subscribe(run_id);
        let handle = subscription.unsubscribe_handle();
        tokio::spawn(subscription.deliver(callbacks));
        handle
    }

    /// Closes the connection for `run_id` without notifying its subscriber.
    pub fn close(&self, run_id: &RunId) -> bool {
        let closed = self.registry.close(run_id);
        if closed {
            debug!(run_id = %run_id, event = "stream.closed", "closed active stream");
        }
        closed
    }

    pub fn close_all(&self) -> usize {
        self.registry.close_all()
    }

    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    pub fn connection_state(&self, run_id: &RunId) -> Option<ConnectionState> {
        self.registry.state(run_id)
    }
}

enum PumpExit {
    Cancelled,
    Done,
    Failed {
        error: RunSessionError,
        terminal: bool,
    },
}

/// Task behind one registered connection.
struct ConnectionPump {
    run_id: RunId,
    generation: u64,
    transport: Arc<dyn RunTransport>,
    tokens: Arc<dyn SessionTokenProvider>,
    cache: TerminalRunCache,
    registry: ConnectionRegistry,
    cancel: CancelSignal,
    state: watch::Sender<ConnectionState>,
    events: mpsc::Sender<SubscriptionEvent>,
    previous: Option<watch::Receiver<ConnectionState>>,
}

impl ConnectionPump {
    async fn run(self) {
        let exit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => PumpExit::Cancelled,
            exit = self.stream() => exit,
        };

        // The event stream was owned by `stream()` and is closed by now. A task
        // cancelled while still waiting reports closed only after its
        // predecessor.
        self.previous_closed().await;
        self.registry.deregister(&self.run_id, self.generation);
        self.state.send_replace(ConnectionState::Closed);
        self.registry.retire(&self.run_id, self.generation);

        match exit {
            PumpExit::Cancelled => {}
            PumpExit::Done => {
                self.cache.mark_terminal(&self.run_id);
                debug!(run_id = %self.run_id, event = "stream.completed", "stream completed");
                self.emit(SubscriptionEvent::Closed).await;
            }
            PumpExit::Failed { error, terminal } => {
                if terminal {
                    self.cache.mark_terminal(&self.run_id);
                }
                debug!(run_id = %self.run_id, event = "stream.failed", error = %error, "stream failed");
                self.emit(SubscriptionEvent::Error(error)).await;
            }
        }
    }

    async fn previous_closed(&self) {
        if let Some(mut previous) = self.previous.clone() {
            // Sender gone means the previous task already finished.
            let _ = previous
                .wait_for(|state| *state == ConnectionState::Closed)
                .await;
        }
    }

    async fn stream(&self) -> PumpExit {
        self.previous_closed().await;

        let Some(token) = self.tokens.access_token().await else {
            return PumpExit::Failed {
                error: RunSessionError::Unauthenticated,
                terminal: false,
            };
        };

        let path = format!("/agent-run/{}/stream", self.run_id);
        debug!(run_id = %self.run_id, generation = self.generation, event = "stream.opening", "opening stream");
        let mut events = match self.transport.open_event_stream(&path, &token).await {
            Ok(events) => events,
            Err(failure) => {
                let error = classify_stream_open(&self.run_id, &failure);
                let terminal = matches!(error, RunSessionError::NotFoundOrDenied { .. });
                return PumpExit::Failed { error, terminal };
            }
        };
        self.state.send_replace(ConnectionState::Streaming);

        while let Some(item) = events.next().await {
            let data = match item {
                Ok(data) => data,
                Err(failure) => {
                    return PumpExit::Failed {
                        error: RunSessionError::ConnectionError {
                            message: failure.message,
                        },
                        terminal: false,
                    };
                }
            };
            match parse_frame(&data) {
                Frame::Done => return PumpExit::Done,
                Frame::Content(content) => {
                    if !self.emit(SubscriptionEvent::Message(content)).await {
                        return PumpExit::Cancelled;
                    }
                }
                Frame::Ignored => {}
                Frame::Malformed(reason) => {
                    warn!(run_id = %self.run_id, event = "stream.malformed_frame", reason = %reason, data = %data, "ignoring malformed stream message");
                }
            }
        }

        PumpExit::Failed {
            error: RunSessionError::ConnectionError {
                message: "stream ended before completion".into(),
            },
            terminal: false,
        }
    }

    /// Delivers `event` unless the subscriber has gone away.
    async fn emit(&self, event: SubscriptionEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }
}
