use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::model::RunId;
use crate::stream::SubscriptionEvent;
use crate::subscription::{CancelSignal, RunSubscription, UnsubscribeHandle};

/// Text delivered in place of real output while the backend is faulting.
pub const DEGRADED_MESSAGE: &str = "I'm sorry, but the server is currently unavailable. This is a simulated response while we work on fixing the issue. Please try again later.";

/// Serves subscriptions for degraded run ids without touching the network:
/// one canned message after `message_delay`, then a clean close after a
/// further `close_delay`.
#[derive(Clone, Debug)]
pub struct DegradedModeSimulator {
    message_delay: Duration,
    close_delay: Duration,
}

impl Default for DegradedModeSimulator {
    fn default() -> Self {
        Self {
            message_delay: Duration::from_millis(500),
            close_delay: Duration::from_millis(1000),
        }
    }
}

impl DegradedModeSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delays(message_delay: Duration, close_delay: Duration) -> Self {
        Self {
            message_delay,
            close_delay,
        }
    }

    /// Schedules the canned sequence for `run_id`. Unsubscribing cancels any
    /// step that has not fired yet.
    pub fn simulate(&self, run_id: RunId) -> RunSubscription {
        debug!(run_id = %run_id, event = "stream.degraded_simulation", "simulating stream for degraded run");
        let cancel = CancelSignal::new();
        let (tx, rx) = mpsc::channel(2);
        let script = vec![
            (
                self.message_delay,
                SubscriptionEvent::Message(DEGRADED_MESSAGE.to_string()),
            ),
            (self.close_delay, SubscriptionEvent::Closed),
        ];
        tokio::spawn(play_script(script, tx, cancel.clone()));
        RunSubscription::new(rx, UnsubscribeHandle::unregistered(run_id, cancel))
    }
}

async fn play_script(
    script: Vec<(Duration, SubscriptionEvent)>,
    tx: mpsc::Sender<SubscriptionEvent>,
    cancel: CancelSignal,
) {
    for (delay, event) in script {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        if tx.send(event).await.is_err() {
            return;
        }
    }
}
