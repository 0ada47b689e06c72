use agent_run_client::observability::init_observability;
use agent_run_client::prelude::*;
use tokio::sync::oneshot;

struct Printer {
    done: Option<oneshot::Sender<()>>,
}

impl SubscriptionCallbacks for Printer {
    fn on_message(&mut self, raw: String) {
        println!("{raw}");
    }

    fn on_error(&mut self, error: RunSessionError) {
        eprintln!("stream error: {error}");
        self.finish();
    }

    fn on_close(&mut self) {
        self.finish();
    }
}

impl Printer {
    fn finish(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), RunSessionError> {
    init_observability();
    let thread_id = std::env::args()
        .nth(1)
        .ok_or_else(|| RunSessionError::Config("usage: follow_run_callbacks <thread-id>".into()))?;

    let client = RunSessionClient::from_env()?;
    let run_id = client
        .start(&ThreadId::new(thread_id), &StartOptions::default().stream(true))
        .await?;

    let (done_tx, done_rx) = oneshot::channel();
    let handle = client.subscribe_with_callbacks(
        run_id,
        Printer {
            done: Some(done_tx),
        },
    );
    let _ = done_rx.await;
    handle.unsubscribe();
    Ok(())
}
