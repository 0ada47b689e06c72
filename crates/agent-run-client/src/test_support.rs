//! In-memory transport fakes shared by the unit tests.
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, stream};

use crate::transport::{
    ApiReply, ApiRequest, EventDataStream, RunTransport, StreamOpenFailure, TransportFailure,
};

/// How a scripted push connection behaves after its events are consumed.
pub(crate) enum StreamScript {
    /// Yields the events, then ends (server hung up).
    Finite(Vec<Result<String, TransportFailure>>),
    /// Yields the events, then stays open forever.
    HoldOpen(Vec<Result<String, TransportFailure>>),
    Reject(StreamOpenFailure),
}

#[derive(Default)]
pub(crate) struct FakeTransport {
    replies: Mutex<VecDeque<Result<ApiReply, TransportFailure>>>,
    streams: Mutex<VecDeque<StreamScript>>,
    requests: Mutex<Vec<ApiRequest>>,
    stream_opens: Mutex<Vec<(String, String)>>,
    log: Arc<Mutex<Vec<String>>>,
    next_stream: AtomicUsize,
    close_delay: Mutex<Option<Duration>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn reply(&self, reply: ApiReply) {
        self.replies.lock().unwrap().push_back(Ok(reply));
    }

    pub(crate) fn fail(&self, failure: TransportFailure) {
        self.replies.lock().unwrap().push_back(Err(failure));
    }

    pub(crate) fn stream(&self, script: StreamScript) {
        self.streams.lock().unwrap().push_back(script);
    }

    /// Makes every later stream block its dropping thread for `delay` before
    /// it counts as closed, like a connection slow to tear down.
    pub(crate) fn slow_close(&self, delay: Duration) {
        *self.close_delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// `(path, token)` of every push connection opened so far.
    pub(crate) fn stream_opens(&self) -> Vec<(String, String)> {
        self.stream_opens.lock().unwrap().clone()
    }

    /// `open:N` / `close:N` entries in the order they happened.
    pub(crate) fn connection_log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.request_count() + self.stream_opens().len()
    }
}

#[async_trait::async_trait]
impl RunTransport for FakeTransport {
    async fn execute(&self, request: ApiRequest) -> Result<ApiReply, TransportFailure> {
        let path = request.path.clone();
        self.requests.lock().unwrap().push(request);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("no scripted reply for {path}"))
    }

    async fn open_event_stream(
        &self,
        path: &str,
        token: &str,
    ) -> Result<EventDataStream, StreamOpenFailure> {
        self.stream_opens
            .lock()
            .unwrap()
            .push((path.to_string(), token.to_string()));
        let script = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(StreamScript::HoldOpen(Vec::new()));
        let inner: EventDataStream = match script {
            StreamScript::Reject(failure) => return Err(failure),
            StreamScript::Finite(events) => Box::pin(stream::iter(events)),
            StreamScript::HoldOpen(events) => {
                Box::pin(futures::StreamExt::chain(stream::iter(events), stream::pending()))
            }
        };
        let id = self.next_stream.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.lock().unwrap().push(format!("open:{id}"));
        Ok(Box::pin(LoggedStream {
            inner,
            id,
            log: self.log.clone(),
            close_delay: *self.close_delay.lock().unwrap(),
        }))
    }
}

struct LoggedStream {
    inner: EventDataStream,
    id: usize,
    log: Arc<Mutex<Vec<String>>>,
    close_delay: Option<Duration>,
}

impl Stream for LoggedStream {
    type Item = Result<String, TransportFailure>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for LoggedStream {
    fn drop(&mut self) {
        if let Some(delay) = self.close_delay {
            std::thread::sleep(delay);
        }
        if let Ok(mut log) = self.log.lock() {
            log.push(format!("close:{}", self.id));
        }
    }
}

pub(crate) fn data(frames: &[&str]) -> Vec<Result<String, TransportFailure>> {
    frames.iter().map(|f| Ok(f.to_string())).collect()
}

/// Polls `condition` on a short timer, for tests on the multi-threaded
/// runtime where yielding alone does not let other workers progress.
pub(crate) async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Yields to spawned tasks until `condition` holds.
pub(crate) async fn settle(condition: impl Fn() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
