use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::classifier::{Operation, classify_reply, classify_transport, is_transient_fault};
use crate::errors::RunSessionError;
use crate::model::{
    AgentRunRecord, HealthStatus, InitiateRequest, InitiateResponse, RunId, StartOptions, ThreadId,
};
use crate::session::SessionTokenProvider;
use crate::stream_manager::StreamManager;
use crate::terminal_cache::TerminalRunCache;
use crate::transport::{ApiReply, ApiRequest, FormPart, RunTransport};

#[derive(Deserialize)]
struct StartReply {
    agent_run_id: RunId,
}

#[derive(Deserialize)]
struct RunsReply {
    /// Absent or `null` both mean the thread has no runs yet.
    #[serde(default)]
    agent_runs: Option<Vec<AgentRunRecord>>,
}

/// Control-plane calls for agent runs: start, stop, status and listing.
///
/// Each call is a single attempt. Terminal runs are remembered in the shared
/// [`TerminalRunCache`] so later status checks short-circuit locally.
#[derive(Clone)]
pub struct RunLifecycleClient {
    transport: Arc<dyn RunTransport>,
    tokens: Arc<dyn SessionTokenProvider>,
    cache: TerminalRunCache,
    streams: StreamManager,
}

impl RunLifecycleClient {
    pub fn new(
        transport: Arc<dyn RunTransport>,
        tokens: Arc<dyn SessionTokenProvider>,
        cache: TerminalRunCache,
        streams: StreamManager,
    ) -> Self {
        Self {
            transport,
            tokens,
            cache,
            streams,
        }
    }

    /// Starts a run on `thread_id`.
    ///
    /// A transient server fault does not fail the call: a degraded run id is
    /// returned instead, and subscribing to it plays a local apology.
    pub async fn start(
        &self,
        thread_id: &ThreadId,
        options: &StartOptions,
    ) -> Result<RunId, RunSessionError> {
        let token = self.token().await?;
        let body = serde_json::to_value(options)
            .map_err(|e| RunSessionError::Config(format!("invalid start options: {e}")))?;
        let request = ApiRequest::post(format!("/thread/{thread_id}/agent/start"))
            .bearer(token)
            .json(body);
        debug!(thread_id = %thread_id, event = "run.starting", "starting agent run");

        let reply = self.send(request).await?;
        if !reply.is_success() {
            if is_transient_fault(reply.status) {
                let run_id = RunId::degraded();
                warn!(thread_id = %thread_id, run_id = %run_id, status = reply.status, event = "run.degraded", "backend fault on start, continuing with degraded run");
                return Ok(run_id);
            }
            return Err(classify_reply(Operation::Start, None, &reply));
        }

        let started: StartReply = parse_body(&reply)?;
        debug!(thread_id = %thread_id, run_id = %started.agent_run_id, event = "run.started", "agent run started");
        Ok(started.agent_run_id)
    }

    /// Stops a run.
    ///
    /// The run is marked terminal and its stream closed before the request is
    /// sent; a failed request is reported but the local marking stays.
    pub async fn stop(&self, run_id: &RunId) -> Result<(), RunSessionError> {
        self.cache.mark_terminal(run_id);
        self.streams.close(run_id);
        if run_id.is_degraded() {
            debug!(run_id = %run_id, event = "run.stopped", "stopped degraded run locally");
            return Ok(());
        }

        let token = self.token().await?;
        let request = ApiRequest::post(format!("/agent-run/{run_id}/stop")).bearer(token);
        let reply = self.send(request).await?;
        if !reply.is_success() {
            return Err(classify_reply(Operation::Stop, Some(run_id), &reply));
        }
        debug!(run_id = %run_id, event = "run.stopped", "agent run stopped");
        Ok(())
    }

    /// Fetches the backend's record of a run.
    ///
    /// Runs already known to be terminal fail with `NotRunning` without a
    /// request. 404/403 and terminal states are remembered.
    pub async fn get_status(&self, run_id: &RunId) -> Result<AgentRunRecord, RunSessionError> {
        if self.cache.is_terminal(run_id) || run_id.is_degraded() {
            debug!(run_id = %run_id, event = "run.status_short_circuit", "run known not to be running");
            return Err(RunSessionError::not_running(run_id));
        }

        let token = self.token().await?;
        let reply = self
            .send(ApiRequest::get(format!("/agent-run/{run_id}")).bearer(token))
            .await?;
        if !reply.is_success() {
            let error = classify_reply(Operation::Status, Some(run_id), &reply);
            if matches!(error, RunSessionError::NotFoundOrDenied { .. }) {
                self.cache.mark_terminal(run_id);
            }
            return Err(error);
        }

        let record: AgentRunRecord = parse_body(&reply)?;
        if record.state.is_terminal() {
            self.cache.mark_terminal(run_id);
        }
        debug!(run_id = %run_id, state = %record.state, event = "run.status", "fetched run status");
        Ok(record)
    }

    /// Lists every run of a thread. Never cached.
    pub async fn list_runs(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Vec<AgentRunRecord>, RunSessionError> {
        let token = self.token().await?;
        let reply = self
            .send(ApiRequest::get(format!("/thread/{thread_id}/agent-runs")).bearer(token))
            .await?;
        if !reply.is_success() {
            return Err(classify_reply(Operation::ListRuns, None, &reply));
        }
        let runs: RunsReply = parse_body(&reply)?;
        Ok(runs.agent_runs.unwrap_or_default())
    }

    /// Creates a thread from a first prompt (with optional attachments) and
    /// starts its first run.
    pub async fn initiate(
        &self,
        request: &InitiateRequest,
    ) -> Result<InitiateResponse, RunSessionError> {
        let token = self.token().await?;
        let parts = initiate_form(request);
        debug!(files = request.files.len(), event = "run.initiating", "initiating agent");
        let reply = self
            .send(ApiRequest::post("/agent/initiate").bearer(token).multipart(parts))
            .await?;
        if !reply.is_success() {
            return Err(classify_reply(Operation::Initiate, None, &reply));
        }
        parse_body(&reply)
    }

    /// Unauthenticated liveness probe.
    pub async fn health(&self) -> Result<HealthStatus, RunSessionError> {
        let reply = self.send(ApiRequest::get("/health")).await?;
        if !reply.is_success() {
            return Err(classify_reply(Operation::Health, None, &reply));
        }
        parse_body(&reply)
    }

    async fn token(&self) -> Result<String, RunSessionError> {
        self.tokens
            .access_token()
            .await
            .ok_or(RunSessionError::Unauthenticated)
    }

    async fn send(&self, request: ApiRequest) -> Result<ApiReply, RunSessionError> {
        let method = request.method;
        let path = request.path.clone();
        self.transport.execute(request).await.map_err(|failure| {
            debug!(%method, path = %path, kind = ?failure.kind, error = %failure, event = "http.transport_failed", "request failed before a reply");
            classify_transport(&failure)
        })
    }
}

fn parse_body<T: DeserializeOwned>(reply: &ApiReply) -> Result<T, RunSessionError> {
    serde_json::from_str(&reply.body).map_err(|e| RunSessionError::malformed(e.to_string()))
}

fn initiate_form(request: &InitiateRequest) -> Vec<FormPart> {
    let mut parts = vec![FormPart::Text {
        name: "prompt".into(),
        value: request.prompt.clone(),
    }];
    let options = &request.options;
    let mut text = |name: &str, value: String| {
        parts.push(FormPart::Text {
            name: name.into(),
            value,
        })
    };
    if let Some(model) = &options.model_name {
        text("model_name", model.clone());
    }
    if let Some(enabled) = options.enable_thinking {
        text("enable_thinking", enabled.to_string());
    }
    if let Some(effort) = options.reasoning_effort {
        text("reasoning_effort", effort.as_str().to_string());
    }
    if let Some(stream) = options.stream {
        text("stream", stream.to_string());
    }
    for file in &request.files {
        parts.push(FormPart::File {
            name: "files".into(),
            file_name: file.file_name.clone(),
            content_type: file.content_type.clone(),
            bytes: file.bytes.clone(),
        });
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attachment, ReasoningEffort, RunState};
    use crate::registry::ConnectionRegistry;
    use crate::session::StaticTokenProvider;
    use crate::test_support::FakeTransport;
    use crate::transport::{Method, RequestBody, TransportFailure, TransportFailureKind};

    fn client_with(
        transport: Arc<FakeTransport>,
        tokens: StaticTokenProvider,
    ) -> (RunLifecycleClient, TerminalRunCache, StreamManager) {
        let tokens: Arc<dyn SessionTokenProvider> = Arc::new(tokens);
        let cache = TerminalRunCache::new();
        let streams = StreamManager::new(
            transport.clone(),
            tokens.clone(),
            cache.clone(),
            ConnectionRegistry::new(),
        );
        let client = RunLifecycleClient::new(transport, tokens, cache.clone(), streams.clone());
        (client, cache, streams)
    }

    fn client(transport: Arc<FakeTransport>) -> (RunLifecycleClient, TerminalRunCache) {
        let (client, cache, _) = client_with(transport, StaticTokenProvider::new("tok"));
        (client, cache)
    }

    fn record(run_id: &str, status: &str) -> String {
        serde_json::json!({
            "id": run_id,
            "thread_id": "t-1",
            "status": status,
            "started_at": "2025-04-01T10:00:00Z",
            "completed_at": null,
            "responses": [{"role": "assistant", "content": "hi", "type": "assistant"}],
            "error": null
        })
        .to_string()
    }

    #[tokio::test]
    async fn start_posts_options_and_returns_run_id() {
        let transport = FakeTransport::new();
        transport.reply(ApiReply::new(200, r#"{"agent_run_id":"run-9"}"#));
        let (client, _) = client(transport.clone());

        let run_id = client
            .start(
                &ThreadId::new("t-1"),
                &StartOptions::default()
                    .model_name("sonnet")
                    .enable_thinking(true)
                    .reasoning_effort(ReasoningEffort::Low),
            )
            .await
            .expect("start");
        assert_eq!(run_id, RunId::new("run-9"));

        let sent = &transport.requests()[0];
        assert_eq!(sent.method, Method::Post);
        assert_eq!(sent.path, "/thread/t-1/agent/start");
        assert_eq!(sent.bearer.as_deref(), Some("tok"));
        assert_eq!(
            sent.body,
            RequestBody::Json(serde_json::json!({
                "model_name": "sonnet",
                "enable_thinking": true,
                "reasoning_effort": "low"
            }))
        );
    }

    #[tokio::test]
    async fn start_payment_required_is_billing_error() {
        let transport = FakeTransport::new();
        transport.reply(ApiReply::new(
            402,
            r#"{"detail":{"message":"upgrade required"}}"#,
        ));
        let (client, _) = client(transport);
        let err = client
            .start(&ThreadId::new("t-1"), &StartOptions::default())
            .await
            .expect_err("billing");
        let RunSessionError::BillingRequired(detail) = err else {
            panic!("expected billing error, got {err:?}");
        };
        assert_eq!(detail.message, "upgrade required");
    }

    #[tokio::test]
    async fn start_server_fault_returns_degraded_run() {
        let transport = FakeTransport::new();
        transport.reply(ApiReply::new(500, "boom"));
        let (client, _) = client(transport);
        let run_id = client
            .start(&ThreadId::new("t-1"), &StartOptions::default())
            .await
            .expect("degraded");
        assert!(run_id.is_degraded());
    }

    #[tokio::test]
    async fn start_other_failures_propagate() {
        let transport = FakeTransport::new();
        transport.reply(ApiReply::new(429, ""));
        transport.fail(TransportFailure::new(
            TransportFailureKind::Connect,
            "error trying to connect: dns error",
        ));
        transport.reply(ApiReply::new(200, r#"{"unexpected":true}"#));
        let (client, _) = client(transport);
        let thread = ThreadId::new("t-1");
        let options = StartOptions::default();

        assert_eq!(
            client.start(&thread, &options).await,
            Err(RunSessionError::RequestFailed {
                status: 429,
                status_text: "Too Many Requests".into()
            })
        );
        assert!(matches!(
            client.start(&thread, &options).await,
            Err(RunSessionError::ConnectivityError { .. })
        ));
        assert!(matches!(
            client.start(&thread, &options).await,
            Err(RunSessionError::MalformedPayload { .. })
        ));
    }

    #[tokio::test]
    async fn calls_without_session_are_unauthenticated() {
        let transport = FakeTransport::new();
        let (client, _, _) = client_with(transport.clone(), StaticTokenProvider::signed_out());
        assert_eq!(
            client
                .start(&ThreadId::new("t-1"), &StartOptions::default())
                .await,
            Err(RunSessionError::Unauthenticated)
        );
        assert_eq!(
            client.list_runs(&ThreadId::new("t-1")).await,
            Err(RunSessionError::Unauthenticated)
        );
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn terminal_status_is_memoized() {
        for (status, state) in [
            ("completed", RunState::Completed),
            ("stopped", RunState::Stopped),
            ("error", RunState::Error),
        ] {
            let transport = FakeTransport::new();
            transport.reply(ApiReply::new(200, record("run-1", status)));
            let (client, cache) = client(transport.clone());
            let run = RunId::new("run-1");

            let first = client.get_status(&run).await.expect("status");
            assert_eq!(first.state, state);
            assert!(cache.is_terminal(&run), "{status} should be cached");

            assert_eq!(
                client.get_status(&run).await,
                Err(RunSessionError::NotRunning { run_id: run.clone() })
            );
            assert_eq!(transport.request_count(), 1);
        }
    }

    #[tokio::test]
    async fn running_status_is_not_cached() {
        let transport = FakeTransport::new();
        transport.reply(ApiReply::new(200, record("run-1", "running")));
        transport.reply(ApiReply::new(200, record("run-1", "running")));
        let (client, cache) = client(transport.clone());
        let run = RunId::new("run-1");
        client.get_status(&run).await.expect("first");
        client.get_status(&run).await.expect("second");
        assert!(!cache.is_terminal(&run));
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn status_not_found_or_denied_is_cached() {
        for status in [404, 403] {
            let transport = FakeTransport::new();
            transport.reply(ApiReply::new(status, ""));
            let (client, cache) = client(transport.clone());
            let run = RunId::new("run-1");

            assert_eq!(
                client.get_status(&run).await,
                Err(RunSessionError::NotFoundOrDenied {
                    run_id: run.clone(),
                    status
                })
            );
            assert!(cache.is_terminal(&run));
            assert!(matches!(
                client.get_status(&run).await,
                Err(RunSessionError::NotRunning { .. })
            ));
            assert_eq!(transport.request_count(), 1);
        }
    }

    #[tokio::test]
    async fn status_transport_failure_is_not_cached() {
        let transport = FakeTransport::new();
        transport.fail(TransportFailure::new(TransportFailureKind::Timeout, "timed out"));
        let (client, cache) = client(transport);
        let run = RunId::new("run-1");
        assert!(matches!(
            client.get_status(&run).await,
            Err(RunSessionError::Transport { .. })
        ));
        assert!(!cache.is_terminal(&run));
    }

    #[tokio::test]
    async fn stop_marks_terminal_even_when_backend_rejects() {
        let transport = FakeTransport::new();
        transport.reply(ApiReply::new(502, ""));
        let (client, cache) = client(transport.clone());
        let run = RunId::new("run-1");

        let result = client.stop(&run).await;
        assert!(matches!(
            result,
            Err(RunSessionError::RequestFailed { status: 502, .. })
        ));
        assert!(cache.is_terminal(&run));
        assert_eq!(transport.requests()[0].path, "/agent-run/run-1/stop");
    }

    #[tokio::test]
    async fn stop_closes_the_active_stream() {
        let transport = FakeTransport::new();
        transport.reply(ApiReply::new(200, ""));
        let (client, _, streams) = client_with(transport.clone(), StaticTokenProvider::new("tok"));
        let run = RunId::new("run-1");

        let mut sub = streams.subscribe(run.clone());
        crate::test_support::settle(|| {
            streams.connection_state(&run) == Some(crate::ConnectionState::Streaming)
        })
        .await;
        client.stop(&run).await.expect("stop");

        assert_eq!(streams.active_connections(), 0);
        assert_eq!(sub.next_event().await, None);
    }

    #[tokio::test]
    async fn degraded_runs_stay_local() {
        let transport = FakeTransport::new();
        let (client, cache) = client(transport.clone());
        let run = RunId::degraded();
        assert!(matches!(
            client.get_status(&run).await,
            Err(RunSessionError::NotRunning { .. })
        ));
        client.stop(&run).await.expect("stop");
        assert!(cache.is_terminal(&run));
        assert_eq!(transport.total_calls(), 0);
    }

    #[tokio::test]
    async fn list_runs_parses_and_defaults_to_empty() {
        let transport = FakeTransport::new();
        transport.reply(ApiReply::new(
            200,
            format!(r#"{{"agent_runs":[{}]}}"#, record("run-1", "stopped")),
        ));
        transport.reply(ApiReply::new(200, "{}"));
        transport.reply(ApiReply::new(200, r#"{"agent_runs":null}"#));
        transport.reply(ApiReply::new(500, ""));
        let (client, cache) = client(transport.clone());
        let thread = ThreadId::new("t-1");

        let runs = client.list_runs(&thread).await.expect("runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].state, RunState::Stopped);
        // Listing never feeds the terminal cache.
        assert!(cache.is_empty());
        assert!(client.list_runs(&thread).await.expect("missing").is_empty());
        assert!(client.list_runs(&thread).await.expect("null").is_empty());
        assert!(matches!(
            client.list_runs(&thread).await,
            Err(RunSessionError::RequestFailed { status: 500, .. })
        ));
        assert_eq!(transport.requests()[0].path, "/thread/t-1/agent-runs");
    }

    #[tokio::test]
    async fn initiate_sends_multipart_form() {
        let transport = FakeTransport::new();
        transport.reply(ApiReply::new(
            200,
            r#"{"thread_id":"t-2","agent_run_id":"run-3"}"#,
        ));
        let (client, _) = client(transport.clone());
        let response = client
            .initiate(
                &InitiateRequest::new("build a todo app")
                    .options(StartOptions::default().stream(true))
                    .attach(
                        Attachment::new("notes.txt", b"hello".to_vec()).content_type("text/plain"),
                    ),
            )
            .await
            .expect("initiate");
        assert_eq!(response.thread_id, ThreadId::new("t-2"));
        assert_eq!(response.agent_run_id, RunId::new("run-3"));

        let RequestBody::Multipart(parts) = &transport.requests()[0].body else {
            panic!("expected multipart body");
        };
        assert_eq!(
            parts[0],
            FormPart::Text {
                name: "prompt".into(),
                value: "build a todo app".into()
            }
        );
        assert!(parts.contains(&FormPart::Text {
            name: "stream".into(),
            value: "true".into()
        }));
        assert!(matches!(&parts[2], FormPart::File { file_name, .. } if file_name == "notes.txt"));
    }

    #[tokio::test]
    async fn initiate_does_not_mask_server_faults() {
        let transport = FakeTransport::new();
        transport.reply(ApiReply::new(500, ""));
        let (client, _) = client(transport);
        assert!(matches!(
            client.initiate(&InitiateRequest::new("hi")).await,
            Err(RunSessionError::RequestFailed { status: 500, .. })
        ));
    }

    #[tokio::test]
    async fn health_needs_no_token() {
        let transport = FakeTransport::new();
        transport.reply(ApiReply::new(
            200,
            r#"{"status":"ok","timestamp":"2025-04-01T10:00:00Z","instance_id":"i-1"}"#,
        ));
        let (client, _, _) = client_with(transport.clone(), StaticTokenProvider::signed_out());
        let health = client.health().await.expect("health");
        assert_eq!(health.status, "ok");
        assert_eq!(transport.requests()[0].bearer, None);
    }
}
