use std::sync::Arc;

use crate::backend::{BackendConfig, ReqwestTransport};
use crate::degraded::DegradedModeSimulator;
use crate::errors::RunSessionError;
use crate::lifecycle::RunLifecycleClient;
use crate::model::{
    AgentRunRecord, HealthStatus, InitiateRequest, InitiateResponse, RunId, StartOptions, ThreadId,
};
use crate::registry::ConnectionRegistry;
use crate::session::{EnvTokenProvider, SessionTokenProvider};
use crate::stream::SubscriptionCallbacks;
use crate::stream_manager::StreamManager;
use crate::subscription::{RunSubscription, UnsubscribeHandle};
use crate::terminal_cache::TerminalRunCache;
use crate::transport::RunTransport;

/// Entry point for controlling runs and following their output.
///
/// Lifecycle calls and streams share one terminal-run cache and one
/// connection registry, so a stopped run is never streamed afterwards.
#[derive(Clone)]
pub struct RunSessionClient {
    lifecycle: RunLifecycleClient,
    streams: StreamManager,
    cache: TerminalRunCache,
}

impl RunSessionClient {
    pub fn builder() -> RunSessionClientBuilder {
        RunSessionClientBuilder::default()
    }

    /// HTTP client configured from `AGENT_RUN_BACKEND_URL` with the token
    /// read from `AGENT_RUN_ACCESS_TOKEN`.
    pub fn from_env() -> Result<Self, RunSessionError> {
        let config = BackendConfig::from_env()?;
        Self::builder()
            .stream_buffer_capacity(config.stream_buffer_capacity)
            .transport(Arc::new(ReqwestTransport::new(config)?))
            .token_provider(Arc::new(EnvTokenProvider::default()))
            .build()
    }

    pub fn lifecycle(&self) -> &RunLifecycleClient {
        &self.lifecycle
    }

    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    pub fn cache(&self) -> &TerminalRunCache {
        &self.cache
    }

    pub async fn start(
        &self,
        thread_id: &ThreadId,
        options: &StartOptions,
    ) -> Result<RunId, RunSessionError> {
        self.lifecycle.start(thread_id, options).await
    }

    pub async fn stop(&self, run_id: &RunId) -> Result<(), RunSessionError> {
        self.lifecycle.stop(run_id).await
    }

    pub async fn get_status(&self, run_id: &RunId) -> Result<AgentRunRecord, RunSessionError> {
        self.lifecycle.get_status(run_id).await
    }

    pub async fn list_runs(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Vec<AgentRunRecord>, RunSessionError> {
        self.lifecycle.list_runs(thread_id).await
    }

    pub async fn initiate(
        &self,
        request: &InitiateRequest,
    ) -> Result<InitiateResponse, RunSessionError> {
        self.lifecycle.initiate(request).await
    }

    pub async fn health(&self) -> Result<HealthStatus, RunSessionError> {
        self.lifecycle.health().await
    }

    pub fn subscribe(&self, run_id: impl Into<RunId>) -> RunSubscription {
        self.streams.subscribe(run_id)
    }

    pub fn subscribe_with_callbacks<C: SubscriptionCallbacks>(
        &self,
        run_id: impl Into<RunId>,
        callbacks: C,
    ) -> UnsubscribeHandle {
        self.streams.subscribe_with_callbacks(run_id, callbacks)
    }

    /// Closes every open push connection. Returns how many were closed.
    pub fn shutdown(&self) -> usize {
        self.streams.close_all()
    }
}

/// Builder wiring a transport and token provider into a [`RunSessionClient`].
#[derive(Default)]
pub struct RunSessionClientBuilder {
    transport: Option<Arc<dyn RunTransport>>,
    tokens: Option<Arc<dyn SessionTokenProvider>>,
    simulator: Option<DegradedModeSimulator>,
    stream_buffer_capacity: Option<usize>,
}

impl RunSessionClientBuilder {
    pub fn transport(mut self, transport: Arc<dyn RunTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn token_provider(mut self, tokens: Arc<dyn SessionTokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Replaces the default degraded-mode timings (500 ms, then 1 s).
    pub fn degraded_simulator(mut self, simulator: DegradedModeSimulator) -> Self {
        self.simulator = Some(simulator);
        self
    }

    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.stream_buffer_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> Result<RunSessionClient, RunSessionError> {
        let transport = self
            .transport
            .ok_or_else(|| RunSessionError::Config("a run transport is required".into()))?;
        let tokens = self
            .tokens
            .ok_or_else(|| RunSessionError::Config("a session token provider is required".into()))?;
        if self.stream_buffer_capacity == Some(0) {
            return Err(RunSessionError::Config(
                "stream buffer capacity must be at least 1".into(),
            ));
        }

        let cache = TerminalRunCache::new();
        let mut streams = StreamManager::new(
            transport.clone(),
            tokens.clone(),
            cache.clone(),
            ConnectionRegistry::new(),
        )
        .with_degraded_simulator(self.simulator.unwrap_or_default());
        if let Some(capacity) = self.stream_buffer_capacity {
            streams = streams.with_buffer_capacity(capacity);
        }
        let lifecycle = RunLifecycleClient::new(transport, tokens, cache.clone(), streams.clone());
        Ok(RunSessionClient {
            lifecycle,
            streams,
            cache,
        })
    }
}
