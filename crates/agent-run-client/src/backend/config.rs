use std::time::Duration;

use crate::errors::RunSessionError;

pub const BACKEND_URL_VAR: &str = "AGENT_RUN_BACKEND_URL";
pub const TIMEOUT_SECS_VAR: &str = "AGENT_RUN_TIMEOUT_SECS";

/// Where the run backend lives and how long control-plane calls may take.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendConfig {
    /// Base URL of the backend API, e.g. `https://api.example.com/api`.
    pub base_url: String,
    /// Per-request timeout for control-plane calls. Push connections are
    /// only bounded by the connect timeout.
    pub timeout: Duration,
    /// Events buffered per subscription before the connection task waits.
    pub stream_buffer_capacity: usize,
}

impl BackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(120),
            stream_buffer_capacity: 128,
        }
    }

    /// Builds a config from `AGENT_RUN_BACKEND_URL` and the optional
    /// `AGENT_RUN_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self, RunSessionError> {
        let base_url = std::env::var(BACKEND_URL_VAR).unwrap_or_default();
        let timeout = std::env::var(TIMEOUT_SECS_VAR).ok();
        Self::from_values(&base_url, timeout.as_deref())
    }

    fn from_values(base_url: &str, timeout_secs: Option<&str>) -> Result<Self, RunSessionError> {
        if base_url.trim().is_empty() {
            return Err(RunSessionError::Config(format!(
                "missing {BACKEND_URL_VAR} for the run backend"
            )));
        }
        let mut config = Self::new(base_url.trim());
        if let Some(raw) = timeout_secs.map(str::trim).filter(|s| !s.is_empty()) {
            let secs: u64 = raw.parse().map_err(|_| {
                RunSessionError::Config(format!(
                    "{TIMEOUT_SECS_VAR} must be whole seconds, got {raw:?}"
                ))
            })?;
            config = config.timeout(Duration::from_secs(secs));
        }
        Ok(config)
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.stream_buffer_capacity = capacity;
        self
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}
