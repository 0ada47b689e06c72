use std::sync::RwLock;

/// Source of the bearer credential for authenticated calls.
///
/// Implementations may return `None` at any time (signed out, expired
/// session); callers then fail with `RunSessionError::Unauthenticated`.
#[async_trait::async_trait]
pub trait SessionTokenProvider: Send + Sync {
    async fn access_token(&self) -> Option<String>;
}

fn non_blank(token: Option<String>) -> Option<String> {
    token.filter(|t| !t.trim().is_empty())
}

/// In-memory token that the host application updates on sign-in/sign-out.
#[derive(Debug, Default)]
pub struct StaticTokenProvider {
    token: RwLock<Option<String>>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    /// A provider with no session.
    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn set_token(&self, token: Option<String>) {
        let mut guard = self.token.write().unwrap_or_else(|e| e.into_inner());
        *guard = token;
    }
}

#[async_trait::async_trait]
impl SessionTokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Option<String> {
        let guard = self.token.read().unwrap_or_else(|e| e.into_inner());
        non_blank(guard.clone())
    }
}

/// Reads the token from an environment variable on every call.
#[derive(Clone, Debug)]
pub struct EnvTokenProvider {
    var: String,
}

impl EnvTokenProvider {
    pub const DEFAULT_VAR: &'static str = "AGENT_RUN_ACCESS_TOKEN";

    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvTokenProvider {
    fn default() -> Self {
        Self::new(Self::DEFAULT_VAR)
    }
}

#[async_trait::async_trait]
impl SessionTokenProvider for EnvTokenProvider {
    async fn access_token(&self) -> Option<String> {
        non_blank(std::env::var(&self.var).ok())
    }
}
