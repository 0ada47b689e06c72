use serde_json::{Map, Value};

use crate::model::RunId;

/// Message substituted when a billing reply carries no usable `detail.message`.
pub const DEFAULT_BILLING_MESSAGE: &str = "Payment Required";

/// User-facing text for a backend that cannot be reached at all.
pub const CONNECTIVITY_MESSAGE: &str = "Cannot connect to backend server. Please check your internet connection and make sure the backend is running.";

/// Structured `detail` payload of a payment-required reply.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BillingDetail {
    /// Always non-empty.
    pub message: String,
    /// Remaining `detail` fields, passed through untouched.
    #[serde(flatten, default)]
    pub extra: Map<String, Value>,
}

impl BillingDetail {
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            message: if message.trim().is_empty() {
                DEFAULT_BILLING_MESSAGE.to_string()
            } else {
                message
            },
            extra: Map::new(),
        }
    }
}

/// What the caller should offer the user after a failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UserAction {
    /// Present an upgrade path.
    Upgrade,
    /// Tell the user to check their connection or that the backend is down.
    CheckConnection,
    /// Generic retry affordance.
    Retry,
}

/// Every failure the session client can report.
///
/// Control-plane calls return it as their `Err`; stream subscriptions deliver
/// it as `SubscriptionEvent::Error`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RunSessionError {
    /// The backend requires a paid plan before starting the run (HTTP 402).
    #[error("{}", .0.message)]
    BillingRequired(BillingDetail),
    /// The run does not exist or belongs to someone else (HTTP 404/403).
    #[error("agent run {run_id} not found or access denied ({status})")]
    NotFoundOrDenied { run_id: RunId, status: u16 },
    /// The backend could not be reached (DNS or connect failure).
    #[error("{}", CONNECTIVITY_MESSAGE)]
    ConnectivityError { detail: String },
    /// Any other non-success HTTP status.
    #[error("request failed: {status_text} ({status})")]
    RequestFailed { status: u16, status_text: String },
    /// The push connection failed after it was requested.
    #[error("stream connection error: {message}")]
    ConnectionError { message: String },
    /// The run is already known to be finished; nothing was sent.
    #[error("agent run {run_id} is not running")]
    NotRunning { run_id: RunId },
    /// No session token was available.
    #[error("no access token available")]
    Unauthenticated,
    /// A success reply did not have the documented shape.
    #[error("malformed response payload: {message}")]
    MalformedPayload { message: String },
    /// Transport failure other than an unreachable backend (timeouts, reads).
    #[error("transport error: {message}")]
    Transport { message: String },
    /// Invalid client configuration.
    #[error("config error: {0}")]
    Config(String),
}

impl RunSessionError {
    pub fn user_action(&self) -> UserAction {
        match self {
            Self::BillingRequired(_) => UserAction::Upgrade,
            Self::ConnectivityError { .. } => UserAction::CheckConnection,
            _ => UserAction::Retry,
        }
    }

    pub(crate) fn not_running(run_id: &RunId) -> Self {
        Self::NotRunning {
            run_id: run_id.clone(),
        }
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedPayload {
            message: message.into(),
        }
    }
}
