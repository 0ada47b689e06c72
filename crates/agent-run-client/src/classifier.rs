//! Maps raw replies and transport failures onto [`RunSessionError`].
//!
//! Everything here is pure: side effects such as terminal caching belong to
//! the callers.
use serde_json::Value;

use crate::errors::{BillingDetail, DEFAULT_BILLING_MESSAGE, RunSessionError};
use crate::model::RunId;
use crate::transport::{ApiReply, StreamOpenFailure, TransportFailure, TransportFailureKind};

/// The control-plane call a reply belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    Start,
    Stop,
    Status,
    ListRuns,
    Initiate,
    Health,
}

impl Operation {
    /// Run-scoped reads treat 404/403 as "this run is gone for good".
    fn reports_not_found(self) -> bool {
        matches!(self, Self::Status)
    }
}

/// Classifies a non-success reply.
pub fn classify_reply(
    operation: Operation,
    run_id: Option<&RunId>,
    reply: &ApiReply,
) -> RunSessionError {
    if reply.status == 402 {
        return RunSessionError::BillingRequired(billing_detail(&reply.body));
    }
    if let Some(run_id) = run_id
        && operation.reports_not_found()
        && is_not_found_or_denied(reply.status)
    {
        return RunSessionError::NotFoundOrDenied {
            run_id: run_id.clone(),
            status: reply.status,
        };
    }
    RunSessionError::RequestFailed {
        status: reply.status,
        status_text: reply.status_text.clone(),
    }
}

/// Classifies a request that never got a reply.
pub fn classify_transport(failure: &TransportFailure) -> RunSessionError {
    match failure.kind {
        TransportFailureKind::Connect => RunSessionError::ConnectivityError {
            detail: failure.message.clone(),
        },
        _ => RunSessionError::Transport {
            message: failure.message.clone(),
        },
    }
}

/// Classifies a failed push-connection open. Only 404/403 is definitive.
pub fn classify_stream_open(run_id: &RunId, failure: &StreamOpenFailure) -> RunSessionError {
    match failure {
        StreamOpenFailure::Rejected(reply) if is_not_found_or_denied(reply.status) => {
            RunSessionError::NotFoundOrDenied {
                run_id: run_id.clone(),
                status: reply.status,
            }
        }
        StreamOpenFailure::Rejected(reply) => RunSessionError::ConnectionError {
            message: format!(
                "stream request rejected: {} ({})",
                reply.status_text, reply.status
            ),
        },
        StreamOpenFailure::Transport(failure) => RunSessionError::ConnectionError {
            message: failure.message.clone(),
        },
    }
}

pub fn is_not_found_or_denied(status: u16) -> bool {
    status == 404 || status == 403
}

/// Server faults on `start` that the client masks with a degraded run.
pub fn is_transient_fault(status: u16) -> bool {
    status == 500
}

/// Extracts `detail` from a payment-required body, guaranteeing a non-empty
/// message whatever the body looks like.
pub fn billing_detail(body: &str) -> BillingDetail {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return BillingDetail::new(DEFAULT_BILLING_MESSAGE);
    };
    let Some(Value::Object(mut detail)) = value.get("detail").cloned() else {
        return BillingDetail::new(DEFAULT_BILLING_MESSAGE);
    };
    let message = match detail.remove("message") {
        Some(Value::String(message)) => message,
        _ => DEFAULT_BILLING_MESSAGE.to_string(),
    };
    let mut billing = BillingDetail::new(message);
    billing.extra = detail;
    billing
}
