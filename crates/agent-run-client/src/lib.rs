//! Client for starting, stopping and following background agent runs.
//!
//! The backend is reached through the [`RunTransport`] seam; the HTTP
//! implementation lives under [`backend`].
//!
//! # Usage
//!
//! ```no_run
//! use agent_run_client::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), RunSessionError> {
//! let client = RunSessionClient::from_env()?;
//!
//! let run_id = client
//!     .start(&ThreadId::new("thread-1"), &StartOptions::default().stream(true))
//!     .await?;
//!
//! let mut subscription = client.subscribe(run_id);
//! while let Some(event) = subscription.next_event().await {
//!     match event {
//!         SubscriptionEvent::Message(raw) => println!("{raw}"),
//!         SubscriptionEvent::Error(err) => eprintln!("{err}"),
//!         SubscriptionEvent::Closed => break,
//!     }
//! }
//! # Ok(())
//! # }
//! ```

/// HTTP transport and backend configuration.
pub mod backend;
/// Mapping of backend replies and transport failures to caller errors.
pub mod classifier;
/// Session client entry point and builder.
pub mod client;
/// Local stand-in stream for runs started while the backend was faulting.
pub mod degraded;
/// Public error types.
pub mod errors;
/// Start/stop/status/list control-plane calls.
pub mod lifecycle;
/// Run identifiers, records and request options.
pub mod model;
/// Process-wide tracing setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Live push connections keyed by run.
pub mod registry;
/// Bearer token providers.
pub mod session;
/// Subscription events and callback contract.
pub mod stream;
/// Push connection management.
pub mod stream_manager;
/// Subscription handles and cancellation.
pub mod subscription;
/// Memory of runs known to be finished.
pub mod terminal_cache;
/// Backend transport contract.
pub mod transport;

#[cfg(test)]
mod test_support;

pub use backend::{BackendConfig, ReqwestTransport};
pub use client::{RunSessionClient, RunSessionClientBuilder};
pub use degraded::DegradedModeSimulator;
pub use errors::{BillingDetail, RunSessionError, UserAction};
pub use lifecycle::RunLifecycleClient;
pub use model::{
    AgentRunRecord, Attachment, HealthStatus, InitiateRequest, InitiateResponse, Message,
    ReasoningEffort, RunId, RunState, StartOptions, ThreadId,
};
pub use registry::{ConnectionRegistry, ConnectionState};
pub use session::{EnvTokenProvider, SessionTokenProvider, StaticTokenProvider};
pub use stream::{SubscriptionCallbacks, SubscriptionEvent};
pub use stream_manager::StreamManager;
pub use subscription::{RunSubscription, UnsubscribeHandle};
pub use terminal_cache::TerminalRunCache;
pub use transport::{ApiReply, ApiRequest, RunTransport, TransportFailure};
