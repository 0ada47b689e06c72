//! Common imports for typical client usage.
pub use crate::{
    AgentRunRecord, InitiateRequest, RunId, RunSessionClient, RunSessionError, RunState,
    RunSubscription, StartOptions, SubscriptionCallbacks, SubscriptionEvent, ThreadId,
    UnsubscribeHandle,
};
