//! HTTP backend for run sessions.
//!
//! Endpoint and timeout settings live here so the session client itself stays
//! transport-agnostic and testable against in-memory fakes.
mod adapter;
mod config;
mod sse;

pub use adapter::ReqwestTransport;
pub use config::{BACKEND_URL_VAR, BackendConfig, TIMEOUT_SECS_VAR};
