//! HTTP boundary between the session client and the backend.
//!
//! The lifecycle client and stream manager only speak this contract, so the
//! reqwest-backed implementation in [`crate::backend`] can be swapped for an
//! in-memory fake in tests.
use std::fmt;
use std::pin::Pin;

/// HTTP method of a control-plane request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
        })
    }
}

/// One part of a multipart form body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FormPart {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        content_type: Option<String>,
        bytes: Vec<u8>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Multipart(Vec<FormPart>),
}

/// A control-plane request, with its path relative to the backend base URL.
#[derive(Clone, Debug, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub bearer: Option<String>,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            bearer: None,
            body: RequestBody::Empty,
        }
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self {
            method: Method::Post,
            ..Self::get(path)
        }
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn multipart(mut self, parts: Vec<FormPart>) -> Self {
        self.body = RequestBody::Multipart(parts);
        self
    }
}

/// Raw reply to a control-plane request, whatever its status.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ApiReply {
    pub status: u16,
    pub status_text: String,
    pub body: String,
}

impl ApiReply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            status_text: canonical_reason(status).to_string(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

fn canonical_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        409 => "Conflict",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

/// Why a request never produced a reply.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportFailureKind {
    /// DNS resolution or TCP/TLS connect failed; the backend is unreachable.
    Connect,
    Timeout,
    /// The connection dropped while reading the body or stream.
    Read,
    Other,
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct TransportFailure {
    pub kind: TransportFailureKind,
    pub message: String,
}

impl TransportFailure {
    pub fn new(kind: TransportFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Why a push connection could not be opened.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StreamOpenFailure {
    /// The server answered with a non-success status.
    Rejected(ApiReply),
    Transport(TransportFailure),
}

/// `data` payloads of the server-sent events of one push connection, in
/// arrival order. Dropping the stream closes the connection.
pub type EventDataStream =
    Pin<Box<dyn futures::Stream<Item = Result<String, TransportFailure>> + Send + 'static>>;

/// Contract every backend transport implements.
#[async_trait::async_trait]
pub trait RunTransport: Send + Sync {
    /// Sends one request and returns the reply, success or not.
    async fn execute(&self, request: ApiRequest) -> Result<ApiReply, TransportFailure>;

    /// Opens the push connection at `path`, authenticated by `token` as a
    /// query parameter.
    async fn open_event_stream(
        &self,
        path: &str,
        token: &str,
    ) -> Result<EventDataStream, StreamOpenFailure>;
}
