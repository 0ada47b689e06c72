use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use futures::StreamExt as _;
use futures::stream;
use reqwest::header::{CACHE_CONTROL, HeaderValue};
use reqwest::multipart::{Form, Part};
use tracing::debug;

use crate::errors::RunSessionError;
use crate::transport::{
    ApiReply, ApiRequest, EventDataStream, FormPart, Method, RequestBody, RunTransport,
    StreamOpenFailure, TransportFailure, TransportFailureKind,
};

use super::config::BackendConfig;
use super::sse::EventDataDecoder;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static>>;

/// [`RunTransport`] over HTTP: JSON/multipart control-plane requests and a
/// server-sent event stream per run.
pub struct ReqwestTransport {
    client: reqwest::Client,
    config: BackendConfig,
}

impl ReqwestTransport {
    pub fn new(config: BackendConfig) -> Result<Self, RunSessionError> {
        if config.base_url.trim().is_empty() {
            return Err(RunSessionError::Config(
                "backend config base_url must not be empty".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| RunSessionError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Creates a transport from `AGENT_RUN_BACKEND_URL`.
    pub fn from_env() -> Result<Self, RunSessionError> {
        Self::new(BackendConfig::from_env()?)
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }
}

#[async_trait::async_trait]
impl RunTransport for ReqwestTransport {
    async fn execute(&self, request: ApiRequest) -> Result<ApiReply, TransportFailure> {
        let url = self.config.url(&request.path);
        let mut http_req = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        }
        .timeout(self.config.timeout)
        .header(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        if let Some(token) = &request.bearer {
            http_req = http_req.bearer_auth(token);
        }
        http_req = match request.body {
            RequestBody::Empty => http_req,
            RequestBody::Json(body) => http_req.json(&body),
            RequestBody::Multipart(parts) => http_req.multipart(build_form(parts)?),
        };

        debug!(method = %request.method, path = %request.path, event = "http.request", "sending backend request");
        let response = http_req.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let body = response.text().await.map_err(map_reqwest_error)?;
        debug!(method = %request.method, path = %request.path, status = status.as_u16(), event = "http.response", "backend replied");
        Ok(ApiReply {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            body,
        })
    }

    async fn open_event_stream(
        &self,
        path: &str,
        token: &str,
    ) -> Result<EventDataStream, StreamOpenFailure> {
        let response = self
            .client
            .get(self.config.url(path))
            .query(&[("token", token)])
            .header(reqwest::header::ACCEPT, HeaderValue::from_static("text/event-stream"))
            .send()
            .await
            .map_err(|e| StreamOpenFailure::Transport(map_reqwest_error(e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(StreamOpenFailure::Rejected(ApiReply::new(status.as_u16(), body)));
        }

        let bytes_stream: ByteStream = Box::pin(response.bytes_stream());
        Ok(Box::pin(event_data_stream(bytes_stream)))
    }
}

fn build_form(parts: Vec<FormPart>) -> Result<Form, TransportFailure> {
    let mut form = Form::new();
    for part in parts {
        form = match part {
            FormPart::Text { name, value } => form.text(name, value),
            FormPart::File {
                name,
                file_name,
                content_type,
                bytes,
            } => {
                let mut file = Part::bytes(bytes).file_name(file_name);
                if let Some(mime) = content_type {
                    file = file.mime_str(&mime).map_err(|e| {
                        TransportFailure::new(
                            TransportFailureKind::Other,
                            format!("invalid attachment content type {mime:?}: {e}"),
                        )
                    })?;
                }
                form.part(name, file)
            }
        };
    }
    Ok(form)
}

fn map_reqwest_error(error: reqwest::Error) -> TransportFailure {
    let kind = if error.is_connect() {
        TransportFailureKind::Connect
    } else if error.is_timeout() {
        TransportFailureKind::Timeout
    } else if error.is_body() || error.is_decode() {
        TransportFailureKind::Read
    } else {
        TransportFailureKind::Other
    };
    TransportFailure::new(kind, error.to_string())
}

/// Turns the raw response body into the `data` payload of each event.
fn event_data_stream(
    bytes_stream: ByteStream,
) -> impl futures::Stream<Item = Result<String, TransportFailure>> + Send {
    struct State {
        bytes_stream: ByteStream,
        decoder: EventDataDecoder,
        pending: VecDeque<String>,
        done: bool,
    }

    stream::try_unfold(
        State {
            bytes_stream,
            decoder: EventDataDecoder::default(),
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(data) = state.pending.pop_front() {
                    return Ok(Some((data, state)));
                }
                if state.done {
                    return Ok(None);
                }

                match state.bytes_stream.next().await {
                    Some(Ok(chunk)) => {
                        state.pending.extend(state.decoder.push_chunk(&chunk));
                    }
                    Some(Err(e)) => {
                        return Err(TransportFailure::new(
                            TransportFailureKind::Read,
                            format!("stream read failed: {e}"),
                        ));
                    }
                    None => {
                        state.pending.extend(state.decoder.finish());
                        state.done = true;
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&'static str]) -> ByteStream {
        let items: Vec<Result<bytes::Bytes, reqwest::Error>> = parts
            .iter()
            .copied()
            .map(|p| Ok(bytes::Bytes::from_static(p.as_bytes())))
            .collect();
        Box::pin(stream::iter(items))
    }

    #[tokio::test]
    async fn event_stream_yields_data_payloads_across_chunks() {
        let data: Vec<_> = event_data_stream(chunks(&[
            "data: {\"content\":\"a\"}\n\nda",
            "ta: garbage-not-json\n\n",
            "data: [DONE]\n\n",
        ]))
        .collect()
        .await;
        let data: Vec<String> = data.into_iter().map(|d| d.expect("data")).collect();
        assert_eq!(data, vec![r#"{"content":"a"}"#, "garbage-not-json", "[DONE]"]);
    }

    #[test]
    fn form_rejects_invalid_content_type() {
        let result = build_form(vec![FormPart::File {
            name: "files".into(),
            file_name: "a.txt".into(),
            content_type: Some("not a mime".into()),
            bytes: b"x".to_vec(),
        }]);
        assert!(matches!(
            result,
            Err(TransportFailure {
                kind: TransportFailureKind::Other,
                ..
            })
        ));
    }

    #[test]
    fn rejects_empty_base_url() {
        assert!(matches!(
            ReqwestTransport::new(BackendConfig::new(" ")),
            Err(RunSessionError::Config(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_connect_failure() {
        // Bind then release an ephemeral port so nothing is listening on it.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|listener| listener.local_addr())
            .expect("ephemeral port")
            .port();
        let transport =
            ReqwestTransport::new(BackendConfig::new(format!("http://127.0.0.1:{port}")))
                .expect("transport");
        let failure = transport
            .execute(ApiRequest::get("/health"))
            .await
            .expect_err("nothing listens there");
        assert_eq!(failure.kind, TransportFailureKind::Connect);
    }
}
