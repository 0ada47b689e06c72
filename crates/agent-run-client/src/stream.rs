use crate::errors::RunSessionError;

/// Events delivered by a run subscription.
#[derive(Clone, Debug, PartialEq)]
pub enum SubscriptionEvent {
    /// One content chunk, in the order the server sent it.
    Message(String),
    /// Terminal failure. The run may still be alive on the backend.
    Error(RunSessionError),
    /// The run finished and the stream closed cleanly.
    Closed,
}

impl SubscriptionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_) | Self::Closed)
    }
}

/// Callback form of a subscription, see
/// [`StreamManager::subscribe_with_callbacks`](crate::StreamManager::subscribe_with_callbacks).
pub trait SubscriptionCallbacks: Send + 'static {
    fn on_message(&mut self, content: String);
    fn on_error(&mut self, error: RunSessionError);
    fn on_close(&mut self);
}

/// Payload the server sends to end a run's stream.
pub(crate) const DONE_SENTINEL: &str = "[DONE]";

/// Result of interpreting one event payload.
#[derive(Debug, PartialEq)]
pub(crate) enum Frame {
    Done,
    Content(String),
    Ignored,
    Malformed(String),
}

pub(crate) fn parse_frame(data: &str) -> Frame {
    if data.trim() == DONE_SENTINEL {
        return Frame::Done;
    }
    match serde_json::from_str::<serde_json::Value>(data) {
        Ok(value) => match value.get("content").and_then(|v| v.as_str()) {
            Some(content) if !content.is_empty() => Frame::Content(content.to_string()),
            _ => Frame::Ignored,
        },
        Err(err) => Frame::Malformed(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_sentinel_tolerates_whitespace() {
        assert_eq!(parse_frame("[DONE]"), Frame::Done);
        assert_eq!(parse_frame("  [DONE]\n"), Frame::Done);
    }

    #[test]
    fn content_frames_and_ignored_shapes() {
        assert_eq!(
            parse_frame(r#"{"content":"hi","type":"assistant"}"#),
            Frame::Content("hi".into())
        );
        assert_eq!(parse_frame(r#"{"content":""}"#), Frame::Ignored);
        assert_eq!(parse_frame(r#"{"content":7}"#), Frame::Ignored);
        assert_eq!(parse_frame(r#"{"type":"status"}"#), Frame::Ignored);
        assert_eq!(parse_frame("[1,2]"), Frame::Ignored);
        assert!(matches!(parse_frame("garbage-not-json"), Frame::Malformed(_)));
    }
}
