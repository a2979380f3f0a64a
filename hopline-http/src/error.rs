use thiserror::Error;

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(detail) => format!(" ({detail})"),
        None => String::new(),
    }
}

/// Errors produced by the HTTP engine.
///
/// Variants are `Clone` so an error can be both delivered through an
/// exchange's `error` event and inspected afterwards; OS errors are carried
/// as text rather than `io::Error` for that reason.
#[derive(Debug, Clone, Error)]
pub enum HttpError {
    /// Could not establish a connection to the origin.
    #[error("connection error: {0}")]
    Connect(String),

    /// The connect attempt timed out.
    #[error("connection timed out")]
    ConnectTimeout,

    /// No bytes arrived within the read timeout. The payload names the
    /// phase that timed out (`"connect"`, `"start"`, `"body"`).
    #[error("read timeout during {0}")]
    ReadTimeout(&'static str),

    /// The peer closed the connection before the message was complete.
    /// Carries the socket error that tore the connection down, when the
    /// transport reported one.
    #[error("server dropped the connection before the response was complete{}", detail_suffix(.0))]
    UpstreamClose(Option<String>),

    /// Unparseable request or status line.
    #[error("bad start line: {0}")]
    BadStartLine(String),

    /// Malformed header field.
    #[error("bad header: {0}")]
    BadHeader(String),

    /// The header block exceeded the configured limit.
    #[error("header block too large")]
    OversizedHeaders,

    /// Conflicting or malformed body framing (Content-Length problems,
    /// misplaced chunked coding).
    #[error("framing error: {0}")]
    Framing(String),

    /// Malformed chunked transfer coding.
    #[error("chunked encoding error: {0}")]
    Chunk(String),

    /// The connection closed in the middle of a framed message.
    #[error("unexpected end of message")]
    UnexpectedEof,

    /// Unrecognised HTTP version.
    #[error("unsupported HTTP version: {0}")]
    Version(String),

    /// A request carried a transfer coding other than identity or chunked.
    #[error("unknown request transfer coding: {0}")]
    TransferCoding(String),

    /// An HTTP/1.1 request arrived without a Host header.
    #[error("Host header required")]
    HostRequired,

    /// Unsupported or invalid URL.
    #[error("unsupported or invalid URL: {0}")]
    Url(String),
}

impl HttpError {
    /// Whether this kind of failure is eligible for automatic retry.
    /// Retry additionally requires an idempotent method, remaining attempt
    /// budget, and that no response byte has arrived; the per-incident
    /// recoverability the client reports to listeners is
    /// [`ExchangeError::client_recoverable`], not this predicate.
    pub(crate) fn retryable_kind(&self) -> bool {
        matches!(
            self,
            HttpError::Connect(_) | HttpError::ConnectTimeout | HttpError::ReadTimeout(_)
        )
    }

    /// The status a server sends when this error is detected while parsing
    /// a request, before any response has started. `None` closes without a
    /// response.
    pub fn server_status(&self) -> Option<(u16, &'static str)> {
        match self {
            HttpError::BadStartLine(_) | HttpError::BadHeader(_) | HttpError::Framing(_) => {
                Some((400, "Bad Request"))
            }
            HttpError::Chunk(_) => Some((400, "Bad Request")),
            HttpError::HostRequired => Some((400, "Bad Request")),
            HttpError::OversizedHeaders => Some((413, "Payload Too Large")),
            HttpError::Version(_) => Some((505, "HTTP Version Not Supported")),
            HttpError::TransferCoding(_) => Some((501, "Not Implemented")),
            _ => None,
        }
    }
}

/// Terminal failure delivered through a client exchange's `error` event.
///
/// `client_recoverable` reports whether the client could still recover
/// this exchange after the event. It is always `false` by the time a
/// listener sees it: failures that are recoverable (retryable kind,
/// idempotent method, no response byte seen, budget remaining) are
/// retried internally and never surface, and once `error` is emitted no
/// further events follow.
#[derive(Debug, Clone)]
pub struct ExchangeError {
    pub error: HttpError,
    pub client_recoverable: bool,
}

impl std::fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_failures_are_retryable_kinds() {
        assert!(HttpError::Connect("refused".into()).retryable_kind());
        assert!(HttpError::ConnectTimeout.retryable_kind());
        assert!(HttpError::ReadTimeout("start").retryable_kind());
    }

    #[test]
    fn protocol_errors_are_not_retryable() {
        assert!(!HttpError::Framing("dup".into()).retryable_kind());
        assert!(!HttpError::UpstreamClose(None).retryable_kind());
        assert!(!HttpError::OversizedHeaders.retryable_kind());
    }

    #[test]
    fn server_statuses_follow_error_kind() {
        assert_eq!(
            HttpError::OversizedHeaders.server_status(),
            Some((413, "Payload Too Large"))
        );
        assert_eq!(
            HttpError::Version("HTTP/0.9".into()).server_status(),
            Some((505, "HTTP Version Not Supported"))
        );
        assert_eq!(HttpError::UpstreamClose(None).server_status(), None);
    }

    #[test]
    fn upstream_close_display_includes_detail() {
        let bare = HttpError::UpstreamClose(None).to_string();
        let detailed =
            HttpError::UpstreamClose(Some("connection reset by peer".into())).to_string();
        assert!(!bare.contains('('));
        assert!(detailed.ends_with("(connection reset by peer)"), "{detailed}");
    }
}
