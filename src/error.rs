//! Crate-wide error type.
//!
//! Most of these never reach the consumer of a [`QueryCursor`](crate::session::QueryCursor):
//! transport and parse failures are contained inside the search worker and only
//! show up as an early end of the row sequence (and in the session's
//! [`SearchReport`](crate::session::SearchReport)). They are surfaced directly by
//! the `try_*` entry points and by strict authentication.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SearchError>;

#[derive(Debug, Error)]
pub enum SearchError {
    /// The configured service URI could not be parsed or has no host.
    #[error("invalid service endpoint '{uri}': {detail}")]
    InvalidEndpoint { uri: String, detail: String },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// Login failed before a session key could be obtained.
    #[error("authentication against {url} failed: {detail}")]
    Authentication { url: String, detail: String },

    /// The login reply was readable but carried no usable session key.
    #[error("login reply contained no session key{}", .message.as_deref().map(|m| format!(" ({m})")).unwrap_or_default())]
    MissingSessionKey { message: Option<String> },

    /// Network failure while sending a request or reading its body.
    #[error("transport failure talking to {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The service answered with a non-2xx status.
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    /// The search worker died before finishing (panic or runtime shutdown).
    #[error("search worker terminated abnormally: {0}")]
    Worker(String),

    /// A search request was built without search text.
    #[error("search string must not be empty")]
    EmptySearch,

    /// The session was cancelled while the caller was waiting on it.
    #[error("search session cancelled")]
    Cancelled,

    /// A cursor cannot be rewound; start a new query instead.
    #[error("query cursors are single-pass and cannot be reset")]
    ResetUnsupported,

    /// A configuration file could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SearchError {
    /// True when the error came from the network rather than from the caller.
    pub fn is_transport(&self) -> bool {
        matches!(self, SearchError::Transport { .. } | SearchError::Http { .. })
    }
}
