//! Error types.
//!
//! Two classes of failure exist. Configuration errors ([`ConfigError`]) are
//! raised while a [`Router`](crate::Router) is being built and abort the
//! build. Request errors never escape as `Error`s at all: the dispatcher turns
//! them into 4xx/5xx responses and the router keeps serving.

use http::Method;

/// The error type returned by restive's fallible operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid socket address `{addr}`: {source}")]
    Address {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A service declaration that cannot be turned into a router.
///
/// Every variant names the declared field it was raised for, so a broken
/// declaration can be fixed without guessing.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("service `{service}` declares no anchor; its first field must be the service anchor")]
    MissingAnchor { service: &'static str },

    #[error("service `{service}`: the anchor must be the 1st field, found it at position {position}")]
    MisplacedAnchor { service: &'static str, position: usize },

    #[error("service `{service}` declares more than one anchor")]
    DuplicateAnchor { service: &'static str },

    #[error("field `{field}` is declared more than once")]
    DuplicateField { field: String },

    #[error("field `{field}`: malformed tag at byte {offset}: {reason}")]
    MalformedTag { field: String, offset: usize, reason: &'static str },

    #[error("field `{field}`: unknown tag key `{key}`")]
    UnknownTag { field: String, key: String },

    #[error("field `{field}`: tag key `{key}` given more than once")]
    DuplicateTag { field: String, key: String },

    #[error("field `{field}`: missing required tag `{key}`")]
    MissingTag { field: String, key: &'static str },

    #[error("field `{field}`: invalid method `{method}`")]
    InvalidMethod { field: String, method: String },

    #[error("field `{field}`: invalid path pattern `{pattern}`: {source}")]
    InvalidPattern {
        field: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("field `{field}` ({method}): no handler named `{handler}`")]
    UnresolvedHandler { field: String, method: Method, handler: String },

    #[error("field `{field}` ({method}): handler `{handler}` is a {found} but the field is a {expected}")]
    HandlerKind {
        field: String,
        method: Method,
        handler: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error(
        "field `{field}` ({method}): handler `{handler}` takes {params} path argument(s) \
         but the path captures {captures}"
    )]
    Arity {
        field: String,
        method: Method,
        handler: String,
        params: usize,
        captures: usize,
    },

    #[error("handler `{handler}` is registered more than once")]
    DuplicateHandler { handler: String },

    #[error("field `{field}`: no marshaller registered for mime `{mime}`")]
    UnknownMime { field: String, mime: String },

    #[error("field `{field}`: `{value}` is not a valid content type")]
    InvalidContentType { field: String, value: String },
}

/// Failure to build a concrete path from a route's pattern.
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("no route declared for field `{0}`")]
    UnknownField(String),

    #[error("path `{pattern}` has {expected} argument slot(s), got {given}")]
    ArgumentCount { pattern: String, expected: usize, given: usize },

    #[error("path `{pattern}` needs a value for variable `{name}`")]
    MissingVar { pattern: String, name: String },
}

/// Encoding or decoding failure inside a [`Marshaller`](crate::Marshaller).
#[derive(Debug, thiserror::Error)]
pub enum MarshalError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Unsupported(String),
}

/// Failure on a streaming session. Every variant but `HeaderNotSent` leaves
/// the session closed.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("the response header has not been written yet")]
    HeaderNotSent,

    #[error("the stream is closed")]
    Closed,

    #[error("write deadline exceeded")]
    DeadlineExceeded,

    #[error("the remote end disconnected")]
    Disconnected,

    #[error("can't marshal message: {0}")]
    Marshal(#[from] MarshalError),
}

/// Returned by [`Context::write_header`](crate::Context::write_header) when
/// the response head has already been written.
#[derive(Debug, thiserror::Error)]
#[error("response header already written with status {0}")]
pub struct HeaderWritten(pub http::StatusCode);

/// A request that fails before or around the handler; becomes a plain-text
/// error response.
#[derive(Debug)]
pub(crate) struct HttpError {
    pub(crate) status: http::StatusCode,
    pub(crate) message: String,
}

impl HttpError {
    pub(crate) fn new(status: http::StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }
}
