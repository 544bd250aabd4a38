//! Response construction helpers.
//!
//! Everything the router hands back to the transport is an
//! `http::Response<`[`Body`]`>`. These helpers build the few shapes the core
//! produces itself; handler-driven responses are assembled by
//! [`Context`](crate::Context).

use http::header::{CONTENT_TYPE, HeaderValue, LOCATION, X_CONTENT_TYPE_OPTIONS};
use http::{HeaderMap, Response, StatusCode};

use crate::body::Body;

/// A response with no body.
pub(crate) fn empty(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

/// A response carrying `body` as `content_type`, plus any extra headers the
/// handler set. A content type set by the handler wins.
pub(crate) fn with_body(
    status: StatusCode,
    headers: HeaderMap,
    content_type: HeaderValue,
    body: Vec<u8>,
) -> Response<Body> {
    let mut response = Response::new(Body::full(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response.headers_mut().entry(CONTENT_TYPE).or_insert(content_type);
    response
}

/// A plain-text error: the message followed by a newline.
pub(crate) fn error(status: StatusCode, message: impl std::fmt::Display) -> Response<Body> {
    let mut response = Response::new(Body::full(format!("{message}\n")));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response
}

/// `302 Found` pointing at `location`.
pub(crate) fn redirect(headers: HeaderMap, location: HeaderValue) -> Response<Body> {
    let mut response = empty(StatusCode::FOUND);
    *response.headers_mut() = headers;
    response.headers_mut().insert(LOCATION, location);
    response
}
