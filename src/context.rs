//! Per-request context.
//!
//! A [`Context`] is created for every matched request and handed to its
//! handler. It exposes what was captured from the path and lets the handler
//! take over the response: answer with an error, redirect, or write the
//! header itself. Whatever the handler writes through the context wins over
//! its return value.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Response, StatusCode};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::body::Body;
use crate::error::{HeaderWritten, PathError};
use crate::path::PathPattern;
use crate::response;
use crate::stream::{SharedState, StreamState};

/// Reverse-routing table: field name to compiled path.
#[derive(Debug, Default)]
pub(crate) struct PathIndex(HashMap<String, Arc<PathPattern>>);

impl PathIndex {
    pub(crate) fn insert(&mut self, field: &str, pattern: Arc<PathPattern>) {
        self.0.insert(field.to_owned(), pattern);
    }

    pub(crate) fn build(
        &self,
        field: &str,
        args: &[&dyn fmt::Display],
        vars: &HashMap<String, String>,
    ) -> Result<String, PathError> {
        let pattern = self
            .0
            .get(field)
            .ok_or_else(|| PathError::UnknownField(field.to_owned()))?;
        let args: Vec<String> = args.iter().map(ToString::to_string).collect();
        pattern.build(&args, vars)
    }
}

/// What was matched out of the request.
pub(crate) struct RequestParts {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) headers: HeaderMap,
    pub(crate) vars: HashMap<String, String>,
}

/// What the matched route serves the request with.
pub(crate) struct RouteParts {
    pub(crate) field: Arc<str>,
    pub(crate) mime: Arc<str>,
    pub(crate) charset: Arc<str>,
    pub(crate) content_type: HeaderValue,
    pub(crate) paths: Arc<PathIndex>,
}

enum Outlet {
    /// Processor routes: the response is assembled and returned at the end.
    Buffered { finished: Option<Response<Body>> },
    /// Streaming routes: the head goes out as soon as the handler writes it.
    Streaming {
        head: Option<oneshot::Sender<Response<Body>>>,
        frames: Option<mpsc::Receiver<Bytes>>,
        state: SharedState,
    },
}

/// Everything the handler has said about the response so far.
struct Answer {
    status: Option<StatusCode>,
    headers: HeaderMap,
    outlet: Outlet,
}

impl Answer {
    fn finish_with(&mut self, response: Response<Body>) {
        self.status = Some(response.status());
        match &mut self.outlet {
            Outlet::Buffered { finished } => *finished = Some(response),
            Outlet::Streaming { head, frames, state } => {
                frames.take();
                if let Some(head) = head.take() {
                    // The receiver only goes away with the whole request.
                    let _ = head.send(response);
                }
                state.set(StreamState::Closed);
            }
        }
    }
}

type SharedAnswer = Arc<Mutex<Answer>>;

fn lock(answer: &SharedAnswer) -> MutexGuard<'_, Answer> {
    answer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The dispatcher's handle on a processor's response. Stays valid after the
/// handler has moved its [`Context`] anywhere.
pub(crate) struct ResponseSlot(SharedAnswer);

impl ResponseSlot {
    pub(crate) fn is_written(&self) -> bool {
        lock(&self.0).status.is_some()
    }

    /// Turns a processor's outcome into the response. `body` is the encoded
    /// return value, dropped if the handler already finished the response.
    pub(crate) fn finish(self, body: Option<Vec<u8>>, field: &str, content_type: HeaderValue) -> Response<Body> {
        let mut answer = lock(&self.0);
        let status = answer.status.unwrap_or(StatusCode::OK);
        let headers = std::mem::take(&mut answer.headers);
        let finished = match &mut answer.outlet {
            Outlet::Buffered { finished } => finished.take(),
            Outlet::Streaming { .. } => return response::empty(status),
        };

        if let Some(finished) = finished {
            if body.is_some() {
                debug!(field, "return value dropped, the handler already answered");
            }
            return finished;
        }
        match body {
            Some(body) => response::with_body(status, headers, content_type, body),
            None => {
                let mut response = response::empty(status);
                *response.headers_mut() = headers;
                response
            }
        }
    }
}

/// Per-request state handed to a handler.
pub struct Context {
    method: Method,
    path: String,
    headers: HeaderMap,
    vars: HashMap<String, String>,
    route: RouteParts,
    answer: SharedAnswer,
}

impl Context {
    pub(crate) fn buffered(request: RequestParts, route: RouteParts) -> (Self, ResponseSlot) {
        let ctx = Self::with_outlet(request, route, Outlet::Buffered { finished: None });
        let slot = ResponseSlot(Arc::clone(&ctx.answer));
        (ctx, slot)
    }

    pub(crate) fn streaming(
        request: RequestParts,
        route: RouteParts,
        head: oneshot::Sender<Response<Body>>,
        frames: mpsc::Receiver<Bytes>,
        state: SharedState,
    ) -> Self {
        let outlet = Outlet::Streaming { head: Some(head), frames: Some(frames), state };
        Self::with_outlet(request, route, outlet)
    }

    fn with_outlet(request: RequestParts, route: RouteParts, outlet: Outlet) -> Self {
        let RequestParts { method, path, headers, vars } = request;
        let answer = Answer { status: None, headers: HeaderMap::new(), outlet };
        Self {
            method,
            path,
            headers,
            vars,
            route,
            answer: Arc::new(Mutex::new(answer)),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Request header lookup; `None` if absent or not visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Path variables: named groups by name, unnamed groups by their 1-based
    /// position.
    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// The route's response mime type.
    pub fn mime(&self) -> &str {
        &self.route.mime
    }

    pub fn charset(&self) -> &str {
        &self.route.charset
    }

    /// Whether the response status has been written. Once it has, the
    /// status is final.
    pub fn is_written(&self) -> bool {
        lock(&self.answer).status.is_some()
    }

    /// Builds the path of another declared route. `args` fill its unnamed
    /// groups; named groups are filled from this request's variables.
    ///
    /// ```rust,ignore
    /// let path = ctx.path_of("Conv", &[&1])?; // "/prefix/conversation/1"
    /// ctx.redirect_to(&path);
    /// ```
    pub fn path_of(&self, field: &str, args: &[&dyn fmt::Display]) -> Result<String, PathError> {
        self.route.paths.build(field, args, &self.vars)
    }

    /// Adds a response header. Ignored once the status is written.
    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        let mut answer = lock(&self.answer);
        if answer.status.is_some() {
            warn!(field = %self.route.field, header = %name, "header set after the status was written");
            return;
        }
        answer.headers.insert(name, value);
    }

    /// Writes the response status. On a streaming route this sends the head
    /// and opens the stream.
    pub fn write_header(&mut self, status: StatusCode) -> Result<(), HeaderWritten> {
        let mut guard = lock(&self.answer);
        let answer = &mut *guard;
        if let Some(written) = answer.status {
            return Err(HeaderWritten(written));
        }
        answer.status = Some(status);

        match &mut answer.outlet {
            Outlet::Buffered { .. } => {}
            Outlet::Streaming { head, frames, state } => {
                let (Some(head), Some(frames)) = (head.take(), frames.take()) else {
                    return Ok(());
                };
                let mut response = Response::new(Body::stream(frames));
                *response.status_mut() = status;
                *response.headers_mut() = std::mem::take(&mut answer.headers);
                response
                    .headers_mut()
                    .entry(CONTENT_TYPE)
                    .or_insert_with(|| self.route.content_type.clone());

                if head.send(response).is_ok() {
                    state.set(StreamState::HeaderSent);
                    debug!(field = %self.route.field, %status, "stream opened");
                } else {
                    state.set(StreamState::Closed);
                }
            }
        }
        Ok(())
    }

    /// Answers with a plain-text error. Ignored once the status is written.
    pub fn error(&mut self, status: StatusCode, err: impl fmt::Display) {
        let mut answer = lock(&self.answer);
        if let Some(written) = answer.status {
            warn!(field = %self.route.field, %status, %written, error = %err, "error after the status was written");
            return;
        }
        debug!(field = %self.route.field, %status, error = %err, "handler answered with an error");
        answer.finish_with(response::error(status, err));
    }

    /// Answers with `302 Found` to `location`. Ignored once the status is
    /// written.
    pub fn redirect_to(&mut self, location: &str) {
        let mut answer = lock(&self.answer);
        if let Some(written) = answer.status {
            warn!(field = %self.route.field, location, %written, "redirect after the status was written");
            return;
        }
        match HeaderValue::from_str(location) {
            Ok(value) => {
                let headers = std::mem::take(&mut answer.headers);
                answer.finish_with(response::redirect(headers, value));
            }
            Err(_) => {
                let err = response::error(StatusCode::INTERNAL_SERVER_ERROR, format_args!("can't redirect to {location:?}"));
                answer.finish_with(err);
            }
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("vars", &self.vars)
            .field("status", &lock(&self.answer).status)
            .finish_non_exhaustive()
    }
}
