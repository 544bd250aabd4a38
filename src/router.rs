//! Route table and dispatcher.
//!
//! The router is built once from a [`Service`]: its declaration is parsed,
//! every path compiled, every route bound to its handler and checked against
//! it. Any mismatch fails the build; there is no half-usable router.
//!
//! Matching walks the routes in declaration order and takes the first whose
//! method and path both match. Overlapping patterns are not ranked by
//! specificity, so declare the narrower one first.
//!
//! After construction the table is immutable and shared through an `Arc`;
//! concurrent requests read it without locking. The service value itself is
//! shared the same way. restive never locks it: state a handler mutates needs
//! its own synchronisation.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::header::HeaderValue;
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info};

use crate::body::Body;
use crate::context::{Context, PathIndex, RequestParts, RouteParts};
use crate::declaration::{Declaration, RouteKind, ServiceConfig};
use crate::error::{ConfigError, Error, PathError};
use crate::handler::{Call, Entry, Handlers, Invocation, ProcessorFn, StreamingFn};
use crate::marshal::{Marshaller, Marshallers};
use crate::path::{ArgKind, PathMatch, PathPattern};
use crate::response;
use crate::service::Service;
use crate::stream::{SharedState, Stream};

struct Route<S> {
    field: Arc<str>,
    kind: RouteKind,
    method: Method,
    pattern: Arc<PathPattern>,
    pattern_text: String,
    handler: String,
    entry: Entry<S>,
    marshaller: Arc<dyn Marshaller>,
    mime: Arc<str>,
    charset: Arc<str>,
    content_type: HeaderValue,
}

impl<S> Route<S> {
    fn parts(&self, paths: &Arc<PathIndex>) -> RouteParts {
        RouteParts {
            field: Arc::clone(&self.field),
            mime: Arc::clone(&self.mime),
            charset: Arc::clone(&self.charset),
            content_type: self.content_type.clone(),
            paths: Arc::clone(paths),
        }
    }

    fn info(&self) -> RouteInfo<'_> {
        RouteInfo {
            field: &self.field,
            kind: self.kind,
            method: &self.method,
            pattern: &self.pattern_text,
            handler: &self.handler,
            args: &self.entry.args,
            body: self.entry.body,
            mime: &self.mime,
            charset: &self.charset,
        }
    }
}

/// Read-only view of a compiled route.
#[derive(Clone, Copy, Debug)]
pub struct RouteInfo<'a> {
    pub field: &'a str,
    pub kind: RouteKind,
    pub method: &'a Method,
    /// The path template with the service prefix in front.
    pub pattern: &'a str,
    pub handler: &'a str,
    /// Kind of each argument slot, in order.
    pub args: &'a [ArgKind],
    /// Type name of the request body, if the handler takes one.
    pub body: Option<&'static str>,
    pub mime: &'a str,
    pub charset: &'a str,
}

/// A successful [`Router::find`].
#[derive(Debug)]
pub struct RouteMatch<'a> {
    pub route: RouteInfo<'a>,
    /// Unconverted argument slot captures, in order.
    pub args: Vec<String>,
    pub vars: HashMap<String, String>,
}

struct Inner<S> {
    service: Arc<S>,
    config: ServiceConfig,
    routes: Vec<Route<S>>,
    paths: Arc<PathIndex>,
}

/// The compiled dispatch table of a [`Service`].
///
/// Cheap to clone; clones share the table and the service.
pub struct Router<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Router<S> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<S: Service> Router<S> {
    /// Builds the router for `service` with the built-in codecs.
    pub fn new(service: impl Into<Arc<S>>) -> Result<Self, Error> {
        Self::builder(service).build()
    }

    pub fn builder(service: impl Into<Arc<S>>) -> RouterBuilder<S> {
        RouterBuilder { service: service.into(), marshallers: Marshallers::default() }
    }

    /// The service prefix every route path starts with.
    pub fn prefix(&self) -> &str {
        &self.inner.config.prefix
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn service(&self) -> &Arc<S> {
        &self.inner.service
    }

    /// Routes in declaration order.
    pub fn routes(&self) -> impl Iterator<Item = RouteInfo<'_>> {
        self.inner.routes.iter().map(Route::info)
    }

    /// The route a request would be dispatched to.
    pub fn find(&self, method: &Method, path: &str) -> Option<RouteMatch<'_>> {
        self.lookup(method, path).map(|(route, m)| RouteMatch {
            route: route.info(),
            args: m.args,
            vars: m.vars,
        })
    }

    /// Builds the concrete path of a declared route from its argument
    /// values. Routes with named variables need
    /// [`Context::path_of`](crate::Context::path_of) instead.
    pub fn path(&self, field: &str, args: &[&dyn fmt::Display]) -> Result<String, PathError> {
        self.inner.paths.build(field, args, &HashMap::new())
    }

    fn lookup(&self, method: &Method, path: &str) -> Option<(&Route<S>, PathMatch)> {
        self.inner
            .routes
            .iter()
            .filter(|route| route.method == *method)
            .find_map(|route| route.pattern.captures(path).map(|m| (route, m)))
    }

    /// Routes one request and produces its response.
    ///
    /// Failures are answered, never returned: `404` when nothing matches,
    /// `400` when the body or a path argument can't be converted, `500` when
    /// the handler panics. Every handler runs on its own task, so a panic
    /// takes down that task and nothing else.
    pub async fn dispatch<B>(&self, request: Request<B>) -> Response<Body>
    where
        B: http_body::Body + Send,
        B::Data: Send,
        B::Error: fmt::Display,
    {
        let (parts, body) = request.into_parts();
        let path = parts.uri.path().to_owned();

        let Some((route, captured)) = self.lookup(&parts.method, &path) else {
            debug!(method = %parts.method, path, "no route");
            return response::error(
                StatusCode::NOT_FOUND,
                format_args!("can't find route to process {} {path}", parts.method),
            );
        };

        let request = RequestParts {
            method: parts.method,
            path,
            headers: parts.headers,
            vars: captured.vars,
        };

        match &route.entry.call {
            Call::Processor(call) => self.process(route, call, request, captured.args, body).await,
            Call::Streaming(call) => self.stream(route, call, request).await,
        }
    }

    async fn process<B>(
        &self,
        route: &Route<S>,
        call: &ProcessorFn<S>,
        request: RequestParts,
        args: Vec<String>,
        body: B,
    ) -> Response<Body>
    where
        B: http_body::Body + Send,
        B::Data: Send,
        B::Error: fmt::Display,
    {
        let body = match route.entry.body {
            Some(_) => match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    debug!(field = %route.field, error = %e, "can't read request body");
                    return response::error(StatusCode::BAD_REQUEST, format_args!("can't read request body: {e}"));
                }
            },
            None => Bytes::new(),
        };

        let (ctx, slot) = Context::buffered(request, route.parts(&self.inner.paths));
        let invocation = Invocation { args, body, marshaller: Arc::clone(&route.marshaller) };
        let task = tokio::spawn(call(Arc::clone(&self.inner.service), ctx, invocation));

        match task.await {
            Ok(Ok(reply)) => slot.finish(reply, &route.field, route.content_type.clone()),
            Ok(Err(e)) if slot.is_written() => {
                error!(field = %route.field, error = %e.message, "reply dropped after the status was written");
                slot.finish(None, &route.field, route.content_type.clone())
            }
            Ok(Err(e)) => {
                debug!(field = %route.field, status = %e.status, error = %e.message, "request rejected");
                response::error(e.status, e.message)
            }
            Err(e) => join_failure(&route.field, e),
        }
    }

    async fn stream(&self, route: &Route<S>, call: &StreamingFn<S>, request: RequestParts) -> Response<Body> {
        let (head_tx, head_rx) = oneshot::channel();
        let (frames_tx, frames_rx) = mpsc::channel(1);
        let state = SharedState::new();

        let ctx = Context::streaming(request, route.parts(&self.inner.paths), head_tx, frames_rx, state.clone());
        let stream = Stream::new(Arc::clone(&route.field), frames_tx, state, Arc::clone(&route.marshaller));
        let task = tokio::spawn(call(Arc::clone(&self.inner.service), ctx, stream));

        match head_rx.await {
            Ok(head) => {
                tokio::spawn(watch(Arc::clone(&route.field), task));
                head
            }
            // The context is gone without a head: the handler returned,
            // panicked, or gave the context away.
            Err(_) => match task.await {
                Ok(()) => response::empty(StatusCode::OK),
                Err(e) => join_failure(&route.field, e),
            },
        }
    }
}

/// Waits out a streaming handler whose head is already on the wire.
async fn watch(field: Arc<str>, task: JoinHandle<()>) {
    match task.await {
        Ok(()) => debug!(%field, "streaming handler returned"),
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            error!(%field, panic = panic_message(payload.as_ref()), "streaming handler panicked after its header");
        }
        Err(e) => error!(%field, error = %e, "streaming handler cancelled"),
    }
}

fn join_failure(field: &str, e: JoinError) -> Response<Body> {
    if e.is_panic() {
        return panicked(field, e.into_panic().as_ref());
    }
    error!(field, error = %e, "handler cancelled");
    response::error(StatusCode::INTERNAL_SERVER_ERROR, format_args!("handler cancelled: {e}"))
}

fn panicked(field: &str, payload: &(dyn Any + Send)) -> Response<Body> {
    let message = panic_message(payload);
    error!(field, panic = message, "handler panicked");
    response::error(StatusCode::INTERNAL_SERVER_ERROR, format_args!("panic: {message}"))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

/// Configures codecs before building a [`Router`].
pub struct RouterBuilder<S> {
    service: Arc<S>,
    marshallers: Marshallers,
}

impl<S: Service> RouterBuilder<S> {
    /// Registers (or replaces) the codec for `mime`.
    pub fn marshaller(mut self, mime: &str, marshaller: impl Marshaller) -> Self {
        self.marshallers.insert(mime, Arc::new(marshaller));
        self
    }

    pub fn build(self) -> Result<Router<S>, Error> {
        let service_name = type_name::<S>();

        let mut declaration = Declaration::new(service_name);
        S::declare(&mut declaration);
        let (config, specs) = declaration.parse()?;

        let mut handlers = Handlers::new();
        S::handlers(&mut handlers);
        if let Some(handler) = handlers.first_duplicate() {
            return Err(ConfigError::DuplicateHandler { handler: handler.to_owned() }.into());
        }

        let mut routes = Vec::with_capacity(specs.len());
        let mut paths = PathIndex::default();
        for spec in specs {
            let pattern = Arc::new(PathPattern::compile(&spec.field, &spec.prefix, &spec.path)?);

            let entry = handlers.get(&spec.handler).ok_or_else(|| ConfigError::UnresolvedHandler {
                field: spec.field.clone(),
                method: spec.method.clone(),
                handler: spec.handler.clone(),
            })?;
            if entry.kind() != spec.kind {
                return Err(ConfigError::HandlerKind {
                    field: spec.field,
                    method: spec.method,
                    handler: spec.handler,
                    expected: spec.kind.describe(),
                    found: entry.kind().describe(),
                }
                .into());
            }
            if entry.args.len() != pattern.slot_count() {
                return Err(ConfigError::Arity {
                    field: spec.field,
                    method: spec.method,
                    handler: spec.handler,
                    params: entry.args.len(),
                    captures: pattern.slot_count(),
                }
                .into());
            }

            let marshaller = self.marshallers.get(&spec.mime).ok_or_else(|| ConfigError::UnknownMime {
                field: spec.field.clone(),
                mime: spec.mime.clone(),
            })?;
            let content_type = match spec.charset.as_str() {
                "" => spec.mime.clone(),
                charset => format!("{}; charset={charset}", spec.mime),
            };
            let content_type = HeaderValue::from_str(&content_type).map_err(|_| ConfigError::InvalidContentType {
                field: spec.field.clone(),
                value: content_type.clone(),
            })?;

            debug!(
                field = %spec.field,
                method = %spec.method,
                pattern = %pattern.pattern(),
                handler = %spec.handler,
                vars = ?pattern.var_names().collect::<Vec<_>>(),
                "route compiled",
            );
            paths.insert(&spec.field, Arc::clone(&pattern));
            routes.push(Route {
                field: spec.field.as_str().into(),
                kind: spec.kind,
                method: spec.method,
                pattern_text: pattern.pattern(),
                pattern,
                handler: spec.handler,
                entry: entry.clone(),
                marshaller,
                mime: spec.mime.as_str().into(),
                charset: spec.charset.as_str().into(),
                content_type,
            });
        }

        info!(service = service_name, prefix = %config.prefix, routes = routes.len(), "router built");
        Ok(Router {
            inner: Arc::new(Inner {
                service: self.service,
                config,
                routes,
                paths: Arc::new(paths),
            }),
        })
    }
}
