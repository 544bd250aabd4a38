//! Handler registration and type erasure.
//!
//! # From typed closures to one table
//!
//! A service registers its behaviour by name, as ordinary typed functions:
//!
//! ```text
//! async fn hello(self: Arc<Self>, ctx: Context, (host, guest): (String, String)) -> String
//!        ↓ h.processor("Hello", Svc::hello)
//! Entry { args: [String, String], body: None, call: ProcessorFn }
//!        ↓ bound to a declared field when the router is built
//! call(svc, ctx, Invocation { args, body, marshaller }).await   ← per request
//! ```
//!
//! The typed signature is only visible here. Registration records what the
//! function expects (the kind of each path argument, whether it takes a
//! request body) and wraps it in a closure that does the conversions, so the
//! router can check every declared route against its handler once, at build
//! time, and never inspect types again.

use std::any::type_name;
use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::context::Context;
use crate::declaration::RouteKind;
use crate::error::HttpError;
use crate::marshal::{self, Marshaller};
use crate::path::ArgKind;
use crate::stream::Stream;

// ── Path arguments ───────────────────────────────────────────────────────────

/// A type a captured path segment can be converted into.
pub trait PathArg: Sized + Send + 'static {
    const KIND: ArgKind;

    fn parse(raw: &str) -> Result<Self, String>;
}

impl PathArg for String {
    const KIND: ArgKind = ArgKind::String;

    fn parse(raw: &str) -> Result<Self, String> {
        Ok(raw.to_owned())
    }
}

macro_rules! integer_arg {
    ($($t:ty),*) => {$(
        impl PathArg for $t {
            const KIND: ArgKind = ArgKind::Integer;

            fn parse(raw: &str) -> Result<Self, String> {
                raw.parse().map_err(|e: std::num::ParseIntError| e.to_string())
            }
        }
    )*};
}

integer_arg!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

/// The full list of path arguments a processor takes: a tuple of
/// [`PathArg`]s, `()` when it takes none.
///
/// Sealed; implemented for tuples of up to four elements.
pub trait PathArgs: private::Sealed + Sized + Send + 'static {
    #[doc(hidden)]
    fn kinds() -> Vec<ArgKind>;

    #[doc(hidden)]
    fn from_captures(raw: &[String]) -> Result<Self, String>;
}

mod private {
    pub trait Sealed {}
}

macro_rules! path_args {
    ($($t:ident),*) => {
        impl<$($t: PathArg),*> private::Sealed for ($($t,)*) {}

        impl<$($t: PathArg),*> PathArgs for ($($t,)*) {
            fn kinds() -> Vec<ArgKind> {
                vec![$($t::KIND),*]
            }

            #[allow(unused_variables, unused_mut)]
            fn from_captures(raw: &[String]) -> Result<Self, String> {
                let mut raw = raw.iter().enumerate();
                Ok(($(
                    {
                        let (position, value) = raw
                            .next()
                            .ok_or_else(|| "missing path argument".to_owned())?;
                        $t::parse(value).map_err(|reason| format!(
                            "can't convert path argument {} ({:?}) to {}: {}",
                            position + 1, value, $t::KIND, reason,
                        ))?
                    },
                )*))
            }
        }
    };
}

path_args!();
path_args!(A);
path_args!(A, B);
path_args!(A, B, C);
path_args!(A, B, C, D);

// ── Erased handlers ──────────────────────────────────────────────────────────

/// What a processor needs besides the service and the context.
pub(crate) struct Invocation {
    pub(crate) args: Vec<String>,
    pub(crate) body: Bytes,
    pub(crate) marshaller: Arc<dyn Marshaller>,
}

/// A heap-allocated, type-erased handler future.
pub(crate) type BoxFuture<T = ()> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// The encoded reply of a processor; `None` for no body.
pub(crate) type Reply = Result<Option<Vec<u8>>, HttpError>;

pub(crate) type ProcessorFn<S> = Arc<dyn Fn(Arc<S>, Context, Invocation) -> BoxFuture<Reply> + Send + Sync>;

pub(crate) type StreamingFn<S> = Arc<dyn Fn(Arc<S>, Context, Stream) -> BoxFuture + Send + Sync>;

pub(crate) enum Call<S> {
    Processor(ProcessorFn<S>),
    Streaming(StreamingFn<S>),
}

impl<S> Clone for Call<S> {
    fn clone(&self) -> Self {
        match self {
            Self::Processor(f) => Self::Processor(Arc::clone(f)),
            Self::Streaming(f) => Self::Streaming(Arc::clone(f)),
        }
    }
}

/// A registered handler and what it expects.
pub(crate) struct Entry<S> {
    pub(crate) call: Call<S>,
    pub(crate) args: Vec<ArgKind>,
    /// Type name of the request body, if the handler takes one.
    pub(crate) body: Option<&'static str>,
}

impl<S> Entry<S> {
    pub(crate) fn kind(&self) -> RouteKind {
        match self.call {
            Call::Processor(_) => RouteKind::Processor,
            Call::Streaming(_) => RouteKind::Streaming,
        }
    }
}

impl<S> Clone for Entry<S> {
    fn clone(&self) -> Self {
        Self { call: self.call.clone(), args: self.args.clone(), body: self.body }
    }
}

// ── Registration ─────────────────────────────────────────────────────────────

/// The behaviour set of a service: its handlers, by name.
///
/// Filled in by [`Service::handlers`](crate::Service::handlers). Names are
/// what route fields refer to, through their `func` tag or the default
/// `Handle<Field>`.
pub struct Handlers<S> {
    entries: HashMap<String, Entry<S>>,
    duplicates: Vec<String>,
}

impl<S: Send + Sync + 'static> Handlers<S> {
    pub(crate) fn new() -> Self {
        Self { entries: HashMap::new(), duplicates: Vec::new() }
    }

    /// Registers a processor taking the path arguments `A` and answering with
    /// `R`. `()` and `None` send no body.
    pub fn processor<A, R, F, Fut>(&mut self, name: &str, f: F) -> &mut Self
    where
        A: PathArgs,
        R: Serialize + Send + 'static,
        F: Fn(Arc<S>, Context, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let call: ProcessorFn<S> = Arc::new(move |svc: Arc<S>, ctx: Context, inv: Invocation| -> BoxFuture<Reply> {
            let args = match A::from_captures(&inv.args) {
                Ok(args) => args,
                Err(m) => return rejected(HttpError::new(StatusCode::BAD_REQUEST, m)),
            };
            let reply = f(svc, ctx, args);
            Box::pin(async move { encode_reply(inv.marshaller.as_ref(), &reply.await) })
        });
        self.insert(name, Entry { call: Call::Processor(call), args: A::kinds(), body: None })
    }

    /// Registers a processor that also takes a request body `B`, decoded
    /// with the route's codec before the handler runs.
    pub fn processor_with_body<A, B, R, F, Fut>(&mut self, name: &str, f: F) -> &mut Self
    where
        A: PathArgs,
        B: DeserializeOwned + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<S>, Context, A, B) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let call: ProcessorFn<S> = Arc::new(move |svc: Arc<S>, ctx: Context, inv: Invocation| -> BoxFuture<Reply> {
            let body: B = match marshal::decode(inv.marshaller.as_ref(), &inv.body) {
                Ok(body) => body,
                Err(e) => {
                    let message = format!("can't marshal request to type {}: {e}", type_name::<B>());
                    return rejected(HttpError::new(StatusCode::BAD_REQUEST, message));
                }
            };
            let args = match A::from_captures(&inv.args) {
                Ok(args) => args,
                Err(m) => return rejected(HttpError::new(StatusCode::BAD_REQUEST, m)),
            };
            let reply = f(svc, ctx, args, body);
            Box::pin(async move { encode_reply(inv.marshaller.as_ref(), &reply.await) })
        });
        let entry = Entry { call: Call::Processor(call), args: A::kinds(), body: Some(type_name::<B>()) };
        self.insert(name, entry)
    }

    /// Registers a streaming handler. It owns the connection until its
    /// future completes.
    pub fn streaming<F, Fut>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(Arc<S>, Context, Stream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let call: StreamingFn<S> =
            Arc::new(move |svc: Arc<S>, ctx: Context, stream: Stream| -> BoxFuture { Box::pin(f(svc, ctx, stream)) });
        self.insert(name, Entry { call: Call::Streaming(call), args: Vec::new(), body: None })
    }

    fn insert(&mut self, name: &str, entry: Entry<S>) -> &mut Self {
        match self.entries.entry(name.to_owned()) {
            MapEntry::Occupied(_) => self.duplicates.push(name.to_owned()),
            MapEntry::Vacant(slot) => {
                slot.insert(entry);
            }
        }
        self
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Entry<S>> {
        self.entries.get(name)
    }

    pub(crate) fn first_duplicate(&self) -> Option<&str> {
        self.duplicates.first().map(String::as_str)
    }
}

fn rejected(e: HttpError) -> BoxFuture<Reply> {
    Box::pin(std::future::ready(Err(e)))
}

fn encode_reply<R: Serialize>(marshaller: &dyn Marshaller, reply: &R) -> Reply {
    marshal::encode(marshaller, reply).map_err(|e| {
        HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("can't marshal response: {e}"))
    })
}
