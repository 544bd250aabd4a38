//! # restive
//!
//! Declarative REST bindings for Rust services.
//!
//! A service declares its routes as data: an anchor with service-wide
//! settings, then one tagged field per route. restive compiles that once into
//! a dispatch table, checks every route against the typed function it binds
//! to, and from then on routes requests, converts path arguments, decodes
//! bodies and encodes replies on the service's behalf.
//!
//! ## The contract
//!
//! - Routes match in declaration order. The first route whose method and
//!   path both match wins; declare narrow routes before broad ones.
//! - Path templates are regular expressions. `:name` is sugar for a named
//!   segment. Unnamed groups are handler arguments; named groups are
//!   variables on the [`Context`].
//! - A broken declaration fails [`Router::new`]. A bad request becomes a
//!   4xx response, a panicking handler a 500. Neither stops the router.
//! - The service value is shared by every request and never locked by
//!   restive. Guard mutable state yourself.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::{Arc, Mutex};
//!
//! use restive::{Context, Declaration, Handlers, Router, Server, Service};
//! use serde::Deserialize;
//!
//! #[derive(Default)]
//! struct Notes {
//!     notes: Mutex<HashMap<String, String>>,
//! }
//!
//! #[derive(Deserialize)]
//! struct Note {
//!     id: String,
//!     text: String,
//! }
//!
//! impl Service for Notes {
//!     fn declare(d: &mut Declaration) {
//!         d.anchor(r#"prefix:"/api""#)
//!             .processor("Create", r#"method:"POST" path:"/notes""#)
//!             .processor("Get", r#"method:"GET" path:"/notes/([^/]+)""#);
//!     }
//!
//!     fn handlers(h: &mut Handlers<Self>) {
//!         h.processor_with_body("HandleCreate", Notes::create)
//!             .processor("HandleGet", Notes::get);
//!     }
//! }
//!
//! impl Notes {
//!     async fn create(self: Arc<Self>, _: Context, (): (), note: Note) {
//!         self.notes.lock().unwrap().insert(note.id, note.text);
//!     }
//!
//!     async fn get(self: Arc<Self>, mut ctx: Context, (id,): (String,)) -> Option<String> {
//!         let text = self.notes.lock().unwrap().get(&id).cloned();
//!         if text.is_none() {
//!             ctx.error(restive::StatusCode::NOT_FOUND, format_args!("no note {id}"));
//!         }
//!         text
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), restive::Error> {
//!     let router = Router::new(Notes::default())?;
//!     Server::bind("0.0.0.0:3000")?.serve(router).await
//! }
//! ```

mod body;
mod context;
mod declaration;
mod error;
mod handler;
mod marshal;
mod path;
mod response;
mod router;
mod server;
mod service;
mod stream;
mod tag;

pub use body::Body;
pub use context::Context;
pub use declaration::{Declaration, RouteKind, ServiceConfig};
pub use error::{ConfigError, Error, HeaderWritten, MarshalError, PathError, StreamError};
pub use handler::{Handlers, PathArg, PathArgs};
pub use http::{HeaderName, HeaderValue, Method, StatusCode};
pub use marshal::{Json, Marshaller, Text};
pub use path::ArgKind;
pub use router::{RouteInfo, RouteMatch, Router, RouterBuilder};
pub use server::Server;
pub use service::Service;
pub use stream::{Inbox, Mailbox, Stream, StreamState, mailbox};
