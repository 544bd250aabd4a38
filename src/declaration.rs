//! Service declarations.
//!
//! A service describes itself as an ordered list of fields, each carrying a
//! tag. The first field is the anchor, holding service-wide settings; every
//! processor or streaming field after it becomes one route:
//!
//! ```rust
//! use restive::Declaration;
//!
//! fn declare(d: &mut Declaration) {
//!     d.anchor(r#"prefix:"/prefix" mime:"application/json" charset:"utf-8""#)
//!         .processor("CreateHello", r#"method:"POST" path:"/hello""#)
//!         .processor("GetHello", r#"method:"GET" path:"/hello/:to" func:"HandleHello""#)
//!         .streaming("Watch", r#"method:"GET" path:"/hello/:to/streaming""#)
//!         .field("post");
//! }
//! ```
//!
//! | key | on | meaning |
//! |---|---|---|
//! | `prefix` | anchor | prepended to every route path |
//! | `mime` | anchor, route | response content type, also picks the codec |
//! | `charset` | anchor, route | charset parameter of the content type |
//! | `method` | route | required, the HTTP method to match |
//! | `path` | route | required, the path template |
//! | `func` | route | handler name, defaults to `Handle<Field>` |

use http::Method;

use crate::error::ConfigError;
use crate::tag::Tag;

const DEFAULT_MIME: &str = "application/json";
const DEFAULT_CHARSET: &str = "utf-8";

const ANCHOR_KEYS: &[&str] = &["prefix", "mime", "charset"];
const ROUTE_KEYS: &[&str] = &["method", "path", "func", "mime", "charset"];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FieldKind {
    Anchor,
    Route(RouteKind),
    Plain,
}

/// Whether a route answers once or keeps its connection open.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RouteKind {
    Processor,
    Streaming,
}

impl RouteKind {
    pub(crate) fn describe(self) -> &'static str {
        match self {
            Self::Processor => "processor",
            Self::Streaming => "streaming handler",
        }
    }
}

#[derive(Debug)]
struct FieldDecl {
    name: String,
    kind: FieldKind,
    tag: String,
}

/// The ordered field list a [`Service`](crate::Service) fills in.
#[derive(Debug)]
pub struct Declaration {
    service: &'static str,
    fields: Vec<FieldDecl>,
}

impl Declaration {
    pub(crate) fn new(service: &'static str) -> Self {
        Self { service, fields: Vec::new() }
    }

    /// Declares the anchor. It must be the first field.
    pub fn anchor(&mut self, tag: &str) -> &mut Self {
        self.push("Service", FieldKind::Anchor, tag)
    }

    /// Declares a route answered by a processor handler.
    pub fn processor(&mut self, field: &str, tag: &str) -> &mut Self {
        self.push(field, FieldKind::Route(RouteKind::Processor), tag)
    }

    /// Declares a route answered by a streaming handler.
    pub fn streaming(&mut self, field: &str, tag: &str) -> &mut Self {
        self.push(field, FieldKind::Route(RouteKind::Streaming), tag)
    }

    /// Declares a plain field. Plain fields are application state and are
    /// skipped when routing; they only take up a position.
    pub fn field(&mut self, name: &str) -> &mut Self {
        self.push(name, FieldKind::Plain, "")
    }

    fn push(&mut self, name: &str, kind: FieldKind, tag: &str) -> &mut Self {
        self.fields.push(FieldDecl { name: name.to_owned(), kind, tag: tag.to_owned() });
        self
    }

    /// Resolves the anchor and every route field.
    pub(crate) fn parse(&self) -> Result<(ServiceConfig, Vec<RouteSpec>), ConfigError> {
        let service = self.service;
        let position = self
            .fields
            .iter()
            .position(|f| f.kind == FieldKind::Anchor)
            .ok_or(ConfigError::MissingAnchor { service })?;
        if position != 0 {
            return Err(ConfigError::MisplacedAnchor { service, position: position + 1 });
        }
        if self.fields.iter().filter(|f| f.kind == FieldKind::Anchor).count() > 1 {
            return Err(ConfigError::DuplicateAnchor { service });
        }

        for (i, field) in self.fields.iter().enumerate() {
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(ConfigError::DuplicateField { field: field.name.clone() });
            }
        }

        let anchor = &self.fields[0];
        let config = ServiceConfig::from_tag(&anchor.name, &anchor.tag)?;

        let mut routes = Vec::new();
        for field in &self.fields[1..] {
            if let FieldKind::Route(kind) = field.kind {
                routes.push(RouteSpec::from_tag(&config, &field.name, kind, &field.tag)?);
            }
        }
        Ok((config, routes))
    }
}

/// Service-wide settings taken from the anchor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceConfig {
    pub prefix: String,
    pub mime: String,
    pub charset: String,
}

impl ServiceConfig {
    fn from_tag(field: &str, raw: &str) -> Result<Self, ConfigError> {
        let tag = Tag::parse(field, raw)?;
        tag.check_keys(field, ANCHOR_KEYS)?;
        Ok(Self {
            prefix: tag.get("prefix").unwrap_or_default().to_owned(),
            mime: tag.get("mime").unwrap_or(DEFAULT_MIME).to_owned(),
            charset: tag.get("charset").unwrap_or(DEFAULT_CHARSET).to_owned(),
        })
    }
}

/// One route as declared, before its path is compiled or its handler bound.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct RouteSpec {
    pub(crate) field: String,
    pub(crate) kind: RouteKind,
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) prefix: String,
    pub(crate) mime: String,
    pub(crate) charset: String,
    pub(crate) handler: String,
}

impl RouteSpec {
    fn from_tag(config: &ServiceConfig, field: &str, kind: RouteKind, raw: &str) -> Result<Self, ConfigError> {
        let tag = Tag::parse(field, raw)?;
        tag.check_keys(field, ROUTE_KEYS)?;

        let method = parse_method(field, tag.require(field, "method")?)?;
        let path = tag.require(field, "path")?.to_owned();
        let handler = match tag.get("func") {
            Some(name) => name.to_owned(),
            None => format!("Handle{field}"),
        };

        Ok(Self {
            field: field.to_owned(),
            kind,
            method,
            path,
            prefix: config.prefix.clone(),
            mime: tag.get("mime").unwrap_or(&config.mime).to_owned(),
            charset: tag.get("charset").unwrap_or(&config.charset).to_owned(),
            handler,
        })
    }
}

fn parse_method(field: &str, raw: &str) -> Result<Method, ConfigError> {
    let invalid = || ConfigError::InvalidMethod {
        field: field.to_owned(),
        method: raw.to_owned(),
    };
    if raw.is_empty() || raw.bytes().any(|b| b.is_ascii_lowercase()) {
        return Err(invalid());
    }
    Method::from_bytes(raw.as_bytes()).map_err(|_| invalid())
}
