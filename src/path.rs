//! Path templates.
//!
//! A template is a regular expression over the request path with one piece of
//! sugar: a segment written `:name` right after a `/` stands for
//! `(?P<name>[^/]+)`. Capture groups fall into two sets:
//!
//! - **unnamed groups** are argument slots, passed positionally to the handler;
//! - **named groups** (including `:name` placeholders) are path variables,
//!   read through [`Context::vars`](crate::Context::vars).
//!
//! The compiled pattern is anchored at both ends and carries the service
//! prefix in front, so `/hello/:to` under prefix `/api` only matches
//! `/api/hello/<segment>`.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;

use crate::error::{ConfigError, PathError};

/// How a captured argument is converted before the handler sees it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArgKind {
    String,
    Integer,
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::String => "string",
            Self::Integer => "integer",
        })
    }
}

/// Strings captured from one successful match.
#[derive(Debug, Default)]
pub(crate) struct PathMatch {
    /// Unnamed groups, in order. A group that did not participate is `""`.
    pub(crate) args: Vec<String>,
    /// Named groups by name, plus unnamed groups by 1-based slot number.
    pub(crate) vars: HashMap<String, String>,
}

#[derive(Debug)]
enum Piece {
    Literal(String),
    Group(usize),
}

/// A compiled path template.
#[derive(Debug)]
pub(crate) struct PathPattern {
    prefix: String,
    template: String,
    regex: Regex,
    /// Capture group index of each argument slot.
    slots: Vec<usize>,
    /// Capture group index and name of each path variable.
    vars: Vec<(usize, String)>,
    pieces: Vec<Piece>,
}

impl PathPattern {
    pub(crate) fn compile(field: &str, prefix: &str, template: &str) -> Result<Self, ConfigError> {
        let expanded = expand_placeholders(template);
        let source = format!("^{}{}$", regex::escape(prefix), expanded);
        let regex = Regex::new(&source).map_err(|source| ConfigError::InvalidPattern {
            field: field.to_owned(),
            pattern: template.to_owned(),
            source,
        })?;

        let mut slots = Vec::new();
        let mut vars = Vec::new();
        for (index, name) in regex.capture_names().enumerate().skip(1) {
            match name {
                Some(name) => vars.push((index, name.to_owned())),
                None => slots.push(index),
            }
        }

        Ok(Self {
            prefix: prefix.to_owned(),
            template: template.to_owned(),
            pieces: split_pieces(&expanded),
            regex,
            slots,
            vars,
        })
    }

    /// The declared template with the prefix in front.
    pub(crate) fn pattern(&self) -> String {
        format!("{}{}", self.prefix, self.template)
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn var_names(&self) -> impl Iterator<Item = &str> {
        self.vars.iter().map(|(_, name)| name.as_str())
    }

    pub(crate) fn captures(&self, path: &str) -> Option<PathMatch> {
        let caps = self.regex.captures(path)?;
        let text = |index: usize| caps.get(index).map_or("", |m| m.as_str()).to_owned();

        let args: Vec<String> = self.slots.iter().map(|&i| text(i)).collect();
        let mut vars: HashMap<String, String> =
            self.vars.iter().map(|(i, name)| (name.clone(), text(*i))).collect();
        for (n, arg) in args.iter().enumerate() {
            vars.entry((n + 1).to_string()).or_insert_with(|| arg.clone());
        }
        Some(PathMatch { args, vars })
    }

    /// Builds a concrete path: `args` fill the argument slots in order,
    /// `vars` fill the named groups.
    ///
    /// Nested groups are replaced together with the group that encloses them.
    pub(crate) fn build(&self, args: &[String], vars: &HashMap<String, String>) -> Result<String, PathError> {
        if args.len() != self.slots.len() {
            return Err(PathError::ArgumentCount {
                pattern: self.pattern(),
                expected: self.slots.len(),
                given: args.len(),
            });
        }

        let mut out = self.prefix.clone();
        for piece in &self.pieces {
            match piece {
                Piece::Literal(text) => out.push_str(text),
                Piece::Group(index) => {
                    if let Some(slot) = self.slots.iter().position(|i| i == index) {
                        out.push_str(&args[slot]);
                        continue;
                    }
                    let Some((_, name)) = self.vars.iter().find(|(i, _)| i == index) else {
                        continue;
                    };
                    let value = vars.get(name).ok_or_else(|| PathError::MissingVar {
                        pattern: self.pattern(),
                        name: name.clone(),
                    })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Rewrites `/:name` segments into named groups.
fn expand_placeholders(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    let mut prev = None;

    while let Some(c) = chars.next() {
        let placeholder = c == ':'
            && matches!(prev, None | Some('/'))
            && chars.peek().copied().is_some_and(is_ident_start);
        if !placeholder {
            out.push(c);
            prev = Some(c);
            continue;
        }

        let mut name = String::new();
        while let Some(&next) = chars.peek() {
            if !is_ident(next) {
                break;
            }
            name.push(next);
            chars.next();
        }
        out.push_str(&format!("(?P<{name}>[^/]+)"));
        prev = Some(')');
    }
    out
}

/// Splits an expanded template into literal text and top-level capture
/// groups, numbering capture groups the way the regex engine does.
fn split_pieces(expanded: &str) -> Vec<Piece> {
    let mut pieces = Vec::new();
    let mut literal = String::new();
    let mut chars = expanded.chars().peekable();
    let mut group_index = 0;
    let mut in_class = false;
    // One entry per open group: whether text inside it is copied out.
    let mut emit: Vec<bool> = Vec::new();
    let emitting = |emit: &Vec<bool>| emit.last().copied().unwrap_or(true);

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let escaped = chars.next();
                if emitting(&emit) && !in_class {
                    literal.extend(escaped);
                }
            }
            ']' if in_class => in_class = false,
            _ if in_class => {}
            '[' => in_class = true,
            '(' => {
                let capturing = match chars.peek().copied() {
                    Some('?') => {
                        let head: String = chars.clone().take(3).collect();
                        head.starts_with("?P<") || head.starts_with("?<")
                    }
                    _ => true,
                };
                if capturing {
                    group_index += 1;
                    if emitting(&emit) {
                        if !literal.is_empty() {
                            pieces.push(Piece::Literal(std::mem::take(&mut literal)));
                        }
                        pieces.push(Piece::Group(group_index));
                    }
                    emit.push(false);
                    continue;
                }
                // Skip the `?flags:` header; a bare `(?flags)` has no body.
                let mut opens_body = false;
                for next in chars.by_ref() {
                    if next == ':' {
                        opens_body = true;
                        break;
                    }
                    if next == ')' {
                        break;
                    }
                }
                if opens_body {
                    emit.push(emitting(&emit));
                }
            }
            ')' => {
                emit.pop();
            }
            '^' | '$' => {}
            _ if emitting(&emit) => literal.push(c),
            _ => {}
        }
    }
    if !literal.is_empty() {
        pieces.push(Piece::Literal(literal));
    }
    pieces
}
