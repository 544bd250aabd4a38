//! Field tag grammar.
//!
//! A tag is a sequence of `key:"value"` pairs separated by spaces:
//!
//! ```text
//! method:"GET" path:"/hello/:to" func:"HandleHello"
//! ```
//!
//! Keys are any run of printable, non-space characters other than `:` and
//! `"`. Values are double-quoted and accept `\"`, `\\`, `\n`, `\t` and `\r`
//! escapes.

use crate::error::ConfigError;

/// A parsed tag. Keys keep their declaration order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Tag {
    pairs: Vec<(String, String)>,
}

impl Tag {
    /// Parses `raw`, attributing any error to `field`.
    pub(crate) fn parse(field: &str, raw: &str) -> Result<Self, ConfigError> {
        let malformed = |offset: usize, reason: &'static str| ConfigError::MalformedTag {
            field: field.to_owned(),
            offset,
            reason,
        };

        let bytes = raw.as_bytes();
        let mut pairs: Vec<(String, String)> = Vec::new();
        let mut i = 0;

        loop {
            while i < bytes.len() && bytes[i] == b' ' {
                i += 1;
            }
            if i == bytes.len() {
                break;
            }

            let key_start = i;
            while i < bytes.len()
                && bytes[i] > b' '
                && bytes[i] != b':'
                && bytes[i] != b'"'
                && bytes[i] != 0x7f
            {
                i += 1;
            }
            if i == key_start {
                return Err(malformed(i, "expected a key"));
            }
            let key = &raw[key_start..i];

            if bytes.get(i) != Some(&b':') {
                return Err(malformed(i, "expected `:` after key"));
            }
            i += 1;
            if bytes.get(i) != Some(&b'"') {
                return Err(malformed(i, "expected `\"` to open the value"));
            }
            i += 1;

            let mut value = String::new();
            let mut rest = raw[i..].char_indices();
            let closed = loop {
                match rest.next() {
                    None => break None,
                    Some((at, '"')) => break Some(i + at + 1),
                    Some((at, '\\')) => {
                        let escaped = match rest.next() {
                            Some((_, '"')) => '"',
                            Some((_, '\\')) => '\\',
                            Some((_, 'n')) => '\n',
                            Some((_, 't')) => '\t',
                            Some((_, 'r')) => '\r',
                            _ => return Err(malformed(i + at, "invalid escape in value")),
                        };
                        value.push(escaped);
                    }
                    Some((_, c)) => value.push(c),
                }
            };
            i = closed.ok_or_else(|| malformed(raw.len(), "unterminated value"))?;

            if pairs.iter().any(|(k, _)| k == key) {
                return Err(ConfigError::DuplicateTag {
                    field: field.to_owned(),
                    key: key.to_owned(),
                });
            }
            pairs.push((key.to_owned(), value));

            if i < bytes.len() && bytes[i] != b' ' {
                return Err(malformed(i, "expected a space between pairs"));
            }
        }

        Ok(Self { pairs })
    }

    pub(crate) fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Fails on the first key not in `allowed`.
    pub(crate) fn check_keys(&self, field: &str, allowed: &[&str]) -> Result<(), ConfigError> {
        match self.pairs.iter().find(|(k, _)| !allowed.contains(&k.as_str())) {
            Some((key, _)) => Err(ConfigError::UnknownTag {
                field: field.to_owned(),
                key: key.clone(),
            }),
            None => Ok(()),
        }
    }

    pub(crate) fn require(&self, field: &str, key: &'static str) -> Result<&str, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::MissingTag {
            field: field.to_owned(),
            key,
        })
    }
}
