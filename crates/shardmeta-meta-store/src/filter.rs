//! LDAP-style search filters
//!
//! Searches are expressed as RFC 4515 filter strings such as
//! `(&(owner=acct-1)(|(type=object)(type=directory))(!(name=*.tmp)))`.
//! Values may escape `(`, `)`, `*` and `\` as `\XX` hex pairs.

use serde_json::Value;
use shardmeta_common::{StoreError, StoreResult};
use std::cmp::Ordering;
use std::fmt;

/// A parsed search filter
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equal { attr: String, value: String },
    GreaterOrEqual { attr: String, value: String },
    LessOrEqual { attr: String, value: String },
    Present { attr: String },
    Substring {
        attr: String,
        initial: Option<String>,
        any: Vec<String>,
        last: Option<String>,
    },
}

impl Filter {
    /// Parse a filter string
    pub fn parse(input: &str) -> StoreResult<Self> {
        let mut parser = Parser {
            input: input.trim().as_bytes(),
            pos: 0,
        };
        let filter = parser.filter()?;
        if parser.pos != parser.input.len() {
            return Err(parser.error("trailing characters"));
        }
        Ok(filter)
    }

    /// Equality filter on one attribute
    pub fn equal(attr: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Equal {
            attr: attr.into(),
            value: value.into(),
        }
    }

    /// Evaluate against a stored value. `key` answers the `_key` attribute.
    #[must_use]
    pub fn matches(&self, key: &str, value: &Value) -> bool {
        match self {
            Self::And(filters) => filters.iter().all(|f| f.matches(key, value)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(key, value)),
            Self::Not(filter) => !filter.matches(key, value),
            Self::Present { attr } => !attribute(key, value, attr).is_empty(),
            Self::Equal { attr, value: want } => attribute(key, value, attr)
                .iter()
                .any(|v| compare(v, want) == Some(Ordering::Equal)),
            Self::GreaterOrEqual { attr, value: want } => attribute(key, value, attr)
                .iter()
                .any(|v| matches!(compare(v, want), Some(Ordering::Greater | Ordering::Equal))),
            Self::LessOrEqual { attr, value: want } => attribute(key, value, attr)
                .iter()
                .any(|v| matches!(compare(v, want), Some(Ordering::Less | Ordering::Equal))),
            Self::Substring {
                attr,
                initial,
                any,
                last,
            } => attribute(key, value, attr).iter().any(|v| {
                as_text(v).is_some_and(|s| {
                    substring_match(&s, initial.as_deref(), any, last.as_deref())
                })
            }),
        }
    }
}

/// Values of `attr`; arrays contribute each element.
fn attribute(key: &str, value: &Value, attr: &str) -> Vec<Value> {
    if attr == "_key" {
        return vec![Value::String(key.to_string())];
    }
    match value.get(attr) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(v) => vec![v.clone()],
    }
}

fn as_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Compare a stored value with a filter assertion, numerically when the
/// stored value is a number.
fn compare(stored: &Value, assertion: &str) -> Option<Ordering> {
    match stored {
        Value::Number(n) => {
            let want: f64 = assertion.parse().ok()?;
            n.as_f64()?.partial_cmp(&want)
        }
        Value::String(s) => Some(s.as_str().cmp(assertion)),
        Value::Bool(b) => Some(b.to_string().as_str().cmp(assertion)),
        _ => None,
    }
}

fn substring_match(s: &str, initial: Option<&str>, any: &[String], last: Option<&str>) -> bool {
    let mut rest = s;
    if let Some(prefix) = initial {
        match rest.strip_prefix(prefix) {
            Some(r) => rest = r,
            None => return false,
        }
    }
    for part in any {
        match rest.find(part.as_str()) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    last.is_none_or(|suffix| rest.ends_with(suffix))
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '*' => out.push_str("\\2a"),
            '\\' => out.push_str("\\5c"),
            c => out.push(c),
        }
    }
    out
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And(filters) | Self::Or(filters) => {
                f.write_str(if matches!(self, Self::And(_)) { "(&" } else { "(|" })?;
                for filter in filters {
                    write!(f, "{filter}")?;
                }
                f.write_str(")")
            }
            Self::Not(filter) => write!(f, "(!{filter})"),
            Self::Equal { attr, value } => write!(f, "({attr}={})", escape(value)),
            Self::GreaterOrEqual { attr, value } => write!(f, "({attr}>={})", escape(value)),
            Self::LessOrEqual { attr, value } => write!(f, "({attr}<={})", escape(value)),
            Self::Present { attr } => write!(f, "({attr}=*)"),
            Self::Substring {
                attr,
                initial,
                any,
                last,
            } => {
                write!(f, "({attr}=")?;
                if let Some(i) = initial {
                    f.write_str(&escape(i))?;
                }
                f.write_str("*")?;
                for part in any {
                    write!(f, "{}*", escape(part))?;
                }
                if let Some(l) = last {
                    f.write_str(&escape(l))?;
                }
                f.write_str(")")
            }
        }
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, msg: &str) -> StoreError {
        StoreError::InvalidQuery(format!(
            "{msg} at offset {} of {}",
            self.pos,
            String::from_utf8_lossy(self.input)
        ))
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, c: u8) -> StoreResult<()> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", c as char)))
        }
    }

    fn filter(&mut self) -> StoreResult<Filter> {
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.filter()?))
            }
            _ => self.item()?,
        };
        self.expect(b')')?;
        Ok(filter)
    }

    fn list(&mut self) -> StoreResult<Vec<Filter>> {
        let mut filters = Vec::new();
        while self.peek() == Some(b'(') {
            filters.push(self.filter()?);
        }
        if filters.is_empty() {
            return Err(self.error("empty filter list"));
        }
        Ok(filters)
    }

    fn item(&mut self) -> StoreResult<Filter> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' || c == b'-' || c == b'.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.error("expected attribute name"));
        }
        let attr = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();

        let op = match (self.peek(), self.input.get(self.pos + 1).copied()) {
            (Some(b'>'), Some(b'=')) => {
                self.pos += 2;
                b'>'
            }
            (Some(b'<'), Some(b'=')) => {
                self.pos += 2;
                b'<'
            }
            (Some(b'='), _) => {
                self.pos += 1;
                b'='
            }
            _ => return Err(self.error("expected '=', '>=' or '<='")),
        };

        let parts = self.value_parts()?;
        match op {
            b'>' | b'<' => {
                let [value] = <[String; 1]>::try_from(parts)
                    .map_err(|_| self.error("wildcards are only allowed with '='"))?;
                Ok(if op == b'>' {
                    Filter::GreaterOrEqual { attr, value }
                } else {
                    Filter::LessOrEqual { attr, value }
                })
            }
            _ if parts.len() == 1 => Ok(Filter::Equal {
                attr,
                value: parts.into_iter().next().unwrap_or_default(),
            }),
            _ if parts.len() == 2 && parts.iter().all(String::is_empty) => {
                Ok(Filter::Present { attr })
            }
            _ => {
                let mut parts = parts;
                let last = parts.pop().filter(|s| !s.is_empty());
                let mut iter = parts.into_iter();
                let initial = iter.next().filter(|s| !s.is_empty());
                let any = iter.filter(|s| !s.is_empty()).collect();
                Ok(Filter::Substring {
                    attr,
                    initial,
                    any,
                    last,
                })
            }
        }
    }

    /// Assertion value split on unescaped `*`
    fn value_parts(&mut self) -> StoreResult<Vec<String>> {
        let mut parts = Vec::new();
        let mut current: Vec<u8> = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated filter")),
                Some(b')') => break,
                Some(b'(') => return Err(self.error("unescaped '('")),
                Some(b'*') => {
                    self.pos += 1;
                    parts.push(self.text(&current)?);
                    current.clear();
                }
                Some(b'\\') => {
                    let hex = self
                        .input
                        .get(self.pos + 1..self.pos + 3)
                        .and_then(|h| std::str::from_utf8(h).ok())
                        .and_then(|h| u8::from_str_radix(h, 16).ok())
                        .ok_or_else(|| self.error("invalid escape"))?;
                    current.push(hex);
                    self.pos += 3;
                }
                Some(c) => {
                    current.push(c);
                    self.pos += 1;
                }
            }
        }
        parts.push(self.text(&current)?);
        Ok(parts)
    }

    fn text(&self, bytes: &[u8]) -> StoreResult<String> {
        String::from_utf8(bytes.to_vec()).map_err(|_| self.error("value is not utf-8"))
    }
}
