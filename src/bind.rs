//! Named-placeholder template binding.
//!
//! Templates use `:name` placeholders. Binding renders every value as a SQL
//! literal and splices it into the text, so the result can be sent over the
//! simple query protocol. Quoted literals, quoted identifiers, dollar-quoted
//! bodies, `--` and `/* */` comments and `::` casts are left untouched.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::trace;
use uuid::Uuid;

use crate::pg::types::encode_hex;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BindError {
    #[error("no value for placeholder :{name} in template {key}")]
    MissingValue { name: String, key: String },

    #[error("unterminated quoted text or comment in template {key}")]
    Unterminated { key: String },
}

/// A value that can be rendered as a SQL literal.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
    Array(Vec<BindValue>),
}

pub type BindValues = HashMap<String, BindValue>;

impl BindValue {
    /// Render as a SQL literal.
    pub fn to_sql(&self) -> String {
        match self {
            BindValue::Null => "NULL".to_string(),
            BindValue::Bool(true) => "TRUE".to_string(),
            BindValue::Bool(false) => "FALSE".to_string(),
            BindValue::Int(v) => v.to_string(),
            BindValue::Float(v) if v.is_nan() => "'NaN'::float8".to_string(),
            BindValue::Float(v) if v.is_infinite() => {
                let sign = if *v > 0.0 { "" } else { "-" };
                format!("'{}Infinity'::float8", sign)
            }
            BindValue::Float(v) => v.to_string(),
            BindValue::Text(s) => quote_literal(s),
            BindValue::Bytes(b) => format!("'\\x{}'::bytea", encode_hex(b)),
            BindValue::Timestamp(t) => {
                format!("'{}'::timestamptz", t.format("%Y-%m-%d %H:%M:%S%.6f+00"))
            }
            BindValue::Uuid(u) => format!("'{}'::uuid", u),
            BindValue::Array(items) if items.is_empty() => "'{}'".to_string(),
            BindValue::Array(items) => {
                let mut sql = String::from("ARRAY[");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        sql.push(',');
                    }
                    sql.push_str(&item.to_sql());
                }
                sql.push(']');
                sql
            }
        }
    }
}

fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

impl From<bool> for BindValue {
    fn from(v: bool) -> Self {
        BindValue::Bool(v)
    }
}

impl From<i16> for BindValue {
    fn from(v: i16) -> Self {
        BindValue::Int(v as i64)
    }
}

impl From<i32> for BindValue {
    fn from(v: i32) -> Self {
        BindValue::Int(v as i64)
    }
}

impl From<i64> for BindValue {
    fn from(v: i64) -> Self {
        BindValue::Int(v)
    }
}

impl From<u32> for BindValue {
    fn from(v: u32) -> Self {
        BindValue::Int(v as i64)
    }
}

impl From<f32> for BindValue {
    fn from(v: f32) -> Self {
        BindValue::Float(v as f64)
    }
}

impl From<f64> for BindValue {
    fn from(v: f64) -> Self {
        BindValue::Float(v)
    }
}

impl From<&str> for BindValue {
    fn from(v: &str) -> Self {
        BindValue::Text(v.to_string())
    }
}

impl From<String> for BindValue {
    fn from(v: String) -> Self {
        BindValue::Text(v)
    }
}

impl From<&[u8]> for BindValue {
    fn from(v: &[u8]) -> Self {
        BindValue::Bytes(v.to_vec())
    }
}

impl From<DateTime<Utc>> for BindValue {
    fn from(v: DateTime<Utc>) -> Self {
        BindValue::Timestamp(v)
    }
}

impl From<Uuid> for BindValue {
    fn from(v: Uuid) -> Self {
        BindValue::Uuid(v)
    }
}

impl<T: Into<BindValue>> From<Option<T>> for BindValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(BindValue::Null, Into::into)
    }
}

impl<T: Into<BindValue>> From<Vec<T>> for BindValue {
    fn from(v: Vec<T>) -> Self {
        BindValue::Array(v.into_iter().map(Into::into).collect())
    }
}

/// Turns a template plus values into executable SQL.
///
/// `key` names the template in errors and logs.
pub trait TemplateBinder: Send + Sync {
    fn bind(&self, template: &str, values: &BindValues, key: &str) -> Result<String, BindError>;
}

/// Binder for `:name` placeholders.
#[derive(Debug, Clone, Copy, Default)]
pub struct NamedBinder;

impl NamedBinder {
    pub fn new() -> Self {
        Self
    }
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

impl TemplateBinder for NamedBinder {
    fn bind(&self, template: &str, values: &BindValues, key: &str) -> Result<String, BindError> {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.char_indices().peekable();

        while let Some((start, c)) = chars.next() {
            match c {
                '\'' | '"' => {
                    // Copy through the closing quote; a doubled quote is an escape.
                    out.push(c);
                    let mut closed = false;
                    while let Some((_, q)) = chars.next() {
                        out.push(q);
                        if q == c {
                            if chars.peek().map(|&(_, n)| n) == Some(c) {
                                chars.next();
                                out.push(c);
                            } else {
                                closed = true;
                                break;
                            }
                        }
                    }
                    if !closed {
                        return Err(BindError::Unterminated {
                            key: key.to_string(),
                        });
                    }
                }
                '-' if chars.peek().map(|&(_, n)| n) == Some('-') => {
                    // Line comment: copy up to and including the newline.
                    let end = template[start..]
                        .find('\n')
                        .map_or(template.len(), |i| start + i + 1);
                    out.push_str(&template[start..end]);
                    skip_to(&mut chars, end);
                }
                '/' if chars.peek().map(|&(_, n)| n) == Some('*') => {
                    // Block comments do not nest here.
                    let end = template[start + 2..]
                        .find("*/")
                        .map(|i| start + 2 + i + 2)
                        .ok_or_else(|| BindError::Unterminated {
                            key: key.to_string(),
                        })?;
                    out.push_str(&template[start..end]);
                    skip_to(&mut chars, end);
                }
                '$' if !follows_identifier(template, start) => match dollar_tag(&template[start..]) {
                    Some(tag) => {
                        let body = start + tag.len();
                        let end = template[body..]
                            .find(tag)
                            .map(|i| body + i + tag.len())
                            .ok_or_else(|| BindError::Unterminated {
                                key: key.to_string(),
                            })?;
                        out.push_str(&template[start..end]);
                        skip_to(&mut chars, end);
                    }
                    None => out.push('$'),
                },
                ':' if chars.peek().map(|&(_, n)| n) == Some(':') => {
                    chars.next();
                    out.push_str("::");
                }
                ':' if chars.peek().is_some_and(|&(_, n)| is_name_start(n)) => {
                    let mut name = String::new();
                    while let Some(&(_, n)) = chars.peek() {
                        if !is_name_char(n) {
                            break;
                        }
                        name.push(n);
                        chars.next();
                    }
                    let value = values.get(&name).ok_or_else(|| BindError::MissingValue {
                        name: name.clone(),
                        key: key.to_string(),
                    })?;
                    out.push_str(&value.to_sql());
                }
                other => out.push(other),
            }
        }

        trace!(key, sql = %out, "bound template");
        Ok(out)
    }
}

/// Advance past every character that starts before byte offset `end`.
fn skip_to(chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>, end: usize) {
    while chars.peek().is_some_and(|&(i, _)| i < end) {
        chars.next();
    }
}

/// `$` inside an identifier such as `a$b` does not open a dollar quote.
fn follows_identifier(template: &str, at: usize) -> bool {
    template[..at]
        .chars()
        .next_back()
        .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

/// The opening `$tag$` (or `$$`) at the start of `s`, if there is one.
/// Positional parameters like `$1` are not tags.
fn dollar_tag(s: &str) -> Option<&str> {
    let rest = s.strip_prefix('$')?;
    let len = rest.find('$')?;
    let tag = &rest[..len];
    let valid = tag.chars().enumerate().all(|(i, c)| {
        if i == 0 {
            is_name_start(c)
        } else {
            is_name_char(c)
        }
    });
    valid.then(|| &s[..len + 2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn values(pairs: &[(&str, BindValue)]) -> BindValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_binds_named_placeholders() {
        let vals = values(&[("id", 7.into()), ("name", "O'Brien".into())]);
        let sql = NamedBinder
            .bind("SELECT * FROM users WHERE id = :id AND name = :name", &vals, "users.find")
            .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM users WHERE id = 7 AND name = 'O''Brien'"
        );
    }

    #[test]
    fn test_skips_casts_literals_and_comments() {
        let vals = values(&[("v", BindValue::Int(1))]);
        let template = "SELECT ':v', \"a:v\", :v::int8 -- :v here\nFROM t";
        let sql = NamedBinder.bind(template, &vals, "k").unwrap();
        assert_eq!(sql, "SELECT ':v', \"a:v\", 1::int8 -- :v here\nFROM t");
    }

    #[test]
    fn test_doubled_quote_stays_inside_literal() {
        let vals = values(&[("v", BindValue::Null)]);
        let sql = NamedBinder.bind("SELECT 'it''s :v', :v", &vals, "k").unwrap();
        assert_eq!(sql, "SELECT 'it''s :v', NULL");
    }

    #[test]
    fn test_missing_value_names_placeholder_and_key() {
        let err = NamedBinder
            .bind("DELETE FROM t WHERE id = :id", &BindValues::new(), "t.delete")
            .unwrap_err();
        assert_eq!(
            err,
            BindError::MissingValue {
                name: "id".to_string(),
                key: "t.delete".to_string()
            }
        );
        assert!(err.to_string().contains(":id"));
    }

    #[test]
    fn test_unterminated_literal() {
        let err = NamedBinder.bind("SELECT 'oops", &BindValues::new(), "k").unwrap_err();
        assert!(matches!(err, BindError::Unterminated { .. }));
    }

    #[test]
    fn test_skips_block_comments_and_dollar_quotes() {
        let vals = values(&[("v", BindValue::Int(2))]);
        let template = "/* :v */ SELECT $$ :v $$, $fn$ a :v $fn$, :v, a$b, $1 /* done */";
        let sql = NamedBinder.bind(template, &vals, "k").unwrap();
        assert_eq!(
            sql,
            "/* :v */ SELECT $$ :v $$, $fn$ a :v $fn$, 2, a$b, $1 /* done */"
        );
    }

    #[test]
    fn test_unterminated_block_comment_and_dollar_quote() {
        for template in ["SELECT 1 /* :v", "SELECT $body$ :v $other$"] {
            let err = NamedBinder.bind(template, &BindValues::new(), "k").unwrap_err();
            assert!(matches!(err, BindError::Unterminated { .. }), "{template}");
        }
    }

    #[test]
    fn test_literal_rendering() {
        assert_eq!(BindValue::from(true).to_sql(), "TRUE");
        assert_eq!(BindValue::from(None::<i32>).to_sql(), "NULL");
        assert_eq!(BindValue::from(2.5f64).to_sql(), "2.5");
        assert_eq!(BindValue::Float(f64::NAN).to_sql(), "'NaN'::float8");
        assert_eq!(BindValue::Float(f64::NEG_INFINITY).to_sql(), "'-Infinity'::float8");
        assert_eq!(BindValue::from(&b"\x01\xff"[..]).to_sql(), "'\\x01ff'::bytea");
        assert_eq!(BindValue::from(vec![1, 2, 3]).to_sql(), "ARRAY[1,2,3]");
        assert_eq!(BindValue::Array(vec![]).to_sql(), "'{}'");

        let t = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            BindValue::from(t).to_sql(),
            "'2024-01-02 03:04:05.000000+00'::timestamptz"
        );
    }
}
