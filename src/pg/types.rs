//! PostgreSQL type identifiers and driver-native values.
//!
//! Results arrive in text format (simple query protocol). Each column value is
//! decoded into a [`PgValue`] according to the column's type OID.
//! Reference: https://www.postgresql.org/docs/current/datatype.html

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use uuid::Uuid;

use super::error::{PgError, PgResult};

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(pub u32);

impl Oid {
    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const OID_TYPE: Oid = Oid(26);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const UNKNOWN: Oid = Oid(705);
    pub const MONEY: Oid = Oid(790);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const INTERVAL: Oid = Oid(1186);
    pub const TIMETZ: Oid = Oid(1266);
    pub const NUMERIC: Oid = Oid(1700);
    pub const UUID: Oid = Oid(2950);
    pub const JSONB: Oid = Oid(3802);

    // Array types
    pub const BOOL_ARRAY: Oid = Oid(1000);
    pub const BYTEA_ARRAY: Oid = Oid(1001);
    pub const NAME_ARRAY: Oid = Oid(1003);
    pub const INT2_ARRAY: Oid = Oid(1005);
    pub const INT4_ARRAY: Oid = Oid(1007);
    pub const TEXT_ARRAY: Oid = Oid(1009);
    pub const BPCHAR_ARRAY: Oid = Oid(1014);
    pub const VARCHAR_ARRAY: Oid = Oid(1015);
    pub const INT8_ARRAY: Oid = Oid(1016);
    pub const FLOAT4_ARRAY: Oid = Oid(1021);
    pub const FLOAT8_ARRAY: Oid = Oid(1022);
    pub const OID_ARRAY: Oid = Oid(1028);
    pub const TIMESTAMP_ARRAY: Oid = Oid(1115);
    pub const DATE_ARRAY: Oid = Oid(1182);
    pub const TIME_ARRAY: Oid = Oid(1183);
    pub const TIMESTAMPTZ_ARRAY: Oid = Oid(1185);
    pub const NUMERIC_ARRAY: Oid = Oid(1231);
    pub const UUID_ARRAY: Oid = Oid(2951);
    pub const JSONB_ARRAY: Oid = Oid(3807);

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME | Oid::UNKNOWN
        )
    }

    /// Check if this is an integer type
    pub fn is_integer(self) -> bool {
        matches!(self, Oid::INT2 | Oid::INT4 | Oid::INT8 | Oid::OID_TYPE)
    }

    /// Check if this is a floating point type
    pub fn is_float(self) -> bool {
        matches!(self, Oid::FLOAT4 | Oid::FLOAT8)
    }

    /// Element type of a built-in array type.
    pub fn element_type(self) -> Option<Oid> {
        let element = match self {
            Oid::BOOL_ARRAY => Oid::BOOL,
            Oid::BYTEA_ARRAY => Oid::BYTEA,
            Oid::NAME_ARRAY => Oid::NAME,
            Oid::INT2_ARRAY => Oid::INT2,
            Oid::INT4_ARRAY => Oid::INT4,
            Oid::TEXT_ARRAY => Oid::TEXT,
            Oid::BPCHAR_ARRAY => Oid::BPCHAR,
            Oid::VARCHAR_ARRAY => Oid::VARCHAR,
            Oid::INT8_ARRAY => Oid::INT8,
            Oid::FLOAT4_ARRAY => Oid::FLOAT4,
            Oid::FLOAT8_ARRAY => Oid::FLOAT8,
            Oid::OID_ARRAY => Oid::OID_TYPE,
            Oid::TIMESTAMP_ARRAY => Oid::TIMESTAMP,
            Oid::DATE_ARRAY => Oid::DATE,
            Oid::TIME_ARRAY => Oid::TIME,
            Oid::TIMESTAMPTZ_ARRAY => Oid::TIMESTAMPTZ,
            Oid::NUMERIC_ARRAY => Oid::NUMERIC,
            Oid::UUID_ARRAY => Oid::UUID,
            Oid::JSONB_ARRAY => Oid::JSONB,
            _ => return None,
        };
        Some(element)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Type registry
// ============================================================================

/// Name and identifier of a wire type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    pub oid: Oid,
    pub name: String,
}

static BUILTIN_TYPES: Lazy<HashMap<Oid, &'static str>> = Lazy::new(|| {
    [
        (Oid::BOOL, "bool"),
        (Oid::BYTEA, "bytea"),
        (Oid::CHAR, "char"),
        (Oid::NAME, "name"),
        (Oid::INT8, "int8"),
        (Oid::INT2, "int2"),
        (Oid::INT4, "int4"),
        (Oid::TEXT, "text"),
        (Oid::OID_TYPE, "oid"),
        (Oid::JSON, "json"),
        (Oid::FLOAT4, "float4"),
        (Oid::FLOAT8, "float8"),
        (Oid::UNKNOWN, "unknown"),
        (Oid::MONEY, "money"),
        (Oid::BPCHAR, "bpchar"),
        (Oid::VARCHAR, "varchar"),
        (Oid::DATE, "date"),
        (Oid::TIME, "time"),
        (Oid::TIMESTAMP, "timestamp"),
        (Oid::TIMESTAMPTZ, "timestamptz"),
        (Oid::INTERVAL, "interval"),
        (Oid::TIMETZ, "timetz"),
        (Oid::NUMERIC, "numeric"),
        (Oid::UUID, "uuid"),
        (Oid::JSONB, "jsonb"),
        (Oid::BOOL_ARRAY, "_bool"),
        (Oid::BYTEA_ARRAY, "_bytea"),
        (Oid::NAME_ARRAY, "_name"),
        (Oid::INT2_ARRAY, "_int2"),
        (Oid::INT4_ARRAY, "_int4"),
        (Oid::TEXT_ARRAY, "_text"),
        (Oid::BPCHAR_ARRAY, "_bpchar"),
        (Oid::VARCHAR_ARRAY, "_varchar"),
        (Oid::INT8_ARRAY, "_int8"),
        (Oid::FLOAT4_ARRAY, "_float4"),
        (Oid::FLOAT8_ARRAY, "_float8"),
        (Oid::OID_ARRAY, "_oid"),
        (Oid::TIMESTAMP_ARRAY, "_timestamp"),
        (Oid::DATE_ARRAY, "_date"),
        (Oid::TIME_ARRAY, "_time"),
        (Oid::TIMESTAMPTZ_ARRAY, "_timestamptz"),
        (Oid::NUMERIC_ARRAY, "_numeric"),
        (Oid::UUID_ARRAY, "_uuid"),
        (Oid::JSONB_ARRAY, "_jsonb"),
    ]
    .into_iter()
    .collect()
});

/// OID → type name lookup.
///
/// Seeded with the built-in types; server-specific types (enums, domains,
/// extensions) can be registered after reading `pg_type`.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    custom: RwLock<HashMap<Oid, String>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a type by OID.
    pub fn lookup(&self, oid: Oid) -> Option<TypeInfo> {
        if let Some(name) = BUILTIN_TYPES.get(&oid) {
            return Some(TypeInfo {
                oid,
                name: (*name).to_string(),
            });
        }
        self.custom.read().get(&oid).map(|name| TypeInfo {
            oid,
            name: name.clone(),
        })
    }

    /// Register (or rename) a non-builtin type.
    pub fn register(&self, oid: Oid, name: impl Into<String>) {
        if !BUILTIN_TYPES.contains_key(&oid) {
            self.custom.write().insert(oid, name.into());
        }
    }

    /// Number of registered non-builtin types.
    pub fn custom_len(&self) -> usize {
        self.custom.read().len()
    }
}

// ============================================================================
// PostgreSQL Values
// ============================================================================

/// A decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Oid(u32),
    Float4(f32),
    Float8(f64),
    /// Arbitrary precision decimal, kept in its text form
    Numeric(String),
    Text(String),
    Bytea(Vec<u8>),
    Uuid(Uuid),
    Json(String),
    Date(NaiveDate),
    /// Time of day, microseconds since midnight
    Time(i64),
    Timestamp(NaiveDateTime),
    Timestamptz(DateTime<Utc>),
    /// One-dimensional view of an array (nested arrays are flattened)
    Array { element: Oid, items: Vec<PgValue> },
}

impl PgValue {
    /// Check if this value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    /// Short name of the variant, used in conversion diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            PgValue::Null => "null",
            PgValue::Bool(_) => "bool",
            PgValue::Int2(_) => "int2",
            PgValue::Int4(_) => "int4",
            PgValue::Int8(_) => "int8",
            PgValue::Oid(_) => "oid",
            PgValue::Float4(_) => "float4",
            PgValue::Float8(_) => "float8",
            PgValue::Numeric(_) => "numeric",
            PgValue::Text(_) => "text",
            PgValue::Bytea(_) => "bytea",
            PgValue::Uuid(_) => "uuid",
            PgValue::Json(_) => "json",
            PgValue::Date(_) => "date",
            PgValue::Time(_) => "time",
            PgValue::Timestamp(_) => "timestamp",
            PgValue::Timestamptz(_) => "timestamptz",
            PgValue::Array { .. } => "array",
        }
    }

    /// Get the OID for this value's type
    pub fn type_oid(&self) -> Oid {
        match self {
            PgValue::Null => Oid::UNKNOWN,
            PgValue::Bool(_) => Oid::BOOL,
            PgValue::Int2(_) => Oid::INT2,
            PgValue::Int4(_) => Oid::INT4,
            PgValue::Int8(_) => Oid::INT8,
            PgValue::Oid(_) => Oid::OID_TYPE,
            PgValue::Float4(_) => Oid::FLOAT4,
            PgValue::Float8(_) => Oid::FLOAT8,
            PgValue::Numeric(_) => Oid::NUMERIC,
            PgValue::Text(_) => Oid::TEXT,
            PgValue::Bytea(_) => Oid::BYTEA,
            PgValue::Uuid(_) => Oid::UUID,
            PgValue::Json(_) => Oid::JSONB,
            PgValue::Date(_) => Oid::DATE,
            PgValue::Time(_) => Oid::TIME,
            PgValue::Timestamp(_) => Oid::TIMESTAMP,
            PgValue::Timestamptz(_) => Oid::TIMESTAMPTZ,
            PgValue::Array { element, .. } => match *element {
                Oid::BOOL => Oid::BOOL_ARRAY,
                Oid::INT2 => Oid::INT2_ARRAY,
                Oid::INT4 => Oid::INT4_ARRAY,
                Oid::INT8 => Oid::INT8_ARRAY,
                Oid::FLOAT4 => Oid::FLOAT4_ARRAY,
                Oid::FLOAT8 => Oid::FLOAT8_ARRAY,
                Oid::VARCHAR => Oid::VARCHAR_ARRAY,
                Oid::TIMESTAMP => Oid::TIMESTAMP_ARRAY,
                Oid::TIMESTAMPTZ => Oid::TIMESTAMPTZ_ARRAY,
                _ => Oid::TEXT_ARRAY,
            },
        }
    }

    /// Decode a column value from text format.
    pub fn decode_text(oid: Oid, data: &[u8]) -> PgResult<Self> {
        if let Some(element) = oid.element_type() {
            return decode_array(element, data);
        }

        let text = String::from_utf8_lossy(data).into_owned();

        match oid {
            Oid::BOOL => match text.as_str() {
                "t" | "true" => Ok(PgValue::Bool(true)),
                "f" | "false" => Ok(PgValue::Bool(false)),
                other => Err(PgError::Type(format!("Invalid BOOL: {}", other))),
            },

            Oid::INT2 => text
                .parse::<i16>()
                .map(PgValue::Int2)
                .map_err(|e| PgError::Type(format!("Invalid INT2: {}", e))),

            Oid::INT4 => text
                .parse::<i32>()
                .map(PgValue::Int4)
                .map_err(|e| PgError::Type(format!("Invalid INT4: {}", e))),

            Oid::INT8 => text
                .parse::<i64>()
                .map(PgValue::Int8)
                .map_err(|e| PgError::Type(format!("Invalid INT8: {}", e))),

            Oid::OID_TYPE => text
                .parse::<u32>()
                .map(PgValue::Oid)
                .map_err(|e| PgError::Type(format!("Invalid OID: {}", e))),

            Oid::FLOAT4 => text
                .parse::<f32>()
                .map(PgValue::Float4)
                .map_err(|e| PgError::Type(format!("Invalid FLOAT4: {}", e))),

            Oid::FLOAT8 => text
                .parse::<f64>()
                .map(PgValue::Float8)
                .map_err(|e| PgError::Type(format!("Invalid FLOAT8: {}", e))),

            Oid::NUMERIC => Ok(PgValue::Numeric(text)),

            Oid::BYTEA => Ok(PgValue::Bytea(decode_bytea(data)?)),

            Oid::UUID => Uuid::parse_str(&text)
                .map(PgValue::Uuid)
                .map_err(|e| PgError::Type(format!("Invalid UUID: {}", e))),

            Oid::JSON | Oid::JSONB => Ok(PgValue::Json(text)),

            // Special values such as 'infinity' or BC dates stay textual
            Oid::DATE => Ok(NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                .map(PgValue::Date)
                .unwrap_or(PgValue::Text(text))),

            Oid::TIME => Ok(parse_time_of_day(&text)
                .map(PgValue::Time)
                .unwrap_or(PgValue::Text(text))),

            Oid::TIMESTAMP => Ok(
                NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f")
                    .map(PgValue::Timestamp)
                    .unwrap_or(PgValue::Text(text)),
            ),

            Oid::TIMESTAMPTZ => Ok(
                DateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f%#z")
                    .map(|t| PgValue::Timestamptz(t.with_timezone(&Utc)))
                    .unwrap_or(PgValue::Text(text)),
            ),

            // Text types and everything without a dedicated variant
            _ => Ok(PgValue::Text(text)),
        }
    }
}

impl fmt::Display for PgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgValue::Null => write!(f, "NULL"),
            PgValue::Bool(v) => write!(f, "{}", v),
            PgValue::Int2(v) => write!(f, "{}", v),
            PgValue::Int4(v) => write!(f, "{}", v),
            PgValue::Int8(v) => write!(f, "{}", v),
            PgValue::Oid(v) => write!(f, "{}", v),
            PgValue::Float4(v) => write!(f, "{}", v),
            PgValue::Float8(v) => write!(f, "{}", v),
            PgValue::Numeric(v) | PgValue::Text(v) | PgValue::Json(v) => f.write_str(v),
            PgValue::Bytea(v) => write!(f, "\\x{}", encode_hex(v)),
            PgValue::Uuid(v) => write!(f, "{}", v.hyphenated()),
            PgValue::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            PgValue::Time(micros) => {
                let secs = micros / 1_000_000;
                let frac = micros % 1_000_000;
                write!(
                    f,
                    "{:02}:{:02}:{:02}",
                    secs / 3600,
                    (secs / 60) % 60,
                    secs % 60
                )?;
                if frac != 0 {
                    write!(f, ".{:06}", frac)?;
                }
                Ok(())
            }
            PgValue::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f")),
            PgValue::Timestamptz(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f%:z")),
            PgValue::Array { items, .. } => {
                f.write_str("{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("}")
            }
        }
    }
}

// ============================================================================
// Text format helpers
// ============================================================================

/// Hex lookup table for fast byte-to-hex conversion
const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

/// Lowercase hex rendering of a byte slice.
pub fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(HEX_CHARS[(b >> 4) as usize] as char);
        out.push(HEX_CHARS[(b & 0x0f) as usize] as char);
    }
    out
}

/// Decode hex text. Returns `None` unless every pair is a valid hex byte.
pub fn decode_hex(text: &[u8]) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }

    fn nibble(c: u8) -> Option<u8> {
        match c {
            b'0'..=b'9' => Some(c - b'0'),
            b'a'..=b'f' => Some(c - b'a' + 10),
            b'A'..=b'F' => Some(c - b'A' + 10),
            _ => None,
        }
    }

    text.chunks_exact(2)
        .map(|pair| Some((nibble(pair[0])? << 4) | nibble(pair[1])?))
        .collect()
}

/// Decode bytea output: `\x` hex format or the legacy escape format.
fn decode_bytea(data: &[u8]) -> PgResult<Vec<u8>> {
    if let Some(hex) = data.strip_prefix(b"\\x") {
        return decode_hex(hex).ok_or_else(|| PgError::Type("Invalid BYTEA hex".to_string()));
    }

    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] != b'\\' {
            out.push(data[i]);
            i += 1;
        } else if data.get(i + 1) == Some(&b'\\') {
            out.push(b'\\');
            i += 2;
        } else {
            let octal = data
                .get(i + 1..i + 4)
                .and_then(|d| std::str::from_utf8(d).ok())
                .and_then(|d| u8::from_str_radix(d, 8).ok())
                .ok_or_else(|| PgError::Type("Invalid BYTEA escape".to_string()))?;
            out.push(octal);
            i += 4;
        }
    }
    Ok(out)
}

/// `HH:MM:SS[.ffffff]` → microseconds since midnight.
fn parse_time_of_day(text: &str) -> Option<i64> {
    if text == "24:00:00" {
        return Some(86_400_000_000);
    }
    let t = NaiveTime::parse_from_str(text, "%H:%M:%S%.f").ok()?;
    Some(t.num_seconds_from_midnight() as i64 * 1_000_000 + (t.nanosecond() / 1_000) as i64)
}

fn decode_array(element: Oid, data: &[u8]) -> PgResult<PgValue> {
    let text = String::from_utf8_lossy(data);
    let items = parse_array_literal(&text)?
        .into_iter()
        .map(|item| match item {
            Some(s) => PgValue::decode_text(element, s.as_bytes()),
            None => Ok(PgValue::Null),
        })
        .collect::<PgResult<Vec<_>>>()?;
    Ok(PgValue::Array { element, items })
}

/// Split an array literal (`{a,"b c",NULL}`) into its elements.
///
/// Nested dimensions are flattened in row-major order. Unquoted `NULL`
/// becomes `None`.
pub fn parse_array_literal(text: &str) -> PgResult<Vec<Option<String>>> {
    // Optional dimension decoration: [1:2]={...}
    let body = match text.find('=') {
        Some(pos) if text.starts_with('[') => &text[pos + 1..],
        _ => text,
    };

    if !body.starts_with('{') {
        return Err(PgError::Type(format!("Invalid array literal: {}", text)));
    }

    let mut items = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut has_item = false;
    let mut depth = 0usize;
    let mut chars = body.chars();

    let mut push = |current: &mut String, quoted: &mut bool, has_item: &mut bool| {
        if *has_item {
            let value = std::mem::take(current);
            if !*quoted && value.trim_end().eq_ignore_ascii_case("NULL") {
                items.push(None);
            } else if *quoted {
                items.push(Some(value));
            } else {
                items.push(Some(value.trim_end().to_string()));
            }
        }
        *quoted = false;
        *has_item = false;
    };

    while let Some(c) = chars.next() {
        match c {
            '{' => depth += 1,
            '}' => {
                push(&mut current, &mut quoted, &mut has_item);
                depth = depth.saturating_sub(1);
            }
            ',' if depth > 0 => push(&mut current, &mut quoted, &mut has_item),
            '"' => {
                quoted = true;
                has_item = true;
                loop {
                    match chars.next() {
                        Some('\\') => {
                            if let Some(escaped) = chars.next() {
                                current.push(escaped);
                            }
                        }
                        Some('"') => break,
                        Some(other) => current.push(other),
                        None => {
                            return Err(PgError::Type(format!(
                                "Unterminated quote in array literal: {}",
                                text
                            )))
                        }
                    }
                }
            }
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                    has_item = true;
                }
            }
            c if c.is_whitespace() && !has_item => {}
            c => {
                current.push(c);
                has_item = true;
            }
        }
    }

    if depth != 0 {
        return Err(PgError::Type(format!("Unbalanced array literal: {}", text)));
    }

    Ok(items)
}
