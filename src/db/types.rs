//! Decoding of driver rows into [`SqlValue`]s.
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Database-specific decoders handle the actual value extraction
//!
//! PostgreSQL queries run over the extended protocol, so values arrive in
//! binary format. Types without a typed decoder fall back to their bytes as
//! UTF-8 text when that is readable, and to null otherwise.

use crate::models::{DatabaseType, ResultSet, Row, SqlValue};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row as _, Type, TypeInfo, ValueRef};

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    TimeTz,
    Interval,
    Money,
    Uuid,
    Array,
    Json,
    Binary,
    Text,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    if lower.ends_with("[]") {
        return TypeCategory::Array;
    }
    if lower.contains("range") {
        return TypeCategory::Text;
    }

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC is actually a float
        if db == DatabaseType::SQLite && lower == "numeric" {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    match lower.as_str() {
        "int2" | "int4" | "int8" | "smallint" | "integer" | "int" | "bigint" | "serial"
        | "bigserial" | "smallserial" | "tinyint" | "mediumint" | "oid" => TypeCategory::Integer,
        "bool" | "boolean" => TypeCategory::Boolean,
        "float4" | "float8" | "real" | "float" | "double" | "double precision" => {
            TypeCategory::Float
        }
        "date" => TypeCategory::Date,
        "time" => TypeCategory::Time,
        "timestamp" | "datetime" => TypeCategory::Timestamp,
        "timestamptz" => TypeCategory::TimestampTz,
        "timetz" => TypeCategory::TimeTz,
        "interval" => TypeCategory::Interval,
        "money" => TypeCategory::Money,
        "uuid" => TypeCategory::Uuid,
        "json" | "jsonb" => TypeCategory::Json,
        "bytea" | "blob" => TypeCategory::Binary,
        // Declared SQLite types such as "UNSIGNED BIG INT" or "VARBINARY(16)"
        _ if db == DatabaseType::SQLite && lower.contains("int") => TypeCategory::Integer,
        _ if lower.contains("blob") || lower.contains("binary") => TypeCategory::Binary,
        // Default to text for everything else (varchar, text, enums, inet, ...)
        _ => TypeCategory::Text,
    }
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw NUMERIC values as strings.
/// This preserves the exact database representation, including scale.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        match value.format() {
            PgValueFormat::Binary => numeric_to_string(value.as_bytes()?).map(RawDecimal),
            PgValueFormat::Text => {
                let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
                Ok(RawDecimal(s.to_string()))
            }
        }
    }
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Render a binary NUMERIC (base-10000 digits) the way the server prints it.
///
/// Layout: `ndigits: i16`, `weight: i16`, `sign: u16`, `dscale: u16`, then
/// `ndigits` big-endian `i16` digits. `weight` is the power of 10000 of the
/// first digit.
pub fn numeric_to_string(buf: &[u8]) -> Result<String, sqlx::error::BoxDynError> {
    let header = |at: usize| -> Result<u16, sqlx::error::BoxDynError> {
        buf.get(at..at + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "truncated NUMERIC header".into())
    };
    let ndigits = header(0)? as i16;
    let weight = header(2)? as i16 as i32;
    let sign = header(4)?;
    let dscale = header(6)? as usize;

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        _ => {}
    }

    let ndigits = usize::try_from(ndigits).map_err(|_| "negative NUMERIC digit count")?;
    let digits = buf
        .get(8..8 + ndigits * 2)
        .ok_or("truncated NUMERIC digits")?
        .chunks_exact(2)
        .map(|b| i16::from_be_bytes([b[0], b[1]]))
        .collect::<Vec<_>>();
    let digit_at = |i: i32| {
        usize::try_from(i)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG && !digits.iter().all(|d| *d == 0) {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        for i in 0..=weight {
            if i == 0 {
                out.push_str(&digit_at(i).to_string());
            } else {
                out.push_str(&format!("{:04}", digit_at(i)));
            }
        }
    }
    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut i = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", digit_at(i)));
            i += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Ok(out)
}

/// Interval in the server's default `postgres` output style,
/// e.g. `1 year 2 mons 3 days 04:05:06.5`.
pub fn format_interval(months: i32, days: i32, microseconds: i64) -> String {
    fn unit(n: i32, name: &str) -> String {
        if n == 1 {
            format!("{n} {name}")
        } else {
            format!("{n} {name}s")
        }
    }

    let mut parts = Vec::new();
    let (years, mons) = (months / 12, months % 12);
    if years != 0 {
        parts.push(unit(years, "year"));
    }
    if mons != 0 {
        parts.push(unit(mons, "mon"));
    }
    if days != 0 {
        parts.push(unit(days, "day"));
    }
    if microseconds != 0 || parts.is_empty() {
        let sign = if microseconds < 0 { "-" } else { "" };
        let total = microseconds.unsigned_abs();
        let (secs, frac) = (total / 1_000_000, total % 1_000_000);
        let mut time = format!(
            "{sign}{:02}:{:02}:{:02}",
            secs / 3600,
            secs / 60 % 60,
            secs % 60
        );
        if frac != 0 {
            let frac = format!("{frac:06}");
            time.push('.');
            time.push_str(frac.trim_end_matches('0'));
        }
        parts.push(time);
    }
    parts.join(" ")
}

// =============================================================================
// Row Decoding
// =============================================================================

/// Conversion of a driver row into a gateway [`Row`].
pub trait DecodeRow {
    fn decode_row(&self) -> Row;
}

impl DecodeRow for PgRow {
    fn decode_row(&self) -> Row {
        let mut row = Row::new();
        for (idx, col) in self.columns().iter().enumerate() {
            let category = categorize_type(col.type_info().name(), DatabaseType::PostgreSQL);
            row.push(col.name(), postgres::decode_column(self, idx, category));
        }
        row
    }
}

impl DecodeRow for SqliteRow {
    fn decode_row(&self) -> Row {
        let mut row = Row::new();
        for (idx, col) in self.columns().iter().enumerate() {
            row.push(
                col.name(),
                sqlite::decode_column(self, idx, col.type_info().name()),
            );
        }
        row
    }
}

/// Decode all driver rows, preserving order.
pub fn decode_rows<R: DecodeRow>(rows: &[R]) -> ResultSet {
    ResultSet::from_rows(rows.iter().map(DecodeRow::decode_row).collect())
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

mod postgres {
    use super::*;
    use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
    use serde_json::Value as JsonValue;
    use sqlx::postgres::types::{Oid, PgInterval, PgMoney, PgTimeTz};
    use sqlx::types::Uuid;

    pub fn decode_column(row: &PgRow, idx: usize, category: TypeCategory) -> SqlValue {
        match row.try_get_raw(idx) {
            Ok(raw) if raw.is_null() => return SqlValue::Null,
            Ok(_) => {}
            Err(e) => {
                tracing::error!(column = idx, error = %e, "Failed to read column");
                return SqlValue::Null;
            }
        }

        let decoded = match category {
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Decimal => row
                .try_get::<RawDecimal, _>(idx)
                .ok()
                .map(|v| SqlValue::Decimal(v.0)),
            TypeCategory::Boolean => row.try_get::<bool, _>(idx).ok().map(SqlValue::Bool),
            TypeCategory::Date => row.try_get::<NaiveDate, _>(idx).ok().map(SqlValue::Date),
            TypeCategory::Time => row.try_get::<NaiveTime, _>(idx).ok().map(SqlValue::Time),
            TypeCategory::Timestamp => row
                .try_get::<NaiveDateTime, _>(idx)
                .ok()
                .map(SqlValue::Timestamp),
            TypeCategory::TimestampTz => row
                .try_get::<DateTime<Utc>, _>(idx)
                .ok()
                .map(SqlValue::TimestampTz),
            TypeCategory::TimeTz => row
                .try_get::<PgTimeTz<NaiveTime, FixedOffset>, _>(idx)
                .ok()
                .map(|v| SqlValue::Text(format!("{}{}", v.time, v.offset))),
            TypeCategory::Interval => row
                .try_get::<PgInterval, _>(idx)
                .ok()
                .map(|v| SqlValue::Text(format_interval(v.months, v.days, v.microseconds))),
            TypeCategory::Money => row
                .try_get::<PgMoney, _>(idx)
                .ok()
                .map(|v| SqlValue::Decimal(format_money(v.0))),
            TypeCategory::Uuid => row
                .try_get::<Uuid, _>(idx)
                .ok()
                .map(|v| SqlValue::Text(v.to_string())),
            TypeCategory::Array => decode_array(row, idx),
            TypeCategory::Json => row.try_get::<JsonValue, _>(idx).ok().map(SqlValue::Json),
            TypeCategory::Binary => row.try_get::<Vec<u8>, _>(idx).ok().map(SqlValue::Bytes),
            TypeCategory::Text => None,
        };

        decoded.unwrap_or_else(|| decode_text(row, idx))
    }

    fn decode_integer(row: &PgRow, idx: usize) -> Option<SqlValue> {
        if let Ok(v) = row.try_get::<i16, _>(idx) {
            return Some(SqlValue::Int(v.into()));
        }
        if let Ok(v) = row.try_get::<i32, _>(idx) {
            return Some(SqlValue::Int(v.into()));
        }
        if let Ok(v) = row.try_get::<Oid, _>(idx) {
            return Some(SqlValue::Int(v.0.into()));
        }
        row.try_get::<i64, _>(idx).ok().map(SqlValue::Int)
    }

    fn decode_float(row: &PgRow, idx: usize) -> Option<SqlValue> {
        if let Ok(v) = row.try_get::<f64, _>(idx) {
            return Some(SqlValue::Float(v));
        }
        row.try_get::<f32, _>(idx)
            .ok()
            .map(|v| SqlValue::Float(v.into()))
    }

    /// One-dimensional arrays of scalar elements become JSON arrays.
    fn decode_array(row: &PgRow, idx: usize) -> Option<SqlValue> {
        fn json<T: Into<JsonValue>>(items: Vec<Option<T>>) -> Option<SqlValue> {
            let items = items
                .into_iter()
                .map(|v| v.map_or(JsonValue::Null, Into::into))
                .collect();
            Some(SqlValue::Json(JsonValue::Array(items)))
        }

        if let Ok(v) = row.try_get::<Vec<Option<i16>>, _>(idx) {
            return json(v);
        }
        if let Ok(v) = row.try_get::<Vec<Option<i32>>, _>(idx) {
            return json(v);
        }
        if let Ok(v) = row.try_get::<Vec<Option<i64>>, _>(idx) {
            return json(v);
        }
        if let Ok(v) = row.try_get::<Vec<Option<f64>>, _>(idx) {
            return json(v);
        }
        if let Ok(v) = row.try_get::<Vec<Option<f32>>, _>(idx) {
            return json(v);
        }
        if let Ok(v) = row.try_get::<Vec<Option<bool>>, _>(idx) {
            return json(v);
        }
        if let Ok(v) = row.try_get::<Vec<Option<String>>, _>(idx) {
            return json(v);
        }
        if let Ok(v) = row.try_get::<Vec<Option<Uuid>>, _>(idx) {
            return json(v.into_iter().map(|u| u.map(|u| u.to_string())).collect());
        }
        None
    }

    /// Readable bytes as text. Binary encodings of types without a decoder
    /// (geometry, network addresses, multi-dimensional arrays) come back null.
    fn decode_text(row: &PgRow, idx: usize) -> SqlValue {
        let raw = match row.try_get_raw(idx) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(column = idx, error = %e, "Failed to decode column as text");
                return SqlValue::Null;
            }
        };
        let type_name = raw.type_info().name().to_string();
        let text = match raw.format() {
            PgValueFormat::Text => raw.as_str().map(str::to_string).ok(),
            PgValueFormat::Binary => raw
                .as_str()
                .ok()
                .filter(|s| is_readable_text(s))
                .map(str::to_string),
        };
        text.map(SqlValue::Text).unwrap_or_else(|| {
            tracing::warn!(
                column = idx,
                column_type = %type_name,
                "Unsupported column type, returning null; cast it to text in the query"
            );
            SqlValue::Null
        })
    }
}

/// Control characters other than whitespace mean the bytes are a binary
/// encoding, not text.
fn is_readable_text(s: &str) -> bool {
    !s.chars()
        .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
}

/// MONEY is carried as an integer count of cents.
fn format_money(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

mod sqlite {
    use super::*;

    /// SQLite values are decoded by their storage class; the declared type
    /// only matters for BOOLEAN columns.
    pub fn decode_column(row: &SqliteRow, idx: usize, declared: &str) -> SqlValue {
        let storage = match row.try_get_raw(idx) {
            Ok(raw) if raw.is_null() => return SqlValue::Null,
            Ok(raw) => raw.type_info().name().to_string(),
            Err(e) => {
                tracing::error!(column = idx, error = %e, "Failed to read column");
                return SqlValue::Null;
            }
        };
        let declared = categorize_type(declared, DatabaseType::SQLite);

        match categorize_type(&storage, DatabaseType::SQLite) {
            TypeCategory::Integer if declared == TypeCategory::Boolean => row
                .try_get_unchecked::<i64, _>(idx)
                .map(|v| SqlValue::Bool(v != 0))
                .unwrap_or(SqlValue::Null),
            TypeCategory::Integer => row
                .try_get_unchecked::<i64, _>(idx)
                .map(SqlValue::Int)
                .unwrap_or(SqlValue::Null),
            TypeCategory::Float => row
                .try_get_unchecked::<f64, _>(idx)
                .map(SqlValue::Float)
                .unwrap_or(SqlValue::Null),
            TypeCategory::Binary => row
                .try_get_unchecked::<Vec<u8>, _>(idx)
                .map(SqlValue::Bytes)
                .unwrap_or(SqlValue::Null),
            _ => decode_text(row, idx),
        }
    }

    fn decode_text(row: &SqliteRow, idx: usize) -> SqlValue {
        match row.try_get_unchecked::<String, _>(idx) {
            Ok(v) => SqlValue::Text(v),
            Err(e) => {
                tracing::warn!(column = idx, error = %e, "Failed to decode column as text");
                SqlValue::Null
            }
        }
    }
}
