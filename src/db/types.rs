//! Database-agnostic type mappings.
//!
//! This module maps relational column values to driver-native [`RawValue`]s.
//!
//! # Architecture
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Database-specific decoders handle the actual value extraction
//!
//! A value the decoder cannot extract becomes [`RawValue::Unsupported`]; the result
//! normalizer turns that into an error naming the column.

use crate::models::{BackendKind, ColumnMetadata, RawValue};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo, ValueRef};

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
    Text,
    Binary,
    Json,
    Uuid,
    /// Timestamp carrying a zone
    TimestampTz,
    /// Timestamp without zone
    DateTime,
    Date,
    Time,
    Array,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, backend: BackendKind) -> TypeCategory {
    let lower = type_name.to_lowercase();

    if lower.ends_with("[]") || lower.starts_with('_') {
        return TypeCategory::Array;
    }

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC is actually a float
        if backend == BackendKind::SQLite && lower == "numeric" {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    // Temporal types, before the "int" check ("interval", "point" are not integers)
    match lower.as_str() {
        "timestamptz" | "timestamp with time zone" => return TypeCategory::TimestampTz,
        "timestamp" | "timestamp without time zone" | "datetime" => {
            return TypeCategory::DateTime;
        }
        "date" => return TypeCategory::Date,
        "time" | "time without time zone" => return TypeCategory::Time,
        "interval" | "point" | "timetz" => return TypeCategory::Unknown,
        _ => {}
    }

    // Integer types
    if lower.contains("int") || lower.contains("serial") || lower.contains("tiny") {
        return TypeCategory::Integer;
    }

    // Boolean
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    // Float types
    if lower.contains("float")
        || lower.contains("double")
        || lower == "real"
        || lower == "float4"
        || lower == "float8"
    {
        return TypeCategory::Float;
    }

    // JSON types
    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    // UUID (PostgreSQL)
    if lower == "uuid" {
        return TypeCategory::Uuid;
    }

    // Binary types
    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    if lower.contains("char") || lower.contains("text") || lower == "name" || lower == "enum" {
        return TypeCategory::Text;
    }

    TypeCategory::Unknown
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw DECIMAL/NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

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
            PgValueFormat::Text => {
                let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
                Ok(RawDecimal(s.to_string()))
            }
            PgValueFormat::Binary => Ok(RawDecimal(pg_numeric_to_string(value.as_bytes()?)?)),
        }
    }
}

/// Render PostgreSQL's binary NUMERIC (base-10000 digits) as exact decimal text.
fn pg_numeric_to_string(buf: &[u8]) -> Result<String, sqlx::error::BoxDynError> {
    use std::fmt::Write as _;

    if buf.len() < 8 {
        return Err("NUMERIC value too short".into());
    }
    let read = |at: usize| u16::from_be_bytes([buf[at], buf[at + 1]]);
    let ndigits = read(0) as usize;
    let weight = read(2) as i16 as i32;
    let sign = read(4);
    let dscale = read(6) as usize;

    match sign {
        0x0000 | 0x4000 => {}
        0xC000 => return Ok("NaN".to_string()),
        0xD000 => return Ok("Infinity".to_string()),
        0xF000 => return Ok("-Infinity".to_string()),
        other => return Err(format!("invalid NUMERIC sign {other:#x}").into()),
    }
    if buf.len() < 8 + ndigits * 2 {
        return Err("NUMERIC digits truncated".into());
    }
    let digit = |k: i32| -> u16 {
        if k >= 0 && (k as usize) < ndigits {
            read(8 + k as usize * 2)
        } else {
            0
        }
    };

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }
    if weight >= 0 {
        for k in 0..=weight {
            if k == 0 {
                let _ = write!(out, "{}", digit(k));
            } else {
                let _ = write!(out, "{:04}", digit(k));
            }
        }
    } else {
        out.push('0');
    }
    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut k = weight + 1;
        while frac.len() < dscale {
            let _ = write!(frac, "{:04}", digit(k));
            k += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Ok(out)
}

// =============================================================================
// Row Decoding Trait
// =============================================================================

/// Trait for converting database rows to raw values.
pub trait RowDecode {
    fn decode_values(&self) -> Vec<RawValue>;
    fn column_metadata(&self) -> Vec<ColumnMetadata>;
}

fn column_metadata<R: Row>(row: &R) -> Vec<ColumnMetadata> {
    row.columns()
        .iter()
        .map(|col| {
            ColumnMetadata::new(
                col.name(),
                col.type_info().name(),
                !col.type_info().is_null(),
            )
        })
        .collect()
}

fn is_null<R: Row>(row: &R, idx: usize) -> bool
where
    usize: sqlx::ColumnIndex<R>,
{
    row.try_get_raw(idx).map(|v| v.is_null()).unwrap_or(false)
}

fn unsupported(type_name: &str) -> RawValue {
    RawValue::Unsupported {
        type_name: type_name.to_string(),
    }
}

/// Turn one decode attempt into a raw value.
fn take<T>(
    result: Result<Option<T>, sqlx::Error>,
    type_name: &str,
    map: impl FnOnce(T) -> RawValue,
) -> RawValue {
    match result {
        Ok(Some(v)) => map(v),
        Ok(None) => RawValue::Null,
        Err(e) => {
            tracing::debug!(type_name, error = %e, "Failed to decode column");
            unsupported(type_name)
        }
    }
}

fn float(v: f64) -> RawValue {
    RawValue::Float(v)
}

impl RowDecode for MySqlRow {
    fn decode_values(&self) -> Vec<RawValue> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                if is_null(self, idx) {
                    return RawValue::Null;
                }
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, BackendKind::MySQL);
                mysql::decode_column(self, idx, type_name, category)
            })
            .collect()
    }

    fn column_metadata(&self) -> Vec<ColumnMetadata> {
        column_metadata(self)
    }
}

impl RowDecode for PgRow {
    fn decode_values(&self) -> Vec<RawValue> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                if is_null(self, idx) {
                    return RawValue::Null;
                }
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, BackendKind::PostgreSQL);
                postgres::decode_column(self, idx, type_name, category)
            })
            .collect()
    }

    fn column_metadata(&self) -> Vec<ColumnMetadata> {
        column_metadata(self)
    }
}

impl RowDecode for SqliteRow {
    fn decode_values(&self) -> Vec<RawValue> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let Ok(raw) = self.try_get_raw(idx) else {
                    return unsupported(col.type_info().name());
                };
                if raw.is_null() {
                    return RawValue::Null;
                }
                // Declared type first; SQLite may store anything, so fall back to the
                // value's storage class.
                let declared = col.type_info().name();
                let storage = raw.type_info().name().to_string();
                let value = sqlite::decode_column(
                    self,
                    idx,
                    declared,
                    categorize_type(declared, BackendKind::SQLite),
                );
                match value {
                    RawValue::Unsupported { .. } => sqlite::decode_column(
                        self,
                        idx,
                        &storage,
                        categorize_type(&storage, BackendKind::SQLite),
                    ),
                    value => value,
                }
            })
            .collect()
    }

    fn column_metadata(&self) -> Vec<ColumnMetadata> {
        column_metadata(self)
    }
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

mod mysql {
    use super::*;

    pub fn decode_column(
        row: &MySqlRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> RawValue {
        match category {
            TypeCategory::Decimal => {
                take(row.try_get::<Option<RawDecimal>, _>(idx), type_name, |v| {
                    RawValue::Decimal(v.0)
                })
            }
            TypeCategory::Integer => decode_integer(row, idx, type_name),
            TypeCategory::Boolean => take(row.try_get(idx), type_name, RawValue::Bool),
            TypeCategory::Float => decode_float(row, idx, type_name),
            TypeCategory::Binary => take(row.try_get(idx), type_name, RawValue::Bytes),
            TypeCategory::Json => take(row.try_get(idx), type_name, RawValue::Json),
            TypeCategory::DateTime => {
                take(row.try_get::<Option<NaiveDateTime>, _>(idx), type_name, |v| {
                    RawValue::NaiveTimestamp(v)
                })
            }
            TypeCategory::TimestampTz => {
                take(row.try_get::<Option<DateTime<Utc>>, _>(idx), type_name, |v| {
                    RawValue::Timestamp(v)
                })
            }
            TypeCategory::Date => take(row.try_get::<Option<NaiveDate>, _>(idx), type_name, |v| {
                RawValue::Date(v)
            }),
            TypeCategory::Time => take(row.try_get::<Option<NaiveTime>, _>(idx), type_name, |v| {
                RawValue::Time(v)
            }),
            _ => decode_text(row, idx, type_name),
        }
    }

    fn decode_integer(row: &MySqlRow, idx: usize, type_name: &str) -> RawValue {
        if type_name.to_lowercase().contains("unsigned") {
            return take(row.try_get::<Option<u64>, _>(idx), type_name, RawValue::UInt);
        }
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return RawValue::Int(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
            return RawValue::Int(v.into());
        }
        // Unflagged unsigned types (e.g. YEAR)
        take(row.try_get::<Option<u64>, _>(idx), type_name, RawValue::UInt)
    }

    fn decode_float(row: &MySqlRow, idx: usize, type_name: &str) -> RawValue {
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return float(v);
        }
        take(row.try_get::<Option<f32>, _>(idx), type_name, |v| {
            float(f64::from(v))
        })
    }

    fn decode_text(row: &MySqlRow, idx: usize, type_name: &str) -> RawValue {
        take(row.try_get::<Option<String>, _>(idx), type_name, |v| {
            // Check if this might be JSON
            if type_name.to_lowercase().contains("json") {
                if let Ok(json) = serde_json::from_str::<JsonValue>(&v) {
                    return RawValue::Json(json);
                }
            }
            RawValue::Text(v)
        })
    }
}

mod postgres {
    use super::*;

    pub fn decode_column(
        row: &PgRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> RawValue {
        match category {
            TypeCategory::Decimal => {
                take(row.try_get::<Option<RawDecimal>, _>(idx), type_name, |v| {
                    RawValue::Decimal(v.0)
                })
            }
            TypeCategory::Integer => decode_integer(row, idx, type_name),
            TypeCategory::Boolean => take(row.try_get(idx), type_name, RawValue::Bool),
            TypeCategory::Float => decode_float(row, idx, type_name),
            TypeCategory::Binary => take(row.try_get(idx), type_name, RawValue::Bytes),
            TypeCategory::Json => take(row.try_get(idx), type_name, RawValue::Json),
            TypeCategory::Uuid => take(row.try_get::<Option<uuid::Uuid>, _>(idx), type_name, |v| {
                RawValue::Uuid(v.to_string())
            }),
            TypeCategory::TimestampTz => {
                take(row.try_get::<Option<DateTime<Utc>>, _>(idx), type_name, |v| {
                    RawValue::Timestamp(v)
                })
            }
            TypeCategory::DateTime => {
                take(row.try_get::<Option<NaiveDateTime>, _>(idx), type_name, |v| {
                    RawValue::NaiveTimestamp(v)
                })
            }
            TypeCategory::Date => take(row.try_get::<Option<NaiveDate>, _>(idx), type_name, |v| {
                RawValue::Date(v)
            }),
            TypeCategory::Time => take(row.try_get::<Option<NaiveTime>, _>(idx), type_name, |v| {
                RawValue::Time(v)
            }),
            TypeCategory::Array => decode_array(row, idx, type_name),
            _ => take(row.try_get(idx), type_name, RawValue::Text),
        }
    }

    fn decode_integer(row: &PgRow, idx: usize, type_name: &str) -> RawValue {
        if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
            return RawValue::Int(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
            return RawValue::Int(v.into());
        }
        take(row.try_get::<Option<i64>, _>(idx), type_name, RawValue::Int)
    }

    fn decode_float(row: &PgRow, idx: usize, type_name: &str) -> RawValue {
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return float(v);
        }
        take(row.try_get::<Option<f32>, _>(idx), type_name, |v| {
            float(f64::from(v))
        })
    }

    fn decode_array(row: &PgRow, idx: usize, type_name: &str) -> RawValue {
        fn seq<T>(items: Vec<Option<T>>, map: impl Fn(T) -> RawValue) -> RawValue {
            RawValue::Array(
                items
                    .into_iter()
                    .map(|item| item.map(&map).unwrap_or(RawValue::Null))
                    .collect(),
            )
        }

        let element = type_name.trim_end_matches("[]").trim_start_matches('_');
        match categorize_type(element, BackendKind::PostgreSQL) {
            TypeCategory::Integer => {
                if let Ok(Some(v)) = row.try_get::<Option<Vec<Option<i16>>>, _>(idx) {
                    return seq(v, |i| RawValue::Int(i.into()));
                }
                if let Ok(Some(v)) = row.try_get::<Option<Vec<Option<i32>>>, _>(idx) {
                    return seq(v, |i| RawValue::Int(i.into()));
                }
                take(row.try_get(idx), type_name, |v| seq(v, RawValue::Int))
            }
            TypeCategory::Float => take(row.try_get(idx), type_name, |v| seq(v, float)),
            TypeCategory::Boolean => take(row.try_get(idx), type_name, |v| seq(v, RawValue::Bool)),
            TypeCategory::Uuid => take(
                row.try_get::<Option<Vec<Option<uuid::Uuid>>>, _>(idx),
                type_name,
                |v| seq(v, |u| RawValue::Uuid(u.to_string())),
            ),
            TypeCategory::Text => take(row.try_get(idx), type_name, |v| seq(v, RawValue::Text)),
            _ => unsupported(type_name),
        }
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(
        row: &SqliteRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> RawValue {
        match category {
            TypeCategory::Integer => take(row.try_get(idx), type_name, RawValue::Int),
            TypeCategory::Boolean => take(row.try_get(idx), type_name, RawValue::Bool),
            TypeCategory::Float | TypeCategory::Decimal => {
                take(row.try_get(idx), type_name, float)
            }
            TypeCategory::Binary => take(row.try_get(idx), type_name, RawValue::Bytes),
            TypeCategory::DateTime | TypeCategory::TimestampTz => {
                take(row.try_get::<Option<NaiveDateTime>, _>(idx), type_name, |v| {
                    RawValue::NaiveTimestamp(v)
                })
            }
            TypeCategory::Date => take(row.try_get::<Option<NaiveDate>, _>(idx), type_name, |v| {
                RawValue::Date(v)
            }),
            TypeCategory::Time => take(row.try_get::<Option<NaiveTime>, _>(idx), type_name, |v| {
                RawValue::Time(v)
            }),
            _ => decode_text(row, idx, type_name),
        }
    }

    fn decode_text(row: &SqliteRow, idx: usize, type_name: &str) -> RawValue {
        take(row.try_get::<Option<String>, _>(idx), type_name, |v| {
            if type_name.to_lowercase().contains("json") {
                if let Ok(json) = serde_json::from_str::<JsonValue>(&v) {
                    return RawValue::Json(json);
                }
            }
            RawValue::Text(v)
        })
    }
}
