//! Result models.
//!
//! Drivers produce [`RawResult`]s made of driver-native [`RawValue`]s. The result
//! normalizer turns those into the backend-independent [`CanonicalResult`].

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    /// Database-specific type (e.g., "int8", "varchar", "TEXT")
    pub type_name: String,
    pub nullable: bool,
}

impl ColumnMetadata {
    /// Create new column metadata.
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            nullable,
        }
    }
}

/// A value exactly as the driver decoded it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    /// Exact textual representation of a DECIMAL/NUMERIC
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    /// Timestamp without zone information
    NaiveTimestamp(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
    Uuid(String),
    /// Document-store object identifier (hex)
    ObjectId(String),
    Json(JsonValue),
    Array(Vec<RawValue>),
    /// Nested document, fields in native order
    Document(Vec<(String, RawValue)>),
    /// The driver could not decode this value.
    Unsupported { type_name: String },
}

/// Driver-native response to one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum RawResult {
    Rows {
        columns: Vec<ColumnMetadata>,
        rows: Vec<Vec<RawValue>>,
        rows_affected: Option<u64>,
        last_insert_id: Option<i64>,
    },
    Documents {
        documents: Vec<Vec<(String, RawValue)>>,
    },
    Ack {
        affected: u64,
        generated_ids: Vec<RawValue>,
    },
    /// One entry per statement of a transaction block.
    Batch(Vec<RawResult>),
}

impl RawResult {
    /// Result for write statements that return no rows.
    pub fn ack(affected: u64) -> Self {
        Self::Ack {
            affected,
            generated_ids: Vec::new(),
        }
    }

    /// Number of rows or documents carried by this result.
    pub fn row_count(&self) -> usize {
        match self {
            Self::Rows { rows, .. } => rows.len(),
            Self::Documents { documents } => documents.len(),
            Self::Ack { .. } => 0,
            Self::Batch(results) => results.iter().map(RawResult::row_count).sum(),
        }
    }
}

/// Backend-independent scalar or nested value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CanonicalValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
    #[serde(serialize_with = "serialize_base64")]
    Binary(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Record(Record),
    Sequence(Vec<CanonicalValue>),
}

fn serialize_base64<S: Serializer>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    serializer.serialize_str(&STANDARD.encode(bytes))
}

/// Ordered field-name to value mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, CanonicalValue)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field; a repeated name replaces the earlier value in place.
    pub fn insert(&mut self, name: impl Into<String>, value: CanonicalValue) {
        let name = name.into();
        match self.fields.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(field, _)| field == name)
    }

    pub fn get(&self, name: &str) -> Option<&CanonicalValue> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CanonicalValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }
}

impl FromIterator<(String, CanonicalValue)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, CanonicalValue)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (name, value) in iter {
            record.insert(name, value);
        }
        record
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Uniform result of one operation, independent of backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CanonicalResult {
    pub records: Vec<Record>,
    pub affected: u64,
    pub generated_ids: Vec<CanonicalValue>,
}
