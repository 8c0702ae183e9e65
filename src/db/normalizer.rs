//! Result normalization.
//!
//! Maps driver-native [`RawResult`]s into the backend-independent [`CanonicalResult`].
//! Normalization is all-or-nothing: the first value that cannot be coerced fails the
//! whole result with a `ResultShape` error naming the record and field.

use crate::error::{DbError, DbResult};
use crate::models::{
    BackendKind, CanonicalResult, CanonicalValue, ColumnMetadata, RawResult, RawValue, Record,
};
use chrono::{NaiveTime, TimeZone, Utc};
use serde_json::Value as JsonValue;

/// Stateless converter from driver-native to canonical results.
pub struct ResultNormalizer;

/// Position of the value being converted, for error reporting.
struct Cursor {
    backend: BackendKind,
    record: usize,
}

impl Cursor {
    fn fail(&self, field: &str, message: impl Into<String>) -> DbError {
        DbError::result_shape(self.backend, self.record, field, message)
    }

    /// Add a field, refusing a name the record already holds.
    fn put(
        &self,
        record: &mut Record,
        path: &str,
        name: String,
        value: CanonicalValue,
    ) -> DbResult<()> {
        if record.contains(&name) {
            return Err(self.fail(path, "duplicate field name"));
        }
        record.insert(name, value);
        Ok(())
    }
}

impl ResultNormalizer {
    pub fn normalize(backend: BackendKind, raw: RawResult) -> DbResult<CanonicalResult> {
        let mut out = CanonicalResult::default();
        Self::append(backend, raw, &mut out)?;
        Ok(out)
    }

    fn append(backend: BackendKind, raw: RawResult, out: &mut CanonicalResult) -> DbResult<()> {
        match raw {
            RawResult::Rows {
                columns,
                rows,
                rows_affected,
                last_insert_id,
            } => {
                for row in rows {
                    let cursor = Cursor {
                        backend,
                        record: out.records.len(),
                    };
                    out.records.push(row_to_record(&cursor, &columns, row)?);
                }
                out.affected += rows_affected.unwrap_or(0);
                if let Some(id) = last_insert_id {
                    out.generated_ids.push(CanonicalValue::Integer(id));
                }
            }
            RawResult::Documents { documents } => {
                for document in documents {
                    let cursor = Cursor {
                        backend,
                        record: out.records.len(),
                    };
                    out.records.push(fields_to_record(&cursor, document)?);
                }
            }
            RawResult::Ack {
                affected,
                generated_ids,
            } => {
                out.affected += affected;
                let cursor = Cursor {
                    backend,
                    record: out.records.len(),
                };
                for value in generated_ids {
                    out.generated_ids
                        .push(coerce(&cursor, "generated_id", value)?);
                }
            }
            RawResult::Batch(results) => {
                for result in results {
                    Self::append(backend, result, out)?;
                }
            }
        }
        Ok(())
    }
}

fn row_to_record(
    cursor: &Cursor,
    columns: &[ColumnMetadata],
    row: Vec<RawValue>,
) -> DbResult<Record> {
    if row.len() != columns.len() {
        return Err(cursor.fail(
            "*",
            format!(
                "row has {} values but {} columns were described",
                row.len(),
                columns.len()
            ),
        ));
    }
    let mut record = Record::new();
    for (column, value) in columns.iter().zip(row) {
        let value = coerce(cursor, &column.name, value)?;
        cursor.put(&mut record, &column.name, column.name.clone(), value)?;
    }
    Ok(record)
}

fn fields_to_record(cursor: &Cursor, fields: Vec<(String, RawValue)>) -> DbResult<Record> {
    let mut record = Record::new();
    for (name, value) in fields {
        let value = coerce(cursor, &name, value)?;
        cursor.put(&mut record, &name, name.clone(), value)?;
    }
    Ok(record)
}

fn coerce(cursor: &Cursor, field: &str, value: RawValue) -> DbResult<CanonicalValue> {
    Ok(match value {
        RawValue::Null => CanonicalValue::Null,
        RawValue::Bool(b) => CanonicalValue::Boolean(b),
        RawValue::Int(i) => CanonicalValue::Integer(i),
        RawValue::UInt(u) => match i64::try_from(u) {
            Ok(i) => CanonicalValue::Integer(i),
            Err(_) => return Err(cursor.fail(field, format!("unsigned value {u} exceeds i64"))),
        },
        RawValue::Float(f) => {
            if !f.is_finite() {
                return Err(cursor.fail(field, format!("non-finite float {f}")));
            }
            CanonicalValue::Float(f)
        }
        RawValue::Decimal(s) | RawValue::Text(s) | RawValue::Uuid(s) | RawValue::ObjectId(s) => {
            CanonicalValue::Text(s)
        }
        RawValue::Bytes(bytes) => CanonicalValue::Binary(bytes),
        RawValue::Timestamp(ts) => CanonicalValue::Timestamp(ts),
        RawValue::NaiveTimestamp(naive) => CanonicalValue::Timestamp(Utc.from_utc_datetime(&naive)),
        RawValue::Date(date) => {
            CanonicalValue::Timestamp(Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)))
        }
        RawValue::Time(time) => CanonicalValue::Text(time.format("%H:%M:%S%.f").to_string()),
        RawValue::Json(json) => json_to_canonical(cursor, field, json)?,
        RawValue::Array(items) => CanonicalValue::Sequence(
            items
                .into_iter()
                .map(|item| coerce(cursor, field, item))
                .collect::<DbResult<_>>()?,
        ),
        RawValue::Document(fields) => {
            let mut record = Record::new();
            for (name, value) in fields {
                let path = format!("{field}.{name}");
                let value = coerce(cursor, &path, value)?;
                cursor.put(&mut record, &path, name, value)?;
            }
            CanonicalValue::Record(record)
        }
        RawValue::Unsupported { type_name } => {
            return Err(cursor.fail(field, format!("unsupported type '{type_name}'")));
        }
    })
}

fn json_to_canonical(cursor: &Cursor, field: &str, json: JsonValue) -> DbResult<CanonicalValue> {
    Ok(match json {
        JsonValue::Null => CanonicalValue::Null,
        JsonValue::Bool(b) => CanonicalValue::Boolean(b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                CanonicalValue::Integer(i)
            } else if n.is_u64() {
                return Err(cursor.fail(field, format!("unsigned value {n} exceeds i64")));
            } else {
                match n.as_f64() {
                    Some(f) if f.is_finite() => CanonicalValue::Float(f),
                    _ => return Err(cursor.fail(field, format!("unrepresentable number {n}"))),
                }
            }
        }
        JsonValue::String(s) => CanonicalValue::Text(s),
        JsonValue::Array(items) => CanonicalValue::Sequence(
            items
                .into_iter()
                .map(|item| json_to_canonical(cursor, field, item))
                .collect::<DbResult<_>>()?,
        ),
        JsonValue::Object(map) => {
            let mut record = Record::new();
            for (name, value) in map {
                let path = format!("{field}.{name}");
                record.insert(name, json_to_canonical(cursor, &path, value)?);
            }
            CanonicalValue::Record(record)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};
    use serde_json::json;

    fn rows(columns: &[&str], rows: Vec<Vec<RawValue>>) -> RawResult {
        RawResult::Rows {
            columns: columns
                .iter()
                .map(|name| ColumnMetadata::new(*name, "TEXT", true))
                .collect(),
            rows,
            rows_affected: None,
            last_insert_id: None,
        }
    }

    #[test]
    fn test_rows_map_column_by_column() {
        let raw = rows(
            &["id", "name"],
            vec![
                vec![RawValue::Int(1), RawValue::Text("a".into())],
                vec![RawValue::Int(2), RawValue::Null],
            ],
        );
        let result = ResultNormalizer::normalize(BackendKind::SQLite, raw).unwrap();
        assert_eq!(result.records.len(), 2);
        assert_eq!(
            result.records[1].get("id"),
            Some(&CanonicalValue::Integer(2))
        );
        assert_eq!(result.records[1].get("name"), Some(&CanonicalValue::Null));
    }

    #[test]
    fn test_unsigned_overflow_fails_with_position() {
        let raw = rows(
            &["n"],
            vec![vec![RawValue::UInt(1)], vec![RawValue::UInt(u64::MAX)]],
        );
        let err = ResultNormalizer::normalize(BackendKind::MySQL, raw).unwrap_err();
        match err {
            DbError::ResultShape {
                backend,
                record,
                field,
                ..
            } => {
                assert_eq!(backend, BackendKind::MySQL);
                assert_eq!(record, 1);
                assert_eq!(field, "n");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_non_finite_float_rejected() {
        let raw = rows(&["f"], vec![vec![RawValue::Float(f64::NAN)]]);
        assert!(ResultNormalizer::normalize(BackendKind::PostgreSQL, raw).is_err());
    }

    #[test]
    fn test_unsupported_value_rejected() {
        let raw = rows(
            &["geo"],
            vec![vec![RawValue::Unsupported {
                type_name: "POINT".into(),
            }]],
        );
        let err = ResultNormalizer::normalize(BackendKind::PostgreSQL, raw).unwrap_err();
        assert!(err.to_string().contains("POINT"));
    }

    #[test]
    fn test_temporal_coercions() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let naive: NaiveDateTime = date.and_hms_opt(12, 30, 0).unwrap();
        let time = NaiveTime::from_hms_milli_opt(8, 5, 9, 250).unwrap();
        let raw = rows(
            &["d", "ts", "t"],
            vec![vec![
                RawValue::Date(date),
                RawValue::NaiveTimestamp(naive),
                RawValue::Time(time),
            ]],
        );
        let result = ResultNormalizer::normalize(BackendKind::PostgreSQL, raw).unwrap();
        assert_eq!(
            serde_json::to_string(&result.records[0]).unwrap(),
            r#"{"d":"2024-03-01T00:00:00Z","ts":"2024-03-01T12:30:00Z","t":"08:05:09.250"}"#
        );
    }

    #[test]
    fn test_json_becomes_nested_record() {
        let raw = rows(
            &["doc"],
            vec![vec![RawValue::Json(json!({"tags": ["a", 1], "ok": true}))]],
        );
        let result = ResultNormalizer::normalize(BackendKind::PostgreSQL, raw).unwrap();
        let Some(CanonicalValue::Record(doc)) = result.records[0].get("doc") else {
            panic!("expected nested record");
        };
        assert_eq!(
            doc.get("tags"),
            Some(&CanonicalValue::Sequence(vec![
                CanonicalValue::Text("a".into()),
                CanonicalValue::Integer(1)
            ]))
        );
    }

    #[test]
    fn test_documents_keep_native_field_set() {
        let raw = RawResult::Documents {
            documents: vec![
                vec![
                    ("_id".into(), RawValue::ObjectId("65f0c0ffee".into())),
                    ("name".into(), RawValue::Text("x".into())),
                    ("active".into(), RawValue::Bool(true)),
                ],
                vec![("_id".into(), RawValue::ObjectId("65f0c0ffef".into()))],
            ],
        };
        let result = ResultNormalizer::normalize(BackendKind::MongoDB, raw).unwrap();
        assert_eq!(result.records[0].len(), 3);
        assert_eq!(
            result.records[0].get("_id"),
            Some(&CanonicalValue::Text("65f0c0ffee".into()))
        );
        assert_eq!(
            result.records[0].get("active"),
            Some(&CanonicalValue::Boolean(true))
        );
        assert_eq!(result.records[1].len(), 1);
    }

    #[test]
    fn test_batch_concatenates() {
        let raw = RawResult::Batch(vec![
            RawResult::Rows {
                columns: vec![],
                rows: vec![],
                rows_affected: Some(1),
                last_insert_id: Some(7),
            },
            RawResult::Ack {
                affected: 2,
                generated_ids: vec![RawValue::ObjectId("abc".into())],
            },
            rows(&["n"], vec![vec![RawValue::Int(3)]]),
        ]);
        let result = ResultNormalizer::normalize(BackendKind::SQLite, raw).unwrap();
        assert_eq!(result.affected, 3);
        assert_eq!(
            result.generated_ids,
            vec![
                CanonicalValue::Integer(7),
                CanonicalValue::Text("abc".into())
            ]
        );
        assert_eq!(result.records.len(), 1);
    }

    #[test]
    fn test_mismatched_row_width_rejected() {
        let raw = rows(&["a", "b"], vec![vec![RawValue::Int(1)]]);
        assert!(ResultNormalizer::normalize(BackendKind::SQLite, raw).is_err());
    }
}
