//! Integration tests for result normalization across backends.

use db_bridge::db::ResultNormalizer;
use db_bridge::error::DbError;
use db_bridge::models::{
    BackendKind, CanonicalValue, ColumnMetadata, RawResult, RawValue, Record,
};
use serde_json::json;

fn document_result() -> RawResult {
    RawResult::Documents {
        documents: vec![vec![
            ("_id".to_string(), RawValue::Int(1)),
            ("name".to_string(), RawValue::Text("a".to_string())),
            ("active".to_string(), RawValue::Bool(true)),
        ]],
    }
}

#[test]
fn test_document_normalizes_to_typed_record() {
    let result = ResultNormalizer::normalize(BackendKind::MongoDB, document_result()).unwrap();

    assert_eq!(result.records.len(), 1);
    let record = &result.records[0];
    assert_eq!(record.get("_id"), Some(&CanonicalValue::Integer(1)));
    assert_eq!(
        record.get("name"),
        Some(&CanonicalValue::Text("a".to_string()))
    );
    assert_eq!(record.get("active"), Some(&CanonicalValue::Boolean(true)));
    assert_eq!(
        serde_json::to_value(&result).unwrap(),
        json!({
            "records": [{"_id": 1, "name": "a", "active": true}],
            "affected": 0,
            "generated_ids": []
        })
    );
}

#[test]
fn test_normalization_is_deterministic() {
    let first = ResultNormalizer::normalize(BackendKind::MongoDB, document_result()).unwrap();
    let second = ResultNormalizer::normalize(BackendKind::MongoDB, document_result()).unwrap();
    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[test]
fn test_equivalent_rows_and_documents_agree() {
    let rows = RawResult::Rows {
        columns: vec![
            ColumnMetadata::new("_id", "INT8", false),
            ColumnMetadata::new("name", "TEXT", false),
            ColumnMetadata::new("active", "BOOL", false),
        ],
        rows: vec![vec![
            RawValue::Int(1),
            RawValue::Text("a".to_string()),
            RawValue::Bool(true),
        ]],
        rows_affected: None,
        last_insert_id: None,
    };

    let relational = ResultNormalizer::normalize(BackendKind::PostgreSQL, rows).unwrap();
    let document = ResultNormalizer::normalize(BackendKind::MongoDB, document_result()).unwrap();
    assert_eq!(relational, document);
}

#[test]
fn test_nested_document_field_path_in_error() {
    let raw = RawResult::Documents {
        documents: vec![
            vec![("ok".to_string(), RawValue::Int(1))],
            vec![(
                "meta".to_string(),
                RawValue::Document(vec![("size".to_string(), RawValue::UInt(u64::MAX))]),
            )],
        ],
    };

    match ResultNormalizer::normalize(BackendKind::MongoDB, raw).unwrap_err() {
        DbError::ResultShape { record, field, .. } => {
            assert_eq!(record, 1);
            assert_eq!(field, "meta.size");
        }
        other => panic!("expected ResultShape, got {other:?}"),
    }
}

#[test]
fn test_ack_carries_generated_ids() {
    let raw = RawResult::Ack {
        affected: 2,
        generated_ids: vec![
            RawValue::ObjectId("65f0c0ffee0000000000abcd".to_string()),
            RawValue::Int(7),
        ],
    };
    let result = ResultNormalizer::normalize(BackendKind::MongoDB, raw).unwrap();
    assert_eq!(result.affected, 2);
    assert!(result.records.is_empty());
    assert_eq!(
        result.generated_ids,
        vec![
            CanonicalValue::Text("65f0c0ffee0000000000abcd".to_string()),
            CanonicalValue::Integer(7),
        ]
    );
}

#[test]
fn test_record_field_order_follows_source() {
    let raw = RawResult::Documents {
        documents: vec![vec![
            ("z".to_string(), RawValue::Null),
            ("a".to_string(), RawValue::Array(vec![RawValue::Int(1)])),
        ]],
    };
    let result = ResultNormalizer::normalize(BackendKind::MongoDB, raw).unwrap();
    let expected: Record = vec![
        ("z".to_string(), CanonicalValue::Null),
        (
            "a".to_string(),
            CanonicalValue::Sequence(vec![CanonicalValue::Integer(1)]),
        ),
    ]
    .into_iter()
    .collect();
    assert_eq!(result.records, vec![expected]);
}

#[test]
fn test_duplicate_column_names_fail_instead_of_overwriting() {
    let raw = RawResult::Rows {
        columns: vec![
            ColumnMetadata::new("id", "INT8", false),
            ColumnMetadata::new("id", "INT8", false),
        ],
        rows: vec![vec![RawValue::Int(1), RawValue::Int(2)]],
        rows_affected: None,
        last_insert_id: None,
    };

    match ResultNormalizer::normalize(BackendKind::PostgreSQL, raw).unwrap_err() {
        DbError::ResultShape {
            record,
            field,
            message,
            ..
        } => {
            assert_eq!(record, 0);
            assert_eq!(field, "id");
            assert!(message.contains("duplicate"));
        }
        other => panic!("expected ResultShape, got {other:?}"),
    }
}

#[test]
fn test_duplicate_nested_document_keys_fail() {
    let raw = RawResult::Documents {
        documents: vec![vec![(
            "meta".to_string(),
            RawValue::Document(vec![
                ("size".to_string(), RawValue::Int(1)),
                ("size".to_string(), RawValue::Int(2)),
            ]),
        )]],
    };

    match ResultNormalizer::normalize(BackendKind::MongoDB, raw).unwrap_err() {
        DbError::ResultShape { field, .. } => assert_eq!(field, "meta.size"),
        other => panic!("expected ResultShape, got {other:?}"),
    }
}
