use assert_matches::assert_matches;
use serde_json::json;

use msi_sync::domain::{DataSourceKey, FieldKind, FieldValue, Record};
use msi_sync::error::SyncError;
use msi_sync::query::{FilterOperator, FilterParameter, SortParameter};
use msi_sync::source::{decode_records, find};

#[test]
fn data_source_keys_are_normalized() {
    let key: DataSourceKey = " NavWarning ".parse().unwrap();
    assert_eq!(key.as_str(), "navwarning");
    assert_matches!(
        "nav warning".parse::<DataSourceKey>(),
        Err(SyncError::InvalidDataSourceKey(_))
    );
    assert_matches!(
        find(&"tides".parse().unwrap()),
        Err(SyncError::UnknownDataSource(_))
    );
}

#[test]
fn composite_identity_joins_key_fields() {
    let source = find(&"navwarning".parse().unwrap()).unwrap();
    let body = json!({
        "broadcast-warn": [
            {"msgYear": 2023, "msgNumber": 512, "navArea": "4", "issueDate": "071914Z JUN 2023"},
            {"msgYear": 2023, "navArea": "4"}
        ]
    });
    let outcome = decode_records(&source, &body).unwrap();
    assert_eq!(outcome.skipped, 1);
    assert_eq!(outcome.records[0].key, "2023--512--4");
    assert_matches!(
        outcome.records[0].field("issueDate"),
        Some(FieldValue::Date(_))
    );
}

#[test]
fn unusable_envelope_is_a_decode_error() {
    let source = find(&"asam".parse().unwrap()).unwrap();
    assert_matches!(
        decode_records(&source, &json!({"other": []})),
        Err(SyncError::Decode(_))
    );
    assert_matches!(decode_records(&source, &json!(42)), Err(SyncError::Decode(_)));
}

#[test]
fn filters_are_typed_by_field_kind() {
    let source = find(&"modu".parse().unwrap()).unwrap();
    let filter = FilterParameter::parse("region >= 12", |field| source.field_kind(field)).unwrap();
    assert_eq!(filter.operator, FilterOperator::GreaterThanOrEqual);
    assert_eq!(filter.value, FieldValue::Int(12));

    let rig = Record::new(source.key.clone(), "ALPHA").with_field("region", FieldValue::Int(14));
    assert!(filter.matches(&rig));

    assert_matches!(
        FilterParameter::parse("region >= north", |field| source.field_kind(field)),
        Err(SyncError::InvalidFieldValue { .. })
    );
    assert_matches!(
        FilterParameter::parse("depth = 3", |field| source.field_kind(field)),
        Err(SyncError::InvalidFilter(_))
    );
    assert_eq!(source.field_kind("rigStatus"), Some(FieldKind::Enum));
}

#[test]
fn sort_expressions_parse_direction() {
    let sort: SortParameter = "date:desc".parse().unwrap();
    assert_eq!(sort.field, "date");
    assert!(!sort.ascending);
    assert!("date:sideways".parse::<SortParameter>().is_err());
}
