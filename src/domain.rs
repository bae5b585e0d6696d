use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataSourceKey(String);

impl DataSourceKey {
    pub(crate) fn catalog(key: &'static str) -> Self {
        Self(key.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DataSourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DataSourceKey {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-');
        if !is_valid {
            return Err(SyncError::InvalidDataSourceKey(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for DataSourceKey {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DataSourceKey> for String {
    fn from(value: DataSourceKey) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Date,
    Int,
    Float,
    Bool,
    Enum,
    Latitude,
    Longitude,
}

/// A typed field value. Values of the same kind are totally ordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum FieldValue {
    String(String),
    Date(DateTime<Utc>),
    Int(i64),
    Float(f64),
    Bool(bool),
    Enum(String),
    Latitude(f64),
    Longitude(f64),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::String(_) => FieldKind::String,
            FieldValue::Date(_) => FieldKind::Date,
            FieldValue::Int(_) => FieldKind::Int,
            FieldValue::Float(_) => FieldKind::Float,
            FieldValue::Bool(_) => FieldKind::Bool,
            FieldValue::Enum(_) => FieldKind::Enum,
            FieldValue::Latitude(_) => FieldKind::Latitude,
            FieldValue::Longitude(_) => FieldKind::Longitude,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::String(value) | FieldValue::Enum(value) => Some(value),
            _ => None,
        }
    }

    pub fn compare(&self, other: &FieldValue) -> Ordering {
        match (self, other) {
            (FieldValue::String(a), FieldValue::String(b))
            | (FieldValue::Enum(a), FieldValue::Enum(b)) => a.cmp(b),
            (FieldValue::Date(a), FieldValue::Date(b)) => a.cmp(b),
            (FieldValue::Int(a), FieldValue::Int(b)) => a.cmp(b),
            (FieldValue::Bool(a), FieldValue::Bool(b)) => a.cmp(b),
            (FieldValue::Float(a), FieldValue::Float(b))
            | (FieldValue::Latitude(a), FieldValue::Latitude(b))
            | (FieldValue::Longitude(a), FieldValue::Longitude(b)) => a.total_cmp(b),
            (FieldValue::Int(a), FieldValue::Float(b)) => (*a as f64).total_cmp(b),
            (FieldValue::Float(a), FieldValue::Int(b)) => a.total_cmp(&(*b as f64)),
            _ => kind_rank(self.kind()).cmp(&kind_rank(other.kind())),
        }
    }

    /// Parses user-supplied text (CLI filters, config) as a value of `kind`.
    pub fn parse(kind: FieldKind, field: &str, raw: &str) -> Result<FieldValue, SyncError> {
        let invalid = || SyncError::InvalidFieldValue {
            field: field.to_string(),
            value: raw.to_string(),
        };
        let trimmed = raw.trim();
        match kind {
            FieldKind::String => Ok(FieldValue::String(trimmed.to_string())),
            FieldKind::Enum => Ok(FieldValue::Enum(trimmed.to_string())),
            FieldKind::Date => parse_date(trimmed).map(FieldValue::Date).ok_or_else(invalid),
            FieldKind::Int => trimmed.parse().map(FieldValue::Int).map_err(|_| invalid()),
            FieldKind::Float => trimmed.parse().map(FieldValue::Float).map_err(|_| invalid()),
            FieldKind::Bool => parse_bool(trimmed).map(FieldValue::Bool).ok_or_else(invalid),
            FieldKind::Latitude => trimmed
                .parse::<f64>()
                .ok()
                .filter(|value| (-90.0..=90.0).contains(value))
                .map(FieldValue::Latitude)
                .ok_or_else(invalid),
            FieldKind::Longitude => trimmed
                .parse::<f64>()
                .ok()
                .filter(|value| (-180.0..=180.0).contains(value))
                .map(FieldValue::Longitude)
                .ok_or_else(invalid),
        }
    }

    /// Converts a JSON payload value. `None` means absent or not convertible.
    pub fn from_json(kind: FieldKind, value: &Value) -> Option<FieldValue> {
        match (kind, value) {
            (_, Value::Null) => None,
            (FieldKind::String, Value::String(text)) => Some(FieldValue::String(text.clone())),
            (FieldKind::String, Value::Number(number)) => {
                Some(FieldValue::String(number.to_string()))
            }
            (FieldKind::Enum, Value::String(text)) => Some(FieldValue::Enum(text.clone())),
            (FieldKind::Date, Value::String(text)) => parse_date(text).map(FieldValue::Date),
            (FieldKind::Date, Value::Number(number)) => number
                .as_i64()
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
                .map(FieldValue::Date),
            (FieldKind::Int, Value::Number(number)) => number.as_i64().map(FieldValue::Int),
            (FieldKind::Int, Value::String(text)) => text.trim().parse().ok().map(FieldValue::Int),
            (FieldKind::Bool, Value::Bool(flag)) => Some(FieldValue::Bool(*flag)),
            (FieldKind::Bool, Value::Number(number)) => {
                number.as_i64().map(|value| FieldValue::Bool(value != 0))
            }
            (FieldKind::Bool, Value::String(text)) => parse_bool(text.trim()).map(FieldValue::Bool),
            (FieldKind::Float | FieldKind::Latitude | FieldKind::Longitude, _) => {
                let number = match value {
                    Value::Number(number) => number.as_f64(),
                    Value::String(text) => text.trim().parse().ok(),
                    _ => None,
                }?;
                Self::parse(kind, "", &number.to_string()).ok()
            }
            _ => None,
        }
    }
}

fn kind_rank(kind: FieldKind) -> u8 {
    match kind {
        FieldKind::Bool => 0,
        FieldKind::Int | FieldKind::Float => 1,
        FieldKind::Latitude => 2,
        FieldKind::Longitude => 3,
        FieldKind::Date => 4,
        FieldKind::Enum => 5,
        FieldKind::String => 6,
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" => Some(true),
        "false" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

/// Accepts RFC 3339, plain dates, naive timestamps and the `071914Z JUN 2023`
/// date-time-group form used by broadcast warnings.
pub fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
            return Some(parsed.and_utc());
        }
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(text, "%d%H%MZ %b %Y") {
        return Some(parsed.and_utc());
    }
    for format in ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return date.and_hms_opt(0, 0, 0).map(|parsed| parsed.and_utc());
        }
    }
    None
}

/// Immutable snapshot of one domain entity.
///
/// Equality covers source, identity key and field values; `store_id` is the
/// store-native identity and does not take part in comparisons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub source: DataSourceKey,
    pub key: String,
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_id: Option<u64>,
}

impl Record {
    pub fn new(source: DataSourceKey, key: impl Into<String>) -> Self {
        Self {
            source,
            key: key.into(),
            fields: BTreeMap::new(),
            store_id: None,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.key == other.key && self.fields == other.fields
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::Datelike;
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_data_source_key_normalizes() {
        let key: DataSourceKey = " ASAM ".parse().unwrap();
        assert_eq!(key.as_str(), "asam");
    }

    #[test]
    fn parse_data_source_key_invalid() {
        let err = "nav warning".parse::<DataSourceKey>().unwrap_err();
        assert_matches!(err, SyncError::InvalidDataSourceKey(_));
    }

    #[test]
    fn record_equality_ignores_store_id() {
        let source: DataSourceKey = "asam".parse().unwrap();
        let mut a = Record::new(source.clone(), "2023-1")
            .with_field("hostility", FieldValue::String("Pirates".into()));
        let b = a.clone();
        a.store_id = Some(42);
        assert_eq!(a, b);

        let c = b.clone().with_field("hostility", FieldValue::String("Robbers".into()));
        assert_ne!(b, c);
    }

    #[test]
    fn parse_dates_in_feed_formats() {
        let plain = parse_date("2023-06-07").unwrap();
        assert_eq!((plain.year(), plain.month(), plain.day()), (2023, 6, 7));

        let dtg = parse_date("071914Z JUN 2023").unwrap();
        assert_eq!((dtg.year(), dtg.month(), dtg.day()), (2023, 6, 7));

        assert!(parse_date("not a date").is_none());
    }

    #[test]
    fn json_conversion_is_kind_aware() {
        assert_eq!(
            FieldValue::from_json(FieldKind::Int, &json!("12")),
            Some(FieldValue::Int(12))
        );
        assert_eq!(
            FieldValue::from_json(FieldKind::Latitude, &json!(12.5)),
            Some(FieldValue::Latitude(12.5))
        );
        assert_eq!(FieldValue::from_json(FieldKind::Latitude, &json!(120.0)), None);
        assert_eq!(
            FieldValue::from_json(FieldKind::Bool, &json!("Y")),
            Some(FieldValue::Bool(true))
        );
        assert_eq!(FieldValue::from_json(FieldKind::String, &Value::Null), None);
    }

    #[test]
    fn mixed_numeric_values_compare_numerically() {
        assert_eq!(
            FieldValue::Int(2).compare(&FieldValue::Float(1.5)),
            Ordering::Greater
        );
        assert_eq!(
            FieldValue::Float(f64::NAN).compare(&FieldValue::Float(f64::NAN)),
            Ordering::Equal
        );
    }
}
