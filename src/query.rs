use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{DataSourceKey, FieldKind, FieldValue, Record};
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
}

impl FilterOperator {
    pub fn symbol(self) -> &'static str {
        match self {
            FilterOperator::Equals => "=",
            FilterOperator::NotEquals => "!=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Contains => "~",
        }
    }
}

impl FromStr for FilterOperator {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "=" => Ok(FilterOperator::Equals),
            "!=" => Ok(FilterOperator::NotEquals),
            ">" => Ok(FilterOperator::GreaterThan),
            ">=" => Ok(FilterOperator::GreaterThanOrEqual),
            "<" => Ok(FilterOperator::LessThan),
            "<=" => Ok(FilterOperator::LessThanOrEqual),
            "~" => Ok(FilterOperator::Contains),
            _ => Err(SyncError::InvalidFilter(value.to_string())),
        }
    }
}

/// One `(field, operator, value)` constraint. A filter set is an AND of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterParameter {
    pub field: String,
    pub operator: FilterOperator,
    pub value: FieldValue,
}

impl FilterParameter {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: FieldValue) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Parses `field<op>value`, typing the value with `kind_of(field)`.
    pub fn parse<F>(expression: &str, kind_of: F) -> Result<Self, SyncError>
    where
        F: Fn(&str) -> Option<FieldKind>,
    {
        let pattern = Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*(>=|<=|!=|=|>|<|~)\s*(.*?)\s*$")
            .map_err(|err| SyncError::InvalidFilter(err.to_string()))?;
        let captures = pattern
            .captures(expression)
            .ok_or_else(|| SyncError::InvalidFilter(expression.to_string()))?;
        let field = captures[1].to_string();
        let operator: FilterOperator = captures[2].parse()?;
        let kind = kind_of(&field)
            .ok_or_else(|| SyncError::InvalidFilter(format!("unknown field {field}")))?;
        let value = FieldValue::parse(kind, &field, &captures[3])?;
        Ok(Self {
            field,
            operator,
            value,
        })
    }

    pub fn matches(&self, record: &Record) -> bool {
        let Some(actual) = record.field(&self.field) else {
            return self.operator == FilterOperator::NotEquals;
        };
        match self.operator {
            FilterOperator::Equals => actual.compare(&self.value) == Ordering::Equal,
            FilterOperator::NotEquals => actual.compare(&self.value) != Ordering::Equal,
            FilterOperator::GreaterThan => actual.compare(&self.value) == Ordering::Greater,
            FilterOperator::GreaterThanOrEqual => actual.compare(&self.value) != Ordering::Less,
            FilterOperator::LessThan => actual.compare(&self.value) == Ordering::Less,
            FilterOperator::LessThanOrEqual => actual.compare(&self.value) != Ordering::Greater,
            FilterOperator::Contains => match (actual.as_text(), self.value.as_text()) {
                (Some(haystack), Some(needle)) => haystack
                    .to_lowercase()
                    .contains(&needle.to_lowercase()),
                _ => false,
            },
        }
    }
}

impl fmt::Display for FilterParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.field,
            self.operator.symbol(),
            section_label(Some(&self.value))
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortParameter {
    pub field: String,
    pub ascending: bool,
    #[serde(default)]
    pub section: bool,
}

impl SortParameter {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: true,
            section: false,
        }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: false,
            section: false,
        }
    }

    pub fn sectioned(mut self) -> Self {
        self.section = true;
        self
    }
}

impl FromStr for SortParameter {
    type Err = SyncError;

    /// `field`, `field:asc` or `field:desc`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (field, direction) = value.trim().split_once(':').unwrap_or((value.trim(), "asc"));
        if field.is_empty() {
            return Err(SyncError::InvalidSort(value.to_string()));
        }
        match direction {
            "asc" => Ok(Self::ascending(field)),
            "desc" => Ok(Self::descending(field)),
            _ => Err(SyncError::InvalidSort(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub source: DataSourceKey,
    #[serde(default)]
    pub filter: Vec<FilterParameter>,
    #[serde(default)]
    pub sort: Vec<SortParameter>,
}

impl Query {
    pub fn new(source: DataSourceKey) -> Self {
        Self {
            source,
            filter: Vec::new(),
            sort: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: FilterParameter) -> Self {
        self.filter.push(filter);
        self
    }

    pub fn with_sort(mut self, sort: SortParameter) -> Self {
        self.sort.push(sort);
        self
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if let Some(position) = self.sort.iter().skip(1).position(|entry| entry.section) {
            let entry = &self.sort[position + 1];
            return Err(SyncError::InvalidSort(format!(
                "only the first sort entry may be a section key, found {}",
                entry.field
            )));
        }
        Ok(())
    }

    pub fn section_field(&self) -> Option<&str> {
        self.sort
            .first()
            .filter(|entry| entry.section)
            .map(|entry| entry.field.as_str())
    }

    pub fn matches(&self, record: &Record) -> bool {
        record.source == self.source && filter_matches(&self.filter, record)
    }

    /// Orders by the sort entries, then by identity key so offsets are stable.
    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        for entry in &self.sort {
            let ordering = match (a.field(&entry.field), b.field(&entry.field)) {
                (Some(left), Some(right)) => left.compare(right),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            let ordering = if entry.ascending {
                ordering
            } else {
                ordering.reverse()
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        a.key.cmp(&b.key)
    }
}

pub fn filter_matches(filter: &[FilterParameter], record: &Record) -> bool {
    filter.iter().all(|parameter| parameter.matches(record))
}

/// Output envelope shared by the live observer and the paging engine.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadState<T> {
    Loading,
    Loaded(T),
    Failure(SyncError),
}

impl<T> LoadState<T> {
    pub fn loaded(&self) -> Option<&T> {
        match self {
            LoadState::Loaded(value) => Some(value),
            _ => None,
        }
    }
}

pub const MISSING_SECTION_LABEL: &str = "Unknown";

/// Display label of a section-key value.
pub fn section_label(value: Option<&FieldValue>) -> String {
    match value {
        None => MISSING_SECTION_LABEL.to_string(),
        Some(FieldValue::String(text)) | Some(FieldValue::Enum(text)) => text.clone(),
        Some(FieldValue::Date(date)) => date.format("%b %-d, %Y").to_string(),
        Some(FieldValue::Int(number)) => number.to_string(),
        Some(FieldValue::Float(number)) => format_number(*number),
        Some(FieldValue::Bool(true)) => "True".to_string(),
        Some(FieldValue::Bool(false)) => "False".to_string(),
        Some(FieldValue::Latitude(degrees)) => format_dms(*degrees, ('N', 'S')),
        Some(FieldValue::Longitude(degrees)) => format_dms(*degrees, ('E', 'W')),
    }
}

/// Formats without trailing fractional zeros: `1.50` is `1.5`, `2.0` is `2`.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.is_finite() {
        return format!("{value:.0}");
    }
    let text = format!("{value:.6}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

fn format_dms(value: f64, hemispheres: (char, char)) -> String {
    let hemisphere = if value < 0.0 {
        hemispheres.1
    } else {
        hemispheres.0
    };
    let total_seconds = (value.abs() * 3600.0).round() as u64;
    let degrees = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{degrees}° {minutes:02}' {seconds:02}\" {hemisphere}")
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::{TimeZone, Utc};

    use super::*;

    fn source() -> DataSourceKey {
        "asam".parse().unwrap()
    }

    fn kind_of(field: &str) -> Option<FieldKind> {
        match field {
            "reference" | "hostility" => Some(FieldKind::String),
            "date" => Some(FieldKind::Date),
            "latitude" => Some(FieldKind::Latitude),
            _ => None,
        }
    }

    #[test]
    fn parse_filter_expression() {
        let filter = FilterParameter::parse("date>=2023-01-01", kind_of).unwrap();
        assert_eq!(filter.field, "date");
        assert_eq!(filter.operator, FilterOperator::GreaterThanOrEqual);
        assert_matches!(filter.value, FieldValue::Date(_));

        let err = FilterParameter::parse("depth=3", kind_of).unwrap_err();
        assert_matches!(err, SyncError::InvalidFilter(_));

        let err = FilterParameter::parse("date=yesterday", kind_of).unwrap_err();
        assert_matches!(err, SyncError::InvalidFieldValue { .. });
    }

    #[test]
    fn missing_field_only_matches_not_equals() {
        let record = Record::new(source(), "1");
        let value = FieldValue::String("x".into());
        let eq = FilterParameter::new("hostility", FilterOperator::Equals, value.clone());
        let ne = FilterParameter::new("hostility", FilterOperator::NotEquals, value);
        assert!(!eq.matches(&record));
        assert!(ne.matches(&record));
    }

    #[test]
    fn contains_is_case_insensitive() {
        let record = Record::new(source(), "1")
            .with_field("hostility", FieldValue::String("Armed Pirates".into()));
        let filter = FilterParameter::parse("hostility~pirate", kind_of).unwrap();
        assert!(filter.matches(&record));
    }

    #[test]
    fn section_key_must_be_first() {
        let query = Query::new(source())
            .with_sort(SortParameter::descending("date"))
            .with_sort(SortParameter::ascending("reference").sectioned());
        assert_matches!(query.validate(), Err(SyncError::InvalidSort(_)));
    }

    #[test]
    fn compare_breaks_ties_by_key() {
        let query = Query::new(source()).with_sort(SortParameter::descending("hostility"));
        let a = Record::new(source(), "a").with_field("hostility", FieldValue::String("x".into()));
        let b = Record::new(source(), "b").with_field("hostility", FieldValue::String("x".into()));
        assert_eq!(query.compare(&a, &b), Ordering::Less);
    }

    #[test]
    fn section_labels_follow_the_formatting_table() {
        let date = Utc.with_ymd_and_hms(2023, 6, 7, 19, 14, 0).unwrap();
        assert_eq!(section_label(Some(&FieldValue::Date(date))), "Jun 7, 2023");
        assert_eq!(section_label(Some(&FieldValue::Float(1.50))), "1.5");
        assert_eq!(section_label(Some(&FieldValue::Float(2.0))), "2");
        assert_eq!(section_label(Some(&FieldValue::Bool(true))), "True");
        assert_eq!(section_label(Some(&FieldValue::Enum("Active".into()))), "Active");
        assert_eq!(
            section_label(Some(&FieldValue::Latitude(-12.5))),
            "12° 30' 00\" S"
        );
        assert_eq!(
            section_label(Some(&FieldValue::Longitude(45.2525))),
            "45° 15' 09\" E"
        );
        assert_eq!(section_label(None), MISSING_SECTION_LABEL);
    }

    #[test]
    fn parse_sort_parameter() {
        let sort: SortParameter = "date:desc".parse().unwrap();
        assert!(!sort.ascending);
        assert_matches!(
            "date:sideways".parse::<SortParameter>(),
            Err(SyncError::InvalidSort(_))
        );
    }
}
