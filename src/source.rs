use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::domain::{DataSourceKey, FieldKind, FieldValue, Record};
use crate::error::SyncError;
use crate::query::{Query, SortParameter};

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

/// Everything needed to fetch, decode and present one remote feed.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSource {
    pub key: DataSourceKey,
    pub title: String,
    pub path: String,
    /// Top-level key holding the record array; `None` for a bare array body.
    pub envelope: Option<String>,
    /// Fields whose values, joined with `--`, form the identity key.
    pub identity: Vec<String>,
    pub fields: Vec<FieldSpec>,
    pub remote_sort: String,
    pub params: Vec<(String, String)>,
    pub default_sort: Vec<SortParameter>,
    pub refresh_interval: Duration,
}

impl DataSource {
    pub fn field_kind(&self, name: &str) -> Option<FieldKind> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .map(|field| field.kind)
    }

    pub fn default_query(&self) -> Query {
        Query {
            source: self.key.clone(),
            filter: Vec::new(),
            sort: self.default_sort.clone(),
        }
    }

    /// Query parameters for the remote call: `sort`, `output=json`, then extras.
    pub fn query_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("sort".to_string(), self.remote_sort.clone()),
            ("output".to_string(), "json".to_string()),
        ];
        params.extend(self.params.iter().cloned());
        params
    }
}

struct SourceBuilder {
    source: DataSource,
}

impl SourceBuilder {
    fn new(key: &'static str, title: &str, path: &str, envelope: Option<&str>) -> Self {
        Self {
            source: DataSource {
                key: DataSourceKey::catalog(key),
                title: title.to_string(),
                path: path.to_string(),
                envelope: envelope.map(str::to_string),
                identity: Vec::new(),
                fields: Vec::new(),
                remote_sort: String::new(),
                params: Vec::new(),
                default_sort: Vec::new(),
                refresh_interval: HOUR,
            },
        }
    }

    fn identity(mut self, fields: &[&str]) -> Self {
        self.source.identity = fields.iter().map(|field| field.to_string()).collect();
        self
    }

    fn field(mut self, name: &str, kind: FieldKind) -> Self {
        self.source.fields.push(FieldSpec {
            name: name.to_string(),
            kind,
        });
        self
    }

    fn param(mut self, name: &str, value: &str) -> Self {
        self.source
            .params
            .push((name.to_string(), value.to_string()));
        self
    }

    fn sort(mut self, remote: &str, default_sort: Vec<SortParameter>) -> Self {
        self.source.remote_sort = remote.to_string();
        self.source.default_sort = default_sort;
        self
    }

    fn refresh(mut self, interval: Duration) -> Self {
        self.source.refresh_interval = interval;
        self
    }

    fn build(self) -> DataSource {
        self.source
    }
}

/// Built-in maritime safety feeds.
pub fn catalog() -> Vec<DataSource> {
    use FieldKind::*;

    vec![
        SourceBuilder::new("asam", "Anti-Shipping Activity Messages", "/publications/asam", Some("asam"))
            .identity(&["reference"])
            .field("reference", String)
            .field("date", Date)
            .field("latitude", Latitude)
            .field("longitude", Longitude)
            .field("position", String)
            .field("navArea", String)
            .field("subreg", String)
            .field("hostility", String)
            .field("victim", String)
            .field("description", String)
            .sort("date", vec![SortParameter::descending("date").sectioned()])
            .build(),
        SourceBuilder::new("modu", "Mobile Offshore Drilling Units", "/publications/modu", Some("modu"))
            .identity(&["name"])
            .field("name", String)
            .field("date", Date)
            .field("rigStatus", Enum)
            .field("specialStatus", String)
            .field("distance", Float)
            .field("latitude", Latitude)
            .field("longitude", Longitude)
            .field("position", String)
            .field("navArea", String)
            .field("region", Int)
            .field("subregion", Int)
            .sort("date", vec![SortParameter::descending("date").sectioned()])
            .build(),
        SourceBuilder::new("navwarning", "Navigational Warnings", "/publications/broadcast-warn", Some("broadcast-warn"))
            .identity(&["msgYear", "msgNumber", "navArea"])
            .field("msgYear", Int)
            .field("msgNumber", Int)
            .field("navArea", String)
            .field("subregion", String)
            .field("status", Enum)
            .field("issueDate", Date)
            .field("authority", String)
            .field("cancelDate", Date)
            .field("text", String)
            .param("status", "active")
            .sort(
                "issueDate",
                vec![
                    SortParameter::ascending("navArea").sectioned(),
                    SortParameter::descending("msgYear"),
                    SortParameter::descending("msgNumber"),
                ],
            )
            .build(),
        SourceBuilder::new("light", "Lights and Buoys", "/publications/ngalol/lights-buoys", Some("ngalol"))
            .identity(&["volumeNumber", "featureNumber", "characteristicNumber"])
            .field("volumeNumber", String)
            .field("featureNumber", String)
            .field("characteristicNumber", Int)
            .field("noticeWeek", String)
            .field("noticeYear", String)
            .field("name", String)
            .field("position", String)
            .field("characteristic", String)
            .field("range", String)
            .field("sectionHeader", String)
            .field("regionHeading", String)
            .param("includeRemovals", "false")
            .sort(
                "featureNumber",
                vec![
                    SortParameter::ascending("sectionHeader").sectioned(),
                    SortParameter::ascending("featureNumber"),
                ],
            )
            .refresh(DAY)
            .build(),
        SourceBuilder::new("port", "World Port Index", "/publications/world-port-index", Some("ports"))
            .identity(&["portNumber"])
            .field("portNumber", Int)
            .field("portName", String)
            .field("regionName", String)
            .field("countryName", String)
            .field("latitude", Latitude)
            .field("longitude", Longitude)
            .field("harborSize", Enum)
            .sort(
                "portName",
                vec![
                    SortParameter::ascending("regionName").sectioned(),
                    SortParameter::ascending("portName"),
                ],
            )
            .refresh(DAY)
            .build(),
        SourceBuilder::new("radiobeacon", "Radio Beacons", "/publications/radio-navaids/radio-beacons", Some("ngalol"))
            .identity(&["volumeNumber", "featureNumber"])
            .field("volumeNumber", String)
            .field("featureNumber", Int)
            .field("name", String)
            .field("position", String)
            .field("frequency", String)
            .field("range", Int)
            .field("geopoliticalHeading", String)
            .sort(
                "featureNumber",
                vec![
                    SortParameter::ascending("geopoliticalHeading").sectioned(),
                    SortParameter::ascending("featureNumber"),
                ],
            )
            .refresh(DAY)
            .build(),
        SourceBuilder::new("dgpsstation", "DGPS Stations", "/publications/radio-navaids/dgps", Some("ngalol"))
            .identity(&["volumeNumber", "featureNumber"])
            .field("volumeNumber", String)
            .field("featureNumber", Float)
            .field("name", String)
            .field("position", String)
            .field("stationId", String)
            .field("frequency", Float)
            .field("transferRate", Int)
            .field("geopoliticalHeading", String)
            .sort(
                "featureNumber",
                vec![
                    SortParameter::ascending("geopoliticalHeading").sectioned(),
                    SortParameter::ascending("featureNumber"),
                ],
            )
            .refresh(DAY)
            .build(),
        SourceBuilder::new("epub", "Electronic Publications", "/publications/stored-pubs", None)
            .identity(&["s3Key"])
            .field("s3Key", String)
            .field("pubTypeId", Int)
            .field("pubDownloadDisplayName", String)
            .field("sectionDisplayName", String)
            .field("fileSize", Int)
            .field("uploadTime", Date)
            .field("fullPubFlag", Bool)
            .sort(
                "pubDownloadDisplayName",
                vec![
                    SortParameter::ascending("sectionDisplayName").sectioned(),
                    SortParameter::ascending("pubDownloadDisplayName"),
                ],
            )
            .refresh(DAY)
            .build(),
    ]
}

pub fn find(key: &DataSourceKey) -> Result<DataSource, SyncError> {
    catalog()
        .into_iter()
        .find(|source| &source.key == key)
        .ok_or_else(|| SyncError::UnknownDataSource(key.to_string()))
}

#[derive(Debug, Clone, Default)]
pub struct DecodeOutcome {
    pub records: Vec<Record>,
    pub skipped: usize,
}

/// Decodes a response body. Malformed entries are skipped; only an unusable
/// envelope is an error.
pub fn decode_records(source: &DataSource, body: &Value) -> Result<DecodeOutcome, SyncError> {
    let entries = match body {
        Value::Array(entries) => entries,
        Value::Object(object) => source
            .envelope
            .as_deref()
            .and_then(|key| object.get(key))
            .or_else(|| object.get("records"))
            .and_then(Value::as_array)
            .ok_or_else(|| {
                SyncError::Decode(format!(
                    "{}: response has no record array under {:?}",
                    source.key,
                    source.envelope.as_deref().unwrap_or("records")
                ))
            })?,
        _ => {
            return Err(SyncError::Decode(format!(
                "{}: response is neither an object nor an array",
                source.key
            )));
        }
    };

    let mut outcome = DecodeOutcome::default();
    for (index, entry) in entries.iter().enumerate() {
        match decode_entry(source, entry) {
            Ok(record) => outcome.records.push(record),
            Err(reason) => {
                warn!(source = %source.key, index, %reason, "skipping malformed record");
                outcome.skipped += 1;
            }
        }
    }
    debug!(
        source = %source.key,
        decoded = outcome.records.len(),
        skipped = outcome.skipped,
        "decoded response"
    );
    Ok(outcome)
}

fn decode_entry(source: &DataSource, entry: &Value) -> Result<Record, String> {
    let object = entry
        .as_object()
        .ok_or_else(|| "entry is not an object".to_string())?;
    let key = identity_key(source, object)?;

    let mut record = Record::new(source.key.clone(), key);
    for spec in &source.fields {
        let Some(raw) = object.get(&spec.name).filter(|value| !value.is_null()) else {
            continue;
        };
        let value = FieldValue::from_json(spec.kind, raw)
            .ok_or_else(|| format!("field {} has invalid value {raw}", spec.name))?;
        record.fields.insert(spec.name.clone(), value);
    }
    Ok(record)
}

fn identity_key(source: &DataSource, object: &Map<String, Value>) -> Result<String, String> {
    let mut parts = Vec::with_capacity(source.identity.len());
    for field in &source.identity {
        let part = match object.get(field) {
            Some(Value::String(text)) if !text.trim().is_empty() => text.trim().to_string(),
            Some(Value::Number(number)) => number.to_string(),
            _ => return Err(format!("missing identity field {field}")),
        };
        parts.push(part);
    }
    Ok(parts.join("--"))
}
