use std::collections::BTreeMap;
use std::fs;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use futures::stream::{BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, warn};

use crate::domain::{DataSourceKey, Record};
use crate::error::SyncError;
use crate::query::{FilterParameter, Query, filter_matches};

const MUTATION_CHANNEL_CAPACITY: usize = 64;

/// Notification sent after a committed write touching `source`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMutation {
    pub source: DataSourceKey,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl StoreMutation {
    /// Stand-in for notifications a slow subscriber missed.
    fn lagged(source: DataSourceKey) -> Self {
        Self {
            source,
            inserted: 0,
            updated: 0,
            deleted: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkInsertOutcome {
    pub inserted: usize,
    pub updated: usize,
}

pub type MutationStream = BoxStream<'static, StoreMutation>;

/// Query and write contract of the local record store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Records matching `query`, sorted by it, sliced by `limit` and `offset`.
    async fn fetch(
        &self,
        query: &Query,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Record>, SyncError>;

    async fn count(
        &self,
        source: &DataSourceKey,
        filter: &[FilterParameter],
    ) -> Result<usize, SyncError>;

    /// Inserts or replaces by identity key in one transaction. All or nothing.
    async fn bulk_insert(&self, records: Vec<Record>) -> Result<BulkInsertOutcome, SyncError>;

    async fn delete(&self, source: &DataSourceKey, keys: &[String]) -> Result<usize, SyncError>;

    /// Mutation notifications for `source`, starting after the call.
    fn subscribe(&self, source: &DataSourceKey) -> MutationStream;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Rows {
    next_id: u64,
    sources: BTreeMap<DataSourceKey, BTreeMap<String, Record>>,
}

/// In-process store. Writers are serialized by the write half of an async
/// `RwLock`; readers share the read half. With a snapshot path every commit
/// is written atomically before it becomes visible.
pub struct MemoryStore {
    rows: RwLock<Rows>,
    mutations: broadcast::Sender<StoreMutation>,
    snapshot: Option<Utf8PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_rows(Rows::default(), None)
    }

    /// Opens a snapshot-backed store, loading the snapshot when present.
    pub fn open(path: &Utf8Path) -> Result<Self, SyncError> {
        let rows = if path.as_std_path().exists() {
            read_json::<Rows>(path)?
        } else {
            Rows::default()
        };
        debug!(path = %path, sources = rows.sources.len(), "opened record store");
        Ok(Self::with_rows(rows, Some(path.to_path_buf())))
    }

    fn with_rows(rows: Rows, snapshot: Option<Utf8PathBuf>) -> Self {
        let (mutations, _) = broadcast::channel(MUTATION_CHANNEL_CAPACITY);
        Self {
            rows: RwLock::new(rows),
            mutations,
            snapshot,
        }
    }

    /// Writes the snapshot on the blocking pool. Callers hold the write lock
    /// so snapshots land in commit order.
    async fn commit(&self, rows: &Rows) -> Result<(), SyncError> {
        let Some(path) = self.snapshot.clone() else {
            return Ok(());
        };
        let content =
            serde_json::to_vec_pretty(rows).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        tokio::task::spawn_blocking(move || write_atomic(&path, &content))
            .await
            .map_err(|err| SyncError::Filesystem(err.to_string()))?
    }

    fn notify(&self, mutation: StoreMutation) {
        // No receivers is not an error.
        let _ = self.mutations.send(mutation);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn fetch(
        &self,
        query: &Query,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Record>, SyncError> {
        query
            .validate()
            .map_err(|err| SyncError::Store(err.to_string()))?;
        let rows = self.rows.read().await;
        let Some(records) = rows.sources.get(&query.source) else {
            return Ok(Vec::new());
        };
        let mut matching = records
            .values()
            .filter(|record| filter_matches(&query.filter, record))
            .collect::<Vec<_>>();
        matching.sort_by(|a, b| query.compare(a, b));
        Ok(matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(
        &self,
        source: &DataSourceKey,
        filter: &[FilterParameter],
    ) -> Result<usize, SyncError> {
        let rows = self.rows.read().await;
        Ok(rows
            .sources
            .get(source)
            .map(|records| {
                records
                    .values()
                    .filter(|record| filter_matches(filter, record))
                    .count()
            })
            .unwrap_or(0))
    }

    async fn bulk_insert(&self, records: Vec<Record>) -> Result<BulkInsertOutcome, SyncError> {
        if let Some(record) = records.iter().find(|record| record.key.trim().is_empty()) {
            return Err(SyncError::BatchInsert(format!(
                "{}: record with empty identity key",
                record.source
            )));
        }

        let mut rows = self.rows.write().await;
        let mut next = rows.clone();
        let mut per_source = BTreeMap::<DataSourceKey, BulkInsertOutcome>::new();
        for mut record in records {
            let outcome = per_source.entry(record.source.clone()).or_default();
            let table = next.sources.entry(record.source.clone()).or_default();
            match table.get(&record.key) {
                Some(existing) if existing == &record => {}
                Some(existing) => {
                    record.store_id = existing.store_id;
                    table.insert(record.key.clone(), record);
                    outcome.updated += 1;
                }
                None => {
                    next.next_id += 1;
                    record.store_id = Some(next.next_id);
                    table.insert(record.key.clone(), record);
                    outcome.inserted += 1;
                }
            }
        }

        self.commit(&next)
            .await
            .map_err(|err| SyncError::BatchInsert(err.to_string()))?;
        *rows = next;
        drop(rows);

        let mut total = BulkInsertOutcome::default();
        for (source, outcome) in per_source {
            total.inserted += outcome.inserted;
            total.updated += outcome.updated;
            if outcome.inserted + outcome.updated > 0 {
                self.notify(StoreMutation {
                    source,
                    inserted: outcome.inserted,
                    updated: outcome.updated,
                    deleted: 0,
                });
            }
        }
        Ok(total)
    }

    async fn delete(&self, source: &DataSourceKey, keys: &[String]) -> Result<usize, SyncError> {
        let mut rows = self.rows.write().await;
        let mut next = rows.clone();
        let deleted = match next.sources.get_mut(source) {
            Some(table) => keys
                .iter()
                .filter(|key| table.remove(key.as_str()).is_some())
                .count(),
            None => 0,
        };
        if deleted == 0 {
            return Ok(0);
        }
        self.commit(&next).await?;
        *rows = next;
        drop(rows);

        self.notify(StoreMutation {
            source: source.clone(),
            inserted: 0,
            updated: 0,
            deleted,
        });
        Ok(deleted)
    }

    fn subscribe(&self, source: &DataSourceKey) -> MutationStream {
        let source = source.clone();
        BroadcastStream::new(self.mutations.subscribe())
            .filter_map(move |message| {
                let mutation = match message {
                    Ok(mutation) if mutation.source == source => Some(mutation),
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        warn!(source = %source, missed, "mutation subscriber lagged");
                        Some(StoreMutation::lagged(source.clone()))
                    }
                };
                futures::future::ready(mutation)
            })
            .boxed()
    }
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, SyncError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| SyncError::Filesystem(format!("read {path}: {err}")))?;
    serde_json::from_str(&content)
        .map_err(|err| SyncError::Filesystem(format!("parse {path}: {err}")))
}

/// Serializes `value` next to `path` and renames it into place.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), SyncError> {
    let content =
        serde_json::to_vec_pretty(value).map_err(|err| SyncError::Filesystem(err.to_string()))?;
    write_atomic(path, &content)
}

fn write_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), SyncError> {
    let parent = path
        .parent()
        .ok_or_else(|| SyncError::Filesystem(format!("invalid destination path {path}")))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".msi-sync")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    std::io::Write::write_all(&mut temp, content)
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::FieldValue;
    use crate::query::{FilterOperator, SortParameter};

    fn asam() -> DataSourceKey {
        "asam".parse().unwrap()
    }

    fn record(key: &str, hostility: &str) -> Record {
        Record::new(asam(), key).with_field("hostility", FieldValue::String(hostility.into()))
    }

    #[tokio::test]
    async fn bulk_insert_dedupes_and_updates() {
        let store = MemoryStore::new();
        let outcome = store
            .bulk_insert(vec![record("A", "x"), record("B", "y")])
            .await
            .unwrap();
        assert_eq!(outcome, BulkInsertOutcome { inserted: 2, updated: 0 });

        let outcome = store
            .bulk_insert(vec![record("B", "y"), record("A", "z")])
            .await
            .unwrap();
        assert_eq!(outcome, BulkInsertOutcome { inserted: 0, updated: 1 });
        assert_eq!(store.count(&asam(), &[]).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn update_keeps_store_identity() {
        let store = MemoryStore::new();
        store.bulk_insert(vec![record("A", "x")]).await.unwrap();
        let query = Query::new(asam());
        let before = store.fetch(&query, 10, 0).await.unwrap();
        store.bulk_insert(vec![record("A", "y")]).await.unwrap();
        let after = store.fetch(&query, 10, 0).await.unwrap();
        assert_eq!(before[0].store_id, after[0].store_id);
        assert_ne!(before[0], after[0]);
    }

    #[tokio::test]
    async fn failed_batch_leaves_store_untouched() {
        let store = MemoryStore::new();
        let err = store
            .bulk_insert(vec![record("A", "x"), record(" ", "y")])
            .await
            .unwrap_err();
        assert_matches!(err, SyncError::BatchInsert(_));
        assert_eq!(store.count(&asam(), &[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fetch_sorts_filters_and_slices() {
        let store = MemoryStore::new();
        store
            .bulk_insert(vec![
                record("A", "pirates"),
                record("B", "robbers"),
                record("C", "pirates"),
                record("D", "thieves"),
            ])
            .await
            .unwrap();
        let query = Query::new(asam())
            .with_filter(FilterParameter::new(
                "hostility",
                FilterOperator::NotEquals,
                FieldValue::String("robbers".into()),
            ))
            .with_sort(SortParameter::descending("hostility"));
        let keys = |records: Vec<Record>| records.into_iter().map(|r| r.key).collect::<Vec<_>>();
        assert_eq!(keys(store.fetch(&query, 10, 0).await.unwrap()), ["D", "A", "C"]);
        assert_eq!(keys(store.fetch(&query, 1, 1).await.unwrap()), ["A"]);
        assert_eq!(store.count(&asam(), &query.filter).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn subscribers_only_see_their_source() {
        let store = MemoryStore::new();
        let mut mutations = store.subscribe(&asam());
        let modu: DataSourceKey = "modu".parse().unwrap();
        store
            .bulk_insert(vec![Record::new(modu.clone(), "rig")])
            .await
            .unwrap();
        store.bulk_insert(vec![record("A", "x")]).await.unwrap();
        let mutation = mutations.next().await.unwrap();
        assert_eq!(mutation.source, asam());
        assert_eq!(mutation.inserted, 1);
    }

    #[tokio::test]
    async fn delete_notifies_and_removes() {
        let store = MemoryStore::new();
        store
            .bulk_insert(vec![record("A", "x"), record("B", "y")])
            .await
            .unwrap();
        let mut mutations = store.subscribe(&asam());
        let deleted = store
            .delete(&asam(), &["A".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(mutations.next().await.unwrap().deleted, 1);
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_open() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("store.json")).unwrap();
        {
            let store = MemoryStore::open(&path).unwrap();
            store
                .bulk_insert(vec![record("A", "x"), record("B", "y")])
                .await
                .unwrap();
        }
        let store = MemoryStore::open(&path).unwrap();
        assert_eq!(store.count(&asam(), &[]).await.unwrap(), 2);
        let outcome = store.bulk_insert(vec![record("C", "z")]).await.unwrap();
        assert_eq!(outcome.inserted, 1);
        let records = store.fetch(&Query::new(asam()), 10, 0).await.unwrap();
        assert_eq!(records[2].store_id, Some(3));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unwritable_snapshot_rejects_the_commit() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        fs::write(root.join("blocker"), b"file").unwrap();
        let store = MemoryStore::open(&root.join("blocker/store.json")).unwrap();

        assert_matches!(
            store.bulk_insert(vec![record("A", "x")]).await,
            Err(SyncError::BatchInsert(_))
        );
        assert_eq!(store.count(&asam(), &[]).await.unwrap(), 0);
    }
}
