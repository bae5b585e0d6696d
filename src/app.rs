use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::info;

use crate::config::ResolvedConfig;
use crate::domain::DataSourceKey;
use crate::error::SyncError;
use crate::fetch::{FetchRegistry, FetchTask};
use crate::import::BatchImporter;
use crate::ledger::SyncLedger;
use crate::observer::{LiveQuery, Observation};
use crate::paging::{ListItem, PageEngine, PageStream};
use crate::query::{LoadState, Query};
use crate::remote::{HttpRemoteSource, RemoteSource};
use crate::store::{MemoryStore, RecordStore};
use crate::transfer::{HttpTransport, TransferDescriptor, Transfers, Transport, TrustPolicy};

#[derive(Debug, Clone, Serialize)]
pub struct RefreshResult {
    pub source: String,
    pub action: String,
    pub inserted: usize,
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub items: Vec<RefreshResult>,
}

impl SyncResult {
    pub fn failures(&self) -> impl Iterator<Item = &RefreshResult> {
        self.items.iter().filter(|item| item.error.is_some())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub source: String,
    pub pages: usize,
    pub items: Vec<ListItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResult {
    pub sources: Vec<SourceStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub source: String,
    pub title: String,
    pub records: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub due: bool,
    pub in_flight: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadResult {
    pub id: String,
    pub action: String,
    pub destination: String,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

/// Wires the store, remote feed, fetch registry, sync ledger and transfers
/// together behind the operations the CLI and UI use.
pub struct App {
    config: ResolvedConfig,
    store: Arc<dyn RecordStore>,
    remote: Arc<dyn RemoteSource>,
    ledger: Arc<SyncLedger>,
    registry: FetchRegistry,
    transfers: Transfers,
}

impl App {
    pub fn new(
        config: ResolvedConfig,
        store: Arc<dyn RecordStore>,
        remote: Arc<dyn RemoteSource>,
        ledger: Arc<SyncLedger>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let transfers = Transfers::new(transport, config.staging_dir());
        Self {
            config,
            store,
            remote,
            ledger,
            registry: FetchRegistry::new(),
            transfers,
        }
    }

    /// Snapshot-backed store, HTTP remote and HTTP transport under the
    /// configured data directory.
    pub fn open(config: ResolvedConfig) -> Result<Self, SyncError> {
        let store = Arc::new(MemoryStore::open(&config.store_path())?);
        let ledger = Arc::new(SyncLedger::open(&config.ledger_path())?);
        let remote = Arc::new(HttpRemoteSource::new(config.base_url.clone())?);
        let transport = Arc::new(HttpTransport::new(TrustPolicy::new())?);
        Ok(Self::new(config, store, remote, ledger, transport))
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Refreshes one source unless its last sync is younger than its refresh
    /// interval. A refresh already running for the source is joined.
    pub async fn refresh(
        &self,
        key: &DataSourceKey,
        force: bool,
        sink: &dyn ProgressSink,
    ) -> Result<RefreshResult, SyncError> {
        let source = self.config.source(key)?.clone();
        if !force && !self.ledger.is_due(key, source.refresh_interval, Utc::now()) {
            sink.event(ProgressEvent {
                message: format!("phase=Resolve; {key} is up to date"),
                elapsed: None,
            });
            return Ok(RefreshResult {
                source: key.to_string(),
                action: "skipped".to_string(),
                inserted: 0,
                last_sync: self.ledger.last_sync(key),
                error: None,
            });
        }

        sink.event(ProgressEvent {
            message: format!("phase=Fetch; requesting {key}"),
            elapsed: None,
        });
        let start = Instant::now();
        let task = FetchTask::new(
            source,
            self.remote.clone(),
            BatchImporter::new(self.store.clone()),
        );
        let submission = self.registry.submit(task);
        let joined = submission.joined;
        let task = submission.task().clone();
        let inserted = submission.wait().await?;

        let action = if task.is_cancelled() {
            "cancelled"
        } else {
            self.ledger.record_success(key, Utc::now())?;
            if joined { "joined" } else { "refreshed" }
        };
        sink.event(ProgressEvent {
            message: format!("phase=Store; {key} {action} inserted={inserted}"),
            elapsed: Some(start.elapsed()),
        });
        info!(source = %key, action, inserted, "refresh finished");
        Ok(RefreshResult {
            source: key.to_string(),
            action: action.to_string(),
            inserted,
            last_sync: self.ledger.last_sync(key),
            error: None,
        })
    }

    /// Refreshes every configured source concurrently. Per-source failures
    /// are reported in the result rather than aborting the others.
    pub async fn refresh_all(&self, force: bool, sink: &dyn ProgressSink) -> SyncResult {
        let refreshes = self.config.sources.iter().map(|source| async move {
            match self.refresh(&source.key, force, sink).await {
                Ok(result) => result,
                Err(err) => RefreshResult {
                    source: source.key.to_string(),
                    action: "failed".to_string(),
                    inserted: 0,
                    last_sync: self.ledger.last_sync(&source.key),
                    error: Some(err.to_string()),
                },
            }
        });
        SyncResult {
            items: join_all(refreshes).await,
        }
    }

    pub fn cancel_refresh(&self, key: &DataSourceKey) -> bool {
        self.registry.cancel(key)
    }

    pub fn observe(&self, query: Query) -> Observation {
        LiveQuery::observe(self.store.clone(), query)
    }

    pub fn pages<R, L>(&self, query: watch::Receiver<Query>, reload: R, load_more: L) -> PageStream
    where
        R: Stream<Item = ()> + Send + 'static,
        L: Stream<Item = ()> + Send + 'static,
    {
        self.page_engine().pages(query, reload, load_more)
    }

    fn page_engine(&self) -> PageEngine {
        PageEngine::new(self.store.clone()).with_page_size(self.config.page_size)
    }

    /// Loads up to `pages` pages of `query` through the paging engine.
    pub async fn list(&self, query: Query, pages: usize) -> Result<ListResult, SyncError> {
        let source = query.source.to_string();
        let engine = self.page_engine();
        let page_size = engine.page_size();
        let (_query_tx, query_rx) = watch::channel(query);
        let (more_tx, more_rx) = mpsc::unbounded_channel();
        let mut stream = engine.pages(
            query_rx,
            futures::stream::pending(),
            UnboundedReceiverStream::new(more_rx),
        );

        let mut loaded = 0;
        let mut items = Vec::new();
        while let Some(state) = stream.next().await {
            match state {
                LoadState::Loading => continue,
                LoadState::Failure(err) => return Err(err),
                LoadState::Loaded(current) => {
                    loaded += 1;
                    items = current;
                    let records = items.iter().filter(|item| item.record().is_some()).count();
                    if loaded >= pages.max(1) || records < loaded * page_size {
                        break;
                    }
                    if more_tx.send(()).is_err() {
                        break;
                    }
                }
            }
        }
        Ok(ListResult {
            source,
            pages: loaded,
            items,
        })
    }

    pub async fn status(&self) -> Result<StatusResult, SyncError> {
        let now = Utc::now();
        let in_flight = self.registry.in_flight();
        let mut sources = Vec::new();
        for source in &self.config.sources {
            sources.push(SourceStatus {
                source: source.key.to_string(),
                title: source.title.clone(),
                records: self.store.count(&source.key, &[]).await?,
                last_sync: self.ledger.last_sync(&source.key),
                due: self.ledger.is_due(&source.key, source.refresh_interval, now),
                in_flight: in_flight.contains(&source.key),
            });
        }
        Ok(StatusResult { sources })
    }

    /// Downloads publication `key` into the download directory. The file
    /// name defaults to the last path segment of the key.
    pub async fn download(
        &self,
        key: &str,
        file_name: Option<&str>,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadResult, SyncError> {
        let file_name = match file_name {
            Some(name) => name.to_string(),
            None => default_file_name(key),
        };
        let descriptor = TransferDescriptor::publication(
            &self.config.base_url,
            key,
            &self.config.download_dir,
            &file_name,
        )?;
        let present = descriptor.destination.as_std_path().exists();
        let destination = descriptor.destination.to_string();

        let start = Instant::now();
        let mut events = self.transfers.start(descriptor);
        let mut last = None;
        while let Some(event) = events.next().await {
            if event.is_running {
                sink.event(ProgressEvent {
                    message: format!("phase=Download; {:.0}%", event.fraction * 100.0),
                    elapsed: Some(start.elapsed()),
                });
            }
            last = Some(event);
        }

        match last {
            Some(event) if event.is_complete => Ok(DownloadResult {
                id: key.to_string(),
                action: if present { "present" } else { "downloaded" }.to_string(),
                destination,
            }),
            Some(event) => match event.error {
                Some(message) => Err(SyncError::Transport(message)),
                None => Err(SyncError::Cancelled),
            },
            None => Err(SyncError::Cancelled),
        }
    }

    pub fn cancel_download(&self, id: &str) -> bool {
        self.transfers.cancel(id)
    }
}

fn default_file_name(key: &str) -> String {
    let name = key.rsplit('/').next().unwrap_or(key).trim();
    if name.is_empty() {
        "publication".to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use camino::Utf8PathBuf;
    use chrono::TimeDelta;

    use super::*;
    use crate::config::{Config, ConfigLoader};
    use crate::domain::{FieldValue, Record};
    use crate::source::DataSource;
    use crate::transfer::TransportResponse;

    struct NullSink;

    impl ProgressSink for NullSink {
        fn event(&self, _event: ProgressEvent) {}
    }

    struct CountingRemote {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RemoteSource for CountingRemote {
        async fn fetch(&self, source: &DataSource) -> Result<Vec<Record>, SyncError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![
                Record::new(source.key.clone(), format!("{}-{call}", source.key))
                    .with_field("navArea", FieldValue::String("4".into())),
            ])
        }
    }

    struct NoTransport;

    #[async_trait]
    impl Transport for NoTransport {
        async fn get(&self, _url: &str, _resume_from: u64) -> Result<TransportResponse, SyncError> {
            Err(SyncError::Transport("offline".to_string()))
        }
    }

    fn app(temp: &tempfile::TempDir) -> (App, Arc<CountingRemote>, Arc<SyncLedger>) {
        let data_dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let config: Config = serde_json::from_value(serde_json::json!({
            "data_dir": data_dir,
            "sources": ["asam", "modu"],
        }))
        .unwrap();
        let config = ConfigLoader::resolve_config(config).unwrap();
        let remote = Arc::new(CountingRemote {
            calls: AtomicUsize::new(0),
        });
        let ledger = Arc::new(SyncLedger::in_memory());
        let app = App::new(
            config,
            Arc::new(MemoryStore::new()),
            remote.clone(),
            ledger.clone(),
            Arc::new(NoTransport),
        );
        (app, remote, ledger)
    }

    #[tokio::test]
    async fn refresh_skips_sources_that_are_not_due() {
        let temp = tempfile::tempdir().unwrap();
        let (app, remote, _) = app(&temp);
        let asam: DataSourceKey = "asam".parse().unwrap();

        let first = app.refresh(&asam, false, &NullSink).await.unwrap();
        assert_eq!(first.action, "refreshed");
        assert_eq!(first.inserted, 1);
        assert!(first.last_sync.is_some());

        let second = app.refresh(&asam, false, &NullSink).await.unwrap();
        assert_eq!(second.action, "skipped");
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);

        let forced = app.refresh(&asam, true, &NullSink).await.unwrap();
        assert_eq!(forced.action, "refreshed");
        assert_eq!(remote.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn refresh_all_covers_every_configured_source() {
        let temp = tempfile::tempdir().unwrap();
        let (app, _, ledger) = app(&temp);
        let stale = Utc::now() - TimeDelta::days(30);
        ledger
            .record_success(&"modu".parse().unwrap(), stale)
            .unwrap();

        let result = app.refresh_all(false, &NullSink).await;
        assert_eq!(result.items.len(), 2);
        assert!(result.items.iter().all(|item| item.action == "refreshed"));
        assert_eq!(result.failures().count(), 0);

        let status = app.status().await.unwrap();
        assert!(status.sources.iter().all(|source| source.records == 1));
        assert!(status.sources.iter().all(|source| !source.due));
    }

    #[tokio::test]
    async fn unknown_sources_are_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let (app, _, _) = app(&temp);
        let err = app
            .refresh(&"light".parse().unwrap(), false, &NullSink)
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::UnknownDataSource("light".to_string()));
    }

    #[tokio::test]
    async fn list_collects_requested_pages() {
        let temp = tempfile::tempdir().unwrap();
        let (app, _, _) = app(&temp);
        let asam: DataSourceKey = "asam".parse().unwrap();
        app.refresh(&asam, false, &NullSink).await.unwrap();

        let listed = app.list(Query::new(asam), 3).await.unwrap();
        assert_eq!(listed.pages, 1);
        assert_eq!(listed.items.len(), 1);
    }

    #[tokio::test]
    async fn failed_downloads_surface_the_transfer_error() {
        let temp = tempfile::tempdir().unwrap();
        let (app, _, _) = app(&temp);
        let err = app
            .download("16694312/SFH00000/Pub_110.pdf", None, &NullSink)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("offline"));
    }

    #[test]
    fn default_file_name_uses_last_key_segment() {
        assert_eq!(default_file_name("16694312/SFH00000/Pub_110.pdf"), "Pub_110.pdf");
        assert_eq!(default_file_name("plain"), "plain");
        assert_eq!(default_file_name("trailing/"), "publication");
    }
}
