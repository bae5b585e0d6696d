use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::DataSourceKey;
use crate::error::SyncError;
use crate::import::BatchImporter;
use crate::remote::RemoteSource;
use crate::source::DataSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Executing,
    Finished,
}

#[derive(Debug)]
struct Lifecycle {
    state: TaskState,
    committing: bool,
}

/// Single-shot refresh of one data source: remote fetch, then commit through
/// the batch importer.
///
/// Cancellation is cooperative. It is checked before the remote call, raced
/// against it, and checked again before the commit; a cancelled task commits
/// nothing and resolves to `Ok(0)`.
pub struct FetchTask {
    source: DataSource,
    remote: Arc<dyn RemoteSource>,
    importer: BatchImporter,
    lifecycle: Mutex<Lifecycle>,
    token: CancellationToken,
}

impl FetchTask {
    pub fn new(source: DataSource, remote: Arc<dyn RemoteSource>, importer: BatchImporter) -> Self {
        Self {
            source,
            remote,
            importer,
            lifecycle: Mutex::new(Lifecycle {
                state: TaskState::Ready,
                committing: false,
            }),
            token: CancellationToken::new(),
        }
    }

    pub fn key(&self) -> &DataSourceKey {
        &self.source.key
    }

    pub fn state(&self) -> TaskState {
        self.lifecycle.lock().state
    }

    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Finished
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Reports `Finished` right away unless the commit already began, in
    /// which case the task finishes once the commit does.
    pub fn cancel(&self) {
        let mut lifecycle = self.lifecycle.lock();
        self.token.cancel();
        if !lifecycle.committing {
            lifecycle.state = TaskState::Finished;
        }
        debug!(source = %self.source.key, "fetch task cancelled");
    }

    pub async fn start(&self) -> Result<usize, SyncError> {
        {
            let mut lifecycle = self.lifecycle.lock();
            match lifecycle.state {
                TaskState::Ready => lifecycle.state = TaskState::Executing,
                TaskState::Finished if self.token.is_cancelled() => return Ok(0),
                _ => return Err(SyncError::TaskAlreadyStarted(self.source.key.to_string())),
            }
        }

        let result = self.execute().await;

        let mut lifecycle = self.lifecycle.lock();
        lifecycle.state = TaskState::Finished;
        lifecycle.committing = false;
        result
    }

    async fn execute(&self) -> Result<usize, SyncError> {
        if self.token.is_cancelled() {
            return Ok(0);
        }

        let records = tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                debug!(source = %self.source.key, "cancelled while awaiting remote");
                return Ok(0);
            }
            result = self.remote.fetch(&self.source) => result?,
        };

        {
            let mut lifecycle = self.lifecycle.lock();
            if self.token.is_cancelled() {
                debug!(
                    source = %self.source.key,
                    discarded = records.len(),
                    "cancelled before commit"
                );
                return Ok(0);
            }
            lifecycle.committing = true;
        }

        let inserted = self.importer.import(records).await?;
        info!(source = %self.source.key, inserted, "fetch task committed");
        Ok(inserted)
    }
}

type SharedResult = Shared<BoxFuture<'static, Result<usize, SyncError>>>;

struct InFlight {
    task: Arc<FetchTask>,
    result: SharedResult,
    generation: u64,
}

/// Handle returned by [`FetchRegistry::submit`].
pub struct Submission {
    pub joined: bool,
    task: Arc<FetchTask>,
    result: SharedResult,
}

impl Submission {
    pub fn task(&self) -> &Arc<FetchTask> {
        &self.task
    }

    pub async fn wait(self) -> Result<usize, SyncError> {
        self.result.await
    }
}

/// Keeps at most one fetch task in flight per data source. A request for a
/// source that is already refreshing joins the running task instead of
/// starting a duplicate.
#[derive(Default)]
pub struct FetchRegistry {
    inflight: Arc<Mutex<HashMap<DataSourceKey, InFlight>>>,
    generation: AtomicU64,
}

impl FetchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `task` onto the runtime, or joins the task already running for
    /// the same key (in which case `task` is dropped unstarted).
    pub fn submit(&self, task: FetchTask) -> Submission {
        let mut inflight = self.inflight.lock();
        if let Some(existing) = inflight.get(task.key()) {
            debug!(source = %task.key(), "joining in-flight fetch");
            return Submission {
                joined: true,
                task: existing.task.clone(),
                result: existing.result.clone(),
            };
        }

        let key = task.key().clone();
        let task = Arc::new(task);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let runner = task.clone();
        let registry = self.inflight.clone();
        let retire_key = key.clone();
        let handle = tokio::spawn(async move {
            let result = runner.start().await;
            let mut inflight = registry.lock();
            if inflight
                .get(&retire_key)
                .is_some_and(|entry| entry.generation == generation)
            {
                inflight.remove(&retire_key);
            }
            result
        });

        let join_key = key.clone();
        let result = async move {
            handle.await.unwrap_or_else(|err| {
                warn!(source = %join_key, %err, "fetch task did not complete");
                Err(SyncError::Transport(format!(
                    "fetch task for {join_key} did not complete: {err}"
                )))
            })
        }
        .boxed()
        .shared();

        inflight.insert(
            key,
            InFlight {
                task: task.clone(),
                result: result.clone(),
                generation,
            },
        );
        Submission {
            joined: false,
            task,
            result,
        }
    }

    pub async fn run(&self, task: FetchTask) -> Result<usize, SyncError> {
        self.submit(task).wait().await
    }

    /// Cancels the in-flight task for `key`. Returns whether one was running.
    pub fn cancel(&self, key: &DataSourceKey) -> bool {
        match self.inflight.lock().get(key) {
            Some(entry) => {
                entry.task.cancel();
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> Vec<DataSourceKey> {
        let mut keys = self.inflight.lock().keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use tokio::sync::{Notify, Semaphore};

    use super::*;
    use crate::domain::Record;
    use crate::source::find;
    use crate::store::{MemoryStore, RecordStore};

    struct GatedRemote {
        calls: AtomicUsize,
        entered: Notify,
        gate: Semaphore,
        response: Result<Vec<Record>, SyncError>,
    }

    impl GatedRemote {
        fn new(response: Result<Vec<Record>, SyncError>, open: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                entered: Notify::new(),
                gate: Semaphore::new(if open { Semaphore::MAX_PERMITS } else { 0 }),
                response,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteSource for GatedRemote {
        async fn fetch(&self, _source: &DataSource) -> Result<Vec<Record>, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|err| SyncError::Transport(err.to_string()))?;
            self.response.clone()
        }
    }

    fn records(keys: &[&str]) -> Vec<Record> {
        keys.iter()
            .map(|key| Record::new("asam".parse().unwrap(), *key))
            .collect()
    }

    fn task(remote: Arc<GatedRemote>, store: Arc<MemoryStore>) -> FetchTask {
        let source = find(&"asam".parse().unwrap()).unwrap();
        FetchTask::new(source, remote, BatchImporter::new(store))
    }

    async fn stored(store: &MemoryStore) -> usize {
        store.count(&"asam".parse().unwrap(), &[]).await.unwrap()
    }

    #[tokio::test]
    async fn start_runs_fetch_and_commit_once() {
        let remote = GatedRemote::new(Ok(records(&["A", "B"])), true);
        let store = Arc::new(MemoryStore::new());
        let task = task(remote.clone(), store.clone());
        assert_eq!(task.state(), TaskState::Ready);

        assert_eq!(task.start().await.unwrap(), 2);
        assert!(task.is_finished());
        assert_matches!(task.start().await, Err(SyncError::TaskAlreadyStarted(_)));
        assert_eq!(remote.calls(), 1);
    }

    #[tokio::test]
    async fn cancel_before_start_finishes_immediately() {
        let remote = GatedRemote::new(Ok(records(&["A"])), true);
        let store = Arc::new(MemoryStore::new());
        let task = task(remote.clone(), store.clone());

        task.cancel();
        assert!(task.is_finished());
        assert_eq!(task.start().await.unwrap(), 0);
        assert_eq!(remote.calls(), 0);
        assert_eq!(stored(&store).await, 0);
    }

    #[tokio::test]
    async fn cancel_while_awaiting_remote_discards_results() {
        let remote = GatedRemote::new(Ok(records(&["A", "B"])), false);
        let store = Arc::new(MemoryStore::new());
        let task = Arc::new(task(remote.clone(), store.clone()));

        let runner = task.clone();
        let handle = tokio::spawn(async move { runner.start().await });
        remote.entered.notified().await;
        assert_eq!(task.state(), TaskState::Executing);

        task.cancel();
        assert!(task.is_finished());
        remote.gate.add_permits(1);

        assert_eq!(handle.await.unwrap().unwrap(), 0);
        assert_eq!(stored(&store).await, 0);
    }

    #[tokio::test]
    async fn remote_errors_are_terminal() {
        let remote = GatedRemote::new(Err(SyncError::Transport("offline".into())), true);
        let store = Arc::new(MemoryStore::new());
        let task = task(remote, store);
        assert_matches!(task.start().await, Err(SyncError::Transport(_)));
        assert!(task.is_finished());
    }

    #[tokio::test]
    async fn registry_joins_in_flight_refresh() {
        let remote = GatedRemote::new(Ok(records(&["A", "B", "C"])), false);
        let store = Arc::new(MemoryStore::new());
        let registry = FetchRegistry::new();

        let first = registry.submit(task(remote.clone(), store.clone()));
        remote.entered.notified().await;
        let second = registry.submit(task(remote.clone(), store.clone()));
        assert!(!first.joined);
        assert!(second.joined);
        assert_eq!(
            registry.in_flight(),
            vec!["asam".parse::<DataSourceKey>().unwrap()]
        );

        remote.gate.add_permits(1);
        assert_eq!(first.wait().await.unwrap(), 3);
        assert_eq!(second.wait().await.unwrap(), 3);
        assert_eq!(remote.calls(), 1);
        assert!(registry.in_flight().is_empty());
    }

    #[tokio::test]
    async fn registry_starts_fresh_task_after_completion() {
        let remote = GatedRemote::new(Ok(records(&["A"])), true);
        let store = Arc::new(MemoryStore::new());
        let registry = FetchRegistry::new();

        assert_eq!(registry.run(task(remote.clone(), store.clone())).await.unwrap(), 1);
        assert_eq!(registry.run(task(remote.clone(), store.clone())).await.unwrap(), 0);
        assert_eq!(remote.calls(), 2);
    }

    #[tokio::test]
    async fn registry_cancel_by_key() {
        let remote = GatedRemote::new(Ok(records(&["A"])), false);
        let store = Arc::new(MemoryStore::new());
        let registry = FetchRegistry::new();

        let submission = registry.submit(task(remote.clone(), store.clone()));
        remote.entered.notified().await;
        assert!(registry.cancel(&"asam".parse().unwrap()));
        assert!(submission.task().is_finished());
        assert_eq!(submission.wait().await.unwrap(), 0);
        assert!(!registry.cancel(&"asam".parse().unwrap()));
        assert_eq!(stored(&store).await, 0);
    }
}
