use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, RANGE};
use reqwest::{Certificate, Client, ClientBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::remote::default_headers;

const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// One download: what to fetch and where the finished file goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDescriptor {
    pub id: String,
    pub url: String,
    pub destination: Utf8PathBuf,
    #[serde(default)]
    pub title: Option<String>,
}

impl TransferDescriptor {
    pub fn new(id: impl Into<String>, url: impl Into<String>, destination: Utf8PathBuf) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            destination,
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Electronic publication `key`, saved as `file_name` under `download_dir`.
    pub fn publication(
        base_url: &str,
        key: &str,
        download_dir: &Utf8Path,
        file_name: &str,
    ) -> Result<Self, SyncError> {
        Ok(Self::new(
            key,
            publication_download_url(base_url, key)?,
            download_dir.join(file_name),
        ))
    }
}

pub fn publication_download_url(base_url: &str, key: &str) -> Result<String, SyncError> {
    let mut url = Url::parse(&format!(
        "{}/publications/download",
        base_url.trim_end_matches('/')
    ))
    .map_err(|err| SyncError::Transport(err.to_string()))?;
    url.query_pairs_mut()
        .append_pair("key", key)
        .append_pair("type", "download");
    Ok(url.into())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferProgress {
    pub id: String,
    pub is_running: bool,
    pub is_complete: bool,
    pub fraction: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransferProgress {
    fn running(id: &str, fraction: f64) -> Self {
        Self {
            id: id.to_string(),
            is_running: true,
            is_complete: false,
            fraction,
            error: None,
        }
    }

    fn complete(id: &str) -> Self {
        Self {
            id: id.to_string(),
            is_running: false,
            is_complete: true,
            fraction: 1.0,
            error: None,
        }
    }

    fn failed(id: &str, message: String) -> Self {
        Self {
            id: id.to_string(),
            is_running: false,
            is_complete: false,
            fraction: 0.0,
            error: Some(message),
        }
    }

    fn cancelled(id: &str) -> Self {
        Self {
            id: id.to_string(),
            is_running: false,
            is_complete: false,
            fraction: 0.0,
            error: None,
        }
    }

    /// Last event a transfer emits before retiring.
    pub fn is_terminal(&self) -> bool {
        !self.is_running
    }
}

pub type ByteStream = BoxStream<'static, Result<Vec<u8>, SyncError>>;

pub struct TransportResponse {
    pub status: u16,
    /// Length of `body`, not of the whole resource.
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

/// Byte source behind a transfer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// GETs `url`, asking for bytes from `resume_from` onward when non-zero.
    async fn get(&self, url: &str, resume_from: u64) -> Result<TransportResponse, SyncError>;
}

/// Adjusts the HTTP client used for one host, e.g. to pin its certificate.
pub trait TrustEvaluator: Send + Sync {
    fn configure(&self, builder: ClientBuilder) -> Result<ClientBuilder, SyncError>;
}

/// Trusts only the given PEM certificate(s) instead of the built-in roots.
pub struct PinnedCertificate {
    pem: Vec<u8>,
}

impl PinnedCertificate {
    pub fn from_pem(pem: impl Into<Vec<u8>>) -> Self {
        Self { pem: pem.into() }
    }
}

impl TrustEvaluator for PinnedCertificate {
    fn configure(&self, builder: ClientBuilder) -> Result<ClientBuilder, SyncError> {
        let certificate =
            Certificate::from_pem(&self.pem).map_err(|err| SyncError::Transport(err.to_string()))?;
        Ok(builder
            .tls_built_in_root_certs(false)
            .add_root_certificate(certificate))
    }
}

#[derive(Clone, Default)]
pub struct TrustPolicy {
    evaluators: HashMap<String, Arc<dyn TrustEvaluator>>,
}

impl TrustPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, host: impl Into<String>, evaluator: Arc<dyn TrustEvaluator>) -> Self {
        self.evaluators
            .insert(host.into().to_ascii_lowercase(), evaluator);
        self
    }

    pub fn evaluator_for(&self, host: &str) -> Option<&Arc<dyn TrustEvaluator>> {
        self.evaluators.get(&host.to_ascii_lowercase())
    }
}

/// reqwest transport. Hosts with a registered evaluator get their own client;
/// every other host shares the default one.
pub struct HttpTransport {
    default_client: Client,
    policy: TrustPolicy,
    host_clients: Mutex<HashMap<String, Client>>,
}

impl HttpTransport {
    pub fn new(policy: TrustPolicy) -> Result<Self, SyncError> {
        Ok(Self {
            default_client: Self::builder()?
                .build()
                .map_err(|err| SyncError::Transport(err.to_string()))?,
            policy,
            host_clients: Mutex::new(HashMap::new()),
        })
    }

    fn builder() -> Result<ClientBuilder, SyncError> {
        let mut headers = default_headers()?;
        headers.remove(reqwest::header::ACCEPT);
        Ok(Client::builder().default_headers(headers))
    }

    fn client_for(&self, url: &Url) -> Result<Client, SyncError> {
        let Some(host) = url.host_str() else {
            return Ok(self.default_client.clone());
        };
        let Some(evaluator) = self.policy.evaluator_for(host) else {
            return Ok(self.default_client.clone());
        };
        let mut clients = self.host_clients.lock();
        if let Some(client) = clients.get(host) {
            return Ok(client.clone());
        }
        let client = evaluator
            .configure(Self::builder()?)?
            .build()
            .map_err(|err| SyncError::Transport(err.to_string()))?;
        debug!(host, "built client with custom trust");
        clients.insert(host.to_string(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str, resume_from: u64) -> Result<TransportResponse, SyncError> {
        let parsed = Url::parse(url).map_err(|err| SyncError::Transport(err.to_string()))?;
        let client = self.client_for(&parsed)?;
        let mut headers = HeaderMap::new();
        if resume_from > 0 {
            headers.insert(
                RANGE,
                HeaderValue::from_str(&format!("bytes={resume_from}-"))
                    .map_err(|err| SyncError::Transport(err.to_string()))?,
            );
        }
        let response = client
            .get(parsed)
            .headers(headers)
            .send()
            .await
            .map_err(|err| SyncError::Transport(err.to_string()))?;
        let status = response.status().as_u16();
        let content_length = response.content_length();
        let body = stream::try_unfold(response, |mut response| async move {
            let chunk = response
                .chunk()
                .await
                .map_err(|err| SyncError::Transport(err.to_string()))?;
            Ok(chunk.map(|bytes| (bytes.to_vec(), response)))
        })
        .boxed();
        Ok(TransportResponse {
            status,
            content_length,
            body,
        })
    }
}

type RetireHook = Arc<dyn Fn(&TransferManager) + Send + Sync>;

enum Phase {
    Idle,
    Running {
        token: CancellationToken,
        finalizing: bool,
    },
}

/// Drives one [`TransferDescriptor`]. Progress goes to every subscriber.
pub struct TransferManager {
    descriptor: TransferDescriptor,
    transport: Arc<dyn Transport>,
    staging_dir: Utf8PathBuf,
    events: broadcast::Sender<TransferProgress>,
    phase: Mutex<Phase>,
    on_retire: Option<RetireHook>,
}

impl TransferManager {
    pub fn new(
        descriptor: TransferDescriptor,
        transport: Arc<dyn Transport>,
        staging_dir: Utf8PathBuf,
    ) -> Self {
        let (events, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self {
            descriptor,
            transport,
            staging_dir,
            events,
            phase: Mutex::new(Phase::Idle),
            on_retire: None,
        }
    }

    fn with_retire_hook(mut self, hook: RetireHook) -> Self {
        self.on_retire = Some(hook);
        self
    }

    pub fn descriptor(&self) -> &TransferDescriptor {
        &self.descriptor
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.phase.lock(), Phase::Running { .. })
    }

    /// Progress events emitted after this call.
    pub fn subscribe(&self) -> BoxStream<'static, TransferProgress> {
        BroadcastStream::new(self.events.subscribe())
            .filter_map(|event| futures::future::ready(event.ok()))
            .boxed()
    }

    /// Partial download kept between attempts.
    pub fn staging_path(&self) -> Utf8PathBuf {
        let name = self
            .descriptor
            .id
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                    ch
                } else {
                    '_'
                }
            })
            .collect::<String>();
        self.staging_dir.join(format!("{name}.part"))
    }

    /// Completes at once when the destination already exists. Otherwise
    /// spawns the download; a call while one is running does nothing.
    pub fn start(self: &Arc<Self>) {
        let token = {
            let mut phase = self.phase.lock();
            if matches!(*phase, Phase::Running { .. }) {
                debug!(id = %self.descriptor.id, "transfer already running");
                return;
            }
            if self.descriptor.destination.as_std_path().exists() {
                drop(phase);
                debug!(id = %self.descriptor.id, "destination already present");
                self.finish(TransferProgress::complete(&self.descriptor.id));
                return;
            }
            let token = CancellationToken::new();
            *phase = Phase::Running {
                token: token.clone(),
                finalizing: false,
            };
            token
        };
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run(token).await });
    }

    /// Aborts a running transfer. No-op once it has completed or while the
    /// finished file is being moved into place.
    pub fn cancel(&self) {
        {
            let mut phase = self.phase.lock();
            match &*phase {
                Phase::Running {
                    token,
                    finalizing: false,
                } => token.cancel(),
                _ => return,
            }
            *phase = Phase::Idle;
        }
        info!(id = %self.descriptor.id, "transfer cancelled");
        self.finish(TransferProgress::cancelled(&self.descriptor.id));
    }

    async fn run(&self, token: CancellationToken) {
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            outcome = self.transfer(&token) => outcome,
        };
        {
            let mut phase = self.phase.lock();
            if token.is_cancelled() {
                return;
            }
            *phase = Phase::Idle;
        }
        let event = match outcome {
            Ok(bytes) => {
                info!(id = %self.descriptor.id, bytes, destination = %self.descriptor.destination, "transfer complete");
                TransferProgress::complete(&self.descriptor.id)
            }
            Err(SyncError::Cancelled) => return,
            Err(SyncError::Status { status, .. }) => {
                warn!(id = %self.descriptor.id, status, "transfer rejected");
                TransferProgress::failed(&self.descriptor.id, format!("download failed ({status})"))
            }
            Err(err) => {
                warn!(id = %self.descriptor.id, error = %err, "transfer failed");
                TransferProgress::failed(&self.descriptor.id, err.to_string())
            }
        };
        self.finish(event);
    }

    async fn transfer(&self, token: &CancellationToken) -> Result<u64, SyncError> {
        let staging = self.staging_path();
        tokio::fs::create_dir_all(self.staging_dir.as_std_path())
            .await
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let mut resume_from = tokio::fs::metadata(staging.as_std_path())
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);

        let mut response = self.transport.get(&self.descriptor.url, resume_from).await?;
        if resume_from > 0 && response.status == StatusCode::RANGE_NOT_SATISFIABLE.as_u16() {
            // The staged bytes no longer line up with the resource.
            debug!(id = %self.descriptor.id, resume_from, "range rejected, restarting");
            drop(response);
            tokio::fs::remove_file(staging.as_std_path())
                .await
                .map_err(|err| SyncError::Filesystem(format!("remove {staging}: {err}")))?;
            resume_from = 0;
            response = self.transport.get(&self.descriptor.url, 0).await?;
        }
        if !(200..300).contains(&response.status) {
            return Err(SyncError::Status {
                status: response.status,
                message: format!("download failed ({})", response.status),
            });
        }
        let appending = resume_from > 0 && response.status == StatusCode::PARTIAL_CONTENT.as_u16();
        let mut written = if appending { resume_from } else { 0 };
        let expected = response.content_length.map(|length| length + written);
        debug!(id = %self.descriptor.id, resume_from = written, ?expected, "receiving");

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(appending)
            .truncate(!appending)
            .open(staging.as_std_path())
            .await
            .map_err(|err| SyncError::Filesystem(format!("open {staging}: {err}")))?;
        let mut body = response.body;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|err| SyncError::Filesystem(format!("write {staging}: {err}")))?;
            written += chunk.len() as u64;
            let fraction = match expected {
                Some(total) if total > 0 => (written as f64 / total as f64).min(1.0),
                _ => 0.0,
            };
            let _ = self
                .events
                .send(TransferProgress::running(&self.descriptor.id, fraction));
        }
        file.sync_all()
            .await
            .map_err(|err| SyncError::Filesystem(format!("sync {staging}: {err}")))?;
        drop(file);

        {
            let mut phase = self.phase.lock();
            match &mut *phase {
                Phase::Running { finalizing, .. } if !token.is_cancelled() => *finalizing = true,
                _ => return Err(SyncError::Cancelled),
            }
        }
        let destination = self.descriptor.destination.clone();
        tokio::task::spawn_blocking(move || move_into_place(&staging, &destination))
            .await
            .map_err(|err| SyncError::Filesystem(err.to_string()))??;
        Ok(written)
    }

    fn finish(&self, event: TransferProgress) {
        if let Some(hook) = &self.on_retire {
            hook(self);
        }
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

/// Renames `staging` over `destination`, falling back to copy-and-persist
/// when the two live on different filesystems.
fn move_into_place(staging: &Utf8Path, destination: &Utf8Path) -> Result<(), SyncError> {
    let parent = destination
        .parent()
        .ok_or_else(|| SyncError::Filesystem(format!("invalid destination path {destination}")))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| SyncError::Filesystem(format!("create {parent}: {err}")))?;
    if destination.as_std_path().exists() {
        fs::remove_file(destination.as_std_path())
            .map_err(|err| SyncError::Filesystem(format!("remove {destination}: {err}")))?;
    }
    if fs::rename(staging.as_std_path(), destination.as_std_path()).is_ok() {
        return Ok(());
    }
    let temp = tempfile::Builder::new()
        .prefix(".msi-sync-transfer")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    fs::copy(staging.as_std_path(), temp.path())
        .map_err(|err| SyncError::Filesystem(format!("copy {staging}: {err}")))?;
    temp.persist(destination.as_std_path())
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    fs::remove_file(staging.as_std_path())
        .map_err(|err| SyncError::Filesystem(format!("remove {staging}: {err}")))?;
    Ok(())
}

/// One [`TransferManager`] per descriptor id; managers are dropped from the
/// registry when they retire.
pub struct Transfers {
    transport: Arc<dyn Transport>,
    staging_dir: Utf8PathBuf,
    managers: Arc<Mutex<HashMap<String, Arc<TransferManager>>>>,
}

impl Transfers {
    pub fn new(transport: Arc<dyn Transport>, staging_dir: Utf8PathBuf) -> Self {
        Self {
            transport,
            staging_dir,
            managers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The live manager for `descriptor.id`, created when absent.
    pub fn manager(&self, descriptor: TransferDescriptor) -> Arc<TransferManager> {
        let mut managers = self.managers.lock();
        if let Some(manager) = managers.get(&descriptor.id) {
            return manager.clone();
        }
        let registry: Weak<Mutex<HashMap<String, Arc<TransferManager>>>> =
            Arc::downgrade(&self.managers);
        let hook: RetireHook = Arc::new(move |retiring: &TransferManager| {
            let Some(managers) = registry.upgrade() else {
                return;
            };
            let mut managers = managers.lock();
            let id = &retiring.descriptor.id;
            // A stale handle must not evict the manager that replaced it.
            if managers
                .get(id)
                .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), retiring))
            {
                managers.remove(id);
            }
        });
        let id = descriptor.id.clone();
        let manager = Arc::new(
            TransferManager::new(descriptor, self.transport.clone(), self.staging_dir.clone())
                .with_retire_hook(hook),
        );
        managers.insert(id, manager.clone());
        manager
    }

    /// Subscribes, then starts. The returned stream ends after the terminal
    /// event.
    pub fn start(&self, descriptor: TransferDescriptor) -> BoxStream<'static, TransferProgress> {
        let manager = self.manager(descriptor);
        let events = manager.subscribe();
        manager.start();
        stream::unfold((events, false), |(mut events, done)| async move {
            if done {
                return None;
            }
            let event = events.next().await?;
            let done = event.is_terminal();
            Some((event, (events, done)))
        })
        .boxed()
    }

    pub fn cancel(&self, id: &str) -> bool {
        let manager = self.managers.lock().get(id).cloned();
        match manager {
            Some(manager) => {
                manager.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active(&self) -> Vec<String> {
        let mut ids = self.managers.lock().keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }
}
