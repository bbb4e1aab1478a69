//! Concrete collaborator implementations for the monitor core: HTTP ladder
//! fetching, file-backed snapshot storage, a tracing analytics sink, and a
//! broadcast-channel notifier.

use std::path::{Path, PathBuf};
use std::time::Duration;

use alw_core::{LadderSnapshot, RawLadder};
use alw_monitor::{
    Analytics, AnalyticsEvent, FetchError, InstanceSettings, LadderFetcher, SnapshotId,
    SnapshotStore, UpdateNotifier,
};
use anyhow::Context;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "alw-adapters";

#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    /// Endpoint template; `{region}` is substituted per instance.
    pub base_url: String,
    /// Hard per-request timeout. The scheduler relies on every fetch
    /// eventually completing, so the collaborator must impose one.
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            base_url: "https://{region}.api.battle.net/wow/leaderboard".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// `reqwest`-backed [`LadderFetcher`]. One instance can serve several
/// monitors; per-request state lives in the settings argument.
#[derive(Debug)]
pub struct HttpLadderFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLadderFetcher {
    pub fn new(config: HttpFetcherConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url,
        })
    }

    fn endpoint_for(&self, settings: &InstanceSettings) -> String {
        let resolved = self.base_url.replace("{region}", &settings.region);
        format!(
            "{}/{}?locale={}&apikey={}",
            resolved, settings.bracket, settings.locale, settings.credential
        )
    }
}

#[async_trait]
impl LadderFetcher for HttpLadderFetcher {
    async fn fetch(&self, settings: &InstanceSettings) -> Result<RawLadder, FetchError> {
        let url = self.endpoint_for(settings);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        response
            .json::<RawLadder>()
            .await
            .map_err(|err| FetchError::Decode(err.to_string()))
    }
}

/// File-backed [`SnapshotStore`]: hash-addressed immutable snapshot files
/// plus a `latest.json` pointer, written via atomic temp-file rename. The
/// content hash doubles as the opaque snapshot id.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn snapshot_file_name(snapshot: &LadderSnapshot, content_hash: &str) -> String {
        let stamp = snapshot.captured_at.format("%Y%m%d_%H%M%S");
        format!("{stamp}_{content_hash}.json")
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load_latest(&self) -> anyhow::Result<Option<LadderSnapshot>> {
        let latest_path = self.root.join("latest.json");
        let bytes = match fs::read(&latest_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading {}", latest_path.display()))
            }
        };
        let snapshot = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", latest_path.display()))?;
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &LadderSnapshot) -> anyhow::Result<SnapshotId> {
        let bytes = serde_json::to_vec_pretty(snapshot).context("serializing snapshot")?;
        let content_hash = Self::sha256_hex(&bytes);
        let snapshot_path = self
            .root
            .join(Self::snapshot_file_name(snapshot, &content_hash));

        let already_present = fs::try_exists(&snapshot_path)
            .await
            .with_context(|| format!("checking {}", snapshot_path.display()))?;
        if !already_present {
            self.write_atomic(&snapshot_path, &bytes).await?;
        } else {
            debug!(path = %snapshot_path.display(), "snapshot file already present");
        }

        // The pointer is replaced last so a crash mid-save leaves the
        // previous baseline intact.
        self.write_atomic(&self.root.join("latest.json"), &bytes)
            .await?;

        Ok(SnapshotId(content_hash))
    }
}

/// [`Analytics`] sink that maps events onto structured tracing output.
/// High-frequency events go to `debug`, real updates to `info`, failures to
/// `warn`.
#[derive(Debug, Default, Clone)]
pub struct TracingAnalytics;

impl Analytics for TracingAnalytics {
    fn record(&self, instance: &str, event: AnalyticsEvent) {
        match event {
            AnalyticsEvent::RequestIssued => {
                debug!(instance, "ladder request issued");
            }
            AnalyticsEvent::TickSkipped { in_flight } => {
                debug!(instance, in_flight, "tick skipped at concurrency ceiling");
            }
            AnalyticsEvent::FetchSucceeded { elapsed } => {
                debug!(instance, elapsed_ms = elapsed.as_millis() as u64, "fetch succeeded");
            }
            AnalyticsEvent::FetchFailed { elapsed, error } => {
                warn!(instance, elapsed_ms = elapsed.as_millis() as u64, error, "fetch failed");
            }
            AnalyticsEvent::EntriesFetched { count } => {
                debug!(instance, count, "ladder entries fetched");
            }
            AnalyticsEvent::RequestRate { per_second } => {
                debug!(instance, per_second, "request rate");
            }
            AnalyticsEvent::UniqueUpdate { rank_count } => {
                info!(instance, rank_count, "unique ladder update");
            }
            AnalyticsEvent::UniqueUpdateRate { per_second } => {
                debug!(instance, per_second, "unique update rate");
            }
            AnalyticsEvent::MalformedPayload { error } => {
                warn!(instance, error, "malformed ladder payload");
            }
            AnalyticsEvent::PersistFailed { error } => {
                warn!(instance, error, "snapshot persistence failed");
            }
        }
    }
}

/// [`UpdateNotifier`] backed by a tokio broadcast channel. Downstream
/// consumers subscribe for snapshot ids; publishing with no subscribers is
/// not an error.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<SnapshotId>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SnapshotId> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl UpdateNotifier for BroadcastNotifier {
    async fn publish(&self, id: &SnapshotId) -> anyhow::Result<()> {
        if self.sender.send(id.clone()).is_err() {
            debug!(snapshot_id = %id, "no notification subscribers");
        }
        Ok(())
    }
}
