use crate::lifecycle::AssetEvent;
use crate::task::DownloadTask;
use crate::{ModelError, Result, MAX_CONCURRENT_DOWNLOADS};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Semaphore};

/// Body of a fetched resource, delivered in chunks.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

/// Fetch-by-URL capability. No range requests: every open starts at byte 0.
#[async_trait]
pub trait DownloadSource: Send + Sync {
    async fn open(&self, url: &str) -> Result<ByteStream>;
}

/// HTTP source with fixed connect/read timeouts.
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(Duration::from_secs(30))
            .user_agent(concat!("mlchat/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ModelError::DownloadFailed(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DownloadSource for HttpSource {
    async fn open(&self, url: &str) -> Result<ByteStream> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ModelError::DownloadFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ModelError::DownloadFailed(format!(
                "HTTP {}: {}",
                response.status(),
                url
            )));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| ModelError::DownloadFailed(e.to_string()))
            })
            .boxed())
    }
}

/// Retry and concurrency knobs for transfers.
#[derive(Debug, Clone)]
pub struct DownloadPolicy {
    pub max_concurrent: usize,
    /// Attempts per file, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each failure.
    pub initial_backoff: Duration,
}

impl Default for DownloadPolicy {
    fn default() -> Self {
        Self {
            max_concurrent: MAX_CONCURRENT_DOWNLOADS,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

/// Temp name a transfer writes to before relocation.
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

/// Download `url` into `dest`, retrying per `policy`.
///
/// Bytes land in `<dest>.part` and are renamed into place only after the
/// whole body was written, so `dest` never holds a partial file.
pub async fn fetch_to_file(
    source: &dyn DownloadSource,
    url: &str,
    dest: &Path,
    policy: &DownloadPolicy,
) -> Result<u64> {
    let mut attempt = 1;
    let mut backoff = policy.initial_backoff;
    loop {
        match fetch_once(source, url, dest).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) if attempt < policy.max_attempts => {
                tracing::warn!(url, attempt, error = %e, "Download attempt failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn fetch_once(source: &dyn DownloadSource, url: &str, dest: &Path) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = part_path(dest);
    match write_body(source, url, &tmp).await {
        Ok(total) => {
            tokio::fs::rename(&tmp, dest).await?;
            Ok(total)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(e)
        }
    }
}

async fn write_body(source: &dyn DownloadSource, url: &str, tmp: &Path) -> Result<u64> {
    let mut stream = source.open(url).await?;
    let mut file = tokio::fs::File::create(tmp).await?;
    let mut total = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        total += chunk.len() as u64;
    }

    file.flush().await?;
    Ok(total)
}

/// Bounded set of transfer workers for one model.
///
/// Completions are reported as lifecycle events on `done`, the single
/// channel the asset manager drains.
#[derive(Clone)]
pub struct DownloadPool {
    source: Arc<dyn DownloadSource>,
    permits: Arc<Semaphore>,
    policy: DownloadPolicy,
}

impl DownloadPool {
    pub fn new(source: Arc<dyn DownloadSource>, policy: DownloadPolicy) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(policy.max_concurrent)),
            source,
            policy,
        }
    }

    pub fn source(&self) -> &Arc<dyn DownloadSource> {
        &self.source
    }

    pub fn policy(&self) -> &DownloadPolicy {
        &self.policy
    }

    pub fn spawn(
        &self,
        runtime: &tokio::runtime::Handle,
        task: DownloadTask,
        done: mpsc::UnboundedSender<AssetEvent>,
    ) {
        let pool = self.clone();
        runtime.spawn(async move {
            let Ok(_permit) = pool.permits.clone().acquire_owned().await else {
                return;
            };
            tracing::info!(url = %task.source, dest = ?task.destination, "Downloading");
            let event =
                match fetch_to_file(&*pool.source, &task.source, &task.destination, &pool.policy)
                    .await
                {
                    Ok(bytes) => {
                        tracing::debug!(url = %task.source, bytes, "Download finished");
                        AssetEvent::TaskFinished(task)
                    }
                    Err(e) => {
                        tracing::error!(url = %task.source, error = %e, "Download failed");
                        AssetEvent::TaskFailed {
                            task,
                            error: e.to_string(),
                        }
                    }
                };
            let _ = done.send(event);
        });
    }
}
