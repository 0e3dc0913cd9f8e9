//! Runs the per-model lifecycle: executes effects, owns the download pool
//! and serializes every lifecycle mutation.
//!
//! User requests (`handle_*`) apply synchronously on the caller so that a
//! precondition violation panics where the bad call was made. Worker
//! completions arrive on one mpsc channel drained by a coordinator task.

use crate::config::{ModelConfig, ParamsManifest};
use crate::download::{fetch_to_file, DownloadPool};
use crate::lifecycle::{AssetEvent, AssetLifecycle, AssetState, Effect};
use crate::task::DownloadTask;
use crate::paths::relative_path;
use crate::{resolve_url, with_trailing_slash, Result};
use crate::{MODEL_CONFIG_FILENAME, PARAMS_CONFIG_FILENAME};
use async_trait::async_trait;
use mlchat_events::{event_names, EventBusRef, EventQueue, ModelStateEvent, NoticeEvent};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, watch};

/// Whoever registered the model. Consulted before files of a ready model
/// are touched, and told once the model directory is gone.
#[async_trait]
pub trait AssetOwner: Send + Sync {
    /// Stop any use of `model_id`; resolves once it is safe to delete files.
    async fn release(&self, model_id: &str);
    fn removed(&self, model_id: &str);
}

/// Owner for managers that stand alone.
pub struct NoopOwner;

#[async_trait]
impl AssetOwner for NoopOwner {
    async fn release(&self, _model_id: &str) {}
    fn removed(&self, _model_id: &str) {}
}

/// Read-only view of a manager, published after every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetSnapshot {
    pub model_id: String,
    pub state: AssetState,
    pub progress: usize,
    pub total: usize,
    pub active: usize,
    /// Set once the model directory was deleted.
    pub removed: bool,
}

#[derive(Clone)]
pub struct AssetManager {
    shared: Arc<Shared>,
}

struct Shared {
    config: ModelConfig,
    model_url: String,
    model_dir: PathBuf,
    lifecycle: Mutex<AssetLifecycle>,
    manifest: Mutex<Option<ParamsManifest>>,
    pool: DownloadPool,
    events_tx: mpsc::UnboundedSender<AssetEvent>,
    snapshot_tx: watch::Sender<AssetSnapshot>,
    events: EventQueue,
    owner: Arc<dyn AssetOwner>,
    runtime: tokio::runtime::Handle,
}

impl AssetManager {
    /// Create the manager and start manifest discovery.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        config: ModelConfig,
        model_url: &str,
        model_dir: PathBuf,
        pool: DownloadPool,
        bus: EventBusRef,
        owner: Arc<dyn AssetOwner>,
    ) -> Self {
        let runtime = tokio::runtime::Handle::current();
        let lifecycle = AssetLifecycle::new(pool.policy().max_concurrent);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(AssetSnapshot {
            model_id: config.model_id.clone(),
            state: lifecycle.state(),
            progress: 0,
            total: 0,
            active: 0,
            removed: false,
        });

        let boot = lifecycle.boot();
        let shared = Arc::new(Shared {
            config,
            model_url: with_trailing_slash(model_url),
            model_dir,
            lifecycle: Mutex::new(lifecycle),
            manifest: Mutex::new(None),
            pool,
            events_tx,
            snapshot_tx,
            events: EventQueue::new(bus),
            owner,
            runtime: runtime.clone(),
        });

        runtime.spawn(coordinate(Arc::downgrade(&shared), events_rx));
        shared.run(boot);
        Self { shared }
    }

    pub fn model_id(&self) -> &str {
        &self.shared.config.model_id
    }

    pub fn config(&self) -> &ModelConfig {
        &self.shared.config
    }

    pub fn model_url(&self) -> &str {
        &self.shared.model_url
    }

    pub fn model_dir(&self) -> &Path {
        &self.shared.model_dir
    }

    pub fn state(&self) -> AssetState {
        self.shared.lifecycle().state()
    }

    pub fn snapshot(&self) -> AssetSnapshot {
        self.shared.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AssetSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    /// Wait until a published snapshot satisfies `pred`.
    pub async fn wait_for(&self, pred: impl FnMut(&AssetSnapshot) -> bool) -> AssetSnapshot {
        let mut rx = self.subscribe();
        let snapshot = rx
            .wait_for(pred)
            .await
            .map(|s| (*s).clone())
            .unwrap_or_else(|_| self.snapshot());
        snapshot
    }

    /// Begin downloading. No-op unless paused.
    pub fn handle_start(&self) {
        self.shared.apply(AssetEvent::Start);
    }

    /// Stop dispatching; in-flight transfers finish. Requires `Downloading`.
    pub fn handle_pause(&self) {
        self.shared.apply(AssetEvent::Pause);
    }

    /// Wipe everything but the model config and re-index.
    /// Requires `Downloading`, `Paused` or `Finished`.
    pub fn handle_clear(&self) {
        self.shared.apply(AssetEvent::Clear);
    }

    /// Remove the model directory. Same preconditions as clear.
    pub fn handle_delete(&self) {
        self.shared.apply(AssetEvent::Delete);
    }

    /// Retry manifest discovery after a failure. No-op once indexed.
    pub fn retry_manifest(&self) {
        self.shared.apply(AssetEvent::RetryManifest);
    }
}

async fn coordinate(shared: Weak<Shared>, mut events_rx: mpsc::UnboundedReceiver<AssetEvent>) {
    while let Some(event) = events_rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.apply(event);
    }
}

impl Shared {
    fn lifecycle(&self) -> MutexGuard<'_, AssetLifecycle> {
        self.lifecycle.lock().expect("asset lifecycle mutex poisoned")
    }

    fn model_id(&self) -> &str {
        &self.config.model_id
    }

    fn apply(self: &Arc<Self>, event: AssetEvent) {
        // Record under the lock so observers never see snapshots out of order;
        // the bus is only called once the lock is released.
        let effects = {
            let mut lifecycle = self.lifecycle();
            let before = lifecycle.state();
            let effects = lifecycle.handle(event);
            if before != lifecycle.state() {
                tracing::info!(
                    model_id = self.model_id(),
                    from = %before,
                    to = %lifecycle.state(),
                    "Model state changed"
                );
            }
            self.publish(self.snapshot_of(&lifecycle));
            effects
        };
        self.events.flush();
        self.run(effects);
    }

    fn snapshot_of(&self, lifecycle: &AssetLifecycle) -> AssetSnapshot {
        AssetSnapshot {
            model_id: self.model_id().to_string(),
            state: lifecycle.state(),
            progress: lifecycle.progress(),
            total: lifecycle.total(),
            active: lifecycle.active_count(),
            removed: self.snapshot_tx.borrow().removed,
        }
    }

    fn publish(&self, snapshot: AssetSnapshot) {
        self.events.push(
            event_names::MODEL_STATE,
            &ModelStateEvent {
                model_id: snapshot.model_id.clone(),
                state: snapshot.state.name().to_string(),
                progress: snapshot.progress,
                total: snapshot.total,
            },
        );
        self.snapshot_tx.send_replace(snapshot);
    }

    fn notify(&self, message: String) {
        tracing::warn!(model_id = self.model_id(), "{}", message);
        self.events.push(
            event_names::MODEL_NOTICE,
            &NoticeEvent {
                model_id: Some(self.model_id().to_string()),
                message,
            },
        );
        self.events.flush();
    }

    fn run(self: &Arc<Self>, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::PrepareManifest => {
                    let shared = self.clone();
                    self.runtime.spawn(async move { shared.prepare_manifest().await });
                }
                Effect::Index => {
                    let shared = self.clone();
                    self.runtime.spawn_blocking(move || {
                        let event = shared.index();
                        let _ = shared.events_tx.send(event);
                    });
                }
                Effect::Dispatch(task) => {
                    self.pool.spawn(&self.runtime, task, self.events_tx.clone());
                }
                Effect::ClearFiles { release_session } => {
                    let shared = self.clone();
                    self.runtime.spawn(async move {
                        if release_session {
                            shared.owner.release(shared.model_id()).await;
                        }
                        let dir = shared.model_dir.clone();
                        let cleared = tokio::task::spawn_blocking(move || clear_dir(&dir)).await;
                        match cleared {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => shared.notify(format!("Clear model files failed: {e}")),
                            Err(e) => shared.notify(format!("Clear model files failed: {e}")),
                        }
                        let _ = shared.events_tx.send(AssetEvent::Cleared);
                    });
                }
                Effect::DeleteDirectory { release_session } => {
                    let shared = self.clone();
                    self.runtime.spawn(async move { shared.delete(release_session).await });
                }
                Effect::Notify(message) => self.notify(message),
            }
        }
    }

    async fn prepare_manifest(&self) {
        let path = self.model_dir.join(PARAMS_CONFIG_FILENAME);
        if !path.exists() {
            let url = resolve_url(&self.model_url, PARAMS_CONFIG_FILENAME);
            tracing::info!(model_id = self.model_id(), url = %url, "Fetching params manifest");
            if let Err(e) =
                fetch_to_file(&**self.pool.source(), &url, &path, self.pool.policy()).await
            {
                let _ = self.events_tx.send(AssetEvent::ManifestFailed(e.to_string()));
                return;
            }
        }

        let loaded = tokio::task::spawn_blocking(move || ParamsManifest::load(&path)).await;
        let event = match loaded {
            Ok(Ok(manifest)) => {
                *self.manifest.lock().expect("manifest mutex poisoned") = Some(manifest);
                AssetEvent::ManifestLoaded
            }
            Ok(Err(e)) => AssetEvent::ManifestFailed(e.to_string()),
            Err(e) => AssetEvent::ManifestFailed(e.to_string()),
        };
        let _ = self.events_tx.send(event);
    }

    /// Compare required files against the disk. Blocking.
    fn index(&self) -> AssetEvent {
        let manifest = self
            .manifest
            .lock()
            .expect("manifest mutex poisoned")
            .clone()
            .unwrap_or_default();

        let required = self
            .config
            .tokenizer_files
            .iter()
            .chain(manifest.records.iter().map(|r| &r.data_path));

        let mut missing = Vec::new();
        let mut total = 0;
        for file in required {
            let relative = match relative_path(file) {
                Ok(relative) => relative,
                Err(e) => {
                    self.notify(format!("Skipping model file: {e}"));
                    continue;
                }
            };
            total += 1;
            let destination = self.model_dir.join(relative);
            if !destination.exists() {
                missing.push(DownloadTask::new(
                    resolve_url(&self.model_url, file),
                    destination,
                ));
            }
        }
        tracing::debug!(
            model_id = self.model_id(),
            total,
            missing = missing.len(),
            "Indexed model files"
        );
        AssetEvent::Indexed { missing, total }
    }

    async fn delete(&self, release_session: bool) {
        if release_session {
            self.owner.release(self.model_id()).await;
        }
        let dir = self.model_dir.clone();
        let removed = tokio::task::spawn_blocking(move || match std::fs::remove_dir_all(&dir) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        })
        .await;
        let error = match removed {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(error) = error {
            let _ = self.events_tx.send(AssetEvent::DeleteFailed(error));
            return;
        }

        tracing::info!(model_id = self.model_id(), "Model directory deleted");
        self.owner.removed(self.model_id());
        self.snapshot_tx.send_modify(|s| s.removed = true);
    }
}

/// Remove every entry of `dir` except the top-level model config.
fn clear_dir(dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name() == MODEL_CONFIG_FILENAME {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}
