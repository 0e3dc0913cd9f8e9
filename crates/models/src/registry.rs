//! The set of known models: app config loading, config discovery for new
//! models, duplicate rejection and removal bookkeeping.

use crate::config::{AppConfig, ModelConfig, ModelRecord};
use crate::download::{fetch_to_file, DownloadPolicy, DownloadPool, DownloadSource};
use crate::manager::{AssetManager, AssetOwner};
use crate::paths::{check_model_id, AppPaths};
use crate::{resolve_url, ModelError, Result, MODEL_CONFIG_FILENAME};
use async_trait::async_trait;
use mlchat_events::{emit_event, event_names, EventBusRef, ModelRemovedEvent, NoticeEvent};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Something that can hold a model open, typically the chat session.
#[async_trait]
pub trait ModelUser: Send + Sync {
    /// Id of the model currently loaded, if any.
    fn current_model(&self) -> Option<String>;
    /// Drop the current model; resolves once the engine let go of its files.
    async fn release(&self);
}

#[derive(Clone)]
pub struct ModelRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    paths: AppPaths,
    source: Arc<dyn DownloadSource>,
    policy: DownloadPolicy,
    bus: EventBusRef,
    state: Mutex<RegistryState>,
    user: Mutex<Option<Arc<dyn ModelUser>>>,
}

struct RegistryState {
    app_config: AppConfig,
    models: Vec<AssetManager>,
}

/// Handed to each manager; weak so managers don't keep the registry alive.
struct RegistryOwner(Weak<RegistryInner>);

#[async_trait]
impl AssetOwner for RegistryOwner {
    async fn release(&self, model_id: &str) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        let user = inner.user.lock().expect("model user mutex poisoned").clone();
        if let Some(user) = user {
            if user.current_model().as_deref() == Some(model_id) {
                tracing::info!(model_id, "Releasing model from its session");
                user.release().await;
            }
        }
    }

    fn removed(&self, model_id: &str) {
        if let Some(inner) = self.0.upgrade() {
            inner.forget(model_id);
        }
    }
}

impl ModelRegistry {
    /// Load the app config (the user copy if present, else `builtin_json`)
    /// and register every listed model, fetching configs that are missing.
    ///
    /// Per-model failures become notices; only an unreadable app config is
    /// an error.
    pub async fn load(
        paths: AppPaths,
        builtin_json: &str,
        source: Arc<dyn DownloadSource>,
        policy: DownloadPolicy,
        bus: EventBusRef,
    ) -> Result<Self> {
        let app_config_file = paths.app_config_file();
        let app_config = if app_config_file.exists() {
            AppConfig::from_json(&std::fs::read_to_string(&app_config_file)?)?
        } else {
            AppConfig::from_json(builtin_json)?
        };
        let records = app_config.model_list.clone();

        let registry = Self {
            inner: Arc::new(RegistryInner {
                paths,
                source,
                policy,
                bus,
                state: Mutex::new(RegistryState {
                    app_config,
                    models: Vec::new(),
                }),
                user: Mutex::new(None),
            }),
        };

        for record in records {
            if let Err(e) = registry.load_record(&record).await {
                registry.inner.notice(Some(&record.model_id), format!("Add model failed: {e}"));
            }
        }

        Ok(registry)
    }

    pub fn paths(&self) -> &AppPaths {
        &self.inner.paths
    }

    /// Register the session (or anything else) that may hold a model.
    pub fn set_model_user(&self, user: Arc<dyn ModelUser>) {
        *self.inner.user.lock().expect("model user mutex poisoned") = Some(user);
    }

    pub fn models(&self) -> Vec<AssetManager> {
        self.inner.state().models.clone()
    }

    pub fn get(&self, model_id: &str) -> Option<AssetManager> {
        self.inner
            .state()
            .models
            .iter()
            .find(|m| m.model_id() == model_id)
            .cloned()
    }

    pub fn app_config(&self) -> AppConfig {
        self.inner.state().app_config.clone()
    }

    /// Add a user model: fetch its config, validate and persist the record.
    pub async fn add_model(&self, record: ModelRecord) -> Result<()> {
        self.download_model_config(&record, false).await
    }

    async fn load_record(&self, record: &ModelRecord) -> Result<()> {
        check_model_id(&record.model_id)?;
        let config_file = self.inner.paths.model_config_file(&record.model_id);
        if config_file.exists() {
            let config = ModelConfig::load(&config_file, record)?;
            self.register(config, &record.model_url, true)
        } else {
            self.download_model_config(record, true).await
        }
    }

    async fn download_model_config(&self, record: &ModelRecord, builtin: bool) -> Result<()> {
        check_model_id(&record.model_id)?;
        let url = resolve_url(&record.model_url, MODEL_CONFIG_FILENAME);
        let staging = self
            .inner
            .paths
            .downloads_dir()
            .join(uuid::Uuid::new_v4().to_string());

        tracing::info!(model_id = %record.model_id, url = %url, "Fetching model config");
        fetch_to_file(&*self.inner.source, &url, &staging, &self.inner.policy).await?;

        let result = self.install_config(record, &staging, builtin);
        let _ = std::fs::remove_file(&staging);
        result
    }

    fn install_config(
        &self,
        record: &ModelRecord,
        staging: &std::path::Path,
        builtin: bool,
    ) -> Result<()> {
        let config = ModelConfig::load(staging, record)?;
        {
            let state = self.inner.state();
            if state.contains(&config.model_id) {
                return Err(ModelError::DuplicateModel(config.model_id));
            }
            if !state.app_config.is_lib_allowed(&config.model_lib) {
                return Err(ModelError::UnsupportedLib(config.model_lib));
            }
        }

        let config_file = self.inner.paths.model_config_file(&config.model_id);
        if let Some(parent) = config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(staging, &config_file)?;
        self.register(config, &record.model_url, builtin)
    }

    fn register(&self, config: ModelConfig, model_url: &str, builtin: bool) -> Result<()> {
        check_model_id(&config.model_id)?;
        let mut state = self.inner.state();
        if state.contains(&config.model_id) {
            return Err(ModelError::DuplicateModel(config.model_id));
        }

        let record = ModelRecord {
            model_url: model_url.to_string(),
            model_id: config.model_id.clone(),
            estimated_vram_bytes: config.estimated_vram_bytes,
            model_lib: config.model_lib.clone(),
        };
        let model_dir = self.inner.paths.model_dir(&config.model_id);
        let manager = AssetManager::spawn(
            config,
            model_url,
            model_dir,
            DownloadPool::new(self.inner.source.clone(), self.inner.policy.clone()),
            self.inner.bus.clone(),
            Arc::new(RegistryOwner(Arc::downgrade(&self.inner))),
        );
        tracing::info!(model_id = manager.model_id(), builtin, "Model registered");
        state.models.push(manager);

        if !builtin {
            state.app_config.model_list.push(record);
            state.app_config.save(&self.inner.paths.app_config_file())?;
        }
        Ok(())
    }
}

impl RegistryInner {
    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().expect("registry mutex poisoned")
    }

    fn forget(&self, model_id: &str) {
        {
            let mut state = self.state();
            state.models.retain(|m| m.model_id() != model_id);
            state.app_config.model_list.retain(|r| r.model_id != model_id);
            if let Err(e) = state.app_config.save(&self.paths.app_config_file()) {
                tracing::error!(model_id, error = %e, "Failed to persist app config");
            }
        }
        emit_event(
            &*self.bus,
            event_names::MODEL_REMOVED,
            &ModelRemovedEvent {
                model_id: model_id.to_string(),
            },
        );
        self.notice(Some(model_id), format!("Model: {model_id} has been deleted"));
    }

    fn notice(&self, model_id: Option<&str>, message: String) {
        tracing::info!(model_id, "{}", message);
        emit_event(
            &*self.bus,
            event_names::MODEL_NOTICE,
            &NoticeEvent {
                model_id: model_id.map(str::to_string),
                message,
            },
        );
    }
}

impl RegistryState {
    fn contains(&self, model_id: &str) -> bool {
        self.models.iter().any(|m| m.model_id() == model_id)
    }
}
