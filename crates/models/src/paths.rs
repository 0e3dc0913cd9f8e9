use crate::{ModelError, Result, APP_CONFIG_FILENAME, MODEL_CONFIG_FILENAME};
use std::path::{Component, Path, PathBuf};

/// Environment variable overriding the app data directory.
pub const HOME_ENV: &str = "MLCHAT_HOME";

/// Filesystem layout: `{root}/{model_id}/...` plus app-level files.
#[derive(Debug, Clone)]
pub struct AppPaths {
    root: PathBuf,
}

impl AppPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$MLCHAT_HOME`, or the platform data dir.
    pub fn from_env() -> Self {
        if let Some(root) = std::env::var_os(HOME_ENV) {
            return Self::new(root);
        }
        Self::new(
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("mlchat"),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn app_config_file(&self) -> PathBuf {
        self.root.join(APP_CONFIG_FILENAME)
    }

    pub fn model_dir(&self, model_id: &str) -> PathBuf {
        self.root.join(model_id)
    }

    pub fn model_config_file(&self, model_id: &str) -> PathBuf {
        self.model_dir(model_id).join(MODEL_CONFIG_FILENAME)
    }

    /// Staging area for config files whose model id is not yet known.
    pub fn downloads_dir(&self) -> PathBuf {
        self.root.join("downloads")
    }

    pub fn summary_cache_file(&self) -> PathBuf {
        self.root.join("news_summary_cache.json")
    }
}

/// A file named by a config or manifest, checked to stay inside the model
/// directory it is joined onto.
pub fn relative_path(file: &str) -> Result<&Path> {
    let path = Path::new(file);
    let contained = !file.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if contained {
        Ok(path)
    } else {
        Err(ModelError::UnsafePath(file.to_string()))
    }
}

/// Model ids name exactly one directory under the app root.
pub fn check_model_id(model_id: &str) -> Result<()> {
    let mut components = Path::new(model_id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) if name == model_id => Ok(()),
        _ => Err(ModelError::InvalidModelId(model_id.to_string())),
    }
}
