mod config;
mod download;
mod lifecycle;
mod manager;
mod paths;
mod registry;
mod task;

pub use config::{AppConfig, ModelConfig, ModelRecord, ParamsManifest, ParamsRecord};
pub use download::{
    fetch_to_file, part_path, ByteStream, DownloadPolicy, DownloadPool, DownloadSource, HttpSource,
};
pub use lifecycle::{AssetEvent, AssetLifecycle, AssetState, Effect};
pub use manager::{AssetManager, AssetOwner, AssetSnapshot, NoopOwner};
pub use paths::{check_model_id, relative_path, AppPaths};
pub use registry::{ModelRegistry, ModelUser};
pub use task::DownloadTask;

/// App-level model list, shipped with the binary and copied on first change.
pub const APP_CONFIG_FILENAME: &str = "mlc-app-config.json";
/// Per-model config, the only file that survives a clear.
pub const MODEL_CONFIG_FILENAME: &str = "mlc-chat-config.json";
/// Params manifest listing the weight shards.
pub const PARAMS_CONFIG_FILENAME: &str = "ndarray-cache.json";
/// Appended to a model URL to address files on the default branch.
pub const MODEL_URL_SUFFIX: &str = "resolve/main/";

/// Default bound on in-flight downloads per model.
pub const MAX_CONCURRENT_DOWNLOADS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("invalid model id: {0:?}")]
    InvalidModelId(String),
    #[error("path leaves the model directory: {0:?}")]
    UnsafePath(String),
    #[error("{0} has been used, please consider another local ID")]
    DuplicateModel(String),
    #[error("model lib {0} is not supported")]
    UnsupportedLib(String),
    #[error("download failed: {0}")]
    DownloadFailed(String),
    #[error("invalid config: {0}")]
    InvalidConfig(#[from] serde_json::Error),
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;

/// Join a model base URL and a relative file name under `resolve/main/`.
pub fn resolve_url(model_url: &str, file: &str) -> String {
    format!("{}{MODEL_URL_SUFFIX}{file}", with_trailing_slash(model_url))
}

pub(crate) fn with_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}
