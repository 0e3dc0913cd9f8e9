//! On-disk config formats: the app model list, per-model config and the
//! params manifest.

use crate::paths::relative_path;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The app-level list of known models and the engine libraries they need.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Rebuilt from `model_list` on load; only these libs can be added.
    #[serde(default)]
    pub model_libs: Vec<String>,
    #[serde(default)]
    pub model_list: Vec<ModelRecord>,
}

/// One entry of the app model list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub model_url: String,
    pub model_id: String,
    #[serde(default)]
    pub estimated_vram_bytes: Option<u64>,
    pub model_lib: String,
}

/// Per-model config (`mlc-chat-config.json`).
///
/// `model_id`, `model_lib` and `estimated_vram_bytes` always come from the
/// app record, never from the downloaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub model_lib: String,
    #[serde(default)]
    pub model_id: String,
    #[serde(default)]
    pub estimated_vram_bytes: Option<u64>,
    #[serde(default)]
    pub tokenizer_files: Vec<String>,
    #[serde(default)]
    pub context_window_size: i64,
    #[serde(default)]
    pub prefill_chunk_size: i64,
}

/// One weight shard listed by the params manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamsRecord {
    #[serde(rename = "dataPath")]
    pub data_path: String,
}

/// Params manifest (`ndarray-cache.json`). Extra fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamsManifest {
    #[serde(rename = "records", default)]
    pub records: Vec<ParamsRecord>,
}

impl AppConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let mut config: AppConfig = serde_json::from_str(json)?;
        config.model_libs = config
            .model_list
            .iter()
            .map(|record| record.model_lib.clone())
            .collect();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn is_lib_allowed(&self, model_lib: &str) -> bool {
        self.model_libs.iter().any(|lib| lib == model_lib)
    }
}

impl ModelConfig {
    /// Read a config file and stamp it with the identity from `record`.
    pub fn load(path: &Path, record: &ModelRecord) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let mut config: ModelConfig = serde_json::from_str(&json)?;
        config.model_id = record.model_id.clone();
        config.model_lib = record.model_lib.clone();
        config.estimated_vram_bytes = record.estimated_vram_bytes;
        for file in &config.tokenizer_files {
            relative_path(file)?;
        }
        Ok(config)
    }
}

impl ParamsManifest {
    /// Read a manifest, rejecting shard paths that leave the model directory.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let manifest: ParamsManifest = serde_json::from_str(&json)?;
        for record in &manifest.records {
            relative_path(&record.data_path)?;
        }
        Ok(manifest)
    }
}
