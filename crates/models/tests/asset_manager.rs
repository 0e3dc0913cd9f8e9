//! Integration tests for the asset manager and model registry.
//!
//! Downloads are served from memory; a semaphore gate lets tests hold
//! transfers open to observe the pool mid-flight.

use async_trait::async_trait;
use futures::StreamExt;
use mlchat_events::{event_names, EventBus, InMemoryEventBus};
use mlchat_models::{
    resolve_url, AppPaths, AssetManager, AssetOwner, AssetSnapshot, AssetState, ByteStream,
    DownloadPolicy, DownloadPool, DownloadSource, ModelConfig, ModelError, ModelRecord,
    ModelRegistry, ModelUser, MODEL_CONFIG_FILENAME, PARAMS_CONFIG_FILENAME,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

const BASE_URL: &str = "https://hf.test/mlc-ai/tiny-q4";

struct MemorySource {
    files: Mutex<HashMap<String, Vec<u8>>>,
    gate: Option<Arc<Semaphore>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    opens: Mutex<Vec<String>>,
}

impl MemorySource {
    fn new(files: HashMap<String, Vec<u8>>, gate: Option<Arc<Semaphore>>) -> Arc<Self> {
        Arc::new(Self {
            files: Mutex::new(files),
            gate,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            opens: Mutex::new(Vec::new()),
        })
    }

    fn opens(&self) -> Vec<String> {
        self.opens.lock().unwrap().clone()
    }
}

#[async_trait]
impl DownloadSource for MemorySource {
    async fn open(&self, url: &str) -> mlchat_models::Result<ByteStream> {
        self.opens.lock().unwrap().push(url.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        let body = self.files.lock().unwrap().get(url).cloned();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match body {
            Some(body) => Ok(futures::stream::iter(vec![Ok(body)]).boxed()),
            None => Err(ModelError::DownloadFailed(format!("HTTP 404: {url}"))),
        }
    }
}

#[derive(Default)]
struct RecordingOwner {
    released: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
}

#[async_trait]
impl AssetOwner for RecordingOwner {
    async fn release(&self, model_id: &str) {
        self.released.lock().unwrap().push(model_id.to_string());
    }

    fn removed(&self, model_id: &str) {
        self.removed.lock().unwrap().push(model_id.to_string());
    }
}

fn shard(i: usize) -> String {
    format!("params_shard_{i}.bin")
}

/// Remote files for a model with one tokenizer file and `shards` shards.
fn remote_files(shards: usize) -> HashMap<String, Vec<u8>> {
    let records: Vec<_> = (0..shards)
        .map(|i| serde_json::json!({ "dataPath": shard(i) }))
        .collect();
    let mut files = HashMap::new();
    files.insert(
        resolve_url(BASE_URL, PARAMS_CONFIG_FILENAME),
        serde_json::to_vec(&serde_json::json!({ "records": records })).unwrap(),
    );
    files.insert(resolve_url(BASE_URL, "tokenizer.json"), b"{}".to_vec());
    for i in 0..shards {
        files.insert(resolve_url(BASE_URL, &shard(i)), vec![i as u8; 16]);
    }
    files
}

fn model_config() -> ModelConfig {
    ModelConfig {
        model_lib: "tiny_q4f16_1".to_string(),
        model_id: "tiny-q4".to_string(),
        estimated_vram_bytes: Some(1_000),
        tokenizer_files: vec!["tokenizer.json".to_string()],
        context_window_size: 2048,
        prefill_chunk_size: 512,
    }
}

fn fast_policy(max_attempts: u32) -> DownloadPolicy {
    DownloadPolicy {
        max_concurrent: 3,
        max_attempts,
        initial_backoff: Duration::from_millis(1),
    }
}

struct Fixture {
    _root: tempfile::TempDir,
    model_dir: PathBuf,
    source: Arc<MemorySource>,
    bus: Arc<InMemoryEventBus>,
    owner: Arc<RecordingOwner>,
    manager: AssetManager,
}

fn fixture(files: HashMap<String, Vec<u8>>, gate: Option<Arc<Semaphore>>) -> Fixture {
    fixture_with_policy(files, gate, fast_policy(1))
}

fn fixture_with_policy(
    files: HashMap<String, Vec<u8>>,
    gate: Option<Arc<Semaphore>>,
    policy: DownloadPolicy,
) -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let model_dir = root.path().join("tiny-q4");
    std::fs::create_dir_all(&model_dir).unwrap();
    std::fs::write(model_dir.join(MODEL_CONFIG_FILENAME), "{}").unwrap();

    let source = MemorySource::new(files, gate);
    let bus = Arc::new(InMemoryEventBus::new());
    let owner = Arc::new(RecordingOwner::default());
    let manager = AssetManager::spawn(
        model_config(),
        BASE_URL,
        model_dir.clone(),
        DownloadPool::new(source.clone(), policy),
        bus.clone(),
        owner.clone(),
    );
    Fixture {
        _root: root,
        model_dir,
        source,
        bus,
        owner,
        manager,
    }
}

async fn wait_state(manager: &AssetManager, state: AssetState) -> AssetSnapshot {
    tokio::time::timeout(
        Duration::from_secs(5),
        manager.wait_for(|s| s.state == state),
    )
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {state}, at {:?}", manager.snapshot()))
}

async fn wait_in_flight(source: &MemorySource, n: usize) {
    for _ in 0..500 {
        if source.in_flight.load(Ordering::SeqCst) == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("never reached {n} in-flight transfers");
}

/// Wait for a notice to be published and return its message.
async fn wait_notice(bus: &InMemoryEventBus) -> String {
    for _ in 0..500 {
        if let Some(notice) = bus.last_for(event_names::MODEL_NOTICE) {
            return notice["message"].as_str().unwrap_or_default().to_string();
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("no notice published");
}

fn file_exists(dir: &Path, name: &str) -> bool {
    dir.join(name).exists()
}

// =============================================================================
// Discovery and indexing
// =============================================================================

mod indexing {
    use super::*;

    #[tokio::test]
    async fn test_missing_manifest_is_fetched_then_indexed() {
        let f = fixture(remote_files(2), None);

        let snapshot = wait_state(&f.manager, AssetState::Paused).await;

        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.progress, 0);
        assert!(file_exists(&f.model_dir, PARAMS_CONFIG_FILENAME));
        assert_eq!(
            f.source.opens(),
            vec![resolve_url(BASE_URL, PARAMS_CONFIG_FILENAME)]
        );
    }

    #[tokio::test]
    async fn test_present_files_count_as_progress() {
        let root = tempfile::tempdir().unwrap();
        let model_dir = root.path().join("tiny-q4");
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::write(
            model_dir.join(PARAMS_CONFIG_FILENAME),
            r#"{"records": [{"dataPath": "params_shard_0.bin"}]}"#,
        )
        .unwrap();
        std::fs::write(model_dir.join("params_shard_0.bin"), b"0").unwrap();
        std::fs::write(model_dir.join("tokenizer.json"), b"{}").unwrap();

        let source = MemorySource::new(HashMap::new(), None);
        let manager = AssetManager::spawn(
            model_config(),
            BASE_URL,
            model_dir,
            DownloadPool::new(source.clone(), fast_policy(1)),
            Arc::new(InMemoryEventBus::new()),
            Arc::new(RecordingOwner::default()),
        );

        let snapshot = wait_state(&manager, AssetState::Finished).await;
        assert_eq!((snapshot.progress, snapshot.total), (2, 2));
        assert!(source.opens().is_empty(), "nothing should be fetched");
    }

    #[tokio::test]
    async fn test_manifest_failure_stays_initializing_until_retry() {
        let mut files = remote_files(1);
        let manifest_url = resolve_url(BASE_URL, PARAMS_CONFIG_FILENAME);
        let manifest = files.remove(&manifest_url).unwrap();
        let f = fixture(files, None);

        for _ in 0..500 {
            if !f.bus.events_for(event_names::MODEL_NOTICE).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(f.manager.state(), AssetState::Initializing);
        let notice = f.bus.last_for(event_names::MODEL_NOTICE).unwrap();
        assert!(notice["message"].as_str().unwrap().contains("manifest"));

        f.source.files.lock().unwrap().insert(manifest_url, manifest);
        f.manager.retry_manifest();
        wait_state(&f.manager, AssetState::Paused).await;
    }

    #[tokio::test]
    async fn test_manifest_entry_outside_model_dir_is_refused() {
        let mut files = remote_files(0);
        files.insert(
            resolve_url(BASE_URL, PARAMS_CONFIG_FILENAME),
            br#"{"records": [{"dataPath": "../escaped.bin"}]}"#.to_vec(),
        );
        files.insert(resolve_url(BASE_URL, "../escaped.bin"), b"x".to_vec());
        let f = fixture(files, None);

        let message = wait_notice(&f.bus).await;
        assert!(message.contains("escaped.bin"), "{message}");
        assert_eq!(f.manager.state(), AssetState::Initializing);

        f.manager.handle_start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!f.model_dir.parent().unwrap().join("escaped.bin").exists());
        assert_eq!(
            f.source.opens(),
            vec![resolve_url(BASE_URL, PARAMS_CONFIG_FILENAME)]
        );
    }
}

// =============================================================================
// Downloading
// =============================================================================

mod downloading {
    use super::*;

    /// Reads the manager back from inside every state event.
    #[derive(Default)]
    struct ReadBackBus {
        manager: Mutex<Option<AssetManager>>,
        seen: Mutex<Vec<AssetState>>,
    }

    impl EventBus for ReadBackBus {
        fn emit(&self, topic: &str, _payload: serde_json::Value) {
            if topic != event_names::MODEL_STATE {
                return;
            }
            let manager = self.manager.lock().unwrap().clone();
            if let Some(manager) = manager {
                self.seen.lock().unwrap().push(manager.state());
            }
        }
    }

    #[tokio::test]
    async fn test_state_handlers_may_read_the_manager() {
        let root = tempfile::tempdir().unwrap();
        let model_dir = root.path().join("tiny-q4");
        std::fs::create_dir_all(&model_dir).unwrap();
        let bus = Arc::new(ReadBackBus::default());
        let manager = AssetManager::spawn(
            model_config(),
            BASE_URL,
            model_dir,
            DownloadPool::new(MemorySource::new(remote_files(2), None), fast_policy(1)),
            bus.clone(),
            Arc::new(RecordingOwner::default()),
        );
        *bus.manager.lock().unwrap() = Some(manager.clone());

        wait_state(&manager, AssetState::Paused).await;
        manager.handle_start();
        wait_state(&manager, AssetState::Finished).await;

        assert!(bus.seen.lock().unwrap().contains(&AssetState::Finished));
        bus.manager.lock().unwrap().take();
    }

    #[tokio::test]
    async fn test_downloads_everything_without_exceeding_bound() {
        let gate = Arc::new(Semaphore::new(0));
        let f = fixture(remote_files(7), Some(gate.clone()));
        gate.add_permits(1); // manifest
        wait_state(&f.manager, AssetState::Paused).await;

        f.manager.handle_start();
        assert_eq!(f.manager.state(), AssetState::Downloading);
        wait_in_flight(&f.source, 3).await;

        for _ in 0..8 {
            gate.add_permits(1);
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert!(f.manager.snapshot().active <= 3);
        }

        let snapshot = wait_state(&f.manager, AssetState::Finished).await;
        assert_eq!(snapshot.progress, 8);
        assert_eq!(f.source.peak.load(Ordering::SeqCst), 3);
        for i in 0..7 {
            assert!(file_exists(&f.model_dir, &shard(i)));
            assert!(!file_exists(&f.model_dir, &format!("{}.part", shard(i))));
        }
        assert!(file_exists(&f.model_dir, "tokenizer.json"));
    }

    #[tokio::test]
    async fn test_pause_lets_active_tasks_finish_then_resume() {
        let gate = Arc::new(Semaphore::new(1));
        let f = fixture(remote_files(5), Some(gate.clone()));
        wait_state(&f.manager, AssetState::Paused).await;

        f.manager.handle_start();
        wait_in_flight(&f.source, 3).await;
        f.manager.handle_pause();
        assert_eq!(f.manager.state(), AssetState::Pausing);

        gate.add_permits(3);
        let snapshot = wait_state(&f.manager, AssetState::Paused).await;
        assert_eq!(snapshot.progress, 3);
        assert_eq!(f.source.opens().len(), 4, "no dispatch while pausing");

        gate.add_permits(3);
        f.manager.handle_start();
        let snapshot = wait_state(&f.manager, AssetState::Finished).await;
        assert_eq!(snapshot.progress, 6);
    }

    #[tokio::test]
    async fn test_failed_transfer_halts_and_notifies() {
        let mut files = remote_files(2);
        files.remove(&resolve_url(BASE_URL, &shard(1)));
        let f = fixture_with_policy(files, None, fast_policy(2));
        wait_state(&f.manager, AssetState::Paused).await;

        f.manager.handle_start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let snapshot = wait_state(&f.manager, AssetState::Paused).await;

        assert_eq!(snapshot.total - snapshot.progress, 1);
        assert!(!file_exists(&f.model_dir, &shard(1)));
        let notices = f.bus.events_for(event_names::MODEL_NOTICE);
        assert!(notices
            .iter()
            .any(|e| e.payload["message"].as_str().unwrap().contains("HTTP 404")));
        let retries = f
            .source
            .opens()
            .iter()
            .filter(|u| u.ends_with(&shard(1)))
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    #[should_panic(expected = "pause is not allowed while paused")]
    async fn test_pause_while_paused_is_fatal() {
        let f = fixture(remote_files(1), None);
        wait_state(&f.manager, AssetState::Paused).await;
        f.manager.handle_pause();
    }
}

// =============================================================================
// Clearing and deleting
// =============================================================================

mod removal {
    use super::*;

    #[tokio::test]
    async fn test_delete_while_downloading_drains_before_removing_directory() {
        let gate = Arc::new(Semaphore::new(1));
        let f = fixture(remote_files(6), Some(gate.clone()));
        wait_state(&f.manager, AssetState::Paused).await;

        f.manager.handle_start();
        wait_in_flight(&f.source, 3).await;
        f.manager.handle_delete();
        assert_eq!(f.manager.state(), AssetState::Deleting);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(f.model_dir.exists(), "directory removed while tasks in flight");

        gate.add_permits(3);
        let snapshot = tokio::time::timeout(
            Duration::from_secs(5),
            f.manager.wait_for(|s| s.removed),
        )
        .await
        .unwrap();

        assert_eq!(snapshot.state, AssetState::Deleting);
        assert!(!f.model_dir.exists());
        assert_eq!(f.source.opens().len(), 4, "no dispatch after delete");
        assert_eq!(*f.owner.removed.lock().unwrap(), vec!["tiny-q4"]);
        assert!(f.owner.released.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_finished_model_releases_session_and_reindexes() {
        let f = fixture(remote_files(2), None);
        wait_state(&f.manager, AssetState::Paused).await;
        f.manager.handle_start();
        wait_state(&f.manager, AssetState::Finished).await;

        f.manager.handle_clear();
        let snapshot = wait_state(&f.manager, AssetState::Paused).await;

        assert_eq!(*f.owner.released.lock().unwrap(), vec!["tiny-q4"]);
        assert_eq!((snapshot.progress, snapshot.total), (0, 3));
        assert!(file_exists(&f.model_dir, MODEL_CONFIG_FILENAME));
        assert!(!file_exists(&f.model_dir, PARAMS_CONFIG_FILENAME));
        assert!(!file_exists(&f.model_dir, &shard(0)));
    }

    #[tokio::test]
    async fn test_failed_delete_settles_and_can_be_retried() {
        let f = fixture(remote_files(1), None);
        wait_state(&f.manager, AssetState::Paused).await;

        // A plain file where the directory should be cannot be removed as one.
        std::fs::remove_dir_all(&f.model_dir).unwrap();
        std::fs::write(&f.model_dir, b"not a directory").unwrap();
        f.manager.handle_delete();

        let snapshot = wait_state(&f.manager, AssetState::Paused).await;
        assert!(!snapshot.removed);
        assert_eq!((snapshot.progress, snapshot.total), (0, 2));
        assert!(f.owner.removed.lock().unwrap().is_empty());
        let message = wait_notice(&f.bus).await;
        assert!(message.starts_with("Delete model failed"), "{message}");

        std::fs::remove_file(&f.model_dir).unwrap();
        std::fs::create_dir(&f.model_dir).unwrap();
        f.manager.handle_delete();
        tokio::time::timeout(Duration::from_secs(5), f.manager.wait_for(|s| s.removed))
            .await
            .unwrap();
        assert!(!f.model_dir.exists());
        assert_eq!(*f.owner.removed.lock().unwrap(), vec!["tiny-q4"]);
    }

    #[tokio::test]
    async fn test_delete_paused_model_does_not_release_session() {
        let f = fixture(remote_files(1), None);
        wait_state(&f.manager, AssetState::Paused).await;

        f.manager.handle_delete();
        tokio::time::timeout(Duration::from_secs(5), f.manager.wait_for(|s| s.removed))
            .await
            .unwrap();

        assert!(f.owner.released.lock().unwrap().is_empty());
        assert!(!f.model_dir.exists());
    }
}

// =============================================================================
// Registry
// =============================================================================

mod registry {
    use super::*;

    const BUILTIN: &str = r#"{
        "model_list": [
            {"model_url": "https://hf.test/mlc-ai/tiny-q4", "model_id": "tiny-q4",
             "model_lib": "tiny_q4f16_1", "estimated_vram_bytes": 1000}
        ]
    }"#;

    struct FakeSession {
        model: Mutex<Option<String>>,
        released: AtomicBool,
    }

    #[async_trait]
    impl ModelUser for FakeSession {
        fn current_model(&self) -> Option<String> {
            self.model.lock().unwrap().clone()
        }

        async fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
            *self.model.lock().unwrap() = None;
        }
    }

    fn registry_files() -> HashMap<String, Vec<u8>> {
        let mut files = remote_files(1);
        files.insert(
            resolve_url(BASE_URL, MODEL_CONFIG_FILENAME),
            br#"{"model_id": "remote", "tokenizer_files": ["tokenizer.json"],
                 "context_window_size": 2048, "prefill_chunk_size": 512}"#
                .to_vec(),
        );
        files.insert(
            resolve_url("https://hf.test/other", MODEL_CONFIG_FILENAME),
            br#"{"tokenizer_files": []}"#.to_vec(),
        );
        files
    }

    async fn load(root: &Path, bus: Arc<InMemoryEventBus>) -> ModelRegistry {
        ModelRegistry::load(
            AppPaths::new(root),
            BUILTIN,
            MemorySource::new(registry_files(), None),
            fast_policy(1),
            bus,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_load_fetches_missing_config_with_record_identity() {
        let root = tempfile::tempdir().unwrap();
        let registry = load(root.path(), Arc::new(InMemoryEventBus::new())).await;

        let manager = registry.get("tiny-q4").expect("model registered");
        assert_eq!(manager.config().model_lib, "tiny_q4f16_1");
        assert_eq!(manager.config().estimated_vram_bytes, Some(1000));
        assert!(root
            .path()
            .join("tiny-q4")
            .join(MODEL_CONFIG_FILENAME)
            .exists());
        // Builtin models are not written back.
        assert!(!AppPaths::new(root.path()).app_config_file().exists());
    }

    #[tokio::test]
    async fn test_add_model_rejects_duplicate_and_unsupported_lib() {
        let root = tempfile::tempdir().unwrap();
        let registry = load(root.path(), Arc::new(InMemoryEventBus::new())).await;

        let duplicate = registry
            .add_model(ModelRecord {
                model_url: BASE_URL.to_string(),
                model_id: "tiny-q4".to_string(),
                estimated_vram_bytes: None,
                model_lib: "tiny_q4f16_1".to_string(),
            })
            .await;
        assert!(matches!(duplicate, Err(ModelError::DuplicateModel(id)) if id == "tiny-q4"));

        let unsupported = registry
            .add_model(ModelRecord {
                model_url: "https://hf.test/other".to_string(),
                model_id: "other".to_string(),
                estimated_vram_bytes: None,
                model_lib: "unknown_lib".to_string(),
            })
            .await;
        assert!(matches!(unsupported, Err(ModelError::UnsupportedLib(_))));
        assert_eq!(registry.models().len(), 1);
        assert!(!root.path().join("other").exists());
    }

    #[tokio::test]
    async fn test_add_model_rejects_id_outside_app_root() {
        let root = tempfile::tempdir().unwrap();
        let registry = load(root.path(), Arc::new(InMemoryEventBus::new())).await;

        for model_id in ["..", "nested/id", ""] {
            let result = registry
                .add_model(ModelRecord {
                    model_url: "https://hf.test/other".to_string(),
                    model_id: model_id.to_string(),
                    estimated_vram_bytes: None,
                    model_lib: "tiny_q4f16_1".to_string(),
                })
                .await;
            assert!(
                matches!(result, Err(ModelError::InvalidModelId(ref id)) if id == model_id),
                "{model_id:?}: {result:?}"
            );
        }
        assert_eq!(registry.models().len(), 1);
        assert!(!AppPaths::new(root.path()).app_config_file().exists());
    }

    #[tokio::test]
    async fn test_add_model_persists_user_record() {
        let root = tempfile::tempdir().unwrap();
        let registry = load(root.path(), Arc::new(InMemoryEventBus::new())).await;

        registry
            .add_model(ModelRecord {
                model_url: "https://hf.test/other".to_string(),
                model_id: "tiny-copy".to_string(),
                estimated_vram_bytes: None,
                model_lib: "tiny_q4f16_1".to_string(),
            })
            .await
            .unwrap();

        let saved = std::fs::read_to_string(AppPaths::new(root.path()).app_config_file()).unwrap();
        assert!(saved.contains("tiny-copy"));
        assert!(registry.get("tiny-copy").is_some());
    }

    #[tokio::test]
    async fn test_delete_finished_model_releases_session_and_forgets_it() {
        let root = tempfile::tempdir().unwrap();
        let bus = Arc::new(InMemoryEventBus::new());
        let registry = load(root.path(), bus.clone()).await;
        let session = Arc::new(FakeSession {
            model: Mutex::new(Some("tiny-q4".to_string())),
            released: AtomicBool::new(false),
        });
        registry.set_model_user(session.clone());

        let manager = registry.get("tiny-q4").unwrap();
        wait_state(&manager, AssetState::Paused).await;
        manager.handle_start();
        wait_state(&manager, AssetState::Finished).await;

        manager.handle_delete();
        tokio::time::timeout(Duration::from_secs(5), manager.wait_for(|s| s.removed))
            .await
            .unwrap();

        assert!(session.released.load(Ordering::SeqCst));
        assert!(registry.get("tiny-q4").is_none());
        assert!(registry.app_config().model_list.is_empty());
        assert_eq!(bus.events_for(event_names::MODEL_REMOVED).len(), 1);
        let notice = bus.last_for(event_names::MODEL_NOTICE).unwrap();
        assert_eq!(notice["message"], "Model: tiny-q4 has been deleted");
    }
}
