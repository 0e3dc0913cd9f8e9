mod console;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use console::ConsoleBus;
use mlchat_models::{
    AppPaths, AssetManager, AssetSnapshot, AssetState, DownloadPolicy, HttpSource, ModelRecord,
    ModelRegistry, MAX_CONCURRENT_DOWNLOADS,
};
use mlchat_storage::{CacheStore, JsonCacheStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Model list used until the user adds or deletes a model.
const BUILTIN_APP_CONFIG: &str = include_str!("../assets/mlc-app-config.json");

#[derive(Parser)]
#[command(name = "mlchat", version)]
#[command(about = "Download and manage on-device chat models")]
struct Cli {
    /// App data directory (defaults to the platform data dir)
    #[arg(long, env = "MLCHAT_HOME", global = true)]
    root: Option<PathBuf>,

    /// Parallel transfers per model
    #[arg(long, default_value_t = MAX_CONCURRENT_DOWNLOADS, global = true)]
    max_downloads: usize,

    /// Attempts per file before a download is halted
    #[arg(long, default_value_t = 3, global = true)]
    attempts: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(flatten)]
    Model(ModelCommand),

    /// Manage the summary cache
    #[command(subcommand)]
    Cache(CacheCommand),
}

#[derive(Subcommand)]
enum ModelCommand {
    /// List models with their download state
    Models,
    /// Download every missing file of a model
    Download { model_id: String },
    /// Remove downloaded files, keeping the model config
    Clear { model_id: String },
    /// Remove a model and forget it
    Delete { model_id: String },
    /// Register a model from its repository URL
    Add {
        model_url: String,
        #[arg(long)]
        model_id: String,
        #[arg(long)]
        model_lib: String,
        #[arg(long)]
        estimated_vram_bytes: Option<u64>,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Drop every cached summary
    Clear,
    /// Drop the summary cached for one article URL
    Remove { url: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,mlchat=debug")),
        )
        .init();

    let cli = Cli::parse();
    let paths = cli
        .root
        .map(AppPaths::new)
        .unwrap_or_else(AppPaths::from_env);
    tracing::debug!(root = ?paths.root(), "Using app directory");

    match cli.command {
        Command::Cache(action) => run_cache(&paths, action),
        Command::Model(command) => {
            let policy = DownloadPolicy {
                max_concurrent: cli.max_downloads.max(1),
                max_attempts: cli.attempts.max(1),
                ..DownloadPolicy::default()
            };
            let bus = Arc::new(ConsoleBus::new());
            let registry = ModelRegistry::load(
                paths,
                BUILTIN_APP_CONFIG,
                Arc::new(HttpSource::new()?),
                policy,
                bus.clone(),
            )
            .await
            .context("failed to load app config")?;
            run_model(&registry, &bus, command).await
        }
    }
}

async fn run_model(registry: &ModelRegistry, bus: &ConsoleBus, command: ModelCommand) -> Result<()> {
    match command {
        ModelCommand::Models => list_models(registry, bus).await,
        ModelCommand::Download { model_id } => download(registry, bus, &model_id).await,
        ModelCommand::Clear { model_id } => clear(registry, bus, &model_id).await,
        ModelCommand::Delete { model_id } => delete(registry, bus, &model_id).await,
        ModelCommand::Add {
            model_url,
            model_id,
            model_lib,
            estimated_vram_bytes,
        } => {
            registry
                .add_model(ModelRecord {
                    model_url,
                    model_id: model_id.clone(),
                    estimated_vram_bytes,
                    model_lib,
                })
                .await
                .with_context(|| format!("failed to add {model_id}"))?;
            println!("Added {model_id}");
            Ok(())
        }
    }
}

fn find(registry: &ModelRegistry, model_id: &str) -> Result<AssetManager> {
    registry
        .get(model_id)
        .with_context(|| format!("unknown model {model_id}, see `mlchat models`"))
}

fn settled(snapshot: &AssetSnapshot) -> bool {
    !matches!(
        snapshot.state,
        AssetState::Initializing | AssetState::Indexing | AssetState::Clearing
    )
}

/// Wait for `pred`, giving up once a new notice about the model shows up
/// and `pred` still does not hold.
async fn wait_until(
    manager: &AssetManager,
    bus: &ConsoleBus,
    pred: impl Fn(&AssetSnapshot) -> bool,
) -> Result<AssetSnapshot> {
    let baseline = bus.notice_count();
    loop {
        tokio::select! {
            snapshot = manager.wait_for(&pred) => return Ok(snapshot),
            _ = tokio::time::sleep(Duration::from_millis(250)) => {
                let snapshot = manager.snapshot();
                if pred(&snapshot) {
                    return Ok(snapshot);
                }
                if bus.notice_count() > baseline {
                    if let Some(notice) = bus.last_notice(manager.model_id()) {
                        bail!("{}: {notice}", manager.model_id());
                    }
                }
            }
        }
    }
}

async fn list_models(registry: &ModelRegistry, bus: &ConsoleBus) -> Result<()> {
    let managers = registry.models();
    let snapshots =
        futures::future::join_all(managers.iter().map(|m| wait_until(m, bus, settled))).await;

    for (manager, snapshot) in managers.iter().zip(snapshots) {
        match snapshot {
            Ok(s) => println!(
                "{:<45} {:<12} {}/{}",
                manager.model_id(),
                s.state,
                s.progress,
                s.total
            ),
            Err(e) => println!("{:<45} {:<12} {e}", manager.model_id(), "unavailable"),
        }
    }
    Ok(())
}

async fn download(registry: &ModelRegistry, bus: &ConsoleBus, model_id: &str) -> Result<()> {
    let manager = find(registry, model_id)?;
    let snapshot = wait_until(&manager, bus, settled).await?;
    if snapshot.state == AssetState::Finished {
        println!("{model_id} is already downloaded");
        return Ok(());
    }

    manager.handle_start();
    let mut rx = manager.subscribe();
    let mut reported = None;
    loop {
        let s = rx.borrow_and_update().clone();
        if reported != Some(s.progress) {
            tracing::info!(model_id, progress = s.progress, total = s.total, "Downloading");
            reported = Some(s.progress);
        }
        match s.state {
            AssetState::Finished => {
                println!("{model_id}: {}/{} files", s.progress, s.total);
                return Ok(());
            }
            AssetState::Paused => bail!(
                "download of {model_id} halted: {}",
                bus.last_notice(model_id).unwrap_or_default()
            ),
            _ => {}
        }
        rx.changed().await.context("model manager stopped")?;
    }
}

async fn clear(registry: &ModelRegistry, bus: &ConsoleBus, model_id: &str) -> Result<()> {
    let manager = find(registry, model_id)?;
    wait_until(&manager, bus, settled).await?;

    manager.handle_clear();
    let s = wait_until(&manager, bus, |s| {
        matches!(s.state, AssetState::Paused | AssetState::Finished)
    })
    .await?;
    println!("{model_id}: cleared, {}/{} files present", s.progress, s.total);
    Ok(())
}

async fn delete(registry: &ModelRegistry, bus: &ConsoleBus, model_id: &str) -> Result<()> {
    let manager = find(registry, model_id)?;
    wait_until(&manager, bus, settled).await?;

    manager.handle_delete();
    // The registry forgets the model before the snapshot is marked removed.
    wait_until(&manager, bus, |s| s.removed || registry.get(model_id).is_none()).await?;
    println!("{model_id}: deleted");
    Ok(())
}

fn run_cache(paths: &AppPaths, action: CacheCommand) -> Result<()> {
    let store = JsonCacheStore::new(paths.summary_cache_file());
    match action {
        CacheCommand::Clear => {
            let count = store.load()?.len();
            store.clear()?;
            println!("Removed {count} cached summaries");
        }
        CacheCommand::Remove { url } => {
            let mut entries = store.load()?;
            if entries.remove(&url).is_none() {
                bail!("no summary cached for {url}");
            }
            store.save(&entries)?;
            println!("Removed summary for {url}");
        }
    }
    Ok(())
}
