//! Per-model download lifecycle as a pure state machine.
//!
//! `AssetLifecycle::handle` maps `(state, event)` to a new state plus a list
//! of effects. It never touches the filesystem or the network; the
//! `AssetManager` runs the effects and feeds their outcomes back in as
//! events.

use crate::task::DownloadTask;
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetState {
    Initializing,
    Indexing,
    Paused,
    Downloading,
    Pausing,
    Clearing,
    Deleting,
    Finished,
}

impl AssetState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Indexing => "indexing",
            Self::Paused => "paused",
            Self::Downloading => "downloading",
            Self::Pausing => "pausing",
            Self::Clearing => "clearing",
            Self::Deleting => "deleting",
            Self::Finished => "finished",
        }
    }
}

impl std::fmt::Display for AssetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Inputs to the lifecycle: user requests and outcomes of earlier effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetEvent {
    /// Params manifest is loaded in memory (found on disk or fetched).
    ManifestLoaded,
    /// Manifest could neither be read nor fetched.
    ManifestFailed(String),
    /// Retry manifest discovery after a failure.
    RetryManifest,
    /// Disk scan finished.
    Indexed {
        missing: Vec<DownloadTask>,
        total: usize,
    },
    Start,
    Pause,
    Clear,
    Delete,
    /// File was relocated to its final destination.
    TaskFinished(DownloadTask),
    /// Transfer gave up after its retries.
    TaskFailed { task: DownloadTask, error: String },
    /// Everything but the model config was removed.
    Cleared,
    /// Model directory could not be removed.
    DeleteFailed(String),
}

/// Work the runner must perform on behalf of the lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Load the manifest from disk, fetching it first if absent.
    PrepareManifest,
    /// Scan the model directory against config + manifest.
    Index,
    /// Start one transfer.
    Dispatch(DownloadTask),
    /// Remove every file except the model config. When `release_session`
    /// is set, any chat session using the model must be torn down first.
    ClearFiles { release_session: bool },
    /// Remove the model directory and tell the owner.
    DeleteDirectory { release_session: bool },
    /// Surface a message to the user.
    Notify(String),
}

#[derive(Debug)]
pub struct AssetLifecycle {
    state: AssetState,
    /// Missing files in discovery order.
    remaining: Vec<DownloadTask>,
    active: HashSet<DownloadTask>,
    total: usize,
    max_concurrent: usize,
}

impl AssetLifecycle {
    pub fn new(max_concurrent: usize) -> Self {
        assert!(max_concurrent > 0, "download pool needs at least one slot");
        Self {
            state: AssetState::Initializing,
            remaining: Vec::new(),
            active: HashSet::new(),
            total: 0,
            max_concurrent,
        }
    }

    /// Effects to run right after construction.
    pub fn boot(&self) -> Vec<Effect> {
        assert_eq!(self.state, AssetState::Initializing);
        vec![Effect::PrepareManifest]
    }

    pub fn state(&self) -> AssetState {
        self.state
    }

    pub fn remaining(&self) -> &[DownloadTask] {
        &self.remaining
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, task: &DownloadTask) -> bool {
        self.active.contains(task)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Files confirmed on disk.
    pub fn progress(&self) -> usize {
        self.total.saturating_sub(self.remaining.len())
    }

    pub fn handle(&mut self, event: AssetEvent) -> Vec<Effect> {
        match event {
            AssetEvent::ManifestLoaded => {
                self.expect_state(&[AssetState::Initializing], "manifest loaded");
                self.state = AssetState::Indexing;
                vec![Effect::Index]
            }
            AssetEvent::ManifestFailed(error) => {
                self.expect_state(&[AssetState::Initializing], "manifest failed");
                vec![Effect::Notify(format!("Download params manifest failed: {error}"))]
            }
            AssetEvent::RetryManifest => {
                if self.state != AssetState::Initializing {
                    return Vec::new();
                }
                vec![Effect::PrepareManifest]
            }
            AssetEvent::Indexed { missing, total } => self.on_indexed(missing, total),
            AssetEvent::Start => self.on_start(),
            AssetEvent::Pause => self.on_pause(),
            AssetEvent::Clear => self.on_clear(),
            AssetEvent::Delete => self.on_delete(),
            AssetEvent::TaskFinished(task) => self.on_task_finished(task),
            AssetEvent::TaskFailed { task, error } => self.on_task_failed(task, error),
            AssetEvent::Cleared => {
                self.expect_state(&[AssetState::Clearing], "cleared");
                debug_assert!(self.active.is_empty());
                self.remaining.clear();
                self.state = AssetState::Indexing;
                vec![Effect::Index]
            }
            AssetEvent::DeleteFailed(error) => {
                self.expect_state(&[AssetState::Deleting], "delete failed");
                debug_assert!(self.active.is_empty());
                // Part of the directory may be gone; settle on what is left.
                self.remaining.clear();
                self.state = AssetState::Indexing;
                vec![
                    Effect::Notify(format!("Delete model failed: {error}")),
                    Effect::Index,
                ]
            }
        }
    }

    fn on_indexed(&mut self, missing: Vec<DownloadTask>, total: usize) -> Vec<Effect> {
        self.expect_state(&[AssetState::Indexing], "indexed");
        self.remaining.clear();
        self.active.clear();
        for task in missing {
            if !self.remaining.contains(&task) {
                self.remaining.push(task);
            }
        }
        self.total = total.max(self.remaining.len());
        self.state = if self.remaining.is_empty() {
            AssetState::Finished
        } else {
            AssetState::Paused
        };
        Vec::new()
    }

    fn on_start(&mut self) -> Vec<Effect> {
        if self.state != AssetState::Paused {
            return Vec::new();
        }
        self.state = AssetState::Downloading;
        let mut effects = Vec::new();
        while self.active.len() < self.max_concurrent {
            match self.next_unscheduled() {
                Some(task) => effects.push(self.dispatch(task)),
                None => break,
            }
        }
        if self.active.is_empty() {
            self.state = AssetState::Finished;
        }
        effects
    }

    fn on_pause(&mut self) -> Vec<Effect> {
        self.expect_state(&[AssetState::Downloading], "pause");
        self.state = if self.active.is_empty() {
            AssetState::Paused
        } else {
            AssetState::Pausing
        };
        Vec::new()
    }

    fn on_clear(&mut self) -> Vec<Effect> {
        let from = self.expect_state(
            &[
                AssetState::Downloading,
                AssetState::Paused,
                AssetState::Finished,
            ],
            "clear",
        );
        self.state = AssetState::Clearing;
        match from {
            AssetState::Downloading if !self.active.is_empty() => Vec::new(),
            _ => vec![Effect::ClearFiles {
                release_session: from == AssetState::Finished,
            }],
        }
    }

    fn on_delete(&mut self) -> Vec<Effect> {
        let from = self.expect_state(
            &[
                AssetState::Downloading,
                AssetState::Paused,
                AssetState::Finished,
            ],
            "delete",
        );
        self.state = AssetState::Deleting;
        match from {
            AssetState::Downloading if !self.active.is_empty() => Vec::new(),
            _ => vec![Effect::DeleteDirectory {
                release_session: from == AssetState::Finished,
            }],
        }
    }

    fn on_task_finished(&mut self, task: DownloadTask) -> Vec<Effect> {
        self.expect_state(
            &[
                AssetState::Downloading,
                AssetState::Pausing,
                AssetState::Clearing,
                AssetState::Deleting,
            ],
            "task finished",
        );
        assert!(
            self.active.remove(&task),
            "finished task was not active: {}",
            task.source
        );
        self.remaining.retain(|t| t != &task);

        if self.state == AssetState::Downloading {
            if self.remaining.is_empty() {
                if self.active.is_empty() {
                    self.state = AssetState::Finished;
                }
                return Vec::new();
            }
            return self
                .next_unscheduled()
                .map(|next| vec![self.dispatch(next)])
                .unwrap_or_default();
        }
        self.after_drain_step()
    }

    fn on_task_failed(&mut self, task: DownloadTask, error: String) -> Vec<Effect> {
        self.expect_state(
            &[
                AssetState::Downloading,
                AssetState::Pausing,
                AssetState::Clearing,
                AssetState::Deleting,
            ],
            "task failed",
        );
        assert!(
            self.active.remove(&task),
            "failed task was not active: {}",
            task.source
        );
        let mut effects = vec![Effect::Notify(format!(
            "Download {} failed: {error}",
            task.source
        ))];
        if self.state == AssetState::Downloading {
            // Halt the batch; the user restarts it once the cause is fixed.
            self.state = AssetState::Pausing;
        }
        effects.extend(self.after_drain_step());
        effects
    }

    /// Advance Pausing/Clearing/Deleting once nothing is in flight.
    fn after_drain_step(&mut self) -> Vec<Effect> {
        if !self.active.is_empty() {
            return Vec::new();
        }
        match self.state {
            AssetState::Pausing => {
                self.state = AssetState::Paused;
                Vec::new()
            }
            AssetState::Clearing => vec![Effect::ClearFiles {
                release_session: false,
            }],
            AssetState::Deleting => vec![Effect::DeleteDirectory {
                release_session: false,
            }],
            _ => Vec::new(),
        }
    }

    fn next_unscheduled(&self) -> Option<DownloadTask> {
        self.remaining
            .iter()
            .find(|task| !self.active.contains(*task))
            .cloned()
    }

    fn dispatch(&mut self, task: DownloadTask) -> Effect {
        assert_eq!(self.state, AssetState::Downloading);
        assert!(self.active.len() < self.max_concurrent);
        assert!(self.active.insert(task.clone()), "task already active");
        Effect::Dispatch(task)
    }

    fn expect_state(&self, allowed: &[AssetState], trigger: &str) -> AssetState {
        assert!(
            allowed.contains(&self.state),
            "{trigger} is not allowed while {}",
            self.state
        );
        self.state
    }
}
