//! Chat session controller.
//!
//! The engine lives on one dedicated worker thread fed by an mpsc queue, so
//! engine calls never overlap. Requests flip the visible state on the
//! caller's thread and hand the engine work to the worker. An interrupt that
//! arrives while a generation is streaming is parked in `pending`; the worker
//! notices it after the chunk it is handling and runs it before taking the
//! next job.
//!
//! Bus events are recorded while the state lock is held and emitted once it
//! is released, so handlers may read the controller back.

use crate::engine::{EngineError, GenerateOptions, InferenceEngine};
use crate::history::{ChatMessage, MessageData, Role};
use crate::postprocess::{dedupe_repeated_tail, detect_repeat_tail, TRUNCATION_NOTICE};
use crate::{Result, SessionError};
use async_trait::async_trait;
use mlchat_events::{event_names, EventBusRef, EventQueue, NoticeEvent, SessionStateEvent};
use mlchat_models::{ModelConfig, ModelUser};
use mlchat_storage::CacheStore;
use serde::Serialize;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use uuid::Uuid;

pub const SUMMARY_INSTRUCTION: &str = "Summarize the following news article:";
pub const SUMMARY_PLACEHOLDER: &str = "Summarizing, please wait...";
pub const IMAGE_READY_REPORT: &str = "Image process is done, ask any question.";
/// First line of the assistant entry appended when the engine fails.
pub const DIAGNOSTIC_HEADER: &str = "Chat failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Ready,
    Generating,
    Resetting,
    Reloading,
    Terminating,
    Failed,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Generating => "generating",
            Self::Resetting => "resetting",
            Self::Reloading => "reloading",
            Self::Terminating => "terminating",
            Self::Failed => "failed",
        }
    }

    pub fn interruptable(&self) -> bool {
        matches!(self, Self::Ready | Self::Generating | Self::Failed)
    }

    pub fn chatable(&self) -> bool {
        *self == Self::Ready
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What the engine should have loaded. Two reloads to equal targets are
/// the same request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelTarget {
    pub model_id: String,
    pub model_lib: String,
    pub model_path: PathBuf,
}

impl ModelTarget {
    pub fn new(config: &ModelConfig, model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_id: config.model_id.clone(),
            model_lib: config.model_lib.clone(),
            model_path: model_path.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub model_id: Option<String>,
    pub messages: Vec<MessageData>,
    /// Last usage label, or a status line such as the image notice.
    pub report: String,
    pub image_attached: bool,
}

/// Receives the outcome of a summarize request exactly once.
pub type SummaryCallback = Box<dyn FnOnce(Result<String>) + Send>;

/// Engine work that must wait for any streaming generation to stop.
enum Continuation {
    Reset,
    Reload(ModelTarget),
    Terminate(Box<dyn FnOnce() + Send>),
}

/// Visible entries of one user turn, removed again if nothing is generated.
struct Turn {
    user: Uuid,
    placeholder: Uuid,
}

enum Job {
    Generate {
        message: ChatMessage,
        turn: Turn,
    },
    Summarize {
        key: String,
        content: String,
        on_result: SummaryCallback,
    },
    AttachImage(String),
    Epilogue(Continuation),
    /// Fires once every job queued before it has run.
    Barrier(oneshot::Sender<()>),
    Shutdown,
}

struct Shared {
    inner: Mutex<Inner>,
    changed: Condvar,
    events: EventQueue,
    store: Arc<dyn CacheStore>,
    cache: Mutex<HashMap<String, String>>,
}

struct Inner {
    state: SessionState,
    model: Option<ModelTarget>,
    messages: Vec<MessageData>,
    report: String,
    image: Option<String>,
    pending: Option<Continuation>,
}

pub struct SessionController {
    shared: Arc<Shared>,
    jobs: mpsc::Sender<Job>,
    worker: Option<JoinHandle<()>>,
}

impl SessionController {
    /// Move `engine` onto a new worker thread and load the summary cache.
    pub fn new(
        engine: Box<dyn InferenceEngine>,
        store: Arc<dyn CacheStore>,
        bus: EventBusRef,
    ) -> Self {
        let cache = store.load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to load summary cache, starting empty");
            HashMap::new()
        });
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: SessionState::Ready,
                model: None,
                messages: Vec::new(),
                report: String::new(),
                image: None,
                pending: None,
            }),
            changed: Condvar::new(),
            events: EventQueue::new(bus),
            store,
            cache: Mutex::new(cache),
        });

        let (jobs, jobs_rx) = mpsc::channel();
        let worker = Worker {
            shared: shared.clone(),
            engine,
            history: Vec::new(),
            loaded: false,
        };
        let handle = thread::spawn(move || worker.run(jobs_rx));

        Self {
            shared,
            jobs,
            worker: Some(handle),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    pub fn interruptable(&self) -> bool {
        self.state().interruptable()
    }

    pub fn chatable(&self) -> bool {
        self.state().chatable()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.lock().snapshot()
    }

    /// Block until a snapshot satisfies `pred`, or `timeout` elapses.
    pub fn wait_for(
        &self,
        mut pred: impl FnMut(&SessionSnapshot) -> bool,
        timeout: Duration,
    ) -> Option<SessionSnapshot> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.inner.lock().expect("session mutex poisoned");
        loop {
            let snapshot = inner.snapshot();
            if pred(&snapshot) {
                return Some(snapshot);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            inner = self
                .shared
                .changed
                .wait_timeout(inner, deadline - now)
                .expect("session mutex poisoned")
                .0;
        }
    }

    /// Send `prompt` (plus any attached image) and stream the answer.
    ///
    /// # Panics
    /// Unless the session is `Ready`.
    pub fn request_generate(&self, prompt: &str) {
        let mut inner = self.shared.lock();
        assert!(
            inner.state.chatable(),
            "generate is not allowed while {}",
            inner.state
        );

        let image = inner.image.take();
        let message = match &image {
            Some(url) => ChatMessage::user_with_image(prompt, url.clone()),
            None => ChatMessage::user(prompt),
        };
        let mut user = MessageData::new(Role::User, prompt);
        user.image_url = image;
        let placeholder = MessageData::new(Role::Assistant, "");
        let turn = Turn {
            user: user.id,
            placeholder: placeholder.id,
        };
        inner.messages.push(user);
        inner.messages.push(placeholder);

        self.shared.set_state(&mut inner, SessionState::Generating);
        self.shared.publish_messages(&inner);
        self.send(Job::Generate { message, turn });
    }

    /// Stage an image (data URL) to go out with the next prompt.
    ///
    /// # Panics
    /// Unless the session is `Ready`.
    pub fn attach_image(&self, data_url: impl Into<String>) {
        let mut inner = self.shared.lock();
        assert!(
            inner.state.chatable(),
            "attach image is not allowed while {}",
            inner.state
        );
        self.shared.set_state(&mut inner, SessionState::Generating);
        self.send(Job::AttachImage(data_url.into()));
    }

    /// Clear the conversation and the engine's state.
    ///
    /// # Panics
    /// Unless the session is `Ready`, `Generating` or `Failed`.
    pub fn request_reset(&self) {
        let mut inner = self.shared.lock();
        self.interrupt(&mut inner, "reset", SessionState::Resetting, Continuation::Reset);
    }

    /// Load `target` into the engine. No-op when it is already the target.
    ///
    /// # Panics
    /// Unless the session is `Ready`, `Generating` or `Failed`.
    pub fn request_reload(&self, target: ModelTarget) {
        let mut inner = self.shared.lock();
        if inner.model.as_ref() == Some(&target) {
            tracing::debug!(model_id = %target.model_id, "Reload target unchanged, skipping");
            return;
        }
        Inner::expect_interruptable(&inner, "reload");
        inner.model = Some(target.clone());
        self.interrupt(
            &mut inner,
            "reload",
            SessionState::Reloading,
            Continuation::Reload(target),
        );
    }

    /// Unload the engine and clear the conversation, then call `callback`.
    ///
    /// # Panics
    /// Unless the session is `Ready`, `Generating` or `Failed`.
    pub fn request_terminate(&self, callback: impl FnOnce() + Send + 'static) {
        let mut inner = self.shared.lock();
        self.interrupt(
            &mut inner,
            "terminate",
            SessionState::Terminating,
            Continuation::Terminate(Box::new(callback)),
        );
    }

    /// Summarize `content` in a fresh conversation, serving the cache for a
    /// known `key`.
    ///
    /// `on_result` is always called exactly once, from the worker thread.
    ///
    /// # Panics
    /// Unless the session is `Ready`.
    pub fn request_summarize(
        &self,
        key: impl Into<String>,
        content: impl Into<String>,
        on_result: impl FnOnce(Result<String>) + Send + 'static,
    ) {
        let mut inner = self.shared.lock();
        assert!(
            inner.state.chatable(),
            "summarize is not allowed while {}",
            inner.state
        );
        self.shared.set_state(&mut inner, SessionState::Generating);
        self.send(Job::Summarize {
            key: key.into(),
            content: content.into(),
            on_result: Box::new(on_result),
        });
    }

    pub fn cached_summary(&self, key: &str) -> Option<String> {
        self.shared.cache().get(key).cloned()
    }

    /// Drop one cached summary. Returns whether it existed.
    pub fn invalidate_summary(&self, key: &str) -> Result<bool> {
        let entries = {
            let mut cache = self.shared.cache();
            if cache.remove(key).is_none() {
                return Ok(false);
            }
            cache.clone()
        };
        self.shared.store.save(&entries)?;
        Ok(true)
    }

    pub fn clear_summary_cache(&self) -> Result<()> {
        self.shared.cache().clear();
        self.shared.store.clear()?;
        Ok(())
    }

    /// Prologue of the interruption protocol, run with the state lock held.
    fn interrupt(
        &self,
        inner: &mut Inner,
        trigger: &str,
        to: SessionState,
        continuation: Continuation,
    ) {
        let from = Inner::expect_interruptable(inner, trigger);
        self.shared.set_state(inner, to);
        match from {
            SessionState::Generating => {
                debug_assert!(inner.pending.is_none(), "interrupt already pending");
                inner.pending = Some(continuation);
            }
            _ => self.send(Job::Epilogue(continuation)),
        }
    }

    fn send(&self, job: Job) {
        if self.jobs.send(job).is_err() {
            tracing::error!("Session worker is gone, request dropped");
        }
    }

    /// One attempt at letting go of the model. Returns true when `done`
    /// fires after the model is released, false when it only marks the end
    /// of a reset or reload that must finish first.
    fn release_step(&self, done: oneshot::Sender<()>) -> bool {
        let mut inner = self.shared.lock();
        match inner.state {
            SessionState::Ready if inner.model.is_none() => {
                let _ = done.send(());
                true
            }
            SessionState::Ready | SessionState::Generating | SessionState::Failed => {
                self.interrupt(
                    &mut inner,
                    "terminate",
                    SessionState::Terminating,
                    Continuation::Terminate(Box::new(move || {
                        let _ = done.send(());
                    })),
                );
                true
            }
            SessionState::Terminating => {
                self.send(Job::Barrier(done));
                true
            }
            SessionState::Resetting | SessionState::Reloading => {
                self.send(Job::Barrier(done));
                false
            }
        }
    }
}

#[async_trait]
impl ModelUser for SessionController {
    fn current_model(&self) -> Option<String> {
        self.shared
            .lock()
            .model
            .as_ref()
            .map(|m| m.model_id.clone())
    }

    async fn release(&self) {
        loop {
            let (tx, rx) = oneshot::channel();
            let released = self.release_step(tx);
            let _ = rx.await;
            if released {
                return;
            }
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        let _ = self.jobs.send(Job::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Inner {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            model_id: self.model.as_ref().map(|m| m.model_id.clone()),
            messages: self.messages.clone(),
            report: self.report.clone(),
            image_attached: self.image.is_some(),
        }
    }

    fn expect_interruptable(&self, trigger: &str) -> SessionState {
        assert!(
            self.state.interruptable(),
            "{trigger} is not allowed while {}",
            self.state
        );
        self.state
    }

    fn message_mut(&mut self, id: Uuid) -> Option<&mut MessageData> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    fn remove_messages(&mut self, ids: &[Uuid]) {
        self.messages.retain(|m| !ids.contains(&m.id));
    }

    fn clear_conversation(&mut self) {
        self.messages.clear();
        self.report.clear();
        self.image = None;
    }
}

/// Session lock that emits the events recorded under it once released.
struct Locked<'a> {
    guard: Option<MutexGuard<'a, Inner>>,
    shared: &'a Shared,
}

impl Deref for Locked<'_> {
    type Target = Inner;

    fn deref(&self) -> &Inner {
        self.guard.as_deref().expect("session lock already released")
    }
}

impl DerefMut for Locked<'_> {
    fn deref_mut(&mut self) -> &mut Inner {
        self.guard.as_deref_mut().expect("session lock already released")
    }
}

impl Drop for Locked<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.shared.events.flush();
    }
}

impl Shared {
    fn lock(&self) -> Locked<'_> {
        Locked {
            guard: Some(self.inner.lock().expect("session mutex poisoned")),
            shared: self,
        }
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.cache.lock().expect("summary cache mutex poisoned")
    }

    fn set_state(&self, inner: &mut Inner, state: SessionState) {
        if inner.state != state {
            tracing::info!(from = %inner.state, to = %state, "Session state changed");
        }
        inner.state = state;
        self.events.push(
            event_names::SESSION_STATE,
            &SessionStateEvent {
                state: state.name().to_string(),
                model_id: inner.model.as_ref().map(|m| m.model_id.clone()),
                message_count: inner.messages.len(),
            },
        );
        self.changed.notify_all();
    }

    fn publish_messages(&self, inner: &Inner) {
        self.events.push(event_names::SESSION_MESSAGES, &inner.messages);
        self.changed.notify_all();
    }

    fn notice(&self, inner: &Inner, message: &str) {
        self.events.push(
            event_names::SESSION_NOTICE,
            &NoticeEvent {
                model_id: inner.model.as_ref().map(|m| m.model_id.clone()),
                message: message.to_string(),
            },
        );
    }

    /// Show `error` inline and move to `Failed`, unless an interrupt already
    /// took over the state.
    fn fail(&self, inner: &mut Inner, error: &EngineError, from: SessionState) {
        tracing::error!(error = %error, state = %inner.state, "Engine call failed");
        inner.messages.push(MessageData::new(
            Role::Assistant,
            format!("{DIAGNOSTIC_HEADER}\n\nError message:\n{error}"),
        ));
        self.publish_messages(inner);
        if inner.state == from {
            self.set_state(inner, SessionState::Failed);
        }
    }

    /// Leave `Generating` for `Ready` unless interrupted meanwhile.
    fn finish_generating(&self, inner: &mut Inner) {
        if inner.state == SessionState::Generating {
            self.set_state(inner, SessionState::Ready);
        }
    }
}

#[derive(Default)]
struct StreamOutcome {
    text: String,
    truncated: bool,
    repeating: bool,
    interrupted: bool,
    error: Option<EngineError>,
}

/// Owns the engine. Runs on the worker thread only.
struct Worker {
    shared: Arc<Shared>,
    engine: Box<dyn InferenceEngine>,
    history: Vec<ChatMessage>,
    loaded: bool,
}

impl Worker {
    fn run(mut self, jobs: mpsc::Receiver<Job>) {
        while let Ok(job) = jobs.recv() {
            match job {
                Job::Generate { message, turn } => self.generate(message, turn),
                Job::Summarize {
                    key,
                    content,
                    on_result,
                } => self.summarize(key, content, on_result),
                Job::AttachImage(url) => self.attach_image(url),
                Job::Epilogue(continuation) => self.epilogue(continuation),
                Job::Barrier(done) => {
                    let _ = done.send(());
                }
                Job::Shutdown => break,
            }

            let pending = self.shared.lock().pending.take();
            if let Some(continuation) = pending {
                self.epilogue(continuation);
            }
        }

        if self.loaded {
            if let Err(e) = self.engine.unload() {
                tracing::warn!(error = %e, "Failed to unload engine on shutdown");
            }
        }
        tracing::debug!("Session worker stopped");
    }

    fn still_generating(&self) -> bool {
        self.shared.lock().state == SessionState::Generating
    }

    fn attach_image(&mut self, url: String) {
        let mut inner = self.shared.lock();
        inner.image = Some(url);
        inner.report = IMAGE_READY_REPORT.to_string();
        self.shared.finish_generating(&mut inner);
    }

    fn generate(&mut self, message: ChatMessage, turn: Turn) {
        if !self.still_generating() {
            // Interrupted before the engine was touched.
            let mut inner = self.shared.lock();
            inner.remove_messages(&[turn.user, turn.placeholder]);
            self.shared.publish_messages(&inner);
            return;
        }

        self.history.push(message);
        let outcome = self.stream(turn.placeholder, false);
        let mut text = outcome.text;
        if outcome.truncated {
            text.push_str(TRUNCATION_NOTICE);
        }

        let mut inner = self.shared.lock();
        if text.is_empty() {
            self.history.pop();
            inner.remove_messages(&[turn.user, turn.placeholder]);
        } else {
            if let Some(entry) = inner.message_mut(turn.placeholder) {
                entry.text = text.clone();
            }
            self.history.push(ChatMessage::assistant(text));
        }
        self.shared.publish_messages(&inner);

        match &outcome.error {
            Some(error) => self
                .shared
                .fail(&mut inner, error, SessionState::Generating),
            None => self.shared.finish_generating(&mut inner),
        }
        tracing::debug!(
            history = self.history.len(),
            interrupted = outcome.interrupted,
            "Generation finished"
        );
    }

    fn summarize(&mut self, key: String, content: String, on_result: SummaryCallback) {
        if !self.still_generating() {
            on_result(Err(SessionError::Interrupted));
            return;
        }

        let cached = self.shared.cache().get(&key).cloned();
        self.history.clear();
        let (system, user, placeholder) = {
            let mut inner = self.shared.lock();
            inner.clear_conversation();
            let system = MessageData::new(Role::System, SUMMARY_INSTRUCTION);
            let user = MessageData::new(Role::User, content.clone());
            let placeholder = MessageData::new(
                Role::Assistant,
                cached.as_deref().unwrap_or(SUMMARY_PLACEHOLDER),
            );
            let ids = (system.id, user.id, placeholder.id);
            inner.messages.extend([system, user, placeholder]);
            self.shared.publish_messages(&inner);
            ids
        };

        if let Some(summary) = cached {
            tracing::debug!(key = %key, "Summary served from cache");
            self.history = vec![
                ChatMessage::system(SUMMARY_INSTRUCTION),
                ChatMessage::user(content),
                ChatMessage::assistant(summary.clone()),
            ];
            self.shared.finish_generating(&mut self.shared.lock());
            on_result(Ok(summary));
            return;
        }

        if let Err(e) = self.engine.reset() {
            let mut inner = self.shared.lock();
            inner.remove_messages(&[placeholder]);
            self.shared.fail(&mut inner, &e, SessionState::Generating);
            drop(inner);
            on_result(Err(e.into()));
            return;
        }
        self.history.push(ChatMessage::system(SUMMARY_INSTRUCTION));
        self.history.push(ChatMessage::user(content));

        let outcome = self.stream(placeholder, true);
        if outcome.interrupted {
            on_result(Err(SessionError::Interrupted));
            return;
        }

        let mut summary = if outcome.repeating {
            dedupe_repeated_tail(&outcome.text)
        } else {
            outcome.text
        };
        if outcome.truncated && !summary.is_empty() {
            summary.push_str(TRUNCATION_NOTICE);
        }

        {
            let mut inner = self.shared.lock();
            if summary.is_empty() {
                self.history.clear();
                inner.remove_messages(&[system, user, placeholder]);
            } else {
                if let Some(entry) = inner.message_mut(placeholder) {
                    entry.text = summary.clone();
                }
                self.history.push(ChatMessage::assistant(summary.clone()));
            }
            self.shared.publish_messages(&inner);
            match &outcome.error {
                Some(error) => self
                    .shared
                    .fail(&mut inner, error, SessionState::Generating),
                None => self.shared.finish_generating(&mut inner),
            }
        }

        if let Some(error) = outcome.error {
            on_result(Err(error.into()));
        } else if summary.is_empty() {
            on_result(Err(SessionError::EmptySummary));
        } else {
            self.store_summary(key, summary.clone());
            on_result(Ok(summary));
        }
    }

    fn store_summary(&self, key: String, summary: String) {
        let entries = {
            let mut cache = self.shared.cache();
            cache.insert(key, summary);
            cache.clone()
        };
        if let Err(e) = self.shared.store.save(&entries) {
            tracing::warn!(error = %e, "Failed to persist summary cache");
            let inner = self.shared.lock();
            self.shared
                .notice(&inner, &format!("Saving summary cache failed: {e}"));
        }
    }

    /// Pull chunks into the placeholder until the stream ends, fails, is
    /// interrupted or (with `stop_on_repeat`) starts looping.
    fn stream(&mut self, placeholder: Uuid, stop_on_repeat: bool) -> StreamOutcome {
        let mut outcome = StreamOutcome::default();
        let chunks = match self
            .engine
            .generate(&self.history, GenerateOptions::default())
        {
            Ok(chunks) => chunks,
            Err(e) => {
                outcome.error = Some(e);
                return outcome;
            }
        };

        for chunk in chunks {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    outcome.error = Some(e);
                    break;
                }
            };
            outcome.text.push_str(&chunk.delta);
            if chunk.finish_reason.as_deref() == Some("length") {
                outcome.truncated = true;
            }

            let mut inner = self.shared.lock();
            if let Some(usage) = &chunk.usage {
                inner.report = usage.label();
            }
            if !chunk.delta.is_empty() {
                if let Some(entry) = inner.message_mut(placeholder) {
                    entry.text = outcome.text.clone();
                }
                self.shared.publish_messages(&inner);
            }
            if inner.state != SessionState::Generating {
                tracing::debug!(state = %inner.state, "Generation interrupted");
                outcome.interrupted = true;
                break;
            }
            if stop_on_repeat && detect_repeat_tail(&outcome.text) {
                tracing::debug!("Repeated sentence detected, stopping generation");
                outcome.repeating = true;
                break;
            }
        }
        outcome
    }

    fn epilogue(&mut self, continuation: Continuation) {
        match continuation {
            Continuation::Reset => {
                let result = self.engine.reset();
                self.history.clear();
                let mut inner = self.shared.lock();
                inner.clear_conversation();
                self.shared.publish_messages(&inner);
                match result {
                    Ok(()) => self.shared.set_state(&mut inner, SessionState::Ready),
                    Err(e) => self.shared.fail(&mut inner, &e, SessionState::Resetting),
                }
            }
            Continuation::Reload(target) => {
                self.history.clear();
                {
                    let mut inner = self.shared.lock();
                    inner.clear_conversation();
                    self.shared.publish_messages(&inner);
                    self.shared.notice(&inner, "Initialize...");
                }
                tracing::info!(
                    model_id = %target.model_id,
                    model_lib = %target.model_lib,
                    path = ?target.model_path,
                    "Reloading engine"
                );
                let result = self
                    .engine
                    .unload()
                    .and_then(|()| self.engine.reload(&target.model_path, &target.model_lib));
                self.loaded = result.is_ok();

                let mut inner = self.shared.lock();
                match result {
                    Ok(()) => {
                        self.shared.notice(&inner, "Ready to chat");
                        self.shared.set_state(&mut inner, SessionState::Ready);
                    }
                    Err(e) => {
                        // Forget the target so the same model can be retried.
                        if inner.model.as_ref() == Some(&target) {
                            inner.model = None;
                        }
                        self.shared.fail(&mut inner, &e, SessionState::Reloading);
                    }
                }
            }
            Continuation::Terminate(callback) => {
                if let Err(e) = self.engine.unload() {
                    tracing::warn!(error = %e, "Failed to unload engine");
                }
                self.loaded = false;
                self.history.clear();
                {
                    let mut inner = self.shared.lock();
                    inner.clear_conversation();
                    inner.model = None;
                    self.shared.publish_messages(&inner);
                    self.shared.set_state(&mut inner, SessionState::Ready);
                }
                callback();
            }
        }
    }
}
