//! Install lifecycle of models hosted by the backend.
//!
//! Each model name gets its own state machine (see [`state`]). The
//! controller owns every poll loop it starts: a loop exists only while its
//! model is `Downloading`, and its handle is released on success, failure,
//! cancellation and teardown. Async completions are tagged with the epoch
//! they started under and dropped if the model has moved on since.

pub mod state;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::api::ApiError;
pub use state::{Event, ModelStatus, TransitionError};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Remote operations the lifecycle depends on.
#[async_trait]
pub trait ModelBackend: Send + Sync + 'static {
    async fn is_installed(&self, model: &str) -> Result<bool, ApiError>;
    /// Start pulling `model`. Anything the pull keeps open after returning
    /// (such as a progress stream) must be released once `cancel` fires.
    async fn pull(&self, model: &str, cancel: CancellationToken) -> Result<(), ApiError>;
    async fn cancel(&self, model: &str) -> Result<(), ApiError>;
    async fn delete(&self, model: &str) -> Result<(), ApiError>;
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Remote(#[from] ApiError),
    #[error("model '{model}': {source}")]
    InvalidTransition {
        model: String,
        #[source]
        source: TransitionError,
    },
}

/// Broadcast on every committed transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusChange {
    pub model: String,
    pub status: ModelStatus,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSnapshot {
    pub model: String,
    pub status: ModelStatus,
    pub last_error: Option<String>,
    pub changed_at: DateTime<Utc>,
    pub polling: bool,
}

/// Owned poll task. Dropping it stops the loop.
struct PollHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        // When a loop drops its own handle the abort only lands at its next
        // await, and the loop returns before reaching one.
        self.token.cancel();
        self.task.abort();
    }
}

struct Entry {
    status: ModelStatus,
    epoch: u64,
    poll: Option<PollHandle>,
    last_error: Option<String>,
    changed_at: DateTime<Utc>,
}

impl Entry {
    fn new() -> Self {
        Self {
            status: ModelStatus::Idle,
            epoch: 0,
            poll: None,
            last_error: None,
            changed_at: Utc::now(),
        }
    }

    fn set(&mut self, status: ModelStatus, message: Option<String>) {
        self.status = status;
        self.last_error = message;
        self.changed_at = Utc::now();
        if status != ModelStatus::Downloading {
            self.poll = None;
        }
    }
}

struct Shared {
    backend: Arc<dyn ModelBackend>,
    entries: Mutex<HashMap<String, Entry>>,
    events: broadcast::Sender<StatusChange>,
    poll_interval: Duration,
    /// Controller-wide, so a forgotten and recreated entry never reuses an
    /// epoch an old completion still carries.
    epochs: AtomicU64,
}

impl Shared {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn emit(&self, model: &str, entry: &Entry) {
        let _ = self.events.send(StatusChange {
            model: model.to_string(),
            status: entry.status,
            message: entry.last_error.clone(),
        });
    }

    /// Commit `event` for `model` if it is still at `epoch` and `expected`.
    /// Returns `None` for a stale completion.
    fn complete(
        &self,
        model: &str,
        epoch: u64,
        expected: ModelStatus,
        event: Event,
        message: Option<String>,
    ) -> Option<ModelStatus> {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(model) else {
            tracing::debug!("Discarding stale '{event}' for {model}: no longer tracked");
            return None;
        };
        if entry.epoch != epoch || entry.status != expected {
            tracing::debug!(
                "Discarding stale '{event}' for {model}: now {} (epoch {} vs {epoch})",
                entry.status,
                entry.epoch
            );
            return None;
        }
        match state::transition(entry.status, event) {
            Ok(next) => {
                tracing::info!("Model {model}: {} -> {next}", entry.status);
                entry.set(next, message);
                self.emit(model, entry);
                Some(next)
            }
            Err(e) => {
                tracing::warn!("Model {model}: {e}");
                None
            }
        }
    }

    fn is_live(&self, model: &str, epoch: u64) -> bool {
        self.entries()
            .get(model)
            .is_some_and(|e| e.epoch == epoch && e.status == ModelStatus::Downloading)
    }
}

pub struct Controller {
    shared: Arc<Shared>,
}

impl Controller {
    pub fn new(backend: Arc<dyn ModelBackend>, poll_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                backend,
                entries: Mutex::new(HashMap::new()),
                events,
                poll_interval,
                epochs: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.shared.events.subscribe()
    }

    pub fn status(&self, model: &str) -> ModelStatus {
        self.shared
            .entries()
            .get(model)
            .map(|e| e.status)
            .unwrap_or(ModelStatus::Idle)
    }

    pub fn snapshot(&self, model: &str) -> Option<ModelSnapshot> {
        self.shared.entries().get(model).map(|e| snapshot_of(model, e))
    }

    pub fn snapshots(&self) -> Vec<ModelSnapshot> {
        let entries = self.shared.entries();
        let mut all: Vec<_> = entries.iter().map(|(m, e)| snapshot_of(m, e)).collect();
        all.sort_by(|a, b| a.model.cmp(&b.model));
        all
    }

    /// Number of live poll loops across all models.
    pub fn active_polls(&self) -> usize {
        self.shared
            .entries()
            .values()
            .filter(|e| e.poll.as_ref().is_some_and(|p| !p.task.is_finished()))
            .count()
    }

    /// Ask the backend whether `model` is installed. While a check, pull or
    /// cancel is already in flight for the model this is a no-op returning
    /// the current status.
    pub async fn check_status(&self, model: &str) -> Result<ModelStatus, LifecycleError> {
        let epoch = {
            let mut entries = self.shared.entries();
            let entry = entries.entry(model.to_string()).or_insert_with(Entry::new);
            if entry.status.is_in_flight() {
                tracing::debug!("Model {model} already {}; not checking again", entry.status);
                return Ok(entry.status);
            }
            let next = state::transition(entry.status, Event::Check).map_err(|source| {
                LifecycleError::InvalidTransition { model: model.to_string(), source }
            })?;
            entry.epoch = self.shared.next_epoch();
            entry.set(next, None);
            self.shared.emit(model, entry);
            entry.epoch
        };

        match self.shared.backend.is_installed(model).await {
            Ok(installed) => {
                let event = Event::CheckCompleted { installed };
                Ok(self
                    .shared
                    .complete(model, epoch, ModelStatus::Checking, event, None)
                    .unwrap_or_else(|| self.status(model)))
            }
            Err(e) => {
                tracing::warn!("Checking {model} failed: {e}");
                match self.shared.complete(
                    model,
                    epoch,
                    ModelStatus::Checking,
                    Event::Failed,
                    Some(e.to_string()),
                ) {
                    Some(_) => Err(e.into()),
                    None => Ok(self.status(model)),
                }
            }
        }
    }

    /// The user agreed to download `model`: issue the pull and start the
    /// poll loop. A second call while the loop runs is a no-op.
    pub fn confirm_pull(&self, model: &str) -> Result<ModelStatus, LifecycleError> {
        let mut entries = self.shared.entries();
        let entry = entries.entry(model.to_string()).or_insert_with(Entry::new);
        if entry.status == ModelStatus::Downloading {
            tracing::debug!("Model {model} already downloading");
            return Ok(entry.status);
        }
        let next = state::transition(entry.status, Event::Confirm).map_err(|source| {
            LifecycleError::InvalidTransition { model: model.to_string(), source }
        })?;

        entry.epoch = self.shared.next_epoch();
        let token = CancellationToken::new();
        let task = tokio::spawn(poll_until_installed(
            self.shared.clone(),
            model.to_string(),
            entry.epoch,
            token.clone(),
        ));
        entry.set(next, None);
        entry.poll = Some(PollHandle { token, task });
        tracing::info!("Model {model}: pulling, polling every {:?}", self.shared.poll_interval);
        self.shared.emit(model, entry);
        Ok(next)
    }

    /// The user declined the download prompt.
    pub fn decline_pull(&self, model: &str) -> Result<ModelStatus, LifecycleError> {
        let mut entries = self.shared.entries();
        let entry = entries.entry(model.to_string()).or_insert_with(Entry::new);
        let next = state::transition(entry.status, Event::Decline).map_err(|source| {
            LifecycleError::InvalidTransition { model: model.to_string(), source }
        })?;
        entry.epoch = self.shared.next_epoch();
        entry.set(next, None);
        self.shared.emit(model, entry);
        Ok(next)
    }

    /// Stop the local poll loop right away, then tell the backend. The model
    /// ends up `Idle` whether or not the backend call succeeds; a backend
    /// failure is still returned.
    pub async fn cancel_pull(&self, model: &str) -> Result<ModelStatus, LifecycleError> {
        let epoch = {
            let mut entries = self.shared.entries();
            let entry = entries.entry(model.to_string()).or_insert_with(Entry::new);
            if entry.status == ModelStatus::Canceling {
                return Ok(entry.status);
            }
            let next = state::transition(entry.status, Event::Cancel).map_err(|source| {
                LifecycleError::InvalidTransition { model: model.to_string(), source }
            })?;
            entry.epoch = self.shared.next_epoch();
            entry.set(next, None);
            tracing::info!("Model {model}: poll loop released, canceling pull");
            self.shared.emit(model, entry);
            entry.epoch
        };

        let result = self.shared.backend.cancel(model).await;
        let message = result.as_ref().err().map(ToString::to_string);
        let status = self
            .shared
            .complete(model, epoch, ModelStatus::Canceling, Event::CancelCompleted, message)
            .unwrap_or_else(|| self.status(model));
        result?;
        Ok(status)
    }

    /// Remove a downloaded model from the backend. On failure the model
    /// stays `Downloaded` and the error is returned.
    pub async fn delete_model(&self, model: &str) -> Result<ModelStatus, LifecycleError> {
        let epoch = {
            let entries = self.shared.entries();
            let (status, epoch) = entries
                .get(model)
                .map(|e| (e.status, e.epoch))
                .unwrap_or((ModelStatus::Idle, 0));
            state::transition(status, Event::Deleted).map_err(|source| {
                LifecycleError::InvalidTransition { model: model.to_string(), source }
            })?;
            epoch
        };

        match self.shared.backend.delete(model).await {
            Ok(()) => Ok(self
                .shared
                .complete(model, epoch, ModelStatus::Downloaded, Event::Deleted, None)
                .unwrap_or_else(|| self.status(model))),
            Err(e) => {
                tracing::warn!("Deleting {model} failed: {e}");
                let mut entries = self.shared.entries();
                if let Some(entry) = entries.get_mut(model).filter(|e| e.epoch == epoch) {
                    entry.last_error = Some(e.to_string());
                    self.shared.emit(model, entry);
                }
                Err(e.into())
            }
        }
    }

    /// Forget every model except `keep` that has nothing in flight. Called
    /// when the user switches models; downloads of other models carry on.
    pub fn release_inactive(&self, keep: &str) {
        self.shared.entries().retain(|model, entry| {
            model == keep
                || matches!(entry.status, ModelStatus::Downloading | ModelStatus::Canceling)
        });
    }

    /// Stop every poll loop and forget all models.
    pub fn shutdown(&self) {
        let mut entries = self.shared.entries();
        let polling = entries.values().filter(|e| e.poll.is_some()).count();
        if polling > 0 {
            tracing::info!("Stopping {polling} poll loop(s)");
        }
        entries.clear();
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn snapshot_of(model: &str, entry: &Entry) -> ModelSnapshot {
    ModelSnapshot {
        model: model.to_string(),
        status: entry.status,
        last_error: entry.last_error.clone(),
        changed_at: entry.changed_at,
        polling: entry.poll.is_some(),
    }
}

async fn poll_until_installed(shared: Arc<Shared>, model: String, epoch: u64, token: CancellationToken) {
    let pulled = tokio::select! {
        biased;
        _ = token.cancelled() => return,
        r = shared.backend.pull(&model, token.clone()) => r,
    };
    if let Err(e) = pulled {
        tracing::warn!("Pulling {model} failed: {e}");
        shared.complete(&model, epoch, ModelStatus::Downloading, Event::Failed, Some(e.to_string()));
        return;
    }

    let mut interval = tokio::time::interval(shared.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the first immediate tick
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = interval.tick() => {}
        }
        if token.is_cancelled() || !shared.is_live(&model, epoch) {
            return;
        }

        let checked = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            r = shared.backend.is_installed(&model) => r,
        };
        match checked {
            Ok(true) => {
                shared.complete(&model, epoch, ModelStatus::Downloading, Event::PollInstalled, None);
                return;
            }
            Ok(false) => tracing::debug!("Model {model} not ready yet"),
            Err(e) => {
                tracing::warn!("Polling {model} failed: {e}");
                shared.complete(&model, epoch, ModelStatus::Downloading, Event::Failed, Some(e.to_string()));
                return;
            }
        }
    }
}
