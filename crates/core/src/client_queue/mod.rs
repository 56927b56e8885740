//! Client-driven queue for the stateless proxy deployment.
//!
//! The caller keeps the whole job list locally and walks it one item at a time
//! against `POST /api/generate`. Item metadata is snapshotted through a
//! debounced [`WriteBack`]; binary results live in a [`ResultStore`] keyed by
//! item id and are reattached on restore.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

pub mod results;
pub mod transport;

use crate::api::{AnimateRequest, GenerateRequest};
use crate::backoff::{BackoffController, BackoffPolicy};
use crate::generation::encode_base64_media;
use crate::types::{AspectRatio, PromptStatus, ReferenceImage};
use crate::write_back::{Snapshot, WriteBack};
pub use results::ResultStore;
pub use transport::{GenerateTransport, GeneratedImage, HttpTransport};

pub const METADATA_FILE_NAME: &str = "queue.json";
pub const RESULTS_DIR_NAME: &str = "results";

const EVENT_CAPACITY: usize = 128;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    /// Full prompt text, style prefix already applied.
    pub prompt: String,
    pub status: PromptStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub seed: Option<i64>,
    /// Generated bytes, in memory only.
    #[serde(skip)]
    pub result: Option<Arc<Vec<u8>>>,
}

impl QueueItem {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            status: PromptStatus::Pending,
            error: None,
            seed: None,
            result: None,
        }
    }

    /// Expand prompt lines into a flat list: each non-blank line repeated
    /// `repeat` times in a row, prefixed with `"<style>, "` when a style is
    /// given.
    pub fn build<I, S>(lines: I, repeat: usize, style_prefix: Option<&str>) -> Vec<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let style = style_prefix.map(str::trim).filter(|style| !style.is_empty());
        let mut items = Vec::new();
        for line in lines {
            let line = line.as_ref().trim();
            if line.is_empty() {
                continue;
            }
            let prompt = match style {
                Some(style) => format!("{style}, {line}"),
                None => line.to_string(),
            };
            for _ in 0..repeat.max(1) {
                items.push(Self::new(prompt.clone()));
            }
        }
        items
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub error: usize,
}

impl QueueCounts {
    fn tally(items: &[QueueItem]) -> Self {
        let mut counts = Self {
            total: items.len(),
            ..Self::default()
        };
        for item in items {
            match item.status {
                PromptStatus::Pending => counts.pending += 1,
                PromptStatus::Processing => counts.processing += 1,
                PromptStatus::Completed => counts.completed += 1,
                PromptStatus::Error => counts.error += 1,
            }
        }
        counts
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Drained,
    Paused,
    Cancelled,
    /// Too many consecutive failures; the queue paused itself.
    ThresholdReached,
    /// The proxy rejected the credential; the queue paused itself.
    AuthRequired,
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    ItemStarted { id: String, index: usize },
    ItemCompleted { id: String, seed: Option<i64> },
    ItemError { id: String, error: String },
    Stopped { outcome: RunOutcome, counts: QueueCounts },
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub backoff: BackoffPolicy,
    pub persist_debounce: Duration,
    pub aspect_ratio: AspectRatio,
    pub references: Vec<ReferenceImage>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::client(),
            persist_debounce: Duration::from_millis(500),
            aspect_ratio: AspectRatio::Square,
            references: Vec::new(),
        }
    }
}

#[derive(Serialize)]
struct QueueDocumentRef<'a> {
    items: &'a [QueueItem],
}

#[derive(Deserialize)]
struct QueueDocument {
    #[serde(default)]
    items: Vec<QueueItem>,
}

struct QueueMetadata {
    path: PathBuf,
    items: Mutex<Vec<QueueItem>>,
}

impl QueueMetadata {
    fn lock(&self) -> MutexGuard<'_, Vec<QueueItem>> {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Snapshot for QueueMetadata {
    fn persist(&self) -> Result<()> {
        let encoded = {
            let items = self.lock();
            serde_json::to_vec_pretty(&QueueDocumentRef { items: &items })
                .context("failed to serialize queue metadata")?
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create queue directory: {}", parent.display())
            })?;
        }
        fs::write(&self.path, encoded)
            .with_context(|| format!("failed to write queue metadata: {}", self.path.display()))
    }

    fn label(&self) -> &str {
        "queue"
    }
}

fn load_items(path: &Path) -> Vec<QueueItem> {
    if !path.exists() {
        return Vec::new();
    }
    let parsed = fs::read_to_string(path)
        .with_context(|| format!("failed to read queue metadata: {}", path.display()))
        .and_then(|raw| {
            serde_json::from_str::<QueueDocument>(&raw)
                .with_context(|| format!("failed to parse queue metadata: {}", path.display()))
        });
    match parsed {
        Ok(document) => document.items,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Discarding unreadable queue metadata");
            Vec::new()
        }
    }
}

#[derive(Clone)]
pub struct ClientQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    credential: String,
    transport: Arc<dyn GenerateTransport>,
    results: ResultStore,
    metadata: WriteBack<QueueMetadata>,
    backoff: Mutex<BackoffController>,
    settings: QueueSettings,
    running: AtomicBool,
    paused: AtomicBool,
    cancel_requested: AtomicBool,
    wake: Notify,
    events: broadcast::Sender<QueueEvent>,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ClientQueue {
    /// Open the queue stored in `dir`, downgrading interrupted items to
    /// `pending` and reattaching stored results.
    pub async fn restore(
        dir: &Path,
        credential: String,
        transport: Arc<dyn GenerateTransport>,
        settings: QueueSettings,
    ) -> Result<Self> {
        let path = dir.join(METADATA_FILE_NAME);
        let results = ResultStore::new(dir.join(RESULTS_DIR_NAME));

        let mut items = load_items(&path);
        let mut downgraded = 0usize;
        for item in items.iter_mut() {
            if item.status == PromptStatus::Processing {
                item.status = PromptStatus::Pending;
                downgraded += 1;
            }
            if item.status == PromptStatus::Completed {
                item.result = results.load_image(&item.id).await?.map(Arc::new);
            }
        }

        let metadata = WriteBack::new(
            Arc::new(QueueMetadata {
                path,
                items: Mutex::new(items),
            }),
            settings.persist_debounce,
        );
        if downgraded > 0 {
            metadata.mark_dirty();
        }

        let queue = Self {
            inner: Arc::new(QueueInner {
                credential,
                transport,
                results,
                metadata,
                backoff: Mutex::new(BackoffController::new(settings.backoff)),
                settings,
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                cancel_requested: AtomicBool::new(false),
                wake: Notify::new(),
                events: broadcast::channel(EVENT_CAPACITY).0,
            }),
        };
        let counts = queue.counts();
        info!(
            total = counts.total,
            completed = counts.completed,
            downgraded,
            "Queue restored"
        );
        Ok(queue)
    }

    fn items_lock(&self) -> MutexGuard<'_, Vec<QueueItem>> {
        self.inner.metadata.target().lock()
    }

    fn backoff(&self) -> MutexGuard<'_, BackoffController> {
        self.inner
            .backoff
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append prompts to the end of the queue. Returns how many items were
    /// added.
    pub fn load_prompts<I, S>(&self, lines: I, repeat: usize, style_prefix: Option<&str>) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let built = QueueItem::build(lines, repeat, style_prefix);
        let added = built.len();
        self.items_lock().extend(built);
        self.inner.metadata.mark_dirty();
        added
    }

    pub fn items(&self) -> Vec<QueueItem> {
        self.items_lock().clone()
    }

    pub fn item(&self, id: &str) -> Option<QueueItem> {
        self.items_lock().iter().find(|item| item.id == id).cloned()
    }

    pub fn counts(&self) -> QueueCounts {
        QueueCounts::tally(&self.items_lock())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    pub fn failure_streak(&self) -> u32 {
        self.backoff().streak()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    pub fn results(&self) -> &ResultStore {
        &self.inner.results
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Spawn [`Self::run`] unless a run is already in progress.
    pub fn start(&self) -> bool {
        if self.is_running() {
            return false;
        }
        let queue = self.clone();
        tokio::spawn(async move { queue.run().await });
        true
    }

    /// Stop after the in-flight item. Item states are left as they are.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Release);
        self.inner.wake.notify_waiters();
        info!("Queue pause requested");
    }

    /// Clear the pause and the failure streak, then continue.
    pub fn resume(&self) -> bool {
        self.inner.paused.store(false, Ordering::Release);
        self.backoff().reset();
        self.start()
    }

    /// Halt the loop and put interrupted items back to `pending`. The queue
    /// can be started again.
    pub fn cancel(&self) {
        if self.is_running() {
            self.inner.cancel_requested.store(true, Ordering::Release);
            self.inner.wake.notify_waiters();
        } else {
            self.reset_in_flight();
        }
        info!("Queue cancel requested");
    }

    /// Requeue every failed item, clear the streak and restart if idle.
    pub fn retry_errors(&self) -> usize {
        let reset = {
            let mut items = self.items_lock();
            let mut reset = 0;
            for item in items.iter_mut().filter(|item| item.status == PromptStatus::Error) {
                item.status = PromptStatus::Pending;
                item.error = None;
                reset += 1;
            }
            reset
        };

        self.backoff().reset();
        self.inner.paused.store(false, Ordering::Release);
        if reset > 0 {
            self.inner.metadata.mark_dirty();
            self.start();
        }
        info!(reset, "Requeued failed items");
        reset
    }

    /// Remove one item, its stored result and its contribution to the
    /// counts.
    pub async fn delete_item(&self, id: &str) -> Result<bool> {
        let removed = {
            let mut items = self.items_lock();
            let before = items.len();
            items.retain(|item| item.id != id);
            before != items.len()
        };
        if !removed {
            return Ok(false);
        }
        self.inner.metadata.mark_dirty();
        self.inner.results.remove(id).await?;
        debug!(item_id = id, "Queue item deleted");
        Ok(true)
    }

    /// Write pending metadata and stop the debounce timer.
    pub async fn close(&self) {
        self.inner.metadata.shutdown().await;
    }

    /// Drain pending items until the queue is empty, paused, cancelled or
    /// blocked by failures.
    pub async fn run(&self) -> RunOutcome {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return RunOutcome::AlreadyRunning;
        }
        let _guard = RunningGuard(&self.inner.running);
        self.inner.cancel_requested.store(false, Ordering::Release);

        let outcome = self.drain().await;
        let counts = self.counts();
        info!(
            ?outcome,
            completed = counts.completed,
            failed = counts.error,
            pending = counts.pending,
            "Queue stopped"
        );
        self.emit(QueueEvent::Stopped { outcome, counts });
        outcome
    }

    async fn drain(&self) -> RunOutcome {
        loop {
            if self.inner.cancel_requested.swap(false, Ordering::AcqRel) {
                self.reset_in_flight();
                return RunOutcome::Cancelled;
            }
            if self.is_paused() {
                return RunOutcome::Paused;
            }
            if self.backoff().should_abort() {
                self.inner.paused.store(true, Ordering::Release);
                warn!(
                    streak = self.failure_streak(),
                    "Queue paused after repeated failures"
                );
                return RunOutcome::ThresholdReached;
            }

            let Some((index, id, prompt)) = self.claim_next() else {
                return RunOutcome::Drained;
            };
            self.emit(QueueEvent::ItemStarted {
                id: id.clone(),
                index,
            });

            let request = GenerateRequest {
                cookie: self.inner.credential.clone(),
                prompt,
                aspect_ratio: self.inner.settings.aspect_ratio,
                references: self.inner.settings.references.clone(),
            };
            match self.inner.transport.generate(&request).await {
                Ok(image) => self.complete_item(&id, image).await,
                Err(err) if err.is_auth() => {
                    let message = format!("{err}; re-validate the session cookie");
                    self.fail_item(&id, message);
                    self.inner.paused.store(true, Ordering::Release);
                    return RunOutcome::AuthRequired;
                }
                Err(err) => self.fail_item(&id, err.to_string()),
            }

            if self.counts().pending > 0 && !self.backoff().should_abort() {
                let delay = self.backoff().current_delay();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.inner.wake.notified() => {}
                }
            }
        }
    }

    fn claim_next(&self) -> Option<(usize, String, String)> {
        let claimed = {
            let mut items = self.items_lock();
            let (index, item) = items
                .iter_mut()
                .enumerate()
                .find(|(_, item)| item.status == PromptStatus::Pending)?;
            item.status = PromptStatus::Processing;
            (index, item.id.clone(), item.prompt.clone())
        };
        self.inner.metadata.mark_dirty();
        Some(claimed)
    }

    /// Apply `update` to the item if it still exists.
    fn update_item(&self, id: &str, update: impl FnOnce(&mut QueueItem)) -> bool {
        let found = {
            let mut items = self.items_lock();
            match items.iter_mut().find(|item| item.id == id) {
                Some(item) => {
                    update(item);
                    true
                }
                None => false,
            }
        };
        if found {
            self.inner.metadata.mark_dirty();
        }
        found
    }

    async fn complete_item(&self, id: &str, image: GeneratedImage) {
        self.backoff().record_success();
        if let Err(err) = self.inner.results.save_image(id, &image.bytes).await {
            warn!(item_id = id, error = %format!("{err:#}"), "Failed to store result; keeping it in memory");
        }

        let seed = image.seed;
        let bytes = Arc::new(image.bytes);
        let present = self.update_item(id, |item| {
            item.status = PromptStatus::Completed;
            item.error = None;
            item.seed = seed;
            item.result = Some(bytes);
        });
        if !present {
            // Deleted while in flight.
            let _ = self.inner.results.remove(id).await;
            return;
        }
        self.emit(QueueEvent::ItemCompleted {
            id: id.to_string(),
            seed,
        });
    }

    fn fail_item(&self, id: &str, message: String) {
        let streak = self.backoff().record_failure();
        warn!(item_id = id, streak, error = %message, "Queue item failed");
        let recorded = message.clone();
        if self.update_item(id, |item| {
            item.status = PromptStatus::Error;
            item.error = Some(recorded);
        }) {
            self.emit(QueueEvent::ItemError {
                id: id.to_string(),
                error: message,
            });
        }
    }

    fn reset_in_flight(&self) {
        let reset = {
            let mut items = self.items_lock();
            let mut reset = 0;
            for item in items
                .iter_mut()
                .filter(|item| item.status == PromptStatus::Processing)
            {
                item.status = PromptStatus::Pending;
                reset += 1;
            }
            reset
        };
        if reset > 0 {
            self.inner.metadata.mark_dirty();
        }
    }

    /// Turn a completed landscape item into a video stored as `<id>.mp4` in
    /// the result store.
    pub async fn animate(&self, id: &str, script: &str, model: &str) -> Result<PathBuf> {
        if self.inner.settings.aspect_ratio != AspectRatio::Landscape {
            bail!("only landscape images can be animated");
        }
        let item = self
            .item(id)
            .with_context(|| format!("unknown queue item: {id}"))?;
        if item.status != PromptStatus::Completed {
            bail!("queue item {id} has no completed image");
        }

        let bytes = match item.result {
            Some(bytes) => bytes.to_vec(),
            None => self
                .inner
                .results
                .load_image(id)
                .await?
                .with_context(|| format!("no stored result for queue item {id}"))?,
        };

        let request = AnimateRequest {
            cookie: self.inner.credential.clone(),
            image_base64: encode_base64_media(&bytes),
            image_prompt: item.prompt,
            video_script: script.to_string(),
            model: Some(model.to_string()),
        };
        let video = self
            .inner
            .transport
            .animate(&request)
            .await
            .with_context(|| format!("failed to animate queue item {id}"))?;
        self.inner.results.save_video(id, &video).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::GenerationError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    #[derive(Default)]
    struct ScriptedTransport {
        healthy: AtomicBool,
        unauthorized: AtomicBool,
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedTransport {
        fn healthy() -> Arc<Self> {
            let transport = Self::default();
            transport.healthy.store(true, Ordering::Release);
            Arc::new(transport)
        }

        fn gated(gate: Arc<Notify>) -> Arc<Self> {
            let transport = Self {
                gate: Some(gate),
                ..Self::default()
            };
            transport.healthy.store(true, Ordering::Release);
            Arc::new(transport)
        }
    }

    #[async_trait]
    impl GenerateTransport for ScriptedTransport {
        async fn generate(
            &self,
            request: &GenerateRequest,
        ) -> Result<GeneratedImage, GenerationError> {
            self.calls.fetch_add(1, Ordering::AcqRel);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.unauthorized.load(Ordering::Acquire) {
                return Err(GenerationError::Unauthorized("expired cookie".into()));
            }
            if !self.healthy.load(Ordering::Acquire) && request.prompt.contains("fail") {
                return Err(GenerationError::Http {
                    status: 500,
                    message: "upstream exploded".into(),
                });
            }
            Ok(GeneratedImage {
                bytes: format!("img:{}", request.prompt).into_bytes(),
                seed: Some(7),
                media_id: None,
            })
        }

        async fn animate(&self, request: &AnimateRequest) -> Result<Vec<u8>, GenerationError> {
            Ok(format!("video:{}", request.video_script).into_bytes())
        }
    }

    async fn open(dir: &Path, transport: Arc<ScriptedTransport>) -> ClientQueue {
        ClientQueue::restore(dir, "MOCK".into(), transport, QueueSettings::default())
            .await
            .expect("restore queue")
    }

    async fn wait_for_stop(rx: &mut broadcast::Receiver<QueueEvent>) -> RunOutcome {
        loop {
            if let QueueEvent::Stopped { outcome, .. } = rx.recv().await.expect("event") {
                return outcome;
            }
        }
    }

    #[test]
    fn build_expands_lines_repeat_and_style() {
        let items = QueueItem::build(["cat", "  ", "dog"], 2, Some("anime"));
        let prompts: Vec<_> = items.iter().map(|item| item.prompt.as_str()).collect();
        assert_eq!(prompts, vec!["anime, cat", "anime, cat", "anime, dog", "anime, dog"]);
        assert!(items.iter().all(|item| item.status == PromptStatus::Pending));

        let plain = QueueItem::build(["cat"], 0, Some(" "));
        assert_eq!(plain.len(), 1);
        assert_eq!(plain[0].prompt, "cat");
    }

    #[tokio::test(start_paused = true)]
    async fn run_drains_and_stores_results() {
        let dir = tempdir().expect("tempdir");
        let queue = open(dir.path(), ScriptedTransport::healthy()).await;
        queue.load_prompts(["cat", "dog"], 1, None);

        assert_eq!(queue.run().await, RunOutcome::Drained);
        let counts = queue.counts();
        assert_eq!((counts.completed, counts.error, counts.total), (2, 0, 2));

        for item in queue.items() {
            assert_eq!(item.result.as_deref(), Some(&format!("img:{}", item.prompt).into_bytes()));
            assert!(queue.results().image_path(&item.id).exists());
        }
        queue.close().await;

        let raw = fs::read_to_string(dir.path().join(METADATA_FILE_NAME)).unwrap();
        assert!(!raw.contains("img:"));
        assert!(!raw.contains("\"result\""));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_pause_until_resumed() {
        let dir = tempdir().expect("tempdir");
        let transport = Arc::new(ScriptedTransport::default());
        let queue = open(dir.path(), transport.clone()).await;
        queue.load_prompts(["fail-1", "fail-2", "fail-3", "fail-4", "fail-5", "fail-6"], 1, None);

        let started = tokio::time::Instant::now();
        assert_eq!(queue.run().await, RunOutcome::ThresholdReached);
        assert!(started.elapsed() < Duration::from_secs(100), "{:?}", started.elapsed());
        assert!(queue.is_paused());
        assert_eq!(transport.calls.load(Ordering::Acquire), 5);
        assert_eq!(queue.counts().pending, 1);

        assert_eq!(queue.run().await, RunOutcome::Paused);

        transport.healthy.store(true, Ordering::Release);
        let mut rx = queue.subscribe();
        assert!(queue.resume());
        assert_eq!(wait_for_stop(&mut rx).await, RunOutcome::Drained);
        assert_eq!(queue.counts().completed, 1);
        assert_eq!(queue.counts().error, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn credential_errors_pause_immediately() {
        let dir = tempdir().expect("tempdir");
        let transport = ScriptedTransport::healthy();
        transport.unauthorized.store(true, Ordering::Release);
        let queue = open(dir.path(), transport.clone()).await;
        queue.load_prompts(["a", "b"], 1, None);

        assert_eq!(queue.run().await, RunOutcome::AuthRequired);
        assert!(queue.is_paused());
        let items = queue.items();
        assert_eq!(items[0].status, PromptStatus::Error);
        assert!(items[0].error.as_deref().unwrap().contains("re-validate"));
        assert!(items[0].error.as_deref().unwrap().contains("401"));
        assert_eq!(items[1].status, PromptStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_errors_restarts_the_loop() {
        let dir = tempdir().expect("tempdir");
        let transport = Arc::new(ScriptedTransport::default());
        let queue = open(dir.path(), transport.clone()).await;
        queue.load_prompts(["ok-1", "fail-2", "fail-3", "ok-4"], 1, None);

        assert_eq!(queue.run().await, RunOutcome::Drained);
        assert_eq!(queue.counts().error, 2);

        transport.healthy.store(true, Ordering::Release);
        let mut rx = queue.subscribe();
        assert_eq!(queue.retry_errors(), 2);
        assert_eq!(queue.failure_streak(), 0);
        assert_eq!(wait_for_stop(&mut rx).await, RunOutcome::Drained);

        let counts = queue.counts();
        assert_eq!((counts.completed, counts.error), (4, 0));
        assert!(queue.items().iter().all(|item| item.error.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_takes_effect_at_item_boundary() {
        let dir = tempdir().expect("tempdir");
        let gate = Arc::new(Notify::new());
        let transport = ScriptedTransport::gated(Arc::clone(&gate));
        let queue = open(dir.path(), transport.clone()).await;
        queue.load_prompts(["a", "b", "c"], 1, None);

        let runner = queue.clone();
        let run = tokio::spawn(async move { runner.run().await });
        while transport.calls.load(Ordering::Acquire) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.counts().processing, 1);

        queue.cancel();
        gate.notify_one();
        assert_eq!(run.await.unwrap(), RunOutcome::Cancelled);

        let counts = queue.counts();
        assert_eq!((counts.completed, counts.pending, counts.processing), (1, 2, 0));
        assert_eq!(transport.calls.load(Ordering::Acquire), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restore_downgrades_processing_and_reattaches_results() {
        let dir = tempdir().expect("tempdir");
        let gate = Arc::new(Notify::new());
        let transport = ScriptedTransport::gated(Arc::clone(&gate));
        let queue = open(dir.path(), transport.clone()).await;
        queue.load_prompts(["a", "b"], 1, None);

        let runner = queue.clone();
        let run = tokio::spawn(async move { runner.run().await });
        gate.notify_one();
        while transport.calls.load(Ordering::Acquire) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // First item done, second in flight: simulate a crash by dropping
        // the run and writing the metadata as it stands.
        run.abort();
        queue.close().await;

        let restored = open(dir.path(), ScriptedTransport::healthy()).await;
        let items = restored.items();
        assert_eq!(items[0].status, PromptStatus::Completed);
        assert_eq!(items[0].result.as_deref(), Some(&b"img:a".to_vec()));
        assert_eq!(items[1].status, PromptStatus::Pending);
        assert!(items[1].result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_item_drops_entry_and_result() {
        let dir = tempdir().expect("tempdir");
        let queue = open(dir.path(), ScriptedTransport::healthy()).await;
        queue.load_prompts(["a", "b"], 1, None);
        queue.run().await;

        let first = queue.items()[0].id.clone();
        assert!(queue.delete_item(&first).await.unwrap());
        assert!(!queue.delete_item(&first).await.unwrap());
        assert!(!queue.results().image_path(&first).exists());
        assert_eq!(queue.counts().total, 1);
        assert_eq!(queue.counts().completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn animate_requires_landscape_and_saves_video() {
        let dir = tempdir().expect("tempdir");
        let settings = QueueSettings {
            aspect_ratio: AspectRatio::Landscape,
            ..QueueSettings::default()
        };
        let queue = ClientQueue::restore(dir.path(), "MOCK".into(), ScriptedTransport::healthy(), settings)
            .await
            .unwrap();
        queue.load_prompts(["sunset"], 1, None);
        queue.run().await;

        let id = queue.items()[0].id.clone();
        let path = queue.animate(&id, "pan left", "veo").await.unwrap();
        assert_eq!(fs::read(path).unwrap(), b"video:pan left");

        let square_dir = tempdir().expect("tempdir");
        let square = open(square_dir.path(), ScriptedTransport::healthy()).await;
        square.load_prompts(["cat"], 1, None);
        square.run().await;
        let id = square.items()[0].id.clone();
        assert!(square.animate(&id, "zoom", "veo").await.is_err());
    }
}
