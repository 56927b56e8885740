//! Server-resident job worker.
//!
//! A single-flight polling loop: each tick picks at most one pending job and
//! drains its prompts in order against the pooled generation client, applying
//! backoff between items and aborting the job once the failure streak reaches
//! the threshold.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backoff::{BackoffController, BackoffPolicy};
use crate::events::EventHub;
use crate::generation::pool::{AdapterPool, PoolSettings};
use crate::generation::{ClientFactory, GenerationError, MediaResult};
use crate::store::JobStore;
use crate::types::{Job, JobEvent, JobPatch, JobStatus, Prompt, PromptPatch};

/// URL prefix under which saved media is served.
pub const MEDIA_URL_PREFIX: &str = "/images";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub backoff: BackoffPolicy,
    pub pool: PoolSettings,
    /// Housekeeping runs with probability `1 / cleanup_probability_denominator`
    /// per tick.
    pub cleanup_probability_denominator: u32,
    pub reclaim_every: usize,
    pub idle_adapter_ttl: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            backoff: BackoffPolicy::server(),
            pool: PoolSettings::default(),
            cleanup_probability_denominator: 1_200,
            reclaim_every: 5,
            idle_adapter_ttl: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Another pass was still running.
    Busy,
    AtCapacity,
    Idle,
    Drained { job_id: String, status: JobStatus },
}

#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    store: JobStore,
    pool: tokio::sync::Mutex<AdapterPool>,
    backoff: Mutex<BackoffController>,
    events: EventHub,
    media_dir: PathBuf,
    settings: WorkerSettings,
    busy: AtomicBool,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Worker {
    pub fn new(
        store: JobStore,
        factory: Arc<dyn ClientFactory>,
        events: EventHub,
        media_dir: PathBuf,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                pool: tokio::sync::Mutex::new(AdapterPool::new(factory, settings.pool)),
                backoff: Mutex::new(BackoffController::new(settings.backoff)),
                store,
                events,
                media_dir,
                settings,
                busy: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                handle: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    pub fn media_dir(&self) -> &Path {
        &self.inner.media_dir
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::Acquire)
    }

    pub fn failure_streak(&self) -> u32 {
        self.backoff().streak()
    }

    /// Clear the consecutive-failure streak. Only explicit operator actions
    /// call this; an aborted job leaves the streak in place.
    pub fn reset_backoff(&self) {
        let previous = self.backoff().streak();
        self.backoff().reset();
        if previous > 0 {
            info!(previous_streak = previous, "Failure streak reset");
        }
    }

    fn backoff(&self) -> MutexGuard<'_, BackoffController> {
        self.inner
            .backoff
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Recover interrupted work and spawn the polling loop. A second call is
    /// a no-op.
    pub fn start(&self) {
        let mut slot = self
            .inner
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return;
        }

        let recovered = self.inner.store.recover_interrupted();
        info!(
            recovered,
            poll_interval_ms = self.inner.settings.poll_interval.as_millis() as u64,
            "Worker started"
        );

        let worker = self.clone();
        *slot = Some(tokio::spawn(async move { worker.run_loop().await }));
    }

    /// Cancel the loop and wait for it to exit. An in-flight generation call
    /// is abandoned; its prompt stays `processing` and is recovered on the
    /// next start.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let handle = self
            .inner
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.pool.lock().await.reset();
        info!("Worker stopped");
    }

    async fn run_loop(&self) {
        let mut ticker = tokio::time::interval(self.inner.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.maybe_run_housekeeping().await;

            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                outcome = self.run_pass() => trace!(?outcome, "Worker pass finished"),
            }
        }
    }

    async fn maybe_run_housekeeping(&self) {
        let denominator = self.inner.settings.cleanup_probability_denominator.max(1);
        let hit = rand::rng().random_ratio(1, denominator);
        if hit {
            self.run_housekeeping().await;
        }
    }

    /// Retention cleanup plus pruning of idle pooled clients.
    pub async fn run_housekeeping(&self) -> usize {
        let removed = self.inner.store.cleanup_old_jobs();
        let pruned = self
            .inner
            .pool
            .lock()
            .await
            .prune_idle(self.inner.settings.idle_adapter_ttl);
        debug!(removed, pruned, "Housekeeping finished");
        removed
    }

    /// One scheduling pass: drain at most one pending job.
    pub async fn run_pass(&self) -> PassOutcome {
        if self.inner.busy.swap(true, Ordering::AcqRel) {
            return PassOutcome::Busy;
        }
        let _guard = BusyGuard(&self.inner.busy);

        if !self.inner.store.can_start_job() {
            return PassOutcome::AtCapacity;
        }
        let Some(job) = self.inner.store.next_pending_job() else {
            return PassOutcome::Idle;
        };

        match self.drain_job(&job.id).await {
            Some(status) => PassOutcome::Drained {
                job_id: job.id,
                status,
            },
            None => PassOutcome::Idle,
        }
    }

    /// Process the job's pending prompts in order. Returns the job's status
    /// afterwards, or `None` if the job does not exist.
    ///
    /// A job that is not pending and has nothing left to do is returned
    /// untouched, without events.
    pub async fn drain_job(&self, job_id: &str) -> Option<JobStatus> {
        let store = &self.inner.store;
        let job = store.get_job(job_id)?;

        match job.status {
            JobStatus::Pending => {
                store.update_job(job_id, JobPatch::status(JobStatus::Processing).started_now());
                info!(job_id, total = job.total_count, "Draining job");
            }
            JobStatus::Processing if job.has_pending_prompt() => {}
            _ => return Some(job.status),
        }

        let mut processed = 0usize;
        loop {
            if self.inner.shutdown.is_cancelled() {
                return Some(JobStatus::Processing);
            }

            let live = store.get_job(job_id)?;
            if live.status == JobStatus::Cancelled {
                info!(job_id, "Job cancelled; stopping drain");
                return Some(JobStatus::Cancelled);
            }

            let streak = self.backoff().streak();
            if self.backoff().should_abort() {
                return Some(self.abort_job(job_id, streak));
            }

            let Some(prompt) = store.next_pending_prompt(job_id) else {
                break;
            };
            if self.process_prompt(&live, &prompt).await.is_none() {
                return Some(JobStatus::Processing);
            }

            processed += 1;
            if processed % self.inner.settings.reclaim_every.max(1) == 0 {
                self.reclaim_memory(processed).await;
            }

            // Abort at the top of the loop without waiting out the delay.
            if self.backoff().should_abort() {
                continue;
            }
            if store.next_pending_prompt(job_id).is_some() {
                let delay = self.backoff().current_delay();
                tokio::select! {
                    _ = self.inner.shutdown.cancelled() => return Some(JobStatus::Processing),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        Some(self.finalize_job(job_id))
    }

    /// Generate one prompt and record the outcome. Returns `None` when the
    /// worker is shutting down mid-call.
    async fn process_prompt(&self, job: &Job, prompt: &Prompt) -> Option<()> {
        let store = &self.inner.store;
        let index = job
            .prompts
            .iter()
            .position(|candidate| candidate.id == prompt.id)
            .unwrap_or_default();

        store.update_prompt(&job.id, &prompt.id, PromptPatch::processing());
        self.inner.events.emit(JobEvent::PromptStarted {
            job_id: job.id.clone(),
            prompt_id: prompt.id.clone(),
            index,
        });

        let result = tokio::select! {
            _ = self.inner.shutdown.cancelled() => return None,
            result = self.generate_and_save(job, prompt) => result,
        };

        match result {
            Ok((locator, media)) => {
                store.update_prompt(
                    &job.id,
                    &prompt.id,
                    PromptPatch::completed(locator.clone(), media.seed, media.media_id.clone()),
                );
                self.inner.events.emit(JobEvent::PromptCompleted {
                    job_id: job.id.clone(),
                    prompt_id: prompt.id.clone(),
                    image: locator,
                    seed: media.seed,
                });
                self.backoff().record_success();
                debug!(job_id = %job.id, index, "Prompt completed");
            }
            Err(err) => {
                let message = err.to_string();
                store.update_prompt(&job.id, &prompt.id, PromptPatch::failed(message.clone()));
                self.inner.events.emit(JobEvent::PromptError {
                    job_id: job.id.clone(),
                    prompt_id: prompt.id.clone(),
                    error: message.clone(),
                });
                let streak = self.backoff().record_failure();
                if err.is_stale_context() {
                    self.inner.pool.lock().await.invalidate_context(&job.credential);
                }
                warn!(
                    job_id = %job.id,
                    index,
                    streak,
                    auth = err.is_auth(),
                    error = %message,
                    "Prompt failed"
                );
            }
        }
        Some(())
    }

    async fn generate_and_save(
        &self,
        job: &Job,
        prompt: &Prompt,
    ) -> Result<(String, MediaResult), GenerationError> {
        let lease = {
            let mut pool = self.inner.pool.lock().await;
            pool.acquire(&job.credential, &job.id, &job.references).await?
        };
        let media = lease
            .client
            .generate(&lease.context, &prompt.text, job.aspect_ratio)
            .await?;
        let locator = self
            .save_media(&job.id, &prompt.id, &media)
            .await
            .map_err(|err| GenerationError::Rejected(format!("failed to store media: {err:#}")))?;
        Ok((locator, media))
    }

    /// Write media bytes under `<media_dir>/<job>/<prompt>.<ext>` and return
    /// the URL locator.
    async fn save_media(&self, job_id: &str, prompt_id: &str, media: &MediaResult) -> Result<String> {
        let file_name = format!("{prompt_id}.{}", media.file_extension());
        let dir = self.inner.media_dir.join(job_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create media directory: {}", dir.display()))?;
        let path = dir.join(&file_name);
        tokio::fs::write(&path, &media.bytes)
            .await
            .with_context(|| format!("failed to write media file: {}", path.display()))?;
        Ok(format!("{MEDIA_URL_PREFIX}/{job_id}/{file_name}"))
    }

    async fn reclaim_memory(&self, processed: usize) {
        tokio::task::yield_now().await;
        let pruned = self
            .inner
            .pool
            .lock()
            .await
            .prune_idle(self.inner.settings.idle_adapter_ttl);
        debug!(processed, pruned, "Reclaimed idle generation resources");
    }

    fn abort_job(&self, job_id: &str, streak: u32) -> JobStatus {
        let patch = JobPatch::status(JobStatus::Failed)
            .completed_now()
            .with_error(format!("aborted after {streak} consecutive failures"));
        let Some(job) = self.inner.store.update_job(job_id, patch) else {
            return JobStatus::Failed;
        };
        warn!(
            job_id,
            completed = job.completed_count,
            failed = job.failed_count,
            total = job.total_count,
            "Job aborted after repeated failures"
        );
        self.finish(&job);
        job.status
    }

    fn finalize_job(&self, job_id: &str) -> JobStatus {
        let store = &self.inner.store;
        let Some(job) = store.get_job(job_id) else {
            return JobStatus::Completed;
        };
        if !matches!(job.status, JobStatus::Pending | JobStatus::Processing) {
            return job.status;
        }

        let Some(job) = store.update_job(
            job_id,
            JobPatch::status(JobStatus::Completed).completed_now(),
        ) else {
            return JobStatus::Completed;
        };
        info!(
            job_id,
            completed = job.completed_count,
            failed = job.failed_count,
            total = job.total_count,
            "Job completed"
        );
        self.finish(&job);
        job.status
    }

    fn finish(&self, job: &Job) {
        self.inner.events.emit(JobEvent::finished(job));
        self.inner.events.close(&job.id);
    }
}
