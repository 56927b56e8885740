//! Authoritative job state: an in-memory cache fronting a JSON snapshot.
//!
//! Low-frequency, high-importance mutations (job creation, status
//! transitions, recovery, cleanup) are written through immediately. Per-prompt
//! updates only mark the cache dirty and are coalesced by [`WriteBack`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

mod snapshot;

use crate::types::{
    AspectRatio, Job, JobPatch, JobStatus, Prompt, PromptPatch, PromptStatus, ReferenceImage,
};
use crate::write_back::{Snapshot, WriteBack};
use snapshot::SnapshotFile;

pub const SNAPSHOT_FILE_NAME: &str = "jobs.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    pub max_active_jobs: usize,
    pub retention: chrono::Duration,
    pub flush_debounce: Duration,
    pub safety_flush_interval: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            max_active_jobs: 3,
            retention: chrono::Duration::days(7),
            flush_debounce: Duration::from_secs(2),
            safety_flush_interval: Duration::from_secs(30),
        }
    }
}

pub(crate) struct JobState {
    file: SnapshotFile,
    jobs: Mutex<Vec<Job>>,
}

impl JobState {
    fn lock(&self) -> MutexGuard<'_, Vec<Job>> {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Snapshot for JobState {
    fn persist(&self) -> Result<()> {
        let jobs = self.lock().clone();
        self.file.write_jobs(&jobs)
    }

    fn label(&self) -> &str {
        "jobs"
    }
}

#[derive(Clone)]
pub struct JobStore {
    write_back: WriteBack<JobState>,
    settings: StoreSettings,
}

impl JobStore {
    /// Open the store at `path`, restoring from the snapshot or its backup.
    pub fn open(path: PathBuf, settings: StoreSettings) -> Self {
        let file = SnapshotFile::new(path);
        let jobs = file.load_jobs_for_startup();
        let state = Arc::new(JobState {
            file,
            jobs: Mutex::new(jobs),
        });

        Self {
            write_back: WriteBack::new(state, settings.flush_debounce),
            settings,
        }
    }

    pub fn open_in_dir(data_dir: &Path, settings: StoreSettings) -> Self {
        Self::open(data_dir.join(SNAPSHOT_FILE_NAME), settings)
    }

    pub fn snapshot_path(&self) -> &Path {
        self.state().file.path()
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Begin the periodic safety-net flush.
    pub fn start(&self) {
        self.write_back
            .start_safety_net(self.settings.safety_flush_interval);
    }

    /// Stop background timers and write any pending changes.
    pub async fn stop(&self) {
        self.write_back.shutdown().await;
    }

    pub fn flush(&self) -> bool {
        self.write_back.flush_now()
    }

    pub fn flush_count(&self) -> u64 {
        self.write_back.flush_count()
    }

    fn state(&self) -> &JobState {
        self.write_back.target()
    }

    pub fn create_job(
        &self,
        credential: String,
        prompt_texts: Vec<String>,
        aspect_ratio: AspectRatio,
        references: Vec<ReferenceImage>,
    ) -> Job {
        let job = Job::new(credential, prompt_texts, aspect_ratio, references);
        self.state().lock().push(job.clone());
        self.write_back.flush_now();
        info!(job_id = %job.id, total = job.total_count, "Job created");
        job
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.state().lock().iter().find(|job| job.id == id).cloned()
    }

    pub fn list_jobs(&self) -> Vec<Job> {
        self.state().lock().clone()
    }

    /// Merge `patch` into the job. A status change is written immediately,
    /// anything else is debounced.
    pub fn update_job(&self, id: &str, patch: JobPatch) -> Option<Job> {
        let (updated, status_changed) = {
            let mut jobs = self.state().lock();
            let job = jobs.iter_mut().find(|job| job.id == id)?;
            let previous_status = job.status;

            if let Some(status) = patch.status {
                job.status = status;
            }
            if let Some(started_at) = patch.started_at {
                job.started_at = Some(started_at);
            }
            if let Some(completed_at) = patch.completed_at {
                job.completed_at = Some(completed_at);
            }
            if let Some(error) = patch.error {
                job.error = Some(error);
            }

            (job.clone(), previous_status != job.status)
        };

        if status_changed {
            debug!(job_id = %id, status = %updated.status, "Job status changed");
            self.write_back.flush_now();
        } else {
            self.write_back.mark_dirty();
        }
        Some(updated)
    }

    /// Merge `patch` into one prompt and recompute the job's rollups. Always
    /// debounced: this is the high-frequency path.
    pub fn update_prompt(&self, job_id: &str, prompt_id: &str, patch: PromptPatch) -> Option<Job> {
        let updated = {
            let mut jobs = self.state().lock();
            let job = jobs.iter_mut().find(|job| job.id == job_id)?;
            let prompt = job.prompts.iter_mut().find(|prompt| prompt.id == prompt_id)?;
            patch.apply(prompt);
            job.recompute_counters();
            job.clone()
        };

        self.write_back.mark_dirty();
        Some(updated)
    }

    pub fn next_pending_job(&self) -> Option<Job> {
        self.state()
            .lock()
            .iter()
            .find(|job| job.status == JobStatus::Pending)
            .cloned()
    }

    pub fn next_pending_prompt(&self, job_id: &str) -> Option<Prompt> {
        self.state()
            .lock()
            .iter()
            .find(|job| job.id == job_id)?
            .prompts
            .iter()
            .find(|prompt| prompt.status == PromptStatus::Pending)
            .cloned()
    }

    pub fn active_job_count(&self) -> usize {
        self.state()
            .lock()
            .iter()
            .filter(|job| job.status.is_active())
            .count()
    }

    pub fn can_admit_new_job(&self) -> bool {
        self.active_job_count() < self.settings.max_active_jobs
    }

    pub fn processing_job_count(&self) -> usize {
        self.state()
            .lock()
            .iter()
            .filter(|job| job.status == JobStatus::Processing)
            .count()
    }

    /// Whether the worker may move another pending job into `processing`.
    /// Pending jobs already admitted through [`Self::can_admit_new_job`] do
    /// not count against the ceiling here.
    pub fn can_start_job(&self) -> bool {
        self.processing_job_count() < self.settings.max_active_jobs
    }

    /// Drop completed/failed jobs older than the retention window.
    pub fn cleanup_old_jobs(&self) -> usize {
        self.cleanup_old_jobs_at(Utc::now())
    }

    pub fn cleanup_old_jobs_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.settings.retention;
        let removed = {
            let mut jobs = self.state().lock();
            let before = jobs.len();
            jobs.retain(|job| {
                let expirable = matches!(job.status, JobStatus::Completed | JobStatus::Failed);
                let finished_at = job.completed_at.unwrap_or(job.created_at);
                !(expirable && finished_at < cutoff)
            });
            before - jobs.len()
        };

        if removed > 0 {
            info!(removed, "Removed expired jobs");
            self.write_back.flush_now();
        }
        removed
    }

    /// Reset work interrupted by a crash: `processing` jobs and prompts go
    /// back to `pending`. Returns the number of records touched.
    pub fn recover_interrupted(&self) -> usize {
        let touched = {
            let mut jobs = self.state().lock();
            let mut touched = 0;
            for job in jobs.iter_mut() {
                if job.status == JobStatus::Processing {
                    job.status = JobStatus::Pending;
                    touched += 1;
                }
                for prompt in job.prompts.iter_mut() {
                    if prompt.status == PromptStatus::Processing {
                        prompt.status = PromptStatus::Pending;
                        touched += 1;
                    }
                }
            }
            touched
        };

        if touched > 0 {
            info!(touched, "Reset interrupted jobs and prompts to pending");
            self.write_back.flush_now();
        }
        touched
    }

    /// Mark an active job cancelled. Returns `None` for unknown ids and the
    /// unchanged job when it is already terminal.
    pub fn cancel_job(&self, id: &str) -> Option<Job> {
        let job = self.get_job(id)?;
        if job.status.is_terminal() {
            return Some(job);
        }

        self.update_job(
            id,
            JobPatch::status(JobStatus::Cancelled)
                .completed_now()
                .with_error("cancelled by request"),
        )
    }

    /// Move every `error` prompt back to `pending` and requeue the job.
    /// Returns the updated job and how many prompts were reset.
    pub fn retry_errors(&self, id: &str) -> Option<(Job, usize)> {
        let (job, reset) = {
            let mut jobs = self.state().lock();
            let job = jobs.iter_mut().find(|job| job.id == id)?;

            let mut reset = 0;
            for prompt in job.prompts.iter_mut() {
                if prompt.status == PromptStatus::Error {
                    PromptPatch {
                        status: Some(PromptStatus::Pending),
                        ..PromptPatch::default()
                    }
                    .apply(prompt);
                    reset += 1;
                }
            }

            if reset > 0 && job.status != JobStatus::Processing {
                job.status = JobStatus::Pending;
                job.completed_at = None;
                job.error = None;
            }
            job.recompute_counters();
            (job.clone(), reset)
        };

        if reset > 0 {
            info!(job_id = %id, reset, "Requeued failed prompts");
            self.write_back.flush_now();
        }
        Some((job, reset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store(dir: &Path) -> JobStore {
        JobStore::open_in_dir(dir, StoreSettings::default())
    }

    fn prompts(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|text| text.to_string()).collect()
    }

    #[tokio::test]
    async fn create_job_is_flushed_immediately() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());

        let job = store.create_job("cookie".into(), prompts(&["a", "b"]), AspectRatio::Square, vec![]);
        assert_eq!(store.flush_count(), 1);

        let reopened = open_store(dir.path());
        let restored = reopened.get_job(&job.id).expect("restored job");
        assert_eq!(restored.total_count, 2);
        assert_eq!(restored.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn update_prompt_recomputes_rollups() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let job = store.create_job("c".into(), prompts(&["a", "b", "c", "d"]), AspectRatio::Square, vec![]);

        let first = job.prompts[0].id.clone();
        let second = job.prompts[1].id.clone();
        store.update_prompt(&job.id, &first, PromptPatch::completed("/images/x.png".into(), None, None));
        let updated = store
            .update_prompt(&job.id, &second, PromptPatch::failed("boom"))
            .expect("job exists");

        assert_eq!(updated.completed_count, 1);
        assert_eq!(updated.failed_count, 1);
        assert_eq!(updated.total_count, 4);
        assert_eq!(updated.progress, 50);
        assert!(updated.completed_count + updated.failed_count <= updated.total_count);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_prompt_updates_coalesce_but_status_changes_flush() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let job = store.create_job("c".into(), prompts(&["a"]), AspectRatio::Square, vec![]);
        let prompt_id = job.prompts[0].id.clone();
        let baseline = store.flush_count();

        for attempt in 0..10 {
            store.update_prompt(&job.id, &prompt_id, PromptPatch::failed(format!("attempt {attempt}")));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(store.flush_count(), baseline);

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(store.flush_count(), baseline + 1);

        store.update_job(&job.id, JobPatch::status(JobStatus::Processing));
        assert_eq!(store.flush_count(), baseline + 2);

        store.update_job(&job.id, JobPatch::default().with_error("note"));
        assert_eq!(store.flush_count(), baseline + 2);
    }

    #[tokio::test]
    async fn next_pending_respects_insertion_order() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let first = store.create_job("c".into(), prompts(&["a", "b"]), AspectRatio::Square, vec![]);
        let second = store.create_job("c".into(), prompts(&["c"]), AspectRatio::Square, vec![]);

        assert_eq!(store.next_pending_job().unwrap().id, first.id);
        store.update_job(&first.id, JobPatch::status(JobStatus::Processing));
        assert_eq!(store.next_pending_job().unwrap().id, second.id);

        let head = store.next_pending_prompt(&first.id).unwrap();
        assert_eq!(head.text, "a");
        store.update_prompt(&first.id, &head.id, PromptPatch::processing());
        assert_eq!(store.next_pending_prompt(&first.id).unwrap().text, "b");
    }

    #[tokio::test]
    async fn admission_follows_active_job_ceiling() {
        let dir = tempdir().expect("tempdir");
        let settings = StoreSettings {
            max_active_jobs: 2,
            ..StoreSettings::default()
        };
        let store = JobStore::open_in_dir(dir.path(), settings);

        let first = store.create_job("c".into(), prompts(&["a"]), AspectRatio::Square, vec![]);
        assert!(store.can_admit_new_job());
        store.create_job("c".into(), prompts(&["b"]), AspectRatio::Square, vec![]);
        assert_eq!(store.active_job_count(), 2);
        assert!(!store.can_admit_new_job());

        store.update_job(&first.id, JobPatch::status(JobStatus::Completed).completed_now());
        assert!(store.can_admit_new_job());
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_terminal_jobs() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let now = Utc::now();

        let old = store.create_job("c".into(), prompts(&["old"]), AspectRatio::Square, vec![]);
        let recent = store.create_job("c".into(), prompts(&["recent"]), AspectRatio::Square, vec![]);
        let pending = store.create_job("c".into(), prompts(&["pending"]), AspectRatio::Square, vec![]);

        store.update_job(&old.id, JobPatch {
            status: Some(JobStatus::Completed),
            completed_at: Some(now - chrono::Duration::days(8)),
            ..JobPatch::default()
        });
        store.update_job(&recent.id, JobPatch {
            status: Some(JobStatus::Completed),
            completed_at: Some(now - chrono::Duration::hours(1)),
            ..JobPatch::default()
        });

        let removed = store.cleanup_old_jobs_at(now);
        assert_eq!(removed, 1);
        assert!(store.get_job(&old.id).is_none());
        assert!(store.get_job(&recent.id).is_some());
        assert!(store.get_job(&pending.id).is_some());
    }

    #[tokio::test]
    async fn cleanup_falls_back_to_creation_timestamp() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let job = store.create_job("c".into(), prompts(&["x"]), AspectRatio::Square, vec![]);
        store.update_job(&job.id, JobPatch::status(JobStatus::Failed));

        assert_eq!(store.cleanup_old_jobs_at(Utc::now()), 0);
        assert_eq!(
            store.cleanup_old_jobs_at(Utc::now() + chrono::Duration::days(8)),
            1
        );
    }

    #[tokio::test]
    async fn recovery_resets_only_processing_records() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let job = store.create_job("c".into(), prompts(&["a", "b", "c"]), AspectRatio::Square, vec![]);
        store.update_job(&job.id, JobPatch::status(JobStatus::Processing).started_now());
        store.update_prompt(&job.id, &job.prompts[0].id, PromptPatch::completed("/images/a.png".into(), Some(1), None));
        store.update_prompt(&job.id, &job.prompts[1].id, PromptPatch::processing());
        store.flush();

        let before = open_store(dir.path()).get_job(&job.id).unwrap();
        let reopened = open_store(dir.path());
        assert_eq!(reopened.recover_interrupted(), 2);

        let after = reopened.get_job(&job.id).unwrap();
        assert_eq!(after.status, JobStatus::Pending);
        assert_eq!(after.prompts[0], before.prompts[0]);
        assert_eq!(after.prompts[1].status, PromptStatus::Pending);
        assert_eq!(after.prompts[1].text, before.prompts[1].text);
        assert_eq!(after.prompts[2], before.prompts[2]);
        assert_eq!(after.started_at, before.started_at);
        assert_eq!(after.completed_count, before.completed_count);

        let persisted = open_store(dir.path()).get_job(&job.id).unwrap();
        assert_eq!(persisted.prompts[1].status, PromptStatus::Pending);
    }

    #[tokio::test]
    async fn retry_errors_requeues_failed_prompts() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let job = store.create_job("c".into(), prompts(&["1", "2", "3", "4"]), AspectRatio::Square, vec![]);
        let ids: Vec<String> = job.prompts.iter().map(|p| p.id.clone()).collect();

        store.update_prompt(&job.id, &ids[0], PromptPatch::completed("/a".into(), None, None));
        store.update_prompt(&job.id, &ids[1], PromptPatch::failed("e1"));
        store.update_prompt(&job.id, &ids[2], PromptPatch::failed("e2"));
        store.update_prompt(&job.id, &ids[3], PromptPatch::completed("/d".into(), None, None));
        store.update_job(&job.id, JobPatch::status(JobStatus::Failed).completed_now());

        let (retried, reset) = store.retry_errors(&job.id).unwrap();
        assert_eq!(reset, 2);
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.completed_count, 2);
        assert_eq!(retried.failed_count, 0);
        assert!(retried.completed_at.is_none());
        for index in [1, 2] {
            assert_eq!(retried.prompts[index].status, PromptStatus::Pending);
            assert!(retried.prompts[index].error.is_none());
        }
    }

    #[tokio::test]
    async fn cancel_leaves_terminal_jobs_untouched() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let job = store.create_job("c".into(), prompts(&["a"]), AspectRatio::Square, vec![]);

        let cancelled = store.cancel_job(&job.id).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());

        let again = store.cancel_job(&job.id).unwrap();
        assert_eq!(again, cancelled);
        assert!(store.cancel_job("missing").is_none());
    }

    #[tokio::test]
    async fn stop_writes_pending_changes() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path());
        let job = store.create_job("c".into(), prompts(&["a"]), AspectRatio::Square, vec![]);
        store.update_prompt(&job.id, &job.prompts[0].id, PromptPatch::failed("late"));
        store.stop().await;

        let reopened = open_store(dir.path());
        assert_eq!(
            reopened.get_job(&job.id).unwrap().prompts[0].error.as_deref(),
            Some("late")
        );
    }
}
