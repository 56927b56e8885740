use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of reference images accepted per category for one job.
pub const MAX_REFERENCES_PER_CATEGORY: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AspectRatio {
    #[default]
    #[serde(alias = "IMAGE_ASPECT_RATIO_SQUARE", alias = "square")]
    Square,
    #[serde(alias = "IMAGE_ASPECT_RATIO_PORTRAIT", alias = "portrait")]
    Portrait,
    #[serde(alias = "IMAGE_ASPECT_RATIO_LANDSCAPE", alias = "landscape")]
    Landscape,
}

impl AspectRatio {
    /// Upstream wire name for the ratio.
    pub fn api_name(self) -> &'static str {
        match self {
            Self::Square => "IMAGE_ASPECT_RATIO_SQUARE",
            Self::Portrait => "IMAGE_ASPECT_RATIO_PORTRAIT",
            Self::Landscape => "IMAGE_ASPECT_RATIO_LANDSCAPE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_uppercase();
        let normalized = normalized
            .strip_prefix("IMAGE_ASPECT_RATIO_")
            .unwrap_or(normalized.as_str());
        match normalized {
            "SQUARE" => Some(Self::Square),
            "PORTRAIT" => Some(Self::Portrait),
            "LANDSCAPE" => Some(Self::Landscape),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferenceCategory {
    #[serde(alias = "subject", alias = "MEDIA_CATEGORY_SUBJECT")]
    Subject,
    #[serde(alias = "style", alias = "MEDIA_CATEGORY_STYLE")]
    Style,
    #[serde(alias = "scene", alias = "MEDIA_CATEGORY_SCENE")]
    Scene,
}

impl ReferenceCategory {
    pub fn api_name(self) -> &'static str {
        match self {
            Self::Subject => "MEDIA_CATEGORY_SUBJECT",
            Self::Style => "MEDIA_CATEGORY_STYLE",
            Self::Scene => "MEDIA_CATEGORY_SCENE",
        }
    }
}

/// Conditioning image attached to every prompt of a job. `base64` holds the
/// encoded image bytes exactly as received over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceImage {
    pub category: ReferenceCategory,
    pub base64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

pub fn validate_references(references: &[ReferenceImage]) -> Result<(), String> {
    for category in [
        ReferenceCategory::Subject,
        ReferenceCategory::Style,
        ReferenceCategory::Scene,
    ] {
        let count = references
            .iter()
            .filter(|reference| reference.category == category)
            .count();
        if count > MAX_REFERENCES_PER_CATEGORY {
            return Err(format!(
                "at most {MAX_REFERENCES_PER_CATEGORY} {} references are allowed, got {count}",
                category.api_name()
            ));
        }
    }

    if references
        .iter()
        .any(|reference| reference.base64.trim().is_empty())
    {
        return Err("reference image data must not be empty".to_string());
    }

    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    pub id: String,
    pub text: String,
    pub status: PromptStatus,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub media_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Prompt {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            status: PromptStatus::Pending,
            image: None,
            seed: None,
            media_id: None,
            error: None,
        }
    }
}

/// One generation batch. `credential` is the opaque session cookie and is
/// persisted so interrupted jobs can resume after a restart; it never leaves
/// the process through API responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    #[serde(rename = "cookie")]
    pub credential: String,
    pub aspect_ratio: AspectRatio,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub prompts: Vec<Prompt>,
    #[serde(default)]
    pub completed_count: usize,
    #[serde(default)]
    pub failed_count: usize,
    #[serde(default)]
    pub total_count: usize,
    #[serde(default)]
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<ReferenceImage>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Job {
    pub fn new(
        credential: String,
        prompt_texts: Vec<String>,
        aspect_ratio: AspectRatio,
        references: Vec<ReferenceImage>,
    ) -> Self {
        let prompts: Vec<Prompt> = prompt_texts.into_iter().map(Prompt::new).collect();
        let total_count = prompts.len();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            credential,
            aspect_ratio,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            prompts,
            completed_count: 0,
            failed_count: 0,
            total_count,
            progress: 0,
            references,
            error: None,
        }
    }

    /// Recompute rollup counters from prompt states. `total_count` is fixed at
    /// creation and is not touched here.
    pub fn recompute_counters(&mut self) {
        self.completed_count = self
            .prompts
            .iter()
            .filter(|prompt| prompt.status == PromptStatus::Completed)
            .count();
        self.failed_count = self
            .prompts
            .iter()
            .filter(|prompt| prompt.status == PromptStatus::Error)
            .count();
        self.progress = progress_percent(self.completed_count + self.failed_count, self.total_count);
    }

    pub fn prompt(&self, prompt_id: &str) -> Option<&Prompt> {
        self.prompts.iter().find(|prompt| prompt.id == prompt_id)
    }

    pub fn has_pending_prompt(&self) -> bool {
        self.prompts
            .iter()
            .any(|prompt| prompt.status == PromptStatus::Pending)
    }
}

pub fn progress_percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let percent = (done.min(total) as f64 / total as f64 * 100.0).round();
    percent.clamp(0.0, 100.0) as u8
}

/// Field-wise merge applied by the store to a job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn started_now(mut self) -> Self {
        self.started_at = Some(Utc::now());
        self
    }

    pub fn completed_now(mut self) -> Self {
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Field-wise merge applied by the store to a single prompt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptPatch {
    pub status: Option<PromptStatus>,
    pub image: Option<String>,
    pub seed: Option<i64>,
    pub media_id: Option<String>,
    pub error: Option<String>,
}

impl PromptPatch {
    pub fn processing() -> Self {
        Self {
            status: Some(PromptStatus::Processing),
            ..Self::default()
        }
    }

    pub fn completed(image: String, seed: Option<i64>, media_id: Option<String>) -> Self {
        Self {
            status: Some(PromptStatus::Completed),
            image: Some(image),
            seed,
            media_id,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(PromptStatus::Error),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub(crate) fn apply(self, prompt: &mut Prompt) {
        if let Some(status) = self.status {
            prompt.status = status;
            if matches!(status, PromptStatus::Completed | PromptStatus::Pending) {
                prompt.error = None;
            }
        }
        if let Some(image) = self.image {
            prompt.image = Some(image);
        }
        if let Some(seed) = self.seed {
            prompt.seed = Some(seed);
        }
        if let Some(media_id) = self.media_id {
            prompt.media_id = Some(media_id);
        }
        if let Some(error) = self.error {
            prompt.error = Some(error);
        }
    }
}

/// Push notification emitted while a job drains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    PromptStarted {
        job_id: String,
        prompt_id: String,
        index: usize,
    },
    PromptCompleted {
        job_id: String,
        prompt_id: String,
        image: String,
        seed: Option<i64>,
    },
    PromptError {
        job_id: String,
        prompt_id: String,
        error: String,
    },
    JobFinished {
        job_id: String,
        status: JobStatus,
        completed_count: usize,
        failed_count: usize,
        total_count: usize,
        error: Option<String>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::PromptStarted { job_id, .. }
            | Self::PromptCompleted { job_id, .. }
            | Self::PromptError { job_id, .. }
            | Self::JobFinished { job_id, .. } => job_id,
        }
    }

    pub fn finished(job: &Job) -> Self {
        Self::JobFinished {
            job_id: job.id.clone(),
            status: job.status,
            completed_count: job.completed_count,
            failed_count: job.failed_count,
            total_count: job.total_count,
            error: job.error.clone(),
        }
    }
}
