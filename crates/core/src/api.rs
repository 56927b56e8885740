//! JSON bodies shared by the HTTP server and the client-side queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AspectRatio, Job, JobStatus, Prompt, ReferenceImage};

pub const DEFAULT_VIDEO_MODEL: &str = "veo_3_fast";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateCookieRequest {
    #[serde(default)]
    pub cookie: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateCookieResponse {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    #[serde(default)]
    pub cookie: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub aspect_ratio: AspectRatio,
    #[serde(default)]
    pub references: Vec<ReferenceImage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub success: bool,
    /// Base64 image bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GenerateResponse {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimateRequest {
    #[serde(default)]
    pub cookie: String,
    #[serde(default)]
    pub image_base64: String,
    #[serde(default)]
    pub image_prompt: String,
    #[serde(default)]
    pub video_script: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnimateResponse {
    pub success: bool,
    /// Base64 MP4 bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnimateResponse {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            video: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPromptsResponse {
    pub success: bool,
    pub prompts: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    #[serde(default)]
    pub cookie: String,
    #[serde(default)]
    pub prompts: Vec<String>,
    #[serde(default)]
    pub aspect_ratio: AspectRatio,
    #[serde(default)]
    pub references: Vec<ReferenceImage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    pub id: String,
    pub status: JobStatus,
    pub total_count: usize,
    pub created_at: DateTime<Utc>,
}

/// A job as returned over HTTP: everything except the credential and the
/// reference payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub id: String,
    pub status: JobStatus,
    pub aspect_ratio: AspectRatio,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_count: usize,
    pub failed_count: usize,
    pub total_count: usize,
    pub progress: u8,
    pub reference_count: usize,
    pub error: Option<String>,
    pub prompts: Vec<Prompt>,
}

impl From<&Job> for JobResponse {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            status: job.status,
            aspect_ratio: job.aspect_ratio,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            completed_count: job.completed_count,
            failed_count: job.failed_count,
            total_count: job.total_count,
            progress: job.progress,
            reference_count: job.references.len(),
            error: job.error.clone(),
            prompts: job.prompts.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryJobResponse {
    pub job: JobResponse,
    pub reset: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_request_tolerates_missing_fields() {
        let request: GenerateRequest = serde_json::from_str(r#"{"prompt": "cat"}"#).unwrap();
        assert_eq!(request.prompt, "cat");
        assert!(request.cookie.is_empty());
        assert_eq!(request.aspect_ratio, AspectRatio::Square);

        let full: GenerateRequest = serde_json::from_str(
            r#"{"cookie":"MOCK","prompt":"cat","aspectRatio":"IMAGE_ASPECT_RATIO_LANDSCAPE",
                "references":[{"category":"SUBJECT","base64":"aGk="}]}"#,
        )
        .unwrap();
        assert_eq!(full.aspect_ratio, AspectRatio::Landscape);
        assert_eq!(full.references.len(), 1);
    }

    #[test]
    fn failure_response_omits_empty_fields() {
        let json = serde_json::to_value(GenerateResponse::failure("boom")).unwrap();
        assert_eq!(json, serde_json::json!({"success": false, "error": "boom"}));
    }

    #[test]
    fn job_response_never_contains_the_cookie() {
        let job = Job::new("secret-cookie".into(), vec!["a".into()], AspectRatio::Portrait, vec![]);
        let json = serde_json::to_string(&JobResponse::from(&job)).unwrap();
        assert!(!json.contains("secret-cookie"));
        assert!(json.contains("\"totalCount\":1"));
    }
}
