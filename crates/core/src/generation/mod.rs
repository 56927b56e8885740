//! Capability boundary around the external generation service.
//!
//! Everything upstream-specific lives behind [`GenerationClient`]; the worker,
//! the stateless proxy endpoints and the tests only see this trait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;
use tracing::debug;

pub mod http;
pub mod mock;
pub mod pool;

use crate::types::{AspectRatio, ReferenceImage};

/// Credential value that routes to the deterministic mock client.
pub const MOCK_CREDENTIAL: &str = "MOCK";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("401 Unauthorized: {0}")]
    Unauthorized(String),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("request failed: {0}")]
    Transport(String),
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("{0}")]
    Rejected(String),
}

impl GenerationError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Unauthorized(_)) || is_auth_message(&self.to_string())
    }

    pub fn is_stale_context(&self) -> bool {
        is_stale_context_message(&self.to_string())
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        // The configured limit isn't known here; callers that know it map
        // timeouts to `Timeout` themselves.
        if err.is_timeout() {
            return Self::Transport(format!("request timed out: {err}"));
        }
        match err.status() {
            Some(status) if status.as_u16() == 401 => Self::Unauthorized(err.to_string()),
            Some(status) => Self::Http {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => Self::Transport(err.to_string()),
        }
    }
}

/// Whether an error message signals an expired or invalid credential.
pub fn is_auth_message(message: &str) -> bool {
    message.contains("401") || message.contains("Unauthorized")
}

/// Whether an error message suggests the cached generation context is no
/// longer usable: missing project, transient upstream 5xx, or a reset
/// connection.
pub fn is_stale_context_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("project")
        || lowered.contains("not found")
        || lowered.contains("http 404")
        || lowered.contains("http 500")
        || lowered.contains("http 502")
        || lowered.contains("http 503")
        || lowered.contains("econnreset")
        || lowered.contains("connection reset")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialCheck {
    pub valid: bool,
    pub identity: Option<String>,
    pub message: Option<String>,
}

/// Upstream scope (a "project") that prompts are generated in. References
/// are attached when the context is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationContext {
    pub id: String,
    pub label: String,
    pub reference_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaResult {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub prompt: String,
    pub seed: Option<i64>,
    pub media_id: Option<String>,
}

impl MediaResult {
    pub fn file_extension(&self) -> &'static str {
        extension_for_mime(&self.mime_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoResult {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

pub fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "video/mp4" => "mp4",
        _ => "png",
    }
}

#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn validate_credential(&self) -> Result<CredentialCheck, GenerationError>;

    async fn create_context(
        &self,
        label: &str,
        references: &[ReferenceImage],
    ) -> Result<GenerationContext, GenerationError>;

    async fn generate(
        &self,
        context: &GenerationContext,
        prompt: &str,
        aspect_ratio: AspectRatio,
    ) -> Result<MediaResult, GenerationError>;

    async fn destroy_context(&self, context: &GenerationContext) -> Result<(), GenerationError>;

    /// Turn a landscape still into a short video.
    async fn animate(
        &self,
        media: &MediaResult,
        script: &str,
        video_model: &str,
    ) -> Result<VideoResult, GenerationError>;
}

/// Builds a client bound to one credential.
pub trait ClientFactory: Send + Sync {
    fn client_for(&self, credential: &str) -> Result<Arc<dyn GenerationClient>, GenerationError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationSettings {
    pub api_base_url: String,
    pub mock_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            api_base_url: http::DEFAULT_API_BASE_URL.to_string(),
            mock_delay: Duration::from_millis(1_500),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Routes `MOCK` to [`mock::MockGenerationClient`] and everything else to
/// the HTTP client.
#[derive(Debug, Clone)]
pub struct DefaultClientFactory {
    settings: GenerationSettings,
}

impl DefaultClientFactory {
    pub fn new(settings: GenerationSettings) -> Self {
        Self { settings }
    }
}

impl ClientFactory for DefaultClientFactory {
    fn client_for(&self, credential: &str) -> Result<Arc<dyn GenerationClient>, GenerationError> {
        if credential.trim() == MOCK_CREDENTIAL {
            return Ok(Arc::new(mock::MockGenerationClient::new(
                self.settings.mock_delay,
            )));
        }

        let client = http::HttpGenerationClient::new(
            &self.settings.api_base_url,
            credential,
            self.settings.request_timeout,
        )?;
        Ok(Arc::new(client))
    }
}

pub fn encode_base64_media(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode base64 media, accepting an optional `data:<mime>;base64,` prefix.
pub fn decode_base64_media(raw: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let trimmed = raw.trim();
    let payload = match trimmed.split_once(";base64,") {
        Some((prefix, payload)) if prefix.starts_with("data:") => payload,
        _ => trimmed,
    };
    BASE64.decode(payload)
}

/// Best-effort context deletion on a background task. Failures are logged at
/// debug level and never reach the caller.
pub fn spawn_destroy_context(client: Arc<dyn GenerationClient>, context: GenerationContext) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    handle.spawn(async move {
        if let Err(err) = client.destroy_context(&context).await {
            debug!(context_id = %context.id, error = %err, "Ignoring context cleanup failure");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_are_recognised_by_message() {
        assert!(GenerationError::Unauthorized("expired".into()).is_auth());
        assert!(GenerationError::Rejected("upstream said 401".into()).is_auth());
        assert!(!GenerationError::Http {
            status: 500,
            message: "boom".into()
        }
        .is_auth());
    }

    #[test]
    fn stale_context_detection_covers_project_and_transient_errors() {
        assert!(GenerationError::Rejected("Project not found".into()).is_stale_context());
        assert!(GenerationError::Http {
            status: 502,
            message: "bad gateway".into()
        }
        .is_stale_context());
        assert!(GenerationError::Transport("ECONNRESET".into()).is_stale_context());
        assert!(!GenerationError::Rejected("prompt blocked by safety filter".into()).is_stale_context());
    }

    #[test]
    fn mock_credential_routes_to_mock_client() {
        let factory = DefaultClientFactory::new(GenerationSettings {
            mock_delay: Duration::ZERO,
            ..GenerationSettings::default()
        });
        assert!(factory.client_for(MOCK_CREDENTIAL).is_ok());
        assert!(factory.client_for("session=abc").is_ok());
    }

    #[test]
    fn base64_media_accepts_data_urls() {
        let encoded = encode_base64_media(b"png-bytes");
        assert_eq!(decode_base64_media(&encoded).unwrap(), b"png-bytes");
        let data_url = format!("data:image/png;base64,{encoded}");
        assert_eq!(decode_base64_media(&data_url).unwrap(), b"png-bytes");
        assert!(decode_base64_media("%%%").is_err());
    }

    #[tokio::test]
    async fn reqwest_timeout_keeps_a_meaningful_message() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and hold the connection without ever answering.
        let _server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let err = reqwest::Client::new()
            .get(format!("http://{addr}/"))
            .timeout(Duration::from_millis(50))
            .send()
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        let mapped = GenerationError::from(err);
        assert!(matches!(mapped, GenerationError::Transport(_)), "{mapped:?}");
        let message = mapped.to_string();
        assert!(message.contains("timed out"), "{message}");
        assert!(!message.contains("after 0s"), "{message}");
    }

    #[test]
    fn extension_follows_mime_type() {
        assert_eq!(extension_for_mime("image/jpeg"), "jpg");
        assert_eq!(extension_for_mime("image/png"), "png");
        assert_eq!(extension_for_mime("application/octet-stream"), "png");
        assert_eq!(extension_for_mime("video/mp4"), "mp4");
    }
}
