use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use crate::api::{AnimateRequest, AnimateResponse, GenerateRequest, GenerateResponse};
use crate::generation::{decode_base64_media, GenerationError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub seed: Option<i64>,
    pub media_id: Option<String>,
}

/// How the client queue reaches a stateless generation proxy.
#[async_trait]
pub trait GenerateTransport: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> Result<GeneratedImage, GenerationError>;

    /// Returns MP4 bytes.
    async fn animate(&self, request: &AnimateRequest) -> Result<Vec<u8>, GenerationError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: Url,
    client: reqwest::Client,
    image_timeout: Duration,
    video_timeout: Duration,
}

impl HttpTransport {
    pub fn new(
        server_url: &str,
        image_timeout: Duration,
        video_timeout: Duration,
    ) -> Result<Self, GenerationError> {
        let base_url = Url::parse(server_url)
            .map_err(|err| GenerationError::Transport(format!("invalid server URL: {err}")))?;
        Ok(Self {
            base_url,
            client: reqwest::Client::new(),
            image_timeout,
            video_timeout,
        })
    }

    fn url(&self, path: &str) -> Result<Url, GenerationError> {
        self.base_url
            .join(path)
            .map_err(|err| GenerationError::Transport(format!("failed to build URL for {path}: {err}")))
    }

    async fn post<B, R>(&self, path: &str, body: &B, timeout: Duration) -> Result<R, GenerationError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let resp = self
            .client
            .post(self.url(path)?)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    GenerationError::Timeout(timeout)
                } else {
                    GenerationError::from(err)
                }
            })?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<R>()
                .await
                .map_err(|err| GenerationError::InvalidResponse(err.to_string()));
        }

        let body = resp.text().await.unwrap_or_default();
        let message = error_message(&body).unwrap_or_else(|| status.to_string());
        Err(match status {
            StatusCode::UNAUTHORIZED => GenerationError::Unauthorized(message),
            StatusCode::GATEWAY_TIMEOUT => GenerationError::Timeout(timeout),
            _ => GenerationError::Http {
                status: status.as_u16(),
                message,
            },
        })
    }
}

/// Pull `error` out of a JSON error body.
fn error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("error")
        .and_then(|error| error.as_str())
        .map(str::to_string)
}

#[async_trait]
impl GenerateTransport for HttpTransport {
    async fn generate(&self, request: &GenerateRequest) -> Result<GeneratedImage, GenerationError> {
        let response: GenerateResponse = self
            .post("api/generate", request, self.image_timeout)
            .await?;
        if !response.success {
            return Err(GenerationError::Rejected(
                response
                    .error
                    .unwrap_or_else(|| "generation failed".to_string()),
            ));
        }

        let encoded = response
            .image
            .ok_or_else(|| GenerationError::InvalidResponse("response has no image".into()))?;
        let bytes = decode_base64_media(&encoded)
            .map_err(|err| GenerationError::InvalidResponse(format!("image payload: {err}")))?;
        Ok(GeneratedImage {
            bytes,
            seed: response.seed,
            media_id: response.media_id,
        })
    }

    async fn animate(&self, request: &AnimateRequest) -> Result<Vec<u8>, GenerationError> {
        let response: AnimateResponse = self
            .post("api/animate", request, self.video_timeout)
            .await?;
        if !response.success {
            return Err(GenerationError::Rejected(
                response
                    .error
                    .unwrap_or_else(|| "animation failed".to_string()),
            ));
        }
        let encoded = response
            .video
            .ok_or_else(|| GenerationError::InvalidResponse("response has no video".into()))?;
        decode_base64_media(&encoded)
            .map_err(|err| GenerationError::InvalidResponse(format!("video payload: {err}")))
    }
}
