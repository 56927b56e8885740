use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use url::Url;

use super::{
    decode_base64_media, encode_base64_media, CredentialCheck, GenerationClient,
    GenerationContext, GenerationError, MediaResult, VideoResult,
};
use crate::types::{AspectRatio, ReferenceImage};

pub const DEFAULT_API_BASE_URL: &str = "https://labs.google/fx/api/";

const MAX_ERROR_BODY_CHARS: usize = 300;

/// Session returned by `GET auth/session` in exchange for the cookie.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub user: Option<SessionUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionUser {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectRequest<'a> {
    pub title: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<ProjectReference<'a>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectReference<'a> {
    pub category: &'static str,
    pub encoded_image: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<&'a str>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectResponse {
    pub project_id: String,
    #[serde(default)]
    pub reference_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateImagesRequest<'a> {
    pub project_id: &'a str,
    pub prompt: &'a str,
    pub aspect_ratio: &'static str,
    pub image_count: u32,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    pub reference_ids: &'a [String],
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateImagesResponse {
    #[serde(default)]
    pub images: Vec<GeneratedImage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImage {
    pub encoded_image: String,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub media_generation_id: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimateRequest<'a> {
    pub encoded_image: String,
    pub prompt: &'a str,
    pub script: &'a str,
    pub video_model: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimateResponse {
    pub encoded_video: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// REST client for the upstream service, authenticated by exchanging the
/// session cookie for a bearer token.
#[derive(Debug)]
pub struct HttpGenerationClient {
    base_url: Url,
    client: reqwest::Client,
    timeout: Duration,
    access_token: Mutex<Option<String>>,
}

impl HttpGenerationClient {
    pub fn new(base_url: &str, cookie: &str, timeout: Duration) -> Result<Self, GenerationError> {
        let base_url = Url::parse(base_url)
            .map_err(|err| GenerationError::Transport(format!("invalid API base URL: {err}")))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(cookie.trim()).map_err(|_| {
                GenerationError::Unauthorized("cookie contains invalid header characters".into())
            })?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| GenerationError::Transport(format!("failed to build HTTP client: {err}")))?;

        Ok(Self {
            base_url,
            client,
            timeout,
            access_token: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve `path` under the base URL. The `./` keeps RPC-style names
    /// such as `images:generate` from parsing as a URL scheme.
    fn url(&self, path: &str) -> Result<Url, GenerationError> {
        self.base_url
            .join(&format!("./{path}"))
            .map_err(|err| GenerationError::Transport(format!("failed to build URL for {path}: {err}")))
    }

    fn map_send_error(&self, err: reqwest::Error) -> GenerationError {
        if err.is_timeout() {
            GenerationError::Timeout(self.timeout)
        } else {
            GenerationError::from(err)
        }
    }

    /// `GET auth/session`: exchange the cookie for a session.
    async fn fetch_session(&self) -> Result<SessionResponse, GenerationError> {
        let resp = self
            .client
            .get(self.url("auth/session")?)
            .send()
            .await
            .map_err(|err| self.map_send_error(err))?;
        let resp = check_status(resp).await?;
        resp.json::<SessionResponse>()
            .await
            .map_err(|err| GenerationError::InvalidResponse(format!("session: {err}")))
    }

    async fn bearer_token(&self, force_refresh: bool) -> Result<String, GenerationError> {
        let mut guard = self.access_token.lock().await;
        if !force_refresh {
            if let Some(token) = guard.as_ref() {
                return Ok(token.clone());
            }
        }

        let session = self.fetch_session().await?;
        let token = session
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| GenerationError::Unauthorized("session has no access token".into()))?;
        *guard = Some(token.clone());
        Ok(token)
    }

    /// Send an authorized request, refreshing the bearer token once on 401.
    async fn send_authorized<F>(&self, build: F) -> Result<Response, GenerationError>
    where
        F: Fn(&reqwest::Client) -> Result<RequestBuilder, GenerationError>,
    {
        let token = self.bearer_token(false).await?;
        let resp = build(&self.client)?
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|err| self.map_send_error(err))?;

        if resp.status() != StatusCode::UNAUTHORIZED {
            return check_status(resp).await;
        }

        let token = self.bearer_token(true).await?;
        let resp = build(&self.client)?
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|err| self.map_send_error(err))?;
        check_status(resp).await
    }
}

async fn check_status(resp: Response) -> Result<Response, GenerationError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    let message: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(GenerationError::Unauthorized(message));
    }
    Err(GenerationError::Http {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl GenerationClient for HttpGenerationClient {
    async fn validate_credential(&self) -> Result<CredentialCheck, GenerationError> {
        match self.fetch_session().await {
            Ok(session) => {
                let valid = session
                    .access_token
                    .as_deref()
                    .is_some_and(|token| !token.is_empty());
                if valid {
                    *self.access_token.lock().await = session.access_token.clone();
                }
                Ok(CredentialCheck {
                    valid,
                    identity: session.user.and_then(|user| user.email.or(user.name)),
                    message: (!valid).then(|| "session has no access token".to_string()),
                })
            }
            Err(err) if err.is_auth() => Ok(CredentialCheck {
                valid: false,
                identity: None,
                message: Some(err.to_string()),
            }),
            Err(err) => Err(err),
        }
    }

    async fn create_context(
        &self,
        label: &str,
        references: &[ReferenceImage],
    ) -> Result<GenerationContext, GenerationError> {
        let url = self.url("projects")?;
        let body = CreateProjectRequest {
            title: label,
            references: references
                .iter()
                .map(|reference| ProjectReference {
                    category: reference.category.api_name(),
                    encoded_image: reference.base64.as_str(),
                    caption: reference.caption.as_deref(),
                })
                .collect(),
        };

        let resp = self
            .send_authorized(|client| Ok(client.post(url.clone()).json(&body)))
            .await?;
        let created: CreateProjectResponse = resp
            .json()
            .await
            .map_err(|err| GenerationError::InvalidResponse(format!("project: {err}")))?;

        Ok(GenerationContext {
            id: created.project_id,
            label: label.to_string(),
            reference_ids: created.reference_ids,
        })
    }

    async fn generate(
        &self,
        context: &GenerationContext,
        prompt: &str,
        aspect_ratio: AspectRatio,
    ) -> Result<MediaResult, GenerationError> {
        let url = self.url("images:generate")?;
        let body = GenerateImagesRequest {
            project_id: &context.id,
            prompt,
            aspect_ratio: aspect_ratio.api_name(),
            image_count: 1,
            reference_ids: &context.reference_ids,
        };

        let resp = self
            .send_authorized(|client| Ok(client.post(url.clone()).json(&body)))
            .await?;
        let parsed: GenerateImagesResponse = resp
            .json()
            .await
            .map_err(|err| GenerationError::InvalidResponse(format!("images: {err}")))?;

        let image = parsed
            .images
            .into_iter()
            .next()
            .ok_or_else(|| GenerationError::Rejected("no image returned for prompt".into()))?;
        let bytes = decode_base64_media(&image.encoded_image)
            .map_err(|err| GenerationError::InvalidResponse(format!("image payload: {err}")))?;

        Ok(MediaResult {
            bytes,
            mime_type: image.mime_type.unwrap_or_else(|| "image/png".to_string()),
            prompt: prompt.to_string(),
            seed: image.seed,
            media_id: image.media_generation_id,
        })
    }

    async fn destroy_context(&self, context: &GenerationContext) -> Result<(), GenerationError> {
        let url = self.url(&format!("projects/{}", context.id))?;
        self.send_authorized(|client| Ok(client.delete(url.clone())))
            .await?;
        Ok(())
    }

    async fn animate(
        &self,
        media: &MediaResult,
        script: &str,
        video_model: &str,
    ) -> Result<VideoResult, GenerationError> {
        let url = self.url("videos:animate")?;
        let body = AnimateRequest {
            encoded_image: encode_base64_media(&media.bytes),
            prompt: &media.prompt,
            script,
            video_model,
        };

        let resp = self
            .send_authorized(|client| Ok(client.post(url.clone()).json(&body)))
            .await?;
        let parsed: AnimateResponse = resp
            .json()
            .await
            .map_err(|err| GenerationError::InvalidResponse(format!("video: {err}")))?;
        let bytes = decode_base64_media(&parsed.encoded_video)
            .map_err(|err| GenerationError::InvalidResponse(format!("video payload: {err}")))?;

        Ok(VideoResult {
            bytes,
            mime_type: parsed.mime_type.unwrap_or_else(|| "video/mp4".to_string()),
        })
    }
}
