use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{
    CredentialCheck, GenerationClient, GenerationContext, GenerationError, MediaResult,
    VideoResult,
};
use crate::types::{AspectRatio, ReferenceImage};

pub const MOCK_IDENTITY: &str = "mock@example.com";

/// Smallest valid PNG: one transparent pixel.
const MOCK_PNG: [u8; 67] = [
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f,
    0x15, 0xc4, 0x89, 0x00, 0x00, 0x00, 0x0a, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0d, 0x0a, 0x2d, 0xb4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

/// `ftyp` box header so the payload is recognisable as MP4.
const MOCK_MP4_HEADER: [u8; 12] = [
    0x00, 0x00, 0x00, 0x18, 0x66, 0x74, 0x79, 0x70, 0x69, 0x73, 0x6f, 0x6d,
];

/// Deterministic stand-in for the upstream service, selected by the `MOCK`
/// credential.
#[derive(Debug, Clone)]
pub struct MockGenerationClient {
    delay: Duration,
}

impl MockGenerationClient {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    async fn simulate_latency(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

/// Stable seed for a prompt so repeated runs produce identical records.
pub fn mock_seed(prompt: &str) -> i64 {
    let digest = Sha256::digest(prompt.as_bytes());
    i64::from(u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]))
}

pub fn mock_png() -> Vec<u8> {
    MOCK_PNG.to_vec()
}

#[async_trait]
impl GenerationClient for MockGenerationClient {
    async fn validate_credential(&self) -> Result<CredentialCheck, GenerationError> {
        Ok(CredentialCheck {
            valid: true,
            identity: Some(MOCK_IDENTITY.to_string()),
            message: None,
        })
    }

    async fn create_context(
        &self,
        label: &str,
        references: &[ReferenceImage],
    ) -> Result<GenerationContext, GenerationError> {
        Ok(GenerationContext {
            id: format!("mock-{}", uuid::Uuid::new_v4()),
            label: label.to_string(),
            reference_ids: (0..references.len())
                .map(|index| format!("mock-ref-{index}"))
                .collect(),
        })
    }

    async fn generate(
        &self,
        _context: &GenerationContext,
        prompt: &str,
        _aspect_ratio: AspectRatio,
    ) -> Result<MediaResult, GenerationError> {
        self.simulate_latency().await;
        let seed = mock_seed(prompt);
        Ok(MediaResult {
            bytes: mock_png(),
            mime_type: "image/png".to_string(),
            prompt: prompt.to_string(),
            seed: Some(seed),
            media_id: Some(format!("mock-{seed}")),
        })
    }

    async fn destroy_context(&self, _context: &GenerationContext) -> Result<(), GenerationError> {
        Ok(())
    }

    async fn animate(
        &self,
        media: &MediaResult,
        _script: &str,
        _video_model: &str,
    ) -> Result<VideoResult, GenerationError> {
        self.simulate_latency().await;
        let mut bytes = MOCK_MP4_HEADER.to_vec();
        bytes.extend_from_slice(&media.bytes);
        Ok(VideoResult {
            bytes,
            mime_type: "video/mp4".to_string(),
        })
    }
}
