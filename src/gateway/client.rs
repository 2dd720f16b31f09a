use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::time::Duration;

use super::request::{Generation, Message, Role, SamplingParams};
use crate::error::ClientError;
use crate::utils::truncate::approx_token_count;

/// The single seam to an external text-generation service.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(
        &self,
        model: &str,
        messages: &[Message],
        sampling: &SamplingParams,
    ) -> Result<Generation, ClientError>;
}

/// Deterministic local stand-in for a remote provider. Produces structured
/// replies so a whole scenario can be exercised without network access.
#[derive(Debug, Clone, Default)]
pub struct OfflineClient {
    latency: Duration,
}

impl OfflineClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn reply(model: &str, messages: &[Message], sampling: &SamplingParams) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        for m in messages {
            hasher.update(m.content.as_bytes());
        }
        if let Some(seed) = sampling.seed {
            hasher.update(seed.to_be_bytes());
        }
        let tag = hex::encode(&hasher.finalize()[..4]);

        let system = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.to_lowercase())
            .unwrap_or_default();

        if system.contains("reasoning:") {
            format!(
                "REASONING: Weighing the latest developments ({}).\nACTION: Holds position and watches the others.",
                tag
            )
        } else if system.contains("consistency") {
            "OK".to_string()
        } else {
            format!("The situation evolves quietly ({}).", tag)
        }
    }
}

#[async_trait]
impl GenerationClient for OfflineClient {
    async fn generate(
        &self,
        model: &str,
        messages: &[Message],
        sampling: &SamplingParams,
    ) -> Result<Generation, ClientError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let text = Self::reply(model, messages, sampling);
        let tokens_in: usize = messages.iter().map(|m| approx_token_count(&m.content)).sum();
        let tokens_out = approx_token_count(&text).min(sampling.max_tokens as usize);
        Ok(Generation::new(
            text,
            u32::try_from(tokens_in).unwrap_or(u32::MAX),
            tokens_out as u32,
        ))
    }
}
