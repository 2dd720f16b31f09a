use serde::{Deserialize, Serialize};

use super::fingerprint::Fingerprint;
use crate::error::ConfigError;
use crate::ledger::CostRecord;
use crate::state::PhaseKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    512
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Part of the cache fingerprint, so distinct seeds never share entries.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: None,
            max_tokens: default_max_tokens(),
            seed: None,
        }
    }
}

impl SamplingParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Invalid(format!(
                "temperature {} outside [0, 2]",
                self.temperature
            )));
        }
        if self.top_p.is_some_and(|p| !(0.0..=1.0).contains(&p)) {
            return Err(ConfigError::Invalid("top_p outside [0, 1]".into()));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::Invalid("max_tokens must be positive".into()));
        }
        Ok(())
    }
}

/// One call through the gateway. `actor_id`, `phase` and `turn` only label
/// the resulting cost record; they are not part of the fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub sampling: SamplingParams,
    pub actor_id: Option<String>,
    pub phase: PhaseKind,
    pub turn: u32,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>, phase: PhaseKind, turn: u32) -> Self {
        Self {
            model: model.into(),
            messages,
            sampling: SamplingParams::default(),
            actor_id: None,
            phase,
            turn,
        }
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn for_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.model, &self.messages, &self.sampling)
    }

    /// All message text, used for pre-call cost estimates.
    pub fn prompt_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// What a [`GenerationClient`](super::GenerationClient) returns on success.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    /// Charge reported by the provider; the price table is used when absent.
    pub reported_cost: Option<crate::ledger::Money>,
}

impl Generation {
    pub fn new(text: impl Into<String>, tokens_in: u32, tokens_out: u32) -> Self {
        Self {
            text: text.into(),
            tokens_in,
            tokens_out,
            reported_cost: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayResponse {
    pub text: String,
    /// Model that actually served the request, after any fallback.
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cached: bool,
    pub attempts: u32,
    pub cost: CostRecord,
}
