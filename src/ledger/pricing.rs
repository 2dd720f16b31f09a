use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use super::Money;
use crate::utils::truncate::approx_token_count;

/// Dollar price per million tokens for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPrice {
    pub fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    /// A dollar per million tokens is exactly one micro-dollar per token.
    pub fn cost(&self, tokens_in: u32, tokens_out: u32) -> Money {
        let micros = f64::from(tokens_in) * self.input_per_million + f64::from(tokens_out) * self.output_per_million;
        Money::from_micros(micros.round() as i64)
    }
}

/// Price lookup keyed by model identifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceTable {
    #[serde(default)]
    pub models: BTreeMap<String, ModelPrice>,
    /// Used for models without an explicit entry.
    #[serde(default)]
    pub default: Option<ModelPrice>,
}

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>, price: ModelPrice) -> Self {
        self.models.insert(model.into(), price);
        self
    }

    pub fn with_default(mut self, price: ModelPrice) -> Self {
        self.default = Some(price);
        self
    }

    pub fn price_for(&self, model: &str) -> Option<&ModelPrice> {
        self.models.get(model).or(self.default.as_ref())
    }

    /// Actual charge for a completed call. Unpriced models cost nothing.
    pub fn cost(&self, model: &str, tokens_in: u32, tokens_out: u32) -> Money {
        match self.price_for(model) {
            Some(price) => price.cost(tokens_in, tokens_out),
            None => {
                debug!(model, "No price configured; charging zero");
                Money::ZERO
            }
        }
    }

    /// Pre-call estimate: prompt length approximates input tokens and the
    /// full `max_tokens` allowance is assumed for output.
    pub fn estimate(&self, model: &str, prompt: &str, max_tokens: u32) -> Money {
        let tokens_in = u32::try_from(approx_token_count(prompt)).unwrap_or(u32::MAX);
        self.cost(model, tokens_in, max_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_per_million() {
        let table = PriceTable::new().with_model("gpt", ModelPrice::new(1.0, 100.0));
        // 1000 output tokens at $100/M = $0.10
        assert_eq!(table.cost("gpt", 0, 1000), Money::from_dollars(0.10));
        assert_eq!(table.cost("gpt", 2000, 0), Money::from_micros(2000));
    }

    #[test]
    fn test_default_and_unknown_models() {
        let table = PriceTable::new();
        assert_eq!(table.cost("unknown", 1000, 1000), Money::ZERO);

        let table = table.with_default(ModelPrice::new(2.0, 2.0));
        assert_eq!(table.cost("unknown", 500, 500), Money::from_micros(2000));
    }

    #[test]
    fn test_estimate_assumes_full_output_allowance() {
        let table = PriceTable::new().with_model("m", ModelPrice::new(0.0, 100.0));
        assert_eq!(table.estimate("m", "a fairly short prompt", 1000), Money::from_dollars(0.10));
    }
}
