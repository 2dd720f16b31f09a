//! Variation Generator
//!
//! Expands declarative parameter axes into the Cartesian product of concrete
//! scenario overrides. Order is stable (first axis varies slowest, values in
//! declared order), so a variation's index can be used as a resume key.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::ScenarioConfig;
use crate::error::ConfigError;

/// The closed set of parameters a batch can vary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AxisValues {
    /// Model of one actor, or of every actor when `actor` is omitted.
    ActorModel {
        #[serde(default)]
        actor: Option<String>,
        values: Vec<String>,
    },
    WorldModel { values: Vec<String> },
    Temperature { values: Vec<f64> },
    MaxTokens { values: Vec<u32> },
    Turns { values: Vec<u32> },
    /// Per-run limit in dollars.
    CostLimit { values: Vec<f64> },
    /// Free-form label recorded on each run; changes nothing else.
    Label { values: Vec<String> },
}

impl AxisValues {
    pub fn len(&self) -> usize {
        match self {
            AxisValues::ActorModel { values, .. }
            | AxisValues::WorldModel { values }
            | AxisValues::Label { values } => values.len(),
            AxisValues::Temperature { values } | AxisValues::CostLimit { values } => values.len(),
            AxisValues::MaxTokens { values } | AxisValues::Turns { values } => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn value(&self, i: usize) -> Option<VariationValue> {
        Some(match self {
            AxisValues::ActorModel { actor, values } => VariationValue::ActorModel {
                actor: actor.clone(),
                model: values.get(i)?.clone(),
            },
            AxisValues::WorldModel { values } => VariationValue::WorldModel(values.get(i)?.clone()),
            AxisValues::Temperature { values } => VariationValue::Temperature(*values.get(i)?),
            AxisValues::MaxTokens { values } => VariationValue::MaxTokens(*values.get(i)?),
            AxisValues::Turns { values } => VariationValue::Turns(*values.get(i)?),
            AxisValues::CostLimit { values } => VariationValue::CostLimit(*values.get(i)?),
            AxisValues::Label { values } => VariationValue::Label(values.get(i)?.clone()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariationAxis {
    pub name: String,
    #[serde(flatten)]
    pub values: AxisValues,
}

impl VariationAxis {
    pub fn new(name: impl Into<String>, values: AxisValues) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("variation axis without a name".into()));
        }
        if self.values.is_empty() {
            return Err(ConfigError::Invalid(format!("variation axis '{}' has no values", self.name)));
        }
        match &self.values {
            AxisValues::Temperature { values } if values.iter().any(|t| !(0.0..=2.0).contains(t)) => Err(
                ConfigError::Invalid(format!("axis '{}': temperature outside [0, 2]", self.name)),
            ),
            AxisValues::Turns { values } | AxisValues::MaxTokens { values } if values.contains(&0) => Err(
                ConfigError::Invalid(format!("axis '{}': values must be positive", self.name)),
            ),
            AxisValues::CostLimit { values } if values.iter().any(|v| *v < 0.0) => Err(ConfigError::Invalid(
                format!("axis '{}': cost limits cannot be negative", self.name),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum VariationValue {
    ActorModel { actor: Option<String>, model: String },
    WorldModel(String),
    Temperature(f64),
    MaxTokens(u32),
    Turns(u32),
    CostLimit(f64),
    Label(String),
}

impl VariationValue {
    pub fn apply(&self, scenario: &mut ScenarioConfig) {
        match self {
            VariationValue::ActorModel { actor, model } => {
                for a in scenario
                    .actors
                    .iter_mut()
                    .filter(|a| actor.as_ref().map_or(true, |id| *id == a.id))
                {
                    a.model = model.clone();
                }
            }
            VariationValue::WorldModel(model) => scenario.world_model = model.clone(),
            VariationValue::Temperature(t) => scenario.sampling.temperature = *t,
            VariationValue::MaxTokens(n) => scenario.sampling.max_tokens = *n,
            VariationValue::Turns(n) => scenario.turns = *n,
            VariationValue::CostLimit(limit) => scenario.cost_limit = Some(*limit),
            VariationValue::Label(_) => {}
        }
    }
}

impl fmt::Display for VariationValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariationValue::ActorModel { actor: Some(actor), model } => write!(f, "{}={}", actor, model),
            VariationValue::ActorModel { actor: None, model } => f.write_str(model),
            VariationValue::WorldModel(m) | VariationValue::Label(m) => f.write_str(m),
            VariationValue::Temperature(t) => write!(f, "{}", t),
            VariationValue::MaxTokens(n) | VariationValue::Turns(n) => write!(f, "{}", n),
            VariationValue::CostLimit(l) => write!(f, "${}", l),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub axis: String,
    pub value: VariationValue,
}

/// One point of the product: an ordered list of axis bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variation {
    pub index: usize,
    pub bindings: Vec<Binding>,
}

impl Variation {
    /// `base` with every binding applied in axis order.
    pub fn apply(&self, base: &ScenarioConfig) -> ScenarioConfig {
        let mut scenario = base.clone();
        for binding in &self.bindings {
            binding.value.apply(&mut scenario);
        }
        scenario
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.bindings
            .iter()
            .map(|b| (b.axis.clone(), b.value.to_string()))
            .collect()
    }
}

/// Full Cartesian product of `axes`. No axes yields one empty variation;
/// an axis without values yields none.
pub fn expand(axes: &[VariationAxis]) -> Vec<Variation> {
    let sizes: Vec<usize> = axes.iter().map(|a| a.values.len()).collect();
    if sizes.contains(&0) {
        return Vec::new();
    }
    let total: usize = sizes.iter().product();

    let mut variations = Vec::with_capacity(total);
    let mut digits = vec![0usize; axes.len()];
    for index in 0..total {
        let bindings = axes
            .iter()
            .zip(&digits)
            .filter_map(|(axis, &i)| {
                axis.values.value(i).map(|value| Binding {
                    axis: axis.name.clone(),
                    value,
                })
            })
            .collect();
        variations.push(Variation { index, bindings });

        // Odometer: the last axis turns fastest.
        for pos in (0..digits.len()).rev() {
            digits[pos] += 1;
            if digits[pos] < sizes[pos] {
                break;
            }
            digits[pos] = 0;
        }
    }
    variations
}

/// Identity of one batch run: a variation and a repetition of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunKey {
    pub variation: usize,
    pub repetition: u32,
}

impl RunKey {
    pub fn new(variation: usize, repetition: u32) -> Self {
        Self { variation, repetition }
    }

    /// Stable per-run sampling seed, so replicates never share cache entries
    /// while a re-run of the same key reproduces its own.
    pub fn seed(&self, experiment: &str, base: Option<u64>) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(experiment.as_bytes());
        hasher.update((self.variation as u64).to_be_bytes());
        hasher.update(self.repetition.to_be_bytes());
        hasher.update(base.unwrap_or_default().to_be_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(bytes)
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{:03}-r{:02}", self.variation, self.repetition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ActorConfig;
    use proptest::prelude::*;

    fn axes() -> Vec<VariationAxis> {
        vec![
            VariationAxis::new(
                "model",
                AxisValues::ActorModel {
                    actor: None,
                    values: vec!["small".into(), "large".into()],
                },
            ),
            VariationAxis::new(
                "temperature",
                AxisValues::Temperature {
                    values: vec![0.0, 0.5, 1.0],
                },
            ),
        ]
    }

    #[test]
    fn test_product_order_is_axis_major() {
        let vs = expand(&axes());
        assert_eq!(vs.len(), 6);
        let labels: Vec<String> = vs
            .iter()
            .map(|v| v.bindings.iter().map(|b| b.value.to_string()).collect::<Vec<_>>().join("/"))
            .collect();
        assert_eq!(
            labels,
            vec!["small/0", "small/0.5", "small/1", "large/0", "large/0.5", "large/1"]
        );
        assert!(vs.iter().enumerate().all(|(i, v)| v.index == i));
    }

    #[test]
    fn test_expansion_is_stable() {
        assert_eq!(expand(&axes()), expand(&axes()));
    }

    #[test]
    fn test_no_axes_is_single_baseline() {
        let vs = expand(&[]);
        assert_eq!(vs.len(), 1);
        assert!(vs[0].bindings.is_empty());
    }

    #[test]
    fn test_empty_axis_yields_nothing() {
        let empty = VariationAxis::new("t", AxisValues::Turns { values: vec![] });
        assert!(expand(&[empty.clone()]).is_empty());
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_apply_overrides_scenario() {
        let base = ScenarioConfig::new("s", "w")
            .with_actor(ActorConfig::new("a", "A", "m0"))
            .with_actor(ActorConfig::new("b", "B", "m0"));
        let v = Variation {
            index: 0,
            bindings: vec![
                Binding {
                    axis: "a-model".into(),
                    value: VariationValue::ActorModel {
                        actor: Some("a".into()),
                        model: "m1".into(),
                    },
                },
                Binding {
                    axis: "turns".into(),
                    value: VariationValue::Turns(7),
                },
            ],
        };
        let s = v.apply(&base);
        assert_eq!(s.actors[0].model, "m1");
        assert_eq!(s.actors[1].model, "m0");
        assert_eq!(s.turns, 7);
        assert_eq!(v.labels()["a-model"], "a=m1");
    }

    #[test]
    fn test_run_key_display_and_seed() {
        let k = RunKey::new(3, 1);
        assert_eq!(k.to_string(), "v003-r01");
        assert_eq!(k.seed("exp", None), RunKey::new(3, 1).seed("exp", None));
        assert_ne!(k.seed("exp", None), RunKey::new(3, 2).seed("exp", None));
    }

    #[test]
    fn test_axis_yaml_shape() {
        let axis: VariationAxis = serde_yaml::from_str("name: who\nkind: actor_model\nactor: north\nvalues: [a, b]").unwrap();
        assert_eq!(
            axis.values,
            AxisValues::ActorModel {
                actor: Some("north".into()),
                values: vec!["a".into(), "b".into()],
            }
        );
    }

    proptest! {
        #[test]
        fn prop_product_size(a in 1usize..5, b in 1usize..5, c in 1usize..4) {
            let axes = vec![
                VariationAxis::new("a", AxisValues::Turns { values: (1..=a as u32).collect() }),
                VariationAxis::new("b", AxisValues::MaxTokens { values: (1..=b as u32).collect() }),
                VariationAxis::new("c", AxisValues::Label { values: (0..c).map(|i| i.to_string()).collect() }),
            ];
            let vs = expand(&axes);
            prop_assert_eq!(vs.len(), a * b * c);
            let mut seen: Vec<_> = vs.iter().map(|v| v.labels()).collect();
            seen.sort();
            seen.dedup();
            prop_assert_eq!(seen.len(), a * b * c);
        }
    }
}
