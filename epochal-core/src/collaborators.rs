//! Interfaces to the collaborators the runner drives but does not own:
//! the model's training step, optimizers, the dataset producer, the
//! checkpoint serializer and asynchronous log sinks.

use crate::error::{Result, RunnerError};
use crate::meta::RunMeta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Result of one training step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    /// Scalar metrics to merge into the log buffer.
    #[serde(default, alias = "log_vars")]
    pub metrics: BTreeMap<String, f64>,
    /// Samples processed in this step, used as the averaging weight.
    pub num_samples: u64,
    /// Anything else the model wants hooks to see.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StepOutput {
    pub fn new(num_samples: u64) -> Self {
        Self {
            num_samples,
            ..Self::default()
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// Decode a loosely-typed step result.
    ///
    /// Entry point for models bridged from dynamic runtimes: their
    /// `Model::train_step` receives the step as a JSON object and returns it
    /// through this. Anything that is not an object with a `num_samples`
    /// count breaks the step contract.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        if !value.is_object() {
            return Err(RunnerError::contract(format!(
                "train_step must return an object, got {value}"
            )));
        }
        serde_json::from_value(value)
            .map_err(|e| RunnerError::contract(format!("malformed train_step result: {e}")))
    }
}

/// The opaque training capability.
pub trait Model<B>: Send {
    /// Run forward, backward and the optimizer update for one batch.
    fn train_step(&mut self, batch: B, optimizers: &mut Optimizers) -> Result<StepOutput>;

    /// Serializable model state handed to checkpoint sinks.
    fn state(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Model name, usually its type name.
    fn name(&self) -> &str {
        short_type_name(std::any::type_name::<Self>())
    }
}

/// Hyperparameters of one optimizer parameter group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    pub lr: f64,
    #[serde(default)]
    pub momentum: Option<f64>,
    #[serde(default)]
    pub betas: Option<(f64, f64)>,
}

impl ParamGroup {
    /// Momentum as reported by the group, falling back to beta1, then zero.
    pub fn effective_momentum(&self) -> f64 {
        self.momentum
            .or(self.betas.map(|(beta1, _)| beta1))
            .unwrap_or(0.0)
    }
}

pub trait Optimizer: Send {
    fn param_groups(&self) -> Vec<ParamGroup>;

    fn state(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// The optimizer configuration a runner is built with.
#[derive(Default)]
pub enum Optimizers {
    #[default]
    None,
    Single(Box<dyn Optimizer>),
    /// Several optimizers addressed by name (e.g. generator/discriminator).
    Named(BTreeMap<String, Box<dyn Optimizer>>),
}

/// Per-group values for a single optimizer or for every named optimizer.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupValues {
    Single(Vec<f64>),
    Named(BTreeMap<String, Vec<f64>>),
}

impl Optimizers {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if let Self::Named(map) = self {
            if map.is_empty() {
                return Err(RunnerError::config(
                    "optimizer map must contain at least one optimizer",
                ));
            }
            if let Some(name) = map.keys().find(|name| name.trim().is_empty()) {
                return Err(RunnerError::config(format!(
                    "optimizer names must be non-empty, got {name:?}"
                )));
            }
        }
        Ok(())
    }

    fn collect(&self, what: &str, f: impl Fn(&ParamGroup) -> f64) -> Result<GroupValues> {
        match self {
            Self::None => Err(RunnerError::config(format!(
                "{what} is not applicable because optimizer does not exist"
            ))),
            Self::Single(opt) => Ok(GroupValues::Single(
                opt.param_groups().iter().map(&f).collect(),
            )),
            Self::Named(map) => Ok(GroupValues::Named(
                map.iter()
                    .map(|(name, opt)| {
                        let values = opt.param_groups().iter().map(&f).collect::<Vec<_>>();
                        (name.clone(), values)
                    })
                    .collect(),
            )),
        }
    }

    /// Learning rate of every param group.
    pub fn current_lr(&self) -> Result<GroupValues> {
        self.collect("lr", |group| group.lr)
    }

    /// Momentum (or beta1) of every param group.
    pub fn current_momentum(&self) -> Result<GroupValues> {
        self.collect("momentum", ParamGroup::effective_momentum)
    }

    /// Optimizer state for checkpoints.
    pub fn state(&self) -> serde_json::Value {
        match self {
            Self::None => serde_json::Value::Null,
            Self::Single(opt) => opt.state(),
            Self::Named(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(name, opt)| (name.clone(), opt.state()))
                    .collect(),
            ),
        }
    }
}

impl std::fmt::Debug for Optimizers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("Optimizers::None"),
            Self::Single(_) => f.write_str("Optimizers::Single"),
            Self::Named(map) => f
                .debug_tuple("Optimizers::Named")
                .field(&map.keys().collect::<Vec<_>>())
                .finish(),
        }
    }
}

/// A finite, restartable sequence of batches of known length.
pub trait DataLoader<B> {
    /// Batches yielded by one full pass.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start a fresh pass over the data.
    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<B>> + '_>;
}

impl<B: Clone> DataLoader<B> for Vec<B> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<B>> + '_> {
        Box::new(self.iter().cloned().map(Ok))
    }
}

/// Persists model (and optionally optimizer) state to a path.
///
/// The runner always passes a temporary path and moves the file into place
/// once `save` returns `Ok`.
pub trait CheckpointSink<B>: Send {
    fn save(
        &mut self,
        model: &dyn Model<B>,
        optimizers: Option<&Optimizers>,
        meta: &RunMeta,
        path: &Path,
    ) -> Result<()>;
}

/// A logging backend that buffers writes.
pub trait LogSink: Send {
    /// Block until everything written so far has reached its destination.
    fn flush(&mut self) -> Result<()>;
}

pub(crate) fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sgd {
        lr: f64,
    }

    impl Optimizer for Sgd {
        fn param_groups(&self) -> Vec<ParamGroup> {
            vec![ParamGroup {
                lr: self.lr,
                momentum: Some(0.9),
                betas: None,
            }]
        }
    }

    struct Adam;

    impl Optimizer for Adam {
        fn param_groups(&self) -> Vec<ParamGroup> {
            vec![
                ParamGroup {
                    lr: 1e-3,
                    momentum: None,
                    betas: Some((0.8, 0.999)),
                },
                ParamGroup {
                    lr: 1e-4,
                    momentum: None,
                    betas: None,
                },
            ]
        }
    }

    #[test]
    fn test_step_output_from_value() {
        let out = StepOutput::from_value(serde_json::json!({
            "log_vars": {"loss": 0.25},
            "num_samples": 8,
            "loss_tensor": [1, 2]
        }))
        .unwrap();
        assert_eq!(out.num_samples, 8);
        assert_eq!(out.metrics.get("loss"), Some(&0.25));
        assert!(out.extra.contains_key("loss_tensor"));
    }

    #[test]
    fn test_step_output_wrong_shape() {
        let err = StepOutput::from_value(serde_json::json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, RunnerError::ContractViolation(_)));

        let err = StepOutput::from_value(serde_json::json!({"metrics": {}})).unwrap_err();
        assert!(matches!(err, RunnerError::ContractViolation(_)));
    }

    #[test]
    fn test_current_lr_and_momentum() {
        let single = Optimizers::Single(Box::new(Sgd { lr: 0.1 }));
        assert_eq!(single.current_lr().unwrap(), GroupValues::Single(vec![0.1]));
        assert_eq!(
            single.current_momentum().unwrap(),
            GroupValues::Single(vec![0.9])
        );

        let mut map: BTreeMap<String, Box<dyn Optimizer>> = BTreeMap::new();
        map.insert("gen".into(), Box::new(Adam));
        map.insert("disc".into(), Box::new(Sgd { lr: 0.5 }));
        let named = Optimizers::Named(map);
        match named.current_momentum().unwrap() {
            GroupValues::Named(values) => {
                assert_eq!(values["gen"], vec![0.8, 0.0]);
                assert_eq!(values["disc"], vec![0.9]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_no_optimizer_lr_is_error() {
        assert!(Optimizers::None.current_lr().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_map() {
        let empty = Optimizers::Named(BTreeMap::new());
        assert!(matches!(empty.validate(), Err(RunnerError::Config(_))));
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name("epochal_core::timer::IterTimerHook"), "IterTimerHook");
        assert_eq!(short_type_name("a::Wrapper<b::Inner>"), "Wrapper");
    }
}
