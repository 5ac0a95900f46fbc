//! Synthetic linear-regression job used by `epochal run`.
//!
//! Fits `y = w·x + b` to noisy samples of `y = 3x - 1` with plain SGD.

use epochal_core::{
    CheckpointConfig, GroupValues, HookConfig, HookKind, IterTimerConfig, LoggerConfig, Model,
    Optimizer, Optimizers, ParamGroup, Priority, Result, RunnerError, StepOutput,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const TRUE_WEIGHT: f64 = 3.0;
const TRUE_BIAS: f64 = -1.0;
const NOISE: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub xs: Vec<f64>,
    pub ys: Vec<f64>,
}

/// Deterministic dataset split into batches of at most `batch_size`.
pub fn synthetic_batches(samples: usize, batch_size: usize, seed: u64) -> Vec<Batch> {
    let mut rng = StdRng::seed_from_u64(seed);
    let points: Vec<(f64, f64)> = (0..samples)
        .map(|_| {
            let x = rng.gen_range(-1.0..1.0);
            let noise = rng.gen_range(-NOISE..NOISE);
            (x, TRUE_WEIGHT * x + TRUE_BIAS + noise)
        })
        .collect();
    points
        .chunks(batch_size.max(1))
        .map(|chunk| Batch {
            xs: chunk.iter().map(|(x, _)| *x).collect(),
            ys: chunk.iter().map(|(_, y)| *y).collect(),
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct LinearModel {
    pub weight: f64,
    pub bias: f64,
}

impl LinearModel {
    pub fn predict(&self, x: f64) -> f64 {
        self.weight * x + self.bias
    }
}

impl Model<Batch> for LinearModel {
    fn train_step(&mut self, batch: Batch, optimizers: &mut Optimizers) -> Result<StepOutput> {
        if batch.xs.is_empty() || batch.xs.len() != batch.ys.len() {
            return Err(RunnerError::dataset(format!(
                "malformed batch: {} inputs, {} targets",
                batch.xs.len(),
                batch.ys.len()
            )));
        }
        let lr = match optimizers.current_lr()? {
            GroupValues::Single(groups) => groups.first().copied(),
            GroupValues::Named(map) => map.values().flatten().next().copied(),
        }
        .ok_or_else(|| RunnerError::step("optimizer has no param groups"))?;

        let n = batch.xs.len() as f64;
        let (mut grad_w, mut grad_b, mut sq, mut abs) = (0.0, 0.0, 0.0, 0.0);
        for (x, y) in batch.xs.iter().zip(&batch.ys) {
            let err = self.predict(*x) - y;
            grad_w += 2.0 * err * x / n;
            grad_b += 2.0 * err / n;
            sq += err * err;
            abs += err.abs();
        }
        self.weight -= lr * grad_w;
        self.bias -= lr * grad_b;

        Ok(StepOutput::new(batch.xs.len() as u64)
            .with_metric("loss", sq / n)
            .with_metric("mae", abs / n))
    }

    fn state(&self) -> serde_json::Value {
        serde_json::json!({ "weight": self.weight, "bias": self.bias })
    }
}

/// Fixed-rate SGD; the model reads the rate through `current_lr`.
#[derive(Debug, Clone)]
pub struct Sgd {
    pub lr: f64,
}

impl Optimizer for Sgd {
    fn param_groups(&self) -> Vec<ParamGroup> {
        vec![ParamGroup {
            lr: self.lr,
            momentum: Some(0.0),
            betas: None,
        }]
    }

    fn state(&self) -> serde_json::Value {
        serde_json::json!({ "lr": self.lr })
    }
}

/// Hooks used when the configuration does not list any.
pub fn default_hooks() -> Vec<HookConfig> {
    vec![
        HookConfig::new(HookKind::Checkpoint(CheckpointConfig {
            interval: 1,
            max_keep_ckpts: 3,
            ..CheckpointConfig::default()
        }))
        .with_priority(Priority::Normal),
        HookConfig::new(HookKind::IterTimer(IterTimerConfig::default()))
            .with_priority(Priority::Normal),
        HookConfig::new(HookKind::Logger(LoggerConfig::default())),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use epochal_core::{JsonCheckpointSink, Runner, RunnerConfig};
    use tempfile::TempDir;

    #[test]
    fn test_synthetic_batches_are_seeded() {
        let a = synthetic_batches(50, 16, 7);
        let b = synthetic_batches(50, 16, 7);
        assert_eq!(a, b);
        assert_eq!(a.len(), 4);
        assert_eq!(a[3].xs.len(), 2);
        assert_ne!(a, synthetic_batches(50, 16, 8));
    }

    #[test]
    fn test_step_requires_optimizer() {
        let mut model = LinearModel::default();
        let batch = synthetic_batches(4, 4, 1).remove(0);
        let result = model.train_step(batch, &mut Optimizers::None);
        assert!(matches!(result, Err(RunnerError::Config(_))));
    }

    #[test]
    fn test_training_converges() {
        let dir = TempDir::new().unwrap();
        let mut data = synthetic_batches(128, 16, 42);
        let mut runner: Runner<Batch> = Runner::builder(RunnerConfig {
            work_dir: dir.path().to_path_buf(),
            max_epochs: Some(40),
            hooks: default_hooks(),
            ..RunnerConfig::default()
        })
        .model(LinearModel::default())
        .optimizers(Optimizers::Single(Box::new(Sgd { lr: 0.1 })))
        .checkpoint_sink(JsonCheckpointSink)
        .steps_per_epoch(data.len() as u64)
        .build()
        .unwrap();
        runner.run(&mut data).unwrap();

        let state = runner.model().state();
        let weight = state["weight"].as_f64().unwrap();
        let bias = state["bias"].as_f64().unwrap();
        assert!((weight - TRUE_WEIGHT).abs() < 0.1, "weight {weight}");
        assert!((bias - TRUE_BIAS).abs() < 0.1, "bias {bias}");

        // max_keep_ckpts = 3 with interval 1 leaves the last three epochs
        let kept: Vec<u64> = (1..=40)
            .filter(|e| dir.path().join(format!("epoch_{e}.pth")).exists())
            .collect();
        assert_eq!(kept, vec![38, 39, 40]);
    }
}
