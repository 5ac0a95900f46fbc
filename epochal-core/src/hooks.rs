//! Lifecycle hooks: stages, priorities, the `Hook` trait and the context
//! handed to every callback.
//!
//! A hook implements any subset of the lifecycle callbacks; the rest are
//! no-ops. The generic `before_epoch`/`after_epoch`/`before_iter`/`after_iter`
//! callbacks back both the train and val variants unless those are overridden.

use crate::collaborators::{GroupValues, Optimizers, StepOutput, short_type_name};
use crate::counters::TrainingCounters;
use crate::error::{Result, RunnerError};
use crate::log_buffer::LogBuffer;
use crate::meta::RunMeta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// The ten lifecycle points, declared in their fixed firing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    BeforeRun,
    BeforeTrainEpoch,
    BeforeTrainIter,
    AfterTrainIter,
    AfterTrainEpoch,
    BeforeValEpoch,
    BeforeValIter,
    AfterValIter,
    AfterValEpoch,
    AfterRun,
}

impl Stage {
    pub const ALL: [Stage; 10] = [
        Stage::BeforeRun,
        Stage::BeforeTrainEpoch,
        Stage::BeforeTrainIter,
        Stage::AfterTrainIter,
        Stage::AfterTrainEpoch,
        Stage::BeforeValEpoch,
        Stage::BeforeValIter,
        Stage::AfterValIter,
        Stage::AfterValEpoch,
        Stage::AfterRun,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::BeforeRun => "before_run",
            Stage::BeforeTrainEpoch => "before_train_epoch",
            Stage::BeforeTrainIter => "before_train_iter",
            Stage::AfterTrainIter => "after_train_iter",
            Stage::AfterTrainEpoch => "after_train_epoch",
            Stage::BeforeValEpoch => "before_val_epoch",
            Stage::BeforeValIter => "before_val_iter",
            Stage::AfterValIter => "after_val_iter",
            Stage::AfterValEpoch => "after_val_epoch",
            Stage::AfterRun => "after_run",
        }
    }

    /// Invoke the callback bound to this stage on `hook`.
    pub fn invoke(self, hook: &mut dyn Hook, ctx: &mut HookContext<'_>) -> Result<()> {
        match self {
            Stage::BeforeRun => hook.before_run(ctx),
            Stage::BeforeTrainEpoch => hook.before_train_epoch(ctx),
            Stage::BeforeTrainIter => hook.before_train_iter(ctx),
            Stage::AfterTrainIter => hook.after_train_iter(ctx),
            Stage::AfterTrainEpoch => hook.after_train_epoch(ctx),
            Stage::BeforeValEpoch => hook.before_val_epoch(ctx),
            Stage::BeforeValIter => hook.before_val_iter(ctx),
            Stage::AfterValIter => hook.after_val_iter(ctx),
            Stage::AfterValEpoch => hook.after_val_epoch(ctx),
            Stage::AfterRun => hook.after_run(ctx),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A callback a hook can implement.
///
/// Hooks list the methods they override in [`Hook::implements`]; this is
/// what [`Hook::triggered_stages`] is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookMethod {
    Stage(Stage),
    BeforeEpoch,
    AfterEpoch,
    BeforeIter,
    AfterIter,
}

impl HookMethod {
    /// Stages this method ends up running at.
    pub fn stages(self) -> &'static [Stage] {
        match self {
            HookMethod::Stage(stage) => match stage {
                Stage::BeforeRun => &[Stage::BeforeRun],
                Stage::BeforeTrainEpoch => &[Stage::BeforeTrainEpoch],
                Stage::BeforeTrainIter => &[Stage::BeforeTrainIter],
                Stage::AfterTrainIter => &[Stage::AfterTrainIter],
                Stage::AfterTrainEpoch => &[Stage::AfterTrainEpoch],
                Stage::BeforeValEpoch => &[Stage::BeforeValEpoch],
                Stage::BeforeValIter => &[Stage::BeforeValIter],
                Stage::AfterValIter => &[Stage::AfterValIter],
                Stage::AfterValEpoch => &[Stage::AfterValEpoch],
                Stage::AfterRun => &[Stage::AfterRun],
            },
            HookMethod::BeforeEpoch => &[Stage::BeforeTrainEpoch, Stage::BeforeValEpoch],
            HookMethod::AfterEpoch => &[Stage::AfterTrainEpoch, Stage::AfterValEpoch],
            HookMethod::BeforeIter => &[Stage::BeforeTrainIter, Stage::BeforeValIter],
            HookMethod::AfterIter => &[Stage::AfterTrainIter, Stage::AfterValIter],
        }
    }
}

/// Named priority tiers. Lower values run earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Highest,
    VeryHigh,
    High,
    AboveNormal,
    Normal,
    BelowNormal,
    Low,
    VeryLow,
    Lowest,
}

impl Priority {
    pub const ALL: [Priority; 9] = [
        Priority::Highest,
        Priority::VeryHigh,
        Priority::High,
        Priority::AboveNormal,
        Priority::Normal,
        Priority::BelowNormal,
        Priority::Low,
        Priority::VeryLow,
        Priority::Lowest,
    ];

    pub fn value(self) -> i32 {
        match self {
            Priority::Highest => 0,
            Priority::VeryHigh => 10,
            Priority::High => 30,
            Priority::AboveNormal => 40,
            Priority::Normal => 50,
            Priority::BelowNormal => 60,
            Priority::Low => 70,
            Priority::VeryLow => 90,
            Priority::Lowest => 100,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Highest => "HIGHEST",
            Priority::VeryHigh => "VERY_HIGH",
            Priority::High => "HIGH",
            Priority::AboveNormal => "ABOVE_NORMAL",
            Priority::Normal => "NORMAL",
            Priority::BelowNormal => "BELOW_NORMAL",
            Priority::Low => "LOW",
            Priority::VeryLow => "VERY_LOW",
            Priority::Lowest => "LOWEST",
        }
    }

    /// The tier whose value is exactly `value`, if any.
    pub fn from_value(value: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.value() == value)
    }
}

impl From<Priority> for i32 {
    fn from(priority: Priority) -> Self {
        priority.value()
    }
}

impl FromStr for Priority {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| RunnerError::config(format!("unknown hook priority '{s}'")))
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A priority given either as a tier name or as a raw integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PriorityValue {
    Named(Priority),
    Value(i32),
}

impl PriorityValue {
    pub fn resolve(self) -> i32 {
        match self {
            PriorityValue::Named(p) => p.value(),
            PriorityValue::Value(v) => v,
        }
    }
}

impl From<Priority> for PriorityValue {
    fn from(p: Priority) -> Self {
        PriorityValue::Named(p)
    }
}

impl From<i32> for PriorityValue {
    fn from(v: i32) -> Self {
        PriorityValue::Value(v)
    }
}

/// Label used in hook tables: the tier name when the value matches one.
pub fn priority_label(value: i32) -> String {
    Priority::from_value(value)
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| value.to_string())
}

/// Writes model state through the runner's checkpoint sink.
pub(crate) trait CheckpointSaver {
    fn persist(&mut self, path: &Path, save_optimizer: bool, meta: &RunMeta) -> Result<()>;
}

/// Everything a hook may see or touch during one callback.
///
/// Borrowed from the runner for the duration of a single call; hooks must
/// not try to keep any part of it.
pub struct HookContext<'a> {
    pub(crate) counters: &'a TrainingCounters,
    pub(crate) log_buffer: &'a mut LogBuffer,
    pub(crate) meta: &'a mut RunMeta,
    pub(crate) outputs: Option<&'a StepOutput>,
    pub(crate) optimizers: &'a Optimizers,
    pub(crate) work_dir: &'a Path,
    pub(crate) model_name: &'a str,
    pub(crate) saver: &'a mut dyn CheckpointSaver,
}

impl HookContext<'_> {
    pub fn counters(&self) -> &TrainingCounters {
        self.counters
    }

    pub fn epoch(&self) -> u64 {
        self.counters.epoch()
    }

    pub fn iter(&self) -> u64 {
        self.counters.iter()
    }

    pub fn inner_iter(&self) -> u64 {
        self.counters.inner_iter()
    }

    pub fn log_buffer(&self) -> &LogBuffer {
        self.log_buffer
    }

    pub fn log_buffer_mut(&mut self) -> &mut LogBuffer {
        self.log_buffer
    }

    /// Record scalar metrics with weight 1.
    pub fn record<K: Into<String>>(&mut self, values: impl IntoIterator<Item = (K, f64)>) {
        self.log_buffer.update(values, 1);
    }

    pub fn meta(&self) -> &RunMeta {
        self.meta
    }

    pub fn meta_mut(&mut self) -> &mut RunMeta {
        self.meta
    }

    /// Output of the most recent training step.
    pub fn outputs(&self) -> Option<&StepOutput> {
        self.outputs
    }

    pub fn work_dir(&self) -> &Path {
        self.work_dir
    }

    pub fn model_name(&self) -> &str {
        self.model_name
    }

    pub fn current_lr(&self) -> Result<GroupValues> {
        self.optimizers.current_lr()
    }

    pub fn current_momentum(&self) -> Result<GroupValues> {
        self.optimizers.current_momentum()
    }

    /// Save a checkpoint to `out_dir/filename`.
    ///
    /// The sink writes to a staging file which is renamed into place only
    /// after it succeeds; then the run metadata points at the new file and is
    /// persisted to the work dir. On failure neither the target path nor the
    /// metadata pointer changes.
    pub fn save_checkpoint(
        &mut self,
        out_dir: &Path,
        filename: &str,
        save_optimizer: bool,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(out_dir).map_err(|e| RunnerError::fs(out_dir, e))?;
        let path = out_dir.join(filename);
        let staging = crate::persistence::staging_path(&path);

        let mut snapshot = self.meta.clone();
        snapshot.insert("epoch", self.counters.epoch());
        snapshot.insert("iter", self.counters.iter());

        if let Err(e) = self.saver.persist(&staging, save_optimizer, &snapshot) {
            if staging.exists() {
                if let Err(cleanup) = std::fs::remove_file(&staging) {
                    tracing::warn!(path = %staging.display(), error = %cleanup, "Failed to remove partial checkpoint");
                }
            }
            return Err(e);
        }
        std::fs::rename(&staging, &path).map_err(|e| RunnerError::fs(&path, e))?;

        let digest = crate::persistence::sha256_file(&path).map_err(|e| RunnerError::fs(&path, e))?;
        let mut updated = self.meta.clone();
        updated.set_last_checkpoint(&path, Some(digest));
        let meta_path = self.work_dir.join(crate::meta::RUN_META_FILE);
        crate::persistence::atomic_write_json(&meta_path, &updated)
            .map_err(|e| RunnerError::fs(&meta_path, e))?;
        *self.meta = updated;

        tracing::debug!(path = %path.display(), "Checkpoint written");
        Ok(path)
    }
}

/// An observer of the training lifecycle.
pub trait Hook: Send {
    /// Name shown in hook tables.
    fn name(&self) -> &str {
        short_type_name(std::any::type_name::<Self>())
    }

    /// Callbacks this hook overrides. Must list every overridden callback:
    /// the stage table and `hook_info` are derived from it, not from the
    /// trait impl.
    fn implements(&self) -> &'static [HookMethod] {
        &[]
    }

    /// Stages this hook participates in, in firing order.
    fn triggered_stages(&self) -> Vec<Stage> {
        let stages: BTreeSet<Stage> = self
            .implements()
            .iter()
            .flat_map(|method| method.stages().iter().copied())
            .collect();
        stages.into_iter().collect()
    }

    fn before_run(&mut self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn after_run(&mut self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn before_epoch(&mut self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn after_epoch(&mut self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn before_iter(&mut self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn after_iter(&mut self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn before_train_epoch(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.before_epoch(ctx)
    }

    fn before_val_epoch(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.before_epoch(ctx)
    }

    fn after_train_epoch(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.after_epoch(ctx)
    }

    fn after_val_epoch(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.after_epoch(ctx)
    }

    fn before_train_iter(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.before_iter(ctx)
    }

    fn before_val_iter(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.before_iter(ctx)
    }

    fn after_train_iter(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.after_iter(ctx)
    }

    fn after_val_iter(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.after_iter(ctx)
    }
}
