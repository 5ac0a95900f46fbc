//! Configuration types for epochal-core.
//!
//! Uses `figment` for layered configuration: defaults -> config file ->
//! environment -> explicit overrides.

use crate::hooks::{Priority, PriorityValue};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Directory for checkpoints, logs and run metadata.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Train for this many epochs. Mutually exclusive with `max_iters`.
    #[serde(default)]
    pub max_epochs: Option<u64>,
    /// Train for this many iterations. Mutually exclusive with `max_epochs`.
    #[serde(default)]
    pub max_iters: Option<u64>,
    /// Built-in hooks to register before the run.
    #[serde(default)]
    pub hooks: Vec<HookConfig>,
    /// JSON-lines file the logger hook appends averaged metrics to.
    #[serde(default)]
    pub metrics_file: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            max_epochs: None,
            max_iters: None,
            hooks: Vec::new(),
            metrics_file: None,
        }
    }
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("work_dirs")
}

/// Checkpoint saving and retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Save period in epochs (or iterations). `<= 0` disables periodic saves.
    #[serde(default = "default_disabled")]
    pub interval: i64,
    /// Count `interval` in epochs rather than iterations.
    #[serde(default = "default_true")]
    pub by_epoch: bool,
    /// Include optimizer state in checkpoints.
    #[serde(default = "default_true")]
    pub save_optimizer: bool,
    /// Output directory. Defaults to the runner's work dir.
    #[serde(default)]
    pub out_dir: Option<PathBuf>,
    /// Checkpoints to keep. `<= 0` keeps everything.
    #[serde(default = "default_disabled")]
    pub max_keep_ckpts: i64,
    /// Always save at the final epoch (or iteration).
    #[serde(default = "default_true")]
    pub save_last: bool,
    /// Filename with one `{}` placeholder for the epoch or iteration number.
    #[serde(default)]
    pub filename_tmpl: Option<String>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: default_disabled(),
            by_epoch: true,
            save_optimizer: true,
            out_dir: None,
            max_keep_ckpts: default_disabled(),
            save_last: true,
            filename_tmpl: None,
        }
    }
}

/// Step timing and ETA reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterTimerConfig {
    /// Log an ETA every this many inner iterations.
    #[serde(default = "default_show_eta_iter")]
    pub show_eta_iter: i64,
}

impl Default for IterTimerConfig {
    fn default() -> Self {
        Self {
            show_eta_iter: default_show_eta_iter(),
        }
    }
}

fn default_show_eta_iter() -> i64 {
    10
}

/// Periodic metric logging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggerConfig {
    /// Log every this many inner iterations.
    #[serde(default = "default_log_interval")]
    pub interval: i64,
    /// Also log when an epoch ends, even off-interval.
    #[serde(default = "default_true")]
    pub log_epoch_end: bool,
    /// Clear the log buffer history after every log.
    #[serde(default)]
    pub reset_flag: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            interval: default_log_interval(),
            log_epoch_end: true,
            reset_flag: false,
        }
    }
}

fn default_log_interval() -> i64 {
    10
}

/// A built-in hook and its settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookKind {
    Checkpoint(CheckpointConfig),
    IterTimer(IterTimerConfig),
    Logger(LoggerConfig),
}

/// One entry of `RunnerConfig::hooks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookConfig {
    #[serde(flatten)]
    pub kind: HookKind,
    /// Defaults to `VERY_LOW`.
    #[serde(default)]
    pub priority: Option<PriorityValue>,
}

impl HookConfig {
    pub fn new(kind: HookKind) -> Self {
        Self {
            kind,
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: impl Into<PriorityValue>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    pub fn resolved_priority(&self) -> i32 {
        self.priority
            .unwrap_or(PriorityValue::Named(Priority::VeryLow))
            .resolve()
    }
}

fn default_true() -> bool {
    true
}

fn default_disabled() -> i64 {
    -1
}

/// Load the runner configuration from defaults, an optional TOML file,
/// `EPOCHAL_*` environment variables and explicit overrides, in that order.
pub fn load_config(
    file: Option<&Path>,
    overrides: Option<&RunnerConfig>,
) -> Result<RunnerConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(RunnerConfig::default()));

    if let Some(file) = file {
        figment = figment.merge(Toml::file(file));
    }

    // Environment variables (EPOCHAL_MAX_EPOCHS, EPOCHAL_WORK_DIR, ...)
    figment = figment.merge(Env::prefixed("EPOCHAL_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}
