//! # epochal-core: training loop orchestration
//!
//! This crate provides the pieces a training job is assembled from:
//!
//! - **Runner**: owns the epoch/iteration counters and the hook registry,
//!   and drives the loop that fires lifecycle stages in a fixed order.
//! - **Hooks**: observers that implement any subset of the ten lifecycle
//!   callbacks, dispatched in priority order.
//! - **LogBuffer**: weighted scalar metric history with windowed averages.
//! - **Checkpoint rotation**: save triggers, deterministic file names and
//!   pruning of checkpoints that fell out of the retention window.
//!
//! Models, optimizers, data loaders and sinks are supplied by the caller
//! through the traits in [`collaborators`].

// Foundation
pub mod config;
pub mod error;
pub mod meta;
pub mod persistence;

// Collaborator seams
pub mod collaborators;
pub mod sinks;

// Loop state
pub mod counters;
pub mod log_buffer;

// Hooks
pub mod checkpoint;
pub mod hooks;
pub mod logger;
pub mod timer;

// Orchestration
pub mod runner;

// Re-exports
pub use checkpoint::{CheckpointHook, RetentionPolicy};
pub use collaborators::{
    CheckpointSink, DataLoader, GroupValues, LogSink, Model, Optimizer, Optimizers, ParamGroup,
    StepOutput,
};
pub use config::{
    CheckpointConfig, HookConfig, HookKind, IterTimerConfig, LoggerConfig, RunnerConfig,
    load_config,
};
pub use counters::{TrainingCounters, TrainingMode};
pub use error::{Result, RunnerError};
pub use hooks::{Hook, HookContext, HookMethod, Priority, PriorityValue, Stage};
pub use log_buffer::LogBuffer;
pub use logger::LoggerHook;
pub use meta::RunMeta;
pub use runner::{HookRegistration, RunState, Runner, RunnerBuilder};
pub use sinks::{JsonCheckpointSink, JsonlMetricsSink, MetricsRecord};
pub use timer::IterTimerHook;
