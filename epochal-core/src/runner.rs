//! The runner: owns counters and the hook registry, drives the training loop.
//!
//! A run fires stages in a fixed sequence:
//!
//! ```text
//! before_run
//! for each epoch:
//!     before_train_epoch
//!     for each batch:
//!         before_train_iter -> train_step -> after_train_iter
//!     after_train_epoch
//! after_run
//! ```
//!
//! Iteration-bounded runs execute as a single implicit epoch that cycles the
//! data loader until `max_iters` steps have run.

use crate::checkpoint::CheckpointHook;
use crate::collaborators::{
    CheckpointSink, DataLoader, GroupValues, LogSink, Model, Optimizers, StepOutput,
};
use crate::config::{HookConfig, HookKind, RunnerConfig};
use crate::counters::{TrainingCounters, TrainingMode};
use crate::error::{Result, RunnerError};
use crate::hooks::{CheckpointSaver, Hook, HookContext, PriorityValue, Stage, priority_label};
use crate::log_buffer::LogBuffer;
use crate::logger::LoggerHook;
use crate::meta::RunMeta;
use crate::sinks::JsonlMetricsSink;
use crate::timer::IterTimerHook;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Lifecycle of a runner. `run` is only accepted in `NotStarted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Running(TrainingMode),
    Finished,
}

/// A registered hook and its resolved priority.
pub struct HookRegistration {
    hook: Box<dyn Hook>,
    priority: i32,
}

impl HookRegistration {
    pub fn hook(&self) -> &dyn Hook {
        self.hook.as_ref()
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }
}

/// Assembles and validates a [`Runner`].
pub struct RunnerBuilder<B> {
    config: RunnerConfig,
    model: Option<Box<dyn Model<B>>>,
    optimizers: Optimizers,
    sink: Option<Box<dyn CheckpointSink<B>>>,
    log_sinks: Vec<Box<dyn LogSink>>,
    steps_per_epoch: Option<u64>,
    meta: Option<RunMeta>,
}

impl<B> RunnerBuilder<B> {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            model: None,
            optimizers: Optimizers::None,
            sink: None,
            log_sinks: Vec::new(),
            steps_per_epoch: None,
            meta: None,
        }
    }

    pub fn model(mut self, model: impl Model<B> + 'static) -> Self {
        self.model = Some(Box::new(model));
        self
    }

    pub fn optimizers(mut self, optimizers: Optimizers) -> Self {
        self.optimizers = optimizers;
        self
    }

    pub fn checkpoint_sink(mut self, sink: impl CheckpointSink<B> + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn log_sink(mut self, sink: impl LogSink + 'static) -> Self {
        self.log_sinks.push(Box::new(sink));
        self
    }

    /// Batches per full pass of the data loader the runner will be given.
    pub fn steps_per_epoch(mut self, steps: u64) -> Self {
        self.steps_per_epoch = Some(steps);
        self
    }

    /// Start from existing run metadata instead of a fresh `run_id`.
    pub fn meta(mut self, meta: RunMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn build(self) -> Result<Runner<B>> {
        let steps = self
            .steps_per_epoch
            .ok_or_else(|| RunnerError::config("steps_per_epoch must be set"))?;
        let counters = TrainingCounters::new(self.config.max_epochs, self.config.max_iters, steps)?;
        let model = self
            .model
            .ok_or_else(|| RunnerError::config("a model is required"))?;
        let sink = self
            .sink
            .ok_or_else(|| RunnerError::config("a checkpoint sink is required"))?;
        self.optimizers.validate()?;

        let work_dir = self.config.work_dir;
        if work_dir.as_os_str().is_empty() {
            return Err(RunnerError::config("work_dir must not be empty"));
        }
        std::fs::create_dir_all(&work_dir).map_err(|e| RunnerError::fs(&work_dir, e))?;

        let mut log_sinks = self.log_sinks;
        let metrics_sink = match &self.config.metrics_file {
            Some(file) => {
                let sink = JsonlMetricsSink::open(work_dir.join(file))?;
                log_sinks.push(Box::new(sink.clone()));
                Some(sink)
            }
            None => None,
        };

        let mut runner = Runner {
            model,
            optimizers: self.optimizers,
            sink,
            log_sinks,
            metrics_sink,
            hooks: Vec::new(),
            counters,
            log_buffer: LogBuffer::new(),
            meta: self.meta.unwrap_or_else(RunMeta::for_new_run),
            outputs: None,
            work_dir,
            state: RunState::NotStarted,
        };
        runner.register_training_hooks(self.config.hooks)?;
        Ok(runner)
    }
}

/// Adapts the runner's model and sink to the `CheckpointSaver` seen by hooks.
struct SinkSaver<'a, B> {
    model: &'a dyn Model<B>,
    optimizers: &'a Optimizers,
    sink: &'a mut dyn CheckpointSink<B>,
}

impl<B> CheckpointSaver for SinkSaver<'_, B> {
    fn persist(&mut self, path: &Path, save_optimizer: bool, meta: &RunMeta) -> Result<()> {
        let optimizers = (save_optimizer && !self.optimizers.is_none()).then_some(self.optimizers);
        self.sink.save(self.model, optimizers, meta, path)
    }
}

/// Drives a model through training and dispatches lifecycle hooks.
pub struct Runner<B> {
    model: Box<dyn Model<B>>,
    optimizers: Optimizers,
    sink: Box<dyn CheckpointSink<B>>,
    log_sinks: Vec<Box<dyn LogSink>>,
    metrics_sink: Option<JsonlMetricsSink>,
    hooks: Vec<HookRegistration>,
    counters: TrainingCounters,
    log_buffer: LogBuffer,
    meta: RunMeta,
    outputs: Option<StepOutput>,
    work_dir: PathBuf,
    state: RunState,
}

impl<B> Runner<B> {
    pub fn builder(config: RunnerConfig) -> RunnerBuilder<B> {
        RunnerBuilder::new(config)
    }

    /// Register a hook. Lower priority values run earlier; equal priorities
    /// keep registration order.
    pub fn register_hook(&mut self, hook: Box<dyn Hook>, priority: impl Into<PriorityValue>) {
        let priority = priority.into().resolve();
        let position = self
            .hooks
            .iter()
            .rposition(|r| r.priority <= priority)
            .map_or(0, |i| i + 1);
        debug!(hook = hook.name(), priority, position, "Registered hook");
        self.hooks.insert(position, HookRegistration { hook, priority });
    }

    /// Build and register the built-in hooks described by `configs`.
    pub fn register_training_hooks(&mut self, configs: Vec<HookConfig>) -> Result<()> {
        for config in configs {
            let priority = config.resolved_priority();
            let hook: Box<dyn Hook> = match config.kind {
                HookKind::Checkpoint(cfg) => Box::new(CheckpointHook::new(cfg)?),
                HookKind::IterTimer(cfg) => Box::new(IterTimerHook::new(cfg)),
                HookKind::Logger(cfg) => {
                    let logger = LoggerHook::new(cfg);
                    match &self.metrics_sink {
                        Some(sink) => Box::new(logger.with_sink(sink.clone())),
                        None => Box::new(logger),
                    }
                }
            };
            self.register_hook(hook, priority);
        }
        Ok(())
    }

    /// Invoke `stage` on every registered hook in priority order.
    pub fn call_hook(&mut self, stage: Stage) -> Result<()> {
        let Self {
            model,
            optimizers,
            sink,
            hooks,
            counters,
            log_buffer,
            meta,
            outputs,
            work_dir,
            ..
        } = self;
        let model: &dyn Model<B> = &**model;
        let optimizers: &Optimizers = optimizers;
        let model_name = model.name();
        let mut saver = SinkSaver {
            model,
            optimizers,
            sink: &mut **sink,
        };

        for registration in hooks.iter_mut() {
            debug!(%stage, hook = registration.hook.name(), "Dispatching");
            let mut ctx = HookContext {
                counters: &*counters,
                log_buffer: &mut *log_buffer,
                meta: &mut *meta,
                outputs: outputs.as_ref(),
                optimizers,
                work_dir: work_dir.as_path(),
                model_name,
                saver: &mut saver,
            };
            stage.invoke(registration.hook.as_mut(), &mut ctx)?;
        }
        Ok(())
    }

    /// Run the whole job over `data`.
    ///
    /// May be called once. On error the runner stays in `Running` and the
    /// error is returned as-is.
    pub fn run(&mut self, data: &mut dyn DataLoader<B>) -> Result<()> {
        if self.state != RunState::NotStarted {
            return Err(RunnerError::config(format!(
                "run() may only be called once (runner state: {:?})",
                self.state
            )));
        }
        let expected = self.counters.steps_per_epoch();
        if data.len() as u64 != expected {
            return Err(RunnerError::config(format!(
                "data loader has {} batches but steps_per_epoch is {expected}",
                data.len()
            )));
        }

        let mode = self.counters.mode();
        self.state = RunState::Running(mode);
        info!(
            work_dir = %self.work_dir.display(),
            run_id = self.meta.run_id().unwrap_or("-"),
            "Start running"
        );
        info!(
            "Hooks will be executed in the following order:\n{}",
            self.hook_info()
        );
        match mode {
            TrainingMode::Epoch => info!(
                max_epochs = self.counters.max_epochs(),
                "Epoch based training"
            ),
            TrainingMode::Iter => info!(
                max_iters = self.counters.max_iters(),
                "Iteration based training"
            ),
        }

        self.call_hook(Stage::BeforeRun)?;
        match mode {
            TrainingMode::Epoch => {
                while self.counters.epoch <= self.counters.max_epochs() {
                    self.begin_epoch()?;
                    self.train_pass(data, u64::MAX)?;
                    self.end_epoch()?;
                }
            }
            TrainingMode::Iter => {
                self.begin_epoch()?;
                let max_iters = self.counters.max_iters();
                while self.counters.inner_iter < max_iters {
                    let remaining = max_iters - self.counters.inner_iter;
                    self.train_pass(data, remaining)?;
                }
                self.end_epoch()?;
            }
        }
        self.flush_log_sinks()?;
        self.call_hook(Stage::AfterRun)?;

        self.state = RunState::Finished;
        info!(
            epochs = self.counters.max_epochs(),
            iters = self.counters.max_iters(),
            "Run finished"
        );
        Ok(())
    }

    fn begin_epoch(&mut self) -> Result<()> {
        self.counters.inner_iter = 0;
        self.call_hook(Stage::BeforeTrainEpoch)?;
        self.flush_log_sinks()
    }

    fn end_epoch(&mut self) -> Result<()> {
        self.call_hook(Stage::AfterTrainEpoch)?;
        self.counters.epoch += 1;
        Ok(())
    }

    /// One pass over `data`, stopping after `budget` steps. A pass that ends
    /// on its own must yield exactly `steps_per_epoch` batches.
    fn train_pass(&mut self, data: &mut dyn DataLoader<B>, budget: u64) -> Result<()> {
        let expected = self.counters.steps_per_epoch();
        let mut seen = 0u64;
        let mut batches = data.batches();
        while seen < budget {
            let Some(batch) = batches.next() else {
                break;
            };
            seen += 1;
            if seen > expected {
                return Err(RunnerError::contract(format!(
                    "data loader yielded more than {expected} batches in one pass"
                )));
            }
            self.counters.inner_iter += 1;
            self.run_iter(batch?)?;
        }
        if seen < budget && seen != expected {
            return Err(match seen {
                0 => RunnerError::contract("data loader pass yielded no batches"),
                n => RunnerError::contract(format!(
                    "data loader pass yielded {n} batches, expected {expected}"
                )),
            });
        }
        Ok(())
    }

    fn run_iter(&mut self, batch: B) -> Result<()> {
        self.call_hook(Stage::BeforeTrainIter)?;
        let output = self.model.train_step(batch, &mut self.optimizers)?;
        if output.num_samples == 0 {
            return Err(RunnerError::contract(format!(
                "train_step returned num_samples == 0 at iter {}",
                self.counters.iter
            )));
        }
        self.log_buffer.update(
            output.metrics.iter().map(|(k, v)| (k.clone(), *v)),
            output.num_samples,
        );
        self.outputs = Some(output);
        self.call_hook(Stage::AfterTrainIter)?;
        self.counters.iter += 1;
        Ok(())
    }

    fn flush_log_sinks(&mut self) -> Result<()> {
        for sink in &mut self.log_sinks {
            sink.flush()?;
        }
        Ok(())
    }

    /// Stage-by-stage table of the hooks that will fire, in dispatch order.
    pub fn hook_info(&self) -> String {
        let mut sections = Vec::new();
        for stage in Stage::ALL {
            let rows: Vec<String> = self
                .hooks
                .iter()
                .filter(|r| r.hook.triggered_stages().contains(&stage))
                .map(|r| format!("({:<12}) {}", priority_label(r.priority), r.hook.name()))
                .collect();
            if !rows.is_empty() {
                sections.push(format!("{stage}:\n{}\n{}", rows.join("\n"), "-".repeat(20)));
            }
        }
        sections.join("\n")
    }

    pub fn hooks(&self) -> &[HookRegistration] {
        &self.hooks
    }

    pub fn hook_names(&self) -> Vec<&str> {
        self.hooks.iter().map(|r| r.hook.name()).collect()
    }

    pub fn counters(&self) -> &TrainingCounters {
        &self.counters
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
        &self.log_buffer
    }

    pub fn meta(&self) -> &RunMeta {
        &self.meta
    }

    pub fn outputs(&self) -> Option<&StepOutput> {
        self.outputs.as_ref()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn model(&self) -> &dyn Model<B> {
        self.model.as_ref()
    }

    pub fn current_lr(&self) -> Result<GroupValues> {
        self.optimizers.current_lr()
    }

    pub fn current_momentum(&self) -> Result<GroupValues> {
        self.optimizers.current_momentum()
    }
}
