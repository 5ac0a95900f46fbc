//! Periodic averaged-metric logging.

use crate::config::LoggerConfig;
use crate::error::Result;
use crate::hooks::{Hook, HookContext, HookMethod, Stage};
use crate::sinks::{JsonlMetricsSink, MetricsRecord};
use tracing::info;

/// Averages the log buffer over the last `interval` entries and reports it
/// through `tracing` and, when configured, a JSON-lines metrics file.
pub struct LoggerHook {
    interval: i64,
    log_epoch_end: bool,
    reset_flag: bool,
    sink: Option<JsonlMetricsSink>,
}

impl LoggerHook {
    pub fn new(config: LoggerConfig) -> Self {
        Self {
            interval: config.interval,
            log_epoch_end: config.log_epoch_end,
            reset_flag: config.reset_flag,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: JsonlMetricsSink) -> Self {
        self.sink = Some(sink);
        self
    }

    fn window(&self) -> usize {
        usize::try_from(self.interval).unwrap_or(0)
    }

    fn log(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        if ctx.log_buffer().is_empty() {
            return Ok(());
        }
        let window = self.window();
        ctx.log_buffer_mut().average(window)?;

        let counters = ctx.counters();
        let rendered = ctx
            .log_buffer()
            .output()
            .iter()
            .map(|(k, v)| format!("{k}: {v:.4}"))
            .collect::<Vec<_>>()
            .join(", ");
        info!(
            epoch = counters.epoch(),
            iter = counters.iter(),
            inner_iter = counters.inner_iter(),
            "Epoch [{}][{}/{}] {rendered}",
            counters.epoch(),
            counters.inner_iter(),
            counters.iters_this_epoch(),
        );

        if let Some(sink) = &self.sink {
            sink.write(&MetricsRecord {
                mode: "train",
                epoch: counters.epoch(),
                iter: counters.iter(),
                inner_iter: counters.inner_iter(),
                metrics: ctx.log_buffer().output(),
            })?;
        }

        let buffer = ctx.log_buffer_mut();
        buffer.clear_output();
        if self.reset_flag {
            buffer.clear();
        }
        Ok(())
    }
}

impl Hook for LoggerHook {
    fn implements(&self) -> &'static [HookMethod] {
        &[
            HookMethod::Stage(Stage::AfterTrainIter),
            HookMethod::Stage(Stage::AfterTrainEpoch),
        ]
    }

    fn after_train_iter(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        if ctx.counters().every_n_inner_iters(self.interval) {
            self.log(ctx)?;
        }
        Ok(())
    }

    fn after_train_epoch(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        // the last iteration already logged if it landed on the interval
        if self.log_epoch_end && !ctx.counters().every_n_inner_iters(self.interval) {
            self.log(ctx)?;
        }
        Ok(())
    }
}
