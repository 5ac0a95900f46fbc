//! Per-iteration timing and ETA reporting.

use crate::config::IterTimerConfig;
use crate::counters::TrainingCounters;
use crate::error::Result;
use crate::hooks::{Hook, HookContext, HookMethod};
use std::time::{Duration, Instant};
use tracing::info;

/// Records `data_time` and `time` for every iteration and periodically logs
/// the estimated time to completion.
pub struct IterTimerHook {
    show_eta_iter: i64,
    started: Option<Instant>,
    total_secs: f64,
    iter_count: u64,
}

impl IterTimerHook {
    pub fn new(config: IterTimerConfig) -> Self {
        Self {
            show_eta_iter: config.show_eta_iter,
            started: None,
            total_secs: 0.0,
            iter_count: 0,
        }
    }

    /// Mean seconds per timed iteration so far.
    pub fn mean_iter_secs(&self) -> Option<f64> {
        (self.iter_count > 0).then(|| self.total_secs / self.iter_count as f64)
    }

    /// Mean step time times the iterations still to run.
    pub fn eta(&self, counters: &TrainingCounters) -> Duration {
        let remaining = counters.max_iters().saturating_sub(counters.iter());
        Duration::from_secs_f64(self.mean_iter_secs().unwrap_or_default() * remaining as f64)
    }

    fn elapsed(&self) -> f64 {
        self.started
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or_default()
    }
}

impl Hook for IterTimerHook {
    fn implements(&self) -> &'static [HookMethod] {
        &[
            HookMethod::BeforeEpoch,
            HookMethod::BeforeIter,
            HookMethod::AfterIter,
        ]
    }

    fn before_epoch(&mut self, _ctx: &mut HookContext<'_>) -> Result<()> {
        self.started = Some(Instant::now());
        Ok(())
    }

    fn before_iter(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        let data_time = self.elapsed();
        ctx.record([("data_time", data_time)]);
        Ok(())
    }

    fn after_iter(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        let taken = self.elapsed();
        ctx.record([("time", taken)]);
        self.iter_count += 1;
        self.total_secs += taken;

        if ctx.counters().every_n_inner_iters(self.show_eta_iter) {
            let counters = ctx.counters();
            let eta = format_eta(self.eta(counters));
            info!(
                epoch = counters.epoch(),
                max_epochs = counters.max_epochs(),
                inner_iter = counters.inner_iter(),
                iters_per_epoch = counters.iters_this_epoch(),
                "eta: [{eta}]"
            );
        }
        self.started = Some(Instant::now());
        Ok(())
    }
}

/// `HH:MM:SS`, or `Nday HH:MM:SS` beyond 24 hours.
pub fn format_eta(remaining: Duration) -> String {
    let total = remaining.as_secs();
    let (days, rem) = (total / 86_400, total % 86_400);
    let (hours, rem) = (rem / 3_600, rem % 3_600);
    let (minutes, seconds) = (rem / 60, rem % 60);
    if days > 0 {
        format!("{days}day {hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    }
}
