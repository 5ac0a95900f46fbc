//! Checkpoint rotation: when to save, what to call it, what to delete.

use crate::config::CheckpointConfig;
use crate::error::{Result, RunnerError};
use crate::hooks::{Hook, HookContext, HookMethod, Stage};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const PLACEHOLDER: &str = "{}";

/// Save trigger and retention policy, independent of any runner.
///
/// Which checkpoints exist is never tracked in memory: candidate paths are
/// recomputed from the filename template and checked on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionPolicy {
    interval: i64,
    max_keep: i64,
    save_last: bool,
    filename_tmpl: String,
}

impl RetentionPolicy {
    pub fn new(
        interval: i64,
        max_keep: i64,
        save_last: bool,
        filename_tmpl: impl Into<String>,
    ) -> Result<Self> {
        let filename_tmpl = filename_tmpl.into();
        if filename_tmpl.matches(PLACEHOLDER).count() != 1 {
            return Err(RunnerError::config(format!(
                "checkpoint filename template must contain exactly one '{{}}': '{filename_tmpl}'"
            )));
        }
        if filename_tmpl.contains('/') || filename_tmpl.contains('\\') {
            return Err(RunnerError::config(format!(
                "checkpoint filename template must be a bare file name: '{filename_tmpl}'"
            )));
        }
        Ok(Self {
            interval,
            max_keep,
            save_last,
            filename_tmpl,
        })
    }

    /// Default template for the counting unit.
    pub fn default_template(by_epoch: bool) -> &'static str {
        if by_epoch { "epoch_{}.pth" } else { "iter_{}.pth" }
    }

    pub fn interval(&self) -> i64 {
        self.interval
    }

    pub fn max_keep(&self) -> i64 {
        self.max_keep
    }

    pub fn filename_tmpl(&self) -> &str {
        &self.filename_tmpl
    }

    /// Periodic trigger, or the final step when `save_last` is set.
    pub fn should_save(&self, counter: u64, max: u64) -> bool {
        let periodic = self.interval > 0 && counter % self.interval as u64 == 0;
        periodic || (self.save_last && counter == max)
    }

    pub fn filename(&self, step: u64) -> String {
        self.filename_tmpl.replacen(PLACEHOLDER, &step.to_string(), 1)
    }

    pub fn path_for(&self, dir: &Path, step: u64) -> PathBuf {
        dir.join(self.filename(step))
    }

    /// Step numbers examined by a pruning pass after saving at `current`,
    /// starting from the most distant: `current - max_keep * interval`, then
    /// every `interval` below it, down to (excluding) zero. Lazy, so a pass
    /// that stops at the first missing file costs nothing for later steps.
    pub fn prune_candidates(&self, current: u64) -> impl Iterator<Item = u64> + use<> {
        let first = if self.max_keep <= 0 || self.interval <= 0 {
            None
        } else {
            (self.max_keep as u64)
                .checked_mul(self.interval as u64)
                .and_then(|span| current.checked_sub(span))
        };
        let interval = self.interval.max(1) as u64;
        std::iter::successors(first, move |step| step.checked_sub(interval))
            .take_while(|step| *step > 0)
    }

    /// Delete checkpoints that fell out of the retention window.
    ///
    /// Stops at the first candidate whose file does not exist: a gap means
    /// nothing older is assumed to need pruning. Older files beyond a gap are
    /// left in place.
    pub fn prune(&self, dir: &Path, current: u64) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for step in self.prune_candidates(current) {
            let path = self.path_for(dir, step);
            if !path.is_file() {
                debug!(path = %path.display(), "No checkpoint at candidate, stopping prune");
                break;
            }
            std::fs::remove_file(&path).map_err(|e| RunnerError::fs(&path, e))?;
            debug!(path = %path.display(), "Removed stale checkpoint");
            removed.push(path);
        }
        Ok(removed)
    }
}

/// Saves checkpoints periodically and prunes old ones.
pub struct CheckpointHook {
    policy: RetentionPolicy,
    by_epoch: bool,
    save_optimizer: bool,
    out_dir: Option<PathBuf>,
}

impl CheckpointHook {
    pub fn new(config: CheckpointConfig) -> Result<Self> {
        let tmpl = config
            .filename_tmpl
            .unwrap_or_else(|| RetentionPolicy::default_template(config.by_epoch).to_string());
        let policy = RetentionPolicy::new(
            config.interval,
            config.max_keep_ckpts,
            config.save_last,
            tmpl,
        )?;
        Ok(Self {
            policy,
            by_epoch: config.by_epoch,
            save_optimizer: config.save_optimizer,
            out_dir: config.out_dir,
        })
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Resolved output directory; `None` until `before_run` has run when no
    /// directory was configured.
    pub fn out_dir(&self) -> Option<&Path> {
        self.out_dir.as_deref()
    }

    fn save(&mut self, ctx: &mut HookContext<'_>, step: u64) -> Result<()> {
        let out_dir = match &self.out_dir {
            Some(dir) => dir.clone(),
            None => ctx.work_dir().to_path_buf(),
        };
        let unit = if self.by_epoch { "epochs" } else { "iterations" };
        info!("Saving checkpoint at {step} {unit}");

        let filename = self.policy.filename(step);
        ctx.save_checkpoint(&out_dir, &filename, self.save_optimizer)?;

        let removed = self.policy.prune(&out_dir, step)?;
        if !removed.is_empty() {
            info!(count = removed.len(), "Pruned old checkpoints");
        }
        Ok(())
    }
}

impl Hook for CheckpointHook {
    fn implements(&self) -> &'static [HookMethod] {
        &[
            HookMethod::Stage(Stage::BeforeRun),
            HookMethod::Stage(Stage::AfterTrainIter),
            HookMethod::Stage(Stage::AfterTrainEpoch),
        ]
    }

    fn before_run(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        let dir = self
            .out_dir
            .get_or_insert_with(|| ctx.work_dir().to_path_buf());
        std::fs::create_dir_all(&*dir).map_err(|e| RunnerError::fs(&*dir, e))?;
        info!("Checkpoints will be saved to {}", dir.display());
        Ok(())
    }

    fn after_train_epoch(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        if !self.by_epoch {
            return Ok(());
        }
        let counters = ctx.counters();
        let (epoch, max) = (counters.epoch(), counters.max_epochs());
        if self.policy.should_save(epoch, max) {
            self.save(ctx, epoch)?;
        }
        Ok(())
    }

    fn after_train_iter(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        if self.by_epoch {
            return Ok(());
        }
        let counters = ctx.counters();
        let (iter, max) = (counters.iter(), counters.max_iters());
        if self.policy.should_save(iter, max) {
            self.save(ctx, iter)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn touch(dir: &Path, policy: &RetentionPolicy, steps: &[u64]) {
        for step in steps {
            std::fs::write(policy.path_for(dir, *step), b"ckpt").unwrap();
        }
    }

    #[test]
    fn test_should_save_interval_and_last() {
        let policy = RetentionPolicy::new(2, -1, true, "epoch_{}.pth").unwrap();
        let saved: Vec<u64> = (1..=5).filter(|e| policy.should_save(*e, 5)).collect();
        assert_eq!(saved, vec![2, 4, 5]);
    }

    #[test]
    fn test_disabled_interval_only_saves_last() {
        let policy = RetentionPolicy::new(-1, -1, true, "epoch_{}.pth").unwrap();
        let saved: Vec<u64> = (1..=5).filter(|e| policy.should_save(*e, 5)).collect();
        assert_eq!(saved, vec![5]);

        let never = RetentionPolicy::new(0, -1, false, "epoch_{}.pth").unwrap();
        assert!((1..=5).all(|e| !never.should_save(e, 5)));
    }

    #[test]
    fn test_template_validation() {
        assert!(RetentionPolicy::new(1, 1, true, "epoch.pth").is_err());
        assert!(RetentionPolicy::new(1, 1, true, "e_{}_{}.pth").is_err());
        assert!(RetentionPolicy::new(1, 1, true, "sub/epoch_{}.pth").is_err());
        let policy = RetentionPolicy::new(1, 1, true, "model-{}.ckpt").unwrap();
        assert_eq!(policy.filename(12), "model-12.ckpt");
    }

    #[test]
    fn test_prune_candidates() {
        let policy = RetentionPolicy::new(2, 2, true, "epoch_{}.pth").unwrap();
        let candidates = |current| policy.prune_candidates(current).collect::<Vec<u64>>();
        assert_eq!(candidates(10), vec![6, 4, 2]);
        assert_eq!(candidates(4), Vec::<u64>::new());
        assert_eq!(candidates(5), vec![1]);

        let unlimited = RetentionPolicy::new(2, -1, true, "epoch_{}.pth").unwrap();
        assert_eq!(unlimited.prune_candidates(100).next(), None);

        let wide = RetentionPolicy::new(i64::MAX, i64::MAX, true, "epoch_{}.pth").unwrap();
        assert_eq!(wide.prune_candidates(u64::MAX).next(), None);
    }

    #[test]
    fn test_prune_keeps_window() {
        let dir = TempDir::new().unwrap();
        let policy = RetentionPolicy::new(1, 2, true, "epoch_{}.pth").unwrap();
        touch(dir.path(), &policy, &[1, 2, 3, 4, 5]);

        let removed = policy.prune(dir.path(), 5).unwrap();
        assert_eq!(
            removed,
            vec![
                policy.path_for(dir.path(), 3),
                policy.path_for(dir.path(), 2),
                policy.path_for(dir.path(), 1),
            ]
        );
        assert!(policy.path_for(dir.path(), 4).exists());
        assert!(policy.path_for(dir.path(), 5).exists());
    }

    #[test]
    fn test_prune_stops_at_gap() {
        let dir = TempDir::new().unwrap();
        let policy = RetentionPolicy::new(1, 1, true, "epoch_{}.pth").unwrap();
        touch(dir.path(), &policy, &[1, 2, 4, 5]);

        let removed = policy.prune(dir.path(), 5).unwrap();
        assert_eq!(removed, vec![policy.path_for(dir.path(), 4)]);
        // epoch_3 is missing, so 2 and 1 survive
        assert!(policy.path_for(dir.path(), 2).exists());
        assert!(policy.path_for(dir.path(), 1).exists());
    }

    #[test]
    fn test_prune_empty_dir_is_noop() {
        let dir = TempDir::new().unwrap();
        let policy = RetentionPolicy::new(1, 3, true, "iter_{}.pth").unwrap();
        assert!(policy.prune(dir.path(), 50).unwrap().is_empty());
        assert!(policy.prune(dir.path(), 50).unwrap().is_empty());
    }

    #[test]
    fn test_prune_at_large_step_stops_at_first_candidate() {
        let dir = TempDir::new().unwrap();
        let policy = RetentionPolicy::new(1, 1, true, "iter_{}.pth").unwrap();
        let current = 200_000_000;

        let start = std::time::Instant::now();
        for _ in 0..5 {
            assert!(policy.prune(dir.path(), current).unwrap().is_empty());
        }
        assert!(start.elapsed() < std::time::Duration::from_millis(200));

        let mut candidates = policy.prune_candidates(current);
        assert_eq!(candidates.next(), Some(current - 1));
        assert_eq!(candidates.next(), Some(current - 2));
    }

    #[test]
    fn test_hook_uses_unit_default_template() {
        let hook = CheckpointHook::new(CheckpointConfig {
            by_epoch: false,
            ..CheckpointConfig::default()
        })
        .unwrap();
        assert_eq!(hook.policy().filename_tmpl(), "iter_{}.pth");
        assert_eq!(
            hook.triggered_stages(),
            vec![Stage::BeforeRun, Stage::AfterTrainIter, Stage::AfterTrainEpoch]
        );
    }

    #[test]
    fn test_hook_rejects_bad_template() {
        let result = CheckpointHook::new(CheckpointConfig {
            filename_tmpl: Some("latest.pth".into()),
            ..CheckpointConfig::default()
        });
        assert!(matches!(result, Err(RunnerError::Config(_))));
    }
}
