//! CLI subcommand handlers.

use crate::Commands;
use crate::demo::{self, Batch, LinearModel, Sgd};
use epochal_core::{JsonCheckpointSink, Optimizers, RetentionPolicy, RunMeta, Runner, RunnerConfig};
use std::path::{Path, PathBuf};
use tracing::info;

const DEFAULT_EPOCHS: u64 = 5;

/// Handle a CLI subcommand.
pub fn handle_command(command: Commands, config: RunnerConfig) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            max_epochs,
            max_iters,
            seed,
            samples,
            batch_size,
            lr,
        } => {
            let config = with_bounds(config, max_epochs, max_iters);
            handle_run(config, seed, samples, batch_size, lr)
        }
        Commands::Hooks => handle_hooks(with_bounds(config, None, None)),
        Commands::Prune {
            dir,
            template,
            current,
            interval,
            max_keep,
            dry_run,
        } => {
            let dir = dir.unwrap_or_else(|| config.work_dir.clone());
            let removed = handle_prune(&dir, &template, current, interval, max_keep, dry_run)?;
            let verb = if dry_run { "Would delete" } else { "Deleted" };
            for path in &removed {
                println!("  {verb} {}", path.display());
            }
            println!("{} checkpoint(s)", removed.len());
            Ok(())
        }
    }
}

/// Apply `--max-epochs`/`--max-iters`, falling back to a short epoch run when
/// neither the flags nor the configuration set a bound.
fn with_bounds(
    mut config: RunnerConfig,
    max_epochs: Option<u64>,
    max_iters: Option<u64>,
) -> RunnerConfig {
    if max_epochs.is_some() || max_iters.is_some() {
        config.max_epochs = max_epochs;
        config.max_iters = max_iters;
    } else if config.max_epochs.is_none() && config.max_iters.is_none() {
        config.max_epochs = Some(DEFAULT_EPOCHS);
    }
    if config.hooks.is_empty() {
        config.hooks = demo::default_hooks();
    }
    config
}

fn build_runner(config: RunnerConfig, steps: usize, lr: f64) -> anyhow::Result<Runner<Batch>> {
    let runner = Runner::builder(config)
        .model(LinearModel::default())
        .optimizers(Optimizers::Single(Box::new(Sgd { lr })))
        .checkpoint_sink(JsonCheckpointSink)
        .steps_per_epoch(steps as u64)
        .build()?;
    Ok(runner)
}

fn handle_run(
    config: RunnerConfig,
    seed: u64,
    samples: usize,
    batch_size: usize,
    lr: f64,
) -> anyhow::Result<()> {
    let mut data = demo::synthetic_batches(samples, batch_size, seed);
    if data.is_empty() {
        anyhow::bail!("--samples must be at least 1");
    }
    info!(samples, batch_size, batches = data.len(), seed, "Generated synthetic dataset");

    let mut runner = build_runner(config, data.len(), lr)?;
    runner.run(&mut data)?;

    let state = runner.model().state();
    println!("Run {} finished", runner.meta().run_id().unwrap_or("-"));
    println!("  weight: {}", state["weight"]);
    println!("  bias:   {}", state["bias"]);
    match RunMeta::load(runner.work_dir())? {
        Some(meta) => {
            if let Some(path) = meta.last_checkpoint() {
                println!("  last checkpoint: {}", path.display());
            }
            if let Some(digest) = meta.last_checkpoint_sha256() {
                println!("  sha256: {digest}");
            }
        }
        None => println!("  no checkpoint saved"),
    }
    Ok(())
}

fn handle_hooks(config: RunnerConfig) -> anyhow::Result<()> {
    let runner = build_runner(config, 1, 0.0)?;
    let table = runner.hook_info();
    if table.is_empty() {
        println!("No hooks registered.");
    } else {
        println!("{table}");
    }
    Ok(())
}

/// Apply a retention pass to `dir` as if a checkpoint was just saved at
/// `current`. With `dry_run`, nothing is deleted.
fn handle_prune(
    dir: &Path,
    template: &str,
    current: u64,
    interval: i64,
    max_keep: i64,
    dry_run: bool,
) -> anyhow::Result<Vec<PathBuf>> {
    let policy = RetentionPolicy::new(interval, max_keep, true, template)?;
    if !dir.is_dir() {
        anyhow::bail!("checkpoint directory not found: {}", dir.display());
    }
    if dry_run {
        return Ok(policy
            .prune_candidates(current)
            .map(|step| policy.path_for(dir, step))
            .take_while(|path| path.is_file())
            .collect());
    }
    Ok(policy.prune(dir, current)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn touch(dir: &Path, names: &[&str]) {
        for name in names {
            std::fs::write(dir.join(name), b"ckpt").unwrap();
        }
    }

    #[test]
    fn test_prune_dry_run_keeps_files() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), &["epoch_1.pth", "epoch_2.pth", "epoch_3.pth"]);

        let listed = handle_prune(dir.path(), "epoch_{}.pth", 3, 1, 1, true).unwrap();
        assert_eq!(
            listed,
            vec![dir.path().join("epoch_2.pth"), dir.path().join("epoch_1.pth")]
        );
        assert!(dir.path().join("epoch_1.pth").exists());

        let removed = handle_prune(dir.path(), "epoch_{}.pth", 3, 1, 1, false).unwrap();
        assert_eq!(removed, listed);
        assert!(!dir.path().join("epoch_1.pth").exists());
        assert!(dir.path().join("epoch_3.pth").exists());
    }

    #[test]
    fn test_prune_rejects_bad_template_and_missing_dir() {
        let dir = TempDir::new().unwrap();
        assert!(handle_prune(dir.path(), "epoch.pth", 3, 1, 1, true).is_err());
        assert!(handle_prune(&dir.path().join("nope"), "epoch_{}.pth", 3, 1, 1, true).is_err());
    }

    #[test]
    fn test_with_bounds_defaults() {
        let config = with_bounds(RunnerConfig::default(), None, None);
        assert_eq!(config.max_epochs, Some(DEFAULT_EPOCHS));
        assert_eq!(config.hooks.len(), 3);

        let config = with_bounds(
            RunnerConfig {
                max_epochs: Some(2),
                ..RunnerConfig::default()
            },
            None,
            Some(30),
        );
        assert_eq!((config.max_epochs, config.max_iters), (None, Some(30)));
    }

    #[test]
    fn test_run_writes_checkpoint_and_meta() {
        let dir = TempDir::new().unwrap();
        let config = with_bounds(
            RunnerConfig {
                work_dir: dir.path().to_path_buf(),
                ..RunnerConfig::default()
            },
            Some(2),
            None,
        );
        handle_run(config, 3, 32, 8, 0.05).unwrap();

        let meta = RunMeta::load(dir.path()).unwrap().unwrap();
        assert_eq!(meta.last_checkpoint(), Some(dir.path().join("epoch_2.pth")));
        assert!(dir.path().join("epoch_1.pth").exists());
    }
}
