//! Step counters owned by the runner.

use crate::error::{Result, RunnerError};
use serde::Serialize;

/// Which bound drives the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingMode {
    Epoch,
    Iter,
}

/// Epoch and iteration counters.
///
/// `epoch` and `iter` are 1-based: inside an `after_*` callback they name the
/// epoch or iteration that has just completed. `iter` never resets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrainingCounters {
    pub(crate) epoch: u64,
    pub(crate) iter: u64,
    pub(crate) inner_iter: u64,
    max_epochs: u64,
    max_iters: u64,
    steps_per_epoch: u64,
    mode: TrainingMode,
}

impl TrainingCounters {
    /// Build counters from exactly one of the two bounds.
    pub fn new(
        max_epochs: Option<u64>,
        max_iters: Option<u64>,
        steps_per_epoch: u64,
    ) -> Result<Self> {
        if steps_per_epoch == 0 {
            return Err(RunnerError::config("steps_per_epoch must be >= 1"));
        }
        let (mode, max_epochs, max_iters) = match (max_epochs, max_iters) {
            (Some(_), Some(_)) => {
                return Err(RunnerError::config(
                    "only one of `max_epochs` or `max_iters` can be set",
                ));
            }
            (None, None) => {
                return Err(RunnerError::config(
                    "one of `max_epochs` or `max_iters` must be set",
                ));
            }
            (Some(0), None) => return Err(RunnerError::config("max_epochs must be >= 1")),
            (None, Some(0)) => return Err(RunnerError::config("max_iters must be >= 1")),
            (Some(epochs), None) => (TrainingMode::Epoch, epochs, epochs * steps_per_epoch),
            // Iteration mode runs as a single implicit epoch.
            (None, Some(iters)) => (TrainingMode::Iter, 1, iters),
        };
        Ok(Self {
            epoch: 1,
            iter: 1,
            inner_iter: 0,
            max_epochs,
            max_iters,
            steps_per_epoch,
            mode,
        })
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn iter(&self) -> u64 {
        self.iter
    }

    pub fn inner_iter(&self) -> u64 {
        self.inner_iter
    }

    pub fn max_epochs(&self) -> u64 {
        self.max_epochs
    }

    pub fn max_iters(&self) -> u64 {
        self.max_iters
    }

    pub fn steps_per_epoch(&self) -> u64 {
        self.steps_per_epoch
    }

    pub fn mode(&self) -> TrainingMode {
        self.mode
    }

    pub fn by_epoch(&self) -> bool {
        self.mode == TrainingMode::Epoch
    }

    /// Inner iterations in the current epoch: the dataset length in epoch
    /// mode, `max_iters` for the implicit epoch of iteration mode.
    pub fn iters_this_epoch(&self) -> u64 {
        match self.mode {
            TrainingMode::Epoch => self.steps_per_epoch,
            TrainingMode::Iter => self.max_iters,
        }
    }

    pub fn every_n_epochs(&self, n: i64) -> bool {
        every_n(self.epoch, n)
    }

    pub fn every_n_iters(&self, n: i64) -> bool {
        every_n(self.iter, n)
    }

    pub fn every_n_inner_iters(&self, n: i64) -> bool {
        every_n(self.inner_iter, n)
    }

    pub fn end_of_epoch(&self) -> bool {
        self.inner_iter == self.iters_this_epoch()
    }

    pub fn is_last_epoch(&self) -> bool {
        self.epoch == self.max_epochs
    }

    pub fn is_last_iter(&self) -> bool {
        self.iter == self.max_iters
    }
}

fn every_n(counter: u64, n: i64) -> bool {
    n > 0 && counter % n as u64 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_mode_derives_max_iters() {
        let c = TrainingCounters::new(Some(3), None, 5).unwrap();
        assert_eq!(c.mode(), TrainingMode::Epoch);
        assert_eq!(c.max_iters(), 15);
        assert_eq!((c.epoch(), c.iter(), c.inner_iter()), (1, 1, 0));
    }

    #[test]
    fn test_iter_mode_is_one_implicit_epoch() {
        let c = TrainingCounters::new(None, Some(7), 3).unwrap();
        assert_eq!(c.mode(), TrainingMode::Iter);
        assert_eq!(c.max_epochs(), 1);
        assert_eq!(c.max_iters(), 7);
        assert_eq!(c.iters_this_epoch(), 7);
    }

    #[test]
    fn test_bounds_validation() {
        assert!(TrainingCounters::new(Some(1), Some(1), 1).is_err());
        assert!(TrainingCounters::new(None, None, 1).is_err());
        assert!(TrainingCounters::new(Some(0), None, 1).is_err());
        assert!(TrainingCounters::new(Some(2), None, 0).is_err());
    }

    #[test]
    fn test_every_n_ignores_non_positive_interval() {
        let mut c = TrainingCounters::new(Some(4), None, 2).unwrap();
        c.epoch = 4;
        assert!(c.every_n_epochs(2));
        assert!(!c.every_n_epochs(3));
        assert!(!c.every_n_epochs(0));
        assert!(!c.every_n_epochs(-1));
        assert!(c.is_last_epoch());
    }

    #[test]
    fn test_every_n_iters_and_inner_iters() {
        let mut c = TrainingCounters::new(Some(2), None, 4).unwrap();
        c.iter = 6;
        c.inner_iter = 2;
        assert!(c.every_n_iters(3));
        assert!(!c.every_n_iters(4));
        assert!(c.every_n_inner_iters(2));
        assert!(!c.every_n_inner_iters(3));
        for n in [0, -2] {
            assert!(!c.every_n_iters(n));
            assert!(!c.every_n_inner_iters(n));
        }
    }

    #[test]
    fn test_end_of_epoch_and_last_iter() {
        let mut c = TrainingCounters::new(Some(2), None, 4).unwrap();
        c.inner_iter = 3;
        assert!(!c.end_of_epoch());
        c.inner_iter = 4;
        assert!(c.end_of_epoch());

        c.iter = 7;
        assert!(!c.is_last_iter());
        c.iter = 8;
        assert!(c.is_last_iter());
    }

    #[test]
    fn test_iter_mode_epoch_ends_at_max_iters() {
        let mut c = TrainingCounters::new(None, Some(7), 3).unwrap();
        c.inner_iter = 3;
        c.iter = 3;
        // a full pass over the data is not the end of the implicit epoch
        assert!(!c.end_of_epoch());
        assert!(!c.is_last_iter());

        c.inner_iter = 7;
        c.iter = 7;
        assert!(c.end_of_epoch());
        assert!(c.is_last_iter());
        assert!(c.is_last_epoch());
    }
}
