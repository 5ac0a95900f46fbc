//! Weighted scalar metric history with windowed averaging.

use crate::error::{Result, RunnerError};
use serde::Serialize;
use std::collections::BTreeMap;

/// Accumulates `(value, weight)` pairs per metric name.
///
/// History is append-only until [`LogBuffer::clear`]. [`LogBuffer::average`]
/// writes into a separate output slot that loggers read and reset.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LogBuffer {
    history: BTreeMap<String, Vec<(f64, u64)>>,
    output: BTreeMap<String, f64>,
    ready: bool,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append every value with the same weight.
    pub fn update<K, I>(&mut self, values: I, weight: u64)
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, f64)>,
    {
        for (key, value) in values {
            self.history
                .entry(key.into())
                .or_default()
                .push((value, weight));
        }
    }

    /// Weighted mean of the last `window` entries of each metric (all of
    /// them when `window == 0`), stored in the output slot.
    pub fn average(&mut self, window: usize) -> Result<()> {
        let mut output = BTreeMap::new();
        for (key, entries) in &self.history {
            let start = if window == 0 {
                0
            } else {
                entries.len().saturating_sub(window)
            };
            let tail = &entries[start..];
            let total_weight: u64 = tail.iter().map(|(_, w)| w).sum();
            if total_weight == 0 {
                return Err(RunnerError::EmptyWindow { key: key.clone() });
            }
            let weighted: f64 = tail.iter().map(|(v, w)| v * *w as f64).sum();
            output.insert(key.clone(), weighted / total_weight as f64);
        }
        self.output.extend(output);
        self.ready = true;
        Ok(())
    }

    /// Drop history and output.
    pub fn clear(&mut self) {
        self.history.clear();
        self.clear_output();
    }

    /// Drop the averaged output, keeping history for later windows.
    pub fn clear_output(&mut self) {
        self.output.clear();
        self.ready = false;
    }

    pub fn output(&self) -> &BTreeMap<String, f64> {
        &self.output
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Most recent raw value of every metric.
    pub fn latest(&self) -> BTreeMap<String, f64> {
        self.history
            .iter()
            .filter_map(|(key, entries)| entries.last().map(|(v, _)| (key.clone(), *v)))
            .collect()
    }

    pub fn history(&self, key: &str) -> Option<&[(f64, u64)]> {
        self.history.get(key).map(Vec::as_slice)
    }

    /// Number of tracked metrics.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LogBuffer {
        let mut buf = LogBuffer::new();
        buf.update([("loss", 2.0)], 1);
        buf.update([("loss", 4.0)], 1);
        buf.update([("loss", 6.0)], 2);
        buf
    }

    #[test]
    fn test_average_all() {
        let mut buf = sample();
        buf.average(0).unwrap();
        assert!(buf.is_ready());
        assert!((buf.output()["loss"] - 4.5).abs() < 1e-12);
    }

    #[test]
    fn test_average_window() {
        let mut buf = sample();
        buf.average(2).unwrap();
        assert!((buf.output()["loss"] - 16.0 / 3.0).abs() < 1e-12);
        // history is untouched
        assert_eq!(buf.history("loss").unwrap().len(), 3);
    }

    #[test]
    fn test_window_larger_than_history() {
        let mut buf = sample();
        buf.average(10).unwrap();
        assert!((buf.output()["loss"] - 4.5).abs() < 1e-12);
    }

    #[test]
    fn test_zero_weight_is_error() {
        let mut buf = LogBuffer::new();
        buf.update([("acc", 0.5)], 0);
        let err = buf.average(0).unwrap_err();
        assert!(matches!(err, RunnerError::EmptyWindow { ref key } if key == "acc"));
        assert!(!buf.is_ready());
    }

    #[test]
    fn test_clear_output_keeps_history() {
        let mut buf = sample();
        buf.average(0).unwrap();
        buf.clear_output();
        assert!(buf.output().is_empty());
        assert!(!buf.is_ready());
        assert_eq!(buf.len(), 1);

        buf.clear();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_latest() {
        let mut buf = sample();
        buf.update([("time", 0.1), ("loss", 1.0)], 1);
        let latest = buf.latest();
        assert_eq!(latest["loss"], 1.0);
        assert_eq!(latest["time"], 0.1);
    }
}
