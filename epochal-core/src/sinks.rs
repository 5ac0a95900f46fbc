//! Stock sinks: a JSON checkpoint writer and a JSON-lines metrics file.

use crate::collaborators::{CheckpointSink, LogSink, Model, Optimizers};
use crate::error::{Result, RunnerError};
use crate::meta::RunMeta;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Writes `{meta, model, optimizer}` as a single JSON document.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCheckpointSink;

impl<B> CheckpointSink<B> for JsonCheckpointSink {
    fn save(
        &mut self,
        model: &dyn Model<B>,
        optimizers: Option<&Optimizers>,
        meta: &RunMeta,
        path: &Path,
    ) -> Result<()> {
        let document = serde_json::json!({
            "meta": meta,
            "model_name": model.name(),
            "state_dict": model.state(),
            "optimizer": optimizers.map(Optimizers::state),
        });
        let file = File::create(path).map_err(|e| RunnerError::fs(path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &document)?;
        writer.flush().map_err(|e| RunnerError::fs(path, e))?;
        Ok(())
    }
}

/// One averaged metrics line.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsRecord<'a> {
    pub mode: &'a str,
    pub epoch: u64,
    pub iter: u64,
    pub inner_iter: u64,
    pub metrics: &'a BTreeMap<String, f64>,
}

/// Append-only JSON-lines metrics file.
///
/// Cloning yields another handle to the same buffered writer, so the logger
/// hook can write while the runner owns the flushing side.
#[derive(Debug, Clone)]
pub struct JsonlMetricsSink {
    path: PathBuf,
    writer: Arc<Mutex<BufWriter<File>>>,
}

impl JsonlMetricsSink {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RunnerError::fs(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| RunnerError::fs(&path, e))?;
        Ok(Self {
            path,
            writer: Arc::new(Mutex::new(BufWriter::new(file))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, record: &MetricsRecord<'_>) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| RunnerError::sink("metrics writer lock poisoned"))?;
        serde_json::to_writer(&mut *writer, record)?;
        writer
            .write_all(b"\n")
            .map_err(|e| RunnerError::fs(&self.path, e))
    }
}

impl LogSink for JsonlMetricsSink {
    fn flush(&mut self) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| RunnerError::sink("metrics writer lock poisoned"))?;
        writer.flush().map_err(|e| RunnerError::fs(&self.path, e))?;
        writer
            .get_ref()
            .sync_data()
            .map_err(|e| RunnerError::fs(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::StepOutput;
    use tempfile::TempDir;

    struct Constant;

    impl Model<u8> for Constant {
        fn train_step(&mut self, _batch: u8, _opt: &mut Optimizers) -> Result<StepOutput> {
            Ok(StepOutput::new(1))
        }

        fn state(&self) -> serde_json::Value {
            serde_json::json!({"w": 1.5})
        }
    }

    #[test]
    fn test_json_checkpoint_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("epoch_1.pth");
        let mut meta = RunMeta::new();
        meta.insert("epoch", 1);

        let mut sink = JsonCheckpointSink;
        CheckpointSink::<u8>::save(&mut sink, &Constant, None, &meta, &path).unwrap();

        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["meta"]["epoch"], 1);
        assert_eq!(doc["state_dict"]["w"], 1.5);
        assert_eq!(doc["model_name"], "Constant");
        assert!(doc["optimizer"].is_null());
    }

    #[test]
    fn test_jsonl_lines_visible_after_flush() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("metrics.jsonl");
        let mut sink = JsonlMetricsSink::open(&path).unwrap();
        let handle = sink.clone();

        let mut metrics = BTreeMap::new();
        metrics.insert("loss".to_string(), 0.5);
        for iter in 1..=2 {
            handle
                .write(&MetricsRecord {
                    mode: "train",
                    epoch: 1,
                    iter,
                    inner_iter: iter,
                    metrics: &metrics,
                })
                .unwrap();
        }
        sink.flush().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["metrics"]["loss"], 0.5);
        assert_eq!(first["iter"], 1);
    }
}
