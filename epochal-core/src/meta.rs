//! Run metadata shared between the runner, hooks and resume logic.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

const HOOK_MSGS: &str = "hook_msgs";
const LAST_CKPT: &str = "last_ckpt";
const LAST_CKPT_SHA256: &str = "last_ckpt_sha256";

/// File name of the persisted metadata inside the work dir.
pub const RUN_META_FILE: &str = "run_meta.json";

/// Mutable JSON bookkeeping for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunMeta(Map<String, Value>);

impl RunMeta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata for a fresh run: a random `run_id` and the start time.
    pub fn for_new_run() -> Self {
        let mut meta = Self::new();
        meta.insert("run_id", uuid::Uuid::new_v4().to_string());
        meta.insert("started_at", Utc::now().to_rfc3339());
        meta
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn run_id(&self) -> Option<&str> {
        self.0.get("run_id").and_then(Value::as_str)
    }

    fn hook_msg(&self, key: &str) -> Option<&Value> {
        self.0.get(HOOK_MSGS)?.get(key)
    }

    /// Path of the most recently completed checkpoint.
    pub fn last_checkpoint(&self) -> Option<PathBuf> {
        self.hook_msg(LAST_CKPT)
            .and_then(Value::as_str)
            .map(PathBuf::from)
    }

    pub fn last_checkpoint_sha256(&self) -> Option<&str> {
        self.hook_msg(LAST_CKPT_SHA256).and_then(Value::as_str)
    }

    /// Point `hook_msgs.last_ckpt` at `path`. A non-object `hook_msgs` is
    /// replaced.
    pub fn set_last_checkpoint(&mut self, path: &Path, sha256: Option<String>) {
        let mut msgs = match self.0.remove(HOOK_MSGS) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        msgs.insert(
            LAST_CKPT.to_string(),
            Value::String(path.to_string_lossy().into_owned()),
        );
        match sha256 {
            Some(digest) => {
                msgs.insert(LAST_CKPT_SHA256.to_string(), Value::String(digest));
            }
            None => {
                msgs.remove(LAST_CKPT_SHA256);
            }
        }
        self.0.insert(HOOK_MSGS.to_string(), Value::Object(msgs));
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Load the metadata a previous run persisted in `work_dir`.
    pub fn load(work_dir: &Path) -> std::io::Result<Option<Self>> {
        crate::persistence::load_json(&work_dir.join(RUN_META_FILE))
    }
}

impl From<Map<String, Value>> for RunMeta {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
