//! In-process implementation of [`FastStore`].
//!
//! One mutex guards the whole keyspace; every trait method is a single
//! critical section, which gives the batch-visibility guarantee that
//! `apply` promises. State can be snapshotted to disk so sequential
//! operational commands observe what the server accumulated.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StatsError};

use super::{FastStore, StoreOp};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockEntry {
    token: String,
    expires: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    floats: HashMap<String, f64>,
    strings: HashMap<String, String>,
    lists: HashMap<String, VecDeque<f64>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    locks: HashMap<String, LockEntry>,
}

impl State {
    fn apply_op(&mut self, op: StoreOp) {
        match op {
            StoreOp::IncrFloat { key, delta } => {
                *self.floats.entry(key).or_insert(0.0) += delta;
            }
            StoreOp::SetFloat { key, value } => {
                self.floats.insert(key, value);
            }
            StoreOp::SetStr { key, value } => {
                self.strings.insert(key, value);
            }
            StoreOp::ListPopFront { key } => {
                if let Some(list) = self.lists.get_mut(&key) {
                    list.pop_front();
                }
            }
            StoreOp::ListPushBack { key, value } => {
                self.lists.entry(key).or_default().push_back(value);
            }
            StoreOp::ZSetAdd { key, member, score } => {
                self.zsets.entry(key).or_default().insert(member, score);
            }
            StoreOp::Delete { key } => {
                self.floats.remove(&key);
                self.strings.remove(&key);
                self.lists.remove(&key);
                self.zsets.remove(&key);
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    snapshot_path: Option<std::path::PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store bound to a snapshot file, loading it when present.
    /// [`FastStore::persist`] writes back to the same file.
    pub fn open(path: &Path) -> Result<Self> {
        let state = if path.exists() {
            let raw = fs::read_to_string(path)?;
            serde_json::from_str(&raw)
                .map_err(|err| StatsError::Serialization(format!("{}: {err}", path.display())))?
        } else {
            State::default()
        };
        Ok(Self {
            state: Mutex::new(state),
            snapshot_path: Some(path.to_path_buf()),
        })
    }

    /// Write a snapshot of the full keyspace. The write goes through a
    /// temporary file and a rename, so a crash never leaves a torn snapshot.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = {
            let state = self.state.lock();
            serde_json::to_string(&*state)
                .map_err(|err| StatsError::Serialization(err.to_string()))?
        };
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl FastStore for MemoryStore {
    fn incr_float(&self, key: &str, delta: f64) -> Result<f64> {
        let mut state = self.state.lock();
        let val = state.floats.entry(key.to_string()).or_insert(0.0);
        *val += delta;
        Ok(*val)
    }

    fn get_float(&self, key: &str) -> Result<Option<f64>> {
        Ok(self.state.lock().floats.get(key).copied())
    }

    fn set_float(&self, key: &str, value: f64) -> Result<()> {
        self.state.lock().floats.insert(key.to_string(), value);
        Ok(())
    }

    fn get_str(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.lock().strings.get(key).cloned())
    }

    fn set_str(&self, key: &str, value: &str) -> Result<()> {
        self.state
            .lock()
            .strings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn list_len(&self, key: &str) -> Result<usize> {
        Ok(self.state.lock().lists.get(key).map_or(0, VecDeque::len))
    }

    fn list_range(&self, key: &str) -> Result<Vec<f64>> {
        Ok(self
            .state
            .lock()
            .lists
            .get(key)
            .map_or_else(Vec::new, |list| list.iter().copied().collect()))
    }

    fn list_push_back(&self, key: &str, value: f64) -> Result<()> {
        self.state
            .lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value);
        Ok(())
    }

    fn list_pop_front(&self, key: &str) -> Result<Option<f64>> {
        Ok(self
            .state
            .lock()
            .lists
            .get_mut(key)
            .and_then(VecDeque::pop_front))
    }

    fn zset_add(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.state
            .lock()
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    fn zset_remove_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<usize> {
        let mut state = self.state.lock();
        let Some(zset) = state.zsets.get_mut(key) else {
            return Ok(0);
        };
        let before = zset.len();
        zset.retain(|_, score| *score < min || *score > max);
        Ok(before - zset.len())
    }

    fn zset_scan(&self, key: &str) -> Result<Vec<(String, f64)>> {
        let state = self.state.lock();
        let mut members: Vec<(String, f64)> = state
            .zsets
            .get(key)
            .map_or_else(Vec::new, |zset| {
                zset.iter().map(|(m, s)| (m.clone(), *s)).collect()
            });
        members.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        Ok(members)
    }

    fn apply(&self, ops: Vec<StoreOp>) -> Result<()> {
        let mut state = self.state.lock();
        for op in ops {
            state.apply_op(op);
        }
        Ok(())
    }

    fn lock_acquire(&self, key: &str, token: &str, ttl_secs: u64, now: f64) -> Result<bool> {
        let mut state = self.state.lock();
        match state.locks.get(key) {
            Some(entry) if entry.expires > now => Ok(false),
            _ => {
                state.locks.insert(
                    key.to_string(),
                    LockEntry {
                        token: token.to_string(),
                        expires: now + ttl_secs as f64,
                    },
                );
                Ok(true)
            }
        }
    }

    fn lock_release(&self, key: &str, token: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.locks.get(key).is_some_and(|entry| entry.token == token) {
            state.locks.remove(key);
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        match &self.snapshot_path {
            Some(path) => self.save(path),
            None => Ok(()),
        }
    }

    fn remove_prefix(&self, prefix: &str) -> Result<usize> {
        let mut state = self.state.lock();
        let mut removed = 0;
        macro_rules! prune {
            ($map:expr) => {
                let before = $map.len();
                $map.retain(|key, _| !key.starts_with(prefix));
                removed += before - $map.len();
            };
        }
        prune!(state.floats);
        prune!(state.strings);
        prune!(state.lists);
        prune!(state.zsets);
        prune!(state.locks);
        Ok(removed)
    }
}
