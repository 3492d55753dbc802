//! File-backed implementation of [`Archive`].
//!
//! One JSON-lines file per collection under the archive directory. The
//! whole data set is held in memory behind a mutex; inserts append to the
//! collection file, removals rewrite it through a temporary file and a
//! rename. Collection names are restricted to path-safe characters, which
//! the fixed `appstats_*` naming scheme satisfies.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, StatsError};

use super::{compare_values, Archive, Document, Filter, IdentifierAverages, Order};

const COLLECTION_EXT: &str = "jsonl";

#[derive(Default)]
struct ArchiveState {
    collections: HashMap<String, Vec<Document>>,
    next_id: u64,
}

pub struct FileArchive {
    dir: PathBuf,
    state: Mutex<ArchiveState>,
}

impl FileArchive {
    /// Open the archive rooted at `dir`, loading every collection file.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let mut state = ArchiveState::default();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(COLLECTION_EXT) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let docs = load_collection(&path)?;
            for doc in &docs {
                if let Some(id) = doc.get_i64("_id") {
                    state.next_id = state.next_id.max(id as u64 + 1);
                }
            }
            state.collections.insert(name.to_string(), docs);
        }
        debug!(
            dir = %dir.display(),
            collections = state.collections.len(),
            "archive opened"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{collection}.{COLLECTION_EXT}"))
    }

    fn append_docs(&self, collection: &str, docs: &[Document]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.collection_path(collection))?;
        let mut buf = String::new();
        for doc in docs {
            let line = serde_json::to_string(doc)
                .map_err(|err| StatsError::Serialization(err.to_string()))?;
            buf.push_str(&line);
            buf.push('\n');
        }
        file.write_all(buf.as_bytes())?;
        Ok(())
    }

    fn rewrite(&self, collection: &str, docs: &[Document]) -> Result<()> {
        let path = self.collection_path(collection);
        let mut buf = String::new();
        for doc in docs {
            let line = serde_json::to_string(doc)
                .map_err(|err| StatsError::Serialization(err.to_string()))?;
            buf.push_str(&line);
            buf.push('\n');
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, buf)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn check_name(collection: &str) -> Result<()> {
        let ok = !collection.is_empty()
            && collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if ok {
            Ok(())
        } else {
            Err(StatsError::InvalidArgument(format!(
                "bad collection name {collection:?}"
            )))
        }
    }
}

fn load_collection(path: &Path) -> Result<Vec<Document>> {
    let raw = fs::read_to_string(path)?;
    let mut docs = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let doc: Document = serde_json::from_str(line)
            .map_err(|err| StatsError::Serialization(format!("{}: {err}", path.display())))?;
        docs.push(doc);
    }
    Ok(docs)
}

impl Archive for FileArchive {
    fn insert(&self, collection: &str, mut docs: Vec<Document>) -> Result<()> {
        Self::check_name(collection)?;
        if docs.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        for doc in &mut docs {
            doc.set("_id", state.next_id);
            state.next_id += 1;
        }
        self.append_docs(collection, &docs)?;
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .extend(docs);
        Ok(())
    }

    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Option<(&str, Order)>,
        limit: Option<usize>,
    ) -> Result<Vec<Document>> {
        let state = self.state.lock();
        let mut matched: Vec<Document> = state
            .collections
            .get(collection)
            .map_or_else(Vec::new, |docs| {
                docs.iter().filter(|d| filter.matches(d)).cloned().collect()
            });
        if let Some((field, order)) = sort {
            matched.sort_by(|a, b| {
                let ord = compare_values(a.get(field), b.get(field));
                match order {
                    Order::Asc => ord,
                    Order::Desc => ord.reverse(),
                }
            });
        }
        if let Some(limit) = limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>> {
        let state = self.state.lock();
        Ok(state
            .collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| filter.matches(d)).cloned()))
    }

    fn remove(&self, collection: &str, filter: &Filter) -> Result<usize> {
        let mut state = self.state.lock();
        let Some(docs) = state.collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|d| !filter.matches(d));
        let removed = before - docs.len();
        if removed > 0 {
            let snapshot = docs.clone();
            self.rewrite(collection, &snapshot)?;
        }
        Ok(removed)
    }

    fn replace_all(&self, collection: &str, mut docs: Vec<Document>) -> Result<()> {
        Self::check_name(collection)?;
        let mut state = self.state.lock();
        for doc in &mut docs {
            doc.set("_id", state.next_id);
            state.next_id += 1;
        }
        self.rewrite(collection, &docs)?;
        state.collections.insert(collection.to_string(), docs);
        Ok(())
    }

    fn ensure_index(&self, collection: &str, fields: &[(&str, Order)]) -> Result<()> {
        // Advisory only: the in-memory scans need no index structures.
        debug!(collection, ?fields, "index hint recorded");
        Ok(())
    }

    fn avg_by_identifier(
        &self,
        collection: &str,
        fields: &[String],
        start: i64,
        end: i64,
    ) -> Result<IdentifierAverages> {
        let state = self.state.lock();
        let mut sums: HashMap<(String, String), HashMap<String, (f64, u64)>> = HashMap::new();
        if let Some(docs) = state.collections.get(collection) {
            for doc in docs {
                let Some(date) = doc.date() else { continue };
                if date <= start || date >= end {
                    continue;
                }
                let (Some(app_id), Some(name)) = (doc.get_str("app_id"), doc.get_str("name"))
                else {
                    continue;
                };
                let entry = sums
                    .entry((app_id.to_string(), name.to_string()))
                    .or_default();
                for field in fields {
                    if let Some(val) = doc.get_f64(field) {
                        let slot = entry.entry(field.clone()).or_insert((0.0, 0));
                        slot.0 += val;
                        slot.1 += 1;
                    }
                }
            }
        }
        let averages = sums
            .into_iter()
            .map(|(id, by_field)| {
                let means = by_field
                    .into_iter()
                    .map(|(field, (sum, count))| (field, sum / count as f64))
                    .collect();
                (id, means)
            })
            .collect();
        Ok(averages)
    }

    fn collection_names(&self) -> Result<Vec<String>> {
        let state = self.state.lock();
        let mut names: Vec<String> = state.collections.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn drop_collection(&self, collection: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.collections.remove(collection);
        let path = self.collection_path(collection);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
