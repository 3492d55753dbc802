//! Anomaly reporting.

use serde::Serialize;

use crate::archive::{Archive, Document, Filter};
use crate::error::Result;

/// Collection holding the most recent detection run.
pub const ANOMALIES_COLLECTION: &str = "anomalies";

/// An identifier whose recent mean deviates from its reference mean
/// beyond the sensitivity threshold.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Anomaly {
    pub app_id: String,
    pub name: String,
    pub field: String,
}

/// Replace the stored anomaly set with the outcome of a detection run.
pub fn store_anomalies(
    archive: &dyn Archive,
    anomalies: &[Anomaly],
    detected_at: i64,
) -> Result<()> {
    let docs = anomalies
        .iter()
        .map(|anomaly| {
            let mut doc = Document::new();
            doc.set("app_id", anomaly.app_id.as_str());
            doc.set("name", anomaly.name.as_str());
            doc.set("field", anomaly.field.as_str());
            doc.set("date", detected_at);
            doc
        })
        .collect();
    archive.replace_all(ANOMALIES_COLLECTION, docs)
}

/// Names flagged anomalous for one application, as consumed by the view
/// endpoints.
pub fn anomalous_names(archive: &dyn Archive, app_id: &str) -> Result<Vec<String>> {
    let docs = archive.find(
        ANOMALIES_COLLECTION,
        &Filter::new().eq("app_id", app_id),
        None,
        None,
    )?;
    let mut names: Vec<String> = docs
        .iter()
        .filter_map(|doc| doc.get_str("name").map(str::to_string))
        .collect();
    names.sort();
    names.dedup();
    Ok(names)
}
