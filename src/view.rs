//! Materialized-view builder.
//!
//! Turns the two rolling-counter snapshots into one flat document per
//! `(app_id, name)` with `{field}_{period}` sums and `{field}_{period}_aver`
//! averages for `period` in `{hour, day}`, then atomically replaces the
//! view collection the UI sorts and paginates.

use std::collections::{BTreeSet, HashMap};

use tracing::info;

use crate::archive::{Archive, Document, Order};
use crate::config::NUMBER_FIELD;
use crate::counter::{CounterValues, RollingCounter};
use crate::error::Result;

/// Field averages per identifier; `None` encodes SQL-style null for
/// identifiers with no events in the window.
type AverageValues = HashMap<String, HashMap<String, HashMap<String, Option<f64>>>>;

/// Per-window averages: the event count becomes a per-second rate, every
/// other field a mean per event. With no events, all averages are null.
fn calc_aver_data(data: &CounterValues, interval_secs: u64) -> AverageValues {
    let mut aver = AverageValues::new();
    for (app_id, names) in data {
        let by_name = aver.entry(app_id.clone()).or_default();
        for (name, counts) in names {
            let req_count = counts.get(NUMBER_FIELD).copied().unwrap_or(0.0);
            let aver_counts = counts
                .iter()
                .map(|(field, value)| {
                    let mean = if req_count == 0.0 {
                        None
                    } else if field == NUMBER_FIELD {
                        Some(value / interval_secs as f64)
                    } else {
                        Some(value / req_count)
                    };
                    (field.clone(), mean)
                })
                .collect();
            by_name.insert(name.clone(), aver_counts);
        }
    }
    aver
}

fn set_sum_columns(
    docs: &mut HashMap<(String, String), Document>,
    data: &CounterValues,
    period: &str,
    fields: &[String],
) {
    for (app_id, names) in data {
        for (name, counts) in names {
            let doc = entry_doc(docs, app_id, name);
            for field in fields {
                let value = counts.get(field).copied().unwrap_or(0.0);
                doc.set(&format!("{field}_{period}"), value);
            }
        }
    }
}

fn set_aver_columns(
    docs: &mut HashMap<(String, String), Document>,
    data: &AverageValues,
    period: &str,
    fields: &[String],
) {
    for (app_id, names) in data {
        for (name, means) in names {
            let doc = entry_doc(docs, app_id, name);
            for field in fields {
                let key = format!("{field}_{period}_aver");
                match means.get(field).copied().flatten() {
                    Some(mean) => doc.set(&key, mean),
                    None => doc.set_null(&key),
                }
            }
        }
    }
}

fn entry_doc<'a>(
    docs: &'a mut HashMap<(String, String), Document>,
    app_id: &str,
    name: &str,
) -> &'a mut Document {
    docs.entry((app_id.to_string(), name.to_string()))
        .or_insert_with(|| {
            let mut doc = Document::new();
            doc.set("app_id", app_id);
            doc.set("name", name);
            doc
        })
}

/// Flatten hour and day snapshots into view documents, one per
/// `(app_id, name)` seen in either window.
pub fn build_view_docs(
    hour_data: &CounterValues,
    day_data: &CounterValues,
    hour_interval: u64,
    day_interval: u64,
    fields: &[String],
) -> Vec<Document> {
    let hour_aver = calc_aver_data(hour_data, hour_interval);
    let day_aver = calc_aver_data(day_data, day_interval);

    let mut docs = HashMap::new();
    set_sum_columns(&mut docs, hour_data, "hour", fields);
    set_aver_columns(&mut docs, &hour_aver, "hour", fields);
    set_sum_columns(&mut docs, day_data, "day", fields);
    set_aver_columns(&mut docs, &day_aver, "day", fields);

    let keys: BTreeSet<(String, String)> = docs.keys().cloned().collect();
    keys.into_iter()
        .filter_map(|key| docs.remove(&key))
        .collect()
}

/// Recompute the view collection from the two rolling counters.
pub fn update_cache(
    archive: &dyn Archive,
    collection: &str,
    hour_counter: &RollingCounter,
    day_counter: &RollingCounter,
    fields: &[String],
) -> Result<()> {
    let hour_data = hour_counter.get_vals()?;
    let day_data = day_counter.get_vals()?;
    let docs = build_view_docs(
        &hour_data,
        &day_data,
        hour_counter.interval(),
        day_counter.interval(),
        fields,
    );
    archive.ensure_index(collection, &[("app_id", Order::Asc), ("name", Order::Asc)])?;
    info!(collection, docs = docs.len(), "replacing view collection");
    archive.replace_all(collection, docs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(number: f64, cpu: f64) -> CounterValues {
        let mut counts = HashMap::new();
        counts.insert("NUMBER".to_string(), number);
        counts.insert("cpu_time".to_string(), cpu);
        let mut names = HashMap::new();
        names.insert("x".to_string(), counts);
        let mut data = CounterValues::new();
        data.insert("A".to_string(), names);
        data
    }

    fn fields() -> Vec<String> {
        vec!["NUMBER".to_string(), "cpu_time".to_string()]
    }

    #[test]
    fn sums_are_projected_unchanged() {
        let hour = snapshot(3600.0, 18.0);
        let day = snapshot(7200.0, 36.0);
        let docs = build_view_docs(&hour, &day, 3600, 86400, &fields());
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].get_f64("NUMBER_hour"), Some(3600.0));
        assert_eq!(docs[0].get_f64("NUMBER_day"), Some(7200.0));
        assert_eq!(docs[0].get_f64("cpu_time_hour"), Some(18.0));
    }

    #[test]
    fn averages_follow_rate_and_per_event_rules() {
        let hour = snapshot(3600.0, 18.0);
        let day = snapshot(7200.0, 36.0);
        let docs = build_view_docs(&hour, &day, 3600, 86400, &fields());
        // Requests per second.
        assert_eq!(docs[0].get_f64("NUMBER_hour_aver"), Some(1.0));
        // Mean per event.
        assert_eq!(docs[0].get_f64("cpu_time_hour_aver"), Some(0.005));
        assert_eq!(docs[0].get_f64("NUMBER_day_aver"), Some(7200.0 / 86400.0));
    }

    #[test]
    fn zero_events_yield_null_averages() {
        let hour = snapshot(0.0, 5.0);
        let day = CounterValues::new();
        let docs = build_view_docs(&hour, &day, 3600, 86400, &fields());
        assert_eq!(docs[0].get_f64("cpu_time_hour"), Some(5.0));
        assert!(docs[0].get("NUMBER_hour_aver").unwrap().is_null());
        assert!(docs[0].get("cpu_time_hour_aver").unwrap().is_null());
    }

    #[test]
    fn identifiers_missing_from_one_window_still_get_columns() {
        let hour = snapshot(10.0, 1.0);
        let day = CounterValues::new();
        let docs = build_view_docs(&hour, &day, 3600, 86400, &fields());
        assert_eq!(docs[0].get_f64("NUMBER_hour"), Some(10.0));
        assert!(docs[0].get("NUMBER_day").is_none());
    }
}
