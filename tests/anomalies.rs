use std::sync::Arc;

use tally::counter::PeriodicCounter;
use tally::{Anomaly, Archive, Document, FastStore, FileArchive, MemoryStore};
use tempfile::TempDir;

const NOW: i64 = 100_000;
const COLLECTION: &str = "appstats_apps_periodic-6";

fn fields() -> Vec<String> {
    vec!["NUMBER".to_string(), "cpu_time".to_string()]
}

fn row(app_id: &str, name: &str, date: i64, number: f64) -> Document {
    let mut doc = Document::new();
    doc.set("app_id", app_id);
    doc.set("name", name);
    doc.set("date", date);
    doc.set("NUMBER", number);
    doc.set("cpu_time", 0.0);
    doc
}

fn counter(dir: &TempDir) -> (PeriodicCounter, Arc<dyn Archive>) {
    let store: Arc<dyn FastStore> = Arc::new(MemoryStore::new());
    let archive: Arc<dyn Archive> = Arc::new(FileArchive::open(dir.path()).unwrap());
    let counter = PeriodicCounter::new(
        store,
        Arc::clone(&archive),
        fields(),
        "appstats",
        "apps",
        6,
        144,
    );
    (counter, archive)
}

/// ref window (NOW - 3 h, NOW - 1 h): mean 100; check window: mean 50.
fn seed_halved_rate(archive: &dyn Archive) {
    archive
        .insert(
            COLLECTION,
            vec![
                row("A", "x", NOW - 3 * 3600 + 600, 100.0),
                row("A", "x", NOW - 2 * 3600, 100.0),
                row("A", "x", NOW - 1800, 50.0),
            ],
        )
        .unwrap();
}

#[test]
fn halved_rate_is_flagged_at_higher_sensitivity() {
    let dir = TempDir::new().unwrap();
    let (counter, archive) = counter(&dir);
    seed_halved_rate(archive.as_ref());

    let anomalies = counter.find_anomalies_at(2, 1, 0.6, NOW).unwrap();
    // Relative error 0.5 >= 1 - 0.6.
    assert!(anomalies.contains(&Anomaly {
        app_id: "A".to_string(),
        name: "x".to_string(),
        field: "NUMBER".to_string(),
    }));
}

#[test]
fn halved_rate_passes_at_lower_sensitivity() {
    let dir = TempDir::new().unwrap();
    let (counter, archive) = counter(&dir);
    seed_halved_rate(archive.as_ref());

    let anomalies = counter.find_anomalies_at(2, 1, 0.4, NOW).unwrap();
    assert!(!anomalies
        .iter()
        .any(|anomaly| anomaly.field == "NUMBER" && anomaly.app_id == "A"));
}

#[test]
fn missing_check_data_counts_as_zero() {
    let dir = TempDir::new().unwrap();
    let (counter, archive) = counter(&dir);
    archive
        .insert(COLLECTION, vec![row("A", "x", NOW - 2 * 3600, 100.0)])
        .unwrap();

    // Identifier disappeared entirely: full deviation.
    let anomalies = counter.find_anomalies_at(2, 1, 0.9, NOW).unwrap();
    assert!(anomalies.iter().any(|a| a.field == "NUMBER"));
}

#[test]
fn zero_reference_is_skipped() {
    let dir = TempDir::new().unwrap();
    let (counter, archive) = counter(&dir);
    archive
        .insert(
            COLLECTION,
            vec![
                row("A", "x", NOW - 2 * 3600, 0.0),
                row("A", "x", NOW - 1800, 500.0),
            ],
        )
        .unwrap();

    let anomalies = counter.find_anomalies_at(2, 1, 0.9, NOW).unwrap();
    assert!(anomalies.is_empty());
}

#[test]
fn detection_results_back_the_view_anomaly_names() {
    let dir = TempDir::new().unwrap();
    let mut config = tally::Config::default();
    config.data_dir = dir.path().to_path_buf();
    let service = tally::StatsService::open(config).unwrap();

    // Halved request rate in the most recent hour, seeded into the
    // counter the detector picks for a 2 h + 1 h span.
    let now = tally::clock::now_secs();
    service
        .archive()
        .insert(
            "appstats_apps_periodic-60",
            vec![
                row("A", "x", now - 9000, 100.0),
                row("A", "x", now - 7200, 100.0),
                row("A", "x", now - 1800, 50.0),
            ],
        )
        .unwrap();

    let anomalies = service.find_anomalies(2, 1, 0.6).unwrap();
    assert!(anomalies.iter().any(|a| a.name == "x"));
    assert_eq!(service.anomalous_names("A").unwrap(), vec!["x"]);
    assert!(service.anomalous_names("other").unwrap().is_empty());
}

#[test]
fn window_arguments_are_validated() {
    let dir = TempDir::new().unwrap();
    let (counter, _archive) = counter(&dir);

    assert!(counter.find_anomalies_at(1, 2, 0.5, NOW).is_err());
    assert!(counter.find_anomalies_at(0, 0, 0.5, NOW).is_err());
    assert!(counter.find_anomalies_at(2, 1, 0.0, NOW).is_err());
    assert!(counter.find_anomalies_at(2, 1, 1.0, NOW).is_err());
    assert!(counter.find_anomalies_at(2, 1, 1.5, NOW).is_err());
}
