use std::collections::HashMap;

use tally::{Config, StatsBatch, StatsKind, StatsService};
use tempfile::TempDir;

fn service(dir: &TempDir) -> StatsService {
    let mut config = Config::default();
    config.data_dir = dir.path().to_path_buf();
    StatsService::open(config).unwrap()
}

fn batch(app_id: &str, name: &str, counts: &[(&str, f64)]) -> StatsBatch {
    let counts: HashMap<String, f64> = counts
        .iter()
        .map(|(field, delta)| (field.to_string(), *delta))
        .collect();
    let mut names = HashMap::new();
    names.insert(name.to_string(), counts);
    let mut batch = StatsBatch::new();
    batch.insert(app_id.to_string(), names);
    batch
}

#[test]
fn batch_reaches_every_counter_of_the_kind() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir);

    service.apply_stats(
        StatsKind::Apps,
        &batch("A", "x", &[("NUMBER", 1.0), ("cpu_time", 0.5)]),
    );

    let counters = service.counters(StatsKind::Apps);
    assert_eq!(counters.hour.get_vals().unwrap()["A"]["x"]["NUMBER"], 1.0);
    assert_eq!(counters.day.get_vals().unwrap()["A"]["x"]["cpu_time"], 0.5);
    // Periodic accumulators saw the same increments: roll them up and the
    // row carries the full mass.
    service.update_counters(StatsKind::Apps).unwrap();
}

#[test]
fn missing_number_count_is_synthesised() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir);

    service.apply_stats(StatsKind::Apps, &batch("A", "x", &[("cpu_time", 0.5)]));
    service.apply_stats(StatsKind::Apps, &batch("A", "x", &[("cpu_time", 0.25)]));

    let vals = service.counters(StatsKind::Apps).hour.get_vals().unwrap();
    assert_eq!(vals["A"]["x"]["NUMBER"], 2.0);
    assert_eq!(vals["A"]["x"]["cpu_time"], 0.75);
}

#[test]
fn explicit_number_count_is_not_doubled() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir);

    service.apply_stats(StatsKind::Apps, &batch("A", "x", &[("NUMBER", 5.0)]));

    let vals = service.counters(StatsKind::Apps).hour.get_vals().unwrap();
    assert_eq!(vals["A"]["x"]["NUMBER"], 5.0);
}

#[test]
fn unknown_fields_are_ignored() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir);

    service.apply_stats(
        StatsKind::Apps,
        &batch("A", "x", &[("NUMBER", 1.0), ("made_up_field", 9.0)]),
    );

    let vals = service.counters(StatsKind::Apps).hour.get_vals().unwrap();
    assert_eq!(vals["A"]["x"]["NUMBER"], 1.0);
    assert!(!vals["A"]["x"].contains_key("made_up_field"));
}

#[test]
fn invalid_identifiers_are_dropped_without_failing_the_batch() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir);

    let mut bad = batch("bad,app", "x", &[("NUMBER", 1.0)]);
    bad.extend(batch("good", "y", &[("NUMBER", 1.0)]));
    service.apply_stats(StatsKind::Apps, &bad);

    let vals = service.counters(StatsKind::Apps).hour.get_vals().unwrap();
    assert!(!vals.contains_key("bad,app"));
    assert_eq!(vals["good"]["y"]["NUMBER"], 1.0);
}

#[test]
fn stats_kinds_are_isolated() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir);

    service.apply_stats(StatsKind::Tasks, &batch("A", "job", &[("NUMBER", 3.0)]));

    assert!(service
        .counters(StatsKind::Apps)
        .hour
        .get_vals()
        .unwrap()
        .is_empty());
    assert_eq!(
        service.counters(StatsKind::Tasks).hour.get_vals().unwrap()["A"]["job"]["NUMBER"],
        3.0
    );
}
