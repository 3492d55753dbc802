use std::sync::Arc;

use tally::counter::PeriodicCounter;
use tally::{Archive, FastStore, FileArchive, Filter, MemoryStore, Order};
use tempfile::TempDir;

fn fields() -> Vec<String> {
    vec!["NUMBER".to_string(), "cpu_time".to_string()]
}

struct Fixture {
    _dir: TempDir,
    store: Arc<dyn FastStore>,
    archive: Arc<dyn Archive>,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn FastStore> = Arc::new(MemoryStore::new());
        let archive: Arc<dyn Archive> = Arc::new(FileArchive::open(dir.path()).unwrap());
        Self {
            _dir: dir,
            store,
            archive,
        }
    }

    fn counter(&self, divider: u32, period_hours: u32) -> PeriodicCounter {
        PeriodicCounter::new(
            Arc::clone(&self.store),
            Arc::clone(&self.archive),
            fields(),
            "appstats",
            "apps",
            divider,
            period_hours,
        )
    }
}

#[test]
fn single_tick_materialises_one_row() {
    let fx = Fixture::new();
    let counter = fx.counter(6, 144); // 10-minute buckets

    for i in 0..600 {
        counter
            .incrby_at("A", "x", "cpu_time", 1.0, i as f64)
            .unwrap();
    }
    counter.update_at(600).unwrap();

    let docs = fx
        .archive
        .find("appstats_apps_periodic-6", &Filter::all(), None, None)
        .unwrap();
    assert_eq!(docs.len(), 1);
    let doc = &docs[0];
    assert_eq!(doc.get_str("app_id"), Some("A"));
    assert_eq!(doc.get_str("name"), Some("x"));
    assert_eq!(doc.date(), Some(600));
    assert_eq!(doc.get_f64("cpu_time"), Some(600.0));
    assert_eq!(doc.get_f64("NUMBER"), Some(0.0));

    // Accumulator fully drained, rollup stamp persisted.
    assert_eq!(
        fx.store
            .get_float("appstats_apps,periodic,6,A,x,cpu_time")
            .unwrap(),
        Some(0.0)
    );
    assert_eq!(
        fx.store.get_str("appstats_apps,periodic,6,prev_upd").unwrap(),
        Some("600".to_string())
    );
}

#[test]
fn update_before_the_next_interval_is_a_no_op() {
    let fx = Fixture::new();
    let counter = fx.counter(6, 144);

    counter.incrby_at("A", "x", "cpu_time", 3.0, 0.0).unwrap();
    counter.update_at(600).unwrap();
    counter.incrby_at("A", "x", "cpu_time", 5.0, 610.0).unwrap();
    // Still inside the 600..1200 bucket.
    counter.update_at(1100).unwrap();

    let docs = fx
        .archive
        .find("appstats_apps_periodic-6", &Filter::all(), None, None)
        .unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(
        fx.store
            .get_float("appstats_apps,periodic,6,A,x,cpu_time")
            .unwrap(),
        Some(5.0)
    );
}

#[test]
fn rollup_drains_exactly_the_materialised_mass() {
    let fx = Fixture::new();
    let counter = fx.counter(6, 144);

    counter.incrby_at("A", "x", "cpu_time", 10.0, 0.0).unwrap();
    counter.update_at(600).unwrap();
    counter.incrby_at("A", "x", "cpu_time", 5.0, 650.0).unwrap();
    counter.update_at(1200).unwrap();

    let docs = fx
        .archive
        .find(
            "appstats_apps_periodic-6",
            &Filter::all(),
            Some(("date", Order::Asc)),
            None,
        )
        .unwrap();
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0].get_f64("cpu_time"), Some(10.0));
    assert_eq!(docs[1].get_f64("cpu_time"), Some(5.0));
    assert_eq!(
        fx.store
            .get_float("appstats_apps,periodic,6,A,x,cpu_time")
            .unwrap(),
        Some(0.0)
    );
}

#[test]
fn missed_intervals_are_back_dated_up_to_the_flood_guard() {
    let fx = Fixture::new();
    let counter = fx.counter(6, 144);

    // Establish a rollup baseline at t = 600.
    counter.incrby_at("A", "x", "cpu_time", 1.0, 0.0).unwrap();
    counter.update_at(600).unwrap();

    // Ten intervals pass with 600 units accumulated.
    counter.incrby_at("A", "x", "cpu_time", 600.0, 700.0).unwrap();
    counter.update_at(600 + 10 * 600).unwrap();

    let docs = fx
        .archive
        .find(
            "appstats_apps_periodic-6",
            &Filter::new().gt("date", 600),
            Some(("date", Order::Desc)),
            None,
        )
        .unwrap();
    // The value is averaged over the real gap, but only
    // MAX_PASSED_INTERVALS rows are materialised.
    assert_eq!(docs.len(), 5);
    let newest = &docs[0];
    assert_eq!(newest.date(), Some(6600));
    assert_eq!(newest.get_f64("cpu_time"), Some(60.0));
    let dates: Vec<i64> = docs.iter().filter_map(|d| d.date()).collect();
    assert_eq!(dates, vec![6600, 6000, 5400, 4800, 4200]);
    for doc in &docs {
        assert_eq!(doc.get_f64("cpu_time"), Some(60.0));
    }
    assert_eq!(
        fx.store
            .get_float("appstats_apps,periodic,6,A,x,cpu_time")
            .unwrap(),
        Some(0.0)
    );
}

#[test]
fn rows_past_retention_are_evicted() {
    let fx = Fixture::new();
    let counter = fx.counter(60, 6); // 1-minute buckets, 6 h retention

    let now = 1_000_000 - (1_000_000 % 60);
    let stale = now - 6 * 3600 - 60;
    let mut old_doc = tally::Document::new();
    old_doc.set("app_id", "A");
    old_doc.set("name", "x");
    old_doc.set("date", stale);
    old_doc.set("NUMBER", 1.0);
    fx.archive
        .insert("appstats_apps_periodic-60", vec![old_doc])
        .unwrap();

    counter
        .incrby_at("A", "x", "NUMBER", 1.0, now as f64 - 30.0)
        .unwrap();
    counter.update_at(now).unwrap();

    let docs = fx
        .archive
        .find("appstats_apps_periodic-60", &Filter::all(), None, None)
        .unwrap();
    assert!(docs.iter().all(|d| d.date() > Some(stale)));
}

#[test]
fn held_lock_skips_the_rollup() {
    let fx = Fixture::new();
    let counter = fx.counter(6, 144);

    counter.incrby_at("A", "x", "cpu_time", 7.0, 0.0).unwrap();
    fx.store
        .lock_acquire("appstats_apps,periodic,6,lock", "other-holder", 300, 590.0)
        .unwrap();
    counter.update_at(600).unwrap();

    // Nothing rolled up, nothing drained.
    let docs = fx
        .archive
        .find("appstats_apps_periodic-6", &Filter::all(), None, None)
        .unwrap();
    assert!(docs.is_empty());
    assert_eq!(
        fx.store
            .get_float("appstats_apps,periodic,6,A,x,cpu_time")
            .unwrap(),
        Some(7.0)
    );
}
