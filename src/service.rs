//! Service wiring: counter topology, ingest routing and the operations
//! behind the CLI and HTTP surfaces.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::anomaly::{self, Anomaly, ANOMALIES_COLLECTION};
use crate::archive::{Archive, Document, FileArchive, Filter, Order};
use crate::clock;
use crate::config::{Config, NUMBER_FIELD, PERIODIC_TOPOLOGY, ROLLING_WINDOWS};
use crate::counter::{PeriodicCounter, RollingCounter};
use crate::error::{Result, StatsError};
use crate::ingest::StatsBatch;
use crate::store::{FastStore, MemoryStore};
use crate::view;

/// Collection holding operator-submitted events.
pub const EVENTS_COLLECTION: &str = "appstats_events";

/// The two tracked statistics families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsKind {
    Apps,
    Tasks,
}

impl StatsKind {
    pub const ALL: [StatsKind; 2] = [StatsKind::Apps, StatsKind::Tasks];

    pub fn as_str(self) -> &'static str {
        match self {
            StatsKind::Apps => "apps",
            StatsKind::Tasks => "tasks",
        }
    }

    /// View collection for this family.
    pub fn docs_collection(self) -> &'static str {
        match self {
            StatsKind::Apps => "appstats_docs",
            StatsKind::Tasks => "appstats_tasks_docs",
        }
    }
}

impl std::fmt::Display for StatsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StatsKind {
    type Err = StatsError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "apps" => Ok(StatsKind::Apps),
            "tasks" => Ok(StatsKind::Tasks),
            other => Err(StatsError::InvalidArgument(format!(
                "unknown stats kind {other:?}"
            ))),
        }
    }
}

/// An operator-submitted event marker, as accepted by `POST /add/event`.
#[derive(Debug, Clone, Deserialize)]
pub struct Event {
    pub app_id: String,
    pub title: String,
    /// Unix seconds.
    pub timestamp: i64,
    #[serde(default)]
    pub descr: String,
}

/// All counters of one stats family: two rollings and the periodic
/// cascade, most accurate first.
pub struct CounterSet {
    kind: StatsKind,
    pub hour: RollingCounter,
    pub day: RollingCounter,
    pub periodics: Vec<PeriodicCounter>,
}

impl CounterSet {
    fn new(
        kind: StatsKind,
        store: &Arc<dyn FastStore>,
        archive: &Arc<dyn Archive>,
        fields: &[String],
        store_prefix: &str,
    ) -> Self {
        let [(hour_interval, hour_part), (day_interval, day_part)] = ROLLING_WINDOWS;
        let hour = RollingCounter::new(
            Arc::clone(store),
            fields.to_vec(),
            store_prefix,
            kind.as_str(),
            hour_interval,
            hour_part,
        );
        let day = RollingCounter::new(
            Arc::clone(store),
            fields.to_vec(),
            store_prefix,
            kind.as_str(),
            day_interval,
            day_part,
        );
        let mut periodics: Vec<PeriodicCounter> = PERIODIC_TOPOLOGY
            .iter()
            .map(|&(divider, period_hours)| {
                PeriodicCounter::new(
                    Arc::clone(store),
                    Arc::clone(archive),
                    fields.to_vec(),
                    store_prefix,
                    kind.as_str(),
                    divider,
                    period_hours,
                )
            })
            .collect();
        periodics.sort_by_key(PeriodicCounter::period_hours);
        Self {
            kind,
            hour,
            day,
            periodics,
        }
    }

    /// Route one ingest batch to every counter. A missing `NUMBER` count
    /// is synthesised as one event. Increment failures are logged and
    /// swallowed; the client response has long since been sent.
    pub fn apply_batch(&self, batch: &StatsBatch, now_ts: f64) {
        for (app_id, names) in batch {
            for (name, counts) in names {
                if !counts.contains_key(NUMBER_FIELD) {
                    self.incr_all(app_id, name, NUMBER_FIELD, 1.0, now_ts);
                }
                for (field, delta) in counts {
                    self.incr_all(app_id, name, field, *delta, now_ts);
                }
            }
        }
    }

    fn incr_all(&self, app_id: &str, name: &str, field: &str, delta: f64, now_ts: f64) {
        for rolling in [&self.hour, &self.day] {
            if let Err(err) = rolling.incrby_at(app_id, name, field, delta, now_ts) {
                warn!(%err, app_id, name, field, "dropping increment");
                return;
            }
        }
        for periodic in &self.periodics {
            if let Err(err) = periodic.incrby_at(app_id, name, field, delta, now_ts) {
                warn!(%err, app_id, name, field, "dropping increment");
                return;
            }
        }
    }

    /// Run one `update()` round across all counters of this family.
    pub fn update(&self) -> Result<()> {
        self.hour.update()?;
        self.day.update()?;
        for periodic in &self.periodics {
            periodic.update()?;
        }
        Ok(())
    }

    /// The most accurate periodic counter whose retention covers `hours`,
    /// falling back to the longest-lived one.
    pub fn periodic_covering(&self, hours: u32) -> &PeriodicCounter {
        self.periodics
            .iter()
            .find(|counter| hours <= counter.period_hours())
            .unwrap_or_else(|| self.periodics.last().expect("periodic topology is fixed"))
    }

    pub fn kind(&self) -> StatsKind {
        self.kind
    }
}

/// Per-identifier chart series, timestamps in epoch milliseconds UTC.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChartInfo {
    /// Requests per second, null where the bucket saw no events.
    pub num_data: Vec<(i64, Option<f64>)>,
    /// One series per configured time field: milliseconds per event.
    pub time_data: Vec<Vec<(i64, Option<f64>)>>,
    /// Timestamps of stored anomalies for this identifier.
    pub anomalies_data: Vec<i64>,
}

pub struct StatsService {
    config: Config,
    fields: Vec<String>,
    visible_fields: Vec<String>,
    time_fields: Vec<String>,
    store: Arc<dyn FastStore>,
    archive: Arc<dyn Archive>,
    apps: CounterSet,
    tasks: CounterSet,
}

impl StatsService {
    /// Open the service on the bundled process-local backends under
    /// `config.data_dir`.
    pub fn open(config: Config) -> Result<Self> {
        let store: Arc<dyn FastStore> =
            Arc::new(MemoryStore::open(&config.data_dir.join("store.json"))?);
        let archive: Arc<dyn Archive> =
            Arc::new(FileArchive::open(&config.data_dir.join("archive"))?);
        Self::with_backends(config, store, archive)
    }

    /// Wire the service over injected store implementations.
    pub fn with_backends(
        config: Config,
        store: Arc<dyn FastStore>,
        archive: Arc<dyn Archive>,
    ) -> Result<Self> {
        config.validate()?;
        let fields = config.field_keys();
        let apps = CounterSet::new(
            StatsKind::Apps,
            &store,
            &archive,
            &fields,
            &config.store_prefix,
        );
        let tasks = CounterSet::new(
            StatsKind::Tasks,
            &store,
            &archive,
            &fields,
            &config.store_prefix,
        );
        Ok(Self {
            visible_fields: config.visible_field_keys(),
            time_fields: config.time_field_keys(),
            fields,
            store,
            archive,
            apps,
            tasks,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn archive(&self) -> &dyn Archive {
        self.archive.as_ref()
    }

    pub fn counters(&self, kind: StatsKind) -> &CounterSet {
        match kind {
            StatsKind::Apps => &self.apps,
            StatsKind::Tasks => &self.tasks,
        }
    }

    /// Apply one ingest batch now. Used by the ingest workers.
    pub fn apply_stats(&self, kind: StatsKind, batch: &StatsBatch) {
        self.counters(kind).apply_batch(batch, clock::now_ts());
    }

    /// One `update()` round for every counter of `kind`.
    pub fn update_counters(&self, kind: StatsKind) -> Result<()> {
        self.counters(kind).update()
    }

    /// Rebuild the materialized view of `kind`.
    pub fn update_cache(&self, kind: StatsKind) -> Result<()> {
        let set = self.counters(kind);
        view::update_cache(
            self.archive.as_ref(),
            kind.docs_collection(),
            &set.hour,
            &set.day,
            &self.fields,
        )
    }

    /// Store operator events, keep the events index hint fresh, and age
    /// out events past the retention horizon.
    pub fn add_events(&self, events: Vec<Event>) -> Result<()> {
        if !events.is_empty() {
            let docs = events
                .into_iter()
                .map(|event| {
                    let mut doc = Document::new();
                    doc.set("app_id", event.app_id.as_str());
                    doc.set("title", event.title.as_str());
                    doc.set("date", event.timestamp);
                    doc.set("descr", event.descr.as_str());
                    doc
                })
                .collect();
            self.archive.insert(EVENTS_COLLECTION, docs)?;
        }
        self.archive.ensure_index(
            EVENTS_COLLECTION,
            &[("date", Order::Asc), ("app_id", Order::Asc)],
        )?;
        self.evict_events()?;
        Ok(())
    }

    /// Drop events older than `events_period_hours`. Returns the number
    /// removed. Runs on ingest and on every scheduler cache pass, so the
    /// collection stays bounded even when no new events arrive.
    pub fn evict_events(&self) -> Result<usize> {
        let cutoff = clock::now_secs() - self.config.events_period_hours as i64 * 3600;
        self.archive
            .remove(EVENTS_COLLECTION, &Filter::new().lte("date", cutoff))
    }

    /// Names currently flagged anomalous for one application, as shown by
    /// the view endpoints.
    pub fn anomalous_names(&self, app_id: &str) -> Result<Vec<String>> {
        anomaly::anomalous_names(self.archive.as_ref(), app_id)
    }

    /// Read the materialized view, sorted and limited for display.
    pub fn view_docs(
        &self,
        kind: StatsKind,
        app_id: Option<&str>,
        sort_by_field: &str,
        sort_by_period: &str,
        rows: usize,
    ) -> Result<Vec<Document>> {
        if sort_by_field != "name" && !self.visible_fields.iter().any(|f| f == sort_by_field) {
            return Err(StatsError::InvalidArgument(format!(
                "unknown sort field {sort_by_field:?}"
            )));
        }
        if sort_by_period != "hour" && sort_by_period != "day" {
            return Err(StatsError::InvalidArgument(format!(
                "unknown sort period {sort_by_period:?}"
            )));
        }
        let mut filter = Filter::new();
        if let Some(app_id) = app_id {
            filter = filter.eq("app_id", app_id);
        }
        let sort_key;
        let sort = if sort_by_field == "name" {
            ("name", Order::Asc)
        } else {
            sort_key = format!("{sort_by_field}_{sort_by_period}");
            (sort_key.as_str(), Order::Desc)
        };
        self.archive
            .find(kind.docs_collection(), &filter, Some(sort), Some(rows))
    }

    /// The materialized-view row for one identifier, if present.
    pub fn view_doc(
        &self,
        kind: StatsKind,
        app_id: &str,
        name: &str,
    ) -> Result<Option<Document>> {
        self.archive.find_one(
            kind.docs_collection(),
            &Filter::new().eq("app_id", app_id).eq("name", name),
        )
    }

    /// Chart series for one identifier over the trailing `hours`.
    pub fn chart_info(
        &self,
        kind: StatsKind,
        app_id: &str,
        name: &str,
        hours: u32,
    ) -> Result<ChartInfo> {
        self.chart_info_at(kind, app_id, name, hours, clock::now_secs())
    }

    pub fn chart_info_at(
        &self,
        kind: StatsKind,
        app_id: &str,
        name: &str,
        hours: u32,
        now_secs: i64,
    ) -> Result<ChartInfo> {
        let counter = self.counters(kind).periodic_covering(hours);
        let starting_from = now_secs - hours as i64 * 3600;
        let docs = self.archive.find(
            counter.collection(),
            &Filter::new()
                .eq("app_id", app_id)
                .eq("name", name)
                .gt("date", starting_from),
            Some(("date", Order::Asc)),
            None,
        )?;

        let mut num_data = Vec::with_capacity(docs.len());
        let mut time_data: Vec<Vec<(i64, Option<f64>)>> =
            vec![Vec::with_capacity(docs.len()); self.time_fields.len()];
        if docs.is_empty() {
            // No history yet: one zero point at the current time.
            let now_ms = now_secs * 1000;
            num_data.push((now_ms, Some(0.0)));
            for row in &mut time_data {
                row.push((now_ms, Some(0.0)));
            }
        }
        for doc in &docs {
            let Some(date) = doc.date() else { continue };
            let date_ms = date * 1000;
            let number = doc.get_f64(NUMBER_FIELD).unwrap_or(0.0);
            if number == 0.0 {
                num_data.push((date_ms, None));
                for row in &mut time_data {
                    row.push((date_ms, None));
                }
                continue;
            }
            let req_per_sec = number / (counter.interval_minutes() as f64 * 60.0);
            num_data.push((date_ms, Some(req_per_sec)));
            for (row, field) in time_data.iter_mut().zip(&self.time_fields) {
                let value = doc.get_f64(field).unwrap_or(0.0);
                row.push((date_ms, Some(value / number * 1000.0)));
            }
        }

        let anomalies_data = self
            .archive
            .find(
                ANOMALIES_COLLECTION,
                &Filter::new().eq("app_id", app_id).eq("name", name),
                Some(("date", Order::Asc)),
                None,
            )?
            .iter()
            .filter_map(Document::date)
            .map(|date| date * 1000)
            .collect();

        Ok(ChartInfo {
            num_data,
            time_data,
            anomalies_data,
        })
    }

    /// Drop archive rows older than `days` from the periodic collections
    /// of `kind` (or both families) and from the events collection.
    /// Returns the number removed.
    pub fn strip_db(&self, kind: Option<StatsKind>, days: u32) -> Result<usize> {
        if days == 0 {
            return Err(StatsError::InvalidArgument("days must be >= 1".into()));
        }
        let cutoff = clock::now_secs() - days as i64 * 86400;
        let kinds = match kind {
            Some(kind) => vec![kind],
            None => StatsKind::ALL.to_vec(),
        };
        let mut removed = 0;
        for kind in kinds {
            for counter in &self.counters(kind).periodics {
                removed += self
                    .archive
                    .remove(counter.collection(), &Filter::new().lte("date", cutoff))?;
            }
        }
        removed += self
            .archive
            .remove(EVENTS_COLLECTION, &Filter::new().lte("date", cutoff))?;
        info!(removed, days, "stripped archive rows");
        Ok(removed)
    }

    /// Wipe all counter state and archive collections for this prefix.
    pub fn clear(&self) -> Result<()> {
        let removed = self.store.remove_prefix(&self.config.store_prefix)?;
        for name in self.archive.collection_names()? {
            if name.starts_with("appstats") || name == ANOMALIES_COLLECTION {
                self.archive.drop_collection(&name)?;
            }
        }
        info!(store_keys = removed, "cleared counter state");
        Ok(())
    }

    /// Detect anomalies on the apps family, persist them, and return the
    /// list. The most accurate counter covering both windows is used.
    pub fn find_anomalies(
        &self,
        ref_hours: u32,
        check_hours: u32,
        sensitivity: f64,
    ) -> Result<Vec<Anomaly>> {
        let counter = self
            .counters(StatsKind::Apps)
            .periodic_covering(ref_hours + check_hours);
        let anomalies = counter.find_anomalies(ref_hours, check_hours, sensitivity)?;
        anomaly::store_anomalies(self.archive.as_ref(), &anomalies, clock::now_secs())?;
        Ok(anomalies)
    }

    /// Flush the store snapshot, if the backend is process-local.
    pub fn persist(&self) -> Result<()> {
        self.store.persist()
    }
}
