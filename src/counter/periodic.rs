//! Aligned-bucket aggregator with a durable archive sink.
//!
//! Increments accumulate per `(app_id, name, field)` in the fast store;
//! every `update()` on an aligned tick of `60 / divider` minutes converts
//! the accumulators into one archive row per `(app_id, name)` and evicts
//! rows older than the retention period.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::anomaly::Anomaly;
use crate::archive::{Archive, Document, Filter};
use crate::clock;
use crate::error::{Result, StatsError};
use crate::store::{AdvisoryLock, FastStore, Pipeline, StoreOp};

use super::{
    check_identifier, expired_members, scan_members, IDLE_EXPIRY_SECS, MAX_UPDATE_SECS,
};

/// Transient archive failures are retried this many times per insert.
pub const MAX_ARCHIVE_RETRIES: u32 = 3;

/// Backoff between archive insert retries.
pub const ARCHIVE_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// A rollup covering more than this many missed intervals materialises
/// only this many rows; the tail is dropped as a flood guard.
pub const MAX_PASSED_INTERVALS: i64 = 5;

pub struct PeriodicCounter {
    store: Arc<dyn FastStore>,
    archive: Arc<dyn Archive>,
    fields: Vec<String>,
    prefix: String,
    divider: u32,
    period_hours: u32,
    interval_minutes: u32,
    collection: String,
}

impl PeriodicCounter {
    /// `divider` splits an hour into buckets (`interval = 60 / divider`
    /// minutes); `period_hours` bounds retention of archived rows.
    pub fn new(
        store: Arc<dyn FastStore>,
        archive: Arc<dyn Archive>,
        fields: Vec<String>,
        store_prefix: &str,
        stats: &str,
        divider: u32,
        period_hours: u32,
    ) -> Self {
        Self {
            store,
            archive,
            fields,
            prefix: format!("{store_prefix}_{stats}"),
            divider,
            period_hours,
            interval_minutes: 60 / divider,
            collection: format!("appstats_{stats}_periodic-{divider}"),
        }
    }

    /// Bucket width in minutes.
    pub fn interval_minutes(&self) -> u32 {
        self.interval_minutes
    }

    /// Retention period in hours.
    pub fn period_hours(&self) -> u32 {
        self.period_hours
    }

    /// Archive collection this counter writes to.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn interval_secs(&self) -> i64 {
        self.interval_minutes as i64 * 60
    }

    fn acc_key(&self, app_id: &str, name: &str, field: &str) -> String {
        format!(
            "{},periodic,{},{app_id},{name},{field}",
            self.prefix, self.divider
        )
    }

    fn prev_upd_key(&self) -> String {
        format!("{},periodic,{},prev_upd", self.prefix, self.divider)
    }

    fn app_ids_key(&self) -> String {
        format!("{},periodic,{},app_ids_set", self.prefix, self.divider)
    }

    fn names_key(&self, app_id: &str) -> String {
        format!(
            "{},periodic,{},{app_id},names_set",
            self.prefix, self.divider
        )
    }

    fn lock_key(&self) -> String {
        format!("{},periodic,{},lock", self.prefix, self.divider)
    }

    pub fn incrby(&self, app_id: &str, name: &str, field: &str, delta: f64) -> Result<()> {
        self.incrby_at(app_id, name, field, delta, clock::now_ts())
    }

    pub fn incrby_at(
        &self,
        app_id: &str,
        name: &str,
        field: &str,
        delta: f64,
        now_ts: f64,
    ) -> Result<()> {
        check_identifier(app_id, name)?;
        if !self.fields.iter().any(|f| f == field) {
            return Ok(());
        }
        self.store.apply(vec![
            StoreOp::ZSetAdd {
                key: self.app_ids_key(),
                member: app_id.to_string(),
                score: now_ts,
            },
            StoreOp::ZSetAdd {
                key: self.names_key(app_id),
                member: name.to_string(),
                score: now_ts,
            },
            StoreOp::IncrFloat {
                key: self.acc_key(app_id, name, field),
                delta,
            },
        ])
    }

    /// Roll accumulators into archive rows for every aligned interval that
    /// has elapsed since the previous successful rollup.
    pub fn update(&self) -> Result<()> {
        self.update_at(clock::now_secs())
    }

    pub fn update_at(&self, now_secs: i64) -> Result<()> {
        let store = self.store.as_ref();
        let lock_key = self.lock_key();
        let Some(_lock) =
            AdvisoryLock::acquire(store, &lock_key, MAX_UPDATE_SECS, now_secs as f64)?
        else {
            warn!(key = %lock_key, "lock is held, exiting");
            return Ok(());
        };

        let interval_secs = self.interval_secs();
        let now = now_secs - now_secs.rem_euclid(interval_secs);
        let prev = store
            .get_str(&self.prev_upd_key())?
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(now - interval_secs);
        info!(
            collection = %self.collection,
            prev_upd = prev,
            "periodic counter update triggered"
        );

        let passed = (now - prev) / interval_secs;
        if passed <= 0 {
            // Too early, exiting.
            return Ok(());
        }
        let effective = passed.min(MAX_PASSED_INTERVALS);

        self.evict_idle(now_secs as f64 - IDLE_EXPIRY_SECS)?;

        let mut pipeline = Pipeline::new(store);
        let mut docs = Vec::new();
        for app_id in scan_members(store, &self.app_ids_key())? {
            for name in scan_members(store, &self.names_key(&app_id))? {
                let mut doc = Document::new();
                doc.set("app_id", app_id.as_str());
                doc.set("name", name.as_str());
                doc.set("date", now);
                for field in &self.fields {
                    let key = self.acc_key(&app_id, &name, field);
                    let val = store.get_float(&key)?.unwrap_or(0.0);
                    // Subtract rather than zero-set: increments racing with
                    // this read must survive the rollup.
                    pipeline.push(StoreOp::IncrFloat { key, delta: -val })?;
                    doc.set(field, val / passed as f64);
                }
                docs.push(doc);
            }
        }

        let outcome: Result<()> = (|| {
            self.insert_with_retry(docs.clone())?;
            pipeline.flush()?;
            store.set_str(&self.prev_upd_key(), &now.to_string())?;

            let oldest = now - self.period_hours as i64 * 3600;
            self.archive
                .remove(&self.collection, &Filter::new().lte("date", oldest))?;

            // One back-dated row set per additional missed interval, capped
            // at the flood guard.
            for offset_scale in 1..effective {
                let date = now - offset_scale * interval_secs;
                let replicas: Vec<Document> = docs
                    .iter()
                    .map(|doc| {
                        let mut replica = doc.clone();
                        replica.remove("_id");
                        replica.set("date", date);
                        replica
                    })
                    .collect();
                self.insert_with_retry(replicas)?;
            }
            Ok(())
        })();

        match outcome {
            Ok(()) => Ok(()),
            Err(err) if err.is_transient() => {
                warn!(%err, collection = %self.collection, "failed to update counters");
                pipeline.reset();
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn insert_with_retry(&self, docs: Vec<Document>) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        debug!(count = docs.len(), collection = %self.collection, "inserting rollup docs");
        let mut tries = MAX_ARCHIVE_RETRIES;
        loop {
            match self.archive.insert(&self.collection, docs.clone()) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && tries > 0 => {
                    warn!(%err, tries_left = tries, "transient archive failure while inserting");
                    tries -= 1;
                    thread::sleep(ARCHIVE_RETRY_BACKOFF);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn evict_idle(&self, cutoff: f64) -> Result<()> {
        let store = self.store.as_ref();
        for app_id in expired_members(store, &self.app_ids_key(), cutoff)? {
            for name in scan_members(store, &self.names_key(&app_id))? {
                self.purge_identifier(&app_id, &name)?;
            }
            store.apply(vec![StoreOp::Delete {
                key: self.names_key(&app_id),
            }])?;
        }
        store.zset_remove_range_by_score(&self.app_ids_key(), 0.0, cutoff)?;

        for app_id in scan_members(store, &self.app_ids_key())? {
            for name in expired_members(store, &self.names_key(&app_id), cutoff)? {
                self.purge_identifier(&app_id, &name)?;
            }
            store.zset_remove_range_by_score(&self.names_key(&app_id), 0.0, cutoff)?;
        }
        Ok(())
    }

    fn purge_identifier(&self, app_id: &str, name: &str) -> Result<()> {
        let ops = self
            .fields
            .iter()
            .map(|field| StoreOp::Delete {
                key: self.acc_key(app_id, name, field),
            })
            .collect();
        self.store.apply(ops)
    }

    /// Compare per-identifier field means over two adjacent windows ending
    /// now and emit the identifiers whose relative error reaches the
    /// sensitivity threshold.
    pub fn find_anomalies(
        &self,
        ref_hours: u32,
        check_hours: u32,
        sensitivity: f64,
    ) -> Result<Vec<Anomaly>> {
        self.find_anomalies_at(ref_hours, check_hours, sensitivity, clock::now_secs())
    }

    pub fn find_anomalies_at(
        &self,
        ref_hours: u32,
        check_hours: u32,
        sensitivity: f64,
        now_secs: i64,
    ) -> Result<Vec<Anomaly>> {
        if ref_hours == 0 || check_hours == 0 || ref_hours <= check_hours {
            return Err(StatsError::InvalidArgument(
                "reference window must be longer than the check window".into(),
            ));
        }
        if sensitivity <= 0.0 || sensitivity >= 1.0 {
            return Err(StatsError::InvalidArgument(
                "sensitivity must lie strictly between 0 and 1".into(),
            ));
        }

        let ref_end = now_secs - check_hours as i64 * 3600;
        let ref_start = ref_end - ref_hours as i64 * 3600;
        let ref_data =
            self.archive
                .avg_by_identifier(&self.collection, &self.fields, ref_start, ref_end)?;
        let check_data =
            self.archive
                .avg_by_identifier(&self.collection, &self.fields, ref_end, now_secs)?;

        let threshold = 1.0 - sensitivity;
        let mut anomalies = Vec::new();
        for ((app_id, name), ref_means) in &ref_data {
            for field in &self.fields {
                let Some(&ref_val) = ref_means.get(field) else {
                    continue;
                };
                if ref_val == 0.0 {
                    continue;
                }
                let check_val = check_data
                    .get(&(app_id.clone(), name.clone()))
                    .and_then(|means| means.get(field))
                    .copied()
                    .unwrap_or(0.0);
                let error = (ref_val - check_val).abs() / ref_val;
                if error >= threshold {
                    anomalies.push(Anomaly {
                        app_id: app_id.clone(),
                        name: name.clone(),
                        field: field.clone(),
                    });
                }
            }
        }
        anomalies.sort_by(|a, b| {
            (&a.app_id, &a.name, &a.field).cmp(&(&b.app_id, &b.name, &b.field))
        });
        Ok(anomalies)
    }
}
