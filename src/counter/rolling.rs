//! Sliding-window rate estimator.
//!
//! A window of `interval` seconds is quantised into `num_parts` parts of
//! `secs_per_part` seconds. Increments land in a per-field accumulator
//! (`last_val`); each `update()` shifts the accumulated mass into a FIFO
//! ring of committed parts, aging the oldest part out of the window. The
//! ring holds `num_parts - 1` committed parts; the accumulator acts as the
//! implicit head position.

use std::sync::Arc;

use tracing::{info, warn};

use crate::clock;
use crate::error::Result;
use crate::store::{AdvisoryLock, FastStore, Pipeline, StoreOp};

use super::{
    check_identifier, expired_members, scan_members, CounterValues, IDLE_EXPIRY_SECS,
    MAX_UPDATE_SECS,
};

pub struct RollingCounter {
    store: Arc<dyn FastStore>,
    fields: Vec<String>,
    prefix: String,
    interval: u64,
    secs_per_part: u64,
    num_parts: u64,
}

impl RollingCounter {
    /// `store_prefix` separates deployments; `stats` separates the counter
    /// families (`apps`, `tasks`) within one deployment.
    pub fn new(
        store: Arc<dyn FastStore>,
        fields: Vec<String>,
        store_prefix: &str,
        stats: &str,
        interval: u64,
        secs_per_part: u64,
    ) -> Self {
        let num_parts = interval / secs_per_part;
        Self {
            store,
            fields,
            prefix: format!("{store_prefix}_{stats}"),
            interval,
            secs_per_part,
            num_parts,
        }
    }

    /// Window length in seconds.
    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn secs_per_part(&self) -> u64 {
        self.secs_per_part
    }

    fn parts_key(&self, app_id: &str, name: &str, field: &str) -> String {
        format!(
            "{},{app_id},{name},{},{},{field}",
            self.prefix, self.interval, self.secs_per_part
        )
    }

    fn last_val_key(&self, app_id: &str, name: &str, field: &str) -> String {
        format!(
            "{},{app_id},{name},{},{},last_val,{field}",
            self.prefix, self.interval, self.secs_per_part
        )
    }

    fn updated_key(&self, app_id: &str, name: &str, field: &str) -> String {
        format!(
            "{},{app_id},{name},{},{},updated,{field}",
            self.prefix, self.interval, self.secs_per_part
        )
    }

    fn app_ids_key(&self) -> String {
        format!(
            "{},{},{},app_ids_set",
            self.prefix, self.interval, self.secs_per_part
        )
    }

    fn names_key(&self, app_id: &str) -> String {
        format!(
            "{},{},{},{app_id},names_set",
            self.prefix, self.interval, self.secs_per_part
        )
    }

    fn lock_key(&self) -> String {
        format!(
            "{},{},{},lock",
            self.prefix, self.interval, self.secs_per_part
        )
    }

    /// Add `delta` to the `(app_id, name, field)` accumulator and refresh
    /// the membership timestamps.
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
            // Unconfigured fields are dropped without error; field sets are
            // declarative and drift between emitters is expected.
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
                key: self.last_val_key(app_id, name, field),
                delta,
            },
        ])
    }

    /// Advance the window. Safe to call at any cadence; accuracy is best
    /// when called at least once per `secs_per_part`.
    pub fn update(&self) -> Result<()> {
        self.update_at(clock::now_ts())
    }

    pub fn update_at(&self, now_ts: f64) -> Result<()> {
        let store = self.store.as_ref();
        let lock_key = self.lock_key();
        let Some(_lock) = AdvisoryLock::acquire(store, &lock_key, MAX_UPDATE_SECS, now_ts)? else {
            warn!(key = %lock_key, "lock is held, exiting");
            return Ok(());
        };
        info!(interval = self.interval, "rolling counter update triggered");

        self.evict_idle(now_ts - IDLE_EXPIRY_SECS)?;

        let mut pipeline = Pipeline::new(store);
        for app_id in scan_members(store, &self.app_ids_key())? {
            for name in scan_members(store, &self.names_key(&app_id))? {
                for field in &self.fields {
                    self.shift_field(&mut pipeline, &app_id, &name, field, now_ts)?;
                }
            }
        }
        pipeline.flush()
    }

    fn shift_field(
        &self,
        pipeline: &mut Pipeline<'_>,
        app_id: &str,
        name: &str,
        field: &str,
        now_ts: f64,
    ) -> Result<()> {
        let store = self.store.as_ref();
        let parts_key = self.parts_key(app_id, name, field);
        let last_val_key = self.last_val_key(app_id, name, field);
        let updated_key = self.updated_key(app_id, name, field);

        if store.list_len(&parts_key)? == 0 {
            for _ in 0..self.num_parts.saturating_sub(1) {
                store.list_push_back(&parts_key, 0.0)?;
            }
            store.set_str(&updated_key, &now_ts.to_string())?;
        }

        let updated = store
            .get_str(&updated_key)?
            .and_then(|raw| raw.parse::<f64>().ok())
            .unwrap_or(now_ts);
        let last_val = store.get_float(&last_val_key)?.unwrap_or(0.0);
        let passed = now_ts - updated;
        if passed <= self.secs_per_part as f64 {
            return Ok(());
        }

        let new_parts = (passed / self.secs_per_part as f64).floor() as u64;
        let per_part = last_val / new_parts as f64;
        // Shifting more than num_parts times cycles the same values through
        // the ring; clamp to the window.
        let shifts = new_parts.min(self.num_parts);
        for _ in 0..shifts {
            pipeline.push(StoreOp::ListPopFront {
                key: parts_key.clone(),
            })?;
            pipeline.push(StoreOp::ListPushBack {
                key: parts_key.clone(),
                value: per_part,
            })?;
        }
        pipeline.push(StoreOp::SetFloat {
            key: last_val_key,
            value: 0.0,
        })?;
        // Keep the sub-part remainder so short update gaps don't drift.
        let rest = passed - (new_parts * self.secs_per_part) as f64;
        pipeline.push(StoreOp::SetStr {
            key: updated_key,
            value: (now_ts - rest).to_string(),
        })?;
        Ok(())
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
        let mut ops = Vec::with_capacity(self.fields.len() * 3);
        for field in &self.fields {
            ops.push(StoreOp::Delete {
                key: self.parts_key(app_id, name, field),
            });
            ops.push(StoreOp::Delete {
                key: self.last_val_key(app_id, name, field),
            });
            ops.push(StoreOp::Delete {
                key: self.updated_key(app_id, name, field),
            });
        }
        self.store.apply(ops)
    }

    /// Snapshot of every tracked identifier:
    /// `last_val + sum(parts)` per field.
    pub fn get_vals(&self) -> Result<CounterValues> {
        let store = self.store.as_ref();
        let mut res = CounterValues::new();
        for app_id in scan_members(store, &self.app_ids_key())? {
            let names = scan_members(store, &self.names_key(&app_id))?;
            let by_name = res.entry(app_id.clone()).or_default();
            for name in names {
                let counts = by_name.entry(name.clone()).or_default();
                for field in &self.fields {
                    let last_val = store
                        .get_float(&self.last_val_key(&app_id, &name, field))?
                        .unwrap_or(0.0);
                    let parts_sum: f64 = store
                        .list_range(&self.parts_key(&app_id, &name, field))?
                        .iter()
                        .sum();
                    counts.insert(field.clone(), last_val + parts_sum);
                }
            }
        }
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn counter(store: Arc<dyn FastStore>) -> RollingCounter {
        RollingCounter::new(
            store,
            vec!["NUMBER".to_string(), "cpu_time".to_string()],
            "appstats",
            "apps",
            3600,
            60,
        )
    }

    #[test]
    fn increment_is_visible_before_any_update() {
        let store: Arc<dyn FastStore> = Arc::new(MemoryStore::new());
        let c = counter(store);
        c.incrby_at("A", "x", "NUMBER", 60.0, 0.0).unwrap();
        let vals = c.get_vals().unwrap();
        assert_eq!(vals["A"]["x"]["NUMBER"], 60.0);
    }

    #[test]
    fn unknown_field_is_silently_ignored() {
        let store: Arc<dyn FastStore> = Arc::new(MemoryStore::new());
        let c = counter(store);
        c.incrby_at("A", "x", "made_up", 5.0, 0.0).unwrap();
        assert!(c.get_vals().unwrap().is_empty());
    }

    #[test]
    fn update_within_one_part_is_a_no_op() {
        let store: Arc<dyn FastStore> = Arc::new(MemoryStore::new());
        let c = counter(store);
        c.update_at(0.0).unwrap();
        c.incrby_at("A", "x", "NUMBER", 60.0, 0.0).unwrap();
        c.update_at(30.0).unwrap();
        let vals = c.get_vals().unwrap();
        // Accumulator untouched until a full part has passed.
        assert_eq!(vals["A"]["x"]["NUMBER"], 60.0);
    }

    #[test]
    fn shift_moves_accumulator_into_newest_part() {
        let store: Arc<dyn FastStore> = Arc::new(MemoryStore::new());
        let c = counter(Arc::clone(&store));
        c.incrby_at("A", "x", "NUMBER", 60.0, 0.0).unwrap();
        c.update_at(0.0).unwrap();
        c.update_at(61.0).unwrap();

        let parts = store
            .list_range("appstats_apps,A,x,3600,60,NUMBER")
            .unwrap();
        assert_eq!(parts.len(), 59);
        assert_eq!(*parts.last().unwrap(), 60.0);
        assert_eq!(
            store
                .get_float("appstats_apps,A,x,3600,60,last_val,NUMBER")
                .unwrap(),
            Some(0.0)
        );
        assert_eq!(c.get_vals().unwrap()["A"]["x"]["NUMBER"], 60.0);
    }

    #[test]
    fn sub_part_remainder_is_preserved() {
        let store: Arc<dyn FastStore> = Arc::new(MemoryStore::new());
        let c = counter(Arc::clone(&store));
        c.incrby_at("A", "x", "NUMBER", 10.0, 0.0).unwrap();
        c.update_at(0.0).unwrap();
        c.update_at(90.0).unwrap();
        // 90 s passed, one part of 60 s consumed, 30 s remainder kept.
        let updated: f64 = store
            .get_str("appstats_apps,A,x,3600,60,updated,NUMBER")
            .unwrap()
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(updated, 60.0);
    }
}
