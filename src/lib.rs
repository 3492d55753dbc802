//! # Tally - Application Statistics Aggregator
//!
//! Tally ingests per-call counter samples keyed by `(app_id, name, field)`,
//! maintains sliding-window and aligned-bucket counters over a fast
//! key/value store, rolls accumulators into durable time-series rows,
//! serves sorted per-name views, and flags anomalies between time windows.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tally::{Config, StatsKind, StatsService};
//!
//! let service = Arc::new(StatsService::open(Config::default())?);
//!
//! // Record one request that spent 12 ms of CPU.
//! let counters = service.counters(StatsKind::Apps);
//! counters.hour.incrby("prom.ua", "web:index", "NUMBER", 1.0)?;
//! counters.hour.incrby("prom.ua", "web:index", "cpu_time", 0.012)?;
//!
//! // Advance the windows and rebuild the view.
//! service.update_counters(StatsKind::Apps)?;
//! service.update_cache(StatsKind::Apps)?;
//! # Ok::<(), tally::StatsError>(())
//! ```
//!
//! ## Architecture
//!
//! - **Store layer**: [`store::FastStore`] capability trait with the
//!   bundled in-process [`store::MemoryStore`].
//! - **Archive layer**: [`archive::Archive`] capability trait with the
//!   bundled JSON-lines [`archive::FileArchive`].
//! - **Counter layer**: [`counter::RollingCounter`] (sliding windows) and
//!   [`counter::PeriodicCounter`] (aligned buckets with retention).
//! - **Service layer**: topology wiring, ingest routing, materialized
//!   views, anomaly detection, scheduler, HTTP server.

pub mod anomaly;
pub mod archive;
pub mod clock;
pub mod config;
pub mod counter;
pub mod error;
pub mod ingest;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod store;
pub mod view;

pub use crate::anomaly::Anomaly;
pub use crate::archive::{Archive, Document, FileArchive, Filter, Order};
pub use crate::config::{Config, Field};
pub use crate::counter::{PeriodicCounter, RollingCounter};
pub use crate::error::{Result, StatsError};
pub use crate::ingest::{IngestQueue, StatsBatch};
pub use crate::scheduler::RollupScheduler;
pub use crate::service::{CounterSet, Event, StatsKind, StatsService};
pub use crate::store::{FastStore, MemoryStore};
