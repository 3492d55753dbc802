//! Periodic rollup driver.
//!
//! A single worker thread ticks every counter's `update()` and the view
//! rebuild at their configured cadences. Cadence jitter is harmless: the
//! advisory locks and the persisted `prev_upd` stamp make overlapping or
//! repeated invocations safe.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::service::{StatsKind, StatsService};

pub enum SchedulerMessage {
    /// Run both passes now, regardless of cadence.
    Trigger,
    Shutdown,
}

pub struct RollupScheduler {
    sender: Sender<SchedulerMessage>,
    worker: Option<JoinHandle<()>>,
}

impl RollupScheduler {
    pub fn spawn(service: Arc<StatsService>) -> Self {
        let counter_every = Duration::from_secs(service.config().counter_update_secs);
        let cache_every = Duration::from_secs(service.config().cache_update_secs);
        let (sender, receiver) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("rollup-scheduler".to_string())
            .spawn(move || scheduler_loop(service, receiver, counter_every, cache_every))
            .expect("spawn rollup scheduler");
        Self {
            sender,
            worker: Some(worker),
        }
    }

    pub fn trigger(&self) {
        let _ = self.sender.send(SchedulerMessage::Trigger);
    }

    pub fn shutdown(&mut self) {
        let _ = self.sender.send(SchedulerMessage::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("rollup scheduler panicked");
            }
        }
    }
}

impl Drop for RollupScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn scheduler_loop(
    service: Arc<StatsService>,
    receiver: Receiver<SchedulerMessage>,
    counter_every: Duration,
    cache_every: Duration,
) {
    info!(
        counter_secs = counter_every.as_secs(),
        cache_secs = cache_every.as_secs(),
        "rollup scheduler started"
    );
    let tick = counter_every.min(cache_every);
    let mut last_counters: Option<Instant> = None;
    let mut last_cache: Option<Instant> = None;

    loop {
        let forced = match receiver.recv_timeout(tick) {
            Ok(SchedulerMessage::Trigger) => true,
            Ok(SchedulerMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => false,
        };

        if forced || due(last_counters, counter_every) {
            for kind in StatsKind::ALL {
                if let Err(err) = service.update_counters(kind) {
                    warn!(%err, %kind, "counter update failed");
                }
            }
            last_counters = Some(Instant::now());
        }
        if forced || due(last_cache, cache_every) {
            for kind in StatsKind::ALL {
                if let Err(err) = service.update_cache(kind) {
                    warn!(%err, %kind, "cache update failed");
                }
            }
            if let Err(err) = service.evict_events() {
                warn!(%err, "event eviction failed");
            }
            last_cache = Some(Instant::now());
        }
    }
    info!("rollup scheduler stopped");
}

fn due(last: Option<Instant>, every: Duration) -> bool {
    last.map_or(true, |at| at.elapsed() >= every)
}
