//! The meter registry and per-cycle value computation.
//!
//! Each meter owns its samples behind its own lock; the set-wide cycle
//! timestamp lives behind a separate lock. The two are never held at the
//! same time.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::route::RoutingTable;

/// One measurand's evolving state. `delta` and `avg` are reset to zero at
/// the start of every cycle and only recomputed when the guards in
/// [`Meter::apply_cycle`] hold, so a zero delta can mean either "no change"
/// or "not computed".
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MeasurandSample {
    #[serde(rename = "Value")]
    pub value: f64,
    #[serde(rename = "Delta")]
    pub delta: f64,
    #[serde(rename = "Avg")]
    pub avg: f64,
    #[serde(rename = "LastValue")]
    pub last_value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeterState {
    #[serde(rename = "Measurand")]
    pub measurands: HashMap<String, MeasurandSample>,
    #[serde(rename = "LastTime")]
    pub last_time: DateTime<Utc>,
    #[serde(rename = "Time")]
    pub time: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Meter {
    pub name: String,
    pub backend: Backend,
    state: RwLock<MeterState>,
}

/// Guard against clock jumps and the unset `last_time` of the very first
/// cycle: no delta is computed across more than ten years.
fn max_cycle_gap() -> ChronoDuration {
    ChronoDuration::hours(24 * 365 * 10)
}

impl Meter {
    pub fn new(name: &str, backend: Backend) -> Self {
        let measurands = backend
            .measurands()
            .into_iter()
            .map(|n| (n, MeasurandSample::default()))
            .collect();
        Self {
            name: name.to_string(),
            backend,
            state: RwLock::new(MeterState {
                measurands,
                last_time: DateTime::<Utc>::UNIX_EPOCH,
                time: DateTime::<Utc>::UNIX_EPOCH,
            }),
        }
    }

    /// Reads every registered measurand. A failed read is logged and skips
    /// that single measurand for the cycle; the others proceed.
    pub async fn read_all(&self) -> HashMap<String, f64> {
        let mut values = HashMap::new();
        for name in self.backend.measurands() {
            match self.backend.read(&name).await {
                Ok(v) => {
                    values.insert(name, v);
                }
                Err(e) => warn!(
                    meter = %self.name,
                    measurand = %name,
                    error = %e,
                    "read failed; skipping measurand for this cycle"
                ),
            }
        }
        values
    }

    /// Folds one cycle's readings into the samples under the meter's
    /// exclusive lock: shift `time`/`value`, reset `delta`/`avg`, then
    /// recompute them iff `last_value > 0`, the new value is nonzero, and
    /// the elapsed time is sane.
    pub fn apply_cycle(
        &self,
        values: &HashMap<String, f64>,
        routing: &RoutingTable,
        now: DateTime<Utc>,
    ) {
        let mut st = self.state.write().unwrap();
        st.last_time = st.time;
        st.time = now;

        let elapsed = st.time - st.last_time;
        let hours = elapsed.num_milliseconds() as f64 / 3_600_000.0;

        for (name, &new_value) in values {
            if !routing.contains(name) {
                warn!(meter = %self.name, measurand = %name, "measurand has no routing configuration; skipping");
                continue;
            }

            let sample = st.measurands.entry(name.clone()).or_default();
            sample.last_value = sample.value;
            sample.value = new_value;
            sample.delta = 0.0;
            sample.avg = 0.0;

            if sample.last_value > 0.0
                && sample.value != 0.0
                && elapsed < max_cycle_gap()
                && hours > 0.0
            {
                sample.delta = sample.value - sample.last_value;
                sample.avg = sample.delta / hours;
            }
        }
    }

    pub fn state(&self) -> MeterState {
        self.state.read().unwrap().clone()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SetSnapshot {
    #[serde(rename = "Time")]
    pub time: DateTime<Utc>,
    #[serde(rename = "Meter")]
    pub meters: HashMap<String, MeterState>,
}

#[derive(Debug)]
pub struct MeterSet {
    meters: HashMap<String, Arc<Meter>>,
    time: RwLock<DateTime<Utc>>,
}

impl MeterSet {
    pub fn new(meters: HashMap<String, Arc<Meter>>) -> Self {
        Self {
            meters,
            time: RwLock::new(DateTime::<Utc>::UNIX_EPOCH),
        }
    }

    pub fn meters(&self) -> &HashMap<String, Arc<Meter>> {
        &self.meters
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Meter>> {
        self.meters.get(name)
    }

    /// One acquisition cycle: all meters polled in parallel (one slow device
    /// must not stall the rest), then the set-wide timestamp is stamped
    /// under its own lock.
    pub async fn poll_cycle(&self, routing: Arc<RoutingTable>) {
        let started = Instant::now();

        let tasks: Vec<_> = self
            .meters
            .values()
            .cloned()
            .map(|meter| {
                let routing = routing.clone();
                tokio::spawn(async move {
                    let values = meter.read_all().await;
                    meter.apply_cycle(&values, &routing, Utc::now());
                })
            })
            .collect();
        join_all(tasks).await;

        *self.time.write().unwrap() = Utc::now();
        debug!(elapsed = ?started.elapsed(), "cycle acquisition finished");
    }

    /// Consistent read snapshot for the sinks and the status endpoint. The
    /// set lock and the meter locks are taken one after another, never
    /// nested.
    pub fn snapshot(&self) -> SetSnapshot {
        let time = *self.time.read().unwrap();
        let meters = self
            .meters
            .iter()
            .map(|(name, meter)| (name.clone(), meter.state()))
            .collect();
        SetSnapshot { time, meters }
    }
}
