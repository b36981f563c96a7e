//! S0 counter backend. One HTTP GET returns the readings of every counter
//! the bridge knows, keyed by counter id, so the payload is cached for a
//! short TTL and all measurands of the meter are served from that cache
//! until it expires.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::connspec::ConnSpec;
use crate::decode::apply_scale_factor;
use crate::error::AppError;

use super::fetch_with_retry;

#[derive(Debug)]
pub struct S0Client {
    endpoint: String,
    timeout: Duration,
    cache_time: Duration,
    max_retries: usize,
    http: reqwest::Client,
    cache: Mutex<Option<CacheState>>,
    measurands: BTreeMap<String, S0Param>,
}

#[derive(Debug)]
struct S0Param {
    /// Counter id in the bridge payload.
    key: String,
    /// Field selector: `MeterReading` or `Flow`.
    value: String,
    scale_factor: i32,
}

#[derive(Debug)]
struct CacheState {
    fetched_at: Instant,
    data: HashMap<String, CounterData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CounterData {
    #[serde(rename = "MeterReading", default)]
    pub meter_reading: f64,
    #[serde(rename = "Flow", default)]
    pub flow: f64,
}

impl S0Client {
    /// Connection string:
    /// `http://raspberry:4000/currentdata timeout:500 cachetime:2000`.
    pub fn new(connection: &str) -> Self {
        let mut spec = ConnSpec::new(connection);
        Self {
            endpoint: spec.endpoint("connection", ""),
            timeout: spec.get_duration_ms("timeout", Duration::from_secs(1)),
            cache_time: spec.get_duration_ms("cachetime", Duration::from_secs(1)),
            max_retries: spec.get_num("maxretries", 0),
            http: reqwest::Client::new(),
            cache: Mutex::new(None),
            measurands: BTreeMap::new(),
        }
    }

    /// Descriptor: `key:<counter id> value:<MeterReading|Flow> sf:<power-of-ten>`.
    pub fn add_measurand(&mut self, name: &str, descriptor: &str) {
        let mut spec = ConnSpec::new(descriptor);
        let p = S0Param {
            key: spec.get_str("key", ""),
            value: spec.get_str("value", ""),
            scale_factor: spec.get_num("sf", 0),
        };
        self.measurands.insert(name.to_string(), p);
    }

    pub fn measurands(&self) -> Vec<String> {
        self.measurands.keys().cloned().collect()
    }

    pub async fn read(&self, name: &str) -> Result<f64, AppError> {
        let p = self
            .measurands
            .get(name)
            .ok_or_else(|| AppError::UnknownMeasurand(name.to_string()))?;

        if self.needs_refresh(&p.key) {
            trace!(key = %p.key, "counter not cached; refreshing");
            let body =
                fetch_with_retry(self.timeout, self.max_retries, || self.fetch()).await?;
            let data: HashMap<String, CounterData> = serde_json::from_str(&body)?;
            *self.cache.lock().unwrap() = Some(CacheState {
                fetched_at: Instant::now(),
                data,
            });
        } else {
            trace!(key = %p.key, "counter served from cache");
        }

        let guard = self.cache.lock().unwrap();
        let entry = guard
            .as_ref()
            .and_then(|c| c.data.get(&p.key))
            .ok_or_else(|| AppError::UnknownMeasurand(format!("{name} (counter {:?})", p.key)))?;

        let v = match p.value.as_str() {
            "MeterReading" => entry.meter_reading,
            "Flow" => entry.flow,
            other => {
                return Err(AppError::UnknownMeasurand(format!(
                    "{name}: unsupported field selector {other:?}"
                )))
            }
        };
        Ok(apply_scale_factor(v, p.scale_factor))
    }

    fn needs_refresh(&self, key: &str) -> bool {
        let guard = self.cache.lock().unwrap();
        match guard.as_ref() {
            None => true,
            Some(c) => c.fetched_at.elapsed() > self.cache_time || !c.data.contains_key(key),
        }
    }

    async fn fetch(&self) -> Result<String, AppError> {
        debug!(url = %self.endpoint, "performing s0 counter http get");
        let body = self
            .http
            .get(&self.endpoint)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn configures_with_cache_time() {
        let c = S0Client::new("http://raspberry:4000/currentdata timeout:500 cachetime:2000");
        assert_eq!(c.endpoint, "http://raspberry:4000/currentdata");
        assert_eq!(c.timeout, Duration::from_millis(500));
        assert_eq!(c.cache_time, Duration::from_millis(2000));
    }

    #[test]
    fn payload_deserializes_counter_fields() {
        let body = r#"{"water":{"TimeStamp":"2021-01-01T00:00:00Z","MeterReading":123.5,
                       "UnitMeterReading":"l","Flow":7.5,"UnitFlow":"l/h"}}"#;
        let data: HashMap<String, CounterData> = serde_json::from_str(body).unwrap();
        assert_eq!(data["water"].meter_reading, 123.5);
        assert_eq!(data["water"].flow, 7.5);
    }

    #[tokio::test]
    async fn fresh_cache_serves_reads_and_flags_missing_keys() {
        let mut client = S0Client::new("cachetime:60000");
        client.add_measurand("liter (l)", "key:water value:MeterReading sf:0");
        *client.cache.lock().unwrap() = Some(CacheState {
            fetched_at: Instant::now(),
            data: HashMap::from([(
                "water".to_string(),
                CounterData { meter_reading: 42.0, flow: 0.0 },
            )]),
        });
        assert_eq!(client.read("liter (l)").await.unwrap(), 42.0);
        assert!(!client.needs_refresh("water"));
        assert!(client.needs_refresh("gas"));
    }
}
