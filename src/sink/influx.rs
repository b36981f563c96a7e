//! InfluxDB v1 sink: one measurement per meter per cycle, written over the
//! HTTP line-protocol endpoint.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::InfluxConfig;
use crate::error::AppError;
use crate::registry::SetSnapshot;
use crate::route::{RoutingTable, SinkKind};

#[derive(Debug)]
pub struct InfluxWriter {
    url: String,
    database: String,
    user: String,
    password: String,
    location: String,
    http: reqwest::Client,
}

impl InfluxWriter {
    pub fn new(conf: &InfluxConfig) -> Self {
        Self {
            url: conf.url.trim_end_matches('/').to_string(),
            database: conf.database.clone(),
            user: conf.user.clone(),
            password: conf.password.clone(),
            location: conf.location.clone(),
            http: reqwest::Client::new(),
        }
    }

    pub async fn write_snapshot(
        &self,
        snap: &SetSnapshot,
        routing: &RoutingTable,
    ) -> Result<(), AppError> {
        let lines = build_lines(snap, routing, &self.location);
        if lines.is_empty() {
            return Ok(());
        }

        debug!(lines = lines.len(), "writing points to influx");
        let resp = self
            .http
            .post(format!("{}/write", self.url))
            .query(&[
                ("db", self.database.as_str()),
                ("u", self.user.as_str()),
                ("p", self.password.as_str()),
                ("precision", "ns"),
            ])
            .body(lines.join("\n"))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::Influx(format!("write failed: {status}: {body}")));
        }
        Ok(())
    }
}

/// Builds one line-protocol point per meter: measurement = meter name,
/// fixed `location` tag, fields = the routed `{record: value}` pairs,
/// timestamped at cycle time. Meters with no routed fields produce no line.
pub fn build_lines(snap: &SetSnapshot, routing: &RoutingTable, location: &str) -> Vec<String> {
    let ts = timestamp_ns(snap.time);
    let mut meter_names: Vec<&String> = snap.meters.keys().collect();
    meter_names.sort();

    let mut lines = Vec::new();
    for meter_name in meter_names {
        let meter = &snap.meters[meter_name];

        let mut fields = Vec::new();
        let mut measurand_names: Vec<&String> = meter.measurands.keys().collect();
        measurand_names.sort();
        for name in measurand_names {
            let sample = &meter.measurands[name];
            for d in routing.directives(name) {
                if !d.targets(SinkKind::Influx) {
                    continue;
                }
                if let Some(v) = d.routed_value(sample) {
                    fields.push(format!("{}={v}", escape(&d.record)));
                }
            }
        }

        if fields.is_empty() {
            continue;
        }
        lines.push(format!(
            "{},location={} {} {ts}",
            escape(meter_name),
            escape(location),
            fields.join(",")
        ));
    }
    lines
}

fn timestamp_ns(t: DateTime<Utc>) -> i64 {
    t.timestamp_nanos_opt().unwrap_or_default()
}

/// Line-protocol escaping for measurement names, tag values and field keys.
fn escape(s: &str) -> String {
    s.replace(' ', "\\ ").replace(',', "\\,").replace('=', "\\=")
}
