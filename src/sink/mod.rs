//! Sink fan-out: after the value computer settles, a consistent snapshot of
//! the registry is dispatched to every active sink. Sinks are attempted
//! independently; a failure in one is logged and never blocks the others.

pub mod csv;
pub mod influx;
pub mod mqtt;

use std::path::Path;

use tracing::error;

use crate::app::Application;
use crate::config::CsvConfig;
use crate::error::AppError;
use crate::registry::SetSnapshot;
use crate::route::{RoutingTable, SinkKind};
use crate::sink::csv::{CsvRecord, CsvValue, CsvWriter};

pub async fn write_cycle(app: &Application) {
    let snap = app.meters.snapshot();

    if let Some(conf) = &app.config.csv {
        if let Err(e) = write_to_csv(conf, &snap, &app.routing) {
            error!(sink = "csv", error = %e, "writing cycle to sink failed");
        }
    }

    if let Some(influx) = &app.influx {
        if let Err(e) = influx.write_snapshot(&snap, &app.routing).await {
            error!(sink = "influx", error = %e, "writing cycle to sink failed");
        }
    }

    if let Some(mqtt) = &app.mqtt {
        for (meter_name, meter) in &snap.meters {
            let Some(topic) = app
                .config
                .meter
                .get(meter_name)
                .and_then(|m| m.mqtt_topic.as_deref())
            else {
                continue;
            };
            let payload = mqtt::build_payload(meter, &app.routing);
            if let Err(e) = mqtt.publish_meter(topic, &payload).await {
                error!(sink = "mqtt", meter = %meter_name, error = %e, "writing cycle to sink failed");
            }
        }
    }
}

/// One CSV record per cycle: a `Date` column plus `{meter}-{record}` columns
/// for every measurand routed to CSV. The file is period-templated; a fresh
/// file gets the header first.
fn write_to_csv(
    conf: &CsvConfig,
    snap: &SetSnapshot,
    routing: &RoutingTable,
) -> Result<(), AppError> {
    let record = build_csv_record(snap, routing);

    let file = Path::new(&conf.path).join(csv::file_name(&conf.filename_format, snap.time));
    let mut writer = CsvWriter::new();
    if let Some(sep) = conf.separator.chars().next() {
        writer.value_separator = sep;
    }
    if let Some(sep) = conf.decimal_separator.chars().next() {
        writer.decimal_separator = sep;
    }
    writer.date_format = conf.date_format.clone();

    writer.open(&file)?;
    if writer.is_new_file() {
        writer.write_header_only(&record)?;
    }
    writer.write(std::slice::from_ref(&record))?;
    Ok(())
}

pub fn build_csv_record(snap: &SetSnapshot, routing: &RoutingTable) -> CsvRecord {
    let mut record = CsvRecord::new();
    record.insert("Date".to_string(), CsvValue::Time(snap.time));

    for (meter_name, meter) in &snap.meters {
        for (name, sample) in &meter.measurands {
            for d in routing.directives(name) {
                if !d.targets(SinkKind::Csv) {
                    continue;
                }
                let column = format!("{meter_name}-{}", d.record);
                record.insert(column, CsvValue::Float(d.quantity.select(sample)));
            }
        }
    }
    record
}
