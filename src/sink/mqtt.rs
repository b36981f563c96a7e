//! MQTT sink: one retained QoS-0 JSON payload per meter, published to the
//! meter's configured topic.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

// The v5 API surface only, matching the broker deployments this feeds.
use rumqttc::v5 as mqtt5;
use rumqttc::v5::mqttbytes::QoS;

use crate::config::MqttConfig;
use crate::error::AppError;
use crate::registry::MeterState;
use crate::route::{PayloadRole, Quantity, RoutingTable, SinkKind};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeterPayload {
    #[serde(rename = "TimeStamp")]
    pub time_stamp: DateTime<Utc>,
    #[serde(rename = "MeterReading")]
    pub meter_reading: f64,
    #[serde(rename = "UnitMeterReading")]
    pub unit_meter_reading: String,
    #[serde(rename = "Flow")]
    pub flow: f64,
    #[serde(rename = "UnitFlow")]
    pub unit_flow: String,
}

impl Default for MeterPayload {
    fn default() -> Self {
        Self {
            time_stamp: DateTime::<Utc>::UNIX_EPOCH,
            meter_reading: 0.0,
            unit_meter_reading: String::new(),
            flow: 0.0,
            unit_flow: String::new(),
        }
    }
}

#[derive(Debug)]
pub struct MqttSink {
    client: mqtt5::AsyncClient,
}

impl MqttSink {
    /// Connects the persistent client and spawns the event-loop driver.
    pub fn connect(conf: &MqttConfig) -> Self {
        let client_id = format!("meterd-{}", Uuid::new_v4());
        let mut opts = mqtt5::MqttOptions::new(client_id, &conf.host, conf.port);
        opts.set_keep_alive(Duration::from_secs(conf.keep_alive_secs));
        if let (Some(u), Some(p)) = (&conf.username, &conf.password) {
            opts.set_credentials(u.clone(), p.clone());
        }

        let (client, mut eventloop) = mqtt5::AsyncClient::new(opts, 50);
        tokio::spawn(async move {
            loop {
                if let Err(e) = eventloop.poll().await {
                    warn!(error = %e, "mqtt connection error; reconnecting after short delay");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        });

        Self { client }
    }

    pub async fn publish_meter(
        &self,
        topic: &str,
        payload: &MeterPayload,
    ) -> Result<(), AppError> {
        let bytes = serde_json::to_vec_pretty(payload)?;
        debug!(topic = %topic, bytes = bytes.len(), "publishing meter payload");
        self.client
            .publish(topic, QoS::AtMostOnce, true, bytes)
            .await
            .map_err(|e| AppError::Mqtt(e.to_string()))
    }
}

/// Assembles the payload from the meter's current-value measurands routed
/// to MQTT: the directive's `payload` key decides whether a value fills the
/// meter-reading or the flow slot, `unit` fills the matching unit field.
pub fn build_payload(meter: &MeterState, routing: &RoutingTable) -> MeterPayload {
    let mut payload = MeterPayload {
        time_stamp: meter.time,
        ..MeterPayload::default()
    };

    for (name, sample) in &meter.measurands {
        for d in routing.directives(name) {
            if !d.targets(SinkKind::Mqtt) || d.quantity != Quantity::Value {
                continue;
            }
            match d.payload_role {
                Some(PayloadRole::Reading) => {
                    payload.meter_reading = sample.value;
                    payload.unit_meter_reading = d.unit.clone();
                }
                Some(PayloadRole::Flow) => {
                    payload.flow = sample.value;
                    payload.unit_flow = d.unit.clone();
                }
                None => {}
            }
        }
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MeasurandSample;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn meter_state(values: &[(&str, f64)]) -> MeterState {
        MeterState {
            measurands: values
                .iter()
                .map(|(n, v)| {
                    (
                        n.to_string(),
                        MeasurandSample {
                            value: *v,
                            ..Default::default()
                        },
                    )
                })
                .collect(),
            last_time: Utc::now(),
            time: Utc::now(),
        }
    }

    #[test]
    fn payload_roles_fill_reading_and_flow() {
        let state = meter_state(&[("energy (wh)", 1234.0), ("power (w)", 56.0)]);
        let routing = RoutingTable::from_config(&BTreeMap::from([
            (
                "energy (wh)".to_string(),
                BTreeMap::from([(
                    "energy".to_string(),
                    "out:mqtt type:value payload:reading unit:Wh".to_string(),
                )]),
            ),
            (
                "power (w)".to_string(),
                BTreeMap::from([(
                    "power".to_string(),
                    "out:mqtt type:value payload:flow unit:w".to_string(),
                )]),
            ),
        ]));

        let payload = build_payload(&state, &routing);
        assert_eq!(payload.meter_reading, 1234.0);
        assert_eq!(payload.unit_meter_reading, "Wh");
        assert_eq!(payload.flow, 56.0);
        assert_eq!(payload.unit_flow, "w");
    }

    #[test]
    fn non_value_quantities_never_feed_the_payload() {
        let state = meter_state(&[("energy (wh)", 1234.0)]);
        let routing = RoutingTable::from_config(&BTreeMap::from([(
            "energy (wh)".to_string(),
            BTreeMap::from([(
                "energy".to_string(),
                "out:mqtt type:delta payload:reading unit:Wh".to_string(),
            )]),
        )]));

        let payload = build_payload(&state, &routing);
        assert_eq!(payload.meter_reading, 0.0);
        assert_eq!(payload.unit_meter_reading, "");
    }

    #[test]
    fn payload_serializes_with_wire_field_names() {
        let payload = MeterPayload {
            meter_reading: 1.5,
            ..Default::default()
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("TimeStamp").is_some());
        assert_eq!(json["MeterReading"], 1.5);
        assert!(json.get("UnitFlow").is_some());
    }

    #[test]
    fn measurands_routed_elsewhere_are_ignored() {
        let state = meter_state(&[("energy (wh)", 1234.0)]);
        let routing = RoutingTable::from_config(&BTreeMap::from([(
            "energy (wh)".to_string(),
            BTreeMap::from([(
                "energy".to_string(),
                "out:csv type:value payload:reading unit:Wh".to_string(),
            )]),
        )]));

        let payload = build_payload(&state, &routing);
        assert_eq!(payload.meter_reading, 0.0);
    }
}
