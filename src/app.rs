//! Application context: the configured meter registry, routing table and
//! sink handles, built once at startup and passed by reference into the
//! cycle loop.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::backend::Backend;
use crate::config::Config;
use crate::error::AppError;
use crate::registry::{Meter, MeterSet};
use crate::route::RoutingTable;
use crate::sink;
use crate::sink::influx::InfluxWriter;
use crate::sink::mqtt::MqttSink;

#[derive(Debug)]
pub struct Application {
    pub config: Config,
    pub meters: Arc<MeterSet>,
    pub routing: Arc<RoutingTable>,
    pub influx: Option<InfluxWriter>,
    pub mqtt: Option<MqttSink>,
}

impl Application {
    /// Wires up every configured meter. A meter whose backend cannot be
    /// built is fatal here; after startup the process only degrades.
    pub fn build(config: Config) -> Result<Self, AppError> {
        let routing = Arc::new(RoutingTable::from_config(&config.measurand));

        let mut meters = HashMap::new();
        for (name, mc) in &config.meter {
            let backend = Backend::from_config(&mc.r#type, &mc.connection, &mc.measurand)?;
            info!(
                meter = %name,
                kind = backend.kind(),
                measurands = backend.measurands().len(),
                "meter configured"
            );
            meters.insert(name.clone(), Arc::new(Meter::new(name, backend)));
        }

        let influx = config.influx.as_ref().map(InfluxWriter::new);
        let mqtt = config.mqtt.as_ref().map(MqttSink::connect);

        Ok(Self {
            config,
            meters: Arc::new(MeterSet::new(meters)),
            routing,
            influx,
            mqtt,
        })
    }

    /// One full tick: poll all meters, fold the readings into the registry,
    /// then fan the snapshot out to the sinks.
    pub async fn run_cycle(&self) {
        self.meters.poll_cycle(self.routing.clone()).await;
        sink::write_cycle(self).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::config::MeterConfig;

    fn minimal_config(kind: &str) -> Config {
        Config {
            time_period: 5,
            meter: BTreeMap::from([(
                "house".to_string(),
                MeterConfig {
                    r#type: kind.to_string(),
                    connection: "connection:127.0.0.1:502".to_string(),
                    measurand: BTreeMap::from([(
                        "energy (wh)".to_string(),
                        "address:4 format:uint32 sf:0".to_string(),
                    )]),
                    mqtt_topic: None,
                },
            )]),
            measurand: BTreeMap::new(),
            csv: None,
            influx: None,
            mqtt: None,
            webserver: None,
        }
    }

    #[tokio::test]
    async fn builds_meters_from_config() {
        let app = Application::build(minimal_config("mbclient")).unwrap();
        let meter = app.meters.get("house").unwrap();
        assert_eq!(meter.backend.kind(), "mbclient");
        assert_eq!(meter.backend.measurands(), vec!["energy (wh)"]);
    }

    #[tokio::test]
    async fn unsupported_meter_type_is_fatal() {
        let err = Application::build(minimal_config("telepathy")).unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }
}
