//! Routing directives: which sinks receive which derived quantity of a
//! measurand. Parsed once at startup from the same `key:value` mini-language
//! as the connection strings, e.g.
//! `out:csv,influx type:value exclude:0 payload:reading unit:Wh`.

use std::collections::{BTreeMap, HashMap};

use crate::connspec::ConnSpec;
use crate::registry::MeasurandSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Csv,
    Influx,
    Mqtt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Value,
    Delta,
    Avg,
}

impl Quantity {
    pub fn select(self, sample: &MeasurandSample) -> f64 {
        match self {
            Quantity::Value => sample.value,
            Quantity::Delta => sample.delta,
            Quantity::Avg => sample.avg,
        }
    }
}

/// Role of a routed value inside the MQTT meter payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadRole {
    Reading,
    Flow,
}

#[derive(Debug, Clone)]
pub struct RoutingDirective {
    /// Output record/field name (CSV column suffix, influx field key).
    pub record: String,
    pub sinks: Vec<SinkKind>,
    pub quantity: Quantity,
    /// Suppress the value when it is exactly zero.
    pub exclude_zero: bool,
    pub payload_role: Option<PayloadRole>,
    pub unit: String,
}

impl RoutingDirective {
    fn parse(record: &str, directive: &str) -> Self {
        let mut spec = ConnSpec::new(directive);

        let sinks = spec
            .get_str("out", "")
            .split(',')
            .filter_map(|s| match s {
                "csv" => Some(SinkKind::Csv),
                "influx" => Some(SinkKind::Influx),
                "mqtt" => Some(SinkKind::Mqtt),
                _ => None,
            })
            .collect();

        let quantity = match spec.get_str("type", "value").as_str() {
            "delta" => Quantity::Delta,
            "avg" => Quantity::Avg,
            _ => Quantity::Value,
        };

        let exclude_zero = spec
            .get_str("exclude", "")
            .split(',')
            .any(|s| s == "0");

        let payload_role = match spec.get_str("payload", "").as_str() {
            "reading" => Some(PayloadRole::Reading),
            "flow" => Some(PayloadRole::Flow),
            _ => None,
        };

        Self {
            record: record.to_string(),
            sinks,
            quantity,
            exclude_zero,
            payload_role,
            unit: spec.get_str("unit", ""),
        }
    }

    pub fn targets(&self, sink: SinkKind) -> bool {
        self.sinks.contains(&sink)
    }

    /// Selects the routed quantity from a sample, honoring the zero-value
    /// exclusion flag.
    pub fn routed_value(&self, sample: &MeasurandSample) -> Option<f64> {
        let v = self.quantity.select(sample);
        if v == 0.0 && self.exclude_zero {
            return None;
        }
        Some(v)
    }
}

/// Measurand name to its routing directives, shared by the value computer
/// (to skip unrouted measurands) and the sink fan-out.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    map: HashMap<String, Vec<RoutingDirective>>,
}

impl RoutingTable {
    pub fn from_config(measurands: &BTreeMap<String, BTreeMap<String, String>>) -> Self {
        let mut map = HashMap::new();
        for (name, records) in measurands {
            let directives = records
                .iter()
                .map(|(record, directive)| RoutingDirective::parse(record, directive))
                .collect();
            map.insert(name.clone(), directives);
        }
        Self { map }
    }

    pub fn contains(&self, measurand: &str) -> bool {
        self.map.contains_key(measurand)
    }

    pub fn directives(&self, measurand: &str) -> &[RoutingDirective] {
        self.map.get(measurand).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample(value: f64, delta: f64, avg: f64) -> MeasurandSample {
        MeasurandSample {
            value,
            delta,
            avg,
            last_value: 0.0,
        }
    }

    #[test]
    fn parses_directive_string() {
        let d = RoutingDirective::parse("energy", "out:csv,influx type:value exclude:0 unit:Wh");
        assert_eq!(d.record, "energy");
        assert!(d.targets(SinkKind::Csv));
        assert!(d.targets(SinkKind::Influx));
        assert!(!d.targets(SinkKind::Mqtt));
        assert_eq!(d.quantity, Quantity::Value);
        assert!(d.exclude_zero);
        assert_eq!(d.unit, "Wh");
    }

    #[test]
    fn defaults_to_value_quantity_and_no_exclusion() {
        let d = RoutingDirective::parse("power", "out:mqtt payload:flow");
        assert_eq!(d.quantity, Quantity::Value);
        assert!(!d.exclude_zero);
        assert_eq!(d.payload_role, Some(PayloadRole::Flow));
    }

    #[test]
    fn zero_exclusion_suppresses_exact_zero_only() {
        let d = RoutingDirective::parse("energy", "out:influx type:delta exclude:0");
        assert_eq!(d.routed_value(&sample(5.0, 0.0, 1.0)), None);
        assert_eq!(d.routed_value(&sample(5.0, 0.5, 1.0)), Some(0.5));
    }

    #[test]
    fn quantity_selects_derived_metric() {
        let s = sample(150.0, 50.0, 25.0);
        assert_eq!(Quantity::Value.select(&s), 150.0);
        assert_eq!(Quantity::Delta.select(&s), 50.0);
        assert_eq!(Quantity::Avg.select(&s), 25.0);
    }

    #[test]
    fn table_lookups() {
        let cfg = BTreeMap::from([(
            "energy (wh)".to_string(),
            BTreeMap::from([("energy".to_string(), "out:csv type:value".to_string())]),
        )]);
        let table = RoutingTable::from_config(&cfg);
        assert!(table.contains("energy (wh)"));
        assert!(!table.contains("power (w)"));
        assert_eq!(table.directives("energy (wh)").len(), 1);
        assert!(table.directives("power (w)").is_empty());
    }
}
