//! Direct Modbus-TCP backend: one holding-register read per measurand,
//! decoded with the shared register decoder.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio_modbus::client::tcp;
use tokio_modbus::prelude::*;

use crate::connspec::ConnSpec;
use crate::decode::{apply_scale_factor, decode_registers, Format};
use crate::error::AppError;

use super::fetch_with_retry;

#[derive(Debug)]
pub struct ModbusClient {
    endpoint: String,
    device_id: u8,
    timeout: Duration,
    max_retries: usize,
    measurands: BTreeMap<String, RegisterParam>,
}

#[derive(Debug)]
struct RegisterParam {
    address: u16,
    format: Format,
    scale_factor: i32,
}

impl ModbusClient {
    /// Parses a connection string such as
    /// `connection:127.0.0.1:502 deviceid:3 timeout:1000 maxretries:2`.
    pub fn new(connection: &str) -> Self {
        let mut spec = ConnSpec::new(connection);
        Self {
            endpoint: spec.endpoint("connection", ""),
            device_id: spec.get_num("deviceid", 1),
            timeout: spec.get_duration_ms("timeout", Duration::from_secs(1)),
            max_retries: spec.get_num("maxretries", 0),
            measurands: BTreeMap::new(),
        }
    }

    /// Descriptor: `address:<register> format:<fmt> sf:<power-of-ten>`.
    pub fn add_measurand(&mut self, name: &str, descriptor: &str) {
        let mut spec = ConnSpec::new(descriptor);
        let p = RegisterParam {
            address: spec.get_num("address", 0),
            format: spec.get_format(Format::Uint16),
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

        let quantity = p.format.word_count() as u16;
        let words = fetch_with_retry(self.timeout, self.max_retries, || {
            self.fetch(p.address, quantity)
        })
        .await?;

        let v = decode_registers(&words, p.format)?;
        Ok(apply_scale_factor(v, p.scale_factor))
    }

    async fn fetch(&self, address: u16, quantity: u16) -> Result<Vec<u16>, AppError> {
        let addr: SocketAddr = self
            .endpoint
            .parse()
            .map_err(|e| AppError::Transport(format!("invalid endpoint {:?}: {e}", self.endpoint)))?;

        let mut ctx = tcp::connect_slave(addr, Slave(self.device_id))
            .await
            .map_err(|e| AppError::Transport(e.to_string()))?;

        let words = ctx
            .read_holding_registers(address, quantity)
            .await
            .map_err(|e| AppError::Transport(e.to_string()))?
            .map_err(|e| AppError::Transport(format!("modbus exception: {e}")))?;
        Ok(words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn configures_from_connection_string() {
        let c = ModbusClient::new("connection:127.0.0.1:502 deviceid:3 timeout:1000");
        assert_eq!(c.endpoint, "127.0.0.1:502");
        assert_eq!(c.device_id, 3);
        assert_eq!(c.timeout, Duration::from_millis(1000));
        // unset maxretries keeps the caller default
        assert_eq!(c.max_retries, 0);
    }

    #[test]
    fn registers_measurands_idempotently() {
        let mut c = ModbusClient::new("connection:127.0.0.1:502");
        c.add_measurand("energy (wh)", "address:4 format:uint32 sf:0");
        c.add_measurand("energy (wh)", "address:4 format:uint32 sf:0");
        c.add_measurand("power (w)", "address:8 format:float32 sf:-1");
        assert_eq!(c.measurands(), vec!["energy (wh)", "power (w)"]);
        assert_eq!(c.measurands["power (w)"].scale_factor, -1);
        assert_eq!(c.measurands["power (w)"].format, Format::Float32);
    }

    #[tokio::test]
    async fn unknown_measurand_is_an_error() {
        let c = ModbusClient::new("connection:127.0.0.1:502");
        let err = c.read("nope").await.unwrap_err();
        assert!(matches!(err, AppError::UnknownMeasurand(_)));
    }
}
