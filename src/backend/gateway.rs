//! HTTP Modbus-gateway backend. The gateway proxies holding-register reads
//! and answers with a JSON body whose `Data.Data` field is the register
//! payload hex-encoded, four hex digits per 16-bit word.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::connspec::ConnSpec;
use crate::decode::{apply_scale_factor, decode_registers, Format};
use crate::error::AppError;

use super::fetch_with_retry;

#[derive(Debug)]
pub struct GatewayClient {
    base_url: String,
    timeout: Duration,
    max_retries: usize,
    http: reqwest::Client,
    measurands: BTreeMap<String, RegisterParam>,
}

#[derive(Debug)]
struct RegisterParam {
    address: u16,
    format: Format,
    scale_factor: i32,
}

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    #[serde(rename = "Data")]
    data: GatewayData,
}

#[derive(Debug, Deserialize)]
struct GatewayData {
    #[serde(rename = "Quantity")]
    quantity: u16,
    #[serde(rename = "Data")]
    data: String,
}

impl GatewayClient {
    pub fn new(connection: &str) -> Self {
        let mut spec = ConnSpec::new(connection);
        Self {
            base_url: spec.endpoint("connection", ""),
            timeout: spec.get_duration_ms("timeout", Duration::from_secs(1)),
            max_retries: spec.get_num("maxretries", 0),
            http: reqwest::Client::new(),
            measurands: BTreeMap::new(),
        }
    }

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
        let url = format!(
            "{}/readholdingregisters?Address={}&Quantity={}",
            self.base_url, p.address, quantity
        );

        let body =
            fetch_with_retry(self.timeout, self.max_retries, || self.fetch(&url)).await?;

        let words = parse_register_payload(&body, quantity)?;
        let v = decode_registers(&words, p.format)?;
        Ok(apply_scale_factor(v, p.scale_factor))
    }

    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        debug!(url = %url, "performing gateway http get");
        let body = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body)
    }
}

/// Decodes the gateway JSON body into register words. Runs after the retry
/// loop: a malformed payload is a decode failure, not a transient one.
fn parse_register_payload(body: &str, expected_quantity: u16) -> Result<Vec<u16>, AppError> {
    let resp: GatewayResponse = serde_json::from_str(body)?;
    let hex_payload = &resp.data.data;

    if resp.data.quantity != expected_quantity {
        return Err(AppError::Decode(format!(
            "gateway returned {} words, requested {expected_quantity}",
            resp.data.quantity
        )));
    }
    if hex_payload.len() != expected_quantity as usize * 4 {
        return Err(AppError::Decode(format!(
            "gateway payload {hex_payload:?} does not hold {expected_quantity} words"
        )));
    }

    let bytes = hex::decode(hex_payload)
        .map_err(|e| AppError::Decode(format!("gateway payload {hex_payload:?}: {e}")))?;
    Ok(bytes
        .chunks(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_hex_register_payload() {
        let body = r#"{"Time":"2021-01-01T00:00:00Z","Duration":3,"Data":{"Address":4,"Quantity":2,"Data":"0001e240"}}"#;
        let words = parse_register_payload(body, 2).unwrap();
        assert_eq!(words, vec![0x0001, 0xe240]);
        // 0x0001e240 = 123456
        assert_eq!(decode_registers(&words, Format::Uint32).unwrap(), 123456.0);
    }

    #[test]
    fn short_payload_is_a_decode_error() {
        let body = r#"{"Data":{"Address":4,"Quantity":2,"Data":"0001"}}"#;
        let err = parse_register_payload(body, 2).unwrap_err();
        assert!(matches!(err, AppError::Decode(_)));
    }

    #[test]
    fn quantity_mismatch_is_a_decode_error() {
        let body = r#"{"Data":{"Address":4,"Quantity":1,"Data":"0001"}}"#;
        let err = parse_register_payload(body, 2).unwrap_err();
        assert!(matches!(err, AppError::Decode(_)));
    }

    #[test]
    fn malformed_json_is_a_json_error() {
        let err = parse_register_payload("not json", 1).unwrap_err();
        assert!(matches!(err, AppError::Json(_)));
    }
}
