//! Meter backends: a closed set of device clients behind one dispatch enum.
//!
//! Every backend is configured from a connection string, registers its
//! measurands from descriptor strings, and answers `read(name)` with a
//! calibrated value. The retry policy is shared: transient fetch errors are
//! retried up to `maxretries` times with `timeout/2` pauses, a timed-out
//! fetch fails immediately, and decode errors are never retried because
//! decoding happens outside the retried closure.

pub mod gateway;
pub mod modbus;
pub mod powerline;
pub mod s0;

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use anyhow::anyhow;
use tracing::warn;

use crate::error::AppError;

pub use gateway::GatewayClient;
pub use modbus::ModbusClient;
pub use powerline::PowerlineClient;
pub use s0::S0Client;

#[derive(Debug)]
pub enum Backend {
    Modbus(ModbusClient),
    Gateway(GatewayClient),
    Powerline(PowerlineClient),
    S0(S0Client),
}

impl Backend {
    /// Builds the backend for a configured meter. An unsupported type is a
    /// startup failure; everything after startup degrades instead of dying.
    pub fn from_config(
        kind: &str,
        connection: &str,
        measurands: &BTreeMap<String, String>,
    ) -> Result<Backend, AppError> {
        let mut backend = match kind {
            "mbclient" => Backend::Modbus(ModbusClient::new(connection)),
            "mbgateway" => Backend::Gateway(GatewayClient::new(connection)),
            "fritz!powerline" => Backend::Powerline(PowerlineClient::new(connection)),
            "s0counter" => Backend::S0(S0Client::new(connection)),
            other => return Err(AppError::Other(anyhow!("client type {other:?} is not supported"))),
        };
        for (name, descriptor) in measurands {
            backend.add_measurand(name, descriptor);
        }
        Ok(backend)
    }

    pub fn add_measurand(&mut self, name: &str, descriptor: &str) {
        match self {
            Backend::Modbus(c) => c.add_measurand(name, descriptor),
            Backend::Gateway(c) => c.add_measurand(name, descriptor),
            Backend::Powerline(c) => c.add_measurand(name, descriptor),
            Backend::S0(c) => c.add_measurand(name, descriptor),
        }
    }

    pub fn measurands(&self) -> Vec<String> {
        match self {
            Backend::Modbus(c) => c.measurands(),
            Backend::Gateway(c) => c.measurands(),
            Backend::Powerline(c) => c.measurands(),
            Backend::S0(c) => c.measurands(),
        }
    }

    pub async fn read(&self, name: &str) -> Result<f64, AppError> {
        match self {
            Backend::Modbus(c) => c.read(name).await,
            Backend::Gateway(c) => c.read(name).await,
            Backend::Powerline(c) => c.read(name).await,
            Backend::S0(c) => c.read(name).await,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Backend::Modbus(_) => "mbclient",
            Backend::Gateway(_) => "mbgateway",
            Backend::Powerline(_) => "fritz!powerline",
            Backend::S0(_) => "s0counter",
        }
    }
}

/// Runs `op` with the shared retry/timeout policy. Each attempt races the
/// timeout; on expiry the in-flight future is dropped, so a late device
/// response is discarded rather than applied.
pub(crate) async fn fetch_with_retry<T, F, Fut>(
    timeout: Duration,
    max_retries: usize,
    mut op: F,
) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut attempt = 0;
    loop {
        match tokio::time::timeout(timeout, op()).await {
            Err(_) => return Err(AppError::Timeout(timeout)),
            Ok(Ok(v)) => return Ok(v),
            Ok(Err(e)) => {
                if attempt >= max_retries {
                    return Err(e);
                }
                warn!(attempt, error = %e, "transient read failure; retrying");
                tokio::time::sleep(timeout / 2).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retries_transient_errors_then_returns_last() {
        let attempts = AtomicUsize::new(0);
        let res: Result<f64, _> = fetch_with_retry(Duration::from_millis(10), 2, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::Transport("boom".into())) }
        })
        .await;
        assert!(matches!(res, Err(AppError::Transport(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failure() {
        let attempts = AtomicUsize::new(0);
        let res = fetch_with_retry(Duration::from_millis(10), 3, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AppError::Transport("flaky".into()))
                } else {
                    Ok(42.0)
                }
            }
        })
        .await;
        assert_eq!(res.unwrap(), 42.0);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn timeout_fails_immediately_without_retries() {
        let attempts = AtomicUsize::new(0);
        let res: Result<(), _> = fetch_with_retry(Duration::from_millis(5), 5, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        })
        .await;
        assert!(matches!(res, Err(AppError::Timeout(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
