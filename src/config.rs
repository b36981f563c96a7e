use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::{fs, path::Path};

use crate::sink::csv;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Cycle period in seconds.
    #[serde(default = "default_time_period")]
    pub time_period: u64,
    #[serde(default)]
    pub meter: BTreeMap<String, MeterConfig>,
    /// Measurand name -> output record name -> routing directive string.
    #[serde(default)]
    pub measurand: BTreeMap<String, BTreeMap<String, String>>,
    pub csv: Option<CsvConfig>,
    pub influx: Option<InfluxConfig>,
    pub mqtt: Option<MqttConfig>,
    pub webserver: Option<WebserverConfig>,
}

fn default_time_period() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterConfig {
    /// Backend type: "mbclient" | "mbgateway" | "fritz!powerline" | "s0counter"
    pub r#type: String,
    pub connection: String,
    /// Measurand name -> backend descriptor string.
    #[serde(default)]
    pub measurand: BTreeMap<String, String>,
    /// Topic for the per-meter MQTT payload; absent meters are not published.
    pub mqtt_topic: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvConfig {
    pub path: String,
    /// Period-templated file name, e.g. "energy_%Y%m.csv".
    pub filename_format: String,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default = "default_decimal_separator")]
    pub decimal_separator: String,
    #[serde(default = "default_date_format")]
    pub date_format: String,
}

fn default_separator() -> String {
    csv::DEFAULT_VALUE_SEPARATOR.to_string()
}

fn default_decimal_separator() -> String {
    csv::DEFAULT_DECIMAL_SEPARATOR.to_string()
}

fn default_date_format() -> String {
    csv::DEFAULT_DATE_FORMAT.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxConfig {
    /// Server base URL, e.g. http://localhost:8086
    pub url: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    /// Fixed tag applied to every point.
    pub location: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebserverConfig {
    #[serde(default)]
    pub active: bool,
    pub port: u16,
}

impl Config {
    /// Load YAML from disk, substitute $(VAR)/${VAR} with env vars, then parse.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let raw = fs::read_to_string(path)?;
        let expanded = expand_env_placeholders(&raw)?;
        let cfg: Self = serde_yaml::from_str(&expanded)?;

        anyhow::ensure!(
            !cfg.meter.is_empty(),
            "config must include at least one meter"
        );
        Ok(cfg)
    }
}

/// Expand $(VAR) and ${VAR} placeholders using environment variables.
/// "$$" escapes a literal "$".
fn expand_env_placeholders(input: &str) -> Result<String, anyhow::Error> {
    use anyhow::Context;

    let mut out = String::with_capacity(input.len());
    let mut it = input.chars().peekable();

    while let Some(c) = it.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match it.peek().copied() {
            Some('$') => {
                it.next();
                out.push('$');
            }
            Some(open @ ('(' | '{')) => {
                it.next();
                let close = if open == '(' { ')' } else { '}' };
                let var = read_until(&mut it, close)
                    .with_context(|| format!("unterminated env placeholder: missing {close:?}"))?;
                let val = std::env::var(&var)
                    .with_context(|| format!("missing environment variable: {var}"))?;
                out.push_str(&val);
            }
            _ => out.push('$'),
        }
    }

    Ok(out)
}

/// Read characters until `end`, consuming the closing delimiter.
fn read_until<I>(it: &mut std::iter::Peekable<I>, end: char) -> Option<String>
where
    I: Iterator<Item = char>,
{
    let mut buf = String::new();
    for ch in it.by_ref() {
        if ch == end {
            return Some(buf);
        }
        buf.push(ch);
    }
    None
}
