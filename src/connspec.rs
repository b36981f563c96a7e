//! Parser for the whitespace-delimited `key:value` mini-language used by
//! connection strings and measurand descriptors, e.g.
//! `connection:127.0.0.1:502 deviceid:3 timeout:1000 maxretries:2`.
//!
//! Parsing is deliberately lenient: an absent key leaves the caller-supplied
//! default in place, an unparsable value falls back to the zero value of its
//! type, and the whole string never fails. Keys that did not produce a value
//! are recorded and can be inspected through [`ConnSpec::missing`].

use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tracing::debug;

use crate::decode::Format;

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^https?://.*$").unwrap())
}

fn host_port_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}:\d{1,5}$").unwrap())
}

pub struct ConnSpec<'a> {
    tokens: Vec<&'a str>,
    missing: Vec<String>,
}

impl<'a> ConnSpec<'a> {
    pub fn new(spec: &'a str) -> Self {
        Self {
            tokens: spec.split_whitespace().collect(),
            missing: Vec::new(),
        }
    }

    /// Keys that a getter looked for but could not resolve. Lenient parsing
    /// never fails, so this is the only way to see what fell back.
    pub fn missing(&self) -> &[String] {
        &self.missing
    }

    fn miss(&mut self, key: &str) {
        debug!(key = %key, "field not found in spec string");
        self.missing.push(key.to_string());
    }

    /// First token of the form `key:value`, exactly one colon in the value
    /// position. `127.0.0.1:502` style values are handled by [`endpoint`],
    /// not here.
    ///
    /// [`endpoint`]: ConnSpec::endpoint
    fn raw(&self, key: &str) -> Option<&'a str> {
        self.tokens.iter().find_map(|t| {
            let (k, v) = t.split_once(':')?;
            (k == key && !v.contains(':')).then_some(v)
        })
    }

    pub fn get_str(&mut self, key: &str, default: &str) -> String {
        match self.raw(key) {
            Some(v) => v.to_string(),
            None => {
                self.miss(key);
                default.to_string()
            }
        }
    }

    /// Integer-like lookup. Absent key: caller default. Present but
    /// unparsable: the type's zero value.
    pub fn get_num<T>(&mut self, key: &str, default: T) -> T
    where
        T: FromStr + Default,
    {
        match self.raw(key) {
            Some(v) => v.parse().unwrap_or_default(),
            None => {
                self.miss(key);
                default
            }
        }
    }

    /// Duration in milliseconds. Present but unparsable falls back to one
    /// second, matching the zero-ish value the wire format always assumed.
    pub fn get_duration_ms(&mut self, key: &str, default: Duration) -> Duration {
        match self.raw(key) {
            Some(v) => v
                .parse::<u64>()
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_secs(1)),
            None => {
                self.miss(key);
                default
            }
        }
    }

    /// Register format, either `format:uint32` or a bare `uint32` token.
    pub fn get_format(&mut self, default: Format) -> Format {
        if let Some(v) = self.raw("format") {
            if let Ok(f) = v.parse() {
                return f;
            }
        }
        for t in &self.tokens {
            if let Ok(f) = t.parse() {
                return f;
            }
        }
        self.miss("format");
        default
    }

    /// The endpoint address may carry its key as a label or appear bare:
    /// the first token that looks like an absolute URL or an `ip:port`
    /// pair wins.
    pub fn endpoint(&mut self, key: &str, default: &str) -> String {
        let label = format!("{key}:");
        for t in &self.tokens {
            let candidate = t.strip_prefix(&label).unwrap_or(t);
            if url_re().is_match(candidate) || host_port_re().is_match(candidate) {
                return candidate.to_string();
            }
        }
        self.miss(key);
        default.to_string()
    }
}
