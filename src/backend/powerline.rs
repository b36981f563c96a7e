//! Vendor powerline backend (FRITZ! home-automation HTTP API).
//!
//! Authentication is challenge-response: the device hands out a challenge,
//! the client answers with `challenge-md5(utf16le("challenge-password"))`
//! and receives a session id that stays valid for ten minutes of activity.
//! Each read is an authenticated GET whose plain-text body is already the
//! calibrated reading; only the scale factor is applied on top.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use regex::Regex;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::connspec::ConnSpec;
use crate::decode::apply_scale_factor;
use crate::error::AppError;

use super::fetch_with_retry;

/// The invalid session id the device uses to signal "not logged in".
const DEFAULT_SID: &str = "0000000000000000";
/// Inactivity window after which the device closes a session.
const SESSION_EXPIRES: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
pub struct PowerlineClient {
    base_url: String,
    username: String,
    password: String,
    ain: String,
    timeout: Duration,
    max_retries: usize,
    http: reqwest::Client,
    session: Mutex<Option<Session>>,
    measurands: BTreeMap<String, CommandParam>,
}

#[derive(Debug)]
struct CommandParam {
    command: String,
    scale_factor: i32,
}

#[derive(Debug, Clone)]
struct Session {
    sid: String,
    expires: Instant,
}

impl PowerlineClient {
    /// Connection string:
    /// `http://fritz.box ain:116570149698 username:smarthome password:secret timeout:100`.
    pub fn new(connection: &str) -> Self {
        let mut spec = ConnSpec::new(connection);
        Self {
            base_url: spec.endpoint("baseUrl", ""),
            username: spec.get_str("username", ""),
            password: spec.get_str("password", ""),
            ain: spec.get_str("ain", ""),
            timeout: spec.get_duration_ms("timeout", Duration::from_secs(1)),
            max_retries: spec.get_num("maxretries", 0),
            http: reqwest::Client::new(),
            session: Mutex::new(None),
            measurands: BTreeMap::new(),
        }
    }

    /// Descriptor: `command:<switchcmd> sf:<power-of-ten>`.
    pub fn add_measurand(&mut self, name: &str, descriptor: &str) {
        let mut spec = ConnSpec::new(descriptor);
        let p = CommandParam {
            command: spec.get_str("command", ""),
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

        let body =
            fetch_with_retry(self.timeout, self.max_retries, || self.fetch(&p.command)).await?;

        let v: f64 = body
            .trim()
            .parse()
            .map_err(|e| AppError::Decode(format!("powerline response {body:?}: {e}")))?;
        Ok(apply_scale_factor(v, p.scale_factor))
    }

    async fn fetch(&self, command: &str) -> Result<String, AppError> {
        let sid = self.session_id().await?;
        let url = format!(
            "{}/webservices/homeautoswitch.lua?switchcmd={command}&ain={}&sid={sid}",
            self.base_url, self.ain
        );
        debug!(url = %url, "performing powerline http request");
        let body = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body)
    }

    /// Returns a valid session id, logging in again when the cached one has
    /// expired. Refreshes the expiry on use, mirroring the device's
    /// inactivity window.
    async fn session_id(&self) -> Result<String, AppError> {
        let mut session = self.session.lock().await;
        if let Some(s) = session.as_mut() {
            if s.expires > Instant::now() {
                s.expires = Instant::now() + SESSION_EXPIRES;
                return Ok(s.sid.clone());
            }
        }

        let sid = self.login().await?;
        *session = Some(Session {
            sid: sid.clone(),
            expires: Instant::now() + SESSION_EXPIRES,
        });
        Ok(sid)
    }

    async fn login(&self) -> Result<String, AppError> {
        let login_url = format!("{}/login_sid.lua", self.base_url);
        let body = self.http.get(&login_url).send().await?.text().await?;

        let sid = xml_field(&body, "SID")
            .ok_or_else(|| AppError::Decode(format!("no SID in session info {body:?}")))?;
        if sid != DEFAULT_SID {
            return Ok(sid);
        }

        let challenge = xml_field(&body, "Challenge")
            .ok_or_else(|| AppError::Decode(format!("no challenge in session info {body:?}")))?;
        let response = challenge_response(&challenge, &self.password);

        let body = self
            .http
            .post(&login_url)
            .form(&[("username", self.username.as_str()), ("response", &response)])
            .send()
            .await?
            .text()
            .await?;

        let sid = xml_field(&body, "SID")
            .ok_or_else(|| AppError::Decode(format!("no SID in login reply {body:?}")))?;
        if sid == DEFAULT_SID {
            return Err(AppError::Transport("powerline login rejected: invalid credentials".into()));
        }
        Ok(sid)
    }
}

/// `challenge-password` encoded as UTF-16LE (codepoints above 255 become
/// `.`, per the vendor's technical notes), MD5-hashed and formatted as
/// `challenge-hexdigest`.
fn challenge_response(challenge: &str, password: &str) -> String {
    let mut buf = Vec::new();
    for unit in format!("{challenge}-{password}").encode_utf16() {
        let unit = if unit > 255 { 0x2e } else { unit };
        buf.extend_from_slice(&unit.to_le_bytes());
    }

    let digest = md5::compute(&buf);
    let mut resp = format!("{challenge}-");
    write!(resp, "{digest:x}").expect("writing to a String cannot fail");
    resp
}

fn xml_field(body: &str, tag: &str) -> Option<String> {
    let re = Regex::new(&format!("<{tag}>([^<]*)</{tag}>")).ok()?;
    re.captures(body).map(|c| c[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn challenge_response_matches_reference_vector() {
        // Documented example from the vendor's session-id technical note.
        assert_eq!(
            challenge_response("1234567z", "äbc"),
            "1234567z-9e224a41eeefa284df7bb0f26c2913e2"
        );
    }

    #[test]
    fn codepoints_above_255_become_dots() {
        // "€" (U+20AC) must hash like "."
        assert_eq!(
            challenge_response("abc", "€"),
            challenge_response("abc", ".")
        );
    }

    #[test]
    fn extracts_session_info_fields() {
        let body = "<SessionInfo><SID>0000000000000000</SID>\
                    <Challenge>1234567z</Challenge><BlockTime>0</BlockTime></SessionInfo>";
        assert_eq!(xml_field(body, "SID").unwrap(), "0000000000000000");
        assert_eq!(xml_field(body, "Challenge").unwrap(), "1234567z");
        assert_eq!(xml_field(body, "Missing"), None);
    }

    #[test]
    fn configures_from_connection_string() {
        let c = PowerlineClient::new(
            "http://fritz.box ain:116570149698 username:smarthome password:secret timeout:100",
        );
        assert_eq!(c.base_url, "http://fritz.box");
        assert_eq!(c.ain, "116570149698");
        assert_eq!(c.username, "smarthome");
        assert_eq!(c.timeout, Duration::from_millis(100));
    }
}
