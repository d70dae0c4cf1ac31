//! Thin `RouterOS` REST transport.
//!
//! `RouterOS` maps REST verbs onto its console: `GET` prints, `PUT` adds,
//! `PATCH` sets, `DELETE` removes and `POST` executes a command.

use std::time::Duration;

use reqwest::header::ACCEPT;
use reqwest::{Method, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace};
use url::Url;

use crate::error::{Result, WireGuardError};

/// One `RouterOS` object as returned by the API.
pub type JsonObject = serde_json::Map<String, Value>;

/// Connection settings for [`MikrotikClient`].
pub struct ClientSettings {
    /// Base URL of the REST API, e.g. `https://router/rest`.
    pub api_url: String,
    /// Basic auth user; empty disables authentication.
    pub api_user: String,
    /// Basic auth password.
    pub api_password: SecretString,
    /// Verify the device certificate.
    pub verify_tls: bool,
    /// Per-request deadline.
    pub timeout: Duration,
    /// Log every request and response body.
    pub debug: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    detail: String,
}

/// HTTP client for one `RouterOS` device.
pub struct MikrotikClient {
    http: reqwest::Client,
    base: String,
    user: String,
    password: SecretString,
    debug: bool,
}

impl MikrotikClient {
    /// Builds a client from settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is malformed or the TLS stack fails to load.
    pub fn new(settings: ClientSettings) -> Result<Self> {
        // validate once so later joins only append path segments
        let base = Url::parse(&settings.api_url)?;
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .danger_accept_invalid_certs(!settings.verify_tls)
            .build()?;
        Ok(Self {
            http,
            base: base.as_str().trim_end_matches('/').to_string(),
            user: settings.api_user,
            password: settings.api_password,
            debug: settings.debug,
        })
    }

    fn url(&self, command: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "{}/{}",
            self.base,
            command.trim_start_matches('/')
        ))?)
    }

    fn request(&self, method: Method, command: &str) -> Result<RequestBuilder> {
        let url = self.url(command)?;
        if self.debug {
            debug!(%method, %url, "routeros request");
        }
        let mut builder = self.http.request(method, url).header(ACCEPT, "application/json");
        let password = self.password.expose_secret();
        if !self.user.is_empty() && !password.is_empty() {
            builder = builder.basic_auth(&self.user, Some(password));
        }
        Ok(builder)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Value> {
        let response = builder.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        if self.debug {
            trace!(status = status.as_u16(), body = %String::from_utf8_lossy(&body), "routeros response");
        }

        if !status.is_success() {
            let err: ApiErrorBody = serde_json::from_slice(&body).unwrap_or_default();
            let message = match (err.message.is_empty(), err.detail.is_empty()) {
                (true, _) => status.canonical_reason().unwrap_or("request failed").to_string(),
                (false, true) => err.message,
                (false, false) => format!("{}: {}", err.message, err.detail),
            };
            return Err(WireGuardError::Api {
                status: status.as_u16(),
                message,
            });
        }

        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&body).map_err(|e| WireGuardError::Decode(e.to_string()))
    }

    /// Lists objects under `command` matching all `filters`.
    ///
    /// An empty `proplist` returns every property.
    pub async fn query(
        &self,
        command: &str,
        filters: &[(&str, &str)],
        proplist: &[&str],
    ) -> Result<Vec<JsonObject>> {
        let mut params: Vec<(&str, String)> =
            filters.iter().map(|(k, v)| (*k, (*v).to_string())).collect();
        if !proplist.is_empty() {
            params.push((".proplist", proplist.join(",")));
        }
        let builder = self.request(Method::GET, command)?.query(&params);
        into_list(self.send(builder).await?)
    }

    /// Reads one object by path.
    pub async fn get(&self, command: &str, proplist: &[&str]) -> Result<JsonObject> {
        let mut builder = self.request(Method::GET, command)?;
        if !proplist.is_empty() {
            builder = builder.query(&[(".proplist", proplist.join(","))]);
        }
        match self.send(builder).await? {
            Value::Object(obj) => Ok(obj),
            other => Err(WireGuardError::Decode(format!("expected object, got {other}"))),
        }
    }

    /// Adds a new object and returns it.
    pub async fn create(&self, command: &str, body: &Value) -> Result<JsonObject> {
        let builder = self.request(Method::PUT, command)?.json(body);
        match self.send(builder).await? {
            Value::Object(obj) => Ok(obj),
            _ => Ok(JsonObject::new()),
        }
    }

    /// Changes properties of an existing object.
    pub async fn update(&self, command: &str, body: &Value) -> Result<()> {
        let builder = self.request(Method::PATCH, command)?.json(body);
        self.send(builder).await?;
        Ok(())
    }

    /// Removes an object.
    pub async fn delete(&self, command: &str) -> Result<()> {
        let builder = self.request(Method::DELETE, command)?;
        self.send(builder).await?;
        Ok(())
    }

    /// Executes a console command and returns its output records.
    pub async fn exec_list(&self, command: &str, body: &Value) -> Result<Vec<JsonObject>> {
        let builder = self.request(Method::POST, command)?.json(body);
        into_list(self.send(builder).await?)
    }
}

fn into_list(value: Value) -> Result<Vec<JsonObject>> {
    match value {
        Value::Array(items) => Ok(items
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(obj) => Some(obj),
                _ => None,
            })
            .collect()),
        Value::Object(obj) => Ok(vec![obj]),
        Value::Null => Ok(Vec::new()),
        other => Err(WireGuardError::Decode(format!("expected list, got {other}"))),
    }
}

/// String property, empty when absent.
#[must_use]
pub fn get_string(obj: &JsonObject, key: &str) -> String {
    match obj.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

/// Integer property; `RouterOS` sends most numbers as strings.
#[must_use]
pub fn get_int(obj: &JsonObject, key: &str) -> i64 {
    match obj.get(key) {
        Some(Value::Number(n)) => n.as_i64().unwrap_or_default(),
        Some(Value::String(s)) => s.trim().parse().unwrap_or_default(),
        _ => 0,
    }
}

/// Boolean property; accepts `true`, `"true"`, `"yes"` and non-zero numbers.
#[must_use]
pub fn get_bool(obj: &JsonObject, key: &str) -> bool {
    match obj.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().is_some_and(|v| v != 0),
        Some(Value::String(s)) => matches!(s.as_str(), "true" | "yes"),
        _ => false,
    }
}

/// Parses a `RouterOS` duration such as `1w2d3h4m5s`, `1ms234us` or `00:00:02`.
#[must_use]
pub fn parse_duration(input: &str) -> Option<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    let (units, clock) = if s.contains(':') {
        match s.rfind(|c: char| c.is_ascii_alphabetic()) {
            Some(i) => (&s[..=i], &s[i + 1..]),
            None => ("", s),
        }
    } else {
        (s, "")
    };

    let mut total = 0.0_f64;
    let mut number = String::new();
    let mut unit = String::new();
    let mut flush = |number: &mut String, unit: &mut String| -> Option<()> {
        if number.is_empty() {
            return if unit.is_empty() { Some(()) } else { None };
        }
        let value: f64 = number.parse().ok()?;
        let factor = match unit.as_str() {
            "w" => 604_800.0,
            "d" => 86_400.0,
            "h" => 3_600.0,
            "m" => 60.0,
            "s" | "" => 1.0,
            "ms" => 1e-3,
            "us" => 1e-6,
            "ns" => 1e-9,
            _ => return None,
        };
        total += value * factor;
        number.clear();
        unit.clear();
        Some(())
    };

    for c in units.chars() {
        if c.is_ascii_digit() || c == '.' {
            if !unit.is_empty() {
                flush(&mut number, &mut unit)?;
            }
            number.push(c);
        } else if c.is_ascii_alphabetic() {
            unit.push(c);
        } else {
            return None;
        }
    }
    flush(&mut number, &mut unit)?;

    if !clock.is_empty() {
        let parts: Vec<&str> = clock.split(':').collect();
        let [h, m, sec] = parts.as_slice() else {
            return None;
        };
        let h: f64 = h.parse().ok()?;
        let m: f64 = m.parse().ok()?;
        let sec: f64 = sec.parse().ok()?;
        total += h * 3_600.0 + m * 60.0 + sec;
    }

    (total.is_finite() && total >= 0.0).then(|| Duration::from_secs_f64(total))
}

/// Formats whole seconds the way `RouterOS` accepts them, e.g. `1m30s`.
#[must_use]
pub fn format_duration(secs: u64) -> String {
    let (h, m, s) = (secs / 3_600, (secs % 3_600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;
    use test_case::test_case;
    use wiremock::matchers::{body_json, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup(user: &str) -> (MockServer, MikrotikClient) {
        let server = MockServer::start().await;
        let client = MikrotikClient::new(ClientSettings {
            api_url: format!("{}/rest", server.uri()),
            api_user: user.to_string(),
            api_password: SecretString::from("secret".to_string()),
            verify_tls: true,
            timeout: Duration::from_secs(5),
            debug: true,
        })
        .unwrap();
        (server, client)
    }

    #[test_case("25s", 25_000; "seconds")]
    #[test_case("1m30s", 90_000; "minutes and seconds")]
    #[test_case("1h2m3s", 3_723_000; "hours")]
    #[test_case("1d", 86_400_000; "day")]
    #[test_case("1w", 604_800_000; "week")]
    #[test_case("1ms500us", 1; "sub millisecond truncates")]
    #[test_case("00:00:02", 2_000; "clock")]
    #[test_case("1d00:00:02", 86_402_000; "day and clock")]
    fn parses_durations(input: &str, millis: u128) {
        assert_eq!(parse_duration(input).unwrap().as_millis(), millis);
    }

    #[test_case(""; "empty")]
    #[test_case("abc"; "no digits")]
    #[test_case("5x"; "unknown unit")]
    #[test_case("1:2"; "short clock")]
    fn rejects_bad_durations(input: &str) {
        assert!(parse_duration(input).is_none());
    }

    #[test_case(0, "0s")]
    #[test_case(25, "25s")]
    #[test_case(90, "1m30s")]
    #[test_case(3_600, "1h0m0s")]
    fn formats_durations(secs: u64, expected: &str) {
        assert_eq!(format_duration(secs), expected);
    }

    #[test]
    fn value_helpers_accept_routeros_encodings() {
        let obj = json!({
            "a": "12", "b": 7, "c": "true", "d": false, "e": 1, "f": "yes", "g": "x"
        });
        let obj = obj.as_object().unwrap();
        assert_eq!(get_int(obj, "a"), 12);
        assert_eq!(get_int(obj, "b"), 7);
        assert_eq!(get_int(obj, "g"), 0);
        assert!(get_bool(obj, "c"));
        assert!(!get_bool(obj, "d"));
        assert!(get_bool(obj, "e"));
        assert!(get_bool(obj, "f"));
        assert_eq!(get_string(obj, "b"), "7");
        assert_eq!(get_string(obj, "missing"), "");
    }

    #[tokio::test]
    async fn query_sends_filters_and_proplist() {
        let (server, client) = setup("admin").await;
        Mock::given(method("GET"))
            .and(path("/rest/interface/wireguard"))
            .and(query_param("name", "wg0"))
            .and(query_param(".proplist", ".id,name"))
            .and(header_exists("authorization"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{ ".id": "*1", "name": "wg0" }])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let items = client
            .query("/interface/wireguard", &[("name", "wg0")], &[".id", "name"])
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(get_string(&items[0], ".id"), "*1");
    }

    #[tokio::test]
    async fn api_errors_carry_status_and_message() {
        let (server, client) = setup("").await;
        Mock::given(method("GET"))
            .and(path("/rest/interface/*9"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": 404, "message": "Not Found", "detail": "no such item"
            })))
            .mount(&server)
            .await;

        let err = client.get("/interface/*9", &[]).await.unwrap_err();
        assert!(err.is_not_exist());
        assert_eq!(err.to_string(), "api error 404: Not Found: no such item");
    }

    #[tokio::test]
    async fn create_and_update_send_json() {
        let (server, client) = setup("admin").await;
        Mock::given(method("PUT"))
            .and(path("/rest/ip/address"))
            .and(body_json(json!({ "address": "10.0.0.1/24", "interface": "wg0" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ ".id": "*A" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/rest/ip/address/*A"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let created = client
            .create(
                "/ip/address",
                &json!({ "address": "10.0.0.1/24", "interface": "wg0" }),
            )
            .await
            .unwrap();
        assert_eq!(get_string(&created, ".id"), "*A");
        client
            .update("/ip/address/*A", &json!({ "disabled": "false" }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn empty_success_body_is_accepted() {
        let (server, client) = setup("admin").await;
        Mock::given(method("DELETE"))
            .and(path("/rest/ip/address/*A"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        client.delete("/ip/address/*A").await.unwrap();
    }
}
