//! The modern REST-over-HTTPS transport (§4.C).
//!
//! Maps the legacy command-path vocabulary (`/ip/address/print`,
//! `/ip/address/add`, ...) onto HTTP verbs against RouterOS's `/rest`
//! surface, the same way `fetch_server_streams` in the teacher's
//! `control_api` builds a single `reqwest::Client` and checks
//! `status().is_success()` before decoding JSON.

use std::time::{Duration, Instant};

use reqwest::{Client, Method, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::command::Params;
use crate::error::{Error, Result};
use crate::parser::{RouterRow, normalize_row};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// What to do when a write marked idempotent hits a duplicate response.
#[derive(Debug, Clone)]
pub struct IdempotentRecovery {
    /// Field used to look the existing row back up, default `"name"`.
    pub key: String,
    pub value: String,
}

/// Attribute added to a row returned via idempotency recovery, so upstream
/// collaborators (the query builder) can distinguish "already existed"
/// from "just created".
pub const RECOVERY_MARKER: &str = "__recovered_via_idempotency";

/// The HTTPS/REST transport. Holds the `reqwest::Client` and the base
/// `https://host[:port]` URL; Basic auth credentials are attached per
/// request rather than stored on the client so they never leak into
/// connection-pool diagnostics.
pub struct RestTransport {
    client: Client,
    base_url: String,
    user: String,
    password: String,
}

impl RestTransport {
    pub fn new(host: &str, port: u16, user: &str, password: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| Error::Transport(format!("building REST client: {e}")))?;
        Ok(Self {
            client,
            base_url: format!("https://{host}:{port}"),
            user: user.to_owned(),
            password: password.to_owned(),
        })
    }

    /// Probe connectivity with a read against `/system/resource`, used by
    /// the client facade's connect sequence (§4.J step 2).
    pub async fn probe(&self) -> Result<()> {
        self.print("/system/resource", &Params::new()).await?;
        Ok(())
    }

    /// `GET`/`POST .../print` per the verb table — `print` without params
    /// is a plain `GET`; with params (a query or a proplist) it becomes a
    /// `POST .../print` carrying `.proplist`/`.query` in the body.
    pub async fn print(&self, menu: &str, params: &Params) -> Result<Vec<RouterRow>> {
        let (method, url, body) = if params.is_empty() {
            (Method::GET, format!("{}/rest{menu}", self.base_url), None)
        } else {
            let proplist = params
                .attributes
                .get(".proplist")
                .map(|p| p.split(',').map(str::to_owned).collect::<Vec<_>>())
                .unwrap_or_default();
            let body = json!({
                ".proplist": proplist,
                ".query": params.queries,
            });
            (
                Method::POST,
                format!("{}/rest{menu}/print", self.base_url),
                Some(body),
            )
        };
        let rows = self.execute(method, &url, body, menu).await?;
        Ok(rows)
    }

    pub async fn add(&self, menu: &str, params: &Params) -> Result<Vec<RouterRow>> {
        let url = format!("{}/rest{menu}", self.base_url);
        let body = attributes_body(params);
        self.execute(Method::PUT, &url, Some(body), menu).await
    }

    /// `PATCH .../<id>` with the id stripped out of the body (§4.C).
    pub async fn set(&self, menu: &str, id: &str, params: &Params) -> Result<Vec<RouterRow>> {
        let url = format!("{}/rest{menu}/{id}", self.base_url);
        let body = attributes_body(params);
        self.execute(Method::PATCH, &url, Some(body), menu).await
    }

    pub async fn remove(&self, menu: &str, id: &str) -> Result<Vec<RouterRow>> {
        let url = format!("{}/rest{menu}/{id}", self.base_url);
        self.execute(Method::DELETE, &url, None, menu).await
    }

    /// Catch-all verb for anything that isn't print/add/set/remove.
    pub async fn command(&self, menu: &str, params: &Params) -> Result<Vec<RouterRow>> {
        let url = format!("{}/rest{menu}", self.base_url);
        let body = attributes_body(params);
        self.execute(Method::POST, &url, Some(body), menu).await
    }

    /// Idempotency recovery (§4.C): GET `<base>?<key>=<urlencoded value>`
    /// and return the first matching row, tagged with [`RECOVERY_MARKER`].
    pub async fn recover_duplicate(
        &self,
        menu: &str,
        recovery: &IdempotentRecovery,
    ) -> Result<RouterRow> {
        let url = format!(
            "{}/rest{menu}?{}={}",
            self.base_url,
            recovery.key,
            urlencode(&recovery.value),
        );
        let mut rows = self.execute(Method::GET, &url, None, menu).await?;
        match rows.first_mut() {
            Some(row) => {
                row.insert(RECOVERY_MARKER.to_owned(), Value::Bool(true));
                Ok(row.clone())
            }
            None => Err(Error::IdempotencyLost(recovery.value.clone())),
        }
    }

    async fn execute(
        &self,
        method: Method,
        url: &str,
        body: Option<Value>,
        command: &str,
    ) -> Result<Vec<RouterRow>> {
        let start = Instant::now();
        let mut req = self
            .client
            .request(method, url)
            .basic_auth(&self.user, Some(&self.password));
        if let Some(body) = &body {
            req = req.json(body);
        }
        debug!(url, command, "REST transport: sending request");
        let response = req
            .send()
            .await
            .map_err(|e| Error::Transport(format!("REST request to {url}: {e}")))?;
        let rtt = start.elapsed();

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        if status.is_success() {
            let rows = normalize_success_body(response, url).await?;
            return Ok(rows);
        }

        let raw_body = response.text().await.unwrap_or_default();
        let detail = extract_detail(&raw_body);
        warn!(url, %status, %detail, "REST transport: non-2xx response");
        // Latency feedback is measured by the caller (`ClientInner::dispatch_read`/
        // `dispatch_write`), which owns the rate limiter; this transport stays
        // unaware of it so it can be exercised without a facade in tests.
        let _ = rtt;
        Err(Error::router(
            format!("{command}: {detail}"),
            Some(status.as_u16()),
        ))
    }
}

/// Normalize a successful REST response into a uniform row list: a single
/// object becomes a one-element list (§4.J), an array passes through, and
/// anything else is an empty list. Every row is also run through the
/// Result Parser's [`normalize_row`] (§4.O) so REST reads come back with
/// the same `id`/`macAddress`-style keys and coerced value types the socket
/// path already produces — otherwise a hybrid-mode join between a
/// socket-fed mirror and a REST-read foreign collection would never match.
async fn normalize_success_body(response: reqwest::Response, url: &str) -> Result<Vec<RouterRow>> {
    let value: Value = response
        .json()
        .await
        .map_err(|e| Error::Protocol(format!("invalid JSON from {url}: {e}")))?;
    Ok(match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| item.as_object().cloned())
            .map(normalize_row)
            .collect(),
        Value::Object(obj) => vec![normalize_row(obj)],
        Value::Null => Vec::new(),
        other => {
            warn!(?other, "REST transport: unexpected non-object success body");
            Vec::new()
        }
    })
}

fn attributes_body(params: &Params) -> Value {
    Value::Object(
        params
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

/// Parse a non-2xx body as JSON first, falling back to the raw text, per
/// §4.C.
fn extract_detail(raw_body: &str) -> String {
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(raw_body) {
        if let Some(detail) = obj.get("detail").and_then(Value::as_str) {
            return detail.to_owned();
        }
        if let Some(message) = obj.get("message").and_then(Value::as_str) {
            return message.to_owned();
        }
    }
    raw_body.to_owned()
}

/// Minimal percent-encoding for a query value in the idempotency recovery
/// GET. RouterOS identifiers are typically alphanumeric with `-`/`_`, so a
/// small manual table keeps this module free of an extra dependency the
/// rest of the crate doesn't otherwise need.
fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
