//! Remote Gateway: REST client for the zone-partitioned backend.
//!
//! Each collection is a remote table of `(zone, id, data, updated_at)` rows.
//! All calls carry the bearer token and the static API key. A 401, or a body
//! reporting an expired JWT, triggers exactly one refresh-token grant and one
//! retry of the original request.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use chrono::{SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::auth::{self, Profile, Session, TokenResponse};
use crate::context::SyncContext;
use crate::db::DbState;
use crate::error::{truncate_body, Error, Result};
use crate::settings::RemoteConfig;
use crate::store::{record_id, Collection, Record};

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight connectivity test.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

const REST_PREFIX: &str = "/rest/v1";
const AUTH_PREFIX: &str = "/auth/v1";

// ---------------------------------------------------------------------------
// Gateway contract
// ---------------------------------------------------------------------------

/// One remote row as returned by a zone select.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRow {
    pub zone: String,
    pub id: String,
    pub data: Value,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl RemoteRow {
    /// The embedded record, when it is an object carrying an `id`.
    pub fn record(&self) -> Option<&Record> {
        let record = self.data.as_object()?;
        record_id(record).ok()?;
        Some(record)
    }
}

/// Zone-scoped remote operations used by the write path and sync engine.
pub trait RemoteGateway: Send + Sync {
    /// Whether remote sync can be attempted right now (configured and signed in).
    fn is_ready(&self) -> bool;

    /// The zone writes are scoped to.
    fn active_zone(&self) -> Option<String>;

    /// Rows of `zone`, newest `updated_at` first.
    fn select_zone(
        &self,
        collection: Collection,
        zone: &str,
    ) -> impl Future<Output = Result<Vec<RemoteRow>>> + Send;

    /// Full-row overwrite of `(active zone, record.id)`.
    fn upsert(
        &self,
        collection: Collection,
        record: &Record,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Remove `(active zone, id)`.
    fn delete(&self, collection: Collection, id: &str) -> impl Future<Output = Result<()>> + Send;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/rest/v1` segment
pub fn normalize_remote_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with(REST_PREFIX) {
        url.truncate(url.len() - REST_PREFIX.len());
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

pub fn extract_key_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("key")
                .or_else(|| v.get("anonKey"))
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
}

pub fn extract_url_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("url")
                .and_then(Value::as_str)
                .map(normalize_remote_url)
        })
        .filter(|s| !s.is_empty())
}

/// Percent-encode a query value (RFC 3986 unreserved set kept as-is).
pub(crate) fn percent_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for b in input.bytes() {
        let is_unreserved =
            b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~';
        if is_unreserved {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    encoded
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Session is invalid or expired".to_string(),
        403 => "Zone not accessible for this account".to_string(),
        404 => "Remote collection not found".to_string(),
        409 => "Conflicting remote row".to_string(),
        s if s >= 500 => format!("Remote server error (HTTP {s})"),
        s => format!("Unexpected response from remote (HTTP {s})"),
    }
}

/// Build an error from a non-2xx response body, keeping server details.
fn error_from_body(status: StatusCode, body_text: &str) -> Error {
    let message = serde_json::from_str::<Value>(body_text)
        .ok()
        .and_then(|json| {
            json.get("message")
                .or_else(|| json.get("error_description"))
                .or_else(|| json.get("msg"))
                .or_else(|| json.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| status_error(status));

    let body = truncate_body(body_text);
    let detail = if !body.is_empty() && body != message {
        format!("{message}: {body}")
    } else {
        message
    };

    if status == StatusCode::UNAUTHORIZED {
        Error::Auth(detail)
    } else {
        Error::remote(Some(status.as_u16()), detail)
    }
}

/// A 401, or any rejection whose body reports an expired JWT.
fn is_token_rejection(status: StatusCode, body_text: &str) -> bool {
    status == StatusCode::UNAUTHORIZED || body_text.to_ascii_lowercase().contains("jwt expired")
}

fn sign_in_required(rejection: Error) -> Error {
    match rejection {
        Error::Auth(msg) => Error::Auth(msg),
        other => Error::Auth(other.to_string()),
    }
}

/// Pass 2xx responses through; turn everything else into an error.
async fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body_text = resp.text().await.unwrap_or_default();
    Err(error_from_body(status, &body_text))
}

// ---------------------------------------------------------------------------
// Connectivity test
// ---------------------------------------------------------------------------

/// Result of a connectivity test.
#[derive(Debug, Serialize)]
pub struct ConnectivityResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Probe the backend with a lightweight unauthenticated request.
pub async fn check_connectivity(config: &RemoteConfig) -> ConnectivityResult {
    let health_url = format!("{}{AUTH_PREFIX}/health", config.url);

    let client = match Client::builder().timeout(CONNECTIVITY_TIMEOUT).build() {
        Ok(c) => c,
        Err(e) => {
            return ConnectivityResult {
                success: false,
                latency_ms: None,
                error: Some(format!("Failed to create HTTP client: {e}")),
            };
        }
    };

    let start = Instant::now();
    let resp = match client
        .get(&health_url)
        .header("apikey", &config.anon_key)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            return ConnectivityResult {
                success: false,
                latency_ms: None,
                error: Some(Error::from(e).to_string()),
            };
        }
    };

    let latency = start.elapsed().as_millis() as u64;
    let status = resp.status();

    if status.is_success() {
        info!(latency_ms = latency, "connectivity test passed");
        ConnectivityResult {
            success: true,
            latency_ms: Some(latency),
            error: None,
        }
    } else {
        ConnectivityResult {
            success: false,
            latency_ms: Some(latency),
            error: Some(status_error(status)),
        }
    }
}

// ---------------------------------------------------------------------------
// REST gateway
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct UpsertRow<'a> {
    zone: &'a str,
    id: &'a str,
    data: &'a Record,
    updated_at: String,
}

/// reqwest-backed [`RemoteGateway`].
pub struct RestGateway {
    client: Client,
    config: RemoteConfig,
    ctx: Arc<SyncContext>,
    session_cache: Option<Arc<DbState>>,
}

impl RestGateway {
    pub fn new(config: RemoteConfig, ctx: Arc<SyncContext>) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| Error::remote(None, format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            ctx,
            session_cache: None,
        })
    }

    /// Persist refreshed sessions to the local `auth` cache.
    pub fn with_session_cache(mut self, db: Arc<DbState>) -> Self {
        self.session_cache = Some(db);
        self
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    pub(crate) fn collection_url(&self, collection: Collection) -> String {
        format!("{}{REST_PREFIX}/{}", self.config.url, collection.as_str())
    }

    pub(crate) fn select_zone_url(&self, collection: Collection, zone: &str) -> String {
        format!(
            "{}?zone=eq.{}&select=zone,id,updated_at,data&order=updated_at.desc",
            self.collection_url(collection),
            percent_encode(zone)
        )
    }

    pub(crate) fn upsert_url(&self, collection: Collection) -> String {
        format!("{}?on_conflict=zone,id", self.collection_url(collection))
    }

    pub(crate) fn delete_url(&self, collection: Collection, zone: &str, id: &str) -> String {
        format!(
            "{}?zone=eq.{}&id=eq.{}",
            self.collection_url(collection),
            percent_encode(zone),
            percent_encode(id)
        )
    }

    fn token_url(&self, grant_type: &str) -> String {
        format!("{}{AUTH_PREFIX}/token?grant_type={grant_type}", self.config.url)
    }

    fn require_zone(&self) -> Result<String> {
        self.ctx
            .active_zone()
            .ok_or_else(|| Error::Auth("no active zone; sign in first".into()))
    }

    /// Send a request built for the current access token. A token at or near
    /// expiry is refreshed before sending. On 401, refresh the session once
    /// and resend; a failed refresh surfaces the original rejection as a
    /// sign-in requirement.
    async fn send_authorized<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&str) -> RequestBuilder + Send + Sync,
    {
        let session = self
            .ctx
            .session()
            .ok_or_else(|| Error::Auth("no active session".into()))?;
        let mut token = session.access_token.clone();
        let mut refresh_failed = false;
        if session.is_expired(Utc::now()) {
            match self.refresh_session().await {
                Ok(fresh) => token = fresh.access_token.clone(),
                // The server may still accept the token.
                Err(e) => {
                    warn!(error = %e, "proactive session refresh failed");
                    refresh_failed = true;
                }
            }
        }

        let resp = build(&token)
            .header("apikey", &self.config.anon_key)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body_text = resp.text().await.unwrap_or_default();
        if !is_token_rejection(status, &body_text) {
            return Err(error_from_body(status, &body_text));
        }

        let original = error_from_body(status, &body_text);
        if refresh_failed {
            return Err(sign_in_required(original));
        }
        info!(status = status.as_u16(), "access token rejected, refreshing session once");

        let session = match self.refresh_session().await {
            Ok(session) => session,
            Err(refresh_err) => {
                warn!(error = %refresh_err, "session refresh failed");
                return Err(sign_in_required(original));
            }
        };

        let resp = build(&session.access_token)
            .header("apikey", &self.config.anon_key)
            .send()
            .await?;
        check_status(resp).await
    }

    async fn token_grant(&self, grant_type: &str, body: Value) -> Result<Session> {
        let resp = self
            .client
            .post(self.token_url(grant_type))
            .header("apikey", &self.config.anon_key)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(match error_from_body(status, &body_text) {
                Error::Remote { status, message } if matches!(status, Some(400..=499)) => {
                    Error::Auth(message)
                }
                other => other,
            });
        }
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("Invalid token response: {e}")))?;
        Ok(token.into_session(Utc::now()))
    }

    /// Password grant. Does not touch the context; see `auth::sign_in`.
    pub async fn password_grant(&self, email: &str, password: &str) -> Result<Session> {
        let body = serde_json::json!({ "email": email, "password": password });
        let result = self.token_grant("password", body).await;
        if let Err(e) = &result {
            warn!(email, error = %e, "password sign-in failed");
        }
        result
    }

    /// Refresh-token grant. Installs the new session in the context and the
    /// session cache.
    pub async fn refresh_session(&self) -> Result<Session> {
        let refresh_token = self
            .ctx
            .refresh_token()
            .ok_or_else(|| Error::Auth("no refresh token".into()))?;
        let session = self
            .token_grant(
                "refresh_token",
                serde_json::json!({ "refresh_token": refresh_token }),
            )
            .await?;
        self.ctx.set_session(Some(session.clone()));
        if let Some(db) = &self.session_cache {
            if let Err(e) = auth::save_session(db, &session) {
                warn!(error = %e, "failed to cache refreshed session");
            }
        }
        debug!(user_id = %session.user.id, "session refreshed");
        Ok(session)
    }

    /// Fetch the profile row of `user_id`.
    pub async fn fetch_profile(&self, user_id: &str) -> Result<Profile> {
        let url = format!(
            "{}{REST_PREFIX}/profiles?user_id=eq.{}&select=*",
            self.config.url,
            percent_encode(user_id)
        );
        let resp = self
            .send_authorized(|token| self.client.get(&url).bearer_auth(token))
            .await?;
        let mut rows: Vec<Profile> = resp
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("Invalid profile response: {e}")))?;
        if rows.is_empty() {
            return Err(Error::Auth(format!("no profile for user {user_id}")));
        }
        Ok(rows.swap_remove(0))
    }
}

impl RemoteGateway for RestGateway {
    fn is_ready(&self) -> bool {
        self.ctx.has_session() && self.ctx.active_zone().is_some()
    }

    fn active_zone(&self) -> Option<String> {
        self.ctx.active_zone()
    }

    async fn select_zone(&self, collection: Collection, zone: &str) -> Result<Vec<RemoteRow>> {
        let url = self.select_zone_url(collection, zone);
        let resp = self
            .send_authorized(|token| self.client.get(&url).bearer_auth(token))
            .await?;
        let rows: Vec<RemoteRow> = resp.json().await.map_err(|e| {
            Error::remote(None, format!("Invalid rows for {collection}: {e}"))
        })?;
        // Server-side policies already scope rows; never trust that blindly.
        let rows: Vec<RemoteRow> = rows.into_iter().filter(|r| r.zone == zone).collect();
        debug!(collection = %collection, zone, rows = rows.len(), "zone select");
        Ok(rows)
    }

    async fn upsert(&self, collection: Collection, record: &Record) -> Result<()> {
        let id = record_id(record)?.to_string();
        let zone = self.require_zone()?;
        let url = self.upsert_url(collection);
        let body = vec![UpsertRow {
            zone: &zone,
            id: &id,
            data: record,
            updated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }];
        self.send_authorized(|token| {
            self.client
                .post(&url)
                .bearer_auth(token)
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(&body)
        })
        .await?;
        debug!(collection = %collection, id = %id, zone = %zone, "remote upsert");
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<()> {
        let zone = self.require_zone()?;
        let url = self.delete_url(collection, &zone, id);
        self.send_authorized(|token| self.client.delete(&url).bearer_auth(token))
            .await?;
        debug!(collection = %collection, id, zone = %zone, "remote delete");
        Ok(())
    }
}
