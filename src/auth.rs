//! Remote identity: session tokens, profile, and the cached session.
//!
//! The session is obtained with a password grant, refreshed with a
//! refresh-token grant, and cached in the local `auth` table so a restart
//! can resume syncing without signing in again. Tokens are wiped from
//! memory when a session is dropped.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};
use zeroize::Zeroize;

use crate::api::RestGateway;
use crate::context::SyncContext;
use crate::db::DbState;
use crate::error::{Error, Result};

const SESSION_ROW_ID: &str = "session";
const PROFILE_ROW_ID: &str = "profile";

/// Refresh a little before the server-side expiry.
const EXPIRY_SKEW_SECS: i64 = 30;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Bearer credentials for the remote backend.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub user: SessionUser,
}

impl Session {
    /// Whether the access token is known to be past (or about to pass) its
    /// expiry. Sessions without an expiry are assumed valid until rejected.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .map(|at| now + Duration::seconds(EXPIRY_SKEW_SECS) >= at)
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("user", &self.user)
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.access_token.zeroize();
        self.refresh_token.zeroize();
    }
}

/// Token endpoint response for both the password and refresh grants.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub user: SessionUser,
}

impl TokenResponse {
    pub(crate) fn into_session(self, now: DateTime<Utc>) -> Session {
        let expires_at = self
            .expires_at
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .or_else(|| self.expires_in.map(|secs| now + Duration::seconds(secs)));
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user: self.user,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Delegado,
}

/// The signed-in rep's profile row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    pub zone: String,
    #[serde(default, deserialize_with = "deserialize_roles")]
    pub roles: BTreeSet<Role>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl Profile {
    pub fn is_admin(&self) -> bool {
        self.roles.contains(&Role::Admin)
    }
}

/// Roles arrive as an array, a comma separated string, or a single role.
/// Unknown role names are ignored.
fn deserialize_roles<'de, D>(deserializer: D) -> std::result::Result<BTreeSet<Role>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = serde_json::Value::deserialize(deserializer)?;
    let names: Vec<String> = match raw {
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        serde_json::Value::String(s) => s.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    };
    Ok(names
        .iter()
        .filter_map(|name| match name.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "delegado" => Some(Role::Delegado),
            _ => None,
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Session cache
// ---------------------------------------------------------------------------

fn save_row<T: Serialize>(db: &DbState, row_id: &str, value: &T) -> Result<()> {
    let data = serde_json::to_string(value)?;
    let conn = db.conn.lock()?;
    conn.execute(
        "INSERT INTO auth (id, data, updated_at)
         VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
         ON CONFLICT(id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
        params![row_id, data],
    )?;
    Ok(())
}

fn load_row<T: for<'de> Deserialize<'de>>(db: &DbState, row_id: &str) -> Result<Option<T>> {
    let conn = db.conn.lock()?;
    let raw: Option<String> = conn
        .query_row(
            "SELECT data FROM auth WHERE id = ?1",
            params![row_id],
            |row| row.get(0),
        )
        .optional()?;
    drop(conn);
    match raw {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(row_id, error = %e, "auth cache: discarding unreadable row");
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

pub fn save_session(db: &DbState, session: &Session) -> Result<()> {
    save_row(db, SESSION_ROW_ID, session)
}

pub fn load_session(db: &DbState) -> Result<Option<Session>> {
    load_row(db, SESSION_ROW_ID)
}

pub fn save_profile(db: &DbState, profile: &Profile) -> Result<()> {
    save_row(db, PROFILE_ROW_ID, profile)
}

pub fn load_profile(db: &DbState) -> Result<Option<Profile>> {
    load_row(db, PROFILE_ROW_ID)
}

pub fn clear_cache(db: &DbState) -> Result<()> {
    let conn = db.conn.lock()?;
    conn.execute("DELETE FROM auth", [])?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Flows
// ---------------------------------------------------------------------------

/// Explicit sign-in: password grant, profile fetch, cache, and context
/// update. Failures here block the caller until resolved.
pub async fn sign_in(
    gateway: &RestGateway,
    db: &DbState,
    email: &str,
    password: &str,
) -> Result<Profile> {
    let ctx = gateway.context();
    let email = email.trim();
    if email.is_empty() || password.is_empty() {
        return Err(Error::Validation("email and password are required".into()));
    }

    let session = gateway.password_grant(email, password).await?;
    ctx.set_session(Some(session.clone()));
    let profile = match gateway.fetch_profile(&session.user.id).await {
        Ok(profile) => profile,
        Err(e) => {
            ctx.set_session(None);
            return Err(e);
        }
    };

    save_session(db, &session)?;
    save_profile(db, &profile)?;
    ctx.set_profile(Some(profile.clone()));

    info!(
        user_id = %profile.user_id,
        zone = %profile.zone,
        admin = profile.is_admin(),
        "signed in"
    );
    Ok(profile)
}

/// Resume a cached session at startup. Returns the profile when both a
/// session and a profile were cached.
pub fn restore(db: &DbState, ctx: &SyncContext) -> Result<Option<Profile>> {
    let session = load_session(db)?;
    let profile = load_profile(db)?;
    match (session, profile) {
        (Some(session), Some(profile)) => {
            info!(user_id = %profile.user_id, zone = %profile.zone, "restored cached session");
            ctx.set_session(Some(session));
            ctx.set_profile(Some(profile.clone()));
            Ok(Some(profile))
        }
        _ => Ok(None),
    }
}

/// Forget the session locally. Pending outbox entries are kept.
pub fn sign_out(db: &DbState, ctx: &SyncContext) -> Result<()> {
    ctx.clear();
    clear_cache(db)?;
    info!("signed out");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::settings::RemoteConfig;
    use crate::testing::http::{MockResponse, MockServer};
    use serde_json::json;
    use std::sync::Arc;

    fn session(token: &str) -> Session {
        Session {
            access_token: token.into(),
            refresh_token: format!("{token}-refresh"),
            expires_at: None,
            user: SessionUser {
                id: "u1".into(),
                email: Some("rep@example.com".into()),
            },
        }
    }

    #[test]
    fn test_token_response_expiry() {
        let now = Utc::now();
        let resp: TokenResponse = serde_json::from_value(json!({
            "access_token": "a",
            "refresh_token": "r",
            "expires_in": 3600,
            "token_type": "bearer",
            "user": { "id": "u1", "email": "rep@example.com" }
        }))
        .unwrap();
        let session = resp.into_session(now);
        assert_eq!(session.expires_at, Some(now + Duration::seconds(3600)));
        assert!(!session.is_expired(now));
        assert!(session.is_expired(now + Duration::seconds(3590)));
    }

    #[test]
    fn test_profile_roles_parsing() {
        let p: Profile = serde_json::from_value(json!({
            "user_id": "u1",
            "zone": "north",
            "roles": ["Admin", "delegado", "auditor"]
        }))
        .unwrap();
        assert!(p.is_admin());
        assert_eq!(p.roles.len(), 2);

        let p: Profile = serde_json::from_value(json!({
            "user_id": "u2",
            "zone": "south",
            "roles": "delegado"
        }))
        .unwrap();
        assert!(!p.is_admin());

        let p: Profile =
            serde_json::from_value(json!({ "user_id": "u3", "zone": "east" })).unwrap();
        assert!(p.roles.is_empty());
    }

    #[test]
    fn test_session_debug_is_redacted() {
        let rendered = format!("{:?}", session("secret-token"));
        assert!(!rendered.contains("secret-token"));
    }

    #[test]
    fn test_cache_restore_and_sign_out() {
        let db = db::open_in_memory().unwrap();
        let ctx = SyncContext::new();
        assert_eq!(restore(&db, &ctx).unwrap(), None);

        let profile: Profile = serde_json::from_value(json!({
            "user_id": "u1",
            "zone": "north",
            "roles": ["delegado"]
        }))
        .unwrap();
        save_session(&db, &session("tok")).unwrap();
        save_profile(&db, &profile).unwrap();

        assert_eq!(restore(&db, &ctx).unwrap(), Some(profile));
        assert!(ctx.has_session());
        assert_eq!(ctx.active_zone().as_deref(), Some("north"));

        sign_out(&db, &ctx).unwrap();
        assert!(!ctx.has_session());
        assert_eq!(load_session(&db).unwrap(), None);
    }

    fn gateway(base_url: String) -> RestGateway {
        let config = RemoteConfig {
            url: base_url,
            anon_key: "anon".into(),
        };
        RestGateway::new(config, Arc::new(SyncContext::new())).unwrap()
    }

    fn token_body() -> serde_json::Value {
        json!({
            "access_token": "a1",
            "refresh_token": "r1",
            "expires_in": 3600,
            "user": { "id": "u1", "email": "rep@example.com" }
        })
    }

    #[tokio::test]
    async fn test_sign_in_fetches_profile_and_caches() {
        let server = MockServer::start(vec![
            MockResponse::json(200, token_body()),
            MockResponse::json(200, json!([{ "user_id": "u1", "zone": "north", "roles": "delegado" }])),
        ])
        .await;
        let db = db::open_in_memory().unwrap();
        let gw = gateway(server.base_url());

        let profile = sign_in(&gw, &db, " rep@example.com ", "pw").await.unwrap();
        assert_eq!(profile.zone, "north");
        assert_eq!(gw.context().active_zone().as_deref(), Some("north"));
        assert_eq!(load_session(&db).unwrap().unwrap().access_token, "a1");
        assert_eq!(load_profile(&db).unwrap(), Some(profile));

        let requests = server.requests().await;
        assert!(requests[0].head.starts_with("POST /auth/v1/token?grant_type=password"));
        let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
        assert_eq!(body["email"], json!("rep@example.com"));
        assert!(requests[1]
            .head
            .starts_with("GET /rest/v1/profiles?user_id=eq.u1&select=*"));
        assert_eq!(requests[1].header("authorization").as_deref(), Some("Bearer a1"));
    }

    #[tokio::test]
    async fn test_sign_in_without_profile_leaves_no_session() {
        let server = MockServer::start(vec![
            MockResponse::json(200, token_body()),
            MockResponse::json(200, json!([])),
        ])
        .await;
        let db = db::open_in_memory().unwrap();
        let gw = gateway(server.base_url());

        let err = sign_in(&gw, &db, "rep@example.com", "pw").await.unwrap_err();
        assert!(err.is_sign_in_required());
        assert!(!gw.context().has_session());
        assert_eq!(load_session(&db).unwrap(), None);
    }

    #[tokio::test]
    async fn test_bad_credentials_are_auth_errors() {
        let server = MockServer::start(vec![MockResponse::status(
            400,
            r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#,
        )])
        .await;
        let db = db::open_in_memory().unwrap();
        let gw = gateway(server.base_url());

        let err = sign_in(&gw, &db, "rep@example.com", "wrong").await.unwrap_err();
        assert!(err.is_sign_in_required());
        assert!(err.to_string().contains("invalid_grant") || err.to_string().contains("Invalid"));
    }
}
