//! Settings Store: one record per key in the local-only `settings` collection.
//!
//! Each record is `{ "id": <key>, "value": <json> }`. Remote credentials and
//! analytics parameters are typed views over two well-known keys.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::api;
use crate::db::DbState;
use crate::error::{Error, Result};
use crate::store::{self, into_record, Collection};

const KEY_REMOTE: &str = "remote";
const KEY_ANALYTICS: &str = "analytics";

const DEFAULT_DESIRED_PCT: f64 = 10.0;
const DEFAULT_DAYS_SOON: i64 = 7;

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Read a raw setting value.
pub fn get_value(db: &DbState, key: &str) -> Result<Option<Value>> {
    Ok(store::get(db, Collection::Settings, key)?
        .and_then(|mut record| record.remove("value")))
}

/// Store a raw setting value, replacing any previous one.
pub fn set_value(db: &DbState, key: &str, value: Value) -> Result<()> {
    let record = into_record(json!({ "id": key, "value": value }))?;
    store::put_local(db, Collection::Settings, &record)
}

pub fn delete_value(db: &DbState, key: &str) -> Result<()> {
    store::delete_local(db, Collection::Settings, key)
}

/// Read and deserialize a setting. A value that no longer matches the
/// expected shape is logged and treated as absent.
pub fn get<T: DeserializeOwned>(db: &DbState, key: &str) -> Result<Option<T>> {
    match get_value(db, key)? {
        Some(value) => match serde_json::from_value(value) {
            Ok(parsed) => Ok(Some(parsed)),
            Err(e) => {
                warn!(key, error = %e, "settings: stored value has unexpected shape");
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

pub fn set<T: Serialize>(db: &DbState, key: &str, value: &T) -> Result<()> {
    set_value(db, key, serde_json::to_value(value)?)
}

// ---------------------------------------------------------------------------
// Remote credentials
// ---------------------------------------------------------------------------

/// Connection details for the shared backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    pub url: String,
    pub anon_key: String,
}

impl RemoteConfig {
    /// Build from a URL and key as typed by the user. The key may instead be
    /// a connection string carrying both values.
    pub fn new(url: &str, key: &str) -> Result<Self> {
        let mut url = url.trim().to_string();
        let mut anon_key = key.trim().to_string();
        if let Some(decoded_key) = api::extract_key_from_connection_string(key) {
            anon_key = decoded_key;
            if let Some(decoded_url) = api::extract_url_from_connection_string(key) {
                url = decoded_url;
            }
        }

        let url = api::normalize_remote_url(&url);
        if url.is_empty() {
            return Err(Error::Validation("Missing required field: url".into()));
        }
        if anon_key.is_empty() {
            return Err(Error::Validation("Missing required field: anonKey".into()));
        }
        Ok(Self { url, anon_key })
    }

    /// Build from a pasted connection string alone.
    pub fn from_connection_string(raw: &str) -> Result<Self> {
        let url = api::extract_url_from_connection_string(raw)
            .ok_or_else(|| Error::Validation("connection string has no url".into()))?;
        Self::new(&url, raw)
    }
}

pub fn remote_config(db: &DbState) -> Result<Option<RemoteConfig>> {
    get(db, KEY_REMOTE)
}

pub fn set_remote_config(db: &DbState, config: &RemoteConfig) -> Result<()> {
    set(db, KEY_REMOTE, config)?;
    info!(url = %config.url, "remote credentials updated");
    Ok(())
}

pub fn clear_remote_config(db: &DbState) -> Result<()> {
    info!("clearing remote credentials");
    delete_value(db, KEY_REMOTE)
}

// ---------------------------------------------------------------------------
// Analytics parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalyticsSettings {
    /// Sales target per quarter key (e.g. `"2T24"`).
    pub quarter_targets: BTreeMap<String, f64>,
    /// Stretch goal above target, in percent.
    pub desired_pct: f64,
    /// Window for "upcoming" cadence predictions, in days.
    pub days_soon: i64,
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self {
            quarter_targets: BTreeMap::new(),
            desired_pct: DEFAULT_DESIRED_PCT,
            days_soon: DEFAULT_DAYS_SOON,
        }
    }
}

impl AnalyticsSettings {
    pub fn target_for(&self, quarter_key: &str) -> f64 {
        self.quarter_targets
            .get(quarter_key)
            .copied()
            .filter(|t| t.is_finite() && *t > 0.0)
            .unwrap_or(0.0)
    }
}

pub fn analytics_settings(db: &DbState) -> Result<AnalyticsSettings> {
    Ok(get(db, KEY_ANALYTICS)?.unwrap_or_default())
}

pub fn set_analytics_settings(db: &DbState, settings: &AnalyticsSettings) -> Result<()> {
    set(db, KEY_ANALYTICS, settings)
}

/// Set the target for one quarter, keeping the other parameters.
pub fn set_quarter_target(db: &DbState, quarter_key: &str, target: f64) -> Result<()> {
    if !target.is_finite() || target < 0.0 {
        return Err(Error::Validation(format!(
            "quarter target must be a non-negative number, got {target}"
        )));
    }
    let mut settings = analytics_settings(db)?;
    settings
        .quarter_targets
        .insert(quarter_key.trim().to_string(), target);
    set_analytics_settings(db, &settings)
}
