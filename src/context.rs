//! Process-wide sync state: current session, profile, and active zone.
//!
//! Every remote call reads the active zone from here. Changing it hands
//! back a [`ZoneChange`] token that `SyncEngine::full_resync` consumes, so
//! a zone switch without the follow-up resync is visible at the call site.

use std::sync::Mutex;
use tracing::info;

use crate::auth::{Profile, Session};
use crate::error::{Error, Result};

#[derive(Default)]
struct Inner {
    session: Option<Session>,
    profile: Option<Profile>,
    zone_override: Option<String>,
}

#[derive(Default)]
pub struct SyncContext {
    inner: Mutex<Inner>,
}

/// Proof that the active zone changed and local data must be resynced.
#[must_use = "a zone change must be followed by `full_resync(Some(token))`"]
#[derive(Debug, PartialEq, Eq)]
pub struct ZoneChange {
    pub(crate) zone: String,
}

impl ZoneChange {
    pub fn zone(&self) -> &str {
        &self.zone
    }
}

impl SyncContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned guard still holds consistent plain data.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn session(&self) -> Option<Session> {
        self.lock().session.clone()
    }

    pub fn has_session(&self) -> bool {
        self.lock().session.is_some()
    }

    pub fn access_token(&self) -> Option<String> {
        self.lock().session.as_ref().map(|s| s.access_token.clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.lock().session.as_ref().map(|s| s.refresh_token.clone())
    }

    pub fn set_session(&self, session: Option<Session>) {
        self.lock().session = session;
    }

    pub fn profile(&self) -> Option<Profile> {
        self.lock().profile.clone()
    }

    /// Replace the profile. A new profile resets any admin zone override.
    pub fn set_profile(&self, profile: Option<Profile>) {
        let mut inner = self.lock();
        inner.profile = profile;
        inner.zone_override = None;
    }

    /// The zone every remote call is scoped to: the admin override when set,
    /// otherwise the profile's home zone.
    pub fn active_zone(&self) -> Option<String> {
        let inner = self.lock();
        inner
            .zone_override
            .clone()
            .or_else(|| inner.profile.as_ref().map(|p| p.zone.clone()))
    }

    /// Switch the active zone. Admins only.
    pub fn set_active_zone(&self, zone: &str) -> Result<ZoneChange> {
        let zone = zone.trim();
        if zone.is_empty() {
            return Err(Error::Validation("zone must not be empty".into()));
        }
        let mut inner = self.lock();
        let profile = inner
            .profile
            .as_ref()
            .ok_or_else(|| Error::Auth("sign in before switching zones".into()))?;
        if !profile.is_admin() {
            return Err(Error::Auth(format!(
                "user {} may not leave home zone {}",
                profile.user_id, profile.zone
            )));
        }
        let home_zone = profile.zone.clone();
        inner.zone_override = if zone == home_zone {
            None
        } else {
            Some(zone.to_string())
        };
        info!(zone, "active zone changed");
        Ok(ZoneChange {
            zone: zone.to_string(),
        })
    }

    /// Forget session, profile and any zone override.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.session = None;
        inner.profile = None;
        inner.zone_override = None;
    }
}
