//! Test doubles shared by the unit tests.

pub(crate) mod http;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{Duration, TimeZone, Utc};
use serde_json::Value;

use crate::api::{RemoteGateway, RemoteRow};
use crate::auth::{Profile, Role, Session, SessionUser};
use crate::context::SyncContext;
use crate::error::{Error, Result};
use crate::store::{into_record, record_id, Collection, Record};

/// A signed-in context for `zone`.
pub(crate) fn signed_in_context(zone: &str, admin: bool) -> Arc<SyncContext> {
    let ctx = Arc::new(SyncContext::new());
    ctx.set_session(Some(Session {
        access_token: "test-access".into(),
        refresh_token: "test-refresh".into(),
        expires_at: None,
        user: SessionUser {
            id: "rep-1".into(),
            email: Some("rep@example.com".into()),
        },
    }));
    let mut roles = vec![Role::Delegado];
    if admin {
        roles.push(Role::Admin);
    }
    ctx.set_profile(Some(Profile {
        user_id: "rep-1".into(),
        email: Some("rep@example.com".into()),
        display_name: Some("Rep".into()),
        zone: zone.into(),
        roles: roles.into_iter().collect(),
        updated_at: None,
    }));
    ctx
}

pub(crate) fn rec(value: Value) -> Record {
    into_record(value).unwrap()
}

type RowKey = (Collection, String, String);

/// In-memory backend keyed by `(collection, zone, id)`, scoped by the
/// context's active zone like the real gateway.
pub(crate) struct FakeGateway {
    ctx: Arc<SyncContext>,
    rows: Mutex<BTreeMap<RowKey, RemoteRow>>,
    offline: AtomicBool,
    failing_ids: Mutex<HashSet<String>>,
    failing_selects: Mutex<HashSet<Collection>>,
    clock: AtomicU64,
    calls: Mutex<Vec<String>>,
}

impl FakeGateway {
    pub(crate) fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            ctx,
            rows: Mutex::new(BTreeMap::new()),
            offline: AtomicBool::new(false),
            failing_ids: Mutex::new(HashSet::new()),
            failing_selects: Mutex::new(HashSet::new()),
            clock: AtomicU64::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    /// Every call fails with a network error while offline.
    pub(crate) fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Upserts and deletes of `id` fail with HTTP 500.
    pub(crate) fn fail_id(&self, id: &str) {
        self.failing_ids.lock().unwrap().insert(id.to_string());
    }

    pub(crate) fn heal_id(&self, id: &str) {
        self.failing_ids.lock().unwrap().remove(id);
    }

    pub(crate) fn fail_select(&self, collection: Collection) {
        self.failing_selects.lock().unwrap().insert(collection);
    }

    /// Place a row directly in the backend, bypassing zone scoping.
    pub(crate) fn seed(&self, collection: Collection, zone: &str, record: Record) {
        let id = record_id(&record).unwrap().to_string();
        let updated_at = self.tick();
        self.rows.lock().unwrap().insert(
            (collection, zone.to_string(), id.clone()),
            RemoteRow {
                zone: zone.to_string(),
                id,
                data: Value::Object(record),
                updated_at: Some(updated_at),
            },
        );
    }

    pub(crate) fn row(&self, collection: Collection, zone: &str, id: &str) -> Option<RemoteRow> {
        self.rows
            .lock()
            .unwrap()
            .get(&(collection, zone.to_string(), id.to_string()))
            .cloned()
    }

    pub(crate) fn ids(&self, collection: Collection, zone: &str) -> Vec<String> {
        self.rows
            .lock()
            .unwrap()
            .keys()
            .filter(|(c, z, _)| *c == collection && z == zone)
            .map(|(_, _, id)| id.clone())
            .collect()
    }

    /// Log of calls in the form `"upsert farmacias/f1"`.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn tick(&self) -> String {
        let n = self.clock.fetch_add(1, Ordering::SeqCst) as i64;
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (base + Duration::seconds(n)).to_rfc3339()
    }

    fn record_call(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::remote(None, "cannot reach remote backend"));
        }
        Ok(())
    }

    fn check_id(&self, id: &str) -> Result<()> {
        if self.failing_ids.lock().unwrap().contains(id) {
            return Err(Error::remote(Some(500), format!("injected failure for {id}")));
        }
        Ok(())
    }

    fn zone(&self) -> Result<String> {
        self.ctx
            .active_zone()
            .ok_or_else(|| Error::Auth("no active zone".into()))
    }
}

impl RemoteGateway for FakeGateway {
    fn is_ready(&self) -> bool {
        self.ctx.has_session() && self.ctx.active_zone().is_some()
    }

    fn active_zone(&self) -> Option<String> {
        self.ctx.active_zone()
    }

    async fn select_zone(&self, collection: Collection, zone: &str) -> Result<Vec<RemoteRow>> {
        self.record_call(format!("select {collection}"));
        self.check_online()?;
        if self.failing_selects.lock().unwrap().contains(&collection) {
            return Err(Error::remote(Some(503), "injected select failure"));
        }
        let mut rows: Vec<RemoteRow> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|((c, z, _), _)| *c == collection && z == zone)
            .map(|(_, row)| row.clone())
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(rows)
    }

    async fn upsert(&self, collection: Collection, record: &Record) -> Result<()> {
        let id = record_id(record)?.to_string();
        self.record_call(format!("upsert {collection}/{id}"));
        self.check_online()?;
        self.check_id(&id)?;
        let zone = self.zone()?;
        let updated_at = self.tick();
        self.rows.lock().unwrap().insert(
            (collection, zone.clone(), id.clone()),
            RemoteRow {
                zone,
                id,
                data: Value::Object(record.clone()),
                updated_at: Some(updated_at),
            },
        );
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<()> {
        self.record_call(format!("delete {collection}/{id}"));
        self.check_online()?;
        self.check_id(id)?;
        let zone = self.zone()?;
        self.rows
            .lock()
            .unwrap()
            .remove(&(collection, zone, id.to_string()));
        Ok(())
    }
}
