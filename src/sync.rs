//! Sync Engine: replays the outbox and pulls zone state back.
//!
//! Pushes always happen before pulls, so local edits reach the backend before
//! remote state overwrites the local copy. Drains, pulls and resyncs share one
//! flight lock; a full resync never overlaps another run.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::RemoteGateway;
use crate::context::ZoneChange;
use crate::db::{self, DbState};
use crate::error::{Error, Result};
use crate::outbox::{self, OutboxEntry, OutboxOp};
use crate::store::{self, Collection};

/// Batch size for a full resync drain.
pub const FULL_DRAIN_LIMIT: usize = 10_000;
/// Batch size for the opportunistic drain on foreground and in the loop.
pub const FOREGROUND_DRAIN_LIMIT: usize = 20;

const META_LAST_SYNC: &str = "last_sync_at";
const EVENT_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Notifications for observers (UI refresh, status badges).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    Started,
    /// The local store now reflects remote state.
    DataChanged { pulled: usize },
    Finished { applied: usize, pulled: usize },
    Failed { message: String },
}

/// How a pulled row is reconciled with the local copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resolution {
    /// Overwrite the local record with the remote one, pending edits included.
    #[default]
    RemoteWins,
    /// Like `RemoteWins`, but keys with queued outbox entries keep their
    /// local copy until the entry is replayed.
    KeepPending,
}

/// Lifecycle of one outbox entry during a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryState {
    Pending,
    Applying,
    /// Confirmed remotely and removed from the outbox.
    Applied,
    /// Removed without applying (local-only or unknown collection).
    Discarded,
    /// Left in the outbox; the batch stopped here.
    Failed,
}

#[derive(Debug)]
pub struct FailedEntry {
    pub entry: OutboxEntry,
    pub error: Error,
}

#[derive(Debug, Default)]
pub struct DrainReport {
    pub applied: usize,
    pub discarded: usize,
    /// The entry that halted the batch, still pending.
    pub failed: Option<FailedEntry>,
}

impl DrainReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_none()
    }
}

#[derive(Debug)]
pub enum ResyncOutcome {
    /// Sync is disabled or no session is active.
    Skipped,
    /// Another resync holds the flight lock.
    AlreadyRunning,
    Completed { drain: DrainReport, pulled: usize },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub enabled: bool,
    pub running: bool,
    pub pending: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub zone: Option<String>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine<G> {
    db: Arc<DbState>,
    gateway: Option<Arc<G>>,
    flight: Mutex<()>,
    events: broadcast::Sender<SyncEvent>,
}

impl<G: RemoteGateway + 'static> SyncEngine<G> {
    /// `gateway` is `None` when no backend is configured.
    pub fn new(db: Arc<DbState>, gateway: Option<Arc<G>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            db,
            gateway,
            flight: Mutex::new(()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn remote(&self) -> Option<&G> {
        self.gateway.as_deref().filter(|g| g.is_ready())
    }

    fn require_remote(&self) -> Result<&G> {
        self.remote()
            .ok_or_else(|| Error::Auth("remote sync is not enabled".into()))
    }

    pub fn sync_enabled(&self) -> bool {
        self.remote().is_some()
    }

    // -- push ---------------------------------------------------------------

    /// Replay up to `limit` outbox entries in order, stopping at the first
    /// failure.
    pub async fn drain_outbox(&self, limit: usize) -> Result<DrainReport> {
        let gateway = self.require_remote()?;
        let _flight = self.flight.lock().await;
        self.drain_locked(gateway, limit).await
    }

    async fn drain_locked(&self, gateway: &G, limit: usize) -> Result<DrainReport> {
        let entries = outbox::list_limited(&self.db, limit)?;
        let mut report = DrainReport::default();
        if entries.is_empty() {
            return Ok(report);
        }
        debug!(batch = entries.len(), "draining outbox");

        for entry in entries {
            match self.apply_entry(gateway, &entry).await {
                Ok(EntryState::Applied) => report.applied += 1,
                Ok(EntryState::Discarded) => report.discarded += 1,
                Ok(state) => debug!(entry_id = %entry.id, ?state, "unexpected entry state"),
                Err(error) if error.is_recoverable() || error.is_sign_in_required() => {
                    warn!(
                        entry_id = %entry.id,
                        collection = %entry.store,
                        id = %entry.key,
                        op = %entry.op,
                        error = %error,
                        "outbox entry failed, stopping batch"
                    );
                    report.failed = Some(FailedEntry { entry, error });
                    break;
                }
                Err(error) => return Err(error),
            }
        }

        info!(
            applied = report.applied,
            discarded = report.discarded,
            halted = report.failed.is_some(),
            "outbox drain finished"
        );
        Ok(report)
    }

    /// Move one entry from `Pending` to a terminal state. `Err` means the
    /// entry is `Failed` and still queued.
    async fn apply_entry(&self, gateway: &G, entry: &OutboxEntry) -> Result<EntryState> {
        let collection = entry.collection().filter(|c| c.is_sync_eligible());
        let applicable = match (collection, entry.op, &entry.data) {
            (Some(c), OutboxOp::Put, Some(_)) | (Some(c), OutboxOp::Delete, _) => Some(c),
            _ => None,
        };
        let Some(collection) = applicable else {
            outbox::remove(&self.db, &entry.id)?;
            warn!(
                entry_id = %entry.id,
                collection = %entry.store,
                id = %entry.key,
                op = %entry.op,
                "discarding outbox entry that cannot be applied remotely"
            );
            return Ok(EntryState::Discarded);
        };

        let state = transition(entry, EntryState::Pending, EntryState::Applying);
        let result = match (entry.op, &entry.data) {
            (OutboxOp::Put, Some(record)) => gateway.upsert(collection, record).await,
            _ => gateway.delete(collection, &entry.key).await,
        };
        if let Err(e) = result {
            transition(entry, state, EntryState::Failed);
            return Err(e);
        }

        outbox::remove(&self.db, &entry.id)?;
        Ok(transition(entry, state, EntryState::Applied))
    }

    /// Apply a single (typically previously failed) entry out of band.
    pub async fn retry_entry(&self, entry_id: &str) -> Result<EntryState> {
        let gateway = self.require_remote()?;
        let _flight = self.flight.lock().await;
        let entry = outbox::get(&self.db, entry_id)?
            .ok_or_else(|| Error::Validation(format!("no pending outbox entry {entry_id}")))?;
        self.apply_entry(gateway, &entry).await
    }

    /// Drop an entry without applying it. Returns whether it existed.
    pub async fn discard_entry(&self, entry_id: &str) -> Result<bool> {
        let _flight = self.flight.lock().await;
        let removed = outbox::remove(&self.db, entry_id)?;
        if removed {
            warn!(entry_id, "outbox entry discarded by caller");
        }
        Ok(removed)
    }

    // -- pull ---------------------------------------------------------------

    /// Fetch every sync-eligible collection of the active zone and reconcile
    /// it into the local store. Returns the number of rows applied.
    pub async fn pull_zone(&self, resolution: Resolution) -> Result<usize> {
        let gateway = self.require_remote()?;
        let _flight = self.flight.lock().await;
        self.pull_locked(gateway, resolution).await
    }

    async fn pull_locked(&self, gateway: &G, resolution: Resolution) -> Result<usize> {
        let zone = gateway
            .active_zone()
            .ok_or_else(|| Error::Auth("no active zone".into()))?;

        let pending: HashSet<(String, String)> = match resolution {
            Resolution::RemoteWins => HashSet::new(),
            Resolution::KeepPending => outbox::list(&self.db)?
                .into_iter()
                .map(|e| (e.store, e.key))
                .collect(),
        };

        let mut applied = 0;
        for collection in Collection::sync_eligible() {
            let rows = match gateway.select_zone(collection, &zone).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(collection = %collection, zone = %zone, error = %e, "pull failed for collection");
                    continue;
                }
            };

            let mut count = 0;
            for row in &rows {
                let Some(record) = row.record() else {
                    debug!(collection = %collection, id = %row.id, "skipping remote row without record");
                    continue;
                };
                if row.zone != zone {
                    continue;
                }
                let id = store::record_id(record)?;
                if pending.contains(&(collection.as_str().to_string(), id.to_string())) {
                    debug!(collection = %collection, id, "keeping local copy with pending changes");
                    continue;
                }
                store::put_local(&self.db, collection, record)?;
                count += 1;
            }
            debug!(collection = %collection, zone = %zone, rows = count, "pulled collection");
            applied += count;
        }

        info!(zone = %zone, rows = applied, "zone pull finished");
        Ok(applied)
    }

    // -- orchestration ------------------------------------------------------

    /// Drain everything, then pull the active zone. Pass the token returned
    /// by `SyncContext::set_active_zone` after a zone switch: local copies of
    /// the previous zone are dropped before pulling when nothing is pending.
    pub async fn full_resync(&self, zone_change: Option<ZoneChange>) -> Result<ResyncOutcome> {
        let Some(gateway) = self.remote() else {
            debug!("full resync skipped: sync disabled");
            return Ok(ResyncOutcome::Skipped);
        };
        let Ok(_flight) = self.flight.try_lock() else {
            debug!("full resync already running");
            return Ok(ResyncOutcome::AlreadyRunning);
        };

        info!(zone = ?gateway.active_zone(), "full resync started");
        self.emit(SyncEvent::Started);

        match self.resync_locked(gateway, zone_change).await {
            Ok((drain, pulled)) => {
                let now = Utc::now().to_rfc3339();
                if let Err(e) = self.with_conn(|conn| db::set_meta(conn, META_LAST_SYNC, &now)) {
                    warn!(error = %e, "failed to record last sync time");
                }
                self.emit(SyncEvent::DataChanged { pulled });
                self.emit(SyncEvent::Finished {
                    applied: drain.applied,
                    pulled,
                });
                info!(applied = drain.applied, pulled, "full resync finished");
                Ok(ResyncOutcome::Completed { drain, pulled })
            }
            Err(e) => {
                warn!(error = %e, "full resync failed");
                self.emit(SyncEvent::Failed {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn resync_locked(
        &self,
        gateway: &G,
        zone_change: Option<ZoneChange>,
    ) -> Result<(DrainReport, usize)> {
        let drain = self.drain_locked(gateway, FULL_DRAIN_LIMIT).await?;

        if let Some(change) = zone_change {
            if outbox::is_empty(&self.db)? {
                let mut cleared = 0;
                for collection in Collection::sync_eligible() {
                    cleared += store::clear(&self.db, collection)?;
                }
                info!(zone = change.zone(), cleared, "local zone data cleared");
            } else {
                warn!(
                    zone = change.zone(),
                    "pending changes remain; keeping local data across zone switch"
                );
            }
        }

        let pulled = self.pull_locked(gateway, Resolution::RemoteWins).await?;
        Ok((drain, pulled))
    }

    /// Opportunistic drain when the app returns to the foreground. No pull.
    /// Returns `None` when sync is disabled or another run is in flight.
    pub async fn on_foreground(&self) -> Result<Option<DrainReport>> {
        let Some(gateway) = self.remote() else {
            return Ok(None);
        };
        let Ok(_flight) = self.flight.try_lock() else {
            return Ok(None);
        };
        let report = self.drain_locked(gateway, FOREGROUND_DRAIN_LIMIT).await?;
        if report.applied > 0 {
            self.emit(SyncEvent::Finished {
                applied: report.applied,
                pulled: 0,
            });
        }
        Ok(Some(report))
    }

    /// Called after a successful sign-in.
    pub async fn on_sign_in(&self) -> Result<ResyncOutcome> {
        self.full_resync(None).await
    }

    pub fn status(&self) -> Result<SyncStatus> {
        let last_sync = self
            .with_conn(|conn| db::get_meta(conn, META_LAST_SYNC))?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|dt| dt.with_timezone(&Utc));
        Ok(SyncStatus {
            enabled: self.sync_enabled(),
            running: self.flight.try_lock().is_err(),
            pending: outbox::len(&self.db)?,
            last_sync,
            zone: self.gateway.as_deref().and_then(|g| g.active_zone()),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&rusqlite::Connection) -> Result<T>) -> Result<T> {
        let conn = self.db.conn.lock()?;
        f(&conn)
    }

    /// Spawn a task that drains the outbox every `interval` until `cancel`
    /// fires.
    pub fn start_sync_loop(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "sync loop started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                match engine.on_foreground().await {
                    Ok(Some(report)) if report.applied > 0 || report.failed.is_some() => {
                        debug!(
                            applied = report.applied,
                            halted = report.failed.is_some(),
                            "sync loop cycle"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "sync loop cycle failed"),
                }
            }
            info!("sync loop stopped");
        })
    }
}

fn transition(entry: &OutboxEntry, from: EntryState, to: EntryState) -> EntryState {
    debug!(entry_id = %entry.id, ?from, ?to, "outbox entry transition");
    to
}
