//! Write Path: the single entry point for entity mutations.
//!
//! Local first, then remote. A mutation that cannot reach the backend is
//! queued in the outbox instead; callers only ever see local failures.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::RemoteGateway;
use crate::db::DbState;
use crate::error::{Error, Result};
use crate::orders::{Order, Visit};
use crate::outbox::{self, OutboxOp};
use crate::store::{self, record_id, Collection, Record};

/// Where a mutation ended up. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteOutcome {
    /// Applied locally and confirmed remotely.
    Synced,
    /// Applied locally; an outbox entry will replay it.
    Queued,
    /// Applied locally; the collection never leaves the device.
    LocalOnly,
}

pub struct WritePath<G> {
    db: Arc<DbState>,
    gateway: Option<Arc<G>>,
}

impl<G> Clone for WritePath<G> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            gateway: self.gateway.clone(),
        }
    }
}

impl<G: RemoteGateway> WritePath<G> {
    /// `gateway` is `None` when no backend is configured.
    pub fn new(db: Arc<DbState>, gateway: Option<Arc<G>>) -> Self {
        Self { db, gateway }
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    /// The gateway, when remote sync is enabled right now.
    fn remote(&self) -> Option<&G> {
        self.gateway.as_deref().filter(|g| g.is_ready())
    }

    pub fn sync_enabled(&self) -> bool {
        self.remote().is_some()
    }

    /// Persist `record` locally, then push or queue it.
    pub async fn write(&self, collection: Collection, record: &Record) -> Result<WriteOutcome> {
        let id = record_id(record)?.to_string();
        store::put_local(&self.db, collection, record)?;

        let Some(gateway) = self.remote() else {
            outbox::enqueue(&self.db, OutboxOp::Put, collection, &id, Some(record))?;
            return Ok(WriteOutcome::Queued);
        };
        if !collection.is_sync_eligible() {
            return Ok(WriteOutcome::LocalOnly);
        }

        match gateway.upsert(collection, record).await {
            Ok(()) => {
                debug!(collection = %collection, id = %id, "write synced");
                Ok(WriteOutcome::Synced)
            }
            Err(e) => {
                warn!(collection = %collection, id = %id, error = %e, "remote upsert failed, queued");
                outbox::enqueue(&self.db, OutboxOp::Put, collection, &id, Some(record))?;
                Ok(WriteOutcome::Queued)
            }
        }
    }

    /// Remove a record locally, then push or queue the deletion.
    pub async fn delete(&self, collection: Collection, id: &str) -> Result<WriteOutcome> {
        let id = id.trim();
        if id.is_empty() {
            return Err(Error::Validation("cannot delete a record without an id".into()));
        }
        store::delete_local(&self.db, collection, id)?;

        let Some(gateway) = self.remote() else {
            outbox::enqueue(&self.db, OutboxOp::Delete, collection, id, None)?;
            return Ok(WriteOutcome::Queued);
        };
        if !collection.is_sync_eligible() {
            return Ok(WriteOutcome::LocalOnly);
        }

        match gateway.delete(collection, id).await {
            Ok(()) => {
                debug!(collection = %collection, id, "delete synced");
                Ok(WriteOutcome::Synced)
            }
            Err(e) => {
                warn!(collection = %collection, id, error = %e, "remote delete failed, queued");
                outbox::enqueue(&self.db, OutboxOp::Delete, collection, id, None)?;
                Ok(WriteOutcome::Queued)
            }
        }
    }

    /// Recompute the order's totals in place, then write it.
    pub async fn save_order(&self, order: &mut Order) -> Result<WriteOutcome> {
        if order.id.trim().is_empty() {
            order.id = Uuid::new_v4().to_string();
        }
        order.recompute();
        let record = order.to_record()?;
        self.write(Collection::Pedidos, &record).await
    }

    /// Write a visit, stamping a fresh id and the current time when absent.
    pub async fn record_visit(&self, visit: &mut Visit) -> Result<WriteOutcome> {
        if visit.id.trim().is_empty() {
            visit.id = Uuid::new_v4().to_string();
        }
        if visit.fecha.is_none() {
            visit.fecha = Some(Utc::now());
        }
        let record = visit.to_record()?;
        self.write(Collection::Visitas, &record).await
    }
}
