//! Outbox: append-only queue of mutations not yet confirmed remotely.
//!
//! Entries are added once (at mutation time) and removed once (at confirmed
//! apply time). A later mutation to the same key adds a new entry; obsolete
//! entries are replayed too, in order, and the last one wins remotely.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

use crate::db::DbState;
use crate::error::{Error, Result};
use crate::store::{Collection, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxOp {
    Put,
    Delete,
}

impl OutboxOp {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxOp::Put => "put",
            OutboxOp::Delete => "delete",
        }
    }
}

impl fmt::Display for OutboxOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "put" => Ok(OutboxOp::Put),
            "delete" => Ok(OutboxOp::Delete),
            other => Err(Error::LocalStore(format!("unknown outbox op: {other}"))),
        }
    }
}

/// A single pending mutation.
///
/// `store` is kept as the raw collection name so entries written by a
/// build that knew about a collection this one does not can still be
/// listed and discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub id: String,
    pub op: OutboxOp,
    pub store: String,
    pub key: String,
    pub data: Option<Record>,
    pub created_at: DateTime<Utc>,
}

impl OutboxEntry {
    /// The collection this entry targets, if this build knows it.
    pub fn collection(&self) -> Option<Collection> {
        self.store.parse().ok()
    }
}

const SELECT_COLUMNS: &str = "id, op, store, key, data, created_at";

/// Raw outbox row: (id, op, store, key, data, created_at).
type OutboxRow = (String, String, String, String, Option<String>, String);

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<OutboxRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode_entry((id, op, store, key, data, created_at): OutboxRow) -> Result<OutboxEntry> {
    let data = match data {
        Some(raw) => match serde_json::from_str::<Value>(&raw)? {
            Value::Object(map) => Some(map),
            Value::Null => None,
            _ => {
                return Err(Error::LocalStore(format!(
                    "outbox entry {id} carries a non-object payload"
                )))
            }
        },
        None => None,
    };
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::LocalStore(format!("outbox entry {id} bad createdAt: {e}")))?;
    Ok(OutboxEntry {
        op: op.parse()?,
        id,
        store,
        key,
        data,
        created_at,
    })
}

/// Append a mutation. Never updates an existing entry.
pub fn enqueue(
    db: &DbState,
    op: OutboxOp,
    collection: Collection,
    key: &str,
    data: Option<&Record>,
) -> Result<OutboxEntry> {
    let entry = OutboxEntry {
        id: Uuid::new_v4().to_string(),
        op,
        store: collection.as_str().to_string(),
        key: key.to_string(),
        data: data.cloned(),
        created_at: now_micros(),
    };
    insert(db, &entry)?;
    debug!(
        entry_id = %entry.id,
        op = %entry.op,
        collection = %entry.store,
        id = %entry.key,
        "outbox entry enqueued"
    );
    Ok(entry)
}

/// Current time truncated to the precision `created_at` is stored with.
fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    now - chrono::Duration::nanoseconds(i64::from(now.timestamp_subsec_nanos() % 1_000))
}

/// Insert a fully formed entry. Used by `enqueue` and by tests that need
/// control over `created_at` or unknown store names.
pub(crate) fn insert(db: &DbState, entry: &OutboxEntry) -> Result<()> {
    let data = entry.data.as_ref().map(serde_json::to_string).transpose()?;
    let created_at = entry
        .created_at
        .to_rfc3339_opts(SecondsFormat::Micros, true);
    let conn = db.conn.lock()?;
    conn.execute(
        "INSERT INTO outbox (id, op, store, key, data, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.id,
            entry.op.as_str(),
            entry.store,
            entry.key,
            data,
            created_at
        ],
    )?;
    Ok(())
}

/// Every pending entry in ascending `createdAt` (then insertion) order.
pub fn list(db: &DbState) -> Result<Vec<OutboxEntry>> {
    list_limited(db, usize::MAX)
}

/// The first `limit` pending entries in replay order.
pub fn list_limited(db: &DbState, limit: usize) -> Result<Vec<OutboxEntry>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let conn = db.conn.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM outbox ORDER BY created_at ASC, seq ASC LIMIT ?1"
    ))?;
    let rows: Vec<_> = stmt
        .query_map(params![limit], entry_from_row)?
        .collect::<std::result::Result<_, _>>()?;
    drop(stmt);
    drop(conn);
    rows.into_iter().map(decode_entry).collect()
}

pub fn get(db: &DbState, entry_id: &str) -> Result<Option<OutboxEntry>> {
    let conn = db.conn.lock()?;
    let row = conn
        .query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM outbox WHERE id = ?1"),
            params![entry_id],
            entry_from_row,
        )
        .optional()?;
    drop(conn);
    row.map(decode_entry).transpose()
}

/// Remove an entry once its mutation is confirmed (or deliberately dropped).
/// Returns whether a row was removed.
pub fn remove(db: &DbState, entry_id: &str) -> Result<bool> {
    let conn = db.conn.lock()?;
    let removed = conn.execute("DELETE FROM outbox WHERE id = ?1", params![entry_id])?;
    Ok(removed > 0)
}

pub fn len(db: &DbState) -> Result<usize> {
    let conn = db.conn.lock()?;
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
    Ok(n.max(0) as usize)
}

pub fn is_empty(db: &DbState) -> Result<bool> {
    Ok(len(db)? == 0)
}
