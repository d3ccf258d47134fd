//! Local Store: durable key-value collections, one table per entity kind.
//!
//! Records are JSON objects that always carry a non-empty string `id`.
//! Every operation locks the connection for a single statement, so each
//! write is atomic at record granularity and nothing else is.

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::db::DbState;
use crate::error::{Error, Result};

/// An entity record: a JSON object with an `id`.
pub type Record = Map<String, Value>;

/// Entity kinds persisted locally. The wire name doubles as the table name
/// and the remote collection path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Farmacias,
    Opticas,
    Productos,
    Pedidos,
    Visitas,
    Mine,
    Settings,
}

impl Collection {
    pub const ALL: [Collection; 7] = [
        Collection::Farmacias,
        Collection::Opticas,
        Collection::Productos,
        Collection::Pedidos,
        Collection::Visitas,
        Collection::Mine,
        Collection::Settings,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Farmacias => "farmacias",
            Collection::Opticas => "opticas",
            Collection::Productos => "productos",
            Collection::Pedidos => "pedidos",
            Collection::Visitas => "visitas",
            Collection::Mine => "mine",
            Collection::Settings => "settings",
        }
    }

    /// Whether records of this kind participate in remote synchronization.
    pub fn is_sync_eligible(self) -> bool {
        !matches!(self, Collection::Settings)
    }

    /// Iterator over the collections that are pushed and pulled.
    pub fn sync_eligible() -> impl Iterator<Item = Collection> {
        Self::ALL.into_iter().filter(|c| c.is_sync_eligible())
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown collection: {s}")))
    }
}

/// Extract the non-empty string `id` of a record.
pub fn record_id(record: &Record) -> Result<&str> {
    record
        .get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::Validation("record is missing a non-empty `id`".into()))
}

/// Convert an arbitrary JSON value into a record, rejecting non-objects.
pub fn into_record(value: Value) -> Result<Record> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::Validation(format!(
            "expected a JSON object record, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn parse_record(raw: &str) -> Result<Record> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| Error::LocalStore(format!("corrupt stored record: {e}")))?;
    into_record(value).map_err(|e| Error::LocalStore(e.to_string()))
}

/// Fetch a single record.
pub fn get(db: &DbState, collection: Collection, id: &str) -> Result<Option<Record>> {
    let conn = db.conn.lock()?;
    let raw: Option<String> = conn
        .query_row(
            &format!("SELECT data FROM {} WHERE id = ?1", collection.as_str()),
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    raw.as_deref().map(parse_record).transpose()
}

/// Insert or overwrite a record by its `id`.
pub fn put_local(db: &DbState, collection: Collection, record: &Record) -> Result<()> {
    let id = record_id(record)?;
    let data = serde_json::to_string(record)?;
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let conn = db.conn.lock()?;
    conn.execute(
        &format!(
            "INSERT INTO {} (id, data, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at",
            collection.as_str()
        ),
        params![id, data, now],
    )?;
    Ok(())
}

/// Remove a record. Removing a missing id is not an error.
pub fn delete_local(db: &DbState, collection: Collection, id: &str) -> Result<()> {
    let conn = db.conn.lock()?;
    conn.execute(
        &format!("DELETE FROM {} WHERE id = ?1", collection.as_str()),
        params![id],
    )?;
    Ok(())
}

/// Snapshot of every record in a collection, in no particular order.
pub fn all(db: &DbState, collection: Collection) -> Result<Vec<Record>> {
    let conn = db.conn.lock()?;
    let mut stmt = conn.prepare(&format!("SELECT data FROM {}", collection.as_str()))?;
    let raws: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<_, _>>()?;
    drop(stmt);
    drop(conn);
    raws.iter().map(|raw| parse_record(raw)).collect()
}

pub fn count(db: &DbState, collection: Collection) -> Result<usize> {
    let conn = db.conn.lock()?;
    let n: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", collection.as_str()),
        [],
        |row| row.get(0),
    )?;
    Ok(n.max(0) as usize)
}

/// Delete every record of a collection. Local only; nothing is queued.
pub fn clear(db: &DbState, collection: Collection) -> Result<usize> {
    let conn = db.conn.lock()?;
    let removed = conn.execute(&format!("DELETE FROM {}", collection.as_str()), [])?;
    Ok(removed)
}
