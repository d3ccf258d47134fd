//! JSON backup: full export of the local store and re-import through the
//! write path.
//!
//! Document shape:
//! `{ "version": 1, "zone": ..., "exportedAt": ..., "<collection>": [records] }`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::api::RemoteGateway;
use crate::db::DbState;
use crate::error::{Error, Result};
use crate::store::{self, record_id, Collection, Record};
use crate::write_path::{WriteOutcome, WritePath};

pub const BACKUP_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupDocument {
    pub version: u32,
    #[serde(default)]
    pub zone: Option<String>,
    pub exported_at: DateTime<Utc>,
    /// Records per collection, keyed by collection name.
    #[serde(flatten)]
    pub collections: BTreeMap<String, Vec<Record>>,
}

impl BackupDocument {
    pub fn records(&self, collection: Collection) -> &[Record] {
        self.collections
            .get(collection.as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Snapshot every collection.
pub fn export(db: &DbState, zone: Option<&str>) -> Result<BackupDocument> {
    let mut collections = BTreeMap::new();
    for collection in Collection::ALL {
        let mut records = store::all(db, collection)?;
        records.sort_by(|a, b| record_id(a).ok().cmp(&record_id(b).ok()));
        collections.insert(collection.as_str().to_string(), records);
    }
    let doc = BackupDocument {
        version: BACKUP_VERSION,
        zone: zone.map(str::to_string),
        exported_at: Utc::now(),
        collections,
    };
    info!(
        records = doc.collections.values().map(Vec::len).sum::<usize>(),
        "backup exported"
    );
    Ok(doc)
}

pub fn export_json(db: &DbState, zone: Option<&str>) -> Result<String> {
    Ok(serde_json::to_string_pretty(&export(db, zone)?)?)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub imported: usize,
    /// Records rejected for a missing id or non-object shape.
    pub skipped: usize,
    pub synced: usize,
    pub queued: usize,
    pub local_only: usize,
}

/// Import a backup document. Unknown top-level keys are ignored; a document
/// from a newer format version is rejected before anything is written.
pub async fn import<G: RemoteGateway>(
    write_path: &WritePath<G>,
    document: &Value,
) -> Result<ImportReport> {
    let obj = document
        .as_object()
        .ok_or_else(|| Error::Validation("backup must be a JSON object".into()))?;

    let version = match obj.get("version") {
        None => BACKUP_VERSION as u64,
        Some(v) => v
            .as_u64()
            .ok_or_else(|| Error::Validation(format!("invalid backup version: {v}")))?,
    };
    if version > BACKUP_VERSION as u64 {
        return Err(Error::Validation(format!(
            "backup version {version} is newer than supported version {BACKUP_VERSION}"
        )));
    }

    let mut report = ImportReport::default();
    for collection in Collection::ALL {
        let Some(items) = obj.get(collection.as_str()).and_then(Value::as_array) else {
            continue;
        };
        for item in items {
            let Some(record) = item.as_object().filter(|r| record_id(r).is_ok()) else {
                warn!(collection = %collection, "backup import: skipping record without id");
                report.skipped += 1;
                continue;
            };
            match write_path.write(collection, record).await? {
                WriteOutcome::Synced => report.synced += 1,
                WriteOutcome::Queued => report.queued += 1,
                WriteOutcome::LocalOnly => report.local_only += 1,
            }
            report.imported += 1;
        }
    }

    info!(
        imported = report.imported,
        skipped = report.skipped,
        queued = report.queued,
        "backup imported"
    );
    Ok(report)
}

pub async fn import_json<G: RemoteGateway>(
    write_path: &WritePath<G>,
    raw: &str,
) -> Result<ImportReport> {
    let document: Value = serde_json::from_str(raw)
        .map_err(|e| Error::Validation(format!("backup is not valid JSON: {e}")))?;
    import(write_path, &document).await
}
