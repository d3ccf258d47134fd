//! fieldrep-sync: offline-first data core for field sales reps.
//!
//! Records live in a local SQLite store and are pushed to a zone-partitioned
//! REST backend when possible. Mutations that cannot be pushed wait in an
//! outbox; the sync engine replays them and pulls zone state back.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub mod analytics;
pub mod api;
pub mod auth;
pub mod backup;
pub mod context;
pub mod db;
pub mod error;
pub mod logging;
pub mod orders;
pub mod outbox;
pub mod settings;
pub mod store;
pub mod sync;
pub mod write_path;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{RemoteGateway, RestGateway};
pub use context::{SyncContext, ZoneChange};
pub use db::DbState;
pub use error::{Error, Result};
pub use settings::RemoteConfig;
pub use store::{Collection, Record};
pub use sync::{ResyncOutcome, SyncEngine, SyncEvent};
pub use write_path::{WriteOutcome, WritePath};

/// The assembled core: store, session context, gateway, write path and
/// sync engine for one data directory.
pub struct FieldRep {
    data_dir: PathBuf,
    db: Arc<DbState>,
    ctx: Arc<SyncContext>,
    gateway: Option<Arc<RestGateway>>,
    write_path: WritePath<RestGateway>,
    engine: Arc<SyncEngine<RestGateway>>,
}

impl FieldRep {
    /// Open (or create) the store under `data_dir`, restore any cached
    /// session and build the gateway from the stored remote credentials.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db = Arc::new(db::init(data_dir)?);
        let ctx = Arc::new(SyncContext::new());
        if let Some(profile) = auth::restore(&db, &ctx)? {
            info!(zone = %profile.zone, "resuming cached session");
        }
        let config = settings::remote_config(&db)?;
        let gateway = build_gateway(config, &ctx, &db)?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            write_path: WritePath::new(db.clone(), gateway.clone()),
            engine: Arc::new(SyncEngine::new(db.clone(), gateway.clone())),
            db,
            ctx,
            gateway,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    pub fn write_path(&self) -> &WritePath<RestGateway> {
        &self.write_path
    }

    pub fn engine(&self) -> &Arc<SyncEngine<RestGateway>> {
        &self.engine
    }

    /// Store new remote credentials and rebuild the gateway. The running
    /// sync loop, if any, keeps the old engine and should be restarted.
    pub fn configure_remote(&mut self, config: RemoteConfig) -> Result<()> {
        settings::set_remote_config(&self.db, &config)?;
        self.rebuild(Some(config))
    }

    /// Forget remote credentials; every later write is queued.
    pub fn clear_remote(&mut self) -> Result<()> {
        settings::clear_remote_config(&self.db)?;
        self.rebuild(None)
    }

    fn rebuild(&mut self, config: Option<RemoteConfig>) -> Result<()> {
        self.gateway = build_gateway(config, &self.ctx, &self.db)?;
        self.write_path = WritePath::new(self.db.clone(), self.gateway.clone());
        self.engine = Arc::new(SyncEngine::new(self.db.clone(), self.gateway.clone()));
        Ok(())
    }

    /// Password sign-in followed by a full resync.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<ResyncOutcome> {
        let gateway = self
            .gateway
            .as_ref()
            .ok_or_else(|| Error::Validation("remote backend is not configured".into()))?;
        auth::sign_in(gateway, &self.db, email, password).await?;
        self.engine.on_sign_in().await
    }

    pub fn sign_out(&self) -> Result<()> {
        auth::sign_out(&self.db, &self.ctx)
    }

    /// Admin zone switch: push pending changes to the current zone, switch,
    /// then resync against the new zone.
    pub async fn switch_zone(&self, zone: &str) -> Result<ResyncOutcome> {
        if self.engine.sync_enabled() {
            let report = self.engine.drain_outbox(sync::FULL_DRAIN_LIMIT).await?;
            if let Some(failed) = report.failed {
                return Err(failed.error);
            }
        }
        let change = self.ctx.set_active_zone(zone)?;
        self.engine.full_resync(Some(change)).await
    }
}

fn build_gateway(
    config: Option<RemoteConfig>,
    ctx: &Arc<SyncContext>,
    db: &Arc<DbState>,
) -> Result<Option<Arc<RestGateway>>> {
    config
        .map(|config| {
            RestGateway::new(config, ctx.clone())
                .map(|gw| Arc::new(gw.with_session_cache(db.clone())))
        })
        .transpose()
}
