//! Background synchronization with the shared mirror.
//!
//! Each cycle runs a push phase (the unsynced tail of the delete ledger,
//! then dirty rows kind by kind) and a pull phase (remote rows, then
//! remote deletes). Delivery is at-least-once with per-batch bookkeeping:
//! the delete batch and each kind's row batch advance their ledger flags
//! or checkpoint only once the whole batch is acknowledged. A failure
//! mid-phase re-sends exactly the unacknowledged batches next cycle, and
//! every receiving operation is an idempotent overwrite keyed by natural
//! key, so redelivery is harmless.
//!
//! The very first cycle of a fresh store pulls before pushing, so a new
//! peer seeds itself from the shared world before contributing to it.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    keys::{KIND_ORDER, NaturalKey},
    store::GraphStore,
};

pub mod remote;

use remote::{PushDeleteRequest, PushRowRequest, RemoteError, RemoteMirror, SCHEMA_VERSION};

/// The sync worker. Owns nothing but handles; gameplay writes to the store
/// proceed while a cycle is in flight.
pub struct SyncWorker {
    store: GraphStore,
    remote: Arc<dyn RemoteMirror>,
    interval: Duration,
    schema_checked: bool,
    cycles_completed: u64,
}

impl std::fmt::Debug for SyncWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncWorker")
            .field("interval", &self.interval)
            .field("cycles_completed", &self.cycles_completed)
            .finish_non_exhaustive()
    }
}

impl SyncWorker {
    pub fn new(store: GraphStore, remote: Arc<dyn RemoteMirror>, interval: Duration) -> Self {
        Self {
            store,
            remote,
            interval,
            schema_checked: false,
            cycles_completed: 0,
        }
    }

    /// Check the mirror schema, then spawn the worker onto the runtime.
    /// A mismatch is a startup error: the caller learns immediately
    /// instead of running local-only with a dead worker task. The spawned
    /// worker stops when the token fires, or if the mirror's schema
    /// changes underneath it later.
    pub async fn spawn(mut self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        self.ensure_schema().await?;
        Ok(tokio::spawn(self.run(cancel)))
    }

    /// Run cycles until cancelled. Transient failures are logged and
    /// retried next tick; a schema mismatch is fatal.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, "sync worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("sync worker stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.run_cycle().await {
                        if is_schema_mismatch(&err) {
                            error!("{err:#}; sync disabled until resolved");
                            break;
                        }
                        warn!("sync cycle failed: {err:#}");
                    }
                }
            }
        }
    }

    /// One full cycle. Public so tests and shutdown paths can drive sync
    /// deterministically.
    pub async fn run_cycle(&mut self) -> Result<()> {
        self.ensure_schema().await?;
        if self.cycles_completed == 0 {
            self.pull_phase().await.context("pull phase")?;
            self.push_phase().await.context("push phase")?;
        } else {
            self.push_phase().await.context("push phase")?;
            self.pull_phase().await.context("pull phase")?;
        }
        self.cycles_completed += 1;
        Ok(())
    }

    async fn ensure_schema(&mut self) -> Result<()> {
        if self.schema_checked {
            return Ok(());
        }
        let schema = self.remote.schema().await?;
        if schema.version != SCHEMA_VERSION {
            return Err(RemoteError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                found: schema.version,
            }
            .into());
        }
        debug!(version = schema.version, tables = schema.tables.len(), "mirror schema ok");
        self.schema_checked = true;
        Ok(())
    }

    /// Send local changes: the unsynced delete ledger first (a deleted row
    /// must leave the mirror before any recreation of it arrives), then
    /// dirty rows kind by kind, parents before children.
    async fn push_phase(&self) -> Result<()> {
        let deletes = self.store.unsynced_deletes()?;
        if !deletes.is_empty() {
            let mut acked = Vec::with_capacity(deletes.len());
            for entry in &deletes {
                let key = entry.key()?;
                self.remote
                    .push_delete(
                        entry.kind,
                        PushDeleteRequest {
                            natural_key: key.to_value(),
                        },
                    )
                    .await?;
                acked.push(entry.sequence_id);
            }
            // only after the whole batch is acknowledged
            self.store.mark_deletes_synced(&acked)?;
            info!(count = acked.len(), "pushed deletes");
        }

        for kind in KIND_ORDER {
            let checkpoint_key = GraphStore::push_checkpoint_key(kind);
            let since = self.store.checkpoint(&checkpoint_key)?;
            let rows = self.store.changed_since(kind, since)?;
            if rows.is_empty() {
                continue;
            }
            let mut acks = Vec::with_capacity(rows.len());
            let mut high = since;
            for row in rows {
                let seq = self
                    .remote
                    .push_row(
                        kind,
                        PushRowRequest {
                            natural_key: row.key.to_value(),
                            row: row.row,
                        },
                    )
                    .await?;
                high = high.max(row.local_seq);
                acks.push((row.key, seq));
            }
            let count = acks.len();
            self.store.mark_pushed(&acks)?;
            self.store.set_checkpoints(&[(checkpoint_key, high)])?;
            debug!(%kind, count, "pushed rows");
        }
        Ok(())
    }

    /// Apply remote changes: rows kind by kind from the shared mutation
    /// sequence, then the mirror's delete log. Pull is last-applied-wins;
    /// the mirror already holds the reconciled state.
    async fn pull_phase(&self) -> Result<()> {
        let since = self.store.checkpoint(GraphStore::pull_checkpoint_key())?;
        let mut high = since;
        let mut applied = 0usize;
        for kind in KIND_ORDER {
            for pulled in self.remote.pull_rows(kind, since).await? {
                self.store.apply_remote_row(kind, pulled.row, pulled.seq)?;
                high = high.max(pulled.seq);
                applied += 1;
            }
        }
        if high > since {
            self.store
                .set_checkpoints(&[(GraphStore::pull_checkpoint_key().to_string(), high)])?;
            debug!(count = applied, checkpoint = high, "pulled rows");
        }

        let delete_since = self.store.checkpoint(GraphStore::deletes_applied_key())?;
        let mut delete_high = delete_since;
        for entry in self.remote.pull_deletes(delete_since).await? {
            let key = NaturalKey::from_value(entry.kind, entry.natural_key)?;
            self.store.apply_remote_delete(&key, entry.seq)?;
            delete_high = delete_high.max(entry.seq);
        }
        if delete_high > delete_since {
            // the local-seq snapshot moves with the checkpoint: rows created
            // after this point are newer than every delete applied so far
            self.store.set_checkpoints(&[
                (GraphStore::deletes_applied_key().to_string(), delete_high),
                (
                    crate::store::deletes_applied_local_seq_key().to_string(),
                    self.store.local_seq()?,
                ),
            ])?;
        }
        Ok(())
    }
}

fn is_schema_mismatch(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<RemoteError>(),
        Some(RemoteError::SchemaMismatch { .. })
    )
}
