//! A local-first world graph for MUD agents.
//!
//! Rooms, exits, NPCs, observations and relations live in a local
//! [`store::GraphStore`]; gameplay reads and writes never touch the
//! network. A background [`sync::SyncWorker`] pushes local changes to a
//! shared [`mirror::MirrorServer`] and pulls what other peers contributed,
//! addressing every row by natural key so peers converge without ever
//! exchanging local row handles.

#![deny(missing_debug_implementations, rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod gate;
pub mod keys;
pub mod mirror;
pub mod model;
pub mod store;
pub mod sync;

pub use config::Config;
pub use gate::NavigationGate;
pub use store::{ExitRecordOutcome, GraphStore};
pub use sync::SyncWorker;

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use testresult::TestResult;
    use tracing_test::traced_test;

    use crate::{
        keys::{NaturalKey, RecordKind},
        mirror::MirrorState,
        model::{EntityType, Npc, Observation, RoomObservation},
        store::GraphStore,
        sync::{SyncWorker, remote::RemoteMirror},
    };

    fn worker(store: &GraphStore, mirror: &MirrorState) -> SyncWorker {
        SyncWorker::new(
            store.clone(),
            Arc::new(mirror.clone()),
            Duration::from_secs(60),
        )
    }

    fn obs(number: u64, zone: &str) -> RoomObservation {
        RoomObservation {
            room_number: number,
            zone: Some(zone.to_string()),
            full_name: Some(format!("Room {number}")),
            ..Default::default()
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn two_peers_converge() -> TestResult {
        let mirror = MirrorState::new();
        let a = GraphStore::in_memory()?;
        let b = GraphStore::in_memory()?;
        let mut worker_a = worker(&a, &mirror);
        let mut worker_b = worker(&b, &mirror);

        a.upsert_room(obs(100, "midgaard"))?;
        a.upsert_room(obs(101, "midgaard"))?;
        a.record_exit_success(100, 101, "n", &[])?;
        a.upsert_npc(Npc {
            name: "the baker".to_string(),
            current_room: Some(100),
            npc_type: None,
        })?;

        worker_a.run_cycle().await?;
        worker_b.run_cycle().await?;

        assert!(b.get_room(100)?.is_some());
        assert!(b.get_exit(100, "n")?.is_some());
        assert_eq!(b.get_npc("the baker")?.unwrap().current_room, Some(100));
        assert!(b.get_entity("the baker", EntityType::Npc)?.is_some());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn pulled_rows_are_not_echoed_back() -> TestResult {
        let mirror = MirrorState::new();
        let a = GraphStore::in_memory()?;
        let b = GraphStore::in_memory()?;
        let mut worker_a = worker(&a, &mirror);
        let mut worker_b = worker(&b, &mirror);

        a.upsert_room(obs(100, "midgaard"))?;
        worker_a.run_cycle().await?;
        worker_b.run_cycle().await?;

        let seq_after_pull = mirror.rows_since(RecordKind::Room, 0)[0].seq;
        // peer b pushes nothing: everything it holds came from the mirror
        worker_b.run_cycle().await?;
        assert_eq!(mirror.rows_since(RecordKind::Room, 0)[0].seq, seq_after_pull);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn delete_propagates_between_peers() -> TestResult {
        let mirror = MirrorState::new();
        let a = GraphStore::in_memory()?;
        let b = GraphStore::in_memory()?;
        let mut worker_a = worker(&a, &mirror);
        let mut worker_b = worker(&b, &mirror);

        a.upsert_room(obs(42, "midgaard"))?;
        worker_a.run_cycle().await?;
        worker_b.run_cycle().await?;
        assert!(b.get_room(42)?.is_some());

        b.delete_room(42)?;
        worker_b.run_cycle().await?;
        worker_a.run_cycle().await?;

        assert!(a.get_room(42)?.is_none());
        assert!(a.get_entity("42", EntityType::Room)?.is_none());
        // the applying side logs nothing; the ledger entry exists on b only
        assert!(a.delete_log()?.is_empty());
        assert!(!b.delete_log()?.is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn recreated_room_survives_own_delete_echo() -> TestResult {
        let mirror = MirrorState::new();
        let a = GraphStore::in_memory()?;
        let mut worker_a = worker(&a, &mirror);

        a.upsert_room(obs(42, "midgaard"))?;
        worker_a.run_cycle().await?;
        a.delete_room(42)?;
        a.upsert_room(obs(42, "midgaard"))?;
        // the cycle pushes the delete, pushes the recreation, then pulls its
        // own delete back; the recreated row must survive
        worker_a.run_cycle().await?;
        assert!(a.get_room(42)?.is_some());

        // and the mirror ends up with the recreated row present
        assert_eq!(mirror.rows_since(RecordKind::Room, 0).len(), 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_push_is_retried_without_loss() -> TestResult {
        // a mirror that refuses row pushes once
        #[derive(Clone)]
        struct Flaky {
            inner: MirrorState,
            failures: Arc<std::sync::atomic::AtomicU32>,
        }

        #[async_trait::async_trait]
        impl RemoteMirror for Flaky {
            async fn schema(
                &self,
            ) -> Result<crate::sync::remote::SchemaInfo, crate::sync::remote::RemoteError>
            {
                self.inner.schema().await
            }
            async fn push_row(
                &self,
                kind: RecordKind,
                request: crate::sync::remote::PushRowRequest,
            ) -> Result<u64, crate::sync::remote::RemoteError> {
                if self
                    .failures
                    .fetch_update(
                        std::sync::atomic::Ordering::SeqCst,
                        std::sync::atomic::Ordering::SeqCst,
                        |n| n.checked_sub(1),
                    )
                    .is_ok()
                {
                    return Err(crate::sync::remote::RemoteError::Status {
                        status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                        url: url::Url::parse("http://mirror.test/rows").unwrap(),
                    });
                }
                self.inner.push_row(kind, request).await
            }
            async fn pull_rows(
                &self,
                kind: RecordKind,
                since: u64,
            ) -> Result<Vec<crate::sync::remote::PulledRow>, crate::sync::remote::RemoteError>
            {
                self.inner.pull_rows(kind, since).await
            }
            async fn push_delete(
                &self,
                kind: RecordKind,
                request: crate::sync::remote::PushDeleteRequest,
            ) -> Result<(), crate::sync::remote::RemoteError> {
                self.inner.push_delete(kind, request).await
            }
            async fn pull_deletes(
                &self,
                since: u64,
            ) -> Result<Vec<crate::sync::remote::RemoteDeleteEntry>, crate::sync::remote::RemoteError>
            {
                self.inner.pull_deletes(since).await
            }
        }

        let mirror = MirrorState::new();
        let flaky = Flaky {
            inner: mirror.clone(),
            failures: Arc::new(std::sync::atomic::AtomicU32::new(1)),
        };
        let a = GraphStore::in_memory()?;
        let mut worker_a = SyncWorker::new(a.clone(), Arc::new(flaky), Duration::from_secs(60));

        a.upsert_room(obs(7, "midgaard"))?;
        a.add_observation(Observation {
            entity_name: "7".to_string(),
            entity_type: EntityType::Room,
            observation_type: "note".to_string(),
            text: "dusty".to_string(),
        })?;

        // first cycle fails mid-push; checkpoints must not advance
        assert!(worker_a.run_cycle().await.is_err());
        let key = GraphStore::push_checkpoint_key(RecordKind::Entity);
        assert_eq!(a.checkpoint(&key)?, 0);

        // retry delivers everything exactly once by natural key
        worker_a.run_cycle().await?;
        assert_eq!(mirror.rows_since(RecordKind::Room, 0).len(), 1);
        assert_eq!(mirror.rows_since(RecordKind::Observation, 0).len(), 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn acked_deletes_stay_synced_when_a_later_row_push_fails() -> TestResult {
        use std::sync::atomic::{AtomicBool, Ordering};

        // lets deletes through but refuses row pushes while the flag is set
        #[derive(Clone)]
        struct RowsDown {
            inner: MirrorState,
            down: Arc<AtomicBool>,
        }

        #[async_trait::async_trait]
        impl RemoteMirror for RowsDown {
            async fn schema(
                &self,
            ) -> Result<crate::sync::remote::SchemaInfo, crate::sync::remote::RemoteError>
            {
                self.inner.schema().await
            }
            async fn push_row(
                &self,
                kind: RecordKind,
                request: crate::sync::remote::PushRowRequest,
            ) -> Result<u64, crate::sync::remote::RemoteError> {
                if self.down.load(Ordering::SeqCst) {
                    return Err(crate::sync::remote::RemoteError::Status {
                        status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                        url: url::Url::parse("http://mirror.test/rows").unwrap(),
                    });
                }
                self.inner.push_row(kind, request).await
            }
            async fn pull_rows(
                &self,
                kind: RecordKind,
                since: u64,
            ) -> Result<Vec<crate::sync::remote::PulledRow>, crate::sync::remote::RemoteError>
            {
                self.inner.pull_rows(kind, since).await
            }
            async fn push_delete(
                &self,
                kind: RecordKind,
                request: crate::sync::remote::PushDeleteRequest,
            ) -> Result<(), crate::sync::remote::RemoteError> {
                self.inner.push_delete(kind, request).await
            }
            async fn pull_deletes(
                &self,
                since: u64,
            ) -> Result<Vec<crate::sync::remote::RemoteDeleteEntry>, crate::sync::remote::RemoteError>
            {
                self.inner.pull_deletes(since).await
            }
        }

        let mirror = MirrorState::new();
        let down = Arc::new(AtomicBool::new(false));
        let a = GraphStore::in_memory()?;
        let mut worker_a = SyncWorker::new(
            a.clone(),
            Arc::new(RowsDown {
                inner: mirror.clone(),
                down: down.clone(),
            }),
            Duration::from_secs(60),
        );

        a.upsert_room(obs(42, "midgaard"))?;
        worker_a.run_cycle().await?;

        a.delete_room(42)?;
        a.upsert_room(obs(43, "midgaard"))?;
        let room_key = GraphStore::push_checkpoint_key(RecordKind::Room);
        let room_checkpoint = a.checkpoint(&room_key)?;

        down.store(true, Ordering::SeqCst);
        assert!(worker_a.run_cycle().await.is_err());

        // the delete batch was acknowledged before the row push failed, so
        // its ledger flags are terminal and the mirror logged it once
        assert!(a.unsynced_deletes()?.is_empty());
        assert_eq!(mirror.deletes_since(0).len(), 2); // room 42 and its entity
        // the failed row batch left its checkpoint where it was
        assert_eq!(a.checkpoint(&room_key)?, room_checkpoint);

        // recovery re-sends only the rows; the deletes are not re-pushed
        down.store(false, Ordering::SeqCst);
        worker_a.run_cycle().await?;
        assert_eq!(mirror.deletes_since(0).len(), 2);
        assert_eq!(mirror.rows_since(RecordKind::Room, 0).len(), 1);
        assert!(a.checkpoint(&room_key)? > room_checkpoint);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn schema_mismatch_stops_sync() -> TestResult {
        #[derive(Clone)]
        struct WrongSchema(MirrorState);

        #[async_trait::async_trait]
        impl RemoteMirror for WrongSchema {
            async fn schema(
                &self,
            ) -> Result<crate::sync::remote::SchemaInfo, crate::sync::remote::RemoteError>
            {
                Ok(crate::sync::remote::SchemaInfo {
                    version: 99,
                    tables: vec![],
                })
            }
            async fn push_row(
                &self,
                kind: RecordKind,
                request: crate::sync::remote::PushRowRequest,
            ) -> Result<u64, crate::sync::remote::RemoteError> {
                self.0.push_row(kind, request).await
            }
            async fn pull_rows(
                &self,
                kind: RecordKind,
                since: u64,
            ) -> Result<Vec<crate::sync::remote::PulledRow>, crate::sync::remote::RemoteError>
            {
                self.0.pull_rows(kind, since).await
            }
            async fn push_delete(
                &self,
                kind: RecordKind,
                request: crate::sync::remote::PushDeleteRequest,
            ) -> Result<(), crate::sync::remote::RemoteError> {
                self.0.push_delete(kind, request).await
            }
            async fn pull_deletes(
                &self,
                since: u64,
            ) -> Result<Vec<crate::sync::remote::RemoteDeleteEntry>, crate::sync::remote::RemoteError>
            {
                self.0.pull_deletes(since).await
            }
        }

        let store = GraphStore::in_memory()?;
        store.upsert_room(obs(1, "midgaard"))?;
        let mut worker = SyncWorker::new(
            store.clone(),
            Arc::new(WrongSchema(MirrorState::new())),
            Duration::from_secs(60),
        );
        let err = worker.run_cycle().await.unwrap_err();
        assert!(err.to_string().contains("schema mismatch"));

        // spawning against the same mirror fails at startup, before any
        // worker task detaches; the host never runs silently local-only
        let worker = SyncWorker::new(
            store.clone(),
            Arc::new(WrongSchema(MirrorState::new())),
            Duration::from_secs(60),
        );
        let spawned = worker
            .spawn(tokio_util::sync::CancellationToken::new())
            .await;
        assert!(spawned.unwrap_err().to_string().contains("schema mismatch"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn fresh_peer_pulls_before_pushing() -> TestResult {
        let mirror = MirrorState::new();
        // seed the mirror from an established peer
        let seed = GraphStore::in_memory()?;
        seed.upsert_room(obs(10, "midgaard"))?;
        worker(&seed, &mirror).run_cycle().await?;

        // a fresh peer with a conflicting local view of room 10
        let fresh = GraphStore::in_memory()?;
        fresh.upsert_room(RoomObservation {
            room_number: 10,
            zone: Some("wrong".to_string()),
            ..Default::default()
        })?;
        worker(&fresh, &mirror).run_cycle().await?;

        // the pull ran first, so the shared view won locally before the
        // (now clean-tracked) push phase ran
        assert_eq!(fresh.get_room(10)?.unwrap().zone.as_deref(), Some("midgaard"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn http_round_trip() -> TestResult {
        use crate::{mirror::MirrorServer, sync::remote::HttpRemoteMirror};

        let server = MirrorServer::spawn("127.0.0.1:0".parse()?, MirrorState::new()).await?;
        let remote = Arc::new(HttpRemoteMirror::new(server.base_url()?));

        let a = GraphStore::in_memory()?;
        let b = GraphStore::in_memory()?;
        a.upsert_room(obs(5, "midgaard"))?;

        let mut worker_a = SyncWorker::new(a.clone(), remote.clone(), Duration::from_secs(60));
        let mut worker_b = SyncWorker::new(b.clone(), remote, Duration::from_secs(60));
        worker_a.run_cycle().await?;
        worker_b.run_cycle().await?;
        assert!(b.get_room(5)?.is_some());

        b.delete_room(5)?;
        worker_b.run_cycle().await?;
        worker_a.run_cycle().await?;
        assert!(a.get_room(5)?.is_none());

        server.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn deletes_by_natural_key_only() -> TestResult {
        let mirror = MirrorState::new();
        let a = GraphStore::in_memory()?;
        a.upsert_room(obs(42, "midgaard"))?;
        worker(&a, &mirror).run_cycle().await?;
        a.delete_room(42)?;
        worker(&a, &mirror).run_cycle().await?;

        let deletes = mirror.deletes_since(0);
        assert!(!deletes.is_empty());
        let room_delete = deletes
            .iter()
            .find(|d| d.kind == RecordKind::Room)
            .unwrap();
        assert_eq!(
            NaturalKey::from_value(RecordKind::Room, room_delete.natural_key.clone())?,
            NaturalKey::room(42)
        );
        Ok(())
    }
}
