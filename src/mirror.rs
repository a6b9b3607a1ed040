//! The shared mirror.
//!
//! [`MirrorState`] is the authoritative table set plus one mutation
//! sequence shared by row upserts and delete-log appends, so "deleted,
//! then recreated" is always ordered for every peer. [`MirrorServer`]
//! serves it over HTTP; the state also implements [`RemoteMirror`]
//! directly, which is what the sync tests drive.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{self, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info};
use url::Url;

use crate::{
    keys::{KIND_ORDER, RecordKind},
    sync::remote::{
        PulledRow, PushDeleteRequest, PushRowRequest, PushRowResponse, RemoteDeleteEntry,
        RemoteError, RemoteMirror, SCHEMA_VERSION, SchemaInfo,
    },
};

#[derive(Debug, Clone)]
struct MirrorRow {
    seq: u64,
    row: serde_json::Value,
}

#[derive(Debug, Default)]
struct Inner {
    seq: u64,
    /// Rows per kind, keyed by canonical natural-key text.
    tables: BTreeMap<RecordKind, BTreeMap<String, MirrorRow>>,
    deletes: Vec<RemoteDeleteEntry>,
}

/// In-memory mirror state, shared between server handlers.
#[derive(Debug, Clone, Default)]
pub struct MirrorState {
    inner: Arc<Mutex<Inner>>,
}

impl MirrorState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // a poisoned mutex means a panic mid-mutation; state is unusable
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn schema_info(&self) -> SchemaInfo {
        let mut tables: Vec<String> = KIND_ORDER.iter().map(|k| k.to_string()).collect();
        tables.push("sync_deletes".to_string());
        SchemaInfo {
            version: SCHEMA_VERSION,
            tables,
        }
    }

    /// Upsert a row; assigns and returns the next mutation sequence.
    pub fn put_row(&self, kind: RecordKind, key: serde_json::Value, row: serde_json::Value) -> u64 {
        let canonical = key.to_string();
        let mut inner = self.lock();
        inner.seq += 1;
        let seq = inner.seq;
        inner
            .tables
            .entry(kind)
            .or_default()
            .insert(canonical, MirrorRow { seq, row });
        seq
    }

    /// Rows of one kind written after `since`.
    pub fn rows_since(&self, kind: RecordKind, since: u64) -> Vec<PulledRow> {
        let inner = self.lock();
        let Some(table) = inner.tables.get(&kind) else {
            return Vec::new();
        };
        let mut rows: Vec<PulledRow> = table
            .values()
            .filter(|r| r.seq > since)
            .map(|r| PulledRow {
                seq: r.seq,
                row: r.row.clone(),
            })
            .collect();
        rows.sort_by_key(|r| r.seq);
        rows
    }

    /// Remove a row. A delete-log entry is appended only when the row was
    /// actually present, so redelivered deletes do not pile up duplicate
    /// log entries.
    pub fn delete_row(&self, kind: RecordKind, key: serde_json::Value) -> Option<u64> {
        let canonical = key.to_string();
        let mut inner = self.lock();
        let removed = inner
            .tables
            .get_mut(&kind)
            .and_then(|table| table.remove(&canonical))
            .is_some();
        if !removed {
            return None;
        }
        inner.seq += 1;
        let seq = inner.seq;
        inner.deletes.push(RemoteDeleteEntry {
            seq,
            kind,
            natural_key: key,
        });
        Some(seq)
    }

    /// Delete-log entries after `since`, in sequence order.
    pub fn deletes_since(&self, since: u64) -> Vec<RemoteDeleteEntry> {
        let inner = self.lock();
        inner
            .deletes
            .iter()
            .filter(|e| e.seq > since)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RemoteMirror for MirrorState {
    async fn schema(&self) -> Result<SchemaInfo, RemoteError> {
        Ok(self.schema_info())
    }

    async fn push_row(
        &self,
        kind: RecordKind,
        request: PushRowRequest,
    ) -> Result<u64, RemoteError> {
        Ok(self.put_row(kind, request.natural_key, request.row))
    }

    async fn pull_rows(&self, kind: RecordKind, since: u64) -> Result<Vec<PulledRow>, RemoteError> {
        Ok(self.rows_since(kind, since))
    }

    async fn push_delete(
        &self,
        kind: RecordKind,
        request: PushDeleteRequest,
    ) -> Result<(), RemoteError> {
        self.delete_row(kind, request.natural_key);
        Ok(())
    }

    async fn pull_deletes(&self, since: u64) -> Result<Vec<RemoteDeleteEntry>, RemoteError> {
        Ok(self.deletes_since(since))
    }
}

/// Error envelope for the HTTP surface.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    detail: String,
}

impl AppError {
    fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, self.detail).into_response()
    }
}

fn parse_kind(kind: &str) -> Result<RecordKind, AppError> {
    kind.parse()
        .map_err(|_| AppError::bad_request(format!("unknown row kind: {kind}")))
}

#[derive(Debug, Deserialize)]
struct SinceQuery {
    #[serde(default)]
    since: u64,
}

fn router(state: MirrorState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(cors::Any)
        .allow_origin(cors::Any);
    Router::new()
        .route("/schema", get(get_schema))
        .route(
            "/rows/{kind}",
            get(get_rows).put(put_row).delete(delete_row),
        )
        .route("/deletes", get(get_deletes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn get_schema(State(state): State<MirrorState>) -> Json<SchemaInfo> {
    Json(state.schema_info())
}

async fn get_rows(
    State(state): State<MirrorState>,
    Path(kind): Path<String>,
    Query(query): Query<SinceQuery>,
) -> Result<Json<Vec<PulledRow>>, AppError> {
    let kind = parse_kind(&kind)?;
    Ok(Json(state.rows_since(kind, query.since)))
}

async fn put_row(
    State(state): State<MirrorState>,
    Path(kind): Path<String>,
    Json(request): Json<PushRowRequest>,
) -> Result<Json<PushRowResponse>, AppError> {
    let kind = parse_kind(&kind)?;
    let seq = state.put_row(kind, request.natural_key, request.row);
    debug!(%kind, seq, "row pushed");
    Ok(Json(PushRowResponse { seq }))
}

async fn delete_row(
    State(state): State<MirrorState>,
    Path(kind): Path<String>,
    Json(request): Json<PushDeleteRequest>,
) -> Result<StatusCode, AppError> {
    let kind = parse_kind(&kind)?;
    match state.delete_row(kind, request.natural_key) {
        Some(seq) => debug!(%kind, seq, "row deleted"),
        None => debug!(%kind, "delete for absent row, acknowledged"),
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn get_deletes(
    State(state): State<MirrorState>,
    Query(query): Query<SinceQuery>,
) -> Json<Vec<RemoteDeleteEntry>> {
    Json(state.deletes_since(query.since))
}

/// The mirror HTTP server.
#[derive(Debug)]
pub struct MirrorServer {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MirrorServer {
    /// Bind and start serving. Pass port 0 to pick a free port.
    pub async fn spawn(bind_addr: SocketAddr, state: MirrorState) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind mirror server on {bind_addr}"))?;
        let addr = listener.local_addr()?;
        info!("mirror server listening on {addr}");
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let app = router(state);
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(err) = serve.await {
                tracing::error!("mirror server failed: {err:#}");
            }
        });
        Ok(Self { addr, cancel, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL peers should point their sync worker at.
    pub fn base_url(&self) -> Result<Url> {
        Ok(Url::parse(&format!("http://{}", self.addr))?)
    }

    /// Stop serving and wait for the task to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        self.task.await?;
        Ok(())
    }
}
