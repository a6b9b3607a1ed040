//! The remote mirror seam.
//!
//! The sync worker talks to the shared mirror through [`RemoteMirror`], so
//! tests can drive cycles against an in-process mirror and the binary can
//! point at an HTTP one.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::keys::RecordKind;

/// Wire schema version both sides must agree on.
pub const SCHEMA_VERSION: u32 = 1;

/// Errors crossing the mirror seam.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// The mirror speaks a different schema version; syncing would corrupt
    /// one side, so the worker stops until operator intervention.
    #[error("schema mismatch: mirror has version {found}, expected {expected}")]
    SchemaMismatch { expected: u32, found: u32 },
    #[error("mirror returned {status} for {url}")]
    Status { status: StatusCode, url: Url },
    #[error("transport error")]
    Transport(#[from] reqwest::Error),
}

/// Mirror self-description, answered at `GET /schema`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub version: u32,
    pub tables: Vec<String>,
}

/// Body of `PUT /rows/{kind}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRowRequest {
    pub natural_key: serde_json::Value,
    pub row: serde_json::Value,
}

/// Response to a row push: the mirror mutation sequence assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRowResponse {
    pub seq: u64,
}

/// One row streamed from `GET /rows/{kind}?since=`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulledRow {
    /// Mirror mutation sequence of the last write to this row.
    pub seq: u64,
    pub row: serde_json::Value,
}

/// Body of `DELETE /rows/{kind}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushDeleteRequest {
    pub natural_key: serde_json::Value,
}

/// One entry from the mirror's delete log, `GET /deletes?since=`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteDeleteEntry {
    pub seq: u64,
    pub kind: RecordKind,
    pub natural_key: serde_json::Value,
}

/// What the sync worker needs from the shared mirror.
#[async_trait]
pub trait RemoteMirror: Send + Sync + 'static {
    async fn schema(&self) -> Result<SchemaInfo, RemoteError>;

    /// Upsert one row by natural key; returns the mirror mutation sequence.
    /// Safe to repeat: re-pushing the same row is an overwrite, not a
    /// duplicate.
    async fn push_row(
        &self,
        kind: RecordKind,
        request: PushRowRequest,
    ) -> Result<u64, RemoteError>;

    /// Rows of one kind whose last mutation sequence is greater than `since`.
    async fn pull_rows(&self, kind: RecordKind, since: u64) -> Result<Vec<PulledRow>, RemoteError>;

    /// Delete one row by natural key. The mirror appends to its own delete
    /// log only when the row existed, so repeated delivery stays
    /// idempotent. Always acknowledged, even when the row was already gone.
    async fn push_delete(
        &self,
        kind: RecordKind,
        request: PushDeleteRequest,
    ) -> Result<(), RemoteError>;

    /// Mirror delete-log entries with sequence greater than `since`.
    async fn pull_deletes(&self, since: u64) -> Result<Vec<RemoteDeleteEntry>, RemoteError>;
}

/// [`RemoteMirror`] over HTTP, matching the routes served by
/// [`crate::mirror::MirrorServer`].
#[derive(Debug, Clone)]
pub struct HttpRemoteMirror {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpRemoteMirror {
    pub fn new(mut base_url: Url) -> Self {
        // relative joins below need the trailing slash
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn url(&self, path: &str) -> Result<Url, RemoteError> {
        // the base url is validated at config load; a join failure would
        // mean a malformed path literal below
        self.base_url.join(path).map_err(|_| RemoteError::Status {
            status: StatusCode::BAD_REQUEST,
            url: self.base_url.clone(),
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(RemoteError::Status {
                status,
                url: response.url().clone(),
            })
        }
    }
}

#[async_trait]
impl RemoteMirror for HttpRemoteMirror {
    async fn schema(&self) -> Result<SchemaInfo, RemoteError> {
        let response = self.client.get(self.url("schema")?).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn push_row(
        &self,
        kind: RecordKind,
        request: PushRowRequest,
    ) -> Result<u64, RemoteError> {
        let response = self
            .client
            .put(self.url(&format!("rows/{kind}"))?)
            .json(&request)
            .send()
            .await?;
        let body: PushRowResponse = Self::check(response).await?.json().await?;
        Ok(body.seq)
    }

    async fn pull_rows(&self, kind: RecordKind, since: u64) -> Result<Vec<PulledRow>, RemoteError> {
        let mut url = self.url(&format!("rows/{kind}"))?;
        url.query_pairs_mut().append_pair("since", &since.to_string());
        let response = self.client.get(url).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn push_delete(
        &self,
        kind: RecordKind,
        request: PushDeleteRequest,
    ) -> Result<(), RemoteError> {
        let response = self
            .client
            .delete(self.url(&format!("rows/{kind}"))?)
            .json(&request)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn pull_deletes(&self, since: u64) -> Result<Vec<RemoteDeleteEntry>, RemoteError> {
        let mut url = self.url("deletes")?;
        url.query_pairs_mut().append_pair("since", &since.to_string());
        let response = self.client.get(url).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }
}
