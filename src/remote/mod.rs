//! Remote object store contract.
//!
//! The upload orchestrator, completion poller and retention engine only see
//! the [`RemoteStore`] trait. [`http::UploadThingClient`] implements it over
//! the UploadThing REST API; tests substitute scripted fakes.
//!
//! # Transfer outcomes
//!
//! A raw byte transfer is classified three ways because transport success
//! and application success are different things:
//!
//! - [`TransferOutcome::Confirmed`]: a 2xx status was observed.
//! - [`TransferOutcome::Indeterminate`]: timed out or interrupted while the
//!   bytes may already have arrived. Only polling can tell.
//! - [`TransferOutcome::Failed`]: an explicit error status, or a failure
//!   that rules out partial completion.

pub mod http;

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

pub use http::UploadThingClient;

/// Errors from a single remote request.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("failed to build HTTP client: {0}")]
    Client(String),

    #[error("{endpoint} request failed: {message}")]
    Transport {
        endpoint: &'static str,
        message: String,
    },

    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status {
        endpoint: &'static str,
        status: u16,
        body: String,
    },

    #[error("could not decode {endpoint} response: {reason}")]
    Decode {
        endpoint: &'static str,
        reason: String,
    },

    #[error("prepare response is missing {missing}")]
    IncompleteTarget { missing: &'static str },
}

/// Parameters for a single-use upload target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareRequest {
    pub file_name: String,
    pub file_size: u64,
    pub slug: String,
    pub file_type: String,
    /// Caller-chosen identifier, unique per run.
    pub custom_id: String,
    pub content_disposition: String,
    pub acl: String,
    pub expires_in_secs: u64,
}

/// Single-use, time-limited upload URL.
///
/// Not `Clone`; a transfer consumes it.
#[derive(PartialEq, Eq)]
pub struct UploadUrl(String);

impl UploadUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Debug for UploadUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Presigned URLs carry credentials in the query string.
        let visible = self.0.split('?').next().unwrap_or_default();
        write!(f, "UploadUrl({visible}?…)")
    }
}

/// Response of a successful prepare call.
#[derive(Debug, PartialEq, Eq)]
pub struct UploadTarget {
    pub remote_key: String,
    pub upload_url: UploadUrl,
}

/// Why a transfer could not be trusted either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndeterminateCause {
    TimedOut { after: Duration },
    Interrupted,
    /// The connection broke after the request was under way.
    ConnectionLost,
}

impl fmt::Display for IndeterminateCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut { after } => write!(f, "timed out after {}s", after.as_secs()),
            Self::Interrupted => write!(f, "interrupted by operator"),
            Self::ConnectionLost => write!(f, "connection lost mid-transfer"),
        }
    }
}

/// Why a transfer definitely did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferFailure {
    /// Transport completed with a non-success status.
    Status { code: u16, body: String },
    /// Transport failed before any bytes could have been accepted.
    Transport(String),
    /// The local archive could not be read.
    Io(String),
    /// The operator interrupted before the transfer started.
    Cancelled,
}

impl fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status { code, body } if body.is_empty() => write!(f, "HTTP {code}"),
            Self::Status { code, body } => write!(f, "HTTP {code}: {body}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Io(msg) => write!(f, "could not read archive: {msg}"),
            Self::Cancelled => write!(f, "interrupted before the transfer started"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// 2xx observed; `url` is set when the body named the final location.
    Confirmed { url: Option<String> },
    Indeterminate(IndeterminateCause),
    Failed(TransferFailure),
}

/// One processing-status observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollResult {
    /// Free-form status string from the remote store.
    pub status: String,
    pub file_url: Option<String>,
}

/// One entry of the remote listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteFile {
    pub key: String,
    pub name: String,
    /// Upload time in milliseconds since the epoch, when reported.
    pub uploaded_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteResult {
    pub success: bool,
    pub deleted_count: u64,
}

impl DeleteResult {
    /// Only a successful response that actually removed something counts.
    pub fn is_confirmed(&self) -> bool {
        self.success && self.deleted_count > 0
    }
}

/// Request/response contract of the remote object store.
pub trait RemoteStore {
    fn prepare_upload(&self, request: &PrepareRequest) -> Result<UploadTarget, RemoteError>;

    /// Send the archive bytes to a prepared target.
    fn transfer(&self, url: UploadUrl, archive: &crate::archive::Archive) -> TransferOutcome;

    fn poll_status(&self, remote_key: &str) -> Result<PollResult, RemoteError>;

    fn list_files(&self) -> Result<Vec<RemoteFile>, RemoteError>;

    fn delete_files(&self, keys: &[String]) -> Result<DeleteResult, RemoteError>;
}
