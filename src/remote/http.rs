//! UploadThing REST client (blocking).
//!
//! JSON API calls share one client with a short timeout. The raw byte
//! transfer uses a second client bounded by the transfer timeout and runs on
//! a worker thread so that an operator interrupt can be observed while it is
//! in flight.

use std::fs::File;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Body, Client, Response};
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    DeleteResult, IndeterminateCause, PollResult, PrepareRequest, RemoteError, RemoteFile,
    RemoteStore, TransferFailure, TransferOutcome, UploadTarget, UploadUrl,
};
use crate::archive::{Archive, format_bytes};
use crate::config::{ApiKey, RemoteSettings};
use crate::interrupt::InterruptFlag;

/// Header carrying the static API credential.
pub const API_KEY_HEADER: &str = "x-uploadthing-api-key";

const USER_AGENT: &str = concat!("offsite-backup/", env!("CARGO_PKG_VERSION"));

/// How often the waiting thread checks for an operator interrupt.
const INTERRUPT_CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// Error bodies are truncated to this many characters in logs and errors.
const MAX_ERROR_BODY: usize = 512;

const PREPARE_PATH: &str = "/v7/prepareUpload";
const POLL_PATH: &str = "/v6/pollUpload";
const LIST_PATH: &str = "/v6/listFiles";
const DELETE_PATH: &str = "/v6/deleteFiles";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrepareBody<'a> {
    file_name: &'a str,
    file_size: u64,
    slug: &'a str,
    file_type: &'a str,
    custom_id: &'a str,
    content_disposition: &'a str,
    acl: &'a str,
    expires_in: u64,
}

#[derive(Deserialize)]
struct PrepareResponse {
    #[serde(default, alias = "fileKey")]
    key: Option<String>,
    #[serde(default, alias = "uploadUrl")]
    url: Option<String>,
}

/// URL fields a transfer or poll response may carry.
#[derive(Deserialize, Default)]
struct FileLocation {
    #[serde(default, rename = "fileUrl")]
    file_url: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default, rename = "ufsUrl")]
    ufs_url: Option<String>,
}

impl FileLocation {
    fn first_url(self) -> Option<String> {
        [self.file_url, self.url, self.ufs_url]
            .into_iter()
            .flatten()
            .find(|u| !u.trim().is_empty())
    }
}

#[derive(Deserialize)]
struct PollResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default, rename = "fileData")]
    file_data: Option<FileLocation>,
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    files: Vec<ListedFile>,
}

#[derive(Deserialize)]
struct ListedFile {
    key: String,
    #[serde(default)]
    name: String,
    #[serde(default, rename = "uploadedAt")]
    uploaded_at: Option<serde_json::Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteBody<'a> {
    file_keys: &'a [String],
}

#[derive(Deserialize)]
struct DeleteResponse {
    #[serde(default)]
    success: bool,
    #[serde(default, rename = "deletedCount")]
    deleted_count: u64,
}

/// [`RemoteStore`] over the UploadThing HTTP API.
pub struct UploadThingClient {
    api: Client,
    upload: Client,
    base_url: String,
    api_key: ApiKey,
    transfer_timeout: Duration,
    interrupt: InterruptFlag,
}

impl UploadThingClient {
    pub fn new(settings: &RemoteSettings, api_key: ApiKey) -> Result<Self, RemoteError> {
        let api = Client::builder()
            .timeout(settings.request_timeout())
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| RemoteError::Client(e.to_string()))?;
        let upload = Client::builder()
            .timeout(settings.transfer_timeout())
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| RemoteError::Client(e.to_string()))?;

        Ok(Self {
            api,
            upload,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key,
            transfer_timeout: settings.transfer_timeout(),
            interrupt: InterruptFlag::new(),
        })
    }

    /// Treat `flag` being raised during a transfer as an interrupt.
    pub fn with_interrupt(mut self, flag: InterruptFlag) -> Self {
        self.interrupt = flag;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        path: &str,
        body: &B,
    ) -> Result<T, RemoteError> {
        let response = self
            .api
            .post(self.url(path))
            .header(API_KEY_HEADER, self.api_key.expose())
            .json(body)
            .send()
            .map_err(|e| transport_error(endpoint, &e))?;
        decode(endpoint, response)
    }
}

impl RemoteStore for UploadThingClient {
    fn prepare_upload(&self, request: &PrepareRequest) -> Result<UploadTarget, RemoteError> {
        let body = PrepareBody {
            file_name: &request.file_name,
            file_size: request.file_size,
            slug: &request.slug,
            file_type: &request.file_type,
            custom_id: &request.custom_id,
            content_disposition: &request.content_disposition,
            acl: &request.acl,
            expires_in: request.expires_in_secs,
        };
        let response: PrepareResponse = self.post_json("prepareUpload", PREPARE_PATH, &body)?;
        target_from(response)
    }

    fn transfer(&self, url: UploadUrl, archive: &Archive) -> TransferOutcome {
        // A raised flag here means nothing has been sent yet.
        if self.interrupt.is_raised() {
            info!(archive = %archive.filename, "interrupt raised; not starting the transfer");
            return TransferOutcome::Failed(TransferFailure::Cancelled);
        }

        let file = match File::open(&archive.path) {
            Ok(file) => file,
            Err(e) => return TransferOutcome::Failed(TransferFailure::Io(e.to_string())),
        };

        let request = self
            .upload
            .put(url.into_string())
            .header(API_KEY_HEADER, self.api_key.expose())
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(Body::sized(file, archive.size_bytes));

        info!(
            archive = %archive.filename,
            size = %format_bytes(archive.size_bytes),
            timeout_secs = self.transfer_timeout.as_secs(),
            "uploading archive"
        );

        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name("upload".to_string())
            .spawn(move || {
                let exchange = match request.send() {
                    Ok(response) => {
                        let status = response.status();
                        match response.text() {
                            Ok(body) => Exchange::Answered(status, body),
                            Err(e) => Exchange::BodyLost(status, e),
                        }
                    }
                    Err(e) => Exchange::Unanswered(e),
                };
                let _ = tx.send(exchange);
            });
        if let Err(e) = spawned {
            return TransferOutcome::Failed(TransferFailure::Transport(format!(
                "could not start upload thread: {e}"
            )));
        }

        loop {
            match rx.recv_timeout(INTERRUPT_CHECK_INTERVAL) {
                Ok(exchange) => return classify_exchange(exchange, self.transfer_timeout),
                Err(RecvTimeoutError::Timeout) => {
                    if self.interrupt.is_raised() {
                        return TransferOutcome::Indeterminate(IndeterminateCause::Interrupted);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return TransferOutcome::Failed(TransferFailure::Transport(
                        "upload thread exited without a result".to_string(),
                    ));
                }
            }
        }
    }

    fn poll_status(&self, remote_key: &str) -> Result<PollResult, RemoteError> {
        let endpoint = "pollUpload";
        let response = self
            .api
            .get(format!("{}/{}", self.url(POLL_PATH), remote_key))
            .header(API_KEY_HEADER, self.api_key.expose())
            .send()
            .map_err(|e| transport_error(endpoint, &e))?;
        let poll: PollResponse = decode(endpoint, response)?;

        Ok(PollResult {
            status: poll.status.unwrap_or_default(),
            file_url: poll.file_data.and_then(FileLocation::first_url),
        })
    }

    fn list_files(&self) -> Result<Vec<RemoteFile>, RemoteError> {
        let response: ListResponse =
            self.post_json("listFiles", LIST_PATH, &serde_json::json!({}))?;
        debug!(count = response.files.len(), "listed remote files");

        Ok(response
            .files
            .into_iter()
            .map(|file| RemoteFile {
                uploaded_at: file.uploaded_at.as_ref().and_then(parse_timestamp),
                key: file.key,
                name: file.name,
            })
            .collect())
    }

    fn delete_files(&self, keys: &[String]) -> Result<DeleteResult, RemoteError> {
        let response: DeleteResponse =
            self.post_json("deleteFiles", DELETE_PATH, &DeleteBody { file_keys: keys })?;
        Ok(DeleteResult {
            success: response.success,
            deleted_count: response.deleted_count,
        })
    }
}

fn decode<T: DeserializeOwned>(endpoint: &'static str, response: Response) -> Result<T, RemoteError> {
    let status = response.status();
    let body = response
        .text()
        .map_err(|e| transport_error(endpoint, &e))?;

    if !status.is_success() {
        return Err(RemoteError::Status {
            endpoint,
            status: status.as_u16(),
            body: truncate(&body),
        });
    }

    serde_json::from_str(&body).map_err(|e| RemoteError::Decode {
        endpoint,
        reason: e.to_string(),
    })
}

fn target_from(response: PrepareResponse) -> Result<UploadTarget, RemoteError> {
    let remote_key = response
        .key
        .filter(|k| !k.trim().is_empty())
        .ok_or(RemoteError::IncompleteTarget { missing: "key" })?;
    let upload_url = response
        .url
        .filter(|u| !u.trim().is_empty())
        .ok_or(RemoteError::IncompleteTarget { missing: "upload url" })?;

    Ok(UploadTarget {
        remote_key,
        upload_url: UploadUrl::new(upload_url),
    })
}

/// How far the raw transfer got before it returned.
enum Exchange {
    /// Status line and body both read.
    Answered(StatusCode, String),
    /// Status line read, then the body was lost.
    BodyLost(StatusCode, reqwest::Error),
    /// No status line was read.
    Unanswered(reqwest::Error),
}

/// Only errors raised before a connection existed rule the upload out.
/// Anything later may have left the bytes with the remote store.
fn classify_exchange(exchange: Exchange, transfer_timeout: Duration) -> TransferOutcome {
    match exchange {
        Exchange::Answered(status, body) => classify_response(status, &body),
        Exchange::BodyLost(status, e) if status.is_success() => {
            warn!(
                status = status.as_u16(),
                error = %error_chain(&e),
                "transfer accepted but response body was lost"
            );
            TransferOutcome::Confirmed { url: None }
        }
        Exchange::BodyLost(status, e) => {
            debug!(error = %error_chain(&e), "error response body was lost");
            classify_response(status, "")
        }
        Exchange::Unanswered(e) if e.is_timeout() => {
            TransferOutcome::Indeterminate(IndeterminateCause::TimedOut {
                after: transfer_timeout,
            })
        }
        Exchange::Unanswered(e) if e.is_connect() || e.is_builder() => {
            TransferOutcome::Failed(TransferFailure::Transport(error_chain(&e)))
        }
        Exchange::Unanswered(e) => {
            warn!(error = %error_chain(&e), "connection lost before the transfer was answered");
            TransferOutcome::Indeterminate(IndeterminateCause::ConnectionLost)
        }
    }
}

/// Classify a transfer whose transport completed.
fn classify_response(status: StatusCode, body: &str) -> TransferOutcome {
    if status.is_success() {
        return TransferOutcome::Confirmed {
            url: inline_url(body),
        };
    }
    TransferOutcome::Failed(TransferFailure::Status {
        code: status.as_u16(),
        body: truncate(body),
    })
}

/// Final file URL from a transfer response body, when it names one.
fn inline_url(body: &str) -> Option<String> {
    if body.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<FileLocation>(body) {
        Ok(location) => location.first_url(),
        Err(e) => {
            debug!(error = %e, "transfer response body is not a file location");
            None
        }
    }
}

/// `uploadedAt` as epoch milliseconds; accepts integers, floats and RFC 3339.
fn parse_timestamp(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => s.parse::<i64>().ok().or_else(|| {
            chrono::DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.timestamp_millis())
        }),
        _ => None,
    }
}

fn transport_error(endpoint: &'static str, err: &reqwest::Error) -> RemoteError {
    RemoteError::Transport {
        endpoint,
        message: error_chain(err),
    }
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn truncate(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_ERROR_BODY {
        return trimmed.to_string();
    }
    let mut cut: String = trimmed.chars().take(MAX_ERROR_BODY).collect();
    cut.push('…');
    cut
}
