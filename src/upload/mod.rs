//! Upload orchestration for a single backup cycle.
//!
//! One archive moves through four stages, each returning a value consumed
//! only by the next:
//!
//! 1. [`UploadOrchestrator::prepare`] → [`UploadSession`]
//! 2. [`UploadOrchestrator::transfer`] → [`TransferOutcome`]
//! 3. [`UploadOrchestrator::resolve`] → [`Resolution`]
//! 4. [`UploadOrchestrator::finalize`] → [`CycleOutcome`]
//!
//! The local archive is deleted only when the remote store positively
//! confirms the upload. Ambiguity and failure both keep it.

pub mod poller;

use std::path::PathBuf;

use chrono::{DateTime, Local};
use tracing::{error, info, warn};

use crate::archive::{Archive, format_bytes};
use crate::config::{BackupConfig, RemoteSettings};
use crate::remote::{
    PrepareRequest, RemoteError, RemoteStore, TransferFailure, TransferOutcome, UploadTarget,
    UploadUrl,
};
use poller::{CompletionPoller, PollOutcome};

/// MIME type declared for archives.
pub const ARCHIVE_MIME_TYPE: &str = "application/gzip";

/// Per-upload request parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSettings {
    pub slug: String,
    pub acl: String,
    pub content_disposition: String,
    pub expires_in_secs: u64,
}

impl From<&RemoteSettings> for UploadSettings {
    fn from(remote: &RemoteSettings) -> Self {
        Self {
            slug: remote.slug.clone(),
            acl: remote.acl.clone(),
            content_disposition: remote.content_disposition.clone(),
            expires_in_secs: remote.expires_in_secs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Prepared,
    Transferring,
    AwaitingConfirmation,
    Complete,
    Unresolved,
    Failed,
}

/// An archive paired with its remote upload target.
#[derive(Debug)]
pub struct UploadSession {
    pub archive: Archive,
    /// Durable identifier for polling and deletion.
    pub remote_key: String,
    pub custom_id: String,
    upload_url: Option<UploadUrl>,
    pub state: SessionState,
}

impl UploadSession {
    pub fn new(archive: Archive, custom_id: String, target: UploadTarget) -> Self {
        Self {
            archive,
            remote_key: target.remote_key,
            custom_id,
            upload_url: Some(target.upload_url),
            state: SessionState::Prepared,
        }
    }

    /// Hand out the single-use upload URL; `None` once it has been taken.
    pub fn take_upload_url(&mut self) -> Option<UploadUrl> {
        self.upload_url.take()
    }
}

/// Where the completion signal came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// The transfer response carried the final URL.
    Transfer,
    /// A poll returned a success token.
    Poll { attempts: u32 },
}

/// Definite state of a transfer after any polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Complete {
        url: Option<String>,
        confirmation: Confirmation,
    },
    Unresolved {
        attempts: u32,
        last_status: Option<String>,
    },
    Failed(TransferFailure),
}

/// Stage at which a cycle failed outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedStage {
    Prepare,
    Transfer,
}

impl std::fmt::Display for FailedStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prepare => write!(f, "prepare"),
            Self::Transfer => write!(f, "transfer"),
        }
    }
}

/// Terminal result of one backup cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Remote store confirmed the upload.
    Uploaded {
        remote_key: String,
        url: Option<String>,
        archive: PathBuf,
        local_deleted: bool,
    },
    /// Outcome unknown after polling; the archive may exist remotely.
    Retained {
        remote_key: String,
        archive: PathBuf,
        attempts: u32,
        last_status: Option<String>,
    },
    /// Prepare or transfer failed; the archive is kept.
    Failed {
        stage: FailedStage,
        archive: PathBuf,
        reason: String,
    },
}

impl CycleOutcome {
    pub fn archive(&self) -> &PathBuf {
        match self {
            Self::Uploaded { archive, .. }
            | Self::Retained { archive, .. }
            | Self::Failed { archive, .. } => archive,
        }
    }

    pub fn local_deleted(&self) -> bool {
        matches!(self, Self::Uploaded { local_deleted: true, .. })
    }
}

/// Drives one archive from prepare to finalize.
pub struct UploadOrchestrator<'a, S: RemoteStore + ?Sized> {
    store: &'a S,
    settings: UploadSettings,
    poller: CompletionPoller,
}

impl<'a, S: RemoteStore + ?Sized> UploadOrchestrator<'a, S> {
    pub fn new(store: &'a S, settings: UploadSettings, poller: CompletionPoller) -> Self {
        Self {
            store,
            settings,
            poller,
        }
    }

    /// Build an orchestrator from the loaded configuration.
    pub fn from_config(store: &'a S, config: &BackupConfig) -> Self {
        let poller = CompletionPoller::new(
            config.poll.attempts,
            config.poll.interval(),
            config.poll.vocabulary(),
        );
        Self::new(store, UploadSettings::from(&config.remote), poller)
    }

    /// Run the whole cycle for `archive`.
    pub fn run(&self, archive: Archive) -> CycleOutcome {
        let custom_id = custom_id_for(archive.created_at);
        let mut session = match self.prepare(archive, custom_id) {
            Ok(session) => session,
            Err((archive, err)) => {
                error!(
                    archive = %archive.path.display(),
                    error = %err,
                    "could not prepare upload; keeping local archive"
                );
                return CycleOutcome::Failed {
                    stage: FailedStage::Prepare,
                    archive: archive.path,
                    reason: err.to_string(),
                };
            }
        };

        let outcome = self.transfer(&mut session);
        let resolution = self.resolve(&mut session, outcome);
        self.finalize(session, resolution)
    }

    /// Request a single-use upload target. On failure the archive is
    /// handed back untouched.
    pub fn prepare(
        &self,
        archive: Archive,
        custom_id: String,
    ) -> Result<UploadSession, (Archive, RemoteError)> {
        let request = PrepareRequest {
            file_name: archive.filename.clone(),
            file_size: archive.size_bytes,
            slug: self.settings.slug.clone(),
            file_type: ARCHIVE_MIME_TYPE.to_string(),
            custom_id: custom_id.clone(),
            content_disposition: self.settings.content_disposition.clone(),
            acl: self.settings.acl.clone(),
            expires_in_secs: self.settings.expires_in_secs,
        };

        match self.store.prepare_upload(&request) {
            Ok(target) => {
                info!(
                    archive = %archive.filename,
                    key = %target.remote_key,
                    custom_id = %custom_id,
                    size = %format_bytes(archive.size_bytes),
                    "upload prepared"
                );
                Ok(UploadSession::new(archive, custom_id, target))
            }
            Err(err) => Err((archive, err)),
        }
    }

    /// Send the bytes. The session's upload URL is consumed here.
    pub fn transfer(&self, session: &mut UploadSession) -> TransferOutcome {
        let Some(url) = session.take_upload_url() else {
            session.state = SessionState::Failed;
            return TransferOutcome::Failed(TransferFailure::Transport(
                "upload URL already used".to_string(),
            ));
        };

        session.state = SessionState::Transferring;
        let outcome = self.store.transfer(url, &session.archive);

        match &outcome {
            TransferOutcome::Confirmed { url: Some(url) } => {
                info!(key = %session.remote_key, url = %url, "transfer confirmed with file URL");
            }
            TransferOutcome::Confirmed { url: None } => {
                info!(key = %session.remote_key, "transfer confirmed; waiting for processing");
            }
            TransferOutcome::Indeterminate(cause) => {
                warn!(
                    key = %session.remote_key,
                    cause = %cause,
                    "transfer outcome unknown; bytes may have arrived, asking the remote store"
                );
            }
            TransferOutcome::Failed(failure) => {
                error!(key = %session.remote_key, error = %failure, "transfer failed");
            }
        }
        outcome
    }

    /// Turn a transfer outcome into a definite resolution, polling when the
    /// transfer alone cannot tell.
    pub fn resolve(&self, session: &mut UploadSession, outcome: TransferOutcome) -> Resolution {
        let resolution = match outcome {
            TransferOutcome::Confirmed { url: Some(url) } => Resolution::Complete {
                url: Some(url),
                confirmation: Confirmation::Transfer,
            },
            TransferOutcome::Confirmed { url: None } | TransferOutcome::Indeterminate(_) => {
                session.state = SessionState::AwaitingConfirmation;
                match self.poller.poll(self.store, &session.remote_key, None) {
                    PollOutcome::Completed { url, attempts, .. } => Resolution::Complete {
                        url,
                        confirmation: Confirmation::Poll { attempts },
                    },
                    PollOutcome::Unresolved {
                        attempts,
                        last_status,
                        ..
                    } => Resolution::Unresolved {
                        attempts,
                        last_status,
                    },
                }
            }
            TransferOutcome::Failed(failure) => Resolution::Failed(failure),
        };

        session.state = match resolution {
            Resolution::Complete { .. } => SessionState::Complete,
            Resolution::Unresolved { .. } => SessionState::Unresolved,
            Resolution::Failed(_) => SessionState::Failed,
        };
        resolution
    }

    /// Delete the local archive on completion; keep it otherwise.
    pub fn finalize(&self, session: UploadSession, resolution: Resolution) -> CycleOutcome {
        let UploadSession {
            archive,
            remote_key,
            ..
        } = session;

        match resolution {
            Resolution::Complete { url, confirmation } => {
                match &url {
                    Some(url) => info!(key = %remote_key, url = %url, ?confirmation, "backup stored remotely"),
                    None => warn!(
                        key = %remote_key,
                        ?confirmation,
                        "backup stored remotely but its URL is unknown"
                    ),
                }
                let local_deleted = match std::fs::remove_file(&archive.path) {
                    Ok(()) => {
                        info!(archive = %archive.path.display(), "local archive deleted");
                        true
                    }
                    Err(e) => {
                        error!(
                            archive = %archive.path.display(),
                            error = %e,
                            "upload confirmed but the local archive could not be deleted"
                        );
                        false
                    }
                };
                CycleOutcome::Uploaded {
                    remote_key,
                    url,
                    archive: archive.path,
                    local_deleted,
                }
            }
            Resolution::Unresolved {
                attempts,
                last_status,
            } => {
                error!(
                    key = %remote_key,
                    attempts,
                    last_status = last_status.as_deref().unwrap_or("<none>"),
                    archive = %archive.path.display(),
                    "upload unresolved after polling; it may still exist remotely, keeping local archive"
                );
                CycleOutcome::Retained {
                    remote_key,
                    archive: archive.path,
                    attempts,
                    last_status,
                }
            }
            Resolution::Failed(failure) => {
                error!(
                    key = %remote_key,
                    error = %failure,
                    archive = %archive.path.display(),
                    "upload failed; keeping local archive for manual inspection"
                );
                CycleOutcome::Failed {
                    stage: FailedStage::Transfer,
                    archive: archive.path,
                    reason: failure.to_string(),
                }
            }
        }
    }
}

/// Identifier sent as `customId`: the backup timestamp plus a random suffix,
/// so reruns for the same timestamp never collide.
pub fn custom_id_for(created_at: DateTime<Local>) -> String {
    format!(
        "backup-{}-{:08x}",
        created_at.format("%Y%m%d%H%M%S"),
        rand::random::<u32>()
    )
}
