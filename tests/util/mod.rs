//! Shared helpers; each test binary uses a different subset.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{Local, TimeZone};
use offsite_backup::archive::Archive;
use offsite_backup::remote::{
    DeleteResult, PollResult, PrepareRequest, RemoteError, RemoteFile, RemoteStore,
    TransferOutcome, UploadTarget, UploadUrl,
};

/// Records formatted log lines emitted while its guard is alive.
#[derive(Clone, Default)]
pub struct LogCapture {
    lines: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let capture = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_target(false)
            .with_writer(move || capture.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.lines.lock().unwrap()).into_owned()
    }

    pub fn assert_logged(&self, needle: &str) {
        let text = self.text();
        assert!(text.contains(needle), "no log line contains `{needle}`:\n{text}");
    }
}

impl Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lines.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A request the fake store received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Prepare(PrepareRequest),
    Transfer(String),
    Poll(String),
    List,
    Delete(Vec<String>),
}

/// Scripted in-memory [`RemoteStore`] that records every call.
pub struct FakeStore {
    pub remote_key: String,
    pub upload_url: String,
    /// When set, prepare fails with this HTTP status.
    pub prepare_status: Option<u16>,
    pub transfer: TransferOutcome,
    /// Returned in order; once empty every poll reports "still working".
    pub polls: RefCell<VecDeque<PollResult>>,
    pub files: RefCell<Vec<RemoteFile>>,
    /// When set, listing fails with this HTTP status.
    pub list_status: Option<u16>,
    /// When set, deletion fails with this HTTP status.
    pub delete_status: Option<u16>,
    /// Overrides the default confirmed deletion.
    pub delete_result: Option<DeleteResult>,
    pub calls: RefCell<Vec<Call>>,
}

impl FakeStore {
    pub fn new(transfer: TransferOutcome) -> Self {
        Self {
            remote_key: "key-1".to_string(),
            upload_url: "https://ingest.test/up/key-1?sig=abc".to_string(),
            prepare_status: None,
            transfer,
            polls: RefCell::new(VecDeque::new()),
            files: RefCell::new(Vec::new()),
            list_status: None,
            delete_status: None,
            delete_result: None,
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn with_polls(self, polls: &[(&str, Option<&str>)]) -> Self {
        *self.polls.borrow_mut() = polls
            .iter()
            .map(|(status, url)| PollResult {
                status: status.to_string(),
                file_url: url.map(str::to_string),
            })
            .collect();
        self
    }

    pub fn with_files(self, files: Vec<RemoteFile>) -> Self {
        *self.files.borrow_mut() = files;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn poll_keys(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Poll(key) => Some(key),
                _ => None,
            })
            .collect()
    }

    pub fn delete_calls(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Delete(keys) => Some(keys),
                _ => None,
            })
            .collect()
    }
}

impl RemoteStore for FakeStore {
    fn prepare_upload(&self, request: &PrepareRequest) -> Result<UploadTarget, RemoteError> {
        self.calls.borrow_mut().push(Call::Prepare(request.clone()));
        scripted_failure("prepareUpload", self.prepare_status)?;
        Ok(UploadTarget {
            remote_key: self.remote_key.clone(),
            upload_url: UploadUrl::new(self.upload_url.clone()),
        })
    }

    fn transfer(&self, url: UploadUrl, _archive: &Archive) -> TransferOutcome {
        self.calls.borrow_mut().push(Call::Transfer(url.into_string()));
        self.transfer.clone()
    }

    fn poll_status(&self, remote_key: &str) -> Result<PollResult, RemoteError> {
        self.calls.borrow_mut().push(Call::Poll(remote_key.to_string()));
        Ok(self.polls.borrow_mut().pop_front().unwrap_or(PollResult {
            status: "still working".to_string(),
            file_url: None,
        }))
    }

    fn list_files(&self) -> Result<Vec<RemoteFile>, RemoteError> {
        self.calls.borrow_mut().push(Call::List);
        scripted_failure("listFiles", self.list_status)?;
        Ok(self.files.borrow().clone())
    }

    fn delete_files(&self, keys: &[String]) -> Result<DeleteResult, RemoteError> {
        self.calls.borrow_mut().push(Call::Delete(keys.to_vec()));
        scripted_failure("deleteFiles", self.delete_status)?;
        if let Some(result) = self.delete_result {
            return Ok(result);
        }
        let mut files = self.files.borrow_mut();
        let before = files.len();
        files.retain(|f| !keys.contains(&f.key));
        Ok(DeleteResult {
            success: true,
            deleted_count: (before - files.len()) as u64,
        })
    }
}

fn scripted_failure(endpoint: &'static str, status: Option<u16>) -> Result<(), RemoteError> {
    match status {
        Some(status) => Err(RemoteError::Status {
            endpoint,
            status,
            body: "scripted failure".to_string(),
        }),
        None => Ok(()),
    }
}

/// Write a small archive-shaped file into `dir`.
pub fn archive_fixture(dir: &Path, name: &str) -> Archive {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, b"\x1f\x8b fake gzip payload").unwrap();
    let created_at = Local.with_ymd_and_hms(2025, 3, 14, 3, 0, 0).unwrap();
    Archive::from_path(&path, created_at).unwrap()
}

pub fn remote_file(key: &str, uploaded_at: Option<i64>) -> RemoteFile {
    RemoteFile {
        key: key.to_string(),
        name: format!("backup_{key}.tar.gz"),
        uploaded_at,
    }
}
