//! Archive creation.
//!
//! Archives are produced by the system `tar` binary and named
//! `<prefix>YYYY-MM-DD_HH-MM-SS.tar.gz` so that lexical order and creation
//! order agree.

use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Local};
use thiserror::Error;

/// Extension shared by every archive.
pub const ARCHIVE_EXTENSION: &str = ".tar.gz";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Errors that abort a cycle before any network interaction.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("source directory does not exist or is not a directory: {0}")]
    SourceMissing(PathBuf),

    #[error("tar executable not found on PATH")]
    TarNotFound,

    #[error("failed to prepare archive directory {path}: {source}")]
    ArchiveDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to run tar: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("tar exited with {status}: {stderr}")]
    TarFailed { status: String, stderr: String },

    #[error("failed to stat archive {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archive {0} is empty")]
    Empty(PathBuf),
}

/// One compressed snapshot of the source tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    pub path: PathBuf,
    pub filename: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Local>,
}

impl Archive {
    /// Describe an archive already on disk, reading its exact size.
    pub fn from_path(path: &Path, created_at: DateTime<Local>) -> Result<Self, ArchiveError> {
        let meta = std::fs::metadata(path).map_err(|source| ArchiveError::Stat {
            path: path.to_path_buf(),
            source,
        })?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            path: path.to_path_buf(),
            filename,
            size_bytes: meta.len(),
            created_at,
        })
    }
}

/// File naming shared by the archiver and local retention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveNaming {
    prefix: String,
}

impl ArchiveNaming {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn file_name(&self, at: DateTime<Local>) -> String {
        format!("{}{}{}", self.prefix, at.format(TIMESTAMP_FORMAT), ARCHIVE_EXTENSION)
    }

    /// Glob pattern matching every archive with this prefix.
    pub fn pattern(&self) -> Result<glob::Pattern, glob::PatternError> {
        let raw = format!("{}*{}", glob::Pattern::escape(&self.prefix), ARCHIVE_EXTENSION);
        glob::Pattern::new(&raw)
    }
}

/// Packages a source directory into a single artifact.
pub trait Archiver {
    fn create(
        &self,
        source: &Path,
        dest_dir: &Path,
        at: DateTime<Local>,
    ) -> Result<Archive, ArchiveError>;
}

/// Archiver backed by `tar -czf`.
#[derive(Debug, Clone)]
pub struct TarArchiver {
    naming: ArchiveNaming,
    exclude: Vec<String>,
}

impl TarArchiver {
    pub fn new(naming: ArchiveNaming) -> Self {
        Self {
            naming,
            exclude: Vec::new(),
        }
    }

    /// Add patterns passed to tar as `--exclude=<pattern>`.
    pub fn with_excludes(mut self, patterns: impl IntoIterator<Item = String>) -> Self {
        self.exclude.extend(patterns);
        self
    }

    fn command_args(&self, source: &Path, output: &Path) -> Vec<String> {
        let mut args = vec![
            "-czf".to_string(),
            output.to_string_lossy().into_owned(),
        ];
        for pattern in &self.exclude {
            args.push(format!("--exclude={pattern}"));
        }
        match (source.parent(), source.file_name()) {
            (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => {
                args.push("-C".to_string());
                args.push(parent.to_string_lossy().into_owned());
                args.push(name.to_string_lossy().into_owned());
            }
            _ => {
                args.push("-C".to_string());
                args.push(source.to_string_lossy().into_owned());
                args.push(".".to_string());
            }
        }
        args
    }
}

impl Archiver for TarArchiver {
    fn create(
        &self,
        source: &Path,
        dest_dir: &Path,
        at: DateTime<Local>,
    ) -> Result<Archive, ArchiveError> {
        if !source.is_dir() {
            return Err(ArchiveError::SourceMissing(source.to_path_buf()));
        }
        let tar = which::which("tar").map_err(|_| ArchiveError::TarNotFound)?;

        std::fs::create_dir_all(dest_dir).map_err(|source| ArchiveError::ArchiveDir {
            path: dest_dir.to_path_buf(),
            source,
        })?;

        if dest_dir.starts_with(source) {
            tracing::warn!(
                source = %source.display(),
                archive_dir = %dest_dir.display(),
                "archive directory is inside the source tree; earlier archives will be included"
            );
        }

        let output = dest_dir.join(self.naming.file_name(at));
        let args = self.command_args(source, &output);

        tracing::debug!(tar = %tar.display(), ?args, "starting tar");

        let result = Command::new(&tar)
            .args(&args)
            .output()
            .map_err(ArchiveError::Spawn)?;

        if !result.status.success() {
            let _ = std::fs::remove_file(&output);
            return Err(ArchiveError::TarFailed {
                status: result.status.to_string(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }

        let archive = Archive::from_path(&output, at)?;
        if archive.size_bytes == 0 {
            return Err(ArchiveError::Empty(output));
        }

        tracing::info!(
            archive = %archive.filename,
            bytes = archive.size_bytes,
            size = %format_bytes(archive.size_bytes),
            "archive created"
        );
        Ok(archive)
    }
}

/// Render a byte count with binary units, e.g. `1.5 MiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}
