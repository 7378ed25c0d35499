//! Cron registration.
//!
//! Managed crontab lines end with a `# offsite-backup:<kind>` marker so that
//! installing again replaces them and removal leaves every other line alone.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;

const MARKER_PREFIX: &str = "# offsite-backup:";

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("failed to run crontab: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("crontab exited with {status}: {stderr}")]
    Crontab { status: String, stderr: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Backup,
    Prune,
}

impl JobKind {
    pub fn subcommand(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Prune => "prune",
        }
    }

    fn marker(self) -> String {
        format!("{MARKER_PREFIX}{}", self.subcommand())
    }
}

/// One managed crontab entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronJob {
    pub kind: JobKind,
    pub expression: String,
    pub executable: PathBuf,
    pub config: Option<PathBuf>,
}

impl CronJob {
    pub fn new(
        kind: JobKind,
        expression: impl Into<String>,
        executable: impl Into<PathBuf>,
        config: Option<PathBuf>,
    ) -> Result<Self, ScheduleError> {
        let expression = expression.into().trim().to_string();
        validate_expression(&expression)?;
        Ok(Self {
            kind,
            expression,
            executable: executable.into(),
            config,
        })
    }

    /// The crontab line, marker included.
    pub fn render(&self) -> String {
        let mut words = vec![quote_path(&self.executable)];
        if let Some(config) = &self.config {
            words.push("--config".to_string());
            words.push(quote_path(config));
        }
        words.push(self.kind.subcommand().to_string());
        format!("{} {} {}", self.expression, words.join(" "), self.kind.marker())
    }
}

fn quote_path(path: &Path) -> String {
    shell_words::quote(&path.to_string_lossy()).into_owned()
}

/// Accept five whitespace-separated fields or an `@` shorthand.
pub fn validate_expression(expression: &str) -> Result<(), ScheduleError> {
    const SHORTHANDS: [&str; 8] = [
        "@reboot", "@yearly", "@annually", "@monthly", "@weekly", "@daily", "@midnight", "@hourly",
    ];
    let invalid = |reason: &str| ScheduleError::InvalidExpression {
        expression: expression.to_string(),
        reason: reason.to_string(),
    };

    if expression.starts_with('@') {
        return if SHORTHANDS.contains(&expression) {
            Ok(())
        } else {
            Err(invalid("unknown @ shorthand"))
        };
    }

    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(invalid("expected five fields"));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '*' | '/' | ',' | '-');
    if fields.iter().any(|f| !f.chars().all(allowed)) {
        return Err(invalid("unexpected character"));
    }
    Ok(())
}

/// Drop every managed line from `existing`.
pub fn strip_managed(existing: &str) -> String {
    let mut out = String::new();
    for line in existing
        .lines()
        .filter(|line| !line.trim_end().contains(MARKER_PREFIX))
    {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Replace managed lines in `existing` with `jobs`, keeping everything else.
pub fn merge_crontab(existing: &str, jobs: &[CronJob]) -> String {
    let mut out = strip_managed(existing);
    for job in jobs {
        out.push_str(&job.render());
        out.push('\n');
    }
    out
}

/// Current user crontab; an absent crontab reads as empty.
pub fn read_crontab() -> Result<String, ScheduleError> {
    let output = Command::new("crontab")
        .arg("-l")
        .output()
        .map_err(ScheduleError::Spawn)?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("no crontab for") {
        return Ok(String::new());
    }
    Err(ScheduleError::Crontab {
        status: output.status.to_string(),
        stderr: stderr.trim().to_string(),
    })
}

/// Replace the user crontab with `contents`.
pub fn write_crontab(contents: &str) -> Result<(), ScheduleError> {
    let mut child = Command::new("crontab")
        .arg("-")
        .stdin(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(ScheduleError::Spawn)?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(contents.as_bytes())
            .map_err(ScheduleError::Spawn)?;
    }

    let output = child.wait_with_output().map_err(ScheduleError::Spawn)?;
    if !output.status.success() {
        return Err(ScheduleError::Crontab {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(kind: JobKind, expr: &str) -> CronJob {
        CronJob::new(kind, expr, "/usr/local/bin/offsite", None).unwrap()
    }

    #[test]
    fn render_includes_marker_and_quoted_paths() {
        let job = CronJob::new(
            JobKind::Backup,
            "0 3 * * *",
            "/opt/my tools/offsite",
            Some(PathBuf::from("/etc/offsite.toml")),
        )
        .unwrap();
        assert_eq!(
            job.render(),
            "0 3 * * * '/opt/my tools/offsite' --config /etc/offsite.toml backup # offsite-backup:backup"
        );
    }

    #[test]
    fn merge_replaces_managed_lines_only() {
        let existing = "MAILTO=ops@example.com\n\
                        15 * * * * /usr/bin/other-job\n\
                        0 1 * * * /old/offsite backup # offsite-backup:backup\n";
        let merged = merge_crontab(
            existing,
            &[job(JobKind::Backup, "0 3 * * *"), job(JobKind::Prune, "30 4 * * *")],
        );

        assert!(merged.contains("MAILTO=ops@example.com"));
        assert!(merged.contains("/usr/bin/other-job"));
        assert!(!merged.contains("/old/offsite"));
        assert_eq!(merged.matches("# offsite-backup:backup").count(), 1);
        assert_eq!(merged.matches("# offsite-backup:prune").count(), 1);
        assert!(merged.ends_with('\n'));
    }

    #[test]
    fn merge_is_idempotent() {
        let jobs = [job(JobKind::Backup, "0 3 * * *"), job(JobKind::Prune, "30 4 * * *")];
        let once = merge_crontab("", &jobs);
        let twice = merge_crontab(&once, &jobs);
        assert_eq!(once, twice);
    }

    #[test]
    fn strip_removes_all_managed_lines() {
        let merged = merge_crontab("@reboot /bin/true\n", &[job(JobKind::Backup, "@daily")]);
        assert_eq!(strip_managed(&merged), "@reboot /bin/true\n");
    }

    #[test]
    fn expressions_are_validated() {
        assert!(validate_expression("*/15 2-4 * * mon-fri").is_ok());
        assert!(validate_expression("@hourly").is_ok());
        assert!(validate_expression("@sometimes").is_err());
        assert!(validate_expression("0 3 * *").is_err());
        assert!(validate_expression("0 3 * * *; rm -rf /").is_err());
        assert!(CronJob::new(JobKind::Prune, "bogus", "/bin/offsite", None).is_err());
    }
}
