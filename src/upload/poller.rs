//! Completion polling.
//!
//! Resolves an unconfirmed transfer by asking the remote store for the
//! processing status of a key, a fixed number of times with a fixed delay in
//! between. The first attempt runs immediately.

use std::collections::BTreeSet;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::remote::RemoteStore;

/// Statuses the remote store has been seen to report for a finished upload.
pub const DEFAULT_SUCCESS_TOKENS: [&str; 7] = [
    "Uploaded",
    "uploaded",
    "Completed",
    "Processed",
    "AVAILABLE",
    "complete",
    "done",
];

/// How a status string relates to the success vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMatch {
    Success,
    /// Equal to a success token only once ASCII case or surrounding
    /// whitespace is ignored.
    NearMiss,
    Pending,
}

/// Case-sensitive set of terminal-success statuses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuccessVocabulary {
    tokens: BTreeSet<String>,
}

impl Default for SuccessVocabulary {
    fn default() -> Self {
        Self::new(DEFAULT_SUCCESS_TOKENS.iter().map(|t| t.to_string()))
    }
}

impl SuccessVocabulary {
    /// Blank tokens are ignored; surrounding whitespace is trimmed.
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: tokens
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    /// Membership is exact; the status is not trimmed.
    pub fn classify(&self, status: &str) -> StatusMatch {
        let trimmed = status.trim();
        if self.tokens.contains(status) {
            StatusMatch::Success
        } else if !trimmed.is_empty()
            && self.tokens.iter().any(|t| t.eq_ignore_ascii_case(trimmed))
        {
            StatusMatch::NearMiss
        } else {
            StatusMatch::Pending
        }
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(String::as_str)
    }
}

/// Terminal state of one polling run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Completed {
        url: Option<String>,
        status: String,
        attempts: u32,
    },
    /// Budget exhausted without a success token.
    Unresolved {
        attempts: u32,
        last_status: Option<String>,
        near_misses: Vec<String>,
        query_failures: u32,
    },
}

/// Bounded, fixed-interval status poller.
#[derive(Debug, Clone)]
pub struct CompletionPoller {
    attempts: u32,
    interval: Duration,
    vocabulary: SuccessVocabulary,
}

impl CompletionPoller {
    pub fn new(attempts: u32, interval: Duration, vocabulary: SuccessVocabulary) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
            vocabulary,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Poll `remote_key` until a success token or the budget runs out.
    ///
    /// `known_url` is a URL learned earlier in the cycle; a non-empty URL in
    /// the successful poll response replaces it.
    pub fn poll<S: RemoteStore + ?Sized>(
        &self,
        store: &S,
        remote_key: &str,
        known_url: Option<String>,
    ) -> PollOutcome {
        let mut last_status = None;
        let mut near_misses: Vec<String> = Vec::new();
        let mut query_failures = 0;

        for attempt in 1..=self.attempts {
            if attempt > 1 && !self.interval.is_zero() {
                thread::sleep(self.interval);
            }

            let result = match store.poll_status(remote_key) {
                Ok(result) => result,
                Err(e) => {
                    query_failures += 1;
                    warn!(
                        key = remote_key,
                        attempt,
                        max_attempts = self.attempts,
                        error = %e,
                        "status query failed"
                    );
                    continue;
                }
            };

            match self.vocabulary.classify(&result.status) {
                StatusMatch::Success => {
                    let url = result
                        .file_url
                        .filter(|u| !u.trim().is_empty())
                        .or(known_url);
                    if url.is_none() {
                        warn!(
                            key = remote_key,
                            status = %result.status,
                            "remote store reports completion but no file URL"
                        );
                    }
                    info!(key = remote_key, status = %result.status, attempt, "upload processing complete");
                    return PollOutcome::Completed {
                        url,
                        status: result.status,
                        attempts: attempt,
                    };
                }
                StatusMatch::NearMiss => {
                    warn!(
                        key = remote_key,
                        status = %result.status,
                        attempt,
                        "status resembles a success token but differs in case or surrounding whitespace; treating as pending (add it to poll.success_tokens if it means done)"
                    );
                    if !near_misses.contains(&result.status) {
                        near_misses.push(result.status.clone());
                    }
                }
                StatusMatch::Pending => {
                    info!(
                        key = remote_key,
                        status = %result.status,
                        attempt,
                        max_attempts = self.attempts,
                        "upload still processing"
                    );
                }
            }
            last_status = Some(result.status);
        }

        PollOutcome::Unresolved {
            attempts: self.attempts,
            last_status,
            near_misses,
            query_failures,
        }
    }
}
