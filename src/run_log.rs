//! Append-only journal of a single deploy or cleanup run.
//!
//! One JSON object per line. The file is created exclusively and named after
//! the run start time, so an earlier run's log is never overwritten. Entries
//! are flushed as they are appended: a crash mid-command still leaves the
//! `command_issued` record of whatever was in flight.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs_utf8::{Dir, File, OpenOptions};
use cap_std::ambient_authority;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Captured output kept per step; older bytes are dropped.
const MAX_OUTPUT_CHARS: usize = 8 * 1024;
const MAX_NAME_ATTEMPTS: u32 = 100;

/// Terminal status of one step.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// The step ran and succeeded.
    Success,
    /// The step's precondition probe showed its effect was already present.
    SkippedAlreadySatisfied,
    /// The step failed after its allowed attempts.
    Failed,
}

impl StepStatus {
    /// Returns `true` for `Success` and `SkippedAlreadySatisfied`.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Success | Self::SkippedAlreadySatisfied)
    }
}

/// Outcome of one plan step.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct StepResult {
    /// Identifier of the step within its plan.
    pub step_id: String,
    /// Terminal status.
    pub status: StepStatus,
    /// Remote exit code of the last attempt, when one was observed.
    pub exit_code: Option<i32>,
    /// Whether the last attempt hit the per-command timeout.
    pub timed_out: bool,
    /// Tail of the captured output (stdout then stderr).
    pub output: String,
    /// Wall-clock time across all attempts.
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    /// Number of attempts made.
    pub attempts: u32,
}

fn as_millis<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}

/// Keeps the trailing `MAX_OUTPUT_CHARS` characters of `text`.
#[must_use]
pub fn output_tail(text: &str) -> String {
    let count = text.chars().count();
    if count <= MAX_OUTPUT_CHARS {
        return text.to_owned();
    }
    text.chars().skip(count - MAX_OUTPUT_CHARS).collect()
}

/// A record in the journal.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunLogRecord {
    /// First record of every run.
    RunStarted {
        /// Unique run identifier.
        run_id: Uuid,
        /// `deploy` or `cleanup`.
        operation: String,
        /// Application name.
        app: String,
        /// Target host.
        host: String,
    },
    /// A remote command is about to be sent.
    CommandIssued {
        /// Step (or probe) on whose behalf the command runs.
        step_id: String,
        /// Rendered command line.
        command: String,
    },
    /// A step reached its terminal status.
    StepFinished(StepResult),
    /// Last record of a run.
    RunFinished {
        /// One-line classification of the run.
        summary: String,
    },
}

/// A timestamped journal record.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct RunLogEntry {
    /// When the record was appended.
    pub at: DateTime<Utc>,
    /// The record itself.
    #[serde(flatten)]
    pub record: RunLogRecord,
}

/// Errors raised while creating the journal file.
#[derive(Debug, Error)]
pub enum RunLogError {
    /// Raised when the log directory or file cannot be created.
    #[error("failed to create run log in {path}: {message}")]
    Create {
        /// Directory or file that could not be created.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
}

#[derive(Debug, Default)]
struct Journal {
    entries: Vec<RunLogEntry>,
    file: Option<File>,
    write_error: Option<String>,
}

/// Shared handle to the journal of the current run.
///
/// Clones append to the same journal.
#[derive(Clone, Debug)]
pub struct RunLog {
    journal: Arc<Mutex<Journal>>,
    path: Option<Utf8PathBuf>,
}

impl RunLog {
    /// Journal kept only in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            journal: Arc::new(Mutex::new(Journal::default())),
            path: None,
        }
    }

    /// Creates `run-<timestamp>.jsonl` inside `dir`, never reusing a name.
    ///
    /// # Errors
    ///
    /// Returns [`RunLogError::Create`] when the directory cannot be created or
    /// no unused file name could be opened.
    pub fn create(dir: &Utf8Path, started_at: DateTime<Utc>) -> Result<Self, RunLogError> {
        Dir::create_ambient_dir_all(dir, ambient_authority()).map_err(|err| {
            RunLogError::Create {
                path: dir.to_path_buf(),
                message: err.to_string(),
            }
        })?;
        let handle =
            Dir::open_ambient_dir(dir, ambient_authority()).map_err(|err| RunLogError::Create {
                path: dir.to_path_buf(),
                message: err.to_string(),
            })?;

        let stem = format!("run-{}", started_at.format("%Y%m%dT%H%M%SZ"));
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = if attempt == 0 {
                format!("{stem}.jsonl")
            } else {
                format!("{stem}-{attempt}.jsonl")
            };
            match handle.open_with(&name, &options) {
                Ok(file) => {
                    return Ok(Self {
                        journal: Arc::new(Mutex::new(Journal {
                            file: Some(file),
                            ..Journal::default()
                        })),
                        path: Some(dir.join(name)),
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(err) => {
                    return Err(RunLogError::Create {
                        path: dir.join(name),
                        message: err.to_string(),
                    });
                }
            }
        }

        Err(RunLogError::Create {
            path: dir.join(format!("{stem}.jsonl")),
            message: String::from("every candidate file name is already taken"),
        })
    }

    /// Location of the journal file, if persisted.
    #[must_use]
    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    /// Appends a record stamped with the current time.
    pub fn append(&self, record: RunLogRecord) {
        let entry = RunLogEntry {
            at: Utc::now(),
            record,
        };
        let mut journal = self.journal.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(file) = journal.file.as_mut()
            && let Err(err) = write_line(file, &entry)
        {
            warn!(error = %err, "failed to persist run log entry");
            if journal.write_error.is_none() {
                journal.write_error = Some(err.to_string());
            }
        }
        journal.entries.push(entry);
    }

    /// Records a command that is about to be sent.
    pub fn command_issued(&self, step_id: &str, command: &str) {
        self.append(RunLogRecord::CommandIssued {
            step_id: step_id.to_owned(),
            command: command.to_owned(),
        });
    }

    /// Records a finished step.
    pub fn step_finished(&self, result: &StepResult) {
        self.append(RunLogRecord::StepFinished(result.clone()));
    }

    /// Snapshot of every entry appended so far.
    #[must_use]
    pub fn entries(&self) -> Vec<RunLogEntry> {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clone()
    }

    /// Rendered commands recorded so far, in order.
    #[must_use]
    pub fn issued_commands(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|entry| match entry.record {
                RunLogRecord::CommandIssued { command, .. } => Some(command),
                _ => None,
            })
            .collect()
    }

    /// First persistence error, if any append failed to reach disk.
    #[must_use]
    pub fn write_error(&self) -> Option<String> {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write_error
            .clone()
    }
}

fn write_line(file: &mut File, entry: &RunLogEntry) -> io::Result<()> {
    let mut line = serde_json::to_string(entry).map_err(io::Error::other)?;
    line.push('\n');
    file.write_all(line.as_bytes())?;
    file.flush()
}
