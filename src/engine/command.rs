//! Command handler: run an external executable for each claimed record.
//!
//! The executable sees the record through environment variables:
//! `WORKPOOL_WORK_TYPE`, `WORKPOOL_REFERENCE_ID`, `WORKPOOL_WORK_ID`, and
//! `WORKPOOL_PAYLOAD` (JSON). Exit status 0 means done, anything else means
//! retry. A JSON object on stdout such as
//! `{"done": false, "next_time": "2025-01-01T00:00:00Z"}` overrides that.

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use super::handler::WorkHandler;
use crate::error::{Error, Result};
use crate::model::{WorkOutcome, WorkRecord};

/// Handler that shells out to `command` for `serde_json::Value` payloads.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    work_type: String,
    command: PathBuf,
    args: Vec<String>,
}

/// Optional verdict printed on stdout.
#[derive(Debug, Deserialize)]
struct Verdict {
    done: Option<bool>,
    next_time: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl CommandHandler {
    pub fn new(work_type: impl Into<String>, command: impl Into<PathBuf>) -> Self {
        Self {
            work_type: work_type.into(),
            command: command.into(),
            args: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Resolve relative commands against the process CWD.
    fn resolved_command(&self) -> Result<PathBuf> {
        let is_bare_name = self.command.components().count() == 1;
        if self.command.is_relative() && !is_bare_name {
            Ok(std::env::current_dir()?.join(&self.command))
        } else {
            // Absolute, or a bare name looked up on PATH.
            Ok(self.command.clone())
        }
    }

    async fn run(&self, record: &WorkRecord<serde_json::Value>) -> Result<WorkOutcome> {
        let command = self.resolved_command()?;
        debug!(
            command = %command.display(),
            reference_id = %record.reference_id,
            "running work command"
        );

        let output = Command::new(&command)
            .args(&self.args)
            .env("WORKPOOL_WORK_TYPE", &self.work_type)
            .env("WORKPOOL_REFERENCE_ID", &record.reference_id)
            .env("WORKPOOL_WORK_ID", record.id.0.to_string())
            .env("WORKPOOL_PAYLOAD", serde_json::to_string(&record.payload)?)
            .kill_on_drop(true)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let verdict = parse_verdict(&stdout);
        let exit_ok = output.status.success();

        let mut outcome = WorkOutcome {
            done: verdict.as_ref().and_then(|v| v.done).unwrap_or(exit_ok),
            next_time: verdict.as_ref().and_then(|v| v.next_time),
            error: verdict.and_then(|v| v.error),
        };
        if !exit_ok && outcome.error.is_none() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            outcome.error = Some(format!(
                "{} exited with status {}: {}",
                command_name(&command),
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ));
        }
        Ok(outcome)
    }
}

#[async_trait]
impl WorkHandler<serde_json::Value> for CommandHandler {
    async fn handle(&self, record: &WorkRecord<serde_json::Value>) -> WorkOutcome {
        let started = Instant::now();
        match self.run(record).await {
            Ok(outcome) => {
                info!(
                    reference_id = %record.reference_id,
                    done = outcome.done,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "work command finished"
                );
                outcome
            }
            Err(e) => WorkOutcome::retry().with_error(Error::Handler(format!(
                "cannot run {}: {e}",
                self.command.display()
            ))),
        }
    }
}

/// The last non-empty stdout line, if it is a JSON verdict object.
fn parse_verdict(stdout: &str) -> Option<Verdict> {
    let line = stdout.lines().rev().find(|l| !l.trim().is_empty())?;
    serde_json::from_str(line.trim()).ok()
}

fn command_name(command: &Path) -> String {
    command
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| command.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_is_read_from_last_line() {
        let verdict = parse_verdict("working...\n{\"done\": false}\n\n").unwrap();
        assert_eq!(verdict.done, Some(false));
        assert!(verdict.next_time.is_none());
    }

    #[test]
    fn plain_output_has_no_verdict() {
        assert!(parse_verdict("all good\n").is_none());
        assert!(parse_verdict("").is_none());
    }

    #[test]
    fn bare_names_are_left_for_path_lookup() {
        let handler = CommandHandler::new("mail", "sh");
        assert_eq!(handler.resolved_command().unwrap(), PathBuf::from("sh"));
    }
}
