//! Lifecycle journal of a request.
//!
//! Every line goes to the in-memory message log. When persistence is enabled
//! the same lines are mirrored to `<target>.log`, flushed after each write so
//! the file shows up-to-date progress while the request runs.

use crate::remote::ResultMetadata;
use datafetch_core::{FetchError, RequestStatus, Result, ServiceAddress};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Extension appended to the target to name its log file.
pub const LOG_EXTENSION: &str = "log";

/// Section headers, in the order they appear.
pub mod section {
    /// Request echo
    pub const REQUEST: &str = "=== REQUEST ===";
    /// Raw server lines
    pub const SERVER: &str = "=== SERVER ===";
    /// Failure detail
    pub const ERROR: &str = "=== ERROR ===";
    /// Messages attached to the result
    pub const MARS: &str = "=== MARS ===";
    /// Result metadata
    pub const OUTPUT: &str = "=== OUTPUT ===";
    /// Time to each status
    pub const ELAPSED: &str = "=== ELAPSED ===";
}

/// Path of the log file that belongs to `target`.
pub fn log_path_for(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".");
    name.push(LOG_EXTENSION);
    PathBuf::from(name)
}

enum Sink {
    Disabled,
    Pending(PathBuf),
    Open(BufWriter<File>),
    Closed,
}

/// Message log plus its optional file mirror.
pub struct Journal {
    messages: Vec<String>,
    path: Option<PathBuf>,
    sink: Sink,
}

impl Journal {
    /// Journal that only keeps messages in memory.
    pub fn in_memory() -> Self {
        Self {
            messages: Vec::new(),
            path: None,
            sink: Sink::Disabled,
        }
    }

    /// Journal that will mirror to the log file of `target` once opened.
    pub fn persistent(target: &Path) -> Self {
        let path = log_path_for(target);
        Self {
            messages: Vec::new(),
            path: Some(path.clone()),
            sink: Sink::Pending(path),
        }
    }

    /// Log file path, if persistence is enabled.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Lines written so far.
    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    /// Create the log file. Does nothing unless the file is still pending.
    pub fn open(&mut self) -> Result<()> {
        let Sink::Pending(path) = &self.sink else {
            return Ok(());
        };
        match File::create(path) {
            Ok(file) => {
                debug!(path = %path.display(), "Opened request log");
                self.sink = Sink::Open(BufWriter::new(file));
                Ok(())
            }
            Err(err) => {
                self.sink = Sink::Closed;
                Err(FetchError::from(err))
            }
        }
    }

    /// Whether the file sink is currently open.
    pub fn is_open(&self) -> bool {
        matches!(self.sink, Sink::Open(_))
    }

    /// Append one line.
    pub fn write_line(&mut self, line: impl Into<String>) {
        let line = line.into();
        if let Sink::Open(writer) = &mut self.sink {
            let written = writeln!(writer, "{}", line).and_then(|_| writer.flush());
            if let Err(err) = written {
                warn!(
                    path = ?self.path,
                    "Failed to write request log, disabling it: {}",
                    err
                );
                self.sink = Sink::Closed;
            }
        }
        self.messages.push(line);
    }

    /// Append several lines.
    pub fn write_lines<I, S>(&mut self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for line in lines {
            self.write_line(line);
        }
    }

    /// Release the file. Later writes only reach the message log.
    pub fn close(&mut self) {
        if let Sink::Open(mut writer) = std::mem::replace(&mut self.sink, Sink::Closed) {
            if let Err(err) = writer.flush() {
                warn!(path = ?self.path, "Failed to flush request log: {}", err);
            }
            debug!(path = ?self.path, "Closed request log");
        }
    }

    /// `=== REQUEST ===` followed by the service, target and pretty-printed body.
    pub fn request_section(
        &mut self,
        address: &ServiceAddress,
        target: &Path,
        payload: &Map<String, Value>,
    ) {
        self.write_line(section::REQUEST);
        self.write_line(format!("Service: {}", address));
        self.write_line(format!("Target : {}", target.display()));
        self.write_line("Request:");
        let body = serde_json::to_string_pretty(payload).unwrap_or_else(|_| "{}".to_string());
        self.write_lines(body.lines().map(str::to_string));
    }

    /// Header for the raw server lines.
    pub fn server_section(&mut self) {
        self.write_line(section::SERVER);
    }

    /// `=== ERROR ===` followed by the error text.
    pub fn error_section(&mut self, error: &FetchError) {
        self.write_line(section::ERROR);
        self.write_lines(error.to_string().lines().map(str::to_string));
    }

    /// Optional `=== MARS ===` messages, then `=== OUTPUT ===` metadata.
    pub fn result_sections(&mut self, messages: Option<&[String]>, metadata: &ResultMetadata) {
        if let Some(messages) = messages {
            self.write_line(section::MARS);
            self.write_lines(messages.iter().cloned());
        }
        self.write_line(section::OUTPUT);
        self.write_line(format!("href: {}", display_or_null(metadata.href.as_deref())));
        self.write_line(format!("size: {}", display_or_null(metadata.size)));
        self.write_line(format!("type: {}", display_or_null(metadata.kind.as_deref())));
    }

    /// `=== ELAPSED ===` with one line per recorded transition.
    pub fn elapsed_section(&mut self, entries: &[(RequestStatus, Duration)]) {
        self.write_line(section::ELAPSED);
        for (status, elapsed) in entries {
            self.write_line(format!("{:.2} min to {}", minutes(*elapsed), status));
        }
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .field("messages", &self.messages.len())
            .finish()
    }
}

/// Duration in fractional minutes.
pub fn minutes(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() / 60.0
}

fn display_or_null<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "null".to_string(), |v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafetch_core::RemoteError;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_log_path_appends_extension() {
        assert_eq!(log_path_for(Path::new("out/data.grib")), PathBuf::from("out/data.grib.log"));
    }

    #[test]
    fn test_pending_journal_writes_nothing_to_disk() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("never.bin");
        let mut journal = Journal::persistent(&target);
        journal.write_line("kept in memory");
        journal.close();
        assert_eq!(journal.messages(), ["kept in memory".to_string()]);
        assert!(!log_path_for(&target).exists());
    }

    #[test]
    fn test_open_journal_mirrors_every_line() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out.bin");
        let mut journal = Journal::persistent(&target);
        journal.open().unwrap();
        journal.write_line("first");

        // Flushed while still open.
        let partial = std::fs::read_to_string(log_path_for(&target)).unwrap();
        assert_eq!(partial, "first\n");

        journal.write_line("second");
        journal.close();
        journal.write_line("after close");

        let contents = std::fs::read_to_string(log_path_for(&target)).unwrap();
        assert_eq!(contents, "first\nsecond\n");
        assert_eq!(journal.messages().len(), 3);
    }

    #[test]
    fn test_request_section_layout() {
        let mut journal = Journal::in_memory();
        let mut payload = Map::new();
        payload.insert("dataset".to_string(), json!("X"));
        journal.request_section(
            &ServiceAddress::Dataset("X".to_string()),
            Path::new("out.bin"),
            &payload,
        );
        assert_eq!(
            journal.messages(),
            [
                "=== REQUEST ===",
                "Service: datasets/X",
                "Target : out.bin",
                "Request:",
                "{",
                "  \"dataset\": \"X\"",
                "}",
            ]
        );
    }

    #[test]
    fn test_result_sections_with_missing_metadata() {
        let mut journal = Journal::in_memory();
        let messages = vec!["mars - INFO - done".to_string()];
        journal.result_sections(
            Some(&messages),
            &ResultMetadata {
                href: None,
                size: Some(42),
                kind: None,
            },
        );
        assert_eq!(
            journal.messages(),
            [
                "=== MARS ===",
                "mars - INFO - done",
                "=== OUTPUT ===",
                "href: null",
                "size: 42",
                "type: null",
            ]
        );
    }

    #[test]
    fn test_error_and_elapsed_sections() {
        let mut journal = Journal::in_memory();
        let error = FetchError::from(RemoteError::new("failed").with_details(["bad date"]));
        journal.error_section(&error);
        journal.elapsed_section(&[
            (RequestStatus::Queued, Duration::from_secs(3)),
            (RequestStatus::Error, Duration::from_secs(90)),
        ]);
        assert_eq!(
            journal.messages(),
            [
                "=== ERROR ===",
                "Remote error: failed",
                "bad date",
                "=== ELAPSED ===",
                "0.05 min to queued",
                "1.50 min to error",
            ]
        );
    }
}
