//! Request logging.
//!
//! Every proxy request produces one structured outcome record. Records always
//! go to `tracing`; when a log file is configured they are additionally
//! appended as newline-delimited JSON with size-based rotation (a bounded
//! number of numbered backups, optionally gzipped).

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;

/// Append-only writer that rotates the file once it reaches `max_bytes`.
/// Backups are kept as `<path>.1` .. `<path>.keep`, newest first.
pub struct RotatingWriter {
    path: PathBuf,
    file: fs::File,
    max_bytes: Option<u64>,
    keep: usize,
    compress: bool,
}

impl RotatingWriter {
    pub fn open(
        path: &str,
        max_bytes: Option<u64>,
        keep: usize,
        compress: bool,
    ) -> std::io::Result<Self> {
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: PathBuf::from(path),
            file,
            max_bytes,
            keep,
            compress,
        })
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.rotate_if_needed();
        writeln!(self.file, "{}", line)
    }

    fn backup_path(&self, idx: usize) -> PathBuf {
        self.path.with_extension(format!("{}", idx))
    }

    fn rotate_if_needed(&mut self) {
        let Some(limit) = self.max_bytes else { return };
        let over = self
            .path
            .metadata()
            .map(|m| m.len() >= limit)
            .unwrap_or(false);
        if !over || self.keep == 0 {
            return;
        }
        for idx in (1..=self.keep).rev() {
            let from = if idx == 1 {
                self.path.clone()
            } else {
                self.backup_path(idx - 1)
            };
            if from.exists() {
                let _ = fs::rename(&from, self.backup_path(idx));
            }
        }
        if self.compress {
            self.compress_newest_backup();
        }
        if let Ok(fresh) = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
        {
            self.file = fresh;
        }
    }

    fn compress_newest_backup(&self) {
        let rotated = self.backup_path(1);
        let Ok(data) = fs::read(&rotated) else { return };
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        if gz.write_all(&data).is_ok() {
            if let Ok(buf) = gz.finish() {
                let _ = fs::write(rotated.with_extension("1.gz"), buf);
                let _ = fs::remove_file(&rotated);
            }
        }
    }
}

/// Outcome of one proxy request, as recorded to the request log.
pub struct RequestOutcome<'a> {
    pub ip: &'a str,
    pub path: &'a str,
    /// `"ok"` for a relayed response, else the machine-readable error code.
    pub outcome: &'a str,
    pub status: u16,
    pub latency_ms: u128,
    pub model: Option<&'a str>,
    pub tokens_used: Option<u64>,
}

#[derive(Clone)]
pub struct RequestLog {
    writer: Option<Arc<Mutex<RotatingWriter>>>,
}

impl RequestLog {
    pub fn new(writer: Option<RotatingWriter>) -> Self {
        Self {
            writer: writer.map(|w| Arc::new(Mutex::new(w))),
        }
    }

    pub fn disabled() -> Self {
        Self { writer: None }
    }

    pub fn record(&self, outcome: &RequestOutcome<'_>) {
        if let Some(writer) = &self.writer {
            let line = serde_json::json!({
                "ts": Utc::now().to_rfc3339(),
                "ip": outcome.ip,
                "path": outcome.path,
                "outcome": outcome.outcome,
                "status": outcome.status,
                "latencyMs": outcome.latency_ms,
                "model": outcome.model,
                "tokensUsed": outcome.tokens_used,
            });
            if let Ok(mut guard) = writer.lock() {
                if let Err(e) = guard.write_line(&line.to_string()) {
                    tracing::warn!(error = %e, "failed to write request log line");
                }
            }
        }
        tracing::info!(
            target: "request_log",
            ip = %outcome.ip,
            path = %outcome.path,
            outcome = %outcome.outcome,
            status = outcome.status,
            latency_ms = outcome.latency_ms as u64,
            tokens_used = ?outcome.tokens_used,
            "request completed"
        );
    }
}
