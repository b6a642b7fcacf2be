//! Append-only audit trail: one [`AuditRecord`] per handled request.
//!
//! The record schema is a durable contract for downstream tooling; field
//! names are the snake_case column names.  Writes are best-effort relative
//! to the caller-visible response: a failed write is logged and counted,
//! never surfaced.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RotationConfig;
use crate::Level;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub user_id: Option<String>,
    pub is_anonymous: bool,
    pub story_level: Level,
    /// Sanitized request.
    pub input_data: Value,
    /// Generated result; null on every failure path.
    pub output_data: Option<Value>,
    pub token_count: usize,
    pub execution_time_ms: u64,
    pub success: bool,
    pub error_message: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit write failed: {0}")]
    Io(#[from] io::Error),
    #[error("audit record could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("audit writer lock poisoned")]
    Poisoned,
}

#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// Size-based rotating file writer.  Backups are numbered upward from the
/// highest index already on disk (`<path>.1`, `<path>.2`, ..., optionally
/// gzipped to `<path>.N.gz`) and are never pruned or overwritten.
pub struct RotatingWriter {
    path: PathBuf,
    file: File,
    max_bytes: Option<u64>,
    compress: bool,
    next_backup: u64,
}

impl RotatingWriter {
    pub fn open(path: impl AsRef<Path>, rotation: &RotationConfig) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let next_backup = highest_backup_index(&path)? + 1;
        Ok(Self {
            path,
            file,
            max_bytes: rotation.max_bytes,
            compress: rotation.compress,
            next_backup,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        if let Some(limit) = self.max_bytes {
            let size = self.path.metadata().map(|m| m.len()).unwrap_or(0);
            if size > 0 && size >= limit {
                self.rotate()?;
            }
        }
        writeln!(self.file, "{}", line)?;
        self.file.flush()
    }

    fn backup(&self, idx: u64) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", idx));
        PathBuf::from(name)
    }

    fn gz(path: &Path) -> PathBuf {
        let mut name = path.to_path_buf().into_os_string();
        name.push(".gz");
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        let mut target = self.backup(self.next_backup);
        while target.exists() || Self::gz(&target).exists() {
            self.next_backup += 1;
            target = self.backup(self.next_backup);
        }
        fs::rename(&self.path, &target)?;
        self.next_backup += 1;
        if self.compress {
            Self::compress_backup(&target);
        }
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        Ok(())
    }

    /// Gzip `backup` next to itself.  The plain file is removed only after
    /// the archive is fully written.
    fn compress_backup(backup: &Path) {
        let gz_name = Self::gz(backup);
        let result = fs::read(backup).and_then(|data| {
            let mut gz = GzEncoder::new(Vec::new(), Compression::default());
            gz.write_all(&data)?;
            fs::write(&gz_name, gz.finish()?)?;
            fs::remove_file(backup)
        });
        if let Err(err) = result {
            tracing::warn!(path = %backup.display(), error = %err, "failed to compress rotated audit log");
        }
    }
}

/// Largest `N` among existing `<path>.N` / `<path>.N.gz` siblings, or 0.
fn highest_backup_index(path: &Path) -> io::Result<u64> {
    let Some(stem) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(0);
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let prefix = format!("{}.", stem);
    let mut highest = 0;
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let Some(rest) = name.to_str().and_then(|n| n.strip_prefix(&prefix)) else {
            continue;
        };
        let digits = rest.strip_suffix(".gz").unwrap_or(rest);
        if let Ok(idx) = digits.parse::<u64>() {
            highest = highest.max(idx);
        }
    }
    Ok(highest)
}

/// Newline-delimited JSON file sink.
pub struct JsonlAuditSink {
    writer: Mutex<RotatingWriter>,
}

impl JsonlAuditSink {
    pub fn open(path: impl AsRef<Path>, rotation: &RotationConfig) -> io::Result<Self> {
        Ok(Self {
            writer: Mutex::new(RotatingWriter::open(path, rotation)?),
        })
    }
}

#[async_trait::async_trait]
impl AuditSink for JsonlAuditSink {
    async fn write(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let line = serde_json::to_string(record)?;
        let mut guard = self.writer.lock().map_err(|_| AuditError::Poisoned)?;
        guard.write_line(&line)?;
        Ok(())
    }
}

/// Fallback sink when no audit file is configured: records go to the
/// `audit` tracing target.
pub struct TracingAuditSink;

#[async_trait::async_trait]
impl AuditSink for TracingAuditSink {
    async fn write(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let line = serde_json::to_string(record)?;
        tracing::info!(target: "audit", record = %line, "audit record");
        Ok(())
    }
}

#[derive(Clone)]
pub struct AuditLogger {
    sink: Arc<dyn AuditSink>,
    records_total: Arc<AtomicU64>,
    write_errors_total: Arc<AtomicU64>,
}

impl AuditLogger {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink,
            records_total: Arc::new(AtomicU64::new(0)),
            write_errors_total: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open the JSONL sink at `path`, or fall back to tracing output.
    pub fn from_config(path: Option<&str>, rotation: &RotationConfig) -> Self {
        let sink: Arc<dyn AuditSink> = match path {
            Some(p) => match JsonlAuditSink::open(p, rotation) {
                Ok(sink) => Arc::new(sink),
                Err(e) => {
                    tracing::warn!(path = %p, error = %e, "Failed to open AUDIT_LOG_FILE; audit records go to the log");
                    Arc::new(TracingAuditSink)
                }
            },
            None => {
                tracing::warn!("AUDIT_LOG_FILE not set; audit records go to the log");
                Arc::new(TracingAuditSink)
            }
        };
        Self::new(sink)
    }

    /// Persist `record`.  Failures are logged and counted, never returned.
    pub async fn record(&self, record: &AuditRecord) {
        match self.sink.write(record).await {
            Ok(()) => {
                self.records_total.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    error = %err,
                    level = %record.story_level,
                    success = record.success,
                    "audit record dropped"
                );
            }
        }
    }

    pub fn records_total(&self) -> u64 {
        self.records_total.load(Ordering::Relaxed)
    }

    pub fn write_errors_total(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Read;
    use tempfile::tempdir;

    fn record(success: bool) -> AuditRecord {
        AuditRecord {
            user_id: None,
            is_anonymous: true,
            story_level: Level::Story,
            input_data: json!({"userInput": "x"}),
            output_data: success.then(|| json!({"title": "t"})),
            token_count: 12,
            execution_time_ms: 5,
            success,
            error_message: (!success).then(|| "boom".to_string()),
            ip_address: Some("127.0.0.1".into()),
            user_agent: None,
            created_at: Utc::now(),
        }
    }

    fn no_rotation() -> RotationConfig {
        RotationConfig {
            max_bytes: None,
            compress: false,
        }
    }

    #[tokio::test]
    async fn jsonl_sink_appends_snake_case_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let logger = AuditLogger::from_config(path.to_str(), &no_rotation());
        logger.record(&record(true)).await;
        logger.record(&record(false)).await;

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["story_level"], json!("story"));
        assert_eq!(lines[1]["output_data"], Value::Null);
        assert_eq!(lines[1]["error_message"], json!("boom"));
        assert!(lines[0].get("execution_time_ms").is_some());
        assert_eq!(logger.records_total(), 2);
        assert_eq!(logger.write_errors_total(), 0);
    }

    /// Every line across the live file and all backups, gzipped or not.
    fn lines_on_disk(dir: &Path) -> Vec<Value> {
        let mut lines = Vec::new();
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            let text = if path.extension().map_or(false, |e| e == "gz") {
                let mut out = String::new();
                flate2::read::GzDecoder::new(File::open(&path).unwrap())
                    .read_to_string(&mut out)
                    .unwrap();
                out
            } else {
                fs::read_to_string(&path).unwrap()
            };
            lines.extend(text.lines().map(|l| serde_json::from_str::<Value>(l).unwrap()));
        }
        lines
    }

    #[tokio::test]
    async fn rotation_never_drops_records() {
        for compress in [false, true] {
            let dir = tempdir().unwrap();
            let path = dir.path().join("audit.jsonl");
            let rotation = RotationConfig {
                max_bytes: Some(10),
                compress,
            };
            let sink = JsonlAuditSink::open(&path, &rotation).unwrap();
            for _ in 0..7 {
                sink.write(&record(true)).await.unwrap();
            }
            assert_eq!(lines_on_disk(dir.path()).len(), 7, "compress={compress}");
            let newest = if compress { "audit.jsonl.6.gz" } else { "audit.jsonl.6" };
            assert!(dir.path().join(newest).exists());
            assert!(!dir.path().join("audit.jsonl.7").exists());
        }
    }

    #[tokio::test]
    async fn reopening_continues_backup_numbering() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let rotation = RotationConfig {
            max_bytes: Some(200),
            compress: true,
        };
        for _ in 0..2 {
            let sink = JsonlAuditSink::open(&path, &rotation).unwrap();
            for _ in 0..4 {
                sink.write(&record(false)).await.unwrap();
            }
        }
        assert!(dir.path().join("audit.jsonl.1.gz").exists());
        assert_eq!(lines_on_disk(dir.path()).len(), 8);
        assert!(fs::metadata(&path).unwrap().len() > 0);
    }

    struct FailingSink;

    #[async_trait::async_trait]
    impl AuditSink for FailingSink {
        async fn write(&self, _record: &AuditRecord) -> Result<(), AuditError> {
            Err(AuditError::Io(io::Error::new(io::ErrorKind::Other, "disk full")))
        }
    }

    #[tokio::test]
    async fn failed_writes_are_counted_not_raised() {
        let logger = AuditLogger::new(Arc::new(FailingSink));
        logger.record(&record(true)).await;
        assert_eq!(logger.records_total(), 0);
        assert_eq!(logger.write_errors_total(), 1);
    }
}
