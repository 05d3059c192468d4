use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{AuditSink, AuditSinkError};
use keyledger_common::AuditEvent;

/// Append-only JSON-lines file, one event per line.
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every event in the file.
    pub async fn read_all(&self) -> Result<Vec<AuditEvent>, AuditSinkError> {
        let _guard = self.file.lock().await;
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AuditSinkError::Transient(format!("failed to read file: {e}"))),
        };

        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|e| AuditSinkError::Permanent(format!("corrupt audit line: {e}")))
            })
            .collect()
    }

    async fn open(&self) -> Result<File, AuditSinkError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    AuditSinkError::Transient(format!("failed to create directory: {e}"))
                })?;
            }
        }

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| AuditSinkError::Transient(format!("failed to open file: {e}")))
    }
}

#[async_trait]
impl AuditSink for JsonLinesSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn write(&self, event: &AuditEvent) -> Result<(), AuditSinkError> {
        let mut line = serde_json::to_string(event)
            .map_err(|e| AuditSinkError::Permanent(format!("failed to serialize event: {e}")))?;
        line.push('\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        let file = guard
            .as_mut()
            .ok_or_else(|| AuditSinkError::Permanent("file handle not initialized".to_string()))?;

        let written = async {
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = written {
            // Reopen on the next attempt.
            *guard = None;
            return Err(AuditSinkError::Transient(format!(
                "failed to write to file: {e}"
            )));
        }
        Ok(())
    }

    /// Rewrite the file without events older than the cutoff.
    ///
    /// Lines that do not parse are kept.
    async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64, AuditSinkError> {
        let mut guard = self.file.lock().await;
        *guard = None;

        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(AuditSinkError::Transient(format!("failed to read file: {e}"))),
        };

        let mut kept = String::with_capacity(text.len());
        let mut removed = 0u64;
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            let expired = serde_json::from_str::<AuditEvent>(line)
                .map(|event| event.timestamp < older_than)
                .unwrap_or(false);
            if expired {
                removed += 1;
            } else {
                kept.push_str(line);
                kept.push('\n');
            }
        }

        if removed == 0 {
            return Ok(0);
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        fs::write(&tmp, kept)
            .await
            .map_err(|e| AuditSinkError::Transient(format!("failed to write file: {e}")))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| AuditSinkError::Transient(format!("failed to replace file: {e}")))?;

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use keyledger_common::{AuditEventKind, KeyId};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_appends_lines() {
        let dir = TempDir::new().unwrap();
        let sink = JsonLinesSink::new(dir.path().join("audit/events.jsonl"));
        let key = KeyId::new("k1").unwrap();

        sink.write(&AuditEvent::key(AuditEventKind::KeyGenerated, &key, "active"))
            .await
            .unwrap();
        sink.write(&AuditEvent::key(AuditEventKind::KeyRevoked, &key, "revoked"))
            .await
            .unwrap();

        let events = sink.read_all().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, AuditEventKind::KeyRevoked);

        let raw = std::fs::read_to_string(sink.path()).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_prune_then_append() {
        let dir = TempDir::new().unwrap();
        let sink = JsonLinesSink::new(dir.path().join("events.jsonl"));
        let key = KeyId::new("k1").unwrap();

        let mut old = AuditEvent::key(AuditEventKind::KeyGenerated, &key, "active");
        old.timestamp = Utc::now() - Duration::days(400);
        sink.write(&old).await.unwrap();
        sink.write(&AuditEvent::key(AuditEventKind::KeyRotated, &key, "rotating"))
            .await
            .unwrap();

        assert_eq!(sink.prune(Utc::now() - Duration::days(365)).await.unwrap(), 1);

        sink.write(&AuditEvent::key(AuditEventKind::KeyExpired, &key, "expired"))
            .await
            .unwrap();
        let kinds: Vec<_> = sink.read_all().await.unwrap().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![AuditEventKind::KeyRotated, AuditEventKind::KeyExpired]);
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let sink = JsonLinesSink::new(dir.path().join("none.jsonl"));
        assert!(sink.read_all().await.unwrap().is_empty());
        assert_eq!(sink.prune(Utc::now()).await.unwrap(), 0);
    }
}
