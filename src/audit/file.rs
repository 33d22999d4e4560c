use super::{AuditError, AuditRecord, AuditSink};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// JSON Lines形式でファイルに追記する監査シンク
#[derive(Debug)]
pub struct JsonLinesAuditSink {
    path: PathBuf,
    // 行の混在を防ぐため書き込みを直列化する
    write_lock: Mutex<()>,
}

impl JsonLinesAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// ファイルから全記録を読み込む
    pub async fn read_all(&self) -> Result<Vec<AuditRecord>, AuditError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(AuditError::from))
            .collect()
    }
}

#[async_trait]
impl AuditSink for JsonLinesAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::types::{RequestId, RequestState};
    use chrono::Utc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let sink = JsonLinesAuditSink::new(dir.path().join("audit/transitions.jsonl"));
        let id = RequestId::new();

        sink.record(AuditRecord::new(id, None, RequestState::Pending, "alice", Utc::now()))
            .await
            .unwrap();
        sink.record(AuditRecord::new(
            id,
            Some(RequestState::Pending),
            RequestState::Rejected,
            "root",
            Utc::now(),
        ))
        .await
        .unwrap();

        let records = sink.read_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].from_state, Some(RequestState::Pending));
        assert_eq!(records[1].actor, "root");
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let dir = TempDir::new().unwrap();
        let sink = JsonLinesAuditSink::new(dir.path().join("none.jsonl"));
        assert!(sink.read_all().await.unwrap().is_empty());
    }
}
