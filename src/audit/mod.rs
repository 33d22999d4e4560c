//! Audit Sink
//!
//! 状態遷移の監査記録。記録の失敗はエンジン操作を失敗させない。

pub mod file;
pub mod memory;

use crate::lifecycle::types::{RequestId, RequestState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use file::JsonLinesAuditSink;
pub use memory::{AuditFilter, AuditStatistics, MemoryAuditSink};

/// 監査記録
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub request_id: RequestId,
    /// 遷移元（作成時は `None`）
    pub from_state: Option<RequestState>,
    pub to_state: RequestState,
    pub actor: String,
    pub at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        request_id: RequestId,
        from_state: Option<RequestState>,
        to_state: RequestState,
        actor: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_id,
            from_state,
            to_state,
            actor: actor.into(),
            at,
        }
    }
}

/// 監査エラー
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit write failed: {0}")]
    Write(#[from] std::io::Error),

    #[error("Audit serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Audit sink unavailable: {0}")]
    Unavailable(String),
}

/// 監査シンク
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError>;
}

/// `tracing` のイベントとして出力するシンク
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        tracing::info!(
            target: "certflow::audit",
            audit_id = %record.id,
            request_id = %record.request_id,
            from = record.from_state.map(|s| s.as_str()).unwrap_or("-"),
            to = %record.to_state,
            actor = %record.actor,
            at = %record.at,
            "transition"
        );
        Ok(())
    }
}
