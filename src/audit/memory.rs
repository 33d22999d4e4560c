use super::{AuditError, AuditRecord, AuditSink};
use crate::lifecycle::types::{RequestId, RequestState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// 監査記録の統計情報
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditStatistics {
    /// 総記録数（メモリ上限で捨てたものを含む）
    pub total_records: u64,
    /// 遷移先の状態別件数
    pub records_by_state: HashMap<RequestState, u64>,
    pub first_record_time: Option<DateTime<Utc>>,
    pub last_record_time: Option<DateTime<Utc>>,
}

/// 監査記録の検索条件
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub request_id: Option<RequestId>,
    pub actor: Option<String>,
    pub to_states: Option<Vec<RequestState>>,
}

impl AuditFilter {
    fn matches(&self, record: &AuditRecord) -> bool {
        if self.start_time.is_some_and(|start| record.at < start) {
            return false;
        }
        if self.end_time.is_some_and(|end| record.at > end) {
            return false;
        }
        if self.request_id.is_some_and(|id| record.request_id != id) {
            return false;
        }
        if let Some(ref actor) = self.actor {
            if &record.actor != actor {
                return false;
            }
        }
        if let Some(ref states) = self.to_states {
            if !states.contains(&record.to_state) {
                return false;
            }
        }
        true
    }
}

/// メモリ内に保持する監査シンク
#[derive(Debug, Clone)]
pub struct MemoryAuditSink {
    /// メモリ内保持する最大件数
    max_records: usize,
    records: Arc<RwLock<Vec<AuditRecord>>>,
    statistics: Arc<Mutex<AuditStatistics>>,
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl MemoryAuditSink {
    pub fn new(max_records: usize) -> Self {
        Self {
            max_records: max_records.max(1),
            records: Arc::new(RwLock::new(Vec::new())),
            statistics: Arc::new(Mutex::new(AuditStatistics::default())),
        }
    }

    /// 記録を検索
    pub async fn search(&self, filter: &AuditFilter) -> Vec<AuditRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect()
    }

    /// リクエストの記録（記録順）
    pub async fn for_request(&self, id: RequestId) -> Vec<AuditRecord> {
        self.search(&AuditFilter {
            request_id: Some(id),
            ..AuditFilter::default()
        })
        .await
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.read().await.clone()
    }

    pub async fn statistics(&self) -> AuditStatistics {
        self.statistics.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.records.write().await.clear();
        *self.statistics.lock().await = AuditStatistics::default();
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        {
            let mut stats = self.statistics.lock().await;
            stats.total_records += 1;
            *stats.records_by_state.entry(record.to_state).or_insert(0) += 1;
            if stats.first_record_time.is_none() {
                stats.first_record_time = Some(record.at);
            }
            stats.last_record_time = Some(record.at);
        }

        let mut records = self.records.write().await;
        records.push(record);
        if records.len() > self.max_records {
            let excess = records.len() - self.max_records;
            records.drain(..excess);
        }
        Ok(())
    }
}
