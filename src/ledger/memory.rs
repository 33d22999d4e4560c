use super::{apply_state_change, check_state_change, claim_issuance, release_lease, RequestLedger, StateChange};
use crate::error::LedgerError;
use crate::lifecycle::types::{CertificateRequest, IssuanceLease, RequestId, RequestState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

#[derive(Debug)]
struct Slot {
    seq: u64,
    record: Mutex<CertificateRequest>,
}

/// In-memoryリクエストレジャー
///
/// レコードごとに `Mutex` を持ち、マップのロックは検索時のみ保持する。
/// 異なるリクエストへの操作は互いにブロックしない。
///
/// # 制限事項
/// - プロセス終了時にデータが失われます
#[derive(Debug, Clone, Default)]
pub struct InMemoryRequestLedger {
    records: Arc<RwLock<HashMap<RequestId, Arc<Slot>>>>,
    next_seq: Arc<AtomicU64>,
}

impl InMemoryRequestLedger {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, id: RequestId) -> Result<Arc<Slot>, LedgerError> {
        self.records
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(LedgerError::NotFound(id))
    }

    /// 条件に合うレコードのスナップショットを作成順で返す
    async fn collect<F>(&self, predicate: F) -> Vec<CertificateRequest>
    where
        F: Fn(&CertificateRequest) -> bool,
    {
        let mut slots: Vec<Arc<Slot>> = self.records.read().await.values().cloned().collect();
        slots.sort_by_key(|slot| slot.seq);

        let mut result = Vec::new();
        for slot in slots {
            let record = slot.record.lock().await;
            if predicate(&record) {
                result.push(record.clone());
            }
        }
        result
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl RequestLedger for InMemoryRequestLedger {
    async fn create(&self, request: CertificateRequest) -> Result<RequestId, LedgerError> {
        let id = request.id;
        let mut records = self.records.write().await;
        if records.contains_key(&id) {
            return Err(LedgerError::DuplicateId(id));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        records.insert(
            id,
            Arc::new(Slot {
                seq,
                record: Mutex::new(request),
            }),
        );
        Ok(id)
    }

    async fn get(&self, id: RequestId) -> Result<CertificateRequest, LedgerError> {
        let slot = self.slot(id).await?;
        let record = slot.record.lock().await;
        Ok(record.clone())
    }

    async fn compare_and_transition(
        &self,
        id: RequestId,
        change: StateChange,
    ) -> Result<CertificateRequest, LedgerError> {
        let slot = self.slot(id).await?;
        let mut record = slot.record.lock().await;

        check_state_change(&record, &change)?;
        apply_state_change(&mut record, change);
        Ok(record.clone())
    }

    async fn list_by_owner(&self, owner: &str) -> Result<Vec<CertificateRequest>, LedgerError> {
        Ok(self.collect(|record| record.owner == owner).await)
    }

    async fn list_by_state(
        &self,
        state: RequestState,
    ) -> Result<Vec<CertificateRequest>, LedgerError> {
        Ok(self.collect(|record| record.state == state).await)
    }

    async fn list_all(&self) -> Result<Vec<CertificateRequest>, LedgerError> {
        Ok(self.collect(|_| true).await)
    }

    async fn find_by_serial(
        &self,
        serial: &str,
    ) -> Result<Option<CertificateRequest>, LedgerError> {
        Ok(self
            .collect(|record| {
                record
                    .artifact
                    .as_ref()
                    .is_some_and(|artifact| artifact.serial_number == serial)
            })
            .await
            .into_iter()
            .next())
    }

    async fn begin_issuance(
        &self,
        id: RequestId,
        holder: &str,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<IssuanceLease, LedgerError> {
        let slot = self.slot(id).await?;
        let mut record = slot.record.lock().await;
        claim_issuance(&mut record, holder, now, ttl)
    }

    async fn release_issuance(
        &self,
        id: RequestId,
        token: Uuid,
        error: Option<String>,
    ) -> Result<(), LedgerError> {
        let slot = self.slot(id).await?;
        let mut record = slot.record.lock().await;
        release_lease(&mut record, token, error)
    }
}
