//! Request Ledger
//!
//! 証明書リクエストの永続ストア。ライフサイクル状態の唯一の正本であり、
//! 状態の変更は [`RequestLedger::compare_and_transition`] のみで行う。

pub mod memory;
#[cfg(feature = "sqlite-backend")]
pub mod sqlite;

use crate::error::LedgerError;
use crate::lifecycle::types::{
    CertificateArtifact, CertificateRequest, HistoryEntry, IssuanceLease, RequestId,
    RequestState, Revocation,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use memory::InMemoryRequestLedger;
#[cfg(feature = "sqlite-backend")]
pub use sqlite::SqliteRequestLedger;

/// 一回の状態遷移の内容
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    /// 遷移元として期待する状態
    pub expected: RequestState,
    /// 遷移先
    pub next: RequestState,
    /// 遷移を行ったアイデンティティ
    pub actor: String,
    pub at: DateTime<Utc>,
    pub reviewer: Option<String>,
    pub artifact: Option<CertificateArtifact>,
    pub revocation: Option<Revocation>,
    /// Approved→Issued で提示する発行リースのトークン
    pub fence: Option<Uuid>,
}

impl StateChange {
    pub fn new(expected: RequestState, next: RequestState, actor: impl Into<String>) -> Self {
        Self {
            expected,
            next,
            actor: actor.into(),
            at: Utc::now(),
            reviewer: None,
            artifact: None,
            revocation: None,
            fence: None,
        }
    }

    /// Pendingからの審査（承認・却下）
    pub fn review(next: RequestState, reviewer: impl Into<String>) -> Self {
        let reviewer = reviewer.into();
        Self::new(RequestState::Pending, next, reviewer.clone()).with_reviewer(reviewer)
    }

    /// 発行（Approved→Issued）
    pub fn issue(actor: impl Into<String>, artifact: CertificateArtifact, fence: Uuid) -> Self {
        let mut change = Self::new(RequestState::Approved, RequestState::Issued, actor);
        change.artifact = Some(artifact);
        change.fence = Some(fence);
        change
    }

    /// 失効（Issued→Revoked）
    pub fn revoke(revocation: Revocation) -> Self {
        let mut change = Self::new(
            RequestState::Issued,
            RequestState::Revoked,
            revocation.revoked_by.clone(),
        );
        change.at = revocation.revoked_at;
        change.revocation = Some(revocation);
        change
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }

    pub fn with_reviewer(mut self, reviewer: impl Into<String>) -> Self {
        self.reviewer = Some(reviewer.into());
        self
    }

    /// 状態機械の辺であり、必要な付随データが揃っているか
    pub fn validate(&self) -> Result<(), LedgerError> {
        let (from, to) = (self.expected, self.next);
        if !from.can_transition_to(to) {
            return Err(LedgerError::IllegalTransition { from, to });
        }

        let missing = match to {
            RequestState::Approved | RequestState::Rejected if self.reviewer.is_none() => {
                Some("reviewer")
            }
            RequestState::Issued if self.artifact.is_none() => Some("artifact"),
            RequestState::Issued if self.fence.is_none() => Some("fence"),
            RequestState::Revoked if self.revocation.is_none() => Some("revocation"),
            _ => None,
        };

        match missing {
            Some(missing) => Err(LedgerError::IncompleteChange { from, to, missing }),
            None => Ok(()),
        }
    }
}

/// 保存済みレコードに対して遷移が適用可能か判定する
pub(crate) fn check_state_change(
    record: &CertificateRequest,
    change: &StateChange,
) -> Result<(), LedgerError> {
    change.validate()?;

    if record.state != change.expected {
        return Err(LedgerError::Conflict {
            id: record.id,
            expected: change.expected,
            actual: record.state,
        });
    }

    if let Some(fence) = change.fence {
        let current = record.issuance.lease.as_ref().map(|lease| lease.token);
        if current != Some(fence) {
            return Err(LedgerError::FenceRejected { id: record.id });
        }
    }

    Ok(())
}

/// 検証済みの遷移をレコードに適用する
pub(crate) fn apply_state_change(record: &mut CertificateRequest, change: StateChange) {
    record.state = change.next;
    if let Some(reviewer) = change.reviewer {
        record.reviewer = Some(reviewer);
    }
    if let Some(artifact) = change.artifact {
        record.artifact = Some(artifact);
    }
    if let Some(revocation) = change.revocation {
        if let Some(ref mut artifact) = record.artifact {
            artifact.revocation = Some(revocation);
        }
    }
    if change.next == RequestState::Issued {
        record.issuance.lease = None;
        record.issuance.last_error = None;
    }
    record.updated_at = change.at;
    record.history.push(HistoryEntry {
        state: change.next,
        actor: change.actor,
        at: change.at,
    });
}

/// 発行リースを取得できるか判定し、新しいリースを記録する
pub(crate) fn claim_issuance(
    record: &mut CertificateRequest,
    holder: &str,
    now: DateTime<Utc>,
    ttl: chrono::Duration,
) -> Result<IssuanceLease, LedgerError> {
    if record.state != RequestState::Approved {
        return Err(LedgerError::Conflict {
            id: record.id,
            expected: RequestState::Approved,
            actual: record.state,
        });
    }

    if let Some(ref lease) = record.issuance.lease {
        if lease.is_live_at(now) {
            return Err(LedgerError::LeaseHeld {
                id: record.id,
                holder: lease.holder.clone(),
            });
        }
        tracing::warn!(
            request_id = %record.id,
            holder = %lease.holder,
            "Taking over expired issuance lease"
        );
    }

    let expires_at = lease_expiry(now, ttl)?;
    record.issuance.attempts += 1;
    let lease = IssuanceLease {
        token: Uuid::new_v4(),
        holder: holder.to_string(),
        attempt: record.issuance.attempts,
        acquired_at: now,
        expires_at,
    };
    record.issuance.lease = Some(lease.clone());
    Ok(lease)
}

/// リースの失効時刻。表現できない時刻になる TTL は拒否する
pub(crate) fn lease_expiry(
    now: DateTime<Utc>,
    ttl: chrono::Duration,
) -> Result<DateTime<Utc>, LedgerError> {
    now.checked_add_signed(ttl)
        .ok_or_else(|| LedgerError::Storage(format!("lease ttl {} is out of range", ttl)))
}

/// リースを解放し、失敗であれば記録する
pub(crate) fn release_lease(
    record: &mut CertificateRequest,
    token: Uuid,
    error: Option<String>,
) -> Result<(), LedgerError> {
    let current = record.issuance.lease.as_ref().map(|lease| lease.token);
    if current != Some(token) {
        return Err(LedgerError::FenceRejected { id: record.id });
    }

    record.issuance.lease = None;
    if let Some(error) = error {
        record.issuance.failed_attempts += 1;
        record.issuance.last_error = Some(error);
    }
    Ok(())
}

/// リクエストレジャー
#[async_trait]
pub trait RequestLedger: Send + Sync {
    /// 新しいリクエストを保存（ID重複は拒否）
    async fn create(&self, request: CertificateRequest) -> Result<RequestId, LedgerError>;

    /// リクエストを取得
    async fn get(&self, id: RequestId) -> Result<CertificateRequest, LedgerError>;

    /// 保存されている状態が `change.expected` と一致する場合のみ遷移する
    ///
    /// 失敗時は何も変更しない。
    async fn compare_and_transition(
        &self,
        id: RequestId,
        change: StateChange,
    ) -> Result<CertificateRequest, LedgerError>;

    /// 所有者のリクエスト（作成順）
    async fn list_by_owner(&self, owner: &str) -> Result<Vec<CertificateRequest>, LedgerError>;

    /// 指定状態のリクエスト（作成順）
    async fn list_by_state(
        &self,
        state: RequestState,
    ) -> Result<Vec<CertificateRequest>, LedgerError>;

    /// 審査待ちのリクエスト
    async fn list_pending(&self) -> Result<Vec<CertificateRequest>, LedgerError> {
        self.list_by_state(RequestState::Pending).await
    }

    /// 全リクエスト（作成順）
    async fn list_all(&self) -> Result<Vec<CertificateRequest>, LedgerError>;

    /// シリアル番号から発行済みリクエストを検索
    async fn find_by_serial(
        &self,
        serial: &str,
    ) -> Result<Option<CertificateRequest>, LedgerError>;

    /// Approvedのリクエストに対する発行リースを取得
    async fn begin_issuance(
        &self,
        id: RequestId,
        holder: &str,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<IssuanceLease, LedgerError>;

    /// 発行リースを解放（`error` があれば失敗として記録）
    async fn release_issuance(
        &self,
        id: RequestId,
        token: Uuid,
        error: Option<String>,
    ) -> Result<(), LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::types::{RevocationReason, SubjectInfo};

    fn artifact() -> CertificateArtifact {
        let now = Utc::now();
        CertificateArtifact {
            serial_number: "0a".to_string(),
            issuer: "Test CA".to_string(),
            certificate_pem: String::new(),
            fingerprint_sha256: String::new(),
            not_before: now,
            not_after: now + chrono::Duration::days(30),
            issued_at: now,
            revocation: None,
        }
    }

    #[test]
    fn test_validate_rejects_non_edges() {
        let change = StateChange::new(RequestState::Pending, RequestState::Issued, "x");
        assert!(matches!(
            change.validate(),
            Err(LedgerError::IllegalTransition { .. })
        ));
    }

    #[test]
    fn test_validate_requires_side_data() {
        let approve = StateChange::new(RequestState::Pending, RequestState::Approved, "root");
        assert!(matches!(
            approve.validate(),
            Err(LedgerError::IncompleteChange { missing: "reviewer", .. })
        ));

        let mut issue = StateChange::issue("system", artifact(), Uuid::new_v4());
        issue.fence = None;
        assert!(matches!(
            issue.validate(),
            Err(LedgerError::IncompleteChange { missing: "fence", .. })
        ));

        assert!(StateChange::review(RequestState::Rejected, "root").validate().is_ok());
    }

    #[test]
    fn test_lease_fences_issue() {
        let now = Utc::now();
        let mut record = CertificateRequest::new("alice", SubjectInfo::new("alice"), now);
        apply_state_change(
            &mut record,
            StateChange::review(RequestState::Approved, "root"),
        );

        let lease = claim_issuance(&mut record, "w1", now, chrono::Duration::seconds(30)).unwrap();
        assert!(matches!(
            claim_issuance(&mut record, "w2", now, chrono::Duration::seconds(30)),
            Err(LedgerError::LeaseHeld { .. })
        ));

        let stale = StateChange::issue("system", artifact(), Uuid::new_v4());
        assert!(matches!(
            check_state_change(&record, &stale),
            Err(LedgerError::FenceRejected { .. })
        ));

        let fenced = StateChange::issue("system", artifact(), lease.token);
        assert!(check_state_change(&record, &fenced).is_ok());
        apply_state_change(&mut record, fenced);
        assert_eq!(record.state, RequestState::Issued);
        assert!(record.issuance.lease.is_none());
        assert!(record.check_invariants().is_ok());
    }

    #[test]
    fn test_expired_lease_can_be_taken_over() {
        let now = Utc::now();
        let mut record = CertificateRequest::new("alice", SubjectInfo::new("alice"), now);
        apply_state_change(
            &mut record,
            StateChange::review(RequestState::Approved, "root"),
        );

        let first = claim_issuance(&mut record, "w1", now, chrono::Duration::seconds(1)).unwrap();
        let later = now + chrono::Duration::seconds(5);
        let second = claim_issuance(&mut record, "w2", later, chrono::Duration::seconds(1)).unwrap();

        assert_ne!(first.token, second.token);
        assert_eq!(second.attempt, 2);
        assert!(release_lease(&mut record, first.token, None).is_err());
        assert!(release_lease(&mut record, second.token, Some("boom".to_string())).is_ok());
        assert_eq!(record.issuance.failed_attempts, 1);
    }

    #[test]
    fn test_out_of_range_ttl_is_refused_without_mutation() {
        let now = Utc::now();
        let mut record = CertificateRequest::new("alice", SubjectInfo::new("alice"), now);
        apply_state_change(&mut record, StateChange::review(RequestState::Approved, "root"));
        let before = record.clone();

        assert!(matches!(
            claim_issuance(&mut record, "w", now, chrono::Duration::MAX),
            Err(LedgerError::Storage(_))
        ));
        assert_eq!(record, before);
    }

    #[test]
    fn test_revoke_marks_artifact() {
        let now = Utc::now();
        let mut record = CertificateRequest::new("alice", SubjectInfo::new("alice"), now);
        apply_state_change(&mut record, StateChange::review(RequestState::Approved, "root"));
        let lease = claim_issuance(&mut record, "w", now, chrono::Duration::seconds(30)).unwrap();
        apply_state_change(&mut record, StateChange::issue("system", artifact(), lease.token));
        apply_state_change(
            &mut record,
            StateChange::revoke(Revocation {
                reason: RevocationReason::Superseded,
                revoked_at: now,
                revoked_by: "root".to_string(),
            }),
        );

        assert_eq!(record.state, RequestState::Revoked);
        assert!(record.artifact.as_ref().is_some_and(|a| a.is_revoked()));
        assert_eq!(record.history.len(), 4);
        assert!(record.check_invariants().is_ok());
    }
}
