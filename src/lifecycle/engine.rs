//! Lifecycle Engine
//!
//! 証明書リクエストの状態機械。すべての変更はレジャーの
//! compare-and-transition を通り、権限テーブルで事前に認可される。

use super::policy::{authorize, authorize_owned, Action};
use super::retry::RetryPolicy;
use super::types::{
    ArtifactStatus, CertificateRequest, RequestId, RequestState, Revocation, RevocationReason,
    SubjectInfo,
};
use crate::audit::{AuditRecord, AuditSink};
use crate::error::{Error, LedgerError, LifecycleError};
use crate::identity::Identity;
use crate::issuance::{IssuanceGateway, IssuanceTicket};
use crate::ledger::{RequestLedger, StateChange};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

type EngineResult<T> = Result<T, LifecycleError>;

/// エンジンの動作設定
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// 発行リースの有効期間
    pub lease_ttl: Duration,
    /// ゲートウェイ呼び出しのタイムアウト
    pub gateway_timeout: Duration,
    /// 監査記録のタイムアウト
    pub audit_timeout: Duration,
    /// Approvedのまま放置されたとみなすまでの時間
    pub stuck_after: Duration,
    pub retry: RetryPolicy,
}

/// 発行リースの上限
pub const MAX_LEASE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// 滞留判定までの時間の上限
pub const MAX_STUCK_AFTER: Duration = Duration::from_secs(30 * 24 * 60 * 60);

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(60),
            gateway_timeout: Duration::from_secs(30),
            audit_timeout: Duration::from_secs(2),
            stuck_after: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.gateway_timeout.is_zero() {
            return Err("gateway timeout must be positive".to_string());
        }
        if self.lease_ttl <= self.gateway_timeout {
            return Err(format!(
                "lease ttl ({:?}) must exceed the gateway timeout ({:?})",
                self.lease_ttl, self.gateway_timeout
            ));
        }
        if self.lease_ttl > MAX_LEASE_TTL {
            return Err(format!(
                "lease ttl ({:?}) must not exceed {:?}",
                self.lease_ttl, MAX_LEASE_TTL
            ));
        }
        if self.stuck_after > MAX_STUCK_AFTER {
            return Err(format!(
                "stuck_after ({:?}) must not exceed {:?}",
                self.stuck_after, MAX_STUCK_AFTER
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err("retry max_attempts must be at least 1".to_string());
        }
        if self.retry.multiplier < 1.0 {
            return Err("retry multiplier must be at least 1.0".to_string());
        }
        Ok(())
    }

    fn lease_ttl_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease_ttl).unwrap_or(chrono::Duration::MAX)
    }

    fn stuck_after_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.stuck_after).unwrap_or(chrono::Duration::MAX)
    }
}

/// 失効一覧のエントリ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationEntry {
    pub serial_number: String,
    pub request_id: RequestId,
    pub reason: RevocationReason,
    pub revoked_at: DateTime<Utc>,
    pub revoked_by: String,
}

/// 証明書の検証結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateVerification {
    pub serial_number: String,
    pub request_id: RequestId,
    pub status: ArtifactStatus,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub revocation: Option<Revocation>,
    pub checked_at: DateTime<Utc>,
}

/// 発行に失敗したまま残ったリクエスト
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedIssuance {
    pub request_id: RequestId,
    pub owner: String,
    pub approved_at: DateTime<Utc>,
    pub failed_attempts: u32,
    pub last_error: String,
}

/// 滞留リクエスト再処理の結果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// 調べたApprovedリクエスト数
    pub examined: usize,
    /// 発行できたリクエスト
    pub issued: Vec<RequestId>,
    /// 有効なリースがあり進行中のもの
    pub in_flight: usize,
    /// まだ滞留とみなさないもの
    pub not_due: usize,
    /// 再処理中に他の経路で片付いたもの
    pub skipped: usize,
    /// 再試行を使い切っても発行できなかったもの
    pub unresolved: Vec<UnresolvedIssuance>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// レジャーのエラーを操作のコンテキストでライフサイクルエラーに変換
fn from_ledger(action: Action, err: LedgerError) -> LifecycleError {
    match err {
        LedgerError::NotFound(id) => LifecycleError::NotFound(id),
        LedgerError::Conflict {
            id,
            expected,
            actual,
        } => LifecycleError::Conflict {
            id,
            action,
            expected,
            actual,
        },
        LedgerError::LeaseHeld { id, holder } => LifecycleError::IssuanceInProgress { id, holder },
        LedgerError::FenceRejected { id } => LifecycleError::LeaseLost { id },
        other => LifecycleError::Storage(other.to_string()),
    }
}

/// 証明書リクエストのライフサイクルエンジン
///
/// 状態を持たず、`Clone` は `Arc` の複製のみ。レジャーへの書き込みと
/// 監査記録は `tasks` 上のタスクで実行され、呼び出し元が中断されても完了する。
#[derive(Clone)]
pub struct LifecycleEngine {
    ledger: Arc<dyn RequestLedger>,
    gateway: Arc<dyn IssuanceGateway>,
    audit: Arc<dyn AuditSink>,
    settings: Arc<EngineSettings>,
    tasks: TaskTracker,
}

impl LifecycleEngine {
    pub fn new(
        ledger: Arc<dyn RequestLedger>,
        gateway: Arc<dyn IssuanceGateway>,
        audit: Arc<dyn AuditSink>,
        settings: EngineSettings,
    ) -> crate::error::Result<Self> {
        settings.validate().map_err(Error::Config)?;
        Ok(Self {
            ledger,
            gateway,
            audit,
            settings: Arc::new(settings),
            tasks: TaskTracker::new(),
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// 実行中の遷移タスクと監査記録がすべて終わるまで待つ
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// 新しいリクエストを申請（Pending）
    pub async fn submit_request(
        &self,
        identity: &Identity,
        subject: SubjectInfo,
    ) -> EngineResult<RequestId> {
        authorize(identity, Action::Submit)?;
        subject.check().map_err(LifecycleError::InvalidSubject)?;

        let request = CertificateRequest::new(identity.id.clone(), subject, Utc::now());
        self.detached(self.clone().record_submission(request)).await
    }

    async fn record_submission(self, request: CertificateRequest) -> EngineResult<RequestId> {
        let (owner, at) = (request.owner.clone(), request.created_at);
        let id = self
            .ledger
            .create(request)
            .await
            .map_err(|e| from_ledger(Action::Submit, e))?;

        self.emit_audit(AuditRecord::new(id, None, RequestState::Pending, owner.clone(), at));
        info!(request_id = %id, owner = %owner, "Certificate request submitted");
        Ok(id)
    }

    /// リクエストを取得（所有者または管理者）
    pub async fn get_request(
        &self,
        identity: &Identity,
        id: RequestId,
    ) -> EngineResult<CertificateRequest> {
        authorize(identity, Action::Read)?;
        let request = self
            .ledger
            .get(id)
            .await
            .map_err(|e| from_ledger(Action::Read, e))?;
        authorize_owned(identity, Action::Read, &request)?;
        Ok(request)
    }

    /// 自分のリクエスト一覧
    pub async fn list_mine(&self, identity: &Identity) -> EngineResult<Vec<CertificateRequest>> {
        authorize(identity, Action::ListOwn)?;
        self.ledger
            .list_by_owner(&identity.id)
            .await
            .map_err(|e| from_ledger(Action::ListOwn, e))
    }

    /// 審査待ち一覧
    pub async fn list_pending(&self, identity: &Identity) -> EngineResult<Vec<CertificateRequest>> {
        authorize(identity, Action::ListPending)?;
        self.ledger
            .list_pending()
            .await
            .map_err(|e| from_ledger(Action::ListPending, e))
    }

    /// 全リクエスト一覧
    pub async fn list_all(&self, identity: &Identity) -> EngineResult<Vec<CertificateRequest>> {
        authorize(identity, Action::ListAll)?;
        self.ledger
            .list_all()
            .await
            .map_err(|e| from_ledger(Action::ListAll, e))
    }

    /// 承認し、続けて発行する
    ///
    /// 発行が再試行を使い切っても失敗した場合、承認は確定したまま
    /// `GatewayFailure` を返す。
    pub async fn approve(
        &self,
        identity: &Identity,
        id: RequestId,
    ) -> EngineResult<CertificateRequest> {
        authorize(identity, Action::Approve)?;
        let approved = self
            .transition(
                id,
                Action::Approve,
                StateChange::review(RequestState::Approved, identity.id.clone()),
            )
            .await?;

        match self.issue_with_retry(id).await {
            Ok(issued) => Ok(issued),
            Err(e @ LifecycleError::GatewayFailure { .. }) => {
                warn!(request_id = %id, "Approved but issuance failed: {}", e);
                Err(e)
            }
            Err(e) if e.is_conflict() => {
                debug!(request_id = %id, "Issuance handled by another attempt: {}", e);
                match self.ledger.get(id).await {
                    Ok(current) => Ok(current),
                    Err(read_error) => {
                        warn!(
                            request_id = %id,
                            "Could not re-read request after issuance race: {}",
                            read_error
                        );
                        Ok(approved)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// 却下
    pub async fn reject(
        &self,
        identity: &Identity,
        id: RequestId,
    ) -> EngineResult<CertificateRequest> {
        authorize(identity, Action::Reject)?;
        self.transition(
            id,
            Action::Reject,
            StateChange::review(RequestState::Rejected, identity.id.clone()),
        )
        .await
    }

    /// 失効（理由なし）
    pub async fn revoke(
        &self,
        identity: &Identity,
        id: RequestId,
    ) -> EngineResult<CertificateRequest> {
        self.revoke_with_reason(identity, id, RevocationReason::Unspecified)
            .await
    }

    /// 失効。成果物は保持され、無効として扱われる
    pub async fn revoke_with_reason(
        &self,
        identity: &Identity,
        id: RequestId,
        reason: RevocationReason,
    ) -> EngineResult<CertificateRequest> {
        authorize(identity, Action::Revoke)?;
        let revocation = Revocation {
            reason,
            revoked_at: Utc::now(),
            revoked_by: identity.id.clone(),
        };
        self.transition(id, Action::Revoke, StateChange::revoke(revocation))
            .await
    }

    /// Approvedのリクエストを一回だけ発行試行する
    pub async fn issue(&self, identity: &Identity, id: RequestId) -> EngineResult<CertificateRequest> {
        authorize(identity, Action::Issue)?;
        self.issue_once(&identity.id, id).await
    }

    /// Approvedのまま滞留したリクエストを再発行する
    pub async fn reconcile_stuck(&self, identity: &Identity) -> EngineResult<ReconcileReport> {
        authorize(identity, Action::Reconcile)?;

        let now = Utc::now();
        let approved = self
            .ledger
            .list_by_state(RequestState::Approved)
            .await
            .map_err(|e| from_ledger(Action::Reconcile, e))?;

        let mut report = ReconcileReport {
            examined: approved.len(),
            ..ReconcileReport::default()
        };

        let mut due = Vec::new();
        for request in approved {
            let approved_at = request.approved_at().unwrap_or(request.updated_at);
            if now - approved_at < self.settings.stuck_after_chrono() {
                report.not_due += 1;
            } else if request
                .issuance
                .lease
                .as_ref()
                .is_some_and(|lease| lease.is_live_at(now))
            {
                report.in_flight += 1;
            } else {
                due.push((request, approved_at));
            }
        }

        let outcomes = join_all(due.iter().map(|(request, _)| self.issue_with_retry(request.id))).await;

        for ((request, approved_at), outcome) in due.into_iter().zip(outcomes) {
            match outcome {
                Ok(_) => report.issued.push(request.id),
                Err(e) if e.is_conflict() => {
                    debug!(request_id = %request.id, "Reconcile skipped: {}", e);
                    report.skipped += 1;
                }
                Err(e) => {
                    let latest = match self.ledger.get(request.id).await {
                        Ok(latest) => latest,
                        Err(read_error) => {
                            warn!(
                                request_id = %request.id,
                                "Could not re-read unresolved request: {}",
                                read_error
                            );
                            request
                        }
                    };
                    error!(
                        request_id = %latest.id,
                        owner = %latest.owner,
                        failed_attempts = latest.issuance.failed_attempts,
                        "Issuance unresolved after retries: {}",
                        e
                    );
                    report.unresolved.push(UnresolvedIssuance {
                        request_id: latest.id,
                        owner: latest.owner,
                        approved_at,
                        failed_attempts: latest.issuance.failed_attempts,
                        last_error: latest.issuance.last_error.unwrap_or_else(|| e.to_string()),
                    });
                }
            }
        }

        info!(
            examined = report.examined,
            issued = report.issued.len(),
            unresolved = report.unresolved.len(),
            "Reconcile pass finished"
        );
        Ok(report)
    }

    /// 失効済み証明書の一覧
    pub async fn revocation_list(&self, identity: &Identity) -> EngineResult<Vec<RevocationEntry>> {
        authorize(identity, Action::ViewRevocations)?;
        let revoked = self
            .ledger
            .list_by_state(RequestState::Revoked)
            .await
            .map_err(|e| from_ledger(Action::ViewRevocations, e))?;

        Ok(revoked
            .into_iter()
            .filter_map(|request| {
                let artifact = request.artifact?;
                let revocation = artifact.revocation?;
                Some(RevocationEntry {
                    serial_number: artifact.serial_number,
                    request_id: request.id,
                    reason: revocation.reason,
                    revoked_at: revocation.revoked_at,
                    revoked_by: revocation.revoked_by,
                })
            })
            .collect())
    }

    /// シリアル番号で証明書の有効性を確認（所有者または管理者）
    pub async fn verify_certificate(
        &self,
        identity: &Identity,
        serial: &str,
    ) -> EngineResult<CertificateVerification> {
        authorize(identity, Action::Verify)?;
        let request = self
            .ledger
            .find_by_serial(serial)
            .await
            .map_err(|e| from_ledger(Action::Verify, e))?
            .ok_or_else(|| LifecycleError::CertificateNotFound(serial.to_string()))?;
        authorize_owned(identity, Action::Verify, &request)?;

        let artifact = request
            .artifact
            .ok_or_else(|| LifecycleError::CertificateNotFound(serial.to_string()))?;
        let now = Utc::now();

        Ok(CertificateVerification {
            serial_number: artifact.serial_number.clone(),
            request_id: request.id,
            status: artifact.status_at(now),
            not_before: artifact.not_before,
            not_after: artifact.not_after,
            revocation: artifact.revocation,
            checked_at: now,
        })
    }

    /// 呼び出し元が中断されても最後まで実行されるタスクとして動かす
    async fn detached<T, F>(&self, task: F) -> EngineResult<T>
    where
        F: Future<Output = EngineResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.tasks
            .spawn(task)
            .await
            .map_err(|e| LifecycleError::Storage(format!("engine task failed: {}", e)))?
    }

    async fn transition(
        &self,
        id: RequestId,
        action: Action,
        change: StateChange,
    ) -> EngineResult<CertificateRequest> {
        self.detached(self.clone().apply_transition(id, action, change))
            .await
    }

    /// 状態を確認してから compare-and-transition を行い、監査記録を出す
    async fn apply_transition(
        self,
        id: RequestId,
        action: Action,
        change: StateChange,
    ) -> EngineResult<CertificateRequest> {
        let current = self
            .ledger
            .get(id)
            .await
            .map_err(|e| from_ledger(action, e))?;

        if current.state != change.expected {
            warn!(
                request_id = %id,
                action = %action,
                state = %current.state,
                "Transition not allowed from current state"
            );
            return Err(LifecycleError::InvalidTransition {
                id,
                action,
                actual: current.state,
            });
        }

        let (from, to, actor, at) = (change.expected, change.next, change.actor.clone(), change.at);
        let updated = self
            .ledger
            .compare_and_transition(id, change)
            .await
            .map_err(|e| {
                warn!(request_id = %id, action = %action, "Transition lost: {}", e);
                from_ledger(action, e)
            })?;

        self.emit_audit(AuditRecord::new(id, Some(from), to, actor.clone(), at));
        info!(request_id = %id, from = %from, to = %to, actor = %actor, "Request transitioned");
        Ok(updated)
    }

    async fn issue_with_retry(&self, id: RequestId) -> EngineResult<CertificateRequest> {
        self.settings
            .retry
            .execute(|_| {
                let engine = self.clone();
                async move { engine.issue_once(Identity::SYSTEM_ID, id).await }
            })
            .await
    }

    /// リースを取得し、ゲートウェイ呼び出しを別タスクで完了させる
    async fn issue_once(&self, actor: &str, id: RequestId) -> EngineResult<CertificateRequest> {
        let current = self
            .ledger
            .get(id)
            .await
            .map_err(|e| from_ledger(Action::Issue, e))?;

        if current.state != RequestState::Approved {
            return Err(LifecycleError::InvalidTransition {
                id,
                action: Action::Issue,
                actual: current.state,
            });
        }

        let lease = self
            .ledger
            .begin_issuance(id, actor, Utc::now(), self.settings.lease_ttl_chrono())
            .await
            .map_err(|e| from_ledger(Action::Issue, e))?;

        let ticket = IssuanceTicket {
            request_id: id,
            attempt: lease.attempt,
            requested_by: current.owner,
            subject: current.subject,
        };

        // 呼び出し元が中断されても結果をレジャーに反映させる
        self.detached(
            self.clone()
                .complete_issuance(actor.to_string(), ticket, lease.token),
        )
        .await
    }

    async fn complete_issuance(
        self,
        actor: String,
        ticket: IssuanceTicket,
        token: uuid::Uuid,
    ) -> EngineResult<CertificateRequest> {
        let id = ticket.request_id;
        let attempt = ticket.attempt;
        debug!(request_id = %id, attempt, "Calling issuance gateway");

        let reason = match timeout(self.settings.gateway_timeout, self.gateway.issue(ticket)).await {
            Ok(Ok(artifact)) => {
                let at = Utc::now();
                let change = StateChange::issue(actor.clone(), artifact, token).at(at);
                return match self.ledger.compare_and_transition(id, change).await {
                    Ok(issued) => {
                        self.emit_audit(AuditRecord::new(
                            id,
                            Some(RequestState::Approved),
                            RequestState::Issued,
                            actor.clone(),
                            at,
                        ));
                        info!(request_id = %id, attempt, actor = %actor, "Certificate issued");
                        Ok(issued)
                    }
                    Err(e) => {
                        warn!(request_id = %id, attempt, "Issued artifact could not be recorded: {}", e);
                        if let LedgerError::Storage(ref reason) = e {
                            self.release(id, token, reason.clone()).await;
                        }
                        Err(from_ledger(Action::Issue, e))
                    }
                };
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "gateway did not respond within {:?}",
                self.settings.gateway_timeout
            ),
        };

        warn!(request_id = %id, attempt, "Issuance attempt failed: {}", reason);
        self.release(id, token, reason.clone()).await;
        Err(LifecycleError::GatewayFailure {
            id,
            attempt,
            reason,
        })
    }

    async fn release(&self, id: RequestId, token: uuid::Uuid, reason: String) {
        if let Err(e) = self.ledger.release_issuance(id, token, Some(reason)).await {
            warn!(request_id = %id, "Failed to release issuance lease: {}", e);
        }
    }

    /// 監査記録を送る。失敗とタイムアウトはログのみ
    fn emit_audit(&self, record: AuditRecord) {
        let audit = self.audit.clone();
        let limit = self.settings.audit_timeout;
        self.tasks.spawn(async move {
            let request_id = record.request_id;
            match timeout(limit, audit.record(record)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(request_id = %request_id, "Audit record failed: {}", e),
                Err(_) => warn!(
                    request_id = %request_id,
                    "Audit record timed out after {:?}",
                    limit
                ),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditError, MemoryAuditSink};
    use crate::issuance::{GatewayError, MockIssuanceGateway};
    use crate::ledger::InMemoryRequestLedger;
    use crate::lifecycle::types::CertificateArtifact;
    use async_trait::async_trait;

    fn artifact_for(ticket: &IssuanceTicket) -> CertificateArtifact {
        let now = Utc::now();
        CertificateArtifact {
            serial_number: format!("{:032x}", ticket.request_id.as_uuid().as_u128()),
            issuer: "Mock CA".to_string(),
            certificate_pem: "-----BEGIN CERTIFICATE-----\n-----END CERTIFICATE-----\n".to_string(),
            fingerprint_sha256: "00".repeat(32),
            not_before: now,
            not_after: now + chrono::Duration::days(30),
            issued_at: now,
            revocation: None,
        }
    }

    fn fast_settings() -> EngineSettings {
        EngineSettings {
            lease_ttl: Duration::from_secs(5),
            gateway_timeout: Duration::from_millis(200),
            audit_timeout: Duration::from_millis(100),
            stuck_after: Duration::ZERO,
            retry: RetryPolicy {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                multiplier: 2.0,
                max_attempts: 1,
            },
        }
    }

    fn engine_with(
        gateway: impl IssuanceGateway + 'static,
        settings: EngineSettings,
    ) -> (LifecycleEngine, MemoryAuditSink) {
        let audit = MemoryAuditSink::default();
        let engine = LifecycleEngine::new(
            Arc::new(InMemoryRequestLedger::new()),
            Arc::new(gateway),
            Arc::new(audit.clone()),
            settings,
        )
        .unwrap();
        (engine, audit)
    }

    #[test]
    fn test_settings_require_lease_longer_than_gateway_timeout() {
        let settings = EngineSettings {
            lease_ttl: Duration::from_secs(10),
            gateway_timeout: Duration::from_secs(10),
            ..EngineSettings::default()
        };
        assert!(settings.validate().is_err());
        assert!(EngineSettings::default().validate().is_ok());
    }

    #[test]
    fn test_settings_bound_lease_and_stuck_after() {
        let huge_lease = EngineSettings {
            lease_ttl: Duration::from_secs(u64::MAX / 2),
            ..EngineSettings::default()
        };
        assert!(huge_lease.validate().unwrap_err().contains("lease ttl"));

        let huge_stuck = EngineSettings {
            stuck_after: Duration::MAX,
            ..EngineSettings::default()
        };
        assert!(huge_stuck.validate().unwrap_err().contains("stuck_after"));

        let at_limit = EngineSettings {
            lease_ttl: MAX_LEASE_TTL,
            stuck_after: MAX_STUCK_AFTER,
            ..EngineSettings::default()
        };
        assert!(at_limit.validate().is_ok());

        let result = LifecycleEngine::new(
            Arc::new(InMemoryRequestLedger::new()),
            Arc::new(MockIssuanceGateway::new()),
            Arc::new(MemoryAuditSink::default()),
            huge_lease,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_approve_issues_once() {
        let mut gateway = MockIssuanceGateway::new();
        gateway
            .expect_issue()
            .times(1)
            .returning(|ticket| Ok(artifact_for(&ticket)));
        let (engine, audit) = engine_with(gateway, fast_settings());

        let alice = Identity::user("alice");
        let admin = Identity::admin("root");
        let id = engine
            .submit_request(&alice, SubjectInfo::new("alice.example"))
            .await
            .unwrap();

        let issued = engine.approve(&admin, id).await.unwrap();
        assert_eq!(issued.state, RequestState::Issued);
        assert_eq!(issued.reviewer.as_deref(), Some("root"));
        assert!(issued.artifact.is_some());
        assert!(issued.check_invariants().is_ok());

        engine.drain().await;

        let trail: Vec<RequestState> = audit
            .for_request(id)
            .await
            .into_iter()
            .map(|r| r.to_state)
            .collect();
        assert_eq!(
            trail,
            vec![RequestState::Pending, RequestState::Approved, RequestState::Issued]
        );
    }

    #[tokio::test]
    async fn test_gateway_failure_leaves_request_approved() {
        let mut gateway = MockIssuanceGateway::new();
        let mut calls = 0;
        gateway.expect_issue().times(2).returning(move |ticket| {
            calls += 1;
            if calls == 1 {
                Err(GatewayError::Unavailable("hsm offline".to_string()))
            } else {
                Ok(artifact_for(&ticket))
            }
        });
        let (engine, _audit) = engine_with(gateway, fast_settings());

        let admin = Identity::admin("root");
        let id = engine
            .submit_request(&Identity::user("alice"), SubjectInfo::new("alice"))
            .await
            .unwrap();

        let err = engine.approve(&admin, id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::GatewayFailure { attempt: 1, .. }));

        let stuck = engine.get_request(&admin, id).await.unwrap();
        assert_eq!(stuck.state, RequestState::Approved);
        assert_eq!(stuck.issuance.failed_attempts, 1);
        assert!(stuck.issuance.lease.is_none());
        assert!(stuck.issuance.last_error.unwrap().contains("hsm offline"));

        let issued = engine.issue(&admin, id).await.unwrap();
        assert_eq!(issued.state, RequestState::Issued);
        assert_eq!(issued.issuance.attempts, 2);
    }

    #[tokio::test]
    async fn test_retry_policy_drives_issuance() {
        let mut gateway = MockIssuanceGateway::new();
        let mut calls = 0;
        gateway.expect_issue().times(3).returning(move |ticket| {
            calls += 1;
            if calls < 3 {
                Err(GatewayError::Unavailable("busy".to_string()))
            } else {
                Ok(artifact_for(&ticket))
            }
        });
        let mut settings = fast_settings();
        settings.retry.max_attempts = 3;
        let (engine, _audit) = engine_with(gateway, settings);

        let id = engine
            .submit_request(&Identity::user("alice"), SubjectInfo::new("alice"))
            .await
            .unwrap();
        let issued = engine.approve(&Identity::admin("root"), id).await.unwrap();

        assert_eq!(issued.state, RequestState::Issued);
        assert_eq!(issued.issuance.failed_attempts, 2);
    }

    #[tokio::test]
    async fn test_unauthorized_calls_do_not_touch_ledger() {
        let gateway = MockIssuanceGateway::new();
        let (engine, audit) = engine_with(gateway, fast_settings());

        let alice = Identity::user("alice");
        let id = engine
            .submit_request(&alice, SubjectInfo::new("alice"))
            .await
            .unwrap();

        for result in [
            engine.approve(&alice, id).await,
            engine.reject(&alice, id).await,
            engine.revoke(&alice, id).await,
        ] {
            assert!(matches!(result, Err(LifecycleError::Unauthorized { .. })));
        }
        assert!(matches!(
            engine.list_pending(&alice).await,
            Err(LifecycleError::Unauthorized { .. })
        ));

        let request = engine.get_request(&alice, id).await.unwrap();
        assert_eq!(request.state, RequestState::Pending);
        engine.drain().await;
        assert_eq!(audit.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_subject_is_rejected() {
        let (engine, audit) = engine_with(MockIssuanceGateway::new(), fast_settings());
        let result = engine
            .submit_request(&Identity::user("alice"), SubjectInfo::new(""))
            .await;

        assert!(matches!(result, Err(LifecycleError::InvalidSubject(_))));
        assert!(audit.records().await.is_empty());
    }

    struct SlowGateway;

    #[async_trait]
    impl IssuanceGateway for SlowGateway {
        async fn issue(
            &self,
            ticket: IssuanceTicket,
        ) -> Result<CertificateArtifact, GatewayError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(artifact_for(&ticket))
        }
    }

    #[tokio::test]
    async fn test_gateway_timeout_is_a_gateway_failure() {
        let (engine, _audit) = engine_with(SlowGateway, fast_settings());
        let admin = Identity::admin("root");
        let id = engine
            .submit_request(&Identity::user("alice"), SubjectInfo::new("alice"))
            .await
            .unwrap();

        let err = engine.approve(&admin, id).await.unwrap_err();
        assert!(err.to_string().contains("did not respond"));

        let request = engine.get_request(&admin, id).await.unwrap();
        assert_eq!(request.state, RequestState::Approved);
        assert!(request.issuance.lease.is_none());
    }

    struct BrokenAuditSink;

    #[async_trait]
    impl AuditSink for BrokenAuditSink {
        async fn record(&self, _record: AuditRecord) -> Result<(), AuditError> {
            Err(AuditError::Unavailable("disk full".to_string()))
        }
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_fail_operation() {
        let engine = LifecycleEngine::new(
            Arc::new(InMemoryRequestLedger::new()),
            Arc::new(MockIssuanceGateway::new()),
            Arc::new(BrokenAuditSink),
            fast_settings(),
        )
        .unwrap();

        let id = engine
            .submit_request(&Identity::user("alice"), SubjectInfo::new("alice"))
            .await
            .unwrap();
        let rejected = engine.reject(&Identity::admin("root"), id).await.unwrap();
        assert_eq!(rejected.state, RequestState::Rejected);
    }

    /// 記録に時間のかかる監査シンク
    #[derive(Clone, Default)]
    struct SlowAuditSink {
        inner: MemoryAuditSink,
    }

    #[async_trait]
    impl AuditSink for SlowAuditSink {
        async fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.inner.record(record).await
        }
    }

    #[tokio::test]
    async fn test_slow_audit_does_not_block_transition() {
        let audit = SlowAuditSink::default();
        let mut settings = fast_settings();
        settings.audit_timeout = Duration::from_secs(1);
        let engine = LifecycleEngine::new(
            Arc::new(InMemoryRequestLedger::new()),
            Arc::new(MockIssuanceGateway::new()),
            Arc::new(audit.clone()),
            settings,
        )
        .unwrap();

        let started = std::time::Instant::now();
        engine
            .submit_request(&Identity::user("alice"), SubjectInfo::new("alice"))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(250));

        engine.drain().await;
        assert_eq!(audit.inner.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_reject_is_still_audited() {
        let audit = SlowAuditSink::default();
        let mut settings = fast_settings();
        settings.audit_timeout = Duration::from_secs(1);
        let engine = LifecycleEngine::new(
            Arc::new(InMemoryRequestLedger::new()),
            Arc::new(MockIssuanceGateway::new()),
            Arc::new(audit.clone()),
            settings,
        )
        .unwrap();

        let admin = Identity::admin("root");
        let id = engine
            .submit_request(&Identity::user("alice"), SubjectInfo::new("alice"))
            .await
            .unwrap();

        // 呼び出し元は結果を待たずに諦める
        let _ = tokio::time::timeout(Duration::ZERO, engine.reject(&admin, id)).await;

        engine.drain().await;
        let request = engine.get_request(&admin, id).await.unwrap();
        assert_eq!(request.state, RequestState::Rejected);
        assert_eq!(request.history.len(), 2);

        let trail: Vec<RequestState> = audit
            .inner
            .for_request(id)
            .await
            .into_iter()
            .map(|r| r.to_state)
            .collect();
        assert_eq!(trail, vec![RequestState::Pending, RequestState::Rejected]);
    }

    #[tokio::test]
    async fn test_reconcile_reissues_stuck_requests() {
        let mut gateway = MockIssuanceGateway::new();
        let mut calls = 0;
        gateway.expect_issue().times(2).returning(move |ticket| {
            calls += 1;
            if calls == 1 {
                Err(GatewayError::Unavailable("maintenance".to_string()))
            } else {
                Ok(artifact_for(&ticket))
            }
        });
        let (engine, _audit) = engine_with(gateway, fast_settings());

        let admin = Identity::admin("root");
        let id = engine
            .submit_request(&Identity::user("alice"), SubjectInfo::new("alice"))
            .await
            .unwrap();
        assert!(engine.approve(&admin, id).await.is_err());

        let report = engine.reconcile_stuck(&Identity::system()).await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.issued, vec![id]);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_reconcile_reports_unresolved() {
        let mut gateway = MockIssuanceGateway::new();
        gateway
            .expect_issue()
            .returning(|_| Err(GatewayError::Unavailable("down".to_string())));
        let (engine, _audit) = engine_with(gateway, fast_settings());

        let admin = Identity::admin("root");
        let id = engine
            .submit_request(&Identity::user("alice"), SubjectInfo::new("alice"))
            .await
            .unwrap();
        assert!(engine.approve(&admin, id).await.is_err());

        let report = engine.reconcile_stuck(&admin).await.unwrap();
        assert_eq!(report.unresolved.len(), 1);
        assert_eq!(report.unresolved[0].request_id, id);
        assert_eq!(report.unresolved[0].failed_attempts, 2);
        assert!(report.unresolved[0].last_error.contains("down"));
    }

    /// 読み出しだけを途中から失敗させるレジャー
    struct ReadFailingLedger {
        inner: InMemoryRequestLedger,
        fail_reads: std::sync::atomic::AtomicBool,
    }

    impl ReadFailingLedger {
        fn break_reads(&self) {
            self.fail_reads
                .store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RequestLedger for ReadFailingLedger {
        async fn create(&self, request: CertificateRequest) -> Result<RequestId, LedgerError> {
            self.inner.create(request).await
        }

        async fn get(&self, id: RequestId) -> Result<CertificateRequest, LedgerError> {
            if self.fail_reads.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(LedgerError::Storage("disk I/O error".to_string()));
            }
            self.inner.get(id).await
        }

        async fn compare_and_transition(
            &self,
            id: RequestId,
            change: StateChange,
        ) -> Result<CertificateRequest, LedgerError> {
            self.inner.compare_and_transition(id, change).await
        }

        async fn list_by_owner(&self, owner: &str) -> Result<Vec<CertificateRequest>, LedgerError> {
            self.inner.list_by_owner(owner).await
        }

        async fn list_by_state(
            &self,
            state: RequestState,
        ) -> Result<Vec<CertificateRequest>, LedgerError> {
            self.inner.list_by_state(state).await
        }

        async fn list_all(&self) -> Result<Vec<CertificateRequest>, LedgerError> {
            self.inner.list_all().await
        }

        async fn find_by_serial(
            &self,
            serial: &str,
        ) -> Result<Option<CertificateRequest>, LedgerError> {
            self.inner.find_by_serial(serial).await
        }

        async fn begin_issuance(
            &self,
            id: RequestId,
            holder: &str,
            now: DateTime<Utc>,
            ttl: chrono::Duration,
        ) -> Result<crate::lifecycle::types::IssuanceLease, LedgerError> {
            self.inner.begin_issuance(id, holder, now, ttl).await
        }

        async fn release_issuance(
            &self,
            id: RequestId,
            token: uuid::Uuid,
            error: Option<String>,
        ) -> Result<(), LedgerError> {
            self.inner.release_issuance(id, token, error).await
        }
    }

    #[tokio::test]
    async fn test_reconcile_reports_unresolved_when_reread_fails() {
        let ledger = Arc::new(ReadFailingLedger {
            inner: InMemoryRequestLedger::new(),
            fail_reads: std::sync::atomic::AtomicBool::new(false),
        });
        let mut gateway = MockIssuanceGateway::new();
        let breaker = ledger.clone();
        gateway.expect_issue().times(1).returning(move |_| {
            breaker.break_reads();
            Err(GatewayError::Unavailable("down".to_string()))
        });
        let engine = LifecycleEngine::new(
            ledger.clone(),
            Arc::new(gateway),
            Arc::new(MemoryAuditSink::default()),
            fast_settings(),
        )
        .unwrap();

        let id = engine
            .submit_request(&Identity::user("alice"), SubjectInfo::new("alice"))
            .await
            .unwrap();
        ledger
            .compare_and_transition(id, StateChange::review(RequestState::Approved, "root"))
            .await
            .unwrap();

        let report = engine.reconcile_stuck(&Identity::system()).await.unwrap();
        assert_eq!(report.unresolved.len(), 1);
        let unresolved = &report.unresolved[0];
        assert_eq!(unresolved.request_id, id);
        assert_eq!(unresolved.owner, "alice");
        // 再読込できないので一覧取得時点の値を使う
        assert_eq!(unresolved.failed_attempts, 0);
        assert!(unresolved.last_error.contains("down"));
    }

    #[tokio::test]
    async fn test_reconcile_waits_for_stuck_after() {
        let mut gateway = MockIssuanceGateway::new();
        gateway
            .expect_issue()
            .times(1)
            .returning(|_| Err(GatewayError::Unavailable("down".to_string())));
        let mut settings = fast_settings();
        settings.stuck_after = Duration::from_secs(3600);
        let (engine, _audit) = engine_with(gateway, settings);

        let admin = Identity::admin("root");
        let id = engine
            .submit_request(&Identity::user("alice"), SubjectInfo::new("alice"))
            .await
            .unwrap();
        assert!(engine.approve(&admin, id).await.is_err());

        let report = engine.reconcile_stuck(&admin).await.unwrap();
        assert_eq!(report.not_due, 1);
        assert!(report.issued.is_empty());
    }
}
