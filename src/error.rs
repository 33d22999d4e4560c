//! Error types for the certificate lifecycle engine.

use crate::audit::AuditError;
use crate::identity::{AuthFailure, Role};
use crate::lifecycle::policy::Action;
use crate::lifecycle::types::{RequestId, RequestState};
use thiserror::Error;

/// Result type alias for crate-level operations
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// Lifecycle engine error
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Request ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Credential resolution error
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthFailure),

    /// Audit sink error
    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database error
    #[cfg(feature = "sqlite-backend")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

impl Error {
    /// CLIの終了コードに変換
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Lifecycle(e) => e.kind().exit_code(),
            Error::Auth(_) => ErrorKind::Unauthorized.exit_code(),
            Error::Config(_) => 78,
            _ => 1,
        }
    }
}

/// 呼び出し側（表示層）が区別すべきエラー分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 権限・所有者チェック失敗
    Unauthorized,
    /// 未知のリクエストID・シリアル番号
    NotFound,
    /// 状態不一致（不正遷移・競合負け）
    Conflict,
    /// 発行ゲートウェイ失敗（再試行可能）
    GatewayFailure,
    /// 入力不正
    Invalid,
    /// ストレージ等の内部エラー
    Internal,
}

impl ErrorKind {
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Unauthorized => 3,
            ErrorKind::NotFound => 4,
            ErrorKind::Conflict => 5,
            ErrorKind::GatewayFailure => 6,
            ErrorKind::Invalid => 2,
            ErrorKind::Internal => 1,
        }
    }
}

/// ライフサイクルエンジンのエラー
///
/// すべての失敗はストア上の状態を変更しない。
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// ロールまたは所有者チェックに失敗
    #[error("Unauthorized: {identity} ({role}) may not {action}")]
    Unauthorized {
        identity: String,
        role: Role,
        action: Action,
    },

    /// リクエストが存在しない
    #[error("Request not found: {0}")]
    NotFound(RequestId),

    /// シリアル番号に対応する証明書が存在しない
    #[error("Certificate not found: {0}")]
    CertificateNotFound(String),

    /// 現在の状態からは許可されない遷移
    #[error("Invalid transition: cannot {action} request {id} in state {actual}")]
    InvalidTransition {
        id: RequestId,
        action: Action,
        actual: RequestState,
    },

    /// compare-and-transition で競合に負けた
    #[error("Conflict: request {id} left {expected} (now {actual}) before {action} could apply; re-fetch and retry")]
    Conflict {
        id: RequestId,
        action: Action,
        expected: RequestState,
        actual: RequestState,
    },

    /// 別の発行試行が進行中
    #[error("Issuance already in progress for request {id} (holder: {holder})")]
    IssuanceInProgress { id: RequestId, holder: String },

    /// 発行リースが別の試行に引き継がれた
    #[error("Issuance lease for request {id} was taken over by another attempt")]
    LeaseLost { id: RequestId },

    /// 発行ゲートウェイの失敗。リクエストはApprovedのまま
    #[error("Gateway failure for request {id} on attempt {attempt}: {reason}; request remains approved")]
    GatewayFailure {
        id: RequestId,
        attempt: u32,
        reason: String,
    },

    /// サブジェクト情報の検証エラー
    #[error("Invalid subject: {0}")]
    InvalidSubject(String),

    /// ストレージエラー
    #[error("Storage error: {0}")]
    Storage(String),
}

impl LifecycleError {
    /// エラー分類を取得
    pub fn kind(&self) -> ErrorKind {
        match self {
            LifecycleError::Unauthorized { .. } => ErrorKind::Unauthorized,
            LifecycleError::NotFound(_) | LifecycleError::CertificateNotFound(_) => {
                ErrorKind::NotFound
            }
            LifecycleError::InvalidTransition { .. }
            | LifecycleError::Conflict { .. }
            | LifecycleError::IssuanceInProgress { .. }
            | LifecycleError::LeaseLost { .. } => ErrorKind::Conflict,
            LifecycleError::GatewayFailure { .. } => ErrorKind::GatewayFailure,
            LifecycleError::InvalidSubject(_) => ErrorKind::Invalid,
            LifecycleError::Storage(_) => ErrorKind::Internal,
        }
    }

    /// 状態不一致カテゴリか
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    /// 再取得のうえ再試行する意味があるか
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LifecycleError::Conflict { .. }
                | LifecycleError::IssuanceInProgress { .. }
                | LifecycleError::GatewayFailure { .. }
        )
    }
}

/// リクエストレジャーのエラー
#[derive(Debug, Error)]
pub enum LedgerError {
    /// リクエストが存在しない
    #[error("Request not found: {0}")]
    NotFound(RequestId),

    /// 同じIDのリクエストが既に存在する
    #[error("Request already exists: {0}")]
    DuplicateId(RequestId),

    /// 保存されている状態が期待値と異なる
    #[error("Conflict on {id}: expected {expected}, found {actual}")]
    Conflict {
        id: RequestId,
        expected: RequestState,
        actual: RequestState,
    },

    /// 状態機械に存在しない遷移
    #[error("Illegal transition: {from} -> {to}")]
    IllegalTransition { from: RequestState, to: RequestState },

    /// 遷移に必要な付随データが欠けている
    #[error("Incomplete state change {from} -> {to}: {missing}")]
    IncompleteChange {
        from: RequestState,
        to: RequestState,
        missing: &'static str,
    },

    /// 有効な発行リースを他の試行が保持している
    #[error("Issuance lease for {id} held by {holder}")]
    LeaseHeld { id: RequestId, holder: String },

    /// フェンストークンが現在のリースと一致しない
    #[error("Fence token rejected for {id}")]
    FenceRejected { id: RequestId },

    /// ストレージエラー
    #[error("Storage error: {0}")]
    Storage(String),
}

#[cfg(feature = "sqlite-backend")]
impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Storage(format!("serialization failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_category() {
        let id = RequestId::new();
        let invalid = LifecycleError::InvalidTransition {
            id,
            action: Action::Approve,
            actual: RequestState::Rejected,
        };
        let lost = LifecycleError::Conflict {
            id,
            action: Action::Reject,
            expected: RequestState::Pending,
            actual: RequestState::Approved,
        };

        assert!(invalid.is_conflict());
        assert!(lost.is_conflict());
        assert!(!invalid.is_retryable());
        assert!(lost.is_retryable());
    }

    #[test]
    fn test_error_kinds_are_distinct() {
        let id = RequestId::new();
        let errors = [
            LifecycleError::Unauthorized {
                identity: "u".to_string(),
                role: Role::User,
                action: Action::Approve,
            },
            LifecycleError::NotFound(id),
            LifecycleError::Conflict {
                id,
                action: Action::Approve,
                expected: RequestState::Pending,
                actual: RequestState::Rejected,
            },
            LifecycleError::GatewayFailure {
                id,
                attempt: 1,
                reason: "down".to_string(),
            },
        ];

        let codes: Vec<i32> = errors.iter().map(|e| e.kind().exit_code()).collect();
        assert_eq!(codes, vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_gateway_failure_message() {
        let err = LifecycleError::GatewayFailure {
            id: RequestId::new(),
            attempt: 2,
            reason: "timeout".to_string(),
        };
        assert!(err.to_string().contains("remains approved"));
    }
}
