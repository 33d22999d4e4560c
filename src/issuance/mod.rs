//! Issuance Gateway
//!
//! 署名機能をラップする発行ゲートウェイ

pub mod local_ca;

use crate::lifecycle::types::{CertificateArtifact, RequestId, SubjectInfo};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use local_ca::{CaConfig, LocalCertificateAuthority};

/// 発行依頼
///
/// `request_id` は冪等キーを兼ねる。同じリクエストへの再依頼では
/// ゲートウェイは同じ成果物を返すこと。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuanceTicket {
    pub request_id: RequestId,
    /// 何回目の試行か（1始まり）
    pub attempt: u32,
    /// 申請者
    pub requested_by: String,
    pub subject: SubjectInfo,
}

/// ゲートウェイエラー
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// 一時的に利用できない
    #[error("Signing backend unavailable: {0}")]
    Unavailable(String),

    /// 署名ポリシーにより拒否
    #[error("Signing request rejected: {0}")]
    Rejected(String),

    #[error("Internal gateway error: {0}")]
    Internal(String),
}

/// 発行ゲートウェイ
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IssuanceGateway: Send + Sync {
    /// 証明書を署名して成果物を返す
    async fn issue(&self, ticket: IssuanceTicket) -> Result<CertificateArtifact, GatewayError>;
}
