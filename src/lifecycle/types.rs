//! Certificate Request Types
//!
//! 証明書リクエストのライフサイクルで扱う型定義

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::LazyLock;
use thiserror::Error;
use uuid::Uuid;
use validator::Validate;

static COMMON_NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9*]([A-Za-z0-9 ._*-]*[A-Za-z0-9])?$").expect("valid common name regex")
});

/// リクエストID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RequestId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// 文字列から列挙値への変換エラー
#[derive(Debug, Clone, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// リクエスト状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    /// 審査待ち（初期状態）
    Pending,
    /// 承認済み・発行待ち
    Approved,
    /// 却下（終端）
    Rejected,
    /// 発行済み
    Issued,
    /// 失効（終端）
    Revoked,
}

impl RequestState {
    pub const ALL: [RequestState; 5] = [
        RequestState::Pending,
        RequestState::Approved,
        RequestState::Rejected,
        RequestState::Issued,
        RequestState::Revoked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Pending => "pending",
            RequestState::Approved => "approved",
            RequestState::Rejected => "rejected",
            RequestState::Issued => "issued",
            RequestState::Revoked => "revoked",
        }
    }

    /// 終端状態か
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Rejected | RequestState::Revoked)
    }

    /// 状態機械の辺として存在する遷移か
    pub fn can_transition_to(&self, next: RequestState) -> bool {
        matches!(
            (self, next),
            (RequestState::Pending, RequestState::Approved)
                | (RequestState::Pending, RequestState::Rejected)
                | (RequestState::Approved, RequestState::Issued)
                | (RequestState::Issued, RequestState::Revoked)
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "request state",
                value: s.to_string(),
            })
    }
}

/// Key Usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyUsage {
    DigitalSignature,
    ContentCommitment,
    KeyEncipherment,
    DataEncipherment,
    KeyAgreement,
    CertificateSigning,
    CrlSigning,
    EncipherOnly,
    DecipherOnly,
}

impl KeyUsage {
    pub const ALL: [KeyUsage; 9] = [
        KeyUsage::DigitalSignature,
        KeyUsage::ContentCommitment,
        KeyUsage::KeyEncipherment,
        KeyUsage::DataEncipherment,
        KeyUsage::KeyAgreement,
        KeyUsage::CertificateSigning,
        KeyUsage::CrlSigning,
        KeyUsage::EncipherOnly,
        KeyUsage::DecipherOnly,
    ];
}

/// Extended Key Usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtendedKeyUsage {
    Any,
    ServerAuth,
    ClientAuth,
    CodeSigning,
    EmailProtection,
    IpsecEndSystem,
    IpsecTunnel,
    IpsecUser,
    TimeStamping,
    OcspSigning,
}

impl ExtendedKeyUsage {
    pub const ALL: [ExtendedKeyUsage; 10] = [
        ExtendedKeyUsage::Any,
        ExtendedKeyUsage::ServerAuth,
        ExtendedKeyUsage::ClientAuth,
        ExtendedKeyUsage::CodeSigning,
        ExtendedKeyUsage::EmailProtection,
        ExtendedKeyUsage::IpsecEndSystem,
        ExtendedKeyUsage::IpsecTunnel,
        ExtendedKeyUsage::IpsecUser,
        ExtendedKeyUsage::TimeStamping,
        ExtendedKeyUsage::OcspSigning,
    ];
}

/// 申請フォームで選択できる証明書パラメータ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateParameters {
    pub key_usages: Vec<KeyUsage>,
    pub extended_key_usages: Vec<ExtendedKeyUsage>,
}

/// サポートしている証明書パラメータの一覧
pub fn certificate_parameters() -> CertificateParameters {
    CertificateParameters {
        key_usages: KeyUsage::ALL.to_vec(),
        extended_key_usages: ExtendedKeyUsage::ALL.to_vec(),
    }
}

fn default_validity_days() -> u32 {
    365
}

/// 申請されたサブジェクト情報
///
/// 状態機械からは不透明。作成前に [`SubjectInfo::check`] で検証される。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct SubjectInfo {
    /// Common Name
    #[validate(length(min = 1, max = 64))]
    pub common_name: String,
    /// Organization
    #[validate(length(min = 1, max = 64))]
    pub organization: Option<String>,
    /// Country（ISO 3166 alpha-2）
    pub country: Option<String>,
    /// IPアドレス（SAN）
    pub ip_address: Option<String>,
    /// Key Usage
    #[serde(default)]
    pub key_usages: Vec<KeyUsage>,
    /// Extended Key Usage
    #[serde(default)]
    pub extended_key_usages: Vec<ExtendedKeyUsage>,
    /// CA証明書として申請するか
    #[serde(default)]
    pub is_ca: bool,
    /// 有効期限（日数）
    #[serde(default = "default_validity_days")]
    #[validate(range(min = 1, max = 3650))]
    pub validity_days: u32,
}

impl SubjectInfo {
    /// Common Nameのみを指定したサブジェクト
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            organization: None,
            country: None,
            ip_address: None,
            key_usages: vec![KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment],
            extended_key_usages: vec![ExtendedKeyUsage::ClientAuth],
            is_ca: false,
            validity_days: default_validity_days(),
        }
    }

    /// サブジェクト情報を検証
    pub fn check(&self) -> Result<(), String> {
        let mut problems = Vec::new();

        if let Err(errors) = self.validate() {
            for (field, field_errors) in errors.field_errors() {
                for error in field_errors.iter() {
                    problems.push(format!("{}: {}", field, error.code));
                }
            }
        }

        if !self.common_name.is_empty() && !COMMON_NAME_PATTERN.is_match(&self.common_name) {
            problems.push("common_name: invalid characters".to_string());
        }

        if let Some(ref country) = self.country {
            if country.len() != 2 || !country.chars().all(|c| c.is_ascii_uppercase()) {
                problems.push("country: expected two-letter code".to_string());
            }
        }

        if let Some(ref ip) = self.ip_address {
            if ip.parse::<IpAddr>().is_err() {
                problems.push("ip_address: not an IP address".to_string());
            }
        }

        if has_duplicates(&self.key_usages) {
            problems.push("key_usages: duplicate entries".to_string());
        }
        if has_duplicates(&self.extended_key_usages) {
            problems.push("extended_key_usages: duplicate entries".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            problems.sort();
            Err(problems.join(", "))
        }
    }
}

fn has_duplicates<T: PartialEq>(items: &[T]) -> bool {
    items
        .iter()
        .enumerate()
        .any(|(i, item)| items[..i].contains(item))
}

/// 失効理由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RevocationReason {
    Unspecified,
    KeyCompromise,
    CaCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
    CertificateHold,
}

impl RevocationReason {
    pub const ALL: [RevocationReason; 7] = [
        RevocationReason::Unspecified,
        RevocationReason::KeyCompromise,
        RevocationReason::CaCompromise,
        RevocationReason::AffiliationChanged,
        RevocationReason::Superseded,
        RevocationReason::CessationOfOperation,
        RevocationReason::CertificateHold,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationReason::Unspecified => "unspecified",
            RevocationReason::KeyCompromise => "key-compromise",
            RevocationReason::CaCompromise => "ca-compromise",
            RevocationReason::AffiliationChanged => "affiliation-changed",
            RevocationReason::Superseded => "superseded",
            RevocationReason::CessationOfOperation => "cessation-of-operation",
            RevocationReason::CertificateHold => "certificate-hold",
        }
    }
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RevocationReason {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RevocationReason::ALL
            .into_iter()
            .find(|reason| reason.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "revocation reason",
                value: s.to_string(),
            })
    }
}

/// 失効記録
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revocation {
    pub reason: RevocationReason,
    pub revoked_at: DateTime<Utc>,
    pub revoked_by: String,
}

/// 証明書の有効性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactStatus {
    Valid,
    NotYetValid,
    Expired,
    Revoked,
}

/// 発行ゲートウェイが返す署名済み成果物
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateArtifact {
    /// シリアル番号
    pub serial_number: String,
    /// 発行者
    pub issuer: String,
    /// 証明書PEM
    pub certificate_pem: String,
    /// SHA-256フィンガープリント（hex）
    pub fingerprint_sha256: String,
    /// 有効開始日時
    pub not_before: DateTime<Utc>,
    /// 有効終了日時
    pub not_after: DateTime<Utc>,
    /// 発行日時
    pub issued_at: DateTime<Utc>,
    /// 失効記録（失効後も成果物は保持される）
    #[serde(default)]
    pub revocation: Option<Revocation>,
}

impl CertificateArtifact {
    pub fn is_revoked(&self) -> bool {
        self.revocation.is_some()
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> ArtifactStatus {
        if self.is_revoked() {
            ArtifactStatus::Revoked
        } else if now < self.not_before {
            ArtifactStatus::NotYetValid
        } else if now > self.not_after {
            ArtifactStatus::Expired
        } else {
            ArtifactStatus::Valid
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.status_at(now) == ArtifactStatus::Valid
    }
}

/// 履歴エントリ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub state: RequestState,
    pub actor: String,
    pub at: DateTime<Utc>,
}

/// 発行試行のリース
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuanceLease {
    /// フェンストークン
    pub token: Uuid,
    /// 試行者
    pub holder: String,
    /// 何回目の試行か
    pub attempt: u32,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IssuanceLease {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// 発行試行の記録
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuanceStatus {
    /// 進行中の試行
    pub lease: Option<IssuanceLease>,
    /// 開始された試行数
    pub attempts: u32,
    /// 失敗した試行数
    pub failed_attempts: u32,
    /// 直近の失敗理由
    pub last_error: Option<String>,
}

/// 証明書リクエスト
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRequest {
    pub id: RequestId,
    /// 申請者のアイデンティティ
    pub owner: String,
    pub subject: SubjectInfo,
    pub state: RequestState,
    /// Pendingから遷移させた管理者
    pub reviewer: Option<String>,
    pub artifact: Option<CertificateArtifact>,
    /// 追記のみの遷移履歴
    pub history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub issuance: IssuanceStatus,
}

impl CertificateRequest {
    /// Pending状態の新しいリクエストを作成
    pub fn new(owner: impl Into<String>, subject: SubjectInfo, at: DateTime<Utc>) -> Self {
        let owner = owner.into();
        Self {
            id: RequestId::new(),
            history: vec![HistoryEntry {
                state: RequestState::Pending,
                actor: owner.clone(),
                at,
            }],
            owner,
            subject,
            state: RequestState::Pending,
            reviewer: None,
            artifact: None,
            created_at: at,
            updated_at: at,
            issuance: IssuanceStatus::default(),
        }
    }

    /// Approvedへ遷移した日時
    pub fn approved_at(&self) -> Option<DateTime<Utc>> {
        self.history
            .iter()
            .rev()
            .find(|entry| entry.state == RequestState::Approved)
            .map(|entry| entry.at)
    }

    /// 不変条件を検証
    pub fn check_invariants(&self) -> Result<(), String> {
        let first = self.history.first().ok_or("history is empty")?;
        if first.state != RequestState::Pending {
            return Err(format!("history starts at {}", first.state));
        }

        for pair in self.history.windows(2) {
            if !pair[0].state.can_transition_to(pair[1].state) {
                return Err(format!(
                    "history skips from {} to {}",
                    pair[0].state, pair[1].state
                ));
            }
        }

        if let Some(last) = self.history.last() {
            if last.state != self.state {
                return Err(format!(
                    "history ends at {} but state is {}",
                    last.state, self.state
                ));
            }
        }

        match (self.state, &self.artifact) {
            (RequestState::Issued, Some(artifact)) if !artifact.is_revoked() => {}
            (RequestState::Revoked, Some(artifact)) if artifact.is_revoked() => {}
            (RequestState::Pending | RequestState::Approved | RequestState::Rejected, None) => {}
            (state, artifact) => {
                return Err(format!(
                    "state {} with artifact present={} revoked={}",
                    state,
                    artifact.is_some(),
                    artifact.as_ref().is_some_and(|a| a.is_revoked())
                ));
            }
        }

        if self.state != RequestState::Pending && self.reviewer.is_none() {
            return Err(format!("state {} without reviewer", self.state));
        }

        Ok(())
    }
}
