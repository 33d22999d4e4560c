//! Local Certificate Authority
//!
//! 発行ゲートウェイのローカル実装（簡略版）。証明書本体は
//! TBS情報をJSONで符号化したものをPEM形式で包む。

use super::{GatewayError, IssuanceGateway, IssuanceTicket};
use crate::lifecycle::types::{CertificateArtifact, RequestId};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// CA設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaConfig {
    /// 発行者のCommon Name
    pub issuer_common_name: String,
    pub organization: String,
    pub country: String,
    /// 発行できる最大有効日数
    pub max_validity_days: u32,
    /// CA証明書の発行を許可するか
    pub allow_ca: bool,
    /// 再試行に同じ成果物を返すために保持する発行数
    pub retained_issuances: usize,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            issuer_common_name: "certflow Local CA".to_string(),
            organization: "certflow".to_string(),
            country: "JP".to_string(),
            max_validity_days: 825,
            allow_ca: false,
            retained_issuances: 4096,
        }
    }
}

impl CaConfig {
    pub fn issuer(&self) -> String {
        format!(
            "CN={}, O={}, C={}",
            self.issuer_common_name, self.organization, self.country
        )
    }
}

/// 署名対象の情報
#[derive(Serialize)]
struct TbsCertificate<'a> {
    serial_number: &'a str,
    issuer: &'a str,
    subject: &'a crate::lifecycle::types::SubjectInfo,
    not_before: chrono::DateTime<Utc>,
    not_after: chrono::DateTime<Utc>,
}

/// リクエストIDごとの発行済み成果物。古いものから捨てる
#[derive(Debug, Default)]
struct IssuedCache {
    by_request: HashMap<RequestId, CertificateArtifact>,
    order: VecDeque<RequestId>,
}

impl IssuedCache {
    fn insert(&mut self, id: RequestId, artifact: CertificateArtifact, capacity: usize) {
        while self.order.len() >= capacity.max(1) {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.by_request.remove(&oldest);
                }
                None => break,
            }
        }
        self.by_request.insert(id, artifact);
        self.order.push_back(id);
    }
}

/// ローカル認証局
#[derive(Debug, Clone)]
pub struct LocalCertificateAuthority {
    config: CaConfig,
    issued: Arc<RwLock<IssuedCache>>,
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn to_pem(der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let body: Vec<String> = encoded
        .as_bytes()
        .chunks(64)
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .collect();
    format!(
        "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n",
        body.join("\n")
    )
}

impl LocalCertificateAuthority {
    pub fn new(config: CaConfig) -> Self {
        Self {
            config,
            issued: Arc::new(RwLock::new(IssuedCache::default())),
        }
    }

    pub fn config(&self) -> &CaConfig {
        &self.config
    }

    /// 発行済み証明書数
    pub async fn issued_count(&self) -> usize {
        self.issued.read().await.by_request.len()
    }

    /// シリアル番号を生成（128bit乱数、正の整数）
    fn generate_serial_number() -> String {
        let mut bytes: [u8; 16] = rand::random();
        bytes[0] &= 0x7f;
        hex(&bytes)
    }

    fn sign(&self, ticket: &IssuanceTicket) -> Result<CertificateArtifact, GatewayError> {
        let subject = &ticket.subject;

        if subject.is_ca && !self.config.allow_ca {
            return Err(GatewayError::Rejected(
                "CA certificates are not issued by this authority".to_string(),
            ));
        }
        if subject.validity_days > self.config.max_validity_days {
            return Err(GatewayError::Rejected(format!(
                "validity of {} days exceeds the maximum of {}",
                subject.validity_days, self.config.max_validity_days
            )));
        }

        let serial_number = Self::generate_serial_number();
        let issuer = self.config.issuer();
        let issued_at = Utc::now();
        // 時計のずれを許容する
        let not_before = issued_at - Duration::seconds(10);
        let not_after = not_before + Duration::days(i64::from(subject.validity_days));

        let tbs = TbsCertificate {
            serial_number: &serial_number,
            issuer: &issuer,
            subject,
            not_before,
            not_after,
        };
        let der = serde_json::to_vec(&tbs)
            .map_err(|e| GatewayError::Internal(format!("encoding failed: {}", e)))?;

        Ok(CertificateArtifact {
            fingerprint_sha256: hex(&Sha256::digest(&der)),
            certificate_pem: to_pem(&der),
            serial_number,
            issuer,
            not_before,
            not_after,
            issued_at,
            revocation: None,
        })
    }
}

#[async_trait]
impl IssuanceGateway for LocalCertificateAuthority {
    async fn issue(&self, ticket: IssuanceTicket) -> Result<CertificateArtifact, GatewayError> {
        let mut issued = self.issued.write().await;

        if let Some(existing) = issued.by_request.get(&ticket.request_id) {
            debug!(
                "Returning previously issued certificate for request {} (attempt {})",
                ticket.request_id, ticket.attempt
            );
            return Ok(existing.clone());
        }

        let artifact = self.sign(&ticket)?;
        issued.insert(
            ticket.request_id,
            artifact.clone(),
            self.config.retained_issuances,
        );

        info!(
            "Issued certificate {} for request {} (CN={})",
            artifact.serial_number, ticket.request_id, ticket.subject.common_name
        );
        Ok(artifact)
    }
}
