//! Configuration
//!
//! 設定ファイル（TOML）と環境変数から読み込む設定

pub mod loader;

pub use loader::ConfigLoader;

use crate::identity::AccountSeed;
use crate::issuance::CaConfig;
use crate::lifecycle::{EngineSettings, RetryPolicy};
use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CertflowConfig {
    pub ledger: LedgerConfig,
    pub issuance: IssuanceConfig,
    pub audit: AuditConfig,
    pub ca: CaConfig,
    pub logging: LogConfig,
    /// 起動時に登録するアカウント
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub accounts: Vec<AccountSeed>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,
    pub database_url: String,
    pub max_connections: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::Sqlite,
            database_url: "sqlite://certflow.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_millis: u64,
    pub max_delay_millis: u64,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            initial_delay_millis: policy.initial_delay.as_millis() as u64,
            max_delay_millis: policy.max_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            max_attempts: policy.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IssuanceConfig {
    pub lease_ttl_secs: u64,
    pub gateway_timeout_secs: u64,
    pub audit_timeout_millis: u64,
    pub stuck_after_secs: u64,
    pub retry: RetryConfig,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        let settings = EngineSettings::default();
        Self {
            lease_ttl_secs: settings.lease_ttl.as_secs(),
            gateway_timeout_secs: settings.gateway_timeout.as_secs(),
            audit_timeout_millis: settings.audit_timeout.as_millis() as u64,
            stuck_after_secs: settings.stuck_after.as_secs(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSinkKind {
    Memory,
    File,
    Tracing,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuditConfig {
    pub sink: AuditSinkKind,
    /// `file` シンクの出力先
    pub file_path: PathBuf,
    /// `memory` シンクの保持件数
    pub max_memory_records: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            sink: AuditSinkKind::File,
            file_path: PathBuf::from("audit/transitions.jsonl"),
            max_memory_records: 10_000,
        }
    }
}

impl CertflowConfig {
    /// エンジン設定に変換
    pub fn engine_settings(&self) -> EngineSettings {
        let issuance = &self.issuance;
        EngineSettings {
            lease_ttl: Duration::from_secs(issuance.lease_ttl_secs),
            gateway_timeout: Duration::from_secs(issuance.gateway_timeout_secs),
            audit_timeout: Duration::from_millis(issuance.audit_timeout_millis),
            stuck_after: Duration::from_secs(issuance.stuck_after_secs),
            retry: RetryPolicy {
                initial_delay: Duration::from_millis(issuance.retry.initial_delay_millis),
                max_delay: Duration::from_millis(issuance.retry.max_delay_millis),
                multiplier: issuance.retry.multiplier,
                max_attempts: issuance.retry.max_attempts,
            },
        }
    }

    /// 設定値の整合性を検証
    pub fn validate(&self) -> Result<(), String> {
        self.engine_settings().validate()?;

        if self.ledger.backend == LedgerBackend::Sqlite && self.ledger.database_url.is_empty() {
            return Err("ledger.database_url is required for the sqlite backend".to_string());
        }
        if self.ca.max_validity_days == 0 {
            return Err("ca.max_validity_days must be positive".to_string());
        }
        if self.ca.retained_issuances == 0 {
            return Err("ca.retained_issuances must be positive".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for account in &self.accounts {
            if !seen.insert(account.id.as_str()) {
                return Err(format!("duplicate account id: {}", account.id));
            }
        }
        Ok(())
    }

    /// サンプル設定ファイルの内容を生成
    pub fn sample_toml() -> Result<String, toml::ser::Error> {
        let body = toml::to_string_pretty(&CertflowConfig::default())?;
        Ok(format!(
            "# certflow configuration\n\
             # Environment variables override these values, e.g. CERTFLOW__LEDGER__BACKEND=memory\n\
             #\n\
             # [[accounts]]\n\
             # id = \"admin\"\n\
             # role = \"admin\"\n\
             # password = \"change-me-1\"\n\
             # api_key = \"...\"\n\n{}",
            body
        ))
    }
}
