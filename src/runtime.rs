//! Runtime Assembly
//!
//! 設定からエンジン・アイデンティティストアを組み立てる

use crate::audit::{AuditSink, JsonLinesAuditSink, MemoryAuditSink, TracingAuditSink};
use crate::config::{AuditSinkKind, CertflowConfig, LedgerBackend};
use crate::error::{Error, Result};
use crate::identity::{Identity, InMemoryIdentityStore};
use crate::issuance::LocalCertificateAuthority;
use crate::ledger::{InMemoryRequestLedger, RequestLedger};
use crate::lifecycle::{LifecycleEngine, ReconcileReport};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 組み立て済みのコンポーネント
#[derive(Clone)]
pub struct Runtime {
    pub engine: LifecycleEngine,
    pub identities: InMemoryIdentityStore,
}

async fn open_ledger(config: &CertflowConfig) -> Result<Arc<dyn RequestLedger>> {
    match config.ledger.backend {
        LedgerBackend::Memory => Ok(Arc::new(InMemoryRequestLedger::new())),
        #[cfg(feature = "sqlite-backend")]
        LedgerBackend::Sqlite => {
            let ledger = crate::ledger::SqliteRequestLedger::connect(
                &config.ledger.database_url,
                config.ledger.max_connections,
            )
            .await?;
            Ok(Arc::new(ledger))
        }
        #[cfg(not(feature = "sqlite-backend"))]
        LedgerBackend::Sqlite => Err(Error::Config(
            "sqlite ledger requested but the sqlite-backend feature is disabled".to_string(),
        )),
    }
}

fn open_audit_sink(config: &CertflowConfig) -> Arc<dyn AuditSink> {
    match config.audit.sink {
        AuditSinkKind::Memory => Arc::new(MemoryAuditSink::new(config.audit.max_memory_records)),
        AuditSinkKind::File => Arc::new(JsonLinesAuditSink::new(config.audit.file_path.clone())),
        AuditSinkKind::Tracing => Arc::new(TracingAuditSink),
    }
}

impl Runtime {
    /// 設定からランタイムを構築
    pub async fn assemble(config: &CertflowConfig) -> Result<Self> {
        let ledger = open_ledger(config).await?;
        let gateway = Arc::new(LocalCertificateAuthority::new(config.ca.clone()));
        let audit = open_audit_sink(config);

        let engine = LifecycleEngine::new(ledger, gateway, audit, config.engine_settings())?;
        let identities = InMemoryIdentityStore::from_seeds(&config.accounts).await?;

        info!(
            ledger = ?config.ledger.backend,
            audit = ?config.audit.sink,
            "Runtime assembled"
        );
        Ok(Self { engine, identities })
    }
}

/// キャンセルされるまで一定間隔で滞留リクエストを再処理する
pub async fn reconcile_loop<F>(
    engine: &LifecycleEngine,
    identity: &Identity,
    period: Duration,
    token: CancellationToken,
    mut on_report: F,
) -> Result<()>
where
    F: FnMut(&ReconcileReport),
{
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(10)));

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("Reconcile loop stopped");
                return Ok(());
            }
            _ = interval.tick() => {
                match engine.reconcile_stuck(identity).await {
                    Ok(report) => on_report(&report),
                    Err(e) if e.is_retryable() => error!("Reconcile pass failed: {}", e),
                    Err(e) => return Err(Error::from(e)),
                }
            }
        }
    }
}
