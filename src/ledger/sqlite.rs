//! SQLite Request Ledger
//!
//! SQLiteバックエンドのリクエストレジャー。状態遷移は
//! `UPDATE … WHERE id = ? AND state = ?` による条件付き更新と
//! 履歴の追記を一つのトランザクションで行う。

use super::{lease_expiry, RequestLedger, StateChange};
use crate::error::LedgerError;
use crate::lifecycle::types::{
    CertificateArtifact, CertificateRequest, HistoryEntry, IssuanceLease, IssuanceStatus,
    RequestId, RequestState, Revocation, SubjectInfo,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS certificate_requests (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        owner TEXT NOT NULL,
        subject TEXT NOT NULL,
        state TEXT NOT NULL,
        reviewer TEXT,
        artifact TEXT,
        serial_number TEXT,
        revocation TEXT,
        lease_token TEXT,
        lease_holder TEXT,
        lease_acquired_at INTEGER,
        lease_expires_at INTEGER,
        attempts INTEGER NOT NULL DEFAULT 0,
        failed_attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_certificate_requests_owner ON certificate_requests(owner)",
    "CREATE INDEX IF NOT EXISTS idx_certificate_requests_state ON certificate_requests(state)",
    "CREATE INDEX IF NOT EXISTS idx_certificate_requests_serial ON certificate_requests(serial_number)",
    r#"
    CREATE TABLE IF NOT EXISTS request_history (
        request_id TEXT NOT NULL,
        position INTEGER NOT NULL,
        state TEXT NOT NULL,
        actor TEXT NOT NULL,
        at INTEGER NOT NULL,
        PRIMARY KEY (request_id, position)
    )
    "#,
];

const SELECT_REQUEST: &str = r#"
    SELECT id, owner, subject, state, reviewer, artifact, revocation,
           lease_token, lease_holder, lease_acquired_at, lease_expires_at,
           attempts, failed_attempts, last_error, created_at, updated_at
    FROM certificate_requests
"#;

/// SQLiteリクエストレジャー
#[derive(Debug, Clone)]
pub struct SqliteRequestLedger {
    pool: SqlitePool,
}

impl SqliteRequestLedger {
    /// 既存のプールから作成（スキーマは作成しない）
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// データベースに接続し、スキーマを作成
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        // インメモリDBは接続ごとに別データベースになる
        let max_connections = if url.contains(":memory:") {
            1
        } else {
            max_connections.max(1)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let ledger = Self::new(pool);
        ledger.run_migrations().await?;
        info!("SQLite request ledger ready: {}", url);
        Ok(ledger)
    }

    /// スキーマを作成
    pub async fn run_migrations(&self) -> Result<(), LedgerError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Ledger schema applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_many(
        &self,
        filter: &str,
        value: Option<&str>,
    ) -> Result<Vec<CertificateRequest>, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        let sql = format!("{} {} ORDER BY seq", SELECT_REQUEST, filter);

        let mut query = sqlx::query(&sql);
        if let Some(value) = value {
            query = query.bind(value.to_string());
        }
        let rows = query.fetch_all(&mut *conn).await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let history = fetch_history(&mut conn, &id).await?;
            records.push(decode_request(&row, history)?);
        }
        Ok(records)
    }

    /// 更新が0行だった理由を判定する
    async fn classify_miss(
        &self,
        id: RequestId,
        expected: RequestState,
    ) -> Result<CertificateRequest, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        let record = fetch_record(&mut conn, id)
            .await?
            .ok_or(LedgerError::NotFound(id))?;

        if record.state != expected {
            return Err(LedgerError::Conflict {
                id,
                expected,
                actual: record.state,
            });
        }
        Ok(record)
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| LedgerError::Storage(format!("timestamp out of range: {}", ms)))
}

fn to_count(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn parse_id(value: &str) -> Result<RequestId, LedgerError> {
    value
        .parse()
        .map_err(|e| LedgerError::Storage(format!("invalid request id {}: {}", value, e)))
}

fn parse_state(value: &str) -> Result<RequestState, LedgerError> {
    value
        .parse()
        .map_err(|e| LedgerError::Storage(format!("{}", e)))
}

fn decode_request(
    row: &SqliteRow,
    history: Vec<HistoryEntry>,
) -> Result<CertificateRequest, LedgerError> {
    let id: String = row.try_get("id")?;
    let subject: String = row.try_get("subject")?;
    let state: String = row.try_get("state")?;
    let artifact: Option<String> = row.try_get("artifact")?;
    let revocation: Option<String> = row.try_get("revocation")?;

    let mut artifact: Option<CertificateArtifact> =
        artifact.as_deref().map(serde_json::from_str).transpose()?;
    let revocation: Option<Revocation> =
        revocation.as_deref().map(serde_json::from_str).transpose()?;
    if let Some(ref mut artifact) = artifact {
        artifact.revocation = revocation;
    }

    let lease_token: Option<String> = row.try_get("lease_token")?;
    let attempts = to_count(row.try_get("attempts")?);
    let lease = match lease_token {
        Some(token) => {
            let token = Uuid::parse_str(&token)
                .map_err(|e| LedgerError::Storage(format!("invalid lease token: {}", e)))?;
            let holder: Option<String> = row.try_get("lease_holder")?;
            let acquired_at: Option<i64> = row.try_get("lease_acquired_at")?;
            let expires_at: Option<i64> = row.try_get("lease_expires_at")?;
            Some(IssuanceLease {
                token,
                holder: holder.unwrap_or_default(),
                attempt: attempts,
                acquired_at: from_millis(acquired_at.unwrap_or_default())?,
                expires_at: from_millis(expires_at.unwrap_or_default())?,
            })
        }
        None => None,
    };

    Ok(CertificateRequest {
        id: parse_id(&id)?,
        owner: row.try_get("owner")?,
        subject: serde_json::from_str::<SubjectInfo>(&subject)?,
        state: parse_state(&state)?,
        reviewer: row.try_get("reviewer")?,
        artifact,
        history,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
        issuance: IssuanceStatus {
            lease,
            attempts,
            failed_attempts: to_count(row.try_get("failed_attempts")?),
            last_error: row.try_get("last_error")?,
        },
    })
}

async fn fetch_history(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Vec<HistoryEntry>, LedgerError> {
    let rows = sqlx::query(
        "SELECT state, actor, at FROM request_history WHERE request_id = ? ORDER BY position",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| -> Result<HistoryEntry, LedgerError> {
            let state: String = row.try_get("state")?;
            Ok(HistoryEntry {
                state: parse_state(&state)?,
                actor: row.try_get("actor")?,
                at: from_millis(row.try_get("at")?)?,
            })
        })
        .collect()
}

async fn fetch_record(
    conn: &mut SqliteConnection,
    id: RequestId,
) -> Result<Option<CertificateRequest>, LedgerError> {
    let sql = format!("{} WHERE id = ?", SELECT_REQUEST);
    let row = sqlx::query(&sql)
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

    match row {
        Some(row) => {
            let history = fetch_history(conn, &id.to_string()).await?;
            Ok(Some(decode_request(&row, history)?))
        }
        None => Ok(None),
    }
}

async fn append_history(
    conn: &mut SqliteConnection,
    id: &str,
    entry: &HistoryEntry,
) -> Result<(), LedgerError> {
    sqlx::query(
        r#"
        INSERT INTO request_history (request_id, position, state, actor, at)
        SELECT ?1, COALESCE(MAX(position), -1) + 1, ?2, ?3, ?4
        FROM request_history WHERE request_id = ?1
        "#,
    )
    .bind(id)
    .bind(entry.state.as_str())
    .bind(&entry.actor)
    .bind(to_millis(entry.at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl RequestLedger for SqliteRequestLedger {
    async fn create(&self, request: CertificateRequest) -> Result<RequestId, LedgerError> {
        let id = request.id.to_string();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO certificate_requests
                (id, owner, subject, state, reviewer, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&request.owner)
        .bind(serde_json::to_string(&request.subject)?)
        .bind(request.state.as_str())
        .bind(&request.reviewer)
        .bind(to_millis(request.created_at))
        .bind(to_millis(request.updated_at))
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(LedgerError::DuplicateId(request.id));
            }
            Err(e) => return Err(e.into()),
        }

        for entry in &request.history {
            append_history(&mut tx, &id, entry).await?;
        }

        tx.commit().await?;
        Ok(request.id)
    }

    async fn get(&self, id: RequestId) -> Result<CertificateRequest, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        fetch_record(&mut conn, id)
            .await?
            .ok_or(LedgerError::NotFound(id))
    }

    async fn compare_and_transition(
        &self,
        id: RequestId,
        change: StateChange,
    ) -> Result<CertificateRequest, LedgerError> {
        change.validate()?;

        let artifact = change
            .artifact
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let serial = change.artifact.as_ref().map(|a| a.serial_number.clone());
        let revocation = change
            .revocation
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let clears_lease = change.next == RequestState::Issued;

        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE certificate_requests SET
                state = ?1,
                reviewer = COALESCE(?2, reviewer),
                artifact = COALESCE(?3, artifact),
                serial_number = COALESCE(?4, serial_number),
                revocation = COALESCE(?5, revocation),
                lease_token = CASE WHEN ?6 THEN NULL ELSE lease_token END,
                lease_holder = CASE WHEN ?6 THEN NULL ELSE lease_holder END,
                lease_acquired_at = CASE WHEN ?6 THEN NULL ELSE lease_acquired_at END,
                lease_expires_at = CASE WHEN ?6 THEN NULL ELSE lease_expires_at END,
                last_error = CASE WHEN ?6 THEN NULL ELSE last_error END,
                updated_at = ?7
            WHERE id = ?8 AND state = ?9 AND (?10 IS NULL OR lease_token = ?10)
            "#,
        )
        .bind(change.next.as_str())
        .bind(&change.reviewer)
        .bind(artifact)
        .bind(serial)
        .bind(revocation)
        .bind(clears_lease)
        .bind(to_millis(change.at))
        .bind(id.to_string())
        .bind(change.expected.as_str())
        .bind(change.fence.map(|token| token.to_string()))
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            self.classify_miss(id, change.expected).await?;
            // 状態は一致しているのでフェンスが不一致
            return Err(LedgerError::FenceRejected { id });
        }

        let entry = HistoryEntry {
            state: change.next,
            actor: change.actor,
            at: change.at,
        };
        append_history(&mut tx, &id.to_string(), &entry).await?;

        let record = fetch_record(&mut tx, id)
            .await?
            .ok_or(LedgerError::NotFound(id))?;
        tx.commit().await?;

        debug!("Request {} moved {} -> {}", id, change.expected, change.next);
        Ok(record)
    }

    async fn list_by_owner(&self, owner: &str) -> Result<Vec<CertificateRequest>, LedgerError> {
        self.fetch_many("WHERE owner = ?", Some(owner)).await
    }

    async fn list_by_state(
        &self,
        state: RequestState,
    ) -> Result<Vec<CertificateRequest>, LedgerError> {
        self.fetch_many("WHERE state = ?", Some(state.as_str())).await
    }

    async fn list_all(&self) -> Result<Vec<CertificateRequest>, LedgerError> {
        self.fetch_many("", None).await
    }

    async fn find_by_serial(
        &self,
        serial: &str,
    ) -> Result<Option<CertificateRequest>, LedgerError> {
        Ok(self
            .fetch_many("WHERE serial_number = ?", Some(serial))
            .await?
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
        let token = Uuid::new_v4();
        let expires_at = lease_expiry(now, ttl)?;

        let row = sqlx::query(
            r#"
            UPDATE certificate_requests SET
                lease_token = ?1,
                lease_holder = ?2,
                lease_acquired_at = ?3,
                lease_expires_at = ?4,
                attempts = attempts + 1
            WHERE id = ?5 AND state = 'approved'
              AND (lease_token IS NULL OR lease_expires_at <= ?3)
            RETURNING attempts
            "#,
        )
        .bind(token.to_string())
        .bind(holder)
        .bind(to_millis(now))
        .bind(to_millis(expires_at))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(IssuanceLease {
                token,
                holder: holder.to_string(),
                attempt: to_count(row.try_get("attempts")?),
                acquired_at: now,
                expires_at,
            }),
            None => {
                let record = self.classify_miss(id, RequestState::Approved).await?;
                let holder = record
                    .issuance
                    .lease
                    .map(|lease| lease.holder)
                    .unwrap_or_default();
                Err(LedgerError::LeaseHeld { id, holder })
            }
        }
    }

    async fn release_issuance(
        &self,
        id: RequestId,
        token: Uuid,
        error: Option<String>,
    ) -> Result<(), LedgerError> {
        let updated = sqlx::query(
            r#"
            UPDATE certificate_requests SET
                lease_token = NULL,
                lease_holder = NULL,
                lease_acquired_at = NULL,
                lease_expires_at = NULL,
                failed_attempts = failed_attempts + CASE WHEN ?1 IS NULL THEN 0 ELSE 1 END,
                last_error = COALESCE(?1, last_error)
            WHERE id = ?2 AND lease_token = ?3
            "#,
        )
        .bind(error)
        .bind(id.to_string())
        .bind(token.to_string())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            self.get(id).await?;
            return Err(LedgerError::FenceRejected { id });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> SqliteRequestLedger {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let ledger = SqliteRequestLedger::new(pool);
        ledger.run_migrations().await.unwrap();
        ledger
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let ledger = setup().await;
        let request = CertificateRequest::new("alice", SubjectInfo::new("alice.example"), Utc::now());
        let id = ledger.create(request.clone()).await.unwrap();

        let stored = ledger.get(id).await.unwrap();
        assert_eq!(stored.owner, "alice");
        assert_eq!(stored.subject, request.subject);
        assert_eq!(stored.state, RequestState::Pending);
        assert_eq!(stored.history.len(), 1);

        assert!(matches!(
            ledger.create(request).await,
            Err(LedgerError::DuplicateId(_))
        ));
    }

    #[tokio::test]
    async fn test_guarded_update() {
        let ledger = setup().await;
        let id = ledger
            .create(CertificateRequest::new("alice", SubjectInfo::new("a"), Utc::now()))
            .await
            .unwrap();

        let approved = ledger
            .compare_and_transition(id, StateChange::review(RequestState::Approved, "root"))
            .await
            .unwrap();
        assert_eq!(approved.reviewer.as_deref(), Some("root"));
        assert_eq!(approved.history.len(), 2);

        let lost = ledger
            .compare_and_transition(id, StateChange::review(RequestState::Rejected, "root"))
            .await;
        assert!(matches!(
            lost,
            Err(LedgerError::Conflict {
                actual: RequestState::Approved,
                ..
            })
        ));
        assert_eq!(ledger.get(id).await.unwrap().history.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let ledger = setup().await;
        let result = ledger
            .compare_and_transition(
                RequestId::new(),
                StateChange::review(RequestState::Approved, "root"),
            )
            .await;
        assert!(matches!(result, Err(LedgerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_begin_issuance_refuses_out_of_range_ttl() {
        let ledger = setup().await;
        let id = ledger
            .create(CertificateRequest::new("alice", SubjectInfo::new("a"), Utc::now()))
            .await
            .unwrap();
        ledger
            .compare_and_transition(id, StateChange::review(RequestState::Approved, "root"))
            .await
            .unwrap();

        let result = ledger
            .begin_issuance(id, "worker", Utc::now(), chrono::Duration::MAX)
            .await;
        assert!(matches!(result, Err(LedgerError::Storage(_))));

        let record = ledger.get(id).await.unwrap();
        assert_eq!(record.issuance.attempts, 0);
        assert!(record.issuance.lease.is_none());
    }
}
