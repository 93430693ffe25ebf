// =============================================================================
// C9 — Write-Ahead Journal
// =============================================================================
//
// Every state-mutating operation in the Financial Core is wrapped:
// prepare() writes a PREPARED record with a checksum of its canonical
// payload, the caller then performs the actual ledger/position mutation in
// its own DB transaction, and commit() re-verifies the checksum and flips
// the record to COMMITTED, stamping the ledger sequence numbers the mutation
// produced. If the process dies between prepare and commit, recover() scans
// every PREPARED record at the next startup and *probes* the relational
// store — by idempotency key, or by operation type against trades/ledger
// entries — to decide whether the guarded mutation actually landed before
// choosing COMMIT or ABORT, rather than blindly aborting every orphan.
//
// The checksum is a plain SHA-256 digest of the canonical JSON payload,
// generalized from the HMAC-signing helper used for upstream REST requests
// (same `sha2` dependency, no key — an integrity check, not an auth tag).
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::JournalError;

const RECOVERY_BATCH_SIZE: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JournalStatus {
    Prepared,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    TradeExecution,
    LedgerEntry,
    Liquidation,
    ExpirySettlement,
    ManualAdjustment,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TradeExecution => "TRADE_EXECUTION",
            Self::LedgerEntry => "LEDGER_ENTRY",
            Self::Liquidation => "LIQUIDATION",
            Self::ExpirySettlement => "EXPIRY_SETTLEMENT",
            Self::ManualAdjustment => "MANUAL_ADJUSTMENT",
        }
    }

    /// Operations whose trail lives in `trades` as well as `ledger_entries`.
    fn touches_trades(&self) -> bool {
        matches!(self, Self::TradeExecution | Self::Liquidation | Self::ExpirySettlement)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    pub id: Uuid,
    pub operation_type: String,
    pub status: JournalStatus,
    pub user_id: Option<String>,
    pub reference_id: Option<String>,
    pub payload: serde_json::Value,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

fn canonical_checksum(payload: &serde_json::Value) -> String {
    // `serde_json::Value`'s `Map` is a `BTreeMap` under the default feature
    // set, so `to_string` already produces a canonical, key-sorted form.
    let canonical = payload.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|de| de.code())
        .map(|code| code == "23505")
        .unwrap_or(false)
}

enum RecoveryOutcome {
    Commit(Vec<i64>),
    Abort,
}

pub struct Journal {
    pool: PgPool,
}

impl Journal {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Write a PREPARED record, or — if `journal_id` names a record that
    /// already exists — treat this as an idempotent retry: the persisted
    /// payload must checksum to the same value as the one just requested,
    /// otherwise the record is corrupt and trading halts on it.
    pub async fn prepare(
        &self,
        operation_type: OperationType,
        user_id: &str,
        reference_id: &str,
        payload: serde_json::Value,
        journal_id: Option<Uuid>,
    ) -> Result<Uuid, JournalError> {
        let id = journal_id.unwrap_or_else(Uuid::new_v4);
        let checksum = canonical_checksum(&payload);

        let result = sqlx::query(
            "INSERT INTO journal_records (id, operation_type, status, user_id, reference_id, payload, checksum) \
             VALUES ($1, $2, 'PREPARED', $3, $4, $5, $6)",
        )
        .bind(id)
        .bind(operation_type.as_str())
        .bind(user_id)
        .bind(reference_id)
        .bind(&payload)
        .bind(&checksum)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                info!(id = %id, operation_type = operation_type.as_str(), "journal record prepared");
                Ok(id)
            }
            Err(e) if is_unique_violation(&e) => self.verify_reprepare(id, &checksum).await,
            Err(e) => {
                error!(id = %id, error = %e, "journal prepare failed");
                Err(JournalError::NotPrepared(id.to_string()))
            }
        }
    }

    async fn verify_reprepare(&self, id: Uuid, expected_checksum: &str) -> Result<Uuid, JournalError> {
        let row = sqlx::query("SELECT checksum FROM journal_records WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|_| JournalError::NotPrepared(id.to_string()))?
            .ok_or_else(|| JournalError::NotPrepared(id.to_string()))?;

        let persisted: String = row.try_get("checksum").unwrap_or_default();
        if persisted != expected_checksum {
            error!(id = %id, "journal checksum mismatch on re-prepare — halting on this record");
            return Err(JournalError::JournalCorruption(id.to_string()));
        }
        Ok(id)
    }

    /// Re-fetch the PREPARED record, re-verify its checksum against the
    /// persisted payload, stamp the ledger sequences the guarded mutation
    /// produced, and flip it to COMMITTED.
    pub async fn commit(&self, id: Uuid, ledger_sequences: &[i64]) -> Result<(), JournalError> {
        let row = sqlx::query("SELECT payload, checksum, status FROM journal_records WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|_| JournalError::NotPrepared(id.to_string()))?
            .ok_or_else(|| JournalError::NotPrepared(id.to_string()))?;

        let status: String = row.try_get("status").unwrap_or_default();
        if status != "PREPARED" {
            return Err(JournalError::NotPrepared(id.to_string()));
        }

        let payload: serde_json::Value = row.try_get("payload").unwrap_or(serde_json::Value::Null);
        let checksum: String = row.try_get("checksum").unwrap_or_default();
        if canonical_checksum(&payload) != checksum {
            error!(id = %id, "journal checksum mismatch at commit — halting on this record");
            return Err(JournalError::JournalCorruption(id.to_string()));
        }

        let mut merged = payload;
        if let Some(obj) = merged.as_object_mut() {
            obj.insert(
                "__commit_meta".to_string(),
                serde_json::json!({ "ledger_sequences": ledger_sequences }),
            );
        }

        let result = sqlx::query(
            "UPDATE journal_records SET status = 'COMMITTED', committed_at = now(), payload = $2 \
             WHERE id = $1 AND status = 'PREPARED'",
        )
        .bind(id)
        .bind(&merged)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(id = %id, error = %e, "journal commit query failed");
            JournalError::NotPrepared(id.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(JournalError::NotPrepared(id.to_string()));
        }
        info!(id = %id, "journal record committed");
        Ok(())
    }

    pub async fn abort(&self, id: Uuid) -> Result<(), JournalError> {
        let result = sqlx::query(
            "UPDATE journal_records SET status = 'ABORTED', aborted_at = now() WHERE id = $1 AND status = 'PREPARED'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|_| JournalError::NotPrepared(id.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(JournalError::NotPrepared(id.to_string()));
        }
        warn!(id = %id, "journal record aborted");
        Ok(())
    }

    /// Verify a record's checksum still matches its stored payload.
    pub async fn verify(&self, id: Uuid) -> Result<(), JournalError> {
        let row = sqlx::query("SELECT payload, checksum FROM journal_records WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|_| JournalError::RecoverySequenceMissing(id.to_string()))?
            .ok_or_else(|| JournalError::RecoverySequenceMissing(id.to_string()))?;

        let payload: serde_json::Value = row.try_get("payload").unwrap_or(serde_json::Value::Null);
        let checksum: String = row.try_get("checksum").unwrap_or_default();

        if canonical_checksum(&payload) != checksum {
            return Err(JournalError::JournalCorruption(id.to_string()));
        }
        Ok(())
    }

    pub async fn get_uncommitted(&self, limit: i64) -> anyhow::Result<Vec<JournalRecord>> {
        let rows = sqlx::query(
            "SELECT id, operation_type, status, user_id, reference_id, payload, checksum, created_at \
             FROM journal_records WHERE status = 'PREPARED' ORDER BY created_at ASC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(JournalRecord {
                    id: row.try_get("id")?,
                    operation_type: row.try_get("operation_type")?,
                    status: JournalStatus::Prepared,
                    user_id: row.try_get("user_id").ok(),
                    reference_id: row.try_get("reference_id").ok(),
                    payload: row.try_get("payload")?,
                    checksum: row.try_get("checksum")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    /// Called once at startup. Every record still PREPARED means the process
    /// died mid-transaction; for each, probe the relational store (by
    /// idempotency key if the payload carries one, else by operation type
    /// against `trades`/`ledger_entries`) to decide whether the guarded
    /// mutation actually committed to disk before the crash. A would-be
    /// COMMIT that resolves to zero ledger sequences is a bug, not a
    /// recoverable state — it is force-aborted with a loud error instead.
    pub async fn recover(&self) -> anyhow::Result<Vec<(Uuid, JournalStatus)>> {
        let mut handled = Vec::new();

        loop {
            let rows = sqlx::query(
                "SELECT id, operation_type, reference_id, payload FROM journal_records \
                 WHERE status = 'PREPARED' ORDER BY created_at ASC LIMIT $1",
            )
            .bind(RECOVERY_BATCH_SIZE)
            .fetch_all(&self.pool)
            .await?;

            if rows.is_empty() {
                break;
            }

            for row in rows {
                let id: Uuid = row.try_get("id")?;
                let operation_type: String = row.try_get("operation_type").unwrap_or_default();
                let reference_id: Option<String> = row.try_get("reference_id").ok();
                let payload: serde_json::Value = row.try_get("payload").unwrap_or(serde_json::Value::Null);

                let outcome = self
                    .resolve_recovery_outcome(&operation_type, reference_id.as_deref(), &payload)
                    .await?;

                match outcome {
                    RecoveryOutcome::Commit(sequences) if sequences.is_empty() => {
                        error!(id = %id, "recovery would commit with zero ledger sequences — forcing abort");
                        if self.abort(id).await.is_ok() {
                            handled.push((id, JournalStatus::Aborted));
                        }
                    }
                    RecoveryOutcome::Commit(sequences) => {
                        if self.commit(id, &sequences).await.is_ok() {
                            handled.push((id, JournalStatus::Committed));
                        }
                    }
                    RecoveryOutcome::Abort => {
                        if self.abort(id).await.is_ok() {
                            handled.push((id, JournalStatus::Aborted));
                        }
                    }
                }
            }
        }

        if !handled.is_empty() {
            let committed = handled.iter().filter(|(_, s)| *s == JournalStatus::Committed).count();
            let aborted = handled.len() - committed;
            warn!(committed, aborted, "recovered orphaned journal records");
        }
        Ok(handled)
    }

    async fn resolve_recovery_outcome(
        &self,
        operation_type: &str,
        reference_id: Option<&str>,
        payload: &serde_json::Value,
    ) -> anyhow::Result<RecoveryOutcome> {
        if let Some(idem) = payload.get("idempotency_key").and_then(|v| v.as_str()) {
            let sequences = self.ledger_sequences_by_idempotency_prefix(idem).await?;
            if !sequences.is_empty() {
                return Ok(RecoveryOutcome::Commit(sequences));
            }
        }

        let Some(reference_id) = reference_id else {
            return Ok(RecoveryOutcome::Abort);
        };

        let op = match operation_type {
            "TRADE_EXECUTION" => OperationType::TradeExecution,
            "LIQUIDATION" => OperationType::Liquidation,
            "EXPIRY_SETTLEMENT" => OperationType::ExpirySettlement,
            "MANUAL_ADJUSTMENT" => OperationType::ManualAdjustment,
            _ => OperationType::LedgerEntry,
        };

        if op.touches_trades() {
            let trade_count: i64 = sqlx::query("SELECT count(*) AS c FROM trades WHERE order_id::text = $1")
                .bind(reference_id)
                .fetch_one(&self.pool)
                .await?
                .try_get("c")?;
            if trade_count == 0 {
                return Ok(RecoveryOutcome::Abort);
            }
        }

        let sequences = self.ledger_sequences_by_reference(reference_id).await?;
        if sequences.is_empty() {
            Ok(RecoveryOutcome::Abort)
        } else {
            Ok(RecoveryOutcome::Commit(sequences))
        }
    }

    async fn ledger_sequences_by_idempotency_prefix(&self, idem: &str) -> anyhow::Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT global_sequence FROM ledger_entries WHERE idempotency_key LIKE $1 OR idempotency_key = $2",
        )
        .bind(format!("{idem}:%"))
        .bind(idem)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|r| r.try_get::<i64, _>("global_sequence").map_err(Into::into)).collect()
    }

    async fn ledger_sequences_by_reference(&self, reference_id: &str) -> anyhow::Result<Vec<i64>> {
        let rows = sqlx::query("SELECT global_sequence FROM ledger_entries WHERE reference_id = $1")
            .bind(reference_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(|r| r.try_get::<i64, _>("global_sequence").map_err(Into::into)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_deterministic() {
        let payload = serde_json::json!({"a": 1, "b": 2});
        let payload2 = serde_json::json!({"b": 2, "a": 1});
        assert_eq!(canonical_checksum(&payload), canonical_checksum(&payload2));
    }

    #[test]
    fn checksum_changes_with_payload() {
        let a = serde_json::json!({"amount": "100.00"});
        let b = serde_json::json!({"amount": "100.01"});
        assert_ne!(canonical_checksum(&a), canonical_checksum(&b));
    }

    #[test]
    fn operation_type_wire_names_match_spec() {
        assert_eq!(OperationType::TradeExecution.as_str(), "TRADE_EXECUTION");
        assert_eq!(OperationType::ManualAdjustment.as_str(), "MANUAL_ADJUSTMENT");
    }
}
