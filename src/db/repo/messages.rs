//! Processed-message ledger and dead-letter operations for the repository.

use crate::domain::{InboundMessage, TimeMs};
use sqlx::Row;

use super::Repository;

/// A quarantined inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub id: i64,
    pub message_id: String,
    pub queue: String,
    pub message_type: String,
    pub raw_payload: String,
    pub payload_digest: String,
    pub reason: String,
    pub created_at: TimeMs,
}

impl Repository {
    /// Digest recorded for `message_id` if it was already processed.
    pub async fn processed_digest(&self, message_id: &str) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar("SELECT payload_digest FROM processed_messages WHERE message_id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Record a message as processed.
    ///
    /// Returns false if it was already recorded.
    pub async fn record_processed(
        &self,
        message: &InboundMessage,
        now: TimeMs,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_messages (message_id, queue, message_type, payload_digest, processed_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(message_id) DO NOTHING
            "#,
        )
        .bind(&message.id)
        .bind(message.queue.as_str())
        .bind(&message.message_type)
        .bind(message.payload_digest())
        .bind(now.as_ms())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Quarantine a message together with its raw payload.
    ///
    /// Idempotent on message id: the first recorded reason wins.
    pub async fn insert_dead_letter(
        &self,
        message: &InboundMessage,
        reason: &str,
        now: TimeMs,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO dead_letters
            (message_id, queue, message_type, raw_payload, payload_digest, reason, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(message_id) DO NOTHING
            "#,
        )
        .bind(&message.id)
        .bind(message.queue.as_str())
        .bind(&message.message_type)
        .bind(&message.payload)
        .bind(message.payload_digest())
        .bind(reason)
        .bind(now.as_ms())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn is_dead_lettered(&self, message_id: &str) -> Result<bool, sqlx::Error> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE message_id = ?")
                .bind(message_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    pub async fn count_processed(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM processed_messages")
            .fetch_one(&self.pool)
            .await
    }

    /// Dead letters, oldest first.
    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, message_id, queue, message_type, raw_payload, payload_digest, reason, created_at
            FROM dead_letters
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(DeadLetter {
                    id: row.try_get("id")?,
                    message_id: row.try_get("message_id")?,
                    queue: row.try_get("queue")?,
                    message_type: row.try_get("message_type")?,
                    raw_payload: row.try_get("raw_payload")?,
                    payload_digest: row.try_get("payload_digest")?,
                    reason: row.try_get("reason")?,
                    created_at: TimeMs::new(row.try_get("created_at")?),
                })
            })
            .collect()
    }
}
