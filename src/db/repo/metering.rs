//! Metering sample and revision operations for the repository.

use crate::domain::{
    Decimal, MeteringPointId, MeteringRevision, MeteringSample, TimeMs, UpsertOutcome,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};

use super::{get_parsed, Repository};

impl Repository {
    /// Upsert samples keyed by (metering point, timestamp).
    ///
    /// A revision row is written only when the stored quantity changes, so
    /// redelivery of identical data is a no-op.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub async fn upsert_samples(
        &self,
        samples: &[MeteringSample],
        now: TimeMs,
    ) -> Result<UpsertOutcome, sqlx::Error> {
        let mut outcome = UpsertOutcome::default();
        if samples.is_empty() {
            return Ok(outcome);
        }

        let mut tx = self.pool.begin().await?;

        for sample in samples {
            let existing = sqlx::query(
                r#"
                SELECT quantity, source_message_id
                FROM metering_samples
                WHERE metering_point_id = ? AND timestamp_ms = ?
                "#,
            )
            .bind(sample.metering_point_id.as_str())
            .bind(sample.timestamp.as_ms())
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                None => {
                    sqlx::query(
                        r#"
                        INSERT INTO metering_samples
                        (metering_point_id, timestamp_ms, resolution, quantity, quality_code, source_message_id, updated_at)
                        VALUES (?, ?, ?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(sample.metering_point_id.as_str())
                    .bind(sample.timestamp.as_ms())
                    .bind(sample.resolution.as_str())
                    .bind(sample.quantity.to_canonical_string())
                    .bind(sample.quality_code.as_str())
                    .bind(&sample.source_message_id)
                    .bind(now.as_ms())
                    .execute(&mut *tx)
                    .await?;
                    outcome.inserted += 1;
                }
                Some(row) => {
                    let previous_quantity: Decimal = get_parsed(&row, "quantity")?;
                    if previous_quantity == sample.quantity {
                        outcome.unchanged += 1;
                        continue;
                    }
                    let previous_source: String = row.try_get("source_message_id")?;
                    update_sample_tx(&mut tx, sample, now).await?;
                    sqlx::query(
                        r#"
                        INSERT INTO metering_revisions
                        (metering_point_id, timestamp_ms, previous_quantity, new_quantity, previous_source, new_source, revised_at)
                        VALUES (?, ?, ?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(sample.metering_point_id.as_str())
                    .bind(sample.timestamp.as_ms())
                    .bind(previous_quantity.to_canonical_string())
                    .bind(sample.quantity.to_canonical_string())
                    .bind(previous_source)
                    .bind(&sample.source_message_id)
                    .bind(now.as_ms())
                    .execute(&mut *tx)
                    .await?;
                    outcome.revised += 1;
                }
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    /// Samples in `[from, to)` and the highest revision id, read in one
    /// transaction so the two agree.
    pub async fn metering_snapshot(
        &self,
        id: &MeteringPointId,
        from: TimeMs,
        to: TimeMs,
    ) -> Result<(Vec<MeteringSample>, i64), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let samples = samples_in_range_tx(&mut tx, id, from, to).await?;
        let watermark: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM metering_revisions")
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok((samples, watermark))
    }

    /// Revisions in `[from, to)` with id above `after_id`, plus the current
    /// samples of the same range, read in one transaction.
    pub async fn revision_snapshot(
        &self,
        id: &MeteringPointId,
        from: TimeMs,
        to: TimeMs,
        after_id: i64,
    ) -> Result<(Vec<MeteringRevision>, Vec<MeteringSample>), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            r#"
            SELECT id, metering_point_id, timestamp_ms, previous_quantity, new_quantity,
                   previous_source, new_source, revised_at
            FROM metering_revisions
            WHERE metering_point_id = ? AND timestamp_ms >= ? AND timestamp_ms < ? AND id > ?
            ORDER BY id ASC
            "#,
        )
        .bind(id.as_str())
        .bind(from.as_ms())
        .bind(to.as_ms())
        .bind(after_id)
        .fetch_all(&mut *tx)
        .await?;
        let revisions = rows
            .iter()
            .map(revision_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let samples = samples_in_range_tx(&mut tx, id, from, to).await?;
        tx.commit().await?;
        Ok((revisions, samples))
    }

    pub async fn samples_in_range(
        &self,
        id: &MeteringPointId,
        from: TimeMs,
        to: TimeMs,
    ) -> Result<Vec<MeteringSample>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let samples = samples_in_range_tx(&mut tx, id, from, to).await?;
        tx.commit().await?;
        Ok(samples)
    }

    /// Whether any sample exists in `[from, to)`.
    pub async fn has_samples_in_range(
        &self,
        id: &MeteringPointId,
        from: TimeMs,
        to: TimeMs,
    ) -> Result<bool, sqlx::Error> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM metering_samples
            WHERE metering_point_id = ? AND timestamp_ms >= ? AND timestamp_ms < ?
            "#,
        )
        .bind(id.as_str())
        .bind(from.as_ms())
        .bind(to.as_ms())
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Highest revision id in `[from, to)` for a point, 0 if none.
    pub async fn latest_revision_id_in_range(
        &self,
        id: &MeteringPointId,
        from: TimeMs,
        to: TimeMs,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            SELECT COALESCE(MAX(id), 0) FROM metering_revisions
            WHERE metering_point_id = ? AND timestamp_ms >= ? AND timestamp_ms < ?
            "#,
        )
        .bind(id.as_str())
        .bind(from.as_ms())
        .bind(to.as_ms())
        .fetch_one(&self.pool)
        .await
    }
}

async fn update_sample_tx(
    tx: &mut Transaction<'_, Sqlite>,
    sample: &MeteringSample,
    now: TimeMs,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE metering_samples
        SET resolution = ?, quantity = ?, quality_code = ?, source_message_id = ?, updated_at = ?
        WHERE metering_point_id = ? AND timestamp_ms = ?
        "#,
    )
    .bind(sample.resolution.as_str())
    .bind(sample.quantity.to_canonical_string())
    .bind(sample.quality_code.as_str())
    .bind(&sample.source_message_id)
    .bind(now.as_ms())
    .bind(sample.metering_point_id.as_str())
    .bind(sample.timestamp.as_ms())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn samples_in_range_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: &MeteringPointId,
    from: TimeMs,
    to: TimeMs,
) -> Result<Vec<MeteringSample>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT metering_point_id, timestamp_ms, resolution, quantity, quality_code, source_message_id
        FROM metering_samples
        WHERE metering_point_id = ? AND timestamp_ms >= ? AND timestamp_ms < ?
        ORDER BY timestamp_ms ASC
        "#,
    )
    .bind(id.as_str())
    .bind(from.as_ms())
    .bind(to.as_ms())
    .fetch_all(&mut **tx)
    .await?;

    rows.iter().map(sample_from_row).collect()
}

fn sample_from_row(row: &SqliteRow) -> Result<MeteringSample, sqlx::Error> {
    Ok(MeteringSample {
        metering_point_id: MeteringPointId::new(row.try_get::<String, _>("metering_point_id")?),
        timestamp: TimeMs::new(row.try_get("timestamp_ms")?),
        resolution: get_parsed(row, "resolution")?,
        quantity: get_parsed(row, "quantity")?,
        quality_code: get_parsed(row, "quality_code")?,
        source_message_id: row.try_get("source_message_id")?,
    })
}

fn revision_from_row(row: &SqliteRow) -> Result<MeteringRevision, sqlx::Error> {
    Ok(MeteringRevision {
        id: row.try_get("id")?,
        metering_point_id: MeteringPointId::new(row.try_get::<String, _>("metering_point_id")?),
        timestamp: TimeMs::new(row.try_get("timestamp_ms")?),
        previous_quantity: get_parsed(row, "previous_quantity")?,
        new_quantity: get_parsed(row, "new_quantity")?,
        previous_source: row.try_get("previous_source")?,
        new_source: row.try_get("new_source")?,
        revised_at: TimeMs::new(row.try_get("revised_at")?),
    })
}
