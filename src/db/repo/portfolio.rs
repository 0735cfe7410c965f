//! Metering point, supply period and contract operations for the repository.

use crate::domain::{
    format_date, Contract, ContractStatus, GridArea, MeteringPoint, MeteringPointId,
    NewContract, PriceArea, SupplyPeriod, TimeMs,
};
use crate::error::CoreError;
use chrono::NaiveDate;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};

use super::{get_parsed, get_parsed_opt, is_unique_violation, Repository};

impl Repository {
    // =========================================================================
    // Metering points
    // =========================================================================

    /// Insert or update a metering point's master data.
    pub async fn upsert_metering_point(&self, point: &MeteringPoint) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO metering_points (id, grid_area, price_area, activated)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                grid_area = excluded.grid_area,
                price_area = excluded.price_area,
                activated = excluded.activated
            "#,
        )
        .bind(point.id.as_str())
        .bind(point.grid_area.as_str())
        .bind(point.price_area.as_str())
        .bind(point.activated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_metering_point(
        &self,
        id: &MeteringPointId,
    ) -> Result<Option<MeteringPoint>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, grid_area, price_area, activated FROM metering_points WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| MeteringPoint {
            id: MeteringPointId::new(r.get::<String, _>("id")),
            grid_area: GridArea::new(r.get::<String, _>("grid_area")),
            price_area: PriceArea::new(r.get::<String, _>("price_area")),
            activated: r.get::<bool, _>("activated"),
        }))
    }

    // =========================================================================
    // Supply periods
    // =========================================================================

    /// Supply period active on `today` (started and not yet ended).
    pub async fn active_supply_period(
        &self,
        id: &MeteringPointId,
        today: NaiveDate,
    ) -> Result<Option<SupplyPeriod>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT id, metering_point_id, start_date, end_date, activated_at
            FROM supply_periods
            WHERE metering_point_id = ? AND start_date <= ?
              AND (end_date IS NULL OR end_date > ?)
            ORDER BY start_date DESC
            LIMIT 1
            "#,
        )
        .bind(id.as_str())
        .bind(format_date(today))
        .bind(format_date(today))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(supply_period_from_row).transpose()
    }

    /// Most recently started supply period, whether open or closed.
    pub async fn latest_supply_period(
        &self,
        id: &MeteringPointId,
    ) -> Result<Option<SupplyPeriod>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT id, metering_point_id, start_date, end_date, activated_at
            FROM supply_periods
            WHERE metering_point_id = ?
            ORDER BY start_date DESC
            LIMIT 1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(supply_period_from_row).transpose()
    }

    /// Every supply period of every point that has an active contract.
    pub async fn supply_periods_for_active_contracts(
        &self,
    ) -> Result<Vec<(Contract, SupplyPeriod)>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.metering_point_id, c.payment_model, c.billing_frequency,
                   c.margin_per_kwh, c.supplement_per_kwh, c.supplier_subscription_monthly,
                   c.estimated_annual_kwh, c.status,
                   s.id AS supply_id, s.start_date, s.end_date, s.activated_at
            FROM contracts c
            JOIN supply_periods s ON s.metering_point_id = c.metering_point_id
            WHERE c.status = 'active'
            ORDER BY c.id ASC, s.start_date ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let contract = contract_from_row(row)?;
                let supply = SupplyPeriod {
                    id: row.try_get("supply_id")?,
                    metering_point_id: contract.metering_point_id.clone(),
                    start_date: get_parsed(row, "start_date")?,
                    end_date: get_parsed_opt(row, "end_date")?,
                    activated_at: TimeMs::new(row.try_get("activated_at")?),
                };
                Ok((contract, supply))
            })
            .collect()
    }

    /// Open a supply period inside an existing transaction.
    ///
    /// Idempotent on (metering point, start date).
    pub(crate) async fn open_supply_period_tx(
        tx: &mut Transaction<'_, Sqlite>,
        id: &MeteringPointId,
        start_date: NaiveDate,
        activated_at: TimeMs,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO supply_periods (metering_point_id, start_date, end_date, activated_at)
            VALUES (?, ?, NULL, ?)
            ON CONFLICT(metering_point_id, start_date) DO NOTHING
            "#,
        )
        .bind(id.as_str())
        .bind(format_date(start_date))
        .bind(activated_at.as_ms())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Close the open supply period of a point at `end_date` (exclusive).
    pub(crate) async fn close_supply_period_tx(
        tx: &mut Transaction<'_, Sqlite>,
        id: &MeteringPointId,
        end_date: NaiveDate,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE supply_periods
            SET end_date = ?
            WHERE metering_point_id = ? AND end_date IS NULL AND start_date < ?
            "#,
        )
        .bind(format_date(end_date))
        .bind(id.as_str())
        .bind(format_date(end_date))
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected())
    }

    /// Open a supply period outside of any process transition.
    pub async fn open_supply_period(
        &self,
        id: &MeteringPointId,
        start_date: NaiveDate,
        activated_at: TimeMs,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        Self::open_supply_period_tx(&mut tx, id, start_date, activated_at).await?;
        tx.commit().await?;
        Ok(())
    }

    // =========================================================================
    // Contracts
    // =========================================================================

    /// Insert a new active contract.
    ///
    /// # Errors
    /// `Conflict` if the point already has an active contract.
    pub async fn insert_contract(&self, contract: &NewContract) -> Result<Contract, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO contracts (
                metering_point_id, payment_model, billing_frequency, margin_per_kwh,
                supplement_per_kwh, supplier_subscription_monthly, estimated_annual_kwh,
                status, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 'active', ?)
            "#,
        )
        .bind(contract.metering_point_id.as_str())
        .bind(contract.payment_model.as_str())
        .bind(contract.billing_frequency.as_str())
        .bind(contract.margin_per_kwh.to_canonical_string())
        .bind(contract.supplement_per_kwh.map(|d| d.to_canonical_string()))
        .bind(contract.supplier_subscription_monthly.to_canonical_string())
        .bind(contract.estimated_annual_kwh.to_canonical_string())
        .bind(TimeMs::now().as_ms())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(Contract {
                id: done.last_insert_rowid(),
                metering_point_id: contract.metering_point_id.clone(),
                payment_model: contract.payment_model,
                billing_frequency: contract.billing_frequency,
                margin_per_kwh: contract.margin_per_kwh,
                supplement_per_kwh: contract.supplement_per_kwh,
                supplier_subscription_monthly: contract.supplier_subscription_monthly,
                estimated_annual_kwh: contract.estimated_annual_kwh,
                status: ContractStatus::Active,
            }),
            Err(e) if is_unique_violation(&e) => Err(CoreError::Conflict(format!(
                "metering point {} already has an active contract",
                contract.metering_point_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn active_contract(
        &self,
        id: &MeteringPointId,
    ) -> Result<Option<Contract>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "{} WHERE metering_point_id = ? AND status = 'active'",
            CONTRACT_SELECT
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(contract_from_row).transpose()
    }

    /// Most recent contract of a point, active or terminated.
    pub async fn latest_contract(
        &self,
        id: &MeteringPointId,
    ) -> Result<Option<Contract>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "{} WHERE metering_point_id = ? ORDER BY id DESC LIMIT 1",
            CONTRACT_SELECT
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(contract_from_row).transpose()
    }

    pub async fn get_contract(&self, contract_id: i64) -> Result<Option<Contract>, sqlx::Error> {
        let row = sqlx::query(&format!("{} WHERE id = ?", CONTRACT_SELECT))
            .bind(contract_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(contract_from_row).transpose()
    }

    /// Terminate the active contract of a point inside a transaction.
    pub(crate) async fn terminate_contract_tx(
        tx: &mut Transaction<'_, Sqlite>,
        id: &MeteringPointId,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE contracts SET status = 'terminated' WHERE metering_point_id = ? AND status = 'active'",
        )
        .bind(id.as_str())
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected())
    }
}

const CONTRACT_SELECT: &str = r#"
    SELECT id, metering_point_id, payment_model, billing_frequency, margin_per_kwh,
           supplement_per_kwh, supplier_subscription_monthly, estimated_annual_kwh, status
    FROM contracts
"#;

fn contract_from_row(row: &SqliteRow) -> Result<Contract, sqlx::Error> {
    Ok(Contract {
        id: row.try_get("id")?,
        metering_point_id: MeteringPointId::new(row.try_get::<String, _>("metering_point_id")?),
        payment_model: get_parsed(row, "payment_model")?,
        billing_frequency: get_parsed(row, "billing_frequency")?,
        margin_per_kwh: get_parsed(row, "margin_per_kwh")?,
        supplement_per_kwh: get_parsed_opt(row, "supplement_per_kwh")?,
        supplier_subscription_monthly: get_parsed(row, "supplier_subscription_monthly")?,
        estimated_annual_kwh: get_parsed(row, "estimated_annual_kwh")?,
        status: get_parsed(row, "status")?,
    })
}

fn supply_period_from_row(row: &SqliteRow) -> Result<SupplyPeriod, sqlx::Error> {
    Ok(SupplyPeriod {
        id: row.try_get("id")?,
        metering_point_id: MeteringPointId::new(row.try_get::<String, _>("metering_point_id")?),
        start_date: get_parsed(row, "start_date")?,
        end_date: get_parsed_opt(row, "end_date")?,
        activated_at: TimeMs::new(row.try_get("activated_at")?),
    })
}
