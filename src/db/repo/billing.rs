//! Invoice and aconto payment operations for the repository.

use crate::domain::{
    format_date, AcontoPayment, BillingPeriod, Decimal, Invoice, InvoiceLine, InvoiceLineType,
    InvoiceStatus, InvoiceType, MeteringPointId, TimeMs,
};
use chrono::NaiveDate;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{get_parsed, is_unique_violation, Repository};

/// Invoice to be written together with its lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInvoice {
    pub contract_id: i64,
    pub metering_point_id: MeteringPointId,
    pub invoice_type: InvoiceType,
    pub period: BillingPeriod,
    pub settlement_run_id: Option<i64>,
    pub lines: Vec<InvoiceLine>,
}

impl NewInvoice {
    pub fn total_ex_vat(&self) -> Decimal {
        self.lines.iter().map(|l| l.amount_ex_vat).sum()
    }

    pub fn total_incl_vat(&self) -> Decimal {
        self.lines.iter().map(|l| l.amount_incl_vat).sum()
    }
}

const INVOICE_SELECT: &str = r#"
    SELECT id, contract_id, invoice_type, status, period_start, period_end,
           settlement_run_id, total_ex_vat, total_incl_vat, created_at
    FROM invoices
"#;

impl Repository {
    /// Write an invoice, its lines, and an aconto payment row for every
    /// prepayment line, in one transaction.
    ///
    /// Returns `None` when a non-cancelled invoice of the same type already
    /// exists for the contract and period.
    pub async fn insert_invoice(
        &self,
        invoice: &NewInvoice,
        now: TimeMs,
    ) -> Result<Option<Invoice>, sqlx::Error> {
        let total_ex_vat = invoice.total_ex_vat();
        let total_incl_vat = invoice.total_incl_vat();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO invoices
            (contract_id, invoice_type, status, period_start, period_end, settlement_run_id,
             total_ex_vat, total_incl_vat, created_at)
            VALUES (?, ?, 'draft', ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(invoice.contract_id)
        .bind(invoice.invoice_type.as_str())
        .bind(format_date(invoice.period.start))
        .bind(format_date(invoice.period.end))
        .bind(invoice.settlement_run_id)
        .bind(total_ex_vat.to_canonical_string())
        .bind(total_incl_vat.to_canonical_string())
        .bind(now.as_ms())
        .execute(&mut *tx)
        .await;

        let invoice_id = match inserted {
            Ok(done) => done.last_insert_rowid(),
            Err(e) if is_unique_violation(&e) => return Ok(None),
            Err(e) => return Err(e),
        };

        for line in &invoice.lines {
            sqlx::query(
                r#"
                INSERT INTO invoice_lines
                (invoice_id, line_type, description, period_start, period_end, amount_ex_vat, amount_incl_vat)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(invoice_id)
            .bind(line.line_type.as_str())
            .bind(&line.description)
            .bind(format_date(line.period.start))
            .bind(format_date(line.period.end))
            .bind(line.amount_ex_vat.to_canonical_string())
            .bind(line.amount_incl_vat.to_canonical_string())
            .execute(&mut *tx)
            .await?;

            if line.line_type == InvoiceLineType::AcontoPrepayment {
                sqlx::query(
                    r#"
                    INSERT INTO aconto_payments (metering_point_id, period_start, period_end, amount, invoice_id, paid_at)
                    VALUES (?, ?, ?, ?, ?, NULL)
                    ON CONFLICT(metering_point_id, period_start, period_end) DO UPDATE SET
                        amount = excluded.amount,
                        invoice_id = excluded.invoice_id,
                        paid_at = NULL
                    "#,
                )
                .bind(invoice.metering_point_id.as_str())
                .bind(format_date(line.period.start))
                .bind(format_date(line.period.end))
                .bind(line.amount_ex_vat.to_canonical_string())
                .bind(invoice_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(Some(Invoice {
            id: invoice_id,
            contract_id: invoice.contract_id,
            invoice_type: invoice.invoice_type,
            status: InvoiceStatus::Draft,
            period: invoice.period,
            settlement_run_id: invoice.settlement_run_id,
            total_ex_vat,
            total_incl_vat,
            created_at: now,
        }))
    }

    /// Non-cancelled invoice for (contract, period, type).
    pub async fn live_invoice(
        &self,
        contract_id: i64,
        period: BillingPeriod,
        invoice_type: InvoiceType,
    ) -> Result<Option<Invoice>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "{} WHERE contract_id = ? AND period_start = ? AND period_end = ? AND invoice_type = ? AND status != 'cancelled'",
            INVOICE_SELECT
        ))
        .bind(contract_id)
        .bind(format_date(period.start))
        .bind(format_date(period.end))
        .bind(invoice_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(invoice_from_row).transpose()
    }

    pub async fn get_invoice(&self, invoice_id: i64) -> Result<Option<Invoice>, sqlx::Error> {
        let row = sqlx::query(&format!("{} WHERE id = ?", INVOICE_SELECT))
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(invoice_from_row).transpose()
    }

    pub async fn invoices_for_contract(&self, contract_id: i64) -> Result<Vec<Invoice>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "{} WHERE contract_id = ? ORDER BY period_start ASC, id ASC",
            INVOICE_SELECT
        ))
        .bind(contract_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(invoice_from_row).collect()
    }

    pub async fn invoice_lines(&self, invoice_id: i64) -> Result<Vec<InvoiceLine>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT line_type, description, period_start, period_end, amount_ex_vat, amount_incl_vat
            FROM invoice_lines
            WHERE invoice_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(line_from_row).collect()
    }

    /// Lines tagged with `period` across all non-cancelled invoices of a contract.
    pub async fn live_lines_for_period(
        &self,
        contract_id: i64,
        period: BillingPeriod,
    ) -> Result<Vec<InvoiceLine>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT l.line_type, l.description, l.period_start, l.period_end,
                   l.amount_ex_vat, l.amount_incl_vat
            FROM invoice_lines l
            JOIN invoices i ON i.id = l.invoice_id
            WHERE i.contract_id = ? AND i.status != 'cancelled'
              AND l.period_start = ? AND l.period_end = ?
            ORDER BY l.id ASC
            "#,
        )
        .bind(contract_id)
        .bind(format_date(period.start))
        .bind(format_date(period.end))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(line_from_row).collect()
    }

    /// Cancel an invoice, freeing its uniqueness slot.
    ///
    /// Unpaid aconto payments recorded by the invoice are removed with it.
    pub async fn cancel_invoice(&self, invoice_id: i64) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE invoices SET status = 'cancelled' WHERE id = ? AND status IN ('draft', 'sent')",
        )
        .bind(invoice_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() > 0 {
            sqlx::query("DELETE FROM aconto_payments WHERE invoice_id = ? AND paid_at IS NULL")
                .bind(invoice_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(updated.rows_affected() > 0)
    }

    // =========================================================================
    // Aconto payments
    // =========================================================================

    pub async fn aconto_payment(
        &self,
        id: &MeteringPointId,
        period: BillingPeriod,
    ) -> Result<Option<AcontoPayment>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT id, metering_point_id, period_start, period_end, amount, invoice_id, paid_at
            FROM aconto_payments
            WHERE metering_point_id = ? AND period_start = ? AND period_end = ?
            "#,
        )
        .bind(id.as_str())
        .bind(format_date(period.start))
        .bind(format_date(period.end))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(|r| {
                Ok(AcontoPayment {
                    id: r.try_get("id")?,
                    metering_point_id: MeteringPointId::new(
                        r.try_get::<String, _>("metering_point_id")?,
                    ),
                    period: period_from_row(r, "period_start", "period_end")?,
                    amount: get_parsed(r, "amount")?,
                    invoice_id: r.try_get("invoice_id")?,
                    paid_at: r.try_get::<Option<i64>, _>("paid_at")?.map(TimeMs::new),
                })
            })
            .transpose()
    }

    /// Record that the prepayment for a period was received.
    pub async fn mark_aconto_paid(
        &self,
        id: &MeteringPointId,
        period: BillingPeriod,
        paid_at: TimeMs,
    ) -> Result<bool, sqlx::Error> {
        let updated = sqlx::query(
            r#"
            UPDATE aconto_payments SET paid_at = ?
            WHERE metering_point_id = ? AND period_start = ? AND period_end = ? AND paid_at IS NULL
            "#,
        )
        .bind(paid_at.as_ms())
        .bind(id.as_str())
        .bind(format_date(period.start))
        .bind(format_date(period.end))
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }
}

fn period_from_row(
    row: &SqliteRow,
    start_col: &str,
    end_col: &str,
) -> Result<BillingPeriod, sqlx::Error> {
    let start: NaiveDate = get_parsed(row, start_col)?;
    let end: NaiveDate = get_parsed(row, end_col)?;
    BillingPeriod::new(start, end).ok_or_else(|| {
        sqlx::Error::Decode(format!("empty billing period {} - {}", start, end).into())
    })
}

fn invoice_from_row(row: &SqliteRow) -> Result<Invoice, sqlx::Error> {
    Ok(Invoice {
        id: row.try_get("id")?,
        contract_id: row.try_get("contract_id")?,
        invoice_type: get_parsed(row, "invoice_type")?,
        status: get_parsed(row, "status")?,
        period: period_from_row(row, "period_start", "period_end")?,
        settlement_run_id: row.try_get("settlement_run_id")?,
        total_ex_vat: get_parsed(row, "total_ex_vat")?,
        total_incl_vat: get_parsed(row, "total_incl_vat")?,
        created_at: TimeMs::new(row.try_get("created_at")?),
    })
}

fn line_from_row(row: &SqliteRow) -> Result<InvoiceLine, sqlx::Error> {
    Ok(InvoiceLine {
        line_type: get_parsed(row, "line_type")?,
        description: row.try_get("description")?,
        period: period_from_row(row, "period_start", "period_end")?,
        amount_ex_vat: get_parsed(row, "amount_ex_vat")?,
        amount_incl_vat: get_parsed(row, "amount_incl_vat")?,
    })
}
