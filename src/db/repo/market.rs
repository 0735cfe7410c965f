//! Spot price and tariff version operations for the repository.

use crate::domain::{
    format_date, ChargeType, Decimal, PriceArea, SpotPrice, TariffSchedule, TariffVersion, TimeMs,
};
use sqlx::Row;

use super::{get_parsed, get_parsed_opt, Repository};

impl Repository {
    /// Upsert spot prices keyed by (price area, timestamp).
    pub async fn upsert_spot_prices(&self, prices: &[SpotPrice]) -> Result<usize, sqlx::Error> {
        if prices.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for price in prices {
            sqlx::query(
                r#"
                INSERT INTO spot_prices (price_area, timestamp_ms, resolution, price)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(price_area, timestamp_ms) DO UPDATE SET
                    resolution = excluded.resolution,
                    price = excluded.price
                "#,
            )
            .bind(price.price_area.as_str())
            .bind(price.timestamp.as_ms())
            .bind(price.resolution.as_str())
            .bind(price.price.to_canonical_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(prices.len())
    }

    /// Spot prices in `[from, to)`, ordered by time.
    pub async fn spot_prices_in_range(
        &self,
        area: &PriceArea,
        from: TimeMs,
        to: TimeMs,
    ) -> Result<Vec<SpotPrice>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT price_area, timestamp_ms, resolution, price
            FROM spot_prices
            WHERE price_area = ? AND timestamp_ms >= ? AND timestamp_ms < ?
            ORDER BY timestamp_ms ASC
            "#,
        )
        .bind(area.as_str())
        .bind(from.as_ms())
        .bind(to.as_ms())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(SpotPrice {
                    price_area: PriceArea::new(row.try_get::<String, _>("price_area")?),
                    timestamp: TimeMs::new(row.try_get("timestamp_ms")?),
                    resolution: get_parsed(row, "resolution")?,
                    price: get_parsed(row, "price")?,
                })
            })
            .collect()
    }

    /// Upsert a tariff version keyed by (scope, charge type, valid_from).
    ///
    /// Rates are stored as a JSON array of decimal strings.
    pub async fn upsert_tariff_version(&self, version: &TariffVersion) -> Result<(), sqlx::Error> {
        let rates: Vec<String> = version
            .rates
            .iter()
            .map(|r| r.to_canonical_string())
            .collect();
        let rates_json = serde_json::Value::from(rates).to_string();

        sqlx::query(
            r#"
            INSERT INTO tariff_rates (scope, charge_type, valid_from, valid_to, rates)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(scope, charge_type, valid_from) DO UPDATE SET
                valid_to = excluded.valid_to,
                rates = excluded.rates
            "#,
        )
        .bind(&version.scope)
        .bind(version.charge_type.as_str())
        .bind(format_date(version.valid_from))
        .bind(version.valid_to.map(format_date))
        .bind(rates_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All versions of one tariff.
    pub async fn tariff_schedule(
        &self,
        scope: &str,
        charge_type: ChargeType,
    ) -> Result<TariffSchedule, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT scope, charge_type, valid_from, valid_to, rates
            FROM tariff_rates
            WHERE scope = ? AND charge_type = ?
            ORDER BY valid_from ASC
            "#,
        )
        .bind(scope)
        .bind(charge_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        let versions = rows
            .iter()
            .map(|row| {
                let rates_json: String = row.try_get("rates")?;
                let raw: Vec<String> = serde_json::from_str(&rates_json)
                    .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
                let rates = raw
                    .iter()
                    .map(|r| super::decode::<Decimal>(r))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(TariffVersion {
                    scope: row.try_get("scope")?,
                    charge_type: get_parsed(row, "charge_type")?,
                    valid_from: get_parsed(row, "valid_from")?,
                    valid_to: get_parsed_opt(row, "valid_to")?,
                    rates,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        Ok(TariffSchedule::new(versions))
    }
}
