use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;

use crate::application::MarketService;
use crate::domain::{format_cents, Cents, Profile, Purchase, Transaction};

/// Earnings snapshot of one producer
#[derive(Debug, Clone, Serialize)]
pub struct EarningsSnapshot {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub user: Profile,
    pub balance_cents: Cents,
    pub sales: Vec<Purchase>,
    /// Licenses the user bought
    pub purchases: Vec<Purchase>,
    pub transactions: Vec<Transaction>,
}

/// Exporter for a producer's sales and ledger
pub struct Exporter<'a> {
    service: &'a MarketService,
}

impl<'a> Exporter<'a> {
    pub fn new(service: &'a MarketService) -> Self {
        Self { service }
    }

    /// Export sales to CSV format
    pub async fn export_sales_csv<W: Write>(&self, user: &Profile, writer: W) -> Result<usize> {
        let sales = self.service.sales(user.id).await?;
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record([
            "id",
            "created_at",
            "beat_id",
            "buyer_id",
            "license",
            "price",
            "currency",
            "transaction_id",
        ])?;

        for sale in &sales {
            csv_writer.write_record([
                sale.id.to_string(),
                sale.created_at.to_rfc3339(),
                sale.beat_id.to_string(),
                sale.user_id.to_string(),
                sale.license.as_str().to_string(),
                format_cents(sale.price_paid_cents),
                sale.currency.clone(),
                sale.transaction_id.clone(),
            ])?;
        }

        csv_writer.flush()?;
        Ok(sales.len())
    }

    /// Export withdrawals and other ledger entries to CSV format
    pub async fn export_transactions_csv<W: Write>(
        &self,
        user: &Profile,
        writer: W,
    ) -> Result<usize> {
        let transactions = self.service.transactions(user.id).await?;
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record(["id", "created_at", "kind", "amount", "status"])?;

        for tx in &transactions {
            csv_writer.write_record([
                tx.id.to_string(),
                tx.created_at.to_rfc3339(),
                tx.kind.as_str().to_string(),
                format_cents(tx.amount_cents),
                tx.status.clone(),
            ])?;
        }

        csv_writer.flush()?;
        Ok(transactions.len())
    }

    /// Export sales, bought licenses, ledger and balance as one JSON document
    pub async fn export_json<W: Write>(
        &self,
        user: &Profile,
        mut writer: W,
    ) -> Result<EarningsSnapshot> {
        let sales = self.service.sales(user.id).await?;
        let purchases = self.service.purchases(user.id).await?;
        let transactions = self.service.transactions(user.id).await?;
        let balance_cents = self.service.balance(user.id).await?;

        let snapshot = EarningsSnapshot {
            version: env!("CARGO_PKG_VERSION").to_string(),
            exported_at: Utc::now(),
            user: user.clone(),
            balance_cents,
            sales,
            purchases,
            transactions,
        };

        let json = serde_json::to_string_pretty(&snapshot)?;
        writer.write_all(json.as_bytes())?;
        writer.flush()?;

        Ok(snapshot)
    }
}
