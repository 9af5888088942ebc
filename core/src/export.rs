use std::io::Write;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::models::Receipt;

#[derive(Debug, Serialize)]
struct ItemRow<'a> {
    receipt_id: &'a str,
    date: &'a str,
    store: &'a str,
    item: &'a str,
    raw_name: &'a str,
    category: &'a str,
    quantity: f64,
    unit_price: f64,
    total_price: f64,
    discounted: bool,
    price_mismatch: bool,
}

/// Write receipt history as CSV, one row per item, in history order.
pub fn write_history_csv<W: Write>(history: &[Receipt], writer: W) -> Result<usize> {
    let mut wtr = csv::Writer::from_writer(writer);
    let mut rows = 0;
    for receipt in history {
        for item in &receipt.items {
            wtr.serialize(ItemRow {
                receipt_id: &receipt.id,
                date: &receipt.metadata.date,
                store: &receipt.metadata.store_name,
                item: item.display_name(),
                raw_name: &item.raw_name,
                category: &item.category,
                quantity: item.quantity,
                unit_price: item.unit_price,
                total_price: item.total_price,
                discounted: item.is_discounted,
                price_mismatch: item.has_total_mismatch(),
            })
            .context("Failed to write CSV row")?;
            rows += 1;
        }
    }
    wtr.flush().context("Failed to flush CSV output")?;
    Ok(rows)
}
