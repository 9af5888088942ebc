use anyhow::{Result, bail};
use std::path::PathBuf;

use basket_core::controller::Controller;
use basket_core::extract::{ReceiptExtractor, Upload};
use basket_core::models::{Item, Receipt};

use super::helpers::{
    ExitStatus, find_receipt, money, parse_amount, parse_date, parse_item_spec, print_item_table,
    print_receipt_table, require_signed_in, session_err, short_id,
};

fn print_receipt(receipt: &Receipt) {
    let meta = &receipt.metadata;
    let time = meta
        .time
        .as_deref()
        .map(|t| format!(" {t}"))
        .unwrap_or_default();
    println!("=== {} ({}{time}) ===", meta.store_name, meta.date);
    println!("  ID: {}", receipt.id);
    print_item_table(&receipt.items);
    println!(
        "  TOTAL: {} | SAVED: {} | {:.1}% of monthly budget",
        money(meta.total_spent),
        money(meta.total_saved),
        receipt.analysis.budget_impact_pct
    );
    let mismatched = receipt.mismatched_items().len();
    if mismatched > 0 {
        println!("  {mismatched} item(s) where qty x unit price != line total");
    }
    if !receipt.analysis.diet_compliant {
        println!(
            "  Diet: not compliant ({})",
            receipt.analysis.flagged_items.join(", ")
        );
    }
    if !receipt.analysis.insights.is_empty() {
        println!("  Insights: {}", receipt.analysis.insights);
    }
    if !receipt.coach_message.is_empty() {
        println!("  Coach: {}", receipt.coach_message);
    }
}

pub(crate) async fn cmd_scan(
    ctl: &mut Controller,
    extractor: &dyn ReceiptExtractor,
    files: &[PathBuf],
    json: bool,
) -> Result<()> {
    require_signed_in(ctl)?;
    let uploads = files
        .iter()
        .map(|f| Upload::from_path(f))
        .collect::<Result<Vec<_>>>()?;

    eprintln!("Reading {} receipt(s)...", uploads.len());
    let newest_before = ctl.state().history.first().map(|r| r.id.clone());
    let saved = match ctl.process_uploads(extractor, &uploads).await {
        Ok(saved) => saved,
        Err(e) => {
            // Receipts read before the failure are already saved
            let history = &ctl.state().history;
            let kept = newest_before
                .and_then(|id| history.iter().position(|r| r.id == id))
                .unwrap_or(history.len());
            if kept > 0 {
                eprintln!("Saved {kept} receipt(s) before the failure");
            }
            return Err(session_err(e));
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&saved)?);
    } else {
        for receipt in &saved {
            print_receipt(receipt);
            println!();
        }
        println!("Saved {} receipt(s)", saved.len());
    }
    Ok(())
}

pub(crate) fn cmd_add(
    ctl: &mut Controller,
    store: &str,
    date: Option<String>,
    items: &[String],
    saved: Option<&str>,
    json: bool,
) -> Result<()> {
    require_signed_in(ctl)?;
    if store.trim().is_empty() {
        bail!("Store name is required");
    }
    if items.is_empty() {
        bail!("Add at least one --item NAME:PRICE[:QTY[:CATEGORY]]");
    }
    let date = parse_date(date)?;
    let items = items
        .iter()
        .map(|s| parse_item_spec(s))
        .collect::<Result<Vec<Item>>>()?;

    let mut receipt = Receipt::manual(store, date, items);
    if let Some(saved) = saved {
        receipt.metadata.total_saved = parse_amount(saved, "savings")?;
    }
    let receipt = ctl.save_receipt(receipt);

    if json {
        println!("{}", serde_json::to_string_pretty(&receipt)?);
    } else {
        println!(
            "Saved receipt {} from {} ({} items, {})",
            short_id(&receipt.id),
            receipt.metadata.store_name,
            receipt.items.len(),
            money(receipt.metadata.total_spent)
        );
    }
    Ok(())
}

pub(crate) fn cmd_history(ctl: &Controller, limit: usize, json: bool) -> Result<()> {
    require_signed_in(ctl)?;
    let receipts: Vec<Receipt> = ctl.state().history.iter().take(limit).cloned().collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&receipts)?);
        return Ok(());
    }
    if receipts.is_empty() {
        eprintln!("No receipts yet. Use `basket scan <image>` or `basket add` to record one.");
        return Err(ExitStatus(2).into());
    }
    print_receipt_table(&receipts);
    Ok(())
}

pub(crate) fn cmd_show(ctl: &Controller, id: &str, json: bool) -> Result<()> {
    require_signed_in(ctl)?;
    let receipt = find_receipt(&ctl.state().history, id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(receipt)?);
    } else {
        print_receipt(receipt);
    }
    Ok(())
}

/// Changes applied by `basket edit` before the receipt is saved again.
#[derive(Default)]
pub(crate) struct ReceiptEdit {
    pub store: Option<String>,
    pub date: Option<String>,
    /// 1-based item number the item fields apply to
    pub item: Option<usize>,
    pub name: Option<String>,
    pub category: Option<String>,
    pub price: Option<String>,
}

impl ReceiptEdit {
    fn apply(self, mut receipt: Receipt) -> Result<Receipt> {
        if let Some(store) = self.store {
            receipt.metadata.store_name = store.trim().to_string();
        }
        if self.date.is_some() {
            receipt.metadata.date = parse_date(self.date)?.format("%Y-%m-%d").to_string();
        }

        let touches_item = self.name.is_some() || self.category.is_some() || self.price.is_some();
        match (self.item, touches_item) {
            (None, true) => bail!("--name, --category and --price need --item <N>"),
            (Some(_), false) => bail!("--item needs --name, --category or --price"),
            (None, false) => {}
            (Some(n), true) => {
                let count = receipt.items.len();
                let Some(item) = n.checked_sub(1).and_then(|i| receipt.items.get_mut(i)) else {
                    bail!("Item {n} out of range (receipt has {count} items)");
                };
                if let Some(name) = self.name {
                    item.name = name.trim().to_string();
                }
                if let Some(category) = self.category {
                    item.category = category;
                }
                if let Some(price) = self.price {
                    item.total_price = parse_amount(&price, "price")?;
                    item.unit_price = item.total_price / item.quantity;
                    // Header total follows the edited lines
                    receipt.metadata.total_spent = receipt.items_total();
                }
            }
        }
        Ok(receipt)
    }
}

pub(crate) fn cmd_edit(ctl: &mut Controller, id: &str, edit: ReceiptEdit, json: bool) -> Result<()> {
    require_signed_in(ctl)?;
    let receipt = find_receipt(&ctl.state().history, id)?.clone();
    let receipt = edit.apply(receipt)?;
    let receipt = ctl.save_receipt(receipt);

    if json {
        println!("{}", serde_json::to_string_pretty(&receipt)?);
    } else {
        println!("Updated receipt {}", short_id(&receipt.id));
        print_receipt(&receipt);
    }
    Ok(())
}
