use anyhow::{Context, Result, anyhow, bail};
use chrono::{Local, NaiveDate};
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use basket_core::controller::{Controller, SessionError};
use basket_core::models::{Item, Receipt};

/// Non-zero exit after the command has printed its own message. `main`
/// exits with the code once pending pushes have been flushed.
#[derive(Debug, thiserror::Error)]
#[error("exit status {0}")]
pub(crate) struct ExitStatus(pub(crate) i32);

/// Attach the stable error code to a controller failure.
pub(crate) fn session_err(err: SessionError) -> anyhow::Error {
    anyhow!("{err} [{}]", err.code())
}

pub(crate) fn require_signed_in(ctl: &Controller) -> Result<()> {
    if ctl.state().profile.has_identity() {
        Ok(())
    } else {
        bail!("Not signed in. Use `basket signin <email>` or `basket signup`")
    }
}

pub(crate) fn parse_date(date_str: Option<String>) -> Result<NaiveDate> {
    match date_str {
        None => Ok(Local::now().date_naive()),
        Some(s) => match s.as_str() {
            "today" => Ok(Local::now().date_naive()),
            "yesterday" => Ok(Local::now().date_naive() - chrono::Duration::days(1)),
            _ => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .with_context(|| format!("Invalid date '{s}'. Use YYYY-MM-DD or today/yesterday")),
        },
    }
}

pub(crate) fn parse_amount(s: &str, what: &str) -> Result<f64> {
    let value: f64 = s
        .trim()
        .trim_start_matches('$')
        .parse()
        .with_context(|| format!("Invalid {what}: '{s}'"))?;
    if !value.is_finite() || value < 0.0 {
        bail!("{what} must be 0 or more");
    }
    Ok(value)
}

/// Parse `NAME:PRICE[:QTY[:CATEGORY]]`, where PRICE is the line total.
pub(crate) fn parse_item_spec(spec: &str) -> Result<Item> {
    let parts: Vec<&str> = spec.splitn(4, ':').map(str::trim).collect();
    if parts.len() < 2 || parts[0].is_empty() {
        bail!("Invalid item '{spec}'. Use NAME:PRICE[:QTY[:CATEGORY]] (e.g. 'Bananas:1.20:2:Produce')");
    }
    let total_price = parse_amount(parts[1], "price")?;
    let quantity = match parts.get(2).filter(|q| !q.is_empty()) {
        Some(q) => {
            let q: f64 = q
                .parse()
                .with_context(|| format!("Invalid quantity '{q}' in '{spec}'"))?;
            if q <= 0.0 {
                bail!("Quantity must be greater than 0");
            }
            q
        }
        None => 1.0,
    };
    Ok(Item {
        raw_name: parts[0].to_string(),
        name: parts[0].to_string(),
        category: parts.get(3).map(|c| (*c).to_string()).unwrap_or_default(),
        quantity,
        unit_price: total_price / quantity,
        total_price,
        ..Item::default()
    })
}

/// Look a receipt up by id or unambiguous id prefix.
pub(crate) fn find_receipt<'a>(history: &'a [Receipt], id: &str) -> Result<&'a Receipt> {
    let id = id.trim();
    if id.is_empty() {
        bail!("Receipt id is empty");
    }
    if let Some(exact) = history.iter().find(|r| r.id == id) {
        return Ok(exact);
    }
    let matches: Vec<&Receipt> = history.iter().filter(|r| r.id.starts_with(id)).collect();
    match matches.as_slice() {
        [one] => Ok(one),
        [] => bail!("No receipt with id '{id}'"),
        _ => bail!("Receipt id '{id}' is ambiguous ({} matches)", matches.len()),
    }
}

pub(crate) fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

pub(crate) fn no_neg_zero(v: f64) -> f64 {
    if v == 0.0 { 0.0 } else { v }
}

pub(crate) fn money(v: f64) -> String {
    format!("{:.2}", no_neg_zero(v))
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}

pub(crate) fn print_receipt_table(receipts: &[Receipt]) {
    #[derive(Tabled)]
    struct ReceiptRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Date")]
        date: String,
        #[tabled(rename = "Store")]
        store: String,
        #[tabled(rename = "Items")]
        items: usize,
        #[tabled(rename = "Total")]
        total: String,
        #[tabled(rename = "Saved")]
        saved: String,
        #[tabled(rename = "Flags")]
        flags: String,
    }

    let rows: Vec<ReceiptRow> = receipts
        .iter()
        .map(|r| {
            let mut flags = Vec::new();
            if !r.analysis.flagged_items.is_empty() {
                flags.push(format!("{} flagged", r.analysis.flagged_items.len()));
            }
            let mismatched = r.mismatched_items().len();
            if mismatched > 0 {
                flags.push(format!("{mismatched} price mismatch"));
            }
            ReceiptRow {
                id: short_id(&r.id),
                date: r.metadata.date.clone(),
                store: truncate(&r.metadata.store_name, 28),
                items: r.items.len(),
                total: money(r.metadata.total_spent),
                saved: money(r.metadata.total_saved),
                flags: flags.join(", "),
            }
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(3..6)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn print_item_table(items: &[Item]) {
    #[derive(Tabled)]
    struct ItemRow {
        #[tabled(rename = "#")]
        idx: usize,
        #[tabled(rename = "Item")]
        name: String,
        #[tabled(rename = "Category")]
        category: String,
        #[tabled(rename = "Qty")]
        quantity: String,
        #[tabled(rename = "Unit")]
        unit: String,
        #[tabled(rename = "Total")]
        total: String,
        #[tabled(rename = "Note")]
        note: String,
    }

    let rows: Vec<ItemRow> = items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let mut notes = Vec::new();
            if item.is_discounted {
                notes.push("discount");
            }
            if item.has_total_mismatch() {
                notes.push("price mismatch");
            }
            ItemRow {
                idx: i + 1,
                name: truncate(item.display_name(), 32),
                category: item.category.clone(),
                quantity: format!("{}", no_neg_zero(item.quantity)),
                unit: money(item.unit_price),
                total: money(item.total_price),
                note: notes.join(", "),
            }
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(3..6)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}
