use anyhow::{Context, Result};
use chrono::Local;
use std::path::Path;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use basket_core::controller::Controller;
use basket_core::export::write_history_csv;
use basket_core::insights::month_to_date;

use super::helpers::{ExitStatus, money, require_signed_in};

pub(crate) fn cmd_insights(ctl: &Controller, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct CategoryRow {
        #[tabled(rename = "Category")]
        category: String,
        #[tabled(rename = "Items")]
        items: usize,
        #[tabled(rename = "Total")]
        total: String,
        #[tabled(rename = "Share")]
        share: String,
    }

    require_signed_in(ctl)?;
    let state = ctl.state();
    let today = Local::now().date_naive();
    let p = month_to_date(&state.history, &state.profile, today);

    if json {
        println!("{}", serde_json::to_string_pretty(&p)?);
        return Ok(());
    }

    if p.receipt_count == 0 {
        eprintln!("No receipts for {} yet", p.month);
        return Err(ExitStatus(2).into());
    }

    println!("=== {} ({} receipts) ===\n", p.month, p.receipt_count);
    println!(
        "  SPENT: {} of {} ({:.0}%) | REMAINING: {}",
        money(p.spent),
        money(p.budget),
        p.percent_used,
        money(p.remaining)
    );
    println!(
        "  DAILY AVG: {} over {} of {} days | PROJECTED: {} {}",
        money(p.daily_average),
        p.days_elapsed,
        p.days_in_month,
        money(p.projected_total),
        if p.on_track { "(on track)" } else { "(over budget pace)" }
    );
    println!("  SAVED: {}", money(p.saved));
    if p.flagged_items > 0 {
        println!("  FLAGGED ITEMS: {}", p.flagged_items);
    }
    if p.mismatched_items > 0 {
        println!("  PRICE MISMATCHES: {}", p.mismatched_items);
    }
    println!();

    let rows: Vec<CategoryRow> = p
        .categories
        .iter()
        .map(|c| CategoryRow {
            category: c.category.clone(),
            items: c.item_count,
            total: money(c.total),
            share: format!("{:.0}%", c.share_pct),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..4)).with(Alignment::right()))
        .to_string();
    println!("{table}");

    Ok(())
}

pub(crate) fn cmd_export_csv(ctl: &Controller, output: Option<&Path>) -> Result<()> {
    require_signed_in(ctl)?;
    let history = &ctl.state().history;
    let rows = match output {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            let rows = write_history_csv(history, file)?;
            eprintln!("Wrote {rows} item rows to {}", path.display());
            rows
        }
        None => write_history_csv(history, std::io::stdout().lock())?,
    };
    if rows == 0 {
        eprintln!("No receipt items to export");
        return Err(ExitStatus(2).into());
    }
    Ok(())
}
