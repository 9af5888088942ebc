use std::collections::HashMap;

use chrono::{Datelike, NaiveDate};
use serde::Serialize;

use crate::models::{Receipt, UserProfile};

#[derive(Debug, Clone, Serialize)]
pub struct CategorySpend {
    pub category: String,
    pub total: f64,
    pub share_pct: f64,
    pub item_count: usize,
}

/// Month-to-date spending against the profile budget, with a linear
/// month-end projection.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetProjection {
    /// `YYYY-MM`
    pub month: String,
    pub budget: f64,
    pub spent: f64,
    pub saved: f64,
    pub receipt_count: usize,
    pub days_elapsed: u32,
    pub days_in_month: u32,
    pub daily_average: f64,
    pub projected_total: f64,
    pub remaining: f64,
    pub percent_used: f64,
    pub on_track: bool,
    pub categories: Vec<CategorySpend>,
    pub flagged_items: usize,
    pub mismatched_items: usize,
}

#[must_use]
pub fn days_in_month(date: NaiveDate) -> u32 {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|next| next.pred_opt())
        .map_or(31, |last| last.day())
}

fn in_month(receipt: &Receipt, today: NaiveDate) -> bool {
    receipt
        .date()
        .is_some_and(|d| d.year() == today.year() && d.month() == today.month())
}

/// Sum of receipt totals dated in `today`'s calendar month.
#[must_use]
pub fn current_month_spend(history: &[Receipt], today: NaiveDate) -> f64 {
    history
        .iter()
        .filter(|r| in_month(r, today))
        .map(|r| r.metadata.total_spent)
        .sum()
}

/// Share of the monthly budget one receipt consumes, in percent.
#[must_use]
pub fn budget_impact_pct(total: f64, monthly_budget: f64) -> f64 {
    if monthly_budget <= 0.0 {
        return 0.0;
    }
    total / monthly_budget * 100.0
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn month_to_date(
    history: &[Receipt],
    profile: &UserProfile,
    today: NaiveDate,
) -> BudgetProjection {
    let receipts: Vec<&Receipt> = history.iter().filter(|r| in_month(r, today)).collect();
    let spent: f64 = receipts.iter().map(|r| r.metadata.total_spent).sum();
    let saved: f64 = receipts.iter().map(|r| r.metadata.total_saved).sum();

    let days_elapsed = today.day();
    let days_in_month = days_in_month(today);
    let daily_average = spent / f64::from(days_elapsed);
    let projected_total = daily_average * f64::from(days_in_month);
    let budget = profile.monthly_budget;

    let mut by_category: HashMap<&str, (f64, usize)> = HashMap::new();
    let mut items_total = 0.0;
    let mut flagged_items = 0;
    let mut mismatched_items = 0;
    for receipt in &receipts {
        flagged_items += receipt.analysis.flagged_items.len();
        for item in &receipt.items {
            let entry = by_category.entry(item.category.as_str()).or_insert((0.0, 0));
            entry.0 += item.total_price;
            entry.1 += 1;
            items_total += item.total_price;
            if item.has_total_mismatch() {
                mismatched_items += 1;
            }
        }
    }

    let mut categories: Vec<CategorySpend> = by_category
        .into_iter()
        .map(|(category, (total, item_count))| CategorySpend {
            category: category.to_string(),
            total,
            share_pct: if items_total > 0.0 {
                total / items_total * 100.0
            } else {
                0.0
            },
            item_count,
        })
        .collect();
    categories.sort_by(|a, b| {
        b.total
            .total_cmp(&a.total)
            .then_with(|| a.category.cmp(&b.category))
    });

    BudgetProjection {
        month: today.format("%Y-%m").to_string(),
        budget,
        spent,
        saved,
        receipt_count: receipts.len(),
        days_elapsed,
        days_in_month,
        daily_average,
        projected_total,
        remaining: budget - spent,
        percent_used: budget_impact_pct(spent, budget),
        on_track: budget <= 0.0 || projected_total <= budget,
        categories,
        flagged_items,
        mismatched_items,
    }
}
