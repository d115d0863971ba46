use std::collections::HashMap;

use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::model::{Account, Category, Transaction};

const TOP_CATEGORIES: usize = 5;
const UNCATEGORIZED: &str = "Sem categoria";

/// Inclusive date window. Open ends are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct DateRange {
    pub begin: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(begin: Option<NaiveDate>, until: Option<NaiveDate>) -> Self {
        Self { begin, until }
    }

    /// From the first day of `today`'s month up to `today`.
    pub fn month_to_date(today: NaiveDate) -> Self {
        Self {
            begin: today.with_day(1),
            until: Some(today),
        }
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.begin.map_or(true, |b| day >= b) && self.until.map_or(true, |u| day <= u)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryTotal {
    pub category_id: Option<String>,
    pub name: String,
    pub total: Decimal,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total_balance: Decimal,
    pub credit_card_debt: Decimal,
    pub income: Decimal,
    pub expenses: Decimal,
    pub net: Decimal,
    pub transaction_count: usize,
    pub top_categories: Vec<CategoryTotal>,
}

pub fn summarize(
    accounts: &[Account],
    transactions: &[Transaction],
    categories: &[Category],
    range: &DateRange,
) -> Summary {
    let mut summary = Summary::default();

    for account in accounts.iter().filter(|a| a.is_active) {
        if account.is_credit_card() {
            summary.credit_card_debt += account.display_balance();
        } else {
            summary.total_balance += account.balance;
        }
    }

    let names: HashMap<&str, &str> = categories
        .iter()
        .map(|c| (c.id.as_str(), c.name.as_str()))
        .collect();
    let mut by_category: HashMap<Option<&str>, CategoryTotal> = HashMap::new();

    for txn in transactions.iter().filter(|t| range.contains(t.day())) {
        summary.transaction_count += 1;
        let amount = txn.amount.abs();

        if txn.is_income() {
            summary.income += amount;
            continue;
        }

        summary.expenses += amount;
        let key = txn.category.as_deref();
        let entry = by_category.entry(key).or_insert_with(|| CategoryTotal {
            category_id: key.map(str::to_string),
            name: key
                .and_then(|id| names.get(id).copied())
                .or(txn.category_name.as_deref())
                .unwrap_or(UNCATEGORIZED)
                .to_string(),
            total: Decimal::ZERO,
            count: 0,
        });
        entry.total += amount;
        entry.count += 1;
    }

    summary.net = summary.income - summary.expenses;

    let mut top: Vec<CategoryTotal> = by_category.into_values().collect();
    top.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.name.cmp(&b.name)));
    top.truncate(TOP_CATEGORIES);
    summary.top_categories = top;

    summary
}
