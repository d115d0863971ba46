use anyhow::{Context, Result};
use chrono::prelude::*;
use clap::ArgMatches;
use tracing::info;

use caixahub::display::{print_summary, print_transactions};
use caixahub::hooks::{FinancialSummary, Transactions};
use caixahub::model::{ExportFormat, TransactionFilters};
use caixahub::settings::Settings;
use caixahub::summary::DateRange;
use caixahub::Banking;

fn parse_date(value: Option<&str>) -> Result<Option<NaiveDate>> {
    value
        .map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d"))
        .transpose()
        .context("dates must be formatted as YYYY-MM-DD")
}

pub(crate) async fn print(matches: &ArgMatches, settings: Settings) -> Result<()> {
    let banking = Banking::from_settings(&settings)?;
    let transactions = Transactions::new(banking.store.clone(), banking.cache.clone());

    let filters = TransactionFilters {
        account_id: matches.value_of("account").map(str::to_string),
        search: matches.value_of("search").map(str::to_string),
        ..TransactionFilters::default()
    };
    transactions.set_filters(filters).await?;

    if let Some(page) = matches.value_of("page") {
        let page: u32 = page.parse().context("page must be a positive number")?;
        transactions.go_to_page(page).await?;
    }

    let mut out = vec![];
    print_transactions(&mut out, &transactions.transactions())?;
    println!("{}", String::from_utf8(out)?);

    let pagination = transactions.pagination();
    println!(
        "Page {} of {} ({} transactions)",
        pagination.page,
        pagination.total_pages.max(1),
        pagination.total_count
    );

    Ok(())
}

#[tracing::instrument(skip(matches, settings))]
pub(crate) async fn categorize(matches: &ArgMatches, settings: Settings) -> Result<()> {
    let category_id = matches
        .value_of("category")
        .context("a category id is required")?;
    let ids: Vec<String> = matches
        .values_of("txn_ids")
        .context("at least one transaction id is required")?
        .map(str::to_string)
        .collect();

    let banking = Banking::from_settings(&settings)?;
    let transactions = Transactions::new(banking.store.clone(), banking.cache.clone());
    let updated = transactions.bulk_categorize(&ids, category_id).await?;
    println!("Categorized {} transactions.", updated);

    Ok(())
}

pub(crate) async fn export(matches: &ArgMatches, settings: Settings) -> Result<()> {
    let path = matches.value_of("file").context("an output file is required")?;
    let format = match matches.value_of("format") {
        Some("xlsx") => ExportFormat::Xlsx,
        _ => ExportFormat::Csv,
    };

    let banking = Banking::from_settings(&settings)?;
    let transactions = Transactions::new(banking.store.clone(), banking.cache.clone());
    let bytes = transactions.export(format).await?;
    tokio::fs::write(path, &bytes)
        .await
        .with_context(|| format!("failed to write {}", path))?;
    info!("Wrote {} bytes to {}.", bytes.len(), path);

    Ok(())
}

pub(crate) async fn summary(matches: &ArgMatches, settings: Settings) -> Result<()> {
    let today = Local::now().date_naive();
    let default = DateRange::month_to_date(today);
    let range = DateRange::new(
        parse_date(matches.value_of("begin"))?.or(default.begin),
        parse_date(matches.value_of("until"))?.or(default.until),
    );

    let banking = Banking::from_settings(&settings)?;
    let transactions = Transactions::new(banking.store.clone(), banking.cache.clone());
    transactions
        .set_filters(TransactionFilters {
            start_date: range.begin,
            end_date: range.until,
            ..TransactionFilters::default()
        })
        .await?;

    let summary = FinancialSummary::new(banking.store.clone(), banking.cache.clone(), range);
    summary.load().await?;

    let mut out = vec![];
    print_summary(&mut out, &summary.summary())?;
    println!("{}", String::from_utf8(out)?);

    Ok(())
}
