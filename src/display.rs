use std::io::{self, Write};

use rust_decimal::Decimal;
use rusty_money::{iso, Formatter, Money, Params, Position};
use tabwriter::TabWriter;

use crate::model::{Account, Item, Transaction};
use crate::store::SyncError;
use crate::summary::Summary;

/// Formats an amount the Brazilian way, e.g. `R$ 1.234,56`.
///
/// rusty-money ships BRL with the en-US locale, so the separators are set
/// explicitly instead of relying on `Money`'s `Display`.
pub fn format_brl(amount: Decimal) -> String {
    let mut amount = amount.round_dp(iso::BRL.exponent);
    amount.rescale(iso::BRL.exponent);

    Formatter::money(
        &Money::from_decimal(amount, iso::BRL),
        Params {
            digit_separator: '.',
            exponent_separator: ',',
            positions: vec![Position::Sign, Position::Symbol, Position::Space, Position::Amount],
            symbol: Some(iso::BRL.symbol),
            ..Params::default()
        },
    )
}

pub fn print_accounts<T: Write>(wr: T, accounts: &[Account], sync_errors: &[SyncError]) -> io::Result<()> {
    let mut tw = TabWriter::new(wr);
    writeln!(tw, "Institution\tAccount\tAccount ID\tNumber\tBalance\tStatus")?;

    for account in accounts.iter() {
        let status = match sync_errors.iter().find(|e| e.account_id == account.id) {
            Some(err) if err.requires_reconnect => "reconnect required",
            Some(_) => "sync failed",
            None if !account.is_active => "inactive",
            None => "ok",
        };
        writeln!(
            tw,
            "{}\t{}\t{}\t{}\t{}\t{}",
            account.institution_name.as_deref().unwrap_or("-"),
            account.display_name(),
            account.id,
            account.masked_number().unwrap_or_default(),
            format_brl(account.display_balance()),
            status,
        )?;
    }

    tw.flush()
}

pub fn print_items<T: Write>(wr: T, items: &[Item]) -> io::Result<()> {
    let mut tw = TabWriter::new(wr);
    writeln!(tw, "Institution\tItem ID\tStatus\tLast Update")?;

    for item in items.iter() {
        writeln!(
            tw,
            "{}\t{}\t{}\t{}",
            item.institution_name(),
            item.id,
            item.status.label(),
            item.last_successful_update
                .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string()),
        )?;
    }

    tw.flush()
}

pub fn print_transactions<T: Write>(wr: T, transactions: &[Transaction]) -> io::Result<()> {
    let mut tw = TabWriter::new(wr);
    writeln!(tw, "Date\tDescription\tCategory\tAmount\tTransaction ID")?;

    for txn in transactions.iter() {
        writeln!(
            tw,
            "{}\t{}\t{}\t{}\t{}",
            txn.day(),
            txn.merchant_name.as_deref().unwrap_or(&txn.description),
            txn.category_name.as_deref().unwrap_or("-"),
            format_brl(txn.amount),
            txn.id,
        )?;
    }

    tw.flush()
}

pub fn print_summary<T: Write>(wr: T, summary: &Summary) -> io::Result<()> {
    let mut tw = TabWriter::new(wr);
    writeln!(tw, "Saldo total\t{}", format_brl(summary.total_balance))?;
    writeln!(tw, "Fatura de cartões\t{}", format_brl(summary.credit_card_debt))?;
    writeln!(tw, "Receitas\t{}", format_brl(summary.income))?;
    writeln!(tw, "Despesas\t{}", format_brl(summary.expenses))?;
    writeln!(tw, "Resultado\t{}", format_brl(summary.net))?;

    if !summary.top_categories.is_empty() {
        writeln!(tw)?;
        for category in summary.top_categories.iter() {
            writeln!(
                tw,
                "{}\t{}\t({})",
                category.name,
                format_brl(category.total),
                category.count
            )?;
        }
    }

    tw.flush()
}
