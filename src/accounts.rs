use anyhow::{bail, Context, Result};
use clap::ArgMatches;

use caixahub::display::print_accounts;
use caixahub::hooks::BankAccounts;
use caixahub::settings::Settings;
use caixahub::store::SyncOutcome;
use caixahub::Banking;

pub(crate) async fn print(settings: Settings) -> Result<()> {
    let banking = Banking::from_settings(&settings)?;
    let accounts = BankAccounts::new(banking.store.clone(), banking.cache.clone());
    accounts.load().await?;

    let sync_errors = banking.store.read(|s| s.sync_errors.clone());
    let mut out = vec![];
    print_accounts(&mut out, &accounts.accounts(), &sync_errors)?;
    println!("{}", String::from_utf8(out)?);

    Ok(())
}

#[tracing::instrument(skip(matches, settings))]
pub(crate) async fn sync(matches: &ArgMatches, settings: Settings) -> Result<()> {
    let account_id = matches
        .value_of("account_id")
        .context("an account id is required")?;
    let banking = Banking::from_settings(&settings)?;
    let accounts = BankAccounts::new(banking.store.clone(), banking.cache.clone());
    accounts.load().await?;

    match accounts.sync(account_id).await? {
        SyncOutcome::Synced { transactions } => {
            println!("Synced {} new transactions.", transactions);
        }
        SyncOutcome::ReconnectRequired { item_id } => {
            let message = accounts
                .sync_error(account_id)
                .map(|e| e.message)
                .unwrap_or_default();
            match item_id {
                Some(item_id) => bail!(
                    "{} Run `caixahub connect --update {}` to reconnect.",
                    message,
                    item_id
                ),
                None => bail!("{}", message),
            }
        }
    }

    Ok(())
}

pub(crate) async fn disconnect(matches: &ArgMatches, settings: Settings) -> Result<()> {
    let account_id = matches
        .value_of("account_id")
        .context("an account id is required")?;
    let banking = Banking::from_settings(&settings)?;
    let accounts = BankAccounts::new(banking.store.clone(), banking.cache.clone());
    accounts.load().await?;

    accounts.disconnect(account_id).await?;
    println!("Disconnected account {}.", account_id);

    Ok(())
}
