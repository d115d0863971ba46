mod accounts;
mod link;
mod txn;

use anyhow::Result;
use clap::{arg, Command};
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use caixahub::settings::Settings;
use caixahub::CLIENT_NAME;

async fn run() -> Result<()> {
    let app = Command::new(CLIENT_NAME)
        .about("The caixahub utility connects bank accounts through Pluggy Connect \
         and keeps their accounts and transactions in sync with the CaixaHub backend.")
        .version("0.1.0")
        .subcommand_required(true)
        .allow_external_subcommands(false)
        .arg(arg!(CONFIG: -c --config [FILE] "Sets a custom config file"))
        .arg(arg!(verbose: -v --verbose "Sets the level of verbosity"))
        .subcommand(Command::new("connect")
            .about("Connects a new bank account.")
            .arg(arg!(update: -u --update [ITEM_ID] "Repairs an existing item instead of creating a new one.")))
        .subcommand(Command::new("items")
            .about("Displays all connected items and their status.")
            .subcommand(Command::new("delete")
                .about("Disconnects an item and its accounts.")
                .arg(arg!(item_id: <ITEM_ID> "The id of the item to disconnect.")))
            .subcommand(Command::new("status")
                .about("Reloads a single item from the backend.")
                .arg(arg!(item_id: <ITEM_ID> "The id of the item to reload."))))
        .subcommand(Command::new("mfa")
            .subcommand_required(true)
            .about("Multi-factor authentication helpers.")
            .subcommand(Command::new("watch")
                .about("Waits for an item to ask for MFA and counts down its session.")))
        .subcommand(Command::new("accounts")
            .about("Prints connected accounts to stdout.")
            .subcommand(Command::new("disconnect")
                .about("Disconnects a single account.")
                .arg(arg!(account_id: <ACCOUNT_ID> "The account to disconnect."))))
        .subcommand(Command::new("sync")
            .about("Pulls the latest balance and transactions of an account.")
            .arg(arg!(account_id: <ACCOUNT_ID> "The account to sync.")))
        .subcommand(Command::new("transactions")
            .about("Prints a page of transactions.")
            .arg(arg!(account: --account [ID] "Only transactions of this account."))
            .arg(arg!(page: --page [N] "The page to print, starting at 1."))
            .arg(arg!(search: --search [TEXT] "Free text search over descriptions.")))
        .subcommand(Command::new("categorize")
            .about("Assigns a category to several transactions at once.")
            .arg(arg!(category: --category <ID> "The category to assign."))
            .arg(arg!(txn_ids: <TXN_ID> ... "The transactions to categorize.")))
        .subcommand(Command::new("export")
            .about("Exports transactions to a file.")
            .arg(arg!(format: --format [FORMAT] "Either csv or xlsx, defaults to csv.")
                .possible_values(["csv", "xlsx"]))
            .arg(arg!(file: <FILE> "Where to write the export.")))
        .subcommand(Command::new("summary")
            .about("Prints balances, income and expenses for a period.")
            .arg(arg!(begin: --begin [DATE] "The first day of the period, defaults to the start of this month."))
            .arg(arg!(until: --until [DATE] "The last day of the period, defaults to today.")));

    let matches = app.get_matches();
    if matches.is_present("verbose") {
        tracing_subscriber::registry()
            .with(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let settings = Settings::new(matches.value_of("CONFIG"))?;
    match matches.subcommand() {
        Some(("connect", connect_matches)) => link::connect(connect_matches, settings).await?,
        Some(("items", items_matches)) => link::items(items_matches, settings).await?,
        Some(("mfa", mfa_matches)) => link::mfa(mfa_matches, settings).await?,
        Some(("accounts", accounts_matches)) => match accounts_matches.subcommand() {
            Some(("disconnect", disconnect_matches)) => {
                accounts::disconnect(disconnect_matches, settings).await?
            }
            _ => accounts::print(settings).await?,
        },
        Some(("sync", sync_matches)) => accounts::sync(sync_matches, settings).await?,
        Some(("transactions", txn_matches)) => txn::print(txn_matches, settings).await?,
        Some(("categorize", txn_matches)) => txn::categorize(txn_matches, settings).await?,
        Some(("export", txn_matches)) => txn::export(txn_matches, settings).await?,
        Some(("summary", txn_matches)) => txn::summary(txn_matches, settings).await?,
        None => unreachable!("subcommand is required"),
        _ => unreachable!(),
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        println!("{}", err);
        std::process::exit(1);
    }
}
