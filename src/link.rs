use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ArgMatches;
use pluggy_connect::{BrowserWidget, SdkLoader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::info;

use caixahub::connect::{ConnectAttempt, ConnectOptions, ConnectParams, PluggyConnect};
use caixahub::display::print_items;
use caixahub::hooks::BankConnections;
use caixahub::mfa::{MfaCallbacks, MfaConfig, MfaPhase, MfaTracker};
use caixahub::settings::Settings;
use caixahub::Banking;

async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("signal received, shutting down");
}

pub(crate) async fn connect(matches: &ArgMatches, settings: Settings) -> Result<()> {
    let banking = Banking::from_settings(&settings)?;
    let connections = BankConnections::new(banking.store.clone(), banking.cache.clone());

    let loader = Arc::new(SdkLoader::new(settings.connect.sdk_url.clone()));
    let widget = Arc::new(BrowserWidget::new(
        loader,
        settings.connect.listen,
        Duration::from_secs(settings.connect.session_timeout_secs),
    ));

    let options = ConnectOptions {
        locale: settings.connect.locale.clone(),
        theme: settings.connect.theme.clone(),
        ..ConnectOptions::default()
    }
    .on_success(|item_id| println!("Connected item {}.", item_id))
    .on_error(|message| println!("{}", message));
    let connect = PluggyConnect::new(
        banking.api.clone(),
        widget.clone(),
        banking.notifier.clone(),
        connections.connect_options(options),
    );

    let attempt = match matches.value_of("update") {
        Some(item_id) => connect.update_connection(item_id).await?,
        None => connect.open_connect(ConnectParams::default()).await?,
    };
    if attempt == ConnectAttempt::AlreadyInProgress {
        return Ok(());
    }

    if let Some(url) = widget.session_url() {
        println!("Visit {} to connect your bank account.", url);
    }

    tokio::select! {
        _ = connect.wait() => {},
        _ = shutdown_signal() => connect.close_connect().await,
    }

    connections.load().await?;
    let mut out = vec![];
    print_items(&mut out, &connections.items())?;
    println!("{}", String::from_utf8(out)?);

    Ok(())
}

pub(crate) async fn items(matches: &ArgMatches, settings: Settings) -> Result<()> {
    let banking = Banking::from_settings(&settings)?;
    let connections = BankConnections::new(banking.store.clone(), banking.cache.clone());
    connections.load().await?;

    match matches.subcommand() {
        Some(("delete", delete_matches)) => {
            let item_id = delete_matches
                .value_of("item_id")
                .context("an item id is required")?;
            connections.disconnect(item_id).await?;
            println!("Disconnected item {}.", item_id);
        }
        Some(("status", status_matches)) => {
            let item_id = status_matches
                .value_of("item_id")
                .context("an item id is required")?;
            let item = connections.refresh_item(item_id).await?;
            let mut out = vec![];
            print_items(&mut out, &[item])?;
            println!("{}", String::from_utf8(out)?);
        }
        _ => {
            let mut out = vec![];
            print_items(&mut out, &connections.items())?;
            println!("{}", String::from_utf8(out)?);
        }
    }

    Ok(())
}

pub(crate) async fn mfa(matches: &ArgMatches, settings: Settings) -> Result<()> {
    match matches.subcommand() {
        Some(("watch", _)) => watch(settings).await,
        _ => unreachable!("subcommand is required"),
    }
}

async fn watch(settings: Settings) -> Result<()> {
    let banking = Banking::from_settings(&settings)?;
    let (expired_tx, mut expired_rx) = mpsc::unbounded_channel();

    let callbacks = MfaCallbacks::default()
        .on_warning(|status| {
            println!(
                "{} left to finish authenticating with {}.",
                status.formatted_time,
                status.institution_name.as_deref().unwrap_or("your bank")
            )
        })
        .on_timeout(move |item_id| {
            let _ = expired_tx.send(item_id.to_string());
        });
    let tracker = MfaTracker::new(
        banking.api.clone(),
        banking.notifier.clone(),
        MfaConfig::from(&settings.mfa),
        callbacks,
    );

    tracker.mount();
    let mut status = tracker.subscribe();
    println!("Watching for items waiting on MFA, press Ctrl+C to stop.");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut last_phase = MfaPhase::Idle;

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow().clone();
                match (last_phase, current.phase) {
                    (MfaPhase::Idle, MfaPhase::Idle) => {}
                    (_, MfaPhase::Idle) => println!("MFA session ended."),
                    (MfaPhase::Idle, _) => println!(
                        "{} is waiting for you to authenticate ({} left).",
                        current.institution_name.as_deref().unwrap_or("your bank"),
                        current.formatted_time
                    ),
                    _ => {}
                }
                last_phase = current.phase;
            }
            Some(item_id) = expired_rx.recv() => {
                println!(
                    "The MFA session for item {} expired. Run `caixahub connect --update {}` to reconnect.",
                    item_id, item_id
                );
            }
            _ = &mut shutdown => break,
        }
    }

    tracker.unmount();
    Ok(())
}
