use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use parlor_execution::{
    ChannelNotifier, Document, Mediator, Memory, Registrar, RoundController, Store, SystemClock,
};
use parlor_types::{GameKind, Key, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

mod api;
mod bots;
mod config;

use api::{AppState, OutboundEvent, RoundView};
use config::{Config, ValidatedConfig};

fn print_dry_run_report(config: &ValidatedConfig) {
    println!("dry-run report");
    println!("  listen: {}", config.listen);
    println!("  log_level: {}", config.log_level);
    println!(
        "  actors: {} tick={:?} max_jitter={:?}",
        config.actors, config.tick, config.max_jitter
    );
    println!(
        "  transactions: max_attempts={} refund_attempts={}",
        config.max_attempts, config.refund_attempts
    );
    println!("  starting_balance: {}", config.starting_balance);
    for (game, settings) in &config.games {
        println!(
            "  {game}: betting={}ms resolving={}ms result={}ms max_resolving={}ms bets={}..={} max_per_round={}",
            settings.phases.betting_ms,
            settings.phases.resolving_ms,
            settings.phases.result_ms,
            settings.phases.max_resolving_ms,
            settings.limits.min_bet,
            settings.limits.max_bet,
            settings.limits.max_bets_per_round,
        );
    }
    println!(
        "  bots: count={} interval={:?} max_stake={}",
        config.bots.count, config.bots.interval, config.bots.max_stake
    );
}

fn load_config(path: Option<&String>) -> anyhow::Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Could not read config file {path}"))?;
    serde_yaml::from_str(&contents).context("Could not parse config file")
}

/// Re-publish every committed round document to connected clients.
fn forward_rounds(
    store: Arc<Memory>,
    game: GameKind,
    broadcaster: broadcast::Sender<OutboundEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<JoinHandle<()>> {
    let mut updates = store
        .subscribe(&Key::Round(game))
        .with_context(|| format!("Could not subscribe to {game} rounds"))?;
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
            let record = match &*updates.borrow_and_update() {
                Some(Document {
                    value: Value::Round(record),
                    ..
                }) => record.clone(),
                _ => continue,
            };
            // No receivers just means no clients are connected.
            let _ = broadcaster.send(OutboundEvent::Round {
                payload: RoundView::from(&record),
            });
        }
        debug!(%game, "round forwarder stopped");
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Command::new("parlor-live-table")
        .about("Runs parlor rounds and serves them to clients.")
        .arg(
            Arg::new("config")
                .long("config")
                .required(false)
                .help("YAML config file; built-in defaults apply when omitted"),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .help("Validate the config and exit without serving")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let config = load_config(matches.get_one::<String>("config"))?
        .validate()
        .context("Invalid config")?;
    if matches.get_flag("dry-run") {
        print_dry_run_report(&config);
        println!("config ok");
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .init();

    let store = Arc::new(Memory::new());
    let (broadcaster, _) = broadcast::channel::<OutboundEvent>(config.broadcast_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    // Payout notices only come from the actor whose settlement committed.
    let (notifier, mut notices) = ChannelNotifier::new();
    let notice_broadcaster = broadcaster.clone();
    tasks.push(tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            let _ = notice_broadcaster.send(OutboundEvent::from(notice));
        }
    }));

    for game in GameKind::ALL {
        tasks.push(forward_rounds(
            store.clone(),
            game,
            broadcaster.clone(),
            shutdown_rx.clone(),
        )?);
    }

    for actor in 0..config.actors {
        for game in GameKind::ALL {
            let mut controller = RoundController::new(
                format!("actor-{actor}"),
                store.clone(),
                SystemClock,
                notifier.clone(),
            )
            .with_mediator(Mediator::new(config.max_jitter))
            .with_max_attempts(config.max_attempts);
            if let Some(settings) = config.games.get(&game) {
                controller = controller.with_schedule(game, settings.phases);
            }
            tasks.push(tokio::spawn(controller.run(
                game,
                config.tick,
                shutdown_rx.clone(),
            )));
        }
    }
    drop(notifier);
    info!(actors = config.actors, games = GameKind::ALL.len(), "round controllers started");

    let mut registrar = Registrar::new(store.clone(), SystemClock)
        .with_max_attempts(config.max_attempts)
        .with_refund_attempts(config.refund_attempts);
    for (game, settings) in &config.games {
        registrar = registrar.with_limits(*game, settings.limits);
    }
    let registrar = Arc::new(registrar);

    if config.bots.count > 0 {
        tasks.push(tokio::spawn(bots::run(
            store.clone(),
            registrar.clone(),
            config.bots.clone(),
            config.starting_balance,
            shutdown_rx.clone(),
        )));
    }

    let state = AppState {
        store,
        registrar,
        broadcaster,
        starting_balance: config.starting_balance,
    };
    let app = api::router(state);

    let addr = config.listen;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Could not bind {addr}"))?;
    info!(%addr, "live table service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(?err, "failed to listen for shutdown signal");
            }
            info!("shutting down");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    for task in tasks {
        // The notice forwarder ends once every controller has dropped its notifier.
        if let Err(err) = task.await {
            warn!(?err, "task ended abnormally");
        }
    }
    Ok(())
}
