//! Binary entrypoint: loads configuration, opens the store, wires the
//! listener supervisor and sync engine together, and runs until a shutdown
//! signal or `SIGHUP` reload request arrives.

use std::sync::Arc;

use lis_ingest::config::{self, Config, SyncFrequency};
use lis_ingest::events::EventBus;
use lis_ingest::listener::Supervisor;
use lis_ingest::mapper::{FieldMap, FieldMapRegistry};
use lis_ingest::persistence::Store;
use lis_ingest::sync::SyncEngine;
use tokio::sync::{mpsc, watch};

/// Worked examples of the override mechanism, not a vendor allowlist: every
/// analyzer family we've actually seen a wire dump from already matches
/// `FieldMap::default_astm`/`default_hl7`, so these two entries are
/// identical to the defaults today. They exist so a deviating analyzer can
/// be added here (or, for a one-off deployment, via `field_map_id` in the
/// config file) instead of a new hardcoded parser.
fn build_field_map_registry() -> FieldMapRegistry {
    let mut registry = FieldMapRegistry::new();
    registry.register_astm("autoquant-meril", FieldMap::default_astm());
    registry.register_hl7("bf-6900", FieldMap::default_hl7());
    registry
}

fn parse_config_flag(args: &[String]) -> Option<String> {
    args.iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .cloned()
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let config_path = Config::resolve_path(parse_config_flag(&args).as_deref());

    let config = match Config::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            log::error!("failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    log::info!(
        "starting {} (instance_id={}) with {} listener(s)",
        config.app_name,
        config.instance_id,
        config.listeners.len()
    );

    let store = match Store::connect(&config.database.path).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            log::error!("failed to open database at {}: {e}", config.database.path);
            std::process::exit(1);
        }
    };

    let events = EventBus::new(config.observer_channel_capacity());
    let field_map_registry = Arc::new(build_field_map_registry());

    let (realtime_wake_tx, realtime_wake_rx) = mpsc::unbounded_channel();
    let realtime_wake = if config.external_server.enabled
        && config.external_server.sync_frequency == SyncFrequency::Realtime
    {
        Some(realtime_wake_tx)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut supervisor = Supervisor::new(
        store.clone(),
        events.clone(),
        field_map_registry,
        realtime_wake,
    );
    supervisor.start_all(config.listeners.clone()).await;

    let sync_task = if config.external_server.enabled {
        let engine = Arc::new(SyncEngine::new(
            config.external_server.clone(),
            config.instance_id.clone(),
            store.clone(),
            events.clone(),
        ));
        let shutdown_rx = shutdown_rx.clone();
        Some(match config.external_server.sync_frequency {
            SyncFrequency::Realtime => {
                tokio::spawn(engine.run_realtime(realtime_wake_rx, shutdown_rx))
            }
            SyncFrequency::Scheduled => {
                let interval = config.external_server.interval_seconds.unwrap_or(60);
                tokio::spawn(engine.run_interval(interval, shutdown_rx))
            }
            SyncFrequency::Cron => {
                let schedule = config
                    .external_server
                    .cron_schedule
                    .as_deref()
                    .unwrap_or("0 * * * * *")
                    .parse()
                    .expect("validated at config load time");
                tokio::spawn(engine.run_cron(schedule, shutdown_rx))
            }
        })
    } else {
        drop(realtime_wake_rx);
        None
    };

    #[cfg(unix)]
    let mut reload_rx = config::watch_for_reload(config_path.clone());

    loop {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = terminate_signal() => break,
                Some(new_config) = reload_rx.recv() => {
                    supervisor.reload(new_config.listeners).await;
                    continue;
                }
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                break;
            }
        }
    }

    log::info!("shutdown requested, draining listeners and in-flight sync work");
    let _ = shutdown_tx.send(true);
    supervisor.stop_all().await;

    if let Some(task) = sync_task {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(30), task).await;
    }

    log::info!("shutdown complete");
}

#[cfg(unix)]
async fn terminate_signal() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut signal) => {
            signal.recv().await;
        }
        Err(e) => {
            log::error!("failed to install SIGTERM handler: {e}");
            std::future::pending::<()>().await;
        }
    }
}
