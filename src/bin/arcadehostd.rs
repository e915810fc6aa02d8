use std::collections::HashSet;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::Parser;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use arcadehost::catalog::Catalog;
use arcadehost::config::{Cli, Config};
use arcadehost::dispatch::Platform;
use arcadehost::identity::IdentityStore;
use arcadehost::package::PackageStore;
use arcadehost::platform::run_control_plane;
use arcadehost::reviews::ReviewStore;
use arcadehost::rooms::registry::RoomRegistry;
use arcadehost::rooms::report::{run_heartbeat_watchdog, run_report_listener};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    let config = match Config::load(cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(1);
        }
    };

    if let Err(err) = run(config).await {
        log::error!("fatal startup error: {err}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.data_dir.join("arcadehost.db");
    let connect_options = SqliteConnectOptions::new().filename(&db_path).create_if_missing(true);
    let pool = SqlitePoolOptions::new().max_connections(8).connect_with(connect_options).await?;

    let identity = IdentityStore::new(pool.clone()).await?;
    let catalog = Catalog::new(pool.clone()).await?;
    let reviews = ReviewStore::new(pool).await?;
    let packages = PackageStore::new(config.data_dir.join("packages")).await?;
    let rooms = Arc::new(RoomRegistry::new());
    let reserved_ports = Arc::new(Mutex::new(HashSet::new()));

    let report_bind = config.report_bind.clone();
    let control_bind = config.bind.clone();

    let platform = Arc::new(Platform {
        identity,
        catalog,
        reviews,
        packages,
        rooms: rooms.clone(),
        reserved_ports: reserved_ports.clone(),
        config,
    });

    log::info!("starting arcadehostd: control={control_bind} report={report_bind}");

    let report_task = tokio::spawn(run_report_listener(report_bind, rooms.clone(), reserved_ports.clone()));
    let watchdog_task = tokio::spawn(run_heartbeat_watchdog(rooms, reserved_ports));

    tokio::select! {
        result = run_control_plane(&control_bind, platform) => result?,
        result = report_task => result??,
        _ = watchdog_task => {}
    }

    Ok(())
}
