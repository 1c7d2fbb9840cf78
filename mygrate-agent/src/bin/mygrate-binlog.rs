//! The long-running agent: follows every journal in the configured index
//! and dispatches reconstructed row-change events to the task queue until
//! signalled to stop.

use clap::Parser;
use mygrate_agent::{init_tracing, SharedArgs};
use mygrate_dispatch::{Dispatcher, RetryPolicy};
use mygrate_follower::{Follower, ShutdownFlag};
use mygrate_schema::{ConnectionParams, SchemaCatalog};
use mygrate_types::TableId;
use tracing::info;

#[derive(Parser, Debug)]
#[command(about = "Follows the MySQL binlog and dispatches row-change events to the task queue")]
struct Cli {
    #[command(flatten)]
    shared: SharedArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.shared.verbose);

    let config = cli.shared.load_config()?;

    let tracked_tables: Vec<TableId> = config
        .callbacks
        .keys()
        .map(|table| TableId::from(table.as_str()))
        .collect();

    let conn_params = ConnectionParams {
        host: config.database.host.clone(),
        port: config.database.port,
        user: config.database.user.clone(),
        password: config.database.password.clone(),
        unix_socket: config.database.unix_socket.clone(),
    };
    let catalog = SchemaCatalog::load(&conn_params, &tracked_tables).await?;

    let dispatcher = Dispatcher::connect(
        &config.queue.broker_url,
        RetryPolicy {
            max_retries: config.queue.max_retries,
            retry_delay_secs: config.queue.retry_delay,
        },
    )
    .await?;

    let shutdown = ShutdownFlag::new();
    install_signal_handlers(shutdown.clone());

    let mut follower = Follower::new(
        config.database.binlog_index.clone(),
        config.tracker.tracking_dir.clone(),
        catalog,
        dispatcher,
        shutdown,
    );

    info!("mygrate-binlog starting");
    follower
        .run(std::time::Duration::from_secs_f64(config.tracker.tracking_delay))
        .await?;
    info!("mygrate-binlog shut down cleanly");
    Ok(())
}

/// Flips the shutdown flag on either SIGINT or SIGTERM, matching the
/// original tool's `graceful_quit` handler for both signals.
fn install_signal_handlers(shutdown: ShutdownFlag) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut terminate =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        shutdown.set();
    });
}
