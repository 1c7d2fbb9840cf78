//! Bulk-imports one or more tables by replaying every existing row through
//! the callback registry as a synthetic `INSERT`.

use std::sync::Arc;

use clap::Parser;
use mygrate_agent::{init_tracing, NullCallbackFactory, SharedArgs};
use mygrate_callbacks::CallbackRegistry;
use mygrate_dispatch::LoggedErrorHandler;
use mygrate_importer::import_tables;
use mygrate_schema::ConnectionParams;
use mygrate_types::TableId;

#[derive(Parser, Debug)]
#[command(about = "Imports existing rows of one or more tables as synthetic INSERT events")]
struct Cli {
    /// Use a server-side streaming cursor instead of buffering the full
    /// result set client-side.
    #[arg(short, long)]
    stream: bool,

    /// `db.table` identifiers to import. Empty means every table with a
    /// registered callback binding.
    tables: Vec<String>,

    #[command(flatten)]
    shared: SharedArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.shared.verbose);

    let config = cli.shared.load_config()?;

    let mut registry = CallbackRegistry::from_bindings(
        config
            .callbacks
            .iter()
            .map(|(table, module_ref)| (TableId::from(table.as_str()), module_ref.clone())),
        &NullCallbackFactory,
    );
    // Like the original `InitialQuery` run, a handler failure during a bulk
    // import is recorded to the same errors log the live follower's broker
    // workers write to, rather than aborting the whole import.
    registry.register_error_handler(Arc::new(LoggedErrorHandler::new(
        config.queue.errors_log.clone(),
    )));

    let requested: Vec<TableId> = cli.tables.iter().map(|t| TableId::from(t.as_str())).collect();

    let conn_params = ConnectionParams {
        host: config.database.host.clone(),
        port: config.database.port,
        user: config.database.user.clone(),
        password: config.database.password.clone(),
        unix_socket: config.database.unix_socket.clone(),
    };

    import_tables(&conn_params, &requested, &registry, cli.stream).await;

    Ok(())
}
