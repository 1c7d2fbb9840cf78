//! Shared setup for the three `mygrate-*` binaries: CLI flags common to all
//! of them, tracing initialization, configuration loading, and the default
//! (no-op) callback factory a deployment is expected to replace.

use std::sync::Arc;

use clap::Args;
use mygrate_callbacks::{CallbackFactory, TableHandler};
use mygrate_config::AgentConfig;
use mygrate_types::TableId;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Flags shared by every binary: a config path override and a verbosity
/// bump, following the `clap`-derive `#[command(flatten)]` idiom.
#[derive(Args, Debug)]
pub struct SharedArgs {
    /// Overrides the config file search (env `MYGRATE_CONFIG`, then
    /// `~/.mygrate.conf`, then `/etc/mygrate.conf`).
    #[arg(long, global = true)]
    pub config: Option<std::path::PathBuf>,

    /// Raises the default tracing filter from `info` to `debug`.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl SharedArgs {
    pub fn load_config(&self) -> anyhow::Result<AgentConfig> {
        match &self.config {
            Some(path) => Ok(AgentConfig::load_from(path)?),
            None => Ok(AgentConfig::load()?),
        }
    }
}

/// Installs a `tracing-subscriber` `EnvFilter` subscriber. `RUST_LOG`
/// overrides the default; `--verbose` raises the default from `info` to
/// `debug` when `RUST_LOG` is unset.
pub fn init_tracing(verbose: bool) {
    let default_directive = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// The factory a deployment plugs in to resolve `[callbacks]` bindings into
/// real handler objects. The binaries shipped here use [`NullCallbackFactory`]
/// because the concrete per-table business logic is deployment-specific;
/// embedding this crate as a library and supplying a real factory is the
/// intended way to run this agent against actual handlers.
pub struct NullCallbackFactory;

impl CallbackFactory for NullCallbackFactory {
    fn build(&self, table: &TableId, module_ref: &str) -> Option<Arc<dyn TableHandler>> {
        warn!(
            %table,
            module_ref,
            "no callback factory configured; table will be tracked but events dropped"
        );
        None
    }
}
