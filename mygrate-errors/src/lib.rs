//! Shared error taxonomy for the mygrate workspace.
//!
//! Every crate in this workspace returns one of the variants defined here
//! rather than rolling its own error type, mirroring how the rest of the
//! workspace centralizes its error handling in a single crate.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while locating or parsing the agent's configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no valid config file found in {0:?}")]
    NotFound(Vec<PathBuf>),

    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path:?}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("missing required configuration option [{section}]::{key}")]
    MissingOption { section: String, key: String },

    #[error("invalid value for [{section}]::{key}: {message}")]
    InvalidValue {
        section: String,
        key: String,
        message: String,
    },

    #[error("tracking directory does not exist: {0:?}")]
    TrackingDirMissing(PathBuf),
}

/// Errors raised by the per-journal cursor store.
#[derive(Debug, Error)]
pub enum CursorError {
    #[error("failed to read cursor file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write cursor file {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors raised while translating the decoded journal index.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("failed to read binlog index {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors raised when a registered callback handler fails.
///
/// This is passed *explicitly* to the error handler, rather than relying on
/// implicit "current exception" thread state: a systems-language port has no
/// equivalent to re-raising the in-flight exception from arbitrary context.
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("callback for {table}.{action} failed: {message}")]
    HandlerFailed {
        table: String,
        action: &'static str,
        message: String,
    },
}

/// Errors raised while publishing an event to the task queue.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to connect to broker at {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to publish job: {0}")]
    Publish(#[source] lapin::Error),

    #[error("failed to serialize job payload: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to append to errors log {path:?}: {source}")]
    ErrorsLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors raised while sweeping journals.
#[derive(Debug, Error)]
pub enum FollowerError {
    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Cursor(#[from] CursorError),

    #[error("failed to spawn decoder for {journal:?}: {source}")]
    Spawn {
        journal: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("decoder for {journal:?} exited with an I/O error: {source}")]
    Stream {
        journal: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors raised during schema metadata lookup.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to connect to database: {0}")]
    Connect(#[source] mysql_async::Error),

    #[error("query failed for table {table}: {source}")]
    Query {
        table: String,
        #[source]
        source: mysql_async::Error,
    },

    #[error("table {0} has no registered column metadata")]
    UnknownTable(String),
}

/// Errors raised by the bulk importer for a single table; these are always
/// caught and logged rather than propagated, per-table failure isolation.
#[derive(Debug, Error)]
pub enum ImporterError {
    #[error("failed to connect to database {db}: {source}")]
    Connect {
        db: String,
        #[source]
        source: mysql_async::Error,
    },

    #[error("failed to stream table {table}: {source}")]
    Query {
        table: String,
        #[source]
        source: mysql_async::Error,
    },

    #[error("table identifier {0:?} is not of the form `db.table`")]
    MalformedTableId(String),
}
