//! The dispatch boundary: publishes reconstructed events onto the task
//! queue broker, and the errors log that the broker's failure hook writes
//! permanently-failed jobs to.
//!
//! The broker itself is an external collaborator (this crate never runs a
//! worker), so "retry" here means only the metadata attached to each
//! published job; the broker/worker side is responsible for honoring it.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use mygrate_callbacks::ErrorHandler;
use mygrate_errors::{CallbackError, DispatchError};
use mygrate_types::{ColumnMap, Event, TableId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const EXCHANGE: &str = "";
const ROUTING_KEY: &str = "mygrate";

/// Per-job retry/error-log policy, attached to every published job. Mirrors
/// the Celery task settings the original tool configures once at
/// `tasks.py` import time.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            retry_delay_secs: 180,
        }
    }
}

/// The wire payload for one dispatched job: the reconstructed event plus its
/// retry policy and the `ignore_result` flag the source always sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub event: Event,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub ignore_result: bool,
}

/// Publishes reconstructed events onto the broker queue.
pub struct Dispatcher {
    channel: Channel,
    policy: RetryPolicy,
}

impl Dispatcher {
    /// Connects to the broker and declares the durable queue jobs are
    /// published to.
    pub async fn connect(broker_url: &str, policy: RetryPolicy) -> Result<Self, DispatchError> {
        let options = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        let connection = Connection::connect(broker_url, options)
            .await
            .map_err(|source| DispatchError::Connect {
                url: broker_url.to_owned(),
                source,
            })?;

        let channel = connection
            .create_channel()
            .await
            .map_err(DispatchError::Publish)?;

        channel
            .queue_declare(
                ROUTING_KEY,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(DispatchError::Publish)?;

        Ok(Dispatcher { channel, policy })
    }

    fn job_for(&self, event: Event) -> Job {
        Job {
            event,
            max_retries: self.policy.max_retries,
            retry_delay_secs: self.policy.retry_delay_secs,
            ignore_result: true,
        }
    }

    async fn publish(&self, job: Job) -> Result<(), DispatchError> {
        let payload = bincode::serialize(&job).map_err(DispatchError::Encode)?;
        debug!(action = job.event.action(), table = %job.event.table(), "publishing job");

        self.channel
            .basic_publish(
                EXCHANGE,
                ROUTING_KEY,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(DispatchError::Publish)?
            .await
            .map_err(DispatchError::Publish)?;

        Ok(())
    }

    pub async fn publish_insert(&self, table: TableId, set: ColumnMap) -> Result<(), DispatchError> {
        self.publish(self.job_for(Event::Insert { table, set })).await
    }

    pub async fn publish_update(
        &self,
        table: TableId,
        before: ColumnMap,
        after: ColumnMap,
    ) -> Result<(), DispatchError> {
        self.publish(self.job_for(Event::Update {
            table,
            r#where: before,
            set: after,
        }))
        .await
    }

    pub async fn publish_delete(&self, table: TableId, r#where: ColumnMap) -> Result<(), DispatchError> {
        self.publish(self.job_for(Event::Delete { table, r#where })).await
    }

    /// Publishes a fully reconstructed event, dispatching to the variant-
    /// specific publish call. This is the entry point the follower and the
    /// bulk importer use.
    pub async fn publish_event(&self, event: Event) -> Result<(), DispatchError> {
        self.publish(self.job_for(event)).await
    }
}

/// One permanently-failed job, as recorded by [`ErrorsLog::append`]. Mirrors
/// the source's `LoggedTask.on_failure` error dict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub action: String,
    pub table: String,
    pub args: String,
    pub exception_message: String,
    pub traceback: String,
}

/// An append-only, fsync-on-every-write log of permanently failed jobs.
/// Multiple broker worker processes may append concurrently; O_APPEND
/// semantics plus a per-write fsync keep entries intact and durable.
pub struct ErrorsLog {
    path: PathBuf,
}

impl ErrorsLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ErrorsLog { path: path.into() }
    }

    pub fn append(&self, record: &ErrorRecord) -> Result<(), DispatchError> {
        let encoded = bincode::serialize(record).map_err(DispatchError::Encode)?;
        let len = (encoded.len() as u32).to_le_bytes();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| DispatchError::ErrorsLog {
                path: self.path.clone(),
                source,
            })?;

        let to_err = |source| DispatchError::ErrorsLog {
            path: self.path.clone(),
            source,
        };
        file.write_all(&len).map_err(to_err)?;
        file.write_all(&encoded).map_err(to_err)?;
        file.flush().map_err(to_err)?;
        file.sync_all().map_err(to_err)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// The production `ErrorHandler`: records a permanent failure to the
/// errors log and swallows it, rather than propagating it back to the
/// follower or importer sweep loop.
pub struct LoggedErrorHandler {
    log: ErrorsLog,
}

impl LoggedErrorHandler {
    pub fn new(errors_log_path: impl Into<PathBuf>) -> Self {
        LoggedErrorHandler {
            log: ErrorsLog::new(errors_log_path),
        }
    }
}

impl ErrorHandler for LoggedErrorHandler {
    fn handle(
        &self,
        table: &TableId,
        action: &'static str,
        error: anyhow::Error,
    ) -> Result<(), CallbackError> {
        let record = ErrorRecord {
            action: action.to_owned(),
            table: table.to_string(),
            args: String::new(),
            exception_message: error.to_string(),
            traceback: format!("{error:?}"),
        };

        if let Err(log_err) = self.log.append(&record) {
            warn!(%log_err, %table, action, "failed to append to errors log");
            return Err(CallbackError::HandlerFailed {
                table: table.to_string(),
                action,
                message: error.to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mygrate_types::Value;

    #[test]
    fn errors_log_appends_and_fsyncs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.log");
        let log = ErrorsLog::new(&path);

        log.append(&ErrorRecord {
            action: "INSERT".into(),
            table: "db1.t1".into(),
            args: String::new(),
            exception_message: "boom".into(),
            traceback: "boom".into(),
        })
        .unwrap();

        assert!(path.is_file());
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn logged_error_handler_swallows_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.log");
        let handler = LoggedErrorHandler::new(&path);

        let table = TableId::from("db1.t1");
        let result = handler.handle(&table, "INSERT", anyhow::anyhow!("boom"));
        assert!(result.is_ok());
        assert!(path.is_file());
    }

    #[test]
    fn job_serializes_with_bincode() {
        let job = Job {
            event: Event::Insert {
                table: TableId::from("db1.t1"),
                set: ColumnMap::from([("id".to_string(), Value::Int(1))]),
            },
            max_retries: 3,
            retry_delay_secs: 180,
            ignore_result: true,
        };
        let bytes = bincode::serialize(&job).unwrap();
        let decoded: Job = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.max_retries, 3);
    }
}
