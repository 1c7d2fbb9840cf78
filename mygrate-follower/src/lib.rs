//! The journal follower: sweeps the binlog index, spawns the external
//! decoder per journal that has moved since the last sweep, feeds its output
//! through [`mygrate_parser::Parser`], and publishes completed events to the
//! dispatcher.
//!
//! One sweep processes journals strictly sequentially, one at a time, so
//! that a single journal's cursor updates stay ordered and no locking is
//! needed around the cursor file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mygrate_dispatch::Dispatcher;
use mygrate_errors::{FollowerError, IndexError};
use mygrate_parser::Parser;
use mygrate_schema::SchemaCatalog;
use mygrate_tracking::{cursor_path, read_position, CursorHandle};
use mygrate_types::Event;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

const DECODER: &str = "mysqlbinlog";

/// Publishes a completed event downstream. [`Dispatcher`] is the production
/// implementation; tests substitute an in-process recorder so the sweep
/// logic can be exercised without a broker connection.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: Event) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
impl EventSink for Dispatcher {
    async fn publish(&self, event: Event) -> anyhow::Result<()> {
        self.publish_event(event).await.map_err(Into::into)
    }
}

/// The shared cooperative-shutdown flag, set by the agent binary's signal
/// handlers and observed between lines and between journals.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        ShutdownFlag(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Reads the binlog index file, resolving each listed path relative to the
/// index's own directory, as MySQL's index format expects. Exposed for the
/// skip-to-end utility, which needs the same journal list without running a
/// sweep.
pub fn read_index(index_file: &Path) -> Result<Vec<PathBuf>, IndexError> {
    let contents = std::fs::read_to_string(index_file).map_err(|source| IndexError::Read {
        path: index_file.to_owned(),
        source,
    })?;
    let dir = index_file.parent().unwrap_or_else(|| Path::new("."));
    Ok(contents
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(|line| normalize(&dir.join(line)))
        .collect())
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Sweeps the index and follows every journal that has changed since the
/// last sweep, publishing completed events to the dispatcher.
pub struct Follower {
    index_file: PathBuf,
    tracking_dir: PathBuf,
    catalog: SchemaCatalog,
    dispatcher: Arc<dyn EventSink>,
    shutdown: ShutdownFlag,
    mtimes: HashMap<PathBuf, f64>,
}

impl Follower {
    pub fn new(
        index_file: PathBuf,
        tracking_dir: PathBuf,
        catalog: SchemaCatalog,
        dispatcher: impl EventSink + 'static,
        shutdown: ShutdownFlag,
    ) -> Self {
        Follower {
            index_file,
            tracking_dir,
            catalog,
            dispatcher: Arc::new(dispatcher),
            shutdown,
            mtimes: HashMap::new(),
        }
    }

    /// One pass over the index: every journal whose mtime has advanced since
    /// it was last observed is followed from its persisted cursor.
    pub async fn sweep_once(&mut self) -> Result<(), FollowerError> {
        let journals = read_index(&self.index_file)?;

        for journal in journals {
            if self.shutdown.is_set() {
                break;
            }

            let mtime = mtime_secs(&journal).unwrap_or(0.0);
            let previous = self.mtimes.insert(journal.clone(), mtime);
            if previous.map(|p| mtime <= p).unwrap_or(false) {
                continue;
            }

            if let Err(error) = self.follow_journal(&journal).await {
                error!(journal = %journal.display(), error = format!("{error:#}"), "journal sweep failed");
            }
        }

        Ok(())
    }

    /// Loops `sweep_once` with `delay` between passes until the shutdown
    /// flag is observed.
    pub async fn run(&mut self, delay: std::time::Duration) -> Result<(), FollowerError> {
        while !self.shutdown.is_set() {
            self.sweep_once().await?;
            if !self.shutdown.is_set() {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }

    async fn follow_journal(&self, journal: &Path) -> Result<(), FollowerError> {
        let cursor_file = cursor_path(&self.tracking_dir, journal);
        let start_position = read_position(&cursor_file)?;
        let mut cursor = CursorHandle::open(&cursor_file)?;
        cursor.write(&start_position)?;

        info!(journal = %journal.display(), from = %start_position, "resuming journal");

        let mut child = Command::new(DECODER)
            .arg("-v")
            .arg("--base64-output=DECODE-ROWS")
            .arg(journal)
            .arg("-j")
            .arg(&start_position)
            .arg("--set-charset=utf8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|source| FollowerError::Spawn {
                journal: journal.to_owned(),
                source,
            })?;

        // The decoder never reads its stdin; close it immediately so it
        // never blocks waiting for input that will never arrive.
        drop(child.stdin.take());

        let stdout = child.stdout.take().expect("piped stdout");
        let mut lines = BufReader::new(stdout).lines();
        let mut parser = Parser::new(&self.catalog);

        let clean_eof = drive_lines(
            &mut lines,
            &mut parser,
            &mut cursor,
            self.dispatcher.as_ref(),
            &self.shutdown,
            journal,
        )
        .await?;

        if clean_eof {
            let mut pending = Vec::with_capacity(1);
            parser.finish(|event| pending.push(event));
            publish_pending(self.dispatcher.as_ref(), &mut pending).await;
        }

        let _ = child.wait().await;
        Ok(())
    }
}

/// Streams `lines` through `parser`, advancing `cursor` on every `# at `
/// marker and publishing every completed event through `dispatcher`, until
/// either the stream ends or `shutdown` is observed. Returns whether the
/// stream reached a clean end-of-stream (vs. being cut short by shutdown).
///
/// Generic over the line source so the sweep logic is exercisable against an
/// in-process byte buffer standing in for the decoder's stdout, without
/// spawning a real `mysqlbinlog` process.
async fn drive_lines<R>(
    lines: &mut tokio::io::Lines<R>,
    parser: &mut Parser<'_>,
    cursor: &mut CursorHandle,
    dispatcher: &dyn EventSink,
    shutdown: &ShutdownFlag,
    journal: &Path,
) -> Result<bool, FollowerError>
where
    R: AsyncBufRead + Unpin,
{
    let mut pending = Vec::with_capacity(1);

    loop {
        if shutdown.is_set() {
            return Ok(false);
        }

        let line = lines.next_line().await.map_err(|source| FollowerError::Stream {
            journal: journal.to_owned(),
            source,
        })?;
        let Some(line) = line else { break };

        if let Some(body) = line.strip_prefix("### ") {
            parser.feed(body, |event| pending.push(event));
            publish_pending(dispatcher, &mut pending).await;
        } else if let Some(position) = line.strip_prefix("# at ") {
            cursor.write(position.trim_end())?;
        }
    }

    Ok(true)
}

async fn publish_pending(dispatcher: &dyn EventSink, pending: &mut Vec<Event>) {
    for event in pending.drain(..) {
        debug!(table = %event.table(), action = event.action(), "parsed event");
        if let Err(error) = dispatcher.publish(event).await {
            warn!(%error, "failed to publish event");
        }
    }
}

fn mtime_secs(path: &Path) -> Option<f64> {
    let metadata = std::fs::metadata(path).ok()?;
    let modified = metadata.modified().ok()?;
    let duration = modified.duration_since(std::time::UNIX_EPOCH).ok()?;
    Some(duration.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use mygrate_schema::SchemaCatalog;
    use mygrate_types::TableId;
    use std::collections::BTreeMap;

    /// An in-process stand-in for the broker, recording every published
    /// event instead of sending it anywhere.
    #[derive(Default)]
    struct RecordingSink {
        published: Mutex<Vec<Event>>,
    }

    #[async_trait::async_trait]
    impl EventSink for RecordingSink {
        async fn publish(&self, event: Event) -> anyhow::Result<()> {
            self.published.lock().unwrap().push(event);
            Ok(())
        }
    }

    fn catalog() -> SchemaCatalog {
        let mut columns = BTreeMap::new();
        let mut charsets = BTreeMap::new();
        let table = TableId::from("db1.t1");
        columns.insert(table.clone(), vec!["id".to_owned()]);
        charsets.insert(table, None);
        SchemaCatalog::from_parts(columns, charsets)
    }

    /// Builds a [`tokio::io::Lines`] over an in-process byte buffer, standing
    /// in for the decoder child's stdout without spawning a process.
    fn fake_decoder_lines(text: &str) -> tokio::io::Lines<BufReader<std::io::Cursor<Vec<u8>>>> {
        BufReader::new(std::io::Cursor::new(text.as_bytes().to_vec())).lines()
    }

    #[tokio::test]
    async fn cursor_advances_only_on_at_markers_between_inserts() {
        let cat = catalog();
        let mut parser = Parser::new(&cat);
        let dir = tempfile::tempdir().unwrap();
        let cursor_file = dir.path().join("binlogpos.000001");
        let mut cursor = CursorHandle::open(&cursor_file).unwrap();
        let sink = RecordingSink::default();
        let shutdown = ShutdownFlag::new();

        let mut lines = fake_decoder_lines(
            "### INSERT INTO `db1`.`t1`\n\
             ### SET\n\
             ###   @1=1\n\
             ### INSERT INTO `db1`.`t1`\n\
             ### SET\n\
             ###   @1=2\n\
             # at 200\n",
        );

        let clean_eof = drive_lines(
            &mut lines,
            &mut parser,
            &mut cursor,
            &sink,
            &shutdown,
            Path::new("mysql-bin.000001"),
        )
        .await
        .unwrap();

        assert!(clean_eof);
        let mut pending = Vec::new();
        parser.finish(|e| pending.push(e));
        publish_pending(&sink, &mut pending).await;

        assert_eq!(sink.published.lock().unwrap().len(), 2);
        assert_eq!(read_position(&cursor_file).unwrap(), "200");
    }

    #[tokio::test]
    async fn shutdown_mid_stream_leaves_cursor_at_last_marker_and_drops_partial_event() {
        let cat = catalog();
        let mut parser = Parser::new(&cat);
        let dir = tempfile::tempdir().unwrap();
        let cursor_file = dir.path().join("binlogpos.000001");
        let mut cursor = CursorHandle::open(&cursor_file).unwrap();
        let sink = RecordingSink::default();
        let shutdown = ShutdownFlag::new();

        // Simulate the marker and the in-progress event having already been
        // read by an earlier iteration of the real loop, as `drive_lines`
        // itself would have left them: cursor advanced to the marker, an
        // event started and partially filled in, then shutdown observed
        // before a closing header or EOF ever arrived.
        cursor.write("100").unwrap();
        parser.feed("INSERT INTO `db1`.`t1`", |_| panic!("no event yet"));
        parser.feed("SET", |_| panic!("no event yet"));
        parser.feed("  @1=1", |_| panic!("no event yet"));
        shutdown.set();

        // Any further lines (e.g. the next journal's header) must not be
        // consumed once shutdown is observed.
        let mut lines = fake_decoder_lines("### INSERT INTO `db1`.`t1`\n");
        let clean_eof = drive_lines(
            &mut lines,
            &mut parser,
            &mut cursor,
            &sink,
            &shutdown,
            Path::new("mysql-bin.000001"),
        )
        .await
        .unwrap();

        assert!(!clean_eof);
        assert!(sink.published.lock().unwrap().is_empty());
        assert_eq!(read_position(&cursor_file).unwrap(), "100");

        // `finish()` is never called by the caller on a non-clean EOF, so the
        // in-progress event - still intact here, proving it was genuinely
        // buffered rather than already lost - is simply never emitted.
        let mut recovered = Vec::new();
        parser.finish(|e| recovered.push(e));
        assert_eq!(recovered.len(), 1);
    }

    #[test]
    fn read_index_resolves_relative_to_index_dir() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("mysql-bin.index");
        std::fs::write(&index_path, "./mysql-bin.000001\nmysql-bin.000002\n").unwrap();

        let journals = read_index(&index_path).unwrap();
        assert_eq!(journals.len(), 2);
        assert_eq!(journals[0], dir.path().join("mysql-bin.000001"));
        assert_eq!(journals[1], dir.path().join("mysql-bin.000002"));
    }

    #[test]
    fn read_index_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("mysql-bin.index");
        std::fs::write(&index_path, "mysql-bin.000001\n\n").unwrap();

        let journals = read_index(&index_path).unwrap();
        assert_eq!(journals.len(), 1);
    }

    #[test]
    fn missing_index_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist.index");
        assert!(read_index(&missing).is_err());
    }

    #[test]
    fn shutdown_flag_is_observed_once_set() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_set());
        flag.set();
        assert!(flag.is_set());
    }
}
