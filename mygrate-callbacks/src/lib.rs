//! The callback registry: binds a `db.table` identifier to a per-table
//! handler object, routes completed events to it, and delegates handler
//! failures to an installable error handler.
//!
//! The original tool imports a Python module per table and calls its
//! `INSERT`/`UPDATE`/`DELETE` module-level functions; here that becomes a
//! trait object implementing the same three-method capability set, resolved
//! by the caller (typically from the `[callbacks]` config section) rather
//! than by dynamic import.

use std::collections::HashMap;
use std::sync::Arc;

use mygrate_errors::CallbackError;
use mygrate_types::{ColumnMap, Event, TableId};
use tracing::warn;

/// The per-table capability set a registered handler must implement.
pub trait TableHandler: Send + Sync {
    fn insert(&self, cols: &ColumnMap) -> anyhow::Result<()>;
    fn update(&self, before: &ColumnMap, after: &ColumnMap) -> anyhow::Result<()>;
    fn delete(&self, cols: &ColumnMap) -> anyhow::Result<()>;
}

/// Handles an exception raised by a registered handler. Passed the error
/// explicitly (no implicit "current exception" thread state, unlike the
/// source's `raise`-from-context default) so a systems-language port has
/// something concrete to act on.
pub trait ErrorHandler: Send + Sync {
    fn handle(&self, table: &TableId, action: &'static str, error: anyhow::Error) -> Result<(), CallbackError>;
}

/// The default error handler: re-raises the handler's error as a
/// [`CallbackError`], exactly like the source's `raise`-by-default behavior.
pub struct RethrowErrorHandler;

impl ErrorHandler for RethrowErrorHandler {
    fn handle(
        &self,
        table: &TableId,
        action: &'static str,
        error: anyhow::Error,
    ) -> Result<(), CallbackError> {
        Err(CallbackError::HandlerFailed {
            table: table.to_string(),
            action,
            message: error.to_string(),
        })
    }
}

/// Resolves a config file's `<db.table> = <module-ref>` binding into a
/// concrete handler.
///
/// The original tool dynamically imports a Python module named by the
/// right-hand side and looks up its `INSERT`/`UPDATE`/`DELETE` functions; a
/// systems-language port has no equivalent of importing a module by string
/// name, so resolution is delegated to whatever binary embeds this registry.
/// Returning `None` leaves the table unregistered (a no-op for every event).
pub trait CallbackFactory {
    fn build(&self, table: &TableId, module_ref: &str) -> Option<Arc<dyn TableHandler>>;
}

/// Maps `db.table` identifiers to handler objects and routes events to them.
pub struct CallbackRegistry {
    bindings: HashMap<TableId, Arc<dyn TableHandler>>,
    error_handler: Arc<dyn ErrorHandler>,
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        CallbackRegistry {
            bindings: HashMap::new(),
            error_handler: Arc::new(RethrowErrorHandler),
        }
    }
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associates a handler with a table. A second call for the same table
    /// replaces the previous binding.
    pub fn register(&mut self, table: TableId, handler: Arc<dyn TableHandler>) {
        self.bindings.insert(table, handler);
    }

    /// Installs a custom error handler for every registered table. The
    /// task-queue-backed production handler (record-and-swallow, writing to
    /// the errors log) lives in `mygrate-dispatch`.
    pub fn register_error_handler(&mut self, handler: Arc<dyn ErrorHandler>) {
        self.error_handler = handler;
    }

    /// Builds a registry from the config file's `[callbacks]` bindings,
    /// resolving each `module-ref` string through `factory`. A binding the
    /// factory can't resolve is logged and left unregistered rather than
    /// aborting startup.
    pub fn from_bindings(
        bindings: impl IntoIterator<Item = (TableId, String)>,
        factory: &dyn CallbackFactory,
    ) -> Self {
        let mut registry = Self::new();
        for (table, module_ref) in bindings {
            match factory.build(&table, &module_ref) {
                Some(handler) => registry.register(table, handler),
                None => warn!(%table, module_ref, "no handler resolved for callback binding"),
            }
        }
        registry
    }

    pub fn is_registered(&self, table: &TableId) -> bool {
        self.bindings.contains_key(table)
    }

    pub fn registered_tables(&self) -> impl Iterator<Item = &TableId> {
        self.bindings.keys()
    }

    /// Routes `event` to its table's handler. A no-op, returning `Ok(())`
    /// without any side effect, if no handler is bound for the event's
    /// table.
    pub fn execute(&self, event: &Event) -> Result<(), CallbackError> {
        let table = event.table();
        let Some(handler) = self.bindings.get(table) else {
            return Ok(());
        };

        let result = match event {
            Event::Insert { set, .. } => handler.insert(set),
            Event::Update { r#where, set, .. } => handler.update(r#where, set),
            Event::Delete { r#where, .. } => handler.delete(r#where),
        };

        match result {
            Ok(()) => Ok(()),
            Err(error) => {
                warn!(%table, action = event.action(), %error, "callback handler failed");
                self.error_handler.handle(table, event.action(), error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        calls: Mutex<Vec<String>>,
    }

    impl TableHandler for RecordingHandler {
        fn insert(&self, cols: &ColumnMap) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("insert:{cols:?}"));
            Ok(())
        }
        fn update(&self, before: &ColumnMap, after: &ColumnMap) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("update:{before:?}->{after:?}"));
            Ok(())
        }
        fn delete(&self, cols: &ColumnMap) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("delete:{cols:?}"));
            Ok(())
        }
    }

    struct FailingHandler;

    impl TableHandler for FailingHandler {
        fn insert(&self, _cols: &ColumnMap) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
        fn update(&self, _before: &ColumnMap, _after: &ColumnMap) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
        fn delete(&self, _cols: &ColumnMap) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    struct SwallowingErrorHandler {
        seen: Mutex<Vec<String>>,
    }

    impl ErrorHandler for SwallowingErrorHandler {
        fn handle(
            &self,
            table: &TableId,
            action: &'static str,
            error: anyhow::Error,
        ) -> Result<(), CallbackError> {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{table}.{action}: {error}"));
            Ok(())
        }
    }

    #[test]
    fn routes_insert_to_registered_handler() {
        let mut registry = CallbackRegistry::new();
        let handler = Arc::new(RecordingHandler::default());
        registry.register(TableId::from("db1.t1"), handler.clone());

        let event = Event::Insert {
            table: TableId::from("db1.t1"),
            set: ColumnMap::new(),
        };
        registry.execute(&event).unwrap();

        assert_eq!(handler.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn unregistered_table_is_a_no_op() {
        let registry = CallbackRegistry::new();
        let event = Event::Delete {
            table: TableId::from("db1.unregistered"),
            r#where: ColumnMap::new(),
        };
        registry.execute(&event).unwrap();
    }

    #[test]
    fn default_error_handler_rethrows() {
        let mut registry = CallbackRegistry::new();
        registry.register(TableId::from("db1.t1"), Arc::new(FailingHandler));

        let event = Event::Insert {
            table: TableId::from("db1.t1"),
            set: ColumnMap::new(),
        };
        let err = registry.execute(&event).unwrap_err();
        assert!(matches!(err, CallbackError::HandlerFailed { .. }));
    }

    #[test]
    fn custom_error_handler_can_swallow() {
        let mut registry = CallbackRegistry::new();
        registry.register(TableId::from("db1.t1"), Arc::new(FailingHandler));
        let error_handler = Arc::new(SwallowingErrorHandler {
            seen: Mutex::new(Vec::new()),
        });
        registry.register_error_handler(error_handler.clone());

        let event = Event::Insert {
            table: TableId::from("db1.t1"),
            set: ColumnMap::new(),
        };
        registry.execute(&event).unwrap();
        assert_eq!(error_handler.seen.lock().unwrap().len(), 1);
    }

    struct EchoFactory;

    impl CallbackFactory for EchoFactory {
        fn build(&self, table: &TableId, module_ref: &str) -> Option<Arc<dyn TableHandler>> {
            if module_ref == "skip_me" {
                return None;
            }
            let _ = table;
            Some(Arc::new(RecordingHandler::default()))
        }
    }

    #[test]
    fn from_bindings_skips_unresolved_modules() {
        let bindings = vec![
            (TableId::from("db1.t1"), "handlers.t1".to_owned()),
            (TableId::from("db1.t2"), "skip_me".to_owned()),
        ];
        let registry = CallbackRegistry::from_bindings(bindings, &EchoFactory);

        assert!(registry.is_registered(&TableId::from("db1.t1")));
        assert!(!registry.is_registered(&TableId::from("db1.t2")));
    }
}
