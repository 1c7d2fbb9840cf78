//! The row-change data model shared by every component of the agent: the
//! table identifier, the scalar value representation, and the three event
//! variants the parser and importer both ultimately produce.

use std::collections::BTreeMap;
use std::fmt;

/// `"<database>.<table>"`, the join key between callbacks, schema metadata,
/// and events.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct TableId(String);

impl TableId {
    /// Builds a `TableId` from already-separated database and table names.
    pub fn new(db: impl AsRef<str>, table: impl AsRef<str>) -> Self {
        TableId(format!("{}.{}", db.as_ref(), table.as_ref()))
    }

    /// Parses a dotted identifier as it appears in the decoded journal
    /// (`` `db1`.`t1` ``), stripping backticks from each segment and
    /// rejoining with a single `.`.
    pub fn from_dotted(raw: &str) -> Self {
        let cleaned = raw
            .split('.')
            .map(|ident| ident.trim_matches('`'))
            .collect::<Vec<_>>()
            .join(".");
        TableId(cleaned)
    }

    /// Splits back into `(database, table)`, used by the schema lookup and
    /// the bulk importer to build per-database connections.
    pub fn split(&self) -> Option<(&str, &str)> {
        self.0.split_once('.')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TableId {
    fn from(s: String) -> Self {
        TableId(s)
    }
}

impl From<&str> for TableId {
    fn from(s: &str) -> Self {
        TableId(s.to_owned())
    }
}

/// A single decoded scalar. The decoder's `literal_eval`-style grammar only
/// ever produces these four shapes.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
    Null,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True for the byte/char-string shape, the only one charset decoding
    /// ever applies to.
    pub fn is_text(&self) -> bool {
        matches!(self, Value::Text(_))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Null => write!(f, "NULL"),
        }
    }
}

/// An ordered column name -> value record. `BTreeMap` gives deterministic
/// iteration order, which matters for the errors-log serialization and for
/// test assertions.
pub type ColumnMap = BTreeMap<String, Value>;

/// The ordered list of column names for one table, as loaded once at
/// startup. Positional indices in the event stream are 1:1 with this vector.
pub type ColumnNames = Vec<String>;

/// A fully reconstructed row-change event, ready for dispatch.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Event {
    Insert {
        table: TableId,
        set: ColumnMap,
    },
    Update {
        table: TableId,
        r#where: ColumnMap,
        set: ColumnMap,
    },
    Delete {
        table: TableId,
        r#where: ColumnMap,
    },
}

impl Event {
    pub fn table(&self) -> &TableId {
        match self {
            Event::Insert { table, .. } => table,
            Event::Update { table, .. } => table,
            Event::Delete { table, .. } => table,
        }
    }

    /// The action name used to key into the callback registry and to tag
    /// the dispatched job.
    pub fn action(&self) -> &'static str {
        match self {
            Event::Insert { .. } => "INSERT",
            Event::Update { .. } => "UPDATE",
            Event::Delete { .. } => "DELETE",
        }
    }
}
