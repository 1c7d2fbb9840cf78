//! Read-only schema metadata lookup: column-name vectors and character sets
//! for the tables this agent has callbacks registered for.
//!
//! Loaded once at startup, over a single connection, with one query per table
//! per map - exactly the shape of the original tool's `load_column_names` and
//! `load_character_sets` passes. The result is treated as immutable for the
//! lifetime of the process; a schema change requires a restart.

use std::collections::BTreeMap;

use mygrate_errors::SchemaError;
use mygrate_types::TableId;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, OptsBuilder};
use tracing::debug;

/// Connection parameters for the schema-lookup (and bulk-import) connection,
/// as read from the `[database]` config section.
#[derive(Debug, Clone, Default)]
pub struct ConnectionParams {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub unix_socket: Option<String>,
}

impl ConnectionParams {
    /// Builds connection options selecting a specific database, as the
    /// schema loader does for each table's `TABLE_SCHEMA` and the bulk
    /// importer does for each table's source database.
    pub fn opts_for_db(&self, db: &str) -> Opts {
        let mut builder = OptsBuilder::default().db_name(Some(db));
        if let Some(host) = &self.host {
            builder = builder.ip_or_hostname(host.clone());
        }
        if let Some(port) = self.port {
            builder = builder.tcp_port(port);
        }
        if let Some(user) = &self.user {
            builder = builder.user(Some(user.clone()));
        }
        if let Some(password) = &self.password {
            builder = builder.pass(Some(password.clone()));
        }
        if let Some(socket) = &self.unix_socket {
            builder = builder.socket(Some(socket.clone()));
        }
        builder.into()
    }

    fn opts(&self) -> Opts {
        // INFORMATION_SCHEMA is readable regardless of the selected default
        // database, so the lookup connection doesn't select one.
        let mut builder = OptsBuilder::default();
        if let Some(host) = &self.host {
            builder = builder.ip_or_hostname(host.clone());
        }
        if let Some(port) = self.port {
            builder = builder.tcp_port(port);
        }
        if let Some(user) = &self.user {
            builder = builder.user(Some(user.clone()));
        }
        if let Some(password) = &self.password {
            builder = builder.pass(Some(password.clone()));
        }
        if let Some(socket) = &self.unix_socket {
            builder = builder.socket(Some(socket.clone()));
        }
        builder.into()
    }
}

/// The column-name vector and optional charset for every table this agent
/// watches, keyed by [`TableId`].
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    columns: BTreeMap<TableId, Vec<String>>,
    charsets: BTreeMap<TableId, Option<String>>,
}

impl SchemaCatalog {
    /// Builds a catalog directly from already-known maps, bypassing any
    /// connection. Used by the parser's tests and by callers (e.g. the
    /// bulk importer in single-table mode) that already have the data.
    pub fn from_parts(
        columns: BTreeMap<TableId, Vec<String>>,
        charsets: BTreeMap<TableId, Option<String>>,
    ) -> Self {
        SchemaCatalog { columns, charsets }
    }

    /// Connects once and loads both maps for every table in `tables`.
    pub async fn load<'a>(
        conn_params: &ConnectionParams,
        tables: impl IntoIterator<Item = &'a TableId>,
    ) -> Result<Self, SchemaError> {
        let tables: Vec<&TableId> = tables.into_iter().collect();
        let mut conn = Conn::new(conn_params.opts())
            .await
            .map_err(SchemaError::Connect)?;

        let mut columns = BTreeMap::new();
        for table in &tables {
            let names = load_column_names(&mut conn, table).await?;
            columns.insert((*table).clone(), names);
        }

        let mut charsets = BTreeMap::new();
        for table in &tables {
            let charset = load_charset(&mut conn, table).await?;
            charsets.insert((*table).clone(), charset);
        }

        debug!(tables = tables.len(), "loaded schema catalog");

        Ok(SchemaCatalog { columns, charsets })
    }

    /// The ordered column-name vector for `table`. Positional indices in the
    /// parsed event stream are 1:1 with this vector.
    pub fn column_names(&self, table: &TableId) -> Option<&[String]> {
        self.columns.get(table).map(Vec::as_slice)
    }

    /// The character-set name for `table`, if one is configured. `None`
    /// leaves byte-string values undecoded.
    pub fn charset(&self, table: &TableId) -> Option<&str> {
        self.charsets.get(table).and_then(|c| c.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

async fn load_column_names(conn: &mut Conn, table: &TableId) -> Result<Vec<String>, SchemaError> {
    let (db, tbl) = table.split().ok_or_else(|| SchemaError::UnknownTable(table.to_string()))?;
    conn.exec::<String, _, _>(
        "SELECT `COLUMN_NAME` FROM `INFORMATION_SCHEMA`.`COLUMNS` \
         WHERE `TABLE_SCHEMA` = ? AND `TABLE_NAME` = ? ORDER BY `ORDINAL_POSITION`",
        (db, tbl),
    )
    .await
    .map_err(|source| SchemaError::Query {
        table: table.to_string(),
        source,
    })
}

async fn load_charset(conn: &mut Conn, table: &TableId) -> Result<Option<String>, SchemaError> {
    let (db, tbl) = table.split().ok_or_else(|| SchemaError::UnknownTable(table.to_string()))?;
    let row: Option<String> = conn
        .exec_first(
            "SELECT `CCSA`.`CHARACTER_SET_NAME` FROM \
             `INFORMATION_SCHEMA`.`TABLES` `T`, \
             `INFORMATION_SCHEMA`.`COLLATION_CHARACTER_SET_APPLICABILITY` `CCSA` \
             WHERE `CCSA`.`COLLATION_NAME` = `T`.`TABLE_COLLATION` \
             AND `T`.`TABLE_SCHEMA` = ? AND `T`.`TABLE_NAME` = ?",
            (db, tbl),
        )
        .await
        .map_err(|source| SchemaError::Query {
            table: table.to_string(),
            source,
        })?;
    Ok(row)
}
