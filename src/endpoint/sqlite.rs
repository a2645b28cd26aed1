// ABOUTME: SQLite endpoint built on rusqlite
// ABOUTME: Attached-database catalog lookups, stored DDL, streamed rows, cached inserts

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{log_statement, Endpoint, Param};
use crate::error::CloneError;
use crate::object::{ObjectDescriptor, ObjectType};
use crate::transfer::{RowSink, RowSource, BULK_ROWS};
use crate::utils::quote_ident;
use crate::value::{Row, Value};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Schema of the primary database file; SQLite has no session user.
const MAIN_SCHEMA: &str = "main";

/// File path behind a SQLite connection string.
///
/// Accepts `sqlite://path`, `sqlite:path` or a bare path.
pub fn sqlite_path(connection_string: &str) -> Result<PathBuf> {
    let trimmed = connection_string.trim();
    let path = trimmed
        .strip_prefix("sqlite://")
        .or_else(|| trimmed.strip_prefix("sqlite:"))
        .unwrap_or(trimmed);

    if path.is_empty() {
        bail!("SQLite connection string '{}' has no file path", trimmed);
    }
    Ok(PathBuf::from(path))
}

/// `sqlite_master.type` for an object type; SQLite has no materialized
/// views or sequences.
fn master_type(object_type: ObjectType) -> Option<&'static str> {
    match object_type {
        ObjectType::Table => Some("table"),
        ObjectType::View => Some("view"),
        ObjectType::Index => Some("index"),
        ObjectType::MaterializedView | ObjectType::Sequence => None,
    }
}

/// Rows of one executed query, read forward once.
///
/// rusqlite statements borrow their connection, so while rows are being
/// read the connection is handed to a blocking task that steps a single
/// statement and feeds rows through a bounded channel. The task hands the
/// connection back once the statement is done or the receiver is dropped.
struct RowStream {
    rows: mpsc::Receiver<Result<Row>>,
    reader: Option<JoinHandle<Connection>>,
}

impl RowStream {
    fn start(conn: Connection, statement: String) -> Self {
        let (tx, rows) = mpsc::channel(BULK_ROWS);
        let reader = tokio::task::spawn_blocking(move || {
            if let Err(e) = stream_rows(&conn, &statement, &tx) {
                let _ = tx.blocking_send(Err(e));
            }
            conn
        });
        Self {
            rows,
            reader: Some(reader),
        }
    }
}

fn stream_rows(
    conn: &Connection,
    statement: &str,
    tx: &mpsc::Sender<Result<Row>>,
) -> Result<()> {
    let mut stmt = conn
        .prepare(statement)
        .context("Failed to prepare selection")?;
    let columns = stmt.column_count();
    let mut rows = stmt.query([]).context("Failed to run selection")?;

    let mut fetched = 0usize;
    while let Some(row) = rows.next().context("Failed to fetch row")? {
        let row = (0..columns)
            .map(|idx| row.get::<_, rusqlite::types::Value>(idx).map(Value::from))
            .collect::<rusqlite::Result<Row>>()?;
        if tx.blocking_send(Ok(row)).is_err() {
            debug!("Row reader stopped after {} rows", fetched);
            return Ok(());
        }
        fetched += 1;
    }
    debug!("Row reader finished after {} rows", fetched);
    Ok(())
}

/// SQLite endpoint.
///
/// The session identity is the `main` schema. Attached databases are
/// addressed as owners. Writes are wrapped in a transaction opened on first
/// use. Identifiers are rendered upper-case.
pub struct SqliteEndpoint {
    url: String,
    conn: Option<Connection>,
    in_transaction: bool,
    cursor: Option<RowStream>,
    insert: Option<String>,
}

impl SqliteEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            conn: None,
            in_transaction: false,
            cursor: None,
            insert: None,
        }
    }

    fn conn(&self) -> Result<&Connection> {
        if self.conn.is_none() && self.streaming() {
            return Err(CloneError::NotConnected(self.url.clone(), "busy reading rows").into());
        }
        self.conn
            .as_ref()
            .ok_or_else(|| CloneError::NotConnected(self.url.clone(), "not connected").into())
    }

    fn streaming(&self) -> bool {
        self.cursor
            .as_ref()
            .is_some_and(|cursor| cursor.reader.is_some())
    }

    /// Take the connection back from a reader that has stopped.
    async fn reclaim_connection(&mut self) -> Result<()> {
        if let Some(reader) = self.cursor.as_mut().and_then(|c| c.reader.take()) {
            let conn = reader.await.context("SQLite row reader failed")?;
            self.conn = Some(conn);
        }
        Ok(())
    }

    /// Abandon the current cursor, stopping its reader if rows remain.
    async fn finish_cursor(&mut self) -> Result<()> {
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.rows.close();
        }
        self.reclaim_connection().await?;
        self.cursor = None;
        Ok(())
    }

    fn ensure_transaction(&mut self) -> Result<()> {
        if !self.in_transaction {
            self.conn()?
                .execute_batch("BEGIN")
                .context("Failed to begin transaction")?;
            self.in_transaction = true;
        }
        Ok(())
    }

    fn schema_attached(&self, owner: &str) -> Result<bool> {
        let count: i64 = self.conn()?.query_row(
            "SELECT count(*) FROM pragma_database_list WHERE lower(name) = lower(?1)",
            [owner],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

#[async_trait]
impl RowSource for SqliteEndpoint {
    async fn next_row(&mut self) -> Result<Option<Row>> {
        let cursor = self
            .cursor
            .as_mut()
            .ok_or_else(|| CloneError::NotConnected(self.url.clone(), "no active cursor"))?;

        let next = cursor.rows.recv().await;
        match next {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => {
                self.reclaim_connection().await?;
                Err(e)
            }
            None => {
                self.reclaim_connection().await?;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl RowSink for SqliteEndpoint {
    async fn execute_many(&mut self, rows: &[Row]) -> Result<u64> {
        let insert = self
            .insert
            .as_deref()
            .ok_or_else(|| CloneError::NotConnected(self.url.clone(), "no prepared statement"))?;
        let mut stmt = self.conn()?.prepare_cached(insert)?;

        let mut affected = 0u64;
        for row in rows {
            affected += stmt.execute(params_from_iter(row.iter()))? as u64;
        }
        Ok(affected)
    }
}

#[async_trait]
impl Endpoint for SqliteEndpoint {
    fn connection_string(&self) -> &str {
        &self.url
    }

    fn is_active(&self) -> bool {
        self.conn.is_some() || self.streaming()
    }

    fn placeholder(&self, index: usize) -> String {
        format!("?{}", index)
    }

    fn truncate_statement(&self, object: &ObjectDescriptor) -> String {
        format!(
            "DELETE FROM {}.{}",
            quote_ident(object.owner().unwrap_or(MAIN_SCHEMA)),
            quote_ident(object.name().unwrap_or_default())
        )
    }

    async fn connect(&mut self) -> Result<()> {
        if self.is_active() {
            return Ok(());
        }
        let path = sqlite_path(&self.url)?;
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open SQLite database '{}'", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;

        self.conn = Some(conn);
        info!("Connected to '{}'", self.url);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.finish_cursor().await?;
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        self.insert = None;

        if self.in_transaction {
            warn!("Rolling back uncommitted changes on '{}'", self.url);
            self.in_transaction = false;
            conn.execute_batch("ROLLBACK")
                .context("Failed to roll back transaction")?;
        }

        conn.close()
            .map_err(|(_, e)| e)
            .with_context(|| format!("Failed to close '{}'", self.url))
    }

    async fn execute(&mut self, statement: &str, params: &[Param<'_>]) -> Result<u64> {
        self.ensure_transaction()?;
        log_statement(&self.url, statement, params);

        let conn = self.conn()?;
        let affected = if params.is_empty() {
            // DDL and other parameterless statements may hold several commands
            conn.execute_batch(statement)?;
            conn.changes()
        } else {
            conn.execute(statement, params_from_iter(params.iter().map(|(_, v)| v)))? as u64
        };
        Ok(affected)
    }

    async fn query(&mut self, statement: &str) -> Result<usize> {
        self.finish_cursor().await?;
        log_statement(&self.url, statement, &[]);
        let columns = self.conn()?.prepare(statement)?.column_count();

        let conn = self
            .conn
            .take()
            .ok_or_else(|| CloneError::NotConnected(self.url.clone(), "not connected"))?;
        self.cursor = Some(RowStream::start(conn, statement.to_string()));
        Ok(columns)
    }

    async fn current_identity(&mut self) -> Result<String> {
        Ok(MAIN_SCHEMA.to_string())
    }

    async fn count_catalog_matches(&mut self, object: &ObjectDescriptor) -> Result<u64> {
        let owner = object.owner().unwrap_or(MAIN_SCHEMA);
        let Some(kind) = master_type(object.object_type()) else {
            return Ok(0);
        };
        if !self.schema_attached(owner)? {
            debug!("Schema '{}' is not attached on '{}'", owner, self.url);
            return Ok(0);
        }

        let sql = format!(
            "SELECT count(*) FROM {}.sqlite_master WHERE lower(name) = lower(?1) AND type = ?2",
            quote_ident(owner)
        );
        let params: [Param<'_>; 2] = [
            ("name", Value::from(object.name().unwrap_or_default())),
            ("type", Value::from(kind)),
        ];
        log_statement(&self.url, &sql, &params);

        let count: i64 = self
            .conn()?
            .query_row(&sql, params_from_iter(params.iter().map(|(_, v)| v)), |row| {
                row.get(0)
            })
            .with_context(|| format!("Failed to look up {} in catalog", object))?;
        Ok(count as u64)
    }

    async fn ddl(&mut self, object: &ObjectDescriptor) -> Result<String> {
        if object.object_type() != ObjectType::Table {
            bail!("DDL extraction supports tables only, got {}", object);
        }
        let owner = object.owner().unwrap_or(MAIN_SCHEMA);
        let name = object.name().unwrap_or_default();

        let sql = format!(
            "SELECT sql FROM {}.sqlite_master WHERE type = 'table' AND lower(name) = lower(?1)",
            quote_ident(owner)
        );
        log_statement(&self.url, &sql, &[("name", Value::from(name))]);

        let stored: Option<String> = self
            .conn()?
            .query_row(&sql, [name], |row| row.get(0))
            .optional()
            .with_context(|| format!("Failed to read definition of {}", object))?;

        let Some(stored) = stored else {
            bail!("Object {} not found on '{}'", object, self.url);
        };

        let ddl = canonical_table_ddl(
            &self.ident_case().apply(owner),
            &self.ident_case().apply(name),
            &stored,
        )?;
        debug!("Extracted DDL for {}: {}", object, ddl);
        Ok(ddl)
    }

    async fn prepare(&mut self, statement: &str) -> Result<()> {
        self.ensure_transaction()?;
        log_statement(&self.url, statement, &[]);
        // Validate now so a bad statement fails before any row is read
        self.conn()?.prepare_cached(statement)?;
        self.insert = Some(statement.to_string());
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if self.in_transaction {
            self.conn()?
                .execute_batch("COMMIT")
                .context("Failed to commit transaction")?;
            self.in_transaction = false;
        }
        info!("Committed on '{}'", self.url);
        Ok(())
    }
}

/// Replace the header of a stored `CREATE TABLE` statement (everything up to
/// the column list) with `CREATE TABLE "<OWNER>"."<NAME>" `.
///
/// SQLite keeps the statement text as it was written, so the header may be
/// quoted, bracketed or unqualified.
fn canonical_table_ddl(owner: &str, name: &str, stored: &str) -> Result<String> {
    let Some(open) = stored.find('(') else {
        bail!("Stored table definition has no column list: {}", stored);
    };
    Ok(format!(
        "CREATE TABLE \"{}\".\"{}\" {}",
        owner,
        name,
        &stored[open..]
    ))
}
