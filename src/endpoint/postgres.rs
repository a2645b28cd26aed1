// ABOUTME: PostgreSQL endpoint built on tokio-postgres
// ABOUTME: Catalog lookups in pg_catalog, DDL rendering, streamed rows, prepared inserts

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::future::try_join_all;
use futures::TryStreamExt;
use postgres_native_tls::MakeTlsConnector;
use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;
use tokio::task::JoinHandle;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, RowStream, Statement};
use tracing::{debug, error, info, warn};

use super::{log_statement, Endpoint, Param};
use crate::ddl::IdentCase;
use crate::error::CloneError;
use crate::object::{ObjectDescriptor, ObjectType};
use crate::transfer::{RowSink, RowSource};
use crate::utils::{quote_ident, redact_url};
use crate::value::{from_pg_row, Row, Value};

static ALLOW_SELF_SIGNED_CERTS: OnceLock<bool> = OnceLock::new();

/// Set the process-wide TLS certificate policy. Only the first call wins.
pub fn init_tls_policy(allow_self_signed_certs: bool) {
    let _ = ALLOW_SELF_SIGNED_CERTS.set(allow_self_signed_certs);
}

fn allow_self_signed_certs() -> bool {
    ALLOW_SELF_SIGNED_CERTS.get().copied().unwrap_or(false)
}

/// Connect to PostgreSQL and spawn the connection driver.
///
/// TLS is negotiated according to the URL's `sslmode` (tokio-postgres
/// defaults to `prefer`).
pub async fn connect(url: &str) -> Result<(Client, JoinHandle<()>)> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(allow_self_signed_certs())
        .build()
        .context("Failed to build TLS connector")?;
    let tls = MakeTlsConnector::new(connector);

    let (client, connection) = tokio_postgres::connect(url, tls)
        .await
        .with_context(|| format!("Failed to connect to '{}'", redact_url(url)))?;

    let redacted = redact_url(url);
    let handle = tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("Connection error on '{}': {}", redacted, e);
        }
    });

    Ok((client, handle))
}

/// `pg_class.relkind` values matching an object type
fn relkinds(object_type: ObjectType) -> &'static str {
    match object_type {
        ObjectType::Table => "rp",
        ObjectType::View => "v",
        ObjectType::MaterializedView => "m",
        ObjectType::Index => "iI",
        ObjectType::Sequence => "S",
    }
}

/// PostgreSQL endpoint.
///
/// Writes (`execute`, `prepare`, `execute_many`) run inside a transaction that
/// is opened on first use and ended by `commit` or rolled back by `close`.
/// Identifiers are rendered lower-case, matching PostgreSQL's folding of
/// unquoted names.
pub struct PostgresEndpoint {
    url: String,
    client: Option<Client>,
    driver: Option<JoinHandle<()>>,
    in_transaction: bool,
    cursor: Option<Pin<Box<RowStream>>>,
    insert: Option<Statement>,
}

impl PostgresEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: None,
            driver: None,
            in_transaction: false,
            cursor: None,
            insert: None,
        }
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| CloneError::NotConnected(redact_url(&self.url), "not connected").into())
    }

    async fn ensure_transaction(&mut self) -> Result<()> {
        if !self.in_transaction {
            self.client()?
                .batch_execute("BEGIN")
                .await
                .context("Failed to begin transaction")?;
            self.in_transaction = true;
        }
        Ok(())
    }

    /// Run a logged, parameterized catalog query and decode all rows.
    async fn catalog_query(&self, sql: &str, params: &[Param<'_>]) -> Result<Vec<Row>> {
        log_statement(&self.url, sql, params);
        let values: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|(_, value)| value as &(dyn ToSql + Sync))
            .collect();

        let rows = self.client()?.query(sql, &values).await?;
        rows.iter().map(from_pg_row).collect()
    }
}

#[async_trait]
impl RowSource for PostgresEndpoint {
    async fn next_row(&mut self) -> Result<Option<Row>> {
        let cursor = self
            .cursor
            .as_mut()
            .ok_or_else(|| CloneError::NotConnected(redact_url(&self.url), "no active cursor"))?;

        match cursor.try_next().await.context("Failed to fetch row")? {
            Some(row) => Ok(Some(from_pg_row(&row)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RowSink for PostgresEndpoint {
    async fn execute_many(&mut self, rows: &[Row]) -> Result<u64> {
        let client = self.client()?;
        let insert = self.insert.as_ref().ok_or_else(|| {
            CloneError::NotConnected(redact_url(&self.url), "no prepared statement")
        })?;

        execute_pipelined(rows, move |row| async move {
            let params: Vec<&(dyn ToSql + Sync)> =
                row.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
            client.execute(insert, &params).await
        })
        .await
        .context("Failed to insert batch")
    }
}

/// Start one execution per row before awaiting any of them.
///
/// tokio-postgres writes each request as soon as its future is polled, so the
/// whole batch shares the connection's round trips instead of paying one per row.
async fn execute_pipelined<'a, F, Fut, E>(rows: &'a [Row], execute: F) -> Result<u64, E>
where
    F: FnMut(&'a Row) -> Fut,
    Fut: Future<Output = Result<u64, E>>,
{
    let affected = try_join_all(rows.iter().map(execute)).await?;
    Ok(affected.into_iter().sum())
}

#[async_trait]
impl Endpoint for PostgresEndpoint {
    fn connection_string(&self) -> &str {
        &self.url
    }

    fn is_active(&self) -> bool {
        self.client.is_some()
    }

    fn ident_case(&self) -> IdentCase {
        IdentCase::Lower
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    async fn connect(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }
        let (client, driver) = connect(&self.url).await?;
        self.client = Some(client);
        self.driver = Some(driver);
        info!("Connected to '{}'", redact_url(&self.url));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };
        self.cursor = None;
        self.insert = None;

        if self.in_transaction {
            warn!(
                "Rolling back uncommitted changes on '{}'",
                redact_url(&self.url)
            );
            self.in_transaction = false;
            client
                .batch_execute("ROLLBACK")
                .await
                .context("Failed to roll back transaction")?;
        }

        drop(client);
        if let Some(driver) = self.driver.take() {
            // The driver finishes once the client is dropped
            let _ = driver.await;
        }
        Ok(())
    }

    async fn execute(&mut self, statement: &str, params: &[Param<'_>]) -> Result<u64> {
        self.ensure_transaction().await?;
        log_statement(&self.url, statement, params);

        let values: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|(_, value)| value as &(dyn ToSql + Sync))
            .collect();
        let affected = self.client()?.execute(statement, &values).await?;
        Ok(affected)
    }

    async fn query(&mut self, statement: &str) -> Result<usize> {
        log_statement(&self.url, statement, &[]);
        let client = self.client()?;
        let prepared = client.prepare(statement).await?;
        let columns = prepared.columns().len();

        let stream = client.query_raw(&prepared, Vec::<String>::new()).await?;
        self.cursor = Some(Box::pin(stream));
        Ok(columns)
    }

    async fn current_identity(&mut self) -> Result<String> {
        let rows = self
            .catalog_query("SELECT current_schema()::text", &[])
            .await
            .context("Failed to resolve current schema")?;

        match rows.into_iter().next().and_then(|row| row.into_iter().next()) {
            Some(Value::Text(schema)) => Ok(schema.to_lowercase()),
            _ => bail!(
                "No current schema on '{}'; set search_path or qualify the object owner",
                redact_url(&self.url)
            ),
        }
    }

    async fn count_catalog_matches(&mut self, object: &ObjectDescriptor) -> Result<u64> {
        let rows = self
            .catalog_query(
                "SELECT count(*) FROM pg_catalog.pg_class c \
                 JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
                 WHERE upper(n.nspname) = upper($1) \
                   AND upper(c.relname) = upper($2) \
                   AND position(c.relkind::text in $3) > 0",
                &[
                    ("owner", Value::from(object.owner().unwrap_or_default())),
                    ("name", Value::from(object.name().unwrap_or_default())),
                    ("relkinds", Value::from(relkinds(object.object_type()))),
                ],
            )
            .await
            .with_context(|| format!("Failed to look up {} in catalog", object))?;

        match rows.first().and_then(|row| row.first()) {
            Some(Value::Int(count)) => Ok(*count as u64),
            _ => Ok(0),
        }
    }

    async fn ddl(&mut self, object: &ObjectDescriptor) -> Result<String> {
        if object.object_type() != ObjectType::Table {
            bail!("DDL extraction supports tables only, got {}", object);
        }
        let params: [Param<'_>; 2] = [
            ("owner", Value::from(object.owner().unwrap_or_default())),
            ("name", Value::from(object.name().unwrap_or_default())),
        ];

        let columns = self
            .catalog_query(
                "SELECT a.attname::text, pg_catalog.format_type(a.atttypid, a.atttypmod), \
                        a.attnotnull, pg_catalog.pg_get_expr(d.adbin, d.adrelid) \
                 FROM pg_catalog.pg_attribute a \
                 JOIN pg_catalog.pg_class c ON c.oid = a.attrelid \
                 JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
                 LEFT JOIN pg_catalog.pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum \
                 WHERE upper(n.nspname) = upper($1) AND upper(c.relname) = upper($2) \
                   AND c.relkind IN ('r', 'p') AND a.attnum > 0 AND NOT a.attisdropped \
                 ORDER BY a.attnum",
                &params,
            )
            .await
            .with_context(|| format!("Failed to read column definitions of {}", object))?;

        if columns.is_empty() {
            bail!(
                "Object {} not found on '{}'",
                object,
                redact_url(&self.url)
            );
        }

        let storage = self
            .catalog_query(
                "SELECT t.spcname::text, \
                        (SELECT pg_catalog.pg_get_constraintdef(k.oid) FROM pg_catalog.pg_constraint k \
                          WHERE k.conrelid = c.oid AND k.contype = 'p') \
                 FROM pg_catalog.pg_class c \
                 JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
                 LEFT JOIN pg_catalog.pg_tablespace t ON t.oid = c.reltablespace \
                 WHERE upper(n.nspname) = upper($1) AND upper(c.relname) = upper($2) \
                   AND c.relkind IN ('r', 'p')",
                &params,
            )
            .await
            .with_context(|| format!("Failed to read storage definition of {}", object))?;

        let (tablespace, primary_key) = match storage.into_iter().next() {
            Some(mut row) if row.len() == 2 => {
                let primary_key = row.pop();
                let tablespace = row.pop();
                (text_or_none(tablespace), text_or_none(primary_key))
            }
            _ => (None, None),
        };

        let ddl = render_table_ddl(
            &self.ident_case().apply(object.owner().unwrap_or_default()),
            &self.ident_case().apply(object.name().unwrap_or_default()),
            &columns,
            primary_key.as_deref(),
            tablespace.as_deref(),
        )?;
        debug!("Extracted DDL for {}: {}", object, ddl);
        Ok(ddl)
    }

    async fn prepare(&mut self, statement: &str) -> Result<()> {
        self.ensure_transaction().await?;
        log_statement(&self.url, statement, &[]);
        let prepared = self.client()?.prepare(statement).await?;
        self.insert = Some(prepared);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if self.in_transaction {
            self.client()?
                .batch_execute("COMMIT")
                .await
                .context("Failed to commit transaction")?;
            self.in_transaction = false;
        }
        info!("Committed on '{}'", redact_url(&self.url));
        Ok(())
    }
}

fn text_or_none(value: Option<Value>) -> Option<String> {
    match value {
        Some(Value::Text(text)) => Some(text),
        _ => None,
    }
}

/// Render `CREATE TABLE "<owner>"."<name>" (...)` from catalog rows of
/// `(column name, formatted type, not null, default expression)`.
///
/// Defaults drawing from a sequence (`nextval(...)`) are dropped: the
/// sequence belongs to the source database.
fn render_table_ddl(
    owner: &str,
    name: &str,
    columns: &[Row],
    primary_key: Option<&str>,
    tablespace: Option<&str>,
) -> Result<String> {
    let mut definitions = Vec::with_capacity(columns.len() + 1);

    for column in columns {
        let (column_name, data_type, not_null, default) = match column.as_slice() {
            [Value::Text(column_name), Value::Text(data_type), Value::Bool(not_null), default] => {
                (column_name, data_type, *not_null, default)
            }
            other => bail!("Unexpected column catalog row: {:?}", other),
        };

        let mut definition = format!("{} {}", quote_ident(column_name), data_type);
        if let Value::Text(expr) = default {
            if !expr.starts_with("nextval(") {
                definition.push_str(" DEFAULT ");
                definition.push_str(expr);
            }
        }
        if not_null {
            definition.push_str(" NOT NULL");
        }
        definitions.push(definition);
    }

    if let Some(primary_key) = primary_key {
        definitions.push(primary_key.to_string());
    }

    let mut ddl = format!(
        "CREATE TABLE \"{}\".\"{}\" (\n  {}\n)",
        owner,
        name,
        definitions.join(",\n  ")
    );
    if let Some(tablespace) = tablespace {
        ddl.push_str(&format!(" TABLESPACE \"{}\"", tablespace));
    }
    Ok(ddl)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, data_type: &str, not_null: bool, default: Option<&str>) -> Row {
        vec![
            Value::from(name),
            Value::from(data_type),
            Value::Bool(not_null),
            default.map(Value::from).unwrap_or(Value::Null),
        ]
    }

    #[test]
    fn test_render_table_ddl() {
        let columns = vec![
            column("id", "bigint", true, Some("nextval('events_id_seq'::regclass)")),
            column("kind", "text", false, Some("'click'::text")),
            column("payload", "jsonb", false, None),
        ];

        let ddl = render_table_ddl(
            "public",
            "events",
            &columns,
            Some("PRIMARY KEY (id)"),
            Some("fast_ssd"),
        )
        .unwrap();

        assert_eq!(
            ddl,
            "CREATE TABLE \"public\".\"events\" (\n  \
             \"id\" bigint NOT NULL,\n  \
             \"kind\" text DEFAULT 'click'::text,\n  \
             \"payload\" jsonb,\n  \
             PRIMARY KEY (id)\n) TABLESPACE \"fast_ssd\""
        );
    }

    #[test]
    fn test_render_without_tablespace() {
        let ddl = render_table_ddl("app", "t", &[column("x", "integer", false, None)], None, None)
            .unwrap();

        assert!(!ddl.contains("TABLESPACE"));
        assert!(ddl.starts_with("CREATE TABLE \"app\".\"t\" ("));
    }

    #[test]
    fn test_relkinds() {
        assert_eq!(relkinds(ObjectType::Table), "rp");
        assert_eq!(relkinds(ObjectType::View), "v");
    }

    #[tokio::test]
    async fn test_batch_rows_are_in_flight_together() {
        let rows: Vec<Row> = (0..5).map(|i| vec![Value::Int(i)]).collect();
        // Only releases once every row's execution has started
        let barrier = tokio::sync::Barrier::new(rows.len());
        let barrier = &barrier;

        let affected = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            execute_pipelined(&rows, move |_| async move {
                barrier.wait().await;
                Ok::<u64, std::convert::Infallible>(1)
            }),
        )
        .await
        .expect("batch executed one row at a time")
        .unwrap();

        assert_eq!(affected, 5);
    }

    #[tokio::test]
    async fn test_batch_stops_on_first_failed_row() {
        let rows: Vec<Row> = (0..3).map(|i| vec![Value::Int(i)]).collect();

        let err = execute_pipelined(&rows, |row| {
            let failed = row[0] == Value::Int(1);
            async move {
                if failed {
                    Err("duplicate key")
                } else {
                    Ok(1)
                }
            }
        })
        .await
        .unwrap_err();

        assert_eq!(err, "duplicate key");
    }

    #[test]
    fn test_placeholders_and_case() {
        let endpoint = PostgresEndpoint::new("postgresql://u@h/db");
        assert_eq!(endpoint.placeholder(3), "$3");
        assert_eq!(endpoint.ident_case(), IdentCase::Lower);
    }
}
