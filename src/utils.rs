// ABOUTME: Connection string helpers shared by endpoints and the cloner
// ABOUTME: URL parsing, password redaction, identifier quoting, endpoint identity

use anyhow::{Context, Result};
use std::fmt;
use std::path::{Component, PathBuf};

use crate::endpoint::sqlite::sqlite_path;

const DEFAULT_PG_PORT: u16 = 5432;

/// Whether the connection string uses a PostgreSQL URL scheme
pub fn is_postgres_url(url: &str) -> bool {
    url.starts_with("postgres://") || url.starts_with("postgresql://")
}

/// The database a PostgreSQL URL points at, without its password.
///
/// Layout: `scheme://[user[:password]@]host[:port]/database[?params]`.
/// The host is kept lower-case.
#[derive(Debug, PartialEq)]
struct PgAddress<'a> {
    scheme: &'a str,
    user: Option<&'a str>,
    host: String,
    port: u16,
    database: &'a str,
    params: Option<&'a str>,
}

impl<'a> PgAddress<'a> {
    fn parse(url: &'a str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .filter(|(scheme, _)| matches!(*scheme, "postgres" | "postgresql"))
            .context("Invalid PostgreSQL URL scheme")?;
        let (rest, params) = match rest.split_once('?') {
            Some((rest, params)) => (rest, Some(params)),
            None => (rest, None),
        };
        let (authority, database) = rest
            .rsplit_once('/')
            .context("Missing database name in URL")?;

        // The last '@' ends the credentials; a password may hold more of them
        let (credentials, location) = match authority.rsplit_once('@') {
            Some((credentials, location)) => (Some(credentials), location),
            None => (None, authority),
        };
        let user = credentials.map(|c| c.split_once(':').map_or(c, |(user, _)| user));

        let (host, port) = match location.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .with_context(|| format!("Invalid port number: {}", port))?,
            ),
            None => (location, DEFAULT_PG_PORT),
        };

        Ok(Self {
            scheme,
            user,
            host: host.to_lowercase(),
            port,
            database,
            params,
        })
    }

    fn same_database(&self, other: &Self) -> bool {
        self.host == other.host
            && self.port == other.port
            && self.database == other.database
            && self.user == other.user
    }
}

impl fmt::Display for PgAddress<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme)?;
        if let Some(user) = self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}:{}/{}", self.host, self.port, self.database)?;
        if let Some(params) = self.params {
            write!(f, "?{}", params)?;
        }
        Ok(())
    }
}

/// Connection string safe to show in logs and error messages
///
/// PostgreSQL URLs lose their password; anything else is returned unchanged.
pub fn redact_url(url: &str) -> String {
    if !is_postgres_url(url) {
        return url.to_string();
    }
    PgAddress::parse(url)
        .map(|address| address.to_string())
        .unwrap_or_else(|_| "<unparseable postgres url>".to_string())
}

/// Database file behind a SQLite connection string, as an absolute path.
///
/// Existing files are resolved through the filesystem; others are made
/// absolute against the working directory. In-memory databases have no file.
fn sqlite_file(url: &str) -> Option<PathBuf> {
    let path = sqlite_path(url).ok()?;
    if path.as_os_str() == ":memory:" {
        return None;
    }
    if let Ok(resolved) = std::fs::canonicalize(&path) {
        return Some(resolved);
    }
    let absolute = std::env::current_dir().ok()?.join(path);
    Some(
        absolute
            .components()
            .filter(|component| !matches!(component, Component::CurDir))
            .collect(),
    )
}

/// Whether two connection strings reach the same database
///
/// PostgreSQL URLs are compared on host (case-insensitive), port (default
/// 5432), database and user; password and query parameters do not affect
/// identity. SQLite connection strings are compared on the file they open.
pub fn same_endpoint(source_url: &str, target_url: &str) -> bool {
    match (is_postgres_url(source_url), is_postgres_url(target_url)) {
        (true, true) => match (PgAddress::parse(source_url), PgAddress::parse(target_url)) {
            (Ok(source), Ok(target)) => source.same_database(&target),
            _ => source_url == target_url,
        },
        (false, false) => match (sqlite_file(source_url), sqlite_file(target_url)) {
            (Some(source), Some(target)) => source == target,
            _ => false,
        },
        _ => false,
    }
}

/// Quote an identifier (schema, table, column) with double quotes
///
/// Embedded quotes are escaped by doubling them.
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}
