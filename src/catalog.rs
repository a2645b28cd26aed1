// ABOUTME: Existence checks against an endpoint's catalog
// ABOUTME: An object exists only when exactly one catalog entry matches it

use anyhow::Result;
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::object::ObjectDescriptor;

/// Whether `object` exists at `endpoint`.
///
/// Owner and name are compared case-insensitively. Zero matches and
/// ambiguous matches (more than one) both count as "does not exist".
pub async fn object_exists(endpoint: &mut dyn Endpoint, object: &ObjectDescriptor) -> Result<bool> {
    let matches = endpoint.count_catalog_matches(object).await?;
    debug!(
        "{} matched {} catalog entries on '{}'",
        object,
        matches,
        crate::utils::redact_url(endpoint.connection_string())
    );
    Ok(matches == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::SqliteEndpoint;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_object_exists_is_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.db");
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE Accounts (id INTEGER); CREATE VIEW active AS SELECT 1;")
            .unwrap();

        let mut endpoint = SqliteEndpoint::new(format!("sqlite://{}", path.display()));
        endpoint.connect().await.unwrap();

        let accounts = ObjectDescriptor::parse_qualified("MAIN.ACCOUNTS");
        assert!(object_exists(&mut endpoint, &accounts).await.unwrap());

        // Same name, wrong type
        let view_as_table = ObjectDescriptor::parse_qualified("main.active");
        assert!(!object_exists(&mut endpoint, &view_as_table).await.unwrap());

        let missing = ObjectDescriptor::parse_qualified("main.ledger");
        assert!(!object_exists(&mut endpoint, &missing).await.unwrap());
    }
}
