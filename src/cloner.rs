// ABOUTME: Clone orchestration - validates the object pair and drives both endpoints
// ABOUTME: Existence check, optional DDL creation, truncate, select, batched insert, commit

use anyhow::{Context, Result};
use std::fmt;
use tracing::{debug, info};

use crate::catalog::object_exists;
use crate::ddl::DdlTranslator;
use crate::endpoint::Endpoint;
use crate::error::CloneError;
use crate::object::{ObjectDescriptor, ObjectType};
use crate::transfer::{BatchTransfer, TransferStats};
use crate::utils::{redact_url, same_endpoint};

/// Copies one table from a source endpoint to a target endpoint.
///
/// A cloner is bound to a single source/target pair for its whole life.
/// Construction validates the pair without touching either database.
pub struct Cloner {
    source: Box<dyn Endpoint>,
    source_obj: ObjectDescriptor,
    target: Box<dyn Endpoint>,
    target_obj: ObjectDescriptor,
    select: Option<String>,
    transfer: BatchTransfer,
}

impl Cloner {
    /// Bind `source_obj` at `source` to `target_obj` at `target`.
    ///
    /// # Errors
    ///
    /// - [`CloneError::UnsupportedObjectType`] if either object is not a table
    /// - [`CloneError::MissingSourceName`] if the source object has no name
    /// - [`CloneError::IdenticalSourceAndTarget`] if both sides name the same
    ///   object behind the same connection target
    ///
    /// An unnamed target takes the source object's name.
    pub fn new(
        source: Box<dyn Endpoint>,
        source_obj: ObjectDescriptor,
        target: Box<dyn Endpoint>,
        mut target_obj: ObjectDescriptor,
    ) -> Result<Self, CloneError> {
        for object_type in [source_obj.object_type(), target_obj.object_type()] {
            if object_type != ObjectType::Table {
                return Err(CloneError::UnsupportedObjectType(object_type));
            }
        }

        let Some(source_name) = source_obj.name() else {
            return Err(CloneError::MissingSourceName);
        };
        target_obj.default_name(source_name);

        let cloner = Self {
            source,
            source_obj,
            target,
            target_obj,
            select: None,
            transfer: BatchTransfer::default(),
        };
        cloner.check_distinct()?;
        Ok(cloner)
    }

    /// Replace the default full-table selection with `query`.
    pub fn with_select(mut self, query: impl Into<String>) -> Self {
        self.select = Some(query.into());
        self
    }

    pub fn with_transfer(mut self, transfer: BatchTransfer) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn source_object(&self) -> &ObjectDescriptor {
        &self.source_obj
    }

    pub fn target_object(&self) -> &ObjectDescriptor {
        &self.target_obj
    }

    fn check_distinct(&self) -> Result<(), CloneError> {
        if same_endpoint(
            self.source.connection_string(),
            self.target.connection_string(),
        ) && self.source_obj.same_identity(&self.target_obj)
        {
            return Err(CloneError::identical(
                self.source_obj.to_string(),
                redact_url(self.source.connection_string()),
            ));
        }
        Ok(())
    }

    /// Connect both endpoints and resolve unset owners from each endpoint's
    /// current session identity. Safe to call repeatedly.
    pub async fn connect(&mut self) -> Result<()> {
        self.source.connect().await?;
        self.target.connect().await?;

        resolve_owner(self.source.as_mut(), &mut self.source_obj).await?;
        resolve_owner(self.target.as_mut(), &mut self.target_obj).await?;

        // Owners may only now be known to coincide
        self.check_distinct()?;
        Ok(())
    }

    /// Close both endpoints, attempting the target even if the source fails.
    pub async fn close(&mut self) -> Result<()> {
        let source = self.source.close().await;
        let target = self.target.close().await;
        source.and(target)
    }

    /// Structural definition that would create the target object: the source
    /// DDL with its identifier and tablespace rewritten for the target.
    pub async fn target_ddl(&mut self) -> Result<String> {
        self.connect().await?;
        self.source_obj.options.tablespace = self.target_obj.options.tablespace.clone();

        let ddl = self
            .source
            .ddl(&self.source_obj)
            .await
            .with_context(|| format!("Failed to extract DDL of {}", self.source_obj))?;
        debug!("Source DDL: {}", ddl);

        let translator =
            DdlTranslator::new(self.source.ident_case(), self.target.ident_case());
        Ok(translator.translate(&ddl, &self.source_obj, &self.target_obj)?)
    }

    /// Run the clone end to end and commit the target once all rows are in.
    ///
    /// Nothing is rolled back here on failure: batches already submitted stay
    /// uncommitted at the target until its endpoint is closed.
    pub async fn clone(&mut self) -> Result<TransferStats> {
        self.connect().await?;
        info!("Cloning {}", self);

        if !object_exists(self.target.as_mut(), &self.target_obj).await? {
            if !self.target_obj.options.create_if_not_exists {
                return Err(CloneError::target_missing(
                    self.target_obj.to_string(),
                    redact_url(self.target.connection_string()),
                )
                .into());
            }
            let ddl = self.target_ddl().await?;
            self.target
                .execute(&ddl, &[])
                .await
                .with_context(|| format!("Failed to create {}", self.target_obj))?;
        }

        let select = match &self.select {
            Some(select) => select.clone(),
            None => format!("SELECT * FROM {}", self.source_obj.qualified_name()),
        };

        if self.target_obj.options.truncate {
            let truncate = self.target.truncate_statement(&self.target_obj);
            self.target
                .execute(&truncate, &[])
                .await
                .with_context(|| format!("Failed to truncate {}", self.target_obj))?;
        }

        let columns = self
            .source
            .query(&select)
            .await
            .with_context(|| format!("Failed to select from {}", self.source_obj))?;

        let insert = self.insert_statement(columns);
        self.target
            .prepare(&insert)
            .await
            .with_context(|| format!("Failed to prepare insert into {}", self.target_obj))?;

        let stats = self
            .transfer
            .run(self.source.as_mut(), self.target.as_mut())
            .await?;

        self.target.commit().await?;
        info!(
            "Cloned {} rows in {} batches ({:.2?})",
            stats.rows, stats.batches, stats.elapsed
        );
        Ok(stats)
    }

    fn insert_statement(&self, columns: usize) -> String {
        let slots: Vec<String> = (1..=columns)
            .map(|index| self.target.placeholder(index))
            .collect();
        format!(
            "INSERT INTO {} VALUES({})",
            self.target_obj.qualified_name(),
            slots.join(", ")
        )
    }
}

async fn resolve_owner(endpoint: &mut dyn Endpoint, object: &mut ObjectDescriptor) -> Result<()> {
    if object.owner().is_some() {
        return Ok(());
    }
    let identity = endpoint
        .current_identity()
        .await
        .context("Failed to resolve current session identity")?;
    object.resolve_owner(&identity.to_lowercase());
    debug!("Resolved owner of {}", object);
    Ok(())
}

impl fmt::Display for Cloner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cloner from {} at '{}' to {} at '{}'",
            self.source_obj,
            redact_url(self.source.connection_string()),
            self.target_obj,
            redact_url(self.target.connection_string())
        )
    }
}
