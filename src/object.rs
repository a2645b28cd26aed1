// ABOUTME: Schema object descriptors - owner, name, type and clone options
// ABOUTME: Normalizes identifiers to lower case and merges partial option sets

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

use crate::error::CloneError;

/// Kind of schema object.
///
/// Only [`ObjectType::Table`] can be cloned; the other kinds exist so that a
/// misconfigured descriptor is reported as unsupported instead of unparseable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ObjectType {
    #[default]
    Table,
    View,
    MaterializedView,
    Index,
    Sequence,
}

impl ObjectType {
    /// Upper-case keyword used when the type is embedded in SQL text
    pub fn keyword(&self) -> &'static str {
        match self {
            ObjectType::Table => "TABLE",
            ObjectType::View => "VIEW",
            ObjectType::MaterializedView => "MATERIALIZED VIEW",
            ObjectType::Index => "INDEX",
            ObjectType::Sequence => "SEQUENCE",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

impl FromStr for ObjectType {
    type Err = CloneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('_', " ");
        match normalized.as_str() {
            "TABLE" => Ok(ObjectType::Table),
            "VIEW" => Ok(ObjectType::View),
            "MATERIALIZED VIEW" => Ok(ObjectType::MaterializedView),
            "INDEX" => Ok(ObjectType::Index),
            "SEQUENCE" => Ok(ObjectType::Sequence),
            _ => Err(CloneError::InvalidObjectType(s.to_string())),
        }
    }
}

/// Options controlling how an object is cloned.
///
/// Every descriptor owns its own copy; defaults are never shared.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectOptions {
    /// Storage location for a created target table. `None` strips the
    /// tablespace clause from generated DDL.
    pub tablespace: Option<String>,
    /// Clear target rows before transfer
    pub truncate: bool,
    /// Create the target table from source DDL when it does not exist
    pub create_if_not_exists: bool,
}

impl ObjectOptions {
    /// Apply a partial option set over these options.
    ///
    /// Options the patch leaves unspecified keep their current value.
    pub fn merge(mut self, patch: &PartialOptions) -> Self {
        if let Some(tablespace) = &patch.tablespace {
            self.tablespace = Some(tablespace.clone());
        }
        if let Some(truncate) = patch.truncate {
            self.truncate = truncate;
        }
        if let Some(create) = patch.create_if_not_exists {
            self.create_if_not_exists = create;
        }
        self
    }
}

/// Caller-supplied subset of [`ObjectOptions`], as read from a job file or
/// assembled from command-line flags.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialOptions {
    pub tablespace: Option<String>,
    pub truncate: Option<bool>,
    pub create_if_not_exists: Option<bool>,
}

/// Identity and options of a schema object taking part in a clone.
///
/// Owner and name are stored lower-case. Once resolved they are not changed
/// again for the rest of the clone: the setters below only fill in values
/// that are still unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescriptor {
    owner: Option<String>,
    name: Option<String>,
    object_type: ObjectType,
    pub options: ObjectOptions,
}

impl ObjectDescriptor {
    /// Create a table descriptor with default options.
    pub fn new(owner: Option<&str>, name: Option<&str>) -> Self {
        Self {
            owner: owner.map(normalize_identifier),
            name: name.map(normalize_identifier),
            object_type: ObjectType::Table,
            options: ObjectOptions::default(),
        }
    }

    /// Parse `name` or `owner.name`.
    ///
    /// An empty string yields a descriptor with neither owner nor name set.
    pub fn parse_qualified(qualified: &str) -> Self {
        let qualified = qualified.trim();
        match qualified.split_once('.') {
            Some((owner, name)) => Self::new(non_empty(owner), non_empty(name)),
            None => Self::new(None, non_empty(qualified)),
        }
    }

    pub fn with_type(mut self, object_type: ObjectType) -> Self {
        self.object_type = object_type;
        self
    }

    pub fn with_options(mut self, patch: &PartialOptions) -> Self {
        self.options = self.options.merge(patch);
        self
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    /// Set the owner if it is still unresolved.
    ///
    /// Returns `true` when the owner was filled in.
    pub fn resolve_owner(&mut self, owner: &str) -> bool {
        if self.owner.is_some() {
            return false;
        }
        self.owner = Some(normalize_identifier(owner));
        true
    }

    /// Set the name if it is still unset.
    pub fn default_name(&mut self, name: &str) -> bool {
        if self.name.is_some() {
            return false;
        }
        self.name = Some(normalize_identifier(name));
        true
    }

    /// Owner, name and type are pairwise equal.
    ///
    /// Whether both descriptors also live behind the same connection target
    /// is the caller's concern.
    pub fn same_identity(&self, other: &ObjectDescriptor) -> bool {
        self.owner == other.owner
            && self.name == other.name
            && self.object_type == other.object_type
    }

    /// `owner.name` as used in plain generated statements.
    pub fn qualified_name(&self) -> String {
        format!(
            "{}.{}",
            self.owner.as_deref().unwrap_or_default(),
            self.name.as_deref().unwrap_or_default()
        )
    }
}

impl fmt::Display for ObjectDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}.{}",
            self.object_type,
            self.owner.as_deref().unwrap_or("<unresolved>"),
            self.name.as_deref().unwrap_or("<unset>")
        )
    }
}

/// Case-insensitive identifiers are compared in lower case.
pub fn normalize_identifier(identifier: &str) -> String {
    identifier.trim().to_lowercase()
}

fn non_empty(s: &str) -> Option<&str> {
    let s = s.trim();
    (!s.is_empty()).then_some(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers_are_lower_cased() {
        let obj = ObjectDescriptor::new(Some("SCHEME"), Some("Some_Table"));

        assert_eq!(obj.owner(), Some("scheme"));
        assert_eq!(obj.name(), Some("some_table"));
        assert_eq!(obj.object_type(), ObjectType::Table);
        assert_eq!(obj.to_string(), "TABLE scheme.some_table");
    }

    #[test]
    fn test_parse_qualified() {
        let obj = ObjectDescriptor::parse_qualified("HR.Employees");
        assert_eq!(obj.owner(), Some("hr"));
        assert_eq!(obj.name(), Some("employees"));

        let obj = ObjectDescriptor::parse_qualified("employees");
        assert_eq!(obj.owner(), None);
        assert_eq!(obj.name(), Some("employees"));

        let obj = ObjectDescriptor::parse_qualified("");
        assert_eq!(obj.owner(), None);
        assert_eq!(obj.name(), None);
    }

    #[test]
    fn test_options_merge_keeps_unspecified_defaults() {
        let obj = ObjectDescriptor::new(None, Some("t")).with_options(&PartialOptions {
            truncate: Some(true),
            ..Default::default()
        });

        assert!(obj.options.truncate);
        assert!(!obj.options.create_if_not_exists);
        assert_eq!(obj.options.tablespace, None);
    }

    #[test]
    fn test_defaults_are_not_shared_between_descriptors() {
        let mut first = ObjectDescriptor::new(None, Some("a"));
        let second = ObjectDescriptor::new(None, Some("b"));

        first.options.tablespace = Some("USERS".to_string());

        assert_eq!(second.options.tablespace, None);
    }

    #[test]
    fn test_resolved_owner_is_not_overwritten() {
        let mut obj = ObjectDescriptor::new(Some("app"), Some("t"));

        assert!(!obj.resolve_owner("OTHER"));
        assert_eq!(obj.owner(), Some("app"));

        let mut obj = ObjectDescriptor::new(None, Some("t"));
        assert!(obj.resolve_owner("SCOTT"));
        assert_eq!(obj.owner(), Some("scott"));
    }

    #[test]
    fn test_object_type_parsing() {
        assert_eq!("table".parse::<ObjectType>().unwrap(), ObjectType::Table);
        assert_eq!(
            "materialized_view".parse::<ObjectType>().unwrap(),
            ObjectType::MaterializedView
        );
        assert_eq!(
            "synonym".parse::<ObjectType>(),
            Err(CloneError::InvalidObjectType("synonym".to_string()))
        );
    }

    #[test]
    fn test_same_identity_ignores_options() {
        let a = ObjectDescriptor::new(Some("app"), Some("t"));
        let b = ObjectDescriptor::new(Some("APP"), Some("T")).with_options(&PartialOptions {
            truncate: Some(true),
            ..Default::default()
        });

        assert!(a.same_identity(&b));
        assert!(!a.same_identity(&b.clone().with_type(ObjectType::View)));
    }
}
