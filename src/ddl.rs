// ABOUTME: DDL translation from source catalog rendering to target-ready text
// ABOUTME: Rewrites the qualified object identifier and remaps tablespace clauses

use regex::{NoExpand, Regex};
use std::sync::OnceLock;

use crate::error::CloneError;
use crate::object::ObjectDescriptor;

/// How an endpoint's catalog renders quoted identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentCase {
    /// Identifiers are rendered upper-case (the canonical rendering)
    #[default]
    Upper,
    /// Identifiers are rendered lower-case, as PostgreSQL folds unquoted names
    Lower,
}

impl IdentCase {
    pub fn apply(&self, identifier: &str) -> String {
        match self {
            IdentCase::Upper => identifier.to_uppercase(),
            IdentCase::Lower => identifier.to_lowercase(),
        }
    }
}

fn tablespace_clause() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"TABLESPACE\s+"[^"]*""#).expect("valid tablespace regex"))
}

/// Rewrites DDL extracted from the source endpoint into a statement that can
/// be executed at the target endpoint.
///
/// This is literal text substitution over a single-object definition, not a
/// SQL parser. The output is not validated; malformed SQL only surfaces when
/// the target executes it.
#[derive(Debug, Clone, Copy, Default)]
pub struct DdlTranslator {
    source_case: IdentCase,
    target_case: IdentCase,
}

impl DdlTranslator {
    pub fn new(source_case: IdentCase, target_case: IdentCase) -> Self {
        Self {
            source_case,
            target_case,
        }
    }

    /// Translate `ddl` rendered for `source` into DDL creating `target`.
    ///
    /// 1. `<TYPE> "<OWNER>"."<NAME>"` of the source is replaced by the
    ///    unqualified `<TYPE> "<TARGET_NAME>"`, so the object is created in the
    ///    target session's current schema. The qualified form must occur
    ///    exactly once.
    /// 2. Every `TABLESPACE "<any>"` clause is replaced by the target's
    ///    tablespace option, or removed when the option is unset.
    ///
    /// # Errors
    ///
    /// Returns [`CloneError::UnsupportedDdlShape`] when the qualified source
    /// identifier matches zero or several times.
    pub fn translate(
        &self,
        ddl: &str,
        source: &ObjectDescriptor,
        target: &ObjectDescriptor,
    ) -> Result<String, CloneError> {
        let keyword = source.object_type().keyword();
        let qualified = format!(
            "{} \"{}\".\"{}\"",
            keyword,
            self.source_case.apply(source.owner().unwrap_or_default()),
            self.source_case.apply(source.name().unwrap_or_default())
        );

        let matches = ddl.matches(&qualified).count();
        if matches != 1 {
            return Err(CloneError::UnsupportedDdlShape {
                object: source.to_string(),
                pattern: qualified,
                matches,
            });
        }

        let unqualified = format!(
            "{} \"{}\"",
            target.object_type().keyword(),
            self.target_case.apply(target.name().unwrap_or_default())
        );
        let ddl = ddl.replacen(&qualified, &unqualified, 1);

        let replacement = match &target.options.tablespace {
            Some(tablespace) => format!("TABLESPACE \"{}\"", tablespace),
            None => String::new(),
        };

        Ok(tablespace_clause()
            .replace_all(&ddl, NoExpand(&replacement))
            .into_owned())
    }
}
