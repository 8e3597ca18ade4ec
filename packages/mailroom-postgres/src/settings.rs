//! Per-store configuration.

use mailroom::{MailroomError, Result};

/// Postgres identifier limit.
const MAX_IDENT_LEN: usize = 63;

/// Connection and naming configuration for one Postgres-backed store.
///
/// The `table` is the base name: the work-item table uses it verbatim, and
/// the join tables derive from it by suffix (`{table}_join`,
/// `{table}_join_member`). An inbox and an outbox in the same database are
/// two settings differing only in `table`.
#[derive(Debug, Clone)]
pub struct PgStoreSettings {
    /// Connection URL (`postgres://...`). Required.
    pub url: String,
    /// Schema qualifying every generated name.
    pub schema: String,
    /// Base table name.
    pub table: String,
    /// Execute the canonical DDL on first contact.
    pub enable_schema_deployment: bool,
    /// Pool sizing.
    pub max_connections: u32,
}

impl PgStoreSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            schema: "public".to_string(),
            table: "outbox".to_string(),
            enable_schema_deployment: false,
            max_connections: 5,
        }
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn deploy_schema(mut self, enable: bool) -> Self {
        self.enable_schema_deployment = enable;
        self
    }

    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Reject malformed connection and name configuration up front, before
    /// any name is interpolated into SQL.
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(MailroomError::Configuration(
                "connection url must not be empty".into(),
            ));
        }
        validate_ident("schema", &self.schema)?;
        validate_ident("table", &self.table)?;
        // The derived member table name must also fit the identifier limit.
        validate_ident("table", &format!("{}_join_member", self.table))?;
        Ok(())
    }

    /// Fully qualified work-item table.
    pub fn work_table(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.table)
    }

    /// Fully qualified join aggregate table.
    pub fn join_table(&self) -> String {
        format!("\"{}\".\"{}_join\"", self.schema, self.table)
    }

    /// Fully qualified join member table.
    pub fn member_table(&self) -> String {
        format!("\"{}\".\"{}_join_member\"", self.schema, self.table)
    }
}

/// Names are interpolated into SQL, so the accepted grammar is strict:
/// ASCII letters, digits, underscore, starting with a letter or underscore.
fn validate_ident(kind: &str, ident: &str) -> Result<()> {
    if ident.is_empty() || ident.len() > MAX_IDENT_LEN {
        return Err(MailroomError::Configuration(format!(
            "{kind} name must be 1..={MAX_IDENT_LEN} characters: '{ident}'"
        )));
    }
    let mut chars = ident.chars();
    let first = chars.next().unwrap();
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(MailroomError::Configuration(format!(
            "{kind} name must start with a letter or underscore: '{ident}'"
        )));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(MailroomError::Configuration(format!(
            "{kind} name may only contain letters, digits, and underscores: '{ident}'"
        )));
    }
    Ok(())
}
