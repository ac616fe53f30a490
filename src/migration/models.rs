//! Statement and policy models
//!
//! A [`Statement`] is an opaque unit of remote mutation. Its [`StatementKind`]
//! is either assigned when the statement is built from a descriptor or
//! inferred from the raw text.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use validator::Validate;

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").expect("identifier pattern"));

static SIMPLE_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_$]*$").expect("simple identifier pattern"));

// `name`, `"Quoted Name"`, optionally schema-qualified
const TABLE_REF: &str = r#"(?:"(?:[^"]|"")+"|[^\s."]+)(?:\.(?:"(?:[^"]|"")+"|[^\s."]+))?"#;

static DISABLE_RLS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)^\s*ALTER\s+TABLE\s+(?:IF\s+EXISTS\s+)?(?:ONLY\s+)?{}\s+DISABLE\s+ROW\s+LEVEL\s+SECURITY",
        TABLE_REF
    ))
    .expect("disable pattern")
});

static ENABLE_RLS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)^\s*ALTER\s+TABLE\s+(?:IF\s+EXISTS\s+)?(?:ONLY\s+)?{}\s+ENABLE\s+ROW\s+LEVEL\s+SECURITY",
        TABLE_REF
    ))
    .expect("enable pattern")
});

static DROP_POLICY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^\s*DROP\s+POLICY\s+(?:IF\s+EXISTS\s+)?("(?:[^"]|"")+"|[^\s"]+)\s+ON\s"#)
        .expect("drop policy pattern")
});

static CREATE_POLICY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^\s*CREATE\s+POLICY\s+("(?:[^"]|"")+"|[^\s"]+)\s+ON\s"#)
        .expect("create policy pattern")
});

/// Whether `name` is a plain Postgres identifier
pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// Quote an identifier unless it is already a simple lowercase one
pub fn quote_ident(name: &str) -> String {
    if SIMPLE_IDENTIFIER.is_match(name) {
        name.to_string()
    } else {
        always_quote(name)
    }
}

/// Quote an identifier unconditionally, doubling embedded quotes
pub fn always_quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn unquote(raw: &str) -> String {
    match raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        Some(inner) => inner.replace("\"\"", "\""),
        None => raw.to_lowercase(),
    }
}

/// A table subject to row-level access rules
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Validate)]
pub struct ProtectedTable {
    #[serde(default = "default_schema")]
    #[validate(custom(function = "validate_identifier"))]
    pub schema: String,
    #[validate(custom(function = "validate_identifier"))]
    pub name: String,
}

fn default_schema() -> String {
    "public".to_string()
}

impl ProtectedTable {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// `schema.table`, quoted where needed
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }
}

impl fmt::Display for ProtectedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Which commands a policy applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyCommand {
    All,
    Select,
    Insert,
    Update,
    Delete,
}

impl PolicyCommand {
    pub fn as_sql(&self) -> &'static str {
        match self {
            PolicyCommand::All => "ALL",
            PolicyCommand::Select => "SELECT",
            PolicyCommand::Insert => "INSERT",
            PolicyCommand::Update => "UPDATE",
            PolicyCommand::Delete => "DELETE",
        }
    }
}

/// One named access-control rule to be created on a protected table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct PolicyDefinition {
    #[validate(length(min = 1, max = 63, message = "Policy name must be between 1 and 63 characters"))]
    pub name: String,
    pub command: PolicyCommand,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub using: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_check: Option<String>,
}

impl PolicyDefinition {
    pub fn create_sql(&self, table: &ProtectedTable) -> String {
        let mut sql = format!(
            "CREATE POLICY {} ON {} FOR {}",
            always_quote(&self.name),
            table.qualified(),
            self.command.as_sql()
        );

        if !self.roles.is_empty() {
            let roles: Vec<String> = self.roles.iter().map(|r| quote_ident(r)).collect();
            sql.push_str(&format!(" TO {}", roles.join(", ")));
        }
        if let Some(ref using) = self.using {
            sql.push_str(&format!(" USING ({})", using));
        }
        if let Some(ref check) = self.with_check {
            sql.push_str(&format!(" WITH CHECK ({})", check));
        }

        sql.push(';');
        sql
    }
}

/// The named policies attached to one protected table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySet {
    pub table: ProtectedTable,
    pub names: BTreeSet<String>,
}

impl PolicySet {
    pub fn new(table: ProtectedTable, names: impl IntoIterator<Item = String>) -> Self {
        Self {
            table,
            names: names.into_iter().collect(),
        }
    }
}

/// What a statement does to its protected table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StatementKind {
    DisableProtection,
    DropPolicy { name: String },
    CreatePolicy { name: String },
    EnableProtection,
    /// Creates the generic execute function itself
    ProvisionExec,
    Raw,
}

impl StatementKind {
    /// Infer the kind of a statement from its text
    pub fn classify(text: &str) -> Self {
        if DISABLE_RLS.is_match(text) {
            StatementKind::DisableProtection
        } else if ENABLE_RLS.is_match(text) {
            StatementKind::EnableProtection
        } else if let Some(caps) = DROP_POLICY.captures(text) {
            StatementKind::DropPolicy {
                name: unquote(&caps[1]),
            }
        } else if let Some(caps) = CREATE_POLICY.captures(text) {
            StatementKind::CreatePolicy {
                name: unquote(&caps[1]),
            }
        } else {
            StatementKind::Raw
        }
    }
}

/// Reconciliation phase a statement belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Disabling,
    Dropping,
    Creating,
    Enabling,
}

impl Phase {
    pub fn of(kind: &StatementKind) -> Option<Phase> {
        match kind {
            StatementKind::DisableProtection => Some(Phase::Disabling),
            StatementKind::DropPolicy { .. } => Some(Phase::Dropping),
            StatementKind::CreatePolicy { .. } => Some(Phase::Creating),
            StatementKind::EnableProtection => Some(Phase::Enabling),
            StatementKind::ProvisionExec | StatementKind::Raw => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Disabling => "disabling",
            Phase::Dropping => "dropping",
            Phase::Creating => "creating",
            Phase::Enabling => "enabling",
        };
        f.write_str(label)
    }
}

/// An immutable unit of remote mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    pub kind: StatementKind,
    pub text: String,
}

impl Statement {
    /// Wrap raw text, inferring its kind
    pub fn raw(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            kind: StatementKind::classify(&text),
            text,
        }
    }

    pub fn disable(table: &ProtectedTable) -> Self {
        Self {
            kind: StatementKind::DisableProtection,
            text: format!("ALTER TABLE {} DISABLE ROW LEVEL SECURITY;", table.qualified()),
        }
    }

    pub fn enable(table: &ProtectedTable) -> Self {
        Self {
            kind: StatementKind::EnableProtection,
            text: format!("ALTER TABLE {} ENABLE ROW LEVEL SECURITY;", table.qualified()),
        }
    }

    pub fn drop_policy(table: &ProtectedTable, name: &str) -> Self {
        Self {
            kind: StatementKind::DropPolicy { name: name.to_string() },
            text: format!("DROP POLICY IF EXISTS {} ON {};", always_quote(name), table.qualified()),
        }
    }

    pub fn create_policy(table: &ProtectedTable, policy: &PolicyDefinition) -> Self {
        Self {
            kind: StatementKind::CreatePolicy {
                name: policy.name.clone(),
            },
            text: policy.create_sql(table),
        }
    }

    pub fn phase(&self) -> Option<Phase> {
        Phase::of(&self.kind)
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Validate a Postgres identifier
pub(crate) fn validate_identifier(name: &str) -> Result<(), validator::ValidationError> {
    if !is_identifier(name) {
        let mut err = validator::ValidationError::new("invalid_identifier");
        err.message = Some(
            format!(
                "Invalid identifier '{}'. Must start with a letter or underscore and contain only letters, digits, underscores.",
                name
            )
            .into(),
        );
        return Err(err);
    }
    Ok(())
}
