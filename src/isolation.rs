//! Tenant isolation configuration
//!
//! Each dataset declares how its tenant filter must appear in generated SQL.
//! Row-level datasets carry the tenant column on the queried table itself;
//! hierarchical datasets reach it through a join table.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Plain or schema-qualified SQL identifier
static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("static regex")
});

static TENANT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("static regex"));

/// How the tenant filter is expressed for a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMethod {
    /// `WHERE <field> = <id>` on the queried rows
    #[default]
    RowLevel,
    /// `<field> = <id>` reached through a join on `filter_table`
    Hierarchical,
}

impl fmt::Display for IsolationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationMethod::RowLevel => write!(f, "row_level"),
            IsolationMethod::Hierarchical => write!(f, "hierarchical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationConfig {
    #[serde(default)]
    pub method: IsolationMethod,
    pub filter_field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_table: Option<String>,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self::row_level("client_id")
    }
}

impl IsolationConfig {
    pub fn row_level(field: impl Into<String>) -> Self {
        Self {
            method: IsolationMethod::RowLevel,
            filter_field: field.into(),
            filter_table: None,
        }
    }

    pub fn hierarchical(field: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            method: IsolationMethod::Hierarchical,
            filter_field: field.into(),
            filter_table: Some(table.into()),
        }
    }

    /// Check identifiers and that hierarchical configs name their join table.
    pub fn validate(&self) -> Result<(), String> {
        if !IDENTIFIER.is_match(&self.filter_field) || self.filter_field.contains('.') {
            return Err(format!(
                "filter_field '{}' is not a plain column name",
                self.filter_field
            ));
        }
        match (&self.method, &self.filter_table) {
            (IsolationMethod::Hierarchical, None) => {
                Err("hierarchical isolation requires filter_table".to_string())
            }
            (_, Some(table)) if !IDENTIFIER.is_match(table) => {
                Err(format!("filter_table '{}' is not a valid identifier", table))
            }
            _ => Ok(()),
        }
    }
}

/// Identifier of the tenant a turn is scoped to
///
/// Restricted to ASCII word characters so it can be embedded in SQL text
/// checks without escaping surprises.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn new(raw: impl Into<String>) -> Result<Self, String> {
        let raw = raw.into();
        if TENANT_ID.is_match(&raw) {
            Ok(Self(raw))
        } else {
            Err(format!("invalid tenant id '{}'", raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when `literal` (a SQL number or quoted string) denotes this tenant.
    pub fn matches_literal(&self, literal: &str) -> bool {
        let value = literal.trim().trim_matches('\'');
        if value == self.0 {
            return true;
        }
        match (value.parse::<i64>(), self.0.parse::<i64>()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl From<i64> for TenantId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl TryFrom<String> for TenantId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
