//! Schema providers
//!
//! A schema provider returns a textual description of the tables and
//! columns a dataset exposes. The text is fed to the clarification detector
//! and the SQL generator; nothing parses it.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::config::DatasetConfig;

#[async_trait]
pub trait SchemaProvider: Send + Sync {
    async fn describe(&self, dataset: &DatasetConfig) -> Result<String>;
}

/// Serves schema text from configuration, with optional per-dataset overrides.
#[derive(Debug, Clone, Default)]
pub struct StaticSchemaProvider {
    overrides: HashMap<String, String>,
}

impl StaticSchemaProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(mut self, dataset: impl Into<String>, text: impl Into<String>) -> Self {
        self.overrides.insert(dataset.into(), text.into());
        self
    }
}

#[async_trait]
impl SchemaProvider for StaticSchemaProvider {
    async fn describe(&self, dataset: &DatasetConfig) -> Result<String> {
        self.overrides
            .get(&dataset.id)
            .or(dataset.schema_text.as_ref())
            .cloned()
            .ok_or_else(|| anyhow!("no schema text configured for dataset '{}'", dataset.id))
    }
}

#[cfg(feature = "database")]
pub use pg::PgSchemaProvider;

#[cfg(feature = "database")]
mod pg {
    use anyhow::{anyhow, Context, Result};
    use async_trait::async_trait;
    use sqlx::PgPool;

    use super::SchemaProvider;
    use crate::config::DatasetConfig;

    /// Reads column metadata from `information_schema`
    #[derive(Clone)]
    pub struct PgSchemaProvider {
        pool: PgPool,
    }

    impl PgSchemaProvider {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl SchemaProvider for PgSchemaProvider {
        async fn describe(&self, dataset: &DatasetConfig) -> Result<String> {
            let schema = dataset.pg_schema.as_deref().unwrap_or("public");
            let columns: Vec<(String, String, String)> = sqlx::query_as(
                r#"
                SELECT table_name::text, column_name::text, data_type::text
                FROM information_schema.columns
                WHERE table_schema = $1
                ORDER BY table_name, ordinal_position
                "#,
            )
            .bind(schema)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to read schema '{}'", schema))?;

            if columns.is_empty() {
                return Err(anyhow!("schema '{}' has no tables", schema));
            }
            Ok(super::render_tables(&columns))
        }
    }
}

/// Render `(table, column, type)` triples as one line per table.
#[cfg_attr(not(feature = "database"), allow(dead_code))]
fn render_tables(columns: &[(String, String, String)]) -> String {
    let mut out = String::new();
    let mut current: Option<&str> = None;
    for (table, column, data_type) in columns {
        if current != Some(table.as_str()) {
            if current.is_some() {
                out.push_str(")\n");
            }
            out.push_str(table);
            out.push('(');
            current = Some(table.as_str());
        } else {
            out.push_str(", ");
        }
        out.push_str(column);
        out.push(' ');
        out.push_str(data_type);
    }
    if current.is_some() {
        out.push(')');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider_prefers_override() {
        let dataset = DatasetConfig::new("sales").with_schema_text("sales(client_id int)");
        let provider = StaticSchemaProvider::new();
        assert_eq!(
            provider.describe(&dataset).await.unwrap(),
            "sales(client_id int)"
        );

        let provider = provider.with_schema("sales", "sales(client_id int, amount numeric)");
        assert!(provider.describe(&dataset).await.unwrap().contains("amount"));
    }

    #[tokio::test]
    async fn test_static_provider_errors_without_text() {
        let provider = StaticSchemaProvider::new();
        let err = provider
            .describe(&DatasetConfig::new("empty"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_render_tables() {
        let cols = vec![
            ("products".to_string(), "id".to_string(), "integer".to_string()),
            ("sales".to_string(), "client_id".to_string(), "integer".to_string()),
            ("sales".to_string(), "amount".to_string(), "numeric".to_string()),
        ];
        assert_eq!(
            render_tables(&cols),
            "products(id integer)\nsales(client_id integer, amount numeric)"
        );
    }
}
