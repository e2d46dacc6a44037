/*
 * Copyright (c) 2025 Mongora Project. All rights reserved.
 *
 * Mongora - MongoDB aggregation pipeline to Oracle SQL/JSON translator
 *
 * @file config.rs
 * @brief Translator configuration and per-call options
 */

use serde::{Deserialize, Serialize};

use crate::error::{MongoraError, Result};
use crate::validate::validate_table_name;

/// SQL dialect selector. The extended form enables JSON dot notation,
/// `JSON_VALUE ... RETURNING` and JSON-typed `JSON_TABLE` columns; the base
/// form never assumes those and routes field access through plain
/// `JSON_VALUE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OracleDialect {
    Base,
    #[default]
    Extended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslatorConfig {
    /// Unqualified name of the JSON collection table.
    pub collection: String,
    /// JSON document column of the collection table.
    #[serde(default = "default_data_column")]
    pub data_column: String,
    /// Identity column of the collection table.
    #[serde(default = "default_id_column")]
    pub id_column: String,
    /// Optional schema qualifier prepended to table names.
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub dialect: OracleDialect,
}

fn default_data_column() -> String {
    "data".to_string()
}

fn default_id_column() -> String {
    "id".to_string()
}

impl TranslatorConfig {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            data_column: default_data_column(),
            id_column: default_id_column(),
            schema: None,
            dialect: OracleDialect::default(),
        }
    }

    pub fn with_data_column(mut self, column: impl Into<String>) -> Self {
        self.data_column = column.into();
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_dialect(mut self, dialect: OracleDialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Validates the identifier-bearing fields once, at translator
    /// construction.
    pub fn validate(&self) -> Result<()> {
        validate_table_name(&self.collection)?;
        validate_table_name(&self.data_column)?;
        validate_table_name(&self.id_column)?;
        if let Some(schema) = &self.schema {
            validate_table_name(schema)?;
        }
        Ok(())
    }

    /// Schema-qualified table reference for a collection name.
    pub fn qualified_table(&self, collection: &str) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, collection),
            None => collection.to_string(),
        }
    }
}

/// Per-call rendering options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranslateOptions {
    /// Render literals inline instead of producing bind placeholders.
    #[serde(default)]
    pub inline_binds: bool,
    /// One clause per line instead of a single-line statement.
    #[serde(default)]
    pub pretty: bool,
    /// Optimiser hint text injected as `SELECT /*+ ... */` on the outermost
    /// query.
    #[serde(default)]
    pub oracle_hint: Option<String>,
    /// Fail with UnsupportedOperator instead of emitting placeholder SQL
    /// for known feature gaps.
    #[serde(default)]
    pub strict: bool,
}

impl TranslateOptions {
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::default()
        }
    }
}

/// CLI configuration file shape (TOML).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    pub translator: Option<TranslatorConfig>,
    pub options: Option<TranslateOptions>,
}

impl FileConfig {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            MongoraError::validation("CONFIG_READ", format!("cannot read {}: {}", path, e))
        })?;
        toml::from_str(&text).map_err(|e| {
            MongoraError::validation("CONFIG_PARSE", format!("cannot parse {}: {}", path, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_collection_table_layout() {
        let config = TranslatorConfig::new("orders");
        assert_eq!(config.data_column, "data");
        assert_eq!(config.id_column, "id");
        assert_eq!(config.dialect, OracleDialect::Extended);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn schema_qualification() {
        let config = TranslatorConfig::new("orders").with_schema("app");
        assert_eq!(config.qualified_table("orders"), "app.orders");
        assert_eq!(TranslatorConfig::new("orders").qualified_table("orders"), "orders");
    }

    #[test]
    fn validation_rejects_bad_identifiers() {
        assert!(TranslatorConfig::new("or;ders").validate().is_err());
        assert!(TranslatorConfig::new("orders")
            .with_data_column("js on")
            .validate()
            .is_err());
    }

    #[test]
    fn file_config_parses_toml() {
        let parsed: FileConfig = toml::from_str(
            r#"
            [translator]
            collection = "orders"
            dialect = "base"

            [options]
            pretty = true
            "#,
        )
        .unwrap();
        let translator = parsed.translator.unwrap();
        assert_eq!(translator.collection, "orders");
        assert_eq!(translator.dialect, OracleDialect::Base);
        assert!(parsed.options.unwrap().pretty);
    }
}
