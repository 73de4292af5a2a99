//! Static option catalogs for the three selection hierarchies.
//!
//! Catalogs are plain data: the built-in set is embedded from
//! `default_catalog.toml` and a replacement can be loaded from disk. Every
//! list keeps its declaration order, and its first entry is the default the
//! resolver falls back to when an ancestor selection changes.

use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

const BUILTIN_CATALOG: &str = include_str!("default_catalog.toml");

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse catalog: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid catalog: {0}")]
    Invalid(String),
}

/// Models offered by one LLM provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmProvider {
    /// Models are installed on the backend host and go through the
    /// pull/poll lifecycle before they can answer queries.
    #[serde(default)]
    pub managed: bool,
    pub models: Vec<String>,
}

/// Declared shape of one vector-database parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamSpec {
    /// Enumerated options; the first one is the default.
    Choice(Vec<String>),
    /// Free text. The string is a prompt hint, the default value is empty.
    Text(String),
}

impl ParamSpec {
    pub fn default_value(&self) -> String {
        match self {
            ParamSpec::Choice(options) => options.first().cloned().unwrap_or_default(),
            ParamSpec::Text(_) => String::new(),
        }
    }

    pub fn accepts(&self, value: &str) -> bool {
        match self {
            ParamSpec::Choice(options) => options.iter().any(|o| o == value),
            ParamSpec::Text(_) => true,
        }
    }

    pub fn options(&self) -> Option<&[String]> {
        match self {
            ParamSpec::Choice(options) => Some(options),
            ParamSpec::Text(_) => None,
        }
    }
}

/// Parameter schema of one vector-database type, in declaration order.
pub type DbSchema = IndexMap<String, ParamSpec>;

/// category → provider (subcategory) → models
pub type EmbeddingTree = IndexMap<String, IndexMap<String, Vec<String>>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub llm: IndexMap<String, LlmProvider>,
    #[serde(default)]
    pub embedding: EmbeddingTree,
    pub vector_db: IndexMap<String, DbSchema>,
}

impl Catalog {
    /// The catalog shipped with the binary.
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_toml_str(BUILTIN_CATALOG)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, CatalogError> {
        let catalog: Catalog = toml::from_str(contents)?;
        catalog.check()?;
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let contents = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Every level that has a "first entry" default must be non-empty,
    /// otherwise a cascade reset would have nothing to land on.
    fn check(&self) -> Result<(), CatalogError> {
        if self.llm.is_empty() {
            return Err(CatalogError::Invalid("no LLM providers".into()));
        }
        for (name, provider) in &self.llm {
            if provider.models.is_empty() {
                return Err(CatalogError::Invalid(format!("LLM provider '{name}' has no models")));
            }
        }
        for (category, providers) in &self.embedding {
            for (sub, models) in providers {
                if models.is_empty() {
                    return Err(CatalogError::Invalid(format!(
                        "embedding provider '{category}/{sub}' has no models"
                    )));
                }
            }
        }
        if self.vector_db.is_empty() {
            return Err(CatalogError::Invalid("no vector databases".into()));
        }
        for (db, schema) in &self.vector_db {
            for (param, spec) in schema {
                if let ParamSpec::Choice(options) = spec {
                    if options.is_empty() {
                        return Err(CatalogError::Invalid(format!(
                            "vector db parameter '{db}.{param}' has no options"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn provider(&self, name: &str) -> Option<&LlmProvider> {
        self.llm.get(name)
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.llm.keys().map(String::as_str)
    }

    /// First provider and its first model.
    pub fn default_llm(&self) -> (&str, &str) {
        match self.llm.first() {
            Some((name, provider)) => (
                name.as_str(),
                provider.models.first().map(String::as_str).unwrap_or(""),
            ),
            None => ("", ""),
        }
    }

    pub fn is_managed(&self, provider: &str) -> bool {
        self.llm.get(provider).is_some_and(|p| p.managed)
    }

    pub fn embedding_categories(&self) -> impl Iterator<Item = &str> {
        self.embedding.keys().map(String::as_str)
    }

    pub fn embedding_subcategories(&self, category: &str) -> Option<&IndexMap<String, Vec<String>>> {
        self.embedding.get(category)
    }

    pub fn embedding_models(&self, category: &str, subcategory: &str) -> Option<&[String]> {
        self.embedding
            .get(category)
            .and_then(|subs| subs.get(subcategory))
            .map(Vec::as_slice)
    }

    pub fn db_types(&self) -> impl Iterator<Item = &str> {
        self.vector_db.keys().map(String::as_str)
    }

    pub fn db_schema(&self, db: &str) -> Option<&DbSchema> {
        self.vector_db.get(db)
    }

    pub fn default_db(&self) -> &str {
        self.vector_db.keys().next().map(String::as_str).unwrap_or("")
    }

    /// Fresh config for `db`: exactly the schema's keys, each at its default.
    pub fn default_db_config(&self, db: &str) -> Option<IndexMap<String, String>> {
        self.db_schema(db).map(|schema| {
            schema
                .iter()
                .map(|(param, spec)| (param.clone(), spec.default_value()))
                .collect()
        })
    }
}
