//! Cascading selection resolver.
//!
//! Owns the user's current choice across the three hierarchies
//! (LLM provider → model, embedding category → provider → model, vector
//! database → parameters). Changing any level resets everything below it
//! to the catalog default, so `current()` is always a combination the
//! catalog can resolve.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;

pub const DEFAULT_TOP_K: usize = 3;

/// One selectable level of a hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Level {
    LlmProvider,
    LlmModel,
    EmbeddingCategory,
    EmbeddingSubcategory,
    EmbeddingModel,
    VectorDb,
    VectorDbParam(String),
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::LlmProvider => write!(f, "LLM provider"),
            Level::LlmModel => write!(f, "LLM model"),
            Level::EmbeddingCategory => write!(f, "embedding category"),
            Level::EmbeddingSubcategory => write!(f, "embedding provider"),
            Level::EmbeddingModel => write!(f, "embedding model"),
            Level::VectorDb => write!(f, "vector database"),
            Level::VectorDbParam(name) => write!(f, "vector database parameter '{name}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolveError {
    #[error("'{value}' is not a valid {level}")]
    InvalidOption { level: Level, value: String },
    #[error("cannot choose an {level} before its parent is selected")]
    MissingParent { level: Level },
    #[error("top_k must be at least 1 (got {0})")]
    InvalidTopK(usize),
}

/// The full selection. Every non-empty field resolves against the catalog
/// given its ancestors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Selection {
    pub llm_provider: String,
    pub llm_model: String,
    pub embedding_category: Option<String>,
    pub embedding_subcategory: Option<String>,
    pub embedding_model: Option<String>,
    pub vector_db: String,
    pub vector_db_config: IndexMap<String, String>,
    pub top_k: usize,
    pub file: Option<PathBuf>,
}

/// What a successful selection committed.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// The active LLM model (possibly re-selected). `managed` models need
    /// their install status tracked.
    LlmModel {
        provider: String,
        model: String,
        managed: bool,
    },
    Embedding {
        category: Option<String>,
        subcategory: Option<String>,
        model: Option<String>,
    },
    VectorDb {
        db: String,
        config: IndexMap<String, String>,
    },
    TopK(usize),
    File(Option<PathBuf>),
}

/// Startup selection, usually read from the `[defaults]` table of the
/// config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionDefaults {
    pub llm_provider: String,
    pub llm_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_subcategory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    pub vector_db: String,
    pub vector_db_config: IndexMap<String, String>,
    pub top_k: usize,
}

impl Default for SelectionDefaults {
    fn default() -> Self {
        Self {
            llm_provider: "ollama".to_string(),
            llm_model: "Llama 3.1 - 8B".to_string(),
            embedding_category: Some("sentence_transformers".to_string()),
            embedding_subcategory: Some("sentence_transformers".to_string()),
            embedding_model: Some("all-mpnet-base-v2".to_string()),
            vector_db: "faiss".to_string(),
            vector_db_config: IndexMap::new(),
            top_k: DEFAULT_TOP_K,
        }
    }
}

pub struct Resolver {
    catalog: Arc<Catalog>,
    current: Selection,
}

impl Resolver {
    /// Start from the catalog's canonical defaults: first provider and
    /// model, no embedding choice, first vector database.
    pub fn new(catalog: Arc<Catalog>) -> Self {
        let (provider, model) = catalog.default_llm();
        let db = catalog.default_db().to_string();
        let current = Selection {
            llm_provider: provider.to_string(),
            llm_model: model.to_string(),
            embedding_category: None,
            embedding_subcategory: None,
            embedding_model: None,
            vector_db_config: catalog.default_db_config(&db).unwrap_or_default(),
            vector_db: db,
            top_k: DEFAULT_TOP_K,
            file: None,
        };
        Self { catalog, current }
    }

    /// Apply `defaults` on top of the canonical selection. Defaults that the
    /// catalog can't resolve are skipped with a warning.
    pub fn with_defaults(catalog: Arc<Catalog>, defaults: &SelectionDefaults) -> Self {
        let mut resolver = Self::new(catalog);

        let apply = |result: Result<Change, ResolveError>| {
            if let Err(e) = result {
                tracing::warn!("Ignoring configured default: {e}");
            }
        };

        apply(resolver.select_llm_provider(&defaults.llm_provider));
        apply(resolver.select_llm_model(&defaults.llm_model));
        if let Some(category) = &defaults.embedding_category {
            apply(resolver.select_embedding_category(category));
            if let Some(sub) = &defaults.embedding_subcategory {
                apply(resolver.select_embedding_subcategory(sub));
                if let Some(model) = &defaults.embedding_model {
                    apply(resolver.select_embedding_model(model));
                }
            }
        }
        apply(resolver.select_vector_db(&defaults.vector_db));
        for (param, value) in &defaults.vector_db_config {
            apply(resolver.set_vector_db_param(param, value));
        }
        apply(resolver.set_top_k(defaults.top_k));

        resolver
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn current(&self) -> &Selection {
        &self.current
    }

    /// Generic entry point used by the session dispatcher.
    pub fn select(&mut self, level: Level, value: &str) -> Result<Change, ResolveError> {
        match level {
            Level::LlmProvider => self.select_llm_provider(value),
            Level::LlmModel => self.select_llm_model(value),
            Level::EmbeddingCategory => self.select_embedding_category(value),
            Level::EmbeddingSubcategory => self.select_embedding_subcategory(value),
            Level::EmbeddingModel => self.select_embedding_model(value),
            Level::VectorDb => self.select_vector_db(value),
            Level::VectorDbParam(name) => self.set_vector_db_param(&name, value),
        }
    }

    pub fn select_llm_provider(&mut self, provider: &str) -> Result<Change, ResolveError> {
        let entry = self
            .catalog
            .provider(provider)
            .ok_or_else(|| invalid(Level::LlmProvider, provider))?;
        let model = entry
            .models
            .first()
            .cloned()
            .ok_or_else(|| invalid(Level::LlmProvider, provider))?;

        self.current.llm_provider = provider.to_string();
        self.current.llm_model = model;
        Ok(self.llm_change())
    }

    pub fn select_llm_model(&mut self, model: &str) -> Result<Change, ResolveError> {
        let known = self
            .catalog
            .provider(&self.current.llm_provider)
            .is_some_and(|p| p.models.iter().any(|m| m == model));
        if !known {
            return Err(invalid(Level::LlmModel, model));
        }

        self.current.llm_model = model.to_string();
        Ok(self.llm_change())
    }

    /// An empty `category` clears the whole embedding branch.
    pub fn select_embedding_category(&mut self, category: &str) -> Result<Change, ResolveError> {
        let category = if category.is_empty() {
            None
        } else if self.catalog.embedding_subcategories(category).is_some() {
            Some(category.to_string())
        } else {
            return Err(invalid(Level::EmbeddingCategory, category));
        };

        self.current.embedding_category = category;
        self.current.embedding_subcategory = None;
        self.current.embedding_model = None;
        Ok(self.embedding_change())
    }

    /// An empty `subcategory` clears the subcategory and model.
    pub fn select_embedding_subcategory(&mut self, subcategory: &str) -> Result<Change, ResolveError> {
        let category = self
            .current
            .embedding_category
            .as_deref()
            .ok_or(ResolveError::MissingParent { level: Level::EmbeddingSubcategory })?;

        let (sub, model) = if subcategory.is_empty() {
            (None, None)
        } else {
            let models = self
                .catalog
                .embedding_models(category, subcategory)
                .ok_or_else(|| invalid(Level::EmbeddingSubcategory, subcategory))?;
            (Some(subcategory.to_string()), models.first().cloned())
        };

        self.current.embedding_subcategory = sub;
        self.current.embedding_model = model;
        Ok(self.embedding_change())
    }

    pub fn select_embedding_model(&mut self, model: &str) -> Result<Change, ResolveError> {
        let (Some(category), Some(sub)) = (
            self.current.embedding_category.as_deref(),
            self.current.embedding_subcategory.as_deref(),
        ) else {
            return Err(ResolveError::MissingParent { level: Level::EmbeddingModel });
        };

        let model = if model.is_empty() {
            None
        } else {
            let known = self
                .catalog
                .embedding_models(category, sub)
                .is_some_and(|models| models.iter().any(|m| m == model));
            if !known {
                return Err(invalid(Level::EmbeddingModel, model));
            }
            Some(model.to_string())
        };

        self.current.embedding_model = model;
        Ok(self.embedding_change())
    }

    /// Replaces the parameter map wholesale, including when `db` is the
    /// type already selected.
    pub fn select_vector_db(&mut self, db: &str) -> Result<Change, ResolveError> {
        let config = self
            .catalog
            .default_db_config(db)
            .ok_or_else(|| invalid(Level::VectorDb, db))?;

        self.current.vector_db = db.to_string();
        self.current.vector_db_config = config;
        Ok(self.vector_db_change())
    }

    pub fn set_vector_db_param(&mut self, param: &str, value: &str) -> Result<Change, ResolveError> {
        let level = Level::VectorDbParam(param.to_string());
        let spec = self
            .catalog
            .db_schema(&self.current.vector_db)
            .and_then(|schema| schema.get(param))
            .ok_or_else(|| invalid(Level::VectorDb, param))?;
        if !spec.accepts(value) {
            return Err(invalid(level, value));
        }

        self.current
            .vector_db_config
            .insert(param.to_string(), value.to_string());
        Ok(self.vector_db_change())
    }

    pub fn set_top_k(&mut self, top_k: usize) -> Result<Change, ResolveError> {
        if top_k < 1 {
            return Err(ResolveError::InvalidTopK(top_k));
        }
        self.current.top_k = top_k;
        Ok(Change::TopK(top_k))
    }

    pub fn set_file(&mut self, path: PathBuf) -> Change {
        self.current.file = Some(path);
        Change::File(self.current.file.clone())
    }

    pub fn clear_file(&mut self) -> Change {
        self.current.file = None;
        Change::File(None)
    }

    fn llm_change(&self) -> Change {
        Change::LlmModel {
            provider: self.current.llm_provider.clone(),
            model: self.current.llm_model.clone(),
            managed: self.catalog.is_managed(&self.current.llm_provider),
        }
    }

    fn embedding_change(&self) -> Change {
        Change::Embedding {
            category: self.current.embedding_category.clone(),
            subcategory: self.current.embedding_subcategory.clone(),
            model: self.current.embedding_model.clone(),
        }
    }

    fn vector_db_change(&self) -> Change {
        Change::VectorDb {
            db: self.current.vector_db.clone(),
            config: self.current.vector_db_config.clone(),
        }
    }
}

fn invalid(level: Level, value: &str) -> ResolveError {
    ResolveError::InvalidOption {
        level,
        value: value.to_string(),
    }
}

/// Check that `selection` resolves against `catalog` at every level.
pub fn validate(catalog: &Catalog, selection: &Selection) -> Result<(), ResolveError> {
    let provider = catalog
        .provider(&selection.llm_provider)
        .ok_or_else(|| invalid(Level::LlmProvider, &selection.llm_provider))?;
    if !provider.models.contains(&selection.llm_model) {
        return Err(invalid(Level::LlmModel, &selection.llm_model));
    }

    match (
        &selection.embedding_category,
        &selection.embedding_subcategory,
        &selection.embedding_model,
    ) {
        (None, None, None) => {}
        (Some(category), sub, model) => {
            let subs = catalog
                .embedding_subcategories(category)
                .ok_or_else(|| invalid(Level::EmbeddingCategory, category))?;
            match (sub, model) {
                (None, None) => {}
                (Some(sub), model) => {
                    let models = subs
                        .get(sub)
                        .ok_or_else(|| invalid(Level::EmbeddingSubcategory, sub))?;
                    if let Some(model) = model {
                        if !models.contains(model) {
                            return Err(invalid(Level::EmbeddingModel, model));
                        }
                    }
                }
                (None, Some(_)) => {
                    return Err(ResolveError::MissingParent { level: Level::EmbeddingModel });
                }
            }
        }
        (None, _, _) => {
            return Err(ResolveError::MissingParent { level: Level::EmbeddingSubcategory });
        }
    }

    let schema = catalog
        .db_schema(&selection.vector_db)
        .ok_or_else(|| invalid(Level::VectorDb, &selection.vector_db))?;
    if schema.len() != selection.vector_db_config.len() {
        let stray = selection
            .vector_db_config
            .keys()
            .find(|k| !schema.contains_key(*k))
            .or_else(|| schema.keys().find(|k| !selection.vector_db_config.contains_key(*k)))
            .cloned()
            .unwrap_or_default();
        return Err(invalid(Level::VectorDbParam(stray.clone()), &stray));
    }
    for (param, spec) in schema {
        let value = selection
            .vector_db_config
            .get(param)
            .ok_or_else(|| invalid(Level::VectorDbParam(param.clone()), ""))?;
        if !spec.accepts(value) {
            return Err(invalid(Level::VectorDbParam(param.clone()), value));
        }
    }

    if selection.top_k < 1 {
        return Err(ResolveError::InvalidTopK(selection.top_k));
    }
    Ok(())
}
