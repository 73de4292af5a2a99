//! Routes user actions to the resolver and the model lifecycle, and builds
//! outbound requests from the current selection.

use std::path::PathBuf;
use std::sync::Arc;

use crate::api::{self, Answer, ApiClient, ApiError, ParserType, QueryRequest, UploadRequest};
use crate::lifecycle::{Controller, LifecycleError, ModelStatus, StatusChange};
use crate::resolver::{Change, Level, ResolveError, Resolver, Selection};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("no file selected; choose a PDF first")]
    NoFile,
    #[error("query is empty")]
    EmptyQuery,
    #[error("provider '{0}' does not host models on the backend")]
    Unmanaged(String),
}

/// A user action.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Select { level: Level, value: String },
    SetTopK(usize),
    SetFile(PathBuf),
    ClearFile,
    /// Re-run the install check for the selected model.
    CheckModel,
    /// Answer to the "pull this model?" prompt.
    ConfirmPull(bool),
    CancelPull,
    DeleteModel,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Selected {
        change: Change,
        /// Install status when the change selected a managed model.
        model_status: Option<ModelStatus>,
    },
    Model {
        model: String,
        status: ModelStatus,
    },
}

pub struct Session {
    resolver: Resolver,
    controller: Controller,
    api: Arc<ApiClient>,
}

impl Session {
    pub fn new(resolver: Resolver, controller: Controller, api: Arc<ApiClient>) -> Self {
        Self { resolver, controller, api }
    }

    pub fn selection(&self) -> &Selection {
        self.resolver.current()
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StatusChange> {
        self.controller.subscribe()
    }

    /// Whether the selected LLM goes through the install lifecycle.
    pub fn model_is_managed(&self) -> bool {
        self.resolver
            .catalog()
            .is_managed(&self.resolver.current().llm_provider)
    }

    /// Install status of the selected model, `None` for hosted providers.
    pub fn model_status(&self) -> Option<ModelStatus> {
        self.model_is_managed()
            .then(|| self.controller.status(&self.resolver.current().llm_model))
    }

    pub async fn dispatch(&mut self, action: Action) -> Result<Outcome, SessionError> {
        match action {
            Action::Select { level, value } => {
                let change = self.resolver.select(level, &value)?;
                self.on_change(change).await
            }
            Action::SetTopK(top_k) => {
                let change = self.resolver.set_top_k(top_k)?;
                self.on_change(change).await
            }
            Action::SetFile(path) => {
                let change = self.resolver.set_file(path);
                self.on_change(change).await
            }
            Action::ClearFile => {
                let change = self.resolver.clear_file();
                self.on_change(change).await
            }
            Action::CheckModel => {
                let model = self.managed_model()?;
                let status = self.controller.check_status(&model).await?;
                Ok(Outcome::Model { model, status })
            }
            Action::ConfirmPull(accepted) => {
                let model = self.managed_model()?;
                let status = if accepted {
                    self.controller.confirm_pull(&model)?
                } else {
                    self.controller.decline_pull(&model)?
                };
                Ok(Outcome::Model { model, status })
            }
            Action::CancelPull => {
                let model = self.managed_model()?;
                let status = self.controller.cancel_pull(&model).await?;
                Ok(Outcome::Model { model, status })
            }
            Action::DeleteModel => {
                let model = self.managed_model()?;
                let status = self.controller.delete_model(&model).await?;
                Ok(Outcome::Model { model, status })
            }
        }
    }

    async fn on_change(&mut self, change: Change) -> Result<Outcome, SessionError> {
        let model_status = match &change {
            Change::LlmModel { model, managed, .. } => {
                self.controller.release_inactive(model);
                if *managed {
                    match self.controller.check_status(model).await {
                        Ok(status) => Some(status),
                        Err(e) => {
                            // The selection itself stands; the failure is
                            // visible as the model's Error status.
                            tracing::warn!("Install check for {model} failed: {e}");
                            Some(self.controller.status(model))
                        }
                    }
                } else {
                    None
                }
            }
            _ => None,
        };
        Ok(Outcome::Selected { change, model_status })
    }

    fn managed_model(&self) -> Result<String, SessionError> {
        let current = self.resolver.current();
        if !self.model_is_managed() {
            return Err(SessionError::Unmanaged(current.llm_provider.clone()));
        }
        Ok(current.llm_model.clone())
    }

    /// `POST /query` payload for `query` under the current selection.
    pub fn query_request(&self, query: &str) -> Result<QueryRequest, SessionError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(SessionError::EmptyQuery);
        }
        let s = self.resolver.current();
        Ok(QueryRequest {
            provider: s.llm_provider.clone(),
            model: s.llm_model.clone(),
            query: query.to_string(),
            top_k: s.top_k,
            db_type: s.vector_db.clone(),
            db_config: s.vector_db_config.clone(),
            db_filename: s.file.as_deref().map(api::db_filename).unwrap_or_default(),
            embedding_provider: s.embedding_subcategory.clone().unwrap_or_default(),
            embedding_model: s.embedding_model.clone().unwrap_or_default(),
        })
    }

    /// Summaries need a document to summarize.
    pub fn summarize_request(&self) -> Result<QueryRequest, SessionError> {
        if self.resolver.current().file.is_none() {
            return Err(SessionError::NoFile);
        }
        self.query_request(api::SUMMARY_PROMPT)
    }

    pub fn upload_request(&self, parser: ParserType) -> Result<UploadRequest, SessionError> {
        let s = self.resolver.current();
        let file = s.file.clone().ok_or(SessionError::NoFile)?;
        Ok(UploadRequest {
            file,
            embedding_provider: s.embedding_subcategory.clone().unwrap_or_default(),
            embedding_model: s.embedding_model.clone().unwrap_or_default(),
            parser,
            db_type: s.vector_db.clone(),
            db_config: s.vector_db_config.clone(),
        })
    }

    pub async fn ask(&self, query: &str) -> Result<Answer, SessionError> {
        let request = self.query_request(query)?;
        Ok(self.api.query(&request).await?)
    }

    pub async fn summarize(&self) -> Result<Answer, SessionError> {
        let request = self.summarize_request()?;
        Ok(self.api.query(&request).await?)
    }

    pub async fn upload(&self, parser: ParserType) -> Result<String, SessionError> {
        let request = self.upload_request(parser)?;
        Ok(self.api.upload(&request).await?)
    }

    /// Stop every poll loop.
    pub fn shutdown(&self) {
        self.controller.shutdown();
    }
}
