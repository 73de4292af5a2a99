//! HTTP client for the document QA backend.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::lifecycle::ModelBackend;

/// Fixed prompt sent for a whole-document summary.
pub const SUMMARY_PROMPT: &str = "Please summarize the entire document.";

const NO_RESPONSE: &str = "No response from model.";

#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// Transport failure, non-success status or unreadable body.
    #[error("backend unavailable: {0}")]
    RemoteUnavailable(String),
    #[error("invalid backend URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("failed to read {path}: {reason}")]
    File { path: String, reason: String },
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        ApiError::RemoteUnavailable(e.to_string())
    }
}

/// Body of the pull/cancel/delete model endpoints.
#[derive(Debug, Serialize)]
struct ModelRequest<'a> {
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    installed: bool,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    response: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    message: Option<String>,
}

/// Payload of `POST /query`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryRequest {
    pub provider: String,
    pub model: String,
    pub query: String,
    pub top_k: usize,
    pub db_type: String,
    pub db_config: IndexMap<String, String>,
    pub db_filename: String,
    pub embedding_provider: String,
    pub embedding_model: String,
}

/// Document parser the backend runs on upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParserType {
    /// LlamaParse, for complex layouts.
    Llama,
    /// PyMuPDF + Camelot.
    #[default]
    Custom,
}

impl ParserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParserType::Llama => "LlamaParser",
            ParserType::Custom => "CustomParser",
        }
    }
}

/// Fields of the multipart `POST /add` upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRequest {
    pub file: PathBuf,
    pub embedding_provider: String,
    pub embedding_model: String,
    pub parser: ParserType,
    pub db_type: String,
    pub db_config: IndexMap<String, String>,
}

/// A query answer as the backend shapes it: plain text, or a generated
/// chart served from the backend's static directory.
#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    Text(String),
    Chart { chart_type: String, image_path: String },
}

impl Answer {
    pub fn from_response(response: Option<Value>) -> Self {
        match response {
            Some(Value::String(text)) if !text.is_empty() => Answer::Text(text),
            Some(Value::Object(obj)) => {
                let image_path = obj
                    .get("chart_image_path")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from);
                match image_path {
                    Some(image_path) => Answer::Chart {
                        chart_type: obj
                            .get("chart_type")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        image_path,
                    },
                    None => Answer::Text(Value::Object(obj).to_string()),
                }
            }
            Some(Value::Null) | Some(Value::String(_)) | None => Answer::Text(NO_RESPONSE.to_string()),
            Some(other) => Answer::Text(other.to_string()),
        }
    }
}

/// Name the backend derives the vector index from.
pub fn db_filename(file: &Path) -> String {
    file.file_name()
        .map(|n| n.to_string_lossy().replace(' ', "_"))
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    base: Url,
    http: reqwest::Client,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .user_agent(concat!("ragdesk/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { base, http, timeout })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base.join(path)?)
    }

    /// Where the backend serves a generated chart image.
    pub fn static_url(&self, image_path: &str) -> Result<Url, ApiError> {
        self.endpoint(&format!("static/{}", image_path.trim_start_matches('/')))
    }

    async fn post_model(&self, path: &str, model: &str) -> Result<reqwest::Response, ApiError> {
        // The backend reads `model` from the query string, older deployments
        // from the JSON body; send both.
        let response = self
            .http
            .post(self.endpoint(path)?)
            .query(&[("model", model)])
            .json(&ModelRequest { model })
            .timeout(self.timeout)
            .send()
            .await?;
        ensure_success(response).await
    }

    pub async fn check_model(&self, model: &str) -> Result<bool, ApiError> {
        let response = self
            .http
            .get(self.endpoint("api/check-model")?)
            .query(&[("model", model)])
            .timeout(self.timeout)
            .send()
            .await?;
        let body: CheckResponse = ensure_success(response).await?.json().await?;
        Ok(body.installed)
    }

    /// Start a pull. Returns once the backend has accepted the request; its
    /// streamed progress is drained in the background until the stream ends
    /// or `cancel` fires. The backend keeps pulling only while the stream is
    /// open, so dropping it on cancel is what stops the download.
    pub async fn pull_model(&self, model: &str, cancel: CancellationToken) -> Result<(), ApiError> {
        let response = self
            .http
            .post(self.endpoint("api/pull-model")?)
            .query(&[("model", model)])
            .json(&ModelRequest { model })
            .send()
            .await?;
        let mut response = ensure_success(response).await?;

        let model = model.to_string();
        tokio::spawn(async move {
            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::debug!("Closing pull stream for {model}");
                        break;
                    }
                    chunk = response.chunk() => chunk,
                };
                match chunk {
                    Ok(Some(chunk)) => {
                        for line in String::from_utf8_lossy(&chunk).lines().filter(|l| !l.trim().is_empty()) {
                            if line.starts_with("Error") {
                                tracing::warn!("Pull {model}: {line}");
                            } else {
                                tracing::debug!("Pull {model}: {line}");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!("Pull stream for {model} closed: {e}");
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    pub async fn cancel_pull(&self, model: &str) -> Result<(), ApiError> {
        self.post_model("api/cancel-pull", model).await.map(drop)
    }

    pub async fn delete_model(&self, model: &str) -> Result<(), ApiError> {
        self.post_model("api/delete-model", model).await.map(drop)
    }

    pub async fn query(&self, request: &QueryRequest) -> Result<Answer, ApiError> {
        tracing::debug!(
            "Query provider={} model={} db={} top_k={}",
            request.provider,
            request.model,
            request.db_type,
            request.top_k
        );
        let response = self
            .http
            .post(self.endpoint("query")?)
            .json(request)
            .send()
            .await?;
        let body: QueryResponse = ensure_success(response).await?.json().await?;
        Ok(Answer::from_response(body.response))
    }

    /// Upload a document for indexing. Returns the backend's message.
    pub async fn upload(&self, request: &UploadRequest) -> Result<String, ApiError> {
        let path = request.file.display().to_string();
        let bytes = tokio::fs::read(&request.file).await.map_err(|e| ApiError::File {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let file_name = request
            .file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "document.pdf".to_string());
        let db_config = serde_json::to_string(&request.db_config)
            .map_err(|e| ApiError::RemoteUnavailable(format!("failed to encode db_config: {e}")))?;

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/pdf")?;
        let form = reqwest::multipart::Form::new()
            .part("pdf", part)
            .text("embedding_provider", request.embedding_provider.clone())
            .text("embedding_model", request.embedding_model.clone())
            .text("parser_type", request.parser.as_str())
            .text("db_type", request.db_type.clone())
            .text("db_config", db_config);

        tracing::info!("Uploading {path} ({})", request.parser.as_str());
        let response = self
            .http
            .post(self.endpoint("add")?)
            .multipart(form)
            .send()
            .await?;
        let body: UploadResponse = ensure_success(response).await?.json().await?;
        Ok(body
            .message
            .unwrap_or_else(|| "File uploaded successfully.".to_string()))
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("detail").and_then(Value::as_str).map(String::from))
        .unwrap_or(body);
    Err(ApiError::RemoteUnavailable(format!("HTTP {status}: {detail}")))
}

#[async_trait]
impl ModelBackend for ApiClient {
    async fn is_installed(&self, model: &str) -> Result<bool, ApiError> {
        self.check_model(model).await
    }

    async fn pull(&self, model: &str, cancel: CancellationToken) -> Result<(), ApiError> {
        self.pull_model(model, cancel).await
    }

    async fn cancel(&self, model: &str) -> Result<(), ApiError> {
        self.cancel_pull(model).await
    }

    async fn delete(&self, model: &str) -> Result<(), ApiError> {
        self.delete_model(model).await
    }
}
