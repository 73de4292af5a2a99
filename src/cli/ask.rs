use std::path::PathBuf;

use anyhow::{Context, Result};
use console::style;

use crate::api::{Answer, ApiClient};
use crate::config::Config;
use crate::lifecycle::ModelStatus;
use crate::resolver::Level;
use crate::session::{Action, Session};

/// Per-invocation changes on top of the configured default selection.
#[derive(Debug, Default)]
pub struct Overrides {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub top_k: Option<usize>,
    pub db: Option<String>,
    pub file: Option<PathBuf>,
}

impl Overrides {
    async fn apply(self, session: &mut Session) -> Result<()> {
        if let Some(provider) = self.provider {
            session.dispatch(Action::Select { level: Level::LlmProvider, value: provider }).await?;
        }
        if let Some(model) = self.model {
            session.dispatch(Action::Select { level: Level::LlmModel, value: model }).await?;
        }
        if let Some(top_k) = self.top_k {
            session.dispatch(Action::SetTopK(top_k)).await?;
        }
        if let Some(db) = self.db {
            session.dispatch(Action::Select { level: Level::VectorDb, value: db }).await?;
        }
        if let Some(file) = self.file {
            session.dispatch(Action::SetFile(file)).await?;
        }
        Ok(())
    }
}

pub async fn run(cfg: &Config, query: &str, overrides: Overrides) -> Result<()> {
    let mut session = super::open_session(cfg)?;
    overrides.apply(&mut session).await?;
    warn_if_not_installed(&mut session).await;

    let answer = session.ask(query).await.context("Query failed")?;
    print_answer(session.api(), &answer);
    Ok(())
}

pub async fn summarize(cfg: &Config, file: PathBuf) -> Result<()> {
    let mut session = super::open_session(cfg)?;
    session.dispatch(Action::SetFile(file)).await?;
    warn_if_not_installed(&mut session).await;

    let answer = session.summarize().await.context("Summarize failed")?;
    print_answer(session.api(), &answer);
    Ok(())
}

/// Managed models must be pulled before they can answer. The query is still
/// sent; the backend reports its own error if the model is missing.
async fn warn_if_not_installed(session: &mut Session) {
    if !session.model_is_managed() {
        return;
    }
    let status = match session.model_status() {
        Some(ModelStatus::Idle) | None => match session.dispatch(Action::CheckModel).await {
            Ok(_) => session.model_status(),
            Err(e) => {
                tracing::warn!("Could not check model status: {e}");
                return;
            }
        },
        status => status,
    };
    if status != Some(ModelStatus::Downloaded) {
        let model = &session.selection().llm_model;
        eprintln!(
            "{} Model '{model}' is not installed on the backend. Run: ragdesk model pull \"{model}\"",
            style("⚠").yellow()
        );
    }
}

pub fn print_answer(api: &ApiClient, answer: &Answer) {
    match answer {
        Answer::Text(text) => {
            for paragraph in text.split("\n\n") {
                println!("{}\n", paragraph.trim_end());
            }
        }
        Answer::Chart { chart_type, image_path } => {
            let kind = if chart_type.is_empty() { "chart" } else { chart_type.as_str() };
            match api.static_url(image_path) {
                Ok(url) => println!("{} {kind}: {url}", style("📊").bold()),
                Err(_) => println!("{} {kind}: {image_path}", style("📊").bold()),
            }
        }
    }
}
