use std::path::PathBuf;

use anyhow::{Context, Result};
use console::style;

use crate::api::ParserType;
use crate::config::Config;
use crate::session::Action;

pub async fn run(cfg: &Config, file: PathBuf, llama_parser: bool) -> Result<()> {
    let parser = if llama_parser { ParserType::Llama } else { cfg.parser };
    let mut session = super::open_session(cfg)?;
    session.dispatch(Action::SetFile(file.clone())).await?;

    let s = session.selection();
    println!(
        "  {} {} → {} ({})",
        style("→").dim(),
        file.display(),
        s.vector_db,
        s.embedding_model.as_deref().unwrap_or("default embedding")
    );

    let message = session
        .upload(parser)
        .await
        .with_context(|| format!("Failed to upload {}", file.display()))?;
    println!("{} {message}", style("✓").green().bold());
    Ok(())
}
