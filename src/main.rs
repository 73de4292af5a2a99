use clap::Parser;
use ragdesk::cli::{self, Cli, Command, ModelAction};
use ragdesk::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries answers; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ragdesk=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = Config::load()?;
    if let Some(url) = cli.api_url {
        cfg.api_url = url;
    }

    match cli.command {
        Command::Catalog => cli::catalog::run(&cfg),
        Command::Config { init } => cli::config::run(&cfg, init),
        Command::Ask { query, provider, model, top_k, db, file } => {
            let overrides = cli::ask::Overrides { provider, model, top_k, db, file };
            cli::ask::run(&cfg, &query, overrides).await
        }
        Command::Summarize { file } => cli::ask::summarize(&cfg, file).await,
        Command::Upload { file, llama_parser } => cli::upload::run(&cfg, file, llama_parser).await,
        Command::Model { action } => match action {
            ModelAction::Check { name } => cli::model::check(&cfg, &name).await,
            ModelAction::Pull { name, yes } => cli::model::pull(&cfg, &name, yes).await,
            ModelAction::Cancel { name } => cli::model::cancel(&cfg, &name).await,
            ModelAction::Delete { name } => cli::model::delete(&cfg, &name).await,
        },
        Command::Chat => cli::chat::run(&cfg).await,
    }
}
