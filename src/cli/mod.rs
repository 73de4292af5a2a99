pub mod ask;
pub mod catalog;
pub mod chat;
pub mod config;
pub mod model;
pub mod upload;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::lifecycle::Controller;
use crate::resolver::Resolver;
use crate::session::Session;

#[derive(Parser)]
#[command(name = "ragdesk", about = "Ask questions about your PDFs through a RAG backend.")]
#[command(version, propagate_version = true)]
pub struct Cli {
    /// Backend URL (overrides api_url from config.toml)
    #[arg(long, global = true, env = "RAGDESK_API_URL")]
    pub api_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// List LLM providers, embedding models and vector databases
    Catalog,

    /// Show the effective configuration
    Config {
        /// Write a config.toml with the default values
        #[arg(long)]
        init: bool,
    },

    /// Ask one question about the selected document
    Ask {
        /// The question
        query: String,

        /// LLM provider (openai, groq, ollama, ...)
        #[arg(short, long)]
        provider: Option<String>,

        /// LLM model of the provider
        #[arg(short, long)]
        model: Option<String>,

        /// Number of chunks to retrieve
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Vector database type
        #[arg(long)]
        db: Option<String>,

        /// Document the question is about
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Summarize an uploaded document
    Summarize {
        file: PathBuf,
    },

    /// Upload a PDF for indexing
    Upload {
        file: PathBuf,

        /// Parse with LlamaParse instead of the built-in parser
        #[arg(long)]
        llama_parser: bool,
    },

    /// Manage models installed on the backend host
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },

    /// Interactive session
    Chat,
}

#[derive(Subcommand)]
pub enum ModelAction {
    /// Show whether a model is installed
    Check { name: String },
    /// Download a model and wait until it is installed
    Pull {
        name: String,

        /// Don't ask for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Cancel a running download
    Cancel { name: String },
    /// Remove an installed model
    Delete { name: String },
}

/// Session over the configured backend, starting from the configured
/// default selection.
pub fn open_session(cfg: &crate::config::Config) -> Result<Session> {
    let catalog = cfg.catalog()?;
    let api = Arc::new(cfg.api_client()?);
    let controller = Controller::new(api.clone(), cfg.poll_interval());
    let resolver = Resolver::with_defaults(catalog, &cfg.defaults);
    Ok(Session::new(resolver, controller, api))
}
