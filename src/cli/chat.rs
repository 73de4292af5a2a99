use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use console::style;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use crate::api::ParserType;
use crate::config::Config;
use crate::lifecycle::ModelStatus;
use crate::resolver::Level;
use crate::session::{Action, Outcome, Session};

const HELP: &str = "\
  /provider <name>        LLM provider
  /model <name>           LLM model of the provider
  /embedding [category]   embedding category (no argument clears)
  /sub [provider]         embedding provider (no argument clears)
  /emb-model [model]      embedding model (no argument clears)
  /db <type>              vector database
  /db-set <param> <value> vector database parameter
  /top-k <n>              chunks to retrieve
  /file [path]            document to ask about (no argument clears)
  /upload [llama]         upload the document for indexing
  /summarize              summarize the document
  /pull /cancel /delete   manage the selected backend model
  /status                 show the current selection
  /quit                   leave
  anything else is sent as a question";

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Empty,
    Query(String),
    Action(Action),
    Upload(Option<ParserType>),
    Summarize,
    Status,
    Help,
    Quit,
}

/// Parse one line typed in the chat.
pub fn parse(line: &str) -> Result<Input, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Input::Empty);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Input::Query(line.to_string()));
    };

    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };
    let select = |level: Level| Input::Action(Action::Select { level, value: rest.to_string() });
    let required = |what: &str| -> Result<(), String> {
        if rest.is_empty() {
            Err(format!("usage: /{name} <{what}>"))
        } else {
            Ok(())
        }
    };

    let input = match name {
        "provider" => {
            required("name")?;
            select(Level::LlmProvider)
        }
        "model" => {
            required("name")?;
            select(Level::LlmModel)
        }
        "embedding" => select(Level::EmbeddingCategory),
        "sub" => select(Level::EmbeddingSubcategory),
        "emb-model" => select(Level::EmbeddingModel),
        "db" => {
            required("type")?;
            select(Level::VectorDb)
        }
        "db-set" => {
            let Some((param, value)) = rest.split_once(char::is_whitespace) else {
                return Err("usage: /db-set <param> <value>".into());
            };
            Input::Action(Action::Select {
                level: Level::VectorDbParam(param.to_string()),
                value: value.trim().to_string(),
            })
        }
        "top-k" => {
            let top_k = rest
                .parse::<usize>()
                .map_err(|_| format!("not a number: '{rest}'"))?;
            Input::Action(Action::SetTopK(top_k))
        }
        "file" if rest.is_empty() => Input::Action(Action::ClearFile),
        "file" => Input::Action(Action::SetFile(PathBuf::from(rest))),
        "upload" => match rest {
            "" => Input::Upload(None),
            "llama" => Input::Upload(Some(ParserType::Llama)),
            "custom" => Input::Upload(Some(ParserType::Custom)),
            other => return Err(format!("unknown parser '{other}' (llama or custom)")),
        },
        "summarize" => Input::Summarize,
        "pull" => Input::Action(Action::ConfirmPull(true)),
        "cancel" => Input::Action(Action::CancelPull),
        "delete" => Input::Action(Action::DeleteModel),
        "check" => Input::Action(Action::CheckModel),
        "status" => Input::Status,
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => return Err(format!("unknown command '/{other}', try /help")),
    };
    Ok(input)
}

struct Chat {
    session: Session,
    parser: ParserType,
    /// Model waiting for a yes/no answer to the pull prompt.
    awaiting: Option<String>,
    /// Pulls started here, announced when they finish.
    pulling: HashSet<String>,
}

impl Chat {
    async fn handle(&mut self, input: Input) -> bool {
        match input {
            Input::Empty => {}
            Input::Quit => return false,
            Input::Help => println!("{HELP}"),
            Input::Status => self.print_status(),
            Input::Query(query) => match self.session.ask(&query).await {
                Ok(answer) => super::ask::print_answer(self.session.api(), &answer),
                Err(e) => error(e),
            },
            Input::Summarize => match self.session.summarize().await {
                Ok(answer) => super::ask::print_answer(self.session.api(), &answer),
                Err(e) => error(e),
            },
            Input::Upload(parser) => {
                let parser = parser.unwrap_or(self.parser);
                match self.session.upload(parser).await {
                    Ok(message) => println!("{} {message}", style("✓").green().bold()),
                    Err(e) => error(e),
                }
            }
            Input::Action(action) => {
                let pull = matches!(action, Action::ConfirmPull(true));
                if pull && !self.ready_to_pull().await {
                    return true;
                }
                match self.session.dispatch(action).await {
                    Ok(outcome) => self.report(outcome, pull),
                    Err(e) => error(e),
                }
            }
        }
        true
    }

    /// `/pull` outside the prompt: re-check first, a pull needs the model
    /// to be known missing.
    async fn ready_to_pull(&mut self) -> bool {
        let awaiting = Some(ModelStatus::AwaitingUserConfirmation);
        if self.session.model_status() == awaiting {
            return true;
        }
        match self.session.dispatch(Action::CheckModel).await {
            Ok(_) if self.session.model_status() == awaiting => true,
            Ok(outcome) => {
                self.report(outcome, false);
                false
            }
            Err(e) => {
                error(e);
                false
            }
        }
    }

    async fn answer_prompt(&mut self, model: String, accepted: bool) {
        if self.session.selection().llm_model != model {
            return;
        }
        match self.session.dispatch(Action::ConfirmPull(accepted)).await {
            Ok(outcome) => self.report(outcome, accepted),
            Err(e) => error(e),
        }
    }

    fn ask_pull(&mut self, model: String) {
        print!("Model \"{model}\" is not installed. Do you want to pull it? [y/N] ");
        self.awaiting = Some(model);
    }

    /// Put the pull question back after other input was handled, unless
    /// that input already settled it.
    fn resume_prompt(&mut self, model: String) {
        if self.awaiting.is_some() || self.session.selection().llm_model != model {
            return;
        }
        if self.session.model_status() == Some(ModelStatus::AwaitingUserConfirmation) {
            self.ask_pull(model);
        }
    }

    fn report(&mut self, outcome: Outcome, pull: bool) {
        let (model, status) = match outcome {
            Outcome::Selected { model_status: Some(status), .. } => {
                self.print_selection();
                (self.session.selection().llm_model.clone(), status)
            }
            Outcome::Selected { .. } => {
                self.print_selection();
                return;
            }
            Outcome::Model { model, status } => (model, status),
        };

        match status {
            ModelStatus::AwaitingUserConfirmation => self.ask_pull(model),
            ModelStatus::Downloading => {
                if pull {
                    self.pulling.insert(model.clone());
                }
                println!("{} Pulling {model}...", style("📥").bold());
            }
            ModelStatus::Downloaded => println!("{} {model} is installed", style("✓").green().bold()),
            ModelStatus::Error => {
                let message = self
                    .session
                    .controller()
                    .snapshot(&model)
                    .and_then(|s| s.last_error)
                    .unwrap_or_else(|| "unknown error".into());
                println!("{} {model}: {message}", style("✗").red().bold());
            }
            other => println!("  {} {model}: {other}", style("→").dim()),
        }
    }

    fn announce(&mut self, model: &str, status: ModelStatus, message: Option<String>) {
        if !self.pulling.contains(model) {
            return;
        }
        match status {
            ModelStatus::Downloaded => {
                self.pulling.remove(model);
                println!("\n{} Model {model} is now available", style("✓").green().bold());
            }
            ModelStatus::Error => {
                self.pulling.remove(model);
                println!(
                    "\n{} Pull of {model} failed: {}",
                    style("✗").red().bold(),
                    message.unwrap_or_default()
                );
            }
            ModelStatus::Idle => {
                self.pulling.remove(model);
            }
            _ => {}
        }
    }

    fn print_selection(&self) {
        let s = self.session.selection();
        let params: Vec<String> = s.vector_db_config.iter().map(|(k, v)| format!("{k}={v}")).collect();
        println!(
            "  {} {}/{} · {} · {} {} · k={}{}",
            style("→").dim(),
            s.llm_provider,
            s.llm_model,
            s.embedding_model.as_deref().unwrap_or("no embedding"),
            s.vector_db,
            params.join(" "),
            s.top_k,
            s.file
                .as_ref()
                .map(|f| format!(" · {}", f.display()))
                .unwrap_or_default()
        );
    }

    fn print_status(&self) {
        self.print_selection();
        if let Some(status) = self.session.model_status() {
            println!("  Model status: {status}");
        }
        for snap in self.session.controller().snapshots() {
            let polling = if snap.polling { " (polling)" } else { "" };
            println!(
                "    {}: {}{} since {}",
                snap.model,
                snap.status,
                polling,
                snap.changed_at.format("%H:%M:%S")
            );
        }
    }
}

/// A line typed while the pull question is open. `None` when it is not a
/// yes/no answer and should be handled as ordinary input.
fn prompt_answer(line: &str) -> Option<bool> {
    match line.trim().to_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "" | "n" | "no" => Some(false),
        _ => None,
    }
}

fn error(e: impl std::fmt::Display) {
    println!("{} {e}", style("Error:").red().bold());
}

fn prompt(awaiting: bool) {
    if !awaiting {
        print!("{} ", style(">").cyan().bold());
    }
    let _ = std::io::stdout().flush();
}

pub async fn run(cfg: &Config) -> Result<()> {
    let session = super::open_session(cfg)?;
    let mut events = session.subscribe();
    let mut chat = Chat {
        session,
        parser: cfg.parser,
        awaiting: None,
        pulling: HashSet::new(),
    };

    println!("{} connected to {}", style("ragdesk").bold(), chat.session.api().base_url());
    println!("  {}", style("/help for commands").dim());
    chat.print_selection();
    if chat.session.model_is_managed() {
        chat.handle(Input::Action(Action::CheckModel)).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt(chat.awaiting.is_some());
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let pending = chat.awaiting.take();
                if let (Some(model), Some(accepted)) = (&pending, prompt_answer(&line)) {
                    chat.answer_prompt(model.clone(), accepted).await;
                    continue;
                }
                match parse(&line) {
                    Ok(input) => {
                        if !chat.handle(input).await {
                            break;
                        }
                    }
                    Err(message) => error(message),
                }
                if let Some(model) = pending {
                    chat.resume_prompt(model);
                }
            }
            event = events.recv() => match event {
                Ok(change) => chat.announce(&change.model, change.status, change.message),
                Err(RecvError::Lagged(n)) => tracing::debug!("Missed {n} status updates"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    chat.session.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(line: &str) -> Action {
        match parse(line).unwrap() {
            Input::Action(action) => action,
            other => panic!("{line}: expected an action, got {other:?}"),
        }
    }

    #[test]
    fn test_plain_text_is_a_query() {
        assert_eq!(parse("  what is the revenue? ").unwrap(), Input::Query("what is the revenue?".into()));
        assert_eq!(parse("   ").unwrap(), Input::Empty);
    }

    #[test]
    fn test_selection_commands() {
        assert_eq!(
            action("/model Gemma 2 - 2B"),
            Action::Select { level: Level::LlmModel, value: "Gemma 2 - 2B".into() }
        );
        assert_eq!(
            action("/db-set environment us-west-1"),
            Action::Select {
                level: Level::VectorDbParam("environment".into()),
                value: "us-west-1".into()
            }
        );
        assert_eq!(
            action("/embedding"),
            Action::Select { level: Level::EmbeddingCategory, value: String::new() }
        );
        assert_eq!(action("/top-k 7"), Action::SetTopK(7));
        assert_eq!(action("/file"), Action::ClearFile);
        assert_eq!(action("/file ./Q3 report.pdf"), Action::SetFile(PathBuf::from("./Q3 report.pdf")));
    }

    #[test]
    fn test_model_commands() {
        assert_eq!(action("/pull"), Action::ConfirmPull(true));
        assert_eq!(action("/cancel"), Action::CancelPull);
        assert_eq!(action("/delete"), Action::DeleteModel);
        assert_eq!(parse("/upload llama").unwrap(), Input::Upload(Some(ParserType::Llama)));
        assert_eq!(parse("/quit").unwrap(), Input::Quit);
    }

    #[test]
    fn test_prompt_answers() {
        assert_eq!(prompt_answer("y"), Some(true));
        assert_eq!(prompt_answer(" YES "), Some(true));
        assert_eq!(prompt_answer("n"), Some(false));
        assert_eq!(prompt_answer(""), Some(false));
        // commands and questions typed at the prompt are not answers
        assert_eq!(prompt_answer("/status"), None);
        assert_eq!(prompt_answer("/pull"), None);
        assert_eq!(prompt_answer("what is in the report?"), None);
    }

    #[test]
    fn test_bad_commands() {
        assert!(parse("/provider").is_err());
        assert!(parse("/db-set mode").is_err());
        assert!(parse("/top-k many").is_err());
        assert!(parse("/upload fancy").is_err());
        assert!(parse("/frobnicate").unwrap_err().contains("/help"));
    }
}
