use std::sync::Arc;

use anyhow::{Context, Result, bail};
use console::style;
use dialoguer::Confirm;
use tokio::sync::broadcast::error::RecvError;

use crate::config::Config;
use crate::lifecycle::{Controller, ModelStatus};

fn controller(cfg: &Config, name: &str) -> Result<Controller> {
    let catalog = cfg.catalog()?;
    let known = catalog
        .llm
        .values()
        .any(|p| p.managed && p.models.iter().any(|m| m == name));
    if !known {
        tracing::warn!("'{name}' is not a backend-hosted model in the catalog");
    }
    let api = Arc::new(cfg.api_client()?);
    Ok(Controller::new(api, cfg.poll_interval()))
}

fn describe(status: ModelStatus) -> String {
    match status {
        ModelStatus::Downloaded => style("installed ✓").green().to_string(),
        ModelStatus::AwaitingUserConfirmation => style("not installed").yellow().to_string(),
        ModelStatus::Error => style("error").red().to_string(),
        other => other.to_string(),
    }
}

pub async fn check(cfg: &Config, name: &str) -> Result<()> {
    let controller = controller(cfg, name)?;
    let status = controller
        .check_status(name)
        .await
        .with_context(|| format!("Failed to check '{name}'"))?;
    println!("{name}: {}", describe(status));
    Ok(())
}

pub async fn pull(cfg: &Config, name: &str, yes: bool) -> Result<()> {
    let controller = controller(cfg, name)?;
    let status = controller
        .check_status(name)
        .await
        .with_context(|| format!("Failed to check '{name}'"))?;
    if status == ModelStatus::Downloaded {
        println!("{} {name} is already installed", style("✓").green().bold());
        return Ok(());
    }

    let accepted = if yes {
        true
    } else if atty::is(atty::Stream::Stdin) {
        Confirm::new()
            .with_prompt(format!("Model \"{name}\" is not installed. Do you want to pull it?"))
            .default(false)
            .interact()?
    } else {
        bail!("'{name}' is not installed; pass --yes to pull it non-interactively");
    };
    if !accepted {
        controller.decline_pull(name)?;
        println!("  {} Skipped", style("→").dim());
        return Ok(());
    }

    let mut events = controller.subscribe();
    controller.confirm_pull(name)?;
    println!(
        "{} Pulling {name}, checking every {}s (Ctrl-C to cancel)",
        style("📥").bold(),
        cfg.poll_interval().as_secs()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                controller.cancel_pull(name).await.context("Cancel request failed")?;
                println!("{} Pull of {name} canceled", style("→").dim());
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(change) if change.model == name => match change.status {
                    ModelStatus::Downloaded => {
                        println!("{} Model {name} is now available", style("✓").green().bold());
                        return Ok(());
                    }
                    ModelStatus::Error => {
                        bail!(
                            "Pull of {name} failed: {}",
                            change.message.unwrap_or_else(|| "unknown error".into())
                        );
                    }
                    _ => {}
                },
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {
                    if controller.status(name) == ModelStatus::Downloaded {
                        println!("{} Model {name} is now available", style("✓").green().bold());
                        return Ok(());
                    }
                }
                Err(RecvError::Closed) => bail!("Model controller stopped"),
            },
        }
    }
}

pub async fn cancel(cfg: &Config, name: &str) -> Result<()> {
    // A fresh process has no local poll loop; tell the backend directly.
    let api = cfg.api_client()?;
    api.cancel_pull(name)
        .await
        .with_context(|| format!("Failed to cancel pull of '{name}'"))?;
    println!("{} Pull of {name} canceled", style("✓").green().bold());
    Ok(())
}

pub async fn delete(cfg: &Config, name: &str) -> Result<()> {
    let controller = controller(cfg, name)?;
    let status = controller
        .check_status(name)
        .await
        .with_context(|| format!("Failed to check '{name}'"))?;
    if status != ModelStatus::Downloaded {
        println!("{name}: {}", describe(status));
        return Ok(());
    }
    controller
        .delete_model(name)
        .await
        .with_context(|| format!("Failed to delete '{name}'"))?;
    println!("{} Deleted {name}", style("✓").green().bold());
    Ok(())
}
