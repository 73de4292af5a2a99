use std::path::Path;

use anyhow::Result;
use console::style;

use crate::config::Config;
use crate::resolver::Resolver;

/// Write a default config to `path` unless one is already there. Flag and
/// environment overrides of the running command are not saved.
fn write_defaults(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    Config::default().save_to(path)?;
    Ok(true)
}

pub fn run(cfg: &Config, init: bool) -> Result<()> {
    let path = Config::config_path()?;

    if init {
        if write_defaults(&path)? {
            println!("{} Wrote {}", style("✓").green().bold(), path.display());
        } else {
            println!("{} {} already exists", style("ℹ").blue(), path.display());
        }
        return Ok(());
    }

    println!("Config file:     {}", path.display());
    println!("Backend:         {}", cfg.api_url);
    println!("Poll interval:   {}s", cfg.poll_interval().as_secs());
    println!("Request timeout: {}s", cfg.request_timeout().as_secs());
    match &cfg.catalog_path {
        Some(p) => println!("Catalog:         {}", p.display()),
        None => println!("Catalog:         built-in"),
    }
    println!("Parser:          {}", cfg.parser.as_str());
    println!();

    // What the defaults resolve to, after invalid entries are dropped
    let resolver = Resolver::with_defaults(cfg.catalog()?, &cfg.defaults);
    let s = resolver.current();
    println!("{}", style("Default selection").bold());
    println!("  LLM:        {} / {}", s.llm_provider, s.llm_model);
    println!(
        "  Embedding:  {} / {} / {}",
        s.embedding_category.as_deref().unwrap_or("-"),
        s.embedding_subcategory.as_deref().unwrap_or("-"),
        s.embedding_model.as_deref().unwrap_or("-"),
    );
    let params: Vec<String> = s.vector_db_config.iter().map(|(k, v)| format!("{k}={v}")).collect();
    println!("  Vector DB:  {} {}", s.vector_db, params.join(" "));
    println!("  Top K:      {}", s.top_k);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_writes_defaults_once() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");

        assert!(write_defaults(&path).unwrap());
        assert_eq!(Config::load_from(&path).unwrap(), Config::default());

        std::fs::write(&path, "api_url = \"http://rag.internal:8000\"\n").unwrap();
        assert!(!write_defaults(&path).unwrap());
        assert_eq!(Config::load_from(&path).unwrap().api_url, "http://rag.internal:8000");
    }
}
