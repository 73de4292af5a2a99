use anyhow::Result;
use console::style;

use crate::catalog::ParamSpec;
use crate::config::Config;

pub fn run(cfg: &Config) -> Result<()> {
    let catalog = cfg.catalog()?;

    println!("{}", style("LLM providers").bold());
    for (name, provider) in &catalog.llm {
        let tag = if provider.managed { " (pulled on the backend)" } else { "" };
        println!("  {}{}", style(name).cyan(), style(tag).dim());
        for model in &provider.models {
            println!("    {model}");
        }
    }
    println!();

    println!("{}", style("Embeddings").bold());
    for (category, providers) in &catalog.embedding {
        println!("  {}", style(category).cyan());
        for (sub, models) in providers {
            println!("    {sub}: {}", models.join(", "));
        }
    }
    println!();

    println!("{}", style("Vector databases").bold());
    for (db, schema) in &catalog.vector_db {
        println!("  {}", style(db).cyan());
        for (param, spec) in schema {
            match spec {
                ParamSpec::Choice(options) => println!("    {param}: {}", options.join(" | ")),
                ParamSpec::Text(hint) => println!("    {param}: <{hint}>"),
            }
        }
    }

    Ok(())
}
