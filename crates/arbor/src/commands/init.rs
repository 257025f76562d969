//! `arbor init` -- create the database and a default configuration file.

use std::fs;

use anyhow::{bail, Context, Result};
use tracing::info;

use arbor_config::{save_config, ArborConfig};
use arbor_config::config::CONFIG_FILE;
use arbor_storage::SqliteStore;

use crate::cli::InitArgs;
use crate::context::RuntimeContext;
use crate::output::output_json;

pub fn run(ctx: &RuntimeContext, args: &InitArgs) -> Result<()> {
    let db_path = &ctx.db_path;

    if db_path.exists() {
        if !args.force {
            bail!(
                "database already exists at {}\nHint: use --force to re-initialize (data loss)",
                db_path.display()
            );
        }
        fs::remove_file(db_path)
            .with_context(|| format!("failed to remove existing database: {}", db_path.display()))?;
    }

    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }

    SqliteStore::open(db_path)
        .with_context(|| format!("failed to create database: {}", db_path.display()))?;

    let config_path = ctx.config_dir.join(CONFIG_FILE);
    let wrote_config = !config_path.exists();
    if wrote_config {
        save_config(&ctx.config_dir, &ArborConfig::default())
            .with_context(|| format!("failed to write {}", config_path.display()))?;
    }
    info!(db = %db_path.display(), config_written = wrote_config, "initialized");

    if ctx.json {
        output_json(&serde_json::json!({
            "db": db_path.display().to_string(),
            "config": config_path.display().to_string(),
            "config_written": wrote_config,
        }));
    } else if !ctx.quiet {
        println!("Initialized arbor database at {}", db_path.display());
        if wrote_config {
            println!("Wrote default configuration to {}", config_path.display());
        }
    }
    Ok(())
}
