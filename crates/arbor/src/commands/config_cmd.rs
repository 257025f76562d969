//! `arbor config` -- inspect the effective configuration.

use anyhow::{Context, Result};

use arbor_config::config::{CONFIG_FILE, ENV_PREFIX};

use crate::cli::{ConfigArgs, ConfigCommands};
use crate::context::RuntimeContext;
use crate::output::output_json;

pub fn run(ctx: &RuntimeContext, args: &ConfigArgs) -> Result<()> {
    match &args.command {
        ConfigCommands::Show => {
            let config = ctx.config()?;
            if ctx.json {
                output_json(&config);
            } else {
                let yaml = serde_yaml::to_string(&config).context("failed to render configuration")?;
                print!("{yaml}");
            }
        }
        ConfigCommands::Path => {
            let path = ctx.config_dir.join(CONFIG_FILE);
            if ctx.json {
                output_json(&serde_json::json!({
                    "file": path.display().to_string(),
                    "exists": path.exists(),
                    "env_prefix": ENV_PREFIX,
                }));
            } else {
                let state = if path.exists() { "" } else { " (missing; defaults apply)" };
                println!("{}{}", path.display(), state);
                println!("Environment overrides: {ENV_PREFIX}<SECTION>__<KEY>");
            }
        }
    }
    Ok(())
}
