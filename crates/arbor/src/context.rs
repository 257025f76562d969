//! Runtime context for command execution.
//!
//! The [`RuntimeContext`] holds what every command handler needs: where the
//! database and configuration live, and the global output flags.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use arbor_config::{load_config, ArborConfig};
use arbor_engine::Engine;
use arbor_storage::SqliteStore;

use crate::cli::GlobalArgs;

/// Runtime context passed to every command handler.
#[derive(Debug)]
pub struct RuntimeContext {
    pub db_path: PathBuf,

    /// Directory searched for `arbor.yaml`.
    pub config_dir: PathBuf,

    pub json: bool,
    pub verbose: bool,
    pub quiet: bool,
}

impl RuntimeContext {
    pub fn from_global_args(global: &GlobalArgs) -> Self {
        let config_dir = global
            .config
            .clone()
            .unwrap_or_else(|| parent_dir(&global.db));
        Self {
            db_path: global.db.clone(),
            config_dir,
            json: global.json,
            verbose: global.verbose,
            quiet: global.quiet,
        }
    }

    /// Loads the layered configuration.
    pub fn config(&self) -> Result<ArborConfig> {
        load_config(&self.config_dir)
            .with_context(|| format!("failed to load configuration from {}", self.config_dir.display()))
    }

    /// Opens the existing database behind an engine.
    pub fn open_engine(&self) -> Result<Engine> {
        if !self.db_path.exists() {
            bail!(
                "no arbor database found at {}\nHint: run 'arbor init' to create one",
                self.db_path.display()
            );
        }
        let config = self.config()?;
        let store = SqliteStore::open(&self.db_path)
            .with_context(|| format!("failed to open database: {}", self.db_path.display()))?;
        Ok(Engine::new(Box::new(store), config))
    }
}

/// The directory containing `path`, or `.` for a bare file name.
fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(db: &str, config: Option<&str>) -> GlobalArgs {
        GlobalArgs {
            db: PathBuf::from(db),
            config: config.map(PathBuf::from),
            json: false,
            verbose: false,
            quiet: false,
        }
    }

    #[test]
    fn config_dir_follows_database() {
        let ctx = RuntimeContext::from_global_args(&args("data/forms.db", None));
        assert_eq!(ctx.config_dir, PathBuf::from("data"));

        let ctx = RuntimeContext::from_global_args(&args("arbor.db", None));
        assert_eq!(ctx.config_dir, PathBuf::from("."));
    }

    #[test]
    fn explicit_config_dir_wins() {
        let ctx = RuntimeContext::from_global_args(&args("data/forms.db", Some("etc")));
        assert_eq!(ctx.config_dir, PathBuf::from("etc"));
    }

    #[test]
    fn missing_database_is_reported() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db = tmp.path().join("absent.db");
        let ctx = RuntimeContext::from_global_args(&args(db.to_str().unwrap(), None));
        let err = ctx.open_engine().err().unwrap();
        assert!(err.to_string().contains("arbor init"));
    }
}
