//! Configuration types and loading for the arbor engine.
//!
//! The main entry point is [`ArborConfig`], which represents the contents of
//! `arbor.yaml`. Configuration is loaded with [`load_config`], which layers
//! built-in defaults, the YAML file and `ARBOR_` environment variables, and
//! saved with [`save_config`].

use std::path::Path;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File name looked up inside the configuration directory.
pub const CONFIG_FILE: &str = "arbor.yaml";

/// Prefix for environment overrides, e.g. `ARBOR_EVALUATION__MAX_DEPTH=8`.
pub const ENV_PREFIX: &str = "ARBOR_";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read or written.
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// The configuration file contained invalid YAML.
    #[error("failed to parse config file: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Merging the configuration layers failed.
    #[error("failed to load configuration: {0}")]
    LayerError(#[from] Box<figment::Error>),

    /// A configuration value was invalid.
    #[error("invalid configuration value for key '{key}': {reason}")]
    InvalidValue {
        /// The configuration key that had an invalid value.
        key: String,
        /// A description of why the value is invalid.
        reason: String,
    },
}

/// A specialized `Result` type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// One rule in the policy that picks a node's active formula when it owns
/// several. Rules are applied in order; each one narrows the candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FormulaPreference {
    /// Prefer formulas with at least one token.
    NonEmptyTokens,
    /// Prefer formulas flagged `isDefault`.
    DefaultFlag,
    /// Prefer the most recently updated formula.
    MostRecent,
}

/// How ids for cloned entities are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdStrategy {
    /// `<templateId>-<n>`.
    #[default]
    Suffix,
    /// `<prefix><base36(sha256(templateId|n))>`.
    Hashed,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Dependency extraction settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExtractionConfig {
    #[serde(default = "default_extraction_depth")]
    pub max_depth: usize,

    /// Scan serialized bodies for prefixed references the structured walk
    /// may have missed.
    #[serde(default = "default_true")]
    pub pattern_scan: bool,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_depth: default_extraction_depth(),
            pattern_scan: true,
        }
    }
}

fn default_extraction_depth() -> usize {
    64
}

fn default_true() -> bool {
    true
}

/// Expression evaluation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EvaluationConfig {
    #[serde(default = "default_evaluation_depth")]
    pub max_depth: usize,

    #[serde(default = "default_formula_selection")]
    pub formula_selection: Vec<FormulaPreference>,

    /// Text shown for unresolved values in traces.
    #[serde(default = "default_empty_display")]
    pub empty_display: String,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            max_depth: default_evaluation_depth(),
            formula_selection: default_formula_selection(),
            empty_display: default_empty_display(),
        }
    }
}

fn default_evaluation_depth() -> usize {
    32
}

fn default_formula_selection() -> Vec<FormulaPreference> {
    vec![
        FormulaPreference::NonEmptyTokens,
        FormulaPreference::DefaultFlag,
        FormulaPreference::MostRecent,
    ]
}

fn default_empty_display() -> String {
    "∅".to_string()
}

/// Id derivation settings for instantiated clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IdsConfig {
    #[serde(default)]
    pub strategy: IdStrategy,

    #[serde(default = "default_hash_prefix")]
    pub hash_prefix: String,

    #[serde(default = "default_hash_length")]
    pub hash_length: usize,
}

impl Default for IdsConfig {
    fn default() -> Self {
        Self {
            strategy: IdStrategy::default(),
            hash_prefix: default_hash_prefix(),
            hash_length: default_hash_length(),
        }
    }
}

fn default_hash_prefix() -> String {
    "occ-".to_string()
}

fn default_hash_length() -> usize {
    12
}

/// Blueprint builder settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlueprintConfig {
    #[serde(default = "default_true")]
    pub use_cache: bool,

    /// Add template nodes discovered from existing clones when the declared
    /// list omits them.
    #[serde(default = "default_true")]
    pub enrich_from_occurrences: bool,
}

impl Default for BlueprintConfig {
    fn default() -> Self {
        Self {
            use_cache: true,
            enrich_from_occurrences: true,
        }
    }
}

/// Repeat instantiation settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RepeatConfig {
    /// Upper bound on occurrences per repeater. A repeater's own
    /// `maxOccurrences` takes precedence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_occurrences: Option<u32>,
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// The complete arbor configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArborConfig {
    #[serde(default)]
    pub extraction: ExtractionConfig,

    #[serde(default)]
    pub evaluation: EvaluationConfig,

    #[serde(default)]
    pub ids: IdsConfig,

    #[serde(default)]
    pub blueprint: BlueprintConfig,

    #[serde(default)]
    pub repeat: RepeatConfig,
}

impl ArborConfig {
    /// Checks value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.extraction.max_depth == 0 {
            return Err(invalid("extraction.max-depth", "must be at least 1"));
        }
        if self.evaluation.max_depth == 0 {
            return Err(invalid("evaluation.max-depth", "must be at least 1"));
        }
        if self.evaluation.formula_selection.is_empty() {
            return Err(invalid("evaluation.formula-selection", "must name at least one rule"));
        }
        if !(8..=24).contains(&self.ids.hash_length) {
            return Err(invalid("ids.hash-length", "must be between 8 and 24"));
        }
        if self.repeat.max_occurrences == Some(0) {
            return Err(invalid("repeat.max-occurrences", "must be at least 1 when set"));
        }
        Ok(())
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// Load configuration for the given directory.
///
/// Layers, lowest precedence first: built-in defaults, `arbor.yaml` inside
/// `dir` (skipped when absent), then `ARBOR_` environment variables with
/// `__` separating sections (`ARBOR_IDS__STRATEGY=hashed`).
///
/// # Errors
///
/// Returns [`ConfigError::LayerError`] if a layer cannot be parsed and
/// [`ConfigError::InvalidValue`] if the merged values are out of range.
pub fn load_config(dir: &Path) -> Result<ArborConfig> {
    let config: ArborConfig = Figment::from(Serialized::defaults(ArborConfig::default()))
        .merge(Yaml::file(dir.join(CONFIG_FILE)))
        .merge(
            Env::prefixed(ENV_PREFIX)
                .split("__")
                .map(|key| key.as_str().replace('_', "-").into()),
        )
        .extract()
        .map_err(Box::new)?;
    config.validate()?;
    Ok(config)
}

/// Parse configuration from a YAML string, without the other layers.
pub fn parse_config(yaml: &str) -> Result<ArborConfig> {
    if yaml.trim().is_empty() {
        return Ok(ArborConfig::default());
    }
    let config: ArborConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}

/// Save configuration to `arbor.yaml` inside the given directory.
///
/// The directory is created if it does not exist.
pub fn save_config(dir: &Path, config: &ArborConfig) -> Result<()> {
    std::fs::create_dir_all(dir)?;

    let config_path = dir.join(CONFIG_FILE);
    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(config_path, yaml)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let cfg = ArborConfig::default();
        assert_eq!(cfg.extraction.max_depth, 64);
        assert!(cfg.extraction.pattern_scan);
        assert_eq!(cfg.evaluation.max_depth, 32);
        assert_eq!(cfg.evaluation.empty_display, "∅");
        assert_eq!(cfg.ids.strategy, IdStrategy::Suffix);
        assert!(cfg.blueprint.use_cache);
        assert!(cfg.repeat.max_occurrences.is_none());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_load_missing_config_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(dir.path()).unwrap();
        assert_eq!(cfg, ArborConfig::default());
    }

    #[test]
    fn test_roundtrip_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = ArborConfig::default();
        cfg.ids.strategy = IdStrategy::Hashed;
        cfg.repeat.max_occurrences = Some(5);
        cfg.evaluation.formula_selection = vec![FormulaPreference::DefaultFlag];

        save_config(dir.path(), &cfg).unwrap();
        let loaded = load_config(dir.path()).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn test_deserialize_partial_yaml() {
        let cfg = parse_config(
            "evaluation:\n  max-depth: 4\nids:\n  strategy: hashed\n  hash-length: 16\n",
        )
        .unwrap();
        assert_eq!(cfg.evaluation.max_depth, 4);
        assert_eq!(cfg.evaluation.formula_selection.len(), 3);
        assert_eq!(cfg.ids.strategy, IdStrategy::Hashed);
        assert_eq!(cfg.ids.hash_length, 16);
        assert_eq!(cfg.ids.hash_prefix, "occ-");
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(parse_config("  \n").unwrap(), ArborConfig::default());
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let err = parse_config("ids:\n  hash-length: 40\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "ids.hash-length"));

        let err = parse_config("evaluation:\n  formula-selection: []\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_unknown_strategy_is_parse_error() {
        assert!(matches!(
            parse_config("ids:\n  strategy: random\n").unwrap_err(),
            ConfigError::ParseError(_)
        ));
    }

    #[test]
    fn test_yaml_file_layer() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "blueprint:\n  use-cache: false\nrepeat:\n  max-occurrences: 3\n",
        )
        .unwrap();
        let cfg = load_config(dir.path()).unwrap();
        assert!(!cfg.blueprint.use_cache);
        assert!(cfg.blueprint.enrich_from_occurrences);
        assert_eq!(cfg.repeat.max_occurrences, Some(3));
    }
}
