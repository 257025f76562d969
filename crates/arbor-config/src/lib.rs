//! Configuration management for the arbor engine.
//!
//! This crate handles loading and saving `arbor.yaml` files and provides
//! typed access to the tunables of dependency extraction, evaluation, id
//! derivation, blueprint building and repeat instantiation.

pub mod config;

pub use config::{
    load_config, parse_config, save_config, ArborConfig, BlueprintConfig, ConfigError,
    EvaluationConfig, ExtractionConfig, FormulaPreference, IdStrategy, IdsConfig, RepeatConfig,
};
