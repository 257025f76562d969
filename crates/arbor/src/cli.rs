//! Clap CLI definitions for the `arbor` command.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// arbor -- inspect and maintain form graphs.
///
/// Loads a form tree into a local database, keeps its linked-id sets in step,
/// instantiates repeater occurrences and evaluates expressions with a trace.
#[derive(Parser, Debug)]
#[command(
    name = "arbor",
    about = "Inspect and maintain arbor form graphs",
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Global flags available to all subcommands.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Database file.
    #[arg(long, global = true, env = "ARBOR_DB", default_value = "arbor.db")]
    pub db: PathBuf,

    /// Directory holding arbor.yaml (default: the database's directory).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Output in JSON format.
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable debug logging.
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output (errors only).
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,
}

/// All available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the database and a default arbor.yaml.
    Init(InitArgs),

    /// Load nodes, capacities and variables from a JSON document.
    Import(ImportArgs),

    /// Show nodes with their capacities, variable and links.
    #[command(alias = "view")]
    Show(ShowArgs),

    /// Maintain linked-id sets.
    Links(LinksArgs),

    /// Show the blueprint of a repeater.
    Blueprint(BlueprintArgs),

    /// Add, remove and list repeater occurrences.
    Repeat(RepeatArgs),

    /// Evaluate a field, formula, condition or table reference.
    Eval(EvalArgs),

    /// Show the effective configuration.
    Config(ConfigArgs),

    /// Generate shell completion scripts.
    Completion(CompletionArgs),
}

// ---------------------------------------------------------------------------
// Init / Import / Show
// ---------------------------------------------------------------------------

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Re-initialize even if the database already exists.
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ImportArgs {
    /// Graph document: `{"nodes": [...], "capacities": [...], "variables": [...]}`.
    pub file: PathBuf,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Node ids to display.
    #[arg(required = true)]
    pub ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

#[derive(Args, Debug)]
pub struct LinksArgs {
    #[command(subcommand)]
    pub command: LinksCommands,
}

#[derive(Subcommand, Debug)]
pub enum LinksCommands {
    /// Union desired links into the stored sets (whole graph by default).
    Recompute(LinksRecomputeArgs),
}

#[derive(Args, Debug)]
pub struct LinksRecomputeArgs {
    /// Only relink what this node owns.
    #[arg(long)]
    pub node: Option<String>,
}

// ---------------------------------------------------------------------------
// Blueprint / Repeat
// ---------------------------------------------------------------------------

#[derive(Args, Debug)]
pub struct BlueprintArgs {
    pub repeater_id: String,

    /// Ignore any cached blueprint.
    #[arg(long)]
    pub refresh: bool,
}

#[derive(Args, Debug)]
pub struct RepeatArgs {
    #[command(subcommand)]
    pub command: RepeatCommands,
}

#[derive(Subcommand, Debug)]
pub enum RepeatCommands {
    /// Instantiate the next occurrence of a repeater.
    Add(RepeatAddArgs),
    /// Delete the occurrence a node belongs to.
    Remove(RepeatRemoveArgs),
    /// List the occurrences of a repeater.
    List(RepeatListArgs),
}

#[derive(Args, Debug)]
pub struct RepeatAddArgs {
    pub repeater_id: String,
}

#[derive(Args, Debug)]
pub struct RepeatRemoveArgs {
    /// Any node of the occurrence.
    pub node_id: String,
}

#[derive(Args, Debug)]
pub struct RepeatListArgs {
    pub repeater_id: String,
}

// ---------------------------------------------------------------------------
// Eval
// ---------------------------------------------------------------------------

#[derive(Args, Debug)]
pub struct EvalArgs {
    /// Reference, e.g. `@value.price`, `node-formula:f1`, `condition:c1`.
    pub reference: String,

    /// JSON object of submitted values keyed by node id.
    #[arg(long)]
    pub values: Option<PathBuf>,

    /// Submitted value as `node-id=value` (repeatable; overrides --values).
    #[arg(long = "set", value_name = "ID=VALUE")]
    pub set: Vec<String>,
}

// ---------------------------------------------------------------------------
// Config / Completion
// ---------------------------------------------------------------------------

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the merged configuration.
    Show,
    /// Print where configuration is read from.
    Path,
}

#[derive(Args, Debug)]
pub struct CompletionArgs {
    #[command(subcommand)]
    pub command: CompletionCommands,
}

#[derive(Subcommand, Debug)]
pub enum CompletionCommands {
    /// Generate bash completion script.
    Bash,
    /// Generate zsh completion script.
    Zsh,
    /// Generate fish completion script.
    Fish,
    /// Generate PowerShell completion script.
    Powershell,
}
