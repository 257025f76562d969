//! Command handlers, one module per subcommand.

pub mod blueprint;
pub mod completion;
pub mod config_cmd;
pub mod eval;
pub mod import;
pub mod init;
pub mod links;
pub mod repeat;
pub mod show;
