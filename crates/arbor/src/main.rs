//! `arbor` -- operator tool for arbor form graphs.
//!
//! Parses CLI arguments with clap, resolves the runtime context, and
//! dispatches to command handlers.

mod cli;
mod commands;
mod context;
mod output;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use context::RuntimeContext;

fn main() {
    let cli = Cli::parse();
    let ctx = RuntimeContext::from_global_args(&cli.global);

    // -v wins over RUST_LOG; otherwise only warnings reach stderr.
    let filter = if ctx.verbose {
        EnvFilter::new("arbor=debug,arbor_engine=debug,arbor_storage=debug,arbor_core=debug")
    } else if ctx.quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Some(Commands::Init(args)) => commands::init::run(&ctx, &args),
        Some(Commands::Import(args)) => commands::import::run(&ctx, &args),
        Some(Commands::Show(args)) => commands::show::run(&ctx, &args),
        Some(Commands::Links(args)) => commands::links::run(&ctx, &args),
        Some(Commands::Blueprint(args)) => commands::blueprint::run(&ctx, &args),
        Some(Commands::Repeat(args)) => commands::repeat::run(&ctx, &args),
        Some(Commands::Eval(args)) => commands::eval::run(&ctx, &args),
        Some(Commands::Config(args)) => commands::config_cmd::run(&ctx, &args),
        Some(Commands::Completion(args)) => commands::completion::run(&ctx, &args),
        None => {
            use clap::CommandFactory;
            Cli::command().print_help().ok();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        if cli.global.json {
            let err_json = serde_json::json!({
                "error": format!("{:#}", e),
            });
            if let Ok(s) = serde_json::to_string_pretty(&err_json) {
                eprintln!("{}", s);
            }
        } else {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(1);
    }
}
