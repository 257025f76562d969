//! `arbor import` -- load a graph document into the database.

use std::fs;

use anyhow::{Context, Result};

use arbor_engine::GraphDocument;

use crate::cli::ImportArgs;
use crate::context::RuntimeContext;
use crate::output::{format_link_report, output_json};

pub fn run(ctx: &RuntimeContext, args: &ImportArgs) -> Result<()> {
    let raw = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let doc: GraphDocument = serde_json::from_str(&raw)
        .with_context(|| format!("invalid graph document: {}", args.file.display()))?;

    let engine = ctx.open_engine()?;
    let report = engine.import(&doc)?;

    if ctx.json {
        output_json(&report);
    } else if !ctx.quiet {
        println!(
            "Imported {} node(s), {} capacit(ies), {} variable(s)",
            report.nodes, report.capacities, report.variables
        );
        println!("{}", format_link_report(&report.links));
    }
    Ok(())
}
