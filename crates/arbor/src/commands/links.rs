//! `arbor links` -- linked-id maintenance.

use anyhow::Result;

use arbor_engine::LinkScope;

use crate::cli::{LinksArgs, LinksCommands};
use crate::context::RuntimeContext;
use crate::output::{format_link_report, output_json};

pub fn run(ctx: &RuntimeContext, args: &LinksArgs) -> Result<()> {
    match &args.command {
        LinksCommands::Recompute(recompute) => {
            let scope = match &recompute.node {
                Some(node_id) => LinkScope::Node(node_id.clone()),
                None => LinkScope::Graph,
            };
            let engine = ctx.open_engine()?;
            let report = engine.recompute_links(&scope)?;

            if ctx.json {
                output_json(&report);
            } else if !ctx.quiet {
                println!("{}", format_link_report(&report));
            }
            Ok(())
        }
    }
}
