//! `arbor show` -- display nodes with their capacities, variable and links.

use anyhow::Result;

use crate::cli::ShowArgs;
use crate::context::RuntimeContext;
use crate::output::{format_node_view, output_json};

pub fn run(ctx: &RuntimeContext, args: &ShowArgs) -> Result<()> {
    let engine = ctx.open_engine()?;

    let mut views = Vec::with_capacity(args.ids.len());
    for id in &args.ids {
        views.push(engine.node_view(id)?);
    }

    if ctx.json {
        output_json(&views);
        return Ok(());
    }
    let rendered: Vec<String> = views.iter().map(format_node_view).collect();
    println!("{}", rendered.join("\n\n"));
    Ok(())
}
