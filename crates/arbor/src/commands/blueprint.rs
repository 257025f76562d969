//! `arbor blueprint` -- show what one occurrence of a repeater would clone.

use anyhow::Result;

use crate::cli::BlueprintArgs;
use crate::context::RuntimeContext;
use crate::output::{format_blueprint, output_json};

pub fn run(ctx: &RuntimeContext, args: &BlueprintArgs) -> Result<()> {
    let engine = ctx.open_engine()?;
    let blueprint = engine.build_blueprint(&args.repeater_id, args.refresh)?;

    if ctx.json {
        output_json(&blueprint);
    } else {
        println!("{}", format_blueprint(&blueprint));
    }
    Ok(())
}
