//! `arbor repeat` -- add, remove and list repeater occurrences.

use anyhow::Result;

use crate::cli::{RepeatArgs, RepeatCommands};
use crate::context::RuntimeContext;
use crate::output::{format_occurrence, format_removal, occurrence_rows, output_json, output_table};

pub fn run(ctx: &RuntimeContext, args: &RepeatArgs) -> Result<()> {
    let engine = ctx.open_engine()?;

    match &args.command {
        RepeatCommands::Add(add) => {
            let result = engine.add_occurrence(&add.repeater_id)?;
            if ctx.json {
                output_json(&result);
                return Ok(());
            }
            match result {
                Some(occurrence) => println!("{}", format_occurrence(&occurrence)),
                None if !ctx.quiet => {
                    println!("Repeater {} has no templates; nothing added", add.repeater_id)
                }
                None => {}
            }
        }
        RepeatCommands::Remove(remove) => {
            let result = engine.remove_occurrence(&remove.node_id)?;
            if ctx.json {
                output_json(&result);
            } else if !ctx.quiet {
                println!("{}", format_removal(&result));
            }
        }
        RepeatCommands::List(list) => {
            let occurrences = engine.list_occurrences(&list.repeater_id)?;
            if ctx.json {
                output_json(&occurrences);
            } else if occurrences.is_empty() {
                println!("No occurrences of {}", list.repeater_id);
            } else {
                output_table(&["INDEX", "NODES"], &occurrence_rows(&occurrences));
            }
        }
    }
    Ok(())
}
