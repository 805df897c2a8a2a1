use crate::cli::CommonArgs;
use crate::commands;
use crate::render;
use anyhow::Result;
use colored::Colorize;

pub fn run(args: CommonArgs) -> Result<u8> {
    let manager = commands::state_manager(&args)?;
    let _lock = manager.lock()?;
    let state_file = manager.read()?;

    let ctx = commands::build_context(&args, state_file.as_ref(), false)?;
    let (new_state, diags) = ctx.refresh();

    commands::persist_state(&manager, state_file.as_ref(), new_state)?;

    render::display_diagnostics(&diags);
    if diags.has_errors() {
        return Ok(1);
    }
    println!();
    println!("  {} State refreshed.", "✓".green());
    Ok(0)
}
