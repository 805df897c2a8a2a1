use crate::cli::CommonArgs;
use crate::commands;
use crate::render;
use anyhow::Result;
use colored::Colorize;

pub fn run(args: CommonArgs) -> Result<u8> {
    // Validation never touches the state file or acquires its lock.
    let ctx = commands::build_context(&args, None, true)?;
    let diags = ctx.validate();

    render::display_diagnostics(&diags);
    if diags.has_errors() {
        return Ok(1);
    }
    println!();
    println!("  {} Configuration is valid.", "✓".green());
    Ok(0)
}
