use crate::cli::DestroyArgs;
use crate::commands;
use crate::render;
use anyhow::Result;
use colored::Colorize;

pub fn run(args: DestroyArgs) -> Result<u8> {
    let manager = commands::state_manager(&args.common)?;
    let _lock = manager.lock()?;
    let state_file = manager.read()?;

    let ctx = commands::build_context(&args.common, state_file.as_ref(), false)?;

    let (plan, _, diags) = ctx.plan(true);
    render::display_diagnostics(&diags);
    if diags.has_errors() {
        return Ok(1);
    }

    if plan.changes.is_empty() {
        println!();
        println!("  {} Nothing to destroy.", "✓".green());
        return Ok(0);
    }

    render::display_plan(&plan);

    if !args.auto_approve
        && !commands::in_automation()
        && !commands::confirm_proceed("Destroy all managed infrastructure?")?
    {
        println!();
        println!("  {} Destroy cancelled", "✗".red());
        return Ok(1);
    }

    println!();
    let (new_state, diags) = ctx.apply(&plan);
    commands::persist_state(&manager, state_file.as_ref(), new_state)?;

    render::display_diagnostics(&diags);
    if diags.has_errors() {
        return Ok(1);
    }

    let (_, _, destroyed) = plan.changes.action_counts();
    println!();
    println!(
        "  {} Destroy complete: {} destroyed",
        "✓".green().bold(),
        destroyed
    );
    Ok(0)
}
