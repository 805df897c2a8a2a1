use crate::cli::ApplyArgs;
use crate::commands;
use crate::render;
use anyhow::{Context as _, Result};
use colored::Colorize;
use orchestra::plan::Plan;

pub fn run(args: ApplyArgs) -> Result<u8> {
    let manager = commands::state_manager(&args.common)?;
    let _lock = manager.lock()?;
    let state_file = manager.read()?;

    let ctx = commands::build_context(&args.common, state_file.as_ref(), false)?;

    // Either replay a saved plan or compute a fresh one.
    let plan = match &args.plan_file {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read plan file {}", path.display()))?;
            Plan::from_json_str(&text)
                .map_err(|e| anyhow::anyhow!("plan file {} is not valid: {e}", path.display()))?
        }
        None => {
            let (plan, _, diags) = ctx.plan(false);
            render::display_diagnostics(&diags);
            if diags.has_errors() {
                return Ok(1);
            }
            plan
        }
    };

    if plan.changes.is_empty() {
        println!();
        println!("  {} No changes. Infrastructure is up to date.", "✓".green());
        return Ok(0);
    }

    render::display_plan(&plan);

    if !args.auto_approve
        && !commands::in_automation()
        && !commands::confirm_proceed("Apply these changes?")?
    {
        println!();
        println!("  {} Apply cancelled", "✗".red());
        return Ok(1);
    }

    println!();
    let (new_state, diags) = ctx.apply(&plan);

    // Whatever happened, the partial result is the new truth.
    commands::persist_state(&manager, state_file.as_ref(), new_state)?;

    render::display_diagnostics(&diags);
    if diags.has_errors() {
        return Ok(1);
    }

    let (add, change, destroy) = plan.changes.action_counts();
    println!();
    println!(
        "  {} Apply complete: {} added, {} changed, {} destroyed",
        "✓".green().bold(),
        add,
        change,
        destroy
    );
    Ok(0)
}
