use crate::cli::PlanArgs;
use crate::commands;
use crate::render;
use anyhow::{Context as _, Result};

pub fn run(args: PlanArgs) -> Result<u8> {
    let manager = commands::state_manager(&args.common)?;
    let _lock = manager.lock()?;
    let state_file = manager.read()?;

    let ctx = commands::build_context(&args.common, state_file.as_ref(), true)?;
    let (plan, _, diags) = ctx.plan(args.destroy);

    render::display_diagnostics(&diags);
    if diags.has_errors() {
        return Ok(1);
    }

    render::display_plan(&plan);

    if let Some(out) = &args.out {
        let text = plan
            .to_json_string()
            .map_err(|e| anyhow::anyhow!("cannot serialize plan: {e}"))?;
        std::fs::write(out, text)
            .with_context(|| format!("cannot write plan to {}", out.display()))?;
        println!();
        println!("  Plan written to {}", out.display());
    }

    // Exit code 2 distinguishes a non-empty diff from both success and
    // failure, for automation.
    if plan.changes.is_empty() {
        Ok(0)
    } else {
        Ok(2)
    }
}
