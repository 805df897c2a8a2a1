//! Terminal rendering of plans, diagnostics, and apply progress.

use colored::Colorize;
use orchestra::addrs::AbsResourceInstance;
use orchestra::hooks::Hook;
use orchestra::plan::{Action, Plan};
use orchestra::value::Value;
use orchestra::{Diagnostics, Severity};

/// Print a plan in a user-friendly format.
pub fn display_plan(plan: &Plan) {
    if plan.changes.is_empty() {
        println!();
        println!("  {} No changes. Infrastructure is up to date.", "✓".green());
        return;
    }

    println!();
    println!(
        "┌─ {} ─────────────────────────────────────────┐",
        "Execution Plan".bold()
    );
    println!("│");

    for change in &plan.changes.resources {
        if change.action.is_noop() {
            continue;
        }
        let symbol = action_symbol(change.action);
        let deposed_note = match &change.deposed {
            Some(key) => format!(" (deposed {key})").dimmed().to_string(),
            None => String::new(),
        };
        println!("│   {} {}{}", symbol, change.addr, deposed_note);
        if !change.required_replace.is_empty() {
            println!(
                "│       {} forced by: {}",
                "replace".yellow(),
                change.required_replace.join(", ").dimmed()
            );
        }
    }

    for output in &plan.changes.outputs {
        if output.before.raw_equals(&output.after) {
            continue;
        }
        println!("│   {} output.{}", "~".yellow(), output.name);
    }

    let (add, change, destroy) = plan.changes.action_counts();
    println!("│");
    println!("├─────────────────────────────────────────────────────┤");
    println!(
        "│ Plan: {} to add, {} to change, {} to destroy",
        add.to_string().green(),
        change.to_string().yellow(),
        destroy.to_string().red()
    );
    println!("└─────────────────────────────────────────────────────┘");
}

fn action_symbol(action: Action) -> String {
    match action {
        Action::Create => "+".green().to_string(),
        Action::Read => "<".cyan().to_string(),
        Action::Update => "~".yellow().to_string(),
        Action::Delete => "-".red().to_string(),
        Action::DestroyCreate | Action::CreateDestroy => "±".red().to_string(),
        Action::NoOp => "○".dimmed().to_string(),
    }
}

/// Print diagnostics, errors first.
pub fn display_diagnostics(diags: &Diagnostics) {
    for diag in diags.iter() {
        let prefix = match diag.severity {
            Severity::Error => "✗ Error:".red().bold().to_string(),
            Severity::Warning => "⚠ Warning:".yellow().bold().to_string(),
        };
        println!();
        print!("  {prefix} {}", diag.summary);
        if let Some(addr) = &diag.address {
            print!(" {}", format!("({addr})").dimmed());
        }
        println!();
        if !diag.detail.is_empty() {
            println!("    {}", diag.detail.dimmed());
        }
    }
}

/// Hook printing per-instance apply progress lines.
pub struct CliHook {
    pub quiet: bool,
}

impl Hook for CliHook {
    fn pre_apply(&self, addr: &AbsResourceInstance, action: Action, _planned: &Value) {
        if self.quiet {
            return;
        }
        let verb = match action {
            Action::Create => "Creating...",
            Action::Update => "Modifying...",
            Action::Delete => "Destroying...",
            Action::DestroyCreate | Action::CreateDestroy => "Replacing...",
            Action::Read => "Reading...",
            Action::NoOp => return,
        };
        println!("  {} {}: {}", "→".cyan(), addr, verb);
    }

    fn post_apply(&self, addr: &AbsResourceInstance, _new: &Value, error: Option<&str>) {
        if self.quiet {
            return;
        }
        match error {
            None => println!("  {} {}: Done", "✓".green(), addr),
            Some(err) => println!("  {} {}: {}", "✗".red(), addr, err),
        }
    }

    fn pre_refresh(&self, addr: &AbsResourceInstance, _prior: &Value) {
        if self.quiet {
            return;
        }
        println!("  {} {}: Refreshing...", "→".cyan(), addr);
    }
}
