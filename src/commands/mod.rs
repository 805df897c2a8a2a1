//! Command implementations.

pub mod apply;
pub mod destroy;
pub mod output;
pub mod plan;
pub mod refresh;
pub mod state_cmd;
pub mod validate;

use crate::cli::CommonArgs;
use crate::providers;
use anyhow::{Context as _, Result, bail};
use orchestra::addrs::Target;
use orchestra::config::Config;
use orchestra::context::{Context, ContextOptions};
use orchestra::state::{LocalStateManager, StateFile};
use orchestra::value::{Ty, Value, json};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Load the configuration document.
pub fn load_config(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read configuration {}", path.display()))?;
    Config::from_json_str(&text)
        .with_context(|| format!("configuration {} is not valid", path.display()))
}

/// Build the state manager for the common flags.
pub fn state_manager(args: &CommonArgs) -> Result<LocalStateManager> {
    let timeout = parse_duration(&args.lock_timeout)
        .with_context(|| format!("invalid -lock-timeout {:?}", args.lock_timeout))?;
    Ok(LocalStateManager::new(&args.state)
        .with_locking(args.lock)
        .with_lock_timeout(timeout))
}

/// Parse `10s` / `2m` / `1h` durations.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (num, unit) = s.split_at(s.len().saturating_sub(1));
    let n: u64 = num.parse().with_context(|| format!("invalid duration {s:?}"))?;
    let secs = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        _ => bail!("invalid duration {s:?}: expected a unit of s, m, or h"),
    };
    Ok(Duration::from_secs(secs))
}

/// Collect variables from -var flags and an optional -var-file.
pub fn collect_variables(args: &CommonArgs) -> Result<BTreeMap<String, Value>> {
    let mut out = BTreeMap::new();

    if let Some(path) = &args.var_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read var file {}", path.display()))?;
        let doc: serde_json::Value = serde_json::from_str(&text)
            .with_context(|| format!("var file {} is not valid JSON", path.display()))?;
        let serde_json::Value::Object(entries) = doc else {
            bail!("var file {} must contain a JSON object", path.display());
        };
        for (name, raw) in entries {
            let value = json::from_plain(&raw, &Ty::Dynamic)
                .map_err(|e| anyhow::anyhow!("invalid value for variable {name:?}: {e}"))?;
            out.insert(name, value);
        }
    }

    for spec in &args.vars {
        let Some((name, raw)) = spec.split_once('=') else {
            bail!("invalid -var {spec:?}: expected NAME=VALUE");
        };
        // Values parse as JSON when they can, else as bare strings.
        let value = match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(parsed) => json::from_plain(&parsed, &Ty::Dynamic)
                .unwrap_or_else(|_| Value::string(raw)),
            Err(_) => Value::string(raw),
        };
        out.insert(name.to_string(), value);
    }
    Ok(out)
}

/// Parse -target flags.
pub fn collect_targets(args: &CommonArgs) -> Result<Vec<Target>> {
    args.targets
        .iter()
        .map(|t| Target::parse(t).map_err(|e| anyhow::anyhow!("{e}")))
        .collect()
}

/// Assemble an engine context from the common flags and a state file.
pub fn build_context(
    args: &CommonArgs,
    state_file: Option<&StateFile>,
    quiet: bool,
) -> Result<Context> {
    let config = load_config(&args.config)?;
    let variables = collect_variables(args)?;
    let targets = collect_targets(args)?;

    let mut options = ContextOptions::new(
        config,
        state_file.map(|f| f.state.clone()).unwrap_or_default(),
        providers::builtin_providers(),
    );
    options.state_meta = state_file.map(|f| (f.lineage.clone(), f.serial));
    options.variables = variables;
    options.targets = targets;
    options.parallelism = args.parallelism as usize;
    options.hooks = Arc::new(crate::render::CliHook { quiet });
    options.root_path = args
        .config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();

    Context::new(options).map_err(|diags| {
        crate::render::display_diagnostics(&diags);
        anyhow::anyhow!("cannot initialize: {}", diags.to_report())
    })
}

/// Persist a new snapshot as the successor of `prior`. On failure the
/// state is salvaged to `errored.mstate` in the working directory.
pub fn persist_state(
    manager: &LocalStateManager,
    prior: Option<&StateFile>,
    state: orchestra::State,
) -> Result<()> {
    let file = StateFile::next(prior, state);
    if let Err(err) = manager.write(&file) {
        let fallback = Path::new("errored.mstate");
        match LocalStateManager::write_fallback(fallback, &file) {
            Ok(()) => bail!(
                "failed to persist state: {err}; the state was saved to {}",
                fallback.display()
            ),
            Err(fallback_err) => bail!(
                "failed to persist state: {err}; the fallback write also failed: {fallback_err}"
            ),
        }
    }
    Ok(())
}

/// Whether interactive confirmation should be skipped.
pub fn in_automation() -> bool {
    std::env::var_os("MAESTRO_IN_AUTOMATION").is_some()
}

/// Ask the user to confirm an apply.
pub fn confirm_proceed(prompt: &str) -> Result<bool> {
    use dialoguer::Confirm;
    let confirmed = Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?;
    Ok(confirmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("").is_err());
    }
}
