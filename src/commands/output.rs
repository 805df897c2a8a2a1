use crate::cli::OutputArgs;
use anyhow::{Result, bail};
use orchestra::state::LocalStateManager;
use orchestra::value::json;

pub fn run(args: OutputArgs) -> Result<u8> {
    let manager = LocalStateManager::new(&args.state).with_locking(false);
    let Some(state_file) = manager.read()? else {
        bail!("no state file at {}", args.state.display());
    };

    let outputs = state_file.state.root_outputs();
    if outputs.is_empty() {
        eprintln!("The state contains no outputs.");
        return Ok(0);
    }

    match &args.name {
        Some(name) => {
            let Some(output) = outputs.get(name) else {
                bail!("no output named {name:?} in the state");
            };
            print_value(&output.value, args.json)?;
        }
        None => {
            if args.json {
                let mut doc = serde_json::Map::new();
                for (name, output) in &outputs {
                    doc.insert(
                        name.clone(),
                        json::to_plain(&output.value)
                            .map_err(|e| anyhow::anyhow!("output {name:?}: {e}"))?,
                    );
                }
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else {
                for (name, output) in &outputs {
                    if output.sensitive {
                        println!("{name} = (sensitive value)");
                    } else {
                        println!("{name} = {}", output.value);
                    }
                }
            }
        }
    }
    Ok(0)
}

fn print_value(value: &orchestra::Value, as_json: bool) -> Result<()> {
    if as_json {
        let doc = json::to_plain(value).map_err(|e| anyhow::anyhow!("{e}"))?;
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        println!("{value}");
    }
    Ok(())
}
