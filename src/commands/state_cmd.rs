use crate::cli::StateCommand;
use anyhow::{Result, bail};
use orchestra::addrs::Target;
use orchestra::state::{LocalStateManager, StateFile};
use orchestra::value::json;
use std::path::Path;

pub fn run(cmd: StateCommand) -> Result<u8> {
    match cmd {
        StateCommand::List { state } => list(&state),
        StateCommand::Show { state, addr } => show(&state, &addr),
        StateCommand::Rm { state, addr } => rm(&state, &addr),
    }
}

fn read(path: &Path) -> Result<(LocalStateManager, StateFile)> {
    let manager = LocalStateManager::new(path).with_locking(false);
    let Some(file) = manager.read()? else {
        bail!("no state file at {}", path.display());
    };
    Ok((manager, file))
}

fn list(path: &Path) -> Result<u8> {
    let (_, file) = read(path)?;
    for addr in file.state.all_instance_addrs() {
        println!("{addr}");
    }
    for (addr, key) in file.state.all_deposed() {
        println!("{addr} (deposed {key})");
    }
    Ok(0)
}

fn show(path: &Path, addr: &str) -> Result<u8> {
    let (_, file) = read(path)?;
    let target = Target::parse(addr).map_err(|e| anyhow::anyhow!("{e}"))?;

    let mut found = false;
    for instance_addr in file.state.all_instance_addrs() {
        if !target.matches(&instance_addr) {
            continue;
        }
        let Some(obj) = file.state.instance_object(&instance_addr) else {
            continue;
        };
        found = true;
        println!("# {instance_addr}");
        let doc = json::to_plain(&obj.value).map_err(|e| anyhow::anyhow!("{e}"))?;
        println!("{}", serde_json::to_string_pretty(&doc)?);
    }
    if !found {
        bail!("no instance in state matches {addr:?}");
    }
    Ok(0)
}

/// Forget instances without destroying the real objects.
fn rm(path: &Path, addr: &str) -> Result<u8> {
    // The lock must be held before the read so nothing written in
    // between is clobbered by our write.
    let manager = LocalStateManager::new(path);
    let _lock = manager.lock()?;
    let Some(file) = manager.read()? else {
        bail!("no state file at {}", path.display());
    };
    let target = Target::parse(addr).map_err(|e| anyhow::anyhow!("{e}"))?;

    let mut state = file.state.clone();
    let mut removed = 0usize;
    for instance_addr in file.state.all_instance_addrs() {
        if !target.matches(&instance_addr) {
            continue;
        }
        if let Some(mstate) = state.modules.get_mut(&instance_addr.module)
            && let Some(record) = mstate.resources.get_mut(&instance_addr.instance.resource)
        {
            record.instances.remove(&instance_addr.instance.key);
            removed += 1;
        }
    }
    if removed == 0 {
        bail!("no instance in state matches {addr:?}");
    }
    state.prune();

    let next = StateFile::next(Some(&file), state);
    manager.write(&next)?;
    println!("Removed {removed} instance(s) from the state.");
    Ok(0)
}
