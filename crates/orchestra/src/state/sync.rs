//! Synchronized state mutation.
//!
//! `SyncState` is the single owner of the live state during a walk. Every
//! mutator takes the one internal lock, enforces the structural invariants
//! (no empty records, provider always recorded), and releases it before
//! returning; readers get snapshot copies and never observe intermediate
//! states.

use super::{
    DeposedKey, InstanceObject, InstanceState, ModuleState, OutputValue, ResourceRecord, State,
};
use crate::addrs::{AbsProviderConfig, AbsResourceInstance, ModuleInstance};
use crate::value::Value;
use std::sync::Mutex;

#[derive(Debug)]
pub struct SyncState {
    inner: Mutex<State>,
}

impl SyncState {
    pub fn new(state: State) -> Self {
        Self {
            inner: Mutex::new(state),
        }
    }

    /// A snapshot copy of the current state.
    pub fn snapshot(&self) -> State {
        self.inner.lock().expect("state lock poisoned").clone()
    }

    /// Consume the owner and return the final state, pruned of empty
    /// records.
    pub fn into_state(self) -> State {
        let mut state = self.inner.into_inner().expect("state lock poisoned");
        state.prune();
        state
    }

    /// Read the current object for one instance.
    pub fn instance_object(&self, addr: &AbsResourceInstance) -> Option<InstanceObject> {
        let state = self.inner.lock().expect("state lock poisoned");
        state.instance_object(addr).cloned()
    }

    pub fn deposed_object(
        &self,
        addr: &AbsResourceInstance,
        key: &DeposedKey,
    ) -> Option<InstanceObject> {
        let state = self.inner.lock().expect("state lock poisoned");
        state.deposed_object(addr, key).cloned()
    }

    /// Set or clear the current object for an instance. Clearing removes
    /// the instance entry (and the resource record, when it empties out).
    pub fn set_instance(
        &self,
        addr: &AbsResourceInstance,
        provider: &AbsProviderConfig,
        object: Option<InstanceObject>,
    ) {
        let mut state = self.inner.lock().expect("state lock poisoned");
        let module = state.modules.entry(addr.module.clone()).or_default();
        let record = module
            .resources
            .entry(addr.instance.resource.clone())
            .or_insert_with(|| ResourceRecord::new(provider.clone()));
        record.provider = provider.clone();
        match object {
            Some(obj) => {
                record
                    .instances
                    .entry(addr.instance.key.clone())
                    .or_default()
                    .current = Some(obj);
            }
            None => {
                if let Some(istate) = record.instances.get_mut(&addr.instance.key) {
                    istate.current = None;
                    if istate.is_empty() {
                        record.instances.remove(&addr.instance.key);
                    }
                }
                Self::drop_if_empty(&mut state, addr);
            }
        }
    }

    /// Move the current object aside under a fresh deposed key, for
    /// create-before-destroy. Returns `None` when there is no current
    /// object to depose.
    pub fn depose_instance(&self, addr: &AbsResourceInstance) -> Option<DeposedKey> {
        let mut state = self.inner.lock().expect("state lock poisoned");
        let istate = Self::instance_mut(&mut state, addr)?;
        let current = istate.current.take()?;
        let key = DeposedKey::generate();
        istate.deposed.insert(key.clone(), current);
        Some(key)
    }

    /// Restore a deposed object as current, used when a replacement create
    /// fails. A current object written in between (by the failed create's
    /// partial result) is discarded in favor of the prior object.
    pub fn restore_deposed(&self, addr: &AbsResourceInstance, key: &DeposedKey) -> bool {
        let mut state = self.inner.lock().expect("state lock poisoned");
        let Some(istate) = Self::instance_mut(&mut state, addr) else {
            return false;
        };
        match istate.deposed.remove(key) {
            Some(obj) => {
                istate.current = Some(obj);
                true
            }
            None => false,
        }
    }

    /// Drop a deposed object after its destroy completed.
    pub fn remove_deposed(&self, addr: &AbsResourceInstance, key: &DeposedKey) {
        let mut state = self.inner.lock().expect("state lock poisoned");
        let mut now_empty = false;
        if let Some(istate) = Self::instance_mut(&mut state, addr) {
            istate.deposed.remove(key);
            now_empty = istate.is_empty();
        }
        if now_empty {
            if let Some(record) = state
                .modules
                .get_mut(&addr.module)
                .and_then(|m| m.resources.get_mut(&addr.instance.resource))
            {
                record.instances.remove(&addr.instance.key);
            }
            Self::drop_if_empty(&mut state, addr);
        }
    }

    /// Record an output value for a module.
    pub fn set_output(&self, module: &ModuleInstance, name: &str, value: Value, sensitive: bool) {
        let mut state = self.inner.lock().expect("state lock poisoned");
        state
            .modules
            .entry(module.clone())
            .or_default()
            .outputs
            .insert(name.to_string(), OutputValue { value, sensitive });
    }

    pub fn remove_output(&self, module: &ModuleInstance, name: &str) {
        let mut state = self.inner.lock().expect("state lock poisoned");
        if let Some(mstate) = state.modules.get_mut(module) {
            mstate.outputs.remove(name);
        }
    }

    /// The value of one module output, if recorded.
    pub fn output_value(&self, module: &ModuleInstance, name: &str) -> Option<OutputValue> {
        let state = self.inner.lock().expect("state lock poisoned");
        state.modules.get(module)?.outputs.get(name).cloned()
    }

    fn instance_mut<'a>(
        state: &'a mut State,
        addr: &AbsResourceInstance,
    ) -> Option<&'a mut InstanceState> {
        state
            .modules
            .get_mut(&addr.module)?
            .resources
            .get_mut(&addr.instance.resource)?
            .instances
            .get_mut(&addr.instance.key)
    }

    fn drop_if_empty(state: &mut State, addr: &AbsResourceInstance) {
        let remove_record = state
            .modules
            .get(&addr.module)
            .and_then(|m| m.resources.get(&addr.instance.resource))
            .is_some_and(ResourceRecord::is_empty);
        if remove_record
            && let Some(mstate) = state.modules.get_mut(&addr.module)
        {
            mstate.resources.remove(&addr.instance.resource);
            if !addr.module.is_root() && mstate.is_empty() {
                state.modules.remove(&addr.module);
            }
        }
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new(State::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::{InstanceKey, LocalProviderConfig, Resource};

    fn addr() -> AbsResourceInstance {
        Resource::managed("test_instance", "web")
            .instance(Some(InstanceKey::Int(0)))
            .absolute(ModuleInstance::root())
    }

    fn provider() -> AbsProviderConfig {
        LocalProviderConfig::default_for("test").absolute(ModuleInstance::root())
    }

    #[test]
    fn test_set_and_clear_instance() {
        let sync = SyncState::default();
        sync.set_instance(&addr(), &provider(), Some(InstanceObject::new(Value::empty_object())));
        assert!(sync.instance_object(&addr()).is_some());

        // The snapshot is detached from later mutation.
        let snap = sync.snapshot();
        sync.set_instance(&addr(), &provider(), None);
        assert!(sync.instance_object(&addr()).is_none());
        assert!(snap.instance_object(&addr()).is_some());

        let final_state = sync.into_state();
        assert!(final_state.is_empty());
        assert!(final_state.modules.values().all(|m| m.resources.is_empty()));
    }

    #[test]
    fn test_depose_restore_cycle() {
        let sync = SyncState::default();
        sync.set_instance(
            &addr(),
            &provider(),
            Some(InstanceObject::new(Value::string("old"))),
        );

        let key = sync.depose_instance(&addr()).unwrap();
        assert!(sync.instance_object(&addr()).is_none());
        assert_eq!(
            sync.deposed_object(&addr(), &key).unwrap().value,
            Value::string("old")
        );

        // New object becomes current; restore puts the old one back.
        sync.set_instance(
            &addr(),
            &provider(),
            Some(InstanceObject::new(Value::string("new"))),
        );
        assert!(sync.restore_deposed(&addr(), &key));
        assert_eq!(
            sync.instance_object(&addr()).unwrap().value,
            Value::string("old")
        );
        assert!(sync.deposed_object(&addr(), &key).is_none());
    }

    #[test]
    fn test_remove_deposed_cleans_up() {
        let sync = SyncState::default();
        sync.set_instance(
            &addr(),
            &provider(),
            Some(InstanceObject::new(Value::string("old"))),
        );
        let key = sync.depose_instance(&addr()).unwrap();
        sync.remove_deposed(&addr(), &key);
        assert!(sync.into_state().is_empty());
    }

    #[test]
    fn test_outputs() {
        let sync = SyncState::default();
        let root = ModuleInstance::root();
        sync.set_output(&root, "ip", Value::string("10.0.0.1"), false);
        assert_eq!(
            sync.output_value(&root, "ip").unwrap().value,
            Value::string("10.0.0.1")
        );
        sync.remove_output(&root, "ip");
        assert!(sync.output_value(&root, "ip").is_none());
    }

    #[test]
    fn test_depose_missing_returns_none() {
        let sync = SyncState::default();
        assert!(sync.depose_instance(&addr()).is_none());
    }
}
