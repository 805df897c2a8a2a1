//! Resource state snapshots.
//!
//! A [`State`] is an immutable-by-convention snapshot: a tree of module
//! states holding resource instance objects, deposed objects, and output
//! values. All mutation during a walk goes through [`SyncState`], which
//! owns the one live copy behind a lock; readers take cheap snapshots.

pub mod file;
mod sync;

pub use file::{LocalStateManager, StateError, StateFile};
pub use sync::SyncState;

use crate::addrs::{
    AbsProviderConfig, AbsResource, AbsResourceInstance, InstanceKey, ModuleInstance, Resource,
};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Status of a stored instance object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectStatus {
    #[default]
    Ok,
    /// A partial result of a failed apply; the next plan recreates it.
    Tainted,
}

/// Key under which a deposed (replaced but not yet destroyed) object is
/// retained.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeposedKey(String);

impl DeposedKey {
    /// A fresh random key, eight hex digits.
    pub fn generate() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self(id[..8].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for DeposedKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for DeposedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One stored object for a resource instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceObject {
    pub status: ObjectStatus,
    /// Attribute value conforming to the resource type's implied type.
    pub value: Value,
    /// Opaque provider-private data.
    pub private: Vec<u8>,
    /// Canonical addresses of resources this instance depended on when it
    /// was created, used to order destroys.
    pub dependencies: Vec<String>,
    /// Dotted paths of attributes the schema marks sensitive.
    pub sensitive_paths: Vec<String>,
    pub schema_version: u64,
}

impl InstanceObject {
    pub fn new(value: Value) -> Self {
        Self {
            status: ObjectStatus::Ok,
            value,
            private: Vec::new(),
            dependencies: Vec::new(),
            sensitive_paths: Vec::new(),
            schema_version: 0,
        }
    }

    pub fn tainted(mut self) -> Self {
        self.status = ObjectStatus::Tainted;
        self
    }

    pub fn is_tainted(&self) -> bool {
        self.status == ObjectStatus::Tainted
    }
}

/// State for one instance key of a resource: the current object plus any
/// deposed prior objects awaiting destruction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceState {
    pub current: Option<InstanceObject>,
    pub deposed: BTreeMap<DeposedKey, InstanceObject>,
}

impl InstanceState {
    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.deposed.is_empty()
    }
}

/// State for one resource: its provider plus an ordered map of instances.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRecord {
    pub provider: AbsProviderConfig,
    pub instances: BTreeMap<Option<InstanceKey>, InstanceState>,
}

impl ResourceRecord {
    pub fn new(provider: AbsProviderConfig) -> Self {
        Self {
            provider,
            instances: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.instances.values().all(InstanceState::is_empty)
    }
}

/// A recorded output value.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputValue {
    pub value: Value,
    pub sensitive: bool,
}

/// State of a single module instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleState {
    pub resources: BTreeMap<Resource, ResourceRecord>,
    pub outputs: BTreeMap<String, OutputValue>,
}

impl ModuleState {
    pub fn is_empty(&self) -> bool {
        self.resources.values().all(ResourceRecord::is_empty) && self.outputs.is_empty()
    }
}

/// A whole state snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct State {
    pub modules: BTreeMap<ModuleInstance, ModuleState>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.values().all(ModuleState::is_empty)
    }

    pub fn module(&self, addr: &ModuleInstance) -> Option<&ModuleState> {
        self.modules.get(addr)
    }

    pub fn resource(&self, addr: &AbsResource) -> Option<&ResourceRecord> {
        self.modules.get(&addr.module)?.resources.get(&addr.resource)
    }

    pub fn instance(&self, addr: &AbsResourceInstance) -> Option<&InstanceState> {
        self.resource(&addr.resource())?
            .instances
            .get(&addr.instance.key)
    }

    /// The current object for an instance, if any.
    pub fn instance_object(&self, addr: &AbsResourceInstance) -> Option<&InstanceObject> {
        self.instance(addr)?.current.as_ref()
    }

    pub fn deposed_object(
        &self,
        addr: &AbsResourceInstance,
        key: &DeposedKey,
    ) -> Option<&InstanceObject> {
        self.instance(addr)?.deposed.get(key)
    }

    /// Every resource instance address with a current object, in address
    /// order.
    pub fn all_instance_addrs(&self) -> Vec<AbsResourceInstance> {
        let mut out = Vec::new();
        for (module, mstate) in &self.modules {
            for (resource, record) in &mstate.resources {
                for (key, istate) in &record.instances {
                    if istate.current.is_some() {
                        out.push(
                            resource
                                .instance(key.clone())
                                .absolute(module.clone()),
                        );
                    }
                }
            }
        }
        out
    }

    /// Instance addresses that still hold deposed objects.
    pub fn all_deposed(&self) -> Vec<(AbsResourceInstance, DeposedKey)> {
        let mut out = Vec::new();
        for (module, mstate) in &self.modules {
            for (resource, record) in &mstate.resources {
                for (key, istate) in &record.instances {
                    for dk in istate.deposed.keys() {
                        out.push((
                            resource.instance(key.clone()).absolute(module.clone()),
                            dk.clone(),
                        ));
                    }
                }
            }
        }
        out
    }

    /// Assemble the value a reference to a whole resource sees: a single
    /// object for a singleton, a tuple ordered by index for `count`
    /// instances, a map for `for_each` instances. `None` when nothing is
    /// recorded.
    pub fn resource_value(&self, module: &ModuleInstance, resource: &Resource) -> Option<Value> {
        let record = self
            .modules
            .get(module)?
            .resources
            .get(resource)?;
        let current: Vec<(&Option<InstanceKey>, &InstanceObject)> = record
            .instances
            .iter()
            .filter_map(|(k, i)| i.current.as_ref().map(|o| (k, o)))
            .collect();
        if current.is_empty() {
            return None;
        }

        if current.len() == 1 && current[0].0.is_none() {
            return Some(current[0].1.value.clone());
        }
        match current[0].0 {
            Some(InstanceKey::Str(_)) => {
                let map: std::collections::BTreeMap<String, Value> = current
                    .iter()
                    .filter_map(|(k, o)| match k {
                        Some(InstanceKey::Str(s)) => Some((s.clone(), o.value.clone())),
                        _ => None,
                    })
                    .collect();
                Some(Value::Object(map))
            }
            _ => {
                // Int keys iterate in order already.
                Some(Value::Tuple(
                    current.iter().map(|(_, o)| o.value.clone()).collect(),
                ))
            }
        }
    }

    pub fn root_outputs(&self) -> BTreeMap<String, OutputValue> {
        self.modules
            .get(&ModuleInstance::root())
            .map(|m| m.outputs.clone())
            .unwrap_or_default()
    }

    /// Drop modules and resources that hold nothing.
    pub fn prune(&mut self) {
        for mstate in self.modules.values_mut() {
            mstate.resources.retain(|_, r| !r.is_empty());
        }
        self.modules.retain(|addr, m| addr.is_root() || !m.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::LocalProviderConfig;

    fn addr(key: Option<InstanceKey>) -> AbsResourceInstance {
        Resource::managed("test_instance", "web")
            .instance(key)
            .absolute(ModuleInstance::root())
    }

    fn provider() -> AbsProviderConfig {
        LocalProviderConfig::default_for("test").absolute(ModuleInstance::root())
    }

    #[test]
    fn test_empty_state() {
        let state = State::new();
        assert!(state.is_empty());
        assert!(state.instance_object(&addr(None)).is_none());
        assert!(state.all_instance_addrs().is_empty());
    }

    #[test]
    fn test_instance_lookup_and_ordering() {
        let mut state = State::new();
        let module = ModuleInstance::root();
        let record = state
            .modules
            .entry(module.clone())
            .or_default()
            .resources
            .entry(Resource::managed("test_instance", "web"))
            .or_insert_with(|| ResourceRecord::new(provider()));
        for i in [2, 0, 1] {
            record.instances.insert(
                Some(InstanceKey::Int(i)),
                InstanceState {
                    current: Some(InstanceObject::new(Value::empty_object())),
                    deposed: BTreeMap::new(),
                },
            );
        }

        let addrs = state.all_instance_addrs();
        assert_eq!(addrs.len(), 3);
        // Ordered by key.
        assert_eq!(addrs[0].instance.key, Some(InstanceKey::Int(0)));
        assert_eq!(addrs[2].instance.key, Some(InstanceKey::Int(2)));
        assert!(state.instance_object(&addr(Some(InstanceKey::Int(1)))).is_some());
    }

    #[test]
    fn test_prune_removes_empty_records() {
        let mut state = State::new();
        state
            .modules
            .entry(ModuleInstance::root().child("app", None))
            .or_default()
            .resources
            .insert(
                Resource::managed("test_instance", "web"),
                ResourceRecord::new(provider()),
            );
        assert!(state.is_empty());
        state.prune();
        assert!(state.modules.is_empty());
    }

    #[test]
    fn test_deposed_keys_are_unique_enough() {
        let a = DeposedKey::generate();
        let b = DeposedKey::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 8);
    }
}
