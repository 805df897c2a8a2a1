//! Graph node variants.
//!
//! Every node is one variant of a single tagged sum. A node's behavior
//! during a walk depends on both its variant and the walk kind; the walker
//! interprets the per-variant eval step sequences.

use crate::addrs::{AbsProviderConfig, AbsResourceInstance, ModuleInstance};
use crate::state::DeposedKey;
use crate::value::Value;
use std::fmt;

/// A resource instance node, produced by expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceInstanceNode {
    pub addr: AbsResourceInstance,
    /// The provider configuration this instance resolved to.
    pub provider: AbsProviderConfig,
    /// Binding for `count.index` inside the instance's expressions.
    pub count_index: Option<i64>,
    /// Bindings for `each.key` / `each.value`.
    pub each: Option<(Value, Value)>,
    pub create_before_destroy: bool,
}

/// One node of the dependency graph.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Terminal sink; depends on every other node.
    Root,
    /// Evaluates a module call's inputs into the child instance's
    /// variable values. One per non-root module instance.
    ModuleExpand { module: ModuleInstance },
    /// Creates and configures one provider instance.
    ProviderConfigure {
        addr: AbsProviderConfig,
        provider_type: String,
    },
    /// Closes a provider after its last user finished.
    ProviderClose { addr: AbsProviderConfig },
    /// A managed or data resource instance present in configuration.
    ResourceInstance(ResourceInstanceNode),
    /// Destroys an instance object that has no configuration counterpart:
    /// an orphan, a destroy-plan victim, or a deposed object.
    DestroyInstance {
        addr: AbsResourceInstance,
        provider: AbsProviderConfig,
        /// When set, the node destroys this deposed object instead of the
        /// current one.
        deposed: Option<DeposedKey>,
        /// Lifecycle flag recorded for ordering and policy checks.
        create_before_destroy: bool,
    },
    /// Destroys whatever object was deposed for `addr` during this same
    /// walk (create-before-destroy replacements).
    DestroyDeposedPending {
        addr: AbsResourceInstance,
        provider: AbsProviderConfig,
    },
    /// Evaluates and records one output value.
    Output { module: ModuleInstance, name: String },
    /// A named local value; exists for ordering and cycle detection.
    Local { module: ModuleInstance, name: String },
    /// A root input variable.
    Variable { name: String },
}

impl Node {
    /// Unique, canonical key; peer scheduling sorts by this string, which
    /// keeps walks deterministic for a fixed input.
    pub fn key(&self) -> String {
        match self {
            Node::Root => "[root]".to_string(),
            Node::ModuleExpand { module } => format!("{module} (expand)"),
            Node::ProviderConfigure { addr, .. } => addr.to_string(),
            Node::ProviderClose { addr } => format!("{addr} (close)"),
            Node::ResourceInstance(n) => n.addr.to_string(),
            Node::DestroyInstance { addr, deposed, .. } => match deposed {
                None => format!("{addr} (destroy)"),
                Some(key) => format!("{addr} (destroy deposed {key})"),
            },
            Node::DestroyDeposedPending { addr, .. } => {
                format!("{addr} (destroy deposed)")
            }
            Node::Output { module, name } => {
                if module.is_root() {
                    format!("output.{name}")
                } else {
                    format!("{module}.output.{name}")
                }
            }
            Node::Local { module, name } => {
                if module.is_root() {
                    format!("local.{name}")
                } else {
                    format!("{module}.local.{name}")
                }
            }
            Node::Variable { name } => format!("var.{name}"),
        }
    }

    /// The module instance whose scope this node evaluates in.
    pub fn module(&self) -> ModuleInstance {
        match self {
            Node::Root | Node::Variable { .. } => ModuleInstance::root(),
            Node::ModuleExpand { module } => module.clone(),
            Node::ProviderConfigure { addr, .. } | Node::ProviderClose { addr } => {
                addr.module.clone()
            }
            Node::ResourceInstance(n) => n.addr.module.clone(),
            Node::DestroyInstance { addr, .. } | Node::DestroyDeposedPending { addr, .. } => {
                addr.module.clone()
            }
            Node::Output { module, .. } | Node::Local { module, .. } => module.clone(),
        }
    }

    pub fn is_provider(&self) -> bool {
        matches!(
            self,
            Node::ProviderConfigure { .. } | Node::ProviderClose { .. }
        )
    }

    /// The instance address a targeting expression can select.
    pub fn target_addr(&self) -> Option<&AbsResourceInstance> {
        match self {
            Node::ResourceInstance(n) => Some(&n.addr),
            Node::DestroyInstance { addr, .. } | Node::DestroyDeposedPending { addr, .. } => {
                Some(addr)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}
