//! Plans and change sets.
//!
//! A plan is the typed diff between prior state and desired configuration:
//! one change per resource instance plus output changes, together with the
//! variable values and targets it was computed under. Plans serialize to a
//! JSON document so `plan -out=FILE` can be replayed by `apply FILE`.

use crate::addrs::{AbsProviderConfig, AbsResourceInstance, ModuleInstance, Target};
use crate::state::DeposedKey;
use crate::value::json::{self, TaggedValue};
use crate::value::{Value, ValueError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The action a change performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    NoOp,
    Create,
    /// Data source read.
    Read,
    Update,
    Delete,
    /// Replace, destroying the old object first.
    DestroyCreate,
    /// Replace, creating the new object before destroying the old one
    /// (create-before-destroy).
    CreateDestroy,
}

impl Action {
    pub fn is_replace(self) -> bool {
        matches!(self, Action::DestroyCreate | Action::CreateDestroy)
    }

    /// Whether applying this change destroys an existing object.
    pub fn destroys(self) -> bool {
        matches!(
            self,
            Action::Delete | Action::DestroyCreate | Action::CreateDestroy
        )
    }

    pub fn is_noop(self) -> bool {
        self == Action::NoOp
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::NoOp => "no-op",
            Action::Create => "create",
            Action::Read => "read",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::DestroyCreate => "replace",
            Action::CreateDestroy => "replace (create first)",
        };
        write!(f, "{s}")
    }
}

/// A planned change for one resource instance (or one of its deposed
/// objects, when `deposed` is set).
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceChange {
    pub addr: AbsResourceInstance,
    pub provider: AbsProviderConfig,
    pub action: Action,
    pub before: Value,
    pub after: Value,
    /// Attribute paths whose change forced a replacement.
    pub required_replace: Vec<String>,
    pub deposed: Option<DeposedKey>,
}

/// A planned change to an output value.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputChange {
    pub module: ModuleInstance,
    pub name: String,
    pub before: Value,
    pub after: Value,
    pub sensitive: bool,
}

/// All changes of one plan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changes {
    pub resources: Vec<ResourceChange>,
    pub outputs: Vec<OutputChange>,
}

impl Changes {
    /// The change for an instance's current object, if planned.
    pub fn resource_change(&self, addr: &AbsResourceInstance) -> Option<&ResourceChange> {
        self.resources
            .iter()
            .find(|c| c.addr == *addr && c.deposed.is_none())
    }

    pub fn deposed_change(
        &self,
        addr: &AbsResourceInstance,
        key: &DeposedKey,
    ) -> Option<&ResourceChange> {
        self.resources
            .iter()
            .find(|c| c.addr == *addr && c.deposed.as_ref() == Some(key))
    }

    /// True when no change performs an action.
    pub fn is_empty(&self) -> bool {
        self.resources.iter().all(|c| c.action.is_noop())
    }

    /// Counts of (create, update, destroy) actions, replacements counting
    /// toward both create and destroy.
    pub fn action_counts(&self) -> (usize, usize, usize) {
        let mut add = 0;
        let mut change = 0;
        let mut destroy = 0;
        for c in &self.resources {
            match c.action {
                Action::Create => add += 1,
                Action::Update => change += 1,
                Action::Delete => destroy += 1,
                Action::DestroyCreate | Action::CreateDestroy => {
                    add += 1;
                    destroy += 1;
                }
                Action::NoOp | Action::Read => {}
            }
        }
        (add, change, destroy)
    }

    /// Stable presentation and application order.
    pub fn sort(&mut self) {
        self.resources.sort_by(|a, b| {
            (a.addr.to_string(), a.deposed.is_some()).cmp(&(b.addr.to_string(), b.deposed.is_some()))
        });
        self.outputs
            .sort_by(|a, b| (&a.module, &a.name).cmp(&(&b.module, &b.name)));
    }
}

/// A complete plan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    /// Variable values the plan was computed with.
    pub variables: BTreeMap<String, Value>,
    pub targets: Vec<Target>,
    /// Whether this is a destroy plan.
    pub destroy: bool,
    /// Canonical provider addresses required by changes, with an optional
    /// SHA-256 digest of the provider binary when one was supplied.
    pub required_providers: BTreeMap<String, Option<String>>,
    pub changes: Changes,
    /// Identity of the state snapshot this plan was computed against.
    pub prior_lineage: Option<String>,
    pub prior_serial: Option<u64>,
}

impl Plan {
    pub fn to_json_string(&self) -> Result<String, ValueError> {
        let doc = PlanDoc::from_plan(self);
        serde_json::to_string_pretty(&doc).map_err(|e| ValueError::TypeMismatch {
            expected: "a serializable plan".into(),
            actual: e.to_string(),
        })
    }

    pub fn from_json_str(text: &str) -> Result<Self, String> {
        let doc: PlanDoc = serde_json::from_str(text).map_err(|e| e.to_string())?;
        doc.into_plan()
    }
}

// ---------------------------------------------------------------------------
// Plan file layout
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct PlanDoc {
    version: u64,
    #[serde(default)]
    destroy: bool,
    #[serde(default)]
    variables: BTreeMap<String, TaggedValue>,
    #[serde(default)]
    targets: Vec<String>,
    #[serde(default)]
    required_providers: BTreeMap<String, Option<String>>,
    #[serde(default)]
    resource_changes: Vec<ResourceChangeDoc>,
    #[serde(default)]
    output_changes: Vec<OutputChangeDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prior_lineage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prior_serial: Option<u64>,
}

const PLAN_VERSION: u64 = 1;

#[derive(Serialize, Deserialize)]
struct ResourceChangeDoc {
    addr: String,
    provider: String,
    action: Action,
    before: TaggedValue,
    after: TaggedValue,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    required_replace: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deposed: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct OutputChangeDoc {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    module: String,
    name: String,
    before: TaggedValue,
    after: TaggedValue,
    #[serde(default)]
    sensitive: bool,
}

impl PlanDoc {
    fn from_plan(plan: &Plan) -> Self {
        PlanDoc {
            version: PLAN_VERSION,
            destroy: plan.destroy,
            variables: plan
                .variables
                .iter()
                .map(|(k, v)| (k.clone(), json::to_tagged(v)))
                .collect(),
            targets: plan.targets.iter().map(Target::to_string).collect(),
            required_providers: plan.required_providers.clone(),
            resource_changes: plan
                .changes
                .resources
                .iter()
                .map(|c| ResourceChangeDoc {
                    addr: c.addr.to_string(),
                    provider: c.provider.to_string(),
                    action: c.action,
                    before: json::to_tagged(&c.before),
                    after: json::to_tagged(&c.after),
                    required_replace: c.required_replace.clone(),
                    deposed: c.deposed.as_ref().map(|d| d.as_str().to_string()),
                })
                .collect(),
            output_changes: plan
                .changes
                .outputs
                .iter()
                .map(|o| OutputChangeDoc {
                    module: o.module.to_string(),
                    name: o.name.clone(),
                    before: json::to_tagged(&o.before),
                    after: json::to_tagged(&o.after),
                    sensitive: o.sensitive,
                })
                .collect(),
            prior_lineage: plan.prior_lineage.clone(),
            prior_serial: plan.prior_serial,
        }
    }

    fn into_plan(self) -> Result<Plan, String> {
        if self.version != PLAN_VERSION {
            return Err(format!("unsupported plan file version {}", self.version));
        }
        let parse_instance = |s: &str| -> Result<AbsResourceInstance, String> {
            match Target::parse(s).map_err(|e| e.to_string())? {
                Target::Instance(i) => Ok(i),
                Target::Resource(r) => Ok(AbsResourceInstance {
                    module: r.module,
                    instance: r.resource.instance(None),
                }),
                Target::Module(_) => Err(format!("{s:?} is not a resource instance address")),
            }
        };

        let mut changes = Changes::default();
        for doc in self.resource_changes {
            changes.resources.push(ResourceChange {
                addr: parse_instance(&doc.addr)?,
                provider: AbsProviderConfig::parse(&doc.provider).map_err(|e| e.to_string())?,
                action: doc.action,
                before: json::from_tagged(&doc.before).map_err(|e| e.to_string())?,
                after: json::from_tagged(&doc.after).map_err(|e| e.to_string())?,
                required_replace: doc.required_replace,
                deposed: doc.deposed.map(DeposedKey::from),
            });
        }
        for doc in self.output_changes {
            changes.outputs.push(OutputChange {
                module: ModuleInstance::parse(&doc.module).map_err(|e| e.to_string())?,
                name: doc.name,
                before: json::from_tagged(&doc.before).map_err(|e| e.to_string())?,
                after: json::from_tagged(&doc.after).map_err(|e| e.to_string())?,
                sensitive: doc.sensitive,
            });
        }

        let mut variables = BTreeMap::new();
        for (k, v) in self.variables {
            variables.insert(k, json::from_tagged(&v).map_err(|e| e.to_string())?);
        }

        let mut targets = Vec::new();
        for t in self.targets {
            targets.push(Target::parse(&t).map_err(|e| e.to_string())?);
        }

        Ok(Plan {
            variables,
            targets,
            destroy: self.destroy,
            required_providers: self.required_providers,
            changes,
            prior_lineage: self.prior_lineage,
            prior_serial: self.prior_serial,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::{InstanceKey, LocalProviderConfig, Resource};
    use crate::value::Ty;

    fn sample_plan() -> Plan {
        let addr = Resource::managed("test_instance", "web")
            .instance(Some(InstanceKey::Int(0)))
            .absolute(ModuleInstance::root());
        let provider = LocalProviderConfig::default_for("test").absolute(ModuleInstance::root());
        Plan {
            variables: BTreeMap::from([("region".to_string(), Value::string("us"))]),
            targets: vec![Target::parse("test_instance.web").unwrap()],
            destroy: false,
            required_providers: BTreeMap::from([("provider.test".to_string(), None)]),
            changes: Changes {
                resources: vec![ResourceChange {
                    addr,
                    provider,
                    action: Action::Create,
                    before: Value::Null(Ty::Dynamic),
                    after: Value::Object(
                        [
                            ("ami".to_string(), Value::string("ami-1")),
                            ("id".to_string(), Value::Unknown(Ty::String)),
                        ]
                        .into(),
                    ),
                    required_replace: Vec::new(),
                    deposed: None,
                }],
                outputs: Vec::new(),
            },
            prior_lineage: Some("abc".to_string()),
            prior_serial: Some(3),
        }
    }

    #[test]
    fn test_plan_file_round_trip() {
        let plan = sample_plan();
        let text = plan.to_json_string().unwrap();
        let back = Plan::from_json_str(&text).unwrap();
        assert_eq!(back, plan);
        // Unknown markers survive the file.
        assert!(
            back.changes.resources[0]
                .after
                .get_attr("id")
                .unwrap()
                .is_unknown()
        );
    }

    #[test]
    fn test_changes_queries() {
        let plan = sample_plan();
        let addr = &plan.changes.resources[0].addr;
        assert!(plan.changes.resource_change(addr).is_some());
        assert!(!plan.changes.is_empty());
        assert_eq!(plan.changes.action_counts(), (1, 0, 0));
    }

    #[test]
    fn test_noop_only_changes_are_empty() {
        let mut plan = sample_plan();
        plan.changes.resources[0].action = Action::NoOp;
        assert!(plan.changes.is_empty());
    }

    #[test]
    fn test_replace_counts_both_ways() {
        let mut plan = sample_plan();
        plan.changes.resources[0].action = Action::CreateDestroy;
        assert_eq!(plan.changes.action_counts(), (1, 0, 1));
        assert!(plan.changes.resources[0].action.is_replace());
        assert!(plan.changes.resources[0].action.destroys());
    }

    #[test]
    fn test_sort_is_stable_by_address() {
        let mut changes = Changes::default();
        let provider = LocalProviderConfig::default_for("test").absolute(ModuleInstance::root());
        for name in ["b", "a", "c"] {
            changes.resources.push(ResourceChange {
                addr: Resource::managed("test_instance", name)
                    .instance(None)
                    .absolute(ModuleInstance::root()),
                provider: provider.clone(),
                action: Action::Create,
                before: Value::Null(Ty::Dynamic),
                after: Value::empty_object(),
                required_replace: Vec::new(),
                deposed: None,
            });
        }
        changes.sort();
        let names: Vec<_> = changes
            .resources
            .iter()
            .map(|c| c.addr.instance.resource.name.clone())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
