//! The orchestrator.
//!
//! `Context` hosts the public operations: validate, refresh, plan, apply,
//! and destroy. It wires configuration, prior state, variables, provider
//! factories, targets, and hooks together, builds the per-operation graph,
//! and runs the walk. Every successful operation returns a fresh state
//! snapshot; the input snapshot is never mutated.

use crate::addrs::Target;
use crate::config::Config;
use crate::diag::{Diagnostic, Diagnostics};
use crate::graph::{GraphBuilder, WalkKind};
use crate::hooks::{Hook, NullHook};
use crate::plan::{Changes, Plan};
use crate::provider::{ProviderResolver, ProviderSchema};
use crate::state::{State, SyncState};
use crate::value::{Ty, Value};
use crate::walk::{self, ProviderRegistry, WalkContext};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

/// Inputs for building a [`Context`].
pub struct ContextOptions {
    pub config: Config,
    pub state: State,
    /// Identity of the state snapshot, when it came from a state file:
    /// `(lineage, serial)`.
    pub state_meta: Option<(String, u64)>,
    /// Root input variable values as supplied by the caller.
    pub variables: BTreeMap<String, Value>,
    pub providers: ProviderResolver,
    pub targets: Vec<Target>,
    pub hooks: Arc<dyn Hook>,
    pub parallelism: usize,
    pub workspace: String,
    pub root_path: PathBuf,
}

impl ContextOptions {
    pub fn new(config: Config, state: State, providers: ProviderResolver) -> Self {
        Self {
            config,
            state,
            state_meta: None,
            variables: BTreeMap::new(),
            providers,
            targets: Vec::new(),
            hooks: Arc::new(NullHook),
            parallelism: walk::DEFAULT_PARALLELISM,
            workspace: "default".to_string(),
            root_path: PathBuf::from("."),
        }
    }
}

pub struct Context {
    config: Config,
    state: State,
    state_meta: Option<(String, u64)>,
    variables: BTreeMap<String, Value>,
    resolver: ProviderResolver,
    schemas: BTreeMap<String, ProviderSchema>,
    targets: Vec<Target>,
    hooks: Arc<dyn Hook>,
    parallelism: usize,
    workspace: String,
    root_path: PathBuf,
    cancel: Arc<AtomicBool>,
}

impl Context {
    /// Build a context: resolves root variables against their
    /// declarations and fetches every provider's schema.
    pub fn new(options: ContextOptions) -> Result<Self, Diagnostics> {
        let mut diags = Diagnostics::new();

        let variables =
            resolve_root_variables(&options.config, &options.variables, &mut diags);

        let mut schemas = BTreeMap::new();
        for (type_name, factory) in &options.providers.factories {
            match factory() {
                Ok(instance) => {
                    match instance.schema() {
                        Ok(schema) => {
                            schemas.insert(type_name.clone(), schema);
                        }
                        Err(failure) => {
                            diags.push(
                                Diagnostic::error(format!(
                                    "failed to fetch schema for provider {type_name:?}"
                                ))
                                .with_detail(failure.summary),
                            );
                        }
                    }
                    instance.close();
                }
                Err(err) => {
                    diags.push(
                        Diagnostic::error(format!(
                            "failed to instantiate provider {type_name:?}"
                        ))
                        .with_detail(err),
                    );
                }
            }
        }

        if diags.has_errors() {
            return Err(diags);
        }

        Ok(Self {
            config: options.config,
            state: options.state,
            state_meta: options.state_meta,
            variables,
            resolver: options.providers,
            schemas,
            targets: options.targets,
            hooks: options.hooks,
            parallelism: options.parallelism,
            workspace: options.workspace,
            root_path: options.root_path,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A handle that cancels in-flight operations when set.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn schemas(&self) -> &BTreeMap<String, ProviderSchema> {
        &self.schemas
    }

    /// Static configuration checking: schema and expression-reference
    /// checks without any resource I/O.
    pub fn validate(&self) -> Diagnostics {
        let (_, _, diags) = self.run_walk(WalkKind::Validate, None);
        diags
    }

    /// Read every managed instance from its provider and return the
    /// state observed. Data resources with fully-known configuration are
    /// read as well.
    pub fn refresh(&self) -> (State, Diagnostics) {
        let (state, _, diags) = self.run_walk(WalkKind::Refresh, None);
        (state, diags)
    }

    /// Compute the change set between prior state and configuration.
    /// With `destroy`, every instance is planned for deletion.
    pub fn plan(&self, destroy: bool) -> (Plan, State, Diagnostics) {
        let op = if destroy {
            WalkKind::PlanDestroy
        } else {
            WalkKind::Plan
        };
        let (state, changes, diags) = self.run_walk(op, None);

        let mut changes = changes;
        changes.sort();

        let mut required_providers = BTreeMap::new();
        for change in &changes.resources {
            let type_name = change.provider.config.local_name.clone();
            let digest = self.resolver.digest(&type_name).map(str::to_string);
            required_providers.insert(change.provider.to_string(), digest);
        }

        let plan = Plan {
            variables: self.variables.clone(),
            targets: self.targets.clone(),
            destroy,
            required_providers,
            changes,
            prior_lineage: self.state_meta.as_ref().map(|(l, _)| l.clone()),
            prior_serial: self.state_meta.as_ref().map(|(_, s)| *s),
        };
        (plan, state, diags)
    }

    /// Execute a plan's changes in dependency order. On a provider
    /// failure the affected subtree is skipped; everything else applies,
    /// and the returned state reflects exactly what happened.
    pub fn apply(&self, plan: &Plan) -> (State, Diagnostics) {
        let mut diags = Diagnostics::new();

        if let Some(err) = self.check_plan_compatibility(plan) {
            diags.push(err);
            return (self.state.clone(), diags);
        }

        let (state, _, walk_diags) = self.run_walk(WalkKind::Apply, Some(plan));
        diags.extend(walk_diags);
        (state, diags)
    }

    /// Plan and apply a full destroy.
    pub fn destroy(&self) -> (State, Diagnostics) {
        let (plan, _, mut diags) = self.plan(true);
        if diags.has_errors() {
            return (self.state.clone(), diags);
        }
        let (state, apply_diags) = self.apply(&plan);
        diags.extend(apply_diags);
        (state, diags)
    }

    /// Plans apply only against the state snapshot they were computed
    /// from, and only with the provider binaries they recorded.
    fn check_plan_compatibility(&self, plan: &Plan) -> Option<Diagnostic> {
        if let (Some(expected), Some((lineage, serial))) =
            (plan.prior_lineage.as_ref(), self.state_meta.as_ref())
        {
            if expected != lineage {
                return Some(
                    Diagnostic::error("plan was created against a different state")
                        .with_detail(format!(
                            "the plan's state lineage {expected} does not match {lineage}"
                        )),
                );
            }
            if plan.prior_serial.is_some() && plan.prior_serial != Some(*serial) {
                return Some(
                    Diagnostic::error("state has changed since the plan was created")
                        .with_detail(format!(
                            "the plan was computed against serial {:?}, but the state is at {serial}; \
                             run plan again",
                            plan.prior_serial
                        )),
                );
            }
        }

        for (addr, recorded) in &plan.required_providers {
            let Some(recorded) = recorded else {
                continue;
            };
            let type_name = match crate::addrs::AbsProviderConfig::parse(addr) {
                Ok(p) => p.config.local_name,
                Err(_) => continue,
            };
            match self.resolver.digest(&type_name) {
                Some(current) if current == recorded => {}
                other => {
                    return Some(
                        Diagnostic::error("provider checksum mismatch")
                            .with_detail(format!(
                                "the plan was created with provider {addr} digest {recorded}, \
                                 but the current binary digest is {other:?}"
                            )),
                    );
                }
            }
        }
        None
    }

    fn run_walk(&self, op: WalkKind, plan: Option<&Plan>) -> (State, Changes, Diagnostics) {
        let sync = SyncState::new(self.state.clone());
        let changes = Mutex::new(Changes::default());
        let registry = ProviderRegistry::new(self.resolver.clone());

        let variables = match plan {
            Some(p) => p.variables.clone(),
            None => self.variables.clone(),
        };
        let targets: &[Target] = match plan {
            Some(p) => &p.targets,
            None => &self.targets,
        };

        let builder = GraphBuilder {
            config: &self.config,
            state: &self.state,
            op,
            targets,
            root_variables: &variables,
            schemas: &self.schemas,
            changes: plan.map(|p| &p.changes),
            workspace: &self.workspace,
            root_path: &self.root_path,
        };
        let graph = match builder.build() {
            Ok(g) => g,
            Err(diags) => return (self.state.clone(), Changes::default(), diags),
        };
        log::debug!("built {op:?} graph with {} nodes", graph.len());

        let module_vars = Mutex::new(BTreeMap::from([(
            crate::addrs::ModuleInstance::root(),
            variables,
        )]));
        let deposed_keys = Mutex::new(BTreeMap::new());

        let ctx = WalkContext {
            op,
            config: &self.config,
            sync: &sync,
            changes: &changes,
            planned: plan.map(|p| &p.changes),
            registry: &registry,
            schemas: &self.schemas,
            hooks: self.hooks.as_ref(),
            module_vars: &module_vars,
            deposed_keys: &deposed_keys,
            workspace: &self.workspace,
            root_path: &self.root_path,
            cancel: &self.cancel,
        };

        let mut diags = walk::walk(&graph, &ctx, self.parallelism);
        diags.sort();
        let changes = changes.into_inner().expect("changes lock poisoned");
        (sync.into_state(), changes, diags)
    }
}

fn resolve_root_variables(
    config: &Config,
    supplied: &BTreeMap<String, Value>,
    diags: &mut Diagnostics,
) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();

    for name in supplied.keys() {
        if !config.root.variables.contains_key(name) {
            diags.push(
                Diagnostic::error(format!("value supplied for undeclared variable {name:?}"))
                    .with_detail("remove the value or declare the variable in the root module"),
            );
        }
    }

    for (name, decl) in &config.root.variables {
        let raw = match supplied.get(name) {
            Some(v) => Some(v.clone()),
            None => decl
                .default
                .as_ref()
                .map(|json| {
                    crate::value::json::from_plain(json, &Ty::Dynamic)
                        .unwrap_or(Value::Null(Ty::Dynamic))
                }),
        };
        let Some(raw) = raw else {
            diags.push(
                Diagnostic::error(format!("no value for required variable {name:?}"))
                    .with_detail(format!(
                        "the variable {name:?} has no default, so a value must be supplied"
                    )),
            );
            continue;
        };
        let value = match &decl.ty {
            Some(ty) => match raw.convert(ty) {
                Ok(v) => v,
                Err(err) => {
                    diags.push(
                        Diagnostic::error(format!("invalid value for variable {name:?}"))
                            .with_detail(err.to_string()),
                    );
                    continue;
                }
            },
            None => raw,
        };
        out.insert(name.clone(), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::{MockProvider, test_provider_schema};
    use crate::provider::{ProviderFactory, SharedProvider};

    fn resolver() -> ProviderResolver {
        let factories = BTreeMap::from([(
            "test".to_string(),
            Arc::new(|| Ok(Arc::new(MockProvider::new(test_provider_schema())) as SharedProvider))
                as ProviderFactory,
        )]);
        ProviderResolver::new(factories)
    }

    fn config(text: &str) -> Config {
        Config::from_json_str(text).unwrap()
    }

    #[test]
    fn test_variable_resolution() {
        let config = config(
            r#"{
                "variables": {
                    "region": {"type": "string"},
                    "size": {"type": "number", "default": 2}
                }
            }"#,
        );
        let mut diags = Diagnostics::new();
        let supplied = BTreeMap::from([("region".to_string(), Value::string("us"))]);
        let vars = resolve_root_variables(&config, &supplied, &mut diags);
        assert!(!diags.has_errors());
        assert_eq!(vars.get("region"), Some(&Value::string("us")));
        assert_eq!(vars.get("size"), Some(&Value::number_int(2)));
    }

    #[test]
    fn test_missing_required_variable() {
        let config = config(r#"{"variables": {"region": {"type": "string"}}}"#);
        let mut diags = Diagnostics::new();
        resolve_root_variables(&config, &BTreeMap::new(), &mut diags);
        assert!(diags.has_errors());
        assert!(diags.to_report().contains("required variable"));
    }

    #[test]
    fn test_undeclared_variable_supplied() {
        let config = config("{}");
        let mut diags = Diagnostics::new();
        let supplied = BTreeMap::from([("nope".to_string(), Value::string("x"))]);
        resolve_root_variables(&config, &supplied, &mut diags);
        assert!(diags.has_errors());
        assert!(diags.to_report().contains("undeclared variable"));
    }

    #[test]
    fn test_context_new_fetches_schemas() {
        let ctx = Context::new(ContextOptions::new(
            Config::default(),
            State::new(),
            resolver(),
        ))
        .unwrap();
        assert!(ctx.schemas().contains_key("test"));
    }

    #[test]
    fn test_validate_catches_missing_required_attribute() {
        let ctx = Context::new(ContextOptions::new(
            config(
                r#"{
                    "providers": [{"name": "test"}],
                    "resources": [{"type": "test_instance", "name": "web", "config": {}}]
                }"#,
            ),
            State::new(),
            resolver(),
        ))
        .unwrap();
        let diags = ctx.validate();
        assert!(diags.has_errors());
        assert!(diags.to_report().contains("ami"));
    }

    #[test]
    fn test_plan_checksum_recorded_and_verified() {
        let ctx = Context::new(ContextOptions::new(
            config(
                r#"{
                    "providers": [{"name": "test"}],
                    "resources": [{
                        "type": "test_instance", "name": "web",
                        "config": {"ami": {"lit": "ami-1"}}
                    }]
                }"#,
            ),
            State::new(),
            resolver().with_digest("test", "abc123"),
        ))
        .unwrap();
        let (plan, _, diags) = ctx.plan(false);
        assert!(!diags.has_errors(), "{}", diags.to_report());
        assert_eq!(
            plan.required_providers.get("provider.test"),
            Some(&Some("abc123".to_string()))
        );

        // A context with a different binary refuses the plan.
        let other = Context::new(ContextOptions::new(
            config(
                r#"{
                    "providers": [{"name": "test"}],
                    "resources": [{
                        "type": "test_instance", "name": "web",
                        "config": {"ami": {"lit": "ami-1"}}
                    }]
                }"#,
            ),
            State::new(),
            resolver().with_digest("test", "different"),
        ))
        .unwrap();
        let (_, diags) = other.apply(&plan);
        assert!(diags.has_errors());
        assert!(diags.to_report().contains("checksum"));
    }
}
