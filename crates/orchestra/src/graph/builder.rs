//! Graph construction.
//!
//! Builds the per-operation dependency graph from configuration plus prior
//! state: module and resource expansion, provider wiring with inheritance,
//! reference edges, orphan destroy nodes, create-before-destroy ordering,
//! target pruning, and final DAG validation.

use super::{Graph, Node, ResourceInstanceNode};
use crate::addrs::{
    AbsProviderConfig, AbsResourceInstance, InstanceKey, LocalProviderConfig, ModuleInstance,
    Resource, Target,
};
use crate::config::{Config, ModuleConfig, ResourceConfig};
use crate::diag::{Diagnostic, Diagnostics};
use crate::expr::eval::{self, EvalData, Scope};
use crate::expr::{Expr, Reference};
use crate::plan::{Action, Changes};
use crate::provider::ProviderSchema;
use crate::state::State;
use crate::value::{Ty, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// The operation a graph is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkKind {
    Validate,
    Refresh,
    Plan,
    PlanDestroy,
    Apply,
}

impl WalkKind {
    pub fn is_plan(self) -> bool {
        matches!(self, WalkKind::Plan | WalkKind::PlanDestroy)
    }
}

pub struct GraphBuilder<'a> {
    pub config: &'a Config,
    pub state: &'a State,
    pub op: WalkKind,
    pub targets: &'a [Target],
    pub root_variables: &'a BTreeMap<String, Value>,
    /// Provider schemas by provider type local name.
    pub schemas: &'a BTreeMap<String, ProviderSchema>,
    /// Planned changes; required when building an apply graph.
    pub changes: Option<&'a Changes>,
    pub workspace: &'a str,
    pub root_path: &'a Path,
}

/// Accumulated build-time context.
#[derive(Default)]
struct BuildState {
    /// Best-effort variable values per module instance, for evaluating
    /// expansion expressions.
    module_vars: BTreeMap<ModuleInstance, BTreeMap<String, Value>>,
    /// Instance node indices per absolute resource address string.
    resource_nodes: BTreeMap<String, Vec<usize>>,
    /// Node index per absolute instance address string.
    instance_nodes: BTreeMap<String, usize>,
    /// Destroy node indices per absolute instance address.
    destroy_nodes: BTreeMap<String, (AbsResourceInstance, Vec<usize>)>,
    /// Users of each provider node, for close ordering.
    provider_users: BTreeMap<usize, Vec<usize>>,
}

impl GraphBuilder<'_> {
    pub fn build(&self) -> Result<Graph, Diagnostics> {
        let mut graph = Graph::new();
        let mut diags = Diagnostics::new();
        let mut ctx = BuildState::default();
        ctx.module_vars
            .insert(ModuleInstance::root(), self.root_variables.clone());

        // Phases 1-3: expansion and provider wiring, recursively.
        self.expand_module(&mut graph, &ModuleInstance::root(), &mut ctx, &mut diags);

        // Phase 5: instances in state with no configuration counterpart.
        self.add_orphans(&mut graph, &mut ctx, &mut diags);

        // Phase 4: reference edges, now that every node exists.
        self.add_reference_edges(&mut graph, &mut ctx);

        // Destroy ordering: a destroyed dependency outlives its dependents.
        self.add_destroy_ordering(&mut graph, &ctx);

        // Phase 6: create-before-destroy rewrite for replacements.
        if self.op == WalkKind::Apply {
            self.add_cbd_nodes(&mut graph, &mut ctx);
        }

        // Close each provider after its last user.
        for (provider_idx, users) in &ctx.provider_users {
            let Node::ProviderConfigure { addr, .. } = graph.node(*provider_idx).clone() else {
                continue;
            };
            let close = graph.add_node(Node::ProviderClose { addr });
            graph.add_dep(close, *provider_idx);
            for &user in users {
                graph.add_dep(close, user);
            }
        }

        // Phase 7: target pruning.
        if !self.targets.is_empty() {
            self.apply_targets(&mut graph);
        }

        // The root node runs last.
        let root = graph.add_node(Node::Root);
        for idx in 0..graph.len() {
            if idx != root {
                graph.add_dep(root, idx);
            }
        }

        // Phase 8: DAG validation.
        diags.extend(graph.validate());
        if diags.has_errors() {
            return Err(diags);
        }
        Ok(graph)
    }

    // -- Phases 1-3 ---------------------------------------------------------

    fn expand_module(
        &self,
        graph: &mut Graph,
        module: &ModuleInstance,
        ctx: &mut BuildState,
        diags: &mut Diagnostics,
    ) {
        let Some(mconfig) = self.config.module(module) else {
            return;
        };

        if module.is_root() {
            for name in mconfig.variables.keys() {
                graph.add_node(Node::Variable { name: name.clone() });
            }
        } else {
            graph.add_node(Node::ModuleExpand {
                module: module.clone(),
            });
        }
        for name in mconfig.locals.keys() {
            graph.add_node(Node::Local {
                module: module.clone(),
                name: name.clone(),
            });
        }
        for name in mconfig.outputs.keys() {
            graph.add_node(Node::Output {
                module: module.clone(),
                name: name.clone(),
            });
        }
        for block in &mconfig.providers {
            graph.add_node(Node::ProviderConfigure {
                addr: block.local_addr().absolute(module.clone()),
                provider_type: block.name.clone(),
            });
        }

        if self.op != WalkKind::PlanDestroy {
            for resource in &mconfig.resources {
                self.expand_resource(graph, module, mconfig, resource, ctx, diags);
            }
        }

        for (call_name, call) in &mconfig.module_calls {
            let keys = self.expansion_keys(
                module,
                mconfig,
                call.count.as_ref(),
                call.for_each.as_ref(),
                ctx,
                diags,
                &format!("module.{call_name}"),
            );
            for (key, _each_value) in keys {
                let child = module.child(call_name.clone(), key);
                // Resolve the child's input variables now, best effort,
                // so nested expansion expressions can use them.
                let child_config = &call.module;
                let mut child_vars = BTreeMap::new();
                let parent_vars = ctx.module_vars.get(module).cloned().unwrap_or_default();
                {
                    let data = StateData { state: self.state };
                    let scope = Scope {
                        module,
                        module_config: mconfig,
                        variables: &parent_vars,
                        data: &data,
                        each: None,
                        count_index: None,
                        self_addr: None,
                        workspace: self.workspace,
                        root_path: self.root_path,
                        pure_only: true,
                    };
                    for (var_name, var_config) in &child_config.variables {
                        let value = match call.inputs.get(var_name) {
                            Some(expr) => {
                                let mut scratch = Diagnostics::new();
                                eval::evaluate(&scope, expr, &mut scratch)
                            }
                            None => match &var_config.default {
                                Some(json) => {
                                    crate::value::json::from_plain(json, &Ty::Dynamic)
                                        .unwrap_or(Value::Null(Ty::Dynamic))
                                }
                                None => Value::Null(Ty::Dynamic),
                            },
                        };
                        child_vars.insert(var_name.clone(), value);
                    }
                }
                ctx.module_vars.insert(child.clone(), child_vars);
                self.expand_module(graph, &child, ctx, diags);
            }
        }
    }

    fn expand_resource(
        &self,
        graph: &mut Graph,
        module: &ModuleInstance,
        mconfig: &ModuleConfig,
        resource: &ResourceConfig,
        ctx: &mut BuildState,
        diags: &mut Diagnostics,
    ) {
        let addr = resource.addr();
        let keys = self.expansion_keys(
            module,
            mconfig,
            resource.count.as_ref(),
            resource.for_each.as_ref(),
            ctx,
            diags,
            &addr.to_string(),
        );

        let Some((provider_idx, provider_addr)) =
            self.resolve_provider(graph, module, &resource.provider_config(), diags)
        else {
            return;
        };

        for (key, each_value) in keys {
            let count_index = match &key {
                Some(InstanceKey::Int(i)) => Some(*i),
                _ => None,
            };
            let each = match (&key, each_value) {
                (Some(InstanceKey::Str(k)), Some(v)) => Some((Value::string(k.clone()), v)),
                _ => None,
            };
            let instance_addr = addr.instance(key).absolute(module.clone());
            let node = graph.add_node(Node::ResourceInstance(ResourceInstanceNode {
                addr: instance_addr.clone(),
                provider: provider_addr.clone(),
                count_index,
                each,
                create_before_destroy: resource.lifecycle.create_before_destroy,
            }));
            graph.add_dep(node, provider_idx);
            ctx.provider_users.entry(provider_idx).or_default().push(node);
            if !module.is_root() {
                let expand = graph.add_node(Node::ModuleExpand {
                    module: module.clone(),
                });
                graph.add_dep(node, expand);
            }
            ctx.resource_nodes
                .entry(addr.absolute(module.clone()).to_string())
                .or_default()
                .push(node);
            ctx.instance_nodes.insert(instance_addr.to_string(), node);
        }
    }

    /// Evaluate `count` / `for_each` into concrete instance keys. The
    /// controlling expression must be known; expansion cannot wait for
    /// apply.
    fn expansion_keys(
        &self,
        module: &ModuleInstance,
        mconfig: &ModuleConfig,
        count: Option<&Expr>,
        for_each: Option<&Expr>,
        ctx: &BuildState,
        diags: &mut Diagnostics,
        subject: &str,
    ) -> Vec<(Option<InstanceKey>, Option<Value>)> {
        let vars = ctx.module_vars.get(module).cloned().unwrap_or_default();
        let data = StateData { state: self.state };
        let scope = Scope {
            module,
            module_config: mconfig,
            variables: &vars,
            data: &data,
            each: None,
            count_index: None,
            self_addr: None,
            workspace: self.workspace,
            root_path: self.root_path,
            pure_only: true,
        };

        if let Some(expr) = count {
            let mut eval_diags = Diagnostics::new();
            let v = eval::evaluate(&scope, expr, &mut eval_diags);
            if self.op == WalkKind::Validate {
                // Validation tolerates unknown expansion; one placeholder
                // instance stands in for the set.
                if !v.is_whole_known() || eval_diags.has_errors() {
                    return vec![(None, None)];
                }
            }
            if eval_diags.has_errors() {
                diags.extend(eval_diags);
                return Vec::new();
            }
            diags.extend(eval_diags);
            if !v.is_whole_known() {
                diags.push(
                    Diagnostic::error("count depends on values not yet known")
                        .with_detail(
                            "the count expression must be known at plan time; \
                             it cannot depend on attributes decided during apply",
                        )
                        .with_address(subject.to_string()),
                );
                return Vec::new();
            }
            use bigdecimal::ToPrimitive;
            let n = match v.as_number().ok().and_then(|n| n.to_i64()) {
                Some(n) if n >= 0 => n,
                _ => {
                    diags.push(
                        Diagnostic::error("invalid count value")
                            .with_detail(format!("count must be a whole number, got {v}"))
                            .with_address(subject.to_string()),
                    );
                    return Vec::new();
                }
            };
            return (0..n).map(|i| (Some(InstanceKey::Int(i)), None)).collect();
        }

        if let Some(expr) = for_each {
            let mut eval_diags = Diagnostics::new();
            let v = eval::evaluate(&scope, expr, &mut eval_diags);
            if self.op == WalkKind::Validate && (!v.is_whole_known() || eval_diags.has_errors()) {
                return vec![(None, None)];
            }
            if eval_diags.has_errors() {
                diags.extend(eval_diags);
                return Vec::new();
            }
            diags.extend(eval_diags);
            if !v.is_whole_known() {
                diags.push(
                    Diagnostic::error("for_each depends on values not yet known")
                        .with_detail(
                            "the for_each expression must be known at plan time; \
                             it cannot depend on attributes decided during apply",
                        )
                        .with_address(subject.to_string()),
                );
                return Vec::new();
            }
            let pairs = match &v {
                Value::Map(..) | Value::Object(_) | Value::Set(..) => v.iter_pairs(),
                other => {
                    diags.push(
                        Diagnostic::error("invalid for_each value")
                            .with_detail(format!(
                                "for_each accepts a map or a set of strings, got {}",
                                other.ty()
                            ))
                            .with_address(subject.to_string()),
                    );
                    return Vec::new();
                }
            };
            let Ok(pairs) = pairs else {
                return Vec::new();
            };
            return pairs
                .into_iter()
                .filter_map(|(k, val)| match (&v, k, val) {
                    // Sets iterate their elements as both key and value.
                    (Value::Set(..), _, Value::String(s)) => Some((
                        Some(InstanceKey::Str(s.clone())),
                        Some(Value::String(s)),
                    )),
                    (_, Value::String(k), val) => Some((Some(InstanceKey::Str(k)), Some(val))),
                    _ => None,
                })
                .collect();
        }

        vec![(None, None)]
    }

    /// Resolve a resource's provider configuration through module
    /// inheritance: the nearest ancestor module with a matching provider
    /// block wins; aliased configurations never inherit.
    fn resolve_provider(
        &self,
        graph: &mut Graph,
        module: &ModuleInstance,
        wanted: &LocalProviderConfig,
        diags: &mut Diagnostics,
    ) -> Option<(usize, AbsProviderConfig)> {
        if wanted.alias.is_some() {
            let mconfig = self.config.module(module)?;
            if mconfig.provider_block(wanted).is_none() {
                diags.push(
                    Diagnostic::error("unresolved provider configuration")
                        .with_detail(format!(
                            "no configuration for {wanted} in the resource's module; \
                             aliased provider configurations are never inherited"
                        )),
                );
                return None;
            }
            let addr = wanted.absolute(module.clone());
            let idx = graph.add_node(Node::ProviderConfigure {
                addr: addr.clone(),
                provider_type: wanted.local_name.clone(),
            });
            return Some((idx, addr));
        }

        // Default configs: search from this module up to the root.
        let mut search = Some(module.clone());
        while let Some(m) = search {
            if let Some(mconfig) = self.config.module(&m)
                && mconfig.provider_block(wanted).is_some()
            {
                let addr = wanted.absolute(m);
                let idx = graph.add_node(Node::ProviderConfigure {
                    addr: addr.clone(),
                    provider_type: wanted.local_name.clone(),
                });
                return Some((idx, addr));
            }
            search = m.parent();
        }

        // No explicit block anywhere: an implicit empty config at root.
        let addr = wanted.absolute(ModuleInstance::root());
        let idx = graph.add_node(Node::ProviderConfigure {
            addr: addr.clone(),
            provider_type: wanted.local_name.clone(),
        });
        Some((idx, addr))
    }

    // -- Phase 5 ------------------------------------------------------------

    fn add_orphans(&self, graph: &mut Graph, ctx: &mut BuildState, diags: &mut Diagnostics) {
        if self.op == WalkKind::Validate {
            return;
        }

        if self.op == WalkKind::Apply {
            self.add_apply_destroy_nodes(graph, ctx, diags);
            return;
        }

        for addr in self.state.all_instance_addrs() {
            let configured = match self.op {
                WalkKind::PlanDestroy => false,
                _ => self.is_configured(&addr, ctx),
            };
            if configured {
                continue;
            }
            self.add_destroy_node(graph, ctx, &addr, None);
        }

        // Deposed objects always get destroy nodes; they have no config
        // counterpart by definition.
        for (addr, key) in self.state.all_deposed() {
            self.add_destroy_node(graph, ctx, &addr, Some(key));
        }
    }

    /// Whether an instance address is covered by the expanded config.
    fn is_configured(&self, addr: &AbsResourceInstance, ctx: &BuildState) -> bool {
        ctx.instance_nodes.contains_key(&addr.to_string())
    }

    fn add_destroy_node(
        &self,
        graph: &mut Graph,
        ctx: &mut BuildState,
        addr: &AbsResourceInstance,
        deposed: Option<crate::state::DeposedKey>,
    ) {
        let Some(record) = self.state.resource(&addr.resource()) else {
            return;
        };
        let provider_addr = record.provider.clone();
        let provider_idx = graph.add_node(Node::ProviderConfigure {
            addr: provider_addr.clone(),
            provider_type: provider_addr.config.local_name.clone(),
        });
        let cbd = self
            .config
            .module(&addr.module)
            .and_then(|m| m.resource(&addr.instance.resource))
            .map(|r| r.lifecycle.create_before_destroy)
            .unwrap_or(false);
        let node = graph.add_node(Node::DestroyInstance {
            addr: addr.clone(),
            provider: provider_addr,
            deposed,
            create_before_destroy: cbd,
        });
        graph.add_dep(node, provider_idx);
        ctx.provider_users.entry(provider_idx).or_default().push(node);
        ctx.destroy_nodes
            .entry(addr.to_string())
            .or_insert_with(|| (addr.clone(), Vec::new()))
            .1
            .push(node);
    }

    /// Apply graphs take their destroy set from the plan's changes.
    fn add_apply_destroy_nodes(
        &self,
        graph: &mut Graph,
        ctx: &mut BuildState,
        _diags: &mut Diagnostics,
    ) {
        let Some(changes) = self.changes else {
            return;
        };
        for change in &changes.resources {
            // Every Delete gets a dedicated destroy node, even when the
            // resource is still configured (destroy plans): destroys
            // order by the reversed dependency edges recorded in state,
            // not by the create-order reference edges.
            if change.action == Action::Delete {
                self.add_destroy_node(graph, ctx, &change.addr, change.deposed.clone());
            }
        }
    }

    // -- Phase 4 ------------------------------------------------------------

    fn add_reference_edges(&self, graph: &mut Graph, ctx: &mut BuildState) {
        for idx in 0..graph.len() {
            let node = graph.node(idx).clone();
            let module = node.module();
            let refs: Vec<Reference> = match &node {
                Node::ResourceInstance(n) => {
                    let Some(rc) = self
                        .config
                        .module(&module)
                        .and_then(|m| m.resource(&n.addr.instance.resource))
                    else {
                        continue;
                    };
                    resource_references(rc)
                }
                Node::Output { name, .. } => {
                    let Some(out) = self
                        .config
                        .module(&module)
                        .and_then(|m| m.outputs.get(name))
                    else {
                        continue;
                    };
                    out.value.references()
                }
                Node::Local { name, .. } => {
                    let Some(expr) = self
                        .config
                        .module(&module)
                        .and_then(|m| m.locals.get(name))
                    else {
                        continue;
                    };
                    expr.references()
                }
                Node::ModuleExpand { module: child } => {
                    // Input expressions evaluate in the parent's scope.
                    let parent = child.parent().unwrap_or_default();
                    let Some(call) = child
                        .0
                        .last()
                        .and_then(|step| self.config.module(&parent)?.module_calls.get(&step.name))
                    else {
                        continue;
                    };
                    let mut refs: Vec<Reference> = call
                        .inputs
                        .values()
                        .flat_map(Expr::references)
                        .collect();
                    if let Some(e) = &call.count {
                        refs.extend(e.references());
                    }
                    if let Some(e) = &call.for_each {
                        refs.extend(e.references());
                    }
                    // Parent-scope references.
                    self.add_edges_for_refs(graph, ctx, idx, &parent, refs);
                    if !parent.is_root() {
                        let parent_expand = graph.add_node(Node::ModuleExpand { module: parent });
                        graph.add_dep(idx, parent_expand);
                    }
                    continue;
                }
                Node::ProviderConfigure { addr, .. } => {
                    let Some(block) = self
                        .config
                        .module(&addr.module)
                        .and_then(|m| m.provider_block(&addr.config))
                    else {
                        continue;
                    };
                    block.config.values().flat_map(Expr::references).collect()
                }
                _ => continue,
            };

            // Outputs and locals in non-root modules also wait for their
            // module's expansion.
            if matches!(&node, Node::Output { .. } | Node::Local { .. }) && !module.is_root() {
                let expand = graph.add_node(Node::ModuleExpand {
                    module: module.clone(),
                });
                graph.add_dep(idx, expand);
            }

            self.add_edges_for_refs(graph, ctx, idx, &module, refs);
        }
    }

    fn add_edges_for_refs(
        &self,
        graph: &mut Graph,
        ctx: &BuildState,
        from: usize,
        module: &ModuleInstance,
        refs: Vec<Reference>,
    ) {
        for reference in refs {
            match reference {
                Reference::Var(name) => {
                    if module.is_root() {
                        if let Some(idx) = graph.lookup(&format!("var.{name}")) {
                            graph.add_dep(from, idx);
                        }
                    } else if let Some(idx) =
                        graph.lookup(&Node::ModuleExpand {
                            module: module.clone(),
                        }
                        .key())
                    {
                        graph.add_dep(from, idx);
                    }
                }
                Reference::Local(name) => {
                    let key = Node::Local {
                        module: module.clone(),
                        name,
                    }
                    .key();
                    if let Some(idx) = graph.lookup(&key) {
                        graph.add_dep(from, idx);
                    }
                }
                Reference::Resource { resource, .. } => {
                    let abs = resource.absolute(module.clone()).to_string();
                    if let Some(nodes) = ctx.resource_nodes.get(&abs) {
                        for &dep in nodes {
                            graph.add_dep(from, dep);
                        }
                    }
                }
                Reference::ModuleOutput { call, key, output, .. } => {
                    // One edge per matching child instance.
                    for idx in module_output_nodes(graph, module, &call, &key, &output) {
                        graph.add_dep(from, idx);
                    }
                }
                _ => {}
            }
        }
    }

    // -- Destroy ordering ---------------------------------------------------

    /// Destroys run in reverse dependency order: if the state records that
    /// A depended on B, then B's destroy waits for A's destroy.
    fn add_destroy_ordering(&self, graph: &mut Graph, ctx: &BuildState) {
        for (addr, nodes) in ctx.destroy_nodes.values() {
            let Some(obj) = self
                .state
                .instance(addr)
                .and_then(|i| i.current.as_ref().or(i.deposed.values().next()))
            else {
                continue;
            };
            for dep_str in &obj.dependencies {
                // The recorded dependency's destroy node(s) wait on ours.
                for (other_addr, other_nodes) in ctx.destroy_nodes.values() {
                    if other_addr.resource().to_string() != *dep_str {
                        continue;
                    }
                    for &other in other_nodes {
                        for &ours in nodes {
                            graph.add_dep(other, ours);
                        }
                    }
                }
            }
        }
    }

    // -- Phase 6 ------------------------------------------------------------

    /// For create-before-destroy replacements, the old object's destroy
    /// happens in its own node ordered after the new object exists and
    /// after every dependent of the instance has migrated.
    fn add_cbd_nodes(&self, graph: &mut Graph, ctx: &mut BuildState) {
        let Some(changes) = self.changes else {
            return;
        };
        for change in &changes.resources {
            if change.action != Action::CreateDestroy || change.deposed.is_some() {
                continue;
            }
            let Some(&instance_idx) = ctx.instance_nodes.get(&change.addr.to_string()) else {
                continue;
            };

            let dependents = graph.dependents(instance_idx);
            let destroy = graph.add_node(Node::DestroyDeposedPending {
                addr: change.addr.clone(),
                provider: change.provider.clone(),
            });
            graph.add_dep(destroy, instance_idx);
            for dependent in dependents {
                if !matches!(
                    graph.node(dependent),
                    Node::ProviderClose { .. } | Node::Root
                ) {
                    graph.add_dep(destroy, dependent);
                }
            }
            if let Some(provider_idx) = graph.lookup(&change.provider.to_string()) {
                ctx.provider_users
                    .entry(provider_idx)
                    .or_default()
                    .push(destroy);
            }
        }
    }

    // -- Phase 7 ------------------------------------------------------------

    fn apply_targets(&self, graph: &mut Graph) {
        let mut roots = Vec::new();
        for (idx, node) in graph.nodes() {
            if let Some(addr) = node.target_addr()
                && self.targets.iter().any(|t| t.matches(addr))
            {
                roots.push(idx);
            }
        }
        let mut keep = graph.closure(&roots);
        for (idx, node) in graph.nodes() {
            if node.is_provider() || matches!(node, Node::Root) {
                keep[idx] = true;
            }
        }
        graph.retain(&keep);
    }
}

/// All references a resource's configuration makes, including `count`,
/// `for_each`, and explicit `depends_on`.
fn resource_references(rc: &ResourceConfig) -> Vec<Reference> {
    let mut refs: Vec<Reference> = rc.config.values().flat_map(Expr::references).collect();
    if let Some(e) = &rc.count {
        refs.extend(e.references());
    }
    if let Some(e) = &rc.for_each {
        refs.extend(e.references());
    }
    for dep in &rc.depends_on {
        if let Ok(r) = Reference::parse(dep) {
            refs.push(r);
        }
    }
    refs
}

/// Output nodes of instances of one module call.
fn module_output_nodes(
    graph: &Graph,
    parent: &ModuleInstance,
    call: &str,
    key: &Option<InstanceKey>,
    output: &str,
) -> Vec<usize> {
    let mut out = Vec::new();
    for (idx, node) in graph.nodes() {
        let Node::Output { module, name } = node else {
            continue;
        };
        if name != output {
            continue;
        }
        let Some(parent_of_output) = module.parent() else {
            continue;
        };
        if parent_of_output != *parent {
            continue;
        }
        let Some(step) = module.0.last() else {
            continue;
        };
        if step.name != call {
            continue;
        }
        if let Some(k) = key
            && step.key.as_ref() != Some(k)
        {
            continue;
        }
        out.push(idx);
    }
    out
}

/// Build-time evaluation data backed by the prior state only.
struct StateData<'a> {
    state: &'a State,
}

impl EvalData for StateData<'_> {
    fn resource_value(&self, module: &ModuleInstance, resource: &Resource) -> Option<Value> {
        self.state.resource_value(module, resource)
    }

    fn module_output(&self, child: &ModuleInstance, name: &str) -> Option<Value> {
        self.state
            .module(child)
            .and_then(|m| m.outputs.get(name))
            .map(|o| o.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::test_provider_schema;

    fn schemas() -> BTreeMap<String, ProviderSchema> {
        BTreeMap::from([("test".to_string(), test_provider_schema())])
    }

    fn build(config_text: &str, op: WalkKind, targets: &[Target]) -> Result<Graph, Diagnostics> {
        let config = Config::from_json_str(config_text).unwrap();
        let state = State::new();
        let vars = BTreeMap::new();
        let schemas = schemas();
        GraphBuilder {
            config: &config,
            state: &state,
            op,
            targets,
            root_variables: &vars,
            schemas: &schemas,
            changes: None,
            workspace: "default",
            root_path: Path::new("."),
        }
        .build()
    }

    #[test]
    fn test_plan_graph_shape() {
        let graph = build(
            r#"{
                "providers": [{"name": "test"}],
                "resources": [
                    {"type": "test_instance", "name": "base",
                     "config": {"ami": {"lit": "ami-1"}}},
                    {"type": "test_instance", "name": "child",
                     "config": {"ami": {"ref": "test_instance.base.id"}}}
                ]
            }"#,
            WalkKind::Plan,
            &[],
        )
        .unwrap();

        let base = graph.lookup("test_instance.base").unwrap();
        let child = graph.lookup("test_instance.child").unwrap();
        let provider = graph.lookup("provider.test").unwrap();
        let close = graph.lookup("provider.test (close)").unwrap();

        assert!(graph.deps(child).contains(&base));
        assert!(graph.deps(child).contains(&provider));
        assert!(graph.deps(close).contains(&child));
        assert!(graph.deps(close).contains(&base));

        let root = graph.lookup("[root]").unwrap();
        assert_eq!(graph.deps(root).len(), graph.len() - 1);
    }

    #[test]
    fn test_count_expansion_creates_instance_nodes() {
        let graph = build(
            r#"{
                "providers": [{"name": "test"}],
                "resources": [{
                    "type": "test_instance", "name": "web",
                    "count": {"lit": 3},
                    "config": {"ami": {"lit": "ami-1"}}
                }]
            }"#,
            WalkKind::Plan,
            &[],
        )
        .unwrap();
        for i in 0..3 {
            assert!(graph.lookup(&format!("test_instance.web[{i}]")).is_some());
        }
        assert!(graph.lookup("test_instance.web[3]").is_none());
    }

    #[test]
    fn test_aliased_provider_never_inherits() {
        let err = build(
            r#"{
                "module_calls": {
                    "app": {
                        "module": {
                            "resources": [{
                                "type": "test_instance", "name": "web",
                                "provider": {"local_name": "test", "alias": "west"},
                                "config": {"ami": {"lit": "ami-1"}}
                            }]
                        }
                    }
                },
                "providers": [{"name": "test", "alias": "west"}]
            }"#,
            WalkKind::Plan,
            &[],
        )
        .unwrap_err();
        assert!(err.to_report().contains("never inherited"));
    }

    #[test]
    fn test_default_provider_inherits_from_root() {
        let graph = build(
            r#"{
                "providers": [{"name": "test", "config": {"region": {"lit": "us"}}}],
                "module_calls": {
                    "app": {
                        "module": {
                            "resources": [{
                                "type": "test_instance", "name": "web",
                                "config": {"ami": {"lit": "ami-1"}}
                            }]
                        }
                    }
                }
            }"#,
            WalkKind::Plan,
            &[],
        )
        .unwrap();
        // The child resource resolved to the root's default config, so no
        // child-module provider node exists.
        let inner = graph.lookup("module.app.test_instance.web").unwrap();
        let provider = graph.lookup("provider.test").unwrap();
        assert!(graph.deps(inner).contains(&provider));
        assert!(graph.lookup("module.app.provider.test").is_none());
    }

    #[test]
    fn test_targeting_prunes_unrelated_nodes() {
        let targets = vec![Target::parse("test_instance.base").unwrap()];
        let graph = build(
            r#"{
                "providers": [{"name": "test"}],
                "resources": [
                    {"type": "test_instance", "name": "base",
                     "config": {"ami": {"lit": "ami-1"}}},
                    {"type": "test_instance", "name": "other",
                     "config": {"ami": {"lit": "ami-1"}}}
                ],
                "outputs": {"oid": {"value": {"ref": "test_instance.other.id"}}}
            }"#,
            WalkKind::Plan,
            &targets,
        )
        .unwrap();
        assert!(graph.lookup("test_instance.base").is_some());
        assert!(graph.lookup("test_instance.other").is_none());
        assert!(graph.lookup("output.oid").is_none());
        // Providers survive targeting.
        assert!(graph.lookup("provider.test").is_some());
    }

    #[test]
    fn test_reference_cycle_is_detected() {
        let err = build(
            r#"{
                "providers": [{"name": "test"}],
                "locals": {
                    "a": {"ref": "local.b"},
                    "b": {"ref": "local.a"}
                }
            }"#,
            WalkKind::Plan,
            &[],
        )
        .unwrap_err();
        assert!(err.to_report().contains("dependency cycle"));
    }

    #[test]
    fn test_orphans_get_destroy_nodes() {
        use crate::addrs::LocalProviderConfig;
        use crate::state::{InstanceObject, InstanceState, ResourceRecord};

        let mut state = State::new();
        let record = state
            .modules
            .entry(ModuleInstance::root())
            .or_default()
            .resources
            .entry(Resource::managed("test_instance", "gone"))
            .or_insert_with(|| {
                ResourceRecord::new(
                    LocalProviderConfig::default_for("test").absolute(ModuleInstance::root()),
                )
            });
        record.instances.insert(
            None,
            InstanceState {
                current: Some(InstanceObject::new(Value::empty_object())),
                deposed: BTreeMap::new(),
            },
        );

        let config = Config::from_json_str(r#"{"providers": [{"name": "test"}]}"#).unwrap();
        let vars = BTreeMap::new();
        let schemas = schemas();
        let graph = GraphBuilder {
            config: &config,
            state: &state,
            op: WalkKind::Plan,
            targets: &[],
            root_variables: &vars,
            schemas: &schemas,
            changes: None,
            workspace: "default",
            root_path: Path::new("."),
        }
        .build()
        .unwrap();

        assert!(graph.lookup("test_instance.gone (destroy)").is_some());
    }
}
