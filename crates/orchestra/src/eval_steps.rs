//! Per-node evaluation steps.
//!
//! Each graph node runs an ordered sequence of steps chosen by node kind
//! and walk kind. Steps share a per-node scratch area; a step either
//! continues the sequence, exits it early (the node still succeeds), or
//! fails it with diagnostics. The interpreter checks the cancel token
//! between steps.

use crate::addrs::{AbsResourceInstance, ResourceMode};
use crate::config::ResourceConfig;
use crate::diag::{Diagnostic, Diagnostics};
use crate::expr::Reference;
use crate::expr::eval::{self, Scope};
use crate::graph::{Node, ResourceInstanceNode, WalkKind};
use crate::plan::{Action, OutputChange, ResourceChange};
use crate::provider::{ApplyRequest, PlanRequest, ProviderSchema, SharedProvider};
use crate::schema::Schema;
use crate::state::{DeposedKey, InstanceObject, StateError};
use crate::value::{Ty, Value};
use crate::walk::{WalkContext, WalkData};
use std::collections::BTreeMap;

/// One evaluation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalStep {
    /// Load this node's planned change; early-exit when there is nothing
    /// to do.
    ReadPlannedChange,
    /// Resolve the node's provider instance.
    GetProvider,
    /// Read the prior object from state.
    ReadPrior,
    /// Evaluate the resource configuration and coerce it to schema.
    RenderConfig,
    /// Provider diff plus action decision and policy checks.
    PlanDiff,
    /// Append the computed change to the change set.
    RecordChange,
    /// Provider read of a managed instance, written back to state.
    RefreshRead,
    /// Execute the planned change against the provider.
    ApplyChange,
    /// Plan a data source read, reading immediately when fully known.
    PlanDataRead,
    /// Perform a deferred data source read during apply.
    ApplyDataRead,
    /// Record a Delete change for an instance with no config counterpart.
    PlanDestroyRecord,
    /// Execute a destroy for an orphan or deposed object.
    ApplyDestroy,
    /// Destroy the object deposed earlier in this same walk.
    DestroyPending,
    /// Evaluate an output expression and record/write it.
    EvalOutput,
    /// Evaluate a local value for validation only.
    ValidateLocal,
    /// Validate a resource configuration against its schema.
    ValidateResource,
    /// Resolve a child module's input variables.
    EvalModuleExpand,
    /// Create and configure a provider instance.
    ConfigureProvider,
    /// Close a provider instance.
    CloseProvider,
}

/// Step outcome.
pub enum Flow {
    Continue,
    EarlyExit,
}

/// Mutable per-node locals shared across one node's steps.
#[derive(Default)]
pub struct Scratch {
    provider: Option<SharedProvider>,
    prior: Option<InstanceObject>,
    rendered: Option<Value>,
    /// Resource addresses this node's configuration references.
    dependencies: Vec<String>,
    change: Option<ResourceChange>,
}

/// The step sequence for a node under a walk kind.
pub fn steps_for(node: &Node, op: WalkKind) -> Vec<EvalStep> {
    use EvalStep::*;
    match node {
        Node::Root | Node::Variable { .. } => Vec::new(),
        Node::Local { .. } => match op {
            WalkKind::Validate => vec![ValidateLocal],
            _ => Vec::new(),
        },
        Node::ModuleExpand { .. } => vec![EvalModuleExpand],
        Node::ProviderConfigure { .. } => match op {
            WalkKind::Validate => Vec::new(),
            _ => vec![ConfigureProvider],
        },
        Node::ProviderClose { .. } => match op {
            WalkKind::Validate => Vec::new(),
            _ => vec![CloseProvider],
        },
        Node::Output { .. } => vec![EvalOutput],
        Node::ResourceInstance(n) => match (op, n.addr.instance.resource.mode) {
            (WalkKind::Validate, _) => vec![ValidateResource],
            (WalkKind::Refresh, ResourceMode::Managed) => {
                vec![GetProvider, ReadPrior, RefreshRead]
            }
            (WalkKind::Refresh, ResourceMode::Data) => {
                vec![GetProvider, RenderConfig, ApplyDataRead]
            }
            (WalkKind::Plan, ResourceMode::Managed) => {
                vec![GetProvider, ReadPrior, RenderConfig, PlanDiff, RecordChange]
            }
            (WalkKind::Plan, ResourceMode::Data) => {
                vec![GetProvider, ReadPrior, RenderConfig, PlanDataRead]
            }
            (WalkKind::PlanDestroy, _) => Vec::new(),
            (WalkKind::Apply, ResourceMode::Managed) => {
                vec![ReadPlannedChange, GetProvider, ReadPrior, RenderConfig, ApplyChange]
            }
            (WalkKind::Apply, ResourceMode::Data) => {
                vec![ReadPlannedChange, GetProvider, RenderConfig, ApplyDataRead]
            }
        },
        Node::DestroyInstance { .. } => match op {
            WalkKind::Validate => Vec::new(),
            WalkKind::Refresh => vec![GetProvider, ReadPrior, RefreshRead],
            WalkKind::Plan | WalkKind::PlanDestroy => vec![ReadPrior, PlanDestroyRecord],
            WalkKind::Apply => vec![ReadPlannedChange, GetProvider, ReadPrior, ApplyDestroy],
        },
        Node::DestroyDeposedPending { .. } => vec![GetProvider, DestroyPending],
    }
}

/// Run a node's step sequence.
pub fn run_sequence(node: &Node, ctx: &WalkContext<'_>, diags: &mut Diagnostics) {
    let mut scratch = Scratch::default();
    for step in steps_for(node, ctx.op) {
        if ctx.is_cancelled() {
            return;
        }
        match run_step(step, node, ctx, &mut scratch, diags) {
            Flow::Continue if !diags.has_errors() => {}
            _ => return,
        }
    }
}

fn run_step(
    step: EvalStep,
    node: &Node,
    ctx: &WalkContext<'_>,
    scratch: &mut Scratch,
    diags: &mut Diagnostics,
) -> Flow {
    match step {
        EvalStep::ReadPlannedChange => read_planned_change(node, ctx, scratch),
        EvalStep::GetProvider => get_provider(node, ctx, scratch, diags),
        EvalStep::ReadPrior => read_prior(node, ctx, scratch),
        EvalStep::RenderConfig => render_config(node, ctx, scratch, diags),
        EvalStep::PlanDiff => plan_diff(node, ctx, scratch, diags),
        EvalStep::RecordChange => record_change(node, ctx, scratch),
        EvalStep::RefreshRead => refresh_read(node, ctx, scratch, diags),
        EvalStep::ApplyChange => apply_change(node, ctx, scratch, diags),
        EvalStep::PlanDataRead => plan_data_read(node, ctx, scratch, diags),
        EvalStep::ApplyDataRead => apply_data_read(node, ctx, scratch, diags),
        EvalStep::PlanDestroyRecord => plan_destroy_record(node, ctx, scratch, diags),
        EvalStep::ApplyDestroy => apply_destroy(node, ctx, scratch, diags),
        EvalStep::DestroyPending => destroy_pending(node, ctx, scratch, diags),
        EvalStep::EvalOutput => eval_output(node, ctx, diags),
        EvalStep::ValidateLocal => validate_local(node, ctx, diags),
        EvalStep::ValidateResource => validate_resource(node, ctx, diags),
        EvalStep::EvalModuleExpand => eval_module_expand(node, ctx, diags),
        EvalStep::ConfigureProvider => configure_provider(node, ctx, diags),
        EvalStep::CloseProvider => close_provider(node, ctx),
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn node_instance_addr(node: &Node) -> Option<&AbsResourceInstance> {
    match node {
        Node::ResourceInstance(n) => Some(&n.addr),
        Node::DestroyInstance { addr, .. } | Node::DestroyDeposedPending { addr, .. } => Some(addr),
        _ => None,
    }
}

fn node_provider_type(node: &Node, ctx: &WalkContext<'_>) -> Option<String> {
    match node {
        Node::ResourceInstance(n) => Some(n.provider.config.local_name.clone()),
        Node::DestroyInstance { provider, .. } | Node::DestroyDeposedPending { provider, .. } => {
            Some(provider.config.local_name.clone())
        }
        Node::ProviderConfigure { provider_type, .. } => Some(provider_type.clone()),
        _ => {
            let _ = ctx;
            None
        }
    }
}

fn resource_schema<'a>(
    ctx: &'a WalkContext<'_>,
    provider_type: &str,
    addr: &AbsResourceInstance,
) -> Option<&'a Schema> {
    let schema: &ProviderSchema = ctx.schemas.get(provider_type)?;
    let type_name = &addr.instance.resource.r#type;
    match addr.instance.resource.mode {
        ResourceMode::Managed => schema.resource_type(type_name),
        ResourceMode::Data => schema.data_source(type_name),
    }
}

fn resource_config<'a>(ctx: &'a WalkContext<'_>, addr: &AbsResourceInstance) -> Option<&'a ResourceConfig> {
    ctx.config
        .module(&addr.module)?
        .resource(&addr.instance.resource)
}

/// A prior object recorded under a different schema version cannot be
/// interpreted against the provider's current schema; the mismatch must
/// surface instead of silently misreading attributes.
fn check_schema_version(
    node: &Node,
    ctx: &WalkContext<'_>,
    scratch: &Scratch,
    diags: &mut Diagnostics,
) -> bool {
    let Some(prior) = &scratch.prior else {
        return true;
    };
    let Some(addr) = node_instance_addr(node) else {
        return true;
    };
    let Some(provider_type) = node_provider_type(node, ctx) else {
        return true;
    };
    let Some(schema) = resource_schema(ctx, &provider_type, addr) else {
        return true;
    };
    if prior.schema_version == schema.version {
        return true;
    }
    let err = StateError::SchemaMigrationRequired {
        addr: addr.to_string(),
        stored: prior.schema_version,
        current: schema.version,
    };
    diags.push(
        Diagnostic::error("stored instance requires a schema migration")
            .with_detail(err.to_string())
            .with_address(addr.to_string()),
    );
    false
}

/// Record the schema version and sensitive paths the object was written
/// under.
fn stamp_schema(
    ctx: &WalkContext<'_>,
    provider_type: &str,
    addr: &AbsResourceInstance,
    obj: &mut InstanceObject,
) {
    if let Some(schema) = resource_schema(ctx, provider_type, addr) {
        obj.schema_version = schema.version;
        obj.sensitive_paths = schema.block.sensitive_paths();
    }
}

/// Evaluate a resource's configuration attributes into a raw object.
fn eval_resource_config(
    node: &ResourceInstanceNode,
    rc: &ResourceConfig,
    ctx: &WalkContext<'_>,
    pure_only: bool,
    diags: &mut Diagnostics,
) -> (Value, Vec<String>) {
    let module_config = ctx
        .config
        .module(&node.addr.module)
        .expect("module config exists for expanded node");
    let vars = ctx.module_variables(&node.addr.module);
    let data = WalkData { ctx };
    let each_pair = node.each.as_ref().map(|(k, v)| (k, v));
    let scope = Scope {
        module: &node.addr.module,
        module_config,
        variables: &vars,
        data: &data,
        each: each_pair,
        count_index: node.count_index,
        self_addr: Some(&node.addr),
        workspace: ctx.workspace,
        root_path: ctx.root_path,
        pure_only,
    };

    let mut attrs = BTreeMap::new();
    for (name, expr) in &rc.config {
        attrs.insert(name.clone(), eval::evaluate(&scope, expr, diags));
    }

    // Record which resources this configuration depends on; stored in
    // state to order future destroys.
    let mut dependencies = Vec::new();
    for expr in rc.config.values() {
        for reference in expr.references() {
            if let Reference::Resource { resource, .. } = reference {
                let dep = resource.absolute(node.addr.module.clone()).to_string();
                if dep != node.addr.resource().to_string() && !dependencies.contains(&dep) {
                    dependencies.push(dep);
                }
            }
        }
    }
    for dep in &rc.depends_on {
        if let Ok(Reference::Resource { resource, .. }) = Reference::parse(dep) {
            let dep = resource.absolute(node.addr.module.clone()).to_string();
            if !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }
    }
    dependencies.sort();

    (Value::Object(attrs), dependencies)
}

// ---------------------------------------------------------------------------
// Step implementations
// ---------------------------------------------------------------------------

fn read_planned_change(node: &Node, ctx: &WalkContext<'_>, scratch: &mut Scratch) -> Flow {
    let Some(addr) = node_instance_addr(node) else {
        return Flow::Continue;
    };
    let Some(planned) = ctx.planned else {
        return Flow::EarlyExit;
    };
    let change = match node {
        Node::DestroyInstance {
            deposed: Some(key), ..
        } => planned.deposed_change(addr, key),
        _ => planned.resource_change(addr),
    };
    match change {
        None => Flow::EarlyExit,
        Some(c) if c.action.is_noop() => Flow::EarlyExit,
        // Deletes belong to the dedicated destroy node; the configured
        // instance node has nothing left to do.
        Some(c) if c.action == Action::Delete && matches!(node, Node::ResourceInstance(_)) => {
            Flow::EarlyExit
        }
        Some(c) => {
            scratch.change = Some(c.clone());
            Flow::Continue
        }
    }
}

fn get_provider(
    node: &Node,
    ctx: &WalkContext<'_>,
    scratch: &mut Scratch,
    diags: &mut Diagnostics,
) -> Flow {
    let addr = match node {
        Node::ResourceInstance(n) => &n.provider,
        Node::DestroyInstance { provider, .. } | Node::DestroyDeposedPending { provider, .. } => {
            provider
        }
        _ => return Flow::Continue,
    };
    match ctx.registry.get(&addr.to_string()) {
        Some(p) => {
            scratch.provider = Some(p);
            Flow::Continue
        }
        None => {
            diags.push(
                Diagnostic::error("provider is not configured")
                    .with_detail(format!("no configured provider instance for {addr}"))
                    .with_address(node.key()),
            );
            Flow::Continue
        }
    }
}

fn read_prior(node: &Node, ctx: &WalkContext<'_>, scratch: &mut Scratch) -> Flow {
    let Some(addr) = node_instance_addr(node) else {
        return Flow::Continue;
    };
    scratch.prior = match node {
        Node::DestroyInstance {
            deposed: Some(key), ..
        } => ctx.sync.deposed_object(addr, key),
        _ => ctx.sync.instance_object(addr),
    };
    Flow::Continue
}

fn render_config(
    node: &Node,
    ctx: &WalkContext<'_>,
    scratch: &mut Scratch,
    diags: &mut Diagnostics,
) -> Flow {
    let Node::ResourceInstance(n) = node else {
        return Flow::Continue;
    };
    let Some(rc) = resource_config(ctx, &n.addr) else {
        return Flow::Continue;
    };
    let Some(provider_type) = node_provider_type(node, ctx) else {
        return Flow::Continue;
    };
    let Some(schema) = resource_schema(ctx, &provider_type, &n.addr) else {
        diags.push(
            Diagnostic::error("missing resource type schema")
                .with_detail(format!(
                    "the provider offers no schema for {:?}",
                    n.addr.instance.resource.r#type
                ))
                .with_address(n.addr.to_string()),
        );
        return Flow::Continue;
    };
    if !check_schema_version(node, ctx, scratch, diags) {
        return Flow::Continue;
    }

    let pure_only = ctx.op.is_plan();
    let (raw, dependencies) = eval_resource_config(n, rc, ctx, pure_only, diags);
    if diags.has_errors() {
        return Flow::Continue;
    }
    let (coerced, coerce_diags) = schema.block.coerce(&raw);
    for d in coerce_diags {
        diags.push(d.with_address(n.addr.to_string()));
    }
    scratch.rendered = Some(coerced);
    scratch.dependencies = dependencies;
    Flow::Continue
}

/// The prior object's value, normalized to the schema's implied type so
/// that values reloaded from disk compare structurally against rendered
/// configuration.
fn normalized_prior(node: &Node, ctx: &WalkContext<'_>, scratch: &Scratch) -> Value {
    let Some(prior) = &scratch.prior else {
        return Value::Null(Ty::Dynamic);
    };
    let implied = node_instance_addr(node)
        .and_then(|addr| {
            let provider_type = node_provider_type(node, ctx)?;
            resource_schema(ctx, &provider_type, addr)
        })
        .map(|s| s.block.implied_type());
    match implied {
        Some(ty) => prior.value.convert(&ty).unwrap_or_else(|_| prior.value.clone()),
        None => prior.value.clone(),
    }
}

fn plan_diff(
    node: &Node,
    ctx: &WalkContext<'_>,
    scratch: &mut Scratch,
    diags: &mut Diagnostics,
) -> Flow {
    let Node::ResourceInstance(n) = node else {
        return Flow::Continue;
    };
    let Some(provider) = scratch.provider.clone() else {
        return Flow::Continue;
    };
    let Some(proposed) = scratch.rendered.clone() else {
        return Flow::Continue;
    };
    let rc = resource_config(ctx, &n.addr);

    let prior_tainted = scratch
        .prior
        .as_ref()
        .is_some_and(InstanceObject::is_tainted);
    let prior_val = normalized_prior(node, ctx, scratch);

    ctx.hooks.pre_diff(&n.addr, &prior_val);

    let resp = match provider.plan_change(&PlanRequest {
        type_name: &n.addr.instance.resource.r#type,
        prior: &prior_val,
        proposed: &proposed,
        private: scratch.prior.as_ref().map(|o| o.private.as_slice()).unwrap_or(&[]),
    }) {
        Ok(r) => r,
        Err(failure) => {
            diags.push(
                Diagnostic::error("provider failed to plan change")
                    .with_detail(failure.summary)
                    .with_address(n.addr.to_string()),
            );
            return Flow::Continue;
        }
    };

    let action = if scratch.prior.is_none() {
        Action::Create
    } else if !resp.requires_replace.is_empty() || prior_tainted {
        if n.create_before_destroy {
            Action::CreateDestroy
        } else {
            Action::DestroyCreate
        }
    } else if resp.planned.raw_equals(&prior_val) {
        Action::NoOp
    } else {
        Action::Update
    };

    if action.destroys()
        && rc.is_some_and(|rc| rc.lifecycle.prevent_destroy)
    {
        diags.push(
            Diagnostic::error("instance cannot be destroyed")
                .with_detail(format!(
                    "{} has lifecycle.prevent_destroy set, but the plan calls for \
                     this instance to be destroyed; remove the flag or adjust the \
                     configuration to avoid replacement",
                    n.addr
                ))
                .with_address(n.addr.to_string()),
        );
        return Flow::Continue;
    }

    ctx.hooks.post_diff(&n.addr, action);

    scratch.change = Some(ResourceChange {
        addr: n.addr.clone(),
        provider: n.provider.clone(),
        action,
        before: prior_val,
        after: resp.planned,
        required_replace: resp.requires_replace,
        deposed: None,
    });
    Flow::Continue
}

fn record_change(node: &Node, ctx: &WalkContext<'_>, scratch: &mut Scratch) -> Flow {
    let Some(change) = scratch.change.clone() else {
        return Flow::Continue;
    };
    let _ = node;
    ctx.changes
        .lock()
        .expect("changes lock poisoned")
        .resources
        .push(change);
    Flow::Continue
}

fn refresh_read(
    node: &Node,
    ctx: &WalkContext<'_>,
    scratch: &mut Scratch,
    diags: &mut Diagnostics,
) -> Flow {
    let Some(addr) = node_instance_addr(node) else {
        return Flow::Continue;
    };
    let Some(prior) = scratch.prior.clone() else {
        return Flow::EarlyExit;
    };
    let Some(provider) = scratch.provider.clone() else {
        return Flow::Continue;
    };
    if !check_schema_version(node, ctx, scratch, diags) {
        return Flow::Continue;
    }
    let provider_addr = match node {
        Node::ResourceInstance(n) => n.provider.clone(),
        Node::DestroyInstance { provider, .. } => provider.clone(),
        _ => return Flow::Continue,
    };

    ctx.hooks.pre_refresh(addr, &prior.value);
    match provider.read_resource(
        &addr.instance.resource.r#type,
        &prior.value,
        &prior.private,
    ) {
        Ok(resp) => {
            ctx.hooks.post_refresh(addr, &resp.new_state);
            if resp.new_state.is_null() {
                // The remote object is gone.
                ctx.sync.set_instance(addr, &provider_addr, None);
            } else {
                let mut obj = prior;
                obj.value = resp.new_state;
                obj.private = resp.private;
                ctx.sync.set_instance(addr, &provider_addr, Some(obj));
            }
        }
        Err(failure) => {
            diags.push(
                Diagnostic::error("provider failed to read instance")
                    .with_detail(failure.summary)
                    .with_address(addr.to_string()),
            );
        }
    }
    Flow::Continue
}

fn apply_change(
    node: &Node,
    ctx: &WalkContext<'_>,
    scratch: &mut Scratch,
    diags: &mut Diagnostics,
) -> Flow {
    let Node::ResourceInstance(n) = node else {
        return Flow::Continue;
    };
    let Some(change) = scratch.change.clone() else {
        return Flow::EarlyExit;
    };
    let Some(provider) = scratch.provider.clone() else {
        return Flow::Continue;
    };
    let type_name = n.addr.instance.resource.r#type.clone();
    let prior_private = scratch
        .prior
        .as_ref()
        .map(|o| o.private.clone())
        .unwrap_or_default();
    let prior_val = normalized_prior(node, ctx, scratch);

    // Re-plan against freshly rendered config so values learned from
    // dependencies applied earlier in this walk are incorporated.
    let final_planned = match (&scratch.rendered, change.action) {
        (Some(proposed), Action::Create | Action::Update | Action::CreateDestroy | Action::DestroyCreate) => {
            match provider.plan_change(&PlanRequest {
                type_name: &type_name,
                prior: &prior_val,
                proposed,
                private: &prior_private,
            }) {
                Ok(resp) => resp.planned,
                Err(failure) => {
                    diags.push(
                        Diagnostic::error("provider failed to plan change during apply")
                            .with_detail(failure.summary)
                            .with_address(n.addr.to_string()),
                    );
                    return Flow::Continue;
                }
            }
        }
        _ => change.after.clone(),
    };

    // Known planned values must survive into apply; only unknowns refine.
    let final_planned = merge_refined(&change.after, &final_planned);

    ctx.hooks.pre_apply(&n.addr, change.action, &final_planned);

    let mut deposed_key: Option<DeposedKey> = None;
    match change.action {
        Action::CreateDestroy => {
            deposed_key = ctx.sync.depose_instance(&n.addr);
            if let Some(key) = &deposed_key {
                ctx.note_deposed(&n.addr, key.clone());
            }
        }
        Action::DestroyCreate => {
            // Destroy the old object first.
            match provider.apply_change(&ApplyRequest {
                type_name: &type_name,
                prior: &prior_val,
                planned: &Value::Null(Ty::Dynamic),
                private: &prior_private,
            }) {
                Ok(_) => ctx.sync.set_instance(&n.addr, &n.provider, None),
                Err(failure) => {
                    record_apply_failure(ctx, n, failure, diags);
                    return Flow::Continue;
                }
            }
        }
        _ => {}
    }

    let apply_prior = match change.action {
        Action::Create | Action::CreateDestroy | Action::DestroyCreate => Value::Null(Ty::Dynamic),
        _ => prior_val.clone(),
    };
    let result = provider.apply_change(&ApplyRequest {
        type_name: &type_name,
        prior: &apply_prior,
        planned: &final_planned,
        private: &prior_private,
    });

    match result {
        Ok(resp) => {
            if resp.new_state.is_null() {
                // The provider reports the object gone.
                ctx.sync.set_instance(&n.addr, &n.provider, None);
            } else {
                let mut obj = InstanceObject::new(resp.new_state.clone());
                obj.private = resp.private;
                obj.dependencies = scratch.dependencies.clone();
                stamp_schema(ctx, &n.provider.config.local_name, &n.addr, &mut obj);
                ctx.sync.set_instance(&n.addr, &n.provider, Some(obj));
            }
            ctx.hooks.post_apply(&n.addr, &resp.new_state, None);
            Flow::Continue
        }
        Err(failure) => {
            // A failed replacement create restores the deposed object.
            if change.action == Action::CreateDestroy
                && let Some(key) = &deposed_key
            {
                ctx.sync.restore_deposed(&n.addr, key);
                ctx.forget_deposed(&n.addr);
            }
            record_apply_failure(ctx, n, failure, diags);
            Flow::Continue
        }
    }
}

fn record_apply_failure(
    ctx: &WalkContext<'_>,
    n: &ResourceInstanceNode,
    failure: crate::provider::ProviderFailure,
    diags: &mut Diagnostics,
) {
    if let Some(partial) = &failure.partial {
        // A partial object: record it tainted so the next plan recreates
        // the instance.
        let mut obj = InstanceObject::new(partial.clone()).tainted();
        stamp_schema(ctx, &n.provider.config.local_name, &n.addr, &mut obj);
        ctx.sync.set_instance(&n.addr, &n.provider, Some(obj));
    }
    ctx.hooks
        .post_apply(&n.addr, &Value::Null(Ty::Dynamic), Some(&failure.summary));
    diags.push(
        Diagnostic::error("provider failed to apply change")
            .with_detail(failure.summary)
            .with_address(n.addr.to_string()),
    );
}

/// Refine a planned value with apply-time knowledge: unknowns take the
/// refined value, known values stay exactly as planned.
fn merge_refined(planned: &Value, refined: &Value) -> Value {
    match (planned, refined) {
        (Value::Unknown(_), r) => r.clone(),
        (Value::Object(p), Value::Object(r)) => Value::Object(
            p.iter()
                .map(|(k, pv)| {
                    let merged = match r.get(k) {
                        Some(rv) => merge_refined(pv, rv),
                        None => pv.clone(),
                    };
                    (k.clone(), merged)
                })
                .collect(),
        ),
        (Value::Tuple(p), Value::Tuple(r)) if p.len() == r.len() => Value::Tuple(
            p.iter()
                .zip(r)
                .map(|(pv, rv)| merge_refined(pv, rv))
                .collect(),
        ),
        (Value::List(t, p), Value::List(_, r)) if p.len() == r.len() => Value::List(
            t.clone(),
            p.iter()
                .zip(r)
                .map(|(pv, rv)| merge_refined(pv, rv))
                .collect(),
        ),
        _ => planned.clone(),
    }
}

fn plan_data_read(
    node: &Node,
    ctx: &WalkContext<'_>,
    scratch: &mut Scratch,
    diags: &mut Diagnostics,
) -> Flow {
    let Node::ResourceInstance(n) = node else {
        return Flow::Continue;
    };
    let Some(provider) = scratch.provider.clone() else {
        return Flow::Continue;
    };
    let Some(rendered) = scratch.rendered.clone() else {
        return Flow::Continue;
    };
    let type_name = &n.addr.instance.resource.r#type;
    let prior_val = normalized_prior(node, ctx, scratch);

    let (action, after) = if rendered.is_whole_known() {
        // Config fully known: read right away so dependents plan against
        // real values.
        match provider.read_data_source(type_name, &rendered) {
            Ok(value) => {
                let mut obj = InstanceObject::new(value.clone());
                obj.dependencies = scratch.dependencies.clone();
                stamp_schema(ctx, &n.provider.config.local_name, &n.addr, &mut obj);
                ctx.sync.set_instance(&n.addr, &n.provider, Some(obj));
                let action = if value.raw_equals(&prior_val) {
                    Action::NoOp
                } else {
                    Action::Read
                };
                (action, value)
            }
            Err(failure) => {
                diags.push(
                    Diagnostic::error("provider failed to read data source")
                        .with_detail(failure.summary)
                        .with_address(n.addr.to_string()),
                );
                return Flow::Continue;
            }
        }
    } else {
        // Deferred until apply, when the references become known.
        let ty = scratch
            .rendered
            .as_ref()
            .map(Value::ty)
            .unwrap_or(Ty::Dynamic);
        (Action::Read, Value::Unknown(ty))
    };

    ctx.changes
        .lock()
        .expect("changes lock poisoned")
        .resources
        .push(ResourceChange {
            addr: n.addr.clone(),
            provider: n.provider.clone(),
            action,
            before: prior_val,
            after,
            required_replace: Vec::new(),
            deposed: None,
        });
    Flow::Continue
}

fn apply_data_read(
    node: &Node,
    ctx: &WalkContext<'_>,
    scratch: &mut Scratch,
    diags: &mut Diagnostics,
) -> Flow {
    let Node::ResourceInstance(n) = node else {
        return Flow::Continue;
    };
    let Some(provider) = scratch.provider.clone() else {
        return Flow::Continue;
    };
    let Some(rendered) = scratch.rendered.clone() else {
        return Flow::Continue;
    };
    if !rendered.is_whole_known() {
        if ctx.op == WalkKind::Refresh {
            // Refresh only reads data sources whose config is fully
            // known; the rest wait for the next plan.
            return Flow::EarlyExit;
        }
        diags.push(
            Diagnostic::error("data source configuration still unknown during apply")
                .with_detail(
                    "the configuration depends on values that were not resolved \
                     by the apply walk",
                )
                .with_address(n.addr.to_string()),
        );
        return Flow::Continue;
    }
    match provider.read_data_source(&n.addr.instance.resource.r#type, &rendered) {
        Ok(value) => {
            let mut obj = InstanceObject::new(value);
            obj.dependencies = scratch.dependencies.clone();
            stamp_schema(ctx, &n.provider.config.local_name, &n.addr, &mut obj);
            ctx.sync.set_instance(&n.addr, &n.provider, Some(obj));
            Flow::Continue
        }
        Err(failure) => {
            diags.push(
                Diagnostic::error("provider failed to read data source")
                    .with_detail(failure.summary)
                    .with_address(n.addr.to_string()),
            );
            Flow::Continue
        }
    }
}

fn plan_destroy_record(
    node: &Node,
    ctx: &WalkContext<'_>,
    scratch: &mut Scratch,
    diags: &mut Diagnostics,
) -> Flow {
    let Node::DestroyInstance {
        addr,
        provider,
        deposed,
        ..
    } = node
    else {
        return Flow::Continue;
    };
    let Some(prior) = scratch.prior.clone() else {
        return Flow::EarlyExit;
    };

    // Data resource state is dropped without provider involvement, but a
    // managed orphan must respect prevent_destroy when config remains.
    if addr.instance.resource.mode == ResourceMode::Managed
        && let Some(rc) = resource_config(ctx, addr)
        && rc.lifecycle.prevent_destroy
    {
        diags.push(
            Diagnostic::error("instance cannot be destroyed")
                .with_detail(format!(
                    "{addr} has lifecycle.prevent_destroy set, but the plan calls \
                     for this instance to be destroyed"
                ))
                .with_address(addr.to_string()),
        );
        return Flow::Continue;
    }

    ctx.changes
        .lock()
        .expect("changes lock poisoned")
        .resources
        .push(ResourceChange {
            addr: addr.clone(),
            provider: provider.clone(),
            action: Action::Delete,
            before: prior.value,
            after: Value::Null(Ty::Dynamic),
            required_replace: Vec::new(),
            deposed: deposed.clone(),
        });
    Flow::Continue
}

fn apply_destroy(
    node: &Node,
    ctx: &WalkContext<'_>,
    scratch: &mut Scratch,
    diags: &mut Diagnostics,
) -> Flow {
    let Node::DestroyInstance {
        addr,
        provider: provider_addr,
        deposed,
        ..
    } = node
    else {
        return Flow::Continue;
    };
    let Some(prior) = scratch.prior.clone() else {
        return Flow::EarlyExit;
    };
    let Some(provider) = scratch.provider.clone() else {
        return Flow::Continue;
    };

    ctx.hooks
        .pre_apply(addr, Action::Delete, &Value::Null(Ty::Dynamic));

    if addr.instance.resource.mode == ResourceMode::Data {
        // Data state is forgotten, not destroyed.
        ctx.sync.set_instance(addr, provider_addr, None);
        ctx.hooks.post_apply(addr, &Value::Null(Ty::Dynamic), None);
        return Flow::Continue;
    }

    let result = provider.apply_change(&ApplyRequest {
        type_name: &addr.instance.resource.r#type,
        prior: &prior.value,
        planned: &Value::Null(Ty::Dynamic),
        private: &prior.private,
    });
    match result {
        Ok(_) => {
            match deposed {
                Some(key) => ctx.sync.remove_deposed(addr, key),
                None => ctx.sync.set_instance(addr, provider_addr, None),
            }
            ctx.hooks.post_apply(addr, &Value::Null(Ty::Dynamic), None);
            Flow::Continue
        }
        Err(failure) => {
            ctx.hooks
                .post_apply(addr, &Value::Null(Ty::Dynamic), Some(&failure.summary));
            match deposed {
                Some(key) => {
                    // A deposed object that would not die stays deposed;
                    // the next plan retries.
                    diags.push(
                        Diagnostic::warning("failed to destroy deposed object")
                            .with_detail(format!("{failure} (object {key} remains deposed)"))
                            .with_address(addr.to_string()),
                    );
                    Flow::Continue
                }
                None => {
                    diags.push(
                        Diagnostic::error("provider failed to destroy instance")
                            .with_detail(failure.summary)
                            .with_address(addr.to_string()),
                    );
                    Flow::Continue
                }
            }
        }
    }
}

fn destroy_pending(
    node: &Node,
    ctx: &WalkContext<'_>,
    scratch: &mut Scratch,
    diags: &mut Diagnostics,
) -> Flow {
    let Node::DestroyDeposedPending {
        addr,
        provider: provider_addr,
    } = node
    else {
        return Flow::Continue;
    };
    let Some(key) = ctx.take_deposed(addr) else {
        // The create failed (and restored the prior object), or nothing
        // was deposed.
        return Flow::EarlyExit;
    };
    let Some(obj) = ctx.sync.deposed_object(addr, &key) else {
        return Flow::EarlyExit;
    };
    let Some(provider) = scratch.provider.clone() else {
        return Flow::Continue;
    };

    match provider.apply_change(&ApplyRequest {
        type_name: &addr.instance.resource.r#type,
        prior: &obj.value,
        planned: &Value::Null(Ty::Dynamic),
        private: &obj.private,
    }) {
        Ok(_) => {
            ctx.sync.remove_deposed(addr, &key);
        }
        Err(failure) => {
            let _ = provider_addr;
            diags.push(
                Diagnostic::warning("failed to destroy deposed object")
                    .with_detail(format!("{failure} (object {key} remains deposed)"))
                    .with_address(addr.to_string()),
            );
        }
    }
    Flow::Continue
}

fn eval_output(node: &Node, ctx: &WalkContext<'_>, diags: &mut Diagnostics) -> Flow {
    let Node::Output { module, name } = node else {
        return Flow::Continue;
    };
    let Some(mconfig) = ctx.config.module(module) else {
        return Flow::Continue;
    };
    let Some(out) = mconfig.outputs.get(name) else {
        return Flow::Continue;
    };

    if ctx.op == WalkKind::PlanDestroy {
        let before = ctx
            .sync
            .output_value(module, name)
            .map(|o| o.value)
            .unwrap_or(Value::Null(Ty::Dynamic));
        ctx.sync.remove_output(module, name);
        ctx.changes
            .lock()
            .expect("changes lock poisoned")
            .outputs
            .push(OutputChange {
                module: module.clone(),
                name: name.clone(),
                before,
                after: Value::Null(Ty::Dynamic),
                sensitive: out.sensitive,
            });
        return Flow::Continue;
    }

    let vars = ctx.module_variables(module);
    let data = WalkData { ctx };
    let scope = Scope {
        module,
        module_config: mconfig,
        variables: &vars,
        data: &data,
        each: None,
        count_index: None,
        self_addr: None,
        workspace: ctx.workspace,
        root_path: ctx.root_path,
        pure_only: ctx.op.is_plan(),
    };
    let mut eval_diags = Diagnostics::new();
    let value = eval::evaluate(&scope, &out.value, &mut eval_diags);

    if eval_diags.has_errors() {
        if ctx.op == WalkKind::Apply {
            // During apply a broken output does not fail the walk; the
            // value is simply not recorded.
            log::warn!("output {name} failed to evaluate: {}", eval_diags.to_report());
            ctx.sync.remove_output(module, name);
            diags.push(
                Diagnostic::warning(format!("output {name:?} could not be evaluated"))
                    .with_detail(eval_diags.to_report()),
            );
            return Flow::EarlyExit;
        }
        diags.extend(eval_diags);
        return Flow::Continue;
    }

    if ctx.op.is_plan() {
        let before = ctx
            .sync
            .output_value(module, name)
            .map(|o| o.value)
            .unwrap_or(Value::Null(Ty::Dynamic));
        ctx.changes
            .lock()
            .expect("changes lock poisoned")
            .outputs
            .push(OutputChange {
                module: module.clone(),
                name: name.clone(),
                before,
                after: value.clone(),
                sensitive: out.sensitive,
            });
    }

    // After apply everything referenced must exist; a value that is still
    // unknown means its subject was destroyed, so the output goes away.
    if ctx.op == WalkKind::Apply && !value.is_whole_known() {
        ctx.sync.remove_output(module, name);
        return Flow::EarlyExit;
    }
    ctx.sync.set_output(module, name, value, out.sensitive);
    Flow::Continue
}

fn validate_local(node: &Node, ctx: &WalkContext<'_>, diags: &mut Diagnostics) -> Flow {
    let Node::Local { module, name } = node else {
        return Flow::Continue;
    };
    let Some(mconfig) = ctx.config.module(module) else {
        return Flow::Continue;
    };
    let Some(expr) = mconfig.locals.get(name) else {
        return Flow::Continue;
    };
    let vars = ctx.module_variables(module);
    let data = WalkData { ctx };
    let scope = Scope {
        module,
        module_config: mconfig,
        variables: &vars,
        data: &data,
        each: None,
        count_index: None,
        self_addr: None,
        workspace: ctx.workspace,
        root_path: ctx.root_path,
        pure_only: true,
    };
    eval::evaluate(&scope, expr, diags);
    Flow::Continue
}

fn validate_resource(node: &Node, ctx: &WalkContext<'_>, diags: &mut Diagnostics) -> Flow {
    let Node::ResourceInstance(n) = node else {
        return Flow::Continue;
    };
    let Some(rc) = resource_config(ctx, &n.addr) else {
        return Flow::Continue;
    };
    let Some(provider_type) = node_provider_type(node, ctx) else {
        return Flow::Continue;
    };
    let Some(schema) = resource_schema(ctx, &provider_type, &n.addr) else {
        diags.push(
            Diagnostic::error("unsupported resource type")
                .with_detail(format!(
                    "the provider for {:?} offers no schema for this type",
                    n.addr.instance.resource.r#type
                ))
                .with_address(n.addr.to_string()),
        );
        return Flow::Continue;
    };

    let (raw, _) = eval_resource_config(n, rc, ctx, true, diags);
    let (_, coerce_diags) = schema.block.coerce(&raw);
    for d in coerce_diags {
        diags.push(d.with_address(n.addr.to_string()));
    }
    Flow::Continue
}

fn eval_module_expand(node: &Node, ctx: &WalkContext<'_>, diags: &mut Diagnostics) -> Flow {
    let Node::ModuleExpand { module } = node else {
        return Flow::Continue;
    };
    let Some(parent) = module.parent() else {
        return Flow::Continue;
    };
    let Some(step) = module.0.last() else {
        return Flow::Continue;
    };
    let Some(parent_config) = ctx.config.module(&parent) else {
        return Flow::Continue;
    };
    let Some(call) = parent_config.module_calls.get(&step.name) else {
        return Flow::Continue;
    };

    let parent_vars = ctx.module_variables(&parent);
    let data = WalkData { ctx };
    let scope = Scope {
        module: &parent,
        module_config: parent_config,
        variables: &parent_vars,
        data: &data,
        each: None,
        count_index: None,
        self_addr: None,
        workspace: ctx.workspace,
        root_path: ctx.root_path,
        pure_only: ctx.op.is_plan(),
    };

    let mut child_vars = BTreeMap::new();
    for (var_name, var_config) in &call.module.variables {
        let mut value = match call.inputs.get(var_name) {
            Some(expr) => eval::evaluate(&scope, expr, diags),
            None => match &var_config.default {
                Some(json) => crate::value::json::from_plain(json, &Ty::Dynamic)
                    .unwrap_or(Value::Null(Ty::Dynamic)),
                None => Value::Null(Ty::Dynamic),
            },
        };
        if let Some(ty) = &var_config.ty {
            match value.convert(ty) {
                Ok(v) => value = v,
                Err(err) => {
                    diags.push(
                        Diagnostic::error(format!("invalid value for module input {var_name:?}"))
                            .with_detail(err.to_string())
                            .with_address(node.key()),
                    );
                }
            }
        }
        child_vars.insert(var_name.clone(), value);
    }
    ctx.set_module_variables(module, child_vars);
    Flow::Continue
}

fn configure_provider(node: &Node, ctx: &WalkContext<'_>, diags: &mut Diagnostics) -> Flow {
    let Node::ProviderConfigure {
        addr,
        provider_type,
    } = node
    else {
        return Flow::Continue;
    };

    // Render the provider block's configuration, when one exists.
    let mut config_value = Value::empty_object();
    if let Some(mconfig) = ctx.config.module(&addr.module)
        && let Some(block) = mconfig.provider_block(&addr.config)
    {
        let vars = ctx.module_variables(&addr.module);
        let data = WalkData { ctx };
        let scope = Scope {
            module: &addr.module,
            module_config: mconfig,
            variables: &vars,
            data: &data,
            each: None,
            count_index: None,
            self_addr: None,
            workspace: ctx.workspace,
            root_path: ctx.root_path,
            pure_only: ctx.op.is_plan(),
        };
        let mut attrs = BTreeMap::new();
        for (name, expr) in &block.config {
            attrs.insert(name.clone(), eval::evaluate(&scope, expr, diags));
        }
        if diags.has_errors() {
            return Flow::Continue;
        }
        config_value = Value::Object(attrs);
    }

    if let Some(schema) = ctx.schemas.get(provider_type) {
        let (coerced, coerce_diags) = schema.provider.coerce(&config_value);
        diags.extend(coerce_diags);
        if diags.has_errors() {
            return Flow::Continue;
        }
        config_value = coerced;
    }

    if let Err(err) = ctx.registry.configure(addr, provider_type, &config_value) {
        diags.push(
            Diagnostic::error("provider configuration failed")
                .with_detail(err)
                .with_address(addr.to_string()),
        );
    }
    Flow::Continue
}

fn close_provider(node: &Node, ctx: &WalkContext<'_>) -> Flow {
    if let Node::ProviderClose { addr } = node {
        ctx.registry.close(&addr.to_string());
    }
    Flow::Continue
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_refined_keeps_known_planned_values() {
        let planned = Value::Object(BTreeMap::from([
            ("ami".to_string(), Value::string("ami-1")),
            ("id".to_string(), Value::Unknown(Ty::String)),
        ]));
        let refined = Value::Object(BTreeMap::from([
            ("ami".to_string(), Value::string("ami-XXX")),
            ("id".to_string(), Value::string("i-1")),
        ]));
        let merged = merge_refined(&planned, &refined);
        // The known value wins over provider drift; the unknown refines.
        assert_eq!(merged.get_attr("ami").unwrap(), Value::string("ami-1"));
        assert_eq!(merged.get_attr("id").unwrap(), Value::string("i-1"));
    }

    #[test]
    fn test_steps_for_managed_plan() {
        use crate::addrs::{LocalProviderConfig, ModuleInstance, Resource};
        let node = Node::ResourceInstance(ResourceInstanceNode {
            addr: Resource::managed("test_instance", "web")
                .instance(None)
                .absolute(ModuleInstance::root()),
            provider: LocalProviderConfig::default_for("test").absolute(ModuleInstance::root()),
            count_index: None,
            each: None,
            create_before_destroy: false,
        });
        let steps = steps_for(&node, WalkKind::Plan);
        assert_eq!(
            steps,
            vec![
                EvalStep::GetProvider,
                EvalStep::ReadPrior,
                EvalStep::RenderConfig,
                EvalStep::PlanDiff,
                EvalStep::RecordChange,
            ]
        );
        assert!(steps_for(&node, WalkKind::PlanDestroy).is_empty());
        assert!(steps_for(&Node::Root, WalkKind::Apply).is_empty());
    }
}
