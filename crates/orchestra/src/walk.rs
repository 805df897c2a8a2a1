//! Bounded-parallel graph traversal.
//!
//! The walker keeps a ready queue of nodes whose dependencies have all
//! completed and dispatches them onto a fixed-size thread pool. A failed
//! node poisons its transitive dependents (they are skipped as blocked)
//! while independent subgraphs drain to completion. Graph edges are the
//! only synchronization between nodes.

use crate::addrs::{AbsProviderConfig, AbsResourceInstance, ModuleInstance, Resource};
use crate::config::Config;
use crate::diag::{Diagnostic, Diagnostics};
use crate::eval_steps;
use crate::expr::eval::EvalData;
use crate::graph::{Graph, WalkKind};
use crate::hooks::Hook;
use crate::plan::Changes;
use crate::provider::{ProviderResolver, ProviderSchema, SharedProvider};
use crate::state::{DeposedKey, SyncState};
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, mpsc};

/// Default number of concurrently running nodes.
pub const DEFAULT_PARALLELISM: usize = 10;

/// Live provider instances for one walk, keyed by canonical provider
/// config address.
pub struct ProviderRegistry {
    resolver: ProviderResolver,
    instances: Mutex<BTreeMap<String, SharedProvider>>,
}

impl ProviderRegistry {
    pub fn new(resolver: ProviderResolver) -> Self {
        Self {
            resolver,
            instances: Mutex::new(BTreeMap::new()),
        }
    }

    /// Create and configure the instance for one provider config.
    pub fn configure(
        &self,
        addr: &AbsProviderConfig,
        provider_type: &str,
        config: &Value,
    ) -> Result<(), String> {
        let factory = self
            .resolver
            .factory(provider_type)
            .ok_or_else(|| format!("no provider is registered for type {provider_type:?}"))?;
        let instance = factory()?;
        instance.configure(config).map_err(|e| e.summary)?;
        self.instances
            .lock()
            .expect("provider registry lock poisoned")
            .insert(addr.to_string(), instance);
        Ok(())
    }

    pub fn get(&self, addr: &str) -> Option<SharedProvider> {
        self.instances
            .lock()
            .expect("provider registry lock poisoned")
            .get(addr)
            .cloned()
    }

    /// Close and drop one instance.
    pub fn close(&self, addr: &str) {
        let removed = self
            .instances
            .lock()
            .expect("provider registry lock poisoned")
            .remove(addr);
        if let Some(p) = removed {
            p.close();
        }
    }

    /// Ask every live instance to interrupt in-flight work.
    pub fn stop_all(&self) {
        let instances: Vec<SharedProvider> = self
            .instances
            .lock()
            .expect("provider registry lock poisoned")
            .values()
            .cloned()
            .collect();
        for p in instances {
            p.stop();
        }
    }

    /// Close whatever is still open. Instances already closed through
    /// their close node are gone from the map, so each instance closes
    /// exactly once.
    pub fn close_all(&self) {
        let instances: Vec<SharedProvider> = {
            let mut map = self
                .instances
                .lock()
                .expect("provider registry lock poisoned");
            let all = map.values().cloned().collect();
            map.clear();
            all
        };
        for p in instances {
            p.close();
        }
    }
}

/// Everything a node evaluation can reach during a walk.
pub struct WalkContext<'a> {
    pub op: WalkKind,
    pub config: &'a Config,
    /// The working state, mutated through its own lock.
    pub sync: &'a SyncState,
    /// Change set being produced (plan) or echoed (apply).
    pub changes: &'a Mutex<Changes>,
    /// The plan being applied, when this is an apply walk.
    pub planned: Option<&'a Changes>,
    pub registry: &'a ProviderRegistry,
    /// Provider schemas by provider type local name.
    pub schemas: &'a BTreeMap<String, ProviderSchema>,
    pub hooks: &'a dyn Hook,
    /// Resolved input variables per module instance; module expand nodes
    /// fill children in as the walk reaches them.
    pub module_vars: &'a Mutex<BTreeMap<ModuleInstance, BTreeMap<String, Value>>>,
    /// Deposed keys created during this walk, per instance address.
    pub deposed_keys: &'a Mutex<BTreeMap<String, DeposedKey>>,
    pub workspace: &'a str,
    pub root_path: &'a Path,
    pub cancel: &'a AtomicBool,
}

impl WalkContext<'_> {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn module_variables(&self, module: &ModuleInstance) -> BTreeMap<String, Value> {
        self.module_vars
            .lock()
            .expect("module vars lock poisoned")
            .get(module)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_module_variables(
        &self,
        module: &ModuleInstance,
        vars: BTreeMap<String, Value>,
    ) {
        self.module_vars
            .lock()
            .expect("module vars lock poisoned")
            .insert(module.clone(), vars);
    }

    pub fn note_deposed(&self, addr: &AbsResourceInstance, key: DeposedKey) {
        self.deposed_keys
            .lock()
            .expect("deposed keys lock poisoned")
            .insert(addr.to_string(), key);
    }

    pub fn take_deposed(&self, addr: &AbsResourceInstance) -> Option<DeposedKey> {
        self.deposed_keys
            .lock()
            .expect("deposed keys lock poisoned")
            .remove(&addr.to_string())
    }

    pub fn forget_deposed(&self, addr: &AbsResourceInstance) {
        self.take_deposed(addr);
    }
}

/// Expression evaluation data backed by the walk: during plan, resource
/// references resolve to planned values; otherwise to the working state.
pub struct WalkData<'a, 'b> {
    pub ctx: &'a WalkContext<'b>,
}

impl EvalData for WalkData<'_, '_> {
    fn resource_value(&self, module: &ModuleInstance, resource: &Resource) -> Option<Value> {
        if self.ctx.op.is_plan() {
            let changes = self.ctx.changes.lock().expect("changes lock poisoned");
            let mut keyed: Vec<(&Option<crate::addrs::InstanceKey>, &Value)> = changes
                .resources
                .iter()
                .filter(|c| {
                    c.deposed.is_none()
                        && c.addr.module == *module
                        && c.addr.instance.resource == *resource
                        && !c.action.destroys()
                })
                .map(|c| (&c.addr.instance.key, &c.after))
                .collect();
            if !keyed.is_empty() {
                keyed.sort_by_key(|(k, _)| (*k).clone());
                if keyed.len() == 1 && keyed[0].0.is_none() {
                    return Some(keyed[0].1.clone());
                }
                return Some(match keyed[0].0 {
                    Some(crate::addrs::InstanceKey::Str(_)) => Value::Object(
                        keyed
                            .iter()
                            .filter_map(|(k, v)| match k {
                                Some(crate::addrs::InstanceKey::Str(s)) => {
                                    Some((s.clone(), (*v).clone()))
                                }
                                _ => None,
                            })
                            .collect(),
                    ),
                    _ => Value::Tuple(keyed.iter().map(|(_, v)| (*v).clone()).collect()),
                });
            }
        }
        self.ctx.sync.snapshot().resource_value(module, resource)
    }

    fn module_output(&self, child: &ModuleInstance, name: &str) -> Option<Value> {
        self.ctx.sync.output_value(child, name).map(|o| o.value)
    }
}

/// Walk the graph with bounded parallelism, returning the merged
/// diagnostics of every node in graph order.
pub fn walk(graph: &Graph, ctx: &WalkContext<'_>, parallelism: usize) -> Diagnostics {
    let n = graph.len();
    if n == 0 {
        return Diagnostics::new();
    }
    let parallelism = parallelism.max(1);

    #[derive(Clone, Copy, PartialEq)]
    enum Status {
        Pending,
        Running,
        Done,
        Failed,
        Blocked,
    }

    let mut status = vec![Status::Pending; n];
    let mut pending_deps: Vec<usize> = (0..n).map(|i| graph.deps(i).len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        for &d in graph.deps(i) {
            dependents[d].push(i);
        }
    }

    let mut ready: BTreeSet<(String, usize)> = (0..n)
        .filter(|&i| pending_deps[i] == 0)
        .map(|i| (graph.node(i).key(), i))
        .collect();
    let mut node_diags: Vec<Diagnostics> = vec![Diagnostics::new(); n];

    let pool = match rayon::ThreadPoolBuilder::new()
        .num_threads(parallelism)
        .build()
    {
        Ok(pool) => pool,
        Err(err) => {
            let mut diags = Diagnostics::new();
            diags.push(
                Diagnostic::error("failed to start walk thread pool").with_detail(err.to_string()),
            );
            return diags;
        }
    };

    let (tx, rx) = mpsc::channel::<(usize, Diagnostics)>();
    let mut stop_sent = false;

    pool.in_place_scope(|scope| {
        let mut in_flight = 0usize;
        loop {
            if ctx.is_cancelled() && !stop_sent {
                // Stop accepting new nodes; ask providers to interrupt.
                stop_sent = true;
                ctx.registry.stop_all();
            }

            while in_flight < parallelism && !ctx.is_cancelled() {
                let Some((_, idx)) = ready.pop_first() else {
                    break;
                };
                status[idx] = Status::Running;
                in_flight += 1;
                let node = graph.node(idx);
                let tx = tx.clone();
                log::trace!("walk: starting {}", node.key());
                scope.spawn(move |_| {
                    let mut diags = Diagnostics::new();
                    eval_steps::run_sequence(node, ctx, &mut diags);
                    let _ = tx.send((idx, diags));
                });
            }

            if in_flight == 0 {
                break;
            }

            let Ok((idx, diags)) = rx.recv() else {
                break;
            };
            in_flight -= 1;
            let failed = diags.has_errors();
            node_diags[idx] = diags;
            status[idx] = if failed { Status::Failed } else { Status::Done };

            if failed {
                log::debug!("walk: {} failed; blocking dependents", graph.node(idx).key());
                let mut stack = dependents[idx].clone();
                while let Some(d) = stack.pop() {
                    if status[d] == Status::Pending {
                        status[d] = Status::Blocked;
                        stack.extend(dependents[d].iter().copied());
                    }
                }
            } else {
                for &d in &dependents[idx] {
                    pending_deps[d] -= 1;
                    if pending_deps[d] == 0 && status[d] == Status::Pending {
                        ready.insert((graph.node(d).key(), d));
                    }
                }
            }
        }
    });

    // Whatever close nodes never ran (blocked or cancelled) still get
    // their providers released, exactly once each.
    ctx.registry.close_all();

    let mut out = Diagnostics::new();
    for idx in graph.topo_order() {
        out.extend(std::mem::take(&mut node_diags[idx]));
    }
    if ctx.is_cancelled() {
        out.push(Diagnostic::error("operation cancelled").with_detail(
            "the walk was interrupted before all nodes ran; partial results were kept",
        ));
    }
    out
}
