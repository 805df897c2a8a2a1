//! # Orchestra
//!
//! The core engine for declarative resource reconciliation: given a typed
//! configuration tree, a prior state snapshot, and a set of providers, it
//! computes the minimal change set needed to converge real resources with
//! the desired state (`plan`), executes those changes in dependency order
//! with bounded parallelism (`apply`), and produces an updated snapshot.
//!
//! ## Core concepts
//!
//! - [`addrs`]: canonical addresses for modules, resources, instances,
//!   providers, and outputs
//! - [`value`]: the typed value system, including unknown placeholders
//!   for attributes decided during apply
//! - [`schema`]: provider-supplied resource schemas used for coercion
//! - [`state`]: immutable snapshots, the synchronized mutator, and the
//!   versioned state file with locking and backups
//! - [`plan`]: typed change sets and the plan file
//! - [`expr`] / [`config`]: the expression evaluator and configuration AST
//! - [`graph`] / [`walk`]: dependency graph construction and the
//!   bounded-parallel walker
//! - [`context`]: the orchestrator hosting validate, refresh, plan,
//!   apply, and destroy
//! - [`provider`]: the trait providers implement, plus an in-memory mock
//! - [`hooks`]: observer callbacks around per-instance operations
//!
//! ## Example
//!
//! ```
//! use orchestra::config::Config;
//! use orchestra::context::{Context, ContextOptions};
//! use orchestra::provider::mock::{MockProvider, test_provider_schema};
//! use orchestra::provider::{ProviderResolver, SharedProvider};
//! use orchestra::state::State;
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! let config = Config::from_json_str(r#"{
//!     "providers": [{"name": "test"}],
//!     "resources": [{
//!         "type": "test_instance", "name": "web",
//!         "config": {"ami": {"lit": "ami-1"}}
//!     }]
//! }"#).unwrap();
//!
//! let factories = BTreeMap::from([(
//!     "test".to_string(),
//!     Arc::new(|| Ok(Arc::new(MockProvider::new(test_provider_schema())) as SharedProvider))
//!         as orchestra::provider::ProviderFactory,
//! )]);
//!
//! let ctx = Context::new(ContextOptions::new(
//!     config,
//!     State::new(),
//!     ProviderResolver::new(factories),
//! )).unwrap();
//!
//! let (plan, _, diags) = ctx.plan(false);
//! assert!(!diags.has_errors());
//! let (state, diags) = ctx.apply(&plan);
//! assert!(!diags.has_errors());
//! assert_eq!(state.all_instance_addrs().len(), 1);
//! ```

pub mod addrs;
pub mod config;
pub mod context;
pub mod diag;
mod eval_steps;
pub mod expr;
pub mod graph;
pub mod hooks;
pub mod plan;
pub mod provider;
pub mod schema;
pub mod state;
pub mod value;
pub mod walk;

pub use context::{Context, ContextOptions};
pub use diag::{Diagnostic, Diagnostics, Severity};
pub use plan::{Action, Plan};
pub use state::{State, StateFile};
pub use value::{Ty, Value};
