//! The provider façade.
//!
//! Providers own families of resource types and implement the actual
//! create/read/update/delete calls against external systems. The engine
//! only sees this trait; transports (in-process mocks, out-of-process
//! plugins) are someone else's concern.
//!
//! One provider instance exists per resolved provider configuration.
//! `configure` is called at most once per instance, before any resource
//! operation; `close` exactly once at operation end. After `configure`
//! returns, a provider must tolerate concurrent resource calls.

pub mod mock;

use crate::diag::Diagnostics;
use crate::schema::{Block, Schema};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Everything a provider serves: its own config block plus schemas for its
/// resource types and data sources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSchema {
    pub provider: Block,
    #[serde(default)]
    pub resource_types: BTreeMap<String, Schema>,
    #[serde(default)]
    pub data_sources: BTreeMap<String, Schema>,
}

impl ProviderSchema {
    pub fn resource_type(&self, name: &str) -> Option<&Schema> {
        self.resource_types.get(name)
    }

    pub fn data_source(&self, name: &str) -> Option<&Schema> {
        self.data_sources.get(name)
    }
}

/// A failed provider call. `partial` carries whatever object the provider
/// managed to produce before failing; the engine records it tainted.
#[derive(Debug, Clone)]
pub struct ProviderFailure {
    pub summary: String,
    pub partial: Option<Value>,
}

impl ProviderFailure {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            partial: None,
        }
    }

    pub fn with_partial(mut self, partial: Value) -> Self {
        self.partial = Some(partial);
        self
    }
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary)
    }
}

impl std::error::Error for ProviderFailure {}

pub type ProviderResult<T> = Result<T, ProviderFailure>;

/// Request to plan a change for one resource instance.
#[derive(Debug)]
pub struct PlanRequest<'a> {
    pub type_name: &'a str,
    /// Prior object value; null when the instance does not exist.
    pub prior: &'a Value,
    /// Config-rendered desired value, nulls where computed attributes are
    /// left to the provider.
    pub proposed: &'a Value,
    pub private: &'a [u8],
}

/// A provider's answer to a plan request.
#[derive(Debug)]
pub struct PlanResponse {
    /// The planned new object; unknown where the value is decided during
    /// apply. Null means the object will be destroyed.
    pub planned: Value,
    /// Attribute paths whose change requires replacing the instance.
    pub requires_replace: Vec<String>,
    pub private: Vec<u8>,
}

/// Request to apply a previously planned change.
#[derive(Debug)]
pub struct ApplyRequest<'a> {
    pub type_name: &'a str,
    pub prior: &'a Value,
    /// The planned value from [`Provider::plan_change`]; null requests a
    /// destroy.
    pub planned: &'a Value,
    pub private: &'a [u8],
}

/// A provider's answer to an apply: the final object (null after destroy)
/// and refreshed private data.
#[derive(Debug)]
pub struct ApplyResponse {
    pub new_state: Value,
    pub private: Vec<u8>,
}

/// Response to reading a managed resource's current remote object.
#[derive(Debug)]
pub struct ReadResponse {
    /// The observed object, or null when the remote object vanished.
    pub new_state: Value,
    pub private: Vec<u8>,
}

/// The operations the engine performs against a provider.
pub trait Provider: Send + Sync {
    fn schema(&self) -> ProviderResult<ProviderSchema>;

    fn configure(&self, config: &Value) -> ProviderResult<()>;

    /// Early validation of one resource configuration; diagnostics are
    /// collected, never fatal to the whole operation.
    fn validate_resource_config(&self, type_name: &str, config: &Value) -> Diagnostics;

    fn read_resource(
        &self,
        type_name: &str,
        prior: &Value,
        private: &[u8],
    ) -> ProviderResult<ReadResponse>;

    fn plan_change(&self, req: &PlanRequest<'_>) -> ProviderResult<PlanResponse>;

    fn apply_change(&self, req: &ApplyRequest<'_>) -> ProviderResult<ApplyResponse>;

    fn read_data_source(&self, type_name: &str, config: &Value) -> ProviderResult<Value>;

    /// Best-effort interrupt of in-flight operations during cancellation.
    fn stop(&self) {}

    /// Release the instance. Called exactly once, after the last resource
    /// operation.
    fn close(&self) {}
}

pub type SharedProvider = Arc<dyn Provider>;

/// Produces a fresh provider instance for one resolved provider config.
pub type ProviderFactory = Arc<dyn Fn() -> Result<SharedProvider, String> + Send + Sync>;

/// The provider factories available to an operation, keyed by provider
/// type name, with optional SHA-256 digests of the provider binaries.
#[derive(Clone, Default)]
pub struct ProviderResolver {
    pub factories: BTreeMap<String, ProviderFactory>,
    pub digests: BTreeMap<String, String>,
}

impl ProviderResolver {
    pub fn new(factories: BTreeMap<String, ProviderFactory>) -> Self {
        Self {
            factories,
            digests: BTreeMap::new(),
        }
    }

    pub fn with_digest(mut self, type_name: impl Into<String>, digest: impl Into<String>) -> Self {
        self.digests.insert(type_name.into(), digest.into());
        self
    }

    pub fn factory(&self, type_name: &str) -> Option<&ProviderFactory> {
        self.factories.get(type_name)
    }

    pub fn digest(&self, type_name: &str) -> Option<&str> {
        self.digests.get(type_name).map(String::as_str)
    }
}

impl fmt::Debug for ProviderResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderResolver")
            .field("types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
