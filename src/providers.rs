//! Provider registration for the CLI.
//!
//! The engine takes a map of provider factories; discovery of external
//! plugin binaries lives outside this repository, so the CLI registers
//! the in-process providers it ships with. The `test` provider backs
//! local experiments and the end-to-end test suite.

use orchestra::provider::mock::{MockProvider, test_provider_schema};
use orchestra::provider::{ProviderFactory, ProviderResolver, SharedProvider};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The providers this binary can serve in-process.
pub fn builtin_providers() -> ProviderResolver {
    let mut factories: BTreeMap<String, ProviderFactory> = BTreeMap::new();
    factories.insert(
        "test".to_string(),
        Arc::new(|| Ok(Arc::new(MockProvider::new(test_provider_schema())) as SharedProvider)),
    );
    ProviderResolver::new(factories)
}
