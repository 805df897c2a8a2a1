//! Typed configuration tree.
//!
//! The engine consumes configuration as a pre-built typed AST: a tree of
//! module configurations holding variables, locals, outputs, provider
//! blocks, resources, and child module calls. The AST derives serde so a
//! front end (or a test) can load it from a JSON document; no user-facing
//! syntax lives in this crate.

use crate::addrs::{LocalProviderConfig, ModuleInstance, Resource, ResourceMode};
use crate::expr::Expr;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A whole configuration: the root module.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub root: ModuleConfig,
}

impl Config {
    pub fn from_json_str(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// The module configuration for a module instance address, if the
    /// call path exists. Instance keys are ignored: every instance of a
    /// call shares one configuration.
    pub fn module(&self, addr: &ModuleInstance) -> Option<&ModuleConfig> {
        let mut current = &self.root;
        for step in &addr.0 {
            current = &current.module_calls.get(&step.name)?.module;
        }
        Some(current)
    }
}

/// Configuration of a single module.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleConfig {
    #[serde(default)]
    pub variables: BTreeMap<String, VariableConfig>,
    #[serde(default)]
    pub locals: BTreeMap<String, Expr>,
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputConfig>,
    #[serde(default)]
    pub providers: Vec<ProviderBlock>,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    #[serde(default)]
    pub module_calls: BTreeMap<String, ModuleCall>,
}

impl ModuleConfig {
    pub fn resource(&self, addr: &Resource) -> Option<&ResourceConfig> {
        self.resources
            .iter()
            .find(|r| r.mode == addr.mode && r.r#type == addr.r#type && r.name == addr.name)
    }

    pub fn has_resource(&self, addr: &Resource) -> bool {
        self.resource(addr).is_some()
    }

    /// The provider block matching a local provider config, if declared
    /// in this module.
    pub fn provider_block(&self, config: &LocalProviderConfig) -> Option<&ProviderBlock> {
        self.providers
            .iter()
            .find(|p| p.name == config.local_name && p.alias == config.alias)
    }
}

/// An input variable declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableConfig {
    /// Expected type; `None` reads as any.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub ty: Option<crate::value::Ty>,
    /// Default value in plain JSON form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// An output value declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub value: Expr,
    #[serde(default)]
    pub sensitive: bool,
}

/// A provider configuration block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderBlock {
    /// Local provider type name, e.g. `test`.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Attribute expressions for the provider's own configuration.
    #[serde(default)]
    pub config: BTreeMap<String, Expr>,
}

impl ProviderBlock {
    pub fn local_addr(&self) -> LocalProviderConfig {
        LocalProviderConfig {
            local_name: self.name.clone(),
            alias: self.alias.clone(),
        }
    }
}

/// Lifecycle settings for a managed resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    #[serde(default)]
    pub create_before_destroy: bool,
    #[serde(default)]
    pub prevent_destroy: bool,
}

/// A managed or data resource declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default = "default_mode")]
    pub mode: ResourceMode,
    #[serde(rename = "type")]
    pub r#type: String,
    pub name: String,
    /// Explicit provider selection; defaults to the un-aliased config for
    /// the type's implied provider name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<LocalProviderConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<Expr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<Expr>,
    /// Attribute expressions for the resource body.
    #[serde(default)]
    pub config: BTreeMap<String, Expr>,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    /// Extra dependencies as address strings, e.g. `test_instance.base`.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn default_mode() -> ResourceMode {
    ResourceMode::Managed
}

impl ResourceConfig {
    pub fn addr(&self) -> Resource {
        Resource {
            mode: self.mode,
            r#type: self.r#type.clone(),
            name: self.name.clone(),
        }
    }

    /// The provider configuration this resource uses, before module
    /// inheritance is applied. The implied provider name is the prefix of
    /// the resource type up to the first underscore.
    pub fn provider_config(&self) -> LocalProviderConfig {
        match &self.provider {
            Some(p) => p.clone(),
            None => {
                let implied = self
                    .r#type
                    .split('_')
                    .next()
                    .unwrap_or(self.r#type.as_str());
                LocalProviderConfig::default_for(implied)
            }
        }
    }
}

/// A call to a child module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<Expr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<Expr>,
    /// Input variable expressions passed to the child.
    #[serde(default)]
    pub inputs: BTreeMap<String, Expr>,
    /// The child module's own configuration, inlined.
    pub module: ModuleConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::InstanceKey;

    #[test]
    fn test_config_document_round_trip() {
        let text = r#"{
            "variables": {"region": {"type": "string", "default": "us-east-1"}},
            "locals": {"suffix": {"lit": "x"}},
            "providers": [{"name": "test", "config": {}}],
            "resources": [{
                "type": "test_instance",
                "name": "web",
                "count": {"lit": 2},
                "config": {"ami": {"ref": "var.region"}},
                "lifecycle": {"prevent_destroy": true}
            }],
            "outputs": {"ids": {"value": {"ref": "test_instance.web"}}},
            "module_calls": {
                "app": {
                    "module": {
                        "resources": [{"type": "test_instance", "name": "inner", "config": {}}]
                    }
                }
            }
        }"#;
        let config = Config::from_json_str(text).unwrap();
        assert_eq!(config.root.resources.len(), 1);
        let res = &config.root.resources[0];
        assert_eq!(res.mode, ResourceMode::Managed);
        assert!(res.lifecycle.prevent_destroy);
        assert_eq!(res.provider_config().local_name, "test");

        let child_addr = ModuleInstance::root().child("app", Some(InstanceKey::Int(0)));
        let child = config.module(&child_addr).unwrap();
        assert_eq!(child.resources[0].name, "inner");

        assert!(config.module(&ModuleInstance::root().child("nope", None)).is_none());
    }

    #[test]
    fn test_resource_lookup() {
        let config = ModuleConfig {
            resources: vec![ResourceConfig {
                mode: ResourceMode::Data,
                r#type: "test_source".into(),
                name: "lookup".into(),
                provider: None,
                count: None,
                for_each: None,
                config: BTreeMap::new(),
                lifecycle: Lifecycle::default(),
                depends_on: Vec::new(),
            }],
            ..Default::default()
        };
        assert!(config.has_resource(&Resource::data("test_source", "lookup")));
        assert!(!config.has_resource(&Resource::managed("test_source", "lookup")));
    }
}
