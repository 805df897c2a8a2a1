//! Address model.
//!
//! Every object the engine manipulates has a canonical, comparable address:
//! module instances, resources, resource instances, providers, outputs,
//! variables, and locals. Equality is structural and the canonical string
//! form round-trips through [`Target::parse`] for the address shapes users
//! can name on the command line.
//!
//! # Invariants
//!
//! - The root module instance is the empty step sequence.
//! - Addresses are `Ord` by their canonical string so that ordered maps and
//!   peer-node scheduling stay deterministic for a fixed input.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors from parsing user-supplied address strings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrParseError {
    #[error("empty address")]
    Empty,

    #[error("invalid address {0:?}: {1}")]
    Invalid(String, &'static str),
}

/// Key distinguishing one instance of a resource or module from another.
///
/// `Int` keys come from `count`, `Str` keys from `for_each`. A singleton
/// resource has no key at all (`Option<InstanceKey>::None`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstanceKey {
    Int(i64),
    Str(String),
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceKey::Int(n) => write!(f, "[{n}]"),
            InstanceKey::Str(s) => write!(f, "[{s:?}]"),
        }
    }
}

/// One step in a module instance path: the call name plus an optional key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModuleStep {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<InstanceKey>,
}

/// The address of a particular instance of a module.
///
/// The root module is the empty sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModuleInstance(pub Vec<ModuleStep>);

impl ModuleInstance {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The address of a child module instance under this one.
    pub fn child(&self, name: impl Into<String>, key: Option<InstanceKey>) -> Self {
        let mut steps = self.0.clone();
        steps.push(ModuleStep {
            name: name.into(),
            key,
        });
        Self(steps)
    }

    /// The parent module instance, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    /// Whether `self` equals `other` or is nested anywhere below it.
    pub fn is_within(&self, other: &ModuleInstance) -> bool {
        self.0.len() >= other.0.len() && self.0[..other.0.len()] == other.0[..]
    }
}

impl ModuleInstance {
    /// Parse a canonical module instance string such as
    /// `module.app[0].module.db`. The empty string is the root.
    pub fn parse(s: &str) -> Result<Self, AddrParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::root());
        }
        match Target::parse(s)? {
            Target::Module(m) => Ok(m),
            _ => Err(AddrParseError::Invalid(
                s.to_string(),
                "expected a module instance address",
            )),
        }
    }
}

impl fmt::Display for ModuleInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "module.{}", step.name)?;
            if let Some(key) = &step.key {
                write!(f, "{key}")?;
            }
        }
        Ok(())
    }
}

/// Whether a resource is managed (create/update/delete) or a data read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceMode {
    Managed,
    Data,
}

/// A resource address within a module: mode, type, and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Resource {
    pub mode: ResourceMode,
    pub r#type: String,
    pub name: String,
}

impl Resource {
    pub fn managed(r#type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            mode: ResourceMode::Managed,
            r#type: r#type.into(),
            name: name.into(),
        }
    }

    pub fn data(r#type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            mode: ResourceMode::Data,
            r#type: r#type.into(),
            name: name.into(),
        }
    }

    pub fn instance(&self, key: Option<InstanceKey>) -> ResourceInstance {
        ResourceInstance {
            resource: self.clone(),
            key,
        }
    }

    pub fn absolute(&self, module: ModuleInstance) -> AbsResource {
        AbsResource {
            module,
            resource: self.clone(),
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            ResourceMode::Managed => write!(f, "{}.{}", self.r#type, self.name),
            ResourceMode::Data => write!(f, "data.{}.{}", self.r#type, self.name),
        }
    }
}

/// A resource plus an optional instance key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceInstance {
    pub resource: Resource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<InstanceKey>,
}

impl ResourceInstance {
    pub fn absolute(&self, module: ModuleInstance) -> AbsResourceInstance {
        AbsResourceInstance {
            module,
            instance: self.clone(),
        }
    }
}

impl fmt::Display for ResourceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.resource)?;
        if let Some(key) = &self.key {
            write!(f, "{key}")?;
        }
        Ok(())
    }
}

/// A resource within a specific module instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AbsResource {
    pub module: ModuleInstance,
    pub resource: Resource,
}

impl fmt::Display for AbsResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.module.is_root() {
            write!(f, "{}", self.resource)
        } else {
            write!(f, "{}.{}", self.module, self.resource)
        }
    }
}

/// A fully-qualified resource instance address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AbsResourceInstance {
    pub module: ModuleInstance,
    pub instance: ResourceInstance,
}

impl AbsResourceInstance {
    pub fn resource(&self) -> AbsResource {
        AbsResource {
            module: self.module.clone(),
            resource: self.instance.resource.clone(),
        }
    }
}

impl fmt::Display for AbsResourceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.module.is_root() {
            write!(f, "{}", self.instance)
        } else {
            write!(f, "{}.{}", self.module, self.instance)
        }
    }
}

/// The address of an output value within a module instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AbsOutputValue {
    pub module: ModuleInstance,
    pub name: String,
}

impl fmt::Display for AbsOutputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.module.is_root() {
            write!(f, "output.{}", self.name)
        } else {
            write!(f, "{}.output.{}", self.module, self.name)
        }
    }
}

/// A provider configuration address local to one module: the provider's
/// local type name plus an optional alias.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalProviderConfig {
    pub local_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl LocalProviderConfig {
    /// The default (un-aliased) configuration for a provider type.
    pub fn default_for(local_name: impl Into<String>) -> Self {
        Self {
            local_name: local_name.into(),
            alias: None,
        }
    }

    pub fn absolute(&self, module: ModuleInstance) -> AbsProviderConfig {
        AbsProviderConfig {
            module,
            config: self.clone(),
        }
    }
}

impl fmt::Display for LocalProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.alias {
            Some(alias) => write!(f, "provider.{}.{}", self.local_name, alias),
            None => write!(f, "provider.{}", self.local_name),
        }
    }
}

/// A provider configuration within a specific module instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AbsProviderConfig {
    pub module: ModuleInstance,
    pub config: LocalProviderConfig,
}

impl AbsProviderConfig {
    /// Parse a canonical provider config string such as `provider.test`,
    /// `provider.test.west`, or `module.app.provider.test`.
    pub fn parse(s: &str) -> Result<Self, AddrParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddrParseError::Empty);
        }
        let invalid = |why| AddrParseError::Invalid(s.to_string(), why);

        let mut module = ModuleInstance::root();
        let mut rest = s;
        while let Some(tail) = rest.strip_prefix("module.") {
            let (name, key, remaining) = parse_component(tail, s)?;
            module = module.child(name, key);
            rest = remaining.ok_or_else(|| invalid("missing provider component"))?;
        }

        let tail = rest
            .strip_prefix("provider.")
            .ok_or_else(|| invalid("expected a provider.NAME component"))?;
        let mut parts = tail.split('.');
        let local_name = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| invalid("missing provider name"))?
            .to_string();
        let alias = parts.next().map(str::to_string);
        if parts.next().is_some() {
            return Err(invalid("trailing components after provider alias"));
        }
        Ok(AbsProviderConfig {
            module,
            config: LocalProviderConfig { local_name, alias },
        })
    }
}

impl fmt::Display for AbsProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.module.is_root() {
            write!(f, "{}", self.config)
        } else {
            write!(f, "{}.{}", self.module, self.config)
        }
    }
}

/// An operation target: a module, a whole resource, or one instance.
///
/// Targets constrain plan and apply to the transitive dependency closure of
/// the addressed objects.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Target {
    Module(ModuleInstance),
    Resource(AbsResource),
    Instance(AbsResourceInstance),
}

impl Target {
    /// Parse a target address as written on the command line.
    ///
    /// Accepted shapes: `module.NAME`, `TYPE.NAME`, `data.TYPE.NAME`, each
    /// optionally suffixed with `[KEY]` on the final component, and module
    /// paths may prefix resource addresses.
    pub fn parse(s: &str) -> Result<Self, AddrParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddrParseError::Empty);
        }

        let mut module = ModuleInstance::root();
        let mut rest = s;

        // Consume leading module.NAME[KEY] steps.
        while let Some(tail) = rest.strip_prefix("module.") {
            let (name, key, remaining) = parse_component(tail, s)?;
            module = module.child(name, key);
            match remaining {
                Some(r) => rest = r,
                None => return Ok(Target::Module(module)),
            }
        }

        let mode = match rest.strip_prefix("data.") {
            Some(tail) => {
                rest = tail;
                ResourceMode::Data
            }
            None => ResourceMode::Managed,
        };

        let (r#type, type_key, remaining) = parse_component(rest, s)?;
        if type_key.is_some() {
            return Err(AddrParseError::Invalid(
                s.to_string(),
                "resource type cannot carry an instance key",
            ));
        }
        let Some(remaining) = remaining else {
            return Err(AddrParseError::Invalid(
                s.to_string(),
                "resource address requires both a type and a name",
            ));
        };

        let (name, key, extra) = parse_component(remaining, s)?;
        if extra.is_some() {
            return Err(AddrParseError::Invalid(
                s.to_string(),
                "trailing components after resource name",
            ));
        }

        let resource = Resource { mode, r#type, name };
        match key {
            None => Ok(Target::Resource(resource.absolute(module))),
            Some(key) => Ok(Target::Instance(
                resource.instance(Some(key)).absolute(module),
            )),
        }
    }

    /// Whether the given instance address falls under this target.
    pub fn matches(&self, addr: &AbsResourceInstance) -> bool {
        match self {
            Target::Module(m) => addr.module.is_within(m),
            Target::Resource(r) => addr.module == r.module && addr.instance.resource == r.resource,
            Target::Instance(i) => addr == i,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Module(m) => write!(f, "{m}"),
            Target::Resource(r) => write!(f, "{r}"),
            Target::Instance(i) => write!(f, "{i}"),
        }
    }
}

/// Split one dot-separated component off the front of `rest`, together with
/// an optional `[KEY]` suffix. Returns `(name, key, remaining)`.
fn parse_component<'a>(
    rest: &'a str,
    whole: &str,
) -> Result<(String, Option<InstanceKey>, Option<&'a str>), AddrParseError> {
    if rest.is_empty() {
        return Err(AddrParseError::Invalid(
            whole.to_string(),
            "unexpected end of address",
        ));
    }

    let (head, remaining) = match split_top_level_dot(rest) {
        Some((h, r)) => (h, Some(r)),
        None => (rest, None),
    };

    let (name, key) = match head.find('[') {
        None => (head, None),
        Some(open) => {
            let Some(inner) = head[open..].strip_prefix('[').and_then(|k| k.strip_suffix(']'))
            else {
                return Err(AddrParseError::Invalid(
                    whole.to_string(),
                    "unterminated instance key",
                ));
            };
            let key = if let Ok(n) = inner.parse::<i64>() {
                InstanceKey::Int(n)
            } else {
                InstanceKey::Str(inner.trim_matches('"').to_string())
            };
            (&head[..open], Some(key))
        }
    };

    if name.is_empty() {
        return Err(AddrParseError::Invalid(
            whole.to_string(),
            "empty address component",
        ));
    }
    Ok((name.to_string(), key, remaining))
}

/// Split at the first `.` that is not inside an instance-key bracket.
fn split_top_level_dot(s: &str) -> Option<(&str, &str)> {
    let mut depth = 0usize;
    for (i, ch) in s.char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            '.' if depth == 0 => return Some((&s[..i], &s[i + 1..])),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_instance_display() {
        let root = ModuleInstance::root();
        assert_eq!(root.to_string(), "");
        assert!(root.is_root());

        let child = root.child("network", None);
        assert_eq!(child.to_string(), "module.network");

        let keyed = child.child("subnet", Some(InstanceKey::Int(2)));
        assert_eq!(keyed.to_string(), "module.network.module.subnet[2]");
        assert_eq!(keyed.parent(), Some(child));
    }

    #[test]
    fn test_resource_instance_display() {
        let res = Resource::managed("test_instance", "web");
        let inst = res.instance(Some(InstanceKey::Int(0)));
        let abs = inst.absolute(ModuleInstance::root().child("app", None));
        assert_eq!(abs.to_string(), "module.app.test_instance.web[0]");

        let data = Resource::data("test_source", "lookup");
        assert_eq!(data.to_string(), "data.test_source.lookup");
    }

    #[test]
    fn test_provider_config_display() {
        let local = LocalProviderConfig::default_for("test");
        assert_eq!(local.to_string(), "provider.test");

        let aliased = LocalProviderConfig {
            local_name: "test".into(),
            alias: Some("west".into()),
        };
        let abs = aliased.absolute(ModuleInstance::root().child("app", None));
        assert_eq!(abs.to_string(), "module.app.provider.test.west");
    }

    #[test]
    fn test_target_parse_resource() {
        let t = Target::parse("test_instance.web").unwrap();
        match &t {
            Target::Resource(r) => {
                assert_eq!(r.resource.mode, ResourceMode::Managed);
                assert_eq!(r.resource.r#type, "test_instance");
                assert_eq!(r.resource.name, "web");
            }
            other => panic!("unexpected target {other:?}"),
        }
        assert_eq!(t.to_string(), "test_instance.web");
    }

    #[test]
    fn test_target_parse_instance_and_data() {
        let t = Target::parse("test_instance.web[3]").unwrap();
        match t {
            Target::Instance(i) => {
                assert_eq!(i.instance.key, Some(InstanceKey::Int(3)));
            }
            other => panic!("unexpected target {other:?}"),
        }

        let t = Target::parse("data.test_source.lookup").unwrap();
        match t {
            Target::Resource(r) => assert_eq!(r.resource.mode, ResourceMode::Data),
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[test]
    fn test_target_parse_module_paths() {
        let t = Target::parse("module.app").unwrap();
        assert_eq!(t, Target::Module(ModuleInstance::root().child("app", None)));

        let t = Target::parse("module.app[0].test_instance.web").unwrap();
        match t {
            Target::Resource(r) => {
                assert_eq!(
                    r.module,
                    ModuleInstance::root().child("app", Some(InstanceKey::Int(0)))
                );
            }
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[test]
    fn test_target_parse_rejects_garbage() {
        assert_eq!(Target::parse(""), Err(AddrParseError::Empty));
        assert!(Target::parse("test_instance").is_err());
        assert!(Target::parse("test_instance.web.extra").is_err());
        assert!(Target::parse("test_instance.web[0").is_err());
    }

    #[test]
    fn test_target_matches_closure_shapes() {
        let inst = Resource::managed("test_instance", "web")
            .instance(Some(InstanceKey::Int(1)))
            .absolute(ModuleInstance::root().child("app", None));

        assert!(Target::parse("module.app").unwrap().matches(&inst));
        assert!(Target::parse("module.app.test_instance.web").unwrap().matches(&inst));
        assert!(
            Target::parse("module.app.test_instance.web[1]")
                .unwrap()
                .matches(&inst)
        );
        assert!(
            !Target::parse("module.app.test_instance.web[0]")
                .unwrap()
                .matches(&inst)
        );
        assert!(!Target::parse("module.other").unwrap().matches(&inst));
    }

    #[test]
    fn test_parse_canonical_forms_round_trip() {
        let m = ModuleInstance::parse("module.app[0].module.db").unwrap();
        assert_eq!(ModuleInstance::parse(&m.to_string()), Ok(m.clone()));
        assert_eq!(ModuleInstance::parse(""), Ok(ModuleInstance::root()));
        assert!(ModuleInstance::parse("test_instance.web").is_err());

        for text in ["provider.test", "provider.test.west", "module.app.provider.test"] {
            let p = AbsProviderConfig::parse(text).unwrap();
            assert_eq!(p.to_string(), text);
        }
        assert!(AbsProviderConfig::parse("module.app").is_err());
        assert!(AbsProviderConfig::parse("provider.").is_err());
    }

    #[test]
    fn test_is_within() {
        let root = ModuleInstance::root();
        let app = root.child("app", None);
        let deep = app.child("db", Some(InstanceKey::Str("x".into())));

        assert!(deep.is_within(&app));
        assert!(deep.is_within(&root));
        assert!(app.is_within(&root));
        assert!(!app.is_within(&deep));
    }
}
