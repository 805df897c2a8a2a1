//! Resource type schemas.
//!
//! Providers describe each resource type as a block of attributes plus
//! nested blocks. The engine uses schemas to coerce configuration values,
//! derive the object type an instance's attributes must conform to, and
//! locate sensitive attribute paths.

use crate::diag::{Diagnostic, Diagnostics};
use crate::value::{Ty, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A versioned schema for one resource or data source type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Monotonic version of the attribute layout; recorded per instance in
    /// state so old snapshots can be detected.
    #[serde(default)]
    pub version: u64,
    pub block: Block,
}

/// A block: named attributes plus nested block types.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(default)]
    pub attributes: BTreeMap<String, Attribute>,
    #[serde(default)]
    pub block_types: BTreeMap<String, NestedBlock>,
}

/// One attribute in a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    #[serde(rename = "type")]
    pub ty: Ty,
    /// May be set in configuration.
    #[serde(default)]
    pub optional: bool,
    /// Must be set in configuration.
    #[serde(default)]
    pub required: bool,
    /// Supplied by the provider; config may leave it unset.
    #[serde(default)]
    pub computed: bool,
    /// Values are redacted from rendered output.
    #[serde(default)]
    pub sensitive: bool,
    /// A change to this attribute cannot be applied in place and forces
    /// replacement of the instance.
    #[serde(default)]
    pub force_new: bool,
}

impl Attribute {
    pub fn required(ty: Ty) -> Self {
        Self {
            ty,
            optional: false,
            required: true,
            computed: false,
            sensitive: false,
            force_new: false,
        }
    }

    pub fn optional(ty: Ty) -> Self {
        Self {
            ty,
            optional: true,
            required: false,
            computed: false,
            sensitive: false,
            force_new: false,
        }
    }

    pub fn computed(ty: Ty) -> Self {
        Self {
            ty,
            optional: false,
            required: false,
            computed: true,
            sensitive: false,
            force_new: false,
        }
    }

    pub fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }
}

/// How a nested block repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Nesting {
    Single,
    List,
}

/// A nested block type within a parent block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedBlock {
    pub nesting: Nesting,
    pub block: Block,
}

impl Block {
    /// The object type a conforming value of this block has: one field per
    /// attribute and one per nested block type.
    pub fn implied_type(&self) -> Ty {
        let mut fields: BTreeMap<String, Ty> = self
            .attributes
            .iter()
            .map(|(name, attr)| (name.clone(), attr.ty.clone()))
            .collect();
        for (name, nested) in &self.block_types {
            let inner = nested.block.implied_type();
            let ty = match nested.nesting {
                Nesting::Single => inner,
                Nesting::List => Ty::List(Box::new(inner)),
            };
            fields.insert(name.clone(), ty);
        }
        Ty::Object(fields)
    }

    /// Coerce a raw configuration value into a value conforming to this
    /// block, reporting diagnostics for violations.
    ///
    /// Rules:
    /// - a missing required attribute is an error;
    /// - a missing optional or computed attribute becomes null (computed
    ///   ones are later replaced by the provider's proposal);
    /// - unknown values are accepted for any attribute type;
    /// - known values are converted to the attribute type where the
    ///   standard conversions allow.
    pub fn coerce(&self, raw: &Value) -> (Value, Diagnostics) {
        let mut diags = Diagnostics::new();

        if raw.is_unknown() {
            return (Value::Unknown(self.implied_type()), diags);
        }
        if raw.is_null() {
            // An absent block body reads as an all-null object.
            return (self.coerce_empty(&mut diags), diags);
        }

        let mut out = BTreeMap::new();
        for (name, attr) in &self.attributes {
            let given = raw.get_attr(name).ok().filter(|v| !v.is_null());
            match given {
                None => {
                    if attr.required {
                        diags.push(
                            Diagnostic::error(format!("missing required attribute {name:?}"))
                                .with_detail(format!(
                                    "the attribute {name:?} must be set and no default applies"
                                )),
                        );
                    }
                    out.insert(name.clone(), Value::Null(attr.ty.clone()));
                }
                Some(v) if v.is_unknown() => {
                    out.insert(name.clone(), Value::Unknown(attr.ty.clone()));
                }
                Some(v) => match v.convert(&attr.ty) {
                    Ok(converted) => {
                        out.insert(name.clone(), converted);
                    }
                    Err(err) => {
                        diags.push(
                            Diagnostic::error(format!("invalid value for attribute {name:?}"))
                                .with_detail(err.to_string()),
                        );
                        out.insert(name.clone(), Value::Null(attr.ty.clone()));
                    }
                },
            }
        }

        for (name, nested) in &self.block_types {
            let given = raw.get_attr(name).ok();
            let coerced = match nested.nesting {
                Nesting::Single => {
                    let (v, d) = nested.block.coerce(&given.unwrap_or(Value::Null(Ty::Dynamic)));
                    diags.extend(d);
                    v
                }
                Nesting::List => match given {
                    None | Some(Value::Null(_)) => {
                        Value::List(nested.block.implied_type(), Vec::new())
                    }
                    Some(v) if v.is_unknown() => {
                        Value::Unknown(Ty::List(Box::new(nested.block.implied_type())))
                    }
                    Some(v) => match v.iter_pairs() {
                        Ok(pairs) => {
                            let mut elems = Vec::with_capacity(pairs.len());
                            for (_, elem) in pairs {
                                let (v, d) = nested.block.coerce(&elem);
                                diags.extend(d);
                                elems.push(v);
                            }
                            Value::List(nested.block.implied_type(), elems)
                        }
                        Err(err) => {
                            diags.push(
                                Diagnostic::error(format!("invalid nested block {name:?}"))
                                    .with_detail(err.to_string()),
                            );
                            Value::List(nested.block.implied_type(), Vec::new())
                        }
                    },
                },
            };
            out.insert(name.clone(), coerced);
        }

        (Value::Object(out), diags)
    }

    fn coerce_empty(&self, diags: &mut Diagnostics) -> Value {
        let mut out = BTreeMap::new();
        for (name, attr) in &self.attributes {
            if attr.required {
                diags.push(Diagnostic::error(format!(
                    "missing required attribute {name:?}"
                )));
            }
            out.insert(name.clone(), Value::Null(attr.ty.clone()));
        }
        for (name, nested) in &self.block_types {
            let v = match nested.nesting {
                Nesting::Single => {
                    let (v, d) = nested.block.coerce(&Value::Null(Ty::Dynamic));
                    diags.extend(d);
                    v
                }
                Nesting::List => Value::List(nested.block.implied_type(), Vec::new()),
            };
            out.insert(name.clone(), v);
        }
        Value::Object(out)
    }

    /// Dotted paths of every sensitive attribute, including nested blocks.
    pub fn sensitive_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_sensitive("", &mut out);
        out.sort();
        out
    }

    fn collect_sensitive(&self, prefix: &str, out: &mut Vec<String>) {
        for (name, attr) in &self.attributes {
            if attr.sensitive {
                out.push(join_path(prefix, name));
            }
        }
        for (name, nested) in &self.block_types {
            nested
                .block
                .collect_sensitive(&join_path(prefix, name), out);
        }
    }

    /// Names of attributes whose change forces replacement.
    pub fn force_new_attrs(&self) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|(_, a)| a.force_new)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}
