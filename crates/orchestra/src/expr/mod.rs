//! Expression AST and references.
//!
//! Expressions arrive pre-parsed (the front-end syntax is out of scope) as
//! a small typed AST with a serde form, so configuration documents carry
//! expressions like `{"ref": "test_instance.web.id"}` or
//! `{"call": {"name": "length", "args": [...]}}`.

pub mod eval;
pub mod funcs;

use crate::addrs::{InstanceKey, Resource, ResourceMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RefError {
    #[error("invalid reference {0:?}: {1}")]
    Invalid(String, &'static str),
}

/// An expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// A literal in plain JSON form.
    Lit(serde_json::Value),
    /// A reference, e.g. `var.region` or `test_instance.web[0].id`.
    Ref(String),
    /// Attribute selection on the result of another expression.
    GetAttr { of: Box<Expr>, name: String },
    /// Collection indexing.
    Index { of: Box<Expr>, key: Box<Expr> },
    /// Splat projection `of.*.attr`.
    Splat { of: Box<Expr>, attr: String },
    /// Function call.
    Call { name: String, args: Vec<Expr> },
    Unary { op: UnaryOp, operand: Box<Expr> },
    Binary { op: BinaryOp, lhs: Box<Expr>, rhs: Box<Expr> },
    /// Conditional `cond ? then : otherwise`.
    Cond {
        #[serde(rename = "if")]
        cond: Box<Expr>,
        then: Box<Expr>,
        #[serde(rename = "else")]
        otherwise: Box<Expr>,
    },
    /// Tuple constructor.
    Tuple(Vec<Expr>),
    /// Object constructor.
    Object(BTreeMap<String, Expr>),
    /// String template: pieces are stringified and concatenated.
    Template(Vec<Expr>),
}

impl Expr {
    pub fn lit(value: impl Into<serde_json::Value>) -> Self {
        Expr::Lit(value.into())
    }

    pub fn reference(s: impl Into<String>) -> Self {
        Expr::Ref(s.into())
    }

    /// Every reference mentioned anywhere in this expression, parsed.
    /// Unparseable references are skipped here; evaluation reports them.
    pub fn references(&self) -> Vec<Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references(&self, out: &mut Vec<Reference>) {
        match self {
            Expr::Lit(_) => {}
            Expr::Ref(s) => {
                if let Ok(r) = Reference::parse(s) {
                    out.push(r);
                }
            }
            Expr::GetAttr { of, .. } | Expr::Splat { of, .. } => of.collect_references(out),
            Expr::Index { of, key } => {
                of.collect_references(out);
                key.collect_references(out);
            }
            Expr::Call { args, .. } => {
                for a in args {
                    a.collect_references(out);
                }
            }
            Expr::Unary { operand, .. } => operand.collect_references(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_references(out);
                rhs.collect_references(out);
            }
            Expr::Cond { cond, then, otherwise } => {
                cond.collect_references(out);
                then.collect_references(out);
                otherwise.collect_references(out);
            }
            Expr::Tuple(items) | Expr::Template(items) => {
                for i in items {
                    i.collect_references(out);
                }
            }
            Expr::Object(entries) => {
                for e in entries.values() {
                    e.collect_references(out);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// One step of a reference's trailing path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathStep {
    Attr(String),
    Index(InstanceKey),
}

/// A parsed reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// `var.NAME`
    Var(String),
    /// `local.NAME`
    Local(String),
    /// `count.index`
    CountIndex,
    /// `each.key` / `each.value`
    EachKey,
    EachValue,
    /// `path.root` / `path.cwd` / `path.module`
    PathAttr(String),
    /// `workspace.name`
    Workspace,
    /// `module.CALL[KEY].OUTPUT` plus any trailing path.
    ModuleOutput {
        call: String,
        key: Option<InstanceKey>,
        output: String,
        path: Vec<PathStep>,
    },
    /// `TYPE.NAME[KEY].ATTR...` or `data.TYPE.NAME[KEY].ATTR...`; without
    /// a key the reference names every instance of the resource.
    Resource {
        resource: Resource,
        key: Option<InstanceKey>,
        path: Vec<PathStep>,
    },
}

impl Reference {
    pub fn parse(s: &str) -> Result<Self, RefError> {
        let segments = split_segments(s)?;
        let invalid = |why| RefError::Invalid(s.to_string(), why);

        let (first, rest) = segments
            .split_first()
            .ok_or_else(|| invalid("empty reference"))?;

        match first.name.as_str() {
            "var" => {
                let [seg] = rest else {
                    return Err(invalid("var references take exactly one name"));
                };
                Ok(Reference::Var(seg.name.clone()))
            }
            "local" => {
                let [seg] = rest else {
                    return Err(invalid("local references take exactly one name"));
                };
                Ok(Reference::Local(seg.name.clone()))
            }
            "count" => match rest {
                [seg] if seg.name == "index" => Ok(Reference::CountIndex),
                _ => Err(invalid("the only count attribute is count.index")),
            },
            "each" => match rest {
                [seg] if seg.name == "key" => Ok(Reference::EachKey),
                [seg] if seg.name == "value" => Ok(Reference::EachValue),
                _ => Err(invalid("each references are each.key or each.value")),
            },
            "path" => match rest {
                [seg] => Ok(Reference::PathAttr(seg.name.clone())),
                _ => Err(invalid("path references take exactly one attribute")),
            },
            "workspace" => match rest {
                [seg] if seg.name == "name" => Ok(Reference::Workspace),
                _ => Err(invalid("the only workspace attribute is workspace.name")),
            },
            "module" => {
                let [call, output, path @ ..] = rest else {
                    return Err(invalid("module references need a call and an output name"));
                };
                Ok(Reference::ModuleOutput {
                    call: call.name.clone(),
                    key: call.key.clone(),
                    output: output.name.clone(),
                    path: steps_from_segments(path),
                })
            }
            "data" => {
                let [r#type, name, path @ ..] = rest else {
                    return Err(invalid("data references need a type and a name"));
                };
                if r#type.key.is_some() {
                    return Err(invalid("resource type cannot carry an instance key"));
                }
                Ok(Reference::Resource {
                    resource: Resource {
                        mode: ResourceMode::Data,
                        r#type: r#type.name.clone(),
                        name: name.name.clone(),
                    },
                    key: name.key.clone(),
                    path: steps_from_segments(path),
                })
            }
            _ => {
                // A managed resource: TYPE.NAME[KEY].ATTR...
                if first.key.is_some() {
                    return Err(invalid("resource type cannot carry an instance key"));
                }
                let [name, path @ ..] = rest else {
                    return Err(invalid("resource references need a type and a name"));
                };
                Ok(Reference::Resource {
                    resource: Resource {
                        mode: ResourceMode::Managed,
                        r#type: first.name.clone(),
                        name: name.name.clone(),
                    },
                    key: name.key.clone(),
                    path: steps_from_segments(path),
                })
            }
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Var(n) => write!(f, "var.{n}"),
            Reference::Local(n) => write!(f, "local.{n}"),
            Reference::CountIndex => write!(f, "count.index"),
            Reference::EachKey => write!(f, "each.key"),
            Reference::EachValue => write!(f, "each.value"),
            Reference::PathAttr(n) => write!(f, "path.{n}"),
            Reference::Workspace => write!(f, "workspace.name"),
            Reference::ModuleOutput { call, key, output, .. } => {
                write!(f, "module.{call}")?;
                if let Some(k) = key {
                    write!(f, "{k}")?;
                }
                write!(f, ".{output}")
            }
            Reference::Resource { resource, key, .. } => {
                write!(f, "{resource}")?;
                if let Some(k) = key {
                    write!(f, "{k}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Segment {
    name: String,
    key: Option<InstanceKey>,
}

fn steps_from_segments(segments: &[Segment]) -> Vec<PathStep> {
    let mut out = Vec::new();
    for seg in segments {
        out.push(PathStep::Attr(seg.name.clone()));
        if let Some(k) = &seg.key {
            out.push(PathStep::Index(k.clone()));
        }
    }
    out
}

/// Split `a.b[0].c["k"]` into segments, honoring brackets.
fn split_segments(s: &str) -> Result<Vec<Segment>, RefError> {
    let invalid = |why| RefError::Invalid(s.to_string(), why);
    let mut out = Vec::new();
    for part in split_dots(s) {
        if part.is_empty() {
            return Err(invalid("empty reference component"));
        }
        match part.find('[') {
            None => out.push(Segment {
                name: part.to_string(),
                key: None,
            }),
            Some(open) => {
                let inner = part[open..]
                    .strip_prefix('[')
                    .and_then(|k| k.strip_suffix(']'))
                    .ok_or_else(|| invalid("unterminated index"))?;
                let key = if let Ok(n) = inner.parse::<i64>() {
                    InstanceKey::Int(n)
                } else {
                    InstanceKey::Str(inner.trim_matches('"').to_string())
                };
                if part[..open].is_empty() {
                    return Err(invalid("index without a name"));
                }
                out.push(Segment {
                    name: part[..open].to_string(),
                    key: Some(key),
                });
            }
        }
    }
    Ok(out)
}

fn split_dots(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, ch) in s.char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            '.' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var_and_local() {
        assert_eq!(Reference::parse("var.region"), Ok(Reference::Var("region".into())));
        assert_eq!(Reference::parse("local.suffix"), Ok(Reference::Local("suffix".into())));
        assert!(Reference::parse("var.a.b").is_err());
    }

    #[test]
    fn test_parse_resource_reference() {
        let r = Reference::parse("test_instance.web[0].id").unwrap();
        match r {
            Reference::Resource { resource, key, path } => {
                assert_eq!(resource, Resource::managed("test_instance", "web"));
                assert_eq!(key, Some(InstanceKey::Int(0)));
                assert_eq!(path, vec![PathStep::Attr("id".into())]);
            }
            other => panic!("unexpected {other:?}"),
        }

        let r = Reference::parse("data.test_source.lookup").unwrap();
        match r {
            Reference::Resource { resource, key, .. } => {
                assert_eq!(resource.mode, ResourceMode::Data);
                assert_eq!(key, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_module_output() {
        let r = Reference::parse("module.app[2].vpc_id").unwrap();
        assert_eq!(
            r,
            Reference::ModuleOutput {
                call: "app".into(),
                key: Some(InstanceKey::Int(2)),
                output: "vpc_id".into(),
                path: vec![],
            }
        );
    }

    #[test]
    fn test_parse_iteration_vars() {
        assert_eq!(Reference::parse("count.index"), Ok(Reference::CountIndex));
        assert_eq!(Reference::parse("each.key"), Ok(Reference::EachKey));
        assert_eq!(Reference::parse("each.value"), Ok(Reference::EachValue));
        assert!(Reference::parse("count.nope").is_err());
    }

    #[test]
    fn test_string_keys_in_references() {
        let r = Reference::parse(r#"test_instance.web["a.b"].id"#).unwrap();
        match r {
            Reference::Resource { key, .. } => {
                assert_eq!(key, Some(InstanceKey::Str("a.b".into())));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_expr_collects_nested_references() {
        let expr = Expr::Binary {
            op: BinaryOp::Add,
            lhs: Box::new(Expr::reference("var.base")),
            rhs: Box::new(Expr::Call {
                name: "length".into(),
                args: vec![Expr::reference("test_instance.web")],
            }),
        };
        let refs = expr.references();
        assert_eq!(refs.len(), 2);
        assert!(refs.contains(&Reference::Var("base".into())));
    }

    #[test]
    fn test_expr_serde_form() {
        let text = r#"{"binary": {"op": "add", "lhs": {"lit": 1}, "rhs": {"ref": "var.n"}}}"#;
        let expr: Expr = serde_json::from_str(text).unwrap();
        match &expr {
            Expr::Binary { op: BinaryOp::Add, .. } => {}
            other => panic!("unexpected {other:?}"),
        }
        let back = serde_json::to_string(&expr).unwrap();
        let reparsed: Expr = serde_json::from_str(&back).unwrap();
        assert_eq!(expr, reparsed);
    }
}
