//! Typed values.
//!
//! Every value the engine handles carries a type from a small algebra and is
//! either known, null, or unknown. Unknown values are typed placeholders for
//! attributes a provider will only decide during apply; every operation here
//! propagates unknown-ness rather than failing on it.
//!
//! Numbers are arbitrary-precision decimals. Identity is numeric, not
//! representational: `1.0` and `1` are the same number.

pub mod json;

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors from value operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValueError {
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("object has no attribute {0:?}")]
    AttributeNotFound(String),

    #[error("index {index} out of range for sequence of length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("attempt to use a null value")]
    NullDereference,

    #[error("cannot convert {from} to {to}")]
    Unconvertible { from: String, to: String },

    #[error("unknown value cannot be serialized")]
    UnknownNotSerializable,
}

pub type Result<T> = std::result::Result<T, ValueError>;

/// The type algebra.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ty {
    String,
    Number,
    Bool,
    /// Stands for "any type"; conformance always succeeds against it.
    Dynamic,
    List(Box<Ty>),
    Set(Box<Ty>),
    Map(Box<Ty>),
    Object(BTreeMap<String, Ty>),
    Tuple(Vec<Ty>),
}

impl Ty {
    pub fn is_dynamic(&self) -> bool {
        matches!(self, Ty::Dynamic)
    }

    pub fn is_primitive(&self) -> bool {
        matches!(self, Ty::String | Ty::Number | Ty::Bool)
    }

    /// The element type of a uniform collection, if this is one.
    pub fn element_ty(&self) -> Option<&Ty> {
        match self {
            Ty::List(t) | Ty::Set(t) | Ty::Map(t) => Some(t),
            _ => None,
        }
    }

    /// Structural subtype check: does a value of type `self` conform to
    /// `other`?
    pub fn conforms_to(&self, other: &Ty) -> bool {
        match (self, other) {
            (_, Ty::Dynamic) | (Ty::Dynamic, _) => true,
            (Ty::String, Ty::String) | (Ty::Number, Ty::Number) | (Ty::Bool, Ty::Bool) => true,
            (Ty::List(a), Ty::List(b)) | (Ty::Set(a), Ty::Set(b)) | (Ty::Map(a), Ty::Map(b)) => {
                a.conforms_to(b)
            }
            (Ty::Object(a), Ty::Object(b)) => {
                b.iter()
                    .all(|(k, bt)| a.get(k).is_some_and(|at| at.conforms_to(bt)))
                    && a.keys().all(|k| b.contains_key(k))
            }
            (Ty::Tuple(a), Ty::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(at, bt)| at.conforms_to(bt))
            }
            // A tuple may stand in for a list when each element conforms.
            (Ty::Tuple(a), Ty::List(b)) => a.iter().all(|at| at.conforms_to(b)),
            // An object may stand in for a map when each attribute conforms.
            (Ty::Object(a), Ty::Map(b)) => a.values().all(|at| at.conforms_to(b)),
            _ => false,
        }
    }

    /// The most specific type both inputs conform to.
    pub fn unify(a: &Ty, b: &Ty) -> Ty {
        if a == b {
            return a.clone();
        }
        match (a, b) {
            (Ty::Dynamic, other) | (other, Ty::Dynamic) => other.clone(),
            (Ty::List(x), Ty::List(y)) => Ty::List(Box::new(Ty::unify(x, y))),
            (Ty::Set(x), Ty::Set(y)) => Ty::Set(Box::new(Ty::unify(x, y))),
            (Ty::Map(x), Ty::Map(y)) => Ty::Map(Box::new(Ty::unify(x, y))),
            _ => Ty::Dynamic,
        }
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::String => write!(f, "string"),
            Ty::Number => write!(f, "number"),
            Ty::Bool => write!(f, "bool"),
            Ty::Dynamic => write!(f, "any"),
            Ty::List(t) => write!(f, "list({t})"),
            Ty::Set(t) => write!(f, "set({t})"),
            Ty::Map(t) => write!(f, "map({t})"),
            Ty::Object(attrs) => {
                write!(f, "object({{")?;
                for (i, (k, t)) in attrs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k} = {t}")?;
                }
                write!(f, "}})")
            }
            Ty::Tuple(tys) => {
                write!(f, "tuple([")?;
                for (i, t) in tys.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, "])")
            }
        }
    }
}

/// A typed value: known, null-of-type, or unknown-of-type.
///
/// Collections carry their element type explicitly so that empty collections
/// remain fully typed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Value {
    String(String),
    Number(BigDecimal),
    Bool(bool),
    List(Ty, Vec<Value>),
    /// Elements are kept sorted and deduplicated.
    Set(Ty, Vec<Value>),
    Map(Ty, BTreeMap<String, Value>),
    Object(BTreeMap<String, Value>),
    Tuple(Vec<Value>),
    Null(Ty),
    Unknown(Ty),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn number_int(n: i64) -> Self {
        Value::Number(BigDecimal::from(n))
    }

    pub fn bool(b: bool) -> Self {
        Value::Bool(b)
    }

    pub fn null(ty: Ty) -> Self {
        Value::Null(ty)
    }

    pub fn unknown(ty: Ty) -> Self {
        Value::Unknown(ty)
    }

    pub fn empty_object() -> Self {
        Value::Object(BTreeMap::new())
    }

    /// Build a set value: elements are sorted and deduplicated.
    pub fn set(elem_ty: Ty, mut elems: Vec<Value>) -> Self {
        elems.sort();
        elems.dedup();
        Value::Set(elem_ty, elems)
    }

    pub fn ty(&self) -> Ty {
        match self {
            Value::String(_) => Ty::String,
            Value::Number(_) => Ty::Number,
            Value::Bool(_) => Ty::Bool,
            Value::List(t, _) => Ty::List(Box::new(t.clone())),
            Value::Set(t, _) => Ty::Set(Box::new(t.clone())),
            Value::Map(t, _) => Ty::Map(Box::new(t.clone())),
            Value::Object(attrs) => {
                Ty::Object(attrs.iter().map(|(k, v)| (k.clone(), v.ty())).collect())
            }
            Value::Tuple(elems) => Ty::Tuple(elems.iter().map(Value::ty).collect()),
            Value::Null(t) | Value::Unknown(t) => t.clone(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Value::Unknown(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null(_))
    }

    pub fn is_known(&self) -> bool {
        !self.is_unknown()
    }

    /// Deep known-ness: no unknown anywhere in the structure.
    pub fn is_whole_known(&self) -> bool {
        match self {
            Value::Unknown(_) => false,
            Value::List(_, elems) | Value::Set(_, elems) | Value::Tuple(elems) => {
                elems.iter().all(Value::is_whole_known)
            }
            Value::Map(_, elems) => elems.values().all(Value::is_whole_known),
            Value::Object(attrs) => attrs.values().all(Value::is_whole_known),
            _ => true,
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::String(s) => Ok(s),
            Value::Null(_) => Err(ValueError::NullDereference),
            other => Err(type_mismatch(Ty::String, other)),
        }
    }

    pub fn as_number(&self) -> Result<&BigDecimal> {
        match self {
            Value::Number(n) => Ok(n),
            Value::Null(_) => Err(ValueError::NullDereference),
            other => Err(type_mismatch(Ty::Number, other)),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Null(_) => Err(ValueError::NullDereference),
            other => Err(type_mismatch(Ty::Bool, other)),
        }
    }

    /// Equality as an expression operator: unknown operands yield an
    /// unknown bool; comparing against null is allowed and yields a bool.
    pub fn equal(&self, other: &Value) -> Value {
        if self.is_unknown() || other.is_unknown() {
            return Value::Unknown(Ty::Bool);
        }
        Value::Bool(self.raw_equals(other))
    }

    /// Structural equality including unknown markers. Two unknowns of the
    /// same type compare equal here; use [`Value::equal`] for expression
    /// semantics.
    pub fn raw_equals(&self, other: &Value) -> bool {
        self == other
    }

    /// Select an attribute of an object (or an element of a map, which
    /// reads the same way in configuration).
    pub fn get_attr(&self, name: &str) -> Result<Value> {
        match self {
            Value::Object(attrs) => attrs
                .get(name)
                .cloned()
                .ok_or_else(|| ValueError::AttributeNotFound(name.to_string())),
            Value::Map(_, elems) => elems
                .get(name)
                .cloned()
                .ok_or_else(|| ValueError::AttributeNotFound(name.to_string())),
            Value::Null(_) => Err(ValueError::NullDereference),
            Value::Unknown(ty) => match ty {
                Ty::Object(attrs) => match attrs.get(name) {
                    Some(t) => Ok(Value::Unknown(t.clone())),
                    None => Err(ValueError::AttributeNotFound(name.to_string())),
                },
                Ty::Map(t) => Ok(Value::Unknown((**t).clone())),
                Ty::Dynamic => Ok(Value::Unknown(Ty::Dynamic)),
                other => Err(type_mismatch_ty(
                    Ty::Object(BTreeMap::new()),
                    other.clone(),
                )),
            },
            other => Err(type_mismatch_ty(Ty::Object(BTreeMap::new()), other.ty())),
        }
    }

    /// Index into a list, tuple, or map.
    pub fn index(&self, key: &Value) -> Result<Value> {
        if key.is_unknown() {
            return Ok(Value::Unknown(self.index_result_ty()));
        }
        match self {
            Value::List(_, elems) | Value::Tuple(elems) => {
                let idx = number_to_index(key)?;
                if idx < 0 || idx as usize >= elems.len() {
                    return Err(ValueError::IndexOutOfRange {
                        index: idx,
                        len: elems.len(),
                    });
                }
                Ok(elems[idx as usize].clone())
            }
            Value::Map(_, elems) => {
                let k = key.as_str()?;
                elems
                    .get(k)
                    .cloned()
                    .ok_or_else(|| ValueError::AttributeNotFound(k.to_string()))
            }
            Value::Object(attrs) => {
                let k = key.as_str()?;
                attrs
                    .get(k)
                    .cloned()
                    .ok_or_else(|| ValueError::AttributeNotFound(k.to_string()))
            }
            Value::Null(_) => Err(ValueError::NullDereference),
            Value::Unknown(_) => Ok(Value::Unknown(self.index_result_ty())),
            other => Err(ValueError::TypeMismatch {
                expected: "a collection".into(),
                actual: other.ty().to_string(),
            }),
        }
    }

    fn index_result_ty(&self) -> Ty {
        match self.ty() {
            Ty::List(t) | Ty::Set(t) | Ty::Map(t) => *t,
            _ => Ty::Dynamic,
        }
    }

    /// Number of elements in a collection value; unknown collections give
    /// an unknown number.
    pub fn collection_length(&self) -> Result<Value> {
        match self {
            Value::List(_, elems) | Value::Set(_, elems) | Value::Tuple(elems) => {
                Ok(Value::number_int(elems.len() as i64))
            }
            Value::Map(_, elems) => Ok(Value::number_int(elems.len() as i64)),
            Value::Object(attrs) => Ok(Value::number_int(attrs.len() as i64)),
            Value::Unknown(_) => Ok(Value::Unknown(Ty::Number)),
            Value::Null(_) => Err(ValueError::NullDereference),
            other => Err(ValueError::TypeMismatch {
                expected: "a collection".into(),
                actual: other.ty().to_string(),
            }),
        }
    }

    /// Iterate a collection as `(key, element)` pairs: indices for
    /// sequences, keys for maps and objects. Used by `for_each` expansion
    /// and splat projection.
    pub fn iter_pairs(&self) -> Result<Vec<(Value, Value)>> {
        match self {
            Value::List(_, elems) | Value::Set(_, elems) | Value::Tuple(elems) => Ok(elems
                .iter()
                .enumerate()
                .map(|(i, v)| (Value::number_int(i as i64), v.clone()))
                .collect()),
            Value::Map(_, elems) => Ok(elems
                .iter()
                .map(|(k, v)| (Value::string(k.clone()), v.clone()))
                .collect()),
            Value::Object(attrs) => Ok(attrs
                .iter()
                .map(|(k, v)| (Value::string(k.clone()), v.clone()))
                .collect()),
            Value::Null(_) => Err(ValueError::NullDereference),
            other => Err(ValueError::TypeMismatch {
                expected: "a collection".into(),
                actual: other.ty().to_string(),
            }),
        }
    }

    /// Splat projection: `base.*.attr`.
    ///
    /// Sequences map the attribute over their elements; a single non-null
    /// object becomes a one-element tuple; null becomes an empty tuple;
    /// unknown stays unknown.
    pub fn splat_attr(&self, name: &str) -> Result<Value> {
        match self {
            Value::List(_, elems) | Value::Set(_, elems) | Value::Tuple(elems) => {
                let projected: Result<Vec<Value>> =
                    elems.iter().map(|e| e.get_attr(name)).collect();
                Ok(Value::Tuple(projected?))
            }
            Value::Null(_) => Ok(Value::Tuple(Vec::new())),
            Value::Unknown(_) => Ok(Value::Unknown(Ty::Dynamic)),
            Value::Object(_) => Ok(Value::Tuple(vec![self.get_attr(name)?])),
            other => Err(ValueError::TypeMismatch {
                expected: "a sequence or object".into(),
                actual: other.ty().to_string(),
            }),
        }
    }

    /// Whether this value conforms to the given type.
    pub fn conforms_to(&self, ty: &Ty) -> bool {
        self.ty().conforms_to(ty)
    }

    /// Convert a value to the given type, applying the standard conversion
    /// rules (string↔number, string↔bool, tuple→list, object→map, and
    /// elementwise collection conversions). Null and unknown convert to
    /// null and unknown of the target type.
    pub fn convert(&self, ty: &Ty) -> Result<Value> {
        if ty.is_dynamic() {
            return Ok(self.clone());
        }
        match self {
            Value::Null(_) => return Ok(Value::Null(ty.clone())),
            Value::Unknown(_) => return Ok(Value::Unknown(ty.clone())),
            _ => {}
        }
        let unconvertible = || ValueError::Unconvertible {
            from: self.ty().to_string(),
            to: ty.to_string(),
        };
        match ty {
            Ty::Dynamic => unreachable!("handled above"),
            Ty::String => match self {
                Value::String(_) => Ok(self.clone()),
                Value::Number(n) => Ok(Value::String(n.normalized().to_string())),
                Value::Bool(b) => Ok(Value::String(if *b { "true" } else { "false" }.into())),
                _ => Err(unconvertible()),
            },
            Ty::Number => match self {
                Value::Number(_) => Ok(self.clone()),
                Value::String(s) => s
                    .parse::<BigDecimal>()
                    .map(Value::Number)
                    .map_err(|_| unconvertible()),
                _ => Err(unconvertible()),
            },
            Ty::Bool => match self {
                Value::Bool(_) => Ok(self.clone()),
                Value::String(s) => match s.as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    _ => Err(unconvertible()),
                },
                _ => Err(unconvertible()),
            },
            Ty::List(elem) => match self {
                Value::List(_, elems) | Value::Set(_, elems) | Value::Tuple(elems) => {
                    let converted: Result<Vec<Value>> =
                        elems.iter().map(|e| e.convert(elem)).collect();
                    Ok(Value::List((**elem).clone(), converted?))
                }
                _ => Err(unconvertible()),
            },
            Ty::Set(elem) => match self {
                Value::List(_, elems) | Value::Set(_, elems) | Value::Tuple(elems) => {
                    let converted: Result<Vec<Value>> =
                        elems.iter().map(|e| e.convert(elem)).collect();
                    Ok(Value::set((**elem).clone(), converted?))
                }
                _ => Err(unconvertible()),
            },
            Ty::Map(elem) => match self {
                Value::Map(_, elems) => {
                    let converted: Result<BTreeMap<String, Value>> = elems
                        .iter()
                        .map(|(k, v)| Ok((k.clone(), v.convert(elem)?)))
                        .collect();
                    Ok(Value::Map((**elem).clone(), converted?))
                }
                Value::Object(attrs) => {
                    let converted: Result<BTreeMap<String, Value>> = attrs
                        .iter()
                        .map(|(k, v)| Ok((k.clone(), v.convert(elem)?)))
                        .collect();
                    Ok(Value::Map((**elem).clone(), converted?))
                }
                _ => Err(unconvertible()),
            },
            Ty::Object(want) => match self {
                Value::Object(attrs) => {
                    let mut out = BTreeMap::new();
                    for (k, want_ty) in want {
                        match attrs.get(k) {
                            Some(v) => {
                                out.insert(k.clone(), v.convert(want_ty)?);
                            }
                            None => return Err(ValueError::AttributeNotFound(k.clone())),
                        }
                    }
                    Ok(Value::Object(out))
                }
                Value::Map(_, elems) => {
                    let mut out = BTreeMap::new();
                    for (k, want_ty) in want {
                        match elems.get(k) {
                            Some(v) => {
                                out.insert(k.clone(), v.convert(want_ty)?);
                            }
                            None => return Err(ValueError::AttributeNotFound(k.clone())),
                        }
                    }
                    Ok(Value::Object(out))
                }
                _ => Err(unconvertible()),
            },
            Ty::Tuple(want) => match self {
                Value::Tuple(elems) | Value::List(_, elems) => {
                    if elems.len() != want.len() {
                        return Err(unconvertible());
                    }
                    let converted: Result<Vec<Value>> = elems
                        .iter()
                        .zip(want)
                        .map(|(e, t)| e.convert(t))
                        .collect();
                    Ok(Value::Tuple(converted?))
                }
                _ => Err(unconvertible()),
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{s:?}"),
            Value::Number(n) => write!(f, "{}", n.normalized()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::List(_, elems) | Value::Set(_, elems) | Value::Tuple(elems) => {
                write!(f, "[")?;
                for (i, e) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, "]")
            }
            Value::Map(_, elems) => fmt_entries(f, elems.iter()),
            Value::Object(attrs) => fmt_entries(f, attrs.iter()),
            Value::Null(_) => write!(f, "null"),
            Value::Unknown(_) => write!(f, "(known after apply)"),
        }
    }
}

fn fmt_entries<'a>(
    f: &mut fmt::Formatter<'_>,
    entries: impl Iterator<Item = (&'a String, &'a Value)>,
) -> fmt::Result {
    write!(f, "{{")?;
    for (i, (k, v)) in entries.enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{k} = {v}")?;
    }
    write!(f, "}}")
}

fn type_mismatch(expected: Ty, actual: &Value) -> ValueError {
    ValueError::TypeMismatch {
        expected: expected.to_string(),
        actual: actual.ty().to_string(),
    }
}

fn type_mismatch_ty(expected: Ty, actual: Ty) -> ValueError {
    ValueError::TypeMismatch {
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

fn number_to_index(v: &Value) -> Result<i64> {
    use bigdecimal::ToPrimitive;
    match v {
        Value::Number(n) => n.to_i64().ok_or(ValueError::TypeMismatch {
            expected: "an integer index".into(),
            actual: n.to_string(),
        }),
        Value::Null(_) => Err(ValueError::NullDereference),
        other => Err(type_mismatch(Ty::Number, other)),
    }
}
