//! JSON encodings for values.
//!
//! Two forms exist:
//!
//! - The *plain* form is schema-directed: a fully-known value maps to the
//!   obvious JSON document and is decoded back with a type in hand. State
//!   attributes use this form.
//! - The *tagged* form is self-describing and total: it carries the type
//!   alongside the payload and encodes unknown markers explicitly, so plan
//!   files can round-trip values that are not yet known.

use super::{Result, Ty, Value, ValueError};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Marker key for unknown values inside a tagged payload.
const UNKNOWN_KEY: &str = "$unknown";

/// Encode a fully-known value as plain JSON. Unknown anywhere in the
/// structure is an error.
pub fn to_plain(value: &Value) -> Result<serde_json::Value> {
    match value {
        Value::String(s) => Ok(json!(s)),
        Value::Number(n) => Ok(serde_json::Value::Number(number_to_json(n)?)),
        Value::Bool(b) => Ok(json!(b)),
        Value::List(_, elems) | Value::Set(_, elems) | Value::Tuple(elems) => Ok(
            serde_json::Value::Array(elems.iter().map(to_plain).collect::<Result<_>>()?),
        ),
        Value::Map(_, elems) => Ok(serde_json::Value::Object(
            elems
                .iter()
                .map(|(k, v)| Ok((k.clone(), to_plain(v)?)))
                .collect::<Result<_>>()?,
        )),
        Value::Object(attrs) => Ok(serde_json::Value::Object(
            attrs
                .iter()
                .map(|(k, v)| Ok((k.clone(), to_plain(v)?)))
                .collect::<Result<_>>()?,
        )),
        Value::Null(_) => Ok(serde_json::Value::Null),
        Value::Unknown(_) => Err(ValueError::UnknownNotSerializable),
    }
}

/// Decode plain JSON against an expected type. With [`Ty::Dynamic`] the
/// type is inferred: arrays become tuples and JSON objects become object
/// values.
pub fn from_plain(json: &serde_json::Value, ty: &Ty) -> Result<Value> {
    match (json, ty) {
        (serde_json::Value::Null, _) => Ok(Value::Null(ty.clone())),

        (j, Ty::Dynamic) => infer(j),

        (serde_json::Value::String(s), Ty::String) => Ok(Value::String(s.clone())),
        (serde_json::Value::Bool(b), Ty::Bool) => Ok(Value::Bool(*b)),
        (serde_json::Value::Number(n), Ty::Number) => number_from_json(n),

        // Standard conversions apply on decode so that e.g. a provider
        // returning "3" for a number attribute still conforms.
        (serde_json::Value::String(_) | serde_json::Value::Number(_) | serde_json::Value::Bool(_), _)
            if ty.is_primitive() =>
        {
            infer(json)?.convert(ty)
        }

        (serde_json::Value::Array(items), Ty::List(elem)) => Ok(Value::List(
            (**elem).clone(),
            items.iter().map(|j| from_plain(j, elem)).collect::<Result<_>>()?,
        )),
        (serde_json::Value::Array(items), Ty::Set(elem)) => Ok(Value::set(
            (**elem).clone(),
            items.iter().map(|j| from_plain(j, elem)).collect::<Result<_>>()?,
        )),
        (serde_json::Value::Array(items), Ty::Tuple(tys)) => {
            if items.len() != tys.len() {
                return Err(ValueError::TypeMismatch {
                    expected: ty.to_string(),
                    actual: format!("tuple of length {}", items.len()),
                });
            }
            Ok(Value::Tuple(
                items
                    .iter()
                    .zip(tys)
                    .map(|(j, t)| from_plain(j, t))
                    .collect::<Result<_>>()?,
            ))
        }
        (serde_json::Value::Object(entries), Ty::Map(elem)) => Ok(Value::Map(
            (**elem).clone(),
            entries
                .iter()
                .map(|(k, j)| Ok((k.clone(), from_plain(j, elem)?)))
                .collect::<Result<_>>()?,
        )),
        (serde_json::Value::Object(entries), Ty::Object(attr_tys)) => {
            let mut out = BTreeMap::new();
            for (k, want) in attr_tys {
                match entries.get(k) {
                    Some(j) => {
                        out.insert(k.clone(), from_plain(j, want)?);
                    }
                    None => {
                        out.insert(k.clone(), Value::Null(want.clone()));
                    }
                }
            }
            Ok(Value::Object(out))
        }

        (other, _) => Err(ValueError::TypeMismatch {
            expected: ty.to_string(),
            actual: json_kind(other).to_string(),
        }),
    }
}

/// Infer a value from self-describing JSON.
fn infer(json: &serde_json::Value) -> Result<Value> {
    match json {
        serde_json::Value::Null => Ok(Value::Null(Ty::Dynamic)),
        serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_json::Value::Number(n) => number_from_json(n),
        serde_json::Value::String(s) => Ok(Value::String(s.clone())),
        serde_json::Value::Array(items) => Ok(Value::Tuple(
            items.iter().map(infer).collect::<Result<_>>()?,
        )),
        serde_json::Value::Object(entries) => Ok(Value::Object(
            entries
                .iter()
                .map(|(k, j)| Ok((k.clone(), infer(j)?)))
                .collect::<Result<_>>()?,
        )),
    }
}

/// Self-describing serialized form of a value, used in plan files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggedValue {
    #[serde(rename = "type")]
    pub ty: Ty,
    pub value: serde_json::Value,
}

/// Encode any value, including unknowns, as a tagged document.
pub fn to_tagged(value: &Value) -> TaggedValue {
    TaggedValue {
        ty: value.ty(),
        value: tagged_payload(value),
    }
}

fn tagged_payload(value: &Value) -> serde_json::Value {
    match value {
        Value::Unknown(ty) => json!({ UNKNOWN_KEY: ty }),
        Value::Null(_) => serde_json::Value::Null,
        Value::String(s) => json!(s),
        Value::Number(n) => json!(n.normalized().to_string()),
        Value::Bool(b) => json!(b),
        Value::List(_, elems) | Value::Set(_, elems) | Value::Tuple(elems) => {
            serde_json::Value::Array(elems.iter().map(tagged_payload).collect())
        }
        Value::Map(_, elems) => serde_json::Value::Object(
            elems
                .iter()
                .map(|(k, v)| (k.clone(), tagged_payload(v)))
                .collect(),
        ),
        Value::Object(attrs) => serde_json::Value::Object(
            attrs
                .iter()
                .map(|(k, v)| (k.clone(), tagged_payload(v)))
                .collect(),
        ),
    }
}

/// Decode a tagged document back into a value.
pub fn from_tagged(tagged: &TaggedValue) -> Result<Value> {
    tagged_value(&tagged.value, &tagged.ty)
}

fn tagged_value(json: &serde_json::Value, ty: &Ty) -> Result<Value> {
    if let serde_json::Value::Object(entries) = json
        && let Some(ty_json) = entries.get(UNKNOWN_KEY)
    {
        let ty: Ty = serde_json::from_value(ty_json.clone()).map_err(|_| {
            ValueError::TypeMismatch {
                expected: "a type tag".into(),
                actual: ty_json.to_string(),
            }
        })?;
        return Ok(Value::Unknown(ty));
    }

    match (json, ty) {
        (serde_json::Value::Null, _) => Ok(Value::Null(ty.clone())),
        // Numbers travel as strings in the tagged form to keep precision.
        (serde_json::Value::String(s), Ty::Number) => BigDecimal::from_str(s)
            .map(Value::Number)
            .map_err(|_| ValueError::TypeMismatch {
                expected: "a decimal string".into(),
                actual: s.clone(),
            }),
        (serde_json::Value::Array(items), Ty::Tuple(tys)) if items.len() == tys.len() => {
            Ok(Value::Tuple(
                items
                    .iter()
                    .zip(tys)
                    .map(|(j, t)| tagged_value(j, t))
                    .collect::<Result<_>>()?,
            ))
        }
        (serde_json::Value::Array(items), Ty::List(elem)) => Ok(Value::List(
            (**elem).clone(),
            items
                .iter()
                .map(|j| tagged_value(j, elem))
                .collect::<Result<_>>()?,
        )),
        (serde_json::Value::Array(items), Ty::Set(elem)) => Ok(Value::set(
            (**elem).clone(),
            items
                .iter()
                .map(|j| tagged_value(j, elem))
                .collect::<Result<_>>()?,
        )),
        (serde_json::Value::Object(entries), Ty::Object(attr_tys)) => {
            let mut out = BTreeMap::new();
            for (k, want) in attr_tys {
                match entries.get(k) {
                    Some(j) => {
                        out.insert(k.clone(), tagged_value(j, want)?);
                    }
                    None => {
                        out.insert(k.clone(), Value::Null(want.clone()));
                    }
                }
            }
            Ok(Value::Object(out))
        }
        (serde_json::Value::Object(entries), Ty::Map(elem)) => Ok(Value::Map(
            (**elem).clone(),
            entries
                .iter()
                .map(|(k, j)| Ok((k.clone(), tagged_value(j, elem)?)))
                .collect::<Result<_>>()?,
        )),
        _ => from_plain(json, ty),
    }
}

fn number_to_json(n: &BigDecimal) -> Result<serde_json::Number> {
    use bigdecimal::ToPrimitive;
    let n = n.normalized();
    if n.is_integer() {
        if let Some(i) = n.to_i64() {
            return Ok(serde_json::Number::from(i));
        }
        if let Some(u) = n.to_u64() {
            return Ok(serde_json::Number::from(u));
        }
    }
    n.to_f64()
        .and_then(serde_json::Number::from_f64)
        .ok_or(ValueError::TypeMismatch {
            expected: "a JSON-representable number".into(),
            actual: n.to_string(),
        })
}

fn number_from_json(n: &serde_json::Number) -> Result<Value> {
    // Go through the string form so integers keep exact precision.
    BigDecimal::from_str(&n.to_string())
        .map(Value::Number)
        .map_err(|_| ValueError::TypeMismatch {
            expected: "a number".into(),
            actual: n.to_string(),
        })
}

fn json_kind(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_round_trip_with_schema_type() {
        let ty = Ty::Object(BTreeMap::from([
            ("id".to_string(), Ty::String),
            ("count".to_string(), Ty::Number),
            ("tags".to_string(), Ty::Map(Box::new(Ty::String))),
        ]));
        let value = from_plain(
            &json!({"id": "i-123", "count": 2, "tags": {"env": "prod"}}),
            &ty,
        )
        .unwrap();
        assert_eq!(value.get_attr("id").unwrap(), Value::string("i-123"));

        let back = to_plain(&value).unwrap();
        assert_eq!(back["count"], json!(2));
        assert_eq!(back["tags"]["env"], json!("prod"));
    }

    #[test]
    fn test_plain_missing_object_attr_decodes_null() {
        let ty = Ty::Object(BTreeMap::from([("id".to_string(), Ty::String)]));
        let value = from_plain(&json!({}), &ty).unwrap();
        assert_eq!(value.get_attr("id").unwrap(), Value::Null(Ty::String));
    }

    #[test]
    fn test_plain_rejects_unknown() {
        assert_eq!(
            to_plain(&Value::Unknown(Ty::String)),
            Err(ValueError::UnknownNotSerializable)
        );
    }

    #[test]
    fn test_tagged_round_trips_unknowns() {
        let value = Value::Object(BTreeMap::from([
            ("id".to_string(), Value::Unknown(Ty::String)),
            ("ami".to_string(), Value::string("ami-1")),
            ("big".to_string(), Value::Number("123456789012345678901234567890".parse().unwrap())),
        ]));
        let tagged = to_tagged(&value);
        let text = serde_json::to_string(&tagged).unwrap();
        let parsed: TaggedValue = serde_json::from_str(&text).unwrap();
        let back = from_tagged(&parsed).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_tagged_round_trips_null_inside_collections() {
        let value = Value::List(
            Ty::String,
            vec![Value::string("a"), Value::Null(Ty::String)],
        );
        let back = from_tagged(&to_tagged(&value)).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_dynamic_inference() {
        let v = from_plain(&json!([1, "two"]), &Ty::Dynamic).unwrap();
        assert_eq!(
            v.ty(),
            Ty::Tuple(vec![Ty::Number, Ty::String])
        );
    }
}
