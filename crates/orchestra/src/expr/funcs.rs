//! The built-in function set.
//!
//! Functions are total on their typed domains and report out-of-domain
//! inputs as errors. Any unknown argument makes the result unknown of the
//! function's result type. The impure functions (`timestamp`, `uuid`)
//! return unknown during plan so their values are decided once, at apply.

use super::eval::Scope;
use crate::value::{Ty, Value};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bigdecimal::{BigDecimal, Signed, ToPrimitive};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use sha2::{Digest, Sha256, Sha512};
use std::collections::BTreeMap;
use unicode_normalization::UnicodeNormalization;
use unicode_segmentation::UnicodeSegmentation;

type FnResult = Result<Value, String>;

/// Dispatch a function call by name.
pub fn call(scope: &Scope<'_>, name: &str, args: &[Value]) -> FnResult {
    match name {
        // Numeric.
        "abs" => numeric_1(args, |n| n.abs()),
        "ceil" => int_round(args, bigdecimal::RoundingMode::Ceiling),
        "floor" => int_round(args, bigdecimal::RoundingMode::Floor),
        "signum" => numeric_1(args, |n| BigDecimal::from(n.signum().to_i64().unwrap_or(0))),
        "min" => fold_numbers(args, |a, b| if b < a { b } else { a }),
        "max" => fold_numbers(args, |a, b| if b > a { b } else { a }),

        // Collection.
        "length" => length(args),
        "concat" => concat(args),
        "contains" => contains(args),
        "distinct" => distinct(args),
        "element" => element(args),
        "flatten" => flatten(args),
        "join" => join(args),
        "keys" => keys(args),
        "values" => values(args),
        "lookup" => lookup(args),
        "merge" => merge(args),
        "sort" => sort(args),
        "coalesce" => coalesce(args),
        "compact" => compact(args),

        // String.
        "lower" => string_1(args, |s| s.to_lowercase()),
        "upper" => string_1(args, |s| s.to_uppercase()),
        "trimspace" => string_1(args, |s| s.trim().to_string()),
        "replace" => replace(args),
        "split" => split(args),
        "substr" => substr(args),
        "format" => format_fn(args),

        // Hashing and encoding.
        "sha256" => hash_hex::<Sha256>(args),
        "sha512" => hash_hex::<Sha512>(args),
        "base64sha256" => hash_base64::<Sha256>(args),
        "base64encode" => string_1(args, |s| BASE64.encode(s.as_bytes())),
        "base64decode" => base64decode(args),
        "jsonencode" => jsonencode(args),
        "jsondecode" => jsondecode(args),

        // Filesystem paths.
        "basename" => string_1(args, |s| {
            std::path::Path::new(&s)
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or(s)
        }),
        "dirname" => string_1(args, |s| {
            std::path::Path::new(&s)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or(s)
        }),
        "pathexpand" => pathexpand(args),
        "file" => file_fn(scope, args),

        // Time and identity; impure, so unknown during plan.
        "timestamp" => impure(scope, args, 0, |_| {
            Ok(Value::string(
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            ))
        }),
        "timeadd" => timeadd(args),
        "uuid" => impure(scope, args, 0, |_| {
            Ok(Value::string(uuid::Uuid::new_v4().to_string()))
        }),

        other => Err(format!("there is no function named {other:?}")),
    }
}

fn arity(args: &[Value], want: usize) -> Result<(), String> {
    if args.len() != want {
        return Err(format!("expected {want} argument(s), got {}", args.len()));
    }
    Ok(())
}

fn any_unknown(args: &[Value]) -> bool {
    args.iter().any(|a| !a.is_whole_known())
}

fn impure(
    scope: &Scope<'_>,
    args: &[Value],
    want: usize,
    f: impl Fn(&[Value]) -> FnResult,
) -> FnResult {
    arity(args, want)?;
    if scope.pure_only {
        return Ok(Value::Unknown(Ty::String));
    }
    f(args)
}

fn numeric_1(args: &[Value], f: impl Fn(&BigDecimal) -> BigDecimal) -> FnResult {
    arity(args, 1)?;
    if any_unknown(args) {
        return Ok(Value::Unknown(Ty::Number));
    }
    let n = args[0].as_number().map_err(|e| e.to_string())?;
    Ok(Value::Number(f(n)))
}

fn int_round(args: &[Value], mode: bigdecimal::RoundingMode) -> FnResult {
    numeric_1(args, |n| n.with_scale_round(0, mode))
}

fn fold_numbers(args: &[Value], pick: impl Fn(BigDecimal, BigDecimal) -> BigDecimal) -> FnResult {
    if args.is_empty() {
        return Err("expected at least one argument".to_string());
    }
    if any_unknown(args) {
        return Ok(Value::Unknown(Ty::Number));
    }
    let mut acc: Option<BigDecimal> = None;
    for a in args {
        let n = a.as_number().map_err(|e| e.to_string())?.clone();
        acc = Some(match acc {
            None => n,
            Some(prev) => pick(prev, n),
        });
    }
    Ok(Value::Number(acc.expect("at least one argument")))
}

fn string_1(args: &[Value], f: impl Fn(String) -> String) -> FnResult {
    arity(args, 1)?;
    if any_unknown(args) {
        return Ok(Value::Unknown(Ty::String));
    }
    let s = args[0].as_str().map_err(|e| e.to_string())?;
    Ok(Value::string(f(s.to_string())))
}

/// `length` of a string counts grapheme clusters after NFC normalization,
/// so a precomposed ligature such as `ﬁ` counts once.
fn length(args: &[Value]) -> FnResult {
    arity(args, 1)?;
    match &args[0] {
        Value::Unknown(_) => Ok(Value::Unknown(Ty::Number)),
        Value::String(s) => {
            let normalized: String = s.nfc().collect();
            Ok(Value::number_int(normalized.graphemes(true).count() as i64))
        }
        other => other.collection_length().map_err(|e| e.to_string()),
    }
}

fn concat(args: &[Value]) -> FnResult {
    if any_unknown(args) {
        return Ok(Value::Unknown(Ty::Dynamic));
    }
    let mut out = Vec::new();
    for a in args {
        for (_, v) in a.iter_pairs().map_err(|e| e.to_string())? {
            out.push(v);
        }
    }
    Ok(Value::Tuple(out))
}

fn contains(args: &[Value]) -> FnResult {
    arity(args, 2)?;
    if any_unknown(args) {
        return Ok(Value::Unknown(Ty::Bool));
    }
    let found = args[0]
        .iter_pairs()
        .map_err(|e| e.to_string())?
        .into_iter()
        .any(|(_, v)| v.raw_equals(&args[1]));
    Ok(Value::Bool(found))
}

fn distinct(args: &[Value]) -> FnResult {
    arity(args, 1)?;
    if any_unknown(args) {
        return Ok(Value::Unknown(Ty::Dynamic));
    }
    let mut out: Vec<Value> = Vec::new();
    for (_, v) in args[0].iter_pairs().map_err(|e| e.to_string())? {
        if !out.iter().any(|seen| seen.raw_equals(&v)) {
            out.push(v);
        }
    }
    Ok(Value::Tuple(out))
}

/// `element(list, index)` wraps the index modulo the list length.
fn element(args: &[Value]) -> FnResult {
    arity(args, 2)?;
    if any_unknown(args) {
        return Ok(Value::Unknown(Ty::Dynamic));
    }
    let pairs = args[0].iter_pairs().map_err(|e| e.to_string())?;
    if pairs.is_empty() {
        return Err("cannot take an element from an empty list".to_string());
    }
    let idx = args[1]
        .as_number()
        .map_err(|e| e.to_string())?
        .to_i64()
        .ok_or("index must be an integer")?;
    let wrapped = idx.rem_euclid(pairs.len() as i64) as usize;
    Ok(pairs[wrapped].1.clone())
}

fn flatten(args: &[Value]) -> FnResult {
    arity(args, 1)?;
    if any_unknown(args) {
        return Ok(Value::Unknown(Ty::Dynamic));
    }
    fn walk(v: &Value, out: &mut Vec<Value>) -> Result<(), String> {
        match v {
            Value::List(_, elems) | Value::Set(_, elems) | Value::Tuple(elems) => {
                for e in elems {
                    walk(e, out)?;
                }
                Ok(())
            }
            other => {
                out.push(other.clone());
                Ok(())
            }
        }
    }
    let mut out = Vec::new();
    match &args[0] {
        v @ (Value::List(..) | Value::Set(..) | Value::Tuple(..)) => walk(v, &mut out)?,
        other => return Err(format!("expected a sequence, got {}", other.ty())),
    }
    Ok(Value::Tuple(out))
}

fn join(args: &[Value]) -> FnResult {
    arity(args, 2)?;
    if any_unknown(args) {
        return Ok(Value::Unknown(Ty::String));
    }
    let sep = args[0].as_str().map_err(|e| e.to_string())?;
    let mut parts = Vec::new();
    for (_, v) in args[1].iter_pairs().map_err(|e| e.to_string())? {
        parts.push(v.as_str().map_err(|e| e.to_string())?.to_string());
    }
    Ok(Value::string(parts.join(sep)))
}

fn keys(args: &[Value]) -> FnResult {
    arity(args, 1)?;
    if any_unknown(args) {
        return Ok(Value::Unknown(Ty::List(Box::new(Ty::String))));
    }
    let ks: Vec<Value> = args[0]
        .iter_pairs()
        .map_err(|e| e.to_string())?
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    Ok(Value::List(Ty::String, ks))
}

fn values(args: &[Value]) -> FnResult {
    arity(args, 1)?;
    if any_unknown(args) {
        return Ok(Value::Unknown(Ty::Dynamic));
    }
    let vs: Vec<Value> = args[0]
        .iter_pairs()
        .map_err(|e| e.to_string())?
        .into_iter()
        .map(|(_, v)| v)
        .collect();
    Ok(Value::Tuple(vs))
}

fn lookup(args: &[Value]) -> FnResult {
    if args.len() != 2 && args.len() != 3 {
        return Err(format!("expected 2 or 3 arguments, got {}", args.len()));
    }
    if any_unknown(&args[..2]) {
        return Ok(Value::Unknown(Ty::Dynamic));
    }
    let key = args[1].as_str().map_err(|e| e.to_string())?;
    match args[0].get_attr(key) {
        Ok(v) => Ok(v),
        Err(_) => match args.get(2) {
            Some(default) => Ok(default.clone()),
            None => Err(format!("no element with key {key:?}")),
        },
    }
}

fn merge(args: &[Value]) -> FnResult {
    if args.is_empty() {
        return Err("expected at least one argument".to_string());
    }
    if any_unknown(args) {
        return Ok(Value::Unknown(Ty::Dynamic));
    }
    let mut out: BTreeMap<String, Value> = BTreeMap::new();
    for a in args {
        for (k, v) in a.iter_pairs().map_err(|e| e.to_string())? {
            let key = k.as_str().map_err(|e| e.to_string())?.to_string();
            out.insert(key, v);
        }
    }
    Ok(Value::Object(out))
}

fn sort(args: &[Value]) -> FnResult {
    arity(args, 1)?;
    if any_unknown(args) {
        return Ok(Value::Unknown(Ty::List(Box::new(Ty::String))));
    }
    let mut out = Vec::new();
    for (_, v) in args[0].iter_pairs().map_err(|e| e.to_string())? {
        out.push(v.as_str().map_err(|e| e.to_string())?.to_string());
    }
    out.sort();
    Ok(Value::List(
        Ty::String,
        out.into_iter().map(Value::string).collect(),
    ))
}

fn coalesce(args: &[Value]) -> FnResult {
    if args.is_empty() {
        return Err("expected at least one argument".to_string());
    }
    for a in args {
        if a.is_unknown() {
            return Ok(Value::Unknown(Ty::Dynamic));
        }
        if !a.is_null() {
            return Ok(a.clone());
        }
    }
    Err("all arguments are null".to_string())
}

fn compact(args: &[Value]) -> FnResult {
    arity(args, 1)?;
    if any_unknown(args) {
        return Ok(Value::Unknown(Ty::List(Box::new(Ty::String))));
    }
    let mut out = Vec::new();
    for (_, v) in args[0].iter_pairs().map_err(|e| e.to_string())? {
        if v.is_null() {
            continue;
        }
        let s = v.as_str().map_err(|e| e.to_string())?;
        if !s.is_empty() {
            out.push(Value::string(s));
        }
    }
    Ok(Value::List(Ty::String, out))
}

fn replace(args: &[Value]) -> FnResult {
    arity(args, 3)?;
    if any_unknown(args) {
        return Ok(Value::Unknown(Ty::String));
    }
    let s = args[0].as_str().map_err(|e| e.to_string())?;
    let from = args[1].as_str().map_err(|e| e.to_string())?;
    let to = args[2].as_str().map_err(|e| e.to_string())?;
    Ok(Value::string(s.replace(from, to)))
}

fn split(args: &[Value]) -> FnResult {
    arity(args, 2)?;
    if any_unknown(args) {
        return Ok(Value::Unknown(Ty::List(Box::new(Ty::String))));
    }
    let sep = args[0].as_str().map_err(|e| e.to_string())?;
    let s = args[1].as_str().map_err(|e| e.to_string())?;
    let parts: Vec<Value> = if s.is_empty() {
        Vec::new()
    } else {
        s.split(sep).map(Value::string).collect()
    };
    Ok(Value::List(Ty::String, parts))
}

/// `substr(string, offset, length)`: negative offset counts from the end,
/// length -1 takes the rest of the string. Offsets are in characters.
fn substr(args: &[Value]) -> FnResult {
    arity(args, 3)?;
    if any_unknown(args) {
        return Ok(Value::Unknown(Ty::String));
    }
    let s = args[0].as_str().map_err(|e| e.to_string())?;
    let chars: Vec<char> = s.chars().collect();
    let offset = args[1]
        .as_number()
        .map_err(|e| e.to_string())?
        .to_i64()
        .ok_or("offset must be an integer")?;
    let len = args[2]
        .as_number()
        .map_err(|e| e.to_string())?
        .to_i64()
        .ok_or("length must be an integer")?;

    let start = if offset < 0 {
        chars.len().saturating_sub(offset.unsigned_abs() as usize)
    } else {
        (offset as usize).min(chars.len())
    };
    let end = if len < 0 {
        chars.len()
    } else {
        (start + len as usize).min(chars.len())
    };
    Ok(Value::string(chars[start..end].iter().collect::<String>()))
}

/// Minimal printf-style formatting: `%s`, `%d`, `%q`, and `%%`.
fn format_fn(args: &[Value]) -> FnResult {
    if args.is_empty() {
        return Err("expected a format string".to_string());
    }
    if any_unknown(args) {
        return Ok(Value::Unknown(Ty::String));
    }
    let spec = args[0].as_str().map_err(|e| e.to_string())?;
    let mut out = String::new();
    let mut rest = &args[1..];
    let mut chars = spec.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        let Some(verb) = chars.next() else {
            return Err("format string ends with a bare %".to_string());
        };
        if verb == '%' {
            out.push('%');
            continue;
        }
        let Some((arg, tail)) = rest.split_first() else {
            return Err("not enough arguments for format string".to_string());
        };
        rest = tail;
        match verb {
            's' => match arg.convert(&Ty::String) {
                Ok(Value::String(s)) => out.push_str(&s),
                _ => return Err(format!("cannot format {} with %s", arg.ty())),
            },
            'd' => {
                let n = arg.as_number().map_err(|e| e.to_string())?;
                let i = n.to_i64().ok_or("%d requires an integer")?;
                out.push_str(&i.to_string());
            }
            'q' => {
                let s = arg.as_str().map_err(|e| e.to_string())?;
                out.push_str(&format!("{s:?}"));
            }
            other => return Err(format!("unsupported format verb %{other}")),
        }
    }
    if !rest.is_empty() {
        return Err("too many arguments for format string".to_string());
    }
    Ok(Value::string(out))
}

fn hash_hex<D: Digest>(args: &[Value]) -> FnResult {
    arity(args, 1)?;
    if any_unknown(args) {
        return Ok(Value::Unknown(Ty::String));
    }
    let s = args[0].as_str().map_err(|e| e.to_string())?;
    let digest = D::digest(s.as_bytes());
    Ok(Value::string(to_hex(&digest)))
}

fn hash_base64<D: Digest>(args: &[Value]) -> FnResult {
    arity(args, 1)?;
    if any_unknown(args) {
        return Ok(Value::Unknown(Ty::String));
    }
    let s = args[0].as_str().map_err(|e| e.to_string())?;
    let digest = D::digest(s.as_bytes());
    Ok(Value::string(BASE64.encode(digest)))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn base64decode(args: &[Value]) -> FnResult {
    arity(args, 1)?;
    if any_unknown(args) {
        return Ok(Value::Unknown(Ty::String));
    }
    let s = args[0].as_str().map_err(|e| e.to_string())?;
    let bytes = BASE64.decode(s).map_err(|e| format!("invalid base64: {e}"))?;
    String::from_utf8(bytes)
        .map(Value::String)
        .map_err(|_| "decoded data is not valid UTF-8".to_string())
}

fn jsonencode(args: &[Value]) -> FnResult {
    arity(args, 1)?;
    if any_unknown(args) {
        return Ok(Value::Unknown(Ty::String));
    }
    let json = crate::value::json::to_plain(&args[0]).map_err(|e| e.to_string())?;
    serde_json::to_string(&json)
        .map(Value::String)
        .map_err(|e| e.to_string())
}

fn jsondecode(args: &[Value]) -> FnResult {
    arity(args, 1)?;
    if any_unknown(args) {
        return Ok(Value::Unknown(Ty::Dynamic));
    }
    let s = args[0].as_str().map_err(|e| e.to_string())?;
    let json: serde_json::Value =
        serde_json::from_str(s).map_err(|e| format!("invalid JSON: {e}"))?;
    crate::value::json::from_plain(&json, &Ty::Dynamic).map_err(|e| e.to_string())
}

fn pathexpand(args: &[Value]) -> FnResult {
    string_1(args, |s| {
        if let Some(rest) = s.strip_prefix("~/")
            && let Some(home) = std::env::var_os("HOME")
        {
            return std::path::Path::new(&home)
                .join(rest)
                .to_string_lossy()
                .into_owned();
        }
        s
    })
}

fn file_fn(scope: &Scope<'_>, args: &[Value]) -> FnResult {
    arity(args, 1)?;
    if any_unknown(args) {
        return Ok(Value::Unknown(Ty::String));
    }
    let rel = args[0].as_str().map_err(|e| e.to_string())?;
    let path = scope.root_path.join(rel);
    std::fs::read_to_string(&path)
        .map(Value::String)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))
}

fn timeadd(args: &[Value]) -> FnResult {
    arity(args, 2)?;
    if any_unknown(args) {
        return Ok(Value::Unknown(Ty::String));
    }
    let ts = args[0].as_str().map_err(|e| e.to_string())?;
    let dur = args[1].as_str().map_err(|e| e.to_string())?;
    let parsed: DateTime<Utc> = ts
        .parse()
        .map_err(|e| format!("invalid timestamp {ts:?}: {e}"))?;
    let delta = parse_duration(dur)?;
    Ok(Value::string(
        (parsed + delta).to_rfc3339_opts(SecondsFormat::Secs, true),
    ))
}

/// Parse durations of the form `1h30m`, `-10s`, `90m`.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if body.is_empty() {
        return Err(format!("invalid duration {s:?}"));
    }
    let mut total = Duration::zero();
    let mut digits = String::new();
    for ch in body.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let n: i64 = digits
            .parse()
            .map_err(|_| format!("invalid duration {s:?}"))?;
        digits.clear();
        total = total
            + match ch {
                'h' => Duration::hours(n),
                'm' => Duration::minutes(n),
                's' => Duration::seconds(n),
                _ => return Err(format!("invalid duration unit {ch:?} in {s:?}")),
            };
    }
    if !digits.is_empty() {
        return Err(format!("duration {s:?} is missing a unit"));
    }
    Ok(if negative { -total } else { total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::ModuleInstance;
    use crate::config::ModuleConfig;
    use crate::expr::eval::NoData;
    use std::path::Path;

    fn with_scope<R>(pure_only: bool, f: impl FnOnce(&Scope<'_>) -> R) -> R {
        let root = ModuleInstance::root();
        let config = ModuleConfig::default();
        let vars = BTreeMap::new();
        let scope = Scope {
            module: &root,
            module_config: &config,
            variables: &vars,
            data: &NoData,
            each: None,
            count_index: None,
            self_addr: None,
            workspace: "default",
            root_path: Path::new("."),
            pure_only,
        };
        f(&scope)
    }

    fn call_ok(name: &str, args: &[Value]) -> Value {
        with_scope(false, |scope| call(scope, name, args).unwrap())
    }

    #[test]
    fn test_length_counts_graphemes_after_nfc() {
        // The precomposed ligature stays a single cluster under NFC.
        assert_eq!(
            call_ok("length", &[Value::string("ﬁnale")]),
            Value::number_int(5)
        );
        // Combining marks collapse into their base cluster.
        assert_eq!(
            call_ok("length", &[Value::string("e\u{301}")]),
            Value::number_int(1)
        );
        // Collections count elements.
        assert_eq!(
            call_ok(
                "length",
                &[Value::Tuple(vec![Value::number_int(1), Value::number_int(2)])]
            ),
            Value::number_int(2)
        );
    }

    #[test]
    fn test_element_wraps_index() {
        let list = Value::Tuple(vec![
            Value::string("a"),
            Value::string("b"),
            Value::string("c"),
        ]);
        assert_eq!(
            call_ok("element", &[list.clone(), Value::number_int(4)]),
            Value::string("b")
        );
    }

    #[test]
    fn test_unknown_argument_makes_result_unknown() {
        let v = call_ok(
            "join",
            &[Value::string(","), Value::Unknown(Ty::List(Box::new(Ty::String)))],
        );
        assert_eq!(v, Value::Unknown(Ty::String));
    }

    #[test]
    fn test_impure_functions_are_unknown_during_plan() {
        let v = with_scope(true, |scope| call(scope, "uuid", &[]).unwrap());
        assert!(v.is_unknown());
        let v = with_scope(false, |scope| call(scope, "uuid", &[]).unwrap());
        assert!(v.is_known());
    }

    #[test]
    fn test_merge_later_wins() {
        let a = Value::Object(BTreeMap::from([
            ("x".to_string(), Value::number_int(1)),
            ("y".to_string(), Value::number_int(2)),
        ]));
        let b = Value::Object(BTreeMap::from([("y".to_string(), Value::number_int(9))]));
        let merged = call_ok("merge", &[a, b]);
        assert_eq!(merged.get_attr("y").unwrap(), Value::number_int(9));
        assert_eq!(merged.get_attr("x").unwrap(), Value::number_int(1));
    }

    #[test]
    fn test_format_verbs() {
        let v = call_ok(
            "format",
            &[
                Value::string("%s has %d items (%q) %%"),
                Value::string("bucket"),
                Value::number_int(3),
                Value::string("x"),
            ],
        );
        assert_eq!(v, Value::string("bucket has 3 items (\"x\") %"));

        let err = with_scope(false, |scope| {
            call(scope, "format", &[Value::string("%s")]).unwrap_err()
        });
        assert!(err.contains("not enough arguments"));
    }

    #[test]
    fn test_hashing_and_encoding() {
        assert_eq!(
            call_ok("sha256", &[Value::string("abc")]),
            Value::string("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        assert_eq!(
            call_ok("base64encode", &[Value::string("hi")]),
            Value::string("aGk=")
        );
        assert_eq!(
            call_ok("base64decode", &[Value::string("aGk=")]),
            Value::string("hi")
        );
    }

    #[test]
    fn test_json_round_trip() {
        let v = call_ok(
            "jsonencode",
            &[Value::Object(BTreeMap::from([(
                "a".to_string(),
                Value::number_int(1),
            )]))],
        );
        assert_eq!(v, Value::string("{\"a\":1}"));
        let back = call_ok("jsondecode", &[v]);
        assert_eq!(back.get_attr("a").unwrap(), Value::number_int(1));
    }

    #[test]
    fn test_substr_negative_offset_and_open_length() {
        assert_eq!(
            call_ok(
                "substr",
                &[Value::string("hello"), Value::number_int(-3), Value::number_int(-1)]
            ),
            Value::string("llo")
        );
        assert_eq!(
            call_ok(
                "substr",
                &[Value::string("hello"), Value::number_int(1), Value::number_int(3)]
            ),
            Value::string("ell")
        );
    }

    #[test]
    fn test_timeadd() {
        assert_eq!(
            call_ok(
                "timeadd",
                &[
                    Value::string("2024-05-01T00:00:00Z"),
                    Value::string("1h30m")
                ]
            ),
            Value::string("2024-05-01T01:30:00Z")
        );
    }

    #[test]
    fn test_coalesce_and_compact() {
        assert_eq!(
            call_ok(
                "coalesce",
                &[Value::Null(Ty::String), Value::string("x")]
            ),
            Value::string("x")
        );
        let v = call_ok(
            "compact",
            &[Value::Tuple(vec![
                Value::string("a"),
                Value::string(""),
                Value::string("b"),
            ])],
        );
        assert_eq!(
            v,
            Value::List(Ty::String, vec![Value::string("a"), Value::string("b")])
        );
    }

    #[test]
    fn test_sort_keys_lookup() {
        let m = Value::Object(BTreeMap::from([
            ("b".to_string(), Value::string("2")),
            ("a".to_string(), Value::string("1")),
        ]));
        assert_eq!(
            call_ok("keys", &[m.clone()]),
            Value::List(Ty::String, vec![Value::string("a"), Value::string("b")])
        );
        assert_eq!(
            call_ok("lookup", &[m.clone(), Value::string("b")]),
            Value::string("2")
        );
        assert_eq!(
            call_ok("lookup", &[m, Value::string("zz"), Value::string("fallback")]),
            Value::string("fallback")
        );
        assert_eq!(
            call_ok(
                "sort",
                &[Value::Tuple(vec![Value::string("b"), Value::string("a")])]
            ),
            Value::List(Ty::String, vec![Value::string("a"), Value::string("b")])
        );
    }
}
