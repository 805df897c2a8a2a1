//! Expression evaluation.
//!
//! Evaluation is pure with respect to the scope: the same scope and
//! expression always produce the same value. Errors become diagnostics and
//! evaluation continues with unknown placeholders so one broken expression
//! surfaces as many findings as possible in a single pass.

use super::{BinaryOp, Expr, PathStep, Reference, UnaryOp};
use crate::addrs::{AbsResourceInstance, InstanceKey, ModuleInstance, Resource};
use crate::config::ModuleConfig;
use crate::diag::{Diagnostic, Diagnostics};
use crate::value::{Ty, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Resolution of resource and module-output references against whatever
/// data backs the current walk: planned values during plan, recorded state
/// during apply.
pub trait EvalData: Sync {
    /// The value of a whole resource within a module: a single object for
    /// a singleton, a tuple for `count` instances, a map for `for_each`.
    /// `None` when nothing has been recorded yet.
    fn resource_value(&self, module: &ModuleInstance, resource: &Resource) -> Option<Value>;

    /// The value of one output of a child module instance.
    fn module_output(&self, child: &ModuleInstance, name: &str) -> Option<Value>;
}

/// Empty data source: every cross-reference is unknown. Used by validate.
pub struct NoData;

impl EvalData for NoData {
    fn resource_value(&self, _: &ModuleInstance, _: &Resource) -> Option<Value> {
        None
    }

    fn module_output(&self, _: &ModuleInstance, _: &str) -> Option<Value> {
        None
    }
}

/// Everything an expression may refer to.
pub struct Scope<'a> {
    pub module: &'a ModuleInstance,
    pub module_config: &'a ModuleConfig,
    /// Resolved input variable values for this module.
    pub variables: &'a BTreeMap<String, Value>,
    pub data: &'a dyn EvalData,
    /// `each.key` / `each.value` bindings, when inside a for_each body.
    pub each: Option<(&'a Value, &'a Value)>,
    /// `count.index` binding, when inside a count body.
    pub count_index: Option<i64>,
    /// The instance being evaluated, for self-reference detection.
    pub self_addr: Option<&'a AbsResourceInstance>,
    pub workspace: &'a str,
    pub root_path: &'a Path,
    /// During plan, impure functions return unknown instead of a value.
    pub pure_only: bool,
}

/// Evaluate an expression against a scope. Problems are reported through
/// `diags`; the returned value is unknown wherever evaluation failed.
pub fn evaluate(scope: &Scope<'_>, expr: &Expr, diags: &mut Diagnostics) -> Value {
    let mut ev = Evaluator {
        scope,
        local_stack: Vec::new(),
    };
    ev.expr(expr, diags)
}

struct Evaluator<'a, 'b> {
    scope: &'a Scope<'b>,
    /// Locals currently being evaluated, for cycle detection.
    local_stack: Vec<String>,
}

impl Evaluator<'_, '_> {
    fn expr(&mut self, expr: &Expr, diags: &mut Diagnostics) -> Value {
        match expr {
            Expr::Lit(json) => match crate::value::json::from_plain(json, &Ty::Dynamic) {
                Ok(v) => v,
                Err(err) => self.error(diags, "invalid literal", err.to_string()),
            },
            Expr::Ref(s) => self.reference(s, diags),
            Expr::GetAttr { of, name } => {
                let base = self.expr(of, diags);
                match base.get_attr(name) {
                    Ok(v) => v,
                    Err(err) => self.error(diags, "invalid attribute access", err.to_string()),
                }
            }
            Expr::Index { of, key } => {
                let base = self.expr(of, diags);
                let key = self.expr(key, diags);
                match base.index(&key) {
                    Ok(v) => v,
                    Err(err) => self.error(diags, "invalid index", err.to_string()),
                }
            }
            Expr::Splat { of, attr } => {
                let base = self.expr(of, diags);
                match base.splat_attr(attr) {
                    Ok(v) => v,
                    Err(err) => self.error(diags, "invalid splat", err.to_string()),
                }
            }
            Expr::Call { name, args } => {
                let args: Vec<Value> = args.iter().map(|a| self.expr(a, diags)).collect();
                match super::funcs::call(self.scope, name, &args) {
                    Ok(v) => v,
                    Err(err) => self.error(diags, format!("error in function {name:?}"), err),
                }
            }
            Expr::Unary { op, operand } => {
                let v = self.expr(operand, diags);
                self.unary(*op, v, diags)
            }
            Expr::Binary { op, lhs, rhs } => {
                let l = self.expr(lhs, diags);
                let r = self.expr(rhs, diags);
                self.binary(*op, l, r, diags)
            }
            Expr::Cond { cond, then, otherwise } => {
                let c = self.expr(cond, diags);
                // Both branches are typed even when only one is taken; a
                // failed untaken branch must not fail the expression.
                let mut then_diags = Diagnostics::new();
                let mut else_diags = Diagnostics::new();
                let t = self.expr(then, &mut then_diags);
                let e = self.expr(otherwise, &mut else_diags);
                match c {
                    Value::Unknown(_) => Value::Unknown(Ty::unify(&t.ty(), &e.ty())),
                    Value::Bool(true) => {
                        diags.extend(then_diags);
                        t
                    }
                    Value::Bool(false) => {
                        diags.extend(else_diags);
                        e
                    }
                    other => self.error(
                        diags,
                        "invalid condition",
                        format!("condition must be bool, got {}", other.ty()),
                    ),
                }
            }
            Expr::Tuple(items) => {
                Value::Tuple(items.iter().map(|i| self.expr(i, diags)).collect())
            }
            Expr::Object(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, e)| (k.clone(), self.expr(e, diags)))
                    .collect(),
            ),
            Expr::Template(pieces) => {
                let mut out = String::new();
                for piece in pieces {
                    let v = self.expr(piece, diags);
                    if v.is_unknown() {
                        return Value::Unknown(Ty::String);
                    }
                    match v.convert(&Ty::String) {
                        Ok(Value::String(s)) => out.push_str(&s),
                        Ok(_) | Err(_) => {
                            return self.error(
                                diags,
                                "invalid template value",
                                format!("cannot render {} as a string", v.ty()),
                            );
                        }
                    }
                }
                Value::String(out)
            }
        }
    }

    fn reference(&mut self, raw: &str, diags: &mut Diagnostics) -> Value {
        let reference = match Reference::parse(raw) {
            Ok(r) => r,
            Err(err) => return self.error(diags, "invalid reference", err.to_string()),
        };

        match reference {
            Reference::Var(name) => {
                if let Some(v) = self.scope.variables.get(&name) {
                    return v.clone();
                }
                if self.scope.module_config.variables.contains_key(&name) {
                    // Declared but unresolved: defaults apply upstream, so
                    // reaching here means the caller left it unset.
                    return Value::Null(Ty::Dynamic);
                }
                self.error(
                    diags,
                    "reference to undeclared input variable",
                    format!("no variable {name:?} is declared in this module"),
                )
            }
            Reference::Local(name) => self.local(&name, diags),
            Reference::CountIndex => match self.scope.count_index {
                Some(i) => Value::number_int(i),
                None => self.error(
                    diags,
                    "count.index outside count context",
                    "count.index is only available inside resources using count",
                ),
            },
            Reference::EachKey => match self.scope.each {
                Some((k, _)) => k.clone(),
                None => self.error(
                    diags,
                    "each.key outside for_each context",
                    "each values are only available inside resources using for_each",
                ),
            },
            Reference::EachValue => match self.scope.each {
                Some((_, v)) => v.clone(),
                None => self.error(
                    diags,
                    "each.value outside for_each context",
                    "each values are only available inside resources using for_each",
                ),
            },
            Reference::PathAttr(attr) => match attr.as_str() {
                "root" | "module" => {
                    Value::string(self.scope.root_path.to_string_lossy().into_owned())
                }
                "cwd" => Value::string(
                    std::env::current_dir()
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                ),
                other => self.error(
                    diags,
                    "invalid path attribute",
                    format!("path.{other} is not defined"),
                ),
            },
            Reference::Workspace => Value::string(self.scope.workspace),
            Reference::ModuleOutput { call, key, output, path } => {
                if !self.scope.module_config.module_calls.contains_key(&call) {
                    return self.error(
                        diags,
                        "reference to undeclared module",
                        format!("no module {call:?} is called from this module"),
                    );
                }
                let child = self.scope.module.child(call, key);
                let base = self
                    .scope
                    .data
                    .module_output(&child, &output)
                    .unwrap_or(Value::Unknown(Ty::Dynamic));
                self.apply_path(base, &path, diags)
            }
            Reference::Resource { resource, key, path } => {
                self.resource_reference(resource, key, path, diags)
            }
        }
    }

    fn resource_reference(
        &mut self,
        resource: Resource,
        key: Option<InstanceKey>,
        path: Vec<PathStep>,
        diags: &mut Diagnostics,
    ) -> Value {
        if !self.scope.module_config.has_resource(&resource) {
            return self.error(
                diags,
                "reference to undeclared resource",
                format!("no resource {resource} is declared in this module"),
            );
        }

        if let Some(self_addr) = self.scope.self_addr
            && self_addr.module == *self.scope.module
            && self_addr.instance.resource == resource
            && (key.is_none() || key == self_addr.instance.key)
        {
            return self.error(
                diags,
                "self-referential expression",
                format!("configuration for {self_addr} refers to its own attributes"),
            );
        }

        let whole = self
            .scope
            .data
            .resource_value(self.scope.module, &resource)
            .unwrap_or(Value::Unknown(Ty::Dynamic));

        let base = match key {
            None => whole,
            Some(InstanceKey::Int(i)) => match whole.index(&Value::number_int(i)) {
                Ok(v) => v,
                Err(err) => {
                    return self.error(diags, "invalid instance key", err.to_string());
                }
            },
            Some(InstanceKey::Str(s)) => match whole.index(&Value::string(s)) {
                Ok(v) => v,
                Err(err) => {
                    return self.error(diags, "invalid instance key", err.to_string());
                }
            },
        };
        self.apply_path(base, &path, diags)
    }

    fn apply_path(&mut self, base: Value, path: &[PathStep], diags: &mut Diagnostics) -> Value {
        let mut current = base;
        for step in path {
            let next = match step {
                PathStep::Attr(name) => current.get_attr(name),
                PathStep::Index(InstanceKey::Int(i)) => current.index(&Value::number_int(*i)),
                PathStep::Index(InstanceKey::Str(s)) => current.index(&Value::string(s.clone())),
            };
            match next {
                Ok(v) => current = v,
                Err(err) => return self.error(diags, "invalid reference path", err.to_string()),
            }
        }
        current
    }

    fn local(&mut self, name: &str, diags: &mut Diagnostics) -> Value {
        let scope = self.scope;
        let Some(expr) = scope.module_config.locals.get(name) else {
            return self.error(
                diags,
                "reference to undeclared local value",
                format!("no local {name:?} is declared in this module"),
            );
        };
        if self.local_stack.iter().any(|n| n == name) {
            let chain = self.local_stack.join(" -> ");
            return self.error(
                diags,
                "cyclic local value",
                format!("local.{name} depends on itself via {chain}"),
            );
        }
        self.local_stack.push(name.to_string());
        let v = self.expr(expr, diags);
        self.local_stack.pop();
        v
    }

    fn unary(&mut self, op: UnaryOp, v: Value, diags: &mut Diagnostics) -> Value {
        match op {
            UnaryOp::Neg => {
                if v.is_unknown() {
                    return Value::Unknown(Ty::Number);
                }
                match v.as_number() {
                    Ok(n) => Value::Number(-n.clone()),
                    Err(err) => self.error(diags, "invalid operand", err.to_string()),
                }
            }
            UnaryOp::Not => {
                if v.is_unknown() {
                    return Value::Unknown(Ty::Bool);
                }
                match v.as_bool() {
                    Ok(b) => Value::Bool(!b),
                    Err(err) => self.error(diags, "invalid operand", err.to_string()),
                }
            }
        }
    }

    fn binary(&mut self, op: BinaryOp, l: Value, r: Value, diags: &mut Diagnostics) -> Value {
        use BinaryOp::*;
        match op {
            Eq => l.equal(&r),
            Ne => match l.equal(&r) {
                Value::Bool(b) => Value::Bool(!b),
                other => other,
            },
            And | Or => self.logical(op, l, r, diags),
            Add | Sub | Mul | Div | Mod => self.arithmetic(op, l, r, diags),
            Lt | Le | Gt | Ge => self.comparison(op, l, r, diags),
        }
    }

    fn logical(&mut self, op: BinaryOp, l: Value, r: Value, diags: &mut Diagnostics) -> Value {
        // Short-circuit on a determining known operand even when the other
        // side is unknown.
        let known = |v: &Value| match v {
            Value::Bool(b) => Some(*b),
            _ => None,
        };
        match (op, known(&l), known(&r)) {
            (BinaryOp::And, Some(false), _) | (BinaryOp::And, _, Some(false)) => Value::Bool(false),
            (BinaryOp::Or, Some(true), _) | (BinaryOp::Or, _, Some(true)) => Value::Bool(true),
            _ if l.is_unknown() || r.is_unknown() => Value::Unknown(Ty::Bool),
            (BinaryOp::And, _, _) => match (l.as_bool(), r.as_bool()) {
                (Ok(a), Ok(b)) => Value::Bool(a && b),
                (Err(err), _) | (_, Err(err)) => {
                    self.error(diags, "invalid operand", err.to_string())
                }
            },
            (BinaryOp::Or, _, _) => match (l.as_bool(), r.as_bool()) {
                (Ok(a), Ok(b)) => Value::Bool(a || b),
                (Err(err), _) | (_, Err(err)) => {
                    self.error(diags, "invalid operand", err.to_string())
                }
            },
            _ => unreachable!("logical() is only called for And/Or"),
        }
    }

    fn arithmetic(&mut self, op: BinaryOp, l: Value, r: Value, diags: &mut Diagnostics) -> Value {
        if l.is_unknown() || r.is_unknown() {
            return Value::Unknown(Ty::Number);
        }
        let (a, b) = match (l.convert(&Ty::Number), r.convert(&Ty::Number)) {
            (Ok(Value::Number(a)), Ok(Value::Number(b))) => (a, b),
            (Err(err), _) | (_, Err(err)) => {
                return self.error(diags, "invalid operand", err.to_string());
            }
            _ => {
                return self.error(diags, "invalid operand", "arithmetic on a null value");
            }
        };
        use bigdecimal::Zero;
        let result = match op {
            BinaryOp::Add => &a + &b,
            BinaryOp::Sub => &a - &b,
            BinaryOp::Mul => &a * &b,
            BinaryOp::Div => {
                if b.is_zero() {
                    return self.error(diags, "division by zero", "the divisor evaluates to zero");
                }
                &a / &b
            }
            BinaryOp::Mod => {
                if b.is_zero() {
                    return self.error(diags, "division by zero", "the divisor evaluates to zero");
                }
                &a % &b
            }
            _ => unreachable!("arithmetic() is only called for arithmetic ops"),
        };
        Value::Number(result)
    }

    fn comparison(&mut self, op: BinaryOp, l: Value, r: Value, diags: &mut Diagnostics) -> Value {
        if l.is_unknown() || r.is_unknown() {
            return Value::Unknown(Ty::Bool);
        }
        let (a, b) = match (l.as_number(), r.as_number()) {
            (Ok(a), Ok(b)) => (a, b),
            (Err(err), _) | (_, Err(err)) => {
                return self.error(diags, "invalid operand", err.to_string());
            }
        };
        let out = match op {
            BinaryOp::Lt => a < b,
            BinaryOp::Le => a <= b,
            BinaryOp::Gt => a > b,
            BinaryOp::Ge => a >= b,
            _ => unreachable!("comparison() is only called for ordering ops"),
        };
        Value::Bool(out)
    }

    fn error(
        &self,
        diags: &mut Diagnostics,
        summary: impl Into<String>,
        detail: impl Into<String>,
    ) -> Value {
        let mut diag = Diagnostic::error(summary).with_detail(detail.into());
        if let Some(addr) = self.scope.self_addr {
            diag = diag.with_address(addr.to_string());
        }
        diags.push(diag);
        Value::Unknown(Ty::Dynamic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_scope_config() -> Config {
        Config::from_json_str(
            r#"{
                "variables": {"region": {"type": "string"}},
                "locals": {
                    "doubled": {"binary": {"op": "mul", "lhs": {"ref": "var.region_count"}, "rhs": {"lit": 2}}},
                    "loop_a": {"ref": "local.loop_b"},
                    "loop_b": {"ref": "local.loop_a"}
                },
                "resources": [
                    {"type": "test_instance", "name": "web", "count": {"lit": 2}, "config": {}}
                ]
            }"#,
        )
        .unwrap()
    }

    struct FixedData(Value);

    impl EvalData for FixedData {
        fn resource_value(&self, _: &ModuleInstance, _: &Resource) -> Option<Value> {
            Some(self.0.clone())
        }

        fn module_output(&self, _: &ModuleInstance, _: &str) -> Option<Value> {
            None
        }
    }

    fn eval_with(
        config: &Config,
        vars: &BTreeMap<String, Value>,
        data: &dyn EvalData,
        expr: &Expr,
    ) -> (Value, Diagnostics) {
        let root = ModuleInstance::root();
        let scope = Scope {
            module: &root,
            module_config: &config.root,
            variables: vars,
            data,
            each: None,
            count_index: None,
            self_addr: None,
            workspace: "default",
            root_path: Path::new("."),
            pure_only: false,
        };
        let mut diags = Diagnostics::new();
        let v = evaluate(&scope, expr, &mut diags);
        (v, diags)
    }

    #[test]
    fn test_arithmetic_and_variables() {
        let config = test_scope_config();
        let vars = BTreeMap::from([("region".to_string(), Value::string("us"))]);
        let expr = Expr::Binary {
            op: BinaryOp::Add,
            lhs: Box::new(Expr::lit(2)),
            rhs: Box::new(Expr::lit(3)),
        };
        let (v, diags) = eval_with(&config, &vars, &NoData, &expr);
        assert!(!diags.has_errors());
        assert_eq!(v, Value::number_int(5));
    }

    #[test]
    fn test_undeclared_variable_is_error() {
        let config = test_scope_config();
        let vars = BTreeMap::new();
        let (_, diags) = eval_with(&config, &vars, &NoData, &Expr::reference("var.nope"));
        assert!(diags.has_errors());
        assert!(diags.to_report().contains("undeclared input variable"));
    }

    #[test]
    fn test_unknown_propagates_through_operators() {
        let config = test_scope_config();
        let vars = BTreeMap::from([("region".to_string(), Value::Unknown(Ty::String))]);
        let expr = Expr::Binary {
            op: BinaryOp::Eq,
            lhs: Box::new(Expr::reference("var.region")),
            rhs: Box::new(Expr::lit("us")),
        };
        let (v, diags) = eval_with(&config, &vars, &NoData, &expr);
        assert!(!diags.has_errors());
        assert_eq!(v, Value::Unknown(Ty::Bool));
    }

    #[test]
    fn test_short_circuit_with_unknown() {
        let config = test_scope_config();
        let vars = BTreeMap::new();
        let expr = Expr::Binary {
            op: BinaryOp::Or,
            lhs: Box::new(Expr::lit(true)),
            rhs: Box::new(Expr::Ref("var.region".into())),
        };
        let (v, _) = eval_with(&config, &vars, &NoData, &expr);
        assert_eq!(v, Value::Bool(true));
    }

    #[test]
    fn test_resource_reference_resolves_through_data() {
        let config = test_scope_config();
        let vars = BTreeMap::new();
        let data = FixedData(Value::Tuple(vec![
            Value::Object(BTreeMap::from([("id".to_string(), Value::string("a"))])),
            Value::Object(BTreeMap::from([("id".to_string(), Value::string("b"))])),
        ]));
        let (v, diags) = eval_with(
            &config,
            &vars,
            &data,
            &Expr::reference("test_instance.web[1].id"),
        );
        assert!(!diags.has_errors(), "{}", diags.to_report());
        assert_eq!(v, Value::string("b"));

        // Splat over the whole resource.
        let (v, diags) = eval_with(
            &config,
            &vars,
            &data,
            &Expr::Splat {
                of: Box::new(Expr::reference("test_instance.web")),
                attr: "id".into(),
            },
        );
        assert!(!diags.has_errors());
        assert_eq!(
            v,
            Value::Tuple(vec![Value::string("a"), Value::string("b")])
        );
    }

    #[test]
    fn test_undeclared_resource_reference_is_error() {
        let config = test_scope_config();
        let vars = BTreeMap::new();
        let (_, diags) = eval_with(&config, &vars, &NoData, &Expr::reference("test_instance.nope.id"));
        assert!(diags.has_errors());
        assert!(diags.to_report().contains("undeclared resource"));
    }

    #[test]
    fn test_self_reference_is_error() {
        let config = test_scope_config();
        let vars = BTreeMap::new();
        let root = ModuleInstance::root();
        let self_addr = Resource::managed("test_instance", "web")
            .instance(Some(InstanceKey::Int(0)))
            .absolute(root.clone());
        let scope = Scope {
            module: &root,
            module_config: &config.root,
            variables: &vars,
            data: &NoData,
            each: None,
            count_index: Some(0),
            self_addr: Some(&self_addr),
            workspace: "default",
            root_path: Path::new("."),
            pure_only: false,
        };
        let mut diags = Diagnostics::new();
        evaluate(&scope, &Expr::reference("test_instance.web[0].id"), &mut diags);
        assert!(diags.has_errors());
        assert!(diags.to_report().contains("self-referential"));
    }

    #[test]
    fn test_cyclic_locals_detected() {
        let config = test_scope_config();
        let vars = BTreeMap::new();
        let (_, diags) = eval_with(&config, &vars, &NoData, &Expr::reference("local.loop_a"));
        assert!(diags.has_errors());
        assert!(diags.to_report().contains("cyclic local value"));
    }

    #[test]
    fn test_conditional_untaken_branch_errors_suppressed() {
        let config = test_scope_config();
        let vars = BTreeMap::new();
        let expr = Expr::Cond {
            cond: Box::new(Expr::lit(true)),
            then: Box::new(Expr::lit("ok")),
            otherwise: Box::new(Expr::reference("var.nope")),
        };
        let (v, diags) = eval_with(&config, &vars, &NoData, &expr);
        assert!(!diags.has_errors(), "{}", diags.to_report());
        assert_eq!(v, Value::string("ok"));
    }

    #[test]
    fn test_division_by_zero() {
        let config = test_scope_config();
        let vars = BTreeMap::new();
        let expr = Expr::Binary {
            op: BinaryOp::Div,
            lhs: Box::new(Expr::lit(1)),
            rhs: Box::new(Expr::lit(0)),
        };
        let (_, diags) = eval_with(&config, &vars, &NoData, &expr);
        assert!(diags.has_errors());
        assert!(diags.to_report().contains("division by zero"));
    }

    #[test]
    fn test_template_concatenation() {
        let config = test_scope_config();
        let vars = BTreeMap::from([("region".to_string(), Value::string("us"))]);
        let expr = Expr::Template(vec![
            Expr::lit("prefix-"),
            Expr::reference("var.region"),
            Expr::lit(1),
        ]);
        let (v, diags) = eval_with(&config, &vars, &NoData, &expr);
        assert!(!diags.has_errors());
        assert_eq!(v, Value::string("prefix-us1"));
    }
}
