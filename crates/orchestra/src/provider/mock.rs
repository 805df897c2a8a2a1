//! In-memory provider for tests.
//!
//! The mock records every call and exposes override hooks per operation.
//! Without overrides it behaves like a well-mannered provider: plans fill
//! computed attributes with unknowns (or carry them over from the prior
//! object), applies resolve those unknowns to generated values, reads
//! return the prior object unchanged.

use super::{
    ApplyRequest, ApplyResponse, PlanRequest, PlanResponse, Provider, ProviderFailure,
    ProviderResult, ProviderSchema, ReadResponse,
};
use crate::diag::{Diagnostic, Diagnostics};
use crate::schema::Schema;
use crate::value::{Ty, Value};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

type ConfigureFn = dyn Fn(&Value) -> ProviderResult<()> + Send + Sync;
type PlanFn = dyn Fn(&PlanRequest<'_>) -> ProviderResult<PlanResponse> + Send + Sync;
type ApplyFn = dyn Fn(&ApplyRequest<'_>) -> ProviderResult<ApplyResponse> + Send + Sync;
type ReadFn = dyn Fn(&str, &Value) -> ProviderResult<ReadResponse> + Send + Sync;
type DataFn = dyn Fn(&str, &Value) -> ProviderResult<Value> + Send + Sync;

/// Counts of calls made against a [`MockProvider`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallLog {
    pub configure: u32,
    pub plan: u32,
    pub apply: u32,
    pub read: u32,
    pub read_data: u32,
    pub stop: u32,
    pub close: u32,
}

#[derive(Default)]
pub struct MockProvider {
    schema: ProviderSchema,
    calls: Mutex<CallLog>,
    id_counter: AtomicU64,
    pub configure_fn: Option<Box<ConfigureFn>>,
    pub plan_fn: Option<Box<PlanFn>>,
    pub apply_fn: Option<Box<ApplyFn>>,
    pub read_fn: Option<Box<ReadFn>>,
    pub data_fn: Option<Box<DataFn>>,
}

impl MockProvider {
    pub fn new(schema: ProviderSchema) -> Self {
        Self {
            schema,
            ..Default::default()
        }
    }

    pub fn call_log(&self) -> CallLog {
        *self.calls.lock().expect("call log lock poisoned")
    }

    fn bump(&self, f: impl FnOnce(&mut CallLog)) {
        f(&mut self.calls.lock().expect("call log lock poisoned"));
    }

    fn type_schema(&self, type_name: &str) -> ProviderResult<&Schema> {
        self.schema
            .resource_type(type_name)
            .ok_or_else(|| ProviderFailure::new(format!("unknown resource type {type_name:?}")))
    }

    fn next_id(&self, type_name: &str) -> String {
        let n = self.id_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{type_name}-{n}")
    }

    /// Replace every unknown in `value` with a generated concrete value.
    fn resolve_unknowns(&self, type_name: &str, value: &Value) -> Value {
        match value {
            Value::Unknown(Ty::String) => Value::string(self.next_id(type_name)),
            Value::Unknown(Ty::Number) => Value::number_int(0),
            Value::Unknown(Ty::Bool) => Value::Bool(false),
            Value::Unknown(ty) => Value::Null(ty.clone()),
            Value::Object(attrs) => Value::Object(
                attrs
                    .iter()
                    .map(|(k, v)| (k.clone(), self.resolve_unknowns(type_name, v)))
                    .collect(),
            ),
            Value::Tuple(elems) => Value::Tuple(
                elems
                    .iter()
                    .map(|e| self.resolve_unknowns(type_name, e))
                    .collect(),
            ),
            Value::List(t, elems) => Value::List(
                t.clone(),
                elems
                    .iter()
                    .map(|e| self.resolve_unknowns(type_name, e))
                    .collect(),
            ),
            Value::Map(t, elems) => Value::Map(
                t.clone(),
                elems
                    .iter()
                    .map(|(k, v)| (k.clone(), self.resolve_unknowns(type_name, v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn default_plan(&self, req: &PlanRequest<'_>) -> ProviderResult<PlanResponse> {
        let schema = self.type_schema(req.type_name)?;

        if req.proposed.is_null() {
            return Ok(PlanResponse {
                planned: Value::Null(schema.block.implied_type()),
                requires_replace: Vec::new(),
                private: req.private.to_vec(),
            });
        }

        // Replacement is decided first: computed attributes carry over
        // from the prior object only when the object itself survives.
        let mut requires_replace = Vec::new();
        for (name, attr) in &schema.block.attributes {
            if !attr.force_new {
                continue;
            }
            let proposed = req
                .proposed
                .get_attr(name)
                .unwrap_or(Value::Null(attr.ty.clone()));
            let prior = (!req.prior.is_null())
                .then(|| req.prior.get_attr(name).ok())
                .flatten();
            if let Some(p) = &prior
                && !p.is_null()
                && p.is_known()
                && proposed.is_known()
                && !p.raw_equals(&proposed)
            {
                requires_replace.push(name.clone());
            }
        }
        let replacing = !requires_replace.is_empty();

        let mut planned = BTreeMap::new();
        for (name, attr) in &schema.block.attributes {
            let proposed = req
                .proposed
                .get_attr(name)
                .unwrap_or(Value::Null(attr.ty.clone()));
            let prior = (!req.prior.is_null())
                .then(|| req.prior.get_attr(name).ok())
                .flatten();

            let value = if attr.computed && proposed.is_null() {
                match &prior {
                    Some(p) if !p.is_null() && !replacing => p.clone(),
                    _ => Value::Unknown(attr.ty.clone()),
                }
            } else {
                proposed.clone()
            };
            planned.insert(name.clone(), value);
        }

        // Nested block content passes through as proposed.
        for name in schema.block.block_types.keys() {
            if let Ok(v) = req.proposed.get_attr(name) {
                planned.insert(name.clone(), v);
            }
        }

        Ok(PlanResponse {
            planned: Value::Object(planned),
            requires_replace,
            private: req.private.to_vec(),
        })
    }

    fn default_apply(&self, req: &ApplyRequest<'_>) -> ProviderResult<ApplyResponse> {
        let schema = self.type_schema(req.type_name)?;
        if req.planned.is_null() {
            return Ok(ApplyResponse {
                new_state: Value::Null(schema.block.implied_type()),
                private: Vec::new(),
            });
        }
        Ok(ApplyResponse {
            new_state: self.resolve_unknowns(req.type_name, req.planned),
            private: req.private.to_vec(),
        })
    }
}

impl Provider for MockProvider {
    fn schema(&self) -> ProviderResult<ProviderSchema> {
        Ok(self.schema.clone())
    }

    fn configure(&self, config: &Value) -> ProviderResult<()> {
        self.bump(|c| c.configure += 1);
        match &self.configure_fn {
            Some(f) => f(config),
            None => Ok(()),
        }
    }

    fn validate_resource_config(&self, type_name: &str, _config: &Value) -> Diagnostics {
        let mut diags = Diagnostics::new();
        if self.schema.resource_type(type_name).is_none()
            && self.schema.data_source(type_name).is_none()
        {
            diags.push(Diagnostic::error(format!(
                "provider does not support resource type {type_name:?}"
            )));
        }
        diags
    }

    fn read_resource(
        &self,
        type_name: &str,
        prior: &Value,
        private: &[u8],
    ) -> ProviderResult<ReadResponse> {
        self.bump(|c| c.read += 1);
        match &self.read_fn {
            Some(f) => f(type_name, prior),
            None => Ok(ReadResponse {
                new_state: prior.clone(),
                private: private.to_vec(),
            }),
        }
    }

    fn plan_change(&self, req: &PlanRequest<'_>) -> ProviderResult<PlanResponse> {
        self.bump(|c| c.plan += 1);
        match &self.plan_fn {
            Some(f) => f(req),
            None => self.default_plan(req),
        }
    }

    fn apply_change(&self, req: &ApplyRequest<'_>) -> ProviderResult<ApplyResponse> {
        self.bump(|c| c.apply += 1);
        match &self.apply_fn {
            Some(f) => f(req),
            None => self.default_apply(req),
        }
    }

    fn read_data_source(&self, type_name: &str, config: &Value) -> ProviderResult<Value> {
        self.bump(|c| c.read_data += 1);
        match &self.data_fn {
            Some(f) => f(type_name, config),
            None => {
                let schema = self
                    .schema
                    .data_source(type_name)
                    .ok_or_else(|| {
                        ProviderFailure::new(format!("unknown data source {type_name:?}"))
                    })?
                    .clone();
                let (coerced, _) = schema.block.coerce(config);
                Ok(self.resolve_unknowns(type_name, &coerced))
            }
        }
    }

    fn stop(&self) {
        self.bump(|c| c.stop += 1);
    }

    fn close(&self) {
        self.bump(|c| c.close += 1);
    }
}

/// A schema commonly used across engine tests: one managed type with a
/// required force-new `ami`, an optional `size`, and a computed `id`; one
/// data source echoing a `name`.
pub fn test_provider_schema() -> ProviderSchema {
    use crate::schema::{Attribute, Block};

    ProviderSchema {
        provider: Block {
            attributes: BTreeMap::from([("region".to_string(), Attribute::optional(Ty::String))]),
            block_types: BTreeMap::new(),
        },
        resource_types: BTreeMap::from([(
            "test_instance".to_string(),
            Schema {
                version: 0,
                block: Block {
                    attributes: BTreeMap::from([
                        (
                            "ami".to_string(),
                            Attribute::required(Ty::String).force_new(),
                        ),
                        ("size".to_string(), Attribute::optional(Ty::Number)),
                        ("id".to_string(), Attribute::computed(Ty::String)),
                    ]),
                    block_types: BTreeMap::new(),
                },
            },
        )]),
        data_sources: BTreeMap::from([(
            "test_source".to_string(),
            Schema {
                version: 0,
                block: Block {
                    attributes: BTreeMap::from([
                        ("name".to_string(), Attribute::required(Ty::String)),
                        ("id".to_string(), Attribute::computed(Ty::String)),
                    ]),
                    block_types: BTreeMap::new(),
                },
            },
        )]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(entries: &[(&str, Value)]) -> Value {
        Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn test_default_plan_create_promises_computed() {
        let mock = MockProvider::new(test_provider_schema());
        let prior = Value::Null(Ty::Dynamic);
        let proposed = object(&[
            ("ami", Value::string("ami-1")),
            ("size", Value::Null(Ty::Number)),
            ("id", Value::Null(Ty::String)),
        ]);
        let resp = mock
            .plan_change(&PlanRequest {
                type_name: "test_instance",
                prior: &prior,
                proposed: &proposed,
                private: &[],
            })
            .unwrap();
        assert!(resp.planned.get_attr("id").unwrap().is_unknown());
        assert_eq!(resp.planned.get_attr("ami").unwrap(), Value::string("ami-1"));
        assert!(resp.requires_replace.is_empty());
    }

    #[test]
    fn test_default_plan_flags_force_new() {
        let mock = MockProvider::new(test_provider_schema());
        let prior = object(&[
            ("ami", Value::string("ami-1")),
            ("size", Value::Null(Ty::Number)),
            ("id", Value::string("test_instance-1")),
        ]);
        let proposed = object(&[
            ("ami", Value::string("ami-2")),
            ("size", Value::Null(Ty::Number)),
            ("id", Value::Null(Ty::String)),
        ]);
        let resp = mock
            .plan_change(&PlanRequest {
                type_name: "test_instance",
                prior: &prior,
                proposed: &proposed,
                private: &[],
            })
            .unwrap();
        assert_eq!(resp.requires_replace, vec!["ami".to_string()]);
        // Replacement creates a new object, so the computed attribute is
        // no longer carried from the prior one.
        assert!(resp.planned.get_attr("id").unwrap().is_unknown());
    }

    #[test]
    fn test_default_plan_update_carries_computed() {
        let mock = MockProvider::new(test_provider_schema());
        let prior = object(&[
            ("ami", Value::string("ami-1")),
            ("size", Value::number_int(1)),
            ("id", Value::string("test_instance-1")),
        ]);
        let proposed = object(&[
            ("ami", Value::string("ami-1")),
            ("size", Value::number_int(2)),
            ("id", Value::Null(Ty::String)),
        ]);
        let resp = mock
            .plan_change(&PlanRequest {
                type_name: "test_instance",
                prior: &prior,
                proposed: &proposed,
                private: &[],
            })
            .unwrap();
        assert!(resp.requires_replace.is_empty());
        assert_eq!(
            resp.planned.get_attr("id").unwrap(),
            Value::string("test_instance-1")
        );
    }

    #[test]
    fn test_default_apply_resolves_unknowns() {
        let mock = MockProvider::new(test_provider_schema());
        let prior = Value::Null(Ty::Dynamic);
        let planned = object(&[
            ("ami", Value::string("ami-1")),
            ("size", Value::number_int(2)),
            ("id", Value::Unknown(Ty::String)),
        ]);
        let resp = mock
            .apply_change(&ApplyRequest {
                type_name: "test_instance",
                prior: &prior,
                planned: &planned,
                private: &[],
            })
            .unwrap();
        assert_eq!(
            resp.new_state.get_attr("id").unwrap(),
            Value::string("test_instance-1")
        );
        assert!(resp.new_state.is_whole_known());
    }

    #[test]
    fn test_apply_null_is_destroy() {
        let mock = MockProvider::new(test_provider_schema());
        let prior = object(&[("ami", Value::string("ami-1"))]);
        let resp = mock
            .apply_change(&ApplyRequest {
                type_name: "test_instance",
                prior: &prior,
                planned: &Value::Null(Ty::Dynamic),
                private: &[],
            })
            .unwrap();
        assert!(resp.new_state.is_null());
    }

    #[test]
    fn test_call_log_and_overrides() {
        let mut mock = MockProvider::new(test_provider_schema());
        mock.apply_fn = Some(Box::new(|_req| {
            Err(ProviderFailure::new("boom").with_partial(Value::empty_object()))
        }));

        mock.configure(&Value::empty_object()).unwrap();
        let prior = Value::Null(Ty::Dynamic);
        let planned = Value::empty_object();
        let err = mock
            .apply_change(&ApplyRequest {
                type_name: "test_instance",
                prior: &prior,
                planned: &planned,
                private: &[],
            })
            .unwrap_err();
        assert!(err.partial.is_some());

        let log = mock.call_log();
        assert_eq!(log.configure, 1);
        assert_eq!(log.apply, 1);
        assert_eq!(log.plan, 0);
    }

    #[test]
    fn test_data_source_default_read() {
        let mock = MockProvider::new(test_provider_schema());
        let config = object(&[("name", Value::string("x"))]);
        let v = mock.read_data_source("test_source", &config).unwrap();
        assert_eq!(v.get_attr("name").unwrap(), Value::string("x"));
        assert!(v.get_attr("id").unwrap().is_known());
    }
}
