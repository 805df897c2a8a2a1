//! End-to-end plan/apply scenarios through the public Context API, using
//! the in-memory mock provider.

use orchestra::addrs::{InstanceKey, ModuleInstance, Resource, Target};
use orchestra::config::Config;
use orchestra::context::{Context, ContextOptions};
use orchestra::plan::Action;
use orchestra::provider::mock::{MockProvider, test_provider_schema};
use orchestra::provider::{ProviderFactory, ProviderFailure, ProviderResolver, SharedProvider};
use orchestra::state::{ObjectStatus, State};
use orchestra::value::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

fn mock_resolver() -> ProviderResolver {
    resolver_with(|| MockProvider::new(test_provider_schema()))
}

fn resolver_with<F>(make: F) -> ProviderResolver
where
    F: Fn() -> MockProvider + Send + Sync + 'static,
{
    let factories: BTreeMap<String, ProviderFactory> = BTreeMap::from([(
        "test".to_string(),
        Arc::new(move || Ok(Arc::new(make()) as SharedProvider)) as ProviderFactory,
    )]);
    ProviderResolver::new(factories)
}

fn config(text: &str) -> Config {
    Config::from_json_str(text).expect("test config parses")
}

fn context(config_text: &str, state: State) -> Context {
    context_with(config_text, state, mock_resolver())
}

fn context_with(config_text: &str, state: State, resolver: ProviderResolver) -> Context {
    Context::new(ContextOptions::new(config(config_text), state, resolver))
        .expect("context builds")
}

fn web_config(ami: &str) -> String {
    format!(
        r#"{{
            "providers": [{{"name": "test"}}],
            "resources": [{{
                "type": "test_instance", "name": "web",
                "config": {{"ami": {{"lit": "{ami}"}}}}
            }}]
        }}"#
    )
}

fn web_addr() -> orchestra::addrs::AbsResourceInstance {
    Resource::managed("test_instance", "web")
        .instance(None)
        .absolute(ModuleInstance::root())
}

#[test]
fn empty_config_empty_state_is_a_noop() {
    let ctx = context(r#"{}"#, State::new());

    let (plan, _, diags) = ctx.plan(false);
    assert!(!diags.has_errors(), "{}", diags.to_report());
    assert!(plan.changes.is_empty());

    let (state, diags) = ctx.apply(&plan);
    assert!(!diags.has_errors(), "{}", diags.to_report());
    assert!(state.is_empty());
}

#[test]
fn create_then_replan_is_noop() {
    let ctx = context(&web_config("ami-1"), State::new());

    let (plan, _, diags) = ctx.plan(false);
    assert!(!diags.has_errors(), "{}", diags.to_report());
    let change = plan.changes.resource_change(&web_addr()).unwrap();
    assert_eq!(change.action, Action::Create);
    assert!(change.before.is_null());
    assert!(change.after.get_attr("id").unwrap().is_unknown());

    let (state, diags) = ctx.apply(&plan);
    assert!(!diags.has_errors(), "{}", diags.to_report());
    let obj = state.instance_object(&web_addr()).unwrap();
    assert_eq!(obj.status, ObjectStatus::Ok);
    assert_eq!(
        obj.value.get_attr("ami").unwrap(),
        Value::string("ami-1")
    );
    // The provider decided the computed attribute during apply.
    assert_eq!(
        obj.value.get_attr("id").unwrap(),
        Value::string("test_instance-1")
    );

    // Idempotence: a second plan over the applied state is all no-ops.
    let ctx2 = context(&web_config("ami-1"), state);
    let (plan2, _, diags) = ctx2.plan(false);
    assert!(!diags.has_errors(), "{}", diags.to_report());
    assert!(plan2.changes.is_empty());
    assert_eq!(
        plan2.changes.resource_change(&web_addr()).unwrap().action,
        Action::NoOp
    );
}

#[test]
fn replan_is_noop_after_state_file_round_trip() {
    use orchestra::state::StateFile;

    let ctx = context(&web_config("ami-1"), State::new());
    let (plan, _, _) = ctx.plan(false);
    let (state, diags) = ctx.apply(&plan);
    assert!(!diags.has_errors(), "{}", diags.to_report());

    // Persisting and reloading must not manufacture diffs.
    let file = StateFile::new(state);
    let reloaded = StateFile::from_json_str(&file.to_json_string().unwrap()).unwrap();
    let ctx = context(&web_config("ami-1"), reloaded.state);
    let (plan, _, diags) = ctx.plan(false);
    assert!(!diags.has_errors(), "{}", diags.to_report());
    assert!(plan.changes.is_empty(), "{:?}", plan.changes.resources);
}

#[test]
fn plan_is_deterministic() {
    let ctx = context(&web_config("ami-1"), State::new());
    let (a, _, da) = ctx.plan(false);
    let (b, _, db) = ctx.plan(false);
    assert_eq!(a, b);
    assert_eq!(da, db);
}

#[test]
fn count_increase_creates_only_new_indices() {
    // Start with count = 1 applied.
    let one = r#"{
        "providers": [{"name": "test"}],
        "resources": [{
            "type": "test_instance", "name": "web",
            "count": {"lit": 1},
            "config": {"ami": {"lit": "ami-1"}}
        }]
    }"#;
    let ctx = context(one, State::new());
    let (plan, _, _) = ctx.plan(false);
    let (state, diags) = ctx.apply(&plan);
    assert!(!diags.has_errors(), "{}", diags.to_report());

    // Grow to 3 with a splat output over the instances.
    let three = r#"{
        "providers": [{"name": "test"}],
        "resources": [{
            "type": "test_instance", "name": "web",
            "count": {"lit": 3},
            "config": {"ami": {"lit": "ami-1"}}
        }],
        "outputs": {
            "ids": {"value": {"splat": {"of": {"ref": "test_instance.web"}, "attr": "id"}}}
        }
    }"#;
    let ctx = context(three, state);
    let (plan, _, diags) = ctx.plan(false);
    assert!(!diags.has_errors(), "{}", diags.to_report());

    let action_of = |i: i64| {
        let addr = Resource::managed("test_instance", "web")
            .instance(Some(InstanceKey::Int(i)))
            .absolute(ModuleInstance::root());
        plan.changes.resource_change(&addr).unwrap().action
    };
    assert_eq!(action_of(0), Action::NoOp);
    assert_eq!(action_of(1), Action::Create);
    assert_eq!(action_of(2), Action::Create);
    assert_eq!(plan.changes.action_counts(), (2, 0, 0));

    let (state, diags) = ctx.apply(&plan);
    assert!(!diags.has_errors(), "{}", diags.to_report());
    assert_eq!(state.all_instance_addrs().len(), 3);
    let ids = state.root_outputs().get("ids").unwrap().value.clone();
    let pairs = ids.iter_pairs().unwrap();
    assert_eq!(pairs.len(), 3);
    assert!(pairs.iter().all(|(_, v)| v.is_known()));
}

#[test]
fn force_new_with_create_before_destroy_replaces_cleanly() {
    // Apply the original object.
    let ctx = context(&web_config("ami-1"), State::new());
    let (plan, _, _) = ctx.plan(false);
    let (state, diags) = ctx.apply(&plan);
    assert!(!diags.has_errors(), "{}", diags.to_report());
    let old_id = state
        .instance_object(&web_addr())
        .unwrap()
        .value
        .get_attr("id")
        .unwrap();

    // Change the force-new attribute under create_before_destroy.
    let replacement = r#"{
        "providers": [{"name": "test"}],
        "resources": [{
            "type": "test_instance", "name": "web",
            "config": {"ami": {"lit": "ami-2"}},
            "lifecycle": {"create_before_destroy": true}
        }]
    }"#;
    let ctx = context(replacement, state);
    let (plan, _, diags) = ctx.plan(false);
    assert!(!diags.has_errors(), "{}", diags.to_report());
    let change = plan.changes.resource_change(&web_addr()).unwrap();
    assert_eq!(change.action, Action::CreateDestroy);
    assert_eq!(change.required_replace, vec!["ami".to_string()]);

    let (state, diags) = ctx.apply(&plan);
    assert!(!diags.has_errors(), "{}", diags.to_report());

    // One current instance, no deposed leftovers, new identity.
    assert_eq!(state.all_instance_addrs().len(), 1);
    assert!(state.all_deposed().is_empty());
    let obj = state.instance_object(&web_addr()).unwrap();
    assert_eq!(obj.value.get_attr("ami").unwrap(), Value::string("ami-2"));
    assert_ne!(obj.value.get_attr("id").unwrap(), old_id);
}

#[test]
fn destroy_plan_with_prevent_destroy_fails() {
    let protected = r#"{
        "providers": [{"name": "test"}],
        "resources": [{
            "type": "test_instance", "name": "web",
            "config": {"ami": {"lit": "ami-1"}},
            "lifecycle": {"prevent_destroy": true}
        }]
    }"#;
    let ctx = context(protected, State::new());
    let (plan, _, _) = ctx.plan(false);
    let (state, diags) = ctx.apply(&plan);
    assert!(!diags.has_errors(), "{}", diags.to_report());

    let ctx = context(protected, state);
    let (_, _, diags) = ctx.plan(true);
    assert!(diags.has_errors());
    let report = diags.to_report();
    assert!(report.contains("prevent_destroy"), "{report}");
    assert!(report.contains("test_instance.web"), "{report}");
}

#[test]
fn replace_of_protected_instance_fails_at_plan() {
    let protected = |ami: &str| {
        format!(
            r#"{{
                "providers": [{{"name": "test"}}],
                "resources": [{{
                    "type": "test_instance", "name": "web",
                    "config": {{"ami": {{"lit": "{ami}"}}}},
                    "lifecycle": {{"prevent_destroy": true}}
                }}]
            }}"#
        )
    };
    let ctx = context(&protected("ami-1"), State::new());
    let (plan, _, _) = ctx.plan(false);
    let (state, _) = ctx.apply(&plan);

    // Changing a force-new attribute means destroy, which is forbidden.
    let ctx = context(&protected("ami-2"), state);
    let (_, _, diags) = ctx.plan(false);
    assert!(diags.has_errors());
    assert!(diags.to_report().contains("prevent_destroy"));
}

#[test]
fn failed_apply_keeps_peers_and_taints_the_victim() {
    let two = r#"{
        "providers": [{"name": "test"}],
        "resources": [
            {"type": "test_instance", "name": "a", "config": {"ami": {"lit": "boom"}}},
            {"type": "test_instance", "name": "b", "config": {"ami": {"lit": "ami-1"}}}
        ]
    }"#;
    let failing = resolver_with(|| {
        let mut mock = MockProvider::new(test_provider_schema());
        mock.apply_fn = Some(Box::new(|req| {
            if req.planned.is_null() {
                // Destroys succeed.
                return Ok(orchestra::provider::ApplyResponse {
                    new_state: Value::Null(orchestra::Ty::Dynamic),
                    private: Vec::new(),
                });
            }
            match req.planned.get_attr("ami") {
                Ok(ami) if ami == Value::string("boom") => Err(ProviderFailure::new(
                    "the requested image does not exist",
                )
                .with_partial(req.planned.clone())),
                _ => Ok(orchestra::provider::ApplyResponse {
                    new_state: Value::Object(
                        [
                            ("ami".to_string(), req.planned.get_attr("ami").unwrap()),
                            ("id".to_string(), Value::string("i-ok")),
                            (
                                "size".to_string(),
                                Value::Null(orchestra::Ty::Number),
                            ),
                        ]
                        .into(),
                    ),
                    private: Vec::new(),
                }),
            }
        }));
        mock
    });

    let ctx = context_with(two, State::new(), failing);
    let (plan, _, diags) = ctx.plan(false);
    assert!(!diags.has_errors(), "{}", diags.to_report());

    let (state, diags) = ctx.apply(&plan);
    assert!(diags.has_errors());
    assert!(diags.to_report().contains("does not exist"));

    let a = Resource::managed("test_instance", "a")
        .instance(None)
        .absolute(ModuleInstance::root());
    let b = Resource::managed("test_instance", "b")
        .instance(None)
        .absolute(ModuleInstance::root());

    // The independent peer still applied.
    let b_obj = state.instance_object(&b).unwrap();
    assert_eq!(b_obj.status, ObjectStatus::Ok);
    // The victim recorded its partial object as tainted, which forces
    // recreation on the next plan.
    let a_obj = state.instance_object(&a).unwrap();
    assert_eq!(a_obj.status, ObjectStatus::Tainted);

    let ctx = context(two, state);
    let (plan, _, _) = ctx.plan(false);
    assert!(plan.changes.resource_change(&a).unwrap().action.is_replace());
}

#[test]
fn orphaned_instances_are_destroyed() {
    // Two instances applied, then one removed from configuration.
    let two = r#"{
        "providers": [{"name": "test"}],
        "resources": [
            {"type": "test_instance", "name": "a", "config": {"ami": {"lit": "ami-1"}}},
            {"type": "test_instance", "name": "b", "config": {"ami": {"lit": "ami-1"}}}
        ]
    }"#;
    let ctx = context(two, State::new());
    let (plan, _, _) = ctx.plan(false);
    let (state, diags) = ctx.apply(&plan);
    assert!(!diags.has_errors(), "{}", diags.to_report());

    let only_a = r#"{
        "providers": [{"name": "test"}],
        "resources": [
            {"type": "test_instance", "name": "a", "config": {"ami": {"lit": "ami-1"}}}
        ]
    }"#;
    let ctx = context(only_a, state);
    let (plan, _, diags) = ctx.plan(false);
    assert!(!diags.has_errors(), "{}", diags.to_report());

    let b = Resource::managed("test_instance", "b")
        .instance(None)
        .absolute(ModuleInstance::root());
    assert_eq!(plan.changes.resource_change(&b).unwrap().action, Action::Delete);

    let (state, diags) = ctx.apply(&plan);
    assert!(!diags.has_errors(), "{}", diags.to_report());
    assert!(state.instance_object(&b).is_none());
    assert_eq!(state.all_instance_addrs().len(), 1);
}

#[test]
fn destroy_removes_everything_including_outputs() {
    let with_output = r#"{
        "providers": [{"name": "test"}],
        "resources": [{
            "type": "test_instance", "name": "web",
            "config": {"ami": {"lit": "ami-1"}}
        }],
        "outputs": {"ip": {"value": {"ref": "test_instance.web.id"}}}
    }"#;
    let ctx = context(with_output, State::new());
    let (plan, _, _) = ctx.plan(false);
    let (state, diags) = ctx.apply(&plan);
    assert!(!diags.has_errors(), "{}", diags.to_report());
    assert!(!state.root_outputs().is_empty());

    let ctx = context(with_output, state);
    let (state, diags) = ctx.destroy();
    assert!(!diags.has_errors(), "{}", diags.to_report());
    assert!(state.is_empty());
    assert!(state.root_outputs().is_empty());
}

#[test]
fn targeting_limits_the_change_set() {
    let two = r#"{
        "providers": [{"name": "test"}],
        "resources": [
            {"type": "test_instance", "name": "a", "config": {"ami": {"lit": "ami-1"}}},
            {"type": "test_instance", "name": "b", "config": {"ami": {"lit": "ami-1"}}}
        ]
    }"#;
    let mut options = ContextOptions::new(config(two), State::new(), mock_resolver());
    options.targets = vec![Target::parse("test_instance.a").unwrap()];
    let ctx = Context::new(options).unwrap();

    let (plan, _, diags) = ctx.plan(false);
    assert!(!diags.has_errors(), "{}", diags.to_report());
    assert_eq!(plan.changes.resources.len(), 1);
    assert_eq!(
        plan.changes.resources[0].addr.instance.resource.name,
        "a"
    );

    let (state, diags) = ctx.apply(&plan);
    assert!(!diags.has_errors(), "{}", diags.to_report());
    assert_eq!(state.all_instance_addrs().len(), 1);
}

#[test]
fn cross_resource_references_resolve_after_dependency_applies() {
    let chained = r#"{
        "providers": [{"name": "test"}],
        "resources": [
            {"type": "test_instance", "name": "base", "config": {"ami": {"lit": "ami-1"}}},
            {"type": "test_instance", "name": "child",
             "config": {"ami": {"ref": "test_instance.base.id"}}}
        ]
    }"#;
    let ctx = context(chained, State::new());
    let (plan, _, diags) = ctx.plan(false);
    assert!(!diags.has_errors(), "{}", diags.to_report());

    let child = Resource::managed("test_instance", "child")
        .instance(None)
        .absolute(ModuleInstance::root());
    // At plan time the reference is unknown; apply resolves it to the
    // id the base got.
    let planned_ami = plan
        .changes
        .resource_change(&child)
        .unwrap()
        .after
        .get_attr("ami")
        .unwrap();
    assert!(planned_ami.is_unknown());

    let (state, diags) = ctx.apply(&plan);
    assert!(!diags.has_errors(), "{}", diags.to_report());
    let base_id = state
        .instance_object(
            &Resource::managed("test_instance", "base")
                .instance(None)
                .absolute(ModuleInstance::root()),
        )
        .unwrap()
        .value
        .get_attr("id")
        .unwrap();
    let child_ami = state
        .instance_object(&child)
        .unwrap()
        .value
        .get_attr("ami")
        .unwrap();
    assert_eq!(child_ami, base_id);

    // Unknown monotonicity: values known at plan time survived apply.
    let base_change_ami = plan
        .changes
        .resource_change(
            &Resource::managed("test_instance", "base")
                .instance(None)
                .absolute(ModuleInstance::root()),
        )
        .unwrap()
        .after
        .get_attr("ami")
        .unwrap();
    assert_eq!(
        state
            .instance_object(
                &Resource::managed("test_instance", "base")
                    .instance(None)
                    .absolute(ModuleInstance::root())
            )
            .unwrap()
            .value
            .get_attr("ami")
            .unwrap(),
        base_change_ami
    );
}

#[test]
fn data_sources_read_during_plan_when_known() {
    let with_data = r#"{
        "providers": [{"name": "test"}],
        "resources": [
            {"mode": "data", "type": "test_source", "name": "lookup",
             "config": {"name": {"lit": "shared"}}},
            {"type": "test_instance", "name": "web",
             "config": {"ami": {"ref": "data.test_source.lookup.id"}}}
        ]
    }"#;
    let ctx = context(with_data, State::new());
    let (plan, _, diags) = ctx.plan(false);
    assert!(!diags.has_errors(), "{}", diags.to_report());

    // The data read happened during plan, so the dependent resource
    // plans against a concrete value.
    let web = plan.changes.resource_change(&web_addr()).unwrap();
    assert!(web.after.get_attr("ami").unwrap().is_known());

    let (state, diags) = ctx.apply(&plan);
    assert!(!diags.has_errors(), "{}", diags.to_report());
    let data_addr = Resource::data("test_source", "lookup")
        .instance(None)
        .absolute(ModuleInstance::root());
    assert!(state.instance_object(&data_addr).is_some());
}

#[test]
fn module_outputs_flow_to_the_root() {
    let with_module = r#"{
        "providers": [{"name": "test"}],
        "module_calls": {
            "app": {
                "inputs": {"image": {"lit": "ami-mod"}},
                "module": {
                    "variables": {"image": {"type": "string"}},
                    "resources": [{
                        "type": "test_instance", "name": "inner",
                        "config": {"ami": {"ref": "var.image"}}
                    }],
                    "outputs": {"inner_id": {"value": {"ref": "test_instance.inner.id"}}}
                }
            }
        },
        "outputs": {"from_module": {"value": {"ref": "module.app.inner_id"}}}
    }"#;
    let ctx = context(with_module, State::new());
    let (plan, _, diags) = ctx.plan(false);
    assert!(!diags.has_errors(), "{}", diags.to_report());

    let inner = Resource::managed("test_instance", "inner")
        .instance(None)
        .absolute(ModuleInstance::root().child("app", None));
    assert_eq!(
        plan.changes.resource_change(&inner).unwrap().action,
        Action::Create
    );

    let (state, diags) = ctx.apply(&plan);
    assert!(!diags.has_errors(), "{}", diags.to_report());
    let inner_obj = state.instance_object(&inner).unwrap();
    assert_eq!(
        inner_obj.value.get_attr("ami").unwrap(),
        Value::string("ami-mod")
    );
    let root_out = state.root_outputs().get("from_module").unwrap().value.clone();
    assert_eq!(root_out, inner_obj.value.get_attr("id").unwrap());
}

#[test]
fn schema_version_drift_requires_migration() {
    use orchestra::addrs::LocalProviderConfig;
    use orchestra::state::{InstanceObject, InstanceState, ResourceRecord};
    use orchestra::value::Ty;

    // An instance recorded under a newer schema version than the
    // provider now offers cannot be interpreted.
    let mut state = State::new();
    let record = state
        .modules
        .entry(ModuleInstance::root())
        .or_default()
        .resources
        .entry(Resource::managed("test_instance", "web"))
        .or_insert_with(|| {
            ResourceRecord::new(
                LocalProviderConfig::default_for("test").absolute(ModuleInstance::root()),
            )
        });
    let mut obj = InstanceObject::new(Value::Object(
        [
            ("ami".to_string(), Value::string("ami-1")),
            ("id".to_string(), Value::string("i-1")),
            ("size".to_string(), Value::Null(Ty::Number)),
        ]
        .into(),
    ));
    obj.schema_version = 3;
    record.instances.insert(
        None,
        InstanceState {
            current: Some(obj),
            deposed: BTreeMap::new(),
        },
    );

    let ctx = context(&web_config("ami-1"), state);
    let (_, _, diags) = ctx.plan(false);
    assert!(diags.has_errors());
    let report = diags.to_report();
    assert!(report.contains("schema migration"), "{report}");
    assert!(report.contains("schema version 3"), "{report}");
}

#[test]
fn dynamic_count_is_rejected() {
    // count depending on a computed attribute cannot expand.
    let dynamic = r#"{
        "providers": [{"name": "test"}],
        "resources": [
            {"type": "test_instance", "name": "base", "config": {"ami": {"lit": "ami-1"}}},
            {"type": "test_instance", "name": "web",
             "count": {"call": {"name": "length", "args": [{"ref": "test_instance.base.id"}]}},
             "config": {"ami": {"lit": "ami-1"}}}
        ]
    }"#;
    let ctx = context(dynamic, State::new());
    let (_, _, diags) = ctx.plan(false);
    assert!(diags.has_errors());
    assert!(diags.to_report().contains("count"));
}
