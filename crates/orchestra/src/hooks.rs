//! Observer hooks.
//!
//! Hooks let a front end watch the walk: one callback pair around each
//! diff, apply, and refresh. For a single node the pre hook always fires
//! before the post hook; callbacks from different nodes interleave freely.
//! Implementations must not reach back into engine state.

use crate::addrs::AbsResourceInstance;
use crate::plan::Action;
use crate::value::Value;

/// Callbacks around per-instance operations. All methods have empty
/// defaults so implementations override only what they watch.
pub trait Hook: Send + Sync {
    fn pre_diff(&self, _addr: &AbsResourceInstance, _prior: &Value) {}
    fn post_diff(&self, _addr: &AbsResourceInstance, _action: Action) {}

    fn pre_apply(&self, _addr: &AbsResourceInstance, _action: Action, _planned: &Value) {}
    fn post_apply(&self, _addr: &AbsResourceInstance, _new: &Value, _error: Option<&str>) {}

    fn pre_refresh(&self, _addr: &AbsResourceInstance, _prior: &Value) {}
    fn post_refresh(&self, _addr: &AbsResourceInstance, _new: &Value) {}
}

/// A hook that does nothing.
pub struct NullHook;

impl Hook for NullHook {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::{ModuleInstance, Resource};
    use std::sync::Mutex;

    /// Hook used across engine tests: records event names in order.
    pub struct RecordingHook {
        pub events: Mutex<Vec<String>>,
    }

    impl Hook for RecordingHook {
        fn pre_apply(&self, addr: &AbsResourceInstance, action: Action, _planned: &Value) {
            self.events
                .lock()
                .unwrap()
                .push(format!("pre_apply {addr} {action}"));
        }

        fn post_apply(&self, addr: &AbsResourceInstance, _new: &Value, error: Option<&str>) {
            self.events
                .lock()
                .unwrap()
                .push(format!("post_apply {addr} err={}", error.is_some()));
        }
    }

    #[test]
    fn test_null_hook_is_callable() {
        let addr = Resource::managed("test_instance", "web")
            .instance(None)
            .absolute(ModuleInstance::root());
        let hook = NullHook;
        hook.pre_diff(&addr, &Value::empty_object());
        hook.post_diff(&addr, Action::Create);
    }

    #[test]
    fn test_recording_hook_orders_events() {
        let addr = Resource::managed("test_instance", "web")
            .instance(None)
            .absolute(ModuleInstance::root());
        let hook = RecordingHook {
            events: Mutex::new(Vec::new()),
        };
        hook.pre_apply(&addr, Action::Create, &Value::empty_object());
        hook.post_apply(&addr, &Value::empty_object(), None);
        let events = hook.events.lock().unwrap();
        assert!(events[0].starts_with("pre_apply"));
        assert!(events[1].starts_with("post_apply"));
    }
}
