use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::rc::Rc;
use std::vec;

use rhai::{Dynamic, FnPtr};

use crate::error::ScriptFailure;
use crate::instance::Instance;

/// Values a handler produced; `()` yields none, an array yields its elements.
pub type HookValues = Vec<Dynamic>;

/// Outcome of one handler step.
pub type HookOutcome = Result<HookValues, ScriptFailure>;

/// A registered callable together with the script that registered it. Named function pointers
/// are resolved against that script's functions first.
#[derive(Debug, Clone)]
pub struct HookHandler {
    pub name: String,
    pub callable: FnPtr,
    pub script: Option<String>,
}

/// Handlers registered per hook name, kept in registration order.
#[derive(Debug, Default, Clone)]
pub struct HookTable {
    hooks: HashMap<String, Vec<HookHandler>>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a host-provided `handler` under `hook`, resolved against the entry script.
    pub fn add(&mut self, hook: &str, name: impl Into<String>, handler: FnPtr) {
        self.add_from(hook, name, handler, None);
    }

    /// Registers `handler` under `hook` on behalf of `script`. Re-using a handler name replaces
    /// the callable and keeps its position.
    pub fn add_from(&mut self, hook: &str, name: impl Into<String>, handler: FnPtr, script: Option<String>) {
        let name = name.into();
        let handlers = self.hooks.entry(hook.to_lowercase()).or_default();
        match handlers.iter_mut().find(|existing| existing.name == name) {
            Some(slot) => {
                slot.callable = handler;
                slot.script = script;
            }
            None => handlers.push(HookHandler { name, callable: handler, script }),
        }
    }

    pub fn remove(&mut self, hook: &str, name: &str) -> bool {
        let key = hook.to_lowercase();
        let Some(handlers) = self.hooks.get_mut(&key) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|existing| existing.name != name);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            self.hooks.remove(&key);
        }
        removed
    }

    /// Ordered copy of the handlers for `hook`, so dispatch is unaffected by registrations
    /// made while it runs.
    pub fn snapshot(&self, hook: &str) -> Vec<HookHandler> {
        self.hooks.get(&hook.to_lowercase()).cloned().unwrap_or_default()
    }

    pub fn handler_names(&self, hook: &str) -> Vec<String> {
        self.hooks
            .get(&hook.to_lowercase())
            .map(|handlers| handlers.iter().map(|handler| handler.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn handler_count(&self, hook: &str) -> usize {
        self.hooks.get(&hook.to_lowercase()).map_or(0, Vec::len)
    }

    pub fn hook_names(&self) -> impl Iterator<Item = &String> {
        self.hooks.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn clear(&mut self) {
        self.hooks.clear();
    }
}

#[derive(Clone, Default)]
pub struct HookTableHandle(Rc<RefCell<HookTable>>);

impl HookTableHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn borrow(&self) -> Ref<'_, HookTable> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, HookTable> {
        self.0.borrow_mut()
    }
}

pub fn into_values(value: Dynamic) -> HookValues {
    if value.is_unit() {
        Vec::new()
    } else if value.is_array() {
        value.cast::<rhai::Array>()
    } else {
        vec![value]
    }
}

/// `()` and `false` are falsy; every other value is truthy.
pub fn is_truthy(value: &Dynamic) -> bool {
    !(value.is_unit() || value.as_bool() == Ok(false))
}

/// Lazy, single-pass dispatch of one hook: one outcome per handler, ending after the first
/// failure or as soon as the instance is errored.
pub struct HookIter<'a> {
    instance: &'a mut Instance,
    hook: String,
    args: Vec<Dynamic>,
    handlers: vec::IntoIter<HookHandler>,
    finished: bool,
}

impl<'a> HookIter<'a> {
    pub(crate) fn new(instance: &'a mut Instance, hook: &str, args: &[Dynamic]) -> Self {
        let handlers = instance.hooks().borrow().snapshot(hook);
        log::debug!("[instance:{}] dispatching '{}' to {} handler(s)", instance.id(), hook, handlers.len());
        Self {
            instance,
            hook: hook.to_lowercase(),
            args: args.to_vec(),
            handlers: handlers.into_iter(),
            finished: false,
        }
    }

    pub fn hook(&self) -> &str {
        &self.hook
    }
}

impl Iterator for HookIter<'_> {
    type Item = HookOutcome;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.instance.is_errored() {
            self.finished = true;
            return None;
        }
        let handler = self.handlers.next()?;
        let outcome = self
            .instance
            .call_handler(&self.hook, &handler.callable, handler.script.as_deref(), self.args.clone())
            .map(into_values);
        if outcome.is_err() {
            self.finished = true;
        }
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(name: &str) -> FnPtr {
        FnPtr::new(name).expect("valid function name")
    }

    #[test]
    fn hook_names_are_case_insensitive_and_ordered() {
        let mut table = HookTable::new();
        table.add("Think", "a", handler("first"));
        table.add("THINK", "b", handler("second"));
        table.add("think", "c", handler("third"));
        assert_eq!(table.handler_names("think"), vec!["a", "b", "c"]);
        assert_eq!(table.handler_count("tHiNk"), 3);
        assert_eq!(table.hook_names().collect::<Vec<_>>(), vec!["think"]);
    }

    #[test]
    fn re_adding_from_another_script_rebinds_the_handler() {
        let mut table = HookTable::new();
        table.add_from("tick", "a", handler("helper"), Some("util".to_string()));
        table.add("tick", "a", handler("helper"));
        let snapshot = table.snapshot("tick");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].script, None);
    }

    #[test]
    fn re_adding_a_handler_keeps_its_slot() {
        let mut table = HookTable::new();
        table.add("tick", "a", handler("first"));
        table.add("tick", "b", handler("second"));
        table.add("tick", "a", handler("replacement"));
        let snapshot = table.snapshot("tick");
        assert_eq!(snapshot[0].name, "a");
        assert_eq!(snapshot[0].callable.fn_name(), "replacement");
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn removing_the_last_handler_drops_the_hook() {
        let mut table = HookTable::new();
        table.add("tick", "a", handler("first"));
        assert!(table.remove("TICK", "a"));
        assert!(!table.remove("tick", "a"));
        assert!(table.is_empty());
        assert!(table.snapshot("tick").is_empty());
    }

    #[test]
    fn values_and_truthiness() {
        assert!(into_values(Dynamic::UNIT).is_empty());
        let array: rhai::Array = vec![Dynamic::TRUE, Dynamic::from("x".to_string())];
        assert_eq!(into_values(Dynamic::from_array(array)).len(), 2);
        assert_eq!(into_values(Dynamic::from(3 as rhai::INT)).len(), 1);
        assert!(!is_truthy(&Dynamic::UNIT));
        assert!(!is_truthy(&Dynamic::FALSE));
        assert!(is_truthy(&Dynamic::from(0 as rhai::INT)));
    }
}
