use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::{json, Value as JsonValue};
use tracing::{debug, error};

use crate::bridge::{Invocation, InvocationError};
use crate::error::{BridgeError, Result};

/// How the scripting side calls a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// Fire-and-forget through the batched queue. Results reach script only via callbacks.
    Async,
    /// Called inline from the scripting lane; the return value goes straight back.
    Sync,
    /// Batched like `Async`, but the last two arguments are resolve/reject callback ids
    /// and the method's result settles exactly one of them.
    Promise,
}

pub type NativeMethod =
    Arc<dyn Fn(Invocation) -> std::result::Result<JsonValue, InvocationError> + Send + Sync>;

pub type BatchCompleteHook = Arc<dyn Fn() + Send + Sync>;

pub struct MethodDescriptor {
    method_id: u32,
    name: String,
    kind: MethodKind,
    invoke: NativeMethod,
}

impl MethodDescriptor {
    pub fn method_id(&self) -> u32 {
        self.method_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    pub fn invoke(&self, invocation: Invocation) -> std::result::Result<JsonValue, InvocationError> {
        (self.invoke)(invocation)
    }
}

pub struct ModuleDescriptor {
    module_id: u32,
    name: String,
    methods: Vec<MethodDescriptor>,
    on_batch_complete: Option<BatchCompleteHook>,
}

impl ModuleDescriptor {
    pub fn module_id(&self) -> u32 {
        self.module_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    pub fn method(&self, method_id: u32) -> Option<&MethodDescriptor> {
        self.methods.get(method_id as usize)
    }
}

/// A module as authored by native code, before ids are assigned.
pub struct ModuleSpec {
    name: String,
    methods: Vec<(String, MethodKind, NativeMethod)>,
    on_batch_complete: Option<BatchCompleteHook>,
}

impl ModuleSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            on_batch_complete: None,
        }
    }

    /// Append a method; its id is its position in the module.
    pub fn method<F>(mut self, name: impl Into<String>, kind: MethodKind, invoke: F) -> Self
    where
        F: Fn(Invocation) -> std::result::Result<JsonValue, InvocationError> + Send + Sync + 'static,
    {
        self.methods.push((name.into(), kind, Arc::new(invoke)));
        self
    }

    /// Run `hook` on the native-modules lane after every flushed batch.
    pub fn on_batch_complete<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_batch_complete = Some(Arc::new(hook));
        self
    }
}

/// Append-only startup phase of the registry.
#[derive(Default)]
pub struct RegistryBuilder {
    modules: Vec<ModuleDescriptor>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module and return its id.
    pub fn register(&mut self, spec: ModuleSpec) -> Result<u32> {
        if spec.name.trim().is_empty() {
            return Err(BridgeError::InvalidArgument("module name is empty".to_string()));
        }
        if self.modules.iter().any(|module| module.name == spec.name) {
            return Err(BridgeError::InvalidArgument(format!(
                "module {} is already registered",
                spec.name
            )));
        }
        let mut seen = HashSet::new();
        if let Some((duplicate, _, _)) = spec.methods.iter().find(|(name, _, _)| !seen.insert(name)) {
            return Err(BridgeError::InvalidArgument(format!(
                "method {}.{duplicate} is declared twice",
                spec.name
            )));
        }

        let module_id = u32::try_from(self.modules.len())
            .map_err(|_| BridgeError::InvalidArgument("too many modules".to_string()))?;
        let methods = spec
            .methods
            .into_iter()
            .enumerate()
            .map(|(index, (name, kind, invoke))| MethodDescriptor {
                method_id: index as u32,
                name,
                kind,
                invoke,
            })
            .collect();

        debug!(target: "bridge", module = %spec.name, module_id, "registered native module");
        self.modules.push(ModuleDescriptor {
            module_id,
            name: spec.name,
            methods,
            on_batch_complete: spec.on_batch_complete,
        });
        Ok(module_id)
    }

    pub fn build(self) -> NativeModuleRegistry {
        NativeModuleRegistry {
            modules: self.modules,
        }
    }
}

/// Immutable `(moduleId, methodId)` routing table.
///
/// Both runtimes address modules by integer id only, so ids must never move
/// once the registry is built.
pub struct NativeModuleRegistry {
    modules: Vec<ModuleDescriptor>,
}

impl NativeModuleRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn resolve(&self, module_id: u32, method_id: u32) -> Result<(&ModuleDescriptor, &MethodDescriptor)> {
        let module = self
            .module(module_id)
            .ok_or(BridgeError::UnknownModule(module_id))?;
        let method = module.method(method_id).ok_or_else(|| BridgeError::UnknownMethod {
            module: module.name.clone(),
            method_id,
        })?;
        Ok((module, method))
    }

    pub fn module(&self, module_id: u32) -> Option<&ModuleDescriptor> {
        self.modules.get(module_id as usize)
    }

    pub fn module_id(&self, name: &str) -> Option<u32> {
        self.modules
            .iter()
            .find(|module| module.name == name)
            .map(|module| module.module_id)
    }

    pub fn modules(&self) -> &[ModuleDescriptor] {
        &self.modules
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Run every batch-complete hook in module id order.
    pub fn notify_batch_complete(&self) {
        for module in &self.modules {
            let Some(hook) = &module.on_batch_complete else {
                continue;
            };
            if catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
                error!(target: "bridge", module = %module.name, "batch complete hook panicked");
            }
        }
    }

    /// Module table for the scripting side, installed as `__fbBatchedBridgeConfig`.
    ///
    /// Each entry is `[name, [methodNames], [syncMethodIds], [promiseMethodIds]]`,
    /// positioned at its module id.
    pub fn module_config(&self) -> JsonValue {
        let modules: Vec<JsonValue> = self
            .modules
            .iter()
            .map(|module| {
                let names: Vec<&str> = module.methods.iter().map(|m| m.name.as_str()).collect();
                let ids_of = |kind: MethodKind| -> Vec<u32> {
                    module
                        .methods
                        .iter()
                        .filter(|m| m.kind == kind)
                        .map(|m| m.method_id)
                        .collect()
                };
                json!([
                    module.name,
                    names,
                    ids_of(MethodKind::Sync),
                    ids_of(MethodKind::Promise)
                ])
            })
            .collect();
        json!({ "remoteModuleConfig": modules })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop(_: Invocation) -> std::result::Result<JsonValue, InvocationError> {
        Ok(JsonValue::Null)
    }

    fn timing_and_network() -> NativeModuleRegistry {
        let mut builder = NativeModuleRegistry::builder();
        builder
            .register(ModuleSpec::new("Timing").method("createTimer", MethodKind::Async, noop))
            .unwrap();
        builder
            .register(
                ModuleSpec::new("Network")
                    .method("sendRequest", MethodKind::Promise, noop)
                    .method("isOnline", MethodKind::Sync, noop),
            )
            .unwrap();
        builder.build()
    }

    #[test]
    fn resolves_by_position() {
        let registry = timing_and_network();
        let (module, method) = registry.resolve(1, 1).unwrap();
        assert_eq!(module.name(), "Network");
        assert_eq!(method.name(), "isOnline");
        assert_eq!(method.kind(), MethodKind::Sync);
        assert_eq!(registry.module_id("Timing"), Some(0));
    }

    #[test]
    fn unknown_method_and_module() {
        let registry = timing_and_network();
        assert!(matches!(
            registry.resolve(1, 99),
            Err(BridgeError::UnknownMethod { module, method_id: 99 }) if module == "Network"
        ));
        assert!(matches!(registry.resolve(5, 0), Err(BridgeError::UnknownModule(5))));
    }

    #[test]
    fn rejects_duplicates() {
        let mut builder = RegistryBuilder::new();
        builder.register(ModuleSpec::new("Timing")).unwrap();
        assert!(builder.register(ModuleSpec::new("Timing")).is_err());
        assert!(builder
            .register(
                ModuleSpec::new("Other")
                    .method("a", MethodKind::Async, noop)
                    .method("a", MethodKind::Sync, noop)
            )
            .is_err());
        assert!(builder.register(ModuleSpec::new(" ")).is_err());
    }

    #[test]
    fn module_config_lists_kinds() {
        let registry = timing_and_network();
        assert_eq!(
            registry.module_config(),
            json!({
                "remoteModuleConfig": [
                    ["Timing", ["createTimer"], [], []],
                    ["Network", ["sendRequest", "isOnline"], [1], [0]],
                ]
            })
        );
    }

    #[test]
    fn batch_complete_hooks_survive_panics() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let mut builder = RegistryBuilder::new();
        builder
            .register(ModuleSpec::new("Broken").on_batch_complete(|| panic!("hook")))
            .unwrap();
        builder
            .register(ModuleSpec::new("Counter").on_batch_complete(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        builder.build().notify_batch_complete();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
