use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

use super::ReactCallback;
use crate::error::{BridgeError, Result};
use crate::registry::{MethodDescriptor, MethodKind, ModuleDescriptor, NativeModuleRegistry};

/// Native-to-script direction of the bridge, as seen from native modules.
///
/// Implementations post onto the scripting lane and return immediately.
pub trait JsInvoker: Send + Sync {
    fn call_function(&self, module_id: u32, method_id: u32, arguments: Vec<JsonValue>) -> Result<()>;

    fn invoke_callback(&self, callback_id: u32, arguments: Vec<JsonValue>) -> Result<()>;
}

/// Failure reported by a native capability.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("missing argument {0}")]
    MissingArgument(usize),
    #[error("argument {index} has an unexpected shape: {source}")]
    BadArgument {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Failed(String),
}

impl InvocationError {
    pub fn failed(message: impl fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }
}

/// A script callback id handed to native code. Invoking it consumes the handle.
pub struct Callback {
    id: u32,
    invoker: Arc<dyn JsInvoker>,
}

impl Callback {
    pub fn new(id: u32, invoker: Arc<dyn JsInvoker>) -> Self {
        Self { id, invoker }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn invoke(self, arguments: Vec<JsonValue>) -> Result<()> {
        self.invoker.invoke_callback(self.id, arguments)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").field("id", &self.id).finish()
    }
}

/// Resolve/reject pair of a promise method. Settling consumes both ids.
#[derive(Debug)]
pub struct Promise {
    resolve: Callback,
    reject: Callback,
}

impl Promise {
    pub fn resolve(self, value: JsonValue) -> Result<()> {
        self.resolve.invoke(vec![value])
    }

    pub fn reject(self, error: &InvocationError) -> Result<()> {
        self.reject.invoke(vec![json!({ "message": error.to_string() })])
    }
}

/// Arguments of one native call plus a way back into script.
pub struct Invocation {
    args: Vec<JsonValue>,
    invoker: Arc<dyn JsInvoker>,
}

impl Invocation {
    pub fn new(args: Vec<JsonValue>, invoker: Arc<dyn JsInvoker>) -> Self {
        Self { args, invoker }
    }

    pub fn args(&self) -> &[JsonValue] {
        &self.args
    }

    pub fn into_args(self) -> Vec<JsonValue> {
        self.args
    }

    /// Deserialize the argument at `index`.
    pub fn arg<'a, T>(&'a self, index: usize) -> std::result::Result<T, InvocationError>
    where
        T: Deserialize<'a>,
    {
        let value = self
            .args
            .get(index)
            .ok_or(InvocationError::MissingArgument(index))?;
        T::deserialize(value).map_err(|source| InvocationError::BadArgument { index, source })
    }

    /// Interpret the argument at `index` as a callback id.
    pub fn callback(&self, index: usize) -> std::result::Result<Callback, InvocationError> {
        let id: u32 = self.arg(index)?;
        Ok(Callback::new(id, Arc::clone(&self.invoker)))
    }

    /// Handle for talking to script after the method has returned.
    pub fn invoker(&self) -> Arc<dyn JsInvoker> {
        Arc::clone(&self.invoker)
    }
}

/// Routes flushed-queue instructions to the capabilities in the registry.
pub struct NativeModuleDispatcher {
    registry: Arc<NativeModuleRegistry>,
    invoker: Arc<dyn JsInvoker>,
}

impl NativeModuleDispatcher {
    pub fn new(registry: Arc<NativeModuleRegistry>, invoker: Arc<dyn JsInvoker>) -> Self {
        Self { registry, invoker }
    }

    pub fn registry(&self) -> &Arc<NativeModuleRegistry> {
        &self.registry
    }

    /// Run a [`MethodKind::Sync`] method inline and return its value.
    pub fn invoke_sync(&self, module_id: u32, method_id: u32, args: Vec<JsonValue>) -> Result<JsonValue> {
        let (module, method) = self.registry.resolve(module_id, method_id)?;
        if method.kind() != MethodKind::Sync {
            return Err(BridgeError::InvalidArgument(format!(
                "{}.{} is not a synchronous method",
                module.name(),
                method.name()
            )));
        }
        method
            .invoke(self.invocation(args))
            .map_err(|err| invocation_failure(module, method, err))
    }

    fn invocation(&self, args: Vec<JsonValue>) -> Invocation {
        Invocation::new(args, Arc::clone(&self.invoker))
    }

    fn split_promise(&self, mut args: Vec<JsonValue>) -> std::result::Result<(Vec<JsonValue>, Promise), InvocationError> {
        let count = args.len();
        if count < 2 {
            return Err(InvocationError::MissingArgument(count));
        }
        let callback_at = |value: JsonValue, index: usize| {
            u32::deserialize(value)
                .map(|id| Callback::new(id, Arc::clone(&self.invoker)))
                .map_err(|source| InvocationError::BadArgument { index, source })
        };
        let reject = args.pop().map(|value| callback_at(value, count - 1));
        let resolve = args.pop().map(|value| callback_at(value, count - 2));
        match (resolve, reject) {
            (Some(resolve), Some(reject)) => Ok((
                args,
                Promise {
                    resolve: resolve?,
                    reject: reject?,
                },
            )),
            _ => Err(InvocationError::MissingArgument(count)),
        }
    }
}

impl ReactCallback for NativeModuleDispatcher {
    fn invoke(&self, module_id: u32, method_id: u32, args: Vec<JsonValue>) -> Result<()> {
        let (module, method) = self.registry.resolve(module_id, method_id)?;
        match method.kind() {
            MethodKind::Async => {
                method
                    .invoke(self.invocation(args))
                    .map_err(|err| invocation_failure(module, method, err))?;
            }
            MethodKind::Sync => {
                let value = method
                    .invoke(self.invocation(args))
                    .map_err(|err| invocation_failure(module, method, err))?;
                if !value.is_null() {
                    debug!(
                        target: "bridge",
                        module = %module.name(),
                        method = %method.name(),
                        "discarding result of sync method called through the queue"
                    );
                }
            }
            MethodKind::Promise => {
                let (args, promise) = self
                    .split_promise(args)
                    .map_err(|err| invocation_failure(module, method, err))?;
                match method.invoke(self.invocation(args)) {
                    Ok(value) => promise.resolve(value)?,
                    Err(err) => {
                        debug!(
                            target: "bridge",
                            module = %module.name(),
                            method = %method.name(),
                            error = %err,
                            "rejecting promise"
                        );
                        promise.reject(&err)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn on_batch_complete(&self) {
        self.registry.notify_batch_complete();
    }
}

fn invocation_failure(module: &ModuleDescriptor, method: &MethodDescriptor, err: InvocationError) -> BridgeError {
    BridgeError::InvocationFailure {
        module: module.name().to_string(),
        method: method.name().to_string(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModuleSpec;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingInvoker {
        callbacks: Mutex<Vec<(u32, Vec<JsonValue>)>>,
    }

    impl JsInvoker for RecordingInvoker {
        fn call_function(&self, _: u32, _: u32, _: Vec<JsonValue>) -> Result<()> {
            Ok(())
        }

        fn invoke_callback(&self, callback_id: u32, arguments: Vec<JsonValue>) -> Result<()> {
            self.callbacks.lock().unwrap().push((callback_id, arguments));
            Ok(())
        }
    }

    fn dispatcher() -> (NativeModuleDispatcher, Arc<RecordingInvoker>) {
        let mut builder = NativeModuleRegistry::builder();
        builder
            .register(
                ModuleSpec::new("Math")
                    .method("double", MethodKind::Promise, |inv| {
                        let value: i64 = inv.arg(0)?;
                        if value < 0 {
                            return Err(InvocationError::failed("negative input"));
                        }
                        Ok(json!(value * 2))
                    })
                    .method("echo", MethodKind::Async, |inv| {
                        let text: String = inv.arg(0)?;
                        inv.callback(1)?
                            .invoke(vec![json!(text)])
                            .map_err(InvocationError::failed)?;
                        Ok(JsonValue::Null)
                    })
                    .method("half", MethodKind::Sync, |_| Ok(json!(0.5))),
            )
            .unwrap();
        let invoker = Arc::new(RecordingInvoker::default());
        let dispatcher = NativeModuleDispatcher::new(Arc::new(builder.build()), invoker.clone());
        (dispatcher, invoker)
    }

    #[test]
    fn async_method_invokes_callback() {
        let (dispatcher, invoker) = dispatcher();
        dispatcher.invoke(0, 1, vec![json!("hi"), json!(9)]).unwrap();
        assert_eq!(*invoker.callbacks.lock().unwrap(), vec![(9, vec![json!("hi")])]);
    }

    #[test]
    fn promise_resolves_or_rejects_exactly_once() {
        let (dispatcher, invoker) = dispatcher();
        dispatcher.invoke(0, 0, vec![json!(21), json!(1), json!(2)]).unwrap();
        dispatcher.invoke(0, 0, vec![json!(-1), json!(3), json!(4)]).unwrap();
        let callbacks = invoker.callbacks.lock().unwrap();
        assert_eq!(callbacks.len(), 2);
        assert_eq!(callbacks[0], (1, vec![json!(42)]));
        assert_eq!(callbacks[1].0, 4);
        assert_eq!(callbacks[1].1[0]["message"], "negative input");
    }

    #[test]
    fn promise_without_callback_ids_fails() {
        let (dispatcher, _) = dispatcher();
        let err = dispatcher.invoke(0, 0, vec![json!(1)]).unwrap_err();
        assert!(matches!(err, BridgeError::InvocationFailure { .. }));
    }

    #[test]
    fn bad_argument_is_an_invocation_failure() {
        let (dispatcher, invoker) = dispatcher();
        let err = dispatcher.invoke(0, 1, vec![json!(5), json!(9)]).unwrap_err();
        match err {
            BridgeError::InvocationFailure { module, method, .. } => {
                assert_eq!(module, "Math");
                assert_eq!(method, "echo");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(invoker.callbacks.lock().unwrap().is_empty());
    }

    #[test]
    fn sync_methods_only_through_sync_hook() {
        let (dispatcher, _) = dispatcher();
        assert_eq!(dispatcher.invoke_sync(0, 2, vec![]).unwrap(), json!(0.5));
        assert!(matches!(
            dispatcher.invoke_sync(0, 1, vec![]),
            Err(BridgeError::InvalidArgument(_))
        ));
    }
}
