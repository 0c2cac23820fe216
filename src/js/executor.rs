use std::sync::Arc;

use anyhow::anyhow;
use rquickjs::function::Args as FunctionArgs;
use rquickjs::{Ctx, Function, Object, Value};
use serde_json::Value as JsonValue;

use super::runtime::{capture_exception_message, QuickJsEngine};
use crate::bridge::{NativeModuleDispatcher, ScriptExecutor};
use crate::config::QuickJsConfig;
use crate::error::Result;

/// [`ScriptExecutor`] running on an embedded QuickJS engine.
///
/// Every executor comes with the script half of the bridge (`BatchedBridge`,
/// the callback table and `NativeModules`) already installed.
pub struct QuickJsExecutor {
    engine: QuickJsEngine,
}

impl QuickJsExecutor {
    pub fn new(config: &QuickJsConfig) -> Result<Self> {
        let engine = QuickJsEngine::new(config)?;
        engine.eval(BATCHED_BRIDGE_BOOTSTRAP, "batched-bridge.js")?;
        Ok(Self { engine })
    }

    /// Expose sync native methods to script as `__nativeCallSyncHook`.
    pub fn install_sync_hook(&self, dispatcher: Arc<NativeModuleDispatcher>) -> Result<()> {
        self.engine.with_context(move |ctx| {
            let hook = Function::new(
                ctx.clone(),
                move |module_id: u32, method_id: u32, args_json: String| -> rquickjs::Result<String> {
                    let args: Vec<JsonValue> = serde_json::from_str(&args_json).map_err(|err| {
                        rquickjs::Error::new_from_js_message("string", "arguments", err.to_string())
                    })?;
                    let value = dispatcher
                        .invoke_sync(module_id, method_id, args)
                        .map_err(|err| rquickjs::Error::new_from_js_message("native", "value", err.to_string()))?;
                    serde_json::to_string(&value)
                        .map_err(|err| rquickjs::Error::new_from_js_message("value", "string", err.to_string()))
                },
            )?
            .with_name("__nativeCallSyncHook")?;
            ctx.globals().set("__nativeCallSyncHook", hook)
        })?;
        Ok(())
    }

    pub fn engine(&self) -> &QuickJsEngine {
        &self.engine
    }

    /// Evaluate an application bundle.
    pub fn eval(&self, source: &str, filename: &str) -> Result<()> {
        Ok(self.engine.eval(source, filename)?)
    }

    pub fn eval_with<V>(&self, source: &str, filename: &str) -> Result<V>
    where
        V: for<'js> rquickjs::FromJs<'js>,
    {
        Ok(self.engine.eval_with(source, filename)?)
    }
}

impl ScriptExecutor for QuickJsExecutor {
    fn call(&mut self, module: &str, method: &str, args: JsonValue) -> Result<JsonValue> {
        let args_json = serde_json::to_string(&args)?;
        let outcome = self.engine.with_context(|ctx| {
            match call_global(&ctx, module, method, &args_json) {
                Ok(json) => Ok(Ok(json)),
                Err(rquickjs::Error::Exception) => Ok(Err(capture_exception_message(&ctx)
                    .unwrap_or_else(|| "QuickJS exception".to_string()))),
                Err(err) => Err(err),
            }
        })?;
        let json = outcome.map_err(|message| anyhow!("{module}.{method} threw: {message}"))?;
        match json {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(JsonValue::Null),
        }
    }

    fn set_global_variable(&mut self, name: &str, value: &JsonValue) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.engine.with_context(|ctx| {
            let parsed = ctx.json_parse(json)?;
            ctx.globals().set(name, parsed)
        })?;
        Ok(())
    }

    fn run_pending_jobs(&mut self) -> Result<usize> {
        Ok(self.engine.execute_pending_jobs()?)
    }
}

/// `globalThis[module][method](...args)` with `this` bound to the module object.
/// Returns the JSON text of the result, or `None` when it has no JSON form.
fn call_global(ctx: &Ctx<'_>, module: &str, method: &str, args_json: &str) -> rquickjs::Result<Option<String>> {
    let target: Object = ctx.globals().get(module)?;
    let function: Function = target.get(method)?;
    let args = ctx
        .json_parse(args_json)?
        .into_array()
        .ok_or_else(|| rquickjs::Error::new_from_js("value", "array"))?;

    let mut call_args = FunctionArgs::new(ctx.clone(), args.len());
    call_args.this(target)?;
    for value in args.iter::<Value>() {
        call_args.push_arg(value?)?;
    }
    let result: Value = function.call_arg(call_args)?;

    match ctx.json_stringify(result)? {
        Some(json) => Ok(Some(json.to_string()?)),
        None => Ok(None),
    }
}

/// Script half of the bridge.
///
/// Queues native calls as three parallel arrays, owns the callback table
/// (a callback id can be consumed once) and builds `NativeModules` from
/// `__fbBatchedBridgeConfig`.
const BATCHED_BRIDGE_BOOTSTRAP: &str = r#"
(() => {
    const global = globalThis;
    if (global.BatchedBridge) {
        return;
    }

    let moduleIds = [];
    let methodIds = [];
    let params = [];

    const callbacks = new Map();
    let nextCallbackId = 1;

    const callableModules = [];
    const callableModuleIds = Object.create(null);

    const registerCallback = (fn) => {
        const id = nextCallbackId++;
        callbacks.set(id, { fn, pair: null });
        return id;
    };

    const pairCallbacks = (first, second) => {
        callbacks.get(first).pair = second;
        callbacks.get(second).pair = first;
    };

    const enqueueNativeCall = (moduleId, methodId, args) => {
        moduleIds.push(moduleId);
        methodIds.push(methodId);
        params.push(args);
    };

    // Functions become callback ids. Two function arguments are a
    // success/failure pair: invoking either consumes both.
    const encodeArgs = (args) => {
        const functionIds = [];
        const encoded = args.map((arg) => {
            if (typeof arg !== 'function') {
                return arg;
            }
            const id = registerCallback(arg);
            functionIds.push(id);
            return id;
        });
        if (functionIds.length === 2) {
            pairCallbacks(functionIds[0], functionIds[1]);
        }
        return encoded;
    };

    const callFunction = (moduleId, methodId, args) => {
        const module = callableModules[moduleId];
        if (!module) {
            throw new Error(`unknown callable module ${moduleId}`);
        }
        const method = module.methods[methodId];
        if (!method) {
            throw new Error(`unknown method ${methodId} on callable module ${module.name}`);
        }
        method.apply(module.target, args);
    };

    const invokeCallback = (callbackId, args) => {
        const entry = callbacks.get(callbackId);
        if (!entry) {
            throw new Error(`callback ${callbackId} was already invoked or never existed`);
        }
        callbacks.delete(callbackId);
        if (entry.pair !== null) {
            callbacks.delete(entry.pair);
        }
        entry.fn.apply(null, args);
    };

    const entryPoints = {
        callFunctionReturnFlushedQueue: callFunction,
        invokeCallbackAndReturnFlushedQueue: invokeCallback,
    };

    const BatchedBridge = {
        registerCallableModule(name, target) {
            if (name in callableModuleIds) {
                throw new Error(`callable module ${name} is already registered`);
            }
            const id = callableModules.length;
            const names = Object.keys(target).filter((key) => typeof target[key] === 'function');
            callableModules.push({ name, target, names, methods: names.map((key) => target[key]) });
            callableModuleIds[name] = id;
            return id;
        },

        callableModuleConfig() {
            return callableModules.map((module) => [module.name, module.names]);
        },

        processBatch(batch) {
            // A throwing message must not stop the ones after it. Native calls
            // stay queued for the host to collect with flushedQueue().
            const errors = [];
            for (const message of batch) {
                try {
                    const entryPoint = entryPoints[message.method];
                    if (typeof entryPoint !== 'function') {
                        throw new Error(`unknown bridge entry point ${message.method}`);
                    }
                    entryPoint.apply(null, message.args);
                } catch (error) {
                    errors.push(error && error.message !== undefined ? error.message : String(error));
                }
            }
            if (errors.length > 0) {
                throw new Error(errors.join('; '));
            }
            return BatchedBridge.flushedQueue();
        },

        callFunctionReturnFlushedQueue(moduleId, methodId, args) {
            callFunction(moduleId, methodId, args);
            return BatchedBridge.flushedQueue();
        },

        invokeCallbackAndReturnFlushedQueue(callbackId, args) {
            invokeCallback(callbackId, args);
            return BatchedBridge.flushedQueue();
        },

        flushedQueue() {
            if (moduleIds.length === 0) {
                return null;
            }
            const queue = [moduleIds, methodIds, params];
            moduleIds = [];
            methodIds = [];
            params = [];
            return queue;
        },

        enqueueNativeCall,

        pendingCallbackCount() {
            return callbacks.size;
        },
    };

    const buildNativeModules = (config) => {
        const modules = {};
        const entries = (config && config.remoteModuleConfig) || [];
        entries.forEach((entry, moduleId) => {
            if (!entry) {
                return;
            }
            const [name, methods, syncIds = [], promiseIds = []] = entry;
            const module = {};
            methods.forEach((methodName, methodId) => {
                if (syncIds.includes(methodId)) {
                    module[methodName] = (...args) => {
                        const result = global.__nativeCallSyncHook(moduleId, methodId, JSON.stringify(args));
                        return JSON.parse(result);
                    };
                } else if (promiseIds.includes(methodId)) {
                    module[methodName] = (...args) => new Promise((resolve, reject) => {
                        const resolveId = registerCallback(resolve);
                        const rejectId = registerCallback((error) => {
                            reject(new Error((error && error.message) || 'native promise rejected'));
                        });
                        pairCallbacks(resolveId, rejectId);
                        enqueueNativeCall(moduleId, methodId, encodeArgs(args).concat([resolveId, rejectId]));
                    });
                } else {
                    module[methodName] = (...args) => {
                        enqueueNativeCall(moduleId, methodId, encodeArgs(args));
                    };
                }
            });
            modules[name] = module;
        });
        return modules;
    };

    let nativeModules = null;
    let nativeConfig;
    Object.defineProperty(global, 'NativeModules', {
        configurable: true,
        get() {
            const config = global.__fbBatchedBridgeConfig;
            if (nativeModules === null || config !== nativeConfig) {
                nativeConfig = config;
                nativeModules = buildNativeModules(config);
            }
            return nativeModules;
        },
    });

    global.BatchedBridge = BatchedBridge;
})();
"#;
