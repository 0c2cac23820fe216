//! Wiring of one bridge instance: the scripting lane that owns the bridge,
//! the native-modules and rendering lanes, and the module registry.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, error, info};

use crate::bridge::{GlobalVariables, JsInvoker, NativeModuleDispatcher, ReactBridge, ScriptExecutor};
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::queue::{FaultHandler, Lane, LaneHandle, MessageQueueThread, QueueConfiguration};
use crate::registry::NativeModuleRegistry;

/// Global through which script discovers the native modules.
pub const MODULE_CONFIG_GLOBAL: &str = "__fbBatchedBridgeConfig";

/// What an executor factory gets to work with. The factory runs on the
/// scripting lane, so the executor it builds never leaves that thread.
pub struct ExecutorContext {
    pub config: BridgeConfig,
    pub dispatcher: Arc<NativeModuleDispatcher>,
}

/// A running bridge.
pub struct BridgeHost<E: 'static> {
    config: BridgeConfig,
    scripting: Lane<ReactBridge<E>>,
    queues: QueueConfiguration,
    registry: Arc<NativeModuleRegistry>,
    globals: GlobalVariables,
    handle: BridgeHandle<E>,
}

impl<E: ScriptExecutor + 'static> BridgeHost<E> {
    /// Spawn the scripting lane, build the executor on it and publish the
    /// module config to script before anything else runs there.
    pub fn start<F>(
        config: &BridgeConfig,
        registry: NativeModuleRegistry,
        queues: QueueConfiguration,
        fault_handler: FaultHandler,
        executor_factory: F,
    ) -> Result<Self>
    where
        F: FnOnce(&ExecutorContext) -> Result<E> + Send + 'static,
    {
        let registry = Arc::new(registry);
        let globals = GlobalVariables::default();
        let coalesce = config.coalesce_calls;

        let native_modules_queue = queues.native_modules().queue();
        let lane_registry = Arc::clone(&registry);
        let lane_globals = globals.clone();
        let lane_config = config.clone();
        let scripting = Lane::spawn(
            config.lanes.scripting.clone(),
            fault_handler,
            move |lane: LaneHandle<ReactBridge<E>>| {
                let invoker: Arc<dyn JsInvoker> = Arc::new(BridgeHandle::new(lane, coalesce));
                let dispatcher = Arc::new(NativeModuleDispatcher::new(lane_registry, invoker));
                let context = ExecutorContext {
                    config: lane_config,
                    dispatcher: Arc::clone(&dispatcher),
                };
                let executor = executor_factory(&context)?;

                let module_config = serde_json::to_string(&dispatcher.registry().module_config())?;
                let mut bridge =
                    ReactBridge::new(executor, dispatcher, native_modules_queue).with_globals(lane_globals);
                bridge.set_global_variable(MODULE_CONFIG_GLOBAL, &module_config)?;
                Ok(bridge)
            },
        )?;

        let handle = BridgeHandle::new(scripting.handle().clone(), coalesce);
        info!(
            target: "bridge",
            modules = registry.len(),
            coalesce,
            "bridge host started"
        );
        Ok(Self {
            config: config.clone(),
            scripting,
            queues,
            registry,
            globals,
            handle,
        })
    }

    /// Cloneable handle for calling into script from any thread.
    pub fn handle(&self) -> BridgeHandle<E> {
        self.handle.clone()
    }

    pub fn registry(&self) -> &Arc<NativeModuleRegistry> {
        &self.registry
    }

    pub fn queues(&self) -> &QueueConfiguration {
        &self.queues
    }

    pub fn native_modules_queue(&self) -> Arc<dyn MessageQueueThread> {
        self.queues.native_modules().queue()
    }

    pub fn rendering_queue(&self) -> Arc<dyn MessageQueueThread> {
        self.queues.rendering().queue()
    }

    /// Last value installed for global `name`.
    pub fn global(&self, name: &str) -> Option<JsonValue> {
        self.globals.get(name)
    }

    /// Run `f` against the bridge on the scripting lane and wait for it.
    pub fn with_bridge<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ReactBridge<E>) -> T + Send + 'static,
    {
        self.scripting.call(f)
    }

    /// Block until every lane has worked off what was posted before this call,
    /// including native batches and UI batches those produced.
    pub fn settle(&self) -> Result<()> {
        // ships coalesced calls whose flush is still queued behind this barrier
        self.with_bridge(|bridge| bridge.flush())??;
        self.queues.native_modules().call(|_| ())?;
        self.queues.rendering().call(|_| ())
    }

    /// Stop scripting first so it cannot post further native work, then the
    /// native-modules lane, then rendering.
    pub fn shutdown(self) {
        let policy = self.config.shutdown;
        info!(target: "bridge", ?policy, "bridge host shutting down");
        self.scripting.shutdown(policy);
        self.queues.shutdown(policy);
    }
}

enum Outbound {
    Function {
        module_id: u32,
        method_id: u32,
        arguments: Vec<JsonValue>,
    },
    Callback {
        callback_id: u32,
        arguments: Vec<JsonValue>,
    },
}

/// Producer side of a bridge: posts script calls onto the scripting lane.
///
/// Failures inside script are logged on the scripting lane; the caller only
/// learns whether the call could be posted.
pub struct BridgeHandle<E: 'static> {
    lane: LaneHandle<ReactBridge<E>>,
    coalesce: bool,
}

impl<E: 'static> Clone for BridgeHandle<E> {
    fn clone(&self) -> Self {
        Self {
            lane: self.lane.clone(),
            coalesce: self.coalesce,
        }
    }
}

impl<E: ScriptExecutor + 'static> BridgeHandle<E> {
    fn new(lane: LaneHandle<ReactBridge<E>>, coalesce: bool) -> Self {
        Self { lane, coalesce }
    }

    pub fn call_function(&self, module_id: u32, method_id: u32, arguments: Vec<JsonValue>) -> Result<()> {
        self.post(Outbound::Function {
            module_id,
            method_id,
            arguments,
        })
    }

    pub fn invoke_callback(&self, callback_id: u32, arguments: Vec<JsonValue>) -> Result<()> {
        self.post(Outbound::Callback {
            callback_id,
            arguments,
        })
    }

    pub fn set_global_variable(&self, name: impl Into<String>, json_value: impl Into<String>) -> Result<()> {
        let name = name.into();
        let json_value = json_value.into();
        self.lane.run_on_queue(move |bridge| {
            report(bridge.set_global_variable(&name, &json_value));
        })
    }

    fn post(&self, outbound: Outbound) -> Result<()> {
        if !self.coalesce {
            return self.lane.run_on_queue(move |bridge| {
                let result = match outbound {
                    Outbound::Function {
                        module_id,
                        method_id,
                        arguments,
                    } => bridge.call_function(module_id, method_id, arguments),
                    Outbound::Callback {
                        callback_id,
                        arguments,
                    } => bridge.invoke_callback(callback_id, arguments),
                };
                report(result);
            });
        }

        // Everything posted before the flush runs rides in the same envelope.
        let lane = self.lane.clone();
        self.lane.run_on_queue(move |bridge| {
            match outbound {
                Outbound::Function {
                    module_id,
                    method_id,
                    arguments,
                } => bridge.enqueue_function_call(module_id, method_id, arguments),
                Outbound::Callback {
                    callback_id,
                    arguments,
                } => bridge.enqueue_callback(callback_id, arguments),
            }
            if !bridge.claim_flush() {
                return;
            }
            let posted = lane.run_on_queue(|bridge| {
                bridge.release_flush();
                report(bridge.flush());
            });
            if let Err(err) = posted {
                // the lane is draining for shutdown; ship now instead
                debug!(target: "bridge", error = %err, "flushing inline");
                bridge.release_flush();
                report(bridge.flush());
            }
        })
    }
}

impl<E: ScriptExecutor + 'static> JsInvoker for BridgeHandle<E> {
    fn call_function(&self, module_id: u32, method_id: u32, arguments: Vec<JsonValue>) -> Result<()> {
        BridgeHandle::call_function(self, module_id, method_id, arguments)
    }

    fn invoke_callback(&self, callback_id: u32, arguments: Vec<JsonValue>) -> Result<()> {
        BridgeHandle::invoke_callback(self, callback_id, arguments)
    }
}

fn report(result: Result<()>) {
    if let Err(err) = result {
        error!(target: "bridge", error = %err, "bridge call failed");
    }
}
