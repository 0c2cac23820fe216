//! The bridge core: ships envelopes into the scripting environment and
//! schedules the native work it asks for.

mod dispatcher;
pub mod protocol;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value as JsonValue;
use tracing::{debug, trace, warn};

pub use dispatcher::{
    Callback, Invocation, InvocationError, JsInvoker, NativeModuleDispatcher, Promise,
};

use self::protocol::{Envelope, FlushedQueue, OutboundMessage, BATCHED_BRIDGE, FLUSHED_QUEUE, PROCESS_BATCH};
use crate::error::{BridgeError, Result};
use crate::queue::MessageQueueThread;

/// Adapter over the scripting environment.
///
/// Executors are single threaded and only ever driven from the scripting lane.
pub trait ScriptExecutor {
    /// Call `globalThis[module][method](...args)` and return its result.
    fn call(&mut self, module: &str, method: &str, args: JsonValue) -> Result<JsonValue>;

    /// Install `value` as a global named `name`, replacing any earlier value.
    fn set_global_variable(&mut self, name: &str, value: &JsonValue) -> Result<()>;

    /// Run deferred script jobs (promise continuations) left over from the last call.
    /// Returns how many ran.
    fn run_pending_jobs(&mut self) -> Result<usize> {
        Ok(0)
    }
}

/// Receiver of decoded native calls on the native-modules lane.
pub trait ReactCallback: Send + Sync {
    fn invoke(&self, module_id: u32, method_id: u32, args: Vec<JsonValue>) -> Result<()>;

    fn on_batch_complete(&self);
}

/// Globals installed into the scripting environment, readable from any lane.
#[derive(Debug, Clone, Default)]
pub struct GlobalVariables {
    values: Arc<RwLock<HashMap<String, JsonValue>>>,
}

impl GlobalVariables {
    pub fn get(&self, name: &str) -> Option<JsonValue> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn insert(&self, name: &str, value: JsonValue) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), value);
    }
}

/// Transport between native code and the scripting environment.
///
/// A bridge lives on the scripting lane. Every crossing is a synchronous call
/// into the executor; the native work it returns is posted as a single unit
/// onto the native-modules lane.
pub struct ReactBridge<E> {
    executor: E,
    callback: Arc<dyn ReactCallback>,
    native_modules_queue: Arc<dyn MessageQueueThread>,
    globals: GlobalVariables,
    pending: Vec<OutboundMessage>,
    flush_scheduled: bool,
}

impl<E: ScriptExecutor> ReactBridge<E> {
    pub fn new(
        executor: E,
        callback: Arc<dyn ReactCallback>,
        native_modules_queue: Arc<dyn MessageQueueThread>,
    ) -> Self {
        Self {
            executor,
            callback,
            native_modules_queue,
            globals: GlobalVariables::default(),
            pending: Vec::new(),
            flush_scheduled: false,
        }
    }

    pub fn with_globals(mut self, globals: GlobalVariables) -> Self {
        self.globals = globals;
        self
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut E {
        &mut self.executor
    }

    pub fn globals(&self) -> &GlobalVariables {
        &self.globals
    }

    /// Call a script module method, then schedule whatever native work it queued.
    pub fn call_function(&mut self, module_id: u32, method_id: u32, arguments: Vec<JsonValue>) -> Result<()> {
        self.ship(Envelope::single(OutboundMessage::call(module_id, method_id, arguments)))
    }

    /// Fulfil a script callback, then schedule whatever native work it queued.
    pub fn invoke_callback(&mut self, callback_id: u32, arguments: Vec<JsonValue>) -> Result<()> {
        self.ship(Envelope::single(OutboundMessage::callback(callback_id, arguments)))
    }

    /// Parse `json_value` and install it as the global `name`.
    ///
    /// An empty name counts as absent and is rejected before the executor is touched.
    pub fn set_global_variable(&mut self, name: &str, json_value: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(BridgeError::InvalidArgument(
                "global variable name is required".to_string(),
            ));
        }
        let value: JsonValue = serde_json::from_str(json_value)?;
        self.executor.set_global_variable(name, &value)?;
        self.globals.insert(name, value);
        Ok(())
    }

    /// Queue a call to go out with the next [`flush`](Self::flush).
    pub fn enqueue_function_call(&mut self, module_id: u32, method_id: u32, arguments: Vec<JsonValue>) {
        self.pending.push(OutboundMessage::call(module_id, method_id, arguments));
    }

    /// Queue a callback to go out with the next [`flush`](Self::flush).
    pub fn enqueue_callback(&mut self, callback_id: u32, arguments: Vec<JsonValue>) {
        self.pending.push(OutboundMessage::callback(callback_id, arguments));
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Ship every queued message in one envelope.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let messages = std::mem::take(&mut self.pending);
        self.ship(Envelope::from_messages(messages))
    }

    /// Collect native calls script queued outside any bridge crossing, such as
    /// during top-level evaluation of a bundle.
    pub fn flush_script_queue(&mut self) -> Result<()> {
        let response = self
            .executor
            .call(BATCHED_BRIDGE, FLUSHED_QUEUE, JsonValue::Array(Vec::new()))?;
        self.process_response(response)
    }

    /// Returns true when the caller should schedule a flush for this lane turn.
    pub(crate) fn claim_flush(&mut self) -> bool {
        !std::mem::replace(&mut self.flush_scheduled, true)
    }

    pub(crate) fn release_flush(&mut self) {
        self.flush_scheduled = false;
    }

    fn ship(&mut self, envelope: Envelope) -> Result<()> {
        trace!(target: "bridge", messages = envelope.len(), "crossing into script");
        let processed = match self
            .executor
            .call(BATCHED_BRIDGE, PROCESS_BATCH, envelope.to_process_batch_args())
        {
            Ok(response) => self.process_response(response),
            Err(err) => {
                // Messages that did run may have queued native calls.
                warn!(target: "bridge", error = %err, "batch raised in script");
                if let Err(flush_err) = self.flush_script_queue() {
                    warn!(target: "bridge", error = %flush_err, "collecting the script queue failed");
                }
                Err(err)
            }
        };

        // Promise continuations may have queued more native calls after the
        // batch returned its queue. They run even when the batch failed.
        let drained = match self.executor.run_pending_jobs() {
            Ok(0) => Ok(()),
            Ok(_) => self.flush_script_queue(),
            Err(err) => Err(err),
        };
        processed.and(drained)
    }

    fn process_response(&self, response: JsonValue) -> Result<()> {
        let Some(queue) = FlushedQueue::decode(response)? else {
            trace!(target: "bridge", "nothing pending in script");
            return Ok(());
        };
        debug!(target: "bridge", calls = queue.len(), "scheduling flushed batch");

        let callback = Arc::clone(&self.callback);
        self.native_modules_queue
            .run_on_queue(Box::new(move || run_batch(callback.as_ref(), queue)))
    }
}

/// Run one flushed batch on the native-modules lane. Failures stay with their
/// own position; the batch always completes.
fn run_batch(callback: &dyn ReactCallback, queue: FlushedQueue) {
    for (index, call) in queue.into_calls().into_iter().enumerate() {
        let (module_id, method_id) = (call.module_id, call.method_id);
        let outcome = catch_unwind(AssertUnwindSafe(|| callback.invoke(module_id, method_id, call.args)));
        let error = match outcome {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => err,
            Err(_) => BridgeError::InvocationFailure {
                module: module_id.to_string(),
                method: method_id.to_string(),
                reason: "native method panicked".to_string(),
            },
        };
        warn!(
            target: "bridge",
            index,
            module_id,
            method_id,
            error = %error,
            "native invocation failed"
        );
    }
    callback.on_batch_complete();
}
