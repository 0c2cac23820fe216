//! Wire format exchanged with the scripting side.
//!
//! Outbound, native code ships an envelope `[[message, ...]]` to
//! `BatchedBridge.processBatch`. Inbound, the scripting side answers with a
//! flushed queue: three parallel arrays `[moduleIds, methodIds, paramsArray]`,
//! or any non-array value when it has nothing queued.

use serde_json::{json, Value as JsonValue};

use crate::error::{BridgeError, Result};

pub const BATCHED_BRIDGE: &str = "BatchedBridge";
pub const PROCESS_BATCH: &str = "processBatch";
pub const CALL_FUNCTION: &str = "callFunctionReturnFlushedQueue";
pub const INVOKE_CALLBACK: &str = "invokeCallbackAndReturnFlushedQueue";
pub const FLUSHED_QUEUE: &str = "flushedQueue";

/// One instruction for the scripting side.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    method: &'static str,
    args: JsonValue,
}

impl OutboundMessage {
    /// `callFunctionReturnFlushedQueue(moduleId, methodId, arguments)`.
    pub fn call(module_id: u32, method_id: u32, arguments: Vec<JsonValue>) -> Self {
        Self {
            method: CALL_FUNCTION,
            args: json!([module_id, method_id, arguments]),
        }
    }

    /// `invokeCallbackAndReturnFlushedQueue(callbackId, arguments)`.
    pub fn callback(callback_id: u32, arguments: Vec<JsonValue>) -> Self {
        Self {
            method: INVOKE_CALLBACK,
            args: json!([callback_id, arguments]),
        }
    }

    pub fn method(&self) -> &str {
        self.method
    }

    pub fn args(&self) -> &JsonValue {
        &self.args
    }

    fn to_json(&self) -> JsonValue {
        json!({
            "module": BATCHED_BRIDGE,
            "method": self.method,
            "args": self.args,
        })
    }
}

/// Everything shipped across the runtime boundary in one crossing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    messages: Vec<OutboundMessage>,
}

impl Envelope {
    pub fn single(message: OutboundMessage) -> Self {
        Self {
            messages: vec![message],
        }
    }

    pub fn from_messages(messages: Vec<OutboundMessage>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[OutboundMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Argument list for `BatchedBridge.processBatch`: one batch holding every message.
    pub fn to_process_batch_args(&self) -> JsonValue {
        let batch: Vec<JsonValue> = self.messages.iter().map(OutboundMessage::to_json).collect();
        JsonValue::Array(vec![JsonValue::Array(batch)])
    }
}

/// A native invocation requested by the scripting side.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeCall {
    pub module_id: u32,
    pub method_id: u32,
    pub args: Vec<JsonValue>,
}

/// Decoded flushed queue; calls are kept in array order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushedQueue {
    calls: Vec<NativeCall>,
}

impl FlushedQueue {
    /// Decode a response. `Ok(None)` means the scripting side had nothing pending.
    pub fn decode(response: JsonValue) -> Result<Option<Self>> {
        let JsonValue::Array(parts) = response else {
            return Ok(None);
        };
        if parts.len() < 3 {
            return Err(violation(format!(
                "expected moduleIds, methodIds and paramsArray, got {} sequences",
                parts.len()
            )));
        }

        // Trailing elements beyond the three sequences are ignored.
        let mut parts = parts.into_iter();
        let module_ids = decode_ids(parts.next(), "moduleIds")?;
        let method_ids = decode_ids(parts.next(), "methodIds")?;
        let params = match parts.next() {
            Some(JsonValue::Array(params)) => params,
            _ => return Err(violation("paramsArray is not an array".to_string())),
        };

        if module_ids.len() != method_ids.len() || module_ids.len() != params.len() {
            return Err(violation(format!(
                "parallel sequences differ in length: moduleIds={} methodIds={} paramsArray={}",
                module_ids.len(),
                method_ids.len(),
                params.len()
            )));
        }

        let calls = module_ids
            .into_iter()
            .zip(method_ids)
            .zip(params)
            .enumerate()
            .map(|(index, ((module_id, method_id), args))| match args {
                JsonValue::Array(args) => Ok(NativeCall {
                    module_id,
                    method_id,
                    args,
                }),
                _ => Err(violation(format!("paramsArray[{index}] is not an array"))),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(Self { calls }))
    }

    pub fn calls(&self) -> &[NativeCall] {
        &self.calls
    }

    pub fn into_calls(self) -> Vec<NativeCall> {
        self.calls
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

fn decode_ids(value: Option<JsonValue>, field: &str) -> Result<Vec<u32>> {
    let Some(JsonValue::Array(items)) = value else {
        return Err(violation(format!("{field} is not an array")));
    };
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            item.as_u64()
                .and_then(|id| u32::try_from(id).ok())
                .ok_or_else(|| violation(format!("{field}[{index}] is not a valid id: {item}")))
        })
        .collect()
}

fn violation(message: String) -> BridgeError {
    BridgeError::ProtocolViolation(message)
}
