use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value as JsonValue;
use tracing::{trace, warn};

use super::{UiBatch, UiBatchSink, UiOperation, ViewTag};
use crate::bridge::{Invocation, InvocationError};
use crate::registry::{MethodKind, ModuleSpec};

pub const UI_MANAGER: &str = "UIManager";

/// Native module through which script describes view updates.
///
/// Operations accumulate while a flushed batch runs and go to the sink as one
/// [`UiBatch`] when the batch completes.
pub struct UiManagerModule {
    pending: Mutex<Vec<UiOperation<JsonValue>>>,
    sink: Arc<dyn UiBatchSink<JsonValue>>,
}

impl UiManagerModule {
    pub fn new(sink: Arc<dyn UiBatchSink<JsonValue>>) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(Vec::new()),
            sink,
        })
    }

    /// Registry entry for this module. Method ids follow declaration order.
    pub fn module_spec(self: &Arc<Self>) -> ModuleSpec {
        let flush = Arc::clone(self);
        ModuleSpec::new(UI_MANAGER)
            .method(
                "createView",
                MethodKind::Async,
                self.collect(|invocation| {
                    Ok(UiOperation::Create {
                        tag: invocation.arg(0)?,
                        payload: invocation.arg(1)?,
                    })
                }),
            )
            .method(
                "setChildren",
                MethodKind::Async,
                self.collect(|invocation| {
                    Ok(UiOperation::ManageChildren {
                        parent: invocation.arg(0)?,
                        children: invocation.arg::<Vec<ViewTag>>(1)?,
                    })
                }),
            )
            .method(
                "removeView",
                MethodKind::Async,
                self.collect(|invocation| {
                    Ok(UiOperation::Remove {
                        tag: invocation.arg(0)?,
                    })
                }),
            )
            .method(
                "updateView",
                MethodKind::Async,
                self.collect(|invocation| {
                    Ok(UiOperation::UpdateProps {
                        tag: invocation.arg(0)?,
                        payload: invocation.arg(1)?,
                    })
                }),
            )
            .method(
                "updateLayout",
                MethodKind::Async,
                self.collect(|invocation| {
                    Ok(UiOperation::UpdateLayout {
                        tag: invocation.arg(0)?,
                        payload: invocation.arg(1)?,
                    })
                }),
            )
            .method(
                "updateExtraData",
                MethodKind::Async,
                self.collect(|invocation| {
                    Ok(UiOperation::UpdateExtraData {
                        tag: invocation.arg(0)?,
                        payload: invocation.arg(1)?,
                    })
                }),
            )
            .on_batch_complete(move || flush.flush())
    }

    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    /// Hand everything collected so far to the sink.
    pub fn flush(&self) {
        let operations = std::mem::take(&mut *self.lock_pending());
        if operations.is_empty() {
            return;
        }
        trace!(target: "ui", operations = operations.len(), "dispatching ui batch");
        if let Err(err) = self.sink.dispatch(UiBatch::new(operations)) {
            warn!(target: "ui", error = %err, "dropping ui batch");
        }
    }

    fn collect<F>(
        self: &Arc<Self>,
        build: F,
    ) -> impl Fn(Invocation) -> Result<JsonValue, InvocationError> + Send + Sync + 'static
    where
        F: Fn(&Invocation) -> Result<UiOperation<JsonValue>, InvocationError> + Send + Sync + 'static,
    {
        let this = Arc::clone(self);
        move |invocation| {
            let operation = build(&invocation)?;
            this.lock_pending().push(operation);
            Ok(JsonValue::Null)
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<UiOperation<JsonValue>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
