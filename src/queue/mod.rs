//! Single-threaded FIFO lanes.
//!
//! Every runtime domain (scripting, native modules, rendering) gets one lane.
//! Cross-lane interaction only ever happens by posting work through
//! [`MessageQueueThread::run_on_queue`].

mod lane;

use std::sync::Arc;

pub use lane::{default_fault_handler, FaultHandler, Lane, LaneFault, LaneHandle, ShutdownPolicy};

use crate::config::LaneNames;
use crate::error::Result;

/// Object-safe view of a stateless lane, as held by the bridge and the UI sink.
pub trait MessageQueueThread: Send + Sync {
    fn name(&self) -> &str;

    fn run_on_queue(&self, work: Box<dyn FnOnce() + Send>) -> Result<()>;

    fn is_on_thread(&self) -> bool;
}

impl MessageQueueThread for LaneHandle<()> {
    fn name(&self) -> &str {
        LaneHandle::name(self)
    }

    fn run_on_queue(&self, work: Box<dyn FnOnce() + Send>) -> Result<()> {
        LaneHandle::run_on_queue(self, move |_| work())
    }

    fn is_on_thread(&self) -> bool {
        LaneHandle::is_on_thread(self)
    }
}

/// A lane without owned state.
pub type QueueThread = Lane<()>;

impl Lane<()> {
    pub fn start(name: impl Into<String>, fault_handler: FaultHandler) -> Result<Self> {
        Lane::spawn(name, fault_handler, |_| Ok(()))
    }

    /// Shared producer handle, usable wherever a [`MessageQueueThread`] is expected.
    pub fn queue(&self) -> Arc<dyn MessageQueueThread> {
        Arc::new(self.handle().clone())
    }
}

/// The native-modules and rendering lanes of one host.
///
/// The scripting lane is spawned by the host itself because it owns the bridge.
pub struct QueueConfiguration {
    native_modules: QueueThread,
    rendering: QueueThread,
}

impl QueueConfiguration {
    pub fn start(names: &LaneNames, fault_handler: FaultHandler) -> Result<Self> {
        let native_modules = QueueThread::start(names.native_modules.clone(), Arc::clone(&fault_handler))?;
        let rendering = QueueThread::start(names.rendering.clone(), fault_handler)?;
        Ok(Self {
            native_modules,
            rendering,
        })
    }

    pub fn native_modules(&self) -> &QueueThread {
        &self.native_modules
    }

    pub fn rendering(&self) -> &QueueThread {
        &self.rendering
    }

    pub fn shutdown(self, policy: ShutdownPolicy) {
        self.native_modules.shutdown(policy);
        self.rendering.shutdown(policy);
    }
}
