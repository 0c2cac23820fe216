// Library exports for the binary and tests

pub mod bridge;
pub mod config;
pub mod error;
pub mod host;
pub mod js;
pub mod queue;
pub mod registry;
pub mod ui;

pub use bridge::{ReactBridge, ReactCallback, ScriptExecutor};
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use host::{BridgeHandle, BridgeHost, ExecutorContext};
pub use queue::{MessageQueueThread, QueueConfiguration};
pub use registry::{MethodKind, ModuleSpec, NativeModuleRegistry};
