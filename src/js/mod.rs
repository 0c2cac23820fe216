//! QuickJS-backed scripting environment.

mod executor;
pub mod runtime;

pub use executor::QuickJsExecutor;
pub use runtime::QuickJsEngine;
