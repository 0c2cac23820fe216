use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use batched_bridge::js::QuickJsExecutor;
use batched_bridge::queue::{default_fault_handler, QueueConfiguration};
use batched_bridge::registry::NativeModuleRegistry;
use batched_bridge::ui::{RenderError, UiCommandSink, UiManagerModule, ViewRenderer, ViewTag};
use batched_bridge::{BridgeConfig, BridgeHost};
use serde_json::Value as JsonValue;
use tracing_subscriber::EnvFilter;

/// Renderer that only records which views exist and logs every update.
#[derive(Default)]
struct TracingRenderer {
    views: HashSet<ViewTag>,
}

impl TracingRenderer {
    fn existing(&self, tag: ViewTag) -> Result<(), RenderError> {
        if self.views.contains(&tag) {
            Ok(())
        } else {
            Err(RenderError::StaleView(tag))
        }
    }
}

impl ViewRenderer<JsonValue> for TracingRenderer {
    fn create_view(&mut self, tag: ViewTag, payload: JsonValue) -> Result<(), RenderError> {
        if !self.views.insert(tag) {
            return Err(RenderError::DuplicateView(tag));
        }
        tracing::info!(target: "ui", tag, %payload, "create view");
        Ok(())
    }

    fn set_children(&mut self, parent: ViewTag, children: &[ViewTag]) -> Result<(), RenderError> {
        self.existing(parent)?;
        for child in children {
            self.existing(*child)?;
        }
        tracing::info!(target: "ui", parent, ?children, "set children");
        Ok(())
    }

    fn remove_view(&mut self, tag: ViewTag) -> Result<(), RenderError> {
        if !self.views.remove(&tag) {
            return Err(RenderError::StaleView(tag));
        }
        tracing::info!(target: "ui", tag, "remove view");
        Ok(())
    }

    fn update_props(&mut self, tag: ViewTag, payload: JsonValue) -> Result<(), RenderError> {
        self.existing(tag)?;
        tracing::info!(target: "ui", tag, %payload, "update props");
        Ok(())
    }

    fn update_layout(&mut self, tag: ViewTag, payload: JsonValue) -> Result<(), RenderError> {
        self.existing(tag)?;
        tracing::info!(target: "ui", tag, %payload, "update layout");
        Ok(())
    }

    fn update_extra_data(&mut self, tag: ViewTag, payload: JsonValue) -> Result<(), RenderError> {
        self.existing(tag)?;
        tracing::info!(target: "ui", tag, %payload, "update extra data");
        Ok(())
    }
}

struct Invocation {
    bundle: PathBuf,
    call: Option<(u32, u32, Vec<JsonValue>)>,
}

fn parse_args() -> Result<Invocation> {
    let mut args = std::env::args().skip(1);
    let Some(bundle) = args.next() else {
        bail!("usage: batched-bridge <bundle.js> [moduleId methodId argsJson]");
    };
    let rest: Vec<String> = args.collect();
    let call = match rest.as_slice() {
        [] => None,
        [module_id, method_id, rest @ ..] if rest.len() <= 1 => {
            let arguments = match rest.first() {
                Some(json) => serde_json::from_str(json).context("argsJson must be a JSON array")?,
                None => Vec::new(),
            };
            Some((
                module_id.parse().context("moduleId must be an integer")?,
                method_id.parse().context("methodId must be an integer")?,
                arguments,
            ))
        }
        _ => bail!("usage: batched-bridge <bundle.js> [moduleId methodId argsJson]"),
    };
    Ok(Invocation {
        bundle: PathBuf::from(bundle),
        call,
    })
}

fn run() -> Result<()> {
    let invocation = parse_args()?;

    let config_path = std::env::var("BRIDGE_CONFIG").ok().map(PathBuf::from);
    let config = BridgeConfig::load(config_path).unwrap_or_else(|err| {
        eprintln!("Failed to load bridge configuration: {err}. Using defaults.");
        BridgeConfig::default()
    });

    let source = std::fs::read_to_string(&invocation.bundle)
        .with_context(|| format!("failed to read {}", invocation.bundle.display()))?;
    let filename = invocation.bundle.display().to_string();

    let fault_handler = default_fault_handler();
    let queues = QueueConfiguration::start(&config.lanes, fault_handler.clone())?;
    let sink = Arc::new(UiCommandSink::new(
        TracingRenderer::default(),
        queues.rendering().queue(),
    ));
    let ui_manager = UiManagerModule::new(sink);

    let mut registry = NativeModuleRegistry::builder();
    registry.register(ui_manager.module_spec())?;

    let host = BridgeHost::start(&config, registry.build(), queues, fault_handler, |context| {
        let executor = QuickJsExecutor::new(&context.config.quickjs)?;
        executor.install_sync_hook(Arc::clone(&context.dispatcher))?;
        Ok(executor)
    })?;

    host.with_bridge(move |bridge| -> batched_bridge::Result<()> {
        bridge.executor().eval(&source, &filename)?;
        // the bundle may have queued native calls at top level
        bridge.flush_script_queue()
    })??;

    if let Some((module_id, method_id, arguments)) = invocation.call {
        host.handle().call_function(module_id, method_id, arguments)?;
    }

    host.settle()?;
    host.shutdown();
    Ok(())
}

fn main() {
    let subscriber_result = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .try_init();
    if subscriber_result.is_err() {
        // tracing was already initialised; continue silently
    }

    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}
