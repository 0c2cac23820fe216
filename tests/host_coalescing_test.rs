use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use batched_bridge::bridge::ScriptExecutor;
use batched_bridge::error::Result;
use batched_bridge::host::MODULE_CONFIG_GLOBAL;
use batched_bridge::queue::{default_fault_handler, QueueConfiguration};
use batched_bridge::registry::NativeModuleRegistry;
use batched_bridge::{BridgeConfig, BridgeHost};
use serde_json::{json, Value as JsonValue};

/// Records envelope sizes; the first crossing blocks until the test opens the gate.
struct GatedExecutor {
    envelopes: Arc<Mutex<Vec<usize>>>,
    globals: Arc<Mutex<Vec<String>>>,
    entered: mpsc::Sender<()>,
    gate: Option<mpsc::Receiver<()>>,
}

impl ScriptExecutor for GatedExecutor {
    fn call(&mut self, _: &str, method: &str, args: JsonValue) -> Result<JsonValue> {
        if method == "processBatch" {
            let size = args[0].as_array().map_or(0, Vec::len);
            self.envelopes.lock().unwrap().push(size);
        }
        if let Some(gate) = self.gate.take() {
            let _ = self.entered.send(());
            let _ = gate.recv();
        }
        Ok(JsonValue::Null)
    }

    fn set_global_variable(&mut self, name: &str, _: &JsonValue) -> Result<()> {
        self.globals.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

struct Running {
    host: BridgeHost<GatedExecutor>,
    envelopes: Arc<Mutex<Vec<usize>>>,
    globals: Arc<Mutex<Vec<String>>>,
    entered: mpsc::Receiver<()>,
    open: mpsc::Sender<()>,
}

fn start(coalesce_calls: bool) -> Running {
    let config = BridgeConfig {
        coalesce_calls,
        ..BridgeConfig::default()
    };
    let fault_handler = default_fault_handler();
    let queues = QueueConfiguration::start(&config.lanes, fault_handler.clone()).expect("queues");

    let envelopes = Arc::new(Mutex::new(Vec::new()));
    let globals = Arc::new(Mutex::new(Vec::new()));
    let (entered_tx, entered) = mpsc::channel();
    let (open, gate) = mpsc::channel();
    let executor = GatedExecutor {
        envelopes: Arc::clone(&envelopes),
        globals: Arc::clone(&globals),
        entered: entered_tx,
        gate: Some(gate),
    };

    let host = BridgeHost::start(
        &config,
        NativeModuleRegistry::builder().build(),
        queues,
        fault_handler,
        move |_| Ok(executor),
    )
    .expect("host");

    Running {
        host,
        envelopes,
        globals,
        entered,
        open,
    }
}

#[test]
fn module_config_is_installed_before_any_call() {
    let running = start(false);
    assert_eq!(running.globals.lock().unwrap().clone(), vec![MODULE_CONFIG_GLOBAL.to_string()]);
    assert_eq!(running.host.global(MODULE_CONFIG_GLOBAL), Some(json!({"remoteModuleConfig": []})));
    running.host.shutdown();
}

#[test]
fn calls_from_one_lane_turn_share_an_envelope() {
    let running = start(true);
    let handle = running.host.handle();

    handle.call_function(0, 0, vec![json!("first")]).expect("post");
    running.entered.recv().expect("first crossing");
    // the lane is busy, so these land in the same turn
    handle.call_function(0, 1, vec![json!("second")]).expect("post");
    handle.invoke_callback(7, vec![json!("third")]).expect("post");
    running.open.send(()).expect("open gate");

    running.host.settle().expect("settle");
    assert_eq!(running.envelopes.lock().unwrap().clone(), vec![1, 2]);
    running.host.shutdown();
}

#[test]
fn without_coalescing_each_call_crosses_alone() {
    let running = start(false);
    let handle = running.host.handle();

    handle.call_function(0, 0, Vec::new()).expect("post");
    running.entered.recv().expect("first crossing");
    handle.call_function(0, 1, Vec::new()).expect("post");
    handle.invoke_callback(7, Vec::new()).expect("post");
    running.open.send(()).expect("open gate");

    running.host.settle().expect("settle");
    assert_eq!(running.envelopes.lock().unwrap().clone(), vec![1, 1, 1]);
    running.host.shutdown();
}

#[test]
fn calls_accepted_before_shutdown_are_still_shipped() {
    let running = start(true);
    let handle = running.host.handle();

    handle.call_function(0, 0, Vec::new()).expect("post");
    running.entered.recv().expect("first crossing");
    handle.call_function(0, 1, Vec::new()).expect("post");

    // the gate opens only once shutdown has closed the lane
    let open = running.open.clone();
    let opener = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        let _ = open.send(());
    });
    running.host.shutdown();
    opener.join().expect("opener");

    assert_eq!(running.envelopes.lock().unwrap().clone(), vec![1, 1]);
}
