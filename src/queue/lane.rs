use std::any::Any;
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::error::{BridgeError, Result};

static NEXT_LANE_ID: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static CURRENT_LANE: Cell<Option<u32>> = const { Cell::new(None) };
}

/// What happens to queued work when a lane is asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPolicy {
    /// Run everything enqueued before the request, then stop.
    #[default]
    Drain,
    /// Drop work that has not started yet. Meant for fatal teardown.
    Discard,
}

/// A runnable that panicked on a lane.
#[derive(Debug, Clone)]
pub struct LaneFault {
    pub lane: String,
    pub message: String,
}

/// Process-level sink for lane faults.
pub type FaultHandler = Arc<dyn Fn(&LaneFault) + Send + Sync>;

pub fn default_fault_handler() -> FaultHandler {
    Arc::new(|fault: &LaneFault| {
        error!(target: "lane", lane = %fault.lane, message = %fault.message, "runnable panicked");
    })
}

type Work<S> = Box<dyn FnOnce(&mut S) + Send>;

enum LaneMessage<S> {
    Run(Work<S>),
    Shutdown(ShutdownPolicy),
}

struct LaneShared {
    id: u32,
    name: String,
    closed: AtomicBool,
    discarding: AtomicBool,
    // held shared while enqueueing and exclusively while closing, so nothing
    // can land behind the shutdown marker
    gate: RwLock<()>,
}

/// Cloneable producer side of a lane. Any thread may post work through it.
pub struct LaneHandle<S> {
    shared: Arc<LaneShared>,
    tx: mpsc::UnboundedSender<LaneMessage<S>>,
}

impl<S> Clone for LaneHandle<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            tx: self.tx.clone(),
        }
    }
}

impl<S: 'static> LaneHandle<S> {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// True when the caller is running on this lane's worker thread.
    pub fn is_on_thread(&self) -> bool {
        CURRENT_LANE.with(|current| current.get() == Some(self.shared.id))
    }

    /// Enqueue `work` after everything already posted to this lane.
    pub fn run_on_queue<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let _open = self.shared.gate.read().unwrap_or_else(PoisonError::into_inner);
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(self.closed_error());
        }
        self.tx
            .send(LaneMessage::Run(Box::new(work)))
            .map_err(|_| self.closed_error())
    }

    /// Post `work` and block until it has run, returning its result.
    ///
    /// Must not be called from the lane itself; that would wait on work queued
    /// behind the caller.
    pub fn call<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> T + Send + 'static,
    {
        if self.is_on_thread() {
            return Err(BridgeError::WouldDeadlock(self.shared.name.clone()));
        }
        let (result_tx, result_rx) = oneshot::channel();
        self.run_on_queue(move |state| {
            let _ = result_tx.send(work(state));
        })?;
        // The sender is dropped without a value when the work panics or is discarded.
        result_rx.blocking_recv().map_err(|_| self.closed_error())
    }

    fn request_shutdown(&self, policy: ShutdownPolicy) -> bool {
        // Discard escalates an earlier drain request.
        if policy == ShutdownPolicy::Discard {
            self.shared.discarding.store(true, Ordering::Release);
        }
        let _closing = self.shared.gate.write().unwrap_or_else(PoisonError::into_inner);
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.tx.send(LaneMessage::Shutdown(policy));
        true
    }

    fn closed_error(&self) -> BridgeError {
        BridgeError::QueueClosed(self.shared.name.clone())
    }
}

/// A named single-threaded FIFO executor.
///
/// The worker thread owns a state value of type `S`, built on that thread by
/// the factory passed to [`Lane::spawn`], so `S` does not need to be `Send`.
/// Work items run one at a time to completion, in the order they were posted.
pub struct Lane<S: 'static> {
    handle: LaneHandle<S>,
    join: Option<JoinHandle<()>>,
}

impl<S: 'static> Lane<S> {
    pub fn spawn<F>(name: impl Into<String>, fault_handler: FaultHandler, factory: F) -> Result<Self>
    where
        F: FnOnce(LaneHandle<S>) -> Result<S> + Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(LaneShared {
            id: NEXT_LANE_ID.fetch_add(1, Ordering::SeqCst),
            name: name.clone(),
            closed: AtomicBool::new(false),
            discarding: AtomicBool::new(false),
            gate: RwLock::new(()),
        });
        let handle = LaneHandle { shared, tx };
        let worker_handle = handle.clone();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let shared = Arc::clone(&worker_handle.shared);
                CURRENT_LANE.with(|current| current.set(Some(shared.id)));
                let state = match factory(worker_handle) {
                    Ok(state) => state,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                run_worker(&shared, state, rx, &fault_handler);
            })
            .map_err(|source| BridgeError::Spawn {
                name: name.clone(),
                source,
            })?;

        match ready_rx.blocking_recv() {
            Ok(Ok(())) => {
                debug!(target: "lane", lane = %name, "lane started");
                Ok(Self {
                    handle,
                    join: Some(join),
                })
            }
            Ok(Err(err)) => {
                let _ = join.join();
                Err(err)
            }
            // factory panicked
            Err(_) => {
                let _ = join.join();
                Err(BridgeError::QueueClosed(name))
            }
        }
    }

    pub fn handle(&self) -> &LaneHandle<S> {
        &self.handle
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn is_on_thread(&self) -> bool {
        self.handle.is_on_thread()
    }

    pub fn run_on_queue<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.handle.run_on_queue(work)
    }

    pub fn call<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> T + Send + 'static,
    {
        self.handle.call(work)
    }

    /// Stop the lane and wait for its worker to exit.
    pub fn shutdown(mut self, policy: ShutdownPolicy) {
        self.stop(policy, true);
    }

    fn stop(&mut self, policy: ShutdownPolicy, wait: bool) {
        self.handle.request_shutdown(policy);
        let Some(join) = self.join.take() else {
            return;
        };
        if !wait || self.handle.is_on_thread() {
            return;
        }
        if join.join().is_err() {
            warn!(target: "lane", lane = %self.handle.name(), "lane worker exited abnormally");
        }
    }
}

impl<S: 'static> Drop for Lane<S> {
    fn drop(&mut self) {
        self.stop(ShutdownPolicy::Drain, false);
    }
}

fn run_worker<S>(
    shared: &LaneShared,
    mut state: S,
    mut rx: mpsc::UnboundedReceiver<LaneMessage<S>>,
    fault_handler: &FaultHandler,
) {
    let mut discarded = 0usize;
    while let Some(message) = rx.blocking_recv() {
        match message {
            LaneMessage::Run(work) => {
                if shared.discarding.load(Ordering::Acquire) {
                    discarded += 1;
                    continue;
                }
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| work(&mut state))) {
                    fault_handler(&LaneFault {
                        lane: shared.name.clone(),
                        message: panic_message(payload.as_ref()),
                    });
                }
            }
            LaneMessage::Shutdown(policy) => {
                debug!(target: "lane", lane = %shared.name, ?policy, discarded, "lane stopping");
                break;
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "non-string panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn state_is_built_on_the_lane() {
        let lane = Lane::spawn("state-test", default_fault_handler(), |handle: LaneHandle<Vec<u32>>| {
            assert!(handle.is_on_thread());
            Ok(vec![1])
        })
        .unwrap();
        assert!(!lane.is_on_thread());
        lane.run_on_queue(|state| state.push(2)).unwrap();
        let snapshot = lane.call(|state| state.clone()).unwrap();
        assert_eq!(snapshot, vec![1, 2]);
        lane.shutdown(ShutdownPolicy::Drain);
    }

    #[test]
    fn factory_error_fails_spawn() {
        let result = Lane::<()>::spawn("failing", default_fault_handler(), |_| {
            Err(BridgeError::InvalidArgument("nope".to_string()))
        });
        assert!(matches!(result, Err(BridgeError::InvalidArgument(_))));
    }

    #[test]
    fn call_from_own_lane_is_rejected() {
        let lane = Lane::<()>::spawn("reentrant", default_fault_handler(), |_| Ok(())).unwrap();
        let handle = lane.handle().clone();
        let nested = lane.call(move |_| handle.call(|_| ())).unwrap();
        assert!(matches!(nested, Err(BridgeError::WouldDeadlock(_))));
    }

    #[test]
    fn panic_is_reported_and_lane_survives() {
        let faults = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&faults);
        let handler: FaultHandler = Arc::new(move |fault: &LaneFault| {
            sink.lock().unwrap().push(fault.message.clone());
        });
        let lane = Lane::spawn("panicky", handler, |_| Ok(0u32)).unwrap();
        lane.run_on_queue(|_| panic!("boom")).unwrap();
        lane.run_on_queue(|count| *count += 1).unwrap();
        assert_eq!(lane.call(|count| *count).unwrap(), 1);
        assert_eq!(faults.lock().unwrap().as_slice(), ["boom".to_string()]);
    }

    #[test]
    fn closed_lane_rejects_work() {
        let lane = Lane::<()>::spawn("closing", default_fault_handler(), |_| Ok(())).unwrap();
        let handle = lane.handle().clone();
        lane.shutdown(ShutdownPolicy::Drain);
        assert!(matches!(
            handle.run_on_queue(|_| ()),
            Err(BridgeError::QueueClosed(name)) if name == "closing"
        ));
    }
}
