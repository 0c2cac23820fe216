use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use super::{RenderError, UiBatch, UiBatchSink, UiOperation, ViewRenderer, ViewTag};
use crate::error::Result;
use crate::queue::MessageQueueThread;

/// Outcome of applying one batch.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub applied: usize,
    pub failures: Vec<(ViewTag, RenderError)>,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, tag: ViewTag, result: Result<(), RenderError>) {
        match result {
            Ok(()) => self.applied += 1,
            Err(err) => {
                warn!(target: "ui", tag, error = %err, "view update failed");
                self.failures.push((tag, err));
            }
        }
    }
}

struct SinkState<R> {
    renderer: R,
    parents: HashMap<ViewTag, ViewTag>,
    children: HashMap<ViewTag, Vec<ViewTag>>,
}

type PendingUpdates<P> = Vec<(ViewTag, Vec<UiOperation<P>>)>;

impl<R> SinkState<R> {
    fn new(renderer: R) -> Self {
        Self {
            renderer,
            parents: HashMap::new(),
            children: HashMap::new(),
        }
    }

    fn depth(&self, tag: ViewTag) -> usize {
        let mut depth = 0;
        let mut current = tag;
        // bounded walk so a malformed parent map cannot spin forever
        while let Some(parent) = self.parents.get(&current) {
            depth += 1;
            if depth > self.parents.len() {
                break;
            }
            current = *parent;
        }
        depth
    }

    /// Replace the children of `parent`.
    fn adopt(&mut self, parent: ViewTag, children: &[ViewTag]) {
        for old in self.children.remove(&parent).unwrap_or_default() {
            if self.parents.get(&old) == Some(&parent) {
                self.parents.remove(&old);
            }
        }
        for &child in children {
            if let Some(previous) = self.parents.insert(child, parent) {
                if previous != parent {
                    if let Some(siblings) = self.children.get_mut(&previous) {
                        siblings.retain(|sibling| *sibling != child);
                    }
                }
            }
        }
        self.children.insert(parent, children.to_vec());
    }

    /// `root` and every node currently below it.
    fn subtree(&self, root: ViewTag) -> Vec<ViewTag> {
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        let mut nodes = Vec::new();
        while let Some(tag) = stack.pop() {
            if !seen.insert(tag) {
                continue;
            }
            nodes.push(tag);
            if let Some(children) = self.children.get(&tag) {
                stack.extend(children.iter().copied());
            }
        }
        nodes
    }

    fn forget_subtree(&mut self, root: ViewTag) {
        if let Some(parent) = self.parents.get(&root).copied() {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|sibling| *sibling != root);
            }
        }
        for tag in self.subtree(root) {
            self.parents.remove(&tag);
            self.children.remove(&tag);
        }
    }

    /// Apply a batch: structural operations in production order, per-node
    /// updates grouped by node and applied deepest node first.
    ///
    /// Updates are held back until the end of the batch, or until a
    /// `Remove`/`Create` touches a node that still has updates waiting, so no
    /// update moves past a structural operation on its own node.
    fn apply<P>(&mut self, batch: UiBatch<P>) -> ApplyReport
    where
        R: ViewRenderer<P>,
    {
        let mut report = ApplyReport::default();
        let mut updates: PendingUpdates<P> = Vec::new();
        let mut slots: HashMap<ViewTag, usize> = HashMap::new();

        for operation in batch.into_operations() {
            let tag = operation.tag();
            if operation.is_structural() {
                let touched = match &operation {
                    UiOperation::Remove { tag } => self.subtree(*tag),
                    UiOperation::Create { tag, .. } => vec![*tag],
                    _ => Vec::new(),
                };
                if touched.iter().any(|tag| slots.contains_key(tag)) {
                    slots.clear();
                    self.apply_updates(std::mem::take(&mut updates), &mut report);
                }
                let result = self.apply_operation(operation);
                report.record(tag, result);
                continue;
            }
            let slot = *slots.entry(tag).or_insert_with(|| {
                updates.push((tag, Vec::new()));
                updates.len() - 1
            });
            updates[slot].1.push(operation);
        }

        self.apply_updates(updates, &mut report);
        report
    }

    fn apply_updates<P>(&mut self, mut updates: PendingUpdates<P>, report: &mut ApplyReport)
    where
        R: ViewRenderer<P>,
    {
        // stable: siblings at the same depth keep production order
        updates.sort_by_cached_key(|(tag, _)| Reverse(self.depth(*tag)));
        for (tag, operations) in updates {
            for operation in operations {
                let result = self.apply_operation(operation);
                report.record(tag, result);
            }
        }
    }

    fn apply_operation<P>(&mut self, operation: UiOperation<P>) -> Result<(), RenderError>
    where
        R: ViewRenderer<P>,
    {
        match operation {
            UiOperation::Create { tag, payload } => self.renderer.create_view(tag, payload),
            UiOperation::ManageChildren { parent, children } => {
                self.renderer.set_children(parent, &children)?;
                self.adopt(parent, &children);
                Ok(())
            }
            UiOperation::Remove { tag } => {
                self.renderer.remove_view(tag)?;
                self.forget_subtree(tag);
                Ok(())
            }
            UiOperation::UpdateProps { tag, payload } => self.renderer.update_props(tag, payload),
            UiOperation::UpdateLayout { tag, payload } => self.renderer.update_layout(tag, payload),
            UiOperation::UpdateExtraData { tag, payload } => {
                self.renderer.update_extra_data(tag, payload)
            }
        }
    }
}

/// Applies UI batches on the rendering lane.
///
/// The renderer is only touched from work posted to that lane; the mutex
/// exists so the sink itself can be shared with other lanes.
pub struct UiCommandSink<P, R> {
    state: Arc<Mutex<SinkState<R>>>,
    rendering: Arc<dyn MessageQueueThread>,
    _payload: PhantomData<fn(P)>,
}

impl<P, R> UiCommandSink<P, R>
where
    P: Send + 'static,
    R: ViewRenderer<P> + 'static,
{
    pub fn new(renderer: R, rendering: Arc<dyn MessageQueueThread>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SinkState::new(renderer))),
            rendering,
            _payload: PhantomData,
        }
    }

    /// Apply `batch` right now on the calling thread.
    pub fn apply(&self, batch: UiBatch<P>) -> ApplyReport {
        if !self.rendering.is_on_thread() {
            debug!(target: "ui", "applying batch off the rendering lane");
        }
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(batch)
    }

    /// Inspect the renderer, e.g. from the rendering lane after a dispatch.
    pub fn with_renderer<T>(&self, f: impl FnOnce(&R) -> T) -> T {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&state.renderer)
    }
}

impl<P, R> UiBatchSink<P> for UiCommandSink<P, R>
where
    P: Send + 'static,
    R: ViewRenderer<P> + 'static,
{
    /// Post `batch` onto the rendering lane.
    fn dispatch(&self, batch: UiBatch<P>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let state = Arc::clone(&self.state);
        self.rendering.run_on_queue(Box::new(move || {
            let operations = batch.len();
            let report = state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .apply(batch);
            debug!(
                target: "ui",
                operations,
                applied = report.applied,
                failed = report.failures.len(),
                "applied ui batch"
            );
        }))
    }
}
