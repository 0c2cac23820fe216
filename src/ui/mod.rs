//! View updates produced by script and applied on the rendering lane.
//!
//! Payloads are opaque to this module; only the producer and the renderer
//! know what a `P` means.

mod manager;
mod sink;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use manager::{UiManagerModule, UI_MANAGER};
pub use sink::{ApplyReport, UiCommandSink};

use crate::error::Result;

pub type ViewTag = u32;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiOperation<P> {
    Create {
        tag: ViewTag,
        payload: P,
    },
    /// Replace the children of `parent`, in order.
    ManageChildren {
        parent: ViewTag,
        children: Vec<ViewTag>,
    },
    Remove {
        tag: ViewTag,
    },
    UpdateProps {
        tag: ViewTag,
        payload: P,
    },
    /// Size-affecting update.
    UpdateLayout {
        tag: ViewTag,
        payload: P,
    },
    /// Aggregated data from virtual descendants, e.g. nested text runs.
    UpdateExtraData {
        tag: ViewTag,
        payload: P,
    },
}

impl<P> UiOperation<P> {
    /// The node this operation is about.
    pub fn tag(&self) -> ViewTag {
        match self {
            Self::Create { tag, .. }
            | Self::Remove { tag }
            | Self::UpdateProps { tag, .. }
            | Self::UpdateLayout { tag, .. }
            | Self::UpdateExtraData { tag, .. } => *tag,
            Self::ManageChildren { parent, .. } => *parent,
        }
    }

    /// Structural operations materialize or tear down nodes.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Create { .. } | Self::ManageChildren { .. } | Self::Remove { .. }
        )
    }
}

/// All view updates produced by one update step.
#[derive(Debug, Clone, PartialEq)]
pub struct UiBatch<P> {
    operations: Vec<UiOperation<P>>,
}

impl<P> UiBatch<P> {
    pub fn new(operations: Vec<UiOperation<P>>) -> Self {
        Self { operations }
    }

    pub fn operations(&self) -> &[UiOperation<P>] {
        &self.operations
    }

    pub fn into_operations(self) -> Vec<UiOperation<P>> {
        self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl<P> From<Vec<UiOperation<P>>> for UiBatch<P> {
    fn from(operations: Vec<UiOperation<P>>) -> Self {
        Self::new(operations)
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("view {0} does not exist")]
    StaleView(ViewTag),
    #[error("view {0} already exists")]
    DuplicateView(ViewTag),
    #[error("{0}")]
    Rejected(String),
}

/// The widget layer. Only ever called on the rendering lane.
pub trait ViewRenderer<P>: Send {
    fn create_view(&mut self, tag: ViewTag, payload: P) -> Result<(), RenderError>;

    fn set_children(&mut self, parent: ViewTag, children: &[ViewTag]) -> Result<(), RenderError>;

    fn remove_view(&mut self, tag: ViewTag) -> Result<(), RenderError>;

    fn update_props(&mut self, tag: ViewTag, payload: P) -> Result<(), RenderError>;

    fn update_layout(&mut self, tag: ViewTag, payload: P) -> Result<(), RenderError>;

    fn update_extra_data(&mut self, tag: ViewTag, payload: P) -> Result<(), RenderError>;
}

/// Something that accepts UI batches for later application.
pub trait UiBatchSink<P>: Send + Sync {
    fn dispatch(&self, batch: UiBatch<P>) -> Result<()>;
}
