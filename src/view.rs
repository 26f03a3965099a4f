//! Handle to one view.

use crate::api::Engine;
use crate::error::{Error, Result};
use crate::graph::NodeDescriptor;
use crate::scheduler::ViewStatus;
use crate::subscription::{ChangeStream, Subscription};
use crate::types::{ColumnDef, Delta, NodeId, Row, ViewConfig};

/// A registered view, returned by [`Engine::create_view`].
///
/// The handle is a convenience over the engine: it holds no data, and keeps
/// working only while the view exists. After [`Engine::remove`] its reads
/// return `Error::NotFound`.
#[derive(Debug, Clone)]
pub struct ViewHandle {
    engine: Engine,
    id: NodeId,
    config: ViewConfig,
    outputs: Vec<ColumnDef>,
}

impl ViewHandle {
    pub(crate) fn new(engine: Engine, id: NodeId, config: ViewConfig, outputs: Vec<ColumnDef>) -> Self {
        Self {
            engine,
            id,
            config,
            outputs,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn config(&self) -> &ViewConfig {
        &self.config
    }

    /// Output column names: pivots first, then `<column>_<function>`.
    pub fn columns(&self) -> Vec<&str> {
        self.outputs.iter().map(|c| c.name.as_str()).collect()
    }

    /// Output columns with their types.
    pub fn schema(&self) -> &[ColumnDef] {
        &self.outputs
    }

    /// Rows of the last successful refresh, in sort order.
    pub async fn snapshot(&self) -> Result<Vec<Row>> {
        self.engine.query(&self.id).await
    }

    pub async fn row_count(&self) -> Result<usize> {
        self.engine.row_count(&self.id).await
    }

    /// The view's node descriptor.
    ///
    /// # Errors
    ///
    /// `Error::NotFound` once the view has been removed.
    pub async fn info(&self) -> Result<NodeDescriptor> {
        self.engine
            .node(&self.id)
            .await?
            .ok_or_else(|| Error::NotFound(self.id.to_string()))
    }

    pub async fn status(&self) -> Result<ViewStatus> {
        self.engine.view_status(&self.id).await
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Delta) + Send + Sync + 'static,
    {
        self.engine.subscribe(&self.id, callback)
    }

    pub fn watch(&self) -> ChangeStream {
        self.engine.watch(&self.id)
    }
}
