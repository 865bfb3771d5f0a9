use std::sync::Arc;

use crate::error::GroundworkError;
use crate::executor::ExecuteOptions;
use crate::graph::ResourceGraph;
use crate::planner::{Plan, Planner};
use crate::resource::ResourceDecl;
use crate::state::StateStore;

/// Everything one run works from, built once and passed explicitly from
/// graph construction through planning to execution.
#[derive(Clone)]
pub struct RunContext {
    pub graph: ResourceGraph,
    pub plan: Plan,
    pub store: Arc<dyn StateStore>,
    pub options: ExecuteOptions,
}

impl RunContext {
    /// Builds the graph and plans it against the store's current records.
    ///
    /// Fails before anything is attempted on configuration or state errors.
    pub fn prepare(
        declarations: Vec<ResourceDecl>,
        store: Arc<dyn StateStore>,
        options: ExecuteOptions,
    ) -> Result<Self, GroundworkError> {
        let graph = ResourceGraph::build(declarations)?;
        let prior = store.list()?;
        let plan = Planner::plan(&graph, &prior)?;
        Ok(Self {
            graph,
            plan,
            store,
            options,
        })
    }

    /// A context that deletes every recorded resource.
    pub fn destroy(store: Arc<dyn StateStore>, options: ExecuteOptions) -> Result<Self, GroundworkError> {
        Self::prepare(Vec::new(), store, options)
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("resources", &self.graph.len())
            .field("plan", &self.plan.summary())
            .field("options", &self.options)
            .finish()
    }
}
