//! Groundwork - a graph-based provisioning engine
//!
//! Builds a dependency graph from resource declarations, plans it against
//! recorded state and applies the plan through providers with bounded
//! parallelism.

pub mod context;
pub mod declaration;
pub mod error;
pub mod executor;
pub mod graph;
pub mod output;
pub mod planner;
pub mod providers;
pub mod render;
pub mod resource;
pub mod state;

pub use context::RunContext;
pub use error::{ConfigurationError, GroundworkError, StateError};
pub use executor::{ExecuteOptions, Executor, RunReport, RunStatus};
pub use graph::ResourceGraph;
pub use planner::{Action, Plan, Planner};
pub use providers::{Provider, ProviderError, ProviderRegistry};
pub use resource::{ResourceDecl, ResourceId, Target, Value};
pub use state::{FileStateStore, MemoryStateStore, StateRecord, StateStore};
