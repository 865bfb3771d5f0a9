//! Applies a plan against providers with bounded parallelism.
//!
//! An entry is dispatched once every entry it waits for has completed
//! successfully. Each confirmed provider call is followed by a durable state
//! write before the entry counts as complete, so a crash never leaves a remote
//! object without a record.

mod retry;

pub use retry::RetryPolicy;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::context::RunContext;
use crate::error::{ConfigurationError, GroundworkError, StateError};
use crate::graph::ResourceGraph;
use crate::planner::{Action, PlanEntry};
use crate::providers::{Provider, ProviderError, ProviderRegistry, ResourceRequest};
use crate::render::{self, Rendered, Resolver};
use crate::resource::{Attributes, Reference, ResourceId, Selector};
use crate::state::{StateRecord, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Maximum number of entries in flight at once.
    pub parallelism: usize,
    pub operation_timeout: Option<Duration>,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            parallelism: 10,
            operation_timeout: None,
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl ExecuteOptions {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: self.retry_backoff,
            max_backoff: self.max_backoff,
            timeout: self.operation_timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Applied,
    Unchanged,
    Failed { error: String },
    Skipped { blocked_by: ResourceId },
    Cancelled,
}

impl OutcomeStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Unchanged => "unchanged",
            Self::Failed { .. } => "failed",
            Self::Skipped { .. } => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub id: ResourceId,
    pub action: Action,
    #[serde(flatten)]
    pub status: OutcomeStatus,
    pub attempts: u32,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

fn as_millis<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialFailure,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub applied: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub summary: RunSummary,
    /// One outcome per plan entry, in plan order.
    pub outcomes: Vec<Outcome>,
}

impl RunReport {
    fn new(outcomes: Vec<Outcome>) -> Self {
        let mut summary = RunSummary::default();
        for outcome in &outcomes {
            match outcome.status {
                OutcomeStatus::Applied => summary.applied += 1,
                OutcomeStatus::Unchanged => summary.unchanged += 1,
                OutcomeStatus::Failed { .. } => summary.failed += 1,
                OutcomeStatus::Skipped { .. } => summary.skipped += 1,
                OutcomeStatus::Cancelled => summary.cancelled += 1,
            }
        }
        let status = if summary.failed > 0 || summary.skipped > 0 {
            RunStatus::PartialFailure
        } else if summary.cancelled > 0 {
            RunStatus::Cancelled
        } else {
            RunStatus::Success
        };
        Self {
            status,
            summary,
            outcomes,
        }
    }

    pub fn get(&self, id: &ResourceId) -> Option<&Outcome> {
        self.outcomes.iter().find(|o| &o.id == id)
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// Everything a worker needs, owned so it can move into a task.
struct Job {
    index: usize,
    entry: PlanEntry,
    attributes: Attributes,
    provider: Option<Arc<dyn Provider>>,
    store: Arc<dyn StateStore>,
    retry: RetryPolicy,
}

struct Completion {
    provider_id: Option<String>,
    /// Values dependents may reference; `None` once the resource is deleted.
    exposed: Option<Attributes>,
    attempts: u32,
}

struct JobFailure {
    error: String,
    attempts: u32,
    /// Set to the provider id when the provider succeeded but the state
    /// write did not.
    state_lost: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Executor {
    registry: ProviderRegistry,
}

impl Executor {
    pub fn new(registry: ProviderRegistry) -> Self {
        Self { registry }
    }

    pub async fn apply(
        &self,
        context: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<RunReport, GroundworkError> {
        let entries = context.plan.entries();
        let providers = self.preflight(entries)?;
        let retry = context.options.retry_policy();
        let parallelism = context.options.parallelism.max(1);

        let mut exposed: HashMap<ResourceId, Attributes> = context
            .store
            .list()?
            .into_iter()
            .map(|record| (record.id.clone(), record.exposed()))
            .collect();

        let positions: HashMap<&ResourceId, usize> =
            entries.iter().enumerate().map(|(i, e)| (&e.id, i)).collect();
        let mut waiting = vec![0usize; entries.len()];
        let mut dependents = vec![Vec::new(); entries.len()];
        for (i, entry) in entries.iter().enumerate() {
            for dep in &entry.wait_for {
                if let Some(&d) = positions.get(dep) {
                    waiting[i] += 1;
                    dependents[d].push(i);
                }
            }
        }

        let mut ready: BTreeSet<usize> = (0..entries.len()).filter(|&i| waiting[i] == 0).collect();
        let mut outcomes: Vec<Option<Outcome>> = vec![None; entries.len()];
        let mut started: Vec<Option<Instant>> = vec![None; entries.len()];
        let mut tasks: JoinSet<(usize, Result<Completion, JobFailure>)> = JoinSet::new();
        let mut halted = false;

        tracing::info!(entries = entries.len(), parallelism, "apply started");

        loop {
            while !halted && !cancel.is_cancelled() && tasks.len() < parallelism {
                let Some(index) = ready.pop_first() else {
                    break;
                };
                let entry = &entries[index];
                let attributes = match dispatch_attributes(&context.graph, entry, &exposed) {
                    Ok(attributes) => attributes,
                    Err(error) => {
                        tracing::error!(resource = %entry.id, error = %error, "cannot render attributes");
                        outcomes[index] = Some(outcome(entry, OutcomeStatus::Failed { error }, 0, Duration::ZERO, None));
                        skip_dependents(index, entries, &dependents, &mut outcomes);
                        continue;
                    }
                };

                if entry.action.is_change() {
                    tracing::info!(resource = %entry.id, action = %entry.action, "applying");
                }
                started[index] = Some(Instant::now());
                let job = Job {
                    index,
                    entry: entry.clone(),
                    attributes,
                    provider: providers[index].clone(),
                    store: Arc::clone(&context.store),
                    retry,
                };
                tasks.spawn(async move {
                    let index = job.index;
                    (index, perform(job).await)
                });
            }

            if tasks.is_empty() {
                break;
            }

            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled(), if !halted => {
                    tracing::warn!(in_flight = tasks.len(), "cancellation requested, waiting for in-flight operations");
                    halted = true;
                    continue;
                }
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };
            let (index, result) = joined.map_err(|e| {
                GroundworkError::Io(std::io::Error::other(format!("worker task failed: {}", e)))
            })?;

            let entry = &entries[index];
            let elapsed = started[index].map(|s| s.elapsed()).unwrap_or_default();
            match result {
                Ok(done) => {
                    let status = if entry.action.is_change() {
                        tracing::info!(
                            resource = %entry.id,
                            action = %entry.action,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "applied"
                        );
                        OutcomeStatus::Applied
                    } else {
                        OutcomeStatus::Unchanged
                    };
                    match done.exposed {
                        Some(values) => {
                            exposed.insert(entry.id.clone(), values);
                        }
                        None => {
                            exposed.remove(&entry.id);
                        }
                    }
                    outcomes[index] = Some(outcome(entry, status, done.attempts, elapsed, done.provider_id));
                    for &next in &dependents[index] {
                        waiting[next] -= 1;
                        if waiting[next] == 0 && outcomes[next].is_none() {
                            ready.insert(next);
                        }
                    }
                }
                Err(failure) => {
                    tracing::error!(
                        resource = %entry.id,
                        action = %entry.action,
                        attempts = failure.attempts,
                        error = %failure.error,
                        "operation failed"
                    );
                    if failure.state_lost.is_some() {
                        halted = true;
                    }
                    outcomes[index] = Some(outcome(
                        entry,
                        OutcomeStatus::Failed {
                            error: failure.error,
                        },
                        failure.attempts,
                        elapsed,
                        failure.state_lost,
                    ));
                    skip_dependents(index, entries, &dependents, &mut outcomes);
                }
            }
        }

        let outcomes: Vec<Outcome> = outcomes
            .into_iter()
            .zip(entries)
            .map(|(outcome_slot, entry)| {
                outcome_slot.unwrap_or_else(|| outcome(entry, OutcomeStatus::Cancelled, 0, Duration::ZERO, None))
            })
            .collect();

        let report = RunReport::new(outcomes);
        tracing::info!(
            status = ?report.status,
            applied = report.summary.applied,
            failed = report.summary.failed,
            skipped = report.summary.skipped,
            cancelled = report.summary.cancelled,
            "apply finished"
        );
        Ok(report)
    }

    /// Every entry that mutates must have a provider before anything runs.
    fn preflight(&self, entries: &[PlanEntry]) -> Result<Vec<Option<Arc<dyn Provider>>>, ConfigurationError> {
        entries
            .iter()
            .map(|entry| {
                if !entry.action.is_change() {
                    return Ok(None);
                }
                self.registry
                    .provider_for(&entry.id.resource_type)
                    .map(Some)
                    .ok_or_else(|| ConfigurationError::UnsupportedResourceType {
                        id: entry.id.clone(),
                        resource_type: entry.id.resource_type.clone(),
                    })
            })
            .collect()
    }
}

fn outcome(
    entry: &PlanEntry,
    status: OutcomeStatus,
    attempts: u32,
    elapsed: Duration,
    provider_id: Option<String>,
) -> Outcome {
    Outcome {
        id: entry.id.clone(),
        action: entry.action,
        status,
        attempts,
        elapsed,
        provider_id: provider_id.or_else(|| entry.provider_id().map(str::to_string)),
    }
}

fn skip_dependents(
    failed: usize,
    entries: &[PlanEntry],
    dependents: &[Vec<usize>],
    outcomes: &mut [Option<Outcome>],
) {
    let blocked_by = entries[failed].id.clone();
    let mut stack = dependents[failed].clone();
    while let Some(next) = stack.pop() {
        if outcomes[next].is_some() {
            continue;
        }
        tracing::warn!(resource = %entries[next].id, blocked_by = %blocked_by, "skipped");
        outcomes[next] = Some(outcome(
            &entries[next],
            OutcomeStatus::Skipped {
                blocked_by: blocked_by.clone(),
            },
            0,
            Duration::ZERO,
            None,
        ));
        stack.extend(dependents[next].iter().copied());
    }
}

/// Renders an entry's declared attributes against completed dependencies.
fn dispatch_attributes(
    graph: &ResourceGraph,
    entry: &PlanEntry,
    exposed: &HashMap<ResourceId, Attributes>,
) -> Result<Attributes, String> {
    if !matches!(entry.action, Action::Create | Action::Update) {
        return Ok(entry
            .prior
            .as_ref()
            .map(|p| p.attributes.clone())
            .unwrap_or_default());
    }
    let decl = graph
        .get(&entry.id)
        .ok_or_else(|| format!("{} is not declared", entry.id))?;
    let resolver = ApplyResolver {
        from: &entry.id,
        graph,
        exposed,
    };
    let rendered = render::render_attributes(&decl.attributes, &resolver).map_err(|e| e.to_string())?;
    render::all_known(&rendered).ok_or_else(|| {
        format!(
            "values still unknown at apply time: {}",
            render::unknown_names(&rendered).join(", ")
        )
    })
}

struct ApplyResolver<'a> {
    from: &'a ResourceId,
    graph: &'a ResourceGraph,
    exposed: &'a HashMap<ResourceId, Attributes>,
}

impl ApplyResolver<'_> {
    fn resolve_at(&self, position: usize, attribute: &str) -> Result<Rendered, ConfigurationError> {
        let target = &self.graph.node(position).id;
        let Some(values) = self.exposed.get(target) else {
            return Ok(Rendered::Unknown);
        };
        values
            .get(attribute)
            .map(|value| Rendered::Known(value.clone()))
            .ok_or_else(|| ConfigurationError::UnsupportedAttribute {
                from: self.from.clone(),
                target: target.clone(),
                attribute: attribute.to_string(),
            })
    }
}

impl Resolver for ApplyResolver<'_> {
    fn resolve(&self, reference: &Reference) -> Result<Rendered, ConfigurationError> {
        let positions = self.graph.resolve_reference(self.from, &reference.target)?;
        if reference.target.selector != Selector::All {
            return match positions.first() {
                Some(&position) => self.resolve_at(position, &reference.attribute),
                None => Ok(Rendered::Unknown),
            };
        }
        let mut values = Vec::with_capacity(positions.len());
        for position in positions {
            match self.resolve_at(position, &reference.attribute)? {
                Rendered::Known(value) => values.push(value),
                Rendered::Unknown => return Ok(Rendered::Unknown),
            }
        }
        Ok(Rendered::Known(serde_json::Value::Array(values)))
    }
}

async fn write_state(
    store: &Arc<dyn StateStore>,
    write: impl FnOnce(&dyn StateStore) -> Result<(), StateError> + Send + 'static,
) -> Result<(), StateError> {
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || write(store.as_ref()))
        .await
        .map_err(|e| StateError::Io(std::io::Error::other(e.to_string())))?
}

// NOTE: A rebind is one commit so state never holds both identities.
fn commit_record(
    store: &dyn StateStore,
    record: StateRecord,
    moved_from: Option<ResourceId>,
) -> Result<(), StateError> {
    match moved_from {
        Some(old) => store.replace(&old, record),
        None => store.put(record),
    }
}

async fn perform(job: Job) -> Result<Completion, JobFailure> {
    let Job {
        entry,
        attributes,
        provider,
        store,
        retry,
        ..
    } = job;

    let provider_failure = |error: ProviderError, attempts: u32| JobFailure {
        error: error.to_string(),
        attempts,
        state_lost: None,
    };
    let state_failure = |error: StateError, attempts: u32, provider_id: &str| {
        tracing::error!(
            resource = %entry.id,
            provider_id = %provider_id,
            error = %error,
            "provider change confirmed but state write failed; reconcile manually"
        );
        JobFailure {
            error: format!("state write failed after provider change ({}): {}", provider_id, error),
            attempts,
            state_lost: Some(provider_id.to_string()),
        }
    };
    let missing_provider = || JobFailure {
        error: format!("no provider for {}", entry.id.resource_type),
        attempts: 0,
        state_lost: None,
    };

    match entry.action {
        Action::Create | Action::Update => {
            let provider = provider.as_ref().ok_or_else(missing_provider)?;
            let request = ResourceRequest {
                id: &entry.id,
                attributes: &attributes,
            };
            let (result, attempts) = match entry.provider_id() {
                Some(provider_id) if entry.action == Action::Update => {
                    retry.run(&entry.id, || provider.update(provider_id, request)).await
                }
                _ => retry.run(&entry.id, || provider.create(request)).await,
            };
            let (provider_id, outputs) = result
                .map_err(|e| provider_failure(e, attempts))?
                .into_outputs();

            let record = StateRecord {
                id: entry.id.clone(),
                provider_id: provider_id.clone(),
                attributes,
                outputs,
                dependencies: entry.dependencies.clone(),
            };
            let exposed = record.exposed();
            let moved_from = entry.moved_from.clone();
            write_state(&store, move |store| commit_record(store, record, moved_from))
                .await
                .map_err(|e| state_failure(e, attempts, &provider_id))?;

            Ok(Completion {
                provider_id: Some(provider_id),
                exposed: Some(exposed),
                attempts,
            })
        }
        Action::Delete => {
            let provider = provider.as_ref().ok_or_else(missing_provider)?;
            let provider_id = entry.provider_id().unwrap_or_default().to_string();
            let (result, attempts) = retry
                .run(&entry.id, || provider.delete(&entry.id, &provider_id))
                .await;
            match result {
                Ok(()) => {}
                Err(ProviderError::NotFound { .. }) => {
                    tracing::info!(resource = %entry.id, "already gone remotely");
                }
                Err(e) => return Err(provider_failure(e, attempts)),
            }

            let id = entry.id.clone();
            write_state(&store, move |store| store.delete(&id))
                .await
                .map_err(|e| state_failure(e, attempts, &provider_id))?;

            Ok(Completion {
                provider_id: Some(provider_id),
                exposed: None,
                attempts,
            })
        }
        Action::NoOp => {
            let Some(prior) = entry.prior.clone() else {
                return Ok(Completion {
                    provider_id: None,
                    exposed: None,
                    attempts: 0,
                });
            };
            if entry.rewrites_state() {
                let record = StateRecord {
                    id: entry.id.clone(),
                    dependencies: entry.dependencies.clone(),
                    ..prior.clone()
                };
                let moved_from = entry.moved_from.clone();
                write_state(&store, move |store| commit_record(store, record, moved_from))
                    .await
                    .map_err(|e| state_failure(e, 0, &prior.provider_id))?;
                tracing::debug!(resource = %entry.id, "state record rewritten");
            }
            Ok(Completion {
                provider_id: Some(prior.provider_id.clone()),
                exposed: Some(prior.exposed()),
                attempts: 0,
            })
        }
    }
}
