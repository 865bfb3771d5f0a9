use std::sync::Arc;

use groundwork::context::RunContext;
use groundwork::declaration;
use groundwork::executor::{ExecuteOptions, Executor, OutcomeStatus, RunStatus};
use groundwork::graph::ResourceGraph;
use groundwork::planner::{Action, Planner};
use async_trait::async_trait;
use groundwork::providers::{Provider, ProviderError, ProviderRegistry, ProviderResponse, ResourceRequest};
use groundwork::providers::simulated::{Failure, Operation, SimulatedProvider};
use groundwork::render::Rendered;
use groundwork::resource::{Attributes, ResourceDecl, ResourceId, Target, Value};
use groundwork::state::{FileStateStore, MemoryStateStore, StateStore};
use groundwork::{ConfigurationError, GroundworkError};
use tokio_util::sync::CancellationToken;

fn options() -> ExecuteOptions {
    ExecuteOptions {
        retry_backoff: std::time::Duration::from_millis(1),
        max_backoff: std::time::Duration::from_millis(5),
        ..ExecuteOptions::default()
    }
}

fn network(name: &str) -> ResourceDecl {
    ResourceDecl::new(ResourceId::new("network", name)).attribute("cidr", Value::literal("10.0.0.0/16"))
}

fn subnet(name: &str, network: &str) -> ResourceDecl {
    ResourceDecl::new(ResourceId::new("subnet", name))
        .attribute("network_id", Value::reference(Target::single("network", network), "id"))
}

/// network.a <- subnet.b <- route_table.c
fn chain() -> Vec<ResourceDecl> {
    vec![
        network("a"),
        subnet("b", "a"),
        ResourceDecl::new(ResourceId::new("route_table", "c"))
            .attribute("subnet_id", Value::reference(Target::single("subnet", "b"), "id")),
    ]
}

async fn apply(
    decls: Vec<ResourceDecl>,
    store: Arc<dyn StateStore>,
    provider: &Arc<SimulatedProvider>,
) -> groundwork::RunReport {
    let ctx = RunContext::prepare(decls, store, options()).unwrap();
    Executor::new(ProviderRegistry::new().with(provider.clone()))
        .apply(&ctx, &CancellationToken::new())
        .await
        .unwrap()
}

#[test]
fn test_edges_union_references_and_explicit_dependencies() {
    let decls = vec![
        network("main"),
        ResourceDecl::new(ResourceId::new("iam_role", "svc")),
        subnet("a", "main").depends_on(Target::single("iam_role", "svc")),
    ];
    let graph = ResourceGraph::build(decls).unwrap();

    let subnet_id = ResourceId::new("subnet", "a");
    let mut deps: Vec<String> = graph
        .dependencies(&subnet_id)
        .into_iter()
        .map(ToString::to_string)
        .collect();
    deps.sort();
    assert_eq!(deps, vec!["iam_role.svc", "network.main"]);
    assert_eq!(graph.edge_count(), 2);
}

#[test]
fn test_cycle_is_reported_with_its_path() {
    let decls = vec![
        ResourceDecl::new(ResourceId::new("network", "a"))
            .attribute("x", Value::reference(Target::single("subnet", "b"), "id")),
        ResourceDecl::new(ResourceId::new("subnet", "b"))
            .attribute("x", Value::reference(Target::single("route_table", "c"), "id")),
        ResourceDecl::new(ResourceId::new("route_table", "c"))
            .attribute("x", Value::reference(Target::single("network", "a"), "id")),
        network("unrelated"),
    ];

    match ResourceGraph::build(decls) {
        Err(ConfigurationError::Cycle { path }) => {
            for member in [
                ResourceId::new("network", "a"),
                ResourceId::new("subnet", "b"),
                ResourceId::new("route_table", "c"),
            ] {
                assert!(path.contains(&member), "{} missing from {:?}", member, path);
            }
            assert!(!path.contains(&ResourceId::new("network", "unrelated")));
            assert_eq!(path.first(), path.last());
            assert_eq!(path.len(), 4);
        }
        other => panic!("expected cycle, got {:?}", other.map(|g| g.len())),
    }
}

#[test]
fn test_order_is_deterministic() {
    let decls = vec![
        network("b"),
        network("a"),
        subnet("y", "a"),
        subnet("x", "b"),
    ];
    let first = Planner::plan(&ResourceGraph::build(decls.clone()).unwrap(), &[]).unwrap();
    for _ in 0..5 {
        let again = Planner::plan(&ResourceGraph::build(decls.clone()).unwrap(), &[]).unwrap();
        assert_eq!(first.order(), again.order());
    }

    let order: Vec<String> = first.order().into_iter().map(ToString::to_string).collect();
    assert_eq!(order, vec!["network.b", "network.a", "subnet.y", "subnet.x"]);
}

#[tokio::test]
async fn test_second_plan_after_apply_is_all_no_op() {
    let provider = Arc::new(SimulatedProvider::new());
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());

    let report = apply(chain(), store.clone(), &provider).await;
    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(store.list().unwrap().len(), 3);

    let ctx = RunContext::prepare(chain(), store, options()).unwrap();
    assert!(!ctx.plan.has_changes());
    assert!(ctx.plan.entries().iter().all(|e| e.action == Action::NoOp));
}

#[tokio::test]
async fn test_destroy_deletes_in_reverse_dependency_order() {
    let provider = Arc::new(SimulatedProvider::new());
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    apply(chain(), store.clone(), &provider).await;

    let ctx = RunContext::destroy(store.clone(), options()).unwrap();
    let report = Executor::new(ProviderRegistry::new().with(provider.clone()))
        .apply(&ctx, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Success);
    let deletes: Vec<String> = provider
        .calls()
        .into_iter()
        .filter(|c| c.operation == Operation::Delete)
        .map(|c| c.resource)
        .collect();
    assert_eq!(deletes, vec!["route_table.c", "subnet.b", "network.a"]);
    assert!(store.list().unwrap().is_empty());
    assert_eq!(provider.object_count(), 0);
}

#[tokio::test]
async fn test_partial_failure_keeps_successes_and_resumes() {
    let provider = Arc::new(SimulatedProvider::new());
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let x = ResourceId::new("network", "x");
    let y = ResourceId::new("network", "y");
    provider.fail(&y, Failure::Reject);

    let decls = vec![network("x"), network("y")];
    let report = apply(decls.clone(), store.clone(), &provider).await;

    assert_eq!(report.status, RunStatus::PartialFailure);
    assert_eq!(report.get(&x).unwrap().status, OutcomeStatus::Applied);
    assert!(matches!(report.get(&y).unwrap().status, OutcomeStatus::Failed { .. }));
    assert!(store.get(&x).unwrap().is_some());
    assert!(store.get(&y).unwrap().is_none());

    provider.clear_failures();
    let ctx = RunContext::prepare(decls, store.clone(), options()).unwrap();
    assert_eq!(ctx.plan.get(&x).unwrap().action, Action::NoOp);
    assert_eq!(ctx.plan.get(&y).unwrap().action, Action::Create);

    let report = Executor::new(ProviderRegistry::new().with(provider.clone()))
        .apply(&ctx, &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_success());
    assert_eq!(provider.calls_for(&x).len(), 1);
    assert_eq!(store.list().unwrap().len(), 2);
}

#[tokio::test]
async fn test_dependent_call_starts_after_network_returns_id() {
    let provider = Arc::new(SimulatedProvider::new().with_latency(std::time::Duration::from_millis(20)));
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let decls = vec![subnet("d", "n"), network("n")];

    let ctx = RunContext::prepare(decls.clone(), store.clone(), options()).unwrap();
    let order: Vec<String> = ctx.plan.order().into_iter().map(ToString::to_string).collect();
    assert_eq!(order, vec!["network.n", "subnet.d"]);

    let report = apply(decls, store.clone(), &provider).await;
    assert!(report.is_success());

    let n = &provider.calls_for(&ResourceId::new("network", "n"))[0];
    let d = &provider.calls_for(&ResourceId::new("subnet", "d"))[0];
    assert!(d.started > n.finished);

    let network = store.get(&ResourceId::new("network", "n")).unwrap().unwrap();
    let subnet = store.get(&ResourceId::new("subnet", "d")).unwrap().unwrap();
    assert_eq!(subnet.attributes["network_id"], serde_json::json!(network.provider_id));
}

#[tokio::test]
async fn test_replacement_is_created_before_old_resource_is_deleted() {
    let provider = Arc::new(SimulatedProvider::new());
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    apply(vec![network("old"), subnet("a", "old")], store.clone(), &provider).await;

    let ctx = RunContext::prepare(vec![network("new"), subnet("a", "new")], store.clone(), options()).unwrap();
    let old = ResourceId::new("network", "old");
    let new = ResourceId::new("network", "new");
    assert_eq!(ctx.plan.get(&new).unwrap().action, Action::Create);
    assert_eq!(ctx.plan.get(&old).unwrap().action, Action::Delete);
    assert_eq!(ctx.plan.get(&ResourceId::new("subnet", "a")).unwrap().action, Action::Update);

    let report = Executor::new(ProviderRegistry::new().with(provider.clone()))
        .apply(&ctx, &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_success());

    let created = provider
        .calls_for(&new)
        .into_iter()
        .find(|c| c.operation == Operation::Create)
        .unwrap();
    let deleted = provider
        .calls_for(&old)
        .into_iter()
        .find(|c| c.operation == Operation::Delete)
        .unwrap();
    assert!(deleted.started > created.finished);

    let subnet = store.get(&ResourceId::new("subnet", "a")).unwrap().unwrap();
    assert_eq!(subnet.dependencies, vec![new.clone()]);
    assert!(store.get(&old).unwrap().is_none());
}

#[tokio::test]
async fn test_unresolved_reference_attempts_nothing() {
    let provider = Arc::new(SimulatedProvider::new());
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let err = RunContext::prepare(vec![network("a"), subnet("b", "missing")], store, options()).unwrap_err();

    assert!(matches!(
        err,
        GroundworkError::Configuration(ConfigurationError::UnresolvedReference { .. })
    ));
    assert!(provider.calls().is_empty());
}

const DOCUMENT: &str = r#"{
    "variables": { "azs": ["eu-west-1a", "eu-west-1b", "eu-west-1c"] },
    "resources": [
        { "type": "network", "name": "main", "attributes": { "cidr": "10.0.0.0/16" } },
        {
            "type": "subnet", "name": "private", "count": "${length(var.azs)}",
            "attributes": {
                "network_id": "${network.main.id}",
                "az": "${var.azs[count.index]}"
            }
        },
        {
            "type": "kubernetes_cluster", "name": "main",
            "attributes": { "subnet_ids": "${subnet.private[*].id}" }
        }
    ]
}"#;

#[tokio::test]
async fn test_document_applies_end_to_end_against_state_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("groundwork.state.json");
    let provider = Arc::new(SimulatedProvider::new());

    let decls = declaration::parse_str(DOCUMENT, &[]).unwrap();
    assert_eq!(decls.len(), 5);

    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::open(&path).unwrap());
    let report = apply(decls.clone(), store, &provider).await;
    assert!(report.is_success());
    assert_eq!(report.summary.applied, 5);

    let reopened = FileStateStore::open(&path).unwrap();
    let cluster = reopened
        .get(&ResourceId::new("kubernetes_cluster", "main"))
        .unwrap()
        .unwrap();
    let subnet_ids = cluster.attributes["subnet_ids"].as_array().unwrap();
    assert_eq!(subnet_ids.len(), 3);
    assert_eq!(cluster.dependencies.len(), 3);
    assert!(cluster.outputs.contains_key("endpoint"));

    let ctx = RunContext::prepare(decls, Arc::new(reopened), options()).unwrap();
    assert!(!ctx.plan.has_changes());
}

#[tokio::test]
async fn test_shrinking_count_deletes_trailing_instance() {
    let provider = Arc::new(SimulatedProvider::new());
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let decls = declaration::parse_str(DOCUMENT, &[]).unwrap();
    apply(decls, store.clone(), &provider).await;

    let overrides = vec![declaration::parse_override(r#"azs=["eu-west-1a","eu-west-1b"]"#).unwrap()];
    let decls = declaration::parse_str(DOCUMENT, &overrides).unwrap();
    let ctx = RunContext::prepare(decls, store.clone(), options()).unwrap();

    let third = ResourceId::indexed("subnet", "private", 2);
    assert_eq!(ctx.plan.get(&third).unwrap().action, Action::Delete);
    assert_eq!(
        ctx.plan.get(&ResourceId::new("kubernetes_cluster", "main")).unwrap().action,
        Action::Update
    );
    assert_eq!(
        ctx.plan.get(&ResourceId::indexed("subnet", "private", 0)).unwrap().action,
        Action::NoOp
    );

    let report = Executor::new(ProviderRegistry::new().with(provider.clone()))
        .apply(&ctx, &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_success());
    assert!(store.get(&third).unwrap().is_none());
}

/// Echoes declared attributes back with `name` upper-cased, the way real
/// APIs normalize values they were given.
#[derive(Default)]
struct NormalizingProvider {
    next: std::sync::atomic::AtomicU64,
}

impl NormalizingProvider {
    fn outputs(provider_id: &str, attributes: &Attributes) -> Attributes {
        let mut outputs = attributes.clone();
        if let Some(serde_json::Value::String(name)) = attributes.get("name") {
            outputs.insert("name".to_string(), serde_json::json!(name.to_uppercase()));
        }
        outputs.insert("id".to_string(), serde_json::json!(provider_id));
        outputs
    }
}

#[async_trait]
impl Provider for NormalizingProvider {
    fn name(&self) -> &str {
        "normalizing"
    }

    fn supports(&self, resource_type: &str) -> bool {
        matches!(resource_type, "network" | "subnet")
    }

    async fn create(&self, request: ResourceRequest<'_>) -> Result<ProviderResponse, ProviderError> {
        let serial = self.next.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let provider_id = format!("{}-{}", request.id.resource_type, serial);
        Ok(ProviderResponse {
            outputs: Self::outputs(&provider_id, request.attributes),
            provider_id,
        })
    }

    async fn read(
        &self,
        _id: &ResourceId,
        _provider_id: &str,
    ) -> Result<Option<ProviderResponse>, ProviderError> {
        Ok(None)
    }

    async fn update(
        &self,
        provider_id: &str,
        request: ResourceRequest<'_>,
    ) -> Result<ProviderResponse, ProviderError> {
        Ok(ProviderResponse {
            provider_id: provider_id.to_string(),
            outputs: Self::outputs(provider_id, request.attributes),
        })
    }

    async fn delete(&self, _id: &ResourceId, _provider_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_apply_sends_the_planned_value_when_outputs_normalize_it() {
    let decls = vec![
        ResourceDecl::new(ResourceId::new("network", "n")).attribute("name", Value::literal("main")),
        ResourceDecl::new(ResourceId::new("subnet", "s"))
            .attribute("label", Value::reference(Target::single("network", "n"), "name")),
    ];
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let subnet = ResourceId::new("subnet", "s");

    let ctx = RunContext::prepare(decls.clone(), store.clone(), options()).unwrap();
    let planned = ctx.plan.get(&subnet).unwrap().rendered["label"].clone();
    assert_eq!(planned, Rendered::Known(serde_json::json!("main")));

    let report = Executor::new(ProviderRegistry::new().with(Arc::new(NormalizingProvider::default())))
        .apply(&ctx, &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_success());

    let record = store.get(&subnet).unwrap().unwrap();
    assert_eq!(Some(&record.attributes["label"]), planned.as_known());

    for _ in 0..2 {
        let ctx = RunContext::prepare(decls.clone(), store.clone(), options()).unwrap();
        assert!(!ctx.plan.has_changes(), "{:?}", ctx.plan.order());
    }
}
