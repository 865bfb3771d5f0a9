//! An in-process stand-in for a cloud API.
//!
//! Fabricates identifiers and computed outputs the way a real provider would,
//! and records every call so ordering can be checked after a run.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{Provider, ProviderError, ProviderResponse, ResourceRequest};
use crate::resource::{Attributes, ResourceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub operation: Operation,
    pub resource: String,
    /// Global sequence number taken when the call started.
    pub started: u64,
    /// Global sequence number taken when the call returned.
    pub finished: u64,
    pub succeeded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Every call is rejected.
    Reject,
    /// The first `n` calls fail transiently.
    Transient(u32),
    /// The call never returns.
    Hang,
}

#[derive(Debug, Clone)]
struct SimObject {
    resource_type: String,
    outputs: Attributes,
}

#[derive(Debug, Default)]
pub struct SimulatedProvider {
    objects: Mutex<BTreeMap<String, SimObject>>,
    calls: Mutex<Vec<CallRecord>>,
    failures: Mutex<HashMap<String, Failure>>,
    sequence: AtomicU64,
    next_id: AtomicU64,
    latency: Option<Duration>,
    /// `None` accepts every resource type.
    resource_types: Option<BTreeSet<String>>,
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Limits the provider to the given resource types.
    pub fn with_resource_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resource_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Injects a failure for every call that targets `id`.
    pub fn fail(&self, id: &ResourceId, failure: Failure) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(id.to_string(), failure);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.clear();
        }
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_for(&self, id: &ResourceId) -> Vec<CallRecord> {
        let key = id.to_string();
        self.calls().into_iter().filter(|c| c.resource == key).collect()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or_default()
    }

    fn tick(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn record(&self, operation: Operation, resource: String, started: u64, succeeded: bool) {
        let finished = self.tick();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(CallRecord {
                operation,
                resource,
                started,
                finished,
                succeeded,
            });
        }
    }

    async fn simulate(&self, resource: &str) -> Result<(), ProviderError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let failure = {
            let mut failures = self
                .failures
                .lock()
                .map_err(|_| ProviderError::transient("simulator lock poisoned"))?;
            match failures.get_mut(resource) {
                Some(Failure::Transient(0)) => None,
                Some(Failure::Transient(remaining)) => {
                    *remaining -= 1;
                    Some(Failure::Transient(*remaining + 1))
                }
                other => other.copied(),
            }
        };

        match failure {
            None => Ok(()),
            Some(Failure::Reject) => Err(ProviderError::Rejected {
                message: format!("simulated rejection of {}", resource),
            }),
            Some(Failure::Transient(_)) => Err(ProviderError::transient(format!(
                "simulated throttling of {}",
                resource
            ))),
            Some(Failure::Hang) => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    fn fabricate(&self, request: &ResourceRequest<'_>, provider_id: &str) -> Attributes {
        let id = request.id;
        let mut outputs = Attributes::new();
        outputs.insert("id".to_string(), serde_json::json!(provider_id));
        outputs.insert(
            "arn".to_string(),
            serde_json::json!(format!("sim:{}:{}", id.resource_type, provider_id)),
        );

        let ty = id.resource_type.as_str();
        if ty.contains("registry") {
            outputs.insert(
                "url".to_string(),
                serde_json::json!(format!("{}.registry.sim.local", id.name)),
            );
        }
        if ty.contains("cluster") {
            outputs.insert(
                "endpoint".to_string(),
                serde_json::json!(format!("https://{}.k8s.sim.local", provider_id)),
            );
        }
        if ty.contains("nat_gateway") || ty.contains("elastic_ip") {
            let octet = self.next_id.load(Ordering::SeqCst) % 250 + 1;
            outputs.insert(
                "public_ip".to_string(),
                serde_json::json!(format!("203.0.113.{}", octet)),
            );
        }
        outputs
    }

    fn store(&self, provider_id: &str, resource_type: &str, outputs: &Attributes) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(
                provider_id.to_string(),
                SimObject {
                    resource_type: resource_type.to_string(),
                    outputs: outputs.clone(),
                },
            );
        }
    }
}

fn short_type(resource_type: &str) -> String {
    resource_type
        .split('_')
        .filter_map(|part| part.chars().next())
        .collect()
}

#[async_trait]
impl Provider for SimulatedProvider {
    fn name(&self) -> &str {
        "simulated"
    }

    fn supports(&self, resource_type: &str) -> bool {
        self.resource_types
            .as_ref()
            .is_none_or(|types| types.contains(resource_type))
    }

    async fn create(&self, request: ResourceRequest<'_>) -> Result<ProviderResponse, ProviderError> {
        let resource = request.id.to_string();
        let started = self.tick();

        if let Err(e) = self.simulate(&resource).await {
            self.record(Operation::Create, resource, started, false);
            return Err(e);
        }

        let serial = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let provider_id = format!("{}-{:08x}", short_type(&request.id.resource_type), serial);
        let outputs = self.fabricate(&request, &provider_id);
        self.store(&provider_id, &request.id.resource_type, &outputs);

        tracing::debug!(resource = %resource, provider_id = %provider_id, "simulated create");
        self.record(Operation::Create, resource, started, true);
        Ok(ProviderResponse {
            provider_id,
            outputs,
        })
    }

    async fn read(
        &self,
        id: &ResourceId,
        provider_id: &str,
    ) -> Result<Option<ProviderResponse>, ProviderError> {
        let started = self.tick();
        let found = self
            .objects
            .lock()
            .ok()
            .and_then(|objects| objects.get(provider_id).cloned())
            .filter(|object| object.resource_type == id.resource_type);
        self.record(Operation::Read, id.to_string(), started, true);

        Ok(found.map(|object| ProviderResponse {
            provider_id: provider_id.to_string(),
            outputs: object.outputs,
        }))
    }

    async fn update(
        &self,
        provider_id: &str,
        request: ResourceRequest<'_>,
    ) -> Result<ProviderResponse, ProviderError> {
        let resource = request.id.to_string();
        let started = self.tick();

        if let Err(e) = self.simulate(&resource).await {
            self.record(Operation::Update, resource, started, false);
            return Err(e);
        }

        // NOTE: Unknown ids are adopted; a fresh simulator has no memory of earlier processes.
        let outputs = self
            .objects
            .lock()
            .ok()
            .and_then(|objects| objects.get(provider_id).map(|o| o.outputs.clone()))
            .unwrap_or_else(|| self.fabricate(&request, provider_id));
        self.store(provider_id, &request.id.resource_type, &outputs);

        self.record(Operation::Update, resource, started, true);
        Ok(ProviderResponse {
            provider_id: provider_id.to_string(),
            outputs,
        })
    }

    async fn delete(&self, id: &ResourceId, provider_id: &str) -> Result<(), ProviderError> {
        let started = self.tick();
        let resource = id.to_string();

        if let Err(e) = self.simulate(&resource).await {
            self.record(Operation::Delete, resource, started, false);
            return Err(e);
        }

        if let Ok(mut objects) = self.objects.lock() {
            objects.remove(provider_id);
        }
        self.record(Operation::Delete, resource, started, true);
        Ok(())
    }
}
