//! Diffs the declared graph against recorded state and orders the work.
//!
//! Create, update and no-op entries follow the graph's topological order;
//! deletes follow the reverse order of the dependencies recorded in state.

mod order;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::Serialize;

use crate::error::{ConfigurationError, GroundworkError, StateError};
use crate::graph::ResourceGraph;
use crate::render::{self, Rendered, RenderedAttributes, Resolver};
use crate::resource::{Attributes, InstanceKey, Reference, ResourceId, Selector};
use crate::state::StateRecord;

use order::kahn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    Delete,
    NoOp,
}

impl Action {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Delete => "-",
            Self::NoOp => " ",
        }
    }

    pub fn is_change(&self) -> bool {
        !matches!(self, Self::NoOp)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        };
        f.write_str(label)
    }
}

/// One attribute that differs from the last-applied snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeChange {
    pub name: String,
    pub before: Option<serde_json::Value>,
    /// `None` when the attribute is no longer declared.
    pub after: Option<Rendered>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanEntry {
    pub id: ResourceId,
    pub action: Action,
    pub rendered: RenderedAttributes,
    pub changes: Vec<AttributeChange>,
    pub prior: Option<StateRecord>,
    /// Prior identity when the record is rebound to a new instance key.
    pub moved_from: Option<ResourceId>,
    /// Entries that must complete successfully before this one starts.
    pub wait_for: Vec<ResourceId>,
    /// Dependencies to record in state once this entry is applied.
    pub dependencies: Vec<ResourceId>,
}

impl PlanEntry {
    pub fn provider_id(&self) -> Option<&str> {
        self.prior.as_ref().map(|p| p.provider_id.as_str())
    }

    /// A no-op whose state record still has to be rewritten.
    pub fn rewrites_state(&self) -> bool {
        if self.action != Action::NoOp {
            return false;
        }
        match &self.prior {
            Some(prior) => {
                let recorded: BTreeSet<_> = prior.dependencies.iter().collect();
                let current: BTreeSet<_> = self.dependencies.iter().collect();
                self.moved_from.is_some() || recorded != current
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    entries: Vec<PlanEntry>,
}

impl Plan {
    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    pub fn get(&self, id: &ResourceId) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| &e.id == id)
    }

    pub fn order(&self) -> Vec<&ResourceId> {
        self.entries.iter().map(|e| &e.id).collect()
    }

    pub fn has_changes(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.action.is_change() || e.rewrites_state())
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for entry in &self.entries {
            match entry.action {
                Action::Create => summary.create += 1,
                Action::Update => summary.update += 1,
                Action::Delete => summary.delete += 1,
                Action::NoOp => summary.unchanged += 1,
            }
        }
        summary
    }
}

pub struct Planner;

impl Planner {
    pub fn plan(graph: &ResourceGraph, prior: &[StateRecord]) -> Result<Plan, GroundworkError> {
        let matching = match_prior(graph, prior)?;
        let order = topological_order(graph)?;

        let mut planned: Vec<Option<Planned<'_>>> = vec![None; graph.len()];
        let mut entries = Vec::with_capacity(graph.len() + matching.orphans.len());

        for position in order {
            let decl = graph.node(position);
            let record = matching.declared.get(&position).map(|&i| &prior[i]);

            let resolver = PlanResolver {
                from: &decl.id,
                graph,
                planned: &planned,
            };
            let rendered = render::render_attributes(&decl.attributes, &resolver)?;

            let (action, changes) = match record {
                None => (Action::Create, diff(&Attributes::new(), &rendered)),
                Some(record) => {
                    let changes = diff(&record.attributes, &rendered);
                    let action = if changes.is_empty() {
                        Action::NoOp
                    } else {
                        Action::Update
                    };
                    (action, changes)
                }
            };

            let dependencies: Vec<ResourceId> = graph
                .dependency_positions(position)
                .iter()
                .map(|&d| graph.node(d).id.clone())
                .collect();

            tracing::debug!(resource = %decl.id, action = %action, "planned");
            planned[position] = Some(Planned {
                action,
                rendered: rendered.clone(),
                record,
            });
            entries.push(PlanEntry {
                id: decl.id.clone(),
                action,
                rendered,
                changes,
                prior: record.cloned(),
                moved_from: record.filter(|r| r.id != decl.id).map(|r| r.id.clone()),
                wait_for: dependencies.clone(),
                dependencies,
            });
        }

        let orphans: Vec<&StateRecord> = matching.orphans.iter().map(|&i| &prior[i]).collect();
        for record in delete_order(&orphans)? {
            let mut wait_for: Vec<ResourceId> = orphans
                .iter()
                .filter(|o| o.dependencies.contains(&record.id))
                .map(|o| o.id.clone())
                .collect();
            wait_for.extend(
                entries
                    .iter()
                    .filter(|e| {
                        e.action != Action::Delete
                            && e.prior
                                .as_ref()
                            .is_some_and(|p| p.dependencies.contains(&record.id))
                    })
                    .map(|e| e.id.clone()),
            );

            tracing::debug!(resource = %record.id, action = %Action::Delete, "planned");
            entries.push(PlanEntry {
                id: record.id.clone(),
                action: Action::Delete,
                rendered: RenderedAttributes::new(),
                changes: record
                    .attributes
                    .iter()
                    .map(|(name, value)| AttributeChange {
                        name: name.clone(),
                        before: Some(value.clone()),
                        after: None,
                    })
                    .collect(),
                prior: Some(record.clone()),
                moved_from: None,
                wait_for,
                dependencies: record.dependencies.clone(),
            });
        }

        let plan = Plan { entries };
        let summary = plan.summary();
        tracing::info!(
            create = summary.create,
            update = summary.update,
            delete = summary.delete,
            unchanged = summary.unchanged,
            "plan computed"
        );
        Ok(plan)
    }
}

/// Declaration positions in Kahn order, ties broken by declaration order.
pub fn topological_order(graph: &ResourceGraph) -> Result<Vec<usize>, ConfigurationError> {
    let dependencies: Vec<BTreeSet<usize>> = (0..graph.len())
        .map(|position| graph.dependency_positions(position).clone())
        .collect();
    kahn(&dependencies).map_err(|stuck| ConfigurationError::Cycle {
        path: stuck.into_iter().map(|p| graph.node(p).id.clone()).collect(),
    })
}

fn delete_order<'a>(orphans: &[&'a StateRecord]) -> Result<Vec<&'a StateRecord>, StateError> {
    let index: HashMap<&ResourceId, usize> = orphans
        .iter()
        .enumerate()
        .map(|(i, record)| (&record.id, i))
        .collect();
    let dependencies: Vec<BTreeSet<usize>> = orphans
        .iter()
        .map(|record| {
            record
                .dependencies
                .iter()
                .filter_map(|dep| index.get(dep).copied())
                .collect()
        })
        .collect();

    let order = kahn(&dependencies).map_err(|stuck| StateError::Corruption {
        location: "recorded dependencies".to_string(),
        message: format!(
            "dependency cycle between {}",
            stuck
                .iter()
                .map(|&i| orphans[i].id.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    })?;
    Ok(order.into_iter().rev().map(|i| orphans[i]).collect())
}

fn diff(before: &Attributes, after: &RenderedAttributes) -> Vec<AttributeChange> {
    let names: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    names
        .into_iter()
        .filter_map(|name| {
            let old = before.get(name);
            let new = after.get(name);
            let unchanged = match (old, new) {
                (Some(old), Some(Rendered::Known(new))) => old == new,
                _ => false,
            };
            (!unchanged).then(|| AttributeChange {
                name: name.clone(),
                before: old.cloned(),
                after: new.cloned(),
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
struct Planned<'a> {
    action: Action,
    rendered: RenderedAttributes,
    record: Option<&'a StateRecord>,
}

struct PlanResolver<'a, 'p> {
    from: &'a ResourceId,
    graph: &'a ResourceGraph,
    planned: &'a [Option<Planned<'p>>],
}

impl PlanResolver<'_, '_> {
    fn resolve_at(&self, position: usize, attribute: &str) -> Result<Rendered, ConfigurationError> {
        let Some(planned) = &self.planned[position] else {
            return Ok(Rendered::Unknown);
        };
        if let Some(rendered) = planned.rendered.get(attribute) {
            return Ok(rendered.clone());
        }
        if planned.action == Action::Create {
            return Ok(Rendered::Unknown);
        }
        // NOTE: An update rewrites the declared values, so only outputs carry over.
        planned
            .record
            .and_then(|record| match planned.action {
                Action::Update => record.outputs.get(attribute),
                _ => record.lookup(attribute),
            })
            .map(|value| Rendered::Known(value.clone()))
            .ok_or_else(|| ConfigurationError::UnsupportedAttribute {
                from: self.from.clone(),
                target: self.graph.node(position).id.clone(),
                attribute: attribute.to_string(),
            })
    }
}

impl Resolver for PlanResolver<'_, '_> {
    fn resolve(&self, reference: &Reference) -> Result<Rendered, ConfigurationError> {
        let positions = self.graph.resolve_reference(self.from, &reference.target)?;
        if reference.target.selector == Selector::All {
            let mut values = Vec::with_capacity(positions.len());
            for position in positions {
                match self.resolve_at(position, &reference.attribute)? {
                    Rendered::Known(value) => values.push(value),
                    Rendered::Unknown => return Ok(Rendered::Unknown),
                }
            }
            return Ok(Rendered::Known(serde_json::Value::Array(values)));
        }
        match positions.first() {
            Some(&position) => self.resolve_at(position, &reference.attribute),
            None => Err(ConfigurationError::UnresolvedReference {
                from: self.from.clone(),
                target: reference.target.clone(),
            }),
        }
    }
}

struct Matching {
    /// Declaration position to index of the prior record it continues.
    declared: HashMap<usize, usize>,
    /// Prior records with no declaration, in state order.
    orphans: Vec<usize>,
}

fn match_prior(graph: &ResourceGraph, prior: &[StateRecord]) -> Result<Matching, ConfigurationError> {
    let mut families: BTreeMap<(&str, &str), Vec<usize>> = BTreeMap::new();
    for (position, decl) in graph.nodes().iter().enumerate() {
        families.entry(decl.id.family()).or_default().push(position);
    }

    let mut declared = HashMap::new();
    let mut claimed = vec![false; prior.len()];

    for ((resource_type, name), positions) in &families {
        let members: Vec<usize> = (0..prior.len())
            .filter(|&i| prior[i].id.in_family(resource_type, name))
            .collect();
        let family = format!("{}.{}", resource_type, name);
        let keys: Vec<Option<&InstanceKey>> = positions
            .iter()
            .map(|&p| graph.node(p).id.key.as_ref())
            .collect();
        check_family(&family, &keys, members.iter().map(|&i| prior[i].id.key.as_ref()))?;

        for (&position, key) in positions.iter().zip(&keys) {
            let exact = members
                .iter()
                .copied()
                .find(|&i| prior[i].id.key.as_ref() == *key);
            let rebound = || {
                members.iter().copied().find(|&i| {
                    match (key, prior[i].id.key.as_ref()) {
                        (None, Some(InstanceKey::Index(0))) => true,
                        (Some(InstanceKey::Index(0)), None) => true,
                        _ => false,
                    }
                })
            };
            if let Some(i) = exact.or_else(rebound) {
                if prior[i].id != graph.node(position).id {
                    tracing::info!(
                        from = %prior[i].id,
                        to = %graph.node(position).id,
                        "rebinding state record"
                    );
                }
                claimed[i] = true;
                declared.insert(position, i);
            }
        }
    }

    let orphans = (0..prior.len()).filter(|&i| !claimed[i]).collect();
    Ok(Matching { declared, orphans })
}

fn check_family<'a>(
    family: &str,
    declared: &[Option<&InstanceKey>],
    recorded: impl Iterator<Item = Option<&'a InstanceKey>>,
) -> Result<(), ConfigurationError> {
    let ambiguous = |reason: &str| ConfigurationError::AmbiguousCountIndex {
        family: family.to_string(),
        reason: reason.to_string(),
    };

    let recorded: Vec<Option<&InstanceKey>> = recorded.collect();
    let recorded_unkeyed = recorded.iter().any(Option::is_none);
    let recorded_zero = recorded.contains(&Some(&InstanceKey::Index(0)));
    let recorded_indices = recorded.iter().flatten().any(|k| k.is_index());
    let recorded_strings = recorded.iter().flatten().any(|k| !k.is_index());

    let declared_unkeyed = declared.iter().any(Option::is_none);
    let declared_indices = declared.iter().flatten().any(|k| k.is_index());
    let declared_strings = declared.iter().flatten().any(|k| !k.is_index());

    if declared_unkeyed && (declared_indices || declared_strings) {
        return Err(ambiguous("declared both with and without instance keys"));
    }
    if recorded_unkeyed && recorded_zero {
        return Err(ambiguous("state holds both an unkeyed instance and [0]"));
    }
    if recorded_unkeyed && declared_strings {
        return Err(ambiguous("an unkeyed instance in state cannot be matched to string keys"));
    }
    if (declared_indices && recorded_strings) || (declared_strings && recorded_indices) {
        return Err(ambiguous("instances switch between index and string keys"));
    }
    Ok(())
}
