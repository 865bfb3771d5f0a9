//! Resource dependency graph.
//!
//! An edge `a -> b` means `a` must exist before `b` can be created. Edges come
//! from attribute references and from explicit `depends_on` constraints and
//! are merged into one set before any ordering is computed.

use std::collections::{BTreeSet, HashMap};

use termtree::Tree;

use crate::error::ConfigurationError;
use crate::resource::{ResourceDecl, ResourceId, Selector, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

#[derive(Debug, Clone)]
pub struct ResourceGraph {
    nodes: Vec<ResourceDecl>,
    index: HashMap<ResourceId, usize>,
    dependencies: Vec<BTreeSet<usize>>,
    dependents: Vec<BTreeSet<usize>>,
}

impl ResourceGraph {
    pub fn build(declarations: Vec<ResourceDecl>) -> Result<Self, ConfigurationError> {
        let mut index = HashMap::with_capacity(declarations.len());
        for (position, decl) in declarations.iter().enumerate() {
            if index.insert(decl.id.clone(), position).is_some() {
                return Err(ConfigurationError::DuplicateResource(decl.id.clone()));
            }
        }

        let mut graph = Self {
            dependencies: vec![BTreeSet::new(); declarations.len()],
            dependents: vec![BTreeSet::new(); declarations.len()],
            nodes: declarations,
            index,
        };

        for to in 0..graph.nodes.len() {
            let decl = &graph.nodes[to];
            let mut sources = BTreeSet::new();

            for reference in decl.references() {
                sources.extend(graph.resolve_reference(&decl.id, &reference.target)?);
            }
            for target in &decl.depends_on {
                sources.extend(graph.resolve_constraint(&decl.id, target)?);
            }

            for from in sources {
                graph.dependencies[to].insert(from);
                graph.dependents[from].insert(to);
            }
        }

        graph.check_acyclic()?;
        tracing::debug!(
            nodes = graph.nodes.len(),
            edges = graph.edge_count(),
            "resource graph built"
        );
        Ok(graph)
    }

    /// Targets of an attribute reference. A family must be indexed or splatted.
    pub fn resolve_reference(
        &self,
        from: &ResourceId,
        target: &Target,
    ) -> Result<Vec<usize>, ConfigurationError> {
        let found = self.lookup(target);
        if found.is_empty() {
            return Err(ConfigurationError::UnresolvedReference {
                from: from.clone(),
                target: target.clone(),
            });
        }
        if target.selector == Selector::Single && self.nodes[found[0]].id.key.is_some() {
            return Err(ConfigurationError::MissingInstanceKey {
                from: from.clone(),
                target: target.clone(),
            });
        }
        Ok(found)
    }

    /// Targets of an explicit ordering constraint. A bare family name means every member.
    fn resolve_constraint(
        &self,
        from: &ResourceId,
        target: &Target,
    ) -> Result<Vec<usize>, ConfigurationError> {
        let found = self.lookup(target);
        if found.is_empty() {
            return Err(ConfigurationError::UnresolvedReference {
                from: from.clone(),
                target: target.clone(),
            });
        }
        Ok(found)
    }

    fn lookup(&self, target: &Target) -> Vec<usize> {
        match &target.selector {
            Selector::Instance(key) => {
                let id = ResourceId::new(&target.resource_type, &target.name).with_key(key.clone());
                self.index.get(&id).copied().into_iter().collect()
            }
            Selector::Single => {
                let id = ResourceId::new(&target.resource_type, &target.name);
                match self.index.get(&id) {
                    Some(&position) => vec![position],
                    None => self.family(&target.resource_type, &target.name),
                }
            }
            Selector::All => self.family(&target.resource_type, &target.name),
        }
    }

    /// Positions of every instance in a family, in declaration order.
    pub fn family(&self, resource_type: &str, name: &str) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, decl)| decl.id.in_family(resource_type, name))
            .map(|(position, _)| position)
            .collect()
    }

    fn check_acyclic(&self) -> Result<(), ConfigurationError> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut path = Vec::new();

        for start in 0..self.nodes.len() {
            if marks[start] == Mark::Unvisited
                && let Some(cycle) = self.visit(start, &mut marks, &mut path)
            {
                return Err(ConfigurationError::Cycle {
                    path: cycle.into_iter().map(|i| self.nodes[i].id.clone()).collect(),
                });
            }
        }
        Ok(())
    }

    // NOTE: Walks dependents so the reported path reads in creation order.
    fn visit(&self, node: usize, marks: &mut [Mark], path: &mut Vec<usize>) -> Option<Vec<usize>> {
        marks[node] = Mark::Visiting;
        path.push(node);

        for &next in &self.dependents[node] {
            match marks[next] {
                Mark::Visiting => {
                    let start = path.iter().position(|&p| p == next).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = self.visit(next, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        path.pop();
        marks[node] = Mark::Done;
        None
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[ResourceDecl] {
        &self.nodes
    }

    pub fn node(&self, position: usize) -> &ResourceDecl {
        &self.nodes[position]
    }

    pub fn position(&self, id: &ResourceId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn get(&self, id: &ResourceId) -> Option<&ResourceDecl> {
        self.position(id).map(|position| &self.nodes[position])
    }

    pub fn dependency_positions(&self, position: usize) -> &BTreeSet<usize> {
        &self.dependencies[position]
    }

    pub fn dependencies(&self, id: &ResourceId) -> Vec<&ResourceId> {
        self.position(id)
            .map(|p| self.dependencies[p].iter().map(|&d| &self.nodes[d].id).collect())
            .unwrap_or_default()
    }

    pub fn dependents(&self, id: &ResourceId) -> Vec<&ResourceId> {
        self.position(id)
            .map(|p| self.dependents[p].iter().map(|&d| &self.nodes[d].id).collect())
            .unwrap_or_default()
    }

    /// All edges as `(must_exist_first, dependent)` pairs.
    pub fn edges(&self) -> BTreeSet<(ResourceId, ResourceId)> {
        self.dependencies
            .iter()
            .enumerate()
            .flat_map(|(to, froms)| {
                froms
                    .iter()
                    .map(move |&from| (self.nodes[from].id.clone(), self.nodes[to].id.clone()))
            })
            .collect()
    }

    pub fn edge_count(&self) -> usize {
        self.dependencies.iter().map(BTreeSet::len).sum()
    }

    /// One tree per resource, listing what it waits on. A resource whose
    /// dependencies were already expanded is shown once more as
    /// `(see above)`, so output grows with the edge count.
    pub fn dependency_trees(&self) -> Vec<Tree<String>> {
        let mut expanded = BTreeSet::new();
        (0..self.nodes.len())
            .map(|position| self.subtree(position, &mut expanded))
            .collect()
    }

    fn subtree(&self, position: usize, expanded: &mut BTreeSet<usize>) -> Tree<String> {
        let label = self.nodes[position].id.to_string();
        let deps = &self.dependencies[position];
        if deps.is_empty() {
            return Tree::new(label);
        }
        if !expanded.insert(position) {
            return Tree::new(format!("{} (see above)", label));
        }
        let leaves: Vec<Tree<String>> = deps.iter().map(|&dep| self.subtree(dep, expanded)).collect();
        Tree::new(label).with_leaves(leaves)
    }
}
