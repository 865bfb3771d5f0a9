use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};

/// Kahn's algorithm over `dependencies[node]`, breaking ties by lowest index.
///
/// Returns the nodes that could not be ordered when the input has a cycle.
pub(crate) fn kahn(dependencies: &[BTreeSet<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let count = dependencies.len();
    let mut in_degree: Vec<usize> = dependencies.iter().map(BTreeSet::len).collect();
    let mut dependents = vec![Vec::new(); count];
    for (node, deps) in dependencies.iter().enumerate() {
        for &dep in deps {
            dependents[dep].push(node);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(node, _)| Reverse(node))
        .collect();

    let mut order = Vec::with_capacity(count);
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for &next in &dependents[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() == count {
        Ok(order)
    } else {
        Err((0..count).filter(|node| in_degree[*node] > 0).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(edges: &[&[usize]]) -> Vec<BTreeSet<usize>> {
        edges.iter().map(|d| d.iter().copied().collect()).collect()
    }

    #[test]
    fn test_independent_nodes_keep_declaration_order() {
        assert_eq!(kahn(&deps(&[&[], &[], &[]])).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_dependency_pulls_ahead() {
        // 0 depends on 2
        assert_eq!(kahn(&deps(&[&[2], &[], &[]])).unwrap(), vec![1, 2, 0]);
    }

    #[test]
    fn test_tie_break_prefers_lower_index_once_ready() {
        // 1 and 3 both wait on 2; 0 is free
        assert_eq!(kahn(&deps(&[&[], &[2], &[], &[2]])).unwrap(), vec![0, 2, 1, 3]);
    }

    #[test]
    fn test_cycle_reports_unordered_nodes() {
        let err = kahn(&deps(&[&[1], &[0], &[]])).unwrap_err();
        assert_eq!(err, vec![0, 1]);
    }
}
