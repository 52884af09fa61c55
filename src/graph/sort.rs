//! Pass ordering.

use crate::error::GraphError;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    Unvisited,
    InProgress,
    Done,
}

/// Order nodes so that every edge `a -> b` puts `a` before `b`.
///
/// `edges[i]` lists the nodes depending on node `i`. Iterative post-order
/// depth-first search, reversed. Roots and edges are walked back to front so
/// that unrelated nodes keep their index order. A back edge is a cycle; the
/// error names the nodes on it, first node repeated at the end.
pub fn topological_order(names: &[&str], edges: &[Vec<usize>]) -> Result<Vec<usize>, GraphError> {
    let count = names.len();
    let mut state = vec![Visit::Unvisited; count];
    let mut post_order = Vec::with_capacity(count);
    // (node, next edge to follow)
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for root in (0..count).rev() {
        if state[root] != Visit::Unvisited {
            continue;
        }
        state[root] = Visit::InProgress;
        stack.push((root, 0));

        while let Some((node, next)) = stack.last().copied() {
            let children = &edges[node];
            if next < children.len() {
                let child = children[children.len() - 1 - next];
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                match state[child] {
                    Visit::Unvisited => {
                        state[child] = Visit::InProgress;
                        stack.push((child, 0));
                    }
                    Visit::InProgress => {
                        let start = stack.iter().position(|(n, _)| *n == child).unwrap_or(0);
                        let mut cycle: Vec<String> = stack[start..]
                            .iter()
                            .map(|(n, _)| names[*n].to_string())
                            .collect();
                        cycle.push(names[child].to_string());
                        return Err(GraphError::Cycle(cycle));
                    }
                    Visit::Done => {}
                }
            } else {
                state[node] = Visit::Done;
                post_order.push(node);
                stack.pop();
            }
        }
    }

    post_order.reverse();
    Ok(post_order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(order: &[usize], node: usize) -> usize {
        order.iter().position(|n| *n == node).unwrap()
    }

    #[test]
    fn test_chain_in_any_declaration_order() {
        // c <- b <- a, declared as [c, a, b]
        let names = ["c", "a", "b"];
        let edges = vec![vec![], vec![2], vec![0]];
        let order = topological_order(&names, &edges).unwrap();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_diamond() {
        let names = ["top", "left", "right", "bottom"];
        let edges = vec![vec![1, 2], vec![3], vec![3], vec![]];
        let order = topological_order(&names, &edges).unwrap();
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert!(position(&order, 2) < position(&order, 3));
    }

    #[test]
    fn test_independent_nodes_keep_declaration_order() {
        let names = ["a", "b", "c"];
        let edges = vec![vec![], vec![], vec![]];
        assert_eq!(topological_order(&names, &edges).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let names = ["a", "b", "c"];
        let edges = vec![vec![1], vec![2], vec![0]];
        let err = topological_order(&names, &edges).unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle(vec!["c".into(), "a".into(), "b".into(), "c".into()])
        );
    }

    #[test]
    fn test_self_edge_is_a_cycle() {
        let err = topological_order(&["solo"], &[vec![0]]).unwrap_err();
        assert_eq!(err, GraphError::Cycle(vec!["solo".into(), "solo".into()]));
    }
}
