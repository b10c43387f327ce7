use crate::helpe::*;

const UNVISITED: usize = usize::MAX;

/// Tarjan's algorithm, with an explicit work-stack instead of
/// recursion. Components come out in topological order: if there is an
/// edge from a node of component `i` to a node of component `j != i`,
/// then `i < j`.
pub(crate) fn tarjan(adj: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let n = adj.len();
    let mut index = vec![UNVISITED; n];
    let mut low = vec![0; n];
    let mut on_stack = vec![false; n];
    let mut stack: Vec<usize> = vec![];
    let mut comps: Vec<Vec<usize>> = vec![];
    let mut next_index = 0;
    // (node, position of next child to visit)
    let mut work: Vec<(usize, usize)> = vec![];

    for root in 0..n {
        if index[root] != UNVISITED { continue; }
        work.push((root, 0));
        while !work.is_empty() {
            let top = work.len() - 1;
            let (v, pos) = work[top];
            if pos == 0 && index[v] == UNVISITED {
                index[v] = next_index;
                low[v] = next_index;
                next_index += 1;
                stack.push(v);
                on_stack[v] = true;
            }
            if pos < adj[v].len() {
                work[top].1 += 1;
                let w = adj[v][pos];
                if index[w] == UNVISITED {
                    work.push((w, 0));
                } else if on_stack[w] {
                    low[v] = low[v].min(index[w]);
                }
            } else {
                work.pop();
                if let Some(&(parent, _)) = work.last() {
                    low[parent] = low[parent].min(low[v]);
                }
                if low[v] == index[v] {
                    let mut comp = vec![];
                    while let Some(w) = stack.pop() {
                        on_stack[w] = false;
                        comp.push(w);
                        if w == v { break; }
                    }
                    comp.sort_unstable();
                    comps.push(comp);
                }
            }
        }
    }
    // Tarjan finishes sinks first.
    comps.reverse();

    comps
}

/// Strongly connected components of the graph with forward edges
/// `edges`, in topological order.
pub fn strongly_connected_components(edges: &Edges) -> Vec<OpChain> {
    let adj: Vec<Vec<usize>> = edges.iter()
        .map(|outs| outs.iter().map(|o| o.0).collect())
        .collect();

    tarjan(&adj)
        .into_iter()
        .map(|c| c.into_iter().map(OpAddress).collect())
        .collect()
}

/// Weakly connected components of `n` nodes, each sorted, ordered by
/// their lowest member.
pub(crate) fn undirected_components(n: usize, adj: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let mut neighbours: Vec<Vec<usize>> = vec![vec![]; n];
    for (from, outs) in adj.iter().enumerate() {
        for &to in outs {
            neighbours[from].push(to);
            neighbours[to].push(from);
        }
    }
    let mut seen = vec![false; n];
    let mut res = vec![];
    for root in 0..n {
        if seen[root] { continue; }
        seen[root] = true;
        let mut comp = vec![root];
        let mut to_visit = vec![root];
        while let Some(v) = to_visit.pop() {
            for &w in &neighbours[v] {
                if !seen[w] {
                    seen[w] = true;
                    comp.push(w);
                    to_visit.push(w);
                }
            }
        }
        comp.sort_unstable();
        res.push(comp);
    }

    res
}

/// Ops grouped by weak connectivity through `edges`.
pub fn connected_components(edges: &Edges) -> Vec<OpChain> {
    let adj: Vec<Vec<usize>> = edges.iter()
        .map(|outs| outs.iter().map(|o| o.0).collect())
        .collect();

    undirected_components(edges.len(), &adj)
        .into_iter()
        .map(|c| c.into_iter().map(OpAddress).collect())
        .collect()
}

/// Human readable description of every cycle-carrying component, used
/// when reporting unschedulable graphs.
pub fn scc_summary<F>(edges: &Edges, name: F) -> String
where F: Fn(OpAddress) -> String {
    let cyclic = strongly_connected_components(edges)
        .into_iter()
        .filter(|c| c.len() > 1 || edges[c[0].0].contains(&c[0]))
        .collect::<Vec<_>>();
    if cyclic.is_empty() {
        return String::from("No cycles detected.");
    }
    let mut res = format!("{} strongly connected component(s) with cycles:", cyclic.len());
    for comp in cyclic {
        res.push_str(&format!(
            "\n  [{}]",
            comp.iter().map(|&o| format!("{}({})", name(o), o)).join(", ")
        ));
    }

    res
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edges(n: usize, raw: &[(usize, usize)]) -> Edges {
        let mut e = vec![vec![]; n];
        for &(a, b) in raw {
            e[a].push(OpAddress(b));
        }
        e
    }

    #[test]
    fn sccs_are_topologically_ordered() {
        // 0 -> {1 <-> 2} -> 3, 4 isolated
        let e = edges(5, &[(0, 1), (1, 2), (2, 1), (2, 3)]);
        let sccs = strongly_connected_components(&e);
        let pos = |x: usize| sccs.iter().position(|c| c.contains(&OpAddress(x))).unwrap();
        assert_eq!(sccs.len(), 4);
        assert_eq!(pos(1), pos(2));
        assert!(pos(0) < pos(1));
        assert!(pos(2) < pos(3));
        let summary = scc_summary(&e, |o| format!("op{}", o));
        assert!(summary.contains("op1(1), op2(2)"));
    }

    #[test]
    fn acyclic_summary() {
        let e = edges(3, &[(0, 1), (1, 2)]);
        assert_eq!(scc_summary(&e, |_| String::new()), "No cycles detected.");
    }

    #[test]
    fn weak_components() {
        let e = edges(6, &[(3, 0), (1, 4)]);
        let cc = connected_components(&e);
        assert_eq!(cc, vec![ops_of(&[0, 3]), ops_of(&[1, 4]), ops_of(&[2]), ops_of(&[5])]);
    }
}
