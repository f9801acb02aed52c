// graph.rs — Declaration dependency graph
//
// Turns the resolved reference table into a directed graph (consumer →
// producer) and supplies the order in which declarations must compile:
// producers before their consumers, ties broken by source order.
//
// Preconditions: `resolved` has passed name resolution.
// Postconditions: `topo_order` lists every declaration exactly once, each
//                 after all the declarations it references.
// Failure modes: a dependency cycle → `CyclicDeclaration` naming the cycle.
// Side effects: none.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::error::{CompileError, Result};
use crate::resolve::ResolvedSchema;

// ── Public types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    /// `deps[i]`: declarations that `i` reads.
    deps: Vec<Vec<usize>>,
    /// `users[i]`: declarations that read `i`.
    users: Vec<Vec<usize>>,
}

impl DependencyGraph {
    pub fn build(resolved: &ResolvedSchema) -> Self {
        let mut graph = DependencyGraph::default();
        for decl in &resolved.decls {
            graph.index.insert(decl.name.clone(), graph.names.len());
            graph.names.push(decl.name.clone());
        }
        graph.deps = vec![Vec::new(); graph.names.len()];
        graph.users = vec![Vec::new(); graph.names.len()];
        for (i, decl) in resolved.decls.iter().enumerate() {
            for dep in &decl.deps {
                if let Some(&j) = graph.index.get(dep) {
                    graph.deps[i].push(j);
                    graph.users[j].push(i);
                }
            }
        }
        graph
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Declarations `name` reads directly.
    pub fn deps_of(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| self.deps[i].iter().map(|&j| self.names[j].as_str()).collect())
            .unwrap_or_default()
    }

    /// `(producer, consumer)` pairs in consumer source order.
    pub fn edges(&self) -> Vec<(&str, &str)> {
        let mut edges = Vec::new();
        for (i, deps) in self.deps.iter().enumerate() {
            for &j in deps {
                edges.push((self.names[j].as_str(), self.names[i].as_str()));
            }
        }
        edges
    }

    /// Every declaration that reads `name`, directly or transitively.
    pub fn dependents(&self, name: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let Some(&start) = self.index.get(name) else {
            return out;
        };
        let mut stack = vec![start];
        while let Some(i) = stack.pop() {
            for &u in &self.users[i] {
                if out.insert(self.names[u].clone()) {
                    stack.push(u);
                }
            }
        }
        out
    }

    // ── Topological sort (Kahn's algorithm) ─────────────────────────────

    /// Producers first; among ready declarations, source order wins.
    pub fn topo_order(&self) -> Result<Vec<String>> {
        let mut in_degree: Vec<usize> = self.deps.iter().map(|d| d.len()).collect();
        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &deg)| deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.names.len());
        while let Some(i) = ready.pop_first() {
            order.push(self.names[i].clone());
            for &u in &self.users[i] {
                in_degree[u] -= 1;
                if in_degree[u] == 0 {
                    ready.insert(u);
                }
            }
        }

        if order.len() < self.names.len() {
            let stuck: Vec<usize> = (0..self.names.len())
                .filter(|&i| in_degree[i] > 0)
                .collect();
            let cycle = self
                .find_cycle(&stuck)
                .unwrap_or_else(|| stuck.iter().map(|&i| self.names[i].clone()).collect());
            return Err(CompileError::CyclicDeclaration { cycle });
        }
        Ok(order)
    }

    /// First cycle reachable from `starts`, closed by repeating its head.
    fn find_cycle(&self, starts: &[usize]) -> Option<Vec<String>> {
        let mut visited = vec![0u8; self.names.len()]; // 0 = unvisited, 1 = in progress, 2 = done
        let mut path = Vec::new();
        for &start in starts {
            if visited[start] == 0 {
                if let Some(cycle) = self.dfs_cycle(start, &mut visited, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        node: usize,
        visited: &mut [u8],
        path: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        visited[node] = 1;
        path.push(node);
        for &next in &self.deps[node] {
            match visited[next] {
                0 => {
                    if let Some(cycle) = self.dfs_cycle(next, visited, path) {
                        return Some(cycle);
                    }
                }
                1 => {
                    let pos = path.iter().position(|&n| n == next)?;
                    let mut cycle: Vec<String> =
                        path[pos..].iter().map(|&n| self.names[n].clone()).collect();
                    cycle.push(self.names[next].clone());
                    return Some(cycle);
                }
                _ => {}
            }
        }
        path.pop();
        visited[node] = 2;
        None
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for DependencyGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "DependencyGraph ({} declarations)", self.names.len())?;
        for (i, name) in self.names.iter().enumerate() {
            if self.deps[i].is_empty() {
                writeln!(f, "  {}", name)?;
            } else {
                let deps: Vec<&str> = self.deps[i].iter().map(|&j| self.names[j].as_str()).collect();
                writeln!(f, "  {} <- {}", name, deps.join(", "))?;
            }
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::resolve::resolve;

    fn graph_of(source: &str) -> DependencyGraph {
        let parsed = crate::parser::parse(source);
        assert!(parsed.errors.is_empty(), "parse errors: {:?}", parsed.errors);
        let schema = parsed.schema.expect("schema");
        let reg = Registry::builtin().expect("builtin registry");
        let result = resolve(&schema, &reg);
        DependencyGraph::build(&result.resolved)
    }

    #[test]
    fn producers_come_first() {
        let g = graph_of("value total = sum(sub)\nvalue sub = 1\nvalue other = 2");
        assert_eq!(g.topo_order().unwrap(), vec!["sub", "total", "other"]);
    }

    #[test]
    fn ties_keep_source_order() {
        let g = graph_of("value c = a + b\nvalue b = 1\nvalue a = 2");
        assert_eq!(g.topo_order().unwrap(), vec!["b", "a", "c"]);
    }

    #[test]
    fn cycle_reported_with_path() {
        let g = graph_of("value a = b + 1\nvalue b = c\nvalue c = a\nvalue d = 1");
        let err = g.topo_order().unwrap_err();
        assert_eq!(
            err,
            CompileError::CyclicDeclaration {
                cycle: vec!["a".into(), "b".into(), "c".into(), "a".into()]
            }
        );
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let g = graph_of("value a = a + 1");
        let err = g.topo_order().unwrap_err();
        assert_eq!(err.to_string(), "cyclic declaration dependency: a -> a");
    }

    #[test]
    fn dependents_are_transitive() {
        let g = graph_of("value a = 1\nvalue b = a\nvalue c = b\nvalue d = 2");
        let deps = g.dependents("a");
        assert_eq!(deps.into_iter().collect::<Vec<_>>(), vec!["b", "c"]);
        assert!(g.dependents("d").is_empty());
        assert_eq!(g.edges(), vec![("a", "b"), ("b", "c")]);
    }

    #[test]
    fn display_lists_edges() {
        let g = graph_of("value a = 1\nvalue b = a");
        let text = g.to_string();
        assert!(text.contains("2 declarations"));
        assert!(text.contains("b <- a"));
    }
}
