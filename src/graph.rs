//! The process graph: parallel arrays indexed by [`ProcId`] ("graph as
//! arena + indices" rather than a pointer-linked structure). Built once
//! by [`crate::parser::parse`] and
//! immutable afterwards; the [`crate::orchestrator::Orchestrator`] is the
//! sole owner.

use std::collections::HashMap;

use crate::error::ParseError;
use crate::process::ProcessSpec;

/// A cheap integer handle into a [`ProcessGraph`]'s arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcId(pub u32);

impl ProcId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// An immutable, validated, directed acyclic graph of [`ProcessSpec`]s.
///
/// An edge `A -> B` (`successors[A]` contains `B`) means "B depends on A":
/// B starts only after A is ready. `predecessors` is the reverse adjacency,
/// kept alongside so the shutdown path doesn't need to invert anything at
/// runtime.
#[derive(Debug, Clone)]
pub struct ProcessGraph {
    specs: Vec<ProcessSpec>,
    name_to_id: HashMap<String, ProcId>,
    /// `successors[i]` = processes that depend on process `i`.
    successors: Vec<Vec<ProcId>>,
    /// `predecessors[i]` = processes that process `i` depends on.
    predecessors: Vec<Vec<ProcId>>,
    topo_order: Vec<ProcId>,
}

impl ProcessGraph {
    /// Builds a graph from validated specs, running cycle detection.
    ///
    /// `specs` must already have passed name-uniqueness and
    /// known-dependency checks; this function's sole job is to detect
    /// cycles and compute a cached topological order.
    pub fn build(specs: Vec<ProcessSpec>) -> Result<Self, ParseError> {
        let name_to_id: HashMap<String, ProcId> = specs
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), ProcId(i as u32)))
            .collect();

        let n = specs.len();
        let mut predecessors: Vec<Vec<ProcId>> = vec![Vec::new(); n];
        let mut successors: Vec<Vec<ProcId>> = vec![Vec::new(); n];

        for (i, spec) in specs.iter().enumerate() {
            for dep_name in &spec.dependencies {
                let dep_id = name_to_id[dep_name];
                predecessors[i].push(dep_id);
                successors[dep_id.index()].push(ProcId(i as u32));
            }
        }

        let topo_order = topological_order(&specs, &predecessors, &name_to_id)?;

        Ok(Self {
            specs,
            name_to_id,
            successors,
            predecessors,
            topo_order,
        })
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn id_of(&self, name: &str) -> Option<ProcId> {
        self.name_to_id.get(name).copied()
    }

    pub fn spec(&self, id: ProcId) -> &ProcessSpec {
        &self.specs[id.index()]
    }

    pub fn ids(&self) -> impl Iterator<Item = ProcId> {
        (0..self.specs.len() as u32).map(ProcId)
    }

    pub fn successors(&self, id: ProcId) -> &[ProcId] {
        &self.successors[id.index()]
    }

    pub fn predecessors(&self, id: ProcId) -> &[ProcId] {
        &self.predecessors[id.index()]
    }

    /// All processes with indegree zero: the startup sources.
    pub fn sources(&self) -> Vec<ProcId> {
        self.ids()
            .filter(|id| self.predecessors(*id).is_empty())
            .collect()
    }

    /// Cached startup order: every dependency appears before its dependents.
    pub fn topological_order(&self) -> &[ProcId] {
        &self.topo_order
    }

    /// Shutdown order: the reverse of the startup order.
    pub fn reverse_topological_order(&self) -> Vec<ProcId> {
        let mut order = self.topo_order.clone();
        order.reverse();
        order
    }

    /// The transitive successor set of `id`, in topological order,
    /// excluding `id` itself. Used to cascade a reload to dependents.
    pub fn transitive_successors_in_topo_order(&self, id: ProcId) -> Vec<ProcId> {
        let mut reachable = std::collections::HashSet::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            for &succ in self.successors(cur) {
                if reachable.insert(succ) {
                    stack.push(succ);
                }
            }
        }
        self.topo_order
            .iter()
            .copied()
            .filter(|id| reachable.contains(id))
            .collect()
    }
}

/// DFS-colouring cycle detection that also produces a
/// topological order when the graph is acyclic. White/Gray/Black marks.
fn topological_order(
    specs: &[ProcessSpec],
    predecessors: &[Vec<ProcId>],
    name_to_id: &HashMap<String, ProcId>,
) -> Result<Vec<ProcId>, ParseError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Colour {
        White,
        Gray,
        Black,
    }

    let n = specs.len();
    let mut colour = vec![Colour::White; n];
    let mut order = Vec::with_capacity(n);
    let mut path: Vec<ProcId> = Vec::new();

    // We detect cycles by walking the dependency edges (predecessors),
    // since `after=` points at dependencies; a dependent is only
    // emitted once all of its dependencies are emitted first, which
    // yields a valid startup order directly.
    fn visit(
        id: ProcId,
        specs: &[ProcessSpec],
        predecessors: &[Vec<ProcId>],
        colour: &mut [Colour],
        order: &mut Vec<ProcId>,
        path: &mut Vec<ProcId>,
    ) -> Result<(), ParseError> {
        match colour[id.index()] {
            Colour::Black => return Ok(()),
            Colour::Gray => {
                let mut cycle: Vec<String> = path
                    .iter()
                    .skip_while(|p| **p != id)
                    .map(|p| specs[p.index()].name.clone())
                    .collect();
                cycle.push(specs[id.index()].name.clone());
                return Err(ParseError::Cycle { cycle });
            }
            Colour::White => {}
        }
        colour[id.index()] = Colour::Gray;
        path.push(id);
        for &dep in &predecessors[id.index()] {
            visit(dep, specs, predecessors, colour, order, path)?;
        }
        path.pop();
        colour[id.index()] = Colour::Black;
        order.push(id);
        Ok(())
    }

    for name in specs.iter().map(|s| &s.name) {
        let id = name_to_id[name];
        if colour[id.index()] == Colour::White {
            visit(id, specs, predecessors, &mut colour, &mut order, &mut path)?;
        }
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{Kind, DEFAULT_DEBOUNCE, DEFAULT_SHUTDOWN_GRACE, DEFAULT_SIGNAL};

    fn spec(name: &str, deps: &[&str]) -> ProcessSpec {
        ProcessSpec {
            name: name.to_string(),
            kind: Kind::LongRunning,
            command: "true".to_string(),
            inline_env: Vec::new(),
            watch_includes: Vec::new(),
            watch_excludes: Vec::new(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            ready_spec: None,
            signal: DEFAULT_SIGNAL.to_string(),
            debounce: DEFAULT_DEBOUNCE,
            dir: ".".to_string(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    #[test]
    fn topo_order_respects_edges() {
        let graph = ProcessGraph::build(vec![
            spec("lib", &[]),
            spec("app", &["lib"]),
        ])
        .unwrap();
        let order: Vec<&str> = graph
            .topological_order()
            .iter()
            .map(|id| graph.spec(*id).name.as_str())
            .collect();
        assert_eq!(order, vec!["lib", "app"]);
        assert_eq!(
            graph.reverse_topological_order()
                .iter()
                .map(|id| graph.spec(*id).name.as_str())
                .collect::<Vec<_>>(),
            vec!["app", "lib"]
        );
    }

    #[test]
    fn detects_two_node_cycle() {
        let err = ProcessGraph::build(vec![spec("a", &["b"]), spec("b", &["a"])]).unwrap_err();
        match err {
            ParseError::Cycle { cycle } => {
                assert!(cycle.len() >= 2);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn transitive_successors_are_ordered() {
        let graph = ProcessGraph::build(vec![
            spec("lib", &[]),
            spec("mid", &["lib"]),
            spec("app", &["mid"]),
        ])
        .unwrap();
        let lib = graph.id_of("lib").unwrap();
        let succs: Vec<&str> = graph
            .transitive_successors_in_topo_order(lib)
            .iter()
            .map(|id| graph.spec(*id).name.as_str())
            .collect();
        assert_eq!(succs, vec!["mid", "app"]);
    }

    #[test]
    fn sources_are_indegree_zero() {
        let graph = ProcessGraph::build(vec![spec("a", &[]), spec("b", &["a"])]).unwrap();
        let names: Vec<&str> = graph
            .sources()
            .iter()
            .map(|id| graph.spec(*id).name.as_str())
            .collect();
        assert_eq!(names, vec!["a"]);
    }
}
