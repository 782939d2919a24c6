// kiln-common/src/dependency/graph.rs
//! Formula graph and build planning.
//!
//! Nodes are registered formulas; edges are the build-gating dependencies of a formula plus the
//! dependencies of its resources (hoisted onto the parent, resources are never nodes). Planning
//! is a pure function of the registered formulas.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::error::{KilnError, Result};
use crate::model::formula::FormulaSpec;
use crate::model::platform::OsFamily;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanOptions {
    pub include_optional: bool,
}

#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub formula: Arc<FormulaSpec>,
    pub build_dir: PathBuf,
    /// Direct predecessors inside the plan.
    pub dependencies: Vec<String>,
}

impl PlanEntry {
    pub fn name(&self) -> &str {
        &self.formula.name
    }
}

/// Topologically sorted formulas: every predecessor of an entry appears before it.
#[derive(Debug, Clone, Default)]
pub struct BuildPlan {
    pub entries: Vec<PlanEntry>,
}

impl BuildPlan {
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(PlanEntry::name).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name() == name)
    }

    pub fn get(&self, name: &str) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| e.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries.iter()
    }
}

#[derive(Debug, Clone)]
pub struct FormulaGraph {
    formulas: BTreeMap<String, Arc<FormulaSpec>>,
    os: OsFamily,
    build_root: PathBuf,
}

impl FormulaGraph {
    /// A graph whose OS-restricted edges are evaluated for `os`, planning builds under `build_root`.
    pub fn new(os: OsFamily, build_root: impl Into<PathBuf>) -> Self {
        Self {
            formulas: BTreeMap::new(),
            os,
            build_root: build_root.into(),
        }
    }

    /// Registers (or replaces) a formula.
    pub fn add_formula(&mut self, spec: FormulaSpec) -> Arc<FormulaSpec> {
        self.add_shared(Arc::new(spec))
    }

    pub fn add_shared(&mut self, spec: Arc<FormulaSpec>) -> Arc<FormulaSpec> {
        debug!("Registering formula '{}' ({})", spec.name, spec.version);
        self.formulas.insert(spec.name.clone(), Arc::clone(&spec));
        spec
    }

    pub fn get(&self, name: &str) -> Option<&Arc<FormulaSpec>> {
        self.formulas.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.formulas.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.formulas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formulas.is_empty()
    }

    /// Build-gating edges of `spec`, deduplicated and sorted by name.
    pub fn edges_of(&self, spec: &FormulaSpec, options: &PlanOptions) -> Vec<String> {
        let resource_deps = spec.resources.iter().flat_map(|r| r.dependencies.iter());
        spec.dependencies
            .iter()
            .chain(resource_deps)
            .filter(|dep| dep.applies_to(self.os) && dep.gates_build(options.include_optional))
            .map(|dep| dep.name.clone())
            .filter(|name| name != &spec.name)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn plan<I, S>(&self, targets: I) -> Result<BuildPlan>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.plan_with(targets, &PlanOptions::default())
    }

    pub fn plan_with<I, S>(&self, targets: I, options: &PlanOptions) -> Result<BuildPlan>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let targets: BTreeSet<String> = targets
            .into_iter()
            .map(|t| t.as_ref().to_string())
            .collect();
        debug!("Planning build for targets: {:?}", targets);

        let adjacency = self.closure(&targets, options)?;
        if let Some(path) = find_cycle(&adjacency) {
            debug!("Cycle detected while planning: {:?}", path);
            return Err(KilnError::Cycle { path });
        }

        let order = topological_order(&adjacency)?;
        let entries = order
            .into_iter()
            .filter_map(|name| {
                let formula = self.formulas.get(&name)?;
                Some(PlanEntry {
                    build_dir: self
                        .build_root
                        .join(format!("{}-{}", formula.name, formula.version)),
                    dependencies: adjacency.get(&name).cloned().unwrap_or_default(),
                    formula: Arc::clone(formula),
                })
            })
            .collect::<Vec<_>>();

        debug!(
            "Build plan: {}",
            entries
                .iter()
                .map(PlanEntry::name)
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(BuildPlan { entries })
    }

    /// Adjacency (node -> direct predecessors) of the transitive closure of `targets`.
    fn closure(
        &self,
        targets: &BTreeSet<String>,
        options: &PlanOptions,
    ) -> Result<BTreeMap<String, Vec<String>>> {
        let mut adjacency: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut queue: VecDeque<(String, String)> = targets
            .iter()
            .map(|t| (t.clone(), "the build request".to_string()))
            .collect();

        while let Some((name, required_by)) = queue.pop_front() {
            if adjacency.contains_key(&name) {
                continue;
            }
            let spec = self
                .formulas
                .get(&name)
                .ok_or_else(|| KilnError::UnknownDependency {
                    name: name.clone(),
                    required_by: required_by.clone(),
                })?;
            let edges = self.edges_of(spec, options);
            for dep in &edges {
                if !adjacency.contains_key(dep) {
                    queue.push_back((dep.clone(), name.clone()));
                }
            }
            adjacency.insert(name, edges);
        }
        Ok(adjacency)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Depth-first search in lexical order. On the first back edge, returns the shortest cycle
/// through the node the back edge points at, as `[n, .., n]`.
fn find_cycle(adjacency: &BTreeMap<String, Vec<String>>) -> Option<Vec<String>> {
    let mut marks: HashMap<&str, Mark> = adjacency
        .keys()
        .map(|k| (k.as_str(), Mark::Unvisited))
        .collect();

    for start in adjacency.keys() {
        if marks.get(start.as_str()) != Some(&Mark::Unvisited) {
            continue;
        }
        // Iterative DFS: (node, index of next edge to explore)
        let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
        marks.insert(start.as_str(), Mark::InProgress);

        while let Some((node, next_edge)) = stack.last_mut() {
            let edges = adjacency.get(*node).map(Vec::as_slice).unwrap_or(&[]);
            if *next_edge >= edges.len() {
                marks.insert(node, Mark::Done);
                stack.pop();
                continue;
            }
            let dep = edges[*next_edge].as_str();
            *next_edge += 1;
            match marks.get(dep).copied().unwrap_or(Mark::Done) {
                Mark::Unvisited => {
                    marks.insert(dep, Mark::InProgress);
                    stack.push((dep, 0));
                }
                Mark::InProgress => return shortest_cycle_through(dep, adjacency),
                Mark::Done => {}
            }
        }
    }
    None
}

/// Breadth-first search from `start` back to itself.
fn shortest_cycle_through(
    start: &str,
    adjacency: &BTreeMap<String, Vec<String>>,
) -> Option<Vec<String>> {
    let mut parent: HashMap<&str, &str> = HashMap::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    queue.push_back(start);

    while let Some(node) = queue.pop_front() {
        for dep in adjacency.get(node).into_iter().flatten() {
            let dep = dep.as_str();
            if dep == start {
                let mut path = vec![start.to_string()];
                let mut cursor = node;
                let mut reversed = Vec::new();
                while cursor != start {
                    reversed.push(cursor.to_string());
                    cursor = parent.get(cursor)?;
                }
                path.extend(reversed.into_iter().rev());
                path.push(start.to_string());
                return Some(path);
            }
            if !parent.contains_key(dep) {
                parent.insert(dep, node);
                queue.push_back(dep);
            }
        }
    }
    None
}

/// Kahn's algorithm with a lexically ordered ready set.
fn topological_order(adjacency: &BTreeMap<String, Vec<String>>) -> Result<Vec<String>> {
    let mut remaining: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (node, deps) in adjacency {
        remaining.insert(node.as_str(), deps.len());
        for dep in deps {
            dependents.entry(dep.as_str()).or_default().push(node.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(node, _)| *node)
        .collect();
    let mut order = Vec::with_capacity(adjacency.len());

    while let Some(node) = ready.pop_first() {
        order.push(node.to_string());
        for dependent in dependents.get(node).into_iter().flatten() {
            if let Some(count) = remaining.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if order.len() != adjacency.len() {
        let stuck: Vec<String> = remaining
            .iter()
            .filter(|(_, c)| **c > 0)
            .map(|(n, _)| n.to_string())
            .collect();
        return Err(KilnError::Cycle { path: stuck });
    }
    Ok(order)
}
