use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::domain::Project;
use crate::error::ConfigurationError;

/// Validated "depends-on" graph of a project.
///
/// Nodes are kept in declaration order; every ordering this type produces
/// breaks ties by that order, so results are reproducible across runs.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
    position: Vec<usize>,
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl DependencyGraph {
    pub fn build(project: &Project) -> Result<Self, ConfigurationError> {
        let names = project.names();
        let index: HashMap<String, usize> = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        let mut dependencies = vec![Vec::new(); names.len()];
        let mut dependents = vec![Vec::new(); names.len()];

        for (i, spec) in project.services().enumerate() {
            for dep in &spec.depends_on {
                let Some(&j) = index.get(dep) else {
                    return Err(ConfigurationError::UnknownDependency {
                        service: spec.name.clone(),
                        missing: dep.clone(),
                    });
                };
                if !dependencies[i].contains(&j) {
                    dependencies[i].push(j);
                    dependents[j].push(i);
                }
            }
        }
        for list in dependents.iter_mut() {
            list.sort_unstable();
        }

        let mut graph = Self {
            names,
            index,
            dependencies,
            dependents,
            order: Vec::new(),
            position: Vec::new(),
        };
        graph.order = graph.topological_order()?;
        graph.position = vec![0; graph.names.len()];
        for (pos, &node) in graph.order.iter().enumerate() {
            graph.position[node] = pos;
        }

        Ok(graph)
    }

    /// Kahn's algorithm, always releasing the earliest-declared ready node first
    fn topological_order(&self) -> Result<Vec<usize>, ConfigurationError> {
        let mut remaining: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = remaining
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.names.len());
        while let Some(Reverse(node)) = ready.pop() {
            order.push(node);
            for &dependent in &self.dependents[node] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        if order.len() < self.names.len() {
            return Err(ConfigurationError::CyclicDependency {
                cycle: self.find_cycle(),
            });
        }
        Ok(order)
    }

    fn find_cycle(&self) -> Vec<String> {
        let mut marks = vec![Mark::Unvisited; self.names.len()];
        let mut stack = Vec::new();

        for start in 0..self.names.len() {
            if marks[start] == Mark::Unvisited {
                if let Some(cycle) = self.visit(start, &mut marks, &mut stack) {
                    return cycle;
                }
            }
        }
        Vec::new()
    }

    fn visit(&self, node: usize, marks: &mut [Mark], stack: &mut Vec<usize>) -> Option<Vec<String>> {
        marks[node] = Mark::InProgress;
        stack.push(node);

        for &dep in &self.dependencies[node] {
            match marks[dep] {
                Mark::InProgress => {
                    let from = stack.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[from..].iter().map(|&n| self.names[n].clone()).collect();
                    cycle.push(self.names[dep].clone());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = self.visit(dep, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        stack.pop();
        marks[node] = Mark::Done;
        None
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Every service after all of its dependencies
    pub fn start_order(&self) -> Vec<String> {
        self.order.iter().map(|&i| self.names[i].clone()).collect()
    }

    /// Position of a service in [`DependencyGraph::start_order`]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).map(|&i| self.position[i])
    }

    pub fn dependencies(&self, name: &str) -> Vec<String> {
        self.neighbours(name, &self.dependencies)
    }

    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.neighbours(name, &self.dependents)
    }

    /// All direct and indirect dependencies, in start order. Unknown names yield nothing.
    pub fn dependency_closure(&self, name: &str) -> Vec<String> {
        self.closure(name, &self.dependencies)
    }

    /// All direct and indirect dependents, in start order. Unknown names yield nothing.
    pub fn dependents_closure(&self, name: &str) -> Vec<String> {
        self.closure(name, &self.dependents)
    }

    /// Groups of services whose dependencies all sit in earlier groups
    pub fn start_levels(&self) -> Vec<Vec<String>> {
        let mut level = vec![0usize; self.names.len()];
        for &node in &self.order {
            level[node] = self.dependencies[node]
                .iter()
                .map(|&dep| level[dep] + 1)
                .max()
                .unwrap_or(0);
        }

        let depth = level.iter().copied().max().map_or(0, |max| max + 1);
        let mut levels = vec![Vec::new(); depth];
        for &node in &self.order {
            levels[level[node]].push(self.names[node].clone());
        }
        levels
    }

    fn neighbours(&self, name: &str, edges: &[Vec<usize>]) -> Vec<String> {
        match self.index.get(name) {
            Some(&i) => edges[i].iter().map(|&n| self.names[n].clone()).collect(),
            None => Vec::new(),
        }
    }

    fn closure(&self, name: &str, edges: &[Vec<usize>]) -> Vec<String> {
        let Some(&start) = self.index.get(name) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut frontier = vec![start];
        while let Some(node) = frontier.pop() {
            for &next in &edges[node] {
                if seen.insert(next) {
                    frontier.push(next);
                }
            }
        }
        seen.remove(&start);

        let mut members: Vec<usize> = seen.into_iter().collect();
        members.sort_by_key(|&n| self.position[n]);
        members.into_iter().map(|n| self.names[n].clone()).collect()
    }
}
