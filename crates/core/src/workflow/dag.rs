use crate::error::{EngineError, EngineResult};
use crate::types::{Step, StepId, Workflow};
use petgraph::algo::{kosaraju_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, EdgeRef};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap};

/// DAG view of a workflow template
///
/// Edges run from a dependency to its dependent (dep -> step).
pub struct WorkflowDag<'a> {
    graph: DiGraph<&'a Step, ()>,
    step_indices: HashMap<&'a StepId, NodeIndex>,
}

impl<'a> WorkflowDag<'a> {
    /// Build and validate the DAG of a workflow
    pub fn from_workflow(workflow: &'a Workflow) -> EngineResult<Self> {
        let mut graph = DiGraph::new();
        let mut step_indices = HashMap::new();

        for step in &workflow.steps {
            let node = graph.add_node(step);
            if step_indices.insert(&step.id, node).is_some() {
                return Err(EngineError::DuplicateStep(step.id.clone()));
            }
        }

        for step in &workflow.steps {
            let step_idx = step_indices[&step.id];
            for dep_id in &step.depends_on {
                let dep_idx = step_indices.get(dep_id).ok_or_else(|| {
                    EngineError::DanglingReference {
                        step: step.id.clone(),
                        missing: dep_id.clone(),
                    }
                })?;
                graph.update_edge(*dep_idx, step_idx, ());
            }
        }

        let dag = Self {
            graph,
            step_indices,
        };

        if let Some(cycle) = dag.find_cycle() {
            return Err(EngineError::Cycle { steps: cycle });
        }

        Ok(dag)
    }

    /// Validate a workflow without keeping the graph around
    pub fn validate(workflow: &Workflow) -> EngineResult<()> {
        WorkflowDag::from_workflow(workflow).map(|_| ())
    }

    /// Members of the first strongly connected component that forms a cycle
    fn find_cycle(&self) -> Option<Vec<StepId>> {
        if toposort(&self.graph, None).is_ok() {
            return None;
        }

        kosaraju_scc(&self.graph).into_iter().find_map(|component| {
            let is_cycle = component.len() > 1
                || self
                    .graph
                    .edges(component[0])
                    .any(|e| e.target() == component[0]);
            if !is_cycle {
                return None;
            }
            let mut steps: Vec<StepId> = component
                .iter()
                .map(|&n| self.graph[n].id.clone())
                .collect();
            steps.sort();
            Some(steps)
        })
    }

    /// Steps grouped into layers: every step's dependencies live in earlier layers
    pub fn topological_layers(&self) -> Vec<Vec<&'a Step>> {
        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        let order = match toposort(&self.graph, None) {
            Ok(order) => order,
            Err(_) => return Vec::new(),
        };

        for node in &order {
            let level = self
                .graph
                .neighbors_directed(*node, Direction::Incoming)
                .map(|dep| depth[&dep] + 1)
                .max()
                .unwrap_or(0);
            depth.insert(*node, level);
        }

        let layer_count = depth.values().copied().max().map_or(0, |d| d + 1);
        let mut layers: Vec<Vec<&Step>> = vec![Vec::new(); layer_count];
        for node in order {
            layers[depth[&node]].push(self.graph[node]);
        }
        for layer in &mut layers {
            layer.sort_by(|a, b| a.step_order.cmp(&b.step_order).then(a.id.cmp(&b.id)));
        }
        layers
    }

    /// Direct dependencies of a step
    pub fn dependencies(&self, step_id: &StepId) -> EngineResult<Vec<StepId>> {
        let node = self.node(step_id)?;
        Ok(self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .map(|n| self.graph[n].id.clone())
            .collect())
    }

    /// Every step reachable downstream of the given step, excluding itself
    pub fn transitive_dependents(&self, step_id: &StepId) -> EngineResult<BTreeSet<StepId>> {
        let start = self.node(step_id)?;
        let mut dfs = Dfs::new(&self.graph, start);
        let mut reached = BTreeSet::new();
        while let Some(node) = dfs.next(&self.graph) {
            if node != start {
                reached.insert(self.graph[node].id.clone());
            }
        }
        Ok(reached)
    }

    fn node(&self, step_id: &StepId) -> EngineResult<NodeIndex> {
        self.step_indices
            .get(step_id)
            .copied()
            .ok_or_else(|| EngineError::not_found("step", step_id))
    }
}
