// src/dag/graph.rs

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graphmap::DiGraphMap;
use tracing::debug;

use crate::config::{PipelineDefinition, StepKind, StepSpec};
use crate::context::RunEnvironment;
use crate::errors::GraphError;
use crate::expr::{template_expressions, Expr, OutputRef};

/// Qualified node identifier: `<job>.<step>`.
pub type NodeId = String;

/// How a node's condition is decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionState {
    /// No `if`: run when every predecessor succeeded.
    Unconditional,
    /// Evaluated at build time against the frozen run environment.
    Static(bool),
    /// Needs step outputs or predecessor status; evaluated when the node's
    /// predecessors are terminal.
    Deferred(Expr),
}

impl ConditionState {
    /// Whether the node may run even though a predecessor did not succeed.
    pub fn runs_after_upstream_failure(&self) -> bool {
        match self {
            ConditionState::Deferred(expr) => expr.runs_after_upstream_failure(),
            _ => false,
        }
    }
}

/// One step of the pipeline with its resolved edges.
#[derive(Debug, Clone, PartialEq)]
pub struct DagNode {
    pub id: NodeId,
    pub job: String,
    /// Position in declaration order across the whole definition.
    pub index: usize,
    pub spec: StepSpec,
    pub condition: ConditionState,
    /// Direct predecessors, in declaration order.
    pub predecessors: Vec<NodeId>,
    /// Direct successors, in declaration order.
    pub successors: Vec<NodeId>,
}

/// Immutable step DAG for one run.
///
/// Nodes are stored in declaration order (jobs in file order, steps in job
/// order). Equality is structural, so building twice from the same
/// definition and environment yields equal graphs.
#[derive(Debug, Clone, PartialEq)]
pub struct DagGraph {
    nodes: Vec<DagNode>,
    by_id: HashMap<NodeId, usize>,
}

impl DagGraph {
    /// Build the step DAG for `definition` under the frozen `env`.
    ///
    /// Edges come from three sources:
    /// - consecutive steps of a job,
    /// - job `needs` (last step of the needed job before the first step),
    /// - `steps.<id>.outputs.<key>` / `jobs.<job>.steps.<id>.outputs.<key>`
    ///   references in `with`, `env`, `run` and `if`.
    pub fn build(definition: &PipelineDefinition, env: &RunEnvironment) -> Result<Self, GraphError> {
        let mut nodes = Vec::new();
        let mut by_id = HashMap::new();

        for job in definition.jobs() {
            let mut seen = HashSet::new();
            for step in &job.steps {
                if !seen.insert(step.id.as_str()) {
                    return Err(GraphError::DuplicateStep {
                        job: job.name.clone(),
                        id: step.id.clone(),
                    });
                }
                let id = format!("{}.{}", job.name, step.id);
                let index = nodes.len();
                by_id.insert(id.clone(), index);
                nodes.push(DagNode {
                    id,
                    job: job.name.clone(),
                    index,
                    spec: step.clone(),
                    condition: ConditionState::Unconditional,
                    predecessors: Vec::new(),
                    successors: Vec::new(),
                });
            }
        }

        let mut edges: BTreeSet<(usize, usize)> = BTreeSet::new();

        // Explicit: declared order within a job.
        for job in definition.jobs() {
            for pair in job.steps.windows(2) {
                let from = by_id[&format!("{}.{}", job.name, pair[0].id)];
                let to = by_id[&format!("{}.{}", job.name, pair[1].id)];
                edges.insert((from, to));
            }
        }

        // Job-level `needs`.
        for job in definition.jobs() {
            let Some(first) = job.steps.first() else {
                continue;
            };
            let to = by_id[&format!("{}.{}", job.name, first.id)];
            for need in &job.needs {
                if let Some(last) = definition.job(need).and_then(|j| j.steps.last()) {
                    edges.insert((by_id[&format!("{}.{}", need, last.id)], to));
                }
            }
        }

        // Implicit: output references.
        for node in &nodes {
            for expr in step_expressions(node)? {
                for path in expr.paths() {
                    let root = path.first().map(String::as_str);
                    if !matches!(root, Some("steps" | "jobs")) {
                        continue;
                    }
                    let reference = OutputRef::from_path(path, &node.job).ok_or_else(|| {
                        GraphError::InvalidExpression {
                            step: node.id.clone(),
                            message: format!(
                                "unsupported reference '{}' (expected steps.<id>.outputs.<key> or jobs.<job>.steps.<id>.outputs.<key>)",
                                path.join(".")
                            ),
                        }
                    })?;
                    let producer = by_id
                        .get(&reference.node_id())
                        .copied()
                        .filter(|&p| nodes[p].spec.outputs.contains(&reference.key))
                        // Within a job only earlier steps can provide outputs.
                        .filter(|&p| nodes[p].job != node.job || p < node.index)
                        .ok_or_else(|| GraphError::UnknownReference {
                            step: node.id.clone(),
                            reference: reference.to_string(),
                        })?;
                    edges.insert((producer, node.index));
                }
            }
        }

        check_acyclic(&nodes, &edges)?;

        for &(from, to) in &edges {
            let to_id = nodes[to].id.clone();
            let from_id = nodes[from].id.clone();
            nodes[from].successors.push(to_id);
            nodes[to].predecessors.push(from_id);
        }
        for node in nodes.iter_mut() {
            node.predecessors.sort_by_key(|id| by_id[id]);
            node.successors.sort_by_key(|id| by_id[id]);
        }

        // Conditions.
        let event = env.trigger().event;
        let git_ref = env.trigger().git_ref.clone();
        for node in nodes.iter_mut() {
            let job_matches = definition
                .job(&node.job)
                .map(|j| j.matches_trigger(event, &git_ref))
                .unwrap_or(false);

            node.condition = if !job_matches {
                debug!(step = %node.id, %event, "job not triggered by this event; step statically skipped");
                ConditionState::Static(false)
            } else {
                match node.spec.condition.as_deref() {
                    None => ConditionState::Unconditional,
                    Some(src) => {
                        let expr = parse_condition(&node.id, src)?;
                        if expr.is_static() {
                            ConditionState::Static(expr.eval_condition(env))
                        } else {
                            ConditionState::Deferred(expr)
                        }
                    }
                }
            };
        }

        Ok(Self { nodes, by_id })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[DagNode] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&DagNode> {
        self.by_id.get(id).map(|&i| &self.nodes[i])
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.by_id.get(id).copied()
    }

    pub fn predecessors_of(&self, id: &str) -> &[NodeId] {
        self.node(id).map(|n| n.predecessors.as_slice()).unwrap_or(&[])
    }

    pub fn successors_of(&self, id: &str) -> &[NodeId] {
        self.node(id).map(|n| n.successors.as_slice()).unwrap_or(&[])
    }

    /// Nodes without predecessors.
    pub fn roots(&self) -> impl Iterator<Item = &DagNode> {
        self.nodes.iter().filter(|n| n.predecessors.is_empty())
    }

    /// A topological order; among nodes available at the same time the one
    /// declared first comes first.
    pub fn topological_order(&self) -> Vec<&NodeId> {
        let mut indegree: Vec<usize> = self.nodes.iter().map(|n| n.predecessors.len()).collect();
        let mut heap: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(i)) = heap.pop() {
            order.push(&self.nodes[i].id);
            for succ in &self.nodes[i].successors {
                let j = self.by_id[succ];
                indegree[j] -= 1;
                if indegree[j] == 0 {
                    heap.push(Reverse(j));
                }
            }
        }
        order
    }
}

/// Strip an optional `${{ ... }}` wrapper and parse a condition.
fn parse_condition(step: &str, src: &str) -> Result<Expr, GraphError> {
    let trimmed = src.trim();
    let inner = trimmed
        .strip_prefix("${{")
        .and_then(|s| s.strip_suffix("}}"))
        .unwrap_or(trimmed);
    Expr::parse(inner).map_err(|e| GraphError::InvalidExpression {
        step: step.to_string(),
        message: e.to_string(),
    })
}

/// Every expression a step contains: placeholders in `with`, `env` and
/// `run`, plus its condition.
fn step_expressions(node: &DagNode) -> Result<Vec<Expr>, GraphError> {
    let invalid = |e: crate::expr::ExprError| GraphError::InvalidExpression {
        step: node.id.clone(),
        message: e.to_string(),
    };

    let mut exprs = Vec::new();
    for value in node.spec.with.values().chain(node.spec.env.values()) {
        exprs.extend(template_expressions(value).map_err(invalid)?);
    }
    if let StepKind::Command { run } = &node.spec.kind {
        exprs.extend(template_expressions(run).map_err(invalid)?);
    }
    if let Some(cond) = &node.spec.condition {
        exprs.push(parse_condition(&node.id, cond)?);
    }
    Ok(exprs)
}

fn check_acyclic(nodes: &[DagNode], edges: &BTreeSet<(usize, usize)>) -> Result<(), GraphError> {
    let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
    for node in nodes {
        graph.add_node(node.index);
    }
    for &(from, to) in edges {
        graph.add_edge(from, to, ());
    }

    // A topological sort will fail if there is a cycle.
    let start = match toposort(&graph, None) {
        Ok(_) => return Ok(()),
        Err(cycle) => cycle.node_id(),
    };

    let scc: HashSet<usize> = tarjan_scc(&graph)
        .into_iter()
        .find(|component| component.contains(&start))
        .map(|component| component.into_iter().collect())
        .unwrap_or_default();

    let path = cycle_through(&graph, start, &scc)
        .into_iter()
        .map(|i| nodes[i].id.clone())
        .collect();
    Err(GraphError::Cycle { path })
}

/// Shortest cycle through `start` inside its strongly connected component,
/// returned closed (`a, b, a`).
fn cycle_through(graph: &DiGraphMap<usize, ()>, start: usize, scc: &HashSet<usize>) -> Vec<usize> {
    let mut parent: HashMap<usize, usize> = HashMap::new();
    let mut queue = VecDeque::from([start]);
    let mut visited = HashSet::from([start]);

    while let Some(u) = queue.pop_front() {
        for v in graph.neighbors(u) {
            if v == start {
                let mut path = vec![u];
                let mut cur = u;
                while cur != start {
                    cur = parent[&cur];
                    path.push(cur);
                }
                path.reverse();
                path.push(start);
                return path;
            }
            if scc.contains(&v) && visited.insert(v) {
                parent.insert(v, u);
                queue.push_back(v);
            }
        }
    }

    vec![start, start]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_definition;
    use crate::context::TriggerContext;
    use crate::types::TriggerKind;
    use uuid::Uuid;

    fn build(toml: &str, trigger: TriggerContext) -> Result<DagGraph, GraphError> {
        let def = parse_definition(toml).unwrap();
        let env = RunEnvironment::freeze(Uuid::nil(), &def, &trigger);
        DagGraph::build(&def, &env)
    }

    fn push() -> TriggerContext {
        TriggerContext::new(TriggerKind::Push)
    }

    #[test]
    fn chains_steps_of_a_job_in_declared_order() {
        let g = build(
            r#"
[[job]]
name = "build"

[[job.step]]
id = "a"
run = "true"

[[job.step]]
id = "b"
run = "true"

[[job.step]]
id = "c"
run = "true"
"#,
            push(),
        )
        .unwrap();

        assert_eq!(g.predecessors_of("build.b"), ["build.a".to_string()]);
        assert_eq!(g.successors_of("build.b"), ["build.c".to_string()]);
        let order: Vec<&str> = g.topological_order().into_iter().map(String::as_str).collect();
        assert_eq!(order, vec!["build.a", "build.b", "build.c"]);
    }

    #[test]
    fn needs_link_last_step_to_first_step() {
        let g = build(
            r#"
[[job]]
name = "deploy"
needs = ["build"]

[[job.step]]
id = "push"
run = "true"

[[job]]
name = "build"

[[job.step]]
id = "compile"
run = "true"

[[job.step]]
id = "bundle"
run = "true"
"#,
            push(),
        )
        .unwrap();

        assert_eq!(g.predecessors_of("deploy.push"), ["build.bundle".to_string()]);
        let order: Vec<&str> = g.topological_order().into_iter().map(String::as_str).collect();
        assert_eq!(order, vec!["build.compile", "build.bundle", "deploy.push"]);
    }

    #[test]
    fn cross_job_output_reference_adds_implicit_edge() {
        let g = build(
            r#"
[[job]]
name = "docs"

[[job.step]]
id = "gen"
run = "true"
outputs = ["dir"]

[[job]]
name = "site"

[[job.step]]
id = "copy"
run = "cp -r ${{ jobs.docs.steps.gen.outputs.dir }} public/"
"#,
            push(),
        )
        .unwrap();

        assert_eq!(g.predecessors_of("site.copy"), ["docs.gen".to_string()]);
    }

    #[test]
    fn reports_unknown_output_reference() {
        let err = build(
            r#"
[[job]]
name = "build"

[[job.step]]
id = "a"
run = "true"

[[job.step]]
id = "b"
uses = "deploy"
with = { url = "${{ steps.a.outputs.url }}" }
"#,
            push(),
        )
        .unwrap_err();

        assert_eq!(
            err,
            GraphError::UnknownReference {
                step: "build.b".to_string(),
                reference: "build.a.outputs.url".to_string(),
            }
        );
    }

    #[test]
    fn reference_to_later_step_in_same_job_is_unknown() {
        let err = build(
            r#"
[[job]]
name = "build"

[[job.step]]
id = "a"
run = "echo ${{ steps.b.outputs.x }}"

[[job.step]]
id = "b"
run = "true"
outputs = ["x"]
"#,
            push(),
        )
        .unwrap_err();

        assert_eq!(
            err,
            GraphError::UnknownReference {
                step: "build.a".to_string(),
                reference: "build.b.outputs.x".to_string(),
            }
        );
    }

    #[test]
    fn rejects_duplicate_step_ids() {
        let err = build(
            r#"
[[job]]
name = "build"

[[job.step]]
id = "a"
run = "true"

[[job.step]]
id = "a"
run = "true"
"#,
            push(),
        )
        .unwrap_err();

        assert_eq!(
            err,
            GraphError::DuplicateStep {
                job: "build".to_string(),
                id: "a".to_string()
            }
        );
    }

    #[test]
    fn evaluates_static_conditions_and_defers_dynamic_ones() {
        let toml = r#"
[[job]]
name = "build"
on = ["push"]

[[job.step]]
id = "only-pr"
run = "true"
if = "trigger.event == 'pull_request'"

[[job.step]]
id = "on-push"
run = "true"
if = "${{ trigger.event == 'push' }}"

[[job.step]]
id = "cleanup"
run = "true"
if = "always()"

[[job]]
name = "manual"
on = ["workflow_dispatch"]

[[job.step]]
id = "x"
run = "true"
"#;
        let g = build(toml, push()).unwrap();

        assert_eq!(g.node("build.only-pr").unwrap().condition, ConditionState::Static(false));
        assert_eq!(g.node("build.on-push").unwrap().condition, ConditionState::Static(true));
        assert!(matches!(
            g.node("build.cleanup").unwrap().condition,
            ConditionState::Deferred(_)
        ));
        assert_eq!(g.node("manual.x").unwrap().condition, ConditionState::Static(false));
    }

    #[test]
    fn build_is_idempotent() {
        let toml = r#"
[[job]]
name = "build"

[[job.step]]
id = "a"
run = "true"
outputs = ["v"]

[[job.step]]
id = "b"
run = "echo ${{ steps.a.outputs.v }}"
"#;
        let def = parse_definition(toml).unwrap();
        let env = RunEnvironment::freeze(Uuid::nil(), &def, &push());
        assert_eq!(DagGraph::build(&def, &env).unwrap(), DagGraph::build(&def, &env).unwrap());
    }
}
