//! Declarative description of a step graph and its structural validation.

use std::collections::{HashMap, HashSet, VecDeque};

use rowflow_types::Schema;
use serde::{Deserialize, Serialize};

use crate::errors::StructuralError;
use crate::step::StepRegistry;

/// How a producer's rows are spread over its output hops.
///
/// Every `Copy` hop receives each row. `Distribute` hops share the rows
/// round-robin, one row to one hop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanPolicy {
    #[default]
    Copy,
    Distribute,
}

/// How the copies on both ends of a hop are connected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Wiring {
    /// Partitioned when both sides run the same number of copies, all-to-all
    /// otherwise.
    #[default]
    Auto,
    AllToAll,
    /// Copy `i` feeds copy `i` only.
    Partitioned,
}

impl Wiring {
    /// Concrete wiring for a hop between `from` and `to` copies.
    #[must_use]
    pub fn resolve(self, from: usize, to: usize) -> Self {
        match self {
            Self::Auto if from == to => Self::Partitioned,
            Self::Auto => Self::AllToAll,
            explicit => explicit,
        }
    }
}

/// Order in which a step with several inputs reads them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputPolicy {
    /// Rotate across inputs that still have data.
    #[default]
    RoundRobin,
    /// Drain input 0 to completion, then input 1, and so on.
    Sequential,
}

/// What happens to a row whose processing raised a row-level error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowErrorPolicy {
    /// Escalate to a step-fatal error.
    #[default]
    Fail,
    /// Count the error and drop the row.
    Skip,
    /// Send an error row down the step's error hops.
    Redirect,
}

/// One step of the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDecl {
    pub name: String,
    /// Registered step type used to instantiate each copy.
    pub logic: String,
    pub copies: usize,
    pub config: serde_json::Value,
    pub input_policy: InputPolicy,
    pub on_row_error: RowErrorPolicy,
}

impl StepDecl {
    pub fn new(name: impl Into<String>, logic: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            logic: logic.into(),
            copies: 1,
            config: serde_json::Value::Null,
            input_policy: InputPolicy::default(),
            on_row_error: RowErrorPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_copies(mut self, copies: usize) -> Self {
        self.copies = copies;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_input_policy(mut self, policy: InputPolicy) -> Self {
        self.input_policy = policy;
        self
    }

    #[must_use]
    pub fn with_row_error_policy(mut self, policy: RowErrorPolicy) -> Self {
        self.on_row_error = policy;
        self
    }
}

/// Directed connection between two steps.
#[derive(Debug, Clone, PartialEq)]
pub struct HopDecl {
    pub from: String,
    pub to: String,
    pub fan: FanPolicy,
    pub wiring: Wiring,
    /// Carries error rows instead of regular output.
    pub error: bool,
    /// Schema every row crossing the hop must be compatible with.
    pub schema: Option<Schema>,
    /// Overrides the engine's default channel capacity.
    pub capacity: Option<usize>,
}

impl HopDecl {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            fan: FanPolicy::default(),
            wiring: Wiring::default(),
            error: false,
            schema: None,
            capacity: None,
        }
    }

    /// Hop carrying the error rows of `from`.
    pub fn error(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            error: true,
            ..Self::new(from, to)
        }
    }

    #[must_use]
    pub fn with_fan(mut self, fan: FanPolicy) -> Self {
        self.fan = fan;
        self
    }

    #[must_use]
    pub fn with_wiring(mut self, wiring: Wiring) -> Self {
        self.wiring = wiring;
        self
    }

    #[must_use]
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    fn label(&self) -> String {
        format!("hop '{}' -> '{}'", self.from, self.to)
    }
}

/// Steps plus hops, the unit the orchestrator builds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineGraph {
    pub name: String,
    pub steps: Vec<StepDecl>,
    pub hops: Vec<HopDecl>,
}

impl PipelineGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            hops: Vec::new(),
        }
    }

    #[must_use]
    pub fn step(mut self, decl: StepDecl) -> Self {
        self.steps.push(decl);
        self
    }

    #[must_use]
    pub fn hop(mut self, decl: HopDecl) -> Self {
        self.hops.push(decl);
        self
    }

    pub fn find_step(&self, name: &str) -> Option<&StepDecl> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn inputs_of<'a>(&'a self, step: &'a str) -> impl Iterator<Item = &'a HopDecl> + 'a {
        self.hops.iter().filter(move |h| h.to == step)
    }

    pub fn outputs_of<'a>(&'a self, step: &'a str) -> impl Iterator<Item = &'a HopDecl> + 'a {
        self.hops.iter().filter(move |h| h.from == step)
    }

    /// Concrete wiring of `hop`, resolving `Auto` against the copy counts.
    /// Returns `None` if either endpoint is unknown.
    pub fn resolved_wiring(&self, hop: &HopDecl) -> Option<Wiring> {
        let from = self.find_step(&hop.from)?.copies;
        let to = self.find_step(&hop.to)?.copies;
        Some(hop.wiring.resolve(from, to))
    }

    /// Check the graph against `registry`. Every structural problem is
    /// reported before any step is instantiated.
    pub fn validate(&self, registry: &StepRegistry) -> Result<(), StructuralError> {
        self.validate_steps(registry)?;
        self.validate_hops()?;
        self.validate_error_routing()?;
        self.topological_order().map(|_| ())
    }

    fn validate_steps(&self, registry: &StepRegistry) -> Result<(), StructuralError> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(StructuralError::DuplicateStep {
                    name: step.name.clone(),
                });
            }
            if step.copies == 0 {
                return Err(StructuralError::ZeroCopies {
                    step: step.name.clone(),
                });
            }
            if !registry.contains(&step.logic) {
                return Err(StructuralError::UnknownLogic {
                    step: step.name.clone(),
                    logic: step.logic.clone(),
                });
            }
        }
        Ok(())
    }

    fn validate_hops(&self) -> Result<(), StructuralError> {
        let mut seen = HashSet::new();
        for hop in &self.hops {
            for end in [&hop.from, &hop.to] {
                if self.find_step(end).is_none() {
                    return Err(StructuralError::UnknownStep {
                        name: end.clone(),
                        referenced_by: hop.label(),
                    });
                }
            }
            if hop.from == hop.to {
                return Err(StructuralError::SelfLoop {
                    step: hop.from.clone(),
                });
            }
            if !seen.insert((hop.from.as_str(), hop.to.as_str())) {
                return Err(StructuralError::DuplicateHop {
                    from: hop.from.clone(),
                    to: hop.to.clone(),
                });
            }
            if hop.wiring == Wiring::Partitioned {
                let from_copies = self.find_step(&hop.from).map_or(0, |s| s.copies);
                let to_copies = self.find_step(&hop.to).map_or(0, |s| s.copies);
                if from_copies != to_copies {
                    return Err(StructuralError::CopyMismatch {
                        from: hop.from.clone(),
                        to: hop.to.clone(),
                        from_copies,
                        to_copies,
                    });
                }
            }
        }

        for step in &self.steps {
            let mut declared = self.inputs_of(&step.name).filter_map(|h| h.schema.as_ref());
            if let Some(first) = declared.next() {
                if let Some(other) = declared.find(|s| !first.is_compatible_with(s)) {
                    return Err(StructuralError::SchemaConflict {
                        step: step.name.clone(),
                        first: first.to_string(),
                        second: other.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn validate_error_routing(&self) -> Result<(), StructuralError> {
        for step in &self.steps {
            let redirects = step.on_row_error == RowErrorPolicy::Redirect;
            let has_error_hop = self.outputs_of(&step.name).any(|h| h.error);
            if redirects && !has_error_hop {
                return Err(StructuralError::MissingErrorHop {
                    step: step.name.clone(),
                });
            }
        }
        for hop in self.hops.iter().filter(|h| h.error) {
            let redirects = self
                .find_step(&hop.from)
                .is_some_and(|s| s.on_row_error == RowErrorPolicy::Redirect);
            if !redirects {
                return Err(StructuralError::UnexpectedErrorHop {
                    from: hop.from.clone(),
                    to: hop.to.clone(),
                });
            }
        }
        Ok(())
    }

    /// Step names ordered so that every producer precedes its consumers.
    ///
    /// Fails with [`StructuralError::Cycle`] naming one offending path.
    pub fn topological_order(&self) -> Result<Vec<&str>, StructuralError> {
        let index: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        let mut in_degree = vec![0usize; self.steps.len()];
        for hop in &self.hops {
            let (Some(&from), Some(&to)) =
                (index.get(hop.from.as_str()), index.get(hop.to.as_str()))
            else {
                return Err(StructuralError::UnknownStep {
                    name: if index.contains_key(hop.from.as_str()) {
                        hop.to.clone()
                    } else {
                        hop.from.clone()
                    },
                    referenced_by: hop.label(),
                });
            };
            successors[from].push(to);
            in_degree[to] += 1;
        }

        // Kahn's algorithm, seeded in declaration order.
        let mut ready: VecDeque<usize> =
            (0..self.steps.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.steps.len());
        while let Some(node) = ready.pop_front() {
            order.push(node);
            for &next in &successors[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }

        if order.len() < self.steps.len() {
            let remaining: Vec<bool> = in_degree.iter().map(|&d| d > 0).collect();
            let path = find_cycle(&successors, &remaining)
                .into_iter()
                .map(|i| self.steps[i].name.clone())
                .collect();
            return Err(StructuralError::Cycle { path });
        }
        Ok(order.into_iter().map(|i| self.steps[i].name.as_str()).collect())
    }
}

/// Find one cycle among the nodes Kahn's algorithm could not release.
///
/// Each such node still has an unreleased predecessor, so walking
/// predecessors inside that set must revisit a node.
fn find_cycle(successors: &[Vec<usize>], remaining: &[bool]) -> Vec<usize> {
    let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); successors.len()];
    for (from, targets) in successors.iter().enumerate() {
        for &to in targets {
            predecessors[to].push(from);
        }
    }

    let Some(start) = remaining.iter().position(|&r| r) else {
        return Vec::new();
    };
    let mut path = vec![start];
    let mut position: HashMap<usize, usize> = HashMap::from([(start, 0)]);
    let mut node = start;
    while let Some(&prev) = predecessors[node].iter().find(|&&p| remaining[p]) {
        if let Some(&at) = position.get(&prev) {
            // `path` runs against hop direction; flip it back.
            let mut cycle = path.split_off(at);
            cycle.reverse();
            cycle.rotate_right(1);
            cycle.push(cycle[0]);
            return cycle;
        }
        position.insert(prev, path.len());
        path.push(prev);
        node = prev;
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowflow_types::{FieldMeta, FieldType};

    fn registry() -> StepRegistry {
        StepRegistry::with_builtins()
    }

    fn linear() -> PipelineGraph {
        PipelineGraph::new("linear")
            .step(StepDecl::new("a", "dummy"))
            .step(StepDecl::new("b", "dummy"))
            .step(StepDecl::new("c", "dummy"))
            .hop(HopDecl::new("a", "b"))
            .hop(HopDecl::new("b", "c"))
    }

    #[test]
    fn test_topological_order_linear() {
        let g = linear();
        g.validate(&registry()).unwrap();
        assert_eq!(g.topological_order().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_topological_order_respects_hops_not_declaration() {
        let g = PipelineGraph::new("p")
            .step(StepDecl::new("sink", "dummy"))
            .step(StepDecl::new("src", "dummy"))
            .hop(HopDecl::new("src", "sink"));
        assert_eq!(g.topological_order().unwrap(), vec!["src", "sink"]);
    }

    #[test]
    fn test_cycle_reports_path() {
        let g = PipelineGraph::new("p")
            .step(StepDecl::new("a", "dummy"))
            .step(StepDecl::new("b", "dummy"))
            .hop(HopDecl::new("a", "b"))
            .hop(HopDecl::new("b", "a"));
        let err = g.validate(&registry()).unwrap_err();
        match err {
            StructuralError::Cycle { path } => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 3);
                assert!(path.contains(&"a".to_string()));
                assert!(path.contains(&"b".to_string()));
            }
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn test_cycle_behind_a_source_is_found() {
        let g = PipelineGraph::new("p")
            .step(StepDecl::new("src", "dummy"))
            .step(StepDecl::new("x", "dummy"))
            .step(StepDecl::new("y", "dummy"))
            .step(StepDecl::new("z", "dummy"))
            .hop(HopDecl::new("src", "x"))
            .hop(HopDecl::new("x", "y"))
            .hop(HopDecl::new("y", "z"))
            .hop(HopDecl::new("z", "x"));
        let Err(StructuralError::Cycle { path }) = g.topological_order() else {
            panic!("expected a cycle");
        };
        assert_eq!(path, vec!["x", "y", "z", "x"]);
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let g = PipelineGraph::new("p")
            .step(StepDecl::new("a", "dummy"))
            .step(StepDecl::new("a", "dummy"));
        assert!(matches!(
            g.validate(&registry()),
            Err(StructuralError::DuplicateStep { .. })
        ));
    }

    #[test]
    fn test_zero_copies_rejected() {
        let g = PipelineGraph::new("p").step(StepDecl::new("a", "dummy").with_copies(0));
        assert!(matches!(
            g.validate(&registry()),
            Err(StructuralError::ZeroCopies { .. })
        ));
    }

    #[test]
    fn test_unknown_logic_rejected() {
        let g = PipelineGraph::new("p").step(StepDecl::new("a", "no_such_step"));
        assert!(matches!(
            g.validate(&registry()),
            Err(StructuralError::UnknownLogic { .. })
        ));
    }

    #[test]
    fn test_unknown_hop_endpoint_rejected() {
        let g = PipelineGraph::new("p")
            .step(StepDecl::new("a", "dummy"))
            .hop(HopDecl::new("a", "ghost"));
        let err = g.validate(&registry()).unwrap_err();
        assert_eq!(
            err,
            StructuralError::UnknownStep {
                name: "ghost".into(),
                referenced_by: "hop 'a' -> 'ghost'".into(),
            }
        );
    }

    #[test]
    fn test_self_loop_rejected() {
        let g = PipelineGraph::new("p")
            .step(StepDecl::new("a", "dummy"))
            .hop(HopDecl::new("a", "a"));
        assert!(matches!(
            g.validate(&registry()),
            Err(StructuralError::SelfLoop { .. })
        ));
    }

    #[test]
    fn test_partitioned_requires_equal_copies() {
        let g = PipelineGraph::new("p")
            .step(StepDecl::new("a", "dummy").with_copies(2))
            .step(StepDecl::new("b", "dummy").with_copies(3))
            .hop(HopDecl::new("a", "b").with_wiring(Wiring::Partitioned));
        assert!(matches!(
            g.validate(&registry()),
            Err(StructuralError::CopyMismatch { from_copies: 2, to_copies: 3, .. })
        ));
    }

    #[test]
    fn test_auto_wiring_resolution() {
        let g = PipelineGraph::new("p")
            .step(StepDecl::new("a", "dummy").with_copies(2))
            .step(StepDecl::new("b", "dummy").with_copies(2))
            .step(StepDecl::new("c", "dummy"))
            .hop(HopDecl::new("a", "b"))
            .hop(HopDecl::new("b", "c"));
        assert_eq!(g.resolved_wiring(&g.hops[0]), Some(Wiring::Partitioned));
        assert_eq!(g.resolved_wiring(&g.hops[1]), Some(Wiring::AllToAll));
    }

    #[test]
    fn test_conflicting_input_schemas_rejected() {
        let ints = Schema::new(vec![FieldMeta::new("id", FieldType::Integer)]);
        let strings = Schema::new(vec![FieldMeta::new("id", FieldType::String)]);
        let g = PipelineGraph::new("p")
            .step(StepDecl::new("a", "dummy"))
            .step(StepDecl::new("b", "dummy"))
            .step(StepDecl::new("c", "dummy"))
            .hop(HopDecl::new("a", "c").with_schema(ints))
            .hop(HopDecl::new("b", "c").with_schema(strings));
        assert!(matches!(
            g.validate(&registry()),
            Err(StructuralError::SchemaConflict { .. })
        ));
    }

    #[test]
    fn test_redirect_requires_error_hop() {
        let g = PipelineGraph::new("p")
            .step(StepDecl::new("a", "dummy").with_row_error_policy(RowErrorPolicy::Redirect));
        assert!(matches!(
            g.validate(&registry()),
            Err(StructuralError::MissingErrorHop { .. })
        ));
    }

    #[test]
    fn test_error_hop_requires_redirect() {
        let g = PipelineGraph::new("p")
            .step(StepDecl::new("a", "dummy"))
            .step(StepDecl::new("errors", "dummy"))
            .hop(HopDecl::error("a", "errors"));
        assert!(matches!(
            g.validate(&registry()),
            Err(StructuralError::UnexpectedErrorHop { .. })
        ));
    }

    #[test]
    fn test_valid_error_routing() {
        let g = PipelineGraph::new("p")
            .step(StepDecl::new("a", "dummy").with_row_error_policy(RowErrorPolicy::Redirect))
            .step(StepDecl::new("ok", "dummy"))
            .step(StepDecl::new("errors", "dummy"))
            .hop(HopDecl::new("a", "ok"))
            .hop(HopDecl::error("a", "errors"));
        g.validate(&registry()).unwrap();
    }
}
