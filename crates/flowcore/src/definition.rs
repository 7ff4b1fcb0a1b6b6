use crate::context::ContextView;
use crate::Value;
use petgraph::dot::{Config, Dot};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Value produced by a decision selector and matched against branch keys
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Discriminant {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for Discriminant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Discriminant::Bool(b) => write!(f, "{}", b),
            Discriminant::Int(n) => write!(f, "{}", n),
            Discriminant::Str(s) => write!(f, "\"{}\"", s),
        }
    }
}

impl From<bool> for Discriminant {
    fn from(b: bool) -> Self {
        Discriminant::Bool(b)
    }
}

impl From<i64> for Discriminant {
    fn from(n: i64) -> Self {
        Discriminant::Int(n)
    }
}

impl From<i32> for Discriminant {
    fn from(n: i32) -> Self {
        Discriminant::Int(n as i64)
    }
}

impl From<&str> for Discriminant {
    fn from(s: &str) -> Self {
        Discriminant::Str(s.to_string())
    }
}

impl From<String> for Discriminant {
    fn from(s: String) -> Self {
        Discriminant::Str(s)
    }
}

type SelectorFn = dyn Fn(&ContextView<'_>) -> Option<Discriminant> + Send + Sync;

/// Pure function evaluated against the branch-visible context.
///
/// Returning `None` means the selector could not produce a value (for example
/// the field it reads is missing); the scheduler treats that like an
/// unmatched discriminant.
#[derive(Clone)]
pub struct Selector {
    label: String,
    func: Arc<SelectorFn>,
}

impl Selector {
    pub fn new<F>(label: impl Into<String>, func: F) -> Self
    where
        F: Fn(&ContextView<'_>) -> Option<Discriminant> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            func: Arc::new(func),
        }
    }

    /// Selector reading a single context field and converting it with
    /// [`Value::discriminant`].
    pub fn field(key: impl Into<String>) -> Self {
        let key = key.into();
        let label = key.clone();
        Self::new(label, move |view| view.get(&key).and_then(Value::discriminant))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn evaluate(&self, view: &ContextView<'_>) -> Option<Discriminant> {
        (self.func)(view)
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector").field("label", &self.label).finish()
    }
}

/// Where a step property gets its value from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InputSource {
    Constant(Value),
    Context(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputBinding {
    pub property: String,
    pub source: InputSource,
}

/// Retry policy for step execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            delay_ms,
            backoff_multiplier: 1.0,
        }
    }

    pub fn with_backoff(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Delay before the given retry (`attempt` starts at 1 for the first retry).
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let factor = self
            .backoff_multiplier
            .max(1.0)
            .powi(attempt.saturating_sub(1) as i32);
        std::time::Duration::from_millis((self.delay_ms as f64 * factor) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

/// One step occurrence in a workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub step_type: String,
    pub name: Option<String>,
    pub inputs: Vec<InputBinding>,
    pub retry_policy: Option<RetryPolicy>,
}

impl StepSpec {
    pub fn new(step_type: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            name: None,
            inputs: Vec::new(),
            retry_policy: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set a step property to a constant value.
    pub fn input(mut self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.push(InputBinding {
            property: property.into(),
            source: InputSource::Constant(value.into()),
        });
        self
    }

    /// Bind a step property to a context field, resolved before each run.
    pub fn bind(mut self, property: impl Into<String>, context_key: impl Into<String>) -> Self {
        self.inputs.push(InputBinding {
            property: property.into(),
            source: InputSource::Context(context_key.into()),
        });
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.step_type)
    }
}

impl From<&str> for StepSpec {
    fn from(step_type: &str) -> Self {
        StepSpec::new(step_type)
    }
}

/// Node of the compiled workflow graph
#[derive(Debug, Clone)]
pub enum GraphNode {
    Step(StepSpec),
    /// Fork point; `join` is the barrier closing this split.
    Split { join: NodeIndex, branches: usize },
    Join { split: NodeIndex, branches: usize },
    Decision { selector: Selector },
}

impl GraphNode {
    pub fn label(&self) -> String {
        match self {
            GraphNode::Step(spec) => spec.display_name().to_string(),
            GraphNode::Split { branches, .. } => format!("parallel[{}]", branches),
            GraphNode::Join { branches, .. } => format!("join[{}]", branches),
            GraphNode::Decision { selector } => format!("decide({})", selector.label()),
        }
    }
}

impl fmt::Display for GraphNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Edge label of the compiled workflow graph
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Next,
    Branch(usize),
    Case(Discriminant),
    Default,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Next => Ok(()),
            Transition::Branch(i) => write!(f, "branch {}", i + 1),
            Transition::Case(d) => write!(f, "{}", d),
            Transition::Default => write!(f, "otherwise"),
        }
    }
}

/// Immutable, validated workflow graph shared by all of its instances
#[derive(Debug)]
pub struct WorkflowDefinition {
    pub(crate) id: String,
    pub(crate) version: u32,
    pub(crate) description: Option<String>,
    pub(crate) graph: DiGraph<GraphNode, Transition>,
    pub(crate) entry: NodeIndex,
}

impl WorkflowDefinition {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn entry(&self) -> NodeIndex {
        self.entry
    }

    pub fn graph(&self) -> &DiGraph<GraphNode, Transition> {
        &self.graph
    }

    pub fn node(&self, idx: NodeIndex) -> Option<&GraphNode> {
        self.graph.node_weight(idx)
    }

    /// Sequential successor of a node, if any.
    pub fn next(&self, idx: NodeIndex) -> Option<NodeIndex> {
        self.graph
            .edges_directed(idx, Direction::Outgoing)
            .find(|e| *e.weight() == Transition::Next)
            .map(|e| e.target())
    }

    /// Branch heads of a split, in declaration order.
    pub fn branch_heads(&self, split: NodeIndex) -> Vec<NodeIndex> {
        let mut heads: Vec<(usize, NodeIndex)> = self
            .graph
            .edges_directed(split, Direction::Outgoing)
            .filter_map(|e| match e.weight() {
                Transition::Branch(i) => Some((*i, e.target())),
                _ => None,
            })
            .collect();
        heads.sort_by_key(|(i, _)| *i);
        heads.into_iter().map(|(_, idx)| idx).collect()
    }

    /// Head of the decision branch registered for `value`, falling back to
    /// the explicit default branch.
    pub fn route(&self, decision: NodeIndex, value: &Discriminant) -> Option<NodeIndex> {
        let mut default = None;
        for edge in self.graph.edges_directed(decision, Direction::Outgoing) {
            match edge.weight() {
                Transition::Case(case) if case == value => return Some(edge.target()),
                Transition::Default => default = Some(edge.target()),
                _ => {}
            }
        }
        default
    }

    /// Head of the explicit default branch, used when the selector yields nothing.
    pub fn default_route(&self, decision: NodeIndex) -> Option<NodeIndex> {
        self.graph
            .edges_directed(decision, Direction::Outgoing)
            .find(|e| *e.weight() == Transition::Default)
            .map(|e| e.target())
    }

    /// All step types referenced by the definition.
    pub fn step_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self
            .graph
            .node_weights()
            .filter_map(|n| match n {
                GraphNode::Step(spec) => Some(spec.step_type.as_str()),
                _ => None,
            })
            .collect();
        types.sort_unstable();
        types.dedup();
        types
    }

    pub fn step_count(&self) -> usize {
        self.graph
            .node_weights()
            .filter(|n| matches!(n, GraphNode::Step(_)))
            .count()
    }

    /// Render the graph in Graphviz DOT format.
    pub fn to_dot(&self) -> String {
        format!(
            "digraph \"{}\" {{\n{}}}\n",
            self.id,
            Dot::with_config(&self.graph, &[Config::GraphContentOnly])
        )
    }
}
