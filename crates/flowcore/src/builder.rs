//! Consuming workflow builder.
//!
//! Every call takes the builder by value and returns it, so a half-built
//! definition is never shared. The first malformed call is remembered and
//! reported by [`WorkflowBuilder::build`]; later calls are ignored.
//!
//! ```
//! use flowcore::{Selector, StepSpec, WorkflowBuilder};
//!
//! let definition = WorkflowBuilder::new("parallel-sample", 1)
//!     .start_with("say.hello")
//!     .parallel()
//!     .branch(|b| b.start_with(StepSpec::new("print.message").input("message", "Item 1")))
//!     .branch(|b| b.start_with(StepSpec::new("print.message").input("message", "Item 2")))
//!     .join()
//!     .decide(Selector::field("approved"))
//!     .when(true, |b| b.start_with("send.welcome"))
//!     .when(false, |b| b.start_with("send.rejection"))
//!     .then("say.goodbye")
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(definition.step_count(), 6);
//! ```

use crate::definition::{Discriminant, GraphNode, Selector, StepSpec, Transition, WorkflowDefinition};
use crate::DefinitionError;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

#[derive(Debug)]
enum Item {
    Step(StepSpec),
    Parallel(Vec<Vec<Item>>),
    Decision {
        selector: Selector,
        cases: Vec<(Discriminant, Vec<Item>)>,
        default: Option<Vec<Item>>,
    },
}

#[derive(Debug)]
enum OpenBlock {
    Parallel(Vec<Vec<Item>>),
    Decision {
        selector: Selector,
        cases: Vec<(Discriminant, Vec<Item>)>,
        default: Option<Vec<Item>>,
    },
}

#[derive(Debug)]
pub struct WorkflowBuilder {
    id: String,
    version: u32,
    description: Option<String>,
    items: Vec<Item>,
    open: Option<OpenBlock>,
    error: Option<DefinitionError>,
}

impl WorkflowBuilder {
    pub fn new(id: impl Into<String>, version: u32) -> Self {
        Self {
            id: id.into(),
            version,
            description: None,
            items: Vec::new(),
            open: None,
            error: None,
        }
    }

    fn sequence() -> Self {
        Self::new(String::new(), 0)
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Entry step of this sequence.
    pub fn start_with(mut self, step: impl Into<StepSpec>) -> Self {
        self.close_decision();
        if self.error.is_some() {
            return self;
        }
        if !self.items.is_empty() || self.open.is_some() {
            return self.fail(DefinitionError::DuplicateStart);
        }
        self.items.push(Item::Step(step.into()));
        self
    }

    /// Sequential successor of whatever was added last.
    pub fn then(mut self, step: impl Into<StepSpec>) -> Self {
        self.close_decision();
        if self.error.is_some() {
            return self;
        }
        if matches!(self.open, Some(OpenBlock::Parallel(_))) {
            return self.fail(DefinitionError::UnclosedParallel);
        }
        if self.items.is_empty() {
            return self.fail(DefinitionError::MissingStart);
        }
        self.items.push(Item::Step(step.into()));
        self
    }

    /// Open a parallel block; add branches with [`branch`](Self::branch) and
    /// close it with [`join`](Self::join).
    pub fn parallel(mut self) -> Self {
        self.close_decision();
        if self.error.is_some() {
            return self;
        }
        if self.open.is_some() {
            return self.fail(DefinitionError::OverlappingParallel);
        }
        self.open = Some(OpenBlock::Parallel(Vec::new()));
        self
    }

    /// Add one branch to the open parallel block.
    pub fn branch<F>(mut self, build: F) -> Self
    where
        F: FnOnce(WorkflowBuilder) -> WorkflowBuilder,
    {
        if self.error.is_some() {
            return self;
        }
        let index = match &self.open {
            Some(OpenBlock::Parallel(branches)) => branches.len(),
            _ => return self.fail(DefinitionError::BranchWithoutBlock("branch()")),
        };
        let items = match build(Self::sequence()).finish() {
            Ok(items) if items.is_empty() => {
                return self.fail(DefinitionError::EmptyBranch {
                    context: format!("parallel branch {}", index + 1),
                })
            }
            Ok(items) => items,
            Err(e) => return self.fail(e),
        };
        if let Some(OpenBlock::Parallel(branches)) = &mut self.open {
            branches.push(items);
        }
        self
    }

    /// Close the open parallel block with a barrier.
    pub fn join(mut self) -> Self {
        self.close_decision();
        if self.error.is_some() {
            return self;
        }
        match self.open.take() {
            Some(OpenBlock::Parallel(branches)) if branches.is_empty() => {
                self.fail(DefinitionError::EmptyParallel)
            }
            Some(OpenBlock::Parallel(branches)) => {
                self.items.push(Item::Parallel(branches));
                self
            }
            other => {
                self.open = other;
                self.fail(DefinitionError::JoinWithoutParallel)
            }
        }
    }

    /// Open a decision; add branches with [`when`](Self::when) and
    /// [`otherwise`](Self::otherwise). The decision closes at the next
    /// sequence call (or at build), and its branches continue there.
    pub fn decide(mut self, selector: Selector) -> Self {
        self.close_decision();
        if self.error.is_some() {
            return self;
        }
        if self.open.is_some() {
            return self.fail(DefinitionError::UnclosedParallel);
        }
        self.open = Some(OpenBlock::Decision {
            selector,
            cases: Vec::new(),
            default: None,
        });
        self
    }

    /// Branch taken when the selector yields exactly `value`.
    pub fn when<F>(mut self, value: impl Into<Discriminant>, build: F) -> Self
    where
        F: FnOnce(WorkflowBuilder) -> WorkflowBuilder,
    {
        if self.error.is_some() {
            return self;
        }
        let value = value.into();
        let duplicate = match &self.open {
            Some(OpenBlock::Decision { cases, .. }) => cases.iter().any(|(v, _)| *v == value),
            _ => return self.fail(DefinitionError::BranchWithoutBlock("when()")),
        };
        if duplicate {
            return self.fail(DefinitionError::DuplicateBranch(value));
        }
        let items = match build(Self::sequence()).finish() {
            Ok(items) if items.is_empty() => {
                return self.fail(DefinitionError::EmptyBranch {
                    context: format!("decision branch {}", value),
                })
            }
            Ok(items) => items,
            Err(e) => return self.fail(e),
        };
        if let Some(OpenBlock::Decision { cases, .. }) = &mut self.open {
            cases.push((value, items));
        }
        self
    }

    /// Explicit default branch, taken when no `when` value matches.
    pub fn otherwise<F>(mut self, build: F) -> Self
    where
        F: FnOnce(WorkflowBuilder) -> WorkflowBuilder,
    {
        if self.error.is_some() {
            return self;
        }
        match &self.open {
            Some(OpenBlock::Decision { default: Some(_), .. }) => {
                return self.fail(DefinitionError::DuplicateDefault)
            }
            Some(OpenBlock::Decision { .. }) => {}
            _ => return self.fail(DefinitionError::BranchWithoutBlock("otherwise()")),
        }
        let items = match build(Self::sequence()).finish() {
            Ok(items) if items.is_empty() => {
                return self.fail(DefinitionError::EmptyBranch {
                    context: "default decision branch".to_string(),
                })
            }
            Ok(items) => items,
            Err(e) => return self.fail(e),
        };
        if let Some(OpenBlock::Decision { default, .. }) = &mut self.open {
            *default = Some(items);
        }
        self
    }

    /// Validate and compile into an immutable definition.
    pub fn build(self) -> Result<WorkflowDefinition, DefinitionError> {
        let id = self.id.clone();
        let version = self.version;
        let description = self.description.clone();
        let items = self.finish()?;
        if items.is_empty() {
            return Err(DefinitionError::MissingStart);
        }

        let mut compiler = Compiler {
            graph: DiGraph::new(),
        };
        let fragment = compiler.sequence(items);

        if toposort(&compiler.graph, None).is_err() {
            return Err(DefinitionError::CyclicGraph);
        }

        tracing::debug!(
            workflow = %id,
            version,
            nodes = compiler.graph.node_count(),
            "Compiled workflow definition"
        );

        Ok(WorkflowDefinition {
            id,
            version,
            description,
            graph: compiler.graph,
            entry: fragment.head,
        })
    }

    fn fail(mut self, error: DefinitionError) -> Self {
        if self.error.is_none() {
            self.error = Some(error);
        }
        self
    }

    fn close_decision(&mut self) {
        if !matches!(self.open, Some(OpenBlock::Decision { .. })) {
            return;
        }
        if let Some(OpenBlock::Decision {
            selector,
            cases,
            default,
        }) = self.open.take()
        {
            if cases.is_empty() && default.is_none() {
                if self.error.is_none() {
                    self.error = Some(DefinitionError::EmptyDecision);
                }
                return;
            }
            self.items.push(Item::Decision {
                selector,
                cases,
                default,
            });
        }
    }

    fn finish(mut self) -> Result<Vec<Item>, DefinitionError> {
        self.close_decision();
        if let Some(error) = self.error {
            return Err(error);
        }
        if matches!(self.open, Some(OpenBlock::Parallel(_))) {
            return Err(DefinitionError::UnclosedParallel);
        }
        Ok(self.items)
    }
}

/// Entry node and dangling exits of a compiled sequence
struct Fragment {
    head: NodeIndex,
    tails: Vec<NodeIndex>,
}

struct Compiler {
    graph: DiGraph<GraphNode, Transition>,
}

impl Compiler {
    /// `items` is never empty; the builder rejects empty sequences.
    fn sequence(&mut self, items: Vec<Item>) -> Fragment {
        let mut head = None;
        let mut tails: Vec<NodeIndex> = Vec::new();
        for item in items {
            let fragment = self.item(item);
            for tail in tails.drain(..) {
                self.graph.add_edge(tail, fragment.head, Transition::Next);
            }
            head.get_or_insert(fragment.head);
            tails = fragment.tails;
        }
        Fragment {
            head: head.unwrap_or_else(NodeIndex::end),
            tails,
        }
    }

    fn item(&mut self, item: Item) -> Fragment {
        match item {
            Item::Step(spec) => {
                let node = self.graph.add_node(GraphNode::Step(spec));
                Fragment {
                    head: node,
                    tails: vec![node],
                }
            }
            Item::Parallel(branches) => {
                let count = branches.len();
                let split = self.graph.add_node(GraphNode::Split {
                    join: NodeIndex::end(),
                    branches: count,
                });
                let join = self.graph.add_node(GraphNode::Join {
                    split,
                    branches: count,
                });
                self.graph[split] = GraphNode::Split {
                    join,
                    branches: count,
                };
                for (i, branch) in branches.into_iter().enumerate() {
                    let fragment = self.sequence(branch);
                    self.graph.add_edge(split, fragment.head, Transition::Branch(i));
                    for tail in fragment.tails {
                        self.graph.add_edge(tail, join, Transition::Next);
                    }
                }
                Fragment {
                    head: split,
                    tails: vec![join],
                }
            }
            Item::Decision {
                selector,
                cases,
                default,
            } => {
                let decision = self.graph.add_node(GraphNode::Decision { selector });
                let mut tails = Vec::new();
                for (value, branch) in cases {
                    let fragment = self.sequence(branch);
                    self.graph.add_edge(decision, fragment.head, Transition::Case(value));
                    tails.extend(fragment.tails);
                }
                if let Some(branch) = default {
                    let fragment = self.sequence(branch);
                    self.graph.add_edge(decision, fragment.head, Transition::Default);
                    tails.extend(fragment.tails);
                }
                Fragment {
                    head: decision,
                    tails,
                }
            }
        }
    }
}
