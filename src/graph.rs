// This module defines the program graph the pipeline consumes: operation nodes in a
// closed tagged sum, grouped into graph blocks by the coarse scheduling decision the
// front end already made, with terminators naming successor blocks and optional
// branch-probability hints. The graph is built through a small builder API and then
// frozen; every mutating entry point checks the freeze flag and reports the fatal
// internal error class when violated, because once lowering has begun a mutated graph
// would silently invalidate scheduling decisions.

//! Frozen program graph: nodes, graph blocks, terminators, profile hints.

use crate::error::{BackendError, CompileResult};
use crate::foreign::ForeignCallDescriptor;
use crate::lir::{BinOp, BlockId, Cond};
use std::sync::Arc;

/// Index of a node in [`ProgramGraph::nodes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Closed sum of operation kinds.
///
/// Lowering dispatches with one exhaustive match over this enum, so "all
/// kinds handled or explicit failure" holds by construction instead of by an
/// open-ended chain of kind checks.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Incoming parameter `index`, pinned to the entry block.
    Param(u32),
    /// Integer constant.
    ConstInt { value: i64, bits: u16 },
    /// Constant blob destined for the data section; the node's value is the
    /// blob's address.
    ConstBytes { bytes: Vec<u8>, align: u32 },
    /// Pure binary integer operation; inputs `[lhs, rhs]`.
    Binary { op: BinOp, bits: u16 },
    /// Comparison feeding a branch terminator; inputs `[lhs, rhs]`. Using a
    /// comparison as a plain value is forbidden in a scheduled graph.
    Compare { cond: Cond },
    /// Memory read; inputs `[address]`. Order-dependent.
    Load { bits: u16 },
    /// Memory write; inputs `[address, value]`. Order-dependent.
    Store { bits: u16 },
    /// Call through the foreign-call registry; inputs are the arguments.
    ForeignCall {
        descriptor: Arc<ForeignCallDescriptor>,
    },
    /// Profiling/IDE anchor with no value and no effect; explicitly
    /// ignorable during lowering.
    Hint,
    /// Unconditional terminator; successor 0.
    Jump,
    /// Conditional terminator; input `[compare]`, successors
    /// `[on_true, on_false]`. `probability` is the profile-driven chance of
    /// taking the true edge.
    If { probability: Option<f64> },
    /// Function exit; inputs `[]` or `[value]`.
    Return,
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Param(_) => "param",
            NodeKind::ConstInt { .. } => "const_int",
            NodeKind::ConstBytes { .. } => "const_bytes",
            NodeKind::Binary { .. } => "binary",
            NodeKind::Compare { .. } => "compare",
            NodeKind::Load { .. } => "load",
            NodeKind::Store { .. } => "store",
            NodeKind::ForeignCall { .. } => "foreign_call",
            NodeKind::Hint => "hint",
            NodeKind::Jump => "jump",
            NodeKind::If { .. } => "if",
            NodeKind::Return => "return",
        }
    }

    /// Terminators end a graph block and name its successors.
    pub fn is_terminator(&self) -> bool {
        matches!(self, NodeKind::Jump | NodeKind::If { .. } | NodeKind::Return)
    }

    /// Order-dependent nodes must be lowered exactly where the schedule put
    /// them; everything else is a pure value.
    pub fn is_order_dependent(&self) -> bool {
        matches!(
            self,
            NodeKind::Param(_)
                | NodeKind::Load { .. }
                | NodeKind::Store { .. }
                | NodeKind::ForeignCall { .. }
        )
    }
}

/// One operation node: kind plus data-dependency inputs.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub inputs: Vec<NodeId>,
}

/// A graph block: the front end's coarse node-to-block assignment, in
/// schedule order, ending in a terminator.
#[derive(Debug, Clone, Default)]
pub struct GraphBlock {
    pub nodes: Vec<NodeId>,
    pub succs: Vec<BlockId>,
}

/// Data- and control-dependency graph for one compilation unit.
///
/// Immutable once [`ProgramGraph::freeze`] has run; the pipeline refuses
/// unfrozen graphs and the builder refuses frozen ones.
#[derive(Debug)]
pub struct ProgramGraph {
    name: String,
    nodes: Vec<Node>,
    blocks: Vec<GraphBlock>,
    entry: BlockId,
    frozen: bool,
}

impl ProgramGraph {
    /// Start building a graph for the named compilation unit. The entry
    /// block is created eagerly and always has id 0.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            blocks: vec![GraphBlock::default()],
            entry: BlockId(0),
            frozen: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> BlockId {
        self.entry
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn block(&self, id: BlockId) -> &GraphBlock {
        &self.blocks[id.index()]
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn check_mutable(&self) -> CompileResult<()> {
        if self.frozen {
            Err(BackendError::FrozenGraph)
        } else {
            Ok(())
        }
    }

    /// Create an empty block.
    pub fn add_block(&mut self) -> CompileResult<BlockId> {
        self.check_mutable()?;
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(GraphBlock::default());
        Ok(id)
    }

    /// Append a non-terminator node to a block's schedule.
    pub fn add_node(
        &mut self,
        block: BlockId,
        kind: NodeKind,
        inputs: Vec<NodeId>,
    ) -> CompileResult<NodeId> {
        self.check_mutable()?;
        if kind.is_terminator() {
            return Err(BackendError::internal(
                "graph",
                "terminators must be added with end_block",
            ));
        }
        Ok(self.push_node(block, kind, inputs))
    }

    /// Terminate a block, recording its successors.
    pub fn end_block(
        &mut self,
        block: BlockId,
        kind: NodeKind,
        inputs: Vec<NodeId>,
        succs: Vec<BlockId>,
    ) -> CompileResult<NodeId> {
        self.check_mutable()?;
        if !kind.is_terminator() {
            return Err(BackendError::internal(
                "graph",
                "end_block requires a terminator kind",
            ));
        }
        let id = self.push_node(block, kind, inputs);
        self.blocks[block.index()].succs = succs;
        Ok(id)
    }

    fn push_node(&mut self, block: BlockId, kind: NodeKind, inputs: Vec<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node { kind, inputs });
        self.blocks[block.index()].nodes.push(id);
        id
    }

    /// Make the graph immutable and validate its basic shape: every block
    /// terminated, terminator arity matching successor count, parameters
    /// confined to the entry block.
    pub fn freeze(&mut self) -> CompileResult<()> {
        self.check_mutable()?;
        for (idx, block) in self.blocks.iter().enumerate() {
            let term = block.nodes.last().copied().ok_or_else(|| {
                BackendError::MalformedGraph {
                    reason: format!("block b{idx} is empty"),
                }
            })?;
            let kind = &self.nodes[term.index()].kind;
            let expected_succs = match kind {
                NodeKind::Jump => 1,
                NodeKind::If { .. } => 2,
                NodeKind::Return => 0,
                _ => {
                    return Err(BackendError::MalformedGraph {
                        reason: format!("block b{idx} does not end in a terminator"),
                    })
                }
            };
            if block.succs.len() != expected_succs {
                return Err(BackendError::MalformedGraph {
                    reason: format!(
                        "block b{idx} terminator {} has {} successors, expected {expected_succs}",
                        kind.name(),
                        block.succs.len()
                    ),
                });
            }
            if let Some(bad) = block.succs.iter().find(|s| s.index() >= self.blocks.len()) {
                return Err(BackendError::MalformedGraph {
                    reason: format!("block b{idx} names nonexistent successor b{}", bad.0),
                });
            }
            for (pos, &node) in block.nodes.iter().enumerate() {
                let is_last = pos + 1 == block.nodes.len();
                let node_kind = &self.nodes[node.index()].kind;
                if node_kind.is_terminator() && !is_last {
                    return Err(BackendError::MalformedGraph {
                        reason: format!("block b{idx} has a terminator before its end"),
                    });
                }
                if matches!(node_kind, NodeKind::Param(_)) && idx != self.entry.index() {
                    return Err(BackendError::MalformedGraph {
                        reason: format!("parameter node scheduled outside the entry block (b{idx})"),
                    });
                }
            }
        }
        self.frozen = true;
        Ok(())
    }

    /// Data-dependency use count for every node. Hint inputs do not count.
    pub fn use_counts(&self) -> Vec<u32> {
        let mut counts = vec![0u32; self.nodes.len()];
        for node in &self.nodes {
            if matches!(node.kind, NodeKind::Hint) {
                continue;
            }
            for input in &node.inputs {
                counts[input.index()] += 1;
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::ValueKind;

    fn two_block_graph() -> ProgramGraph {
        let mut graph = ProgramGraph::new("unit");
        let exit = graph.add_block().unwrap();
        let entry = graph.entry();
        let a = graph
            .add_node(entry, NodeKind::ConstInt { value: 1, bits: 64 }, vec![])
            .unwrap();
        graph.end_block(entry, NodeKind::Jump, vec![], vec![exit]).unwrap();
        graph.end_block(exit, NodeKind::Return, vec![a], vec![]).unwrap();
        graph
    }

    #[test]
    fn freeze_blocks_further_mutation() {
        let mut graph = two_block_graph();
        graph.freeze().unwrap();
        assert!(graph.is_frozen());

        assert!(matches!(graph.add_block(), Err(BackendError::FrozenGraph)));
        assert!(matches!(
            graph.add_node(graph.entry(), NodeKind::Hint, vec![]),
            Err(BackendError::FrozenGraph)
        ));
    }

    #[test]
    fn freeze_rejects_unterminated_blocks() {
        let mut graph = ProgramGraph::new("bad");
        graph
            .add_node(graph.entry(), NodeKind::ConstInt { value: 0, bits: 64 }, vec![])
            .unwrap();
        assert!(matches!(
            graph.freeze(),
            Err(BackendError::MalformedGraph { .. })
        ));
    }

    #[test]
    fn freeze_rejects_param_outside_entry() {
        let mut graph = ProgramGraph::new("bad");
        let other = graph.add_block().unwrap();
        graph
            .end_block(graph.entry(), NodeKind::Jump, vec![], vec![other])
            .unwrap();
        graph.add_node(other, NodeKind::Param(0), vec![]).unwrap();
        graph.end_block(other, NodeKind::Return, vec![], vec![]).unwrap();
        assert!(matches!(
            graph.freeze(),
            Err(BackendError::MalformedGraph { .. })
        ));
    }

    #[test]
    fn use_counts_follow_data_edges() {
        let mut graph = ProgramGraph::new("counts");
        let entry = graph.entry();
        let a = graph
            .add_node(entry, NodeKind::ConstInt { value: 2, bits: 64 }, vec![])
            .unwrap();
        let b = graph
            .add_node(
                entry,
                NodeKind::Binary {
                    op: BinOp::Add,
                    bits: 64,
                },
                vec![a, a],
            )
            .unwrap();
        graph.end_block(entry, NodeKind::Return, vec![b], vec![]).unwrap();

        let counts = graph.use_counts();
        assert_eq!(counts[a.index()], 2);
        assert_eq!(counts[b.index()], 1);
    }

    #[test]
    fn descriptor_kinds_are_shared() {
        // ForeignCall nodes hold descriptor handles; make sure the type
        // composes with the node enum as stored.
        let desc = Arc::new(ForeignCallDescriptor {
            name: "noop",
            result: Some(ValueKind::word()),
            args: vec![],
            reexecutable: true,
            can_interrupt: false,
            guaranteed_checkpoint: false,
            killed: crate::foreign::KilledLocations::none(),
        });
        let kind = NodeKind::ForeignCall {
            descriptor: Arc::clone(&desc),
        };
        assert_eq!(kind.name(), "foreign_call");
        assert!(kind.is_order_dependent());
    }
}
