// This module turns a frozen program graph into an ordered control-flow graph with
// dominance, postdominance, loop structure, and execution frequencies, all computed
// from scratch rather than trusted from upstream, because allocation correctness
// depends on them. It also produces the two block permutations the rest of the
// pipeline consumes: the emission order (fallthrough edges kept adjacent) and the
// allocation order (reverse postorder with loop bodies contiguous). Both orders are
// pure functions of the CFG and are recomputed per compilation.

//! Block scheduler: CFG construction, dominance, loops, frequencies, orders.

mod doms;
mod loops;
mod order;

use crate::error::{BackendError, CompileResult};
use crate::graph::{NodeKind, ProgramGraph};
use crate::lir::BlockId;
use crate::session::CompilationSession;
use bumpalo::collections::Vec as BumpVec;

/// Scale applied to block frequency per loop nesting level when no profile
/// says otherwise.
const LOOP_FREQUENCY_SCALE: f64 = 10.0;

/// Per-block scheduling facts.
#[derive(Debug, Clone, Default)]
pub struct BlockNode {
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
    /// Probability of each successor edge, parallel to `succs`.
    pub succ_probs: Vec<f64>,
    pub idom: Option<BlockId>,
    pub ipostdom: Option<BlockId>,
    /// Depth of this block in the dominator tree; entry is 0.
    pub dom_depth: u32,
    /// Bit `i` set when the block belongs to loop `i`.
    pub loop_membership: u64,
    pub loop_depth: u32,
    pub frequency: f64,
}

/// One natural loop.
#[derive(Debug, Clone)]
pub struct LoopInfo {
    pub header: BlockId,
    /// Sources of the back edges into `header`.
    pub back_edges: Vec<BlockId>,
    pub members: Vec<BlockId>,
    pub depth: u32,
}

/// The scheduled control-flow graph.
#[derive(Debug)]
pub struct Cfg {
    pub entry: BlockId,
    pub blocks: Vec<BlockNode>,
    pub loops: Vec<LoopInfo>,
    /// Reverse postorder over forward edges.
    pub rpo: Vec<BlockId>,
    /// Block permutation used by the emitter; fallthrough edges adjacent.
    pub emission_order: Vec<BlockId>,
    /// Block permutation used during allocation; loop bodies contiguous.
    pub allocation_order: Vec<BlockId>,
}

impl Cfg {
    pub fn block(&self, id: BlockId) -> &BlockNode {
        &self.blocks[id.index()]
    }

    /// Whether `a` dominates `b` (reflexively).
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.blocks[cur.index()].idom {
                Some(idom) if idom != cur => cur = idom,
                _ => return false,
            }
        }
    }
}

/// Schedule a frozen graph: build the CFG, compute dominance and loop
/// structure, derive frequencies, and produce both block orders.
pub fn schedule(graph: &ProgramGraph, session: &CompilationSession) -> CompileResult<Cfg> {
    if !graph.is_frozen() {
        return Err(BackendError::MalformedGraph {
            reason: "graph must be frozen before scheduling".into(),
        });
    }

    let n = graph.block_count();
    let mut blocks: Vec<BlockNode> = vec![BlockNode::default(); n];

    for idx in 0..n {
        let block = graph.block(BlockId(idx as u32));
        let term = block
            .nodes
            .last()
            .copied()
            .ok_or_else(|| BackendError::MalformedGraph {
                reason: format!("block b{idx} is empty"),
            })?;
        let probs = match graph.node(term).kind {
            NodeKind::If { probability } => {
                let p = probability.unwrap_or(0.5).clamp(0.0, 1.0);
                vec![p, 1.0 - p]
            }
            _ => vec![1.0; block.succs.len()],
        };
        blocks[idx].succs = block.succs.clone();
        blocks[idx].succ_probs = probs;
    }
    for idx in 0..n {
        for &succ in &blocks[idx].succs.clone() {
            blocks[succ.index()].preds.push(BlockId(idx as u32));
        }
    }

    let entry = graph.entry();
    if !blocks[entry.index()].preds.is_empty() {
        return Err(BackendError::MalformedGraph {
            reason: "entry block has predecessors".into(),
        });
    }

    let rpo = reverse_postorder(&blocks, entry, session)?;

    let mut cfg = Cfg {
        entry,
        blocks,
        loops: Vec::new(),
        rpo,
        emission_order: Vec::new(),
        allocation_order: Vec::new(),
    };

    doms::compute_dominators(&mut cfg);
    doms::compute_postdominators(&mut cfg);
    loops::compute_loops(&mut cfg)?;
    compute_frequencies(&mut cfg);
    cfg.emission_order = order::emission_order(&cfg);
    cfg.allocation_order = order::allocation_order(&cfg);

    session.record_blocks_scheduled(cfg.blocks.len());
    log::debug!(
        "scheduled '{}': {} blocks, {} loops",
        graph.name(),
        cfg.blocks.len(),
        cfg.loops.len()
    );
    Ok(cfg)
}

/// Reverse postorder over the whole CFG. Every block must be reachable from
/// the entry; a disconnected block means the upstream schedule is broken.
fn reverse_postorder(
    blocks: &[BlockNode],
    entry: BlockId,
    session: &CompilationSession,
) -> CompileResult<Vec<BlockId>> {
    let arena = session.arena();
    let mut visited = BumpVec::from_iter_in(std::iter::repeat(false).take(blocks.len()), arena);
    let mut post = BumpVec::with_capacity_in(blocks.len(), arena);
    let mut stack = BumpVec::new_in(arena);

    stack.push((entry, false));
    while let Some((block, processed)) = stack.pop() {
        if processed {
            post.push(block);
            continue;
        }
        if visited[block.index()] {
            continue;
        }
        visited[block.index()] = true;
        stack.push((block, true));
        // Push in reverse so the first successor is visited first.
        for &succ in blocks[block.index()].succs.iter().rev() {
            if !visited[succ.index()] {
                stack.push((succ, false));
            }
        }
    }

    if let Some(unreached) = visited.iter().position(|v| !v) {
        return Err(BackendError::MalformedGraph {
            reason: format!("block b{unreached} is unreachable from the entry"),
        });
    }

    let mut rpo: Vec<BlockId> = post.iter().copied().collect();
    rpo.reverse();
    Ok(rpo)
}

/// Static frequency estimate: propagate edge probabilities acyclically in
/// reverse postorder, then scale by loop depth. Profile hints on branches
/// replace the uniform split.
fn compute_frequencies(cfg: &mut Cfg) {
    let mut rpo_index = vec![0usize; cfg.blocks.len()];
    for (i, &b) in cfg.rpo.iter().enumerate() {
        rpo_index[b.index()] = i;
    }

    for i in 0..cfg.blocks.len() {
        cfg.blocks[i].frequency = 0.0;
    }
    cfg.blocks[cfg.entry.index()].frequency = 1.0;

    for pos in 0..cfg.rpo.len() {
        let block = cfg.rpo[pos];
        let freq = cfg.blocks[block.index()].frequency;
        let succs = cfg.blocks[block.index()].succs.clone();
        let probs = cfg.blocks[block.index()].succ_probs.clone();
        for (&succ, &prob) in succs.iter().zip(probs.iter()) {
            // Back edges carry their weight through the loop-depth scale
            // instead.
            if rpo_index[succ.index()] <= pos {
                continue;
            }
            cfg.blocks[succ.index()].frequency += freq * prob;
        }
    }

    for block in &mut cfg.blocks {
        block.frequency *= LOOP_FREQUENCY_SCALE.powi(block.loop_depth as i32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeKind;
    use bumpalo::Bump;

    /// entry -> {then, els} -> join, plus a self-loop on `then`.
    fn diamond_with_loop() -> ProgramGraph {
        let mut g = ProgramGraph::new("diamond");
        let entry = g.entry();
        let then = g.add_block().unwrap();
        let els = g.add_block().unwrap();
        let join = g.add_block().unwrap();

        let a = g
            .add_node(entry, NodeKind::ConstInt { value: 1, bits: 64 }, vec![])
            .unwrap();
        let b = g
            .add_node(entry, NodeKind::ConstInt { value: 2, bits: 64 }, vec![])
            .unwrap();
        let cmp = g
            .add_node(entry, NodeKind::Compare { cond: crate::lir::Cond::Lt }, vec![a, b])
            .unwrap();
        g.end_block(
            entry,
            NodeKind::If { probability: Some(0.9) },
            vec![cmp],
            vec![then, els],
        )
        .unwrap();

        let c = g
            .add_node(then, NodeKind::ConstInt { value: 3, bits: 64 }, vec![])
            .unwrap();
        let d = g
            .add_node(then, NodeKind::Compare { cond: crate::lir::Cond::Eq }, vec![c, c])
            .unwrap();
        g.end_block(then, NodeKind::If { probability: None }, vec![d], vec![then, join])
            .unwrap();

        g.end_block(els, NodeKind::Jump, vec![], vec![join]).unwrap();
        g.end_block(join, NodeKind::Return, vec![], vec![]).unwrap();
        g.freeze().unwrap();
        g
    }

    #[test]
    fn schedules_diamond_with_loop() {
        let graph = diamond_with_loop();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let cfg = schedule(&graph, &session).unwrap();

        assert_eq!(cfg.blocks.len(), 4);
        assert_eq!(cfg.loops.len(), 1);
        assert_eq!(cfg.loops[0].header, BlockId(1));
        assert!(cfg.blocks[1].loop_depth == 1);
        assert!(cfg.blocks[0].loop_depth == 0);

        // Entry dominates everything; the join is dominated by entry only.
        assert!(cfg.dominates(BlockId(0), BlockId(3)));
        assert_eq!(cfg.blocks[3].idom, Some(BlockId(0)));

        // The loop body runs hotter than the entry.
        assert!(cfg.blocks[1].frequency > cfg.blocks[0].frequency);

        // Both orders are permutations starting at the entry.
        for order in [&cfg.emission_order, &cfg.allocation_order] {
            assert_eq!(order.len(), 4);
            assert_eq!(order[0], BlockId(0));
        }
    }

    #[test]
    fn scheduling_is_idempotent() {
        let graph = diamond_with_loop();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let first = schedule(&graph, &session).unwrap();
        let second = schedule(&graph, &session).unwrap();

        assert_eq!(first.rpo, second.rpo);
        assert_eq!(first.emission_order, second.emission_order);
        assert_eq!(first.allocation_order, second.allocation_order);
        for (a, b) in first.blocks.iter().zip(second.blocks.iter()) {
            assert_eq!(a.idom, b.idom);
            assert_eq!(a.loop_membership, b.loop_membership);
            assert_eq!(a.frequency, b.frequency);
        }
    }

    #[test]
    fn rejects_unfrozen_graph() {
        let mut g = ProgramGraph::new("unfrozen");
        g.end_block(g.entry(), NodeKind::Return, vec![], vec![]).unwrap();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        assert!(schedule(&g, &session).is_err());
    }

    #[test]
    fn rejects_unreachable_block() {
        let mut g = ProgramGraph::new("island");
        let island = g.add_block().unwrap();
        g.end_block(g.entry(), NodeKind::Return, vec![], vec![]).unwrap();
        g.end_block(island, NodeKind::Return, vec![], vec![]).unwrap();
        g.freeze().unwrap();

        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        assert!(matches!(
            schedule(&g, &session),
            Err(BackendError::MalformedGraph { .. })
        ));
    }
}
