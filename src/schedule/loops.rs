//! Natural-loop detection and the reducibility check.
//!
//! Only properly nested (reducible) loop structure is supported: every
//! retreating edge must target a block that dominates its source. Anything
//! else is a hard failure for the unit, not a degraded mode.

use super::{Cfg, LoopInfo};
use crate::error::{BackendError, CompileResult};
use crate::lir::BlockId;

/// Detect back edges, reject irreducible regions, collect natural loops,
/// and fill per-block loop membership bitsets and depths.
pub fn compute_loops(cfg: &mut Cfg) -> CompileResult<()> {
    let n = cfg.blocks.len();
    let mut rpo_index = vec![0usize; n];
    for (i, &b) in cfg.rpo.iter().enumerate() {
        rpo_index[b.index()] = i;
    }

    // A retreating edge goes against reverse postorder. In a reducible CFG
    // every retreating edge is a back edge: its target dominates its source.
    let mut back_edges: Vec<(BlockId, BlockId)> = Vec::new();
    for &block in &cfg.rpo {
        for &succ in &cfg.blocks[block.index()].succs {
            if rpo_index[succ.index()] <= rpo_index[block.index()] {
                if !cfg.dominates(succ, block) {
                    return Err(BackendError::IrreducibleLoop { block: succ.0 });
                }
                back_edges.push((block, succ));
            }
        }
    }

    // Group back edges by header, headers in RPO so outer loops come first.
    let mut headers: Vec<BlockId> = Vec::new();
    for &(_, header) in &back_edges {
        if !headers.contains(&header) {
            headers.push(header);
        }
    }
    headers.sort_by_key(|h| rpo_index[h.index()]);

    if headers.len() > 64 {
        return Err(BackendError::internal(
            "schedule",
            format!("unit has {} natural loops; at most 64 are supported", headers.len()),
        ));
    }

    let mut loops = Vec::with_capacity(headers.len());
    for (loop_id, &header) in headers.iter().enumerate() {
        let sources: Vec<BlockId> = back_edges
            .iter()
            .filter(|&&(_, h)| h == header)
            .map(|&(src, _)| src)
            .collect();

        // Natural loop body: header plus everything that reaches a back-edge
        // source without passing through the header.
        let mut members = vec![header];
        let mut stack: Vec<BlockId> = Vec::new();
        for &src in &sources {
            if !members.contains(&src) {
                members.push(src);
                stack.push(src);
            }
        }
        while let Some(block) = stack.pop() {
            for &pred in &cfg.blocks[block.index()].preds {
                if !members.contains(&pred) {
                    members.push(pred);
                    stack.push(pred);
                }
            }
        }
        members.sort_by_key(|b| rpo_index[b.index()]);

        for &member in &members {
            cfg.blocks[member.index()].loop_membership |= 1u64 << loop_id;
        }

        loops.push(LoopInfo {
            header,
            back_edges: sources,
            members,
            depth: 0,
        });
    }

    for block in &mut cfg.blocks {
        block.loop_depth = block.loop_membership.count_ones();
    }
    for i in 0..loops.len() {
        let header = loops[i].header;
        loops[i].depth = cfg.blocks[header.index()].loop_depth;
    }

    cfg.loops = loops;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::error::BackendError;
    use crate::graph::{NodeKind, ProgramGraph};
    use crate::lir::{BlockId, Cond};
    use crate::schedule::schedule;
    use crate::session::CompilationSession;
    use bumpalo::Bump;

    fn cond_terminator(
        g: &mut ProgramGraph,
        block: BlockId,
        succs: Vec<BlockId>,
    ) {
        let x = g
            .add_node(block, NodeKind::ConstInt { value: 0, bits: 64 }, vec![])
            .unwrap();
        let cmp = g
            .add_node(block, NodeKind::Compare { cond: Cond::Ne }, vec![x, x])
            .unwrap();
        g.end_block(block, NodeKind::If { probability: None }, vec![cmp], succs)
            .unwrap();
    }

    /// entry -> outer_head -> inner_head -> inner_head (self loop)
    ///          inner_head -> outer_head (outer back edge), -> exit
    #[test]
    fn nested_loops_have_nested_membership() {
        let mut g = ProgramGraph::new("nested");
        let entry = g.entry();
        let outer = g.add_block().unwrap();
        let inner = g.add_block().unwrap();
        let latch = g.add_block().unwrap();
        let back = g.add_block().unwrap();
        let done = g.add_block().unwrap();

        g.end_block(entry, NodeKind::Jump, vec![], vec![outer]).unwrap();
        g.end_block(outer, NodeKind::Jump, vec![], vec![inner]).unwrap();
        // inner branches back to itself or continues to the latch.
        cond_terminator(&mut g, inner, vec![inner, latch]);
        // the latch either takes the outer back edge or leaves the loop.
        cond_terminator(&mut g, latch, vec![back, done]);
        g.end_block(back, NodeKind::Jump, vec![], vec![outer]).unwrap();
        g.end_block(done, NodeKind::Return, vec![], vec![]).unwrap();
        g.freeze().unwrap();

        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let cfg = schedule(&g, &session).unwrap();

        assert_eq!(cfg.loops.len(), 2);
        // Inner-loop header is in both loops, outer header only in one.
        assert_eq!(cfg.blocks[inner.index()].loop_depth, 2);
        assert_eq!(cfg.blocks[outer.index()].loop_depth, 1);
        assert_eq!(cfg.blocks[latch.index()].loop_depth, 1);
        assert_eq!(cfg.blocks[entry.index()].loop_depth, 0);
        assert_eq!(cfg.blocks[done.index()].loop_depth, 0);
    }

    /// Classic irreducible region: two blocks jumping into each other with
    /// separate entries from the start block.
    #[test]
    fn irreducible_region_is_rejected() {
        let mut g = ProgramGraph::new("irreducible");
        let entry = g.entry();
        let a = g.add_block().unwrap();
        let b = g.add_block().unwrap();
        let exit = g.add_block().unwrap();

        cond_terminator(&mut g, entry, vec![a, b]);
        cond_terminator(&mut g, a, vec![b, exit]);
        g.end_block(b, NodeKind::Jump, vec![], vec![a]).unwrap();
        g.end_block(exit, NodeKind::Return, vec![], vec![]).unwrap();
        g.freeze().unwrap();

        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        match schedule(&g, &session) {
            Err(BackendError::IrreducibleLoop { .. }) => {}
            other => panic!("expected irreducible-loop failure, got {other:?}"),
        }
    }
}
