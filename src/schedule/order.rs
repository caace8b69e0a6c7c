//! The two block permutations derived from the CFG.
//!
//! The emission order chains hot fallthrough edges so the emitter can drop
//! unconditional jumps; the allocation order is a reverse postorder that
//! keeps loop bodies contiguous so live ranges stay short across back
//! edges. They are deliberately kept separate; see DESIGN.md.

use super::Cfg;
use crate::lir::BlockId;
use std::cmp::Ordering;

/// Greedy fallthrough chaining: follow the hottest unvisited successor of
/// the current block; when a chain ends, continue from the hottest
/// unvisited block overall. Ties break toward lower block ids so the order
/// is deterministic.
pub fn emission_order(cfg: &Cfg) -> Vec<BlockId> {
    let n = cfg.blocks.len();
    let mut order = Vec::with_capacity(n);
    let mut placed = vec![false; n];

    let mut by_heat: Vec<BlockId> = (0..n).map(|i| BlockId(i as u32)).collect();
    by_heat.sort_by(|a, b| hotter(cfg, *a, *b));

    let mut chain_head = Some(cfg.entry);
    loop {
        let Some(mut block) = chain_head else { break };
        while !placed[block.index()] {
            placed[block.index()] = true;
            order.push(block);

            let next = cfg.blocks[block.index()]
                .succs
                .iter()
                .copied()
                .filter(|s| !placed[s.index()])
                .min_by(|a, b| hotter(cfg, *a, *b));
            match next {
                Some(succ) => block = succ,
                None => break,
            }
        }
        chain_head = by_heat.iter().copied().find(|b| !placed[b.index()]);
    }
    order
}

/// Reverse postorder with loop bodies contiguous: a block becomes ready
/// once all its forward predecessors are placed; among ready blocks the
/// deepest loop wins, then heat, then block id.
pub fn allocation_order(cfg: &Cfg) -> Vec<BlockId> {
    let n = cfg.blocks.len();
    let mut rpo_index = vec![0usize; n];
    for (i, &b) in cfg.rpo.iter().enumerate() {
        rpo_index[b.index()] = i;
    }

    // Count forward (non-back-edge) predecessors.
    let mut pending = vec![0u32; n];
    for &block in &cfg.rpo {
        for &succ in &cfg.blocks[block.index()].succs {
            if rpo_index[succ.index()] > rpo_index[block.index()] {
                pending[succ.index()] += 1;
            }
        }
    }

    let mut order = Vec::with_capacity(n);
    let mut ready: Vec<BlockId> = vec![cfg.entry];
    let mut placed = vec![false; n];

    while let Some(pos) = pick_ready(cfg, &ready) {
        let block = ready.swap_remove(pos);
        if placed[block.index()] {
            continue;
        }
        placed[block.index()] = true;
        order.push(block);

        for &succ in &cfg.blocks[block.index()].succs {
            if rpo_index[succ.index()] <= rpo_index[block.index()] {
                continue;
            }
            pending[succ.index()] -= 1;
            if pending[succ.index()] == 0 {
                ready.push(succ);
            }
        }
    }
    order
}

fn pick_ready(cfg: &Cfg, ready: &[BlockId]) -> Option<usize> {
    ready
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| deeper_then_hotter(cfg, **a, **b))
        .map(|(i, _)| i)
}

/// Ordering that ranks deeper loops first, then heat, then ids.
fn deeper_then_hotter(cfg: &Cfg, a: BlockId, b: BlockId) -> Ordering {
    cfg.blocks[b.index()]
        .loop_depth
        .cmp(&cfg.blocks[a.index()].loop_depth)
        .then(hotter(cfg, a, b))
}

/// Ordering that ranks hotter blocks first, ids as tiebreak.
fn hotter(cfg: &Cfg, a: BlockId, b: BlockId) -> Ordering {
    cfg.blocks[b.index()]
        .frequency
        .partial_cmp(&cfg.blocks[a.index()].frequency)
        .unwrap_or(Ordering::Equal)
        .then(a.0.cmp(&b.0))
}

#[cfg(test)]
mod tests {
    use crate::graph::{NodeKind, ProgramGraph};
    use crate::lir::{BlockId, Cond};
    use crate::schedule::schedule;
    use crate::session::CompilationSession;
    use bumpalo::Bump;

    /// entry -> {hot, cold} with a 0.95 hint, both -> join.
    #[test]
    fn emission_order_prefers_the_hot_arm() {
        let mut g = ProgramGraph::new("hot-cold");
        let entry = g.entry();
        let hot = g.add_block().unwrap();
        let cold = g.add_block().unwrap();
        let join = g.add_block().unwrap();

        let x = g
            .add_node(entry, NodeKind::ConstInt { value: 0, bits: 64 }, vec![])
            .unwrap();
        let cmp = g
            .add_node(entry, NodeKind::Compare { cond: Cond::Lt }, vec![x, x])
            .unwrap();
        g.end_block(
            entry,
            NodeKind::If { probability: Some(0.95) },
            vec![cmp],
            vec![hot, cold],
        )
        .unwrap();
        g.end_block(hot, NodeKind::Jump, vec![], vec![join]).unwrap();
        g.end_block(cold, NodeKind::Jump, vec![], vec![join]).unwrap();
        g.end_block(join, NodeKind::Return, vec![], vec![]).unwrap();
        g.freeze().unwrap();

        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let cfg = schedule(&g, &session).unwrap();

        // The hot arm follows the entry directly.
        assert_eq!(cfg.emission_order[0], entry);
        assert_eq!(cfg.emission_order[1], hot);
        assert!(cfg.emission_order.contains(&cold));
        assert_eq!(cfg.emission_order.len(), 4);
    }

    /// entry -> pre -> head -> body -> head, head -> after; the loop body
    /// must sit between head and after in the allocation order.
    #[test]
    fn allocation_order_keeps_loop_contiguous() {
        let mut g = ProgramGraph::new("loop");
        let entry = g.entry();
        let head = g.add_block().unwrap();
        let body = g.add_block().unwrap();
        let after = g.add_block().unwrap();

        g.end_block(entry, NodeKind::Jump, vec![], vec![head]).unwrap();
        let x = g
            .add_node(head, NodeKind::ConstInt { value: 0, bits: 64 }, vec![])
            .unwrap();
        let cmp = g
            .add_node(head, NodeKind::Compare { cond: Cond::Ne }, vec![x, x])
            .unwrap();
        g.end_block(
            head,
            NodeKind::If { probability: None },
            vec![cmp],
            vec![body, after],
        )
        .unwrap();
        g.end_block(body, NodeKind::Jump, vec![], vec![head]).unwrap();
        g.end_block(after, NodeKind::Return, vec![], vec![]).unwrap();
        g.freeze().unwrap();

        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let cfg = schedule(&g, &session).unwrap();

        let pos = |b: BlockId| {
            cfg.allocation_order
                .iter()
                .position(|&x| x == b)
                .unwrap()
        };
        assert_eq!(pos(entry), 0);
        assert_eq!(pos(body), pos(head) + 1);
        assert_eq!(pos(after), pos(body) + 1);
    }
}
