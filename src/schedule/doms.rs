//! Dominator and postdominator computation.
//!
//! Iterative intersection over reverse postorder. Recomputed from scratch
//! for every compilation; upstream hints are never trusted.

use super::Cfg;
use crate::lir::BlockId;

/// Compute immediate dominators and dominator-tree depths.
pub fn compute_dominators(cfg: &mut Cfg) {
    let n = cfg.blocks.len();
    let mut rpo_index = vec![usize::MAX; n];
    for (i, &b) in cfg.rpo.iter().enumerate() {
        rpo_index[b.index()] = i;
    }

    // idom in rpo-index space; entry points at itself.
    let mut idom = vec![usize::MAX; n];
    idom[rpo_index[cfg.entry.index()]] = rpo_index[cfg.entry.index()];

    let mut changed = true;
    while changed {
        changed = false;
        for (i, &block) in cfg.rpo.iter().enumerate() {
            if block == cfg.entry {
                continue;
            }
            let mut new_idom = usize::MAX;
            for &pred in &cfg.blocks[block.index()].preds {
                let p = rpo_index[pred.index()];
                if idom[p] == usize::MAX {
                    continue;
                }
                new_idom = if new_idom == usize::MAX {
                    p
                } else {
                    intersect(&idom, new_idom, p)
                };
            }
            if new_idom != usize::MAX && idom[i] != new_idom {
                idom[i] = new_idom;
                changed = true;
            }
        }
    }

    for (i, &block) in cfg.rpo.iter().enumerate() {
        cfg.blocks[block.index()].idom = if block == cfg.entry {
            None
        } else {
            Some(cfg.rpo[idom[i]])
        };
    }

    // Depths, walking blocks in rpo so parents are done first.
    for &block in &cfg.rpo.clone() {
        let depth = match cfg.blocks[block.index()].idom {
            Some(parent) => cfg.blocks[parent.index()].dom_depth + 1,
            None => 0,
        };
        cfg.blocks[block.index()].dom_depth = depth;
    }
}

/// Compute immediate postdominators against a virtual exit joining all
/// return blocks. Blocks that cannot reach an exit (infinite loops) keep
/// `None`.
pub fn compute_postdominators(cfg: &mut Cfg) {
    let n = cfg.blocks.len();
    let virt = n;

    let exits: Vec<BlockId> = (0..n)
        .map(|i| BlockId(i as u32))
        .filter(|b| cfg.blocks[b.index()].succs.is_empty())
        .collect();
    if exits.is_empty() {
        return;
    }

    // Reverse postorder of the reversed CFG rooted at the virtual exit.
    let mut visited = vec![false; n + 1];
    let mut post: Vec<usize> = Vec::with_capacity(n + 1);
    let mut stack: Vec<(usize, bool)> = vec![(virt, false)];
    while let Some((node, processed)) = stack.pop() {
        if processed {
            post.push(node);
            continue;
        }
        if visited[node] {
            continue;
        }
        visited[node] = true;
        stack.push((node, true));
        let rsuccs: Vec<usize> = if node == virt {
            exits.iter().map(|b| b.index()).collect()
        } else {
            cfg.blocks[node].preds.iter().map(|b| b.index()).collect()
        };
        for next in rsuccs.into_iter().rev() {
            if !visited[next] {
                stack.push((next, false));
            }
        }
    }
    let order: Vec<usize> = post.into_iter().rev().collect();

    let mut order_index = vec![usize::MAX; n + 1];
    for (i, &node) in order.iter().enumerate() {
        order_index[node] = i;
    }

    let mut ipdom = vec![usize::MAX; order.len()];
    ipdom[order_index[virt]] = order_index[virt];

    let mut changed = true;
    while changed {
        changed = false;
        for (i, &node) in order.iter().enumerate() {
            if node == virt {
                continue;
            }
            let mut new_ipdom = usize::MAX;
            // Predecessors in the reversed graph are CFG successors, plus
            // the virtual exit for return blocks.
            let mut rpreds: Vec<usize> = cfg.blocks[node]
                .succs
                .iter()
                .map(|b| b.index())
                .collect();
            if cfg.blocks[node].succs.is_empty() {
                rpreds.push(virt);
            }
            for p in rpreds {
                let pi = order_index[p];
                if pi == usize::MAX || ipdom[pi] == usize::MAX {
                    continue;
                }
                new_ipdom = if new_ipdom == usize::MAX {
                    pi
                } else {
                    intersect(&ipdom, new_ipdom, pi)
                };
            }
            if new_ipdom != usize::MAX && ipdom[i] != new_ipdom {
                ipdom[i] = new_ipdom;
                changed = true;
            }
        }
    }

    for (i, &node) in order.iter().enumerate() {
        if node == virt {
            continue;
        }
        let parent = ipdom[i];
        cfg.blocks[node].ipostdom = if parent == usize::MAX || order[parent] == virt {
            None
        } else {
            Some(BlockId(order[parent] as u32))
        };
    }
}

/// Two-finger intersection in order-index space (smaller index = closer to
/// the root).
fn intersect(idom: &[usize], mut a: usize, mut b: usize) -> usize {
    while a != b {
        while a > b {
            a = idom[a];
        }
        while b > a {
            b = idom[b];
        }
    }
    a
}
