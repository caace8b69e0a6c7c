//! Post-allocation optimization: move cleanup.
//!
//! Runs with concrete registers in hand. Deletes moves whose source and
//! destination resolve to the same location, moves that merely undo the
//! immediately preceding move, and unconditional jumps to the block that
//! follows anyway in emission order. Branch-form selection itself lives in
//! the emitter, where final distances are known.

use super::{AllocContext, AllocPhase};
use crate::error::CompileResult;
use crate::lir::{Location, Op, Value};
use crate::session::CompilationSession;

pub struct MoveCleanup;

impl AllocPhase for MoveCleanup {
    fn name(&self) -> &'static str {
        "move-cleanup"
    }

    fn run(&self, ctx: &mut AllocContext, session: &CompilationSession) -> CompileResult<()> {
        let locs: Vec<Location> = ctx.unit.vars.iter().map(|v| v.loc).collect();
        let resolve = |value: Value| -> Value {
            match value {
                Value::Var(v) => match locs[v.0 as usize] {
                    Location::Reg(r) => Value::Reg(r),
                    Location::Slot(s) => Value::Slot(s),
                    Location::Unassigned => value,
                },
                other => other,
            }
        };

        let mut removed = 0usize;
        for block in &mut ctx.unit.blocks {
            let old = std::mem::take(block);
            for inst in old {
                if let (Op::Move, [def, src]) = (&inst.op, inst.operands.as_slice()) {
                    // A move defining a variable is that variable's only
                    // definition; those stay (the encoder drops resolved
                    // self-moves for free). Only physical destinations are
                    // deletable here.
                    if def.as_var().is_none() {
                        let (d, s) = (resolve(def.value), resolve(src.value));
                        if d == s && def.kind.bits == src.kind.bits {
                            removed += 1;
                            continue;
                        }
                        // `mov a, b` directly followed by `mov b, a`.
                        if let Some(prev) = block.last() {
                            if let (Op::Move, [pd, ps]) = (&prev.op, prev.operands.as_slice()) {
                                if resolve(pd.value) == s
                                    && resolve(ps.value) == d
                                    && pd.kind.bits == src.kind.bits
                                {
                                    removed += 1;
                                    continue;
                                }
                            }
                        }
                    }
                }
                block.push(inst);
            }
        }

        // Jumps to the block that comes next anyway.
        for window in ctx.cfg.emission_order.windows(2) {
            let (block, next) = (window[0], window[1]);
            let insts = &mut ctx.unit.blocks[block.index()];
            if let Some(Op::Jump(target)) = insts.last().map(|i| &i.op) {
                if *target == next {
                    insts.pop();
                    removed += 1;
                }
            }
        }

        for _ in 0..removed {
            session.record_move_removed();
        }
        if removed > 0 {
            log::debug!("move-cleanup removed {removed} instructions");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{BlockId, Inst, LirUnit, Operand, PhysReg, ValueKind};
    use bumpalo::Bump;

    fn mov(unit: &mut LirUnit, dst: Value, src: Value) {
        let kind = ValueKind::word();
        unit.push(
            BlockId(0),
            Inst::new(
                Op::Move,
                vec![Operand::def_of(dst, kind), Operand::use_of(src, kind)],
            ),
        );
    }

    #[test]
    fn self_and_reverse_moves_are_deleted() {
        let mut unit = LirUnit::new("moves", 1);
        let r0 = Value::Reg(PhysReg::new(0, 0));
        let r1 = Value::Reg(PhysReg::new(0, 1));
        mov(&mut unit, r0, r0);
        mov(&mut unit, r0, r1);
        mov(&mut unit, r1, r0);
        mov(&mut unit, r1, Value::Imm(7));

        let mut graph = crate::graph::ProgramGraph::new("moves");
        graph
            .end_block(graph.entry(), crate::graph::NodeKind::Return, vec![], vec![])
            .unwrap();
        graph.freeze().unwrap();
        let arena = Bump::new();
        let session = crate::session::CompilationSession::new(&arena);
        let cfg = crate::schedule::schedule(&graph, &session).unwrap();
        let config = crate::x64::config();

        let mut ctx = AllocContext {
            unit: &mut unit,
            cfg: &cfg,
            config: &config,
        };
        MoveCleanup.run(&mut ctx, &session).unwrap();

        // mov r0,r0 and the reversing mov r1,r0 disappear.
        assert_eq!(unit.blocks[0].len(), 2);
        assert_eq!(session.stats().moves_removed, 2);
    }
}
