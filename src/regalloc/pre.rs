//! Pre-allocation optimization: local redundant-value elimination.
//!
//! Runs before any register is committed, so it only reasons about
//! unassigned variables. Within a block, a pure instruction computing the
//! same value as an earlier one is deleted and its variable folded into the
//! earlier result. Physical-register operands never participate: their
//! contents change behind the value table's back.

use super::{AllocContext, AllocPhase};
use crate::error::CompileResult;
use crate::lir::{BinOp, Op, Value, VarId};
use crate::session::CompilationSession;
use hashbrown::HashMap;

pub struct RedundantValueElim;

#[derive(PartialEq, Eq, Hash)]
enum ValueNumber {
    Bin(BinOp, Value, Value),
    Const(i64),
}

impl AllocPhase for RedundantValueElim {
    fn name(&self) -> &'static str {
        "redundant-value-elim"
    }

    fn run(&self, ctx: &mut AllocContext, _session: &CompilationSession) -> CompileResult<()> {
        let mut replace: HashMap<VarId, VarId> = HashMap::new();

        for block in &mut ctx.unit.blocks {
            let mut table: HashMap<ValueNumber, VarId> = HashMap::new();
            block.retain(|inst| {
                let keyed = match (&inst.op, inst.operands.as_slice()) {
                    (Op::Bin(op), [def, lhs, rhs]) => {
                        if matches!(lhs.value, Value::Reg(_)) || matches!(rhs.value, Value::Reg(_)) {
                            return true;
                        }
                        let canon = |v: Value| match v {
                            Value::Var(var) => Value::Var(*replace.get(&var).unwrap_or(&var)),
                            other => other,
                        };
                        def.as_var()
                            .map(|d| (ValueNumber::Bin(*op, canon(lhs.value), canon(rhs.value)), d))
                    }
                    (Op::Move, [def, src]) => match (def.as_var(), src.value) {
                        (Some(d), Value::Imm(imm)) => Some((ValueNumber::Const(imm), d)),
                        _ => None,
                    },
                    _ => None,
                };
                let Some((key, def)) = keyed else { return true };

                match table.get(&key) {
                    Some(&existing) => {
                        replace.insert(def, existing);
                        false
                    }
                    None => {
                        table.insert(key, def);
                        true
                    }
                }
            });
        }

        if replace.is_empty() {
            return Ok(());
        }
        log::debug!("redundant-value-elim folded {} values", replace.len());

        for block in &mut ctx.unit.blocks {
            for inst in block {
                // Checkpoint records name live variables by id; folded
                // variables must follow their replacement there too.
                if let Op::Call {
                    state: Some(state), ..
                } = &mut inst.op
                {
                    for v in &mut state.live {
                        if let Some(&target) = replace.get(v) {
                            *v = target;
                        }
                    }
                    state.live.sort();
                    state.live.dedup();
                }
                for operand in &mut inst.operands {
                    if let Value::Var(v) = operand.value {
                        if let Some(&target) = replace.get(&v) {
                            operand.value = Value::Var(target);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{Inst, LirUnit, Operand, ValueKind};
    use bumpalo::Bump;

    fn add(unit: &mut LirUnit, def: VarId, lhs: Value, rhs: Value) {
        let kind = ValueKind::word();
        unit.push(
            crate::lir::BlockId(0),
            Inst::new(
                Op::Bin(BinOp::Add),
                vec![
                    Operand::def_of(Value::Var(def), kind),
                    Operand::use_of(lhs, kind),
                    Operand::use_of(rhs, kind),
                ],
            ),
        );
    }

    #[test]
    fn duplicate_computation_is_folded() {
        let mut unit = LirUnit::new("lvn", 1);
        let a = unit.new_variable(ValueKind::word());
        let b = unit.new_variable(ValueKind::word());
        let c = unit.new_variable(ValueKind::word());
        let d = unit.new_variable(ValueKind::word());

        add(&mut unit, c, Value::Var(a), Value::Var(b));
        add(&mut unit, d, Value::Var(a), Value::Var(b));
        // A consumer of the duplicate.
        add(&mut unit, a, Value::Var(d), Value::Imm(1));

        // Borrow dance: the phase needs a CFG, but this block-local pass
        // never reads it, so a trivial one-block CFG suffices.
        let mut graph = crate::graph::ProgramGraph::new("lvn");
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
        RedundantValueElim.run(&mut ctx, &session).unwrap();

        assert_eq!(unit.blocks[0].len(), 2);
        // The consumer now reads the surviving variable.
        let last = unit.blocks[0].last().unwrap();
        assert_eq!(last.operands[1].value, Value::Var(c));
    }
}
