// This module converts each scheduled block's node list into LIR instructions. A
// single dispatch function matches exhaustively on the node kind, so every kind is
// either handled, explicitly ignorable (hints), or explicitly forbidden with a
// diagnostic (a comparison consumed as a plain value). Materialization policy: a
// node consumed more than once, or whose evaluation order matters, is lowered
// exactly once at its scheduled position into a tracked variable; single-use pure
// nodes are lowered inline at their use and never allocate a tracked variable.
// Foreign calls resolve their linkage through the registry, marshal arguments into
// the convention's fixed registers, mark the linkage's clobbers as temp operands,
// and attach checkpoint state when the descriptor demands it. Block instruction
// lists are append-only here; nothing is reordered.

//! Lowering: scheduled graph nodes to LIR.

use crate::error::{BackendError, CompileResult};
use crate::foreign::ForeignCallRegistry;
use crate::graph::{NodeId, NodeKind, ProgramGraph};
use crate::lir::{
    BlockId, CallSiteState, Inst, LirUnit, Op, Operand, Value, ValueKind, VarId,
};
use crate::regalloc::config::RegisterAllocationConfig;
use crate::schedule::Cfg;
use crate::session::CompilationSession;
use hashbrown::HashMap;

/// Lower a scheduled unit into LIR.
pub fn lower(
    graph: &ProgramGraph,
    cfg: &Cfg,
    config: &RegisterAllocationConfig,
    registry: &ForeignCallRegistry,
    session: &CompilationSession,
) -> CompileResult<LirUnit> {
    let mut ctx = Lowerer {
        graph,
        config,
        registry,
        unit: LirUnit::new(graph.name(), graph.block_count()),
        remaining: graph.use_counts(),
        values: HashMap::new(),
        load_memo: HashMap::new(),
    };

    // Reverse postorder places every definition before its dominated uses.
    ctx.lower_params(graph.entry())?;
    for &block in &cfg.rpo {
        ctx.load_memo.clear();
        for &node in &graph.block(block).nodes {
            ctx.dispatch(block, node)?;
        }
    }

    for _ in 0..ctx.unit.inst_count() {
        session.record_inst_lowered();
    }
    for _ in 0..ctx.unit.variable_count() {
        session.record_variable_created();
    }
    log::debug!(
        "lowered '{}': {} instructions, {} variables",
        ctx.unit.name,
        ctx.unit.inst_count(),
        ctx.unit.variable_count()
    );
    Ok(ctx.unit)
}

struct Lowerer<'a> {
    graph: &'a ProgramGraph,
    config: &'a RegisterAllocationConfig,
    registry: &'a ForeignCallRegistry,
    unit: LirUnit,
    /// Uses of each node not yet consumed.
    remaining: Vec<u32>,
    /// Materialized node results.
    values: HashMap<NodeId, (Value, ValueKind)>,
    /// Loads available for reuse in the current block, keyed by address
    /// node. Invalidated by stores and by calls that kill memory.
    load_memo: HashMap<NodeId, NodeId>,
}

impl<'a> Lowerer<'a> {
    /// Result kind of a value-producing node.
    fn node_kind_of(&self, node: NodeId) -> ValueKind {
        match &self.graph.node(node).kind {
            NodeKind::ConstInt { bits, .. }
            | NodeKind::Binary { bits, .. }
            | NodeKind::Load { bits } => ValueKind::int(*bits),
            NodeKind::ForeignCall { descriptor } => {
                descriptor.result.unwrap_or(ValueKind::word())
            }
            _ => ValueKind::word(),
        }
    }

    /// Whether a node's result must live in a tracked variable: more than
    /// one use, or an evaluation order that matters.
    fn needs_variable(&self, node: NodeId) -> bool {
        self.graph.node(node).kind.is_order_dependent()
            || self.remaining[node.index()] > 1
    }

    /// Parameters are materialized at the top of the entry block, before
    /// anything can disturb the incoming argument registers.
    fn lower_params(&mut self, entry: BlockId) -> CompileResult<()> {
        for &node in &self.graph.block(entry).nodes {
            let NodeKind::Param(index) = self.graph.node(node).kind else {
                continue;
            };
            if self.remaining[node.index()] == 0 {
                continue;
            }
            let kind = self.node_kind_of(node);
            let reg = self
                .config
                .call_conv
                .arg_reg(kind.class, index as usize)
                .ok_or_else(|| BackendError::UnloweredNode {
                    node: node.0,
                    kind: "param",
                    reason: "parameter index exceeds the register argument capacity",
                })?;
            let var = self.unit.new_variable(kind);
            self.unit.push(
                entry,
                Inst::new(
                    Op::Move,
                    vec![
                        Operand::def_of(Value::Var(var), kind),
                        Operand::use_of(Value::Reg(reg), kind),
                    ],
                ),
            );
            self.values.insert(node, (Value::Var(var), kind));
        }
        Ok(())
    }

    /// The dispatch function: exactly one handler per node kind.
    fn dispatch(&mut self, block: BlockId, node: NodeId) -> CompileResult<()> {
        match &self.graph.node(node).kind {
            // Explicitly ignorable.
            NodeKind::Hint => Ok(()),
            // Handled up front by lower_params.
            NodeKind::Param(_) => Ok(()),
            // Pure values: lowered here only when they need a variable,
            // otherwise left for their single use site.
            NodeKind::ConstInt { .. } | NodeKind::ConstBytes { .. } | NodeKind::Binary { .. } => {
                if self.needs_variable(node) {
                    let (value, kind) = self.lower_pure(block, node, true)?;
                    self.values.insert(node, (value, kind));
                }
                Ok(())
            }
            // Forbidden as a plain value; consumed by `If` directly.
            NodeKind::Compare { .. } => Ok(()),
            NodeKind::Load { .. } => self.lower_load(block, node),
            NodeKind::Store { .. } => self.lower_store(block, node),
            NodeKind::ForeignCall { .. } => self.lower_call(block, node),
            NodeKind::Jump => {
                let target = self.graph.block(block).succs[0];
                self.unit.push(block, Inst::new(Op::Jump(target), vec![]));
                Ok(())
            }
            NodeKind::If { .. } => self.lower_if(block, node),
            NodeKind::Return => self.lower_return(block, node),
        }
    }

    /// Materialize a pure node now. `force_tracked` binds the result to a
    /// tracked variable; otherwise constants stay immediates and compute
    /// results land in untracked temps.
    fn lower_pure(
        &mut self,
        block: BlockId,
        node: NodeId,
        force_tracked: bool,
    ) -> CompileResult<(Value, ValueKind)> {
        let kind = self.node_kind_of(node);
        match &self.graph.node(node).kind {
            NodeKind::ConstInt { value, .. } => {
                if force_tracked {
                    let var = self.unit.new_variable(kind);
                    self.unit.push(
                        block,
                        Inst::new(
                            Op::Move,
                            vec![
                                Operand::def_of(Value::Var(var), kind),
                                Operand::use_of(Value::Imm(*value), kind),
                            ],
                        ),
                    );
                    Ok((Value::Var(var), kind))
                } else {
                    Ok((Value::Imm(*value), kind))
                }
            }
            NodeKind::ConstBytes { bytes, align } => {
                let data = self.unit.intern_constant(bytes.clone(), *align);
                let var = if force_tracked {
                    self.unit.new_variable(kind)
                } else {
                    self.unit.new_temp(kind)
                };
                self.unit.push(
                    block,
                    Inst::new(
                        Op::LoadData(data),
                        vec![Operand::def_of(Value::Var(var), kind)],
                    ),
                );
                Ok((Value::Var(var), kind))
            }
            NodeKind::Binary { op, .. } => {
                let inputs = self.graph.node(node).inputs.clone();
                let lhs = self.operand_value(block, inputs[0])?;
                let rhs = self.operand_value(block, inputs[1])?;
                let rhs = self.limit_imm32(block, rhs);
                let var = if force_tracked {
                    self.unit.new_variable(kind)
                } else {
                    self.unit.new_temp(kind)
                };
                self.unit.push(
                    block,
                    Inst::new(
                        Op::Bin(*op),
                        vec![
                            Operand::def_of(Value::Var(var), kind),
                            Operand::use_of(lhs.0, lhs.1),
                            Operand::use_of(rhs.0, rhs.1),
                        ],
                    ),
                );
                Ok((Value::Var(var), kind))
            }
            other => Err(BackendError::UnloweredNode {
                node: node.0,
                kind: other.name(),
                reason: "not a pure value node",
            }),
        }
    }

    /// Stage an immediate through a temporary when the consumer needs a
    /// register operand.
    fn force_reg(&mut self, block: BlockId, operand: (Value, ValueKind)) -> (Value, ValueKind) {
        let (value, kind) = operand;
        if !matches!(value, Value::Imm(_)) {
            return operand;
        }
        let temp = self.unit.new_temp(kind);
        self.unit.push(
            block,
            Inst::new(
                Op::Move,
                vec![
                    Operand::def_of(Value::Var(temp), kind),
                    Operand::use_of(value, kind),
                ],
            ),
        );
        (Value::Var(temp), kind)
    }

    /// Stage immediates that exceed the 32-bit operand field.
    fn limit_imm32(&mut self, block: BlockId, operand: (Value, ValueKind)) -> (Value, ValueKind) {
        match operand.0 {
            Value::Imm(i) if i32::try_from(i).is_err() => self.force_reg(block, operand),
            _ => operand,
        }
    }

    /// Resolve one data input to an operand value, consuming a use.
    fn operand_value(&mut self, block: BlockId, node: NodeId) -> CompileResult<(Value, ValueKind)> {
        if let Some(&(value, kind)) = self.values.get(&node) {
            self.remaining[node.index()] = self.remaining[node.index()].saturating_sub(1);
            return Ok((value, kind));
        }
        match &self.graph.node(node).kind {
            NodeKind::ConstInt { .. } | NodeKind::ConstBytes { .. } | NodeKind::Binary { .. } => {
                let result = self.lower_pure(block, node, false)?;
                self.remaining[node.index()] = self.remaining[node.index()].saturating_sub(1);
                Ok(result)
            }
            NodeKind::Compare { .. } => Err(BackendError::UnloweredNode {
                node: node.0,
                kind: "compare",
                reason: "comparison used as a plain value",
            }),
            other => Err(BackendError::UnloweredNode {
                node: node.0,
                kind: other.name(),
                reason: "used before its scheduled definition",
            }),
        }
    }

    fn lower_load(&mut self, block: BlockId, node: NodeId) -> CompileResult<()> {
        let kind = self.node_kind_of(node);
        let addr_node = self.graph.node(node).inputs[0];

        // Reuse an identical load materialized earlier in this block if no
        // store or killing call intervened.
        if let Some(&prev) = self.load_memo.get(&addr_node) {
            if let Some(&(value, prev_kind)) = self.values.get(&prev) {
                if prev_kind == kind {
                    self.values.insert(node, (value, kind));
                    return Ok(());
                }
            }
        }

        let addr = self.operand_value(block, addr_node)?;
        let addr = self.force_reg(block, addr);
        let var = self.unit.new_variable(kind);
        self.unit.push(
            block,
            Inst::new(
                Op::Load,
                vec![
                    Operand::def_of(Value::Var(var), kind),
                    Operand::use_of(addr.0, addr.1),
                ],
            ),
        );
        self.values.insert(node, (Value::Var(var), kind));
        self.load_memo.insert(addr_node, node);
        Ok(())
    }

    fn lower_store(&mut self, block: BlockId, node: NodeId) -> CompileResult<()> {
        let inputs = self.graph.node(node).inputs.clone();
        let addr = self.operand_value(block, inputs[0])?;
        let addr = self.force_reg(block, addr);
        let value = self.operand_value(block, inputs[1])?;
        let value = self.limit_imm32(block, value);
        self.unit.push(
            block,
            Inst::new(
                Op::Store,
                vec![
                    Operand::use_of(addr.0, addr.1),
                    Operand::use_of(value.0, value.1),
                ],
            ),
        );
        // A store may alias any previously loaded address.
        self.load_memo.clear();
        Ok(())
    }

    fn lower_call(&mut self, block: BlockId, node: NodeId) -> CompileResult<()> {
        let NodeKind::ForeignCall { descriptor } = &self.graph.node(node).kind else {
            return Err(BackendError::internal("lower", "lower_call on a non-call node"));
        };
        let descriptor = descriptor.clone();
        let linkage = self.registry.resolve(&descriptor, self.config)?;
        let inputs = self.graph.node(node).inputs.clone();
        if inputs.len() != linkage.arg_locs.len() {
            return Err(BackendError::UnloweredNode {
                node: node.0,
                kind: "foreign_call",
                reason: "argument count does not match the descriptor",
            });
        }

        // Materialize every argument before touching the fixed registers.
        let mut args = Vec::with_capacity(inputs.len());
        for &input in &inputs {
            args.push((input, self.operand_value(block, input)?));
        }

        let mut operands = Vec::new();
        for ((input, (value, kind)), arg_loc) in args.iter().zip(linkage.arg_locs.iter()) {
            self.unit.push(
                block,
                Inst::new(
                    Op::Move,
                    vec![
                        Operand::def_of(Value::Reg(arg_loc.reg), arg_loc.kind),
                        Operand::use_of(*value, *kind),
                    ],
                ),
            );
            operands.push(Operand::use_of(Value::Reg(arg_loc.reg), arg_loc.kind));
            // Inputs that stay live past the call must survive its clobbers.
            if self.remaining[input.index()] > 0 {
                if let Value::Var(v) = value {
                    operands.push(Operand::live_across(Value::Var(*v), *kind));
                }
            }
        }
        if let Some(ret) = linkage.ret_loc {
            let kind = descriptor.result.unwrap_or(ValueKind::word());
            operands.push(Operand::def_of(Value::Reg(ret), kind));
        }
        for bank in 0..crate::regalloc::config::MAX_BANKS as u8 {
            let kind = if bank == self.config.bank_for(crate::lir::RegClass::Float) {
                ValueKind::float(64)
            } else {
                ValueKind::word()
            };
            for reg in linkage.clobbers.iter_bank(bank) {
                operands.push(Operand::temp_of(Value::Reg(reg), kind));
            }
        }

        let state = if linkage.needs_state {
            Some(CallSiteState {
                live: self.live_tracked_vars(),
            })
        } else {
            None
        };

        self.unit.push(
            block,
            Inst::new(
                Op::Call {
                    linkage: linkage.clone(),
                    state,
                },
                operands,
            ),
        );

        if let Some(ret) = linkage.ret_loc {
            let kind = descriptor.result.unwrap_or(ValueKind::word());
            let var = self.unit.new_variable(kind);
            self.unit.push(
                block,
                Inst::new(
                    Op::Move,
                    vec![
                        Operand::def_of(Value::Var(var), kind),
                        Operand::use_of(Value::Reg(ret), kind),
                    ],
                ),
            );
            self.values.insert(node, (Value::Var(var), kind));
        }

        if descriptor.killed.invalidates_unknown_loads() {
            self.load_memo.clear();
        }
        Ok(())
    }

    /// Tracked variables with uses still ahead of the current position.
    fn live_tracked_vars(&self) -> Vec<VarId> {
        let mut live: Vec<VarId> = self
            .values
            .iter()
            .filter(|(node, (value, _))| {
                self.remaining[node.index()] > 0
                    && matches!(value, Value::Var(v) if self.unit.var(*v).tracked)
            })
            .filter_map(|(_, (value, _))| match value {
                Value::Var(v) => Some(*v),
                _ => None,
            })
            .collect();
        live.sort();
        live
    }

    fn lower_if(&mut self, block: BlockId, node: NodeId) -> CompileResult<()> {
        let cmp_node = self.graph.node(node).inputs[0];
        let NodeKind::Compare { cond } = self.graph.node(cmp_node).kind else {
            return Err(BackendError::UnloweredNode {
                node: node.0,
                kind: "if",
                reason: "branch condition is not a comparison",
            });
        };
        self.remaining[cmp_node.index()] = self.remaining[cmp_node.index()].saturating_sub(1);

        let inputs = self.graph.node(cmp_node).inputs.clone();
        let lhs = self.operand_value(block, inputs[0])?;
        let lhs = self.force_reg(block, lhs);
        let rhs = self.operand_value(block, inputs[1])?;
        let rhs = self.limit_imm32(block, rhs);
        let succs = self.graph.block(block).succs.clone();
        self.unit.push(
            block,
            Inst::new(
                Op::CondBranch {
                    cond,
                    on_true: succs[0],
                    on_false: succs[1],
                },
                vec![Operand::use_of(lhs.0, lhs.1), Operand::use_of(rhs.0, rhs.1)],
            ),
        );
        Ok(())
    }

    fn lower_return(&mut self, block: BlockId, node: NodeId) -> CompileResult<()> {
        let inputs = self.graph.node(node).inputs.clone();
        let mut operands = Vec::new();
        if let Some(&value_node) = inputs.first() {
            let (value, kind) = self.operand_value(block, value_node)?;
            operands.push(Operand::use_of(value, kind));
        }
        self.unit.push(block, Inst::new(Op::Return, operands));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::Role;
    use crate::foreign::{CallEffect, ForeignCallDescriptor, KilledLocations};
    use crate::schedule::schedule;
    use crate::x64;
    use bumpalo::Bump;
    use std::sync::Arc;

    fn lower_graph(
        graph: &ProgramGraph,
        registry: &ForeignCallRegistry,
    ) -> (LirUnit, Cfg) {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let config = x64::config();
        let cfg = schedule(graph, &session).unwrap();
        let unit = lower(graph, &cfg, &config, registry, &session).unwrap();
        (unit, cfg)
    }

    fn straight_line(double_use: bool) -> ProgramGraph {
        let mut g = ProgramGraph::new("straight");
        let entry = g.entry();
        let p0 = g.add_node(entry, NodeKind::Param(0), vec![]).unwrap();
        let p1 = g.add_node(entry, NodeKind::Param(1), vec![]).unwrap();
        let bin = |op| NodeKind::Binary { op, bits: 64 };
        let a = g.add_node(entry, bin(crate::lir::BinOp::Add), vec![p0, p1]).unwrap();
        let b = g.add_node(entry, bin(crate::lir::BinOp::Sub), vec![a, p1]).unwrap();
        let c = g.add_node(entry, bin(crate::lir::BinOp::Xor), vec![b, p0]).unwrap();
        let ret = if double_use {
            // Consume each arithmetic result a second time.
            let d = g.add_node(entry, bin(crate::lir::BinOp::Add), vec![a, b]).unwrap();
            let e = g.add_node(entry, bin(crate::lir::BinOp::Add), vec![d, c]).unwrap();
            let f = g.add_node(entry, bin(crate::lir::BinOp::Add), vec![e, c]).unwrap();
            f
        } else {
            c
        };
        g.end_block(entry, NodeKind::Return, vec![ret], vec![]).unwrap();
        g.freeze().unwrap();
        g
    }

    #[test]
    fn single_use_chain_lowered_inline_without_variables() {
        let g = straight_line(false);
        let registry = ForeignCallRegistry::new();
        let (unit, _) = lower_graph(&g, &registry);

        // Two parameters are tracked; the three single-use arithmetic nodes
        // are not.
        let arith = unit.blocks[0]
            .iter()
            .filter(|i| matches!(i.op, Op::Bin(_)))
            .count();
        assert_eq!(arith, 3);
        assert_eq!(unit.variable_count(), 2);
    }

    #[test]
    fn multi_use_nodes_get_exactly_one_definition() {
        let g = straight_line(true);
        let registry = ForeignCallRegistry::new();
        let (unit, _) = lower_graph(&g, &registry);

        // a, b, c are now multi-use: three tracked variables on top of the
        // two parameters, each with exactly one defining instruction.
        assert_eq!(unit.variable_count(), 5);
        let arith = unit.blocks[0]
            .iter()
            .filter(|i| matches!(i.op, Op::Bin(_)))
            .count();
        assert_eq!(arith, 6);
    }

    #[test]
    fn comparison_as_value_is_rejected() {
        let mut g = ProgramGraph::new("badcmp");
        let entry = g.entry();
        let x = g
            .add_node(entry, NodeKind::ConstInt { value: 1, bits: 64 }, vec![])
            .unwrap();
        let cmp = g
            .add_node(entry, NodeKind::Compare { cond: crate::lir::Cond::Eq }, vec![x, x])
            .unwrap();
        g.end_block(entry, NodeKind::Return, vec![cmp], vec![]).unwrap();
        g.freeze().unwrap();

        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let config = x64::config();
        let registry = ForeignCallRegistry::new();
        let cfg = schedule(&g, &session).unwrap();
        match lower(&g, &cfg, &config, &registry, &session) {
            Err(BackendError::UnloweredNode { kind: "compare", .. }) => {}
            other => panic!("expected compare diagnostic, got {other:?}"),
        }
    }

    #[test]
    fn foreign_call_marshals_and_clobbers() {
        let registry = ForeignCallRegistry::new();
        let desc = registry
            .register(
                ForeignCallDescriptor {
                    name: "runtime_probe",
                    result: Some(ValueKind::word()),
                    args: vec![ValueKind::word()],
                    reexecutable: false,
                    can_interrupt: false,
                    guaranteed_checkpoint: true,
                    killed: KilledLocations::All,
                },
                CallEffect::Conforming,
            )
            .unwrap();

        let mut g = ProgramGraph::new("call");
        let entry = g.entry();
        let p = g.add_node(entry, NodeKind::Param(0), vec![]).unwrap();
        let call = g
            .add_node(entry, NodeKind::ForeignCall { descriptor: desc }, vec![p])
            .unwrap();
        let sum = g
            .add_node(
                entry,
                NodeKind::Binary { op: crate::lir::BinOp::Add, bits: 64 },
                vec![call, p],
            )
            .unwrap();
        g.end_block(entry, NodeKind::Return, vec![sum], vec![]).unwrap();
        g.freeze().unwrap();

        let (unit, _) = lower_graph(&g, &registry);
        let call_inst = unit.blocks[0]
            .iter()
            .find(|i| matches!(i.op, Op::Call { .. }))
            .expect("call lowered");

        // Argument in a fixed register, clobbers as temps, checkpoint state
        // attached, and the still-live parameter marked alive-across.
        assert!(call_inst
            .operands
            .iter()
            .any(|o| o.role == Role::Use && matches!(o.value, Value::Reg(_))));
        assert!(call_inst
            .operands
            .iter()
            .any(|o| o.role == Role::Temp));
        assert!(call_inst
            .operands
            .iter()
            .any(|o| o.role == Role::LiveAcross));
        match &call_inst.op {
            Op::Call { state, .. } => {
                let state = state.as_ref().expect("checkpoint state");
                assert!(!state.live.is_empty());
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn repeated_loads_reuse_until_killed() {
        let registry = ForeignCallRegistry::new();
        let desc = registry
            .register(
                ForeignCallDescriptor {
                    name: "memory_killer",
                    result: None,
                    args: vec![],
                    reexecutable: true,
                    can_interrupt: false,
                    guaranteed_checkpoint: false,
                    killed: KilledLocations::All,
                },
                CallEffect::Conforming,
            )
            .unwrap();

        let mut g = ProgramGraph::new("loads");
        let entry = g.entry();
        let p = g.add_node(entry, NodeKind::Param(0), vec![]).unwrap();
        let l1 = g.add_node(entry, NodeKind::Load { bits: 64 }, vec![p]).unwrap();
        let l2 = g.add_node(entry, NodeKind::Load { bits: 64 }, vec![p]).unwrap();
        let s1 = g
            .add_node(
                entry,
                NodeKind::Binary { op: crate::lir::BinOp::Add, bits: 64 },
                vec![l1, l2],
            )
            .unwrap();
        g.add_node(entry, NodeKind::ForeignCall { descriptor: desc }, vec![])
            .unwrap();
        let l3 = g.add_node(entry, NodeKind::Load { bits: 64 }, vec![p]).unwrap();
        let s2 = g
            .add_node(
                entry,
                NodeKind::Binary { op: crate::lir::BinOp::Add, bits: 64 },
                vec![s1, l3],
            )
            .unwrap();
        g.end_block(entry, NodeKind::Return, vec![s2], vec![]).unwrap();
        g.freeze().unwrap();

        let (unit, _) = lower_graph(&g, &registry);
        // l2 reuses l1's materialization; l3 must re-load because the call
        // kills memory.
        let loads = unit.blocks[0]
            .iter()
            .filter(|i| matches!(i.op, Op::Load))
            .count();
        assert_eq!(loads, 2);
    }
}
