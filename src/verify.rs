// This module implements the read-only verification passes run after allocation.
// Each pass independently recomputes what it checks instead of trusting allocator
// bookkeeping: definitions must dominate uses, every variable operand must have a
// location, no register operand may exceed the configured maximum vector width,
// simultaneously live variables must occupy disjoint locations, and variables live
// across a foreign call must sit outside the call's clobber set or in memory. A
// violation is an internal-consistency error pinned to a pass name and location,
// distinguishable from ordinary compile failures. Skipping every pass never changes
// emitted code.

//! Read-only invariant checks over allocated LIR.

use crate::error::{BackendError, CompileResult};
use crate::lir::{LirUnit, Location, Op, Role, Value, VarId};
use crate::regalloc::config::RegisterAllocationConfig;
use crate::schedule::Cfg;
use hashbrown::HashMap;

/// One verification pass. Implementations must not mutate anything.
pub trait VerifyPass {
    fn name(&self) -> &'static str;
    fn run(
        &self,
        unit: &LirUnit,
        cfg: &Cfg,
        config: &RegisterAllocationConfig,
    ) -> CompileResult<()>;
}

/// The default pass list.
pub fn standard_passes() -> Vec<Box<dyn VerifyPass>> {
    vec![
        Box::new(DefBeforeUse),
        Box::new(OperandsAssigned),
        Box::new(WidthLimits),
        Box::new(DisjointLocations),
        Box::new(CallClobbers),
    ]
}

/// Run every standard pass in order.
pub fn verify_all(
    unit: &LirUnit,
    cfg: &Cfg,
    config: &RegisterAllocationConfig,
) -> CompileResult<()> {
    for pass in standard_passes() {
        pass.run(unit, cfg, config)?;
        log::trace!("verification pass '{}' clean", pass.name());
    }
    Ok(())
}

fn violation(
    pass: &'static str,
    block: u32,
    inst: usize,
    detail: impl Into<String>,
) -> BackendError {
    BackendError::Verification {
        pass,
        block,
        inst,
        detail: detail.into(),
    }
}

/// Every variable has exactly one definition, and that definition dominates
/// (or textually precedes, within a block) each of its reads.
pub struct DefBeforeUse;

impl VerifyPass for DefBeforeUse {
    fn name(&self) -> &'static str {
        "def-before-use"
    }

    fn run(&self, unit: &LirUnit, cfg: &Cfg, _config: &RegisterAllocationConfig) -> CompileResult<()> {
        let mut defs: HashMap<VarId, (u32, usize)> = HashMap::new();
        for (b, block) in unit.blocks.iter().enumerate() {
            for (i, inst) in block.iter().enumerate() {
                for op in &inst.operands {
                    if op.role == Role::Def {
                        if let Some(v) = op.as_var() {
                            if defs.insert(v, (b as u32, i)).is_some() {
                                return Err(violation(
                                    self.name(),
                                    b as u32,
                                    i,
                                    format!("v{} defined more than once", v.0),
                                ));
                            }
                        }
                    }
                }
            }
        }

        for (b, block) in unit.blocks.iter().enumerate() {
            for (i, inst) in block.iter().enumerate() {
                for op in &inst.operands {
                    // Alive-across markers for memory-resident variables keep
                    // referring to the variable after its definition has been
                    // folded into spill traffic, so only plain reads are
                    // position-checked.
                    if op.role != Role::Use {
                        continue;
                    }
                    let Some(v) = op.as_var() else { continue };
                    let Some(&(db, di)) = defs.get(&v) else {
                        return Err(violation(
                            self.name(),
                            b as u32,
                            i,
                            format!("v{} read but never defined", v.0),
                        ));
                    };
                    let ok = if db as usize == b {
                        di < i
                    } else {
                        cfg.dominates(crate::lir::BlockId(db), crate::lir::BlockId(b as u32))
                    };
                    if !ok {
                        return Err(violation(
                            self.name(),
                            b as u32,
                            i,
                            format!("v{} read before its definition", v.0),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// After allocation, no referenced variable may remain unassigned.
pub struct OperandsAssigned;

impl VerifyPass for OperandsAssigned {
    fn name(&self) -> &'static str {
        "operands-assigned"
    }

    fn run(&self, unit: &LirUnit, _cfg: &Cfg, _config: &RegisterAllocationConfig) -> CompileResult<()> {
        for (b, block) in unit.blocks.iter().enumerate() {
            for (i, inst) in block.iter().enumerate() {
                for op in &inst.operands {
                    if let Some(v) = op.as_var() {
                        if unit.var(v).loc == Location::Unassigned {
                            return Err(violation(
                                self.name(),
                                b as u32,
                                i,
                                format!("v{} has no location", v.0),
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// No register operand wider than the target's configured maximum.
pub struct WidthLimits;

impl VerifyPass for WidthLimits {
    fn name(&self) -> &'static str {
        "width-limits"
    }

    fn run(&self, unit: &LirUnit, _cfg: &Cfg, config: &RegisterAllocationConfig) -> CompileResult<()> {
        for (b, block) in unit.blocks.iter().enumerate() {
            for (i, inst) in block.iter().enumerate() {
                for op in &inst.operands {
                    let in_register = match op.value {
                        Value::Reg(_) => true,
                        Value::Var(v) => matches!(unit.var(v).loc, Location::Reg(_)),
                        _ => false,
                    };
                    if in_register && op.kind.bits > config.max_vector_bits {
                        return Err(violation(
                            self.name(),
                            b as u32,
                            i,
                            format!(
                                "{}-bit register operand exceeds the {}-bit limit",
                                op.kind.bits, config.max_vector_bits
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Live ranges of one variable, in allocation-order position space,
/// recomputed here independently of the allocator.
fn var_ranges(unit: &LirUnit, cfg: &Cfg) -> Vec<Option<(u32, u32)>> {
    let nvars = unit.vars.len();
    let order = &cfg.allocation_order;

    let mut positions: Vec<Vec<u32>> = vec![Vec::new(); unit.blocks.len()];
    let mut bounds: Vec<(u32, u32)> = vec![(0, 0); unit.blocks.len()];
    let mut counter = 0u32;
    for &b in order {
        let first = counter * 2;
        for _ in 0..unit.blocks[b.index()].len() {
            positions[b.index()].push(counter * 2);
            counter += 1;
        }
        let last = if counter * 2 > first { counter * 2 - 2 } else { first };
        bounds[b.index()] = (first, last);
    }

    // Block-level liveness fixpoint.
    let mut live_in: Vec<Vec<bool>> = vec![vec![false; nvars]; unit.blocks.len()];
    let mut live_out: Vec<Vec<bool>> = vec![vec![false; nvars]; unit.blocks.len()];
    let mut changed = true;
    while changed {
        changed = false;
        for &b in order.iter().rev() {
            let mut out = vec![false; nvars];
            for &succ in &cfg.blocks[b.index()].succs {
                for (o, &i) in out.iter_mut().zip(live_in[succ.index()].iter()) {
                    *o |= i;
                }
            }
            let mut live = out.clone();
            for inst in unit.blocks[b.index()].iter().rev() {
                for op in &inst.operands {
                    if op.role == Role::Def {
                        if let Some(v) = op.as_var() {
                            live[v.0 as usize] = false;
                        }
                    }
                }
                for op in &inst.operands {
                    if matches!(op.role, Role::Use | Role::LiveAcross | Role::Temp) {
                        if let Some(v) = op.as_var() {
                            live[v.0 as usize] = true;
                        }
                    }
                }
            }
            if out != live_out[b.index()] {
                live_out[b.index()] = out;
                changed = true;
            }
            if live != live_in[b.index()] {
                live_in[b.index()] = live;
                changed = true;
            }
        }
    }

    let mut ranges: Vec<Option<(u32, u32)>> = vec![None; nvars];
    let mut extend = |ranges: &mut Vec<Option<(u32, u32)>>, v: VarId, from: u32, to: u32| {
        let entry = ranges[v.0 as usize].get_or_insert((from, to));
        entry.0 = entry.0.min(from);
        entry.1 = entry.1.max(to);
    };
    for &b in order {
        let (first, last) = bounds[b.index()];
        for (v, &out) in live_out[b.index()].iter().enumerate() {
            if out {
                extend(&mut ranges, VarId(v as u32), first, last + 1);
            }
        }
        for (i, inst) in unit.blocks[b.index()].iter().enumerate() {
            let p = positions[b.index()][i];
            for op in &inst.operands {
                let Some(v) = op.as_var() else { continue };
                match op.role {
                    Role::Use => extend(&mut ranges, v, p, p),
                    Role::LiveAcross | Role::Temp => extend(&mut ranges, v, p, p + 1),
                    Role::Def => extend(&mut ranges, v, p + 1, p + 1),
                }
            }
        }
    }
    ranges
}

/// Simultaneously live variables occupy disjoint physical locations.
pub struct DisjointLocations;

impl VerifyPass for DisjointLocations {
    fn name(&self) -> &'static str {
        "disjoint-locations"
    }

    fn run(&self, unit: &LirUnit, cfg: &Cfg, _config: &RegisterAllocationConfig) -> CompileResult<()> {
        let ranges = var_ranges(unit, cfg);

        // Group by concrete location, then check for range overlap.
        let mut by_loc: HashMap<Location, Vec<(u32, u32, VarId)>> = HashMap::new();
        for (v, range) in ranges.iter().enumerate() {
            let Some((start, end)) = range else { continue };
            let loc = unit.vars[v].loc;
            if loc == Location::Unassigned {
                continue;
            }
            by_loc
                .entry(loc)
                .or_default()
                .push((*start, *end, VarId(v as u32)));
        }

        for (loc, mut group) in by_loc {
            group.sort();
            for pair in group.windows(2) {
                let (_, end_a, var_a) = pair[0];
                let (start_b, _, var_b) = pair[1];
                if start_b <= end_a {
                    return Err(violation(
                        self.name(),
                        0,
                        0,
                        format!(
                            "v{} and v{} are simultaneously live in {loc:?}",
                            var_a.0, var_b.0
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A variable live across a foreign call must be in memory or outside the
/// call's clobber set.
pub struct CallClobbers;

impl VerifyPass for CallClobbers {
    fn name(&self) -> &'static str {
        "call-clobbers"
    }

    fn run(&self, unit: &LirUnit, cfg: &Cfg, _config: &RegisterAllocationConfig) -> CompileResult<()> {
        let ranges = var_ranges(unit, cfg);

        let mut counter = 0u32;
        for &b in &cfg.allocation_order {
            for (i, inst) in unit.blocks[b.index()].iter().enumerate() {
                let p = counter * 2;
                counter += 1;
                let Op::Call { linkage, .. } = &inst.op else { continue };
                for (v, range) in ranges.iter().enumerate() {
                    let Some((start, end)) = range else { continue };
                    // Live across: defined strictly before, read strictly
                    // after the call.
                    if !(*start < p && *end > p + 1) {
                        continue;
                    }
                    if let Location::Reg(r) = unit.vars[v].loc {
                        if linkage.clobbers.contains(r) {
                            return Err(violation(
                                self.name(),
                                b.0,
                                i,
                                format!(
                                    "v{v} lives in clobbered {r} across call to '{}'",
                                    linkage.descriptor.name
                                ),
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
