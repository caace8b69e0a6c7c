// This module implements register allocation as a linear scan over the allocation
// order. Intervals are built at instruction granularity from a block-level liveness
// fixpoint: reads occupy even positions, writes odd ones, so a temp starting at the
// read slot conflicts with inputs that die at the instruction, while an output
// starting at the write slot may reuse them. Every variable receives exactly one
// location for its whole lifetime; a spilled variable lives in its stack slot
// everywhere and is bridged through per-bank scratch registers at each access.
// Variables whose interval overlaps a call's marshalling range avoid that call's
// clobber set; a call that destroys all registers therefore forces every crossing
// variable into memory. Infeasible allocation is a fatal error for the unit.

//! Linear-scan register allocation.

use super::{AllocContext, AllocPhase};
use crate::error::{BackendError, CompileResult};
use crate::lir::{
    Inst, Location, Op, Operand, PhysReg, RegClass, Role, Value, VarId,
};
use crate::regalloc::config::{RegMask, RegisterAllocationConfig};
use crate::session::CompilationSession;

pub struct LinearScan;

const NO_POS: u32 = u32::MAX;

#[derive(Debug, Clone)]
struct Interval {
    var: VarId,
    bank: u8,
    class: RegClass,
    start: u32,
    end: u32,
    /// Access positions, sorted; drives the furthest-next-use spill choice.
    uses: Vec<u32>,
    /// Intervals carrying a temp operand must stay in a register.
    must_reg: bool,
}

impl Interval {
    fn next_use(&self, pos: u32) -> u32 {
        match self.uses.binary_search(&pos) {
            Ok(i) => self.uses[i],
            Err(i) => self.uses.get(i).copied().unwrap_or(NO_POS),
        }
    }

    fn overlaps(&self, from: u32, to: u32) -> bool {
        self.start <= to && self.end >= from
    }
}

/// A position range whose clobber set crossing intervals must avoid. Covers
/// foreign calls (from the first marshalling move through the call) and the
/// incoming-argument prologue of the entry block.
struct ClobberRange {
    from: u32,
    to: u32,
    clobbers: RegMask,
}

impl AllocPhase for LinearScan {
    fn name(&self) -> &'static str {
        "linear-scan"
    }

    fn run(&self, ctx: &mut AllocContext, session: &CompilationSession) -> CompileResult<()> {
        let order = ctx.cfg.allocation_order.clone();
        let nvars = ctx.unit.vars.len();

        // Global instruction positions over the allocation order.
        let mut positions: Vec<Vec<u32>> = vec![Vec::new(); ctx.unit.blocks.len()];
        let mut bounds: Vec<(u32, u32)> = vec![(0, 0); ctx.unit.blocks.len()];
        let mut counter = 0u32;
        for &b in &order {
            let first = counter * 2;
            for _ in 0..ctx.unit.blocks[b.index()].len() {
                positions[b.index()].push(counter * 2);
                counter += 1;
            }
            let last = if counter * 2 > first { counter * 2 - 2 } else { first };
            bounds[b.index()] = (first, last);
        }

        let live_out = block_liveness(ctx, &order, nvars);
        let intervals = build_intervals(ctx, &order, &positions, &bounds, &live_out);
        let ranges = clobber_ranges(ctx, &order, &positions);

        let (spilled, saved) = assign_registers(ctx, &intervals, &ranges, session)?;
        assign_slots(ctx, &intervals, &spilled);

        ctx.unit.frame.slot_bytes = ctx.config.slot_bytes;
        ctx.unit.frame.align = ctx.config.frame_align;
        ctx.unit.frame.saved_regs = saved;

        rewrite_spilled(ctx)?;
        Ok(())
    }
}

/// Bit set over variable ids.
#[derive(Clone, PartialEq)]
struct VarSet {
    words: Vec<u64>,
}

impl VarSet {
    fn new(n: usize) -> Self {
        Self {
            words: vec![0; n.div_ceil(64)],
        }
    }

    fn insert(&mut self, v: VarId) {
        self.words[v.0 as usize / 64] |= 1 << (v.0 % 64);
    }

    fn remove(&mut self, v: VarId) {
        self.words[v.0 as usize / 64] &= !(1 << (v.0 % 64));
    }

    fn union_with(&mut self, other: &VarSet) {
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            *a |= b;
        }
    }

    fn iter(&self) -> impl Iterator<Item = VarId> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &w)| {
            let mut bits = w;
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let b = bits.trailing_zeros();
                bits &= bits - 1;
                Some(VarId(wi as u32 * 64 + b))
            })
        })
    }
}

/// Backward dataflow to a fixpoint: live-out per block.
fn block_liveness(ctx: &AllocContext, order: &[crate::lir::BlockId], nvars: usize) -> Vec<VarSet> {
    let nb = ctx.unit.blocks.len();
    let mut live_in = vec![VarSet::new(nvars); nb];
    let mut live_out = vec![VarSet::new(nvars); nb];

    let mut changed = true;
    while changed {
        changed = false;
        for &b in order.iter().rev() {
            let mut out = VarSet::new(nvars);
            for &succ in &ctx.cfg.blocks[b.index()].succs {
                out.union_with(&live_in[succ.index()]);
            }

            let mut live = out.clone();
            for inst in ctx.unit.blocks[b.index()].iter().rev() {
                for op in &inst.operands {
                    if op.role == Role::Def {
                        if let Some(v) = op.as_var() {
                            live.remove(v);
                        }
                    }
                }
                for op in &inst.operands {
                    if matches!(op.role, Role::Use | Role::LiveAcross | Role::Temp) {
                        if let Some(v) = op.as_var() {
                            live.insert(v);
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
    live_out
}

fn build_intervals(
    ctx: &AllocContext,
    order: &[crate::lir::BlockId],
    positions: &[Vec<u32>],
    bounds: &[(u32, u32)],
    live_out: &[VarSet],
) -> Vec<Interval> {
    let mut table: Vec<Option<Interval>> = vec![None; ctx.unit.vars.len()];

    let mut extend = |table: &mut Vec<Option<Interval>>, v: VarId, from: u32, to: u32| {
        let info = &ctx.unit.vars[v.0 as usize];
        let entry = table[v.0 as usize].get_or_insert_with(|| Interval {
            var: v,
            bank: ctx.config.bank_for(info.kind.class),
            class: info.kind.class,
            start: from,
            end: to,
            uses: Vec::new(),
            must_reg: false,
        });
        entry.start = entry.start.min(from);
        entry.end = entry.end.max(to);
    };

    for &b in order {
        let (first, last) = bounds[b.index()];
        for v in live_out[b.index()].iter() {
            extend(&mut table, v, first, last + 1);
        }
        for (i, inst) in ctx.unit.blocks[b.index()].iter().enumerate() {
            let p = positions[b.index()][i];
            for op in &inst.operands {
                let Some(v) = op.as_var() else { continue };
                match op.role {
                    Role::Use => {
                        extend(&mut table, v, p, p);
                        push_use(&mut table, v, p);
                    }
                    Role::LiveAcross => {
                        extend(&mut table, v, p, p + 1);
                        push_use(&mut table, v, p + 1);
                    }
                    Role::Def => {
                        extend(&mut table, v, p + 1, p + 1);
                        push_use(&mut table, v, p + 1);
                    }
                    Role::Temp => {
                        extend(&mut table, v, p, p + 1);
                        push_use(&mut table, v, p);
                        if let Some(entry) = table[v.0 as usize].as_mut() {
                            entry.must_reg = true;
                        }
                    }
                }
            }
        }
    }

    let mut intervals: Vec<Interval> = table.into_iter().flatten().collect();
    for interval in &mut intervals {
        interval.uses.sort_unstable();
    }
    intervals.sort_by_key(|i| (i.start, i.end));
    intervals
}

fn push_use(table: &mut [Option<Interval>], v: VarId, pos: u32) {
    if let Some(entry) = table[v.0 as usize].as_mut() {
        entry.uses.push(pos);
    }
}

fn clobber_ranges(
    ctx: &AllocContext,
    order: &[crate::lir::BlockId],
    positions: &[Vec<u32>],
) -> Vec<ClobberRange> {
    let mut ranges = Vec::new();

    for &b in order {
        let insts = &ctx.unit.blocks[b.index()];
        for (i, inst) in insts.iter().enumerate() {
            let Op::Call { linkage, .. } = &inst.op else { continue };
            // The marshalling run: moves into fixed registers directly
            // preceding the call.
            let mut from = positions[b.index()][i];
            let mut j = i;
            while j > 0 {
                let prev = &insts[j - 1];
                let is_marshal = matches!(prev.op, Op::Move)
                    && matches!(
                        prev.operands.first(),
                        Some(Operand {
                            role: Role::Def,
                            value: Value::Reg(_),
                            ..
                        })
                    );
                if !is_marshal {
                    break;
                }
                j -= 1;
                from = positions[b.index()][j];
            }
            ranges.push(ClobberRange {
                from,
                to: positions[b.index()][i] + 1,
                clobbers: linkage.clobbers,
            });
        }
    }

    // Incoming arguments: parameter registers stay untouchable until the
    // entry prologue has read them all.
    let entry = order[0];
    let mut incoming = RegMask::empty();
    let mut prologue_end = None;
    for (i, inst) in ctx.unit.blocks[entry.index()].iter().enumerate() {
        let param_move = matches!(inst.op, Op::Move)
            && matches!(
                inst.operands.first(),
                Some(Operand {
                    role: Role::Def,
                    value: Value::Var(_),
                    ..
                })
            )
            && matches!(
                inst.operands.get(1),
                Some(Operand {
                    role: Role::Use,
                    value: Value::Reg(_),
                    ..
                })
            );
        if !param_move {
            break;
        }
        if let Some(Operand {
            value: Value::Reg(r),
            ..
        }) = inst.operands.get(1)
        {
            incoming.insert(*r);
        }
        prologue_end = Some(positions[entry.index()][i]);
    }
    if let Some(to) = prologue_end {
        ranges.push(ClobberRange {
            from: 0,
            to,
            clobbers: incoming,
        });
    }

    ranges
}

/// The scan proper. Returns the indices of spilled intervals and the
/// callee-saved registers that were handed out.
fn assign_registers(
    ctx: &mut AllocContext,
    intervals: &[Interval],
    ranges: &[ClobberRange],
    session: &CompilationSession,
) -> CompileResult<(Vec<usize>, Vec<PhysReg>)> {
    let config = ctx.config;
    let mut active: Vec<(usize, PhysReg)> = Vec::new();
    let mut spilled: Vec<usize> = Vec::new();
    let mut saved: Vec<PhysReg> = Vec::new();

    for idx in 0..intervals.len() {
        let interval = &intervals[idx];
        active.retain(|&(ai, _)| intervals[ai].end >= interval.start);

        let mut forbidden = RegMask::empty();
        let mut crosses_call = false;
        for range in ranges {
            if interval.overlaps(range.from, range.to) {
                forbidden = forbidden.union(range.clobbers);
                crosses_call = true;
            }
        }

        let mut occupied = RegMask::empty();
        for &(_, reg) in &active {
            occupied.insert(reg);
        }

        let candidates = config
            .allocatable
            .difference(forbidden)
            .difference(occupied);
        let choice = pick_register(candidates, interval.bank, crosses_call, config);

        if let Some(reg) = choice {
            note_saved(&mut saved, reg, config);
            ctx.unit.vars[interval.var.0 as usize].loc = Location::Reg(reg);
            active.push((idx, reg));
            continue;
        }

        // No free register: steal from the active interval with the
        // furthest next use, or send the current one to memory.
        let my_next = interval.next_use(interval.start);
        let mut victim: Option<(usize, u32)> = None;
        for (apos, &(ai, reg)) in active.iter().enumerate() {
            if reg.bank != interval.bank
                || forbidden.contains(reg)
                || intervals[ai].must_reg
            {
                continue;
            }
            let nu = intervals[ai].next_use(interval.start);
            if victim.map_or(true, |(_, best)| nu > best) {
                victim = Some((apos, nu));
            }
        }

        match victim {
            Some((apos, victim_next)) if victim_next > my_next => {
                let (vi, reg) = active[apos];
                log::debug!(
                    "spilling v{} to steal {} for v{}",
                    intervals[vi].var.0,
                    reg,
                    interval.var.0
                );
                session.record_spill();
                spilled.push(vi);
                ctx.unit.vars[interval.var.0 as usize].loc = Location::Reg(reg);
                note_saved(&mut saved, reg, config);
                active[apos] = (idx, reg);
            }
            _ => {
                if interval.must_reg {
                    return Err(BackendError::AllocationFailed {
                        reason: format!(
                            "no register available for temp v{} in bank {}",
                            interval.var.0, interval.bank
                        ),
                    });
                }
                log::debug!("spilling v{} (no register available)", interval.var.0);
                session.record_spill();
                spilled.push(idx);
            }
        }
    }

    Ok((spilled, saved))
}

fn pick_register(
    candidates: RegMask,
    bank: u8,
    crosses_call: bool,
    config: &RegisterAllocationConfig,
) -> Option<PhysReg> {
    let preferred = if crosses_call {
        // Callee-saved registers survive conforming calls; try them first.
        candidates.intersect(config.callee_saved)
    } else {
        // Stay out of the callee-saved set to keep the prologue short.
        candidates.difference(config.callee_saved)
    };
    preferred
        .first_in_bank(bank)
        .or_else(|| candidates.first_in_bank(bank))
}

fn note_saved(saved: &mut Vec<PhysReg>, reg: PhysReg, config: &RegisterAllocationConfig) {
    if config.callee_saved.contains(reg) && !saved.contains(&reg) {
        saved.push(reg);
    }
}

/// Slot assignment with a free list: disjoint lifetimes share a slot.
fn assign_slots(ctx: &mut AllocContext, intervals: &[Interval], spilled: &[usize]) {
    let mut by_start: Vec<usize> = spilled.to_vec();
    by_start.sort_by_key(|&i| intervals[i].start);

    let mut in_use: Vec<(u32, u32)> = Vec::new();
    let mut next_slot = 0u32;
    for &i in &by_start {
        let interval = &intervals[i];
        let slot = match in_use.iter().position(|&(end, _)| end < interval.start) {
            Some(pos) => in_use.swap_remove(pos).1,
            None => {
                let s = next_slot;
                next_slot += 1;
                s
            }
        };
        in_use.push((interval.end, slot));
        ctx.unit.vars[interval.var.0 as usize].loc = Location::Slot(slot);
    }
    ctx.unit.frame.slots = next_slot;
}

/// Insert the spill/reload traffic for memory-resident variables and fold
/// moves into direct slot addressing where the target can encode them.
fn rewrite_spilled(ctx: &mut AllocContext) -> CompileResult<()> {
    let locs: Vec<Location> = ctx.unit.vars.iter().map(|v| v.loc).collect();
    let kinds: Vec<crate::lir::ValueKind> = ctx.unit.vars.iter().map(|v| v.kind).collect();
    let config = ctx.config;

    for b in 0..ctx.unit.blocks.len() {
        let old = std::mem::take(&mut ctx.unit.blocks[b]);
        let mut new = Vec::with_capacity(old.len());

        for mut inst in old {
            if matches!(inst.op, Op::Move) {
                rewrite_move(&mut new, inst, &locs, config)?;
                continue;
            }

            let mut stores: Vec<Inst> = Vec::new();
            let mut use_ordinal = 0usize;
            for oi in 0..inst.operands.len() {
                let op = inst.operands[oi];
                let this_use_ordinal = match op.role {
                    Role::Use | Role::Temp => {
                        let o = use_ordinal;
                        use_ordinal += 1;
                        Some(o)
                    }
                    _ => None,
                };
                let Some(v) = op.as_var() else { continue };
                let Location::Slot(slot) = locs[v.0 as usize] else {
                    continue;
                };
                let kind = kinds[v.0 as usize];

                match op.role {
                    Role::Use | Role::Temp => {
                        let ordinal = this_use_ordinal.unwrap_or(0);
                        let scratch = scratch_for(config, kind.class, ordinal)?;
                        new.push(Inst::new(
                            Op::Move,
                            vec![
                                Operand::def_of(Value::Reg(scratch), kind),
                                Operand::use_of(Value::Slot(slot), kind),
                            ],
                        ));
                        inst.operands[oi].value = Value::Reg(scratch);
                    }
                    Role::Def => {
                        let scratch = scratch_for(config, kind.class, 0)?;
                        inst.operands[oi].value = Value::Reg(scratch);
                        stores.push(Inst::new(
                            Op::Move,
                            vec![
                                Operand::def_of(Value::Slot(slot), kind),
                                Operand::use_of(Value::Reg(scratch), kind),
                            ],
                        ));
                    }
                    // Already in memory; nothing can destroy it.
                    Role::LiveAcross => {}
                }
            }
            new.push(inst);
            new.extend(stores);
        }
        ctx.unit.blocks[b] = new;
    }
    Ok(())
}

fn rewrite_move(
    out: &mut Vec<Inst>,
    mut inst: Inst,
    locs: &[Location],
    config: &RegisterAllocationConfig,
) -> CompileResult<()> {
    let slot_of = |value: Value| match value {
        Value::Var(v) => match locs[v.0 as usize] {
            Location::Slot(s) => Some(s),
            _ => None,
        },
        _ => None,
    };
    let def_slot = slot_of(inst.operands[0].value);
    let src_slot = slot_of(inst.operands[1].value);
    let src_kind = inst.operands[1].kind;
    let big_imm = matches!(inst.operands[1].value, Value::Imm(i) if i32::try_from(i).is_err());

    match (def_slot, src_slot) {
        (None, None) => out.push(inst),
        (None, Some(s)) => {
            inst.operands[1].value = Value::Slot(s);
            out.push(inst);
        }
        (Some(d), None) if !big_imm => {
            inst.operands[0].value = Value::Slot(d);
            out.push(inst);
        }
        (Some(d), src) => {
            // Memory-to-memory (or oversized immediate): stage through the
            // bank's first scratch register.
            let scratch = scratch_for(config, src_kind.class, 0)?;
            let staged_src = match src {
                Some(s) => Value::Slot(s),
                None => inst.operands[1].value,
            };
            out.push(Inst::new(
                Op::Move,
                vec![
                    Operand::def_of(Value::Reg(scratch), src_kind),
                    Operand::use_of(staged_src, src_kind),
                ],
            ));
            inst.operands[0].value = Value::Slot(d);
            inst.operands[1].value = Value::Reg(scratch);
            out.push(inst);
        }
    }
    Ok(())
}

fn scratch_for(
    config: &RegisterAllocationConfig,
    class: RegClass,
    which: usize,
) -> CompileResult<PhysReg> {
    if which >= 2 {
        return Err(BackendError::AllocationFailed {
            reason: "instruction needs more than two memory operands".into(),
        });
    }
    config
        .scratch_reg(class, which)
        .ok_or_else(|| BackendError::AllocationFailed {
            reason: format!("target provides no scratch register for {class:?}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_next_use_queries() {
        let interval = Interval {
            var: VarId(0),
            bank: 0,
            class: RegClass::Int,
            start: 2,
            end: 20,
            uses: vec![3, 9, 17],
            must_reg: false,
        };
        assert_eq!(interval.next_use(0), 3);
        assert_eq!(interval.next_use(3), 3);
        assert_eq!(interval.next_use(4), 9);
        assert_eq!(interval.next_use(18), NO_POS);
    }

    #[test]
    fn interval_overlap_is_inclusive() {
        let interval = Interval {
            var: VarId(0),
            bank: 0,
            class: RegClass::Int,
            start: 4,
            end: 10,
            uses: vec![],
            must_reg: false,
        };
        assert!(interval.overlaps(10, 12));
        assert!(interval.overlaps(0, 4));
        assert!(!interval.overlaps(11, 15));
        assert!(!interval.overlaps(0, 3));
    }

    #[test]
    fn varset_round_trip() {
        let mut set = VarSet::new(130);
        set.insert(VarId(0));
        set.insert(VarId(77));
        set.insert(VarId(129));
        set.remove(VarId(77));

        let collected: Vec<u32> = set.iter().map(|v| v.0).collect();
        assert_eq!(collected, vec![0, 129]);
    }
}
