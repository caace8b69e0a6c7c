// This module walks allocated LIR in emission order and produces the compiled
// artifact: a code buffer, a deduplicated data section, and the patch-record table
// the downstream installer resolves. Non-branch instructions are encoded once into
// chunks by the target; branch bytes belong to the emitter, which runs the
// branch-form fixed point over the layout: every branch starts in its optimistic
// short form, each pass promotes branches whose distance exceeds the short range,
// and the loop terminates because promotion only grows instruction sizes, so the
// set of long branches is non-decreasing. The optional proactive policy starts
// from long forms and only shrinks provably reachable branches, changing encoding
// size but never behavior. A defensive iteration cap backs up the monotonicity
// argument.

//! Code emission: layout, branch-form resolution, patch records.

use crate::error::{BackendError, CompileResult};
use crate::lir::{BlockId, CallSiteState, Cond, DataId, LirUnit, Location, Op, VarId};
use crate::schedule::Cfg;
use crate::session::CompilationSession;
use crate::target::{BranchForm, CodeSink, Reference, TargetIsa};
use hashbrown::HashMap;

/// How the emitter picks branch forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BranchPolicy {
    /// Assume short, promote out-of-range branches until the layout is
    /// stable.
    #[default]
    Optimistic,
    /// Start long, downgrade branches that are provably within short range.
    /// Purely a size optimization; never changes behavior.
    ProactiveShorten,
}

/// A patch the installer must resolve before the code can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchRecord {
    pub code_offset: u32,
    pub reference: Reference,
}

/// Deduplicated constant blobs laid out with their alignment.
#[derive(Debug, Default)]
pub struct DataSection {
    pub bytes: Vec<u8>,
    entries: Vec<u32>,
}

impl DataSection {
    pub fn entry_offset(&self, id: DataId) -> Option<u32> {
        self.entries.get(id.0 as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Debug/checkpoint record for one emitted call site.
#[derive(Debug, Clone)]
pub struct CallSiteRecord {
    pub code_offset: u32,
    pub callee: &'static str,
    pub live: Vec<(VarId, Location)>,
}

/// The finished unit: code bytes, data, patches, and emission facts.
#[derive(Debug)]
pub struct CompiledArtifact {
    pub name: String,
    pub code: Vec<u8>,
    pub data: DataSection,
    pub patches: Vec<PatchRecord>,
    /// Final code offset of every block, indexed by block id.
    pub block_offsets: Vec<u32>,
    pub call_sites: Vec<CallSiteRecord>,
    pub short_branches: u32,
    pub long_branches: u32,
}

enum Item {
    Fixed {
        sink: CodeSink,
        call: Option<(&'static str, CallSiteState)>,
    },
    Branch {
        cond: Option<Cond>,
        target: BlockId,
        form: BranchForm,
    },
    /// Start of a block; resolves the block's label.
    Label(BlockId),
}

/// Emit an allocated unit for the given target.
pub fn emit(
    unit: &LirUnit,
    cfg: &Cfg,
    target: &dyn TargetIsa,
    policy: BranchPolicy,
    session: &CompilationSession,
) -> CompileResult<CompiledArtifact> {
    let initial_form = match policy {
        BranchPolicy::Optimistic => BranchForm::Short,
        BranchPolicy::ProactiveShorten => BranchForm::Long,
    };

    // ---- chunk encoding ----
    let mut items: Vec<Item> = Vec::new();
    {
        let mut prologue = CodeSink::new();
        target.encode_prologue(&unit.frame, &mut prologue.bytes)?;
        items.push(Item::Fixed {
            sink: prologue,
            call: None,
        });
    }

    for (pos, &block) in cfg.emission_order.iter().enumerate() {
        let next = cfg.emission_order.get(pos + 1).copied();
        items.push(Item::Label(block));

        for inst in &unit.blocks[block.index()] {
            match &inst.op {
                Op::Jump(t) => {
                    if Some(*t) == next {
                        continue;
                    }
                    items.push(Item::Branch {
                        cond: None,
                        target: *t,
                        form: initial_form,
                    });
                }
                Op::CondBranch {
                    cond,
                    on_true,
                    on_false,
                } => {
                    let mut sink = CodeSink::new();
                    target.encode_inst(inst, unit, &mut sink)?;
                    items.push(Item::Fixed { sink, call: None });

                    if Some(*on_false) == next {
                        items.push(Item::Branch {
                            cond: Some(*cond),
                            target: *on_true,
                            form: initial_form,
                        });
                    } else if Some(*on_true) == next {
                        items.push(Item::Branch {
                            cond: Some(cond.negate()),
                            target: *on_false,
                            form: initial_form,
                        });
                    } else {
                        items.push(Item::Branch {
                            cond: Some(*cond),
                            target: *on_true,
                            form: initial_form,
                        });
                        items.push(Item::Branch {
                            cond: None,
                            target: *on_false,
                            form: initial_form,
                        });
                    }
                }
                op => {
                    let mut sink = CodeSink::new();
                    target.encode_inst(inst, unit, &mut sink)?;
                    let call = match op {
                        Op::Call { linkage, state } => state
                            .as_ref()
                            .map(|s| (linkage.descriptor.name, s.clone())),
                        _ => None,
                    };
                    items.push(Item::Fixed { sink, call });
                }
            }
        }
    }

    // ---- branch-form fixed point ----
    let branch_count = items
        .iter()
        .filter(|i| matches!(i, Item::Branch { .. }))
        .count();
    let mut rewrites = 0u32;
    // Monotone either way; the cap is purely defensive.
    for round in 0..=branch_count {
        let offsets = layout(&items, target);
        let mut changed = false;

        let mut offset = 0u32;
        for item in items.iter_mut() {
            match item {
                Item::Fixed { sink, .. } => offset += sink.bytes.len() as u32,
                Item::Label(_) => {}
                Item::Branch { cond, target: t, form } => {
                    let size = target.branch_size(*cond, *form);
                    let target_off = offsets[&t.index()];
                    let disp = i64::from(target_off) - i64::from(offset + size);
                    let (lo, hi) = target.short_branch_range();
                    match form {
                        BranchForm::Short if disp < lo || disp > hi => {
                            *form = BranchForm::Long;
                            changed = true;
                            rewrites += 1;
                            log::trace!("promoting branch at {offset:#x} to long form");
                        }
                        BranchForm::Long if policy == BranchPolicy::ProactiveShorten => {
                            // Would it reach in short form? Shrinking only
                            // shortens distances, so this is safe to commit.
                            let short_size = target.branch_size(*cond, BranchForm::Short);
                            let short_disp =
                                i64::from(target_off) - i64::from(offset + short_size);
                            if short_disp >= lo && short_disp <= hi {
                                *form = BranchForm::Short;
                                changed = true;
                                rewrites += 1;
                                log::trace!("shortening branch at {offset:#x}");
                            }
                        }
                        _ => {}
                    }
                    offset += target.branch_size(*cond, *form);
                }
            }
        }

        if !changed {
            break;
        }
        if round == branch_count {
            return Err(BackendError::internal(
                "emit",
                "branch-form resolution did not converge",
            ));
        }
    }
    for _ in 0..rewrites {
        session.record_branch_promoted();
    }

    // ---- final assembly ----
    let offsets = layout(&items, target);
    let mut code: Vec<u8> = Vec::new();
    let mut patches: Vec<PatchRecord> = Vec::new();
    let mut call_sites: Vec<CallSiteRecord> = Vec::new();
    let mut short_branches = 0u32;
    let mut long_branches = 0u32;

    for item in &items {
        match item {
            Item::Label(_) => {}
            Item::Fixed { sink, call } => {
                let base = code.len() as u32;
                code.extend_from_slice(&sink.bytes);
                for &(off, reference) in &sink.relocs {
                    patches.push(PatchRecord {
                        code_offset: base + off,
                        reference,
                    });
                }
                if let Some((callee, state)) = call {
                    call_sites.push(CallSiteRecord {
                        code_offset: base,
                        callee: *callee,
                        live: state
                            .live
                            .iter()
                            .map(|&v| (v, unit.var(v).loc))
                            .collect(),
                    });
                }
            }
            Item::Branch { cond, target: t, form } => {
                let size = target.branch_size(*cond, *form);
                let disp = i64::from(offsets[&t.index()]) - (code.len() as i64 + i64::from(size));
                let disp = i32::try_from(disp).map_err(|_| {
                    BackendError::internal("emit", "branch displacement exceeds 32 bits")
                })?;
                if *form == BranchForm::Short {
                    let (lo, hi) = target.short_branch_range();
                    if i64::from(disp) < lo || i64::from(disp) > hi {
                        return Err(BackendError::internal(
                            "emit",
                            "short branch left out of range after resolution",
                        ));
                    }
                }
                target.encode_branch(*cond, *form, disp, &mut code)?;
                match form {
                    BranchForm::Short => short_branches += 1,
                    BranchForm::Long => long_branches += 1,
                }
            }
        }
    }

    let mut block_offsets = vec![0u32; unit.blocks.len()];
    for (block, &off) in &offsets {
        block_offsets[*block] = off;
    }

    let data = build_data_section(unit);
    session.record_unit_emitted(code.len(), data.len());
    log::debug!(
        "emitted '{}': {} code bytes, {} data bytes, {} patches, {}/{} short/long branches",
        unit.name,
        code.len(),
        data.len(),
        patches.len(),
        short_branches,
        long_branches
    );

    Ok(CompiledArtifact {
        name: unit.name.clone(),
        code,
        data,
        patches,
        block_offsets,
        call_sites,
        short_branches,
        long_branches,
    })
}

/// Block label offsets under the current form assignment.
fn layout(items: &[Item], target: &dyn TargetIsa) -> HashMap<usize, u32> {
    let mut offsets = HashMap::new();
    let mut offset = 0u32;
    for item in items {
        match item {
            Item::Label(b) => {
                offsets.insert(b.index(), offset);
            }
            Item::Fixed { sink, .. } => offset += sink.bytes.len() as u32,
            Item::Branch { cond, form, .. } => offset += target.branch_size(*cond, *form),
        }
    }
    offsets
}

fn build_data_section(unit: &LirUnit) -> DataSection {
    let mut data = DataSection::default();
    for blob in &unit.constants {
        let align = blob.align.max(1);
        while data.bytes.len() % align as usize != 0 {
            data.bytes.push(0);
        }
        data.entries.push(data.bytes.len() as u32);
        data.bytes.extend_from_slice(&blob.bytes);
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_section_respects_alignment_and_order() {
        let mut unit = LirUnit::new("data", 1);
        let a = unit.intern_constant(vec![1, 2, 3], 1);
        let b = unit.intern_constant(vec![9, 9, 9, 9, 9, 9, 9, 9], 8);

        let data = build_data_section(&unit);
        assert_eq!(data.entry_offset(a), Some(0));
        assert_eq!(data.entry_offset(b), Some(8));
        assert_eq!(data.len(), 16);
    }
}
