// This module provides arena-based compilation session management using the bumpalo
// crate. CompilationSession owns the bump arena that backs transient analysis storage
// (scheduler work lists, liveness scratch) for exactly one compilation unit, together
// with the statistics the pipeline accumulates as it runs: instructions lowered,
// variables created, spill traffic, branch-form decisions, and final code size.
// Sessions are strictly per-unit and never shared between threads; concurrent
// compilations each construct their own session around their own arena.

//! Per-unit compilation session: arena allocation plus statistics.

use bumpalo::Bump;
use std::cell::RefCell;
use std::fmt;

/// Arena-backed state for a single compilation unit.
///
/// The session ties all transient analysis allocations to one lifetime and
/// collects the statistics that the driver reports when a unit finishes.
/// Nothing in here survives the compilation; the [`crate::emit::CompiledArtifact`]
/// is the only output.
pub struct CompilationSession<'arena> {
    arena: &'arena Bump,
    stats: RefCell<SessionStats>,
}

impl<'arena> CompilationSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
        }
    }

    /// The arena backing this unit's transient allocations.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    pub fn record_blocks_scheduled(&self, count: usize) {
        self.stats.borrow_mut().blocks_scheduled += count;
    }

    pub fn record_inst_lowered(&self) {
        self.stats.borrow_mut().insts_lowered += 1;
    }

    pub fn record_variable_created(&self) {
        self.stats.borrow_mut().variables_created += 1;
    }

    pub fn record_spill(&self) {
        self.stats.borrow_mut().spills += 1;
    }

    pub fn record_move_removed(&self) {
        self.stats.borrow_mut().moves_removed += 1;
    }

    pub fn record_branch_promoted(&self) {
        self.stats.borrow_mut().branches_promoted += 1;
    }

    pub fn record_unit_emitted(&self, code_bytes: usize, data_bytes: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.units_emitted += 1;
        stats.code_bytes += code_bytes;
        stats.data_bytes += data_bytes;
    }

    /// Snapshot of the statistics gathered so far.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Counters accumulated over one session.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Units fully emitted.
    pub units_emitted: usize,
    /// Basic blocks produced by the scheduler.
    pub blocks_scheduled: usize,
    /// LIR instructions produced by lowering.
    pub insts_lowered: usize,
    /// Tracked variables created by lowering.
    pub variables_created: usize,
    /// Variables that ended up in stack slots.
    pub spills: usize,
    /// Moves deleted by post-allocation cleanup.
    pub moves_removed: usize,
    /// Branches promoted short-to-long (or shortened, under the proactive policy).
    pub branches_promoted: usize,
    /// Total code bytes emitted.
    pub code_bytes: usize,
    /// Total data-section bytes emitted.
    pub data_bytes: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation session statistics:")?;
        writeln!(f, "  Units emitted: {}", self.units_emitted)?;
        writeln!(f, "  Blocks scheduled: {}", self.blocks_scheduled)?;
        writeln!(f, "  Instructions lowered: {}", self.insts_lowered)?;
        writeln!(f, "  Variables created: {}", self.variables_created)?;
        writeln!(f, "  Spilled variables: {}", self.spills)?;
        writeln!(f, "  Moves removed: {}", self.moves_removed)?;
        writeln!(f, "  Branch-form rewrites: {}", self.branches_promoted)?;
        writeln!(f, "  Code bytes: {}", self.code_bytes)?;
        writeln!(f, "  Data bytes: {}", self.data_bytes)?;
        Ok(())
    }
}
