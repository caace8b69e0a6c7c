// This module owns the allocation phase pipeline: an ordered, externally
// configurable list of phases run over the LIR plus the register configuration.
// The three fixed stages are pre-allocation optimization (valid on unassigned
// variables), register allocation itself, and post-allocation optimization
// (requires concrete registers). Any phase may be omitted or replaced per target
// or compile mode; the economy configuration keeps only the allocator for fast,
// less-optimized compiles.

//! Allocation pipeline: ordered, replaceable phases over the LIR.

pub mod config;
mod linear_scan;
mod post;
mod pre;

pub use linear_scan::LinearScan;
pub use post::MoveCleanup;
pub use pre::RedundantValueElim;

use crate::error::CompileResult;
use crate::lir::LirUnit;
use crate::regalloc::config::RegisterAllocationConfig;
use crate::schedule::Cfg;
use crate::session::CompilationSession;

/// Everything a phase may look at or change.
pub struct AllocContext<'a> {
    pub unit: &'a mut LirUnit,
    pub cfg: &'a Cfg,
    pub config: &'a RegisterAllocationConfig,
}

/// One allocation-pipeline phase. `Sync` so a pipeline can be shared
/// read-only across concurrent compilations.
pub trait AllocPhase: Sync {
    fn name(&self) -> &'static str;
    fn run(&self, ctx: &mut AllocContext, session: &CompilationSession) -> CompileResult<()>;
}

/// An ordered list of phases.
pub struct AllocationPipeline {
    phases: Vec<Box<dyn AllocPhase>>,
}

impl AllocationPipeline {
    /// The full pipeline: redundant-value elimination, linear scan,
    /// post-allocation move cleanup.
    pub fn standard() -> Self {
        Self {
            phases: vec![
                Box::new(RedundantValueElim),
                Box::new(LinearScan),
                Box::new(MoveCleanup),
            ],
        }
    }

    /// Reduced configuration for fast compiles: allocation only.
    pub fn economy() -> Self {
        Self {
            phases: vec![Box::new(LinearScan)],
        }
    }

    /// Caller-assembled phase list.
    pub fn custom(phases: Vec<Box<dyn AllocPhase>>) -> Self {
        Self { phases }
    }

    pub fn run(
        &self,
        unit: &mut LirUnit,
        cfg: &Cfg,
        config: &RegisterAllocationConfig,
        session: &CompilationSession,
    ) -> CompileResult<()> {
        let mut ctx = AllocContext { unit, cfg, config };
        for phase in &self.phases {
            log::debug!("allocation phase '{}'", phase.name());
            phase.run(&mut ctx, session)?;
        }
        Ok(())
    }
}
