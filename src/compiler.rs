// This module is the driver that composes the pipeline end to end for one
// compilation unit: schedule the frozen graph, lower it to LIR, run the allocation
// phase pipeline, verify, and emit. The phases run strictly sequentially on the
// calling thread with no suspension points; independent units compile concurrently
// by calling this entry point from separate threads with their own sessions, while
// the target, the registry, and the allocation pipeline are shared read-only.

//! The compile driver.

use crate::emit::{self, BranchPolicy, CompiledArtifact};
use crate::error::CompileResult;
use crate::foreign::ForeignCallRegistry;
use crate::graph::ProgramGraph;
use crate::lower;
use crate::regalloc::AllocationPipeline;
use crate::schedule;
use crate::session::CompilationSession;
use crate::target::TargetIsa;
use crate::verify;

/// Per-compilation knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions {
    pub branch_policy: BranchPolicy,
    /// Verification is read-only and safe to skip for compile speed; the
    /// emitted bytes are identical either way.
    pub skip_verify: bool,
}

/// Compile one unit: schedule, lower, allocate, verify, emit.
pub fn compile(
    graph: &ProgramGraph,
    target: &dyn TargetIsa,
    registry: &ForeignCallRegistry,
    pipeline: &AllocationPipeline,
    options: CompileOptions,
    session: &CompilationSession,
) -> CompileResult<CompiledArtifact> {
    let config = target.reg_config();
    log::debug!("compiling '{}' for {}", graph.name(), target.name());

    let cfg = schedule::schedule(graph, session)?;
    let mut unit = lower::lower(graph, &cfg, config, registry, session)?;
    pipeline.run(&mut unit, &cfg, config, session)?;
    if !options.skip_verify {
        verify::verify_all(&unit, &cfg, config)?;
    }
    emit::emit(&unit, &cfg, target, options.branch_policy, session)
}
