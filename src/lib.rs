//! anvil - compiler back-end: program graphs to machine code.
//!
//! The crate takes a validated, already-optimized program graph for one
//! compilation unit and turns it into executable machine code plus a data
//! section and patch records for a downstream installer.
//!
//! # Primary usage
//!
//! ```ignore
//! use anvil::{compile, CompileOptions};
//! use anvil::foreign::ForeignCallRegistry;
//! use anvil::regalloc::AllocationPipeline;
//! use anvil::session::CompilationSession;
//! use anvil::x64::X64Target;
//! use bumpalo::Bump;
//!
//! let target = X64Target::new();
//! let registry = ForeignCallRegistry::new();
//! let pipeline = AllocationPipeline::standard();
//!
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let artifact = compile(&graph, &target, &registry, &pipeline,
//!                        CompileOptions::default(), &session)?;
//! ```
//!
//! # Architecture
//!
//! - [`graph`] - frozen program graph, the upstream interface
//! - [`schedule`] - CFG construction, dominance, loops, block orders
//! - [`lower`] - node dispatch and materialization into LIR
//! - [`regalloc`] - the pre/alloc/post phase pipeline
//! - [`verify`] - read-only invariant passes
//! - [`emit`] - code buffer, data section, patches, branch forms
//! - [`foreign`] - foreign-call descriptors, linkages, registry
//! - [`x64`] - the bundled x86-64 System V reference target

pub mod compiler;
pub mod emit;
pub mod error;
pub mod foreign;
pub mod graph;
pub mod lir;
pub mod lower;
pub mod regalloc;
pub mod schedule;
pub mod session;
pub mod target;
pub mod verify;
pub mod x64;

pub use compiler::{compile, CompileOptions};
pub use emit::{BranchPolicy, CompiledArtifact, PatchRecord};
pub use error::{BackendError, CompileResult};
pub use graph::{NodeId, NodeKind, ProgramGraph};
pub use lir::{BinOp, BlockId, Cond, LirUnit, ValueKind, VarId};
pub use regalloc::config::RegisterAllocationConfig;
pub use session::{CompilationSession, SessionStats};
pub use target::{BranchForm, Reference, TargetIsa};
