// This module defines error types for the anvil back-end using the thiserror crate
// for idiomatic Rust error handling. BackendError is the main error enum covering the
// failure families of the pipeline: frozen-graph mutation, malformed or irreducible
// control flow, lowering dispatch failures, infeasible register allocation, verifier
// violations, and encoding problems in the target plug-in. Each variant carries the
// phase and location context needed to pin a bug to a phase. The module also provides
// CompileResult<T> as a convenience alias. None of these errors is a normal outcome of
// compiling a valid unit: every variant signals either a bug in an earlier phase or an
// input that violates the documented pipeline contract.

//! Error types for the back-end pipeline.

use thiserror::Error;

/// Main error type for back-end compilation.
///
/// All variants are bug signals, not user-facing diagnostics. The
/// [`BackendError::Verification`] variant is kept separate so callers can
/// distinguish "an earlier phase produced inconsistent state" from the other
/// fatal conditions.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("attempted to mutate a frozen program graph")]
    FrozenGraph,

    #[error("malformed program graph: {reason}")]
    MalformedGraph { reason: String },

    #[error("irreducible control flow: block b{block} is entered around its loop header")]
    IrreducibleLoop { block: u32 },

    #[error("node n{node} of kind {kind} cannot be lowered: {reason}")]
    UnloweredNode {
        node: u32,
        kind: &'static str,
        reason: &'static str,
    },

    #[error("register allocation failed: {reason}")]
    AllocationFailed { reason: String },

    #[error("verification pass '{pass}' failed at block b{block}, instruction {inst}: {detail}")]
    Verification {
        pass: &'static str,
        block: u32,
        inst: usize,
        detail: String,
    },

    #[error("internal error in {phase}: {reason}")]
    Internal {
        phase: &'static str,
        reason: String,
    },
}

impl BackendError {
    /// Shorthand for the catch-all internal variant.
    pub fn internal(phase: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Internal {
            phase,
            reason: reason.into(),
        }
    }

    /// True for violations reported by a read-only verification pass.
    ///
    /// These always indicate a bug in an earlier phase, never a property of
    /// the input program.
    pub fn is_verification(&self) -> bool {
        matches!(self, BackendError::Verification { .. })
    }
}

/// Result type alias for pipeline operations.
pub type CompileResult<T> = Result<T, BackendError>;
