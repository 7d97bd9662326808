use std::sync::Arc;

use crate::compile::CompilationStats;
use crate::util::{Address, ByteSize};
use crate::vm::method::MethodRef;

/// The classification of a compiler's output: baseline code is fast to
/// produce and lower quality, optimized code is slower to produce and higher
/// quality.
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum Nature {
    #[strum(serialize = "baseline")]
    Baseline,
    #[strum(serialize = "opt")]
    Optimizing,
}

/// A handle to machine code installed in the target's code cache for one
/// compilation of one method.
#[derive(Debug)]
pub struct TargetCode {
    /// Full name of the compiled method.
    pub method_name: String,
    /// Which kind of compiler produced this code.
    pub nature: Nature,
    /// Start of the installed code in the target's address space.
    pub code_start: Address,
    pub code_size: ByteSize,
}

/// Compiled code handles are shared between the per-method compiled state and
/// every thread that requested or joined the compilation.
pub type CodeHandle = Arc<TargetCode>;

/// A compilation failure reported by a compiler.
///
/// A bailout is the distinguished recoverable condition: the compiler
/// declined the method and another compiler may succeed, so the scheduler
/// retries once with the other configured compiler.  Anything else is a hard
/// failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CompileError {
    #[error("bailout: {0}")]
    Bailout(String),
    #[error("{0}")]
    Fatal(String),
}

impl CompileError {
    pub fn is_bailout(&self) -> bool {
        matches!(self, CompileError::Bailout(_))
    }
}

/// A compiler the scheduler can drive.  Two implementations of differing
/// code-quality/latency tradeoffs are normally configured, one per
/// [`Nature`]; the scheduler selects between them and fails over from one to
/// the other.
pub trait RuntimeCompiler: Send + Sync {
    /// Short name used in logs and in per-method compiler directives.
    fn name(&self) -> &str;

    fn nature(&self) -> Nature;

    /// Produce target machine code for `method`.  `is_deopt` requests code
    /// suitable as a deoptimization target.  Counters for the attempt are
    /// recorded in `stats` by the caller; a compiler may add its own.
    fn compile(
        &self,
        method: &MethodRef,
        is_deopt: bool,
        stats: &CompilationStats,
    ) -> Result<CodeHandle, CompileError>;

    /// Does `compiler_name` (from a compile directive) refer to this compiler?
    fn matches(&self, compiler_name: &str) -> bool {
        self.name().eq_ignore_ascii_case(compiler_name)
    }
}
