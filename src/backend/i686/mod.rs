//! i686 back end: machine model, per-function peephole optimizer, emitter.
//!
//! The code generator lowers each function to a flat `Vec<Inst>` and calls
//! [`optimize`] with the calling-convention facts it established and the
//! optimization settings from the driver. The optimized sequence is then
//! serialized by [`emit::emit_function`] and handed to the external
//! assembler.

pub mod emit;
pub mod insn;
pub mod peephole;
pub mod refs;
pub mod state;
pub mod tracker;

pub use insn::{
    ByteSrc, Cond, Dest, FpOp, FpSrc, Inst, MemoryLocation, Operand, Register, XmmRegister, XmmSrc,
};
pub use peephole::optimize;
pub use state::{AbstractState, AbstractValue};

use thiserror::Error;

/// Calling-convention facts the code generator establishes and the optimizer
/// must honor. The optimizer never derives these; they are inputs.
#[derive(Debug, Clone)]
pub struct CallConv {
    /// General-purpose registers a call destroys.
    pub clobbered: Vec<Register>,
    /// XMM registers a call destroys (they also carry float arguments, so
    /// liveness treats them conservatively at call sites).
    pub clobbered_xmm: Vec<XmmRegister>,
    /// Register holding an integer return value; `ret` reads it.
    pub int_return: Register,
    /// XMM register holding a float return value, if the convention uses
    /// one (`None` means floats return on the x87 stack).
    pub xmm_return: Option<XmmRegister>,
    /// Whether the callee pops its own arguments (`ret imm`).
    pub callee_cleans: bool,
}

impl CallConv {
    /// The default SL convention: arguments on the stack, caller cleans,
    /// integer results in `eax`, float results in `st0`, calls clobber the
    /// accumulator pair and both XMM scratch registers.
    pub fn cdecl() -> CallConv {
        CallConv {
            clobbered: vec![Register::Eax, Register::Edx],
            clobbered_xmm: vec![XmmRegister::Xmm0, XmmRegister::Xmm1],
            int_return: Register::Eax,
            xmm_return: None,
            callee_cleans: false,
        }
    }

    pub fn clobbers(&self, reg: Register) -> bool {
        self.clobbered.iter().any(|c| c.overlaps(reg))
    }

    pub fn clobbers_xmm(&self, xmm: XmmRegister) -> bool {
        self.clobbered_xmm.contains(&xmm)
    }
}

impl Default for CallConv {
    fn default() -> Self {
        CallConv::cdecl()
    }
}

/// Optimizer settings, handed down from the driver.
#[derive(Debug, Clone, Copy)]
pub struct OptimizeOptions {
    pub enabled: bool,
    /// Number of rewrite passes per function. Fixed count, no fixpoint
    /// check; later passes clean up opportunities earlier passes expose.
    pub passes: u32,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        OptimizeOptions { enabled: true, passes: 3 }
    }
}

/// An internal invariant violation: the instruction stream handed to the
/// optimizer is malformed. Always a compiler bug, never a user error;
/// optimization of the function is abandoned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptimizeError {
    #[error("{func}: label `{label}` defined more than once")]
    DuplicateLabel { func: String, label: String },
    #[error("{func}: instruction {index} jumps to undefined local label `{label}`")]
    UnresolvedLabel { func: String, index: usize, label: String },
}
