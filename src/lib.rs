//! Back end of the SL compiler: the i686 instruction-stream optimizer and
//! the textual assembly emitter it feeds.
//!
//! The code generator hands each function to [`backend::i686::optimize`] as a
//! flat instruction sequence; the optimizer runs a configured number of
//! peephole passes over it, consulting an abstract value tracker and a
//! forward liveness analyzer, and returns an equivalent, shorter sequence.
//! [`backend::i686::emit`] serializes the result to AT&T-syntax assembly for
//! the external assembler.

// Peephole passes use index-based iteration over instruction arrays where the
// loop variable is used as both an index and for bounds arithmetic. Converting
// to iterators would obscure the sliding-window logic.
#![allow(clippy::needless_range_loop)]

pub mod backend;
