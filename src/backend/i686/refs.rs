//! Reference analysis: "is it possible that this value is read before it is
//! definitely overwritten?"
//!
//! Three query kinds share one forward walk: general-purpose registers, XMM
//! registers, and `esp`-relative stack slots. The walk follows unconditional
//! jumps to internal labels, explores both arms of conditional jumps (a read
//! on either arm counts), and memoizes visited labels so loops terminate.
//! Every ambiguous case answers "referenced": that only ever keeps an
//! instruction the rewriter could have dropped.

use rustc_hash::FxHashSet;

use super::insn::{
    is_internal_label, ranges_overlap, ByteSrc, Dest, Inst, MemoryLocation, Operand, Register,
    XmmRegister, XmmSrc,
};
use super::CallConv;

#[derive(Clone, Copy)]
enum Target {
    Reg(Register),
    Xmm(XmmRegister),
    /// Dword at `[esp + offset]`. The offset is rewritten as the walk
    /// crosses pushes, pops and immediate `esp` adjustments.
    Slot(i32),
}

/// May the current value of `reg` be read at or after `insts[from]`?
pub fn is_reg_referenced(insts: &[Inst], from: usize, reg: Register, conv: &CallConv) -> bool {
    walk(insts, from, Target::Reg(reg), conv, &mut FxHashSet::default())
}

/// May the current value of `xmm` be read at or after `insts[from]`?
pub fn is_xmm_referenced(insts: &[Inst], from: usize, xmm: XmmRegister, conv: &CallConv) -> bool {
    walk(insts, from, Target::Xmm(xmm), conv, &mut FxHashSet::default())
}

/// May the dword currently at `[esp + offset]` be read at or after
/// `insts[from]`?
///
/// Part of the analyzer surface for the code generator's frame-slot
/// decisions. The rewriter itself does not consult it: a rule that drops a
/// push shifts `esp` under every kept instruction, so those rules must
/// reject any `esp` reference syntactically rather than ask whether the
/// one pushed slot is read.
pub fn is_stack_slot_referenced(insts: &[Inst], from: usize, offset: i32, conv: &CallConv) -> bool {
    walk(insts, from, Target::Slot(offset), conv, &mut FxHashSet::default())
}

fn find_label(insts: &[Inst], label: &str) -> Option<usize> {
    insts
        .iter()
        .position(|i| matches!(i, Inst::Label(l) if l == label))
}

fn walk(
    insts: &[Inst],
    mut idx: usize,
    mut target: Target,
    conv: &CallConv,
    visited: &mut FxHashSet<String>,
) -> bool {
    while idx < insts.len() {
        let inst = &insts[idx];
        match inst {
            Inst::Label(_) => {}
            Inst::Jmp(label) => {
                if !is_internal_label(label) {
                    return true;
                }
                if !visited.insert(label.clone()) {
                    return false;
                }
                match find_label(insts, label) {
                    Some(t) => {
                        idx = t;
                        continue;
                    }
                    None => return true,
                }
            }
            Inst::Jcc(_, label) => {
                // Either arm reading the value makes it live.
                let taken = if !is_internal_label(label) {
                    true
                } else if visited.contains(label) {
                    false
                } else {
                    match find_label(insts, label) {
                        Some(t) => {
                            visited.insert(label.clone());
                            walk(insts, t, target, conv, visited)
                        }
                        None => true,
                    }
                };
                if taken {
                    return true;
                }
            }
            _ => match step(inst, &mut target, conv) {
                Step::Read => return true,
                Step::Dead => return false,
                Step::Continue => {}
            },
        }
        idx += 1;
    }
    // Ran off the end without a `ret`; assume live.
    true
}

enum Step {
    Read,
    Dead,
    Continue,
}

fn step(inst: &Inst, target: &mut Target, conv: &CallConv) -> Step {
    match *target {
        Target::Reg(r) => step_reg(inst, r, conv),
        Target::Xmm(x) => step_xmm(inst, x, conv),
        Target::Slot(ref mut off) => step_slot(inst, off, conv),
    }
}

fn step_reg(inst: &Inst, r: Register, conv: &CallConv) -> Step {
    match inst {
        Inst::Call(_) => {
            // Arguments travel on the stack; a clobbered register is
            // overwritten, anything else we must assume the callee uses.
            if conv.clobbers(r) {
                Step::Dead
            } else {
                Step::Read
            }
        }
        Inst::Ret | Inst::RetImm(_) => {
            if r.overlaps(conv.int_return) || r == Register::Esp || r == Register::Ebp {
                Step::Read
            } else {
                Step::Dead
            }
        }
        _ => {
            if inst_reads_reg(inst, r) {
                Step::Read
            } else if inst_kills_reg(inst, r) {
                Step::Dead
            } else {
                Step::Continue
            }
        }
    }
}

fn step_xmm(inst: &Inst, x: XmmRegister, conv: &CallConv) -> Step {
    match inst {
        // XMM registers may carry float arguments; assume the callee reads.
        Inst::Call(_) => Step::Read,
        Inst::Ret | Inst::RetImm(_) => {
            if conv.xmm_return == Some(x) {
                Step::Read
            } else {
                Step::Dead
            }
        }
        Inst::Movss(d, src) => {
            if matches!(src, XmmSrc::Xmm(s) if *s == x) {
                Step::Read
            } else if *d == x {
                Step::Dead
            } else {
                Step::Continue
            }
        }
        Inst::MovssStore(_, s) => {
            if *s == x {
                Step::Read
            } else {
                Step::Continue
            }
        }
        Inst::SseArith { dst, src, .. } => {
            let reads_src = matches!(src, XmmSrc::Xmm(s) if *s == x);
            if *dst == x || reads_src {
                Step::Read
            } else {
                Step::Continue
            }
        }
        Inst::Ucomiss(a, src) => {
            if *a == x || matches!(src, XmmSrc::Xmm(s) if *s == x) {
                Step::Read
            } else {
                Step::Continue
            }
        }
        _ => Step::Continue,
    }
}

fn step_slot(inst: &Inst, off: &mut i32, _conv: &CallConv) -> Step {
    let slot_read = |loc: &MemoryLocation| {
        loc.is_esp_based() && ranges_overlap(loc.offset(), loc.byte_size(), *off, 4)
    };
    let op_reads_slot = |op: &Operand| matches!(op, Operand::Mem(loc) if slot_read(loc));
    match inst {
        // The callee addresses its incoming arguments, which are exactly
        // the caller's live `esp` slots.
        Inst::Call(_) | Inst::Ret | Inst::RetImm(_) => Step::Read,

        Inst::Push(op) => {
            if op_reads_slot(op) {
                return Step::Read;
            }
            *off += 4;
            Step::Continue
        }
        Inst::Pop(r) => {
            if *off == 0 || *r == Register::Esp {
                return Step::Read;
            }
            *off -= 4;
            if *off < 0 {
                Step::Dead
            } else {
                Step::Continue
            }
        }
        Inst::Add(Dest::Reg(Register::Esp), Operand::Imm(k)) => {
            *off -= k;
            if *off < 0 {
                Step::Dead
            } else {
                Step::Continue
            }
        }
        Inst::Sub(Dest::Reg(Register::Esp), Operand::Imm(k)) => {
            *off += k;
            Step::Continue
        }

        Inst::Mov(dest, src) => {
            if op_reads_slot(src) {
                return Step::Read;
            }
            match dest {
                Dest::Reg(Register::Esp) => Step::Read, // offsets untrackable
                Dest::Mem(loc) if loc.is_esp_based() => {
                    if !loc.is_byte() && loc.offset() == *off {
                        Step::Dead
                    } else if slot_read(loc) {
                        Step::Read // partial overwrite, keep it simple
                    } else {
                        Step::Continue
                    }
                }
                _ => Step::Continue,
            }
        }
        Inst::Fstp(loc) | Inst::MovssStore(loc, _) => {
            if loc.is_esp_based() {
                if !loc.is_byte() && loc.offset() == *off {
                    Step::Dead
                } else if slot_read(loc) {
                    Step::Read
                } else {
                    Step::Continue
                }
            } else {
                Step::Continue
            }
        }

        Inst::Movzx(_, src) | Inst::Movsx(_, src) => match src {
            ByteSrc::Mem(loc) if slot_read(loc) => Step::Read,
            _ => Step::Continue,
        },
        Inst::Lea(Register::Esp, _) => Step::Read,
        Inst::Lea(..) => Step::Continue,

        Inst::Add(dest, src)
        | Inst::Sub(dest, src)
        | Inst::And(dest, src)
        | Inst::Or(dest, src)
        | Inst::Xor(dest, src)
        | Inst::Shl(dest, src)
        | Inst::Shr(dest, src)
        | Inst::Sar(dest, src) => {
            if *dest == Dest::Reg(Register::Esp) {
                return Step::Read; // non-immediate esp adjustment
            }
            let dest_touches = matches!(dest, Dest::Mem(loc) if slot_read(loc));
            if dest_touches || op_reads_slot(src) {
                Step::Read
            } else {
                Step::Continue
            }
        }
        Inst::Imul(_, src) | Inst::Idiv(src) => {
            if op_reads_slot(src) {
                Step::Read
            } else {
                Step::Continue
            }
        }
        Inst::Inc(dest) | Inst::Dec(dest) | Inst::Neg(dest) | Inst::Not(dest) => {
            if *dest == Dest::Reg(Register::Esp) {
                return Step::Read;
            }
            if matches!(dest, Dest::Mem(loc) if slot_read(loc)) {
                Step::Read
            } else {
                Step::Continue
            }
        }
        Inst::Cmp(a, b) | Inst::Test(a, b) => {
            if op_reads_slot(a) || op_reads_slot(b) {
                Step::Read
            } else {
                Step::Continue
            }
        }
        Inst::Fld(super::insn::FpSrc::Mem(loc)) => {
            if slot_read(loc) {
                Step::Read
            } else {
                Step::Continue
            }
        }
        Inst::Movss(_, XmmSrc::Mem(loc))
        | Inst::SseArith { src: XmmSrc::Mem(loc), .. }
        | Inst::Ucomiss(_, XmmSrc::Mem(loc)) => {
            if slot_read(loc) {
                Step::Read
            } else {
                Step::Continue
            }
        }
        _ => Step::Continue,
    }
}

// ── Single-instruction classification ────────────────────────────────────

fn loc_uses(loc: &MemoryLocation, r: Register) -> bool {
    loc.base_reg().is_some_and(|b| b.overlaps(r))
}

fn op_reads(op: &Operand, r: Register) -> bool {
    match op {
        Operand::Reg(s) => s.overlaps(r),
        Operand::Imm(_) => false,
        Operand::Mem(loc) => loc_uses(loc, r),
    }
}

fn byte_src_reads(src: &ByteSrc, r: Register) -> bool {
    match src {
        ByteSrc::Reg(s) => s.overlaps(r),
        ByteSrc::Mem(loc) => loc_uses(loc, r),
    }
}

fn xmm_src_uses(src: &XmmSrc, r: Register) -> bool {
    matches!(src, XmmSrc::Mem(loc) if loc_uses(loc, r))
}

/// Read-modify-write destination: the old value participates.
fn dest_reads(dest: &Dest, r: Register) -> bool {
    match dest {
        Dest::Reg(d) => d.overlaps(r),
        Dest::Mem(loc) => loc_uses(loc, r),
    }
}

/// Writing a byte register leaves the parent's upper bits flowing through;
/// for a wider query that pass-through counts as a read.
fn partial_write_reads(d: Register, r: Register) -> bool {
    d.is_byte() && d != r && d.overlaps(r)
}

/// Does `inst` read any bit of `r`? Calls and returns answer `true` here;
/// the walk handles their convention-specific cases before asking.
pub fn inst_reads_reg(inst: &Inst, r: Register) -> bool {
    match inst {
        Inst::Label(_) | Inst::Jmp(_) | Inst::Jcc(..) => false,
        Inst::Call(_) | Inst::Ret | Inst::RetImm(_) => true,

        Inst::Push(op) => op_reads(op, r) || r == Register::Esp,
        Inst::Pop(_) => r == Register::Esp,
        Inst::Mov(dest, src) => {
            op_reads(src, r)
                || matches!(dest, Dest::Mem(loc) if loc_uses(loc, r))
                || matches!(dest, Dest::Reg(d) if partial_write_reads(*d, r))
        }
        Inst::Movzx(_, src) | Inst::Movsx(_, src) => byte_src_reads(src, r),
        Inst::Lea(_, loc) => loc_uses(loc, r),
        Inst::Xor(dest, src) => {
            if let (Dest::Reg(d), Operand::Reg(s)) = (dest, src) {
                if d == s {
                    // Zeroing idiom: no read, except the pass-through of a
                    // byte-width zero.
                    return partial_write_reads(*d, r);
                }
            }
            op_reads(src, r) || dest_reads(dest, r)
        }
        Inst::Add(dest, src)
        | Inst::Sub(dest, src)
        | Inst::And(dest, src)
        | Inst::Or(dest, src)
        | Inst::Shl(dest, src)
        | Inst::Shr(dest, src)
        | Inst::Sar(dest, src) => op_reads(src, r) || dest_reads(dest, r),
        Inst::Imul(d, src) => d.overlaps(r) || op_reads(src, r),
        Inst::Inc(dest) | Inst::Dec(dest) | Inst::Neg(dest) | Inst::Not(dest) => {
            dest_reads(dest, r)
        }
        Inst::Cmp(a, b) | Inst::Test(a, b) => op_reads(a, r) || op_reads(b, r),
        Inst::Cdq => Register::Eax.overlaps(r),
        Inst::Idiv(op) => {
            op_reads(op, r) || Register::Eax.overlaps(r) || Register::Edx.overlaps(r)
        }
        Inst::Fld(super::insn::FpSrc::Mem(loc)) | Inst::Fstp(loc) => loc_uses(loc, r),
        Inst::Fld(super::insn::FpSrc::Const(_)) | Inst::Fchs | Inst::FArith { .. } | Inst::Fcomip => {
            false
        }
        Inst::Movss(_, src) | Inst::Ucomiss(_, src) | Inst::SseArith { src, .. } => {
            xmm_src_uses(src, r)
        }
        Inst::MovssStore(loc, _) => loc_uses(loc, r),
    }
}

/// `d` being written means every bit of `r` is overwritten.
fn covers(d: Register, r: Register) -> bool {
    if d.is_byte() {
        d == r
    } else {
        d.overlaps(r)
    }
}

/// Does `inst` unconditionally overwrite all of `r` (old value dead)?
fn inst_kills_reg(inst: &Inst, r: Register) -> bool {
    match inst {
        Inst::Mov(Dest::Reg(d), _) => covers(*d, r),
        Inst::Pop(d) => covers(*d, r),
        Inst::Movzx(d, _) | Inst::Movsx(d, _) | Inst::Lea(d, _) => covers(*d, r),
        Inst::Xor(Dest::Reg(d), Operand::Reg(s)) if d == s => covers(*d, r),
        Inst::Imul(d, _) => covers(*d, r),
        Inst::Cdq => covers(Register::Edx, r),
        Inst::Idiv(_) => covers(Register::Eax, r) || covers(Register::Edx, r),
        _ => false,
    }
}

/// Does this one instruction, by itself, destroy `r`'s current value? Any
/// write counts, including a partial byte write. Used to gate push/pop
/// fusion; never a substitute for the full walk.
pub fn does_register_lose_integrity(inst: &Inst, r: Register, conv: &CallConv) -> bool {
    match inst {
        Inst::Call(_) => conv.clobbers(r),
        _ => inst_writes_reg(inst, r),
    }
}

/// Does `inst` mention `r` at all, reading or writing any part of it?
pub fn inst_references_reg(inst: &Inst, r: Register) -> bool {
    inst_reads_reg(inst, r) || inst_writes_reg(inst, r)
}

/// Does `inst` write any part of `r`, including partial byte writes?
pub fn inst_writes_reg(inst: &Inst, r: Register) -> bool {
    let dest_hits = |dest: &Dest| matches!(dest, Dest::Reg(d) if d.overlaps(r));
    match inst {
        Inst::Mov(dest, _) => dest_hits(dest),
        Inst::Pop(d) => d.overlaps(r) || r == Register::Esp,
        Inst::Push(_) => r == Register::Esp,
        Inst::Call(_) | Inst::Ret | Inst::RetImm(_) => true,
        Inst::Movzx(d, _) | Inst::Movsx(d, _) | Inst::Lea(d, _) | Inst::Imul(d, _) => {
            d.overlaps(r)
        }
        Inst::Add(dest, _)
        | Inst::Sub(dest, _)
        | Inst::And(dest, _)
        | Inst::Or(dest, _)
        | Inst::Xor(dest, _)
        | Inst::Shl(dest, _)
        | Inst::Shr(dest, _)
        | Inst::Sar(dest, _) => dest_hits(dest),
        Inst::Inc(dest) | Inst::Dec(dest) | Inst::Neg(dest) | Inst::Not(dest) => dest_hits(dest),
        Inst::Cdq => Register::Edx.overlaps(r),
        Inst::Idiv(_) => Register::Eax.overlaps(r) || Register::Edx.overlaps(r),
        _ => false,
    }
}

/// Any implicit or explicit use of the stack pointer. Gates every rewrite
/// that folds a push/pop window.
pub fn inst_references_esp(inst: &Inst) -> bool {
    inst_reads_reg(inst, Register::Esp) || inst_writes_reg(inst, Register::Esp)
}

/// Labels, jumps, calls and returns end a rewrite window.
pub fn is_control_flow(inst: &Inst) -> bool {
    matches!(
        inst,
        Inst::Label(_)
            | Inst::Jmp(_)
            | Inst::Jcc(..)
            | Inst::Call(_)
            | Inst::Ret
            | Inst::RetImm(_)
    )
}
