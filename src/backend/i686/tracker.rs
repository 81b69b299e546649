//! Value tracker: the abstract-interpretation transfer function.
//!
//! [`track`] applies one instruction to an [`AbstractState`]. The rewriter
//! calls it for every instruction it keeps, so the state always describes
//! the machine just before the instruction currently being inspected.
//! Folding here only ever records facts; dropping or rewriting instructions
//! is the rewriter's job.

use super::insn::{ByteSrc, Dest, FpOp, FpSrc, Inst, Operand, Register, XmmSrc};
use super::state::{AbstractState, AbstractValue};
use super::CallConv;

pub fn track(inst: &Inst, st: &mut AbstractState, conv: &CallConv) {
    match inst {
        // Control may arrive at a label from anywhere; nothing is known.
        Inst::Label(_) | Inst::Jmp(_) | Inst::Ret | Inst::RetImm(_) => st.clear_all(),
        // Fallthrough keeps the pre-branch facts; the taken path starts at
        // a label, which clears on its own.
        Inst::Jcc(..) => {}
        Inst::Call(_) => st.clear_call_clobbered(conv),

        Inst::Push(op) => {
            let v = operand_value(st, op);
            let known = v.is_some();
            st.push_slot(v);
            // Pushing a register of unknown value: the register and the new
            // top slot now hold the same thing.
            if !known {
                if let Operand::Reg(r) = op {
                    if !r.is_byte() && *r != Register::Esp {
                        st.note_reg(
                            *r,
                            AbstractValue::AliasOf(super::MemoryLocation::Reg(Register::Esp, 0)),
                        );
                    }
                }
            }
        }
        Inst::Pop(r) => {
            let v = st.pop_slot();
            if *r == Register::Esp {
                st.invalidate_esp_tracking();
            } else {
                st.set_reg(*r, v);
            }
        }

        Inst::Mov(dest, src) => {
            let v = operand_value(st, src);
            match dest {
                Dest::Reg(r) => {
                    let unknown = v.is_none();
                    st.set_reg(*r, v);
                    // A load of an unknown value makes the register an alias
                    // of the slot, unless the load overwrote its own base.
                    if unknown {
                        if let Operand::Mem(loc) = src {
                            if loc.base_reg().map(|b| b.overlaps(*r)) != Some(true) {
                                st.note_reg(*r, AbstractValue::AliasOf(loc.clone()));
                            }
                        }
                    }
                }
                Dest::Mem(loc) => {
                    let unknown = v.is_none();
                    st.write_mem(loc, v);
                    // Storing an unknown register: it aliases the slot now.
                    if unknown {
                        if let Operand::Reg(r) = src {
                            if loc.base_reg().map(|b| b.overlaps(*r)) != Some(true) {
                                st.note_reg(*r, AbstractValue::AliasOf(loc.clone()));
                            }
                        }
                    }
                }
            }
        }
        Inst::Movzx(r, src) => {
            let v = byte_value(st, src).map(|b| AbstractValue::Int(b as i32));
            st.set_reg(*r, v);
        }
        Inst::Movsx(r, src) => {
            let v = byte_value(st, src).map(|b| AbstractValue::Int(b as i8 as i32));
            st.set_reg(*r, v);
        }
        Inst::Lea(r, loc) => {
            if loc.is_esp_based() {
                st.note_esp_escape();
            }
            st.set_reg(*r, None);
        }

        Inst::Add(dest, src) => fold_binop(st, dest, src, i32::wrapping_add),
        Inst::Sub(dest, src) => fold_binop(st, dest, src, i32::wrapping_sub),
        Inst::Imul(r, src) => {
            let v = int_of(st.reg_value(*r))
                .zip(operand_int(st, src))
                .map(|(a, b)| AbstractValue::Int(a.wrapping_mul(b)));
            st.set_reg(*r, v);
        }
        Inst::And(dest, src) => fold_binop(st, dest, src, |a, b| a & b),
        Inst::Or(dest, src) => fold_binop(st, dest, src, |a, b| a | b),
        Inst::Xor(dest, src) => {
            // xor R, R is the generator's own zeroing idiom.
            if let (Dest::Reg(r), Operand::Reg(s)) = (dest, src) {
                if r == s {
                    let zero = if r.is_byte() {
                        AbstractValue::Byte(0)
                    } else {
                        AbstractValue::Int(0)
                    };
                    st.set_reg(*r, Some(zero));
                    return;
                }
            }
            fold_binop(st, dest, src, |a, b| a ^ b);
        }
        Inst::Inc(dest) => fold_unop(st, dest, |a| a.wrapping_add(1)),
        Inst::Dec(dest) => fold_unop(st, dest, |a| a.wrapping_sub(1)),
        Inst::Neg(dest) => fold_unop(st, dest, i32::wrapping_neg),
        Inst::Not(dest) => fold_unop(st, dest, |a| !a),
        Inst::Shl(dest, src) => fold_binop(st, dest, src, |a, b| a.wrapping_shl(b as u32 & 31)),
        Inst::Shr(dest, src) => {
            fold_binop(st, dest, src, |a, b| ((a as u32) >> (b as u32 & 31)) as i32)
        }
        Inst::Sar(dest, src) => fold_binop(st, dest, src, |a, b| a >> (b as u32 & 31)),

        // Flags only.
        Inst::Cmp(..) | Inst::Test(..) | Inst::Ucomiss(..) => {}

        Inst::Cdq => {
            let v = int_of(st.reg_value(Register::Eax))
                .map(|a| AbstractValue::Int(if a < 0 { -1 } else { 0 }));
            st.set_reg(Register::Edx, v);
        }
        Inst::Idiv(_) => {
            st.set_reg(Register::Eax, None);
            st.set_reg(Register::Edx, None);
        }

        Inst::Fld(src) => {
            let v = match src {
                FpSrc::Const(c) => Some(AbstractValue::Float(*c)),
                FpSrc::Mem(loc) => st
                    .mem_value(loc)
                    // A load of unknown bits still equals the slot's content.
                    .or_else(|| Some(AbstractValue::AliasOf(loc.clone()))),
            };
            st.fpu_push(v);
        }
        Inst::Fstp(loc) => {
            let mut v = st.fpu_pop();
            // "Content of an overlapping slot" is stale the moment we store.
            if matches!(&v, Some(AbstractValue::AliasOf(a)) if a.overlaps(loc)) {
                v = None;
            }
            st.write_mem(loc, v);
        }
        Inst::Fchs => {
            let v = match st.fpu_top() {
                Some(AbstractValue::Float(c)) => Some(AbstractValue::Float(-*c)),
                _ => None,
            };
            st.fpu_set_top(v);
        }
        Inst::FArith { pop, .. } => {
            // Results are never folded; both participating slots go unknown.
            if *pop {
                st.fpu_pop();
                st.fpu_forget_top(1);
            } else {
                st.fpu_forget_top(2);
            }
        }
        Inst::Fcomip => {
            st.fpu_pop();
        }

        Inst::Movss(x, src) => {
            let v = xmm_src_value(st, src);
            let unknown = v.is_none();
            st.set_xmm(*x, v);
            if unknown {
                if let XmmSrc::Mem(loc) = src {
                    st.note_xmm(*x, AbstractValue::AliasOf(loc.clone()));
                }
            }
        }
        Inst::MovssStore(loc, x) => {
            let v = st.xmm_value(*x);
            let unknown = v.is_none();
            st.write_mem(loc, v);
            if unknown {
                st.note_xmm(*x, AbstractValue::AliasOf(loc.clone()));
            }
        }
        Inst::SseArith { op, dst, src } => {
            let a = float_of(st.xmm_value(*dst));
            let b = float_of(xmm_src_value(st, src));
            let v = match (a, b) {
                // Folding a divide by zero would bake in a trap-free result.
                (Some(_), Some(b)) if *op == FpOp::Div && b == 0.0 => None,
                (Some(a), Some(b)) => Some(AbstractValue::Float(apply_fp(*op, a, b))),
                _ => None,
            };
            st.set_xmm(*dst, v);
        }
    }
}

pub fn apply_fp(op: FpOp, a: f32, b: f32) -> f32 {
    match op {
        FpOp::Add => a + b,
        FpOp::Sub => a - b,
        FpOp::Mul => a * b,
        FpOp::Div => a / b,
    }
}

/// The current fact for an integer source operand.
pub fn operand_value(st: &AbstractState, op: &Operand) -> Option<AbstractValue> {
    match op {
        Operand::Reg(r) => st.reg_value(*r),
        Operand::Imm(k) => Some(AbstractValue::Int(*k)),
        Operand::Mem(loc) => st.mem_value(loc),
    }
}

/// An operand narrowed to a known integer, accepting byte facts (shift
/// counts arrive in `cl`).
pub fn operand_int(st: &AbstractState, op: &Operand) -> Option<i32> {
    operand_value(st, op).and_then(|v| match v {
        AbstractValue::Int(k) => Some(k),
        AbstractValue::Byte(b) => Some(b as i32),
        _ => None,
    })
}

fn byte_value(st: &AbstractState, src: &ByteSrc) -> Option<u8> {
    let v = match src {
        ByteSrc::Reg(r) => st.reg_value(*r),
        ByteSrc::Mem(loc) => st.mem_value(loc),
    };
    match v {
        Some(AbstractValue::Byte(b)) => Some(b),
        Some(AbstractValue::Int(k)) => Some(k as u8),
        _ => None,
    }
}

fn xmm_src_value(st: &AbstractState, src: &XmmSrc) -> Option<AbstractValue> {
    match src {
        XmmSrc::Xmm(x) => st.xmm_value(*x),
        XmmSrc::Mem(loc) => st.mem_value(loc),
        XmmSrc::Const(c) => Some(AbstractValue::Float(*c)),
    }
}

fn int_of(v: Option<AbstractValue>) -> Option<i32> {
    match v {
        Some(AbstractValue::Int(k)) => Some(k),
        _ => None,
    }
}

fn float_of(v: Option<AbstractValue>) -> Option<f32> {
    match v {
        Some(AbstractValue::Float(c)) => Some(c),
        _ => None,
    }
}

fn dest_int(st: &AbstractState, dest: &Dest) -> Option<i32> {
    match dest {
        Dest::Reg(r) => int_of(st.reg_value(*r)),
        Dest::Mem(loc) => int_of(st.mem_value(loc)),
    }
}

fn write_dest(st: &mut AbstractState, dest: &Dest, v: Option<AbstractValue>) {
    match dest {
        Dest::Reg(r) => st.set_reg(*r, v),
        Dest::Mem(loc) => st.write_mem(loc, v),
    }
}

fn fold_binop(st: &mut AbstractState, dest: &Dest, src: &Operand, f: fn(i32, i32) -> i32) {
    // Arithmetic on the stack pointer reshapes the frame; tracked offsets
    // are meaningless afterward.
    if *dest == Dest::Reg(Register::Esp) {
        st.invalidate_esp_tracking();
        return;
    }
    if dest.is_byte() {
        write_dest(st, dest, None);
        return;
    }
    let v = dest_int(st, dest)
        .zip(operand_int(st, src))
        .map(|(a, b)| AbstractValue::Int(f(a, b)));
    write_dest(st, dest, v);
}

fn fold_unop(st: &mut AbstractState, dest: &Dest, f: fn(i32) -> i32) {
    if *dest == Dest::Reg(Register::Esp) {
        st.invalidate_esp_tracking();
        return;
    }
    if dest.is_byte() {
        write_dest(st, dest, None);
        return;
    }
    let v = dest_int(st, dest).map(|a| AbstractValue::Int(f(a)));
    write_dest(st, dest, v);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::i686::insn::MemoryLocation as Loc;
    use Register::*;

    fn run(insts: &[Inst]) -> AbstractState {
        let conv = CallConv::cdecl();
        let mut st = AbstractState::new();
        for i in insts {
            track(i, &mut st, &conv);
        }
        st
    }

    #[test]
    fn mov_and_arith_fold() {
        let st = run(&[
            Inst::Mov(Dest::Reg(Eax), Operand::Imm(5)),
            Inst::Add(Dest::Reg(Eax), Operand::Imm(3)),
            Inst::Mov(Dest::Reg(Ebx), Operand::Reg(Eax)),
            Inst::Neg(Dest::Reg(Ebx)),
        ]);
        assert_eq!(st.reg_value(Eax), Some(AbstractValue::Int(8)));
        assert_eq!(st.reg_value(Ebx), Some(AbstractValue::Int(-8)));
    }

    #[test]
    fn xor_self_is_zero() {
        let st = run(&[Inst::Xor(Dest::Reg(Ecx), Operand::Reg(Ecx))]);
        assert_eq!(st.reg_value(Ecx), Some(AbstractValue::Int(0)));
    }

    #[test]
    fn label_clears_everything() {
        let st = run(&[
            Inst::Mov(Dest::Reg(Eax), Operand::Imm(1)),
            Inst::Label(".L1".into()),
        ]);
        assert_eq!(st.reg_value(Eax), None);
    }

    #[test]
    fn conditional_jump_keeps_fallthrough_facts() {
        let st = run(&[
            Inst::Mov(Dest::Reg(Eax), Operand::Imm(1)),
            Inst::Jcc(super::super::Cond::E, ".L1".into()),
        ]);
        assert_eq!(st.reg_value(Eax), Some(AbstractValue::Int(1)));
    }

    #[test]
    fn push_seeds_alias_for_unknown_register() {
        let st = run(&[Inst::Push(Operand::Reg(Eax))]);
        assert_eq!(st.register_aliasing(&Loc::Reg(Esp, 0)), Some(Eax));
    }

    #[test]
    fn push_of_known_value_tracks_slot() {
        let st = run(&[
            Inst::Mov(Dest::Reg(Eax), Operand::Imm(7)),
            Inst::Push(Operand::Reg(Eax)),
        ]);
        assert_eq!(st.mem_value(&Loc::Reg(Esp, 0)), Some(AbstractValue::Int(7)));
    }

    #[test]
    fn store_seeds_alias_for_unknown_register() {
        let slot = Loc::Reg(Ebp, -4);
        let st = run(&[Inst::Mov(Dest::Mem(slot.clone()), Operand::Reg(Eax))]);
        assert_eq!(st.register_aliasing(&slot), Some(Eax));
    }

    #[test]
    fn load_over_own_base_does_not_alias() {
        let st = run(&[Inst::Mov(
            Dest::Reg(Eax),
            Operand::Mem(Loc::Reg(Eax, 4)),
        )]);
        assert_eq!(st.reg_value(Eax), None);
    }

    #[test]
    fn add_esp_invalidates_slot_tracking() {
        let st = run(&[
            Inst::Push(Operand::Imm(3)),
            Inst::Add(Dest::Reg(Esp), Operand::Imm(4)),
        ]);
        assert_eq!(st.mem_value(&Loc::Reg(Esp, 0)), None);
    }

    #[test]
    fn lea_of_stack_slot_ends_temporary_assumption() {
        let st = run(&[
            Inst::Push(Operand::Imm(5)),
            Inst::Lea(Eax, Loc::Reg(Esp, 0)),
        ]);
        assert_eq!(st.mem_value(&Loc::Reg(Esp, 0)), None);
        // Re-established facts do not survive a store through a pointer.
        let st = run(&[
            Inst::Lea(Eax, Loc::Reg(Esp, 0)),
            Inst::Push(Operand::Imm(5)),
            Inst::Mov(Dest::Mem(Loc::Reg(Eax, 0)), Operand::Imm(7)),
        ]);
        assert_eq!(st.mem_value(&Loc::Reg(Esp, 0)), None);
    }

    #[test]
    fn call_preserves_memory_facts() {
        let slot = Loc::Reg(Ebp, -8);
        let st = run(&[
            Inst::Mov(Dest::Mem(slot.clone()), Operand::Imm(2)),
            Inst::Mov(Dest::Reg(Esi), Operand::Imm(9)),
            Inst::Call("f".into()),
        ]);
        assert_eq!(st.mem_value(&slot), Some(AbstractValue::Int(2)));
        assert_eq!(st.reg_value(Esi), Some(AbstractValue::Int(9)));
        assert_eq!(st.reg_value(Eax), None);
    }

    #[test]
    fn cdq_folds_sign() {
        let st = run(&[Inst::Mov(Dest::Reg(Eax), Operand::Imm(-3)), Inst::Cdq]);
        assert_eq!(st.reg_value(Edx), Some(AbstractValue::Int(-1)));
    }

    #[test]
    fn movzx_movsx_fold() {
        let st = run(&[
            Inst::Mov(Dest::Reg(Al), Operand::Imm(0x80)),
            Inst::Movzx(Ebx, ByteSrc::Reg(Al)),
            Inst::Movsx(Ecx, ByteSrc::Reg(Al)),
        ]);
        assert_eq!(st.reg_value(Ebx), Some(AbstractValue::Int(0x80)));
        assert_eq!(st.reg_value(Ecx), Some(AbstractValue::Int(-128)));
    }

    #[test]
    fn sse_folds_but_not_div_by_zero() {
        use crate::backend::i686::XmmRegister::*;
        let st = run(&[
            Inst::Movss(Xmm0, XmmSrc::Const(6.0)),
            Inst::SseArith { op: FpOp::Mul, dst: Xmm0, src: XmmSrc::Const(0.5) },
            Inst::Movss(Xmm1, XmmSrc::Const(1.0)),
            Inst::SseArith { op: FpOp::Div, dst: Xmm1, src: XmmSrc::Const(0.0) },
        ]);
        assert_eq!(st.xmm_value(Xmm0), Some(AbstractValue::Float(3.0)));
        assert_eq!(st.xmm_value(Xmm1), None);
    }

    #[test]
    fn fld_const_fstp_folds_into_store() {
        let slot = Loc::Reg(Ebp, -4);
        let st = run(&[
            Inst::Fld(FpSrc::Const(2.5)),
            Inst::Fstp(slot.clone()),
        ]);
        assert_eq!(st.mem_value(&slot), Some(AbstractValue::Float(2.5)));
    }

    #[test]
    fn shift_count_through_cl() {
        let st = run(&[
            Inst::Mov(Dest::Reg(Eax), Operand::Imm(1)),
            Inst::Mov(Dest::Reg(Cl), Operand::Imm(4)),
            Inst::Shl(Dest::Reg(Eax), Operand::Reg(Cl)),
        ]);
        assert_eq!(st.reg_value(Eax), Some(AbstractValue::Int(16)));
    }
}
