//! Peephole rewriter and pass driver.
//!
//! [`optimize`] validates the label structure of a function body, then runs
//! [`run_pass`] a fixed number of times. Each pass walks the instruction
//! list once with a fresh [`AbstractState`], trying rewrite rules in
//! priority order; an instruction no rule claims is fed to the value
//! tracker and appended unchanged. Passes rebuild the list wholesale, so
//! later passes see what earlier passes exposed.
//!
//! Every rule either provably preserves observable behavior or does not
//! fire. EFLAGS are not modeled by the tracker, so any rule that adds,
//! removes or reorders a flag-writing instruction is gated on
//! [`flags_live_after`].

use log::{debug, trace};
use rustc_hash::FxHashSet;

use super::insn::{
    is_internal_label, Dest, FpOp, Inst, Operand, Register, XmmSrc,
};
use super::refs;
use super::state::{AbstractState, AbstractValue};
use super::tracker::{self, operand_int};
use super::{CallConv, OptimizeError, OptimizeOptions};

/// Optimize one function body. `func` is only used in diagnostics.
pub fn optimize(
    func: &str,
    mut insts: Vec<Inst>,
    conv: &CallConv,
    opts: &OptimizeOptions,
) -> Result<Vec<Inst>, OptimizeError> {
    validate_labels(func, &insts)?;
    if !opts.enabled {
        return Ok(insts);
    }
    let before = insts.len();
    for pass in 0..opts.passes {
        let len = insts.len();
        insts = run_pass(&insts, conv);
        trace!("{func}: pass {pass}: {len} -> {} instructions", insts.len());
    }
    debug!(
        "{func}: {} passes, {before} -> {} instructions",
        opts.passes,
        insts.len()
    );
    Ok(insts)
}

/// Duplicate or dangling internal labels are generator bugs; catching them
/// here beats emitting assembly the assembler rejects.
fn validate_labels(func: &str, insts: &[Inst]) -> Result<(), OptimizeError> {
    let mut defined = FxHashSet::default();
    for inst in insts {
        if let Inst::Label(label) = inst {
            if !defined.insert(label.as_str()) {
                return Err(OptimizeError::DuplicateLabel {
                    func: func.to_string(),
                    label: label.clone(),
                });
            }
        }
    }
    for (index, inst) in insts.iter().enumerate() {
        if let Inst::Jmp(label) | Inst::Jcc(_, label) = inst {
            if is_internal_label(label) && !defined.contains(label.as_str()) {
                return Err(OptimizeError::UnresolvedLabel {
                    func: func.to_string(),
                    index,
                    label: label.clone(),
                });
            }
        }
    }
    Ok(())
}

fn keep(out: &mut Vec<Inst>, st: &mut AbstractState, conv: &CallConv, inst: Inst) {
    tracker::track(&inst, st, conv);
    out.push(inst);
}

fn run_pass(insts: &[Inst], conv: &CallConv) -> Vec<Inst> {
    let mut out: Vec<Inst> = Vec::with_capacity(insts.len());
    let mut st = AbstractState::new();
    let mut i = 0usize;

    while i < insts.len() {
        let inst = &insts[i];

        // Code between an unconditional jump and the next label can never
        // run. The label itself stays; other jumps may target it.
        if matches!(inst, Inst::Jmp(_)) {
            keep(&mut out, &mut st, conv, inst.clone());
            i = skip_to_label(insts, i + 1);
            continue;
        }

        if let Inst::Push(src) = inst {
            // push X ; pop R
            if let Some(Inst::Pop(r)) = insts.get(i + 1) {
                if *r != Register::Esp {
                    if *src == Operand::Reg(*r) {
                        trace!("dropping push/pop pair on {:?}", r);
                    } else {
                        keep(&mut out, &mut st, conv, Inst::Mov(Dest::Reg(*r), src.clone()));
                    }
                    i += 2;
                    continue;
                }
            }
            // push X ; M ; pop R, with M oblivious to the stack, to R, and
            // to the pushed value.
            if let Some(Inst::Pop(r)) = insts.get(i + 2) {
                let mid = &insts[i + 1];
                let src_stable = match src {
                    Operand::Imm(_) => true,
                    Operand::Reg(s) => !refs::does_register_lose_integrity(mid, *s, conv),
                    Operand::Mem(_) => false,
                };
                if *r != Register::Esp
                    && src_stable
                    && !refs::is_control_flow(mid)
                    && !refs::inst_references_esp(mid)
                    && !refs::inst_references_reg(mid, *r)
                {
                    keep(&mut out, &mut st, conv, mid.clone());
                    if *src != Operand::Reg(*r) {
                        keep(&mut out, &mut st, conv, Inst::Mov(Dest::Reg(*r), src.clone()));
                    }
                    i += 3;
                    continue;
                }
            }
            // push X ... add esp, 4 with nothing in between touching esp:
            // the pushed value is never consumed.
            if let Some(j) = find_balancing_add(insts, i + 1) {
                trace!("eliding unconsumed push at {i} and its reset at {j}");
                for k in i + 1..j {
                    keep(&mut out, &mut st, conv, insts[k].clone());
                }
                i = j + 1;
                continue;
            }
        }

        // Involutions: neg/neg always, not/not (which never writes flags).
        if let Inst::Neg(d) = inst {
            if insts.get(i + 1) == Some(&Inst::Neg(d.clone())) && !flags_live_after(insts, i + 2) {
                i += 2;
                continue;
            }
        }
        if let Inst::Not(d) = inst {
            if insts.get(i + 1) == Some(&Inst::Not(d.clone())) {
                i += 2;
                continue;
            }
        }

        // addss/subss by the same constant in immediate succession.
        if let Inst::SseArith { op: op1, dst, src: XmmSrc::Const(c1) } = inst {
            if let Some(Inst::SseArith { op: op2, dst: d2, src: XmmSrc::Const(c2) }) =
                insts.get(i + 1)
            {
                let inverse = matches!(
                    (op1, op2),
                    (FpOp::Add, FpOp::Sub) | (FpOp::Sub, FpOp::Add)
                );
                if inverse && dst == d2 && c1.to_bits() == c2.to_bits() && c1.is_finite() {
                    i += 2;
                    continue;
                }
            }
        }

        // Statically resolved conditional branch.
        if let Inst::Cmp(a, b) = inst {
            if let Some(Inst::Jcc(cond, label)) = insts.get(i + 1) {
                if let (Some(x), Some(y)) = (operand_int(&st, a), operand_int(&st, b)) {
                    if !flags_live_after(insts, i + 2) {
                        // A byte compare sets flags from the 8-bit values.
                        // Sign-extending both preserves the signed and the
                        // unsigned orderings alike.
                        let (x, y) = if operand_is_byte(a) || operand_is_byte(b) {
                            (x as i8 as i32, y as i8 as i32)
                        } else {
                            (x, y)
                        };
                        if cond.eval(x, y) {
                            trace!("branch to {label} always taken");
                            keep(&mut out, &mut st, conv, Inst::Jmp(label.clone()));
                            i = skip_to_label(insts, i + 2);
                        } else {
                            trace!("branch to {label} never taken");
                            i += 2;
                        }
                        continue;
                    }
                }
            }
        }

        if let Inst::Mov(dest, src) = inst {
            if let Some(step) = rewrite_mov(insts, i, dest, src, &st, conv) {
                match step {
                    MovRewrite::Drop => {}
                    MovRewrite::Replace(new) => keep(&mut out, &mut st, conv, new),
                }
                i += 1;
                continue;
            }
        }

        // The other flag-preserving register writes are dead-store
        // candidates too; arithmetic is not (it writes EFLAGS).
        if let Inst::Movzx(d, _) | Inst::Movsx(d, _) | Inst::Lea(d, _) = inst {
            if !refs::is_reg_referenced(insts, i + 1, *d, conv) {
                trace!("dropping dead write to {:?} at {i}", d);
                i += 1;
                continue;
            }
        }

        if let Inst::Movss(x, src) = inst {
            let identical = match src {
                XmmSrc::Xmm(s) => s == x || (st.xmm_value(*s).is_some() && st.xmm_value(*s) == st.xmm_value(*x)),
                XmmSrc::Const(c) => st.xmm_value(*x) == Some(AbstractValue::Float(*c)),
                XmmSrc::Mem(loc) => {
                    st.xmm_value(*x) == Some(AbstractValue::AliasOf(loc.clone()))
                        || (st.mem_value(loc).is_some() && st.mem_value(loc) == st.xmm_value(*x))
                }
            };
            if identical || !refs::is_xmm_referenced(insts, i + 1, *x, conv) {
                i += 1;
                continue;
            }
        }
        if let Inst::MovssStore(loc, x) = inst {
            // Only provably-temporary slots; anything else might be observed.
            if loc.is_esp_based()
                && st.xmm_value(*x) == Some(AbstractValue::AliasOf(loc.clone()))
            {
                i += 1;
                continue;
            }
        }

        // Constant-chain merging and strength reduction. The current
        // instruction is tracked first, so the state stays in step with
        // the merged form that replaces the tail of the output.
        if let Some((d, k)) = addsub_delta(inst) {
            if !flags_live_after(insts, i + 1) {
                let prev = out.last().and_then(addsub_delta).map(|(d0, k0)| (d0.clone(), k0));
                if let Some((d0, k0)) = prev {
                    if d0 == *d {
                        let d = d.clone();
                        tracker::track(inst, &mut st, conv);
                        out.pop();
                        let mut net = k0.wrapping_add(k);
                        // Byte immediates wrap at 8 bits; keep the merged
                        // constant in encodable range.
                        if d.is_byte() {
                            net = net as i8 as i32;
                        }
                        if net != 0 {
                            out.push(displacement_inst(d, net));
                        }
                        i += 1;
                        continue;
                    }
                }
                if k == 1 {
                    keep(&mut out, &mut st, conv, Inst::Inc(d.clone()));
                    i += 1;
                    continue;
                }
                if k == -1 {
                    keep(&mut out, &mut st, conv, Inst::Dec(d.clone()));
                    i += 1;
                    continue;
                }
            }
        }
        if let Inst::Imul(r, Operand::Imm(k)) = inst {
            if !flags_live_after(insts, i + 1) {
                let prev = match out.last() {
                    Some(Inst::Imul(r0, Operand::Imm(k0))) if r0 == r => Some(*k0),
                    _ => None,
                };
                if let Some(k0) = prev {
                    let net = k0.wrapping_mul(*k);
                    tracker::track(inst, &mut st, conv);
                    out.pop();
                    if net != 1 {
                        out.push(Inst::Imul(*r, Operand::Imm(net)));
                    }
                    i += 1;
                    continue;
                }
            }
        }

        keep(&mut out, &mut st, conv, inst.clone());
        i += 1;
    }
    out
}

enum MovRewrite {
    Drop,
    Replace(Inst),
}

fn rewrite_mov(
    insts: &[Inst],
    i: usize,
    dest: &Dest,
    src: &Operand,
    st: &AbstractState,
    conv: &CallConv,
) -> Option<MovRewrite> {
    // mov R, R
    if let (Dest::Reg(d), Operand::Reg(s)) = (dest, src) {
        if d == s {
            return Some(MovRewrite::Drop);
        }
    }

    // Destination already holds the value being stored. Memory
    // destinations qualify only when provably stack temporaries; anything
    // else might be observed down a call chain and is always kept.
    let v = tracker::operand_value(st, src);
    let identical = match dest {
        Dest::Reg(d) => {
            (v.is_some() && st.reg_value(*d) == v)
                || matches!(
                    src,
                    Operand::Mem(loc)
                        if st.reg_value(*d) == Some(AbstractValue::AliasOf(loc.clone()))
                )
        }
        Dest::Mem(loc) => {
            loc.is_esp_based()
                && ((v.is_some() && st.mem_value(loc) == v)
                    || matches!(
                        src,
                        Operand::Reg(s)
                            if st.reg_value(*s) == Some(AbstractValue::AliasOf(loc.clone()))
                    ))
        }
    };
    if identical {
        trace!("dropping store of already-present value at {i}");
        return Some(MovRewrite::Drop);
    }

    // A load from a slot some register is known to mirror becomes a
    // register copy, cutting the stack round-trip.
    if let (Dest::Reg(d), Operand::Mem(loc)) = (dest, src) {
        if !loc.is_byte() && st.mem_value(loc).is_none() {
            if let Some(s) = st.register_aliasing(loc) {
                if s == *d {
                    return Some(MovRewrite::Drop);
                }
                return Some(MovRewrite::Replace(Inst::Mov(
                    Dest::Reg(*d),
                    Operand::Reg(s),
                )));
            }
        }
    }

    // A register write nothing ever reads again. Never applied to memory
    // destinations.
    if let Dest::Reg(d) = dest {
        if !refs::is_reg_referenced(insts, i + 1, *d, conv) {
            trace!("dropping dead write to {:?} at {i}", d);
            return Some(MovRewrite::Drop);
        }
    }

    // Zeroing idiom, unless a live flag consumer follows.
    if let (Dest::Reg(d), Operand::Imm(0)) = (dest, src) {
        if !flags_live_after(insts, i + 1) {
            return Some(MovRewrite::Replace(Inst::Xor(
                Dest::Reg(*d),
                Operand::Reg(*d),
            )));
        }
    }

    None
}

/// First label at or after `from`; `insts.len()` if none remain.
fn skip_to_label(insts: &[Inst], mut from: usize) -> usize {
    while from < insts.len() && !matches!(insts[from], Inst::Label(_)) {
        from += 1;
    }
    from
}

/// Index of the `add esp, 4` balancing a push, provided nothing between
/// references the stack pointer or transfers control.
fn find_balancing_add(insts: &[Inst], mut j: usize) -> Option<usize> {
    while j < insts.len() {
        let inst = &insts[j];
        if matches!(
            inst,
            Inst::Add(Dest::Reg(Register::Esp), Operand::Imm(4))
        ) {
            return Some(j);
        }
        if refs::is_control_flow(inst) || refs::inst_references_esp(inst) {
            return None;
        }
        j += 1;
    }
    None
}

fn operand_is_byte(op: &Operand) -> bool {
    match op {
        Operand::Reg(r) => r.is_byte(),
        Operand::Imm(_) => false,
        Operand::Mem(loc) => loc.is_byte(),
    }
}

fn addsub_delta(inst: &Inst) -> Option<(&Dest, i32)> {
    match inst {
        Inst::Add(d, Operand::Imm(k)) => Some((d, *k)),
        Inst::Sub(d, Operand::Imm(k)) => Some((d, k.wrapping_neg())),
        _ => None,
    }
}

fn displacement_inst(d: Dest, net: i32) -> Inst {
    if net > 0 || net == i32::MIN {
        Inst::Add(d, Operand::Imm(net))
    } else {
        Inst::Sub(d, Operand::Imm(net.wrapping_neg()))
    }
}

/// Could a conditional jump consume the flags as they stand at `from`?
/// Scanning stops at the next flag-writing instruction or control-flow
/// boundary; the generator never carries flags across either.
fn flags_live_after(insts: &[Inst], from: usize) -> bool {
    for inst in insts.iter().skip(from) {
        match inst {
            Inst::Jcc(..) => return true,
            Inst::Label(_) | Inst::Jmp(_) | Inst::Call(_) | Inst::Ret | Inst::RetImm(_) => {
                return false
            }
            i if writes_flags(i) => return false,
            _ => {}
        }
    }
    false
}

fn writes_flags(inst: &Inst) -> bool {
    matches!(
        inst,
        Inst::Add(..)
            | Inst::Sub(..)
            | Inst::Imul(..)
            | Inst::And(..)
            | Inst::Or(..)
            | Inst::Xor(..)
            | Inst::Inc(_)
            | Inst::Dec(_)
            | Inst::Neg(_)
            | Inst::Shl(..)
            | Inst::Shr(..)
            | Inst::Sar(..)
            | Inst::Cmp(..)
            | Inst::Test(..)
            | Inst::Idiv(_)
            | Inst::Fcomip
            | Inst::Ucomiss(..)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::i686::insn::MemoryLocation as Loc;
    use crate::backend::i686::Cond;
    use Register::*;

    fn opt(insts: Vec<Inst>) -> Vec<Inst> {
        optimize("test_fn", insts, &CallConv::cdecl(), &OptimizeOptions::default()).unwrap()
    }

    fn one_pass(insts: Vec<Inst>) -> Vec<Inst> {
        optimize(
            "test_fn",
            insts,
            &CallConv::cdecl(),
            &OptimizeOptions { enabled: true, passes: 1 },
        )
        .unwrap()
    }

    fn mov_ri(r: Register, k: i32) -> Inst {
        Inst::Mov(Dest::Reg(r), Operand::Imm(k))
    }

    #[test]
    fn push_pop_same_register_vanishes() {
        assert_eq!(opt(vec![Inst::Push(Operand::Reg(Eax)), Inst::Pop(Eax)]), vec![]);
    }

    #[test]
    fn push_pop_fuses_to_mov() {
        let got = one_pass(vec![Inst::Push(Operand::Imm(7)), Inst::Pop(Ecx), Inst::Ret]);
        assert_eq!(
            got,
            vec![mov_ri(Ecx, 7), Inst::Ret]
        );
    }

    #[test]
    fn push_mid_pop_fuses_when_mid_is_unrelated() {
        let got = one_pass(vec![
            Inst::Push(Operand::Reg(Eax)),
            mov_ri(Ebx, 5),
            Inst::Pop(Ecx),
            Inst::Ret,
        ]);
        assert_eq!(
            got,
            vec![mov_ri(Ebx, 5), Inst::Mov(Dest::Reg(Ecx), Operand::Reg(Eax)), Inst::Ret]
        );
    }

    #[test]
    fn push_mid_pop_not_fused_when_mid_writes_source() {
        // The middle instruction rewrites eax, so the popped value must be
        // the pre-push one; the window stays as it is.
        let insts = vec![
            Inst::Push(Operand::Reg(Eax)),
            mov_ri(Eax, 1),
            Inst::Pop(Ebx),
            Inst::Mov(Dest::Mem(Loc::Reg(Ebp, -4)), Operand::Reg(Ebx)),
            Inst::Mov(Dest::Mem(Loc::Reg(Ebp, -8)), Operand::Reg(Eax)),
            Inst::Ret,
        ];
        assert_eq!(opt(insts.clone()), insts);
    }

    #[test]
    fn save_restore_around_call_is_kept() {
        let insts = vec![
            Inst::Push(Operand::Reg(Edx)),
            Inst::Call("helper".into()),
            Inst::Pop(Edx),
            Inst::Mov(Dest::Reg(Eax), Operand::Reg(Edx)),
            Inst::Ret,
        ];
        assert_eq!(opt(insts.clone()), insts);
    }

    #[test]
    fn mov_zero_becomes_xor() {
        let got = opt(vec![mov_ri(Eax, 0), Inst::Ret]);
        assert_eq!(got, vec![Inst::Xor(Dest::Reg(Eax), Operand::Reg(Eax)), Inst::Ret]);
    }

    #[test]
    fn mov_zero_kept_when_flags_are_live() {
        // The mov sits between a compare and its jump; xor would destroy
        // the flags.
        let insts = vec![
            Inst::Cmp(Operand::Reg(Ebx), Operand::Reg(Ecx)),
            mov_ri(Eax, 0),
            Inst::Jcc(Cond::E, ".Lout".into()),
            Inst::Label(".Lout".into()),
            Inst::Ret,
        ];
        assert_eq!(opt(insts.clone()), insts);
    }

    #[test]
    fn sub_one_becomes_dec() {
        // eax is read by the return, so the write itself survives.
        let got = one_pass(vec![Inst::Sub(Dest::Reg(Eax), Operand::Imm(1)), Inst::Ret]);
        assert_eq!(got, vec![Inst::Dec(Dest::Reg(Eax)), Inst::Ret]);
    }

    #[test]
    fn stack_round_trip_forwarded_then_elided() {
        let store = Inst::Mov(Dest::Mem(Loc::Reg(Ebp, -4)), Operand::Reg(Ebx));
        let insts = vec![
            Inst::Push(Operand::Reg(Eax)),
            Inst::Mov(Dest::Reg(Ebx), Operand::Mem(Loc::Reg(Esp, 0))),
            Inst::Add(Dest::Reg(Esp), Operand::Imm(4)),
            store.clone(),
            Inst::Ret,
        ];
        // One pass rewrites the load; the push still balances the add.
        let first = one_pass(insts.clone());
        assert_eq!(
            first,
            vec![
                Inst::Push(Operand::Reg(Eax)),
                Inst::Mov(Dest::Reg(Ebx), Operand::Reg(Eax)),
                Inst::Add(Dest::Reg(Esp), Operand::Imm(4)),
                store.clone(),
                Inst::Ret,
            ]
        );
        // A later pass sees the slot is never consumed and drops the pair.
        assert_eq!(
            opt(insts),
            vec![Inst::Mov(Dest::Reg(Ebx), Operand::Reg(Eax)), store, Inst::Ret]
        );
    }

    #[test]
    fn unreachable_code_dropped_label_kept() {
        let got = opt(vec![
            Inst::Jmp(".L1".into()),
            mov_ri(Eax, 1),
            Inst::Push(Operand::Reg(Ebx)),
            Inst::Label(".L1".into()),
            Inst::Ret,
        ]);
        assert_eq!(got, vec![Inst::Jmp(".L1".into()), Inst::Label(".L1".into()), Inst::Ret]);
    }

    #[test]
    fn statically_taken_branch_becomes_jmp() {
        let got = opt(vec![
            mov_ri(Eax, 5),
            Inst::Cmp(Operand::Reg(Eax), Operand::Imm(5)),
            Inst::Jcc(Cond::E, ".L2".into()),
            Inst::Label(".L2".into()),
            Inst::Ret,
        ]);
        assert_eq!(
            got,
            vec![
                mov_ri(Eax, 5),
                Inst::Jmp(".L2".into()),
                Inst::Label(".L2".into()),
                Inst::Ret,
            ]
        );
    }

    #[test]
    fn statically_untaken_branch_falls_through() {
        let store = Inst::Mov(Dest::Mem(Loc::Reg(Ebp, -4)), Operand::Reg(Eax));
        let got = opt(vec![
            mov_ri(Eax, 4),
            Inst::Cmp(Operand::Reg(Eax), Operand::Imm(5)),
            Inst::Jcc(Cond::E, ".L2".into()),
            store.clone(),
            Inst::Label(".L2".into()),
            Inst::Ret,
        ]);
        assert_eq!(
            got,
            vec![mov_ri(Eax, 4), store, Inst::Label(".L2".into()), Inst::Ret]
        );
    }

    #[test]
    fn byte_compare_resolves_with_byte_semantics() {
        // al holds 0x80, which is -128 signed; jl is taken.
        let got = opt(vec![
            mov_ri(Eax, 0x80),
            Inst::Cmp(Operand::Reg(Al), Operand::Imm(0)),
            Inst::Jcc(Cond::L, ".Lneg".into()),
            Inst::Mov(Dest::Mem(Loc::Reg(Ebp, -4)), Operand::Imm(0)),
            Inst::Label(".Lneg".into()),
            Inst::Ret,
        ]);
        assert_eq!(
            got,
            vec![
                mov_ri(Eax, 0x80),
                Inst::Jmp(".Lneg".into()),
                Inst::Label(".Lneg".into()),
                Inst::Ret,
            ]
        );
    }

    #[test]
    fn branch_not_resolved_across_label() {
        // A label is a join point; the known value does not survive it.
        let insts = vec![
            mov_ri(Eax, 5),
            Inst::Label(".Ljoin".into()),
            Inst::Cmp(Operand::Reg(Eax), Operand::Imm(5)),
            Inst::Jcc(Cond::E, ".Ljoin".into()),
            Inst::Ret,
        ];
        assert_eq!(opt(insts.clone()), insts);
    }

    #[test]
    fn dead_register_write_removed() {
        let got = opt(vec![mov_ri(Ecx, 3), Inst::Ret]);
        assert_eq!(got, vec![Inst::Ret]);
    }

    #[test]
    fn return_register_write_kept() {
        let insts = vec![mov_ri(Eax, 3), Inst::Ret];
        assert_eq!(opt(insts.clone()), insts);
    }

    #[test]
    fn memory_store_never_dropped_by_liveness() {
        // The slot could be a local observed through a pointer downstream.
        let insts = vec![
            Inst::Mov(Dest::Mem(Loc::Reg(Ebp, -4)), Operand::Imm(1)),
            Inst::Ret,
        ];
        assert_eq!(opt(insts.clone()), insts);
    }

    #[test]
    fn redundant_store_to_temporary_dropped() {
        let store = Inst::Mov(Dest::Mem(Loc::Reg(Ebp, -4)), Operand::Reg(Ebx));
        let got = opt(vec![
            Inst::Push(Operand::Imm(9)),
            Inst::Mov(Dest::Mem(Loc::Reg(Esp, 0)), Operand::Imm(9)),
            Inst::Pop(Ebx),
            store.clone(),
            Inst::Ret,
        ]);
        assert_eq!(got, vec![mov_ri(Ebx, 9), store, Inst::Ret]);
    }

    #[test]
    fn address_taken_stack_slot_reload_kept() {
        // A pointer to the pushed slot escapes; the store through it makes
        // the reload mandatory even though ebx already held the old value.
        let insts = vec![
            mov_ri(Ebx, 5),
            Inst::Push(Operand::Reg(Ebx)),
            Inst::Lea(Eax, Loc::Reg(Esp, 0)),
            Inst::Mov(Dest::Mem(Loc::Reg(Eax, 0)), Operand::Imm(7)),
            Inst::Mov(Dest::Reg(Ebx), Operand::Mem(Loc::Reg(Esp, 0))),
            Inst::Mov(Dest::Mem(Loc::Reg(Ebp, -4)), Operand::Reg(Ebx)),
            Inst::Add(Dest::Reg(Esp), Operand::Imm(4)),
            Inst::Ret,
        ];
        assert_eq!(opt(insts.clone()), insts);
    }

    #[test]
    fn double_negation_cancels() {
        let got = opt(vec![
            Inst::Neg(Dest::Reg(Eax)),
            Inst::Neg(Dest::Reg(Eax)),
            Inst::Ret,
        ]);
        assert_eq!(got, vec![Inst::Ret]);
        let got = opt(vec![
            Inst::Not(Dest::Reg(Ebx)),
            Inst::Not(Dest::Reg(Ebx)),
            Inst::Ret,
        ]);
        assert_eq!(got, vec![Inst::Ret]);
    }

    #[test]
    fn double_negation_kept_when_flags_are_live() {
        let insts = vec![
            Inst::Neg(Dest::Reg(Eax)),
            Inst::Neg(Dest::Reg(Eax)),
            Inst::Jcc(Cond::E, ".L".into()),
            Inst::Label(".L".into()),
            Inst::Ret,
        ];
        assert_eq!(opt(insts.clone()), insts);
    }

    #[test]
    fn addss_subss_inverse_cancels() {
        use crate::backend::i686::XmmRegister::*;
        let got = opt(vec![
            Inst::SseArith { op: FpOp::Add, dst: Xmm0, src: XmmSrc::Const(2.0) },
            Inst::SseArith { op: FpOp::Sub, dst: Xmm0, src: XmmSrc::Const(2.0) },
            Inst::Ret,
        ]);
        assert_eq!(got, vec![Inst::Ret]);
    }

    #[test]
    fn constant_chain_merges() {
        let got = one_pass(vec![
            Inst::Add(Dest::Reg(Eax), Operand::Imm(8)),
            Inst::Sub(Dest::Reg(Eax), Operand::Imm(3)),
            Inst::Ret,
        ]);
        assert_eq!(got, vec![Inst::Add(Dest::Reg(Eax), Operand::Imm(5)), Inst::Ret]);
    }

    #[test]
    fn balanced_chain_disappears() {
        let got = one_pass(vec![
            Inst::Add(Dest::Reg(Esi), Operand::Imm(4)),
            Inst::Sub(Dest::Reg(Esi), Operand::Imm(4)),
            Inst::Ret,
        ]);
        assert_eq!(got, vec![Inst::Ret]);
    }

    #[test]
    fn byte_chain_wraps_at_eight_bits() {
        // 200 + 100 leaves 44 mod 256; the merged immediate must stay
        // encodable as a byte.
        let got = one_pass(vec![
            Inst::Add(Dest::Reg(Al), Operand::Imm(200)),
            Inst::Add(Dest::Reg(Al), Operand::Imm(100)),
            Inst::Ret,
        ]);
        assert_eq!(got, vec![Inst::Add(Dest::Reg(Al), Operand::Imm(44)), Inst::Ret]);
    }

    #[test]
    fn imul_chain_merges() {
        let got = one_pass(vec![
            Inst::Imul(Eax, Operand::Imm(3)),
            Inst::Imul(Eax, Operand::Imm(5)),
            Inst::Ret,
        ]);
        assert_eq!(got, vec![Inst::Imul(Eax, Operand::Imm(15)), Inst::Ret]);
    }

    #[test]
    fn mov_of_already_held_value_dropped() {
        let store1 = Inst::Mov(Dest::Mem(Loc::Reg(Ebp, -4)), Operand::Reg(Ebx));
        let store2 = Inst::Mov(Dest::Mem(Loc::Reg(Ebp, -8)), Operand::Reg(Ebx));
        let got = opt(vec![
            mov_ri(Eax, 2),
            mov_ri(Ebx, 2),
            store1.clone(),
            // ebx already holds 2; this copy does nothing.
            Inst::Mov(Dest::Reg(Ebx), Operand::Reg(Eax)),
            store2.clone(),
            Inst::Ret,
        ]);
        assert_eq!(
            got,
            vec![mov_ri(Eax, 2), mov_ri(Ebx, 2), store1, store2, Inst::Ret]
        );
    }

    #[test]
    fn extra_pass_is_a_no_op() {
        let insts = vec![
            Inst::Push(Operand::Reg(Eax)),
            Inst::Mov(Dest::Reg(Ebx), Operand::Mem(Loc::Reg(Esp, 0))),
            Inst::Add(Dest::Reg(Esp), Operand::Imm(4)),
            Inst::Cmp(Operand::Reg(Ebx), Operand::Imm(0)),
            Inst::Jcc(Cond::Ne, ".L1".into()),
            Inst::Label(".L1".into()),
            Inst::Ret,
        ];
        let conv = CallConv::cdecl();
        let stable = optimize("f", insts, &conv, &OptimizeOptions::default()).unwrap();
        let again = optimize(
            "f",
            stable.clone(),
            &conv,
            &OptimizeOptions { enabled: true, passes: 1 },
        )
        .unwrap();
        assert_eq!(again, stable);
    }

    #[test]
    fn disabled_optimizer_still_validates() {
        let off = OptimizeOptions { enabled: false, passes: 3 };
        let insts = vec![Inst::Push(Operand::Reg(Eax)), Inst::Pop(Eax), Inst::Ret];
        assert_eq!(
            optimize("f", insts.clone(), &CallConv::cdecl(), &off).unwrap(),
            insts
        );
        let bad = vec![Inst::Jmp(".Lmissing".into())];
        assert!(matches!(
            optimize("f", bad, &CallConv::cdecl(), &off),
            Err(OptimizeError::UnresolvedLabel { index: 0, .. })
        ));
    }

    #[test]
    fn duplicate_label_rejected() {
        let insts = vec![
            Inst::Label(".L1".into()),
            Inst::Ret,
            Inst::Label(".L1".into()),
            Inst::Ret,
        ];
        let err = optimize("dup", insts, &CallConv::cdecl(), &OptimizeOptions::default())
            .unwrap_err();
        assert_eq!(
            err,
            OptimizeError::DuplicateLabel { func: "dup".into(), label: ".L1".into() }
        );
    }

    #[test]
    fn external_targets_are_not_validated() {
        let insts = vec![Inst::Jmp("tail_callee".into())];
        assert!(optimize("f", insts, &CallConv::cdecl(), &OptimizeOptions::default()).is_ok());
    }
}
