//! AT&T-syntax serialization of optimized instruction sequences.
//!
//! The optimizer never invents a shape this module cannot render; the two
//! are kept in lockstep by the exhaustive match on [`Inst`]. Float literals
//! are pooled per function into `.rodata` under `.LCf` labels, since the
//! machine has no float immediates.

use std::fmt::Write;

use rustc_hash::FxHashMap;

use super::insn::{ByteSrc, Dest, FpOp, FpSrc, Inst, MemoryLocation, Operand, XmmSrc};

/// Render one function: directives, label, body, and its literal pool.
pub fn emit_function(name: &str, insts: &[Inst]) -> String {
    let pool = FloatPool::collect(name, insts);
    let mut out = String::new();
    let _ = writeln!(out, ".text");
    let _ = writeln!(out, ".globl {name}");
    let _ = writeln!(out, "{name}:");
    for inst in insts {
        emit_inst(&mut out, inst, &pool);
    }
    pool.emit(&mut out);
    out
}

/// Per-function pool of float literals, deduplicated by bit pattern.
struct FloatPool {
    labels: FxHashMap<u32, String>,
    order: Vec<u32>,
}

impl FloatPool {
    fn collect(func: &str, insts: &[Inst]) -> FloatPool {
        let mut pool = FloatPool { labels: FxHashMap::default(), order: Vec::new() };
        for inst in insts {
            match inst {
                Inst::Fld(FpSrc::Const(c)) => pool.add(func, *c),
                Inst::Movss(_, XmmSrc::Const(c))
                | Inst::SseArith { src: XmmSrc::Const(c), .. }
                | Inst::Ucomiss(_, XmmSrc::Const(c)) => pool.add(func, *c),
                _ => {}
            }
        }
        pool
    }

    fn add(&mut self, func: &str, c: f32) {
        let bits = c.to_bits();
        if !self.labels.contains_key(&bits) {
            let label = format!(".LCf_{func}_{}", self.order.len());
            self.labels.insert(bits, label);
            self.order.push(bits);
        }
    }

    fn label(&self, c: f32) -> &str {
        &self.labels[&c.to_bits()]
    }

    fn emit(&self, out: &mut String) {
        if self.order.is_empty() {
            return;
        }
        let _ = writeln!(out, ".section .rodata");
        let _ = writeln!(out, ".align 4");
        for bits in &self.order {
            let _ = writeln!(out, "{}:", self.labels[bits]);
            let _ = writeln!(out, "\t.long 0x{bits:08x}");
        }
        let _ = writeln!(out, ".text");
    }
}

fn mem(loc: &MemoryLocation) -> String {
    match loc {
        MemoryLocation::Reg(r, 0) | MemoryLocation::RegByte(r, 0) => {
            format!("({})", r.att_name())
        }
        MemoryLocation::Reg(r, o) | MemoryLocation::RegByte(r, o) => {
            format!("{o}({})", r.att_name())
        }
        MemoryLocation::Sym(s, 0) | MemoryLocation::SymByte(s, 0) => s.clone(),
        MemoryLocation::Sym(s, o) | MemoryLocation::SymByte(s, o) => format!("{s}+{o}"),
    }
}

fn op(operand: &Operand) -> String {
    match operand {
        Operand::Reg(r) => r.att_name().to_string(),
        Operand::Imm(k) => format!("${k}"),
        Operand::Mem(loc) => mem(loc),
    }
}

fn dest(d: &Dest) -> String {
    match d {
        Dest::Reg(r) => r.att_name().to_string(),
        Dest::Mem(loc) => mem(loc),
    }
}

fn byte_src(src: &ByteSrc) -> String {
    match src {
        ByteSrc::Reg(r) => r.att_name().to_string(),
        ByteSrc::Mem(loc) => mem(loc),
    }
}

/// Width suffix from the destination shape.
fn suffix(d: &Dest) -> &'static str {
    if d.is_byte() { "b" } else { "l" }
}

fn op_is_byte(operand: &Operand) -> bool {
    match operand {
        Operand::Reg(r) => r.is_byte(),
        Operand::Imm(_) => false,
        Operand::Mem(loc) => loc.is_byte(),
    }
}

fn fp_mnemonic(fop: FpOp) -> &'static str {
    match fop {
        FpOp::Add => "fadd",
        FpOp::Sub => "fsub",
        FpOp::Mul => "fmul",
        FpOp::Div => "fdiv",
    }
}

fn sse_mnemonic(fop: FpOp) -> &'static str {
    match fop {
        FpOp::Add => "addss",
        FpOp::Sub => "subss",
        FpOp::Mul => "mulss",
        FpOp::Div => "divss",
    }
}

fn xmm_src(src: &XmmSrc, pool: &FloatPool) -> String {
    match src {
        XmmSrc::Xmm(x) => x.att_name().to_string(),
        XmmSrc::Mem(loc) => mem(loc),
        XmmSrc::Const(c) => pool.label(*c).to_string(),
    }
}

fn emit_inst(out: &mut String, inst: &Inst, pool: &FloatPool) {
    let _ = match inst {
        Inst::Label(l) => writeln!(out, "{l}:"),
        Inst::Jmp(l) => writeln!(out, "\tjmp {l}"),
        Inst::Jcc(cond, l) => writeln!(out, "\tj{} {l}", cond.suffix()),
        Inst::Call(f) => writeln!(out, "\tcall {f}"),
        Inst::Ret => writeln!(out, "\tret"),
        Inst::RetImm(n) => writeln!(out, "\tret ${n}"),

        Inst::Push(src) => writeln!(out, "\tpushl {}", op(src)),
        Inst::Pop(r) => writeln!(out, "\tpopl {}", r.att_name()),
        Inst::Mov(d, src) => writeln!(out, "\tmov{} {}, {}", suffix(d), op(src), dest(d)),
        Inst::Movzx(r, src) => writeln!(out, "\tmovzbl {}, {}", byte_src(src), r.att_name()),
        Inst::Movsx(r, src) => writeln!(out, "\tmovsbl {}, {}", byte_src(src), r.att_name()),
        Inst::Lea(r, loc) => writeln!(out, "\tleal {}, {}", mem(loc), r.att_name()),

        Inst::Add(d, src) => writeln!(out, "\tadd{} {}, {}", suffix(d), op(src), dest(d)),
        Inst::Sub(d, src) => writeln!(out, "\tsub{} {}, {}", suffix(d), op(src), dest(d)),
        Inst::Imul(r, src) => writeln!(out, "\timull {}, {}", op(src), r.att_name()),
        Inst::And(d, src) => writeln!(out, "\tand{} {}, {}", suffix(d), op(src), dest(d)),
        Inst::Or(d, src) => writeln!(out, "\tor{} {}, {}", suffix(d), op(src), dest(d)),
        Inst::Xor(d, src) => writeln!(out, "\txor{} {}, {}", suffix(d), op(src), dest(d)),
        Inst::Inc(d) => writeln!(out, "\tinc{} {}", suffix(d), dest(d)),
        Inst::Dec(d) => writeln!(out, "\tdec{} {}", suffix(d), dest(d)),
        Inst::Neg(d) => writeln!(out, "\tneg{} {}", suffix(d), dest(d)),
        Inst::Not(d) => writeln!(out, "\tnot{} {}", suffix(d), dest(d)),
        Inst::Shl(d, src) => writeln!(out, "\tshl{} {}, {}", suffix(d), op(src), dest(d)),
        Inst::Shr(d, src) => writeln!(out, "\tshr{} {}, {}", suffix(d), op(src), dest(d)),
        Inst::Sar(d, src) => writeln!(out, "\tsar{} {}, {}", suffix(d), op(src), dest(d)),
        // AT&T order: the subtrahend comes first.
        Inst::Cmp(lhs, rhs) => {
            let w = if op_is_byte(lhs) || op_is_byte(rhs) { "b" } else { "l" };
            writeln!(out, "\tcmp{w} {}, {}", op(rhs), op(lhs))
        }
        Inst::Test(lhs, rhs) => {
            let w = if op_is_byte(lhs) || op_is_byte(rhs) { "b" } else { "l" };
            writeln!(out, "\ttest{w} {}, {}", op(rhs), op(lhs))
        }
        Inst::Cdq => writeln!(out, "\tcltd"),
        Inst::Idiv(src) => writeln!(out, "\tidivl {}", op(src)),

        Inst::Fld(FpSrc::Mem(loc)) => writeln!(out, "\tflds {}", mem(loc)),
        Inst::Fld(FpSrc::Const(c)) => writeln!(out, "\tflds {}", pool.label(*c)),
        Inst::Fstp(loc) => writeln!(out, "\tfstps {}", mem(loc)),
        Inst::Fchs => writeln!(out, "\tfchs"),
        Inst::FArith { op: fop, reversed, pop } => {
            let mut m = fp_mnemonic(*fop).to_string();
            if *reversed {
                m.push('r');
            }
            if *pop {
                m.push('p');
                writeln!(out, "\t{m} %st, %st(1)")
            } else {
                writeln!(out, "\t{m} %st(1), %st")
            }
        }
        Inst::Fcomip => writeln!(out, "\tfcomip %st(1), %st"),

        Inst::Movss(x, src) => writeln!(out, "\tmovss {}, {}", xmm_src(src, pool), x.att_name()),
        Inst::MovssStore(loc, x) => writeln!(out, "\tmovss {}, {}", x.att_name(), mem(loc)),
        Inst::SseArith { op: fop, dst, src } => writeln!(
            out,
            "\t{} {}, {}",
            sse_mnemonic(*fop),
            xmm_src(src, pool),
            dst.att_name()
        ),
        Inst::Ucomiss(x, src) => {
            writeln!(out, "\tucomiss {}, {}", xmm_src(src, pool), x.att_name())
        }
    };
}
