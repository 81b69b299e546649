//! i686 machine value model.
//!
//! Pure data: registers, memory operand shapes, and the closed instruction
//! set the code generator emits. Every analysis in this back end (value
//! tracker, reference analyzer, rewriter, emitter) matches exhaustively on
//! [`Inst`], so adding a variant forces a decision in each of them.

/// General-purpose registers plus the two byte sub-registers the generator
/// uses (`al` for byte loads/stores and comparisons, `cl` for shift counts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Eax,
    Ebx,
    Ecx,
    Edx,
    Esi,
    Edi,
    Esp,
    Ebp,
    /// Low byte of `eax`.
    Al,
    /// Low byte of `ecx`.
    Cl,
}

impl Register {
    pub fn is_byte(self) -> bool {
        matches!(self, Register::Al | Register::Cl)
    }

    /// The 32-bit register containing this one. Identity for full registers.
    pub fn parent(self) -> Register {
        match self {
            Register::Al => Register::Eax,
            Register::Cl => Register::Ecx,
            r => r,
        }
    }

    /// Do the two registers share any bits? `al` overlaps `eax`, `cl`
    /// overlaps `ecx`, every register overlaps itself.
    pub fn overlaps(self, other: Register) -> bool {
        self.parent() == other.parent()
    }

    pub fn att_name(self) -> &'static str {
        match self {
            Register::Eax => "%eax",
            Register::Ebx => "%ebx",
            Register::Ecx => "%ecx",
            Register::Edx => "%edx",
            Register::Esi => "%esi",
            Register::Edi => "%edi",
            Register::Esp => "%esp",
            Register::Ebp => "%ebp",
            Register::Al => "%al",
            Register::Cl => "%cl",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XmmRegister {
    Xmm0,
    Xmm1,
}

impl XmmRegister {
    pub fn att_name(self) -> &'static str {
        match self {
            XmmRegister::Xmm0 => "%xmm0",
            XmmRegister::Xmm1 => "%xmm1",
        }
    }
}

/// A memory operand: base + byte displacement, in dword or byte width.
/// Equality is structural; two locations with different bases are simply
/// different keys even if they could alias at run time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// Dword at `[reg + disp]`.
    Reg(Register, i32),
    /// Byte at `[reg + disp]`.
    RegByte(Register, i32),
    /// Dword at `[symbol + disp]`.
    Sym(String, i32),
    /// Byte at `[symbol + disp]`.
    SymByte(String, i32),
}

impl MemoryLocation {
    pub fn base_reg(&self) -> Option<Register> {
        match self {
            MemoryLocation::Reg(r, _) | MemoryLocation::RegByte(r, _) => Some(*r),
            _ => None,
        }
    }

    pub fn offset(&self) -> i32 {
        match self {
            MemoryLocation::Reg(_, o)
            | MemoryLocation::RegByte(_, o)
            | MemoryLocation::Sym(_, o)
            | MemoryLocation::SymByte(_, o) => *o,
        }
    }

    pub fn is_byte(&self) -> bool {
        matches!(self, MemoryLocation::RegByte(..) | MemoryLocation::SymByte(..))
    }

    pub fn byte_size(&self) -> i32 {
        if self.is_byte() { 1 } else { 4 }
    }

    pub fn is_esp_based(&self) -> bool {
        self.base_reg() == Some(Register::Esp)
    }

    /// Same base (register or symbol), overlapping byte ranges.
    pub fn overlaps(&self, other: &MemoryLocation) -> bool {
        let same_base = match (self, other) {
            (MemoryLocation::Reg(a, _), MemoryLocation::Reg(b, _))
            | (MemoryLocation::Reg(a, _), MemoryLocation::RegByte(b, _))
            | (MemoryLocation::RegByte(a, _), MemoryLocation::Reg(b, _))
            | (MemoryLocation::RegByte(a, _), MemoryLocation::RegByte(b, _)) => a == b,
            (MemoryLocation::Sym(a, _), MemoryLocation::Sym(b, _))
            | (MemoryLocation::Sym(a, _), MemoryLocation::SymByte(b, _))
            | (MemoryLocation::SymByte(a, _), MemoryLocation::Sym(b, _))
            | (MemoryLocation::SymByte(a, _), MemoryLocation::SymByte(b, _)) => a == b,
            _ => false,
        };
        same_base
            && ranges_overlap(self.offset(), self.byte_size(), other.offset(), other.byte_size())
    }

    /// The same location with its displacement shifted by `delta`.
    pub fn with_offset_shifted(&self, delta: i32) -> MemoryLocation {
        match self {
            MemoryLocation::Reg(r, o) => MemoryLocation::Reg(*r, o.wrapping_add(delta)),
            MemoryLocation::RegByte(r, o) => MemoryLocation::RegByte(*r, o.wrapping_add(delta)),
            MemoryLocation::Sym(s, o) => MemoryLocation::Sym(s.clone(), o.wrapping_add(delta)),
            MemoryLocation::SymByte(s, o) => MemoryLocation::SymByte(s.clone(), o.wrapping_add(delta)),
        }
    }
}

/// Check if two byte ranges `[a, a+a_size)` and `[b, b+b_size)` overlap.
#[inline]
pub fn ranges_overlap(a_off: i32, a_size: i32, b_off: i32, b_size: i32) -> bool {
    a_off < b_off.saturating_add(b_size) && b_off < a_off.saturating_add(a_size)
}

/// Integer source operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Reg(Register),
    Imm(i32),
    Mem(MemoryLocation),
}

/// Integer destination operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dest {
    Reg(Register),
    Mem(MemoryLocation),
}

impl Dest {
    pub fn is_byte(&self) -> bool {
        match self {
            Dest::Reg(r) => r.is_byte(),
            Dest::Mem(loc) => loc.is_byte(),
        }
    }
}

/// Byte-width source for `movzx`/`movsx`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ByteSrc {
    Reg(Register),
    Mem(MemoryLocation),
}

/// Source for `fld`: a memory operand, or a literal-pool constant the
/// emitter materializes into `.rodata`.
#[derive(Debug, Clone, PartialEq)]
pub enum FpSrc {
    Mem(MemoryLocation),
    Const(f32),
}

/// Source for scalar SSE instructions.
#[derive(Debug, Clone, PartialEq)]
pub enum XmmSrc {
    Xmm(XmmRegister),
    Mem(MemoryLocation),
    Const(f32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Branch condition. `eval` mirrors the flags a `cmp lhs, rhs` would set:
/// signed for `L/Le/G/Ge`, unsigned for `B/Be/A/Ae`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    E,
    Ne,
    L,
    Le,
    G,
    Ge,
    B,
    Be,
    A,
    Ae,
}

impl Cond {
    pub fn eval(self, lhs: i32, rhs: i32) -> bool {
        match self {
            Cond::E => lhs == rhs,
            Cond::Ne => lhs != rhs,
            Cond::L => lhs < rhs,
            Cond::Le => lhs <= rhs,
            Cond::G => lhs > rhs,
            Cond::Ge => lhs >= rhs,
            Cond::B => (lhs as u32) < (rhs as u32),
            Cond::Be => (lhs as u32) <= (rhs as u32),
            Cond::A => (lhs as u32) > (rhs as u32),
            Cond::Ae => (lhs as u32) >= (rhs as u32),
        }
    }

    pub fn invert(self) -> Cond {
        match self {
            Cond::E => Cond::Ne,
            Cond::Ne => Cond::E,
            Cond::L => Cond::Ge,
            Cond::Ge => Cond::L,
            Cond::Le => Cond::G,
            Cond::G => Cond::Le,
            Cond::B => Cond::Ae,
            Cond::Ae => Cond::B,
            Cond::Be => Cond::A,
            Cond::A => Cond::Be,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Cond::E => "e",
            Cond::Ne => "ne",
            Cond::L => "l",
            Cond::Le => "le",
            Cond::G => "g",
            Cond::Ge => "ge",
            Cond::B => "b",
            Cond::Be => "be",
            Cond::A => "a",
            Cond::Ae => "ae",
        }
    }
}

/// One machine instruction. Byte width is carried by the operand shapes
/// (`Al`/`Cl`, `RegByte`/`SymByte`), not by separate variants.
#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    Label(String),
    Jmp(String),
    Jcc(Cond, String),
    Call(String),
    Ret,
    /// `ret imm` — callee-cleans return popping `imm` argument bytes.
    RetImm(u32),

    Push(Operand),
    Pop(Register),
    Mov(Dest, Operand),
    Movzx(Register, ByteSrc),
    Movsx(Register, ByteSrc),
    Lea(Register, MemoryLocation),

    Add(Dest, Operand),
    Sub(Dest, Operand),
    Imul(Register, Operand),
    And(Dest, Operand),
    Or(Dest, Operand),
    Xor(Dest, Operand),
    Inc(Dest),
    Dec(Dest),
    Neg(Dest),
    Not(Dest),
    Shl(Dest, Operand),
    Shr(Dest, Operand),
    Sar(Dest, Operand),
    /// Flags := `lhs - rhs`.
    Cmp(Operand, Operand),
    /// Flags := `lhs & rhs`.
    Test(Operand, Operand),
    /// Sign-extend `eax` into `edx:eax`.
    Cdq,
    /// Signed divide of `edx:eax`; quotient in `eax`, remainder in `edx`.
    Idiv(Operand),

    Fld(FpSrc),
    Fstp(MemoryLocation),
    Fchs,
    /// x87 arithmetic over `st0`/`st1`: `fadd`/`fsub`/`fmul`/`fdiv`, their
    /// reversed forms, and the popping forms.
    FArith { op: FpOp, reversed: bool, pop: bool },
    /// Compare `st0` with `st1`, set EFLAGS, pop one.
    Fcomip,

    Movss(XmmRegister, XmmSrc),
    MovssStore(MemoryLocation, XmmRegister),
    SseArith { op: FpOp, dst: XmmRegister, src: XmmSrc },
    Ucomiss(XmmRegister, XmmSrc),
}

/// Function-local labels carry a `.L` prefix; anything else names an
/// external symbol the optimizer must not reason about.
pub fn is_internal_label(name: &str) -> bool {
    name.starts_with(".L")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_register_overlap() {
        assert!(Register::Al.overlaps(Register::Eax));
        assert!(Register::Eax.overlaps(Register::Al));
        assert!(Register::Cl.overlaps(Register::Ecx));
        assert!(!Register::Al.overlaps(Register::Ebx));
        assert_eq!(Register::Al.parent(), Register::Eax);
        assert_eq!(Register::Esi.parent(), Register::Esi);
    }

    #[test]
    fn memory_overlap_is_base_and_range() {
        let a = MemoryLocation::Reg(Register::Esp, 0);
        let b = MemoryLocation::RegByte(Register::Esp, 3);
        let c = MemoryLocation::Reg(Register::Esp, 4);
        let d = MemoryLocation::Reg(Register::Ebp, 0);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(!a.overlaps(&d));
        let s = MemoryLocation::Sym("counter".into(), 0);
        let sb = MemoryLocation::SymByte("counter".into(), 2);
        assert!(s.overlaps(&sb));
    }

    #[test]
    fn cond_eval_signedness() {
        assert!(Cond::L.eval(-1, 0));
        assert!(Cond::A.eval(-1, 0)); // 0xffff_ffff > 0 unsigned
        assert!(Cond::Ge.eval(3, 3));
        assert_eq!(Cond::L.invert(), Cond::Ge);
        assert_eq!(Cond::A.invert(), Cond::Be);
    }
}
