//! Abstract machine state: everything currently known about registers, XMM
//! registers, the FPU value stack, and tracked memory locations.
//!
//! A fact that is absent is unknown; forgetting a fact is removal, never the
//! insertion of an "unknown" marker, so boundary resets are whole-map clears
//! and can't be accidentally partial. A fresh state is created per function
//! per pass and mutated instruction-by-instruction by the tracker.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::insn::{MemoryLocation, Register, XmmRegister};
use super::CallConv;

/// A statically known fact about what a register or location holds.
/// Unknown is represented by absence, not by a variant.
#[derive(Debug, Clone)]
pub enum AbstractValue {
    Int(i32),
    Float(f32),
    Byte(u8),
    /// Currently equal to whatever is stored at this location.
    AliasOf(MemoryLocation),
}

impl PartialEq for AbstractValue {
    fn eq(&self, other: &AbstractValue) -> bool {
        match (self, other) {
            (AbstractValue::Int(a), AbstractValue::Int(b)) => a == b,
            // Bit equality: folding must not conflate 0.0 and -0.0 or lose NaN payloads.
            (AbstractValue::Float(a), AbstractValue::Float(b)) => a.to_bits() == b.to_bits(),
            (AbstractValue::Byte(a), AbstractValue::Byte(b)) => a == b,
            (AbstractValue::AliasOf(a), AbstractValue::AliasOf(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for AbstractValue {}

/// Registers in a fixed preference order, used when several registers alias
/// the same location and one must be chosen deterministically.
const ALIAS_PREFERENCE: [Register; 6] = [
    Register::Eax,
    Register::Ebx,
    Register::Ecx,
    Register::Edx,
    Register::Esi,
    Register::Edi,
];

#[derive(Debug, Clone, Default)]
pub struct AbstractState {
    regs: FxHashMap<Register, AbstractValue>,
    xmm: FxHashMap<XmmRegister, AbstractValue>,
    mem: FxHashMap<MemoryLocation, AbstractValue>,
    /// x87 value stack; the last element is `st0` (most recent `fld`).
    /// `None` entries are values we pushed but know nothing about.
    fpu: SmallVec<[Option<AbstractValue>; 8]>,
    /// Set once a `lea` materializes the address of an `esp` slot. From
    /// then on the slots are not private temporaries: pointer stores and
    /// calls may hit them.
    esp_escaped: bool,
}

impl AbstractState {
    pub fn new() -> AbstractState {
        AbstractState::default()
    }

    /// Boundary reset: label, unconditional jump, return.
    pub fn clear_all(&mut self) {
        self.regs.clear();
        self.xmm.clear();
        self.mem.clear();
        self.fpu.clear();
    }

    /// Call boundary: only the caller-clobbered subset dies. Memory facts
    /// survive; the callee cannot address this frame's temporaries.
    pub fn clear_call_clobbered(&mut self, conv: &CallConv) {
        let clobbered: Vec<Register> = conv.clobbered.clone();
        for r in clobbered {
            self.forget_reg(r);
        }
        let clobbered_xmm: Vec<XmmRegister> = conv.clobbered_xmm.clone();
        for x in clobbered_xmm {
            self.forget_xmm(x);
        }
        self.fpu.clear();
        if self.esp_escaped {
            self.mem.retain(|k, _| !k.is_esp_based());
            self.purge_aliases(MemoryLocation::is_esp_based);
        }
    }

    // ── Registers ────────────────────────────────────────────────────────

    /// Current fact for `reg`. A byte register with no fact of its own
    /// inherits the low byte of a known parent integer.
    pub fn reg_value(&self, reg: Register) -> Option<AbstractValue> {
        if let Some(v) = self.regs.get(&reg) {
            return Some(v.clone());
        }
        if reg.is_byte() {
            if let Some(AbstractValue::Int(k)) = self.regs.get(&reg.parent()) {
                return Some(AbstractValue::Byte(*k as u8));
            }
        }
        None
    }

    /// The register was just written: drop every fact the write invalidates,
    /// then record the new value if one is known.
    pub fn set_reg(&mut self, reg: Register, val: Option<AbstractValue>) {
        self.forget_reg(reg);
        if let Some(v) = val {
            self.regs.insert(reg, v);
        }
    }

    /// Record a fact about a register that was *not* written (e.g. after
    /// `mov [loc], reg` the register is known to alias the slot). No
    /// invalidation happens.
    pub fn note_reg(&mut self, reg: Register, val: AbstractValue) {
        self.regs.insert(reg, val);
    }

    /// Forget everything that depends on `reg`: the fact for it and its
    /// byte/parent sibling, memory facts keyed on it as a base, and alias
    /// facts anchored to it.
    pub fn forget_reg(&mut self, reg: Register) {
        let parent = reg.parent();
        self.regs.retain(|k, _| k.parent() != parent);
        self.mem
            .retain(|k, _| k.base_reg().map(Register::parent) != Some(parent));
        self.purge_aliases(|loc| loc.base_reg().map(Register::parent) == Some(parent));
    }

    // ── XMM registers ────────────────────────────────────────────────────

    pub fn xmm_value(&self, xmm: XmmRegister) -> Option<AbstractValue> {
        self.xmm.get(&xmm).cloned()
    }

    pub fn set_xmm(&mut self, xmm: XmmRegister, val: Option<AbstractValue>) {
        match val {
            Some(v) => {
                self.xmm.insert(xmm, v);
            }
            None => self.forget_xmm(xmm),
        }
    }

    pub fn note_xmm(&mut self, xmm: XmmRegister, val: AbstractValue) {
        self.xmm.insert(xmm, val);
    }

    pub fn forget_xmm(&mut self, xmm: XmmRegister) {
        self.xmm.remove(&xmm);
    }

    // ── Memory ───────────────────────────────────────────────────────────

    pub fn mem_value(&self, loc: &MemoryLocation) -> Option<AbstractValue> {
        self.mem.get(loc).cloned()
    }

    /// A store happened. `esp`-based slots are compiler temporaries and are
    /// never address-taken, so a store through `esp` invalidates only
    /// overlapping `esp` facts; any other store may alias any addressable
    /// location and wipes every non-`esp` memory fact. Byte-width writes
    /// populate only the byte location itself (overlapping full-width facts
    /// are invalidated, never updated).
    pub fn write_mem(&mut self, loc: &MemoryLocation, val: Option<AbstractValue>) {
        if loc.is_esp_based() {
            self.mem.retain(|k, _| !(k.is_esp_based() && k.overlaps(loc)));
            self.purge_aliases(|a| a.is_esp_based() && a.overlaps(loc));
        } else if self.esp_escaped {
            // An escaped slot address may be behind any pointer.
            self.mem.clear();
            self.purge_aliases(|_| true);
        } else {
            self.mem.retain(|k, _| k.is_esp_based());
            self.purge_aliases(|a| !a.is_esp_based());
        }
        if let Some(v) = val {
            self.mem.insert(loc.clone(), v);
        }
    }

    /// A register currently known to hold the value stored at `loc`,
    /// chosen in a fixed preference order.
    pub fn register_aliasing(&self, loc: &MemoryLocation) -> Option<Register> {
        ALIAS_PREFERENCE.into_iter().find(|r| {
            matches!(self.regs.get(r), Some(AbstractValue::AliasOf(a)) if a == loc)
        })
    }

    // ── Stack ────────────────────────────────────────────────────────────

    /// `push`: every tracked `esp`-relative fact moves 4 bytes away from the
    /// top, then the new top slot gets `val`.
    pub fn push_slot(&mut self, val: Option<AbstractValue>) {
        self.shift_esp_slots(4);
        if let Some(v) = val {
            self.mem.insert(MemoryLocation::Reg(Register::Esp, 0), v);
        }
    }

    /// `pop`: the top slot's value (if known) is returned, then every
    /// `esp`-relative fact moves back toward the top; facts in the
    /// deallocated slot are dropped.
    pub fn pop_slot(&mut self) -> Option<AbstractValue> {
        let v = self.mem.remove(&MemoryLocation::Reg(Register::Esp, 0));
        self.shift_esp_slots(-4);
        v
    }

    /// A write to `esp` that is not a push/pop: the offsets of every
    /// `esp`-relative fact can no longer be trusted.
    pub fn invalidate_esp_tracking(&mut self) {
        self.forget_reg(Register::Esp);
    }

    /// The address of an `esp` slot was taken. Current slot facts die and
    /// the private-temporary assumption is off for the rest of the walk.
    pub fn note_esp_escape(&mut self) {
        self.esp_escaped = true;
        self.invalidate_esp_tracking();
    }

    fn shift_esp_slots(&mut self, delta: i32) {
        let old = std::mem::take(&mut self.mem);
        for (k, v) in old {
            if k.is_esp_based() {
                if k.offset() + delta < 0 {
                    continue; // slot deallocated
                }
                self.mem.insert(k.with_offset_shifted(delta), v);
            } else {
                self.mem.insert(k, v);
            }
        }
        // Alias facts anchored to esp slots move with them.
        self.remap_aliases(|loc| {
            if loc.is_esp_based() {
                if loc.offset() + delta < 0 {
                    None
                } else {
                    Some(loc.with_offset_shifted(delta))
                }
            } else {
                Some(loc.clone())
            }
        });
    }

    // ── FPU stack ────────────────────────────────────────────────────────

    pub fn fpu_push(&mut self, val: Option<AbstractValue>) {
        self.fpu.push(val);
    }

    /// Pop the tracked top of the FPU stack. An empty tracked stack means
    /// the real stack holds values we know nothing about.
    pub fn fpu_pop(&mut self) -> Option<AbstractValue> {
        self.fpu.pop().flatten()
    }

    pub fn fpu_top(&self) -> Option<&AbstractValue> {
        self.fpu.last().and_then(|v| v.as_ref())
    }

    pub fn fpu_set_top(&mut self, val: Option<AbstractValue>) {
        if let Some(t) = self.fpu.last_mut() {
            *t = val;
        }
    }

    /// Forget the top `n` tracked FPU values without popping them.
    pub fn fpu_forget_top(&mut self, n: usize) {
        let len = self.fpu.len();
        for slot in self.fpu.iter_mut().skip(len.saturating_sub(n)) {
            *slot = None;
        }
    }

    // ── Alias maintenance ────────────────────────────────────────────────

    /// Drop every fact whose value is an alias to a location matching `pred`.
    fn purge_aliases(&mut self, pred: impl Fn(&MemoryLocation) -> bool) {
        self.regs
            .retain(|_, v| !matches!(v, AbstractValue::AliasOf(loc) if pred(loc)));
        self.xmm
            .retain(|_, v| !matches!(v, AbstractValue::AliasOf(loc) if pred(loc)));
        self.mem
            .retain(|_, v| !matches!(v, AbstractValue::AliasOf(loc) if pred(loc)));
        for slot in self.fpu.iter_mut() {
            if matches!(slot, Some(AbstractValue::AliasOf(loc)) if pred(loc)) {
                *slot = None;
            }
        }
    }

    /// Rewrite or drop alias targets; `f` returning `None` drops the fact.
    fn remap_aliases(&mut self, f: impl Fn(&MemoryLocation) -> Option<MemoryLocation>) {
        let remap_one = |v: &mut AbstractValue| -> bool {
            if let AbstractValue::AliasOf(loc) = v {
                match f(loc) {
                    Some(new) => {
                        *loc = new;
                        true
                    }
                    None => false,
                }
            } else {
                true
            }
        };
        self.regs.retain(|_, v| remap_one(v));
        self.xmm.retain(|_, v| remap_one(v));
        self.mem.retain(|_, v| remap_one(v));
        for slot in self.fpu.iter_mut() {
            if let Some(v) = slot {
                if !remap_one(v) {
                    *slot = None;
                }
            }
        }
    }
}
