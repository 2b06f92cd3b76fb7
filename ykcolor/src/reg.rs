//! x64 general purpose registers and the SysV register sets the colorizer needs to know about.

use std::fmt;
use strum::{Display, EnumCount, FromRepr, IntoEnumIterator};
use strum_macros::EnumIter;

/// A physical general purpose register. The discriminants are the hardware encodings.
#[derive(
    Clone, Copy, Debug, Display, EnumCount, EnumIter, Eq, FromRepr, Hash, Ord, PartialEq, PartialOrd,
)]
#[strum(serialize_all = "lowercase")]
// If the `repr` changes from `u8`, `RegSet` will also need updating.
#[repr(u8)]
pub enum Reg {
    RAX = 0,
    RCX,
    RDX,
    RBX,
    RSP,
    RBP,
    RSI,
    RDI,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

static_assertions::const_assert_eq!(Reg::COUNT, 16);

impl Reg {
    /// This register's hardware encoding.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// This register as an index into a `[_; Reg::COUNT]` array.
    pub(crate) fn idx(self) -> usize {
        usize::from(self.code())
    }

    /// The register whose hardware encoding is `code`, if there is one.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::from_repr(code)
    }

    /// Is this register unavailable for allocation? The stack and frame pointers are never handed
    /// out.
    pub fn is_reserved(self) -> bool {
        RESERVED.is_set(self)
    }

    /// Is this register clobbered by a call under the SysV ABI?
    pub fn is_caller_saved(self) -> bool {
        CALLER_SAVED.is_set(self)
    }

    /// Must a callee restore this register before returning?
    pub fn is_callee_saved(self) -> bool {
        CALLEE_SAVED.is_set(self)
    }

    /// Iterate over the registers that can be allocated, in hardware encoding order.
    pub fn allocatable() -> impl Iterator<Item = Reg> {
        Reg::iter().filter(|r| !r.is_reserved())
    }
}

/// A set of [Reg]s. Ordering of iteration is by hardware encoding.
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct RegSet(u16);

impl RegSet {
    /// Create a [RegSet] with no registers set.
    pub const fn blank() -> Self {
        Self(0)
    }

    pub const fn from_regs(regs: &[Reg]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < regs.len() {
            bits |= 1 << regs[i] as u16;
            i += 1;
        }
        Self(bits)
    }

    pub fn is_set(&self, reg: Reg) -> bool {
        self.0 & (1 << u16::from(reg.code())) != 0
    }

    pub fn set(&mut self, reg: Reg) {
        self.0 |= 1 << u16::from(reg.code());
    }

    pub fn unset(&mut self, reg: Reg) {
        self.0 &= !(1 << u16::from(reg.code()));
    }

    /// Return a copy of this set with `reg` also set.
    pub fn with(mut self, reg: Reg) -> Self {
        self.set(reg);
        self
    }

    pub fn union(self, other: RegSet) -> Self {
        Self(self.0 | other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(self) -> impl Iterator<Item = Reg> {
        Reg::iter().filter(move |r| self.is_set(*r))
    }
}

impl From<Reg> for RegSet {
    fn from(reg: Reg) -> Self {
        Self(1 << u16::from(reg.code()))
    }
}

impl fmt::Debug for RegSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Registers that the colorizer never allocates.
pub const RESERVED: RegSet = RegSet::from_regs(&[Reg::RSP, Reg::RBP]);

/// Registers clobbered by a call under the SysV ABI.
pub const CALLER_SAVED: RegSet = RegSet::from_regs(&[
    Reg::RAX,
    Reg::RCX,
    Reg::RDX,
    Reg::RSI,
    Reg::RDI,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
]);

/// Registers a SysV callee must preserve (excluding the reserved `rbp`).
pub const CALLEE_SAVED: RegSet =
    RegSet::from_regs(&[Reg::RBX, Reg::R12, Reg::R13, Reg::R14, Reg::R15]);

/// The SysV integer argument registers, in argument order.
pub const ARG_REGS: [Reg; 6] = [Reg::RDI, Reg::RSI, Reg::RDX, Reg::RCX, Reg::R8, Reg::R9];

/// The SysV integer return register.
pub const RETURN_REG: Reg = Reg::RAX;
