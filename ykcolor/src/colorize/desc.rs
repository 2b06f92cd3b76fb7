//! Where a virtual register's value currently lives.

use super::scope::ScopeIdx;
use crate::{
    ir::{Mem, Operand, RegRef, SymIdx, VRegDecl},
    reg::Reg,
};
use std::fmt;

/// The location of a value at the current program point.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub(crate) enum Loc {
    /// The value has not yet been defined, or is dead.
    Unplaced,
    Reg(Reg),
    /// In the frame, at this offset from `rbp`. Spill cells have negative offsets; incoming stack
    /// parameters have positive offsets.
    Stack(i32),
    /// In the memory of a static symbol.
    Static(SymIdx),
}

impl Loc {
    pub(crate) fn is_mem(&self) -> bool {
        matches!(self, Loc::Stack(_) | Loc::Static(_))
    }

    /// The memory operand for this location.
    ///
    /// # Panics
    ///
    /// If this location is not in memory.
    pub(crate) fn mem_operand(&self) -> Operand {
        match self {
            Loc::Stack(off) => Operand::Mem(Mem::base_disp(RegRef::Phys(Reg::RBP), *off)),
            Loc::Static(sym) => Operand::Sym(*sym),
            Loc::Unplaced | Loc::Reg(_) => unreachable!(),
        }
    }
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Loc::Unplaced => write!(f, "unplaced"),
            Loc::Reg(r) => write!(f, "{r}"),
            Loc::Stack(_) | Loc::Static(_) => write!(f, "{}", self.mem_operand()),
        }
    }
}

/// A register descriptor: everything the colorizer knows about one virtual register.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Desc {
    pub(crate) loc: Loc,
    /// The only physical register this value may occupy.
    pub(crate) pin: Option<Reg>,
    /// The static symbol this value is saved to.
    pub(crate) home: Option<SymIdx>,
    /// The scope that owns this value's storage; `None` until a scope referring to the value is
    /// entered.
    pub(crate) owner: Option<ScopeIdx>,
}

impl Desc {
    pub(crate) fn pinned(reg: Reg) -> Self {
        Self {
            loc: Loc::Unplaced,
            pin: Some(reg),
            home: None,
            owner: None,
        }
    }
}

impl From<&VRegDecl> for Desc {
    fn from(decl: &VRegDecl) -> Self {
        Self {
            loc: Loc::Unplaced,
            pin: decl.pin,
            home: decl.home,
            owner: None,
        }
    }
}
