//! The free pools: physical registers and spill cells.

use crate::{
    reg::{Reg, RegSet, CALLEE_SAVED, CALLER_SAVED},
    CompilationError,
};
use std::collections::BTreeSet;

/// The size in bytes of one spill cell.
pub(crate) const SPILL_CELL: usize = 8;

/// The free physical registers, handed out in LIFO order.
#[derive(Debug)]
pub(crate) struct RegPool {
    free: Vec<Reg>,
}

/// The order caller-saved registers are seeded. The lower registers (e.g. RAX) are those most
/// likely to be needed by x64 instructions and calls, so they are pushed first (i.e. handed out
/// last).
const CALLER_SAVED_SEED: [Reg; 9] = [
    Reg::RAX,
    Reg::RDX,
    Reg::RCX,
    Reg::RDI,
    Reg::RSI,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
];

/// The order callee-saved registers are seeded. These go in before any caller-saved register, so
/// a callee-saved register is only handed out once no caller-saved register is free.
const CALLEE_SAVED_SEED: [Reg; 5] = [Reg::R15, Reg::R14, Reg::R13, Reg::R12, Reg::RBX];

impl RegPool {
    pub(crate) fn new() -> Self {
        let free = CALLEE_SAVED_SEED
            .iter()
            .chain(CALLER_SAVED_SEED.iter())
            .copied()
            .collect::<Vec<_>>();
        debug_assert!(free.iter().all(|r| !r.is_reserved()));
        debug_assert_eq!(
            RegSet::from_regs(&free),
            CALLER_SAVED.union(CALLEE_SAVED)
        );
        Self { free }
    }

    /// The most recently freed register that is not in `avoid`.
    pub(crate) fn peek_avoiding(&self, avoid: RegSet) -> Option<Reg> {
        self.free.iter().rev().find(|r| !avoid.is_set(**r)).copied()
    }

    /// Take `reg` out of the pool, returning `false` if it was not free.
    pub(crate) fn take_reg(&mut self, reg: Reg) -> bool {
        match self.free.iter().position(|r| *r == reg) {
            Some(i) => {
                self.free.remove(i);
                true
            }
            None => false,
        }
    }

    /// Return `reg` to the pool.
    pub(crate) fn give(&mut self, reg: Reg) -> Result<(), CompilationError> {
        if reg.is_reserved() || self.is_free(reg) {
            return Err(CompilationError::InternalError(format!(
                "{reg} returned to the register pool twice"
            )));
        }
        self.free.push(reg);
        Ok(())
    }

    pub(crate) fn is_free(&self, reg: Reg) -> bool {
        self.free.contains(&reg)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.free.len()
    }
}

/// The spill cells of a frame. The frame grows downwards from `rbp`: the first cell is at
/// `[rbp - 8]`, the second at `[rbp - 16]` and so on.
#[derive(Debug, Default)]
pub(crate) struct SpillPool {
    /// The number of bytes of cells the frame needs so far.
    size: usize,
    /// Cells that have been grown and later released, most recently released last.
    free: Vec<i32>,
    /// Cells currently holding a value.
    retained: BTreeSet<i32>,
}

impl SpillPool {
    /// Retain a cell, reusing a released one if possible, and return its `rbp` offset.
    pub(crate) fn retain(&mut self) -> Result<i32, CompilationError> {
        let off = match self.free.pop() {
            Some(off) => off,
            None => {
                self.size += SPILL_CELL;
                i32::try_from(self.size)
                    .map(|x| -x)
                    .map_err(|_| CompilationError::LimitExceeded("frame too large".into()))?
            }
        };
        self.retained.insert(off);
        Ok(off)
    }

    /// Release the cell at `off` back to the pool.
    pub(crate) fn release(&mut self, off: i32) -> Result<(), CompilationError> {
        if !self.retained.remove(&off) {
            return Err(CompilationError::InternalError(format!(
                "spill cell at {off} released without being retained"
            )));
        }
        self.free.push(off);
        Ok(())
    }

    /// Is `off` a cell of this pool currently holding a value?
    pub(crate) fn is_retained(&self, off: i32) -> bool {
        self.retained.contains(&off)
    }

    /// The number of bytes of cells the frame needs.
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Do the retained and free cells partition the cells grown so far?
    #[cfg(test)]
    pub(crate) fn is_conserved(&self) -> bool {
        let free = self.free.iter().copied().collect::<BTreeSet<_>>();
        free.len() == self.free.len()
            && free.is_disjoint(&self.retained)
            && free.len() + self.retained.len() == self.size / SPILL_CELL
            && free
                .union(&self.retained)
                .all(|off| *off < 0 && off.unsigned_abs() as usize <= self.size)
    }
}
