//! The scope stack's entries.

use super::{
    desc::{Desc, Loc},
    usage::UsageIndex,
};
use crate::ir::{index_32bit, VRegIdx};
use std::collections::{BTreeMap, BTreeSet};

/// Identifies a scope for the lifetime of one procedure's coloring. Scopes are numbered in the
/// order they are entered.
#[derive(Debug, Copy, Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct ScopeIdx(u32);
index_32bit!(ScopeIdx);

pub(crate) struct Scope {
    pub(crate) idx: ScopeIdx,
    pub(crate) uses: UsageIndex,
    /// The relocation record: for each register this scope does not own but has moved, its
    /// descriptor as it was before the first move. Exits of the scope restore these locations.
    pub(crate) record: BTreeMap<VRegIdx, Desc>,
    /// Where exits of this scope leave values that were unplaced when the scope was entered. The
    /// first exit to need such a value decides; later exits follow it.
    pub(crate) exit_homes: BTreeMap<VRegIdx, Loc>,
    /// Every register the scope's command list (including nested scopes) refers to.
    pub(crate) refs: BTreeSet<VRegIdx>,
    /// Was the end of the scope's command list unreachable?
    pub(crate) dead_end: bool,
}

impl Scope {
    pub(crate) fn new(idx: ScopeIdx, uses: UsageIndex, refs: BTreeSet<VRegIdx>) -> Self {
        Self {
            idx,
            uses,
            record: BTreeMap::new(),
            exit_homes: BTreeMap::new(),
            refs,
            dead_end: false,
        }
    }

    /// Does this scope's relocation record say `v` lived in the spill cell at `off`?
    pub(crate) fn recorded_at(&self, v: VRegIdx, off: i32) -> bool {
        self.record
            .get(&v)
            .is_some_and(|d| d.loc == Loc::Stack(off))
    }
}
