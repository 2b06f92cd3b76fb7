//! The per-scope usage index.

use crate::ir::VRegIdx;
use std::{
    cmp::Reverse,
    collections::{BTreeMap, BinaryHeap},
};

/// One future use of a virtual register. Ordering is by position first.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub(crate) struct Use {
    /// The index, within its scope's command list, of the command that makes the use.
    pub(crate) at: usize,
    /// Does the command write the register without reading it? If so, the value held before the
    /// command is dead.
    pub(crate) is_write: bool,
}

impl Use {
    pub(crate) fn new(at: usize, read: bool, write: bool) -> Self {
        Self {
            at,
            is_write: write && !read,
        }
    }

    #[cfg(test)]
    pub(crate) fn read(at: usize) -> Self {
        Self::new(at, true, false)
    }
}

/// For every virtual register a scope refers to, a min-heap of the uses not yet passed.
#[derive(Debug, Default)]
pub(crate) struct UsageIndex {
    heaps: BTreeMap<VRegIdx, BinaryHeap<Reverse<Use>>>,
}

impl UsageIndex {
    pub(crate) fn push(&mut self, v: VRegIdx, u: Use) {
        self.heaps.entry(v).or_default().push(Reverse(u));
    }

    /// The next use of `v` in this scope, if any.
    pub(crate) fn next_use(&self, v: VRegIdx) -> Option<Use> {
        self.heaps
            .get(&v)
            .and_then(|h| h.peek())
            .map(|Reverse(u)| *u)
    }

    /// Consume the use of `v` by the command at `at`.
    pub(crate) fn consume(&mut self, v: VRegIdx, at: usize) {
        if let Some(h) = self.heaps.get_mut(&v) {
            debug_assert_eq!(h.peek().map(|Reverse(u)| u.at), Some(at));
            while h.peek().is_some_and(|Reverse(u)| u.at == at) {
                h.pop();
            }
        }
    }

    /// Consume every use made by the command at `at`, returning the registers concerned.
    pub(crate) fn consume_all(&mut self, at: usize) -> Vec<VRegIdx> {
        let mut touched = Vec::new();
        for (v, h) in self.heaps.iter_mut() {
            let mut hit = false;
            while h.peek().is_some_and(|Reverse(u)| u.at == at) {
                h.pop();
                hit = true;
            }
            if hit {
                touched.push(*v);
            }
        }
        touched
    }

    /// Have all of `v`'s uses in this scope been passed?
    #[cfg(test)]
    pub(crate) fn is_exhausted(&self, v: VRegIdx) -> bool {
        self.next_use(v).is_none()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn min_heap() {
        let (a, b) = (VRegIdx::new(0).unwrap(), VRegIdx::new(1).unwrap());
        let mut ui = UsageIndex::default();
        ui.push(a, Use::read(4));
        ui.push(a, Use::new(1, false, true));
        ui.push(b, Use::read(1));
        ui.push(a, Use::new(2, true, true));
        assert_eq!(
            ui.next_use(a),
            Some(Use {
                at: 1,
                is_write: true
            })
        );
        assert_eq!(ui.consume_all(1), [a, b]);
        assert!(ui.is_exhausted(b));
        assert_eq!(
            ui.next_use(a),
            Some(Use {
                at: 2,
                is_write: false
            })
        );
        ui.consume(a, 2);
        assert_eq!(ui.next_use(a), Some(Use::read(4)));
        ui.consume(a, 4);
        assert!(ui.is_exhausted(a));
        assert!(ui.consume_all(5).is_empty());
    }

    #[cfg(debug_assertions)]
    #[should_panic]
    #[test]
    fn consume_out_of_order() {
        let a = VRegIdx::new(0).unwrap();
        let mut ui = UsageIndex::default();
        ui.push(a, Use::read(3));
        ui.push(a, Use::read(5));
        ui.consume(a, 5);
    }
}
