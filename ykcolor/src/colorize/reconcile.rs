//! Reconciling value locations when control leaves one or more scopes.
//!
//! Every path into a join point must agree on where each live value is. A scope's relocation
//! record says where each value it moved was when the scope was entered, so an exit moves every
//! recorded value that is live at the exit's destination back to its recorded location. Values
//! that were unplaced on entry, but which the scope defined and which are live afterwards, have no
//! recorded location: the first exit to need one publishes it and every later exit follows suit.

use super::{
    desc::{Desc, Loc},
    Colorizer,
};
use crate::{
    ir::{Inst, VRegIdx},
    log::Verbosity,
    reg::RegSet,
    CompilationError,
};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum ExitKind {
    /// Control runs off the end of the scope.
    Fallthrough,
    /// A [crate::ir::Cmd::Pop]. If `terminal`, the pop is immediately followed by a jump and
    /// nothing after it in the current scope is reachable.
    Break { terminal: bool },
    /// A loop's [crate::ir::Cmd::Repeat].
    BackEdge,
}

impl ExitKind {
    /// Is no code reachable after the exit's moves, other than at the exit's destination?
    fn is_terminal(self) -> bool {
        match self {
            ExitKind::Fallthrough => false,
            ExitKind::Break { terminal } => terminal,
            ExitKind::BackEdge => true,
        }
    }
}

impl Colorizer<'_> {
    /// Emit the moves needed to leave the innermost `k` scopes.
    pub(super) fn reconcile(&mut self, k: usize, kind: ExitKind) -> Result<(), CompilationError> {
        let outer = self.scopes.len() - k;
        let before = self.out.len();

        // The outermost popped scope that recorded a value knows where the destination expects
        // it. Each value maps to that location and the depth of the scope that recorded it.
        let mut recorded = BTreeMap::new();
        for (depth, s) in self.scopes.iter().enumerate().skip(outer).rev() {
            for (v, d) in &s.record {
                recorded.insert(*v, (d.loc, depth));
            }
        }
        let mut targets = BTreeMap::new();
        let mut unplaced = Vec::new();
        // Values unplaced on entry which this exit leaves placed, with their recorder's depth.
        let mut fresh = Vec::new();
        for (v, (loc, depth)) in &recorded {
            if !self.live_at_exit(*v, outer, kind) {
                continue;
            }
            match (loc, kind) {
                // Nothing at the loop head can have read a value that was not yet defined.
                (Loc::Unplaced, ExitKind::BackEdge) => (),
                (Loc::Unplaced, _) => {
                    fresh.push((*v, *depth));
                    match self.scopes[outer].exit_homes.get(v) {
                        Some(home) => {
                            targets.insert(*v, *home);
                        }
                        None => unplaced.push(*v),
                    }
                }
                _ => {
                    targets.insert(*v, *loc);
                }
            }
        }

        let mut claimed = RegSet::blank();
        let mut taken = BTreeSet::new();
        for (v, t) in &targets {
            if !taken.insert(*t) {
                return Err(CompilationError::InternalError(format!(
                    "two values (one of them %{v}) must be at {t} after leaving {k} scope(s)"
                )));
            }
            if let Loc::Reg(r) = t {
                claimed.set(*r);
            }
        }
        for v in unplaced {
            let home = match self.descs[v].loc {
                Loc::Reg(r) if !claimed.is_set(r) => Loc::Reg(r),
                _ => match self.pool.peek_avoiding(claimed) {
                    Some(r) => Loc::Reg(r),
                    None => self.save_loc(v)?,
                },
            };
            if let Loc::Reg(r) = home {
                claimed.set(r);
            }
            self.event(|| format!("published %{v} at {home}"));
            self.scopes[outer].exit_homes.insert(v, home);
            targets.insert(v, home);
        }

        // Values bound for memory go first, freeing their registers for everyone else.
        for (v, t) in &targets {
            if t.is_mem() {
                self.to_mem(*v, *t, claimed)?;
            }
        }
        // Target registers are distinct, so each walked value is marked by its target.
        let mut visited = RegSet::blank();
        for (v, t) in &targets {
            if let (Loc::Reg(_), Loc::Reg(_)) = (t, self.descs[*v].loc) {
                self.walk(*v, &targets, &mut Vec::new(), &mut visited, kind)?;
            }
        }
        for (v, t) in &targets {
            if let Loc::Reg(r) = *t {
                if self.descs[*v].loc != *t {
                    if let Some(w) = self.rmap[r.idx()] {
                        self.displace_at_exit(w, kind)?;
                    }
                    let cur = self.descs[*v].loc;
                    self.note_move(*v);
                    if cur.is_mem() {
                        self.emit_load(r, cur);
                        self.release_loaded_storage(*v, cur)?;
                    }
                    self.bind(*v, r)?;
                }
            }
        }

        // The destination, and every popped scope entered before the recorder, also saw these
        // values unplaced on entry: their own exits must now agree on where the values are.
        if outer > 0 {
            for (v, depth) in fresh {
                self.note_placed(v, outer - 1, depth);
            }
        }

        if kind == ExitKind::Fallthrough {
            for v in recorded.keys() {
                if !targets.contains_key(v) {
                    self.settle_dead(*v, outer)?;
                }
            }
        }
        self.event(|| {
            format!(
                "left {k} scope(s) ({kind:?}) with {} reconciling instruction(s)",
                self.out.len() - before
            )
        });
        Ok(())
    }

    /// Record `v` as unplaced on entry in each of `scopes[from..to]` that neither owns nor has
    /// already recorded it.
    fn note_placed(&mut self, v: VRegIdx, from: usize, to: usize) {
        let desc = Desc {
            loc: Loc::Unplaced,
            ..self.descs[v].clone()
        };
        for s in &mut self.scopes[from..to] {
            if desc.owner != Some(s.idx) && !s.record.contains_key(&v) {
                s.record.insert(v, desc.clone());
            }
        }
    }

    /// Is `v`'s value needed at the destination of an exit from `scopes[outer..]`?
    fn live_at_exit(&self, v: VRegIdx, outer: usize, kind: ExitKind) -> bool {
        self.live_outside(v, outer)
            || (kind == ExitKind::BackEdge
                && self.read_somewhere.contains(&v)
                && self.scopes[outer].refs.contains(&v))
    }

    /// Is the next use of `v` in `scopes[..upto]` a read?
    pub(super) fn live_outside(&self, v: VRegIdx, upto: usize) -> bool {
        self.scopes[..upto]
            .iter()
            .rev()
            .find_map(|s| s.uses.next_use(v))
            .is_some_and(|u| !u.is_write)
    }

    /// Move `v` to the memory location `t`.
    fn to_mem(&mut self, v: VRegIdx, t: Loc, claimed: RegSet) -> Result<(), CompilationError> {
        let cur = self.descs[v].loc;
        if cur == t {
            return Ok(());
        }
        self.note_move(v);
        match cur {
            Loc::Reg(r) => {
                self.emit_store(t, r);
                self.unbind(v)?;
            }
            Loc::Stack(_) | Loc::Static(_) => {
                match self.pool.peek_avoiding(claimed) {
                    Some(scratch) => {
                        self.emit_load(scratch, cur);
                        self.emit_store(t, scratch);
                    }
                    None => {
                        self.log.log(
                            Verbosity::Warning,
                            &format!("no scratch register to move %{v} from {cur} to {t}"),
                        );
                        self.emit(Inst::push(cur.mem_operand()));
                        self.emit(Inst::pop(t.mem_operand()));
                    }
                }
                self.release_loaded_storage(v, cur)?;
            }
            Loc::Unplaced => (),
        }
        self.descs[v].loc = t;
        Ok(())
    }

    /// Move `v`, currently in a register, to its target register, first moving whatever is in the
    /// way. `path` holds the values whose moves are waiting on this one: if one of them is in the
    /// way, the moves form a cycle, which is broken with an exchange.
    fn walk(
        &mut self,
        v: VRegIdx,
        targets: &BTreeMap<VRegIdx, Loc>,
        path: &mut Vec<VRegIdx>,
        visited: &mut RegSet,
        kind: ExitKind,
    ) -> Result<(), CompilationError> {
        let Some(Loc::Reg(t)) = targets.get(&v).copied() else {
            return Err(CompilationError::InternalError(format!(
                "%{v} has no target register"
            )));
        };
        visited.set(t);
        path.push(v);
        while self.descs[v].loc != Loc::Reg(t) {
            let Loc::Reg(cur) = self.descs[v].loc else {
                return Err(CompilationError::InternalError(format!(
                    "%{v} left its register while waiting for {t}"
                )));
            };
            match self.rmap[t.idx()] {
                None => {
                    self.note_move(v);
                    self.emit_mov(t, cur);
                    self.unbind(v)?;
                    self.bind(v, t)?;
                }
                Some(w) if path.contains(&w) => {
                    self.note_move(v);
                    self.note_move(w);
                    self.emit_xchg(t, cur);
                    self.rmap.swap(t.idx(), cur.idx());
                    self.descs[v].loc = Loc::Reg(t);
                    self.descs[w].loc = Loc::Reg(cur);
                }
                Some(w) => match targets.get(&w) {
                    Some(Loc::Reg(tw)) if visited.is_set(*tw) => {
                        return Err(CompilationError::InternalError(format!(
                            "%{w} is in {t} after being moved to its target"
                        )));
                    }
                    Some(Loc::Reg(_)) => self.walk(w, targets, path, visited, kind)?,
                    _ => self.displace_at_exit(w, kind)?,
                },
            }
        }
        path.pop();
        Ok(())
    }

    /// Free the register held by `w`, which has no place at the exit's destination but is in the
    /// way of a value which does.
    fn displace_at_exit(&mut self, w: VRegIdx, kind: ExitKind) -> Result<(), CompilationError> {
        if kind.is_terminal() {
            self.drop_value(w)
        } else {
            self.evict(w)
        }
    }

    /// `v` was moved by a scope being fallen out of and is dead afterwards: release the storage
    /// the scope gave it, unless an enclosing scope still expects `v` there.
    fn settle_dead(&mut self, v: VRegIdx, outer: usize) -> Result<(), CompilationError> {
        match self.descs[v].loc {
            Loc::Reg(_) => self.unbind(v),
            Loc::Stack(off) if self.spills.is_retained(off) && !self.slot_persists(v, off, outer) => {
                self.spills.release(off)?;
                self.descs[v].loc = Loc::Unplaced;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Leave a scope whose end is unreachable. Every way out of the scope has already reconciled
    /// its values, so no code is emitted: the colorizer's view is reset to what those exits
    /// established.
    pub(super) fn restore_view(&mut self) -> Result<(), CompilationError> {
        let depth = self.scopes.len() - 1;
        let scope = &self.scopes[depth];
        let idx = scope.idx;
        let record = scope
            .record
            .iter()
            .map(|(v, d)| {
                let loc = match d.loc {
                    Loc::Unplaced => scope.exit_homes.get(v).copied().unwrap_or(Loc::Unplaced),
                    loc => loc,
                };
                (*v, loc)
            })
            .collect::<Vec<_>>();
        let owned = scope
            .refs
            .iter()
            .filter(|v| self.descs[**v].owner == Some(idx))
            .copied()
            .collect::<Vec<_>>();

        for v in owned.iter().chain(record.iter().map(|(v, _)| v)) {
            self.unbind(*v)?;
        }
        for (v, snapshot) in &record {
            if let Loc::Stack(off) = self.descs[*v].loc {
                if *snapshot != Loc::Stack(off)
                    && self.spills.is_retained(off)
                    && !self.slot_persists(*v, off, depth)
                {
                    self.spills.release(off)?;
                }
            }
        }
        for (v, snapshot) in record {
            if snapshot.is_mem() || self.live_outside(v, depth) {
                match snapshot {
                    Loc::Reg(r) => self.bind(v, r)?,
                    loc => self.descs[v].loc = loc,
                }
            } else {
                self.descs[v].loc = Loc::Unplaced;
            }
        }
        Ok(())
    }
}
