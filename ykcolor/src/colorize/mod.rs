//! The colorizer: a single forward pass which assigns every virtual register a location at every
//! point of use.
//!
//! The procedure is walked top to bottom. Each nested command list is a scope: entering it pushes
//! a [Scope] holding a [usage::UsageIndex] of the uses its commands make, and leaving it pops the
//! scope again. When the colorizer needs a register and none is free, it uses the usage indices of
//! the whole scope stack to pick the value whose next use is least imminent and evicts it.
//!
//! A value "belongs" to ("is owned by") the innermost scope that contains all of its uses. A scope
//! can move values it does not own (e.g. a conditional arm may spill a value the function body
//! defined) but must then put them back where they were when control leaves the scope, so that
//! every path into a join point agrees on where each value lives. The first time a scope moves a
//! value it does not own, the value's [Desc] is recorded in the scope's relocation record; when
//! control leaves the scope, [reconcile] moves every recorded value that is still live back to its
//! recorded location.

mod desc;
mod pool;
mod reconcile;
mod scope;
#[cfg(test)]
mod test;
mod usage;

use self::{
    desc::{Desc, Loc},
    pool::{RegPool, SpillPool},
    reconcile::ExitKind,
    scope::{Scope, ScopeIdx},
    usage::{Use, UsageIndex},
};
use crate::{
    frame,
    ir::{Cmd, Inst, LabelIdx, Opcode, Operand, Proc, VRegIdx},
    log::{dump_ir, IRPhase, Log, Verbosity},
    reg::{Reg, RegSet},
    Colored, CompilationError,
};
use std::collections::{BTreeMap, BTreeSet};
use strum::EnumCount;
use typed_index_collections::TiVec;

pub(crate) struct Colorizer<'a> {
    proc: &'a Proc,
    log: &'a Log,
    /// One descriptor per virtual register of [Self::proc], followed by the hidden registers.
    descs: TiVec<VRegIdx, Desc>,
    /// Which virtual register each physical register currently holds.
    rmap: [Option<VRegIdx>; Reg::COUNT],
    pool: RegPool,
    spills: SpillPool,
    scopes: Vec<Scope>,
    /// How many scopes have been entered so far.
    entered: usize,
    /// For each allocatable physical register, the hidden register standing for "the value a
    /// [Cmd::Preserve] boundary sees in this register".
    hidden: [Option<VRegIdx>; Reg::COUNT],
    /// How many commands refer to each register in the whole procedure.
    totals: BTreeMap<VRegIdx, usize>,
    /// Registers whose value is read by at least one command. A value that is never read never
    /// needs to be saved.
    read_somewhere: BTreeSet<VRegIdx>,
    /// Is an incoming stack parameter addressed through `rbp`?
    uses_fp: bool,
    out: Vec<Cmd>,
}

impl<'a> Colorizer<'a> {
    pub(crate) fn new(proc: &'a Proc, log: &'a Log) -> Result<Self, CompilationError> {
        let mut descs = proc.vregs.iter().map(Desc::from).collect::<TiVec<VRegIdx, _>>();
        for (v, d) in descs.iter_enumerated() {
            if let Some(r) = d.pin.filter(|r| r.is_reserved()) {
                return Err(CompilationError::InternalError(format!(
                    "%{v} is pinned to reserved register {r}"
                )));
            }
        }
        let mut hidden = [None; Reg::COUNT];
        for reg in Reg::allocatable() {
            // Check the index fits before `push_and_get_key` converts it.
            VRegIdx::new(descs.len())?;
            hidden[reg.idx()] = Some(descs.push_and_get_key(Desc::pinned(reg)));
        }
        let mut c = Self {
            proc,
            log,
            descs,
            rmap: [None; Reg::COUNT],
            pool: RegPool::new(),
            spills: SpillPool::default(),
            scopes: Vec::new(),
            entered: 0,
            hidden,
            totals: BTreeMap::new(),
            read_somewhere: BTreeSet::new(),
            uses_fp: false,
            out: Vec::new(),
        };
        c.check(&proc.body)?;
        let mut totals = BTreeMap::new();
        c.count_refs(&proc.body, &mut totals);
        c.totals = totals;
        c.read_somewhere = c.find_reads(&proc.body);
        Ok(c)
    }

    /// Color the whole procedure and finalize its frame.
    pub(crate) fn run(mut self) -> Result<Colored, CompilationError> {
        let proc = self.proc;
        self.enter(&proc.body)?;
        self.process(&proc.body)?;
        self.exit()?;
        dump_ir(IRPhase::ColorizeOut, &proc.name, || {
            self.out.iter().map(|c| format!("{c}\n")).collect()
        });
        frame::finalize(&proc.name, self.out, self.spills.size(), self.uses_fp)
    }

    /// Check the preconditions the lowering stage must guarantee.
    fn check(&self, cmds: &[Cmd]) -> Result<(), CompilationError> {
        let internal = |msg: String| Err(CompilationError::InternalError(msg));
        for cmd in cmds {
            let user_vregs: Vec<VRegIdx> = match cmd {
                Cmd::Scope(sub) => {
                    self.check(sub)?;
                    continue;
                }
                Cmd::Inst(inst) => {
                    if let Some(r) = inst.phys_regs().iter().find(|r| !r.is_reserved()) {
                        return internal(format!("`{inst}` names allocatable register {r}"));
                    }
                    inst.vreg_operands().into_iter().map(|(v, _, _)| v).collect()
                }
                Cmd::Preserve { regs, .. } => {
                    if let Some(r) = regs.iter().find(|r| r.is_reserved()) {
                        return internal(format!("cannot preserve reserved register {r}"));
                    }
                    Vec::new()
                }
                Cmd::LocateAtReg(v, r) => {
                    if r.is_reserved() {
                        return internal(format!("cannot locate %{v} at reserved register {r}"));
                    }
                    vec![*v]
                }
                Cmd::LocateAtStack(v, off) => {
                    if *off <= 0 {
                        return internal(format!(
                            "incoming stack parameter %{v} must be above rbp, not at {off}"
                        ));
                    }
                    vec![*v]
                }
                _ => Vec::new(),
            };
            if let Some(v) = user_vregs
                .iter()
                .find(|v| usize::from(**v) >= self.proc.vregs.len())
            {
                return internal(format!("%{v} is not in the register table"));
            }
        }
        Ok(())
    }

    /// The registers the command `cmd` (but not any nested scope) refers to, each with whether it
    /// is read and whether it is written.
    fn cmd_operands(&self, cmd: &Cmd) -> Vec<(VRegIdx, bool, bool)> {
        match cmd {
            Cmd::Inst(inst) => inst.vreg_operands(),
            Cmd::Preserve { regs, read, write } if *read || *write => regs
                .iter()
                .filter_map(|r| self.hidden[r.idx()])
                .map(|h| (h, *read, *write))
                .collect(),
            Cmd::LocateAtReg(v, _) | Cmd::LocateAtStack(v, _) => vec![(*v, false, true)],
            _ => Vec::new(),
        }
    }

    /// Count, per register, the commands in `cmds` (recursively) which refer to it.
    fn count_refs(&self, cmds: &[Cmd], counts: &mut BTreeMap<VRegIdx, usize>) {
        for cmd in cmds {
            match cmd {
                Cmd::Scope(sub) => self.count_refs(sub, counts),
                _ => {
                    for (v, _, _) in self.cmd_operands(cmd) {
                        *counts.entry(v).or_insert(0) += 1;
                    }
                }
            }
        }
    }

    fn find_reads(&self, cmds: &[Cmd]) -> BTreeSet<VRegIdx> {
        let mut reads = BTreeSet::new();
        for cmd in cmds {
            match cmd {
                Cmd::Scope(sub) => reads.extend(self.find_reads(sub)),
                _ => reads.extend(
                    self.cmd_operands(cmd)
                        .into_iter()
                        .filter(|(_, read, _)| *read)
                        .map(|(v, _, _)| v),
                ),
            }
        }
        reads
    }

    /// A use of `v` that does not come from one of `v`'s operands (e.g. a nested scope or a loop
    /// back-edge) and which keeps `v`'s value alive, unless nothing ever reads that value.
    fn synthetic_use(&self, v: VRegIdx, at: usize) -> Use {
        Use {
            at,
            is_write: !self.read_somewhere.contains(&v),
        }
    }

    fn cur(&self) -> &Scope {
        // A command is only ever processed inside a scope.
        &self.scopes[self.scopes.len() - 1]
    }

    fn cur_mut(&mut self) -> &mut Scope {
        let i = self.scopes.len() - 1;
        &mut self.scopes[i]
    }

    fn event(&self, msg: impl FnOnce() -> String) {
        if self.log.enabled(Verbosity::ColorizeEvent) {
            self.log.log(Verbosity::ColorizeEvent, &msg());
        }
    }

    /// Push a new scope for `cmds`, taking ownership of every register all of whose uses are
    /// inside it.
    fn enter(&mut self, cmds: &[Cmd]) -> Result<(), CompilationError> {
        let idx = ScopeIdx::new(self.entered)?;
        self.entered += 1;
        let mut counts = BTreeMap::new();
        self.count_refs(cmds, &mut counts);
        for (v, n) in &counts {
            if self.totals.get(v) == Some(n) {
                debug_assert_eq!(self.descs[*v].loc, Loc::Unplaced);
                self.descs[*v].owner = Some(idx);
            }
        }

        // An exit through more than this scope skips this scope's later uses, so it counts as a
        // use of every value owned further out.
        let mut outer_owned = None;
        let mut uses = UsageIndex::default();
        for (i, cmd) in cmds.iter().enumerate() {
            match cmd {
                Cmd::Scope(sub) => {
                    let mut inner = BTreeMap::new();
                    self.count_refs(sub, &mut inner);
                    for v in inner.keys() {
                        uses.push(*v, self.synthetic_use(*v, i));
                    }
                    if escapes(sub, 1) {
                        let outer = outer_owned.get_or_insert_with(|| self.outer_owned());
                        for v in outer.iter() {
                            uses.push(*v, self.synthetic_use(*v, i));
                        }
                    }
                }
                Cmd::Pop(_) => {
                    let outer = outer_owned.get_or_insert_with(|| self.outer_owned());
                    for v in outer.iter() {
                        uses.push(*v, self.synthetic_use(*v, i));
                    }
                }
                Cmd::Repeat(_) => {
                    for v in counts.keys() {
                        if self.descs[*v].owner != Some(idx) {
                            uses.push(*v, self.synthetic_use(*v, i));
                        }
                    }
                }
                _ => {
                    for (v, read, write) in self.cmd_operands(cmd) {
                        uses.push(v, Use::new(i, read, write));
                    }
                }
            }
        }
        self.scopes
            .push(Scope::new(idx, uses, counts.into_keys().collect()));
        Ok(())
    }

    /// The registers owned by a scope currently on the stack.
    fn outer_owned(&self) -> Vec<VRegIdx> {
        let owners = self.scopes.iter().map(|s| s.idx).collect::<BTreeSet<_>>();
        self.descs
            .iter_enumerated()
            .filter(|(_, d)| d.owner.is_some_and(|o| owners.contains(&o)))
            .map(|(v, _)| v)
            .collect()
    }

    /// Leave the innermost scope, reconciling the locations of the values it relocated.
    fn exit(&mut self) -> Result<(), CompilationError> {
        if self.cur().dead_end {
            self.restore_view()?;
        } else {
            self.reconcile(1, ExitKind::Fallthrough)?;
        }
        let scope = self.scopes.pop().ok_or_else(|| {
            CompilationError::InternalError("left a scope that was never entered".into())
        })?;
        // Anything the scope owns and that is still placed died in an unreachable tail.
        for v in &scope.refs {
            if self.descs[*v].owner == Some(scope.idx) {
                match self.descs[*v].loc {
                    Loc::Reg(_) => self.unbind(*v)?,
                    Loc::Stack(off) if self.spills.is_retained(off) => {
                        self.spills.release(off)?;
                        self.descs[*v].loc = Loc::Unplaced;
                    }
                    _ => (),
                }
            }
        }
        Ok(())
    }

    fn process(&mut self, cmds: &[Cmd]) -> Result<(), CompilationError> {
        for i in 0..cmds.len() {
            if !self.command(i, cmds)? {
                break;
            }
        }
        Ok(())
    }

    /// Process `cmds[i]` in the innermost scope. Returns `false` if the rest of `cmds` is
    /// unreachable.
    fn command(&mut self, i: usize, cmds: &[Cmd]) -> Result<bool, CompilationError> {
        match &cmds[i] {
            Cmd::Inst(inst) => self.inst(i, inst)?,
            Cmd::Scope(sub) => {
                let touched = self.cur_mut().uses.consume_all(i);
                self.enter(sub)?;
                self.process(sub)?;
                self.exit()?;
                for v in touched {
                    self.release_if_dead(v)?;
                }
            }
            Cmd::Repeat(head) => {
                if i + 1 != cmds.len() {
                    return Err(CompilationError::InternalError(
                        "repeat must be the last command in its scope".into(),
                    ));
                }
                self.repeat(i, *head)?;
            }
            Cmd::Pop(k) => self.pop_scopes(i, *k, &cmds[i + 1..])?,
            Cmd::Preserve { regs, read, write } => self.preserve(i, *regs, *read, *write)?,
            Cmd::LocateAtReg(v, reg) => self.locate_at_reg(i, *v, *reg)?,
            Cmd::LocateAtStack(v, off) => self.locate_at_stack(i, *v, *off)?,
            cmd @ (Cmd::FrameCreate
            | Cmd::FrameDestroy
            | Cmd::AlignBefore(_)
            | Cmd::AlignAfter(_)) => self.out.push(cmd.clone()),
            Cmd::DeadEnd => {
                self.cur_mut().dead_end = true;
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn inst(&mut self, i: usize, inst: &Inst) -> Result<(), CompilationError> {
        let ops = inst.vreg_operands();
        // Registers already holding an operand must not be reused for another operand, and
        // pinned operands' registers are spoken for.
        let mut avoid = RegSet::blank();
        let mut pins = RegSet::blank();
        for (v, _, _) in &ops {
            let d = &self.descs[*v];
            if let Some(p) = d.pin {
                if pins.is_set(p) {
                    return Err(CompilationError::InternalError(format!(
                        "two operands of `{inst}` are pinned to {p}"
                    )));
                }
                pins.set(p);
            }
            if let Loc::Reg(r) = d.loc {
                avoid.set(r);
            }
        }
        avoid = avoid.union(pins);

        // Pinned operands have no choice of register, so they are placed first.
        let (pinned, unpinned): (Vec<_>, Vec<_>) = ops
            .iter()
            .copied()
            .partition(|(v, _, _)| self.descs[*v].pin.is_some());
        let mut asgn = Vec::with_capacity(ops.len());
        for (v, read, write) in pinned.into_iter().chain(unpinned) {
            let r = self.ensure_loaded(v, write && !read, &mut avoid)?;
            avoid.set(r);
            asgn.push((v, r));
        }
        let colored = inst.color(|v| asgn.iter().find(|(x, _)| *x == v).map(|(_, r)| *r))?;
        self.out.push(Cmd::Inst(colored));

        for (v, _, _) in &ops {
            self.cur_mut().uses.consume(*v, i);
        }
        for (v, _, _) in &ops {
            self.release_if_dead(*v)?;
        }
        #[cfg(test)]
        assert!(self.is_consistent(), "inconsistent after `{inst}`");
        Ok(())
    }

    fn preserve(
        &mut self,
        i: usize,
        regs: RegSet,
        read: bool,
        write: bool,
    ) -> Result<(), CompilationError> {
        if !read && !write {
            return Ok(());
        }
        let mut avoid = regs;
        let mut touched = Vec::new();
        for reg in regs.iter() {
            let h = self.hidden[reg.idx()].ok_or_else(|| {
                CompilationError::InternalError(format!("no hidden register for {reg}"))
            })?;
            touched.push(h);
            if !read {
                // A value pinned to this very register (e.g. a call argument) is already where
                // the boundary wants it.
                if let Some(w) = self.rmap[reg.idx()] {
                    if w != h && self.descs[w].pin == Some(reg) {
                        continue;
                    }
                }
            }
            self.ensure_loaded(h, write && !read, &mut avoid)?;
        }
        for h in &touched {
            self.cur_mut().uses.consume(*h, i);
        }
        for h in touched {
            self.release_if_dead(h)?;
        }
        Ok(())
    }

    fn locate_at_reg(&mut self, i: usize, v: VRegIdx, reg: Reg) -> Result<(), CompilationError> {
        if let Some(p) = self.descs[v].pin.filter(|p| *p != reg) {
            return Err(CompilationError::InternalError(format!(
                "%{v} is pinned to {p} but located at {reg}"
            )));
        }
        match self.rmap[reg.idx()] {
            Some(w) if w != v => {
                return Err(CompilationError::InternalError(format!(
                    "cannot locate %{v} at {reg}: it is already bound to %{w}"
                )))
            }
            Some(_) => (),
            None => {
                self.note_move(v);
                self.unbind(v)?;
                self.bind(v, reg)?;
            }
        }
        self.cur_mut().uses.consume(v, i);
        self.release_if_dead(v)
    }

    fn locate_at_stack(&mut self, i: usize, v: VRegIdx, off: i32) -> Result<(), CompilationError> {
        self.note_move(v);
        self.unbind(v)?;
        self.descs[v].loc = Loc::Stack(off);
        self.uses_fp = true;
        self.cur_mut().uses.consume(v, i);
        self.release_if_dead(v)
    }

    fn pop_scopes(&mut self, i: usize, k: usize, rest: &[Cmd]) -> Result<(), CompilationError> {
        // The outermost (function) scope cannot be popped.
        if k == 0 || k >= self.scopes.len() {
            return Err(CompilationError::InternalError(format!(
                "cannot pop {k} scope(s) from a stack of {}",
                self.scopes.len()
            )));
        }
        self.cur_mut().uses.consume_all(i);
        let terminal = matches!(
            rest,
            [Cmd::Inst(inst), Cmd::DeadEnd, ..] if inst.opcode == Opcode::Jmp
        );
        self.reconcile(k, ExitKind::Break { terminal })
    }

    fn repeat(&mut self, i: usize, head: LabelIdx) -> Result<(), CompilationError> {
        self.cur_mut().uses.consume_all(i);
        self.reconcile(1, ExitKind::BackEdge)?;
        self.out.push(Cmd::Inst(Inst::jmp(head)));
        self.cur_mut().dead_end = true;
        Ok(())
    }

    /// Make sure `v` is in a register, loading it (unless `for_write`) if it is in memory.
    /// Registers in `avoid` are not used; any register claimed for `v` is added to `avoid`.
    fn ensure_loaded(
        &mut self,
        v: VRegIdx,
        for_write: bool,
        avoid: &mut RegSet,
    ) -> Result<Reg, CompilationError> {
        let cur = self.descs[v].loc;
        if let Loc::Reg(r) = cur {
            match self.descs[v].pin {
                Some(p) if p != r => (),
                _ => return Ok(r),
            }
        }
        let r = self.obtain_reg(v, avoid)?;
        self.note_move(v);
        match cur {
            Loc::Unplaced => (),
            Loc::Reg(old) => {
                self.emit_mov(r, old);
                self.unbind(v)?;
            }
            Loc::Stack(_) | Loc::Static(_) => {
                if !for_write {
                    self.emit_load(r, cur);
                }
                self.release_loaded_storage(v, cur)?;
            }
        }
        self.bind(v, r)?;
        avoid.set(r);
        Ok(r)
    }

    /// Find a register for `v`, which is not currently in a suitable register. The register
    /// returned is free when this function returns.
    fn obtain_reg(&mut self, v: VRegIdx, avoid: &mut RegSet) -> Result<Reg, CompilationError> {
        if let Some(pin) = self.descs[v].pin {
            if let Some(w) = self.rmap[pin.idx()] {
                if w != v {
                    self.displace(w, avoid)?;
                }
            }
            return Ok(pin);
        }
        match self.pool.peek_avoiding(*avoid) {
            Some(r) => Ok(r),
            None => self.choose_victim(*avoid),
        }
    }

    /// Move `w` out of the register it occupies, which the caller is about to claim. If `w`'s value
    /// is still needed and another register is free, `w` is moved there; otherwise it is evicted.
    fn displace(&mut self, w: VRegIdx, avoid: &mut RegSet) -> Result<(), CompilationError> {
        let Loc::Reg(old) = self.descs[w].loc else {
            return Err(CompilationError::InternalError(format!(
                "%{w} displaced but not in a register"
            )));
        };
        if self.descs[w].pin.is_none() && !self.value_dead(w) {
            if let Some(r) = self.pool.peek_avoiding(avoid.with(old)) {
                self.note_move(w);
                self.emit_mov(r, old);
                self.unbind(w)?;
                self.bind(w, r)?;
                avoid.set(r);
                return Ok(());
            }
        }
        self.evict(w)
    }

    /// Free a register not in `avoid` by evicting its occupant, returning the freed register.
    fn choose_victim(&mut self, avoid: RegSet) -> Result<Reg, CompilationError> {
        let mut unneeded = None;
        let mut farthest: Option<(Reg, VRegIdx, usize, usize)> = None;
        for reg in Reg::allocatable() {
            if avoid.is_set(reg) {
                continue;
            }
            let Some(v) = self.rmap[reg.idx()] else {
                continue;
            };
            match self.next_use(v) {
                None => {
                    unneeded = Some((reg, v));
                    break;
                }
                Some((u, _)) if u.is_write => {
                    if unneeded.is_none() {
                        unneeded = Some((reg, v));
                    }
                }
                Some((u, depth)) => {
                    let further = match farthest {
                        None => true,
                        Some((_, _, at, d)) => u.at > at || (u.at == at && depth < d),
                    };
                    if further {
                        farthest = Some((reg, v, u.at, depth));
                    }
                }
            }
        }
        if let Some((reg, v)) = unneeded {
            self.drop_value(v)?;
            return Ok(reg);
        }
        match farthest {
            Some((reg, v, _, _)) => {
                self.save(v)?;
                Ok(reg)
            }
            None => Err(CompilationError::InternalError(
                "no registers left to evict".into(),
            )),
        }
    }

    /// `v`'s next use anywhere on the scope stack (innermost first), and the depth of the scope
    /// it was found in.
    fn next_use(&self, v: VRegIdx) -> Option<(Use, usize)> {
        self.scopes
            .iter()
            .enumerate()
            .rev()
            .find_map(|(d, s)| s.uses.next_use(v).map(|u| (u, d)))
    }

    /// Is `v`'s current value never read again?
    fn value_dead(&self, v: VRegIdx) -> bool {
        self.next_use(v).map_or(true, |(u, _)| u.is_write)
    }

    /// Free `v`'s register, saving its value if it is still needed.
    fn evict(&mut self, v: VRegIdx) -> Result<(), CompilationError> {
        if self.value_dead(v) {
            self.drop_value(v)
        } else {
            self.save(v)
        }
    }

    /// Free `v`'s register without saving its value.
    fn drop_value(&mut self, v: VRegIdx) -> Result<(), CompilationError> {
        self.note_move(v);
        self.unbind(v)
    }

    /// Store `v`'s register to memory and free the register.
    fn save(&mut self, v: VRegIdx) -> Result<(), CompilationError> {
        let Loc::Reg(r) = self.descs[v].loc else {
            return Err(CompilationError::InternalError(format!(
                "%{v} saved but not in a register"
            )));
        };
        let dst = self.save_loc(v)?;
        self.note_move(v);
        self.emit_store(dst, r);
        self.unbind(v)?;
        self.descs[v].loc = dst;
        self.event(|| format!("spill %{v}: {r} -> {dst}"));
        Ok(())
    }

    /// Where should `v` be saved? Its static home if it has one; else the cell an enclosing scope
    /// expects it in; else a fresh cell.
    fn save_loc(&mut self, v: VRegIdx) -> Result<Loc, CompilationError> {
        if let Some(sym) = self.descs[v].home {
            return Ok(Loc::Static(sym));
        }
        for s in self.scopes.iter().rev() {
            if let Some(Desc {
                loc: loc @ Loc::Stack(_),
                ..
            }) = s.record.get(&v)
            {
                return Ok(*loc);
            }
        }
        Ok(Loc::Stack(self.spills.retain()?))
    }

    /// Does the current scope own `v`?
    fn owns(&self, v: VRegIdx) -> bool {
        self.descs[v].owner == Some(self.cur().idx)
    }

    /// Is the cell at `off` `v`'s location according to the relocation record of one of the
    /// outermost `upto` scopes?
    fn slot_persists(&self, v: VRegIdx, off: i32, upto: usize) -> bool {
        self.scopes[..upto].iter().any(|s| s.recorded_at(v, off))
    }

    /// `v` has just been loaded from `loc`: release `loc` if nothing will need it again.
    fn release_loaded_storage(&mut self, v: VRegIdx, loc: Loc) -> Result<(), CompilationError> {
        if let Loc::Stack(off) = loc {
            if self.spills.is_retained(off)
                && (self.owns(v) || !self.slot_persists(v, off, self.scopes.len()))
            {
                self.spills.release(off)?;
            }
        }
        Ok(())
    }

    /// If `v`'s value is dead, free its register (any scope may do this) or its spill cell (only
    /// the owner may do this).
    fn release_if_dead(&mut self, v: VRegIdx) -> Result<(), CompilationError> {
        if !self.value_dead(v) {
            return Ok(());
        }
        match self.descs[v].loc {
            Loc::Reg(_) => self.drop_value(v),
            Loc::Stack(off) if self.owns(v) && self.spills.is_retained(off) => {
                self.spills.release(off)?;
                self.descs[v].loc = Loc::Unplaced;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// If the current scope does not own `v` and has not yet recorded it, record `v`'s current
    /// descriptor. Must be called before any change to `v`'s location.
    fn note_move(&mut self, v: VRegIdx) {
        let desc = &self.descs[v];
        if let Some(scope) = self.scopes.last_mut() {
            if desc.owner != Some(scope.idx) && !scope.record.contains_key(&v) {
                scope.record.insert(v, desc.clone());
            }
        }
    }

    /// Put `v` in the free register `r`.
    fn bind(&mut self, v: VRegIdx, r: Reg) -> Result<(), CompilationError> {
        if !self.pool.take_reg(r) {
            let holder = self.rmap[r.idx()].map_or("nothing".to_owned(), |w| format!("%{w}"));
            return Err(CompilationError::InternalError(format!(
                "cannot bind %{v} to {r}: it is held by {holder}"
            )));
        }
        self.rmap[r.idx()] = Some(v);
        self.descs[v].loc = Loc::Reg(r);
        Ok(())
    }

    /// If `v` is in a register, free the register and mark `v` as unplaced.
    fn unbind(&mut self, v: VRegIdx) -> Result<(), CompilationError> {
        if let Loc::Reg(r) = self.descs[v].loc {
            self.rmap[r.idx()] = None;
            self.pool.give(r)?;
            self.descs[v].loc = Loc::Unplaced;
        }
        Ok(())
    }

    fn emit(&mut self, inst: Inst) {
        self.out.push(Cmd::Inst(inst));
    }

    fn emit_mov(&mut self, dst: Reg, src: Reg) {
        self.emit(Inst::mov(Operand::phys(dst), Operand::phys(src)));
    }

    fn emit_xchg(&mut self, a: Reg, b: Reg) {
        self.emit(Inst::xchg(Operand::phys(a), Operand::phys(b)));
    }

    fn emit_load(&mut self, dst: Reg, src: Loc) {
        self.emit(Inst::mov(Operand::phys(dst), src.mem_operand()));
    }

    fn emit_store(&mut self, dst: Loc, src: Reg) {
        self.emit(Inst::mov(dst.mem_operand(), Operand::phys(src)));
    }

    /// Do the register map, the pool, and the descriptors agree with each other?
    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        Reg::allocatable().all(|r| match self.rmap[r.idx()] {
            Some(v) => self.descs[v].loc == Loc::Reg(r) && !self.pool.is_free(r),
            None => self.pool.is_free(r),
        }) && self.descs.iter_enumerated().all(|(v, d)| match d.loc {
            Loc::Reg(r) => self.rmap[r.idx()] == Some(v),
            _ => true,
        })
    }
}

/// Does a [Cmd::Pop] in `cmds`, a scope nested `depth` deep, leave the scope that encloses them
/// all?
fn escapes(cmds: &[Cmd], depth: usize) -> bool {
    cmds.iter().any(|c| match c {
        Cmd::Pop(k) => *k > depth,
        Cmd::Scope(sub) => escapes(sub, depth + 1),
        _ => false,
    })
}
