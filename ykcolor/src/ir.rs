//! The colorizer's input and output.
//!
//! A [Proc] is a table of virtual registers and a nested list of [Cmd]s. Most commands are
//! [Inst]s, whose register operands may be virtual ([RegRef::Virt]) or physical
//! ([RegRef::Phys]); the rest are pseudo-commands which structure the instructions into scopes,
//! bind parameters to their incoming locations, and mark places where the frame and stack
//! alignment will later be fixed up.

use crate::{
    reg::{Reg, RegSet},
    CompilationError,
};
use std::fmt;
use strum::Display;
use typed_index_collections::TiVec;

pub(crate) fn index_overflow(typ: &str) -> CompilationError {
    CompilationError::LimitExceeded(format!("index overflow: {typ}"))
}

// Generate common methods for 32-bit index types.
macro_rules! index_32bit {
    ($struct:ident) => {
        impl $struct {
            pub fn new(v: usize) -> Result<Self, $crate::CompilationError> {
                u32::try_from(v)
                    .map_err(|_| $crate::ir::index_overflow(stringify!($struct)))
                    .map(Self)
            }
        }

        impl From<usize> for $struct {
            /// Required for TiVec. **DO NOT USE INTERNALLY** as this can `panic`! Instead, use
            /// [Self::new].
            fn from(v: usize) -> Self {
                Self::new(v).unwrap()
            }
        }

        impl From<$struct> for usize {
            fn from(s: $struct) -> usize {
                s.0 as usize
            }
        }

        impl std::fmt::Display for $struct {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
                write!(f, "{}", self.0)
            }
        }
    };
}
pub(crate) use index_32bit;

/// A virtual register: an index into [Proc::vregs].
#[derive(Debug, Copy, Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct VRegIdx(u32);
index_32bit!(VRegIdx);

/// A jump target.
#[derive(Debug, Copy, Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct LabelIdx(u32);
index_32bit!(LabelIdx);

/// A static symbol (e.g. a global variable).
#[derive(Debug, Copy, Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SymIdx(u32);
index_32bit!(SymIdx);

/// A register operand, before or after coloring.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegRef {
    Virt(VRegIdx),
    Phys(Reg),
}

impl fmt::Display for RegRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegRef::Virt(v) => write!(f, "%{v}"),
            RegRef::Phys(r) => write!(f, "{r}"),
        }
    }
}

/// A memory reference of the form `[base + index * scale + disp]`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Mem {
    pub base: Option<RegRef>,
    /// The index register and its scale (1, 2, 4, or 8).
    pub index: Option<(RegRef, u8)>,
    pub disp: i32,
}

impl Mem {
    pub fn base_disp(base: RegRef, disp: i32) -> Self {
        Self {
            base: Some(base),
            index: None,
            disp,
        }
    }

    pub fn base_index(base: RegRef, index: RegRef, scale: u8, disp: i32) -> Self {
        Self {
            base: Some(base),
            index: Some((index, scale)),
            disp,
        }
    }

    /// The register components of this reference. All of them are read.
    pub fn regs(&self) -> impl Iterator<Item = RegRef> {
        self.base.into_iter().chain(self.index.map(|(r, _)| r))
    }

    fn map_regs<E>(&self, mut f: impl FnMut(RegRef) -> Result<RegRef, E>) -> Result<Self, E> {
        Ok(Self {
            base: self.base.map(&mut f).transpose()?,
            index: self
                .index
                .map(|(r, scale)| f(r).map(|r| (r, scale)))
                .transpose()?,
            disp: self.disp,
        })
    }
}

impl fmt::Display for Mem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(b) = self.base {
            parts.push(b.to_string());
        }
        if let Some((i, scale)) = self.index {
            parts.push(format!("{i}*{scale}"));
        }
        let mut s = parts.join(" + ");
        if s.is_empty() {
            s = self.disp.to_string();
        } else if self.disp > 0 {
            s.push_str(&format!(" + {}", self.disp));
        } else if self.disp < 0 {
            s.push_str(&format!(" - {}", self.disp.unsigned_abs()));
        }
        write!(f, "[{s}]")
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operand {
    Imm(i64),
    Reg(RegRef),
    Mem(Mem),
    Label(LabelIdx),
    /// A reference to the memory at a static symbol.
    Sym(SymIdx),
}

impl Operand {
    pub fn virt(v: VRegIdx) -> Self {
        Operand::Reg(RegRef::Virt(v))
    }

    pub fn phys(r: Reg) -> Self {
        Operand::Reg(RegRef::Phys(r))
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Imm(x) => write!(f, "{x}"),
            Operand::Reg(r) => write!(f, "{r}"),
            Operand::Mem(m) => write!(f, "{m}"),
            Operand::Label(l) => write!(f, ".L{l}"),
            Operand::Sym(s) => write!(f, "[sym{s}]"),
        }
    }
}

/// A set of operand positions within an [Inst].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct OpSet(u32);

impl OpSet {
    pub fn from_indices(idxs: &[usize]) -> Self {
        idxs.iter().fold(Self::default(), |s, i| s.with(*i))
    }

    pub fn with(self, i: usize) -> Self {
        debug_assert!(i < 32);
        Self(self.0 | (1 << i))
    }

    pub fn contains(&self, i: usize) -> bool {
        i < 32 && self.0 & (1 << i) != 0
    }
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum Opcode {
    Mov,
    Add,
    Sub,
    Imul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Neg,
    Not,
    Cmp,
    Test,
    Lea,
    Push,
    Pop,
    Xchg,
    /// A call: operand 0 is the target. Any further operands are the ABI-placed arguments (read)
    /// and return values (written) and are not printed.
    Call,
    Ret,
    Jmp,
    Je,
    Jne,
    Jl,
    Jle,
    Jg,
    Jge,
    /// The definition of the label in operand 0.
    Label,
}

/// An instruction, before or after coloring.
#[derive(Clone, Debug, PartialEq)]
pub struct Inst {
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
    /// The operands this instruction reads.
    pub reads: OpSet,
    /// The operands this instruction writes.
    pub writes: OpSet,
}

impl Inst {
    pub fn new(opcode: Opcode, operands: Vec<Operand>, reads: OpSet, writes: OpSet) -> Self {
        Self {
            opcode,
            operands,
            reads,
            writes,
        }
    }

    pub fn mov(dst: Operand, src: Operand) -> Self {
        Self::new(
            Opcode::Mov,
            vec![dst, src],
            OpSet::from_indices(&[1]),
            OpSet::from_indices(&[0]),
        )
    }

    /// A two-operand arithmetic instruction such as `add dst, src`: `dst` is read and written.
    pub fn binop(opcode: Opcode, dst: Operand, src: Operand) -> Self {
        Self::new(
            opcode,
            vec![dst, src],
            OpSet::from_indices(&[0, 1]),
            OpSet::from_indices(&[0]),
        )
    }

    /// A one-operand read-modify-write instruction such as `neg x`.
    pub fn unop(opcode: Opcode, x: Operand) -> Self {
        Self::new(
            opcode,
            vec![x],
            OpSet::from_indices(&[0]),
            OpSet::from_indices(&[0]),
        )
    }

    /// An instruction which only reads its operands, such as `cmp a, b`.
    pub fn compare(opcode: Opcode, a: Operand, b: Operand) -> Self {
        Self::new(
            opcode,
            vec![a, b],
            OpSet::from_indices(&[0, 1]),
            OpSet::default(),
        )
    }

    pub fn lea(dst: Operand, src: Mem) -> Self {
        Self::new(
            Opcode::Lea,
            vec![dst, Operand::Mem(src)],
            OpSet::default(),
            OpSet::from_indices(&[0]),
        )
    }

    pub fn xchg(a: Operand, b: Operand) -> Self {
        Self::new(
            Opcode::Xchg,
            vec![a, b],
            OpSet::from_indices(&[0, 1]),
            OpSet::from_indices(&[0, 1]),
        )
    }

    pub fn push(x: Operand) -> Self {
        Self::new(
            Opcode::Push,
            vec![x],
            OpSet::from_indices(&[0]),
            OpSet::default(),
        )
    }

    pub fn pop(x: Operand) -> Self {
        Self::new(
            Opcode::Pop,
            vec![x],
            OpSet::default(),
            OpSet::from_indices(&[0]),
        )
    }

    /// `call target`, where `args` are already placed in argument registers and `rets` are
    /// defined on return. Both are normally pinned virtual registers.
    pub fn call(target: Operand, args: &[VRegIdx], rets: &[VRegIdx]) -> Self {
        let mut operands = vec![target];
        let mut reads = OpSet::from_indices(&[0]);
        let mut writes = OpSet::default();
        for a in args {
            reads = reads.with(operands.len());
            operands.push(Operand::virt(*a));
        }
        for r in rets {
            writes = writes.with(operands.len());
            operands.push(Operand::virt(*r));
        }
        Self::new(Opcode::Call, operands, reads, writes)
    }

    pub fn ret() -> Self {
        Self::new(Opcode::Ret, Vec::new(), OpSet::default(), OpSet::default())
    }

    pub fn jmp(l: LabelIdx) -> Self {
        Self::jcc(Opcode::Jmp, l)
    }

    /// A (possibly conditional) jump to `l`.
    pub fn jcc(opcode: Opcode, l: LabelIdx) -> Self {
        Self::new(
            opcode,
            vec![Operand::Label(l)],
            OpSet::default(),
            OpSet::default(),
        )
    }

    pub fn label(l: LabelIdx) -> Self {
        Self::new(
            Opcode::Label,
            vec![Operand::Label(l)],
            OpSet::default(),
            OpSet::default(),
        )
    }

    /// The distinct virtual registers this instruction refers to, in operand order, each with
    /// whether it is read and whether it is written. Memory components count as reads.
    pub(crate) fn vreg_operands(&self) -> Vec<(VRegIdx, bool, bool)> {
        let mut out: Vec<(VRegIdx, bool, bool)> = Vec::new();
        let mut add = |v: VRegIdx, read: bool, write: bool| {
            match out.iter_mut().find(|(x, _, _)| *x == v) {
                Some((_, r, w)) => {
                    *r |= read;
                    *w |= write;
                }
                None => out.push((v, read, write)),
            }
        };
        for (i, op) in self.operands.iter().enumerate() {
            match op {
                Operand::Reg(RegRef::Virt(v)) => {
                    add(*v, self.reads.contains(i), self.writes.contains(i))
                }
                Operand::Mem(m) => {
                    for r in m.regs() {
                        if let RegRef::Virt(v) = r {
                            add(v, true, false);
                        }
                    }
                }
                _ => (),
            }
        }
        out
    }

    /// The physical registers this instruction names explicitly.
    pub(crate) fn phys_regs(&self) -> RegSet {
        let mut set = RegSet::blank();
        for op in &self.operands {
            match op {
                Operand::Reg(RegRef::Phys(r)) => set.set(*r),
                Operand::Mem(m) => {
                    for r in m.regs() {
                        if let RegRef::Phys(r) = r {
                            set.set(r);
                        }
                    }
                }
                _ => (),
            }
        }
        set
    }

    /// Return a copy of this instruction with every virtual register replaced by the physical
    /// register `asgn` maps it to.
    pub(crate) fn color(
        &self,
        asgn: impl Fn(VRegIdx) -> Option<Reg>,
    ) -> Result<Inst, CompilationError> {
        let map = |r: RegRef| match r {
            RegRef::Virt(v) => asgn(v).map(RegRef::Phys).ok_or_else(|| {
                CompilationError::InternalError(format!("%{v} was not assigned a register"))
            }),
            RegRef::Phys(_) => Ok(r),
        };
        let operands = self
            .operands
            .iter()
            .map(|op| match op {
                Operand::Reg(r) => map(*r).map(Operand::Reg),
                Operand::Mem(m) => m.map_regs(map).map(Operand::Mem),
                _ => Ok(*op),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Inst {
            operands,
            ..self.clone()
        })
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode {
            Opcode::Label => match self.operands.first() {
                Some(op) => write!(f, "{op}:"),
                None => write!(f, "<label>:"),
            },
            Opcode::Call => match self.operands.first() {
                Some(op) => write!(f, "call {op}"),
                None => write!(f, "call"),
            },
            _ => {
                write!(f, "{}", self.opcode)?;
                for (i, op) in self.operands.iter().enumerate() {
                    write!(f, "{}{op}", if i == 0 { " " } else { ", " })?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Cmd {
    Inst(Inst),
    /// A nested scope: a branch arm, loop body, or any other structured region.
    Scope(Vec<Cmd>),
    /// The back-edge of a loop whose head is the label given. Must be the last command in its
    /// scope.
    Repeat(LabelIdx),
    /// Leave this many enclosing scopes (e.g. `break`). The lowering stage follows this with the
    /// jump to the exit target.
    Pop(usize),
    /// The boundary that follows may read (`read`) and/or overwrite (`write`) the registers in
    /// `regs`.
    Preserve {
        regs: RegSet,
        read: bool,
        write: bool,
    },
    /// The virtual register's value arrives in a physical register.
    LocateAtReg(VRegIdx, Reg),
    /// The virtual register's value arrives at a (positive) offset from `rbp`.
    LocateAtStack(VRegIdx, i32),
    FrameCreate,
    FrameDestroy,
    /// The stack will next have this many 8-byte entries pushed and then a call made.
    AlignBefore(usize),
    /// Undo the matching [Cmd::AlignBefore].
    AlignAfter(usize),
    /// Nothing after this point in the current scope is reachable.
    DeadEnd,
}

impl Cmd {
    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent);
        match self {
            Cmd::Inst(inst) => writeln!(f, "{pad}{inst}"),
            Cmd::Scope(cmds) => {
                writeln!(f, "{pad}scope {{")?;
                for c in cmds {
                    c.fmt_indented(f, indent + 1)?;
                }
                writeln!(f, "{pad}}}")
            }
            Cmd::Preserve { regs, read, write } => {
                let regs = regs.iter().map(|r| r.to_string()).collect::<Vec<_>>();
                let mode = match (read, write) {
                    (true, true) => " read write",
                    (true, false) => " read",
                    (false, true) => " write",
                    (false, false) => "",
                };
                writeln!(f, "{pad}preserve {}{mode}", regs.join(", "))
            }
            _ => writeln!(f, "{pad}{self}"),
        }
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cmd::Inst(inst) => write!(f, "{inst}"),
            Cmd::Scope(_) | Cmd::Preserve { .. } => {
                let s = format!("{}", Indented(self));
                write!(f, "{}", s.trim_end())
            }
            Cmd::Repeat(l) => write!(f, "repeat .L{l}"),
            Cmd::Pop(k) => write!(f, "pop {k}"),
            Cmd::LocateAtReg(v, r) => write!(f, "locate %{v}, {r}"),
            Cmd::LocateAtStack(v, off) => write!(
                f,
                "locate %{v}, {}",
                Mem::base_disp(RegRef::Phys(Reg::RBP), *off)
            ),
            Cmd::FrameCreate => write!(f, "frame-create"),
            Cmd::FrameDestroy => write!(f, "frame-destroy"),
            Cmd::AlignBefore(n) => write!(f, "align-before {n}"),
            Cmd::AlignAfter(n) => write!(f, "align-after {n}"),
            Cmd::DeadEnd => write!(f, "dead-end"),
        }
    }
}

struct Indented<'a>(&'a Cmd);

impl fmt::Display for Indented<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt_indented(f, 0)
    }
}

/// The declaration of a virtual register.
#[derive(Clone, Debug, Default)]
pub struct VRegDecl {
    /// The only physical register this value may occupy.
    pub pin: Option<Reg>,
    /// The static symbol this value is saved to, in preference to a spill cell.
    pub home: Option<SymIdx>,
}

/// A procedure ready to be colored.
#[derive(Clone, Debug)]
pub struct Proc {
    pub name: String,
    pub vregs: TiVec<VRegIdx, VRegDecl>,
    pub body: Vec<Cmd>,
}

impl Proc {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            vregs: TiVec::new(),
            body: Vec::new(),
        }
    }

    fn push_vreg(&mut self, decl: VRegDecl) -> Result<VRegIdx, CompilationError> {
        let idx = VRegIdx::new(self.vregs.len())?;
        self.vregs.push(decl);
        Ok(idx)
    }

    /// Declare an unconstrained virtual register.
    pub fn vreg(&mut self) -> Result<VRegIdx, CompilationError> {
        self.push_vreg(VRegDecl::default())
    }

    /// Declare a virtual register that may only live in `reg`.
    pub fn pinned_vreg(&mut self, reg: Reg) -> Result<VRegIdx, CompilationError> {
        self.push_vreg(VRegDecl {
            pin: Some(reg),
            home: None,
        })
    }

    /// Declare a virtual register whose value is saved to `sym` when it is evicted.
    pub fn static_vreg(&mut self, sym: SymIdx) -> Result<VRegIdx, CompilationError> {
        self.push_vreg(VRegDecl {
            pin: None,
            home: Some(sym),
        })
    }
}

impl fmt::Display for Proc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "proc {}:", self.name)?;
        for (v, decl) in self.vregs.iter_enumerated() {
            match (decl.pin, decl.home) {
                (None, None) => (),
                (Some(r), _) => writeln!(f, "  ; %{v} pinned to {r}")?,
                (None, Some(s)) => writeln!(f, "  ; %{v} homed at sym{s}")?,
            }
        }
        for c in &self.body {
            c.fmt_indented(f, 1)?;
        }
        Ok(())
    }
}
