use super::*;
use crate::{
    ir::{Mem, RegRef, SymIdx},
    reg::{CALLEE_SAVED, CALLER_SAVED},
};
use fm::FMatcher;

fn log() -> &'static Log {
    Box::leak(Box::new(Log::errors_only()))
}

/// Color `p` without finalizing it, so that the colorizer's state can be inspected.
fn color(p: &Proc) -> Colorizer<'_> {
    let mut c = Colorizer::new(p, log()).unwrap();
    c.enter(&p.body).unwrap();
    c.process(&p.body).unwrap();
    c.exit().unwrap();
    assert!(c.is_consistent());
    c
}

/// Like [color], also returning the location of every register after each of the function body's
/// nested scopes.
fn color_scopes(p: &Proc) -> (Colorizer<'_>, Vec<TiVec<VRegIdx, Loc>>) {
    let mut c = Colorizer::new(p, log()).unwrap();
    c.enter(&p.body).unwrap();
    let mut after = Vec::new();
    for i in 0..p.body.len() {
        let reachable = c.command(i, &p.body).unwrap();
        if let Cmd::Scope(_) = p.body[i] {
            after.push(c.descs.iter().map(|d| d.loc).collect());
        }
        if !reachable {
            break;
        }
    }
    c.exit().unwrap();
    assert!(c.is_consistent());
    (c, after)
}

fn color_err(p: &Proc) -> CompilationError {
    match Colorizer::new(p, log()).and_then(|c| c.run()) {
        Ok(colored) => panic!("expected an error, got:\n{colored}"),
        Err(e) => e,
    }
}

fn match_out(c: &Colorizer, ptn: &str) {
    let s = c.out.iter().map(|c| format!("{c}\n")).collect::<String>();
    if let Err(e) = FMatcher::new(ptn).unwrap().matches(&s) {
        panic!("{e}\n{s}");
    }
}

fn mov_imm(v: VRegIdx, x: i64) -> Cmd {
    Cmd::Inst(Inst::mov(Operand::virt(v), Operand::Imm(x)))
}

fn mov(dst: VRegIdx, src: VRegIdx) -> Cmd {
    Cmd::Inst(Inst::mov(Operand::virt(dst), Operand::virt(src)))
}

fn add(dst: VRegIdx, src: VRegIdx) -> Cmd {
    Cmd::Inst(Inst::binop(Opcode::Add, Operand::virt(dst), Operand::virt(src)))
}

fn add_imm(dst: VRegIdx, x: i64) -> Cmd {
    Cmd::Inst(Inst::binop(Opcode::Add, Operand::virt(dst), Operand::Imm(x)))
}

fn call(sym: usize, args: &[VRegIdx], rets: &[VRegIdx]) -> Cmd {
    Cmd::Inst(Inst::call(
        Operand::Sym(SymIdx::new(sym).unwrap()),
        args,
        rets,
    ))
}

fn clobber(regs: RegSet) -> Cmd {
    Cmd::Preserve {
        regs,
        read: false,
        write: true,
    }
}

fn label(l: usize) -> LabelIdx {
    LabelIdx::new(l).unwrap()
}

fn vregs(p: &mut Proc, n: usize) -> Vec<VRegIdx> {
    (0..n).map(|_| p.vreg().unwrap()).collect()
}

fn count(c: &Colorizer, f: impl Fn(&Inst) -> bool) -> usize {
    c.out
        .iter()
        .filter(|cmd| matches!(cmd, Cmd::Inst(inst) if f(inst)))
        .count()
}

fn is_store(inst: &Inst) -> bool {
    inst.opcode == Opcode::Mov && matches!(inst.operands[0], Operand::Mem(_) | Operand::Sym(_))
}

fn is_load(inst: &Inst) -> bool {
    inst.opcode == Opcode::Mov && matches!(inst.operands[1], Operand::Mem(_) | Operand::Sym(_))
}

#[test]
fn last_use_frees_register() {
    let mut p = Proc::new("f");
    let (a, b) = (p.vreg().unwrap(), p.vreg().unwrap());
    p.body = vec![mov_imm(a, 1), mov_imm(b, 2), add(a, b)];
    let c = color(&p);
    match_out(
        &c,
        "mov r11, 1
mov r10, 2
add r11, r10
",
    );
    assert_eq!(c.descs[b].loc, Loc::Unplaced);
    assert!(c.pool.is_free(Reg::R10));
    assert_eq!(count(&c, is_store), 0);
    assert_eq!(c.spills.size(), 0);
}

#[test]
fn spill_under_pressure() {
    let mut p = Proc::new("f");
    let vs = vregs(&mut p, 17);
    for (i, v) in vs.iter().enumerate() {
        p.body.push(mov_imm(*v, i64::try_from(i).unwrap()));
    }
    for v in &vs[1..] {
        p.body.push(add(vs[0], *v));
    }
    let c = color(&p);
    match_out(
        &c,
        "...
mov r15, 13
mov [rbp - 8], r15
mov r15, 14
mov [rbp - 16], r15
mov r15, 15
mov [rbp - 24], r15
mov r15, 16
add r11, r10
...
add r11, r14
mov r14, [rbp - 8]
add r11, r14
mov r14, [rbp - 16]
add r11, r14
mov r14, [rbp - 24]
add r11, r14
add r11, r15
",
    );
    assert_eq!(count(&c, is_store), 3);
    assert_eq!(count(&c, is_load), 3);
    assert_eq!(c.spills.size(), 24);
    assert!(c.spills.is_conserved());
    assert_eq!(c.pool.len(), 14);
}

#[test]
fn spill_cell_reused() {
    // `vs[13]` is spilled, and reloaded once the other values are dead. `a` is then spilled while
    // `ws` are live: only one value is ever in memory, so one cell suffices.
    let mut p = Proc::new("f");
    let vs = vregs(&mut p, 14);
    let a = p.vreg().unwrap();
    let ws = vregs(&mut p, 13);
    let b = p.vreg().unwrap();
    for (i, v) in vs.iter().enumerate() {
        p.body.push(mov_imm(*v, i64::try_from(i).unwrap()));
    }
    p.body.push(mov_imm(a, 100));
    for v in &vs {
        p.body.push(add(a, *v));
    }
    let mid = p.body.len();
    for (i, w) in ws.iter().enumerate() {
        p.body.push(mov_imm(*w, i64::try_from(i).unwrap()));
    }
    p.body.push(mov_imm(b, 200));
    for w in &ws {
        p.body.push(add(b, *w));
    }
    p.body.push(add(b, a));

    let mut c = Colorizer::new(&p, log()).unwrap();
    c.enter(&p.body).unwrap();
    for i in 0..mid {
        assert!(c.command(i, &p.body).unwrap());
    }
    assert_eq!(count(&c, is_store), 1);
    assert_eq!(c.spills.size(), 8);
    assert!(!c.spills.is_retained(-8));
    assert!(c.spills.is_conserved());

    for i in mid..p.body.len() {
        assert!(c.command(i, &p.body).unwrap());
    }
    c.exit().unwrap();
    match_out(
        &c,
        "...
mov r15, 13
mov [rbp - 8], r15
mov r15, 100
...
mov r14, [rbp - 8]
add r15, r14
...
mov [rbp - 8], r15
mov r15, 200
...
mov r11, [rbp - 8]
add r15, r11
",
    );
    assert_eq!(count(&c, is_store), 2);
    assert_eq!(count(&c, is_load), 2);
    assert_eq!(c.spills.size(), 8);
    assert!(c.spills.is_conserved());
}

#[test]
fn spill_in_branch_is_restored() {
    let mut p = Proc::new("f");
    let vs = vregs(&mut p, 14);
    let t = p.vreg().unwrap();
    for (i, v) in vs.iter().enumerate() {
        p.body.push(mov_imm(*v, i64::try_from(i).unwrap()));
    }
    p.body.push(Cmd::Scope(vec![
        mov_imm(t, 100),
        add(t, vs[0]),
        add(vs[1], t),
    ]));
    for v in &vs[1..] {
        p.body.push(add(vs[0], *v));
    }
    let (c, after) = color_scopes(&p);
    match_out(
        &c,
        "...
mov r14, 12
mov r15, 13
mov [rbp - 8], r15
mov r15, 100
add r15, r11
add r10, r15
mov r15, [rbp - 8]
add r11, r10
...
add r11, r15
",
    );
    assert_eq!(after[0][vs[13]], Loc::Reg(Reg::R15));
    assert!(c.spills.is_conserved());
}

#[test]
fn branches_agree_at_join() {
    let mut p = Proc::new("f");
    let x = p.vreg().unwrap();
    let arg = p.pinned_vreg(Reg::RDI).unwrap();
    let r = p.pinned_vreg(Reg::RAX).unwrap();
    p.body = vec![
        Cmd::LocateAtReg(x, Reg::RDI),
        Cmd::Scope(vec![clobber(CALLER_SAVED), call(0, &[], &[])]),
        Cmd::Scope(vec![mov_imm(arg, 5), call(1, &[arg], &[])]),
        mov(r, x),
        Cmd::Inst(Inst::ret()),
        Cmd::DeadEnd,
    ];
    let (c, after) = color_scopes(&p);
    match_out(
        &c,
        "mov rbx, rdi
call [sym0]
mov rdi, rbx
mov rbx, rdi
mov rdi, 5
call [sym1]
mov rdi, rbx
mov rax, rdi
ret
",
    );
    assert_eq!(after[0][x], Loc::Reg(Reg::RDI));
    assert_eq!(after[1][x], Loc::Reg(Reg::RDI));
}

#[test]
fn callee_saved_without_spills() {
    let mut p = Proc::new("f");
    let r = p.pinned_vreg(Reg::RAX).unwrap();
    p.body = vec![
        clobber(CALLEE_SAVED),
        Cmd::FrameCreate,
        mov_imm(r, 0),
        Cmd::Preserve {
            regs: CALLEE_SAVED,
            read: true,
            write: false,
        },
        Cmd::FrameDestroy,
        Cmd::Inst(Inst::ret()),
        Cmd::DeadEnd,
    ];
    let c = color(&p);
    match_out(
        &c,
        "frame-create
mov rax, 0
frame-destroy
ret
",
    );
    for reg in CALLEE_SAVED.iter() {
        assert!(c.pool.is_free(reg));
    }
}

/// Color the first `at` commands of `p`, enter the scope that is its next command, and return
/// the colorizer.
fn enter_scope(p: &Proc, at: usize) -> Colorizer<'_> {
    let mut c = Colorizer::new(p, log()).unwrap();
    c.enter(&p.body).unwrap();
    c.process(&p.body[..at]).unwrap();
    let Cmd::Scope(sub) = &p.body[at] else {
        panic!()
    };
    c.cur_mut().uses.consume_all(at);
    c.enter(sub).unwrap();
    c
}

/// Move each of `vs` to the register the next one is in, the last moving to the first's.
fn rotate(c: &mut Colorizer, vs: &[VRegIdx]) {
    let regs = vs
        .iter()
        .map(|v| match c.descs[*v].loc {
            Loc::Reg(r) => r,
            _ => panic!(),
        })
        .collect::<Vec<_>>();
    for (i, v) in vs.iter().enumerate() {
        let r = regs[(i + 1) % regs.len()];
        c.note_move(*v);
        c.rmap[r.idx()] = Some(*v);
        c.descs[*v].loc = Loc::Reg(r);
    }
    assert!(c.is_consistent());
}

#[test]
fn swap_is_one_xchg() {
    let mut p = Proc::new("f");
    let (x, y) = (p.vreg().unwrap(), p.vreg().unwrap());
    p.body = vec![
        mov_imm(x, 1),
        mov_imm(y, 2),
        Cmd::Scope(vec![add(x, y)]),
        add(x, y),
    ];
    let mut c = enter_scope(&p, 2);
    rotate(&mut c, &[x, y]);
    let before = c.out.len();
    c.reconcile(1, ExitKind::Fallthrough).unwrap();
    assert_eq!(
        c.out[before..],
        [Cmd::Inst(Inst::xchg(
            Operand::phys(Reg::R10),
            Operand::phys(Reg::R11)
        ))]
    );
    assert_eq!(c.descs[x].loc, Loc::Reg(Reg::R11));
    assert_eq!(c.descs[y].loc, Loc::Reg(Reg::R10));
    assert!(c.is_consistent());

    // Reconciling again has nothing left to do.
    let before = c.out.len();
    c.reconcile(1, ExitKind::Fallthrough).unwrap();
    assert_eq!(c.out.len(), before);
}

#[test]
fn three_cycle() {
    let mut p = Proc::new("f");
    let (x, y, z) = (p.vreg().unwrap(), p.vreg().unwrap(), p.vreg().unwrap());
    p.body = vec![
        mov_imm(x, 1),
        mov_imm(y, 2),
        mov_imm(z, 3),
        Cmd::Scope(vec![add(x, y), add(y, z)]),
        add(x, y),
        add(x, z),
    ];
    let mut c = enter_scope(&p, 3);
    rotate(&mut c, &[x, y, z]);
    let before = c.out.len();
    c.reconcile(1, ExitKind::Fallthrough).unwrap();
    assert_eq!(
        count(&c, |i| i.opcode == Opcode::Xchg),
        2,
        "{:?}",
        &c.out[before..]
    );
    assert_eq!(c.out.len() - before, 2);
    assert_eq!(c.descs[x].loc, Loc::Reg(Reg::R11));
    assert_eq!(c.descs[y].loc, Loc::Reg(Reg::R10));
    assert_eq!(c.descs[z].loc, Loc::Reg(Reg::R9));
    assert!(c.is_consistent());
}

#[test]
fn value_defined_in_scope_is_published() {
    let mut p = Proc::new("f");
    let x = p.vreg().unwrap();
    let r = p.pinned_vreg(Reg::RAX).unwrap();
    p.body = vec![
        Cmd::Scope(vec![mov_imm(x, 1)]),
        mov(r, x),
        Cmd::Inst(Inst::ret()),
        Cmd::DeadEnd,
    ];
    let (c, after) = color_scopes(&p);
    match_out(
        &c,
        "mov r11, 1
mov rax, r11
ret
",
    );
    assert_eq!(after[0][x], Loc::Reg(Reg::R11));
}

/// An if/else whose arms both define `x`, which is read after the join. `then` reaches the join
/// with a break out of the whole conditional.
fn if_else_defining(x: VRegIdx, y: VRegIdx, r: VRegIdx, then: Vec<Cmd>) -> Vec<Cmd> {
    let mut then = then;
    then.extend([
        Cmd::Pop(2),
        Cmd::Inst(Inst::jmp(label(2))),
        Cmd::DeadEnd,
    ]);
    vec![
        Cmd::Scope(vec![
            Cmd::Inst(Inst::jcc(Opcode::Je, label(1))),
            Cmd::Scope(then),
            Cmd::Inst(Inst::label(label(1))),
            Cmd::Scope(vec![mov_imm(y, 3), mov_imm(x, 2), add(x, y)]),
        ]),
        Cmd::Inst(Inst::label(label(2))),
        mov(r, x),
        Cmd::Inst(Inst::ret()),
        Cmd::DeadEnd,
    ]
}

#[test]
fn break_and_fallthrough_agree_on_new_value() {
    let mut p = Proc::new("f");
    let (x, y) = (p.vreg().unwrap(), p.vreg().unwrap());
    let r = p.pinned_vreg(Reg::RAX).unwrap();
    p.body = if_else_defining(x, y, r, vec![mov_imm(x, 1)]);
    let (c, after) = color_scopes(&p);
    // The else arm's value is moved to where the then arm left its own.
    match_out(
        &c,
        "je .L1
mov r11, 1
jmp .L2
.L1:
mov r11, 3
mov r10, 2
add r10, r11
mov r11, r10
.L2:
mov rax, r11
ret
",
    );
    assert_eq!(after[0][x], Loc::Reg(Reg::R11));
}

#[test]
fn value_defined_in_nested_scope_reaches_join() {
    let mut p = Proc::new("f");
    let (x, y) = (p.vreg().unwrap(), p.vreg().unwrap());
    let r = p.pinned_vreg(Reg::RAX).unwrap();
    p.body = if_else_defining(x, y, r, vec![Cmd::Scope(vec![mov_imm(x, 1)])]);
    let (c, after) = color_scopes(&p);
    match_out(
        &c,
        "je .L1
mov r11, 1
jmp .L2
.L1:
mov r11, 3
mov r10, 2
add r10, r11
mov r11, r10
.L2:
mov rax, r11
ret
",
    );
    assert_eq!(after[0][x], Loc::Reg(Reg::R11));
}

#[test]
fn loop_with_break() {
    let mut p = Proc::new("f");
    let i = p.vreg().unwrap();
    let r = p.pinned_vreg(Reg::RAX).unwrap();
    let cmp = Cmd::Inst(Inst::compare(
        Opcode::Cmp,
        Operand::virt(i),
        Operand::Imm(10),
    ));
    p.body = vec![
        mov_imm(i, 0),
        Cmd::Scope(vec![
            Cmd::Inst(Inst::label(label(0))),
            clobber(CALLER_SAVED),
            call(0, &[], &[]),
            add_imm(i, 1),
            cmp,
            Cmd::Inst(Inst::jcc(Opcode::Jl, label(2))),
            Cmd::Scope(vec![
                Cmd::Pop(2),
                Cmd::Inst(Inst::jmp(label(1))),
                Cmd::DeadEnd,
            ]),
            Cmd::Inst(Inst::label(label(2))),
            Cmd::Repeat(label(0)),
        ]),
        Cmd::Inst(Inst::label(label(1))),
        mov(r, i),
        Cmd::Inst(Inst::ret()),
        Cmd::DeadEnd,
    ];
    let c = color(&p);
    match_out(
        &c,
        "mov r11, 0
.L0:
mov rbx, r11
call [sym0]
add rbx, 1
cmp rbx, 10
jl .L2
mov r11, rbx
jmp .L1
.L2:
mov r11, rbx
jmp .L0
.L1:
mov rax, r11
ret
",
    );
}

#[test]
fn break_keeps_outer_values() {
    // `x` is next written inside the loop, but the break path still needs its value, so making
    // room for `u` must not drop it.
    let mut p = Proc::new("f");
    let vs = vregs(&mut p, 14);
    let (x, u) = (vs[0], p.vreg().unwrap());
    let mut body = vs.iter().map(|v| mov_imm(*v, 1)).collect::<Vec<_>>();
    body.push(Cmd::Scope(vec![
        Cmd::Inst(Inst::label(label(0))),
        Cmd::Scope(vec![
            mov_imm(u, 5),
            add(u, u),
            Cmd::Pop(2),
            Cmd::Inst(Inst::jmp(label(1))),
            Cmd::DeadEnd,
        ]),
        mov_imm(x, 3),
        Cmd::Repeat(label(0)),
    ]));
    body.push(Cmd::Inst(Inst::label(label(1))));
    for v in &vs[1..] {
        body.push(add(x, *v));
    }
    p.body = body;
    let c = color(&p);
    match_out(
        &c,
        "...
mov r15, 1
.L0:
mov [rbp - 8], rax
mov rax, 5
add rax, rax
mov rax, [rbp - 8]
jmp .L1
mov r11, 3
jmp .L0
.L1:
add r11, r10
...
add r11, r15
",
    );
    assert!(c.spills.is_conserved());
}

#[test]
fn static_home() {
    let mut p = Proc::new("f");
    let x = p.static_vreg(SymIdx::new(7).unwrap()).unwrap();
    p.body = vec![mov_imm(x, 1), add_imm(x, 2)];
    let mut c = Colorizer::new(&p, log()).unwrap();
    c.enter(&p.body).unwrap();
    c.process(&p.body[..1]).unwrap();
    c.save(x).unwrap();
    assert_eq!(c.descs[x].loc, Loc::Static(SymIdx::new(7).unwrap()));
    let r = c.ensure_loaded(x, false, &mut RegSet::blank()).unwrap();
    assert_eq!(r, Reg::R11);
    match_out(
        &c,
        "mov r11, 1
mov [sym7], r11
mov r11, [sym7]
",
    );
    assert_eq!(c.spills.size(), 0);
}

#[test]
fn stack_parameter() {
    let mut p = Proc::new("f");
    let x = p.vreg().unwrap();
    let r = p.pinned_vreg(Reg::RAX).unwrap();
    p.body = vec![Cmd::LocateAtStack(x, 16), mov(r, x)];
    let c = color(&p);
    assert!(c.uses_fp);
    match_out(
        &c,
        "mov r11, [rbp + 16]
mov rax, r11
",
    );
    assert_eq!(c.spills.size(), 0);
}

#[test]
fn memory_operands() {
    let mut p = Proc::new("f");
    let (base, idx, dst) = (p.vreg().unwrap(), p.vreg().unwrap(), p.vreg().unwrap());
    p.body = vec![
        mov_imm(base, 0x1000),
        mov_imm(idx, 2),
        Cmd::Inst(Inst::mov(
            Operand::virt(dst),
            Operand::Mem(Mem::base_index(RegRef::Virt(base), RegRef::Virt(idx), 8, 0)),
        )),
        add(dst, dst),
    ];
    let c = color(&p);
    match_out(
        &c,
        "mov r11, 4096
mov r10, 2
mov r9, [r11 + r10*8]
add r9, r9
",
    );
}

#[test]
fn pinned_operands_conflict() {
    let mut p = Proc::new("f");
    let (a, b) = (
        p.pinned_vreg(Reg::RDI).unwrap(),
        p.pinned_vreg(Reg::RDI).unwrap(),
    );
    p.body = vec![add(a, b)];
    assert!(matches!(
        color_err(&p),
        CompilationError::InternalError(_)
    ));
}

#[test]
fn invalid_input() {
    let mut p = Proc::new("f");
    let x = p.vreg().unwrap();
    let y = p.vreg().unwrap();

    // Popping the function body.
    p.body = vec![Cmd::Pop(1)];
    assert!(matches!(color_err(&p), CompilationError::InternalError(_)));

    // A back-edge must end its scope.
    p.body = vec![Cmd::Scope(vec![Cmd::Repeat(label(0)), mov_imm(x, 1)])];
    assert!(matches!(color_err(&p), CompilationError::InternalError(_)));

    // An undeclared register.
    p.body = vec![mov_imm(VRegIdx::new(9).unwrap(), 1)];
    assert!(matches!(color_err(&p), CompilationError::InternalError(_)));

    // An allocatable physical register in the input.
    p.body = vec![Cmd::Inst(Inst::mov(Operand::phys(Reg::RAX), Operand::Imm(1)))];
    assert!(matches!(color_err(&p), CompilationError::InternalError(_)));

    // Two parameters arriving in one register.
    p.body = vec![
        Cmd::LocateAtReg(x, Reg::RDI),
        Cmd::LocateAtReg(y, Reg::RDI),
        add(x, y),
    ];
    assert!(matches!(color_err(&p), CompilationError::InternalError(_)));

    // Stack parameters live above the saved `rbp`.
    p.body = vec![Cmd::LocateAtStack(x, -8), add_imm(x, 1)];
    assert!(matches!(color_err(&p), CompilationError::InternalError(_)));

    let mut p = Proc::new("f");
    p.pinned_vreg(Reg::RSP).unwrap();
    assert!(matches!(color_err(&p), CompilationError::InternalError(_)));
}

#[test]
fn escaping_pops() {
    let brk = |k| vec![Cmd::Pop(k), Cmd::DeadEnd];
    assert!(!escapes(&brk(1), 1));
    assert!(escapes(&brk(2), 1));
    assert!(!escapes(&[Cmd::Scope(brk(2))], 1));
    assert!(escapes(&[Cmd::Scope(brk(3))], 1));
}
