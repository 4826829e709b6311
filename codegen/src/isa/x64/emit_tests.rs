//! Byte-level tests for the x86-64 encoder.
//!
//! Each case pairs a machine instruction with the hex bytes an assembler
//! produces for it. A helper script for checking expectations:
//!
//! ```sh
//! echo 'mov eax, 42' | as -msyntax=intel -mnaked-reg -o /tmp/t.o /dev/stdin
//! objdump -d /tmp/t.o
//! ```

use crate::ast::Module;
use crate::binemit::{GenericObjectFile, SectionData};
use crate::isa::x64::emit_object;
use crate::isa::x64::{Cond, Gpr, X64Op};
use crate::isa::CallConv;
use crate::mir::{MFunction, MInst, MOperand};
use crate::Context;
use smallvec::smallvec;

fn reg(gpr: Gpr) -> MOperand {
    MOperand::Reg {
        reg: gpr.vreg(),
        size: 8,
    }
}

fn reg_sized(gpr: Gpr, size: u8) -> MOperand {
    MOperand::Reg {
        reg: gpr.vreg(),
        size,
    }
}

fn imm(v: i64) -> MOperand {
    MOperand::Imm(v)
}

/// Encode `insts` as the body of an empty leaf function and return the code
/// bytes. No prologue or epilogue bytes appear because the function has no
/// locals and no calls.
fn encode(insts: Vec<MInst>) -> Vec<u8> {
    let mut module = Module::new("emit_tests", "");
    let b = module.builtins();
    let fty = module.function_type(b.void, vec![]);
    let mut ctx = Context::new(module);
    let f = ctx.create_function("f", fty);

    let mut mfunc = MFunction::new(f, &ctx.functions[f]);
    mfunc.blocks[0].name = ".L0".to_string();
    mfunc.blocks[0].insts = insts;

    let mut obj = GenericObjectFile::new();
    emit_object(&ctx, &[mfunc], CallConv::SystemV, &mut obj).expect("encoding failed");
    match &obj.sections[0].data {
        SectionData::Bytes(bytes) => bytes.clone(),
        SectionData::Fill { .. } => unreachable!(),
    }
}

fn check(inst: MInst, expected_hex: &str, asm: &str) {
    let bytes = encode(vec![inst]);
    let hex: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
    assert_eq!(hex, expected_hex, "encoding mismatch for `{asm}`");
}

#[test]
fn test_x64_binemit() {
    let mut insns: Vec<(MInst, &str, &str)> = Vec::new();

    insns.push((
        MInst::new(X64Op::Mov.opcode(), smallvec![imm(42), reg(Gpr::Rax)]),
        "B82A000000",
        "mov eax, 42",
    ));
    insns.push((
        MInst::new(X64Op::Mov.opcode(), smallvec![imm(-1), reg(Gpr::Rax)]),
        "B8FFFFFFFF",
        "mov eax, -1",
    ));
    insns.push((
        MInst::new(
            X64Op::Mov.opcode(),
            smallvec![imm(0x1122334455667788), reg(Gpr::Rax)],
        ),
        "48B88877665544332211",
        "movabs rax, 0x1122334455667788",
    ));
    insns.push((
        MInst::new(X64Op::Mov.opcode(), smallvec![imm(7), reg(Gpr::R9)]),
        "41B907000000",
        "mov r9d, 7",
    ));
    insns.push((
        MInst::new(X64Op::Mov.opcode(), smallvec![reg(Gpr::Rsp), reg(Gpr::Rbp)]),
        "4889E5",
        "mov rbp, rsp",
    ));
    insns.push((
        MInst::new(X64Op::Add.opcode(), smallvec![reg(Gpr::Rdx), reg(Gpr::Rcx)]),
        "4801D1",
        "add rcx, rdx",
    ));
    insns.push((
        MInst::new(X64Op::Sub.opcode(), smallvec![imm(8), reg(Gpr::Rsp)]),
        "4883EC08",
        "sub rsp, 8",
    ));
    insns.push((
        MInst::new(X64Op::Sub.opcode(), smallvec![imm(128), reg(Gpr::Rsp)]),
        "4881EC80000000",
        "sub rsp, 128",
    ));
    insns.push((
        MInst::new(X64Op::Add.opcode(), smallvec![imm(-128), reg(Gpr::Rax)]),
        "4883C080",
        "add rax, -128",
    ));
    insns.push((
        MInst::new(X64Op::Cmp.opcode(), smallvec![imm(0), reg(Gpr::Rdi)]),
        "4883FF00",
        "cmp rdi, 0",
    ));
    insns.push((
        MInst::new(X64Op::And.opcode(), smallvec![reg(Gpr::R8), reg(Gpr::Rax)]),
        "4C21C0",
        "and rax, r8",
    ));
    insns.push((
        MInst::new(X64Op::Or.opcode(), smallvec![reg(Gpr::Rax), reg(Gpr::R8)]),
        "4909C0",
        "or r8, rax",
    ));
    insns.push((
        MInst::new(X64Op::Xor.opcode(), smallvec![reg(Gpr::Rax), reg(Gpr::Rax)]),
        "4831C0",
        "xor rax, rax",
    ));
    insns.push((
        MInst::new(X64Op::Test.opcode(), smallvec![reg(Gpr::Rax), reg(Gpr::Rax)]),
        "4885C0",
        "test rax, rax",
    ));
    insns.push((
        MInst::new(
            X64Op::Imul.opcode(),
            smallvec![reg(Gpr::Rcx), reg(Gpr::Rax)],
        ),
        "480FAFC1",
        "imul rax, rcx",
    ));
    insns.push((
        MInst::new(X64Op::Imul.opcode(), smallvec![imm(10), reg(Gpr::Rax)]),
        "4869C00A000000",
        "imul rax, rax, 10",
    ));
    insns.push((
        MInst::new(X64Op::Idiv.opcode(), smallvec![reg(Gpr::Rcx)]),
        "48F7F9",
        "idiv rcx",
    ));
    insns.push((
        MInst::new(X64Op::Div.opcode(), smallvec![reg(Gpr::Rcx)]),
        "48F7F1",
        "div rcx",
    ));
    insns.push((
        MInst::new(X64Op::Not.opcode(), smallvec![reg(Gpr::Rax)]),
        "48F7D0",
        "not rax",
    ));
    insns.push((MInst::new(X64Op::Cqo.opcode(), smallvec![]), "4899", "cqo"));
    insns.push((MInst::new(X64Op::Cdq.opcode(), smallvec![]), "99", "cdq"));
    insns.push((
        MInst::new(X64Op::Cwd.opcode(), smallvec![]),
        "6699",
        "cwd",
    ));
    insns.push((
        MInst::new(X64Op::Shl.opcode(), smallvec![reg(Gpr::Rax)]),
        "48D3E0",
        "shl rax, cl",
    ));
    insns.push((
        MInst::new(X64Op::Shr.opcode(), smallvec![reg(Gpr::Rax)]),
        "48D3E8",
        "shr rax, cl",
    ));
    insns.push((
        MInst::new(X64Op::Sar.opcode(), smallvec![reg(Gpr::R11)]),
        "49D3FB",
        "sar r11, cl",
    ));
    insns.push((
        MInst::new(X64Op::Push.opcode(), smallvec![reg(Gpr::Rbp)]),
        "55",
        "push rbp",
    ));
    insns.push((
        MInst::new(X64Op::Push.opcode(), smallvec![reg(Gpr::R12)]),
        "4154",
        "push r12",
    ));
    insns.push((
        MInst::new(X64Op::Pop.opcode(), smallvec![reg(Gpr::Rbp)]),
        "5D",
        "pop rbp",
    ));
    insns.push((
        MInst::new(X64Op::Push.opcode(), smallvec![imm(1234)]),
        "68D2040000",
        "push 1234",
    ));
    insns.push((
        MInst::new(X64Op::Setcc.opcode(), smallvec![imm(Cond::Eq as i64), reg(Gpr::Rcx)]),
        "0F94C1",
        "sete cl",
    ));
    insns.push((
        MInst::new(X64Op::Setcc.opcode(), smallvec![imm(Cond::Lt as i64), reg(Gpr::Rax)]),
        "0F9CC0",
        "setl al",
    ));
    insns.push((
        MInst::new(X64Op::Syscall.opcode(), smallvec![]),
        "0F05",
        "syscall",
    ));
    insns.push((MInst::new(X64Op::Ud2.opcode(), smallvec![]), "0F0B", "ud2"));
    insns.push((MInst::new(X64Op::Int3.opcode(), smallvec![]), "CC", "int3"));
    insns.push((
        MInst::new(X64Op::Ret.opcode(), smallvec![]),
        "C3",
        "ret",
    ));
    insns.push((
        MInst::new(
            X64Op::Movzx.opcode(),
            smallvec![reg_sized(Gpr::Rcx, 1), reg_sized(Gpr::Rax, 4)],
        ),
        "0FB6C1",
        "movzx eax, cl",
    ));
    insns.push((
        MInst::new(
            X64Op::Movsx.opcode(),
            smallvec![reg_sized(Gpr::Rcx, 4), reg_sized(Gpr::Rax, 8)],
        ),
        "4863C1",
        "movsxd rax, ecx",
    ));
    insns.push((
        MInst::new(
            X64Op::Xchg.opcode(),
            smallvec![reg(Gpr::Rax), reg(Gpr::Rcx)],
        ),
        "4887C1",
        "xchg rcx, rax",
    ));

    // Memory forms: mem to reg | addr, offset, dst, size.
    insns.push((
        MInst::new(
            X64Op::Mov.opcode(),
            smallvec![reg(Gpr::Rcx), imm(0), reg(Gpr::Rax), imm(8)],
        ),
        "488B01",
        "mov rax, [rcx]",
    ));
    insns.push((
        MInst::new(
            X64Op::Mov.opcode(),
            smallvec![reg(Gpr::Rcx), imm(127), reg(Gpr::Rax), imm(8)],
        ),
        "488B417F",
        "mov rax, [rcx + 127]",
    ));
    insns.push((
        MInst::new(
            X64Op::Mov.opcode(),
            smallvec![reg(Gpr::Rcx), imm(128), reg(Gpr::Rax), imm(8)],
        ),
        "488B8180000000",
        "mov rax, [rcx + 128]",
    ));
    insns.push((
        MInst::new(
            X64Op::Mov.opcode(),
            smallvec![reg(Gpr::Rcx), imm(-128), reg(Gpr::Rax), imm(8)],
        ),
        "488B4180",
        "mov rax, [rcx - 128]",
    ));
    insns.push((
        MInst::new(
            X64Op::Mov.opcode(),
            smallvec![reg(Gpr::Rcx), imm(-129), reg(Gpr::Rax), imm(8)],
        ),
        "488B817FFFFFFF",
        "mov rax, [rcx - 129]",
    ));
    // RBP and R13 at zero displacement keep an explicit disp8 of zero.
    insns.push((
        MInst::new(
            X64Op::Mov.opcode(),
            smallvec![reg(Gpr::Rbp), imm(0), reg(Gpr::Rax), imm(8)],
        ),
        "488B4500",
        "mov rax, [rbp + 0]",
    ));
    insns.push((
        MInst::new(
            X64Op::Mov.opcode(),
            smallvec![reg(Gpr::R13), imm(0), reg(Gpr::Rax), imm(8)],
        ),
        "498B4500",
        "mov rax, [r13 + 0]",
    ));
    // RSP and R12 as base force a SIB byte.
    insns.push((
        MInst::new(
            X64Op::Mov.opcode(),
            smallvec![reg(Gpr::Rsp), imm(0), reg(Gpr::Rax), imm(8)],
        ),
        "488B0424",
        "mov rax, [rsp]",
    ));
    insns.push((
        MInst::new(
            X64Op::Mov.opcode(),
            smallvec![reg(Gpr::R12), imm(0), reg(Gpr::Rax), imm(8)],
        ),
        "498B0424",
        "mov rax, [r12]",
    ));
    // reg to mem | src, addr, offset.
    insns.push((
        MInst::new(
            X64Op::Mov.opcode(),
            smallvec![reg(Gpr::Rax), reg(Gpr::Rbp), imm(-8)],
        ),
        "488945F8",
        "mov [rbp - 8], rax",
    ));
    // imm to mem | imm, addr, offset, size.
    insns.push((
        MInst::new(
            X64Op::Mov.opcode(),
            smallvec![imm(7), reg(Gpr::Rbp), imm(-16), imm(8)],
        ),
        "48C745F007000000",
        "mov qword [rbp - 16], 7",
    ));

    for (inst, expected, asm) in insns {
        check(inst, expected, asm);
    }
}

#[test]
fn lea_frame_address() {
    // lea rax, [rbp - 8], the shape stack allocations lower to.
    let mut inst = MInst::new(X64Op::Lea.opcode(), smallvec![reg(Gpr::Rbp), imm(-8)]);
    inst.vreg = Gpr::Rax.vreg();
    check(inst, "488D45F8", "lea rax, [rbp - 8]");
}

#[test]
fn local_labels_resolve_and_vanish() {
    // A self-loop: jmp .L0 where .L0 is the block's own start.
    let bytes = encode(vec![MInst::new(
        X64Op::Jmp.opcode(),
        smallvec![MOperand::Block(crate::entity::EntityRef::new(0))],
    )]);
    assert_eq!(bytes, vec![0xE9, 0xFB, 0xFF, 0xFF, 0xFF]);
}

#[test]
fn conditional_branch_sequence() {
    // test rcx, rcx; jz .L0 -- the shape conditional branches lower to.
    let bytes = encode(vec![
        MInst::new(X64Op::Test.opcode(), smallvec![reg(Gpr::Rcx), reg(Gpr::Rcx)]),
        MInst::new(
            X64Op::Jcc.opcode(),
            smallvec![imm(Cond::Eq as i64), MOperand::Block(crate::entity::EntityRef::new(0))],
        ),
    ]);
    // 48 85 C9; 0F 84 rel32(-9)
    assert_eq!(
        bytes,
        vec![0x48, 0x85, 0xC9, 0x0F, 0x84, 0xF7, 0xFF, 0xFF, 0xFF]
    );
}

#[test]
fn rip_relative_lea_records_relocation() {
    let mut module = Module::new("emit_tests", "");
    let b = module.builtins();
    let fty = module.function_type(b.void, vec![]);
    let mut ctx = Context::new(module);
    let f = ctx.create_function("f", fty);
    let sref = ctx.create_static(None, b.byte, "message");
    let var = match ctx.functions[f].dfg.insts[sref] {
        crate::ir::InstData::StaticRef { var } => var,
        _ => unreachable!(),
    };

    let mut mfunc = MFunction::new(f, &ctx.functions[f]);
    mfunc.blocks[0].name = ".L0".to_string();
    mfunc.blocks[0].insts = vec![MInst::new(
        X64Op::Lea.opcode(),
        smallvec![MOperand::Static(var), reg(Gpr::Rdi)],
    )];

    let mut obj = GenericObjectFile::new();
    emit_object(&ctx, &[mfunc], CallConv::SystemV, &mut obj).unwrap();

    // lea rdi, [rip + disp32] = 48 8D 3D <0 0 0 0>
    let code = match &obj.sections[0].data {
        SectionData::Bytes(bytes) => bytes.clone(),
        _ => unreachable!(),
    };
    assert_eq!(&code[..3], &[0x48, 0x8D, 0x3D]);
    assert_eq!(&code[3..7], &[0, 0, 0, 0]);

    let reloc = obj
        .relocs
        .iter()
        .find(|r| r.sym.name == "message")
        .expect("missing relocation");
    assert_eq!(reloc.kind, crate::binemit::RelocKind::Disp32PcRel);
    assert_eq!(reloc.sym.byte_offset, 3);

    // Local labels have been stripped.
    assert!(obj.symbols.iter().all(|s| !s.name.starts_with(".L")));
    assert!(obj.relocs.iter().all(|r| !r.sym.name.starts_with(".L")));
}
