//! End-to-end tests: IR built through the public builder, compiled down to
//! machine code in a generic object file.

use gantry_codegen::ast::Module;
use gantry_codegen::binemit::{GenericObjectFile, SectionData, SymbolKind};
use gantry_codegen::ir::{FuncId, InstData, Opcode};
use gantry_codegen::isa::CallConv;
use gantry_codegen::{compile_ir_context, CompileOptions, Context, ObjectFormat};

fn new_ctx() -> (Context, gantry_codegen::ast::Builtins) {
    let module = Module::new("test", "");
    let b = module.builtins();
    (Context::new(module), b)
}

fn main_func(ctx: &mut Context) -> FuncId {
    let b = ctx.module.builtins();
    let fty = ctx.module.function_type(b.integer, vec![]);
    ctx.create_function("main", fty)
}

fn compile(ctx: &mut Context) -> GenericObjectFile {
    let opts = CompileOptions::new(CallConv::SystemV, ObjectFormat::Elf);
    compile_ir_context(ctx, &opts).expect("compilation failed")
}

fn code_bytes(obj: &GenericObjectFile) -> Vec<u8> {
    match &obj.sections[0].data {
        SectionData::Bytes(bytes) => bytes.clone(),
        SectionData::Fill { .. } => unreachable!(),
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn constant_return() {
    let (mut ctx, b) = new_ctx();
    main_func(&mut ctx);
    let v = ctx.immediate(b.integer, 42);
    ctx.return_(Some(v));

    let obj = compile(&mut ctx);

    // mov eax, 42; ret
    assert_eq!(code_bytes(&obj), vec![0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3]);
    assert!(obj.relocs.is_empty());
    let main = obj.symbols.iter().find(|s| s.name == "main").unwrap();
    assert_eq!(main.kind, SymbolKind::Function);
    assert_eq!(main.byte_offset, 0);
}

#[test]
fn conditional_branch_lowers_to_test_and_jz() {
    let (mut ctx, b) = new_ctx();
    main_func(&mut ctx);

    let then_block = ctx.create_block();
    let else_block = ctx.create_block();
    let c = ctx.immediate(b.integer, 1);
    ctx.branch_conditional(c, then_block, else_block);

    ctx.switch_to_block(then_block);
    let one = ctx.immediate(b.integer, 1);
    ctx.return_(Some(one));

    ctx.switch_to_block(else_block);
    let two = ctx.immediate(b.integer, 2);
    ctx.return_(Some(two));

    let obj = compile(&mut ctx);
    let code = code_bytes(&obj);

    // test reg, reg followed by jz; the then block is the fallthrough.
    assert!(contains(&code, &[0x48, 0x85]), "missing test: {code:02x?}");
    assert!(contains(&code, &[0x0f, 0x84]), "missing jz: {code:02x?}");
    // All .L labels were resolved away.
    assert!(obj.symbols.iter().all(|s| !s.name.starts_with(".L")));
    assert!(obj.relocs.iter().all(|r| !r.sym.name.starts_with(".L")));
}

#[test]
fn division_goes_through_cqo_and_idiv() {
    let (mut ctx, b) = new_ctx();
    main_func(&mut ctx);
    let a = ctx.immediate(b.integer, 40);
    let d = ctx.immediate(b.integer, 4);
    let q = ctx.binary(Opcode::Div, a, d);
    ctx.return_(Some(q));

    let obj = compile(&mut ctx);
    let code = code_bytes(&obj);

    // cqo
    assert!(contains(&code, &[0x48, 0x99]), "missing cqo: {code:02x?}");
    // idiv r/m64 is REX.W f7 /7: look for the f7 opcode with /7 in reg.
    let has_idiv = code.windows(3).any(|w| {
        w[0] & 0xf8 == 0x48 && w[1] == 0xf7 && (w[2] >> 3) & 0b111 == 7
    });
    assert!(has_idiv, "missing idiv: {code:02x?}");
}

#[test]
fn stack_frame_prologue_and_epilogue() {
    let (mut ctx, b) = new_ctx();
    main_func(&mut ctx);
    let forty = ctx.module.make_type(gantry_codegen::ast::TypeData::Array {
        of: b.byte,
        len: 40,
    });
    let slot = ctx.stack_allocate(forty);
    let v = ctx.immediate(b.integer, 7);
    ctx.store(slot, v);
    let r = ctx.immediate(b.integer, 0);
    ctx.return_(Some(r));

    let obj = compile(&mut ctx);
    let code = code_bytes(&obj);

    // push rbp; mov rbp, rsp; sub rsp, 48 (the 40-byte frame aligned to 16).
    assert_eq!(&code[..8], &[0x55, 0x48, 0x89, 0xe5, 0x48, 0x83, 0xec, 0x30]);
    // mov rsp, rbp; pop rbp; ret.
    assert!(contains(&code, &[0x48, 0x89, 0xec, 0x5d, 0xc3]));
}

#[test]
fn call_to_external_function_with_string() {
    let (mut ctx, b) = new_ctx();
    let ptr_byte = ctx.module.pointer_to(b.byte);
    let param = gantry_codegen::ast::Parameter {
        name: gantry_codegen::ast::StrId::from_u32(0),
        ty: ptr_byte,
        span: gantry_codegen::ast::SourceSpan::NONE,
    };
    let puts_ty = ctx.module.function_type(b.integer, vec![param]);
    let puts = ctx.declare_function("puts", puts_ty);

    main_func(&mut ctx);
    let text = ctx.module.intern("Hello, world!");
    let len = "Hello, world!".len() as u64 + 1;
    let str_ty = ctx
        .module
        .make_type(gantry_codegen::ast::TypeData::Array { of: b.byte, len });
    let sref = ctx.create_static(None, str_ty, "msg");
    let var = match ctx.cur().dfg.insts[sref] {
        InstData::StaticRef { var } => var,
        _ => unreachable!(),
    };
    ctx.set_static_init(var, gantry_codegen::ir::StaticInit::String(text));

    let call = ctx.direct_call(puts);
    ctx.add_call_argument(call, sref);
    ctx.insert(call);
    ctx.return_(Some(call));

    let obj = compile(&mut ctx);
    let code = code_bytes(&obj);

    // A RIP-relative lea against the string (mod=00, rm=101), and a call
    // rel32 against puts.
    let has_rip_lea = code
        .windows(2)
        .any(|w| w[0] == 0x8d && w[1] & 0b1100_0111 == 0b0000_0101);
    assert!(has_rip_lea, "missing rip-relative lea: {code:02x?}");
    assert!(contains(&code, &[0xe8]), "missing call: {code:02x?}");
    assert!(obj.relocs.iter().any(|r| r.sym.name == "msg"
        && r.kind == gantry_codegen::binemit::RelocKind::Disp32PcRel));
    assert!(obj.relocs.iter().any(|r| r.sym.name == "puts"
        && r.kind == gantry_codegen::binemit::RelocKind::Disp32PcRel));

    let puts_sym = obj.symbols.iter().find(|s| s.name == "puts").unwrap();
    assert_eq!(puts_sym.kind, SymbolKind::External);

    let rodata = obj.get_section_by_name(".rodata").unwrap();
    assert_eq!(rodata.size(), len);
}

#[test]
fn isel_pattern_absorbs_additive_identity() {
    let (mut ctx, b) = new_ctx();
    let f = main_func(&mut ctx);
    let base = ctx.immediate(b.integer, 7);
    let zero = ctx.immediate(b.integer, 0);
    let sum = ctx.binary(Opcode::Add, base, zero);
    ctx.return_(Some(sum));

    let opts = CompileOptions {
        call_conv: CallConv::SystemV,
        format: ObjectFormat::Elf,
        isel_table: Some(
            "match i1 where i1 IMMEDIATE with o1 imm emit MOV o1, result.\n\
             match i1 where i1 ADD with imm eq 0, o1 reg out o1 discard.\n"
                .to_string(),
        ),
    };
    compile_ir_context(&mut ctx, &opts).expect("compilation failed");

    // The add was absorbed: no users left, and the return reads the
    // original operand.
    let func = &ctx.functions[f];
    assert!(func.dfg.users(sum).is_empty());
    let entry = func.layout.entry_block().unwrap();
    let ret = func.layout.block_insts(entry).last().unwrap();
    match &func.dfg.insts[ret] {
        InstData::Return { value } => assert_eq!(*value, Some(base)),
        other => panic!("unexpected terminator {other:?}"),
    }
}

#[test]
fn phi_joins_collapse_onto_one_register() {
    let (mut ctx, b) = new_ctx();
    main_func(&mut ctx);

    let then_block = ctx.create_block();
    let else_block = ctx.create_block();
    let join = ctx.create_block();

    let c = ctx.immediate(b.integer, 1);
    ctx.branch_conditional(c, then_block, else_block);

    ctx.switch_to_block(then_block);
    let two = ctx.immediate(b.integer, 2);
    let two_copy = ctx.copy(two);
    ctx.branch(join);

    ctx.switch_to_block(else_block);
    let three = ctx.immediate(b.integer, 3);
    let three_copy = ctx.copy(three);
    ctx.branch(join);

    ctx.switch_to_block(join);
    let phi = ctx.phi(b.integer);
    ctx.phi_add_argument(
        phi,
        gantry_codegen::ir::PhiArg {
            block: then_block,
            value: two_copy,
        },
    );
    ctx.phi_add_argument(
        phi,
        gantry_codegen::ir::PhiArg {
            block: else_block,
            value: three_copy,
        },
    );
    ctx.return_(Some(phi));

    let obj = compile(&mut ctx);
    let code = code_bytes(&obj);
    assert!(!code.is_empty());
    // Both arms ended in an unconditional transfer to the join block; the
    // second one cannot fall through, so a jmp was emitted.
    assert!(contains(&code, &[0xe9]) || contains(&code, &[0x0f, 0x84]));
    assert!(code.ends_with(&[0xc3]));
}

#[test]
fn renumbering_is_idempotent() {
    let (mut ctx, b) = new_ctx();
    let f = main_func(&mut ctx);
    let v = ctx.immediate(b.integer, 1);
    let w = ctx.immediate(b.integer, 2);
    let sum = ctx.binary(Opcode::Add, v, w);
    ctx.return_(Some(sum));

    ctx.set_ids();
    let first: Vec<u32> = ctx.functions[f]
        .layout
        .block_insts(ctx.functions[f].layout.entry_block().unwrap())
        .map(|inst| ctx.functions[f].dfg.ids[inst])
        .collect();
    ctx.set_ids();
    let second: Vec<u32> = ctx.functions[f]
        .layout
        .block_insts(ctx.functions[f].layout.entry_block().unwrap())
        .map(|inst| ctx.functions[f].dfg.ids[inst])
        .collect();
    assert_eq!(first, second);
    assert_eq!(first, vec![0, 1, 2, 3]);
}

#[test]
fn ast_module_compiles_end_to_end() {
    use gantry_codegen::ast::{FuncAttrs, NodeKind, SourceSpan, SymbolKind};

    let mut module = Module::new("answer.g", "main : integer() = 42");
    let b = module.builtins();
    let fty = module.function_type(b.integer, vec![]);
    let name = module.intern("main");

    let lit = module.make_node(NodeKind::IntLit(42), SourceSpan::new(20, 22));
    let body = module.make_node(
        NodeKind::Block {
            children: vec![lit],
        },
        SourceSpan::new(18, 22),
    );
    module.set_parent(lit, body);
    let func = module.make_node(
        NodeKind::Function {
            name,
            ty: fty,
            body: Some(body),
            attrs: FuncAttrs::default(),
        },
        SourceSpan::new(0, 22),
    );
    module.set_parent(body, func);
    module.append_to_root(func);
    let global = module.global_scope();
    module.add_symbol(global, name, SymbolKind::Function { decl: func, ty: fty });

    let opts = CompileOptions::new(CallConv::SystemV, ObjectFormat::Elf);
    let obj = gantry_codegen::compile_module(module, &opts).expect("compilation failed");
    assert_eq!(code_bytes(&obj), vec![0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3]);
}

#[test]
fn users_and_uses_stay_consistent() {
    let (mut ctx, b) = new_ctx();
    let f = main_func(&mut ctx);
    let v = ctx.immediate(b.integer, 1);
    let w = ctx.immediate(b.integer, 2);
    let x = ctx.binary(Opcode::Add, v, w);
    let y = ctx.binary(Opcode::Mul, x, v);
    ctx.return_(Some(y));

    let func = &ctx.functions[f];
    let entry = func.layout.entry_block().unwrap();
    for inst in func.layout.block_insts(entry) {
        // Every operand's user list contains this instruction exactly once.
        func.dfg.insts[inst].for_each_operand(|op| {
            let count = func.dfg.users(op).iter().filter(|u| **u == inst).count();
            assert_eq!(count, 1, "{inst} appears {count} times in users of {op}");
        });
        // Every recorded user actually references this instruction.
        for &user in func.dfg.users(inst) {
            let mut found = false;
            func.dfg.insts[user].for_each_operand(|op| {
                if op == inst {
                    found = true;
                }
            });
            assert!(found, "{user} is recorded as a user of {inst} but has no such operand");
        }
    }
}

#[test]
fn mangled_names_encode_the_signature() {
    let (mut ctx, b) = new_ctx();
    let fty = ctx.module.function_type(b.integer, vec![]);
    ctx.create_function("square", fty);
    let v = ctx.immediate(b.integer, 1);
    ctx.return_(Some(v));

    let obj = compile(&mut ctx);
    // _XF6square F <ret: 7integer> E
    assert!(
        obj.symbols.iter().any(|s| s.name == "_XF6squareF7integerE"),
        "symbols: {:?}",
        obj.symbols.iter().map(|s| &s.name).collect::<Vec<_>>()
    );
}
