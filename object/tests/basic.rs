use gantry_codegen::isa::CallConv;
use gantry_codegen::{compile_ir_context, CompileOptions, ObjectFormat};
use gantry_object::{write_coff_x86_64, write_elf_x86_64};

fn compile(src: &str) -> gantry_codegen::binemit::GenericObjectFile {
    let mut ctx = gantry_reader::parse_unit(src).expect("parse failed");
    let opts = CompileOptions::new(CallConv::SystemV, ObjectFormat::Elf);
    compile_ir_context(&mut ctx, &opts).expect("compile failed")
}

#[test]
fn constant_return_elf() {
    let obj = compile("defun main {\nbb0:\n    %0 = imm 42\n    ret %0\n}\n");
    let bytes = write_elf_x86_64(&obj).expect("elf write failed");
    assert_eq!(&bytes[..4], b"\x7fELF");
}

#[test]
fn constant_return_coff() {
    let obj = compile("defun main {\nbb0:\n    %0 = imm 42\n    ret %0\n}\n");
    let bytes = write_coff_x86_64(&obj).expect("coff write failed");
    // COFF machine type for x86-64 is 0x8664, little-endian at offset 0.
    assert_eq!(&bytes[..2], &[0x64, 0x86]);
}

#[test]
fn external_call_with_string() {
    let src = "static msg = \"Hello, world!\"\n\ndeclare puts\n\ndefun main {\nbb0:\n    %0 = static.ref msg\n    %1 = call puts(%0)\n    ret %1\n}\n";
    let obj = compile(src);

    // The string landed NUL-terminated in a read-only section.
    let rodata = obj
        .get_section_by_name(".rodata")
        .expect("missing .rodata section");
    assert_eq!(rodata.size(), "Hello, world!".len() as u64 + 1);

    // One PC-relative relocation against the string, one against puts, and
    // puts is an external symbol.
    assert!(obj.relocs.iter().any(|r| r.sym.name == "msg"));
    assert!(obj.relocs.iter().any(|r| r.sym.name == "puts"));
    let puts = obj
        .symbols
        .iter()
        .find(|s| s.name == "puts")
        .expect("missing puts symbol");
    assert_eq!(puts.kind, gantry_codegen::binemit::SymbolKind::External);

    // And the whole thing serialises.
    let bytes = write_elf_x86_64(&obj).expect("elf write failed");
    assert_eq!(&bytes[..4], b"\x7fELF");
}

#[test]
fn no_local_labels_leak_into_objects() {
    let src = "defun f {\nbb0:\n    %0 = imm 1\n    br.cond %0, bb1, bb2\nbb1:\n    %1 = imm 2\n    ret %1\nbb2:\n    %2 = imm 3\n    ret %2\n}\n";
    let obj = compile(src);
    assert!(obj.symbols.iter().all(|s| !s.name.starts_with(".L")));
    assert!(obj.relocs.iter().all(|r| !r.sym.name.starts_with(".L")));
    write_elf_x86_64(&obj).expect("elf write failed");
}
