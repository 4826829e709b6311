//! x86-64 machine code emission.
//!
//! Converts fully register-allocated MIR into bytes, relocations and symbols
//! in a generic object file. Instructions are assembled from an optional
//! `0x66` operand-size prefix, an optional REX byte, one or two opcode
//! bytes, ModRM, an optional SIB byte, an optional displacement, and an
//! optional immediate.
//!
//! The addressing special cases (Intel SDM Vol. 2A, table 2-5) are all
//! here: RBP/R13 as base with no displacement takes an explicit `disp8=0`,
//! RSP/R12 as base forces a SIB byte, and RIP-relative addressing is
//! `mod=00 rm=101` with the 32-bit displacement carried by a PC-relative
//! relocation.

use crate::binemit::{GenericObjectFile, RelocKind, SymbolKind, SEC_ATTR_WRITABLE};
use crate::ir::{FuncId, Opcode, StaticId, StaticInit};
use crate::isa::x64::abi::{self, FrameKind};
use crate::isa::x64::regs::{Gpr, RegSize};
use crate::isa::x64::{Cond, X64Op};
use crate::isa::CallConv;
use crate::mir::{MFunction, MInst, MOperand, VReg};
use crate::{CodegenError, CodegenResult, Context};
use smallvec::SmallVec;

/// Name of the section module metadata is copied into.
pub const MODULE_SECTION_NAME: &str = ".gantry.module";

fn rex_byte(w: bool, r: bool, x: bool, b: bool) -> u8 {
    0b0100_0000 | ((w as u8) << 3) | ((r as u8) << 2) | ((x as u8) << 1) | (b as u8)
}

fn rexw_byte() -> u8 {
    rex_byte(true, false, false, false)
}

fn modrm_byte(m0d: u8, reg: u8, rm: u8) -> u8 {
    debug_assert!(m0d < 4);
    (m0d << 6) | ((reg & 0b111) << 3) | (rm & 0b111)
}

fn sib_byte(scale: u8, index: u8, base: u8) -> u8 {
    debug_assert!(scale < 4);
    (scale << 6) | ((index & 0b111) << 3) | (base & 0b111)
}

/// An 8-bit register access to SPL/BPL/SIL/DIL needs an explicit REX prefix
/// to select the low byte rather than AH..BH.
fn needs_rex_for_8bit(enc: u8) -> bool {
    (4..=7).contains(&enc)
}

/// The ModRM/SIB/displacement tail for a `[base + disp]` memory operand.
///
/// Zero displacements are omitted unless the base is RBP or R13, which
/// require `mod=01 disp8=0`; RSP and R12 as base force a SIB byte.
fn mem_encoding(reg_field: u8, base: Gpr, disp: i64) -> SmallVec<[u8; 6]> {
    let mut out = SmallVec::new();
    let base_bits = base.regbits();
    let disp = i32::try_from(disp).expect("displacement does not fit in 32 bits");

    // Pick the mod field: no displacement, disp8, or disp32. RBP and R13
    // cannot be encoded without a displacement.
    let force_disp8 = disp == 0 && base_bits & 0b111 == 0b101;
    let (m0d, disp_bytes): (u8, SmallVec<[u8; 4]>) = if disp == 0 && !force_disp8 {
        (0b00, SmallVec::new())
    } else if (-128..=127).contains(&disp) || force_disp8 {
        (0b01, SmallVec::from_slice(&[(disp as i8) as u8]))
    } else {
        (0b10, SmallVec::from_slice(&disp.to_le_bytes()))
    };

    if base_bits & 0b111 == 0b100 {
        // RSP/R12 as base: SIB with no index.
        out.push(modrm_byte(m0d, reg_field, 0b100));
        out.push(sib_byte(0b00, 0b100, base_bits));
    } else {
        out.push(modrm_byte(m0d, reg_field, base_bits));
    }
    out.extend_from_slice(&disp_bytes);
    out
}

fn gpr(reg: VReg) -> CodegenResult<Gpr> {
    Gpr::from_vreg(reg).ok_or_else(|| {
        CodegenError::Unimplemented(format!(
            "register allocation left virtual register {reg} in the machine code"
        ))
    })
}

/// Emit a context's machine functions, statics and metadata into `obj`,
/// then resolve and strip all `.L*` local labels.
pub fn emit_object(
    ctx: &Context,
    mfuncs: &[MFunction],
    cc: CallConv,
    obj: &mut GenericObjectFile,
) -> CodegenResult<()> {
    // Module metadata. The serialised byte layout belongs to the module
    // serialiser; we only copy bytes.
    if ctx.module.is_module && !ctx.module.metadata.is_empty() {
        let section = obj.get_or_create_section(MODULE_SECTION_NAME, 0);
        section.write_bytes(&ctx.module.metadata);
    }

    emit_statics(ctx, obj);

    let mut emitter = Emitter { ctx, cc, obj };
    for mfunc in mfuncs {
        emitter.emit_function(mfunc)?;
    }

    resolve_local_labels(obj)?;
    Ok(())
}

/// Emit static variables into data sections with their symbols.
fn emit_statics(ctx: &Context, obj: &mut GenericObjectFile) {
    for var in ctx.statics.values() {
        let kind = match var.linkage {
            crate::ir::Linkage::Exported => SymbolKind::Export,
            crate::ir::Linkage::Local => SymbolKind::Static,
        };
        match &var.init {
            Some(StaticInit::String(s)) => {
                let bytes = ctx.module.str(*s).as_bytes().to_vec();
                let section = obj.get_or_create_section(".rodata", 0);
                let offset = section.size();
                section.write_bytes(&bytes);
                section.write_u8(0);
                push_symbol(obj, kind, &var.name, ".rodata", offset);
            }
            Some(StaticInit::Integer(v)) => {
                let section = obj.get_or_create_section(".data", SEC_ATTR_WRITABLE);
                let offset = section.size();
                section.write_u64_le(*v);
                push_symbol(obj, kind, &var.name, ".data", offset);
            }
            None => {
                let size = ctx.module.type_sizeof(var.ty);
                let section = obj.get_or_create_section(".data", SEC_ATTR_WRITABLE);
                let offset = section.size();
                for _ in 0..size {
                    section.write_u8(0);
                }
                push_symbol(obj, kind, &var.name, ".data", offset);
            }
        }
    }
}

fn push_symbol(
    obj: &mut GenericObjectFile,
    kind: SymbolKind,
    name: &str,
    section: &str,
    offset: u64,
) {
    obj.symbols.push(crate::binemit::Symbol {
        kind,
        name: name.to_string(),
        section_name: section.to_string(),
        byte_offset: offset,
    });
}

struct Emitter<'a> {
    ctx: &'a Context,
    cc: CallConv,
    obj: &'a mut GenericObjectFile,
}

impl<'a> Emitter<'a> {
    fn put(&mut self, bytes: &[u8]) {
        self.obj.code_bytes(bytes);
    }

    fn put1(&mut self, b: u8) {
        self.obj.code_u8(b);
    }

    fn reloc(&mut self, kind: RelocKind, name: &str, sym_kind: SymbolKind) {
        self.obj.reloc_at_code_end(kind, name, sym_kind);
        self.put(&[0, 0, 0, 0]);
    }

    fn func_name(&self, func: FuncId) -> &str {
        &self.ctx.functions[func].name
    }

    fn static_name(&self, var: StaticId) -> &str {
        &self.ctx.statics[var].name
    }

    fn unhandled(&self, inst: &MInst) -> CodegenError {
        CodegenError::Unimplemented(format!(
            "x86-64 emission for {:?} with operands {:?}",
            inst.opcode, inst.operands
        ))
    }

    fn emit_function(&mut self, mfunc: &MFunction) -> CodegenResult<()> {
        let func = &self.ctx.functions[mfunc.func];

        let kind = if func.is_declaration() {
            SymbolKind::External
        } else {
            SymbolKind::Function
        };
        self.obj.add_code_symbol(kind, mfunc.name.clone());
        if func.is_declaration() {
            return Ok(());
        }

        let frame_size: i64 = mfunc.frame_objects.iter().map(|fo| fo.size as i64).sum();
        let is_leaf = func.attrs.leaf || !has_calls(func);
        let frame_kind = abi::frame_kind(mfunc, is_leaf);

        match frame_kind {
            FrameKind::None => {}
            FrameKind::Minimal => {
                self.imm_to_reg(
                    X64Op::Sub,
                    abi::align_to(frame_size, 16) + 8,
                    Gpr::Rsp,
                    RegSize::R64,
                )?;
            }
            FrameKind::Full => {
                self.unary_reg(X64Op::Push, Gpr::Rbp, RegSize::R64)?;
                self.reg_to_reg(X64Op::Mov, Gpr::Rsp, RegSize::R64, Gpr::Rbp, RegSize::R64)?;
                if frame_size != 0 {
                    self.imm_to_reg(
                        X64Op::Sub,
                        abi::align_to(frame_size, 16),
                        Gpr::Rsp,
                        RegSize::R64,
                    )?;
                }
            }
        }

        for block in &mfunc.blocks {
            self.obj
                .add_code_symbol(SymbolKind::Static, block.name.clone());
            for inst in &block.insts {
                self.emit_inst(mfunc, inst, frame_kind, frame_size)?;
            }
        }
        Ok(())
    }

    fn emit_inst(
        &mut self,
        mfunc: &MFunction,
        inst: &MInst,
        frame_kind: FrameKind,
        frame_size: i64,
    ) -> CodegenResult<()> {
        use MOperand as O;

        let op = match X64Op::from_opcode(inst.opcode) {
            Some(op) => op,
            None => {
                return Err(CodegenError::Unimplemented(format!(
                    "instruction selection has not lowered a general MIR instruction: {:?}",
                    inst.opcode
                )))
            }
        };

        match op {
            X64Op::Mov | X64Op::Imul | X64Op::And | X64Op::Or | X64Op::Xor | X64Op::Add
            | X64Op::Sub | X64Op::Cmp | X64Op::Test => match inst.operands.as_slice() {
                [O::Imm(imm), O::Reg { reg, size }] => {
                    let size = RegSize::from_bytes(*size);
                    self.imm_to_reg(op, *imm, gpr(*reg)?, size)
                }
                [O::Reg { reg: src, size: ssize }, O::Reg { reg: dst, size: dsize }] => {
                    let ssize = RegSize::from_bytes(*ssize);
                    let dsize = RegSize::from_bytes(*dsize);
                    // A narrow destination must be cleared first; the 32-bit
                    // operation's implicit zero-extension handles the rest.
                    if op == X64Op::Mov && matches!(dsize, RegSize::R8 | RegSize::R16) {
                        self.imm_to_reg(X64Op::Mov, 0, gpr(*dst)?, RegSize::R32)?;
                    }
                    self.reg_to_reg(op, gpr(*src)?, ssize, gpr(*dst)?, dsize)
                }
                [O::Imm(imm), O::Reg { reg: addr, .. }, O::Imm(offset), O::Imm(size)] => self
                    .imm_to_mem(
                        op,
                        *imm,
                        gpr(*addr)?,
                        *offset,
                        RegSize::from_bytes(*size as u8),
                    ),
                [O::Reg { reg: src, size }, O::Reg { reg: addr, .. }, O::Imm(offset)] => self
                    .reg_to_mem(
                        op,
                        gpr(*src)?,
                        RegSize::from_bytes(*size),
                        gpr(*addr)?,
                        *offset,
                    ),
                [O::Reg { reg: addr, .. }, O::Imm(offset), O::Reg { reg: dst, .. }, O::Imm(size)] => {
                    self.mem_to_reg(
                        op,
                        gpr(*addr)?,
                        *offset,
                        gpr(*dst)?,
                        RegSize::from_bytes(*size as u8),
                    )
                }
                [O::Static(var), O::Reg { reg: dst, size }] => {
                    let name = self.static_name(*var).to_string();
                    self.name_to_reg(op, &name, gpr(*dst)?, RegSize::from_bytes(*size))
                }
                [O::Reg { reg: src, size }, O::Static(var)] => {
                    let name = self.static_name(*var).to_string();
                    self.reg_to_name(op, gpr(*src)?, RegSize::from_bytes(*size), &name)
                }
                _ => Err(self.unhandled(inst)),
            },

            X64Op::Lea => match inst.operands.as_slice() {
                [O::Reg { reg: base, .. }, O::Imm(offset)] => {
                    let dst = gpr(inst.vreg)?;
                    self.mem_to_reg(X64Op::Lea, gpr(*base)?, *offset, dst, RegSize::R64)
                }
                [O::Static(var), O::Reg { reg: dst, size }] => {
                    let size = RegSize::from_bytes(*size);
                    let dst = gpr(*dst)?;
                    if matches!(size, RegSize::R8 | RegSize::R16) {
                        self.imm_to_reg(X64Op::Mov, 0, dst, RegSize::R32)?;
                    }
                    let name = self.static_name(*var).to_string();
                    // The address of an array-typed static is the array
                    // itself; the array-to-pointer adjustment stays here
                    // rather than in an earlier lowering.
                    self.name_to_reg(X64Op::Lea, &name, dst, size.max(RegSize::R32))
                }
                [O::Func(f), O::Reg { reg: dst, size }] => {
                    let size = RegSize::from_bytes(*size);
                    let dst = gpr(*dst)?;
                    if matches!(size, RegSize::R8 | RegSize::R16) {
                        self.imm_to_reg(X64Op::Mov, 0, dst, RegSize::R32)?;
                    }
                    let name = self.func_name(*f).to_string();
                    self.name_to_reg(X64Op::Lea, &name, dst, size.max(RegSize::R32))
                }
                _ => Err(self.unhandled(inst)),
            },

            X64Op::Not | X64Op::Idiv | X64Op::Div => match inst.operands.as_slice() {
                [O::Reg { reg, size }] => {
                    self.unary_reg(op, gpr(*reg)?, RegSize::from_bytes(*size))
                }
                _ => Err(self.unhandled(inst)),
            },

            X64Op::Shl | X64Op::Shr | X64Op::Sar => match inst.operands.as_slice() {
                [O::Reg { reg, size }] => {
                    self.shift_reg(op, gpr(*reg)?, RegSize::from_bytes(*size))
                }
                _ => Err(self.unhandled(inst)),
            },

            X64Op::Push => match inst.operands.as_slice() {
                [O::Reg { reg, size }] => {
                    self.unary_reg(X64Op::Push, gpr(*reg)?, RegSize::from_bytes(*size))
                }
                [O::Imm(imm)] => {
                    // push imm32
                    self.put1(0x68);
                    self.put(&(*imm as i32).to_le_bytes());
                    Ok(())
                }
                _ => Err(self.unhandled(inst)),
            },

            X64Op::Pop => match inst.operands.as_slice() {
                [O::Reg { reg, size }] => {
                    self.unary_reg(X64Op::Pop, gpr(*reg)?, RegSize::from_bytes(*size))
                }
                _ => Err(self.unhandled(inst)),
            },

            X64Op::Call => self.emit_call(mfunc, inst),

            X64Op::Jmp => match inst.operands.as_slice() {
                [O::Block(block)] => {
                    let name = mfunc.blocks[mfunc.block_index[*block] as usize].name.clone();
                    self.put1(0xe9);
                    self.reloc(RelocKind::Disp32PcRel, &name, SymbolKind::None);
                    Ok(())
                }
                [O::Func(f)] => {
                    let name = self.func_name(*f).to_string();
                    self.put1(0xe9);
                    self.reloc(RelocKind::Disp32PcRel, &name, SymbolKind::Function);
                    Ok(())
                }
                [O::Reg { reg, .. }] => {
                    // jmp r/m64: FF /4
                    let reg = gpr(*reg)?;
                    if reg.needs_rex_bit() {
                        self.put1(rex_byte(false, false, false, true));
                    }
                    self.put(&[0xff, modrm_byte(0b11, 4, reg.regbits())]);
                    Ok(())
                }
                _ => Err(self.unhandled(inst)),
            },

            X64Op::Jcc => match inst.operands.as_slice() {
                [O::Imm(cc), O::Block(block)] => {
                    let cond = Cond::from_imm(*cc)
                        .ok_or_else(|| self.unhandled(inst))?;
                    let name = mfunc.blocks[mfunc.block_index[*block] as usize].name.clone();
                    self.jcc(cond, &name)
                }
                _ => Err(self.unhandled(inst)),
            },

            X64Op::Setcc => match inst.operands.as_slice() {
                [O::Imm(cc), O::Reg { reg, .. }] => {
                    let cond = Cond::from_imm(*cc)
                        .ok_or_else(|| self.unhandled(inst))?;
                    self.setcc(cond, gpr(*reg)?)
                }
                _ => Err(self.unhandled(inst)),
            },

            X64Op::Cwd => {
                self.put(&[0x66, 0x99]);
                Ok(())
            }
            X64Op::Cdq => {
                self.put1(0x99);
                Ok(())
            }
            X64Op::Cqo => {
                self.put(&[rexw_byte(), 0x99]);
                Ok(())
            }

            X64Op::Ret => {
                match frame_kind {
                    FrameKind::None => {}
                    FrameKind::Full => {
                        self.reg_to_reg(X64Op::Mov, Gpr::Rbp, RegSize::R64, Gpr::Rsp, RegSize::R64)?;
                        self.unary_reg(X64Op::Pop, Gpr::Rbp, RegSize::R64)?;
                    }
                    FrameKind::Minimal => {
                        self.imm_to_reg(
                            X64Op::Add,
                            abi::align_to(frame_size, 16) + 8,
                            Gpr::Rsp,
                            RegSize::R64,
                        )?;
                    }
                }
                self.put1(0xc3);
                Ok(())
            }

            X64Op::Syscall => {
                self.put(&[0x0f, 0x05]);
                Ok(())
            }
            X64Op::Ud2 => {
                self.put(&[0x0f, 0x0b]);
                Ok(())
            }
            X64Op::Int3 => {
                self.put1(0xcc);
                Ok(())
            }

            X64Op::Movzx | X64Op::Movsx => match inst.operands.as_slice() {
                [O::Reg { reg: src, size: ssize }, O::Reg { reg: dst, size: dsize }] => self
                    .extend_reg(
                        op,
                        gpr(*src)?,
                        RegSize::from_bytes(*ssize),
                        gpr(*dst)?,
                        RegSize::from_bytes(*dsize),
                    ),
                _ => Err(self.unhandled(inst)),
            },

            X64Op::Xchg => match inst.operands.as_slice() {
                [O::Reg { reg: src, size: ssize }, O::Reg { reg: dst, size: dsize }] => {
                    let (ssize, dsize) = (RegSize::from_bytes(*ssize), RegSize::from_bytes(*dsize));
                    if ssize != dsize {
                        return Err(self.unhandled(inst));
                    }
                    let (src, dst) = (gpr(*src)?, gpr(*dst)?);
                    let modrm = modrm_byte(0b11, src.regbits(), dst.regbits());
                    match dsize {
                        RegSize::R8 => {
                            if src.needs_rex_bit()
                                || dst.needs_rex_bit()
                                || needs_rex_for_8bit(src.regbits())
                                || needs_rex_for_8bit(dst.regbits())
                            {
                                self.put1(rex_byte(
                                    false,
                                    src.needs_rex_bit(),
                                    false,
                                    dst.needs_rex_bit(),
                                ));
                            }
                            self.put(&[0x86, modrm]);
                        }
                        RegSize::R16 => {
                            self.put1(0x66);
                            self.maybe_rex(false, src, dst);
                            self.put(&[0x87, modrm]);
                        }
                        RegSize::R32 => {
                            self.maybe_rex(false, src, dst);
                            self.put(&[0x87, modrm]);
                        }
                        RegSize::R64 => {
                            self.put1(rex_byte(
                                true,
                                src.needs_rex_bit(),
                                false,
                                dst.needs_rex_bit(),
                            ));
                            self.put(&[0x87, modrm]);
                        }
                    }
                    Ok(())
                }
                _ => Err(self.unhandled(inst)),
            },
        }
    }

    /// Emit a REX prefix if either register's top encoding bit needs it.
    fn maybe_rex(&mut self, w: bool, reg_field: Gpr, rm_field: Gpr) {
        if w || reg_field.needs_rex_bit() || rm_field.needs_rex_bit() {
            self.put1(rex_byte(
                w,
                reg_field.needs_rex_bit(),
                false,
                rm_field.needs_rex_bit(),
            ));
        }
    }

    /// Call sites: inject argument copies into the convention's argument
    /// registers, spill caller-saved registers that are in use around the
    /// call, and emit the call itself.
    fn emit_call(&mut self, mfunc: &MFunction, inst: &MInst) -> CodegenResult<()> {
        use MOperand as O;

        let arg_regs = abi::argument_registers(self.cc);
        let args = &inst.operands[1..];
        if args.len() > arg_regs.len() {
            return Err(CodegenError::Unimplemented(format!(
                "passing {} call arguments on the stack",
                args.len() - arg_regs.len()
            )));
        }

        // Registers in use that the callee may clobber. The result register
        // is excluded: it carries the return value out of the call.
        let saved: Vec<Gpr> = abi::caller_saved(self.cc)
            .iter()
            .copied()
            .filter(|&r| r != abi::RESULT_REGISTER && mfunc.registers_used & (1 << r) != 0)
            .map(|r| Gpr::from_vreg(r).unwrap())
            .collect();

        for &reg in &saved {
            self.unary_reg(X64Op::Push, reg, RegSize::R64)?;
        }

        for (i, arg) in args.iter().enumerate() {
            let dst = Gpr::from_vreg(arg_regs[i]).unwrap();
            match arg {
                O::Reg { reg, .. } => {
                    self.reg_to_reg(X64Op::Mov, gpr(*reg)?, RegSize::R64, dst, RegSize::R64)?;
                }
                O::Imm(imm) => {
                    self.imm_to_reg(X64Op::Mov, *imm, dst, RegSize::R64)?;
                }
                _ => {
                    return Err(CodegenError::Unimplemented(format!(
                        "call argument operand {arg:?}"
                    )))
                }
            }
        }

        match &inst.operands[0] {
            O::Func(f) => {
                let func = &self.ctx.functions[*f];
                let sym_kind = if func.is_declaration() {
                    SymbolKind::External
                } else {
                    SymbolKind::Function
                };
                let name = func.name.clone();
                self.put1(0xe8);
                self.reloc(RelocKind::Disp32PcRel, &name, sym_kind);
            }
            O::Reg { reg, .. } => {
                // call r/m64: FF /2
                let reg = gpr(*reg)?;
                if reg.needs_rex_bit() {
                    self.put1(rex_byte(false, false, false, true));
                }
                self.put(&[0xff, modrm_byte(0b11, 2, reg.regbits())]);
            }
            other => {
                return Err(CodegenError::Unimplemented(format!(
                    "call through operand {other:?}"
                )))
            }
        }

        for &reg in saved.iter().rev() {
            self.unary_reg(X64Op::Pop, reg, RegSize::R64)?;
        }
        Ok(())
    }

    /// `op imm, reg`.
    fn imm_to_reg(
        &mut self,
        op: X64Op,
        imm: i64,
        dst: Gpr,
        size: RegSize,
    ) -> CodegenResult<()> {
        // Adding or subtracting zero changes nothing.
        if matches!(op, X64Op::Add | X64Op::Sub) && imm == 0 {
            return Ok(());
        }
        let bits = dst.regbits();
        let b = dst.needs_rex_bit();

        match op {
            X64Op::Mov => {
                // A 64-bit move of an immediate that fits in a signed
                // doubleword uses the 32-bit form; implicit zero-extension
                // does the rest.
                let size = if size == RegSize::R64
                    && i32::try_from(imm).is_ok()
                {
                    RegSize::R32
                } else {
                    size
                };
                match size {
                    RegSize::R8 => {
                        // b0+rb ib
                        if b || needs_rex_for_8bit(bits) {
                            self.put1(rex_byte(false, false, false, b));
                        }
                        self.put(&[0xb0 + (bits & 0b111), imm as i8 as u8]);
                    }
                    RegSize::R16 => {
                        // 66 b8+rw iw
                        self.put1(0x66);
                        if b {
                            self.put1(rex_byte(false, false, false, b));
                        }
                        self.put1(0xb8 + (bits & 0b111));
                        self.put(&(imm as i16).to_le_bytes());
                    }
                    RegSize::R32 => {
                        // b8+rd id
                        if b {
                            self.put1(rex_byte(false, false, false, b));
                        }
                        self.put1(0xb8 + (bits & 0b111));
                        self.put(&(imm as i32).to_le_bytes());
                    }
                    RegSize::R64 => {
                        // REX.W b8+rd io
                        self.put1(rex_byte(true, false, false, b));
                        self.put1(0xb8 + (bits & 0b111));
                        self.put(&imm.to_le_bytes());
                    }
                }
                Ok(())
            }

            X64Op::Imul => {
                // 69 /r iw|id with the destination in both ModRM fields.
                let modrm = modrm_byte(0b11, bits, bits);
                match size {
                    RegSize::R8 | RegSize::R16 => {
                        self.put1(0x66);
                        if b {
                            self.put1(rex_byte(false, b, false, b));
                        }
                        self.put(&[0x69, modrm]);
                        self.put(&(imm as i16).to_le_bytes());
                    }
                    RegSize::R32 => {
                        if b {
                            self.put1(rex_byte(false, b, false, b));
                        }
                        self.put(&[0x69, modrm]);
                        self.put(&(imm as i32).to_le_bytes());
                    }
                    RegSize::R64 => {
                        self.put1(rex_byte(true, b, false, b));
                        self.put(&[0x69, modrm]);
                        self.put(&(imm as i32).to_le_bytes());
                    }
                }
                Ok(())
            }

            X64Op::Add | X64Op::Or | X64Op::And | X64Op::Sub | X64Op::Cmp | X64Op::Xor => {
                // The 80/81/83 family, selected by an opcode extension in
                // ModRM.reg; short immediates take the sign-extended /ib
                // form.
                let extension = match op {
                    X64Op::Add => 0,
                    X64Op::Or => 1,
                    X64Op::And => 4,
                    X64Op::Sub => 5,
                    X64Op::Xor => 6,
                    X64Op::Cmp => 7,
                    _ => unreachable!(),
                };
                let modrm = modrm_byte(0b11, extension, bits);
                let short = (-128..=127).contains(&imm);
                match size {
                    RegSize::R8 => {
                        if b || needs_rex_for_8bit(bits) {
                            self.put1(rex_byte(false, false, false, b));
                        }
                        self.put(&[0x80, modrm, imm as i8 as u8]);
                    }
                    RegSize::R16 => {
                        self.put1(0x66);
                        if b {
                            self.put1(rex_byte(false, false, false, b));
                        }
                        if short {
                            self.put(&[0x83, modrm, imm as i8 as u8]);
                        } else {
                            self.put(&[0x81, modrm]);
                            self.put(&(imm as i16).to_le_bytes());
                        }
                    }
                    RegSize::R32 | RegSize::R64 => {
                        let w = size == RegSize::R64;
                        if w || b {
                            self.put1(rex_byte(w, false, false, b));
                        }
                        if short {
                            self.put(&[0x83, modrm, imm as i8 as u8]);
                        } else {
                            self.put(&[0x81, modrm]);
                            self.put(&(imm as i32).to_le_bytes());
                        }
                    }
                }
                Ok(())
            }

            _ => Err(CodegenError::Unimplemented(format!(
                "{op:?} in imm-to-reg form"
            ))),
        }
    }

    /// `op imm, [addr + offset]` with an explicit access size.
    fn imm_to_mem(
        &mut self,
        op: X64Op,
        imm: i64,
        addr: Gpr,
        offset: i64,
        size: RegSize,
    ) -> CodegenResult<()> {
        let b = addr.needs_rex_bit();
        match op {
            X64Op::Mov => {
                // c6/c7 /0
                match size {
                    RegSize::R8 => {
                        if b {
                            self.put1(rex_byte(false, false, false, b));
                        }
                        self.put1(0xc6);
                        let tail = mem_encoding(0, addr, offset);
                        self.put(&tail);
                        self.put1(imm as i8 as u8);
                    }
                    RegSize::R16 => {
                        self.put1(0x66);
                        if b {
                            self.put1(rex_byte(false, false, false, b));
                        }
                        self.put1(0xc7);
                        let tail = mem_encoding(0, addr, offset);
                        self.put(&tail);
                        self.put(&(imm as i16).to_le_bytes());
                    }
                    RegSize::R32 | RegSize::R64 => {
                        let w = size == RegSize::R64;
                        if w || b {
                            self.put1(rex_byte(w, false, false, b));
                        }
                        self.put1(0xc7);
                        let tail = mem_encoding(0, addr, offset);
                        self.put(&tail);
                        self.put(&(imm as i32).to_le_bytes());
                    }
                }
                Ok(())
            }

            X64Op::Add | X64Op::Or | X64Op::And | X64Op::Sub | X64Op::Cmp => {
                let extension = match op {
                    X64Op::Add => 0,
                    X64Op::Or => 1,
                    X64Op::And => 4,
                    X64Op::Sub => 5,
                    X64Op::Cmp => 7,
                    _ => unreachable!(),
                };
                let w = size == RegSize::R64;
                if size == RegSize::R16 {
                    self.put1(0x66);
                }
                if w || b {
                    self.put1(rex_byte(w, false, false, b));
                }
                let short = (-128..=127).contains(&imm);
                let opcode = match (size, short) {
                    (RegSize::R8, _) => 0x80,
                    (_, true) => 0x83,
                    (_, false) => 0x81,
                };
                self.put1(opcode);
                let tail = mem_encoding(extension, addr, offset);
                self.put(&tail);
                if size == RegSize::R8 || short {
                    self.put1(imm as i8 as u8);
                } else if size == RegSize::R16 {
                    self.put(&(imm as i16).to_le_bytes());
                } else {
                    self.put(&(imm as i32).to_le_bytes());
                }
                Ok(())
            }

            _ => Err(CodegenError::Unimplemented(format!(
                "{op:?} in imm-to-mem form"
            ))),
        }
    }

    /// `op [addr + offset], reg`.
    fn mem_to_reg(
        &mut self,
        op: X64Op,
        addr: Gpr,
        offset: i64,
        dst: Gpr,
        size: RegSize,
    ) -> CodegenResult<()> {
        let opcode: &[u8] = match (op, size) {
            (X64Op::Lea, RegSize::R8) => {
                return Err(CodegenError::Unimplemented(
                    "LEA does not have an 8-bit encoding".to_string(),
                ))
            }
            (X64Op::Lea, _) => &[0x8d],
            (X64Op::Mov, RegSize::R8) => &[0x8a],
            (X64Op::Mov, _) => &[0x8b],
            _ => {
                return Err(CodegenError::Unimplemented(format!(
                    "{op:?} in mem-to-reg form"
                )))
            }
        };

        if size == RegSize::R16 {
            self.put1(0x66);
        }
        let w = size == RegSize::R64;
        if w || addr.needs_rex_bit() || dst.needs_rex_bit() {
            self.put1(rex_byte(w, dst.needs_rex_bit(), false, addr.needs_rex_bit()));
        }
        self.put(opcode);
        let tail = mem_encoding(dst.regbits(), addr, offset);
        self.put(&tail);
        Ok(())
    }

    /// `op reg, [addr + offset]`.
    fn reg_to_mem(
        &mut self,
        op: X64Op,
        src: Gpr,
        size: RegSize,
        addr: Gpr,
        offset: i64,
    ) -> CodegenResult<()> {
        let opcode: &[u8] = match (op, size) {
            (X64Op::Mov, RegSize::R8) => &[0x88],
            (X64Op::Mov, _) => &[0x89],
            _ => {
                return Err(CodegenError::Unimplemented(format!(
                    "{op:?} in reg-to-mem form"
                )))
            }
        };

        if size == RegSize::R16 {
            self.put1(0x66);
        }
        let w = size == RegSize::R64;
        if w
            || addr.needs_rex_bit()
            || src.needs_rex_bit()
            || (size == RegSize::R8 && needs_rex_for_8bit(src.regbits()))
        {
            self.put1(rex_byte(w, src.needs_rex_bit(), false, addr.needs_rex_bit()));
        }
        self.put(opcode);
        let tail = mem_encoding(src.regbits(), addr, offset);
        self.put(&tail);
        Ok(())
    }

    /// `op name(%rip), reg`: RIP-relative with a PC-relative relocation.
    fn name_to_reg(
        &mut self,
        op: X64Op,
        name: &str,
        dst: Gpr,
        size: RegSize,
    ) -> CodegenResult<()> {
        let opcode: u8 = match op {
            X64Op::Lea => 0x8d,
            X64Op::Mov => {
                if size == RegSize::R8 {
                    0x8a
                } else {
                    0x8b
                }
            }
            _ => {
                return Err(CodegenError::Unimplemented(format!(
                    "{op:?} in name-to-reg form"
                )))
            }
        };

        if size == RegSize::R16 {
            self.put1(0x66);
        }
        let w = size == RegSize::R64;
        if w || dst.needs_rex_bit() {
            self.put1(rex_byte(w, dst.needs_rex_bit(), false, false));
        }
        self.put1(opcode);
        // mod=00, rm=101: RIP-relative with a disp32.
        self.put1(modrm_byte(0b00, dst.regbits(), 0b101));
        self.reloc(RelocKind::Disp32PcRel, name, SymbolKind::None);
        Ok(())
    }

    /// `op reg, name(%rip)`.
    fn reg_to_name(
        &mut self,
        op: X64Op,
        src: Gpr,
        size: RegSize,
        name: &str,
    ) -> CodegenResult<()> {
        let opcode: u8 = match op {
            X64Op::Mov => {
                if size == RegSize::R8 {
                    0x88
                } else {
                    0x89
                }
            }
            _ => {
                return Err(CodegenError::Unimplemented(format!(
                    "{op:?} in reg-to-name form"
                )))
            }
        };

        if size == RegSize::R16 {
            self.put1(0x66);
        }
        let w = size == RegSize::R64;
        if w || src.needs_rex_bit() || (size == RegSize::R8 && needs_rex_for_8bit(src.regbits())) {
            self.put1(rex_byte(w, src.needs_rex_bit(), false, false));
        }
        self.put1(opcode);
        self.put1(modrm_byte(0b00, src.regbits(), 0b101));
        self.reloc(RelocKind::Disp32PcRel, name, SymbolKind::None);
        Ok(())
    }

    /// `op reg, reg`.
    fn reg_to_reg(
        &mut self,
        op: X64Op,
        src: Gpr,
        ssize: RegSize,
        dst: Gpr,
        dsize: RegSize,
    ) -> CodegenResult<()> {
        // Moves from a register to itself are dropped.
        if op == X64Op::Mov && src == dst && ssize == dsize {
            return Ok(());
        }

        if op == X64Op::Imul {
            // 0f af /r, destination in ModRM.reg.
            debug_assert_eq!(ssize, dsize);
            let modrm = modrm_byte(0b11, dst.regbits(), src.regbits());
            match dsize {
                RegSize::R8 => {
                    return Err(CodegenError::Unimplemented(
                        "IMUL has no 8-bit reg-reg encoding".to_string(),
                    ))
                }
                RegSize::R16 => {
                    self.put1(0x66);
                    self.maybe_rex(false, dst, src);
                }
                RegSize::R32 => self.maybe_rex(false, dst, src),
                RegSize::R64 => self.maybe_rex(true, dst, src),
            }
            self.put(&[0x0f, 0xaf, modrm]);
            return Ok(());
        }

        debug_assert_eq!(
            ssize, dsize,
            "reg-to-reg {op:?} requires equal operand sizes"
        );
        let (op8, opwide): (u8, u8) = match op {
            X64Op::Mov => (0x88, 0x89),
            X64Op::Add => (0x00, 0x01),
            X64Op::Or => (0x08, 0x09),
            X64Op::And => (0x20, 0x21),
            X64Op::Sub => (0x28, 0x29),
            X64Op::Xor => (0x30, 0x31),
            X64Op::Cmp => (0x38, 0x39),
            X64Op::Test => (0x84, 0x85),
            _ => {
                return Err(CodegenError::Unimplemented(format!(
                    "{op:?} in reg-to-reg form"
                )))
            }
        };

        let modrm = modrm_byte(0b11, src.regbits(), dst.regbits());
        match dsize {
            RegSize::R8 => {
                if src.needs_rex_bit()
                    || dst.needs_rex_bit()
                    || needs_rex_for_8bit(src.regbits())
                    || needs_rex_for_8bit(dst.regbits())
                {
                    self.put1(rex_byte(
                        false,
                        src.needs_rex_bit(),
                        false,
                        dst.needs_rex_bit(),
                    ));
                }
                self.put(&[op8, modrm]);
            }
            RegSize::R16 => {
                self.put1(0x66);
                self.maybe_rex(false, src, dst);
                self.put(&[opwide, modrm]);
            }
            RegSize::R32 => {
                self.maybe_rex(false, src, dst);
                self.put(&[opwide, modrm]);
            }
            RegSize::R64 => {
                self.put1(rex_byte(
                    true,
                    src.needs_rex_bit(),
                    false,
                    dst.needs_rex_bit(),
                ));
                self.put(&[opwide, modrm]);
            }
        }
        Ok(())
    }

    /// `movzx`/`movsx reg, reg`: the source must be narrower than the
    /// destination.
    fn extend_reg(
        &mut self,
        op: X64Op,
        src: Gpr,
        ssize: RegSize,
        dst: Gpr,
        dsize: RegSize,
    ) -> CodegenResult<()> {
        if ssize >= dsize {
            return Err(CodegenError::Unimplemented(format!(
                "{op:?} requires the source to be narrower than the destination"
            )));
        }
        // ModRM.reg is the destination for the 0f b6/b7/be/bf family.
        let modrm = modrm_byte(0b11, dst.regbits(), src.regbits());
        let w = dsize == RegSize::R64;

        match (op, ssize) {
            (X64Op::Movsx, RegSize::R32) => {
                // movsxd: REX.W 63 /r
                self.put(&[rex_byte(true, dst.needs_rex_bit(), false, src.needs_rex_bit())]);
                self.put(&[0x63, modrm]);
                return Ok(());
            }
            (X64Op::Movzx, RegSize::R32) => {
                return Err(CodegenError::Unimplemented(
                    "movzx has no 32-bit source encoding; a 32-bit move zero-extends".to_string(),
                ))
            }
            _ => {}
        }

        let second: u8 = match (op, ssize) {
            (X64Op::Movzx, RegSize::R8) => 0xb6,
            (X64Op::Movzx, RegSize::R16) => 0xb7,
            (X64Op::Movsx, RegSize::R8) => 0xbe,
            (X64Op::Movsx, RegSize::R16) => 0xbf,
            _ => {
                return Err(CodegenError::Unimplemented(format!(
                    "{op:?} from {ssize:?}"
                )))
            }
        };

        if dsize == RegSize::R16 {
            self.put1(0x66);
        }
        if w
            || src.needs_rex_bit()
            || dst.needs_rex_bit()
            || (ssize == RegSize::R8 && needs_rex_for_8bit(src.regbits()))
        {
            self.put1(rex_byte(w, dst.needs_rex_bit(), false, src.needs_rex_bit()));
        }
        self.put(&[0x0f, second, modrm]);
        Ok(())
    }

    /// Single-register forms: push, pop, not, idiv, div.
    fn unary_reg(&mut self, op: X64Op, reg: Gpr, size: RegSize) -> CodegenResult<()> {
        let bits = reg.regbits();
        let b = reg.needs_rex_bit();

        match op {
            X64Op::Push | X64Op::Pop => {
                let base: u8 = if op == X64Op::Push { 0x50 } else { 0x58 };
                match size {
                    RegSize::R16 => {
                        self.put1(0x66);
                        if b {
                            self.put1(rex_byte(false, false, false, b));
                        }
                        self.put1(base + (bits & 0b111));
                    }
                    RegSize::R64 => {
                        if b {
                            self.put1(rex_byte(false, false, false, b));
                        }
                        self.put1(base + (bits & 0b111));
                    }
                    _ => {
                        return Err(CodegenError::Unimplemented(format!(
                            "{op:?} of a {}-byte register",
                            size.bytes()
                        )))
                    }
                }
                Ok(())
            }

            X64Op::Not | X64Op::Idiv | X64Op::Div => {
                // f6/f7 family: NOT /2, DIV /6, IDIV /7.
                let extension = match op {
                    X64Op::Not => 2,
                    X64Op::Div => 6,
                    X64Op::Idiv => 7,
                    _ => unreachable!(),
                };
                let modrm = modrm_byte(0b11, extension, bits);
                match size {
                    RegSize::R8 => {
                        if b || needs_rex_for_8bit(bits) {
                            self.put1(rex_byte(false, false, false, b));
                        }
                        self.put(&[0xf6, modrm]);
                    }
                    RegSize::R16 => {
                        self.put1(0x66);
                        if b {
                            self.put1(rex_byte(false, false, false, b));
                        }
                        self.put(&[0xf7, modrm]);
                    }
                    RegSize::R32 => {
                        if b {
                            self.put1(rex_byte(false, false, false, b));
                        }
                        self.put(&[0xf7, modrm]);
                    }
                    RegSize::R64 => {
                        self.put1(rex_byte(true, false, false, b));
                        self.put(&[0xf7, modrm]);
                    }
                }
                Ok(())
            }

            _ => Err(CodegenError::Unimplemented(format!(
                "{op:?} in single-register form"
            ))),
        }
    }

    /// Shifts with a non-constant count use the `d2/d3 /n` forms with the
    /// count implicitly in CL.
    fn shift_reg(&mut self, op: X64Op, reg: Gpr, size: RegSize) -> CodegenResult<()> {
        let extension = match op {
            X64Op::Shl => 4,
            X64Op::Shr => 5,
            X64Op::Sar => 7,
            _ => unreachable!("not a shift opcode: {op:?}"),
        };
        let bits = reg.regbits();
        let b = reg.needs_rex_bit();
        let modrm = modrm_byte(0b11, extension, bits);

        match size {
            RegSize::R8 => {
                if b || needs_rex_for_8bit(bits) {
                    self.put1(rex_byte(false, false, false, b));
                }
                self.put(&[0xd2, modrm]);
            }
            RegSize::R16 => {
                self.put1(0x66);
                if b {
                    self.put1(rex_byte(false, false, false, b));
                }
                self.put(&[0xd3, modrm]);
            }
            RegSize::R32 => {
                if b {
                    self.put1(rex_byte(false, false, false, b));
                }
                self.put(&[0xd3, modrm]);
            }
            RegSize::R64 => {
                self.put1(rex_byte(true, false, false, b));
                self.put(&[0xd3, modrm]);
            }
        }
        Ok(())
    }

    /// `setcc reg8`: 0f 9x /0.
    fn setcc(&mut self, cond: Cond, reg: Gpr) -> CodegenResult<()> {
        let opcode: u8 = match cond {
            Cond::Eq => 0x94,
            Cond::Ne => 0x95,
            Cond::Gt => 0x9f,
            Cond::Lt => 0x9c,
            Cond::Ge => 0x9d,
            Cond::Le => 0x9e,
        };
        let bits = reg.regbits();
        if reg.needs_rex_bit() || needs_rex_for_8bit(bits) {
            self.put1(rex_byte(false, false, false, reg.needs_rex_bit()));
        }
        self.put(&[0x0f, opcode, modrm_byte(0b11, 0, bits)]);
        Ok(())
    }

    /// `jcc rel32`: 0f 8x with a PC-relative relocation against `label`.
    fn jcc(&mut self, cond: Cond, label: &str) -> CodegenResult<()> {
        let opcode: u8 = match cond {
            Cond::Eq => 0x84,
            Cond::Ne => 0x85,
            Cond::Gt => 0x8f,
            Cond::Lt => 0x8c,
            Cond::Ge => 0x8d,
            Cond::Le => 0x8e,
        };
        self.put(&[0x0f, opcode]);
        self.reloc(RelocKind::Disp32PcRel, label, SymbolKind::None);
        Ok(())
    }
}

fn has_calls(func: &crate::ir::Function) -> bool {
    func.layout
        .blocks()
        .flat_map(|b| func.layout.block_insts(b))
        .any(|inst| func.dfg.opcode(inst) == Opcode::Call)
}

/// Resolve local-label (`.L*`) relocations by patching the 32-bit
/// displacement in place, then remove those relocations and all local-label
/// symbols from the object.
fn resolve_local_labels(obj: &mut GenericObjectFile) -> CodegenResult<()> {
    let mut kept = Vec::with_capacity(obj.relocs.len());
    for reloc in std::mem::take(&mut obj.relocs) {
        if !reloc.sym.name.starts_with(".L") {
            kept.push(reloc);
            continue;
        }
        let label_offset = obj
            .symbols
            .iter()
            .find(|s| s.name == reloc.sym.name)
            .map(|s| s.byte_offset)
            .ok_or_else(|| {
                CodegenError::Unimplemented(format!(
                    "could not find local label referenced by relocation: \"{}\"",
                    reloc.sym.name
                ))
            })?;
        // The displacement is relative to the end of its own 4-byte field.
        let disp32 = label_offset as i64 - (4 + reloc.sym.byte_offset as i64);
        let disp32 = disp32 as i32;
        let section = obj.code_section();
        match &mut section.data {
            crate::binemit::SectionData::Bytes(bytes) => {
                let at = reloc.sym.byte_offset as usize;
                bytes[at..at + 4].copy_from_slice(&disp32.to_le_bytes());
            }
            crate::binemit::SectionData::Fill { .. } => unreachable!("code is a byte buffer"),
        }
    }
    obj.relocs = kept;

    obj.symbols.retain(|s| !s.name.starts_with(".L"));
    Ok(())
}
