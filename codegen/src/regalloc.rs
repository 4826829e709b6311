//! The default register-allocator collaborator.
//!
//! A deliberately simple allocator: virtual registers get live ranges from
//! their first to their last occurrence in linear order, and a greedy scan
//! assigns each one the first allocatable register that is free over the
//! whole range and not clobbered by any instruction inside it. There is no
//! spilling; running out of registers is an error the caller reports, and a
//! real allocator can replace this one behind the same
//! [`MachineDescription`](crate::isa::MachineDescription) boundary.

use crate::isa::MachineDescription;
use crate::mir::{MFunction, MOperand, VReg, VREG_INVALID, VREG_MIN};
use crate::{CodegenError, CodegenResult};
use rustc_hash::FxHashMap;

#[derive(Clone, Copy, Debug)]
struct LiveRange {
    first: usize,
    last: usize,
}

/// Allocate registers for one machine function.
///
/// Every virtual register at or above `VREG_MIN` is replaced with a
/// physical register from the description's allocatable set; clobber masks
/// are honoured, and the set of registers actually used is recorded on the
/// function for prologue/epilogue decisions.
pub fn run(mfunc: &mut MFunction, desc: &MachineDescription) -> CodegenResult<()> {
    // Linearise the function and collect live ranges plus per-position
    // interference.
    let mut ranges: FxHashMap<VReg, LiveRange> = FxHashMap::default();
    let mut interference: Vec<u64> = Vec::new();
    let mut pinned: Vec<u64> = Vec::new();

    let mut pos = 0usize;
    for block in &mfunc.blocks {
        for inst in &block.insts {
            interference.push((desc.interference)(inst, desc.call_conv));

            let mut pinned_here = 0u64;
            let mut touch = |reg: VReg| {
                if reg == VREG_INVALID {
                    return;
                }
                if reg >= VREG_MIN {
                    let range = ranges.entry(reg).or_insert(LiveRange {
                        first: pos,
                        last: pos,
                    });
                    range.last = pos;
                } else {
                    pinned_here |= 1 << reg;
                }
            };
            touch(inst.vreg);
            for op in &inst.operands {
                if let MOperand::Reg { reg, .. } = op {
                    touch(*reg);
                }
            }
            pinned.push(pinned_here);
            pos += 1;
        }
    }

    // Greedy assignment in order of first occurrence.
    let mut order: Vec<(VReg, LiveRange)> = ranges.iter().map(|(v, r)| (*v, *r)).collect();
    order.sort_by_key(|(v, r)| (r.first, *v));

    let mut assignment: FxHashMap<VReg, VReg> = FxHashMap::default();
    let mut assigned_ranges: Vec<(VReg, LiveRange)> = Vec::new();
    let mut used: u64 = 0;

    // Physical registers pinned anywhere count as used.
    for &mask in &pinned {
        used |= mask;
    }

    'vregs: for (vreg, range) in order {
        'candidates: for &candidate in desc.registers {
            let bit = 1u64 << candidate;

            // Not clobbered by any instruction in the range.
            for p in range.first..=range.last {
                if interference[p] & bit != 0 {
                    continue 'candidates;
                }
            }
            // Not pinned strictly inside the range. At the endpoints the
            // value is being defined or dying, and reads precede writes
            // within one instruction, so sharing the register there is
            // what makes copies into fixed registers free.
            for p in range.first + 1..range.last {
                if pinned[p] & bit != 0 {
                    continue 'candidates;
                }
            }

            // Not already holding an overlapping value.
            for (other, other_range) in &assigned_ranges {
                if assignment[other] == candidate
                    && range.first <= other_range.last
                    && other_range.first <= range.last
                {
                    continue 'candidates;
                }
            }

            assignment.insert(vreg, candidate);
            assigned_ranges.push((vreg, range));
            used |= bit;
            log::trace!("{}: v{vreg} -> r{candidate}", mfunc.name);
            continue 'vregs;
        }
        return Err(CodegenError::RegisterAllocation(format!(
            "no register available for virtual register {vreg} in '{}'",
            mfunc.name
        )));
    }

    // Rewrite the function in place.
    for block in &mut mfunc.blocks {
        for inst in &mut block.insts {
            if inst.vreg >= VREG_MIN {
                inst.vreg = assignment[&inst.vreg];
            }
            for op in &mut inst.operands {
                if let MOperand::Reg { reg, .. } = op {
                    if *reg >= VREG_MIN {
                        *reg = assignment[reg];
                    }
                }
            }
        }
    }

    mfunc.registers_used = used;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRef;
    use crate::ir::FuncId;
    use crate::isa::x64::{machine_description, Gpr, X64Op};
    use crate::isa::CallConv;
    use crate::mir::{MBlock, MInst, VREG_MIN};
    use smallvec::smallvec;

    fn func_with(insts: Vec<MInst>) -> MFunction {
        MFunction {
            name: "f".to_string(),
            func: FuncId::new(0),
            is_declaration: false,
            blocks: vec![MBlock {
                name: ".L0".to_string(),
                block: crate::ir::Block::new(0),
                insts,
            }],
            frame_objects: Vec::new(),
            next_vreg: VREG_MIN + 16,
            registers_used: 0,
            block_index: Default::default(),
        }
    }

    fn reg(reg: u32) -> MOperand {
        MOperand::Reg { reg, size: 8 }
    }

    #[test]
    fn assigns_and_rewrites() {
        let v0 = VREG_MIN;
        let v1 = VREG_MIN + 1;
        let mut f = func_with(vec![
            MInst::with_result(X64Op::Mov.opcode(), v0, smallvec![MOperand::Imm(1), reg(v0)]),
            MInst::with_result(X64Op::Mov.opcode(), v1, smallvec![MOperand::Imm(2), reg(v1)]),
            MInst::new(X64Op::Add.opcode(), smallvec![reg(v0), reg(v1)]),
        ]);
        run(&mut f, &machine_description(CallConv::SystemV)).unwrap();

        for block in &f.blocks {
            for inst in &block.insts {
                for op in &inst.operands {
                    if let MOperand::Reg { reg, .. } = op {
                        assert!(*reg < VREG_MIN);
                    }
                }
            }
        }
        // The two values overlap, so they get distinct registers.
        let a = &f.blocks[0].insts[0].operands[1];
        let b = &f.blocks[0].insts[1].operands[1];
        assert_ne!(a, b);
    }

    #[test]
    fn divisor_avoids_rax_and_rdx() {
        let a = VREG_MIN;
        let b = VREG_MIN + 1;
        // mov 7 -> a; mov 2 -> b; mov a, %rax; cqo; idiv b
        let mut f = func_with(vec![
            MInst::with_result(X64Op::Mov.opcode(), a, smallvec![MOperand::Imm(7), reg(a)]),
            MInst::with_result(X64Op::Mov.opcode(), b, smallvec![MOperand::Imm(2), reg(b)]),
            MInst::new(
                X64Op::Mov.opcode(),
                smallvec![reg(a), reg(Gpr::Rax.vreg())],
            ),
            MInst::new(X64Op::Cqo.opcode(), smallvec![]),
            MInst::new(X64Op::Idiv.opcode(), smallvec![reg(b)]),
        ]);
        run(&mut f, &machine_description(CallConv::SystemV)).unwrap();

        let divisor = match f.blocks[0].insts[4].operands[0] {
            MOperand::Reg { reg, .. } => reg,
            _ => unreachable!(),
        };
        assert_ne!(divisor, Gpr::Rax.vreg());
        assert_ne!(divisor, Gpr::Rdx.vreg());
    }

    #[test]
    fn exhaustion_is_an_error() {
        // 15 values all live to the end exhaust the 14 allocatable
        // registers.
        let mut insts = Vec::new();
        for i in 0..15 {
            let v = VREG_MIN + i;
            insts.push(MInst::with_result(
                X64Op::Mov.opcode(),
                v,
                smallvec![MOperand::Imm(i as i64), reg(v)],
            ));
        }
        let mut keepalive = smallvec![];
        for i in 0..15 {
            keepalive.push(reg(VREG_MIN + i));
        }
        insts.push(MInst::new(X64Op::Test.opcode(), keepalive));
        let mut f = func_with(insts);
        let err = run(&mut f, &machine_description(CallConv::SystemV)).unwrap_err();
        assert!(matches!(err, CodegenError::RegisterAllocation(_)));
    }
}
