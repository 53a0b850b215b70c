//! Per-function lowering: frame layout, instruction selection, and jump
//! resolution under the spill-everywhere discipline.
//!
//! Every SSA value is assigned a slot at a negative offset from RBP before
//! any code is emitted. Instructions load their operands into the RAX/RCX
//! working pair (XMM0/XMM1 for floats), execute, and store the result back
//! to the instruction's slot. Intra-function branches go through a
//! label/fixup table and are patched once all block offsets are known.

use std::collections::HashMap;

use opal_ir::function::Function;
use opal_ir::instruction::{FCmpOp, ICmpOp, Op};
use opal_ir::module::Module;
use opal_ir::types::Type;
use opal_ir::value::{BlockRef, ValueRef};
use opal_target::{Error, RelocKind, Relocation, Result};

use crate::abi::{self, ParamClass};
use crate::encode::{self, CondCode, JumpFixup};
use crate::reg::{Gpr, Xmm, INT_ARG_REGS, SSE_ARG_REGS};

/// Machine code for one function, with relocations relative to its start.
#[derive(Debug)]
pub struct LoweredFunction {
    pub name: String,
    pub code: Vec<u8>,
    pub relocations: Vec<Relocation>,
}

/// ALU opcode (register form) and ModR/M extension (immediate form) pairs.
const ADD: (u8, u8) = (0x01, 0);
const OR: (u8, u8) = (0x09, 1);
const AND: (u8, u8) = (0x21, 4);
const SUB: (u8, u8) = (0x29, 5);
const XOR: (u8, u8) = (0x31, 6);

const SHL_EXT: u8 = 4;
const SHR_EXT: u8 = 5;
const SAR_EXT: u8 = 7;

/// Frame slot assignment for one function.
struct FrameLayout {
    /// Slot per function argument (offset from RBP, negative).
    arg_slots: Vec<i32>,
    /// Slot per value-producing instruction, indexed by arena position.
    inst_slots: Vec<Option<i32>>,
    /// Storage region per alloca, keyed by instruction index.
    alloca_storage: HashMap<u32, i32>,
    /// Staging slot per phi, keyed by instruction index. Incoming values
    /// are parked here so simultaneous phi moves cannot clobber each other.
    phi_staging: HashMap<u32, i32>,
    /// Total frame size, 16-byte aligned.
    frame_size: i32,
}

/// Slot loads and stores only come in 1/2/4/8-byte forms; wider values
/// move through their leading 8 bytes.
fn slot_move_size(size: u64) -> u64 {
    match size {
        1 | 2 | 4 => size,
        _ => 8,
    }
}

fn build_frame(func: &Function) -> Result<FrameLayout> {
    let mut offset: i64 = 0;
    let mut bump = |offset: &mut i64, size: u64| -> i32 {
        // Minimum slot of 8 bytes, aligned to the slot size.
        let sz = size.max(8) as i64;
        if *offset % sz != 0 {
            *offset += sz - *offset % sz;
        }
        *offset += sz;
        -*offset as i32
    };

    let mut arg_slots = Vec::with_capacity(func.args.len());
    for arg in &func.args {
        arg_slots.push(bump(&mut offset, abi::size_of(&arg.ty)));
    }

    let mut inst_slots = vec![None; func.instructions.len()];
    let mut phi_staging = HashMap::new();
    for (idx, inst) in func.instructions.iter().enumerate() {
        match &inst.op {
            // Constants are materialized at each use; no slot.
            Op::ConstInt(_) | Op::ConstFloat(_) | Op::GlobalAddr(_) => {}
            // The alloca's own value is the pointer to its storage.
            Op::Alloca { .. } => {
                inst_slots[idx] = Some(bump(&mut offset, 8));
            }
            Op::Phi(_) => {
                inst_slots[idx] = Some(bump(&mut offset, abi::size_of(&inst.ty)));
                phi_staging.insert(idx as u32, bump(&mut offset, 8));
            }
            _ if !inst.ty.is_void() => {
                inst_slots[idx] = Some(bump(&mut offset, abi::size_of(&inst.ty)));
            }
            _ => {}
        }
    }

    // Alloca storage regions sit below all value slots.
    let mut alloca_storage = HashMap::new();
    for (idx, inst) in func.instructions.iter().enumerate() {
        if let Op::Alloca { elem, count } = &inst.op {
            let n = match count {
                None => 1,
                Some(v) => match const_int_value(func, *v) {
                    Some(n) if n >= 0 => n as u64,
                    // Dynamic or negative element counts have no static
                    // frame shape.
                    _ => return Err(Error::encoding("alloca", &func.name)),
                },
            };
            let size = (abi::size_of(elem) * n).max(8) as i64;
            let align = abi::align_of(elem).max(8) as i64;
            if offset % align != 0 {
                offset += align - offset % align;
            }
            offset += size;
            alloca_storage.insert(idx as u32, -offset as i32);
        }
    }

    // Call sites require 16-byte stack alignment.
    if offset % 16 != 0 {
        offset += 16 - offset % 16;
    }

    Ok(FrameLayout {
        arg_slots,
        inst_slots,
        alloca_storage,
        phi_staging,
        frame_size: offset as i32,
    })
}

/// Constant value of `v` if it is a `ConstInt` instruction result.
fn const_int_value(func: &Function, v: ValueRef) -> Option<i64> {
    if v.is_argument() {
        return None;
    }
    match func.instructions[v.index() as usize].op {
        Op::ConstInt(c) => Some(c),
        _ => None,
    }
}

fn icmp_cc(op: ICmpOp) -> CondCode {
    match op {
        ICmpOp::Eq => CondCode::E,
        ICmpOp::Ne => CondCode::Ne,
        ICmpOp::Slt => CondCode::L,
        ICmpOp::Sle => CondCode::Le,
        ICmpOp::Sgt => CondCode::G,
        ICmpOp::Sge => CondCode::Ge,
        ICmpOp::Ult => CondCode::B,
        ICmpOp::Ule => CondCode::Be,
        ICmpOp::Ugt => CondCode::A,
        ICmpOp::Uge => CondCode::Ae,
    }
}

/// `ucomiss`/`ucomisd` set CF/ZF like an unsigned compare, so float
/// predicates use the below/above family.
fn fcmp_cc(op: FCmpOp) -> CondCode {
    match op {
        FCmpOp::Eq => CondCode::E,
        FCmpOp::Ne => CondCode::Ne,
        FCmpOp::Lt => CondCode::B,
        FCmpOp::Le => CondCode::Be,
        FCmpOp::Gt => CondCode::A,
        FCmpOp::Ge => CondCode::Ae,
    }
}

/// Lower a single function with a non-empty body to machine code.
pub fn lower_function(module: &Module, func: &Function) -> Result<LoweredFunction> {
    let frame = build_frame(func)?;
    log::debug!(
        "lowering `{}`: {} blocks, frame {} bytes",
        func.name,
        func.blocks.len(),
        frame.frame_size
    );

    let next_label = func.blocks.len() as u32;
    let mut lowering = FunctionLowering {
        module,
        func,
        frame,
        buf: Vec::new(),
        labels: HashMap::new(),
        fixups: Vec::new(),
        relocations: Vec::new(),
        next_label,
    };
    lowering.run()?;

    Ok(LoweredFunction {
        name: func.name.clone(),
        code: lowering.buf,
        relocations: lowering.relocations,
    })
}

struct FunctionLowering<'a> {
    module: &'a Module,
    func: &'a Function,
    frame: FrameLayout,
    buf: Vec<u8>,
    /// Label id -> code offset. Blocks own labels `0..block_count`;
    /// synthetic edge labels are allocated above that.
    labels: HashMap<u32, usize>,
    fixups: Vec<JumpFixup>,
    relocations: Vec<Relocation>,
    next_label: u32,
}

impl<'a> FunctionLowering<'a> {
    fn run(&mut self) -> Result<()> {
        encode::prologue(&mut self.buf, self.frame.frame_size);
        self.save_arguments();

        for bi in 0..self.func.blocks.len() {
            let block = BlockRef::new(bi as u32);
            self.labels.insert(bi as u32, self.buf.len());
            for idx in self.func.block_inst_range(block) {
                self.lower_inst(bi as u32, idx)?;
            }
        }

        self.apply_fixups()
    }

    fn err(&self, op: &Op) -> Error {
        Error::encoding(op.name(), &self.func.name)
    }

    fn alloc_label(&mut self) -> u32 {
        let l = self.next_label;
        self.next_label += 1;
        l
    }

    // ── Prologue argument save ──

    /// Copy incoming arguments into their frame slots, mirroring the
    /// call-site marshalling: integer class from RDI..R9, SSE class from
    /// XMM0..XMM7, everything else from the caller's stack.
    fn save_arguments(&mut self) {
        let mut int_idx = 0;
        let mut sse_idx = 0;
        let mut stack_idx = 0i32;

        for (i, arg) in self.func.args.iter().enumerate() {
            let size = abi::size_of(&arg.ty);
            let slot = self.frame.arg_slots[i];
            match abi::classify_parameter(&arg.ty) {
                ParamClass::Sse if sse_idx < SSE_ARG_REGS.len() => {
                    encode::fp_store_slot(&mut self.buf, SSE_ARG_REGS[sse_idx], slot, size == 8);
                    sse_idx += 1;
                }
                ParamClass::Integer if int_idx < INT_ARG_REGS.len() => {
                    encode::store_slot(
                        &mut self.buf,
                        INT_ARG_REGS[int_idx],
                        slot,
                        slot_move_size(size),
                    );
                    int_idx += 1;
                }
                _ => {
                    // Overflow arguments sit above the saved RBP and the
                    // return address.
                    let src = 16 + 8 * stack_idx;
                    stack_idx += 1;
                    encode::load_caller_stack_rax(&mut self.buf, src, slot_move_size(size));
                    encode::store_slot(&mut self.buf, Gpr::Rax, slot, slot_move_size(size));
                }
            }
        }
    }

    // ── Operand movement ──

    fn slot_of(&self, v: ValueRef) -> Result<i32> {
        if v.is_argument() {
            Ok(self.frame.arg_slots[v.index() as usize])
        } else {
            self.frame.inst_slots[v.index() as usize].ok_or_else(|| {
                Error::layout(format!(
                    "value %{} in `{}` has no frame slot",
                    v.index(),
                    self.func.name
                ))
            })
        }
    }

    /// Load a value into a general-purpose register: constants are
    /// materialized, global addresses go through a RIP-relative LEA with a
    /// PC32 relocation, everything else comes from its frame slot.
    fn load_value(&mut self, reg: Gpr, v: ValueRef) -> Result<()> {
        if !v.is_argument() {
            let inst = &self.func.instructions[v.index() as usize];
            match &inst.op {
                Op::ConstInt(c) => {
                    encode::load_const_int(&mut self.buf, reg, *c);
                    return Ok(());
                }
                Op::ConstFloat(f) => {
                    let bits = float_bits(*f, &inst.ty);
                    encode::load_const_int(&mut self.buf, reg, bits);
                    return Ok(());
                }
                Op::GlobalAddr(g) => {
                    let patch = encode::lea_rip(&mut self.buf, reg);
                    self.relocations.push(Relocation {
                        offset: patch as u64,
                        symbol: self.module.global(*g).name.clone(),
                        kind: RelocKind::Pc32,
                        addend: -4,
                    });
                    return Ok(());
                }
                _ => {}
            }
        }

        let slot = self.slot_of(v)?;
        let size = abi::size_of(self.func.value_type(v));
        encode::load_slot(&mut self.buf, reg, slot, slot_move_size(size));
        Ok(())
    }

    /// Load a float value into an XMM register. Constants go through RAX
    /// as their IEEE-754 bit pattern, so no memory constant pool or
    /// relocation is needed.
    fn load_fp_value(&mut self, reg: Xmm, v: ValueRef) -> Result<()> {
        if !v.is_argument() {
            let inst = &self.func.instructions[v.index() as usize];
            if let Op::ConstFloat(f) = &inst.op {
                let bits = float_bits(*f, &inst.ty);
                encode::load_const_int(&mut self.buf, Gpr::Rax, bits);
                if abi::size_of(&inst.ty) == 8 {
                    encode::movq_to_xmm(&mut self.buf, reg, Gpr::Rax);
                } else {
                    encode::movd_to_xmm(&mut self.buf, reg, Gpr::Rax);
                }
                return Ok(());
            }
        }

        let slot = self.slot_of(v)?;
        let double = abi::size_of(self.func.value_type(v)) == 8;
        encode::fp_load_slot(&mut self.buf, reg, slot, double);
        Ok(())
    }

    fn store_result(&mut self, reg: Gpr, idx: u32) -> Result<()> {
        let slot = self.frame.inst_slots[idx as usize].ok_or_else(|| {
            Error::layout(format!(
                "result of %{} in `{}` has no frame slot",
                idx, self.func.name
            ))
        })?;
        let size = abi::size_of(&self.func.instructions[idx as usize].ty);
        encode::store_slot(&mut self.buf, reg, slot, slot_move_size(size));
        Ok(())
    }

    fn store_fp_result(&mut self, reg: Xmm, idx: u32) -> Result<()> {
        let slot = self.frame.inst_slots[idx as usize].ok_or_else(|| {
            Error::layout(format!(
                "result of %{} in `{}` has no frame slot",
                idx, self.func.name
            ))
        })?;
        let double = abi::size_of(&self.func.instructions[idx as usize].ty) == 8;
        encode::fp_store_slot(&mut self.buf, reg, slot, double);
        Ok(())
    }

    // ── Instruction lowering ──

    fn lower_inst(&mut self, pred: u32, idx: u32) -> Result<()> {
        let func = self.func;
        let inst = &func.instructions[idx as usize];
        match &inst.op {
            Op::ConstInt(_) | Op::ConstFloat(_) | Op::GlobalAddr(_) => {}

            Op::Add(a, b) => self.int_binop(idx, *a, *b, ADD)?,
            Op::Sub(a, b) => self.int_binop(idx, *a, *b, SUB)?,
            Op::And(a, b) => self.int_binop(idx, *a, *b, AND)?,
            Op::Or(a, b) => self.int_binop(idx, *a, *b, OR)?,
            Op::Xor(a, b) => self.int_binop(idx, *a, *b, XOR)?,

            Op::Mul(a, b) => {
                self.load_value(Gpr::Rax, *a)?;
                self.load_value(Gpr::Rcx, *b)?;
                encode::imul_rax_rcx(&mut self.buf);
                self.store_result(Gpr::Rax, idx)?;
            }

            Op::UDiv(a, b) => self.divrem(idx, *a, *b, false, false)?,
            Op::SDiv(a, b) => self.divrem(idx, *a, *b, true, false)?,
            Op::URem(a, b) => self.divrem(idx, *a, *b, false, true)?,
            Op::SRem(a, b) => self.divrem(idx, *a, *b, true, true)?,

            Op::Shl(a, b) => self.shift(idx, *a, *b, SHL_EXT)?,
            Op::LShr(a, b) => self.shift(idx, *a, *b, SHR_EXT)?,
            Op::AShr(a, b) => self.shift(idx, *a, *b, SAR_EXT)?,

            Op::ICmp(op, a, b) => {
                self.load_value(Gpr::Rax, *a)?;
                self.load_value(Gpr::Rcx, *b)?;
                encode::cmp_rax_rcx(&mut self.buf);
                encode::setcc_al(&mut self.buf, icmp_cc(*op));
                encode::movzx_rax_al(&mut self.buf);
                self.store_result(Gpr::Rax, idx)?;
            }

            Op::FCmp(op, a, b) => {
                let double = abi::size_of(func.value_type(*a)) == 8;
                self.load_fp_value(Xmm::Xmm0, *a)?;
                self.load_fp_value(Xmm::Xmm1, *b)?;
                encode::ucomis_xmm0_xmm1(&mut self.buf, double);
                encode::setcc_al(&mut self.buf, fcmp_cc(*op));
                encode::movzx_rax_al(&mut self.buf);
                self.store_result(Gpr::Rax, idx)?;
            }

            Op::FAdd(a, b) => self.float_binop(idx, *a, *b, 0x58)?,
            Op::FSub(a, b) => self.float_binop(idx, *a, *b, 0x5C)?,
            Op::FMul(a, b) => self.float_binop(idx, *a, *b, 0x59)?,
            Op::FDiv(a, b) => self.float_binop(idx, *a, *b, 0x5E)?,

            Op::Alloca { .. } => {
                let storage = *self.frame.alloca_storage.get(&idx).ok_or_else(|| {
                    Error::layout(format!(
                        "alloca %{} in `{}` has no storage offset",
                        idx, self.func.name
                    ))
                })?;
                encode::lea_rbp(&mut self.buf, Gpr::Rax, storage);
                self.store_result(Gpr::Rax, idx)?;
            }

            Op::Load(ptr) => {
                let size = abi::size_of(&inst.ty);
                if !matches!(size, 1 | 2 | 4 | 8) {
                    return Err(self.err(&inst.op));
                }
                self.load_value(Gpr::Rax, *ptr)?;
                encode::load_mem_rax(&mut self.buf, size);
                self.store_result(Gpr::Rax, idx)?;
            }

            Op::Store(value, ptr) => {
                let size = abi::size_of(func.value_type(*value));
                if !matches!(size, 1 | 2 | 4 | 8) {
                    return Err(self.err(&inst.op));
                }
                self.load_value(Gpr::Rax, *value)?;
                self.load_value(Gpr::Rcx, *ptr)?;
                encode::store_mem_rcx_rax(&mut self.buf, size);
            }

            Op::Gep {
                base,
                source_elem,
                indices,
            } => self.gep(idx, *base, source_elem, indices)?,

            Op::ExtractValue { agg, indices } => {
                let size = abi::size_of(&inst.ty);
                if !matches!(size, 1 | 2 | 4 | 8) {
                    return Err(self.err(&inst.op));
                }
                let offset = self.aggregate_offset(func.value_type(*agg), indices, &inst.op)?;
                self.load_value(Gpr::Rax, *agg)?;
                if offset > 0 {
                    encode::add_rax_imm(&mut self.buf, offset as i32);
                }
                encode::load_mem_rax(&mut self.buf, size);
                self.store_result(Gpr::Rax, idx)?;
            }

            Op::InsertValue {
                agg,
                value,
                indices,
            } => {
                let size = abi::size_of(func.value_type(*value));
                if !matches!(size, 1 | 2 | 4 | 8) {
                    return Err(self.err(&inst.op));
                }
                let offset = self.aggregate_offset(func.value_type(*agg), indices, &inst.op)?;
                self.load_value(Gpr::Rcx, *agg)?;
                self.load_value(Gpr::Rax, *value)?;
                if offset > 0 {
                    encode::add_rcx_imm(&mut self.buf, offset as i32);
                }
                encode::store_mem_rcx_rax(&mut self.buf, size);
                self.store_result(Gpr::Rcx, idx)?;
            }

            Op::Select(cond, t, f) => {
                self.load_value(Gpr::Rax, *cond)?;
                self.load_value(Gpr::Rcx, *t)?;
                self.load_value(Gpr::Rdx, *f)?;
                encode::test_rax_rax(&mut self.buf);
                encode::cmovz_rcx_rdx(&mut self.buf);
                self.store_result(Gpr::Rcx, idx)?;
            }

            Op::Call { callee, args } => self.call(idx, callee, args)?,

            // Phi slots are written by the predecessors; nothing to do at
            // the join point itself.
            Op::Phi(_) => {}

            Op::Trunc(v) => {
                // Truncation happens implicitly through the store size.
                self.load_value(Gpr::Rax, *v)?;
                self.store_result(Gpr::Rax, idx)?;
            }

            Op::ZExt(v) => {
                let src_size = abi::size_of(func.value_type(*v));
                self.load_value(Gpr::Rax, *v)?;
                encode::zext_rax(&mut self.buf, src_size);
                self.store_result(Gpr::Rax, idx)?;
            }

            Op::SExt(v) => {
                let src_size = abi::size_of(func.value_type(*v));
                self.load_value(Gpr::Rax, *v)?;
                encode::sext_rax(&mut self.buf, src_size);
                self.store_result(Gpr::Rax, idx)?;
            }

            Op::FPTrunc(v) => {
                self.load_fp_value(Xmm::Xmm0, *v)?;
                encode::cvtsd2ss_xmm0(&mut self.buf);
                self.store_fp_result(Xmm::Xmm0, idx)?;
            }

            Op::FPExt(v) => {
                self.load_fp_value(Xmm::Xmm0, *v)?;
                encode::cvtss2sd_xmm0(&mut self.buf);
                self.store_fp_result(Xmm::Xmm0, idx)?;
            }

            Op::FPToSI(v) => {
                let double = abi::size_of(func.value_type(*v)) == 8;
                self.load_fp_value(Xmm::Xmm0, *v)?;
                encode::cvtt_to_rax(&mut self.buf, double);
                self.store_result(Gpr::Rax, idx)?;
            }

            Op::SIToFP(v) => {
                let double = abi::size_of(&inst.ty) == 8;
                self.load_value(Gpr::Rax, *v)?;
                encode::cvt_from_rax(&mut self.buf, double);
                self.store_fp_result(Xmm::Xmm0, idx)?;
            }

            Op::Bitcast(v) | Op::PtrToInt(v) | Op::IntToPtr(v) => {
                self.load_value(Gpr::Rax, *v)?;
                self.store_result(Gpr::Rax, idx)?;
            }

            Op::Ret(value) => {
                if let Some(v) = value {
                    if func.value_type(*v).is_float() {
                        self.load_fp_value(Xmm::Xmm0, *v)?;
                    } else {
                        self.load_value(Gpr::Rax, *v)?;
                    }
                }
                encode::epilogue(&mut self.buf);
            }

            Op::Br(target) => {
                let moves = self.phi_moves(pred, *target);
                self.emit_phi_moves(&moves)?;
                let patch = encode::jmp_rel32(&mut self.buf);
                self.fixups.push(JumpFixup {
                    patch_offset: patch,
                    target: target.index(),
                });
            }

            Op::CondBr(cond, then_block, else_block) => {
                self.cond_br(pred, *cond, *then_block, *else_block)?;
            }

            Op::Switch {
                value,
                cases,
                default,
            } => self.switch(pred, *value, cases, *default)?,
        }
        Ok(())
    }

    fn int_binop(&mut self, idx: u32, a: ValueRef, b: ValueRef, op: (u8, u8)) -> Result<()> {
        let (opcode, ext) = op;
        self.load_value(Gpr::Rax, a)?;
        match const_int_value(self.func, b) {
            Some(c) if i32::try_from(c).is_ok() => {
                encode::alu_rax_imm(&mut self.buf, ext, c as i32);
            }
            _ => {
                self.load_value(Gpr::Rcx, b)?;
                encode::alu_rax_rcx(&mut self.buf, opcode);
            }
        }
        self.store_result(Gpr::Rax, idx)
    }

    fn divrem(&mut self, idx: u32, a: ValueRef, b: ValueRef, signed: bool, rem: bool) -> Result<()> {
        self.load_value(Gpr::Rax, a)?;
        self.load_value(Gpr::Rcx, b)?;
        if signed {
            encode::cqo(&mut self.buf);
            encode::idiv_rcx(&mut self.buf);
        } else {
            encode::xor_edx_edx(&mut self.buf);
            encode::div_rcx(&mut self.buf);
        }
        self.store_result(if rem { Gpr::Rdx } else { Gpr::Rax }, idx)
    }

    fn shift(&mut self, idx: u32, a: ValueRef, b: ValueRef, ext: u8) -> Result<()> {
        self.load_value(Gpr::Rax, a)?;
        match const_int_value(self.func, b) {
            Some(1) => encode::shift_rax_one(&mut self.buf, ext),
            Some(c) => encode::shift_rax_imm(&mut self.buf, ext, (c & 63) as u8),
            None => {
                // Shift amount goes through CL.
                self.load_value(Gpr::Rcx, b)?;
                encode::shift_rax_cl(&mut self.buf, ext);
            }
        }
        self.store_result(Gpr::Rax, idx)
    }

    fn float_binop(&mut self, idx: u32, a: ValueRef, b: ValueRef, opcode: u8) -> Result<()> {
        let double = abi::size_of(self.func.value_type(a)) == 8;
        self.load_fp_value(Xmm::Xmm0, a)?;
        self.load_fp_value(Xmm::Xmm1, b)?;
        encode::sse_op_xmm0_xmm1(&mut self.buf, opcode, double);
        self.store_fp_result(Xmm::Xmm0, idx)
    }

    fn gep(
        &mut self,
        idx: u32,
        base: ValueRef,
        source_elem: &Type,
        indices: &[ValueRef],
    ) -> Result<()> {
        self.load_value(Gpr::Rax, base)?;
        let mut cur = source_elem;
        for (i, &iv) in indices.iter().enumerate() {
            if i == 0 {
                // The first index scales by the whole source element type.
                self.gep_scaled_index(iv, abi::size_of(cur))?;
                continue;
            }
            match cur {
                Type::Struct { fields, packed } => {
                    // Struct field selection must be a compile-time constant.
                    let field = const_int_value(self.func, iv)
                        .and_then(|c| usize::try_from(c).ok())
                        .filter(|&c| c < fields.len())
                        .ok_or_else(|| Error::encoding("getelementptr", &self.func.name))?;
                    let offset = abi::struct_field_offset(fields, *packed, field);
                    if offset > 0 {
                        encode::add_rax_imm(&mut self.buf, offset as i32);
                    }
                    cur = &fields[field];
                }
                Type::Array { elem, .. } => {
                    cur = elem;
                    self.gep_scaled_index(iv, abi::size_of(cur))?;
                }
                Type::Ptr(elem) => {
                    cur = elem;
                    self.gep_scaled_index(iv, abi::size_of(cur))?;
                }
                _ => return Err(Error::encoding("getelementptr", &self.func.name)),
            }
        }
        self.store_result(Gpr::Rax, idx)
    }

    fn gep_scaled_index(&mut self, index: ValueRef, scale: u64) -> Result<()> {
        self.load_value(Gpr::Rcx, index)?;
        encode::imul_rcx_imm(&mut self.buf, scale as i32);
        encode::add_rax_rcx(&mut self.buf);
        Ok(())
    }

    /// Byte offset of a leaf inside an aggregate, walking struct fields and
    /// array elements.
    fn aggregate_offset(&self, agg_ty: &Type, indices: &[u32], op: &Op) -> Result<u64> {
        let mut cur = agg_ty;
        let mut offset = 0u64;
        for &i in indices {
            match cur {
                Type::Struct { fields, packed } => {
                    offset += abi::struct_field_offset(fields, *packed, i as usize);
                    cur = fields
                        .get(i as usize)
                        .ok_or_else(|| self.err(op))?;
                }
                Type::Array { elem, .. } => {
                    offset += i as u64 * abi::size_of(elem);
                    cur = elem;
                }
                _ => return Err(self.err(op)),
            }
        }
        Ok(offset)
    }

    fn call(&mut self, idx: u32, callee: &str, args: &[ValueRef]) -> Result<()> {
        let mut int_idx = 0;
        let mut sse_idx = 0;
        let mut stack_args: Vec<ValueRef> = Vec::new();

        for &arg in args {
            match abi::classify_parameter(self.func.value_type(arg)) {
                ParamClass::Sse if sse_idx < SSE_ARG_REGS.len() => {
                    self.load_fp_value(SSE_ARG_REGS[sse_idx], arg)?;
                    sse_idx += 1;
                }
                ParamClass::Integer if int_idx < INT_ARG_REGS.len() => {
                    self.load_value(INT_ARG_REGS[int_idx], arg)?;
                    int_idx += 1;
                }
                _ => stack_args.push(arg),
            }
        }

        // An odd number of pushes would leave RSP misaligned at the call;
        // pad below the overflow area so the callee still finds its stack
        // arguments directly above the return address.
        let pad = if stack_args.len() % 2 == 1 { 8 } else { 0 };
        if pad > 0 {
            encode::sub_rsp(&mut self.buf, pad);
        }
        for &arg in stack_args.iter().rev() {
            self.load_value(Gpr::Rax, arg)?;
            encode::push_reg(&mut self.buf, Gpr::Rax);
        }

        let patch = encode::call_rel32(&mut self.buf);
        self.relocations.push(Relocation {
            offset: patch as u64,
            symbol: callee.to_string(),
            kind: RelocKind::Plt32,
            addend: -4,
        });

        let cleanup = stack_args.len() as i32 * 8 + pad;
        if cleanup > 0 {
            encode::add_rsp(&mut self.buf, cleanup);
        }

        let ret_ty = &self.func.instructions[idx as usize].ty;
        if !ret_ty.is_void() {
            if ret_ty.is_float() {
                self.store_fp_result(Xmm::Xmm0, idx)?;
            } else {
                self.store_result(Gpr::Rax, idx)?;
            }
        }
        Ok(())
    }

    // ── Terminators with phi edges ──

    fn cond_br(
        &mut self,
        pred: u32,
        cond: ValueRef,
        then_block: BlockRef,
        else_block: BlockRef,
    ) -> Result<()> {
        let then_moves = self.phi_moves(pred, then_block);
        let else_moves = self.phi_moves(pred, else_block);

        self.load_value(Gpr::Rax, cond)?;
        encode::test_rax_rax(&mut self.buf);

        if then_moves.is_empty() {
            let patch = encode::jcc_rel32(&mut self.buf, CondCode::Ne);
            self.fixups.push(JumpFixup {
                patch_offset: patch,
                target: then_block.index(),
            });
            self.emit_phi_moves(&else_moves)?;
            let patch = encode::jmp_rel32(&mut self.buf);
            self.fixups.push(JumpFixup {
                patch_offset: patch,
                target: else_block.index(),
            });
        } else {
            // Split the taken edge so its phi moves only run when the
            // branch is taken.
            let edge = self.alloc_label();
            let patch = encode::jcc_rel32(&mut self.buf, CondCode::Ne);
            self.fixups.push(JumpFixup {
                patch_offset: patch,
                target: edge,
            });
            self.emit_phi_moves(&else_moves)?;
            let patch = encode::jmp_rel32(&mut self.buf);
            self.fixups.push(JumpFixup {
                patch_offset: patch,
                target: else_block.index(),
            });

            self.labels.insert(edge, self.buf.len());
            self.emit_phi_moves(&then_moves)?;
            let patch = encode::jmp_rel32(&mut self.buf);
            self.fixups.push(JumpFixup {
                patch_offset: patch,
                target: then_block.index(),
            });
        }
        Ok(())
    }

    fn switch(
        &mut self,
        pred: u32,
        value: ValueRef,
        cases: &[opal_ir::instruction::SwitchCase],
        default: BlockRef,
    ) -> Result<()> {
        self.load_value(Gpr::Rax, value)?;

        // Linear compare-and-jump chain. Case edges with phi moves jump to
        // a trampoline emitted after the chain.
        let mut edge_trampolines: Vec<(u32, BlockRef, Vec<(ValueRef, u32)>)> = Vec::new();
        for case in cases {
            let imm = i32::try_from(case.value).map_err(|_| {
                Error::encoding("switch", &self.func.name)
            })?;
            encode::cmp_rax_imm(&mut self.buf, imm);
            let moves = self.phi_moves(pred, case.block);
            let target = if moves.is_empty() {
                case.block.index()
            } else {
                let edge = self.alloc_label();
                edge_trampolines.push((edge, case.block, moves));
                edge
            };
            let patch = encode::jcc_rel32(&mut self.buf, CondCode::E);
            self.fixups.push(JumpFixup {
                patch_offset: patch,
                target,
            });
        }

        let default_moves = self.phi_moves(pred, default);
        self.emit_phi_moves(&default_moves)?;
        let patch = encode::jmp_rel32(&mut self.buf);
        self.fixups.push(JumpFixup {
            patch_offset: patch,
            target: default.index(),
        });

        for (edge, block, moves) in edge_trampolines {
            self.labels.insert(edge, self.buf.len());
            self.emit_phi_moves(&moves)?;
            let patch = encode::jmp_rel32(&mut self.buf);
            self.fixups.push(JumpFixup {
                patch_offset: patch,
                target: block.index(),
            });
        }
        Ok(())
    }

    /// Phi moves required on the edge `pred -> succ`, in phi declaration
    /// order: (incoming value, phi instruction index).
    fn phi_moves(&self, pred: u32, succ: BlockRef) -> Vec<(ValueRef, u32)> {
        let mut moves = Vec::new();
        for idx in self.func.block_inst_range(succ) {
            if let Op::Phi(incoming) = &self.func.instructions[idx as usize].op {
                for (value, block) in incoming {
                    if block.index() == pred {
                        moves.push((*value, idx));
                    }
                }
            }
        }
        moves
    }

    /// Perform a parallel phi move set in two phases: park every incoming
    /// value in its phi's staging slot, then copy the staging slots into
    /// the phi slots. A phi that reads another phi of the same join thus
    /// always sees the pre-move value.
    fn emit_phi_moves(&mut self, moves: &[(ValueRef, u32)]) -> Result<()> {
        for &(value, phi) in moves {
            let staging = self.phi_staging(phi)?;
            self.load_value(Gpr::Rax, value)?;
            encode::store_slot(&mut self.buf, Gpr::Rax, staging, 8);
        }
        for &(_, phi) in moves {
            let staging = self.phi_staging(phi)?;
            encode::load_slot(&mut self.buf, Gpr::Rax, staging, 8);
            self.store_result(Gpr::Rax, phi)?;
        }
        Ok(())
    }

    fn phi_staging(&self, phi: u32) -> Result<i32> {
        self.frame.phi_staging.get(&phi).copied().ok_or_else(|| {
            Error::layout(format!(
                "phi %{} in `{}` has no staging slot",
                phi, self.func.name
            ))
        })
    }

    // ── Fixups ──

    fn apply_fixups(&mut self) -> Result<()> {
        let fixups = std::mem::take(&mut self.fixups);
        for fix in &fixups {
            let target = *self.labels.get(&fix.target).ok_or_else(|| {
                Error::layout(format!(
                    "unresolved jump target label {} in `{}`",
                    fix.target, self.func.name
                ))
            })?;
            let rel = target as i64 - (fix.patch_offset as i64 + 4);
            encode::patch_rel32(&mut self.buf, fix.patch_offset, rel as i32);
        }
        Ok(())
    }
}

/// IEEE-754 bit pattern of a float constant at the width of its type.
fn float_bits(value: f64, ty: &Type) -> i64 {
    match ty.float_bits() {
        Some(32) => (value as f32).to_bits() as i64,
        _ => value.to_bits() as i64,
    }
}
