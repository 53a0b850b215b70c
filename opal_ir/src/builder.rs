//! Builder API for constructing opal IR functions.

use crate::function::{BasicBlock, Function};
use crate::instruction::{FCmpOp, ICmpOp, Instruction, Op, SwitchCase};
use crate::types::Type;
use crate::value::{BlockRef, GlobalRef, ValueRef};

/// Builder for filling in a function's blocks and instructions.
///
/// Blocks must be filled one at a time: switching to a block pins its start
/// in the instruction arena, and instructions are appended contiguously until
/// the next switch.
pub struct Builder<'a> {
    func: &'a mut Function,
    current_block: Option<BlockRef>,
}

impl<'a> Builder<'a> {
    pub fn new(func: &'a mut Function) -> Self {
        Self {
            func,
            current_block: None,
        }
    }

    /// Create a new basic block and return its reference.
    pub fn create_block(&mut self, name: impl Into<String>) -> BlockRef {
        let idx = self.func.blocks.len() as u32;
        self.func.blocks.push(BasicBlock {
            name: name.into(),
            inst_start: self.func.instructions.len() as u32,
            inst_count: 0,
        });
        BlockRef::new(idx)
    }

    /// Set the current block for subsequent instructions.
    pub fn switch_to_block(&mut self, block: BlockRef) {
        let bb = &mut self.func.blocks[block.index() as usize];
        if bb.inst_count == 0 {
            bb.inst_start = self.func.instructions.len() as u32;
        }
        self.current_block = Some(block);
    }

    /// ValueRef for function argument `i`.
    pub fn arg(&self, i: u32) -> ValueRef {
        debug_assert!((i as usize) < self.func.args.len());
        ValueRef::argument(i)
    }

    fn push(&mut self, op: Op, ty: Type) -> ValueRef {
        let block = self.current_block.expect("no current block");
        let idx = self.func.instructions.len() as u32;
        self.func.instructions.push(Instruction { op, ty });
        self.func.blocks[block.index() as usize].inst_count += 1;
        ValueRef::inst_result(idx)
    }

    // ── Constants ──

    pub fn const_int(&mut self, ty: Type, value: i64) -> ValueRef {
        self.push(Op::ConstInt(value), ty)
    }

    pub fn const_float(&mut self, ty: Type, value: f64) -> ValueRef {
        self.push(Op::ConstFloat(value), ty)
    }

    pub fn global_addr(&mut self, global: GlobalRef, pointee: Type) -> ValueRef {
        self.push(Op::GlobalAddr(global), Type::ptr_to(pointee))
    }

    // ── Integer arithmetic ──

    pub fn add(&mut self, a: ValueRef, b: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::Add(a, b), ty)
    }

    pub fn sub(&mut self, a: ValueRef, b: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::Sub(a, b), ty)
    }

    pub fn mul(&mut self, a: ValueRef, b: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::Mul(a, b), ty)
    }

    pub fn udiv(&mut self, a: ValueRef, b: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::UDiv(a, b), ty)
    }

    pub fn sdiv(&mut self, a: ValueRef, b: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::SDiv(a, b), ty)
    }

    pub fn urem(&mut self, a: ValueRef, b: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::URem(a, b), ty)
    }

    pub fn srem(&mut self, a: ValueRef, b: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::SRem(a, b), ty)
    }

    // ── Bitwise ──

    pub fn and(&mut self, a: ValueRef, b: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::And(a, b), ty)
    }

    pub fn or(&mut self, a: ValueRef, b: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::Or(a, b), ty)
    }

    pub fn xor(&mut self, a: ValueRef, b: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::Xor(a, b), ty)
    }

    pub fn shl(&mut self, a: ValueRef, b: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::Shl(a, b), ty)
    }

    pub fn lshr(&mut self, a: ValueRef, b: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::LShr(a, b), ty)
    }

    pub fn ashr(&mut self, a: ValueRef, b: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::AShr(a, b), ty)
    }

    // ── Comparison ──

    pub fn icmp(&mut self, op: ICmpOp, a: ValueRef, b: ValueRef) -> ValueRef {
        self.push(Op::ICmp(op, a, b), Type::Int(1))
    }

    pub fn fcmp(&mut self, op: FCmpOp, a: ValueRef, b: ValueRef) -> ValueRef {
        self.push(Op::FCmp(op, a, b), Type::Int(1))
    }

    // ── Float arithmetic ──

    pub fn fadd(&mut self, a: ValueRef, b: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::FAdd(a, b), ty)
    }

    pub fn fsub(&mut self, a: ValueRef, b: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::FSub(a, b), ty)
    }

    pub fn fmul(&mut self, a: ValueRef, b: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::FMul(a, b), ty)
    }

    pub fn fdiv(&mut self, a: ValueRef, b: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::FDiv(a, b), ty)
    }

    // ── Memory ──

    pub fn alloca(&mut self, elem: Type, count: Option<ValueRef>) -> ValueRef {
        let ptr_ty = Type::ptr_to(elem.clone());
        self.push(Op::Alloca { elem, count }, ptr_ty)
    }

    pub fn load(&mut self, ptr: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::Load(ptr), ty)
    }

    pub fn store(&mut self, value: ValueRef, ptr: ValueRef) {
        self.push(Op::Store(value, ptr), Type::Void);
    }

    pub fn gep(
        &mut self,
        base: ValueRef,
        source_elem: Type,
        indices: Vec<ValueRef>,
        result_pointee: Type,
    ) -> ValueRef {
        self.push(
            Op::Gep {
                base,
                source_elem,
                indices,
            },
            Type::ptr_to(result_pointee),
        )
    }

    // ── Aggregates ──

    pub fn extract_value(&mut self, agg: ValueRef, indices: Vec<u32>, ty: Type) -> ValueRef {
        self.push(Op::ExtractValue { agg, indices }, ty)
    }

    pub fn insert_value(
        &mut self,
        agg: ValueRef,
        value: ValueRef,
        indices: Vec<u32>,
        ty: Type,
    ) -> ValueRef {
        self.push(Op::InsertValue { agg, value, indices }, ty)
    }

    // ── Other operations ──

    pub fn select(&mut self, cond: ValueRef, t: ValueRef, f: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::Select(cond, t, f), ty)
    }

    pub fn call(&mut self, callee: impl Into<String>, args: Vec<ValueRef>, ret_ty: Type) -> ValueRef {
        self.push(
            Op::Call {
                callee: callee.into(),
                args,
            },
            ret_ty,
        )
    }

    pub fn phi(&mut self, incoming: Vec<(ValueRef, BlockRef)>, ty: Type) -> ValueRef {
        self.push(Op::Phi(incoming), ty)
    }

    // ── Casts ──

    pub fn trunc(&mut self, v: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::Trunc(v), ty)
    }

    pub fn zext(&mut self, v: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::ZExt(v), ty)
    }

    pub fn sext(&mut self, v: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::SExt(v), ty)
    }

    pub fn fptrunc(&mut self, v: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::FPTrunc(v), ty)
    }

    pub fn fpext(&mut self, v: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::FPExt(v), ty)
    }

    pub fn fptosi(&mut self, v: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::FPToSI(v), ty)
    }

    pub fn sitofp(&mut self, v: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::SIToFP(v), ty)
    }

    pub fn bitcast(&mut self, v: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::Bitcast(v), ty)
    }

    pub fn ptr_to_int(&mut self, v: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::PtrToInt(v), ty)
    }

    pub fn int_to_ptr(&mut self, v: ValueRef, ty: Type) -> ValueRef {
        self.push(Op::IntToPtr(v), ty)
    }

    // ── Terminators ──

    pub fn ret(&mut self, value: Option<ValueRef>) {
        self.push(Op::Ret(value), Type::Void);
    }

    pub fn br(&mut self, target: BlockRef) {
        self.push(Op::Br(target), Type::Void);
    }

    pub fn cond_br(&mut self, cond: ValueRef, then_block: BlockRef, else_block: BlockRef) {
        self.push(Op::CondBr(cond, then_block, else_block), Type::Void);
    }

    pub fn switch(&mut self, value: ValueRef, cases: Vec<SwitchCase>, default: BlockRef) {
        self.push(
            Op::Switch {
                value,
                cases,
                default,
            },
            Type::Void,
        );
    }
}
