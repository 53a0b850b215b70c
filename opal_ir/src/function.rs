//! Function and basic block definitions with arena storage.

use crate::instruction::Instruction;
use crate::types::Type;
use crate::value::{BlockRef, InstRef, ValueRef};

/// A named, typed function argument.
#[derive(Debug, Clone)]
pub struct Argument {
    pub name: String,
    pub ty: Type,
}

/// A basic block: a named contiguous range in the instruction arena.
#[derive(Debug)]
pub struct BasicBlock {
    pub name: String,
    pub inst_start: u32,
    pub inst_count: u32,
}

/// A function in the opal IR.
///
/// A function with no blocks is an external declaration; the back end emits
/// no code or symbol for it.
#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub ret_ty: Type,
    pub args: Vec<Argument>,
    /// Instruction arena: contiguous storage for all blocks.
    pub instructions: Vec<Instruction>,
    pub blocks: Vec<BasicBlock>,
}

impl Function {
    pub fn new(name: impl Into<String>, args: Vec<Argument>, ret_ty: Type) -> Self {
        Self {
            name: name.into(),
            ret_ty,
            args,
            instructions: Vec::new(),
            blocks: Vec::new(),
        }
    }

    /// True if this function has no body.
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Get an instruction by reference.
    pub fn inst(&self, r: InstRef) -> &Instruction {
        &self.instructions[r.0 as usize]
    }

    /// Get a basic block by reference.
    pub fn block(&self, r: BlockRef) -> &BasicBlock {
        &self.blocks[r.0 as usize]
    }

    /// Iterate instructions in a basic block.
    pub fn block_insts(&self, r: BlockRef) -> &[Instruction] {
        let bb = &self.blocks[r.0 as usize];
        let start = bb.inst_start as usize;
        let end = start + bb.inst_count as usize;
        &self.instructions[start..end]
    }

    /// Arena index range of a basic block's instructions.
    pub fn block_inst_range(&self, r: BlockRef) -> std::ops::Range<u32> {
        let bb = &self.blocks[r.0 as usize];
        bb.inst_start..bb.inst_start + bb.inst_count
    }

    /// Type of a value (argument or instruction result).
    pub fn value_type(&self, v: ValueRef) -> &Type {
        if v.is_argument() {
            &self.args[v.index() as usize].ty
        } else {
            &self.instructions[v.index() as usize].ty
        }
    }
}
