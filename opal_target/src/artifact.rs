//! The machine-code artifact produced by a module compilation.

use crate::reloc::Relocation;

/// What a defined symbol refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// A function body in the text buffer.
    Function,
    /// An initialized global in the data buffer.
    Object,
}

/// A symbol defined by the compiled module.
#[derive(Debug, Clone)]
pub struct SymbolDef {
    pub name: String,
    /// Offset into the text buffer (functions) or data buffer (objects).
    pub offset: u64,
    pub size: u64,
    pub kind: SymbolKind,
}

/// Raw compilation output, ready to be wrapped in an object container.
#[derive(Debug, Default)]
pub struct Artifact {
    /// Machine code of all function bodies, concatenated in definition order.
    pub text: Vec<u8>,
    /// Initialized global data, each global aligned to 8 bytes.
    pub data: Vec<u8>,
    pub symbols: Vec<SymbolDef>,
    pub relocations: Vec<Relocation>,
}
