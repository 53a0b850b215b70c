//! Error taxonomy for the code generator.

/// Errors surfaced to the caller of a compile or write operation.
///
/// There is no in-band recovery: the first error aborts the compilation and
/// any partially emitted machine code is discarded.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An IR instruction has a shape that cannot be encoded (dynamic alloca
    /// count, non-constant struct GEP index, unsupported operand size, ...).
    #[error("cannot encode `{op}` in function `{function}`")]
    Encoding { op: String, function: String },

    /// An internal layout invariant was violated (unresolved jump target,
    /// missing alloca storage slot, relocation against an unindexed symbol).
    #[error("layout error: {0}")]
    Layout(String),

    /// The output sink rejected bytes while writing the object file.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn encoding(op: &str, function: &str) -> Self {
        Error::Encoding {
            op: op.to_string(),
            function: function.to_string(),
        }
    }

    pub fn layout(msg: impl Into<String>) -> Self {
        Error::Layout(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
