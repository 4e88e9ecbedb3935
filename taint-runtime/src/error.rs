use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaintError {
    /// The dynamic value log does not line up with the taint-op stream.
    /// This means the instrumented code and the compiled op buffer disagree
    /// about what ran; there is no way to continue.
    #[error("dynamic value log does not align: expected {expected} in {context}")]
    LogMisaligned {
        expected: &'static str,
        context: &'static str,
    },

    #[error("dynamic value log exhausted while fixing up {context}")]
    LogExhausted { context: &'static str },

    #[error("dynamic value log overflow (capacity {capacity} entries)")]
    LogOverflow { capacity: usize },

    #[error("insn-start fix-up runs past the end of its basic block ({needed} ops, {available} left)")]
    OpCountOverrun { needed: usize, available: usize },

    #[error("taint op touches an unresolved address that no fix-up filled in")]
    UnresolvedAddr,

    #[error("call to unknown compiled function `{0}`")]
    UnknownFunction(String),

    #[error("return op with no frame to pop")]
    FrameUnderflow,

    #[error("frame index {frame} out of range (limit {limit})")]
    FrameOverflow { frame: u32, limit: u32 },

    #[error("branch transfers to unknown basic block {bb}")]
    UnknownBlock { bb: u64 },

    #[error("no phi source matches previous basic block {prev_bb}")]
    PhiSourceMissing { prev_bb: u64 },

    #[error("shadow allocation of {bytes} bytes failed: {source}")]
    Alloc {
        bytes: u64,
        #[source]
        source: std::io::Error,
    },
}
