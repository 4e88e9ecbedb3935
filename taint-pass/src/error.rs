use thiserror::Error;

#[derive(Debug, Error)]
pub enum PassError {
    /// Invoke never appears in code-generated translation blocks; seeing
    /// one means the module is not ours to rewrite.
    #[error("cannot rewrite invoke instructions")]
    InvokeUnsupported,

    #[error("function `{function}` uses {needed} value slots but the shadow holds {limit}")]
    TooManyValues {
        function: String,
        needed: u64,
        limit: u64,
    },

    #[error("malformed IR: {0}")]
    Malformed(&'static str),
}
