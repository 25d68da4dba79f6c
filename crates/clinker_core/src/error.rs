//! Error types for the clinker heap.

use thiserror::Error;

/// All errors that can be produced by the heap's mutator-facing API.
///
/// The collector itself has no recoverable errors: conditions that would be
/// errors elsewhere (marking-stack overflow, compaction allocation shortfall)
/// are either handled in-band or are fatal assertions.
#[derive(Debug, Error)]
pub enum HeapError {
    /// A space ran out of room and a collection could not help.
    #[error("out of memory in {0}")]
    OutOfMemory(&'static str),

    /// An allocation request exceeded the maximum size a space supports.
    #[error("allocation of {size} bytes exceeds the space limit of {limit}")]
    ObjectTooLarge { size: usize, limit: usize },
}

/// Convenient `Result` alias for fallible heap operations.
pub type HeapResult<T> = Result<T, HeapError>;
