//! Errors raised while setting up a playing context.

/// Why a context could not be created.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("{pool} buffer pool exhausted")]
    PoolExhausted { pool: &'static str },

    #[error("invalid loop interval [{start}, {finish})")]
    InvalidLoop { start: u64, finish: u64 },

    #[error("source has no known length and cannot be fully buffered")]
    UnboundedSource,

    #[error("sound of {samples} samples does not fit in a {limit} byte buffer")]
    SoundTooLarge { samples: u64, limit: usize },
}

pub type ContextResult<T> = Result<T, ContextError>;
