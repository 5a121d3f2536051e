use std::fmt;
use std::io;

use thiserror::Error;

/// Identifies a fixed-size page in the shared page cache.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A position on the monotonically increasing slot-offset axis of a WAL.
///
/// Offsets never decrease; comparison uses modular ordering so a log may
/// wrap within a `u64` window (see [`crate::slot::slot_lt`]).
pub type SlotOffset = u64;

/// Maximum recursion level for recycle-induced page drops.
pub const MAX_PAGE_REF_DEPTH: u32 = 32;

#[derive(Debug, Error)]
pub enum MareaError {
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    #[error("log full: {0}")]
    LogFull(&'static str),
    #[error("shutdown: {0}")]
    Shutdown(&'static str),
    #[error("decode: {0}")]
    Decode(&'static str),
    #[error("corruption: {0}")]
    Corruption(&'static str),
    #[error("refcount overflow on page {0}")]
    RefcountOverflow(PageId),
    #[error("recycle recursion depth {0} exceeds limit")]
    RecursionDepthExceeded(u32),
    #[error("job not committable: {0}")]
    JobNotCommittable(&'static str),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

// IO errors are duplicated by kind and message so failures can fan out to
// every waiter in an append sequence.
impl Clone for MareaError {
    fn clone(&self) -> Self {
        match self {
            MareaError::Io(err) => MareaError::Io(io::Error::new(err.kind(), err.to_string())),
            MareaError::LogFull(msg) => MareaError::LogFull(msg),
            MareaError::Shutdown(msg) => MareaError::Shutdown(msg),
            MareaError::Decode(msg) => MareaError::Decode(msg),
            MareaError::Corruption(msg) => MareaError::Corruption(msg),
            MareaError::RefcountOverflow(page) => MareaError::RefcountOverflow(*page),
            MareaError::RecursionDepthExceeded(depth) => MareaError::RecursionDepthExceeded(*depth),
            MareaError::JobNotCommittable(msg) => MareaError::JobNotCommittable(msg),
            MareaError::Invalid(msg) => MareaError::Invalid(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, MareaError>;
