//! The pool's error taxonomy.
//!
//! Allocation failure is a plain `None`; request rejection is a silent
//! `None`; free-path protocol violations are logged at error (critical)
//! severity and otherwise ignored by the caller. This module only names
//! the free-path violations, since those are the only errors with
//! stable, documented diagnostic text.

use std::fmt;

/// A free-path protocol violation: the pointer passed to `free`/`release`
/// does not correspond to a valid, currently-allocated block.
///
/// The pool never acts on these beyond logging: the offending free is
/// simply ignored, so the pool's own invariants stay intact even when a
/// caller has a bug.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FreePathViolation {
    /// `p` does not fall inside any block this pool owns.
    OutOfPool,
    /// `p` falls inside a large block, but isn't that block's start.
    MiddleOfBlock,
    /// `p` falls on a page that is already on the free-pages list.
    AlreadyFreePage,
    /// `p` falls on a page serving non-freeable (`get`/`nget`) allocations.
    NonFreeablePage,
    /// `p` does not land on a chunk boundary for its page's chunk size.
    WrongChunk,
    /// `p`'s chunk is already marked free in its page's bitmap.
    AlreadyFreeChunk,
    /// `p` doesn't match its page's base, for a whole-page allocation.
    InvalidChunkPointer,
}

impl FreePathViolation {
    /// The stable, human-readable prefix for this violation.
    pub fn prefix(self) -> &'static str {
        match self {
            FreePathViolation::OutOfPool => "freed pointer is out of pool",
            FreePathViolation::MiddleOfBlock => "freed pointer points to middle of block",
            FreePathViolation::AlreadyFreePage => "freed pointer points to already free page",
            FreePathViolation::NonFreeablePage => "freed pointer points to non-freeable page",
            FreePathViolation::WrongChunk => "freed pointer points to wrong chunk",
            FreePathViolation::AlreadyFreeChunk => "freed pointer points to already free chunk",
            FreePathViolation::InvalidChunkPointer => "invalid pointer to chunk",
        }
    }
}

impl fmt::Display for FreePathViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

impl std::error::Error for FreePathViolation {}

/// Logs a free-path violation at critical (error) severity, matching the
/// pool's documented behavior: misuse is reported, never acted on.
pub(crate) fn log_free_violation(violation: FreePathViolation, p: *mut u8) {
    log::error!("{}: {:p}", violation.prefix(), p);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefixes_are_stable() {
        assert_eq!(FreePathViolation::OutOfPool.prefix(), "freed pointer is out of pool");
        assert_eq!(
            FreePathViolation::MiddleOfBlock.prefix(),
            "freed pointer points to middle of block"
        );
        assert_eq!(
            FreePathViolation::AlreadyFreePage.prefix(),
            "freed pointer points to already free page"
        );
        assert_eq!(
            FreePathViolation::NonFreeablePage.prefix(),
            "freed pointer points to non-freeable page"
        );
        assert_eq!(FreePathViolation::WrongChunk.prefix(), "freed pointer points to wrong chunk");
        assert_eq!(
            FreePathViolation::AlreadyFreeChunk.prefix(),
            "freed pointer points to already free chunk"
        );
        assert_eq!(FreePathViolation::InvalidChunkPointer.prefix(), "invalid pointer to chunk");
    }
}
