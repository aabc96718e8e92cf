//! Cooperative cancellation
//!
//! A [`CancellationToken`] is polled at row-read and iteration-advance
//! boundaries. A cancelled token turns the next poll into
//! [`HierarchyError::Cancelled`], which callers propagate with `?`; any cache
//! write in progress sits inside a savepoint that rolls back on drop.

use crate::error::{HierarchyError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; every clone observes it
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Poll the token at a safe point
    ///
    /// # Errors
    ///
    /// Returns [`HierarchyError::Cancelled`] once [`cancel`](Self::cancel) was called.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(HierarchyError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());

        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(HierarchyError::Cancelled)));
    }
}
