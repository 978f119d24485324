//! Per-call cancellation tokens with parent→child fan-out.
//!
//! Every in-flight activity of a call (TTS playout, LLM turn, tool
//! dispatch) holds a child of the call's root token. Cancelling a parent
//! cancels all of its descendants; hangup cancels the root.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

struct Shared {
    cancelled: AtomicBool,
    children: Mutex<Vec<Weak<Shared>>>,
}

impl Shared {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        let children = std::mem::take(&mut *self.children.lock());
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }
    }
}

/// A cancellation token checked by the runtime loops.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Shared>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Shared {
                cancelled: AtomicBool::new(false),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Signal cancellation of this token and every descendant.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Derive a child token. A child born of a cancelled parent starts
    /// cancelled.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        if self.is_cancelled() {
            child.cancel();
        } else {
            self.inner
                .children
                .lock()
                .push(Arc::downgrade(&child.inner));
        }
        child
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_lifecycle() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn cancel_cascades_to_children_and_grandchildren() {
        let root = CancelToken::new();
        let child = root.child();
        let grandchild = child.child();

        root.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn child_cancel_does_not_touch_parent() {
        let root = CancelToken::new();
        let child = root.child();
        child.cancel();
        assert!(!root.is_cancelled());
    }

    #[test]
    fn child_of_cancelled_parent_starts_cancelled() {
        let root = CancelToken::new();
        root.cancel();
        assert!(root.child().is_cancelled());
    }

    #[test]
    fn siblings_are_independent() {
        let root = CancelToken::new();
        let a = root.child();
        let b = root.child();
        a.cancel();
        assert!(!b.is_cancelled());
    }
}
