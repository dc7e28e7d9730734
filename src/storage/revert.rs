//! Undo stack for multi-step mutating operations.
//!
//! Every lifecycle operation that performs more than one external effect
//! pushes an inverse action after each completed step. Dropping the stack
//! without committing runs the inverses in reverse order, so a failure part
//! way through never leaves partial state behind.

/// A scoped stack of undo actions.
pub struct Revert<'a> {
    actions: Vec<Box<dyn FnOnce() + 'a>>,
    committed: bool,
}

impl<'a> Revert<'a> {
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
            committed: false,
        }
    }

    /// Register the inverse of a step that just succeeded.
    pub fn push<F: FnOnce() + 'a>(&mut self, action: F) {
        self.actions.push(Box::new(action));
    }

    /// The operation succeeded; discard all undo actions.
    pub fn commit(mut self) {
        self.committed = true;
        self.actions.clear();
    }
}

impl Default for Revert<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Revert<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for action in self.actions.drain(..).rev() {
            action();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_revert_runs_in_reverse_order() {
        let log = RefCell::new(Vec::new());
        {
            let mut revert = Revert::new();
            revert.push(|| log.borrow_mut().push(1));
            revert.push(|| log.borrow_mut().push(2));
            revert.push(|| log.borrow_mut().push(3));
        }
        assert_eq!(*log.borrow(), vec![3, 2, 1]);
    }

    #[test]
    fn test_commit_discards_actions() {
        let log = RefCell::new(Vec::new());
        {
            let mut revert = Revert::new();
            revert.push(|| log.borrow_mut().push(1));
            revert.commit();
        }
        assert!(log.borrow().is_empty());
    }
}
