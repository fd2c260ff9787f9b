//! Ambient transaction manager boundary.
//!
//! The store's commit must not run inside whatever transaction the caller has
//! open with an outer transaction manager. [`AmbientSuspension`] suspends that
//! transaction for the duration of a scope and resumes it on drop, on both the
//! success and the error path.

use std::any::Any;

/// An ambient transaction detached from its context.
pub struct SuspendedTransaction(Box<dyn Any + Send>);

impl SuspendedTransaction {
    pub fn new(handle: impl Any + Send) -> Self {
        Self(Box::new(handle))
    }

    /// Recovers the manager-specific handle.
    ///
    /// # Errors
    ///
    /// Returns `self` unchanged if the handle is not a `T`.
    pub fn downcast<T: Any>(self) -> Result<T, Self> {
        self.0.downcast::<T>().map(|b| *b).map_err(Self)
    }
}

impl std::fmt::Debug for SuspendedTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SuspendedTransaction")
    }
}

/// Outer transaction manager whose transaction can be suspended.
///
/// Used as `Arc<dyn TransactionManager>`.
pub trait TransactionManager: Send + Sync {
    /// Detaches the current ambient transaction, if any.
    fn suspend(&self) -> Option<SuspendedTransaction>;

    /// Re-attaches a transaction returned by [`suspend`](Self::suspend).
    fn resume(&self, tx: SuspendedTransaction);
}

/// Scope guard: suspends on creation, resumes on drop.
pub struct AmbientSuspension<'a> {
    manager: Option<&'a dyn TransactionManager>,
    suspended: Option<SuspendedTransaction>,
}

impl<'a> AmbientSuspension<'a> {
    #[must_use]
    pub fn new(manager: Option<&'a dyn TransactionManager>) -> Self {
        let suspended = manager.and_then(TransactionManager::suspend);
        Self { manager, suspended }
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspended.is_some()
    }
}

impl Drop for AmbientSuspension<'_> {
    fn drop(&mut self) {
        if let (Some(manager), Some(tx)) = (self.manager, self.suspended.take()) {
            manager.resume(tx);
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct Ambient {
        current: Mutex<Option<u32>>,
    }

    impl TransactionManager for Ambient {
        fn suspend(&self) -> Option<SuspendedTransaction> {
            self.current.lock().take().map(SuspendedTransaction::new)
        }

        fn resume(&self, tx: SuspendedTransaction) {
            if let Ok(id) = tx.downcast::<u32>() {
                *self.current.lock() = Some(id);
            }
        }
    }

    #[test]
    fn suspends_for_the_scope_only() {
        let manager = Ambient::default();
        *manager.current.lock() = Some(7);
        {
            let guard = AmbientSuspension::new(Some(&manager));
            assert!(guard.is_suspended());
            assert_eq!(*manager.current.lock(), None);
        }
        assert_eq!(*manager.current.lock(), Some(7));
    }

    #[test]
    fn nothing_to_suspend() {
        let manager = Ambient::default();
        let guard = AmbientSuspension::new(Some(&manager));
        assert!(!guard.is_suspended());
        let none = AmbientSuspension::new(None);
        assert!(!none.is_suspended());
    }

    #[test]
    fn downcast_mismatch_returns_handle() {
        let tx = SuspendedTransaction::new(5u32);
        let tx = tx.downcast::<String>().unwrap_err();
        assert_eq!(tx.downcast::<u32>().unwrap(), 5);
    }
}
