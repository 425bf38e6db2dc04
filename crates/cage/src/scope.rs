//! Stack-discipline ownership of disposables.
//!
//! Guest handles are rooted in engine-owned storage that must be released
//! before the runtime is torn down; leaking one leaks engine memory and can
//! pin the runtime. A [`Scope`] collects cleanups in registration order and
//! runs them in reverse on [`Scope::close`], which is guaranteed on success,
//! failure, and cancellation (via [`ScopeGuard`]). Automatic finalization is
//! deliberately not relied upon for ordering.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

type Cleanup = Box<dyn FnOnce() -> anyhow::Result<()>>;

/// A resource registered with a scope. `dispose_scoped` must tolerate the
/// resource having been released through another owner already.
pub trait ScopeDispose {
    fn dispose_scoped(&self) -> anyhow::Result<()>;
}

#[derive(Debug, thiserror::Error)]
#[error("scope is closed")]
pub struct ScopeClosed;

#[derive(Clone, Default)]
pub struct Scope {
    inner: Rc<ScopeInner>,
}

#[derive(Default)]
struct ScopeInner {
    cleanups: RefCell<Vec<Cleanup>>,
    closed: Cell<bool>,
}

impl Scope {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cleanup to run at close, LIFO relative to other cleanups.
    ///
    /// # Errors
    /// Fails if the scope has already closed.
    pub fn defer(
        &self,
        cleanup: impl FnOnce() -> anyhow::Result<()> + 'static,
    ) -> Result<(), ScopeClosed> {
        if self.inner.closed.get() {
            return Err(ScopeClosed);
        }
        self.inner.cleanups.borrow_mut().push(Box::new(cleanup));
        Ok(())
    }

    /// Take ownership of a disposable and hand it back to the caller.
    ///
    /// # Errors
    /// Fails if the scope has already closed.
    pub fn manage<D: ScopeDispose + Clone + 'static>(&self, item: D) -> Result<D, ScopeClosed> {
        let owned = item.clone();
        self.defer(move || owned.dispose_scoped())?;
        Ok(item)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Dispose everything in reverse registration order. Idempotent; the
    /// first cleanup error is returned after all cleanups have run.
    pub fn close(&self) -> anyhow::Result<()> {
        if self.inner.closed.replace(true) {
            return Ok(());
        }
        let mut cleanups = self.inner.cleanups.take();
        let mut first_err = None;
        while let Some(cleanup) = cleanups.pop() {
            if let Err(err) = cleanup() {
                tracing::warn!(error = %err, "scope cleanup failed");
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// A guard that closes the scope when dropped, covering cancellation of
    /// the enclosing future. Errors raised during a guard-driven close are
    /// logged; call [`Scope::close`] explicitly to observe them.
    #[must_use]
    pub fn guard(&self) -> ScopeGuard {
        ScopeGuard {
            scope: self.clone(),
        }
    }
}

pub struct ScopeGuard {
    scope: Scope,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if !self.scope.is_closed() {
            let _ = self.scope.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Scope;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn cleanups_run_in_reverse_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let scope = Scope::new();
        for i in 0..3 {
            let order = Rc::clone(&order);
            scope
                .defer(move || {
                    order.borrow_mut().push(i);
                    Ok(())
                })
                .expect("open scope");
        }
        scope.close().expect("close");
        assert_eq!(*order.borrow(), vec![2, 1, 0]);
    }

    #[test]
    fn close_is_idempotent_and_rejects_late_registration() {
        let count = Rc::new(RefCell::new(0));
        let scope = Scope::new();
        {
            let count = Rc::clone(&count);
            scope
                .defer(move || {
                    *count.borrow_mut() += 1;
                    Ok(())
                })
                .expect("open scope");
        }
        scope.close().expect("close");
        scope.close().expect("second close");
        assert_eq!(*count.borrow(), 1);
        assert!(scope.defer(|| Ok(())).is_err());
    }

    #[test]
    fn first_cleanup_error_wins_but_all_cleanups_run() {
        let ran = Rc::new(RefCell::new(Vec::new()));
        let scope = Scope::new();
        for i in 0..2 {
            let ran = Rc::clone(&ran);
            scope
                .defer(move || {
                    ran.borrow_mut().push(i);
                    Err(anyhow::anyhow!("cleanup {i}"))
                })
                .expect("open scope");
        }
        let err = scope.close().expect_err("close should fail");
        // LIFO: cleanup 1 runs first, so its error is reported.
        assert_eq!(err.to_string(), "cleanup 1");
        assert_eq!(*ran.borrow(), vec![1, 0]);
    }

    #[test]
    fn guard_closes_on_drop() {
        let closed = Rc::new(RefCell::new(false));
        let scope = Scope::new();
        {
            let closed = Rc::clone(&closed);
            scope
                .defer(move || {
                    *closed.borrow_mut() = true;
                    Ok(())
                })
                .expect("open scope");
        }
        {
            let _guard = scope.guard();
        }
        assert!(*closed.borrow());
        assert!(scope.is_closed());
    }
}
