//! Hot-swappable limiter parameters.
//!
//! Limiters keep the values an [`Adaptive`](crate::limiter::adaptive::Adaptive) wrapper may
//! change at runtime (limits, refill rates) in a [`DynamicConfig`]. Reads sit on the
//! admission hot path, so the default backend is `ArcSwap`; the `dynamic-rwlock` feature
//! swaps in a `RwLock` for targets where that is preferable.

use std::sync::Arc;

#[cfg(feature = "dynamic-rwlock")]
use std::sync::{PoisonError, RwLock};

#[cfg(not(feature = "dynamic-rwlock"))]
use arc_swap::ArcSwap;

/// Shared, live-updatable value. Clones observe the same value.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    #[cfg(not(feature = "dynamic-rwlock"))]
    inner: Arc<ArcSwap<T>>,
    #[cfg(feature = "dynamic-rwlock")]
    inner: Arc<RwLock<Arc<T>>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        #[cfg(not(feature = "dynamic-rwlock"))]
        {
            Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
        }
        #[cfg(feature = "dynamic-rwlock")]
        {
            Self { inner: Arc::new(RwLock::new(Arc::new(value))) }
        }
    }

    /// Snapshot the current value.
    pub fn get(&self) -> Arc<T> {
        #[cfg(not(feature = "dynamic-rwlock"))]
        {
            self.inner.load_full()
        }
        #[cfg(feature = "dynamic-rwlock")]
        {
            self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        #[cfg(not(feature = "dynamic-rwlock"))]
        {
            self.inner.store(Arc::new(value));
        }
        #[cfg(feature = "dynamic-rwlock")]
        {
            *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(value);
        }
    }

    /// Derive the next value from the current one.
    ///
    /// Concurrent updates do not lose writes: the arc-swap backend retries the closure
    /// against the latest value, the lock backend holds the write lock across it.
    pub fn update<F>(&self, f: F)
    where
        F: Fn(&T) -> T,
    {
        #[cfg(not(feature = "dynamic-rwlock"))]
        {
            self.inner.rcu(|cur| Arc::new(f(&**cur)));
        }
        #[cfg(feature = "dynamic-rwlock")]
        {
            let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let next = f(&**guard);
            *guard = Arc::new(next);
        }
    }
}

impl<T: Copy> DynamicConfig<T> {
    /// Copy out the current value.
    pub fn load(&self) -> T {
        *self.get()
    }
}

#[cfg(test)]
mod tests {
    use super::DynamicConfig;

    #[test]
    fn get_set_update() {
        let limit = DynamicConfig::new(10u32);
        assert_eq!(limit.load(), 10);
        limit.set(4);
        assert_eq!(limit.load(), 4);
        limit.update(|v| v * 3);
        assert_eq!(limit.load(), 12);
    }

    #[test]
    fn clones_share_value() {
        let a = DynamicConfig::new(1.5f64);
        let b = a.clone();
        b.set(2.5);
        assert_eq!(a.load(), 2.5);
    }
}
