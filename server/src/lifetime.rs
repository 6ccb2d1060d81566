//! Deferred teardown for objects shared between I/O tasks and the dispatcher.
//!
//! A connection or protocol may be closed while output messages still point
//! at it. Each such holder takes a [`Ref`]; the object is torn down exactly
//! once, after it has been released *and* the last reference is gone.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const RELEASED: usize = 0b01;
const TORN_DOWN: usize = 0b10;
/// References are counted in the bits above the two flags
const ONE_REF: usize = 0b100;

/// Reference count and release flags packed into one word, so acquiring
/// can never race past a teardown.
#[derive(Debug, Default)]
pub struct ReleaseLatch {
    state: AtomicUsize,
}

impl ReleaseLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a reference. Fails once the object has been torn down.
    pub fn acquire(&self) -> bool {
        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
                (state & TORN_DOWN == 0).then(|| state + ONE_REF)
            })
            .is_ok()
    }

    /// Drops a reference; true means the caller must run the teardown now
    pub fn release_ref(&self) -> bool {
        self.transition(|state| state.checked_sub(ONE_REF).map(settle))
    }

    /// Marks the object released; true means the caller must run the teardown now
    pub fn request_release(&self) -> bool {
        self.transition(|state| Some(settle(state | RELEASED)))
    }

    pub fn refs(&self) -> usize {
        self.state.load(Ordering::SeqCst) / ONE_REF
    }

    pub fn is_released(&self) -> bool {
        self.state.load(Ordering::SeqCst) & RELEASED != 0
    }

    pub fn is_torn_down(&self) -> bool {
        self.state.load(Ordering::SeqCst) & TORN_DOWN != 0
    }

    /// Applies `step`; true when this step is the one that set `TORN_DOWN`
    fn transition<F>(&self, step: F) -> bool
    where
        F: Fn(usize) -> Option<usize>,
    {
        match self.state.fetch_update(Ordering::SeqCst, Ordering::SeqCst, &step) {
            Ok(previous) => {
                previous & TORN_DOWN == 0
                    && step(previous).map_or(false, |next| next & TORN_DOWN != 0)
            }
            Err(_) => false,
        }
    }
}

/// Released with no references left and not yet torn down: claim the teardown
fn settle(state: usize) -> usize {
    if state == RELEASED {
        state | TORN_DOWN
    } else {
        state
    }
}

/// Something guarded by a [`ReleaseLatch`]
pub trait Releasable: Send + Sync {
    fn latch(&self) -> &ReleaseLatch;

    /// Final cleanup, run once on whichever thread dropped the last hold
    fn teardown(&self);
}

/// Marks `object` released, tearing it down now if nothing holds it
pub fn release<T: Releasable + ?Sized>(object: &T) {
    if object.latch().request_release() {
        object.teardown();
    }
}

/// A counted hold that delays teardown of `T` while it lives
pub struct Ref<T: Releasable + ?Sized> {
    inner: Arc<T>,
}

impl<T: Releasable + ?Sized> Ref<T> {
    pub fn acquire(inner: Arc<T>) -> Option<Self> {
        if inner.latch().acquire() {
            Some(Self { inner })
        } else {
            None
        }
    }

    pub fn arc(&self) -> &Arc<T> {
        &self.inner
    }
}

impl<T: Releasable + ?Sized> Deref for Ref<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: Releasable + ?Sized> Drop for Ref<T> {
    fn drop(&mut self) {
        if self.inner.latch().release_ref() {
            self.inner.teardown();
        }
    }
}

impl<T: Releasable + ?Sized> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ref")
            .field("refs", &self.inner.latch().refs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Resource {
        latch: ReleaseLatch,
        teardowns: AtomicUsize,
    }

    impl Releasable for Resource {
        fn latch(&self) -> &ReleaseLatch {
            &self.latch
        }

        fn teardown(&self) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_release_without_refs_tears_down_immediately() {
        let resource = Arc::new(Resource::default());
        release(&*resource);
        assert_eq!(resource.teardowns.load(Ordering::SeqCst), 1);
        assert!(Ref::acquire(Arc::clone(&resource)).is_none());
    }

    #[test]
    fn test_teardown_waits_for_last_ref() {
        let resource = Arc::new(Resource::default());
        let first = Ref::acquire(Arc::clone(&resource)).unwrap();
        let second = Ref::acquire(Arc::clone(&resource)).unwrap();

        release(&*resource);
        assert_eq!(resource.teardowns.load(Ordering::SeqCst), 0);

        drop(first);
        assert_eq!(resource.teardowns.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(resource.teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_refs_without_release_never_tear_down() {
        let resource = Arc::new(Resource::default());
        drop(Ref::acquire(Arc::clone(&resource)).unwrap());
        assert_eq!(resource.latch.refs(), 0);
        assert_eq!(resource.teardowns.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_double_release_tears_down_once() {
        let resource = Arc::new(Resource::default());
        release(&*resource);
        release(&*resource);
        assert_eq!(resource.teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_acquire_never_outlives_teardown() {
        for _ in 0..50 {
            let resource = Arc::new(Resource::default());
            let holders: Vec<_> = (0..4)
                .map(|_| {
                    let resource = Arc::clone(&resource);
                    std::thread::spawn(move || {
                        for _ in 0..200 {
                            match Ref::acquire(Arc::clone(&resource)) {
                                Some(held) => {
                                    assert_eq!(held.teardowns.load(Ordering::SeqCst), 0);
                                    assert!(!held.latch.is_torn_down());
                                }
                                None => break,
                            }
                        }
                    })
                })
                .collect();

            release(&*resource);
            for holder in holders {
                holder.join().unwrap();
            }
            assert!(resource.latch.is_torn_down());
            assert_eq!(resource.latch.refs(), 0);
            assert_eq!(resource.teardowns.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_concurrent_refs_tear_down_once() {
        let resource = Arc::new(Resource::default());
        let refs: Vec<_> = (0..16)
            .map(|_| Ref::acquire(Arc::clone(&resource)).unwrap())
            .collect();
        release(&*resource);

        let handles: Vec<_> = refs
            .into_iter()
            .map(|r| std::thread::spawn(move || drop(r)))
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(resource.teardowns.load(Ordering::SeqCst), 1);
    }
}
