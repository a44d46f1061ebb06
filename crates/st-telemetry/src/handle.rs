//! Scoped ownership of backend resources.
//!
//! A [`ScopedHandle`] owns one backend resource (an open file, a parquet
//! writer) and runs its release function exactly once when dropped. Handles
//! are move-only. Borrowed handles created with [`ScopedHandle::unowned`]
//! are never released.

use std::fmt;
use std::ops::{Deref, DerefMut};

/// Owner of a backend resource handle.
pub struct ScopedHandle<H> {
    handle: Option<H>,
    release: Option<fn(H)>,
}

impl<H> ScopedHandle<H> {
    /// Take ownership of `handle`; `release` runs on drop.
    pub fn new(handle: H, release: fn(H)) -> Self {
        Self {
            handle: Some(handle),
            release: Some(release),
        }
    }

    /// Wrap a handle this scope does not own.
    pub fn unowned(handle: H) -> Self {
        Self {
            handle: Some(handle),
            release: None,
        }
    }

    pub fn is_owned(&self) -> bool {
        self.release.is_some()
    }

    /// Give up ownership without running the release function.
    pub fn into_inner(mut self) -> H {
        self.release = None;
        match self.handle.take() {
            Some(h) => h,
            // `handle` is only taken here and in Drop.
            None => unreachable!("scoped handle already released"),
        }
    }

    /// Release the resource now.
    pub fn release(self) {
        drop(self)
    }
}

impl<H> Deref for ScopedHandle<H> {
    type Target = H;

    fn deref(&self) -> &H {
        match &self.handle {
            Some(h) => h,
            None => unreachable!("scoped handle already released"),
        }
    }
}

impl<H> DerefMut for ScopedHandle<H> {
    fn deref_mut(&mut self) -> &mut H {
        match &mut self.handle {
            Some(h) => h,
            None => unreachable!("scoped handle already released"),
        }
    }
}

impl<H: PartialEq> PartialEq<H> for ScopedHandle<H> {
    fn eq(&self, other: &H) -> bool {
        self.handle.as_ref() == Some(other)
    }
}

impl<H: fmt::Debug> fmt::Debug for ScopedHandle<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedHandle")
            .field("handle", &self.handle)
            .field("owned", &self.is_owned())
            .finish()
    }
}

impl<H> Drop for ScopedHandle<H> {
    fn drop(&mut self) {
        if let (Some(handle), Some(release)) = (self.handle.take(), self.release.take()) {
            release(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static RELEASED: AtomicUsize = AtomicUsize::new(0);

    fn count_release(_: u32) {
        RELEASED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_release_semantics() {
        let before = RELEASED.load(Ordering::SeqCst);
        {
            let h = ScopedHandle::new(7u32, count_release);
            assert!(h == 7);
            assert_eq!(*h, 7);
            // Moving transfers ownership; only one release happens.
            let moved = h;
            assert!(moved.is_owned());
        }
        assert_eq!(RELEASED.load(Ordering::SeqCst), before + 1);

        let h = ScopedHandle::new(9u32, count_release);
        assert_eq!(h.into_inner(), 9);
        assert_eq!(RELEASED.load(Ordering::SeqCst), before + 1);

        let h = ScopedHandle::unowned(3u32);
        assert!(!h.is_owned());
        h.release();
        assert_eq!(RELEASED.load(Ordering::SeqCst), before + 1);
    }
}
