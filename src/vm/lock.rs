//! Hooks serializing the few operations that touch a state from more than one thread.

use parking_lot::{lock_api::RawMutex as _, RawMutex};

/// Lock taken around thread creation.
pub trait StateLock {
    fn lock(&self);

    /// # Safety
    ///
    /// The lock must be held in the current context, i.e. taken by a matching `lock`.
    unsafe fn unlock(&self);
}

/// Default for states used from a single thread.
pub struct NoLock;

impl StateLock for NoLock {
    #[inline(always)]
    fn lock(&self) {}

    #[inline(always)]
    unsafe fn unlock(&self) {}
}

pub struct MutexLock {
    raw: RawMutex,
}

impl MutexLock {
    pub const fn new() -> Self {
        Self { raw: RawMutex::INIT }
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

impl Default for MutexLock {
    fn default() -> Self {
        Self::new()
    }
}

impl StateLock for MutexLock {
    fn lock(&self) {
        self.raw.lock();
    }

    unsafe fn unlock(&self) {
        debug_assert!(self.raw.is_locked());
        unsafe {
            self.raw.unlock();
        }
    }
}

impl<L: StateLock + ?Sized> StateLock for std::sync::Arc<L> {
    fn lock(&self) {
        (**self).lock()
    }

    unsafe fn unlock(&self) {
        unsafe { (**self).unlock() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutex_lock_pairs() {
        let lock = MutexLock::new();
        lock.lock();
        assert!(lock.is_locked());
        unsafe { lock.unlock() };
        assert!(!lock.is_locked());
    }

    #[test]
    fn shared_lock_forwards() {
        let lock = std::sync::Arc::new(MutexLock::new());
        let boxed: Box<dyn StateLock + Send> = Box::new(lock.clone());
        boxed.lock();
        assert!(lock.is_locked());
        unsafe { boxed.unlock() };
        assert!(!lock.is_locked());
    }
}
