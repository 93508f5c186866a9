//! # Memory manager
//!
//! Every block the runtime holds is obtained through [`Memory`]. The actual byte mover is an
//! injected [`Allocator`] with `realloc` semantics; [`Memory`] wraps it and keeps the collector's
//! debt accounting up to date, so that `totalbytes + gcdebt` always equals the number of bytes
//! the state holds, the block of the shared state record included.
//!
//! Blocks are handed out as [`LVec`] and [`LBox`]. Neither of them frees itself on drop: they are
//! released explicitly through the manager, exactly like the accounting requires.

use std::{
    alloc::Layout,
    marker::PhantomData,
    mem::{align_of, size_of},
    ops::{Deref, DerefMut, Index, IndexMut},
    ptr::NonNull,
};

use crate::runtime::error::{LuaError, LuaResult};

/// Alignment of every block handed out by an [`Allocator`].
pub const MAX_ALIGN: usize = 16;
/// Smallest capacity a growable vector is given.
pub const MIN_ARRAY_SIZE: usize = 4;
pub const MAX_LMEM: isize = isize::MAX;

/// Realloc-style memory primitive.
///
/// * `realloc(None, _, n)` creates a new block of `n` bytes.
/// * `realloc(Some(p), o, 0)` frees `p` and returns `None`.
/// * `realloc(None, 0, 0)` does nothing.
/// * Reallocating a block to an equal or smaller size must not fail.
///
/// # Safety
///
/// Every block returned must be valid for `new_size` bytes, aligned to [`MAX_ALIGN`] and
/// keep the contents of the old block up to the smaller of both sizes. [`LVec`] and
/// [`LBox`] place values straight into these blocks.
pub unsafe trait Allocator {
    /// # Safety
    ///
    /// `block`, when present, must have been returned by this allocator and currently hold
    /// `old_size` bytes.
    unsafe fn realloc(
        &mut self,
        block: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>>;

    /// Bytes currently held, if the allocator keeps track of them.
    fn in_use(&self) -> Option<usize> {
        None
    }
}

#[inline]
fn block_layout(size: usize) -> Option<Layout> {
    Layout::from_size_align(size, MAX_ALIGN).ok()
}

/// Allocator backed by the global Rust allocator.
#[derive(Default, Clone, Copy, Debug)]
pub struct SystemAllocator;

unsafe impl Allocator for SystemAllocator {
    unsafe fn realloc(
        &mut self,
        block: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        match (block, new_size) {
            (None, 0) => None,
            (Some(ptr), 0) => {
                std::alloc::dealloc(
                    ptr.as_ptr(),
                    Layout::from_size_align_unchecked(old_size, MAX_ALIGN),
                );
                None
            }
            (None, size) => NonNull::new(std::alloc::alloc(block_layout(size)?)),
            (Some(ptr), size) => {
                block_layout(size)?;
                NonNull::new(std::alloc::realloc(
                    ptr.as_ptr(),
                    Layout::from_size_align_unchecked(old_size, MAX_ALIGN),
                    size,
                ))
            }
        }
    }
}

/// Wraps another allocator, counting live bytes and optionally refusing to grow past a limit.
pub struct CountingAllocator<A: Allocator = SystemAllocator> {
    inner: A,
    live: usize,
    peak: usize,
    limit: Option<usize>,
}

impl CountingAllocator<SystemAllocator> {
    pub fn new() -> Self {
        Self::wrap(SystemAllocator)
    }

    pub fn with_limit(limit: usize) -> Self {
        let mut this = Self::new();
        this.limit = Some(limit);
        this
    }
}

impl Default for CountingAllocator<SystemAllocator> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Allocator> CountingAllocator<A> {
    pub fn wrap(inner: A) -> Self {
        Self {
            inner,
            live: 0,
            peak: 0,
            limit: None,
        }
    }

    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    pub fn live_bytes(&self) -> usize {
        self.live
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak
    }
}

unsafe impl<A: Allocator> Allocator for CountingAllocator<A> {
    unsafe fn realloc(
        &mut self,
        block: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        let real_old = if block.is_some() { old_size } else { 0 };

        if new_size > real_old {
            if let Some(limit) = self.limit {
                if self.live - real_old + new_size > limit {
                    return None;
                }
            }
        }

        let result = self.inner.realloc(block, old_size, new_size);
        if result.is_some() || new_size == 0 {
            self.live = self.live - real_old + new_size;
            self.peak = self.peak.max(self.live);
        }
        result
    }

    fn in_use(&self) -> Option<usize> {
        Some(self.live)
    }
}

/// Plain data that may be filled straight from a byte stream.
///
/// # Safety
///
/// Every bit pattern must be a valid value of the type.
pub unsafe trait Pod: Copy {}

unsafe impl Pod for u8 {}
unsafe impl Pod for u32 {}
unsafe impl Pod for i32 {}

/// Length-tracked array carved out of the state's allocator.
///
/// The length is also the capacity: the manager grows and shrinks it explicitly.
#[derive(Debug)]
pub struct LVec<T> {
    ptr: Option<NonNull<T>>,
    len: usize,
    marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for LVec<T> {}

impl<T: Copy> LVec<T> {
    pub const fn empty() -> Self {
        Self {
            ptr: None,
            len: 0,
            marker: PhantomData,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// `true` when the vector owns a block.
    #[inline(always)]
    pub fn has_block(&self) -> bool {
        self.ptr.is_some()
    }

    #[inline]
    pub fn byte_size(&self) -> usize {
        self.len * size_of::<T>()
    }

    pub fn as_slice(&self) -> &[T] {
        match self.ptr {
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.len) },
            None => &[],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        match self.ptr {
            Some(ptr) => unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.len) },
            None => &mut [],
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }
}

impl<T: Pod> LVec<T> {
    /// Raw view used by the chunk loader to decode straight into the final storage.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        match self.ptr {
            Some(ptr) => unsafe {
                std::slice::from_raw_parts_mut(ptr.as_ptr().cast::<u8>(), self.byte_size())
            },
            None => &mut [],
        }
    }
}

impl<T: Copy> Default for LVec<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: Copy> Index<usize> for LVec<T> {
    type Output = T;
    #[inline(always)]
    fn index(&self, index: usize) -> &T {
        &self.as_slice()[index]
    }
}

impl<T: Copy> IndexMut<usize> for LVec<T> {
    #[inline(always)]
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.as_mut_slice()[index]
    }
}

/// Single value living in a block of the state's allocator.
pub struct LBox<T> {
    ptr: NonNull<T>,
}

unsafe impl<T: Send> Send for LBox<T> {}

impl<T> Deref for LBox<T> {
    type Target = T;
    #[inline(always)]
    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for LBox<T> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

/// Allocated but still uninitialised [`LBox`].
#[must_use]
pub struct BoxSlot<T> {
    ptr: NonNull<T>,
}

impl<T> BoxSlot<T> {
    pub fn fill(self, value: T) -> LBox<T> {
        unsafe {
            self.ptr.as_ptr().write(value);
        }
        LBox { ptr: self.ptr }
    }
}

/// Byte accounting around an injected [`Allocator`].
pub struct Memory {
    allocator: Box<dyn Allocator + Send>,
    /// Bytes currently allocated minus `gcdebt`.
    pub(crate) totalbytes: isize,
    /// Bytes allocated and not yet compensated by the collector.
    pub(crate) gcdebt: isize,
    /// Size of the state records, allocated by the owner before the manager existed.
    fixed: usize,
}

impl Memory {
    pub fn new(allocator: Box<dyn Allocator + Send>, fixed: usize) -> Self {
        Self {
            allocator,
            totalbytes: fixed as isize,
            gcdebt: 0,
            fixed,
        }
    }

    /// Actual number of bytes held, state records included.
    #[inline]
    pub fn total_bytes(&self) -> usize {
        (self.totalbytes + self.gcdebt) as usize
    }

    #[inline]
    pub fn debt(&self) -> isize {
        self.gcdebt
    }

    #[inline]
    pub fn fixed_overhead(&self) -> usize {
        self.fixed
    }

    pub fn allocator_in_use(&self) -> Option<usize> {
        self.allocator.in_use()
    }

    /// Gives the allocator back, e.g. to release the block holding the manager itself.
    pub fn into_allocator(self) -> Box<dyn Allocator + Send> {
        self.allocator
    }

    pub fn add_debt(&mut self, size: usize, real_old_size: usize) {
        self.gcdebt = (self.gcdebt + size as isize) - real_old_size as isize;
    }

    /// Sets the debt to a new value keeping `total_bytes()` unchanged and avoiding an underflow
    /// of `totalbytes`.
    pub fn set_debt(&mut self, debt: isize) {
        let tb = self.total_bytes() as isize;
        assert!(tb > 0);
        let debt = if debt < tb - MAX_LMEM { tb - MAX_LMEM } else { debt };
        self.totalbytes = tb - debt;
        self.gcdebt = debt;
    }

    /// Checks `totalbytes + gcdebt == bytes held` against the allocator's own count.
    #[inline]
    pub fn check_accounting(&self) {
        if cfg!(any(debug_assertions, feature = "hard-memtests")) {
            if let Some(used) = self.allocator.in_use() {
                assert_eq!(
                    self.total_bytes(),
                    used,
                    "memory accounting out of sync with the allocator"
                );
            }
        }
    }

    /// Generic reallocation: the single path every allocation and free goes through.
    ///
    /// A `None` block with a zero size is a no-op; a zero new size frees the block and yields
    /// `None`.
    ///
    /// # Safety
    ///
    /// `block` must come from this manager and currently hold `old_size` bytes.
    pub unsafe fn realloc_raw(
        &mut self,
        block: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
    ) -> LuaResult<Option<NonNull<u8>>> {
        let real_old = if block.is_some() { old_size } else { 0 };
        debug_assert!((real_old == 0) == block.is_none());

        let new_block = self.allocator.realloc(block, old_size, new_size);
        debug_assert!(new_block.map_or(true, |p| p.as_ptr() as usize % MAX_ALIGN == 0));
        if new_block.is_none() && new_size > 0 {
            log::warn!(target: "memory", "allocation of {} bytes failed ({} bytes in use)", new_size, self.total_bytes());
            return Err(LuaError::OutOfMemory);
        }
        debug_assert!((new_size == 0) == new_block.is_none());

        self.add_debt(new_size, real_old);
        self.check_accounting();
        Ok(new_block)
    }

    fn vector_bytes<T>(n: usize) -> LuaResult<usize> {
        // `n + 1` so that the check stays meaningful for the largest element counts
        match n.checked_add(1).and_then(|m| m.checked_mul(size_of::<T>())) {
            Some(bytes) if bytes <= isize::MAX as usize => Ok(n * size_of::<T>()),
            _ => {
                log::debug!(target: "memory", "vector of {} elements of {} bytes is too big", n, size_of::<T>());
                Err(LuaError::BlockTooBig)
            }
        }
    }

    pub fn new_vector<T: Copy>(&mut self, n: usize, fill: T) -> LuaResult<LVec<T>> {
        let mut vec = LVec::empty();
        self.resize_vector(&mut vec, n, fill)?;
        Ok(vec)
    }

    /// Resizes `vec` to exactly `n` elements, filling new slots with `fill`.
    ///
    /// The vector is left untouched when the request fails.
    pub fn resize_vector<T: Copy>(&mut self, vec: &mut LVec<T>, n: usize, fill: T) -> LuaResult<()> {
        debug_assert!(size_of::<T>() > 0 && align_of::<T>() <= MAX_ALIGN);
        let new_bytes = Self::vector_bytes::<T>(n)?;
        let old_len = vec.len;
        let block = unsafe {
            self.realloc_raw(vec.ptr.map(NonNull::cast), vec.byte_size(), new_bytes)?
        };
        vec.ptr = block.map(NonNull::cast);
        vec.len = n;
        if n > old_len {
            vec.as_mut_slice()[old_len..].fill(fill);
        }
        Ok(())
    }

    /// Grows `vec` so that index `nelems` fits, doubling its size (at least [`MIN_ARRAY_SIZE`]
    /// elements) and never exceeding `limit`. Once the size equals `limit` a further request
    /// fails with "too many `what`".
    pub fn grow_vector<T: Copy>(
        &mut self,
        vec: &mut LVec<T>,
        nelems: usize,
        limit: usize,
        what: &'static str,
        fill: T,
    ) -> LuaResult<()> {
        while nelems + 1 > vec.len() {
            self.grow_aux(vec, limit, what, fill)?;
        }
        Ok(())
    }

    fn grow_aux<T: Copy>(
        &mut self,
        vec: &mut LVec<T>,
        limit: usize,
        what: &'static str,
        fill: T,
    ) -> LuaResult<()> {
        let size = vec.len();
        let new_size = if size >= limit / 2 {
            if size >= limit {
                return Err(LuaError::TooMany { what, limit });
            }
            limit
        } else {
            (size * 2).max(MIN_ARRAY_SIZE)
        };
        self.resize_vector(vec, new_size, fill)
    }

    pub fn free_vector<T: Copy>(&mut self, vec: &mut LVec<T>) {
        let block = vec.ptr.take().map(NonNull::cast);
        let size = vec.byte_size();
        vec.len = 0;
        // freeing never fails
        let _ = unsafe { self.realloc_raw(block, size, 0) };
    }

    pub fn new_box<T>(&mut self, value: T) -> LuaResult<LBox<T>> {
        let slot = self.reserve_box::<T>()?;
        Ok(slot.fill(value))
    }

    /// Allocates the block for a `T` without a value yet, so that the value can be built
    /// with further allocations first. See [`Memory::release_slot`].
    pub fn reserve_box<T>(&mut self) -> LuaResult<BoxSlot<T>> {
        debug_assert!(size_of::<T>() > 0 && align_of::<T>() <= MAX_ALIGN);
        let block = unsafe { self.realloc_raw(None, 0, size_of::<T>())? };
        let Some(block) = block else {
            return Err(LuaError::OutOfMemory);
        };
        Ok(BoxSlot {
            ptr: block.cast::<T>(),
        })
    }

    /// Gives back a reserved block that was never filled.
    pub fn release_slot<T>(&mut self, slot: BoxSlot<T>) {
        let _ = unsafe { self.realloc_raw(Some(slot.ptr.cast()), size_of::<T>(), 0) };
    }

    /// Moves the value out of its block and releases the block.
    pub fn take_box<T>(&mut self, boxed: LBox<T>) -> T {
        let value = unsafe { boxed.ptr.as_ptr().read() };
        let _ = unsafe { self.realloc_raw(Some(boxed.ptr.cast()), size_of::<T>(), 0) };
        value
    }
}
