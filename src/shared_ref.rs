use allocator_api2::alloc::{ handle_alloc_error, AllocError, Allocator, Global };
use std::{
    alloc::Layout,
    fmt::{ Debug, Display },
    mem,
    ops::Deref,
    ptr::NonNull
};
use crate::block::{
    self, CombinedStorage, ControlBlockBase, ControlBlockImpl,
    DefaultDeleter, Deleter, DropDeleter
};

/// Reference-counted owning handle. Every live `SharedRef` contributes one
/// to its group's strong count; the payload is destroyed the moment the last
/// owner goes away, and the control block survives until the last observing
/// [`WeakRef`] is gone too.
///
/// An empty handle (see [`SharedRef::null`]) has no control block and never
/// touches a counter.
pub struct SharedRef<T> {
    block: Option<NonNull<dyn ControlBlockBase>>,
    ptr: *mut T
}

impl<T> SharedRef<T> {
    /// Empty handle; owns nothing.
    pub fn null() -> Self {
        Self { block: None, ptr: std::ptr::null_mut() }
    }
}

impl<T> SharedRef<T>
where T: 'static
{
    /// Constructs the payload in place next to its control block, one
    /// allocation for both, using the global allocator.
    pub fn new(value: T) -> Self { Self::new_in(value, Global) }

    /// Same as [`Self::new`] with an explicit allocator for the combined
    /// record.
    pub fn new_in<A>(value: T, alloc: A) -> Self
    where A: Allocator + Clone + 'static
    {
        match Self::try_new_in(value, alloc) {
            Ok(handle) => handle,
            Err(_) => handle_alloc_error(Layout::new::<CombinedStorage<T, A, DropDeleter>>())
        }
    }

    /// Fallible form of [`Self::new_in`]. On allocator failure the error is
    /// returned with nothing left allocated; `value` is dropped normally.
    pub fn try_new_in<A>(value: T, alloc: A) -> Result<Self, AllocError>
    where A: Allocator + Clone + 'static
    {
        let (block, payload) = block::new_combined(value, alloc)?;
        Ok(Self { block: Some(block), ptr: payload.as_ptr() })
    }

    /// Takes ownership of an existing heap pointer. The pointee is destroyed
    /// and freed by [`DefaultDeleter`] when the last owner goes away.
    ///
    /// The pointee must have been allocated by the global allocator with
    /// `Layout::new::<T>()` (`Box::into_raw` qualifies) and must not already
    /// belong to another ownership group.
    pub fn adopt(ptr: NonNull<T>) -> Self {
        Self::adopt_with_in(ptr, DefaultDeleter::default(), Global)
    }

    /// Adopts `ptr` with a custom destruction policy. The deleter must not
    /// already be owned by another ownership group; it runs exactly once,
    /// when the last owner goes away.
    pub fn adopt_with<D>(ptr: NonNull<T>, deleter: D) -> Self
    where D: Deleter<T> + 'static
    {
        Self::adopt_with_in(ptr, deleter, Global)
    }

    /// Adopts `ptr` with a custom deleter and a custom allocator for the
    /// control block, which gets its own allocation separate from the
    /// payload.
    pub fn adopt_with_in<D, A>(ptr: NonNull<T>, deleter: D, alloc: A) -> Self
    where D: Deleter<T> + 'static,
          A: Allocator + Clone + 'static
    {
        match Self::try_adopt_with_in(ptr, deleter, alloc) {
            Ok(handle) => handle,
            Err(_) => handle_alloc_error(Layout::new::<ControlBlockImpl<T, A, D>>())
        }
    }

    /// Fallible form of [`Self::adopt_with_in`]. On allocator failure the
    /// pointee is left untouched and still owned by the caller.
    pub fn try_adopt_with_in<D, A>(ptr: NonNull<T>, deleter: D, alloc: A) -> Result<Self, AllocError>
    where D: Deleter<T> + 'static,
          A: Allocator + Clone + 'static
    {
        let block = block::new_separate::<T, A, D>(alloc, deleter)?;
        Ok(Self { block: Some(block), ptr: ptr.as_ptr() })
    }
}

impl<T> SharedRef<T> {
    pub fn get(&self) -> Option<&T> {
        match self.ptr.is_null() {
            true => None,
            false => Some(unsafe { &*self.ptr })
        }
    }

    pub fn get_ptr(&self) -> *mut T { self.ptr }

    pub fn is_null(&self) -> bool { self.ptr.is_null() }

    /// Number of owning handles over this group; 0 for an empty handle.
    pub fn use_count(&self) -> usize {
        match self.block {
            Some(block) => unsafe { block.as_ref().get_strong() },
            None => 0
        }
    }

    /// Number of observing handles over this group.
    pub fn weak_count(&self) -> usize {
        match self.block {
            Some(block) => unsafe { block.as_ref().get_weak() },
            None => 0
        }
    }

    pub fn unique(&self) -> bool { self.use_count() == 1 }

    /// Exchanges the groups of two handles without touching any counter.
    pub fn swap(&mut self, other: &mut Self) {
        mem::swap(&mut self.block, &mut other.block);
        mem::swap(&mut self.ptr, &mut other.ptr);
    }

    /// Creates an observing handle over the same group.
    pub fn downgrade(&self) -> WeakRef<T> {
        if let Some(block) = self.block {
            unsafe { (*block.as_ptr()).inc_weak() };
        }
        WeakRef { block: self.block, ptr: self.ptr }
    }
}

impl<T> Default for SharedRef<T> {
    fn default() -> Self { Self::null() }
}

impl<T> Deref for SharedRef<T> {
    type Target = T;

    /// Panics on an empty handle; check [`SharedRef::get`] or
    /// [`SharedRef::is_null`] first.
    fn deref(&self) -> &T {
        match self.get() {
            Some(value) => value,
            None => panic!("dereferenced an empty SharedRef")
        }
    }
}

impl<T> Clone for SharedRef<T> {
    fn clone(&self) -> Self {
        if let Some(block) = self.block {
            unsafe { (*block.as_ptr()).inc_strong() };
        }
        Self { block: self.block, ptr: self.ptr }
    }
}

impl<T> Drop for SharedRef<T> {
    fn drop(&mut self) {
        let Some(block) = self.block else { return };
        unsafe {
            let block = block.as_ptr();
            (*block).dec_strong();
            if (*block).get_strong() == 0 {
                // payload first: a combined block frees the payload's
                // storage together with its own
                (*block).destroy_payload(self.ptr.cast());
                if (*block).get_weak() == 0 {
                    (*block).reclaim_self();
                }
            }
        }
    }
}

impl<T> Debug for SharedRef<T>
where T: Debug
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedRef {{ data: {:?}, strong: {}, weak: {} }}",
            self.get(), self.use_count(), self.weak_count())
    }
}

impl<T> Display for SharedRef<T>
where T: Display
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.get() {
            Some(value) => write!(f, "{}", value),
            None => write!(f, "null")
        }
    }
}

/// Observing handle: keeps the control block alive, never the payload. Its
/// payload pointer may dangle once the strong count reaches zero, so the
/// payload is only ever reached through a successful [`WeakRef::lock`].
pub struct WeakRef<T> {
    block: Option<NonNull<dyn ControlBlockBase>>,
    ptr: *mut T
}

impl<T> WeakRef<T> {
    /// Empty handle; observes nothing and is already expired.
    pub fn null() -> Self {
        Self { block: None, ptr: std::ptr::null_mut() }
    }

    /// True once no owning handle is left (the payload is gone), and for an
    /// empty handle.
    pub fn expired(&self) -> bool { self.use_count() == 0 }

    /// Current strong count of the observed group; 0 once expired.
    pub fn use_count(&self) -> usize {
        match self.block {
            Some(block) => unsafe { block.as_ref().get_strong() },
            None => 0
        }
    }

    pub fn weak_count(&self) -> usize {
        match self.block {
            Some(block) => unsafe { block.as_ref().get_weak() },
            None => 0
        }
    }

    pub fn swap(&mut self, other: &mut Self) {
        mem::swap(&mut self.block, &mut other.block);
        mem::swap(&mut self.ptr, &mut other.ptr);
    }

    /// Produces an owning handle if the payload is still alive, an empty
    /// one otherwise. The strong count is only incremented on success.
    pub fn lock(&self) -> SharedRef<T> {
        match self.block {
            Some(block) => unsafe {
                match (*block.as_ptr()).get_strong() {
                    0 => SharedRef::null(),
                    _ => {
                        (*block.as_ptr()).inc_strong();
                        SharedRef { block: self.block, ptr: self.ptr }
                    }
                }
            },
            None => SharedRef::null()
        }
    }
}

impl<T> Default for WeakRef<T> {
    fn default() -> Self { Self::null() }
}

impl<T> Clone for WeakRef<T> {
    fn clone(&self) -> Self {
        if let Some(block) = self.block {
            unsafe { (*block.as_ptr()).inc_weak() };
        }
        Self { block: self.block, ptr: self.ptr }
    }
}

impl<T> Drop for WeakRef<T> {
    fn drop(&mut self) {
        let Some(block) = self.block else { return };
        unsafe {
            let block = block.as_ptr();
            (*block).dec_weak();
            // whichever owner dropped the strong count to zero already
            // destroyed the payload; the last observer frees the block
            if (*block).get_strong() == 0 && (*block).get_weak() == 0 {
                (*block).reclaim_self();
            }
        }
    }
}

impl<T> Debug for WeakRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WeakRef {{ expired: {}, strong: {}, weak: {} }}",
            self.expired(), self.use_count(), self.weak_count())
    }
}
