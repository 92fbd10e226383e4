use allocator_api2::alloc::{ AllocError, Allocator, Global };
use std::{
    alloc::Layout,
    marker::PhantomData,
    mem::MaybeUninit,
    ptr::{ self, NonNull }
};

/// Destruction policy invoked on the payload once the last owning handle
/// goes away.
pub trait Deleter<T> {
    /// # Safety
    /// `ptr` must point to the live payload this deleter was paired with at
    /// construction time. The payload must not be used afterwards, and the
    /// deleter runs at most once per payload.
    unsafe fn destroy(&mut self, ptr: NonNull<T>);
}

/// Runs the payload destructor in place and nothing else. The in-place
/// construction path pairs this with the combined record, whose storage is
/// released as a whole by the control block.
pub struct DropDeleter;

impl<T> Deleter<T> for DropDeleter {
    unsafe fn destroy(&mut self, ptr: NonNull<T>) {
        ptr::drop_in_place(ptr.as_ptr());
    }
}

/// Destroys the pointee and hands its storage back to the allocator it
/// holds. This is the default policy for adopted raw pointers, so
/// `Box::into_raw(Box::new(v))` round-trips through `SharedRef::adopt`
/// without leaking.
pub struct DefaultDeleter<A = Global>
where A: Allocator
{
    alloc: A
}

impl<A> DefaultDeleter<A>
where A: Allocator
{
    pub fn new(alloc: A) -> Self { Self { alloc } }
}

impl Default for DefaultDeleter<Global> {
    fn default() -> Self { Self::new(Global) }
}

impl<T, A> Deleter<T> for DefaultDeleter<A>
where A: Allocator
{
    /// # Safety
    /// In addition to the trait contract, the pointee must have been
    /// allocated by this deleter's allocator with `Layout::new::<T>()`.
    unsafe fn destroy(&mut self, ptr: NonNull<T>) {
        ptr::drop_in_place(ptr.as_ptr());
        self.alloc.deallocate(ptr.cast(), Layout::new::<T>());
    }
}

/// Adapts any callable taking a raw payload pointer into a deleter.
pub struct FnDeleter<F>(pub F);

impl<T, F> Deleter<T> for FnDeleter<F>
where F: FnMut(*mut T)
{
    unsafe fn destroy(&mut self, ptr: NonNull<T>) {
        (self.0)(ptr.as_ptr())
    }
}

/// Which allocation shape produced a control block. Stored explicitly so
/// reclamation never has to infer the footprint from the deleter type.
#[derive(Clone, Copy)]
pub(crate) enum StorageKind {
    /// Control block and payload allocated independently (adopted pointer).
    Separate,
    /// One record holding control block and payload (in-place construction).
    Combined
}

/// Type-erased control block interface. Handles are generic over the payload
/// only; every counter mutation and every destruction step goes through this
/// trait, so one `SharedRef<T>` covers every allocator/deleter pairing.
pub(crate) trait ControlBlockBase {
    fn inc_strong(&mut self);
    fn dec_strong(&mut self);
    fn get_strong(&self) -> usize;
    fn inc_weak(&mut self);
    fn dec_weak(&mut self);
    fn get_weak(&self) -> usize;

    /// Destroys the payload behind `ptr` with the captured deleter.
    ///
    /// # Safety
    /// `ptr` must be this group's payload pointer, still live, and
    /// reinterpretable as the concrete payload type the block was built
    /// for. At most one call per group.
    unsafe fn destroy_payload(&mut self, ptr: *mut ());

    /// Frees the block's own storage through the captured allocator; for a
    /// combined block this frees the whole record, payload storage included.
    ///
    /// # Safety
    /// Both counts must be zero and the payload already destroyed. The
    /// block must not be touched again. Exactly one call per group.
    unsafe fn reclaim_self(&mut self);
}

pub(crate) struct ControlBlockImpl<T, A, D>
where A: Allocator + Clone, D: Deleter<T>
{
    strong: usize,
    weak: usize,
    kind: StorageKind,
    alloc: A,
    deleter: D,
    _payload: PhantomData<fn(*mut T)>
}

impl<T, A, D> ControlBlockImpl<T, A, D>
where A: Allocator + Clone, D: Deleter<T>
{
    fn new(kind: StorageKind, alloc: A, deleter: D) -> Self {
        Self { strong: 1, weak: 0, kind, alloc, deleter, _payload: PhantomData }
    }
}

impl<T, A, D> ControlBlockBase for ControlBlockImpl<T, A, D>
where A: Allocator + Clone, D: Deleter<T>
{
    fn inc_strong(&mut self) { self.strong += 1 }
    fn dec_strong(&mut self) { self.strong -= 1 }
    fn get_strong(&self) -> usize { self.strong }
    fn inc_weak(&mut self) { self.weak += 1 }
    fn dec_weak(&mut self) { self.weak -= 1 }
    fn get_weak(&self) -> usize { self.weak }

    unsafe fn destroy_payload(&mut self, ptr: *mut ()) {
        self.deleter.destroy(NonNull::new_unchecked(ptr.cast::<T>()));
    }

    unsafe fn reclaim_self(&mut self) {
        let alloc = self.alloc.clone();
        match self.kind {
            StorageKind::Separate => {
                let block = NonNull::new_unchecked(self as *mut Self as *mut u8);
                ptr::drop_in_place(self);
                alloc.deallocate(block, Layout::new::<Self>());
            }
            // the block sits at offset 0 of the combined record; the record
            // came from a single allocate call and must go back through a
            // single deallocate of the record layout
            StorageKind::Combined => {
                let record = NonNull::new_unchecked(self as *mut Self as *mut u8);
                ptr::drop_in_place(self);
                alloc.deallocate(record, Layout::new::<CombinedStorage<T, A, D>>());
            }
        }
    }
}

/// Colocated record for the in-place construction path. `repr(C)` keeps the
/// block at offset 0 so `reclaim_self` can recover the record pointer from
/// the block pointer.
#[repr(C)]
pub(crate) struct CombinedStorage<T, A, D>
where A: Allocator + Clone, D: Deleter<T>
{
    block: ControlBlockImpl<T, A, D>,
    value: MaybeUninit<T>
}

/// Allocates a standalone control block for an adopted pointer.
pub(crate) fn new_separate<T, A, D>(alloc: A, deleter: D)
    -> Result<NonNull<dyn ControlBlockBase>, AllocError>
where T: 'static,
      A: Allocator + Clone + 'static,
      D: Deleter<T> + 'static
{
    let block = alloc
        .allocate(Layout::new::<ControlBlockImpl<T, A, D>>())?
        .cast::<ControlBlockImpl<T, A, D>>();
    unsafe {
        ptr::write(block.as_ptr(), ControlBlockImpl::new(StorageKind::Separate, alloc, deleter));
        Ok(NonNull::new_unchecked(block.as_ptr() as *mut dyn ControlBlockBase))
    }
}

/// Allocates the combined record, constructs the payload into it, then the
/// embedded control block. Returns the erased block and the payload pointer.
pub(crate) fn new_combined<T, A>(value: T, alloc: A)
    -> Result<(NonNull<dyn ControlBlockBase>, NonNull<T>), AllocError>
where T: 'static,
      A: Allocator + Clone + 'static
{
    let record = alloc
        .allocate(Layout::new::<CombinedStorage<T, A, DropDeleter>>())?
        .cast::<CombinedStorage<T, A, DropDeleter>>()
        .as_ptr();
    unsafe {
        let payload = &raw mut (*record).value as *mut T;
        ptr::write(payload, value);
        let block = &raw mut (*record).block;
        ptr::write(block, ControlBlockImpl::new(StorageKind::Combined, alloc, DropDeleter));
        Ok((
            NonNull::new_unchecked(block as *mut dyn ControlBlockBase),
            NonNull::new_unchecked(payload)
        ))
    }
}

#[cfg(test)]
pub mod tests {
    use super::{ DefaultDeleter, Deleter, DropDeleter, FnDeleter };
    use std::{
        cell::Cell,
        error::Error,
        mem::MaybeUninit,
        ptr::NonNull,
        rc::Rc
    };
    type TestReturn = Result<(), Box<dyn Error>>;

    struct Tracker {
        drops: Rc<Cell<usize>>
    }

    impl Drop for Tracker {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
        }
    }

    #[test]
    pub fn drop_deleter_destroys_in_place() -> TestReturn {
        let drops = Rc::new(Cell::new(0));
        let mut slot = MaybeUninit::new(Tracker { drops: drops.clone() });
        let mut deleter = DropDeleter;
        unsafe { deleter.destroy(NonNull::new_unchecked(slot.as_mut_ptr())) };
        assert!(drops.get() == 1, "Destructor should have run exactly once");
        Ok(())
    }

    #[test]
    pub fn default_deleter_destroys_and_frees() -> TestReturn {
        let drops = Rc::new(Cell::new(0));
        let raw = NonNull::from(Box::leak(Box::new(Tracker { drops: drops.clone() })));
        let mut deleter = DefaultDeleter::default();
        unsafe { deleter.destroy(raw) };
        assert!(drops.get() == 1, "Pointee should have been destroyed");
        Ok(())
    }

    #[test]
    pub fn fn_deleter_forwards_pointer() -> TestReturn {
        let seen = Rc::new(Cell::new(std::ptr::null_mut::<u32>()));
        let out = seen.clone();
        let mut value = 16u32;
        let mut deleter = FnDeleter(move |ptr: *mut u32| out.set(ptr));
        unsafe { deleter.destroy(NonNull::from(&mut value)) };
        assert!(seen.get() == &raw mut value, "Deleter should receive the payload pointer");
        Ok(())
    }
}
