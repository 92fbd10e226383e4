//! Reference-counted shared ownership with observing handles.
//!
//! [`SharedRef`] lets any number of owners share one heap value; the value is
//! destroyed when the last owner goes away. [`WeakRef`] observes the same
//! value without keeping it alive and can be upgraded back to an owner with
//! [`WeakRef::lock`] while the value still exists.
//!
//! Both handles are generic over the payload only. The allocator
//! (`allocator_api2::alloc::Allocator`) and the destruction policy
//! ([`Deleter`]) chosen at construction time are erased behind a per-group
//! control block, so handles built with different allocators or deleters are
//! the same type.
//!
//! The counters are plain integers and the handles hold raw pointers, so a
//! handle is neither `Send` nor `Sync`; an ownership group stays on the
//! thread that created it.

pub mod block;
pub mod shared_ref;

pub use block::{ DefaultDeleter, Deleter, DropDeleter, FnDeleter };
pub use shared_ref::{ SharedRef, WeakRef };
