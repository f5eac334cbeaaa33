//! I/O buffer descriptors for the Corten kernel.
//!
//! An [`IoBuffer`] describes a region of memory handed to drivers for
//! DMA or to the block and cache layers for file I/O: a logical byte
//! range over possibly discontiguous physical pages, with well-defined
//! ownership of every page, mapping on demand, and exact-inverse
//! teardown. The buffer reaches the rest of the kernel only through the
//! collaborator traits in [`services`], which keeps the subsystem
//! architecture-neutral and testable on a host target.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addr;
pub mod error;
pub mod flags;
pub mod services;
pub mod stats;

mod access;
mod buffer;
mod create;
mod map;
mod release;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod integration_tests;

pub use access::DmaConstraints;
pub use addr::{PhysicalAddress, VirtualAddress, PAGE_SHIFT, PAGE_SIZE};
pub use buffer::{Fragment, IoBuffer};
pub use create::MAX_VECTOR_COUNT;
pub use error::IoBufferError;
pub use flags::{BufferFlags, MapFlags, ReleaseFlags};
pub use services::{
    CacheEntryId, ImageSections, IoVector, KernelServices, MemoryAccessor, PageCache,
    PageFrameAllocator, PageInResult, PageMapper, PoolAllocator, PoolType, SectionId,
    VirtualRangeAllocator,
};
pub use stats::IoBufferStats;
