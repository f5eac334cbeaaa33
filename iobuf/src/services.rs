//! Collaborator interfaces consumed by the buffer subsystem.
//!
//! The buffer code never touches the machine directly; everything flows
//! through these traits so that the physical allocator, the virtual-range
//! allocator, the page-table mapper, the page cache, and the image-section
//! pager can be substituted: by the embedding kernel in production and by
//! [`crate::testing::MockKernel`] in tests.

use crate::addr::{PhysicalAddress, VirtualAddress};
use crate::error::Result;
use crate::flags::{MapFlags, ReleaseFlags};

/// Handle to a reference-counted page cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheEntryId(pub u64);

/// Handle to a user-mode image section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionId(pub u64);

/// One element of a scatter/gather vector: a user virtual range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoVector {
    pub address: VirtualAddress,
    pub size: usize,
}

/// Outcome of paging one page in through an image section.
///
/// A returned cache entry carries an owned reference which the caller
/// takes over and must eventually release.
#[derive(Debug, Clone, Copy)]
pub struct PageInResult {
    pub physical_address: PhysicalAddress,
    pub cache_entry: Option<CacheEntryId>,
}

/// Pool selector for descriptor-adjacent data allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolType {
    NonPaged,
    Paged,
}

/// Tagged pool allocator (non-paged and paged kernel pools).
pub trait PoolAllocator {
    fn pool_allocate(&mut self, pool: PoolType, size: usize) -> Option<VirtualAddress>;
    fn pool_free(&mut self, pool: PoolType, address: VirtualAddress);
}

/// Physical page allocator.
pub trait PageFrameAllocator {
    /// Allocate `count` physically contiguous pages whose base honours
    /// `alignment` (in bytes). Returns `None` when no such run exists.
    fn allocate_pages(&mut self, count: usize, alignment: usize) -> Option<PhysicalAddress>;

    /// Return one page to the allocator.
    fn free_page(&mut self, address: PhysicalAddress);

    /// Release the pin on `count` pages starting at `address`.
    fn unlock_pages(&mut self, address: PhysicalAddress, count: usize);
}

/// Kernel virtual address-space accounting.
pub trait VirtualRangeAllocator {
    /// Reserve `size` bytes of kernel virtual space at the given
    /// alignment. The reservation carries no mappings.
    fn reserve_range(&mut self, size: usize, alignment: usize) -> Result<VirtualAddress>;

    /// Release a reserved range, optionally freeing the physical pages
    /// still mapped inside it and broadcasting TLB invalidations.
    fn release_range(
        &mut self,
        address: VirtualAddress,
        size: usize,
        flags: ReleaseFlags,
    ) -> Result<()>;
}

/// Page-table manipulation.
pub trait PageMapper {
    /// Install a mapping for one physical page at `virtual_address`.
    fn map_page(
        &mut self,
        physical: PhysicalAddress,
        virtual_address: VirtualAddress,
        flags: MapFlags,
    );

    /// Back `[address, address + size)` with freshly allocated physical
    /// memory in physically contiguous runs of `run_size` bytes each.
    fn map_range(
        &mut self,
        address: VirtualAddress,
        size: usize,
        run_size: usize,
        write_through: bool,
        non_cached: bool,
    ) -> Result<()>;

    /// Resolve a virtual address through the page tables.
    fn virtual_to_physical(&self, address: VirtualAddress) -> Option<PhysicalAddress>;
}

/// Reference-counted page cache entries.
///
/// Reference counting is atomic on the cache side; the published virtual
/// address is written at most once per entry and racing publishers write
/// the same value.
pub trait PageCache {
    fn add_reference(&self, entry: CacheEntryId);
    fn release_reference(&self, entry: CacheEntryId);
    fn entry_physical(&self, entry: CacheEntryId) -> PhysicalAddress;
    fn entry_virtual(&self, entry: CacheEntryId) -> Option<VirtualAddress>;

    /// Publish a kernel virtual address for the entry if none is set.
    /// Best-effort: losing a race against another publisher is benign.
    fn publish_virtual(&self, entry: CacheEntryId, address: VirtualAddress);
}

/// User-mode image sections and the pager behind them.
pub trait ImageSections {
    /// Find the section covering a user virtual address, taking a
    /// reference on it. Anonymous or kernel addresses return `None`.
    fn section_lookup(&mut self, address: VirtualAddress) -> Option<SectionId>;

    /// Drop the reference taken by [`ImageSections::section_lookup`].
    fn section_release(&mut self, section: SectionId);

    /// Page the page containing `address` in and pin it. May fail with
    /// [`crate::IoBufferError::TryAgain`], in which case the caller
    /// retries.
    fn page_in(&mut self, section: SectionId, address: VirtualAddress) -> Result<PageInResult>;
}

/// Raw memory transfer through the current address space.
///
/// Kernel-side addresses are trusted; the user-side transfers go through
/// the architecture's faulting-safe copy routines.
pub trait MemoryAccessor {
    fn read_memory(&self, source: VirtualAddress, destination: &mut [u8]) -> Result<()>;
    fn write_memory(&self, destination: VirtualAddress, source: &[u8]) -> Result<()>;
    fn copy_memory(
        &self,
        destination: VirtualAddress,
        source: VirtualAddress,
        length: usize,
    ) -> Result<()>;
    fn zero_memory(&self, destination: VirtualAddress, length: usize) -> Result<()>;
    fn copy_to_user(&self, destination: VirtualAddress, source: &[u8]) -> Result<()>;
    fn copy_from_user(&self, destination: &mut [u8], source: VirtualAddress) -> Result<()>;
}

/// The full collaborator surface the buffer subsystem runs against.
pub trait KernelServices:
    PoolAllocator
    + PageFrameAllocator
    + VirtualRangeAllocator
    + PageMapper
    + PageCache
    + ImageSections
    + MemoryAccessor
{
    /// Largest data cache line size of the L1 cache and any registered
    /// external cache controller.
    fn data_cache_line_size(&self) -> usize;
}
