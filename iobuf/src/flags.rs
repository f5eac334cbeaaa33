//! Flag sets carried by buffers, page mappings, and range releases.

use bitflags::bitflags;

bitflags! {
    /// Lifecycle and ownership state of an [`crate::IoBuffer`].
    ///
    /// Each bit carries a distinct contract for release: owned physical
    /// pages are freed, locked pages are unlocked, cache references are
    /// dropped, and subsystem-allocated virtual ranges are returned.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferFlags: u32 {
        /// Backing physical pages were allocated by this buffer and must
        /// be freed on release.
        const MEMORY_OWNED = 1 << 0;
        /// The descriptor lives in caller-owned storage (in-place init).
        const STRUCTURE_NOT_OWNED = 1 << 1;
        /// All physical pages are pinned against reclaim; unlocked on
        /// release unless owned by the page cache.
        const MEMORY_LOCKED = 1 << 2;
        /// Descriptor metadata resides in non-pageable storage.
        const NON_PAGED = 1 << 3;
        /// At least one page is shared with a reference-counted page
        /// cache entry.
        const CACHE_BACKED = 1 << 4;
        /// Logical sub-view of another buffer; holds no resources.
        const FRAGMENT_VIEW = 1 << 5;
        /// Virtual addresses refer to the current user address space.
        const USER_MODE = 1 << 6;
        /// Every fragment has a valid virtual address.
        const MAPPED = 1 << 7;
        /// One continuous virtual range covers all fragments.
        const VIRTUALLY_CONTIGUOUS = 1 << 8;
        /// The virtual range was allocated by this subsystem and must be
        /// released on teardown.
        const UNMAP_ON_FREE = 1 << 9;
        /// More pages may be appended through the extension path.
        const EXTENDABLE = 1 << 10;
    }
}

bitflags! {
    /// Attributes for mapping one page into kernel virtual space.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const PRESENT = 1 << 0;
        const GLOBAL = 1 << 1;
        const WRITE_THROUGH = 1 << 2;
        const CACHE_DISABLE = 1 << 3;
    }
}

bitflags! {
    /// Behaviour of a virtual-range release.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReleaseFlags: u32 {
        /// Broadcast a TLB invalidation to all processors.
        const SEND_INVALIDATE_IPI = 1 << 0;
        /// Free the physical pages backing the range as it is unmapped.
        const FREE_PHYSICAL_PAGES = 1 << 1;
    }
}

impl MapFlags {
    /// The map-flag set for kernel buffer mappings.
    pub fn kernel(write_through: bool, non_cached: bool) -> Self {
        let mut flags = MapFlags::PRESENT | MapFlags::GLOBAL;
        if write_through {
            flags |= MapFlags::WRITE_THROUGH;
        }
        if non_cached {
            flags |= MapFlags::CACHE_DISABLE;
        }
        flags
    }
}
