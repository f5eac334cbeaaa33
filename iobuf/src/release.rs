//! Resource teardown.
//!
//! Release order is load-bearing: mappings first, then per-page
//! ownership. A page shared with the page cache is released through its
//! cache reference, never through the owned-page path, even on buffers
//! that allocated it.

use crate::addr::{pages_spanning, PAGE_SIZE};
use crate::buffer::IoBuffer;
use crate::flags::BufferFlags;
use crate::services::{CacheEntryId, KernelServices, PoolType};
use crate::stats;

impl IoBuffer {
    /// Give back every resource the flag set says this buffer holds.
    /// Safe on partially constructed buffers; constructors rely on that
    /// for their failure paths.
    pub(crate) fn release_resources<S: KernelServices>(&mut self, services: &mut S) {
        self.current_offset = 0;
        if self.flags.contains(BufferFlags::UNMAP_ON_FREE) {
            self.unmap(services);
        }

        let owned = self.flags.contains(BufferFlags::MEMORY_OWNED);
        let cache_backed = self.flags.contains(BufferFlags::CACHE_BACKED);
        if owned || cache_backed {
            self.release_owned_pages(services, owned);
        } else if self.flags.contains(BufferFlags::MEMORY_LOCKED) {
            self.unlock_wrapped_pages(services);
        }

        if let Some(backing) = self.paged_backing.take() {
            services.pool_free(PoolType::Paged, backing);
        }
    }

    /// Owned or cache-backed teardown: a page with a cache entry gives
    /// up its reference, an owned page without one goes back to the
    /// physical allocator.
    fn release_owned_pages<S: KernelServices>(&mut self, services: &mut S, owned: bool) {
        let mut page_index = 0usize;
        for index in 0..self.fragments.len() {
            let fragment = self.fragments[index];
            // A wrapped first fragment may start mid-page; span whole
            // pages under it so the per-page entry indices line up.
            let (base, pages) = match fragment.physical_address {
                Some(physical) => (
                    Some(physical.page_base()),
                    pages_spanning(physical.page_offset() + fragment.size),
                ),
                None => (None, fragment.size.div_ceil(PAGE_SIZE)),
            };
            for page in 0..pages {
                if let Some(entry) = self.take_cache_entry(page_index + page) {
                    services.release_reference(entry);
                    stats::note_cache_reference_released();
                } else if owned {
                    match base {
                        Some(base) => {
                            services.free_page(base.offset((page * PAGE_SIZE) as u64));
                            stats::note_page_freed();
                        }
                        None => debug_assert!(false, "owned fragment without physical address"),
                    }
                } else {
                    debug_assert!(false, "cache-backed buffer with an unbacked page");
                }
            }
            page_index += pages;
        }
    }

    /// Locked-but-not-owned teardown (wrapped ranges). The first
    /// fragment may start mid-page, so the walk rounds its base down
    /// and its length up to whole pages.
    fn unlock_wrapped_pages<S: KernelServices>(&mut self, services: &mut S) {
        let mut page_index = 0usize;
        for index in 0..self.fragments.len() {
            let fragment = self.fragments[index];
            let Some(physical) = fragment.physical_address else {
                page_index += fragment.size.div_ceil(PAGE_SIZE);
                continue;
            };
            let base = physical.page_base();
            let pages = pages_spanning(physical.page_offset() + fragment.size);
            for page in 0..pages {
                if let Some(entry) = self.take_cache_entry(page_index + page) {
                    services.release_reference(entry);
                    stats::note_cache_reference_released();
                } else {
                    services.unlock_pages(base.offset((page * PAGE_SIZE) as u64), 1);
                    stats::note_page_unlocked();
                }
            }
            page_index += pages;
        }
    }

    fn take_cache_entry(&mut self, page_index: usize) -> Option<CacheEntryId> {
        self.cache_entries.get_mut(page_index).and_then(Option::take)
    }

    /// Release all resources and consume the descriptor.
    pub fn free<S: KernelServices>(mut self, services: &mut S) {
        self.release_resources(services);
        stats::note_buffer_freed();
    }

    /// Release all resources but keep the descriptor and its slot
    /// reservations for reuse.
    pub fn reset<S: KernelServices>(&mut self, services: &mut S) {
        self.release_resources(services);
        self.fragments.clear();
        for entry in &mut self.cache_entries {
            *entry = None;
        }
        self.total_size = 0;
        self.flags.remove(
            BufferFlags::UNMAP_ON_FREE | BufferFlags::MAPPED | BufferFlags::VIRTUALLY_CONTIGUOUS,
        );
    }
}
