//! The mapping engine: give fragments kernel virtual addresses, and take
//! them away again.

use crate::addr::{VirtualAddress, PAGE_SIZE};
use crate::buffer::IoBuffer;
use crate::error::{IoBufferError, Result};
use crate::flags::{BufferFlags, MapFlags, ReleaseFlags};
use crate::services::KernelServices;

impl IoBuffer {
    /// Ensure the buffer is mapped into kernel virtual space, either to
    /// the any-mapped level or, with `require_contiguous`, into a single
    /// continuous range.
    ///
    /// Idempotent: a buffer already satisfying the requested level (by
    /// flag, or in fact) returns immediately. User-mode buffers must not
    /// reach this path.
    pub fn map<S: KernelServices>(
        &mut self,
        services: &mut S,
        write_through: bool,
        non_cached: bool,
        require_contiguous: bool,
    ) -> Result<()> {
        debug_assert!(!self.flags.contains(BufferFlags::USER_MODE));
        if self.flags.contains(BufferFlags::USER_MODE) {
            return Err(IoBufferError::InvalidParameter {
                name: "user-mode buffer in kernel map path",
            });
        }
        if self.fragments.is_empty() {
            return Ok(());
        }
        if require_contiguous {
            if self.flags.contains(BufferFlags::VIRTUALLY_CONTIGUOUS) {
                return Ok(());
            }
            if self.fragments_virtually_contiguous() {
                self.flags |= BufferFlags::VIRTUALLY_CONTIGUOUS | BufferFlags::MAPPED;
                return Ok(());
            }
        } else {
            if self.flags.contains(BufferFlags::MAPPED) {
                return Ok(());
            }
            if self.all_fragments_mapped() {
                self.flags |= BufferFlags::MAPPED;
                return Ok(());
            }
        }

        // Every physical address must be known before any range is
        // reserved.
        if self
            .fragments
            .iter()
            .any(|fragment| fragment.physical_address.is_none())
        {
            return Err(IoBufferError::InvalidParameter {
                name: "fragment without physical address",
            });
        }

        let map_flags = MapFlags::kernel(write_through, non_cached);
        if require_contiguous {
            self.map_contiguous(services, map_flags)
        } else {
            self.map_fragment_runs(services, map_flags)
        }
    }

    /// Map everything into one fresh virtual range, unmapping any
    /// partial mapping first.
    fn map_contiguous<S: KernelServices>(
        &mut self,
        services: &mut S,
        map_flags: MapFlags,
    ) -> Result<()> {
        if self
            .fragments
            .iter()
            .any(|fragment| fragment.virtual_address.is_some())
        {
            self.unmap(services);
        }
        let range = services.reserve_range(self.total_size, PAGE_SIZE)?;
        self.flags |= BufferFlags::UNMAP_ON_FREE;
        let mut cursor = range;
        let mut page_index = 0usize;
        for index in 0..self.fragments.len() {
            let size = self.fragments[index].size;
            let physical = self.fragments[index]
                .physical_address
                .ok_or(IoBufferError::InvalidParameter {
                    name: "fragment without physical address",
                })?;
            self.fragments[index].virtual_address = Some(cursor);
            let pages = size.div_ceil(PAGE_SIZE);
            for page in 0..pages {
                let page_va = cursor.offset((page * PAGE_SIZE) as u64);
                services.map_page(physical.offset((page * PAGE_SIZE) as u64), page_va, map_flags);
                self.publish_cache_virtual(services, page_index + page, page_va);
            }
            cursor = cursor.offset(size as u64);
            page_index += pages;
        }
        self.flags |= BufferFlags::MAPPED | BufferFlags::VIRTUALLY_CONTIGUOUS;
        Ok(())
    }

    /// Map each maximal run of unmapped fragments into its own range,
    /// leaving fragments that already hold a virtual address untouched.
    fn map_fragment_runs<S: KernelServices>(
        &mut self,
        services: &mut S,
        map_flags: MapFlags,
    ) -> Result<()> {
        let mut index = 0usize;
        let mut page_index = 0usize;
        while index < self.fragments.len() {
            if self.fragments[index].virtual_address.is_some() {
                page_index += self.fragments[index].size.div_ceil(PAGE_SIZE);
                index += 1;
                continue;
            }
            let run_start = index;
            let mut run_size = 0usize;
            while index < self.fragments.len()
                && self.fragments[index].virtual_address.is_none()
            {
                run_size += self.fragments[index].size;
                index += 1;
            }
            let range = services.reserve_range(run_size, PAGE_SIZE)?;
            // From here on the buffer owns virtual space; free must
            // release it even if a later run reservation fails.
            self.flags |= BufferFlags::UNMAP_ON_FREE;
            let mut cursor = range;
            for fragment_index in run_start..index {
                let size = self.fragments[fragment_index].size;
                let physical = self.fragments[fragment_index].physical_address.ok_or(
                    IoBufferError::InvalidParameter {
                        name: "fragment without physical address",
                    },
                )?;
                self.fragments[fragment_index].virtual_address = Some(cursor);
                let pages = size.div_ceil(PAGE_SIZE);
                for page in 0..pages {
                    let page_va = cursor.offset((page * PAGE_SIZE) as u64);
                    services.map_page(
                        physical.offset((page * PAGE_SIZE) as u64),
                        page_va,
                        map_flags,
                    );
                    self.publish_cache_virtual(services, page_index + page, page_va);
                }
                cursor = cursor.offset(size as u64);
                page_index += pages;
            }
        }
        self.flags |= BufferFlags::MAPPED;
        Ok(())
    }

    /// Offer a freshly mapped address to the page cache entry backing
    /// this page, if the entry has none published yet. Losing the
    /// publication race is benign; the winner wrote the same mapping.
    fn publish_cache_virtual<S: KernelServices>(
        &self,
        services: &S,
        page_index: usize,
        page_va: VirtualAddress,
    ) {
        if let Some(entry) = self.cache_entry_at_page(page_index) {
            if services.entry_virtual(entry).is_none() {
                services.publish_virtual(entry, page_va);
            }
        }
    }

    /// Release the buffer's kernel virtual mappings.
    ///
    /// Pages whose mapping belongs to the page cache are preserved;
    /// ownership is decided by literal equality between the page's
    /// address and the entry's published address. Everything else is batched
    /// into maximal contiguous runs and handed back to the range
    /// allocator with a TLB invalidation broadcast. A failing release is
    /// logged as a leak and not propagated.
    pub fn unmap<S: KernelServices>(&mut self, services: &mut S) {
        let cache_backed = self.flags.contains(BufferFlags::CACHE_BACKED);
        let mut run: Option<(VirtualAddress, usize)> = None;
        let mut page_index = 0usize;
        for index in 0..self.fragments.len() {
            let fragment = self.fragments[index];
            let pages = fragment.size.div_ceil(PAGE_SIZE);
            let Some(base) = fragment.virtual_address else {
                page_index += pages;
                continue;
            };
            let mut preserved = 0usize;
            for page in 0..pages {
                let page_va = base.offset((page * PAGE_SIZE) as u64);
                let preserve = cache_backed
                    && self
                        .cache_entry_at_page(page_index + page)
                        .map(|entry| services.entry_virtual(entry) == Some(page_va))
                        .unwrap_or(false);
                if preserve {
                    preserved += 1;
                    if let Some(pending) = run.take() {
                        Self::release_run(services, pending);
                    }
                } else {
                    run = match run {
                        Some((start, length))
                            if start.offset(length as u64) == page_va =>
                        {
                            Some((start, length + PAGE_SIZE))
                        }
                        Some(pending) => {
                            Self::release_run(services, pending);
                            Some((page_va, PAGE_SIZE))
                        }
                        None => Some((page_va, PAGE_SIZE)),
                    };
                }
            }
            if preserved < pages {
                self.fragments[index].virtual_address = None;
            }
            page_index += pages;
        }
        if let Some(pending) = run {
            Self::release_run(services, pending);
        }
        self.flags.remove(
            BufferFlags::MAPPED | BufferFlags::UNMAP_ON_FREE | BufferFlags::VIRTUALLY_CONTIGUOUS,
        );
    }

    fn release_run<S: KernelServices>(services: &mut S, (start, length): (VirtualAddress, usize)) {
        if let Err(error) =
            services.release_range(start, length, ReleaseFlags::SEND_INVALIDATE_IPI)
        {
            // No caller to receive this; the buffer is going away.
            log::warn!(
                "leaking virtual range {:#x}..{:#x}: {}",
                start.as_u64(),
                start.as_u64() + length as u64,
                error
            );
            crate::stats::note_virtual_bytes_leaked(length);
        }
    }
}
