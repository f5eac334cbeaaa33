//! Buffer constructors.
//!
//! Every constructor sizes the fragment array so the worst-case layout
//! fits without reallocation, installs the flag set its lifecycle
//! contract requires, and leaves the buffer releasable on every failure
//! path.

use alloc::vec::Vec;

use crate::addr::{
    align_up, pages_spanning, range_is_kernel, range_is_user, PhysicalAddress, VirtualAddress,
    PAGE_SIZE,
};
use crate::buffer::{Fragment, IoBuffer};
use crate::error::{IoBufferError, Result};
use crate::flags::{BufferFlags, MapFlags, ReleaseFlags};
use crate::services::{IoVector, KernelServices, PoolType};

/// Upper bound on scatter/gather vector elements.
pub const MAX_VECTOR_COUNT: usize = 1024;

/// Wire size of one user-space vector element: address and size, both
/// 64-bit.
const USER_VECTOR_ELEMENT_SIZE: usize = 16;

impl IoBuffer {
    /// Allocate a buffer backed by fresh non-paged physical memory,
    /// mapped into one contiguous kernel virtual range.
    ///
    /// `alignment` is rounded up to at least the page size and `size` up
    /// to the alignment. When `physically_contiguous` is set the backing
    /// is a single physical run; otherwise one run per alignment-sized
    /// unit, laid out in ascending physical order so physically adjacent
    /// runs coalesce into one fragment.
    #[allow(clippy::too_many_arguments)]
    pub fn allocate_non_paged<S: KernelServices>(
        services: &mut S,
        min_physical: PhysicalAddress,
        max_physical: PhysicalAddress,
        alignment: usize,
        size: usize,
        physically_contiguous: bool,
        write_through: bool,
        non_cached: bool,
    ) -> Result<Self> {
        // Arbitrary physical windows are a known limitation; only the
        // full window is honoured.
        debug_assert!(min_physical.as_u64() == 0 && max_physical.as_u64() == u64::MAX);

        let alignment = align_up(alignment.max(PAGE_SIZE), PAGE_SIZE);
        let size = align_up(size, alignment);
        let page_count = size / PAGE_SIZE;
        let flags = BufferFlags::NON_PAGED
            | BufferFlags::UNMAP_ON_FREE
            | BufferFlags::MEMORY_OWNED
            | BufferFlags::MEMORY_LOCKED
            | BufferFlags::MAPPED
            | BufferFlags::VIRTUALLY_CONTIGUOUS;
        let max_fragments = if physically_contiguous { 1 } else { page_count };
        if size == 0 {
            return Ok(Self::with_slots(max_fragments, 0, true, flags));
        }

        let range = services.reserve_range(size, alignment)?;
        let built = if physically_contiguous {
            Self::build_contiguous_non_paged(
                services,
                range,
                size,
                max_fragments,
                page_count,
                flags,
                write_through,
                non_cached,
            )
        } else {
            Self::build_fragmented_non_paged(
                services,
                range,
                size,
                alignment,
                page_count,
                flags,
                write_through,
                non_cached,
            )
        };
        match built {
            Ok(buffer) => Ok(buffer),
            Err(error) => {
                // Tear down whatever got mapped along with the range
                // reservation itself.
                let _ = services.release_range(
                    range,
                    size,
                    ReleaseFlags::FREE_PHYSICAL_PAGES | ReleaseFlags::SEND_INVALIDATE_IPI,
                );
                Err(error)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_contiguous_non_paged<S: KernelServices>(
        services: &mut S,
        range: VirtualAddress,
        size: usize,
        max_fragments: usize,
        page_count: usize,
        flags: BufferFlags,
        write_through: bool,
        non_cached: bool,
    ) -> Result<Self> {
        services.map_range(range, size, size, write_through, non_cached)?;
        let mut buffer = Self::with_slots(max_fragments, page_count, true, flags);
        for index in 0..page_count {
            let page_va = range.offset((index * PAGE_SIZE) as u64);
            let page_pa = services
                .virtual_to_physical(page_va)
                .ok_or(IoBufferError::InvalidParameter {
                    name: "unmapped backing page",
                })?;
            buffer.append_run(Some(page_va), Some(page_pa), PAGE_SIZE)?;
        }
        Ok(buffer)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_fragmented_non_paged<S: KernelServices>(
        services: &mut S,
        range: VirtualAddress,
        size: usize,
        run_size: usize,
        page_count: usize,
        flags: BufferFlags,
        write_through: bool,
        non_cached: bool,
    ) -> Result<Self> {
        let run_pages = run_size / PAGE_SIZE;
        let run_count = size / run_size;
        let mut runs: Vec<PhysicalAddress> = Vec::with_capacity(run_count);
        for _ in 0..run_count {
            match services.allocate_pages(run_pages, run_size) {
                Some(run) => runs.push(run),
                None => {
                    // Nothing is mapped yet; hand the loose runs back
                    // before the caller releases the range.
                    for run in runs {
                        for page in 0..run_pages {
                            services.free_page(run.offset((page * PAGE_SIZE) as u64));
                        }
                    }
                    return Err(IoBufferError::InsufficientResources {
                        resource: "physical pages",
                    });
                }
            }
        }

        // Lay runs out in ascending physical order; adjacent runs then
        // coalesce into one fragment.
        runs.sort_unstable_by_key(|run| run.as_u64());

        let map_flags = MapFlags::kernel(write_through, non_cached);
        let mut buffer = Self::with_slots(page_count, page_count, true, flags);
        let mut cursor = range;
        for run in runs {
            for page in 0..run_pages {
                services.map_page(
                    run.offset((page * PAGE_SIZE) as u64),
                    cursor.offset((page * PAGE_SIZE) as u64),
                    map_flags,
                );
            }
            buffer.append_run(Some(cursor), Some(run), run_size)?;
            cursor = cursor.offset(run_size as u64);
        }
        Ok(buffer)
    }

    /// Allocate a buffer whose backing is pageable pool memory: one
    /// fragment, no physical addresses known.
    pub fn allocate_paged<S: KernelServices>(services: &mut S, size: usize) -> Result<Self> {
        let backing = services
            .pool_allocate(PoolType::Paged, size)
            .ok_or(IoBufferError::InsufficientResources {
                resource: "paged pool",
            })?;
        let mut buffer = Self::with_slots(
            1,
            0,
            false,
            BufferFlags::VIRTUALLY_CONTIGUOUS | BufferFlags::MAPPED,
        );
        buffer.paged_backing = Some(backing);
        buffer.append_run(Some(backing), None, size)?;
        Ok(buffer)
    }

    /// Allocate an empty extendable shell: fragment slots (and cache
    /// entry slots when `cache_backed`) for `size` bytes, no backing.
    pub fn allocate_uninitialised(size: usize, cache_backed: bool) -> Self {
        let page_count = pages_spanning(size);
        let mut flags = BufferFlags::NON_PAGED | BufferFlags::EXTENDABLE;
        if cache_backed {
            flags |= BufferFlags::CACHE_BACKED | BufferFlags::MEMORY_LOCKED;
        }
        Self::with_slots(page_count, page_count, cache_backed, flags)
    }

    /// Describe an existing virtual range.
    ///
    /// The whole range must lie on one side of the kernel/user split as
    /// dictated by `kernel_mode`. Without `lock_memory` the result is a
    /// single virtual-only fragment. With it, every page is pinned:
    /// pages covered by an image section are paged in (taking over any
    /// page cache reference the pager returns), the rest must be
    /// non-paged and are resolved through the page tables.
    pub fn create_from_range<S: KernelServices>(
        services: &mut S,
        address: VirtualAddress,
        size: usize,
        non_paged: bool,
        lock_memory: bool,
        kernel_mode: bool,
    ) -> Result<Self> {
        let range_valid = if kernel_mode {
            range_is_kernel(address, size)
        } else {
            range_is_user(address, size)
        };
        if !range_valid {
            return Err(IoBufferError::AccessViolation {
                address: address.as_u64(),
            });
        }

        let mut flags = BufferFlags::MAPPED | BufferFlags::VIRTUALLY_CONTIGUOUS;
        if !kernel_mode {
            flags |= BufferFlags::USER_MODE;
        }
        if non_paged {
            flags |= BufferFlags::NON_PAGED;
        }

        if !lock_memory || size == 0 {
            let mut buffer = Self::with_slots(1, 0, false, flags);
            buffer.fragments.push(Fragment {
                virtual_address: Some(address),
                physical_address: None,
                size,
            });
            buffer.total_size = size;
            return Ok(buffer);
        }

        let page_count = pages_spanning(address.page_offset() + size);
        let mut buffer = Self::with_slots(page_count, page_count, true, flags);
        let base = address.page_base();
        let mut locked_any = false;
        let mut consumed = 0usize;
        for index in 0..page_count {
            let page_va = base.offset((index * PAGE_SIZE) as u64);
            let page_pa =
                match Self::pin_one_page(services, page_va, &mut buffer, index, &mut locked_any) {
                    Ok(pa) => pa,
                    Err(error) => {
                        if locked_any {
                            buffer.flags |= BufferFlags::MEMORY_LOCKED;
                        }
                        buffer.release_resources(services);
                        return Err(error);
                    }
                };

            // The first fragment may begin mid-page; everything after
            // is page aligned until the final partial page.
            let (fragment_va, fragment_pa) = if index == 0 {
                (address, page_pa.offset(address.page_offset() as u64))
            } else {
                (page_va, page_pa)
            };
            let fragment_size =
                (PAGE_SIZE - fragment_va.page_offset()).min(size - consumed);
            if let Err(error) =
                buffer.append_run(Some(fragment_va), Some(fragment_pa), fragment_size)
            {
                buffer.flags |= BufferFlags::MEMORY_LOCKED;
                buffer.release_resources(services);
                return Err(error);
            }
            consumed += fragment_size;
        }
        if locked_any {
            buffer.flags |= BufferFlags::MEMORY_LOCKED;
        }
        Ok(buffer)
    }

    /// Pin the page at `page_va`, via its image section when one covers
    /// it, and record any page cache reference handed over by the pager.
    fn pin_one_page<S: KernelServices>(
        services: &mut S,
        page_va: VirtualAddress,
        buffer: &mut IoBuffer,
        page_index: usize,
        locked_any: &mut bool,
    ) -> Result<PhysicalAddress> {
        if let Some(section) = services.section_lookup(page_va) {
            let paged_in = loop {
                match services.page_in(section, page_va) {
                    Ok(result) => break Ok(result),
                    Err(IoBufferError::TryAgain) => continue,
                    Err(error) => break Err(error),
                }
            };
            services.section_release(section);
            let result = paged_in?;
            if let Some(entry) = result.cache_entry {
                buffer.cache_entries[page_index] = Some(entry);
                buffer.flags |= BufferFlags::CACHE_BACKED;
            }
            *locked_any = true;
            Ok(result.physical_address)
        } else {
            // No section: the page must already be non-paged.
            match services.virtual_to_physical(page_va) {
                Some(pa) => {
                    *locked_any = true;
                    Ok(pa)
                }
                None => Err(IoBufferError::InvalidParameter {
                    name: "unmapped non-paged page",
                }),
            }
        }
    }

    /// Aggregate a scatter/gather vector of user ranges into a buffer.
    ///
    /// Zero-length elements are dropped and virtually adjacent elements
    /// merge into one fragment. Elements reaching kernel space are
    /// rejected.
    pub fn create_from_vector(vectors: &[IoVector]) -> Result<Self> {
        if vectors.is_empty() || vectors.len() > MAX_VECTOR_COUNT {
            return Err(IoBufferError::InvalidParameter {
                name: "vector count",
            });
        }
        let mut buffer = Self::with_slots(
            vectors.len(),
            0,
            false,
            BufferFlags::USER_MODE | BufferFlags::MAPPED,
        );
        for vector in vectors {
            if vector.size == 0 {
                continue;
            }
            if !range_is_user(vector.address, vector.size) {
                return Err(IoBufferError::AccessViolation {
                    address: vector.address.as_u64(),
                });
            }
            buffer.append_run(Some(vector.address), None, vector.size)?;
        }
        Ok(buffer)
    }

    /// Copy a vector array out of user memory, then aggregate it.
    ///
    /// Small vectors land in a stack buffer; larger ones take a heap
    /// allocation.
    pub fn create_from_user_vector<S: KernelServices>(
        services: &mut S,
        vector_address: VirtualAddress,
        count: usize,
    ) -> Result<Self> {
        if count == 0 || count > MAX_VECTOR_COUNT {
            return Err(IoBufferError::InvalidParameter {
                name: "vector count",
            });
        }
        let byte_len = count * USER_VECTOR_ELEMENT_SIZE;
        let mut stack_storage = [0u8; 8 * USER_VECTOR_ELEMENT_SIZE];
        let mut heap_storage;
        let raw: &mut [u8] = if count <= 8 {
            &mut stack_storage[..byte_len]
        } else {
            heap_storage = alloc::vec![0u8; byte_len];
            &mut heap_storage[..]
        };
        services.copy_from_user(raw, vector_address)?;

        let mut elements = Vec::with_capacity(count);
        for chunk in raw.chunks_exact(USER_VECTOR_ELEMENT_SIZE) {
            let mut word = [0u8; 8];
            word.copy_from_slice(&chunk[..8]);
            let address = VirtualAddress::new(u64::from_ne_bytes(word));
            word.copy_from_slice(&chunk[8..]);
            let size = u64::from_ne_bytes(word) as usize;
            elements.push(IoVector { address, size });
        }
        Self::create_from_vector(&elements)
    }

    /// Fill a caller-owned descriptor covering at most a single page.
    ///
    /// An unknown physical address is resolved through the page tables
    /// when a virtual address is available. Does not allocate backing.
    pub fn initialize_in_place<S: KernelServices>(
        descriptor: &mut IoBuffer,
        services: &S,
        virtual_address: Option<VirtualAddress>,
        physical_address: Option<PhysicalAddress>,
        size: usize,
        cache_backed: bool,
        memory_locked: bool,
    ) {
        debug_assert!(size <= PAGE_SIZE);
        let mut flags = BufferFlags::STRUCTURE_NOT_OWNED;
        if virtual_address.is_some() {
            flags |= BufferFlags::MAPPED | BufferFlags::VIRTUALLY_CONTIGUOUS;
        }
        if cache_backed {
            flags |= BufferFlags::CACHE_BACKED;
        }
        if memory_locked {
            flags |= BufferFlags::MEMORY_LOCKED;
        }
        let physical_address = physical_address
            .or_else(|| virtual_address.and_then(|va| services.virtual_to_physical(va)));
        let mut buffer = Self::with_slots(1, 1, cache_backed, flags);
        buffer.fragments.push(Fragment {
            virtual_address,
            physical_address,
            size,
        });
        buffer.total_size = size;
        *descriptor = buffer;
    }
}
