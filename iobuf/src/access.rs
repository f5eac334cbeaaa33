//! Data access and mutation: copies, zeroing, appending, extension, and
//! the validation paths that transparently swap in a compliant buffer.

use core::mem;

use crate::addr::{align_up, pages_spanning, PhysicalAddress, VirtualAddress, PAGE_SIZE};
use crate::buffer::IoBuffer;
use crate::error::{IoBufferError, Result};
use crate::flags::BufferFlags;
use crate::services::{CacheEntryId, KernelServices};

/// Device addressing requirements used by the DMA validation path.
#[derive(Debug, Clone, Copy)]
pub struct DmaConstraints {
    pub min_physical: PhysicalAddress,
    pub max_physical: PhysicalAddress,
    pub alignment: usize,
    pub physically_contiguous: bool,
}

impl Default for DmaConstraints {
    fn default() -> Self {
        Self {
            min_physical: PhysicalAddress::new(0),
            max_physical: PhysicalAddress::new(u64::MAX),
            alignment: 0,
            physically_contiguous: false,
        }
    }
}

/// Bounce chunk for transfers that cross the user boundary.
const BOUNCE_SIZE: usize = 512;
static ZEROES: [u8; BOUNCE_SIZE] = [0; BOUNCE_SIZE];

impl IoBuffer {
    /// Copy `length` bytes from `source` into this buffer.
    ///
    /// Both cursors apply to their buffer's offset argument. An
    /// extendable destination grows to fit; both sides are mapped on
    /// demand. The transfer proceeds fragment by fragment, moving the
    /// largest chunk both sides can take at once.
    pub fn copy_from<S: KernelServices>(
        &mut self,
        services: &mut S,
        to_offset: usize,
        source: &mut IoBuffer,
        from_offset: usize,
        length: usize,
    ) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        let to_offset = to_offset + self.current_offset;
        let from_offset = from_offset + source.current_offset;
        self.ensure_capacity(services, to_offset + length)?;
        self.ensure_mapped(services)?;
        source.ensure_mapped(services)?;

        let (mut to_index, mut to_within) =
            self.fragment_index_at(to_offset)
                .ok_or(IoBufferError::IncorrectBufferSize {
                    offset: to_offset,
                    size: length,
                })?;
        let (mut from_index, mut from_within) =
            source
                .fragment_index_at(from_offset)
                .ok_or(IoBufferError::IncorrectBufferSize {
                    offset: from_offset,
                    size: length,
                })?;
        let to_user = self.flags.contains(BufferFlags::USER_MODE);
        let from_user = source.flags.contains(BufferFlags::USER_MODE);

        let mut remaining = length;
        while remaining > 0 {
            let to_fragment = self.fragments.get(to_index).ok_or(
                IoBufferError::IncorrectBufferSize {
                    offset: to_offset,
                    size: length,
                },
            )?;
            let from_fragment = source.fragments.get(from_index).ok_or(
                IoBufferError::IncorrectBufferSize {
                    offset: from_offset,
                    size: length,
                },
            )?;
            let chunk = (to_fragment.size - to_within)
                .min(from_fragment.size - from_within)
                .min(remaining);
            let to_va = to_fragment
                .virtual_address
                .ok_or(IoBufferError::InvalidParameter {
                    name: "unmapped destination fragment",
                })?
                .offset(to_within as u64);
            let from_va = from_fragment
                .virtual_address
                .ok_or(IoBufferError::InvalidParameter {
                    name: "unmapped source fragment",
                })?
                .offset(from_within as u64);

            if !to_user && !from_user {
                services.copy_memory(to_va, from_va, chunk)?;
            } else {
                Self::bounce_copy(services, to_va, to_user, from_va, from_user, chunk)?;
            }

            remaining -= chunk;
            to_within += chunk;
            if to_within == to_fragment.size {
                to_index += 1;
                to_within = 0;
            }
            from_within += chunk;
            if from_within == from_fragment.size {
                from_index += 1;
                from_within = 0;
            }
        }
        Ok(())
    }

    /// Transfer across the user boundary through a small kernel chunk,
    /// using the faulting-safe copier for each user side.
    fn bounce_copy<S: KernelServices>(
        services: &S,
        to: VirtualAddress,
        to_user: bool,
        from: VirtualAddress,
        from_user: bool,
        length: usize,
    ) -> Result<()> {
        let mut chunk = [0u8; BOUNCE_SIZE];
        let mut position = 0usize;
        while position < length {
            let piece = (length - position).min(BOUNCE_SIZE);
            let staged = &mut chunk[..piece];
            if from_user {
                services.copy_from_user(staged, from.offset(position as u64))?;
            } else {
                services.read_memory(from.offset(position as u64), staged)?;
            }
            if to_user {
                services.copy_to_user(to.offset(position as u64), staged)?;
            } else {
                services.write_memory(to.offset(position as u64), staged)?;
            }
            position += piece;
        }
        Ok(())
    }

    /// Copy linear kernel data into the buffer at `offset` past the
    /// cursor, extending an extendable buffer as needed.
    pub fn copy_in<S: KernelServices>(
        &mut self,
        services: &mut S,
        offset: usize,
        data: &[u8],
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let offset = offset + self.current_offset;
        self.ensure_capacity(services, offset + data.len())?;
        self.ensure_mapped(services)?;
        let user = self.flags.contains(BufferFlags::USER_MODE);
        self.walk_chunks(offset, data.len(), |chunk_va, range| {
            if user {
                services.copy_to_user(chunk_va, &data[range])
            } else {
                services.write_memory(chunk_va, &data[range])
            }
        })
    }

    /// Copy buffer contents out to linear kernel storage.
    pub fn copy_out<S: KernelServices>(
        &mut self,
        services: &mut S,
        offset: usize,
        data: &mut [u8],
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let offset = offset + self.current_offset;
        self.ensure_mapped(services)?;
        let user = self.flags.contains(BufferFlags::USER_MODE);
        let length = data.len();
        self.walk_chunks(offset, length, |chunk_va, range| {
            if user {
                services.copy_from_user(&mut data[range], chunk_va)
            } else {
                services.read_memory(chunk_va, &mut data[range])
            }
        })
    }

    /// Zero `length` bytes at `offset` past the cursor, with the same
    /// extension and mapping behaviour as the copy paths.
    pub fn zero<S: KernelServices>(
        &mut self,
        services: &mut S,
        offset: usize,
        length: usize,
    ) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        let offset = offset + self.current_offset;
        self.ensure_capacity(services, offset + length)?;
        self.ensure_mapped(services)?;
        let user = self.flags.contains(BufferFlags::USER_MODE);
        self.walk_chunks(offset, length, |chunk_va, range| {
            if user {
                let mut position = 0usize;
                let total = range.len();
                while position < total {
                    let piece = (total - position).min(BOUNCE_SIZE);
                    services.copy_to_user(chunk_va.offset(position as u64), &ZEROES[..piece])?;
                    position += piece;
                }
                Ok(())
            } else {
                services.zero_memory(chunk_va, range.len())
            }
        })
    }

    /// Walk the fragment list from absolute `offset`, handing each
    /// chunk's mapped address and the matching linear range to `apply`.
    fn walk_chunks<F>(&self, offset: usize, length: usize, mut apply: F) -> Result<()>
    where
        F: FnMut(VirtualAddress, core::ops::Range<usize>) -> Result<()>,
    {
        let (mut index, mut within) =
            self.fragment_index_at(offset)
                .ok_or(IoBufferError::IncorrectBufferSize {
                    offset,
                    size: length,
                })?;
        let mut position = 0usize;
        while position < length {
            let fragment =
                self.fragments
                    .get(index)
                    .ok_or(IoBufferError::IncorrectBufferSize {
                        offset,
                        size: length,
                    })?;
            let chunk = (fragment.size - within).min(length - position);
            let chunk_va = fragment
                .virtual_address
                .ok_or(IoBufferError::InvalidParameter {
                    name: "unmapped fragment",
                })?
                .offset(within as u64);
            apply(chunk_va, position..position + chunk)?;
            position += chunk;
            index += 1;
            within = 0;
        }
        Ok(())
    }

    /// Grow the buffer so it holds at least `required` bytes, when its
    /// policy allows.
    fn ensure_capacity<S: KernelServices>(
        &mut self,
        services: &mut S,
        required: usize,
    ) -> Result<()> {
        if required <= self.total_size {
            return Ok(());
        }
        if !self.flags.contains(BufferFlags::EXTENDABLE) {
            return Err(IoBufferError::BufferTooSmall {
                required,
                capacity: self.total_size,
            });
        }
        let shortfall = required - self.total_size;
        self.extend(
            services,
            PhysicalAddress::new(0),
            PhysicalAddress::new(u64::MAX),
            PAGE_SIZE,
            shortfall,
            false,
        )
    }

    fn ensure_mapped<S: KernelServices>(&mut self, services: &mut S) -> Result<()> {
        if self.flags.contains(BufferFlags::USER_MODE) || self.flags.contains(BufferFlags::MAPPED)
        {
            return Ok(());
        }
        self.map(services, false, false, false)
    }

    /// Append one page to an extendable buffer, sourced from a page
    /// cache entry, an explicit physical page, or neither.
    ///
    /// At most one of `entry` and `physical_address` may be given, and
    /// the buffer must end on a page boundary.
    pub fn append_page<S: KernelServices>(
        &mut self,
        services: &mut S,
        entry: Option<CacheEntryId>,
        virtual_address: Option<VirtualAddress>,
        physical_address: Option<PhysicalAddress>,
    ) -> Result<()> {
        debug_assert!(self.flags.contains(BufferFlags::EXTENDABLE));
        debug_assert!(entry.is_none() || physical_address.is_none());
        debug_assert_eq!(self.total_size % PAGE_SIZE, 0);

        let page_index = self.total_size / PAGE_SIZE;
        let (virtual_address, physical_address) = match entry {
            Some(entry) => (
                services.entry_virtual(entry),
                Some(services.entry_physical(entry)),
            ),
            None => (virtual_address, physical_address),
        };
        if entry.is_some() {
            if self.cache_entries.is_empty() {
                self.cache_entries.resize(self.page_count, None);
            }
            if page_index >= self.cache_entries.len() {
                return Err(IoBufferError::BufferTooSmall {
                    required: self.total_size + PAGE_SIZE,
                    capacity: self.page_count * PAGE_SIZE,
                });
            }
        }
        self.append_run(virtual_address, physical_address, PAGE_SIZE)?;
        if let Some(entry) = entry {
            services.add_reference(entry);
            debug_assert!(self.cache_entries[page_index].is_none());
            self.cache_entries[page_index] = Some(entry);
            self.flags |= BufferFlags::CACHE_BACKED;
        }
        Ok(())
    }

    /// Associate a cache entry with an already-built page of the buffer.
    /// The slot must be vacant and the entry's physical page must be the
    /// one already described at `offset`.
    pub fn set_cache_entry_at<S: KernelServices>(
        &mut self,
        services: &S,
        offset: usize,
        entry: CacheEntryId,
    ) {
        let absolute = self.current_offset + offset;
        debug_assert_eq!(absolute % PAGE_SIZE, 0);
        let page_index = absolute / PAGE_SIZE;
        if self.cache_entries.is_empty() {
            self.cache_entries.resize(self.page_count, None);
        }
        debug_assert!(page_index < self.cache_entries.len());
        if page_index >= self.cache_entries.len() {
            return;
        }
        debug_assert!(self.cache_entries[page_index].is_none());
        debug_assert_eq!(
            self.physical_address_at(offset),
            Some(services.entry_physical(entry))
        );
        services.add_reference(entry);
        self.cache_entries[page_index] = Some(entry);
        self.flags |= BufferFlags::CACHE_BACKED;
    }

    /// Append freshly allocated physical pages.
    ///
    /// The contiguous path allocates one aligned run; otherwise pages
    /// come one at a time, each coalescing into the previous fragment
    /// when physically adjacent. A mid-way allocation failure leaves the
    /// pages already appended in place. New pages carry no mapping, so
    /// the mapped state is cleared.
    pub fn extend<S: KernelServices>(
        &mut self,
        services: &mut S,
        min_physical: PhysicalAddress,
        max_physical: PhysicalAddress,
        alignment: usize,
        size: usize,
        physically_contiguous: bool,
    ) -> Result<()> {
        // Arbitrary physical windows are a known limitation; only the
        // full window is honoured.
        debug_assert!(min_physical.as_u64() == 0 && max_physical.as_u64() == u64::MAX);

        let page_count = pages_spanning(size);
        if page_count == 0 {
            return Ok(());
        }
        let worst_case_fragments = if physically_contiguous { 1 } else { page_count };
        if worst_case_fragments > self.fragment_slots_remaining() {
            return Err(IoBufferError::BufferTooSmall {
                required: self.total_size + size,
                capacity: self.total_size + self.fragment_slots_remaining() * PAGE_SIZE,
            });
        }
        let alignment = alignment.max(PAGE_SIZE);

        if physically_contiguous {
            let run = services
                .allocate_pages(page_count, alignment)
                .ok_or(IoBufferError::NoMemory {
                    requested_pages: page_count,
                })?;
            if let Err(error) = self.append_run(None, Some(run), page_count * PAGE_SIZE) {
                for page in 0..page_count {
                    services.free_page(run.offset((page * PAGE_SIZE) as u64));
                }
                return Err(error);
            }
            self.note_extended();
        } else {
            for allocated in 0..page_count {
                let Some(page) = services.allocate_pages(1, PAGE_SIZE) else {
                    return Err(IoBufferError::NoMemory {
                        requested_pages: page_count - allocated,
                    });
                };
                if let Err(error) = self.append_run(None, Some(page), PAGE_SIZE) {
                    services.free_page(page);
                    return Err(error);
                }
                self.note_extended();
            }
        }
        Ok(())
    }

    /// Flag bookkeeping shared by every successful page append in the
    /// extension path.
    fn note_extended(&mut self) {
        self.flags |= BufferFlags::MEMORY_OWNED;
        self.flags
            .remove(BufferFlags::MAPPED | BufferFlags::VIRTUALLY_CONTIGUOUS);
    }

    /// Check the buffer against device DMA constraints, extending it in
    /// place when possible and otherwise swapping in a freshly allocated
    /// compliant buffer.
    ///
    /// Returns the displaced original when a replacement happened; the
    /// caller then owns both buffers.
    pub fn validate_for_dma<S: KernelServices>(
        &mut self,
        services: &mut S,
        constraints: &DmaConstraints,
        size: usize,
    ) -> Result<Option<IoBuffer>> {
        let available = self.size_remaining();
        if available < size && !self.flags.contains(BufferFlags::EXTENDABLE) {
            return Err(IoBufferError::BufferTooSmall {
                required: size,
                capacity: available,
            });
        }

        // DMA straight out of user mappings is not supported.
        let mut reallocate = self.flags.contains(BufferFlags::USER_MODE);
        if !reallocate {
            reallocate = !self.window_satisfies(constraints, size);
        }

        if !reallocate && available < size {
            let shortfall = size - available;
            if constraints.physically_contiguous {
                // A contiguous run cannot be spliced into the middle of
                // existing data.
                if self.current_offset == self.total_size {
                    self.extend(
                        services,
                        constraints.min_physical,
                        constraints.max_physical,
                        constraints.alignment,
                        shortfall,
                        true,
                    )?;
                } else {
                    reallocate = true;
                }
            } else {
                self.extend(
                    services,
                    constraints.min_physical,
                    constraints.max_physical,
                    constraints.alignment,
                    shortfall,
                    false,
                )?;
            }
        }

        if reallocate {
            let replacement = IoBuffer::allocate_non_paged(
                services,
                constraints.min_physical,
                constraints.max_physical,
                constraints.alignment,
                size,
                constraints.physically_contiguous,
                false,
                false,
            )?;
            log::debug!("reallocated {} byte buffer for device constraints", size);
            return Ok(Some(mem::replace(self, replacement)));
        }
        Ok(None)
    }

    /// Whether the fragments covering the next `size` bytes past the
    /// cursor meet the given constraints.
    fn window_satisfies(&self, constraints: &DmaConstraints, size: usize) -> bool {
        let alignment = constraints.alignment.max(1);
        let window_end = (self.current_offset + size).min(self.total_size);
        let mut position = 0usize;
        let mut previous_end: Option<PhysicalAddress> = None;
        for fragment in &self.fragments {
            let fragment_start = position;
            position += fragment.size;
            if position <= self.current_offset {
                continue;
            }
            if fragment_start >= window_end {
                break;
            }
            let Some(physical) = fragment.physical_address else {
                return false;
            };
            if !physical.is_aligned_to(alignment) || fragment.size % alignment != 0 {
                return false;
            }
            let last_byte = physical.as_u64() + fragment.size as u64 - 1;
            if physical.as_u64() < constraints.min_physical.as_u64()
                || last_byte > constraints.max_physical.as_u64()
            {
                return false;
            }
            if constraints.physically_contiguous {
                if let Some(previous) = previous_end {
                    if previous != physical {
                        return false;
                    }
                }
            }
            previous_end = fragment.physical_end();
        }
        true
    }

    /// Make sure `buffer` is suitable for cached I/O of `size` more
    /// bytes, replacing it with a fresh cache-backed shell when it is
    /// missing, misaligned, mid-buffer, or out of slots.
    ///
    /// Passing `alignment == 0` selects the data cache line size.
    /// Returns the displaced original, if any.
    pub fn validate_for_cached_io<S: KernelServices>(
        services: &S,
        buffer: &mut Option<IoBuffer>,
        size: usize,
        alignment: usize,
    ) -> Option<IoBuffer> {
        let alignment = if alignment == 0 {
            services.data_cache_line_size()
        } else {
            alignment
        }
        .max(1);
        let replace = match buffer.as_ref() {
            None => true,
            Some(existing) => {
                !existing.flags.contains(BufferFlags::CACHE_BACKED)
                    || !existing.flags.contains(BufferFlags::EXTENDABLE)
                    || existing.current_offset % alignment != 0
                    || existing.current_offset != existing.total_size
                    || existing.fragment_slots_remaining() < pages_spanning(size)
            }
        };
        if replace {
            log::debug!("replacing buffer for cached I/O ({} bytes)", size);
            buffer.replace(IoBuffer::allocate_uninitialised(
                align_up(size, alignment),
                true,
            ))
        } else {
            None
        }
    }
}
