//! The I/O buffer descriptor model.
//!
//! An [`IoBuffer`] describes a logical byte range that may be composed of
//! many discontiguous physical pages, may or may not be mapped into kernel
//! virtual space, and may share pages with the page cache. Constructors
//! live in `create`, the mapping engine in `map`, teardown in `release`,
//! and the copy/extend/validate operations in `access`.

use alloc::vec::Vec;

use crate::addr::{PhysicalAddress, VirtualAddress};
use crate::error::{IoBufferError, Result};
use crate::flags::BufferFlags;
use crate::services::CacheEntryId;

/// A maximal run of bytes contiguous in both physical and virtual space.
///
/// Except possibly the first and last fragment of a buffer, fragments
/// start and end on page boundaries. Either address may be unknown: a
/// user wrap has no physical address until locked, and freshly extended
/// pages have no virtual address until mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub virtual_address: Option<VirtualAddress>,
    pub physical_address: Option<PhysicalAddress>,
    pub size: usize,
}

impl Fragment {
    /// Virtual address one past the end, if the fragment is mapped.
    pub fn virtual_end(&self) -> Option<VirtualAddress> {
        self.virtual_address.map(|va| va.offset(self.size as u64))
    }

    /// Physical address one past the end, if known.
    pub fn physical_end(&self) -> Option<PhysicalAddress> {
        self.physical_address.map(|pa| pa.offset(self.size as u64))
    }
}

/// A buffer descriptor for DMA and block I/O.
#[derive(Debug)]
pub struct IoBuffer {
    pub(crate) fragments: Vec<Fragment>,
    pub(crate) max_fragments: usize,
    pub(crate) total_size: usize,
    pub(crate) current_offset: usize,
    /// Page-sized slots reserved for per-page metadata.
    pub(crate) page_count: usize,
    /// Parallel per-page cache entry handles; empty when the buffer does
    /// not track cache entries, else `page_count` long.
    pub(crate) cache_entries: Vec<Option<CacheEntryId>>,
    /// Paged-pool allocation backing `allocate_paged` buffers.
    pub(crate) paged_backing: Option<VirtualAddress>,
    pub(crate) flags: BufferFlags,
}

impl IoBuffer {
    /// Build an empty descriptor with the given slot reservations.
    pub(crate) fn with_slots(
        max_fragments: usize,
        page_count: usize,
        track_cache_entries: bool,
        flags: BufferFlags,
    ) -> Self {
        let cache_entries = if track_cache_entries {
            let mut entries = Vec::with_capacity(page_count);
            entries.resize(page_count, None);
            entries
        } else {
            Vec::new()
        };
        crate::stats::note_buffer_created();
        Self {
            fragments: Vec::with_capacity(max_fragments),
            max_fragments,
            total_size: 0,
            current_offset: 0,
            page_count,
            cache_entries,
            paged_backing: None,
            flags,
        }
    }

    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    /// Total bytes across all fragments, before the cursor is applied.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn current_offset(&self) -> usize {
        self.current_offset
    }

    /// Bytes remaining past the cursor.
    pub fn size_remaining(&self) -> usize {
        self.total_size - self.current_offset
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Fragment slots still unused.
    pub fn fragment_slots_remaining(&self) -> usize {
        self.max_fragments - self.fragments.len()
    }

    /// Advance the cursor. The cursor never passes the end of the buffer.
    pub fn increment_offset(&mut self, bytes: usize) {
        debug_assert!(self.current_offset + bytes <= self.total_size);
        self.current_offset = (self.current_offset + bytes).min(self.total_size);
    }

    /// Move the cursor back. The cursor never goes below zero.
    pub fn decrement_offset(&mut self, bytes: usize) {
        debug_assert!(bytes <= self.current_offset);
        self.current_offset = self.current_offset.saturating_sub(bytes);
    }

    /// Cache entry recorded for the page-sized slot at `page_index`.
    pub(crate) fn cache_entry_at_page(&self, page_index: usize) -> Option<CacheEntryId> {
        self.cache_entries.get(page_index).copied().flatten()
    }

    /// Physical address of the byte at `offset` past the cursor, or
    /// `None` when the covering fragment has no known physical address
    /// or the offset is out of range.
    pub fn physical_address_at(&self, offset: usize) -> Option<PhysicalAddress> {
        let target = self.current_offset + offset;
        let (index, within) = self.fragment_index_at(target)?;
        self.fragments[index]
            .physical_address
            .map(|pa| pa.offset(within as u64))
    }

    /// Locate the fragment covering the absolute byte `offset`, returning
    /// its index and the offset within it.
    pub(crate) fn fragment_index_at(&self, offset: usize) -> Option<(usize, usize)> {
        let mut start = 0usize;
        for (index, fragment) in self.fragments.iter().enumerate() {
            if offset < start + fragment.size {
                return Some((index, offset - start));
            }
            start += fragment.size;
        }
        None
    }

    /// Append a run of bytes, coalescing into the last fragment when the
    /// new run continues it in every known address space: both physical
    /// addresses unknown or exactly adjacent, and likewise both virtual
    /// addresses. Pairs contiguous in both spaces never stay split.
    pub(crate) fn append_run(
        &mut self,
        virtual_address: Option<VirtualAddress>,
        physical_address: Option<PhysicalAddress>,
        size: usize,
    ) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        if let Some(last) = self.fragments.last_mut() {
            let virtually_compatible = match (last.virtual_end(), virtual_address) {
                (None, None) => true,
                (Some(end), Some(va)) => end == va,
                _ => false,
            };
            let physically_compatible = match (last.physical_end(), physical_address) {
                (None, None) => true,
                (Some(end), Some(pa)) => end == pa,
                _ => false,
            };
            if virtually_compatible && physically_compatible {
                last.size += size;
                self.total_size += size;
                return Ok(());
            }
        }
        if self.fragments.len() == self.max_fragments {
            return Err(IoBufferError::BufferTooSmall {
                required: self.total_size + size,
                capacity: self.total_size,
            });
        }
        self.fragments.push(Fragment {
            virtual_address,
            physical_address,
            size,
        });
        self.total_size += size;
        Ok(())
    }

    /// Whether every fragment carries a virtual address.
    pub(crate) fn all_fragments_mapped(&self) -> bool {
        self.fragments
            .iter()
            .all(|fragment| fragment.virtual_address.is_some())
    }

    /// Whether the fragment virtual addresses form one gap-free run.
    pub(crate) fn fragments_virtually_contiguous(&self) -> bool {
        let mut expected: Option<VirtualAddress> = None;
        for fragment in &self.fragments {
            let Some(va) = fragment.virtual_address else {
                return false;
            };
            if let Some(expected) = expected {
                if expected != va {
                    return false;
                }
            }
            expected = Some(va.offset(fragment.size as u64));
        }
        !self.fragments.is_empty()
    }

    /// Assert the structural invariants of the descriptor. Test aid; the
    /// checks mirror what release and the copy walkers rely on.
    pub fn verify_invariants(&self) {
        assert!(self.current_offset <= self.total_size);
        assert!(self.fragments.len() <= self.max_fragments);
        let byte_sum: usize = self.fragments.iter().map(|f| f.size).sum();
        assert_eq!(byte_sum, self.total_size);
        if !self.cache_entries.is_empty() {
            assert_eq!(self.cache_entries.len(), self.page_count);
        }
        for pair in self.fragments.windows(2) {
            let physically_adjacent =
                matches!((pair[0].physical_end(), pair[1].physical_address),
                    (Some(end), Some(next)) if end == next);
            let virtually_adjacent = matches!(
                (pair[0].virtual_end(), pair[1].virtual_address),
                (Some(end), Some(next)) if end == next
            );
            let both_unmapped =
                pair[0].virtual_address.is_none() && pair[1].virtual_address.is_none();
            assert!(
                !(physically_adjacent && (virtually_adjacent || both_unmapped)),
                "uncoalesced adjacent fragments"
            );
        }
        if self.flags.contains(BufferFlags::VIRTUALLY_CONTIGUOUS) && !self.fragments.is_empty() {
            assert!(self.fragments_virtually_contiguous());
        }
    }
}
