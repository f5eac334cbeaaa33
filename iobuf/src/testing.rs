//! Mock collaborators for exercising the buffer subsystem without real
//! hardware.
//!
//! [`MockKernel`] implements every collaborator trait over an in-memory
//! model: a bump physical allocator (optionally scripted or failure
//! limited), a bump virtual-range allocator, a page table that makes
//! aliased mappings of one physical page truly alias, refcounted page
//! cache entries, and scripted image sections. It also keeps a full
//! account of frees, unlocks, and released references so tests can
//! check that teardown is an exact inverse of construction.

#![cfg(any(test, feature = "testing"))]

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use spin::Mutex;

use crate::addr::{
    align_up, pages_spanning, PhysicalAddress, VirtualAddress, KERNEL_SPACE_START, PAGE_SIZE,
};
use crate::error::{IoBufferError, Result};
use crate::flags::{MapFlags, ReleaseFlags};
use crate::services::{
    CacheEntryId, ImageSections, KernelServices, MemoryAccessor, PageCache, PageFrameAllocator,
    PageInResult, PageMapper, PoolAllocator, PoolType, SectionId, VirtualRangeAllocator,
};

const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

struct MockCacheEntry {
    physical: u64,
    published: Option<u64>,
    references: u32,
    releases: u32,
}

struct MockSectionPage {
    section: u64,
    physical: u64,
    cache_entry: Option<CacheEntryId>,
    retries_remaining: usize,
}

#[derive(Default)]
struct MockState {
    memory: BTreeMap<u64, Box<[u8; PAGE_SIZE]>>,
    page_table: BTreeMap<u64, u64>,
    next_physical: u64,
    next_virtual: u64,
    scripted_physical: VecDeque<u64>,
    page_allocation_limit: Option<usize>,
    reservation_limit: Option<usize>,
    fail_range_release: bool,
    cache_entries: Vec<MockCacheEntry>,
    sections: BTreeMap<u64, MockSectionPage>,
    next_section: u64,
    freed_pages: Vec<u64>,
    unlocked_pages: Vec<u64>,
    reserved_ranges: Vec<(u64, usize)>,
    released_ranges: Vec<(u64, usize)>,
    invalidate_broadcasts: usize,
    pool_allocations: Vec<u64>,
    pool_frees: Vec<u64>,
    section_references: BTreeMap<u64, i64>,
}

impl MockState {
    fn ensure_page(&mut self, physical_page: u64) {
        self.memory
            .entry(physical_page)
            .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
    }

    /// Allocate a physical run, honouring the scripted bases and the
    /// allocation-call limit.
    fn allocate_physical_run(&mut self, pages: usize, alignment: usize) -> Option<u64> {
        if let Some(limit) = self.page_allocation_limit {
            if limit == 0 {
                return None;
            }
            self.page_allocation_limit = Some(limit - 1);
        }
        let base = if let Some(scripted) = self.scripted_physical.pop_front() {
            scripted
        } else {
            let base = align_up(self.next_physical as usize, alignment.max(PAGE_SIZE)) as u64;
            self.next_physical = base + (pages * PAGE_SIZE) as u64;
            base
        };
        for page in 0..pages {
            self.ensure_page(base + (page * PAGE_SIZE) as u64);
        }
        Some(base)
    }

    /// Hand out a fresh virtual range with a guard page behind it, so
    /// separate reservations never look adjacent.
    fn bump_virtual(&mut self, size: usize, alignment: usize) -> u64 {
        let base = align_up(self.next_virtual as usize, alignment.max(PAGE_SIZE)) as u64;
        let span = align_up(size.max(1), PAGE_SIZE) + PAGE_SIZE;
        self.next_virtual = base + span as u64;
        base
    }

    fn translate(&self, address: u64) -> Option<u64> {
        self.page_table
            .get(&(address & !PAGE_MASK))
            .map(|physical_page| physical_page + (address & PAGE_MASK))
    }
}

/// In-memory implementation of the whole collaborator surface.
pub struct MockKernel {
    state: Mutex<MockState>,
}

impl Default for MockKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockKernel {
    pub fn new() -> Self {
        let mut state = MockState::default();
        state.next_physical = 0x100_0000;
        state.next_virtual = KERNEL_SPACE_START + 0x1000_0000;
        Self {
            state: Mutex::new(state),
        }
    }

    /// Queue the base addresses the next physical allocations return,
    /// one per allocation call, in order.
    pub fn script_physical_runs(&self, bases: &[u64]) {
        let mut state = self.state.lock();
        state.scripted_physical.extend(bases.iter().copied());
    }

    /// Allow only `calls` further successful physical allocation calls.
    pub fn limit_page_allocations(&self, calls: usize) {
        self.state.lock().page_allocation_limit = Some(calls);
    }

    /// Allow only `calls` further successful range reservations.
    pub fn limit_range_reservations(&self, calls: usize) {
        self.state.lock().reservation_limit = Some(calls);
    }

    /// Make every subsequent range release fail, for leak-path tests.
    pub fn fail_range_releases(&self) {
        self.state.lock().fail_range_release = true;
    }

    /// Create a page cache entry owning a fresh physical page. The
    /// entry starts with the cache's own reference.
    pub fn create_cache_entry(&self) -> CacheEntryId {
        let mut state = self.state.lock();
        let physical = state.next_physical;
        state.next_physical += PAGE_SIZE as u64;
        state.ensure_page(physical);
        state.cache_entries.push(MockCacheEntry {
            physical,
            published: None,
            references: 1,
            releases: 0,
        });
        CacheEntryId(state.cache_entries.len() as u64 - 1)
    }

    /// Map one user page at `address`, backing it with a fresh physical
    /// page. Returns the backing page.
    pub fn map_user_page(&self, address: VirtualAddress) -> PhysicalAddress {
        let mut state = self.state.lock();
        let physical = state.next_physical;
        state.next_physical += PAGE_SIZE as u64;
        state.ensure_page(physical);
        state
            .page_table
            .insert(address.as_u64() & !PAGE_MASK, physical);
        PhysicalAddress::new(physical)
    }

    /// Cover `[address, address + size)` with one image section whose
    /// pages are individually paged in. Each page gets scattered fresh
    /// backing, a mapping (so the memory accessor can reach it),
    /// optionally a page cache entry, and `retries` initial try-again
    /// responses. Returns the per-page cache entries, in page order.
    pub fn script_user_section(
        &self,
        address: VirtualAddress,
        size: usize,
        with_cache_entries: bool,
        retries: usize,
    ) -> Vec<CacheEntryId> {
        let page_count = pages_spanning(address.page_offset() + size);
        let section = {
            let mut state = self.state.lock();
            state.next_section += 1;
            state.next_section
        };
        let base = address.as_u64() & !PAGE_MASK;
        let mut entries = Vec::new();
        for page in 0..page_count {
            let cache_entry = if with_cache_entries {
                let entry = self.create_cache_entry();
                entries.push(entry);
                Some(entry)
            } else {
                None
            };
            let mut state = self.state.lock();
            let physical = match cache_entry {
                Some(entry) => state.cache_entries[entry.0 as usize].physical,
                None => {
                    let physical = state.next_physical;
                    state.next_physical += PAGE_SIZE as u64;
                    physical
                }
            };
            state.ensure_page(physical);
            // Leave a hole after each page so section pages never look
            // physically adjacent; fragment-shape tests depend on it.
            state.next_physical += PAGE_SIZE as u64;
            let page_va = base + (page * PAGE_SIZE) as u64;
            state.page_table.insert(page_va, physical);
            state.sections.insert(
                page_va,
                MockSectionPage {
                    section,
                    physical,
                    cache_entry,
                    retries_remaining: retries,
                },
            );
        }
        entries
    }

    pub fn entry_reference_count(&self, entry: CacheEntryId) -> u32 {
        self.state.lock().cache_entries[entry.0 as usize].references
    }

    pub fn entry_release_count(&self, entry: CacheEntryId) -> u32 {
        self.state.lock().cache_entries[entry.0 as usize].releases
    }

    pub fn entry_published(&self, entry: CacheEntryId) -> Option<VirtualAddress> {
        self.state.lock().cache_entries[entry.0 as usize]
            .published
            .map(VirtualAddress::new)
    }

    pub fn freed_pages(&self) -> Vec<u64> {
        self.state.lock().freed_pages.clone()
    }

    pub fn unlocked_pages(&self) -> Vec<u64> {
        self.state.lock().unlocked_pages.clone()
    }

    pub fn reserved_ranges(&self) -> Vec<(u64, usize)> {
        self.state.lock().reserved_ranges.clone()
    }

    pub fn released_ranges(&self) -> Vec<(u64, usize)> {
        self.state.lock().released_ranges.clone()
    }

    pub fn invalidate_broadcasts(&self) -> usize {
        self.state.lock().invalidate_broadcasts
    }

    pub fn pool_free_count(&self) -> usize {
        self.state.lock().pool_frees.len()
    }

    /// Outstanding lookups minus releases across all sections.
    pub fn section_reference_balance(&self) -> i64 {
        self.state.lock().section_references.values().sum()
    }
}

impl PoolAllocator for MockKernel {
    fn pool_allocate(&mut self, _pool: PoolType, size: usize) -> Option<VirtualAddress> {
        let mut state = self.state.lock();
        let pages = pages_spanning(size).max(1);
        let base = state.bump_virtual(pages * PAGE_SIZE, PAGE_SIZE);
        for page in 0..pages {
            let physical = state.next_physical;
            state.next_physical += PAGE_SIZE as u64;
            state.ensure_page(physical);
            state
                .page_table
                .insert(base + (page * PAGE_SIZE) as u64, physical);
        }
        state.pool_allocations.push(base);
        Some(VirtualAddress::new(base))
    }

    fn pool_free(&mut self, _pool: PoolType, address: VirtualAddress) {
        self.state.lock().pool_frees.push(address.as_u64());
    }
}

impl PageFrameAllocator for MockKernel {
    fn allocate_pages(&mut self, count: usize, alignment: usize) -> Option<PhysicalAddress> {
        self.state
            .lock()
            .allocate_physical_run(count, alignment)
            .map(PhysicalAddress::new)
    }

    fn free_page(&mut self, address: PhysicalAddress) {
        let mut state = self.state.lock();
        let page = address.as_u64() & !PAGE_MASK;
        state.memory.remove(&page);
        state.freed_pages.push(page);
    }

    fn unlock_pages(&mut self, address: PhysicalAddress, count: usize) {
        let mut state = self.state.lock();
        for page in 0..count {
            state
                .unlocked_pages
                .push((address.as_u64() & !PAGE_MASK) + (page * PAGE_SIZE) as u64);
        }
    }
}

impl VirtualRangeAllocator for MockKernel {
    fn reserve_range(&mut self, size: usize, alignment: usize) -> Result<VirtualAddress> {
        let mut state = self.state.lock();
        if let Some(limit) = state.reservation_limit {
            if limit == 0 {
                return Err(IoBufferError::InsufficientResources {
                    resource: "kernel virtual address space",
                });
            }
            state.reservation_limit = Some(limit - 1);
        }
        let base = state.bump_virtual(size, alignment);
        state.reserved_ranges.push((base, size));
        Ok(VirtualAddress::new(base))
    }

    fn release_range(
        &mut self,
        address: VirtualAddress,
        size: usize,
        flags: ReleaseFlags,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_range_release {
            return Err(IoBufferError::InsufficientResources {
                resource: "range teardown",
            });
        }
        if flags.contains(ReleaseFlags::SEND_INVALIDATE_IPI) {
            state.invalidate_broadcasts += 1;
        }
        let base = address.as_u64() & !PAGE_MASK;
        for page in 0..pages_spanning(size) {
            let page_va = base + (page * PAGE_SIZE) as u64;
            if let Some(physical) = state.page_table.remove(&page_va) {
                if flags.contains(ReleaseFlags::FREE_PHYSICAL_PAGES) {
                    state.memory.remove(&physical);
                    state.freed_pages.push(physical);
                }
            }
        }
        state.released_ranges.push((address.as_u64(), size));
        Ok(())
    }
}

impl PageMapper for MockKernel {
    fn map_page(
        &mut self,
        physical: PhysicalAddress,
        virtual_address: VirtualAddress,
        _flags: MapFlags,
    ) {
        let mut state = self.state.lock();
        let physical_page = physical.as_u64() & !PAGE_MASK;
        state.ensure_page(physical_page);
        state
            .page_table
            .insert(virtual_address.as_u64() & !PAGE_MASK, physical_page);
    }

    fn map_range(
        &mut self,
        address: VirtualAddress,
        size: usize,
        run_size: usize,
        _write_through: bool,
        _non_cached: bool,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let run_pages = run_size / PAGE_SIZE;
        let run_count = size / run_size;
        for run in 0..run_count {
            let base = state
                .allocate_physical_run(run_pages, run_size)
                .ok_or(IoBufferError::InsufficientResources {
                    resource: "physical pages",
                })?;
            for page in 0..run_pages {
                state.page_table.insert(
                    address.as_u64() + (run * run_size + page * PAGE_SIZE) as u64,
                    base + (page * PAGE_SIZE) as u64,
                );
            }
        }
        Ok(())
    }

    fn virtual_to_physical(&self, address: VirtualAddress) -> Option<PhysicalAddress> {
        self.state
            .lock()
            .translate(address.as_u64())
            .map(PhysicalAddress::new)
    }
}

impl PageCache for MockKernel {
    fn add_reference(&self, entry: CacheEntryId) {
        self.state.lock().cache_entries[entry.0 as usize].references += 1;
    }

    fn release_reference(&self, entry: CacheEntryId) {
        let mut state = self.state.lock();
        let entry = &mut state.cache_entries[entry.0 as usize];
        entry.references = entry.references.saturating_sub(1);
        entry.releases += 1;
    }

    fn entry_physical(&self, entry: CacheEntryId) -> PhysicalAddress {
        PhysicalAddress::new(self.state.lock().cache_entries[entry.0 as usize].physical)
    }

    fn entry_virtual(&self, entry: CacheEntryId) -> Option<VirtualAddress> {
        self.state.lock().cache_entries[entry.0 as usize]
            .published
            .map(VirtualAddress::new)
    }

    fn publish_virtual(&self, entry: CacheEntryId, address: VirtualAddress) {
        let mut state = self.state.lock();
        let entry = &mut state.cache_entries[entry.0 as usize];
        // First publication wins.
        if entry.published.is_none() {
            entry.published = Some(address.as_u64());
        }
    }
}

impl ImageSections for MockKernel {
    fn section_lookup(&mut self, address: VirtualAddress) -> Option<SectionId> {
        let mut state = self.state.lock();
        let page_va = address.as_u64() & !PAGE_MASK;
        let section = state.sections.get(&page_va)?.section;
        *state.section_references.entry(section).or_insert(0) += 1;
        Some(SectionId(section))
    }

    fn section_release(&mut self, section: SectionId) {
        let mut state = self.state.lock();
        *state.section_references.entry(section.0).or_insert(0) -= 1;
    }

    fn page_in(&mut self, section: SectionId, address: VirtualAddress) -> Result<PageInResult> {
        let mut state = self.state.lock();
        let page_va = address.as_u64() & !PAGE_MASK;
        let page = state
            .sections
            .get_mut(&page_va)
            .ok_or(IoBufferError::InvalidParameter {
                name: "page outside any section",
            })?;
        debug_assert_eq!(page.section, section.0);
        if page.retries_remaining > 0 {
            page.retries_remaining -= 1;
            return Err(IoBufferError::TryAgain);
        }
        let physical = page.physical;
        let cache_entry = page.cache_entry;
        if let Some(entry) = cache_entry {
            // The reference handed to the caller.
            state.cache_entries[entry.0 as usize].references += 1;
        }
        Ok(PageInResult {
            physical_address: PhysicalAddress::new(physical),
            cache_entry,
        })
    }
}

impl MemoryAccessor for MockKernel {
    fn read_memory(&self, source: VirtualAddress, destination: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        let mut address = source.as_u64();
        let mut position = 0usize;
        while position < destination.len() {
            let within = (address & PAGE_MASK) as usize;
            let chunk = (PAGE_SIZE - within).min(destination.len() - position);
            let physical = state
                .translate(address)
                .ok_or(IoBufferError::AccessViolation { address })?;
            let page = physical & !PAGE_MASK;
            match state.memory.get(&page) {
                Some(bytes) => destination[position..position + chunk]
                    .copy_from_slice(&bytes[within..within + chunk]),
                None => destination[position..position + chunk].fill(0),
            }
            position += chunk;
            address += chunk as u64;
        }
        Ok(())
    }

    fn write_memory(&self, destination: VirtualAddress, source: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let mut address = destination.as_u64();
        let mut position = 0usize;
        while position < source.len() {
            let within = (address & PAGE_MASK) as usize;
            let chunk = (PAGE_SIZE - within).min(source.len() - position);
            let physical = state
                .translate(address)
                .ok_or(IoBufferError::AccessViolation { address })?;
            let page = physical & !PAGE_MASK;
            state.ensure_page(page);
            if let Some(bytes) = state.memory.get_mut(&page) {
                bytes[within..within + chunk].copy_from_slice(&source[position..position + chunk]);
            }
            position += chunk;
            address += chunk as u64;
        }
        Ok(())
    }

    fn copy_memory(
        &self,
        destination: VirtualAddress,
        source: VirtualAddress,
        length: usize,
    ) -> Result<()> {
        let mut staged = alloc::vec![0u8; length];
        self.read_memory(source, &mut staged)?;
        self.write_memory(destination, &staged)
    }

    fn zero_memory(&self, destination: VirtualAddress, length: usize) -> Result<()> {
        let staged = alloc::vec![0u8; length];
        self.write_memory(destination, &staged)
    }

    fn copy_to_user(&self, destination: VirtualAddress, source: &[u8]) -> Result<()> {
        self.write_memory(destination, source)
    }

    fn copy_from_user(&self, destination: &mut [u8], source: VirtualAddress) -> Result<()> {
        self.read_memory(source, destination)
    }
}

impl KernelServices for MockKernel {
    fn data_cache_line_size(&self) -> usize {
        64
    }
}
