//! End-to-end scenarios for the buffer subsystem, run against the mock
//! collaborators.

#![cfg(test)]

use crate::addr::{PhysicalAddress, VirtualAddress, KERNEL_SPACE_START, PAGE_SIZE};
use crate::error::IoBufferError;
use crate::flags::{BufferFlags, MapFlags};
use crate::services::{IoVector, MemoryAccessor, PageCache, PageMapper};
use crate::testing::MockKernel;
use crate::{DmaConstraints, IoBuffer};

const NO_MIN: PhysicalAddress = PhysicalAddress(0);
const NO_MAX: PhysicalAddress = PhysicalAddress(u64::MAX);

fn allocate_non_paged(
    kernel: &mut MockKernel,
    size: usize,
    physically_contiguous: bool,
) -> IoBuffer {
    IoBuffer::allocate_non_paged(
        kernel,
        NO_MIN,
        NO_MAX,
        0,
        size,
        physically_contiguous,
        false,
        false,
    )
    .expect("allocation failed")
}

fn pattern(length: usize) -> Vec<u8> {
    (0..length).map(|index| (index % 251) as u8).collect()
}

#[test]
fn contiguous_allocation_and_free() {
    let mut kernel = MockKernel::new();
    let buffer = allocate_non_paged(&mut kernel, 16384, true);
    buffer.verify_invariants();

    assert_eq!(buffer.fragment_count(), 1);
    assert_eq!(buffer.total_size(), 16384);
    let expected = BufferFlags::MAPPED
        | BufferFlags::VIRTUALLY_CONTIGUOUS
        | BufferFlags::MEMORY_OWNED
        | BufferFlags::MEMORY_LOCKED;
    assert!(buffer.flags().contains(expected));
    assert!(buffer.flags().contains(BufferFlags::NON_PAGED));
    let fragment = buffer.fragments()[0];
    assert!(fragment.physical_address.is_some());
    assert!(fragment.virtual_address.is_some());

    buffer.free(&mut kernel);
    assert_eq!(kernel.freed_pages().len(), 4);
    // The one reserved range came back in one release.
    assert_eq!(kernel.reserved_ranges().len(), 1);
    assert_eq!(kernel.released_ranges().len(), 1);
    assert_eq!(kernel.released_ranges()[0].1, 16384);
    assert!(kernel.invalidate_broadcasts() >= 1);
}

#[test]
fn fragmented_allocation_sorts_and_coalesces() {
    let mut kernel = MockKernel::new();
    kernel.script_physical_runs(&[0x10_0000, 0x20_0000, 0x10_1000]);
    let buffer = allocate_non_paged(&mut kernel, 12288, false);
    buffer.verify_invariants();

    assert_eq!(buffer.fragment_count(), 2);
    let fragments = buffer.fragments();
    assert_eq!(
        fragments[0].physical_address,
        Some(PhysicalAddress::new(0x10_0000))
    );
    assert_eq!(fragments[0].size, 8192);
    assert_eq!(
        fragments[1].physical_address,
        Some(PhysicalAddress::new(0x20_0000))
    );
    assert_eq!(fragments[1].size, 4096);

    // One virtual range of 12KiB covers both fragments back to back.
    assert_eq!(kernel.reserved_ranges().len(), 1);
    assert_eq!(kernel.reserved_ranges()[0].1, 12288);
    assert_eq!(
        fragments[0].virtual_address.map(|va| va.offset(8192)),
        fragments[1].virtual_address
    );
    assert!(buffer
        .flags()
        .contains(BufferFlags::VIRTUALLY_CONTIGUOUS | BufferFlags::MEMORY_OWNED));

    buffer.free(&mut kernel);
    let mut freed = kernel.freed_pages();
    freed.sort_unstable();
    assert_eq!(freed, vec![0x10_0000, 0x10_1000, 0x20_0000]);
}

#[test]
fn user_vector_aggregation() {
    let vectors = [
        IoVector {
            address: VirtualAddress::new(0x1000),
            size: 100,
        },
        IoVector {
            address: VirtualAddress::new(0x1064),
            size: 200,
        },
        IoVector {
            address: VirtualAddress::new(0x2000),
            size: 0,
        },
        IoVector {
            address: VirtualAddress::new(0x3000),
            size: 50,
        },
    ];
    let buffer = IoBuffer::create_from_vector(&vectors).expect("vector aggregation failed");
    buffer.verify_invariants();

    assert_eq!(buffer.fragment_count(), 2);
    assert_eq!(
        buffer.fragments()[0].virtual_address,
        Some(VirtualAddress::new(0x1000))
    );
    assert_eq!(buffer.fragments()[0].size, 300);
    assert_eq!(
        buffer.fragments()[1].virtual_address,
        Some(VirtualAddress::new(0x3000))
    );
    assert_eq!(buffer.fragments()[1].size, 50);
    assert_eq!(buffer.total_size(), 350);
    assert_eq!(
        buffer.flags() & (BufferFlags::USER_MODE | BufferFlags::MAPPED),
        BufferFlags::USER_MODE | BufferFlags::MAPPED
    );
}

#[test]
fn lock_user_range_and_free_releases_every_reference() {
    let mut kernel = MockKernel::new();
    let user_ptr = VirtualAddress::new(0x4_0640);
    let entries = kernel.script_user_section(user_ptr, 5000, true, 0);
    assert_eq!(entries.len(), 2);

    let buffer = IoBuffer::create_from_range(&mut kernel, user_ptr, 5000, false, true, false)
        .expect("lock failed");
    buffer.verify_invariants();

    // The first fragment runs from the pointer to the page boundary;
    // the last ends exactly at user_ptr + 5000.
    let fragments = buffer.fragments();
    assert_eq!(fragments[0].virtual_address, Some(user_ptr));
    assert_eq!(fragments[0].size, PAGE_SIZE - user_ptr.page_offset());
    let last = fragments[fragments.len() - 1];
    assert_eq!(
        last.virtual_address.map(|va| va.offset(last.size as u64)),
        Some(user_ptr.offset(5000))
    );
    assert_eq!(buffer.total_size(), 5000);
    assert!(buffer.flags().contains(
        BufferFlags::USER_MODE
            | BufferFlags::MEMORY_LOCKED
            | BufferFlags::CACHE_BACKED
            | BufferFlags::MAPPED
    ));

    // Page-in handed one reference per page over to the buffer.
    for entry in &entries {
        assert_eq!(kernel.entry_reference_count(*entry), 2);
    }

    buffer.free(&mut kernel);
    for entry in &entries {
        assert_eq!(kernel.entry_release_count(*entry), 1);
        assert_eq!(kernel.entry_reference_count(*entry), 1);
    }
    assert!(kernel.unlocked_pages().is_empty());
    assert_eq!(kernel.section_reference_balance(), 0);
}

#[test]
fn lock_survives_transient_page_in_failures() {
    let mut kernel = MockKernel::new();
    let user_ptr = VirtualAddress::new(0x9_0000);
    kernel.script_user_section(user_ptr, 2 * PAGE_SIZE, true, 3);
    let buffer = IoBuffer::create_from_range(&mut kernel, user_ptr, 2 * PAGE_SIZE, false, true, false)
        .expect("retries should be absorbed");
    assert_eq!(buffer.total_size(), 2 * PAGE_SIZE);
    buffer.free(&mut kernel);
    assert_eq!(kernel.section_reference_balance(), 0);
}

#[test]
fn validate_for_dma_replaces_user_buffer() {
    let mut kernel = MockKernel::new();
    let vectors = [
        IoVector {
            address: VirtualAddress::new(0x1000),
            size: 0x1000,
        },
        IoVector {
            address: VirtualAddress::new(0x5000),
            size: 0x1000,
        },
    ];
    let mut buffer = IoBuffer::create_from_vector(&vectors).expect("vector aggregation failed");
    let constraints = DmaConstraints {
        physically_contiguous: true,
        ..DmaConstraints::default()
    };
    let displaced = buffer
        .validate_for_dma(&mut kernel, &constraints, 0x2000)
        .expect("validation failed")
        .expect("a user buffer must be replaced");

    // The original is untouched and still user mode; the replacement is
    // fresh non-paged memory meeting the constraints.
    assert!(displaced.flags().contains(BufferFlags::USER_MODE));
    assert_eq!(displaced.total_size(), 0x2000);
    assert_eq!(
        displaced.fragments()[0].virtual_address,
        Some(VirtualAddress::new(0x1000))
    );
    assert!(!buffer.flags().contains(BufferFlags::USER_MODE));
    assert!(buffer.flags().contains(
        BufferFlags::NON_PAGED | BufferFlags::MEMORY_OWNED | BufferFlags::VIRTUALLY_CONTIGUOUS
    ));
    assert_eq!(buffer.fragment_count(), 1);
    assert!(buffer.size_remaining() >= 0x2000);
    buffer.verify_invariants();

    buffer.free(&mut kernel);
    displaced.free(&mut kernel);
}

#[test]
fn append_cache_pages_then_free_releases_each_once() {
    let mut kernel = MockKernel::new();
    let mut buffer = IoBuffer::allocate_uninitialised(8192, true);
    let first = kernel.create_cache_entry();
    let second = kernel.create_cache_entry();

    buffer
        .append_page(&mut kernel, Some(first), None, None)
        .expect("append failed");
    buffer
        .append_page(&mut kernel, Some(second), None, None)
        .expect("append failed");
    buffer.verify_invariants();
    assert_eq!(buffer.total_size(), 8192);
    assert_eq!(kernel.entry_reference_count(first), 2);
    assert_eq!(kernel.entry_reference_count(second), 2);

    buffer.free(&mut kernel);
    assert_eq!(kernel.entry_release_count(first), 1);
    assert_eq!(kernel.entry_release_count(second), 1);
}

#[test]
fn linear_copy_round_trip() {
    let mut kernel = MockKernel::new();
    kernel.script_physical_runs(&[0x30_0000, 0x50_0000]);
    let mut buffer = allocate_non_paged(&mut kernel, 2 * PAGE_SIZE, false);
    assert_eq!(buffer.fragment_count(), 2);

    let data = pattern(2 * PAGE_SIZE);
    buffer.copy_in(&mut kernel, 0, &data).expect("copy in failed");
    let mut readback = vec![0u8; 2 * PAGE_SIZE];
    buffer
        .copy_out(&mut kernel, 0, &mut readback)
        .expect("copy out failed");
    assert_eq!(data, readback);

    // Zero a window spanning the fragment boundary and read it back.
    buffer
        .zero(&mut kernel, PAGE_SIZE - 100, 300)
        .expect("zero failed");
    buffer
        .copy_out(&mut kernel, 0, &mut readback)
        .expect("copy out failed");
    assert!(readback[PAGE_SIZE - 100..PAGE_SIZE + 200]
        .iter()
        .all(|byte| *byte == 0));
    assert_eq!(readback[..PAGE_SIZE - 100], data[..PAGE_SIZE - 100]);
    assert_eq!(readback[PAGE_SIZE + 200..], data[PAGE_SIZE + 200..]);

    buffer.free(&mut kernel);
}

#[test]
fn copy_between_buffers_fragment_by_fragment() {
    let mut kernel = MockKernel::new();
    kernel.script_physical_runs(&[0x30_0000, 0x60_0000, 0x40_0000]);
    let mut source = allocate_non_paged(&mut kernel, 3 * PAGE_SIZE, false);
    let mut destination = allocate_non_paged(&mut kernel, 3 * PAGE_SIZE, true);

    let data = pattern(3 * PAGE_SIZE);
    source.copy_in(&mut kernel, 0, &data).expect("copy in failed");

    destination
        .copy_from(&mut kernel, 100, &mut source, 50, 2 * PAGE_SIZE)
        .expect("copy between failed");
    let mut readback = vec![0u8; 2 * PAGE_SIZE];
    destination
        .copy_out(&mut kernel, 100, &mut readback)
        .expect("copy out failed");
    assert_eq!(readback, data[50..50 + 2 * PAGE_SIZE]);
}

#[test]
fn copy_honours_both_cursors() {
    let mut kernel = MockKernel::new();
    let mut source = allocate_non_paged(&mut kernel, PAGE_SIZE, true);
    let mut destination = allocate_non_paged(&mut kernel, PAGE_SIZE, true);

    let data = pattern(PAGE_SIZE);
    source.copy_in(&mut kernel, 0, &data).expect("copy in failed");
    source.increment_offset(128);
    destination.increment_offset(256);

    destination
        .copy_from(&mut kernel, 0, &mut source, 0, 512)
        .expect("copy failed");
    let mut readback = vec![0u8; 512];
    destination
        .copy_out(&mut kernel, 0, &mut readback)
        .expect("copy out failed");
    assert_eq!(readback, data[128..128 + 512]);

    source.decrement_offset(128);
    assert_eq!(source.current_offset(), 0);
}

#[test]
fn copy_into_user_buffer_goes_through_safe_copier() {
    let mut kernel = MockKernel::new();
    let user_base = VirtualAddress::new(0x7000);
    kernel.map_user_page(user_base);
    let vectors = [IoVector {
        address: user_base,
        size: 1024,
    }];
    let mut user_buffer = IoBuffer::create_from_vector(&vectors).expect("vector failed");
    let mut kernel_buffer = allocate_non_paged(&mut kernel, PAGE_SIZE, true);

    let data = pattern(1024);
    kernel_buffer
        .copy_in(&mut kernel, 0, &data)
        .expect("copy in failed");
    user_buffer
        .copy_from(&mut kernel, 0, &mut kernel_buffer, 0, 1024)
        .expect("copy to user failed");

    let mut readback = vec![0u8; 1024];
    kernel
        .read_memory(user_base, &mut readback)
        .expect("user readback failed");
    assert_eq!(readback, data);
}

#[test]
fn extendable_buffer_grows_under_copy() {
    let mut kernel = MockKernel::new();
    let mut buffer = IoBuffer::allocate_uninitialised(4 * PAGE_SIZE, false);
    assert_eq!(buffer.total_size(), 0);

    let data = pattern(3 * PAGE_SIZE);
    buffer.copy_in(&mut kernel, 0, &data).expect("copy in failed");
    assert_eq!(buffer.total_size(), 3 * PAGE_SIZE);
    assert!(buffer
        .flags()
        .contains(BufferFlags::MEMORY_OWNED | BufferFlags::MAPPED));
    buffer.verify_invariants();

    let mut readback = vec![0u8; 3 * PAGE_SIZE];
    buffer
        .copy_out(&mut kernel, 0, &mut readback)
        .expect("copy out failed");
    assert_eq!(readback, data);

    buffer.free(&mut kernel);
    assert_eq!(kernel.freed_pages().len(), 3);
}

#[test]
fn extension_failure_keeps_appended_pages() {
    let mut kernel = MockKernel::new();
    let mut buffer = IoBuffer::allocate_uninitialised(4 * PAGE_SIZE, false);
    kernel.limit_page_allocations(2);

    let error = buffer
        .extend(&mut kernel, NO_MIN, NO_MAX, 0, 4 * PAGE_SIZE, false)
        .expect_err("allocation limit should trip");
    assert!(matches!(error, IoBufferError::NoMemory { .. }));
    assert_eq!(buffer.total_size(), 2 * PAGE_SIZE);
    assert!(buffer.flags().contains(BufferFlags::MEMORY_OWNED));
    buffer.verify_invariants();

    buffer.free(&mut kernel);
    assert_eq!(kernel.freed_pages().len(), 2);
}

#[test]
fn extension_needs_fragment_slots() {
    let mut kernel = MockKernel::new();
    let mut buffer = IoBuffer::allocate_uninitialised(PAGE_SIZE, false);
    let error = buffer
        .extend(&mut kernel, NO_MIN, NO_MAX, 0, 2 * PAGE_SIZE, false)
        .expect_err("one slot cannot take two worst-case pages");
    assert!(matches!(error, IoBufferError::BufferTooSmall { .. }));
    assert_eq!(buffer.total_size(), 0);
}

#[test]
fn contiguous_extension_requires_cursor_at_end() {
    let mut kernel = MockKernel::new();
    let mut buffer = IoBuffer::allocate_uninitialised(4 * PAGE_SIZE, false);
    buffer
        .extend(&mut kernel, NO_MIN, NO_MAX, 0, PAGE_SIZE, false)
        .expect("first extension failed");

    // Cursor in the middle: contiguous growth cannot splice, so the
    // validation path must swap in a replacement instead of extending.
    let constraints = DmaConstraints {
        physically_contiguous: true,
        ..DmaConstraints::default()
    };
    let displaced = buffer
        .validate_for_dma(&mut kernel, &constraints, 2 * PAGE_SIZE)
        .expect("validation failed")
        .expect("mid-buffer contiguous growth must reallocate");
    assert_eq!(displaced.total_size(), PAGE_SIZE);
    displaced.free(&mut kernel);
    buffer.free(&mut kernel);
}

#[test]
fn validate_for_dma_extends_in_place_when_possible() {
    let mut kernel = MockKernel::new();
    let mut buffer = IoBuffer::allocate_uninitialised(4 * PAGE_SIZE, false);
    buffer
        .extend(&mut kernel, NO_MIN, NO_MAX, 0, PAGE_SIZE, false)
        .expect("extension failed");

    let displaced = buffer
        .validate_for_dma(&mut kernel, &DmaConstraints::default(), 3 * PAGE_SIZE)
        .expect("validation failed");
    assert!(displaced.is_none());
    assert_eq!(buffer.total_size(), 3 * PAGE_SIZE);
    buffer.free(&mut kernel);
}

#[test]
fn validate_for_dma_rejects_oversize_fixed_buffer() {
    let mut kernel = MockKernel::new();
    let mut buffer = allocate_non_paged(&mut kernel, PAGE_SIZE, true);
    let error = buffer
        .validate_for_dma(&mut kernel, &DmaConstraints::default(), 2 * PAGE_SIZE)
        .expect_err("fixed buffer cannot grow");
    assert!(matches!(error, IoBufferError::BufferTooSmall { .. }));
    buffer.free(&mut kernel);
}

#[test]
fn validate_for_cached_io_keeps_good_buffer_and_replaces_bad() {
    let kernel = MockKernel::new();

    let mut slot: Option<IoBuffer> = None;
    let displaced = IoBuffer::validate_for_cached_io(&kernel, &mut slot, 8192, 0);
    assert!(displaced.is_none());
    let replacement = slot.as_ref().expect("a buffer must be supplied");
    assert!(replacement
        .flags()
        .contains(BufferFlags::CACHE_BACKED | BufferFlags::EXTENDABLE));

    // A fresh cache-backed shell passes the checks and is kept.
    let displaced = IoBuffer::validate_for_cached_io(&kernel, &mut slot, 8192, 0);
    assert!(displaced.is_none());

    // A plain buffer is not suitable and gets swapped out.
    let mut kernel_mut = MockKernel::new();
    let plain = allocate_non_paged(&mut kernel_mut, PAGE_SIZE, true);
    let mut slot = Some(plain);
    let displaced = IoBuffer::validate_for_cached_io(&kernel_mut, &mut slot, PAGE_SIZE, 0)
        .expect("plain buffer must be displaced");
    displaced.free(&mut kernel_mut);
}

#[test]
fn map_publishes_cache_virtual_addresses_and_unmap_preserves_them() {
    let mut kernel = MockKernel::new();
    let mut buffer = IoBuffer::allocate_uninitialised(2 * PAGE_SIZE, true);
    let first = kernel.create_cache_entry();
    let second = kernel.create_cache_entry();
    buffer
        .append_page(&mut kernel, Some(first), None, None)
        .expect("append failed");
    buffer
        .append_page(&mut kernel, Some(second), None, None)
        .expect("append failed");
    assert!(kernel.entry_published(first).is_none());

    buffer
        .map(&mut kernel, false, false, false)
        .expect("map failed");
    let published = kernel
        .entry_published(first)
        .expect("mapping must publish the address");
    assert_eq!(buffer.fragments()[0].virtual_address, Some(published));
    assert_eq!(
        kernel.entry_published(second),
        Some(published.offset(PAGE_SIZE as u64))
    );

    // Unmapping preserves pages the cache now owns: no range release.
    buffer.unmap(&mut kernel);
    assert!(kernel.released_ranges().is_empty());
    assert!(!buffer.flags().contains(BufferFlags::MAPPED));
    assert_eq!(buffer.fragments()[0].virtual_address, Some(published));

    buffer.free(&mut kernel);
    assert_eq!(kernel.entry_release_count(first), 1);
    assert_eq!(kernel.entry_release_count(second), 1);
}

#[test]
fn map_contiguous_collapses_partial_mappings() {
    let mut kernel = MockKernel::new();
    kernel.script_physical_runs(&[0x30_0000, 0x60_0000]);
    let mut buffer = IoBuffer::allocate_uninitialised(2 * PAGE_SIZE, false);
    buffer
        .extend(&mut kernel, NO_MIN, NO_MAX, 0, 2 * PAGE_SIZE, false)
        .expect("extension failed");
    assert!(!buffer.flags().contains(BufferFlags::MAPPED));

    buffer
        .map(&mut kernel, false, false, true)
        .expect("map failed");
    assert!(buffer
        .flags()
        .contains(BufferFlags::MAPPED | BufferFlags::VIRTUALLY_CONTIGUOUS));
    buffer.verify_invariants();

    // Mapping again at either level is a no-op.
    let reserved = kernel.reserved_ranges().len();
    buffer
        .map(&mut kernel, false, false, false)
        .expect("map failed");
    buffer
        .map(&mut kernel, false, false, true)
        .expect("map failed");
    assert_eq!(kernel.reserved_ranges().len(), reserved);

    buffer.free(&mut kernel);
    assert_eq!(kernel.freed_pages().len(), 2);
}

#[test]
fn unmap_failure_is_demoted_to_a_leak() {
    let mut kernel = MockKernel::new();
    let buffer = allocate_non_paged(&mut kernel, PAGE_SIZE, true);
    let before = crate::stats::snapshot().virtual_bytes_leaked;
    kernel.fail_range_releases();
    buffer.free(&mut kernel);
    let after = crate::stats::snapshot().virtual_bytes_leaked;
    assert!(after >= before + PAGE_SIZE as u64);
}

#[test]
fn reset_allows_reuse_without_double_release() {
    let mut kernel = MockKernel::new();
    let mut buffer = IoBuffer::allocate_uninitialised(2 * PAGE_SIZE, true);
    let entry = kernel.create_cache_entry();
    buffer
        .append_page(&mut kernel, Some(entry), None, None)
        .expect("append failed");

    buffer.reset(&mut kernel);
    assert_eq!(kernel.entry_release_count(entry), 1);
    assert_eq!(buffer.total_size(), 0);
    assert_eq!(buffer.fragment_count(), 0);

    // The shell is reusable; freeing it releases nothing twice.
    let entry_two = kernel.create_cache_entry();
    buffer
        .append_page(&mut kernel, Some(entry_two), None, None)
        .expect("append failed");
    buffer.free(&mut kernel);
    assert_eq!(kernel.entry_release_count(entry), 1);
    assert_eq!(kernel.entry_release_count(entry_two), 1);
}

#[test]
fn set_cache_entry_adopts_described_page() {
    let mut kernel = MockKernel::new();
    let entry = kernel.create_cache_entry();
    let physical = kernel.entry_physical(entry);

    let mut buffer = IoBuffer::allocate_uninitialised(PAGE_SIZE, false);
    buffer
        .append_page(&mut kernel, None, None, Some(physical))
        .expect("append failed");
    buffer.set_cache_entry_at(&kernel, 0, entry);
    assert!(buffer.flags().contains(BufferFlags::CACHE_BACKED));
    assert_eq!(kernel.entry_reference_count(entry), 2);

    buffer.free(&mut kernel);
    assert_eq!(kernel.entry_release_count(entry), 1);
}

#[test]
fn paged_allocation_lifecycle() {
    let mut kernel = MockKernel::new();
    let mut buffer =
        IoBuffer::allocate_paged(&mut kernel, 6000).expect("paged allocation failed");
    assert_eq!(buffer.fragment_count(), 1);
    assert!(buffer
        .flags()
        .contains(BufferFlags::MAPPED | BufferFlags::VIRTUALLY_CONTIGUOUS));
    assert!(buffer.fragments()[0].physical_address.is_none());

    let data = pattern(6000);
    buffer.copy_in(&mut kernel, 0, &data).expect("copy in failed");
    let mut readback = vec![0u8; 6000];
    buffer
        .copy_out(&mut kernel, 0, &mut readback)
        .expect("copy out failed");
    assert_eq!(readback, data);

    buffer.free(&mut kernel);
    assert_eq!(kernel.pool_free_count(), 1);
}

#[test]
fn wrap_kernel_range_without_locking() {
    let mut kernel = MockKernel::new();
    let address = VirtualAddress::new(KERNEL_SPACE_START + 0x2_0100);
    let buffer = IoBuffer::create_from_range(&mut kernel, address, 3000, true, false, true)
        .expect("wrap failed");
    assert_eq!(buffer.fragment_count(), 1);
    assert_eq!(buffer.fragments()[0].virtual_address, Some(address));
    assert!(buffer.fragments()[0].physical_address.is_none());
    assert!(buffer
        .flags()
        .contains(BufferFlags::MAPPED | BufferFlags::VIRTUALLY_CONTIGUOUS));
    assert!(!buffer.flags().contains(BufferFlags::USER_MODE));
    buffer.free(&mut kernel);
}

#[test]
fn wrap_zero_length_range() {
    let mut kernel = MockKernel::new();
    let address = VirtualAddress::new(0x5_0000);
    let buffer = IoBuffer::create_from_range(&mut kernel, address, 0, false, true, false)
        .expect("zero wrap failed");
    assert_eq!(buffer.fragment_count(), 1);
    assert_eq!(buffer.fragments()[0].size, 0);
    assert_eq!(buffer.total_size(), 0);
    assert!(!buffer.flags().contains(BufferFlags::MEMORY_LOCKED));
    buffer.free(&mut kernel);
}

#[test]
fn boundary_violations_are_rejected() {
    let mut kernel = MockKernel::new();

    // User wrap reaching kernel space.
    let error = IoBuffer::create_from_range(
        &mut kernel,
        VirtualAddress::new(crate::addr::USER_SPACE_END - 0x100),
        0x200,
        false,
        false,
        false,
    )
    .expect_err("straddling range must be rejected");
    assert!(matches!(error, IoBufferError::AccessViolation { .. }));

    // Kernel wrap below the split.
    let error =
        IoBuffer::create_from_range(&mut kernel, VirtualAddress::new(0x1000), 16, false, false, true)
            .expect_err("user address in kernel wrap must be rejected");
    assert!(matches!(error, IoBufferError::AccessViolation { .. }));

    // Vector element targeting kernel memory.
    let vectors = [IoVector {
        address: VirtualAddress::new(KERNEL_SPACE_START),
        size: 64,
    }];
    let error = IoBuffer::create_from_vector(&vectors)
        .expect_err("kernel address in a user vector must be rejected");
    assert!(matches!(error, IoBufferError::AccessViolation { .. }));
}

#[test]
fn vector_count_limits() {
    let error = IoBuffer::create_from_vector(&[]).expect_err("empty vector must be rejected");
    assert!(matches!(error, IoBufferError::InvalidParameter { .. }));

    let oversized = vec![
        IoVector {
            address: VirtualAddress::new(0x1000),
            size: 1,
        };
        crate::MAX_VECTOR_COUNT + 1
    ];
    let error =
        IoBuffer::create_from_vector(&oversized).expect_err("oversized vector must be rejected");
    assert!(matches!(error, IoBufferError::InvalidParameter { .. }));
}

#[test]
fn all_zero_length_vector_yields_empty_buffer() {
    let vectors = [
        IoVector {
            address: VirtualAddress::new(0x1000),
            size: 0,
        },
        IoVector {
            address: VirtualAddress::new(0x2000),
            size: 0,
        },
    ];
    let buffer = IoBuffer::create_from_vector(&vectors).expect("vector failed");
    assert_eq!(buffer.fragment_count(), 0);
    assert_eq!(buffer.total_size(), 0);
    assert!(buffer.flags().contains(BufferFlags::USER_MODE));
}

#[test]
fn user_vector_array_is_copied_into_kernel_storage() {
    let mut kernel = MockKernel::new();
    let array_at = VirtualAddress::new(0x8000);
    kernel.map_user_page(array_at);

    let mut raw = Vec::new();
    for (address, size) in [(0x1000u64, 100u64), (0x1064, 200), (0x3000, 50)] {
        raw.extend_from_slice(&address.to_ne_bytes());
        raw.extend_from_slice(&size.to_ne_bytes());
    }
    kernel
        .write_memory(array_at, &raw)
        .expect("seeding user memory failed");

    let buffer = IoBuffer::create_from_user_vector(&mut kernel, array_at, 3)
        .expect("user vector aggregation failed");
    assert_eq!(buffer.fragment_count(), 2);
    assert_eq!(buffer.total_size(), 350);
}

#[test]
fn initialize_in_place_resolves_physical_address() {
    let mut kernel = MockKernel::new();
    let address = VirtualAddress::new(KERNEL_SPACE_START + 0x6000);
    let physical = PhysicalAddress::new(0x77_0000);
    kernel.map_page(physical, address, MapFlags::kernel(false, false));

    let mut descriptor = IoBuffer::allocate_uninitialised(0, false);
    IoBuffer::initialize_in_place(
        &mut descriptor,
        &kernel,
        Some(address),
        None,
        PAGE_SIZE,
        false,
        false,
    );
    assert!(descriptor.flags().contains(
        BufferFlags::STRUCTURE_NOT_OWNED
            | BufferFlags::MAPPED
            | BufferFlags::VIRTUALLY_CONTIGUOUS
    ));
    assert_eq!(descriptor.fragments()[0].physical_address, Some(physical));
    assert_eq!(descriptor.total_size(), PAGE_SIZE);
    assert_eq!(descriptor.physical_address_at(0x123), Some(physical.offset(0x123)));
}

#[test]
fn allocation_failures_leave_nothing_behind() {
    let mut kernel = MockKernel::new();

    // Physical allocation trips after one run; the run and the virtual
    // range both come back.
    kernel.limit_page_allocations(1);
    let error = IoBuffer::allocate_non_paged(
        &mut kernel,
        NO_MIN,
        NO_MAX,
        0,
        3 * PAGE_SIZE,
        false,
        false,
        false,
    )
    .expect_err("allocation limit should trip");
    assert!(matches!(error, IoBufferError::InsufficientResources { .. }));
    assert_eq!(kernel.freed_pages().len(), 1);
    assert_eq!(kernel.released_ranges().len(), 1);

    // Range reservation refused up front: nothing to clean up.
    let mut kernel = MockKernel::new();
    kernel.limit_range_reservations(0);
    let error = IoBuffer::allocate_non_paged(
        &mut kernel,
        NO_MIN,
        NO_MAX,
        0,
        PAGE_SIZE,
        true,
        false,
        false,
    )
    .expect_err("reservation limit should trip");
    assert!(matches!(error, IoBufferError::InsufficientResources { .. }));
    assert!(kernel.freed_pages().is_empty());
    assert!(kernel.released_ranges().is_empty());
}

#[test]
fn copy_walks_fail_cleanly_past_the_end() {
    let mut kernel = MockKernel::new();
    let mut buffer = allocate_non_paged(&mut kernel, PAGE_SIZE, true);

    let mut oversize = vec![0u8; 2 * PAGE_SIZE];
    let error = buffer
        .copy_out(&mut kernel, 0, &mut oversize)
        .expect_err("reading past the end must fail");
    assert!(matches!(error, IoBufferError::IncorrectBufferSize { .. }));

    let data = pattern(2 * PAGE_SIZE);
    let error = buffer
        .copy_in(&mut kernel, 0, &data)
        .expect_err("fixed buffer cannot grow under copy");
    assert!(matches!(error, IoBufferError::BufferTooSmall { .. }));
    buffer.free(&mut kernel);
}

#[test]
fn buffers_created_counter_moves() {
    let before = crate::stats::snapshot().buffers_created;
    let _buffer = IoBuffer::allocate_uninitialised(PAGE_SIZE, false);
    assert!(crate::stats::snapshot().buffers_created > before);
}
