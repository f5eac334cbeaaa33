//! Subsystem-wide counters.
//!
//! Cheap atomic counters in the style of the physical allocator's
//! statistics; useful for leak hunting from a debugger or a shell
//! command.

use core::sync::atomic::{AtomicU64, Ordering};

static BUFFERS_CREATED: AtomicU64 = AtomicU64::new(0);
static BUFFERS_FREED: AtomicU64 = AtomicU64::new(0);
static PAGES_FREED: AtomicU64 = AtomicU64::new(0);
static PAGES_UNLOCKED: AtomicU64 = AtomicU64::new(0);
static CACHE_REFERENCES_RELEASED: AtomicU64 = AtomicU64::new(0);
static VIRTUAL_BYTES_LEAKED: AtomicU64 = AtomicU64::new(0);

/// Point-in-time snapshot of the subsystem counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoBufferStats {
    pub buffers_created: u64,
    pub buffers_freed: u64,
    pub pages_freed: u64,
    pub pages_unlocked: u64,
    pub cache_references_released: u64,
    pub virtual_bytes_leaked: u64,
}

/// Read all counters.
pub fn snapshot() -> IoBufferStats {
    IoBufferStats {
        buffers_created: BUFFERS_CREATED.load(Ordering::Relaxed),
        buffers_freed: BUFFERS_FREED.load(Ordering::Relaxed),
        pages_freed: PAGES_FREED.load(Ordering::Relaxed),
        pages_unlocked: PAGES_UNLOCKED.load(Ordering::Relaxed),
        cache_references_released: CACHE_REFERENCES_RELEASED.load(Ordering::Relaxed),
        virtual_bytes_leaked: VIRTUAL_BYTES_LEAKED.load(Ordering::Relaxed),
    }
}

pub(crate) fn note_buffer_created() {
    BUFFERS_CREATED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn note_buffer_freed() {
    BUFFERS_FREED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn note_page_freed() {
    PAGES_FREED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn note_page_unlocked() {
    PAGES_UNLOCKED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn note_cache_reference_released() {
    CACHE_REFERENCES_RELEASED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn note_virtual_bytes_leaked(bytes: usize) {
    VIRTUAL_BYTES_LEAKED.fetch_add(bytes as u64, Ordering::Relaxed);
}
