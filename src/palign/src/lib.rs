//! Page-aligned buffer arena for direct I/O.
//!
//! Direct I/O requires page-aligned buffers; the exerciser also wants
//! *deliberately misaligned* buffers (e.g. 4k-3b past the boundary) to push
//! drivers through their unaligned paths while the underlying allocation
//! stays valid for O_DIRECT. Every allocation is over-sized by one page plus
//! the requested offset and registered so it can be released by its aligned
//! address alone.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::warn;

static PAGE_SIZE: Lazy<usize> =
    Lazy::new(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize);

/// Host page size in bytes.
pub fn page_size() -> usize {
    *PAGE_SIZE
}

struct Registration {
    aligned: usize,
    raw: usize,
    layout: Layout,
}

#[derive(Default)]
struct Registry {
    entries: Mutex<Vec<Registration>>,
}

impl Registry {
    fn release(&self, aligned: usize) {
        let mut entries = self.entries.lock();
        match entries.iter().position(|e| e.aligned == aligned) {
            Some(at) => {
                let entry = entries.swap_remove(at);
                drop(entries);
                unsafe { dealloc(entry.raw as *mut u8, entry.layout) };
            }
            None => warn!("release of unregistered aligned buffer {aligned:#x}"),
        }
    }
}

/// Process-wide allocator of page-aligned (optionally offset) buffers.
#[derive(Clone, Default)]
pub struct Arena {
    registry: Arc<Registry>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `len` usable bytes starting `offset` bytes past a page
    /// boundary. The raw allocation spans `len + page_size + offset` bytes
    /// so the usable window is always in-bounds.
    pub fn alloc(&self, len: usize, offset: usize) -> AlignedBuf {
        let page = page_size();
        let raw_len = len + page + offset;
        let layout = Layout::from_size_align(raw_len, page)
            .expect("aligned buffer layout");
        let raw = unsafe { alloc_zeroed(layout) };
        let raw = NonNull::new(raw).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));

        let aligned = unsafe { raw.as_ptr().add(offset) };
        self.registry.entries.lock().push(Registration {
            aligned: aligned as usize,
            raw: raw.as_ptr() as usize,
            layout,
        });

        AlignedBuf {
            ptr: NonNull::new(aligned).unwrap(),
            len,
            registry: self.registry.clone(),
        }
    }

    /// Number of live registered allocations.
    pub fn live(&self) -> usize {
        self.registry.entries.lock().len()
    }
}

/// Owned window into a registered page allocation. Dropping the buffer
/// releases the raw allocation through the registry.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
    registry: Arc<Registry>,
}

// The buffer is an exclusive owner of its window; the registry is
// internally synchronised.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Offset of the window past the nearest page boundary at or below it.
    pub fn page_offset(&self) -> usize {
        self.ptr.as_ptr() as usize % page_size()
    }

    pub fn fill(&mut self, byte: u8) {
        self.as_mut_slice().fill(byte);
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        self.registry.release(self.ptr.as_ptr() as usize);
    }
}

impl std::fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("len", &self.len)
            .field("page_offset", &self.page_offset())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_at_page_boundary() {
        let arena = Arena::new();
        let buf = arena.alloc(8192, 0);
        assert_eq!(buf.page_offset(), 0);
        assert_eq!(buf.len(), 8192);
    }

    #[test]
    fn offset_past_boundary() {
        let arena = Arena::new();
        let off = page_size() - 3;
        let buf = arena.alloc(4096, off);
        assert_eq!(buf.page_offset(), off % page_size());
    }

    #[test]
    fn registry_tracks_and_releases() {
        let arena = Arena::new();
        let a = arena.alloc(512, 0);
        let b = arena.alloc(512, 8);
        assert_eq!(arena.live(), 2);
        drop(a);
        assert_eq!(arena.live(), 1);
        drop(b);
        assert_eq!(arena.live(), 0);
    }

    #[test]
    fn zeroed_and_writable() {
        let arena = Arena::new();
        let mut buf = arena.alloc(1024, 4);
        assert!(buf.iter().all(|&b| b == 0));
        buf.fill(0xA5);
        assert!(buf.iter().all(|&b| b == 0xA5));
    }

    #[test]
    fn buffers_survive_cross_thread_moves() {
        let arena = Arena::new();
        let mut buf = arena.alloc(4096, 0);
        std::thread::scope(|s| {
            s.spawn(move || {
                buf.fill(1);
                assert_eq!(buf[4095], 1);
            });
        });
        assert_eq!(arena.live(), 0);
    }
}
