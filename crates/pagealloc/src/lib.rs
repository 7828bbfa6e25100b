//! First-fit, free-list allocator over a single contiguous byte range.
//!
//! `PageAllocator` is handed a `(base, capacity)` pair at construction and
//! never allocates or frees that range itself — the caller (typically the
//! bytes behind a `diskarena::RegionHandle`) owns it and must keep it alive
//! for as long as the allocator is used. Free spans are tracked as a
//! singly-linked list threaded directly through the free bytes themselves;
//! live blocks carry a small header stamped with [`MAGIC`] so that `free`
//! can detect a caller passing back a pointer it never handed out.
//!
//! The type itself is not internally synchronized — see [`SharedPageAllocator`]
//! for a `Mutex`-wrapped version safe to share across threads.

use std::fmt::Write as _;
use std::mem;
use std::ptr;

use parking_lot::Mutex;

/// Stamped into every live block's header; a mismatch on free means the
/// caller handed back a pointer this allocator never produced.
pub const MAGIC: u32 = 0xDEAD_BEEF;

#[repr(C)]
struct FreeNode {
    size: usize,
    next: *mut FreeNode,
}

#[repr(C)]
struct LiveHeader {
    size: usize,
    magic: u32,
}

const FREE_NODE_SIZE: usize = mem::size_of::<FreeNode>();
const LIVE_HEADER_SIZE: usize = mem::size_of::<LiveHeader>();

/// Free-list allocator over `[base, base + capacity)`.
///
/// # Safety
/// `base` must be valid for reads and writes for `capacity` bytes for the
/// entire lifetime of the allocator, and must not be accessed through any
/// other alias while this allocator is live.
pub struct PageAllocator {
    base: *mut u8,
    capacity: usize,
    head: *mut FreeNode,
}

// The allocator only ever touches the memory the caller handed it; moving
// it across threads is fine as long as access is externally synchronized
// (see `SharedPageAllocator`).
unsafe impl Send for PageAllocator {}

impl PageAllocator {
    /// Builds a new allocator over `[base, base + capacity)`, initializing
    /// a single free node spanning the whole range.
    pub fn new(base: *mut u8, capacity: usize) -> Self {
        let mut allocator = Self {
            base,
            capacity,
            head: ptr::null_mut(),
        };
        allocator.reset();
        allocator
    }

    /// Rewinds to the initial single-free-node state. Callers must ensure
    /// no live handles are outstanding before calling this.
    pub fn reset(&mut self) {
        let node = self.base as *mut FreeNode;
        unsafe {
            (*node).size = self.capacity - FREE_NODE_SIZE;
            (*node).next = ptr::null_mut();
        }
        self.head = node;
    }

    /// Sum of `size` across every node currently on the free list.
    pub fn available(&self) -> usize {
        let mut total = 0;
        let mut cur = self.head;
        unsafe {
            while !cur.is_null() {
                total += (*cur).size;
                cur = (*cur).next;
            }
        }
        total
    }

    /// Length of the free list starting at `head`.
    pub fn free_node_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.head;
        unsafe {
            while !cur.is_null() {
                count += 1;
                cur = (*cur).next;
            }
        }
        count
    }

    /// First-fit allocation of at least `size` payload bytes. Returns null
    /// if no free node is large enough.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        let (found, prev) = unsafe { self.find_free(size) };
        if found.is_null() {
            log::debug!("pagealloc: no free block for {size} bytes (heap exhausted)");
            return ptr::null_mut();
        }
        unsafe { self.split(size, found, prev) }
    }

    /// Walks the free list for the first node satisfying
    /// `node.size + sizeof(node) >= size + sizeof(live header)`.
    /// Returns `(node, predecessor)`; predecessor is null when `node == head`.
    unsafe fn find_free(&self, size: usize) -> (*mut FreeNode, *mut FreeNode) {
        let mut prev: *mut FreeNode = ptr::null_mut();
        let mut cur = self.head;
        while !cur.is_null() {
            if (*cur).size + FREE_NODE_SIZE >= size + LIVE_HEADER_SIZE {
                return (cur, prev);
            }
            prev = cur;
            cur = (*cur).next;
        }
        (ptr::null_mut(), ptr::null_mut())
    }

    /// Splits `found` to carve out `size` bytes, or absorbs the whole node
    /// into the live block when the remainder is too small to host a free
    /// node header. Returns the pointer handed back to the caller.
    unsafe fn split(&mut self, size: usize, found: *mut FreeNode, prev: *mut FreeNode) -> *mut u8 {
        let old_size = (*found).size;
        let old_next = (*found).next;
        let live = found as *mut LiveHeader;

        if old_size >= size + LIVE_HEADER_SIZE {
            let new_free = (found as *mut u8).add(LIVE_HEADER_SIZE + size) as *mut FreeNode;
            (*new_free).size = old_size - LIVE_HEADER_SIZE - size;
            (*new_free).next = old_next;
            self.relink(prev, new_free);
            (*live).size = size;
        } else {
            // Remainder too small for a free node: the caller gets it all.
            self.relink(prev, old_next);
            (*live).size = old_size + FREE_NODE_SIZE - LIVE_HEADER_SIZE;
        }
        (*live).magic = MAGIC;
        (live as *mut u8).add(LIVE_HEADER_SIZE)
    }

    unsafe fn relink(&mut self, prev: *mut FreeNode, new_next: *mut FreeNode) {
        if prev.is_null() {
            self.head = new_next;
        } else {
            (*prev).next = new_next;
        }
    }

    /// Returns a block to the free list, inserting at `head`, then
    /// coalesces forward from the new head.
    ///
    /// # Panics
    /// Panics if the header immediately preceding `ptr` does not carry
    /// [`MAGIC`] — this indicates a caller bug (double free, foreign
    /// pointer, or buffer overrun) and is not recoverable.
    pub fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        unsafe {
            let live = ptr.sub(LIVE_HEADER_SIZE) as *mut LiveHeader;
            assert_eq!(
                (*live).magic,
                MAGIC,
                "pagealloc: corrupt header (magic mismatch) at {ptr:p}"
            );
            let node = live as *mut FreeNode;
            let size = (*live).size + LIVE_HEADER_SIZE - FREE_NODE_SIZE;
            (*node).size = size;
            (*node).next = self.head;
            self.head = node;
            self.coalesce(self.head);
        }
    }

    /// Merges each free node forward into the next one while they are
    /// physically adjacent. This only merges runs reachable forward from
    /// `start` — it does not reorder the list or look backward.
    unsafe fn coalesce(&mut self, start: *mut FreeNode) {
        let mut h = start;
        while !h.is_null() {
            loop {
                let next = (*h).next;
                if next.is_null() {
                    break;
                }
                let physically_adjacent = (h as *mut u8).add(FREE_NODE_SIZE + (*h).size) as *mut FreeNode;
                if next != physically_adjacent {
                    break;
                }
                (*h).size += FREE_NODE_SIZE + (*next).size;
                (*h).next = (*next).next;
            }
            h = (*h).next;
        }
    }

    /// Renders the free list as `Free(n)->Free(m)->...` for debugging.
    pub fn debug_dump(&self) -> String {
        let mut out = String::new();
        let mut cur = self.head;
        unsafe {
            while !cur.is_null() {
                write!(out, "Free({})", (*cur).size).unwrap();
                cur = (*cur).next;
                if !cur.is_null() {
                    out.push_str("->");
                }
            }
        }
        out
    }
}

/// A [`PageAllocator`] behind a single lock, safe to share across threads.
/// Every public operation takes the lock for its whole duration, matching
/// the "single mutual-exclusion primitive covering every public operation"
/// discipline the base type leaves to its caller.
pub struct SharedPageAllocator(Mutex<PageAllocator>);

impl SharedPageAllocator {
    pub fn new(base: *mut u8, capacity: usize) -> Self {
        Self(Mutex::new(PageAllocator::new(base, capacity)))
    }

    pub fn allocate(&self, size: usize) -> *mut u8 {
        self.0.lock().allocate(size)
    }

    pub fn free(&self, ptr: *mut u8) {
        self.0.lock().free(ptr)
    }

    pub fn available(&self) -> usize {
        self.0.lock().available()
    }

    pub fn free_node_count(&self) -> usize {
        self.0.lock().free_node_count()
    }

    pub fn reset(&self) {
        self.0.lock().reset()
    }
}
