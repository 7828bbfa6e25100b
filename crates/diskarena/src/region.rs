use std::ptr;

use crate::error::ArenaError;

/// Immutable `{pointer, size}` descriptor for a region handed out by
/// [`crate::DiskArena`]. A default-constructed handle is the null sentinel
/// (`pointer` null, `size` zero) and is what every failed `allocate`
/// returns.
///
/// `RegionHandle` does not own the mapping behind it — the owning
/// `DiskArena` does, via its `RegionRecord` index — it is a plain
/// caller-facing value, `Copy` like a pointer/length pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionHandle {
    pointer: *mut u8,
    size: usize,
}

// A `RegionHandle` is inert data describing memory the owning `DiskArena`
// keeps valid; passing copies between threads carries no more risk than
// passing the arena itself, which is `Send + Sync`.
unsafe impl Send for RegionHandle {}
unsafe impl Sync for RegionHandle {}

impl RegionHandle {
    pub(crate) fn new(pointer: *mut u8, size: usize) -> Self {
        Self { pointer, size }
    }

    /// The null sentinel returned for any failed allocation.
    pub fn null() -> Self {
        Self {
            pointer: ptr::null_mut(),
            size: 0,
        }
    }

    pub fn pointer(&self) -> *mut u8 {
        self.pointer
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_null(&self) -> bool {
        self.pointer.is_null()
    }

    /// Requests the OS write dirty pages in `[pointer, pointer + size)` to
    /// the backing file. `wait = true` blocks until the write completes
    /// (`MS_SYNC`); `wait = false` initiates the write and returns
    /// immediately (`MS_ASYNC`).
    pub fn flush(&self, wait: bool) -> Result<(), ArenaError> {
        if self.is_null() {
            return Ok(());
        }
        let flags = if wait { libc::MS_SYNC } else { libc::MS_ASYNC };
        let rc = unsafe { libc::msync(self.pointer as *mut libc::c_void, self.size, flags) };
        if rc != 0 {
            return Err(ArenaError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Default for RegionHandle {
    fn default() -> Self {
        Self::null()
    }
}
