//! DiskArena: thread-safe, per-folder allocator that hands out one mmap'd
//! file per allocation.
//!
//! Each call to [`DiskArena::allocate`] creates a new file named `mem_<id>`
//! inside the arena's folder, extends it to the requested size, and maps it
//! into memory. The returned [`RegionHandle`] is a plain `{pointer, size}`
//! pair; the arena itself keeps the bookkeeping (file, mapping, id) behind
//! an index keyed by the mapping's base address, so `free` can find it from
//! the handle alone.
//!
//! Ids are recycled LIFO: freeing a region returns its id to a free list
//! that the next `allocate` drains before minting a new one. A failed
//! allocation does **not** recycle the id it was given, matching the
//! behavior of the C allocator this crate replaces.

mod error;
mod region;

pub use error::ArenaError;
pub use region::RegionHandle;

use idpool::IdPool;
use memmap2::MmapMut;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Outcome of [`DiskArena::free`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeStatus {
    /// The handle was null or did not match any region the arena tracks.
    Invalid,
    /// The region was flushed, unmapped, closed, and (if requested)
    /// unlinked.
    Ok,
    /// The region's index entry was removed but its final flush failed; the
    /// mapping and file descriptor are leaked rather than risk unmapping
    /// dirty pages that were never written back.
    MapError,
}

/// Bookkeeping the arena keeps for one live allocation. Dropping a
/// `RegionRecord` unmaps the file and closes its descriptor, in that order.
struct RegionRecord {
    file: File,
    id: u64,
    path: PathBuf,
    mmap: MmapMut,
}

/// A folder of file-backed allocations, each independently mmap'd.
///
/// `DiskArena` is `Send + Sync`: every field is behind a `parking_lot::Mutex`
/// and the three locks (id pool, region index) are never held across a
/// syscall any longer than necessary — in particular `free` drops the index
/// lock before the final flush so one slow unmap cannot stall concurrent
/// allocations.
pub struct DiskArena {
    folder: PathBuf,
    id_pool: Mutex<IdPool>,
    records: Mutex<HashMap<usize, RegionRecord>>,
}

impl DiskArena {
    /// Opens `folder` as an arena, creating it (mode `0700`) if it does not
    /// exist yet. Pre-existing `mem_*` files left over from a previous
    /// arena are not adopted; they are simply ignored until something
    /// overwrites or removes them.
    pub fn open(folder: impl AsRef<Path>) -> Result<Self, ArenaError> {
        let folder = folder.as_ref();
        if let Err(err) = fs::read_dir(folder) {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(ArenaError::Config(err));
            }
            fs::create_dir_all(folder).map_err(ArenaError::Config)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = fs::Permissions::from_mode(0o700);
                fs::set_permissions(folder, perms).map_err(ArenaError::Config)?;
            }
        }
        Ok(Self {
            folder: folder.to_path_buf(),
            id_pool: Mutex::new(IdPool::new()),
            records: Mutex::new(HashMap::new()),
        })
    }

    /// Bytes free on the filesystem backing the arena's folder, as reported
    /// by `statvfs`. Used by `allocate` as an upfront bound check so a
    /// request that can never succeed fails fast instead of leaving behind
    /// a partially-extended file.
    pub fn capacity(&self) -> Result<u64, ArenaError> {
        let stat = nix::sys::statvfs::statvfs(&self.folder)
            .map_err(|errno| ArenaError::Io(std::io::Error::from_raw_os_error(errno as i32)))?;
        Ok(stat.blocks_available() * stat.fragment_size())
    }

    /// Creates a `size`-byte file-backed region and maps it in. Returns the
    /// null handle ([`RegionHandle::null`]) on any failure — a zero `size`,
    /// a `capacity` query that fails or reports insufficient space, or an
    /// I/O error partway through create/extend/map. Every failure path logs
    /// the underlying cause at `warn` before collapsing it to null.
    pub fn allocate(&self, size: usize) -> RegionHandle {
        if size == 0 {
            return RegionHandle::null();
        }
        match self.capacity() {
            Ok(available) if (size as u64) <= available => {}
            Ok(available) => {
                log::warn!(
                    "diskarena: allocate({size}) exceeds available capacity ({available})"
                );
                return RegionHandle::null();
            }
            Err(err) => {
                log::warn!("diskarena: allocate({size}): capacity query failed: {err}");
                return RegionHandle::null();
            }
        }

        let id = self.id_pool.lock().acquire();
        match self.map_new_region(id, size) {
            Ok(handle) => handle,
            Err(err) => {
                // The id is deliberately not released back to the pool: a
                // failed allocation leaves no record an id was ever handed
                // out for, so recycling it here could hand the same id to
                // two unrelated regions if a retry raced with an unrelated
                // free.
                log::warn!("diskarena: allocate({size}) failed for id {id}: {err}");
                RegionHandle::null()
            }
        }
    }

    /// Like `allocate`, but zeroes the region before returning it and takes
    /// its size as a `count * elem_size` pair. The multiplication is
    /// unchecked — a `count * elem_size` overflow wraps rather than erroring,
    /// matching the C `calloc` this replaces.
    pub fn allocate_zeroed(&self, count: usize, elem_size: usize) -> RegionHandle {
        let size = count.wrapping_mul(elem_size);
        let handle = self.allocate(size);
        if !handle.is_null() {
            unsafe {
                std::ptr::write_bytes(handle.pointer(), 0, handle.size());
            }
        }
        handle
    }

    fn map_new_region(&self, id: u64, size: usize) -> Result<RegionHandle, ArenaError> {
        let path = self.folder.join(format!("mem_{id}"));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;
        // Extend to exactly `size` bytes by seeking to the last byte and
        // writing it, rather than `set_len`, so a filesystem that does not
        // support sparse files still gets a real size-byte extent.
        file.seek(SeekFrom::Start((size - 1) as u64))?;
        file.write_all(&[0u8])?;

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        // A synchronous flush here forces the mapping to actually be
        // backed before we hand the pointer out; an `EIO` on a full or
        // failing disk surfaces now instead of on first touch.
        mmap.flush()?;
        let pointer = mmap.as_mut_ptr();

        let record = RegionRecord {
            file,
            id,
            path,
            mmap,
        };
        self.records.lock().insert(pointer as usize, record);
        Ok(RegionHandle::new(pointer, size))
    }

    /// Flushes, unmaps, and closes the region behind `handle`, and returns
    /// its id to the pool. If `delete_file` is true the backing file is
    /// also unlinked; otherwise it is left in the arena's folder.
    ///
    /// Returns [`FreeStatus::Invalid`] for a null handle or one the arena
    /// does not recognize (already freed, or from a different arena).
    /// Returns [`FreeStatus::MapError`] if the final flush fails — in that
    /// case the mapping and file descriptor are intentionally leaked rather
    /// than unmapped, since we cannot tell which dirty pages never made it
    /// to disk.
    pub fn free(&self, handle: RegionHandle, delete_file: bool) -> FreeStatus {
        if handle.is_null() {
            return FreeStatus::Invalid;
        }
        let base = handle.pointer() as usize;
        // The index lock is held only long enough to remove the entry; the
        // flush/unmap/close/unlink below run without it so a slow free
        // cannot stall concurrent allocate/free calls on other regions.
        let record = match self.records.lock().remove(&base) {
            Some(record) => record,
            None => return FreeStatus::Invalid,
        };

        if let Err(err) = record.mmap.flush() {
            log::error!(
                "diskarena: free: final flush failed for mem_{}, leaking region: {err}",
                record.id
            );
            std::mem::forget(record);
            return FreeStatus::MapError;
        }

        let RegionRecord { file, id, path, mmap, .. } = record;
        drop(mmap);
        drop(file);
        if delete_file {
            if let Err(err) = fs::remove_file(&path) {
                log::warn!("diskarena: free: could not remove {}: {err}", path.display());
            }
        }
        self.id_pool.lock().release(id);
        FreeStatus::Ok
    }
}

impl Drop for DiskArena {
    /// Tears down every region still live when the arena is dropped: each
    /// gets flushed, unmapped, closed, and its file removed, all
    /// concurrently on a scoped-thread pool so N surviving regions cost one
    /// flush's worth of wall-clock time rather than N.
    ///
    /// Unlike `free`, teardown always removes the backing file — a region
    /// that outlives the arena without ever being explicitly freed has no
    /// way to ask to be kept.
    fn drop(&mut self) {
        let records: Vec<RegionRecord> = self.records.get_mut().drain().map(|(_, r)| r).collect();
        if records.is_empty() {
            return;
        }
        std::thread::scope(|scope| {
            for record in records {
                scope.spawn(move || {
                    if let Err(err) = record.mmap.flush() {
                        log::error!(
                            "diskarena: teardown: flush failed for mem_{}: {err}",
                            record.id
                        );
                    }
                    let RegionRecord { file, path, .. } = record;
                    drop(file);
                    if let Err(err) = fs::remove_file(&path) {
                        log::warn!(
                            "diskarena: teardown: could not remove {}: {err}",
                            path.display()
                        );
                    }
                });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn arena() -> (TempDir, DiskArena) {
        let dir = TempDir::new().unwrap();
        let arena = DiskArena::open(dir.path()).unwrap();
        (dir, arena)
    }

    #[test]
    fn allocate_creates_a_backing_file() {
        let (dir, arena) = arena();
        let handle = arena.allocate(128);
        assert!(!handle.is_null());
        assert_eq!(handle.size(), 128);
        assert!(dir.path().join("mem_0").exists());
    }

    #[test]
    fn zero_size_allocate_returns_null_without_touching_disk() {
        let (dir, arena) = arena();
        let handle = arena.allocate(0);
        assert!(handle.is_null());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn ids_are_recycled_lifo() {
        let (_dir, arena) = arena();
        let a = arena.allocate(64);
        let b = arena.allocate(64);
        assert_eq!(arena.free(a, true), FreeStatus::Ok);
        assert_eq!(arena.free(b, true), FreeStatus::Ok);
        // b (id 1) was freed last, so it is reused first.
        let c = arena.allocate(64);
        assert!(!c.is_null());
        assert!(arena.folder.join("mem_1").exists());
        assert!(!arena.folder.join("mem_0").exists());
    }

    #[test]
    fn capacity_rejected_allocation_consumes_no_id() {
        let (_dir, arena) = arena();
        // A request larger than the filesystem can possibly satisfy fails
        // the upfront capacity check before an id is ever acquired.
        let huge = arena.allocate(usize::MAX / 2);
        assert!(huge.is_null());
        let next = arena.allocate(64);
        assert!(!next.is_null());
        assert!(arena.folder.join("mem_0").exists());
    }

    #[test]
    #[cfg(unix)]
    fn failed_allocation_does_not_recycle_its_id() {
        use std::os::unix::fs::PermissionsExt;
        let (dir, arena) = arena();
        // Past the capacity check, strip write permission from the folder
        // so opening `mem_0` fails and `map_new_region` returns an error.
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o500)).unwrap();
        let failed = arena.allocate(64);
        assert!(failed.is_null());
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700)).unwrap();

        // id 0 was acquired and burned by the failed attempt; the next
        // successful allocation gets id 1, not 0.
        let ok = arena.allocate(64);
        assert!(!ok.is_null());
        assert!(dir.path().join("mem_1").exists());
        assert!(!dir.path().join("mem_0").exists());
    }

    #[test]
    fn allocate_zeroed_zeroes_the_region() {
        let (_dir, arena) = arena();
        let handle = arena.allocate_zeroed(64, 1);
        assert!(!handle.is_null());
        let bytes = unsafe { std::slice::from_raw_parts(handle.pointer(), handle.size()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn free_with_invalid_handle_reports_invalid() {
        let (_dir, arena) = arena();
        assert_eq!(arena.free(RegionHandle::null(), false), FreeStatus::Invalid);
        let handle = arena.allocate(32);
        assert_eq!(arena.free(handle, false), FreeStatus::Ok);
        // Freeing the same handle twice: the index no longer has it.
        assert_eq!(arena.free(handle, false), FreeStatus::Invalid);
    }

    #[test]
    fn free_without_delete_leaves_file_on_disk() {
        let (dir, arena) = arena();
        let handle = arena.allocate(32);
        assert_eq!(arena.free(handle, false), FreeStatus::Ok);
        assert!(dir.path().join("mem_0").exists());
    }

    #[test]
    fn write_flush_free_then_reopen_sees_the_bytes() {
        // Scenario S7: allocate, write a known prefix, flush synchronously,
        // free without deleting, then read the file back directly.
        let (dir, arena) = arena();
        let handle = arena.allocate_zeroed(1024, 1);
        assert!(!handle.is_null());
        let message = b"Hello World. ";
        unsafe {
            std::ptr::copy_nonoverlapping(message.as_ptr(), handle.pointer(), message.len());
        }
        assert!(handle.flush(true).is_ok());
        assert_eq!(arena.free(handle, false), FreeStatus::Ok);

        let contents = fs::read(dir.path().join("mem_0")).unwrap();
        assert_eq!(contents.len(), 1024);
        assert_eq!(&contents[..message.len()], message);
        assert!(contents[message.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn drop_tears_down_surviving_regions_and_removes_their_files() {
        let dir = TempDir::new().unwrap();
        {
            let arena = DiskArena::open(dir.path()).unwrap();
            arena.allocate(64);
            arena.allocate(128);
            // Neither region is freed; both are still live at drop.
        }
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn capacity_reports_a_positive_number() {
        let (_dir, arena) = arena();
        assert!(arena.capacity().unwrap() > 0);
    }

    #[test]
    fn concurrent_allocate_and_free_do_not_collide() {
        use std::sync::Arc;
        let dir = TempDir::new().unwrap();
        let arena = Arc::new(DiskArena::open(dir.path()).unwrap());
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let arena = Arc::clone(&arena);
                scope.spawn(move || {
                    let handle = arena.allocate(256);
                    assert!(!handle.is_null());
                    assert_eq!(arena.free(handle, true), FreeStatus::Ok);
                });
            }
        });
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
