//! Drives a `DiskArena` and a `PageAllocator` together: the arena provides
//! one large mmap'd region, and the page allocator carves it into
//! sub-allocations without ever touching the filesystem again.

use std::fs;

use diskarena::DiskArena;
use pagealloc::PageAllocator;

const ARENA_REGION_SIZE: usize = 64 * 1024;

fn main() {
    env_logger::init();

    let folder = std::env::temp_dir().join("region-demo-arena");
    let _ = fs::remove_dir_all(&folder);
    let arena = DiskArena::open(&folder).expect("open arena folder");

    let region = arena.allocate(ARENA_REGION_SIZE);
    assert!(!region.is_null(), "failed to carve the backing region");
    log::info!(
        "mapped {} bytes at {:p}",
        region.size(),
        region.pointer()
    );

    let mut pages = PageAllocator::new(region.pointer(), region.size());
    log::info!("page allocator ready: {}", pages.debug_dump());

    let a = pages.allocate(4096);
    let b = pages.allocate(1024);
    let c = pages.allocate(256);
    assert!(!a.is_null() && !b.is_null() && !c.is_null());

    unsafe {
        std::ptr::write_bytes(a, 0xAA, 4096);
        std::ptr::copy_nonoverlapping(b"hello from region-demo".as_ptr(), b, 22);
    }

    log::info!("after three allocations: {}", pages.debug_dump());
    log::info!("{} bytes still available", pages.available());

    // Freeing in reverse allocation order lets the forward-only coalesce
    // walk merge every step, leaving a single free node at the end.
    pages.free(c);
    pages.free(b);
    log::info!("after freeing the two most recent blocks: {}", pages.debug_dump());

    pages.free(a);
    log::info!("after freeing everything: {}", pages.debug_dump());
    assert_eq!(pages.free_node_count(), 1, "freeing in reverse order should coalesce to one node");

    region.flush(true).expect("flush region to disk");
    let status = arena.free(region, true);
    log::info!("arena.free returned {status:?}");

    let _ = fs::remove_dir_all(&folder);
}
