//! Kernel heap allocator backing `extern crate alloc`.
//!
//! A single static arena handed to `linked_list_allocator`, wrapped to track
//! allocation counters for `lib::panic`'s diagnostics and for `sys_dmesg`-style
//! introspection later.

use core::alloc::{GlobalAlloc, Layout};
use core::sync::atomic::{AtomicBool, Ordering};
use linked_list_allocator::LockedHeap;
use spin::Mutex;

const HEAP_SIZE: usize = 8 * 1024 * 1024;

#[repr(align(4096))]
struct HeapArena([u8; HEAP_SIZE]);

static mut HEAP_MEMORY: HeapArena = HeapArena([0; HEAP_SIZE]);
static ALLOCATOR: LockedHeap = LockedHeap::empty();
static HEAP_INIT_DONE: AtomicBool = AtomicBool::new(false);

pub struct HeapStats {
    total_allocations: usize,
    total_deallocations: usize,
    current_allocated: usize,
    peak_allocated: usize,
    allocation_failures: usize,
}

impl HeapStats {
    pub fn total_allocations(&self) -> usize {
        self.total_allocations
    }
    pub fn total_deallocations(&self) -> usize {
        self.total_deallocations
    }
    pub fn current_allocated(&self) -> usize {
        self.current_allocated
    }
    pub fn peak_allocated(&self) -> usize {
        self.peak_allocated
    }
    pub fn allocation_failures(&self) -> usize {
        self.allocation_failures
    }
}

static HEAP_STATS: Mutex<HeapStats> = Mutex::new(HeapStats {
    total_allocations: 0,
    total_deallocations: 0,
    current_allocated: 0,
    peak_allocated: 0,
    allocation_failures: 0,
});

/// Initialize the kernel heap. Idempotent; only the first call does anything.
pub fn init_heap() {
    if HEAP_INIT_DONE
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        unsafe {
            let arena_ptr = core::ptr::addr_of_mut!(HEAP_MEMORY) as *mut HeapArena;
            let heap_start = core::ptr::addr_of_mut!((*arena_ptr).0) as *mut u8;
            ALLOCATOR.lock().init(heap_start, HEAP_SIZE);
        }
        crate::info!("heap initialized: {} bytes", HEAP_SIZE);
    }
}

struct StatsTrackingAllocator;

unsafe impl GlobalAlloc for StatsTrackingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = ALLOCATOR.alloc(layout);
        let mut stats = HEAP_STATS.lock();
        if !ptr.is_null() {
            stats.total_allocations += 1;
            stats.current_allocated += layout.size();
            if stats.current_allocated > stats.peak_allocated {
                stats.peak_allocated = stats.current_allocated;
            }
        } else {
            stats.allocation_failures += 1;
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let mut stats = HEAP_STATS.lock();
        stats.total_deallocations += 1;
        stats.current_allocated = stats.current_allocated.saturating_sub(layout.size());
        drop(stats);
        ALLOCATOR.dealloc(ptr, layout);
    }
}

#[global_allocator]
static GLOBAL_ALLOC: StatsTrackingAllocator = StatsTrackingAllocator;

#[alloc_error_handler]
fn alloc_error_handler(layout: Layout) -> ! {
    crate::arch::x86_64::serial::serial_write(b"[HEAP] allocation error\n");
    let _ = layout;
    loop {
        unsafe { core::arch::asm!("hlt") };
    }
}

pub fn get_heap_stats() -> HeapStats {
    let stats = HEAP_STATS.lock();
    HeapStats {
        total_allocations: stats.total_allocations,
        total_deallocations: stats.total_deallocations,
        current_allocated: stats.current_allocated,
        peak_allocated: stats.peak_allocated,
        allocation_failures: stats.allocation_failures,
    }
}
