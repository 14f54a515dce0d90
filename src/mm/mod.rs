/// Memory management subsystem
///
/// - Physical page metadata (`page`)
/// - Per-process virtual-address-hole allocator (`vm_hole`)
/// - Kernel stack arena and the page-table deallocation contract below

pub mod heap;
pub mod page;
pub mod vm_hole;

// Re-export commonly used items
pub use page::{
    pa_to_pfn, page_align_down, page_align_up, pfn_to_pa, Page, PageFlags, Pfn, PhysAddr,
    PAGE_SHIFT, PAGE_SIZE,
};

pub use vm_hole::{MapType, MemRegion, ProcRng, VaHoleList, MAX_VA, MIN_VA};

use core::sync::atomic::{AtomicUsize, Ordering};

const KERNEL_STACK_SIZE: usize = 2 * PAGE_SIZE;
const KSTACK_SLOTS: usize = 256;
const KSTACK_ARENA_SIZE: usize = KSTACK_SLOTS * KERNEL_STACK_SIZE;

#[repr(align(4096))]
struct KstackArena([u8; KSTACK_ARENA_SIZE]);

static mut KSTACK_ARENA: KstackArena = KstackArena([0; KSTACK_ARENA_SIZE]);
static KSTACK_NEXT: AtomicUsize = AtomicUsize::new(0);

/// Allocate a dedicated kernel stack for a new thread. Returns the initial
/// top-of-stack address (the value to load into `rsp`), or `None` once the
/// reserved arena is exhausted.
pub fn alloc_kernel_stack() -> Option<u64> {
    let slot = KSTACK_NEXT.fetch_add(1, Ordering::SeqCst);
    let offset = slot.checked_mul(KERNEL_STACK_SIZE)?;
    if offset + KERNEL_STACK_SIZE > KSTACK_ARENA_SIZE {
        return None;
    }
    let base = core::ptr::addr_of!(KSTACK_ARENA) as u64;
    Some(base + offset as u64 + KERNEL_STACK_SIZE as u64)
}

/// External contract: unmap `[start, start+len)` from the address space
/// rooted at `pml4`. The page-table editor that backs this is out of scope
/// for the process/scheduler core; `vm_hole` calls this contract and does
/// not concern itself with how it's implemented.
pub fn deallocate_region(pml4: u64, start: u64, len: u64) {
    let _ = (pml4, start, len);
}

static NEXT_PML4: AtomicUsize = AtomicUsize::new(1);

/// External contract: allocate a fresh, empty top-level page table and
/// return its physical root. The page-table editor that backs this is out
/// of scope here; process creation only calls the contract.
pub fn new_pml4() -> u64 {
    NEXT_PML4.fetch_add(1, Ordering::SeqCst) as u64
}

/// External contract: `clone_paging_structures` — duplicate `parent`'s page
/// tables for a forked child. COW semantics are the page-table editor's
/// concern; the process core only calls this and uses the returned root.
pub fn clone_paging_structures(parent_pml4: u64) -> u64 {
    let _ = parent_pml4;
    new_pml4()
}

/// External contract: tear down every mapping rooted at `pml4` and free the
/// table itself, called once a process's last thread has exited.
pub fn free_proc_memory(pml4: u64) {
    let _ = pml4;
}

/// External contract: `cpy_array_user` — copy a NUL-terminated array of
/// C-string pointers (argv or envp) into the address space rooted at `pml4`,
/// at `vastart` (a region already reserved via `VaHoleList::find_va_hole`),
/// and return the user-space pointer the new thread's `rsi`/`rdx` should
/// carry. The ELF loader/page-table editor's concern; process creation only
/// calls the contract and forwards the returned pointer.
pub fn copy_user_array(pml4: u64, vastart: u64, strings: &[alloc::string::String]) -> u64 {
    let _ = (pml4, strings);
    vastart
}
