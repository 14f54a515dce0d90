//! Per-CPU descriptors and the global locks that serialize scheduler state
//! across them.
//!
//! Lock hierarchy (acquire in this order, release in reverse):
//! 1. `__proclist_lock` / `__proclist_lock2` (see `process::pid`)
//! 2. `cpu.__cpu_lock`
//! 3. `cpu.__cpu_sched_lock`
//! 4. `__thread_modifier`
//! 5. `__halted_modifier`
//! 6. `cpu.__ipi_lock`, `cpu.__message_clear_lock`
//!
//! The idle loop inside `scheduler::schedule` is the only place that
//! releases CPU locks and blocks (on an IPI); every other path that touches
//! scheduler state holds its locks for the duration of the operation.

pub mod ipi;

use crate::process::task::{Priority, ThreadId, PRIORITY_LEVELS};
use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use spin::Mutex;

pub const MAX_CPUS: usize = 32;

/// `__thread_modifier`: serializes any change to a thread's residency or
/// state across CPUs (enqueue, dequeue, priority change).
pub static THREAD_MODIFIER: Mutex<()> = Mutex::new(());
/// `__halted_modifier`: pins blocked/unblocked transitions.
pub static HALTED_MODIFIER: Mutex<()> = Mutex::new(());

/// Dedicated stacks and identity for one CPU. Set once during bring-up,
/// read-mostly afterward, so `cpu.__cpu_lock` guards it more for the
/// hierarchy's sake than real contention.
pub struct CpuMeta {
    pub apic_id: u32,
    pub online: bool,
    pub syscall_stack: u64,
    pub handler_stack: u64,
    pub page_fault_stack: u64,
    pub double_fault_stack: u64,
    pub ipi_stack: u64,
    pub current_address_space: u64,
}

impl CpuMeta {
    const fn empty() -> Self {
        Self {
            apic_id: 0,
            online: false,
            syscall_stack: 0,
            handler_stack: 0,
            page_fault_stack: 0,
            double_fault_stack: 0,
            ipi_stack: 0,
            current_address_space: 0,
        }
    }
}

/// The five per-priority FIFO run queues and the thread currently running.
pub struct CpuSchedState {
    pub queues: [VecDeque<ThreadId>; PRIORITY_LEVELS as usize],
    pub current: Option<ThreadId>,
}

impl CpuSchedState {
    const fn empty() -> Self {
        Self {
            queues: [
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ],
            current: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.is_empty())
    }
}

/// Single-slot IPI mailbox, matching the reference's `apic_message*` fields.
#[derive(Clone, Copy)]
pub struct IpiMailbox {
    pub message: u64,
    pub message2: u64,
    pub message3: u64,
    pub message_type: u32,
    pub sender_cpu: usize,
    pub handled: bool,
}

impl IpiMailbox {
    const fn empty() -> Self {
        Self { message: 0, message2: 0, message3: 0, message_type: 0, sender_cpu: 0, handled: true }
    }
}

pub struct Cpu {
    pub id: usize,
    pub meta: Mutex<CpuMeta>,
    pub sched: Mutex<CpuSchedState>,
    pub ipi: Mutex<IpiMailbox>,
    pub message_clear: Mutex<()>,
    /// Bumped by `enschedule` whenever it pushes work onto this CPU; the
    /// idle loop waits (outside any lock) for this to change instead of
    /// polling the queues directly.
    pub wake_gen: AtomicU64,
}

impl Cpu {
    const fn empty(id: usize) -> Self {
        Self {
            id,
            meta: Mutex::new(CpuMeta::empty()),
            sched: Mutex::new(CpuSchedState::empty()),
            ipi: Mutex::new(IpiMailbox::empty()),
            message_clear: Mutex::new(()),
            wake_gen: AtomicU64::new(0),
        }
    }

    pub fn bump_wake(&self) {
        self.wake_gen.fetch_add(1, AtomicOrdering::SeqCst);
    }

    pub fn wake_generation(&self) -> u64 {
        self.wake_gen.load(AtomicOrdering::SeqCst)
    }
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY: Cpu = Cpu::empty(0);
static CPUS: [Cpu; MAX_CPUS] = {
    let mut arr = [EMPTY; MAX_CPUS];
    let mut i = 0;
    while i < MAX_CPUS {
        arr[i] = Cpu::empty(i);
        i += 1;
    }
    arr
};

pub fn cpus() -> &'static [Cpu; MAX_CPUS] {
    &CPUS
}

pub fn cpu(id: usize) -> &'static Cpu {
    &CPUS[id]
}

pub fn num_cpus() -> usize {
    CPUS.iter().filter(|c| c.meta.lock().online).count()
}

pub fn is_cpu_online(id: usize) -> bool {
    id < MAX_CPUS && CPUS[id].meta.lock().online
}

pub fn mark_cpu_online(id: usize, apic_id: u32) {
    if id >= MAX_CPUS {
        crate::warn!("smp: cpu id {} exceeds MAX_CPUS", id);
        return;
    }
    let mut meta = CPUS[id].meta.lock();
    meta.apic_id = apic_id;
    meta.online = true;
    crate::info!("smp: cpu {} (apic {}) online", id, apic_id);
}

/// Index of the CPU executing this code, via GS-based per-CPU data.
pub fn current_cpu_id() -> usize {
    crate::arch::x86_64::percpu::current_cpu_id()
}

/// `enschedule`'s "pick any CPU with work, best-effort" helper: choose a
/// pseudo-random online CPU to nudge with a reschedule IPI.
pub fn attemp_to_run_scheduler(seed: &mut u32) {
    let online: alloc::vec::Vec<usize> = (0..MAX_CPUS).filter(|&i| is_cpu_online(i)).collect();
    if online.is_empty() {
        return;
    }
    let tries = online.len().min(MAX_CPUS);
    for _ in 0..tries {
        *seed = ((seed.wrapping_mul(214013).wrapping_add(2531011)) >> 16) & 0x7FFF;
        let pick = online[(*seed as usize) % online.len()];
        let c = cpu(pick);
        if let Some(sched) = c.sched.try_lock() {
            if !sched.is_empty() {
                drop(sched);
                ipi::send_reschedule_ipi(pick);
                return;
            }
        }
    }
}
