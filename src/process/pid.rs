//! PID allocation and the global process table.
//!
//! Process creation is two-phase (`cp_stage_1`/`cp_stage_2` in `fork.rs`):
//! a freshly allocated process lives in the pending table, guarded by its
//! own lock, until its address space and first thread are fully set up,
//! then `promote` moves it into the main table. This keeps a half-built
//! process invisible to `wait4`/`kill`/scheduling.

use super::task::{Pid, Process, ProcId};
use crate::lib::error::{Errno, KernelError};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

const MAX_PIDS: usize = 32768;

static NEXT_PID: AtomicU32 = AtomicU32::new(2);

enum PidEntry {
    Free,
    Used(Box<Process>),
}

pub struct PidTable {
    entries: Vec<PidEntry>,
}

impl PidTable {
    pub fn new() -> Self {
        let mut entries = Vec::with_capacity(MAX_PIDS);
        for _ in 0..MAX_PIDS {
            entries.push(PidEntry::Free);
        }
        Self { entries }
    }

    pub fn insert(&mut self, proc: Process) -> Result<(), KernelError> {
        let pid = proc.proc_id as usize;
        if pid >= MAX_PIDS {
            return Err(KernelError::InvalidArgument);
        }
        self.entries[pid] = PidEntry::Used(Box::new(proc));
        Ok(())
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        match self.entries.get(pid as usize)? {
            PidEntry::Used(p) => Some(p),
            PidEntry::Free => None,
        }
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        match self.entries.get_mut(pid as usize)? {
            PidEntry::Used(p) => Some(p),
            PidEntry::Free => None,
        }
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Process> {
        let idx = pid as usize;
        if idx >= self.entries.len() {
            return None;
        }
        match core::mem::replace(&mut self.entries[idx], PidEntry::Free) {
            PidEntry::Used(p) => Some(*p),
            PidEntry::Free => None,
        }
    }

    pub fn find_children(&self, parent: Pid) -> Vec<Pid> {
        let mut out = Vec::new();
        for (idx, entry) in self.entries.iter().enumerate() {
            if let PidEntry::Used(p) = entry {
                if p.parent == parent {
                    out.push(idx as Pid);
                }
            }
        }
        out
    }

    /// Reparent every child of `dying` to init (PID 1).
    pub fn reparent_to_init(&mut self, dying: Pid) {
        for entry in self.entries.iter_mut() {
            if let PidEntry::Used(p) = entry {
                if p.parent == dying {
                    p.parent = 1;
                }
            }
        }
    }

    pub fn count(&self) -> usize {
        self.entries.iter().filter(|e| matches!(e, PidEntry::Used(_))).count()
    }
}

/// `__proclist_lock`: guards the main process table.
static PROCESS_TABLE: Mutex<Option<PidTable>> = Mutex::new(None);
/// `__proclist_lock2`: guards processes under construction, not yet visible
/// to the rest of the system.
static PENDING_TABLE: Mutex<BTreeMap<ProcId, Process>> = Mutex::new(BTreeMap::new());

pub fn init_process_table() {
    let mut table = PROCESS_TABLE.lock();
    *table = Some(PidTable::new());
    crate::info!("process table initialized (max {} pids)", MAX_PIDS);
}

pub fn get_process_table() -> spin::MutexGuard<'static, Option<PidTable>> {
    PROCESS_TABLE.lock()
}

/// The sole PID allocator. PID 1 is reserved for init and handed out by
/// `Process::new_init` directly, never through this counter.
pub fn alloc_pid() -> Result<Pid, KernelError> {
    let pid = NEXT_PID.fetch_add(1, Ordering::SeqCst);
    if pid as usize >= MAX_PIDS {
        return Err(KernelError::OutOfMemory);
    }
    Ok(pid)
}

/// Stage 1 of process creation: stash a half-built process where nothing
/// but `promote`/`drop_pending` can see it.
pub fn insert_pending(proc: Process) {
    PENDING_TABLE.lock().insert(proc.proc_id, proc);
}

pub fn with_pending_mut<R>(proc_id: ProcId, f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    let mut pending = PENDING_TABLE.lock();
    pending.get_mut(&proc_id).map(f)
}

/// Stage 2: move a finished process from the pending table into the main
/// table, making it visible to the rest of the kernel.
pub fn promote(proc_id: ProcId) -> Result<(), Errno> {
    let proc = PENDING_TABLE.lock().remove(&proc_id).ok_or(Errno::ESRCH)?;
    let mut table = PROCESS_TABLE.lock();
    let table = table.as_mut().ok_or(Errno::ESRCH)?;
    table.insert(proc).map_err(Errno::from)
}

/// Abandon a process that failed construction before it was promoted.
pub fn drop_pending(proc_id: ProcId) {
    PENDING_TABLE.lock().remove(&proc_id);
}

pub fn insert_task(proc: Process) -> Result<(), KernelError> {
    let mut table = PROCESS_TABLE.lock();
    match table.as_mut() {
        Some(tbl) => tbl.insert(proc),
        None => Err(KernelError::NotInitialized),
    }
}
