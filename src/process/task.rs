//! Process and thread representation.
//!
//! A process owns one or more threads, a single address space and a single
//! ticket ledger; a thread owns a register snapshot, a priority and a
//! reference back to its process by id only (never by pointer) so the
//! whole table can be moved around as plain data.

use crate::lib::error::{Errno, KernelError};
use crate::mm::vm_hole::{ProcRng, VaHoleList};
use crate::process::ticket::TicketLedger;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

pub type Pid = u32;
pub type ProcId = u32;

/// Composite id for a thread: which process it belongs to plus its local
/// index within that process's thread table. Threads never hold a pointer
/// back to their process, only this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId {
    pub proc_id: ProcId,
    pub tid: u32,
}

impl ThreadId {
    pub const fn new(proc_id: ProcId, tid: u32) -> Self {
        Self { proc_id, tid }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Sleeping,
    Zombie,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Blocked,
    Halted,
}

/// Priority bands, 0 highest. Matches the five-level scheduler queues.
pub type Priority = u8;
pub const PRIORITY_LEVELS: u8 = 5;
pub const DEFAULT_PRIORITY: Priority = 2;

#[derive(Debug, Clone, Copy)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
}

impl Default for Credentials {
    fn default() -> Self {
        Self { uid: 0, gid: 0, euid: 0, egid: 0 }
    }
}

/// A deferred syscall resumption point. When a thread blocks mid-syscall
/// (futex wait, wait4) the scheduler stashes what to do on wakeup here
/// instead of unwinding the kernel stack.
#[derive(Debug, Clone, Copy)]
pub enum Continuation {
    None,
    ResumeFutexWait { uaddr: u64 },
    ResumeWait4 { target_pid: i32 },
}

/// Register snapshot taken on context switch / syscall entry. Round-tripping
/// through `copy_registers`/`registers_copy` must be lossless.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct RegisterFile {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

impl RegisterFile {
    pub const fn zeroed() -> Self {
        Self {
            rax: 0, rbx: 0, rcx: 0, rdx: 0, rsi: 0, rdi: 0, rbp: 0, rsp: 0,
            r8: 0, r9: 0, r10: 0, r11: 0, r12: 0, r13: 0, r14: 0, r15: 0,
            rip: 0, rflags: 0,
        }
    }
}

/// Copy the register state of `src` into `dst`. Exact inverse of `registers_copy`.
pub fn copy_registers(dst: &mut RegisterFile, src: &RegisterFile) {
    *dst = *src;
}

/// Returns a fresh copy of `src`, equivalent to `copy_registers` into a new value.
pub fn registers_copy(src: &RegisterFile) -> RegisterFile {
    *src
}

pub struct Thread {
    pub id: ThreadId,
    pub state: ThreadState,
    pub priority: Priority,
    pub blocked: bool,
    pub regs: RegisterFile,
    pub kstack: u64,
    pub continuation: Continuation,
    /// Last CPU this thread ran on, for affinity/load-balancing decisions.
    pub last_cpu: Option<usize>,
}

impl Thread {
    pub fn new(id: ThreadId, priority: Priority, kstack: u64) -> Self {
        Self {
            id,
            state: ThreadState::Ready,
            priority,
            blocked: false,
            regs: RegisterFile::zeroed(),
            kstack,
            continuation: Continuation::None,
            last_cpu: None,
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const SHARED = 1 << 3;
        const ANONYMOUS = 1 << 4;
        const COW = 1 << 5;
    }
}

/// File descriptor table, shared by all threads of a process.
pub struct FileTable {
    pub fds: Vec<Option<Arc<()>>>,
}

impl FileTable {
    pub fn new() -> Self {
        let mut fds = Vec::with_capacity(256);
        fds.resize_with(256, || None);
        Self { fds }
    }

    pub fn alloc_fd(&mut self, file: Arc<()>) -> Result<i32, Errno> {
        for (i, slot) in self.fds.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return Ok(i as i32);
            }
        }
        Err(Errno::EMFILE)
    }

    pub fn get(&self, fd: i32) -> Result<Arc<()>, Errno> {
        if fd < 0 || fd as usize >= self.fds.len() {
            return Err(Errno::EBADF);
        }
        self.fds[fd as usize].clone().ok_or(Errno::EBADF)
    }

    pub fn close(&mut self, fd: i32) -> Result<(), Errno> {
        if fd < 0 || fd as usize >= self.fds.len() || self.fds[fd as usize].is_none() {
            return Err(Errno::EBADF);
        }
        self.fds[fd as usize] = None;
        Ok(())
    }

    /// Deep-copy every open descriptor into a brand new table. Used by fork:
    /// the copy must land on the child's table, never be pushed back onto
    /// the parent's.
    pub fn deep_copy(&self) -> Self {
        Self { fds: self.fds.clone() }
    }
}

impl core::fmt::Debug for FileTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let open: Vec<i32> = self.fds.iter().enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i as i32))
            .collect();
        f.debug_struct("FileTable").field("open_fds", &open).finish()
    }
}

/// A single mapped region of the process's address space, owned by the
/// VA-hole allocator.
#[derive(Debug, Clone)]
pub struct MemMap {
    pub start: u64,
    pub end: u64,
    pub flags: VmaFlags,
}

pub struct Process {
    pub proc_id: ProcId,
    /// Parent's `proc_id`. Weak by construction: nothing stops the parent
    /// from exiting first, at which point `wait::do_exit` reparents this
    /// process to init (pid 1).
    pub parent: ProcId,
    /// Privileged flag, grants elevated priority classes and `cp_stage_1`
    /// privilege inheritance to children.
    pub pprocess: bool,
    /// Priority class `{0..4}`; the default for new threads and the floor
    /// `create_process_base` checks against to block priority elevation.
    pub priority: Priority,
    pub pml4: u64,
    pub threads: Vec<Thread>,
    pub next_tid: u32,
    pub state: ProcessState,
    pub exit_code: i32,
    pub fds: FileTable,
    pub cred: Credentials,
    pub name: String,
    pub children: Vec<ProcId>,
    pub cwd: String,
    /// ASLR/stack-placement PRNG, seeded once at process creation; the
    /// generator `mem_maps.find_va_hole` draws on to randomize region bases.
    pub mm_rng: ProcRng,
    pub mem_maps: VaHoleList,
    pub tickets: TicketLedger,
    pub futexes: Mutex<BTreeMap<u64, Vec<ThreadId>>>,
    pub ob_lock: Mutex<()>,
    /// Child processes created via `cp_stage_1` that haven't yet committed
    /// (or failed) through `cp_stage_2`.
    pub temp_processes: Vec<ProcId>,
}

pub const PER_PROCESS_TICKETS: u32 = 1000;

impl Process {
    pub fn new(proc_id: ProcId, parent: ProcId, name: String, seed: u32) -> Self {
        Self {
            proc_id,
            parent,
            pprocess: false,
            priority: DEFAULT_PRIORITY,
            pml4: 0,
            threads: Vec::new(),
            next_tid: 0,
            state: ProcessState::Running,
            exit_code: 0,
            fds: FileTable::new(),
            cred: Credentials::default(),
            name,
            children: Vec::new(),
            cwd: String::from("/"),
            mm_rng: ProcRng::new(seed),
            mem_maps: VaHoleList::new(),
            tickets: TicketLedger::new(PER_PROCESS_TICKETS),
            futexes: Mutex::new(BTreeMap::new()),
            ob_lock: Mutex::new(()),
            temp_processes: Vec::new(),
        }
    }

    pub fn alloc_tid(&mut self) -> u32 {
        let tid = self.next_tid;
        self.next_tid += 1;
        tid
    }

    pub fn add_thread(&mut self, priority: Priority, kstack: u64) -> ThreadId {
        let tid = self.alloc_tid();
        let id = ThreadId::new(self.proc_id, tid);
        self.threads.push(Thread::new(id, priority, kstack));
        id
    }

    pub fn thread_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.threads.iter_mut().find(|t| t.id == id)
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.iter().find(|t| t.id == id)
    }

    pub fn is_zombie(&self) -> bool {
        self.state == ProcessState::Zombie
    }

    pub fn exit(&mut self, code: i32) {
        self.state = ProcessState::Zombie;
        self.exit_code = code;
    }

    fn alloc_kstack() -> Result<u64, KernelError> {
        crate::mm::alloc_kernel_stack().ok_or(KernelError::OutOfMemory)
    }

    /// Create the init process (PID 1), with a single thread at default priority.
    pub fn new_init(seed: u32) -> Result<Self, KernelError> {
        let mut p = Self::new(1, 0, String::from("init"), seed);
        p.pprocess = true;
        let kstack = Self::alloc_kstack()?;
        p.add_thread(DEFAULT_PRIORITY, kstack);
        Ok(p)
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("proc_id", &self.proc_id)
            .field("parent", &self.parent)
            .field("state", &self.state)
            .field("name", &self.name)
            .field("threads", &self.threads.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_roundtrip_is_lossless() {
        let mut src = RegisterFile::zeroed();
        src.rax = 42;
        src.rip = 0xdead_beef;
        let copy = registers_copy(&src);
        let mut dst = RegisterFile::zeroed();
        copy_registers(&mut dst, &copy);
        assert_eq!(dst.rax, 42);
        assert_eq!(dst.rip, 0xdead_beef);
    }

    #[test]
    fn thread_id_within_process_increments() {
        let mut p = Process::new(7, 1, String::from("t"), 1);
        let a = p.add_thread(DEFAULT_PRIORITY, 0x1000);
        let b = p.add_thread(DEFAULT_PRIORITY, 0x2000);
        assert_eq!(a.proc_id, 7);
        assert_eq!(b.proc_id, 7);
        assert_ne!(a.tid, b.tid);
    }
}
