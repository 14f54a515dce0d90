//! Process and thread model: creation, scheduling, blocking syscalls.
//!
//! `task` holds the `Process`/`Thread` types; `pid` owns the global process
//! table; `scheduler` is the per-CPU run-queue core; `fork` covers process
//! creation (`fork_process`, the two-phase `cp_stage_1`/`cp_stage_2`,
//! `sys_execve`); `wait` covers `wait4`/exit; `futex` covers futex
//! wait/wake; `ticket` is the lottery-scheduling credit ledger.

pub mod fork;
pub mod futex;
pub mod pid;
pub mod scheduler;
pub mod task;
pub mod ticket;
pub mod wait;

use crate::smp;
pub use task::{Pid, ProcessState};

/// The `proc_id` of whatever thread is current on this CPU, or `0` if
/// nothing has been scheduled yet (early boot, before `create_init_process_structure`).
pub fn current_pid() -> Pid {
    let cpu_id = smp::current_cpu_id();
    smp::cpu(cpu_id)
        .sched
        .lock()
        .current
        .map(|t| t.proc_id)
        .unwrap_or(0)
}

pub fn current_thread() -> Option<task::ThreadId> {
    let cpu_id = smp::current_cpu_id();
    smp::cpu(cpu_id).sched.lock().current
}
