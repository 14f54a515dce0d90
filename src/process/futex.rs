//! Futex wait/wake, keyed by user virtual address within a process.
//!
//! The waiter list lives in `Process::futexes`, so addresses are only
//! comparable within the same process; no cross-process futexes.

use super::pid::get_process_table;
use super::task::{Continuation, Pid, RegisterFile, ThreadId};
use crate::lib::error::Errno;

/// `futex_wait(regs, addr, expected)`: if the word at `addr` no longer
/// equals `expected`, return `EWOULDBLOCK` immediately without blocking.
/// Otherwise register the current thread as a waiter and fall into the
/// scheduler; it resumes via `Continuation::ResumeFutexWait` on wake.
///
/// `addr` is given to the caller pre-read (`current_value`) since reading a
/// user pointer is a page-table/MMU concern outside this module.
pub fn futex_wait(
    current: ThreadId,
    current_value: u32,
    expected: u32,
    addr: u64,
    regs: &mut RegisterFile,
) -> Result<(), Errno> {
    if current_value != expected {
        return Err(Errno::EAGAIN);
    }

    {
        let mut table = get_process_table();
        let table = table.as_mut().ok_or(Errno::ESRCH)?;
        let proc = table.get_mut(current.proc_id).ok_or(Errno::ESRCH)?;

        proc.futexes.lock().entry(addr).or_default().push(current);

        let thread = proc.thread_mut(current).ok_or(Errno::ESRCH)?;
        thread.blocked = true;
        thread.continuation = Continuation::ResumeFutexWait { uaddr: addr };
    }

    crate::process::scheduler::schedule(regs);
    Ok(())
}

/// `futex_wake(addr, n)`: wake up to `n` waiters at `addr`. `EINVAL` if no
/// waiter list exists for that address at all (never woken, not merely
/// empty).
pub fn futex_wake(proc_id: Pid, addr: u64, n: usize) -> Result<usize, Errno> {
    let woken = {
        let mut table = get_process_table();
        let table = table.as_mut().ok_or(Errno::ESRCH)?;
        let proc = table.get_mut(proc_id).ok_or(Errno::ESRCH)?;

        let mut futexes = proc.futexes.lock();
        let waiters = futexes.get_mut(&addr).ok_or(Errno::EINVAL)?;
        let take = n.min(waiters.len());
        let woken: alloc::vec::Vec<ThreadId> = waiters.drain(..take).collect();
        if waiters.is_empty() {
            futexes.remove(&addr);
        }
        drop(futexes);

        for &tid in &woken {
            if let Some(thread) = proc.thread_mut(tid) {
                thread.blocked = false;
            }
        }
        woken
    };

    let count = woken.len();
    for tid in woken {
        let priority = {
            let mut table = get_process_table();
            table
                .as_ref()
                .and_then(|t| t.get(proc_id))
                .and_then(|p| p.thread(tid))
                .map(|th| th.priority)
                .unwrap_or(crate::process::task::DEFAULT_PRIORITY)
        };
        crate::process::scheduler::enschedule_best_nolock(tid, priority);
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_returns_eagain_without_blocking_on_value_mismatch() {
        let mut regs = RegisterFile::zeroed();
        let tid = ThreadId::new(999, 0);
        let result = futex_wait(tid, 5, 6, 0x1000, &mut regs);
        assert_eq!(result, Err(Errno::EAGAIN));
    }
}
