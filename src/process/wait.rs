//! wait4/waitpid and process exit.

use super::pid::get_process_table;
use super::task::{Continuation, Pid, RegisterFile, ThreadId};
use crate::lib::error::Errno;
use alloc::vec;
use alloc::vec::Vec;

pub const WNOHANG: i32 = 1;
pub const WUNTRACED: i32 = 2;
pub const WCONTINUED: i32 = 8;

pub fn w_exitcode(exit_code: i32, signal: i32) -> i32 {
    (exit_code << 8) | (signal & 0x7f)
}

fn matching_children(table: &super::pid::PidTable, current_pid: Pid, pid: i32) -> Result<Vec<Pid>, Errno> {
    let children = if pid > 0 {
        vec![pid as Pid]
    } else if pid == -1 || pid == 0 {
        table.find_children(current_pid)
    } else {
        return Err(Errno::EINVAL);
    };
    if children.is_empty() {
        return Err(Errno::ECHILD);
    }
    Ok(children)
}

fn reap_zombie(table: &mut super::pid::PidTable, children: &[Pid], wstatus: *mut i32) -> Option<Pid> {
    for &child_pid in children {
        if let Some(child) = table.get(child_pid) {
            if child.is_zombie() {
                let exit_code = child.exit_code;
                if !wstatus.is_null() {
                    unsafe {
                        *wstatus = w_exitcode(exit_code, 0);
                    }
                }
                table.remove(child_pid);
                return Some(child_pid);
            }
        }
    }
    None
}

/// Non-blocking half of wait4: reap a zombie child if one is ready.
/// `do_wait4` calls this first; if nothing is ready and `WNOHANG` wasn't
/// set, the caller blocks via `Continuation::ResumeWait4` instead of
/// spinning here.
pub fn do_wait4(current_pid: Pid, pid: i32, wstatus: *mut i32, options: i32) -> Result<Pid, Errno> {
    let mut table = get_process_table();
    let table = table.as_mut().ok_or(Errno::ESRCH)?;
    table.get(current_pid).ok_or(Errno::ESRCH)?;

    let children = matching_children(table, current_pid, pid)?;
    if let Some(reaped) = reap_zombie(table, &children, wstatus) {
        return Ok(reaped);
    }

    if options & WNOHANG != 0 {
        return Ok(0);
    }

    Err(Errno::EAGAIN)
}

/// Block the current thread on a pending wait4, to be resumed by the
/// scheduler's continuation mechanism once a matching child exits.
pub fn block_on_wait4(current: ThreadId, target_pid: i32, regs: &mut RegisterFile) {
    {
        let mut table = get_process_table();
        if let Some(table) = table.as_mut() {
            if let Some(p) = table.get_mut(current.proc_id) {
                if let Some(th) = p.thread_mut(current) {
                    th.blocked = true;
                    th.continuation = Continuation::ResumeWait4 { target_pid };
                }
            }
        }
    }
    crate::process::scheduler::schedule(regs);
}

/// Entry point for `Continuation::ResumeWait4`: retry the non-blocking
/// reap now that something woke this thread (a child exited).
pub fn resume_wait4(current: ThreadId, target_pid: i32, regs: &mut RegisterFile) {
    match do_wait4(current.proc_id, target_pid, core::ptr::null_mut(), WNOHANG) {
        Ok(child_pid) if child_pid != 0 => regs.rax = child_pid as u64,
        Ok(_) => regs.rax = 0,
        Err(e) => regs.rax = (-(e as i32)) as u64,
    }
}

/// Mark the current process a zombie, reparent its children to init, wake
/// any parent blocked in `wait4`, and hand off to the scheduler. Does not
/// return.
pub fn do_exit(current_pid: Pid, exit_code: i32) -> ! {
    let parent = {
        let mut table = get_process_table();
        let mut parent = None;
        if let Some(tbl) = table.as_mut() {
            if let Some(proc) = tbl.get_mut(current_pid) {
                proc.exit(exit_code);
                parent = Some(proc.parent);
                crate::info!("process {} exited with code {}", current_pid, exit_code);
            }
            tbl.reparent_to_init(current_pid);
        }
        parent
    };

    if let Some(parent_pid) = parent {
        wake_parent_if_waiting(parent_pid);
    }

    let mut dummy = RegisterFile::zeroed();
    crate::process::scheduler::schedule(&mut dummy);

    loop {
        crate::arch::x86_64::halt();
    }
}

/// If `parent_pid`'s main thread is parked in `Continuation::ResumeWait4`,
/// clear its blocked flag and put it back on a run queue.
fn wake_parent_if_waiting(parent_pid: Pid) {
    let woken = {
        let mut table = get_process_table();
        let table = match table.as_mut() {
            Some(t) => t,
            None => return,
        };
        let parent = match table.get_mut(parent_pid) {
            Some(p) => p,
            None => return,
        };
        let mut found = None;
        for th in parent.threads.iter_mut() {
            if th.blocked && matches!(th.continuation, Continuation::ResumeWait4 { .. }) {
                th.blocked = false;
                found = Some((th.id, th.priority));
                break;
            }
        }
        found
    };
    if let Some((id, priority)) = woken {
        crate::process::scheduler::enschedule_best(id, priority);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exitcode_packs_status_and_signal() {
        assert_eq!(w_exitcode(1, 0), 1 << 8);
        assert_eq!(w_exitcode(0, 9), 9);
    }
}
