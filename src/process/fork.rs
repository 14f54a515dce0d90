//! Process creation: `fork`, the two-phase `cp_stage_1`/`cp_stage_2`
//! creation path, and `sys_execve`'s in-place image replacement.

use super::pid::{self, get_process_table};
use super::scheduler;
use super::task::{Priority, Process, ProcId, RegisterFile, PER_PROCESS_TICKETS};
use super::ticket::TicketLedger;
use crate::lib::error::{Errno, KernelError};
use crate::mm::vm_hole::{MapType, ProcRng, VaHoleList};
use alloc::string::String;

/// Initial user stack size handed to every freshly loaded image.
const USER_STACK_PAGES: u64 = 8;
const USER_STACK_SIZE: u64 = USER_STACK_PAGES * crate::mm::PAGE_SIZE as u64;
const USER_STACK_ALIGN: u64 = 16;

/// Reserve the initial user stack in `mem_maps` and return its top (stacks
/// grow down, so the new thread's `rsp` starts at `vaend`).
fn alloc_user_stack(mem_maps: &mut VaHoleList, rng: &mut ProcRng) -> Result<u64, Errno> {
    let idx = mem_maps.find_va_hole(USER_STACK_SIZE, USER_STACK_ALIGN, rng, MapType::StackData)?;
    Ok(mem_maps.region(idx).vaend)
}

/// `create_init_process_structure`: PID 1, used exactly once at boot. The
/// caller is responsible for calling `pid::init_process_table()` first.
pub fn create_init_process_structure() -> Result<ProcId, KernelError> {
    let proc = Process::new_init(0xDEADBEEF)?;
    let proc_id = proc.proc_id;
    pid::insert_task(proc)?;
    crate::info!("created init process (pid {})", proc_id);
    Ok(proc_id)
}

/// `fork_process(parent)`: duplicate `parent` into a freshly allocated
/// child. The child's fds are deep-copied into its *own* table (the
/// corrected behavior; the original bug pushed the copies back onto the
/// parent). The child gets a fresh ticket ledger, not the parent's.
pub fn fork_process(parent_pid: ProcId, parent_regs: &mut RegisterFile) -> Result<ProcId, Errno> {
    let child_pid = pid::alloc_pid().map_err(|_| Errno::ENOMEM)?;

    let (priority, pprocess, pml4, fds, mem_maps, name, cwd, thread_regs, seed) = {
        let mut table = get_process_table();
        let table = table.as_mut().ok_or(Errno::ESRCH)?;
        let parent = table.get_mut(parent_pid).ok_or(Errno::ESRCH)?;
        let thread_regs = {
            let main = parent.threads.first().ok_or(Errno::ESRCH)?;
            super::task::registers_copy(&main.regs)
        };
        // Draw the child's seed from the parent's own LCG rather than a
        // second, unrelated generator; keeps every process-PRNG consumer on
        // the one stream.
        let seed = parent.mm_rng.next();
        (
            parent.priority,
            parent.pprocess,
            parent.pml4,
            parent.fds.deep_copy(),
            parent.mem_maps.deep_clone(),
            parent.name.clone(),
            parent.cwd.clone(),
            thread_regs,
            seed,
        )
    };

    let child_pml4 = crate::mm::clone_paging_structures(pml4);

    let mut child = Process::new(child_pid, parent_pid, name, seed);
    child.pprocess = pprocess;
    child.priority = priority;
    child.pml4 = child_pml4;
    child.fds = fds;
    child.mem_maps = mem_maps;
    child.cwd = cwd;
    child.tickets = TicketLedger::new(PER_PROCESS_TICKETS);

    let kstack = crate::mm::alloc_kernel_stack().ok_or(Errno::ENOMEM)?;
    let child_tid = child.add_thread(priority, kstack);
    if let Some(th) = child.thread_mut(child_tid) {
        th.regs = thread_regs;
        th.regs.rax = 0;
    }

    pid::insert_task(child).map_err(|_| Errno::ENOMEM)?;

    {
        let mut table = get_process_table();
        if let Some(table) = table.as_mut() {
            if let Some(parent) = table.get_mut(parent_pid) {
                parent.children.push(child_pid);
            }
        }
    }

    scheduler::enschedule_best(child_tid, priority);

    parent_regs.rax = child_pid as u64;
    crate::info!("forked process {} from {}", child_pid, parent_pid);
    Ok(child_pid)
}

/// Recognized only under `#[cfg(test)]`, so the register/ticket/promotion
/// logic downstream of a successful load has something to run against.
#[cfg(test)]
const TEST_IMAGE_SENTINEL: &[u8] = b"TEST-IMAGE";
#[cfg(test)]
const TEST_IMAGE_ENTRY: u64 = 0x40_0000;

/// The exec-a-fresh-image path used both for `create_process_base` and as
/// the loading half of `cp_stage_2`. `loader` stands in for the ELF loader:
/// given the target process's `pml4`, it maps the image and returns the
/// entry point. Out of scope here, same as the page-table contracts in
/// `mm`.
pub fn run_elf_loader(pml4: u64, image: &[u8]) -> Result<u64, Errno> {
    #[cfg(test)]
    {
        if image == TEST_IMAGE_SENTINEL {
            let _ = pml4;
            return Ok(TEST_IMAGE_ENTRY);
        }
    }
    let _ = (pml4, image);
    Err(Errno::EINVAL)
}

/// `create_process_base`: allocate a brand new process running a fresh
/// image, with no parent-state inheritance beyond priority legality.
pub fn create_process_base(
    caller_pid: ProcId,
    image: &[u8],
    argv: &[String],
    envp: &[String],
    asked_priority: Priority,
) -> Result<ProcId, Errno> {
    let caller_priority = {
        let mut table = get_process_table();
        let table = table.as_mut().ok_or(Errno::ESRCH)?;
        table.get(caller_pid).ok_or(Errno::ESRCH)?.priority
    };
    if caller_priority > asked_priority {
        return Err(Errno::EINVAL);
    }

    let proc_id = pid::alloc_pid().map_err(|_| Errno::ENOMEM)?;
    let pml4 = crate::mm::new_pml4();

    let entry = run_elf_loader(pml4, image)?;

    let mut proc = Process::new(proc_id, caller_pid, String::from("exec"), proc_id);
    proc.priority = asked_priority;
    proc.pml4 = pml4;

    let stack_top = alloc_user_stack(&mut proc.mem_maps, &mut proc.mm_rng)?;
    let argv_ptr = crate::mm::copy_user_array(pml4, stack_top, argv);
    let envp_ptr = crate::mm::copy_user_array(pml4, stack_top, envp);

    let kstack = crate::mm::alloc_kernel_stack().ok_or(Errno::ENOMEM)?;
    let tid = proc.add_thread(asked_priority, kstack);
    if let Some(th) = proc.thread_mut(tid) {
        th.regs = RegisterFile::zeroed();
        th.regs.rflags = 0x200;
        th.regs.rip = entry;
        th.regs.rsp = stack_top;
        th.regs.rdi = argv.len() as u64;
        th.regs.rsi = argv_ptr;
        th.regs.rdx = envp_ptr;
        th.regs.rax = proc_id as u64;
    }

    pid::insert_task(proc).map_err(|_| Errno::ENOMEM)?;
    scheduler::enschedule_best(tid, asked_priority);
    Ok(proc_id)
}

/// Stage 1 of two-phase creation: allocate the process and stash it in the
/// pending table, visible to nothing but `cp_stage_2`/`drop_pending` and
/// the creator's `temp_processes` list.
pub fn cp_stage_1(creator_pid: ProcId, requested_priority: i32) -> Result<ProcId, Errno> {
    let (creator_priority, creator_privileged) = {
        let mut table = get_process_table();
        let table = table.as_mut().ok_or(Errno::ESRCH)?;
        let creator = table.get_mut(creator_pid).ok_or(Errno::ESRCH)?;
        (creator.priority, creator.pprocess)
    };

    let priority: Priority = if requested_priority < 0 {
        creator_priority
    } else if requested_priority > 4 {
        return Err(Errno::EINVAL);
    } else {
        requested_priority as Priority
    };

    let proc_id = pid::alloc_pid().map_err(|_| Errno::ENOMEM)?;
    let mut proc = Process::new(proc_id, creator_pid, String::from("temp"), proc_id);
    proc.priority = priority;
    proc.pprocess = creator_privileged;
    proc.pml4 = crate::mm::new_pml4();

    pid::insert_pending(proc);

    {
        let mut table = get_process_table();
        if let Some(table) = table.as_mut() {
            if let Some(creator) = table.get_mut(creator_pid) {
                creator.temp_processes.push(proc_id);
            }
        }
    }

    Ok(proc_id)
}

/// Stage 2: load the image into a process previously created by
/// `cp_stage_1` and commit it to the runnable set. Any failure drops the
/// pending entry without ever touching the global process list.
pub fn cp_stage_2(
    creator_pid: ProcId,
    proc_id: ProcId,
    image: &[u8],
    argv: &[String],
    envp: &[String],
) -> Result<(), Errno> {
    let result = pid::with_pending_mut(proc_id, |proc| -> Result<(u64, Priority), Errno> {
        let entry = run_elf_loader(proc.pml4, image)?;
        let stack_top = alloc_user_stack(&mut proc.mem_maps, &mut proc.mm_rng)?;
        let argv_ptr = crate::mm::copy_user_array(proc.pml4, stack_top, argv);
        let envp_ptr = crate::mm::copy_user_array(proc.pml4, stack_top, envp);
        let kstack = crate::mm::alloc_kernel_stack().ok_or(Errno::ENOMEM)?;
        let tid = proc.add_thread(proc.priority, kstack);
        if let Some(th) = proc.thread_mut(tid) {
            th.regs = RegisterFile::zeroed();
            th.regs.rflags = 0x200;
            th.regs.rip = entry;
            th.regs.rsp = stack_top;
            th.regs.rdi = argv.len() as u64;
            th.regs.rsi = argv_ptr;
            th.regs.rdx = envp_ptr;
            th.regs.rax = proc_id as u64;
        }
        Ok((entry, proc.priority))
    });

    match result {
        Some(Ok((_entry, priority))) => {
            pid::promote(proc_id)?;
            remove_from_temp_list(creator_pid, proc_id);

            let main_tid = {
                let mut table = get_process_table();
                table
                    .as_ref()
                    .and_then(|t| t.get(proc_id))
                    .and_then(|p| p.threads.first())
                    .map(|th| th.id)
            };
            if let Some(tid) = main_tid {
                scheduler::enschedule_best(tid, priority);
            }
            Ok(())
        }
        Some(Err(e)) => {
            pid::drop_pending(proc_id);
            remove_from_temp_list(creator_pid, proc_id);
            Err(e)
        }
        None => Err(Errno::EINVAL),
    }
}

fn remove_from_temp_list(creator_pid: ProcId, proc_id: ProcId) {
    let mut table = get_process_table();
    if let Some(table) = table.as_mut() {
        if let Some(creator) = table.get_mut(creator_pid) {
            creator.temp_processes.retain(|&p| p != proc_id);
        }
    }
}

/// `sys_execve`: replace the current process's image in place. On ELF load
/// failure the process is left dead rather than resumed into a half-torn
/// image; the caller is expected to route this into `wait::do_exit`.
pub fn sys_execve(
    proc_id: ProcId,
    image: &[u8],
    argv: &[String],
    envp: &[String],
    regs: &mut RegisterFile,
) -> Result<(), Errno> {
    let old_pml4 = {
        let mut table = get_process_table();
        let table = table.as_mut().ok_or(Errno::ESRCH)?;
        let proc = table.get_mut(proc_id).ok_or(Errno::ESRCH)?;
        let old_pml4 = proc.pml4;
        proc.threads.truncate(1);
        old_pml4
    };

    crate::mm::free_proc_memory(old_pml4);
    let new_pml4 = crate::mm::new_pml4();

    let entry = match run_elf_loader(new_pml4, image) {
        Ok(e) => e,
        Err(e) => return Err(e),
    };

    let mut table = get_process_table();
    let table = table.as_mut().ok_or(Errno::ESRCH)?;
    let proc = table.get_mut(proc_id).ok_or(Errno::ESRCH)?;
    proc.pml4 = new_pml4;
    proc.tickets = TicketLedger::new(PER_PROCESS_TICKETS);
    // Old address space is gone with `old_pml4`; the new image starts from
    // an empty map list, same as a freshly created process.
    proc.mem_maps = VaHoleList::new();

    let stack_top = alloc_user_stack(&mut proc.mem_maps, &mut proc.mm_rng)?;
    let argv_ptr = crate::mm::copy_user_array(new_pml4, stack_top, argv);
    let envp_ptr = crate::mm::copy_user_array(new_pml4, stack_top, envp);

    *regs = RegisterFile::zeroed();
    regs.rflags = 0x200;
    regs.rip = entry;
    regs.rsp = stack_top;
    regs.rdi = argv.len() as u64;
    regs.rsi = argv_ptr;
    regs.rdx = envp_ptr;

    if let Some(main) = proc.threads.first_mut() {
        main.regs = *regs;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cp_stage_1_rejects_priority_above_four() {
        pid::init_process_table();
        create_init_process_structure().unwrap();
        let err = cp_stage_1(1, 5).unwrap_err();
        assert_eq!(err, Errno::EINVAL);
    }

    #[test]
    fn cp_stage_1_inherits_creator_priority_when_negative() {
        pid::init_process_table();
        create_init_process_structure().unwrap();
        let proc_id = cp_stage_1(1, -1).unwrap();
        let mut table = get_process_table();
        let table = table.as_mut().unwrap();
        // still pending, not yet in the main table
        assert!(table.get(proc_id).is_none());
    }

    #[test]
    fn create_process_base_loads_sentinel_image() {
        pid::init_process_table();
        create_init_process_structure().unwrap();
        let argv = [String::from("a"), String::from("b")];
        let envp = [String::from("X=1")];
        let proc_id = create_process_base(1, TEST_IMAGE_SENTINEL, &argv, &envp, 2).unwrap();

        let mut table = get_process_table();
        let table = table.as_mut().unwrap();
        let proc = table.get(proc_id).unwrap();
        let th = proc.threads.first().unwrap();
        assert_eq!(th.regs.rip, TEST_IMAGE_ENTRY);
        assert_eq!(th.regs.rdi, argv.len() as u64);
        assert_ne!(th.regs.rsp, 0);
        assert_ne!(th.regs.rsi, 0);
        assert_ne!(th.regs.rdx, 0);
    }

    #[test]
    fn create_process_base_rejects_bad_image() {
        pid::init_process_table();
        create_init_process_structure().unwrap();
        let err = create_process_base(1, b"not-an-elf", &[], &[], 2).unwrap_err();
        assert_eq!(err, Errno::EINVAL);
    }

    #[test]
    fn cp_stage_2_commits_on_successful_load() {
        pid::init_process_table();
        create_init_process_structure().unwrap();
        let proc_id = cp_stage_1(1, -1).unwrap();
        let argv = [String::from("a")];
        cp_stage_2(1, proc_id, TEST_IMAGE_SENTINEL, &argv, &[]).unwrap();

        let mut table = get_process_table();
        let table = table.as_mut().unwrap();
        let proc = table.get(proc_id).unwrap();
        let th = proc.threads.first().unwrap();
        assert_eq!(th.regs.rip, TEST_IMAGE_ENTRY);
        assert_ne!(th.regs.rsp, 0);
    }

    #[test]
    fn sys_execve_replaces_image_and_sets_registers() {
        pid::init_process_table();
        create_init_process_structure().unwrap();
        let argv = [String::from("a")];
        let envp = [String::from("X=1")];
        let mut regs = RegisterFile::zeroed();
        sys_execve(1, TEST_IMAGE_SENTINEL, &argv, &envp, &mut regs).unwrap();

        assert_eq!(regs.rip, TEST_IMAGE_ENTRY);
        assert_eq!(regs.rdi, argv.len() as u64);
        assert_ne!(regs.rsp, 0);
        assert_ne!(regs.rsi, 0);
        assert_ne!(regs.rdx, 0);
    }
}
