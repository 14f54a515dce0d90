//! Inter-processor interrupts, built on the Local APIC ICR.
//!
//! Two vectors matter to the scheduler: `IPI_RUN_SCHEDULER`, sent by
//! `enschedule`/`attemp_to_run_scheduler` to nudge a CPU that just gained
//! runnable work (including one sitting in the idle wait), and
//! `IPI_TLB_SHOOTDOWN`, sent after unmapping pages that another CPU might
//! still be caching in its TLB.

use super::{cpu, Cpu};
use crate::arch::x86_64::apic::{self, IpiDestination, IpiType};
use core::sync::atomic::{AtomicU64, Ordering};

pub const IPI_RUN_SCHEDULER: u8 = 0xFC;
pub const IPI_TLB_SHOOTDOWN: u8 = 0xFD;

static TLB_SHOOTDOWN_GENERATION: AtomicU64 = AtomicU64::new(0);

/// Send a fixed-vector IPI to `target`: stamp its mailbox before ringing the
/// doorbell so the handler always has a message to read, matching the
/// `cpu.__ipi_lock`/`cpu.__message_clear_lock` ordering.
fn send_ipi_to(target: &Cpu, sender_cpu: usize, vector: u8, message: u64) {
    {
        let mut mailbox = target.ipi.lock();
        mailbox.message = message;
        mailbox.message_type = vector as u32;
        mailbox.sender_cpu = sender_cpu;
        mailbox.handled = false;
    }
    let apic_id = target.meta.lock().apic_id;
    if let Some(guard) = apic::get() {
        if let Some(lapic) = guard.as_ref() {
            unsafe {
                lapic.send_ipi(IpiDestination::Physical(apic_id), IpiType::Fixed(vector));
                lapic.wait_ipi_delivery();
            }
        }
    }
}

/// Nudge `cpu_id` to re-enter the scheduler: wakes it out of the idle wait
/// if it's parked there, or makes it notice new work at the next
/// reschedule point if it's already running something.
pub fn send_reschedule_ipi(cpu_id: usize) {
    let sender = super::current_cpu_id();
    if cpu_id == sender {
        return;
    }
    send_ipi_to(cpu(cpu_id), sender, IPI_RUN_SCHEDULER, 0);
}

/// Ask every other online CPU to drop stale TLB entries for `[start, start+len)`
/// in `pml4`.
pub fn tlb_shootdown_all(pml4: u64, start: u64, len: u64) {
    let sender = super::current_cpu_id();
    let gen = TLB_SHOOTDOWN_GENERATION.fetch_add(1, Ordering::SeqCst) + 1;
    for id in 0..super::MAX_CPUS {
        if id == sender || !super::is_cpu_online(id) {
            continue;
        }
        {
            let mut mailbox = cpu(id).ipi.lock();
            mailbox.message2 = start;
            mailbox.message3 = len;
        }
        send_ipi_to(cpu(id), sender, IPI_TLB_SHOOTDOWN, pml4.wrapping_add(gen));
    }
    crate::arch::x86_64::flush_tlb();
}

/// Runs on the receiving CPU's interrupt stack. Clears the mailbox before
/// acting on it so a second IPI landing mid-handler isn't lost.
pub fn handle_ipi(vector: u8) {
    let id = super::current_cpu_id();
    let this = cpu(id);
    let (start, len) = {
        let _clear = this.message_clear.lock();
        let mut mailbox = this.ipi.lock();
        let m = (mailbox.message2, mailbox.message3);
        mailbox.handled = true;
        m
    };

    match vector {
        IPI_RUN_SCHEDULER => {
            crate::process::scheduler::handle_run_scheduler_ipi();
        }
        IPI_TLB_SHOOTDOWN => {
            if len == 0 {
                crate::arch::x86_64::flush_tlb();
            } else {
                let pages = (len + 0xFFF) / 0x1000;
                for p in 0..pages {
                    crate::arch::x86_64::invlpg(start + p * 0x1000);
                }
            }
        }
        _ => {
            crate::warn!("smp: unhandled ipi vector {:#x}", vector);
        }
    }

    unsafe {
        apic::eoi();
    }
}
