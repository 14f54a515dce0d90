// Enhanced Panic Handler
//
// Provides detailed panic information for debugging and forensics

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Global panic state - prevents recursive panics
static PANICKING: AtomicBool = AtomicBool::new(false);

/// Panic counter for tracking multiple panics
static PANIC_COUNT: AtomicU64 = AtomicU64::new(0);

/// Enhanced panic handler with comprehensive diagnostics
pub fn panic_handler(info: &PanicInfo) -> ! {
    if PANICKING.swap(true, Ordering::SeqCst) {
        serial(b"\n!!! RECURSIVE PANIC !!!\n");
        halt();
    }

    let panic_num = PANIC_COUNT.fetch_add(1, Ordering::SeqCst) + 1;

    disable_interrupts();

    print_panic_header(panic_num);
    print_panic_info(info);
    print_registers();
    print_system_state();
    print_stack_trace();
    print_next_steps();

    halt();
}

fn serial(bytes: &[u8]) {
    crate::arch::x86_64::serial::serial_write(bytes);
}

fn print_panic_header(panic_num: u64) {
    serial(b"\n");
    serial(b"================================================================================\n");
    serial(b"!!!                        KERNEL PANIC                                      !!!\n");
    serial(b"================================================================================\n");

    if panic_num > 1 {
        let msg = alloc::format!("Panic #{}\n", panic_num);
        serial(msg.as_bytes());
    }
    serial(b"\n");
}

fn print_panic_info(info: &PanicInfo) {
    serial(b"PANIC INFORMATION:\n");
    serial(b"------------------\n");

    if let Some(location) = info.location() {
        let loc = alloc::format!(
            "  Location: {}:{}:{}\n",
            location.file(),
            location.line(),
            location.column()
        );
        serial(loc.as_bytes());
    } else {
        serial(b"  Location: <unknown>\n");
    }

    if let Some(payload) = info.payload().downcast_ref::<&str>() {
        let msg = alloc::format!("  Message:  {}\n", payload);
        serial(msg.as_bytes());
    } else if let Some(payload) = info.payload().downcast_ref::<alloc::string::String>() {
        let msg = alloc::format!("  Message:  {}\n", payload);
        serial(msg.as_bytes());
    } else {
        serial(b"  Message:  <no message>\n");
    }

    serial(b"\n");
}

fn print_registers() {
    use core::arch::asm;

    serial(b"REGISTER DUMP:\n");
    serial(b"--------------\n");

    unsafe {
        let mut rax: u64;
        let mut rbx: u64;
        let mut rcx: u64;
        let mut rdx: u64;
        let mut rsi: u64;
        let mut rdi: u64;
        let mut rbp: u64;
        let mut rsp: u64;
        let mut r8: u64;
        let mut r9: u64;
        let mut r10: u64;
        let mut r11: u64;
        let mut r12: u64;
        let mut r13: u64;
        let mut r14: u64;
        let mut r15: u64;
        let mut rip: u64;

        asm!("mov {}, rax", out(reg) rax);
        asm!("mov {}, rbx", out(reg) rbx);
        asm!("mov {}, rcx", out(reg) rcx);
        asm!("mov {}, rdx", out(reg) rdx);
        asm!("mov {}, rsi", out(reg) rsi);
        asm!("mov {}, rdi", out(reg) rdi);
        asm!("mov {}, rbp", out(reg) rbp);
        asm!("mov {}, rsp", out(reg) rsp);
        asm!("mov {}, r8", out(reg) r8);
        asm!("mov {}, r9", out(reg) r9);
        asm!("mov {}, r10", out(reg) r10);
        asm!("mov {}, r11", out(reg) r11);
        asm!("mov {}, r12", out(reg) r12);
        asm!("mov {}, r13", out(reg) r13);
        asm!("mov {}, r14", out(reg) r14);
        asm!("mov {}, r15", out(reg) r15);
        asm!("lea {}, [rip]", out(reg) rip);

        let regs = alloc::format!(
            "  rax: {:016x}  rbx: {:016x}  rcx: {:016x}  rdx: {:016x}\n\
             rsi: {:016x}  rdi: {:016x}  rbp: {:016x}  rsp: {:016x}\n\
             r8:  {:016x}  r9:  {:016x}  r10: {:016x}  r11: {:016x}\n\
             r12: {:016x}  r13: {:016x}  r14: {:016x}  r15: {:016x}\n\
             rip: {:016x}\n",
            rax, rbx, rcx, rdx, rsi, rdi, rbp, rsp, r8, r9, r10, r11, r12, r13, r14, r15, rip
        );
        serial(regs.as_bytes());
    }

    serial(b"\n");
}

fn print_system_state() {
    serial(b"SYSTEM STATE:\n");
    serial(b"-------------\n");

    let ticks = crate::arch::x86_64::pit::ticks();
    let msg = alloc::format!("  Uptime:       {} ticks ({} s)\n", ticks, ticks / 1000);
    serial(msg.as_bytes());

    let pid = crate::process::current_pid();
    let msg = alloc::format!("  Current pid:  {}\n", pid);
    serial(msg.as_bytes());

    serial(b"\n");
}

fn print_stack_trace() {
    use core::arch::asm;

    serial(b"STACK TRACE:\n");
    serial(b"------------\n");
    serial(b"  [requires RUSTFLAGS=\"-C force-frame-pointers=yes\"]\n");

    unsafe {
        let mut rbp: u64;
        asm!("mov {}, rbp", out(reg) rbp);

        for i in 0..10 {
            if rbp < 0x1000 || rbp > 0x1000_0000_0000 {
                break;
            }

            let frame_ptr = rbp as *const u64;
            let ret_addr = frame_ptr.offset(1).read_volatile();

            let msg = alloc::format!("  #{}: {:016x}\n", i, ret_addr);
            serial(msg.as_bytes());

            rbp = frame_ptr.read_volatile();
        }
    }

    serial(b"\n");
}

fn print_next_steps() {
    serial(b"DEBUGGING STEPS:\n");
    serial(b"----------------\n");
    serial(b"  1. Check panic location and message above\n");
    serial(b"  2. Examine register values for invalid pointers\n");
    serial(b"  3. If stack trace available, identify call chain\n");
    serial(b"  4. Check system uptime for timing-related issues\n");
    serial(b"\n");
}

#[inline(always)]
fn disable_interrupts() {
    unsafe {
        core::arch::asm!("cli");
    }
}

#[inline(always)]
fn halt() -> ! {
    serial(b"================================================================================\n");
    serial(b"System halted.\n");
    serial(b"================================================================================\n");

    loop {
        unsafe {
            core::arch::asm!("hlt");
        }
    }
}

/// Get current panic count
pub fn get_panic_count() -> u64 {
    PANIC_COUNT.load(Ordering::Relaxed)
}

/// Check if currently panicking
pub fn is_panicking() -> bool {
    PANICKING.load(Ordering::Relaxed)
}
