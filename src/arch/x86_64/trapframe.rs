//! Trap frame layout for syscall and timer entry.
//!
//! Built by the assembly syscall/IPI entry stubs (`arch::x86_64::syscall`),
//! laid out to match `process::task::RegisterFile` field-for-field so the
//! scheduler can snapshot/restore it without per-field translation.

use crate::process::task::RegisterFile;

/// User-mode code-segment selector (RPL 3), per the GDT layout in `gdt.rs`.
pub const USER_CS_RPL3: u64 = 0x2B;

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TrapFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    /// Pushed by the CPU on interrupt/exception entry (and synthesized for
    /// syscall entry): rip, cs, rflags, rsp, ss.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    pub const fn zeroed() -> Self {
        Self {
            rax: 0, rbx: 0, rcx: 0, rdx: 0, rsi: 0, rdi: 0, rbp: 0,
            r8: 0, r9: 0, r10: 0, r11: 0, r12: 0, r13: 0, r14: 0, r15: 0,
            rip: 0, cs: 0, rflags: 0, rsp: 0, ss: 0,
        }
    }

    pub fn from_registers(regs: &RegisterFile, cs: u64, ss: u64) -> Self {
        Self {
            rax: regs.rax, rbx: regs.rbx, rcx: regs.rcx, rdx: regs.rdx,
            rsi: regs.rsi, rdi: regs.rdi, rbp: regs.rbp,
            r8: regs.r8, r9: regs.r9, r10: regs.r10, r11: regs.r11,
            r12: regs.r12, r13: regs.r13, r14: regs.r14, r15: regs.r15,
            rip: regs.rip, cs, rflags: regs.rflags, rsp: regs.rsp, ss,
        }
    }

    pub fn to_registers(&self) -> RegisterFile {
        RegisterFile {
            rax: self.rax, rbx: self.rbx, rcx: self.rcx, rdx: self.rdx,
            rsi: self.rsi, rdi: self.rdi, rbp: self.rbp, rsp: self.rsp,
            r8: self.r8, r9: self.r9, r10: self.r10, r11: self.r11,
            r12: self.r12, r13: self.r13, r14: self.r14, r15: self.r15,
            rip: self.rip, rflags: self.rflags,
        }
    }

    /// True if this frame was taken while running in ring 3, RPL bits set.
    pub fn is_usermode(&self) -> bool {
        self.cs & 0x3 == 0x3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_frame_roundtrip_preserves_gprs() {
        let mut regs = RegisterFile::zeroed();
        regs.rax = 1;
        regs.rdi = 2;
        regs.rip = 0x4000;
        let frame = TrapFrame::from_registers(&regs, USER_CS_RPL3, 0x33);
        let back = frame.to_registers();
        assert_eq!(back.rax, 1);
        assert_eq!(back.rdi, 2);
        assert_eq!(back.rip, 0x4000);
    }

    #[test]
    fn usermode_detection_checks_rpl_bits() {
        let mut frame = TrapFrame::zeroed();
        frame.cs = USER_CS_RPL3;
        assert!(frame.is_usermode());
        frame.cs = 0x08;
        assert!(!frame.is_usermode());
    }
}
