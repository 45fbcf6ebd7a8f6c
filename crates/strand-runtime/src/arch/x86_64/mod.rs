//! x86_64 context switching
//!
//! Inline naked assembly, stable since Rust 1.88.

use std::arch::naked_asm;

/// Callee-saved register state for a voluntary switch.
///
/// Field order is load-bearing: the assembly below addresses fields by
/// byte offset.
#[repr(C)]
#[derive(Debug)]
pub struct SavedRegs {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl SavedRegs {
    pub const fn zeroed() -> Self {
        SavedRegs {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Arm a fresh context so that the first switch into it runs `entry` on
/// the given stack.
///
/// # Safety
///
/// `regs` must point to valid `SavedRegs` memory and `stack_top` must be
/// the top of a mapped stack.
pub unsafe fn init_context(regs: *mut SavedRegs, stack_top: *mut u8, entry: usize) {
    // System V AMD64: rsp ≡ -8 (mod 16) at function entry, as if a call
    // just pushed the return address.
    let sp = stack_top as usize;
    let aligned_sp = (sp & !0xF) - 8;

    let regs = &mut *regs;
    regs.rsp = aligned_sp as u64;
    regs.rip = entry as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = 0;
    regs.r13 = 0;
    regs.r14 = 0;
    regs.r15 = 0;
}

/// Save callee-saved registers into `_save`, load from `_load`, and jump.
///
/// The switched-out flow appears to return from this call when someone
/// later switches back into it.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_save: *mut SavedRegs, _load: *const SavedRegs) {
    naked_asm!(
        // Save callee-saved registers to save (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from load (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to the saved resume point
        "jmp rax",
        // Resume point for the saved context
        "1:",
        "ret",
    );
}
