use core::arch::naked_asm;

/// CPU register context saved and restored across a cooperative switch.
/// Callee-saved registers of the x86_64 System V ABI plus the resume point.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

impl Context {
    pub const fn empty() -> Self {
        Context {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
        }
    }

    /// Build the initial context of a fresh thread.
    ///
    /// The thread starts in `thread_trampoline` with `rsp` at the top of its
    /// stack. The trampoline expects the shim function in r12 and its single
    /// argument in r13; both are callee-saved, so `switch_context` delivers
    /// them intact.
    pub fn setup(shim: u64, arg: u64, stack: &[u8]) -> Self {
        let top = stack.as_ptr() as u64 + stack.len() as u64;
        // 16-byte aligned before the trampoline's call, per the ABI.
        let rsp = top & !0xF;

        Context {
            rsp,
            rbp: 0,
            rbx: 0,
            r12: shim,
            r13: arg,
            r14: 0,
            r15: 0,
            rip: thread_trampoline as *const () as u64,
        }
    }
}

/// Save the callee-saved state into `old` and resume `new`.
///
/// # Safety
/// Both pointers must reference valid contexts; `new` must hold either a
/// resume point previously saved here or a fresh `Context::setup` frame.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(old: *mut Context, new: *const Context) {
    naked_asm!(
        // rdi = old: spill callee-saved registers
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        // resume point for when someone switches back to `old`
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x38], rax",
        // rsi = new: reload and jump
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "jmp [rsi + 0x38]",
        "2:",
        "ret",
    );
}

/// First instructions of every thread. Forwards the boxed entry closure
/// (r13) to the shim (r12); the shim never returns, it ends in thread exit.
#[unsafe(naked)]
extern "C" fn thread_trampoline() {
    naked_asm!("mov rdi, r13", "call r12", "ud2");
}
