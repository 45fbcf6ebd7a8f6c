//! Architecture-specific context switching
//!
//! Hand-written register save/restore for voluntary fiber switches. Only
//! callee-saved state is preserved; every switch point is an explicit
//! function call, so caller-saved registers are already dead.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{context_switch, init_context, SavedRegs};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{context_switch, init_context, SavedRegs};
    } else {
        compile_error!("unsupported architecture");
    }
}
