//! Architecture support
//!
//! The generic core stores and edits user register state through one
//! frame type with a fixed accessor surface: instruction pointer, stack
//! pointer, the four syscall words and the return register. Hardware
//! builds alias the native trap frame; everything else uses the software
//! frame, which the stub platform shares with the test suite.

#[cfg(all(target_arch = "aarch64", feature = "platform-aarch64"))]
pub mod aarch64;

mod soft;

#[cfg(all(target_arch = "aarch64", feature = "platform-aarch64", not(test)))]
pub use aarch64::TrapFrame as RegFrame;

#[cfg(not(all(target_arch = "aarch64", feature = "platform-aarch64", not(test))))]
pub use soft::SoftFrame as RegFrame;
