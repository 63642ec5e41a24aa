#![forbid(unsafe_code)]

//! A user-mode emulator for the RV32I base integer instruction set.
//!
//! The crate is organised around the three subsystems that matter:
//! [`decode`] and [`alu`] turn an instruction word into a primitive
//! operation, [`hart`] runs the fetch-decode-execute-writeback loop
//! over a [`hart::Hart`], and [`syscall`] services the `ecall`
//! instruction by proxying to the host. [`memory`] and
//! [`register_file`] are the two pieces of architectural state a hart
//! owns; [`elf_loader`] builds a hart from an ELF file on disk.

pub mod alu;
pub mod decode;
pub mod elf_loader;
pub mod hart;
pub mod memory;
pub mod register_file;
pub mod syscall;

pub use hart::{Hart, Trap};
