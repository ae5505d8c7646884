//! patchelf: a post-link editor for 32-bit little-endian ELF binaries.
//!
//! The tool rewrites two pieces of linker-recorded metadata in place: the
//! program interpreter (`PT_INTERP`/`.interp`) and the runtime library
//! search path (`DT_RPATH` in `.dynstr`). Both are thin clients of the
//! section-rewriting engine in [`elf::rewrite`], which can grow sections
//! whose slots in the file are fixed-size while keeping every invariant
//! the dynamic loader relies on.

pub mod common;
pub mod driver;
pub mod elf;
pub mod ops;
