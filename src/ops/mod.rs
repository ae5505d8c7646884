//! The operations layer: interpreter and RPATH edits, expressed against
//! the parsed ELF view and the replacement set.

pub mod interp;
pub mod rpath;
