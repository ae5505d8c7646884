//! Program interpreter operations: the `.interp` section holds the
//! NUL-terminated path of the dynamic loader, mirrored by `PT_INTERP`.

use crate::common::error::Error;
use crate::elf::defs::read_cstr;
use crate::elf::file::ElfFile;

impl ElfFile {
    /// The current interpreter path.
    pub fn get_interpreter(&self) -> Result<String, Error> {
        let shdr = self.find_section(".interp")?;
        Ok(read_cstr(self.section_bytes(shdr), 0))
    }

    /// Replace the interpreter path. Setting the path the file already has
    /// leaves the file untouched.
    pub fn set_interpreter(&mut self, new_interpreter: &str) -> Result<(), Error> {
        let shdr = *self.find_section(".interp")?;
        let current = self.section_bytes(&shdr);
        let new_bytes = new_interpreter.as_bytes();
        if current.len() == new_bytes.len() + 1
            && &current[..new_bytes.len()] == new_bytes
            && current[new_bytes.len()] == 0
        {
            return Ok(());
        }

        let section = self.replace_section(".interp", new_bytes.len() + 1)?;
        section[..new_bytes.len()].copy_from_slice(new_bytes);
        section[new_bytes.len()] = 0;
        self.changed = true;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
