//! The parsed view of a 32-bit little-endian ELF binary.
//!
//! `ElfFile` owns the file image plus decoded copies of the ELF header,
//! program headers, and section headers, and the section-name string
//! table. The decoded copies are authoritative after parse; the rewriting
//! engine serializes them back into the image.
//!
//! Section edits never touch the file directly. They go through the
//! replacement set: a name-ordered map from section name to the pending
//! contents of that section. Once a section has an entry there, the bytes
//! still in the file are obsolete for it.

use std::collections::BTreeMap;

use crate::common::error::Error;
use crate::elf::defs::{
    read_cstr, FileHeader, ProgramHeader, SectionHeader, EHDR_SIZE, EI_CLASS, EI_DATA, EI_VERSION,
    ELFCLASS32, ELFDATA2LSB, ELF_MAGIC, ET_DYN, ET_EXEC, EV_CURRENT, PHDR_SIZE, SHDR_SIZE,
};
use crate::elf::image::Image;

#[derive(Debug)]
pub struct ElfFile {
    pub(crate) image: Image,
    pub(crate) hdr: FileHeader,
    pub(crate) phdrs: Vec<ProgramHeader>,
    pub(crate) shdrs: Vec<SectionHeader>,
    /// Contents of the section-name string table (`.shstrtab`).
    pub(crate) section_names: Vec<u8>,
    /// Pending replacement contents, keyed by section name. BTreeMap so
    /// the rewrite layout order is deterministic (sorted by name).
    pub(crate) replaced: BTreeMap<String, Vec<u8>>,
    pub(crate) changed: bool,
}

impl ElfFile {
    /// Parse and validate the image. All rejections are `Malformed`.
    pub fn parse(image: Image) -> Result<Self, Error> {
        let data = image.bytes();
        if data.len() < EHDR_SIZE as usize {
            return Err(Error::malformed("missing ELF header"));
        }
        if data[0..4] != ELF_MAGIC {
            return Err(Error::malformed("not an ELF executable"));
        }
        if data[EI_CLASS] != ELFCLASS32
            || data[EI_DATA] != ELFDATA2LSB
            || data[EI_VERSION] != EV_CURRENT
        {
            return Err(Error::malformed(
                "ELF executable is not 32-bit, little-endian, version 1",
            ));
        }

        let hdr = FileHeader::read(data);

        if hdr.e_type != ET_EXEC && hdr.e_type != ET_DYN {
            return Err(Error::malformed("wrong ELF type"));
        }
        let phdr_end = hdr.e_phoff as u64 + hdr.e_phnum as u64 * hdr.e_phentsize as u64;
        if phdr_end > data.len() as u64 {
            return Err(Error::malformed("missing program headers"));
        }
        let shdr_end = hdr.e_shoff as u64 + hdr.e_shnum as u64 * hdr.e_shentsize as u64;
        if shdr_end > data.len() as u64 {
            return Err(Error::malformed("missing section headers"));
        }
        if hdr.e_phentsize as u32 != PHDR_SIZE {
            return Err(Error::malformed("program headers have wrong size"));
        }
        // The rewrite serializes section headers at the canonical stride,
        // so a nonstandard entry size cannot be edited safely.
        if hdr.e_shentsize as u32 != SHDR_SIZE {
            return Err(Error::malformed("section headers have wrong size"));
        }

        let mut phdrs = Vec::with_capacity(hdr.e_phnum as usize);
        for i in 0..hdr.e_phnum as usize {
            let off = hdr.e_phoff as usize + i * hdr.e_phentsize as usize;
            phdrs.push(ProgramHeader::read(data, off));
        }

        let mut shdrs = Vec::with_capacity(hdr.e_shnum as usize);
        for i in 0..hdr.e_shnum as usize {
            let off = hdr.e_shoff as usize + i * hdr.e_shentsize as usize;
            shdrs.push(SectionHeader::read(data, off));
        }

        // The section-name string table must exist, lie within the file,
        // and end with a NUL so name lookups terminate.
        let shstrndx = hdr.e_shstrndx as usize;
        if shstrndx >= shdrs.len() {
            return Err(Error::malformed("invalid section name string table index"));
        }
        let strtab = &shdrs[shstrndx];
        let start = strtab.sh_offset as usize;
        let end = start + strtab.sh_size as usize;
        if end > data.len() || strtab.sh_size == 0 {
            return Err(Error::malformed("missing section name string table"));
        }
        if data[end - 1] != 0 {
            return Err(Error::malformed(
                "section name string table is not NUL-terminated",
            ));
        }
        let section_names = data[start..end].to_vec();

        Ok(Self {
            image,
            hdr,
            phdrs,
            shdrs,
            section_names,
            replaced: BTreeMap::new(),
            changed: false,
        })
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn bytes(&self) -> &[u8] {
        self.image.bytes()
    }

    /// Name of a section, looked up in the section-name string table.
    pub fn section_name(&self, shdr: &SectionHeader) -> String {
        read_cstr(&self.section_names, shdr.sh_name as usize)
    }

    /// Index of the named section, skipping the reserved null entry.
    pub fn find_section_index(&self, name: &str) -> Option<usize> {
        (1..self.shdrs.len()).find(|&i| self.section_name(&self.shdrs[i]) == name)
    }

    pub fn find_section(&self, name: &str) -> Result<&SectionHeader, Error> {
        self.find_section_index(name)
            .map(|i| &self.shdrs[i])
            .ok_or_else(|| Error::missing_section(name))
    }

    /// The current file bytes of a section, clamped to the file so a
    /// header pointing past the end yields a short (possibly empty) slice
    /// rather than a panic. Not meaningful for a section that has a
    /// replacement pending.
    pub fn section_bytes(&self, shdr: &SectionHeader) -> &[u8] {
        let data = self.image.bytes();
        let start = (shdr.sh_offset as usize).min(data.len());
        let end = (start + shdr.sh_size as usize).min(data.len());
        &data[start..end]
    }

    /// Get the replacement bytes for `name`, resized to exactly `size`.
    ///
    /// A fresh replacement starts from the section's current file bytes;
    /// an existing one keeps its pending contents. Either way the result
    /// is truncated or zero-padded to `size`, and the caller's writes stay
    /// in the replacement until the rewriting engine lays it out.
    pub fn replace_section(&mut self, name: &str, size: usize) -> Result<&mut Vec<u8>, Error> {
        if !self.replaced.contains_key(name) {
            let shdr = *self.find_section(name)?;
            let bytes = self.section_bytes(&shdr).to_vec();
            self.replaced.insert(name.to_string(), bytes);
        }
        let entry = self
            .replaced
            .get_mut(name)
            .ok_or_else(|| Error::missing_section(name))?;
        entry.resize(size, 0);
        Ok(entry)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
