//! The section-rewriting engine.
//!
//! Sections whose slots in the file are fixed-size cannot simply grow, so
//! every edited section is carried in the replacement set and the whole
//! group is laid out again in the low region of the file, between the
//! program-header table and the first section that must not move. When
//! that region is too small, the entire image is shifted forward by whole
//! pages and an extra `PT_LOAD` is appended so the loader maps the newly
//! reserved prefix.
//!
//! Invariants maintained throughout: file offset and virtual address stay
//! congruent modulo the page size for every allocated section;
//! `PT_INTERP`/`PT_DYNAMIC`/`PT_PHDR` mirror their section (or table)
//! locations; the address-valued `.dynamic` entries track the sections
//! they name.

use crate::common::error::Error;
use crate::debugln;
use crate::elf::defs::{
    read_i32, round_up, w32, ProgramHeader, DT_HASH, DT_JMPREL, DT_NULL, DT_REL, DT_STRSZ,
    DT_STRTAB, DT_SYMTAB, DT_VERNEED, DT_VERSYM, DYN_SIZE, EHDR_SIZE, PAGE_SIZE, PF_R, PF_W,
    PHDR_SIZE, PT_DYNAMIC, PT_INTERP, PT_LOAD, PT_PHDR, SHDR_SIZE, SHT_PROGBITS,
};
use crate::elf::file::ElfFile;

impl ElfFile {
    /// Lay the replaced sections out again and restore every loader-visible
    /// invariant. A no-op when nothing has been replaced.
    pub fn rewrite_sections(&mut self) -> Result<(), Error> {
        if self.replaced.is_empty() {
            return Ok(());
        }

        for (name, data) in &self.replaced {
            debugln!("replacing section `{}' with size {}", name, data.len());
        }

        // Highest section index with a pending replacement.
        let mut last_replaced = 0;
        for i in 1..self.shdrs.len() {
            let name = self.section_name(&self.shdrs[i]);
            if self.replaced.contains_key(&name) {
                debugln!("using replaced section `{}'", name);
                last_replaced = i;
            }
        }
        if last_replaced == 0 {
            return Err(Error::malformed(
                "replaced section missing from section header table",
            ));
        }
        debugln!("last replaced is {}", last_replaced);
        if last_replaced + 1 >= self.shdrs.len() {
            return Err(Error::malformed("cannot rewrite the last section in the file"));
        }

        let mut start_offset = self.shdrs[last_replaced + 1].sh_offset;
        let mut start_addr = self.shdrs[last_replaced + 1].sh_addr;

        // Absorb the sections below into the replacement set so they can
        // all be relocated together. Stop at the first section that must
        // not move: PROGBITS content other than `.interp` may be the
        // target of absolute references, and the section right after
        // `.dynstr` is left in place so a growing `.dynstr` has room.
        let mut prev_section = String::new();
        for i in 1..=last_replaced {
            let shdr = self.shdrs[i];
            let name = self.section_name(&shdr);
            debugln!("looking at section `{}'", name);
            if (shdr.sh_type == SHT_PROGBITS && name != ".interp") || prev_section == ".dynstr" {
                start_offset = shdr.sh_offset;
                start_addr = shdr.sh_addr;
                break;
            }
            if !self.replaced.contains_key(&name) {
                debugln!("replacing section `{}' which is in the way", name);
                self.replace_section(&name, shdr.sh_size as usize)?;
            }
            prev_section = name;
        }

        debugln!(
            "first reserved offset/addr is 0x{:x}/0x{:x}",
            start_offset,
            start_addr
        );

        if start_addr % PAGE_SIZE != start_offset % PAGE_SIZE {
            return Err(Error::malformed(
                "section offset and address are not page-congruent",
            ));
        }
        // first_page is the virtual address of file offset 0; a file whose
        // image starts below that cannot be mapped.
        if start_addr < start_offset {
            return Err(Error::VirtualAddressUnderrun);
        }
        let mut first_page = start_addr - start_offset;
        debugln!("first page is 0x{:x}", first_page);

        // The low-region writes below assume the section header table sits
        // beyond the reserved prefix.
        if self.hdr.e_shoff < start_offset {
            return Err(Error::malformed(
                "section header table precedes section contents",
            ));
        }

        // Space for the ELF header, the program-header table, and the
        // replaced sections at 4-byte alignment.
        let mut needed_space = EHDR_SIZE + self.phdrs.len() as u32 * PHDR_SIZE;
        for data in self.replaced.values() {
            needed_space += round_up(data.len() as u32, 4);
        }
        debugln!("needed space is {}", needed_space);

        if needed_space > start_offset {
            // The shift appends one more program header, so reserve for it.
            needed_space += PHDR_SIZE;
            debugln!("needed space is {}", needed_space);

            let needed_pages = round_up(needed_space - start_offset, PAGE_SIZE) / PAGE_SIZE;
            debugln!("needed pages is {}", needed_pages);
            if needed_pages * PAGE_SIZE > first_page {
                return Err(Error::VirtualAddressUnderrun);
            }
            first_page -= needed_pages * PAGE_SIZE;
            start_offset += needed_pages * PAGE_SIZE;

            self.shift_file(needed_pages, first_page)?;
        }

        // Clear the reserved region, then place each replaced section.
        let mut cur_off = EHDR_SIZE + self.phdrs.len() as u32 * PHDR_SIZE;
        self.image.bytes_mut()[cur_off as usize..start_offset as usize].fill(0);

        let replaced = std::mem::take(&mut self.replaced);
        for (name, data) in replaced {
            debugln!("rewriting section `{}' to offset {}", name, cur_off);
            self.image.bytes_mut()[cur_off as usize..cur_off as usize + data.len()]
                .copy_from_slice(&data);

            let idx = self
                .find_section_index(&name)
                .ok_or_else(|| Error::missing_section(&name))?;
            let shdr = &mut self.shdrs[idx];
            shdr.sh_offset = cur_off;
            shdr.sh_addr = first_page + cur_off;
            shdr.sh_size = data.len() as u32;
            shdr.sh_addralign = 4;
            let (offset, addr, size) = (shdr.sh_offset, shdr.sh_addr, shdr.sh_size);

            if name == ".interp" {
                self.sync_segment(PT_INTERP, offset, addr, size);
            }
            if name == ".dynamic" {
                self.sync_segment(PT_DYNAMIC, offset, addr, size);
            }

            cur_off += round_up(data.len() as u32, 4);
        }
        if cur_off != needed_space {
            return Err(Error::malformed(
                "replaced sections do not fill the reserved space",
            ));
        }

        // The PT_PHDR entry, when present, must be first and describe the
        // program-header table itself.
        if self.phdrs[0].p_type == PT_PHDR {
            let filesz = self.phdrs.len() as u32 * PHDR_SIZE;
            let phdr = &mut self.phdrs[0];
            phdr.p_offset = self.hdr.e_phoff;
            phdr.p_vaddr = first_page + self.hdr.e_phoff;
            phdr.p_paddr = phdr.p_vaddr;
            phdr.p_filesz = filesz;
            phdr.p_memsz = filesz;
        }

        // Serialize the decoded headers back into the image.
        let hdr = self.hdr;
        let phoff = hdr.e_phoff as usize;
        let shoff = hdr.e_shoff as usize;
        let buf = self.image.bytes_mut();
        hdr.write(buf);
        for (i, phdr) in self.phdrs.iter().enumerate() {
            phdr.write(buf, phoff + i * PHDR_SIZE as usize);
        }
        for (i, shdr) in self.shdrs.iter().enumerate().skip(1) {
            shdr.write(buf, shoff + i * SHDR_SIZE as usize);
        }

        self.patch_dynamic()
    }

    /// Move the whole image forward by `extra_pages` pages, keeping the
    /// ELF header in place, and cover the freed prefix with a fresh
    /// read-write `PT_LOAD` so the loader maps it.
    fn shift_file(&mut self, extra_pages: u32, start_page: u32) -> Result<(), Error> {
        let shift = extra_pages * PAGE_SIZE;
        self.image.shift_forward(shift as usize, EHDR_SIZE as usize)?;

        // The program-header table moves to directly after the ELF header.
        self.hdr.e_phoff = EHDR_SIZE;
        self.hdr.e_shoff += shift;

        for shdr in &mut self.shdrs {
            shdr.sh_offset += shift;
        }
        for phdr in &mut self.phdrs {
            phdr.p_offset += shift;
        }

        self.phdrs.push(ProgramHeader {
            p_type: PT_LOAD,
            p_offset: 0,
            p_vaddr: start_page,
            p_paddr: start_page,
            p_filesz: shift,
            p_memsz: shift,
            p_flags: PF_R | PF_W,
            p_align: PAGE_SIZE,
        });
        self.hdr.e_phnum += 1;
        Ok(())
    }

    /// Point every program header of the given type at the section that
    /// just moved.
    fn sync_segment(&mut self, p_type: u32, offset: u32, addr: u32, size: u32) {
        for phdr in &mut self.phdrs {
            if phdr.p_type == p_type {
                phdr.p_offset = offset;
                phdr.p_vaddr = addr;
                phdr.p_paddr = addr;
                phdr.p_filesz = size;
                phdr.p_memsz = size;
            }
        }
    }

    fn section_addr(&self, name: &str) -> Result<u32, Error> {
        Ok(self.find_section(name)?.sh_addr)
    }

    /// Rewrite the address-valued `.dynamic` entries to the relocated
    /// section addresses. A section is required only when the
    /// corresponding tag is present.
    fn patch_dynamic(&mut self) -> Result<(), Error> {
        let dynamic = *self.find_section(".dynamic")?;
        let start = dynamic.sh_offset as usize;
        let end = start + dynamic.sh_size as usize;
        if end > self.image.len() {
            return Err(Error::malformed(".dynamic extends past the end of the file"));
        }

        let mut pos = start;
        loop {
            if pos + DYN_SIZE as usize > end {
                return Err(Error::malformed("missing DT_NULL terminator in .dynamic"));
            }
            let tag = read_i32(self.image.bytes(), pos);
            if tag == DT_NULL {
                break;
            }
            let new_val = match tag {
                DT_STRTAB => Some(self.section_addr(".dynstr")?),
                DT_STRSZ => Some(self.find_section(".dynstr")?.sh_size),
                DT_SYMTAB => Some(self.section_addr(".dynsym")?),
                DT_HASH => Some(self.section_addr(".hash")?),
                DT_JMPREL => Some(self.section_addr(".rel.plt")?),
                DT_REL => {
                    // Some linkers emit .rel.got instead of .rel.dyn.
                    let idx = self
                        .find_section_index(".rel.dyn")
                        .or_else(|| self.find_section_index(".rel.got"))
                        .ok_or_else(|| Error::missing_section(".rel.dyn or .rel.got"))?;
                    Some(self.shdrs[idx].sh_addr)
                }
                DT_VERNEED => Some(self.section_addr(".gnu.version_r")?),
                DT_VERSYM => Some(self.section_addr(".gnu.version")?),
                _ => None,
            };
            if let Some(val) = new_val {
                w32(self.image.bytes_mut(), pos + 4, val);
            }
            pos += DYN_SIZE as usize;
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::defs::{read_u16, read_u32, ET_DYN, SHF_ALLOC};
    use crate::elf::fixture::Fixture;
    use crate::elf::image::Image;

    fn parse(bytes: Vec<u8>) -> ElfFile {
        ElfFile::parse(Image::from_bytes(bytes)).unwrap()
    }

    #[test]
    fn test_rewrite_without_replacements_is_noop() {
        let bytes = Fixture::default().build();
        let mut elf = parse(bytes.clone());
        elf.rewrite_sections().unwrap();
        assert_eq!(elf.bytes(), bytes.as_slice());
    }

    #[test]
    fn test_rewrite_relocates_shrunk_section_in_place() {
        let mut elf = parse(Fixture::default().build());
        let old_len = elf.bytes().len();
        elf.replace_section(".interp", 3).unwrap();
        elf.rewrite_sections().unwrap();

        // A shorter .interp fits in the existing gap: no shift.
        assert_eq!(elf.bytes().len(), old_len);

        let out = parse(elf.bytes().to_vec());
        let interp = *out.find_section(".interp").unwrap();
        assert_eq!(interp.sh_offset, EHDR_SIZE + 4 * PHDR_SIZE);
        assert_eq!(interp.sh_size, 3);
        assert_eq!(interp.sh_addralign, 4);

        // PT_INTERP mirrors the section.
        let pt = out.phdrs.iter().find(|p| p.p_type == PT_INTERP).unwrap();
        assert_eq!(pt.p_offset, interp.sh_offset);
        assert_eq!(pt.p_vaddr, interp.sh_addr);
        assert_eq!(pt.p_filesz, 3);
        assert_eq!(pt.p_memsz, 3);
    }

    #[test]
    fn test_rewrite_shifts_when_region_too_small() {
        let fixture = Fixture::default();
        let mut elf = parse(fixture.build());
        let old_len = elf.bytes().len();
        let old_shoff = elf.hdr.e_shoff;
        let old_text_offset = elf.find_section(".text").unwrap().sh_offset;

        elf.replace_section(".interp", 100).unwrap();
        elf.rewrite_sections().unwrap();

        assert_eq!(elf.bytes().len(), old_len + PAGE_SIZE as usize);

        let data = elf.bytes();
        // Program-header table rebased to right after the ELF header.
        assert_eq!(read_u32(data, 28), EHDR_SIZE);
        assert_eq!(read_u16(data, 44), 5);
        assert_eq!(read_u32(data, 32), old_shoff + PAGE_SIZE);

        let out = parse(data.to_vec());
        // The appended segment maps the reserved prefix read-write.
        let extra = out.phdrs.last().unwrap();
        assert_eq!(extra.p_type, PT_LOAD);
        assert_eq!(extra.p_offset, 0);
        assert_eq!(extra.p_vaddr, fixture.base_addr - PAGE_SIZE);
        assert_eq!(extra.p_filesz, PAGE_SIZE);
        assert_eq!(extra.p_memsz, PAGE_SIZE);
        assert_eq!(extra.p_flags, PF_R | PF_W);
        assert_eq!(extra.p_align, PAGE_SIZE);

        // Sections that stayed behind moved forward with the image.
        let text = out.find_section(".text").unwrap();
        assert_eq!(text.sh_offset, old_text_offset + PAGE_SIZE);

        // The relocated .interp landed below the old start of the file.
        let interp = out.find_section(".interp").unwrap();
        assert_eq!(interp.sh_offset, EHDR_SIZE + 5 * PHDR_SIZE);
        assert_eq!(interp.sh_addr, fixture.base_addr - PAGE_SIZE + interp.sh_offset);
    }

    #[test]
    fn test_rewrite_keeps_page_congruence() {
        let mut elf = parse(Fixture::default().build());
        elf.replace_section(".interp", 100).unwrap();
        elf.rewrite_sections().unwrap();

        let out = parse(elf.bytes().to_vec());
        for shdr in out.shdrs.iter().skip(1) {
            if shdr.sh_flags & SHF_ALLOC != 0 {
                assert_eq!(
                    shdr.sh_offset % PAGE_SIZE,
                    shdr.sh_addr % PAGE_SIZE,
                    "section {} lost page congruence",
                    out.section_name(shdr)
                );
            }
        }
    }

    #[test]
    fn test_rewrite_updates_pt_phdr() {
        let mut elf = parse(Fixture::default().build());
        elf.replace_section(".interp", 100).unwrap();
        elf.rewrite_sections().unwrap();

        let out = parse(elf.bytes().to_vec());
        let phdr = &out.phdrs[0];
        assert_eq!(phdr.p_type, PT_PHDR);
        assert_eq!(phdr.p_offset, EHDR_SIZE);
        assert_eq!(phdr.p_filesz, 5 * PHDR_SIZE);
        assert_eq!(phdr.p_vaddr, out.find_section(".interp").unwrap().sh_addr - 5 * PHDR_SIZE);
    }

    #[test]
    fn test_rewrite_patches_dynamic_addresses() {
        let mut elf = parse(Fixture::default().build());
        // Growing .dynstr forces .interp, .hash, and .dynsym along with it.
        elf.replace_section(".dynstr", 200).unwrap();
        elf.rewrite_sections().unwrap();

        let out = parse(elf.bytes().to_vec());
        let dynamic = *out.find_section(".dynamic").unwrap();
        let dynstr = *out.find_section(".dynstr").unwrap();
        let dynsym = *out.find_section(".dynsym").unwrap();
        let hash = *out.find_section(".hash").unwrap();

        let data = out.bytes();
        let mut pos = dynamic.sh_offset as usize;
        let mut seen = 0;
        loop {
            let tag = read_i32(data, pos);
            if tag == DT_NULL {
                break;
            }
            let val = read_u32(data, pos + 4);
            match tag {
                DT_STRTAB => {
                    assert_eq!(val, dynstr.sh_addr);
                    seen += 1;
                }
                DT_STRSZ => {
                    assert_eq!(val, 200);
                    seen += 1;
                }
                DT_SYMTAB => {
                    assert_eq!(val, dynsym.sh_addr);
                    seen += 1;
                }
                DT_HASH => {
                    assert_eq!(val, hash.sh_addr);
                    seen += 1;
                }
                _ => {}
            }
            pos += DYN_SIZE as usize;
        }
        assert_eq!(seen, 4);
    }

    #[test]
    fn test_rewrite_underrun_when_no_address_space() {
        // A load base of zero leaves no room to grow downward.
        let fixture = Fixture {
            base_addr: 0,
            e_type: ET_DYN,
            ..Fixture::default()
        };
        let mut elf = parse(fixture.build());
        elf.replace_section(".interp", 100).unwrap();
        let err = elf.rewrite_sections().unwrap_err();
        assert!(matches!(err, Error::VirtualAddressUnderrun));
    }

    #[test]
    fn test_rewrite_rejects_early_section_header_table() {
        let mut elf = parse(Fixture::default().build());
        elf.replace_section(".interp", 3).unwrap();
        elf.hdr.e_shoff = 64;
        let err = elf.rewrite_sections().unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }
}
