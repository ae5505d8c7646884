//! Test fixture: a minimal but loader-shaped ELF32 dynamic executable.
//!
//! The image carries the section set the editor cares about (interp, hash,
//! dynsym, dynstr, text, dynamic, got, shstrtab) with consistent program
//! headers, so parser, operations, and the rewriting engine can be
//! exercised end to end from memory.

use crate::elf::defs::*;

pub(crate) struct Fixture {
    pub interp: String,
    pub needed: Vec<String>,
    pub rpath: Option<String>,
    pub base_addr: u32,
    pub e_type: u16,
}

impl Default for Fixture {
    fn default() -> Self {
        Self {
            interp: "/lib/ld-linux.so.2".to_string(),
            needed: vec!["libfoo.so.1".to_string()],
            rpath: None,
            base_addr: 0x0804_8000,
            e_type: ET_EXEC,
        }
    }
}

struct Section {
    name: &'static str,
    sh_type: u32,
    sh_flags: u32,
    sh_link: u32,
    sh_info: u32,
    sh_addralign: u32,
    sh_entsize: u32,
    data: Vec<u8>,
    // assigned during layout
    sh_offset: u32,
    sh_addr: u32,
}

impl Fixture {
    /// Offset of the RPATH string inside `.dynstr`, when one is present.
    /// Strings are laid out as: NUL, needed libraries, RPATH.
    pub fn rpath_strtab_offset(&self) -> u32 {
        let mut off = 1;
        for lib in &self.needed {
            off += lib.len() as u32 + 1;
        }
        off
    }

    pub fn build(&self) -> Vec<u8> {
        let phnum = 4u32;
        let phdrs_end = EHDR_SIZE + phnum * PHDR_SIZE;

        // .dynstr: index 0 is the empty string, then DT_NEEDED names,
        // then the RPATH string.
        let mut dynstr = vec![0u8];
        let mut needed_offs = Vec::new();
        for lib in &self.needed {
            needed_offs.push(dynstr.len() as u32);
            dynstr.extend_from_slice(lib.as_bytes());
            dynstr.push(0);
        }
        let rpath_off = self.rpath.as_ref().map(|r| {
            let off = dynstr.len() as u32;
            dynstr.extend_from_slice(r.as_bytes());
            dynstr.push(0);
            off
        });

        let dyn_count = 4 + needed_offs.len() + rpath_off.is_some() as usize + 1;
        let mut interp_data = self.interp.clone().into_bytes();
        interp_data.push(0);

        let mut sections = vec![
            Section {
                name: ".interp",
                sh_type: SHT_PROGBITS,
                sh_flags: SHF_ALLOC,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 1,
                sh_entsize: 0,
                data: interp_data,
                sh_offset: 0,
                sh_addr: 0,
            },
            Section {
                name: ".hash",
                sh_type: SHT_HASH,
                sh_flags: SHF_ALLOC,
                sh_link: 3,
                sh_info: 0,
                sh_addralign: 4,
                sh_entsize: 4,
                data: vec![0; 8],
                sh_offset: 0,
                sh_addr: 0,
            },
            Section {
                name: ".dynsym",
                sh_type: SHT_DYNSYM,
                sh_flags: SHF_ALLOC,
                sh_link: 4,
                sh_info: 1,
                sh_addralign: 4,
                sh_entsize: 16,
                data: vec![0; 16],
                sh_offset: 0,
                sh_addr: 0,
            },
            Section {
                name: ".dynstr",
                sh_type: SHT_STRTAB,
                sh_flags: SHF_ALLOC,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 1,
                sh_entsize: 0,
                data: dynstr,
                sh_offset: 0,
                sh_addr: 0,
            },
            Section {
                name: ".text",
                sh_type: SHT_PROGBITS,
                sh_flags: SHF_ALLOC | SHF_EXECINSTR,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 4,
                sh_entsize: 0,
                data: vec![0x90; 16],
                sh_offset: 0,
                sh_addr: 0,
            },
            Section {
                name: ".dynamic",
                sh_type: SHT_DYNAMIC,
                sh_flags: SHF_ALLOC | SHF_WRITE,
                sh_link: 4,
                sh_info: 0,
                sh_addralign: 4,
                sh_entsize: 8,
                data: vec![0; dyn_count * DYN_SIZE as usize],
                sh_offset: 0,
                sh_addr: 0,
            },
            Section {
                name: ".got",
                sh_type: SHT_PROGBITS,
                sh_flags: SHF_ALLOC | SHF_WRITE,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 4,
                sh_entsize: 4,
                data: vec![0; 8],
                sh_offset: 0,
                sh_addr: 0,
            },
        ];

        // Lay the allocated sections out right after the program headers.
        let mut cursor = phdrs_end;
        for sec in sections.iter_mut() {
            cursor = round_up(cursor, sec.sh_addralign.max(1));
            sec.sh_offset = cursor;
            sec.sh_addr = self.base_addr + cursor;
            cursor += sec.data.len() as u32;
        }
        let load_end = cursor;

        // Fill in .dynamic now that addresses are known.
        let hash_addr = sections[1].sh_addr;
        let dynsym_addr = sections[2].sh_addr;
        let dynstr_addr = sections[3].sh_addr;
        let dynstr_size = sections[3].data.len() as u32;
        {
            fn put(buf: &mut [u8], pos: &mut usize, tag: i32, val: u32) {
                w32i(buf, *pos, tag);
                w32(buf, *pos + 4, val);
                *pos += DYN_SIZE as usize;
            }
            let dynamic = &mut sections[5].data;
            let mut pos = 0;
            put(dynamic, &mut pos, DT_HASH, hash_addr);
            put(dynamic, &mut pos, DT_STRTAB, dynstr_addr);
            put(dynamic, &mut pos, DT_SYMTAB, dynsym_addr);
            put(dynamic, &mut pos, DT_STRSZ, dynstr_size);
            for off in &needed_offs {
                put(dynamic, &mut pos, DT_NEEDED, *off);
            }
            if let Some(off) = rpath_off {
                put(dynamic, &mut pos, DT_RPATH, off);
            }
            put(dynamic, &mut pos, DT_NULL, 0);
        }

        // Section-name string table, then the section header table.
        let mut shstrtab = vec![0u8];
        let mut name_offs = vec![0u32];
        for sec in &sections {
            name_offs.push(shstrtab.len() as u32);
            shstrtab.extend_from_slice(sec.name.as_bytes());
            shstrtab.push(0);
        }
        let shstrtab_name_off = shstrtab.len() as u32;
        shstrtab.extend_from_slice(b".shstrtab");
        shstrtab.push(0);

        let shstrtab_off = cursor;
        cursor += shstrtab.len() as u32;
        let e_shoff = round_up(cursor, 4);
        let shnum = sections.len() as u32 + 2; // null entry + .shstrtab

        let mut out = vec![0u8; (e_shoff + shnum * SHDR_SIZE) as usize];

        // ELF header.
        out[0..4].copy_from_slice(&ELF_MAGIC);
        out[EI_CLASS] = ELFCLASS32;
        out[EI_DATA] = ELFDATA2LSB;
        out[EI_VERSION] = EV_CURRENT;
        w16(&mut out, 16, self.e_type);
        w16(&mut out, 18, 3); // EM_386
        w32(&mut out, 20, 1); // e_version
        w32(&mut out, 24, sections[4].sh_addr); // e_entry: .text
        w32(&mut out, 28, EHDR_SIZE); // e_phoff
        w32(&mut out, 32, e_shoff);
        w16(&mut out, 40, EHDR_SIZE as u16); // e_ehsize
        w16(&mut out, 42, PHDR_SIZE as u16);
        w16(&mut out, 44, phnum as u16);
        w16(&mut out, 46, SHDR_SIZE as u16);
        w16(&mut out, 48, shnum as u16);
        w16(&mut out, 50, (shnum - 1) as u16); // e_shstrndx

        // Program headers.
        let interp = &sections[0];
        let dynamic = &sections[5];
        let phdrs = [
            ProgramHeader {
                p_type: PT_PHDR,
                p_offset: EHDR_SIZE,
                p_vaddr: self.base_addr + EHDR_SIZE,
                p_paddr: self.base_addr + EHDR_SIZE,
                p_filesz: phnum * PHDR_SIZE,
                p_memsz: phnum * PHDR_SIZE,
                p_flags: PF_R,
                p_align: 4,
            },
            ProgramHeader {
                p_type: PT_INTERP,
                p_offset: interp.sh_offset,
                p_vaddr: interp.sh_addr,
                p_paddr: interp.sh_addr,
                p_filesz: interp.data.len() as u32,
                p_memsz: interp.data.len() as u32,
                p_flags: PF_R,
                p_align: 1,
            },
            ProgramHeader {
                p_type: PT_LOAD,
                p_offset: 0,
                p_vaddr: self.base_addr,
                p_paddr: self.base_addr,
                p_filesz: load_end,
                p_memsz: load_end,
                p_flags: PF_R | PF_X,
                p_align: PAGE_SIZE,
            },
            ProgramHeader {
                p_type: PT_DYNAMIC,
                p_offset: dynamic.sh_offset,
                p_vaddr: dynamic.sh_addr,
                p_paddr: dynamic.sh_addr,
                p_filesz: dynamic.data.len() as u32,
                p_memsz: dynamic.data.len() as u32,
                p_flags: PF_R | PF_W,
                p_align: 4,
            },
        ];
        for (i, phdr) in phdrs.iter().enumerate() {
            phdr.write(&mut out, (EHDR_SIZE + i as u32 * PHDR_SIZE) as usize);
        }

        // Section contents.
        for sec in &sections {
            let start = sec.sh_offset as usize;
            out[start..start + sec.data.len()].copy_from_slice(&sec.data);
        }
        out[shstrtab_off as usize..shstrtab_off as usize + shstrtab.len()]
            .copy_from_slice(&shstrtab);

        // Section headers: null entry, the sections, .shstrtab.
        for (i, sec) in sections.iter().enumerate() {
            let shdr = SectionHeader {
                sh_name: name_offs[i + 1],
                sh_type: sec.sh_type,
                sh_flags: sec.sh_flags,
                sh_addr: sec.sh_addr,
                sh_offset: sec.sh_offset,
                sh_size: sec.data.len() as u32,
                sh_link: sec.sh_link,
                sh_info: sec.sh_info,
                sh_addralign: sec.sh_addralign,
                sh_entsize: sec.sh_entsize,
            };
            shdr.write(&mut out, (e_shoff + (i as u32 + 1) * SHDR_SIZE) as usize);
        }
        let shstrtab_shdr = SectionHeader {
            sh_name: shstrtab_name_off,
            sh_type: SHT_STRTAB,
            sh_offset: shstrtab_off,
            sh_size: shstrtab.len() as u32,
            sh_addralign: 1,
            ..Default::default()
        };
        shstrtab_shdr.write(&mut out, (e_shoff + (shnum - 1) * SHDR_SIZE) as usize);

        out
    }
}
