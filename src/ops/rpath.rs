//! RPATH operations over the `.dynamic` array and the `.dynstr` table.
//!
//! The RPATH lives in `.dynstr`, referenced by the `DT_RPATH` entry's
//! byte offset. Editing never reuses the old string: its bytes are wiped
//! with `'X'` first, so consumers hashing the file contents stop seeing
//! the old paths. A replacement that fits goes into the wiped slot; a
//! longer one is appended to a grown `.dynstr`, growing `.dynamic` too
//! when the file had no `DT_RPATH` entry at all.

use crate::common::error::Error;
use crate::debugln;
use crate::elf::defs::{
    read_cstr, read_i32, read_u32, w32, w32i, SectionHeader, DT_NEEDED, DT_NULL, DT_RPATH,
    DT_STRTAB, DYN_SIZE,
};
use crate::elf::file::ElfFile;

/// What to do with the RPATH. The payload is only meaningful for `Set`.
pub enum RPathOp {
    Print,
    Shrink,
    Set(String),
}

/// The `DT_RPATH` entry as found in the file.
struct RPathEntry {
    /// File offset of the dynamic entry itself.
    entry_offset: usize,
    /// Byte offset of the string inside `.dynstr`.
    strtab_offset: u32,
    value: String,
}

struct DynamicInfo {
    dynamic: SectionHeader,
    dynstr: SectionHeader,
    needed: Vec<String>,
    rpath: Option<RPathEntry>,
}

impl ElfFile {
    fn read_dynamic_info(&self) -> Result<DynamicInfo, Error> {
        let dynamic = *self.find_section(".dynamic")?;
        let dynstr = *self.find_section(".dynstr")?;

        let data = self.bytes();
        let start = dynamic.sh_offset as usize;
        let end = start + dynamic.sh_size as usize;
        if end > data.len() {
            return Err(Error::malformed(".dynamic extends past the end of the file"));
        }

        let mut strtab_addr = None;
        let mut needed_offsets = Vec::new();
        let mut rpath_raw = None;
        let mut pos = start;
        loop {
            if pos + DYN_SIZE as usize > end {
                return Err(Error::malformed("missing DT_NULL terminator in .dynamic"));
            }
            let tag = read_i32(data, pos);
            if tag == DT_NULL {
                break;
            }
            let val = read_u32(data, pos + 4);
            match tag {
                DT_STRTAB => strtab_addr = Some(val),
                DT_NEEDED => needed_offsets.push(val),
                DT_RPATH => rpath_raw = Some((pos, val)),
                _ => {}
            }
            pos += DYN_SIZE as usize;
        }

        // The string table the entries reference must be .dynstr; the
        // offsets below are interpreted relative to that section.
        let strtab_addr = strtab_addr.ok_or_else(|| Error::malformed("strange: no string table"))?;
        if strtab_addr != dynstr.sh_addr {
            return Err(Error::malformed("DT_STRTAB does not point at .dynstr"));
        }

        let strtab = self.section_bytes(&dynstr);
        let needed = needed_offsets
            .iter()
            .map(|&off| read_cstr(strtab, off as usize))
            .collect();
        let rpath = rpath_raw.map(|(pos, val)| RPathEntry {
            entry_offset: pos,
            strtab_offset: val,
            value: read_cstr(strtab, val as usize),
        });

        Ok(DynamicInfo {
            dynamic,
            dynstr,
            needed,
            rpath,
        })
    }
}

/// Print, shrink, or replace the RPATH of the file.
pub fn modify_rpath(elf: &mut ElfFile, op: RPathOp) -> Result<(), Error> {
    let info = elf.read_dynamic_info()?;
    let current = info
        .rpath
        .as_ref()
        .map(|r| r.value.clone())
        .unwrap_or_default();

    let new_rpath = match op {
        RPathOp::Print => {
            println!("{}", current);
            return Ok(());
        }
        RPathOp::Shrink => {
            if info.rpath.is_none() {
                debugln!("no RPATH to shrink");
                return Ok(());
            }
            shrink_rpath(&current, &info.needed)
        }
        RPathOp::Set(s) => s,
    };

    if new_rpath == current {
        return Ok(());
    }
    elf.changed = true;

    // Wipe the old string so the retired paths no longer appear anywhere
    // in the file, then reuse its slot when the new path fits. The slot is
    // reusable only when the old string was NUL-terminated inside .dynstr.
    let mut old_slot = None;
    if let Some(entry) = &info.rpath {
        let bytes = elf.image.bytes_mut();
        let sec_start = info.dynstr.sh_offset as usize;
        let sec_end = (sec_start + info.dynstr.sh_size as usize).min(bytes.len());
        let start = sec_start + entry.strtab_offset as usize;
        if start < sec_end {
            let mut old_len = 0;
            while start + old_len < sec_end && bytes[start + old_len] != 0 {
                old_len += 1;
            }
            bytes[start..start + old_len].fill(b'X');
            if start + old_len < sec_end {
                old_slot = Some((start, old_len));
            }
        }
    }

    debugln!("new rpath is `{}'", new_rpath);

    if let Some((start, old_len)) = old_slot {
        if new_rpath.len() <= old_len {
            let bytes = elf.image.bytes_mut();
            bytes[start..start + new_rpath.len()].copy_from_slice(new_rpath.as_bytes());
            bytes[start + new_rpath.len()] = 0;
            return Ok(());
        }
    }

    // Too long for the old slot: grow .dynstr and append at its old end.
    debugln!("rpath is too long, resizing...");
    let old_dynstr_size = info.dynstr.sh_size as usize;
    let section = elf.replace_section(".dynstr", old_dynstr_size + new_rpath.len() + 1)?;
    section[old_dynstr_size..old_dynstr_size + new_rpath.len()]
        .copy_from_slice(new_rpath.as_bytes());
    section[old_dynstr_size + new_rpath.len()] = 0;
    let new_offset = old_dynstr_size as u32;

    if let Some(entry) = &info.rpath {
        w32(elf.image.bytes_mut(), entry.entry_offset + 4, new_offset);
    } else {
        // No DT_RPATH entry yet: grow .dynamic by one slot and splice a
        // fresh entry in front of the terminator.
        let old_dynamic_size = info.dynamic.sh_size as usize;
        let section = elf.replace_section(".dynamic", old_dynamic_size + DYN_SIZE as usize)?;
        let mut idx = 0;
        let pos = loop {
            let pos = idx * DYN_SIZE as usize;
            if pos + 2 * DYN_SIZE as usize > section.len() {
                return Err(Error::malformed("missing DT_NULL terminator in .dynamic"));
            }
            if read_i32(section, pos) == DT_NULL {
                break pos;
            }
            idx += 1;
        };
        debugln!("DT_NULL index is {}", idx);
        w32i(section, pos, DT_RPATH);
        w32(section, pos + 4, new_offset);
        w32i(section, pos + DYN_SIZE as usize, DT_NULL);
        w32(section, pos + DYN_SIZE as usize + 4, 0);
    }

    Ok(())
}

/// Drop every absolute RPATH directory that contributes no still-needed
/// library. Relative entries (notably `$ORIGIN`) survive unconditionally,
/// in their original order.
fn shrink_rpath(rpath: &str, needed: &[String]) -> String {
    let mut found = vec![false; needed.len()];
    let mut new_rpath = String::new();
    if rpath.is_empty() {
        return new_rpath;
    }
    for dir in rpath.split(':') {
        if !dir.starts_with('/') {
            concat_to_rpath(&mut new_rpath, dir);
            continue;
        }
        let mut lib_found = false;
        for (i, lib) in needed.iter().enumerate() {
            if found[i] {
                continue;
            }
            let candidate = format!("{}/{}", dir, lib);
            if std::fs::metadata(&candidate).is_ok() {
                found[i] = true;
                lib_found = true;
            }
        }
        if lib_found {
            concat_to_rpath(&mut new_rpath, dir);
        } else {
            debugln!("removing directory `{}' from RPATH", dir);
        }
    }
    new_rpath
}

fn concat_to_rpath(rpath: &mut String, path: &str) {
    if !rpath.is_empty() {
        rpath.push(':');
    }
    rpath.push_str(path);
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::defs::PT_DYNAMIC;
    use crate::elf::fixture::Fixture;
    use crate::elf::image::Image;
    use std::path::PathBuf;

    fn parse(bytes: Vec<u8>) -> ElfFile {
        ElfFile::parse(Image::from_bytes(bytes)).unwrap()
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    /// Temporary directory holding stub libraries, removed on drop.
    struct LibDir {
        path: PathBuf,
    }

    impl LibDir {
        fn new(tag: &str, libs: &[&str]) -> Self {
            let path = std::env::temp_dir().join(format!(
                "patchelf_test_{}_{}",
                std::process::id(),
                tag
            ));
            std::fs::create_dir_all(&path).unwrap();
            for lib in libs {
                std::fs::write(path.join(lib), b"stub").unwrap();
            }
            Self { path }
        }

        fn as_str(&self) -> &str {
            self.path.to_str().unwrap()
        }
    }

    impl Drop for LibDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn test_read_dynamic_info() {
        let fixture = Fixture {
            rpath: Some("/opt/lib".to_string()),
            ..Fixture::default()
        };
        let elf = parse(fixture.build());
        let info = elf.read_dynamic_info().unwrap();
        assert_eq!(info.needed, vec!["libfoo.so.1".to_string()]);
        let entry = info.rpath.unwrap();
        assert_eq!(entry.value, "/opt/lib");
        assert_eq!(entry.strtab_offset, fixture.rpath_strtab_offset());
    }

    #[test]
    fn test_set_rpath_identity_is_untouched() {
        let fixture = Fixture {
            rpath: Some("/opt/lib".to_string()),
            ..Fixture::default()
        };
        let bytes = fixture.build();
        let mut elf = parse(bytes.clone());
        modify_rpath(&mut elf, RPathOp::Set("/opt/lib".to_string())).unwrap();
        assert!(!elf.is_changed());
        elf.rewrite_sections().unwrap();
        assert_eq!(elf.bytes(), bytes.as_slice());
    }

    #[test]
    fn test_set_shorter_rpath_reuses_wiped_slot() {
        let fixture = Fixture {
            rpath: Some("/quite/long/library/path".to_string()),
            ..Fixture::default()
        };
        let mut elf = parse(fixture.build());
        modify_rpath(&mut elf, RPathOp::Set("/x".to_string())).unwrap();
        assert!(elf.is_changed());
        elf.rewrite_sections().unwrap();

        let out = parse(elf.bytes().to_vec());
        let info = out.read_dynamic_info().unwrap();
        assert_eq!(info.rpath.unwrap().value, "/x");
        // The old path is gone; its tail is still wiped with filler.
        assert!(!contains(out.bytes(), b"/quite/long/library/path"));
        assert!(contains(out.bytes(), b"/x\0XXXX"));
    }

    #[test]
    fn test_set_longer_rpath_grows_dynstr() {
        let fixture = Fixture {
            rpath: Some("/old".to_string()),
            ..Fixture::default()
        };
        let old_dynstr_size = {
            let elf = parse(fixture.build());
            elf.find_section(".dynstr").unwrap().sh_size
        };

        let mut elf = parse(fixture.build());
        let long = "/first/directory:/second/directory";
        modify_rpath(&mut elf, RPathOp::Set(long.to_string())).unwrap();
        elf.rewrite_sections().unwrap();

        let out = parse(elf.bytes().to_vec());
        let info = out.read_dynamic_info().unwrap();
        let entry = info.rpath.unwrap();
        assert_eq!(entry.value, long);
        // Appended at the old end of .dynstr.
        assert_eq!(entry.strtab_offset, old_dynstr_size);
        assert_eq!(
            out.find_section(".dynstr").unwrap().sh_size,
            old_dynstr_size + long.len() as u32 + 1
        );
        // The old string was wiped before the table moved.
        assert!(!contains(out.bytes(), b"/old"));
    }

    #[test]
    fn test_set_rpath_creates_missing_entry() {
        let mut elf = parse(Fixture::default().build());
        assert!(elf.read_dynamic_info().unwrap().rpath.is_none());
        let old_entries = elf.find_section(".dynamic").unwrap().sh_size / DYN_SIZE;

        modify_rpath(&mut elf, RPathOp::Set("/foo".to_string())).unwrap();
        elf.rewrite_sections().unwrap();

        let out = parse(elf.bytes().to_vec());
        let info = out.read_dynamic_info().unwrap();
        assert_eq!(info.rpath.unwrap().value, "/foo");
        let dynamic = *out.find_section(".dynamic").unwrap();
        assert_eq!(dynamic.sh_size / DYN_SIZE, old_entries + 1);

        // PT_DYNAMIC tracks the relocated section.
        let pt = out.phdrs.iter().find(|p| p.p_type == PT_DYNAMIC).unwrap();
        assert_eq!(pt.p_offset, dynamic.sh_offset);
        assert_eq!(pt.p_vaddr, dynamic.sh_addr);
        assert_eq!(pt.p_filesz, dynamic.sh_size);
    }

    #[test]
    fn test_shrink_without_rpath_is_untouched() {
        let bytes = Fixture::default().build();
        let mut elf = parse(bytes.clone());
        modify_rpath(&mut elf, RPathOp::Shrink).unwrap();
        assert!(!elf.is_changed());
        assert_eq!(elf.bytes(), bytes.as_slice());
    }

    #[test]
    fn test_shrink_drops_useless_directories() {
        let libs = LibDir::new("shrink", &["libfoo.so.1"]);
        let rpath = format!("{}:/definitely/not/there", libs.as_str());
        let fixture = Fixture {
            rpath: Some(rpath),
            ..Fixture::default()
        };
        let mut elf = parse(fixture.build());
        modify_rpath(&mut elf, RPathOp::Shrink).unwrap();
        elf.rewrite_sections().unwrap();

        let out = parse(elf.bytes().to_vec());
        let info = out.read_dynamic_info().unwrap();
        assert_eq!(info.rpath.unwrap().value, libs.as_str());
        assert!(!contains(out.bytes(), b"/definitely/not/there"));
    }

    #[test]
    fn test_shrink_keeps_origin_and_relative_entries() {
        let rpath = "$ORIGIN/../lib:/nowhere".to_string();
        let fixture = Fixture {
            rpath: Some(rpath),
            ..Fixture::default()
        };
        let mut elf = parse(fixture.build());
        modify_rpath(&mut elf, RPathOp::Shrink).unwrap();

        let info = elf.read_dynamic_info().unwrap();
        assert_eq!(info.rpath.unwrap().value, "$ORIGIN/../lib");
    }

    #[test]
    fn test_shrink_satisfied_directory_not_rechecked() {
        // Both directories hold the needed library; the second one brings
        // nothing new and is dropped.
        let first = LibDir::new("first", &["libfoo.so.1"]);
        let second = LibDir::new("second", &["libfoo.so.1"]);
        let rpath = format!("{}:{}", first.as_str(), second.as_str());
        let fixture = Fixture {
            rpath: Some(rpath),
            ..Fixture::default()
        };
        let mut elf = parse(fixture.build());
        modify_rpath(&mut elf, RPathOp::Shrink).unwrap();

        let info = elf.read_dynamic_info().unwrap();
        assert_eq!(info.rpath.unwrap().value, first.as_str());
    }

    #[test]
    fn test_shrink_no_change_when_all_directories_contribute() {
        let libs = LibDir::new("keep", &["libfoo.so.1"]);
        let fixture = Fixture {
            rpath: Some(libs.as_str().to_string()),
            ..Fixture::default()
        };
        let bytes = fixture.build();
        let mut elf = parse(bytes.clone());
        modify_rpath(&mut elf, RPathOp::Shrink).unwrap();
        assert!(!elf.is_changed());
        assert_eq!(elf.bytes(), bytes.as_slice());
    }

    #[test]
    fn test_shrink_helper_orders_and_marks() {
        let needed = vec!["liba.so".to_string(), "libb.so".to_string()];
        let libs = LibDir::new("helper", &["liba.so", "libb.so"]);
        let rpath = format!("$ORIGIN:{}:/missing", libs.as_str());
        let shrunk = shrink_rpath(&rpath, &needed);
        assert_eq!(shrunk, format!("$ORIGIN:{}", libs.as_str()));
    }
}
