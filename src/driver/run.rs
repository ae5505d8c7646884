//! The top-level driver: load the file, apply the requested operations,
//! rewrite when something changed, and write the result back atomically.
//!
//! The output goes to a sibling temp file (`<input>_patchelf_tmp`, mode
//! 0700), receives the original file's mode, and is renamed over the
//! input, so a crash mid-write never leaves a corrupted original.

use std::fs;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

use crate::common::error::Error;
use crate::debugln;
use crate::elf::file::ElfFile;
use crate::elf::image::Image;
use crate::ops::rpath::{modify_rpath, RPathOp};

/// The operations one invocation performs, as parsed from the command line.
#[derive(Debug)]
pub struct Request {
    pub print_interpreter: bool,
    pub new_interpreter: Option<String>,
    pub print_rpath: bool,
    pub shrink_rpath: bool,
    pub new_rpath: Option<String>,
    pub debug: bool,
    pub file_name: String,
}

pub fn run(request: &Request) -> Result<(), Error> {
    if !request.print_interpreter && !request.print_rpath {
        debugln!("patching ELF file `{}'", request.file_name);
    }

    let metadata = fs::metadata(&request.file_name).map_err(|e| Error::io("stat", e))?;
    let mode = metadata.permissions().mode();
    let bytes = fs::read(&request.file_name).map_err(|e| Error::io("read", e))?;

    let mut elf = ElfFile::parse(Image::from_bytes(bytes))?;

    if request.print_interpreter {
        println!("{}", elf.get_interpreter()?);
    }
    if let Some(interpreter) = &request.new_interpreter {
        elf.set_interpreter(interpreter)?;
    }
    if request.print_rpath {
        modify_rpath(&mut elf, RPathOp::Print)?;
    }
    if request.shrink_rpath {
        modify_rpath(&mut elf, RPathOp::Shrink)?;
    } else if let Some(rpath) = &request.new_rpath {
        modify_rpath(&mut elf, RPathOp::Set(rpath.clone()))?;
    }

    if elf.is_changed() {
        elf.rewrite_sections()?;
        write_file(&request.file_name, elf.bytes(), mode)?;
    }
    Ok(())
}

/// Write `bytes` next to `path` and atomically rename over it, carrying
/// the original mode.
fn write_file(path: &str, bytes: &[u8], mode: u32) -> Result<(), Error> {
    let tmp_path = format!("{}_patchelf_tmp", path);

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o700)
        .open(&tmp_path)
        .map_err(|e| Error::io("open", e))?;
    file.write_all(bytes).map_err(|e| Error::io("write", e))?;
    drop(file);

    fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))
        .map_err(|e| Error::io("chmod", e))?;
    fs::rename(&tmp_path, path).map_err(|e| Error::io("rename", e))?;
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────────────
