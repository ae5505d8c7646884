//! Command-line parsing.
//!
//! A flat loop with a match per argument; no parser library. Flag parsing
//! stops at the first argument that is not a recognized flag, and that
//! argument is taken as the file to edit.

use crate::driver::run::Request;

/// Result of argument parsing.
#[derive(Debug)]
pub enum Parsed {
    /// Operate on a file.
    Run(Request),
    /// A query flag was handled; exit successfully.
    Done,
    /// Usage was printed; exit with status 1.
    Usage,
}

pub fn parse_args(args: &[String]) -> Result<Parsed, String> {
    let program = args.first().map(String::as_str).unwrap_or("patchelf");
    if args.len() <= 1 {
        print_usage(program);
        return Ok(Parsed::Usage);
    }

    // Query flags exit before a filename is required.
    if args[1..].iter().any(|a| a == "--version") {
        println!("patchelf {}", env!("CARGO_PKG_VERSION"));
        return Ok(Parsed::Done);
    }

    let mut request = Request {
        print_interpreter: false,
        new_interpreter: None,
        print_rpath: false,
        shrink_rpath: false,
        new_rpath: None,
        debug: false,
        file_name: String::new(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--set-interpreter" | "--interpreter" => {
                i += 1;
                let arg = args.get(i).ok_or("missing argument")?;
                request.new_interpreter = Some(arg.clone());
            }
            "--print-interpreter" => {
                request.print_interpreter = true;
            }
            "--shrink-rpath" => {
                request.shrink_rpath = true;
            }
            "--set-rpath" => {
                i += 1;
                let arg = args.get(i).ok_or("missing argument")?;
                request.new_rpath = Some(arg.clone());
            }
            "--print-rpath" => {
                request.print_rpath = true;
            }
            "--debug" => {
                request.debug = true;
            }
            _ => break,
        }
        i += 1;
    }

    if i == args.len() {
        return Err("missing filename".to_string());
    }
    request.file_name = args[i].clone();

    Ok(Parsed::Run(request))
}

fn print_usage(program: &str) {
    eprintln!("syntax: {}", program);
    eprintln!("  [--set-interpreter FILENAME]");
    eprintln!("  [--print-interpreter]");
    eprintln!("  [--set-rpath RPATH]");
    eprintln!("  [--shrink-rpath]");
    eprintln!("  [--print-rpath]");
    eprintln!("  [--debug]");
    eprintln!("  FILENAME");
}

// ── Tests ────────────────────────────────────────────────────────────────────
