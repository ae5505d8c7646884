use patchelf::common::debug;
use patchelf::driver::cli::{self, Parsed};
use patchelf::driver::run;

fn main() {
    std::process::exit(real_main());
}

fn real_main() -> i32 {
    let args: Vec<String> = std::env::args().collect();

    // PATCHELF_DEBUG turns on progress output as if --debug were given.
    if std::env::var_os("PATCHELF_DEBUG").is_some_and(|v| !v.is_empty()) {
        debug::set_enabled(true);
    }

    let request = match cli::parse_args(&args) {
        Ok(Parsed::Run(request)) => request,
        Ok(Parsed::Done) => return 0,
        Ok(Parsed::Usage) => return 1,
        Err(msg) => {
            eprintln!("patchelf: error: {}", msg);
            return 1;
        }
    };

    if request.debug {
        debug::set_enabled(true);
    }

    match run::run(&request) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("patchelf: error: {}", e);
            1
        }
    }
}
