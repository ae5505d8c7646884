//! Failure kinds for the ELF editor.
//!
//! Every error is fatal at the operation boundary: the binary prints the
//! rendered message (prefixed with the failing syscall for I/O errors,
//! perror-style) to stderr and exits with status 1. No partial output file
//! ever replaces the input.

/// The failure classes the tool can report.
#[derive(Debug)]
pub enum Error {
    /// The input is not a well-formed 32-bit little-endian ELF executable
    /// or shared object, or an internal consistency check on it failed.
    Malformed(String),
    /// A `.dynamic` entry or an operation names a section the file does
    /// not contain.
    MissingSection(String),
    /// Reserving space at the start of the image would push the load base
    /// below virtual address zero.
    VirtualAddressUnderrun,
    /// Growth would exceed the headroom reserved when the file was loaded.
    FileTooLarge,
    /// An underlying file-system call failed.
    Io {
        op: &'static str,
        source: std::io::Error,
    },
}

impl Error {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::Malformed(msg.into())
    }

    pub fn missing_section(name: impl Into<String>) -> Self {
        Error::MissingSection(name.into())
    }

    pub fn io(op: &'static str, source: std::io::Error) -> Self {
        Error::Io { op, source }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Malformed(msg) => write!(f, "{}", msg),
            Error::MissingSection(name) => write!(f, "cannot find section {}", name),
            Error::VirtualAddressUnderrun => write!(f, "virtual address space underrun"),
            Error::FileTooLarge => write!(f, "maximum file size exceeded"),
            Error::Io { op, source } => write!(f, "{}: {}", op, source),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
