//! Error type for the conversion pipeline.
//!
//! Fatal errors abort the current input file; when converting a directory the
//! driver reports them and moves on to the next file. Soft per-section
//! inference failures are not represented here: those print a diagnostic to
//! stderr and the section is simply skipped.

use std::fmt;
use std::io;

/// A fatal error while loading a container or writing its outputs.
#[derive(Debug)]
pub enum Error {
    /// Underlying file I/O failed.
    Io(io::Error),
    /// No recognized container magic was found.
    BadMagic { what: &'static str },
    /// The file is too small to hold a declared structure.
    TruncatedHeader { what: &'static str, need: usize, have: usize },
    /// A declared size disagrees with what the file actually holds.
    SizeMismatch { what: &'static str, declared: u64, actual: u64 },
    /// LZ4 decompression failed or produced the wrong number of bytes.
    DecompressFailed { segment: usize, expected: u32 },
    /// A raw MOD input lacks an invariant the segment synthesis relies on.
    UnsupportedContainerShape(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "{}", e),
            Error::BadMagic { what } => write!(f, "no {} magic found", what),
            Error::TruncatedHeader { what, need, have } => {
                write!(f, "truncated {}: need {:#x} bytes, have {:#x}", what, need, have)
            }
            Error::SizeMismatch { what, declared, actual } => {
                write!(f, "{} size mismatch: declared {:#x}, actual {:#x}", what, declared, actual)
            }
            Error::DecompressFailed { segment, expected } => {
                write!(f, "segment {} failed to decompress to {:#x} bytes", segment, expected)
            }
            Error::UnsupportedContainerShape(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
