//! Batch conversion driver.
//!
//! Holds the CLI configuration and runs the conversion over a single file or
//! every non-directory child of a directory. Per-file failures are reported
//! to stderr and do not abort the batch; only usage errors make the process
//! exit nonzero.

pub mod cli;
pub mod dump;

use std::fs;
use std::path::Path;

use crate::common::error::Result;
use crate::container::NxFile;
use crate::emit;

/// Conversion driver: configured by `parse_cli_args`, executed by `run`.
pub struct Driver {
    input_path: String,
    elf_path: Option<String>,
    uncompressed_path: Option<String>,
    verbose: bool,
}

impl Driver {
    pub fn new() -> Self {
        Self {
            input_path: String::new(),
            elf_path: None,
            uncompressed_path: None,
            verbose: false,
        }
    }

    /// Convert the configured input. Directory inputs process every
    /// non-directory child in enumeration order.
    pub fn run(&self) -> Result<()> {
        let path = Path::new(&self.input_path);
        if path.is_dir() {
            for entry in fs::read_dir(path)? {
                let child = entry?.path();
                if child.is_dir() {
                    continue;
                }
                if let Err(e) = self.convert_file(&child) {
                    eprintln!("nx2elf: {}: {}", child.display(), e);
                }
            }
        } else if let Err(e) = self.convert_file(path) {
            eprintln!("nx2elf: {}: {}", path.display(), e);
        }
        Ok(())
    }

    fn convert_file(&self, path: &Path) -> Result<()> {
        let file = fs::read(path)?;
        let nx = NxFile::load(file)?;

        println!("{}:", path.display());
        dump::dump_header(&nx, self.verbose);
        if self.verbose {
            dump::dump_elf_info(&nx);
        }

        if let Some(elf_path) = &self.elf_path {
            fs::write(elf_path, emit::elf::write_elf(&nx))?;
        }
        if let Some(nso_path) = &self.uncompressed_path {
            fs::write(nso_path, emit::nso::write_uncompressed_nso(&nx))?;
        }
        Ok(())
    }
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}
