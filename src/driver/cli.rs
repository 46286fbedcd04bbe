//! CLI argument parsing.
//!
//! Design: a simple `while` loop with a flat `match` on each argument. No
//! external parser library is used; the surface is two output options, a
//! verbosity switch, and one positional input path.

use super::Driver;

const USAGE: &str =
    "Usage: nx2elf <file or directory> [--export-uncompressed <path>] [--export-elf <path>] [--verbose]";

impl Driver {
    /// Parse command-line arguments and populate driver fields.
    /// Returns `Ok(true)` if an early exit was handled (`--help`),
    /// `Ok(false)` if conversion should proceed, or `Err` for usage errors
    /// (which also print the usage text to stderr).
    pub fn parse_cli_args(&mut self, args: &[String]) -> Result<bool, String> {
        if args.len() < 2 {
            eprintln!("{}", USAGE);
            return Err("no input path".to_string());
        }
        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--export-elf" => {
                    i += 1;
                    self.elf_path = Some(Self::option_value(args, i, "--export-elf")?);
                }
                "--export-uncompressed" => {
                    i += 1;
                    self.uncompressed_path =
                        Some(Self::option_value(args, i, "--export-uncompressed")?);
                }
                "--verbose" => self.verbose = true,
                "--help" | "-h" => {
                    println!("{}", USAGE);
                    return Ok(true);
                }
                arg => {
                    if arg.starts_with('-') || !self.input_path.is_empty() {
                        eprintln!("{}", USAGE);
                        return Err(format!("unknown option: {}", arg));
                    }
                    self.input_path = arg.to_string();
                }
            }
            i += 1;
        }
        if self.input_path.is_empty() {
            eprintln!("{}", USAGE);
            return Err("no input path".to_string());
        }
        Ok(false)
    }

    fn option_value(args: &[String], index: usize, option: &str) -> Result<String, String> {
        args.get(index).cloned().ok_or_else(|| {
            eprintln!("{}", USAGE);
            format!("{} requires a path", option)
        })
    }
}
