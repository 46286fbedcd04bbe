//! nx2elf converts Nintendo Switch executable containers (NSO, NRO, and raw
//! MOD images) into ELF64 shared objects for static analysis.
//!
//! The pipeline: container bytes → loader (decompress, normalize into a flat
//! image plus NSO-shaped segment table) → structural inference (PLT, GOT
//! boundaries, `.init`/`.fini` lengths, build-id note, exception tables) →
//! ELF emitter. An uncompressed-NSO writer is available alongside the ELF
//! output.

pub mod common;
pub mod container;
pub mod driver;
pub mod eh;
pub mod elf;
pub mod emit;
pub mod infer;
