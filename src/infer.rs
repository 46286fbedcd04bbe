//! Structural inference over the loaded image.
//!
//! The containers carry no section metadata, so section boundaries are
//! recovered from what the code and dynamic data actually look like: the PLT
//! from its AArch64 resolver-thunk instruction pattern, the GOT tables from
//! relocation targets and a pointer back to the dynamic table, and
//! `.init`/`.fini` lengths from their terminating instructions.

use crate::common::util::{memmem, memmem_masked, read_u32};
use crate::container::{NxFile, PltInfo};
use crate::elf::{Elf64Rela, ELF64_RELA_SIZE, R_AARCH64_GLOB_DAT, R_AARCH64_JUMP_SLOT};

/// The 8-instruction PLT resolver thunk that opens every AArch64 `.plt`.
/// Register selectors and page offsets vary between binaries, so part of each
/// instruction is masked out of the comparison.
const PLT_PATTERN: [u32; 8] = [
    0xa9bf7bf0, 0xd00004d0, 0xf9428a11, 0x91144210,
    0xd61f0220, 0xd503201f, 0xd503201f, 0xd503201f,
];
const PLT_MASK: [u32; 8] = [
    0xffffffff, 0x00000000, 0xff000000, 0xff000000,
    0xff000000, 0xffffffff, 0xffffffff, 0xffffffff,
];

/// AArch64 `ret`.
const INSN_RET: u32 = 0xd65f03c0;
/// Opcode mask/value for an unconditional `b`.
const INSN_B_MASK: u32 = 0xff000000;
const INSN_B: u32 = 0x14000000;

/// Locate the `.plt` inside `image[start..start + len]` by masked pattern
/// match on the resolver thunk; first occurrence wins. Each PLT slot is 4
/// instructions and the resolver fills two slots, so the total size is
/// `32 + 16 * n` where `n` is the number of `.rela.plt` entries.
///
/// Returns `None` when there are no PLT relocations or the pattern is absent.
pub fn resolve_plt(image: &[u8], start: usize, len: usize, pltrelsz: u64) -> Option<PltInfo> {
    if pltrelsz == 0 {
        return None;
    }
    let end = (start + len).min(image.len());
    if start >= end {
        return None;
    }
    let needle: Vec<u8> = PLT_PATTERN.iter().flat_map(|w| w.to_le_bytes()).collect();
    let mask: Vec<u8> = PLT_MASK.iter().flat_map(|w| w.to_le_bytes()).collect();
    let found = memmem_masked(&image[start..end], &needle, &mask)?;
    let plt_entry_size = 16u64;
    let plt_entry_count = pltrelsz / ELF64_RELA_SIZE as u64;
    Some(PltInfo {
        addr: (start + found) as u64,
        size: plt_entry_size * 2 + plt_entry_size * plt_entry_count,
    })
}

/// Iterate the RELA entries of a table at image offset `addr` spanning `size`
/// bytes, clamped to the image.
pub fn rela_iter(image: &[u8], addr: u64, size: u64) -> impl Iterator<Item = Elf64Rela> + '_ {
    let base = addr as usize;
    let count = size as usize / ELF64_RELA_SIZE;
    (0..count).map_while(move |i| {
        let off = base.checked_add(i * ELF64_RELA_SIZE)?;
        if off <= image.len().checked_sub(ELF64_RELA_SIZE)? {
            Some(Elf64Rela::parse(image, off))
        } else {
            None
        }
    })
}

/// Highest end address (`r_offset + 8`) of any jump-slot relocation in the
/// JMPREL table, or 0 when there are none. This is where `.got.plt` ends.
pub fn jump_slot_end(nx: &NxFile) -> u64 {
    let mut end = 0u64;
    if nx.dyn_info.jmprel != 0 {
        for rela in rela_iter(&nx.image, nx.dyn_info.jmprel, nx.dyn_info.pltrelsz) {
            if rela.r_type() == R_AARCH64_JUMP_SLOT {
                end = end.max(rela.r_offset + 8);
            }
        }
    }
    end
}

/// Locate the start of `.got` by scanning past the end of `.got.plt` for a
/// pointer back to the dynamic table (the first reserved GOT slot holds the
/// address of `_DYNAMIC`).
pub fn find_got_addr(nx: &NxFile, search_from: u64) -> Option<u64> {
    let start = search_from as usize;
    if start >= nx.image.len() {
        return None;
    }
    let needle = nx.dynamic_off.to_le_bytes();
    memmem(&nx.image[start..], &needle).map(|pos| (start + pos) as u64)
}

/// Highest end address of any GLOB_DAT relocation, bounded below by
/// `got_addr`. This is where `.got` ends.
pub fn glob_dat_end(nx: &NxFile, got_addr: u64) -> u64 {
    let mut end = got_addr;
    for rela in rela_iter(&nx.image, nx.dyn_info.rela, nx.dyn_info.relasz) {
        if rela.r_type() == R_AARCH64_GLOB_DAT {
            end = end.max(rela.r_offset + 8);
        }
    }
    end
}

/// Measure `.init` by scanning forward from its start for the terminating
/// `ret`. Returns the section size in bytes, or `None` when no `ret` exists
/// before the end of the image.
pub fn init_len(image: &[u8], init_addr: u64) -> Option<u64> {
    let start = init_addr as usize;
    if start >= image.len() {
        return None;
    }
    let mut i = 0usize;
    while start + (i + 1) * 4 <= image.len() {
        if read_u32(image, start + i * 4) == INSN_RET {
            return Some(((i + 1) * 4) as u64);
        }
        i += 1;
    }
    None
}

/// Measure `.fini` by scanning its first 32 words for the unconditional
/// branch back into `.text`. Returns the section size in bytes, or `None`
/// when no branch is found within those 32 words.
pub fn fini_len(image: &[u8], fini_addr: u64) -> Option<u64> {
    let start = fini_addr as usize;
    if start >= image.len() {
        return None;
    }
    for i in 0..0x20 {
        if start + (i + 1) * 4 > image.len() {
            break;
        }
        if read_u32(image, start + i * 4) & INSN_B_MASK == INSN_B {
            return Some(((i + 1) * 4) as u64);
        }
    }
    None
}
