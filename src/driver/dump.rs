//! Human-readable dumps of a loaded container: the header summary printed
//! for every file, and the verbose dynamic-table / relocation / symbol
//! listing.

use crate::common::util::read_cstr;
use crate::container::{NxFile, NUM_SEGMENTS, RODATA};
use crate::elf::{Elf64Dyn, ELF64_DYN_SIZE};
use crate::infer;

const SEGMENT_PROT: [&str; NUM_SEGMENTS] = ["r-x", "r--", "rw-"];

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Print the canonical header summary: build id, segment table, the
/// rodata-relative dynstr/dynsym extents, and the segment digests.
pub fn dump_header(nx: &NxFile, verbose: bool) {
    let header = &nx.header;
    if verbose {
        println!("field_4: {:8x}", header.field_4);
        println!("field_8: {:8x}", header.field_8);
        println!("flags: {:8x}", header.flags);
    }

    println!("gnu_build_id: {}", hex(&header.gnu_build_id));

    println!(
        "         {:<8} {:<8} {:<8} {:<8} {:<8}",
        "file off", "file len", "mem off", "mem len", "bss/algn"
    );
    for i in 0..NUM_SEGMENTS {
        let seg = &header.segments[i];
        println!(
            "{} [{:<3}]: {:8x} {:8x} {:8x} {:8x} {:8x}",
            i,
            SEGMENT_PROT[i],
            seg.file_offset,
            header.segment_file_sizes[i],
            seg.mem_offset,
            seg.mem_size,
            seg.bss_align
        );
    }

    if verbose {
        for (i, field) in header.field_6c.iter().enumerate() {
            println!("field_6c[{}]: {:8x}", i, field);
        }
    }

    println!(".rodata-relative:");
    println!("  .dynstr: {:8x} {:8x}", header.dynstr.offset, header.dynstr.size);
    println!("  .dynsym: {:8x} {:8x}", header.dynsym.offset, header.dynsym.size);

    println!("segment digests:");
    for i in 0..NUM_SEGMENTS {
        println!("{} [{:<3}]: {}", i, SEGMENT_PROT[i], hex(&header.segment_digests[i]));
    }
}

/// Print the dynamic table, both relocation tables, and every dynamic
/// symbol with its name resolved through `.dynstr`.
pub fn dump_elf_info(nx: &NxFile) {
    println!("dynamic:");
    let mut off = nx.dynamic_off as usize;
    while off + ELF64_DYN_SIZE <= nx.image.len() {
        let dyn_entry = Elf64Dyn::parse(&nx.image, off);
        if dyn_entry.d_tag == 0 {
            break;
        }
        println!("{:16x} {:16x}", dyn_entry.d_tag, dyn_entry.d_val);
        off += ELF64_DYN_SIZE;
    }

    println!("rela:");
    for rela in infer::rela_iter(&nx.image, nx.dyn_info.rela, nx.dyn_info.relasz) {
        println!(
            "{:16x} {:8x} {:8x} {:16x}",
            rela.r_offset,
            rela.r_sym(),
            rela.r_type(),
            rela.r_addend
        );
    }
    println!("jmprel:");
    for rela in infer::rela_iter(&nx.image, nx.dyn_info.jmprel, nx.dyn_info.pltrelsz) {
        println!(
            "{:16x} {:8x} {:8x} {:16x}",
            rela.r_offset,
            rela.r_sym(),
            rela.r_type(),
            rela.r_addend
        );
    }

    println!("symbols:");
    let dynstr_base =
        nx.header.segments[RODATA].mem_offset as usize + nx.header.dynstr.offset as usize;
    for (_, sym) in nx.dynsym_iter() {
        let name = read_cstr(&nx.image, dynstr_base + sym.st_name as usize);
        println!(
            "{:x} {:x} {:x} {:4x} {:16x} {:16x} {}",
            sym.bind(),
            sym.sym_type(),
            sym.visibility(),
            sym.st_shndx,
            sym.st_value,
            sym.st_size,
            name
        );
    }
}
