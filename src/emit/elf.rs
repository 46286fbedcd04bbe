//! ELF emitter: serializes a loaded image into an ELF64 shared object that
//! reconstructs the original memory layout and dynamic linking metadata.
//!
//! Program headers alone would be enough for a dynamic loader, but
//! disassemblers lean heavily on section headers, so the emitter also places
//! every section it can recover. Section indices observed in `.dynsym` are
//! authoritative (symbols reference them by number); everything else goes
//! into the lowest free slot, optionally constrained to come after the
//! segment-shaped section containing it so address-sorted consumers keep the
//! containing segment intact.

use std::collections::BTreeMap;

use crate::common::util::{align_up, read_u32};
use crate::container::{NxFile, NsoHeader, DATA, NUM_SEGMENTS, RODATA, TEXT};
use crate::eh;
use crate::elf::*;
use crate::infer;

/// Which optional sections ended up recoverable for this image.
#[derive(Default)]
struct Present {
    plt: bool,
    got: bool,
    got_plt: bool,
    rela_plt: bool,
    hash: bool,
    gnu_hash: bool,
    init: bool,
    fini: bool,
    init_array: bool,
    fini_array: bool,
    note: bool,
    eh: bool,
}

/// Synthesize a section header for a virtual address by locating it in the
/// segment table: inside a segment gives `.text`/`.rodata`/`.data`, the BSS
/// window just past the data segment gives `.bss`. Returns a `SHT_NULL`
/// header when the address matches nothing.
fn vaddr_to_shdr(header: &NsoHeader, shstrtab: &mut StringTable, vaddr: u64) -> Elf64Shdr {
    let mut shdr = Elf64Shdr::default();
    for i in 0..NUM_SEGMENTS {
        let seg = &header.segments[i];
        let seg_mem_end = seg.mem_offset as u64 + seg.mem_size as u64;
        // sh_offset is fixed up once the program headers are laid out.
        if vaddr >= seg.mem_offset as u64 && vaddr < seg_mem_end {
            let (name, flags) = match i {
                TEXT => (".text", SHF_ALLOC | SHF_EXECINSTR),
                DATA => (".data", SHF_ALLOC | SHF_WRITE),
                _ => (".rodata", SHF_ALLOC),
            };
            shstrtab.add(name);
            shdr.sh_name = shstrtab.offset_of(name);
            shdr.sh_type = SHT_PROGBITS;
            shdr.sh_flags = flags;
            shdr.sh_addr = seg.mem_offset as u64;
            shdr.sh_size = seg.mem_size as u64;
            shdr.sh_addralign = 8;
        } else if i == DATA
            && vaddr >= seg_mem_end
            && vaddr <= seg_mem_end + seg.bss_align as u64
        {
            shstrtab.add(".bss");
            shdr.sh_name = shstrtab.offset_of(".bss");
            shdr.sh_type = SHT_NOBITS;
            shdr.sh_flags = SHF_ALLOC | SHF_WRITE;
            shdr.sh_addr = seg_mem_end;
            shdr.sh_size = seg.bss_align as u64;
            shdr.sh_addralign = 8;
        }
    }
    shdr
}

/// Find the lowest free section slot and place `shdr` there, returning its
/// index (or `SHN_UNDEF` when the table is full). With `ordered`, the scan
/// starts past any known section whose address range contains `shdr.sh_addr`;
/// if that constraint cannot be met the insertion retries unconstrained with
/// a warning.
fn insert_shdr(
    shdrs: &mut [Elf64Shdr],
    known_sections: &BTreeMap<u16, Elf64Shdr>,
    shdr: Elf64Shdr,
    ordered: bool,
) -> u32 {
    let mut start = 1usize;
    if ordered {
        for (&index, known) in known_sections {
            if shdr.sh_addr >= known.sh_addr && shdr.sh_addr < known.sh_addr + known.sh_size {
                start = index as usize + 1;
            }
        }
    }
    loop {
        for i in start..shdrs.len() {
            if shdrs[i].sh_type == SHT_NULL {
                shdrs[i] = shdr;
                return i as u32;
            }
        }
        if ordered && start != 1 {
            eprintln!("warning: failed to meet ordering for sh_addr {:16x}", shdr.sh_addr);
            start = 1;
            continue;
        }
        return SHN_UNDEF as u32;
    }
}

/// Build the output ELF image for a loaded file.
pub fn write_elf(nx: &NxFile) -> Vec<u8> {
    let mut shstrtab = StringTable::new();
    shstrtab.add(".shstrtab");

    // ── Section discovery from dynsym ────────────────────────────────────

    let mut num_shdrs: u16 = 0;
    let mut known_sections: BTreeMap<u16, Elf64Shdr> = BTreeMap::new();
    for (_, sym) in nx.dynsym_iter() {
        if sym.st_shndx >= SHN_LORESERVE {
            continue;
        }
        num_shdrs = num_shdrs.max(sym.st_shndx);
        if sym.st_shndx != SHN_UNDEF && !known_sections.contains_key(&sym.st_shndx) {
            let shdr = vaddr_to_shdr(&nx.header, &mut shstrtab, sym.st_value);
            if shdr.sh_type != SHT_NULL {
                known_sections.insert(sym.st_shndx, shdr);
            } else {
                eprintln!("failed to make shdr for st_shndx {}", sym.st_shndx);
            }
        }
    }

    // Manually add any canonical segment section nothing pointed to (its
    // index is unconstrained, so take the lowest free one).
    if known_sections.len() != NUM_SEGMENTS + 1 {
        fn next_free(known: &BTreeMap<u16, Elf64Shdr>, start: u16) -> u16 {
            for i in start + 1..SHN_LORESERVE {
                if !known.contains_key(&i) {
                    return i;
                }
            }
            SHN_UNDEF
        }
        let mut shndx = next_free(&known_sections, SHN_UNDEF);
        if shndx != SHN_UNDEF
            && shstrtab.offset_of(".text") == 0
            && nx.header.segments[TEXT].mem_size > 0
        {
            let shdr =
                vaddr_to_shdr(&nx.header, &mut shstrtab, nx.header.segments[TEXT].mem_offset as u64);
            known_sections.insert(shndx, shdr);
            shndx = next_free(&known_sections, shndx);
        }
        if shndx != SHN_UNDEF
            && shstrtab.offset_of(".rodata") == 0
            && nx.header.segments[RODATA].mem_size > 0
        {
            let shdr = vaddr_to_shdr(
                &nx.header,
                &mut shstrtab,
                nx.header.segments[RODATA].mem_offset as u64,
            );
            known_sections.insert(shndx, shdr);
            shndx = next_free(&known_sections, shndx);
        }
        if shndx != SHN_UNDEF
            && shstrtab.offset_of(".data") == 0
            && nx.header.segments[DATA].mem_size > 0
        {
            let shdr =
                vaddr_to_shdr(&nx.header, &mut shstrtab, nx.header.segments[DATA].mem_offset as u64);
            known_sections.insert(shndx, shdr);
            shndx = next_free(&known_sections, shndx);
        }
        if shndx != SHN_UNDEF
            && shstrtab.offset_of(".bss") == 0
            && nx.header.segments[DATA].bss_align > 0
        {
            let data_seg = &nx.header.segments[DATA];
            let shdr = vaddr_to_shdr(
                &nx.header,
                &mut shstrtab,
                data_seg.mem_offset as u64 + data_seg.mem_size as u64,
            );
            known_sections.insert(shndx, shdr);
        }
    }
    // +1 to go from index to count
    num_shdrs += 1;

    // ── Optional sections ────────────────────────────────────────────────

    let mut shdrs_needed = known_sections.len() as i64 - num_shdrs as i64;
    // index 0
    shdrs_needed += 1;
    // .shstrtab
    shdrs_needed += 1;
    // Always present: the dynamic table and its string/symbol tables exist in
    // every valid input.
    for name in [".dynstr", ".dynsym", ".dynamic", ".rela.dyn"] {
        shstrtab.add(name);
        shdrs_needed += 1;
    }

    let image = &nx.image;
    let dyn_info = &nx.dyn_info;
    let mut present = Present::default();

    present.plt = nx.plt.is_some();

    let jump_slot_addr_end = infer::jump_slot_end(nx);
    present.got_plt = jump_slot_addr_end != 0 && dyn_info.pltgot != 0;

    let got_addr = if jump_slot_addr_end != 0 {
        infer::find_got_addr(nx, jump_slot_addr_end)
    } else {
        None
    };
    present.got = got_addr.is_some() && dyn_info.rela != 0;

    present.rela_plt = present.got_plt && dyn_info.jmprel != 0 && dyn_info.pltrelsz != 0;

    present.hash = dyn_info.hash != 0;
    if present.hash && dyn_info.hash.checked_add(8).map_or(true, |end| end > image.len() as u64) {
        eprintln!("warning: .hash header out of bounds, skipping");
        present.hash = false;
    }
    present.gnu_hash = dyn_info.gnu_hash != 0;
    if present.gnu_hash
        && dyn_info.gnu_hash.checked_add(16).map_or(true, |end| end > image.len() as u64)
    {
        eprintln!("warning: .gnu.hash header out of bounds, skipping");
        present.gnu_hash = false;
    }

    present.init_array = dyn_info.init_array != 0 && dyn_info.init_arraysz != 0;
    present.fini_array = dyn_info.fini_array != 0 && dyn_info.fini_arraysz != 0;
    present.note = nx.note_off.is_some();

    let mut init_ret_offset = 0u64;
    if dyn_info.init != 0 {
        if let Some(len) = infer::init_len(image, dyn_info.init) {
            init_ret_offset = len;
            present.init = true;
        }
    }
    let mut fini_branch_offset = 0u64;
    if dyn_info.fini != 0 {
        if let Some(len) = infer::fini_len(image, dyn_info.fini) {
            fini_branch_offset = len;
            present.fini = true;
        }
    }

    shdrs_needed += [
        present.plt,
        present.got_plt,
        present.got,
        present.rela_plt,
        present.hash,
        present.gnu_hash,
        present.init_array,
        present.fini_array,
        present.note,
        present.init,
        present.fini,
    ]
    .iter()
    .filter(|&&p| p)
    .count() as i64;

    let mut eh_info = nx.eh;
    if let Some((frame_addr, frame_size)) = eh::measure_frame(image, eh_info.hdr_addr) {
        eh_info.frame_addr = frame_addr;
        eh_info.frame_size = frame_size;
        // The alignment of both sizes is a fudge; the measured values can
        // fall a few bytes short of what the linker originally placed.
        eh_info.hdr_size = align_up(eh_info.hdr_size, 0x10);
        eh_info.frame_size = align_up(eh_info.frame_size, 0x10);
        present.eh = true;
        shdrs_needed += 2;
        shstrtab.add(".eh_frame_hdr");
        shstrtab.add(".eh_frame");
    }

    if present.plt {
        shstrtab.add(".plt");
    }
    if present.got {
        shstrtab.add(".got");
    }
    if present.got_plt {
        shstrtab.add(".got.plt");
    }
    if present.rela_plt {
        shstrtab.add(".rela.plt");
    }
    if present.hash {
        shstrtab.add(".hash");
    }
    if present.gnu_hash {
        shstrtab.add(".gnu.hash");
    }
    if present.init {
        shstrtab.add(".init");
    }
    if present.fini {
        shstrtab.add(".fini");
    }
    if present.init_array {
        shstrtab.add(".init_array");
    }
    if present.fini_array {
        shstrtab.add(".fini_array");
    }
    if present.note {
        shstrtab.add(".note");
    }

    if shdrs_needed > 0 {
        num_shdrs += shdrs_needed as u16;
    }

    // ── Layout ───────────────────────────────────────────────────────────

    // Three PT_LOADs plus the dynamic and EH segments.
    let num_phdrs = NUM_SEGMENTS + 2;

    let mut elf_size = ELF64_EHDR_SIZE
        + ELF64_PHDR_SIZE * num_phdrs
        + ELF64_SHDR_SIZE * num_shdrs as usize;
    let shstrtab_offset = elf_size;
    elf_size += shstrtab.aligned_len();
    for seg in &nx.header.segments {
        elf_size += seg.mem_size as usize;
    }
    let mut elf = vec![0u8; elf_size];

    let e_phoff = ELF64_EHDR_SIZE;
    let e_shoff = e_phoff + ELF64_PHDR_SIZE * num_phdrs;

    write_bytes(&mut elf, 0, &ELF_MAGIC);
    elf[4] = ELFCLASS64;
    elf[5] = ELFDATA2LSB;
    elf[6] = EV_CURRENT;
    elf[7] = ELFOSABI_NONE;
    w16(&mut elf, 0x10, ET_DYN);
    w16(&mut elf, 0x12, EM_AARCH64);
    w32(&mut elf, 0x14, EV_CURRENT as u32);
    w64(&mut elf, 0x18, nx.header.segments[TEXT].mem_offset as u64); // e_entry
    w64(&mut elf, 0x20, e_phoff as u64);
    w64(&mut elf, 0x28, e_shoff as u64);
    w32(&mut elf, 0x30, 0); // e_flags
    w16(&mut elf, 0x34, ELF64_EHDR_SIZE as u16);
    w16(&mut elf, 0x36, ELF64_PHDR_SIZE as u16);
    w16(&mut elf, 0x38, num_phdrs as u16);
    w16(&mut elf, 0x3a, ELF64_SHDR_SIZE as u16);
    w16(&mut elf, 0x3c, num_shdrs);
    // e_shstrndx is filled in once .shstrtab lands in a slot

    write_bytes(&mut elf, shstrtab_offset, shstrtab.as_bytes());

    // ── Program headers ──────────────────────────────────────────────────

    // (p_offset, p_vaddr, p_filesz) of each PT_LOAD, for vaddr lookups.
    let mut loads = [(0u64, 0u64, 0u64); NUM_SEGMENTS];
    let mut data_offset_cur = (shstrtab_offset + shstrtab.aligned_len()) as u64;
    for i in 0..NUM_SEGMENTS {
        let seg = nx.header.segments[i];
        let p_flags = match i {
            TEXT => PF_R | PF_X,
            DATA => PF_R | PF_W,
            _ => PF_R,
        };
        let (p_memsz, p_align) = if i == DATA {
            (seg.mem_size as u64 + seg.bss_align as u64, 1)
        } else {
            (seg.mem_size as u64, seg.bss_align.max(1) as u64)
        };
        write_phdr64(
            &mut elf,
            e_phoff + i * ELF64_PHDR_SIZE,
            PT_LOAD,
            p_flags,
            data_offset_cur,
            seg.mem_offset as u64,
            seg.mem_offset as u64,
            seg.mem_size as u64,
            p_memsz,
            p_align,
        );
        let src = &image[seg.mem_offset as usize..seg.mem_offset as usize + seg.mem_size as usize];
        write_bytes(&mut elf, data_offset_cur as usize, src);

        // Now that the segment has a file offset, fix up the section headers
        // that describe it.
        for shdr in known_sections.values_mut() {
            if shdr.sh_addr == seg.mem_offset as u64 {
                shdr.sh_offset = data_offset_cur;
            }
        }

        loads[i] = (data_offset_cur, seg.mem_offset as u64, seg.mem_size as u64);
        data_offset_cur += seg.mem_size as u64;
    }

    let vaddr_to_foffset = |vaddr: u64| -> u64 {
        for &(p_offset, p_vaddr, p_filesz) in &loads {
            if vaddr >= p_vaddr && vaddr < p_vaddr + p_filesz {
                return p_offset + (vaddr - p_vaddr);
            }
        }
        0
    };

    let dynamic_size = nx.dynamic_entry_count() * ELF64_DYN_SIZE as u64;
    write_phdr64(
        &mut elf,
        e_phoff + NUM_SEGMENTS * ELF64_PHDR_SIZE,
        PT_DYNAMIC,
        PF_R | PF_W,
        vaddr_to_foffset(nx.dynamic_off),
        nx.dynamic_off,
        nx.dynamic_off,
        dynamic_size,
        dynamic_size,
        8,
    );
    write_phdr64(
        &mut elf,
        e_phoff + (NUM_SEGMENTS + 1) * ELF64_PHDR_SIZE,
        PT_GNU_EH_FRAME,
        PF_R,
        vaddr_to_foffset(eh_info.hdr_addr),
        eh_info.hdr_addr,
        eh_info.hdr_addr,
        eh_info.hdr_size,
        eh_info.hdr_size,
        4,
    );

    // ── Section headers ──────────────────────────────────────────────────

    let mut shdrs = vec![Elf64Shdr::default(); num_shdrs as usize];
    for (&index, shdr) in &known_sections {
        if (index as usize) < shdrs.len() {
            shdrs[index as usize] = *shdr;
        } else {
            eprintln!("failed to place shdr for st_shndx {}", index);
        }
    }

    if present.init {
        let shdr = Elf64Shdr {
            sh_name: shstrtab.offset_of(".init"),
            sh_type: SHT_PROGBITS,
            sh_flags: SHF_ALLOC | SHF_EXECINSTR,
            sh_addr: dyn_info.init,
            sh_offset: vaddr_to_foffset(dyn_info.init),
            sh_size: init_ret_offset,
            sh_addralign: 4,
            ..Elf64Shdr::default()
        };
        if insert_shdr(&mut shdrs, &known_sections, shdr, true) == SHN_UNDEF as u32 {
            eprintln!("failed to insert new shdr for .init");
        }
    }

    if present.fini {
        let shdr = Elf64Shdr {
            sh_name: shstrtab.offset_of(".fini"),
            sh_type: SHT_PROGBITS,
            sh_flags: SHF_ALLOC | SHF_EXECINSTR,
            sh_addr: dyn_info.fini,
            sh_offset: vaddr_to_foffset(dyn_info.fini),
            sh_size: fini_branch_offset,
            sh_addralign: 4,
            ..Elf64Shdr::default()
        };
        if insert_shdr(&mut shdrs, &known_sections, shdr, true) == SHN_UNDEF as u32 {
            eprintln!("failed to insert new shdr for .fini");
        }
    }

    let rodata_seg = nx.header.segments[RODATA];
    let shdr = Elf64Shdr {
        sh_name: shstrtab.offset_of(".dynstr"),
        sh_type: SHT_STRTAB,
        sh_flags: SHF_ALLOC,
        sh_addr: rodata_seg.mem_offset as u64 + nx.header.dynstr.offset as u64,
        sh_offset: loads[RODATA].0 + nx.header.dynstr.offset as u64,
        sh_size: nx.header.dynstr.size as u64,
        sh_addralign: 1,
        ..Elf64Shdr::default()
    };
    let dynstr_shndx = insert_shdr(&mut shdrs, &known_sections, shdr, false);
    if dynstr_shndx == SHN_UNDEF as u32 {
        eprintln!("failed to insert new shdr for .dynstr");
    }

    let mut last_local_dynsym_index = 0u32;
    for (index, sym) in nx.dynsym_iter() {
        if sym.bind() == STB_LOCAL {
            last_local_dynsym_index = last_local_dynsym_index.max(index);
        }
    }
    let shdr = Elf64Shdr {
        sh_name: shstrtab.offset_of(".dynsym"),
        sh_type: SHT_DYNSYM,
        sh_flags: SHF_ALLOC,
        sh_addr: rodata_seg.mem_offset as u64 + nx.header.dynsym.offset as u64,
        sh_offset: loads[RODATA].0 + nx.header.dynsym.offset as u64,
        sh_size: nx.header.dynsym.size as u64,
        sh_link: dynstr_shndx,
        sh_info: last_local_dynsym_index + 1,
        sh_addralign: 8,
        sh_entsize: ELF64_SYM_SIZE as u64,
    };
    let dynsym_shndx = insert_shdr(&mut shdrs, &known_sections, shdr, false);
    if dynsym_shndx == SHN_UNDEF as u32 {
        eprintln!("failed to insert new shdr for .dynsym");
    }

    let shdr = Elf64Shdr {
        sh_name: shstrtab.offset_of(".dynamic"),
        sh_type: SHT_DYNAMIC,
        sh_flags: SHF_ALLOC | SHF_WRITE,
        sh_addr: nx.dynamic_off,
        sh_offset: vaddr_to_foffset(nx.dynamic_off),
        sh_size: dynamic_size,
        sh_link: dynstr_shndx,
        sh_addralign: 8,
        sh_entsize: ELF64_DYN_SIZE as u64,
        ..Elf64Shdr::default()
    };
    if insert_shdr(&mut shdrs, &known_sections, shdr, false) == SHN_UNDEF as u32 {
        eprintln!("failed to insert new shdr for .dynamic");
    }

    let shdr = Elf64Shdr {
        sh_name: shstrtab.offset_of(".rela.dyn"),
        sh_type: SHT_RELA,
        sh_flags: SHF_ALLOC,
        sh_addr: dyn_info.rela,
        sh_offset: vaddr_to_foffset(dyn_info.rela),
        sh_size: dyn_info.relasz,
        sh_link: dynsym_shndx,
        sh_addralign: 8,
        sh_entsize: ELF64_RELA_SIZE as u64,
        ..Elf64Shdr::default()
    };
    if insert_shdr(&mut shdrs, &known_sections, shdr, false) == SHN_UNDEF as u32 {
        eprintln!("failed to insert new shdr for .rela.dyn");
    }

    let mut plt_shndx = SHN_UNDEF as u32;
    if let Some(plt) = nx.plt {
        let shdr = Elf64Shdr {
            sh_name: shstrtab.offset_of(".plt"),
            sh_type: SHT_PROGBITS,
            sh_flags: SHF_ALLOC | SHF_EXECINSTR,
            sh_addr: plt.addr,
            sh_offset: vaddr_to_foffset(plt.addr),
            sh_size: plt.size,
            sh_addralign: 0x10,
            sh_entsize: 0x10,
            ..Elf64Shdr::default()
        };
        plt_shndx = insert_shdr(&mut shdrs, &known_sections, shdr, true);
        if plt_shndx == SHN_UNDEF as u32 {
            eprintln!("failed to insert new shdr for .plt");
        }
    }

    if present.got {
        let got_addr = got_addr.unwrap_or(0);
        let glob_dat_end = infer::glob_dat_end(nx, got_addr);
        let shdr = Elf64Shdr {
            sh_name: shstrtab.offset_of(".got"),
            sh_type: SHT_PROGBITS,
            sh_flags: SHF_ALLOC | SHF_WRITE,
            sh_addr: got_addr,
            sh_offset: vaddr_to_foffset(got_addr),
            sh_size: glob_dat_end - got_addr,
            sh_addralign: 8,
            sh_entsize: 8,
            ..Elf64Shdr::default()
        };
        if insert_shdr(&mut shdrs, &known_sections, shdr, true) == SHN_UNDEF as u32 {
            eprintln!("failed to insert new shdr for .got");
        }
    }

    if present.got_plt {
        let shdr = Elf64Shdr {
            sh_name: shstrtab.offset_of(".got.plt"),
            sh_type: SHT_PROGBITS,
            sh_flags: SHF_ALLOC | SHF_WRITE,
            sh_addr: dyn_info.pltgot,
            sh_offset: vaddr_to_foffset(dyn_info.pltgot),
            sh_size: jump_slot_addr_end - dyn_info.pltgot,
            sh_addralign: 8,
            sh_entsize: 8,
            ..Elf64Shdr::default()
        };
        if insert_shdr(&mut shdrs, &known_sections, shdr, true) == SHN_UNDEF as u32 {
            eprintln!("failed to insert new shdr for .got.plt");
        }
    }

    if present.rela_plt {
        if !present.plt {
            eprintln!("warning: .rela.plt with no .plt");
        }
        let mut sh_flags = SHF_ALLOC;
        if plt_shndx != SHN_UNDEF as u32 {
            sh_flags |= SHF_INFO_LINK;
        }
        let shdr = Elf64Shdr {
            sh_name: shstrtab.offset_of(".rela.plt"),
            sh_type: SHT_RELA,
            sh_flags,
            sh_addr: dyn_info.jmprel,
            sh_offset: vaddr_to_foffset(dyn_info.jmprel),
            sh_size: dyn_info.pltrelsz,
            sh_link: dynsym_shndx,
            sh_info: plt_shndx,
            sh_addralign: 8,
            sh_entsize: ELF64_RELA_SIZE as u64,
        };
        if insert_shdr(&mut shdrs, &known_sections, shdr, false) == SHN_UNDEF as u32 {
            eprintln!("failed to insert new shdr for .rela.plt");
        }
    }

    if present.init_array {
        let shdr = Elf64Shdr {
            sh_name: shstrtab.offset_of(".init_array"),
            sh_type: SHT_INIT_ARRAY,
            sh_flags: SHF_ALLOC | SHF_WRITE,
            sh_addr: dyn_info.init_array,
            sh_offset: vaddr_to_foffset(dyn_info.init_array),
            sh_size: dyn_info.init_arraysz,
            sh_addralign: 8,
            ..Elf64Shdr::default()
        };
        if insert_shdr(&mut shdrs, &known_sections, shdr, true) == SHN_UNDEF as u32 {
            eprintln!("failed to insert new shdr for .init_array");
        }
    }

    if present.fini_array {
        let shdr = Elf64Shdr {
            sh_name: shstrtab.offset_of(".fini_array"),
            sh_type: SHT_FINI_ARRAY,
            sh_flags: SHF_ALLOC | SHF_WRITE,
            sh_addr: dyn_info.fini_array,
            sh_offset: vaddr_to_foffset(dyn_info.fini_array),
            sh_size: dyn_info.fini_arraysz,
            sh_addralign: 8,
            ..Elf64Shdr::default()
        };
        if insert_shdr(&mut shdrs, &known_sections, shdr, true) == SHN_UNDEF as u32 {
            eprintln!("failed to insert new shdr for .fini_array");
        }
    }

    if present.hash {
        let nbucket = read_u32(image, dyn_info.hash as usize) as u64;
        let nchain = read_u32(image, dyn_info.hash as usize + 4) as u64;
        let shdr = Elf64Shdr {
            sh_name: shstrtab.offset_of(".hash"),
            sh_type: SHT_HASH,
            sh_flags: SHF_ALLOC,
            sh_addr: dyn_info.hash,
            sh_offset: vaddr_to_foffset(dyn_info.hash),
            sh_size: 8 + (nbucket + nchain) * 4,
            sh_link: dynsym_shndx,
            sh_addralign: 8,
            sh_entsize: 4,
            ..Elf64Shdr::default()
        };
        if insert_shdr(&mut shdrs, &known_sections, shdr, false) == SHN_UNDEF as u32 {
            eprintln!("failed to insert new shdr for .hash");
        }
    }

    if present.gnu_hash {
        let base = dyn_info.gnu_hash as usize;
        let nbuckets = read_u32(image, base) as u64;
        let symndx = read_u32(image, base + 4) as u64;
        let maskwords = read_u32(image, base + 8) as u64;
        let dynsymcount = nx.dynsym_count();
        let gnu_hash_len =
            16 + maskwords * 8 + nbuckets * 4 + dynsymcount.saturating_sub(symndx) * 4;
        let shdr = Elf64Shdr {
            sh_name: shstrtab.offset_of(".gnu.hash"),
            sh_type: SHT_GNU_HASH,
            sh_flags: SHF_ALLOC,
            sh_addr: dyn_info.gnu_hash,
            sh_offset: vaddr_to_foffset(dyn_info.gnu_hash),
            sh_size: gnu_hash_len,
            sh_link: dynsym_shndx,
            sh_addralign: 8,
            sh_entsize: 4,
            ..Elf64Shdr::default()
        };
        if insert_shdr(&mut shdrs, &known_sections, shdr, false) == SHN_UNDEF as u32 {
            eprintln!("failed to insert new shdr for .gnu.hash");
        }
    }

    if let Some(note_off) = nx.note_off {
        let nhdr = Elf64Nhdr::parse(image, note_off as usize);
        let shdr = Elf64Shdr {
            sh_name: shstrtab.offset_of(".note"),
            sh_type: SHT_NOTE,
            sh_flags: SHF_ALLOC,
            sh_addr: note_off,
            sh_offset: vaddr_to_foffset(note_off),
            sh_size: ELF64_NHDR_SIZE as u64 + nhdr.n_descsz as u64 + nhdr.n_namesz as u64,
            sh_addralign: 4,
            ..Elf64Shdr::default()
        };
        if insert_shdr(&mut shdrs, &known_sections, shdr, false) == SHN_UNDEF as u32 {
            eprintln!("failed to insert new shdr for .note");
        }
    }

    if present.eh {
        let shdr = Elf64Shdr {
            sh_name: shstrtab.offset_of(".eh_frame_hdr"),
            sh_type: SHT_PROGBITS,
            sh_flags: SHF_ALLOC,
            sh_addr: eh_info.hdr_addr,
            sh_offset: vaddr_to_foffset(eh_info.hdr_addr),
            sh_size: eh_info.hdr_size,
            sh_addralign: 4,
            ..Elf64Shdr::default()
        };
        if insert_shdr(&mut shdrs, &known_sections, shdr, true) == SHN_UNDEF as u32 {
            eprintln!("failed to insert new shdr for .eh_frame_hdr");
        }
        let shdr = Elf64Shdr {
            sh_name: shstrtab.offset_of(".eh_frame"),
            sh_type: SHT_PROGBITS,
            sh_flags: SHF_ALLOC,
            sh_addr: eh_info.frame_addr,
            sh_offset: vaddr_to_foffset(eh_info.frame_addr),
            sh_size: eh_info.frame_size,
            sh_addralign: 4,
            ..Elf64Shdr::default()
        };
        if insert_shdr(&mut shdrs, &known_sections, shdr, true) == SHN_UNDEF as u32 {
            eprintln!("failed to insert new shdr for .eh_frame");
        }
    }

    let shdr = Elf64Shdr {
        sh_name: shstrtab.offset_of(".shstrtab"),
        sh_type: SHT_STRTAB,
        sh_offset: shstrtab_offset as u64,
        sh_size: shstrtab.len() as u64,
        sh_addralign: 1,
        ..Elf64Shdr::default()
    };
    let shstrndx = insert_shdr(&mut shdrs, &known_sections, shdr, false);
    if shstrndx == SHN_UNDEF as u32 {
        eprintln!("failed to insert new shdr for .shstrtab");
    }
    w16(&mut elf, 0x3e, shstrndx as u16);

    for (i, shdr) in shdrs.iter().enumerate() {
        shdr.write_at(&mut elf, e_shoff + i * ELF64_SHDR_SIZE);
    }

    elf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::util::{read_u16, read_u64};
    use crate::container::fixtures::{build_image, build_nro, build_nso};
    use crate::container::NxFile;

    struct ParsedShdr {
        sh_type: u32,
        sh_flags: u64,
        sh_addr: u64,
        sh_offset: u64,
        sh_size: u64,
        sh_link: u32,
        sh_info: u32,
        sh_entsize: u64,
    }

    struct ParsedElf {
        bytes: Vec<u8>,
        e_entry: u64,
        e_phoff: u64,
        e_shoff: u64,
        e_phnum: u16,
        e_shnum: u16,
        e_shstrndx: u16,
        sections: Vec<(String, ParsedShdr)>,
    }

    fn parse_elf(bytes: Vec<u8>) -> ParsedElf {
        assert_eq!(&bytes[0..4], &ELF_MAGIC);
        assert_eq!(bytes[4], ELFCLASS64);
        assert_eq!(read_u16(&bytes, 0x12), EM_AARCH64);
        let e_phoff = read_u64(&bytes, 0x20);
        let e_shoff = read_u64(&bytes, 0x28);
        let e_phnum = read_u16(&bytes, 0x38);
        let e_shnum = read_u16(&bytes, 0x3c);
        let e_shstrndx = read_u16(&bytes, 0x3e);

        let read_shdr = |index: usize| -> ParsedShdr {
            let off = e_shoff as usize + index * ELF64_SHDR_SIZE;
            ParsedShdr {
                sh_type: read_u32(&bytes, off + 4),
                sh_flags: read_u64(&bytes, off + 8),
                sh_addr: read_u64(&bytes, off + 16),
                sh_offset: read_u64(&bytes, off + 24),
                sh_size: read_u64(&bytes, off + 32),
                sh_link: read_u32(&bytes, off + 40),
                sh_info: read_u32(&bytes, off + 44),
                sh_entsize: read_u64(&bytes, off + 56),
            }
        };
        let strtab_off = read_shdr(e_shstrndx as usize).sh_offset as usize;
        let mut sections = Vec::new();
        for i in 0..e_shnum as usize {
            let shdr = read_shdr(i);
            let name_off = read_u32(&bytes, e_shoff as usize + i * ELF64_SHDR_SIZE) as usize;
            let name = crate::common::util::read_cstr(&bytes, strtab_off + name_off);
            sections.push((name, shdr));
        }
        ParsedElf {
            e_entry: read_u64(&bytes, 0x18),
            e_phoff,
            e_shoff,
            e_phnum,
            e_shnum,
            e_shstrndx,
            sections,
            bytes,
        }
    }

    impl ParsedElf {
        fn phdr(&self, index: usize) -> (u32, u32, u64, u64, u64, u64, u64) {
            let off = self.e_phoff as usize + index * ELF64_PHDR_SIZE;
            (
                read_u32(&self.bytes, off),      // p_type
                read_u32(&self.bytes, off + 4),  // p_flags
                read_u64(&self.bytes, off + 8),  // p_offset
                read_u64(&self.bytes, off + 16), // p_vaddr
                read_u64(&self.bytes, off + 32), // p_filesz
                read_u64(&self.bytes, off + 40), // p_memsz
                read_u64(&self.bytes, off + 48), // p_align
            )
        }

        fn section(&self, name: &str) -> &ParsedShdr {
            &self
                .sections
                .iter()
                .find(|(n, _)| n == name)
                .unwrap_or_else(|| panic!("section {} not found", name))
                .1
        }

        fn section_index(&self, name: &str) -> u32 {
            self.sections.iter().position(|(n, _)| n == name).unwrap() as u32
        }
    }

    #[test]
    fn test_elf_header_and_load_segments() {
        let nx = NxFile::load(build_nso(0)).unwrap();
        let elf = parse_elf(write_elf(&nx));
        let image = build_image();

        assert_eq!(elf.e_entry, 0);
        assert_eq!(elf.e_phnum, 5);

        // PT_LOAD contents must reproduce the flat image byte for byte.
        let expected = [
            (PF_R | PF_X, 0u64, 0x100u64, 0x100u64, 0x100u64),
            (PF_R, 0x100, 0x100, 0x100, 1),
            (PF_R | PF_W, 0x200, 0x200, 0x200 + 0x40, 1),
        ];
        for (i, &(flags, vaddr, filesz, memsz, align)) in expected.iter().enumerate() {
            let (p_type, p_flags, p_offset, p_vaddr, p_filesz, p_memsz, p_align) = elf.phdr(i);
            assert_eq!(p_type, PT_LOAD);
            assert_eq!(p_flags, flags);
            assert_eq!(p_vaddr, vaddr);
            assert_eq!(p_filesz, filesz);
            assert_eq!(p_memsz, memsz);
            assert_eq!(p_align, align);
            let file_bytes = &elf.bytes[p_offset as usize..(p_offset + p_filesz) as usize];
            let image_bytes = &image[vaddr as usize..(vaddr + filesz) as usize];
            assert_eq!(file_bytes, image_bytes);
        }

        // PT_DYNAMIC covers all 17 entries including the terminator.
        let (p_type, _, p_offset, p_vaddr, p_filesz, _, _) = elf.phdr(3);
        assert_eq!(p_type, PT_DYNAMIC);
        assert_eq!(p_vaddr, 0x200);
        assert_eq!(p_filesz, 17 * 16);
        let data_load = elf.phdr(2);
        assert_eq!(p_offset, data_load.2 + (0x200 - 0x200));

        let (p_type, _, _, p_vaddr, p_filesz, _, _) = elf.phdr(4);
        assert_eq!(p_type, PT_GNU_EH_FRAME);
        assert_eq!(p_vaddr, 0x1a0);
        assert_eq!(p_filesz, 0x10);
    }

    #[test]
    fn test_known_sections_keep_their_indices() {
        let nx = NxFile::load(build_nso(0)).unwrap();
        let elf = parse_elf(write_elf(&nx));
        // dynsym pins .text at 1, .data at 3, .bss at 4; .rodata backfills
        // into the lowest free slot, 2.
        assert_eq!(elf.section_index(".text"), 1);
        assert_eq!(elf.section_index(".rodata"), 2);
        assert_eq!(elf.section_index(".data"), 3);
        assert_eq!(elf.section_index(".bss"), 4);
        assert_eq!(elf.sections[0].1.sh_type, SHT_NULL);

        let text = elf.section(".text");
        assert_eq!(text.sh_type, SHT_PROGBITS);
        assert_eq!(text.sh_flags, SHF_ALLOC | SHF_EXECINSTR);
        assert_eq!(text.sh_addr, 0);
        assert_eq!(text.sh_size, 0x100);
        assert_eq!(text.sh_offset, elf.phdr(0).2);

        let bss = elf.section(".bss");
        assert_eq!(bss.sh_type, SHT_NOBITS);
        assert_eq!(bss.sh_addr, 0x400);
        assert_eq!(bss.sh_size, 0x40);
    }

    #[test]
    fn test_dynamic_linking_sections() {
        let nx = NxFile::load(build_nso(0)).unwrap();
        let elf = parse_elf(write_elf(&nx));
        let rodata_offset = elf.phdr(1).2;

        let dynstr = elf.section(".dynstr");
        assert_eq!(dynstr.sh_type, SHT_STRTAB);
        assert_eq!(dynstr.sh_addr, 0x100);
        assert_eq!(dynstr.sh_offset, rodata_offset);
        assert_eq!(dynstr.sh_size, 23);

        let dynsym = elf.section(".dynsym");
        assert_eq!(dynsym.sh_type, SHT_DYNSYM);
        assert_eq!(dynsym.sh_addr, 0x120);
        assert_eq!(dynsym.sh_offset, rodata_offset + 0x20);
        assert_eq!(dynsym.sh_size, 96);
        assert_eq!(dynsym.sh_link, elf.section_index(".dynstr"));
        // Symbols 0 and 1 are local, so sh_info is one past the last local.
        assert_eq!(dynsym.sh_info, 2);
        assert_eq!(dynsym.sh_entsize, ELF64_SYM_SIZE as u64);

        let dynamic = elf.section(".dynamic");
        assert_eq!(dynamic.sh_type, SHT_DYNAMIC);
        assert_eq!(dynamic.sh_addr, 0x200);
        assert_eq!(dynamic.sh_size, 17 * 16);
        assert_eq!(dynamic.sh_link, elf.section_index(".dynstr"));

        let rela_dyn = elf.section(".rela.dyn");
        assert_eq!(rela_dyn.sh_type, SHT_RELA);
        assert_eq!(rela_dyn.sh_addr, 0x310);
        assert_eq!(rela_dyn.sh_size, 24);
        assert_eq!(rela_dyn.sh_link, elf.section_index(".dynsym"));

        let rela_plt = elf.section(".rela.plt");
        assert_eq!(rela_plt.sh_addr, 0x328);
        assert_eq!(rela_plt.sh_size, 24);
        assert_eq!(rela_plt.sh_link, elf.section_index(".dynsym"));
        assert_eq!(rela_plt.sh_info, elf.section_index(".plt"));
        assert_ne!(rela_plt.sh_flags & SHF_INFO_LINK, 0);
    }

    #[test]
    fn test_inferred_sections() {
        let nx = NxFile::load(build_nso(0)).unwrap();
        let elf = parse_elf(write_elf(&nx));

        let plt = elf.section(".plt");
        assert_eq!(plt.sh_addr, 0x80);
        assert_eq!(plt.sh_size, 48);
        assert_eq!(plt.sh_entsize, 0x10);

        let got_plt = elf.section(".got.plt");
        assert_eq!(got_plt.sh_addr, 0x3a8);
        assert_eq!(got_plt.sh_size, 0x10);

        let got = elf.section(".got");
        assert_eq!(got.sh_addr, 0x3b8);
        assert_eq!(got.sh_size, 0x10);

        let hash = elf.section(".hash");
        assert_eq!(hash.sh_addr, 0x358);
        assert_eq!(hash.sh_size, 8 + (1 + 4) * 4);

        let gnu_hash = elf.section(".gnu.hash");
        assert_eq!(gnu_hash.sh_addr, 0x380);
        assert_eq!(gnu_hash.sh_size, 16 + 8 + 4 + 3 * 4);

        let init = elf.section(".init");
        assert_eq!(init.sh_addr, 0x10);
        assert_eq!(init.sh_size, 8);
        let fini = elf.section(".fini");
        assert_eq!(fini.sh_addr, 0x18);
        assert_eq!(fini.sh_size, 8);

        let init_array = elf.section(".init_array");
        assert_eq!(init_array.sh_type, SHT_INIT_ARRAY);
        assert_eq!(init_array.sh_addr, 0x340);
        assert_eq!(init_array.sh_size, 16);
        let fini_array = elf.section(".fini_array");
        assert_eq!(fini_array.sh_addr, 0x350);
        assert_eq!(fini_array.sh_size, 8);

        let note = elf.section(".note");
        assert_eq!(note.sh_type, SHT_NOTE);
        assert_eq!(note.sh_addr, 0x180);
        assert_eq!(note.sh_size, (ELF64_NHDR_SIZE + 4 + 16) as u64);

        let eh_hdr = elf.section(".eh_frame_hdr");
        assert_eq!(eh_hdr.sh_addr, 0x1a0);
        assert_eq!(eh_hdr.sh_size, 0x10);
        let eh_frame = elf.section(".eh_frame");
        assert_eq!(eh_frame.sh_addr, 0x1c0);
        // One 16-byte record, already 16-aligned.
        assert_eq!(eh_frame.sh_size, 0x10);
    }

    #[test]
    fn test_shstrtab_is_last_inserted() {
        let nx = NxFile::load(build_nso(0)).unwrap();
        let elf = parse_elf(write_elf(&nx));
        let shstrtab = elf.section(".shstrtab");
        assert_eq!(shstrtab.sh_type, SHT_STRTAB);
        assert_eq!(elf.e_shstrndx as u32, elf.section_index(".shstrtab"));
        // The name table sits between the section headers and the segments.
        assert_eq!(
            shstrtab.sh_offset,
            elf.e_shoff + elf.e_shnum as u64 * ELF64_SHDR_SIZE as u64
        );
        // Every slot is used: the section count was computed exactly.
        assert!(elf.sections[1..].iter().all(|(_, s)| s.sh_type != SHT_NULL));
    }

    #[test]
    fn test_deterministic_output() {
        let nx = NxFile::load(build_nso(0)).unwrap();
        assert_eq!(write_elf(&nx), write_elf(&nx));
    }

    #[test]
    fn test_nro_bss_segment() {
        let nx = NxFile::load(build_nro()).unwrap();
        let elf = parse_elf(write_elf(&nx));
        // data PT_LOAD: memsz = filesz + bss_size
        let (_, p_flags, _, p_vaddr, p_filesz, p_memsz, _) = elf.phdr(2);
        assert_eq!(p_flags, PF_R | PF_W);
        assert_eq!(p_vaddr, 0x180);
        assert_eq!(p_filesz, 0x80);
        assert_eq!(p_memsz, 0x80 + 0x1000);
        let bss = elf.section(".bss");
        assert_eq!(bss.sh_type, SHT_NOBITS);
        assert_eq!(bss.sh_addr, 0x200);
        assert_eq!(bss.sh_size, 0x1000);
        // No PLT pattern and no note in this image.
        assert!(elf.sections.iter().all(|(n, _)| n != ".plt" && n != ".note"));
        assert!(elf.sections.iter().all(|(n, _)| n != ".eh_frame_hdr"));
    }
}
