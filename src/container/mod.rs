//! Container loading: NSO, NRO, and raw MOD inputs are normalized into a flat
//! virtual-memory image plus an NSO-shaped segment table.
//!
//! NSO is the compressed, segmented format; its header already carries the
//! canonical three-segment table. NRO stores the flat image directly, so its
//! header is translated into the NSO shape. A raw MOD has no outer header at
//! all: the segment table is synthesized from the PLT location and the
//! section indices observed in the dynamic symbol table.
//!
//! All cross-references downstream of the loader are byte offsets into the
//! image buffer; the image is loaded at virtual address 0, so virtual
//! addresses and image offsets coincide.

use crate::common::error::{Error, Result};
use crate::common::util::{align_up, memmemr, read_i32, read_u32};
use crate::elf::{Elf64Dyn, Elf64Nhdr, Elf64Sym, w32, write_bytes};
use crate::elf::{
    DT_FINI, DT_FINI_ARRAY, DT_FINI_ARRAYSZ, DT_GNU_HASH, DT_HASH, DT_INIT, DT_INIT_ARRAY,
    DT_INIT_ARRAYSZ, DT_JMPREL, DT_PLTGOT, DT_PLTRELSZ, DT_RELA, DT_RELASZ, DT_STRSZ, DT_STRTAB,
    DT_SYMTAB, ELF64_DYN_SIZE, ELF64_NHDR_SIZE, ELF64_SYM_SIZE, SHN_LORESERVE, SHN_UNDEF,
    STT_SECTION,
};
use crate::infer;

// ── Segment indices ──────────────────────────────────────────────────────────

pub const TEXT: usize = 0;
pub const RODATA: usize = 1;
pub const DATA: usize = 2;
pub const NUM_SEGMENTS: usize = 3;

pub const NSO_MAGIC: [u8; 4] = *b"NSO0";
pub const NRO_MAGIC: [u8; 4] = *b"NRO0";
pub const MOD_MAGIC: [u8; 4] = *b"MOD0";

/// Size of the on-disk NSO header.
pub const NSO_HEADER_SIZE: usize = 0x100;
/// Size of the on-disk NRO header (which sits at file offset 0x10).
pub const NRO_HEADER_SIZE: usize = 0x70;
/// File offset of the NRO header: the ModPointer rounded up to 16 bytes.
pub const NRO_HEADER_OFFSET: usize = 0x10;
/// Size of the ModPointer at offset 0 of every image.
pub const MOD_POINTER_SIZE: usize = 8;
/// Size of the MOD header the ModPointer refers to.
pub const MOD_HEADER_SIZE: usize = 28;

/// Which container variant a file was recognized as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Nso,
    Nro,
    Mod,
}

// ── Header structures ────────────────────────────────────────────────────────

/// One entry of the NSO segment table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentHeader {
    pub file_offset: u32,
    pub mem_offset: u32,
    pub mem_size: u32,
    /// Alignment for text/rodata; BSS size for the data segment.
    pub bss_align: u32,
}

/// An (offset, size) pair; used for the rodata-relative dynstr/dynsym extents.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataExtent {
    pub offset: u32,
    pub size: u32,
}

/// The full NSO header. NRO and raw-MOD inputs are translated into this shape
/// during loading, so downstream code only ever sees the NSO layout.
///
/// Unknown fields are carried verbatim so the uncompressed-NSO writer can
/// reproduce the header bit-exactly.
#[derive(Debug, Clone)]
pub struct NsoHeader {
    pub field_4: u32,
    pub field_8: u32,
    pub flags: u32,
    pub segments: [SegmentHeader; NUM_SEGMENTS],
    pub gnu_build_id: [u8; 32],
    pub segment_file_sizes: [u32; NUM_SEGMENTS],
    pub field_6c: [u32; 9],
    pub dynstr: DataExtent,
    pub dynsym: DataExtent,
    pub segment_digests: [[u8; 32]; NUM_SEGMENTS],
}

impl Default for NsoHeader {
    fn default() -> Self {
        Self {
            field_4: 0,
            field_8: 0,
            flags: 0,
            segments: [SegmentHeader::default(); NUM_SEGMENTS],
            gnu_build_id: [0; 32],
            segment_file_sizes: [0; NUM_SEGMENTS],
            field_6c: [0; 9],
            dynstr: DataExtent::default(),
            dynsym: DataExtent::default(),
            segment_digests: [[0; 32]; NUM_SEGMENTS],
        }
    }
}

impl NsoHeader {
    /// Parse the header from the first `NSO_HEADER_SIZE` bytes of `data`.
    pub fn parse(data: &[u8]) -> Self {
        let mut header = Self {
            field_4: read_u32(data, 0x04),
            field_8: read_u32(data, 0x08),
            flags: read_u32(data, 0x0c),
            ..Self::default()
        };
        for i in 0..NUM_SEGMENTS {
            let off = 0x10 + i * 16;
            header.segments[i] = SegmentHeader {
                file_offset: read_u32(data, off),
                mem_offset: read_u32(data, off + 4),
                mem_size: read_u32(data, off + 8),
                bss_align: read_u32(data, off + 12),
            };
            header.segment_file_sizes[i] = read_u32(data, 0x60 + i * 4);
            header.segment_digests[i].copy_from_slice(&data[0xa0 + i * 32..0xa0 + (i + 1) * 32]);
        }
        header.gnu_build_id.copy_from_slice(&data[0x40..0x60]);
        for i in 0..9 {
            header.field_6c[i] = read_u32(data, 0x6c + i * 4);
        }
        header.dynstr = DataExtent { offset: read_u32(data, 0x90), size: read_u32(data, 0x94) };
        header.dynsym = DataExtent { offset: read_u32(data, 0x98), size: read_u32(data, 0x9c) };
        header
    }

    /// Serialize the header into the first `NSO_HEADER_SIZE` bytes of `buf`.
    pub fn write_to(&self, buf: &mut [u8]) {
        write_bytes(buf, 0, &NSO_MAGIC);
        w32(buf, 0x04, self.field_4);
        w32(buf, 0x08, self.field_8);
        w32(buf, 0x0c, self.flags);
        for i in 0..NUM_SEGMENTS {
            let off = 0x10 + i * 16;
            w32(buf, off, self.segments[i].file_offset);
            w32(buf, off + 4, self.segments[i].mem_offset);
            w32(buf, off + 8, self.segments[i].mem_size);
            w32(buf, off + 12, self.segments[i].bss_align);
            w32(buf, 0x60 + i * 4, self.segment_file_sizes[i]);
            write_bytes(buf, 0xa0 + i * 32, &self.segment_digests[i]);
        }
        write_bytes(buf, 0x40, &self.gnu_build_id);
        for i in 0..9 {
            w32(buf, 0x6c + i * 4, self.field_6c[i]);
        }
        w32(buf, 0x90, self.dynstr.offset);
        w32(buf, 0x94, self.dynstr.size);
        w32(buf, 0x98, self.dynsym.offset);
        w32(buf, 0x9c, self.dynsym.size);
    }
}

/// The NRO header, read at file offset `NRO_HEADER_OFFSET`. Field offsets
/// below are relative to the header start.
#[derive(Debug, Clone, Copy)]
struct NroHeader {
    file_size: u32,
    segments: [DataExtent; NUM_SEGMENTS],
    bss_size: u32,
    gnu_build_id: [u8; 32],
    dynstr: DataExtent,
    dynsym: DataExtent,
}

impl NroHeader {
    fn parse(data: &[u8], base: usize) -> Self {
        let mut segments = [DataExtent::default(); NUM_SEGMENTS];
        for (i, seg) in segments.iter_mut().enumerate() {
            let off = base + 0x10 + i * 8;
            *seg = DataExtent { offset: read_u32(data, off), size: read_u32(data, off + 4) };
        }
        let mut gnu_build_id = [0u8; 32];
        gnu_build_id.copy_from_slice(&data[base + 0x30..base + 0x50]);
        Self {
            file_size: read_u32(data, base + 0x08),
            segments,
            bss_size: read_u32(data, base + 0x28),
            gnu_build_id,
            dynstr: DataExtent {
                offset: read_u32(data, base + 0x60),
                size: read_u32(data, base + 0x64),
            },
            dynsym: DataExtent {
                offset: read_u32(data, base + 0x68),
                size: read_u32(data, base + 0x6c),
            },
        }
    }
}

/// The MOD header embedded in every image. All offsets are relative to the
/// MOD header's own position.
#[derive(Debug, Clone, Copy)]
pub struct ModHeader {
    pub dynamic_offset: i32,
    pub bss_start_offset: i32,
    pub bss_end_offset: i32,
    pub eh_start_offset: i32,
    pub eh_end_offset: i32,
    pub module_object_offset: i32,
}

impl ModHeader {
    fn parse(data: &[u8], base: usize) -> Self {
        Self {
            dynamic_offset: read_i32(data, base + 4),
            bss_start_offset: read_i32(data, base + 8),
            bss_end_offset: read_i32(data, base + 12),
            eh_start_offset: read_i32(data, base + 16),
            eh_end_offset: read_i32(data, base + 20),
            module_object_offset: read_i32(data, base + 24),
        }
    }
}

// ── Derived info ─────────────────────────────────────────────────────────────

/// Recognized dynamic-table entries; 0 means the tag was absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct DynInfo {
    pub symtab: u64,
    pub rela: u64,
    pub relasz: u64,
    pub jmprel: u64,
    pub pltrelsz: u64,
    pub strtab: u64,
    pub strsz: u64,
    pub pltgot: u64,
    pub hash: u64,
    pub gnu_hash: u64,
    pub init: u64,
    pub fini: u64,
    pub init_array: u64,
    pub init_arraysz: u64,
    pub fini_array: u64,
    pub fini_arraysz: u64,
}

/// Location and extent of the inferred `.plt`.
#[derive(Debug, Clone, Copy)]
pub struct PltInfo {
    pub addr: u64,
    pub size: u64,
}

/// Exception-handling extents. `hdr_addr`/`hdr_size` come from the MOD
/// header; `frame_addr`/`frame_size` are filled in by the emitter once the
/// `.eh_frame_hdr` has been measured.
#[derive(Debug, Clone, Copy, Default)]
pub struct EhInfo {
    pub hdr_addr: u64,
    pub hdr_size: u64,
    pub frame_addr: u64,
    pub frame_size: u64,
}

// ── Loaded file ──────────────────────────────────────────────────────────────

/// A fully loaded input: the flat image, the canonical segment table, and
/// everything recovered from the MOD header and dynamic table.
pub struct NxFile {
    pub kind: FileKind,
    pub header: NsoHeader,
    pub image: Vec<u8>,
    /// Image offset of the MOD header.
    pub mod_off: u64,
    /// Image offset of the dynamic table.
    pub dynamic_off: u64,
    /// Image offset of the GNU build-id note header, if one was found.
    pub note_off: Option<u64>,
    pub dyn_info: DynInfo,
    pub plt: Option<PltInfo>,
    pub eh: EhInfo,
}

/// LZ4 block decode into an exactly-sized destination buffer. Returns the
/// decoded length, or `None` when the stream is malformed or does not fit.
fn lz4_decompress_safe(src: &[u8], dst: &mut [u8]) -> Option<usize> {
    lz4_flex::block::decompress_into(src, dst).ok()
}

impl NxFile {
    /// Recognize and load a container from raw file bytes.
    pub fn load(file: Vec<u8>) -> Result<NxFile> {
        let (kind, header, image) = Self::load_container(file)?;

        // Every variant embeds a MOD header; the ModPointer at image offset 0
        // locates it.
        if image.len() < MOD_POINTER_SIZE {
            return Err(Error::TruncatedHeader {
                what: "ModPointer",
                need: MOD_POINTER_SIZE,
                have: image.len(),
            });
        }
        let mod_off = read_u32(&image, 4) as usize;
        if mod_off + MOD_HEADER_SIZE > image.len() {
            return Err(Error::TruncatedHeader {
                what: "MOD header",
                need: mod_off + MOD_HEADER_SIZE,
                have: image.len(),
            });
        }
        if image[mod_off..mod_off + 4] != MOD_MAGIC {
            return Err(Error::BadMagic { what: "MOD" });
        }
        let mod_header = ModHeader::parse(&image, mod_off);

        let mut nx = NxFile {
            kind,
            header,
            image,
            mod_off: mod_off as u64,
            dynamic_off: 0,
            note_off: None,
            dyn_info: DynInfo::default(),
            plt: None,
            eh: EhInfo::default(),
        };

        nx.dynamic_off = nx.mod_get_offset(mod_header.dynamic_offset);
        nx.parse_dynamic()?;

        if nx.kind != FileKind::Mod {
            let text = nx.header.segments[TEXT];
            nx.plt = infer::resolve_plt(
                &nx.image,
                text.mem_offset as usize,
                text.mem_size as usize,
                nx.dyn_info.pltrelsz,
            );
        } else {
            nx.synthesize_mod_segments(&mod_header)?;
        }

        nx.find_build_id_note();
        if nx.kind == FileKind::Mod {
            nx.copy_note_build_id();
        }

        nx.eh.hdr_addr = nx.mod_get_offset(mod_header.eh_start_offset);
        nx.eh.hdr_size =
            nx.mod_get_offset(mod_header.eh_end_offset).wrapping_sub(nx.eh.hdr_addr);

        Ok(nx)
    }

    /// Recognize the outer container and produce the flat image plus the
    /// canonical (NSO-shaped) header.
    fn load_container(file: Vec<u8>) -> Result<(FileKind, NsoHeader, Vec<u8>)> {
        if file.len() >= NSO_HEADER_SIZE && file[0..4] == NSO_MAGIC {
            let header = NsoHeader::parse(&file);
            let data_seg = &header.segments[DATA];
            let image_size =
                data_seg.mem_offset as usize + data_seg.mem_size as usize + data_seg.bss_align as usize;
            let mut image = vec![0u8; image_size];

            for i in 0..NUM_SEGMENTS {
                let seg = header.segments[i];
                let file_size = header.segment_file_sizes[i] as usize;
                let src_start = seg.file_offset as usize;
                if src_start + file_size > file.len() {
                    return Err(Error::TruncatedHeader {
                        what: "NSO segment",
                        need: src_start + file_size,
                        have: file.len(),
                    });
                }
                let dst_start = seg.mem_offset as usize;
                let mem_size = seg.mem_size as usize;
                if dst_start + mem_size > image.len() {
                    return Err(Error::SizeMismatch {
                        what: "NSO segment",
                        declared: (dst_start + mem_size) as u64,
                        actual: image.len() as u64,
                    });
                }
                let src = &file[src_start..src_start + file_size];
                if header.flags & (1 << i) != 0 {
                    let dst = &mut image[dst_start..dst_start + mem_size];
                    match lz4_decompress_safe(src, dst) {
                        Some(n) if n == mem_size => {}
                        _ => {
                            return Err(Error::DecompressFailed {
                                segment: i,
                                expected: seg.mem_size,
                            })
                        }
                    }
                } else {
                    if dst_start + file_size > image.len() {
                        return Err(Error::SizeMismatch {
                            what: "NSO segment",
                            declared: (dst_start + file_size) as u64,
                            actual: image.len() as u64,
                        });
                    }
                    image[dst_start..dst_start + file_size].copy_from_slice(src);
                }
            }
            return Ok((FileKind::Nso, header, image));
        }

        if file.len() >= NRO_HEADER_OFFSET + NRO_HEADER_SIZE
            && file[NRO_HEADER_OFFSET..NRO_HEADER_OFFSET + 4] == NRO_MAGIC
        {
            let nro = NroHeader::parse(&file, NRO_HEADER_OFFSET);
            if nro.file_size as usize != file.len() {
                return Err(Error::SizeMismatch {
                    what: "NRO file",
                    declared: nro.file_size as u64,
                    actual: file.len() as u64,
                });
            }
            for seg in &nro.segments {
                if seg.offset as u64 + seg.size as u64 > file.len() as u64 {
                    return Err(Error::SizeMismatch {
                        what: "NRO segment",
                        declared: seg.offset as u64 + seg.size as u64,
                        actual: file.len() as u64,
                    });
                }
            }
            // Translate the NRO header to NSO, which is a superset. The file
            // already is the flat image.
            let mut header = NsoHeader::default();
            for i in 0..NUM_SEGMENTS {
                let seg = &mut header.segments[i];
                seg.mem_offset = nro.segments[i].offset;
                seg.file_offset = nro.segments[i].offset;
                seg.mem_size = nro.segments[i].size;
                header.segment_file_sizes[i] = nro.segments[i].size;
                seg.bss_align = match i {
                    TEXT => 0x100,
                    RODATA => 1,
                    _ => nro.bss_size,
                };
            }
            header.gnu_build_id = nro.gnu_build_id;
            header.dynstr = nro.dynstr;
            header.dynsym = nro.dynsym;
            return Ok((FileKind::Nro, header, file));
        }

        // Neither NSO nor NRO: raw MOD images exist too. The MOD magic is
        // verified by the caller; the file itself is the image.
        Ok((FileKind::Mod, NsoHeader::default(), file))
    }

    /// Translate an offset relative to the MOD header into an image offset.
    pub fn mod_get_offset(&self, relative_offset: i32) -> u64 {
        (self.mod_off as i64 + relative_offset as i64) as u64
    }

    /// Walk the dynamic table until the null tag, capturing recognized
    /// entries.
    fn parse_dynamic(&mut self) -> Result<()> {
        let limit = self.image.len().saturating_sub(ELF64_DYN_SIZE);
        let mut off = self.dynamic_off as usize;
        loop {
            if off > limit || self.image.len() < ELF64_DYN_SIZE {
                return Err(Error::TruncatedHeader {
                    what: "dynamic table",
                    need: off.saturating_add(ELF64_DYN_SIZE),
                    have: self.image.len(),
                });
            }
            let dyn_entry = Elf64Dyn::parse(&self.image, off);
            if dyn_entry.d_tag == 0 {
                break;
            }
            let info = &mut self.dyn_info;
            match dyn_entry.d_tag {
                DT_SYMTAB => info.symtab = dyn_entry.d_val,
                DT_RELA => info.rela = dyn_entry.d_val,
                DT_RELASZ => info.relasz = dyn_entry.d_val,
                DT_JMPREL => info.jmprel = dyn_entry.d_val,
                DT_PLTRELSZ => info.pltrelsz = dyn_entry.d_val,
                DT_STRTAB => info.strtab = dyn_entry.d_val,
                DT_STRSZ => info.strsz = dyn_entry.d_val,
                DT_PLTGOT => info.pltgot = dyn_entry.d_val,
                DT_HASH => info.hash = dyn_entry.d_val,
                DT_GNU_HASH => info.gnu_hash = dyn_entry.d_val,
                DT_INIT => info.init = dyn_entry.d_val,
                DT_FINI => info.fini = dyn_entry.d_val,
                DT_INIT_ARRAY => info.init_array = dyn_entry.d_val,
                DT_INIT_ARRAYSZ => info.init_arraysz = dyn_entry.d_val,
                DT_FINI_ARRAY => info.fini_array = dyn_entry.d_val,
                DT_FINI_ARRAYSZ => info.fini_arraysz = dyn_entry.d_val,
                _ => {}
            }
            off += ELF64_DYN_SIZE;
        }
        Ok(())
    }

    /// Number of entries the dynamic table holds, including the terminator.
    pub fn dynamic_entry_count(&self) -> u64 {
        let limit = self.image.len().saturating_sub(ELF64_DYN_SIZE);
        let mut count = 1u64;
        let mut off = self.dynamic_off as usize;
        while off <= limit && self.image.len() >= ELF64_DYN_SIZE {
            if Elf64Dyn::parse(&self.image, off).d_tag == 0 {
                break;
            }
            count += 1;
            off += ELF64_DYN_SIZE;
        }
        count
    }

    /// Iterate the dynamic symbol table as `(index, symbol)` pairs.
    pub fn dynsym_iter(&self) -> impl Iterator<Item = (u32, Elf64Sym)> + '_ {
        let base = self.dyn_info.symtab as usize;
        let count = self.header.dynsym.size as usize / ELF64_SYM_SIZE;
        (0..count).map_while(move |i| {
            let off = base.checked_add(i * ELF64_SYM_SIZE)?;
            if off <= self.image.len().checked_sub(ELF64_SYM_SIZE)? {
                Some((i as u32, Elf64Sym::parse(&self.image, off)))
            } else {
                None
            }
        })
    }

    /// Number of entries in the dynamic symbol table.
    pub fn dynsym_count(&self) -> u64 {
        self.header.dynsym.size as u64 / ELF64_SYM_SIZE as u64
    }

    /// Build the segment table for a raw MOD image, which has no outer header
    /// declaring one. The layout is recovered from the PLT location and from
    /// the section indices observed in `.dynsym`; see the loader docs.
    fn synthesize_mod_segments(&mut self, mod_header: &ModHeader) -> Result<()> {
        self.plt = infer::resolve_plt(&self.image, 0, self.image.len(), self.dyn_info.pltrelsz);
        let plt = self.plt.ok_or_else(|| {
            Error::UnsupportedContainerShape(
                "raw MOD requires .plt. please report this.".to_string(),
            )
        })?;
        if self.dyn_info.symtab >= self.dyn_info.strtab
            || self.dyn_info.strtab as usize > self.image.len()
        {
            return Err(Error::UnsupportedContainerShape(
                "raw MOD requires .dynstr directly after .dynsym. please report this.".to_string(),
            ));
        }
        // Needed up front so the dynsym iteration below has a length.
        self.header.dynsym.size = (self.dyn_info.strtab - self.dyn_info.symtab) as u32;

        // Relies on every section having at least one symbol pointing into it,
        // and a section symbol existing for .data.
        let mut seen_shndx: Vec<u16> = self
            .dynsym_iter()
            .filter(|(_, sym)| sym.st_shndx != SHN_UNDEF && sym.st_shndx < SHN_LORESERVE)
            .map(|(_, sym)| sym.st_shndx)
            .collect();
        seen_shndx.sort_unstable();
        seen_shndx.dedup();
        if seen_shndx.len() != NUM_SEGMENTS + 1 {
            return Err(Error::UnsupportedContainerShape(
                "raw MOD failed to find .data in .dynsym. please report this.".to_string(),
            ));
        }

        let data_shndx = seen_shndx[DATA];
        let data_offset = self
            .dynsym_iter()
            .find(|(_, sym)| {
                sym.sym_type() == STT_SECTION && sym.st_shndx == data_shndx && sym.st_value != 0
            })
            .map(|(_, sym)| sym.st_value as u32)
            .unwrap_or(0);
        if data_offset == 0 {
            return Err(Error::UnsupportedContainerShape(
                "raw MOD failed to find .data in .dynsym. please report this.".to_string(),
            ));
        }

        let mut extents = [DataExtent::default(); NUM_SEGMENTS];
        extents[TEXT].offset = 0;
        extents[TEXT].size = (plt.addr + plt.size) as u32;
        extents[RODATA].offset =
            align_up((extents[TEXT].offset + extents[TEXT].size) as u64, 0x1000) as u32;
        extents[RODATA].size = data_offset - extents[RODATA].offset;
        extents[DATA].offset = data_offset;
        extents[DATA].size = (self.image.len() - data_offset as usize) as u32;

        self.header.dynstr.offset = (self.dyn_info.strtab as u32) - extents[RODATA].offset;
        self.header.dynstr.size = self.dyn_info.strsz as u32;
        self.header.dynsym.offset = (self.dyn_info.symtab as u32) - extents[RODATA].offset;

        // The BSS proper is what init code clears, but an "end" symbol points
        // at the page-aligned boundary and must land inside the section, so
        // pad one byte past it.
        let bss = self
            .mod_get_offset(mod_header.bss_end_offset)
            .wrapping_sub(self.mod_get_offset(mod_header.bss_start_offset));
        let data_bss_align = (align_up(bss, 0x1000) + 1) as u32;

        for i in 0..NUM_SEGMENTS {
            let seg = &mut self.header.segments[i];
            seg.mem_offset = extents[i].offset;
            seg.file_offset = extents[i].offset;
            seg.mem_size = extents[i].size;
            self.header.segment_file_sizes[i] = extents[i].size;
            seg.bss_align = match i {
                TEXT => 0x100,
                RODATA => 1,
                _ => data_bss_align,
            };
        }
        Ok(())
    }

    /// Scan rodata, text, data (in that order) backwards for a GNU build-id
    /// note. The needle is a fully-typed note header prefix plus the "GNU"
    /// owner, for the two descriptor lengths seen in practice (MD5, SHA1).
    fn find_build_id_note(&mut self) {
        let mut needles = [[0u8; 16]; 2];
        for (needle, descsz) in needles.iter_mut().zip([16u32, 20u32]) {
            w32(needle, 0, 4); // n_namesz: "GNU\0"
            w32(needle, 4, descsz);
            w32(needle, 8, 3); // NT_GNU_BUILD_ID
            write_bytes(needle, 12, b"GNU\0");
        }
        for seg_index in [RODATA, TEXT, DATA] {
            let seg = self.header.segments[seg_index];
            let start = seg.mem_offset as usize;
            let end = (start + seg.mem_size as usize).min(self.image.len());
            if start >= end {
                continue;
            }
            for needle in &needles {
                if let Some(pos) = memmemr(&self.image[start..end], needle) {
                    self.note_off = Some((start + pos) as u64);
                    return;
                }
            }
        }
    }

    /// For raw-MOD inputs the header has no build-id field; fill it from the
    /// discovered note's descriptor.
    fn copy_note_build_id(&mut self) {
        if let Some(note_off) = self.note_off {
            let nhdr = Elf64Nhdr::parse(&self.image, note_off as usize);
            let desc_start = note_off as usize + ELF64_NHDR_SIZE + nhdr.n_namesz as usize;
            let desc_len = (nhdr.n_descsz as usize).min(self.header.gnu_build_id.len());
            if desc_start + desc_len <= self.image.len() {
                self.header.gnu_build_id[..desc_len]
                    .copy_from_slice(&self.image[desc_start..desc_start + desc_len]);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Hand-built container images shared by the loader, inference, and
    //! emitter tests. The layout is documented inline; tests assert against
    //! the literal offsets used here.

    use crate::elf::*;
    use super::*;

    pub const PLT_RESOLVER_WORDS: [u32; 8] = [
        0xa9bf7bf0, 0xd00004d0, 0xf9428a11, 0x91144210,
        0xd61f0220, 0xd503201f, 0xd503201f, 0xd503201f,
    ];

    pub fn put_u32(buf: &mut [u8], off: usize, val: u32) {
        w32(buf, off, val);
    }

    pub fn put_u64(buf: &mut [u8], off: usize, val: u64) {
        w64(buf, off, val);
    }

    fn put_dyn(buf: &mut [u8], off: usize, tag: i64, val: u64) {
        put_u64(buf, off, tag as u64);
        put_u64(buf, off + 8, val);
    }

    fn put_sym(buf: &mut [u8], off: usize, name: u32, info: u8, shndx: u16, value: u64, size: u64) {
        put_u32(buf, off, name);
        buf[off + 4] = info;
        buf[off + 5] = 0;
        w16(buf, off + 6, shndx);
        put_u64(buf, off + 8, value);
        put_u64(buf, off + 16, size);
    }

    fn put_rela(buf: &mut [u8], off: usize, r_offset: u64, sym: u32, r_type: u32) {
        put_u64(buf, off, r_offset);
        put_u64(buf, off + 8, ((sym as u64) << 32) | r_type as u64);
        put_u64(buf, off + 16, 0);
    }

    /// Build the flat image used by the NSO fixture:
    ///
    /// ```text
    /// text   0x000..0x100  ModPointer@0, init@0x10, fini@0x18, MOD@0x40, plt@0x80
    /// rodata 0x100..0x200  dynstr@0x100, dynsym@0x120, note@0x180, eh_hdr@0x1a0,
    ///                      eh_frame@0x1c0
    /// data   0x200..0x400  dynamic@0x200, rela.dyn@0x310, rela.plt@0x328,
    ///                      init_array@0x340, fini_array@0x350, hash@0x358,
    ///                      gnu.hash@0x380, got.plt@0x3a8, got@0x3b8
    /// bss    0x400..0x440
    /// ```
    pub fn build_image() -> Vec<u8> {
        let mut img = vec![0u8; 0x440];

        // ModPointer
        put_u32(&mut img, 0x00, 0);
        put_u32(&mut img, 0x04, 0x40);
        // .init: nop; ret
        put_u32(&mut img, 0x10, 0xd503201f);
        put_u32(&mut img, 0x14, 0xd65f03c0);
        // .fini: nop; b
        put_u32(&mut img, 0x18, 0xd503201f);
        put_u32(&mut img, 0x1c, 0x14000000);
        // MOD header
        img[0x40..0x44].copy_from_slice(&MOD_MAGIC);
        put_u32(&mut img, 0x44, 0x1c0); // dynamic @0x200
        put_u32(&mut img, 0x48, 0x3c0); // bss start @0x400
        put_u32(&mut img, 0x4c, 0x400); // bss end @0x440
        put_u32(&mut img, 0x50, 0x160); // eh hdr @0x1a0
        put_u32(&mut img, 0x54, 0x170); // eh hdr end @0x1b0
        put_u32(&mut img, 0x58, 0);
        // PLT: resolver + one 16-byte entry
        for (i, word) in PLT_RESOLVER_WORDS.iter().enumerate() {
            put_u32(&mut img, 0x80 + i * 4, *word);
        }
        for (i, word) in [0x90000010u32, 0xf9400211, 0xd61f0220, 0xd503201f].iter().enumerate() {
            put_u32(&mut img, 0xa0 + i * 4, *word);
        }

        // dynstr: "\0main\0data_obj\0bss_obj\0"
        img[0x100..0x117].copy_from_slice(b"\0main\0data_obj\0bss_obj\0");
        // dynsym: null, main (local func, text), data_obj, bss_obj
        put_sym(&mut img, 0x120, 0, 0, 0, 0, 0);
        put_sym(&mut img, 0x138, 1, 0x02, 1, 0x10, 8);
        put_sym(&mut img, 0x150, 6, 0x11, 3, 0x210, 8);
        put_sym(&mut img, 0x168, 15, 0x11, 4, 0x400, 8);
        // GNU build-id note (MD5)
        put_u32(&mut img, 0x180, 4);
        put_u32(&mut img, 0x184, 16);
        put_u32(&mut img, 0x188, 3);
        img[0x18c..0x190].copy_from_slice(b"GNU\0");
        for b in &mut img[0x190..0x1a0] {
            *b = 0xaa;
        }
        // .eh_frame_hdr: version 1, eh_frame_ptr as absolute udata4
        img[0x1a0] = 1;
        img[0x1a1] = 0x03; // eh_frame_ptr_enc: udata4
        img[0x1a2] = 0x03; // fde_count_enc
        img[0x1a3] = 0x3b; // table_enc
        put_u32(&mut img, 0x1a4, 0x1c0);
        // .eh_frame: one 12-byte record, then terminator
        put_u32(&mut img, 0x1c0, 12);
        put_u32(&mut img, 0x1d0, 0);

        // dynamic table
        let dt = [
            (DT_SYMTAB, 0x120u64),
            (DT_STRTAB, 0x100),
            (DT_STRSZ, 23),
            (DT_RELA, 0x310),
            (DT_RELASZ, 24),
            (DT_JMPREL, 0x328),
            (DT_PLTRELSZ, 24),
            (DT_PLTGOT, 0x3a8),
            (DT_HASH, 0x358),
            (DT_GNU_HASH, 0x380),
            (DT_INIT, 0x10),
            (DT_FINI, 0x18),
            (DT_INIT_ARRAY, 0x340),
            (DT_INIT_ARRAYSZ, 16),
            (DT_FINI_ARRAY, 0x350),
            (DT_FINI_ARRAYSZ, 8),
        ];
        for (i, (tag, val)) in dt.iter().enumerate() {
            put_dyn(&mut img, 0x200 + i * 16, *tag, *val);
        }
        // terminator is already zero

        // rela.dyn: one GLOB_DAT into .got
        put_rela(&mut img, 0x310, 0x3c0, 0, R_AARCH64_GLOB_DAT);
        // rela.plt: one JUMP_SLOT into .got.plt
        put_rela(&mut img, 0x328, 0x3b0, 0, R_AARCH64_JUMP_SLOT);
        // .hash: nbucket=1, nchain=4
        put_u32(&mut img, 0x358, 1);
        put_u32(&mut img, 0x35c, 4);
        // .gnu.hash: nbuckets=1, symndx=1, maskwords=1, shift2=6
        put_u32(&mut img, 0x380, 1);
        put_u32(&mut img, 0x384, 1);
        put_u32(&mut img, 0x388, 1);
        put_u32(&mut img, 0x38c, 6);
        // .got: pointer back to the dynamic table
        put_u64(&mut img, 0x3b8, 0x200);

        img
    }

    /// Wrap the fixture image in an uncompressed NSO file.
    pub fn build_nso(flags: u32) -> Vec<u8> {
        let image = build_image();
        let mut header = NsoHeader {
            flags,
            ..NsoHeader::default()
        };
        header.segments[TEXT] =
            SegmentHeader { file_offset: 0, mem_offset: 0, mem_size: 0x100, bss_align: 0x100 };
        header.segments[RODATA] =
            SegmentHeader { file_offset: 0, mem_offset: 0x100, mem_size: 0x100, bss_align: 1 };
        header.segments[DATA] =
            SegmentHeader { file_offset: 0, mem_offset: 0x200, mem_size: 0x200, bss_align: 0x40 };
        header.dynstr = DataExtent { offset: 0, size: 23 };
        header.dynsym = DataExtent { offset: 0x20, size: 96 };
        header.gnu_build_id[..4].copy_from_slice(&[1, 2, 3, 4]);

        let mut payload: Vec<Vec<u8>> = Vec::new();
        for i in 0..NUM_SEGMENTS {
            let seg = header.segments[i];
            let raw = &image[seg.mem_offset as usize..(seg.mem_offset + seg.mem_size) as usize];
            if flags & (1 << i) != 0 {
                payload.push(lz4_flex::block::compress(raw));
            } else {
                payload.push(raw.to_vec());
            }
        }
        let mut offset = NSO_HEADER_SIZE as u32;
        for i in 0..NUM_SEGMENTS {
            header.segments[i].file_offset = offset;
            header.segment_file_sizes[i] = payload[i].len() as u32;
            offset += payload[i].len() as u32;
        }

        let mut file = vec![0u8; NSO_HEADER_SIZE];
        header.write_to(&mut file);
        for chunk in payload {
            file.extend_from_slice(&chunk);
        }
        file
    }

    /// Build a minimal NRO: no PLT, no note, no usable EH, 0x1000-byte BSS.
    pub fn build_nro() -> Vec<u8> {
        let mut file = vec![0u8; 0x200];
        // ModPointer
        put_u32(&mut file, 0x00, 0);
        put_u32(&mut file, 0x04, 0x80);
        // NRO header at 0x10
        file[0x10..0x14].copy_from_slice(&NRO_MAGIC);
        put_u32(&mut file, 0x18, 0x200); // file_size
        put_u32(&mut file, 0x20, 0); // text extent
        put_u32(&mut file, 0x24, 0x100);
        put_u32(&mut file, 0x28, 0x100); // rodata extent
        put_u32(&mut file, 0x2c, 0x80);
        put_u32(&mut file, 0x30, 0x180); // data extent
        put_u32(&mut file, 0x34, 0x80);
        put_u32(&mut file, 0x38, 0x1000); // bss_size
        put_u32(&mut file, 0x70, 0); // dynstr extent
        put_u32(&mut file, 0x74, 8);
        put_u32(&mut file, 0x78, 8); // dynsym extent
        put_u32(&mut file, 0x7c, 24);
        // MOD header at 0x80
        file[0x80..0x84].copy_from_slice(&MOD_MAGIC);
        put_u32(&mut file, 0x84, 0x100); // dynamic @0x180
        put_u32(&mut file, 0x88, 0x180); // bss start (unused here)
        put_u32(&mut file, 0x8c, 0x180);
        put_u32(&mut file, 0x90, 0x80); // eh start @0x100 (not a valid header)
        put_u32(&mut file, 0x94, 0x80);
        // dynamic table at 0x180
        put_dyn(&mut file, 0x180, DT_SYMTAB, 0x108);
        put_dyn(&mut file, 0x190, DT_STRTAB, 0x100);
        put_dyn(&mut file, 0x1a0, DT_STRSZ, 8);
        file
    }

    /// Build a raw MOD image: PLT at 0x100, dynsym/dynstr in the rodata
    /// region, data section symbol at 0x2000, BSS bounds 0x2800..0x2900.
    pub fn build_raw_mod(distinct_shndx: usize) -> Vec<u8> {
        let mut img = vec![0u8; 0x3000];
        put_u32(&mut img, 0x00, 0);
        put_u32(&mut img, 0x04, 0x20);
        img[0x20..0x24].copy_from_slice(&MOD_MAGIC);
        put_u32(&mut img, 0x24, 0x20e0); // dynamic @0x2100
        put_u32(&mut img, 0x28, 0x27e0); // bss start @0x2800
        put_u32(&mut img, 0x2c, 0x28e0); // bss end @0x2900
        put_u32(&mut img, 0x30, 0xfe0); // eh @0x1000 (not a valid header)
        put_u32(&mut img, 0x34, 0xfe0);

        for (i, word) in PLT_RESOLVER_WORDS.iter().enumerate() {
            put_u32(&mut img, 0x100 + i * 4, *word);
        }

        // dynsym at 0x1100: null + symbols covering `distinct_shndx` sections
        let symtab = 0x1100usize;
        let mut off = symtab;
        put_sym(&mut img, off, 0, 0, 0, 0, 0);
        off += ELF64_SYM_SIZE;
        let section_syms: [(u8, u16, u64); 4] = [
            (0x02, 1, 0x80),
            (0x02, 2, 0x1100),
            (0x03, 3, 0x2000), // STT_SECTION for .data
            (0x11, 4, 0x2900),
        ];
        for &(info, shndx, value) in section_syms.iter().take(distinct_shndx) {
            put_sym(&mut img, off, 0, info, shndx, value, 0);
            off += ELF64_SYM_SIZE;
        }
        let strtab = off;
        img[strtab..strtab + 8].copy_from_slice(b"\0a\0b\0c\0d");

        put_dyn(&mut img, 0x2100, DT_SYMTAB, symtab as u64);
        put_dyn(&mut img, 0x2110, DT_STRTAB, strtab as u64);
        put_dyn(&mut img, 0x2120, DT_STRSZ, 8);
        put_dyn(&mut img, 0x2130, DT_PLTRELSZ, 24);
        put_dyn(&mut img, 0x2140, DT_JMPREL, 0x2200);
        put_rela(&mut img, 0x2200, 0x2300, 0, R_AARCH64_JUMP_SLOT);
        img
    }
}
