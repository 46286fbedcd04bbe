//! Uncompressed-NSO writer: re-emit the loaded image as an NSO whose
//! segments are stored verbatim, for tools that can read the container but
//! not its LZ4 framing.

use crate::container::{NxFile, DATA, NSO_HEADER_SIZE, NUM_SEGMENTS, RODATA, TEXT};

/// Rewrite the container as an uncompressed NSO: compression flags cleared,
/// file offsets packed directly after the header, file sizes equal to memory
/// sizes. Running this on its own output is a fixed point.
pub fn write_uncompressed_nso(nx: &NxFile) -> Vec<u8> {
    let mut header = nx.header.clone();
    // Clear the per-segment compression flags.
    header.flags &= 0xf8;
    for i in 0..NUM_SEGMENTS {
        header.segments[i].file_offset = header.segments[i].mem_offset + NSO_HEADER_SIZE as u32;
        header.segment_file_sizes[i] = header.segments[i].mem_size;
    }
    header.segments[TEXT].bss_align = 0x100;
    header.segments[RODATA].bss_align = 0;

    let image_size =
        header.segments[DATA].mem_offset as usize + header.segments[DATA].mem_size as usize;
    let mut out = vec![0u8; NSO_HEADER_SIZE + image_size];
    header.write_to(&mut out);
    out[NSO_HEADER_SIZE..].copy_from_slice(&nx.image[..image_size]);
    out
}
