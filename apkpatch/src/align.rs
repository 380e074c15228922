//! The raw realignment pass: a second sweep over the finished archive
//! that pads stored entries so their data starts on a 4-byte boundary,
//! leaving every payload byte untouched.

use crate::error::Result;
use std::io::{Read, Seek, Write};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const ALIGNMENT: u16 = 4;

/// Re-streams `src` into `dst` without recompressing anything. Stored
/// entries grow extra-field padding computed from the destination write
/// position, which already accounts for all padding inserted before them;
/// compressed entries are copied raw with their CRC and sizes preserved.
pub fn align_archive<R: Read + Seek, W: Write + Seek>(
    src: R,
    dst: W,
    alignment: u16,
) -> Result<W> {
    let mut zin = ZipArchive::new(src)?;
    let mut zout = ZipWriter::new(dst);
    for i in 0..zin.len() {
        let mut entry = zin.by_index_raw(i)?;
        if entry.compression() == CompressionMethod::Stored {
            // Raw bytes and content bytes coincide for stored entries.
            let name = entry.name().to_string();
            let mut data = Vec::with_capacity(entry.compressed_size() as usize);
            entry.read_to_end(&mut data)?;
            drop(entry);
            let options = FileOptions::default().compression_method(CompressionMethod::Stored);
            zout.start_file_aligned(name, options, alignment)?;
            zout.write_all(&data)?;
        } else {
            zout.raw_copy_file(entry)?;
        }
    }
    Ok(zout.finish()?)
}

#[derive(Clone, Debug)]
pub struct Misaligned {
    pub name: String,
    pub offset: u64,
}

/// Every stored entry whose data offset is not a multiple of `alignment`.
pub fn check_alignment<R: Read + Seek>(src: R, alignment: u64) -> Result<Vec<Misaligned>> {
    let mut zip = ZipArchive::new(src)?;
    let mut bad = Vec::new();
    for i in 0..zip.len() {
        let entry = zip.by_index_raw(i)?;
        if entry.compression() == CompressionMethod::Stored && entry.data_start() % alignment != 0
        {
            bad.push(Misaligned {
                name: entry.name().to_string(),
                offset: entry.data_start(),
            });
        }
    }
    Ok(bad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::build_zip;
    use crate::archive::Compression;
    use std::io::Cursor;

    fn snapshot(bytes: &[u8]) -> Result<Vec<(String, u32, Vec<u8>)>> {
        let mut zip = ZipArchive::new(Cursor::new(bytes))?;
        let mut out = Vec::new();
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i)?;
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            out.push((entry.name().to_string(), entry.crc32(), data));
        }
        Ok(out)
    }

    #[test]
    fn aligns_stored_entries_and_preserves_content() -> Result<()> {
        // Odd-length stored payloads force misalignment in the input.
        let src = build_zip(&[
            ("a.bin", b"abc", Compression::Stored),
            ("b.txt", b"some text that deflates", Compression::Deflated),
            ("c.bin", b"defgh", Compression::Stored),
            ("d.bin", b"i", Compression::Stored),
        ]);
        assert!(!check_alignment(Cursor::new(&src[..]), ALIGNMENT as u64)?.is_empty());

        let out = align_archive(Cursor::new(&src[..]), Cursor::new(Vec::new()), ALIGNMENT)?
            .into_inner();
        assert!(check_alignment(Cursor::new(&out[..]), ALIGNMENT as u64)?.is_empty());
        assert_eq!(snapshot(&src)?, snapshot(&out)?);
        Ok(())
    }

    #[test]
    fn compressed_entries_are_copied_raw() -> Result<()> {
        let src = build_zip(&[
            ("x.bin", b"z", Compression::Stored),
            ("y.txt", b"compressible compressible compressible", Compression::Deflated),
        ]);
        let out = align_archive(Cursor::new(&src[..]), Cursor::new(Vec::new()), ALIGNMENT)?
            .into_inner();

        let mut zin = ZipArchive::new(Cursor::new(&src[..]))?;
        let mut zout = ZipArchive::new(Cursor::new(&out[..]))?;
        let src_entry = zin.by_name("y.txt")?;
        let dst_entry = zout.by_name("y.txt")?;
        assert_eq!(src_entry.compressed_size(), dst_entry.compressed_size());
        assert_eq!(src_entry.crc32(), dst_entry.crc32());
        assert_eq!(dst_entry.compression(), CompressionMethod::Deflated);
        Ok(())
    }
}
