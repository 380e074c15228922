//! The mutable string table backing an AXML string-pool chunk.

use crate::error::{Error, Result};
use crate::res::{ChunkType, ResChunkHeader, ResStringPoolHeader};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::io::Cursor;

/// Decodes one length-prefixed pool string starting at `bytes[0]`, in
/// either of the two encodings the format allows. Returns the string and
/// the number of bytes consumed including the trailing NUL.
pub fn decode_string(bytes: &[u8], utf8: bool) -> Result<(String, usize)> {
    let truncated = || Error::template("string data extends past the end of the pool");
    if utf8 {
        // Character count (1 or 2 bytes, unused here), then byte count.
        let mut offset = 0;
        let head = *bytes.first().ok_or_else(truncated)?;
        offset += if head & 0x80 != 0 { 2 } else { 1 };
        let head = *bytes.get(offset).ok_or_else(truncated)?;
        offset += 1;
        let len = if head & 0x80 != 0 {
            let low = *bytes.get(offset).ok_or_else(truncated)?;
            offset += 1;
            (((head & 0x7f) as usize) << 8) | low as usize
        } else {
            head as usize
        };
        let data = bytes.get(offset..offset + len).ok_or_else(truncated)?;
        let value = std::str::from_utf8(data)
            .map_err(|_| Error::template("invalid UTF-8 string data"))?
            .to_string();
        Ok((value, offset + len + 1))
    } else {
        if bytes.len() < 2 {
            return Err(truncated());
        }
        let mut offset = 2;
        let head = LittleEndian::read_u16(bytes) as usize;
        let len = if head & 0x8000 != 0 {
            if bytes.len() < 4 {
                return Err(truncated());
            }
            offset = 4;
            ((head & 0x7fff) << 16) | LittleEndian::read_u16(&bytes[2..]) as usize
        } else {
            head
        };
        let data = bytes
            .get(offset..offset + len * 2)
            .ok_or_else(truncated)?;
        let mut units = Vec::with_capacity(len);
        for unit in data.chunks_exact(2) {
            units.push(LittleEndian::read_u16(unit));
        }
        let value = String::from_utf16(&units)
            .map_err(|_| Error::template("invalid UTF-16 string data"))?;
        Ok((value, offset + len * 2 + 2))
    }
}

fn encode_utf16(value: &str, out: &mut Vec<u8>) {
    let len = value.encode_utf16().count();
    if len >= 0x8000 {
        out.extend_from_slice(&(0x8000 | (len >> 16) as u16).to_le_bytes());
    }
    out.extend_from_slice(&(len as u16).to_le_bytes());
    for unit in value.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out.extend_from_slice(&0u16.to_le_bytes());
}

fn encoded_len(value: &str) -> usize {
    let len = value.encode_utf16().count();
    let prefix = if len >= 0x8000 { 4 } else { 2 };
    prefix + len * 2 + 2
}

/// The decoded string table of one pool chunk. Existing entries keep their
/// index for the lifetime of the pool; new values are only ever appended,
/// so indices referenced elsewhere in the document stay valid.
#[derive(Clone, Debug)]
pub struct StringPool {
    strings: Vec<String>,
    flags: u32,
    /// Bytes between the last decoded string and the end of the chunk,
    /// carried through opaquely.
    extra: Vec<u8>,
}

impl StringPool {
    /// Parses a complete string-pool chunk, chunk header included.
    ///
    /// Only UTF-16 pools are implemented; a UTF-8-flagged pool fails with
    /// [`Error::UnsupportedEncoding`] rather than being mis-decoded.
    pub fn parse(chunk: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(chunk);
        let header = ResChunkHeader::read(&mut r)?;
        if header.ty != ChunkType::StringPool as u16 {
            return Err(Error::template("expected a string pool chunk"));
        }
        if header.size as usize != chunk.len() {
            return Err(Error::template("string pool chunk size mismatch"));
        }
        let pool = ResStringPoolHeader::read(&mut r)?;
        if pool.is_utf8() {
            return Err(Error::UnsupportedEncoding(
                "UTF-8 string pools are not implemented",
            ));
        }
        if pool.style_count != 0 {
            return Err(Error::template("styled string pools are not supported"));
        }

        let offsets_base = header.header_size as usize;
        let data_base = pool.strings_start as usize;
        let mut strings = Vec::with_capacity(pool.string_count as usize);
        let mut data_end = data_base.min(chunk.len());
        for i in 0..pool.string_count as usize {
            let entry = chunk
                .get(offsets_base + i * 4..offsets_base + i * 4 + 4)
                .ok_or_else(|| Error::template("string offset table out of bounds"))?;
            let at = data_base + LittleEndian::read_u32(entry) as usize;
            let tail = chunk
                .get(at..)
                .ok_or_else(|| Error::template("string offset out of bounds"))?;
            let (value, consumed) = decode_string(tail, false)?;
            data_end = data_end.max(at + consumed);
            strings.push(value);
        }
        let extra = chunk[data_end..].to_vec();
        Ok(Self {
            strings,
            flags: pool.flags,
            extra,
        })
    }

    /// An empty pool, used when building documents from scratch in tests.
    pub fn new() -> Self {
        Self {
            strings: Vec::new(),
            flags: 0,
            extra: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.strings.get(index).map(String::as_str)
    }

    /// Resolves an index field that uses -1 as a "none" sentinel.
    pub fn get_ref(&self, index: i32) -> Option<&str> {
        usize::try_from(index).ok().and_then(|i| self.get(i))
    }

    pub fn find(&self, value: &str) -> Option<usize> {
        self.strings.iter().position(|s| s == value)
    }

    pub fn push(&mut self, value: impl Into<String>) -> usize {
        self.strings.push(value.into());
        self.strings.len() - 1
    }

    /// Index of `value`, appending it if the pool does not contain it yet.
    pub fn ensure(&mut self, value: &str) -> usize {
        self.find(value)
            .unwrap_or_else(|| self.push(value.to_string()))
    }

    pub fn set(&mut self, index: usize, value: impl Into<String>) -> Result<()> {
        let slot = self
            .strings
            .get_mut(index)
            .ok_or_else(|| Error::template("attribute references a string out of range"))?;
        *slot = value.into();
        Ok(())
    }

    /// Re-serializes the whole chunk: offset table, UTF-16 payload,
    /// retained trailing bytes, padded to 4 bytes, headers rewritten.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let offsets_base = ResChunkHeader::SIZE + ResStringPoolHeader::SIZE;
        let strings_start = offsets_base + self.strings.len() * 4;
        let mut out = Vec::with_capacity(strings_start);
        ResChunkHeader {
            ty: ChunkType::StringPool as u16,
            header_size: offsets_base as u16,
            size: 0, // patched below
        }
        .write(&mut out)?;
        ResStringPoolHeader {
            string_count: self.strings.len() as u32,
            style_count: 0,
            flags: self.flags
                & !(ResStringPoolHeader::UTF8_FLAG | ResStringPoolHeader::SORTED_FLAG),
            strings_start: strings_start as u32,
            styles_start: 0,
        }
        .write(&mut out)?;
        let mut offset = 0u32;
        for value in &self.strings {
            out.write_u32::<LittleEndian>(offset)?;
            offset += encoded_len(value) as u32;
        }
        for value in &self.strings {
            encode_utf16(value, &mut out);
        }
        out.extend_from_slice(&self.extra);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        let size = out.len() as u32;
        LittleEndian::write_u32(&mut out[4..8], size);
        Ok(out)
    }
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}
