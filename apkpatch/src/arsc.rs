//! Rewrites the leading string pool of a compiled resource table,
//! replacing the display-name marker strings the template ships with.
//!
//! Only the pool is touched; resource entries, types and configurations
//! after it are appended unexamined. The output pool is always UTF-16,
//! whatever the input encoding was.

use crate::config::ExportConfig;
use crate::error::{Error, Result};
use crate::res::ResStringPoolHeader;
use crate::strings::decode_string;
use byteorder::{ByteOrder, LittleEndian};
use std::collections::BTreeMap;

/// Prefix of the pool strings holding the application display name. The
/// bare marker is the base name; `<marker>-<locale>` entries carry the
/// localized variants.
pub const APP_NAME_MARKER: &str = "template-app-name";

/// Offset of the string pool chunk inside the table.
const POOL_START: usize = 12;
/// Offset of the first string offset, fixed by the table layout.
const TABLE_BEGIN: usize = 40;

#[derive(Clone, Debug)]
pub struct ResourcePatch<'a> {
    pub app_name: &'a str,
    /// Display names per locale tag (`fr`, `pt_BR`); the base name is the
    /// fallback for tags without an override.
    pub locale_names: &'a BTreeMap<String, String>,
}

impl<'a> ResourcePatch<'a> {
    pub fn new(config: &'a ExportConfig) -> Self {
        Self {
            app_name: config.app_name(),
            locale_names: &config.app_name_locales,
        }
    }

    fn display_name(&self, marker: &str) -> Option<&str> {
        let rest = marker.strip_prefix(APP_NAME_MARKER)?;
        if let Some(tag) = rest.strip_prefix('-') {
            let locale = tag.replace('-', "_");
            Some(
                self.locale_names
                    .get(&locale)
                    .map(String::as_str)
                    .unwrap_or(self.app_name),
            )
        } else if rest.is_empty() {
            Some(self.app_name)
        } else {
            None
        }
    }
}

/// Rewrites a complete resource table and returns the new bytes.
pub fn patch_resources(table: &[u8], patch: &ResourcePatch) -> Result<Vec<u8>> {
    if table.len() < TABLE_BEGIN {
        return Err(Error::template("resource table is truncated"));
    }
    let block_len = LittleEndian::read_u32(&table[16..20]) as usize;
    let string_count = LittleEndian::read_u32(&table[20..24]) as usize;
    let style_count = LittleEndian::read_u32(&table[24..28]);
    let flags = LittleEndian::read_u32(&table[28..32]);
    let strings_start = LittleEndian::read_u32(&table[32..36]) as usize;
    if style_count != 0 {
        return Err(Error::template("styled resource string pools are not supported"));
    }
    let utf8 = flags & ResStringPoolHeader::UTF8_FLAG != 0;

    let data_base = POOL_START + strings_start;
    let mut strings = Vec::with_capacity(string_count);
    for i in 0..string_count {
        let entry = table
            .get(TABLE_BEGIN + i * 4..TABLE_BEGIN + i * 4 + 4)
            .ok_or_else(|| Error::template("resource string offset table out of bounds"))?;
        let at = data_base + LittleEndian::read_u32(entry) as usize;
        let tail = table
            .get(at..)
            .ok_or_else(|| Error::template("resource string offset out of bounds"))?;
        let (value, _) = decode_string(tail, utf8)?;
        match patch.display_name(&value) {
            Some(name) => strings.push(name.to_string()),
            None => strings.push(value),
        }
    }

    // Rebuild the pool in UTF-16 behind the untouched table header.
    let mut out = Vec::with_capacity(table.len());
    out.extend_from_slice(&table[..TABLE_BEGIN]);
    let mut offset = 0u32;
    for value in &strings {
        out.extend_from_slice(&offset.to_le_bytes());
        let len = value.encode_utf16().count() as u32;
        offset += 2 + len * 2 + 2;
    }
    for value in &strings {
        let len = value.encode_utf16().count() as u16;
        out.extend_from_slice(&len.to_le_bytes());
        for unit in value.encode_utf16() {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out.extend_from_slice(&0u16.to_le_bytes());
    }
    while out.len() % 4 != 0 {
        out.push(0);
    }

    let cleared =
        flags & !(ResStringPoolHeader::UTF8_FLAG | ResStringPoolHeader::SORTED_FLAG);
    LittleEndian::write_u32(&mut out[28..32], cleared);
    LittleEndian::write_u32(&mut out[32..36], (TABLE_BEGIN - POOL_START + string_count * 4) as u32);
    let new_block_len = (out.len() - POOL_START) as u32;
    LittleEndian::write_u32(&mut out[16..20], new_block_len);

    let rest_from = POOL_START + block_len;
    let rest = table
        .get(rest_from..)
        .ok_or_else(|| Error::template("resource string pool size out of bounds"))?;
    out.extend_from_slice(rest);
    let total = out.len() as u32;
    LittleEndian::write_u32(&mut out[4..8], total);
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::strings::StringPool;

    const REST: &[u8] = b"\x01\x02\x00\x02resource entries";

    pub fn build_table(strings: &[&str]) -> Vec<u8> {
        let mut pool = StringPool::new();
        for s in strings {
            pool.push(*s);
        }
        let pool_bytes = pool.serialize().unwrap();
        assemble(&pool_bytes)
    }

    fn build_utf8_table(strings: &[&str]) -> Vec<u8> {
        let mut chunk = vec![];
        chunk.extend_from_slice(&0x0001u16.to_le_bytes());
        chunk.extend_from_slice(&28u16.to_le_bytes());
        chunk.extend_from_slice(&0u32.to_le_bytes()); // size, patched below
        chunk.extend_from_slice(&(strings.len() as u32).to_le_bytes());
        chunk.extend_from_slice(&0u32.to_le_bytes());
        chunk.extend_from_slice(&ResStringPoolHeader::UTF8_FLAG.to_le_bytes());
        chunk.extend_from_slice(&((28 + strings.len() * 4) as u32).to_le_bytes());
        chunk.extend_from_slice(&0u32.to_le_bytes());
        let mut data = vec![];
        let mut offsets = vec![];
        for s in strings {
            offsets.extend_from_slice(&(data.len() as u32).to_le_bytes());
            data.push(s.chars().count() as u8);
            data.push(s.len() as u8);
            data.extend_from_slice(s.as_bytes());
            data.push(0);
        }
        chunk.extend_from_slice(&offsets);
        chunk.extend_from_slice(&data);
        while chunk.len() % 4 != 0 {
            chunk.push(0);
        }
        let size = chunk.len() as u32;
        LittleEndian::write_u32(&mut chunk[4..8], size);
        assemble(&chunk)
    }

    fn assemble(pool_chunk: &[u8]) -> Vec<u8> {
        let mut table = vec![];
        table.extend_from_slice(&0x0002u16.to_le_bytes());
        table.extend_from_slice(&12u16.to_le_bytes());
        table.extend_from_slice(&0u32.to_le_bytes()); // size, patched below
        table.extend_from_slice(&1u32.to_le_bytes()); // package count
        table.extend_from_slice(pool_chunk);
        table.extend_from_slice(REST);
        let total = table.len() as u32;
        LittleEndian::write_u32(&mut table[4..8], total);
        table
    }

    pub fn output_strings(table: &[u8]) -> Vec<String> {
        let block_len = LittleEndian::read_u32(&table[16..20]) as usize;
        let pool = StringPool::parse(&table[POOL_START..POOL_START + block_len]).unwrap();
        (0..pool.len())
            .map(|i| pool.get(i).unwrap().to_string())
            .collect()
    }

    fn patch_input() -> (String, BTreeMap<String, String>) {
        let mut locales = BTreeMap::new();
        locales.insert("fr".to_string(), "Mon Jeu".to_string());
        ("My Game".to_string(), locales)
    }

    #[test]
    fn replaces_marker_strings() -> Result<()> {
        let (app_name, locales) = patch_input();
        let patch = ResourcePatch {
            app_name: &app_name,
            locale_names: &locales,
        };
        let table = build_table(&[
            "template-app-name",
            "template-app-name-fr",
            "template-app-name-pt-BR",
            "app_name",
        ]);
        let out = patch_resources(&table, &patch)?;
        assert_eq!(
            output_strings(&out),
            ["My Game", "Mon Jeu", "My Game", "app_name"]
        );
        // Everything after the pool is carried through unchanged.
        assert_eq!(&out[out.len() - REST.len()..], REST);
        assert_eq!(
            LittleEndian::read_u32(&out[4..8]) as usize,
            out.len()
        );
        Ok(())
    }

    #[test]
    fn forces_utf16_output() -> Result<()> {
        let (app_name, locales) = patch_input();
        let patch = ResourcePatch {
            app_name: &app_name,
            locale_names: &locales,
        };
        let table = build_utf8_table(&["template-app-name", "état"]);
        let out = patch_resources(&table, &patch)?;
        let flags = LittleEndian::read_u32(&out[28..32]);
        assert_eq!(flags & ResStringPoolHeader::UTF8_FLAG, 0);
        assert_eq!(output_strings(&out), ["My Game", "état"]);
        Ok(())
    }
}
