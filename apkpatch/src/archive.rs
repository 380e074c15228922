//! Streams a source archive entry by entry through a transform into a
//! sink. The export pass and the test fixtures supply their own
//! strategies; the sink is either a new archive or a directory build.

use crate::error::{Error, Result};
use std::fs;
use std::io::{Read, Seek, Write};
use std::path::{Component, Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Compression {
    Stored,
    Deflated,
}

impl Compression {
    pub fn method(self) -> CompressionMethod {
        match self {
            Self::Stored => CompressionMethod::Stored,
            Self::Deflated => CompressionMethod::Deflated,
        }
    }

    pub fn from_method(method: CompressionMethod) -> Self {
        match method {
            CompressionMethod::Stored => Self::Stored,
            _ => Self::Deflated,
        }
    }
}

pub enum EntryOutcome {
    Keep {
        data: Vec<u8>,
        compression: Compression,
    },
    Skip,
}

/// Decides what happens to one archive entry: substitute or pass its
/// bytes through, re-choose its compression, or drop it entirely.
pub trait EntryTransform {
    fn transform(
        &mut self,
        name: &str,
        compression: Compression,
        data: Vec<u8>,
    ) -> Result<EntryOutcome>;
}

/// Destination for rewritten entries.
pub trait Sink {
    fn write_entry(&mut self, name: &str, data: &[u8], compression: Compression) -> Result<()>;
}

pub struct ZipSink<W: Write + Seek> {
    zip: ZipWriter<W>,
}

impl<W: Write + Seek> ZipSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            zip: ZipWriter::new(writer),
        }
    }

    pub fn finish(mut self) -> Result<W> {
        Ok(self.zip.finish()?)
    }
}

impl<W: Write + Seek> Sink for ZipSink<W> {
    fn write_entry(&mut self, name: &str, data: &[u8], compression: Compression) -> Result<()> {
        let options = FileOptions::default().compression_method(compression.method());
        self.zip.start_file(name, options)?;
        self.zip.write_all(data)?;
        Ok(())
    }
}

/// Directory-based build: entries become files under a root, compression
/// is irrelevant.
pub struct DirSink {
    root: PathBuf,
}

impl DirSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Sink for DirSink {
    fn write_entry(&mut self, name: &str, data: &[u8], _compression: Compression) -> Result<()> {
        let rel = Path::new(name);
        let escapes = rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));
        if escapes {
            return Err(Error::BadPath(rel.to_path_buf()));
        }
        let dest = self.root.join(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dest, data)?;
        Ok(())
    }
}

/// Runs every entry of `src` through `transform` and writes the survivors
/// to `sink`, in on-disk directory order.
pub fn rewrite_archive<R: Read + Seek>(
    src: &mut ZipArchive<R>,
    sink: &mut dyn Sink,
    transform: &mut dyn EntryTransform,
) -> Result<()> {
    for i in 0..src.len() {
        let mut entry = src.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let compression = Compression::from_method(entry.compression());
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        drop(entry);
        match transform.transform(&name, compression, data)? {
            EntryOutcome::Keep { data, compression } => {
                tracing::debug!("adding {name}");
                sink.write_entry(&name, &data, compression)?;
            }
            EntryOutcome::Skip => {
                tracing::debug!("skipping {name}");
            }
        }
    }
    Ok(())
}

/// Extensions that are already compressed, or don't compress well enough
/// to be worth losing the ability to memory-map them.
const STORE_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".wav", ".mp2", ".mp3", ".ogg", ".aac", ".mpg", ".mpeg",
    ".mid", ".midi", ".smf", ".jet", ".rtttl", ".imy", ".xmf", ".mp4", ".m4a", ".m4v", ".3gp",
    ".3gpp", ".3g2", ".3gpp2", ".amr", ".awb", ".wma", ".wmv", ".webp",
];

/// Signature of the compressed resource container format.
pub const COMPRESSED_CONTAINER_MAGIC: &[u8; 4] = b"RSCC";

/// Whether an entry added on top of the template should be deflated.
/// Template entries keep the compression decision their packager made.
pub fn should_compress_asset(path: &str, data: &[u8]) -> bool {
    let path = path.to_lowercase();
    if STORE_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return false;
    }
    if data.len() >= 4 && &data[..4] == COMPRESSED_CONTAINER_MAGIC {
        return false;
    }
    true
}

pub fn asset_compression(path: &str, data: &[u8]) -> Compression {
    if should_compress_asset(path, data) {
        Compression::Deflated
    } else {
        Compression::Stored
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    pub fn build_zip(entries: &[(&str, &[u8], Compression)]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data, compression) in entries {
            let options = FileOptions::default().compression_method(compression.method());
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    struct Upper;

    impl EntryTransform for Upper {
        fn transform(
            &mut self,
            name: &str,
            compression: Compression,
            data: Vec<u8>,
        ) -> Result<EntryOutcome> {
            if name == "drop.txt" {
                return Ok(EntryOutcome::Skip);
            }
            let data = if name == "upper.txt" {
                data.to_ascii_uppercase()
            } else {
                data
            };
            Ok(EntryOutcome::Keep { data, compression })
        }
    }

    #[test]
    fn transforms_and_filters_entries() -> Result<()> {
        let src = build_zip(&[
            ("upper.txt", b"hello", Compression::Deflated),
            ("drop.txt", b"gone", Compression::Deflated),
            ("keep.bin", b"\x00\x01\x02", Compression::Stored),
        ]);
        let mut zin = ZipArchive::new(Cursor::new(src))?;
        let mut sink = ZipSink::new(Cursor::new(Vec::new()));
        rewrite_archive(&mut zin, &mut sink, &mut Upper)?;
        let out = sink.finish()?.into_inner();

        let mut zout = ZipArchive::new(Cursor::new(out))?;
        assert_eq!(zout.len(), 2);
        let mut data = Vec::new();
        zout.by_name("upper.txt")?.read_to_end(&mut data)?;
        assert_eq!(data, b"HELLO");
        // The source compression decision is honored per entry.
        assert_eq!(
            zout.by_name("keep.bin")?.compression(),
            CompressionMethod::Stored
        );
        assert!(zout.by_name("drop.txt").is_err());
        Ok(())
    }

    #[test]
    fn dir_sink_writes_logical_paths() -> Result<()> {
        let root = std::env::temp_dir().join(format!("apkpatch-dirsink-{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        let mut sink = DirSink::new(&root);
        sink.write_entry("assets/data/level.bin", b"payload", Compression::Stored)?;
        assert_eq!(fs::read(root.join("assets/data/level.bin"))?, b"payload");
        assert!(matches!(
            sink.write_entry("../escape", b"", Compression::Stored),
            Err(Error::BadPath(_))
        ));
        fs::remove_dir_all(&root)?;
        Ok(())
    }

    #[test]
    fn asset_compression_predicate() {
        assert!(!should_compress_asset("res/icon.png", b"\x89PNG"));
        assert!(!should_compress_asset("sounds/THEME.OGG", b"OggS"));
        assert!(!should_compress_asset("assets/pack.bin", b"RSCCdata"));
        assert!(should_compress_asset("assets/level.dat", b"plain bytes"));
    }
}
