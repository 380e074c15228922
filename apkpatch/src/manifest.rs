//! Rewrites the binary manifest of a template archive: attribute values in
//! place, plus spliced permission and feature declarations.
//!
//! The document is rebuilt as a sequence of segments (bytes before the
//! splice point, newly serialized tags, bytes after) instead of shifting a
//! single buffer around, and the string pool is re-serialized once at the
//! end after all appends.

use crate::config::{ExportConfig, FeatureConfig, Orientation, ScreenSupport};
use crate::error::{Error, Result};
use crate::res::{
    ChunkType, ResChunkHeader, ResXmlAttribute, ResXmlEndElement, ResXmlNodeHeader,
    ResXmlStartElement,
};
use crate::strings::StringPool;
use byteorder::{ByteOrder, LittleEndian};
use std::collections::BTreeSet;
use std::io::Cursor;

pub const ANDROID_NS_URI: &str = "http://schemas.android.com/apk/res/android";

const MANIFEST_TAG: &str = "manifest";
const PERMISSION_TAG: &str = "uses-permission";
const FEATURE_TAG: &str = "uses-feature";
const NAME_ATTR: &str = "name";

/// The manifest fields an export injects.
#[derive(Clone, Debug)]
pub struct ManifestPatch<'a> {
    pub package_name: &'a str,
    pub version_code: u32,
    pub version_name: &'a str,
    pub orientation: Orientation,
    pub screens: ScreenSupport,
    pub allow_backup: bool,
    pub permissions: &'a [String],
    pub features: &'a [FeatureConfig],
}

impl<'a> ManifestPatch<'a> {
    pub fn new(config: &'a ExportConfig) -> Self {
        Self {
            package_name: &config.package_name,
            version_code: config.version_code,
            version_name: &config.version_name,
            orientation: config.orientation,
            screens: config.screens,
            allow_backup: config.allow_backup,
            permissions: &config.permissions,
            features: &config.features,
        }
    }
}

struct ChunkSpan {
    ty: u16,
    start: usize,
    end: usize,
}

fn chunk_spans(doc: &[u8]) -> Result<Vec<ChunkSpan>> {
    let header = ResChunkHeader::read(&mut Cursor::new(doc))?;
    if header.ty != ChunkType::Xml as u16 || (header.header_size as usize) < ResChunkHeader::SIZE {
        return Err(Error::template("not a binary XML document"));
    }
    let mut spans = Vec::new();
    let mut offset = header.header_size as usize;
    while offset < doc.len() {
        let chunk = doc
            .get(offset..offset + ResChunkHeader::SIZE)
            .ok_or_else(|| Error::template("truncated chunk header"))?;
        let header = ResChunkHeader::read(&mut Cursor::new(chunk))?;
        let size = header.size as usize;
        if size < ResChunkHeader::SIZE || offset + size > doc.len() {
            return Err(Error::template("chunk size out of bounds"));
        }
        spans.push(ChunkSpan {
            ty: header.ty,
            start: offset,
            end: offset + size,
        });
        offset += size;
    }
    Ok(spans)
}

/// Name string index of a start or end element chunk. Both layouts keep
/// the name right after the namespace, at the same offset.
fn element_name(chunk: &[u8]) -> Result<i32> {
    let at = ResChunkHeader::SIZE + ResXmlNodeHeader::SIZE + 4;
    let bytes = chunk
        .get(at..at + 4)
        .ok_or_else(|| Error::template("truncated element chunk"))?;
    Ok(LittleEndian::read_i32(bytes))
}

struct AttrRef {
    /// Byte offset of the attribute record within its chunk.
    offset: usize,
    attr: ResXmlAttribute,
}

fn element_attrs(chunk: &[u8]) -> Result<Vec<AttrRef>> {
    let body = chunk
        .get(ResChunkHeader::SIZE + ResXmlNodeHeader::SIZE..)
        .ok_or_else(|| Error::template("truncated element chunk"))?;
    let element = ResXmlStartElement::read(&mut Cursor::new(body))?;
    let base = ResChunkHeader::SIZE + ResXmlNodeHeader::SIZE + element.attribute_start as usize;
    let step = element.attribute_size as usize;
    if step < ResXmlAttribute::SIZE {
        return Err(Error::template("invalid attribute record size"));
    }
    let mut attrs = Vec::with_capacity(element.attribute_count as usize);
    for i in 0..element.attribute_count as usize {
        let offset = base + i * step;
        let record = chunk
            .get(offset..offset + ResXmlAttribute::SIZE)
            .ok_or_else(|| Error::template("attribute record out of bounds"))?;
        attrs.push(AttrRef {
            offset,
            attr: ResXmlAttribute::read(&mut Cursor::new(record))?,
        });
    }
    Ok(attrs)
}

/// Collects the permission and feature names the template already
/// declares, so injection never duplicates them.
fn scan_declared(
    doc: &[u8],
    spans: &[ChunkSpan],
    pool: &StringPool,
) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
    let mut permissions = BTreeSet::new();
    let mut features = BTreeSet::new();
    for span in spans {
        if span.ty != ChunkType::XmlStartElement as u16 {
            continue;
        }
        let chunk = &doc[span.start..span.end];
        let tag = match pool.get_ref(element_name(chunk)?) {
            Some(PERMISSION_TAG) => &mut permissions,
            Some(FEATURE_TAG) => &mut features,
            _ => continue,
        };
        for AttrRef { attr, .. } in element_attrs(chunk)? {
            if pool.get_ref(attr.name) == Some(NAME_ATTR) {
                if let Some(value) = pool.get_ref(attr.raw_value) {
                    tag.insert(value.to_string());
                }
            }
        }
    }
    Ok((permissions, features))
}

fn bool_value(value: bool) -> u32 {
    if value {
        0xffff_ffff
    } else {
        0
    }
}

fn write_typed_data(chunk: &mut [u8], attr_offset: usize, value: u32) {
    let at = attr_offset + ResXmlAttribute::DATA_OFFSET;
    LittleEndian::write_u32(&mut chunk[at..at + 4], value);
}

fn set_pool_string(
    pool: &mut StringPool,
    attr: &ResXmlAttribute,
    value: &str,
    what: &str,
) -> Result<()> {
    match usize::try_from(attr.raw_value) {
        Ok(index) => pool.set(index, value),
        Err(_) => {
            tracing::warn!("{what} holds a resource reference, expected a plain string");
            Ok(())
        }
    }
}

/// Applies the (tag, attribute) rewrite table to one start-element chunk.
/// Rewrites never change the chunk size: string values are swapped in the
/// pool, typed values are overwritten in their 4-byte payload.
fn apply_attribute_edits(
    chunk: &mut [u8],
    pool: &mut StringPool,
    patch: &ManifestPatch,
) -> Result<()> {
    let tag = match pool.get_ref(element_name(chunk)?) {
        Some(tag) => tag.to_owned(),
        None => return Ok(()),
    };
    for AttrRef { offset, attr } in element_attrs(chunk)? {
        let name = match pool.get_ref(attr.name) {
            Some(name) => name.to_owned(),
            None => continue,
        };
        match (tag.as_str(), name.as_str()) {
            ("manifest", "package") => {
                set_pool_string(pool, &attr, patch.package_name, "package")?
            }
            ("manifest", "versionCode") => write_typed_data(chunk, offset, patch.version_code),
            ("manifest", "versionName") => {
                set_pool_string(pool, &attr, patch.version_name, "versionName")?
            }
            ("application", "allowBackup") => {
                write_typed_data(chunk, offset, bool_value(patch.allow_backup))
            }
            ("instrumentation", "targetPackage") => {
                set_pool_string(pool, &attr, patch.package_name, "targetPackage")?
            }
            ("activity", "screenOrientation") => {
                write_typed_data(chunk, offset, patch.orientation.android_value())
            }
            ("supports-screens", "smallScreens") => {
                write_typed_data(chunk, offset, bool_value(patch.screens.small))
            }
            ("supports-screens", "normalScreens") => {
                write_typed_data(chunk, offset, bool_value(patch.screens.normal))
            }
            ("supports-screens", "largeScreens") => {
                write_typed_data(chunk, offset, bool_value(patch.screens.large))
            }
            ("supports-screens", "xlargeScreens") => {
                write_typed_data(chunk, offset, bool_value(patch.screens.xlarge))
            }
            _ => {}
        }
    }
    Ok(())
}

fn push_start_element(out: &mut Vec<u8>, name: i32, attrs: &[ResXmlAttribute]) -> Result<()> {
    let mut payload = Vec::new();
    ResXmlNodeHeader::default().write(&mut payload)?;
    ResXmlStartElement::new(-1, name, attrs.len() as u16).write(&mut payload)?;
    for attr in attrs {
        attr.write(&mut payload)?;
    }
    ResChunkHeader {
        ty: ChunkType::XmlStartElement as u16,
        header_size: (ResChunkHeader::SIZE + ResXmlNodeHeader::SIZE) as u16,
        size: (ResChunkHeader::SIZE + payload.len()) as u32,
    }
    .write(out)?;
    out.extend_from_slice(&payload);
    Ok(())
}

fn push_end_element(out: &mut Vec<u8>, name: i32) -> Result<()> {
    let mut payload = Vec::new();
    ResXmlNodeHeader::default().write(&mut payload)?;
    ResXmlEndElement {
        namespace: -1,
        name,
    }
    .write(&mut payload)?;
    ResChunkHeader {
        ty: ChunkType::XmlEndElement as u16,
        header_size: (ResChunkHeader::SIZE + ResXmlNodeHeader::SIZE) as u16,
        size: (ResChunkHeader::SIZE + payload.len()) as u32,
    }
    .write(out)?;
    out.extend_from_slice(&payload);
    Ok(())
}

fn push_permission(
    out: &mut Vec<u8>,
    pool: &mut StringPool,
    ns: i32,
    name_attr: i32,
    permission: &str,
) -> Result<()> {
    tracing::debug!("adding permission {permission}");
    let value = pool.ensure(permission) as i32;
    let tag = pool.ensure(PERMISSION_TAG) as i32;
    push_start_element(out, tag, &[ResXmlAttribute::string(ns, name_attr, value)])?;
    push_end_element(out, tag)
}

fn push_feature(
    out: &mut Vec<u8>,
    pool: &mut StringPool,
    ns: i32,
    name_attr: i32,
    feature: &FeatureConfig,
) -> Result<()> {
    tracing::debug!("adding feature {}", feature.name);
    let tag = pool.ensure(FEATURE_TAG) as i32;
    let name_value = pool.ensure(&feature.name) as i32;
    let required_attr = pool.ensure("required") as i32;
    let required_value = pool.ensure(if feature.required { "true" } else { "false" }) as i32;
    let mut attrs = vec![
        ResXmlAttribute::string(ns, name_attr, name_value),
        ResXmlAttribute::string(ns, required_attr, required_value),
    ];
    if let Some(version) = feature.version {
        let version_attr = pool.ensure("version") as i32;
        let version_value = pool.ensure(&version.to_string()) as i32;
        attrs.push(ResXmlAttribute::string(ns, version_attr, version_value));
    }
    push_start_element(out, tag, &attrs)?;
    push_end_element(out, tag)
}

/// Rewrites a complete binary manifest according to `patch` and returns
/// the new document.
pub fn patch_manifest(doc: &[u8], patch: &ManifestPatch) -> Result<Vec<u8>> {
    let spans = chunk_spans(doc)?;
    let pool_span = spans
        .iter()
        .find(|span| span.ty == ChunkType::StringPool as u16)
        .ok_or_else(|| Error::template("document has no string pool"))?;
    let mut pool = StringPool::parse(&doc[pool_span.start..pool_span.end])?;

    let (declared_permissions, declared_features) = scan_declared(doc, &spans, &pool)?;
    let mut staged_permissions: Vec<&str> = Vec::new();
    for permission in patch.permissions {
        if !declared_permissions.contains(permission)
            && !staged_permissions.contains(&permission.as_str())
        {
            staged_permissions.push(permission);
        }
    }
    let mut staged_features: Vec<&FeatureConfig> = Vec::new();
    for feature in patch.features {
        if !declared_features.contains(&feature.name)
            && !staged_features.iter().any(|f| f.name == feature.name)
        {
            staged_features.push(feature);
        }
    }

    // Splices anchor their attributes on two well-known pool entries; a
    // template missing them cannot be patched.
    let (name_attr, ns) = if staged_permissions.is_empty() && staged_features.is_empty() {
        (-1, -1)
    } else {
        let name = pool
            .find(NAME_ATTR)
            .ok_or_else(|| Error::template("string pool has no `name` attribute literal"))?;
        let ns = pool
            .find(ANDROID_NS_URI)
            .ok_or_else(|| Error::template("string pool has no android namespace URI"))?;
        (name as i32, ns as i32)
    };

    let mut before = Vec::new();
    let mut body = Vec::new();
    let mut seen_pool = false;
    let mut features_done = staged_features.is_empty();
    let mut permissions_done = staged_permissions.is_empty();
    for span in &spans {
        let chunk = &doc[span.start..span.end];
        match ChunkType::from_u16(span.ty) {
            Some(ChunkType::StringPool) if !seen_pool => {
                // Rebuilt from the mutated table during final assembly.
                seen_pool = true;
            }
            Some(ChunkType::XmlStartElement) => {
                let at = body.len();
                body.extend_from_slice(chunk);
                apply_attribute_edits(&mut body[at..], &mut pool, patch)?;
            }
            Some(ChunkType::XmlEndElement) => {
                let tag = pool.get_ref(element_name(chunk)?).map(str::to_owned);
                match tag.as_deref() {
                    Some(FEATURE_TAG) if !features_done => {
                        body.extend_from_slice(chunk);
                        for feature in &staged_features {
                            push_feature(&mut body, &mut pool, ns, name_attr, feature)?;
                        }
                        features_done = true;
                    }
                    Some(MANIFEST_TAG) => {
                        // A template with no feature declarations gets the
                        // staged ones right before the root closes.
                        if !features_done {
                            for feature in &staged_features {
                                push_feature(&mut body, &mut pool, ns, name_attr, feature)?;
                            }
                            features_done = true;
                        }
                        for permission in &staged_permissions {
                            push_permission(&mut body, &mut pool, ns, name_attr, permission)?;
                        }
                        permissions_done = true;
                        body.extend_from_slice(chunk);
                    }
                    _ => body.extend_from_slice(chunk),
                }
            }
            _ => {
                let out = if seen_pool { &mut body } else { &mut before };
                out.extend_from_slice(chunk);
            }
        }
    }
    if !features_done || !permissions_done {
        return Err(Error::template(
            "document has no root closing tag to anchor injected declarations",
        ));
    }

    let pool_bytes = pool.serialize()?;
    let mut out = Vec::with_capacity(
        ResChunkHeader::SIZE + before.len() + pool_bytes.len() + body.len(),
    );
    ResChunkHeader {
        ty: ChunkType::Xml as u16,
        header_size: ResChunkHeader::SIZE as u16,
        size: 0, // patched below
    }
    .write(&mut out)?;
    out.extend_from_slice(&before);
    out.extend_from_slice(&pool_bytes);
    out.extend_from_slice(&body);
    let size = out.len() as u32;
    LittleEndian::write_u32(&mut out[4..8], size);
    Ok(out)
}
