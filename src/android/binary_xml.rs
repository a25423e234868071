//! Reader and writer for Android binary XML (`AndroidManifest.xml` inside an APK).
//!
//! The document is decoded into a small DOM ([`ManifestElement`] / [`ManifestAttribute`]) that
//! keeps attribute order and resource identifiers, so an unmodified tree encodes back to an
//! equivalent document. Attribute values keep their platform type; anything the DOM does not
//! model explicitly is carried as [`ManifestValue::Typed`].

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::collections::{BTreeMap, BTreeSet};

const RES_STRING_POOL_TYPE: u16 = 0x0001;
const RES_XML_TYPE: u16 = 0x0003;
const RES_XML_START_NAMESPACE_TYPE: u16 = 0x0100;
const RES_XML_END_NAMESPACE_TYPE: u16 = 0x0101;
const RES_XML_START_ELEMENT_TYPE: u16 = 0x0102;
const RES_XML_END_ELEMENT_TYPE: u16 = 0x0103;
const RES_XML_CDATA_TYPE: u16 = 0x0104;
const RES_XML_RESOURCE_MAP_TYPE: u16 = 0x0180;

const NO_ENTRY_INDEX: u32 = 0xFFFF_FFFF;
const STRING_FLAG_UTF8: u32 = 0x0000_0100;

pub const ANDROID_NAMESPACE_URI: &str = "http://schemas.android.com/apk/res/android";
pub const ANDROID_NAMESPACE_PREFIX: &str = "android";

const TYPE_REFERENCE: u8 = 0x01;
const TYPE_STRING: u8 = 0x03;
const TYPE_INT_DEC: u8 = 0x10;
const TYPE_INT_HEX: u8 = 0x11;
const TYPE_INT_BOOLEAN: u8 = 0x12;

// aapt encodes `true` as all bits set.
const BOOLEAN_TRUE: u32 = 0xFFFF_FFFF;

/// Result alias for binary XML operations.
pub type BinaryXmlResult<T> = Result<T, BinaryXmlError>;

/// Errors surfaced by the binary XML codec.
#[derive(Debug)]
pub enum BinaryXmlError {
    /// The document is missing the expected structure.
    MalformedDocument(String),
    /// The tree references something the encoder cannot express.
    Unencodable(String),
    /// Text XML generation failure.
    Xml(String),
}

impl std::fmt::Display for BinaryXmlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BinaryXmlError::MalformedDocument(msg) => write!(f, "Malformed manifest: {msg}"),
            BinaryXmlError::Unencodable(msg) => write!(f, "Cannot encode manifest: {msg}"),
            BinaryXmlError::Xml(msg) => write!(f, "XML error: {msg}"),
        }
    }
}

impl std::error::Error for BinaryXmlError {}

fn malformed(msg: impl Into<String>) -> BinaryXmlError {
    BinaryXmlError::MalformedDocument(msg.into())
}

/// Typed attribute values inside the manifest DOM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManifestValue {
    String(String),
    Boolean(bool),
    Integer(i32),
    Hex(u32),
    Reference(u32),
    /// Any other `Res_value` type (dimensions, colors, floats, ...), kept verbatim.
    Typed { data_type: u8, data: u32 },
}

impl ManifestValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ManifestValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ManifestValue::Boolean(flag) => Some(*flag),
            _ => None,
        }
    }

    /// Text rendering used for the XML dump.
    pub fn to_text(&self) -> String {
        match self {
            ManifestValue::String(text) => text.clone(),
            ManifestValue::Boolean(flag) => flag.to_string(),
            ManifestValue::Integer(num) => num.to_string(),
            ManifestValue::Hex(value) => format!("0x{value:x}"),
            ManifestValue::Reference(id) => format!("@0x{id:08x}"),
            ManifestValue::Typed { data_type, data } => {
                format!("(type 0x{data_type:02x})0x{data:08x}")
            }
        }
    }

    fn decode(pool: &StringPool, raw_idx: u32, data_type: u8, data: u32) -> BinaryXmlResult<Self> {
        let value = match data_type {
            TYPE_STRING => {
                let text = pool
                    .get(data)
                    .or_else(|| pool.get(raw_idx))
                    .ok_or_else(|| malformed("String value references missing pool entry"))?;
                ManifestValue::String(text.to_string())
            }
            TYPE_REFERENCE => ManifestValue::Reference(data),
            TYPE_INT_BOOLEAN => ManifestValue::Boolean(data != 0),
            TYPE_INT_DEC => ManifestValue::Integer(data as i32),
            TYPE_INT_HEX => ManifestValue::Hex(data),
            other => ManifestValue::Typed {
                data_type: other,
                data,
            },
        };
        Ok(value)
    }

    fn encode(&self, pool: &PoolBuilder) -> BinaryXmlResult<(u8, u32)> {
        match self {
            ManifestValue::String(text) => Ok((TYPE_STRING, pool.index(text)?)),
            ManifestValue::Boolean(true) => Ok((TYPE_INT_BOOLEAN, BOOLEAN_TRUE)),
            ManifestValue::Boolean(false) => Ok((TYPE_INT_BOOLEAN, 0)),
            ManifestValue::Integer(num) => Ok((TYPE_INT_DEC, *num as u32)),
            ManifestValue::Hex(value) => Ok((TYPE_INT_HEX, *value)),
            ManifestValue::Reference(id) => Ok((TYPE_REFERENCE, *id)),
            ManifestValue::Typed { data_type, data } => Ok((*data_type, *data)),
        }
    }
}

impl From<String> for ManifestValue {
    fn from(value: String) -> Self {
        ManifestValue::String(value)
    }
}

impl From<&str> for ManifestValue {
    fn from(value: &str) -> Self {
        ManifestValue::String(value.to_owned())
    }
}

impl From<bool> for ManifestValue {
    fn from(value: bool) -> Self {
        ManifestValue::Boolean(value)
    }
}

/// A single attribute attached to a manifest element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestAttribute {
    pub namespace_prefix: Option<String>,
    pub namespace_uri: Option<String>,
    pub resource_id: Option<u32>,
    pub name: String,
    pub value: ManifestValue,
}

impl ManifestAttribute {
    pub fn new(name: impl Into<String>, value: impl Into<ManifestValue>) -> Self {
        ManifestAttribute {
            namespace_prefix: None,
            namespace_uri: None,
            resource_id: None,
            name: name.into(),
            value: value.into(),
        }
    }

    /// An `android:` attribute bound to its framework resource identifier.
    pub fn android(name: impl Into<String>, value: impl Into<ManifestValue>, resource_id: u32) -> Self {
        ManifestAttribute {
            namespace_prefix: Some(ANDROID_NAMESPACE_PREFIX.to_string()),
            namespace_uri: Some(ANDROID_NAMESPACE_URI.to_string()),
            resource_id: Some(resource_id),
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn is_android(&self) -> bool {
        self.namespace_uri.as_deref() == Some(ANDROID_NAMESPACE_URI)
    }

    /// Attributes are identified by namespace URI plus local name.
    pub fn same_name(&self, other: &ManifestAttribute) -> bool {
        self.name == other.name && self.namespace_uri == other.namespace_uri
    }

    pub fn qualified_name(&self) -> String {
        qualified_name(self.namespace_prefix.as_deref(), &self.name)
    }
}

/// DOM-style element node for the binary XML tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestElement {
    pub namespace_prefix: Option<String>,
    pub namespace_uri: Option<String>,
    pub tag: String,
    pub attributes: Vec<ManifestAttribute>,
    pub children: Vec<ManifestElement>,
    pub text: Option<String>,
}

impl ManifestElement {
    pub fn new(tag: impl Into<String>) -> Self {
        ManifestElement {
            namespace_prefix: None,
            namespace_uri: None,
            tag: tag.into(),
            attributes: Vec::new(),
            children: Vec::new(),
            text: None,
        }
    }

    pub fn with_attributes(mut self, attributes: Vec<ManifestAttribute>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_child(mut self, child: ManifestElement) -> Self {
        self.children.push(child);
        self
    }

    /// Look up an attribute by qualified name, e.g. `android:name` or `package`.
    pub fn attribute_value(&self, name: &str) -> Option<&ManifestValue> {
        let (prefix, local) = match name.split_once(':') {
            Some((prefix, local)) => (Some(prefix), local),
            None => (None, name),
        };
        self.attributes
            .iter()
            .find(|attr| attr.name == local && attr.namespace_prefix.as_deref() == prefix)
            .map(|attr| &attr.value)
    }

    pub fn find_child(&self, tag: &str) -> Option<&ManifestElement> {
        self.children.iter().find(|child| child.tag == tag)
    }

    pub fn find_child_mut(&mut self, tag: &str) -> Option<&mut ManifestElement> {
        self.children.iter_mut().find(|child| child.tag == tag)
    }
}

fn qualified_name(prefix: Option<&str>, local: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}:{local}"),
        None => local.to_string(),
    }
}

/// Decoded `AndroidManifest.xml`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AndroidManifest {
    root: ManifestElement,
}

impl AndroidManifest {
    pub fn from_root(root: ManifestElement) -> Self {
        AndroidManifest { root }
    }

    pub fn root(&self) -> &ManifestElement {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut ManifestElement {
        &mut self.root
    }

    pub fn package_name(&self) -> Option<&str> {
        self.root.attribute_value("package").and_then(ManifestValue::as_str)
    }

    pub fn application(&self) -> Option<&ManifestElement> {
        self.root.find_child("application")
    }

    pub fn application_mut(&mut self) -> Option<&mut ManifestElement> {
        self.root.find_child_mut("application")
    }

    pub fn from_bytes(bytes: &[u8]) -> BinaryXmlResult<Self> {
        Decoder::new(bytes).decode().map(|root| AndroidManifest { root })
    }

    pub fn to_bytes(&self) -> BinaryXmlResult<Vec<u8>> {
        let namespaces = collect_namespace_declarations(&self.root);
        let pool = PoolBuilder::for_tree(&self.root, &namespaces);

        let mut document = Vec::new();
        let xml_start = begin_chunk(&mut document, RES_XML_TYPE, 8);
        pool.write_string_chunk(&mut document);
        pool.write_resource_map(&mut document);
        for decl in &namespaces {
            write_namespace_chunk(&mut document, &pool, decl, RES_XML_START_NAMESPACE_TYPE)?;
        }
        write_element(&mut document, &self.root, &pool)?;
        for decl in namespaces.iter().rev() {
            write_namespace_chunk(&mut document, &pool, decl, RES_XML_END_NAMESPACE_TYPE)?;
        }
        finalize_chunk(&mut document, xml_start);
        Ok(document)
    }

    /// Render the tree as text XML, for inspection only.
    pub fn to_xml_string(&self) -> BinaryXmlResult<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 4);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
            .map_err(|err| BinaryXmlError::Xml(err.to_string()))?;
        let namespaces = collect_namespace_declarations(&self.root);
        write_element_xml(&self.root, &mut writer, &namespaces)?;
        String::from_utf8(writer.into_inner()).map_err(|err| BinaryXmlError::Xml(err.to_string()))
    }
}

struct ChunkHeader {
    chunk_type: u16,
    header_size: u16,
    start: usize,
    end: usize,
}

struct ChunkReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ChunkReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        ChunkReader { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> BinaryXmlResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| malformed(format!("Unexpected end of binary XML at offset {}", self.pos)))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> BinaryXmlResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> BinaryXmlResult<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> BinaryXmlResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn seek(&mut self, offset: usize) -> BinaryXmlResult<()> {
        if offset > self.data.len() {
            return Err(malformed("Attempted to seek past end of document"));
        }
        self.pos = offset;
        Ok(())
    }

    fn chunk_header(&mut self) -> BinaryXmlResult<ChunkHeader> {
        let start = self.pos;
        let chunk_type = self.u16()?;
        let header_size = self.u16()?;
        let chunk_size = self.u32()? as usize;
        if chunk_size < header_size as usize || header_size < 8 {
            return Err(malformed(format!("Invalid sizing for chunk 0x{chunk_type:04x}")));
        }
        let end = start
            .checked_add(chunk_size)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| malformed(format!("Chunk 0x{chunk_type:04x} extends past end of document")))?;
        Ok(ChunkHeader {
            chunk_type,
            header_size,
            start,
            end,
        })
    }
}

struct StringPool {
    strings: Vec<String>,
}

impl StringPool {
    fn parse(reader: &mut ChunkReader<'_>, header: &ChunkHeader) -> BinaryXmlResult<Self> {
        let count = reader.u32()? as usize;
        reader.u32()?; // styleCount
        let flags = reader.u32()?;
        let strings_start = reader.u32()? as usize;
        reader.u32()?; // stylesStart
        reader.seek(header.start + header.header_size as usize)?;

        let mut offsets = Vec::with_capacity(count);
        for _ in 0..count {
            offsets.push(reader.u32()? as usize);
        }
        let body = reader
            .data
            .get(header.start + strings_start..header.end)
            .ok_or_else(|| malformed("String data lies outside the pool chunk"))?;
        let utf8 = flags & STRING_FLAG_UTF8 != 0;
        let strings = offsets
            .into_iter()
            .map(|offset| {
                if utf8 {
                    decode_utf8_entry(body, offset)
                } else {
                    decode_utf16_entry(body, offset)
                }
            })
            .collect::<BinaryXmlResult<Vec<_>>>()?;
        Ok(StringPool { strings })
    }

    fn get(&self, idx: u32) -> Option<&str> {
        if idx == NO_ENTRY_INDEX {
            return None;
        }
        self.strings.get(idx as usize).map(String::as_str)
    }

    fn require(&self, idx: u32, what: &str) -> BinaryXmlResult<String> {
        self.get(idx)
            .map(str::to_string)
            .ok_or_else(|| malformed(format!("{what} references invalid string index {idx}")))
    }
}

fn decode_utf8_entry(body: &[u8], offset: usize) -> BinaryXmlResult<String> {
    let mut cursor = offset;
    utf8_length(body, &mut cursor)?; // length in UTF-16 units, unused
    let len = utf8_length(body, &mut cursor)?;
    let bytes = body
        .get(cursor..cursor + len)
        .ok_or_else(|| malformed("UTF-8 string exceeds pool bounds"))?;
    String::from_utf8(bytes.to_vec()).map_err(|err| malformed(err.to_string()))
}

fn utf8_length(body: &[u8], cursor: &mut usize) -> BinaryXmlResult<usize> {
    let mut next = || -> BinaryXmlResult<usize> {
        let byte = *body
            .get(*cursor)
            .ok_or_else(|| malformed("Truncated UTF-8 length"))?;
        *cursor += 1;
        Ok(byte as usize)
    };
    let first = next()?;
    if first & 0x80 == 0 {
        return Ok(first);
    }
    let second = next()?;
    Ok(((first & 0x7F) << 8) | second)
}

fn decode_utf16_entry(body: &[u8], offset: usize) -> BinaryXmlResult<String> {
    let mut cursor = offset;
    let len = utf16_length(body, &mut cursor)?;
    let bytes = body
        .get(cursor..cursor + len * 2)
        .ok_or_else(|| malformed("UTF-16 string exceeds pool bounds"))?;
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|err| malformed(err.to_string()))
}

fn utf16_length(body: &[u8], cursor: &mut usize) -> BinaryXmlResult<usize> {
    let mut next = || -> BinaryXmlResult<usize> {
        let pair = body
            .get(*cursor..*cursor + 2)
            .ok_or_else(|| malformed("Truncated UTF-16 length"))?;
        *cursor += 2;
        Ok(u16::from_le_bytes([pair[0], pair[1]]) as usize)
    };
    let first = next()?;
    if first & 0x8000 == 0 {
        return Ok(first);
    }
    let second = next()?;
    Ok(((first & 0x7FFF) << 16) | second)
}

struct NamespaceFrame {
    prefix: Option<String>,
    uri: Option<String>,
}

struct Decoder<'a> {
    reader: ChunkReader<'a>,
    pool: Option<StringPool>,
    resource_map: Vec<u32>,
    namespaces: Vec<NamespaceFrame>,
    stack: Vec<ManifestElement>,
    root: Option<ManifestElement>,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Decoder {
            reader: ChunkReader::new(data),
            pool: None,
            resource_map: Vec::new(),
            namespaces: Vec::new(),
            stack: Vec::new(),
            root: None,
        }
    }

    fn decode(mut self) -> BinaryXmlResult<ManifestElement> {
        let document = self.reader.chunk_header()?;
        if document.chunk_type != RES_XML_TYPE {
            return Err(malformed("Binary XML does not start with RES_XML_TYPE header"));
        }
        self.reader.seek(document.start + document.header_size as usize)?;

        while self.reader.pos < document.end {
            let chunk = self.reader.chunk_header()?;
            match chunk.chunk_type {
                RES_STRING_POOL_TYPE => {
                    self.pool = Some(StringPool::parse(&mut self.reader, &chunk)?);
                }
                RES_XML_RESOURCE_MAP_TYPE => {
                    self.reader.seek(chunk.start + chunk.header_size as usize)?;
                    self.resource_map.clear();
                    while self.reader.pos + 4 <= chunk.end {
                        let id = self.reader.u32()?;
                        self.resource_map.push(id);
                    }
                }
                RES_XML_START_NAMESPACE_TYPE => self.start_namespace(&chunk)?,
                RES_XML_END_NAMESPACE_TYPE => {
                    self.namespaces.pop();
                }
                RES_XML_START_ELEMENT_TYPE => self.start_element(&chunk)?,
                RES_XML_END_ELEMENT_TYPE => self.end_element()?,
                RES_XML_CDATA_TYPE => self.cdata(&chunk)?,
                // Unknown chunks are skipped.
                _ => {}
            }
            self.reader.seek(chunk.end)?;
        }

        if !self.stack.is_empty() {
            return Err(malformed("Unclosed XML elements at end of document"));
        }
        self.root.ok_or_else(|| malformed("AndroidManifest is empty"))
    }

    fn pool(&self, what: &str) -> BinaryXmlResult<&StringPool> {
        self.pool
            .as_ref()
            .ok_or_else(|| malformed(format!("{what} encountered before string pool")))
    }

    fn body(&mut self, chunk: &ChunkHeader) -> BinaryXmlResult<()> {
        // Node chunks carry a line number and comment index in their header.
        self.reader.seek(chunk.start + chunk.header_size as usize)
    }

    fn start_namespace(&mut self, chunk: &ChunkHeader) -> BinaryXmlResult<()> {
        self.body(chunk)?;
        let prefix_idx = self.reader.u32()?;
        let uri_idx = self.reader.u32()?;
        let pool = self.pool("Namespace chunk")?;
        let frame = NamespaceFrame {
            prefix: pool.get(prefix_idx).map(str::to_string),
            uri: pool.get(uri_idx).map(str::to_string),
        };
        self.namespaces.push(frame);
        Ok(())
    }

    fn prefix_for(&self, uri: Option<&str>) -> Option<String> {
        let uri = uri?;
        self.namespaces
            .iter()
            .rev()
            .find(|frame| frame.uri.as_deref() == Some(uri))
            .and_then(|frame| frame.prefix.clone())
    }

    fn start_element(&mut self, chunk: &ChunkHeader) -> BinaryXmlResult<()> {
        self.body(chunk)?;
        let ns_idx = self.reader.u32()?;
        let name_idx = self.reader.u32()?;
        let attribute_start = self.reader.u16()? as usize;
        let attribute_size = self.reader.u16()? as usize;
        let attribute_count = self.reader.u16()? as usize;
        let attrs_base = chunk.start + chunk.header_size as usize + attribute_start;

        let pool = self.pool("Start element")?;
        let tag = pool.require(name_idx, "Element")?;
        let namespace_uri = pool.get(ns_idx).map(str::to_string);

        let mut raw_attributes = Vec::with_capacity(attribute_count);
        for index in 0..attribute_count {
            self.reader.seek(attrs_base + index * attribute_size)?;
            let attr_ns_idx = self.reader.u32()?;
            let attr_name_idx = self.reader.u32()?;
            let raw_idx = self.reader.u32()?;
            if self.reader.u16()? != 8 {
                return Err(malformed(format!("Attribute value size must be 8 in <{tag}>")));
            }
            self.reader.u8()?; // res0
            let data_type = self.reader.u8()?;
            let data = self.reader.u32()?;
            raw_attributes.push((attr_ns_idx, attr_name_idx, raw_idx, data_type, data));
        }

        let pool = self.pool("Start element")?;
        let mut attributes = Vec::with_capacity(attribute_count);
        for (attr_ns_idx, attr_name_idx, raw_idx, data_type, data) in raw_attributes {
            let name = pool.require(attr_name_idx, "Attribute name")?;
            let uri = pool.get(attr_ns_idx).map(str::to_string);
            let value = ManifestValue::decode(pool, raw_idx, data_type, data)?;
            let resource_id = self
                .resource_map
                .get(attr_name_idx as usize)
                .copied()
                .filter(|id| *id != 0);
            attributes.push(ManifestAttribute {
                namespace_prefix: self.prefix_for(uri.as_deref()),
                namespace_uri: uri,
                resource_id,
                name,
                value,
            });
        }

        let mut element = ManifestElement::new(tag);
        element.namespace_prefix = self.prefix_for(namespace_uri.as_deref());
        element.namespace_uri = namespace_uri;
        element.attributes = attributes;
        self.stack.push(element);
        Ok(())
    }

    fn end_element(&mut self) -> BinaryXmlResult<()> {
        let element = self
            .stack
            .pop()
            .ok_or_else(|| malformed("End element without matching start"))?;
        match self.stack.last_mut() {
            Some(parent) => parent.children.push(element),
            None if self.root.is_none() => self.root = Some(element),
            None => return Err(malformed("Multiple root elements in manifest")),
        }
        Ok(())
    }

    fn cdata(&mut self, chunk: &ChunkHeader) -> BinaryXmlResult<()> {
        self.body(chunk)?;
        let data_idx = self.reader.u32()?;
        let text = self.pool("CDATA")?.get(data_idx).map(str::to_string);
        if let (Some(text), Some(current)) = (text, self.stack.last_mut()) {
            current.text = Some(text);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct NamespaceDecl {
    prefix: String,
    uri: String,
}

fn collect_namespace_declarations(root: &ManifestElement) -> Vec<NamespaceDecl> {
    fn visit(element: &ManifestElement, set: &mut BTreeSet<NamespaceDecl>) {
        let element_ns = (&element.namespace_prefix, &element.namespace_uri);
        let attribute_ns = element
            .attributes
            .iter()
            .map(|attr| (&attr.namespace_prefix, &attr.namespace_uri));
        for (prefix, uri) in std::iter::once(element_ns).chain(attribute_ns) {
            if let (Some(prefix), Some(uri)) = (prefix, uri) {
                set.insert(NamespaceDecl {
                    prefix: prefix.clone(),
                    uri: uri.clone(),
                });
            }
        }
        for child in &element.children {
            visit(child, set);
        }
    }
    let mut set = BTreeSet::new();
    visit(root, &mut set);
    set.into_iter().collect()
}

/// String pool under construction. Attribute names that carry a resource identifier occupy the
/// first slots, in resource id order, mirrored one-to-one by the resource map chunk.
struct PoolBuilder {
    strings: Vec<String>,
    resource_ids: Vec<u32>,
    resource_names: BTreeMap<(u32, String), u32>,
    plain: BTreeMap<String, u32>,
}

impl PoolBuilder {
    fn for_tree(root: &ManifestElement, namespaces: &[NamespaceDecl]) -> Self {
        fn resource_names(element: &ManifestElement, out: &mut BTreeSet<(u32, String)>) {
            for attr in &element.attributes {
                if let Some(id) = attr.resource_id {
                    out.insert((id, attr.name.clone()));
                }
            }
            for child in &element.children {
                resource_names(child, out);
            }
        }

        let mut builder = PoolBuilder {
            strings: Vec::new(),
            resource_ids: Vec::new(),
            resource_names: BTreeMap::new(),
            plain: BTreeMap::new(),
        };
        let mut keyed = BTreeSet::new();
        resource_names(root, &mut keyed);
        for (id, name) in keyed {
            let idx = builder.strings.len() as u32;
            builder.strings.push(name.clone());
            builder.resource_ids.push(id);
            builder.resource_names.insert((id, name), idx);
        }
        for decl in namespaces {
            builder.intern(&decl.prefix);
            builder.intern(&decl.uri);
        }
        builder.intern_element(root);
        builder
    }

    fn intern(&mut self, text: &str) {
        if !self.plain.contains_key(text) {
            self.plain.insert(text.to_string(), self.strings.len() as u32);
            self.strings.push(text.to_string());
        }
    }

    fn intern_element(&mut self, element: &ManifestElement) {
        self.intern(&element.tag);
        if let Some(uri) = &element.namespace_uri {
            self.intern(uri);
        }
        if let Some(text) = &element.text {
            self.intern(text);
        }
        for attr in &element.attributes {
            if attr.resource_id.is_none() {
                self.intern(&attr.name);
            }
            if let Some(uri) = &attr.namespace_uri {
                self.intern(uri);
            }
            if let ManifestValue::String(value) = &attr.value {
                self.intern(value);
            }
        }
        for child in &element.children {
            self.intern_element(child);
        }
    }

    fn index(&self, text: &str) -> BinaryXmlResult<u32> {
        self.plain
            .get(text)
            .copied()
            .ok_or_else(|| BinaryXmlError::Unencodable(format!("string '{text}' missing from pool")))
    }

    fn optional_index(&self, text: Option<&str>) -> BinaryXmlResult<u32> {
        text.map_or(Ok(NO_ENTRY_INDEX), |text| self.index(text))
    }

    fn attribute_name_index(&self, attr: &ManifestAttribute) -> BinaryXmlResult<u32> {
        match attr.resource_id {
            Some(id) => self
                .resource_names
                .get(&(id, attr.name.clone()))
                .copied()
                .ok_or_else(|| {
                    BinaryXmlError::Unencodable(format!(
                        "attribute '{}' (0x{id:08x}) missing from resource map",
                        attr.name
                    ))
                }),
            None => self.index(&attr.name),
        }
    }

    // Always written as UTF-16, which every platform version reads.
    fn write_string_chunk(&self, buf: &mut Vec<u8>) {
        let mut data = Vec::new();
        let mut offsets = Vec::with_capacity(self.strings.len());
        for text in &self.strings {
            offsets.push(data.len() as u32);
            let units: Vec<u16> = text.encode_utf16().collect();
            if units.len() < 0x8000 {
                write_u16(&mut data, units.len() as u16);
            } else {
                write_u16(&mut data, 0x8000 | ((units.len() >> 16) as u16 & 0x7FFF));
                write_u16(&mut data, (units.len() & 0xFFFF) as u16);
            }
            for unit in units {
                write_u16(&mut data, unit);
            }
            write_u16(&mut data, 0);
        }
        align_to_four(&mut data);

        let header_size = 28u16;
        let chunk_start = begin_chunk(buf, RES_STRING_POOL_TYPE, header_size);
        write_u32(buf, self.strings.len() as u32);
        write_u32(buf, 0); // styleCount
        write_u32(buf, 0); // flags
        write_u32(buf, header_size as u32 + 4 * self.strings.len() as u32);
        write_u32(buf, 0); // stylesStart
        for offset in offsets {
            write_u32(buf, offset);
        }
        buf.extend_from_slice(&data);
        finalize_chunk(buf, chunk_start);
    }

    fn write_resource_map(&self, buf: &mut Vec<u8>) {
        if self.resource_ids.is_empty() {
            return;
        }
        let chunk_start = begin_chunk(buf, RES_XML_RESOURCE_MAP_TYPE, 8);
        for id in &self.resource_ids {
            write_u32(buf, *id);
        }
        finalize_chunk(buf, chunk_start);
    }
}

fn write_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn align_to_four(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn begin_chunk(buf: &mut Vec<u8>, chunk_type: u16, header_size: u16) -> usize {
    let start = buf.len();
    write_u16(buf, chunk_type);
    write_u16(buf, header_size);
    write_u32(buf, 0); // size, patched by finalize_chunk
    start
}

fn finalize_chunk(buf: &mut Vec<u8>, chunk_start: usize) {
    align_to_four(buf);
    let size = (buf.len() - chunk_start) as u32;
    buf[chunk_start + 4..chunk_start + 8].copy_from_slice(&size.to_le_bytes());
}

/// Node chunks share a 16 byte header: type, size, line number, comment.
fn begin_node(buf: &mut Vec<u8>, chunk_type: u16) -> usize {
    let start = begin_chunk(buf, chunk_type, 16);
    write_u32(buf, 1); // lineNumber
    write_u32(buf, NO_ENTRY_INDEX); // comment
    start
}

fn write_namespace_chunk(
    buf: &mut Vec<u8>,
    pool: &PoolBuilder,
    decl: &NamespaceDecl,
    chunk_type: u16,
) -> BinaryXmlResult<()> {
    let chunk_start = begin_node(buf, chunk_type);
    write_u32(buf, pool.index(&decl.prefix)?);
    write_u32(buf, pool.index(&decl.uri)?);
    finalize_chunk(buf, chunk_start);
    Ok(())
}

fn write_element(buf: &mut Vec<u8>, element: &ManifestElement, pool: &PoolBuilder) -> BinaryXmlResult<()> {
    let ns_idx = pool.optional_index(element.namespace_uri.as_deref())?;
    let name_idx = pool.index(&element.tag)?;
    let count = u16::try_from(element.attributes.len()).map_err(|_| {
        BinaryXmlError::Unencodable(format!("too many attributes on <{}>", element.tag))
    })?;

    let chunk_start = begin_node(buf, RES_XML_START_ELEMENT_TYPE);
    write_u32(buf, ns_idx);
    write_u32(buf, name_idx);
    write_u16(buf, 20); // attributeStart
    write_u16(buf, 20); // attributeSize
    write_u16(buf, count);
    write_u16(buf, 0); // idIndex
    write_u16(buf, 0); // classIndex
    write_u16(buf, 0); // styleIndex
    for attr in &element.attributes {
        let raw_idx = match &attr.value {
            ManifestValue::String(text) => pool.index(text)?,
            _ => NO_ENTRY_INDEX,
        };
        let (data_type, data) = attr.value.encode(pool)?;
        write_u32(buf, pool.optional_index(attr.namespace_uri.as_deref())?);
        write_u32(buf, pool.attribute_name_index(attr)?);
        write_u32(buf, raw_idx);
        write_u16(buf, 8);
        write_u8(buf, 0);
        write_u8(buf, data_type);
        write_u32(buf, data);
    }
    finalize_chunk(buf, chunk_start);

    if let Some(text) = &element.text {
        let idx = pool.index(text)?;
        let cdata_start = begin_node(buf, RES_XML_CDATA_TYPE);
        write_u32(buf, idx);
        write_u16(buf, 8);
        write_u8(buf, 0);
        write_u8(buf, TYPE_STRING);
        write_u32(buf, idx);
        finalize_chunk(buf, cdata_start);
    }

    for child in &element.children {
        write_element(buf, child, pool)?;
    }

    let end_start = begin_node(buf, RES_XML_END_ELEMENT_TYPE);
    write_u32(buf, ns_idx);
    write_u32(buf, name_idx);
    finalize_chunk(buf, end_start);
    Ok(())
}

fn write_element_xml(
    element: &ManifestElement,
    writer: &mut Writer<Vec<u8>>,
    namespaces: &[NamespaceDecl],
) -> BinaryXmlResult<()> {
    let element_name = qualified_name(element.namespace_prefix.as_deref(), &element.tag);
    let mut start = BytesStart::new(element_name.as_str());
    for decl in namespaces {
        start.push_attribute((format!("xmlns:{}", decl.prefix).as_str(), decl.uri.as_str()));
    }
    for attr in &element.attributes {
        start.push_attribute((attr.qualified_name().as_str(), attr.value.to_text().as_str()));
    }

    if element.children.is_empty() && element.text.is_none() {
        return writer
            .write_event(Event::Empty(start))
            .map_err(|err| BinaryXmlError::Xml(err.to_string()));
    }
    writer
        .write_event(Event::Start(start))
        .map_err(|err| BinaryXmlError::Xml(err.to_string()))?;
    if let Some(text) = &element.text {
        writer
            .write_event(Event::Text(BytesText::new(text)))
            .map_err(|err| BinaryXmlError::Xml(err.to_string()))?;
    }
    for child in &element.children {
        write_element_xml(child, writer, &[])?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(element_name.as_str())))
        .map_err(|err| BinaryXmlError::Xml(err.to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A manifest shaped like aapt2 output: android attributes sorted by resource id.
    pub(crate) fn sample_manifest() -> AndroidManifest {
        let application = ManifestElement::new("application")
            .with_attributes(vec![
                ManifestAttribute::android("label", ManifestValue::Reference(0x7f0f_001b), 0x0101_0001),
                ManifestAttribute::android("icon", ManifestValue::Reference(0x7f0d_0000), 0x0101_0002),
                ManifestAttribute::android("name", "com.example.sample.App", 0x0101_0003),
                ManifestAttribute::android("allowBackup", true, 0x0101_0280),
                ManifestAttribute::android("supportsRtl", true, 0x0101_03af),
                ManifestAttribute::android("roundIcon", ManifestValue::Reference(0x7f0d_0001), 0x0101_052c),
            ])
            .with_child(ManifestElement::new("activity").with_attributes(vec![
                ManifestAttribute::android("name", "com.example.sample.MainActivity", 0x0101_0003),
                ManifestAttribute::android("exported", true, 0x0101_0010),
            ]));
        let root = ManifestElement::new("manifest")
            .with_attributes(vec![
                ManifestAttribute::android("versionCode", ManifestValue::Integer(42), 0x0101_021b),
                ManifestAttribute::android("versionName", "4.2", 0x0101_021c),
                ManifestAttribute::android("compileSdkVersion", ManifestValue::Integer(34), 0x0101_0572),
                ManifestAttribute::new("package", "com.example.sample"),
                ManifestAttribute::new("platformBuildVersionCode", ManifestValue::Integer(34)),
            ])
            .with_child(ManifestElement::new("uses-sdk").with_attributes(vec![
                ManifestAttribute::android("minSdkVersion", ManifestValue::Integer(21), 0x0101_020c),
            ]))
            .with_child(application);
        AndroidManifest::from_root(root)
    }

    fn names(element: &ManifestElement) -> Vec<String> {
        element.attributes.iter().map(ManifestAttribute::qualified_name).collect()
    }

    #[test]
    fn roundtrip_preserves_tree() {
        let manifest = sample_manifest();
        let bytes = manifest.to_bytes().expect("encode manifest");
        let decoded = AndroidManifest::from_bytes(&bytes).expect("decode manifest");
        assert_eq!(decoded, manifest);
        assert_eq!(decoded.package_name(), Some("com.example.sample"));
    }

    #[test]
    fn roundtrip_keeps_attribute_order_and_resource_ids() {
        let manifest = sample_manifest();
        let decoded = AndroidManifest::from_bytes(&manifest.to_bytes().unwrap()).unwrap();
        let app = decoded.application().expect("application element");
        assert_eq!(
            names(app),
            vec![
                "android:label",
                "android:icon",
                "android:name",
                "android:allowBackup",
                "android:supportsRtl",
                "android:roundIcon",
            ]
        );
        let ids: Vec<_> = app.attributes.iter().map(|attr| attr.resource_id).collect();
        assert_eq!(ids[2], Some(0x0101_0003));
        assert_eq!(
            decoded.root().attribute_value("package"),
            Some(&ManifestValue::from("com.example.sample"))
        );
        let package = decoded
            .root()
            .attributes
            .iter()
            .find(|attr| attr.name == "package")
            .unwrap();
        assert_eq!(package.resource_id, None);
    }

    #[test]
    fn same_name_with_and_without_resource_id_coexist() {
        // `name` is both an android attribute (resource-mapped) and a plain string here.
        let root = ManifestElement::new("manifest")
            .with_attributes(vec![ManifestAttribute::new("name", "plain")])
            .with_child(ManifestElement::new("application").with_attributes(vec![
                ManifestAttribute::android("name", "name", 0x0101_0003),
            ]));
        let manifest = AndroidManifest::from_root(root);
        let decoded = AndroidManifest::from_bytes(&manifest.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, manifest);
    }

    #[test]
    fn opaque_value_types_survive() {
        let root = ManifestElement::new("manifest").with_attributes(vec![ManifestAttribute::android(
            "someDimension",
            ManifestValue::Typed {
                data_type: 0x05,
                data: 0x0000_1001,
            },
            0x0101_0155,
        )]);
        let manifest = AndroidManifest::from_root(root);
        let decoded = AndroidManifest::from_bytes(&manifest.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, manifest);
    }

    #[test]
    fn boolean_true_uses_platform_encoding() {
        let pool = PoolBuilder::for_tree(&ManifestElement::new("manifest"), &[]);
        assert_eq!(
            ManifestValue::Boolean(true).encode(&pool).unwrap(),
            (TYPE_INT_BOOLEAN, 0xFFFF_FFFF)
        );
    }

    #[test]
    fn rejects_non_xml_documents() {
        let err = AndroidManifest::from_bytes(&[0x01, 0x00, 0x08, 0x00, 0x08, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, BinaryXmlError::MalformedDocument(_)));
    }

    #[test]
    fn rejects_truncated_documents() {
        let bytes = sample_manifest().to_bytes().unwrap();
        assert!(AndroidManifest::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn decodes_utf8_pool_entries() {
        // char length 3, byte length 3, "abc", NUL
        let body = [3u8, 3, b'a', b'b', b'c', 0];
        assert_eq!(decode_utf8_entry(&body, 0).unwrap(), "abc");
        assert!(decode_utf8_entry(&body[..3], 0).is_err());
    }

    #[test]
    fn xml_dump_lists_namespaced_attributes() {
        let xml = sample_manifest().to_xml_string().expect("render xml");
        assert!(xml.contains("xmlns:android=\"http://schemas.android.com/apk/res/android\""));
        assert!(xml.contains("android:name=\"com.example.sample.App\""));
        assert!(xml.contains("package=\"com.example.sample\""));
    }
}
