use crate::android::chunk::{
    BinaryReader, RES_STRING_POOL_TYPE, RES_XML_START_ELEMENT_TYPE, RES_XML_TYPE,
};
use crate::android::error::ChunkError;
use crate::arsc::string_pool::StringPool;
use crate::arsc::value::{TYPE_ATTRIBUTE, TYPE_DYNAMIC_REFERENCE, TYPE_REFERENCE, TYPE_STRING};

const RES_XML_CDATA_TYPE: u16 = 0x0104;
const XML_HEADER_SIZE: u16 = 8;
const ATTRIBUTE_SIZE: usize = 20;

pub type BinaryXmlResult<T> = Result<T, BinaryXmlError>;

#[derive(Debug)]
pub enum BinaryXmlError {
    MalformedDocument(String),
}

impl std::fmt::Display for BinaryXmlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BinaryXmlError::MalformedDocument(msg) => write!(f, "Malformed binary XML: {msg}"),
        }
    }
}

impl std::error::Error for BinaryXmlError {}

impl From<ChunkError> for BinaryXmlError {
    fn from(value: ChunkError) -> Self {
        BinaryXmlError::MalformedDocument(value.to_string())
    }
}

/// A resource id used by an element attribute or text node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlReference {
    pub element: String,
    /// `None` for a typed text node.
    pub attribute: Option<String>,
    pub id: u32,
}

/// What the bundle passes need to know about a compiled XML document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlReferences {
    pub root_tag: Option<String>,
    /// The `package` attribute of a manifest root.
    pub package: Option<String>,
    pub references: Vec<XmlReference>,
}

/// Whether `bytes` start with a compiled XML header (as opposed to text or protobuf XML).
pub fn is_binary_xml(bytes: &[u8]) -> bool {
    bytes.len() >= 8
        && u16::from_le_bytes([bytes[0], bytes[1]]) == RES_XML_TYPE
        && u16::from_le_bytes([bytes[2], bytes[3]]) == XML_HEADER_SIZE
}

/// Walk a compiled XML document and collect every resource id it references.
pub fn scan_references(bytes: &[u8]) -> BinaryXmlResult<XmlReferences> {
    let mut reader = BinaryReader::new(bytes);
    let xml_header = reader.read_chunk_header()?;
    if xml_header.chunk_type != RES_XML_TYPE {
        return Err(BinaryXmlError::MalformedDocument(
            "Binary XML does not start with RES_XML_TYPE header".to_string(),
        ));
    }
    let xml_end = xml_header.end();
    reader.seek(xml_header.body_start())?;

    let mut pool: Option<StringPool> = None;
    let mut current_element: Option<String> = None;
    let mut scanned = XmlReferences::default();

    while reader.position() < xml_end {
        let chunk = reader.read_chunk_header()?;
        match chunk.chunk_type {
            RES_STRING_POOL_TYPE => {
                pool = Some(StringPool::decode(&mut reader, &chunk)?);
            }
            RES_XML_START_ELEMENT_TYPE => {
                let strings = pool.as_ref().ok_or_else(|| {
                    BinaryXmlError::MalformedDocument("Start element encountered before string pool".to_string())
                })?;
                reader.seek(chunk.body_start())?;
                reader.read_u32()?; // namespace
                let name_idx = reader.read_u32()?;
                let attribute_start = reader.read_u16()? as usize;
                let attribute_size = reader.read_u16()? as usize;
                let attribute_count = reader.read_u16()? as usize;
                if attribute_size < ATTRIBUTE_SIZE && attribute_count > 0 {
                    return Err(BinaryXmlError::MalformedDocument(format!(
                        "Attribute size {attribute_size} too small"
                    )));
                }
                let tag = strings
                    .get(name_idx)
                    .ok_or_else(|| {
                        BinaryXmlError::MalformedDocument("Element references invalid string index".to_string())
                    })?
                    .to_string();
                let is_root = scanned.root_tag.is_none();
                if is_root {
                    scanned.root_tag = Some(tag.clone());
                }

                let first = chunk.body_start() + attribute_start;
                for idx in 0..attribute_count {
                    reader.seek(first + idx * attribute_size)?;
                    let namespace_idx = reader.read_u32()?;
                    let attr_name_idx = reader.read_u32()?;
                    reader.read_u32()?; // raw value
                    reader.read_u16()?; // value size
                    reader.read_u8()?;
                    let data_type = reader.read_u8()?;
                    let data = reader.read_u32()?;
                    let name = strings.get(attr_name_idx).unwrap_or_default().to_string();
                    if is_root
                        && tag == "manifest"
                        && name == "package"
                        && namespace_idx == u32::MAX
                        && data_type == TYPE_STRING
                    {
                        scanned.package = strings.get(data).map(str::to_string);
                    }
                    if is_reference(data_type, data) {
                        scanned.references.push(XmlReference {
                            element: tag.clone(),
                            attribute: Some(name),
                            id: data,
                        });
                    }
                }
                current_element = Some(tag);
            }
            RES_XML_CDATA_TYPE => {
                reader.seek(chunk.body_start())?;
                reader.read_u32()?; // data
                reader.read_u16()?;
                reader.read_u8()?;
                let data_type = reader.read_u8()?;
                let data = reader.read_u32()?;
                if is_reference(data_type, data) {
                    scanned.references.push(XmlReference {
                        element: current_element.clone().unwrap_or_default(),
                        attribute: None,
                        id: data,
                    });
                }
            }
            _ => {}
        }
        reader.seek(chunk.end())?;
    }

    Ok(scanned)
}

fn is_reference(data_type: u8, data: u32) -> bool {
    matches!(data_type, TYPE_REFERENCE | TYPE_DYNAMIC_REFERENCE | TYPE_ATTRIBUTE) && data != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fixtures::{binary_xml, XmlAttr};

    #[test]
    fn collects_manifest_package_and_references() {
        let bytes = binary_xml(
            "manifest",
            &[
                XmlAttr::string("package", "com.example"),
                XmlAttr::reference("icon", 0x7f02_0001),
            ],
        );
        assert!(is_binary_xml(&bytes));
        let scanned = scan_references(&bytes).unwrap();
        assert_eq!(scanned.root_tag.as_deref(), Some("manifest"));
        assert_eq!(scanned.package.as_deref(), Some("com.example"));
        assert_eq!(scanned.references.len(), 1);
        assert_eq!(scanned.references[0].id, 0x7f02_0001);
    }

    #[test]
    fn text_documents_are_not_binary() {
        assert!(!is_binary_xml(b"<manifest package=\"a\"/>"));
    }

    #[test]
    fn truncated_document_is_malformed() {
        let bytes = binary_xml("manifest", &[XmlAttr::reference("icon", 0x7f02_0001)]);
        let err = scan_references(&bytes[..bytes.len() - 6]).unwrap_err();
        assert!(matches!(err, BinaryXmlError::MalformedDocument(_)));
    }
}
