//! Android container formats: the chunk framing shared by compiled resources,
//! the bundle archive, and binary XML documents.

#[macro_use]
pub mod error;

pub mod binary_xml;
pub mod chunk;
pub mod zip;
