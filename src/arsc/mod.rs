//! Compiled resource table (`resources.arsc`) model and codec.

use std::fmt;

pub mod config;
pub mod string_pool;
pub mod table;
pub mod value;

pub use config::{Locale, ResConfig};
pub use string_pool::{IndexRemap, StringPool, StringPoolBuilder, StyleSpan};
pub use table::{DanglingIndex, EntryLocation, Package, PackageChunk, PoolKind, ResourceTable, TypeChunk, TypeSpec};
pub use value::{Entry, EntryFlags, EntryValue, MapItem, Value};

/// A packed `0xPPTTEEEE` resource identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u32);

impl ResourceId {
    pub fn new(package: u32, type_id: u8, entry: u32) -> Self {
        ResourceId(((package & 0xff) << 24) | ((type_id as u32) << 16) | (entry & 0xffff))
    }

    pub fn package(&self) -> u32 {
        self.0 >> 24
    }

    pub fn type_id(&self) -> u8 {
        ((self.0 >> 16) & 0xff) as u8
    }

    pub fn entry(&self) -> u32 {
        self.0 & 0xffff
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}
