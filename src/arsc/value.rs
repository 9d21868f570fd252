use bitflags::bitflags;

use crate::android::chunk::{write_u16, write_u32, write_u8, BinaryReader};
use crate::android::error::ChunkResult;

pub const TYPE_NULL: u8 = 0x00;
pub const TYPE_REFERENCE: u8 = 0x01;
pub const TYPE_ATTRIBUTE: u8 = 0x02;
pub const TYPE_STRING: u8 = 0x03;
pub const TYPE_FLOAT: u8 = 0x04;
pub const TYPE_DYNAMIC_REFERENCE: u8 = 0x07;
pub const TYPE_INT_DEC: u8 = 0x10;
pub const TYPE_INT_HEX: u8 = 0x11;
pub const TYPE_INT_BOOLEAN: u8 = 0x12;

const VALUE_SIZE: u16 = 8;
const SIMPLE_ENTRY_SIZE: u16 = 8;
const COMPLEX_ENTRY_SIZE: u16 = 16;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EntryFlags: u16 {
        /// A bag of name/value pairs (styles, arrays, plurals).
        const COMPLEX = 0x0001;
        const PUBLIC = 0x0002;
        const WEAK = 0x0004;
        /// Key and value packed into the 8-byte entry header.
        const COMPACT = 0x0008;
        const USES_FEATURE_FLAGS = 0x0010;
    }
}

/// A `Res_value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Value {
    pub size: u16,
    pub res0: u8,
    pub data_type: u8,
    pub data: u32,
}

impl Value {
    pub fn new(data_type: u8, data: u32) -> Self {
        Value {
            size: VALUE_SIZE,
            res0: 0,
            data_type,
            data,
        }
    }

    pub fn string(idx: u32) -> Self {
        Value::new(TYPE_STRING, idx)
    }

    pub fn reference(id: u32) -> Self {
        Value::new(TYPE_REFERENCE, id)
    }

    pub fn int(value: i32) -> Self {
        Value::new(TYPE_INT_DEC, value as u32)
    }

    /// Global string pool index, if this value points into it.
    pub fn string_index(&self) -> Option<u32> {
        (self.data_type == TYPE_STRING).then_some(self.data)
    }

    /// Resource id, if this value references another resource.
    pub fn reference_id(&self) -> Option<u32> {
        matches!(self.data_type, TYPE_REFERENCE | TYPE_DYNAMIC_REFERENCE | TYPE_ATTRIBUTE)
            .then_some(self.data)
            .filter(|id| *id != 0)
    }

    fn read(reader: &mut BinaryReader<'_>) -> ChunkResult<Self> {
        let size = reader.read_u16()?;
        if size < VALUE_SIZE {
            fail!("Res_value size {} too small", size);
        }
        let res0 = reader.read_u8()?;
        let data_type = reader.read_u8()?;
        let data = reader.read_u32()?;
        if size > VALUE_SIZE {
            reader.read_bytes((size - VALUE_SIZE) as usize)?;
        }
        Ok(Value {
            size,
            res0,
            data_type,
            data,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) {
        write_u16(buf, self.size);
        write_u8(buf, self.res0);
        write_u8(buf, self.data_type);
        write_u32(buf, self.data);
        for _ in VALUE_SIZE..self.size {
            write_u8(buf, 0);
        }
    }
}

/// One name/value pair of a complex entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MapItem {
    pub name: u32,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryValue {
    Simple(Value),
    Complex { parent: u32, items: Vec<MapItem> },
}

/// A `ResTable_entry` and the value(s) that follow it. `key` indexes the package key pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entry {
    pub header_size: u16,
    pub flags: EntryFlags,
    pub key: u32,
    pub value: EntryValue,
}

impl Entry {
    pub fn simple(key: u32, value: Value) -> Self {
        Entry {
            header_size: SIMPLE_ENTRY_SIZE,
            flags: EntryFlags::empty(),
            key,
            value: EntryValue::Simple(value),
        }
    }

    pub fn complex(key: u32, parent: u32, items: Vec<MapItem>) -> Self {
        Entry {
            header_size: COMPLEX_ENTRY_SIZE,
            flags: EntryFlags::COMPLEX,
            key,
            value: EntryValue::Complex { parent, items },
        }
    }

    /// Every value carried by this entry, in encoding order.
    pub fn values(&self) -> Vec<&Value> {
        match &self.value {
            EntryValue::Simple(value) => vec![value],
            EntryValue::Complex { items, .. } => items.iter().map(|item| &item.value).collect(),
        }
    }

    pub fn values_mut(&mut self) -> Vec<&mut Value> {
        match &mut self.value {
            EntryValue::Simple(value) => vec![value],
            EntryValue::Complex { items, .. } => items.iter_mut().map(|item| &mut item.value).collect(),
        }
    }

    /// Resource ids this entry points at (values and a complex parent).
    pub fn references(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.values().iter().filter_map(|v| v.reference_id()).collect();
        if let EntryValue::Complex { parent, items } = &self.value {
            if *parent != 0 {
                ids.push(*parent);
            }
            ids.extend(items.iter().map(|item| item.name).filter(|name| (name >> 24) != 0x01 && *name != 0));
        }
        ids
    }

    pub(crate) fn read(reader: &mut BinaryReader<'_>) -> ChunkResult<Self> {
        let size = reader.read_u16()?;
        let flags = EntryFlags::from_bits_retain(reader.read_u16()?);
        if flags.contains(EntryFlags::COMPACT) {
            // Compact layout: the size slot holds the key, the flags' high byte the data type.
            let data = reader.read_u32()?;
            let data_type = (flags.bits() >> 8) as u8;
            return Ok(Entry {
                header_size: 8,
                flags,
                key: size as u32,
                value: EntryValue::Simple(Value::new(data_type, data)),
            });
        }
        let key = reader.read_u32()?;
        if flags.contains(EntryFlags::COMPLEX) {
            if size < COMPLEX_ENTRY_SIZE {
                fail!("Complex entry header size {} too small", size);
            }
            let parent = reader.read_u32()?;
            let count = reader.read_u32()?;
            if size > COMPLEX_ENTRY_SIZE {
                reader.read_bytes((size - COMPLEX_ENTRY_SIZE) as usize)?;
            }
            if count as usize > reader.remaining() / 12 {
                fail!("Complex entry declares {} items, stream too short", count);
            }
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let name = reader.read_u32()?;
                let value = Value::read(reader)?;
                items.push(MapItem { name, value });
            }
            Ok(Entry {
                header_size: size,
                flags,
                key,
                value: EntryValue::Complex { parent, items },
            })
        } else {
            if size < SIMPLE_ENTRY_SIZE {
                fail!("Entry header size {} too small", size);
            }
            if size > SIMPLE_ENTRY_SIZE {
                reader.read_bytes((size - SIMPLE_ENTRY_SIZE) as usize)?;
            }
            let value = Value::read(reader)?;
            Ok(Entry {
                header_size: size,
                flags,
                key,
                value: EntryValue::Simple(value),
            })
        }
    }

    pub(crate) fn write(&self, buf: &mut Vec<u8>) -> ChunkResult<()> {
        if self.flags.contains(EntryFlags::COMPACT) {
            let EntryValue::Simple(value) = &self.value else {
                fail!("Compact entry carries a complex value");
            };
            if self.key > u16::MAX as u32 {
                fail!("Compact entry key {} exceeds 16 bits", self.key);
            }
            write_u16(buf, self.key as u16);
            write_u16(buf, (self.flags.bits() & 0x00FF) | ((value.data_type as u16) << 8));
            write_u32(buf, value.data);
            return Ok(());
        }
        write_u16(buf, self.header_size);
        write_u16(buf, self.flags.bits());
        write_u32(buf, self.key);
        match &self.value {
            EntryValue::Simple(value) => {
                for _ in SIMPLE_ENTRY_SIZE..self.header_size {
                    write_u8(buf, 0);
                }
                value.write(buf);
            }
            EntryValue::Complex { parent, items } => {
                write_u32(buf, *parent);
                write_u32(buf, items.len() as u32);
                for _ in COMPLEX_ENTRY_SIZE..self.header_size {
                    write_u8(buf, 0);
                }
                for item in items {
                    write_u32(buf, item.name);
                    item.value.write(buf);
                }
            }
        }
        Ok(())
    }
}
