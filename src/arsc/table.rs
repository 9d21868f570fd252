use std::fmt;

use crate::android::chunk::{
    align_to_four, begin_chunk, finalize_chunk, patch_u32, write_u16, write_u32, write_u8,
    BinaryReader, ChunkHeader, RES_STRING_POOL_TYPE, RES_TABLE_PACKAGE_TYPE, RES_TABLE_TYPE,
    RES_TABLE_TYPE_SPEC_TYPE, RES_TABLE_TYPE_TYPE,
};
use crate::android::error::{ChunkContext, ChunkError, ChunkResult};
use crate::arsc::config::ResConfig;
use crate::arsc::string_pool::{IndexRemap, StringPool};
use crate::arsc::value::Entry;
use crate::arsc::ResourceId;

const TABLE_HEADER_SIZE: u16 = 12;
const PACKAGE_HEADER_SIZE: u16 = 288;
const PACKAGE_HEADER_SIZE_LEGACY: u16 = 284;
const PACKAGE_NAME_BYTES: usize = 256;
const TYPE_SPEC_HEADER_SIZE: u16 = 16;
const TYPE_HEADER_FIXED: usize = 20;

const NO_ENTRY: u32 = 0xFFFF_FFFF;
const NO_ENTRY_16: u16 = 0xFFFF;

pub const TYPE_FLAG_SPARSE: u8 = 0x01;
pub const TYPE_FLAG_OFFSET16: u8 = 0x02;

/// A decoded `resources.arsc`.
///
/// Every cross-reference is an index: values into `strings`, entry keys into the
/// owning package's `key_names`, type ids into its `type_names`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceTable {
    pub strings: StringPool,
    pub packages: Vec<Package>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub id: u32,
    name_raw: Vec<u8>,
    pub header_size: u16,
    pub last_public_type: u32,
    pub last_public_key: u32,
    pub type_id_offset: u32,
    pub type_names: StringPool,
    pub key_names: StringPool,
    pub chunks: Vec<PackageChunk>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageChunk {
    Spec(TypeSpec),
    Type(TypeChunk),
    /// Library, overlayable and other chunks this crate never rewrites.
    Raw { chunk_type: u16, bytes: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeSpec {
    pub id: u8,
    pub res0: u8,
    pub types_count: u16,
    pub flags: Vec<u32>,
}

/// Values of one type under one configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeChunk {
    pub id: u8,
    pub flags: u8,
    pub reserved: u16,
    pub config: ResConfig,
    header_extra: Vec<u8>,
    /// Dense slot count; recomputed for sparse chunks.
    pub entry_count: u32,
    /// Present entries, ascending by entry index.
    pub entries: Vec<(u32, Entry)>,
}

/// Which pool a dangling index pointed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Global,
    Key,
    Type,
}

/// A reference that no longer resolves to a live pool slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingIndex {
    pub pool: PoolKind,
    pub index: u32,
    pub pool_len: usize,
    pub resource: Option<ResourceId>,
}

impl fmt::Display for DanglingIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pool = match self.pool {
            PoolKind::Global => "global string",
            PoolKind::Key => "key",
            PoolKind::Type => "type",
        };
        write!(f, "{pool} pool index {} out of range ({} slots)", self.index, self.pool_len)?;
        if let Some(id) = self.resource {
            write!(f, " referenced by {id}")?;
        }
        Ok(())
    }
}

/// Position of one entry inside a table: package, chunk and slot in that chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryLocation {
    pub package: usize,
    pub chunk: usize,
    pub slot: usize,
}

impl ResourceTable {
    pub fn new(strings: StringPool) -> Self {
        ResourceTable {
            strings,
            packages: Vec::new(),
        }
    }

    pub fn decode(bytes: &[u8]) -> ChunkResult<Self> {
        let mut reader = BinaryReader::new(bytes);
        let header = reader.read_chunk_header().within(|| "table header".to_string())?;
        if header.chunk_type != RES_TABLE_TYPE {
            fail!("Not a resource table (chunk type 0x{:04x})", header.chunk_type);
        }
        if header.header_size != TABLE_HEADER_SIZE {
            fail!("Unsupported resource table format (header size {})", header.header_size);
        }
        if header.end() != bytes.len() {
            fail!("Table size {} does not match {} bytes of input", header.chunk_size, bytes.len());
        }
        let package_count = reader.read_u32()?;

        reader.seek(header.body_start())?;
        let mut strings = None;
        let mut packages = Vec::new();
        while reader.position() < header.end() {
            let chunk = reader.read_chunk_header().within(|| "table body".to_string())?;
            match chunk.chunk_type {
                RES_STRING_POOL_TYPE if strings.is_none() => {
                    strings = Some(
                        StringPool::decode(&mut reader, &chunk).within(|| "global string pool".to_string())?,
                    );
                }
                RES_TABLE_PACKAGE_TYPE => {
                    let idx = packages.len();
                    packages.push(Package::decode(&mut reader, &chunk).within(|| format!("package #{idx}"))?);
                }
                other => fail!("Unexpected chunk 0x{:04x} at offset {} in table", other, chunk.start),
            }
            reader.seek(chunk.end())?;
        }
        let Some(strings) = strings else {
            fail!("Resource table has no global string pool");
        };
        if packages.len() != package_count as usize {
            fail!("Table declares {} packages but holds {}", package_count, packages.len());
        }
        let table = ResourceTable { strings, packages };
        if let Some(dangling) = table.dangling_indices().into_iter().next() {
            return Err(err!("{}", dangling));
        }
        Ok(table)
    }

    pub fn encode(&self) -> ChunkResult<Vec<u8>> {
        let mut buf = Vec::new();
        let start = begin_chunk(&mut buf, RES_TABLE_TYPE, TABLE_HEADER_SIZE);
        write_u32(&mut buf, self.packages.len() as u32);
        self.strings.encode(&mut buf).within(|| "global string pool".to_string())?;
        for (idx, package) in self.packages.iter().enumerate() {
            package.encode(&mut buf).within(|| format!("package #{idx}"))?;
        }
        finalize_chunk(&mut buf, start);
        Ok(buf)
    }

    pub fn package_by_id(&self, id: u32) -> Option<&Package> {
        self.packages.iter().find(|p| p.id == id)
    }

    /// Every entry in encounter order: package, type id, configuration, entry index.
    pub fn entry_locations(&self) -> Vec<EntryLocation> {
        let mut keyed = Vec::new();
        for (package_idx, package) in self.packages.iter().enumerate() {
            for (chunk_idx, chunk) in package.chunks.iter().enumerate() {
                if let PackageChunk::Type(ty) = chunk {
                    for (slot, (index, _)) in ty.entries.iter().enumerate() {
                        keyed.push((
                            (package_idx, ty.id, chunk_idx, *index),
                            EntryLocation {
                                package: package_idx,
                                chunk: chunk_idx,
                                slot,
                            },
                        ));
                    }
                }
            }
        }
        keyed.sort_by_key(|(key, _)| *key);
        keyed.into_iter().map(|(_, loc)| loc).collect()
    }

    pub fn type_chunk(&self, loc: &EntryLocation) -> Option<&TypeChunk> {
        match self.packages.get(loc.package)?.chunks.get(loc.chunk)? {
            PackageChunk::Type(ty) => Some(ty),
            _ => None,
        }
    }

    pub fn entry(&self, loc: &EntryLocation) -> Option<&Entry> {
        self.type_chunk(loc)?.entries.get(loc.slot).map(|(_, entry)| entry)
    }

    pub fn entry_mut(&mut self, loc: &EntryLocation) -> Option<&mut Entry> {
        match self.packages.get_mut(loc.package)?.chunks.get_mut(loc.chunk)? {
            PackageChunk::Type(ty) => ty.entries.get_mut(loc.slot).map(|(_, entry)| entry),
            _ => None,
        }
    }

    pub fn resource_id(&self, loc: &EntryLocation) -> Option<ResourceId> {
        let package = self.packages.get(loc.package)?;
        let ty = self.type_chunk(loc)?;
        let (index, _) = ty.entries.get(loc.slot)?;
        Some(ResourceId::new(package.id, ty.id, *index))
    }

    /// Whether any configuration still defines a value for `id`.
    pub fn contains(&self, id: ResourceId) -> bool {
        self.package_by_id(id.package()).is_some_and(|package| {
            package.types().any(|ty| {
                ty.id == id.type_id()
                    && ty
                        .entries
                        .binary_search_by_key(&id.entry(), |(index, _)| *index)
                        .is_ok()
            })
        })
    }

    /// Live references into the global string pool, counted per slot.
    pub fn string_reference_counts(&self) -> Vec<u32> {
        let mut counts = vec![0u32; self.strings.len()];
        for package in &self.packages {
            for ty in package.types() {
                for (_, entry) in &ty.entries {
                    for value in entry.values() {
                        if let Some(slot) = value.string_index().and_then(|idx| counts.get_mut(idx as usize)) {
                            *slot += 1;
                        }
                    }
                }
            }
        }
        for idx in 0..self.strings.style_count() {
            for span in self.strings.style(idx as u32).unwrap_or_default() {
                if let Some(slot) = counts.get_mut(span.name as usize) {
                    *slot += 1;
                }
            }
        }
        counts
    }

    /// Rewrite every global-string value through `f` (old index -> new index).
    pub fn rewrite_string_refs<F: FnMut(u32) -> u32>(&mut self, mut f: F) {
        for package in &mut self.packages {
            for ty in package.types_mut() {
                for (_, entry) in &mut ty.entries {
                    for value in entry.values_mut() {
                        if let Some(idx) = value.string_index() {
                            value.data = f(idx);
                        }
                    }
                }
            }
        }
    }

    /// Drop global strings whose `keep` slot is false, renumbering every reference.
    ///
    /// Fails before touching anything if a live value still points at a dropped slot.
    pub fn compact_strings(&mut self, keep: &[bool]) -> Result<IndexRemap, DanglingIndex> {
        for loc in self.entry_locations() {
            let Some(entry) = self.entry(&loc) else { continue };
            for value in entry.values() {
                if let Some(idx) = value.string_index() {
                    if !keep.get(idx as usize).copied().unwrap_or(true) {
                        return Err(DanglingIndex {
                            pool: PoolKind::Global,
                            index: idx,
                            pool_len: self.strings.len(),
                            resource: self.resource_id(&loc),
                        });
                    }
                }
            }
        }
        let remap = self.strings.compact(keep);
        self.rewrite_string_refs(|idx| remap.get(idx).unwrap_or(idx));
        Ok(remap)
    }

    /// Every index that does not resolve to a live pool slot.
    pub fn dangling_indices(&self) -> Vec<DanglingIndex> {
        let mut dangling = Vec::new();
        let global_len = self.strings.len();
        for idx in 0..self.strings.style_count() {
            for span in self.strings.style(idx as u32).unwrap_or_default() {
                if span.name as usize >= global_len {
                    dangling.push(DanglingIndex {
                        pool: PoolKind::Global,
                        index: span.name,
                        pool_len: global_len,
                        resource: None,
                    });
                }
            }
        }
        for package in &self.packages {
            for chunk in &package.chunks {
                let type_id = match chunk {
                    PackageChunk::Spec(spec) => spec.id,
                    PackageChunk::Type(ty) => ty.id,
                    PackageChunk::Raw { .. } => continue,
                };
                if package.type_name(type_id).is_none() {
                    dangling.push(DanglingIndex {
                        pool: PoolKind::Type,
                        index: type_id as u32,
                        pool_len: package.type_names.len(),
                        resource: None,
                    });
                }
            }
            for ty in package.types() {
                for (index, entry) in &ty.entries {
                    let id = ResourceId::new(package.id, ty.id, *index);
                    if entry.key as usize >= package.key_names.len() {
                        dangling.push(DanglingIndex {
                            pool: PoolKind::Key,
                            index: entry.key,
                            pool_len: package.key_names.len(),
                            resource: Some(id),
                        });
                    }
                    for value in entry.values() {
                        if let Some(idx) = value.string_index() {
                            if idx as usize >= global_len {
                                dangling.push(DanglingIndex {
                                    pool: PoolKind::Global,
                                    index: idx,
                                    pool_len: global_len,
                                    resource: Some(id),
                                });
                            }
                        }
                    }
                }
            }
        }
        dangling
    }

    /// Resource ids referenced from table values that no longer have any value.
    pub fn dangling_resource_references(&self) -> Vec<(ResourceId, ResourceId)> {
        let mut missing = Vec::new();
        for loc in self.entry_locations() {
            let (Some(entry), Some(owner)) = (self.entry(&loc), self.resource_id(&loc)) else {
                continue;
            };
            for target in entry.references() {
                let target = ResourceId(target);
                if self.package_by_id(target.package()).is_some() && !self.contains(target) {
                    missing.push((owner, target));
                }
            }
        }
        missing
    }
}

impl Package {
    pub fn new(id: u32, name: &str, type_names: StringPool, key_names: StringPool) -> Self {
        let mut name_raw = vec![0u8; PACKAGE_NAME_BYTES];
        for (idx, unit) in name.encode_utf16().take(PACKAGE_NAME_BYTES / 2 - 1).enumerate() {
            name_raw[idx * 2..idx * 2 + 2].copy_from_slice(&unit.to_le_bytes());
        }
        Package {
            id,
            name_raw,
            header_size: PACKAGE_HEADER_SIZE,
            last_public_type: 0,
            last_public_key: 0,
            type_id_offset: 0,
            type_names,
            key_names,
            chunks: Vec::new(),
        }
    }

    pub fn name(&self) -> String {
        let units: Vec<u16> = self
            .name_raw
            .chunks_exact(2)
            .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
            .take_while(|&c| c != 0)
            .collect();
        String::from_utf16_lossy(&units)
    }

    pub fn type_name(&self, type_id: u8) -> Option<&str> {
        let idx = (type_id as u32).checked_sub(1 + self.type_id_offset)?;
        self.type_names.get(idx)
    }

    pub fn type_index(&self, type_id: u8) -> Option<u32> {
        (type_id as u32)
            .checked_sub(1 + self.type_id_offset)
            .filter(|idx| (*idx as usize) < self.type_names.len())
    }

    pub fn type_id_of(&self, name: &str) -> Option<u8> {
        let idx = self.type_names.index_of(name)?;
        u8::try_from(idx + 1 + self.type_id_offset).ok()
    }

    pub fn key_name(&self, entry: &Entry) -> Option<&str> {
        self.key_names.get(entry.key)
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeChunk> {
        self.chunks.iter().filter_map(|chunk| match chunk {
            PackageChunk::Type(ty) => Some(ty),
            _ => None,
        })
    }

    pub fn types_mut(&mut self) -> impl Iterator<Item = &mut TypeChunk> {
        self.chunks.iter_mut().filter_map(|chunk| match chunk {
            PackageChunk::Type(ty) => Some(ty),
            _ => None,
        })
    }

    fn decode(reader: &mut BinaryReader<'_>, header: &ChunkHeader) -> ChunkResult<Self> {
        if header.header_size != PACKAGE_HEADER_SIZE && header.header_size != PACKAGE_HEADER_SIZE_LEGACY {
            fail!("Unsupported package header size {}", header.header_size);
        }
        reader.seek(header.start + 8)?;
        let id = reader.read_u32()?;
        let name_raw = reader.read_bytes(PACKAGE_NAME_BYTES)?.to_vec();
        let type_strings = reader.read_u32()? as usize;
        let last_public_type = reader.read_u32()?;
        let key_strings = reader.read_u32()? as usize;
        let last_public_key = reader.read_u32()?;
        let type_id_offset = if header.header_size == PACKAGE_HEADER_SIZE {
            reader.read_u32()?
        } else {
            0
        };
        if type_strings == 0 || key_strings == 0 {
            fail!("Package 0x{:02x} inherits its type or key pool, which is not supported", id);
        }

        let mut type_names = None;
        let mut key_names = None;
        let mut chunks = Vec::new();
        reader.seek(header.body_start())?;
        while reader.position() < header.end() {
            let chunk = reader.read_chunk_header()?;
            if chunk.end() > header.end() {
                fail!("Chunk at offset {} overruns package", chunk.start);
            }
            let relative = chunk.start - header.start;
            if relative == type_strings {
                type_names = Some(StringPool::decode(reader, &chunk).within(|| "type pool".to_string())?);
            } else if relative == key_strings {
                key_names = Some(StringPool::decode(reader, &chunk).within(|| "key pool".to_string())?);
            } else {
                match chunk.chunk_type {
                    RES_TABLE_TYPE_SPEC_TYPE => {
                        chunks.push(PackageChunk::Spec(
                            TypeSpec::decode(reader, &chunk).within(|| format!("type spec at {}", chunk.start))?,
                        ));
                    }
                    RES_TABLE_TYPE_TYPE => {
                        chunks.push(PackageChunk::Type(
                            TypeChunk::decode(reader, &chunk).within(|| format!("type chunk at {}", chunk.start))?,
                        ));
                    }
                    other => {
                        reader.seek(chunk.start)?;
                        let bytes = reader.read_bytes(chunk.chunk_size as usize)?.to_vec();
                        chunks.push(PackageChunk::Raw {
                            chunk_type: other,
                            bytes,
                        });
                    }
                }
            }
            reader.seek(chunk.end())?;
        }
        let (Some(type_names), Some(key_names)) = (type_names, key_names) else {
            fail!("Package 0x{:02x} type/key pool offsets do not point at chunks", id);
        };
        Ok(Package {
            id,
            name_raw,
            header_size: header.header_size,
            last_public_type,
            last_public_key,
            type_id_offset,
            type_names,
            key_names,
            chunks,
        })
    }

    fn encode(&self, buf: &mut Vec<u8>) -> ChunkResult<()> {
        let start = begin_chunk(buf, RES_TABLE_PACKAGE_TYPE, self.header_size);
        write_u32(buf, self.id);
        buf.extend_from_slice(&self.name_raw);
        let type_strings_slot = buf.len();
        write_u32(buf, 0);
        write_u32(buf, self.last_public_type);
        let key_strings_slot = buf.len();
        write_u32(buf, 0);
        write_u32(buf, self.last_public_key);
        if self.header_size == PACKAGE_HEADER_SIZE {
            write_u32(buf, self.type_id_offset);
        }

        let type_strings = (buf.len() - start) as u32;
        self.type_names.encode(buf).within(|| "type pool".to_string())?;
        let key_strings = (buf.len() - start) as u32;
        self.key_names.encode(buf).within(|| "key pool".to_string())?;
        patch_u32(buf, type_strings_slot, type_strings);
        patch_u32(buf, key_strings_slot, key_strings);

        for chunk in &self.chunks {
            match chunk {
                PackageChunk::Spec(spec) => spec.encode(buf),
                PackageChunk::Type(ty) => ty.encode(buf).within(|| format!("type 0x{:02x}", ty.id))?,
                PackageChunk::Raw { bytes, .. } => buf.extend_from_slice(bytes),
            }
        }
        finalize_chunk(buf, start);
        Ok(())
    }
}

impl TypeSpec {
    fn decode(reader: &mut BinaryReader<'_>, header: &ChunkHeader) -> ChunkResult<Self> {
        reader.seek(header.start + 8)?;
        let id = reader.read_u8()?;
        if id == 0 {
            fail!("Type spec id 0 is invalid");
        }
        let res0 = reader.read_u8()?;
        let types_count = reader.read_u16()?;
        let entry_count = reader.read_u32()? as usize;
        if header.header_size as usize + entry_count * 4 > header.chunk_size as usize {
            fail!("Type spec declares {} entries beyond chunk end", entry_count);
        }
        reader.seek(header.body_start())?;
        let mut flags = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            flags.push(reader.read_u32()?);
        }
        Ok(TypeSpec {
            id,
            res0,
            types_count,
            flags,
        })
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        let start = begin_chunk(buf, RES_TABLE_TYPE_SPEC_TYPE, TYPE_SPEC_HEADER_SIZE);
        write_u8(buf, self.id);
        write_u8(buf, self.res0);
        write_u16(buf, self.types_count);
        write_u32(buf, self.flags.len() as u32);
        for flag in &self.flags {
            write_u32(buf, *flag);
        }
        finalize_chunk(buf, start);
    }
}

impl TypeChunk {
    pub fn new(id: u8, config: ResConfig, entry_count: u32) -> Self {
        TypeChunk {
            id,
            flags: 0,
            reserved: 0,
            config,
            header_extra: Vec::new(),
            entry_count,
            entries: Vec::new(),
        }
    }

    pub fn is_sparse(&self) -> bool {
        self.flags & TYPE_FLAG_SPARSE != 0
    }

    pub fn get(&self, index: u32) -> Option<&Entry> {
        self.entries
            .binary_search_by_key(&index, |(idx, _)| *idx)
            .ok()
            .map(|slot| &self.entries[slot].1)
    }

    /// Insert or replace the entry at `index`, keeping slots ordered.
    pub fn insert(&mut self, index: u32, entry: Entry) {
        match self.entries.binary_search_by_key(&index, |(idx, _)| *idx) {
            Ok(slot) => self.entries[slot].1 = entry,
            Err(slot) => self.entries.insert(slot, (index, entry)),
        }
        if !self.is_sparse() && index >= self.entry_count {
            self.entry_count = index + 1;
        }
    }

    pub fn remove(&mut self, index: u32) -> Option<Entry> {
        let slot = self.entries.binary_search_by_key(&index, |(idx, _)| *idx).ok()?;
        Some(self.entries.remove(slot).1)
    }

    fn decode(reader: &mut BinaryReader<'_>, header: &ChunkHeader) -> ChunkResult<Self> {
        reader.seek(header.start + 8)?;
        let id = reader.read_u8()?;
        if id == 0 {
            fail!("Type id 0 is invalid");
        }
        let flags = reader.read_u8()?;
        let reserved = reader.read_u16()?;
        let entry_count = reader.read_u32()?;
        let entries_start = reader.read_u32()? as usize;
        let config = ResConfig::read(reader).within(|| "configuration".to_string())?;
        let fixed = TYPE_HEADER_FIXED + config.size();
        if (header.header_size as usize) < fixed {
            fail!("Type header size {} smaller than its configuration ({})", header.header_size, fixed);
        }
        let header_extra = reader.read_bytes(header.header_size as usize - fixed)?.to_vec();
        if entries_start > header.chunk_size as usize {
            fail!("Entries start {} beyond chunk size {}", entries_start, header.chunk_size);
        }

        reader.seek(header.body_start())?;
        let mut offsets: Vec<(u32, usize)> = Vec::new();
        if flags & TYPE_FLAG_SPARSE != 0 {
            for _ in 0..entry_count {
                let index = reader.read_u16()? as u32;
                let offset = reader.read_u16()? as usize * 4;
                offsets.push((index, offset));
            }
        } else if flags & TYPE_FLAG_OFFSET16 != 0 {
            for index in 0..entry_count {
                let offset = reader.read_u16()?;
                if offset != NO_ENTRY_16 {
                    offsets.push((index, offset as usize * 4));
                }
            }
        } else {
            for index in 0..entry_count {
                let offset = reader.read_u32()?;
                if offset != NO_ENTRY {
                    offsets.push((index, offset as usize));
                }
            }
        }
        if reader.position() > header.start + entries_start {
            fail!("Entry offsets overlap entry data");
        }

        let data = &reader.data()[..header.end()];
        let base = header.start + entries_start;
        let mut entries = Vec::with_capacity(offsets.len());
        for (index, offset) in offsets {
            let mut cursor = BinaryReader::new(data);
            cursor.seek(base + offset).within(|| format!("entry {index}"))?;
            let entry = Entry::read(&mut cursor).within(|| format!("entry {index}"))?;
            entries.push((index, entry));
        }
        entries.sort_by_key(|(index, _)| *index);
        if entries.windows(2).any(|pair| pair[0].0 == pair[1].0) {
            fail!("Duplicate entry index in type chunk");
        }
        let entry_count = if flags & TYPE_FLAG_SPARSE != 0 {
            entries.last().map(|(index, _)| index + 1).unwrap_or(0)
        } else {
            entry_count
        };
        Ok(TypeChunk {
            id,
            flags,
            reserved,
            config,
            header_extra,
            entry_count,
            entries,
        })
    }

    fn encode(&self, buf: &mut Vec<u8>) -> ChunkResult<()> {
        let header_size = TYPE_HEADER_FIXED + self.config.size() + self.header_extra.len();
        let header_size =
            u16::try_from(header_size).map_err(|_| ChunkError::new("Type header exceeds 16 bits"))?;
        let start = begin_chunk(buf, RES_TABLE_TYPE_TYPE, header_size);
        write_u8(buf, self.id);
        write_u8(buf, self.flags);
        write_u16(buf, self.reserved);
        let count_slot = buf.len();
        write_u32(buf, 0);
        let entries_start_slot = buf.len();
        write_u32(buf, 0);
        self.config.write(buf);
        buf.extend_from_slice(&self.header_extra);

        let mut data = Vec::new();
        let mut offsets = Vec::with_capacity(self.entries.len());
        for (index, entry) in &self.entries {
            offsets.push((*index, data.len()));
            entry.write(&mut data).within(|| format!("entry {index}"))?;
        }

        let count = if self.is_sparse() {
            for (index, offset) in &offsets {
                let index = u16::try_from(*index).map_err(|_| err!("Sparse entry index {} exceeds 16 bits", index))?;
                write_u16(buf, index);
                write_u16(buf, offset16(*offset)?);
            }
            offsets.len() as u32
        } else {
            if let Some((index, _)) = offsets.iter().find(|(index, _)| *index >= self.entry_count) {
                fail!("Entry index {} beyond declared count {}", index, self.entry_count);
            }
            let mut slots = offsets.iter().peekable();
            for index in 0..self.entry_count {
                let offset = match slots.peek() {
                    Some((slot_index, offset)) if *slot_index == index => {
                        let offset = *offset;
                        slots.next();
                        Some(offset)
                    }
                    _ => None,
                };
                if self.flags & TYPE_FLAG_OFFSET16 != 0 {
                    match offset {
                        Some(offset) => write_u16(buf, offset16(offset)?),
                        None => write_u16(buf, NO_ENTRY_16),
                    }
                } else {
                    write_u32(buf, offset.map(|o| o as u32).unwrap_or(NO_ENTRY));
                }
            }
            self.entry_count
        };
        align_to_four(buf);
        patch_u32(buf, count_slot, count);
        let entries_start = (buf.len() - start) as u32;
        patch_u32(buf, entries_start_slot, entries_start);
        buf.extend_from_slice(&data);
        finalize_chunk(buf, start);
        Ok(())
    }
}

fn offset16(offset: usize) -> ChunkResult<u16> {
    let scaled = offset / 4;
    if offset % 4 != 0 || scaled >= NO_ENTRY_16 as usize {
        fail!("Entry offset {} not representable in 16 bits", offset);
    }
    Ok(scaled as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arsc::value::{Entry, Value};

    fn sample() -> ResourceTable {
        let mut strings = StringPool::utf8();
        let hello = strings.push("hello");
        let bonjour = strings.push("bonjour");
        let mut types = StringPool::utf8();
        types.push("string");
        let mut keys = StringPool::utf8();
        let greeting = keys.push("greeting");
        let mut package = Package::new(0x7f, "com.example", types, keys);
        package.chunks.push(PackageChunk::Spec(TypeSpec {
            id: 1,
            res0: 0,
            types_count: 2,
            flags: vec![0],
        }));
        let mut default = TypeChunk::new(1, ResConfig::default_config(), 1);
        default.insert(0, Entry::simple(greeting, Value::string(hello)));
        let mut french = TypeChunk::new(1, ResConfig::with_locale("fr", None), 1);
        french.flags = TYPE_FLAG_OFFSET16;
        french.insert(0, Entry::simple(greeting, Value::string(bonjour)));
        package.chunks.push(PackageChunk::Type(default));
        package.chunks.push(PackageChunk::Type(french));
        let mut table = ResourceTable::new(strings);
        table.packages.push(package);
        table
    }

    #[test]
    fn decode_encode_is_byte_identical() {
        let bytes = sample().encode().unwrap();
        let decoded = ResourceTable::decode(&bytes).unwrap();
        assert_eq!(decoded, sample());
        assert_eq!(decoded.encode().unwrap(), bytes);
    }

    #[test]
    fn sparse_chunks_only_store_present_entries() {
        let mut table = sample();
        let PackageChunk::Type(ty) = &mut table.packages[0].chunks[1] else {
            unreachable!()
        };
        ty.flags = TYPE_FLAG_SPARSE;
        let bytes = table.encode().unwrap();
        let decoded = ResourceTable::decode(&bytes).unwrap();
        let ty = decoded.packages[0].types().next().unwrap();
        assert!(ty.is_sparse());
        assert_eq!(ty.get(0).unwrap().values()[0].string_index(), Some(0));
        assert_eq!(decoded.encode().unwrap(), bytes);
    }

    #[test]
    fn out_of_range_string_index_is_malformed() {
        let mut table = sample();
        let loc = table.entry_locations()[0];
        table.entry_mut(&loc).unwrap().value = crate::arsc::value::EntryValue::Simple(Value::string(99));
        let bytes = table.encode().unwrap();
        let err = ResourceTable::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("global string pool index 99"), "{err}");
    }

    #[test]
    fn unsupported_header_size_is_rejected() {
        let mut bytes = sample().encode().unwrap();
        bytes[2] = 16;
        let err = ResourceTable::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("Unsupported resource table format"), "{err}");
    }

    #[test]
    fn compaction_refuses_to_drop_live_strings() {
        let mut table = sample();
        let dangling = table.compact_strings(&[false, true]).unwrap_err();
        assert_eq!(dangling.index, 0);
        assert_eq!(table.strings.len(), 2);
    }

    #[test]
    fn encounter_order_is_package_type_config_entry() {
        let table = sample();
        let locs = table.entry_locations();
        assert_eq!(locs.len(), 2);
        assert_eq!(locs[0].chunk, 1);
        assert_eq!(locs[1].chunk, 2);
        assert_eq!(table.resource_id(&locs[0]), Some(ResourceId(0x7f01_0000)));
        assert_eq!(table.packages[0].name(), "com.example");
    }
}
