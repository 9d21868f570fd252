use crc32fast::Hasher as Crc32;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use log::{debug, trace};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use zip::read::ZipArchive;

const LOCAL_HEADER_SIGNATURE: u32 = 0x04034b50;
const CENTRAL_HEADER_SIGNATURE: u32 = 0x02014b50;
const END_OF_CENTRAL_SIGNATURE: u32 = 0x06054b50;
const LOCAL_HEADER_LEN: u64 = 30;
const VERSION_MADE_BY: u16 = 0x031E;
const VERSION_NEEDED: u16 = 20;
const FLAG_UTF8_NAME: u16 = 0x0800;

/// Every entry is stamped 1981-01-01 00:00:00 so identical input yields identical bytes.
const DOS_DATE: u16 = ((1981 - 1980) << 9) | (1 << 5) | 1;
const DOS_TIME: u16 = 0;

/// Result alias for bundle archive operations.
pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Errors surfaced while reading or writing a bundle archive.
#[derive(Debug)]
pub enum ArchiveError {
    Io(io::Error),
    Zip(zip::result::ZipError),
    /// Unreadable central directory, checksum mismatch, unsafe or duplicate names.
    Corrupt(String),
    InvalidInput(String),
}

impl std::fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveError::Io(err) => write!(f, "I/O error: {err}"),
            ArchiveError::Zip(err) => write!(f, "ZIP error: {err}"),
            ArchiveError::Corrupt(msg) => write!(f, "corrupt archive: {msg}"),
            ArchiveError::InvalidInput(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ArchiveError {}

impl From<io::Error> for ArchiveError {
    fn from(value: io::Error) -> Self {
        ArchiveError::Io(value)
    }
}

impl From<zip::result::ZipError> for ArchiveError {
    fn from(value: zip::result::ZipError) -> Self {
        ArchiveError::Zip(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryCompression {
    Stored,
    Deflated,
}

impl EntryCompression {
    fn method(self) -> u16 {
        match self {
            EntryCompression::Stored => 0,
            EntryCompression::Deflated => 8,
        }
    }
}

#[derive(Clone, Debug)]
enum Payload {
    /// Still inside the input file; copied as raw compressed bytes on write.
    Input(usize),
    Memory(Vec<u8>),
}

/// Metadata and payload location of one archive entry.
#[derive(Clone, Debug)]
pub struct ArchiveEntry {
    payload: Payload,
    pub compression: Option<EntryCompression>,
    pub unix_mode: Option<u32>,
    crc32: u32,
    size: u64,
    compressed_size: u64,
}

impl ArchiveEntry {
    fn in_memory(data: Vec<u8>) -> Self {
        let mut crc = Crc32::new();
        crc.update(&data);
        ArchiveEntry {
            crc32: crc.finalize(),
            size: data.len() as u64,
            compressed_size: data.len() as u64,
            payload: Payload::Memory(data),
            compression: None,
            unix_mode: None,
        }
    }

    pub fn is_modified(&self) -> bool {
        matches!(self.payload, Payload::Memory(_))
    }

    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// A bundle opened for transformation.
///
/// The input file stays open for the lifetime of the archive: untouched entries are
/// never decompressed, only their raw bytes are copied when the archive is written.
/// Entries live in a `BTreeMap`, which fixes the output order.
pub struct Archive {
    source: Option<ZipArchive<File>>,
    entries: BTreeMap<String, ArchiveEntry>,
}

impl Default for Archive {
    fn default() -> Self {
        Archive::new()
    }
}

impl Archive {
    pub fn new() -> Self {
        Archive {
            source: None,
            entries: BTreeMap::new(),
        }
    }

    /// Open a bundle and verify every entry's CRC.
    pub fn open(path: impl AsRef<Path>) -> ArchiveResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mut zip = ZipArchive::new(file)
            .map_err(|err| ArchiveError::Corrupt(format!("{}: {err}", path.display())))?;
        let mut entries = BTreeMap::new();
        for idx in 0..zip.len() {
            let mut entry = zip
                .by_index(idx)
                .map_err(|err| ArchiveError::Corrupt(format!("entry #{idx}: {err}")))?;
            if entry.is_dir() {
                continue;
            }
            let enclosed: PathBuf = match entry.enclosed_name() {
                Some(name) => name.to_path_buf(),
                None => {
                    return Err(ArchiveError::Corrupt(format!(
                        "unsafe entry path {}",
                        entry.name()
                    )))
                }
            };
            let name = path_to_entry_name(&enclosed)?;
            let compression = match entry.compression() {
                zip::CompressionMethod::Stored => EntryCompression::Stored,
                zip::CompressionMethod::Deflated => EntryCompression::Deflated,
                other => {
                    return Err(ArchiveError::Corrupt(format!(
                        "{name}: unsupported compression method {other:?}"
                    )))
                }
            };
            let record = ArchiveEntry {
                payload: Payload::Input(idx),
                compression: Some(compression),
                unix_mode: entry.unix_mode(),
                crc32: entry.crc32(),
                size: entry.size(),
                compressed_size: entry.compressed_size(),
            };
            io::copy(&mut entry, &mut io::sink())
                .map_err(|err| ArchiveError::Corrupt(format!("{name}: {err}")))?;
            if entries.insert(name.clone(), record).is_some() {
                return Err(ArchiveError::Corrupt(format!("duplicate entry {name}")));
            }
        }
        debug!("Opened {} with {} entries", path.display(), entries.len());
        Ok(Archive {
            source: Some(zip),
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Entry names in output order.
    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|s| s.as_str())
    }

    pub fn entry(&self, name: &str) -> Option<&ArchiveEntry> {
        self.entries.get(name)
    }

    /// Decompressed contents of one entry.
    pub fn read_entry(&mut self, name: &str) -> ArchiveResult<Vec<u8>> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| ArchiveError::InvalidInput(format!("no entry named {name}")))?;
        match &entry.payload {
            Payload::Memory(data) => Ok(data.clone()),
            Payload::Input(idx) => {
                let zip = self
                    .source
                    .as_mut()
                    .ok_or_else(|| ArchiveError::InvalidInput(format!("{name} has no backing file")))?;
                let mut file = zip.by_index(*idx)?;
                let mut data = Vec::with_capacity(entry.size as usize);
                file.read_to_end(&mut data)?;
                Ok(data)
            }
        }
    }

    /// Replace the contents of an entry (or add a new one), keeping its mode and compression.
    pub fn replace_entry(&mut self, name: impl AsRef<str>, data: Vec<u8>) -> ArchiveResult<()> {
        let normalized = normalize_entry_name(name.as_ref())?;
        let mut replacement = ArchiveEntry::in_memory(data);
        if let Some(previous) = self.entries.get(&normalized) {
            replacement.unix_mode = previous.unix_mode;
            replacement.compression = previous.compression;
        }
        self.entries.insert(normalized, replacement);
        Ok(())
    }

    pub fn remove_entry(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    /// Move an entry to a new path without touching its payload.
    pub fn rename_entry(&mut self, from: &str, to: &str) -> ArchiveResult<()> {
        let to = normalize_entry_name(to)?;
        if self.entries.contains_key(&to) {
            return Err(ArchiveError::InvalidInput(format!(
                "cannot rename {from}: {to} already exists"
            )));
        }
        let entry = self
            .entries
            .remove(from)
            .ok_or_else(|| ArchiveError::InvalidInput(format!("no entry named {from}")))?;
        self.entries.insert(to, entry);
        Ok(())
    }

    /// Write the archive next to `path` and rename it into place once complete.
    pub fn write(&mut self, path: impl AsRef<Path>) -> ArchiveResult<()> {
        let path = path.as_ref();
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;
        let temp = NamedTempFile::new_in(&parent)?;
        {
            let mut out = BufWriter::new(temp.as_file());
            self.write_to(&mut out)?;
            out.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|err| ArchiveError::Io(err.error))?;
        debug!("Wrote {} entries to {}", self.entries.len(), path.display());
        Ok(())
    }

    /// Serialize the archive: entries in path order, then the central directory.
    pub fn write_to<W: Write>(&mut self, out: &mut W) -> ArchiveResult<()> {
        if self.entries.len() > u16::MAX as usize {
            return Err(ArchiveError::InvalidInput(format!(
                "{} entries exceed the ZIP32 limit",
                self.entries.len()
            )));
        }
        let compressed = compress_modified(&self.entries)?;

        let mut offset: u64 = 0;
        let mut central_records = Vec::with_capacity(self.entries.len());
        for (name, entry) in &self.entries {
            let local_offset = checked_u32(offset, name)?;
            let record = match &entry.payload {
                Payload::Memory(data) => {
                    let (plan, bytes) = compressed
                        .get(name.as_str())
                        .ok_or_else(|| ArchiveError::InvalidInput(format!("{name} was not prepared")))?;
                    let record = CentralDirectoryRecord::new(name, entry, *plan, bytes.len() as u64, local_offset)?;
                    let extra_len = plan.alignment.map_or(0, |align| alignment_padding(offset, name.len(), align));
                    offset += write_local_header(out, &record, extra_len)?;
                    out.write_all(bytes)?;
                    offset += bytes.len() as u64;
                    trace!("{name}: {} -> {} bytes", data.len(), bytes.len());
                    record
                }
                Payload::Input(idx) => {
                    let plan = plan_input(name, entry);
                    let record = CentralDirectoryRecord::new(name, entry, plan, entry.compressed_size, local_offset)?;
                    let extra_len = plan.alignment.map_or(0, |align| alignment_padding(offset, name.len(), align));
                    offset += write_local_header(out, &record, extra_len)?;
                    let zip = self
                        .source
                        .as_mut()
                        .ok_or_else(|| ArchiveError::InvalidInput(format!("{name} has no backing file")))?;
                    let mut raw = zip.by_index_raw(*idx)?;
                    let copied = io::copy(&mut raw, out)?;
                    if copied != entry.compressed_size {
                        return Err(ArchiveError::Corrupt(format!(
                            "{name}: copied {copied} of {} raw bytes",
                            entry.compressed_size
                        )));
                    }
                    offset += copied;
                    record
                }
            };
            central_records.push(record);
        }

        let central_start = checked_u32(offset, "central directory")?;
        let mut central = Vec::new();
        for record in &central_records {
            write_central_directory_entry(&mut central, record);
        }
        let mut end = Vec::new();
        write_end_of_central_directory(&mut end, central_records.len(), central.len() as u32, central_start);
        out.write_all(&central)?;
        out.write_all(&end)?;
        Ok(())
    }
}

/// Deflate every in-memory entry across the worker pool.
fn compress_modified(entries: &BTreeMap<String, ArchiveEntry>) -> ArchiveResult<HashMap<&str, (EntryPlan, Vec<u8>)>> {
    let modified: Vec<(&str, &ArchiveEntry, &[u8])> = entries
        .iter()
        .filter_map(|(name, entry)| match &entry.payload {
            Payload::Memory(data) => Some((name.as_str(), entry, data.as_slice())),
            Payload::Input(_) => None,
        })
        .collect();
    modified
        .par_iter()
        .map(|&(name, entry, data)| -> ArchiveResult<(&str, (EntryPlan, Vec<u8>))> {
            let plan = plan_memory(name, entry);
            let bytes = match plan.compression {
                EntryCompression::Stored => data.to_vec(),
                EntryCompression::Deflated => deflate_bytes(data)?,
            };
            Ok((name, (plan, bytes)))
        })
        .collect()
}

#[derive(Clone, Copy, Debug)]
struct EntryPlan {
    compression: EntryCompression,
    alignment: Option<u64>,
}

#[derive(Clone)]
struct CentralDirectoryRecord {
    file_name: Vec<u8>,
    flags: u16,
    compression: EntryCompression,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    local_header_offset: u32,
    external_attrs: u32,
}

impl CentralDirectoryRecord {
    fn new(
        name: &str,
        entry: &ArchiveEntry,
        plan: EntryPlan,
        compressed_size: u64,
        local_header_offset: u32,
    ) -> ArchiveResult<Self> {
        Ok(CentralDirectoryRecord {
            file_name: name.as_bytes().to_vec(),
            flags: if name.is_ascii() { 0 } else { FLAG_UTF8_NAME },
            compression: plan.compression,
            crc32: entry.crc32,
            compressed_size: checked_u32(compressed_size, name)?,
            uncompressed_size: checked_u32(entry.size, name)?,
            local_header_offset,
            external_attrs: entry.unix_mode.unwrap_or(0o644) << 16,
        })
    }
}

/// Raw-copied entries keep their method; only stored ones get aligned.
fn plan_input(name: &str, entry: &ArchiveEntry) -> EntryPlan {
    let compression = entry.compression.unwrap_or(EntryCompression::Deflated);
    EntryPlan {
        compression,
        alignment: match compression {
            EntryCompression::Stored => classify_entry(name).alignment.or(Some(4)),
            EntryCompression::Deflated => None,
        },
    }
}

fn plan_memory(name: &str, entry: &ArchiveEntry) -> EntryPlan {
    let mut plan = classify_entry(name);
    if let Some(preferred) = entry.compression {
        plan.compression = preferred;
    }
    plan.alignment = match plan.compression {
        EntryCompression::Stored => plan.alignment.or(Some(4)),
        EntryCompression::Deflated => None,
    };
    plan
}

fn write_local_header<W: Write>(out: &mut W, record: &CentralDirectoryRecord, extra_len: u64) -> ArchiveResult<u64> {
    let mut header = Vec::with_capacity(LOCAL_HEADER_LEN as usize + record.file_name.len() + extra_len as usize);
    write_u32(&mut header, LOCAL_HEADER_SIGNATURE);
    write_u16(&mut header, VERSION_NEEDED);
    write_u16(&mut header, record.flags);
    write_u16(&mut header, record.compression.method());
    write_u16(&mut header, DOS_TIME);
    write_u16(&mut header, DOS_DATE);
    write_u32(&mut header, record.crc32);
    write_u32(&mut header, record.compressed_size);
    write_u32(&mut header, record.uncompressed_size);
    write_u16(&mut header, record.file_name.len() as u16);
    write_u16(&mut header, extra_len as u16);
    header.extend_from_slice(&record.file_name);
    header.resize(header.len() + extra_len as usize, 0);
    out.write_all(&header)?;
    Ok(header.len() as u64)
}

fn write_central_directory_entry(buf: &mut Vec<u8>, record: &CentralDirectoryRecord) {
    write_u32(buf, CENTRAL_HEADER_SIGNATURE);
    write_u16(buf, VERSION_MADE_BY);
    write_u16(buf, VERSION_NEEDED);
    write_u16(buf, record.flags);
    write_u16(buf, record.compression.method());
    write_u16(buf, DOS_TIME);
    write_u16(buf, DOS_DATE);
    write_u32(buf, record.crc32);
    write_u32(buf, record.compressed_size);
    write_u32(buf, record.uncompressed_size);
    write_u16(buf, record.file_name.len() as u16);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u32(buf, record.external_attrs);
    write_u32(buf, record.local_header_offset);
    buf.extend_from_slice(&record.file_name);
}

fn write_end_of_central_directory(buf: &mut Vec<u8>, entry_count: usize, central_size: u32, central_offset: u32) {
    write_u32(buf, END_OF_CENTRAL_SIGNATURE);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, entry_count as u16);
    write_u16(buf, entry_count as u16);
    write_u32(buf, central_size);
    write_u32(buf, central_offset);
    write_u16(buf, 0);
}

fn deflate_bytes(data: &[u8]) -> ArchiveResult<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn checked_u32(value: u64, what: &str) -> ArchiveResult<u32> {
    u32::try_from(value)
        .map_err(|_| ArchiveError::InvalidInput(format!("{what}: {value} exceeds the ZIP32 limit")))
}

fn path_to_entry_name(path: &Path) -> ArchiveResult<String> {
    let mut components = Vec::new();
    for comp in path.components() {
        match comp {
            Component::Normal(part) => components.push(part.to_string_lossy().replace('\\', "/")),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) | Component::ParentDir => {
                return Err(ArchiveError::InvalidInput(format!(
                    "invalid entry path component in {}",
                    path.display()
                )));
            }
        }
    }
    if components.is_empty() {
        return Err(ArchiveError::InvalidInput("entry name must not be empty".to_string()));
    }
    Ok(components.join("/"))
}

fn normalize_entry_name(name: &str) -> ArchiveResult<String> {
    path_to_entry_name(Path::new(name))
}

fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn alignment_padding(offset: u64, name_len: usize, alignment: u64) -> u64 {
    if alignment <= 1 {
        return 0;
    }
    let base = offset + LOCAL_HEADER_LEN + name_len as u64;
    (alignment - (base % alignment)) % alignment
}

fn classify_entry(name: &str) -> EntryPlan {
    let lower = name.to_ascii_lowercase();
    let compression = if should_store_uncompressed(&lower) {
        EntryCompression::Stored
    } else {
        EntryCompression::Deflated
    };
    let alignment = match compression {
        EntryCompression::Stored if lower.contains("lib/") && lower.ends_with(".so") => Some(16 * 1024),
        EntryCompression::Stored => Some(4),
        EntryCompression::Deflated => None,
    };
    EntryPlan {
        compression,
        alignment,
    }
}

fn should_store_uncompressed(name: &str) -> bool {
    name.ends_with(".arsc")
        || name.ends_with(".so")
        || matches!(
            name.rsplit('.').next(),
            Some(ext)
                if matches!(
                    ext,
                    "png" | "jpg" | "jpeg" | "gif" | "webp" | "mp3" | "ogg" | "wav" | "mp4" | "webm"
                )
        )
}
