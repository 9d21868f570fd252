//! Persisted old -> new identifier correspondence.
//!
//! One record per line, `#` starts a comment:
//!
//! ```text
//! type com.example:drawable -> a
//! key com.example:drawable/icon -> b
//! path com.example:res/drawable/icon.png -> res/c.png
//! ```

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;

use log::{debug, warn};
use nom::branch::alt;
use nom::bytes::complete::{tag, take_till1};
use nom::character::complete::{space0, space1};
use nom::combinator::{eof, value};
use nom::sequence::{separated_pair, terminated, tuple};
use nom::IResult;
use tempfile::NamedTempFile;

use crate::error::{BundleError, BundleResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingKind {
    Type,
    Key,
    Path,
}

impl fmt::Display for MappingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MappingKind::Type => "type",
            MappingKind::Key => "key",
            MappingKind::Path => "path",
        })
    }
}

/// One `kind package:original -> obfuscated` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRecord {
    pub kind: MappingKind,
    pub package: String,
    /// Type name, `type/key`, or `res/...` path, always the pre-obfuscation form.
    pub original: String,
    pub obfuscated: String,
}

impl fmt::Display for MappingRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{} -> {}", self.kind, self.package, self.original, self.obfuscated)
    }
}

type RecordKey = (MappingKind, String, String);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mapping {
    records: Vec<MappingRecord>,
    index: HashMap<RecordKey, usize>,
}

impl Mapping {
    pub fn new() -> Self {
        Mapping::default()
    }

    pub fn parse(text: &str) -> BundleResult<Self> {
        let mut mapping = Mapping::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (_, record) = parse_record(line).map_err(|err| BundleError::InvalidMapping {
                line: lineno + 1,
                message: format!("cannot parse `{line}`: {err}"),
            })?;
            if record.kind == MappingKind::Key && !record.original.contains('/') {
                return Err(BundleError::InvalidMapping {
                    line: lineno + 1,
                    message: format!("key record `{}` is not of the form type/key", record.original),
                });
            }
            let (kind, package, original, obfuscated) =
                (record.kind, record.package, record.original, record.obfuscated);
            if !mapping.insert(kind, &package, &original, &obfuscated) {
                warn!("Mapping line {}: duplicate record for {package}:{original}, keeping the first", lineno + 1);
            }
        }
        Ok(mapping)
    }

    pub fn load(path: impl AsRef<Path>) -> BundleResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let mapping = Mapping::parse(&text)?;
        debug!("Loaded {} mapping records from {}", mapping.len(), path.display());
        Ok(mapping)
    }

    /// Write the mapping through a temporary file so a failed run never leaves half a file.
    pub fn write(&self, path: impl AsRef<Path>) -> BundleResult<()> {
        let path = path.as_ref();
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;
        let mut temp = NamedTempFile::new_in(parent)?;
        temp.write_all(self.to_text().as_bytes())?;
        temp.flush()?;
        temp.persist(path).map_err(|err| BundleError::Io(err.error))?;
        Ok(())
    }

    pub fn to_text(&self) -> String {
        let mut text = String::from("# resource mapping: original -> obfuscated\n");
        for record in &self.records {
            text.push_str(&record.to_string());
            text.push('\n');
        }
        text
    }

    /// Record a pair unless `original` is already mapped; existing records are never overwritten.
    pub fn insert(&mut self, kind: MappingKind, package: &str, original: &str, obfuscated: &str) -> bool {
        let key = (kind, package.to_string(), original.to_string());
        if self.index.contains_key(&key) {
            return false;
        }
        self.index.insert(key, self.records.len());
        self.records.push(MappingRecord {
            kind,
            package: package.to_string(),
            original: original.to_string(),
            obfuscated: obfuscated.to_string(),
        });
        true
    }

    pub fn get(&self, kind: MappingKind, package: &str, original: &str) -> Option<&str> {
        let key = (kind, package.to_string(), original.to_string());
        self.index.get(&key).map(|idx| self.records[*idx].obfuscated.as_str())
    }

    pub fn type_name(&self, package: &str, type_name: &str) -> Option<&str> {
        self.get(MappingKind::Type, package, type_name)
    }

    pub fn key_name(&self, package: &str, type_name: &str, key: &str) -> Option<&str> {
        self.get(MappingKind::Key, package, &format!("{type_name}/{key}"))
    }

    pub fn path(&self, package: &str, path: &str) -> Option<&str> {
        self.get(MappingKind::Path, package, path)
    }

    pub fn records(&self) -> &[MappingRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn token(input: &str) -> IResult<&str, &str> {
    take_till1(|c: char| c.is_whitespace())(input)
}

fn package_name(input: &str) -> IResult<&str, &str> {
    take_till1(|c: char| c == ':' || c.is_whitespace())(input)
}

fn kind(input: &str) -> IResult<&str, MappingKind> {
    alt((
        value(MappingKind::Type, tag("type")),
        value(MappingKind::Key, tag("key")),
        value(MappingKind::Path, tag("path")),
    ))(input)
}

fn parse_record(input: &str) -> IResult<&str, MappingRecord> {
    let (input, (kind, _, (package, original), _, _, _, obfuscated)) = terminated(
        tuple((
            kind,
            space1,
            separated_pair(package_name, tag(":"), token),
            space1,
            tag("->"),
            space1,
            token,
        )),
        tuple((space0, eof)),
    )(input)?;
    Ok((
        input,
        MappingRecord {
            kind,
            package: package.to_string(),
            original: original.to_string(),
            obfuscated: obfuscated.to_string(),
        },
    ))
}
