use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use globset::{Glob, GlobSet, GlobSetBuilder};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::android::zip::Archive;
use crate::arsc::string_pool::{StringPoolBuilder, UTF8_FLAG};
use crate::arsc::Package;
use crate::bundle::{is_file_reference, Bundle, LoadedTable};
use crate::error::{BundleError, BundleResult};
use crate::mapping::{Mapping, MappingKind};

const DEFAULT_ATTEMPT_LIMIT: usize = 1 << 20;

const FIRST_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const NEXT_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789_";

/// Names a generated resource name must never take: resource names become Java fields.
static RESERVED_NAMES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "abstract", "assert", "boolean", "break", "byte", "case", "catch", "char", "class", "const",
        "continue", "default", "do", "double", "else", "enum", "extends", "false", "final", "finally",
        "float", "for", "goto", "if", "implements", "import", "instanceof", "int", "interface", "long",
        "native", "new", "null", "package", "private", "protected", "public", "return", "short",
        "static", "strictfp", "super", "switch", "synchronized", "this", "throw", "throws",
        "transient", "true", "try", "void", "volatile", "while",
    ]
    .into_iter()
    .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObfuscationMode {
    /// Only entry (key) names change.
    #[default]
    KeysOnly,
    /// Type names, key names and file paths change.
    Full,
}

impl FromStr for ObfuscationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keys-only" | "keys" => Ok(ObfuscationMode::KeysOnly),
            "full" => Ok(ObfuscationMode::Full),
            other => Err(format!("unknown obfuscation mode `{other}` (expected keys-only or full)")),
        }
    }
}

impl fmt::Display for ObfuscationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ObfuscationMode::KeysOnly => "keys-only",
            ObfuscationMode::Full => "full",
        })
    }
}

/// The `n`-th name of the sequence `a..z, aa, ab, .., a_, ba, ..`.
pub fn short_name(mut n: u64) -> String {
    let mut len = 1u32;
    let mut block = FIRST_CHARS.len() as u64;
    while n >= block {
        n -= block;
        len += 1;
        block = block.saturating_mul(NEXT_CHARS.len() as u64);
    }
    let mut tail = Vec::with_capacity(len as usize);
    for _ in 1..len {
        tail.push(NEXT_CHARS[(n % NEXT_CHARS.len() as u64) as usize]);
        n /= NEXT_CHARS.len() as u64;
    }
    let mut name = String::with_capacity(len as usize);
    name.push(FIRST_CHARS[(n % FIRST_CHARS.len() as u64) as usize] as char);
    name.extend(tail.iter().rev().map(|c| *c as char));
    name
}

/// Mints short names in sequence order, skipping taken and reserved ones.
pub struct NameGenerator {
    next: u64,
    attempt_limit: usize,
}

impl Default for NameGenerator {
    fn default() -> Self {
        NameGenerator::new()
    }
}

impl NameGenerator {
    pub fn new() -> Self {
        NameGenerator {
            next: 0,
            attempt_limit: DEFAULT_ATTEMPT_LIMIT,
        }
    }

    pub fn with_attempt_limit(attempt_limit: usize) -> Self {
        NameGenerator { next: 0, attempt_limit }
    }

    pub fn mint(&mut self, namespace: &str, is_taken: impl Fn(&str) -> bool) -> BundleResult<String> {
        let mut attempts = 0;
        loop {
            let candidate = short_name(self.next);
            self.next += 1;
            if !RESERVED_NAMES.contains(candidate.as_str()) && !is_taken(&candidate) {
                return Ok(candidate);
            }
            attempts += 1;
            if attempts >= self.attempt_limit {
                return Err(BundleError::NameCollision {
                    namespace: namespace.to_string(),
                    name: candidate,
                });
            }
        }
    }
}

/// Resource names exempt from renaming, as `type/name` globs.
#[derive(Debug, Clone)]
pub struct ResourceWhitelist {
    set: GlobSet,
}

impl Default for ResourceWhitelist {
    fn default() -> Self {
        ResourceWhitelist { set: GlobSet::empty() }
    }
}

impl ResourceWhitelist {
    /// Accepts `type/name`, `R.type.name` and `com.example.R.type.name`; bad globs are skipped.
    pub fn new(patterns: &[String]) -> Self {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let normalized = normalize_whitelist_pattern(pattern);
            match Glob::new(&normalized) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(err) => warn!("Ignoring whitelist entry `{pattern}`: {err}"),
            }
        }
        let set = builder.build().unwrap_or_else(|err| {
            warn!("Whitelist could not be compiled, nothing is exempt: {err}");
            GlobSet::empty()
        });
        ResourceWhitelist { set }
    }

    pub fn contains(&self, type_name: &str, name: &str) -> bool {
        !self.set.is_empty() && self.set.is_match(format!("{type_name}/{name}"))
    }
}

fn normalize_whitelist_pattern(pattern: &str) -> String {
    let pattern = pattern.trim();
    let unqualified = match pattern.rfind(".R.") {
        Some(at) => &pattern[at + 3..],
        None => pattern.strip_prefix("R.").unwrap_or(pattern),
    };
    if unqualified.contains('/') {
        unqualified.to_string()
    } else {
        unqualified.replacen('.', "/", 1)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObfuscationReport {
    pub types: usize,
    pub keys: usize,
    pub paths: usize,
}

/// Rename identifiers across every table of the bundle.
///
/// Returns the prior mapping extended with every newly minted record.
pub fn obfuscate(
    bundle: &mut Bundle,
    mode: ObfuscationMode,
    whitelist: &ResourceWhitelist,
    prior: &Mapping,
) -> BundleResult<(Mapping, ObfuscationReport)> {
    let mut mapping = prior.clone();
    let mut report = ObfuscationReport::default();
    let Bundle { archive, tables } = bundle;
    for loaded in tables.iter_mut() {
        if mode == ObfuscationMode::Full {
            report.paths += rename_paths(loaded, archive, whitelist, &mut mapping)?;
        }
        for package in loaded.table.packages.iter_mut() {
            let package_name = package.name();
            let original_types: Vec<String> = package.type_names.iter().map(str::to_string).collect();
            if mode == ObfuscationMode::Full {
                report.types += rename_types(package, &package_name, &original_types, &mut mapping)?;
            }
            report.keys += rename_keys(package, &package_name, &original_types, whitelist, &mut mapping)?;
        }
    }
    info!(
        "Obfuscated ({mode}): {} types, {} keys, {} paths renamed",
        report.types, report.keys, report.paths
    );
    Ok((mapping, report))
}

fn rename_types(
    package: &mut Package,
    package_name: &str,
    originals: &[String],
    mapping: &mut Mapping,
) -> BundleResult<usize> {
    let namespace = format!("types of {package_name}");
    let taken: HashSet<&str> = originals.iter().map(String::as_str).collect();
    let mut assigned: Vec<Option<String>> = vec![None; originals.len()];
    let mut used: HashSet<String> = HashSet::new();
    for (idx, original) in originals.iter().enumerate() {
        if let Some(name) = mapping.type_name(package_name, original) {
            if !used.insert(name.to_string()) {
                return Err(BundleError::NameCollision {
                    namespace,
                    name: name.to_string(),
                });
            }
            assigned[idx] = Some(name.to_string());
        }
    }

    let mut generator = NameGenerator::new();
    let mut renamed = 0;
    for (idx, original) in originals.iter().enumerate() {
        let name = match assigned[idx].take() {
            Some(name) => name,
            None => {
                let name = generator.mint(&namespace, |c| taken.contains(c) || used.contains(c))?;
                used.insert(name.clone());
                mapping.insert(MappingKind::Type, package_name, original, &name);
                name
            }
        };
        debug!("type {package_name}:{original} -> {name}");
        package
            .type_names
            .set(idx as u32, name)
            .map_err(|error| BundleError::MalformedResourceTable {
                entry: namespace.clone(),
                error,
            })?;
        renamed += 1;
    }
    Ok(renamed)
}

fn rename_keys(
    package: &mut Package,
    package_name: &str,
    original_types: &[String],
    whitelist: &ResourceWhitelist,
    mapping: &mut Mapping,
) -> BundleResult<usize> {
    // (type id, entry index) -> key pool index, visited in id order
    let mut slots: BTreeMap<(u8, u32), u32> = BTreeMap::new();
    for ty in package.types() {
        for (index, entry) in &ty.entries {
            slots.entry((ty.id, *index)).or_insert(entry.key);
        }
    }
    let mut by_type: BTreeMap<u8, Vec<u32>> = BTreeMap::new();
    for ((type_id, _), key) in &slots {
        let keys = by_type.entry(*type_id).or_default();
        if !keys.contains(key) {
            keys.push(*key);
        }
    }

    let mut names: HashMap<(u8, u32), String> = HashMap::new();
    let mut renamed = 0;
    for (type_id, keys) in by_type {
        let type_name = package
            .type_index(type_id)
            .and_then(|idx| original_types.get(idx as usize))
            .cloned()
            .unwrap_or_else(|| format!("0x{type_id:02x}"));
        let namespace = format!("keys of {package_name}:{type_name}");
        let originals: Vec<String> = keys
            .iter()
            .map(|key| package.key_names.get(*key).unwrap_or_default().to_string())
            .collect();
        let taken: HashSet<&str> = originals.iter().map(String::as_str).collect();
        let mut used: HashSet<String> = HashSet::new();
        let mut assigned: Vec<Option<String>> = vec![None; keys.len()];

        for (slot, original) in originals.iter().enumerate() {
            let fixed = if whitelist.contains(&type_name, original) {
                Some(original.as_str())
            } else {
                mapping.key_name(package_name, &type_name, original)
            };
            if let Some(name) = fixed {
                if !used.insert(name.to_string()) {
                    return Err(BundleError::NameCollision {
                        namespace,
                        name: name.to_string(),
                    });
                }
                assigned[slot] = Some(name.to_string());
            }
        }

        let mut generator = NameGenerator::new();
        for (slot, original) in originals.iter().enumerate() {
            let name = match assigned[slot].take() {
                Some(name) => name,
                None => {
                    let name = generator.mint(&namespace, |c| taken.contains(c) || used.contains(c))?;
                    used.insert(name.clone());
                    mapping.insert(
                        MappingKind::Key,
                        package_name,
                        &format!("{type_name}/{original}"),
                        &name,
                    );
                    name
                }
            };
            if name != *original {
                renamed += 1;
                debug!("key {package_name}:{type_name}/{original} -> {name}");
            }
            names.insert((type_id, keys[slot]), name);
        }
    }

    let old_keys = package.key_names.clone();
    let mut builder = StringPoolBuilder::new(old_keys.flags & UTF8_FLAG);
    for ty in package.types_mut() {
        let type_id = ty.id;
        for (_, entry) in ty.entries.iter_mut() {
            let name = match names.get(&(type_id, entry.key)) {
                Some(name) => name.as_str(),
                None => old_keys.get(entry.key).unwrap_or_default(),
            };
            entry.key = builder.intern(name);
        }
    }
    package.key_names = builder.finish();
    Ok(renamed)
}

/// `.9.png` for `icon.9.png`, `.xml` for `main.xml`.
pub(crate) fn compound_extension(path: &str) -> &str {
    let file = path.rsplit('/').next().unwrap_or(path);
    match file.find('.') {
        Some(at) => &file[at..],
        None => "",
    }
}

fn stem(file: &str) -> &str {
    file.split('.').next().unwrap_or(file)
}

fn rename_paths(
    loaded: &mut LoadedTable,
    archive: &mut Archive,
    whitelist: &ResourceWhitelist,
    mapping: &mut Mapping,
) -> BundleResult<usize> {
    let table = &loaded.table;
    // string index -> (owning package, whitelisted)
    let mut owners: BTreeMap<u32, (String, bool)> = BTreeMap::new();
    let mut order = Vec::new();
    for loc in table.entry_locations() {
        let (Some(entry), Some(ty)) = (table.entry(&loc), table.type_chunk(&loc)) else {
            continue;
        };
        let package = &table.packages[loc.package];
        let exempt = whitelist.contains(
            package.type_name(ty.id).unwrap_or_default(),
            package.key_name(entry).unwrap_or_default(),
        );
        for value in entry.values() {
            let Some(idx) = value.string_index() else { continue };
            let Some(path) = table.strings.get(idx) else { continue };
            if !is_file_reference(path) || !archive.contains(&loaded.resolve(path)) {
                continue;
            }
            let owner = owners.entry(idx).or_insert_with(|| {
                order.push(idx);
                (package.name(), false)
            });
            owner.1 |= exempt;
        }
    }

    let res_root = format!("{}res/", loaded.prefix);
    let mut used_stems: HashSet<String> = archive
        .entry_names()
        .filter_map(|name| name.strip_prefix(&res_root))
        .filter(|rest| !rest.contains('/'))
        .map(|file| stem(file).to_string())
        .collect();
    // stems a prior run handed out stay reserved even for files not seen yet
    let packages: HashSet<String> = loaded.table.packages.iter().map(|p| p.name()).collect();
    used_stems.extend(
        mapping
            .records()
            .iter()
            .filter(|r| r.kind == MappingKind::Path && packages.contains(&r.package))
            .filter_map(|r| r.obfuscated.strip_prefix("res/"))
            .map(|file| stem(file).to_string()),
    );
    let namespace = format!("paths of {}", loaded.entry);
    let mut generator = NameGenerator::new();
    let mut moved: HashMap<String, String> = HashMap::new();
    let mut renamed = 0;

    for idx in order {
        let (package_name, exempt) = &owners[&idx];
        if *exempt {
            continue;
        }
        let Some(old) = loaded.table.strings.get(idx).map(str::to_string) else { continue };
        let new = match moved.get(&old) {
            Some(new) => new.clone(),
            None => {
                let new = match mapping.path(package_name, &old) {
                    Some(prior) => {
                        if archive.contains(&loaded.resolve(prior)) {
                            return Err(BundleError::NameCollision {
                                namespace,
                                name: prior.to_string(),
                            });
                        }
                        prior.to_string()
                    }
                    None => {
                        let short = generator.mint(&namespace, |c| used_stems.contains(c))?;
                        let new = format!("res/{short}{}", compound_extension(&old));
                        mapping.insert(MappingKind::Path, package_name, &old, &new);
                        new
                    }
                };
                used_stems.insert(stem(new.trim_start_matches("res/")).to_string());
                archive.rename_entry(&loaded.resolve(&old), &loaded.resolve(&new))?;
                debug!("path {package_name}:{old} -> {new}");
                moved.insert(old.clone(), new.clone());
                renamed += 1;
                new
            }
        };
        loaded
            .table
            .strings
            .set(idx, new)
            .map_err(|error| BundleError::MalformedResourceTable {
                entry: loaded.entry.clone(),
                error,
            })?;
    }
    Ok(renamed)
}
