//! A bundle opened for transformation: the archive plus every decoded resource table.

use std::collections::BTreeMap;
use std::path::Path;

use log::{debug, info};

use crate::android::binary_xml::{is_binary_xml, scan_references};
use crate::android::zip::Archive;
use crate::arsc::{ResourceId, ResourceTable};
use crate::error::{BundleError, BundleResult};

pub const TABLE_FILE: &str = "resources.arsc";
pub const MANIFEST_FILE: &str = "AndroidManifest.xml";

/// One `resources.arsc` and the module directory it belongs to.
#[derive(Debug, Clone)]
pub struct LoadedTable {
    /// Archive entry holding the table, e.g. `base/resources.arsc`.
    pub entry: String,
    /// Directory the table's `res/...` values resolve against, e.g. `base/`.
    pub prefix: String,
    pub table: ResourceTable,
}

impl LoadedTable {
    /// Archive path of a file-backed value.
    pub fn resolve(&self, value: &str) -> String {
        format!("{}{}", self.prefix, value)
    }

    /// Every file-backed value still referenced, as (archive path, owning resource).
    pub fn file_references(&self) -> Vec<(String, ResourceId)> {
        let mut refs = Vec::new();
        for loc in self.table.entry_locations() {
            let (Some(entry), Some(id)) = (self.table.entry(&loc), self.table.resource_id(&loc)) else {
                continue;
            };
            for value in entry.values() {
                if let Some(path) = value
                    .string_index()
                    .and_then(|idx| self.table.strings.get(idx))
                    .filter(|s| is_file_reference(s))
                {
                    refs.push((self.resolve(path), id));
                }
            }
        }
        refs
    }
}

/// Whether a string value names a compiled resource file (`res/<dir>/<name>.<ext>`).
pub fn is_file_reference(value: &str) -> bool {
    value.starts_with("res/")
        && !value.contains(char::is_whitespace)
        && value.rsplit('/').next().is_some_and(|name| name.contains('.'))
}

fn is_manifest(name: &str) -> bool {
    name == MANIFEST_FILE || name.ends_with(&format!("/manifest/{MANIFEST_FILE}"))
}

pub struct Bundle {
    pub archive: Archive,
    pub tables: Vec<LoadedTable>,
}

impl Bundle {
    pub fn open(path: impl AsRef<Path>) -> BundleResult<Self> {
        let archive = Archive::open(path.as_ref())?;
        Bundle::from_archive(archive)
    }

    /// Decode every resource table and check a manifest is present.
    pub fn from_archive(mut archive: Archive) -> BundleResult<Self> {
        let table_entries: Vec<String> = archive
            .entry_names()
            .filter(|name| *name == TABLE_FILE || name.ends_with(&format!("/{TABLE_FILE}")))
            .map(str::to_string)
            .collect();
        let mut tables = Vec::with_capacity(table_entries.len());
        for entry in table_entries {
            let bytes = archive.read_entry(&entry)?;
            let table = ResourceTable::decode(&bytes).map_err(|error| BundleError::MalformedResourceTable {
                entry: entry.clone(),
                error,
            })?;
            let prefix = entry[..entry.len() - TABLE_FILE.len()].to_string();
            debug!(
                "{entry}: {} strings, {} packages",
                table.strings.len(),
                table.packages.len()
            );
            tables.push(LoadedTable { entry, prefix, table });
        }
        let bundle = Bundle { archive, tables };
        if bundle.manifest_entries().is_empty() {
            return Err(BundleError::CorruptArchive(format!("no {MANIFEST_FILE} in bundle")));
        }
        info!(
            "Loaded bundle: {} entries, {} resource tables",
            bundle.archive.len(),
            bundle.tables.len()
        );
        Ok(bundle)
    }

    pub fn manifest_entries(&self) -> Vec<String> {
        self.archive
            .entry_names()
            .filter(|name| is_manifest(name))
            .map(str::to_string)
            .collect()
    }

    /// Archive path -> first resource still pointing at it, across all tables.
    pub fn file_references(&self) -> BTreeMap<String, String> {
        let mut refs = BTreeMap::new();
        for loaded in &self.tables {
            for (path, id) in loaded.file_references() {
                refs.entry(path).or_insert_with(|| format!("{id} in {}", loaded.entry));
            }
        }
        refs
    }

    fn contains_resource(&self, id: ResourceId) -> Option<bool> {
        let mut owned = false;
        for loaded in &self.tables {
            if loaded.table.package_by_id(id.package()).is_some() {
                owned = true;
                if loaded.table.contains(id) {
                    return Some(true);
                }
            }
        }
        owned.then_some(false)
    }

    /// Re-encode every table into its archive entry.
    pub fn store_tables(&mut self) -> BundleResult<()> {
        for loaded in &self.tables {
            let bytes = loaded.table.encode().map_err(|error| BundleError::MalformedResourceTable {
                entry: loaded.entry.clone(),
                error,
            })?;
            self.archive.replace_entry(&loaded.entry, bytes)?;
        }
        Ok(())
    }

    /// Every pool index, file path and resource id must still resolve.
    pub fn check_integrity(&mut self) -> BundleResult<()> {
        for loaded in &self.tables {
            if let Some(dangling) = loaded.table.dangling_indices().into_iter().next() {
                return Err(BundleError::DanglingStringReference {
                    entry: loaded.entry.clone(),
                    detail: dangling.to_string(),
                });
            }
            if let Some((owner, id)) = loaded.table.dangling_resource_references().into_iter().next() {
                return Err(BundleError::DanglingResourceReference {
                    from: format!("{owner} in {}", loaded.entry),
                    id,
                });
            }
        }
        for (path, owner) in self.file_references() {
            if !self.archive.contains(&path) {
                return Err(BundleError::DanglingFileReference {
                    path,
                    referenced_by: owner,
                });
            }
        }

        let documents: Vec<String> = self
            .archive
            .entry_names()
            .filter(|name| {
                is_manifest(name)
                    || (name.ends_with(".xml")
                        && self
                            .tables
                            .iter()
                            .any(|t| name.starts_with(&format!("{}res/", t.prefix))))
            })
            .map(str::to_string)
            .collect();
        for name in documents {
            let bytes = self.archive.read_entry(&name)?;
            if !is_binary_xml(&bytes) {
                continue;
            }
            for reference in scan_references(&bytes)?.references {
                let id = ResourceId(reference.id);
                if self.contains_resource(id) == Some(false) {
                    return Err(BundleError::DanglingResourceReference {
                        from: format!("<{}> in {name}", reference.element),
                        id,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_reference_shape() {
        assert!(is_file_reference("res/drawable/icon.png"));
        assert!(is_file_reference("res/a.9.png"));
        assert!(!is_file_reference("res/ folder"));
        assert!(!is_file_reference("Hello"));
        assert!(!is_file_reference("res/drawable"));
    }

    #[test]
    fn manifests_at_root_and_in_modules() {
        assert!(is_manifest("AndroidManifest.xml"));
        assert!(is_manifest("base/manifest/AndroidManifest.xml"));
        assert!(!is_manifest("base/AndroidManifest.xml.bak"));
    }
}
