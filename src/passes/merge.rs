use std::collections::HashMap;

use log::{debug, info};
use rayon::prelude::*;
use sha2::{Digest, Sha256};

use crate::android::zip::Archive;
use crate::bundle::{is_file_reference, Bundle, LoadedTable};
use crate::error::{BundleError, BundleResult};
use crate::passes::obfuscate::compound_extension;

const HASH_BATCH_BYTES: u64 = 32 << 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Archive entries dropped because an identical payload is kept elsewhere.
    pub merged_files: usize,
    /// Global pool strings folded into an identical earlier string.
    pub merged_strings: usize,
    pub bytes_saved: u64,
}

/// Fold byte-identical file payloads and identical strings onto their first occurrence.
pub fn merge_duplicates(bundle: &mut Bundle) -> BundleResult<MergeReport> {
    let mut report = MergeReport::default();
    let Bundle { archive, tables } = bundle;
    for loaded in tables.iter_mut() {
        // old string index -> canonical index
        let mut redirect: HashMap<u32, u32> = HashMap::new();
        let mut doomed_paths = Vec::new();
        merge_file_payloads(loaded, archive, &mut redirect, &mut doomed_paths, &mut report)?;
        report.merged_strings += merge_strings(loaded, &mut redirect);
        if redirect.is_empty() {
            continue;
        }

        let table = &mut loaded.table;
        table.rewrite_string_refs(|mut idx| {
            while let Some(next) = redirect.get(&idx).filter(|next| **next != idx) {
                idx = *next;
            }
            idx
        });
        let counts = table.string_reference_counts();
        let keep: Vec<bool> = (0..table.strings.len() as u32)
            .map(|idx| !redirect.contains_key(&idx) || counts[idx as usize] > 0)
            .collect();
        table
            .compact_strings(&keep)
            .map_err(|dangling| BundleError::DanglingStringReference {
                entry: loaded.entry.clone(),
                detail: dangling.to_string(),
            })?;

        for path in doomed_paths {
            debug!("Dropping duplicate payload {path}");
            archive.remove_entry(&path);
        }
    }
    info!(
        "Merged {} duplicate files and {} duplicate strings, {} bytes saved",
        report.merged_files, report.merged_strings, report.bytes_saved
    );
    Ok(report)
}

fn merge_file_payloads(
    loaded: &LoadedTable,
    archive: &mut Archive,
    redirect: &mut HashMap<u32, u32>,
    doomed_paths: &mut Vec<String>,
    report: &mut MergeReport,
) -> BundleResult<()> {
    let table = &loaded.table;
    let mut files: Vec<(u32, String)> = Vec::new();
    for loc in table.entry_locations() {
        let Some(entry) = table.entry(&loc) else { continue };
        for value in entry.values() {
            let Some(idx) = value.string_index() else { continue };
            if files.iter().any(|(seen, _)| *seen == idx) {
                continue;
            }
            if let Some(path) = table.strings.get(idx).filter(|s| is_file_reference(s)) {
                let path = loaded.resolve(path);
                if archive.contains(&path) {
                    files.push((idx, path));
                }
            }
        }
    }
    if files.len() < 2 {
        return Ok(());
    }

    let paths: Vec<&str> = files.iter().map(|(_, path)| path.as_str()).collect();
    let digests = digest_payloads(archive, &paths, HASH_BATCH_BYTES)?;

    let mut canonical: HashMap<([u8; 32], &str), (u32, &str)> = HashMap::new();
    for ((idx, path), (digest, size)) in files.iter().zip(&digests) {
        let key = (*digest, compound_extension(path));
        match canonical.get(&key) {
            None => {
                canonical.insert(key, (*idx, path.as_str()));
            }
            Some((first_idx, first_path)) => {
                debug!("{path} duplicates {first_path}");
                redirect.insert(*idx, *first_idx);
                if path.as_str() != *first_path && !doomed_paths.contains(path) {
                    doomed_paths.push(path.clone());
                    report.merged_files += 1;
                    report.bytes_saved += size;
                }
            }
        }
    }
    Ok(())
}

/// SHA-256 and size of each payload, read in order and hashed in parallel batches
/// of roughly `batch_bytes`.
fn digest_payloads(archive: &mut Archive, paths: &[&str], batch_bytes: u64) -> BundleResult<Vec<([u8; 32], u64)>> {
    let mut digests = Vec::with_capacity(paths.len());
    let mut batch: Vec<Vec<u8>> = Vec::new();
    let mut pending = 0u64;
    for (n, path) in paths.iter().enumerate() {
        let payload = archive.read_entry(path)?;
        pending += payload.len() as u64;
        batch.push(payload);
        if pending >= batch_bytes || n + 1 == paths.len() {
            digests.par_extend(
                batch
                    .par_iter()
                    .map(|bytes| -> ([u8; 32], u64) { (Sha256::digest(bytes).into(), bytes.len() as u64) }),
            );
            batch.clear();
            pending = 0;
        }
    }
    Ok(digests)
}

/// Identical unstyled strings collapse onto the first one; returns how many were redirected.
fn merge_strings(loaded: &LoadedTable, redirect: &mut HashMap<u32, u32>) -> usize {
    let strings = &loaded.table.strings;
    let mut first: HashMap<&str, u32> = HashMap::new();
    let mut merged = 0;
    for (idx, value) in strings.iter().enumerate() {
        let idx = idx as u32;
        if strings.is_styled(idx) || redirect.contains_key(&idx) {
            continue;
        }
        match first.get(value) {
            Some(canonical) => {
                redirect.insert(idx, *canonical);
                merged += 1;
            }
            None => {
                first.insert(value, idx);
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fixtures::{sample_bundle, SampleResource};

    #[test]
    fn identical_payloads_collapse_to_one_entry() {
        let mut bundle = sample_bundle(&[
            SampleResource::file("drawable", "a", "res/drawable/a.png", b"same pixels"),
            SampleResource::file("drawable", "b", "res/drawable-hdpi/b.png", b"same pixels"),
            SampleResource::file("drawable", "c", "res/drawable/c.png", b"other pixels"),
        ]);
        let report = merge_duplicates(&mut bundle).unwrap();
        assert_eq!(report.merged_files, 1);
        assert_eq!(report.bytes_saved, 11);
        assert!(!bundle.archive.contains("res/drawable-hdpi/b.png"));
        let paths: Vec<String> = bundle.tables[0]
            .file_references()
            .into_iter()
            .map(|(path, _)| path)
            .collect();
        assert_eq!(paths, vec!["res/drawable/a.png", "res/drawable/a.png", "res/drawable/c.png"]);
        bundle.check_integrity().unwrap();
    }

    #[test]
    fn batch_size_does_not_change_digests() {
        let mut bundle = sample_bundle(&[
            SampleResource::file("raw", "a", "res/raw/a.bin", b"first"),
            SampleResource::file("raw", "b", "res/raw/b.bin", b"second payload"),
            SampleResource::file("raw", "c", "res/raw/c.bin", b"first"),
        ]);
        let paths = ["res/raw/a.bin", "res/raw/b.bin", "res/raw/c.bin"];
        let one_by_one = digest_payloads(&mut bundle.archive, &paths, 1).unwrap();
        let all_at_once = digest_payloads(&mut bundle.archive, &paths, u64::MAX).unwrap();
        assert_eq!(one_by_one, all_at_once);
        assert_eq!(one_by_one[0], one_by_one[2]);
        assert_eq!(one_by_one[1].1, 14);
    }

    #[test]
    fn same_bytes_with_different_extension_are_kept_apart() {
        let mut bundle = sample_bundle(&[
            SampleResource::file("raw", "a", "res/raw/a.bin", b"payload"),
            SampleResource::file("raw", "b", "res/raw/b.dat", b"payload"),
        ]);
        let report = merge_duplicates(&mut bundle).unwrap();
        assert_eq!(report.merged_files, 0);
        assert!(bundle.archive.contains("res/raw/b.dat"));
    }

    #[test]
    fn duplicate_strings_share_one_slot() {
        let mut bundle = sample_bundle(&[
            SampleResource::string("string", "title", "Hello"),
            SampleResource::string("string", "greeting", "Hello"),
        ]);
        let before = bundle.tables[0].table.strings.len();
        let report = merge_duplicates(&mut bundle).unwrap();
        assert_eq!(report.merged_strings, 1);
        assert_eq!(bundle.tables[0].table.strings.len(), before - 1);
        bundle.check_integrity().unwrap();
    }
}
