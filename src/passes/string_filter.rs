use std::collections::HashSet;
use std::fs;
use std::path::Path;

use log::{debug, info, warn};
use nom::branch::alt;
use nom::bytes::complete::{escaped_transform, is_not, tag, take_till1};
use nom::character::complete::{char, digit1, space0, space1};
use nom::combinator::{eof, map, map_res, opt, value};
use nom::sequence::{delimited, preceded, terminated, tuple};
use nom::IResult;

use crate::arsc::config::Locale;
use crate::arsc::{EntryLocation, EntryValue, PackageChunk, ResourceTable};
use crate::bundle::{Bundle, LoadedTable};
use crate::error::{BundleError, BundleResult};
use crate::mapping::Mapping;

/// What a report line points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StringSelector {
    /// Global string pool slot.
    Index(u32),
    /// Exact string value.
    Value(String),
    /// Every string value of an (unobfuscated) resource.
    Resource { type_name: String, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnusedString {
    pub selector: StringSelector,
    /// Locale the analysis found it in, e.g. `en` or `zh-rCN`.
    pub locale: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnusedStringReport {
    pub items: Vec<UnusedString>,
}

impl UnusedStringReport {
    pub fn parse(text: &str) -> BundleResult<Self> {
        let mut items = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (_, item) = report_line(line).map_err(|err| {
                BundleError::ConfigurationError(format!(
                    "unused-string report line {}: cannot parse `{line}`: {err}",
                    lineno + 1
                ))
            })?;
            items.push(item);
        }
        Ok(UnusedStringReport { items })
    }

    pub fn load(path: impl AsRef<Path>) -> BundleResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let report = UnusedStringReport::parse(&text)?;
        debug!("Loaded {} unused-string items from {}", report.items.len(), path.display());
        Ok(report)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

fn locale_token(input: &str) -> IResult<&str, &str> {
    take_till1(|c: char| c.is_whitespace())(input)
}

fn index_selector(input: &str) -> IResult<&str, StringSelector> {
    map(
        map_res(preceded(char('@'), digit1), str::parse::<u32>),
        StringSelector::Index,
    )(input)
}

fn quoted_selector(input: &str) -> IResult<&str, StringSelector> {
    let body = alt((
        escaped_transform(
            is_not("\\\""),
            '\\',
            alt((
                value("\\", tag("\\")),
                value("\"", tag("\"")),
                value("\n", tag("n")),
                value("\t", tag("t")),
            )),
        ),
        map(tag(""), |_| String::new()),
    ));
    map(delimited(char('"'), body, char('"')), StringSelector::Value)(input)
}

fn resource_selector(input: &str) -> IResult<&str, StringSelector> {
    let (rest, token) = take_till1(|c: char| c.is_whitespace())(input)?;
    let qualified = token
        .rfind(".R.")
        .map(|at| &token[at + 3..])
        .or_else(|| token.strip_prefix("R."));
    let split = match qualified {
        Some(rest) => rest.split_once('.'),
        None => token.split_once('/'),
    };
    match split {
        Some((type_name, name)) if !type_name.is_empty() && !name.is_empty() && !name.contains(['/', '.']) => Ok((
            rest,
            StringSelector::Resource {
                type_name: type_name.to_string(),
                name: name.to_string(),
            },
        )),
        _ => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        ))),
    }
}

fn report_line(input: &str) -> IResult<&str, UnusedString> {
    let (input, (selector, locale)) = terminated(
        tuple((
            alt((index_selector, quoted_selector, resource_selector)),
            opt(preceded(space1, locale_token)),
        )),
        tuple((space0, eof)),
    )(input)?;
    Ok((
        input,
        UnusedString {
            selector,
            locale: locale.map(str::to_string),
        },
    ))
}

#[derive(Debug, Clone, Default)]
pub struct StringFilterOptions {
    pub locale_whitelist: Vec<String>,
    /// Also drop localized entries whose value is flagged.
    pub aggressive: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StringFilterReport {
    pub removed_strings: usize,
    pub removed_entries: usize,
}

fn locale_of(table: &ResourceTable, loc: &EntryLocation) -> Option<Locale> {
    table.type_chunk(loc).and_then(|ty| ty.config.locale())
}

fn whitelisted(locale: &Option<Locale>, whitelist: &[String]) -> bool {
    locale
        .as_ref()
        .is_some_and(|locale| whitelist.iter().any(|item| locale.matches(item)))
}

fn annotation_matches(annotation: &Option<String>, locale: &Option<Locale>) -> bool {
    match (annotation, locale) {
        (None, _) => true,
        (Some(item), Some(locale)) => locale.matches(item),
        (Some(_), None) => false,
    }
}

/// Flagged global-pool slots of one table, each with the annotation it was flagged under.
fn flagged_slots(
    loaded: &LoadedTable,
    report: &UnusedStringReport,
    renames: Option<&Mapping>,
) -> Vec<(u32, Option<String>)> {
    let table = &loaded.table;
    let mut flagged = Vec::new();
    for item in &report.items {
        match &item.selector {
            StringSelector::Index(idx) => {
                if (*idx as usize) < table.strings.len() {
                    flagged.push((*idx, item.locale.clone()));
                }
            }
            StringSelector::Value(text) => {
                for (idx, value) in table.strings.iter().enumerate() {
                    if value == text.as_str() {
                        flagged.push((idx as u32, item.locale.clone()));
                    }
                }
            }
            StringSelector::Resource { type_name, name } => {
                for loc in table.entry_locations() {
                    let (Some(ty), Some(entry)) = (table.type_chunk(&loc), table.entry(&loc)) else {
                        continue;
                    };
                    let package = &table.packages[loc.package];
                    let package_name = package.name();
                    // a type keeps its name when only keys were renamed
                    let current_type = match renames.and_then(|m| m.type_name(&package_name, type_name)) {
                        Some(renamed) if package.type_names.index_of(type_name).is_none() => renamed,
                        _ => type_name.as_str(),
                    };
                    let current_key = renames
                        .and_then(|m| m.key_name(&package_name, type_name, name))
                        .unwrap_or(name);
                    if package.type_name(ty.id) != Some(current_type) || package.key_name(entry) != Some(current_key) {
                        continue;
                    }
                    if !annotation_matches(&item.locale, &locale_of(table, &loc)) {
                        continue;
                    }
                    for value in entry.values() {
                        if let Some(idx) = value.string_index() {
                            flagged.push((idx, item.locale.clone()));
                        }
                    }
                }
            }
        }
    }
    flagged
}

/// Remove flagged strings nothing references, and in aggressive mode the localized entries holding them.
///
/// Resource selectors name original identifiers; `renames` is the mapping of the
/// renaming applied to `bundle`, or `None` when its names are the originals.
pub fn filter_strings(
    bundle: &mut Bundle,
    report: &UnusedStringReport,
    renames: Option<&Mapping>,
    options: &StringFilterOptions,
) -> BundleResult<StringFilterReport> {
    let mut result = StringFilterReport::default();
    for loaded in bundle.tables.iter_mut() {
        let flagged = flagged_slots(loaded, report, renames);
        if flagged.is_empty() {
            continue;
        }
        let table = &mut loaded.table;

        // slots that live in a whitelisted locale stay, whatever the report says
        let mut protected: HashSet<u32> = HashSet::new();
        for loc in table.entry_locations() {
            let locale = locale_of(table, &loc);
            if !whitelisted(&locale, &options.locale_whitelist) {
                continue;
            }
            if let Some(entry) = table.entry(&loc) {
                protected.extend(entry.values().iter().filter_map(|v| v.string_index()));
            }
        }

        let mut candidates: HashSet<u32> = HashSet::new();
        for (idx, annotation) in &flagged {
            if protected.contains(idx) {
                debug!("Keeping string #{idx}: used in a whitelisted locale");
                continue;
            }
            if let Some(item) = annotation {
                let annotated = Locale::parse(item);
                if whitelisted(&annotated, &options.locale_whitelist) {
                    debug!("Keeping string #{idx}: flagged under whitelisted locale {item}");
                    continue;
                }
            }
            candidates.insert(*idx);
        }

        if options.aggressive {
            result.removed_entries += remove_flagged_entries(table, &flagged, &candidates, options);
        }

        let counts = table.string_reference_counts();
        let mut keep = vec![true; table.strings.len()];
        for idx in &candidates {
            if counts.get(*idx as usize).copied() == Some(0) {
                keep[*idx as usize] = false;
            } else {
                debug!("Keeping string #{idx}: still referenced by a live value");
            }
        }
        let remap = table
            .compact_strings(&keep)
            .map_err(|dangling| BundleError::DanglingStringReference {
                entry: loaded.entry.clone(),
                detail: dangling.to_string(),
            })?;
        result.removed_strings += remap.removed();
    }
    info!(
        "String filter: removed {} strings and {} entries",
        result.removed_strings, result.removed_entries
    );
    if result.removed_entries > 0 {
        warn!("Aggressive string filtering removed {} localized values", result.removed_entries);
    }
    Ok(result)
}

fn remove_flagged_entries(
    table: &mut ResourceTable,
    flagged: &[(u32, Option<String>)],
    candidates: &HashSet<u32>,
    options: &StringFilterOptions,
) -> usize {
    let mut doomed = Vec::new();
    for loc in table.entry_locations() {
        let Some(ty) = table.type_chunk(&loc) else { continue };
        if ty.config.is_default() {
            continue;
        }
        let locale = locale_of(table, &loc);
        if locale.is_none() || whitelisted(&locale, &options.locale_whitelist) {
            continue;
        }
        let Some((index, entry)) = ty.entries.get(loc.slot) else { continue };
        let EntryValue::Simple(value) = &entry.value else { continue };
        let Some(idx) = value.string_index() else { continue };
        if !candidates.contains(&idx) {
            continue;
        }
        let selected = flagged
            .iter()
            .any(|(flag, annotation)| *flag == idx && annotation_matches(annotation, &locale));
        if selected {
            doomed.push((loc.package, loc.chunk, *index));
        }
    }
    for (package, chunk, index) in &doomed {
        if let Some(PackageChunk::Type(ty)) = table.packages[*package].chunks.get_mut(*chunk) {
            debug!("Removing flagged entry 0x{index:04x} from a localized configuration");
            ty.remove(*index);
        }
    }
    doomed.len()
}
