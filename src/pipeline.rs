use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::Deserialize;

use crate::bundle::Bundle;
use crate::error::{AtStage, BundleError, BundleResult, PipelineError};
use crate::mapping::Mapping;
use crate::passes::file_filter::{filter_files, FileFilterReport, FilterRuleSet};
use crate::passes::merge::{merge_duplicates, MergeReport};
use crate::passes::obfuscate::{obfuscate, ObfuscationMode, ObfuscationReport, ResourceWhitelist};
use crate::passes::string_filter::{filter_strings, StringFilterOptions, StringFilterReport, UnusedStringReport};
use crate::signer::{mask, strip_signatures, JarSigner, KeyStoreCredentials};

pub const DEFAULT_MAPPING_FILE: &str = "resources-mapping.txt";

/// Pipeline states, in the only order they can be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Loaded,
    Obfuscated,
    Filtered,
    StringFiltered,
    Merged,
    Signed,
    Written,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Loaded => "load",
            Stage::Obfuscated => "obfuscate",
            Stage::Filtered => "file-filter",
            Stage::StringFiltered => "string-filter",
            Stage::Merged => "merge",
            Stage::Signed => "sign",
            Stage::Written => "write",
        })
    }
}

/// Every input of a run, already resolved to plain values.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub bundle_path: PathBuf,
    pub output_path: PathBuf,
    /// Defaults to `resources-mapping.txt` next to the output bundle.
    pub mapping_output: Option<PathBuf>,

    pub obfuscate: bool,
    pub obfuscation_mode: ObfuscationMode,
    pub whitelist: Vec<String>,
    pub mapping_path: Option<PathBuf>,

    pub filter_files: bool,
    pub file_filter_rules: Vec<String>,
    pub protected_paths: Vec<String>,

    pub filter_strings: bool,
    pub unused_strings_path: Option<PathBuf>,
    pub locale_whitelist: Vec<String>,
    pub aggressive_string_filter: bool,

    pub merge_duplicates: bool,

    pub store_path: Option<PathBuf>,
    pub store_password: Option<String>,
    pub key_alias: Option<String>,
    pub key_password: Option<String>,
}

impl PipelineConfig {
    pub fn from_toml(text: &str) -> BundleResult<Self> {
        toml::from_str(text).map_err(|err| BundleError::ConfigurationError(err.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> BundleResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| {
            BundleError::ConfigurationError(format!("cannot read {}: {err}", path.display()))
        })?;
        PipelineConfig::from_toml(&text)
    }

    pub fn mapping_output(&self) -> PathBuf {
        match &self.mapping_output {
            Some(path) => path.clone(),
            None => self
                .output_path
                .parent()
                .map(|dir| dir.join(DEFAULT_MAPPING_FILE))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MAPPING_FILE)),
        }
    }

    fn validate(&self) -> BundleResult<()> {
        if self.bundle_path.as_os_str().is_empty() {
            return Err(BundleError::ConfigurationError("no input bundle given".to_string()));
        }
        if self.output_path.as_os_str().is_empty() {
            return Err(BundleError::ConfigurationError("no output path given".to_string()));
        }
        if self.bundle_path == self.output_path {
            return Err(BundleError::ConfigurationError(
                "output path must differ from the input bundle".to_string(),
            ));
        }
        Ok(())
    }

    fn echo(&self) {
        info!("-------------- resource transformation --------------");
        info!("bundle: {}", self.bundle_path.display());
        info!("output: {}", self.output_path.display());
        info!("obfuscate: {} ({})", self.obfuscate, self.obfuscation_mode);
        info!("whitelist: {:?}", self.whitelist);
        info!("mapping: {}", display_path(self.mapping_path.as_deref()));
        info!("filter files: {} {:?}", self.filter_files, self.file_filter_rules);
        info!(
            "filter strings: {} ({}), locales kept: {:?}",
            self.filter_strings,
            display_path(self.unused_strings_path.as_deref()),
            self.locale_whitelist
        );
        info!("merge duplicates: {}", self.merge_duplicates);
        info!("keystore: {}", display_path(self.store_path.as_deref()));
        info!("store password: {}", mask(self.store_password.as_deref()));
        info!("key alias: {}", mask(self.key_alias.as_deref()));
        info!("key password: {}", mask(self.key_password.as_deref()));
        info!("-----------------------------------------------------");
    }
}

fn display_path(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string()).unwrap_or_else(|| "/".to_string())
}

/// What each enabled stage did; `None` for skipped stages.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub obfuscation: Option<ObfuscationReport>,
    pub file_filter: Option<FileFilterReport>,
    pub string_filter: Option<StringFilterReport>,
    pub merge: Option<MergeReport>,
    pub signed: bool,
    pub entries: usize,
    pub output_path: PathBuf,
    pub mapping_path: Option<PathBuf>,
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({} entries, {})", self.output_path.display(), self.entries, if self.signed { "signed" } else { "unsigned" })?;
        if let Some(report) = &self.obfuscation {
            writeln!(f, "  renamed {} types, {} keys, {} paths", report.types, report.keys, report.paths)?;
        }
        if let Some(report) = &self.file_filter {
            writeln!(f, "  removed {} files", report.removed.len())?;
        }
        if let Some(report) = &self.string_filter {
            writeln!(f, "  removed {} strings, {} entries", report.removed_strings, report.removed_entries)?;
        }
        if let Some(report) = &self.merge {
            writeln!(
                f,
                "  merged {} files, {} strings, saved {} bytes",
                report.merged_files, report.merged_strings, report.bytes_saved
            )?;
        }
        if let Some(path) = &self.mapping_path {
            write!(f, "  mapping: {}", path.display())?;
        }
        Ok(())
    }
}

pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Pipeline { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every enabled stage, then write the bundle. Nothing is written unless all stages succeed.
    pub fn run(&self) -> Result<PipelineReport, PipelineError> {
        let config = &self.config;
        config.validate().at(Stage::Loaded)?;
        config.echo();

        let credentials = KeyStoreCredentials::resolve(
            config.store_path.clone(),
            config.store_password.clone(),
            config.key_alias.clone(),
            config.key_password.clone(),
        )
        .at(Stage::Signed)?;
        let signer = credentials
            .as_ref()
            .map(JarSigner::load)
            .transpose()
            .at(Stage::Signed)?;

        let mut bundle = Bundle::open(&config.bundle_path).at(Stage::Loaded)?;
        bundle.check_integrity().at(Stage::Loaded)?;
        let prior = self.prior_mapping().at(Stage::Loaded)?;
        let mut report = PipelineReport {
            output_path: config.output_path.clone(),
            ..PipelineReport::default()
        };
        info!("Stage {} done", Stage::Loaded);

        let mapping = if config.obfuscate {
            let whitelist = ResourceWhitelist::new(&config.whitelist);
            let (mapping, stats) =
                obfuscate(&mut bundle, config.obfuscation_mode, &whitelist, &prior).at(Stage::Obfuscated)?;
            bundle.check_integrity().at(Stage::Obfuscated)?;
            report.obfuscation = Some(stats);
            info!("Stage {} done", Stage::Obfuscated);
            mapping
        } else {
            info!("Stage {} skipped", Stage::Obfuscated);
            prior
        };
        // report selectors name originals, translated only through names this run applied
        let renames = config.obfuscate.then_some(&mapping);

        if config.filter_files {
            let rules = FilterRuleSet::new(&config.file_filter_rules, &config.protected_paths);
            report.file_filter = Some(filter_files(&mut bundle, &rules).at(Stage::Filtered)?);
            bundle.check_integrity().at(Stage::Filtered)?;
            info!("Stage {} done", Stage::Filtered);
        } else {
            info!("Stage {} skipped", Stage::Filtered);
        }

        match self.unused_strings().at(Stage::StringFiltered)? {
            Some(unused) => {
                let options = StringFilterOptions {
                    locale_whitelist: config.locale_whitelist.clone(),
                    aggressive: config.aggressive_string_filter,
                };
                report.string_filter =
                    Some(filter_strings(&mut bundle, &unused, renames, &options).at(Stage::StringFiltered)?);
                bundle.check_integrity().at(Stage::StringFiltered)?;
                info!("Stage {} done", Stage::StringFiltered);
            }
            None => info!("Stage {} skipped", Stage::StringFiltered),
        }

        if config.merge_duplicates {
            report.merge = Some(merge_duplicates(&mut bundle).at(Stage::Merged)?);
            bundle.check_integrity().at(Stage::Merged)?;
            info!("Stage {} done", Stage::Merged);
        } else {
            info!("Stage {} skipped", Stage::Merged);
        }

        bundle.store_tables().at(Stage::Signed)?;
        match &signer {
            Some(signer) => {
                signer.sign_archive(&mut bundle.archive).at(Stage::Signed)?;
                report.signed = true;
            }
            None => {
                let stripped = strip_signatures(&mut bundle.archive);
                warn!("No signing credentials, writing an unsigned bundle ({stripped} stale signature files removed)");
            }
        }
        info!("Stage {} done", Stage::Signed);

        report.entries = bundle.archive.len();
        self.commit(&mut bundle, &mapping, &mut report).at(Stage::Written)?;
        info!("Stage {} done", Stage::Written);
        Ok(report)
    }

    fn prior_mapping(&self) -> BundleResult<Mapping> {
        match &self.config.mapping_path {
            Some(path) if path.exists() => Mapping::load(path),
            Some(path) => {
                warn!("Prior mapping {} does not exist, minting every name afresh", path.display());
                Ok(Mapping::new())
            }
            None => Ok(Mapping::new()),
        }
    }

    /// `None` when string filtering is off or cannot run.
    fn unused_strings(&self) -> BundleResult<Option<UnusedStringReport>> {
        let config = &self.config;
        if !config.filter_strings {
            return Ok(None);
        }
        match &config.unused_strings_path {
            None => {
                let err = BundleError::ConfigurationError(
                    "string filtering is enabled but no unused-string report was given".to_string(),
                );
                warn!("{err}, skipping");
                Ok(None)
            }
            Some(path) if !path.exists() => {
                warn!("Unused-string report {} does not exist, skipping", path.display());
                Ok(None)
            }
            Some(path) => UnusedStringReport::load(path).map(Some),
        }
    }

    fn commit(&self, bundle: &mut Bundle, mapping: &Mapping, report: &mut PipelineReport) -> BundleResult<()> {
        let config = &self.config;
        bundle.archive.write(&config.output_path)?;
        if config.obfuscate {
            let mapping_path = config.mapping_output();
            if let Err(err) = mapping.write(&mapping_path) {
                if let Err(cleanup) = fs::remove_file(&config.output_path) {
                    warn!(
                        "Could not remove {} after the mapping write failed: {cleanup}",
                        config.output_path.display()
                    );
                }
                return Err(err);
            }
            info!("Wrote {} mapping records to {}", mapping.len(), mapping_path.display());
            report.mapping_path = Some(mapping_path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_reads_from_toml() {
        let config = PipelineConfig::from_toml(
            r#"
bundle_path = "app.aab"
output_path = "out/app.aab"
obfuscate = true
obfuscation_mode = "full"
whitelist = ["R.string.app_name"]
filter_files = true
file_filter_rules = ["exclude:*.txt"]
"#,
        )
        .unwrap();
        assert_eq!(config.obfuscation_mode, ObfuscationMode::Full);
        assert_eq!(config.file_filter_rules, vec!["exclude:*.txt"]);
        assert!(!config.merge_duplicates);
        assert_eq!(config.mapping_output(), PathBuf::from("out/resources-mapping.txt"));
    }

    #[test]
    fn unknown_keys_are_configuration_errors() {
        let err = PipelineConfig::from_toml("obfuscat = true").unwrap_err();
        assert!(matches!(err, BundleError::ConfigurationError(_)));
    }

    #[test]
    fn stages_are_ordered() {
        assert!(Stage::Loaded < Stage::Obfuscated);
        assert!(Stage::Merged < Stage::Signed);
        assert_eq!(Stage::StringFiltered.to_string(), "string-filter");
    }

    #[test]
    fn same_input_and_output_is_rejected() {
        let config = PipelineConfig {
            bundle_path: PathBuf::from("app.aab"),
            output_path: PathBuf::from("app.aab"),
            ..PipelineConfig::default()
        };
        let err = Pipeline::new(config).run().unwrap_err();
        assert_eq!(err.stage, Stage::Loaded);
    }
}
