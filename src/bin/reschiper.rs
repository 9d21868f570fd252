use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use reschiper::pipeline::{Pipeline, PipelineConfig};
use reschiper::passes::obfuscate::ObfuscationMode;

#[derive(Parser, Debug)]
#[command(name = "reschiper")]
#[command(about = "Obfuscate, shrink and re-sign the resources of an Android bundle")]
#[command(version)]
struct Cli {
    /// Bundle to transform
    input: Option<PathBuf>,

    /// Where to write the transformed bundle
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,

    /// TOML file with the run configuration; flags override it
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Rename resource identifiers
    #[arg(long)]
    obfuscate: bool,

    /// keys-only or full
    #[arg(long)]
    mode: Option<ObfuscationMode>,

    /// Resource exempt from renaming, e.g. R.string.app_name (repeatable)
    #[arg(long = "whitelist", value_name = "PATTERN")]
    whitelist: Vec<String>,

    /// Mapping file of an earlier run, reused for stable names
    #[arg(long)]
    mapping: Option<PathBuf>,

    /// Where to write the mapping file
    #[arg(long)]
    mapping_output: Option<PathBuf>,

    /// File filter rule, `exclude:<glob>` or `include:<glob>` (repeatable)
    #[arg(long = "filter", value_name = "RULE")]
    filter_rules: Vec<String>,

    /// Additional path glob no filter may remove (repeatable)
    #[arg(long = "protect", value_name = "GLOB")]
    protected_paths: Vec<String>,

    /// Remove strings listed in this unused-string report
    #[arg(long)]
    unused_strings: Option<PathBuf>,

    /// Locale whose strings are always kept (repeatable)
    #[arg(long = "keep-locale", value_name = "LOCALE")]
    locale_whitelist: Vec<String>,

    /// Also remove flagged localized values from the table
    #[arg(long)]
    aggressive: bool,

    /// Merge byte-identical resource files and strings
    #[arg(long)]
    merge_duplicates: bool,

    /// PEM keystore holding the signing key and certificate
    #[arg(long)]
    keystore: Option<PathBuf>,

    #[arg(long, env = "RESCHIPER_STORE_PASSWORD", hide_env_values = true)]
    store_password: Option<String>,

    #[arg(long)]
    key_alias: Option<String>,

    #[arg(long, env = "RESCHIPER_KEY_PASSWORD", hide_env_values = true)]
    key_password: Option<String>,

    /// More output (-v for debug, -vv for trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn into_config(self) -> Result<PipelineConfig, reschiper::error::BundleError> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(input) = self.input {
            config.bundle_path = input;
        }
        if let Some(output) = self.output {
            config.output_path = output;
        }
        config.obfuscate |= self.obfuscate || self.mode.is_some();
        if let Some(mode) = self.mode {
            config.obfuscation_mode = mode;
        }
        config.whitelist.extend(self.whitelist);
        config.mapping_path = self.mapping.or(config.mapping_path);
        config.mapping_output = self.mapping_output.or(config.mapping_output);
        if !self.filter_rules.is_empty() {
            config.filter_files = true;
            config.file_filter_rules.extend(self.filter_rules);
        }
        config.protected_paths.extend(self.protected_paths);
        if self.unused_strings.is_some() {
            config.filter_strings = true;
            config.unused_strings_path = self.unused_strings;
        }
        config.locale_whitelist.extend(self.locale_whitelist);
        config.aggressive_string_filter |= self.aggressive;
        config.merge_duplicates |= self.merge_duplicates;
        config.store_path = self.keystore.or(config.store_path);
        config.store_password = self.store_password.or(config.store_password);
        config.key_alias = self.key_alias.or(config.key_alias);
        config.key_password = self.key_password.or(config.key_password);
        Ok(config)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            return ExitCode::from(2);
        }
    };
    match Pipeline::new(config).run() {
        Ok(report) => {
            info!("{report}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
