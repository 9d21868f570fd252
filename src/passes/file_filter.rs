use globset::{Glob, GlobMatcher, GlobSet, GlobSetBuilder};
use log::{debug, info, warn};

use crate::bundle::Bundle;
use crate::error::{BundleError, BundleResult};

/// Paths no rule may remove.
const PROTECTED_PATHS: &[&str] = &[
    "AndroidManifest.xml",
    "*/manifest/AndroidManifest.xml",
    "resources.arsc",
    "*/resources.arsc",
    "BundleConfig.pb",
    "*/resources.pb",
    "META-INF/MANIFEST.MF",
    "META-INF/*.SF",
    "META-INF/*.RSA",
    "META-INF/*.DSA",
    "META-INF/*.EC",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Include,
    Exclude,
}

#[derive(Debug, Clone)]
pub struct FilterRule {
    pub action: RuleAction,
    pub pattern: String,
    matcher: GlobMatcher,
}

impl FilterRule {
    /// `exclude:<glob>`, `include:<glob>`, or a bare glob meaning exclude.
    pub fn parse(rule: &str) -> Result<Self, globset::Error> {
        let rule = rule.trim();
        let (action, pattern) = if let Some(pattern) = rule.strip_prefix("include:") {
            (RuleAction::Include, pattern)
        } else if let Some(pattern) = rule.strip_prefix("exclude:") {
            (RuleAction::Exclude, pattern)
        } else {
            (RuleAction::Exclude, rule)
        };
        let pattern = pattern.trim().to_string();
        let matcher = Glob::new(&pattern)?.compile_matcher();
        Ok(FilterRule {
            action,
            pattern,
            matcher,
        })
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.matcher.is_match(path)
    }
}

#[derive(Debug, Clone)]
pub struct FilterRuleSet {
    rules: Vec<FilterRule>,
    protected: GlobSet,
}

impl FilterRuleSet {
    /// Unparsable rules and protected globs are logged and skipped.
    pub fn new(rules: &[String], extra_protected: &[String]) -> Self {
        let rules = rules
            .iter()
            .filter(|rule| !rule.trim().is_empty())
            .filter_map(|rule| match FilterRule::parse(rule) {
                Ok(rule) => Some(rule),
                Err(err) => {
                    warn!("Ignoring file filter rule `{rule}`: {err}");
                    None
                }
            })
            .collect();

        let mut builder = GlobSetBuilder::new();
        let fixed = PROTECTED_PATHS.iter().map(|p| p.to_string());
        for pattern in fixed.chain(extra_protected.iter().cloned()) {
            match Glob::new(&pattern) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(err) => warn!("Ignoring protected path `{pattern}`: {err}"),
            }
        }
        let protected = builder.build().unwrap_or_else(|err| {
            warn!("Extra protected paths could not be compiled: {err}");
            fixed_protected()
        });
        FilterRuleSet { rules, protected }
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    pub fn is_protected(&self, path: &str) -> bool {
        self.protected.is_match(path)
    }

    /// The deciding rule for `path`: longest pattern wins, include wins a tie.
    pub fn decide(&self, path: &str) -> Option<&FilterRule> {
        self.rules
            .iter()
            .filter(|rule| rule.is_match(path))
            .max_by_key(|rule| (rule.pattern.len(), rule.action == RuleAction::Include))
    }

    pub fn should_remove(&self, path: &str) -> bool {
        !self.is_protected(path)
            && self
                .decide(path)
                .is_some_and(|rule| rule.action == RuleAction::Exclude)
    }
}

fn fixed_protected() -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in PROTECTED_PATHS {
        if let Ok(glob) = Glob::new(pattern) {
            builder.add(glob);
        }
    }
    builder.build().unwrap_or_else(|_| GlobSet::empty())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileFilterReport {
    pub removed: Vec<String>,
}

/// Remove every unprotected entry an exclude rule selects.
///
/// Nothing is removed if a resource still references one of the candidates.
pub fn filter_files(bundle: &mut Bundle, rules: &FilterRuleSet) -> BundleResult<FileFilterReport> {
    let candidates: Vec<String> = bundle
        .archive
        .entry_names()
        .filter(|name| rules.should_remove(name))
        .map(str::to_string)
        .collect();
    if candidates.is_empty() {
        info!("File filter: nothing to remove");
        return Ok(FileFilterReport::default());
    }

    let references = bundle.file_references();
    for path in &candidates {
        if let Some(owner) = references.get(path) {
            return Err(BundleError::DanglingFileReference {
                path: path.clone(),
                referenced_by: owner.clone(),
            });
        }
    }

    for path in &candidates {
        debug!("Removing {path}");
        bundle.archive.remove_entry(path);
    }
    info!("File filter: removed {} entries", candidates.len());
    Ok(FileFilterReport { removed: candidates })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(rules: &[&str]) -> FilterRuleSet {
        let rules: Vec<String> = rules.iter().map(|r| r.to_string()).collect();
        FilterRuleSet::new(&rules, &[])
    }

    #[test]
    fn bare_rules_exclude() {
        let set = rules(&["*.txt"]);
        assert!(set.should_remove("notes.txt"));
        assert!(!set.should_remove("classes.dex"));
    }

    #[test]
    fn protected_paths_survive_any_rule() {
        let set = rules(&["exclude:**", "exclude:*.xml"]);
        assert!(!set.should_remove("AndroidManifest.xml"));
        assert!(!set.should_remove("base/manifest/AndroidManifest.xml"));
        assert!(!set.should_remove("META-INF/CERT.RSA"));
        assert!(set.should_remove("base/assets/a.xml"));
    }

    #[test]
    fn longest_rule_wins_and_include_wins_ties() {
        let set = rules(&["exclude:assets/**", "include:assets/keep/**"]);
        assert!(set.should_remove("assets/junk.bin"));
        assert!(!set.should_remove("assets/keep/font.ttf"));

        let tie = rules(&["exclude:*.txt", "include:*.txt"]);
        assert!(!tie.should_remove("notes.txt"));
    }

    #[test]
    fn invalid_rules_are_skipped() {
        let set = rules(&["exclude:a[", "*.log"]);
        assert_eq!(set.rules().len(), 1);
        assert!(set.should_remove("debug.log"));
    }

    #[test]
    fn extra_protected_globs_apply() {
        let set = FilterRuleSet::new(&["*.txt".to_string()], &["licenses/*.txt".to_string()]);
        assert!(!set.should_remove("licenses/apache.txt"));
        assert!(set.should_remove("readme.txt"));
    }
}
