//! Transformations over an opened [`Bundle`](crate::bundle::Bundle), run by the pipeline in this order:
//! obfuscation, file filtering, string filtering, duplicate merging.

pub mod file_filter;
pub mod merge;
pub mod obfuscate;
pub mod string_filter;
