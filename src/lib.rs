//! # Reschiper
//!
//! A library for obfuscating, shrinking and re-signing the resources of Android
//! application bundles.
//!
//! ```no_run
//!  use reschiper::pipeline::{Pipeline, PipelineConfig};
//!  use std::path::PathBuf;
//!
//!  let config = PipelineConfig {
//!      bundle_path: PathBuf::from("app.aab"),
//!      output_path: PathBuf::from("app-shrunk.aab"),
//!      obfuscate: true,
//!      merge_duplicates: true,
//!      ..PipelineConfig::default()
//!  };
//!  let report = Pipeline::new(config).run().unwrap();
//!  println!("{report}");
//! ```

#[macro_use]
pub mod android;
pub mod arsc;
pub mod bundle;
pub mod error;
pub mod mapping;
pub mod passes;
pub mod pipeline;
pub mod signer;

#[cfg(test)]
mod tests;

pub use crate::bundle::Bundle;
pub use crate::error::{BundleError, BundleResult, PipelineError};
pub use crate::mapping::Mapping;
pub use crate::pipeline::{Pipeline, PipelineConfig, PipelineReport, Stage};
