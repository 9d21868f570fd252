use std::fmt;
use std::io;

use crate::android::binary_xml::BinaryXmlError;
use crate::android::error::ChunkError;
use crate::android::zip::ArchiveError;
use crate::arsc::ResourceId;
use crate::pipeline::Stage;

pub type BundleResult<T> = Result<T, BundleError>;

/// Every failure a transformation run can end in.
#[derive(Debug)]
pub enum BundleError {
    CorruptArchive(String),
    MalformedResourceTable { entry: String, error: ChunkError },
    DanglingFileReference { path: String, referenced_by: String },
    DanglingStringReference { entry: String, detail: String },
    DanglingResourceReference { from: String, id: ResourceId },
    NameCollision { namespace: String, name: String },
    SigningError(String),
    ConfigurationError(String),
    InvalidMapping { line: usize, message: String },
    Io(io::Error),
}

impl fmt::Display for BundleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BundleError::CorruptArchive(msg) => write!(f, "corrupt archive: {msg}"),
            BundleError::MalformedResourceTable { entry, error } => {
                write!(f, "malformed resource table {entry}: {error}")
            }
            BundleError::DanglingFileReference { path, referenced_by } => {
                write!(f, "{referenced_by} still references removed file {path}")
            }
            BundleError::DanglingStringReference { entry, detail } => {
                write!(f, "dangling string reference in {entry}: {detail}")
            }
            BundleError::DanglingResourceReference { from, id } => {
                write!(f, "{from} references {id}, which has no remaining value")
            }
            BundleError::NameCollision { namespace, name } => {
                write!(f, "obfuscated name {name} collides within {namespace}")
            }
            BundleError::SigningError(msg) => write!(f, "signing failed: {msg}"),
            BundleError::ConfigurationError(msg) => write!(f, "invalid configuration: {msg}"),
            BundleError::InvalidMapping { line, message } => {
                write!(f, "invalid mapping at line {line}: {message}")
            }
            BundleError::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for BundleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BundleError::MalformedResourceTable { error, .. } => Some(error),
            BundleError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for BundleError {
    fn from(value: io::Error) -> Self {
        BundleError::Io(value)
    }
}

impl From<ArchiveError> for BundleError {
    fn from(value: ArchiveError) -> Self {
        match value {
            ArchiveError::Io(err) => BundleError::Io(err),
            other => BundleError::CorruptArchive(other.to_string()),
        }
    }
}

impl From<BinaryXmlError> for BundleError {
    fn from(value: BinaryXmlError) -> Self {
        BundleError::CorruptArchive(value.to_string())
    }
}

/// A fatal error tagged with the pipeline stage that raised it.
#[derive(Debug)]
pub struct PipelineError {
    pub stage: Stage,
    pub error: BundleError,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stage failed: {}", self.stage, self.error)
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Tag a stage result with the stage it ran in.
pub(crate) trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, PipelineError>;
}

impl<T> AtStage<T> for BundleResult<T> {
    fn at(self, stage: Stage) -> Result<T, PipelineError> {
        self.map_err(|error| PipelineError { stage, error })
    }
}
