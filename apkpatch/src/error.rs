use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} not found: `{}`", .1.display())]
    NotFound(&'static str, PathBuf),
    #[error("invalid destination path `{}`", .0.display())]
    BadPath(PathBuf),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("unsupported string pool encoding: {0}")]
    UnsupportedEncoding(&'static str),
    #[error("malformed template: {0}")]
    TemplateIntegrity(String),
    #[error("missing libraries in the template for the enabled architectures: {}", .0.join(", "))]
    ArchitectureCoverage(Vec<String>),
    #[error("`{tool}` exited with status {status}")]
    Subprocess { tool: String, status: i32 },
    #[error("export cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
}

impl Error {
    pub(crate) fn template(msg: impl Into<String>) -> Self {
        Self::TemplateIntegrity(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }
}
