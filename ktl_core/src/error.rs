//! Typed error taxonomy for the stack engine.
//!
//! One variant per kind named in the specification's error taxonomy. The
//! Scheduler never guesses whether a failure is retryable: it reads
//! [`Error::retryable`], which for [`Error::Exec`] and [`Error::Timeout`]
//! reflects whatever the collaborator (or the timeout policy) declared.

use crate::plan::ReleaseId;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("compile error: {0}")]
    Compile(String),

    #[error("dependency cycle detected among {nodes:?}: {detail}")]
    Cycle {
        nodes: Vec<ReleaseId>,
        detail: String,
    },

    #[error("render error for {node}: {source}")]
    Render {
        node: ReleaseId,
        retryable: bool,
        #[source]
        source: Box<Error>,
    },

    #[error("{node} {op} failed: {message}")]
    Exec {
        node: ReleaseId,
        op: &'static str,
        retryable: bool,
        message: String,
    },

    #[error("{node} timed out after {attempt} attempt(s)")]
    Timeout { node: ReleaseId, attempt: u32 },

    #[error("run cancelled")]
    Cancelled,

    #[error("stack lock held at {path:?}: {message}")]
    Lock { path: PathBuf, message: String },

    #[error("signature verification failed: {0}")]
    Signature(String),

    #[error("run store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Centralizes the transient/permanent policy so the Scheduler never invents
/// its own classification (spec §9 open question (c)): collaborators set the
/// `retryable` flag, this trait just reads it back out.
pub trait Retryable {
    fn retryable(&self) -> bool;
}

impl Retryable for Error {
    fn retryable(&self) -> bool {
        match self {
            Error::Render { retryable, .. } => *retryable,
            Error::Exec { retryable, .. } => *retryable,
            Error::Timeout { .. } => true,
            _ => false,
        }
    }
}
